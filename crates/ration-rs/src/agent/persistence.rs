//! Pluggable message persistence.
//!
//! The store touches persistence only when a session is hydrated and when
//! it is flushed. Backends upsert by message id and return a session's
//! messages in first-save order; [`rebuild_active_view`] turns that flat
//! list back into the active view plus archive.
//!
//! Two backends ship with the crate:
//!
//! | Backend | Storage |
//! |---------|---------|
//! | [`InMemoryPersistence`] | Process memory, for tests and ephemeral runs |
//! | [`JsonFilePersistence`] | One JSON file per session under a directory |

use crate::Message;
use crate::error::StoreError;
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use tracing::debug;

/// Storage backend for session messages.
pub trait MessagePersistence: Send + Sync {
    /// Insert or update one message. New ids are appended after existing ones.
    fn save(&self, session_id: &str, user_id: &str, message: &Message) -> Result<(), StoreError>;

    /// Save a batch in order. Backends with a cheaper bulk write override this.
    fn save_all(
        &self,
        session_id: &str,
        user_id: &str,
        messages: &[Message],
    ) -> Result<(), StoreError> {
        for message in messages {
            self.save(session_id, user_id, message)?;
        }
        Ok(())
    }

    /// All saved messages of a session in first-save order. Empty when the
    /// session is unknown.
    fn find_by_session(&self, session_id: &str) -> Result<Vec<Message>, StoreError>;

    /// Remove every message of a session.
    fn delete_session(&self, session_id: &str) -> Result<(), StoreError>;
}

// ── Stored form ────────────────────────────────────────────────────

/// Everything persisted for one session.
#[derive(Serialize, Deserialize, Debug, Clone, Default)]
pub struct StoredSession {
    pub user_id: String,
    /// Messages in first-save order.
    pub messages: Vec<Message>,
}

impl StoredSession {
    fn upsert(&mut self, user_id: &str, message: &Message) {
        if self.user_id.is_empty() {
            self.user_id = user_id.to_string();
        }
        match self.messages.iter_mut().find(|m| m.id == message.id) {
            Some(existing) => *existing = message.clone(),
            None => self.messages.push(message.clone()),
        }
    }
}

// ── In-memory backend ──────────────────────────────────────────────

#[derive(Debug, Default)]
pub struct InMemoryPersistence {
    sessions: Mutex<HashMap<String, StoredSession>>,
}

impl InMemoryPersistence {
    pub fn new() -> Self {
        Self::default()
    }
}

impl MessagePersistence for InMemoryPersistence {
    fn save(&self, session_id: &str, user_id: &str, message: &Message) -> Result<(), StoreError> {
        self.sessions
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .entry(session_id.to_string())
            .or_default()
            .upsert(user_id, message);
        Ok(())
    }

    fn find_by_session(&self, session_id: &str) -> Result<Vec<Message>, StoreError> {
        Ok(self
            .sessions
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .get(session_id)
            .map(|s| s.messages.clone())
            .unwrap_or_default())
    }

    fn delete_session(&self, session_id: &str) -> Result<(), StoreError> {
        self.sessions
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .remove(session_id);
        Ok(())
    }
}

// ── JSON file backend ──────────────────────────────────────────────

/// One `{session_id}.json` file per session.
///
/// ```text
/// dir/
///   session-1.json
///   session-2.json
/// ```
///
/// Writes go to a temp file that is then renamed into place, so a crash
/// never leaves a half-written session behind.
#[derive(Debug)]
pub struct JsonFilePersistence {
    dir: PathBuf,
    // Serializes read-modify-write cycles within this process.
    write_lock: Mutex<()>,
}

impl JsonFilePersistence {
    /// Create the backend, ensuring the directory exists.
    pub fn new(dir: impl Into<PathBuf>) -> Result<Self, StoreError> {
        let dir = dir.into();
        std::fs::create_dir_all(&dir)?;
        Ok(Self {
            dir,
            write_lock: Mutex::new(()),
        })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn path_for(&self, session_id: &str) -> PathBuf {
        let safe: String = session_id
            .chars()
            .map(|c| {
                if c.is_ascii_alphanumeric() || c == '-' || c == '_' || c == '.' {
                    c
                } else {
                    '_'
                }
            })
            .collect();
        self.dir.join(format!("{safe}.json"))
    }

    /// Load a session file. `None` if it does not exist.
    pub fn load(&self, session_id: &str) -> Result<Option<StoredSession>, StoreError> {
        let path = self.path_for(session_id);
        if !path.exists() {
            return Ok(None);
        }
        let json = std::fs::read_to_string(&path)?;
        Ok(Some(serde_json::from_str(&json)?))
    }

    fn store(&self, session_id: &str, stored: &StoredSession) -> Result<(), StoreError> {
        let final_path = self.path_for(session_id);
        let tmp_path = final_path.with_extension("json.tmp");
        let json = serde_json::to_string_pretty(stored)?;
        std::fs::write(&tmp_path, json)?;
        std::fs::rename(&tmp_path, &final_path)?;
        Ok(())
    }
}

impl MessagePersistence for JsonFilePersistence {
    fn save(&self, session_id: &str, user_id: &str, message: &Message) -> Result<(), StoreError> {
        self.save_all(session_id, user_id, std::slice::from_ref(message))
    }

    fn save_all(
        &self,
        session_id: &str,
        user_id: &str,
        messages: &[Message],
    ) -> Result<(), StoreError> {
        let _guard = self.write_lock.lock().unwrap_or_else(|e| e.into_inner());
        let mut stored = self.load(session_id)?.unwrap_or_default();
        for message in messages {
            stored.upsert(user_id, message);
        }
        self.store(session_id, &stored)?;
        debug!(
            "Saved {} message(s) to {}",
            messages.len(),
            self.path_for(session_id).display()
        );
        Ok(())
    }

    fn find_by_session(&self, session_id: &str) -> Result<Vec<Message>, StoreError> {
        Ok(self
            .load(session_id)?
            .map(|s| s.messages)
            .unwrap_or_default())
    }

    fn delete_session(&self, session_id: &str) -> Result<(), StoreError> {
        let path = self.path_for(session_id);
        if path.exists() {
            std::fs::remove_file(path)?;
        }
        Ok(())
    }
}

// ── Rehydration ────────────────────────────────────────────────────

/// A session's messages split into what the model sees and what summaries
/// replaced.
#[derive(Debug, Clone, Default)]
pub struct ActiveView {
    pub active: Vec<Message>,
    pub archive: Vec<Message>,
}

/// Rebuild the active view from messages in first-save order.
///
/// Messages listed in any summary's `summarized_ids` go to the archive. Each
/// surviving summary takes the position of the first message it covers,
/// following chains of summaries that replaced earlier summaries.
pub fn rebuild_active_view(saved: Vec<Message>) -> ActiveView {
    let covered: HashSet<&str> = saved
        .iter()
        .flat_map(|m| m.summarized_ids.iter().map(String::as_str))
        .collect();
    let position: HashMap<&str, usize> = saved
        .iter()
        .enumerate()
        .map(|(i, m)| (m.id.as_str(), i))
        .collect();

    let sort_key = |index: usize| -> usize {
        let mut current = index;
        // Bounded walk; a malformed cycle falls back to save order.
        for _ in 0..saved.len() {
            let msg = &saved[current];
            let Some(next) = msg
                .summarized_ids
                .first()
                .and_then(|id| position.get(id.as_str()))
            else {
                return current;
            };
            if *next == current {
                return current;
            }
            current = *next;
        }
        index
    };

    let mut keyed: Vec<(usize, usize)> = Vec::new();
    let mut archived = Vec::new();
    for (i, msg) in saved.iter().enumerate() {
        if covered.contains(msg.id.as_str()) {
            archived.push(i);
        } else {
            keyed.push((sort_key(i), i));
        }
    }
    keyed.sort();

    let mut slots: Vec<Option<Message>> = saved.into_iter().map(Some).collect();
    let active = keyed
        .into_iter()
        .filter_map(|(_, i)| slots[i].take())
        .collect();
    let archive = archived
        .into_iter()
        .filter_map(|i| slots[i].take())
        .collect();
    ActiveView { active, archive }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn contents(messages: &[Message]) -> Vec<&str> {
        messages.iter().map(|m| m.content.as_str()).collect()
    }

    #[test]
    fn upsert_updates_in_place() {
        let backend = InMemoryPersistence::new();
        let mut msg = Message::tool_result("c1", "grep", "big output");
        backend.save("s1", "u1", &Message::user("q")).unwrap();
        backend.save("s1", "u1", &msg).unwrap();
        msg.content = "[Old tool result content cleared]".into();
        backend.save("s1", "u1", &msg).unwrap();

        let saved = backend.find_by_session("s1").unwrap();
        assert_eq!(saved.len(), 2);
        assert_eq!(saved[1].content, "[Old tool result content cleared]");
        assert!(backend.find_by_session("other").unwrap().is_empty());
    }

    #[test]
    fn json_backend_round_trips_atomically() {
        let dir = tempfile::tempdir().unwrap();
        let backend = JsonFilePersistence::new(dir.path()).unwrap();
        let batch = vec![Message::user("a"), Message::assistant_text("b")];
        backend.save_all("s/1", "u1", &batch).unwrap();

        let stored = backend.load("s/1").unwrap().unwrap();
        assert_eq!(stored.user_id, "u1");
        assert_eq!(contents(&stored.messages), vec!["a", "b"]);
        assert!(dir.path().join("s_1.json").exists());
        assert!(!dir.path().join("s_1.json.tmp").exists());

        backend.delete_session("s/1").unwrap();
        assert!(backend.find_by_session("s/1").unwrap().is_empty());
    }

    #[test]
    fn rebuild_places_summary_at_first_covered_message() {
        let sys = Message::system("sys");
        let m1 = Message::user("m1");
        let m2 = Message::assistant_text("m2");
        let m3 = Message::user("m3");
        let summary = Message::summary("S1", vec![m1.id.clone(), m2.id.clone()]);
        let m4 = Message::assistant_text("m4");

        let view = rebuild_active_view(vec![sys, m1, m2, m3, summary, m4]);
        assert_eq!(contents(&view.active), vec!["sys", "S1", "m3", "m4"]);
        assert_eq!(contents(&view.archive), vec!["m1", "m2"]);
    }

    #[test]
    fn rebuild_follows_summary_chains() {
        let m1 = Message::user("m1");
        let m2 = Message::user("m2");
        let s1 = Message::summary("S1", vec![m1.id.clone()]);
        let m3 = Message::user("m3");
        let s2 = Message::summary("S2", vec![s1.id.clone(), m2.id.clone()]);

        let view = rebuild_active_view(vec![m1, m2, s1, m3, s2]);
        assert_eq!(contents(&view.active), vec!["S2", "m3"]);
        assert_eq!(contents(&view.archive), vec!["m1", "m2", "S1"]);
    }
}
