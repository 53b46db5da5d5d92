//! In-memory sessions and the [`MessageStore`] that owns them.
//!
//! A [`Session`] is the ordered log of one conversation plus the archive of
//! messages a summary has replaced. Sessions are shared through a
//! [`SessionHandle`]:
//!
//! - readers call [`SessionHandle::snapshot`] or [`SessionHandle::read`] at
//!   any time and never observe a half-applied mutation;
//! - the single writer (a loop run or a compaction pass) first takes a
//!   [`SessionLease`], held for the whole run, and mutates through
//!   [`SessionLease::write`].
//!
//! The write lock is a `std::sync::RwLock` taken only for short critical
//! sections and never across `.await`. The lease is a `tokio` mutex so a
//! run can hold it while awaiting the model.
//!
//! Persistence happens only at [`MessageStore::open`] (hydration) and
//! [`MessageStore::flush`], never on the per-message hot path.

use crate::agent::persistence::{MessagePersistence, rebuild_active_view};
use crate::context::compaction::{CompactionPhase, is_plain_system};
use crate::context::prune::{self, PruneConfig, PruneOutcome};
use crate::context::tokens;
use crate::context::truncate::{TRUNCATED_MARKER_PREFIX, Truncator};
use crate::error::{LoopError, StoreError};
use crate::{Message, MessageKind, MessageRole};
use std::collections::{HashMap, HashSet};
use std::ops::Range;
use std::sync::{Arc, Mutex, RwLock};
use tokio::sync::OwnedMutexGuard;
use tracing::{debug, info};

// ── Session ────────────────────────────────────────────────────────

/// One conversation: active messages, archive, and compaction state.
#[derive(Debug, Clone)]
pub struct Session {
    id: String,
    user_id: String,
    messages: Vec<Message>,
    archive: Vec<Message>,
    last_summary_index: Option<usize>,
    current_turn: u32,
    phase: CompactionPhase,
    /// Every message id ever appended, in first-append order.
    journal: Vec<String>,
    /// Ids appended or mutated since the last flush.
    dirty: HashSet<String>,
}

impl Session {
    pub fn new(id: impl Into<String>, user_id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            user_id: user_id.into(),
            messages: Vec::new(),
            archive: Vec::new(),
            last_summary_index: None,
            current_turn: 0,
            phase: CompactionPhase::Idle,
            journal: Vec::new(),
            dirty: HashSet::new(),
        }
    }

    /// Rebuild a session from persisted messages (first-save order).
    pub fn restore(id: impl Into<String>, user_id: impl Into<String>, saved: Vec<Message>) -> Self {
        let journal = saved.iter().map(|m| m.id.clone()).collect();
        let view = rebuild_active_view(saved);
        let mut session = Self::new(id, user_id);
        session.current_turn = view
            .active
            .iter()
            .chain(&view.archive)
            .filter_map(|m| m.turn_index)
            .max()
            .unwrap_or(0);
        session.messages = view.active;
        session.archive = view.archive;
        session.journal = journal;
        session.last_summary_index = session.latest_summary_index();
        session
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn user_id(&self) -> &str {
        &self.user_id
    }

    /// Active messages, in order.
    pub fn messages(&self) -> &[Message] {
        &self.messages
    }

    /// Messages replaced by summaries, in replacement order.
    pub fn archive(&self) -> &[Message] {
        &self.archive
    }

    pub fn current_turn(&self) -> u32 {
        self.current_turn
    }

    pub fn phase(&self) -> CompactionPhase {
        self.phase
    }

    pub fn last_summary_index(&self) -> Option<usize> {
        self.last_summary_index
    }

    pub fn len(&self) -> usize {
        self.messages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.messages.is_empty()
    }

    /// Number of turns opened in the active view.
    pub fn turn_count(&self) -> usize {
        self.messages.iter().filter(|m| m.opens_turn()).count()
    }

    pub fn estimated_tokens(&self) -> u64 {
        tokens::estimate_total(&self.messages)
    }

    /// Index of the newest summary in the active view.
    pub fn latest_summary_index(&self) -> Option<usize> {
        self.messages.iter().rposition(Message::is_summary)
    }

    /// Number of messages not yet flushed to persistence.
    pub fn pending_writes(&self) -> usize {
        self.dirty.len()
    }

    /// Start a new turn and return its index (1-based).
    pub fn begin_turn(&mut self) -> u32 {
        self.current_turn += 1;
        self.current_turn
    }

    /// Append a message. Messages without a turn index join the current turn
    /// once one has started.
    ///
    /// A tool result must answer a call issued earlier in the same turn;
    /// otherwise the append is rejected and the session is unchanged.
    pub fn append(&mut self, mut message: Message) -> Result<(), StoreError> {
        if message.turn_index.is_none() && self.current_turn > 0 {
            message.turn_index = Some(self.current_turn);
        }
        if message.kind == MessageKind::ToolResult {
            let call_id = message.tool_call_id.as_deref().unwrap_or_default();
            if !self.call_issued_in_current_turn(call_id) {
                return Err(StoreError::OrphanToolResult(call_id.to_string()));
            }
        }
        self.journal.push(message.id.clone());
        self.dirty.insert(message.id.clone());
        self.messages.push(message);
        Ok(())
    }

    /// Append several messages as one unit. If any is rejected, none are
    /// kept and the session is unchanged.
    pub fn append_batch(&mut self, messages: Vec<Message>) -> Result<(), StoreError> {
        let mark = self.messages.len();
        let journal_mark = self.journal.len();
        for message in messages {
            if let Err(e) = self.append(message) {
                for id in self.journal.drain(journal_mark..) {
                    self.dirty.remove(&id);
                }
                self.messages.truncate(mark);
                return Err(e);
            }
        }
        Ok(())
    }

    fn call_issued_in_current_turn(&self, call_id: &str) -> bool {
        if call_id.is_empty() {
            return false;
        }
        for msg in self.messages.iter().rev() {
            if msg.role == MessageRole::Assistant && msg.tool_calls.iter().any(|c| c.id == call_id)
            {
                return true;
            }
            if msg.opens_turn() || msg.is_summary() {
                break;
            }
        }
        false
    }

    /// Run a tier-2 pruning pass over the active view.
    pub fn prune(&mut self, config: &PruneConfig) -> PruneOutcome {
        let (outcome, ids) = prune::prune(&mut self.messages, self.current_turn, config);
        self.mark_dirty(ids);
        outcome
    }

    /// Truncate tool results after the latest summary that are still over
    /// the truncator's ceilings. Returns (count, estimated tokens freed).
    pub fn truncate_oversized(&mut self, truncator: &Truncator) -> (usize, u64) {
        let start = self.latest_summary_index().map_or(0, |i| i + 1);
        let mut count = 0;
        let mut freed = 0;
        let mut changed = Vec::new();
        for msg in self.messages.iter_mut().skip(start) {
            if !msg.is_tool_result()
                || msg.is_compacted()
                || truncator.fits(&msg.content)
                || msg.content.contains(TRUNCATED_MARKER_PREFIX)
            {
                continue;
            }
            let call_id = msg.tool_call_id.clone().unwrap_or_default();
            let before = tokens::estimate(&msg.content);
            let result = truncator.apply(&call_id, std::mem::take(&mut msg.content));
            msg.content = result.content;
            freed += before.saturating_sub(tokens::estimate(&msg.content));
            count += 1;
            changed.push(msg.id.clone());
        }
        self.mark_dirty(changed);
        (count, freed)
    }

    pub fn mark_dirty<I, S>(&mut self, ids: I)
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.dirty.extend(ids.into_iter().map(Into::into));
    }

    pub(crate) fn set_phase(&mut self, phase: CompactionPhase) {
        self.phase = phase;
    }

    /// Replace `range` with `summary`, moving the replaced messages to the
    /// archive. Non-summary system messages in `range` stay active, right
    /// after the summary. Returns the replaced ids.
    pub fn replace_range(&mut self, range: Range<usize>, summary: Message) -> Vec<String> {
        let start = range.start;
        let tail = self.messages.split_off(range.end);
        let (kept, replaced): (Vec<Message>, Vec<Message>) = self
            .messages
            .split_off(start)
            .into_iter()
            .partition(is_plain_system);
        self.messages.push(summary.clone());
        self.messages.extend(kept);
        self.messages.extend(tail);
        let ids: Vec<String> = replaced.iter().map(|m| m.id.clone()).collect();
        self.archive.extend(replaced);
        self.journal.push(summary.id.clone());
        self.dirty.insert(summary.id);
        self.last_summary_index = Some(start);
        ids
    }

    /// Look up a message by id in the active view or the archive.
    pub fn find(&self, id: &str) -> Option<&Message> {
        self.messages
            .iter()
            .chain(&self.archive)
            .find(|m| m.id == id)
    }

    /// Take the dirty set, ordered by first append.
    fn take_dirty(&mut self) -> Vec<Message> {
        if self.dirty.is_empty() {
            return Vec::new();
        }
        let by_id: HashMap<&str, &Message> = self
            .messages
            .iter()
            .chain(&self.archive)
            .map(|m| (m.id.as_str(), m))
            .collect();
        let pending: Vec<Message> = self
            .journal
            .iter()
            .filter(|id| self.dirty.contains(id.as_str()))
            .filter_map(|id| by_id.get(id.as_str()).map(|m| (*m).clone()))
            .collect();
        self.dirty.clear();
        pending
    }
}

// ── Handle and lease ───────────────────────────────────────────────

/// Shared, cloneable reference to a [`Session`].
#[derive(Debug, Clone)]
pub struct SessionHandle {
    id: Arc<str>,
    state: Arc<RwLock<Session>>,
    lease: Arc<tokio::sync::Mutex<()>>,
}

impl SessionHandle {
    pub fn new(session: Session) -> Self {
        Self {
            id: Arc::from(session.id.as_str()),
            state: Arc::new(RwLock::new(session)),
            lease: Arc::new(tokio::sync::Mutex::new(())),
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    /// Wait for exclusive write access.
    pub async fn lease(&self) -> SessionLease {
        let guard = self.lease.clone().lock_owned().await;
        SessionLease {
            handle: self.clone(),
            _guard: guard,
        }
    }

    /// Take exclusive write access or fail with [`LoopError::SessionBusy`].
    pub fn try_lease(&self) -> Result<SessionLease, LoopError> {
        match self.lease.clone().try_lock_owned() {
            Ok(guard) => Ok(SessionLease {
                handle: self.clone(),
                _guard: guard,
            }),
            Err(_) => Err(LoopError::SessionBusy(self.id.to_string())),
        }
    }

    /// Whether a run or compaction pass currently holds the lease.
    pub fn is_busy(&self) -> bool {
        self.lease.try_lock().is_err()
    }

    /// Read-only access under the read lock.
    pub fn read<R>(&self, f: impl FnOnce(&Session) -> R) -> R {
        let session = self.state.read().unwrap_or_else(|e| e.into_inner());
        f(&session)
    }

    /// A consistent copy of the session.
    pub fn snapshot(&self) -> Session {
        self.read(Session::clone)
    }

    fn write<R>(&self, f: impl FnOnce(&mut Session) -> R) -> R {
        let mut session = self.state.write().unwrap_or_else(|e| e.into_inner());
        f(&mut session)
    }
}

/// Exclusive write access to a session. Released on drop.
#[derive(Debug)]
pub struct SessionLease {
    handle: SessionHandle,
    _guard: OwnedMutexGuard<()>,
}

impl SessionLease {
    pub fn handle(&self) -> &SessionHandle {
        &self.handle
    }

    /// Apply one mutation inside a single write-lock critical section.
    pub fn write<R>(&self, f: impl FnOnce(&mut Session) -> R) -> R {
        self.handle.write(f)
    }

    pub fn read<R>(&self, f: impl FnOnce(&Session) -> R) -> R {
        self.handle.read(f)
    }
}

// ── MessageStore ───────────────────────────────────────────────────

/// Registry of open sessions with an optional persistence backend.
pub struct MessageStore {
    sessions: Mutex<HashMap<String, SessionHandle>>,
    persistence: Option<Arc<dyn MessagePersistence>>,
}

impl std::fmt::Debug for MessageStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MessageStore")
            .field("sessions", &self.open_sessions())
            .field("persistence", &self.persistence.is_some())
            .finish()
    }
}

impl Default for MessageStore {
    fn default() -> Self {
        Self::new()
    }
}

impl MessageStore {
    /// A purely in-memory store.
    pub fn new() -> Self {
        Self {
            sessions: Mutex::new(HashMap::new()),
            persistence: None,
        }
    }

    /// Hydrate from and flush to `persistence` (builder pattern).
    pub fn with_persistence(mut self, persistence: Arc<dyn MessagePersistence>) -> Self {
        self.persistence = Some(persistence);
        self
    }

    /// Ids of the sessions currently open.
    pub fn open_sessions(&self) -> Vec<String> {
        let sessions = self.sessions.lock().unwrap_or_else(|e| e.into_inner());
        let mut ids: Vec<String> = sessions.keys().cloned().collect();
        ids.sort();
        ids
    }

    /// Return the open session, hydrating it from persistence on first use.
    pub fn open(&self, session_id: &str, user_id: &str) -> Result<SessionHandle, StoreError> {
        if let Some(handle) = self.get(session_id) {
            return Ok(handle);
        }

        let session = match &self.persistence {
            Some(backend) => {
                let saved = backend.find_by_session(session_id)?;
                if saved.is_empty() {
                    Session::new(session_id, user_id)
                } else {
                    info!(
                        "Hydrating session {session_id}: {} persisted message(s)",
                        saved.len()
                    );
                    Session::restore(session_id, user_id, saved)
                }
            }
            None => Session::new(session_id, user_id),
        };

        let mut sessions = self.sessions.lock().unwrap_or_else(|e| e.into_inner());
        // Another caller may have opened it while we were loading.
        let handle = sessions
            .entry(session_id.to_string())
            .or_insert_with(|| SessionHandle::new(session))
            .clone();
        Ok(handle)
    }

    pub fn get(&self, session_id: &str) -> Option<SessionHandle> {
        self.sessions
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .get(session_id)
            .cloned()
    }

    /// Write new and mutated messages to persistence. Returns the number of
    /// messages saved. Without a backend this only clears the dirty set.
    pub fn flush(&self, handle: &SessionHandle) -> Result<usize, StoreError> {
        let (user_id, pending) = handle.write(|s| (s.user_id.clone(), s.take_dirty()));
        if pending.is_empty() {
            return Ok(0);
        }
        let Some(backend) = &self.persistence else {
            return Ok(pending.len());
        };
        if let Err(e) = backend.save_all(handle.id(), &user_id, &pending) {
            // Keep them pending so the next flush retries.
            handle.write(|s| s.mark_dirty(pending.iter().map(|m| m.id.clone())));
            return Err(e);
        }
        debug!("Flushed {} message(s) for session {}", pending.len(), handle.id());
        Ok(pending.len())
    }

    /// Flush every open session, stopping at the first failure.
    pub fn flush_all(&self) -> Result<usize, StoreError> {
        let handles: Vec<SessionHandle> = self
            .sessions
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .values()
            .cloned()
            .collect();
        let mut total = 0;
        for handle in &handles {
            total += self.flush(handle)?;
        }
        Ok(total)
    }

    /// Close a session and delete its persisted messages. Returns whether it
    /// was open.
    pub fn teardown(&self, session_id: &str) -> Result<bool, StoreError> {
        let removed = self
            .sessions
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .remove(session_id)
            .is_some();
        if let Some(backend) = &self.persistence {
            backend.delete_session(session_id)?;
        }
        info!("Tore down session {session_id}");
        Ok(removed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ToolCall;
    use crate::agent::persistence::InMemoryPersistence;

    fn session_with_turn() -> Session {
        let mut s = Session::new("s1", "u1");
        s.append(Message::system("sys")).unwrap();
        s.begin_turn();
        s.append(Message::user("read the file")).unwrap();
        s.append(Message::assistant_tool_calls(
            "",
            vec![ToolCall::new("c1", "read_file", "{}")],
        ))
        .unwrap();
        s.append(Message::tool_result("c1", "read_file", "contents"))
            .unwrap();
        s
    }

    #[test]
    fn append_stamps_current_turn() {
        let s = session_with_turn();
        assert_eq!(s.messages()[0].turn_index, None);
        assert!(s.messages()[1..].iter().all(|m| m.turn_index == Some(1)));
        assert_eq!(s.turn_count(), 1);
    }

    #[test]
    fn orphan_tool_result_is_rejected() {
        let mut s = session_with_turn();
        let err = s
            .append(Message::tool_result("nope", "read_file", "x"))
            .unwrap_err();
        assert!(matches!(err, StoreError::OrphanToolResult(id) if id == "nope"));

        // A call from a previous turn does not count either.
        s.begin_turn();
        s.append(Message::user("again")).unwrap();
        assert!(s.append(Message::tool_result("c1", "read_file", "x")).is_err());
        assert_eq!(s.len(), 5);
    }

    #[test]
    fn rejected_batch_leaves_session_unchanged() {
        let mut s = session_with_turn();
        s.append(Message::assistant_tool_calls(
            "",
            vec![ToolCall::new("c2", "read_file", "{}")],
        ))
        .unwrap();
        let before = s.len();
        let pending = s.pending_writes();

        let err = s
            .append_batch(vec![
                Message::tool_result("c2", "read_file", "ok"),
                Message::tool_result("ghost", "read_file", "x"),
            ])
            .unwrap_err();
        assert!(matches!(err, StoreError::OrphanToolResult(id) if id == "ghost"));
        assert_eq!(s.len(), before);
        assert_eq!(s.pending_writes(), pending);
        assert!(!s.messages().iter().any(|m| m.content == "ok"));

        s.append_batch(vec![Message::tool_result("c2", "read_file", "ok")])
            .unwrap();
        assert_eq!(s.len(), before + 1);
    }

    #[test]
    fn replace_range_archives_and_sets_boundary() {
        let mut s = session_with_turn();
        let summary = Message::summary("did a read", vec![]);
        let summary_id = summary.id.clone();
        let ids = s.replace_range(1..4, summary);

        assert_eq!(ids.len(), 3);
        assert_eq!(s.len(), 2);
        assert_eq!(s.archive().len(), 3);
        assert_eq!(s.last_summary_index(), Some(1));
        assert_eq!(s.messages()[1].id, summary_id);
        assert!(s.find(&ids[0]).is_some());
    }

    #[test]
    fn take_dirty_follows_append_order() {
        let mut s = session_with_turn();
        let order: Vec<String> = s.messages().iter().map(|m| m.id.clone()).collect();
        let first = s.messages()[0].id.clone();
        s.mark_dirty([first.clone()]);
        let pending: Vec<String> = s.take_dirty().into_iter().map(|m| m.id).collect();
        assert_eq!(pending, order);
        assert_eq!(s.pending_writes(), 0);
        assert!(s.take_dirty().is_empty());
    }

    #[test]
    fn truncate_oversized_catches_up_and_marks_dirty() {
        let mut s = session_with_turn();
        s.append(Message::assistant_tool_calls(
            "",
            vec![ToolCall::new("c2", "grep", "{}")],
        ))
        .unwrap();
        s.append(Message::tool_result("c2", "grep", "line\n".repeat(50)))
            .unwrap();
        s.take_dirty();

        let (count, freed) = s.truncate_oversized(&Truncator::new(10, 10_000));
        assert_eq!(count, 1);
        assert!(freed > 0);
        assert!(s.messages()[5].content.contains("[output truncated:"));
        assert_eq!(s.pending_writes(), 1);

        // Already-truncated output is left alone.
        assert_eq!(s.truncate_oversized(&Truncator::new(10, 10_000)).0, 0);
    }

    #[test]
    fn prune_marks_blanked_results_dirty() {
        let mut s = Session::new("s1", "u1");
        for t in 1..=4 {
            s.begin_turn();
            s.append(Message::user(format!("q{t}"))).unwrap();
            let id = format!("c{t}");
            s.append(Message::assistant_tool_calls(
                "",
                vec![ToolCall::new(&id, "grep", "{}")],
            ))
            .unwrap();
            s.append(Message::tool_result(&id, "grep", "x".repeat(4_000)))
                .unwrap();
        }
        s.take_dirty();

        let outcome = s.prune(&PruneConfig::default().with_budgets(0, 0));
        assert_eq!(outcome.pruned_count, 2);
        assert_eq!(s.pending_writes(), 2);
    }

    #[tokio::test]
    async fn second_lease_is_busy_until_release() {
        let handle = SessionHandle::new(Session::new("s1", "u1"));
        let lease = handle.try_lease().unwrap();
        assert!(handle.is_busy());
        assert!(matches!(
            handle.try_lease(),
            Err(LoopError::SessionBusy(id)) if id == "s1"
        ));

        lease.write(|s| s.append(Message::user("hi"))).unwrap();
        // Readers are never blocked by the lease.
        assert_eq!(handle.snapshot().len(), 1);

        drop(lease);
        assert!(handle.try_lease().is_ok());
    }

    #[test]
    fn store_flushes_and_rehydrates() {
        let backend = Arc::new(InMemoryPersistence::new());
        let store = MessageStore::new().with_persistence(backend.clone());
        let handle = store.open("s1", "u1").unwrap();

        let lease = handle.try_lease().unwrap();
        lease.write(|s| {
            s.begin_turn();
            s.append(Message::user("hello")).unwrap();
            s.append(Message::assistant_text("hi there")).unwrap();
        });
        drop(lease);

        assert_eq!(store.flush(&handle).unwrap(), 2);
        assert_eq!(store.flush(&handle).unwrap(), 0);

        let fresh = MessageStore::new().with_persistence(backend);
        let restored = fresh.open("s1", "u1").unwrap().snapshot();
        assert_eq!(restored.len(), 2);
        assert_eq!(restored.current_turn(), 1);
        assert_eq!(restored.messages()[1].content, "hi there");
    }

    #[test]
    fn open_returns_same_handle() {
        let store = MessageStore::new();
        let a = store.open("s1", "u1").unwrap();
        let b = store.open("s1", "u1").unwrap();
        a.try_lease()
            .unwrap()
            .write(|s| s.append(Message::user("x")))
            .unwrap();
        assert_eq!(b.snapshot().len(), 1);
        assert_eq!(store.open_sessions(), vec!["s1".to_string()]);
    }

    #[test]
    fn teardown_removes_persisted_messages() {
        let backend = Arc::new(InMemoryPersistence::new());
        let store = MessageStore::new().with_persistence(backend.clone());
        let handle = store.open("s1", "u1").unwrap();
        handle
            .try_lease()
            .unwrap()
            .write(|s| s.append(Message::user("x")))
            .unwrap();
        store.flush(&handle).unwrap();

        assert!(store.teardown("s1").unwrap());
        assert!(backend.find_by_session("s1").unwrap().is_empty());
        assert!(store.get("s1").is_none());
    }
}
