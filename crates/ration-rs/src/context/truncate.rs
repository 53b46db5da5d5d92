//! Tier 1: bound tool output as it enters the transcript.
//!
//! Output over either ceiling (lines or bytes) is replaced by its head, cut
//! on a line or char boundary, followed by a visible marker that names an
//! opaque handle to the full payload. The payload itself goes to a
//! [`SpillStore`]. Truncation is synchronous and deterministic for a given
//! store.

use crate::error::StoreError;
use std::collections::HashMap;
use std::io::Write;
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use tracing::{debug, warn};

/// Default line ceiling for a single tool output.
pub const DEFAULT_MAX_LINES: usize = 2000;
/// Default byte ceiling for a single tool output.
pub const DEFAULT_MAX_BYTES: usize = 50 * 1024;

/// Prefix of the marker appended to truncated output.
pub const TRUNCATED_MARKER_PREFIX: &str = "[output truncated:";

// ── Spill stores ───────────────────────────────────────────────────

/// Out-of-band storage for full tool payloads.
pub trait SpillStore: Send + Sync {
    /// Store a payload and return an opaque handle to it. Every call yields
    /// a fresh handle, even for a repeated `tool_call_id`; existing payloads
    /// are never overwritten.
    fn put(&self, tool_call_id: &str, payload: &str) -> Result<String, StoreError>;

    /// Fetch a payload by handle.
    fn get(&self, handle: &str) -> Result<Option<String>, StoreError>;
}

/// Spill store that keeps payloads in memory for the life of the process.
#[derive(Debug, Default)]
pub struct MemorySpillStore {
    entries: Mutex<HashMap<String, String>>,
    next: AtomicU64,
}

impl MemorySpillStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.entries.lock().unwrap_or_else(|e| e.into_inner()).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl SpillStore for MemorySpillStore {
    fn put(&self, tool_call_id: &str, payload: &str) -> Result<String, StoreError> {
        let mut entries = self.entries.lock().unwrap_or_else(|e| e.into_inner());
        loop {
            let seq = self.next.fetch_add(1, Ordering::Relaxed);
            let handle = format!("spill:{tool_call_id}:{seq}");
            if let std::collections::hash_map::Entry::Vacant(slot) = entries.entry(handle.clone())
            {
                slot.insert(payload.to_string());
                return Ok(handle);
            }
        }
    }

    fn get(&self, handle: &str) -> Result<Option<String>, StoreError> {
        Ok(self
            .entries
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .get(handle)
            .cloned())
    }
}

/// Spill store that writes one file per payload under a directory.
#[derive(Debug, Clone)]
pub struct DirSpillStore {
    dir: PathBuf,
    next: Arc<AtomicU64>,
}

impl DirSpillStore {
    /// Create the store, ensuring the directory exists.
    pub fn new(dir: impl Into<PathBuf>) -> Result<Self, StoreError> {
        let dir = dir.into();
        std::fs::create_dir_all(&dir)?;
        Ok(Self {
            dir,
            next: Arc::new(AtomicU64::new(0)),
        })
    }

    fn file_name(tool_call_id: &str, seq: u64) -> String {
        let safe: String = tool_call_id
            .chars()
            .map(|c| {
                if c.is_ascii_alphanumeric() || c == '-' || c == '_' {
                    c
                } else {
                    '_'
                }
            })
            .collect();
        format!("{safe}-{seq}.txt")
    }
}

impl SpillStore for DirSpillStore {
    fn put(&self, tool_call_id: &str, payload: &str) -> Result<String, StoreError> {
        // Sanitized ids can collide, and the sequence restarts with the
        // process, so claim the file exclusively and move on when taken.
        loop {
            let seq = self.next.fetch_add(1, Ordering::Relaxed);
            let path = self.dir.join(Self::file_name(tool_call_id, seq));
            match std::fs::OpenOptions::new()
                .write(true)
                .create_new(true)
                .open(&path)
            {
                Ok(mut file) => {
                    file.write_all(payload.as_bytes())?;
                    return Ok(path.display().to_string());
                }
                Err(e) if e.kind() == std::io::ErrorKind::AlreadyExists => continue,
                Err(e) => return Err(e.into()),
            }
        }
    }

    fn get(&self, handle: &str) -> Result<Option<String>, StoreError> {
        let path = PathBuf::from(handle);
        // Handles outside the store's directory are not ours.
        if path.parent() != Some(self.dir.as_path()) || !path.exists() {
            return Ok(None);
        }
        Ok(Some(std::fs::read_to_string(path)?))
    }
}

// ── Truncator ──────────────────────────────────────────────────────

/// Result of passing one tool output through the [`Truncator`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Truncation {
    /// Content to record in the transcript.
    pub content: String,
    pub truncated: bool,
    /// Handle to the full payload, when it was spilled successfully.
    pub spill_handle: Option<String>,
    pub original_bytes: usize,
    pub original_lines: usize,
}

/// Applies the line and byte ceilings to tool output.
#[derive(Clone)]
pub struct Truncator {
    max_lines: usize,
    max_bytes: usize,
    spill: Option<Arc<dyn SpillStore>>,
}

impl std::fmt::Debug for Truncator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Truncator")
            .field("max_lines", &self.max_lines)
            .field("max_bytes", &self.max_bytes)
            .field("spill", &self.spill.is_some())
            .finish()
    }
}

impl Default for Truncator {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_LINES, DEFAULT_MAX_BYTES)
    }
}

impl Truncator {
    pub fn new(max_lines: usize, max_bytes: usize) -> Self {
        Self {
            max_lines: max_lines.max(1),
            max_bytes: max_bytes.max(1),
            spill: None,
        }
    }

    /// Store full payloads of truncated output in `store`.
    pub fn with_spill_store(mut self, store: Arc<dyn SpillStore>) -> Self {
        self.spill = Some(store);
        self
    }

    /// Whether `output` is within both ceilings.
    pub fn fits(&self, output: &str) -> bool {
        output.len() <= self.max_bytes && output.lines().count() <= self.max_lines
    }

    /// Truncate `output` if it exceeds a ceiling.
    pub fn apply(&self, tool_call_id: &str, output: String) -> Truncation {
        let original_bytes = output.len();
        let original_lines = output.lines().count();
        if original_bytes <= self.max_bytes && original_lines <= self.max_lines {
            return Truncation {
                content: output,
                truncated: false,
                spill_handle: None,
                original_bytes,
                original_lines,
            };
        }

        let preview = self.preview(&output);
        let shown_lines = preview.lines().count();

        let (spill_handle, location) = match &self.spill {
            Some(store) => match store.put(tool_call_id, &output) {
                Ok(handle) => {
                    let note = format!("full output saved as {handle}");
                    (Some(handle), note)
                }
                Err(e) => {
                    warn!("Failed to spill output of tool call {tool_call_id}: {e}");
                    (None, format!("full output could not be saved: {e}"))
                }
            },
            None => (None, "full output was not retained".to_string()),
        };

        debug!(
            "Truncated tool call {tool_call_id}: {original_bytes} bytes / {original_lines} lines -> {} bytes",
            preview.len()
        );

        let content = format!(
            "{preview}\n\n{TRUNCATED_MARKER_PREFIX} showing {shown_lines} of {original_lines} lines, \
             {} of {original_bytes} bytes; {location}]",
            preview.len(),
        );

        Truncation {
            content,
            truncated: true,
            spill_handle,
            original_bytes,
            original_lines,
        }
    }

    /// Longest head of `output` within both ceilings. Whole lines are kept
    /// where possible; a single over-long first line is cut on a char
    /// boundary.
    fn preview<'a>(&self, output: &'a str) -> &'a str {
        let mut end = 0;
        for (lines, line) in output.split_inclusive('\n').enumerate() {
            if lines >= self.max_lines || end + line.len() > self.max_bytes {
                break;
            }
            end += line.len();
        }
        if end == 0 {
            end = floor_char_boundary(output, self.max_bytes);
        }
        output.get(..end).unwrap_or_default().trim_end_matches('\n')
    }
}

fn floor_char_boundary(s: &str, index: usize) -> usize {
    if index >= s.len() {
        return s.len();
    }
    let mut i = index;
    while !s.is_char_boundary(i) {
        i -= 1;
    }
    i
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn small_output_unchanged() {
        let t = Truncator::default();
        let out = t.apply("c1", "hello\nworld".into());
        assert!(!out.truncated);
        assert_eq!(out.content, "hello\nworld");
        assert_eq!(out.original_lines, 2);
    }

    #[test]
    fn line_ceiling_keeps_head_lines() {
        let store = Arc::new(MemorySpillStore::new());
        let t = Truncator::new(3, 1024).with_spill_store(store.clone());
        let output: String = (0..10).map(|i| format!("line {i}\n")).collect();
        let out = t.apply("c1", output.clone());

        assert!(out.truncated);
        assert!(out.content.starts_with("line 0\nline 1\nline 2\n\n"));
        assert!(!out.content.contains("line 3"));
        assert!(out.content.contains(TRUNCATED_MARKER_PREFIX));
        assert!(out.content.contains("showing 3 of 10 lines"));

        let handle = out.spill_handle.unwrap();
        assert!(out.content.contains(&handle));
        assert_eq!(store.get(&handle).unwrap().as_deref(), Some(output.as_str()));
    }

    #[test]
    fn byte_ceiling_cuts_on_char_boundary() {
        let t = Truncator::new(100, 10);
        let output = "ééééééééééééééé".to_string(); // 30 bytes, one line
        let out = t.apply("c2", output);
        assert!(out.truncated);
        let preview = out.content.split("\n\n").next().unwrap();
        assert!(preview.len() <= 10);
        assert_eq!(preview, "ééééé");
        assert!(out.spill_handle.is_none());
        assert!(out.content.contains("not retained"));
    }

    #[test]
    fn preview_respects_both_ceilings() {
        let t = Truncator::new(2000, 100);
        let output = "0123456789\n".repeat(50);
        let out = t.apply("c3", output);
        let preview = out.content.split("\n\n").next().unwrap();
        assert!(preview.len() <= 100);
        assert_eq!(preview.lines().count(), 9);
    }

    #[test]
    fn failed_spill_still_truncates() {
        struct BrokenStore;
        impl SpillStore for BrokenStore {
            fn put(&self, _: &str, _: &str) -> Result<String, StoreError> {
                Err(StoreError::Backend("disk full".into()))
            }
            fn get(&self, _: &str) -> Result<Option<String>, StoreError> {
                Ok(None)
            }
        }

        let t = Truncator::new(1, 1024).with_spill_store(Arc::new(BrokenStore));
        let out = t.apply("c4", "a\nb\nc".into());
        assert!(out.truncated);
        assert!(out.spill_handle.is_none());
        assert!(out.content.contains("could not be saved: disk full"));
    }

    #[test]
    fn dir_store_round_trips_payload() {
        let dir = tempfile::tempdir().unwrap();
        let store = DirSpillStore::new(dir.path().join("spill")).unwrap();
        let handle = store.put("call/../1", "payload").unwrap();
        assert!(handle.ends_with("call____1-0.txt"));
        assert_eq!(store.get(&handle).unwrap().as_deref(), Some("payload"));
        assert_eq!(store.get("/etc/passwd").unwrap(), None);
    }

    #[test]
    fn reused_call_id_keeps_earlier_payload() {
        let store = Arc::new(MemorySpillStore::new());
        let t = Truncator::new(1, 1024).with_spill_store(store.clone());
        let first = t.apply("call_0", "turn1 a\nturn1 b\n".into());
        let second = t.apply("call_0", "turn2 a\nturn2 b\n".into());

        let first_handle = first.spill_handle.unwrap();
        let second_handle = second.spill_handle.unwrap();
        assert_ne!(first_handle, second_handle);
        assert_eq!(
            store.get(&first_handle).unwrap().as_deref(),
            Some("turn1 a\nturn1 b\n")
        );
        assert_eq!(
            store.get(&second_handle).unwrap().as_deref(),
            Some("turn2 a\nturn2 b\n")
        );
        assert_eq!(store.len(), 2);
    }

    #[test]
    fn dir_store_never_overwrites_colliding_names() {
        let dir = tempfile::tempdir().unwrap();
        let spill = dir.path().join("spill");
        let store = DirSpillStore::new(&spill).unwrap();
        let dotted = store.put("a.b", "dotted").unwrap();
        let underscored = store.put("a_b", "underscored").unwrap();
        assert_ne!(dotted, underscored);

        // A fresh store over the same directory restarts its sequence.
        let reopened = DirSpillStore::new(&spill).unwrap();
        let again = reopened.put("a_b", "third").unwrap();
        assert_ne!(again, dotted);
        assert_ne!(again, underscored);

        assert_eq!(store.get(&dotted).unwrap().as_deref(), Some("dotted"));
        assert_eq!(store.get(&underscored).unwrap().as_deref(), Some("underscored"));
        assert_eq!(reopened.get(&again).unwrap().as_deref(), Some("third"));
    }
}
