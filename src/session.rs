//! Short-term session history
//!
//! One JSONL file per `(channel, chat)` under `sessions/`, capped at 50
//! entries with the oldest pruned. This is the conversational memory
//! handed to the responder, distinct from the long-term memory store.

use std::path::PathBuf;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::Result;

/// Maximum entries kept per session file
pub const MAX_ENTRIES: usize = 50;

/// One session turn
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionEntry {
    /// "user" or "assistant"
    pub role: String,
    /// Turn text
    pub content: String,
    /// When the turn happened
    pub timestamp: DateTime<Utc>,
}

/// JSONL-backed session store
#[derive(Debug, Clone)]
pub struct SessionStore {
    dir: PathBuf,
}

impl SessionStore {
    /// Create a store rooted at the given directory
    #[must_use]
    pub fn new(dir: PathBuf) -> Self {
        Self { dir }
    }

    fn path(&self, channel: &str, chat_id: &str) -> PathBuf {
        // Chat ids can contain path-hostile characters (JIDs, UUIDs).
        let safe_chat: String = chat_id
            .chars()
            .map(|c| if c.is_alphanumeric() || c == '-' || c == '.' { c } else { '_' })
            .collect();
        self.dir.join(format!("{channel}_{safe_chat}.jsonl"))
    }

    /// Append a user/assistant turn pair, pruning beyond the cap
    ///
    /// # Errors
    ///
    /// Returns error on filesystem failure
    pub fn append_turn(
        &self,
        channel: &str,
        chat_id: &str,
        user_content: &str,
        assistant_content: &str,
    ) -> Result<()> {
        let now = Utc::now();
        let mut entries = self.read(channel, chat_id)?;
        entries.push(SessionEntry {
            role: "user".to_string(),
            content: user_content.to_string(),
            timestamp: now,
        });
        entries.push(SessionEntry {
            role: "assistant".to_string(),
            content: assistant_content.to_string(),
            timestamp: now,
        });
        if entries.len() > MAX_ENTRIES {
            let excess = entries.len() - MAX_ENTRIES;
            entries.drain(0..excess);
        }
        self.write(channel, chat_id, &entries)
    }

    /// Read all entries of a session (empty when none)
    ///
    /// # Errors
    ///
    /// Returns error on filesystem failure
    pub fn read(&self, channel: &str, chat_id: &str) -> Result<Vec<SessionEntry>> {
        let path = self.path(channel, chat_id);
        if !path.exists() {
            return Ok(Vec::new());
        }
        let raw = std::fs::read_to_string(&path)?;
        Ok(raw
            .lines()
            .filter(|l| !l.trim().is_empty())
            .filter_map(|l| serde_json::from_str(l).ok())
            .collect())
    }

    /// Drop a session's history entirely
    ///
    /// # Errors
    ///
    /// Returns error on filesystem failure
    pub fn clear(&self, channel: &str, chat_id: &str) -> Result<()> {
        let path = self.path(channel, chat_id);
        if path.exists() {
            std::fs::remove_file(&path)?;
        }
        Ok(())
    }

    fn write(&self, channel: &str, chat_id: &str, entries: &[SessionEntry]) -> Result<()> {
        std::fs::create_dir_all(&self.dir)?;
        let mut out = String::new();
        for entry in entries {
            out.push_str(&serde_json::to_string(entry)?);
            out.push('\n');
        }
        std::fs::write(self.path(channel, chat_id), out)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn store() -> SessionStore {
        let dir = std::env::temp_dir().join(format!("attache-sessions-{}", uuid::Uuid::new_v4()));
        SessionStore::new(dir)
    }

    #[test]
    fn turns_append_and_read_back() {
        let store = store();
        store.append_turn("whatsapp", "c1@g.us", "hi", "hello!").unwrap();
        let entries = store.read("whatsapp", "c1@g.us").unwrap();
        assert_eq!(entries.len(), 2);
        assert_eq!(entries[0].role, "user");
        assert_eq!(entries[1].role, "assistant");
    }

    #[test]
    fn cap_prunes_oldest_entries() {
        let store = store();
        for i in 0..30 {
            store
                .append_turn("telegram", "c1", &format!("u{i}"), &format!("a{i}"))
                .unwrap();
        }
        let entries = store.read("telegram", "c1").unwrap();
        assert_eq!(entries.len(), MAX_ENTRIES);
        assert_eq!(entries[0].content, "u5");
    }

    #[test]
    fn clear_removes_history() {
        let store = store();
        store.append_turn("telegram", "c1", "hi", "yo").unwrap();
        store.clear("telegram", "c1").unwrap();
        assert!(store.read("telegram", "c1").unwrap().is_empty());
    }
}
