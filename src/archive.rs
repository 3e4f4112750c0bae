//! Inbound message archive
//!
//! SQLite-backed store of every accepted inbound message, keyed by
//! `(channel, chat_id, message_id)`. Feeds the reply-thread and ambient
//! context windows and the new-chat detector. Rows carry a `seq` that
//! increases monotonically per `(channel, chat_id)` partition, assigned
//! at insertion.

use std::path::Path;

use chrono::{DateTime, Duration, Utc};
use r2d2::Pool;
use r2d2_sqlite::SqliteConnectionManager;

use crate::message::Message;
use crate::{Error, Result};

/// Default retention window in days
pub const DEFAULT_RETENTION_DAYS: u32 = 30;

/// Connection pool for the archive database
pub type ArchivePool = Pool<SqliteConnectionManager>;

/// One archived inbound message
#[derive(Debug, Clone)]
pub struct ArchiveRecord {
    pub channel: String,
    pub chat_id: String,
    pub message_id: String,
    pub sender_id: String,
    pub sender_display_name: Option<String>,
    pub text: String,
    pub reply_to_message_id: Option<String>,
    pub timestamp: DateTime<Utc>,
    pub seq: i64,
}

/// SQLite-backed inbound archive
#[derive(Clone)]
pub struct InboundArchive {
    pool: ArchivePool,
    retention_days: u32,
}

const RECORD_COLUMNS: &str = "channel, chat_id, message_id, sender_id, sender_display_name, text, reply_to_message_id, timestamp, seq";

fn row_to_record(row: &rusqlite::Row<'_>) -> rusqlite::Result<ArchiveRecord> {
    let timestamp: String = row.get(7)?;
    Ok(ArchiveRecord {
        channel: row.get(0)?,
        chat_id: row.get(1)?,
        message_id: row.get(2)?,
        sender_id: row.get(3)?,
        sender_display_name: row.get(4)?,
        text: row.get(5)?,
        reply_to_message_id: row.get(6)?,
        timestamp: DateTime::parse_from_rfc3339(&timestamp)
            .map_or_else(|_| Utc::now(), |dt| dt.with_timezone(&Utc)),
        seq: row.get(8)?,
    })
}

impl InboundArchive {
    /// Open (or create) the archive at the given path
    ///
    /// # Errors
    ///
    /// Returns error if the database cannot be opened or migrated
    pub fn open<P: AsRef<Path>>(path: P, retention_days: u32) -> Result<Self> {
        if let Some(parent) = path.as_ref().parent() {
            std::fs::create_dir_all(parent)?;
        }
        let manager = SqliteConnectionManager::file(path)
            .with_init(|conn| conn.execute_batch("PRAGMA journal_mode=WAL; PRAGMA synchronous=NORMAL;"));
        Self::from_manager(manager, 4, retention_days)
    }

    /// In-memory archive for tests
    ///
    /// # Errors
    ///
    /// Returns error if the database cannot be initialized
    pub fn open_memory() -> Result<Self> {
        // A pooled in-memory database must stay on a single connection.
        Self::from_manager(SqliteConnectionManager::memory(), 1, DEFAULT_RETENTION_DAYS)
    }

    fn from_manager(
        manager: SqliteConnectionManager,
        max_size: u32,
        retention_days: u32,
    ) -> Result<Self> {
        let pool = Pool::builder()
            .max_size(max_size)
            .build(manager)
            .map_err(|e| Error::Database(e.to_string()))?;
        let conn = pool.get().map_err(|e| Error::Database(e.to_string()))?;
        conn.execute_batch(
            r"
            CREATE TABLE IF NOT EXISTS inbound_messages (
                channel TEXT NOT NULL,
                chat_id TEXT NOT NULL,
                message_id TEXT NOT NULL,
                sender_id TEXT NOT NULL,
                sender_display_name TEXT,
                text TEXT NOT NULL,
                reply_to_message_id TEXT,
                timestamp TEXT NOT NULL,
                seq INTEGER NOT NULL,
                PRIMARY KEY (channel, chat_id, message_id)
            );

            CREATE INDEX IF NOT EXISTS idx_inbound_chat_seq
            ON inbound_messages (channel, chat_id, seq);

            CREATE VIRTUAL TABLE IF NOT EXISTS inbound_messages_fts
            USING fts5(text, content='inbound_messages', content_rowid='rowid');

            CREATE TRIGGER IF NOT EXISTS inbound_messages_ai
            AFTER INSERT ON inbound_messages BEGIN
                INSERT INTO inbound_messages_fts(rowid, text) VALUES (new.rowid, new.text);
            END;

            CREATE TRIGGER IF NOT EXISTS inbound_messages_ad
            AFTER DELETE ON inbound_messages BEGIN
                INSERT INTO inbound_messages_fts(inbound_messages_fts, rowid, text)
                VALUES ('delete', old.rowid, old.text);
            END;
            ",
        )?;
        Ok(Self {
            pool,
            retention_days: retention_days.max(1),
        })
    }

    /// Insert one message idempotently; re-inserting an existing key
    /// leaves the stored record untouched
    ///
    /// # Errors
    ///
    /// Returns error on database failure
    pub fn insert(&self, msg: &Message) -> Result<()> {
        if msg.id.is_empty() || msg.chat_id.is_empty() {
            return Ok(());
        }
        let mut conn = self.pool.get().map_err(|e| Error::Database(e.to_string()))?;
        let tx = conn.transaction()?;
        let next_seq: i64 = tx.query_row(
            "SELECT COALESCE(MAX(seq), 0) + 1 FROM inbound_messages WHERE channel = ?1 AND chat_id = ?2",
            rusqlite::params![msg.channel, msg.chat_id],
            |row| row.get(0),
        )?;
        tx.execute(
            r"INSERT OR IGNORE INTO inbound_messages
              (channel, chat_id, message_id, sender_id, sender_display_name, text, reply_to_message_id, timestamp, seq)
              VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)",
            rusqlite::params![
                msg.channel,
                msg.chat_id,
                msg.id,
                msg.sender.id,
                msg.sender.display_name,
                msg.text_content(),
                msg.reply_to.as_ref().map(|r| r.message_id.clone()),
                msg.timestamp.to_rfc3339(),
                next_seq,
            ],
        )?;
        tx.commit()?;
        Ok(())
    }

    /// Seed the archive with a quoted message whose text arrived in the
    /// reply payload but which was never archived itself
    ///
    /// # Errors
    ///
    /// Returns error on database failure
    pub fn seed_quoted(
        &self,
        channel: &str,
        chat_id: &str,
        message_id: &str,
        sender: Option<&str>,
        text: &str,
    ) -> Result<()> {
        if message_id.is_empty() || text.trim().is_empty() {
            return Ok(());
        }
        let mut conn = self.pool.get().map_err(|e| Error::Database(e.to_string()))?;
        let tx = conn.transaction()?;
        let next_seq: i64 = tx.query_row(
            "SELECT COALESCE(MAX(seq), 0) + 1 FROM inbound_messages WHERE channel = ?1 AND chat_id = ?2",
            rusqlite::params![channel, chat_id],
            |row| row.get(0),
        )?;
        tx.execute(
            r"INSERT OR IGNORE INTO inbound_messages
              (channel, chat_id, message_id, sender_id, sender_display_name, text, reply_to_message_id, timestamp, seq)
              VALUES (?1, ?2, ?3, ?4, NULL, ?5, NULL, ?6, ?7)",
            rusqlite::params![
                channel,
                chat_id,
                message_id,
                sender.unwrap_or("unknown"),
                text,
                Utc::now().to_rfc3339(),
                next_seq,
            ],
        )?;
        tx.commit()?;
        Ok(())
    }

    /// Look up one archived message by its unique key
    ///
    /// # Errors
    ///
    /// Returns error on database failure
    pub fn lookup(
        &self,
        channel: &str,
        chat_id: &str,
        message_id: &str,
    ) -> Result<Option<ArchiveRecord>> {
        let conn = self.pool.get().map_err(|e| Error::Database(e.to_string()))?;
        let result = conn.query_row(
            &format!(
                "SELECT {RECORD_COLUMNS} FROM inbound_messages
                 WHERE channel = ?1 AND chat_id = ?2 AND message_id = ?3"
            ),
            rusqlite::params![channel, chat_id, message_id],
            row_to_record,
        );
        match result {
            Ok(record) => Ok(Some(record)),
            Err(rusqlite::Error::QueryReturnedNoRows) => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    /// The `limit` most recent records before the anchor message in the
    /// same chat, returned oldest-first
    ///
    /// # Errors
    ///
    /// Returns error on database failure
    pub fn lookup_messages_before(
        &self,
        channel: &str,
        chat_id: &str,
        anchor_message_id: &str,
        limit: usize,
    ) -> Result<Vec<ArchiveRecord>> {
        let Some(anchor) = self.lookup(channel, chat_id, anchor_message_id)? else {
            return Ok(Vec::new());
        };
        let conn = self.pool.get().map_err(|e| Error::Database(e.to_string()))?;
        let mut stmt = conn.prepare(&format!(
            "SELECT {RECORD_COLUMNS} FROM inbound_messages
             WHERE channel = ?1 AND chat_id = ?2 AND seq < ?3
             ORDER BY seq DESC LIMIT ?4"
        ))?;
        #[allow(clippy::cast_possible_wrap)]
        let rows = stmt.query_map(
            rusqlite::params![channel, chat_id, anchor.seq, limit.max(1) as i64],
            row_to_record,
        )?;
        let mut records: Vec<ArchiveRecord> = rows.flatten().collect();
        records.reverse();
        Ok(records)
    }

    /// Walk the reply chain backward from a starting message. Tracks
    /// visited ids so self-referential or cyclic chains terminate, and
    /// caps at `max_depth` regardless. Most-recent-first order.
    ///
    /// # Errors
    ///
    /// Returns error on database failure
    pub fn walk_reply_chain(
        &self,
        channel: &str,
        chat_id: &str,
        starting_message_id: &str,
        max_depth: usize,
    ) -> Result<Vec<ArchiveRecord>> {
        let mut chain = Vec::new();
        let mut visited = std::collections::HashSet::new();
        let mut cursor = starting_message_id.to_string();

        while chain.len() < max_depth {
            if !visited.insert(cursor.clone()) {
                break;
            }
            let Some(record) = self.lookup(channel, chat_id, &cursor)? else {
                break;
            };
            let next = record.reply_to_message_id.clone();
            chain.push(record);
            match next {
                Some(next_id) if !next_id.is_empty() => cursor = next_id,
                _ => break,
            }
        }
        Ok(chain)
    }

    /// Distinct chat ids seen on a channel, optionally since a cutoff
    ///
    /// # Errors
    ///
    /// Returns error on database failure
    pub fn distinct_chats(
        &self,
        channel: &str,
        since: Option<DateTime<Utc>>,
    ) -> Result<Vec<String>> {
        let conn = self.pool.get().map_err(|e| Error::Database(e.to_string()))?;
        let mut chats = Vec::new();
        if let Some(since) = since {
            let mut stmt = conn.prepare(
                "SELECT DISTINCT chat_id FROM inbound_messages WHERE channel = ?1 AND timestamp >= ?2",
            )?;
            let rows = stmt.query_map(
                rusqlite::params![channel, since.to_rfc3339()],
                |row| row.get::<_, String>(0),
            )?;
            chats.extend(rows.flatten());
        } else {
            let mut stmt =
                conn.prepare("SELECT DISTINCT chat_id FROM inbound_messages WHERE channel = ?1")?;
            let rows = stmt.query_map([channel], |row| row.get::<_, String>(0))?;
            chats.extend(rows.flatten());
        }
        Ok(chats)
    }

    /// Whether this `(channel, chat_id)` has archived messages
    ///
    /// # Errors
    ///
    /// Returns error on database failure
    pub fn chat_known(&self, channel: &str, chat_id: &str) -> Result<bool> {
        let conn = self.pool.get().map_err(|e| Error::Database(e.to_string()))?;
        let count: i64 = conn.query_row(
            "SELECT COUNT(*) FROM inbound_messages WHERE channel = ?1 AND chat_id = ?2",
            rusqlite::params![channel, chat_id],
            |row| row.get(0),
        )?;
        Ok(count > 0)
    }

    /// Delete rows older than the retention window; returns the number
    /// of rows removed
    ///
    /// # Errors
    ///
    /// Returns error on database failure
    pub fn purge_older_than(&self, days: u32) -> Result<usize> {
        let cutoff = Utc::now() - Duration::days(i64::from(days.max(1)));
        let conn = self.pool.get().map_err(|e| Error::Database(e.to_string()))?;
        let deleted = conn.execute(
            "DELETE FROM inbound_messages WHERE timestamp < ?1",
            [cutoff.to_rfc3339()],
        )?;
        if deleted > 0 {
            tracing::info!(count = deleted, days, "archive retention purge");
        }
        Ok(deleted)
    }

    /// Run the configured retention sweep
    ///
    /// # Errors
    ///
    /// Returns error on database failure
    pub fn sweep(&self) -> Result<usize> {
        self.purge_older_than(self.retention_days)
    }
}

/// Spawn the daily retention sweep (runs once at startup, then every
/// 24 h)
pub fn spawn_retention_sweep(archive: InboundArchive) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        loop {
            if let Err(e) = archive.sweep() {
                tracing::warn!(error = %e, "archive retention sweep failed");
            }
            tokio::time::sleep(std::time::Duration::from_secs(24 * 60 * 60)).await;
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::message::{Identity, Message, ReplyRef};

    fn msg(chat: &str, id: &str, text: &str) -> Message {
        Message::text("whatsapp", chat, id, Identity::new("sender1"), text)
    }

    #[test]
    fn seq_increases_per_chat_partition() {
        let archive = InboundArchive::open_memory().unwrap();
        archive.insert(&msg("c1", "m1", "one")).unwrap();
        archive.insert(&msg("c2", "x1", "other chat")).unwrap();
        archive.insert(&msg("c1", "m2", "two")).unwrap();
        archive.insert(&msg("c1", "m3", "three")).unwrap();

        let m3 = archive.lookup("whatsapp", "c1", "m3").unwrap().unwrap();
        let m2 = archive.lookup("whatsapp", "c1", "m2").unwrap().unwrap();
        let m1 = archive.lookup("whatsapp", "c1", "m1").unwrap().unwrap();
        assert!(m1.seq < m2.seq && m2.seq < m3.seq);

        let x1 = archive.lookup("whatsapp", "c2", "x1").unwrap().unwrap();
        assert_eq!(x1.seq, 1);
    }

    #[test]
    fn insert_is_idempotent() {
        let archive = InboundArchive::open_memory().unwrap();
        archive.insert(&msg("c1", "m1", "original")).unwrap();
        archive.insert(&msg("c1", "m1", "changed")).unwrap();
        let record = archive.lookup("whatsapp", "c1", "m1").unwrap().unwrap();
        assert_eq!(record.text, "original");
        assert_eq!(record.seq, 1);
    }

    #[test]
    fn messages_before_returns_oldest_first() {
        let archive = InboundArchive::open_memory().unwrap();
        for i in 1..=5 {
            archive.insert(&msg("c1", &format!("m{i}"), &format!("text {i}"))).unwrap();
        }
        let before = archive
            .lookup_messages_before("whatsapp", "c1", "m5", 3)
            .unwrap();
        let ids: Vec<&str> = before.iter().map(|r| r.message_id.as_str()).collect();
        assert_eq!(ids, vec!["m2", "m3", "m4"]);
    }

    #[test]
    fn reply_chain_walks_backward_and_survives_cycles() {
        let archive = InboundArchive::open_memory().unwrap();
        let mut m1 = msg("c1", "m1", "root");
        m1.reply_to = Some(ReplyRef {
            message_id: "m3".to_string(),
            text: None,
            sender: None,
        });
        let mut m2 = msg("c1", "m2", "middle");
        m2.reply_to = Some(ReplyRef {
            message_id: "m1".to_string(),
            text: None,
            sender: None,
        });
        let mut m3 = msg("c1", "m3", "leaf");
        m3.reply_to = Some(ReplyRef {
            message_id: "m2".to_string(),
            text: None,
            sender: None,
        });
        archive.insert(&m1).unwrap();
        archive.insert(&m2).unwrap();
        archive.insert(&m3).unwrap();

        // m3 -> m2 -> m1 -> m3 cycles; the walker must terminate.
        let chain = archive
            .walk_reply_chain("whatsapp", "c1", "m3", 10)
            .unwrap();
        let ids: Vec<&str> = chain.iter().map(|r| r.message_id.as_str()).collect();
        assert_eq!(ids, vec!["m3", "m2", "m1"]);
    }

    #[test]
    fn reply_chain_respects_depth_cap() {
        let archive = InboundArchive::open_memory().unwrap();
        let mut prev: Option<String> = None;
        for i in 1..=10 {
            let mut m = msg("c1", &format!("m{i}"), "link");
            if let Some(ref p) = prev {
                m.reply_to = Some(ReplyRef {
                    message_id: p.clone(),
                    text: None,
                    sender: None,
                });
            }
            archive.insert(&m).unwrap();
            prev = Some(format!("m{i}"));
        }
        let chain = archive.walk_reply_chain("whatsapp", "c1", "m10", 4).unwrap();
        assert_eq!(chain.len(), 4);
    }

    #[test]
    fn distinct_chats_and_known() {
        let archive = InboundArchive::open_memory().unwrap();
        archive.insert(&msg("c1", "m1", "hello")).unwrap();
        assert!(archive.chat_known("whatsapp", "c1").unwrap());
        assert!(!archive.chat_known("whatsapp", "c9").unwrap());
        assert_eq!(archive.distinct_chats("whatsapp", None).unwrap(), vec!["c1"]);
    }

    #[test]
    fn purge_removes_old_rows() {
        let archive = InboundArchive::open_memory().unwrap();
        let mut old = msg("c1", "old", "stale");
        old.timestamp = Utc::now() - Duration::days(60);
        archive.insert(&old).unwrap();
        archive.insert(&msg("c1", "new", "fresh")).unwrap();
        let deleted = archive.purge_older_than(30).unwrap();
        assert_eq!(deleted, 1);
        assert!(archive.lookup("whatsapp", "c1", "old").unwrap().is_none());
        assert!(archive.lookup("whatsapp", "c1", "new").unwrap().is_some());
    }
}
