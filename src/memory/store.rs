//! SQLite memory store
//!
//! Tables: `memory_entries` plus an FTS5 index over `text`,
//! `memory_vec` (embedding blobs), `memory_kv` (scratch), and
//! `idea_backlog_items` (explicit idea/backlog captures).

use std::path::Path;

use chrono::{DateTime, Duration, Utc};
use r2d2::Pool;
use r2d2_sqlite::SqliteConnectionManager;

use super::embedder;
use super::{MemoryEntry, MemoryKind, MemoryScope};
use crate::{Error, Result};

/// Connection pool for the memory database
pub type MemoryPool = Pool<SqliteConnectionManager>;

/// One explicit idea/backlog capture
#[derive(Debug, Clone)]
pub struct IdeaItem {
    pub id: String,
    pub chat: String,
    pub text: String,
    pub kind: String,
    pub created_at: DateTime<Utc>,
}

/// SQLite-backed memory store
#[derive(Clone)]
pub struct MemoryStore {
    pool: MemoryPool,
}

const ENTRY_COLUMNS: &str = "id, scope, scope_key, kind, text, created_at, salience, source_channel, source_chat, source_message_id";

fn row_to_entry(row: &rusqlite::Row<'_>) -> rusqlite::Result<MemoryEntry> {
    let scope: String = row.get(1)?;
    let kind: String = row.get(3)?;
    let created_at: String = row.get(5)?;
    Ok(MemoryEntry {
        id: row.get(0)?,
        scope: MemoryScope::from_str_value(&scope).unwrap_or(MemoryScope::Global),
        scope_key: row.get(2)?,
        kind: MemoryKind::from_str_value(&kind).unwrap_or(MemoryKind::Episodic),
        text: row.get(4)?,
        created_at: DateTime::parse_from_rfc3339(&created_at)
            .map_or_else(|_| Utc::now(), |dt| dt.with_timezone(&Utc)),
        salience: row.get(6)?,
        embedding: None,
        source_channel: row.get(7)?,
        source_chat: row.get(8)?,
        source_message_id: row.get(9)?,
    })
}

impl MemoryStore {
    /// Open (or create) the store at the given path
    ///
    /// # Errors
    ///
    /// Returns error if the database cannot be opened or migrated
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self> {
        if let Some(parent) = path.as_ref().parent() {
            std::fs::create_dir_all(parent)?;
        }
        let manager = SqliteConnectionManager::file(path)
            .with_init(|conn| conn.execute_batch("PRAGMA journal_mode=WAL; PRAGMA synchronous=NORMAL;"));
        Self::from_manager(manager, 4)
    }

    /// In-memory store for tests
    ///
    /// # Errors
    ///
    /// Returns error if the database cannot be initialized
    pub fn open_memory() -> Result<Self> {
        Self::from_manager(SqliteConnectionManager::memory(), 1)
    }

    fn from_manager(manager: SqliteConnectionManager, max_size: u32) -> Result<Self> {
        let pool = Pool::builder()
            .max_size(max_size)
            .build(manager)
            .map_err(|e| Error::Database(e.to_string()))?;
        let conn = pool.get().map_err(|e| Error::Database(e.to_string()))?;
        conn.execute_batch(
            r"
            CREATE TABLE IF NOT EXISTS memory_entries (
                id TEXT PRIMARY KEY,
                scope TEXT NOT NULL CHECK(scope IN ('global', 'user', 'chat')),
                scope_key TEXT NOT NULL,
                kind TEXT NOT NULL,
                text TEXT NOT NULL,
                created_at TEXT NOT NULL,
                salience REAL NOT NULL DEFAULT 0.5,
                source_channel TEXT,
                source_chat TEXT,
                source_message_id TEXT
            );

            CREATE INDEX IF NOT EXISTS idx_memory_scope ON memory_entries(scope, scope_key);

            CREATE VIRTUAL TABLE IF NOT EXISTS memory_entries_fts
            USING fts5(text, content='memory_entries', content_rowid='rowid');

            CREATE TRIGGER IF NOT EXISTS memory_entries_ai
            AFTER INSERT ON memory_entries BEGIN
                INSERT INTO memory_entries_fts(rowid, text) VALUES (new.rowid, new.text);
            END;

            CREATE TRIGGER IF NOT EXISTS memory_entries_ad
            AFTER DELETE ON memory_entries BEGIN
                INSERT INTO memory_entries_fts(memory_entries_fts, rowid, text)
                VALUES ('delete', old.rowid, old.text);
            END;

            CREATE TABLE IF NOT EXISTS memory_vec (
                entry_id TEXT PRIMARY KEY REFERENCES memory_entries(id),
                embedding BLOB NOT NULL
            );

            CREATE TABLE IF NOT EXISTS memory_kv (
                key TEXT PRIMARY KEY,
                value TEXT NOT NULL,
                updated_at TEXT NOT NULL
            );

            CREATE TABLE IF NOT EXISTS idea_backlog_items (
                id TEXT PRIMARY KEY,
                chat TEXT NOT NULL,
                text TEXT NOT NULL,
                kind TEXT NOT NULL CHECK(kind IN ('idea', 'backlog')),
                created_at TEXT NOT NULL
            );
            ",
        )?;
        Ok(Self { pool })
    }

    /// Insert one memory entry
    ///
    /// # Errors
    ///
    /// Returns error on database failure
    pub fn insert(&self, entry: &MemoryEntry) -> Result<()> {
        let conn = self.pool.get().map_err(|e| Error::Database(e.to_string()))?;
        conn.execute(
            r"INSERT INTO memory_entries
              (id, scope, scope_key, kind, text, created_at, salience, source_channel, source_chat, source_message_id)
              VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)",
            rusqlite::params![
                entry.id,
                entry.scope.as_str(),
                entry.scope_key,
                entry.kind.as_str(),
                entry.text,
                entry.created_at.to_rfc3339(),
                entry.salience,
                entry.source_channel,
                entry.source_chat,
                entry.source_message_id,
            ],
        )?;
        if let Some(ref embedding) = entry.embedding {
            self.set_embedding(&entry.id, embedding)?;
        }
        Ok(())
    }

    /// Attach or replace an entry's embedding
    ///
    /// # Errors
    ///
    /// Returns error on database failure
    pub fn set_embedding(&self, id: &str, embedding: &[f32]) -> Result<()> {
        let conn = self.pool.get().map_err(|e| Error::Database(e.to_string()))?;
        conn.execute(
            r"INSERT INTO memory_vec (entry_id, embedding) VALUES (?1, ?2)
              ON CONFLICT(entry_id) DO UPDATE SET embedding = excluded.embedding",
            rusqlite::params![id, embedder::to_bytes(embedding)],
        )?;
        Ok(())
    }

    /// Lexical search via the FTS index, restricted to the given scope
    /// keys. Returns `(entry, raw_bm25)` pairs — lower bm25 is better.
    ///
    /// # Errors
    ///
    /// Returns error on database failure
    pub fn search_lexical(
        &self,
        query: &str,
        scope_keys: &[(MemoryScope, &str)],
        limit: usize,
    ) -> Result<Vec<(MemoryEntry, f64)>> {
        let match_expr = fts_match_expr(query);
        if match_expr.is_empty() || scope_keys.is_empty() {
            return Ok(Vec::new());
        }

        let scope_clause = scope_keys
            .iter()
            .enumerate()
            .map(|(i, _)| format!("(m.scope = ?{} AND m.scope_key = ?{})", i * 2 + 2, i * 2 + 3))
            .collect::<Vec<_>>()
            .join(" OR ");

        let sql = format!(
            r"SELECT {prefixed}, bm25(memory_entries_fts) AS score
              FROM memory_entries_fts f
              JOIN memory_entries m ON m.rowid = f.rowid
              WHERE memory_entries_fts MATCH ?1 AND ({scope_clause})
              ORDER BY score
              LIMIT {limit}",
            prefixed = ENTRY_COLUMNS
                .split(", ")
                .map(|c| format!("m.{c}"))
                .collect::<Vec<_>>()
                .join(", "),
            limit = limit.max(1),
        );

        let conn = self.pool.get().map_err(|e| Error::Database(e.to_string()))?;
        let mut stmt = conn.prepare(&sql)?;

        let mut params: Vec<Box<dyn rusqlite::ToSql>> = vec![Box::new(match_expr)];
        for (scope, key) in scope_keys {
            params.push(Box::new(scope.as_str().to_string()));
            params.push(Box::new((*key).to_string()));
        }
        let params_refs: Vec<&dyn rusqlite::ToSql> = params.iter().map(AsRef::as_ref).collect();

        let rows = stmt.query_map(params_refs.as_slice(), |row| {
            let entry = row_to_entry(row)?;
            let score: f64 = row.get(10)?;
            Ok((entry, score))
        })?;
        Ok(rows.flatten().collect())
    }

    /// All entries in the given scopes with their embeddings hydrated,
    /// for the in-process vector scan
    ///
    /// # Errors
    ///
    /// Returns error on database failure
    pub fn entries_with_embeddings(
        &self,
        scope_keys: &[(MemoryScope, &str)],
    ) -> Result<Vec<MemoryEntry>> {
        if scope_keys.is_empty() {
            return Ok(Vec::new());
        }
        let scope_clause = scope_keys
            .iter()
            .enumerate()
            .map(|(i, _)| format!("(m.scope = ?{} AND m.scope_key = ?{})", i * 2 + 1, i * 2 + 2))
            .collect::<Vec<_>>()
            .join(" OR ");
        let sql = format!(
            r"SELECT {prefixed}, v.embedding
              FROM memory_entries m
              JOIN memory_vec v ON v.entry_id = m.id
              WHERE {scope_clause}",
            prefixed = ENTRY_COLUMNS
                .split(", ")
                .map(|c| format!("m.{c}"))
                .collect::<Vec<_>>()
                .join(", "),
        );

        let conn = self.pool.get().map_err(|e| Error::Database(e.to_string()))?;
        let mut stmt = conn.prepare(&sql)?;

        let mut params: Vec<Box<dyn rusqlite::ToSql>> = Vec::new();
        for (scope, key) in scope_keys {
            params.push(Box::new(scope.as_str().to_string()));
            params.push(Box::new((*key).to_string()));
        }
        let params_refs: Vec<&dyn rusqlite::ToSql> = params.iter().map(AsRef::as_ref).collect();

        let rows = stmt.query_map(params_refs.as_slice(), |row| {
            let mut entry = row_to_entry(row)?;
            let blob: Vec<u8> = row.get(10)?;
            entry.embedding = Some(embedder::from_bytes(&blob));
            Ok(entry)
        })?;
        Ok(rows.flatten().collect())
    }

    /// Record one explicit idea/backlog capture
    ///
    /// # Errors
    ///
    /// Returns error on database failure
    pub fn insert_idea(&self, chat: &str, text: &str, kind: &str) -> Result<IdeaItem> {
        let item = IdeaItem {
            id: format!("idea_{}", uuid::Uuid::new_v4().simple()),
            chat: chat.to_string(),
            text: text.to_string(),
            kind: kind.to_string(),
            created_at: Utc::now(),
        };
        let conn = self.pool.get().map_err(|e| Error::Database(e.to_string()))?;
        conn.execute(
            "INSERT INTO idea_backlog_items (id, chat, text, kind, created_at) VALUES (?1, ?2, ?3, ?4, ?5)",
            rusqlite::params![item.id, item.chat, item.text, item.kind, item.created_at.to_rfc3339()],
        )?;
        Ok(item)
    }

    /// Scratch key/value write
    ///
    /// # Errors
    ///
    /// Returns error on database failure
    pub fn kv_set(&self, key: &str, value: &str) -> Result<()> {
        let conn = self.pool.get().map_err(|e| Error::Database(e.to_string()))?;
        conn.execute(
            r"INSERT INTO memory_kv (key, value, updated_at) VALUES (?1, ?2, ?3)
              ON CONFLICT(key) DO UPDATE SET value = excluded.value, updated_at = excluded.updated_at",
            rusqlite::params![key, value, Utc::now().to_rfc3339()],
        )?;
        Ok(())
    }

    /// Scratch key/value read
    ///
    /// # Errors
    ///
    /// Returns error on database failure
    pub fn kv_get(&self, key: &str) -> Result<Option<String>> {
        let conn = self.pool.get().map_err(|e| Error::Database(e.to_string()))?;
        let result = conn.query_row(
            "SELECT value FROM memory_kv WHERE key = ?1",
            [key],
            |row| row.get::<_, String>(0),
        );
        match result {
            Ok(value) => Ok(Some(value)),
            Err(rusqlite::Error::QueryReturnedNoRows) => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    /// Delete entries older than the retention window
    ///
    /// # Errors
    ///
    /// Returns error on database failure
    pub fn purge_older_than(&self, days: u32) -> Result<usize> {
        let cutoff = Utc::now() - Duration::days(i64::from(days.max(1)));
        let conn = self.pool.get().map_err(|e| Error::Database(e.to_string()))?;
        conn.execute(
            "DELETE FROM memory_vec WHERE entry_id IN (SELECT id FROM memory_entries WHERE created_at < ?1)",
            [cutoff.to_rfc3339()],
        )?;
        let deleted = conn.execute(
            "DELETE FROM memory_entries WHERE created_at < ?1",
            [cutoff.to_rfc3339()],
        )?;
        Ok(deleted)
    }
}

/// Build an FTS5 MATCH expression from free text: alphanumeric tokens
/// joined with OR, quoted to disarm operator syntax
fn fts_match_expr(query: &str) -> String {
    let tokens: Vec<String> = query
        .split(|c: char| !c.is_alphanumeric())
        .filter(|t| t.len() >= 2)
        .take(12)
        .map(|t| format!("\"{t}\""))
        .collect();
    tokens.join(" OR ")
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entry(id: &str, scope: MemoryScope, scope_key: &str, text: &str) -> MemoryEntry {
        MemoryEntry {
            id: id.to_string(),
            scope,
            scope_key: scope_key.to_string(),
            kind: MemoryKind::Semantic,
            text: text.to_string(),
            created_at: Utc::now(),
            salience: 0.8,
            embedding: None,
            source_channel: Some("whatsapp".to_string()),
            source_chat: Some("c1".to_string()),
            source_message_id: None,
        }
    }

    #[test]
    fn lexical_search_respects_scope() {
        let store = MemoryStore::open_memory().unwrap();
        store
            .insert(&entry("e1", MemoryScope::Chat, "chat:c1", "the garden party plan"))
            .unwrap();
        store
            .insert(&entry("e2", MemoryScope::Chat, "chat:c2", "the garden gnome joke"))
            .unwrap();

        let hits = store
            .search_lexical("garden", &[(MemoryScope::Chat, "chat:c1")], 10)
            .unwrap();
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].0.id, "e1");
    }

    #[test]
    fn embeddings_round_trip_through_store() {
        let store = MemoryStore::open_memory().unwrap();
        let mut e = entry("e1", MemoryScope::User, "user:u1", "likes espresso");
        e.embedding = Some(vec![0.1, 0.2, 0.3]);
        store.insert(&e).unwrap();

        let hydrated = store
            .entries_with_embeddings(&[(MemoryScope::User, "user:u1")])
            .unwrap();
        assert_eq!(hydrated.len(), 1);
        assert_eq!(hydrated[0].embedding.as_ref().unwrap().len(), 3);
    }

    #[test]
    fn idea_items_are_recorded() {
        let store = MemoryStore::open_memory().unwrap();
        let item = store.insert_idea("whatsapp:c1", "solar balcony", "idea").unwrap();
        assert!(item.id.starts_with("idea_"));
    }

    #[test]
    fn kv_round_trip() {
        let store = MemoryStore::open_memory().unwrap();
        store.kv_set("cursor", "42").unwrap();
        assert_eq!(store.kv_get("cursor").unwrap().as_deref(), Some("42"));
        assert!(store.kv_get("missing").unwrap().is_none());
    }

    #[test]
    fn fts_expr_quotes_tokens() {
        assert_eq!(fts_match_expr("hello, world!"), "\"hello\" OR \"world\"");
        assert!(fts_match_expr("a").is_empty());
    }
}
