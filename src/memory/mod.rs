//! Long-term memory: capture lane and hybrid recall
//!
//! Capture never runs on the pipeline hot path. The pipeline emits
//! `MemoryCapture` intents; a background worker runs extraction,
//! filtering, scope assignment, and persistence. Recall combines
//! lexical (FTS5/bm25), vector (cosine), salience, and recency scores.

pub mod embedder;
pub mod extractor;
pub mod store;

use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;

use crate::config::MemoryConfig;
use crate::Result;

pub use embedder::Embedder;
pub use store::{IdeaItem, MemoryStore};

/// Memory entry kind
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MemoryKind {
    /// Things that happened
    Episodic,
    /// Facts about the user or their world
    Semantic,
    /// How to do things
    Procedural,
    /// Stated preferences
    Preference,
    /// Agreed decisions
    Decision,
    /// Emotional context
    Emotional,
    /// Cross-conversation reflections
    Reflective,
}

impl MemoryKind {
    /// Stable string form used in the store
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Episodic => "episodic",
            Self::Semantic => "semantic",
            Self::Procedural => "procedural",
            Self::Preference => "preference",
            Self::Decision => "decision",
            Self::Emotional => "emotional",
            Self::Reflective => "reflective",
        }
    }

    /// Parse the stable string form
    #[must_use]
    pub fn from_str_value(s: &str) -> Option<Self> {
        match s {
            "episodic" => Some(Self::Episodic),
            "semantic" => Some(Self::Semantic),
            "procedural" => Some(Self::Procedural),
            "preference" => Some(Self::Preference),
            "decision" => Some(Self::Decision),
            "emotional" => Some(Self::Emotional),
            "reflective" => Some(Self::Reflective),
            _ => None,
        }
    }

    /// Default scope for entries of this kind
    #[must_use]
    pub const fn default_scope(self) -> MemoryScope {
        match self {
            Self::Episodic | Self::Emotional | Self::Decision => MemoryScope::Chat,
            Self::Semantic | Self::Procedural | Self::Preference => MemoryScope::User,
            Self::Reflective => MemoryScope::Global,
        }
    }
}

/// Memory entry scope
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MemoryScope {
    /// Workspace-wide
    Global,
    /// Tied to one sender
    User,
    /// Tied to one chat
    Chat,
}

impl MemoryScope {
    /// Stable string form used in the store
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Global => "global",
            Self::User => "user",
            Self::Chat => "chat",
        }
    }

    /// Parse the stable string form
    #[must_use]
    pub fn from_str_value(s: &str) -> Option<Self> {
        match s {
            "global" => Some(Self::Global),
            "user" => Some(Self::User),
            "chat" => Some(Self::Chat),
            _ => None,
        }
    }
}

/// One stored memory entry
#[derive(Debug, Clone)]
pub struct MemoryEntry {
    pub id: String,
    pub scope: MemoryScope,
    pub scope_key: String,
    pub kind: MemoryKind,
    pub text: String,
    pub created_at: DateTime<Utc>,
    pub salience: f64,
    pub embedding: Option<Vec<f32>>,
    pub source_channel: Option<String>,
    pub source_chat: Option<String>,
    pub source_message_id: Option<String>,
}

/// One recall hit with its score breakdown
#[derive(Debug, Clone)]
pub struct RecalledEntry {
    pub entry: MemoryEntry,
    pub lex_score: f64,
    pub vec_score: f64,
    pub recency: f64,
    pub final_score: f64,
}

/// One queued capture request (fed by `MemoryCapture` intents)
#[derive(Debug, Clone)]
pub struct CaptureRequest {
    pub channel: String,
    pub chat_id: String,
    pub sender_id: Option<String>,
    pub message_id: Option<String>,
    pub text: String,
    /// "idea" / "backlog" for explicit captures, "turn" for plain
    /// conversation text
    pub kind: String,
    pub assistant: bool,
    pub sender_is_owner: bool,
}

/// Long-term memory service
pub struct MemoryService {
    store: MemoryStore,
    config: MemoryConfig,
    embedder: Option<Embedder>,
}

impl MemoryService {
    /// Create the service
    #[must_use]
    pub fn new(store: MemoryStore, config: MemoryConfig) -> Self {
        let embedder = config
            .embedding_url
            .as_ref()
            .map(|url| Embedder::new(url.clone(), None));
        Self {
            store,
            config,
            embedder,
        }
    }

    /// Underlying store
    #[must_use]
    pub const fn store(&self) -> &MemoryStore {
        &self.store
    }

    fn chat_scope_key(channel: &str, chat_id: &str) -> String {
        format!("channel:{channel}:chat:{chat_id}")
    }

    fn user_scope_key(channel: &str, sender_id: &str) -> String {
        format!("channel:{channel}:user:{sender_id}")
    }

    /// Process one capture request: eligibility, extraction, filters,
    /// scope assignment, persistence. Embeddings are attached
    /// afterwards so a slow embedding route never blocks persistence.
    ///
    /// # Errors
    ///
    /// Returns error on store failure
    pub async fn capture(&self, request: &CaptureRequest) -> Result<usize> {
        if !self.config.enabled {
            return Ok(0);
        }
        if !self
            .config
            .capture_channels
            .iter()
            .any(|c| c == &request.channel)
        {
            return Ok(0);
        }
        if request.assistant && !self.config.capture_assistant {
            return Ok(0);
        }

        // Explicit idea/backlog captures skip extraction entirely.
        if request.kind == "idea" || request.kind == "backlog" {
            if extractor::is_injection(&request.text) {
                tracing::debug!(chat = %request.chat_id, "idea capture dropped by injection filter");
                return Ok(0);
            }
            self.store.insert_idea(
                &format!("{}:{}", request.channel, request.chat_id),
                &request.text,
                &request.kind,
            )?;
            return Ok(1);
        }

        let mut saved = 0;
        for candidate in extractor::extract(&request.text) {
            if candidate.confidence < self.config.min_confidence
                || candidate.salience < self.config.min_salience
            {
                continue;
            }
            if self.config.owner_only_preference
                && !request.sender_is_owner
                && matches!(
                    candidate.kind,
                    MemoryKind::Semantic | MemoryKind::Procedural | MemoryKind::Preference
                )
            {
                continue;
            }

            let scope = candidate.kind.default_scope();
            let scope_key = match scope {
                MemoryScope::Chat => Self::chat_scope_key(&request.channel, &request.chat_id),
                MemoryScope::User => Self::user_scope_key(
                    &request.channel,
                    request.sender_id.as_deref().unwrap_or(&request.chat_id),
                ),
                MemoryScope::Global => "global".to_string(),
            };

            let entry = MemoryEntry {
                id: format!("mem_{}", uuid::Uuid::new_v4().simple()),
                scope,
                scope_key,
                kind: candidate.kind,
                text: candidate.text,
                created_at: Utc::now(),
                salience: candidate.salience,
                embedding: None,
                source_channel: Some(request.channel.clone()),
                source_chat: Some(request.chat_id.clone()),
                source_message_id: request.message_id.clone(),
            };
            self.store.insert(&entry)?;
            saved += 1;

            if let Some(ref embedder) = self.embedder {
                match embedder.embed(&entry.text).await {
                    Ok(embedding) => self.store.set_embedding(&entry.id, &embedding)?,
                    Err(e) => {
                        tracing::debug!(error = %e, "embedding failed, entry stays lexical-only");
                    }
                }
            }
        }
        Ok(saved)
    }

    /// Ranked hybrid recall for one query context
    ///
    /// # Errors
    ///
    /// Returns error on store failure
    pub async fn recall(
        &self,
        query: &str,
        channel: &str,
        chat_id: &str,
        sender_id: &str,
        limit: usize,
    ) -> Result<Vec<RecalledEntry>> {
        if !self.config.enabled || query.trim().is_empty() {
            return Ok(Vec::new());
        }

        let chat_key = Self::chat_scope_key(channel, chat_id);
        let user_key = Self::user_scope_key(channel, sender_id);
        let scopes: [(MemoryScope, &str); 3] = [
            (MemoryScope::Chat, chat_key.as_str()),
            (MemoryScope::User, user_key.as_str()),
            (MemoryScope::Global, "global"),
        ];

        let fetch = limit.max(1) * 3;
        let lexical = self.store.search_lexical(query, &scopes, fetch)?;

        let query_embedding = match self.embedder {
            Some(ref embedder) => embedder.embed(query).await.ok(),
            None => None,
        };

        let mut hits: std::collections::HashMap<String, RecalledEntry> = std::collections::HashMap::new();

        // bm25 is lower-is-better; invert into [0, 1] over this result set.
        let (min_raw, max_raw) = lexical.iter().fold(
            (f64::INFINITY, f64::NEG_INFINITY),
            |(lo, hi), (_, score)| (lo.min(*score), hi.max(*score)),
        );
        for (entry, raw) in lexical {
            let lex_score = if (max_raw - min_raw).abs() < 1e-9 {
                1.0
            } else {
                ((max_raw - raw) / (max_raw - min_raw)).clamp(0.0, 1.0)
            };
            hits.insert(
                entry.id.clone(),
                RecalledEntry {
                    entry,
                    lex_score,
                    vec_score: 0.0,
                    recency: 0.0,
                    final_score: 0.0,
                },
            );
        }

        if let Some(ref query_embedding) = query_embedding {
            for entry in self.store.entries_with_embeddings(&scopes)? {
                let Some(ref embedding) = entry.embedding else {
                    continue;
                };
                let sim = f64::from(embedder::cosine_similarity(query_embedding, embedding))
                    .max(0.0);
                if sim <= 0.0 {
                    continue;
                }
                hits.entry(entry.id.clone())
                    .and_modify(|hit| hit.vec_score = sim)
                    .or_insert_with(|| RecalledEntry {
                        entry,
                        lex_score: 0.0,
                        vec_score: sim,
                        recency: 0.0,
                        final_score: 0.0,
                    });
            }
        }

        let now = Utc::now();
        let half_life = self.config.recency_half_life_days.max(0.01);
        let mut ranked: Vec<RecalledEntry> = hits
            .into_values()
            .map(|mut hit| {
                let age_days =
                    (now - hit.entry.created_at).num_seconds().max(0) as f64 / 86_400.0;
                hit.recency = 0.5_f64.powf(age_days / half_life);
                hit.final_score = self.config.w_lex * hit.lex_score
                    + self.config.w_vec * hit.vec_score
                    + self.config.w_sal * hit.entry.salience
                    + self.config.w_rec * hit.recency;
                hit
            })
            .collect();
        ranked.sort_by(|a, b| {
            b.final_score
                .partial_cmp(&a.final_score)
                .unwrap_or(std::cmp::Ordering::Equal)
        });

        // Near-duplicate suppression by normalized text prefix.
        let mut seen_prefixes = std::collections::HashSet::new();
        ranked.retain(|hit| seen_prefixes.insert(text_prefix(&hit.entry.text)));
        ranked.truncate(limit.max(1));
        Ok(ranked)
    }

    /// Format recall hits for prompt injection
    #[must_use]
    pub fn format_for_prompt(hits: &[RecalledEntry]) -> String {
        use std::fmt::Write;
        if hits.is_empty() {
            return String::new();
        }
        let mut out = String::from("Relevant memories:\n");
        for hit in hits {
            let _ = writeln!(out, "- [{}] {}", hit.entry.kind.as_str(), hit.entry.text);
        }
        out
    }
}

fn text_prefix(text: &str) -> String {
    text.to_lowercase()
        .split_whitespace()
        .collect::<Vec<_>>()
        .join(" ")
        .chars()
        .take(40)
        .collect()
}

/// Spawn the background capture worker lane
pub fn spawn_capture_worker(
    service: Arc<MemoryService>,
    mut rx: mpsc::Receiver<CaptureRequest>,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        while let Some(request) = rx.recv().await {
            match service.capture(&request).await {
                Ok(saved) if saved > 0 => {
                    tracing::debug!(
                        channel = %request.channel,
                        chat = %request.chat_id,
                        saved,
                        "memory capture"
                    );
                }
                Ok(_) => {}
                Err(e) => tracing::warn!(error = %e, "memory capture failed"),
            }
        }
    })
}
