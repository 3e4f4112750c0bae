//! Dedup stage — drop re-delivered messages
//!
//! Keyed by `(channel, chat_id, message_id)` with a bounded TTL cache.
//! First occurrence records and passes through; duplicates halt
//! silently.

use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;

use super::{Middleware, Next, PipelineContext};
use crate::cache::DedupCache;
use crate::Result;

/// Default dedup TTL (10 minutes)
pub const DEFAULT_TTL_SECONDS: u64 = 600;

/// Default dedup cache cap
pub const DEFAULT_MAX_ENTRIES: usize = 5_000;

/// TTL-based message id dedup
pub struct Dedup {
    cache: Mutex<DedupCache<String>>,
}

impl Dedup {
    /// Create the stage with explicit TTL and cap
    #[must_use]
    pub fn new(ttl: Duration, max_entries: usize) -> Self {
        Self {
            cache: Mutex::new(DedupCache::new(ttl, max_entries)),
        }
    }
}

impl Default for Dedup {
    fn default() -> Self {
        Self::new(Duration::from_secs(DEFAULT_TTL_SECONDS), DEFAULT_MAX_ENTRIES)
    }
}

#[async_trait]
impl Middleware for Dedup {
    fn name(&self) -> &'static str {
        "dedup"
    }

    async fn handle(&self, ctx: &mut PipelineContext, next: Next<'_>) -> Result<()> {
        if ctx.event.id.is_empty() {
            return next.run(ctx).await;
        }

        let key = format!("{}:{}:{}", ctx.event.channel, ctx.event.chat_id, ctx.event.id);
        let duplicate = self
            .cache
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .check_and_insert(key);

        if duplicate {
            ctx.channel_metric("event_drop_duplicate");
            ctx.halt();
            return Ok(());
        }

        next.run(ctx).await
    }
}
