//! Runtime lifecycle signalling
//!
//! One shared handle signals shutdown across components. `/panic` asks
//! for a graceful drain: the orchestrator stops accepting new inbound
//! events, in-flight pipelines finish, and already-emitted outbound
//! intents are still delivered best-effort.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use tokio::sync::Notify;

/// Shared shutdown handle
#[derive(Debug, Default)]
pub struct Shutdown {
    draining: AtomicBool,
    notify: Notify,
}

impl Shutdown {
    /// Create a fresh handle
    #[must_use]
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Request a graceful drain
    pub fn drain(&self) {
        if !self.draining.swap(true, Ordering::SeqCst) {
            tracing::warn!("graceful drain requested");
        }
        self.notify.notify_waiters();
    }

    /// Whether a drain has been requested
    #[must_use]
    pub fn is_draining(&self) -> bool {
        self.draining.load(Ordering::SeqCst)
    }

    /// Wait until a drain is requested
    pub async fn wait(&self) {
        while !self.is_draining() {
            let notified = self.notify.notified();
            if self.is_draining() {
                return;
            }
            notified.await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn drain_wakes_waiters() {
        let shutdown = Shutdown::new();
        let waiter = {
            let shutdown = Arc::clone(&shutdown);
            tokio::spawn(async move { shutdown.wait().await })
        };
        shutdown.drain();
        waiter.await.unwrap();
        assert!(shutdown.is_draining());
    }
}
