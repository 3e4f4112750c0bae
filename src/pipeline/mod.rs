//! Inbound orchestration pipeline
//!
//! A static chain of middleware processes each inbound message. The
//! order is load-bearing and visible at the construction site:
//!
//! Normalize → Dedup → Archive → ReplyContextEnrich → AdminCommand →
//! Policy → IdeaCapture → AccessControl → NewChatNotify →
//! NoReplyFilter → InputSecurity → Responder → Outbound
//!
//! Each middleware either calls `next.run(ctx)` (pass-through, with
//! optional post-processing after it returns) or sets `ctx.halted`
//! (short-circuit). A middleware failure halts the pipeline for that
//! message; the failure surfaces as a telemetry intent, never as a
//! crash of the component.

pub mod access;
pub mod admin;
pub mod archive;
pub mod dedup;
pub mod idea_capture;
pub mod new_chat;
pub mod normalize;
pub mod outbound;
pub mod policy;
pub mod reply_context;
pub mod responder;
pub mod security_input;

use std::sync::Arc;

use async_trait::async_trait;

use crate::intents::OrchestratorIntent;
use crate::message::Message;
use crate::policy::PolicyDecision;
use crate::Result;

pub use access::{AccessControl, NoReplyFilter};
pub use admin::AdminCommand;
pub use archive::ArchiveStage;
pub use dedup::Dedup;
pub use idea_capture::IdeaCapture;
pub use new_chat::NewChatNotify;
pub use normalize::Normalize;
pub use outbound::Outbound;
pub use policy::PolicyStage;
pub use reply_context::ReplyContextEnrich;
pub use responder::ResponderStage;
pub use security_input::InputSecurity;

/// Mutable state flowing through the middleware chain
#[derive(Debug)]
pub struct PipelineContext {
    /// The inbound message (replaced once by Normalize; enrichment
    /// fields may be added to `event.metadata` before Policy)
    pub event: Message,

    /// Set by the Policy stage, consumed downstream
    pub decision: Option<PolicyDecision>,

    /// Reply text produced by the Responder stage
    pub reply: Option<String>,

    /// Accumulated output intents
    pub intents: Vec<OrchestratorIntent>,

    /// When true, the runner skips remaining middleware
    pub halted: bool,
}

impl PipelineContext {
    /// Create a context for one message
    #[must_use]
    pub fn new(event: Message) -> Self {
        Self {
            event,
            decision: None,
            reply: None,
            intents: Vec::new(),
            halted: false,
        }
    }

    /// Append a counter metric intent
    pub fn metric(&mut self, name: &str, labels: Vec<(String, String)>) {
        self.intents.push(OrchestratorIntent::metric(name, labels));
    }

    /// Shorthand for a metric labeled with the event's channel
    pub fn channel_metric(&mut self, name: &str) {
        let channel = self.event.channel.clone();
        self.metric(name, vec![("channel".to_string(), channel)]);
    }

    /// Signal the pipeline to stop after this middleware
    pub fn halt(&mut self) {
        self.halted = true;
    }
}

/// Continuation handed to each middleware
pub struct Next<'a> {
    rest: &'a [Arc<dyn Middleware>],
}

impl Next<'_> {
    /// Run the remaining middleware
    ///
    /// # Errors
    ///
    /// Propagates the first middleware failure
    pub async fn run(self, ctx: &mut PipelineContext) -> Result<()> {
        if ctx.halted {
            return Ok(());
        }
        let Some((first, rest)) = self.rest.split_first() else {
            return Ok(());
        };
        first.handle(ctx, Next { rest }).await
    }
}

/// One unit of pipeline logic
#[async_trait]
pub trait Middleware: Send + Sync {
    /// Stage name for telemetry
    fn name(&self) -> &'static str;

    /// Process the context; call `next.run(ctx)` to pass through
    async fn handle(&self, ctx: &mut PipelineContext, next: Next<'_>) -> Result<()>;
}

/// Ordered middleware chain
pub struct Pipeline {
    layers: Vec<Arc<dyn Middleware>>,
}

impl Pipeline {
    /// Build a pipeline from an explicit stage list
    #[must_use]
    pub fn new(layers: Vec<Arc<dyn Middleware>>) -> Self {
        Self { layers }
    }

    /// Number of stages
    #[must_use]
    pub fn len(&self) -> usize {
        self.layers.len()
    }

    /// Whether the chain is empty
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.layers.is_empty()
    }

    /// Process one message through the chain and return the intents
    pub async fn run(&self, event: Message) -> Vec<OrchestratorIntent> {
        let channel = event.channel.clone();
        let mut ctx = PipelineContext::new(event);

        if let Err(e) = (Next { rest: &self.layers }).run(&mut ctx).await {
            tracing::error!(channel = %channel, error = %e, "pipeline stage failed");
            ctx.metric(
                "pipeline_error",
                vec![
                    ("channel".to_string(), channel),
                    ("error".to_string(), e.to_string()),
                ],
            );
            ctx.halt();
        }

        ctx.intents
    }
}
