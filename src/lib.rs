//! Attaché — multi-channel personal assistant runtime
//!
//! Ingests user messages from chat platforms (WhatsApp, Telegram,
//! Discord, Feishu), runs each one through a deterministic 13-stage
//! decision pipeline, and returns generated replies through the
//! originating channel.
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────┐
//! │                 Channel adapters                      │
//! │  WhatsApp (bridge) │ Telegram │ Discord │ Feishu     │
//! └────────────────────┬─────────────────────────────────┘
//!                      │ inbound bus
//! ┌────────────────────▼─────────────────────────────────┐
//! │   Orchestrator → Pipeline (Normalize … Outbound)     │
//! │   Policy engine │ Archive │ Memory │ Security        │
//! └────────────────────┬─────────────────────────────────┘
//!                      │ outbound bus
//! ┌────────────────────▼─────────────────────────────────┐
//! │              Channel manager (dispatch)              │
//! └──────────────────────────────────────────────────────┘
//! ```

pub mod archive;
pub mod bridge;
pub mod bus;
pub mod cache;
pub mod channels;
pub mod config;
pub mod error;
pub mod intents;
pub mod lifecycle;
pub mod media;
pub mod memory;
pub mod message;
pub mod orchestrator;
pub mod pipeline;
pub mod policy;
pub mod responder;
pub mod security;
pub mod session;

pub use archive::InboundArchive;
pub use bus::{BoundedBus, BusReceiver, InboundBus, OutboundBus, OutboundItem};
pub use cache::{DedupCache, TtlCache};
pub use config::Config;
pub use error::{Error, Result};
pub use intents::{CaptureScope, OrchestratorIntent, TypingState};
pub use lifecycle::Shutdown;
pub use memory::{MemoryService, MemoryStore};
pub use message::{ContentBlock, ContentKind, Identity, Message, ReplyRef};
pub use orchestrator::Orchestrator;
pub use pipeline::{Middleware, Next, Pipeline, PipelineContext};
pub use policy::{PolicyDecision, PolicyEngine, PolicyQuery, PolicySpec};
pub use responder::{HttpResponder, Responder};
pub use security::SecurityEngine;
pub use session::SessionStore;
