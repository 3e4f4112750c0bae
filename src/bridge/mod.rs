//! WhatsApp bridge
//!
//! A loopback-only process boundary between the orchestrator and the
//! WhatsApp platform SDK. The bridge speaks protocol v2 over WebSocket
//! (`protocol`), owns the live platform session with its caches and
//! reconnect supervisor (`session`), and serves clients (`server`).

pub mod protocol;
pub mod server;
pub mod session;

pub use protocol::{
    parse_command, Command, CommandKind, ErrorCode, Event, ProtocolError, PROTOCOL_VERSION,
};
pub use server::{BridgeServer, MAX_INFLIGHT_COMMANDS, MAX_OUTBOUND_BUFFER_BYTES};
pub use session::{BridgeSession, PlatformClient, PlatformEvent, SessionConfig};
