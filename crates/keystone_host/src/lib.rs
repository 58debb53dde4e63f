//! # Keystone Host - Reference WebSocket Host
//!
//! A minimal host server for [`keystone_core`]. It accepts WebSocket
//! clients, treats every frame as one protocol message and gives each
//! connection a [`WsPipeline`] that the core splices its interceptor into.
//!
//! ## Message Flow
//!
//! 1. A frame arrives and becomes a [`Packet`](keystone_core::Packet)
//! 2. The connection's interceptor dispatches it to consumers on the
//!    authoritative thread
//! 3. If no consumer cancelled it, the [`TerminalStage`] receives it
//! 4. Replies queued with [`WsPipeline::queue`] are intercepted as
//!    outbound messages before they are written
//!
//! Messages written with [`Core::send`](keystone_core::Core::send) skip
//! step 4.

pub mod config;
pub mod error;
pub mod pipeline;
pub mod server;
pub mod terminal;

pub use config::HostConfig;
pub use error::HostError;
pub use pipeline::{Outbound, WsPipeline, CODEC_STAGE, TERMINAL_STAGE};
pub use server::HostServer;
pub use terminal::{LoggingTerminal, TerminalStage};
