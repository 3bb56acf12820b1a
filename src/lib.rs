//! Client-side agent library for the reverse-tunneling service.
//!
//! A [`session::TunnelSession`] opens a WebSocket control channel to a
//! tunnel server, forwards framed HTTP requests to a local service, and
//! reconnects with exponential backoff on disconnect.

pub mod config;
pub mod error;
pub mod forwarder;
pub mod message;
pub mod normalizer;
pub mod reconnect;
pub mod session;
pub mod transport;

pub use config::TunnelClientOptions;
pub use error::AgentError;
pub use session::TunnelSession;
