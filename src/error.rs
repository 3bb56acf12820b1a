//! Crate-wide error taxonomy

use thiserror::Error;

/// Errors that can occur while forwarding a request to the local service
#[derive(Error, Debug)]
pub enum ForwarderError {
    #[error("Cannot connect to local service on port {port}. Is your service running?")]
    LocalServiceDown { port: u16 },

    #[error("Request to local service timed out")]
    LocalServiceTimeout,

    #[error("Transport error: {0}")]
    Transport(#[from] reqwest::Error),
}

/// Errors surfaced by the tunnel session facade
#[derive(Error, Debug)]
pub enum AgentError {
    #[error("Transport error: {0}")]
    Transport(#[from] tokio_tungstenite::tungstenite::Error),

    #[error("Forwarding error: {0}")]
    Forwarder(#[from] ForwarderError),

    #[error("Protocol error: {0}")]
    Protocol(String),

    #[error("Server error {code}: {message}")]
    Server { code: String, message: String },

    #[error("Reconnection attempts exhausted after {attempts} tries")]
    ExhaustedRetries { attempts: u32 },

    #[error("Session is not connected")]
    NotConnected,

    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),
}

impl From<serde_json::Error> for AgentError {
    fn from(err: serde_json::Error) -> Self {
        AgentError::Protocol(err.to_string())
    }
}
