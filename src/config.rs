//! Agent configuration

/// Immutable options for a tunnel client session.
///
/// Constructed once by the caller (typically the CLI front-end, out of
/// scope here) and handed to [`crate::session::TunnelSession::connect`].
#[derive(Debug, Clone)]
pub struct TunnelClientOptions {
    /// Base URL of the tunnel server, e.g. `https://tunnl.fit`
    pub server_url: String,

    /// Local port the private HTTP service listens on
    pub local_port: u16,

    /// Hint for the subdomain the server should assign
    pub subdomain: Option<String>,

    /// Authentication token presented in the `CONNECT` frame
    pub token: Option<String>,

    /// Whether the session should reconnect automatically on disconnect
    pub reconnect: bool,

    /// Build-embedded agent version reported in the `CONNECT` frame
    pub agent_version: String,
}

impl TunnelClientOptions {
    /// Construct options with the defaults documented in the spec:
    /// `reconnect = true`, `server_url = "https://tunnl.fit"`.
    pub fn new(local_port: u16, agent_version: impl Into<String>) -> Self {
        Self {
            server_url: "https://tunnl.fit".to_string(),
            local_port,
            subdomain: None,
            token: None,
            reconnect: true,
            agent_version: agent_version.into(),
        }
    }

    /// Derive the control-channel WebSocket URL (`{server_url}/agent`),
    /// rewriting the `http(s)` scheme to `ws(s)`.
    pub fn control_channel_url(&self) -> Result<String, crate::error::AgentError> {
        let mut url = url::Url::parse(&self.server_url)
            .map_err(|e| crate::error::AgentError::InvalidConfig(e.to_string()))?;

        let scheme = match url.scheme() {
            "https" => "wss",
            "http" => "ws",
            other => {
                return Err(crate::error::AgentError::InvalidConfig(format!(
                    "unsupported server_url scheme: {other}"
                )))
            }
        };
        url.set_scheme(scheme)
            .map_err(|_| crate::error::AgentError::InvalidConfig("invalid scheme".to_string()))?;
        url.set_path("/agent");

        Ok(url.to_string())
    }
}
