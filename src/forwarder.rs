//! Forwards one framed HTTP request to the local service (§4.2).

use std::time::Duration;

use crate::error::ForwarderError;
use crate::message::{Headers, RequestMetadata};

/// Request headers that are either re-derived by the HTTP library or
/// inapplicable to a point-to-point request and must be stripped before
/// forwarding.
const FILTERED_HEADERS: &[&str] = &["host", "connection", "transfer-encoding", "content-length"];

/// The local service's response, ready to be framed as a `RESPONSE`.
#[derive(Debug, Clone)]
pub struct ForwardResponse {
    pub status_code: u16,
    pub status_message: String,
    pub headers: Headers,
    pub body: Vec<u8>,
}

/// Issues one outbound HTTP request to the local service per inbound
/// framed request.
pub struct HttpForwarder {
    client: reqwest::Client,
    local_port: u16,
}

impl HttpForwarder {
    /// Build a forwarder targeting `http://localhost:{local_port}`.
    ///
    /// Redirects are disabled (the tunnel server, not the forwarder,
    /// decides what to do with a 3xx) and the request timeout is kept at
    /// or above the 30s heartbeat cadence so a slow local service is never
    /// penalized before the channel itself would notice trouble.
    pub fn new(local_port: u16) -> Self {
        let client = reqwest::Client::builder()
            .redirect(reqwest::redirect::Policy::none())
            .timeout(Duration::from_secs(35))
            .build()
            .expect("reqwest client configuration is valid");

        Self { client, local_port }
    }

    /// Forward one request to the local service.
    pub async fn forward(
        &self,
        metadata: &RequestMetadata,
        body: Vec<u8>,
    ) -> Result<ForwardResponse, ForwarderError> {
        let url = self.target_url(&metadata.path, &metadata.query);

        let method = reqwest::Method::from_bytes(metadata.method.as_bytes())
            .unwrap_or(reqwest::Method::GET);

        let mut request = self.client.request(method, url);
        for (name, value) in filter_headers(&metadata.headers) {
            request = request.header(name, value);
        }
        request = request.body(body);

        let response = request.send().await.map_err(|e| self.map_error(e))?;

        let status_code = response.status().as_u16();
        let status_message = response
            .status()
            .canonical_reason()
            .unwrap_or_default()
            .to_string();
        let headers = response
            .headers()
            .iter()
            .map(|(name, value)| {
                (
                    name.as_str().to_string(),
                    value.to_str().unwrap_or_default().to_string(),
                )
            })
            .collect();
        let body = response.bytes().await.map_err(ForwarderError::Transport)?.to_vec();

        Ok(ForwardResponse {
            status_code,
            status_message,
            headers,
            body,
        })
    }

    fn target_url(&self, path: &str, query: &str) -> String {
        if query.is_empty() {
            format!("http://localhost:{}{}", self.local_port, path)
        } else {
            format!("http://localhost:{}{}?{}", self.local_port, path, query)
        }
    }

    fn map_error(&self, err: reqwest::Error) -> ForwarderError {
        if err.is_connect() {
            ForwarderError::LocalServiceDown {
                port: self.local_port,
            }
        } else if err.is_timeout() {
            ForwarderError::LocalServiceTimeout
        } else {
            ForwarderError::Transport(err)
        }
    }

    /// `HEAD /` liveness probe for the Local-Probe Engine (§4.4).
    ///
    /// Returns `Some(true)` if any HTTP response came back, `Some(false)`
    /// on connection-refused or timeout, and `None` for any other error
    /// (per spec, such errors are silently ignored and no ping is sent).
    pub async fn probe_liveness(&self) -> Option<bool> {
        let url = format!("http://localhost:{}/", self.local_port);
        let result = self
            .client
            .head(url)
            .header("User-Agent", "Tunnel-Agent-Ping")
            .send()
            .await;

        match result {
            Ok(_) => Some(true),
            Err(e) if e.is_connect() || e.is_timeout() => Some(false),
            Err(_) => None,
        }
    }
}

/// Case-insensitively drop headers in [`FILTERED_HEADERS`].
fn filter_headers(headers: &Headers) -> Vec<(&str, &str)> {
    headers
        .iter()
        .filter(|(name, _)| !FILTERED_HEADERS.iter().any(|f| f.eq_ignore_ascii_case(name)))
        .map(|(name, value)| (name.as_str(), value.as_str()))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn target_url_omits_question_mark_when_query_empty() {
        let forwarder = HttpForwarder::new(3000);
        assert_eq!(forwarder.target_url("/x", ""), "http://localhost:3000/x");
        assert_eq!(
            forwarder.target_url("/x", "a=1"),
            "http://localhost:3000/x?a=1"
        );
    }

    #[test]
    fn filters_hop_by_hop_headers_case_insensitively() {
        let headers = vec![
            ("Host".to_string(), "demo.tunnl.fit".to_string()),
            ("Connection".to_string(), "keep-alive".to_string()),
            ("TRANSFER-ENCODING".to_string(), "chunked".to_string()),
            ("content-length".to_string(), "5".to_string()),
            ("user-agent".to_string(), "curl/8".to_string()),
        ];

        let filtered = filter_headers(&headers);
        assert_eq!(filtered, vec![("user-agent", "curl/8")]);
    }

    #[tokio::test]
    async fn connection_refused_maps_to_local_service_down() {
        // Nothing listens on this high port in the test sandbox.
        let forwarder = HttpForwarder::new(1);
        let metadata = RequestMetadata {
            method: "GET".to_string(),
            path: "/".to_string(),
            query: String::new(),
            headers: vec![],
        };

        let err = forwarder.forward(&metadata, vec![]).await.unwrap_err();
        assert!(matches!(err, ForwarderError::LocalServiceDown { port: 1 }));
    }
}
