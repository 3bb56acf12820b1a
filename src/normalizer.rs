//! Repairs malformed `publicUrl` values returned by the tunnel server.
//!
//! The server has been observed to concatenate a port onto the TLD
//! (`demo.tunnl.fit3000:3000`) and to omit the scheme entirely. This
//! module repairs those cases deterministically; see §4.3.

use tracing::warn;

/// TLDs for which `.{tld}{digits}` is collapsed back to `.{tld}` (step 2).
const REPAIRABLE_TLDS: &[&str] = &["com", "net", "org", "io", "dev", "app", "co", "fit"];

/// Repair a `publicUrl` value reported in a `CONNECT_ACK` frame.
///
/// `server_url` is the configured tunnel server address, `subdomain` is
/// the subdomain the server assigned, and `url` is the raw value to
/// repair. Idempotent: `normalize(s, sd, normalize(s, sd, u)) == normalize(s, sd, u)`.
pub fn normalize(server_url: &str, subdomain: &str, url: &str) -> String {
    if url.contains("localhost") || url.contains("127.0.0.1") {
        return url.to_string();
    }

    let server_host = match host_of(server_url) {
        Some(h) => h,
        None => {
            warn!(server_url, "failed to parse server_url, returning public_url unchanged");
            return url.to_string();
        }
    };

    let repaired = strip_trailing_port(&collapse_tld_port(url));

    let repaired = if repaired.contains(&server_host) {
        repaired
    } else {
        let protocol = if server_url.starts_with("https://") {
            "https://"
        } else {
            "http://"
        };
        format!("{protocol}{subdomain}{server_host}")
    };

    force_https(&repaired)
}

/// Collapse `.{tld}{digits}` to `.{tld}` for known TLDs (step 2).
fn collapse_tld_port(input: &str) -> String {
    let mut result = input.to_string();
    for tld in REPAIRABLE_TLDS {
        let needle = format!(".{tld}");
        if let Some(idx) = result.find(&needle) {
            let after = idx + needle.len();
            let digit_end = result[after..]
                .find(|c: char| !c.is_ascii_digit())
                .map(|offset| after + offset)
                .unwrap_or(result.len());
            if digit_end > after {
                result.replace_range(after..digit_end, "");
            }
            break;
        }
    }
    result
}

/// Strip a trailing `:<digits>` port (step 3).
fn strip_trailing_port(input: &str) -> String {
    if let Some(colon) = input.rfind(':') {
        let tail = &input[colon + 1..];
        if !tail.is_empty() && tail.bytes().all(|b| b.is_ascii_digit()) {
            return input[..colon].to_string();
        }
    }
    input.to_string()
}

/// Force the final scheme to `https://` (step 5).
fn force_https(input: &str) -> String {
    if let Some(rest) = input.strip_prefix("https://") {
        format!("https://{rest}")
    } else if let Some(rest) = input.strip_prefix("http://") {
        format!("https://{rest}")
    } else {
        format!("https://{input}")
    }
}

/// Extract the host part of a URL, tolerating a missing scheme.
fn host_of(url: &str) -> Option<String> {
    let with_scheme = if url.contains("://") {
        url.to_string()
    } else {
        format!("https://{url}")
    };
    url::Url::parse(&with_scheme)
        .ok()
        .and_then(|u| u.host_str().map(|h| h.to_string()))
}
