//! Relay URL normalization and validation.
//!
//! Every [`Endpoint`] the engine talks to passes through here so that
//! cosmetic variations (trailing slashes, case) do not produce duplicate
//! connections or duplicate endpoint keys.
//!
//! # Normalization Rules
//!
//! - Remove trailing slashes
//! - Lowercase the scheme and host
//! - Preserve port numbers and paths
//! - Validate websocket scheme (wss:// or ws://)
//!
//! # Filtering Rules
//!
//! URLs taken from other people's relay lists ([`normalize_relay_url`]) are
//! rejected if they point at local or private hosts. URLs the user typed
//! ([`normalize_user_relay`]) are trusted.

use nostr_sdk::RelayUrl;
use yakbak_core::Endpoint;

/// Result of URL normalization.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum NormalizeResult {
    /// URL is valid and normalized.
    Ok(Endpoint),
    /// URL is syntactically invalid.
    Invalid(String),
    /// URL matches a blocklist pattern.
    Blocked(String),
}

impl NormalizeResult {
    /// Returns the endpoint if valid.
    pub fn ok(self) -> Option<Endpoint> {
        match self {
            Self::Ok(endpoint) => Some(endpoint),
            _ => None,
        }
    }

    pub fn is_ok(&self) -> bool {
        matches!(self, Self::Ok(_))
    }
}

/// Normalize a relay URL found in a relay list, applying the blocklist.
///
/// ```ignore
/// use yakbak_sync::relay_url::normalize_relay_url;
///
/// assert_eq!(
///     normalize_relay_url("wss://Relay.Example.COM/").ok().unwrap().as_str(),
///     "wss://relay.example.com"
/// );
/// assert!(normalize_relay_url("wss://localhost:8080").ok().is_none());
/// ```
pub fn normalize_relay_url(url: &str) -> NormalizeResult {
    let normalized = match parse_websocket_url(url) {
        Ok(url) => url,
        Err(reason) => return NormalizeResult::Invalid(reason),
    };

    if let Some(reason) = check_blocklist(&normalized) {
        return NormalizeResult::Blocked(reason);
    }

    NormalizeResult::Ok(Endpoint::new(normalized))
}

/// Normalize a relay the user asked for explicitly.
///
/// A bare host gets a `wss://` scheme. Local and private hosts are allowed.
pub fn normalize_user_relay(input: &str) -> Option<Endpoint> {
    let input = input.trim();
    if input.is_empty() {
        return None;
    }

    let with_scheme = if input.starts_with("wss://") || input.starts_with("ws://") {
        input.to_string()
    } else {
        format!("wss://{input}")
    };

    parse_websocket_url(&with_scheme).ok().map(Endpoint::new)
}

/// Short display form: scheme and trailing slash removed.
pub fn pretty_relay_url(url: &str) -> String {
    let url = url.trim();
    let without_scheme = url
        .strip_prefix("wss://")
        .or_else(|| url.strip_prefix("ws://"))
        .unwrap_or(url);
    without_scheme.trim_end_matches('/').to_string()
}

/// Normalize and deduplicate a list of relay-list URLs, keeping the first
/// `cap` valid ones in their original order.
pub fn normalize_list<'a>(urls: impl IntoIterator<Item = &'a str>, cap: usize) -> Vec<Endpoint> {
    let mut out: Vec<Endpoint> = Vec::new();
    for url in urls {
        if out.len() >= cap {
            break;
        }
        match normalize_relay_url(url) {
            NormalizeResult::Ok(endpoint) => {
                if !out.contains(&endpoint) {
                    out.push(endpoint);
                }
            }
            NormalizeResult::Invalid(reason) | NormalizeResult::Blocked(reason) => {
                tracing::trace!("Skipping relay {}: {}", url, reason);
            }
        }
    }
    out
}

fn parse_websocket_url(url: &str) -> Result<String, String> {
    let url = url.trim();

    if !url.starts_with("wss://") && !url.starts_with("ws://") {
        return Err("URL must start with wss:// or ws://".to_string());
    }

    let parsed = RelayUrl::parse(url).map_err(|e| format!("Invalid relay URL: {}", e))?;

    let mut normalized = parsed.to_string();
    while normalized.ends_with('/') {
        normalized.pop();
    }
    Ok(normalized)
}

/// Returns `Some(reason)` if blocked, `None` if allowed.
fn check_blocklist(url: &str) -> Option<String> {
    let host = extract_host(url);
    let bare_host = host.split(':').next().unwrap_or(host);

    if bare_host.is_empty() {
        return Some("empty host not allowed".to_string());
    }
    if bare_host == "localhost" {
        return Some("localhost not allowed".to_string());
    }
    if bare_host == "0.0.0.0" {
        return Some("unspecified address (0.0.0.0) not allowed".to_string());
    }
    if bare_host.starts_with("127.") {
        return Some("loopback address not allowed".to_string());
    }
    if bare_host.starts_with("192.168.") || bare_host.starts_with("10.") {
        return Some("private IP not allowed".to_string());
    }
    // 172.16.0.0 - 172.31.255.255
    if bare_host.starts_with("172.")
        && let Some(second_octet) = bare_host.split('.').nth(1)
        && let Ok(n) = second_octet.parse::<u8>()
        && (16..=31).contains(&n)
    {
        return Some("private IP (172.16-31.x.x) not allowed".to_string());
    }
    if bare_host.starts_with("169.254.") {
        return Some("link-local address not allowed".to_string());
    }
    if host.starts_with("[::1]")
        || host.starts_with("[fe80:")
        || host.starts_with("[fc")
        || host.starts_with("[fd")
        || host.starts_with("[::ffff:")
    {
        return Some("local IPv6 address not allowed".to_string());
    }
    if bare_host.ends_with(".onion") {
        return Some(".onion addresses not allowed".to_string());
    }
    if bare_host.ends_with(".local") {
        return Some(".local addresses not allowed".to_string());
    }
    if bare_host.contains("umbrel") {
        return Some("umbrel addresses not allowed".to_string());
    }

    None
}

/// Extract the host (and port) portion from a websocket URL.
fn extract_host(url: &str) -> &str {
    let without_scheme = url
        .strip_prefix("wss://")
        .or_else(|| url.strip_prefix("ws://"))
        .unwrap_or(url);

    without_scheme.split('/').next().unwrap_or(without_scheme)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ok(url: &str) -> Option<String> {
        normalize_relay_url(url).ok().map(|e| e.as_str().to_string())
    }

    #[test]
    fn test_normalize_trailing_slash() {
        assert_eq!(ok("wss://relay.example.com/"), Some("wss://relay.example.com".to_string()));
        assert_eq!(ok("wss://relay.example.com///"), Some("wss://relay.example.com".to_string()));
    }

    #[test]
    fn test_normalize_case_and_path() {
        assert_eq!(ok("wss://Relay.Example.COM"), Some("wss://relay.example.com".to_string()));
        assert_eq!(
            ok("wss://relay.example.com/nostr/"),
            Some("wss://relay.example.com/nostr".to_string())
        );
    }

    #[test]
    fn test_normalize_preserves_port() {
        assert_eq!(
            ok("wss://relay.example.com:8080/"),
            Some("wss://relay.example.com:8080".to_string())
        );
    }

    #[test]
    fn test_rejects_non_websocket() {
        assert!(matches!(
            normalize_relay_url("https://relay.example.com"),
            NormalizeResult::Invalid(_)
        ));
    }

    #[test]
    fn test_blocks_local_hosts() {
        for url in [
            "wss://localhost:8080",
            "wss://127.0.0.1",
            "wss://192.168.1.1",
            "wss://10.0.0.1",
            "wss://172.16.0.1",
            "wss://169.254.1.1",
            "wss://something.onion",
            "wss://myserver.local",
            "wss://umbrel.example",
        ] {
            assert!(
                matches!(normalize_relay_url(url), NormalizeResult::Blocked(_)),
                "{url} should be blocked"
            );
        }
        assert!(normalize_relay_url("wss://172.32.0.1").is_ok());
    }

    #[test]
    fn test_user_relay_gets_scheme() {
        assert_eq!(
            normalize_user_relay("nos.lol").unwrap().as_str(),
            "wss://nos.lol"
        );
        assert_eq!(
            normalize_user_relay("ws://localhost:7777/").unwrap().as_str(),
            "ws://localhost:7777"
        );
        assert!(normalize_user_relay("   ").is_none());
    }

    #[test]
    fn test_pretty_relay_url() {
        assert_eq!(pretty_relay_url("wss://relay.damus.io/"), "relay.damus.io");
        assert_eq!(pretty_relay_url("ws://host:7777/path"), "host:7777/path");
    }

    #[test]
    fn test_normalize_list_dedupes_and_caps() {
        let list = normalize_list(
            [
                "wss://a.example/",
                "wss://A.example",
                "wss://localhost",
                "wss://b.example",
                "wss://c.example",
            ],
            2,
        );
        assert_eq!(
            list,
            vec![Endpoint::new("wss://a.example"), Endpoint::new("wss://b.example")]
        );
    }
}
