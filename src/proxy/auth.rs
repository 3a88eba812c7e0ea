use crate::config::BridgeConfig;
use base64::Engine;
use http::HeaderMap;
use serde::Deserialize;

/// Header carrying the platform-provided principal (base64 JSON).
pub const PRINCIPAL_HEADER: &str = "x-ms-client-principal";

/// Claim type whose values are matched against `required_groups`.
const GROUPS_CLAIM: &str = "groups";

/// Decoded identity from the platform principal header.
#[derive(Debug, Clone, Deserialize)]
pub struct Principal {
    #[serde(default, rename = "userId")]
    pub user_id: Option<String>,
    #[serde(default)]
    pub claims: Vec<Claim>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct Claim {
    #[serde(default)]
    pub typ: String,
    #[serde(default)]
    pub val: String,
}

impl Principal {
    pub fn has_group(&self, required: &[String]) -> bool {
        self.claims
            .iter()
            .any(|c| c.typ == GROUPS_CLAIM && required.contains(&c.val))
    }
}

/// Decode the principal header value: base64, then JSON. Returns `None` on
/// any decoding failure; a garbled principal is treated as absent.
pub fn decode_principal(value: &str) -> Option<Principal> {
    let bytes = base64::engine::general_purpose::STANDARD
        .decode(value.trim())
        .ok()?;
    serde_json::from_slice(&bytes).ok()
}

pub fn extract_principal(headers: &HeaderMap) -> Option<Principal> {
    headers
        .get(PRINCIPAL_HEADER)
        .and_then(|v| v.to_str().ok())
        .and_then(decode_principal)
}

/// Paths that never require authorization.
pub fn is_exempt_path(path: &str) -> bool {
    matches!(path, "/health" | "/status" | "/metrics")
}

/// Requests arriving via localhost are trusted.
pub fn is_localhost(host: &str) -> bool {
    let host = host.split(':').next().unwrap_or(host);
    host == "localhost" || host == "127.0.0.1" || host == "[::1]" || host == "::1"
}

/// Authorization check for one request. Passes when no API key is
/// configured, when the client presents the key as a bearer token, or when
/// the decoded principal carries an accepted group claim.
pub fn authorize(
    config: &BridgeConfig,
    headers: &HeaderMap,
    principal: Option<&Principal>,
) -> Result<(), &'static str> {
    let Some(api_key) = &config.api_key else {
        return Ok(());
    };

    let bearer = headers
        .get(http::header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.strip_prefix("Bearer "));
    if bearer == Some(api_key.as_str()) {
        return Ok(());
    }

    if let Some(principal) = principal {
        if principal.has_group(&config.required_groups) {
            return Ok(());
        }
    }

    Err("missing or invalid credentials")
}

#[cfg(test)]
mod tests {
    use super::*;

    fn encode_principal(json: &str) -> String {
        base64::engine::general_purpose::STANDARD.encode(json)
    }

    fn config_with_key(required_groups: &[&str]) -> BridgeConfig {
        BridgeConfig {
            api_key: Some("sekrit".into()),
            required_groups: required_groups.iter().map(|s| s.to_string()).collect(),
            ..BridgeConfig::default()
        }
    }

    #[test]
    fn decodes_principal_with_claims() {
        let encoded = encode_principal(
            r#"{"userId": "alice", "claims": [{"typ": "groups", "val": "readers"}]}"#,
        );
        let principal = decode_principal(&encoded).unwrap();
        assert_eq!(principal.user_id.as_deref(), Some("alice"));
        assert!(principal.has_group(&["readers".to_string()]));
        assert!(!principal.has_group(&["writers".to_string()]));
    }

    #[test]
    fn garbled_principal_is_none() {
        assert!(decode_principal("!!not base64!!").is_none());
        assert!(decode_principal(&base64::engine::general_purpose::STANDARD.encode("not json")).is_none());
    }

    #[test]
    fn no_api_key_means_open() {
        let config = BridgeConfig::default();
        assert!(authorize(&config, &HeaderMap::new(), None).is_ok());
    }

    #[test]
    fn bearer_key_passes() {
        let config = config_with_key(&[]);
        let mut headers = HeaderMap::new();
        headers.insert(
            http::header::AUTHORIZATION,
            "Bearer sekrit".parse().unwrap(),
        );
        assert!(authorize(&config, &headers, None).is_ok());
    }

    #[test]
    fn wrong_bearer_key_fails() {
        let config = config_with_key(&[]);
        let mut headers = HeaderMap::new();
        headers.insert(http::header::AUTHORIZATION, "Bearer nope".parse().unwrap());
        assert!(authorize(&config, &headers, None).is_err());
    }

    #[test]
    fn group_claim_passes_without_key() {
        let config = config_with_key(&["readers", "admins"]);
        let encoded =
            encode_principal(r#"{"claims": [{"typ": "groups", "val": "admins"}]}"#);
        let principal = decode_principal(&encoded);
        assert!(authorize(&config, &HeaderMap::new(), principal.as_ref()).is_ok());
    }

    #[test]
    fn non_group_claim_fails() {
        let config = config_with_key(&["readers"]);
        let encoded = encode_principal(r#"{"claims": [{"typ": "roles", "val": "readers"}]}"#);
        let principal = decode_principal(&encoded);
        assert!(authorize(&config, &HeaderMap::new(), principal.as_ref()).is_err());
    }

    #[test]
    fn exemptions() {
        assert!(is_exempt_path("/health"));
        assert!(is_exempt_path("/status"));
        assert!(is_exempt_path("/metrics"));
        assert!(!is_exempt_path("/model"));
        assert!(is_localhost("localhost:8080"));
        assert!(is_localhost("127.0.0.1"));
        assert!(!is_localhost("bridge.example.com"));
    }
}
