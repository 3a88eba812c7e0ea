use serde::{Deserialize, Serialize};

/// One configured upstream registry. Immutable after load; identity is `url`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UpstreamConfig {
    /// Absolute HTTP(S) base URL, no trailing slash.
    pub url: String,

    /// Bearer token presented to the upstream when set.
    #[serde(default, rename = "apiKey")]
    pub api_key: Option<String>,
}

/// The wire shape of the downstreams document: `{"servers": [...]}`.
///
/// `servers` is mandatory here: a document without it (or with a non-array
/// value) is a fatal startup error.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DownstreamsConfig {
    pub servers: Vec<UpstreamConfig>,
}

/// Top-level bridge configuration.
///
/// A plain downstreams file (`{"servers": [...]}`) deserializes into this
/// directly; everything else has defaults and can be overridden per field via
/// environment variables (see `apply_env_overrides`).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BridgeConfig {
    #[serde(default)]
    pub servers: Vec<UpstreamConfig>,

    #[serde(default = "default_port")]
    pub port: u16,

    /// Explicit override for the effective base URL used when rewriting
    /// upstream response bodies. When unset, forwarded headers and the
    /// inbound Host header decide per request.
    #[serde(default)]
    pub base_url: Option<String>,

    /// Name of the header carrying the effective base URL to upstreams.
    #[serde(default = "default_base_url_header")]
    pub base_url_header: String,

    /// When set, clients must present `Authorization: Bearer <key>`
    /// or a principal with a matching group claim.
    #[serde(default)]
    pub api_key: Option<String>,

    /// Principal group claims, any one of which satisfies authorization.
    #[serde(default)]
    pub required_groups: Vec<String>,

    /// Milliseconds to wait before the first probe round.
    #[serde(default = "default_startup_wait_ms")]
    pub startup_wait_ms: u64,

    /// Milliseconds between retry ticks for inactive upstreams.
    #[serde(default = "default_retry_interval_ms")]
    pub retry_interval_ms: u64,

    /// Per-request HTTP timeout for probes and health checks, milliseconds.
    #[serde(default = "default_probe_timeout_ms")]
    pub probe_timeout_ms: u64,

    /// When set, bridge paths begin with this prefix and it is stripped
    /// before upstream dispatch. Read once at startup.
    #[serde(default)]
    pub api_path_prefix: Option<String>,

    /// Group types whose root-document count defaults to 1 when the owning
    /// upstream does not publish one.
    #[serde(default = "default_well_known_groups")]
    pub well_known_groups: Vec<String>,
}

impl Default for BridgeConfig {
    fn default() -> Self {
        Self {
            servers: Vec::new(),
            port: default_port(),
            base_url: None,
            base_url_header: default_base_url_header(),
            api_key: None,
            required_groups: Vec::new(),
            startup_wait_ms: default_startup_wait_ms(),
            retry_interval_ms: default_retry_interval_ms(),
            probe_timeout_ms: default_probe_timeout_ms(),
            api_path_prefix: None,
            well_known_groups: default_well_known_groups(),
        }
    }
}

fn default_port() -> u16 {
    8080
}

fn default_base_url_header() -> String {
    "x-base-url".to_string()
}

fn default_startup_wait_ms() -> u64 {
    60_000
}

fn default_retry_interval_ms() -> u64 {
    60_000
}

fn default_probe_timeout_ms() -> u64 {
    10_000
}

fn default_well_known_groups() -> Vec<String> {
    [
        "javaregistries",
        "dotnetregistries",
        "noderegistries",
        "pythonregistries",
        "containerregistries",
    ]
    .iter()
    .map(|s| s.to_string())
    .collect()
}
