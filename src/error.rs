use std::fmt;

#[derive(Debug)]
#[allow(dead_code)]
pub enum BridgeError {
    Config(String),
    ListenerBind(String),
    Probe(String),
    UpstreamUnavailable(String),
    Rewrite(String),
    Auth(String),
    UnknownGroupType(String),
    Internal(String),
}

impl fmt::Display for BridgeError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BridgeError::Config(msg) => write!(f, "config error: {}", msg),
            BridgeError::ListenerBind(msg) => write!(f, "listener bind error: {}", msg),
            BridgeError::Probe(msg) => write!(f, "upstream probe error: {}", msg),
            BridgeError::UpstreamUnavailable(msg) => write!(f, "upstream unavailable: {}", msg),
            BridgeError::Rewrite(msg) => write!(f, "response rewrite error: {}", msg),
            BridgeError::Auth(msg) => write!(f, "auth error: {}", msg),
            BridgeError::UnknownGroupType(gt) => write!(f, "unknown group type: {}", gt),
            BridgeError::Internal(msg) => write!(f, "internal error: {}", msg),
        }
    }
}

impl std::error::Error for BridgeError {}
