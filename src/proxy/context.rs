use crate::proxy::auth::Principal;
use bytes::Bytes;
use http::{HeaderMap, StatusCode};
use http_body_util::{BodyExt, Full};
use rand::RngCore;
use serde_json::json;
use std::net::IpAddr;
use std::time::Instant;

pub type BoxBody = http_body_util::combinators::BoxBody<Bytes, hyper::Error>;

pub fn full_body(data: impl Into<Bytes>) -> BoxBody {
    Full::new(data.into())
        .map_err(|never| match never {})
        .boxed()
}

pub fn empty_body() -> BoxBody {
    Full::new(Bytes::new())
        .map_err(|never| match never {})
        .boxed()
}

/// Lower-hex random identifier of `bytes` random bytes.
fn random_hex(bytes: usize) -> String {
    let mut buf = vec![0u8; bytes];
    rand::thread_rng().fill_bytes(&mut buf);
    let mut out = String::with_capacity(bytes * 2);
    for b in buf {
        out.push_str(&format!("{:02x}", b));
    }
    out
}

pub fn random_request_id() -> String {
    random_hex(8)
}

pub fn random_correlation_id() -> String {
    random_hex(16)
}

/// Fresh W3C Trace Context header: `00-{32hex}-{16hex}-01`.
pub fn synthesize_traceparent() -> String {
    format!("00-{}-{}-01", random_hex(16), random_hex(8))
}

/// Accept an inbound traceparent only if it has the W3C shape; anything
/// malformed is replaced with a fresh one rather than propagated.
pub fn is_valid_traceparent(value: &str) -> bool {
    let mut parts = value.split('-');
    let (Some(version), Some(trace_id), Some(parent_id), Some(flags)) =
        (parts.next(), parts.next(), parts.next(), parts.next())
    else {
        return false;
    };
    parts.next().is_none()
        && version.len() == 2
        && trace_id.len() == 32
        && parent_id.len() == 16
        && flags.len() == 2
        && [version, trace_id, parent_id, flags]
            .iter()
            .all(|s| s.chars().all(|c| c.is_ascii_hexdigit()))
}

/// Per-request context: identity of the request across the bridge and its
/// upstream call, plus timing for metrics and the access log. Created per
/// inbound request, dropped when the response completes.
pub struct RequestContext {
    pub request_id: String,
    pub correlation_id: String,
    pub traceparent: String,
    pub user: Option<Principal>,
    pub method: String,
    pub path: String,
    pub group_type: String,
    pub upstream_url: String,
    pub client_ip: IpAddr,
    pub start: Instant,
    pub upstream_start: Option<Instant>,
}

impl RequestContext {
    /// Build the context from inbound headers: correlation id and
    /// traceparent are taken from the client when present (and well-formed,
    /// for the latter), freshly generated otherwise. The request id is
    /// always fresh.
    pub fn new(headers: &HeaderMap, method: String, path: String, client_ip: IpAddr) -> Self {
        let correlation_id = headers
            .get("x-correlation-id")
            .and_then(|v| v.to_str().ok())
            .filter(|v| !v.is_empty())
            .map(|v| v.to_string())
            .unwrap_or_else(random_correlation_id);

        let traceparent = headers
            .get("traceparent")
            .and_then(|v| v.to_str().ok())
            .filter(|v| is_valid_traceparent(v))
            .map(|v| v.to_string())
            .unwrap_or_else(synthesize_traceparent);

        Self {
            request_id: random_request_id(),
            correlation_id,
            traceparent,
            user: None,
            method,
            path,
            group_type: String::new(),
            upstream_url: String::new(),
            client_ip,
            start: Instant::now(),
            upstream_start: None,
        }
    }

    /// The 32-hex trace-id portion of the traceparent.
    pub fn trace_id(&self) -> &str {
        self.traceparent
            .split('-')
            .nth(1)
            .unwrap_or(&self.traceparent)
    }

    /// JSON error response. Metrics and the access log are stamped once at
    /// the handler's single exit point, not here.
    pub fn error_response(&self, status: StatusCode, body: serde_json::Value) -> hyper::Response<BoxBody> {
        hyper::Response::builder()
            .status(status)
            .header("content-type", "application/json")
            .body(full_body(body.to_string()))
            .unwrap()
    }

    /// 502 with a traceable structured body.
    pub fn bad_gateway(&self, message: &str) -> hyper::Response<BoxBody> {
        self.error_response(
            StatusCode::BAD_GATEWAY,
            json!({
                "error": "Bad Gateway",
                "message": message,
                "groupType": self.group_type,
                "traceId": self.trace_id(),
                "correlationId": self.correlation_id,
            }),
        )
    }

    pub fn unknown_group_type(&self, group_type: &str) -> hyper::Response<BoxBody> {
        self.error_response(
            StatusCode::NOT_FOUND,
            json!({
                "error": "unknown group type",
                "groupType": group_type,
            }),
        )
    }

    pub fn unauthorized(&self, message: &str) -> hyper::Response<BoxBody> {
        self.error_response(
            StatusCode::UNAUTHORIZED,
            json!({
                "error": "unauthorized",
                "message": message,
            }),
        )
    }

    /// Record final request metrics.
    pub fn finalize_metrics(&self, resp_status: u16) {
        let mut buf = itoa::Buffer::new();
        let status_str = buf.format(resp_status);

        metrics::counter!(
            "bridge_http_requests_total",
            "group_type" => self.group_type.clone(),
            "method" => self.method.clone(),
            "status_code" => status_str.to_owned(),
            "upstream" => self.upstream_url.clone(),
        )
        .increment(1);

        metrics::histogram!(
            "bridge_http_request_duration_seconds",
            "group_type" => self.group_type.clone(),
            "upstream" => self.upstream_url.clone(),
        )
        .record(self.start.elapsed().as_secs_f64());

        if let Some(upstream_start) = self.upstream_start {
            metrics::histogram!(
                "bridge_upstream_request_duration_seconds",
                "group_type" => self.group_type.clone(),
                "upstream" => self.upstream_url.clone(),
            )
            .record(upstream_start.elapsed().as_secs_f64());
        }
    }

    /// One structured access-log line per request.
    pub fn access_log(&self, status: u16) {
        tracing::info!(
            client_ip = %self.client_ip,
            method = %self.method,
            path = %self.path,
            status = status,
            group_type = %self.group_type,
            upstream = %self.upstream_url,
            latency_ms = %self.start.elapsed().as_millis(),
            request_id = %self.request_id,
            correlation_id = %self.correlation_id,
            "access"
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn synthesized_traceparent_has_w3c_shape() {
        let tp = synthesize_traceparent();
        assert!(is_valid_traceparent(&tp));
        assert!(tp.starts_with("00-"));
        assert!(tp.ends_with("-01"));
        assert_eq!(tp.len(), 2 + 1 + 32 + 1 + 16 + 1 + 2);
    }

    #[test]
    fn traceparent_validation_rejects_malformed() {
        assert!(is_valid_traceparent(
            "00-0af7651916cd43dd8448eb211c80319c-b7ad6b7169203331-01"
        ));
        assert!(!is_valid_traceparent("not-a-traceparent"));
        assert!(!is_valid_traceparent(""));
        assert!(!is_valid_traceparent(
            "00-zzf7651916cd43dd8448eb211c80319c-b7ad6b7169203331-01"
        ));
        assert!(!is_valid_traceparent("00-abcd-b7ad6b7169203331-01"));
    }

    #[test]
    fn inbound_ids_are_propagated() {
        let mut headers = HeaderMap::new();
        headers.insert("x-correlation-id", "corr-123".parse().unwrap());
        headers.insert(
            "traceparent",
            "00-0af7651916cd43dd8448eb211c80319c-b7ad6b7169203331-01"
                .parse()
                .unwrap(),
        );

        let ctx = RequestContext::new(
            &headers,
            "GET".into(),
            "/npmregs/x".into(),
            "127.0.0.1".parse().unwrap(),
        );
        assert_eq!(ctx.correlation_id, "corr-123");
        assert_eq!(ctx.trace_id(), "0af7651916cd43dd8448eb211c80319c");
        assert_eq!(ctx.request_id.len(), 16);
    }

    #[test]
    fn malformed_traceparent_is_replaced() {
        let mut headers = HeaderMap::new();
        headers.insert("traceparent", "garbage".parse().unwrap());

        let ctx = RequestContext::new(
            &headers,
            "GET".into(),
            "/".into(),
            "127.0.0.1".parse().unwrap(),
        );
        assert!(is_valid_traceparent(&ctx.traceparent));
        assert_ne!(ctx.traceparent, "garbage");
    }
}
