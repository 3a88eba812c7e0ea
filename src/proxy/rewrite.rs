use serde_json::Value;

/// Canonical-identifier key whose string values must never be rewritten.
const XID_KEY: &str = "xid";

/// Replace every occurrence of `upstream_base` with `bridge_base` in all
/// string values of the tree, except values sitting directly under an `xid`
/// key; those are canonical identifiers and survive byte-identically.
pub fn rewrite_value(value: &mut Value, upstream_base: &str, bridge_base: &str) {
    match value {
        Value::String(s) => {
            if s.contains(upstream_base) {
                *s = s.replace(upstream_base, bridge_base);
            }
        }
        Value::Array(items) => {
            for item in items {
                rewrite_value(item, upstream_base, bridge_base);
            }
        }
        Value::Object(map) => {
            for (key, item) in map.iter_mut() {
                if key == XID_KEY && item.is_string() {
                    continue;
                }
                rewrite_value(item, upstream_base, bridge_base);
            }
        }
        _ => {}
    }
}

/// Parse a JSON body, rewrite upstream URLs to bridge URLs, and
/// re-serialize. A parse failure is returned to the caller, which falls
/// back to the original body; degrading to raw upstream output is
/// preferred over failing the client request.
pub fn rewrite_body(
    body: &[u8],
    upstream_base: &str,
    bridge_base: &str,
) -> Result<Vec<u8>, serde_json::Error> {
    let mut value: Value = serde_json::from_slice(body)?;
    rewrite_value(&mut value, upstream_base, bridge_base);
    serde_json::to_vec(&value)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn rewrites_self_links_but_preserves_xid() {
        let mut doc = json!({
            "self": "http://u:7000/foo/1",
            "xid": "http://u:7000/foo/1",
            "inner": {
                "self": "http://u:7000/foo/1/v/2",
                "xid": "http://u:7000/foo/1/v/2"
            }
        });

        rewrite_value(&mut doc, "http://u:7000", "http://bridge");

        assert_eq!(
            doc,
            json!({
                "self": "http://bridge/foo/1",
                "xid": "http://u:7000/foo/1",
                "inner": {
                    "self": "http://bridge/foo/1/v/2",
                    "xid": "http://u:7000/foo/1/v/2"
                }
            })
        );
    }

    #[test]
    fn rewrites_strings_inside_arrays() {
        let mut doc = json!({
            "links": ["http://u:7000/a", "http://u:7000/b", "unrelated"]
        });
        rewrite_value(&mut doc, "http://u:7000", "http://bridge");
        assert_eq!(
            doc["links"],
            json!(["http://bridge/a", "http://bridge/b", "unrelated"])
        );
    }

    #[test]
    fn rewrites_embedded_occurrences() {
        let mut doc = json!({"docs": "see http://u:7000/foo and http://u:7000/bar"});
        rewrite_value(&mut doc, "http://u:7000", "http://bridge");
        assert_eq!(
            doc["docs"],
            json!("see http://bridge/foo and http://bridge/bar")
        );
    }

    #[test]
    fn body_without_upstream_urls_is_untouched() {
        let doc = json!({"name": "npm", "count": 42, "nested": {"ok": true}});
        let rewritten =
            rewrite_body(doc.to_string().as_bytes(), "http://u:7000", "http://bridge").unwrap();
        assert_eq!(
            serde_json::from_slice::<Value>(&rewritten).unwrap(),
            doc
        );
    }

    #[test]
    fn non_json_body_is_an_error() {
        assert!(rewrite_body(b"<html>hi</html>", "http://u", "http://b").is_err());
    }

    #[test]
    fn other_upstream_prefixes_are_left_alone() {
        let mut doc = json!({"self": "http://other:9000/foo"});
        rewrite_value(&mut doc, "http://u:7000", "http://bridge");
        assert_eq!(doc["self"], json!("http://other:9000/foo"));
    }
}
