//! Per-request template context.

use rand::Rng;
use serde::Serialize;
use serde_json::{Map, Value};
use std::collections::BTreeMap;

use crate::events::timestamp;

/// Upper bound (exclusive) of the `randomId` token.
const RANDOM_ID_MAX: u32 = 10_000;

/// Read-only data available to response templates.
#[derive(Debug, Clone, Serialize)]
pub struct RequestContext {
    /// Path parameters from the matched route pattern
    pub params: BTreeMap<String, String>,
    /// Query parameters, repeated keys become arrays
    pub query: Map<String, Value>,
    /// Request body
    pub body: Value,
    /// Request time (RFC 3339, UTC)
    pub now: String,
    /// Random token in `[0, 10000)`
    #[serde(rename = "randomId")]
    pub random_id: u32,
}

impl RequestContext {
    /// Build the context for one request.
    pub fn new(params: &[(String, String)], query_string: Option<&str>, body: Value) -> Self {
        Self {
            params: params.iter().cloned().collect(),
            query: parse_query_string(query_string.unwrap_or("")),
            body,
            now: timestamp(),
            random_id: rand::thread_rng().gen_range(0..RANDOM_ID_MAX),
        }
    }
}

/// Interpret raw request body bytes.
///
/// Empty bodies become `{}`, JSON is parsed, anything else is kept as text.
pub fn parse_body(bytes: &[u8]) -> Value {
    if bytes.iter().all(u8::is_ascii_whitespace) {
        return Value::Object(Map::new());
    }
    serde_json::from_slice(bytes)
        .unwrap_or_else(|_| Value::String(String::from_utf8_lossy(bytes).into_owned()))
}

/// Parse a query string into key-value pairs.
pub fn parse_query_string(query: &str) -> Map<String, Value> {
    let mut params = Map::new();

    for part in query.split('&') {
        if part.is_empty() {
            continue;
        }
        let (key, value) = part.split_once('=').unwrap_or((part, ""));
        let key = urlencoding_decode(key);
        let value = Value::String(urlencoding_decode(value));

        match params.get_mut(&key) {
            Some(Value::Array(values)) => values.push(value),
            Some(existing) => {
                let first = existing.take();
                *existing = Value::Array(vec![first, value]);
            }
            None => {
                params.insert(key, value);
            }
        }
    }

    params
}

/// URL decoding of a query component (`+` is a space).
fn urlencoding_decode(s: &str) -> String {
    let bytes = s.as_bytes();
    let mut decoded = Vec::with_capacity(bytes.len());
    let mut i = 0;

    while i < bytes.len() {
        match bytes[i] {
            b'%' => {
                let byte = s
                    .get(i + 1..i + 3)
                    .and_then(|hex| u8::from_str_radix(hex, 16).ok());
                match byte {
                    Some(byte) => {
                        decoded.push(byte);
                        i += 3;
                    }
                    None => {
                        decoded.push(b'%');
                        i += 1;
                    }
                }
            }
            b'+' => {
                decoded.push(b' ');
                i += 1;
            }
            other => {
                decoded.push(other);
                i += 1;
            }
        }
    }

    String::from_utf8_lossy(&decoded).into_owned()
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_parse_query_string() {
        let params = parse_query_string("foo=bar&baz=qux");
        assert_eq!(params["foo"], "bar");
        assert_eq!(params["baz"], "qux");

        let params = parse_query_string("name=John%20Doe&city=S%C3%A3o+Paulo");
        assert_eq!(params["name"], "John Doe");
        assert_eq!(params["city"], "São Paulo");
    }

    #[test]
    fn test_repeated_and_bare_keys() {
        let params = parse_query_string("tag=a&tag=b&tag=c&flag&&bad=%zz");
        assert_eq!(params["tag"], json!(["a", "b", "c"]));
        assert_eq!(params["flag"], "");
        assert_eq!(params["bad"], "%zz");
    }

    #[test]
    fn test_parse_body() {
        assert_eq!(parse_body(b""), json!({}));
        assert_eq!(parse_body(b"  \n"), json!({}));
        assert_eq!(parse_body(br#"{"name":"John"}"#), json!({ "name": "John" }));
        assert_eq!(parse_body(b"plain text"), json!("plain text"));
    }

    #[test]
    fn test_context_fields() {
        let params = vec![("id".to_string(), "42".to_string())];
        let ctx = RequestContext::new(&params, Some("page=2"), json!({ "a": 1 }));

        assert_eq!(ctx.params["id"], "42");
        assert_eq!(ctx.query["page"], "2");
        assert!(ctx.random_id < RANDOM_ID_MAX);

        let data = serde_json::to_value(&ctx).unwrap();
        assert_eq!(data["params"]["id"], "42");
        assert_eq!(data["body"]["a"], 1);
        assert!(data["randomId"].is_u64());
        assert!(data["now"].is_string());
    }
}
