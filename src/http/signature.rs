//! Request signatures for deduplication and response caching.

use sha2::{Digest, Sha256};

use super::transport::{HttpMethod, RequestBody};

/// Deterministic identity of an outbound request.
///
/// Derived from (method, normalized URL, sorted query parameters,
/// serialized body). Two calls with the same signature are the same
/// request: concurrent ones share a single in-flight future, and GET
/// responses are cached under the same key.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct RequestSignature(String);

impl RequestSignature {
    /// Computes the signature for a request.
    ///
    /// Query parameters are sorted so `?a=1&b=2` and `?b=2&a=1` collide;
    /// multipart bodies hash part metadata and content so distinct uploads
    /// never deduplicate against each other.
    #[must_use]
    pub fn compute(
        method: HttpMethod,
        url: &str,
        query: Option<&[(String, String)]>,
        body: &RequestBody,
    ) -> Self {
        let mut hasher = Sha256::new();
        hasher.update(method.as_str().as_bytes());
        hasher.update(b"\n");
        hasher.update(url.trim_end_matches('/').as_bytes());
        hasher.update(b"\n");

        if let Some(query) = query {
            let mut pairs: Vec<&(String, String)> = query.iter().collect();
            pairs.sort();
            for (key, value) in pairs {
                hasher.update(key.as_bytes());
                hasher.update(b"=");
                hasher.update(value.as_bytes());
                hasher.update(b"&");
            }
        }
        hasher.update(b"\n");

        match body {
            RequestBody::Empty => {}
            RequestBody::Json(value) => {
                // serde_json object keys keep insertion order; serialize
                // through a sorted map so logically equal bodies collide
                hasher.update(canonical_json(value).as_bytes());
            }
            RequestBody::Multipart(parts) => {
                for part in parts {
                    hasher.update(part.name.as_bytes());
                    hasher.update(part.file_name.as_bytes());
                    hasher.update(&part.data);
                }
            }
        }

        let digest = hasher.finalize();
        let mut out = String::with_capacity(7 + digest.len() * 2);
        out.push_str(method.as_str());
        out.push(':');
        for byte in digest {
            use std::fmt::Write;
            let _ = write!(out, "{byte:02x}");
        }
        Self(out)
    }

    /// Returns the signature as a string key.
    #[inline]
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for RequestSignature {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

/// Serializes JSON with object keys sorted at every level.
fn canonical_json(value: &serde_json::Value) -> String {
    use serde_json::Value;
    match value {
        Value::Object(map) => {
            let mut keys: Vec<&String> = map.keys().collect();
            keys.sort();
            let body: Vec<String> = keys
                .into_iter()
                .map(|k| format!("{}:{}", k, canonical_json(&map[k])))
                .collect();
            format!("{{{}}}", body.join(","))
        }
        Value::Array(items) => {
            let body: Vec<String> = items.iter().map(canonical_json).collect();
            format!("[{}]", body.join(","))
        }
        other => other.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_identical_requests_share_signature() {
        let a = RequestSignature::compute(HttpMethod::Get, "https://api/x", None, &RequestBody::Empty);
        let b = RequestSignature::compute(HttpMethod::Get, "https://api/x", None, &RequestBody::Empty);
        assert_eq!(a, b);
    }

    #[test]
    fn test_method_and_url_discriminate() {
        let get = RequestSignature::compute(HttpMethod::Get, "https://api/x", None, &RequestBody::Empty);
        let post =
            RequestSignature::compute(HttpMethod::Post, "https://api/x", None, &RequestBody::Empty);
        let other =
            RequestSignature::compute(HttpMethod::Get, "https://api/y", None, &RequestBody::Empty);
        assert_ne!(get, post);
        assert_ne!(get, other);
    }

    #[test]
    fn test_query_order_is_normalized() {
        let q1 = vec![("a".to_string(), "1".to_string()), ("b".to_string(), "2".to_string())];
        let q2 = vec![("b".to_string(), "2".to_string()), ("a".to_string(), "1".to_string())];
        let s1 = RequestSignature::compute(HttpMethod::Get, "https://api/x", Some(&q1), &RequestBody::Empty);
        let s2 = RequestSignature::compute(HttpMethod::Get, "https://api/x", Some(&q2), &RequestBody::Empty);
        assert_eq!(s1, s2);
    }

    #[test]
    fn test_body_key_order_is_normalized() {
        let b1 = RequestBody::Json(json!({"x": 1, "y": {"a": true, "b": null}}));
        let b2 = RequestBody::Json(json!({"y": {"b": null, "a": true}, "x": 1}));
        let s1 = RequestSignature::compute(HttpMethod::Post, "https://api/x", None, &b1);
        let s2 = RequestSignature::compute(HttpMethod::Post, "https://api/x", None, &b2);
        assert_eq!(s1, s2);

        let b3 = RequestBody::Json(json!({"x": 2, "y": {"a": true, "b": null}}));
        let s3 = RequestSignature::compute(HttpMethod::Post, "https://api/x", None, &b3);
        assert_ne!(s1, s3);
    }

    #[test]
    fn test_trailing_slash_is_normalized() {
        let a = RequestSignature::compute(HttpMethod::Get, "https://api/x/", None, &RequestBody::Empty);
        let b = RequestSignature::compute(HttpMethod::Get, "https://api/x", None, &RequestBody::Empty);
        assert_eq!(a, b);
    }
}
