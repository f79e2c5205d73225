//! The cached form of a response, and its wire encoding.
//!
//! The body is kept as the exact text the origin produced, so a hit sends
//! back the same bytes as the miss that filled the entry. End-to-end headers
//! travel with it; hop-by-hop headers and `Content-Length` are rebuilt when
//! the response is written.

use serde::{Deserialize, Serialize};
use thiserror::Error;

use super::middleware::CACHE_STATUS_HEADER;
use crate::http::{Response, StatusCode};

#[derive(Debug, Error)]
pub enum CodecError {
    #[error("failed to encode cached response: {0}")]
    Encode(#[source] serde_json::Error),

    #[error("failed to decode cached response: {0}")]
    Decode(#[source] serde_json::Error),

    #[error("cached status {0} is not a known status code")]
    UnknownStatus(u16),
}

// Connection-scoped headers plus the ones the writer computes itself.
const UNCACHED_HEADERS: &[&str] = &[
    "connection",
    "keep-alive",
    "proxy-authenticate",
    "proxy-authorization",
    "proxy-connection",
    "te",
    "trailer",
    "transfer-encoding",
    "upgrade",
    "content-length",
];

fn is_cached_header(name: &str) -> bool {
    !UNCACHED_HEADERS
        .iter()
        .any(|skip| name.eq_ignore_ascii_case(skip))
        && !name.eq_ignore_ascii_case(CACHE_STATUS_HEADER)
}

/// A response as held by either tier.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CachedResponse {
    pub status: u16,
    /// End-to-end headers in the order the origin set them.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub headers: Vec<(String, String)>,
    pub body: String,
}

impl CachedResponse {
    /// A `200 OK` JSON response.
    pub fn json(value: serde_json::Value) -> Self {
        Self {
            status: StatusCode::Ok.as_u16(),
            headers: vec![("Content-Type".to_owned(), "application/json".to_owned())],
            body: value.to_string(),
        }
    }

    /// Captures `response` if it is worth caching.
    ///
    /// Only 2xx responses with UTF-8 bodies qualify.
    pub fn capture(response: &Response) -> Option<Self> {
        let status = response.status();
        if !status.is_success() {
            return None;
        }

        let body = std::str::from_utf8(response.body_ref()).ok()?;
        let headers = response
            .headers()
            .iter()
            .filter(|(name, _)| is_cached_header(name))
            .map(|(name, value)| (name.to_owned(), value.to_owned()))
            .collect();

        Some(Self {
            status: status.as_u16(),
            headers,
            body: body.to_owned(),
        })
    }

    pub fn content_type(&self) -> Option<&str> {
        self.headers
            .iter()
            .find(|(name, _)| name.eq_ignore_ascii_case("content-type"))
            .map(|(_, value)| value.as_str())
    }

    /// Rebuilds a response to send to the client.
    pub fn to_response(&self) -> Result<Response, CodecError> {
        let status =
            StatusCode::from_u16(self.status).ok_or(CodecError::UnknownStatus(self.status))?;

        let mut response = Response::new(status).body(self.body.as_str());
        for (name, value) in &self.headers {
            response.add_header(name.as_str(), value.as_str());
        }
        Ok(response)
    }
}

/// Serializes a cached response for the remote tier.
pub fn encode(value: &CachedResponse) -> Result<Vec<u8>, CodecError> {
    serde_json::to_vec(value).map_err(CodecError::Encode)
}

/// Inverse of [`encode`].
pub fn decode(bytes: &[u8]) -> Result<CachedResponse, CodecError> {
    serde_json::from_slice(bytes).map_err(CodecError::Decode)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn representative_payloads_survive_encoding() {
        let values = [
            CachedResponse::json(json!({
                "items": [{"id": 1, "name": "lamp", "price": 19.5}, {"id": 2, "tags": []}],
                "page": 1,
                "next": null,
                "unicode": "ünïcødé ✓",
            })),
            CachedResponse::json(json!([])),
            CachedResponse {
                status: 203,
                headers: Vec::new(),
                body: "plain\nmulti-line".into(),
            },
        ];

        for value in values {
            let bytes = encode(&value).unwrap();
            assert_eq!(decode(&bytes).unwrap(), value);
        }
    }

    #[test]
    fn json_bodies_come_back_byte_for_byte() {
        let origin = "{\"version\":2,\"page\":1,\"id\":12345678901234567890123,\n  \"ratio\": 1.50}";
        let response = Response::new(StatusCode::Ok)
            .header("Content-Type", "application/json")
            .body(origin);

        let cached = CachedResponse::capture(&response).unwrap();
        let stored = decode(&encode(&cached).unwrap()).unwrap();
        let replayed = stored.to_response().unwrap();

        assert_eq!(replayed.body_ref(), origin.as_bytes());
        assert_eq!(replayed.content_type(), Some("application/json"));
    }

    #[test]
    fn capture_keeps_end_to_end_headers_only() {
        let response = Response::new(StatusCode::Ok)
            .header("Content-Type", "text/html")
            .header("Cache-Control", "max-age=60")
            .header("ETag", "\"v3\"")
            .header("Set-Cookie", "a=1")
            .header("Set-Cookie", "b=2")
            .header("Connection", "keep-alive")
            .header("Transfer-Encoding", "chunked")
            .header("Content-Length", "2")
            .header("X-Cache", "MISS")
            .body("ok");

        let cached = CachedResponse::capture(&response).unwrap();
        let names: Vec<&str> = cached.headers.iter().map(|(n, _)| n.as_str()).collect();
        assert_eq!(
            names,
            ["Content-Type", "Cache-Control", "ETag", "Set-Cookie", "Set-Cookie"]
        );

        let replayed = cached.to_response().unwrap();
        assert_eq!(replayed.headers().get("etag"), Some("\"v3\""));
        assert_eq!(replayed.headers().get("cache-control"), Some("max-age=60"));
        assert_eq!(replayed.headers().get_all("set-cookie").count(), 2);
        assert_eq!(replayed.headers().get("x-cache"), None);
    }

    #[test]
    fn capture_skips_errors_and_binary() {
        let error = Response::new(StatusCode::NotFound).body("nope");
        assert!(CachedResponse::capture(&error).is_none());

        let binary = Response::new(StatusCode::Ok).body_bytes(vec![0xff, 0xfe, 0x00]);
        assert!(CachedResponse::capture(&binary).is_none());
    }

    #[test]
    fn malformed_json_is_kept_verbatim() {
        let response = Response::new(StatusCode::Ok)
            .header("Content-Type", "application/json")
            .body("{not json");
        let cached = CachedResponse::capture(&response).unwrap();
        assert_eq!(cached.body, "{not json");
        assert_eq!(cached.content_type(), Some("application/json"));
    }

    #[test]
    fn to_response_restores_status_type_and_body() {
        let cached = CachedResponse::json(json!({"id": 7}));
        let response = cached.to_response().unwrap();
        assert_eq!(response.status(), StatusCode::Ok);
        assert_eq!(response.content_type(), Some("application/json"));
        assert_eq!(response.body_ref(), br#"{"id":7}"#);
    }

    #[test]
    fn unknown_status_is_rejected() {
        let cached = CachedResponse {
            status: 299,
            headers: Vec::new(),
            body: String::new(),
        };
        assert!(matches!(cached.to_response(), Err(CodecError::UnknownStatus(299))));
    }

    #[test]
    fn garbage_does_not_decode() {
        assert!(matches!(decode(b"\x00\x01"), Err(CodecError::Decode(_))));
    }
}
