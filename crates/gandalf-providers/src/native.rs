use bytes::Bytes;
use gandalf_common::Result;

use crate::http::{HttpClient, HttpRequest};
use crate::types::{
    Headers, NativeProxyRequest, NativeProxyResponse, UpstreamBody, header_get, header_remove,
    header_set,
};

/// Upper bound for buffered (non-stream) passthrough bodies; contains a
/// misbehaving upstream.
const MAX_BUFFERED_BODY_BYTES: usize = 32 * 1024 * 1024;

const HOP_BY_HOP_HEADERS: &[&str] = &[
    "connection",
    "keep-alive",
    "proxy-authenticate",
    "proxy-authorization",
    "te",
    "trailer",
    "transfer-encoding",
    "upgrade",
    // Framing is re-computed by the server.
    "content-length",
    "host",
];

const CREDENTIAL_HEADERS: &[&str] = &["authorization", "x-api-key", "x-goog-api-key", "api-key"];

/// How the upstream expects its credential.
#[derive(Debug, Clone)]
pub enum CredentialHeader {
    Bearer(String),
    XApiKey(String),
    XGoogApiKey(String),
    ApiKey(String),
    None,
}

impl CredentialHeader {
    pub fn inject(&self, headers: &mut Headers) {
        match self {
            CredentialHeader::Bearer(key) => {
                header_set(headers, "authorization", format!("Bearer {key}"));
            }
            CredentialHeader::XApiKey(key) => header_set(headers, "x-api-key", key.clone()),
            CredentialHeader::XGoogApiKey(key) => {
                header_set(headers, "x-goog-api-key", key.clone());
            }
            CredentialHeader::ApiKey(key) => header_set(headers, "api-key", key.clone()),
            CredentialHeader::None => {}
        }
    }
}

/// Shared raw-forwarding engine used by every adapter's `NativeProxy`.
///
/// Applies the passthrough hygiene contract: hop-by-hop and inbound
/// credential headers are stripped, the upstream credential is injected, the
/// query string is copied, and response headers come back minus hop-by-hop.
pub struct NativeForwarder {
    client: HttpClient,
    base_url: String,
    credential: CredentialHeader,
}

impl NativeForwarder {
    pub fn new(
        client: HttpClient,
        base_url: impl Into<String>,
        credential: CredentialHeader,
    ) -> Self {
        let base_url: String = base_url.into();
        Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
            credential,
        }
    }

    pub async fn forward(&self, req: NativeProxyRequest) -> Result<NativeProxyResponse> {
        let mut headers = req.headers;
        for name in HOP_BY_HOP_HEADERS {
            header_remove(&mut headers, name);
        }
        for name in CREDENTIAL_HEADERS {
            header_remove(&mut headers, name);
        }
        self.credential.inject(&mut headers);

        let path = req.path.trim_start_matches('/');
        let url = match &req.query {
            Some(query) if !query.is_empty() => format!("{}/{path}?{query}", self.base_url),
            _ => format!("{}/{path}", self.base_url),
        };

        let resp = self
            .client
            .send(HttpRequest {
                method: req.method,
                url,
                headers,
                body: req.body,
                want_stream: true,
            })
            .await?;

        let mut response_headers: Headers = resp
            .headers
            .into_iter()
            .filter(|(name, _)| {
                let lower = name.to_ascii_lowercase();
                !HOP_BY_HOP_HEADERS.contains(&lower.as_str())
            })
            .collect();

        let streamy = header_get(&response_headers, "content-type")
            .map(is_stream_content_type)
            .unwrap_or(false);

        let body = match resp.body {
            UpstreamBody::Bytes(bytes) => UpstreamBody::Bytes(bytes),
            UpstreamBody::Stream(rx) if streamy => UpstreamBody::Stream(rx),
            UpstreamBody::Stream(mut rx) => {
                // Bulk responses are buffered with an upper bound; drop the
                // stale length header if the upstream sent one anyway.
                header_remove(&mut response_headers, "content-length");
                let mut buf: Vec<u8> = Vec::new();
                while let Some(chunk) = rx.recv().await {
                    let remaining = MAX_BUFFERED_BODY_BYTES.saturating_sub(buf.len());
                    let take = remaining.min(chunk.len());
                    buf.extend_from_slice(&chunk[..take]);
                    if take < chunk.len() {
                        break;
                    }
                }
                UpstreamBody::Bytes(Bytes::from(buf))
            }
        };

        Ok(NativeProxyResponse {
            status: resp.status,
            headers: response_headers,
            body,
        })
    }
}

fn is_stream_content_type(content_type: &str) -> bool {
    let ct = content_type.to_ascii_lowercase();
    ct.contains("text/event-stream")
        || ct.contains("application/x-ndjson")
        || ct.contains("stream+json")
}

// Path segments taken from inbound URLs; anything else is rejected before
// the forwarder is reached.
pub fn valid_path_segment(segment: &str) -> bool {
    !segment.is_empty()
        && segment.len() <= 256
        && segment
            .bytes()
            .all(|b| b.is_ascii_alphanumeric() || matches!(b, b'.' | b'_' | b'-'))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn stream_content_types() {
        assert!(is_stream_content_type("text/event-stream"));
        assert!(is_stream_content_type("application/x-ndjson"));
        assert!(is_stream_content_type("application/stream+json; charset=utf-8"));
        assert!(!is_stream_content_type("application/json"));
    }

    #[test]
    fn path_segment_validation() {
        assert!(valid_path_segment("gpt-4o"));
        assert!(valid_path_segment("claude-3.5_sonnet"));
        assert!(!valid_path_segment(""));
        assert!(!valid_path_segment("a/b"));
        assert!(!valid_path_segment("a b"));
        assert!(!valid_path_segment(&"x".repeat(257)));
    }

    #[test]
    fn credential_injection_overwrites_bearer() {
        let mut headers: Headers = Vec::new();
        CredentialHeader::Bearer("sk-test".to_string()).inject(&mut headers);
        assert_eq!(header_get(&headers, "authorization"), Some("Bearer sk-test"));

        let mut headers: Headers = Vec::new();
        CredentialHeader::XGoogApiKey("g-key".to_string()).inject(&mut headers);
        assert_eq!(header_get(&headers, "x-goog-api-key"), Some("g-key"));
    }
}
