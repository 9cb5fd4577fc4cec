use bytes::Bytes;
use gandalf_common::Error;
use gandalf_protocol::openai::Usage;

pub type Headers = Vec<(String, String)>;

pub fn header_set(headers: &mut Headers, name: impl Into<String>, value: impl Into<String>) {
    let name = name.into();
    let value = value.into();
    let key = name.to_ascii_lowercase();
    if let Some((_, v)) = headers
        .iter_mut()
        .find(|(k, _)| k.to_ascii_lowercase() == key)
    {
        *v = value;
        return;
    }
    headers.push((name, value));
}

pub fn header_get<'a>(headers: &'a Headers, name: &str) -> Option<&'a str> {
    let key = name.to_ascii_lowercase();
    headers
        .iter()
        .find(|(k, _)| k.to_ascii_lowercase() == key)
        .map(|(_, v)| v.as_str())
}

pub fn header_remove(headers: &mut Headers, name: &str) -> Option<String> {
    let key = name.to_ascii_lowercase();
    let idx = headers
        .iter()
        .position(|(k, _)| k.to_ascii_lowercase() == key)?;
    Some(headers.remove(idx).1)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HttpMethod {
    Get,
    Post,
    Put,
    Patch,
    Delete,
}

impl HttpMethod {
    pub fn as_str(&self) -> &'static str {
        match self {
            HttpMethod::Get => "GET",
            HttpMethod::Post => "POST",
            HttpMethod::Put => "PUT",
            HttpMethod::Patch => "PATCH",
            HttpMethod::Delete => "DELETE",
        }
    }

    pub fn parse(method: &str) -> Option<Self> {
        if method.eq_ignore_ascii_case("GET") {
            Some(HttpMethod::Get)
        } else if method.eq_ignore_ascii_case("POST") {
            Some(HttpMethod::Post)
        } else if method.eq_ignore_ascii_case("PUT") {
            Some(HttpMethod::Put)
        } else if method.eq_ignore_ascii_case("PATCH") {
            Some(HttpMethod::Patch)
        } else if method.eq_ignore_ascii_case("DELETE") {
            Some(HttpMethod::Delete)
        } else {
            None
        }
    }
}

/// Adapter family. Native passthrough selects providers by kind, not name.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProviderKind {
    OpenAi,
    Azure,
    Anthropic,
    Gemini,
    Ollama,
}

impl ProviderKind {
    pub fn parse(kind: &str) -> Option<Self> {
        match kind {
            "openai" => Some(ProviderKind::OpenAi),
            "azure" => Some(ProviderKind::Azure),
            "anthropic" => Some(ProviderKind::Anthropic),
            "gemini" => Some(ProviderKind::Gemini),
            "ollama" => Some(ProviderKind::Ollama),
            _ => None,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            ProviderKind::OpenAi => "openai",
            ProviderKind::Azure => "azure",
            ProviderKind::Anthropic => "anthropic",
            ProviderKind::Gemini => "gemini",
            ProviderKind::Ollama => "ollama",
        }
    }
}

/// Request-scoped context threaded into every adapter call.
#[derive(Debug, Clone)]
pub struct ProviderCtx {
    pub request_id: String,
}

/// Non-stream upstream result: the marshaled response body plus the usage
/// the adapter extracted from it.
#[derive(Debug, Clone)]
pub struct ChatResponse {
    pub body: Bytes,
    pub usage: Option<Usage>,
}

/// One element of a translated stream.
///
/// `data` carries the OpenAI-shaped chunk payload (without SSE framing);
/// `usage` rides on whichever chunk observed it; exactly one of `done` or
/// `err` terminates the stream, and channel close without a sentinel is
/// equivalent to `done`.
#[derive(Debug, Default)]
pub struct StreamChunk {
    pub data: Option<Bytes>,
    pub usage: Option<Usage>,
    pub done: bool,
    pub err: Option<Error>,
}

impl StreamChunk {
    pub fn data(data: impl Into<Bytes>) -> Self {
        Self {
            data: Some(data.into()),
            ..Self::default()
        }
    }

    pub fn done() -> Self {
        Self {
            done: true,
            ..Self::default()
        }
    }

    pub fn usage(usage: Usage) -> Self {
        Self {
            usage: Some(usage),
            ..Self::default()
        }
    }

    pub fn err(err: Error) -> Self {
        Self {
            err: Some(err),
            ..Self::default()
        }
    }
}

pub type ChunkStream = tokio::sync::mpsc::Receiver<StreamChunk>;

#[derive(Debug)]
pub enum UpstreamBody {
    Bytes(Bytes),
    Stream(tokio::sync::mpsc::Receiver<Bytes>),
}

/// Raw provider-format exchange forwarded by the native passthrough.
#[derive(Debug)]
pub struct NativeProxyRequest {
    pub method: HttpMethod,
    /// Path relative to the provider base URL, already validated upstream.
    pub path: String,
    pub query: Option<String>,
    pub headers: Headers,
    pub body: Option<Bytes>,
    pub is_stream_hint: bool,
}

#[derive(Debug)]
pub struct NativeProxyResponse {
    pub status: u16,
    pub headers: Headers,
    pub body: UpstreamBody,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn header_helpers_are_case_insensitive() {
        let mut headers: Headers = vec![("Content-Type".to_string(), "text/plain".to_string())];
        header_set(&mut headers, "content-type", "application/json");
        assert_eq!(headers.len(), 1);
        assert_eq!(header_get(&headers, "CONTENT-TYPE"), Some("application/json"));
        assert_eq!(
            header_remove(&mut headers, "Content-Type").as_deref(),
            Some("application/json")
        );
        assert!(headers.is_empty());
    }

    #[test]
    fn provider_kind_round_trip() {
        for kind in ["openai", "azure", "anthropic", "gemini", "ollama"] {
            assert_eq!(ProviderKind::parse(kind).unwrap().as_str(), kind);
        }
        assert!(ProviderKind::parse("bedrock").is_none());
    }
}
