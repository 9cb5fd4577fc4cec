pub mod anthropic;
pub mod gemini;
pub mod ollama;
pub mod openai;

use std::sync::Arc;

use gandalf_common::{Error, ErrorKind, Result};
use gandalf_protocol::openai::Usage;
use gandalf_storage::ProviderRecord;
use serde::Deserialize;
use serde_json::Value;

use crate::http::HttpClient;
use crate::provider::Provider;
use crate::types::ProviderKind;

pub use anthropic::AnthropicProvider;
pub use gemini::GeminiProvider;
pub use ollama::OllamaProvider;
pub use openai::OpenAiProvider;

/// Instantiate the adapter for a configured provider record.
///
/// `pooled` is the shared HTTP/2-capable client; `local` is the HTTP/1.1
/// client local upstreams (Ollama) use.
pub fn build_provider(
    record: &ProviderRecord,
    pooled: &HttpClient,
    local: &HttpClient,
) -> Result<Arc<dyn Provider>> {
    let kind = ProviderKind::parse(&record.kind).ok_or_else(|| {
        Error::new(
            ErrorKind::BadRequest,
            format!("unknown provider kind: {}", record.kind),
        )
    })?;
    let provider: Arc<dyn Provider> = match kind {
        ProviderKind::OpenAi | ProviderKind::Azure => Arc::new(OpenAiProvider::new(
            record.name.clone(),
            kind,
            record.base_url.clone(),
            record.api_key.clone().unwrap_or_default(),
            pooled.clone(),
        )),
        ProviderKind::Anthropic => Arc::new(AnthropicProvider::new(
            record.name.clone(),
            record.base_url.clone(),
            record.api_key.clone().unwrap_or_default(),
            pooled.clone(),
        )),
        ProviderKind::Gemini => Arc::new(GeminiProvider::new(
            record.name.clone(),
            record.base_url.clone(),
            record.api_key.clone().unwrap_or_default(),
            pooled.clone(),
        )),
        ProviderKind::Ollama => Arc::new(OllamaProvider::new(
            record.name.clone(),
            record.base_url.clone(),
            local.clone(),
        )),
    };
    Ok(provider)
}

#[derive(Debug, Deserialize)]
pub(crate) struct UsageProbe {
    #[serde(default)]
    pub usage: Option<Usage>,
}

/// Flatten OpenAI message content (string or multi-part array) to plain text.
pub(crate) fn content_to_text(content: &Value) -> String {
    match content {
        Value::String(text) => text.clone(),
        Value::Array(parts) => {
            let mut out = String::new();
            for part in parts {
                if let Some(text) = part.get("text").and_then(|t| t.as_str()) {
                    out.push_str(text);
                }
            }
            out
        }
        _ => String::new(),
    }
}

pub(crate) fn upstream_error(provider: &str, status: u16) -> Error {
    Error::upstream(status, format!("{provider} upstream returned {status}"))
}

pub(crate) fn now_unix() -> i64 {
    time::OffsetDateTime::now_utc().unix_timestamp()
}

/// Stop field → list of stop sequences.
pub(crate) fn stop_sequences(stop: &Option<Value>) -> Option<Vec<String>> {
    match stop {
        Some(Value::String(s)) => Some(vec![s.clone()]),
        Some(Value::Array(items)) => Some(
            items
                .iter()
                .filter_map(|v| v.as_str().map(str::to_string))
                .collect(),
        ),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn content_flattening() {
        assert_eq!(content_to_text(&json!("hi")), "hi");
        assert_eq!(
            content_to_text(&json!([
                {"type": "text", "text": "a"},
                {"type": "image_url", "image_url": {"url": "http://x"}},
                {"type": "text", "text": "b"},
            ])),
            "ab"
        );
        assert_eq!(content_to_text(&json!(null)), "");
    }

    #[test]
    fn stop_sequence_shapes() {
        assert_eq!(
            stop_sequences(&Some(json!("END"))),
            Some(vec!["END".to_string()])
        );
        assert_eq!(
            stop_sequences(&Some(json!(["a", "b"]))),
            Some(vec!["a".to_string(), "b".to_string()])
        );
        assert_eq!(stop_sequences(&None), None);
    }
}
