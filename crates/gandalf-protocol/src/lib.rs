pub mod anthropic;
pub mod envelope;
pub mod finish;
pub mod gemini;
pub mod openai;
pub mod sse;

pub use envelope::ErrorEnvelope;
pub use finish::FinishReason;
pub use sse::{SseEvent, SseParser};
