use std::convert::Infallible;
use std::sync::Arc;
use std::time::{Duration, Instant};

use axum::body::Body;
use axum::http::{HeaderValue, StatusCode, header};
use axum::response::Response;
use bytes::Bytes;
use futures_util::StreamExt;
use gandalf_common::{Identity, RequestMeta};
use gandalf_core::token_cost;
use gandalf_protocol::ErrorEnvelope;
use gandalf_protocol::openai::Usage;
use gandalf_providers::ChunkStream;
use gandalf_storage::UsageRecord;
use time::OffsetDateTime;
use tokio_stream::wrappers::ReceiverStream;

use crate::AppState;

const KEEP_ALIVE_INTERVAL: Duration = Duration::from_secs(15);
const KEEP_ALIVE_FRAME: &[u8] = b": keep-alive\n\n";
const DONE_FRAME: &[u8] = b"data: [DONE]\n\n";

/// Everything the stream writer needs to finalize accounting when the
/// stream ends (normally, on error, or on client disconnect).
pub struct StreamContext {
    pub state: AppState,
    pub meta: Arc<RequestMeta>,
    pub identity: Identity,
    pub model: String,
    pub provider: String,
    pub estimated_tokens: u32,
    pub started: Instant,
}

/// Turn a translated chunk stream into the SSE response.
///
/// Headers are set before any body byte; frames flush as they are written
/// (axum flushes per body chunk); a keep-alive comment goes out every 15 s
/// until the first data chunk; an upstream error becomes an `event: error`
/// frame followed by `data: [DONE]`. Client disconnect drops the body,
/// which tears down the writer and the upstream read.
pub fn sse_response(chunks: ChunkStream, ctx: StreamContext) -> Response {
    let (tx, rx) = tokio::sync::mpsc::channel::<Bytes>(32);
    tokio::spawn(write_stream(chunks, tx, ctx));

    let stream = ReceiverStream::new(rx).map(Ok::<_, Infallible>);
    let mut resp = Response::new(Body::from_stream(stream));
    let headers = resp.headers_mut();
    headers.insert(
        header::CONTENT_TYPE,
        HeaderValue::from_static("text/event-stream"),
    );
    headers.insert(header::CACHE_CONTROL, HeaderValue::from_static("no-cache"));
    headers.insert(header::CONNECTION, HeaderValue::from_static("keep-alive"));
    headers.insert("x-accel-buffering", HeaderValue::from_static("no"));
    resp
}

async fn write_stream(
    mut chunks: ChunkStream,
    tx: tokio::sync::mpsc::Sender<Bytes>,
    ctx: StreamContext,
) {
    let mut usage: Option<Usage> = None;
    let mut status: u16 = StatusCode::OK.as_u16();
    let mut got_data = false;

    let mut ticker = tokio::time::interval(KEEP_ALIVE_INTERVAL);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    ticker.tick().await;

    loop {
        tokio::select! {
            maybe = chunks.recv() => {
                let Some(chunk) = maybe else {
                    // Channel close without a sentinel is equivalent to done.
                    let _ = tx.send(Bytes::from_static(DONE_FRAME)).await;
                    break;
                };
                if let Some(u) = chunk.usage {
                    usage = Some(u);
                }
                if let Some(err) = chunk.err {
                    status = StatusCode::BAD_GATEWAY.as_u16();
                    tracing::warn!(
                        request_id = %ctx.meta.request_id(),
                        error = %err,
                        "stream failed mid-response"
                    );
                    let envelope = ErrorEnvelope::new(
                        err.kind().canonical_message(),
                        err.kind().error_type(),
                    )
                    .to_json();
                    let frame = format!("event: error\ndata: {envelope}\n\n");
                    let _ = tx.send(Bytes::from(frame)).await;
                    let _ = tx.send(Bytes::from_static(DONE_FRAME)).await;
                    break;
                }
                if chunk.done {
                    let _ = tx.send(Bytes::from_static(DONE_FRAME)).await;
                    break;
                }
                if let Some(data) = chunk.data {
                    got_data = true;
                    let mut frame = Vec::with_capacity(data.len() + 8);
                    frame.extend_from_slice(b"data: ");
                    frame.extend_from_slice(&data);
                    frame.extend_from_slice(b"\n\n");
                    if tx.send(Bytes::from(frame)).await.is_err() {
                        // Client went away; abandon the upstream read.
                        break;
                    }
                }
            }
            _ = ticker.tick(), if !got_data => {
                if tx.send(Bytes::from_static(KEEP_ALIVE_FRAME)).await.is_err() {
                    break;
                }
            }
        }
    }

    finalize(&ctx, usage, status);
}

/// Post-stream accounting: TPM adjust, quota spend, usage record.
fn finalize(ctx: &StreamContext, usage: Option<Usage>, status: u16) {
    let usage = usage.unwrap_or_default();
    ctx.state.limiter.adjust_tpm(
        ctx.identity.key_id,
        ctx.estimated_tokens,
        usage.total_tokens,
    );
    let cost = token_cost(usage.total_tokens);
    ctx.state.quota.add_cost(ctx.identity.key_id, cost);
    ctx.state.recorder.record(UsageRecord {
        request_id: ctx.meta.request_id().to_string(),
        key_id: ctx.identity.key_id,
        org_id: ctx.identity.org_id,
        team_id: ctx.identity.team_id,
        user_id: ctx.identity.user_id,
        model: ctx.model.clone(),
        provider: ctx.provider.clone(),
        prompt_tokens: usage.prompt_tokens,
        completion_tokens: usage.completion_tokens,
        total_tokens: usage.total_tokens,
        cost,
        cached: false,
        latency_ms: ctx.started.elapsed().as_millis() as u64,
        status,
        created_at: OffsetDateTime::now_utc(),
    });
}
