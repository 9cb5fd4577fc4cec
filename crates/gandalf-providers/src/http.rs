use std::time::Duration;

use bytes::Bytes;
use futures_util::StreamExt;
use gandalf_common::{Error, ErrorKind, TransportKind};
use wreq::{Client, Method};

use crate::types::{Headers, HttpMethod, UpstreamBody};

#[derive(Debug, Clone)]
pub struct HttpClientConfig {
    pub connect_timeout: Duration,
    pub request_timeout: Duration,
    pub stream_idle_timeout: Duration,
    pub pool_idle_per_host: usize,
    /// Local upstreams (Ollama) stay on HTTP/1.1.
    pub http1_only: bool,
}

impl Default for HttpClientConfig {
    fn default() -> Self {
        Self {
            connect_timeout: Duration::from_secs(5),
            request_timeout: Duration::from_secs(600),
            stream_idle_timeout: Duration::from_secs(30),
            pool_idle_per_host: 100,
            http1_only: false,
        }
    }
}

#[derive(Debug)]
pub struct HttpRequest {
    pub method: HttpMethod,
    pub url: String,
    pub headers: Headers,
    pub body: Option<Bytes>,
    pub want_stream: bool,
}

#[derive(Debug)]
pub struct HttpResponse {
    pub status: u16,
    pub headers: Headers,
    pub body: UpstreamBody,
}

/// Pooled upstream HTTP client shared by adapters.
#[derive(Clone)]
pub struct HttpClient {
    client: Client,
    stream_idle_timeout: Duration,
}

impl HttpClient {
    pub fn new(config: HttpClientConfig) -> Result<Self, Error> {
        let mut builder = Client::builder()
            .connect_timeout(config.connect_timeout)
            .timeout(config.request_timeout)
            .read_timeout(config.stream_idle_timeout)
            .pool_max_idle_per_host(config.pool_idle_per_host);
        if config.http1_only {
            builder = builder.http1_only();
        }
        let client = builder
            .build()
            .map_err(|err| Error::wrap(ErrorKind::Internal, "http client build failed", err))?;
        Ok(Self {
            client,
            stream_idle_timeout: config.stream_idle_timeout,
        })
    }

    pub async fn send(&self, req: HttpRequest) -> Result<HttpResponse, Error> {
        let method = to_wreq_method(req.method);
        let mut builder = self.client.request(method, &req.url);
        for (k, v) in &req.headers {
            builder = builder.header(k, v);
        }
        if let Some(body) = req.body {
            builder = builder.body(body);
        }

        let resp = builder.send().await.map_err(map_transport_error)?;
        let status = resp.status().as_u16();
        let headers = headers_from_wreq(resp.headers());

        let is_success = (200..300).contains(&status);
        if !is_success || !req.want_stream {
            let body = resp.bytes().await.map_err(map_transport_error)?;
            return Ok(HttpResponse {
                status,
                headers,
                body: UpstreamBody::Bytes(body),
            });
        }

        // Successful stream: pump upstream bytes into a channel so the
        // translator reads lazily. Idle timeout bounds a stalled upstream;
        // a dropped receiver ends the pump on the failed send.
        let idle = self.stream_idle_timeout;
        let (tx, rx) = tokio::sync::mpsc::channel::<Bytes>(16);
        tokio::spawn(async move {
            let mut stream = resp.bytes_stream();
            loop {
                let next = tokio::time::timeout(idle, stream.next()).await;
                let Ok(item) = next else { break };
                let Some(item) = item else { break };
                let Ok(chunk) = item else { break };
                if tx.send(chunk).await.is_err() {
                    break;
                }
            }
        });

        Ok(HttpResponse {
            status,
            headers,
            body: UpstreamBody::Stream(rx),
        })
    }
}

fn to_wreq_method(method: HttpMethod) -> Method {
    match method {
        HttpMethod::Get => Method::GET,
        HttpMethod::Post => Method::POST,
        HttpMethod::Put => Method::PUT,
        HttpMethod::Patch => Method::PATCH,
        HttpMethod::Delete => Method::DELETE,
    }
}

fn headers_from_wreq(map: &wreq::header::HeaderMap) -> Headers {
    let mut out = Vec::new();
    for (k, v) in map {
        if let Ok(s) = v.to_str() {
            out.push((k.as_str().to_string(), s.to_string()));
        }
    }
    out
}

fn map_transport_error(err: wreq::Error) -> Error {
    let (kind, message) = if err.is_timeout() {
        (TransportKind::Timeout, format!("upstream timeout: {err}"))
    } else if err.is_connect() || err.is_connection_reset() {
        (
            TransportKind::Connect,
            format!("upstream connect failed: {err}"),
        )
    } else {
        (
            TransportKind::Other,
            format!("upstream transport error: {err}"),
        )
    };
    Error::transport(kind, message, err)
}
