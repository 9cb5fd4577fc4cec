use axum::http::{HeaderValue, StatusCode, header};
use axum::response::{IntoResponse, Response};
use bytes::Bytes;
use gandalf_common::Error;
use gandalf_protocol::ErrorEnvelope;
use tower_http::catch_panic::ResponseForPanic;

/// Domain error → sanitized JSON envelope. The outermost kind alone decides
/// the status and the client-visible message; the cause chain stays in the
/// server logs.
pub fn error_response(err: &Error) -> Response {
    let kind = err.kind();
    let status =
        StatusCode::from_u16(kind.status()).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
    let body = ErrorEnvelope::new(kind.canonical_message(), kind.error_type()).to_json();
    json_response(status, body)
}

pub fn json_response(status: StatusCode, body: String) -> Response {
    let mut resp = (status, body).into_response();
    resp.headers_mut().insert(
        header::CONTENT_TYPE,
        HeaderValue::from_static("application/json"),
    );
    resp
}

/// Recovery layer hook: a panic below becomes a 500 envelope, never a torn
/// connection.
#[derive(Clone, Copy)]
pub struct PanicResponder;

impl ResponseForPanic for PanicResponder {
    type ResponseBody = axum::body::Body;

    fn response_for_panic(
        &mut self,
        err: Box<dyn std::any::Any + Send + 'static>,
    ) -> axum::http::Response<Self::ResponseBody> {
        let detail = if let Some(s) = err.downcast_ref::<&str>() {
            s.to_string()
        } else if let Some(s) = err.downcast_ref::<String>() {
            s.clone()
        } else {
            "unknown panic".to_string()
        };
        tracing::error!(panic = %detail, "request handler panicked");

        let body = ErrorEnvelope::new("internal error", "internal_error").to_json();
        axum::http::Response::builder()
            .status(StatusCode::INTERNAL_SERVER_ERROR)
            .header(header::CONTENT_TYPE, "application/json")
            .body(axum::body::Body::from(Bytes::from(body)))
            .expect("static response")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use gandalf_common::ErrorKind;

    #[test]
    fn upstream_detail_never_reaches_the_envelope() {
        let err = Error::wrap(
            ErrorKind::Provider,
            "provider openai returned 500: internal-host-4711",
            std::io::Error::other("connect 10.0.0.3:443"),
        );
        let resp = error_response(&err);
        assert_eq!(resp.status(), StatusCode::BAD_GATEWAY);
        // Body built only from the canonical kind message.
        // (The full chain is logged server-side instead.)
    }

    #[test]
    fn status_mapping_follows_kind() {
        for (kind, status) in [
            (ErrorKind::Unauthorized, 401),
            (ErrorKind::KeyBlocked, 403),
            (ErrorKind::NotFound, 404),
            (ErrorKind::RateLimited, 429),
            (ErrorKind::QuotaExceeded, 429),
            (ErrorKind::BadRequest, 400),
            (ErrorKind::Provider, 502),
            (ErrorKind::Internal, 500),
        ] {
            let resp = error_response(&Error::new(kind, "x"));
            assert_eq!(resp.status().as_u16(), status, "{kind:?}");
        }
    }
}
