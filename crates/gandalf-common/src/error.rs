use std::fmt;

pub type Result<T> = std::result::Result<T, Error>;

/// Domain error kinds, independent of any transport.
///
/// HTTP status derivation reads only the outermost kind; the cause chain is
/// kept for programmatic checks and server-side logging.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    Unauthorized,
    KeyExpired,
    KeyBlocked,
    Forbidden,
    ModelNotAllowed,
    NotFound,
    Conflict,
    RateLimited,
    QuotaExceeded,
    BadRequest,
    Provider,
    Internal,
}

impl ErrorKind {
    pub fn status(self) -> u16 {
        match self {
            ErrorKind::Unauthorized | ErrorKind::KeyExpired => 401,
            ErrorKind::Forbidden | ErrorKind::ModelNotAllowed | ErrorKind::KeyBlocked => 403,
            ErrorKind::NotFound => 404,
            ErrorKind::Conflict => 409,
            ErrorKind::RateLimited | ErrorKind::QuotaExceeded => 429,
            ErrorKind::BadRequest => 400,
            ErrorKind::Provider => 502,
            ErrorKind::Internal => 500,
        }
    }

    /// OpenAI-style `error.type` discriminator for the JSON envelope.
    pub fn error_type(self) -> &'static str {
        match self {
            ErrorKind::Unauthorized | ErrorKind::KeyExpired => "authentication_error",
            ErrorKind::Forbidden | ErrorKind::ModelNotAllowed | ErrorKind::KeyBlocked => {
                "permission_error"
            }
            ErrorKind::NotFound => "not_found_error",
            ErrorKind::RateLimited | ErrorKind::QuotaExceeded => "rate_limit_error",
            ErrorKind::Provider => "upstream_error",
            ErrorKind::Internal => "internal_error",
            ErrorKind::Conflict | ErrorKind::BadRequest => "invalid_request_error",
        }
    }

    /// Sanitized, client-facing message for this kind.
    pub fn canonical_message(self) -> &'static str {
        match self {
            ErrorKind::Unauthorized => "invalid or missing api key",
            ErrorKind::KeyExpired => "api key expired",
            ErrorKind::KeyBlocked => "api key blocked",
            ErrorKind::Forbidden => "permission denied",
            ErrorKind::ModelNotAllowed => "model not allowed for this key",
            ErrorKind::NotFound => "resource not found",
            ErrorKind::Conflict => "resource already exists",
            ErrorKind::RateLimited => "rate limit exceeded",
            ErrorKind::QuotaExceeded => "budget exhausted",
            ErrorKind::BadRequest => "invalid request",
            ErrorKind::Provider => "all upstream providers failed",
            ErrorKind::Internal => "internal error",
        }
    }
}

/// Transport-level failure class, set by the upstream HTTP client when no
/// HTTP response was observed. The breaker weighs timeouts heavier than
/// plain connection failures.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransportKind {
    Timeout,
    Connect,
    Other,
}

type Source = Box<dyn std::error::Error + Send + Sync + 'static>;

/// Error with a matchable kind and a preserved cause chain.
///
/// Provider adapters attach the upstream HTTP status when one was observed;
/// the failover loop uses it (next to the kind) to decide terminality.
pub struct Error {
    kind: ErrorKind,
    message: String,
    upstream_status: Option<u16>,
    transport: Option<TransportKind>,
    source: Option<Source>,
}

impl Error {
    pub fn new(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
            upstream_status: None,
            transport: None,
            source: None,
        }
    }

    pub fn wrap(
        kind: ErrorKind,
        message: impl Into<String>,
        source: impl Into<Source>,
    ) -> Self {
        Self {
            kind,
            message: message.into(),
            upstream_status: None,
            transport: None,
            source: Some(source.into()),
        }
    }

    /// Upstream HTTP failure observed by a provider adapter.
    pub fn upstream(status: u16, message: impl Into<String>) -> Self {
        Self {
            kind: ErrorKind::Provider,
            message: message.into(),
            upstream_status: Some(status),
            transport: None,
            source: None,
        }
    }

    /// Transport failure observed by the upstream HTTP client.
    pub fn transport(
        kind: TransportKind,
        message: impl Into<String>,
        source: impl Into<Source>,
    ) -> Self {
        Self {
            kind: ErrorKind::Provider,
            message: message.into(),
            upstream_status: None,
            transport: Some(kind),
            source: Some(source.into()),
        }
    }

    pub fn unauthorized(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Unauthorized, message)
    }

    pub fn bad_request(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::BadRequest, message)
    }

    pub fn not_found(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::NotFound, message)
    }

    pub fn internal(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Internal, message)
    }

    pub fn kind(&self) -> ErrorKind {
        self.kind
    }

    pub fn message(&self) -> &str {
        &self.message
    }

    pub fn upstream_status(&self) -> Option<u16> {
        self.upstream_status
    }

    pub fn transport_kind(&self) -> Option<TransportKind> {
        self.transport
    }

    pub fn status(&self) -> u16 {
        self.kind.status()
    }

    /// Terminal for the failover loop: an upstream 4xx, or any of the
    /// caller-fault kinds. Server errors, timeouts, and transport failures
    /// are retriable.
    pub fn is_client_error(&self) -> bool {
        if let Some(status) = self.upstream_status
            && (400..500).contains(&status)
        {
            return true;
        }
        matches!(
            self.kind,
            ErrorKind::BadRequest
                | ErrorKind::Unauthorized
                | ErrorKind::Forbidden
                | ErrorKind::ModelNotAllowed
                | ErrorKind::KeyExpired
                | ErrorKind::KeyBlocked
        )
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.message)
    }
}

impl fmt::Debug for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut s = f.debug_struct("Error");
        s.field("kind", &self.kind).field("message", &self.message);
        if let Some(status) = self.upstream_status {
            s.field("upstream_status", &status);
        }
        if let Some(source) = &self.source {
            s.field("source", &source.to_string());
        }
        s.finish()
    }
}

impl std::error::Error for Error {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        self.source
            .as_deref()
            .map(|s| s as &(dyn std::error::Error + 'static))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_derives_from_outermost_kind() {
        let inner = Error::upstream(500, "boom");
        let outer = Error::wrap(ErrorKind::Provider, "all targets failed", inner);
        assert_eq!(outer.status(), 502);
        assert!(std::error::Error::source(&outer).is_some());
    }

    #[test]
    fn upstream_4xx_is_terminal() {
        assert!(Error::upstream(400, "bad body").is_client_error());
        assert!(Error::upstream(429, "slow down").is_client_error());
        assert!(!Error::upstream(503, "overloaded").is_client_error());
    }

    #[test]
    fn caller_fault_kinds_are_terminal() {
        for kind in [
            ErrorKind::BadRequest,
            ErrorKind::Unauthorized,
            ErrorKind::Forbidden,
            ErrorKind::ModelNotAllowed,
            ErrorKind::KeyExpired,
            ErrorKind::KeyBlocked,
        ] {
            assert!(Error::new(kind, "x").is_client_error(), "{kind:?}");
        }
        assert!(!Error::new(ErrorKind::Provider, "x").is_client_error());
        assert!(!Error::new(ErrorKind::Internal, "x").is_client_error());
    }
}
