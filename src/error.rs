use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde::Serialize;

// ─── Core error kinds ───────────────────────────────────────────────────────

/// Behavioural error kinds shared by the store, the mesh engine, the SFU,
/// and the signaling plane.
///
/// `Transient` is the only retryable kind; the reliability wrapper retries
/// it with backoff and a per-peer circuit breaker. `Fatal` marks invariant
/// violations and is never retried.
#[derive(Debug, Clone, thiserror::Error)]
pub enum Error {
    #[error("invalid input: {0}")]
    InvalidInput(String),

    #[error("not found: {0}")]
    NotFound(String),

    #[error("unauthorized: {0}")]
    Unauthorized(String),

    #[error("conflict: {0}")]
    Conflict(String),

    #[error("rate limited: {0}")]
    RateLimited(String),

    #[error("transient: {0}")]
    Transient(String),

    #[error("fatal: {0}")]
    Fatal(String),
}

impl Error {
    pub fn is_transient(&self) -> bool {
        matches!(self, Error::Transient(_))
    }

    /// The user-visible message without the kind prefix.
    pub fn message(&self) -> &str {
        match self {
            Error::InvalidInput(m)
            | Error::NotFound(m)
            | Error::Unauthorized(m)
            | Error::Conflict(m)
            | Error::RateLimited(m)
            | Error::Transient(m)
            | Error::Fatal(m) => m,
        }
    }

    /// Stable machine-readable kind string, used in signaling `error`
    /// payloads and logs.
    pub fn kind(&self) -> &'static str {
        match self {
            Error::InvalidInput(_) => "invalid_input",
            Error::NotFound(_) => "not_found",
            Error::Unauthorized(_) => "unauthorized",
            Error::Conflict(_) => "conflict",
            Error::RateLimited(_) => "rate_limited",
            Error::Transient(_) => "transient",
            Error::Fatal(_) => "fatal",
        }
    }
}

impl From<redis::RedisError> for Error {
    fn from(e: redis::RedisError) -> Self {
        Error::Transient(format!("redis: {e}"))
    }
}

impl From<serde_json::Error> for Error {
    fn from(e: serde_json::Error) -> Self {
        Error::InvalidInput(format!("json: {e}"))
    }
}

impl From<webrtc::Error> for Error {
    fn from(e: webrtc::Error) -> Self {
        Error::Transient(format!("webrtc: {e}"))
    }
}

// ─── JSON envelope ──────────────────────────────────────────────────────────

#[derive(Serialize)]
struct ErrorEnvelope {
    error: ErrorBody,
}

#[derive(Serialize)]
struct ErrorBody {
    code: &'static str,
    message: String,
    status: u16,
}

// ─── ApiError ───────────────────────────────────────────────────────────────

/// Structured API error that serializes to JSON.
///
/// ```json
/// {
///   "error": {
///     "code": "stream_not_found",
///     "message": "Stream 'abc123' does not exist.",
///     "status": 404
///   }
/// }
/// ```
#[derive(Debug)]
pub struct ApiError {
    pub code: &'static str,
    pub message: String,
    pub status: StatusCode,
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        // Log according to severity.
        if self.status.is_server_error() {
            tracing::error!(
                code = self.code,
                status = self.status.as_u16(),
                "{}",
                self.message
            );
        } else if self.status.is_client_error() {
            tracing::warn!(
                code = self.code,
                status = self.status.as_u16(),
                "{}",
                self.message
            );
        }

        let envelope = ErrorEnvelope {
            error: ErrorBody {
                code: self.code,
                message: self.message,
                status: self.status.as_u16(),
            },
        };

        (self.status, Json(envelope)).into_response()
    }
}

impl From<Error> for ApiError {
    fn from(err: Error) -> Self {
        let message = err.to_string();
        match err {
            Error::InvalidInput(_) => Self {
                code: "invalid_input",
                message,
                status: StatusCode::BAD_REQUEST,
            },
            Error::NotFound(_) => Self {
                code: "not_found",
                message,
                status: StatusCode::NOT_FOUND,
            },
            Error::Unauthorized(_) => Self {
                code: "unauthorized",
                message,
                status: StatusCode::UNAUTHORIZED,
            },
            Error::Conflict(_) => Self {
                code: "conflict",
                message,
                status: StatusCode::CONFLICT,
            },
            Error::RateLimited(_) => Self {
                code: "rate_limited",
                message,
                status: StatusCode::TOO_MANY_REQUESTS,
            },
            Error::Transient(_) => Self {
                code: "service_unavailable",
                message,
                status: StatusCode::SERVICE_UNAVAILABLE,
            },
            Error::Fatal(_) => Self {
                code: "internal_server_error",
                message,
                status: StatusCode::INTERNAL_SERVER_ERROR,
            },
        }
    }
}

// ─── Generic constructors ───────────────────────────────────────────────────

impl ApiError {
    /// 401 Unauthorized with a custom message.
    pub fn unauthorized(msg: impl Into<String>) -> Self {
        Self {
            code: "unauthorized",
            message: msg.into(),
            status: StatusCode::UNAUTHORIZED,
        }
    }

    /// 404 Not Found with a custom message.
    pub fn not_found(msg: impl Into<String>) -> Self {
        Self {
            code: "not_found",
            message: msg.into(),
            status: StatusCode::NOT_FOUND,
        }
    }

    /// 400 Bad Request with a custom message.
    pub fn bad_request(msg: impl Into<String>) -> Self {
        Self {
            code: "bad_request",
            message: msg.into(),
            status: StatusCode::BAD_REQUEST,
        }
    }

    /// 500 Internal Server Error with a custom message.
    pub fn internal(msg: impl Into<String>) -> Self {
        Self {
            code: "internal_server_error",
            message: msg.into(),
            status: StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    // ─── Domain-specific constructors ───────────────────────────────────

    /// 401 — the `Authorization` header is missing or malformed.
    pub fn auth_header_missing() -> Self {
        Self {
            code: "auth_header_missing",
            message: "Authorization header is missing or malformed.".into(),
            status: StatusCode::UNAUTHORIZED,
        }
    }

    /// 401 — the JWT token is invalid (bad signature, malformed, etc.).
    pub fn token_invalid() -> Self {
        Self {
            code: "token_invalid",
            message: "The provided token is invalid.".into(),
            status: StatusCode::UNAUTHORIZED,
        }
    }

    /// 401 — the JWT token has expired.
    pub fn token_expired() -> Self {
        Self {
            code: "token_expired",
            message: "The provided token has expired.".into(),
            status: StatusCode::UNAUTHORIZED,
        }
    }

    /// 404 — the requested stream does not exist.
    pub fn stream_not_found(stream_id: &str) -> Self {
        Self {
            code: "stream_not_found",
            message: format!("Stream '{stream_id}' does not exist."),
            status: StatusCode::NOT_FOUND,
        }
    }

    /// 404 — the requested peer does not exist.
    pub fn peer_not_found(peer_id: &str) -> Self {
        Self {
            code: "peer_not_found",
            message: format!("Peer '{peer_id}' does not exist."),
            status: StatusCode::NOT_FOUND,
        }
    }

    /// 409 — the stream has reached its maximum capacity.
    pub fn stream_full(stream_id: &str) -> Self {
        Self {
            code: "stream_full",
            message: format!("Stream '{stream_id}' is full."),
            status: StatusCode::CONFLICT,
        }
    }

    /// 429 — a throttle tripped.
    pub fn rate_limited(msg: impl Into<String>) -> Self {
        Self {
            code: "rate_limited",
            message: msg.into(),
            status: StatusCode::TOO_MANY_REQUESTS,
        }
    }

    /// 500 — the WebRTC peer connection could not be established.
    pub fn peer_connection_failed() -> Self {
        Self {
            code: "peer_connection_failed",
            message: "Failed to establish the WebRTC peer connection.".into(),
            status: StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    /// 400 — the SDP offer/answer is invalid or could not be parsed.
    pub fn invalid_sdp() -> Self {
        Self {
            code: "invalid_sdp",
            message: "invalid SDP format".into(),
            status: StatusCode::BAD_REQUEST,
        }
    }
}

// ─── Tests ──────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::to_bytes;
    use axum::response::IntoResponse;

    /// Helper: convert an `ApiError` into its JSON body string.
    async fn body_string(err: ApiError) -> String {
        let response = err.into_response();
        let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        String::from_utf8(bytes.to_vec()).unwrap()
    }

    #[tokio::test]
    async fn json_structure() {
        let json = body_string(ApiError::stream_not_found("abc123")).await;
        let value: serde_json::Value = serde_json::from_str(&json).unwrap();

        assert_eq!(value["error"]["code"], "stream_not_found");
        assert_eq!(value["error"]["message"], "Stream 'abc123' does not exist.");
        assert_eq!(value["error"]["status"], 404);
    }

    #[tokio::test]
    async fn status_code_is_set() {
        let response = ApiError::unauthorized("nope").into_response();
        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
    }

    #[test]
    fn core_error_kinds_map_to_statuses() {
        let cases = [
            (Error::InvalidInput("x".into()), StatusCode::BAD_REQUEST),
            (Error::NotFound("x".into()), StatusCode::NOT_FOUND),
            (Error::Unauthorized("x".into()), StatusCode::UNAUTHORIZED),
            (Error::Conflict("x".into()), StatusCode::CONFLICT),
            (Error::RateLimited("x".into()), StatusCode::TOO_MANY_REQUESTS),
            (Error::Transient("x".into()), StatusCode::SERVICE_UNAVAILABLE),
            (Error::Fatal("x".into()), StatusCode::INTERNAL_SERVER_ERROR),
        ];
        for (err, status) in cases {
            assert_eq!(ApiError::from(err).status, status);
        }
    }

    #[test]
    fn only_transient_is_retryable() {
        assert!(Error::Transient("net".into()).is_transient());
        assert!(!Error::Fatal("bug".into()).is_transient());
        assert!(!Error::Conflict("dup".into()).is_transient());
    }

    #[test]
    fn kind_strings_are_stable() {
        assert_eq!(Error::InvalidInput("x".into()).kind(), "invalid_input");
        assert_eq!(Error::RateLimited("x".into()).kind(), "rate_limited");
    }

    #[tokio::test]
    async fn internal_error_500() {
        let response = ApiError::peer_connection_failed().into_response();
        assert_eq!(response.status(), StatusCode::INTERNAL_SERVER_ERROR);

        let json = body_string(ApiError::peer_connection_failed()).await;
        let value: serde_json::Value = serde_json::from_str(&json).unwrap();
        assert_eq!(value["error"]["code"], "peer_connection_failed");
        assert_eq!(value["error"]["status"], 500);
    }
}
