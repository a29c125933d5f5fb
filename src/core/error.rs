//! Unified error handling for modgate
//!
//! Every fallible operation returns a [`GatewayResult`]. Each error carries a
//! human readable cause and classifies into an [`ErrorKind`], which the admin
//! boundary maps onto an HTTP status code.

use std::fmt;

use http::StatusCode;

/// Coarse classification of a failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    /// Bad input: malformed descriptor, invalid id, duplicate key, incompatible request.
    User,
    /// Unknown tenant, module or instance, or an empty pipeline.
    NotFound,
    /// Store or transport failure, exhausted retries, unexpected decode failure.
    Internal,
    /// Unclassified.
    Any,
}

impl ErrorKind {
    pub fn status_code(&self) -> StatusCode {
        match self {
            ErrorKind::User => StatusCode::BAD_REQUEST,
            ErrorKind::NotFound => StatusCode::NOT_FOUND,
            ErrorKind::Internal | ErrorKind::Any => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorKind::User => "USER",
            ErrorKind::NotFound => "NOT_FOUND",
            ErrorKind::Internal => "INTERNAL",
            ErrorKind::Any => "ANY",
        }
    }
}

/// Unified error type for the gateway core
#[derive(Debug)]
pub enum GatewayError {
    /// Invalid input supplied by the caller
    User(String),

    /// Descriptor or pattern that failed to decode
    Decode(String),

    /// Missing tenant, module, key or route
    NotFound(String),

    /// Internal failures that are not the caller's fault
    Internal(String),

    /// Unclassified failures
    Any(String),

    /// Configuration-related errors
    Configuration(String),

    /// JSON (de)serialization errors of stored blobs
    Json(serde_json::Error),

    /// Errors returned by the etcd client
    Etcd(etcd_client::Error),
}

impl GatewayError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            GatewayError::User(_) | GatewayError::Decode(_) => ErrorKind::User,
            GatewayError::NotFound(_) => ErrorKind::NotFound,
            GatewayError::Internal(_)
            | GatewayError::Configuration(_)
            | GatewayError::Json(_)
            | GatewayError::Etcd(_) => ErrorKind::Internal,
            GatewayError::Any(_) => ErrorKind::Any,
        }
    }

    pub fn is_not_found(&self) -> bool {
        self.kind() == ErrorKind::NotFound
    }
}

impl fmt::Display for GatewayError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            GatewayError::User(msg) => write!(f, "{msg}"),
            GatewayError::Decode(msg) => write!(f, "Decode error: {msg}"),
            GatewayError::NotFound(msg) => write!(f, "{msg}"),
            GatewayError::Internal(msg) => write!(f, "Internal error: {msg}"),
            GatewayError::Any(msg) => write!(f, "{msg}"),
            GatewayError::Configuration(msg) => write!(f, "Configuration error: {msg}"),
            GatewayError::Json(err) => write!(f, "JSON error: {err}"),
            GatewayError::Etcd(err) => write!(f, "Etcd error: {err}"),
        }
    }
}

impl std::error::Error for GatewayError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            GatewayError::Json(err) => Some(err),
            GatewayError::Etcd(err) => Some(err),
            _ => None,
        }
    }
}

impl From<serde_json::Error> for GatewayError {
    fn from(err: serde_json::Error) -> Self {
        GatewayError::Json(err)
    }
}

impl From<etcd_client::Error> for GatewayError {
    fn from(err: etcd_client::Error) -> Self {
        GatewayError::Etcd(err)
    }
}

/// Result type alias for gateway operations
pub type GatewayResult<T> = std::result::Result<T, GatewayError>;

/// Helper trait for adding context to errors
pub trait ErrorContext<T> {
    fn with_context(self, context: &str) -> GatewayResult<T>;
}

impl<T, E> ErrorContext<T> for std::result::Result<T, E>
where
    E: fmt::Display,
{
    fn with_context(self, context: &str) -> GatewayResult<T> {
        self.map_err(|e| GatewayError::Internal(format!("{context}: {e}")))
    }
}

#[macro_export]
macro_rules! internal_error {
    ($msg:expr) => {
        $crate::core::GatewayError::Internal($msg.to_string())
    };
    ($fmt:expr, $($arg:tt)*) => {
        $crate::core::GatewayError::Internal(format!($fmt, $($arg)*))
    };
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_kind_mapping() {
        assert_eq!(GatewayError::User("x".into()).kind(), ErrorKind::User);
        assert_eq!(GatewayError::Decode("x".into()).kind(), ErrorKind::User);
        assert_eq!(GatewayError::NotFound("x".into()).kind(), ErrorKind::NotFound);
        assert_eq!(GatewayError::Any("x".into()).kind(), ErrorKind::Any);

        let json_err = serde_json::from_str::<u32>("nope").unwrap_err();
        assert_eq!(GatewayError::from(json_err).kind(), ErrorKind::Internal);
    }

    #[test]
    fn test_status_codes() {
        assert_eq!(ErrorKind::User.status_code(), StatusCode::BAD_REQUEST);
        assert_eq!(ErrorKind::NotFound.status_code(), StatusCode::NOT_FOUND);
        assert_eq!(
            ErrorKind::Internal.status_code(),
            StatusCode::INTERNAL_SERVER_ERROR
        );
        assert_eq!(ErrorKind::Any.status_code(), StatusCode::INTERNAL_SERVER_ERROR);
    }

    #[test]
    fn test_with_context() {
        let res: Result<(), &str> = Err("boom");
        let err = res.with_context("Saving tenant").unwrap_err();
        assert!(matches!(err, GatewayError::Internal(_)));
        assert_eq!(err.to_string(), "Internal error: Saving tenant: boom");
    }

    #[test]
    fn test_internal_error_macro() {
        let err = crate::internal_error!("Lease {} expired", 7);
        assert_eq!(err.kind(), ErrorKind::Internal);
        assert_eq!(err.to_string(), "Internal error: Lease 7 expired");
    }
}
