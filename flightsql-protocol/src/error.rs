//! Error taxonomy for the protocol engine and the status-code mapping
//! that puts it on the gRPC wire.

use thiserror::Error;
use tonic::{Code, Status};

/// Failures decoding or validating a command envelope.
#[derive(Error, Debug)]
pub enum EnvelopeError {
    #[error("failed to decode protobuf envelope: {0}")]
    Decode(#[source] prost::DecodeError),

    #[error("expected envelope tagged {expected}, found {found}")]
    TypeMismatch {
        expected: &'static str,
        found: String,
    },
}

/// The abstract error taxonomy the protocol engine reports through,
/// independent of transport. The dispatcher never recovers from these
/// locally; every variant is reported to the client through the call's
/// status channel (`From<FlightSqlError> for tonic::Status` below).
#[derive(Error, Debug)]
pub enum FlightSqlError {
    /// Unknown envelope tag, malformed payload, or wrong carrier for
    /// the variant (e.g. an action body where a ticket was expected).
    #[error("invalid request: {0}")]
    InvalidRequest(String),

    #[error("unauthenticated")]
    Unauthenticated,

    #[error("permission denied")]
    PermissionDenied,

    /// A valid variant for which the backend has not registered a
    /// handler (`SqlBackend::capabilities()` does not set its bit).
    #[error("not implemented: {0}")]
    NotImplemented(String),

    /// Prepared/execution handle not present: expired, closed, or
    /// forged.
    #[error("handle not found")]
    HandleNotFound,

    /// A second concurrent call landed on the same handle.
    #[error("handle busy")]
    HandleBusy,

    /// Uploaded parameter batch does not match the statement's
    /// parameter schema.
    #[error("parameter batch schema mismatch")]
    SchemaMismatch,

    /// Any failure surfaced by the SQL backend, carrying a
    /// human-readable message and, where the backend can supply one, a
    /// SQLSTATE-like code.
    #[error("backend error: {message}")]
    BackendError {
        message: String,
        sqlstate: Option<String>,
    },

    /// Transport classes propagated unchanged.
    #[error("cancelled")]
    Cancelled,
    #[error("deadline exceeded")]
    DeadlineExceeded,
    #[error("unavailable: {0}")]
    Unavailable(String),
    #[error("internal error: {0}")]
    Internal(String),
}

impl From<EnvelopeError> for FlightSqlError {
    fn from(err: EnvelopeError) -> Self {
        FlightSqlError::InvalidRequest(err.to_string())
    }
}

/// Metadata key carrying `BackendError::sqlstate` when present,
/// `spec.md` §7.
pub const SQLSTATE_METADATA_KEY: &str = "x-sqlstate";

impl FlightSqlError {
    /// The client's retry policy, `spec.md` §7: never retry on a
    /// category the caller must change something to fix, may retry on
    /// a transport-level hiccup.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            FlightSqlError::Unavailable(_)
                | FlightSqlError::Cancelled
                | FlightSqlError::DeadlineExceeded
        )
    }

    /// Recover a `FlightSqlError` category from a status a client
    /// received back over the wire. Best-effort: status codes are
    /// coarser than this taxonomy, so categories that share a code
    /// (e.g. `InvalidRequest` and `SchemaMismatch`) collapse to the
    /// more general one.
    pub fn from_status(status: &Status) -> Self {
        match status.code() {
            Code::InvalidArgument => FlightSqlError::InvalidRequest(status.message().to_string()),
            Code::Unauthenticated => FlightSqlError::Unauthenticated,
            Code::PermissionDenied => FlightSqlError::PermissionDenied,
            Code::Unimplemented => FlightSqlError::NotImplemented(status.message().to_string()),
            Code::NotFound => FlightSqlError::HandleNotFound,
            Code::ResourceExhausted => FlightSqlError::HandleBusy,
            Code::Cancelled => FlightSqlError::Cancelled,
            Code::DeadlineExceeded => FlightSqlError::DeadlineExceeded,
            Code::Unavailable => FlightSqlError::Unavailable(status.message().to_string()),
            Code::Internal => FlightSqlError::BackendError {
                message: status.message().to_string(),
                sqlstate: status
                    .metadata()
                    .get(SQLSTATE_METADATA_KEY)
                    .and_then(|v| v.to_str().ok())
                    .map(str::to_string),
            },
            _ => FlightSqlError::Internal(status.message().to_string()),
        }
    }
}

impl From<FlightSqlError> for Status {
    fn from(err: FlightSqlError) -> Status {
        match &err {
            FlightSqlError::InvalidRequest(msg) => Status::invalid_argument(msg.clone()),
            FlightSqlError::Unauthenticated => Status::unauthenticated(err.to_string()),
            FlightSqlError::PermissionDenied => Status::permission_denied(err.to_string()),
            FlightSqlError::NotImplemented(msg) => Status::unimplemented(msg.clone()),
            FlightSqlError::HandleNotFound => Status::not_found(err.to_string()),
            FlightSqlError::HandleBusy => Status::resource_exhausted(err.to_string()),
            FlightSqlError::SchemaMismatch => Status::invalid_argument(err.to_string()),
            FlightSqlError::BackendError { message, sqlstate } => {
                let mut status = Status::internal(message.clone());
                if let Some(code) = sqlstate {
                    if let Ok(value) = code.parse() {
                        status.metadata_mut().insert(SQLSTATE_METADATA_KEY, value);
                    }
                }
                status
            }
            FlightSqlError::Cancelled => Status::cancelled(err.to_string()),
            FlightSqlError::DeadlineExceeded => Status::deadline_exceeded(err.to_string()),
            FlightSqlError::Unavailable(msg) => Status::unavailable(msg.clone()),
            FlightSqlError::Internal(msg) => Status::internal(msg.clone()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn handle_not_found_maps_to_not_found() {
        let status: Status = FlightSqlError::HandleNotFound.into();
        assert_eq!(status.code(), Code::NotFound);
    }

    #[test]
    fn handle_busy_maps_to_resource_exhausted_and_is_not_retryable() {
        assert!(!FlightSqlError::HandleBusy.is_retryable());
        let status: Status = FlightSqlError::HandleBusy.into();
        assert_eq!(status.code(), Code::ResourceExhausted);
    }

    #[test]
    fn transport_classes_are_retryable() {
        assert!(FlightSqlError::Unavailable("down".into()).is_retryable());
        assert!(FlightSqlError::Cancelled.is_retryable());
        assert!(FlightSqlError::DeadlineExceeded.is_retryable());
        assert!(!FlightSqlError::InvalidRequest("bad".into()).is_retryable());
        assert!(!FlightSqlError::SchemaMismatch.is_retryable());
        assert!(!FlightSqlError::NotImplemented("x".into()).is_retryable());
    }

    #[test]
    fn backend_error_carries_sqlstate_in_metadata() {
        let err = FlightSqlError::BackendError {
            message: "division by zero".to_string(),
            sqlstate: Some("22012".to_string()),
        };
        let status: Status = err.into();
        assert_eq!(status.code(), Code::Internal);
        assert_eq!(
            status.metadata().get(SQLSTATE_METADATA_KEY).unwrap(),
            "22012"
        );
    }

    #[test]
    fn status_round_trips_through_from_status_by_code() {
        let status = Status::resource_exhausted("busy");
        assert!(matches!(
            FlightSqlError::from_status(&status),
            FlightSqlError::HandleBusy
        ));
    }
}
