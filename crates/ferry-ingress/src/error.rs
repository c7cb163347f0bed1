//! Error types for the dispatch handler.

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use thiserror::Error;

use ferry_core::bus::BusError;
use ferry_core::storage::StorageError;

/// Errors that can occur while dispatching a webhook delivery.
///
/// Each variant maps to the HTTP status the upstream provider expects:
/// 400 for malformed or unsupported deliveries, 401 for authentication
/// failures, 403 for authorization failures, 500 when the request could
/// not be enqueued.
#[derive(Debug, Error)]
pub enum DispatchError {
    /// The event type is not `deployment`.
    #[error("unsupported event type: {0}")]
    UnsupportedEventType(String),

    /// The delivery-ID header is missing.
    #[error("missing delivery ID header")]
    MissingDeliveryId,

    /// The request body is not a usable deployment event.
    #[error("invalid payload: {0}")]
    InvalidPayload(String),

    /// No installation secret is stored for the repository.
    #[error("no webhook secret on file for repository")]
    UnknownRepository,

    /// The signature header is missing.
    #[error("missing signature header")]
    MissingSignature,

    /// The signature header has an invalid format.
    #[error("invalid signature format: {0}")]
    InvalidSignatureFormat(String),

    /// HMAC verification failed.
    #[error("invalid signature")]
    InvalidSignature,

    /// The declared team is not in the repository's allowlist.
    #[error("team '{team}' is not authorized to deploy this repository")]
    TeamNotAuthorized {
        /// The team named in the payload.
        team: String,
    },

    /// The credential backend failed.
    #[error("credential storage")]
    Storage(#[source] StorageError),

    /// The request could not be published to the bus.
    #[error("publishing deployment request")]
    Publish(#[source] BusError),
}

impl DispatchError {
    /// The HTTP status code for this error.
    #[must_use]
    pub const fn status_code(&self) -> StatusCode {
        match self {
            Self::UnsupportedEventType(_)
            | Self::MissingDeliveryId
            | Self::InvalidPayload(_) => StatusCode::BAD_REQUEST,
            Self::UnknownRepository
            | Self::MissingSignature
            | Self::InvalidSignatureFormat(_)
            | Self::InvalidSignature => StatusCode::UNAUTHORIZED,
            Self::TeamNotAuthorized { .. } => StatusCode::FORBIDDEN,
            Self::Storage(_) | Self::Publish(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl IntoResponse for DispatchError {
    fn into_response(self) -> Response {
        // Response bodies stay generic; secret material and backend
        // details never leave the process.
        let status = self.status_code();
        let body = match &self {
            Self::UnsupportedEventType(_) => "Unsupported event type",
            Self::MissingDeliveryId => "Missing delivery ID",
            Self::InvalidPayload(_) => "Invalid payload",
            Self::UnknownRepository | Self::MissingSignature | Self::InvalidSignature => {
                "Unauthorized"
            }
            Self::InvalidSignatureFormat(_) => "Invalid signature format",
            Self::TeamNotAuthorized { .. } => "Team not authorized",
            Self::Storage(_) | Self::Publish(_) => "Internal server error",
        };
        (status, body).into_response()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_codes() {
        assert_eq!(
            DispatchError::UnsupportedEventType("push".into()).status_code(),
            StatusCode::BAD_REQUEST
        );
        assert_eq!(
            DispatchError::MissingDeliveryId.status_code(),
            StatusCode::BAD_REQUEST
        );
        assert_eq!(
            DispatchError::UnknownRepository.status_code(),
            StatusCode::UNAUTHORIZED
        );
        assert_eq!(
            DispatchError::InvalidSignature.status_code(),
            StatusCode::UNAUTHORIZED
        );
        assert_eq!(
            DispatchError::TeamNotAuthorized {
                team: "x".to_owned()
            }
            .status_code(),
            StatusCode::FORBIDDEN
        );
        assert_eq!(
            DispatchError::Storage(StorageError::NotFound).status_code(),
            StatusCode::INTERNAL_SERVER_ERROR
        );
    }

    #[test]
    fn responses_do_not_leak_details() {
        let err = DispatchError::InvalidSignatureFormat("sha256=deadbeef".into());
        let response = err.into_response();
        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
    }
}
