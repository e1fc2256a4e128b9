use std::error::Error as StdError;

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use log::*;

use sse::error::{AuthorizationErrorKind, ConnectionErrorKind, Error as SseError, ErrorKind};

pub type Result<T> = core::result::Result<T, Error>;

#[derive(Debug)]
pub struct Error(SseError);

impl StdError for Error {}

impl std::fmt::Display for Error {
    fn fmt(&self, fmt: &mut std::fmt::Formatter) -> core::result::Result<(), std::fmt::Error> {
        write!(fmt, "{}", self.0)
    }
}

impl Error {
    pub fn status_code(&self) -> StatusCode {
        match &self.0.error_kind {
            ErrorKind::Authorization(kind) => match kind {
                AuthorizationErrorKind::Unauthenticated | AuthorizationErrorKind::Expired => {
                    StatusCode::UNAUTHORIZED
                }
                AuthorizationErrorKind::Forbidden => StatusCode::FORBIDDEN,
                AuthorizationErrorKind::Unavailable => StatusCode::SERVICE_UNAVAILABLE,
            },
            ErrorKind::Connection(kind) => match kind {
                ConnectionErrorKind::LimitExceeded => StatusCode::TOO_MANY_REQUESTS,
                ConnectionErrorKind::Closed => StatusCode::SERVICE_UNAVAILABLE,
                ConnectionErrorKind::NotOpened | ConnectionErrorKind::AlreadyOpened => {
                    StatusCode::INTERNAL_SERVER_ERROR
                }
            },
            ErrorKind::Registry => StatusCode::SERVICE_UNAVAILABLE,
            ErrorKind::Serialization | ErrorKind::Transport => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

// List of possible StatusCode variants https://docs.rs/http/latest/http/status/struct.StatusCode.html
impl IntoResponse for Error {
    fn into_response(self) -> Response {
        let status = self.status_code();
        if status.is_server_error() {
            error!("Failed to open event stream: {}", self.0);
        } else {
            debug!("Rejected event stream request: {}", self.0);
        }

        let reason = status.canonical_reason().unwrap_or("ERROR").to_uppercase();
        (status, reason).into_response()
    }
}

impl<E> From<E> for Error
where
    E: Into<SseError>,
{
    fn from(err: E) -> Self {
        Self(err.into())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use sse::error::{authorization_error, connection_error, registry_error};

    #[test]
    fn test_authorization_errors_map_to_client_statuses() {
        let cases = [
            (AuthorizationErrorKind::Unauthenticated, StatusCode::UNAUTHORIZED),
            (AuthorizationErrorKind::Expired, StatusCode::UNAUTHORIZED),
            (AuthorizationErrorKind::Forbidden, StatusCode::FORBIDDEN),
            (AuthorizationErrorKind::Unavailable, StatusCode::SERVICE_UNAVAILABLE),
        ];
        for (kind, status) in cases {
            assert_eq!(Error::from(authorization_error(kind, "x")).status_code(), status);
        }
    }

    #[test]
    fn test_connection_limit_maps_to_too_many_requests() {
        let err = Error::from(connection_error(ConnectionErrorKind::LimitExceeded, "too many"));
        assert_eq!(err.into_response().status(), StatusCode::TOO_MANY_REQUESTS);
    }

    #[test]
    fn test_registry_outage_maps_to_service_unavailable() {
        let err = Error::from(registry_error("connection refused"));
        assert_eq!(err.status_code(), StatusCode::SERVICE_UNAVAILABLE);
    }
}
