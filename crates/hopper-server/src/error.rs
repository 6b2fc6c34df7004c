use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use hopper_core::error::HopperError;
use hopper_core::runtime::RuntimeError;

// ---------------------------------------------------------------------------
// Internal sentinel for explicit statuses
// ---------------------------------------------------------------------------

/// Carries an explicit HTTP 400 through the `anyhow::Error` chain.
#[derive(Debug)]
struct BadRequestError(String);

impl std::fmt::Display for BadRequestError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl std::error::Error for BadRequestError {}

// ---------------------------------------------------------------------------
// AppError
// ---------------------------------------------------------------------------

/// Unified error type for HTTP responses. Rendered as
/// `{"statusCode": …, "error": <reason phrase>, "message": …}`.
#[derive(Debug)]
pub struct AppError(pub anyhow::Error);

impl AppError {
    pub fn bad_request(msg: impl Into<String>) -> Self {
        Self(BadRequestError(msg.into()).into())
    }

    fn status(&self) -> StatusCode {
        if self.0.downcast_ref::<BadRequestError>().is_some() {
            return StatusCode::BAD_REQUEST;
        }
        match self.0.downcast_ref::<HopperError>() {
            Some(e) => match e {
                HopperError::InvalidTopic(_)
                | HopperError::InvalidDestination(_)
                | HopperError::InvalidRegistration(_)
                | HopperError::AuthNotConfigured => StatusCode::BAD_REQUEST,
                HopperError::InvalidCredentials | HopperError::Auth(_) => StatusCode::UNAUTHORIZED,
                HopperError::Forbidden(_) => StatusCode::FORBIDDEN,
                HopperError::RegistrationNotFound(_) | HopperError::InboxSourceMissing(_) => {
                    StatusCode::NOT_FOUND
                }
                HopperError::RegistrationExists { .. } | HopperError::UserExists(_) => StatusCode::CONFLICT,
                HopperError::Runtime(RuntimeError::Timeout(_)) => StatusCode::SERVICE_UNAVAILABLE,
                HopperError::ConfigNotFound(_)
                | HopperError::UnknownDatabase(_)
                | HopperError::MissingDatabase
                | HopperError::ContainerStart { .. }
                | HopperError::Task(_)
                | HopperError::Runtime(_)
                | HopperError::Sqlite(_)
                | HopperError::Io(_)
                | HopperError::Yaml(_)
                | HopperError::Json(_) => StatusCode::INTERNAL_SERVER_ERROR,
            },
            None => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let status = self.status();
        let message = if status.is_server_error() {
            tracing::error!(error = %self.0, "request failed");
            "the server failed to handle the request".to_string()
        } else {
            self.0.to_string()
        };
        let body = serde_json::json!({
            "statusCode": status.as_u16(),
            "error": status.canonical_reason().unwrap_or("Error"),
            "message": message,
        });
        (status, axum::Json(body)).into_response()
    }
}

impl<E> From<E> for AppError
where
    E: Into<anyhow::Error>,
{
    fn from(err: E) -> Self {
        Self(err.into())
    }
}
