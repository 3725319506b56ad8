use application::ApplicationError;
use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use domain::RepositoryError;
use serde::Serialize;

#[derive(Debug, Serialize)]
pub struct ErrorBody {
    pub code: &'static str,
    pub message: String,
    pub retryable: bool,
}

#[derive(Debug)]
pub struct ApiError {
    status: StatusCode,
    body: ErrorBody,
}

impl ApiError {
    pub fn new(status: StatusCode, code: &'static str, message: impl Into<String>) -> Self {
        Self {
            status,
            body: ErrorBody {
                code,
                message: message.into(),
                retryable: false,
            },
        }
    }

    fn retryable(mut self) -> Self {
        self.body.retryable = true;
        self
    }

    pub fn unauthorized(message: impl Into<String>) -> Self {
        Self::new(StatusCode::UNAUTHORIZED, "AUTHENTICATION_FAILED", message)
    }

    pub fn bad_request(message: impl Into<String>) -> Self {
        Self::new(StatusCode::BAD_REQUEST, "BAD_REQUEST", message)
    }

    pub fn internal_server_error(message: impl Into<String>) -> Self {
        Self::new(StatusCode::INTERNAL_SERVER_ERROR, "INTERNAL_ERROR", message)
    }

    pub fn identity_unavailable() -> Self {
        Self::new(
            StatusCode::SERVICE_UNAVAILABLE,
            "IDENTITY_UNAVAILABLE",
            "identity provider unavailable",
        )
        .retryable()
    }

    pub fn status(&self) -> StatusCode {
        self.status
    }

    pub fn code(&self) -> &'static str {
        self.body.code
    }
}

impl From<ApplicationError> for ApiError {
    fn from(error: ApplicationError) -> Self {
        let code = error.code();
        let message = error.to_string();
        let status = match &error {
            ApplicationError::Authentication => StatusCode::UNAUTHORIZED,
            ApplicationError::Authorization { .. } => StatusCode::FORBIDDEN,
            ApplicationError::Validation(_) => StatusCode::UNPROCESSABLE_ENTITY,
            ApplicationError::ConversationNotFound(_)
            | ApplicationError::Persistence(RepositoryError::NotFound) => StatusCode::NOT_FOUND,
            ApplicationError::Persistence(RepositoryError::Conflict)
            | ApplicationError::ConnectionClosed(_) => StatusCode::CONFLICT,
            ApplicationError::Persistence(RepositoryError::Storage { .. }) => {
                StatusCode::INTERNAL_SERVER_ERROR
            }
            ApplicationError::Persistence(RepositoryError::Unavailable { .. })
            | ApplicationError::StoreTimeout(_) => StatusCode::SERVICE_UNAVAILABLE,
        };

        let api_error = ApiError::new(status, code, message);
        if error.is_retryable() {
            api_error.retryable()
        } else {
            api_error
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        (self.status, Json(self.body)).into_response()
    }
}
