use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use thiserror::Error;
use tracing::{debug, error};

use crate::models::NotFoundReason;
use crate::types::api::ErrorBody;

pub type AppResult<T> = std::result::Result<T, AppError>;

#[derive(Error, Debug)]
#[non_exhaustive]
pub enum AppError {
    #[error("{message}")]
    Validation {
        field: &'static str,
        message: String,
    },
    #[error("paste not found")]
    NotFound(NotFoundReason),
    #[error("store not configured")]
    StoreNotConfigured,
    #[error("store unavailable: {source}")]
    StoreUnavailable {
        source: Box<dyn std::error::Error + Send + Sync + 'static>,
    },
    #[error("unable to determine base URL: {0}")]
    Configuration(String),
    #[error("IO error")]
    Io {
        #[from]
        source: std::io::Error,
    },
    #[error("malformed record")]
    Json {
        #[from]
        source: serde_json::Error,
    },
    #[error("store replied with status {status}: {message}")]
    Upstash { status: u16, message: String },
    #[error("template error")]
    Template {
        #[from]
        source: askama::Error,
    },
}

impl AppError {
    pub fn validation(field: &'static str, message: impl Into<String>) -> Self {
        AppError::Validation {
            field,
            message: message.into(),
        }
    }

    pub fn unavailable(source: impl std::error::Error + Send + Sync + 'static) -> Self {
        AppError::StoreUnavailable {
            source: Box::new(source),
        }
    }

    pub fn status_code(&self) -> StatusCode {
        match self {
            AppError::Validation { .. } => StatusCode::BAD_REQUEST,
            AppError::NotFound(_) => StatusCode::NOT_FOUND,
            AppError::StoreNotConfigured => StatusCode::SERVICE_UNAVAILABLE,
            AppError::StoreUnavailable { .. } => StatusCode::SERVICE_UNAVAILABLE,
            AppError::Configuration(_) => StatusCode::INTERNAL_SERVER_ERROR,
            AppError::Io { .. } => StatusCode::INTERNAL_SERVER_ERROR,
            AppError::Json { .. } => StatusCode::INTERNAL_SERVER_ERROR,
            AppError::Upstash { .. } => StatusCode::INTERNAL_SERVER_ERROR,
            AppError::Template { .. } => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    /// The message shown to clients. Not-found reasons and internal details
    /// never leave the process.
    pub fn public_message(&self) -> String {
        match self {
            AppError::Validation { .. } | AppError::NotFound(_) => self.to_string(),
            AppError::StoreNotConfigured | AppError::StoreUnavailable { .. } => {
                "service temporarily unavailable".to_owned()
            }
            AppError::Configuration(_) => "unable to determine base URL".to_owned(),
            _ => "internal server error".to_owned(),
        }
    }

    /// Log anything that isn't the client's fault.
    pub fn log(&self) {
        match self {
            AppError::Validation { field, message } => {
                debug!("rejected request: field={field}, {message}")
            }
            _ if self.status_code().is_server_error() => error!("request failed: {self:?}"),
            _ => {}
        }
    }
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        self.log();
        let body = ErrorBody {
            error: self.public_message(),
        };
        (self.status_code(), Json(body)).into_response()
    }
}
