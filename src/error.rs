use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
};
use thiserror::Error;
use tracing::{info, warn};

/// Crate-wide error type returned by HTTP handlers.
///
/// Variants are grouped the way the error handling design groups them:
/// client-input errors never log at error level, access errors log at info,
/// and internal/collaborator failures log at warn/error at the call site
/// before being converted into a response here.
#[derive(Error, Debug)]
pub enum AppError {
    #[error("no such object")]
    NotFound,

    #[error("forbidden")]
    Forbidden,

    #[error("invalid range")]
    InvalidRange,

    #[error("bad request: {0}")]
    BadRequest(String),

    #[error("unknown transcode key: {0}")]
    UnknownTranscode(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("internal error: {0}")]
    Internal(#[from] anyhow::Error),
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let (status, message) = match &self {
            AppError::NotFound => (StatusCode::NOT_FOUND, self.to_string()),
            AppError::Forbidden => {
                info!("rejecting request: {}", self);
                (StatusCode::FORBIDDEN, "forbidden".to_string())
            }
            AppError::InvalidRange => (StatusCode::RANGE_NOT_SATISFIABLE, self.to_string()),
            AppError::BadRequest(_) | AppError::UnknownTranscode(_) => {
                (StatusCode::BAD_REQUEST, self.to_string())
            }
            AppError::Io(e) => {
                warn!("io error serving request: {}", e);
                (StatusCode::INTERNAL_SERVER_ERROR, "internal error".to_string())
            }
            AppError::Internal(e) => {
                warn!("internal error serving request: {:#}", e);
                (StatusCode::INTERNAL_SERVER_ERROR, "internal error".to_string())
            }
        };
        (status, message).into_response()
    }
}

pub type AppResult<T> = Result<T, AppError>;

/// UPnP SOAP action error codes, used by [`crate::web::soap`] to build Fault bodies.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct UpnpError {
    pub code: u32,
    pub description: &'static str,
}

impl UpnpError {
    pub const INVALID_ACTION: UpnpError = UpnpError {
        code: 401,
        description: "Invalid Action",
    };
    pub const INVALID_ARGS: UpnpError = UpnpError {
        code: 402,
        description: "Invalid Args",
    };
    pub const NO_SUCH_OBJECT: UpnpError = UpnpError {
        code: 701,
        description: "No such object",
    };
}
