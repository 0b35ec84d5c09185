use axum::Json;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use chrono::{DateTime, Utc};
use serde_json::json;
use thiserror::Error;
use tracing::error;

/// Failures a REST handler can surface to a client.
///
/// Everything except `Internal` maps to a 4xx with a JSON `{"error": ...}`
/// body; `Internal` is logged server-side and answered with a generic 500
/// so no cause detail leaks.
#[derive(Debug, Error)]
pub enum ApiError {
    #[error("invalid credentials")]
    Unauthorized,

    #[error("insufficient permissions")]
    Forbidden,

    #[error("{0}")]
    Validation(String),

    #[error("{0} not found")]
    NotFound(&'static str),

    #[error("{0}")]
    Conflict(String),

    /// One invitation per 180 days per minter per realm; `next_available`
    /// tells the minter when the window reopens.
    #[error("invitation minting is on cooldown")]
    MintingCooldown { next_available: DateTime<Utc> },

    #[error("this realm requires an encryption key to join")]
    EncryptionKeyRequired,

    #[error("invalid encryption key")]
    InvalidEncryptionKey,

    #[error("invitation has expired")]
    InviteExpired,

    #[error("invitation has no uses left")]
    InviteExhausted,

    #[error("already a member of this realm")]
    AlreadyMember,

    #[error(transparent)]
    Internal(#[from] anyhow::Error),
}

pub type ApiResult<T> = Result<T, ApiError>;

impl From<enclave_crypto::CryptoError> for ApiError {
    fn from(e: enclave_crypto::CryptoError) -> Self {
        ApiError::Internal(e.into())
    }
}

impl From<tokio::task::JoinError> for ApiError {
    fn from(e: tokio::task::JoinError) -> Self {
        ApiError::Internal(e.into())
    }
}

impl ApiError {
    fn status(&self) -> StatusCode {
        match self {
            ApiError::Unauthorized | ApiError::InvalidEncryptionKey => StatusCode::UNAUTHORIZED,
            ApiError::Forbidden => StatusCode::FORBIDDEN,
            ApiError::Validation(_)
            | ApiError::EncryptionKeyRequired
            | ApiError::InviteExpired
            | ApiError::InviteExhausted
            | ApiError::AlreadyMember => StatusCode::BAD_REQUEST,
            ApiError::NotFound(_) => StatusCode::NOT_FOUND,
            ApiError::Conflict(_) => StatusCode::CONFLICT,
            ApiError::MintingCooldown { .. } => StatusCode::TOO_MANY_REQUESTS,
            ApiError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = self.status();
        let body = match &self {
            ApiError::Internal(e) => {
                error!("internal error: {:#}", e);
                json!({ "error": "internal server error" })
            }
            ApiError::MintingCooldown { next_available } => json!({
                "error": self.to_string(),
                "next_available": next_available.to_rfc3339(),
            }),
            _ => json!({ "error": self.to_string() }),
        };

        (status, Json(body)).into_response()
    }
}
