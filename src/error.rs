use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use thiserror::Error;

/// Error taxonomy for the sync protocol surface.
///
/// Auth and routing failures map to their HTTP status codes; anything the
/// worker raises while touching a collection surfaces as a 500 with the
/// detail logged rather than leaked.
#[derive(Error, Debug)]
pub enum SyncError {
    #[error("authentication failed or missing session")]
    AuthFailure,

    #[error("unknown sync operation: {0}")]
    NotFound(String),

    #[error("bad request: {0}")]
    BadRequest(String),

    #[error("client needs upgrade")]
    ClientUpgradeRequired,

    #[error("collection database error: {0}")]
    Database(#[from] rusqlite::Error),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("invalid payload: {0}")]
    Payload(#[from] serde_json::Error),

    #[error("archive error: {0}")]
    Archive(#[from] zip::result::ZipError),

    #[error("internal error: {0}")]
    Internal(String),
}

pub type Result<T> = std::result::Result<T, SyncError>;

impl SyncError {
    pub fn internal(message: impl Into<String>) -> Self {
        Self::Internal(message.into())
    }

    pub fn bad_request(message: impl Into<String>) -> Self {
        Self::BadRequest(message.into())
    }
}

impl IntoResponse for SyncError {
    fn into_response(self) -> Response {
        let (status, body) = match &self {
            SyncError::AuthFailure => (StatusCode::FORBIDDEN, "null".to_string()),
            SyncError::NotFound(op) => (StatusCode::NOT_FOUND, format!("unknown operation: {op}")),
            SyncError::BadRequest(msg) => (StatusCode::BAD_REQUEST, msg.clone()),
            SyncError::ClientUpgradeRequired => {
                (StatusCode::NOT_IMPLEMENTED, "client needs upgrade".to_string())
            }
            SyncError::Database(_)
            | SyncError::Io(_)
            | SyncError::Payload(_)
            | SyncError::Archive(_)
            | SyncError::Internal(_) => {
                tracing::error!(error = %self, "request failed");
                (
                    StatusCode::INTERNAL_SERVER_ERROR,
                    "internal server error".to_string(),
                )
            }
        };

        (status, body).into_response()
    }
}

#[cfg(test)]
mod tests {
    use super::SyncError;
    use axum::http::StatusCode;
    use axum::response::IntoResponse;

    #[test]
    fn status_codes_follow_the_taxonomy() {
        assert_eq!(
            SyncError::AuthFailure.into_response().status(),
            StatusCode::FORBIDDEN
        );
        assert_eq!(
            SyncError::NotFound("bogus".into()).into_response().status(),
            StatusCode::NOT_FOUND
        );
        assert_eq!(
            SyncError::bad_request("broken zip").into_response().status(),
            StatusCode::BAD_REQUEST
        );
        assert_eq!(
            SyncError::ClientUpgradeRequired.into_response().status(),
            StatusCode::NOT_IMPLEMENTED
        );
        assert_eq!(
            SyncError::internal("boom").into_response().status(),
            StatusCode::INTERNAL_SERVER_ERROR
        );
    }
}
