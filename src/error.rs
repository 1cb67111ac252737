use axum::Json;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use serde_json::json;

#[derive(Debug, thiserror::Error)]
pub enum PanelError {
    #[error("authentication failed: {0}")]
    AuthFailure(String),
    #[error("{operation} failed: {message}")]
    RemoteCallFailure {
        operation: &'static str,
        message: String,
    },
    #[error("run failed: {0}")]
    RunFailed(String),
    #[error("file ingestion failed: {0}")]
    IngestionFailure(String),
    #[error("client is not initialized")]
    NoClient,
    #[error("no assistant selected")]
    NoAssistant,
    #[error("no active chat; start a new chat first")]
    NoThread,
    #[error("no vector store associated with this assistant")]
    NoVectorStore,
    #[error("a run is already in progress on this thread")]
    RunInProgress,
    #[error("session not found")]
    SessionNotFound,
    #[error("bad request: {0}")]
    BadRequest(String),
}

pub type PanelResult<T> = Result<T, PanelError>;

impl PanelError {
    pub(crate) fn remote(operation: &'static str, message: impl Into<String>) -> Self {
        Self::RemoteCallFailure {
            operation,
            message: message.into(),
        }
    }

    fn status_code(&self) -> StatusCode {
        match self {
            PanelError::AuthFailure(_) => StatusCode::UNAUTHORIZED,
            PanelError::RemoteCallFailure { .. }
            | PanelError::RunFailed(_)
            | PanelError::IngestionFailure(_) => StatusCode::BAD_GATEWAY,
            PanelError::NoClient
            | PanelError::NoAssistant
            | PanelError::NoThread
            | PanelError::NoVectorStore => StatusCode::PRECONDITION_FAILED,
            PanelError::RunInProgress => StatusCode::CONFLICT,
            PanelError::SessionNotFound => StatusCode::NOT_FOUND,
            PanelError::BadRequest(_) => StatusCode::BAD_REQUEST,
        }
    }
}

impl IntoResponse for PanelError {
    fn into_response(self) -> Response {
        let status = self.status_code();
        let body = json!({
            "error": true,
            "message": self.to_string(),
            "status": status.as_u16(),
        });
        (status, Json(body)).into_response()
    }
}
