use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use thiserror::Error;

use crate::model::GenerationResult;

#[derive(Debug, Error)]
pub enum ServiceError {
    #[error("initialization failed: {0}")]
    Initialization(String),
    #[error("model is not ready")]
    NotReady,
    #[error("upstream model is loading")]
    UpstreamUnavailable,
    #[error("{0}")]
    UpstreamFailure(String),
    #[error("tokenizer error: {0}")]
    Tokenizer(String),
    #[error("model execution failed: {0}")]
    Inference(String),
    #[error("invalid request: {0}")]
    Validation(String),
    #[error("malformed request body: {0}")]
    MalformedBody(String),
    #[error("generation queue is full, retry later")]
    Busy,
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

impl ServiceError {
    pub fn status(&self) -> StatusCode {
        match self {
            ServiceError::UpstreamUnavailable => StatusCode::OK,
            ServiceError::NotReady | ServiceError::Busy => StatusCode::SERVICE_UNAVAILABLE,
            ServiceError::Validation(_) => StatusCode::UNPROCESSABLE_ENTITY,
            ServiceError::MalformedBody(_) => StatusCode::BAD_REQUEST,
            ServiceError::Initialization(_)
            | ServiceError::UpstreamFailure(_)
            | ServiceError::Tokenizer(_)
            | ServiceError::Inference(_)
            | ServiceError::Io(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl IntoResponse for ServiceError {
    fn into_response(self) -> Response {
        let status = self.status();

        // A loading upstream is an informational state, not a failure.
        if let ServiceError::UpstreamUnavailable = self {
            return (status, axum::Json(GenerationResult::model_loading())).into_response();
        }

        let body = serde_json::json!({
            "detail": self.to_string(),
        });

        (status, axum::Json(body)).into_response()
    }
}
