/// HTTP error mapping
///
/// Every handler returns `ApiResult`; engine errors become a JSON body
/// `{ "error": ..., "code": ... }` with a matching status.

use crate::error::EngineError;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use serde_json::json;

#[derive(Debug, thiserror::Error)]
pub enum ApiError {
    #[error(transparent)]
    Engine(#[from] EngineError),

    #[error("bad request: {0}")]
    BadRequest(String),
}

pub type ApiResult<T> = Result<T, ApiError>;

impl ApiError {
    pub fn status(&self) -> (StatusCode, &'static str) {
        match self {
            ApiError::BadRequest(_) => (StatusCode::BAD_REQUEST, "BAD_REQUEST"),
            ApiError::Engine(engine) => match engine {
                EngineError::WorkflowNotFound(_)
                | EngineError::StepNotFound(_)
                | EngineError::ExecutionNotFound(_) => (StatusCode::NOT_FOUND, "NOT_FOUND"),
                EngineError::WorkflowInactive(_) => (StatusCode::CONFLICT, "WORKFLOW_INACTIVE"),
                EngineError::InvalidTransition { .. } => (StatusCode::CONFLICT, "INVALID_TRANSITION"),
                EngineError::InvalidReorder(_) => (StatusCode::UNPROCESSABLE_ENTITY, "INVALID_REORDER"),
                EngineError::InvalidDefinition(_) => (StatusCode::UNPROCESSABLE_ENTITY, "VALIDATION_ERROR"),
                EngineError::Database(_) | EngineError::Serialization(_) => {
                    (StatusCode::INTERNAL_SERVER_ERROR, "INTERNAL_ERROR")
                }
            },
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, code) = self.status();
        let message = if status == StatusCode::INTERNAL_SERVER_ERROR {
            tracing::error!("❌ Request failed: {}", self);
            "An internal error occurred".to_string()
        } else {
            self.to_string()
        };

        (status, axum::Json(json!({ "error": message, "code": code }))).into_response()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_mapping() {
        let cases = [
            (EngineError::WorkflowNotFound("wf".into()), StatusCode::NOT_FOUND),
            (EngineError::WorkflowInactive("wf".into()), StatusCode::CONFLICT),
            (EngineError::InvalidReorder("missing".into()), StatusCode::UNPROCESSABLE_ENTITY),
            (EngineError::invalid("bad cron"), StatusCode::UNPROCESSABLE_ENTITY),
            (EngineError::Database(sqlx::Error::PoolClosed), StatusCode::INTERNAL_SERVER_ERROR),
        ];
        for (error, expected) in cases {
            assert_eq!(ApiError::from(error).status().0, expected);
        }
        assert_eq!(ApiError::BadRequest("x".into()).status().0, StatusCode::BAD_REQUEST);
    }
}
