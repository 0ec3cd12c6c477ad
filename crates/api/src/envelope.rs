//! Response envelope: `{"success":true,"value":...}` or `{"error":"..."}`.

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use segflow_core::EngineError;
use serde::Serialize;
use tracing::error;

#[derive(Serialize)]
pub struct Success<T: Serialize> {
    pub success: bool,
    pub value: T,
}

pub fn success<T: Serialize>(value: T) -> Json<Success<T>> {
    Json(Success {
        success: true,
        value,
    })
}

pub struct ApiError(pub EngineError);

impl From<EngineError> for ApiError {
    fn from(err: EngineError) -> Self {
        Self(err)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = match &self.0 {
            EngineError::Validation(_)
            | EngineError::Constraint(_)
            | EngineError::Unsupported(_) => StatusCode::BAD_REQUEST,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        };
        if status == StatusCode::INTERNAL_SERVER_ERROR {
            error!(error = %self.0, "Request failed");
            metrics::counter!("api.errors").increment(1);
        }
        (
            status,
            Json(serde_json::json!({ "error": self.0.to_string() })),
        )
            .into_response()
    }
}

pub type ApiResult<T> = Result<Json<Success<T>>, ApiError>;
