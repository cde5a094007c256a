//! Uniform response envelope: `{ok, data?, error?{code, message, retry_able}}`.

use axum::{
    Json,
    http::StatusCode,
    response::{IntoResponse, Response},
};
use serde::Serialize;
use serde_json::json;

use crate::util::error::CoreError;

pub(crate) struct ApiError(pub(crate) CoreError);

impl From<CoreError> for ApiError {
    fn from(error: CoreError) -> Self {
        Self(error)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = match &self.0 {
            CoreError::BadRequest(_) => StatusCode::BAD_REQUEST,
            CoreError::NotFound(_) => StatusCode::NOT_FOUND,
            CoreError::Conflict(_) => StatusCode::CONFLICT,
            CoreError::Transient(_) | CoreError::Permanent(_) => {
                StatusCode::INTERNAL_SERVER_ERROR
            }
        };
        let body = Json(json!({
            "ok": false,
            "error": {
                "code": self.0.code(),
                "message": self.0.to_string(),
                "retry_able": self.0.retry_able(),
            },
        }));
        (status, body).into_response()
    }
}

pub(crate) type ApiResult = Result<Response, ApiError>;

pub(crate) fn ok_json<T: Serialize>(data: T) -> Response {
    Json(json!({"ok": true, "data": data})).into_response()
}
