//! Request extractors.

use axum::{
    async_trait,
    extract::{rejection::JsonRejection, FromRequest, FromRequestParts, Path, Request},
    http::request::Parts,
    Json,
};
use engine_core::TaskId;
use serde::de::DeserializeOwned;

use crate::response::ApiError;

/// JSON body whose rejections use the API error shape.
pub struct ApiJson<T>(pub T);

#[async_trait]
impl<T, S> FromRequest<S> for ApiJson<T>
where
    T: DeserializeOwned,
    S: Send + Sync,
{
    type Rejection = ApiError;

    async fn from_request(req: Request, state: &S) -> Result<Self, Self::Rejection> {
        match Json::<T>::from_request(req, state).await {
            Ok(Json(value)) => Ok(ApiJson(value)),
            Err(rejection) => Err(json_rejection(rejection)),
        }
    }
}

fn json_rejection(rejection: JsonRejection) -> ApiError {
    match rejection {
        JsonRejection::JsonDataError(e) => ApiError::validation(vec![e.body_text()]),
        other => ApiError::bad_request(other.body_text()),
    }
}

/// Task id taken from the `:id` path segment.
#[derive(Debug, Clone, Copy)]
pub struct TaskIdPath(pub TaskId);

#[async_trait]
impl<S> FromRequestParts<S> for TaskIdPath
where
    S: Send + Sync,
{
    type Rejection = ApiError;

    async fn from_request_parts(parts: &mut Parts, state: &S) -> Result<Self, Self::Rejection> {
        let Path(raw) = Path::<String>::from_request_parts(parts, state)
            .await
            .map_err(|e| ApiError::bad_request(e.body_text()))?;

        raw.parse::<TaskId>()
            .map(TaskIdPath)
            .map_err(|_| ApiError::bad_request(format!("invalid task id '{}'", raw)))
    }
}
