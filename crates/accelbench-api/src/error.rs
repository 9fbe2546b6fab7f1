// Copyright (c) 2025 AccelBench Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Bridges `accelbench_core::Error` to HTTP responses, the same thin-wrapper
//! pattern the wider codebase uses at its own API/adapter seams.

use accelbench_core::Error;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde_json::json;

pub struct ApiError(pub Error);

impl From<Error> for ApiError {
    fn from(err: Error) -> Self {
        Self(err)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, message) = match &self.0 {
            Error::Validation(msg) => (StatusCode::BAD_REQUEST, msg.clone()),
            Error::NotFound(msg) => (StatusCode::NOT_FOUND, msg.clone()),
            Error::Conflict(msg) => (StatusCode::CONFLICT, msg.clone()),
            Error::Infrastructure(msg) => (StatusCode::BAD_GATEWAY, msg.clone()),
            Error::Data(msg) => (StatusCode::INTERNAL_SERVER_ERROR, msg.clone()),
            Error::FatalPersist { reason, .. } => (StatusCode::INTERNAL_SERVER_ERROR, reason.clone()),
            Error::Cancelled => (StatusCode::CONFLICT, "run cancelled".to_string()),
            Error::Timeout(d) => (
                StatusCode::GATEWAY_TIMEOUT,
                format!("timed out after {d:?}"),
            ),
            Error::Other(e) => (StatusCode::INTERNAL_SERVER_ERROR, e.to_string()),
        };

        (status, Json(json!({ "error": message }))).into_response()
    }
}
