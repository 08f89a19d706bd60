//! Response envelope shared by the HTTP endpoints.
//!
//! Success is `{ "ok": true, "data": ... }`; failure is
//! `{ "ok": false, "kind": ..., "error": ... }` with a status derived from
//! the error.

use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde::Serialize;
use thiserror::Error;
use tracing::error;

use crate::error::{IngestError, StoreError};

// ---

#[derive(Debug, Serialize)]
pub struct Success<T> {
    ok: bool,
    data: T,
}

pub fn success<T: Serialize>(data: T) -> Json<Success<T>> {
    Json(Success { ok: true, data })
}

#[derive(Debug, Error)]
pub enum ApiError {
    // ---
    #[error("{0}")]
    BadRequest(String),

    #[error("{0}")]
    Unauthorized(&'static str),

    #[error("measurement not found")]
    NotFound,

    #[error(transparent)]
    Ingest(#[from] IngestError),
}

impl From<StoreError> for ApiError {
    fn from(e: StoreError) -> Self {
        ApiError::Ingest(IngestError::Storage(e))
    }
}

impl ApiError {
    // ---
    pub fn status(&self) -> StatusCode {
        // ---
        match self {
            ApiError::BadRequest(_) => StatusCode::BAD_REQUEST,
            ApiError::Unauthorized(_) => StatusCode::UNAUTHORIZED,
            ApiError::NotFound => StatusCode::NOT_FOUND,
            ApiError::Ingest(e) => match e {
                IngestError::NoValidPoints | IngestError::InvalidOwner => StatusCode::BAD_REQUEST,
                IngestError::MeasurementNotFound | IngestError::UnknownOwner(_) => {
                    StatusCode::NOT_FOUND
                }
                IngestError::Storage(_) => StatusCode::INTERNAL_SERVER_ERROR,
            },
        }
    }

    pub fn kind(&self) -> &'static str {
        // ---
        match self {
            ApiError::BadRequest(_) => "bad_request",
            ApiError::Unauthorized(_) => "unauthorized",
            ApiError::NotFound => "measurement_not_found",
            ApiError::Ingest(e) => e.kind(),
        }
    }
}

#[derive(Serialize)]
struct Failure {
    ok: bool,
    kind: &'static str,
    error: String,
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        // ---
        let status = self.status();
        if status.is_server_error() {
            error!("Request failed: {}", self);
        }

        let body = Failure {
            ok: false,
            kind: self.kind(),
            error: self.to_string(),
        };
        (status, Json(body)).into_response()
    }
}
