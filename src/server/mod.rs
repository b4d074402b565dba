use crate::analyzer::Analyzer;
use actix_web::error::PayloadError;
use actix_web::http::header::ContentType;
use actix_web::http::StatusCode;
use actix_web::{web, HttpResponse};
use actix_multipart::MultipartError;
use serde_json::json;
use std::collections::HashMap;
use std::sync::Arc;
use thiserror::Error;
use tracing::error;

pub mod protocol;
pub mod routes;

use protocol::FieldErrors;

/// Shared by all workers of the HTTP server
pub struct AppState {
    pub analyzer: Arc<dyn Analyzer>,

    /// Upper bound on the size of a request body
    pub max_body_bytes: usize,
}

impl AppState {
    pub fn new(analyzer: Arc<dyn Analyzer>, max_body_bytes: usize) -> Self {
        AppState {
            analyzer,
            max_body_bytes,
        }
    }
}

/// Register the API routes on an actix `App`
pub fn configure(cfg: &mut web::ServiceConfig) {
    cfg.app_data(web::QueryConfig::default().error_handler(|err, _req| {
        ApiError::BadRequest(format!("Query string parse error - {err}")).into()
    }))
    .service(routes::usage)
    .service(routes::analyze)
    .service(routes::frontend);
}

#[derive(Debug, Error)]
pub enum ApiError {
    /// One or more fields failed validation
    #[error("invalid fields: {0:?}")]
    Validation(FieldErrors),

    /// The body could not be parsed at all
    #[error("{0}")]
    BadRequest(String),

    #[error("Unsupported media type \"{0}\" in request.")]
    UnsupportedMediaType(String),

    #[error("Request body exceeds {0} bytes.")]
    PayloadTooLarge(usize),

    #[error(transparent)]
    Internal(#[from] anyhow::Error),
}

impl ApiError {
    pub fn validation(field: &str, message: impl Into<String>) -> Self {
        let mut errors = FieldErrors::default();
        errors.add(field, message);
        ApiError::Validation(errors)
    }
}

impl actix_web::error::ResponseError for ApiError {
    fn error_response(&self) -> HttpResponse {
        let mut response = HttpResponse::build(self.status_code());
        response.insert_header(ContentType::json());

        match self {
            ApiError::Validation(errors) => response.json(errors),
            ApiError::Internal(err) => {
                error!("request failed: {err:#}");
                let body = HashMap::from([("errors", vec![err.to_string()])]);
                response.json(body)
            }
            other => response.json(json!({ "detail": other.to_string() })),
        }
    }

    fn status_code(&self) -> StatusCode {
        match self {
            ApiError::Validation(_) | ApiError::BadRequest(_) => StatusCode::BAD_REQUEST,
            ApiError::UnsupportedMediaType(_) => StatusCode::UNSUPPORTED_MEDIA_TYPE,
            ApiError::PayloadTooLarge(_) => StatusCode::PAYLOAD_TOO_LARGE,
            ApiError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl From<MultipartError> for ApiError {
    fn from(err: MultipartError) -> Self {
        ApiError::BadRequest(format!("Multipart form parse error - {err}"))
    }
}

impl From<PayloadError> for ApiError {
    fn from(err: PayloadError) -> Self {
        ApiError::BadRequest(format!("Request body could not be read - {err}"))
    }
}

impl From<actix_web::error::BlockingError> for ApiError {
    fn from(err: actix_web::error::BlockingError) -> Self {
        ApiError::Internal(anyhow::anyhow!(err))
    }
}
