//! The JSON API. `POST /` takes an image and the request parameters, hands
//! the image to the analyzer and renders what comes back.

use super::protocol::{AnalysisOutput, AnalysisRequest, Submission};
use super::{ApiError, AppState};
use crate::analyzer::analyze_upload;
use crate::upload::RawFile;
use actix_multipart::Multipart;
use actix_web::http::header::ContentType;
use actix_web::mime;
use actix_web::{get, post, web, HttpMessage, HttpRequest, HttpResponse, Responder};
use futures_util::{StreamExt as _, TryStreamExt as _};
use serde_json::{json, Value};
use std::collections::HashMap;
use tracing::{debug, info};

type Result<T> = std::result::Result<T, ApiError>;

const USAGE: &str = "Please make a POST request with an image";

const FRONTEND: &str = include_str!("../../static/frontend.html");

#[get("/")]
pub async fn usage() -> impl Responder {
    web::Json(json!({ "message": USAGE }))
}

/// A small page with an upload form, for trying the API from a browser
#[get("/frontend/")]
pub async fn frontend() -> HttpResponse {
    HttpResponse::Ok()
        .content_type(ContentType::html())
        .body(FRONTEND)
}

/// Accept an image as multipart/form-data or base64 encoded in JSON, run the
/// analyzer on it and return its results
#[post("/")]
pub async fn analyze(
    req: HttpRequest,
    query: web::Query<HashMap<String, String>>,
    payload: web::Payload,
    state: web::Data<AppState>,
) -> Result<HttpResponse> {
    let submission = read_submission(&req, payload, state.max_body_bytes).await?;
    // Validation decodes the whole image, keep it off the async workers
    let request = web::block(move || AnalysisRequest::validate(submission))
        .await?
        .map_err(ApiError::Validation)?;
    let params = request.params(&query);

    info!(
        "analyzing {} ({} bytes) with {params:?}",
        request.image.name,
        request.image.content.len()
    );

    let analyzer = state.analyzer.clone();
    let analysis =
        web::block(move || analyze_upload(analyzer.as_ref(), &request.image, &params)).await??;

    let output = AnalysisOutput::try_from(&analysis)?;
    Ok(HttpResponse::Created().json(output))
}

/// Collect the request body into a `Submission`, whatever its content type
async fn read_submission(
    req: &HttpRequest,
    payload: web::Payload,
    limit: usize,
) -> Result<Submission> {
    let mime = req
        .mime_type()
        .map_err(|_| ApiError::UnsupportedMediaType(req.content_type().to_owned()))?;
    debug!("reading {mime:?} request body");

    let Some(mime) = mime else {
        // No content type is only fine without a body
        return if read_body(payload, limit).await?.is_empty() {
            Ok(Submission::default())
        } else {
            Err(ApiError::UnsupportedMediaType(String::new()))
        };
    };

    if mime.type_() == mime::MULTIPART && mime.subtype() == mime::FORM_DATA {
        read_multipart(Multipart::new(req.headers(), payload), limit).await
    } else if mime.type_() == mime::APPLICATION && mime.subtype() == mime::WWW_FORM_URLENCODED {
        read_urlencoded(&read_body(payload, limit).await?)
    } else if (mime.type_() == mime::APPLICATION && mime.subtype() == mime::JSON)
        || mime.suffix() == Some(mime::JSON)
    {
        read_json(&read_body(payload, limit).await?)
    } else {
        Err(ApiError::UnsupportedMediaType(mime.essence_str().to_owned()))
    }
}

async fn read_body(mut payload: web::Payload, limit: usize) -> Result<web::BytesMut> {
    let mut body = web::BytesMut::new();
    while let Some(chunk) = payload.next().await {
        let chunk = chunk?;
        if body.len() + chunk.len() > limit {
            return Err(ApiError::PayloadTooLarge(limit));
        }
        body.extend_from_slice(&chunk);
    }
    Ok(body)
}

async fn read_multipart(mut multipart: Multipart, limit: usize) -> Result<Submission> {
    let mut submission = Submission::default();
    let mut total = 0;

    while let Some(mut field) = multipart.try_next().await? {
        let name = match field.name() {
            Some(name) => name.to_owned(),
            None => continue,
        };
        let filename = field
            .content_disposition()
            .and_then(|cd| cd.get_filename())
            .map(str::to_owned);

        let mut data = Vec::new();
        while let Some(chunk) = field.try_next().await? {
            total += chunk.len();
            if total > limit {
                return Err(ApiError::PayloadTooLarge(limit));
            }
            data.extend_from_slice(&chunk);
        }

        match filename {
            // Browsers send an empty filename for a file input left blank
            Some(filename) if filename.is_empty() => {}
            Some(filename) => {
                submission.files.insert(name, RawFile::new(filename, data));
            }
            None => {
                let text = String::from_utf8(data).map_err(|_| {
                    ApiError::BadRequest(format!(
                        "Multipart form parse error - field {name:?} is not valid UTF-8"
                    ))
                })?;
                submission.fields.insert(name, Value::String(text));
            }
        }
    }

    Ok(submission)
}

fn read_urlencoded(body: &[u8]) -> Result<Submission> {
    let body = std::str::from_utf8(body)
        .map_err(|_| ApiError::BadRequest("Form parse error - body is not valid UTF-8".into()))?;
    let pairs = web::Query::<Vec<(String, String)>>::from_query(body)
        .map_err(|err| ApiError::BadRequest(format!("Form parse error - {err}")))?
        .into_inner();

    let mut submission = Submission::default();
    for (name, value) in pairs {
        submission.fields.insert(name, Value::String(value));
    }
    Ok(submission)
}

fn read_json(body: &[u8]) -> Result<Submission> {
    if body.is_empty() {
        return Ok(Submission::default());
    }

    match serde_json::from_slice::<Value>(body) {
        Ok(Value::Object(fields)) => Ok(Submission {
            fields,
            ..Default::default()
        }),
        Ok(other) => Err(ApiError::validation(
            "non_field_errors",
            format!(
                "Invalid data. Expected a dictionary, but got {}.",
                json_type_name(&other)
            ),
        )),
        Err(err) => Err(ApiError::BadRequest(format!("JSON parse error - {err}"))),
    }
}

fn json_type_name(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "bool",
        Value::Number(n) if n.is_f64() => "float",
        Value::Number(_) => "int",
        Value::String(_) => "str",
        Value::Array(_) => "list",
        Value::Object(_) => "dict",
    }
}
