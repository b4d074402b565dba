//! What the API accepts and what it sends back. Request bodies of every
//! content type are first collected into a `Submission`, which is then
//! validated field by field into an `AnalysisRequest`.

use crate::analyzer::{Analysis, AnalysisParams, Gender};
use crate::upload::{self, ImageFieldError, ImageInput, RawFile};
use anyhow::{anyhow, Result};
use serde::Serialize;
use serde_json::{Map, Value};
use std::collections::{BTreeMap, HashMap};

const REQUIRED: &str = "This field is required.";
const NULL: &str = "This field may not be null.";
const INVALID_INTEGER: &str = "A valid integer is required.";
const INVALID_BOOLEAN: &str = "Must be a valid boolean.";

const TRUE_VALUES: [&str; 6] = ["t", "true", "y", "yes", "on", "1"];
const FALSE_VALUES: [&str; 6] = ["f", "false", "n", "no", "off", "0"];

/// A request body, independent of how it was encoded
#[derive(Debug, Default)]
pub struct Submission {
    /// Plain values, e.g. JSON members or multipart text parts
    pub fields: Map<String, Value>,

    /// Multipart parts that carried a filename
    pub files: HashMap<String, RawFile>,
}

/// Validation messages keyed by field name. Serializes as
/// `{"field": ["message", ...]}`.
#[derive(Debug, Default, Clone, PartialEq, Eq, Serialize)]
#[serde(transparent)]
pub struct FieldErrors(BTreeMap<String, Vec<String>>);

impl FieldErrors {
    pub fn add(&mut self, field: &str, message: impl Into<String>) {
        self.0
            .entry(field.to_owned())
            .or_default()
            .push(message.into());
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn get(&self, field: &str) -> Option<&[String]> {
        self.0.get(field).map(Vec::as_slice)
    }
}

/// A validated analysis request
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AnalysisRequest {
    pub image: RawFile,
    pub score: bool,
    pub classification: bool,
    pub age: i64,
    pub gender: Gender,
}

impl AnalysisRequest {
    /// Validate every field of `submission`, collecting all errors
    pub fn validate(mut submission: Submission) -> Result<Self, FieldErrors> {
        let mut errors = FieldErrors::default();

        let image = image_input(&mut submission)
            .and_then(upload::normalize)
            .map_err(|err| errors.add("image", err.to_string()))
            .ok();

        let score = optional_boolean(&submission.fields, "score", &mut errors);
        let classification = optional_boolean(&submission.fields, "classification", &mut errors);
        let age = required(&submission.fields, "age", &mut errors).and_then(|value| {
            parse_integer(value).or_else(|| {
                errors.add("age", INVALID_INTEGER);
                None
            })
        });
        let gender = required(&submission.fields, "gender", &mut errors).and_then(|value| {
            parse_gender(value).or_else(|| {
                errors.add("gender", invalid_choice(value));
                None
            })
        });

        match (image, score, classification, age, gender) {
            (Some(image), Some(score), Some(classification), Some(age), Some(gender))
                if errors.is_empty() =>
            {
                Ok(AnalysisRequest {
                    image,
                    score,
                    classification,
                    age,
                    gender,
                })
            }
            _ => Err(errors),
        }
    }

    /// Parameters for the analyzer. A flag is set if it is true in the body
    /// or if its name appears in the query string at all, so `?score` works.
    pub fn params(&self, query: &HashMap<String, String>) -> AnalysisParams {
        AnalysisParams {
            score: self.score || query.contains_key("score"),
            classification: self.classification || query.contains_key("classification"),
            age: self.age,
            gender: self.gender,
        }
    }
}

/// Pick the `image` value out of a submission. Uploaded files take
/// precedence over a base64 string with the same name.
fn image_input(submission: &mut Submission) -> Result<ImageInput, ImageFieldError> {
    if let Some(file) = submission.files.remove("image") {
        return Ok(ImageInput::RawFile(file));
    }
    match submission.fields.remove("image") {
        Some(Value::String(data)) => Ok(ImageInput::Base64(data)),
        Some(Value::Null) => Err(ImageFieldError::Null),
        Some(_) => Err(ImageFieldError::NotAFile),
        None => Err(ImageFieldError::Missing),
    }
}

fn required<'a>(
    fields: &'a Map<String, Value>,
    name: &str,
    errors: &mut FieldErrors,
) -> Option<&'a Value> {
    match fields.get(name) {
        None => {
            errors.add(name, REQUIRED);
            None
        }
        Some(Value::Null) => {
            errors.add(name, NULL);
            None
        }
        Some(value) => Some(value),
    }
}

/// A missing flag is `false`
fn optional_boolean(
    fields: &Map<String, Value>,
    name: &str,
    errors: &mut FieldErrors,
) -> Option<bool> {
    match fields.get(name) {
        None => Some(false),
        Some(Value::Null) => {
            errors.add(name, NULL);
            None
        }
        Some(value) => parse_boolean(value).or_else(|| {
            errors.add(name, INVALID_BOOLEAN);
            None
        }),
    }
}

pub(crate) fn parse_boolean(value: &Value) -> Option<bool> {
    match value {
        Value::Bool(b) => Some(*b),
        Value::Number(n) => match n.as_f64() {
            Some(f) if f == 1.0 => Some(true),
            Some(f) if f == 0.0 => Some(false),
            _ => None,
        },
        Value::String(s) => {
            let s = s.to_ascii_lowercase();
            if TRUE_VALUES.contains(&s.as_str()) {
                Some(true)
            } else if FALSE_VALUES.contains(&s.as_str()) {
                Some(false)
            } else {
                None
            }
        }
        _ => None,
    }
}

/// Integers, integral floats and strings like `" 12 "` or `"12.0"`
pub(crate) fn parse_integer(value: &Value) -> Option<i64> {
    match value {
        Value::Number(n) => n.as_i64().or_else(|| {
            n.as_f64()
                .filter(|f| f.fract() == 0.0 && f.abs() < i64::MAX as f64)
                .map(|f| f as i64)
        }),
        Value::String(s) => {
            let s = s.trim();
            let s = match s.rfind('.') {
                Some(dot) if s[dot + 1..].chars().all(|c| c == '0') => &s[..dot],
                _ => s,
            };
            s.parse().ok()
        }
        _ => None,
    }
}

fn parse_gender(value: &Value) -> Option<Gender> {
    value.as_str().and_then(Gender::from_code)
}

fn invalid_choice(value: &Value) -> String {
    match value {
        Value::String(s) => format!("\"{s}\" is not a valid choice."),
        other => format!("\"{other}\" is not a valid choice."),
    }
}

/// The rendered analyzer output. Anything the analyzer returns besides
/// these four keys is dropped.
#[derive(Debug, Default, Clone, PartialEq, Serialize)]
pub struct AnalysisOutput {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub score: Option<f64>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub classification: Option<String>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub age: Option<i64>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub gender: Option<String>,
}

impl TryFrom<&Analysis> for AnalysisOutput {
    type Error = anyhow::Error;

    fn try_from(analysis: &Analysis) -> Result<Self> {
        let score = match analysis.get("score") {
            None | Some(Value::Null) => None,
            Some(Value::Number(n)) => n.as_f64(),
            Some(Value::String(s)) => Some(
                s.trim()
                    .parse()
                    .map_err(|_| anyhow!("analyzer returned a non-numeric score: {s:?}"))?,
            ),
            Some(other) => return Err(anyhow!("analyzer returned a non-numeric score: {other}")),
        };

        let age = match analysis.get("age") {
            None | Some(Value::Null) => None,
            Some(Value::Number(n)) => n.as_i64().or_else(|| n.as_f64().map(|f| f as i64)),
            Some(other) => Some(
                parse_integer(other)
                    .ok_or_else(|| anyhow!("analyzer returned a non-integer age: {other}"))?,
            ),
        };

        Ok(AnalysisOutput {
            score,
            classification: analysis.get("classification").and_then(render_string),
            age,
            gender: analysis.get("gender").and_then(render_string),
        })
    }
}

fn render_string(value: &Value) -> Option<String> {
    match value {
        Value::Null => None,
        Value::String(s) => Some(s.clone()),
        other => Some(other.to_string()),
    }
}
