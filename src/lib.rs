//! An HTTP API that takes a photo, as a multipart upload or base64 encoded in
//! JSON, runs an external analyzer on it and returns the results as JSON.

pub mod analyzer;
pub mod config;
pub mod server;
pub mod upload;
