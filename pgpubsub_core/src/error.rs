//! Error types shared by the payload layer.

/// Errors raised while parsing or decoding a notification payload.
#[derive(Debug, thiserror::Error)]
pub enum PayloadError {
    /// The payload was not valid JSON.
    #[error("payload is not valid JSON: {0}")]
    Json(#[from] serde_json::Error),

    /// The payload was valid JSON but not a recognised payload shape.
    #[error("payload is not a recognised notification shape: {0}")]
    Shape(String),

    /// A required field was missing from the payload.
    #[error("payload is missing required field '{0}'")]
    MissingField(&'static str),

    /// A field had an unexpected JSON type.
    #[error("payload field '{field}' has unexpected type (expected {expected})")]
    FieldType {
        /// Name of the offending field.
        field: &'static str,
        /// Human-readable description of the expected JSON type.
        expected: &'static str,
    },

    /// A keyword argument could not be decoded into the listener's
    /// declared parameter type.
    #[error("failed to decode kwargs: {0}")]
    Kwargs(String),

    /// A row snapshot could not be decoded.
    #[error("failed to decode row for model '{model}': {reason}")]
    Row {
        /// The `app.Model` label of the row being decoded.
        model: String,
        /// Why decoding failed.
        reason: String,
    },
}
