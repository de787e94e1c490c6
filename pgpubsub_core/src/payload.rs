//! Wire format for notification payloads.
//!
//! Every notification carries a UTF-8 JSON object of one of two shapes:
//!
//! - **Custom payload**: `{"kwargs": {..}, "context": {..}?}` — published by
//!   application code with explicit keyword arguments.
//! - **Trigger payload**: `{"app": .., "model": .., "old": .., "new": ..,
//!   "db_version"?, "context"?, "extras"?}` — produced database-side by a
//!   row trigger.
//!
//! A JSON `null` payload is a recovery hint: it tells listening workers to
//! drain the stored backlog for the channel rather than dispatch anything.

use serde::de::DeserializeOwned;
use serde_json::{Map, Value};

use crate::error::PayloadError;

/// A parsed notification payload, tagged by its shape.
#[derive(Debug, Clone, PartialEq)]
pub enum NotifyPayload {
    /// A `null` payload asking workers to replay stored notifications.
    Recover,
    /// A custom payload carrying keyword arguments.
    Custom(CustomPayload),
    /// A payload emitted by a database trigger, carrying row snapshots.
    Trigger(TriggerPayload),
}

impl NotifyPayload {
    /// Parses a payload from its raw JSON value.
    pub fn parse(value: &Value) -> Result<Self, PayloadError> {
        if value.is_null() {
            return Ok(NotifyPayload::Recover);
        }
        let object = value
            .as_object()
            .ok_or_else(|| PayloadError::Shape("expected a JSON object or null".into()))?;

        if object.contains_key("kwargs") {
            return Ok(NotifyPayload::Custom(CustomPayload::from_object(object)?));
        }
        if object.contains_key("app") && object.contains_key("model") {
            return Ok(NotifyPayload::Trigger(TriggerPayload::from_object(object)?));
        }
        Err(PayloadError::Shape(
            "object carries neither 'kwargs' nor 'app'/'model'".into(),
        ))
    }

    /// Parses a payload from its raw JSON text.
    pub fn parse_str(raw: &str) -> Result<Self, PayloadError> {
        let value: Value = serde_json::from_str(raw)?;
        Self::parse(&value)
    }
}

/// A custom payload: explicit keyword arguments plus optional context.
#[derive(Debug, Clone, PartialEq)]
pub struct CustomPayload {
    /// The keyword arguments, keyed by parameter name.
    pub kwargs: Map<String, Value>,
    /// The optional top-level `context` object.
    pub context: Option<Value>,
}

impl CustomPayload {
    fn from_object(object: &Map<String, Value>) -> Result<Self, PayloadError> {
        let kwargs = match object.get("kwargs") {
            Some(Value::Object(map)) => map.clone(),
            Some(_) => {
                return Err(PayloadError::FieldType {
                    field: "kwargs",
                    expected: "object",
                });
            }
            None => return Err(PayloadError::MissingField("kwargs")),
        };
        Ok(Self {
            kwargs,
            context: non_null(object.get("context")),
        })
    }

    /// Serializes the payload back into its wire form.
    ///
    /// Dates must already be encoded as ISO-8601 strings and sets as sorted
    /// arrays; `serde_json` does both for `chrono` types and `BTreeSet`.
    pub fn to_wire(&self) -> Value {
        let mut object = Map::new();
        object.insert("kwargs".into(), Value::Object(self.kwargs.clone()));
        if let Some(context) = &self.context {
            object.insert("context".into(), context.clone());
        }
        Value::Object(object)
    }
}

/// A trigger payload: row snapshots plus provenance of the producing table.
#[derive(Debug, Clone, PartialEq)]
pub struct TriggerPayload {
    /// Application label of the producing table.
    pub app: String,
    /// Model name of the producing table.
    pub model: String,
    /// Column map of the row before the operation; `None` on insert.
    pub old: Option<Value>,
    /// Column map of the row after the operation; `None` on delete.
    pub new: Option<Value>,
    /// Migration identifier of the producing application at publish time.
    pub db_version: Option<String>,
    /// The optional top-level `context` object.
    pub context: Option<Value>,
    /// The optional top-level `extras` object.
    pub extras: Option<Value>,
}

impl TriggerPayload {
    fn from_object(object: &Map<String, Value>) -> Result<Self, PayloadError> {
        Ok(Self {
            app: required_str(object, "app")?,
            model: required_str(object, "model")?,
            old: non_null(object.get("old")),
            new: non_null(object.get("new")),
            db_version: object.get("db_version").and_then(version_string),
            context: non_null(object.get("context")),
            extras: non_null(object.get("extras")),
        })
    }

    /// The `app.Model` label used by row decoders.
    pub fn model_label(&self) -> String {
        format!("{}.{}", self.app, self.model)
    }
}

/// Decodes a kwargs object into the listener's declared parameter struct.
///
/// ```
/// # use serde::Deserialize;
/// # use serde_json::json;
/// #[derive(Deserialize)]
/// struct PostReads {
///     model_id: i64,
///     date: chrono::NaiveDate,
/// }
///
/// let kwargs = json!({"model_id": 12, "date": "2022-01-24"});
/// let decoded: PostReads =
///     pgpubsub_core::decode_kwargs(kwargs.as_object().unwrap()).unwrap();
/// assert_eq!(decoded.model_id, 12);
/// ```
pub fn decode_kwargs<T: DeserializeOwned>(kwargs: &Map<String, Value>) -> Result<T, PayloadError> {
    serde_json::from_value(Value::Object(kwargs.clone()))
        .map_err(|e| PayloadError::Kwargs(e.to_string()))
}

fn required_str(object: &Map<String, Value>, field: &'static str) -> Result<String, PayloadError> {
    match object.get(field) {
        Some(Value::String(s)) => Ok(s.clone()),
        Some(_) => Err(PayloadError::FieldType {
            field,
            expected: "string",
        }),
        None => Err(PayloadError::MissingField(field)),
    }
}

fn non_null(value: Option<&Value>) -> Option<Value> {
    value.filter(|v| !v.is_null()).cloned()
}

// Migration identifiers arrive as integers from the trigger and as text from
// the stored table; normalise both to strings.
fn version_string(value: &Value) -> Option<String> {
    match value {
        Value::String(s) => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        _ => None,
    }
}
