//! Row snapshots and the pluggable row decoder.
//!
//! Trigger payloads embed the `old`/`new` row states as raw column maps
//! (the trigger serializes the row as it looks in the database). The row
//! decoder reshapes those into the fixtures-style `{model, pk, fields}`
//! snapshot listeners consume; the surrounding application can install its
//! own decoder when its column naming diverges from the default rules.

use std::collections::HashMap;

use serde_json::{Map, Value};

use crate::error::PayloadError;

/// A decoded row in the fixtures shape: model label, primary key, fields.
#[derive(Debug, Clone, PartialEq)]
pub struct RowSnapshot {
    /// The `app.Model` label of the row's table.
    pub model: String,
    /// The primary key value.
    pub pk: Value,
    /// The remaining fields, keyed by field name.
    pub fields: Map<String, Value>,
}

impl RowSnapshot {
    /// Convenience accessor for a field value.
    pub fn field(&self, name: &str) -> Option<&Value> {
        self.fields.get(name)
    }
}

/// Decodes a raw trigger column map into a [`RowSnapshot`].
pub trait RowDecoder: Send + Sync {
    /// Decodes the `old` or `new` state of a trigger payload.
    ///
    /// `state` is the raw column map exactly as serialized by the trigger.
    fn decode(&self, app: &str, model: &str, state: &Value) -> Result<RowSnapshot, PayloadError>;
}

/// The default decoder.
///
/// Rules, in order, for each column:
/// - an explicitly registered alias renames the column to its field name;
/// - a `xxx_id` column becomes the relation field `xxx`;
/// - anything else is kept verbatim.
///
/// The primary key is read from the `pk_field` column (default `id`).
pub struct ColumnRowDecoder {
    pk_field: String,
    aliases: HashMap<String, String>,
}

impl Default for ColumnRowDecoder {
    fn default() -> Self {
        Self {
            pk_field: "id".into(),
            aliases: HashMap::new(),
        }
    }
}

impl ColumnRowDecoder {
    /// Creates a decoder with the default rules.
    pub fn new() -> Self {
        Self::default()
    }

    /// Overrides the primary-key column name.
    pub fn with_pk_field(mut self, pk_field: impl Into<String>) -> Self {
        self.pk_field = pk_field.into();
        self
    }

    /// Registers a column-to-field rename, for tables whose columns carry
    /// alternative names.
    pub fn with_alias(mut self, column: impl Into<String>, field: impl Into<String>) -> Self {
        self.aliases.insert(column.into(), field.into());
        self
    }
}

impl RowDecoder for ColumnRowDecoder {
    fn decode(&self, app: &str, model: &str, state: &Value) -> Result<RowSnapshot, PayloadError> {
        let label = format!("{app}.{model}");
        let columns = state.as_object().ok_or_else(|| PayloadError::Row {
            model: label.clone(),
            reason: "row state is not a JSON object".into(),
        })?;

        let mut fields = Map::new();
        let mut pk = None;
        for (column, value) in columns {
            if *column == self.pk_field {
                pk = Some(value.clone());
            }
            let field = match self.aliases.get(column) {
                Some(alias) => alias.clone(),
                None => column
                    .strip_suffix("_id")
                    .map(str::to_owned)
                    .unwrap_or_else(|| column.clone()),
            };
            fields.insert(field, value.clone());
        }

        let pk = pk.ok_or_else(|| PayloadError::Row {
            model: label.clone(),
            reason: format!("missing primary-key column '{}'", self.pk_field),
        })?;

        Ok(RowSnapshot {
            model: label,
            pk,
            fields,
        })
    }
}
