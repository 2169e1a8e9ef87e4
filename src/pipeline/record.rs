use serde_json::{Map, Value};
use std::collections::BTreeMap;
use tracing::debug;

use crate::Result;

/// Flat field name to field value mapping.
pub type Record = BTreeMap<String, String>;

/// Decodes a JSON object into a [`Record`].
///
/// Anything that is not a JSON object decodes to an empty record; malformed
/// input is dropped, never fatal. String values are taken as-is, other
/// scalars and nested values keep their JSON text, nulls are skipped.
pub fn decode(payload: &str) -> Record {
    match serde_json::from_str::<Map<String, Value>>(payload) {
        Ok(fields) => fields
            .into_iter()
            .filter_map(|(name, value)| field_text(value).map(|text| (name, text)))
            .collect(),
        Err(e) => {
            debug!(error = %e, payload_len = payload.len(), "Malformed message decoded as empty record");
            Record::new()
        }
    }
}

pub fn encode(record: &Record) -> Result<String> {
    serde_json::to_string(record).map_err(Into::into)
}

fn field_text(value: Value) -> Option<String> {
    match value {
        Value::Null => None,
        Value::String(s) => Some(s),
        other => Some(other.to_string()),
    }
}
