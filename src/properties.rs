//! Attribute values of uploaded features and their display formatting.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

/// Values longer than this are cut when shown in a popup.
pub const MAX_DISPLAY_CHARS: usize = 256;

/// A scalar attribute value read from a shapefile's attribute table.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum PropertyValue {
    /// An empty field.
    Null,

    /// A logical field.
    Bool(bool),

    /// A numeric field.
    Number(f64),

    /// A character, memo or date field.
    Text(String),
}

/// The attribute map of a feature, keyed by field name.
pub type Properties = BTreeMap<String, PropertyValue>;

impl PropertyValue {
    /// The value as a feature label: non-blank text or a number. `None` for everything else.
    pub fn as_label(&self) -> Option<String> {
        match self {
            PropertyValue::Text(text) if !text.trim().is_empty() => Some(text.trim().to_string()),
            PropertyValue::Number(number) if number.is_finite() => Some(self.to_string()),
            _ => None,
        }
    }
}

impl fmt::Display for PropertyValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PropertyValue::Null => Ok(()),
            PropertyValue::Bool(value) => write!(f, "{value}"),
            PropertyValue::Number(value) if value.fract() == 0.0 && value.abs() < 1e15 => {
                write!(f, "{}", *value as i64)
            }
            PropertyValue::Number(value) => write!(f, "{value}"),
            PropertyValue::Text(text) => f.write_str(text),
        }
    }
}

impl From<&serde_json::Value> for PropertyValue {
    fn from(value: &serde_json::Value) -> Self {
        match value {
            serde_json::Value::Null => PropertyValue::Null,
            serde_json::Value::Bool(b) => PropertyValue::Bool(*b),
            serde_json::Value::Number(n) => n
                .as_f64()
                .map(PropertyValue::Number)
                .unwrap_or(PropertyValue::Null),
            serde_json::Value::String(s) => PropertyValue::Text(s.clone()),
            other => PropertyValue::Text(other.to_string()),
        }
    }
}

impl From<&PropertyValue> for serde_json::Value {
    fn from(value: &PropertyValue) -> Self {
        match value {
            PropertyValue::Null => serde_json::Value::Null,
            PropertyValue::Bool(b) => serde_json::Value::Bool(*b),
            PropertyValue::Number(n) => serde_json::Number::from_f64(*n)
                .map(serde_json::Value::Number)
                .unwrap_or(serde_json::Value::Null),
            PropertyValue::Text(s) => serde_json::Value::String(s.clone()),
        }
    }
}

/// Converts an attribute map to a GeoJSON properties object.
pub fn properties_to_json(properties: &Properties) -> serde_json::Map<String, serde_json::Value> {
    properties
        .iter()
        .map(|(key, value)| (key.clone(), serde_json::Value::from(value)))
        .collect()
}

/// Converts a GeoJSON properties object to an attribute map.
pub fn properties_from_json(object: &serde_json::Map<String, serde_json::Value>) -> Properties {
    object
        .iter()
        .map(|(key, value)| (key.clone(), PropertyValue::from(value)))
        .collect()
}

/// Formats a value for a popup.
///
/// Popups are egui labels, so the text is never interpreted as markup. Control characters are
/// still flattened to spaces and very long values are cut, since both come straight from the
/// uploaded file.
pub fn display_value(value: &PropertyValue) -> String {
    let text = value.to_string();
    let mut display: String = text
        .chars()
        .take(MAX_DISPLAY_CHARS)
        .map(|c| if c.is_control() { ' ' } else { c })
        .collect();
    if text.chars().count() > MAX_DISPLAY_CHARS {
        display.push('…');
    }
    display
}

/// Key/value rows for an attribute popup, ordered by key.
pub fn attribute_rows(properties: &Properties) -> Vec<(String, String)> {
    properties
        .iter()
        .map(|(key, value)| {
            (
                display_value(&PropertyValue::Text(key.clone())),
                display_value(value),
            )
        })
        .collect()
}
