//! Concrete test values with provenance.
//!
//! A value remembers which generator produced it so reuse and reporting can
//! tell a replayed assignment from a fresh random draw.
use serde::{Deserialize, Serialize};
use serde_json::Value as Json;
use std::fmt;

/// Where a value came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Generator {
    Default,
    Example,
    Random,
    Dynamic,
    Reused,
    Null,
    Enum,
}

impl fmt::Display for Generator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            Self::Default => "default",
            Self::Example => "example",
            Self::Random => "random",
            Self::Dynamic => "dynamic",
            Self::Reused => "reused",
            Self::Null => "null",
            Self::Enum => "enum",
        };
        f.write_str(label)
    }
}

/// Declared data type of the factor that produced a value.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DataType {
    String,
    Integer,
    Number,
    Boolean,
    Date,
    Time,
    DateTime,
    Array,
    Object,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Value {
    pub val: Json,
    pub generator: Generator,
    pub data_type: DataType,
}

impl Value {
    pub fn new(val: Json, generator: Generator, data_type: DataType) -> Self {
        Self {
            val,
            generator,
            data_type,
        }
    }

    pub fn null(data_type: DataType) -> Self {
        Self::new(Json::Null, Generator::Null, data_type)
    }

    pub fn is_null(&self) -> bool {
        self.generator == Generator::Null || self.val.is_null()
    }

    /// Same value, relabelled as replayed from the reuse cache.
    pub fn reused(&self) -> Self {
        let generator = if self.generator == Generator::Null {
            Generator::Null
        } else {
            Generator::Reused
        };
        Self::new(self.val.clone(), generator, self.data_type)
    }
}

/// Render a JSON value the way it travels in a path, query or header slot.
pub fn render_plain(val: &Json) -> String {
    match val {
        Json::Null => String::new(),
        Json::String(text) => text.clone(),
        Json::Bool(flag) => flag.to_string(),
        Json::Number(number) => number.to_string(),
        Json::Array(items) => items
            .iter()
            .map(render_plain)
            .collect::<Vec<_>>()
            .join(","),
        Json::Object(_) => val.to_string(),
    }
}

/// Coerce a raw JSON value to the representation a data type expects.
///
/// Dynamic values harvested from responses are often strings where the
/// consumer declares an integer (or the reverse); unknown shapes pass through.
pub fn coerce(val: &Json, data_type: DataType) -> Json {
    match (data_type, val) {
        (DataType::Integer, Json::String(text)) => text
            .trim()
            .parse::<i64>()
            .map(Json::from)
            .unwrap_or_else(|_| val.clone()),
        (DataType::Number, Json::String(text)) => text
            .trim()
            .parse::<f64>()
            .ok()
            .and_then(serde_json::Number::from_f64)
            .map(Json::Number)
            .unwrap_or_else(|| val.clone()),
        (DataType::String, Json::Number(number)) => Json::String(number.to_string()),
        (DataType::String, Json::Bool(flag)) => Json::String(flag.to_string()),
        _ => val.clone(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn render_plain_joins_arrays_and_keeps_strings_raw() {
        assert_eq!(render_plain(&json!("abc")), "abc");
        assert_eq!(render_plain(&json!(42)), "42");
        assert_eq!(render_plain(&json!([1, "b", true])), "1,b,true");
        assert_eq!(render_plain(&Json::Null), "");
    }

    #[test]
    fn coerce_converts_between_ids_and_numbers() {
        assert_eq!(coerce(&json!("42"), DataType::Integer), json!(42));
        assert_eq!(coerce(&json!(42), DataType::String), json!("42"));
        assert_eq!(coerce(&json!("x"), DataType::Integer), json!("x"));
    }

    #[test]
    fn reused_keeps_null_provenance() {
        let value = Value::null(DataType::String);
        assert_eq!(value.reused().generator, Generator::Null);
        let value = Value::new(json!(3), Generator::Random, DataType::Integer);
        assert_eq!(value.reused().generator, Generator::Reused);
    }
}
