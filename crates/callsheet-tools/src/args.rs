//! Argument extraction helpers shared by the tools.

use callsheet_core::error::{Error, Result};
use serde_json::Value;

/// How an entity is being looked up.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Lookup {
    Id(String),
    Name(String),
}

/// Accepts either an `id` or a `name` argument; exactly one is required.
pub fn name_or_id(arguments: &Value) -> Result<Lookup> {
    let id = optional_str(arguments, "id");
    let name = optional_str(arguments, "name");
    match (id, name) {
        (Some(id), _) if !id.trim().is_empty() => Ok(Lookup::Id(id)),
        (_, Some(name)) if !name.trim().is_empty() => Ok(Lookup::Name(name)),
        _ => Err(Error::validation("either 'id' or 'name' is required")),
    }
}

pub fn required_str(arguments: &Value, key: &str) -> Result<String> {
    optional_str(arguments, key)
        .filter(|v| !v.trim().is_empty())
        .ok_or_else(|| Error::validation(format!("'{key}' is required")))
}

pub fn optional_str(arguments: &Value, key: &str) -> Option<String> {
    arguments.get(key).and_then(Value::as_str).map(str::to_string)
}

pub fn optional_usize(arguments: &Value, key: &str, default: usize) -> Result<usize> {
    match arguments.get(key) {
        None | Some(Value::Null) => Ok(default),
        Some(value) => value
            .as_u64()
            .map(|v| v as usize)
            .ok_or_else(|| Error::validation(format!("'{key}' must be a non-negative integer"))),
    }
}

pub fn optional_f64(arguments: &Value, key: &str, default: f64) -> Result<f64> {
    match arguments.get(key) {
        None | Some(Value::Null) => Ok(default),
        Some(value) => value
            .as_f64()
            .ok_or_else(|| Error::validation(format!("'{key}' must be a number"))),
    }
}

/// Schema fragment for a `name`/`id` lookup object.
pub fn name_or_id_schema(entity: &str) -> Value {
    serde_json::json!({
        "type": "object",
        "properties": {
            "id": {"type": "string", "description": format!("Exact {entity} id")},
            "name": {"type": "string", "description": format!("{entity} name (case-insensitive)")}
        },
        "anyOf": [{"required": ["id"]}, {"required": ["name"]}]
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn lookup_prefers_id() {
        assert_eq!(
            name_or_id(&json!({"id": "p1", "name": "Jane"})).unwrap(),
            Lookup::Id("p1".to_string())
        );
        assert_eq!(
            name_or_id(&json!({"name": "Jane"})).unwrap(),
            Lookup::Name("Jane".to_string())
        );
        assert!(name_or_id(&json!({})).is_err());
        assert!(name_or_id(&json!({"id": "  "})).is_err());
    }

    #[test]
    fn required_str_rejects_blank() {
        assert!(required_str(&json!({"q": ""}), "q").is_err());
        assert!(required_str(&json!({}), "q").is_err());
        assert_eq!(required_str(&json!({"q": "x"}), "q").unwrap(), "x");
    }

    #[test]
    fn numeric_defaults_and_validation() {
        assert_eq!(optional_usize(&json!({}), "k", 10).unwrap(), 10);
        assert_eq!(optional_usize(&json!({"k": 3}), "k", 10).unwrap(), 3);
        assert!(optional_usize(&json!({"k": -1}), "k", 10).is_err());
        assert!(optional_usize(&json!({"k": "three"}), "k", 10).is_err());

        assert_eq!(optional_f64(&json!({}), "min_score", 0.6).unwrap(), 0.6);
        assert!(optional_f64(&json!({"min_score": []}), "min_score", 0.6).is_err());
    }
}
