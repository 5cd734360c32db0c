//! Declarative payload schemas.
//!
//! A schema lists the top-level fields a queue's payload may carry, whether
//! each is required, and a coarse type check. It is deliberately shallow:
//! nested structure is the handler's business.

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Coarse JSON type of a payload field.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FieldKind {
    String,
    Number,
    Integer,
    Boolean,
    Object,
    Array,
    Any,
}

impl FieldKind {
    pub fn matches(&self, value: &Value) -> bool {
        match self {
            FieldKind::String => value.is_string(),
            FieldKind::Number => value.is_number(),
            FieldKind::Integer => value.is_i64() || value.is_u64(),
            FieldKind::Boolean => value.is_boolean(),
            FieldKind::Object => value.is_object(),
            FieldKind::Array => value.is_array(),
            FieldKind::Any => true,
        }
    }
}

impl std::fmt::Display for FieldKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            FieldKind::String => "a string",
            FieldKind::Number => "a number",
            FieldKind::Integer => "an integer",
            FieldKind::Boolean => "a boolean",
            FieldKind::Object => "an object",
            FieldKind::Array => "an array",
            FieldKind::Any => "any value",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FieldSpec {
    pub name: String,
    #[serde(rename = "type", default = "default_kind")]
    pub kind: FieldKind,
    #[serde(default)]
    pub required: bool,
}

fn default_kind() -> FieldKind {
    FieldKind::Any
}

/// Top-level field rules for a queue's payloads.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PayloadSchema {
    #[serde(default)]
    pub fields: Vec<FieldSpec>,
}

impl PayloadSchema {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn required(mut self, name: impl Into<String>, kind: FieldKind) -> Self {
        self.fields.push(FieldSpec {
            name: name.into(),
            kind,
            required: true,
        });
        self
    }

    pub fn optional(mut self, name: impl Into<String>, kind: FieldKind) -> Self {
        self.fields.push(FieldSpec {
            name: name.into(),
            kind,
            required: false,
        });
        self
    }

    /// Checks `payload`, returning every violation found.
    ///
    /// A `null` value counts as absent.
    pub fn validate(&self, payload: &Value) -> Result<(), Vec<String>> {
        if self.fields.is_empty() {
            return Ok(());
        }

        let Some(object) = payload.as_object() else {
            return Err(vec!["payload must be a JSON object".to_string()]);
        };

        let violations: Vec<String> = self
            .fields
            .iter()
            .filter_map(|field| match object.get(&field.name) {
                None | Some(Value::Null) if field.required => {
                    Some(format!("missing required field '{}'", field.name))
                }
                None | Some(Value::Null) => None,
                Some(value) if !field.kind.matches(value) => {
                    Some(format!("field '{}' must be {}", field.name, field.kind))
                }
                Some(_) => None,
            })
            .collect();

        if violations.is_empty() {
            Ok(())
        } else {
            Err(violations)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn build_schema() -> PayloadSchema {
        PayloadSchema::new()
            .required("project_id", FieldKind::String)
            .optional("branch", FieldKind::String)
            .optional("retries", FieldKind::Integer)
    }

    #[test]
    fn test_valid_payload() {
        let payload = json!({"project_id": "p-1", "branch": "main", "extra": [1, 2]});
        assert!(build_schema().validate(&payload).is_ok());
    }

    #[test]
    fn test_missing_required_and_wrong_types() {
        let payload = json!({"branch": 7, "retries": 1.5});
        let violations = build_schema().validate(&payload).unwrap_err();
        assert_eq!(
            violations,
            vec![
                "missing required field 'project_id'".to_string(),
                "field 'branch' must be a string".to_string(),
                "field 'retries' must be an integer".to_string(),
            ]
        );
    }

    #[test]
    fn test_null_counts_as_absent() {
        let payload = json!({"project_id": null, "branch": null});
        let violations = build_schema().validate(&payload).unwrap_err();
        assert_eq!(violations, vec!["missing required field 'project_id'".to_string()]);
    }

    #[test]
    fn test_non_object_payload() {
        assert!(build_schema().validate(&json!([1])).is_err());
        assert!(PayloadSchema::new().validate(&json!("anything")).is_ok());
    }

    #[test]
    fn test_schema_deserializes_from_yaml_shape() {
        let schema: PayloadSchema = serde_json::from_value(json!({
            "fields": [
                {"name": "command", "type": "string", "required": true},
                {"name": "workdir"}
            ]
        }))
        .expect("schema should deserialize");
        assert_eq!(schema.fields[1].kind, FieldKind::Any);
        assert!(!schema.fields[1].required);
    }
}
