//! Structural validation of tool input against its declared schema
//!
//! Covers the JSON Schema subset tool catalogues actually use: `type`,
//! `properties`, `required`, `enum`, `items` and `additionalProperties: false`.
//! Anything else in the schema is ignored.

use serde_json::Value;

/// A single schema violation, with a dotted path to the offending value
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SchemaIssue {
    pub path: String,
    pub message: String,
}

impl std::fmt::Display for SchemaIssue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}: {}", self.path, self.message)
    }
}

/// Validate `input` against `schema`, collecting every issue found
pub fn validate(schema: &Value, input: &Value) -> Result<(), Vec<SchemaIssue>> {
    let mut issues = Vec::new();
    check(schema, input, "$", &mut issues);
    if issues.is_empty() {
        Ok(())
    } else {
        Err(issues)
    }
}

fn check(schema: &Value, value: &Value, path: &str, issues: &mut Vec<SchemaIssue>) {
    let Some(schema) = schema.as_object() else {
        return;
    };

    if let Some(expected) = schema.get("type") {
        let matches = match expected {
            Value::String(t) => type_matches(t, value),
            Value::Array(types) => types
                .iter()
                .filter_map(Value::as_str)
                .any(|t| type_matches(t, value)),
            _ => true,
        };
        if !matches {
            issues.push(SchemaIssue {
                path: path.to_string(),
                message: format!("expected {}, got {}", expected, type_name(value)),
            });
            return;
        }
    }

    if let Some(Value::Array(allowed)) = schema.get("enum") {
        if !allowed.contains(value) {
            issues.push(SchemaIssue {
                path: path.to_string(),
                message: format!("value {} is not one of {}", value, Value::Array(allowed.clone())),
            });
        }
    }

    match value {
        Value::Object(fields) => {
            if let Some(Value::Array(required)) = schema.get("required") {
                for name in required.iter().filter_map(Value::as_str) {
                    if !fields.contains_key(name) {
                        issues.push(SchemaIssue {
                            path: format!("{}.{}", path, name),
                            message: "missing required field".into(),
                        });
                    }
                }
            }

            let properties = schema.get("properties").and_then(Value::as_object);
            let closed = matches!(schema.get("additionalProperties"), Some(Value::Bool(false)));

            for (name, field) in fields {
                let field_path = format!("{}.{}", path, name);
                match properties.and_then(|p| p.get(name)) {
                    Some(field_schema) => check(field_schema, field, &field_path, issues),
                    None if closed => issues.push(SchemaIssue {
                        path: field_path,
                        message: "unexpected field".into(),
                    }),
                    None => {}
                }
            }
        }
        Value::Array(items) => {
            if let Some(item_schema) = schema.get("items") {
                for (i, item) in items.iter().enumerate() {
                    check(item_schema, item, &format!("{}[{}]", path, i), issues);
                }
            }
        }
        _ => {}
    }
}

fn type_matches(expected: &str, value: &Value) -> bool {
    match expected {
        "string" => value.is_string(),
        "integer" => value.is_i64() || value.is_u64(),
        "number" => value.is_number(),
        "boolean" => value.is_boolean(),
        "array" => value.is_array(),
        "object" => value.is_object(),
        "null" => value.is_null(),
        _ => true,
    }
}

fn type_name(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "boolean",
        Value::Number(n) if n.is_f64() => "number",
        Value::Number(_) => "integer",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}
