//! Decision validator (C2) — a minimal JSON-Schema subset: `type`, `enum`, `required`,
//! `properties`, `items`, `additionalProperties=false`.
//!
//! Returns an ordered list of human-readable errors with dotted/bracketed paths; a
//! non-empty list fails the node.

use serde_json::Value;

pub fn validate(schema: &Value, instance: &Value) -> Vec<String> {
    let mut errors = Vec::new();
    validate_at(schema, instance, "$", &mut errors);
    errors
}

fn type_name(v: &Value) -> &'static str {
    match v {
        Value::Null => "null",
        Value::Bool(_) => "boolean",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}

fn type_matches(ty: &str, v: &Value) -> bool {
    match ty {
        "object" => v.is_object(),
        "array" => v.is_array(),
        "string" => v.is_string(),
        "boolean" => v.is_boolean(),
        "null" => v.is_null(),
        "number" => v.is_number(),
        "integer" => v.as_f64().is_some_and(|f| f.fract() == 0.0),
        _ => true,
    }
}

fn validate_at(schema: &Value, instance: &Value, path: &str, errors: &mut Vec<String>) {
    let Some(obj) = schema.as_object() else {
        return;
    };

    if let Some(ty) = obj.get("type").and_then(Value::as_str) {
        if !type_matches(ty, instance) {
            errors.push(format!(
                "{path}: expected type {ty}, got {}",
                type_name(instance)
            ));
            return;
        }
    }

    if let Some(enum_vals) = obj.get("enum").and_then(Value::as_array) {
        if !enum_vals.iter().any(|v| v == instance) {
            errors.push(format!("{path}: value not one of the allowed enum values"));
        }
    }

    if let Some(required) = obj.get("required").and_then(Value::as_array) {
        if let Some(inst_obj) = instance.as_object() {
            for req in required {
                if let Some(key) = req.as_str() {
                    if !inst_obj.contains_key(key) {
                        errors.push(format!("{path}.{key}: missing required property"));
                    }
                }
            }
        }
    }

    if let Some(props) = obj.get("properties").and_then(Value::as_object) {
        if let Some(inst_obj) = instance.as_object() {
            for (key, subschema) in props {
                if let Some(val) = inst_obj.get(key) {
                    let child_path = format!("{path}.{key}");
                    validate_at(subschema, val, &child_path, errors);
                }
            }
            if obj.get("additionalProperties") == Some(&Value::Bool(false)) {
                for key in inst_obj.keys() {
                    if !props.contains_key(key) {
                        errors.push(format!("{path}.{key}: additional property not allowed"));
                    }
                }
            }
        }
    }

    if let Some(items_schema) = obj.get("items") {
        if let Some(arr) = instance.as_array() {
            for (i, item) in arr.iter().enumerate() {
                let child_path = format!("{path}[{i}]");
                validate_at(items_schema, item, &child_path, errors);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn type_mismatch_reported() {
        let schema = json!({"type": "string"});
        let errs = validate(&schema, &json!(42));
        assert_eq!(errs.len(), 1);
        assert!(errs[0].contains("expected type string"));
    }

    #[test]
    fn enum_violation() {
        let schema = json!({"type": "string", "enum": ["success", "fail"]});
        let errs = validate(&schema, &json!("retry"));
        assert_eq!(errs.len(), 1);
    }

    #[test]
    fn required_property_missing() {
        let schema = json!({
            "type": "object",
            "required": ["next"],
            "properties": {"next": {"type": "string"}}
        });
        let errs = validate(&schema, &json!({"other": 1}));
        assert!(errs.iter().any(|e| e.contains("next")));
    }

    #[test]
    fn additional_properties_rejected() {
        let schema = json!({
            "type": "object",
            "properties": {"next": {"type": "string"}},
            "additionalProperties": false
        });
        let errs = validate(&schema, &json!({"next": "success", "extra": 1}));
        assert!(errs.iter().any(|e| e.contains("extra")));
    }

    #[test]
    fn nested_items_validated() {
        let schema = json!({
            "type": "array",
            "items": {"type": "integer"}
        });
        let errs = validate(&schema, &json!([1, 2, "x"]));
        assert_eq!(errs.len(), 1);
        assert!(errs[0].starts_with("$[2]"));
    }

    #[test]
    fn valid_decision_passes() {
        let schema = json!({
            "type": "object",
            "required": ["next"],
            "properties": {"next": {"type": "string", "enum": ["success", "fail"]}},
            "additionalProperties": false
        });
        assert!(validate(&schema, &json!({"next": "success"})).is_empty());
    }
}
