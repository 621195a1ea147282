//! Parameter schemas for capability inputs and outputs.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use serde_json::Value;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ParamType {
    String,
    Integer,
    Number,
    Boolean,
    Array,
    Object,
    Any,
}

impl ParamType {
    /// Integers are accepted where numbers are expected.
    pub fn accepts(self, value: &Value) -> bool {
        match self {
            ParamType::String => value.is_string(),
            ParamType::Integer => value.is_i64() || value.is_u64(),
            ParamType::Number => value.is_number(),
            ParamType::Boolean => value.is_boolean(),
            ParamType::Array => value.is_array(),
            ParamType::Object => value.is_object(),
            ParamType::Any => true,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            ParamType::String => "string",
            ParamType::Integer => "integer",
            ParamType::Number => "number",
            ParamType::Boolean => "boolean",
            ParamType::Array => "array",
            ParamType::Object => "object",
            ParamType::Any => "any",
        }
    }
}

/// Schema of a single parameter.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ParamSpec {
    #[serde(rename = "type")]
    pub ty: ParamType,
    #[serde(default)]
    pub required: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub default: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub min: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max: Option<f64>,
    #[serde(default, rename = "enum", skip_serializing_if = "Option::is_none")]
    pub allowed: Option<Vec<Value>>,
    #[serde(default)]
    pub description: String,
}

impl ParamSpec {
    pub fn required(ty: ParamType) -> Self {
        Self {
            ty,
            required: true,
            default: None,
            min: None,
            max: None,
            allowed: None,
            description: String::new(),
        }
    }

    pub fn optional(ty: ParamType) -> Self {
        Self {
            required: false,
            ..Self::required(ty)
        }
    }

    pub fn default_value(mut self, value: Value) -> Self {
        self.default = Some(value);
        self
    }

    pub fn one_of<I, V>(mut self, values: I) -> Self
    where
        I: IntoIterator<Item = V>,
        V: Into<Value>,
    {
        self.allowed = Some(values.into_iter().map(Into::into).collect());
        self
    }

    pub fn range(mut self, min: Option<f64>, max: Option<f64>) -> Self {
        self.min = min;
        self.max = max;
        self
    }

    pub fn describe(mut self, description: impl Into<String>) -> Self {
        self.description = description.into();
        self
    }

    fn check(&self, name: &str, value: &Value) -> Result<(), String> {
        if !self.ty.accepts(value) {
            return Err(format!("parameter `{name}` must be of type {}", self.ty.as_str()));
        }
        if let Some(allowed) = &self.allowed {
            if !allowed.contains(value) {
                return Err(format!(
                    "parameter `{name}` must be one of {}",
                    Value::Array(allowed.clone())
                ));
            }
        }
        if let Some(n) = value.as_f64() {
            if let Some(min) = self.min {
                if n < min {
                    return Err(format!("parameter `{name}` must be >= {min}"));
                }
            }
            if let Some(max) = self.max {
                if n > max {
                    return Err(format!("parameter `{name}` must be <= {max}"));
                }
            }
        }
        Ok(())
    }
}

/// Named parameter schemas.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Contract {
    pub params: BTreeMap<String, ParamSpec>,
}

impl Contract {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn param(mut self, name: impl Into<String>, spec: ParamSpec) -> Self {
        self.params.insert(name.into(), spec);
        self
    }

    /// Validate invocation params and fill in defaults.
    ///
    /// `null` is treated as an empty object. Unknown keys are rejected; a
    /// `null` value for an optional parameter counts as absent.
    pub fn validate_input(&self, params: &Value) -> Result<Value, String> {
        let supplied = match params {
            Value::Null => serde_json::Map::new(),
            Value::Object(map) => map.clone(),
            other => return Err(format!("params must be an object, got {}", type_name(other))),
        };

        if let Some(unknown) = supplied.keys().find(|k| !self.params.contains_key(*k)) {
            return Err(format!("unknown parameter `{unknown}`"));
        }

        let mut validated = serde_json::Map::new();
        for (name, spec) in &self.params {
            match supplied.get(name) {
                Some(value) if !value.is_null() => {
                    spec.check(name, value)?;
                    validated.insert(name.clone(), value.clone());
                }
                _ if spec.required => {
                    return Err(format!("missing required parameter `{name}`"));
                }
                _ => {
                    if let Some(default) = &spec.default {
                        validated.insert(name.clone(), default.clone());
                    }
                }
            }
        }
        Ok(Value::Object(validated))
    }

    /// Check an output value: declared required fields present and declared
    /// fields well-typed. Extra fields are allowed.
    pub fn check_output(&self, output: &Value) -> Result<(), String> {
        let Some(map) = output.as_object() else {
            if self.params.is_empty() {
                return Ok(());
            }
            return Err(format!("output must be an object, got {}", type_name(output)));
        };
        for (name, spec) in &self.params {
            match map.get(name) {
                Some(value) if !value.is_null() => spec.check(name, value)?,
                _ if spec.required => return Err(format!("output missing field `{name}`")),
                _ => {}
            }
        }
        Ok(())
    }
}

fn type_name(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "boolean",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn contract() -> Contract {
        Contract::new()
            .param("data", ParamSpec::required(ParamType::Array))
            .param(
                "analysis_type",
                ParamSpec::required(ParamType::String).one_of(["summary", "trends"]),
            )
            .param(
                "output_format",
                ParamSpec::optional(ParamType::String).default_value(json!("json")),
            )
            .param(
                "ratio",
                ParamSpec::optional(ParamType::Number).range(Some(0.0), Some(1.0)),
            )
    }

    #[test]
    fn fills_defaults() {
        let out = contract()
            .validate_input(&json!({"data": [1], "analysis_type": "summary"}))
            .unwrap();
        assert_eq!(out["output_format"], "json");
        assert!(out.get("ratio").is_none());
    }

    #[test]
    fn rejects_missing_required() {
        let err = contract().validate_input(&json!({"data": []})).unwrap_err();
        assert!(err.contains("analysis_type"));
    }

    #[test]
    fn rejects_unknown_param() {
        let err = contract()
            .validate_input(&json!({"data": [], "analysis_type": "summary", "extra": 1}))
            .unwrap_err();
        assert!(err.contains("extra"));
    }

    #[test]
    fn rejects_value_outside_enum() {
        let err = contract()
            .validate_input(&json!({"data": [], "analysis_type": "forecast"}))
            .unwrap_err();
        assert!(err.contains("one of"));
    }

    #[test]
    fn integer_accepted_as_number_and_range_checked() {
        let c = contract();
        c.validate_input(&json!({"data": [], "analysis_type": "trends", "ratio": 1}))
            .unwrap();
        let err = c
            .validate_input(&json!({"data": [], "analysis_type": "trends", "ratio": 2}))
            .unwrap_err();
        assert!(err.contains("<= 1"));
    }

    #[test]
    fn non_object_params_rejected() {
        assert!(contract().validate_input(&json!([1, 2])).is_err());
        assert!(Contract::new().validate_input(&Value::Null).is_ok());
    }

    #[test]
    fn output_check_allows_extra_fields() {
        let out = Contract::new().param("score", ParamSpec::required(ParamType::Number));
        out.check_output(&json!({"score": 0.5, "notes": "ok"})).unwrap();
        assert!(out.check_output(&json!({"notes": "ok"})).is_err());
        assert!(out.check_output(&json!({"score": "high"})).is_err());
    }

    #[test]
    fn spec_serializes_enum_key() {
        let spec = ParamSpec::required(ParamType::String).one_of(["a"]);
        let value = serde_json::to_value(&spec).unwrap();
        assert_eq!(value["type"], "string");
        assert_eq!(value["enum"], json!(["a"]));
    }
}
