//! Parameter schemas and argument validation.
//!
//! A task type declares its parameters as an ordered list. Submitted arguments
//! are validated as an array whose length must fall between the number of
//! mandatory parameters and the total number of declared parameters.

use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

/// JSON type a positional parameter accepts.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ParamType {
    /// Any JSON value.
    Any,
    /// JSON string.
    String,
    /// Integral JSON number.
    Integer,
    /// Any JSON number.
    Number,
    /// JSON boolean.
    Boolean,
    /// JSON object.
    Object,
    /// JSON array.
    Array,
    /// JSON null.
    Null,
}

impl ParamType {
    /// Whether `value` is an instance of this type.
    #[must_use]
    pub fn accepts(self, value: &Value) -> bool {
        match self {
            Self::Any => true,
            Self::String => value.is_string(),
            Self::Integer => value.is_i64() || value.is_u64(),
            Self::Number => value.is_number(),
            Self::Boolean => value.is_boolean(),
            Self::Object => value.is_object(),
            Self::Array => value.is_array(),
            Self::Null => value.is_null(),
        }
    }

    const fn as_str(self) -> &'static str {
        match self {
            Self::Any => "any",
            Self::String => "string",
            Self::Integer => "integer",
            Self::Number => "number",
            Self::Boolean => "boolean",
            Self::Object => "object",
            Self::Array => "array",
            Self::Null => "null",
        }
    }
}

/// Descriptor of one positional parameter.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ParamSpec {
    /// Human-readable parameter name, used in diagnostics.
    pub name: String,
    /// Accepted JSON type.
    #[serde(rename = "type")]
    pub kind: ParamType,
    /// Whether callers must supply this parameter.
    #[serde(default)]
    pub mandatory: bool,
}

impl ParamSpec {
    /// Mandatory parameter.
    pub fn required(name: impl Into<String>, kind: ParamType) -> Self {
        Self {
            name: name.into(),
            kind,
            mandatory: true,
        }
    }

    /// Optional parameter.
    pub fn optional(name: impl Into<String>, kind: ParamType) -> Self {
        Self {
            name: name.into(),
            kind,
            mandatory: false,
        }
    }
}

/// Ordered list of parameter descriptors declared by a task type.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ParamsSchema {
    params: Vec<ParamSpec>,
}

impl ParamsSchema {
    /// Build a schema from positional descriptors.
    #[must_use]
    pub const fn new(params: Vec<ParamSpec>) -> Self {
        Self { params }
    }

    /// Declared parameters in order.
    #[must_use]
    pub fn params(&self) -> &[ParamSpec] {
        &self.params
    }

    /// Number of mandatory parameters; the array's minimum length.
    #[must_use]
    pub fn min_items(&self) -> usize {
        self.params.iter().filter(|p| p.mandatory).count()
    }

    /// Total declared parameters; the array's maximum length.
    #[must_use]
    pub fn max_items(&self) -> usize {
        self.params.len()
    }

    /// JSON-schema rendering of the array form, for diagnostics and API listings.
    #[must_use]
    pub fn to_array_schema(&self) -> Value {
        let items: Vec<Value> = self
            .params
            .iter()
            .map(|p| json!({ "title": p.name, "type": p.kind.as_str() }))
            .collect();
        json!({
            "type": "array",
            "items": items,
            "minItems": self.min_items(),
            "maxItems": self.max_items(),
        })
    }
}

/// One structured schema violation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ValidationError {
    /// Position in the argument list the error refers to (empty for the whole list).
    pub path: String,
    /// Violated constraint keyword (`minItems`, `maxItems`, `type`).
    pub code: String,
    /// Human-readable description.
    pub message: String,
}

impl ValidationError {
    /// Build a validation error.
    pub fn new(path: impl Into<String>, code: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            path: path.into(),
            code: code.into(),
            message: message.into(),
        }
    }
}

/// Serialize errors into the caller-facing diagnostic form.
#[must_use]
pub fn serialize_errors(errors: &[ValidationError]) -> Value {
    serde_json::to_value(errors).unwrap_or(Value::Null)
}

/// Validation service consulted by the balancer before a task is created.
pub trait Validator: Send + Sync {
    /// Return every violation of `schema` by `args`; empty means valid.
    fn validate(&self, schema: &ParamsSchema, args: &[Value]) -> Vec<ValidationError>;
}

/// Positional validator enforcing item counts and per-position types.
#[derive(Debug, Clone, Copy, Default)]
pub struct DefaultValidator;

impl Validator for DefaultValidator {
    fn validate(&self, schema: &ParamsSchema, args: &[Value]) -> Vec<ValidationError> {
        let mut errors = Vec::new();

        let min = schema.min_items();
        if args.len() < min {
            for (idx, param) in schema.params().iter().enumerate().skip(args.len()) {
                if param.mandatory {
                    errors.push(ValidationError::new(
                        idx.to_string(),
                        "minItems",
                        format!("missing mandatory argument `{}`", param.name),
                    ));
                }
            }
        }

        let max = schema.max_items();
        if args.len() > max {
            errors.push(ValidationError::new(
                "",
                "maxItems",
                format!("expected at most {max} arguments, got {}", args.len()),
            ));
        }

        for (idx, (param, value)) in schema.params().iter().zip(args).enumerate() {
            if !param.kind.accepts(value) {
                errors.push(ValidationError::new(
                    idx.to_string(),
                    "type",
                    format!(
                        "argument `{}` must be of type {}",
                        param.name,
                        param.kind.as_str()
                    ),
                ));
            }
        }

        errors
    }
}
