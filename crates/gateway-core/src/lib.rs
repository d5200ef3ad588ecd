//! Tool definition and argument validation primitives.
//!
//! A [`ToolDefinition`] declares one operation a platform gateway can run:
//! its parameters, the HTTP endpoint it maps to and the rate-limit category
//! it is billed against. [`validate_arguments`] checks caller-supplied
//! arguments against the definition before any network activity.
//!
//! # Validation steps
//!
//! 1. **Shape** – arguments must be a JSON object (`null` is treated as `{}`).
//! 2. **Required parameters** – every required name must be present and non-null.
//! 3. **Type** – each supplied value must match the declared primitive type.
//! 4. **Enum values** – if `enum` is declared, the value must be one of them.
//! 5. **Bounds** – numeric `min` / `max` and string `maxLength`.
//!
//! Every violation is reported, not just the first.

use std::fmt;

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Default rate-limit category for tools that do not name one
pub const DEFAULT_CATEGORY: &str = "default";

/// Primitive parameter types
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ParamType {
    /// UTF-8 string
    String,
    /// Whole number
    Integer,
    /// Any JSON number
    Number,
    /// `true` / `false`
    Boolean,
    /// JSON array
    Array,
    /// JSON object
    Object,
}

impl ParamType {
    /// Whether `value` is an instance of this type
    #[must_use]
    pub fn matches(self, value: &Value) -> bool {
        match self {
            Self::String => value.is_string(),
            Self::Integer => value.is_i64() || value.is_u64(),
            Self::Number => value.is_number(),
            Self::Boolean => value.is_boolean(),
            Self::Array => value.is_array(),
            Self::Object => value.is_object(),
        }
    }
}

impl fmt::Display for ParamType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::String => "string",
            Self::Integer => "integer",
            Self::Number => "number",
            Self::Boolean => "boolean",
            Self::Array => "array",
            Self::Object => "object",
        };
        f.write_str(name)
    }
}

/// Parameter specification
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ParamSpec {
    /// Parameter name
    pub name: String,
    /// Declared type
    #[serde(rename = "type")]
    pub param_type: ParamType,
    /// Whether the parameter must be supplied
    #[serde(default)]
    pub required: bool,
    /// Allowed values
    #[serde(default, rename = "enum", skip_serializing_if = "Option::is_none")]
    pub allowed: Option<Vec<Value>>,
    /// Inclusive numeric lower bound
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub min: Option<f64>,
    /// Inclusive numeric upper bound
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max: Option<f64>,
    /// Maximum string length in characters
    #[serde(
        default,
        rename = "maxLength",
        alias = "max_length",
        skip_serializing_if = "Option::is_none"
    )]
    pub max_length: Option<usize>,
}

impl ParamSpec {
    /// Create a parameter spec with no constraints beyond its type
    pub fn new(name: impl Into<String>, param_type: ParamType) -> Self {
        Self {
            name: name.into(),
            param_type,
            required: false,
            allowed: None,
            min: None,
            max: None,
            max_length: None,
        }
    }

    /// Mark the parameter as required
    #[must_use]
    pub fn required(mut self) -> Self {
        self.required = true;
        self
    }

    /// Restrict values to `allowed`
    #[must_use]
    pub fn one_of(mut self, allowed: Vec<Value>) -> Self {
        self.allowed = Some(allowed);
        self
    }

    /// Set inclusive numeric bounds
    #[must_use]
    pub fn range(mut self, min: Option<f64>, max: Option<f64>) -> Self {
        self.min = min;
        self.max = max;
        self
    }

    /// Set maximum string length
    #[must_use]
    pub fn max_length(mut self, max_length: usize) -> Self {
        self.max_length = Some(max_length);
        self
    }
}

/// Declared gateway operation
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolDefinition {
    /// Unique tool name
    pub name: String,
    /// Human description
    #[serde(default)]
    pub description: String,
    /// Ordered parameter specs
    #[serde(default)]
    pub parameters: Vec<ParamSpec>,
    /// Transport rate-limit category this tool is billed against
    #[serde(default = "default_category")]
    pub category: String,
    /// HTTP method
    #[serde(default = "default_method")]
    pub method: String,
    /// Endpoint path relative to the platform base URL, with `{param}` placeholders
    pub endpoint: String,
}

fn default_category() -> String {
    DEFAULT_CATEGORY.to_string()
}

fn default_method() -> String {
    "GET".to_string()
}

impl ToolDefinition {
    /// Create a tool bound to the default category
    pub fn new(
        name: impl Into<String>,
        method: impl Into<String>,
        endpoint: impl Into<String>,
    ) -> Self {
        Self {
            name: name.into(),
            description: String::new(),
            parameters: Vec::new(),
            category: default_category(),
            method: method.into(),
            endpoint: endpoint.into(),
        }
    }

    /// Set the description
    #[must_use]
    pub fn describe(mut self, description: impl Into<String>) -> Self {
        self.description = description.into();
        self
    }

    /// Append a parameter
    #[must_use]
    pub fn param(mut self, spec: ParamSpec) -> Self {
        self.parameters.push(spec);
        self
    }

    /// Bind to a rate-limit category
    #[must_use]
    pub fn category(mut self, category: impl Into<String>) -> Self {
        self.category = category.into();
        self
    }

    /// Names of `{placeholder}` segments in the endpoint template
    #[must_use]
    pub fn path_params(&self) -> Vec<&str> {
        let mut names = Vec::new();
        let mut rest = self.endpoint.as_str();
        while let Some(open) = rest.find('{') {
            let after = &rest[open + 1..];
            let Some(close) = after.find('}') else { break };
            names.push(&after[..close]);
            rest = &after[close + 1..];
        }
        names
    }

    /// Validate `arguments` against this definition
    #[must_use]
    pub fn validate(&self, arguments: &Value) -> ValidationReport {
        validate_arguments(self, arguments)
    }
}

/// A single violation
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Violation {
    /// Offending parameter (empty for shape errors)
    pub param: String,
    /// What is wrong
    pub message: String,
}

impl Violation {
    fn new(param: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            param: param.into(),
            message: message.into(),
        }
    }
}

impl fmt::Display for Violation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.param.is_empty() {
            f.write_str(&self.message)
        } else {
            write!(f, "{}: {}", self.param, self.message)
        }
    }
}

/// Outcome of argument validation
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ValidationReport {
    /// All violations found
    pub violations: Vec<Violation>,
}

impl ValidationReport {
    /// `true` when no violation was found
    #[must_use]
    pub fn is_valid(&self) -> bool {
        self.violations.is_empty()
    }

    /// Violations rendered as strings
    #[must_use]
    pub fn errors(&self) -> Vec<String> {
        self.violations.iter().map(ToString::to_string).collect()
    }
}

/// Validate `arguments` against `tool`
#[must_use]
pub fn validate_arguments(tool: &ToolDefinition, arguments: &Value) -> ValidationReport {
    let mut report = ValidationReport::default();

    let empty = serde_json::Map::new();
    let args = match arguments {
        Value::Object(map) => map,
        Value::Null => &empty,
        other => {
            report.violations.push(Violation::new(
                "",
                format!("arguments must be an object, got {}", json_type(other)),
            ));
            return report;
        }
    };

    for spec in &tool.parameters {
        match args.get(&spec.name) {
            None | Some(Value::Null) => {
                if spec.required {
                    report
                        .violations
                        .push(Violation::new(&spec.name, "required parameter is missing"));
                }
            }
            Some(value) => check_value(spec, value, &mut report.violations),
        }
    }

    report
}

fn check_value(spec: &ParamSpec, value: &Value, out: &mut Vec<Violation>) {
    if !spec.param_type.matches(value) {
        out.push(Violation::new(
            &spec.name,
            format!("expected {}, got {}", spec.param_type, json_type(value)),
        ));
        // Remaining checks assume the declared type
        return;
    }

    if let Some(allowed) = &spec.allowed {
        if !allowed.contains(value) {
            let options: Vec<String> = allowed.iter().map(Value::to_string).collect();
            out.push(Violation::new(
                &spec.name,
                format!("value {value} is not one of [{}]", options.join(", ")),
            ));
        }
    }

    if let Some(n) = value.as_f64() {
        if let Some(min) = spec.min {
            if n < min {
                out.push(Violation::new(&spec.name, format!("{n} is below minimum {min}")));
            }
        }
        if let Some(max) = spec.max {
            if n > max {
                out.push(Violation::new(&spec.name, format!("{n} is above maximum {max}")));
            }
        }
    }

    if let (Some(limit), Some(s)) = (spec.max_length, value.as_str()) {
        let len = s.chars().count();
        if len > limit {
            out.push(Violation::new(
                &spec.name,
                format!("length {len} exceeds maxLength {limit}"),
            ));
        }
    }
}

fn json_type(value: &Value) -> &'static str {
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
