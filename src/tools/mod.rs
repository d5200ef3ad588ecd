//! Tool registry
//!
//! Declared operations of one platform. Argument validation runs here,
//! before any budget is touched or any request leaves the process.

use std::collections::HashMap;

use serde_json::Value;
use tracing::debug;

pub use gateway_core::{
    DEFAULT_CATEGORY, ParamSpec, ParamType, ToolDefinition, ValidationReport, Violation,
    validate_arguments,
};

use crate::{Error, Result};

/// Registry of tools keyed by name, in registration order
#[derive(Debug, Default, Clone)]
pub struct ToolRegistry {
    tools: Vec<ToolDefinition>,
    index: HashMap<String, usize>,
}

impl ToolRegistry {
    /// Create an empty registry
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a registry from a list of definitions
    ///
    /// # Errors
    ///
    /// Returns [`Error::Config`] on duplicate names.
    pub fn from_definitions(definitions: impl IntoIterator<Item = ToolDefinition>) -> Result<Self> {
        let mut registry = Self::new();
        for definition in definitions {
            registry.register(definition)?;
        }
        Ok(registry)
    }

    /// Add a tool
    ///
    /// # Errors
    ///
    /// Returns [`Error::Config`] if a tool with the same name exists.
    pub fn register(&mut self, definition: ToolDefinition) -> Result<()> {
        if self.index.contains_key(&definition.name) {
            return Err(Error::Config(format!(
                "tool '{}' is already registered",
                definition.name
            )));
        }
        debug!(tool = %definition.name, category = %definition.category, "Registered tool");
        self.index.insert(definition.name.clone(), self.tools.len());
        self.tools.push(definition);
        Ok(())
    }

    /// Look up a tool
    #[must_use]
    pub fn get(&self, name: &str) -> Option<&ToolDefinition> {
        self.index.get(name).map(|&i| &self.tools[i])
    }

    /// Validate `arguments` for tool `name`
    ///
    /// # Errors
    ///
    /// Returns [`Error::UnknownTool`] if no such tool is registered.
    pub fn validate(&self, name: &str, arguments: &Value) -> Result<ValidationReport> {
        let tool = self
            .get(name)
            .ok_or_else(|| Error::UnknownTool(name.to_string()))?;
        Ok(tool.validate(arguments))
    }

    /// Validate and turn violations into [`Error::Validation`]
    ///
    /// # Errors
    ///
    /// Returns [`Error::UnknownTool`] or [`Error::Validation`].
    pub fn check(&self, name: &str, arguments: &Value) -> Result<&ToolDefinition> {
        let tool = self
            .get(name)
            .ok_or_else(|| Error::UnknownTool(name.to_string()))?;
        let report = tool.validate(arguments);
        if !report.is_valid() {
            return Err(Error::Validation {
                tool: name.to_string(),
                violations: report.errors(),
            });
        }
        Ok(tool)
    }

    /// All tools in registration order
    pub fn list(&self) -> impl Iterator<Item = &ToolDefinition> {
        self.tools.iter()
    }

    /// Number of tools
    #[must_use]
    pub fn len(&self) -> usize {
        self.tools.len()
    }

    /// No tools registered
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.tools.is_empty()
    }
}
