//! Typed output contracts per capability.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

/// JSON type a result field must have.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ValueType {
    /// A JSON string.
    String,
    /// Any JSON number.
    Number,
    /// A JSON number without a fractional part.
    Integer,
    /// A JSON boolean.
    Boolean,
    /// A JSON array.
    Array,
    /// A JSON object.
    Object,
}

impl ValueType {
    /// Whether `value` has this type.
    #[must_use]
    pub fn matches(self, value: &serde_json::Value) -> bool {
        match self {
            Self::String => value.is_string(),
            Self::Number => value.is_number(),
            Self::Integer => value.is_i64() || value.is_u64(),
            Self::Boolean => value.is_boolean(),
            Self::Array => value.is_array(),
            Self::Object => value.is_object(),
        }
    }

    /// Lowercase type name.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::String => "string",
            Self::Number => "number",
            Self::Integer => "integer",
            Self::Boolean => "boolean",
            Self::Array => "array",
            Self::Object => "object",
        }
    }
}

/// One expected output field.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FieldSpec {
    /// Field name in the result object.
    pub name: String,
    /// Missing required fields fail a critical rule.
    pub required: bool,
    /// Expected type, if constrained.
    pub value_type: Option<ValueType>,
}

/// What a capability's result is expected to contain.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CapabilityContract {
    /// Expected fields.
    pub fields: Vec<FieldSpec>,
    /// Whether results are scored by the LLM by default.
    pub quality_check: bool,
}

impl CapabilityContract {
    /// An empty contract.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Expect a required field.
    #[must_use]
    pub fn required(mut self, name: &str, value_type: ValueType) -> Self {
        self.fields.push(FieldSpec {
            name: name.to_string(),
            required: true,
            value_type: Some(value_type),
        });
        self
    }

    /// Expect an optional field.
    #[must_use]
    pub fn optional(mut self, name: &str, value_type: ValueType) -> Self {
        self.fields.push(FieldSpec {
            name: name.to_string(),
            required: false,
            value_type: Some(value_type),
        });
        self
    }

    /// Score results with the LLM.
    #[must_use]
    pub const fn with_quality_check(mut self) -> Self {
        self.quality_check = true;
        self
    }
}

/// Contracts keyed by capability id.
#[derive(Debug, Clone, Default)]
pub struct ContractRegistry {
    contracts: HashMap<String, CapabilityContract>,
}

impl ContractRegistry {
    /// Create an empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry with contracts for the built-in and common capabilities.
    #[must_use]
    pub fn with_defaults() -> Self {
        use ValueType::{Array, Integer, Object, String};

        let mut registry = Self::new();
        registry.register(
            "file_writer",
            CapabilityContract::new()
                .required("path", String)
                .optional("bytes", Integer),
        );
        registry.register(
            "shell",
            CapabilityContract::new()
                .required("stdout", String)
                .optional("stderr", String)
                .optional("exitCode", Integer),
        );
        registry.register(
            "install_dependency",
            CapabilityContract::new()
                .required("package", String)
                .optional("manager", String),
        );
        for tool in ["generate_pdf", "generate_docx", "generate_pptx", "generate_xlsx"] {
            registry.register(
                tool,
                CapabilityContract::new()
                    .required("file_path", String)
                    .optional("pages", Integer)
                    .optional("metadata", Object),
            );
        }
        registry.register(
            "generate_markdown",
            CapabilityContract::new()
                .required("file_path", String)
                .optional("content", String)
                .with_quality_check(),
        );
        registry.register(
            "generate_text",
            CapabilityContract::new()
                .required("content", String)
                .with_quality_check(),
        );
        registry.register(
            "web_search",
            CapabilityContract::new()
                .required("results", Array)
                .optional("query", String),
        );
        registry
    }

    /// Register a contract, replacing any for the same capability.
    pub fn register(&mut self, tool: impl Into<String>, contract: CapabilityContract) {
        self.contracts.insert(tool.into(), contract);
    }

    /// Contract for a capability.
    #[must_use]
    pub fn get(&self, tool: &str) -> Option<&CapabilityContract> {
        self.contracts.get(tool)
    }
}
