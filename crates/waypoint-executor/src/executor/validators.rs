//! Structural validators run on apparently successful step results.

use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;

use waypoint_core::types::Step;

/// Checks the shape of one capability's result.
pub trait ResultValidator: Send + Sync {
    /// Validate a result; `Err` carries the reason.
    ///
    /// # Errors
    ///
    /// Returns error describing why the result is unacceptable.
    fn validate(&self, step: &Step, result: &serde_json::Value) -> Result<(), String>;
}

/// A generated document must name its file, with the expected extension.
#[derive(Debug, Clone)]
pub struct DocumentResultValidator {
    extension: Option<String>,
}

impl DocumentResultValidator {
    /// Require a specific extension (without the dot).
    #[must_use]
    pub fn with_extension(extension: impl Into<String>) -> Self {
        Self {
            extension: Some(extension.into().to_lowercase()),
        }
    }

    /// Take the expected extension from the step's own `path` param.
    #[must_use]
    pub const fn matching_params() -> Self {
        Self { extension: None }
    }
}

const PATH_KEYS: &[&str] = &["file_path", "filePath", "path", "output_path"];

impl ResultValidator for DocumentResultValidator {
    fn validate(&self, step: &Step, result: &serde_json::Value) -> Result<(), String> {
        let path = PATH_KEYS
            .iter()
            .find_map(|k| result.get(*k).and_then(serde_json::Value::as_str))
            .filter(|p| !p.is_empty())
            .ok_or_else(|| format!("{} result carries no file path", step.tool))?;

        let expected = self.extension.clone().or_else(|| {
            PATH_KEYS
                .iter()
                .find_map(|k| step.param_str(k))
                .and_then(extension_of)
        });

        match expected {
            Some(expected) if extension_of(path).as_deref() != Some(expected.as_str()) => Err(
                format!("{} produced '{path}', expected a .{expected} file", step.tool),
            ),
            _ => Ok(()),
        }
    }
}

fn extension_of(path: &str) -> Option<String> {
    Path::new(path)
        .extension()
        .and_then(|e| e.to_str())
        .map(str::to_lowercase)
}

/// Structural validators keyed by capability id.
#[derive(Clone, Default)]
pub struct ValidatorRegistry {
    validators: HashMap<String, Arc<dyn ResultValidator>>,
}

impl ValidatorRegistry {
    /// Create an empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry with validators for the built-in and common document capabilities.
    #[must_use]
    pub fn with_defaults() -> Self {
        let mut registry = Self::new();
        registry.register("file_writer", Arc::new(DocumentResultValidator::matching_params()));
        for (tool, ext) in [
            ("generate_pdf", "pdf"),
            ("generate_docx", "docx"),
            ("generate_pptx", "pptx"),
            ("generate_xlsx", "xlsx"),
            ("generate_markdown", "md"),
        ] {
            registry.register(tool, Arc::new(DocumentResultValidator::with_extension(ext)));
        }
        registry
    }

    /// Register a validator for a capability.
    pub fn register(&mut self, tool: impl Into<String>, validator: Arc<dyn ResultValidator>) {
        self.validators.insert(tool.into(), validator);
    }

    /// Validate a step's result; capabilities without a validator pass.
    ///
    /// # Errors
    ///
    /// Returns the validator's rejection reason.
    pub fn validate(&self, step: &Step, result: &serde_json::Value) -> Result<(), String> {
        self.validators
            .get(&step.tool)
            .map_or(Ok(()), |v| v.validate(step, result))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_document_requires_path() {
        let registry = ValidatorRegistry::with_defaults();
        let step = Step::new("generate_pdf", json!({}));

        assert!(registry.validate(&step, &json!({"file_path": "/out/report.pdf"})).is_ok());
        assert!(registry.validate(&step, &json!({"pages": 3})).is_err());

        let err = registry
            .validate(&step, &json!({"file_path": "/out/report.docx"}))
            .unwrap_err();
        assert!(err.contains("expected a .pdf file"));
    }

    #[test]
    fn test_file_writer_matches_param_extension() {
        let registry = ValidatorRegistry::with_defaults();
        let step = Step::new("file_writer", json!({"path": "/tmp/a.json"}));

        assert!(registry.validate(&step, &json!({"path": "/tmp/a.json"})).is_ok());
        assert!(registry.validate(&step, &json!({"path": "/tmp/a.txt"})).is_err());
    }

    #[test]
    fn test_unknown_capability_passes() {
        let registry = ValidatorRegistry::with_defaults();
        let step = Step::new("echo", json!({}));
        assert!(registry.validate(&step, &json!(null)).is_ok());
    }
}
