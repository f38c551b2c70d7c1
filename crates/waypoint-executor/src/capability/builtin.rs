//! Built-in capabilities.
//!
//! These are the capabilities correction strategies insert (`file_writer`,
//! `install_dependency`) plus `shell` and `echo` for running plans locally.

use std::path::PathBuf;
use std::sync::Arc;

use async_trait::async_trait;
use serde_json::json;

use super::{Capability, CapabilityContext, CapabilityError, CapabilityRegistry};
use crate::process::{IsolationConfig, IsolationLevel, run_shell};

/// Register every built-in capability.
pub fn register_all(registry: &mut CapabilityRegistry) {
    registry.register(Arc::new(EchoCapability));
    registry.register(Arc::new(FileWriterCapability));
    registry.register(Arc::new(ShellCapability::new()));
    registry.register(Arc::new(InstallDependencyCapability::new()));
}

/// Returns its params unchanged.
pub struct EchoCapability;

#[async_trait]
impl Capability for EchoCapability {
    fn name(&self) -> &str {
        "echo"
    }

    fn description(&self) -> &str {
        "Return the given parameters"
    }

    async fn invoke(
        &self,
        params: &serde_json::Value,
        _ctx: &CapabilityContext,
    ) -> Result<serde_json::Value, CapabilityError> {
        Ok(params.clone())
    }
}

/// Writes text content to a file.
pub struct FileWriterCapability;

#[async_trait]
impl Capability for FileWriterCapability {
    fn name(&self) -> &str {
        "file_writer"
    }

    fn description(&self) -> &str {
        "Write text content to a file, creating parent directories"
    }

    fn mutates_files(&self) -> bool {
        true
    }

    async fn invoke(
        &self,
        params: &serde_json::Value,
        _ctx: &CapabilityContext,
    ) -> Result<serde_json::Value, CapabilityError> {
        let path = params["path"]
            .as_str()
            .map(PathBuf::from)
            .ok_or_else(|| CapabilityError::InvalidParams("Missing 'path' parameter".into()))?;
        let content = params["content"].as_str().unwrap_or_default();

        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(|e| io_failure(&e, parent))?;
        }

        if params["append"].as_bool().unwrap_or(false) {
            use tokio::io::AsyncWriteExt;
            let mut file = tokio::fs::OpenOptions::new()
                .create(true)
                .append(true)
                .open(&path)
                .await
                .map_err(|e| io_failure(&e, &path))?;
            file.write_all(content.as_bytes())
                .await
                .map_err(|e| io_failure(&e, &path))?;
        } else {
            tokio::fs::write(&path, content)
                .await
                .map_err(|e| io_failure(&e, &path))?;
        }

        Ok(json!({
            "path": path.display().to_string(),
            "bytes": content.len(),
        }))
    }
}

/// Map an IO error to a capability failure carrying a POSIX-style code.
fn io_failure(err: &std::io::Error, path: &std::path::Path) -> CapabilityError {
    let code = match err.kind() {
        std::io::ErrorKind::NotFound => "ENOENT",
        std::io::ErrorKind::PermissionDenied => "EACCES",
        std::io::ErrorKind::AlreadyExists => "EEXIST",
        _ => "EIO",
    };
    CapabilityError::with_code(code, format!("{code}: {err}, '{}'", path.display()))
}

/// Runs a shell command under process isolation.
pub struct ShellCapability {
    isolation: IsolationConfig,
}

impl ShellCapability {
    /// Create with the default isolation config.
    #[must_use]
    pub fn new() -> Self {
        Self {
            isolation: IsolationConfig::default(),
        }
    }

    /// Create with a custom isolation config.
    #[must_use]
    pub const fn with_isolation(isolation: IsolationConfig) -> Self {
        Self { isolation }
    }
}

impl Default for ShellCapability {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Capability for ShellCapability {
    fn name(&self) -> &str {
        "shell"
    }

    fn description(&self) -> &str {
        "Execute a shell command in an isolated environment"
    }

    async fn invoke(
        &self,
        params: &serde_json::Value,
        _ctx: &CapabilityContext,
    ) -> Result<serde_json::Value, CapabilityError> {
        let command = params["command"]
            .as_str()
            .ok_or_else(|| CapabilityError::InvalidParams("Missing 'command' parameter".into()))?;

        let mut isolation = self.isolation.clone();
        if let Some(cwd) = params["cwd"].as_str() {
            isolation.work_dir = Some(PathBuf::from(cwd));
        }

        command_result(command, &isolation).await
    }
}

/// Installs a package with the matching package manager.
pub struct InstallDependencyCapability {
    isolation: IsolationConfig,
}

impl InstallDependencyCapability {
    /// Create a new installer; installs need network, so no isolation.
    #[must_use]
    pub fn new() -> Self {
        Self {
            isolation: IsolationConfig {
                level: IsolationLevel::None,
                ..IsolationConfig::default()
            },
        }
    }
}

impl Default for InstallDependencyCapability {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Capability for InstallDependencyCapability {
    fn name(&self) -> &str {
        "install_dependency"
    }

    fn description(&self) -> &str {
        "Install a missing package with npm, pip or cargo"
    }

    async fn invoke(
        &self,
        params: &serde_json::Value,
        _ctx: &CapabilityContext,
    ) -> Result<serde_json::Value, CapabilityError> {
        let package = params["package"]
            .as_str()
            .ok_or_else(|| CapabilityError::InvalidParams("Missing 'package' parameter".into()))?;
        if !is_safe_package_name(package) {
            return Err(CapabilityError::InvalidParams(format!(
                "Refusing to install suspicious package name '{package}'"
            )));
        }

        let manager = params["manager"].as_str().unwrap_or("npm");
        let command = match manager {
            "npm" => format!("npm install {package}"),
            "pip" => format!("python3 -m pip install {package}"),
            "cargo" => format!("cargo add {package}"),
            other => {
                return Err(CapabilityError::InvalidParams(format!(
                    "Unknown package manager '{other}'"
                )));
            }
        };

        let mut output = command_result(&command, &self.isolation).await?;
        output["package"] = json!(package);
        output["manager"] = json!(manager);
        Ok(output)
    }
}

fn is_safe_package_name(name: &str) -> bool {
    !name.is_empty()
        && !name.starts_with('-')
        && name
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '@' | '/' | '.' | '_' | '-'))
}

async fn command_result(
    command: &str,
    isolation: &IsolationConfig,
) -> Result<serde_json::Value, CapabilityError> {
    let output = run_shell(command, isolation)
        .await
        .map_err(|e| CapabilityError::failed(e.to_string()))?;

    if output.exit_code == 0 {
        Ok(json!({
            "stdout": output.stdout,
            "stderr": output.stderr,
            "exitCode": output.exit_code,
        }))
    } else {
        let message = if output.stderr.trim().is_empty() {
            format!("Command failed with exit code {}", output.exit_code)
        } else {
            output.stderr.trim().to_string()
        };
        Err(CapabilityError::with_code(
            format!("EXIT_{}", output.exit_code),
            message,
        ))
    }
}
