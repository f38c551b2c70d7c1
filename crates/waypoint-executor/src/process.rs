//! Isolated process execution for command-running capabilities.
//!
//! On Linux, commands run under bubblewrap (`bwrap`) when it is installed.
//! Elsewhere, or when `bwrap` is missing, they run as a plain child process
//! with a cleared environment. Children are killed when the future is
//! dropped, so a step timeout also ends the process.

use std::path::PathBuf;
use std::process::Stdio;
use std::time::{Duration, Instant};

use thiserror::Error;
use tokio::process::Command;

/// Process execution errors.
#[derive(Error, Debug)]
pub enum ProcessError {
    /// Failed to spawn or wait on the process.
    #[error("Failed to run process: {0}")]
    Io(#[from] std::io::Error),

    /// Isolation was required but is unavailable.
    #[error("Isolation not available: {0}")]
    NotAvailable(String),
}

/// Isolation levels.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord)]
pub enum IsolationLevel {
    /// Plain child process.
    None = 0,
    /// Read-only view of the host filesystem.
    Minimal = 1,
    /// System directories read-only, private /tmp (default).
    #[default]
    Standard = 2,
    /// Standard plus no network.
    Strict = 3,
}

/// Process isolation configuration.
#[derive(Debug, Clone)]
pub struct IsolationConfig {
    /// Isolation level.
    pub level: IsolationLevel,
    /// Paths bound read-write.
    pub writable_paths: Vec<PathBuf>,
    /// Environment variable allowlist.
    pub env_allowlist: Vec<String>,
    /// Working directory.
    pub work_dir: Option<PathBuf>,
    /// Fail instead of falling back to a plain process.
    pub require_isolation: bool,
}

impl Default for IsolationConfig {
    fn default() -> Self {
        Self {
            level: IsolationLevel::Standard,
            writable_paths: vec![],
            env_allowlist: vec!["PATH".into(), "HOME".into(), "LANG".into(), "TERM".into()],
            work_dir: None,
            require_isolation: false,
        }
    }
}

/// Output of a finished process.
#[derive(Debug, Clone)]
pub struct ProcessOutput {
    /// Standard output.
    pub stdout: String,
    /// Standard error.
    pub stderr: String,
    /// Exit code (-1 when killed by a signal).
    pub exit_code: i32,
    /// Execution duration.
    pub duration: Duration,
    /// Whether the command ran under bubblewrap.
    pub isolated: bool,
}

/// Whether bubblewrap isolation is available on this host.
#[must_use]
pub fn is_isolation_available() -> bool {
    cfg!(target_os = "linux") && which::which("bwrap").is_ok()
}

/// Run `sh -c <script>` under the configured isolation.
///
/// # Errors
///
/// Returns error if the process cannot be spawned, or isolation is required
/// but unavailable.
pub async fn run_shell(script: &str, config: &IsolationConfig) -> Result<ProcessOutput, ProcessError> {
    let isolated = config.level > IsolationLevel::None && is_isolation_available();
    if !isolated && config.require_isolation && config.level > IsolationLevel::None {
        return Err(ProcessError::NotAvailable(
            "bubblewrap (bwrap) not installed".to_string(),
        ));
    }

    let mut cmd = if isolated {
        bwrap_command(config)
    } else {
        Command::new("sh")
    };
    cmd.arg("-c").arg(script);

    if !isolated {
        cmd.env_clear();
        for var in &config.env_allowlist {
            if let Ok(val) = std::env::var(var) {
                cmd.env(var, val);
            }
        }
    }
    if let Some(dir) = &config.work_dir {
        cmd.current_dir(dir);
    }

    let start = Instant::now();
    let output = cmd
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true)
        .output()
        .await?;

    Ok(ProcessOutput {
        stdout: String::from_utf8_lossy(&output.stdout).to_string(),
        stderr: String::from_utf8_lossy(&output.stderr).to_string(),
        exit_code: output.status.code().unwrap_or(-1),
        duration: start.elapsed(),
        isolated,
    })
}

/// Build the bubblewrap invocation; the caller appends `-c <script>`.
fn bwrap_command(config: &IsolationConfig) -> Command {
    let mut bwrap = Command::new("bwrap");
    bwrap
        .arg("--unshare-pid")
        .arg("--unshare-uts")
        .arg("--die-with-parent");

    match config.level {
        IsolationLevel::None | IsolationLevel::Minimal => {
            bwrap.args(["--ro-bind", "/", "/"]);
        }
        IsolationLevel::Standard | IsolationLevel::Strict => {
            for dir in ["/usr", "/bin", "/lib", "/sbin", "/etc"] {
                bwrap.args(["--ro-bind-try", dir, dir]);
            }
            bwrap
                .args(["--symlink", "/usr/lib64", "/lib64"])
                .args(["--tmpfs", "/tmp"])
                .args(["--proc", "/proc"])
                .args(["--dev", "/dev"]);
        }
    }

    if config.level >= IsolationLevel::Strict {
        bwrap.arg("--unshare-net");
    }

    for path in &config.writable_paths {
        bwrap.arg("--bind").arg(path).arg(path);
    }
    if let Some(dir) = &config.work_dir {
        bwrap.arg("--bind-try").arg(dir).arg(dir);
    }

    bwrap.arg("--clearenv");
    for var in &config.env_allowlist {
        if let Ok(val) = std::env::var(var) {
            bwrap.arg("--setenv").arg(var).arg(val);
        }
    }

    bwrap.arg("sh");
    bwrap
}
