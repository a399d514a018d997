//! Core types shared by every backend: enums, result records, error taxonomy.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// What a sandbox is equipped for
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SandboxKind {
    CodeInterpreter,
    Browser,
    Aio,
}

impl Default for SandboxKind {
    fn default() -> Self {
        SandboxKind::CodeInterpreter
    }
}

impl std::fmt::Display for SandboxKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SandboxKind::CodeInterpreter => write!(f, "code_interpreter"),
            SandboxKind::Browser => write!(f, "browser"),
            SandboxKind::Aio => write!(f, "aio"),
        }
    }
}

impl std::str::FromStr for SandboxKind {
    type Err = String;
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "code_interpreter" | "code-interpreter" => Ok(SandboxKind::CodeInterpreter),
            "browser" => Ok(SandboxKind::Browser),
            "aio" => Ok(SandboxKind::Aio),
            _ => Err(format!("Unknown sandbox kind: {s}")),
        }
    }
}

/// Lifecycle state of a sandbox handle.
///
/// Transitions are monotonic within one lifecycle:
/// Pending -> Creating -> Running -> Stopping -> Stopped, with Error as the
/// terminal state for a failed start. A stopped or errored handle is not
/// reusable; create a fresh one.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SandboxStatus {
    Pending,
    Creating,
    Running,
    Stopping,
    Stopped,
    Error,
}

impl std::fmt::Display for SandboxStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            SandboxStatus::Pending => "pending",
            SandboxStatus::Creating => "creating",
            SandboxStatus::Running => "running",
            SandboxStatus::Stopping => "stopping",
            SandboxStatus::Stopped => "stopped",
            SandboxStatus::Error => "error",
        };
        write!(f, "{s}")
    }
}

/// Languages a backend may accept. Backends support a subset and reject the
/// rest with a typed error.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CodeLanguage {
    Python,
    Shell,
    Javascript,
    Typescript,
    Java,
    Go,
    Bash,
}

impl std::fmt::Display for CodeLanguage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            CodeLanguage::Python => "python",
            CodeLanguage::Shell => "shell",
            CodeLanguage::Javascript => "javascript",
            CodeLanguage::Typescript => "typescript",
            CodeLanguage::Java => "java",
            CodeLanguage::Go => "go",
            CodeLanguage::Bash => "bash",
        };
        write!(f, "{s}")
    }
}

impl std::str::FromStr for CodeLanguage {
    type Err = String;
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "python" | "py" => Ok(CodeLanguage::Python),
            "shell" | "sh" => Ok(CodeLanguage::Shell),
            "javascript" | "js" => Ok(CodeLanguage::Javascript),
            "typescript" | "ts" => Ok(CodeLanguage::Typescript),
            "java" => Ok(CodeLanguage::Java),
            "go" => Ok(CodeLanguage::Go),
            "bash" => Ok(CodeLanguage::Bash),
            _ => Err(format!("Unknown language: {s}")),
        }
    }
}

/// Result of one execute call, on any backend.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecutionResult {
    pub stdout: String,
    pub stderr: String,
    pub exit_code: i32,
    pub success: bool,
    pub duration_ms: f64,
    pub language: String,
    pub truncated: bool,
    #[serde(default)]
    pub metadata: HashMap<String, serde_json::Value>,
}

impl Default for ExecutionResult {
    fn default() -> Self {
        Self {
            stdout: String::new(),
            stderr: String::new(),
            exit_code: 0,
            success: true,
            duration_ms: 0.0,
            language: "python".to_string(),
            truncated: false,
            metadata: HashMap::new(),
        }
    }
}

impl ExecutionResult {
    /// Construct with `success` derived from the exit code.
    pub fn new(stdout: impl Into<String>, stderr: impl Into<String>, exit_code: i32) -> Self {
        Self {
            stdout: stdout.into(),
            stderr: stderr.into(),
            exit_code,
            success: exit_code == 0,
            ..Default::default()
        }
    }

    pub fn with_language(mut self, language: impl Into<String>) -> Self {
        self.language = language.into();
        self
    }

    pub fn with_duration_ms(mut self, duration_ms: f64) -> Self {
        self.duration_ms = duration_ms;
        self
    }

    /// Primary output: stdout when present, stderr otherwise.
    pub fn output(&self) -> &str {
        if self.stdout.is_empty() {
            &self.stderr
        } else {
            &self.stdout
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum HealthState {
    Ok,
    Unhealthy,
    Unknown,
}

/// Outcome of a health probe. Probes never fail; an unreachable sandbox is
/// reported as unhealthy.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthStatus {
    pub status: HealthState,
    pub message: String,
    pub latency_ms: f64,
    pub checked_at: DateTime<Utc>,
}

impl Default for HealthStatus {
    fn default() -> Self {
        Self {
            status: HealthState::Unknown,
            message: String::new(),
            latency_ms: 0.0,
            checked_at: Utc::now(),
        }
    }
}

impl HealthStatus {
    pub fn ok(message: impl Into<String>, latency_ms: f64) -> Self {
        Self {
            status: HealthState::Ok,
            message: message.into(),
            latency_ms,
            checked_at: Utc::now(),
        }
    }

    pub fn unhealthy(message: impl Into<String>, latency_ms: f64) -> Self {
        Self {
            status: HealthState::Unhealthy,
            message: message.into(),
            latency_ms,
            checked_at: Utc::now(),
        }
    }

    pub fn is_healthy(&self) -> bool {
        self.status == HealthState::Ok
    }
}

/// One directory entry as reported by a backend.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FileInfo {
    pub path: String,
    pub size: u64,
    #[serde(default)]
    pub is_dir: bool,
    #[serde(default)]
    pub permissions: String,
    #[serde(default)]
    pub modified_at: Option<DateTime<Utc>>,
}

/// One process as reported by a backend.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProcessInfo {
    pub pid: u32,
    pub command: String,
    pub status: String,
    #[serde(default)]
    pub cpu_percent: f64,
    #[serde(default)]
    pub memory_mb: f64,
}

impl ProcessInfo {
    pub fn running(pid: u32, command: impl Into<String>) -> Self {
        Self {
            pid,
            command: command.into(),
            status: "running".to_string(),
            cpu_percent: 0.0,
            memory_mb: 0.0,
        }
    }
}

/// Error taxonomy for the whole crate.
///
/// Backends translate their native failures into these variants at the
/// boundary; raw bollard/reqwest/io errors never escape a backend.
#[derive(Debug, thiserror::Error)]
pub enum SandboxError {
    #[error("{0}")]
    Sandbox(String),

    #[error("Execution timed out after {timeout_secs}s")]
    Timeout { timeout_secs: u64 },

    #[error("Execution failed (exit {exit_code}): {message}")]
    Execution {
        message: String,
        exit_code: i32,
        stderr: String,
    },

    #[error("Resource exhausted ({resource}): {message}")]
    Resource { message: String, resource: String },

    #[error("Sandbox not ready: {0}")]
    NotReady(String),

    #[error("Backend {backend} error: {message}")]
    Backend { backend: String, message: String },

    #[error("execd connection failed ({endpoint}): {message}")]
    ExecdConnection { message: String, endpoint: String },

    #[error("execd execution failed (exit {exit_code}): {message}")]
    ExecdExecution { message: String, exit_code: i32 },

    #[error("execd timed out after {timeout_secs}s")]
    ExecdTimeout { timeout_secs: u64 },

    #[error("Kernel not available: {0}")]
    KernelNotAvailable(String),
}

impl SandboxError {
    pub fn timeout(timeout_secs: u64) -> Self {
        SandboxError::Timeout { timeout_secs }
    }

    pub fn execution(message: impl Into<String>, exit_code: i32, stderr: impl Into<String>) -> Self {
        SandboxError::Execution {
            message: message.into(),
            exit_code,
            stderr: stderr.into(),
        }
    }

    pub fn not_ready(message: impl Into<String>) -> Self {
        SandboxError::NotReady(message.into())
    }

    pub fn backend(backend: impl Into<String>, message: impl Into<String>) -> Self {
        SandboxError::Backend {
            backend: backend.into(),
            message: message.into(),
        }
    }

    pub fn file_not_found(path: &str) -> Self {
        SandboxError::execution(format!("File not found: {path}"), 1, format!("File not found: {path}"))
    }
}
