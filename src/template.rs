//! Declarative sandbox configuration.
//!
//! A template describes resources, timeouts and environment for a sandbox.
//! Templates are immutable once handed to a backend, serialize to a JSON
//! document, and can be saved under a config directory by name.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};

use crate::types::{SandboxError, SandboxKind};

fn default_cpu() -> f64 {
    1.0
}
fn default_memory_mb() -> u64 {
    2048
}
fn default_disk_mb() -> u64 {
    10240
}
fn default_timeout_seconds() -> u64 {
    300
}
fn default_idle_timeout_seconds() -> u64 {
    600
}
fn default_startup_timeout_seconds() -> u64 {
    60
}
fn default_backend() -> String {
    "auto".to_string()
}

/// Sandbox configuration: resources, timeouts, environment.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SandboxTemplate {
    pub name: String,
    #[serde(rename = "type", default)]
    pub kind: SandboxKind,
    #[serde(default = "default_cpu")]
    pub cpu: f64,
    #[serde(default = "default_memory_mb")]
    pub memory_mb: u64,
    #[serde(default = "default_disk_mb")]
    pub disk_mb: u64,
    #[serde(default = "default_timeout_seconds")]
    pub timeout_seconds: u64,
    #[serde(default = "default_idle_timeout_seconds")]
    pub idle_timeout_seconds: u64,
    #[serde(default = "default_startup_timeout_seconds")]
    pub startup_timeout_seconds: u64,
    #[serde(default = "default_backend")]
    pub backend: String,
    #[serde(default)]
    pub working_dir: Option<String>,
    #[serde(default)]
    pub environment: HashMap<String, String>,
    #[serde(default)]
    pub network_enabled: bool,
    #[serde(default)]
    pub tags: Vec<String>,
}

impl SandboxTemplate {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            kind: SandboxKind::CodeInterpreter,
            cpu: default_cpu(),
            memory_mb: default_memory_mb(),
            disk_mb: default_disk_mb(),
            timeout_seconds: default_timeout_seconds(),
            idle_timeout_seconds: default_idle_timeout_seconds(),
            startup_timeout_seconds: default_startup_timeout_seconds(),
            backend: default_backend(),
            working_dir: None,
            environment: HashMap::new(),
            network_enabled: false,
            tags: Vec::new(),
        }
    }

    /// Returns violation messages; an empty list means the template is valid.
    pub fn validate(&self) -> Vec<String> {
        let mut errors = Vec::new();
        if self.name.trim().is_empty() {
            errors.push("name must not be empty".to_string());
        }
        if self.cpu <= 0.0 {
            errors.push(format!("cpu must be positive (got {})", self.cpu));
        }
        if self.memory_mb == 0 {
            errors.push("memory_mb must be positive".to_string());
        }
        if self.disk_mb == 0 {
            errors.push("disk_mb must be positive".to_string());
        }
        if self.timeout_seconds == 0 {
            errors.push("timeout_seconds must be positive".to_string());
        }
        if self.idle_timeout_seconds == 0 {
            errors.push("idle_timeout_seconds must be positive".to_string());
        }
        if self.startup_timeout_seconds == 0 {
            errors.push("startup_timeout_seconds must be positive".to_string());
        }
        errors
    }

    /// Serialize to the JSON document format.
    pub fn to_document(&self) -> String {
        serde_json::to_string_pretty(self).unwrap_or_else(|_| "{}".to_string())
    }

    /// Parse a JSON document produced by [`to_document`](Self::to_document).
    pub fn from_document(doc: &str) -> Result<Self, SandboxError> {
        serde_json::from_str(doc)
            .map_err(|e| SandboxError::Sandbox(format!("Invalid template document: {e}")))
    }

    /// Default config directory: `~/.agenticx/templates`.
    pub fn default_config_dir() -> PathBuf {
        dirs::home_dir()
            .unwrap_or_else(|| PathBuf::from("/tmp"))
            .join(".agenticx")
            .join("templates")
    }

    /// Save under `<config_dir>/<name>.json`, creating the directory.
    pub fn save(&self, config_dir: &Path) -> Result<PathBuf, SandboxError> {
        std::fs::create_dir_all(config_dir)
            .map_err(|e| SandboxError::Sandbox(format!("Create config dir: {e}")))?;
        let path = config_dir.join(format!("{}.json", self.name));
        std::fs::write(&path, self.to_document())
            .map_err(|e| SandboxError::Sandbox(format!("Save template {}: {e}", self.name)))?;
        Ok(path)
    }

    /// Load a saved template by name.
    pub fn load(name: &str, config_dir: &Path) -> Result<Self, SandboxError> {
        let path = config_dir.join(format!("{name}.json"));
        let doc = std::fs::read_to_string(&path)
            .map_err(|e| SandboxError::Sandbox(format!("Load template {name}: {e}")))?;
        Self::from_document(&doc)
    }

    /// Names of all templates saved in the config directory.
    pub fn list_templates(config_dir: &Path) -> Vec<String> {
        let Ok(entries) = std::fs::read_dir(config_dir) else {
            return Vec::new();
        };
        let mut names: Vec<String> = entries
            .filter_map(|e| e.ok())
            .filter_map(|e| {
                let path = e.path();
                if path.extension().and_then(|s| s.to_str()) == Some("json") {
                    path.file_stem().and_then(|s| s.to_str()).map(String::from)
                } else {
                    None
                }
            })
            .collect();
        names.sort();
        names
    }
}

impl Default for SandboxTemplate {
    fn default() -> Self {
        default_code_interpreter()
    }
}

/// Standard code-interpreter profile.
pub fn default_code_interpreter() -> SandboxTemplate {
    SandboxTemplate::new("default-code-interpreter")
}

/// Reduced profile for short-lived, cheap executions.
pub fn lightweight() -> SandboxTemplate {
    let mut t = SandboxTemplate::new("lightweight");
    t.cpu = 0.5;
    t.memory_mb = 512;
    t.disk_mb = 2048;
    t.timeout_seconds = 60;
    t
}

/// Beefed-up profile for heavy workloads.
pub fn high_performance() -> SandboxTemplate {
    let mut t = SandboxTemplate::new("high-performance");
    t.cpu = 4.0;
    t.memory_mb = 8192;
    t.disk_mb = 20480;
    t.timeout_seconds = 600;
    t
}
