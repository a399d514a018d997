//! High-level sandbox façade
//!
//! Thin composition over the backend registry: construct by name (or
//! "auto"), auto-start and auto-restart on not-ready, ring-buffered
//! execution history, convenience shortcuts, plus a one-shot
//! [`execute_code`] for callers that need no persistent state.

use chrono::{DateTime, Utc};
use std::collections::VecDeque;
use std::time::Instant;

use crate::backend::{create_backend, SandboxBackend};
use crate::template::SandboxTemplate;
use crate::types::{
    CodeLanguage, ExecutionResult, FileInfo, HealthStatus, ProcessInfo, SandboxError,
    SandboxStatus,
};

const HISTORY_CAPACITY: usize = 100;

/// One entry of the execution history.
#[derive(Debug, Clone)]
pub struct ExecutionRecord {
    pub language: String,
    pub success: bool,
    pub exit_code: i32,
    pub duration_ms: f64,
    pub executed_at: DateTime<Utc>,
}

/// Code-interpreter sandbox: resolves a backend, runs code, tracks history.
pub struct CodeInterpreterSandbox {
    backend_name: String,
    template: SandboxTemplate,
    auto_restart: bool,
    backend: Option<Box<dyn SandboxBackend>>,
    history: VecDeque<ExecutionRecord>,
    started_at: Option<Instant>,
}

impl CodeInterpreterSandbox {
    pub fn new() -> Self {
        Self::with_backend("auto")
    }

    pub fn with_backend(backend_name: impl Into<String>) -> Self {
        Self {
            backend_name: backend_name.into(),
            template: SandboxTemplate::default(),
            auto_restart: true,
            backend: None,
            history: VecDeque::with_capacity(HISTORY_CAPACITY),
            started_at: None,
        }
    }

    pub fn with_template(mut self, template: SandboxTemplate) -> Self {
        self.template = template;
        self
    }

    pub fn with_auto_restart(mut self, auto_restart: bool) -> Self {
        self.auto_restart = auto_restart;
        self
    }

    pub fn is_ready(&self) -> bool {
        self.backend
            .as_ref()
            .map(|b| b.status() == SandboxStatus::Running)
            .unwrap_or(false)
    }

    pub fn backend_name(&self) -> &str {
        &self.backend_name
    }

    pub fn uptime_seconds(&self) -> f64 {
        self.started_at
            .map(|t| t.elapsed().as_secs_f64())
            .unwrap_or(0.0)
    }

    pub fn execution_count(&self) -> usize {
        self.history.len()
    }

    pub fn execution_history(&self) -> Vec<ExecutionRecord> {
        self.history.iter().cloned().collect()
    }

    /// Construct the backend via the registry and start it.
    pub async fn start(&mut self) -> Result<(), SandboxError> {
        if self.is_ready() {
            return Ok(());
        }
        let mut backend = create_backend(&self.backend_name, self.template.clone())?;
        backend.start().await?;
        tracing::info!(
            "Sandbox started on backend {} (id: {})",
            backend.name(),
            backend.sandbox_id()
        );
        self.backend = Some(backend);
        self.started_at = Some(Instant::now());
        Ok(())
    }

    /// Guaranteed teardown; never fails.
    pub async fn stop(&mut self) {
        if let Some(mut backend) = self.backend.take() {
            backend.stop().await;
        }
        self.started_at = None;
    }

    /// Stop and start a fresh backend. History is preserved.
    pub async fn restart(&mut self) -> Result<(), SandboxError> {
        self.stop().await;
        self.start().await
    }

    fn backend_ref(&self) -> Result<&dyn SandboxBackend, SandboxError> {
        match &self.backend {
            Some(backend) if backend.status() == SandboxStatus::Running => Ok(backend.as_ref()),
            Some(backend) => Err(SandboxError::not_ready(format!(
                "Sandbox is not running (status: {})",
                backend.status()
            ))),
            None => Err(SandboxError::not_ready("Sandbox not started".to_string())),
        }
    }

    fn record(&mut self, result: &ExecutionResult) {
        if self.history.len() == HISTORY_CAPACITY {
            self.history.pop_front();
        }
        self.history.push_back(ExecutionRecord {
            language: result.language.clone(),
            success: result.success,
            exit_code: result.exit_code,
            duration_ms: result.duration_ms,
            executed_at: Utc::now(),
        });
    }

    /// Run code on the backend. Auto-starts a pending sandbox and, on a
    /// not-ready failure, re-creates the backend and retries once - both
    /// only when `auto_restart` is enabled.
    pub async fn run_with(
        &mut self,
        code: &str,
        language: CodeLanguage,
        timeout: Option<u64>,
    ) -> Result<ExecutionResult, SandboxError> {
        if !self.is_ready() {
            if !self.auto_restart {
                return Err(SandboxError::not_ready("Sandbox not started".to_string()));
            }
            self.start().await?;
        }

        let attempt = self
            .backend_ref()?
            .execute(code, language, timeout)
            .await;
        let result = match attempt {
            Err(SandboxError::NotReady(reason)) if self.auto_restart => {
                tracing::warn!("Backend not ready ({reason}), restarting and retrying once");
                self.restart().await?;
                self.backend_ref()?.execute(code, language, timeout).await?
            }
            other => other?,
        };

        self.record(&result);
        Ok(result)
    }

    /// Run python code with the template's timeout.
    pub async fn run(&mut self, code: &str) -> Result<ExecutionResult, SandboxError> {
        self.run_with(code, CodeLanguage::Python, None).await
    }

    pub async fn run_python(&mut self, code: &str) -> Result<ExecutionResult, SandboxError> {
        self.run_with(code, CodeLanguage::Python, None).await
    }

    pub async fn run_shell(&mut self, command: &str) -> Result<ExecutionResult, SandboxError> {
        self.run_with(command, CodeLanguage::Shell, None).await
    }

    pub async fn run_command(
        &mut self,
        command: &str,
        timeout: Option<u64>,
    ) -> Result<ExecutionResult, SandboxError> {
        let result = self.backend_ref()?.run_command(command, timeout).await?;
        self.record(&result);
        Ok(result)
    }

    pub async fn read_file(&self, path: &str) -> Result<String, SandboxError> {
        self.backend_ref()?.read_file(path).await
    }

    pub async fn write_file(&self, path: &str, content: &str) -> Result<(), SandboxError> {
        self.backend_ref()?.write_file(path, content).await
    }

    pub async fn delete_file(&self, path: &str) -> Result<(), SandboxError> {
        self.backend_ref()?.delete_file(path).await
    }

    pub async fn list_directory(&self, path: &str) -> Result<Vec<FileInfo>, SandboxError> {
        self.backend_ref()?.list_directory(path).await
    }

    pub async fn list_processes(&self) -> Result<Vec<ProcessInfo>, SandboxError> {
        self.backend_ref()?.list_processes().await
    }

    pub async fn kill_process(&self, pid: u32, signal: i32) -> Result<(), SandboxError> {
        self.backend_ref()?.kill_process(pid, signal).await
    }

    /// Never fails; a missing backend reports unhealthy.
    pub async fn health_check(&self) -> HealthStatus {
        match &self.backend {
            Some(backend) => backend.check_health().await,
            None => HealthStatus::unhealthy("Sandbox not started", 0.0),
        }
    }
}

impl Default for CodeInterpreterSandbox {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for CodeInterpreterSandbox {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CodeInterpreterSandbox")
            .field("backend", &self.backend_name)
            .field("ready", &self.is_ready())
            .field("executions", &self.history.len())
            .finish()
    }
}

/// One-shot convenience: start a default sandbox, run once, always tear down.
pub async fn execute_code(
    code: &str,
    language: CodeLanguage,
    timeout: Option<u64>,
) -> Result<ExecutionResult, SandboxError> {
    let mut sandbox = CodeInterpreterSandbox::new();
    sandbox.start().await?;
    let result = sandbox.run_with(code, language, timeout).await;
    sandbox.stop().await;
    result
}
