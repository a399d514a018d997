//! Subprocess backend - child-process execution on the host
//!
//! The simplest backend: no containerization, isolation is limited to a
//! per-sandbox working directory and a scoped environment. Callers that need
//! real isolation should pick the docker or microvm backend.

use async_trait::async_trait;
use std::collections::HashMap;
use std::path::PathBuf;
use std::process::Stdio;
use std::sync::{Arc, RwLock};
use std::time::{Duration, Instant};
use tokio::process::Command;
use tokio::sync::Mutex;
use uuid::Uuid;

use super::SandboxBackend;
use crate::template::SandboxTemplate;
use crate::types::{
    CodeLanguage, ExecutionResult, FileInfo, HealthStatus, ProcessInfo, SandboxError,
    SandboxStatus,
};

const SANDBOX_ID_ENV: &str = "AGENTICX_SANDBOX_ID";

/// Subprocess backend - executes in child processes under a scratch workdir.
pub struct SubprocessSandbox {
    sandbox_id: String,
    template: SandboxTemplate,
    status: RwLock<SandboxStatus>,
    working_dir: PathBuf,
    /// Live execs, pid -> command line
    children: Arc<Mutex<HashMap<u32, String>>>,
}

impl SubprocessSandbox {
    pub fn from_template(template: SandboxTemplate) -> Self {
        let sandbox_id = Uuid::new_v4().to_string()[..8].to_string();
        let working_dir = std::env::temp_dir().join(format!("agenticx-sandbox-{sandbox_id}"));
        Self {
            sandbox_id,
            template,
            status: RwLock::new(SandboxStatus::Pending),
            working_dir,
            children: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    pub fn new() -> Self {
        Self::from_template(SandboxTemplate::default())
    }

    pub fn working_dir(&self) -> &PathBuf {
        &self.working_dir
    }

    fn set_status(&self, status: SandboxStatus) {
        *self.status.write().expect("status lock poisoned") = status;
    }

    fn ensure_running(&self) -> Result<(), SandboxError> {
        if self.status() != SandboxStatus::Running {
            return Err(SandboxError::not_ready(format!(
                "Subprocess sandbox {} is not running (status: {})",
                self.sandbox_id,
                self.status()
            )));
        }
        Ok(())
    }

    /// Resolve a caller path against the working directory. A leading `/` is
    /// the sandbox root; `..` components are denied.
    fn resolve_path(&self, path: &str) -> Result<PathBuf, SandboxError> {
        let relative = path.trim_start_matches('/');
        let candidate = std::path::Path::new(relative);
        if candidate
            .components()
            .any(|c| matches!(c, std::path::Component::ParentDir))
        {
            return Err(SandboxError::execution(
                format!("Path outside sandbox root: {path}"),
                1,
                format!("Path outside sandbox root: {path}"),
            ));
        }
        Ok(self.working_dir.join(candidate))
    }

    async fn run_child(
        &self,
        program: &str,
        args: &[&str],
        command_line: &str,
        language: CodeLanguage,
        timeout_secs: u64,
    ) -> Result<ExecutionResult, SandboxError> {
        let mut cmd = Command::new(program);
        cmd.args(args)
            .current_dir(&self.working_dir)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        for (key, value) in &self.template.environment {
            cmd.env(key, value);
        }
        cmd.env(SANDBOX_ID_ENV, &self.sandbox_id);

        let start = Instant::now();
        let child = cmd
            .spawn()
            .map_err(|e| SandboxError::backend("subprocess", format!("Spawn failed: {e}")))?;

        let pid = child.id();
        if let Some(pid) = pid {
            self.children
                .lock()
                .await
                .insert(pid, command_line.to_string());
        }

        let waited =
            tokio::time::timeout(Duration::from_secs(timeout_secs), child.wait_with_output())
                .await;

        if let Some(pid) = pid {
            self.children.lock().await.remove(&pid);
        }

        // Dropping the timed-out future kills the child (kill_on_drop).
        let output = match waited {
            Ok(Ok(output)) => output,
            Ok(Err(e)) => {
                return Err(SandboxError::backend(
                    "subprocess",
                    format!("Wait failed: {e}"),
                ))
            }
            Err(_) => return Err(SandboxError::timeout(timeout_secs)),
        };

        let duration_ms = start.elapsed().as_secs_f64() * 1000.0;
        let stdout = String::from_utf8_lossy(&output.stdout).to_string();
        let stderr = String::from_utf8_lossy(&output.stderr).to_string();
        let exit_code = output.status.code().unwrap_or(-1);

        Ok(ExecutionResult::new(stdout, stderr, exit_code)
            .with_language(language.to_string())
            .with_duration_ms(duration_ms))
    }
}

impl Default for SubprocessSandbox {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl SandboxBackend for SubprocessSandbox {
    fn name(&self) -> &'static str {
        "subprocess"
    }

    fn sandbox_id(&self) -> &str {
        &self.sandbox_id
    }

    fn status(&self) -> SandboxStatus {
        *self.status.read().expect("status lock poisoned")
    }

    async fn start(&mut self) -> Result<(), SandboxError> {
        if self.status() == SandboxStatus::Running {
            tracing::debug!("Subprocess sandbox {} is already running", self.sandbox_id);
            return Ok(());
        }

        self.set_status(SandboxStatus::Creating);
        if let Err(e) = tokio::fs::create_dir_all(&self.working_dir).await {
            self.set_status(SandboxStatus::Error);
            let _ = tokio::fs::remove_dir_all(&self.working_dir).await;
            return Err(SandboxError::backend(
                "subprocess",
                format!("Create working dir {}: {e}", self.working_dir.display()),
            ));
        }

        self.set_status(SandboxStatus::Running);
        tracing::info!(
            "Subprocess sandbox {} started (workdir: {})",
            self.sandbox_id,
            self.working_dir.display()
        );
        Ok(())
    }

    async fn stop(&mut self) {
        if self.status() == SandboxStatus::Stopped {
            return;
        }
        self.set_status(SandboxStatus::Stopping);

        // Leftover execs should be gone by now (ops are serialized), but make
        // sure nothing outlives the sandbox.
        let leftovers: Vec<u32> = self.children.lock().await.keys().copied().collect();
        for pid in leftovers {
            tracing::warn!("Killing leftover child {pid} of sandbox {}", self.sandbox_id);
            let _ = Command::new("kill")
                .arg("-9")
                .arg(pid.to_string())
                .output()
                .await;
        }
        self.children.lock().await.clear();

        if let Err(e) = tokio::fs::remove_dir_all(&self.working_dir).await {
            if e.kind() != std::io::ErrorKind::NotFound {
                tracing::warn!(
                    "Error removing workdir of sandbox {}: {e}",
                    self.sandbox_id
                );
            }
        }

        self.set_status(SandboxStatus::Stopped);
        tracing::info!("Subprocess sandbox {} stopped", self.sandbox_id);
    }

    async fn execute(
        &self,
        code: &str,
        language: CodeLanguage,
        timeout: Option<u64>,
    ) -> Result<ExecutionResult, SandboxError> {
        self.ensure_running()?;
        let timeout_secs = timeout.unwrap_or(self.template.timeout_seconds);

        match language {
            CodeLanguage::Python => {
                self.run_child("python3", &["-c", code], code, language, timeout_secs)
                    .await
            }
            CodeLanguage::Shell | CodeLanguage::Bash => {
                self.run_child("sh", &["-c", code], code, language, timeout_secs)
                    .await
            }
            other => Err(SandboxError::Sandbox(format!(
                "Unsupported language: {other}"
            ))),
        }
    }

    async fn check_health(&self) -> HealthStatus {
        let start = Instant::now();
        if self.status() != SandboxStatus::Running {
            return HealthStatus::unhealthy(
                format!("Sandbox is not running (status: {})", self.status()),
                0.0,
            );
        }
        match self
            .execute("echo 'health_check_ok'", CodeLanguage::Shell, Some(5))
            .await
        {
            Ok(result) if result.success && result.stdout.contains("health_check_ok") => {
                HealthStatus::ok(
                    "Subprocess sandbox is healthy",
                    start.elapsed().as_secs_f64() * 1000.0,
                )
            }
            Ok(result) => HealthStatus::unhealthy(
                format!("Health check failed: {}", result.stderr),
                start.elapsed().as_secs_f64() * 1000.0,
            ),
            Err(e) => HealthStatus::unhealthy(
                format!("Health check error: {e}"),
                start.elapsed().as_secs_f64() * 1000.0,
            ),
        }
    }

    async fn read_file(&self, path: &str) -> Result<String, SandboxError> {
        self.ensure_running()?;
        let resolved = self.resolve_path(path)?;
        tokio::fs::read_to_string(&resolved)
            .await
            .map_err(|_| SandboxError::file_not_found(path))
    }

    async fn write_file(&self, path: &str, content: &str) -> Result<(), SandboxError> {
        self.ensure_running()?;
        let resolved = self.resolve_path(path)?;
        if let Some(parent) = resolved.parent() {
            let _ = tokio::fs::create_dir_all(parent).await;
        }
        tokio::fs::write(&resolved, content)
            .await
            .map_err(|e| SandboxError::execution(format!("Failed to write {path}: {e}"), 1, e.to_string()))
    }

    async fn delete_file(&self, path: &str) -> Result<(), SandboxError> {
        self.ensure_running()?;
        let resolved = self.resolve_path(path)?;
        let result = if resolved.is_dir() {
            tokio::fs::remove_dir_all(&resolved).await
        } else {
            tokio::fs::remove_file(&resolved).await
        };
        match result {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(SandboxError::execution(
                format!("Failed to delete {path}: {e}"),
                1,
                e.to_string(),
            )),
        }
    }

    async fn list_directory(&self, path: &str) -> Result<Vec<FileInfo>, SandboxError> {
        self.ensure_running()?;
        let resolved = self.resolve_path(path)?;
        let mut reader = tokio::fs::read_dir(&resolved)
            .await
            .map_err(|_| SandboxError::file_not_found(path))?;

        let mut files = Vec::new();
        while let Ok(Some(entry)) = reader.next_entry().await {
            let meta = match entry.metadata().await {
                Ok(m) => m,
                Err(_) => continue,
            };
            let full = entry.path();
            let relative = full
                .strip_prefix(&self.working_dir)
                .unwrap_or(&full)
                .to_string_lossy()
                .to_string();
            let permissions = {
                use std::os::unix::fs::PermissionsExt;
                format!("{:o}", meta.permissions().mode() & 0o777)
            };
            files.push(FileInfo {
                path: relative,
                size: meta.len(),
                is_dir: meta.is_dir(),
                permissions,
                modified_at: meta.modified().ok().map(chrono::DateTime::from),
            });
        }
        Ok(files)
    }

    async fn run_command(
        &self,
        command: &str,
        timeout: Option<u64>,
    ) -> Result<ExecutionResult, SandboxError> {
        self.execute(command, CodeLanguage::Shell, timeout).await
    }

    async fn list_processes(&self) -> Result<Vec<ProcessInfo>, SandboxError> {
        self.ensure_running()?;
        let children = self.children.lock().await;
        Ok(children
            .iter()
            .map(|(pid, command)| ProcessInfo::running(*pid, command.clone()))
            .collect())
    }

    async fn kill_process(&self, pid: u32, signal: i32) -> Result<(), SandboxError> {
        self.ensure_running()?;
        let output = Command::new("kill")
            .args([format!("-{signal}"), pid.to_string()])
            .output()
            .await
            .map_err(|e| SandboxError::backend("subprocess", format!("kill: {e}")))?;
        if !output.status.success() {
            tracing::warn!(
                "Failed to kill process {pid}: {}",
                String::from_utf8_lossy(&output.stderr)
            );
        }
        Ok(())
    }
}
