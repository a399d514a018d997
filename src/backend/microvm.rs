//! MicroVM backend - hardware isolation via an external microsandbox server
//!
//! The server owns the hypervisor; this backend is a JSON-RPC client that
//! creates a named session in a namespace, submits python/shell work to it,
//! and tears it down. Distinct namespaces never share state.
//!
//! The default image is minimal (no shell utilities), so file and process
//! operations are expressed as python snippets that print JSON.

use async_trait::async_trait;
use base64::Engine as _;
use serde_json::{json, Value};
use std::collections::HashMap;
use std::sync::RwLock;
use std::time::{Duration, Instant};
use uuid::Uuid;

use super::SandboxBackend;
use crate::template::SandboxTemplate;
use crate::types::{
    CodeLanguage, ExecutionResult, FileInfo, HealthStatus, ProcessInfo, SandboxError,
    SandboxStatus,
};

const DEFAULT_SERVER_URL: &str = "http://127.0.0.1:5555";
const DEFAULT_IMAGE: &str = "microsandbox/python";
const DEFAULT_NAMESPACE: &str = "default";
const DEFAULT_STARTUP_TIMEOUT_SECS: u64 = 300;
/// Generous total timeout so a first-time image pull does not sever the session.
const HTTP_TOTAL_TIMEOUT_SECS: u64 = 600;

/// MicroVM backend configuration
#[derive(Debug, Clone)]
pub struct MicroVmConfig {
    /// microsandbox server URL (default: `MSB_SERVER_URL` env)
    pub server_url: String,
    /// API key sent as a bearer token (default: `MSB_API_KEY` env)
    pub api_key: Option<String>,
    /// Namespace for state isolation
    pub namespace: String,
    /// Base image
    pub image: String,
    /// Startup budget; image pulls can be slow
    pub startup_timeout_seconds: u64,
}

impl Default for MicroVmConfig {
    fn default() -> Self {
        Self {
            server_url: std::env::var("MSB_SERVER_URL")
                .unwrap_or_else(|_| DEFAULT_SERVER_URL.to_string()),
            api_key: std::env::var("MSB_API_KEY").ok(),
            namespace: DEFAULT_NAMESPACE.to_string(),
            image: DEFAULT_IMAGE.to_string(),
            startup_timeout_seconds: DEFAULT_STARTUP_TIMEOUT_SECS,
        }
    }
}

/// MicroVM backend implementation
pub struct MicroVmSandbox {
    sandbox_id: String,
    template: SandboxTemplate,
    config: MicroVmConfig,
    status: RwLock<SandboxStatus>,
    client: RwLock<Option<reqwest::Client>>,
}

impl MicroVmSandbox {
    pub fn from_template(template: SandboxTemplate) -> Self {
        Self::with_config(template, MicroVmConfig::default())
    }

    pub fn with_config(template: SandboxTemplate, config: MicroVmConfig) -> Self {
        Self {
            sandbox_id: format!("sbx-{}", &Uuid::new_v4().to_string()[..8]),
            template,
            config,
            status: RwLock::new(SandboxStatus::Pending),
            client: RwLock::new(None),
        }
    }

    pub fn namespace(&self) -> &str {
        &self.config.namespace
    }

    pub fn server_url(&self) -> &str {
        &self.config.server_url
    }

    fn set_status(&self, status: SandboxStatus) {
        *self.status.write().expect("status lock poisoned") = status;
    }

    fn ensure_running(&self) -> Result<(), SandboxError> {
        if self.status() != SandboxStatus::Running {
            return Err(SandboxError::not_ready(format!(
                "MicroVM sandbox {} is not running (status: {})",
                self.sandbox_id,
                self.status()
            )));
        }
        Ok(())
    }

    /// Map a server/runtime failure into the taxonomy.
    fn map_error(&self, message: &str) -> SandboxError {
        let lower = message.to_lowercase();
        if lower.contains("not started") {
            SandboxError::not_ready(format!("Sandbox not ready: {message}"))
        } else if lower.contains("execute") || lower.contains("execution") {
            SandboxError::execution(format!("Execution failed: {message}"), 1, message)
        } else {
            SandboxError::backend("microVM", message)
        }
    }

    async fn rpc_call(&self, method: &str, params: Value) -> Result<Value, SandboxError> {
        let client = self
            .client
            .read()
            .expect("client lock poisoned")
            .clone()
            .ok_or_else(|| SandboxError::not_ready("HTTP session not attached".to_string()))?;

        let url = format!("{}/api/v1/rpc", self.config.server_url.trim_end_matches('/'));
        let request = json!({
            "jsonrpc": "2.0",
            "id": chrono::Utc::now().timestamp_millis(),
            "method": method,
            "params": params,
        });

        let mut builder = client.post(&url).json(&request);
        if let Some(ref key) = self.config.api_key {
            builder = builder.bearer_auth(key);
        }

        let response = builder.send().await.map_err(|e| {
            if e.is_timeout() {
                SandboxError::timeout(self.template.timeout_seconds)
            } else {
                SandboxError::backend("microVM", format!("{method}: {e}"))
            }
        })?;

        if !response.status().is_success() {
            let status = response.status();
            let text = response.text().await.unwrap_or_default();
            return Err(self.map_error(&format!("{method} failed ({status}): {text}")));
        }

        let data: Value = response
            .json()
            .await
            .map_err(|e| SandboxError::backend("microVM", format!("Invalid response: {e}")))?;

        if let Some(error) = data.get("error") {
            let message = error
                .get("message")
                .and_then(|m| m.as_str())
                .map(String::from)
                .unwrap_or_else(|| error.to_string());
            return Err(self.map_error(&message));
        }

        Ok(data.get("result").cloned().unwrap_or(Value::Null))
    }

    fn session_params(&self) -> Value {
        json!({
            "sandbox": self.sandbox_id,
            "namespace": self.config.namespace,
        })
    }

    /// Split the result's `output` lines into stdout/stderr and derive the
    /// success flag from `has_error`.
    fn parse_run_result(result: &Value, language: CodeLanguage) -> ExecutionResult {
        let mut stdout = String::new();
        let mut stderr = String::new();
        if let Some(lines) = result.get("output").and_then(|o| o.as_array()) {
            for line in lines {
                let text = line.get("text").and_then(|t| t.as_str()).unwrap_or("");
                match line.get("stream").and_then(|s| s.as_str()) {
                    Some("stderr") => {
                        stderr.push_str(text);
                        stderr.push('\n');
                    }
                    _ => {
                        stdout.push_str(text);
                        stdout.push('\n');
                    }
                }
            }
        }
        let has_error = result
            .get("has_error")
            .and_then(|e| e.as_bool())
            .unwrap_or(false);
        let exit_code = result
            .get("exit_code")
            .and_then(|c| c.as_i64())
            .map(|c| c as i32)
            .unwrap_or(if has_error { 1 } else { 0 });

        let mut run = ExecutionResult::new(stdout, stderr, exit_code);
        run.success = !has_error && exit_code == 0;
        run.with_language(language.to_string())
    }

    async fn execute_python(&self, code: &str) -> Result<ExecutionResult, SandboxError> {
        let mut params = self.session_params();
        params["language"] = json!("python");
        params["code"] = json!(code);
        let result = self.rpc_call("sandbox.repl.run", params).await?;
        Ok(Self::parse_run_result(&result, CodeLanguage::Python))
    }

    async fn execute_shell(&self, command: &str) -> Result<ExecutionResult, SandboxError> {
        let mut params = self.session_params();
        params["command"] = json!(command);
        let result = self.rpc_call("sandbox.command.run", params).await?;
        Ok(Self::parse_run_result(&result, CodeLanguage::Shell))
    }

    /// Run a python snippet that prints one JSON object and parse it.
    async fn python_json_op(&self, code: &str) -> Result<Value, SandboxError> {
        let result = self.execute_python(code).await?;
        if !result.success {
            return Err(SandboxError::execution(
                "Snippet failed".to_string(),
                result.exit_code,
                result.stderr,
            ));
        }
        serde_json::from_str(result.stdout.trim())
            .map_err(|e| SandboxError::backend("microVM", format!("Unparsable snippet output: {e}")))
    }

    /// CPU/memory/disk/running metrics, unique to this backend.
    pub async fn metrics(&self) -> Result<HashMap<String, Value>, SandboxError> {
        self.ensure_running()?;
        match self.rpc_call("sandbox.metrics.get", self.session_params()).await {
            Ok(result) => {
                let mut metrics = HashMap::new();
                metrics.insert(
                    "cpu_percent".to_string(),
                    result.get("cpu_percent").cloned().unwrap_or(Value::Null),
                );
                metrics.insert(
                    "memory_mb".to_string(),
                    result.get("memory_mb").cloned().unwrap_or(Value::Null),
                );
                metrics.insert(
                    "disk_bytes".to_string(),
                    result.get("disk_bytes").cloned().unwrap_or(Value::Null),
                );
                metrics.insert(
                    "is_running".to_string(),
                    result
                        .get("is_running")
                        .cloned()
                        .unwrap_or(Value::Bool(true)),
                );
                Ok(metrics)
            }
            Err(e) => {
                tracing::warn!("Failed to get metrics: {e}");
                let mut metrics = HashMap::new();
                metrics.insert("cpu_percent".to_string(), Value::Null);
                metrics.insert("memory_mb".to_string(), Value::Null);
                metrics.insert("disk_bytes".to_string(), Value::Null);
                metrics.insert(
                    "is_running".to_string(),
                    Value::Bool(self.status() == SandboxStatus::Running),
                );
                Ok(metrics)
            }
        }
    }
}

#[async_trait]
impl SandboxBackend for MicroVmSandbox {
    fn name(&self) -> &'static str {
        "microvm"
    }

    fn sandbox_id(&self) -> &str {
        &self.sandbox_id
    }

    fn status(&self) -> SandboxStatus {
        *self.status.read().expect("status lock poisoned")
    }

    async fn start(&mut self) -> Result<(), SandboxError> {
        if self.status() == SandboxStatus::Running {
            tracing::debug!("MicroVM sandbox {} is already running", self.sandbox_id);
            return Ok(());
        }

        self.set_status(SandboxStatus::Creating);
        tracing::info!(
            "Starting MicroVM sandbox {} on {}",
            self.sandbox_id,
            self.config.server_url
        );

        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(HTTP_TOTAL_TIMEOUT_SECS))
            .build()
            .map_err(|e| {
                self.set_status(SandboxStatus::Error);
                SandboxError::backend("microVM", format!("HTTP session: {e}"))
            })?;
        *self.client.write().expect("client lock poisoned") = Some(client);

        let startup_secs = self
            .config
            .startup_timeout_seconds
            .max(self.template.startup_timeout_seconds);
        let mut params = self.session_params();
        params["config"] = json!({
            "image": self.config.image,
            "memory": self.template.memory_mb,
            "cpus": self.template.cpu,
            "timeout": startup_secs,
        });

        let started = tokio::time::timeout(
            Duration::from_secs(startup_secs),
            self.rpc_call("sandbox.start", params),
        )
        .await
        .unwrap_or(Err(SandboxError::timeout(startup_secs)));

        match started {
            Ok(_) => {
                self.set_status(SandboxStatus::Running);
                tracing::info!("MicroVM sandbox {} started", self.sandbox_id);
                Ok(())
            }
            Err(e) => {
                // The server may hold a half-created session; tear it down
                // before dropping the HTTP session.
                let _ = self.rpc_call("sandbox.stop", self.session_params()).await;
                *self.client.write().expect("client lock poisoned") = None;
                self.set_status(SandboxStatus::Error);
                tracing::error!("Failed to start MicroVM sandbox {}: {e}", self.sandbox_id);
                Err(e)
            }
        }
    }

    async fn stop(&mut self) {
        if self.status() == SandboxStatus::Stopped {
            return;
        }
        self.set_status(SandboxStatus::Stopping);
        tracing::info!("Stopping MicroVM sandbox {}", self.sandbox_id);

        if let Err(e) = self.rpc_call("sandbox.stop", self.session_params()).await {
            tracing::warn!("Error stopping MicroVM sandbox {}: {e}", self.sandbox_id);
        }
        *self.client.write().expect("client lock poisoned") = None;
        self.set_status(SandboxStatus::Stopped);
        tracing::info!("MicroVM sandbox {} stopped", self.sandbox_id);
    }

    async fn execute(
        &self,
        code: &str,
        language: CodeLanguage,
        timeout: Option<u64>,
    ) -> Result<ExecutionResult, SandboxError> {
        self.ensure_running()?;
        let timeout_secs = timeout.unwrap_or(self.template.timeout_seconds);
        let start = Instant::now();

        let run = match language {
            CodeLanguage::Python => {
                tokio::time::timeout(Duration::from_secs(timeout_secs), self.execute_python(code))
                    .await
            }
            CodeLanguage::Shell | CodeLanguage::Bash => {
                tokio::time::timeout(Duration::from_secs(timeout_secs), self.execute_shell(code))
                    .await
            }
            other => {
                return Err(SandboxError::Sandbox(format!(
                    "Unsupported language: {other}"
                )))
            }
        };

        let mut result = match run {
            Ok(inner) => inner?,
            Err(_) => return Err(SandboxError::timeout(timeout_secs)),
        };
        result.duration_ms = start.elapsed().as_secs_f64() * 1000.0;
        Ok(result)
    }

    async fn check_health(&self) -> HealthStatus {
        let start = Instant::now();
        if self.status() != SandboxStatus::Running {
            return HealthStatus::unhealthy(
                format!("Sandbox is not running (status: {})", self.status()),
                0.0,
            );
        }
        match self.execute("print('ok')", CodeLanguage::Python, Some(5)).await {
            Ok(result) if result.success && result.stdout.contains("ok") => HealthStatus::ok(
                "MicroVM sandbox is healthy",
                start.elapsed().as_secs_f64() * 1000.0,
            ),
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
        let path_lit = serde_json::to_string(path).unwrap_or_default();
        let code = format!(
            r#"
import json
try:
    with open({path_lit}, 'r') as f:
        content = f.read()
    print(json.dumps({{"success": True, "content": content}}))
except FileNotFoundError:
    print(json.dumps({{"success": False, "error": "FileNotFoundError"}}))
except Exception as e:
    print(json.dumps({{"success": False, "error": str(e)}}))
"#
        );
        let data = self.python_json_op(&code).await?;
        if data.get("success").and_then(|s| s.as_bool()).unwrap_or(false) {
            Ok(data
                .get("content")
                .and_then(|c| c.as_str())
                .unwrap_or("")
                .to_string())
        } else {
            Err(SandboxError::file_not_found(path))
        }
    }

    async fn write_file(&self, path: &str, content: &str) -> Result<(), SandboxError> {
        self.ensure_running()?;
        let encoded = base64::engine::general_purpose::STANDARD.encode(content.as_bytes());
        let path_lit = serde_json::to_string(path).unwrap_or_default();
        let code = format!(
            r#"
import base64, os, json
try:
    content = base64.b64decode('{encoded}').decode('utf-8')
    os.makedirs(os.path.dirname({path_lit}) or '.', exist_ok=True)
    with open({path_lit}, 'w') as f:
        f.write(content)
    print(json.dumps({{"success": True}}))
except Exception as e:
    print(json.dumps({{"success": False, "error": str(e)}}))
"#
        );
        let data = self.python_json_op(&code).await?;
        if data.get("success").and_then(|s| s.as_bool()).unwrap_or(false) {
            Ok(())
        } else {
            let error = data
                .get("error")
                .and_then(|e| e.as_str())
                .unwrap_or("unknown error");
            Err(SandboxError::execution(
                format!("Failed to write {path}: {error}"),
                1,
                error,
            ))
        }
    }

    async fn delete_file(&self, path: &str) -> Result<(), SandboxError> {
        self.ensure_running()?;
        let path_lit = serde_json::to_string(path).unwrap_or_default();
        let code = format!(
            r#"
import os, shutil, json
try:
    if os.path.isdir({path_lit}):
        shutil.rmtree({path_lit})
    elif os.path.exists({path_lit}):
        os.remove({path_lit})
    print(json.dumps({{"success": True}}))
except Exception as e:
    print(json.dumps({{"success": False, "error": str(e)}}))
"#
        );
        let _ = self.python_json_op(&code).await;
        Ok(())
    }

    async fn list_directory(&self, path: &str) -> Result<Vec<FileInfo>, SandboxError> {
        self.ensure_running()?;
        let path_lit = serde_json::to_string(path).unwrap_or_default();
        let code = format!(
            r#"
import os, stat, json
try:
    path = {path_lit}
    files = []
    for name in os.listdir(path):
        full_path = os.path.join(path, name)
        try:
            st = os.stat(full_path)
            files.append({{"path": full_path, "size": st.st_size,
                          "is_dir": stat.S_ISDIR(st.st_mode),
                          "permissions": stat.filemode(st.st_mode)}})
        except OSError:
            files.append({{"path": full_path, "size": 0, "is_dir": False, "permissions": ""}})
    print(json.dumps({{"success": True, "files": files}}))
except FileNotFoundError:
    print(json.dumps({{"success": False, "error": "Directory not found"}}))
except Exception as e:
    print(json.dumps({{"success": False, "error": str(e)}}))
"#
        );
        let data = self
            .python_json_op(&code)
            .await
            .map_err(|_| SandboxError::file_not_found(path))?;
        if !data.get("success").and_then(|s| s.as_bool()).unwrap_or(false) {
            return Err(SandboxError::file_not_found(path));
        }

        let mut files = Vec::new();
        for entry in data.get("files").and_then(|f| f.as_array()).unwrap_or(&vec![]) {
            files.push(FileInfo {
                path: entry
                    .get("path")
                    .and_then(|p| p.as_str())
                    .unwrap_or("")
                    .to_string(),
                size: entry.get("size").and_then(|s| s.as_u64()).unwrap_or(0),
                is_dir: entry.get("is_dir").and_then(|d| d.as_bool()).unwrap_or(false),
                permissions: entry
                    .get("permissions")
                    .and_then(|p| p.as_str())
                    .unwrap_or("")
                    .to_string(),
                modified_at: None,
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
        let code = r#"
import os, json
processes = []
try:
    if os.path.exists('/proc'):
        for pid_dir in os.listdir('/proc'):
            if pid_dir.isdigit():
                try:
                    with open(f'/proc/{pid_dir}/cmdline', 'r') as f:
                        cmdline = f.read().replace('\x00', ' ').strip()
                    if cmdline:
                        processes.append({"pid": int(pid_dir), "command": cmdline, "status": "running"})
                except OSError:
                    pass
    print(json.dumps({"success": True, "processes": processes}))
except Exception as e:
    print(json.dumps({"success": False, "error": str(e), "processes": []}))
"#;
        let data = self.python_json_op(code).await.unwrap_or(Value::Null);

        let mut processes = Vec::new();
        for entry in data
            .get("processes")
            .and_then(|p| p.as_array())
            .unwrap_or(&vec![])
        {
            processes.push(ProcessInfo {
                pid: entry.get("pid").and_then(|p| p.as_u64()).unwrap_or(0) as u32,
                command: entry
                    .get("command")
                    .and_then(|c| c.as_str())
                    .unwrap_or("")
                    .to_string(),
                status: entry
                    .get("status")
                    .and_then(|s| s.as_str())
                    .unwrap_or("unknown")
                    .to_string(),
                cpu_percent: entry
                    .get("cpu_percent")
                    .and_then(|c| c.as_f64())
                    .unwrap_or(0.0),
                memory_mb: entry
                    .get("memory_mb")
                    .and_then(|m| m.as_f64())
                    .unwrap_or(0.0),
            });
        }
        Ok(processes)
    }

    async fn kill_process(&self, pid: u32, signal: i32) -> Result<(), SandboxError> {
        self.ensure_running()?;
        let code = format!(
            r#"
import os, json
try:
    os.kill({pid}, {signal})
    print(json.dumps({{"success": True}}))
except ProcessLookupError:
    print(json.dumps({{"success": False, "error": "Process not found"}}))
except PermissionError:
    print(json.dumps({{"success": False, "error": "Permission denied"}}))
except Exception as e:
    print(json.dumps({{"success": False, "error": str(e)}}))
"#
        );
        match self.python_json_op(&code).await {
            Ok(data) if data.get("success").and_then(|s| s.as_bool()).unwrap_or(false) => Ok(()),
            Ok(data) => {
                tracing::warn!(
                    "Failed to kill process {pid}: {}",
                    data.get("error").and_then(|e| e.as_str()).unwrap_or("unknown")
                );
                Ok(())
            }
            Err(e) => {
                tracing::warn!("Failed to kill process {pid}: {e}");
                Ok(())
            }
        }
    }
}
