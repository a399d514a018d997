//! HTTP client for the in-sandbox execd daemon
//!
//! The daemon exposes code, command, file, context and metrics endpoints on
//! a well-known port. Code execution optionally streams output as
//! Server-Sent Events. Retries happen here, at the transport, and nowhere
//! else: connection/timeout failures are retried with linear backoff,
//! non-2xx responses never are.

use futures_util::StreamExt;
use reqwest::Method;
use serde_json::{json, Value};
use std::collections::HashMap;
use std::sync::RwLock;
use std::time::{Duration, Instant};
use tokio::sync::Mutex;

use crate::types::SandboxError;

/// Port the daemon listens on inside the sandbox.
pub const DEFAULT_EXECD_PORT: u16 = 44772;

const DEFAULT_TIMEOUT_SECS: u64 = 30;
const DEFAULT_MAX_RETRIES: u32 = 3;
const DEFAULT_RETRY_DELAY_MS: u64 = 1000;

/// Response of POST /code.
#[derive(Debug, Clone, Default)]
pub struct CodeExecutionResult {
    pub stdout: String,
    pub stderr: String,
    /// Expression result text, when the daemon reports one
    pub result: String,
    pub exit_code: i32,
    pub success: bool,
    pub duration_ms: f64,
    pub context_id: Option<String>,
    pub language: String,
    pub metadata: Value,
}

impl CodeExecutionResult {
    /// Primary output: expression result, then stdout, then stderr.
    pub fn output(&self) -> &str {
        if !self.result.is_empty() {
            &self.result
        } else if !self.stdout.is_empty() {
            &self.stdout
        } else {
            &self.stderr
        }
    }
}

/// Response of POST /command.
#[derive(Debug, Clone, Default)]
pub struct CommandExecutionResult {
    pub stdout: String,
    pub stderr: String,
    pub exit_code: i32,
    pub success: bool,
    pub duration_ms: f64,
    /// Pid of a background command
    pub pid: Option<u32>,
    pub background: bool,
    pub metadata: Value,
}

/// One entry of GET /files/list.
#[derive(Debug, Clone)]
pub struct FileEntry {
    pub path: String,
    pub name: String,
    pub size: u64,
    pub is_dir: bool,
    pub mode: u32,
    pub modified_at: Option<String>,
}

/// A server-side stateful code session. Executions bound to the same id
/// share variables.
#[derive(Debug, Clone)]
pub struct CodeContext {
    pub context_id: String,
    pub language: String,
    pub created_at: Option<String>,
    pub metadata: Value,
}

/// execd HTTP client
pub struct ExecdClient {
    endpoint: String,
    token: Option<String>,
    timeout: Duration,
    max_retries: u32,
    retry_delay: Duration,
    client: RwLock<Option<reqwest::Client>>,
    contexts: Mutex<HashMap<String, CodeContext>>,
}

impl ExecdClient {
    pub fn new(endpoint: impl Into<String>) -> Self {
        Self {
            endpoint: endpoint.into().trim_end_matches('/').to_string(),
            token: None,
            timeout: Duration::from_secs(DEFAULT_TIMEOUT_SECS),
            max_retries: DEFAULT_MAX_RETRIES,
            retry_delay: Duration::from_millis(DEFAULT_RETRY_DELAY_MS),
            client: RwLock::new(None),
            contexts: Mutex::new(HashMap::new()),
        }
    }

    pub fn with_token(mut self, token: impl Into<String>) -> Self {
        self.token = Some(token.into());
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn with_max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = max_retries.max(1);
        self
    }

    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }

    pub fn is_connected(&self) -> bool {
        self.client.read().expect("client lock poisoned").is_some()
    }

    /// Initialize the HTTP session. Creating/closing the session is
    /// serialized by the caller; requests on one session may run concurrently.
    pub fn connect(&self) -> Result<(), SandboxError> {
        let client = reqwest::Client::builder()
            .timeout(self.timeout)
            .build()
            .map_err(|e| SandboxError::ExecdConnection {
                message: format!("HTTP session: {e}"),
                endpoint: self.endpoint.clone(),
            })?;
        *self.client.write().expect("client lock poisoned") = Some(client);
        tracing::debug!("Connected to execd at {}", self.endpoint);
        Ok(())
    }

    pub async fn close(&self) {
        *self.client.write().expect("client lock poisoned") = None;
        self.contexts.lock().await.clear();
        tracing::debug!("Disconnected from execd");
    }

    fn http(&self) -> Result<reqwest::Client, SandboxError> {
        if let Some(client) = self.client.read().expect("client lock poisoned").clone() {
            return Ok(client);
        }
        self.connect()?;
        Ok(self
            .client
            .read()
            .expect("client lock poisoned")
            .clone()
            .expect("client just connected"))
    }

    fn connection_error(&self, message: impl Into<String>) -> SandboxError {
        SandboxError::ExecdConnection {
            message: message.into(),
            endpoint: self.endpoint.clone(),
        }
    }

    /// One HTTP round-trip with the retry policy applied.
    async fn request(
        &self,
        method: Method,
        path: &str,
        body: Option<&Value>,
        query: Option<&[(&str, String)]>,
    ) -> Result<Value, SandboxError> {
        let client = self.http()?;
        let url = format!("{}{}", self.endpoint, path);
        let mut last_error = String::new();

        for attempt in 1..=self.max_retries {
            let mut builder = client.request(method.clone(), &url);
            if let Some(body) = body {
                builder = builder.json(body);
            }
            if let Some(query) = query {
                builder = builder.query(query);
            }
            if let Some(ref token) = self.token {
                builder = builder.bearer_auth(token);
            }

            match builder.send().await {
                Ok(response) => {
                    if !response.status().is_success() {
                        let status = response.status();
                        let text = response.text().await.unwrap_or_default();
                        return Err(SandboxError::ExecdExecution {
                            message: format!("{path} returned {status}: {text}"),
                            exit_code: 1,
                        });
                    }
                    let text = response.text().await.unwrap_or_default();
                    if text.trim().is_empty() {
                        return Ok(json!({}));
                    }
                    return Ok(serde_json::from_str(&text).unwrap_or(json!({ "raw": text })));
                }
                Err(e) if e.is_connect() || e.is_timeout() => {
                    last_error = e.to_string();
                    if attempt < self.max_retries {
                        tracing::warn!(
                            "execd request failed (attempt {attempt}/{}): {last_error}",
                            self.max_retries
                        );
                        tokio::time::sleep(self.retry_delay * attempt).await;
                    }
                }
                Err(e) => return Err(self.connection_error(e.to_string())),
            }
        }

        Err(self.connection_error(format!(
            "Failed after {} attempts: {last_error}",
            self.max_retries
        )))
    }

    // ==================== health ====================

    pub async fn ping(&self) -> bool {
        matches!(
            self.request(Method::GET, "/health", None, None).await,
            Ok(value) if value.get("status").and_then(|s| s.as_str()) == Some("ok")
        )
    }

    pub async fn get_health(&self) -> Result<Value, SandboxError> {
        self.request(Method::GET, "/health", None, None).await
    }

    // ==================== code execution ====================

    /// Execute code, optionally bound to a stateful context and optionally
    /// streaming output over SSE. Daemon-level failures other than
    /// connection exhaustion come back as a failed result, not an error.
    pub async fn execute_code(
        &self,
        code: &str,
        language: &str,
        context_id: Option<&str>,
        timeout: Option<u64>,
        stream: bool,
    ) -> Result<CodeExecutionResult, SandboxError> {
        let start = Instant::now();

        let mut payload = json!({
            "code": code,
            "language": language,
        });
        if let Some(context_id) = context_id {
            payload["context_id"] = json!(context_id);
        }
        if let Some(timeout) = timeout {
            payload["timeout_ms"] = json!(timeout * 1000);
        }

        if stream {
            let events = self.request_sse("/code", &payload).await?;
            let mut result = aggregate_stream_events(&events);
            result.duration_ms = start.elapsed().as_secs_f64() * 1000.0;
            result.context_id = context_id.map(String::from);
            result.language = language.to_string();
            return Ok(result);
        }

        match self.request(Method::POST, "/code", Some(&payload), None).await {
            Ok(value) => {
                let (stdout, stderr) = parse_logs(&value);
                let result_value = parse_result_text(&value);
                let exit_code = value
                    .get("exit_code")
                    .and_then(|c| c.as_i64())
                    .unwrap_or(0) as i32;
                let response_context = value
                    .get("context_id")
                    .and_then(|c| c.as_str())
                    .map(String::from);
                Ok(CodeExecutionResult {
                    stdout,
                    stderr,
                    result: result_value,
                    exit_code,
                    success: exit_code == 0,
                    duration_ms: start.elapsed().as_secs_f64() * 1000.0,
                    context_id: context_id.map(String::from).or(response_context),
                    language: language.to_string(),
                    metadata: value,
                })
            }
            Err(e @ SandboxError::ExecdConnection { .. }) => Err(e),
            Err(e) => Ok(CodeExecutionResult {
                stderr: e.to_string(),
                exit_code: 1,
                success: false,
                duration_ms: start.elapsed().as_secs_f64() * 1000.0,
                context_id: context_id.map(String::from),
                language: language.to_string(),
                ..Default::default()
            }),
        }
    }

    /// POST with `Accept: text/event-stream`, collecting every `data:` frame.
    async fn request_sse(&self, path: &str, payload: &Value) -> Result<Vec<Value>, SandboxError> {
        let client = self.http()?;
        let url = format!("{}{}", self.endpoint, path);

        let mut builder = client
            .post(&url)
            .header("Accept", "text/event-stream")
            .json(payload);
        if let Some(ref token) = self.token {
            builder = builder.bearer_auth(token);
        }

        let response = builder
            .send()
            .await
            .map_err(|e| self.connection_error(format!("SSE stream failed: {e}")))?;
        if !response.status().is_success() {
            let status = response.status();
            return Err(self.connection_error(format!("SSE stream failed: {status}")));
        }

        let mut events = Vec::new();
        let mut buffer = String::new();
        let mut body = response.bytes_stream();
        while let Some(chunk) = body.next().await {
            let chunk =
                chunk.map_err(|e| self.connection_error(format!("SSE stream failed: {e}")))?;
            buffer.push_str(&String::from_utf8_lossy(&chunk));
            while let Some(pos) = buffer.find('\n') {
                let line = buffer[..pos].trim_end_matches('\r').to_string();
                buffer.drain(..=pos);
                if let Some(event) = parse_sse_line(&line) {
                    events.push(event);
                }
            }
        }
        if let Some(event) = parse_sse_line(buffer.trim_end()) {
            events.push(event);
        }
        Ok(events)
    }

    // ==================== contexts ====================

    /// Create a stateful execution context; the returned id is opaque.
    pub async fn create_context(&self, language: &str) -> Result<CodeContext, SandboxError> {
        let payload = json!({ "language": language });
        let value = self
            .request(Method::POST, "/code/context", Some(&payload), None)
            .await?;

        let context_id = value
            .get("context_id")
            .or_else(|| value.get("id"))
            .and_then(|v| v.as_str())
            .unwrap_or_default()
            .to_string();
        let context = CodeContext {
            context_id: context_id.clone(),
            language: language.to_string(),
            created_at: value
                .get("created_at")
                .and_then(|v| v.as_str())
                .map(String::from),
            metadata: value,
        };
        self.contexts
            .lock()
            .await
            .insert(context_id.clone(), context.clone());
        tracing::debug!("Created code context: {context_id}");
        Ok(context)
    }

    pub async fn delete_context(&self, context_id: &str) -> Result<(), SandboxError> {
        self.request(
            Method::DELETE,
            &format!("/code/context/{context_id}"),
            None,
            None,
        )
        .await?;
        self.contexts.lock().await.remove(context_id);
        tracing::debug!("Deleted code context: {context_id}");
        Ok(())
    }

    pub async fn list_contexts(&self) -> Result<Vec<CodeContext>, SandboxError> {
        let value = self
            .request(Method::GET, "/code/context", None, None)
            .await?;
        let mut contexts = Vec::new();
        for item in value
            .get("contexts")
            .and_then(|c| c.as_array())
            .unwrap_or(&vec![])
        {
            contexts.push(CodeContext {
                context_id: item
                    .get("context_id")
                    .or_else(|| item.get("id"))
                    .and_then(|v| v.as_str())
                    .unwrap_or_default()
                    .to_string(),
                language: item
                    .get("language")
                    .and_then(|v| v.as_str())
                    .unwrap_or("python")
                    .to_string(),
                created_at: item
                    .get("created_at")
                    .and_then(|v| v.as_str())
                    .map(String::from),
                metadata: item.clone(),
            });
        }
        Ok(contexts)
    }

    // ==================== commands ====================

    pub async fn run_command(
        &self,
        command: &str,
        background: bool,
        timeout: Option<u64>,
        cwd: Option<&str>,
        env: Option<&HashMap<String, String>>,
    ) -> Result<CommandExecutionResult, SandboxError> {
        let start = Instant::now();

        let mut payload = json!({
            "command": command,
            "background": background,
        });
        if let Some(timeout) = timeout {
            payload["timeout_ms"] = json!(timeout * 1000);
        }
        if let Some(cwd) = cwd {
            payload["cwd"] = json!(cwd);
        }
        if let Some(env) = env {
            payload["env"] = json!(env);
        }

        match self
            .request(Method::POST, "/command", Some(&payload), None)
            .await
        {
            Ok(value) => {
                let (stdout, stderr) = parse_logs(&value);
                let exit_code = value
                    .get("exit_code")
                    .and_then(|c| c.as_i64())
                    .unwrap_or(0) as i32;
                Ok(CommandExecutionResult {
                    stdout,
                    stderr,
                    exit_code,
                    success: exit_code == 0,
                    duration_ms: start.elapsed().as_secs_f64() * 1000.0,
                    pid: value.get("pid").and_then(|p| p.as_u64()).map(|p| p as u32),
                    background,
                    metadata: value,
                })
            }
            Err(e @ SandboxError::ExecdConnection { .. }) => Err(e),
            Err(e) => Ok(CommandExecutionResult {
                stderr: e.to_string(),
                exit_code: 1,
                success: false,
                duration_ms: start.elapsed().as_secs_f64() * 1000.0,
                background,
                ..Default::default()
            }),
        }
    }

    /// Kill a background command. Returns false instead of failing.
    pub async fn kill_command(&self, pid: u32, signal: i32) -> bool {
        let payload = json!({ "signal": signal });
        self.request(
            Method::POST,
            &format!("/command/{pid}/kill"),
            Some(&payload),
            None,
        )
        .await
        .is_ok()
    }

    // ==================== files ====================

    pub async fn read_file(&self, path: &str) -> Result<String, SandboxError> {
        let query = [("path", path.to_string())];
        let value = self
            .request(Method::GET, "/files", None, Some(&query))
            .await?;
        Ok(value
            .get("content")
            .or_else(|| value.get("data"))
            .and_then(|v| v.as_str())
            .unwrap_or_default()
            .to_string())
    }

    pub async fn write_file(&self, path: &str, content: &str, mode: u32) -> Result<(), SandboxError> {
        self.write_files(&[(path.to_string(), content.to_string(), mode)])
            .await
    }

    /// Write a batch of `(path, data, mode)` files in one request.
    pub async fn write_files(&self, files: &[(String, String, u32)]) -> Result<(), SandboxError> {
        let entries: Vec<Value> = files
            .iter()
            .map(|(path, data, mode)| json!({ "path": path, "data": data, "mode": mode }))
            .collect();
        let payload = json!({ "files": entries });
        self.request(Method::POST, "/files", Some(&payload), None)
            .await?;
        Ok(())
    }

    pub async fn list_directory(
        &self,
        path: &str,
        recursive: bool,
    ) -> Result<Vec<FileEntry>, SandboxError> {
        let mut query = vec![("path", path.to_string())];
        if recursive {
            query.push(("recursive", "true".to_string()));
        }
        let value = self
            .request(Method::GET, "/files/list", None, Some(&query))
            .await?;

        let items = value
            .get("files")
            .or_else(|| value.get("entries"))
            .and_then(|v| v.as_array())
            .cloned()
            .unwrap_or_default();
        let entries = items
            .iter()
            .map(|item| FileEntry {
                path: item
                    .get("path")
                    .and_then(|v| v.as_str())
                    .unwrap_or_default()
                    .to_string(),
                name: item
                    .get("name")
                    .and_then(|v| v.as_str())
                    .unwrap_or_default()
                    .to_string(),
                size: item.get("size").and_then(|v| v.as_u64()).unwrap_or(0),
                is_dir: item
                    .get("is_dir")
                    .or_else(|| item.get("isDir"))
                    .and_then(|v| v.as_bool())
                    .unwrap_or(false),
                mode: item.get("mode").and_then(|v| v.as_u64()).unwrap_or(0o644) as u32,
                modified_at: item
                    .get("modified_at")
                    .or_else(|| item.get("modifiedAt"))
                    .and_then(|v| v.as_str())
                    .map(String::from),
            })
            .collect();
        Ok(entries)
    }

    pub async fn delete_file(&self, path: &str) -> Result<(), SandboxError> {
        let query = [("path", path.to_string())];
        self.request(Method::DELETE, "/files", None, Some(&query))
            .await?;
        Ok(())
    }

    pub async fn mkdir(&self, path: &str, mode: u32) -> Result<(), SandboxError> {
        let payload = json!({ "path": path, "mode": mode });
        self.request(Method::POST, "/files/mkdir", Some(&payload), None)
            .await?;
        Ok(())
    }

    // ==================== metrics ====================

    pub async fn get_metrics(&self) -> Result<Value, SandboxError> {
        self.request(Method::GET, "/metrics", None, None).await
    }
}

/// Create a connected client for the default local daemon endpoint.
pub fn create_execd_client(endpoint: Option<&str>, token: Option<&str>) -> Result<ExecdClient, SandboxError> {
    let endpoint = endpoint
        .map(String::from)
        .unwrap_or_else(|| format!("http://localhost:{DEFAULT_EXECD_PORT}"));
    let mut client = ExecdClient::new(endpoint);
    if let Some(token) = token {
        client = client.with_token(token);
    }
    client.connect()?;
    Ok(client)
}

/// Decode one SSE line. Only `data:` lines carry payloads; a payload that is
/// not JSON is wrapped as `{"raw": <text>}`.
pub(crate) fn parse_sse_line(line: &str) -> Option<Value> {
    let data = line.strip_prefix("data:")?.trim();
    if data.is_empty() {
        return None;
    }
    Some(serde_json::from_str(data).unwrap_or(json!({ "raw": data })))
}

/// Fold stdout/stderr/result/exit events into one result.
pub(crate) fn aggregate_stream_events(events: &[Value]) -> CodeExecutionResult {
    let mut result = CodeExecutionResult::default();
    for event in events {
        let text = event.get("text").and_then(|t| t.as_str()).unwrap_or("");
        match event.get("type").and_then(|t| t.as_str()) {
            Some("stdout") => result.stdout.push_str(text),
            Some("stderr") => result.stderr.push_str(text),
            Some("result") => result.result = text.to_string(),
            Some("exit") => {
                result.exit_code = event
                    .get("exit_code")
                    .and_then(|c| c.as_i64())
                    .unwrap_or(0) as i32;
            }
            _ => {}
        }
    }
    result.success = result.exit_code == 0;
    result
}

/// Pull `logs.stdout` / `logs.stderr` out of a daemon response; entries are
/// `{text}` objects or bare strings.
pub(crate) fn parse_logs(value: &Value) -> (String, String) {
    let collect = |items: Option<&Value>| -> String {
        items
            .and_then(|v| v.as_array())
            .map(|entries| {
                entries
                    .iter()
                    .map(|entry| match entry {
                        Value::String(s) => s.clone(),
                        other => other
                            .get("text")
                            .and_then(|t| t.as_str())
                            .unwrap_or_default()
                            .to_string(),
                    })
                    .collect::<Vec<_>>()
                    .join("")
            })
            .unwrap_or_default()
    };
    let logs = value.get("logs");
    (
        collect(logs.and_then(|l| l.get("stdout"))),
        collect(logs.and_then(|l| l.get("stderr"))),
    )
}

/// First entry of the response's `result` list, as text.
pub(crate) fn parse_result_text(value: &Value) -> String {
    value
        .get("result")
        .and_then(|r| r.as_array())
        .and_then(|arr| arr.first())
        .map(|first| match first {
            Value::String(s) => s.clone(),
            other => other
                .get("text")
                .and_then(|t| t.as_str())
                .unwrap_or_default()
                .to_string(),
        })
        .unwrap_or_default()
}
