//! Local language-kernel sessions for stateful execution
//!
//! A kernel session is a persistent `python3` child running a small REPL
//! harness that speaks JSON lines over stdin/stdout. Variables, imports and
//! function definitions live in the harness namespace, so they survive
//! across execute calls until the session is restarted or deleted.
//!
//! Message taxonomy on the wire: `stream` (stdout/stderr text),
//! `execute_result` (text/plain of the trailing expression), `error`
//! (ename/evalue/traceback) and `status` (ready at boot, idle after each
//! request). Every per-request message carries the request id; foreign
//! messages are skipped.

use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::process::Stdio;
use std::sync::RwLock;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader, Lines};
use tokio::process::{Child, ChildStdin, ChildStdout, Command};
use tokio::sync::Mutex;
use uuid::Uuid;

use crate::types::{ExecutionResult, SandboxError};

const DEFAULT_KERNEL: &str = "python3";
const DEFAULT_STARTUP_TIMEOUT_SECS: u64 = 60;
const DEFAULT_EXECUTION_TIMEOUT_SECS: u64 = 30;

/// The REPL harness the kernel child runs. One JSON request per stdin line,
/// JSON messages per stdout line, shared namespace across requests.
const KERNEL_HARNESS: &str = r#"
import ast, io, json, sys, traceback

namespace = {"__name__": "__main__"}

def emit(message):
    print(json.dumps(message), flush=True)

emit({"type": "status", "state": "ready"})

for line in sys.stdin:
    line = line.strip()
    if not line:
        continue
    try:
        request = json.loads(line)
    except ValueError:
        continue
    req_id = request.get("id")
    code = request.get("code", "")
    stdout_buf, stderr_buf = io.StringIO(), io.StringIO()
    old_out, old_err = sys.stdout, sys.stderr
    sys.stdout, sys.stderr = stdout_buf, stderr_buf
    result_text = None
    error = None
    try:
        tree = ast.parse(code, mode="exec")
        if tree.body and isinstance(tree.body[-1], ast.Expr):
            trailing = ast.Expression(tree.body[-1].value)
            tree.body = tree.body[:-1]
            exec(compile(tree, "<session>", "exec"), namespace)
            value = eval(compile(trailing, "<session>", "eval"), namespace)
            if value is not None:
                result_text = repr(value)
        else:
            exec(compile(tree, "<session>", "exec"), namespace)
    except Exception:
        etype, evalue, tb = sys.exc_info()
        error = {
            "ename": etype.__name__,
            "evalue": str(evalue),
            "traceback": traceback.format_exception(etype, evalue, tb),
        }
    finally:
        sys.stdout, sys.stderr = old_out, old_err
    if stdout_buf.getvalue():
        emit({"type": "stream", "name": "stdout", "text": stdout_buf.getvalue(), "id": req_id})
    if stderr_buf.getvalue():
        emit({"type": "stream", "name": "stderr", "text": stderr_buf.getvalue(), "id": req_id})
    if result_text is not None:
        emit({"type": "execute_result", "data": {"text/plain": result_text}, "id": req_id})
    if error is not None:
        error["type"] = "error"
        error["id"] = req_id
        emit(error)
    emit({"type": "status", "state": "idle", "id": req_id})
"#;

/// True if the kernel toolkit (a python3 interpreter) is on PATH.
pub fn kernel_available() -> bool {
    which::which(DEFAULT_KERNEL).is_ok()
}

fn kernel_binary(kernel_name: &str) -> &str {
    match kernel_name {
        "python3" | "python" => "python3",
        other => other,
    }
}

/// A live kernel session: the child, its channels, and bookkeeping.
pub struct KernelSession {
    pub session_id: String,
    pub kernel_name: String,
    pub created_at: DateTime<Utc>,
    pub execution_count: u64,
    child: Child,
    stdin: ChildStdin,
    lines: Lines<BufReader<ChildStdout>>,
    next_msg_id: u64,
}

/// Snapshot of a session for listing.
#[derive(Debug, Clone)]
pub struct KernelSessionInfo {
    pub session_id: String,
    pub kernel_name: String,
    pub created_at: DateTime<Utc>,
    pub execution_count: u64,
    pub is_alive: bool,
}

impl KernelSession {
    async fn spawn(
        kernel_name: &str,
        startup_timeout: Duration,
    ) -> Result<(Child, ChildStdin, Lines<BufReader<ChildStdout>>), SandboxError> {
        let binary = kernel_binary(kernel_name);
        if which::which(binary).is_err() {
            return Err(SandboxError::KernelNotAvailable(format!(
                "{binary} not found on PATH"
            )));
        }

        let mut child = Command::new(binary)
            .args(["-u", "-c", KERNEL_HARNESS])
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::null())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| SandboxError::KernelNotAvailable(format!("Spawn kernel: {e}")))?;

        let stdin = child
            .stdin
            .take()
            .ok_or_else(|| SandboxError::KernelNotAvailable("No kernel stdin".to_string()))?;
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| SandboxError::KernelNotAvailable("No kernel stdout".to_string()))?;
        let mut lines = BufReader::new(stdout).lines();

        // Wait for the ready status before handing the session out.
        let ready = tokio::time::timeout(startup_timeout, async {
            while let Ok(Some(line)) = lines.next_line().await {
                if let Ok(message) = serde_json::from_str::<serde_json::Value>(&line) {
                    if message.get("type").and_then(|t| t.as_str()) == Some("status")
                        && message.get("state").and_then(|s| s.as_str()) == Some("ready")
                    {
                        return true;
                    }
                }
            }
            false
        })
        .await;

        match ready {
            Ok(true) => Ok((child, stdin, lines)),
            _ => {
                let _ = child.start_kill();
                Err(SandboxError::KernelNotAvailable(
                    "Kernel failed to signal ready".to_string(),
                ))
            }
        }
    }

    fn is_alive(&mut self) -> bool {
        matches!(self.child.try_wait(), Ok(None))
    }
}

/// Manages kernel session lifecycles and routes execute calls to them.
pub struct KernelManager {
    default_kernel: String,
    startup_timeout: Duration,
    execution_timeout: Duration,
    sessions: Mutex<HashMap<String, KernelSession>>,
    default_session_id: RwLock<Option<String>>,
}

impl KernelManager {
    pub fn new() -> Result<Self, SandboxError> {
        Self::with_kernel(DEFAULT_KERNEL)
    }

    pub fn with_kernel(default_kernel: &str) -> Result<Self, SandboxError> {
        if which::which(kernel_binary(default_kernel)).is_err() {
            return Err(SandboxError::KernelNotAvailable(format!(
                "{} not found on PATH",
                kernel_binary(default_kernel)
            )));
        }
        Ok(Self {
            default_kernel: default_kernel.to_string(),
            startup_timeout: Duration::from_secs(DEFAULT_STARTUP_TIMEOUT_SECS),
            execution_timeout: Duration::from_secs(DEFAULT_EXECUTION_TIMEOUT_SECS),
            sessions: Mutex::new(HashMap::new()),
            default_session_id: RwLock::new(None),
        })
    }

    pub fn default_session_id(&self) -> Option<String> {
        self.default_session_id
            .read()
            .expect("session id lock poisoned")
            .clone()
    }

    /// Create the default session.
    pub async fn start(&self) -> Result<(), SandboxError> {
        tracing::info!("Starting kernel manager");
        let session_id = self.create_session(&self.default_kernel.clone()).await?;
        *self
            .default_session_id
            .write()
            .expect("session id lock poisoned") = Some(session_id.clone());
        tracing::info!("Kernel manager started with default session {session_id}");
        Ok(())
    }

    /// Shut down every session.
    pub async fn stop(&self) {
        let ids: Vec<String> = self.sessions.lock().await.keys().cloned().collect();
        for session_id in ids {
            self.delete_session(&session_id).await;
        }
        *self
            .default_session_id
            .write()
            .expect("session id lock poisoned") = None;
        tracing::info!("Kernel manager stopped");
    }

    pub async fn create_session(&self, kernel_name: &str) -> Result<String, SandboxError> {
        let session_id = format!("kernel-{}", &Uuid::new_v4().simple().to_string()[..8]);
        tracing::debug!("Creating kernel session {session_id} with kernel {kernel_name}");

        let (child, stdin, lines) = KernelSession::spawn(kernel_name, self.startup_timeout).await?;
        let session = KernelSession {
            session_id: session_id.clone(),
            kernel_name: kernel_name.to_string(),
            created_at: Utc::now(),
            execution_count: 0,
            child,
            stdin,
            lines,
            next_msg_id: 0,
        };
        self.sessions.lock().await.insert(session_id.clone(), session);
        tracing::info!("Kernel session {session_id} created");
        Ok(session_id)
    }

    pub async fn delete_session(&self, session_id: &str) {
        let Some(mut session) = self.sessions.lock().await.remove(session_id) else {
            tracing::warn!("Session {session_id} not found");
            return;
        };
        if let Err(e) = session.child.start_kill() {
            tracing::warn!("Error shutting down kernel {session_id}: {e}");
        }
        let _ = session.child.wait().await;

        let mut default_id = self
            .default_session_id
            .write()
            .expect("session id lock poisoned");
        if default_id.as_deref() == Some(session_id) {
            *default_id = None;
        }
        tracing::info!("Kernel session {session_id} deleted");
    }

    pub async fn list_sessions(&self) -> Vec<KernelSessionInfo> {
        let mut sessions = self.sessions.lock().await;
        sessions
            .values_mut()
            .map(|s| {
                let is_alive = s.is_alive();
                KernelSessionInfo {
                    session_id: s.session_id.clone(),
                    kernel_name: s.kernel_name.clone(),
                    created_at: s.created_at,
                    execution_count: s.execution_count,
                    is_alive,
                }
            })
            .collect()
    }

    /// Execute code in a session (default session when `session_id` is None).
    /// State persists across calls on the same session.
    pub async fn execute(
        &self,
        code: &str,
        session_id: Option<&str>,
        timeout: Option<u64>,
    ) -> Result<ExecutionResult, SandboxError> {
        let resolved_id = session_id
            .map(String::from)
            .or_else(|| self.default_session_id())
            .ok_or_else(|| SandboxError::KernelNotAvailable("No session available".to_string()))?;

        let timeout_secs = timeout.unwrap_or(self.execution_timeout.as_secs());
        let start = std::time::Instant::now();

        // Kernel channels are not safe for concurrent use; holding the map
        // lock for the duration serializes executes per manager.
        let mut sessions = self.sessions.lock().await;
        let session = sessions.get_mut(&resolved_id).ok_or_else(|| {
            SandboxError::KernelNotAvailable(format!("Session {resolved_id} not found"))
        })?;
        if !session.is_alive() {
            return Err(SandboxError::KernelNotAvailable(format!(
                "Session {resolved_id} is not alive"
            )));
        }

        session.next_msg_id += 1;
        let msg_id = session.next_msg_id;
        let mut request = serde_json::to_string(&serde_json::json!({
            "id": msg_id,
            "code": code,
        }))
        .expect("request serializes");
        request.push('\n');
        session
            .stdin
            .write_all(request.as_bytes())
            .await
            .map_err(|e| SandboxError::KernelNotAvailable(format!("Kernel stdin: {e}")))?;

        let mut stdout = String::new();
        let mut stderr = String::new();
        let mut result_value = String::new();
        let mut error: Option<(String, String, Vec<String>)> = None;

        let drained = tokio::time::timeout(Duration::from_secs(timeout_secs), async {
            while let Ok(Some(line)) = session.lines.next_line().await {
                let Ok(message) = serde_json::from_str::<serde_json::Value>(&line) else {
                    continue;
                };
                // Stale messages from an earlier, timed-out request
                if message.get("id").and_then(|i| i.as_u64()) != Some(msg_id) {
                    continue;
                }
                match message.get("type").and_then(|t| t.as_str()) {
                    Some("stream") => {
                        let text = message.get("text").and_then(|t| t.as_str()).unwrap_or("");
                        match message.get("name").and_then(|n| n.as_str()) {
                            Some("stderr") => stderr.push_str(text),
                            _ => stdout.push_str(text),
                        }
                    }
                    Some("execute_result") => {
                        result_value = message
                            .get("data")
                            .and_then(|d| d.get("text/plain"))
                            .and_then(|t| t.as_str())
                            .unwrap_or("")
                            .to_string();
                    }
                    Some("error") => {
                        error = Some((
                            message
                                .get("ename")
                                .and_then(|e| e.as_str())
                                .unwrap_or("Error")
                                .to_string(),
                            message
                                .get("evalue")
                                .and_then(|e| e.as_str())
                                .unwrap_or("")
                                .to_string(),
                            message
                                .get("traceback")
                                .and_then(|t| t.as_array())
                                .map(|arr| {
                                    arr.iter()
                                        .filter_map(|v| v.as_str().map(String::from))
                                        .collect()
                                })
                                .unwrap_or_default(),
                        ));
                    }
                    Some("status")
                        if message.get("state").and_then(|s| s.as_str()) == Some("idle") =>
                    {
                        return true;
                    }
                    _ => {}
                }
            }
            false
        })
        .await;

        match drained {
            Ok(true) => {}
            Ok(false) => {
                return Err(SandboxError::KernelNotAvailable(format!(
                    "Session {resolved_id} channel closed"
                )))
            }
            Err(_) => return Err(SandboxError::timeout(timeout_secs)),
        }

        let duration_ms = start.elapsed().as_secs_f64() * 1000.0;
        session.execution_count += 1;

        let mut result = if let Some((ename, evalue, traceback)) = error {
            stderr.push_str(&format!("{ename}: {evalue}"));
            if !traceback.is_empty() {
                stderr.push('\n');
                stderr.push_str(&traceback.join("\n"));
            }
            ExecutionResult::new(stdout, stderr, 1)
        } else {
            ExecutionResult::new(stdout, stderr, 0)
        };
        result = result
            .with_language(session.kernel_name.clone())
            .with_duration_ms(duration_ms);
        result.metadata.insert(
            "session_id".to_string(),
            serde_json::Value::String(resolved_id),
        );
        if !result_value.is_empty() {
            result.metadata.insert(
                "result".to_string(),
                serde_json::Value::String(result_value),
            );
        }
        Ok(result)
    }

    /// Interrupt a busy session (SIGINT to the kernel child).
    pub async fn interrupt(&self, session_id: Option<&str>) {
        let Some(resolved_id) = session_id
            .map(String::from)
            .or_else(|| self.default_session_id())
        else {
            return;
        };
        let sessions = self.sessions.lock().await;
        if let Some(session) = sessions.get(&resolved_id) {
            if let Some(pid) = session.child.id() {
                let _ = Command::new("kill")
                    .arg("-2")
                    .arg(pid.to_string())
                    .output()
                    .await;
                tracing::debug!("Interrupted kernel {resolved_id}");
            }
        }
    }

    /// Restart a session. All state in the namespace is discarded.
    pub async fn restart(&self, session_id: Option<&str>) -> Result<(), SandboxError> {
        let Some(resolved_id) = session_id
            .map(String::from)
            .or_else(|| self.default_session_id())
        else {
            return Ok(());
        };

        let mut sessions = self.sessions.lock().await;
        let session = sessions.get_mut(&resolved_id).ok_or_else(|| {
            SandboxError::KernelNotAvailable(format!("Session {resolved_id} not found"))
        })?;

        let _ = session.child.start_kill();
        let _ = session.child.wait().await;

        let (child, stdin, lines) =
            KernelSession::spawn(&session.kernel_name, self.startup_timeout).await?;
        session.child = child;
        session.stdin = stdin;
        session.lines = lines;
        session.execution_count = 0;
        session.next_msg_id = 0;
        tracing::info!("Restarted kernel {resolved_id}");
        Ok(())
    }

    pub async fn is_alive(&self, session_id: Option<&str>) -> bool {
        let Some(resolved_id) = session_id
            .map(String::from)
            .or_else(|| self.default_session_id())
        else {
            return false;
        };
        let mut sessions = self.sessions.lock().await;
        sessions
            .get_mut(&resolved_id)
            .map(|s| s.is_alive())
            .unwrap_or(false)
    }
}
