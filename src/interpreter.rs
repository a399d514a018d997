//! Stateful code interpreter
//!
//! `execute(code)` such that variables, imports and definitions from earlier
//! calls are visible to later calls, until `reset()` or `stop()`. Backed by
//! either a remote execd context or a local kernel session, chosen at start;
//! an interpreter owns exactly one of the two, never both.
//!
//! Callers serialize `execute` per interpreter; for parallelism, create
//! several interpreters - their contexts/sessions do not share state.

use crate::execd::ExecdClient;
use crate::kernel::{kernel_available, KernelManager};
use crate::types::{ExecutionResult, SandboxError};

const DEFAULT_KERNEL: &str = "python3";

enum InterpreterBackend {
    Execd {
        client: ExecdClient,
        context_id: String,
    },
    Kernel {
        manager: KernelManager,
        session_id: String,
    },
}

/// Stateful interpreter over an execd context or a local kernel session.
pub struct StatefulCodeInterpreter {
    execd_endpoint: Option<String>,
    execd_token: Option<String>,
    use_local_kernel: bool,
    kernel_name: String,
    backend: Option<InterpreterBackend>,
}

impl StatefulCodeInterpreter {
    pub fn new() -> Self {
        Self {
            execd_endpoint: None,
            execd_token: None,
            use_local_kernel: true,
            kernel_name: DEFAULT_KERNEL.to_string(),
            backend: None,
        }
    }

    /// Prefer a remote execd daemon at `endpoint`.
    pub fn with_execd_endpoint(mut self, endpoint: impl Into<String>) -> Self {
        self.execd_endpoint = Some(endpoint.into());
        self
    }

    pub fn with_execd_token(mut self, token: impl Into<String>) -> Self {
        self.execd_token = Some(token.into());
        self
    }

    /// Allow or forbid the local-kernel fallback.
    pub fn with_local_kernel(mut self, use_local_kernel: bool) -> Self {
        self.use_local_kernel = use_local_kernel;
        self
    }

    pub fn with_kernel_name(mut self, kernel_name: impl Into<String>) -> Self {
        self.kernel_name = kernel_name.into();
        self
    }

    /// "execd" or "kernel" once started.
    pub fn backend(&self) -> Option<&'static str> {
        match self.backend {
            Some(InterpreterBackend::Execd { .. }) => Some("execd"),
            Some(InterpreterBackend::Kernel { .. }) => Some("kernel"),
            None => None,
        }
    }

    pub fn context_id(&self) -> Option<&str> {
        match &self.backend {
            Some(InterpreterBackend::Execd { context_id, .. }) => Some(context_id),
            _ => None,
        }
    }

    pub fn session_id(&self) -> Option<&str> {
        match &self.backend {
            Some(InterpreterBackend::Kernel { session_id, .. }) => Some(session_id),
            _ => None,
        }
    }

    /// Pick a backend: execd when configured and reachable, else the local
    /// kernel, else fail with kernel-not-available.
    pub async fn start(&mut self) -> Result<(), SandboxError> {
        if self.backend.is_some() {
            return Ok(());
        }

        if let Some(ref endpoint) = self.execd_endpoint {
            let mut client = ExecdClient::new(endpoint.clone());
            if let Some(ref token) = self.execd_token {
                client = client.with_token(token.clone());
            }
            let context = match client.connect() {
                Ok(()) => client.create_context("python").await,
                Err(e) => Err(e),
            };
            match context {
                Ok(context) => {
                    tracing::info!(
                        "Stateful interpreter started with execd backend, context: {}",
                        context.context_id
                    );
                    self.backend = Some(InterpreterBackend::Execd {
                        client,
                        context_id: context.context_id,
                    });
                    return Ok(());
                }
                Err(e) => {
                    tracing::warn!("Failed to connect to execd: {e}, falling back to kernel");
                }
            }
        }

        if self.use_local_kernel && kernel_available() {
            let manager = KernelManager::with_kernel(&self.kernel_name)?;
            manager.start().await?;
            let session_id = manager
                .default_session_id()
                .ok_or_else(|| SandboxError::KernelNotAvailable("No default session".to_string()))?;
            tracing::info!("Stateful interpreter started with kernel backend, session: {session_id}");
            self.backend = Some(InterpreterBackend::Kernel {
                manager,
                session_id,
            });
            return Ok(());
        }

        Err(SandboxError::KernelNotAvailable(
            "Neither execd nor a local kernel is available for stateful execution".to_string(),
        ))
    }

    /// Tear down the context/session. Best effort, never fails.
    pub async fn stop(&mut self) {
        match self.backend.take() {
            Some(InterpreterBackend::Execd { client, context_id }) => {
                if let Err(e) = client.delete_context(&context_id).await {
                    tracing::warn!("Error deleting execd context {context_id}: {e}");
                }
                client.close().await;
            }
            Some(InterpreterBackend::Kernel { manager, .. }) => {
                manager.stop().await;
            }
            None => {}
        }
        tracing::info!("Stateful interpreter stopped");
    }

    /// Execute code with cross-call state.
    pub async fn execute(
        &self,
        code: &str,
        timeout: Option<u64>,
    ) -> Result<ExecutionResult, SandboxError> {
        match &self.backend {
            Some(InterpreterBackend::Execd { client, context_id }) => {
                let run = client
                    .execute_code(code, "python", Some(context_id), timeout, false)
                    .await?;
                let mut result = ExecutionResult::new(run.stdout, run.stderr, run.exit_code)
                    .with_language("python")
                    .with_duration_ms(run.duration_ms);
                result.success = run.success;
                result.metadata.insert(
                    "backend".to_string(),
                    serde_json::Value::String("execd".to_string()),
                );
                if let Some(context_id) = run.context_id {
                    result.metadata.insert(
                        "context_id".to_string(),
                        serde_json::Value::String(context_id),
                    );
                }
                if !run.result.is_empty() {
                    result
                        .metadata
                        .insert("result".to_string(), serde_json::Value::String(run.result));
                }
                Ok(result)
            }
            Some(InterpreterBackend::Kernel {
                manager,
                session_id,
            }) => {
                let mut result = manager.execute(code, Some(session_id), timeout).await?;
                result.metadata.insert(
                    "backend".to_string(),
                    serde_json::Value::String("kernel".to_string()),
                );
                Ok(result)
            }
            None => Err(SandboxError::KernelNotAvailable(
                "Interpreter not started".to_string(),
            )),
        }
    }

    /// Discard all session state, keeping the interpreter usable.
    pub async fn reset(&mut self) -> Result<(), SandboxError> {
        match &mut self.backend {
            Some(InterpreterBackend::Execd { client, context_id }) => {
                if let Err(e) = client.delete_context(context_id).await {
                    tracing::warn!("Error deleting execd context {context_id}: {e}");
                }
                let context = client.create_context("python").await?;
                *context_id = context.context_id;
                tracing::info!("Reset execd context: {context_id}");
                Ok(())
            }
            Some(InterpreterBackend::Kernel {
                manager,
                session_id,
            }) => {
                manager.restart(Some(session_id)).await?;
                tracing::info!("Reset kernel session: {session_id}");
                Ok(())
            }
            None => Err(SandboxError::KernelNotAvailable(
                "Interpreter not started".to_string(),
            )),
        }
    }

    /// Interrupt the running execution. Kernel backend only; the execd
    /// protocol has no interrupt endpoint.
    pub async fn interrupt(&self) {
        if let Some(InterpreterBackend::Kernel {
            manager,
            session_id,
        }) = &self.backend
        {
            manager.interrupt(Some(session_id)).await;
        }
    }
}

impl Default for StatefulCodeInterpreter {
    fn default() -> Self {
        Self::new()
    }
}
