//! Polyglot code-execution sandbox
//!
//! One uniform async interface for running untrusted code and shell commands
//! under configurable isolation, with session state, resource budgets and
//! structured results:
//!
//! - [`backend`]: the capability contract plus three implementations -
//!   subprocess (cwd isolation), docker (container), microvm (hardware)
//! - [`execd`]: HTTP/SSE client for the in-sandbox execution daemon
//! - [`kernel`] / [`interpreter`]: stateful execution that preserves
//!   variables, imports and definitions across calls
//! - [`sandbox`]: the high-level façade and the one-shot [`execute_code`]
//!
//! ```no_run
//! use agenticx_sandbox::CodeInterpreterSandbox;
//!
//! # async fn demo() -> Result<(), agenticx_sandbox::SandboxError> {
//! let mut sandbox = CodeInterpreterSandbox::new();
//! sandbox.start().await?;
//! let result = sandbox.run("print('Hello, AgenticX!')").await?;
//! assert!(result.stdout.contains("Hello, AgenticX!"));
//! sandbox.stop().await;
//! # Ok(())
//! # }
//! ```

pub mod backend;
pub mod execd;
pub mod interpreter;
pub mod kernel;
pub mod sandbox;
pub mod template;
pub mod types;

pub use backend::{
    backend_available, create_backend, register_backend, resolve_backend, BackendKind,
    DockerConfig, DockerSandbox, MicroVmConfig, MicroVmSandbox, SandboxBackend, SubprocessSandbox,
};
pub use execd::{
    create_execd_client, CodeContext, CodeExecutionResult, CommandExecutionResult, ExecdClient,
    FileEntry, DEFAULT_EXECD_PORT,
};
pub use interpreter::StatefulCodeInterpreter;
pub use kernel::{kernel_available, KernelManager, KernelSession, KernelSessionInfo};
pub use sandbox::{execute_code, CodeInterpreterSandbox, ExecutionRecord};
pub use template::{
    default_code_interpreter, high_performance, lightweight, SandboxTemplate,
};
pub use types::{
    CodeLanguage, ExecutionResult, FileInfo, HealthState, HealthStatus, ProcessInfo, SandboxError,
    SandboxKind, SandboxStatus,
};
