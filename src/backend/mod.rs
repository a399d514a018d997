//! Backend abstraction for sandbox execution
//!
//! Three backends:
//! - Subprocess: child processes with cwd isolation only
//! - Docker: Linux containers via the Engine API or the docker CLI
//! - MicroVM: hardware isolation via an external microsandbox server

mod docker;
mod microvm;
mod subprocess;

pub use docker::{DockerConfig, DockerSandbox};
pub use microvm::{MicroVmConfig, MicroVmSandbox};
pub use subprocess::SubprocessSandbox;

use async_trait::async_trait;
use lazy_static::lazy_static;
use std::collections::HashMap;
use std::sync::RwLock;

use crate::template::SandboxTemplate;
use crate::types::{
    CodeLanguage, ExecutionResult, FileInfo, HealthStatus, ProcessInfo, SandboxError,
    SandboxStatus,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BackendKind {
    Subprocess,
    Docker,
    MicroVm,
}

impl std::fmt::Display for BackendKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            BackendKind::Subprocess => write!(f, "subprocess"),
            BackendKind::Docker => write!(f, "docker"),
            BackendKind::MicroVm => write!(f, "microvm"),
        }
    }
}

impl std::str::FromStr for BackendKind {
    type Err = String;
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "subprocess" | "local" | "process" => Ok(BackendKind::Subprocess),
            "docker" | "container" => Ok(BackendKind::Docker),
            "microvm" | "microsandbox" => Ok(BackendKind::MicroVm),
            _ => Err(format!("Unknown backend: {s}")),
        }
    }
}

/// The capability contract every backend satisfies. Callers never branch on
/// the concrete backend.
#[async_trait]
pub trait SandboxBackend: Send + Sync {
    /// Backend name as registered ("subprocess", "docker", "microvm").
    fn name(&self) -> &'static str;

    fn sandbox_id(&self) -> &str;

    fn status(&self) -> SandboxStatus;

    /// Acquire the underlying platform. Idempotent on Running. On failure the
    /// status is Error and any partially-acquired resource is released.
    async fn start(&mut self) -> Result<(), SandboxError>;

    /// Release the underlying platform. Idempotent on Stopped; errors are
    /// logged and swallowed, the status always ends up Stopped.
    async fn stop(&mut self);

    /// Run code. `timeout` overrides the template budget (seconds).
    async fn execute(
        &self,
        code: &str,
        language: CodeLanguage,
        timeout: Option<u64>,
    ) -> Result<ExecutionResult, SandboxError>;

    /// Probe liveness. Never fails; unreachable means unhealthy.
    async fn check_health(&self) -> HealthStatus;

    async fn read_file(&self, path: &str) -> Result<String, SandboxError>;

    async fn write_file(&self, path: &str, content: &str) -> Result<(), SandboxError>;

    async fn delete_file(&self, path: &str) -> Result<(), SandboxError>;

    async fn list_directory(&self, path: &str) -> Result<Vec<FileInfo>, SandboxError>;

    async fn run_command(
        &self,
        command: &str,
        timeout: Option<u64>,
    ) -> Result<ExecutionResult, SandboxError>;

    async fn list_processes(&self) -> Result<Vec<ProcessInfo>, SandboxError>;

    async fn kill_process(&self, pid: u32, signal: i32) -> Result<(), SandboxError>;
}

/// Constructs a backend from a template.
pub type BackendFactory = fn(SandboxTemplate) -> Result<Box<dyn SandboxBackend>, SandboxError>;

/// Cheap availability probe, interrogated by the "auto" resolver.
pub type AvailabilityProbe = fn() -> bool;

struct Registration {
    factory: BackendFactory,
    available: AvailabilityProbe,
}

/// Probe order for `backend = "auto"`: strongest isolation first, subprocess
/// as the always-available floor.
const AUTO_PREFERENCE: [&str; 3] = ["microvm", "docker", "subprocess"];

#[derive(Default)]
pub struct BackendRegistry {
    backends: HashMap<String, Registration>,
}

impl BackendRegistry {
    fn register(&mut self, name: &str, factory: BackendFactory, available: AvailabilityProbe) {
        self.backends
            .insert(name.to_string(), Registration { factory, available });
    }
}

lazy_static! {
    static ref REGISTRY: RwLock<BackendRegistry> = {
        let mut registry = BackendRegistry::default();
        registry.register(
            "subprocess",
            |template| Ok(Box::new(SubprocessSandbox::from_template(template))),
            || true,
        );
        registry.register(
            "docker",
            |template| {
                DockerSandbox::from_template(template)
                    .map(|b| Box::new(b) as Box<dyn SandboxBackend>)
            },
            || which::which("docker").is_ok(),
        );
        registry.register(
            "microvm",
            |template| Ok(Box::new(MicroVmSandbox::from_template(template))),
            || std::env::var("MSB_SERVER_URL").is_ok(),
        );
        RwLock::new(registry)
    };
}

/// Register an additional backend under `name`, replacing any previous
/// registration.
pub fn register_backend(name: &str, factory: BackendFactory, available: AvailabilityProbe) {
    REGISTRY
        .write()
        .expect("backend registry poisoned")
        .register(name, factory, available);
}

/// True if `name` is registered and its availability probe passes.
pub fn backend_available(name: &str) -> bool {
    let registry = REGISTRY.read().expect("backend registry poisoned");
    registry
        .backends
        .get(name)
        .map(|r| (r.available)())
        .unwrap_or(false)
}

/// Resolve "auto" to the first available backend in preference order.
pub fn resolve_backend(name: &str) -> Result<String, SandboxError> {
    if name != "auto" {
        let registry = REGISTRY.read().expect("backend registry poisoned");
        if registry.backends.contains_key(name) {
            return Ok(name.to_string());
        }
        return Err(SandboxError::backend(name, "not registered"));
    }
    for candidate in AUTO_PREFERENCE {
        if backend_available(candidate) {
            return Ok(candidate.to_string());
        }
    }
    Err(SandboxError::backend("auto", "no backend available"))
}

/// Construct a backend by registered name ("auto" resolves first).
pub fn create_backend(
    name: &str,
    template: SandboxTemplate,
) -> Result<Box<dyn SandboxBackend>, SandboxError> {
    let resolved = resolve_backend(name)?;
    let factory = {
        let registry = REGISTRY.read().expect("backend registry poisoned");
        registry
            .backends
            .get(&resolved)
            .map(|r| r.factory)
            .ok_or_else(|| SandboxError::backend(&resolved, "not registered"))?
    };
    factory(template)
}
