//! Docker backend - container-level isolation via Engine API or CLI
//!
//! Two transports behind one backend:
//! - SDK: bollard against the local Docker socket (preferred)
//! - CLI: shelling out to `docker` on PATH
//!
//! The transport is probed once at construction and never exposed to callers.

use async_trait::async_trait;
use base64::Engine as _;
use bollard::container::{
    Config, CreateContainerOptions, LogOutput, RemoveContainerOptions, StartContainerOptions,
    StopContainerOptions,
};
use bollard::exec::{CreateExecOptions, StartExecResults};
use bollard::image::CreateImageOptions;
use bollard::Docker;
use futures_util::StreamExt;
use std::process::Stdio;
use std::sync::RwLock;
use std::time::{Duration, Instant};
use tokio::process::Command;
use uuid::Uuid;

use super::SandboxBackend;
use crate::template::SandboxTemplate;
use crate::types::{
    CodeLanguage, ExecutionResult, FileInfo, HealthStatus, ProcessInfo, SandboxError,
    SandboxStatus,
};

const DEFAULT_IMAGE: &str = "python:3.11-slim";
const DEFAULT_WORKDIR: &str = "/workspace";
const CONTAINER_NAME_PREFIX: &str = "agenticx_sandbox_";
const SANDBOX_ID_ENV: &str = "AGENTICX_SANDBOX_ID";
const STOP_GRACE_SECS: i64 = 10;

/// Docker backend configuration
#[derive(Debug, Clone)]
pub struct DockerConfig {
    /// Docker socket path (None = bollard defaults)
    pub socket_path: Option<String>,
    /// Container image
    pub image: String,
    /// Network mode override; otherwise derived from the template
    pub network_mode: Option<String>,
    /// Remove the container on stop
    pub auto_remove: bool,
}

impl Default for DockerConfig {
    fn default() -> Self {
        Self {
            socket_path: None,
            image: DEFAULT_IMAGE.to_string(),
            network_mode: None,
            auto_remove: true,
        }
    }
}

enum Transport {
    Sdk(Docker),
    Cli,
}

/// Docker backend implementation
pub struct DockerSandbox {
    sandbox_id: String,
    template: SandboxTemplate,
    config: DockerConfig,
    status: RwLock<SandboxStatus>,
    container_name: String,
    container_id: RwLock<Option<String>>,
    transport: Transport,
}

impl DockerSandbox {
    pub fn from_template(template: SandboxTemplate) -> Result<Self, SandboxError> {
        Self::with_config(template, DockerConfig::default())
    }

    pub fn with_config(
        template: SandboxTemplate,
        config: DockerConfig,
    ) -> Result<Self, SandboxError> {
        if which::which("docker").is_err() {
            return Err(SandboxError::backend(
                "docker",
                "Docker CLI not found on PATH",
            ));
        }

        // Probe the SDK socket once; fall back to the CLI on any failure.
        let transport = match &config.socket_path {
            Some(path) => Docker::connect_with_socket(path, 120, bollard::API_DEFAULT_VERSION)
                .map(Transport::Sdk)
                .unwrap_or(Transport::Cli),
            None => Docker::connect_with_socket_defaults()
                .map(Transport::Sdk)
                .unwrap_or(Transport::Cli),
        };

        let sandbox_id = Uuid::new_v4().to_string()[..8].to_string();
        let container_name = format!("{CONTAINER_NAME_PREFIX}{sandbox_id}");
        Ok(Self {
            sandbox_id,
            template,
            config,
            status: RwLock::new(SandboxStatus::Pending),
            container_name,
            container_id: RwLock::new(None),
            transport,
        })
    }

    pub fn container_name(&self) -> &str {
        &self.container_name
    }

    pub fn container_id(&self) -> Option<String> {
        self.container_id.read().expect("container id lock").clone()
    }

    fn set_status(&self, status: SandboxStatus) {
        *self.status.write().expect("status lock poisoned") = status;
    }

    fn set_container_id(&self, id: Option<String>) {
        *self.container_id.write().expect("container id lock") = id;
    }

    fn ensure_running(&self) -> Result<String, SandboxError> {
        if self.status() != SandboxStatus::Running {
            return Err(SandboxError::not_ready(format!(
                "Docker sandbox {} is not running (status: {})",
                self.sandbox_id,
                self.status()
            )));
        }
        self.container_id()
            .ok_or_else(|| SandboxError::not_ready("No container attached".to_string()))
    }

    fn working_dir(&self) -> String {
        self.template
            .working_dir
            .clone()
            .unwrap_or_else(|| DEFAULT_WORKDIR.to_string())
    }

    fn network_mode(&self) -> String {
        self.config.network_mode.clone().unwrap_or_else(|| {
            if self.template.network_enabled {
                "bridge".to_string()
            } else {
                "none".to_string()
            }
        })
    }

    fn container_env(&self) -> Vec<String> {
        let mut env: Vec<String> = self
            .template
            .environment
            .iter()
            .map(|(k, v)| format!("{k}={v}"))
            .collect();
        env.push(format!("{SANDBOX_ID_ENV}={}", self.sandbox_id));
        env
    }

    async fn ensure_image(&self, docker: &Docker) -> Result<(), SandboxError> {
        if docker.inspect_image(&self.config.image).await.is_ok() {
            return Ok(());
        }
        let options = CreateImageOptions {
            from_image: self.config.image.as_str(),
            ..Default::default()
        };
        let mut stream = docker.create_image(Some(options), None, None);
        while let Some(result) = stream.next().await {
            match result {
                Ok(info) => {
                    if let Some(status) = info.status {
                        tracing::debug!("Pull {}: {}", self.config.image, status);
                    }
                }
                Err(e) => {
                    return Err(SandboxError::backend(
                        "docker",
                        format!("Failed to pull image {}: {e}", self.config.image),
                    ));
                }
            }
        }
        Ok(())
    }

    async fn start_with_sdk(&self, docker: &Docker) -> Result<String, SandboxError> {
        self.ensure_image(docker).await?;

        let host_config = bollard::service::HostConfig {
            memory: Some((self.template.memory_mb * 1024 * 1024) as i64),
            nano_cpus: Some((self.template.cpu * 1e9) as i64),
            network_mode: Some(self.network_mode()),
            auto_remove: Some(self.config.auto_remove),
            ..Default::default()
        };
        let config = Config {
            image: Some(self.config.image.clone()),
            tty: Some(true),
            open_stdin: Some(true),
            working_dir: Some(self.working_dir()),
            env: Some(self.container_env()),
            cmd: Some(vec![
                "tail".to_string(),
                "-f".to_string(),
                "/dev/null".to_string(),
            ]),
            host_config: Some(host_config),
            ..Default::default()
        };

        let create_options = CreateContainerOptions {
            name: self.container_name.clone(),
            ..Default::default()
        };
        let response = docker
            .create_container(Some(create_options), config)
            .await
            .map_err(|e| SandboxError::backend("docker", format!("Create container: {e}")))?;

        docker
            .start_container(&response.id, None::<StartContainerOptions<String>>)
            .await
            .map_err(|e| SandboxError::backend("docker", format!("Start container: {e}")))?;

        Ok(response.id[..12.min(response.id.len())].to_string())
    }

    async fn start_with_cli(&self) -> Result<String, SandboxError> {
        let mut cmd = Command::new("docker");
        cmd.args(["run", "-d", "-t", "-i", "--name"])
            .arg(&self.container_name)
            .arg("-w")
            .arg(self.working_dir())
            .arg("--network")
            .arg(self.network_mode())
            .arg("--memory")
            .arg(format!("{}m", self.template.memory_mb))
            .arg("--cpus")
            .arg(self.template.cpu.to_string());
        for pair in self.container_env() {
            cmd.arg("-e").arg(pair);
        }
        if self.config.auto_remove {
            cmd.arg("--rm");
        }
        cmd.arg(&self.config.image)
            .args(["tail", "-f", "/dev/null"]);

        let output = cmd
            .output()
            .await
            .map_err(|e| SandboxError::backend("docker", format!("docker run: {e}")))?;
        if !output.status.success() {
            return Err(SandboxError::backend(
                "docker",
                format!("docker run failed: {}", String::from_utf8_lossy(&output.stderr)),
            ));
        }
        let id = String::from_utf8_lossy(&output.stdout).trim().to_string();
        Ok(id[..12.min(id.len())].to_string())
    }

    /// Run `sh -c <command>` inside the container under the working dir.
    async fn docker_exec(
        &self,
        command: &str,
        timeout_secs: u64,
        language: CodeLanguage,
    ) -> Result<ExecutionResult, SandboxError> {
        let container_id = self.ensure_running()?;
        let start = Instant::now();

        let (stdout, stderr, exit_code) = match &self.transport {
            Transport::Sdk(docker) => {
                self.exec_with_sdk(docker, &container_id, command, timeout_secs)
                    .await?
            }
            Transport::Cli => {
                self.exec_with_cli(&container_id, command, timeout_secs)
                    .await?
            }
        };

        let duration_ms = start.elapsed().as_secs_f64() * 1000.0;
        Ok(ExecutionResult::new(stdout, stderr, exit_code)
            .with_language(language.to_string())
            .with_duration_ms(duration_ms))
    }

    async fn exec_with_sdk(
        &self,
        docker: &Docker,
        container_id: &str,
        command: &str,
        timeout_secs: u64,
    ) -> Result<(String, String, i32), SandboxError> {
        let exec = docker
            .create_exec(
                container_id,
                CreateExecOptions {
                    cmd: Some(vec!["sh".to_string(), "-c".to_string(), command.to_string()]),
                    attach_stdout: Some(true),
                    attach_stderr: Some(true),
                    working_dir: Some(self.working_dir()),
                    ..Default::default()
                },
            )
            .await
            .map_err(|e| SandboxError::backend("docker", format!("Create exec: {e}")))?;

        let mut stdout = String::new();
        let mut stderr = String::new();
        let started = docker
            .start_exec(&exec.id, None)
            .await
            .map_err(|e| SandboxError::backend("docker", format!("Start exec: {e}")))?;

        if let StartExecResults::Attached { mut output, .. } = started {
            let drain = async {
                while let Some(chunk) = output.next().await {
                    match chunk {
                        Ok(LogOutput::StdOut { message }) => {
                            stdout.push_str(&String::from_utf8_lossy(&message));
                        }
                        Ok(LogOutput::StdErr { message }) => {
                            stderr.push_str(&String::from_utf8_lossy(&message));
                        }
                        Ok(_) => {}
                        Err(e) => {
                            tracing::warn!("Exec stream error: {e}");
                            break;
                        }
                    }
                }
            };
            tokio::time::timeout(Duration::from_secs(timeout_secs), drain)
                .await
                .map_err(|_| SandboxError::timeout(timeout_secs))?;
        }

        let inspect = docker
            .inspect_exec(&exec.id)
            .await
            .map_err(|e| SandboxError::backend("docker", format!("Inspect exec: {e}")))?;
        let exit_code = inspect.exit_code.unwrap_or(0) as i32;
        Ok((stdout, stderr, exit_code))
    }

    async fn exec_with_cli(
        &self,
        container_id: &str,
        command: &str,
        timeout_secs: u64,
    ) -> Result<(String, String, i32), SandboxError> {
        let mut cmd = Command::new("docker");
        cmd.arg("exec")
            .arg("-w")
            .arg(self.working_dir())
            .args([container_id, "sh", "-c", command])
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        let child = cmd
            .spawn()
            .map_err(|e| SandboxError::backend("docker", format!("docker exec: {e}")))?;

        let output =
            match tokio::time::timeout(Duration::from_secs(timeout_secs), child.wait_with_output())
                .await
            {
                Ok(Ok(output)) => output,
                Ok(Err(e)) => {
                    return Err(SandboxError::backend("docker", format!("docker exec: {e}")))
                }
                Err(_) => return Err(SandboxError::timeout(timeout_secs)),
            };

        Ok((
            String::from_utf8_lossy(&output.stdout).to_string(),
            String::from_utf8_lossy(&output.stderr).to_string(),
            output.status.code().unwrap_or(-1),
        ))
    }

    async fn stop_container(&self) {
        let Some(container_id) = self.container_id() else {
            return;
        };
        match &self.transport {
            Transport::Sdk(docker) => {
                if let Err(e) = docker
                    .stop_container(&container_id, Some(StopContainerOptions { t: STOP_GRACE_SECS }))
                    .await
                {
                    tracing::warn!("Error stopping container {container_id}: {e}");
                }
                if !self.config.auto_remove {
                    let options = RemoveContainerOptions {
                        force: true,
                        ..Default::default()
                    };
                    if let Err(e) = docker.remove_container(&container_id, Some(options)).await {
                        tracing::warn!("Error removing container {container_id}: {e}");
                    }
                }
            }
            Transport::Cli => {
                let _ = Command::new("docker")
                    .args(["stop", "-t"])
                    .arg(STOP_GRACE_SECS.to_string())
                    .arg(&container_id)
                    .output()
                    .await;
                if !self.config.auto_remove {
                    let _ = Command::new("docker")
                        .args(["rm", "-f"])
                        .arg(&container_id)
                        .output()
                        .await;
                }
            }
        }
    }
}

#[async_trait]
impl SandboxBackend for DockerSandbox {
    fn name(&self) -> &'static str {
        "docker"
    }

    fn sandbox_id(&self) -> &str {
        &self.sandbox_id
    }

    fn status(&self) -> SandboxStatus {
        *self.status.read().expect("status lock poisoned")
    }

    async fn start(&mut self) -> Result<(), SandboxError> {
        if self.status() == SandboxStatus::Running {
            tracing::debug!("Docker sandbox {} is already running", self.sandbox_id);
            return Ok(());
        }

        self.set_status(SandboxStatus::Creating);
        tracing::info!(
            "Starting Docker sandbox {} with image {}",
            self.sandbox_id,
            self.config.image
        );

        let startup = Duration::from_secs(self.template.startup_timeout_seconds);
        let started = match &self.transport {
            Transport::Sdk(docker) => {
                tokio::time::timeout(startup, self.start_with_sdk(docker)).await
            }
            Transport::Cli => tokio::time::timeout(startup, self.start_with_cli()).await,
        };

        let result = match started {
            Ok(inner) => inner,
            Err(_) => Err(SandboxError::backend(
                "docker",
                format!(
                    "Container not acquired within startup timeout ({}s)",
                    self.template.startup_timeout_seconds
                ),
            )),
        };

        match result {
            Ok(container_id) => {
                self.set_container_id(Some(container_id.clone()));
                self.set_status(SandboxStatus::Running);
                tracing::info!(
                    "Docker sandbox {} started (container: {container_id})",
                    self.sandbox_id
                );
                Ok(())
            }
            Err(e) => {
                self.set_status(SandboxStatus::Error);
                // A container may exist even when start failed partway.
                self.set_container_id(Some(self.container_name.clone()));
                self.stop_container().await;
                self.set_container_id(None);
                tracing::error!("Failed to start Docker sandbox {}: {e}", self.sandbox_id);
                Err(e)
            }
        }
    }

    async fn stop(&mut self) {
        if self.status() == SandboxStatus::Stopped {
            return;
        }
        self.set_status(SandboxStatus::Stopping);
        tracing::info!("Stopping Docker sandbox {}", self.sandbox_id);

        self.stop_container().await;
        self.set_container_id(None);
        self.set_status(SandboxStatus::Stopped);
        tracing::info!("Docker sandbox {} stopped", self.sandbox_id);
    }

    async fn execute(
        &self,
        code: &str,
        language: CodeLanguage,
        timeout: Option<u64>,
    ) -> Result<ExecutionResult, SandboxError> {
        let timeout_secs = timeout.unwrap_or(self.template.timeout_seconds);
        match language {
            CodeLanguage::Python => {
                // base64 round-trip sidesteps shell quoting of the code body
                let encoded = base64::engine::general_purpose::STANDARD.encode(code.as_bytes());
                let command = format!(
                    "python3 -c \"import base64; exec(base64.b64decode('{encoded}').decode())\""
                );
                self.docker_exec(&command, timeout_secs, language).await
            }
            CodeLanguage::Shell | CodeLanguage::Bash => {
                self.docker_exec(code, timeout_secs, language).await
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
                    "Docker sandbox is healthy",
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
        let result = self
            .execute(&format!("cat '{path}'"), CodeLanguage::Shell, None)
            .await?;
        if !result.success {
            return Err(SandboxError::file_not_found(path));
        }
        Ok(result.stdout)
    }

    async fn write_file(&self, path: &str, content: &str) -> Result<(), SandboxError> {
        let encoded = base64::engine::general_purpose::STANDARD.encode(content.as_bytes());
        let command = format!("echo '{encoded}' | base64 -d > '{path}'");
        let result = self.execute(&command, CodeLanguage::Shell, None).await?;
        if !result.success {
            return Err(SandboxError::execution(
                format!("Failed to write {path}"),
                result.exit_code,
                result.stderr,
            ));
        }
        Ok(())
    }

    async fn delete_file(&self, path: &str) -> Result<(), SandboxError> {
        self.execute(&format!("rm -rf '{path}'"), CodeLanguage::Shell, None)
            .await?;
        Ok(())
    }

    async fn list_directory(&self, path: &str) -> Result<Vec<FileInfo>, SandboxError> {
        let result = self
            .execute(
                &format!("ls -la '{path}' | tail -n +2"),
                CodeLanguage::Shell,
                None,
            )
            .await?;
        if !result.success {
            return Err(SandboxError::file_not_found(path));
        }

        let mut files = Vec::new();
        for line in result.stdout.lines() {
            let parts: Vec<&str> = line.split_whitespace().collect();
            if parts.len() < 9 {
                continue;
            }
            let is_dir = parts[0].starts_with('d');
            let name = parts[8..].join(" ");
            let size = parts[4].parse::<u64>().unwrap_or(0);
            files.push(FileInfo {
                path: format!("{}/{name}", path.trim_end_matches('/')),
                size,
                is_dir,
                permissions: parts[0].to_string(),
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
        // --no-headers is missing from busybox ps; fall back to tail
        let result = self
            .execute(
                "ps aux --no-headers 2>/dev/null || ps aux | tail -n +2",
                CodeLanguage::Shell,
                Some(10),
            )
            .await?;

        let mut processes = Vec::new();
        for line in result.stdout.lines() {
            let parts: Vec<&str> = line.split_whitespace().collect();
            if parts.len() < 11 {
                continue;
            }
            let (Ok(pid), Ok(cpu), Ok(mem)) = (
                parts[1].parse::<u32>(),
                parts[2].parse::<f64>(),
                parts[3].parse::<f64>(),
            ) else {
                continue;
            };
            processes.push(ProcessInfo {
                pid,
                command: parts[10..].join(" "),
                status: "running".to_string(),
                cpu_percent: cpu,
                memory_mb: mem,
            });
        }
        Ok(processes)
    }

    async fn kill_process(&self, pid: u32, signal: i32) -> Result<(), SandboxError> {
        let result = self
            .execute(&format!("kill -{signal} {pid}"), CodeLanguage::Shell, None)
            .await?;
        if !result.success {
            tracing::warn!("Failed to kill process {pid}: {}", result.stderr);
        }
        Ok(())
    }
}
