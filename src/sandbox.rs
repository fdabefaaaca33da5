//! Per-user sandbox containers on top of the Docker HTTP API.
//!
//! `DockerManager` owns container naming, host volume layout, and the
//! per-tier resource/network policy. It keeps no container state of its own:
//! every query goes to the engine, and enumeration always filters by the
//! bridge's `app` label so other containers on the host are never touched.
//!
//! `SandboxEngine` is the seam the executor and router see; tests substitute
//! a mock for it.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{anyhow, Context};
use async_trait::async_trait;
use bollard::container::{
    Config as ContainerConfig, CreateContainerOptions, InspectContainerOptions,
    ListContainersOptions, LogOutput, RemoveContainerOptions, StartContainerOptions, Stats,
    StatsOptions, StopContainerOptions,
};
use bollard::exec::{CreateExecOptions, StartExecResults};
use bollard::image::BuildImageOptions;
use bollard::models::{ContainerStateStatusEnum, HostConfig, RestartPolicy, RestartPolicyNameEnum};
use bollard::network::{CreateNetworkOptions, InspectNetworkOptions};
use bollard::Docker;
use futures_util::StreamExt;
use tokio::fs;
use tracing::{debug, info, warn};

use crate::config::{cpus_to_nanocpus, parse_memory, Config};
use crate::errors::{BridgeError, Result};
use crate::store::Permission;
use crate::util::sanitize_wxid;

/// Label value identifying this bridge's containers.
pub const APP_LABEL: &str = "claude-bridge";

/// Grace period for container stop, seconds.
const STOP_TIMEOUT_SECS: i64 = 10;

/// Bound on arbitrary admin-grade exec commands, seconds.
const EXEC_COMMAND_TIMEOUT_SECS: u64 = 30;

/// Bound on sandbox image builds, seconds.
const BUILD_TIMEOUT_SECS: u64 = 300;

/// Resolved sandbox configuration: byte/nano-CPU limits instead of the raw
/// config strings.
#[derive(Debug, Clone)]
pub struct SandboxConfig {
    pub image: String,
    pub container_prefix: String,
    pub data_dir: PathBuf,
    pub claude_cli: String,
    pub limits: SandboxLimits,
    pub network: NetworkNames,
}

#[derive(Debug, Clone)]
pub struct SandboxLimits {
    pub memory: i64,
    pub admin_memory: i64,
    pub nano_cpus: i64,
    pub admin_nano_cpus: i64,
    pub pids: i64,
    pub tmp_size: String,
}

#[derive(Debug, Clone)]
pub struct NetworkNames {
    pub admin: String,
    pub trusted: String,
    pub normal: String,
}

impl SandboxConfig {
    /// Resolve the raw config into concrete limits. Bad memory strings are
    /// configuration errors and abort startup.
    pub fn from_config(cfg: &Config) -> Result<Self> {
        Ok(Self {
            image: cfg.docker.image.clone(),
            container_prefix: cfg.docker.container_prefix.clone(),
            data_dir: cfg.docker.expanded_data_dir(),
            claude_cli: cfg.claude.cli_path.clone(),
            limits: SandboxLimits {
                memory: parse_memory(&cfg.docker.limits.memory)?,
                admin_memory: parse_memory(&cfg.docker.limits.admin_memory)?,
                nano_cpus: cpus_to_nanocpus(cfg.docker.limits.cpus),
                admin_nano_cpus: cpus_to_nanocpus(cfg.docker.limits.admin_cpus),
                pids: cfg.docker.limits.pids as i64,
                tmp_size: cfg.docker.limits.tmp_size.clone(),
            },
            network: NetworkNames {
                admin: cfg.docker.network.admin.clone(),
                trusted: cfg.docker.network.trusted.clone(),
                normal: cfg.docker.network.normal.clone(),
            },
        })
    }

    fn memory_for(&self, permission: Permission) -> i64 {
        match permission {
            Permission::Admin => self.limits.admin_memory,
            _ => self.limits.memory,
        }
    }

    fn nano_cpus_for(&self, permission: Permission) -> i64 {
        match permission {
            Permission::Admin => self.limits.admin_nano_cpus,
            _ => self.limits.nano_cpus,
        }
    }

    fn network_for(&self, permission: Permission) -> &str {
        match permission {
            Permission::Admin => &self.network.admin,
            Permission::Trusted => &self.network.trusted,
            _ => &self.network.normal,
        }
    }
}

/// Options for one Claude invocation.
#[derive(Debug, Clone)]
pub struct ExecOptions {
    pub timeout_s: u64,
    pub claude_session: Option<String>,
    pub permission: Permission,
}

/// Captured output of one Claude invocation.
#[derive(Debug)]
pub struct ExecOutput {
    pub stdout: String,
    pub stderr: String,
}

/// Container info returned by `list_containers`.
#[derive(Debug, Clone)]
pub struct ContainerInfo {
    pub name: String,
    pub status: String,
    pub wxid: Option<String>,
    pub permission: Option<String>,
}

/// Single-shot container stats sample.
#[derive(Debug, Clone)]
pub struct ContainerStats {
    pub cpu_percent: f64,
    pub memory_usage: u64,
    pub memory_limit: u64,
    pub pids: u64,
}

/// The engine surface the executor and router depend on. The production
/// implementation is `DockerManager`; tests use a recording mock.
#[async_trait]
pub trait SandboxEngine: Send + Sync {
    fn container_name(&self, wxid: &str) -> String;

    async fn ensure_container(&self, wxid: &str, permission: Permission) -> Result<String>;

    async fn exec_claude(
        &self,
        wxid: &str,
        system_prompt: &str,
        message: &str,
        options: ExecOptions,
    ) -> Result<ExecOutput>;

    async fn exec_command(&self, wxid: &str, command: &str, as_root: bool) -> Result<String>;

    async fn is_running(&self, name: &str) -> bool;

    async fn stats(&self, wxid: &str) -> Result<Option<ContainerStats>>;

    async fn disk_usage(&self, wxid: &str) -> Result<String>;

    async fn stop_container(&self, wxid: &str) -> Result<bool>;

    async fn destroy_container(&self, wxid: &str) -> Result<bool>;

    async fn rebuild(&self, wxid: &str, permission: Permission) -> Result<()>;

    async fn list_containers(&self) -> Result<Vec<ContainerInfo>>;

    async fn stop_all(&self) -> Result<usize>;

    async fn kill_claude(&self, wxid: &str) -> Result<bool>;
}

/// Docker-backed sandbox manager.
pub struct DockerManager {
    docker: Docker,
    config: SandboxConfig,
}

impl DockerManager {
    /// Connect to the local Docker daemon and prepare the data root.
    pub async fn new(config: SandboxConfig) -> Result<Self> {
        let docker = Docker::connect_with_local_defaults()
            .map_err(|e| BridgeError::EngineUnavailable(e.to_string()))?;

        fs::create_dir_all(&config.data_dir)
            .await
            .map_err(|e| {
                BridgeError::Other(anyhow!(
                    "cannot create data dir {:?}: {}",
                    config.data_dir,
                    e
                ))
            })?;

        Ok(Self { docker, config })
    }

    /// Docker-safe container name for a wxid.
    pub fn container_name(&self, wxid: &str) -> String {
        format!("{}{}", self.config.container_prefix, sanitize_wxid(wxid))
    }

    /// Per-user host directory, created on demand.
    async fn user_data_dir(&self, wxid: &str) -> Result<PathBuf> {
        let dir = self.config.data_dir.join(wxid);
        fs::create_dir_all(&dir)
            .await
            .map_err(|e| BridgeError::Other(anyhow!("cannot create user dir {:?}: {}", dir, e)))?;
        Ok(dir)
    }

    // ---- lifecycle ----

    /// Ensure the user's container exists and is running. Idempotent.
    pub async fn ensure_container(&self, wxid: &str, permission: Permission) -> Result<String> {
        let name = self.container_name(wxid);

        if !self.container_exists(&name).await {
            self.create_container(wxid, permission).await?;
            info!("Created container {}", name);
        }

        if !self.is_running(&name).await {
            self.start_container(&name).await?;
            info!("Started container {}", name);
        }

        Ok(name)
    }

    /// Create the user's container with the tier's resource and network
    /// policy, then start it and fix volume ownership.
    async fn create_container(&self, wxid: &str, permission: Permission) -> Result<()> {
        let name = self.container_name(wxid);
        let data_dir = self.user_data_dir(wxid).await?;

        // The engine bind-mounts these; create them first so they exist with
        // a known layout.
        for sub in ["workspace", "claude-config"] {
            fs::create_dir_all(data_dir.join(sub)).await.ok();
        }

        let workspace_bind = format!(
            "{}:/home/sandbox/workspace",
            data_dir.join("workspace").display()
        );
        let claude_config_bind = format!(
            "{}:/home/sandbox/.claude",
            data_dir.join("claude-config").display()
        );

        let host_config = HostConfig {
            memory: Some(self.config.memory_for(permission)),
            nano_cpus: Some(self.config.nano_cpus_for(permission)),
            pids_limit: Some(self.config.limits.pids),
            tmpfs: Some(HashMap::from([(
                "/tmp".to_string(),
                format!("size={}", self.config.limits.tmp_size),
            )])),
            readonly_rootfs: Some(true),
            security_opt: Some(vec!["no-new-privileges".to_string()]),
            cap_drop: Some(vec!["ALL".to_string()]),
            network_mode: Some(self.config.network_for(permission).to_string()),
            binds: Some(vec![workspace_bind, claude_config_bind]),
            restart_policy: Some(RestartPolicy {
                name: Some(RestartPolicyNameEnum::UNLESS_STOPPED),
                maximum_retry_count: None,
            }),
            ..Default::default()
        };

        let labels = HashMap::from([
            ("app".to_string(), APP_LABEL.to_string()),
            ("wxid".to_string(), wxid.to_string()),
            ("permission".to_string(), permission.as_str().to_string()),
        ]);

        let mut env = vec![format!("WXID={}", wxid)];
        env.extend(forwarded_auth_env());

        let container_config = ContainerConfig {
            image: Some(self.config.image.clone()),
            // Keep the container alive so later execs can attach.
            cmd: Some(
                ["tail", "-f", "/dev/null"]
                    .iter()
                    .map(|s| s.to_string())
                    .collect(),
            ),
            env: Some(env),
            labels: Some(labels),
            host_config: Some(host_config),
            ..Default::default()
        };

        self.docker
            .create_container(
                Some(CreateContainerOptions {
                    name: name.as_str(),
                    platform: None,
                }),
                container_config,
            )
            .await
            .map_err(|e| {
                BridgeError::ContainerOperationFailed(format!("create {}: {}", name, e))
            })?;

        // fix_permissions execs into the container, so it must be up first.
        self.start_container(&name).await?;

        // Host-created mount points may be owned by root. The fix-up can race
        // with container startup, so retry once after a short delay.
        if !self.fix_permissions(wxid).await {
            tokio::time::sleep(Duration::from_millis(500)).await;
            self.fix_permissions(wxid).await;
        }

        Ok(())
    }

    /// chown the two mount points to the sandbox user. Non-fatal.
    async fn fix_permissions(&self, wxid: &str) -> bool {
        let name = self.container_name(wxid);
        match self
            .exec_in_container(
                &name,
                vec![
                    "chown",
                    "-R",
                    "sandbox:sandbox",
                    "/home/sandbox/workspace",
                    "/home/sandbox/.claude",
                ],
                true,
                None,
            )
            .await
        {
            Ok(_) => true,
            Err(e) => {
                debug!("fix_permissions for {} failed (container may not be ready): {}", name, e);
                false
            }
        }
    }

    async fn container_exists(&self, name: &str) -> bool {
        self.docker
            .inspect_container(name, None::<InspectContainerOptions>)
            .await
            .is_ok()
    }

    pub async fn is_running(&self, name: &str) -> bool {
        match self
            .docker
            .inspect_container(name, None::<InspectContainerOptions>)
            .await
        {
            Ok(info) => info
                .state
                .and_then(|s| s.status)
                .map(|s| s == ContainerStateStatusEnum::RUNNING)
                .unwrap_or(false),
            Err(_) => false,
        }
    }

    pub async fn start_container(&self, name: &str) -> Result<()> {
        self.docker
            .start_container(name, None::<StartContainerOptions<String>>)
            .await
            .map_err(|e| BridgeError::ContainerOperationFailed(format!("start {}: {}", name, e)))
    }

    /// Graceful stop. Returns false (without failing) if the engine refuses.
    pub async fn stop_container(&self, wxid: &str) -> Result<bool> {
        let name = self.container_name(wxid);
        match self
            .docker
            .stop_container(&name, Some(StopContainerOptions { t: STOP_TIMEOUT_SECS }))
            .await
        {
            Ok(_) => {
                info!("Stopped container {}", name);
                Ok(true)
            }
            Err(e) => {
                warn!("Failed to stop container {}: {}", name, e);
                Ok(false)
            }
        }
    }

    /// Force-remove. Data survives: volumes are host bind-mounts. Removing a
    /// container that does not exist succeeds silently.
    pub async fn destroy_container(&self, wxid: &str) -> Result<bool> {
        let name = self.container_name(wxid);
        match self
            .docker
            .remove_container(
                &name,
                Some(RemoveContainerOptions {
                    force: true,
                    ..Default::default()
                }),
            )
            .await
        {
            Ok(_) => {
                info!("Destroyed container {}", name);
                Ok(true)
            }
            Err(e) => {
                debug!("Destroy of {} was a no-op: {}", name, e);
                Ok(false)
            }
        }
    }

    pub async fn rebuild(&self, wxid: &str, permission: Permission) -> Result<()> {
        self.destroy_container(wxid).await?;
        self.ensure_container(wxid, permission).await?;
        info!("Rebuilt container {}", self.container_name(wxid));
        Ok(())
    }

    // ---- exec ----

    /// Run the Claude CLI inside the user's container and capture output.
    ///
    /// Timeout expiry sends the in-container Claude a TERM, escalating to
    /// KILL if it lingers, and surfaces as `ExecTimeout`.
    pub async fn exec_claude(
        &self,
        wxid: &str,
        system_prompt: &str,
        message: &str,
        options: ExecOptions,
    ) -> Result<ExecOutput> {
        let name = self.container_name(wxid);
        let cmd = build_claude_command(&self.config.claude_cli, system_prompt, message, &options);
        let cmd_refs: Vec<&str> = cmd.iter().map(|s| s.as_str()).collect();
        let timeout_s = options.timeout_s;

        let env = forwarded_auth_env();
        let env_refs: Vec<&str> = env.iter().map(|s| s.as_str()).collect();

        let exec_opts = CreateExecOptions {
            cmd: Some(cmd_refs),
            attach_stdout: Some(true),
            attach_stderr: Some(true),
            user: Some("sandbox"),
            working_dir: Some("/home/sandbox/workspace"),
            env: if env_refs.is_empty() {
                None
            } else {
                Some(env_refs)
            },
            ..Default::default()
        };

        let exec = self
            .docker
            .create_exec(&name, exec_opts)
            .await
            .map_err(|e| BridgeError::ExecFailed(format!("create exec in {}: {}", name, e)))?;

        let result = tokio::time::timeout(
            Duration::from_secs(timeout_s),
            self.collect_exec_output(&exec.id),
        )
        .await;

        match result {
            Ok(Ok((stdout, stderr))) => Ok(ExecOutput { stdout, stderr }),
            Ok(Err(e)) => Err(BridgeError::ExecFailed(format!("exec in {}: {}", name, e))),
            Err(_) => {
                warn!("Claude exec in {} timed out after {}s", name, timeout_s);
                // Terminate the stray CLI in the background so the caller's
                // reply is not held up by the TERM->KILL grace period.
                let docker = self.docker.clone();
                let container = name.clone();
                let cli = self.config.claude_cli.clone();
                tokio::spawn(async move {
                    terminate_process(&docker, &container, &cli).await;
                });
                Err(BridgeError::ExecTimeout { seconds: timeout_s })
            }
        }
    }

    /// Run an arbitrary short shell command in the user's container.
    pub async fn exec_command(&self, wxid: &str, command: &str, as_root: bool) -> Result<String> {
        let name = self.container_name(wxid);
        self.exec_in_container(
            &name,
            vec!["sh", "-c", command],
            as_root,
            Some(EXEC_COMMAND_TIMEOUT_SECS),
        )
        .await
    }

    async fn exec_in_container(
        &self,
        container_name: &str,
        cmd: Vec<&str>,
        as_root: bool,
        timeout_s: Option<u64>,
    ) -> Result<String> {
        let user = if as_root { "root" } else { "sandbox" };

        let exec_opts = CreateExecOptions {
            cmd: Some(cmd),
            attach_stdout: Some(true),
            attach_stderr: Some(true),
            user: Some(user),
            ..Default::default()
        };

        let exec = self
            .docker
            .create_exec(container_name, exec_opts)
            .await
            .map_err(|e| {
                BridgeError::ContainerOperationFailed(format!(
                    "create exec in {}: {}",
                    container_name, e
                ))
            })?;

        let collect = self.collect_exec_output(&exec.id);
        let (stdout, stderr) = match timeout_s {
            Some(secs) => tokio::time::timeout(Duration::from_secs(secs), collect)
                .await
                .map_err(|_| BridgeError::ExecTimeout { seconds: secs })?
                .map_err(BridgeError::Other)?,
            None => collect.await.map_err(BridgeError::Other)?,
        };

        if !stderr.is_empty() {
            debug!("exec stderr in {}: {}", container_name, stderr);
        }

        Ok(stdout.trim().to_string())
    }

    async fn collect_exec_output(&self, exec_id: &str) -> anyhow::Result<(String, String)> {
        let started = self
            .docker
            .start_exec(exec_id, None)
            .await
            .context("failed to start exec")?;

        let mut stdout = String::new();
        let mut stderr = String::new();

        if let StartExecResults::Attached { mut output, .. } = started {
            while let Some(chunk) = output.next().await {
                match chunk {
                    Ok(LogOutput::StdOut { message }) => {
                        stdout.push_str(&String::from_utf8_lossy(&message));
                    }
                    Ok(LogOutput::StdErr { message }) => {
                        stderr.push_str(&String::from_utf8_lossy(&message));
                    }
                    Ok(_) => {}
                    Err(e) => return Err(anyhow!("error reading exec output: {}", e)),
                }
            }
        }

        Ok((stdout, stderr))
    }

    /// TERM any in-container Claude process, escalating to KILL after the
    /// grace period. Used by the `/kill` command; the exec timeout path runs
    /// the same escalation in the background.
    pub async fn kill_claude(&self, wxid: &str) -> Result<bool> {
        let name = self.container_name(wxid);
        if !self.is_running(&name).await {
            return Ok(false);
        }
        terminate_process(&self.docker, &name, &self.config.claude_cli).await;
        Ok(true)
    }

    // ---- queries ----

    /// Single-shot stats sample for the user's container.
    pub async fn stats(&self, wxid: &str) -> Result<Option<ContainerStats>> {
        let name = self.container_name(wxid);

        let mut stream = self.docker.stats(
            &name,
            Some(StatsOptions {
                stream: false,
                one_shot: true,
            }),
        );

        if let Some(Ok(stats)) = stream.next().await {
            Ok(Some(ContainerStats {
                cpu_percent: calculate_cpu_percent(&stats),
                memory_usage: stats.memory_stats.usage.unwrap_or(0),
                memory_limit: stats.memory_stats.limit.unwrap_or(0),
                pids: stats.pids_stats.current.unwrap_or(0),
            }))
        } else {
            Ok(None)
        }
    }

    /// Workspace size as reported by `du -sh` inside the container.
    pub async fn disk_usage(&self, wxid: &str) -> Result<String> {
        self.exec_command(wxid, "du -sh /home/sandbox/workspace", false)
            .await
    }

    /// Every container carrying the bridge's app label, running or not.
    pub async fn list_containers(&self) -> Result<Vec<ContainerInfo>> {
        let filters = HashMap::from([(
            "label".to_string(),
            vec![format!("app={}", APP_LABEL)],
        )]);

        let containers = self
            .docker
            .list_containers(Some(ListContainersOptions {
                all: true,
                filters,
                ..Default::default()
            }))
            .await
            .map_err(|e| BridgeError::ContainerOperationFailed(format!("list: {}", e)))?;

        let mut result = Vec::new();
        for c in containers {
            let name = c
                .names
                .as_ref()
                .and_then(|n| n.first())
                .map(|n| n.trim_start_matches('/').to_string())
                .unwrap_or_default();
            let labels = c.labels.unwrap_or_default();
            result.push(ContainerInfo {
                name,
                status: c.status.unwrap_or_default(),
                wxid: labels.get("wxid").cloned(),
                permission: labels.get("permission").cloned(),
            });
        }

        Ok(result)
    }

    /// Stop every bridge container. Returns how many were asked to stop.
    pub async fn stop_all(&self) -> Result<usize> {
        let containers = self.list_containers().await?;
        let count = containers.len();
        for c in &containers {
            if let Some(ref wxid) = c.wxid {
                let _ = self.stop_container(wxid).await;
            }
        }
        info!("Stopped {} containers", count);
        Ok(count)
    }

    /// Remove stopped bridge containers left over from previous runs.
    pub async fn cleanup(&self) -> Result<usize> {
        let containers = self.list_containers().await?;
        let mut removed = 0;
        for c in &containers {
            if !c.status.to_lowercase().contains("up") {
                if let Some(ref wxid) = c.wxid {
                    if self.destroy_container(wxid).await? {
                        removed += 1;
                    }
                }
            }
        }
        if removed > 0 {
            info!("Pruned {} stopped containers", removed);
        }
        Ok(removed)
    }

    // ---- bootstrap ----

    /// Whether the engine answers at all.
    pub async fn health_check(&self) -> Result<bool> {
        match self.docker.version().await {
            Ok(version) => {
                info!(
                    "Docker version {}",
                    version.version.unwrap_or_else(|| "unknown".to_string())
                );
                Ok(true)
            }
            Err(e) => {
                warn!("Docker is not reachable: {}", e);
                Ok(false)
            }
        }
    }

    pub async fn image_exists(&self) -> bool {
        self.docker.inspect_image(&self.config.image).await.is_ok()
    }

    /// Build the sandbox image from a build-context directory containing
    /// `Dockerfile.sandbox`. Bounded to five minutes.
    pub async fn build_image(&self, docker_dir: &Path) -> Result<()> {
        info!("Building sandbox image {}", self.config.image);

        let dockerfile = docker_dir.join("Dockerfile.sandbox");
        if !dockerfile.exists() {
            return Err(BridgeError::ImageBuildFailed(format!(
                "Dockerfile not found at {:?}",
                dockerfile
            )));
        }

        let tar_bytes = create_build_context(docker_dir)
            .map_err(|e| BridgeError::ImageBuildFailed(e.to_string()))?;

        let build_options = BuildImageOptions {
            t: self.config.image.as_str(),
            dockerfile: "Dockerfile.sandbox",
            rm: true,
            ..Default::default()
        };

        let drain = async {
            let mut stream =
                self.docker
                    .build_image(build_options, None, Some(tar_bytes.into()));
            while let Some(result) = stream.next().await {
                match result {
                    Ok(output) => {
                        if let Some(line) = output.stream {
                            debug!("build: {}", line.trim());
                        }
                        if let Some(err) = output.error {
                            return Err(BridgeError::ImageBuildFailed(err));
                        }
                    }
                    Err(e) => return Err(BridgeError::ImageBuildFailed(e.to_string())),
                }
            }
            Ok(())
        };

        tokio::time::timeout(Duration::from_secs(BUILD_TIMEOUT_SECS), drain)
            .await
            .map_err(|_| {
                BridgeError::ImageBuildFailed(format!(
                    "timed out after {}s",
                    BUILD_TIMEOUT_SECS
                ))
            })??;

        info!("Image build complete: {}", self.config.image);
        Ok(())
    }

    /// Create the limited bridge network if it does not exist. Idempotent.
    pub async fn init_networks(&self) -> Result<()> {
        let network_name = self.config.network.trusted.as_str();

        if self
            .docker
            .inspect_network(network_name, None::<InspectNetworkOptions<String>>)
            .await
            .is_ok()
        {
            debug!("Network {} already exists", network_name);
            return Ok(());
        }

        match self
            .docker
            .create_network(CreateNetworkOptions {
                name: network_name,
                driver: "bridge",
                ..Default::default()
            })
            .await
        {
            Ok(_) => info!("Created network {}", network_name),
            Err(e) => warn!("Failed to create network {}: {}", network_name, e),
        }

        Ok(())
    }
}

#[async_trait]
impl SandboxEngine for DockerManager {
    fn container_name(&self, wxid: &str) -> String {
        DockerManager::container_name(self, wxid)
    }

    async fn ensure_container(&self, wxid: &str, permission: Permission) -> Result<String> {
        DockerManager::ensure_container(self, wxid, permission).await
    }

    async fn exec_claude(
        &self,
        wxid: &str,
        system_prompt: &str,
        message: &str,
        options: ExecOptions,
    ) -> Result<ExecOutput> {
        DockerManager::exec_claude(self, wxid, system_prompt, message, options).await
    }

    async fn exec_command(&self, wxid: &str, command: &str, as_root: bool) -> Result<String> {
        DockerManager::exec_command(self, wxid, command, as_root).await
    }

    async fn is_running(&self, name: &str) -> bool {
        DockerManager::is_running(self, name).await
    }

    async fn stats(&self, wxid: &str) -> Result<Option<ContainerStats>> {
        DockerManager::stats(self, wxid).await
    }

    async fn disk_usage(&self, wxid: &str) -> Result<String> {
        DockerManager::disk_usage(self, wxid).await
    }

    async fn stop_container(&self, wxid: &str) -> Result<bool> {
        DockerManager::stop_container(self, wxid).await
    }

    async fn destroy_container(&self, wxid: &str) -> Result<bool> {
        DockerManager::destroy_container(self, wxid).await
    }

    async fn rebuild(&self, wxid: &str, permission: Permission) -> Result<()> {
        DockerManager::rebuild(self, wxid, permission).await
    }

    async fn list_containers(&self) -> Result<Vec<ContainerInfo>> {
        DockerManager::list_containers(self).await
    }

    async fn stop_all(&self) -> Result<usize> {
        DockerManager::stop_all(self).await
    }

    async fn kill_claude(&self, wxid: &str) -> Result<bool> {
        DockerManager::kill_claude(self, wxid).await
    }
}

/// Assemble the in-container Claude CLI invocation.
fn build_claude_command(
    cli: &str,
    system_prompt: &str,
    message: &str,
    options: &ExecOptions,
) -> Vec<String> {
    let mut cmd = vec![
        cli.to_string(),
        "--print".to_string(),
        "--output-format".to_string(),
        "text".to_string(),
        "--system-prompt".to_string(),
        system_prompt.to_string(),
    ];

    if let Some(ref session) = options.claude_session {
        cmd.push("--resume".to_string());
        cmd.push(session.clone());
    }

    // Normal users get Q&A only: an empty allowed-tools list.
    if options.permission == Permission::Normal {
        cmd.push("--allowedTools".to_string());
        cmd.push(String::new());
    }

    cmd.push(message.to_string());
    cmd
}

/// Auth variables forwarded from the host into container execs/creation.
/// OAuth-token users normally need neither: their credentials live in the
/// mounted ~/.claude volume.
fn forwarded_auth_env() -> Vec<String> {
    ["CLAUDE_CODE_OAUTH_TOKEN", "ANTHROPIC_API_KEY"]
        .iter()
        .filter_map(|key| {
            std::env::var(key)
                .ok()
                .filter(|v| !v.is_empty())
                .map(|v| format!("{}={}", key, v))
        })
        .collect()
}

/// TERM the CLI process inside a container, then KILL it if it survives the
/// grace period.
async fn terminate_process(docker: &Docker, container: &str, process: &str) {
    let run = |cmd: Vec<String>| async move {
        let exec = docker
            .create_exec(
                container,
                CreateExecOptions {
                    cmd: Some(cmd),
                    attach_stdout: Some(true),
                    attach_stderr: Some(true),
                    user: Some("root".to_string()),
                    ..Default::default()
                },
            )
            .await?;
        // Drain so the exec actually completes.
        if let StartExecResults::Attached { mut output, .. } =
            docker.start_exec(&exec.id, None).await?
        {
            while output.next().await.is_some() {}
        }
        Ok::<_, bollard::errors::Error>(())
    };

    if let Err(e) = run(vec![
        "pkill".to_string(),
        "-f".to_string(),
        process.to_string(),
    ])
    .await
    {
        debug!("TERM in {} failed: {}", container, e);
        return;
    }

    tokio::time::sleep(Duration::from_secs(5)).await;

    if let Err(e) = run(vec![
        "pkill".to_string(),
        "-9".to_string(),
        "-f".to_string(),
        process.to_string(),
    ])
    .await
    {
        debug!("KILL in {} failed (process likely already gone): {}", container, e);
    }
}

/// CPU usage percentage from an engine stats sample.
fn calculate_cpu_percent(stats: &Stats) -> f64 {
    let cpu_delta = stats.cpu_stats.cpu_usage.total_usage as f64
        - stats.precpu_stats.cpu_usage.total_usage as f64;
    let system_delta = stats.cpu_stats.system_cpu_usage.unwrap_or(0) as f64
        - stats.precpu_stats.system_cpu_usage.unwrap_or(0) as f64;
    let num_cpus = stats.cpu_stats.online_cpus.unwrap_or(1) as f64;

    if system_delta > 0.0 && cpu_delta >= 0.0 {
        (cpu_delta / system_delta) * num_cpus * 100.0
    } else {
        0.0
    }
}

/// Tar up the image build-context directory.
fn create_build_context(dir: &Path) -> anyhow::Result<Vec<u8>> {
    fn add_dir(
        builder: &mut tar::Builder<Vec<u8>>,
        dir: &Path,
        prefix: &Path,
    ) -> anyhow::Result<()> {
        for entry in std::fs::read_dir(dir)? {
            let entry = entry?;
            let path = entry.path();
            let name = prefix.join(entry.file_name());
            if path.is_dir() {
                add_dir(builder, &path, &name)?;
            } else {
                let mut file = std::fs::File::open(&path)?;
                builder.append_file(name, &mut file)?;
            }
        }
        Ok(())
    }

    let mut archive = tar::Builder::new(Vec::new());
    add_dir(&mut archive, dir, Path::new(""))?;
    Ok(archive.into_inner()?)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn resolved_config() -> SandboxConfig {
        SandboxConfig::from_config(&Config::default()).unwrap()
    }

    #[test]
    fn from_config_resolves_defaults() {
        let cfg = resolved_config();
        assert_eq!(cfg.image, "claude-sandbox:latest");
        assert_eq!(cfg.container_prefix, "claude-friend-");
        assert_eq!(cfg.claude_cli, "claude");
        assert_eq!(cfg.limits.memory, 512 * 1024 * 1024);
        assert_eq!(cfg.limits.admin_memory, 2 * 1024 * 1024 * 1024);
        assert_eq!(cfg.limits.nano_cpus, 1_000_000_000);
        assert_eq!(cfg.limits.admin_nano_cpus, 2_000_000_000);
        assert_eq!(cfg.limits.pids, 100);
    }

    #[test]
    fn from_config_rejects_bad_memory() {
        let mut cfg = Config::default();
        cfg.docker.limits.memory = "-5m".into();
        assert!(SandboxConfig::from_config(&cfg).is_err());
    }

    #[test]
    fn tier_policy_memory_and_cpu() {
        let cfg = resolved_config();
        assert_eq!(cfg.memory_for(Permission::Admin), cfg.limits.admin_memory);
        assert_eq!(cfg.memory_for(Permission::Trusted), cfg.limits.memory);
        assert_eq!(cfg.memory_for(Permission::Normal), cfg.limits.memory);
        assert_eq!(
            cfg.nano_cpus_for(Permission::Admin),
            cfg.limits.admin_nano_cpus
        );
        assert_eq!(cfg.nano_cpus_for(Permission::Normal), cfg.limits.nano_cpus);
    }

    #[test]
    fn tier_policy_network() {
        let cfg = resolved_config();
        assert_eq!(cfg.network_for(Permission::Admin), "bridge");
        assert_eq!(cfg.network_for(Permission::Trusted), "claude-limited");
        assert_eq!(cfg.network_for(Permission::Normal), "none");
        assert_eq!(cfg.network_for(Permission::Blocked), "none");
    }

    #[test]
    fn claude_command_basic_shape() {
        let cmd = build_claude_command(
            "claude",
            "be nice",
            "hello",
            &ExecOptions {
                timeout_s: 120,
                claude_session: None,
                permission: Permission::Trusted,
            },
        );
        assert_eq!(
            cmd,
            vec![
                "claude",
                "--print",
                "--output-format",
                "text",
                "--system-prompt",
                "be nice",
                "hello"
            ]
        );
    }

    #[test]
    fn claude_command_resumes_known_session() {
        let cmd = build_claude_command(
            "claude",
            "sp",
            "msg",
            &ExecOptions {
                timeout_s: 120,
                claude_session: Some("abc-123".into()),
                permission: Permission::Admin,
            },
        );
        let resume_pos = cmd.iter().position(|s| s == "--resume").unwrap();
        assert_eq!(cmd[resume_pos + 1], "abc-123");
    }

    #[test]
    fn claude_command_restricts_normal_users() {
        let cmd = build_claude_command(
            "claude",
            "sp",
            "msg",
            &ExecOptions {
                timeout_s: 120,
                claude_session: None,
                permission: Permission::Normal,
            },
        );
        let pos = cmd.iter().position(|s| s == "--allowedTools").unwrap();
        assert_eq!(cmd[pos + 1], "");
        // Message stays last.
        assert_eq!(cmd.last().unwrap(), "msg");
    }

    #[test]
    fn build_context_packs_files() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("Dockerfile.sandbox"), "FROM scratch").unwrap();
        std::fs::create_dir(dir.path().join("scripts")).unwrap();
        std::fs::write(dir.path().join("scripts/setup.sh"), "#!/bin/sh").unwrap();

        let bytes = create_build_context(dir.path()).unwrap();
        assert!(!bytes.is_empty());

        let mut seen = Vec::new();
        let mut ar = tar::Archive::new(&bytes[..]);
        for entry in ar.entries().unwrap() {
            seen.push(entry.unwrap().path().unwrap().display().to_string());
        }
        assert!(seen.contains(&"Dockerfile.sandbox".to_string()));
        assert!(seen.contains(&"scripts/setup.sh".to_string()));
    }
}
