//! Docker sandbox backend.
//!
//! One container per session, labelled `leasehold.managed=true` so the
//! orphan detector can enumerate them. A session's context maps to a named
//! volume mounted at the configured working directory, which is what carries
//! data across instance replacement.

use async_trait::async_trait;
use bollard::container::{
    Config as ContainerConfig, CreateContainerOptions, DownloadFromContainerOptions,
    InspectContainerOptions, ListContainersOptions, LogOutput, RemoveContainerOptions,
    StatsOptions, TopOptions, UploadToContainerOptions,
};
use bollard::errors::Error as DockerError;
use bollard::exec::{CreateExecOptions, StartExecResults};
use bollard::models::{ContainerStateStatusEnum, HostConfig};
use bollard::volume::CreateVolumeOptions;
use bollard::Docker;
use bytes::Bytes;
use chrono::DateTime;
use futures_util::StreamExt;
use std::collections::{BTreeMap, HashMap};
use std::io::Read;
use std::time::Duration;
use tracing::{debug, info, warn};

use super::{
    ExecuteResult, FileEntry, InstanceInfo, Metrics, ProcessInfo, SandboxError, SandboxProvider,
    SessionInfo, SessionStatus,
};
use crate::config::DockerConfig;

const PROVIDER_NAME: &str = "docker";
const MANAGED_LABEL: &str = "leasehold.managed";
const CONTEXT_LABEL: &str = "leasehold.context";

/// Runs each sandbox session in its own Docker container.
pub(crate) struct DockerProvider {
    docker: Docker,
    config: DockerConfig,
}

impl DockerProvider {
    /// Connects to the local Docker daemon (socket or `DOCKER_HOST`).
    pub fn connect(config: DockerConfig) -> Result<Self, SandboxError> {
        let docker = Docker::connect_with_local_defaults().map_err(|e| {
            SandboxError::unavailable(format!("Failed to connect to Docker. Is Docker running? {e}"))
        })?;
        Ok(Self { docker, config })
    }

    async fn ensure_volume(&self, volume: &str) -> Result<(), SandboxError> {
        let labels = HashMap::from([(MANAGED_LABEL.to_string(), "true".to_string())]);
        self.docker
            .create_volume(CreateVolumeOptions {
                name: volume.to_string(),
                labels,
                ..Default::default()
            })
            .await
            .map_err(|e| SandboxError::provision(PROVIDER_NAME, format!("volume {volume}: {e}")))?;
        Ok(())
    }

    /// Runs a command and collects stdout/stderr; used for helper commands too.
    async fn exec_collect(
        &self,
        session_id: &str,
        cmd: Vec<String>,
        working_dir: Option<String>,
        timeout: Duration,
    ) -> Result<ExecuteResult, SandboxError> {
        let exec = self
            .docker
            .create_exec(
                session_id,
                CreateExecOptions {
                    cmd: Some(cmd),
                    working_dir,
                    attach_stdout: Some(true),
                    attach_stderr: Some(true),
                    ..Default::default()
                },
            )
            .await
            .map_err(|e| map_missing(session_id, e))?;

        let mut stdout = String::new();
        let mut stderr = String::new();

        let collect = async {
            if let StartExecResults::Attached {
                output: mut stream, ..
            } = self
                .docker
                .start_exec(&exec.id, None)
                .await
                .map_err(SandboxError::operation)?
            {
                while let Some(chunk) = stream.next().await {
                    match chunk {
                        Ok(LogOutput::StdOut { message }) => {
                            stdout.push_str(&String::from_utf8_lossy(&message));
                        }
                        Ok(LogOutput::StdErr { message }) => {
                            stderr.push_str(&String::from_utf8_lossy(&message));
                        }
                        Err(e) => {
                            warn!("Error reading exec output: {}", e);
                        }
                        _ => {}
                    }
                }
            }
            Ok::<(), SandboxError>(())
        };

        tokio::time::timeout(timeout, collect)
            .await
            .map_err(|_| SandboxError::timeout(timeout))??;

        let exit_code = self
            .docker
            .inspect_exec(&exec.id)
            .await
            .ok()
            .and_then(|inspect| inspect.exit_code)
            .unwrap_or(-1);

        Ok(ExecuteResult {
            output: stdout,
            exit_code,
            error: (!stderr.is_empty()).then_some(stderr),
            effective_timeout_ms: u64::try_from(timeout.as_millis()).unwrap_or(u64::MAX),
        })
    }

    fn container_path(&self, path: &str) -> String {
        if path.starts_with('/') {
            path.to_string()
        } else {
            format!("{}/{}", self.config.workdir.trim_end_matches('/'), path)
        }
    }
}

#[async_trait]
impl SandboxProvider for DockerProvider {
    fn name(&self) -> &str {
        PROVIDER_NAME
    }

    fn max_timeout(&self) -> Duration {
        Duration::from_secs(self.config.max_timeout_secs)
    }

    fn default_cwd(&self) -> &str {
        &self.config.workdir
    }

    async fn create_session(&self, context_id: Option<&str>) -> Result<SessionInfo, SandboxError> {
        self.docker
            .ping()
            .await
            .map_err(|e| SandboxError::unavailable(format!("Cannot ping Docker daemon: {e}")))?;

        let name = format!("leasehold-{}", &uuid::Uuid::new_v4().simple().to_string()[..12]);
        let volume = context_id.map(volume_name);
        if let Some(ref volume) = volume {
            self.ensure_volume(volume).await?;
        }

        let container_config = build_container_config(&self.config, context_id, volume.as_deref())?;

        debug!("Creating container: {}", name);
        self.docker
            .create_container(
                Some(CreateContainerOptions {
                    name: name.clone(),
                    platform: None,
                }),
                container_config,
            )
            .await
            .map_err(|e| {
                if is_status(&e, 404) {
                    SandboxError::provision(
                        PROVIDER_NAME,
                        format!("Container image not found: {}", self.config.image),
                    )
                } else {
                    SandboxError::provision(PROVIDER_NAME, e.to_string())
                }
            })?;

        debug!("Starting container");
        if let Err(e) = self.docker.start_container::<String>(&name, None).await {
            let _ = self
                .docker
                .remove_container(
                    &name,
                    Some(RemoveContainerOptions {
                        force: true,
                        ..Default::default()
                    }),
                )
                .await;
            return Err(SandboxError::provision(PROVIDER_NAME, e.to_string()));
        }

        info!("Created Docker sandbox {}", name);
        Ok(SessionInfo {
            session_id: name,
            provider: PROVIDER_NAME.to_string(),
            status: SessionStatus::Running,
        })
    }

    async fn destroy_session(&self, session_id: &str, sync: bool) -> Result<bool, SandboxError> {
        if sync && self.get_session_status(session_id).await == SessionStatus::Running {
            // Flush page cache so the context volume holds everything written
            if let Err(e) = self
                .exec_collect(
                    session_id,
                    vec!["sync".to_string()],
                    None,
                    Duration::from_secs(30),
                )
                .await
            {
                warn!("Failed to sync {} before removal: {}", session_id, e);
            }
        }

        debug!("Removing container {}", session_id);
        match self
            .docker
            .remove_container(
                session_id,
                Some(RemoveContainerOptions {
                    force: true,
                    ..Default::default()
                }),
            )
            .await
        {
            Ok(()) => {
                info!("Destroyed Docker sandbox {}", session_id);
                Ok(true)
            }
            Err(e) if is_status(&e, 404) => Ok(false),
            Err(e) => Err(SandboxError::operation(e)),
        }
    }

    async fn pause_session(&self, session_id: &str) -> Result<bool, SandboxError> {
        match self.docker.pause_container(session_id).await {
            Ok(()) => Ok(true),
            Err(e) if is_status(&e, 404) => Ok(false),
            // Already paused
            Err(e) if is_status(&e, 409) => Ok(true),
            Err(e) => Err(SandboxError::operation(e)),
        }
    }

    async fn resume_session(&self, session_id: &str) -> Result<bool, SandboxError> {
        let inspect = match self
            .docker
            .inspect_container(session_id, None::<InspectContainerOptions>)
            .await
        {
            Ok(inspect) => inspect,
            Err(e) if is_status(&e, 404) => return Ok(false),
            Err(e) => return Err(SandboxError::operation(e)),
        };
        let state = inspect.state.and_then(|s| s.status);

        match state {
            Some(ContainerStateStatusEnum::PAUSED) => self
                .docker
                .unpause_container(session_id)
                .await
                .map(|()| true)
                .map_err(SandboxError::operation),
            Some(ContainerStateStatusEnum::EXITED | ContainerStateStatusEnum::CREATED) => self
                .docker
                .start_container::<String>(session_id, None)
                .await
                .map(|()| true)
                .map_err(SandboxError::operation),
            _ => Ok(true),
        }
    }

    async fn get_session_status(&self, session_id: &str) -> SessionStatus {
        match self
            .docker
            .inspect_container(session_id, None::<InspectContainerOptions>)
            .await
        {
            Ok(inspect) => map_state(inspect.state.and_then(|s| s.status)),
            Err(e) if is_status(&e, 404) => SessionStatus::Deleted,
            Err(e) => {
                warn!("Cannot inspect {}: {}", session_id, e);
                SessionStatus::Unknown
            }
        }
    }

    async fn execute(
        &self,
        session_id: &str,
        command: &str,
        timeout_ms: u64,
        cwd: Option<&str>,
    ) -> Result<ExecuteResult, SandboxError> {
        let timeout = self.effective_timeout(timeout_ms);
        let working_dir = cwd.map_or_else(|| self.config.workdir.clone(), |c| self.container_path(c));
        self.exec_collect(
            session_id,
            vec!["sh".to_string(), "-c".to_string(), command.to_string()],
            Some(working_dir),
            timeout,
        )
        .await
    }

    async fn read_file(&self, session_id: &str, path: &str) -> Result<Vec<u8>, SandboxError> {
        let full = self.container_path(path);
        let mut stream = self.docker.download_from_container(
            session_id,
            Some(DownloadFromContainerOptions { path: full.clone() }),
        );

        let mut archive = Vec::new();
        while let Some(chunk) = stream.next().await {
            let chunk = chunk.map_err(|e| SandboxError::io(&full, e))?;
            archive.extend_from_slice(&chunk);
        }
        extract_single_file(&archive).map_err(|e| SandboxError::io(&full, e))
    }

    async fn write_file(
        &self,
        session_id: &str,
        path: &str,
        content: &[u8],
    ) -> Result<(), SandboxError> {
        let full = self.container_path(path);
        let (parent, file_name) = split_parent(&full);

        let mkdir = self
            .exec_collect(
                session_id,
                vec!["mkdir".to_string(), "-p".to_string(), parent.clone()],
                None,
                Duration::from_secs(30),
            )
            .await?;
        if mkdir.exit_code != 0 {
            return Err(SandboxError::io(&full, mkdir.error.unwrap_or_default()));
        }

        let archive = build_single_file_archive(&file_name, content).map_err(|e| SandboxError::io(&full, e))?;
        self.docker
            .upload_to_container(
                session_id,
                Some(UploadToContainerOptions {
                    path: parent,
                    ..Default::default()
                }),
                Bytes::from(archive),
            )
            .await
            .map_err(|e| SandboxError::io(&full, e))
    }

    async fn list_dir(&self, session_id: &str, path: &str) -> Result<Vec<FileEntry>, SandboxError> {
        let full = self.container_path(path);
        let script = format!(
            "cd {} || exit 2; for f in * .*; do \
             [ \"$f\" = . ] || [ \"$f\" = .. ] || [ ! -e \"$f\" ] && continue; \
             if [ -d \"$f\" ]; then printf 'd\\t0\\t%s\\n' \"$f\"; \
             else printf 'f\\t%s\\t%s\\n' \"$(wc -c < \"$f\")\" \"$f\"; fi; done",
            shell_words::quote(&full)
        );
        let result = self
            .exec_collect(
                session_id,
                vec!["sh".to_string(), "-c".to_string(), script],
                None,
                Duration::from_secs(30),
            )
            .await?;
        if result.exit_code != 0 {
            return Err(SandboxError::io(&full, result.error.unwrap_or_default()));
        }
        Ok(parse_listing(&result.output))
    }

    async fn list_instances(&self) -> Result<Vec<InstanceInfo>, SandboxError> {
        let filters = HashMap::from([(
            "label".to_string(),
            vec![format!("{MANAGED_LABEL}=true")],
        )]);
        let containers = self
            .docker
            .list_containers(Some(ListContainersOptions::<String> {
                all: true,
                filters,
                ..Default::default()
            }))
            .await
            .map_err(|e| SandboxError::unavailable(e.to_string()))?;

        Ok(containers
            .into_iter()
            .filter_map(|c| {
                let instance_id = c
                    .names
                    .as_ref()
                    .and_then(|names| names.first())
                    .map(|n| n.trim_start_matches('/').to_string())
                    .or(c.id.clone())?;
                let mut metadata = BTreeMap::new();
                if let Some(image) = c.image {
                    metadata.insert("image".to_string(), image);
                }
                if let Some(status) = c.status {
                    metadata.insert("docker_status".to_string(), status);
                }
                if let Some(context) = c.labels.as_ref().and_then(|l| l.get(CONTEXT_LABEL)) {
                    metadata.insert("context_id".to_string(), context.clone());
                }
                Some(InstanceInfo {
                    instance_id,
                    status: map_state_str(c.state.as_deref()),
                    created_at: c.created.and_then(|ts| DateTime::from_timestamp(ts, 0)),
                    metadata,
                })
            })
            .collect())
    }

    async fn get_metrics(&self, session_id: &str) -> Option<Metrics> {
        let mut stream = self.docker.stats(
            session_id,
            Some(StatsOptions {
                stream: false,
                one_shot: true,
            }),
        );
        let stats = stream.next().await?.ok()?;

        let cpu_delta = stats
            .cpu_stats
            .cpu_usage
            .total_usage
            .saturating_sub(stats.precpu_stats.cpu_usage.total_usage);
        let system_delta = stats
            .cpu_stats
            .system_cpu_usage
            .unwrap_or(0)
            .saturating_sub(stats.precpu_stats.system_cpu_usage.unwrap_or(0));
        let online = stats.cpu_stats.online_cpus.unwrap_or(1);

        let (rx, tx) = stats.networks.as_ref().map_or((None, None), |nets| {
            let rx = nets.values().map(|n| n.rx_bytes).sum();
            let tx = nets.values().map(|n| n.tx_bytes).sum();
            (Some(rx), Some(tx))
        });

        Some(Metrics {
            cpu_percent: cpu_percent(cpu_delta, system_delta, online),
            memory_bytes: stats.memory_stats.usage,
            memory_limit_bytes: stats.memory_stats.limit,
            disk_bytes: None,
            net_rx_bytes: rx,
            net_tx_bytes: tx,
        })
    }

    async fn list_processes(&self, session_id: &str) -> Option<Vec<ProcessInfo>> {
        let top = self
            .docker
            .top_processes(session_id, Some(TopOptions { ps_args: "-ef" }))
            .await
            .ok()?;
        Some(parse_top(
            &top.titles.unwrap_or_default(),
            &top.processes.unwrap_or_default(),
        ))
    }
}

/// Container configuration for a new sandbox.
fn build_container_config(
    config: &DockerConfig,
    context_id: Option<&str>,
    volume: Option<&str>,
) -> Result<ContainerConfig<String>, SandboxError> {
    let memory = parse_memory_limit(&config.resources.memory)
        .map_err(|e| SandboxError::provision(PROVIDER_NAME, e))?;
    let cpus = config.resources.cpus.parse::<f64>().unwrap_or(2.0);

    let mut labels = HashMap::from([(MANAGED_LABEL.to_string(), "true".to_string())]);
    if let Some(context_id) = context_id {
        labels.insert(CONTEXT_LABEL.to_string(), context_id.to_string());
    }

    let binds = volume.map(|v| vec![format!("{v}:{}:rw", config.workdir)]);

    #[allow(clippy::cast_possible_truncation)]
    let nano_cpus = (cpus * 1_000_000_000.0) as i64;

    Ok(ContainerConfig {
        image: Some(config.image.clone()),
        working_dir: Some(config.workdir.clone()),
        cmd: Some(vec!["sleep".to_string(), "infinity".to_string()]),
        labels: Some(labels),
        host_config: Some(HostConfig {
            binds,
            memory: Some(memory),
            nano_cpus: Some(nano_cpus),
            dns: Some(config.network.dns.clone()),
            network_mode: config.network.policy.network_mode(),
            ..Default::default()
        }),
        ..Default::default()
    })
}

fn volume_name(context_id: &str) -> String {
    let safe: String = context_id
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() || c == '-' || c == '_' { c } else { '_' })
        .collect();
    format!("leasehold-ctx-{safe}")
}

fn is_status(err: &DockerError, code: u16) -> bool {
    matches!(err, DockerError::DockerResponseServerError { status_code, .. } if *status_code == code)
}

fn map_missing(session_id: &str, err: DockerError) -> SandboxError {
    if is_status(&err, 404) {
        SandboxError::not_found(session_id)
    } else if is_status(&err, 409) {
        SandboxError::invalid_state(session_id, "not running")
    } else {
        SandboxError::operation(err)
    }
}

fn map_state(state: Option<ContainerStateStatusEnum>) -> SessionStatus {
    match state {
        Some(ContainerStateStatusEnum::RUNNING) => SessionStatus::Running,
        // A stopped container can be started again, so it counts as suspended
        Some(ContainerStateStatusEnum::PAUSED | ContainerStateStatusEnum::EXITED) => {
            SessionStatus::Paused
        }
        Some(ContainerStateStatusEnum::DEAD | ContainerStateStatusEnum::REMOVING) => {
            SessionStatus::Deleted
        }
        _ => SessionStatus::Unknown,
    }
}

fn map_state_str(state: Option<&str>) -> SessionStatus {
    match state {
        Some("running") => SessionStatus::Running,
        Some("paused" | "exited") => SessionStatus::Paused,
        Some("dead" | "removing") => SessionStatus::Deleted,
        _ => SessionStatus::Unknown,
    }
}

#[allow(clippy::cast_precision_loss)]
fn cpu_percent(cpu_delta: u64, system_delta: u64, online_cpus: u64) -> Option<f64> {
    if system_delta == 0 {
        return None;
    }
    Some(cpu_delta as f64 / system_delta as f64 * online_cpus as f64 * 100.0)
}

fn parse_listing(output: &str) -> Vec<FileEntry> {
    let mut entries: Vec<FileEntry> = output
        .lines()
        .filter_map(|line| {
            let mut parts = line.splitn(3, '\t');
            let kind = parts.next()?;
            let size = parts.next()?.trim().parse().unwrap_or(0);
            let name = parts.next()?.to_string();
            Some(FileEntry {
                name,
                is_dir: kind == "d",
                size,
            })
        })
        .collect();
    entries.sort_by(|a, b| a.name.cmp(&b.name));
    entries
}

fn parse_top(titles: &[String], processes: &[Vec<String>]) -> Vec<ProcessInfo> {
    let pid_idx = titles.iter().position(|t| t == "PID").unwrap_or(1);
    let cmd_idx = titles
        .iter()
        .position(|t| t == "CMD" || t == "COMMAND")
        .unwrap_or(titles.len().saturating_sub(1));
    processes
        .iter()
        .filter_map(|row| {
            Some(ProcessInfo {
                pid: row.get(pid_idx)?.clone(),
                command: row.get(cmd_idx)?.clone(),
            })
        })
        .collect()
}

fn split_parent(path: &str) -> (String, String) {
    match path.rsplit_once('/') {
        Some(("", name)) => ("/".to_string(), name.to_string()),
        Some((parent, name)) => (parent.to_string(), name.to_string()),
        None => (".".to_string(), path.to_string()),
    }
}

fn build_single_file_archive(name: &str, content: &[u8]) -> std::io::Result<Vec<u8>> {
    let mut builder = tar::Builder::new(Vec::new());
    let mut header = tar::Header::new_gnu();
    header.set_size(content.len() as u64);
    header.set_mode(0o644);
    header.set_cksum();
    builder.append_data(&mut header, name, content)?;
    builder.into_inner()
}

fn extract_single_file(archive: &[u8]) -> std::io::Result<Vec<u8>> {
    let mut archive = tar::Archive::new(archive);
    for entry in archive.entries()? {
        let mut entry = entry?;
        if entry.header().entry_type().is_file() {
            let mut content = Vec::new();
            entry.read_to_end(&mut content)?;
            return Ok(content);
        }
    }
    Err(std::io::Error::new(
        std::io::ErrorKind::InvalidData,
        "path is not a regular file",
    ))
}

/// Parse memory limit string (e.g., "8g", "512m") to bytes
fn parse_memory_limit(limit: &str) -> Result<i64, String> {
    let limit = limit.to_lowercase();

    if let Some(num) = limit.strip_suffix('g') {
        let gigs: i64 = num.parse().map_err(|_| format!("Invalid memory limit: {limit}"))?;
        Ok(gigs * 1024 * 1024 * 1024)
    } else if let Some(num) = limit.strip_suffix('m') {
        let megs: i64 = num.parse().map_err(|_| format!("Invalid memory limit: {limit}"))?;
        Ok(megs * 1024 * 1024)
    } else {
        limit.parse().map_err(|_| format!("Invalid memory limit: {limit}"))
    }
}
