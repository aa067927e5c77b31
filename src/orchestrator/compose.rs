//! Single-host orchestrator backend on the local container daemon.
//!
//! Containers live on a named bridge network; per-user volumes are
//! daemon-managed named volumes; the proxy and directory service come up via
//! `docker compose`.

use std::collections::{HashMap, HashSet};
use std::path::Path;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use bollard::container::{
    Config, CreateContainerOptions, InspectContainerOptions, ListContainersOptions, LogOutput,
    RemoveContainerOptions, StartContainerOptions, StatsOptions, StopContainerOptions,
};
use bollard::exec::{CreateExecOptions, StartExecOptions, StartExecResults};
use bollard::image::{BuildImageOptions, CreateImageOptions};
use bollard::models::{ContainerStateStatusEnum, DeviceRequest, HostConfig};
use bollard::network::{CreateNetworkOptions, InspectNetworkOptions, ListNetworksOptions};
use bollard::volume::CreateVolumeOptions;
use bollard::Docker;
use futures_util::StreamExt;
use tracing::{debug, info, warn};

use crate::config::OrchestratorConfig;
use crate::naming;

use super::{
    cpu_percent_from_deltas, ContainerOrchestrator, ContainerState, LaunchSpec,
    OrchestratorError, RemoveOutcome, StopOutcome, ABSENT_ACTIVITY, MANAGED_IMAGE_PREFIX,
};

/// Web port the session image serves its VNC client on, used when the image
/// does not declare an exposed port.
const DEFAULT_WEB_PORT: &str = "6901";

pub struct ComposeOrchestrator {
    docker: Docker,
    cfg: OrchestratorConfig,
}

impl ComposeOrchestrator {
    /// Connect to the local daemon: `DOCKER_HOST` first, then the usual
    /// socket locations.
    pub async fn connect(cfg: &OrchestratorConfig) -> anyhow::Result<Self> {
        let docker = if std::env::var("DOCKER_HOST").is_ok() {
            Docker::connect_with_local_defaults()?
        } else {
            let home = std::env::var("HOME").unwrap_or_default();
            let socket_paths = [
                "/var/run/docker.sock".to_string(),
                "/run/docker.sock".to_string(),
                format!("{}/.docker/run/docker.sock", home),
            ];

            socket_paths
                .iter()
                .filter(|p| Path::new(p.as_str()).exists())
                .find_map(|p| {
                    Docker::connect_with_unix(p, 120, bollard::API_DEFAULT_VERSION).ok()
                })
                .map_or_else(Docker::connect_with_local_defaults, Ok)?
        };

        docker.ping().await?;
        info!("Connected to the container daemon");

        Ok(Self {
            docker,
            cfg: cfg.clone(),
        })
    }

    fn is_not_found(e: &bollard::errors::Error) -> bool {
        matches!(
            e,
            bollard::errors::Error::DockerResponseServerError {
                status_code: 404,
                ..
            }
        )
    }

    async fn create_and_start(
        &self,
        spec: &LaunchSpec,
        with_gpu: bool,
    ) -> Result<(), bollard::errors::Error> {
        let binds: Vec<String> = spec
            .volumes
            .iter()
            .map(|b| format!("{}:{}:rw", b.volume, b.mount_point))
            .collect();

        let device_requests = with_gpu.then(|| {
            vec![DeviceRequest {
                driver: Some("nvidia".to_string()),
                count: Some(-1),
                capabilities: Some(vec![vec!["gpu".to_string()]]),
                ..Default::default()
            }]
        });

        let config = Config {
            image: Some(format!("{}:{}", spec.image_name, spec.image_tag)),
            // Auth happens upstream at the hub; the in-container VNC login
            // must stay out of the way.
            env: Some(vec!["VNC_DISABLE_AUTH=true".to_string()]),
            user: Some("root".to_string()),
            host_config: Some(HostConfig {
                binds: Some(binds),
                network_mode: Some(spec.network.clone()),
                shm_size: Some(512 * 1024 * 1024),
                device_requests,
                ..Default::default()
            }),
            ..Default::default()
        };

        let options = CreateContainerOptions {
            name: spec.container_name.clone(),
            platform: None,
        };

        self.docker.create_container(Some(options), config).await?;
        self.docker
            .start_container(&spec.container_name, None::<StartContainerOptions<String>>)
            .await
    }

    async fn build_from_context(
        &self,
        context_dir: &str,
        image_name: &str,
        image_tag: &str,
        buildargs: HashMap<String, String>,
    ) -> Result<(), OrchestratorError> {
        info!("Building image {}:{} from {}", image_name, image_tag, context_dir);

        let mut archive = tar::Builder::new(Vec::new());
        archive
            .append_dir_all(".", context_dir)
            .map_err(|e| OrchestratorError::Other(format!("build context {}: {}", context_dir, e)))?;
        let bytes = archive
            .into_inner()
            .map_err(|e| OrchestratorError::Other(format!("build context {}: {}", context_dir, e)))?;

        let options = BuildImageOptions {
            dockerfile: "Dockerfile".to_string(),
            t: format!("{}:{}", image_name, image_tag),
            buildargs,
            ..Default::default()
        };

        let mut stream =
            self.docker
                .build_image(options, None, Some(bytes.into()));
        while let Some(result) = stream.next().await {
            let update = result?;
            if let Some(stream_line) = update.stream {
                debug!("Build: {}", stream_line.trim_end());
            }
            if let Some(err) = update.error {
                return Err(OrchestratorError::Other(format!(
                    "image build failed: {}",
                    err
                )));
            }
        }

        info!("Built image {}:{}", image_name, image_tag);
        Ok(())
    }

    async fn image_present(&self, name: &str, tag: &str) -> Result<bool, OrchestratorError> {
        let wanted = format!("{}:{}", name, tag);
        let images = self.docker.list_images::<String>(None).await?;
        Ok(images
            .iter()
            .any(|img| img.repo_tags.iter().any(|t| t == &wanted)))
    }

    async fn pull_image(&self, name: &str, tag: &str) -> Result<(), OrchestratorError> {
        info!("Pulling image {}:{}", name, tag);
        let options = CreateImageOptions {
            from_image: name.to_string(),
            tag: tag.to_string(),
            ..Default::default()
        };

        let mut stream = self.docker.create_image(Some(options), None, None);
        while let Some(result) = stream.next().await {
            let update = result?;
            if let Some(status) = update.status {
                debug!("Pull progress: {}", status);
            }
        }
        Ok(())
    }
}

#[async_trait]
impl ContainerOrchestrator for ComposeOrchestrator {
    fn normalize_name(&self, user: &str) -> String {
        naming::normalize_for_daemon(user)
    }

    async fn list_managed_containers(
        &self,
        prefix: &str,
    ) -> Result<HashSet<String>, OrchestratorError> {
        let mut filters = HashMap::new();
        filters.insert("name", vec![prefix]);

        let containers = self
            .docker
            .list_containers(Some(ListContainersOptions {
                all: true,
                filters,
                ..Default::default()
            }))
            .await?;

        // The daemon's name filter is a substring match and names carry a
        // leading slash; re-check the prefix exactly.
        Ok(containers
            .iter()
            .filter_map(|c| c.names.as_ref())
            .flatten()
            .map(|n| n.trim_start_matches('/').to_string())
            .filter(|n| n.starts_with(prefix))
            .collect())
    }

    async fn ensure_network(&self, name: &str) -> Result<String, OrchestratorError> {
        let mut filters = HashMap::new();
        filters.insert("name", vec![name]);

        let listed = self
            .docker
            .list_networks(Some(ListNetworksOptions { filters: filters.clone() }))
            .await?;
        let mut matching: Vec<String> = listed
            .into_iter()
            .filter(|n| n.name.as_deref() == Some(name))
            .filter_map(|n| n.id)
            .collect();

        if matching.len() > 1 {
            // Several networks carry this name; prune the empty ones.
            let mut kept = Vec::new();
            for id in matching {
                let inspected = self
                    .docker
                    .inspect_network(&id, Some(InspectNetworkOptions::<String> {
                        verbose: true,
                        ..Default::default()
                    }))
                    .await?;
                let attached = inspected
                    .containers
                    .as_ref()
                    .map(|c| c.len())
                    .unwrap_or(0);
                if attached == 0 {
                    info!("Removing empty duplicate network {} ({})", name, id);
                    self.docker.remove_network(&id).await?;
                } else {
                    kept.push(id);
                }
            }
            matching = kept;
        }

        match matching.len() {
            1 => Ok(matching.remove(0)),
            0 => {
                info!("Creating network {}", name);
                self.docker
                    .create_network(CreateNetworkOptions {
                        name: name.to_string(),
                        driver: "bridge".to_string(),
                        ..Default::default()
                    })
                    .await?;
                let relisted = self
                    .docker
                    .list_networks(Some(ListNetworksOptions { filters }))
                    .await?;
                relisted
                    .into_iter()
                    .find(|n| n.name.as_deref() == Some(name))
                    .and_then(|n| n.id)
                    .ok_or_else(|| OrchestratorError::Other("network created without id".into()))
            }
            _ => Err(OrchestratorError::Other(format!(
                "more than one non-empty network named {}",
                name
            ))),
        }
    }

    async fn ensure_volume(&self, user: &str, kind: &str) -> Result<(), OrchestratorError> {
        let volume_name = format!("{}_{}", user, kind);
        match self.docker.inspect_volume(&volume_name).await {
            Ok(_) => Ok(()),
            Err(e) if Self::is_not_found(&e) => {
                self.docker
                    .create_volume(CreateVolumeOptions {
                        name: volume_name.clone(),
                        driver: "local".to_string(),
                        ..Default::default()
                    })
                    .await?;
                info!("Created volume {}", volume_name);
                Ok(())
            }
            Err(e) => Err(e.into()),
        }
    }

    async fn ensure_image(&self, name: &str, tag: &str) -> Result<(), OrchestratorError> {
        if self.image_present(name, tag).await? {
            debug!("Image {}:{} already present", name, tag);
            return Ok(());
        }

        if name.starts_with(MANAGED_IMAGE_PREFIX) {
            // Locally managed image: build the VNC base layer first, then the
            // session image on top of it.
            let base_name = self.cfg.vnc_base_image_name.clone();
            let base_tag = self.cfg.vnc_base_image_tag.clone();
            if !self.image_present(&base_name, &base_tag).await? {
                let base_context = self.cfg.vnc_base_image_dockerfile.clone().ok_or_else(|| {
                    OrchestratorError::Other(
                        "VNC_BASE_IMAGE_DOCKERFILE not configured for a managed image".into(),
                    )
                })?;
                self.build_from_context(&base_context, &base_name, &base_tag, HashMap::new())
                    .await?;
            }

            let context = self.cfg.slicer_image_dockerfile.clone().ok_or_else(|| {
                OrchestratorError::Other(
                    "SLICER_IMAGE_DOCKERFILE not configured for a managed image".into(),
                )
            })?;
            let mut buildargs = HashMap::new();
            buildargs.insert(
                "BASE_IMAGE".to_string(),
                format!("{}:{}", base_name, base_tag),
            );
            self.build_from_context(&context, name, tag, buildargs).await
        } else {
            self.pull_image(name, tag).await
        }
    }

    async fn start_container(&self, spec: &LaunchSpec) -> Result<(), OrchestratorError> {
        info!(
            "Launching container {} (image {}:{}, gpu: {})",
            spec.container_name, spec.image_name, spec.image_tag, spec.gpu
        );

        if let Err(e) = self.create_and_start(spec, spec.gpu).await {
            if spec.gpu {
                // The GPU request is advisory; retry the launch without it.
                warn!(
                    "GPU launch of {} declined ({}); retrying without GPU",
                    spec.container_name, e
                );
                let _ = self
                    .docker
                    .remove_container(
                        &spec.container_name,
                        Some(RemoveContainerOptions {
                            force: true,
                            ..Default::default()
                        }),
                    )
                    .await;
                self.create_and_start(spec, false).await?;
            } else {
                return Err(e.into());
            }
        }

        // Cooperative bounded wait until the container reports running.
        let deadline = Instant::now() + Duration::from_secs(self.cfg.launch_timeout_secs);
        loop {
            tokio::time::sleep(Duration::from_secs(3)).await;
            match self.container_status(&spec.container_name).await? {
                ContainerState::Running => {
                    info!("Container {} is running", spec.container_name);
                    return Ok(());
                }
                ContainerState::Exited => {
                    return Err(OrchestratorError::Other(format!(
                        "container {} exited during startup",
                        spec.container_name
                    )));
                }
                _ if Instant::now() >= deadline => {
                    return Err(OrchestratorError::Other(format!(
                        "container {} did not reach running within {}s",
                        spec.container_name, self.cfg.launch_timeout_secs
                    )));
                }
                _ => {}
            }
        }
    }

    async fn stop_container(&self, name: &str) -> Result<StopOutcome, OrchestratorError> {
        match self
            .docker
            .stop_container(name, Some(StopContainerOptions { t: 10 }))
            .await
        {
            Ok(_) => {
                debug!("Container {} stopped gracefully", name);
                Ok(StopOutcome::Stopped)
            }
            Err(e) if Self::is_not_found(&e) => Ok(StopOutcome::Absent),
            Err(e) => {
                warn!("Graceful stop failed for {}, forcing: {}", name, e);
                match self.docker.kill_container::<String>(name, None).await {
                    Ok(_) => Ok(StopOutcome::Stopped),
                    Err(e) if Self::is_not_found(&e) => Ok(StopOutcome::Absent),
                    Err(_) => Ok(StopOutcome::Failed),
                }
            }
        }
    }

    async fn remove_container(&self, name: &str) -> Result<RemoveOutcome, OrchestratorError> {
        match self
            .docker
            .remove_container(
                name,
                Some(RemoveContainerOptions {
                    force: true,
                    ..Default::default()
                }),
            )
            .await
        {
            Ok(_) => {
                debug!("Container {} removed", name);
                Ok(RemoveOutcome::Removed)
            }
            Err(e) if Self::is_not_found(&e) => Ok(RemoveOutcome::Absent),
            Err(e) => {
                warn!("Failed to remove container {}: {}", name, e);
                Ok(RemoveOutcome::Failed)
            }
        }
    }

    async fn container_status(&self, name: &str) -> Result<ContainerState, OrchestratorError> {
        match self
            .docker
            .inspect_container(name, None::<InspectContainerOptions>)
            .await
        {
            Ok(details) => {
                let status = details.state.and_then(|s| s.status);
                Ok(match status {
                    Some(ContainerStateStatusEnum::RUNNING) => ContainerState::Running,
                    Some(ContainerStateStatusEnum::EXITED)
                    | Some(ContainerStateStatusEnum::DEAD) => ContainerState::Exited,
                    Some(other) => ContainerState::Other(other.to_string()),
                    None => ContainerState::Other("unknown".to_string()),
                })
            }
            Err(e) if Self::is_not_found(&e) => Ok(ContainerState::Absent),
            Err(e) => Err(e.into()),
        }
    }

    async fn container_activity(&self, name: &str) -> Result<f64, OrchestratorError> {
        let mut stats_stream = self.docker.stats(
            name,
            Some(StatsOptions {
                stream: false,
                ..Default::default()
            }),
        );

        let stats = match stats_stream.next().await {
            Some(Ok(stats)) => stats,
            Some(Err(e)) if Self::is_not_found(&e) => return Ok(ABSENT_ACTIVITY),
            Some(Err(e)) => return Err(e.into()),
            None => return Ok(ABSENT_ACTIVITY),
        };

        let container_delta = stats
            .cpu_stats
            .cpu_usage
            .total_usage
            .saturating_sub(stats.precpu_stats.cpu_usage.total_usage);
        let system_delta = stats
            .cpu_stats
            .system_cpu_usage
            .unwrap_or(0)
            .saturating_sub(stats.precpu_stats.system_cpu_usage.unwrap_or(0));
        let online_cpus = stats.cpu_stats.online_cpus.unwrap_or(1);

        Ok(cpu_percent_from_deltas(
            container_delta,
            system_delta,
            online_cpus,
        ))
    }

    async fn container_address(
        &self,
        name: &str,
        network: &str,
    ) -> Result<String, OrchestratorError> {
        let details = self
            .docker
            .inspect_container(name, None::<InspectContainerOptions>)
            .await?;

        let networks = details
            .network_settings
            .as_ref()
            .and_then(|ns| ns.networks.as_ref())
            .ok_or_else(|| {
                OrchestratorError::Other(format!("container {} has no network info", name))
            })?;

        let endpoint = networks
            .get(network)
            .or_else(|| networks.values().next())
            .ok_or_else(|| {
                OrchestratorError::Other(format!(
                    "container {} is not attached to network {}",
                    name, network
                ))
            })?;

        let ip = endpoint
            .ip_address
            .clone()
            .filter(|ip| !ip.is_empty())
            .ok_or_else(|| {
                OrchestratorError::Other(format!("container {} has no address yet", name))
            })?;

        // The image exposes its web port; take the highest declared one, the
        // same port the proxy will speak to.
        let port = details
            .config
            .as_ref()
            .and_then(|c| c.exposed_ports.as_ref())
            .map(|ports| {
                let mut keys: Vec<&String> = ports.keys().collect();
                keys.sort();
                keys.last()
                    .map(|k| k.split('/').next().unwrap_or(DEFAULT_WEB_PORT).to_string())
                    .unwrap_or_else(|| DEFAULT_WEB_PORT.to_string())
            })
            .unwrap_or_else(|| DEFAULT_WEB_PORT.to_string());

        Ok(format!("{}:{}", ip, port))
    }

    async fn exec_in_proxy(
        &self,
        name: &str,
        cmd: &[&str],
    ) -> Result<Option<String>, OrchestratorError> {
        let exec = match self
            .docker
            .create_exec(
                name,
                CreateExecOptions {
                    cmd: Some(cmd.iter().map(|s| s.to_string()).collect()),
                    attach_stdout: Some(true),
                    attach_stderr: Some(true),
                    ..Default::default()
                },
            )
            .await
        {
            Ok(exec) => exec,
            Err(e) if Self::is_not_found(&e) => return Ok(None),
            Err(e) => {
                debug!("Proxy exec setup failed: {}", e);
                return Ok(None);
            }
        };

        let started = self
            .docker
            .start_exec(&exec.id, Some(StartExecOptions::default()))
            .await?;

        match started {
            StartExecResults::Attached { mut output, .. } => {
                let mut result = String::new();
                while let Some(Ok(chunk)) = output.next().await {
                    match chunk {
                        LogOutput::StdOut { message }
                        | LogOutput::StdErr { message }
                        | LogOutput::Console { message } => {
                            result.push_str(&String::from_utf8_lossy(&message));
                        }
                        _ => {}
                    }
                }
                Ok(Some(result))
            }
            StartExecResults::Detached => Ok(Some(String::new())),
        }
    }

    async fn bring_up_base(&self) -> Result<(), OrchestratorError> {
        info!("Bringing up base services via docker compose");
        let output = tokio::process::Command::new("docker")
            .args(["compose", "up", "-d", "--wait"])
            .output()
            .await
            .map_err(|e| OrchestratorError::Other(format!("docker compose: {}", e)))?;

        if output.status.success() {
            Ok(())
        } else {
            Err(OrchestratorError::Other(format!(
                "docker compose up failed: {}",
                String::from_utf8_lossy(&output.stderr).trim()
            )))
        }
    }
}
