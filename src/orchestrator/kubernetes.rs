//! Cluster orchestrator backend on the Kubernetes scheduler.
//!
//! Each session container is expressed as a single-replica Deployment named
//! `deploy-{container_name}`. Suspension scales the deployment to zero,
//! resumption back to one, deletion removes it. Per-user volumes are hostPath
//! mounts under a shared network-filesystem root.

use std::collections::{BTreeMap, HashSet};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use k8s_openapi::api::apps::v1::{Deployment, DeploymentSpec, DeploymentStrategy};
use k8s_openapi::api::core::v1::{
    Container, ContainerPort, EnvVar, ExecAction, HostPathVolumeSource, Lifecycle,
    LifecycleHandler, NodeAffinity, NodeSelectorRequirement, NodeSelectorTerm, Pod,
    PodSpec, PodTemplateSpec, PreferredSchedulingTerm, Volume, VolumeMount,
};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::{LabelSelector, ObjectMeta};
use kube::api::{Api, AttachParams, DeleteParams, ListParams, Patch, PatchParams, PostParams};
use kube::Client;
use tokio::io::AsyncReadExt;
use tracing::{debug, info, warn};

use crate::config::OrchestratorConfig;
use crate::naming;

use super::{
    millicores_to_percent, parse_cpu_quantity_millicores, ContainerOrchestrator, ContainerState,
    LaunchSpec, OrchestratorError, RemoveOutcome, StopOutcome, ABSENT_ACTIVITY,
};

/// Common label carried by every session deployment.
const APP_LABEL: &str = "tdslicerhub-session";
/// Per-container label key.
const CONTAINER_LABEL_KEY: &str = "tdslicerhub/container";
/// Label marking base services (proxy, directory) the hub may scale up.
const BASE_LABEL_KEY: &str = "tdslicerhub/base-service";
/// Web port the session image serves inside the pod.
const WEB_PORT: i32 = 6901;

pub struct KubernetesOrchestrator {
    client: Client,
    cfg: OrchestratorConfig,
}

impl KubernetesOrchestrator {
    pub async fn connect(cfg: &OrchestratorConfig) -> anyhow::Result<Self> {
        let client = Client::try_default().await?;
        info!("Connected to the cluster scheduler (namespace {})", cfg.namespace);
        Ok(Self {
            client,
            cfg: cfg.clone(),
        })
    }

    fn deployment_name(container_name: &str) -> String {
        format!("deploy-{}", container_name)
    }

    fn deployments(&self) -> Api<Deployment> {
        Api::namespaced(self.client.clone(), &self.cfg.namespace)
    }

    fn pods(&self) -> Api<Pod> {
        Api::namespaced(self.client.clone(), &self.cfg.namespace)
    }

    fn container_selector(container_name: &str) -> String {
        format!("{}={}", CONTAINER_LABEL_KEY, container_name)
    }

    async fn scale(&self, deployment: &str, replicas: i32) -> Result<(), kube::Error> {
        let patch = serde_json::json!({ "spec": { "replicas": replicas } });
        self.deployments()
            .patch(deployment, &PatchParams::default(), &Patch::Merge(&patch))
            .await?;
        debug!("Scaled {} to {} replicas", deployment, replicas);
        Ok(())
    }

    fn is_not_found(e: &kube::Error) -> bool {
        matches!(e, kube::Error::Api(api) if api.code == 404)
    }

    async fn backing_pod(&self, container_name: &str) -> Result<Option<Pod>, kube::Error> {
        let listed = self
            .pods()
            .list(&ListParams::default().labels(&Self::container_selector(container_name)))
            .await?;
        Ok(listed.items.into_iter().next())
    }

    /// Sum the CPU usage of the pods backing a container, in millicores, from
    /// the scheduler's metrics API.
    async fn metrics_millicores(&self, container_name: &str) -> Result<f64, OrchestratorError> {
        let path = format!(
            "/apis/metrics.k8s.io/v1beta1/namespaces/{}/pods?labelSelector={}",
            self.cfg.namespace,
            Self::container_selector(container_name)
        );
        let req = http::Request::get(path)
            .body(Vec::new())
            .map_err(|e| OrchestratorError::Other(format!("metrics request: {}", e)))?;

        let body = self.client.request_text(req).await?;
        let parsed: serde_json::Value = serde_json::from_str(&body)
            .map_err(|e| OrchestratorError::Other(format!("metrics response: {}", e)))?;

        let mut millicores = 0.0;
        if let Some(items) = parsed.get("items").and_then(|v| v.as_array()) {
            for item in items {
                if let Some(containers) = item.get("containers").and_then(|v| v.as_array()) {
                    for c in containers {
                        if let Some(q) = c
                            .get("usage")
                            .and_then(|u| u.get("cpu"))
                            .and_then(|v| v.as_str())
                        {
                            millicores += parse_cpu_quantity_millicores(q).unwrap_or(0.0);
                        }
                    }
                }
            }
        }
        Ok(millicores)
    }
}

/// hostPath volume entries need DNS-label names; volume names carry
/// underscores from the `{user}_{kind}` convention.
fn volume_name(volume: &str) -> String {
    naming::normalize_for_cluster(volume)
}

/// The deployment manifest for one session container.
fn build_deployment(cfg: &OrchestratorConfig, spec: &LaunchSpec) -> Deployment {
    let mut labels = BTreeMap::new();
    labels.insert("app".to_string(), APP_LABEL.to_string());
    labels.insert(CONTAINER_LABEL_KEY.to_string(), spec.container_name.clone());

    let volumes: Vec<Volume> = spec
        .volumes
        .iter()
        .map(|b| Volume {
            name: volume_name(&b.volume),
            host_path: Some(HostPathVolumeSource {
                path: format!("{}/{}/{}", cfg.volumes_root, spec.container_name, b.kind),
                type_: Some("DirectoryOrCreate".to_string()),
            }),
            ..Default::default()
        })
        .collect();

    let volume_mounts: Vec<VolumeMount> = spec
        .volumes
        .iter()
        .map(|b| VolumeMount {
            name: volume_name(&b.volume),
            mount_path: b.mount_point.clone(),
            ..Default::default()
        })
        .collect();

    // The image's VNC client connects to a fixed websocket path; the proxy
    // routes `/{session_id}-ws`, so the served assets are patched right
    // after the container starts.
    let rewrite_cmd = format!(
        "grep -rl websockify /usr/share/kasmvnc/www 2>/dev/null \
         | xargs -r sed -i 's|websockify|{}-ws|g' || true",
        spec.session_id
    );

    // GPU placement is a scheduling preference, not a hard requirement:
    // clusters without accelerator nodes still run the session.
    let affinity = spec.gpu.then(|| k8s_openapi::api::core::v1::Affinity {
        node_affinity: Some(NodeAffinity {
            preferred_during_scheduling_ignored_during_execution: Some(vec![
                PreferredSchedulingTerm {
                    weight: 100,
                    preference: NodeSelectorTerm {
                        match_expressions: Some(vec![NodeSelectorRequirement {
                            key: "accelerator".to_string(),
                            operator: "In".to_string(),
                            values: Some(vec!["nvidia".to_string()]),
                        }]),
                        ..Default::default()
                    },
                },
            ]),
            ..Default::default()
        }),
        ..Default::default()
    });

    let container = Container {
        name: spec.container_name.clone(),
        image: Some(format!("{}:{}", spec.image_name, spec.image_tag)),
        env: Some(vec![EnvVar {
            name: "VNC_DISABLE_AUTH".to_string(),
            value: Some("true".to_string()),
            ..Default::default()
        }]),
        ports: Some(vec![ContainerPort {
            container_port: WEB_PORT,
            ..Default::default()
        }]),
        lifecycle: Some(Lifecycle {
            post_start: Some(LifecycleHandler {
                exec: Some(ExecAction {
                    command: Some(vec![
                        "/bin/sh".to_string(),
                        "-c".to_string(),
                        rewrite_cmd,
                    ]),
                }),
                ..Default::default()
            }),
            ..Default::default()
        }),
        volume_mounts: Some(volume_mounts),
        ..Default::default()
    };

    Deployment {
        metadata: ObjectMeta {
            name: Some(KubernetesOrchestrator::deployment_name(&spec.container_name)),
            namespace: Some(cfg.namespace.clone()),
            labels: Some(labels.clone()),
            ..Default::default()
        },
        spec: Some(DeploymentSpec {
            replicas: Some(1),
            selector: LabelSelector {
                match_labels: Some(labels.clone()),
                ..Default::default()
            },
            // hostPath volumes: never run two generations at once.
            strategy: Some(DeploymentStrategy {
                type_: Some("Recreate".to_string()),
                ..Default::default()
            }),
            template: PodTemplateSpec {
                metadata: Some(ObjectMeta {
                    labels: Some(labels),
                    ..Default::default()
                }),
                spec: Some(PodSpec {
                    containers: vec![container],
                    volumes: Some(volumes),
                    affinity,
                    ..Default::default()
                }),
            },
            ..Default::default()
        }),
        ..Default::default()
    }
}

#[async_trait]
impl ContainerOrchestrator for KubernetesOrchestrator {
    fn normalize_name(&self, user: &str) -> String {
        naming::normalize_for_cluster(user)
    }

    async fn list_managed_containers(
        &self,
        prefix: &str,
    ) -> Result<HashSet<String>, OrchestratorError> {
        let listed = self
            .deployments()
            .list(&ListParams::default().labels(&format!("app={}", APP_LABEL)))
            .await?;

        Ok(listed
            .items
            .iter()
            .filter_map(|d| d.metadata.labels.as_ref())
            .filter_map(|labels| labels.get(CONTAINER_LABEL_KEY))
            .filter(|name| name.starts_with(prefix))
            .cloned()
            .collect())
    }

    async fn ensure_network(&self, name: &str) -> Result<String, OrchestratorError> {
        // Pods share the cluster network; there is no per-hub bridge to
        // create, so the configured name is the id.
        Ok(name.to_string())
    }

    async fn ensure_volume(&self, user: &str, kind: &str) -> Result<(), OrchestratorError> {
        // Volumes are hostPath directories under the shared filesystem root,
        // created on demand by the kubelet (DirectoryOrCreate).
        debug!("Volume {}_{} materializes at mount time", user, kind);
        Ok(())
    }

    async fn ensure_image(&self, name: &str, tag: &str) -> Result<(), OrchestratorError> {
        // Nodes pull the manifest's image themselves; only the reference is
        // checked here.
        if name.is_empty() || tag.is_empty() {
            return Err(OrchestratorError::Other("empty image reference".into()));
        }
        Ok(())
    }

    async fn start_container(&self, spec: &LaunchSpec) -> Result<(), OrchestratorError> {
        let deployment = Self::deployment_name(&spec.container_name);

        match self.deployments().get_opt(&deployment).await? {
            Some(_) => {
                info!("Resuming deployment {}", deployment);
                self.scale(&deployment, 1).await?;
            }
            None => {
                info!(
                    "Creating deployment {} (image {}:{}, gpu: {})",
                    deployment, spec.image_name, spec.image_tag, spec.gpu
                );
                let manifest = build_deployment(&self.cfg, spec);
                self.deployments()
                    .create(&PostParams::default(), &manifest)
                    .await?;
            }
        }

        let deadline = Instant::now() + Duration::from_secs(self.cfg.launch_timeout_secs);
        loop {
            tokio::time::sleep(Duration::from_secs(3)).await;

            if let Some(pod) = self.backing_pod(&spec.container_name).await? {
                let phase = pod
                    .status
                    .as_ref()
                    .and_then(|s| s.phase.clone())
                    .unwrap_or_default();
                match phase.as_str() {
                    "Running" => {
                        info!("Deployment {} has a running pod", deployment);
                        return Ok(());
                    }
                    "Failed" | "Succeeded" => {
                        return Err(OrchestratorError::Other(format!(
                            "pod for {} terminated during startup ({})",
                            spec.container_name, phase
                        )));
                    }
                    _ => {}
                }
            }

            if Instant::now() >= deadline {
                return Err(OrchestratorError::Other(format!(
                    "deployment {} did not produce a running pod within {}s",
                    deployment, self.cfg.launch_timeout_secs
                )));
            }
        }
    }

    async fn stop_container(&self, name: &str) -> Result<StopOutcome, OrchestratorError> {
        let deployment = Self::deployment_name(name);
        match self.scale(&deployment, 0).await {
            Ok(()) => Ok(StopOutcome::Stopped),
            Err(e) if Self::is_not_found(&e) => Ok(StopOutcome::Absent),
            Err(e) => {
                warn!("Failed to suspend {}: {}", deployment, e);
                Ok(StopOutcome::Failed)
            }
        }
    }

    async fn remove_container(&self, name: &str) -> Result<RemoveOutcome, OrchestratorError> {
        let deployment = Self::deployment_name(name);
        match self
            .deployments()
            .delete(&deployment, &DeleteParams::default())
            .await
        {
            Ok(_) => {
                debug!("Deployment {} deleted", deployment);
                Ok(RemoveOutcome::Removed)
            }
            Err(e) if Self::is_not_found(&e) => Ok(RemoveOutcome::Absent),
            Err(e) => {
                warn!("Failed to delete {}: {}", deployment, e);
                Ok(RemoveOutcome::Failed)
            }
        }
    }

    async fn container_status(&self, name: &str) -> Result<ContainerState, OrchestratorError> {
        let deployment = Self::deployment_name(name);
        match self.deployments().get_opt(&deployment).await? {
            None => Ok(ContainerState::Absent),
            Some(d) => {
                let wanted = d.spec.as_ref().and_then(|s| s.replicas).unwrap_or(0);
                let available = d
                    .status
                    .as_ref()
                    .and_then(|s| s.available_replicas)
                    .unwrap_or(0);
                Ok(if wanted == 0 {
                    ContainerState::Exited
                } else if available >= 1 {
                    ContainerState::Running
                } else {
                    ContainerState::Other("pending".to_string())
                })
            }
        }
    }

    async fn container_activity(&self, name: &str) -> Result<f64, OrchestratorError> {
        match self.container_status(name).await? {
            ContainerState::Absent => Ok(ABSENT_ACTIVITY),
            ContainerState::Exited => Ok(0.0),
            _ => {
                let millicores = self.metrics_millicores(name).await?;
                Ok(millicores_to_percent(millicores))
            }
        }
    }

    async fn container_address(
        &self,
        name: &str,
        _network: &str,
    ) -> Result<String, OrchestratorError> {
        let pod = self
            .backing_pod(name)
            .await?
            .ok_or_else(|| OrchestratorError::Other(format!("no pod backing {}", name)))?;

        let ip = pod
            .status
            .as_ref()
            .and_then(|s| s.pod_ip.clone())
            .filter(|ip| !ip.is_empty())
            .ok_or_else(|| OrchestratorError::Other(format!("pod for {} has no address yet", name)))?;

        Ok(format!("{}:{}", ip, WEB_PORT))
    }

    async fn exec_in_proxy(
        &self,
        name: &str,
        cmd: &[&str],
    ) -> Result<Option<String>, OrchestratorError> {
        // The proxy pod carries a generated name; find it by prefix.
        let listed = self.pods().list(&ListParams::default()).await?;
        let Some(pod_name) = listed
            .items
            .iter()
            .filter_map(|p| p.metadata.name.as_deref())
            .find(|n| n.starts_with(name))
            .map(String::from)
        else {
            return Ok(None);
        };

        let params = AttachParams::default().stdout(true).stderr(true);
        let mut attached = match self.pods().exec(&pod_name, cmd.to_vec(), &params).await {
            Ok(attached) => attached,
            Err(e) => {
                debug!("Proxy exec in {} failed: {}", pod_name, e);
                return Ok(None);
            }
        };

        let mut output = String::new();
        if let Some(mut stdout) = attached.stdout() {
            let _ = stdout.read_to_string(&mut output).await;
        }
        let _ = attached.join().await;
        Ok(Some(output))
    }

    async fn bring_up_base(&self) -> Result<(), OrchestratorError> {
        // Base services (proxy, directory) are provisioned with the cluster;
        // the hub only scales them back up when something left them at zero.
        let listed = self
            .deployments()
            .list(&ListParams::default().labels(&format!("{}=true", BASE_LABEL_KEY)))
            .await?;

        for d in listed.items {
            let Some(name) = d.metadata.name.clone() else {
                continue;
            };
            let wanted = d.spec.as_ref().and_then(|s| s.replicas).unwrap_or(0);
            if wanted == 0 {
                info!("Scaling base service {} back up", name);
                self.scale(&name, 1).await?;
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use uuid::Uuid;

    fn launch_spec() -> LaunchSpec {
        LaunchSpec {
            container_name: "tds-free-user".to_string(),
            image_name: "opendx-slicer".to_string(),
            image_tag: "latest".to_string(),
            network: "tdslicerhub_network".to_string(),
            volumes: crate::orchestrator::user_volume_bindings("free-user"),
            session_id: Uuid::new_v4(),
            gpu: false,
        }
    }

    fn orchestrator_cfg() -> OrchestratorConfig {
        OrchestratorConfig {
            kind: crate::config::OrchestratorKind::Kubernetes,
            network_name: "tdslicerhub_network".to_string(),
            image_name: "opendx-slicer".to_string(),
            image_tag: "latest".to_string(),
            vnc_base_image_name: "vnc-base".to_string(),
            vnc_base_image_tag: "latest".to_string(),
            slicer_image_dockerfile: None,
            vnc_base_image_dockerfile: None,
            launch_timeout_secs: 120,
            namespace: "tsliceh".to_string(),
            volumes_root: "/mnt/nfs/tdslicerhub".to_string(),
        }
    }

    #[test]
    fn test_deployment_name() {
        assert_eq!(
            KubernetesOrchestrator::deployment_name("tds-free-user"),
            "deploy-tds-free-user"
        );
    }

    #[test]
    fn test_volume_name_is_dns_safe() {
        assert_eq!(volume_name("pmoreno_cache_apt"), "pmoreno-cache-apt");
    }

    #[test]
    fn test_manifest_shape() {
        let spec = launch_spec();
        let manifest = build_deployment(&orchestrator_cfg(), &spec);

        assert_eq!(
            manifest.metadata.name.as_deref(),
            Some("deploy-tds-free-user")
        );
        let labels = manifest.metadata.labels.as_ref().unwrap();
        assert_eq!(labels.get("app").map(String::as_str), Some(APP_LABEL));
        assert_eq!(
            labels.get(CONTAINER_LABEL_KEY).map(String::as_str),
            Some("tds-free-user")
        );

        let dspec = manifest.spec.as_ref().unwrap();
        assert_eq!(dspec.replicas, Some(1));

        let pod_spec = dspec.template.spec.as_ref().unwrap();
        assert_eq!(pod_spec.containers.len(), 1);
        assert!(pod_spec.affinity.is_none());

        // Volumes land under the shared root, one subdirectory per kind.
        let volumes = pod_spec.volumes.as_ref().unwrap();
        assert_eq!(volumes.len(), 3);
        let host_path = volumes[0].host_path.as_ref().unwrap();
        assert_eq!(
            host_path.path,
            "/mnt/nfs/tdslicerhub/tds-free-user/cache_apt"
        );
    }

    #[test]
    fn test_manifest_poststart_rewrites_websocket_path() {
        let spec = launch_spec();
        let manifest = build_deployment(&orchestrator_cfg(), &spec);

        let container = &manifest.spec.unwrap().template.spec.unwrap().containers[0];
        let hook = container
            .lifecycle
            .as_ref()
            .and_then(|l| l.post_start.as_ref())
            .and_then(|h| h.exec.as_ref())
            .and_then(|e| e.command.as_ref())
            .unwrap()
            .join(" ");
        assert!(hook.contains(&format!("{}-ws", spec.session_id)));
    }

    #[test]
    fn test_manifest_gpu_preference() {
        let mut spec = launch_spec();
        spec.gpu = true;
        let manifest = build_deployment(&orchestrator_cfg(), &spec);

        let pod_spec = manifest.spec.unwrap().template.spec.unwrap();
        let affinity = pod_spec.affinity.expect("gpu launches carry affinity");
        let preferred = affinity
            .node_affinity
            .unwrap()
            .preferred_during_scheduling_ignored_during_execution
            .unwrap();
        assert_eq!(preferred.len(), 1);
    }
}
