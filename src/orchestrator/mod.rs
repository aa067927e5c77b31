//! Container orchestrator abstraction.
//!
//! One capability set, two interchangeable backends: a single-host engine
//! driving the local container daemon, and a cluster scheduler expressing
//! each session as a single-replica deployment. The hub only ever talks to
//! the trait.

mod compose;
mod kubernetes;

use std::collections::HashSet;
use std::sync::Arc;

use async_trait::async_trait;
use uuid::Uuid;

use crate::config::{Config, OrchestratorKind};

pub use compose::ComposeOrchestrator;
pub use kubernetes::KubernetesOrchestrator;

/// Activity value reported for a container that does not exist.
pub const ABSENT_ACTIVITY: f64 = -1.0;

/// Image names starting with this prefix are built locally from a Dockerfile
/// source instead of pulled from a registry.
pub const MANAGED_IMAGE_PREFIX: &str = "opendx";

/// The fixed set of persistent volumes bound into every session container.
/// Volume names are `{user}_{kind}`; volumes outlive containers.
pub const VOLUME_KINDS: &[(&str, &str)] = &[
    ("cache_apt", "/var/cache/apt"),
    ("logs", "/var/log"),
    ("documents", "/home/researcher/Documents"),
];

#[derive(Debug, thiserror::Error)]
pub enum OrchestratorError {
    #[error("daemon error: {0}")]
    Daemon(#[from] bollard::errors::Error),

    #[error("cluster error: {0}")]
    Cluster(#[from] kube::Error),

    #[error("{0}")]
    Other(String),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ContainerState {
    Running,
    Exited,
    Absent,
    Other(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopOutcome {
    Stopped,
    Failed,
    Absent,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RemoveOutcome {
    Removed,
    Failed,
    Absent,
}

/// A named volume bound at a mount point inside the container.
#[derive(Debug, Clone)]
pub struct VolumeBinding {
    pub volume: String,
    pub kind: String,
    pub mount_point: String,
}

/// Everything a backend needs to launch one session container.
#[derive(Debug, Clone)]
pub struct LaunchSpec {
    pub container_name: String,
    pub image_name: String,
    pub image_tag: String,
    pub network: String,
    pub volumes: Vec<VolumeBinding>,
    pub session_id: Uuid,
    pub gpu: bool,
}

/// The volume bindings for a given user, in declaration order.
pub fn user_volume_bindings(user: &str) -> Vec<VolumeBinding> {
    VOLUME_KINDS
        .iter()
        .map(|(kind, mount)| VolumeBinding {
            volume: format!("{}_{}", user, kind),
            kind: (*kind).to_string(),
            mount_point: (*mount).to_string(),
        })
        .collect()
}

#[async_trait]
pub trait ContainerOrchestrator: Send + Sync {
    /// Deterministic, idempotent, backend-safe rendering of a user identity.
    fn normalize_name(&self, user: &str) -> String;

    /// Every container whose name starts with `prefix`.
    async fn list_managed_containers(
        &self,
        prefix: &str,
    ) -> Result<HashSet<String>, OrchestratorError>;

    /// Idempotently ensure the session network exists, returning its id.
    async fn ensure_network(&self, name: &str) -> Result<String, OrchestratorError>;

    /// Idempotently ensure one of a user's persistent volumes exists.
    async fn ensure_volume(&self, user: &str, kind: &str) -> Result<(), OrchestratorError>;

    /// Idempotently ensure the image is available: pull from a registry, or
    /// build from a Dockerfile source when the name is locally managed.
    async fn ensure_image(&self, name: &str, tag: &str) -> Result<(), OrchestratorError>;

    /// Launch one session container and wait (bounded) until it reports
    /// running; returns early with an error when it exits first. The GPU
    /// request is advisory.
    async fn start_container(&self, spec: &LaunchSpec) -> Result<(), OrchestratorError>;

    async fn stop_container(&self, name: &str) -> Result<StopOutcome, OrchestratorError>;

    async fn remove_container(&self, name: &str) -> Result<RemoveOutcome, OrchestratorError>;

    async fn container_status(&self, name: &str) -> Result<ContainerState, OrchestratorError>;

    /// Instantaneous CPU percentage; `ABSENT_ACTIVITY` when the container
    /// does not exist. Higher means busier.
    async fn container_activity(&self, name: &str) -> Result<f64, OrchestratorError>;

    /// `host:port` at which the proxy reaches the container.
    async fn container_address(
        &self,
        name: &str,
        network: &str,
    ) -> Result<String, OrchestratorError>;

    /// Run a command inside the proxy container; `None` means the proxy is
    /// not up yet.
    async fn exec_in_proxy(
        &self,
        name: &str,
        cmd: &[&str],
    ) -> Result<Option<String>, OrchestratorError>;

    /// Idempotently ensure the proxy and directory-service base services run.
    async fn bring_up_base(&self) -> Result<(), OrchestratorError>;
}

/// Build the configured backend.
pub async fn from_config(cfg: &Config) -> anyhow::Result<Arc<dyn ContainerOrchestrator>> {
    match cfg.orchestrator.kind {
        OrchestratorKind::Compose => {
            Ok(Arc::new(ComposeOrchestrator::connect(&cfg.orchestrator).await?))
        }
        OrchestratorKind::Kubernetes => {
            Ok(Arc::new(KubernetesOrchestrator::connect(&cfg.orchestrator).await?))
        }
    }
}

/// CPU percentage from successive usage samples:
/// `(container delta / system delta) * 100 * online CPUs`.
pub fn cpu_percent_from_deltas(container_delta: u64, system_delta: u64, online_cpus: u64) -> f64 {
    if system_delta == 0 {
        return 0.0;
    }
    (container_delta as f64 / system_delta as f64) * 100.0 * online_cpus as f64
}

/// Scheduler CPU quantity ("250m", "1", "1500000n", "2500u") to millicores.
pub fn parse_cpu_quantity_millicores(q: &str) -> Option<f64> {
    let q = q.trim();
    if q.is_empty() {
        return None;
    }
    if let Some(v) = q.strip_suffix('n') {
        return v.parse::<f64>().ok().map(|n| n / 1_000_000.0);
    }
    if let Some(v) = q.strip_suffix('u') {
        return v.parse::<f64>().ok().map(|n| n / 1_000.0);
    }
    if let Some(v) = q.strip_suffix('m') {
        return v.parse::<f64>().ok();
    }
    q.parse::<f64>().ok().map(|cores| cores * 1000.0)
}

/// Millicores to the percentage unit the reaper consumes.
pub fn millicores_to_percent(millicores: f64) -> f64 {
    (millicores / 1000.0) * 100.0
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cpu_percent_from_deltas() {
        // Container consumed half of the system delta on a 2-CPU box.
        let pct = cpu_percent_from_deltas(500, 1000, 2);
        assert!((pct - 100.0).abs() < f64::EPSILON);
    }

    #[test]
    fn test_cpu_percent_zero_system_delta() {
        assert_eq!(cpu_percent_from_deltas(500, 0, 4), 0.0);
    }

    #[test]
    fn test_parse_cpu_quantities() {
        assert_eq!(parse_cpu_quantity_millicores("250m"), Some(250.0));
        assert_eq!(parse_cpu_quantity_millicores("1"), Some(1000.0));
        assert_eq!(parse_cpu_quantity_millicores("1500000n"), Some(1.5));
        assert_eq!(parse_cpu_quantity_millicores("2500u"), Some(2.5));
        assert_eq!(parse_cpu_quantity_millicores(""), None);
        assert_eq!(parse_cpu_quantity_millicores("abc"), None);
    }

    #[test]
    fn test_millicores_to_percent() {
        assert!((millicores_to_percent(1000.0) - 100.0).abs() < f64::EPSILON);
        assert!((millicores_to_percent(250.0) - 25.0).abs() < f64::EPSILON);
    }

    #[test]
    fn test_user_volume_bindings() {
        let binds = user_volume_bindings("pmoreno");
        assert_eq!(binds.len(), 3);
        assert_eq!(binds[0].volume, "pmoreno_cache_apt");
        assert_eq!(binds[0].kind, "cache_apt");
        assert_eq!(binds[0].mount_point, "/var/cache/apt");
        assert_eq!(binds[2].volume, "pmoreno_documents");
    }
}
