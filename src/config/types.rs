// BSD 3-Clause License
// Copyright (c) 2025, OpenDX - TDSlicerHub
//
//! Configuration type definitions
//! All configuration structs and enums used throughout the hub.

use std::net::SocketAddr;
use std::str::FromStr;

/// Main application configuration
#[derive(Debug, Clone)]
pub struct Config {
    pub server: ServerConfig,
    pub database: DatabaseConfig,
    pub orchestrator: OrchestratorConfig,
    pub proxy: ProxyConfig,
    pub session: SessionConfig,
    pub directory: DirectoryConfig,
    pub domain: DomainConfig,
}

/// Hub server binding configuration
#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
    pub listen_addr: SocketAddr,
    /// Name under which the proxy reaches the hub (root route target).
    pub hub_name: String,
    /// Users allowed to see every session on the landing page.
    pub admin_users: Vec<String>,
}

/// Session store configuration
#[derive(Debug, Clone)]
pub struct DatabaseConfig {
    pub connection_string: String,
    pub max_connections: u32,
    pub min_connections: u32,
    pub connect_timeout_secs: u64,
    pub idle_timeout_secs: u64,
}

/// Which container orchestrator backend to drive
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OrchestratorKind {
    Compose,
    Kubernetes,
}

impl FromStr for OrchestratorKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "docker_compose" | "compose" | "docker" => Ok(OrchestratorKind::Compose),
            "kubernetes" | "k8s" | "cluster" => Ok(OrchestratorKind::Kubernetes),
            _ => Err(format!("Unknown orchestrator: {}", s)),
        }
    }
}

impl std::fmt::Display for OrchestratorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            OrchestratorKind::Compose => write!(f, "docker_compose"),
            OrchestratorKind::Kubernetes => write!(f, "kubernetes"),
        }
    }
}

/// Container orchestrator configuration
#[derive(Debug, Clone)]
pub struct OrchestratorConfig {
    pub kind: OrchestratorKind,
    pub network_name: String,
    /// Image run for every session container.
    pub image_name: String,
    pub image_tag: String,
    /// Base image the session image is layered on.
    pub vnc_base_image_name: String,
    pub vnc_base_image_tag: String,
    /// Build context for the session image when it is locally managed.
    pub slicer_image_dockerfile: Option<String>,
    /// Build context for the VNC base image.
    pub vnc_base_image_dockerfile: Option<String>,
    /// Bounded wait for a launched container to report running.
    pub launch_timeout_secs: u64,
    /// Cluster namespace (cluster backend only).
    pub namespace: String,
    /// Root of the shared filesystem backing per-user volumes (cluster backend only).
    pub volumes_root: String,
}

/// Reverse proxy configuration
#[derive(Debug, Clone)]
pub struct ProxyConfig {
    /// Container/pod name of the nginx proxy.
    pub nginx_name: String,
    /// Path of the nginx configuration document the hub owns.
    pub nginx_config_file: String,
    /// Optional path to persist the landing page on every reconciliation.
    pub index_path: Option<String>,
}

/// Session lifecycle configuration
#[derive(Debug, Clone)]
pub struct SessionConfig {
    /// Capacity; values >= 1000 mean unlimited.
    pub max_sessions: u32,
    pub inactivity_time_secs: u64,
    /// CPU percentage above which a container counts as active.
    pub activity_threshold_pct: f64,
    /// Reaper steady-state period.
    pub check_interval_secs: u64,
}

impl SessionConfig {
    pub fn unlimited(&self) -> bool {
        self.max_sessions >= 1000
    }
}

/// Directory service (credential check) configuration
#[derive(Debug, Clone)]
pub struct DirectoryConfig {
    pub host: String,
    pub port: u16,
    pub base_dn: String,
    pub org_unit: String,
    /// Development fallback: usernames matching this pattern may log in with
    /// `dev_password` when the directory is unreachable.
    pub dev_user_pattern: String,
    pub dev_password: String,
}

impl DirectoryConfig {
    pub fn url(&self) -> String {
        format!("ldap://{}:{}", self.host, self.port)
    }
}

/// Deployment mode for base URL construction
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Mode {
    Local,
    Online,
}

impl FromStr for Mode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "local" | "" => Ok(Mode::Local),
            "online" | "public" => Ok(Mode::Online),
            _ => Err(format!("Unknown mode: {}", s)),
        }
    }
}

/// Externally visible base URL configuration
#[derive(Debug, Clone)]
pub struct DomainConfig {
    pub mode: Mode,
    pub proto: String,
    pub domain: String,
    pub port: u16,
}
