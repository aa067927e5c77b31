// BSD 3-Clause License
// Copyright (c) 2025, OpenDX - TDSlicerHub
//! Configuration loading from environment variables

use std::env;
use std::str::FromStr;
use std::time::Duration;

use tracing::{info, warn};

use super::error::ConfigError;
use super::types::*;

impl Config {
    pub fn from_env() -> Result<Self, ConfigError> {
        if let Err(e) = dotenvy::dotenv() {
            if e.not_found() {
                info!("No .env file found, using environment variables only");
            } else {
                warn!("Error loading .env file: {}", e);
            }
        }

        let host = env_or("TDSLICERHUB_HOST", "0.0.0.0");
        let port = env_parse("TDSLICERHUB_PORT", 8000u16)?;
        let listen_addr =
            format!("{}:{}", host, port)
                .parse()
                .map_err(|e| ConfigError::InvalidValue {
                    key: "TDSLICERHUB_HOST/PORT".to_string(),
                    value: format!("{}:{}", host, port),
                    reason: format!("Invalid socket address: {}", e),
                })?;

        let kind = env_parse(
            "CONTAINER_ORCHESTRATOR",
            OrchestratorKind::Compose,
        )?;

        Ok(Config {
            server: ServerConfig {
                host,
                port,
                listen_addr,
                hub_name: env_or("TDSLICERHUB_NAME", "tdslicerhub"),
                admin_users: env_list("HUB_ADMIN_USERS", vec!["admin".to_string()]),
            },
            database: DatabaseConfig {
                connection_string: env::var("DB_CONNECTION_STRING").map_err(|_| {
                    ConfigError::MissingRequired {
                        key: "DB_CONNECTION_STRING".to_string(),
                    }
                })?,
                max_connections: env_parse("DB_MAX_CONNECTIONS", 20u32)?,
                min_connections: env_parse("DB_MIN_CONNECTIONS", 2u32)?,
                connect_timeout_secs: env_parse("DB_CONNECT_TIMEOUT", 10u64)?,
                idle_timeout_secs: env_parse("DB_IDLE_TIMEOUT", 600u64)?,
            },
            orchestrator: OrchestratorConfig {
                kind,
                network_name: env_or("NETWORK_NAME", "tdslicerhub_network"),
                image_name: env_or("TDSLICER_IMAGE_NAME", "opendx-slicer"),
                image_tag: env_or("TDSLICER_IMAGE_TAG", "latest"),
                vnc_base_image_name: env_or("VNC_BASE_IMAGE_NAME", "vnc-base"),
                vnc_base_image_tag: env_or("VNC_BASE_IMAGE_TAG", "latest"),
                slicer_image_dockerfile: env::var("SLICER_IMAGE_DOCKERFILE").ok(),
                vnc_base_image_dockerfile: env::var("VNC_BASE_IMAGE_DOCKERFILE").ok(),
                launch_timeout_secs: env_parse("LAUNCH_TIMEOUT_SEC", 120u64)?,
                namespace: env_or("KUBE_NAMESPACE", "tsliceh"),
                volumes_root: env_or("NFS_VOLUMES_ROOT", "/mnt/nfs/tdslicerhub"),
            },
            proxy: ProxyConfig {
                nginx_name: env_or("NGINX_NAME", "tdslicerhub-nginx"),
                nginx_config_file: env_or("NGINX_CONFIG_FILE", "/etc/nginx/nginx.conf"),
                index_path: env::var("INDEX_PATH").ok(),
            },
            session: SessionConfig {
                max_sessions: env_parse("MAX_SESSIONS", 10u32)?,
                inactivity_time_secs: env_parse("INACTIVITY_TIME_SEC", 300u64)?,
                activity_threshold_pct: env_parse("ACTIVITY_THRESHOLD_PCT", 10.0f64)?,
                check_interval_secs: env_parse("CHECK_INTERVAL_SEC", 60u64)?,
            },
            directory: DirectoryConfig {
                host: env_or("OPENLDAP_NAME", "tdslicerhub-openldap"),
                port: env_parse("OPENLDAP_PORT", 389u16)?,
                base_dn: env_or("OPENLDAP_BASE_DN", "dc=opendx,dc=org"),
                org_unit: env_or("OPENLDAP_OU", "slicerhub"),
                dev_user_pattern: env_or("DEV_LOGIN_PATTERN", "^free_user.*$"),
                dev_password: env_or("DEV_LOGIN_PASSWORD", "test"),
            },
            domain: DomainConfig {
                mode: env_parse("MODE", Mode::Local)?,
                proto: env_or("PROTO", "http"),
                domain: env_or("DOMAIN", "localhost"),
                port: env_parse("PORT", 80u16)?,
            },
        })
    }

    pub fn inactivity_timeout(&self) -> Duration {
        Duration::from_secs(self.session.inactivity_time_secs)
    }

    pub fn check_interval(&self) -> Duration {
        Duration::from_secs(self.session.check_interval_secs)
    }

    pub fn launch_timeout(&self) -> Duration {
        Duration::from_secs(self.orchestrator.launch_timeout_secs)
    }
}

pub fn env_or(key: &str, default: &str) -> String {
    env::var(key).unwrap_or_else(|_| default.to_string())
}

pub fn env_parse<T>(key: &str, default: T) -> Result<T, ConfigError>
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    match env::var(key) {
        Ok(value) => value.parse().map_err(|e| ConfigError::ParseError {
            key: key.to_string(),
            message: format!("{}", e),
        }),
        Err(_) => Ok(default),
    }
}

pub fn env_list(key: &str, default: Vec<String>) -> Vec<String> {
    match env::var(key) {
        Ok(value) => value
            .split(',')
            .map(|s| s.trim().to_string())
            .filter(|s| !s.is_empty())
            .collect(),
        Err(_) => default,
    }
}
