// BSD 3-Clause License
// Copyright (c) 2025, OpenDX - TDSlicerHub
//
//! Configuration validation

use tracing::{info, warn};

use super::error::ConfigError;
use super::types::Config;

impl Config {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.server.port == 0 {
            return Err(ConfigError::InvalidValue {
                key: "TDSLICERHUB_PORT".to_string(),
                value: "0".to_string(),
                reason: "Port cannot be 0".to_string(),
            });
        }

        if self.proxy.nginx_config_file.is_empty() {
            return Err(ConfigError::InvalidValue {
                key: "NGINX_CONFIG_FILE".to_string(),
                value: String::new(),
                reason: "A path for the generated nginx configuration is required".to_string(),
            });
        }

        if self.session.max_sessions == 0 {
            return Err(ConfigError::InvalidValue {
                key: "MAX_SESSIONS".to_string(),
                value: "0".to_string(),
                reason: "Capacity cannot be 0".to_string(),
            });
        }

        if !(0.0..=100.0).contains(&self.session.activity_threshold_pct) {
            return Err(ConfigError::InvalidValue {
                key: "ACTIVITY_THRESHOLD_PCT".to_string(),
                value: self.session.activity_threshold_pct.to_string(),
                reason: "Threshold must be between 0 and 100".to_string(),
            });
        }

        if self.session.unlimited() {
            info!(
                "MAX_SESSIONS={} interpreted as unlimited",
                self.session.max_sessions
            );
        }

        if self.session.inactivity_time_secs < self.session.check_interval_secs {
            warn!(
                "Inactivity timeout ({}s) is shorter than the reaper period ({}s); \
                 sessions retire on the first idle tick",
                self.session.inactivity_time_secs, self.session.check_interval_secs
            );
        }

        Ok(())
    }
}
