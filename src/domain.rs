//! Externally visible base URL resolution.
//!
//! Local mode takes host and port straight from configuration. Otherwise the
//! machine's public address is probed once and matched against the
//! authoritative domain; a mismatch is logged but the configured domain wins.

use std::time::Duration;

use tokio::sync::OnceCell;
use tracing::{info, warn};

use crate::config::{DomainConfig, Mode};

const IP_PROBE_URL: &str = "https://api.ipify.org";

pub struct DomainResolver {
    cfg: DomainConfig,
    resolved: OnceCell<String>,
}

impl DomainResolver {
    pub fn new(cfg: &DomainConfig) -> Self {
        Self {
            cfg: cfg.clone(),
            resolved: OnceCell::new(),
        }
    }

    /// The hub's public base URL, resolved once per process.
    pub async fn base_url(&self) -> String {
        self.resolved
            .get_or_init(|| async { self.resolve().await })
            .await
            .clone()
    }

    async fn resolve(&self) -> String {
        match self.cfg.mode {
            Mode::Local => format_base(&self.cfg.proto, &self.cfg.domain, self.cfg.port),
            Mode::Online => {
                match public_ip().await {
                    Ok(probe) => match resolve_domain(&self.cfg.domain).await {
                        Some(ips) if ips.iter().any(|ip| ip == &probe) => {
                            info!("Public address {} matches domain {}", probe, self.cfg.domain);
                        }
                        Some(ips) => {
                            warn!(
                                "Public address {} does not match domain {} ({:?})",
                                probe, self.cfg.domain, ips
                            );
                        }
                        None => {
                            warn!("Domain {} did not resolve", self.cfg.domain);
                        }
                    },
                    Err(e) => {
                        warn!("Public IP probe failed: {}", e);
                    }
                }
                format_base(&self.cfg.proto, &self.cfg.domain, self.cfg.port)
            }
        }
    }
}

async fn public_ip() -> Result<String, reqwest::Error> {
    let client = reqwest::Client::builder()
        .timeout(Duration::from_secs(10))
        .build()?;
    let ip = client.get(IP_PROBE_URL).send().await?.text().await?;
    Ok(ip.trim().to_string())
}

async fn resolve_domain(domain: &str) -> Option<Vec<String>> {
    let addrs = tokio::net::lookup_host((domain, 80)).await.ok()?;
    let ips: Vec<String> = addrs.map(|a| a.ip().to_string()).collect();
    (!ips.is_empty()).then_some(ips)
}

/// `proto://host[:port]`, omitting the scheme's default port.
fn format_base(proto: &str, host: &str, port: u16) -> String {
    let default = matches!((proto, port), ("http", 80) | ("https", 443));
    if default {
        format!("{}://{}", proto, host)
    } else {
        format!("{}://{}:{}", proto, host, port)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_format_base_omits_default_ports() {
        assert_eq!(format_base("http", "localhost", 80), "http://localhost");
        assert_eq!(format_base("https", "hub.example.org", 443), "https://hub.example.org");
        assert_eq!(format_base("http", "localhost", 8080), "http://localhost:8080");
    }

    #[tokio::test]
    async fn test_local_mode_uses_configuration() {
        let resolver = DomainResolver::new(&DomainConfig {
            mode: Mode::Local,
            proto: "http".to_string(),
            domain: "localhost".to_string(),
            port: 8080,
        });
        assert_eq!(resolver.base_url().await, "http://localhost:8080");
        // Resolved once, served from cache afterwards.
        assert_eq!(resolver.base_url().await, "http://localhost:8080");
    }
}
