//! Reverse-proxy reconciliation.
//!
//! The nginx configuration is a pure function of the current session set.
//! Reconciliation regenerates the whole document, replaces the file
//! atomically, and commands the proxy to reload. Only one reconciliation
//! runs at a time; a torn config file is never observable.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use crate::config::ProxyConfig;
use crate::db::{self, DbPool, Session};
use crate::errors::HubError;
use crate::orchestrator::{ContainerOrchestrator, ContainerState};
use crate::pages;

/// Bounded reload polling: attempts times delay.
const RELOAD_ATTEMPTS: u32 = 10;
const RELOAD_DELAY: Duration = Duration::from_secs(2);

pub struct ProxyReconciler {
    orchestrator: Arc<dyn ContainerOrchestrator>,
    cfg: ProxyConfig,
    /// Upstream for the proxy's root route, `host:port` of the hub itself.
    hub_upstream: String,
    lock: Mutex<()>,
}

impl ProxyReconciler {
    pub fn new(
        orchestrator: Arc<dyn ContainerOrchestrator>,
        cfg: ProxyConfig,
        hub_upstream: String,
    ) -> Self {
        Self {
            orchestrator,
            cfg,
            hub_upstream,
            lock: Mutex::new(()),
        }
    }

    /// Regenerate the proxy configuration from the session table, replace the
    /// file atomically, and ask nginx to reload. The reload is best-effort:
    /// the reaper re-runs reconciliation on its next tick.
    pub async fn reconcile(&self, pool: &DbPool) -> anyhow::Result<()> {
        let _guard = self.lock.lock().await;

        let sessions = db::sessions::list_all(pool).await?;
        let document = render_nginx_conf(&self.hub_upstream, &sessions);
        replace_file(&self.cfg.nginx_config_file, &document).await?;
        debug!(
            "Wrote proxy configuration for {} session(s) to {}",
            sessions.len(),
            self.cfg.nginx_config_file
        );

        if let Some(ref index_path) = self.cfg.index_path {
            let landing = pages::landing_page(&sessions, false);
            replace_file(index_path, &landing).await?;
        }

        if let Err(e) = self.reload().await {
            warn!("Proxy reload failed (will retry on the next pass): {}", e);
        }
        Ok(())
    }

    async fn reload(&self) -> Result<(), HubError> {
        let nginx = &self.cfg.nginx_name;

        for attempt in 1..=RELOAD_ATTEMPTS {
            match self.orchestrator.container_status(nginx).await {
                Ok(ContainerState::Running) => {
                    match self
                        .orchestrator
                        .exec_in_proxy(nginx, &["nginx", "-s", "reload"])
                        .await
                    {
                        Ok(Some(_)) => {
                            info!("Proxy {} reloaded", nginx);
                            return Ok(());
                        }
                        Ok(None) => {
                            debug!("Proxy {} not ready for reload yet", nginx);
                        }
                        Err(e) => {
                            debug!("Proxy reload command failed (attempt {}): {}", attempt, e);
                        }
                    }
                }
                Ok(ContainerState::Absent) => {
                    warn!("Proxy {} is absent, bringing base services up", nginx);
                    if let Err(e) = self.orchestrator.bring_up_base().await {
                        warn!("bring_up_base failed: {}", e);
                    }
                }
                Ok(state) => {
                    debug!("Proxy {} not running yet ({:?})", nginx, state);
                }
                Err(e) => {
                    debug!("Proxy status check failed (attempt {}): {}", attempt, e);
                }
            }
            tokio::time::sleep(RELOAD_DELAY).await;
        }

        Err(HubError::ProxyReloadFailed(format!(
            "proxy {} did not accept a reload within {} attempts",
            nginx, RELOAD_ATTEMPTS
        )))
    }
}

/// Atomically replace `path`: write a sibling temp file, then rename over.
/// The temp file sits next to the target so the rename stays on one
/// filesystem; readers observe either the old document or the new one.
pub async fn replace_file(path: &str, content: &str) -> std::io::Result<()> {
    let tmp = format!("{}.new", path);
    tokio::fs::write(&tmp, content).await?;
    tokio::fs::rename(&tmp, path).await
}

/// The full nginx document: fixed preamble, root route to the hub, and two
/// location blocks per session with a reachable address.
pub fn render_nginx_conf(hub_upstream: &str, sessions: &[Session]) -> String {
    let mut out = format!(
        r#"worker_processes 1;

events {{
    worker_connections 1024;
}}

http {{
    log_format main '$remote_addr - $remote_user [$time_local] "$request" '
                    '$status $body_bytes_sent "$http_referer"';
    access_log /var/log/nginx/access.log main;

    server {{
        listen 80;

        location / {{
            proxy_pass http://{hub_upstream};
        }}
"#
    );

    for session in sessions {
        let Some(ref address) = session.service_address else {
            continue;
        };

        out.push_str(&format!(
            r#"
        location /{id}/ {{
            proxy_pass http://{addr}/;
            proxy_set_header Host $host;
            proxy_set_header X-Real-IP $remote_addr;
            proxy_set_header X-Forwarded-For $proxy_add_x_forwarded_for;
            proxy_set_header X-Forwarded-Proto $scheme;
        }}

        location /{id}-ws {{
            proxy_pass http://{addr}/websockify;
            proxy_http_version 1.1;
            proxy_set_header Upgrade $http_upgrade;
            proxy_set_header Connection "upgrade";
            proxy_read_timeout 86400;
            proxy_buffering off;
            proxy_cache off;
        }}
"#,
            id = session.id,
            addr = address
        ));
    }

    out.push_str("    }\n}\n");
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use uuid::Uuid;

    fn session(address: Option<&str>) -> Session {
        Session {
            id: Uuid::new_v4(),
            username: "free_user".to_string(),
            created_at: Utc::now(),
            last_activity: Utc::now(),
            url_path: "/x/".to_string(),
            service_address: address.map(String::from),
            container_name: "tds-free_user".to_string(),
            restart: false,
            gpu: false,
            info: serde_json::json!({}),
        }
    }

    #[test]
    fn test_render_includes_reachable_sessions_only() {
        let reachable = session(Some("172.18.0.5:6901"));
        let pending = session(None);
        let doc = render_nginx_conf("tdslicerhub:8000", &[reachable.clone(), pending.clone()]);

        assert!(doc.contains(&format!("location /{}/ ", reachable.id)));
        assert!(doc.contains(&format!("location /{}-ws ", reachable.id)));
        assert!(doc.contains("proxy_pass http://172.18.0.5:6901/;"));
        assert!(doc.contains("proxy_pass http://172.18.0.5:6901/websockify;"));
        assert!(!doc.contains(&pending.id.to_string()));
    }

    #[test]
    fn test_render_root_route_and_preamble() {
        let doc = render_nginx_conf("tdslicerhub:8000", &[]);
        assert!(doc.starts_with("worker_processes 1;"));
        assert!(doc.contains("listen 80;"));
        assert!(doc.contains("proxy_pass http://tdslicerhub:8000;"));
    }

    #[test]
    fn test_render_is_deterministic() {
        let sessions = vec![session(Some("10.0.0.2:6901")), session(Some("10.0.0.3:6901"))];
        let a = render_nginx_conf("hub:8000", &sessions);
        let b = render_nginx_conf("hub:8000", &sessions);
        assert_eq!(a, b);
    }

    #[test]
    fn test_ws_block_has_upgrade_headers() {
        let s = session(Some("10.0.0.2:6901"));
        let doc = render_nginx_conf("hub:8000", &[s]);
        assert!(doc.contains("proxy_set_header Upgrade $http_upgrade;"));
        assert!(doc.contains("proxy_set_header Connection \"upgrade\";"));
        assert!(doc.contains("proxy_cache off;"));
    }

    #[tokio::test]
    async fn test_replace_file_is_full_replacement() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nginx.conf");
        let path_str = path.to_str().unwrap();

        replace_file(path_str, "first document").await.unwrap();
        assert_eq!(std::fs::read_to_string(&path).unwrap(), "first document");

        replace_file(path_str, "second document").await.unwrap();
        assert_eq!(std::fs::read_to_string(&path).unwrap(), "second document");

        // No temp residue left behind.
        assert!(!dir.path().join("nginx.conf.new").exists());
    }
}
