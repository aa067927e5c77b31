//! Background reconciliation between the session table, the orchestrator,
//! and the proxy.
//!
//! One long-lived task. A startup pass runs exactly once and to completion
//! before the steady-state loop begins: it re-associates or retires every
//! persisted session and removes managed containers nobody owns. The steady
//! loop then samples per-container CPU each period and retires sessions that
//! stayed idle past the inactivity timeout.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::time::interval;
use tracing::{debug, error, info, warn};

use crate::config::{OrchestratorConfig, SessionConfig};
use crate::db::{self, DbPool, Session};
use crate::naming::CONTAINER_NAME_PREFIX;
use crate::orchestrator::{self, ContainerOrchestrator, LaunchSpec};
use crate::proxy::ProxyReconciler;

pub struct Reaper {
    pool: DbPool,
    orchestrator: Arc<dyn ContainerOrchestrator>,
    proxy: Arc<ProxyReconciler>,
    session_cfg: SessionConfig,
    orch_cfg: OrchestratorConfig,
}

impl Reaper {
    pub fn new(
        pool: DbPool,
        orchestrator: Arc<dyn ContainerOrchestrator>,
        proxy: Arc<ProxyReconciler>,
        session_cfg: SessionConfig,
        orch_cfg: OrchestratorConfig,
    ) -> Self {
        Self {
            pool,
            orchestrator,
            proxy,
            session_cfg,
            orch_cfg,
        }
    }

    /// Run forever. The startup pass is retried until it completes; only
    /// then does the steady-state loop start.
    pub async fn run(self: Arc<Self>) {
        loop {
            match self.startup_pass().await {
                Ok(()) => break,
                Err(e) => {
                    error!("Startup reconciliation failed, retrying: {}", e);
                    tokio::time::sleep(Duration::from_secs(10)).await;
                }
            }
        }

        let mut ticker = interval(Duration::from_secs(self.session_cfg.check_interval_secs));
        ticker.tick().await;
        loop {
            ticker.tick().await;
            if let Err(e) = self.steady_pass().await {
                error!("Reaper pass failed: {}", e);
            }
        }
    }

    /// Phase A: reconcile persisted sessions against whatever containers
    /// survived the last hub process, then drop the orphans.
    async fn startup_pass(&self) -> anyhow::Result<()> {
        info!("Startup reconciliation");

        let mut unclaimed = self
            .orchestrator
            .list_managed_containers(CONTAINER_NAME_PREFIX)
            .await?;

        for session in db::sessions::list_all(&self.pool).await? {
            let activity = self
                .orchestrator
                .container_activity(&session.container_name)
                .await?;

            if activity < 0.0 {
                if session.restart {
                    info!(
                        "Session {}: container gone, relaunching for {}",
                        session.id, session.username
                    );
                    if let Err(e) = self.relaunch(&session).await {
                        warn!("Relaunch of {} failed: {}", session.container_name, e);
                    }
                } else {
                    info!(
                        "Session {}: container gone, retiring ({})",
                        session.id, session.username
                    );
                    db::sessions::delete(&self.pool, session.id).await?;
                }
            } else {
                unclaimed.remove(&session.container_name);
                if session.restart {
                    // Re-associate and give the session a fresh activity
                    // hint so it is not retired on the first tick.
                    self.restore_activity_hint(&session).await?;
                } else {
                    info!(
                        "Session {}: not marked for restart, retiring ({})",
                        session.id, session.username
                    );
                    self.teardown_container(&session.container_name).await;
                    db::sessions::delete(&self.pool, session.id).await?;
                }
            }
        }

        if let Err(e) = self.proxy.reconcile(&self.pool).await {
            warn!("Proxy reconciliation failed: {}", e);
        }

        // Whatever managed containers no session claimed are orphans.
        for name in unclaimed {
            info!("Removing orphan container {}", name);
            self.teardown_container(&name).await;
        }

        info!("Startup reconciliation complete");
        Ok(())
    }

    /// Phase B: sample activity, retire idle and vanished sessions.
    async fn steady_pass(&self) -> anyhow::Result<()> {
        debug!("Reaper pass");
        let now = Utc::now();
        let mut changed = false;

        for session in db::sessions::list_all(&self.pool).await? {
            let activity = match self
                .orchestrator
                .container_activity(&session.container_name)
                .await
            {
                Ok(pct) => pct,
                Err(e) => {
                    // Transient orchestrator trouble: leave the session
                    // alone and retry next tick.
                    warn!(
                        "Activity check for {} failed: {}",
                        session.container_name, e
                    );
                    continue;
                }
            };

            if activity < 0.0 {
                if session.restart {
                    info!(
                        "Session {}: container vanished, relaunching for {}",
                        session.id, session.username
                    );
                    if let Err(e) = self.relaunch(&session).await {
                        warn!("Relaunch of {} failed: {}", session.container_name, e);
                    }
                } else {
                    info!(
                        "Session {}: container vanished, retiring ({})",
                        session.id, session.username
                    );
                    db::sessions::delete(&self.pool, session.id).await?;
                }
                changed = true;
                continue;
            }

            let active = activity > self.session_cfg.activity_threshold_pct;
            db::sessions::record_activity(&self.pool, session.id, activity, active).await?;

            if !active && self.is_idle(now, session.last_activity) {
                info!(
                    "Session {}: idle past {}s, retiring ({})",
                    session.id, self.session_cfg.inactivity_time_secs, session.username
                );
                self.teardown_container(&session.container_name).await;
                db::sessions::delete(&self.pool, session.id).await?;
                changed = true;
            }
        }

        if changed {
            if let Err(e) = self.proxy.reconcile(&self.pool).await {
                warn!("Proxy reconciliation failed: {}", e);
            }
        }
        Ok(())
    }

    fn is_idle(&self, now: DateTime<Utc>, last_activity: DateTime<Utc>) -> bool {
        idle_past_timeout(now, last_activity, self.session_cfg.inactivity_time_secs)
    }

    /// Launch the session's container again and refresh its address.
    async fn relaunch(&self, session: &Session) -> anyhow::Result<()> {
        let spec = LaunchSpec {
            container_name: session.container_name.clone(),
            image_name: self.orch_cfg.image_name.clone(),
            image_tag: self.orch_cfg.image_tag.clone(),
            network: self.orch_cfg.network_name.clone(),
            volumes: orchestrator::user_volume_bindings(&session.username),
            session_id: session.id,
            gpu: session.gpu,
        };

        self.orchestrator.start_container(&spec).await?;
        let address = self
            .orchestrator
            .container_address(&session.container_name, &self.orch_cfg.network_name)
            .await?;
        db::sessions::set_service_address(&self.pool, session.id, &address).await?;
        self.restore_activity_hint(session).await?;
        Ok(())
    }

    async fn restore_activity_hint(&self, session: &Session) -> Result<(), sqlx::Error> {
        let hint = self.session_cfg.activity_threshold_pct + 1.0;
        db::sessions::record_activity(&self.pool, session.id, hint, true).await
    }

    async fn teardown_container(&self, name: &str) {
        if let Err(e) = self.orchestrator.stop_container(name).await {
            warn!("Failed to stop container {}: {}", name, e);
        }
        if let Err(e) = self.orchestrator.remove_container(name).await {
            warn!("Failed to remove container {}: {}", name, e);
        }
    }
}

/// Continuous idleness check: strictly longer than the timeout.
fn idle_past_timeout(
    now: DateTime<Utc>,
    last_activity: DateTime<Utc>,
    timeout_secs: u64,
) -> bool {
    (now - last_activity).num_seconds() > timeout_secs as i64
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration as ChronoDuration;

    #[test]
    fn test_idle_past_timeout_boundaries() {
        let now = Utc::now();
        assert!(!idle_past_timeout(now, now, 300));
        assert!(!idle_past_timeout(
            now,
            now - ChronoDuration::seconds(300),
            300
        ));
        assert!(idle_past_timeout(
            now,
            now - ChronoDuration::seconds(301),
            300
        ));
    }

    #[test]
    fn test_recent_activity_is_not_idle() {
        let now = Utc::now();
        assert!(!idle_past_timeout(now, now - ChronoDuration::seconds(10), 300));
    }
}
