//! TDSlicerHub aims to imitate the functionality of JupyterHub, but for
//! 3DSlicer:
//!   - a login mechanism backed by an LDAP directory
//!   - one containerized 3DSlicer instance per user
//!   - retirement of unused instances
//!   - a single nginx entry point routing every live session
//!   - session sharing on a landing page
//!   - persistent per-user storage across sessions

use std::sync::Arc;

use anyhow::Result;
use axum::extract::{Path, Query, State};
use axum::http::{header, StatusCode};
use axum::response::{Html, IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Form, Json, Router};
use serde::Deserialize;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;
use tracing::{info, warn};
use uuid::Uuid;

use tdslicerhub::auth::{CredentialChecker, LdapChecker};
use tdslicerhub::config::Config;
use tdslicerhub::db::{self, DbPool, NewSession};
use tdslicerhub::domain::DomainResolver;
use tdslicerhub::errors::HubError;
use tdslicerhub::naming::{self, CONTAINER_NAME_PREFIX};
use tdslicerhub::orchestrator::{self, ContainerOrchestrator, LaunchSpec};
use tdslicerhub::proxy::ProxyReconciler;
use tdslicerhub::reaper::Reaper;

/// Everything a handler needs, built once at startup and threaded through.
#[derive(Clone)]
struct AppState {
    pool: DbPool,
    orchestrator: Arc<dyn ContainerOrchestrator>,
    proxy: Arc<ProxyReconciler>,
    checker: Arc<dyn CredentialChecker>,
    domain: Arc<DomainResolver>,
    config: Arc<Config>,
}

/// A plain 302, the redirect status every hub flow uses.
fn found(location: &str) -> Response {
    (
        StatusCode::FOUND,
        [(header::LOCATION, location.to_string())],
    )
        .into_response()
}

async fn root() -> Response {
    found("/index.html")
}

#[derive(Deserialize)]
struct LandingQuery {
    user: Option<String>,
}

// Landing listing: shared sessions, or everything for admin callers.
async fn landing(
    State(state): State<AppState>,
    Query(params): Query<LandingQuery>,
) -> Result<Html<String>, HubError> {
    let sessions = db::sessions::list_all(&state.pool).await?;
    let admin = params
        .user
        .map(|u| state.config.server.admin_users.contains(&u))
        .unwrap_or(false);

    Ok(Html(tdslicerhub::pages::landing_page(&sessions, admin)))
}

async fn login_form() -> Html<String> {
    Html(tdslicerhub::pages::login_page())
}

#[derive(Deserialize)]
struct LoginForm {
    username: String,
    password: String,
}

// Start (or resume) a 3DSlicer session.
async fn login(
    State(state): State<AppState>,
    Form(form): Form<LoginForm>,
) -> Result<Response, HubError> {
    let username = form.username.trim().to_string();
    if !naming::validate_user_id(&username) {
        return Err(HubError::AuthFailure { user: username });
    }

    if !state.checker.verify(&username, &form.password).await {
        warn!("Login rejected for user {}", username);
        return Err(HubError::AuthFailure { user: username });
    }

    // One session per user: an existing one is resumed, never duplicated.
    if let Some(existing) = db::sessions::get_by_user(&state.pool, &username).await? {
        return Ok(found(&format!("/sessions/{}", existing.id)));
    }

    let cfg = &state.config;
    if !cfg.session.unlimited() {
        let live = db::sessions::count(&state.pool).await?;
        if live >= i64::from(cfg.session.max_sessions) {
            warn!("Login for {} rejected: {} sessions live", username, live);
            return Err(HubError::CapacityExceeded {
                max: cfg.session.max_sessions,
            });
        }
    }

    // The launch must run to completion even if the client goes away:
    // either the container becomes a Session or it is torn down.
    let task_state = state.clone();
    let task_user = username.clone();
    match tokio::spawn(async move { create_session(&task_state, &task_user).await }).await {
        Ok(result) => result,
        Err(e) => Err(HubError::OrchestratorUnavailable(format!(
            "session creation task failed: {}",
            e
        ))),
    }
}

/// The login slow path: prepare backend resources, insert the row, launch the
/// container, publish the address, commit. Any failure after the container
/// launch rolls the row back and tears the container down.
async fn create_session(state: &AppState, username: &str) -> Result<Response, HubError> {
    let orch = &state.orchestrator;
    let ocfg = &state.config.orchestrator;

    let container_name = format!(
        "{}{}",
        CONTAINER_NAME_PREFIX,
        orch.normalize_name(username)
    );
    let gpu = naming::gpu_requested(username);

    let unavailable =
        |e: orchestrator::OrchestratorError| HubError::OrchestratorUnavailable(e.to_string());

    orch.ensure_image(&ocfg.image_name, &ocfg.image_tag)
        .await
        .map_err(unavailable)?;
    let network = orch
        .ensure_network(&ocfg.network_name)
        .await
        .map_err(unavailable)?;
    for (kind, _) in orchestrator::VOLUME_KINDS {
        orch.ensure_volume(username, kind).await.map_err(unavailable)?;
    }

    let id = Uuid::new_v4();
    let new = NewSession {
        id,
        username: username.to_string(),
        url_path: format!("/{}/", id),
        container_name: container_name.clone(),
        gpu,
    };

    let mut tx = state.pool.begin().await?;
    let session = match db::sessions::create(&mut *tx, &new).await {
        Ok(session) => session,
        Err(e) if db::sessions::is_unique_violation(&e) => {
            // A concurrent login won the race; join its session.
            let _ = tx.rollback().await;
            return match db::sessions::get_by_user(&state.pool, username).await? {
                Some(existing) => Ok(found(&format!("/sessions/{}", existing.id))),
                None => Err(HubError::SessionConflict {
                    user: username.to_string(),
                }),
            };
        }
        Err(e) => return Err(e.into()),
    };

    let spec = LaunchSpec {
        container_name: container_name.clone(),
        image_name: ocfg.image_name.clone(),
        image_tag: ocfg.image_tag.clone(),
        network,
        volumes: orchestrator::user_volume_bindings(username),
        session_id: id,
        gpu,
    };

    if let Err(e) = orch.start_container(&spec).await {
        let _ = tx.rollback().await;
        teardown_container(state, &container_name).await;
        return Err(HubError::ContainerLaunchFailed {
            user: username.to_string(),
            reason: e.to_string(),
        });
    }

    let address = match orch
        .container_address(&container_name, &ocfg.network_name)
        .await
    {
        Ok(address) => address,
        Err(e) => {
            let _ = tx.rollback().await;
            teardown_container(state, &container_name).await;
            return Err(HubError::OrchestratorUnavailable(e.to_string()));
        }
    };

    if let Err(e) = db::sessions::set_service_address(&mut *tx, id, &address).await {
        let _ = tx.rollback().await;
        teardown_container(state, &container_name).await;
        return Err(e.into());
    }

    if let Err(e) = tx.commit().await {
        teardown_container(state, &container_name).await;
        return Err(e.into());
    }

    info!("Created session {} for user {}", id, username);

    if let Err(e) = state.proxy.reconcile(&state.pool).await {
        warn!("Proxy reconciliation after login failed: {}", e);
    }

    Ok(found(&format!("/sessions/{}", session.id)))
}

async fn teardown_container(state: &AppState, name: &str) {
    if let Err(e) = state.orchestrator.stop_container(name).await {
        warn!("Failed to stop container {}: {}", name, e);
    }
    if let Err(e) = state.orchestrator.remove_container(name).await {
        warn!("Failed to remove container {}: {}", name, e);
    }
}

async fn load_session(state: &AppState, id: Uuid) -> Result<db::Session, HubError> {
    db::sessions::get_by_id(&state.pool, id)
        .await?
        .ok_or_else(|| HubError::NotFound {
            what: format!("session {}", id),
        })
}

// Management page for one session.
async fn session_page(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
) -> Result<Html<String>, HubError> {
    let session = load_session(&state, id).await?;
    let base = state.domain.base_url().await;
    Ok(Html(tdslicerhub::pages::management_page(&session, &base)))
}

#[derive(Deserialize)]
struct ShareQuery {
    interactive: Option<u8>,
}

async fn share_session(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
    Query(params): Query<ShareQuery>,
) -> Result<Response, HubError> {
    let session = load_session(&state, id).await?;
    db::sessions::set_shared(&state.pool, session.id, true).await?;
    info!("Session {} shared by {}", session.id, session.username);

    // The landing page persisted next to the proxy config must follow.
    if let Err(e) = state.proxy.reconcile(&state.pool).await {
        warn!("Proxy reconciliation after share failed: {}", e);
    }

    if params.interactive == Some(0) {
        Ok((StatusCode::OK, Html("shared".to_string())).into_response())
    } else {
        Ok(found(&format!("/sessions/{}", session.id)))
    }
}

async fn unshare_session(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
) -> Result<Response, HubError> {
    let session = load_session(&state, id).await?;
    db::sessions::set_shared(&state.pool, session.id, false).await?;
    info!("Session {} unshared by {}", session.id, session.username);

    if let Err(e) = state.proxy.reconcile(&state.pool).await {
        warn!("Proxy reconciliation after unshare failed: {}", e);
    }

    Ok(found(&format!("/sessions/{}", session.id)))
}

async fn close_session(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
) -> Result<Response, HubError> {
    let session = load_session(&state, id).await?;
    info!(
        "Closing session {} for user {}",
        session.id, session.username
    );

    teardown_container(&state, &session.container_name).await;
    db::sessions::delete(&state.pool, session.id).await?;

    if let Err(e) = state.proxy.reconcile(&state.pool).await {
        warn!("Proxy reconciliation after close failed: {}", e);
    }

    Ok(found("/"))
}

#[derive(Deserialize)]
struct RestartQuery {
    enable: u8,
}

// Administrative toggle: sessions with restart set survive container loss.
async fn toggle_restart(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
    Query(params): Query<RestartQuery>,
) -> Result<Response, HubError> {
    let session = load_session(&state, id).await?;
    db::sessions::set_restart(&state.pool, session.id, params.enable != 0).await?;
    info!(
        "Session {} restart flag set to {}",
        session.id,
        params.enable != 0
    );
    Ok(found(&format!("/sessions/{}", session.id)))
}

async fn health_check(State(state): State<AppState>) -> impl IntoResponse {
    let db_ok = sqlx::query("SELECT 1").fetch_one(&state.pool).await.is_ok();
    let live_sessions = db::sessions::count(&state.pool).await.unwrap_or(-1);

    Json(serde_json::json!({
        "status": if db_ok { "healthy" } else { "degraded" },
        "service": "tdslicerhub",
        "version": env!("CARGO_PKG_VERSION"),
        "build_time": env!("BUILD_TIME"),
        "git_hash": env!("GIT_HASH"),
        "orchestrator": state.config.orchestrator.kind.to_string(),
        "components": {
            "database": db_ok,
        },
        "metrics": {
            "live_sessions": live_sessions,
        },
        "timestamp": chrono::Utc::now()
    }))
}

// Any unknown path gets an informational page, not an error.
async fn fallback_handler() -> impl IntoResponse {
    (StatusCode::OK, Html(tdslicerhub::pages::fallback_page()))
}

#[tokio::main]
async fn main() -> Result<()> {
    use tracing_subscriber::EnvFilter;

    let env_filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("tdslicerhub=info,tower_http=info"));

    tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .json()
        .with_target(false)
        .with_level(true)
        .with_thread_ids(true)
        .with_thread_names(true)
        .init();

    // Configuration errors are the only fatal errors in the hub.
    let config = Arc::new(
        Config::from_env().map_err(|e| anyhow::anyhow!("Configuration error: {}", e))?,
    );
    config
        .validate()
        .map_err(|e| anyhow::anyhow!("Configuration error: {}", e))?;

    info!("TDSlicerHub starting");
    info!("Orchestrator: {}", config.orchestrator.kind);
    info!("Listening on {}", config.server.listen_addr);

    let pool = db::init_pool(&config.database).await?;
    db::run_migrations(&pool).await?;

    let orchestrator = orchestrator::from_config(&config).await?;

    // Base services first: the proxy and the directory have to exist before
    // logins can do anything useful.
    if let Err(e) = orchestrator.bring_up_base().await {
        warn!("Could not bring up base services (continuing): {}", e);
    }
    if let Err(e) = orchestrator
        .ensure_network(&config.orchestrator.network_name)
        .await
    {
        warn!("Could not prepare the session network (continuing): {}", e);
    }
    if let Err(e) = orchestrator
        .ensure_image(&config.orchestrator.image_name, &config.orchestrator.image_tag)
        .await
    {
        warn!("Could not prepare the session image (continuing): {}", e);
    }

    let hub_upstream = format!("{}:{}", config.server.hub_name, config.server.port);
    let proxy = Arc::new(ProxyReconciler::new(
        orchestrator.clone(),
        config.proxy.clone(),
        hub_upstream,
    ));

    let checker: Arc<dyn CredentialChecker> = Arc::new(LdapChecker::new(&config.directory)?);
    let domain = Arc::new(DomainResolver::new(&config.domain));
    info!("Hub base URL: {}", domain.base_url().await);

    let reaper = Arc::new(Reaper::new(
        pool.clone(),
        orchestrator.clone(),
        proxy.clone(),
        config.session.clone(),
        config.orchestrator.clone(),
    ));
    tokio::spawn(reaper.run());

    let app_state = AppState {
        pool,
        orchestrator,
        proxy,
        checker,
        domain,
        config: config.clone(),
    };

    let app = Router::new()
        .route("/", get(root))
        .route("/index.html", get(landing))
        .route("/login", get(login_form).post(login))
        .route("/health", get(health_check))
        .route("/sessions/:id", get(session_page))
        .route("/sessions/:id/share", post(share_session))
        .route("/sessions/:id/unshare", post(unshare_session))
        .route("/sessions/:id/close", post(close_session))
        .route("/sessions/:id/restart", post(toggle_restart))
        .fallback(fallback_handler)
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
        .with_state(app_state);

    let listener = tokio::net::TcpListener::bind(config.server.listen_addr)
        .await
        .map_err(|e| anyhow::anyhow!("Failed to bind to {}: {}", config.server.listen_addr, e))?;

    info!("TDSlicerHub ready");

    axum::serve(listener, app)
        .await
        .map_err(|e| anyhow::anyhow!("Server error: {}", e))?;

    Ok(())
}
