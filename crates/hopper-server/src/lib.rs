pub mod auth;
pub mod error;
pub mod routes;
pub mod state;

use std::future::Future;
use std::path::Path;
use std::sync::Arc;

use anyhow::Context;
use axum::extract::DefaultBodyLimit;
use axum::middleware;
use axum::routing::{get, post};
use axum::Router;
use hopper_core::agent::{AgentOptions, ContainerAgent};
use hopper_core::auth::TokenSigner;
use hopper_core::config::Config;
use hopper_core::inbox::Inbox;
use hopper_core::orchestrator::{Orchestrator, OrchestratorOptions};
use hopper_core::runtime::docker::DockerRuntime;
use hopper_core::runtime::ContainerRuntime;
use hopper_core::store::{SqliteStore, Store};
use tokio::net::TcpListener;
use tokio::sync::watch;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;

/// Largest multipart body accepted by `POST /api/event`.
const MAX_UPLOAD_BYTES: usize = 256 * 1024 * 1024;

/// Build the axum Router with all API routes and middleware.
/// Used by `serve_on()` and available for integration testing.
pub fn build_router(app_state: state::AppState) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    // Everything but health and login needs a token once a secret is set.
    let protected = Router::new()
        // Ingress
        .route(
            "/api/event",
            post(routes::events::post_event).layer(DefaultBodyLimit::max(MAX_UPLOAD_BYTES)),
        )
        .route("/api/inbox/{topic}", get(routes::inbox::get_inbox))
        // Registrations
        .route(
            "/api/registrations",
            get(routes::registrations::list_registrations)
                .post(routes::registrations::create_registration),
        )
        .route(
            "/api/registrations/{id}",
            get(routes::registrations::get_registration)
                .delete(routes::registrations::delete_registration),
        )
        // Metrics
        .route("/api/metrics/{id}", get(routes::metrics::get_metrics))
        // Users
        .route("/api/users", post(routes::users::create_user))
        .route_layer(middleware::from_fn_with_state(
            app_state.clone(),
            auth::require_token,
        ));

    Router::new()
        .route("/api/health", get(routes::health::health))
        .route("/api/login", post(routes::users::login))
        .merge(protected)
        .layer(TraceLayer::new_for_http())
        .layer(cors)
        .with_state(app_state)
}

/// Bind the configured address and run until ctrl-c.
pub async fn serve(config: Config, config_path: &Path) -> anyhow::Result<()> {
    let addr = format!("{}:{}", config.server.host, config.server.port);
    let listener = TcpListener::bind(&addr)
        .await
        .with_context(|| format!("failed to bind {addr}"))?;
    serve_on(config, config_path, listener, async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::error!(error = %e, "failed to listen for ctrl-c");
        }
    })
    .await
}

/// Wire store, inbox, container agent and orchestrator together and serve the
/// API on a pre-bound listener until `shutdown` resolves. Relative paths in
/// `config` are taken relative to the directory of `config_path`.
pub async fn serve_on<F>(
    config: Config,
    config_path: &Path,
    listener: TcpListener,
    shutdown: F,
) -> anyhow::Result<()>
where
    F: Future<Output = ()> + Send + 'static,
{
    config.check()?;
    for warning in config.validate() {
        tracing::warn!(message = %warning.message, "config warning");
    }

    let db_path = Config::resolve(config_path, config.database_path()?);
    let store: Arc<dyn Store> = Arc::new(
        SqliteStore::open(&db_path)
            .with_context(|| format!("failed to open database {}", db_path.display()))?,
    );

    let inbox = Arc::new(Inbox::open(
        Config::resolve(config_path, &config.inbox.master),
        Config::resolve(config_path, &config.inbox.containers),
    )?);

    let runtime: Arc<dyn ContainerRuntime> = Arc::new(
        DockerRuntime::connect(&config.docker, config.registry.as_ref())
            .context("failed to connect to docker")?,
    );
    let agent = ContainerAgent::connect(runtime, AgentOptions::from(&config.docker)).await?;

    let orchestrator = Orchestrator::new(
        Arc::clone(&inbox),
        Arc::clone(&agent),
        Arc::clone(&store),
        OrchestratorOptions::from(&config.orchestrator),
    );

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let mut tasks = agent.spawn_background(shutdown_rx.clone());
    tasks.push(orchestrator.spawn(shutdown_rx));

    let mut app_state = state::AppState::new(inbox, store, agent);
    match &config.auth.token_secret {
        Some(secret) => {
            app_state = app_state.with_auth(TokenSigner::new(secret, config.auth.token_ttl()));
            tracing::info!("token authentication enabled");
        }
        None => tracing::warn!("auth.token_secret is not set; the API is open to every caller"),
    }
    let app = build_router(app_state);
    let addr = listener.local_addr()?;
    tracing::info!("hopper listening on http://{addr}");

    let served = axum::serve(listener, app)
        .with_graceful_shutdown(shutdown)
        .await;

    let _ = shutdown_tx.send(true);
    for task in tasks {
        if let Err(e) = task.await {
            tracing::warn!(error = %e, "background task ended abnormally");
        }
    }
    tracing::info!("hopper stopped");
    served.map_err(Into::into)
}
