mod dispatcher;
mod registry;

use std::{
    net::{Ipv4Addr, SocketAddr},
    path::Path,
    sync::Arc,
    time::Duration,
};

use anyhow::{Context, Result};
use axum::{
    Router,
    http::{StatusCode, header},
    routing::{any, get},
};
use hook_relay_core::config::Config;
use hook_relay_github::{
    GitHub,
    secrets::{ConfigSecretLoader, SecretLoader},
    webhook,
};
use hook_relay_tasks::{
    HttpQueueClient, HttpServiceResolver, QueueTaskEnqueuer, ServiceResolver, TaskEnqueuer,
};
use tokio::{net::TcpListener, signal};
use tower::ServiceBuilder;
use tower_http::{
    ServiceBuilderExt,
    normalize_path::NormalizePathLayer,
    timeout::TimeoutLayer,
    trace::{DefaultMakeSpan, DefaultOnResponse, TraceLayer},
};
use tracing::Level;
use tracing_subscriber::{
    EnvFilter, Layer, filter::LevelFilter, layer::SubscriberExt, util::SubscriberInitExt,
};

use crate::{dispatcher::Dispatcher, registry::HandlerRegistry};

#[derive(Clone)]
pub struct AppState {
    pub dispatcher: Arc<Dispatcher>,
}

#[tokio::main]
async fn main() {
    let env_filter = EnvFilter::builder()
        // Default to info level
        .with_default_directive(LevelFilter::INFO.into())
        .from_env_lossy();
    tracing_subscriber::registry()
        .with(tracing_subscriber::fmt::layer().with_filter(env_filter))
        .init();

    if let Err(e) = run().await {
        tracing::error!("{e:?}");
        std::process::exit(1);
    }
}

async fn run() -> Result<()> {
    let config = Arc::new(Config::load(Path::new("config.yml"))?);
    let secrets = ConfigSecretLoader::new(config.clone()).load(&config.bot.bot_name).await?;
    let github = GitHub::new(&secrets).context("Failed to create GitHub client")?;

    let queue = Arc::new(HttpQueueClient::new(&config.queue));
    let resolver: Arc<dyn ServiceResolver> = Arc::new(HttpServiceResolver::new(
        &config.queue,
        config.bot.project_id.clone(),
        config.bot.location.clone(),
    ));
    let signing_secret = secrets.webhook_secret.clone();
    let enqueuer: Arc<dyn TaskEnqueuer> = Arc::new(QueueTaskEnqueuer::new(
        config.bot.project_id.clone(),
        config.bot.bot_name.clone(),
        config.bot.location.clone(),
        queue,
        resolver,
        Arc::new(move |body| webhook::sign(&signing_secret, body)),
    ));

    // Deployments register their event handlers here before serving.
    let registry = HandlerRegistry::new();
    if registry.is_empty() {
        tracing::warn!("No event handlers registered; task replays will be no-ops");
    }

    let dispatcher = Arc::new(Dispatcher::new(
        config.clone(),
        secrets.webhook_secret,
        enqueuer,
        Arc::new(github),
        registry,
    ));
    let state = AppState { dispatcher };

    let addr = SocketAddr::from((Ipv4Addr::UNSPECIFIED, config.server.port));
    let listener = TcpListener::bind(addr).await.context("bind error")?;
    tracing::info!("Listening on {addr}");
    axum::serve(listener, app(state))
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("Web server error")?;
    tracing::info!("Shut down gracefully");
    Ok(())
}

fn app(state: AppState) -> Router {
    let sensitive_headers: Arc<[_]> = vec![header::AUTHORIZATION, header::COOKIE].into();
    let middleware = ServiceBuilder::new()
        .sensitive_request_headers(sensitive_headers.clone())
        .sensitive_response_headers(sensitive_headers)
        .layer(
            TraceLayer::new_for_http()
                .make_span_with(DefaultMakeSpan::new().level(Level::INFO))
                .on_response(DefaultOnResponse::new().level(Level::INFO)),
        )
        .layer(TimeoutLayer::with_status_code(
            StatusCode::REQUEST_TIMEOUT,
            Duration::from_secs(120),
        ))
        .layer(NormalizePathLayer::trim_trailing_slash())
        .compression();
    Router::new()
        .route("/", any(dispatcher::handle))
        .route("/healthz", get(healthz))
        .with_state(state)
        .layer(middleware)
}

async fn healthz() -> &'static str { "ok" }

async fn shutdown_signal() {
    #[cfg(unix)]
    {
        let mut sigterm = signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("Failed to install signal handler");
        tokio::select! {
            _ = signal::ctrl_c() => {}
            _ = sigterm.recv() => {}
        }
    }
    #[cfg(not(unix))]
    {
        signal::ctrl_c().await.expect("Failed to listen for ctrl-c");
    }
}
