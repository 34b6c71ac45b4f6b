/*
 * Sitepod - Controller Manager
 * Copyright (C) 2025 Sitepod
 *
 * This program is free software: you can redistribute it and/or modify
 * it under the terms of the GNU Affero General Public License as published
 * by the Free Software Foundation, either version 3 of the License, or
 * (at your option) any later version.
 *
 * This program is distributed in the hope that it will be useful,
 * but WITHOUT ANY WARRANTY; without even the implied warranty of
 * MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE. See the
 * GNU Affero General Public License for more details.
 *
 * You should have received a copy of the GNU Affero General Public License
 * along with this program. If not, see <https://www.gnu.org/licenses/>.
 */

//! Sitepod controller manager.
//!
//! `run` starts the caches, reconcilers and the health endpoints;
//! `create-user` adds a SystemUser with a hashed password to a Sitepod.

use std::collections::BTreeMap;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context as _, Result};
use axum::{extract::State, http::StatusCode, response::Json, routing::get, Router};
use clap::{Parser, Subcommand, ValueEnum};
use kube::{Client, ResourceExt};
use serde_json::{json, Value};
use sitepod_controller::controllers::{run_controllers, Context, Stores};
use sitepod_controller::crds::labels::{PLAINTEXT_PASSWORD_ANNOTATION, SITEPOD_LABEL};
use sitepod_controller::crds::{Defaultable, SystemUser, SystemUserSpec};
use sitepod_controller::exec::KubeExecutor;
use sitepod_controller::ControllerConfig;
use tokio::signal;
use tokio_util::sync::CancellationToken;
use tower::ServiceBuilder;
use tower_http::{
    timeout::TimeoutLayer,
    trace::{DefaultMakeSpan, DefaultOnRequest, DefaultOnResponse, TraceLayer},
};
use tracing::{error, info, warn, Level};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

const DEFAULT_CONFIG_PATH: &str = "/config/config.yaml";

#[derive(Parser)]
#[command(name = "sitepod-cm", version, about = "Sitepod controller manager")]
struct Cli {
    /// Namespace holding Sitepods and everything derived from them
    #[arg(long, env = "SITEPOD_NAMESPACE", default_value = "sitepod", global = true)]
    namespace: String,

    #[arg(long, value_enum, default_value_t = LogFormat::Text, global = true)]
    log_format: LogFormat,

    #[command(subcommand)]
    command: Command,
}

#[derive(Clone, Copy, PartialEq, Eq, ValueEnum)]
enum LogFormat {
    Text,
    Json,
}

#[derive(Subcommand)]
enum Command {
    /// Run every controller until SIGINT/SIGTERM
    Run {
        /// Controller configuration file
        #[arg(long, env = "SITEPOD_CONFIG")]
        config: Option<String>,
    },
    /// Create a SystemUser in a Sitepod
    CreateUser {
        /// Name of the Sitepod the user belongs to
        #[arg(long)]
        sitepod: String,

        #[arg(long)]
        username: String,

        #[arg(long, env = "SITEPOD_USER_PASSWORD", hide_env_values = true)]
        password: String,

        #[arg(long)]
        shell: Option<String>,
    },
}

#[derive(Clone)]
struct AppState {
    ctx: Arc<Context>,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.log_format);

    match cli.command {
        Command::Run { config } => run(&cli.namespace, config.as_deref()).await,
        Command::CreateUser {
            sitepod,
            username,
            password,
            shell,
        } => create_user(&cli.namespace, &sitepod, &username, &password, shell).await,
    }
}

fn init_tracing(format: LogFormat) {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| "info".into());
    tracing_subscriber::registry()
        .with(filter)
        .with((format == LogFormat::Text).then(tracing_subscriber::fmt::layer))
        .with((format == LogFormat::Json).then(|| tracing_subscriber::fmt::layer().json()))
        .init();
}

fn load_controller_config(path: Option<&str>) -> Result<ControllerConfig> {
    let config_path = path
        .filter(|p| Path::new(p).exists())
        .unwrap_or(DEFAULT_CONFIG_PATH);

    let config = match ControllerConfig::from_mounted_file(config_path) {
        Ok(cfg) => {
            info!("Loaded controller configuration from {}", config_path);
            cfg
        }
        Err(err) => {
            warn!(
                "Failed to load configuration from {}: {}. Using defaults.",
                config_path, err
            );
            ControllerConfig::default()
        }
    };
    config.validate().context("invalid controller configuration")?;
    Ok(config)
}

async fn run(namespace: &str, config_path: Option<&str>) -> Result<()> {
    info!(
        "Starting Sitepod controller manager v{}",
        env!("CARGO_PKG_VERSION")
    );
    let config = Arc::new(load_controller_config(config_path)?);

    let client = Client::try_default()
        .await
        .context("failed to create Kubernetes client")?;
    info!("Connected to Kubernetes cluster");

    let ctx = Arc::new(Context::new(
        namespace,
        config.clone(),
        Stores::kube(&client, namespace),
        Arc::new(KubeExecutor::new(client)),
    ));

    let shutdown = CancellationToken::new();
    tokio::spawn({
        let token = shutdown.clone();
        async move {
            shutdown_signal().await;
            token.cancel();
        }
    });

    let controllers = tokio::spawn(run_controllers(ctx.clone(), shutdown.clone()));

    let app = Router::new()
        .route("/health", get(health_check))
        .route("/ready", get(readiness_check))
        .layer(
            ServiceBuilder::new()
                .layer(
                    TraceLayer::new_for_http()
                        .make_span_with(DefaultMakeSpan::new().level(Level::DEBUG))
                        .on_request(DefaultOnRequest::new().level(Level::DEBUG))
                        .on_response(DefaultOnResponse::new().level(Level::DEBUG)),
                )
                .layer(TimeoutLayer::new(Duration::from_secs(10))),
        )
        .with_state(AppState { ctx });

    let listener = tokio::net::TcpListener::bind(&config.health.addr)
        .await
        .with_context(|| format!("failed to bind {}", config.health.addr))?;
    info!("Health server listening on {}", config.health.addr);

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown.clone().cancelled_owned())
        .await
        .context("health server failed")?;

    match controllers.await {
        Ok(Ok(())) => {}
        Ok(Err(e)) => error!("Controllers stopped with error: {}", e),
        Err(e) => error!("Controller task panicked: {}", e),
    }
    info!("Controller manager stopped");
    Ok(())
}

async fn health_check() -> Json<Value> {
    Json(json!({
        "status": "healthy",
        "service": "sitepod-cm",
        "version": env!("CARGO_PKG_VERSION")
    }))
}

async fn readiness_check(State(state): State<AppState>) -> Result<Json<Value>, StatusCode> {
    if state.ctx.informers.all_synced() {
        Ok(Json(json!({
            "status": "ready",
            "service": "sitepod-cm",
        })))
    } else {
        Err(StatusCode::SERVICE_UNAVAILABLE)
    }
}

async fn create_user(
    namespace: &str,
    sitepod: &str,
    username: &str,
    password: &str,
    shell: Option<String>,
) -> Result<()> {
    if password.is_empty() {
        bail!("password must not be empty");
    }
    let client = Client::try_default()
        .await
        .context("failed to create Kubernetes client")?;
    let stores = Stores::kube(&client, namespace);

    let owner = stores
        .sitepods
        .get(sitepod)
        .await
        .with_context(|| format!("sitepod {sitepod} not found"))?;
    let uid = owner
        .uid()
        .with_context(|| format!("sitepod {sitepod} has no uid"))?;

    let mut user = SystemUser::new(
        &format!("systemuser-{username}"),
        SystemUserSpec {
            username: username.to_string(),
            shell: shell.unwrap_or_default(),
            ..Default::default()
        },
    );
    user.metadata.labels = Some(BTreeMap::from([(SITEPOD_LABEL.to_string(), uid)]));
    user.annotations_mut()
        .insert(PLAINTEXT_PASSWORD_ANNOTATION.to_string(), password.to_string());
    user.apply_defaults();
    if !user.spec.hashed_password.is_valid() {
        bail!("failed to hash password for {username}");
    }

    let created = stores
        .systemusers
        .create(&user)
        .await
        .with_context(|| format!("failed to create system user {username}"))?;
    info!(user = %created.name_any(), sitepod = %sitepod, "Created system user");
    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            error!("Failed to install Ctrl+C handler: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                error!("Failed to install SIGTERM handler: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => {
            info!("Received Ctrl+C, shutting down gracefully");
        },
        () = terminate => {
            info!("Received SIGTERM, shutting down gracefully");
        },
    }
}
