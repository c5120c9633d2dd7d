//! Binary entry point: loads configuration, wires C1-C9 together, and
//! serves the RPC/HTTP surface.

mod api;
mod config;
mod container;
mod error;
mod parser;
mod pty;
mod registry;
mod session;
mod state;
mod sync;
mod telemetry;
mod types;
mod workspace;

use std::sync::Arc;
use std::time::Instant;

use sync::providers::{ClaudeProvider, CodexProvider, OpenCodeProvider};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let _ = dotenvy::dotenv();

    let cfg = config::Config::from_env()?;
    telemetry::init(&cfg.environment);

    tracing::info!(environment = %cfg.environment, port = cfg.port, "starting perryd");

    let driver = Arc::new(container::ContainerDriver::new(
        std::env::var("CONTAINER_RUNTIME").unwrap_or_else(|_| "docker".to_string()),
    ));

    let state_store = Arc::new(state::StateStore::new(cfg.state_path(), cfg.state_lock_path()));
    state_store.load().await?;

    let session_registry = Arc::new(registry::SessionRegistry::new(cfg.registry_path(), cfg.registry_lock_path()));
    session_registry.load().await?;

    let sync_engine = Arc::new(sync::Engine::new(vec![
        Box::new(ClaudeProvider),
        Box::new(OpenCodeProvider),
        Box::new(CodexProvider),
    ]));

    let workspaces = Arc::new(workspace::Manager::new(
        state_store.clone(),
        driver.clone(),
        sync_engine,
        cfg.agent_config.clone(),
    ));

    let sessions = Arc::new(session::Manager::new(driver.clone(), session_registry.clone()));
    let pty_registry = pty::Registry::new();

    // Both hooks fire synchronously from C6; the actual work is async, so
    // each spawns a detached task rather than blocking the caller.
    {
        let pty_registry = pty_registry.clone();
        workspaces
            .set_close_connections_hook(Arc::new(move |workspace_name: &str| {
                let pty_registry = pty_registry.clone();
                let workspace_name = workspace_name.to_string();
                tokio::spawn(async move {
                    pty_registry.close_connections_for_workspace(&workspace_name).await;
                });
            }))
            .await;
    }
    {
        let sessions = sessions.clone();
        workspaces
            .set_dispose_sessions_hook(Arc::new(move |workspace_name: String| {
                let sessions = sessions.clone();
                tokio::spawn(async move {
                    sessions.dispose_workspace(&workspace_name).await;
                });
            }))
            .await;
    }

    let state = api::AppState {
        workspaces,
        sessions,
        registry: session_registry,
        driver,
        pty_registry,
        bearer_token: cfg.agent_config.bearer_token.clone(),
        config_dir: cfg.config_dir.clone(),
        ssh_user: cfg.agent_config.ssh.user.clone(),
        started_at: Instant::now(),
    };

    let router = api::build_router(state);

    let listener = tokio::net::TcpListener::bind(("0.0.0.0", cfg.port)).await?;
    tracing::info!(port = cfg.port, "listening");
    axum::serve(listener, router).await?;

    Ok(())
}
