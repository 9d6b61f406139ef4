use axum::Router;
use tracing::info;

use mcp_control_plane::{
    clients::Clients, config::Config, db::connect_and_bootstrap, handlers::router,
    state::AppState,
};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            std::env::var("RUST_LOG").unwrap_or_else(|_| "info,mcp_control_plane=info".to_string()),
        )
        .json()
        .init();

    let config = Config::from_env()?;
    let db = connect_and_bootstrap(&config).await?;

    // Upstream GitHub, Kubernetes and database adapters are wired in by the deployment;
    // the standalone binary runs against in-process collaborators.
    let state = AppState::new(config.clone(), db, Clients::simulated())?;
    info!(
        server = %config.server_name,
        delegated_auto_apply = config.delegated_auto_apply,
        "mcp control plane configured"
    );

    let app: Router = router(state);

    let listener = tokio::net::TcpListener::bind(&config.bind_addr).await?;
    info!(bind_addr = %config.bind_addr, "mcp control plane listening");

    axum::serve(listener, app).await?;
    Ok(())
}
