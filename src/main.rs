use std::sync::Arc;

use anyhow::Context;

use leadflow::api::{self, AppState};
use leadflow::config::{self, ServerConfig};
use leadflow::gateway::HttpGatewayFactory;
use leadflow::llm::HttpLlmFactory;
use leadflow::store::{Database, LibSqlBackend};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .with_target(false)
        .init();

    let server = ServerConfig::from_env();

    eprintln!("Leadflow v{}", env!("CARGO_PKG_VERSION"));
    eprintln!("   Webhook: http://0.0.0.0:{}/api/webhook", server.port);
    eprintln!("   Database: {}", server.db_path.display());

    // ── Database ─────────────────────────────────────────────────────────
    let db: Arc<dyn Database> = Arc::new(
        LibSqlBackend::new_local(&server.db_path)
            .await
            .with_context(|| format!("failed to open database at {}", server.db_path.display()))?,
    );

    let seeded = config::seed_settings_from_env(db.as_ref())
        .await
        .context("failed to seed settings")?;
    if seeded > 0 {
        eprintln!("   Seeded {seeded} settings from environment");
    }

    // ── Collaborators ────────────────────────────────────────────────────
    let gateways = Arc::new(HttpGatewayFactory::new(server.http_timeout)?);
    let llms = Arc::new(HttpLlmFactory::new(server.http_timeout)?);

    let app = api::routes(AppState::new(db, gateways, llms));

    let listener = tokio::net::TcpListener::bind(("0.0.0.0", server.port))
        .await
        .with_context(|| format!("failed to bind port {}", server.port))?;
    tracing::info!(port = server.port, "Server listening");

    axum::serve(listener, app).await?;
    Ok(())
}
