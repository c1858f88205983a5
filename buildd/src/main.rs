use engine::BuildEngine;
use tracing::{info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use buildd::{config, AppState};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::registry()
        .with(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "buildd=debug,engine=debug,tower_http=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let config = config::Config::from_env()?;
    info!(
        port = config.port,
        config = %config.config_path.display(),
        projects = config.engine.projects.len(),
        "buildd starting"
    );

    let engine = BuildEngine::open(config.engine.clone()).await;

    // Runs still marked running were cut off by a previous shutdown.
    match engine.recover_interrupted_runs().await {
        Ok(0) => {}
        Ok(count) => warn!(count, "marked unfinished build runs as interrupted"),
        Err(e) => warn!("interrupted run recovery failed: {e}"),
    }

    let app = buildd::app(AppState::new(engine));

    let addr = format!("0.0.0.0:{}", config.port);
    info!("listening on {addr}");
    let listener = tokio::net::TcpListener::bind(&addr).await?;
    axum::serve(listener, app).await?;
    Ok(())
}
