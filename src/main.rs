use std::sync::Arc;
use tracing_subscriber::EnvFilter;

use hdb_predictor::{
    calendar::SystemClock,
    config::ServiceConfig,
    server::{self, AppState},
};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let cfg = ServiceConfig::from_env()?;
    let predictor = server::build_predictor(&cfg, Arc::new(SystemClock))?;

    // Warmup so a broken artifact set fails here rather than on first request
    let present = predictor.predict_present_sample()?;
    let future = predictor.predict_future_sample()?;
    tracing::info!(
        "warmup ok: present={:.2} future={:?}",
        present.price,
        future.labels()
    );

    let addr = cfg.socket_addr()?;
    let app = server::router(AppState::new(predictor, cfg));

    tracing::info!("listening on {}", addr);
    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app).await?;
    Ok(())
}
