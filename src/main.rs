use std::sync::Arc;

use sparrow_driver::{
    AgentConfig, AppState, PlatformServices,
    handlers,
    models::location::Coordinate,
    services::{
        channel_service::MockChannelTransport, notification_service::MockNotificationService,
        tracking_service::ScriptedSampler,
    },
};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt::init();

    let config = AgentConfig::from_env()?;
    let bind_addr = config.status_bind_addr.clone();

    tracing::warn!("No duplex channel transport configured, using mock dispatch channel");
    tracing::warn!("No device location source configured, using a stationary scripted sampler");
    tracing::warn!("No push provider configured, using mock notification service");
    let platform = PlatformServices::new(
        Arc::new(MockChannelTransport::new()),
        Arc::new(ScriptedSampler::stationary(Coordinate::new(17.385, 78.4867))),
        Arc::new(MockNotificationService::new()),
    );

    let app_state = Arc::new(AppState::new(config, platform).await?);
    let app = handlers::router(app_state.clone());

    let listener = tokio::net::TcpListener::bind(&bind_addr).await?;
    tracing::info!("Driver agent status surface listening on {}", bind_addr);
    axum::serve(listener, app)
        .with_graceful_shutdown(async {
            let _ = tokio::signal::ctrl_c().await;
        })
        .await?;

    app_state.shutdown().await?;
    Ok(())
}
