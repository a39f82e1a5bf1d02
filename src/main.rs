use dotenv::dotenv;
use tokio::sync::broadcast::error::RecvError;
use tracing::{error, info, warn};

use webrtc_service::{
    config::verbose_from_env, logging::init_logging, start_webrtc_service, stop_webrtc_service,
    webrtc_service, ServiceEvent,
};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenv().ok();
    init_logging(verbose_from_env());

    let mut events = webrtc_service().subscribe();

    let event_task = tokio::spawn(async move {
        loop {
            match events.recv().await {
                Ok(ServiceEvent::FatalError(message)) => error!(%message, "Telephony unavailable"),
                Ok(ServiceEvent::Error(message)) => warn!(%message, "WebRTC error"),
                Ok(event) => info!(event = event.name(), ?event, "WebRTC event"),
                Err(RecvError::Lagged(skipped)) => warn!(skipped, "Dropped WebRTC events"),
                Err(RecvError::Closed) => break,
            }
        }
    });

    if let Err(error) = start_webrtc_service().await {
        // Keep running: the service can come back if the host restarts it.
        error!(%error, "Failed to start WebRTC service");
    }

    tokio::signal::ctrl_c().await?;
    info!("Shutting down");

    stop_webrtc_service().await;
    event_task.abort();

    Ok(())
}
