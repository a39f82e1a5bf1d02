//! The process-wide telephony service.
//!
//! A host wants exactly one WebRTC channel, so the [`Supervisor`] lives in a
//! lazily initialized global configured from the environment.

use once_cell::sync::OnceCell;

use crate::{config::ServiceConfig, error::Result, supervisor::Supervisor};

static SERVICE: OnceCell<Supervisor> = OnceCell::new();

/// The shared supervisor, built from the environment on first use.
pub fn webrtc_service() -> &'static Supervisor {
    SERVICE.get_or_init(|| Supervisor::new(ServiceConfig::from_env()))
}

/// Starts the shared service and hands it back once the worker is ready.
pub async fn start_webrtc_service() -> Result<&'static Supervisor> {
    let service = webrtc_service();
    service.start().await?;
    Ok(service)
}

/// Stops the shared service if it was ever created.
pub async fn stop_webrtc_service() {
    if let Some(service) = SERVICE.get() {
        service.stop().await;
    }
}
