//! Supervised WebRTC telephony for a host application.
//!
//! The telephony logic runs in an isolated worker ([`worker`]) that talks to
//! the Telnyx API. The host only ever deals with a [`Supervisor`], which
//! launches the worker, relays its events, and restarts it when it fails.

pub mod config;
pub mod error;
pub mod logging;
pub mod protocol;
pub mod service;
pub mod supervisor;
pub mod worker;

pub use config::{ServiceConfig, WorkerConfig};
pub use error::{ServiceError, WorkerError};
pub use protocol::{
    ActiveCall, CallDirection, CallStatus, Command, Credential, ServiceMessage, ServiceStatus,
    TurnServer,
};
pub use service::{start_webrtc_service, stop_webrtc_service, webrtc_service};
pub use supervisor::{InProcessLauncher, ProcessLauncher, ServiceEvent, Supervisor};
