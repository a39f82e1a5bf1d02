use std::{
    any::Any,
    panic::{self, AssertUnwindSafe},
};

use tokio::sync::mpsc::UnboundedReceiver;
use tracing::{error, info};

use crate::protocol::Command;

use super::{Worker, WorkerFlow};

/// Drives a worker until `shutdown` or until the command channel closes.
///
/// Returns the process exit code: 1 if the automatic initialization fails
/// (there is no useful degraded mode without credentials), 0 otherwise.
pub async fn run(mut worker: Worker, mut commands: UnboundedReceiver<Command>) -> i32 {
    if let Err(error) = worker.initialize() {
        error!(%error, "WebRTC worker failed to initialize");
        return 1;
    }

    while let Some(command) = commands.recv().await {
        let name = command.name();

        match panic::catch_unwind(AssertUnwindSafe(|| worker.handle(command))) {
            Ok(WorkerFlow::Continue) => {}
            Ok(WorkerFlow::Exit(code)) => return code,
            Err(payload) => {
                let message = format!(
                    "{} handler panicked: {}",
                    name,
                    panic_message(payload.as_ref())
                );
                worker.report_fault(&message);
            }
        }
    }

    info!("Command channel closed, WebRTC worker exiting");
    0
}

pub(crate) fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(message) = payload.downcast_ref::<&str>() {
        (*message).to_owned()
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message.clone()
    } else {
        "unknown panic".to_owned()
    }
}
