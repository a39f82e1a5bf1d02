//! The isolated WebRTC worker process.
//!
//! Reads framed commands from stdin, writes framed messages to stdout and
//! logs to stderr. Exits 1 if it cannot initialize.

use std::{sync::Arc, time::Duration};

use dotenv::dotenv;
use tokio::{
    io::{stdin, stdout},
    sync::mpsc::unbounded_channel,
};
use tracing::{debug, error, warn};

use webrtc_service::{
    config::{verbose_from_env, WorkerConfig},
    logging::init_worker_logging,
    protocol::{
        codec::{read_frame, write_frame},
        Command, ServiceMessage,
    },
    worker::{provider::TelnyxProvider, runtime, Worker},
};

const FLUSH_TIMEOUT: Duration = Duration::from_secs(2);

#[tokio::main]
async fn main() {
    dotenv().ok();
    init_worker_logging(verbose_from_env());

    std::panic::set_hook(Box::new(|info| {
        error!(%info, "WebRTC worker panicked");
    }));

    let config = WorkerConfig::from_env();
    let provider = Arc::new(TelnyxProvider::from_config(&config));
    let (worker, mut messages) = Worker::create(&config, provider);

    let (commands, command_receiver) = unbounded_channel::<Command>();

    tokio::spawn(async move {
        let mut input = stdin();
        loop {
            match read_frame::<_, Command>(&mut input).await {
                Ok(Some(command)) => {
                    if commands.send(command).is_err() {
                        break;
                    }
                }
                Ok(None) => {
                    debug!("Supervisor closed stdin");
                    break;
                }
                Err(error) => {
                    warn!(%error, "Unreadable command frame");
                    break;
                }
            }
        }
    });

    let writer = tokio::spawn(async move {
        let mut output = stdout();
        while let Some(message) = messages.recv().await {
            if let Err(error) = write_frame::<_, ServiceMessage>(&mut output, &message).await {
                error!(%error, "Failed to write to supervisor");
                break;
            }
        }
    });

    let code = runtime::run(worker, command_receiver).await;

    // Credential tasks may still hold a sender, so bound the wait.
    if tokio::time::timeout(FLUSH_TIMEOUT, writer).await.is_err() {
        warn!("Timed out flushing messages to supervisor");
    }

    std::process::exit(code);
}
