//! How a worker gets started, and how the supervisor talks to it afterwards.
//!
//! Whatever the isolation mechanism, a launched worker is reduced to a
//! [`WorkerHandle`]: a command sender, an ordered stream of [`WorkerEvent`]s
//! and a [`WorkerTerminator`].

use std::{path::PathBuf, process::Stdio, sync::Arc, time::Duration};

use async_trait::async_trait;
use tokio::{
    process::Command as ProcessCommand,
    sync::{
        mpsc::{unbounded_channel, UnboundedReceiver, UnboundedSender},
        oneshot, watch,
    },
    task::JoinError,
};
use tracing::{debug, warn};

use crate::{
    config::{default_worker_binary, WorkerConfig, API_BASE_URL_ENV, API_KEY_ENV},
    error::ServiceError,
    protocol::{
        codec::{read_frame, write_frame},
        Command, ServiceMessage,
    },
    worker::{
        provider::{CredentialProvider, TelnyxProvider},
        runtime::{self, panic_message},
        Worker,
    },
};

/// Everything a worker can tell its supervisor, in the order it happened.
#[derive(Debug, Clone, PartialEq)]
pub enum WorkerEvent {
    Message(ServiceMessage),
    /// The transport or the worker itself broke.
    Error(String),
    Exit(i32),
}

#[async_trait]
pub trait WorkerTerminator: Send {
    /// Waits up to `grace` for the worker to exit on its own.
    async fn terminate(&mut self, grace: Duration) -> Result<(), ServiceError>;

    fn force_terminate(&mut self);
}

pub struct WorkerHandle {
    pub commands: UnboundedSender<Command>,
    pub events: UnboundedReceiver<WorkerEvent>,
    pub terminator: Box<dyn WorkerTerminator>,
}

#[async_trait]
pub trait WorkerLauncher: Send + Sync {
    async fn launch(&self, config: &WorkerConfig) -> Result<WorkerHandle, ServiceError>;
}

/// Terminator shared by both launchers: waits on the published exit code,
/// and runs `kill` when forced.
struct ExitTerminator {
    exited: watch::Receiver<Option<i32>>,
    kill: Option<Box<dyn FnOnce() + Send>>,
}

#[async_trait]
impl WorkerTerminator for ExitTerminator {
    async fn terminate(&mut self, grace: Duration) -> Result<(), ServiceError> {
        match tokio::time::timeout(grace, self.exited.wait_for(Option::is_some)).await {
            Ok(_) => Ok(()),
            Err(_) => Err(ServiceError::Worker(format!(
                "WebRTC worker did not exit within {:?}",
                grace
            ))),
        }
    }

    fn force_terminate(&mut self) {
        if let Some(kill) = self.kill.take() {
            kill();
        }
    }
}

/// Runs the worker as a task in this process, behind its own panic boundary.
pub struct InProcessLauncher {
    provider: Option<Arc<dyn CredentialProvider>>,
}

impl InProcessLauncher {
    pub fn new() -> Self {
        InProcessLauncher { provider: None }
    }

    pub fn with_provider(provider: Arc<dyn CredentialProvider>) -> Self {
        InProcessLauncher {
            provider: Some(provider),
        }
    }
}

impl Default for InProcessLauncher {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl WorkerLauncher for InProcessLauncher {
    async fn launch(&self, config: &WorkerConfig) -> Result<WorkerHandle, ServiceError> {
        let provider = match &self.provider {
            Some(provider) => Arc::clone(provider),
            None => Arc::new(TelnyxProvider::from_config(config)),
        };

        let (worker, mut messages) = Worker::create(config, provider);
        let (commands, command_receiver) = unbounded_channel();
        let (event_sender, events) = unbounded_channel();
        let (exit_sender, exited) = watch::channel(None);

        let mut task = tokio::spawn(runtime::run(worker, command_receiver));
        let abort = task.abort_handle();

        tokio::spawn(async move {
            let code = loop {
                tokio::select! {
                    biased;
                    Some(message) = messages.recv() => {
                        let _ = event_sender.send(WorkerEvent::Message(message));
                    }
                    result = &mut task => break exit_code(result, &event_sender),
                }
            };

            while let Ok(message) = messages.try_recv() {
                let _ = event_sender.send(WorkerEvent::Message(message));
            }

            let _ = exit_sender.send(Some(code));
            let _ = event_sender.send(WorkerEvent::Exit(code));
        });

        Ok(WorkerHandle {
            commands,
            events,
            terminator: Box::new(ExitTerminator {
                exited,
                kill: Some(Box::new(move || abort.abort())),
            }),
        })
    }
}

fn exit_code(result: Result<i32, JoinError>, events: &UnboundedSender<WorkerEvent>) -> i32 {
    match result {
        Ok(code) => code,
        Err(error) if error.is_panic() => {
            let message = panic_message(error.into_panic().as_ref());
            let _ = events.send(WorkerEvent::Error(format!(
                "WebRTC worker panicked: {}",
                message
            )));
            1
        }
        Err(_) => 1,
    }
}

/// Runs the worker as a separate OS process speaking framed JSON over its
/// stdin and stdout.
pub struct ProcessLauncher {
    binary: Option<PathBuf>,
}

impl ProcessLauncher {
    pub fn new(binary: Option<PathBuf>) -> Self {
        ProcessLauncher { binary }
    }
}

enum WaitOutcome {
    Exited(std::io::Result<std::process::ExitStatus>),
    Kill,
}

#[async_trait]
impl WorkerLauncher for ProcessLauncher {
    async fn launch(&self, config: &WorkerConfig) -> Result<WorkerHandle, ServiceError> {
        let binary = match &self.binary {
            Some(binary) => binary.clone(),
            None => default_worker_binary()?,
        };

        let mut command = ProcessCommand::new(&binary);
        command
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::inherit())
            .kill_on_drop(true)
            .env(API_BASE_URL_ENV, &config.api_base_url);

        match &config.api_key {
            Some(api_key) => command.env(API_KEY_ENV, api_key),
            None => command.env_remove(API_KEY_ENV),
        };

        let mut child = command
            .spawn()
            .map_err(|error| ServiceError::Launch(format!("{}: {}", binary.display(), error)))?;

        let Some(mut stdin) = child.stdin.take() else {
            return Err(ServiceError::Launch("worker stdin unavailable".to_owned()));
        };
        let Some(mut stdout) = child.stdout.take() else {
            return Err(ServiceError::Launch("worker stdout unavailable".to_owned()));
        };

        debug!(pid = ?child.id(), binary = %binary.display(), "WebRTC worker process spawned");

        let (commands, mut command_receiver) = unbounded_channel::<Command>();
        let (event_sender, events) = unbounded_channel();
        let (exit_sender, exited) = watch::channel(None);
        let (kill_sender, kill_receiver) = oneshot::channel::<()>();

        tokio::spawn(async move {
            while let Some(command) = command_receiver.recv().await {
                if let Err(error) = write_frame(&mut stdin, &command).await {
                    warn!(%error, "Failed to write command to WebRTC worker");
                    break;
                }
            }
        });

        tokio::spawn(async move {
            let outcome = tokio::select! {
                status = child.wait() => WaitOutcome::Exited(status),
                _ = kill_receiver => WaitOutcome::Kill,
            };

            let status = match outcome {
                WaitOutcome::Exited(status) => status,
                WaitOutcome::Kill => {
                    let _ = child.start_kill();
                    child.wait().await
                }
            };

            let code = match status {
                Ok(status) => status.code().unwrap_or(-1),
                Err(error) => {
                    warn!(%error, "Failed to wait for WebRTC worker process");
                    -1
                }
            };

            let _ = exit_sender.send(Some(code));
        });

        let mut exit_watch = exited.clone();
        tokio::spawn(async move {
            loop {
                match read_frame::<_, ServiceMessage>(&mut stdout).await {
                    Ok(Some(message)) => {
                        let _ = event_sender.send(WorkerEvent::Message(message));
                    }
                    Ok(None) => break,
                    Err(error) => {
                        let error = ServiceError::Codec(error);
                        let _ = event_sender.send(WorkerEvent::Error(error.to_string()));
                        break;
                    }
                }
            }

            let code = match exit_watch.wait_for(Option::is_some).await {
                Ok(code) => code.unwrap_or(-1),
                Err(_) => -1,
            };
            let _ = event_sender.send(WorkerEvent::Exit(code));
        });

        Ok(WorkerHandle {
            commands,
            events,
            terminator: Box::new(ExitTerminator {
                exited,
                kill: Some(Box::new(move || {
                    let _ = kill_sender.send(());
                })),
            }),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        protocol::{CallDirection, ServiceStatus},
        worker::tests::MockProvider,
    };

    fn config(api_key: Option<&str>) -> WorkerConfig {
        WorkerConfig {
            api_key: api_key.map(str::to_owned),
            api_base_url: "http://127.0.0.1:9".to_owned(),
        }
    }

    async fn next_event(handle: &mut WorkerHandle) -> WorkerEvent {
        tokio::time::timeout(Duration::from_secs(2), handle.events.recv())
            .await
            .unwrap()
            .unwrap()
    }

    #[tokio::test]
    async fn in_process_worker_reports_ready_then_runs_commands() {
        let launcher = InProcessLauncher::with_provider(MockProvider::succeeding());
        let mut handle = launcher.launch(&config(Some("KEY"))).await.unwrap();

        assert_eq!(
            next_event(&mut handle).await,
            WorkerEvent::Message(ServiceMessage::Status {
                status: ServiceStatus::Ready
            })
        );

        handle
            .commands
            .send(Command::MakeCall {
                phone_number: "+15551234567".to_owned(),
            })
            .unwrap();

        match next_event(&mut handle).await {
            WorkerEvent::Message(ServiceMessage::CallOutgoing { call }) => {
                assert_eq!(call.direction, CallDirection::Outgoing);
            }
            other => panic!("unexpected event: {other:?}"),
        }

        handle.commands.send(Command::Shutdown).unwrap();
        handle.terminator.terminate(Duration::from_secs(2)).await.unwrap();

        let mut tail = Vec::new();
        while let Some(event) = handle.events.recv().await {
            tail.push(event);
        }

        assert!(matches!(tail[0], WorkerEvent::Message(ServiceMessage::CallEnded { .. })));
        assert_eq!(
            tail[1],
            WorkerEvent::Message(ServiceMessage::Status {
                status: ServiceStatus::Stopped
            })
        );
        assert_eq!(tail[2], WorkerEvent::Exit(0));
    }

    #[tokio::test]
    async fn in_process_worker_without_key_exits_with_one() {
        let launcher = InProcessLauncher::with_provider(MockProvider::succeeding());
        let mut handle = launcher.launch(&config(None)).await.unwrap();

        let mut events = Vec::new();
        while let Some(event) = handle.events.recv().await {
            events.push(event);
        }

        assert!(matches!(events[0], WorkerEvent::Message(ServiceMessage::Error { .. })));
        assert_eq!(events.last(), Some(&WorkerEvent::Exit(1)));
    }

    #[tokio::test]
    async fn forced_termination_aborts_the_worker() {
        let launcher = InProcessLauncher::with_provider(MockProvider::succeeding());
        let mut handle = launcher.launch(&config(Some("KEY"))).await.unwrap();
        next_event(&mut handle).await;

        handle.terminator.force_terminate();

        let mut last = None;
        while let Some(event) = handle.events.recv().await {
            last = Some(event);
        }
        assert_eq!(last, Some(WorkerEvent::Exit(1)));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn unframed_worker_output_is_a_codec_error() {
        // `yes` writes "y\n" forever, which reads as an oversized frame header.
        let launcher = ProcessLauncher::new(Some(PathBuf::from("yes")));
        let mut handle = launcher.launch(&config(Some("KEY"))).await.unwrap();

        match next_event(&mut handle).await {
            WorkerEvent::Error(message) => {
                assert!(message.starts_with("Invalid frame from WebRTC worker: Frame of"));
                assert!(message.ends_with("exceeds the 1 MiB limit"));
            }
            other => panic!("unexpected event: {other:?}"),
        }

        handle.terminator.force_terminate();
        assert!(matches!(next_event(&mut handle).await, WorkerEvent::Exit(_)));
    }

    #[tokio::test]
    async fn missing_worker_binary_is_a_launch_error() {
        let launcher = ProcessLauncher::new(Some(PathBuf::from(
            "/nonexistent/path/to/webrtc-worker",
        )));

        let result = launcher.launch(&config(Some("KEY"))).await;
        assert!(matches!(result, Err(ServiceError::Launch(_))));
    }
}
