//! Host-facing manager for the WebRTC worker.
//!
//! The [`Supervisor`] owns the worker's lifecycle: it launches it, turns its
//! message stream into [`ServiceEvent`]s and request/response pairs, checks
//! its health periodically, and restarts it with a bounded, delayed policy
//! when it fails. Worker failures never escape as panics or errors into
//! unrelated host code; they surface as events or as the error of the call
//! that was waiting on the worker.

pub mod events;
pub mod launcher;

use std::{
    collections::HashMap,
    sync::{
        atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering},
        Arc, Mutex, MutexGuard, PoisonError,
    },
    time::Duration,
};

use tokio::{
    sync::{broadcast, mpsc::UnboundedReceiver, oneshot, watch},
    task::JoinHandle,
    time::MissedTickBehavior,
};
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::{
    config::ServiceConfig,
    error::{Result, ServiceError},
    protocol::{Command, Credential, ServiceMessage, ServiceStatus},
};

pub use events::ServiceEvent;
pub use launcher::{
    InProcessLauncher, ProcessLauncher, WorkerEvent, WorkerHandle, WorkerLauncher,
    WorkerTerminator,
};

const EVENT_CAPACITY: usize = 256;

struct WorkerSlot {
    generation: u64,
    started: bool,
    commands: tokio::sync::mpsc::UnboundedSender<Command>,
    terminator: Box<dyn WorkerTerminator>,
    pump: JoinHandle<()>,
    health: JoinHandle<()>,
}

struct Inner {
    config: ServiceConfig,
    launcher: Arc<dyn WorkerLauncher>,

    status: watch::Sender<ServiceStatus>,
    events: broadcast::Sender<ServiceEvent>,

    worker: Mutex<Option<WorkerSlot>>,
    pending: Mutex<HashMap<Uuid, oneshot::Sender<ServiceMessage>>>,
    lifecycle: tokio::sync::Mutex<()>,

    generation: AtomicU64,
    stop_epoch: AtomicU64,
    restart_attempts: AtomicU32,
    restarting: AtomicBool,
    gave_up: AtomicBool,
}

#[derive(Clone)]
pub struct Supervisor {
    inner: Arc<Inner>,
}

impl Supervisor {
    /// A supervisor that runs the worker as a separate process.
    pub fn new(config: ServiceConfig) -> Self {
        let launcher = Arc::new(ProcessLauncher::new(config.worker_binary.clone()));
        Self::with_launcher(config, launcher)
    }

    pub fn with_launcher(config: ServiceConfig, launcher: Arc<dyn WorkerLauncher>) -> Self {
        let (status, _) = watch::channel(ServiceStatus::Idle);
        let (events, _) = broadcast::channel(EVENT_CAPACITY);

        Supervisor {
            inner: Arc::new(Inner {
                config,
                launcher,
                status,
                events,
                worker: Mutex::new(None),
                pending: Mutex::new(HashMap::new()),
                lifecycle: tokio::sync::Mutex::new(()),
                generation: AtomicU64::new(0),
                stop_epoch: AtomicU64::new(0),
                restart_attempts: AtomicU32::new(0),
                restarting: AtomicBool::new(false),
                gave_up: AtomicBool::new(false),
            }),
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<ServiceEvent> {
        self.inner.events.subscribe()
    }

    pub fn get_status(&self) -> ServiceStatus {
        *self.inner.status.borrow()
    }

    pub fn is_running(&self) -> bool {
        self.slot().is_some()
    }

    pub fn restart_attempts(&self) -> u32 {
        self.inner.restart_attempts.load(Ordering::SeqCst)
    }

    fn slot(&self) -> MutexGuard<'_, Option<WorkerSlot>> {
        self.inner
            .worker
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    fn pending(&self) -> MutexGuard<'_, HashMap<Uuid, oneshot::Sender<ServiceMessage>>> {
        self.inner
            .pending
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    fn emit(&self, event: ServiceEvent) {
        // No subscribers is fine.
        let _ = self.inner.events.send(event);
    }

    /// The only way status changes. Repeating the current status is a no-op.
    fn set_status(&self, status: ServiceStatus) {
        let changed = self.inner.status.send_if_modified(|current| {
            if *current == status {
                false
            } else {
                *current = status;
                true
            }
        });

        if changed {
            info!(%status, "WebRTC service status changed");
            self.emit(ServiceEvent::Status(status));
        }
    }

    fn is_current(&self, generation: u64) -> bool {
        matches!(&*self.slot(), Some(slot) if slot.generation == generation)
    }

    fn take_slot_if(&self, generation: u64) -> Option<WorkerSlot> {
        let mut slot = self.slot();
        if slot.as_ref().map(|current| current.generation) == Some(generation) {
            slot.take()
        } else {
            None
        }
    }

    /// Kills a worker that is being given up on. Its pump keeps draining
    /// events but no longer affects status.
    fn discard(&self, mut slot: WorkerSlot) {
        slot.health.abort();
        slot.terminator.force_terminate();
        self.pending().clear();
    }

    /// Launches the worker and waits until it reports `ready`.
    pub async fn start(&self) -> Result<()> {
        self.start_unless_stopped(None).await
    }

    /// `epoch` ties a restart to the stop epoch it was scheduled in, so a
    /// `stop()` that lands during the backoff wins.
    async fn start_unless_stopped(&self, epoch: Option<u64>) -> Result<()> {
        let _lifecycle = self.inner.lifecycle.lock().await;

        if epoch.is_some_and(|epoch| epoch != self.inner.stop_epoch.load(Ordering::SeqCst)) {
            return Err(ServiceError::Stopped);
        }

        if self.is_running() {
            warn!("WebRTC worker already running");
            return Ok(());
        }

        self.set_status(ServiceStatus::Starting);
        let mut status = self.inner.status.subscribe();

        let handle = match self.inner.launcher.launch(&self.inner.config.worker).await {
            Ok(handle) => handle,
            Err(error) => {
                error!(%error, "Failed to launch WebRTC worker");
                self.set_status(ServiceStatus::Error);
                return Err(error);
            }
        };

        let generation = self.inner.generation.fetch_add(1, Ordering::SeqCst) + 1;
        let WorkerHandle {
            commands,
            events,
            terminator,
        } = handle;

        {
            let mut slot = self.slot();
            let pump = tokio::spawn(self.clone().pump(generation, events));
            let health = tokio::spawn(self.clone().health_loop(generation));

            *slot = Some(WorkerSlot {
                generation,
                started: false,
                commands,
                terminator,
                pump,
                health,
            });
        }

        let startup_timeout = self.inner.config.startup_timeout;
        let outcome = tokio::time::timeout(
            startup_timeout,
            status.wait_for(|s| matches!(s, ServiceStatus::Ready | ServiceStatus::Error)),
        )
        .await
        .map(|reached| reached.map(|s| *s));

        let failure = match outcome {
            Ok(Ok(ServiceStatus::Ready)) => {
                let mut slot = self.slot();
                match slot.as_mut() {
                    Some(current) if current.generation == generation => {
                        current.started = true;
                        None
                    }
                    _ => Some(ServiceError::StartupFailed(
                        "worker exited during startup".to_owned(),
                    )),
                }
            }
            Ok(Ok(_)) => Some(ServiceError::StartupFailed(
                "worker reported an error status".to_owned(),
            )),
            Ok(Err(_)) => Some(ServiceError::ChannelClosed),
            Err(_) => Some(ServiceError::StartupTimeout(startup_timeout)),
        };

        if let Some(error) = failure {
            error!(%error, "WebRTC worker failed to start");
            if let Some(slot) = self.take_slot_if(generation) {
                self.discard(slot);
            }
            self.set_status(ServiceStatus::Error);
            return Err(error);
        }

        self.inner.restart_attempts.store(0, Ordering::SeqCst);
        self.inner.gave_up.store(false, Ordering::SeqCst);
        info!(generation, "WebRTC worker started");

        Ok(())
    }

    /// Shuts the worker down, forcing it if it does not exit in time.
    pub async fn stop(&self) {
        let _lifecycle = self.inner.lifecycle.lock().await;
        self.inner.stop_epoch.fetch_add(1, Ordering::SeqCst);

        let taken = self.slot().take();
        let Some(mut slot) = taken else {
            return;
        };

        info!("Stopping WebRTC worker");
        slot.health.abort();

        let grace = self.inner.config.shutdown_grace;
        let graceful = match slot.commands.send(Command::Shutdown) {
            Ok(()) => slot.terminator.terminate(grace).await,
            Err(_) => Err(ServiceError::ChannelClosed),
        };

        if let Err(error) = graceful {
            warn!(%error, "Forcing WebRTC worker termination");
            slot.terminator.force_terminate();
        }

        // Let the pump forward what the worker said on its way out.
        drop(slot.commands);
        if tokio::time::timeout(grace, &mut slot.pump).await.is_err() {
            slot.pump.abort();
        }

        self.pending().clear();
        self.set_status(ServiceStatus::Stopped);
    }

    pub async fn generate_credential(&self, username: &str, ttl: Option<u64>) -> Result<Credential> {
        let request_id = Uuid::new_v4();
        let command = Command::GenerateCredential {
            request_id,
            username: username.to_owned(),
            ttl,
        };

        match self
            .request(request_id, command, self.inner.config.command_timeout)
            .await?
        {
            ServiceMessage::CredentialReady { credential, .. } => Ok(credential),
            other => Err(ServiceError::Worker(format!(
                "unexpected response to generate_credential: {:?}",
                other
            ))),
        }
    }

    pub fn make_call(&self, phone_number: &str) {
        self.post(Command::MakeCall {
            phone_number: phone_number.to_owned(),
        });
    }

    pub fn end_call(&self, call_id: &str) {
        self.post(Command::EndCall {
            call_id: call_id.to_owned(),
        });
    }

    pub fn answer_call(&self, call_id: &str) {
        self.post(Command::AnswerCall {
            call_id: call_id.to_owned(),
        });
    }

    /// `false` whenever the worker is absent, not ready, or does not answer
    /// in time. Never errors.
    pub async fn health_check(&self) -> bool {
        if self.get_status() != ServiceStatus::Ready || !self.is_running() {
            return false;
        }

        let request_id = Uuid::new_v4();
        let command = Command::HealthCheck { request_id };

        match self
            .request(request_id, command, self.inner.config.health_check_timeout)
            .await
        {
            Ok(ServiceMessage::HealthCheck { healthy, .. }) => healthy,
            Ok(_) => false,
            Err(error) => {
                warn!(%error, "WebRTC worker health check failed");
                false
            }
        }
    }

    fn send(&self, command: Command) -> Result<()> {
        match &*self.slot() {
            Some(slot) => slot
                .commands
                .send(command)
                .map_err(|_| ServiceError::ChannelClosed),
            None => Err(ServiceError::NotRunning),
        }
    }

    /// Fire-and-forget: the outcome arrives as events.
    fn post(&self, command: Command) {
        let name = command.name();
        if let Err(error) = self.send(command) {
            warn!(command = name, %error, "Dropping WebRTC command");
        }
    }

    /// Sends a command and waits for the message carrying its request id.
    async fn request(
        &self,
        request_id: Uuid,
        command: Command,
        timeout: Duration,
    ) -> Result<ServiceMessage> {
        let name = command.name();
        let (sender, receiver) = oneshot::channel();
        self.pending().insert(request_id, sender);

        if let Err(error) = self.send(command) {
            self.pending().remove(&request_id);
            return Err(error);
        }

        match tokio::time::timeout(timeout, receiver).await {
            Ok(Ok(ServiceMessage::Error { message, .. })) => Err(ServiceError::Worker(message)),
            Ok(Ok(message)) => Ok(message),
            Ok(Err(_)) => Err(ServiceError::ChannelClosed),
            Err(_) => {
                self.pending().remove(&request_id);
                Err(ServiceError::CommandTimeout {
                    command: name,
                    timeout,
                })
            }
        }
    }

    /// Forwards one worker's events until it exits or its stream breaks.
    async fn pump(self, generation: u64, mut events: UnboundedReceiver<WorkerEvent>) {
        loop {
            let Some(event) = events.recv().await else {
                self.worker_failed(generation, "WebRTC worker event stream closed");
                break;
            };

            match event {
                WorkerEvent::Message(message) => self.handle_message(generation, message),
                WorkerEvent::Error(message) => {
                    error!(%message, "WebRTC worker error");
                    self.emit(ServiceEvent::Error(message.clone()));
                    self.worker_failed(generation, &message);
                    break;
                }
                WorkerEvent::Exit(code) => {
                    self.worker_exited(generation, code);
                    break;
                }
            }
        }
    }

    fn handle_message(&self, generation: u64, message: ServiceMessage) {
        match &message {
            ServiceMessage::Status { status } => {
                if self.is_current(generation) {
                    self.set_status(*status);
                }
                return;
            }
            ServiceMessage::Error { message, .. } => {
                warn!(%message, "WebRTC worker reported an error");
            }
            _ => {}
        }

        self.emit(ServiceEvent::from(&message));

        if let Some(request_id) = message.request_id() {
            let waiting = self.pending().remove(&request_id);
            match waiting {
                Some(sender) => {
                    let _ = sender.send(message);
                }
                None => debug!(%request_id, "Response arrived with nobody waiting"),
            }
        }
    }

    fn worker_failed(&self, generation: u64, reason: &str) {
        let started = match &*self.slot() {
            Some(slot) if slot.generation == generation => slot.started,
            _ => return,
        };

        if !started {
            // start() sees this and cleans up.
            self.set_status(ServiceStatus::Error);
            return;
        }

        if let Some(slot) = self.take_slot_if(generation) {
            warn!(%reason, "WebRTC worker failed");
            self.discard(slot);
            self.set_status(ServiceStatus::Error);
            self.schedule_restart();
        }
    }

    fn worker_exited(&self, generation: u64, code: i32) {
        let started = match &*self.slot() {
            Some(slot) if slot.generation == generation => slot.started,
            _ => return,
        };

        if !started {
            warn!(code, "WebRTC worker exited during startup");
            self.set_status(ServiceStatus::Error);
            return;
        }

        let Some(slot) = self.take_slot_if(generation) else {
            return;
        };
        self.discard(slot);

        if code == 0 {
            info!("WebRTC worker exited");
            self.set_status(ServiceStatus::Stopped);
        } else {
            error!(code, "WebRTC worker exited unexpectedly");
            self.set_status(ServiceStatus::Error);
            self.schedule_restart();
        }
    }

    async fn health_loop(self, generation: u64) {
        let mut ticker = tokio::time::interval(self.inner.config.health_check_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        ticker.tick().await;

        loop {
            ticker.tick().await;

            if !self.is_current(generation) {
                break;
            }
            if self.get_status() != ServiceStatus::Ready {
                continue;
            }
            if self.health_check().await {
                continue;
            }

            warn!("WebRTC worker unresponsive, restarting");
            if let Some(slot) = self.take_slot_if(generation) {
                self.set_status(ServiceStatus::Error);
                self.schedule_restart();
                // Aborts this task too; nothing below awaits.
                self.discard(slot);
            }
            break;
        }
    }

    fn schedule_restart(&self) {
        tokio::spawn(self.clone().attempt_restart());
    }

    /// Bounded, fixed-backoff restart. Concurrent triggers collapse into the
    /// one already running.
    ///
    /// A failed `start()` does not wait for another worker failure: the loop
    /// retries at once, and each attempt counts against the ceiling. So a
    /// single crash can lead to `max_restart_attempts` launches followed by
    /// `fatal_error`.
    async fn attempt_restart(self) {
        if self.inner.restarting.swap(true, Ordering::SeqCst) {
            debug!("WebRTC worker restart already in progress");
            return;
        }

        let epoch = self.inner.stop_epoch.load(Ordering::SeqCst);
        let max_attempts = self.inner.config.max_restart_attempts;

        loop {
            let attempts = self.inner.restart_attempts.load(Ordering::SeqCst);
            if attempts >= max_attempts {
                if !self.inner.gave_up.swap(true, Ordering::SeqCst) {
                    let message = format!(
                        "WebRTC worker failed after {} restart attempts",
                        attempts
                    );
                    error!(attempts, "{}", message);
                    self.emit(ServiceEvent::FatalError(message));
                }
                break;
            }

            let attempt = self.inner.restart_attempts.fetch_add(1, Ordering::SeqCst) + 1;
            warn!(attempt, max_attempts, "Restarting WebRTC worker");

            tokio::time::sleep(self.inner.config.restart_backoff).await;

            match self.start_unless_stopped(Some(epoch)).await {
                Ok(()) => {
                    info!(attempt, "WebRTC worker restarted");
                    break;
                }
                Err(ServiceError::Stopped) => {
                    info!("WebRTC service stopped, abandoning restart");
                    break;
                }
                Err(error) => error!(attempt, %error, "WebRTC worker restart failed"),
            }
        }

        self.inner.restarting.store(false, Ordering::SeqCst);
    }
}
