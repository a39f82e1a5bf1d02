//! The isolated side: owns call state and talks to the telephony provider.
//!
//! A [`Worker`] never reaches into the host application. Every state change
//! and every failure goes out as a [`ServiceMessage`] on its outbound
//! channel, and no command handler is allowed to take the worker down.

pub mod credential;
pub mod provider;
pub mod runtime;

use std::{collections::HashMap, panic::AssertUnwindSafe, sync::Arc};

use chrono::Utc;
use futures_util::FutureExt;
use tokio::sync::mpsc::{unbounded_channel, UnboundedReceiver, UnboundedSender};
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::{
    config::WorkerConfig,
    error::WorkerError,
    protocol::{
        ActiveCall, CallDirection, CallStatus, Command, Credential, ServiceMessage, ServiceStatus,
    },
};

use provider::CredentialProvider;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkerFlow {
    Continue,
    Exit(i32),
}

pub struct Worker {
    api_key: Option<String>,
    provider: Arc<dyn CredentialProvider>,
    outbound: UnboundedSender<ServiceMessage>,
    initialized: bool,
    running: bool,
    active_calls: HashMap<String, ActiveCall>,
}

impl Worker {
    pub fn create(
        config: &WorkerConfig,
        provider: Arc<dyn CredentialProvider>,
    ) -> (Worker, UnboundedReceiver<ServiceMessage>) {
        let (outbound, outbound_receiver) = unbounded_channel();

        let worker = Worker {
            api_key: config.api_key.clone().filter(|key| !key.is_empty()),
            provider,
            outbound,
            initialized: false,
            running: true,
            active_calls: HashMap::new(),
        };

        (worker, outbound_receiver)
    }

    pub fn is_initialized(&self) -> bool {
        self.initialized
    }

    pub fn is_running(&self) -> bool {
        self.running
    }

    pub fn active_calls(&self) -> &HashMap<String, ActiveCall> {
        &self.active_calls
    }

    fn emit(&self, message: ServiceMessage) {
        // Nobody left to tell once the supervisor side is gone.
        let _ = self.outbound.send(message);
    }

    fn emit_status(&self, status: ServiceStatus) {
        self.emit(ServiceMessage::Status { status });
    }

    /// Reports a failure that escaped a command handler. The worker keeps
    /// running; restarting is the supervisor's call.
    pub fn report_fault(&self, message: &str) {
        error!(%message, "WebRTC worker fault");
        self.emit(ServiceMessage::error(None, message));
        self.emit_status(ServiceStatus::Error);
    }

    pub fn initialize(&mut self) -> Result<(), WorkerError> {
        if self.api_key.is_none() {
            let error = WorkerError::MissingApiKey;
            self.emit(ServiceMessage::error(None, error.to_string()));
            self.emit_status(ServiceStatus::Error);
            return Err(error);
        }

        self.initialized = true;
        info!("WebRTC worker initialized");
        self.emit_status(ServiceStatus::Ready);

        Ok(())
    }

    /// Runs one command. Failures become `error` messages carrying the
    /// command's request id.
    pub fn handle(&mut self, command: Command) -> WorkerFlow {
        let request_id = command.request_id();
        let name = command.name();

        debug!(command = name, "Handling command");

        let result = match command {
            Command::Initialize => {
                if let Err(error) = self.initialize() {
                    debug!(%error, "Initialize command failed");
                }
                Ok(WorkerFlow::Continue)
            }
            Command::GenerateCredential {
                request_id,
                username,
                ttl,
            } => {
                self.generate_credential(request_id, username, ttl);
                Ok(WorkerFlow::Continue)
            }
            Command::MakeCall { phone_number } => {
                self.make_call(phone_number).map(|_| WorkerFlow::Continue)
            }
            Command::EndCall { call_id } => self.end_call(&call_id).map(|_| WorkerFlow::Continue),
            Command::AnswerCall { call_id } => {
                self.answer_call(&call_id).map(|_| WorkerFlow::Continue)
            }
            Command::HealthCheck { request_id } => {
                self.health_check(request_id);
                Ok(WorkerFlow::Continue)
            }
            Command::Shutdown => Ok(self.shutdown()),
        };

        match result {
            Ok(flow) => flow,
            Err(error) => {
                warn!(command = name, %error, "Command failed");
                self.emit(ServiceMessage::error(request_id, error.to_string()));
                WorkerFlow::Continue
            }
        }
    }

    /// Issues the credential on its own task so a slow provider never holds
    /// up health checks or call commands.
    fn generate_credential(&self, request_id: Uuid, username: String, ttl: Option<u64>) {
        let provider = Arc::clone(&self.provider);
        let outbound = self.outbound.clone();

        tokio::spawn(async move {
            let outcome = AssertUnwindSafe(issue_credential(provider.as_ref(), &username, ttl))
                .catch_unwind()
                .await;

            let message = match outcome {
                Ok(Ok(credential)) => {
                    info!(username = %credential.username, "Credential issued");
                    ServiceMessage::CredentialReady {
                        request_id,
                        credential,
                    }
                }
                Ok(Err(error)) => {
                    warn!(%error, "Credential request failed");
                    ServiceMessage::error(Some(request_id), error.to_string())
                }
                Err(panic) => {
                    let message = runtime::panic_message(panic.as_ref());
                    error!(%message, "Credential task panicked");
                    ServiceMessage::error(Some(request_id), message)
                }
            };

            let _ = outbound.send(message);
        });
    }

    pub fn make_call(&mut self, phone_number: String) -> Result<String, WorkerError> {
        if !self.initialized {
            return Err(WorkerError::NotInitialized);
        }

        let call = ActiveCall {
            id: Uuid::new_v4().to_string(),
            phone_number,
            direction: CallDirection::Outgoing,
            status: CallStatus::Dialing,
            start_time: Utc::now(),
        };
        let call_id = call.id.clone();

        info!(call_id = %call.id, phone_number = %call.phone_number, "Dialing");

        self.active_calls.insert(call_id.clone(), call.clone());
        self.emit(ServiceMessage::CallOutgoing { call });

        Ok(call_id)
    }

    /// Registers a call offered by the signaling layer; it rings until
    /// answered. No [`Command`] maps here: the supervisor cannot create
    /// incoming calls, only the signaling integration running inside the
    /// worker process calls this.
    pub fn accept_incoming(&mut self, phone_number: String) -> Result<String, WorkerError> {
        if !self.initialized {
            return Err(WorkerError::NotInitialized);
        }

        let call = ActiveCall {
            id: Uuid::new_v4().to_string(),
            phone_number,
            direction: CallDirection::Incoming,
            status: CallStatus::Ringing,
            start_time: Utc::now(),
        };
        let call_id = call.id.clone();

        info!(call_id = %call.id, phone_number = %call.phone_number, "Incoming call");

        self.active_calls.insert(call_id.clone(), call.clone());
        self.emit(ServiceMessage::CallIncoming { call });

        Ok(call_id)
    }

    pub fn end_call(&mut self, call_id: &str) -> Result<(), WorkerError> {
        let call = self
            .active_calls
            .remove(call_id)
            .ok_or_else(|| WorkerError::CallNotFound(call_id.to_owned()))?;

        self.emit_call_ended(call);
        Ok(())
    }

    pub fn answer_call(&mut self, call_id: &str) -> Result<(), WorkerError> {
        let call = self
            .active_calls
            .get_mut(call_id)
            .ok_or_else(|| WorkerError::CallNotFound(call_id.to_owned()))?;

        call.status = CallStatus::Active;
        info!(call_id = %call.id, "Call answered");

        let call = call.clone();
        self.emit(ServiceMessage::CallIncoming { call });

        Ok(())
    }

    pub fn health_check(&self, request_id: Uuid) {
        self.emit(ServiceMessage::HealthCheck {
            request_id,
            healthy: self.initialized && self.running,
        });
    }

    /// Force-ends every call, reports `stopped` and asks the runtime to exit.
    pub fn shutdown(&mut self) -> WorkerFlow {
        self.running = false;

        let calls: Vec<ActiveCall> = self.active_calls.drain().map(|(_, call)| call).collect();
        for call in calls {
            self.emit_call_ended(call);
        }

        info!("WebRTC worker stopped");
        self.emit_status(ServiceStatus::Stopped);

        WorkerFlow::Exit(0)
    }

    fn emit_call_ended(&self, call: ActiveCall) {
        let duration_ms = (Utc::now() - call.start_time).num_milliseconds().max(0) as u64;

        info!(call_id = %call.id, duration_ms, "Call ended");

        self.emit(ServiceMessage::CallEnded {
            call_id: call.id,
            phone_number: call.phone_number,
            duration_ms,
        });
    }
}

async fn issue_credential(
    provider: &dyn CredentialProvider,
    username: &str,
    ttl: Option<u64>,
) -> Result<Credential, WorkerError> {
    let request = credential::build_request(username, ttl, Utc::now());
    let response = provider.create_credential(&request).await?;

    Ok(credential::assemble(&request, response, Utc::now()))
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::{
        error::ProviderError,
        worker::provider::{CredentialRequest, ProviderCredential},
    };
    use async_trait::async_trait;
    use std::sync::Mutex;

    /// Records requests and replies with a canned outcome.
    pub(crate) struct MockProvider {
        pub requests: Mutex<Vec<CredentialRequest>>,
        pub fail_with: Option<(u16, String)>,
    }

    impl MockProvider {
        pub fn succeeding() -> Arc<Self> {
            Arc::new(MockProvider {
                requests: Mutex::new(Vec::new()),
                fail_with: None,
            })
        }

        pub fn failing(status: u16, body: &str) -> Arc<Self> {
            Arc::new(MockProvider {
                requests: Mutex::new(Vec::new()),
                fail_with: Some((status, body.to_owned())),
            })
        }
    }

    #[async_trait]
    impl CredentialProvider for MockProvider {
        async fn create_credential(
            &self,
            request: &CredentialRequest,
        ) -> Result<ProviderCredential, ProviderError> {
            self.requests.lock().unwrap().push(request.clone());

            match &self.fail_with {
                Some((status, body)) => Err(ProviderError::Http {
                    status: *status,
                    body: body.clone(),
                }),
                None => Ok(ProviderCredential::default()),
            }
        }
    }

    fn config(api_key: Option<&str>) -> WorkerConfig {
        WorkerConfig {
            api_key: api_key.map(str::to_owned),
            api_base_url: "http://127.0.0.1:9".to_owned(),
        }
    }

    fn ready_worker() -> (Worker, UnboundedReceiver<ServiceMessage>) {
        let (mut worker, mut messages) =
            Worker::create(&config(Some("KEY")), MockProvider::succeeding());
        worker.initialize().unwrap();
        assert_eq!(
            messages.try_recv().unwrap(),
            ServiceMessage::Status {
                status: ServiceStatus::Ready
            }
        );
        (worker, messages)
    }

    fn drain(messages: &mut UnboundedReceiver<ServiceMessage>) -> Vec<ServiceMessage> {
        let mut drained = Vec::new();
        while let Ok(message) = messages.try_recv() {
            drained.push(message);
        }
        drained
    }

    #[test]
    fn initialize_without_api_key_reports_error_then_status() {
        let (mut worker, mut messages) = Worker::create(&config(None), MockProvider::succeeding());

        assert!(matches!(worker.initialize(), Err(WorkerError::MissingApiKey)));
        assert!(!worker.is_initialized());

        let drained = drain(&mut messages);
        assert!(matches!(
            &drained[0],
            ServiceMessage::Error { request_id: None, message } if message.contains("TELNYX_API_KEY")
        ));
        assert_eq!(
            drained[1],
            ServiceMessage::Status {
                status: ServiceStatus::Error
            }
        );
    }

    #[test]
    fn make_call_requires_initialization() {
        let (mut worker, mut messages) =
            Worker::create(&config(Some("KEY")), MockProvider::succeeding());

        worker.handle(Command::MakeCall {
            phone_number: "+15551234567".to_owned(),
        });

        assert!(worker.active_calls().is_empty());
        assert_eq!(
            drain(&mut messages),
            vec![ServiceMessage::error(None, "Worker not initialized")]
        );
    }

    #[test]
    fn make_then_end_call() {
        let (mut worker, mut messages) = ready_worker();

        let flow = worker.handle(Command::MakeCall {
            phone_number: "+15551234567".to_owned(),
        });
        assert_eq!(flow, WorkerFlow::Continue);
        assert_eq!(worker.active_calls().len(), 1);

        let call = worker.active_calls().values().next().unwrap().clone();
        assert_eq!(call.phone_number, "+15551234567");
        assert_eq!(call.direction, CallDirection::Outgoing);
        assert_eq!(call.status, CallStatus::Dialing);
        assert!(!call.id.is_empty());

        assert_eq!(
            drain(&mut messages),
            vec![ServiceMessage::CallOutgoing { call: call.clone() }]
        );

        worker.handle(Command::EndCall {
            call_id: call.id.clone(),
        });
        assert!(worker.active_calls().is_empty());

        match &drain(&mut messages)[..] {
            [ServiceMessage::CallEnded {
                call_id,
                phone_number,
                ..
            }] => {
                assert_eq!(call_id, &call.id);
                assert_eq!(phone_number, "+15551234567");
            }
            other => panic!("unexpected messages: {other:?}"),
        }
    }

    #[test]
    fn call_ids_are_unique() {
        let (mut worker, _messages) = ready_worker();

        let first = worker.make_call("+15551234567".to_owned()).unwrap();
        let second = worker.make_call("+15551234567".to_owned()).unwrap();

        assert_ne!(first, second);
        assert_eq!(worker.active_calls().len(), 2);
    }

    #[test]
    fn end_unknown_call_leaves_table_untouched() {
        let (mut worker, mut messages) = ready_worker();
        worker.make_call("+15551234567".to_owned()).unwrap();
        drain(&mut messages);

        worker.handle(Command::EndCall {
            call_id: "missing".to_owned(),
        });

        assert_eq!(worker.active_calls().len(), 1);
        assert_eq!(
            drain(&mut messages),
            vec![ServiceMessage::error(None, "Call missing not found")]
        );
    }

    #[test]
    fn answering_an_incoming_call_makes_it_active() {
        let (mut worker, mut messages) = ready_worker();

        let call_id = worker.accept_incoming("+15557654321".to_owned()).unwrap();
        match &drain(&mut messages)[..] {
            [ServiceMessage::CallIncoming { call }] => {
                assert_eq!(call.status, CallStatus::Ringing);
                assert_eq!(call.direction, CallDirection::Incoming);
            }
            other => panic!("unexpected messages: {other:?}"),
        }

        worker.handle(Command::AnswerCall {
            call_id: call_id.clone(),
        });

        assert_eq!(worker.active_calls()[&call_id].status, CallStatus::Active);
        match &drain(&mut messages)[..] {
            [ServiceMessage::CallIncoming { call }] => {
                assert_eq!(call.id, call_id);
                assert_eq!(call.status, CallStatus::Active);
            }
            other => panic!("unexpected messages: {other:?}"),
        }
    }

    #[test]
    fn answer_unknown_call_is_an_error() {
        let (mut worker, mut messages) = ready_worker();

        worker.handle(Command::AnswerCall {
            call_id: "nope".to_owned(),
        });

        assert_eq!(
            drain(&mut messages),
            vec![ServiceMessage::error(None, "Call nope not found")]
        );
    }

    #[test]
    fn health_reflects_initialized_and_running() {
        let (mut worker, mut messages) =
            Worker::create(&config(Some("KEY")), MockProvider::succeeding());
        let request_id = Uuid::new_v4();

        worker.handle(Command::HealthCheck { request_id });
        assert_eq!(
            drain(&mut messages),
            vec![ServiceMessage::HealthCheck {
                request_id,
                healthy: false
            }]
        );

        worker.initialize().unwrap();
        drain(&mut messages);
        worker.handle(Command::HealthCheck { request_id });
        assert_eq!(
            drain(&mut messages),
            vec![ServiceMessage::HealthCheck {
                request_id,
                healthy: true
            }]
        );
    }

    #[test]
    fn shutdown_ends_every_call_before_stopping() {
        let (mut worker, mut messages) = ready_worker();
        for n in 0..3 {
            worker.make_call(format!("+1555000000{n}")).unwrap();
        }
        worker.accept_incoming("+15557654321".to_owned()).unwrap();
        drain(&mut messages);

        let flow = worker.handle(Command::Shutdown);

        assert_eq!(flow, WorkerFlow::Exit(0));
        assert!(!worker.is_running());
        assert!(worker.active_calls().is_empty());

        let drained = drain(&mut messages);
        assert_eq!(drained.len(), 5);
        assert!(drained[..4]
            .iter()
            .all(|m| matches!(m, ServiceMessage::CallEnded { .. })));
        assert_eq!(
            drained[4],
            ServiceMessage::Status {
                status: ServiceStatus::Stopped
            }
        );
    }

    #[tokio::test]
    async fn credential_request_sanitizes_username() {
        let provider = MockProvider::succeeding();
        let (mut worker, mut messages) = Worker::create(&config(Some("KEY")), provider.clone());
        worker.initialize().unwrap();
        messages.recv().await.unwrap();

        let request_id = Uuid::new_v4();
        let before = Utc::now();
        worker.handle(Command::GenerateCredential {
            request_id,
            username: "john doe!!".to_owned(),
            ttl: None,
        });

        let message = messages.recv().await.unwrap();
        let ServiceMessage::CredentialReady {
            request_id: echoed,
            credential,
        } = message
        else {
            panic!("expected credential_ready, got {message:?}");
        };

        assert_eq!(echoed, request_id);
        assert!(credential.username.starts_with("johndoe"));
        assert!(credential.expires_at >= before);
        assert!(credential.expires_at >= before + chrono::Duration::seconds(86_399));

        let requests = provider.requests.lock().unwrap();
        assert_eq!(requests.len(), 1);
        assert!(requests[0].connection_name.starts_with("webrtc-johndoe"));
    }

    #[tokio::test]
    async fn provider_failure_is_reported_with_request_id() {
        let (mut worker, mut messages) = Worker::create(
            &config(Some("KEY")),
            MockProvider::failing(401, "unauthorized"),
        );
        let request_id = Uuid::new_v4();

        worker.handle(Command::GenerateCredential {
            request_id,
            username: "!!!".to_owned(),
            ttl: Some(60),
        });

        assert_eq!(
            messages.recv().await.unwrap(),
            ServiceMessage::error(Some(request_id), "Telnyx API error: 401 unauthorized")
        );
    }
}
