use crate::protocol::{ActiveCall, Credential, ServiceMessage, ServiceStatus};

/// What subscribers of the service observe.
#[derive(Debug, Clone, PartialEq)]
pub enum ServiceEvent {
    Status(ServiceStatus),
    Error(String),
    CallIncoming(ActiveCall),
    CallOutgoing(ActiveCall),
    CallEnded {
        call_id: String,
        phone_number: String,
        duration_ms: u64,
    },
    CredentialReady(Credential),
    HealthCheck(bool),
    /// Restart attempts are exhausted; telephony stays unavailable until the
    /// host starts the service again.
    FatalError(String),
}

impl ServiceEvent {
    pub fn name(&self) -> &'static str {
        match self {
            ServiceEvent::Status(_) => "status",
            ServiceEvent::Error(_) => "error",
            ServiceEvent::CallIncoming(_) => "call:incoming",
            ServiceEvent::CallOutgoing(_) => "call:outgoing",
            ServiceEvent::CallEnded { .. } => "call:ended",
            ServiceEvent::CredentialReady(_) => "credential:ready",
            ServiceEvent::HealthCheck(_) => "health_check",
            ServiceEvent::FatalError(_) => "fatal_error",
        }
    }
}

impl From<&ServiceMessage> for ServiceEvent {
    fn from(message: &ServiceMessage) -> Self {
        match message {
            ServiceMessage::Status { status } => ServiceEvent::Status(*status),
            ServiceMessage::Error { message, .. } => ServiceEvent::Error(message.clone()),
            ServiceMessage::CallIncoming { call } => ServiceEvent::CallIncoming(call.clone()),
            ServiceMessage::CallOutgoing { call } => ServiceEvent::CallOutgoing(call.clone()),
            ServiceMessage::CallEnded {
                call_id,
                phone_number,
                duration_ms,
            } => ServiceEvent::CallEnded {
                call_id: call_id.clone(),
                phone_number: phone_number.clone(),
                duration_ms: *duration_ms,
            },
            ServiceMessage::CredentialReady { credential, .. } => {
                ServiceEvent::CredentialReady(credential.clone())
            }
            ServiceMessage::HealthCheck { healthy, .. } => ServiceEvent::HealthCheck(*healthy),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn event_names_match_subscription_vocabulary() {
        let names: Vec<&str> = [
            ServiceEvent::Status(ServiceStatus::Idle),
            ServiceEvent::Error(String::new()),
            ServiceEvent::CallEnded {
                call_id: String::new(),
                phone_number: String::new(),
                duration_ms: 0,
            },
            ServiceEvent::HealthCheck(true),
            ServiceEvent::FatalError(String::new()),
        ]
        .iter()
        .map(ServiceEvent::name)
        .collect();

        assert_eq!(
            names,
            vec!["status", "error", "call:ended", "health_check", "fatal_error"]
        );
    }

    #[test]
    fn messages_map_onto_events() {
        let event = ServiceEvent::from(&ServiceMessage::HealthCheck {
            request_id: uuid::Uuid::new_v4(),
            healthy: true,
        });

        assert_eq!(event, ServiceEvent::HealthCheck(true));
        assert_eq!(event.name(), "health_check");
    }
}
