//! Types exchanged between the supervisor and the worker.
//!
//! Commands flow supervisor -> worker, messages flow worker -> supervisor.
//! Both are tagged with a `type` field so they can cross a process boundary
//! as framed JSON (see [`codec`]).

pub mod codec;

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ServiceStatus {
    Idle,
    Starting,
    Ready,
    Error,
    Stopped,
}

impl fmt::Display for ServiceStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ServiceStatus::Idle => "idle",
            ServiceStatus::Starting => "starting",
            ServiceStatus::Ready => "ready",
            ServiceStatus::Error => "error",
            ServiceStatus::Stopped => "stopped",
        };

        f.write_str(name)
    }
}

#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum CallDirection {
    Incoming,
    Outgoing,
}

#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum CallStatus {
    Ringing,
    Dialing,
    Active,
}

/// A call tracked by the worker. Call messages carry a snapshot of it.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct ActiveCall {
    pub id: String,
    pub phone_number: String,
    pub direction: CallDirection,
    pub status: CallStatus,
    pub start_time: DateTime<Utc>,
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct TurnServer {
    pub urls: String,
    pub username: String,
    pub credential: String,
}

/// Short-lived connection parameters for a media session. Never cached;
/// request a new one once `expires_at` has passed.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct Credential {
    pub username: String,
    pub password: String,
    pub expires_at: DateTime<Utc>,
    pub realm: String,
    pub sip_uri: String,
    pub stun_servers: Vec<String>,
    pub turn_servers: Vec<TurnServer>,
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Command {
    Initialize,
    GenerateCredential {
        request_id: Uuid,
        username: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        ttl: Option<u64>,
    },
    MakeCall {
        phone_number: String,
    },
    EndCall {
        call_id: String,
    },
    AnswerCall {
        call_id: String,
    },
    HealthCheck {
        request_id: Uuid,
    },
    Shutdown,
}

impl Command {
    pub fn name(&self) -> &'static str {
        match self {
            Command::Initialize => "initialize",
            Command::GenerateCredential { .. } => "generate_credential",
            Command::MakeCall { .. } => "make_call",
            Command::EndCall { .. } => "end_call",
            Command::AnswerCall { .. } => "answer_call",
            Command::HealthCheck { .. } => "health_check",
            Command::Shutdown => "shutdown",
        }
    }

    /// The id a response to this command will echo back, if it expects one.
    pub fn request_id(&self) -> Option<Uuid> {
        match self {
            Command::GenerateCredential { request_id, .. } | Command::HealthCheck { request_id } => {
                Some(*request_id)
            }
            _ => None,
        }
    }
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServiceMessage {
    Status {
        status: ServiceStatus,
    },
    Error {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        request_id: Option<Uuid>,
        message: String,
    },
    CallIncoming {
        call: ActiveCall,
    },
    CallOutgoing {
        call: ActiveCall,
    },
    CallEnded {
        call_id: String,
        phone_number: String,
        duration_ms: u64,
    },
    CredentialReady {
        request_id: Uuid,
        credential: Credential,
    },
    HealthCheck {
        request_id: Uuid,
        healthy: bool,
    },
}

impl ServiceMessage {
    pub fn error(request_id: Option<Uuid>, message: impl Into<String>) -> Self {
        ServiceMessage::Error {
            request_id,
            message: message.into(),
        }
    }

    /// The request this message answers, if any.
    pub fn request_id(&self) -> Option<Uuid> {
        match self {
            ServiceMessage::Error { request_id, .. } => *request_id,
            ServiceMessage::CredentialReady { request_id, .. }
            | ServiceMessage::HealthCheck { request_id, .. } => Some(*request_id),
            _ => None,
        }
    }
}
