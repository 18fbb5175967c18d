//! Wire and queue message types

use crate::crypto::{ExchangePublic, Signature, ENVELOPE_NONCE_SIZE};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::net::IpAddr;
use std::time::{SystemTime, UNIX_EPOCH};

/// Retry budget of a freshly scheduled task. Each lease spends one unit;
/// a task that runs dry is dropped rather than re-sent forever.
pub const INITIAL_TASK_TTL: u32 = 5;

/// Upper bound on a serialized parcel (transport framing limit).
pub const MAX_PARCEL_SIZE: usize = 2 * 1024 * 1024;

/// Microseconds since the Unix epoch.
pub fn now_micros() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_micros() as u64)
        .unwrap_or(0)
}

/// Canonical agent name, derived from the certificate subject. Keys every
/// per-agent structure and names the agent's outbound task queue.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct AgentId(String);

impl AgentId {
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<&str> for AgentId {
    fn from(value: &str) -> Self {
        Self(value.to_string())
    }
}

impl From<String> for AgentId {
    fn from(value: String) -> Self {
        Self(value)
    }
}

impl fmt::Display for AgentId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Logical flow identifier. The final path segment names the flow; for
/// well-known flows it is the handler name itself.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct SessionId(String);

impl SessionId {
    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn flow_name(&self) -> &str {
        self.0.rsplit('/').next().unwrap_or(&self.0)
    }
}

impl From<&str> for SessionId {
    fn from(value: &str) -> Self {
        Self(value.to_string())
    }
}

impl From<String> for SessionId {
    fn from(value: String) -> Self {
        Self(value)
    }
}

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub enum Priority {
    Low,
    #[default]
    Medium,
    High,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum MessageKind {
    #[default]
    Data,
    Status,
}

/// Outcome reported by a STATUS message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum StatusCode {
    Ok,
    GenericError,
    /// The agent process died while executing the request.
    ClientKilled,
}

/// One unit of the agent protocol. `(session_id, request_id)` names a
/// request, `(session_id, request_id, response_id)` a response; `task_id`
/// ties a message to a leased task on the agent's outbound queue.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Message {
    pub session_id: SessionId,
    pub request_id: u64,
    pub response_id: u64,
    pub task_id: u64,
    pub task_ttl: u32,
    pub priority: Priority,
    pub kind: MessageKind,
    pub payload: Vec<u8>,
}

impl Message {
    pub fn data(session_id: SessionId, request_id: u64, response_id: u64, payload: Vec<u8>) -> Self {
        Self {
            session_id,
            request_id,
            response_id,
            task_id: 0,
            task_ttl: INITIAL_TASK_TTL,
            priority: Priority::default(),
            kind: MessageKind::Data,
            payload,
        }
    }

    /// A STATUS reply closing `request_id`, referencing the leased task it
    /// completes.
    pub fn status(session_id: SessionId, request_id: u64, task_id: u64, code: StatusCode) -> Self {
        let payload = postcard::to_allocvec(&code).unwrap_or_default();
        Self {
            session_id,
            request_id,
            response_id: request_id,
            task_id,
            task_ttl: INITIAL_TASK_TTL,
            priority: Priority::default(),
            kind: MessageKind::Status,
            payload,
        }
    }

    /// Decoded status payload, for STATUS messages only.
    pub fn status_code(&self) -> Option<StatusCode> {
        if self.kind != MessageKind::Status {
            return None;
        }
        postcard::from_bytes(&self.payload).ok()
    }
}

/// A message under lease on an agent's outbound queue.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Task {
    pub agent: AgentId,
    pub message: Message,
    /// Lease expiry in microseconds; 0 means available.
    pub lease_until: u64,
}

impl Task {
    /// A new task with a full retry budget, immediately available.
    pub fn fresh(agent: AgentId, mut message: Message) -> Self {
        message.task_ttl = INITIAL_TASK_TTL;
        Self {
            agent,
            message,
            lease_until: 0,
        }
    }
}

/// The signed plaintext of a parcel.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SignedMessageList {
    pub timestamp: u64,
    pub messages: Vec<Message>,
}

/// Encrypted envelope for one bundle exchange.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Parcel {
    /// Identity claimed by the sender.
    pub source: AgentId,
    /// Network address observed by the transport.
    pub source_ip: Option<IpAddr>,
    /// Protocol revision; echoed back in the response.
    pub api_version: u32,
    /// Sender's estimate of spare inbound capacity.
    pub queue_size: u32,
    /// Sender clock, repeated inside the signed payload.
    pub timestamp: u64,
    pub ephemeral_key: ExchangePublic,
    pub nonce: [u8; ENVELOPE_NONCE_SIZE],
    pub ciphertext: Vec<u8>,
    /// Detached ML-DSA signature over the serialized message list.
    pub signature: Signature,
    /// Set by in-process transports that already verified this cipher's
    /// signature. Never read from the wire: a deserialized parcel always
    /// starts unverified.
    #[serde(skip)]
    pub cipher_verified: bool,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_flow_name_is_last_segment() {
        assert_eq!(SessionId::from("sessions/Stats").flow_name(), "Stats");
        assert_eq!(SessionId::from("sessions/F/W1").flow_name(), "W1");
        assert_eq!(SessionId::from("S1").flow_name(), "S1");
    }

    #[test]
    fn test_status_payload_round_trip() {
        let msg = Message::status(SessionId::from("sessions/S1"), 5, 42, StatusCode::ClientKilled);
        assert_eq!(msg.status_code(), Some(StatusCode::ClientKilled));

        let data = Message::data(SessionId::from("sessions/S1"), 5, 7, Vec::new());
        assert_eq!(data.status_code(), None);
    }

    #[test]
    fn test_fresh_task_has_full_budget() {
        let mut msg = Message::data(SessionId::from("sessions/S1"), 1, 0, Vec::new());
        msg.task_ttl = 1;
        let task = Task::fresh(AgentId::from("A1"), msg);
        assert_eq!(task.message.task_ttl, INITIAL_TASK_TTL);
        assert_eq!(task.lease_until, 0);
    }
}
