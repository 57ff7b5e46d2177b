//! Pub/sub relay interface
//!
//! The relay is room-scoped and best-effort: every subscriber of a room sees
//! messages in send order, senders receive their own messages back, and a
//! message may be delivered more than once. Callers de-duplicate.

pub mod memory;

pub use memory::LocalRelay;

use crate::event::{BreathEvent, BreathPhase, BreathSource, ParticipantId};
use crate::session::{ActivityKind, SessionCode};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::broadcast;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum TransportError {
    #[error("Relay unreachable")]
    Unreachable,
    #[error("Session not found: {0}")]
    SessionNotFound(SessionCode),
    #[error("Session is full: {0}")]
    SessionFull(SessionCode),
    #[error("Session has ended: {0}")]
    SessionEnded(SessionCode),
    #[error("Relay rejected request: {0}")]
    Rejected(String),
}

/// Messages delivered to every subscriber of a session
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum RelayEvent {
    ParticipantJoined {
        participant_id: ParticipantId,
        name: String,
    },
    ParticipantLeft {
        participant_id: ParticipantId,
    },
    BreathSync {
        participant_id: ParticipantId,
        phase: BreathPhase,
        seq: u64,
        source: BreathSource,
        /// Sender's clock; informational only
        timestamp_ms: u64,
    },
    ExerciseStart {
        kind: ActivityKind,
        payload: serde_json::Value,
    },
    SessionEnded,
}

/// Result of creating a session
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionTicket {
    pub code: SessionCode,
    pub host_id: ParticipantId,
}

/// Result of joining a session
#[derive(Debug, Clone, PartialEq)]
pub struct JoinTicket {
    pub participant_id: ParticipantId,
    pub host_id: ParticipantId,
    pub kind: ActivityKind,
    /// Whether the host has already started the exercise
    pub started: bool,
    /// Members present before this join, host included
    pub roster: Vec<(ParticipantId, String)>,
}

/// Room-scoped message relay between clients
#[async_trait]
pub trait SyncTransport: Send + Sync {
    /// Check that the relay can be reached
    async fn connect(&self) -> bool;

    async fn create_session(
        &self,
        kind: ActivityKind,
        host_name: &str,
        code_prefix: &str,
    ) -> Result<SessionTicket, TransportError>;

    async fn join_session(&self, code: &SessionCode, name: &str) -> Result<JoinTicket, TransportError>;

    async fn leave_session(
        &self,
        code: &SessionCode,
        participant_id: ParticipantId,
    ) -> Result<(), TransportError>;

    /// Broadcast one breath phase for `event.participant_id`
    async fn send_breath_phase(
        &self,
        code: &SessionCode,
        event: &BreathEvent,
        phase: BreathPhase,
    ) -> Result<(), TransportError>;

    async fn start_exercise(
        &self,
        code: &SessionCode,
        kind: ActivityKind,
        payload: serde_json::Value,
    ) -> Result<(), TransportError>;

    /// End a session. Ending an ended session succeeds without broadcasting.
    async fn end_session(&self, code: &SessionCode) -> Result<(), TransportError>;

    /// Receive every message sent to the session from now on
    fn subscribe(&self, code: &SessionCode) -> Result<broadcast::Receiver<RelayEvent>, TransportError>;
}
