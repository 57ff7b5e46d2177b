//! Session model and lifecycle
//!
//! A session moves lobby -> active -> ended, never backwards and never
//! skipping a step. The host owns the lifecycle; scoring is per client.

use crate::event::ParticipantId;
use crate::registry::{Participant, ParticipantRegistry};
use crate::transport::TransportError;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;
use tracing::info;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum SessionError {
    #[error("Could not create session: {0}")]
    Create(TransportError),
    #[error("Session not found: {0}")]
    NotFound(SessionCode),
    #[error("Session is full: {0}")]
    Full(SessionCode),
    #[error("Session has ended: {0}")]
    Ended(SessionCode),
    #[error("Relay error: {0}")]
    Transport(TransportError),
    #[error("Cannot move session from {from} to {to}")]
    InvalidTransition {
        from: SessionState,
        to: SessionState,
    },
    #[error("Only the host can {0}")]
    NotHost(&'static str),
    #[error("Already in session {0}")]
    AlreadyInSession(SessionCode),
    #[error("No session")]
    NoSession,
}

impl From<TransportError> for SessionError {
    fn from(e: TransportError) -> Self {
        match e {
            TransportError::SessionNotFound(code) => SessionError::NotFound(code),
            TransportError::SessionFull(code) => SessionError::Full(code),
            TransportError::SessionEnded(code) => SessionError::Ended(code),
            other => SessionError::Transport(other),
        }
    }
}

/// Short join code, the only external identifier of a session
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SessionCode(String);

impl SessionCode {
    /// Normalize user input: surrounding whitespace dropped, upper-cased
    pub fn parse(raw: &str) -> Self {
        Self(raw.trim().to_uppercase())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for SessionCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Group activity a session runs
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ActivityKind {
    GroupBreathing,
    BalloonRace,
    Campfire,
}

impl ActivityKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ActivityKind::GroupBreathing => "group_breathing",
            ActivityKind::BalloonRace => "balloon_race",
            ActivityKind::Campfire => "campfire",
        }
    }

    pub fn from_str(s: &str) -> Option<Self> {
        match s.to_lowercase().as_str() {
            "group_breathing" => Some(ActivityKind::GroupBreathing),
            "balloon_race" => Some(ActivityKind::BalloonRace),
            "campfire" => Some(ActivityKind::Campfire),
            _ => None,
        }
    }
}

impl Default for ActivityKind {
    fn default() -> Self {
        ActivityKind::GroupBreathing
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SessionState {
    Lobby,
    Active,
    Ended,
}

impl SessionState {
    pub fn as_str(&self) -> &'static str {
        match self {
            SessionState::Lobby => "lobby",
            SessionState::Active => "active",
            SessionState::Ended => "ended",
        }
    }
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One client's view of a session
#[derive(Debug)]
pub struct Session {
    pub code: SessionCode,
    pub kind: ActivityKind,
    pub host_id: ParticipantId,
    /// This client's participant
    pub local_id: ParticipantId,
    pub registry: ParticipantRegistry,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub ended_at: Option<DateTime<Utc>>,
    state: SessionState,
}

impl Session {
    pub fn new(
        code: SessionCode,
        kind: ActivityKind,
        host_id: ParticipantId,
        local_id: ParticipantId,
    ) -> Self {
        Self {
            code,
            kind,
            host_id,
            local_id,
            registry: ParticipantRegistry::new(),
            created_at: Utc::now(),
            started_at: None,
            ended_at: None,
            state: SessionState::Lobby,
        }
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    pub fn is_host(&self) -> bool {
        self.local_id == self.host_id
    }

    pub fn is_active(&self) -> bool {
        self.state == SessionState::Active
    }

    pub fn add_participant(&self, participant: Participant) -> bool {
        self.registry.add(participant)
    }

    /// Lobby -> active. Zero other participants is allowed.
    pub fn start(&mut self) -> Result<(), SessionError> {
        if self.state != SessionState::Lobby {
            return Err(SessionError::InvalidTransition {
                from: self.state,
                to: SessionState::Active,
            });
        }
        self.state = SessionState::Active;
        self.started_at = Some(Utc::now());
        info!("[{}] Session active with {} participant(s)", self.code, self.registry.len());
        Ok(())
    }

    /// Active -> ended. Returns `Ok(false)` if the session had already ended.
    pub fn end(&mut self) -> Result<bool, SessionError> {
        match self.state {
            SessionState::Ended => Ok(false),
            SessionState::Lobby => Err(SessionError::InvalidTransition {
                from: SessionState::Lobby,
                to: SessionState::Ended,
            }),
            SessionState::Active => {
                self.state = SessionState::Ended;
                self.ended_at = Some(Utc::now());
                info!("[{}] Session ended", self.code);
                Ok(true)
            }
        }
    }
}

/// End-of-session report
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SessionSummary {
    pub code: SessionCode,
    pub kind: ActivityKind,
    pub best_synchrony: f32,
    pub final_synchrony: f32,
    pub local_breaths: u64,
    pub remote_breaths: u64,
    pub participants: Vec<String>,
    pub started_at: Option<DateTime<Utc>>,
    pub ended_at: Option<DateTime<Utc>>,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn session() -> Session {
        Session::new(
            SessionCode::parse("brth-abcd"),
            ActivityKind::GroupBreathing,
            ParticipantId(1),
            ParticipantId(1),
        )
    }

    #[test]
    fn test_code_is_normalized() {
        assert_eq!(SessionCode::parse("  abcd-efgh ").as_str(), "ABCD-EFGH");
    }

    #[test]
    fn test_lifecycle_forward_only() {
        let mut s = session();
        assert_eq!(s.state(), SessionState::Lobby);
        assert!(s.is_host());

        s.start().unwrap();
        assert!(s.is_active());
        assert!(s.started_at.is_some());

        let err = s.start().unwrap_err();
        assert_eq!(
            err,
            SessionError::InvalidTransition {
                from: SessionState::Active,
                to: SessionState::Active
            }
        );

        assert_eq!(s.end(), Ok(true));
        assert_eq!(s.end(), Ok(false));
        assert_eq!(s.state(), SessionState::Ended);
        assert!(s.ended_at.is_some());
        assert!(s.start().is_err());
    }

    #[test]
    fn test_lobby_cannot_skip_to_ended() {
        let mut s = session();
        assert_eq!(
            s.end(),
            Err(SessionError::InvalidTransition {
                from: SessionState::Lobby,
                to: SessionState::Ended
            })
        );
        assert_eq!(s.state(), SessionState::Lobby);
    }

    #[test]
    fn test_transport_errors_map_to_session_errors() {
        let code = SessionCode::parse("ABCD-EFGH");
        assert_eq!(
            SessionError::from(TransportError::SessionNotFound(code.clone())),
            SessionError::NotFound(code.clone())
        );
        assert_eq!(
            SessionError::from(TransportError::Unreachable),
            SessionError::Transport(TransportError::Unreachable)
        );
    }

    #[test]
    fn test_activity_kind_labels() {
        assert_eq!(ActivityKind::from_str("Campfire"), Some(ActivityKind::Campfire));
        assert_eq!(ActivityKind::BalloonRace.as_str(), "balloon_race");
    }
}
