//! Participant registry for one session

use crate::event::{BreathPhase, ParticipantId};
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::Serialize;
use tracing::debug;

/// A member of a session
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Participant {
    pub id: ParticipantId,
    pub display_name: String,
    pub joined_at: DateTime<Utc>,
    pub is_host: bool,
    /// Last breath phase relayed for this participant
    pub last_phase: Option<BreathPhase>,
}

impl Participant {
    pub fn new(id: ParticipantId, display_name: impl Into<String>, is_host: bool) -> Self {
        Self {
            id,
            display_name: display_name.into(),
            joined_at: Utc::now(),
            is_host,
            last_phase: None,
        }
    }
}

/// Session membership keyed by participant id
#[derive(Debug, Default)]
pub struct ParticipantRegistry {
    participants: DashMap<ParticipantId, Participant>,
}

impl ParticipantRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a participant; returns false if the id was already present
    pub fn add(&self, participant: Participant) -> bool {
        let id = participant.id;
        let fresh = self.participants.insert(id, participant).is_none();
        if fresh {
            debug!("Registered participant {}", id);
        }
        fresh
    }

    pub fn remove(&self, id: ParticipantId) -> Option<Participant> {
        self.participants.remove(&id).map(|(_, p)| p)
    }

    pub fn contains(&self, id: ParticipantId) -> bool {
        self.participants.contains_key(&id)
    }

    /// Display name, or a placeholder for ids we have not seen join
    pub fn display_name(&self, id: ParticipantId) -> String {
        self.participants
            .get(&id)
            .map(|r| r.value().display_name.clone())
            .unwrap_or_else(|| format!("Participant_{}", id))
    }

    /// Record the latest relayed phase; ignored for unknown ids
    pub fn set_phase(&self, id: ParticipantId, phase: BreathPhase) {
        if let Some(mut entry) = self.participants.get_mut(&id) {
            entry.last_phase = Some(phase);
        }
    }

    pub fn phase_of(&self, id: ParticipantId) -> Option<BreathPhase> {
        self.participants.get(&id).and_then(|r| r.value().last_phase)
    }

    pub fn len(&self) -> usize {
        self.participants.len()
    }

    pub fn is_empty(&self) -> bool {
        self.participants.is_empty()
    }

    /// All participants, oldest join first
    pub fn snapshot(&self) -> Vec<Participant> {
        let mut all: Vec<Participant> = self
            .participants
            .iter()
            .map(|r| r.value().clone())
            .collect();
        all.sort_by(|a, b| a.joined_at.cmp(&b.joined_at).then(a.id.cmp(&b.id)));
        all
    }
}
