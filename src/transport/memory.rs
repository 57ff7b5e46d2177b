//! In-process relay
//!
//! Rooms live in a `DashMap`, each with a broadcast channel fanning messages
//! out to every subscriber. A room is dropped once it has ended and its last
//! member has left; its code stays in `ended` so late requests still see
//! `SessionEnded`. Used for solo sessions, local multi-screen play and tests.

use super::{JoinTicket, RelayEvent, SessionTicket, SyncTransport, TransportError};
use crate::event::{BreathEvent, BreathPhase, ParticipantId};
use crate::session::{ActivityKind, SessionCode};
use async_trait::async_trait;
use dashmap::{DashMap, DashSet};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use tokio::sync::broadcast;
use tracing::{debug, info, warn};

/// Messages buffered per room before slow subscribers start lagging
const CHANNEL_CAPACITY: usize = 256;

/// Letters used in generated codes; I and O are left out
const CODE_ALPHABET: &[u8] = b"ABCDEFGHJKLMNPQRSTUVWXYZ";

const DEFAULT_PREFIX: &str = "BRTH";

struct Room {
    kind: ActivityKind,
    host_id: ParticipantId,
    members: Vec<(ParticipantId, String)>,
    started: bool,
    ended: bool,
    tx: broadcast::Sender<RelayEvent>,
}

impl Room {
    fn publish(&self, event: RelayEvent) {
        // No subscribers is not an error for a relay
        let _ = self.tx.send(event);
    }
}

/// Relay that keeps all rooms in this process
pub struct LocalRelay {
    rooms: DashMap<SessionCode, Room>,
    ended: DashSet<SessionCode>,
    capacity: usize,
    next_participant: AtomicU64,
    reachable: AtomicBool,
    redeliver: bool,
}

impl LocalRelay {
    /// `capacity` bounds members per room, host included
    pub fn new(capacity: usize) -> Self {
        Self {
            rooms: DashMap::new(),
            ended: DashSet::new(),
            capacity: capacity.max(1),
            next_participant: AtomicU64::new(1),
            reachable: AtomicBool::new(true),
            redeliver: false,
        }
    }

    /// Deliver every breath message twice, as an at-least-once relay may
    pub fn with_redelivery(mut self) -> Self {
        self.redeliver = true;
        self
    }

    /// Simulate the relay going away or coming back
    pub fn set_reachable(&self, reachable: bool) {
        self.reachable.store(reachable, Ordering::Relaxed);
    }

    pub fn room_count(&self) -> usize {
        self.rooms.len()
    }

    /// Current members of a room
    pub fn members(&self, code: &SessionCode) -> Vec<(ParticipantId, String)> {
        self.rooms
            .get(code)
            .map(|r| r.value().members.clone())
            .unwrap_or_default()
    }

    fn ensure_reachable(&self) -> Result<(), TransportError> {
        if self.reachable.load(Ordering::Relaxed) {
            Ok(())
        } else {
            Err(TransportError::Unreachable)
        }
    }

    /// Error for a code with no live room
    fn missing(&self, code: &SessionCode) -> TransportError {
        if self.ended.contains(code) {
            TransportError::SessionEnded(code.clone())
        } else {
            TransportError::SessionNotFound(code.clone())
        }
    }

    /// Drop an ended room once nobody is left in it
    fn evict_if_empty(&self, code: &SessionCode) {
        let removed = self
            .rooms
            .remove_if(code, |_, room| room.ended && room.members.is_empty());
        if removed.is_some() {
            debug!("[{}] Room dropped", code);
        }
    }

    fn allocate_participant(&self) -> ParticipantId {
        ParticipantId(self.next_participant.fetch_add(1, Ordering::Relaxed))
    }

    fn generate_code(&self, prefix: &str) -> SessionCode {
        let prefix = if prefix.is_empty() { DEFAULT_PREFIX } else { prefix };
        let rng = fastrand::Rng::new();
        loop {
            let suffix: String = (0..4)
                .map(|_| CODE_ALPHABET[rng.usize(..CODE_ALPHABET.len())] as char)
                .collect();

            let code = SessionCode::parse(&format!("{}-{}", prefix, suffix));
            if !self.rooms.contains_key(&code) && !self.ended.contains(&code) {
                return code;
            }
        }
    }
}

impl Default for LocalRelay {
    fn default() -> Self {
        Self::new(8)
    }
}

#[async_trait]
impl SyncTransport for LocalRelay {
    async fn connect(&self) -> bool {
        self.reachable.load(Ordering::Relaxed)
    }

    async fn create_session(
        &self,
        kind: ActivityKind,
        host_name: &str,
        code_prefix: &str,
    ) -> Result<SessionTicket, TransportError> {
        self.ensure_reachable()?;

        let code = self.generate_code(code_prefix);
        let host_id = self.allocate_participant();
        let (tx, _) = broadcast::channel(CHANNEL_CAPACITY);

        self.rooms.insert(
            code.clone(),
            Room {
                kind,
                host_id,
                members: vec![(host_id, host_name.to_string())],
                started: false,
                ended: false,
                tx,
            },
        );

        info!("[{}] Room created for {} (host {})", code, kind.as_str(), host_id);
        Ok(SessionTicket { code, host_id })
    }

    async fn join_session(&self, code: &SessionCode, name: &str) -> Result<JoinTicket, TransportError> {
        self.ensure_reachable()?;

        let mut room = self
            .rooms
            .get_mut(code)
            .ok_or_else(|| self.missing(code))?;

        if room.ended {
            return Err(TransportError::SessionEnded(code.clone()));
        }
        if room.members.len() >= self.capacity {
            return Err(TransportError::SessionFull(code.clone()));
        }

        let participant_id = self.allocate_participant();
        let roster = room.members.clone();
        room.members.push((participant_id, name.to_string()));
        room.publish(RelayEvent::ParticipantJoined {
            participant_id,
            name: name.to_string(),
        });

        debug!("[{}] {} joined as {}", code, name, participant_id);
        Ok(JoinTicket {
            participant_id,
            host_id: room.host_id,
            kind: room.kind,
            started: room.started,
            roster,
        })
    }

    async fn leave_session(
        &self,
        code: &SessionCode,
        participant_id: ParticipantId,
    ) -> Result<(), TransportError> {
        self.ensure_reachable()?;

        if self.ended.contains(code) && !self.rooms.contains_key(code) {
            // Room already dropped, so nobody is left to leave
            return Ok(());
        }

        {
            let mut room = self
                .rooms
                .get_mut(code)
                .ok_or_else(|| self.missing(code))?;

            let before = room.members.len();
            room.members.retain(|(id, _)| *id != participant_id);
            if room.members.len() != before {
                room.publish(RelayEvent::ParticipantLeft { participant_id });
                debug!("[{}] Participant {} left", code, participant_id);
            }
        }
        self.evict_if_empty(code);
        Ok(())
    }

    async fn send_breath_phase(
        &self,
        code: &SessionCode,
        event: &BreathEvent,
        phase: BreathPhase,
    ) -> Result<(), TransportError> {
        self.ensure_reachable()?;

        let room = self
            .rooms
            .get(code)
            .ok_or_else(|| self.missing(code))?;
        if room.ended {
            return Err(TransportError::SessionEnded(code.clone()));
        }

        let message = RelayEvent::BreathSync {
            participant_id: event.participant_id,
            phase,
            seq: event.seq,
            source: event.source,
            timestamp_ms: event.timestamp_ms,
        };
        if self.redeliver {
            room.publish(message.clone());
        }
        room.publish(message);
        Ok(())
    }

    async fn start_exercise(
        &self,
        code: &SessionCode,
        kind: ActivityKind,
        payload: serde_json::Value,
    ) -> Result<(), TransportError> {
        self.ensure_reachable()?;

        let mut room = self
            .rooms
            .get_mut(code)
            .ok_or_else(|| self.missing(code))?;
        if room.ended {
            return Err(TransportError::SessionEnded(code.clone()));
        }

        room.started = true;
        room.publish(RelayEvent::ExerciseStart { kind, payload });
        Ok(())
    }

    async fn end_session(&self, code: &SessionCode) -> Result<(), TransportError> {
        self.ensure_reachable()?;

        if !self.ended.insert(code.clone()) {
            warn!("[{}] End requested for an ended room", code);
            return Ok(());
        }

        {
            let Some(mut room) = self.rooms.get_mut(code) else {
                self.ended.remove(code);
                return Err(TransportError::SessionNotFound(code.clone()));
            };
            room.ended = true;
            room.publish(RelayEvent::SessionEnded);
        }
        info!("[{}] Room ended", code);
        self.evict_if_empty(code);
        Ok(())
    }

    fn subscribe(&self, code: &SessionCode) -> Result<broadcast::Receiver<RelayEvent>, TransportError> {
        self.rooms
            .get(code)
            .map(|r| r.value().tx.subscribe())
            .ok_or_else(|| self.missing(code))
    }
}
