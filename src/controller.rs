//! Session controller
//!
//! Owns one client's session, wires the local detectors into the scorer and
//! the relay, and runs the periodic sampling, scoring and relay-listening
//! tasks. State sits behind a `parking_lot::Mutex` that is never held across
//! an `.await`.

use crate::audio::{AudioSampler, EnergySource, SamplerError};
use crate::config::Config;
use crate::detector::{BreathCycleDetector, DetectorState, TouchFallbackDetector};
use crate::event::{BreathEvent, BreathPhase, BreathSource, ParticipantId, SequenceCounter};
use crate::registry::Participant;
use crate::scorer::SynchronyScorer;
use crate::session::{ActivityKind, Session, SessionCode, SessionError, SessionState, SessionSummary};
use crate::transport::{RelayEvent, SyncTransport, TransportError};
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::broadcast;
use tokio::sync::broadcast::error::RecvError;
use tokio::task::JoinHandle;
use tokio::time::{interval, Duration, Instant, MissedTickBehavior};
use tracing::{debug, error, info, trace, warn};

/// Id stamped on local breaths before any session assigns one
pub const LOCAL_PARTICIPANT: ParticipantId = ParticipantId(0);

const EVENT_CHANNEL_CAPACITY: usize = 64;

/// Where local breaths come from
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InputMode {
    None,
    Microphone,
    Touch,
}

impl InputMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            InputMode::None => "none",
            InputMode::Microphone => "microphone",
            InputMode::Touch => "touch",
        }
    }
}

/// Lifecycle notifications for the UI layer.
///
/// Delivered in order to every subscriber; `Ended` is sent at most once per
/// session and `DeviceUnavailable` at most once per controller.
#[derive(Debug, Clone, PartialEq)]
pub enum SessionEvent {
    ParticipantJoined(Participant),
    ParticipantLeft(ParticipantId),
    Started,
    Ended(SessionSummary),
    DeviceUnavailable(SamplerError),
}

/// Monotonic milliseconds since the controller was created
#[derive(Debug, Clone, Copy)]
pub struct SessionClock {
    origin: Instant,
}

impl SessionClock {
    pub fn new() -> Self {
        Self {
            origin: Instant::now(),
        }
    }

    pub fn now_ms(&self) -> u64 {
        self.origin.elapsed().as_millis() as u64
    }
}

impl Default for SessionClock {
    fn default() -> Self {
        Self::new()
    }
}

struct ControllerState {
    session: Option<Session>,
    scorer: SynchronyScorer,
    touch: TouchFallbackDetector,
    input: InputMode,
    local_breaths: u64,
    remote_breaths: u64,
    last_summary: Option<SessionSummary>,
}

#[derive(Default)]
struct Tasks {
    listener: Option<JoinHandle<()>>,
    scoring: Option<JoinHandle<()>>,
    sampling: Option<JoinHandle<()>>,
}

struct Shared {
    config: Config,
    transport: Arc<dyn SyncTransport>,
    clock: SessionClock,
    sequence: SequenceCounter,
    state: Mutex<ControllerState>,
    tasks: Mutex<Tasks>,
    breath_tx: broadcast::Sender<BreathEvent>,
    session_tx: broadcast::Sender<SessionEvent>,
    device_reported: AtomicBool,
}

/// Releases the energy source however the sampling task ends
struct SourceGuard(Box<dyn EnergySource>);

impl Drop for SourceGuard {
    fn drop(&mut self) {
        self.0.release();
    }
}

/// One client's breathing session
#[derive(Clone)]
pub struct SessionController {
    shared: Arc<Shared>,
}

impl SessionController {
    pub fn new(config: Config, transport: Arc<dyn SyncTransport>) -> Self {
        let sequence = SequenceCounter::new();
        let (breath_tx, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        let (session_tx, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);

        let state = ControllerState {
            session: None,
            scorer: SynchronyScorer::new(config.scorer.clone()),
            touch: TouchFallbackDetector::new(LOCAL_PARTICIPANT, sequence.clone()),
            input: InputMode::None,
            local_breaths: 0,
            remote_breaths: 0,
            last_summary: None,
        };

        Self {
            shared: Arc::new(Shared {
                config,
                transport,
                clock: SessionClock::new(),
                sequence,
                state: Mutex::new(state),
                tasks: Mutex::new(Tasks::default()),
                breath_tx,
                session_tx,
                device_reported: AtomicBool::new(false),
            }),
        }
    }

    /// Create a session as host. The session starts in the lobby.
    pub async fn create_session(
        &self,
        kind: ActivityKind,
        host_name: &str,
    ) -> Result<SessionCode, SessionError> {
        self.shared.ensure_no_session()?;

        let transport = &self.shared.transport;
        if !transport.connect().await {
            return Err(SessionError::Create(TransportError::Unreachable));
        }

        let ticket = transport
            .create_session(kind, host_name, &self.shared.config.session_code_prefix)
            .await
            .map_err(SessionError::Create)?;
        let rx = transport.subscribe(&ticket.code).map_err(SessionError::Create)?;

        let session = Session::new(ticket.code.clone(), kind, ticket.host_id, ticket.host_id);
        session.add_participant(Participant::new(ticket.host_id, host_name, true));

        info!("[{}] Created {} session as host {}", ticket.code, kind.as_str(), ticket.host_id);
        self.shared.install(session, rx);
        Ok(ticket.code)
    }

    /// Join an existing session by code.
    ///
    /// On failure nothing is registered locally.
    pub async fn join_session(&self, code: &str, name: &str) -> Result<ParticipantId, SessionError> {
        self.shared.ensure_no_session()?;

        let code = SessionCode::parse(code);
        let transport = &self.shared.transport;
        if !transport.connect().await {
            return Err(SessionError::Transport(TransportError::Unreachable));
        }

        // Subscribe first so nothing sent right after the join is missed
        let rx = transport.subscribe(&code)?;
        let ticket = match transport.join_session(&code, name).await {
            Ok(ticket) => ticket,
            Err(e) => {
                info!("[{}] Join failed: {}", code, e);
                return Err(e.into());
            }
        };

        let mut session = Session::new(code.clone(), ticket.kind, ticket.host_id, ticket.participant_id);
        for (id, member) in &ticket.roster {
            session.add_participant(Participant::new(*id, member.clone(), *id == ticket.host_id));
        }
        session.add_participant(Participant::new(ticket.participant_id, name, false));

        let late_join = ticket.started;
        if late_join {
            session.start()?;
        }

        info!(
            "[{}] Joined as {} ({} participant(s))",
            code,
            ticket.participant_id,
            session.registry.len()
        );
        self.shared.install(session, rx);

        if late_join {
            self.shared.begin_scoring();
            let _ = self.shared.session_tx.send(SessionEvent::Started);
        }
        Ok(ticket.participant_id)
    }

    /// Host action: lobby -> active. Zero guests is allowed.
    pub async fn start_session(&self) -> Result<(), SessionError> {
        let (code, kind, host_id) = {
            let state = self.shared.state.lock();
            let session = state.session.as_ref().ok_or(SessionError::NoSession)?;
            if !session.is_host() {
                return Err(SessionError::NotHost("start the session"));
            }
            if session.state() != SessionState::Lobby {
                return Err(SessionError::InvalidTransition {
                    from: session.state(),
                    to: SessionState::Active,
                });
            }
            (session.code.clone(), session.kind, session.host_id)
        };

        let payload = serde_json::json!({
            "kind": kind.as_str(),
            "hostId": host_id,
            "windowMs": self.shared.config.scorer.window_ms,
        });
        self.shared.transport.start_exercise(&code, kind, payload).await?;

        self.shared.mark_started();
        Ok(())
    }

    /// Host action: end the session.
    ///
    /// Idempotent: with no session, or one that already ended, this is a no-op.
    pub async fn end_session(&self) -> Result<(), SessionError> {
        let (code, local_id) = {
            let state = self.shared.state.lock();
            match state.session.as_ref() {
                None => return Ok(()),
                Some(s) if s.state() == SessionState::Ended => {
                    debug!("[{}] End requested for an ended session", s.code);
                    return Ok(());
                }
                Some(s) if !s.is_host() => return Err(SessionError::NotHost("end the session")),
                Some(s) if s.state() == SessionState::Lobby => {
                    return Err(SessionError::InvalidTransition {
                        from: SessionState::Lobby,
                        to: SessionState::Ended,
                    })
                }
                Some(s) => (s.code.clone(), s.local_id),
            }
        };

        // Local teardown first; the relayed SessionEnded then finds nothing to do
        self.shared.finish(true).await;

        if let Err(e) = self.shared.transport.end_session(&code).await {
            warn!("[{}] Relay did not acknowledge end: {}", code, e);
            return Err(e.into());
        }
        self.shared.vacate(&code, local_id).await;
        Ok(())
    }

    /// Leave the session. A host ends it for everyone; a host still in the
    /// lobby closes the room without it ever starting.
    pub async fn leave_session(&self) -> Result<(), SessionError> {
        let (code, local_id, is_host, state) = {
            let state = self.shared.state.lock();
            match state.session.as_ref() {
                Some(s) if s.state() != SessionState::Ended => {
                    (s.code.clone(), s.local_id, s.is_host(), s.state())
                }
                _ => return Ok(()),
            }
        };

        if is_host && state == SessionState::Active {
            return self.end_session().await;
        }

        self.shared.finish(true).await;
        if is_host {
            self.shared.transport.end_session(&code).await?;
            self.shared.vacate(&code, local_id).await;
        } else {
            self.shared.transport.leave_session(&code, local_id).await?;
        }
        info!("[{}] Left session", code);
        Ok(())
    }

    /// Try the microphone; fall back to touch input if it is unavailable.
    /// After one failure the microphone is not tried again.
    pub async fn enable_microphone(&self) -> InputMode {
        if self.shared.device_reported.load(Ordering::Relaxed) {
            self.shared.state.lock().input = InputMode::Touch;
            return InputMode::Touch;
        }
        match AudioSampler::acquire(self.shared.config.sampler.clone()).await {
            Ok(sampler) => {
                info!("Breath detection on {}", sampler.device_name());
                self.attach_source(Box::new(sampler));
                InputMode::Microphone
            }
            Err(e) => self.fall_back_to_touch(e),
        }
    }

    /// Drive breath detection from an energy source, replacing any previous one
    pub fn attach_source(&self, source: Box<dyn EnergySource>) {
        let previous = self.shared.tasks.lock().sampling.take();
        if let Some(handle) = previous {
            handle.abort();
        }

        let handle = tokio::spawn(run_sampling(self.shared.clone(), SourceGuard(source)));
        self.shared.tasks.lock().sampling = Some(handle);
        self.shared.state.lock().input = InputMode::Microphone;
    }

    fn fall_back_to_touch(&self, err: SamplerError) -> InputMode {
        if !self.shared.device_reported.swap(true, Ordering::Relaxed) {
            warn!("Microphone unavailable ({}), using touch input", err);
            let _ = self.shared.session_tx.send(SessionEvent::DeviceUnavailable(err));
        }
        self.shared.state.lock().input = InputMode::Touch;
        InputMode::Touch
    }

    /// Touch input: a breath starts. Returns false if one was already in progress.
    pub async fn press(&self) -> bool {
        let now = self.shared.clock.now_ms();
        let started = self.shared.state.lock().touch.press(now);
        if started {
            self.shared.announce_inhale(now, BreathSource::Touch).await;
        }
        started
    }

    /// Touch input: the breath completes
    pub async fn release(&self) -> Option<BreathEvent> {
        let now = self.shared.clock.now_ms();
        let event = self.shared.state.lock().touch.release(now)?;
        Some(self.shared.emit_local(event).await)
    }

    /// Completed local breaths, one message per breath, in order
    pub fn subscribe_breath_cycles(&self) -> broadcast::Receiver<BreathEvent> {
        self.shared.breath_tx.subscribe()
    }

    pub fn subscribe_session_events(&self) -> broadcast::Receiver<SessionEvent> {
        self.shared.session_tx.subscribe()
    }

    /// Current synchrony in [0, 1]
    pub fn synchrony_level(&self) -> f32 {
        self.shared.state.lock().scorer.score()
    }

    /// Peak synchrony of the current or most recent session
    pub fn best_synchrony(&self) -> f32 {
        self.shared.state.lock().scorer.best()
    }

    /// Participants with a breath in the current scoring window
    pub fn active_participants(&self) -> Vec<ParticipantId> {
        self.shared.state.lock().scorer.active_participants()
    }

    pub fn session_state(&self) -> Option<SessionState> {
        self.shared.state.lock().session.as_ref().map(|s| s.state())
    }

    pub fn session_code(&self) -> Option<SessionCode> {
        self.shared.state.lock().session.as_ref().map(|s| s.code.clone())
    }

    pub fn local_participant(&self) -> Option<ParticipantId> {
        self.shared.state.lock().session.as_ref().map(|s| s.local_id)
    }

    pub fn participants(&self) -> Vec<Participant> {
        self.shared
            .state
            .lock()
            .session
            .as_ref()
            .map(|s| s.registry.snapshot())
            .unwrap_or_default()
    }

    /// Last relayed phase of a participant, for renderers
    pub fn participant_phase(&self, id: ParticipantId) -> Option<BreathPhase> {
        self.shared
            .state
            .lock()
            .session
            .as_ref()
            .and_then(|s| s.registry.phase_of(id))
    }

    pub fn input_mode(&self) -> InputMode {
        self.shared.state.lock().input
    }

    pub fn last_summary(&self) -> Option<SessionSummary> {
        self.shared.state.lock().last_summary.clone()
    }

    /// Leave or end any session and stop all background work
    pub async fn shutdown(&self) {
        if let Err(e) = self.leave_session().await {
            warn!("Leaving session during shutdown failed: {}", e);
        }
        let handles: Vec<JoinHandle<()>> = {
            let mut tasks = self.shared.tasks.lock();
            [tasks.sampling.take(), tasks.scoring.take(), tasks.listener.take()]
                .into_iter()
                .flatten()
                .collect()
        };
        for handle in handles {
            handle.abort();
            let _ = handle.await;
        }
        self.shared.state.lock().input = InputMode::None;
    }
}

impl Shared {
    fn ensure_no_session(&self) -> Result<(), SessionError> {
        match self.state.lock().session.as_ref() {
            Some(s) if s.state() != SessionState::Ended => {
                Err(SessionError::AlreadyInSession(s.code.clone()))
            }
            _ => Ok(()),
        }
    }

    fn install(self: &Arc<Self>, session: Session, rx: broadcast::Receiver<RelayEvent>) {
        {
            let mut state = self.state.lock();
            state.session = Some(session);
            state.scorer.reset();
            state.local_breaths = 0;
            state.remote_breaths = 0;
        }

        let listener = tokio::spawn(run_listener(self.clone(), rx));
        let stale = {
            let mut tasks = self.tasks.lock();
            let stale = [tasks.listener.take(), tasks.scoring.take()];
            tasks.listener = Some(listener);
            stale
        };
        for handle in stale.into_iter().flatten() {
            handle.abort();
        }
    }

    /// Move a lobby session to active and start scoring.
    ///
    /// The host's own call and the relayed start race; whichever lands first
    /// wins and `Started` goes out once.
    fn mark_started(self: &Arc<Self>) -> bool {
        let started = {
            let mut state = self.state.lock();
            match state.session.as_mut() {
                Some(s) if s.state() == SessionState::Lobby => s.start().is_ok(),
                _ => false,
            }
        };
        if started {
            self.begin_scoring();
            let _ = self.session_tx.send(SessionEvent::Started);
        }
        started
    }

    fn begin_scoring(self: &Arc<Self>) {
        let mut tasks = self.tasks.lock();
        let running = tasks.scoring.as_ref().map(|h| !h.is_finished()).unwrap_or(false);
        if !running {
            tasks.scoring = Some(tokio::spawn(run_scoring(self.clone())));
        }
    }

    /// Stamp, publish, score and relay a completed local breath
    async fn emit_local(&self, event: BreathEvent) -> BreathEvent {
        let (event, outgoing) = {
            let mut guard = self.state.lock();
            let state = &mut *guard;

            let participant_id = state
                .session
                .as_ref()
                .map(|s| s.local_id)
                .unwrap_or(LOCAL_PARTICIPANT);
            let event = BreathEvent {
                participant_id,
                ..event
            };
            let _ = self.breath_tx.send(event);

            let outgoing = match state.session.as_ref() {
                Some(session) if session.is_active() => {
                    state.scorer.record_local(&event);
                    state.local_breaths += 1;
                    Some(session.code.clone())
                }
                _ => None,
            };
            (event, outgoing)
        };

        if let Some(code) = outgoing {
            if let Err(e) = self
                .transport
                .send_breath_phase(&code, &event, BreathPhase::Exhale)
                .await
            {
                warn!("[{}] Failed to relay breath {}: {}", code, event.seq, e);
            }
        }
        event
    }

    /// Tell the room a local breath has started
    async fn announce_inhale(&self, now: u64, source: BreathSource) {
        let outgoing = {
            let state = self.state.lock();
            match state.session.as_ref() {
                Some(session) if session.is_active() => Some((
                    session.code.clone(),
                    BreathEvent {
                        participant_id: session.local_id,
                        source,
                        timestamp_ms: now,
                        seq: self.sequence.current() + 1,
                    },
                )),
                _ => None,
            }
        };

        if let Some((code, event)) = outgoing {
            if let Err(e) = self
                .transport
                .send_breath_phase(&code, &event, BreathPhase::Inhale)
                .await
            {
                debug!("[{}] Failed to relay inhale: {}", code, e);
            }
        }
    }

    /// Tear the session down once: stop tasks, release input, clear the
    /// window and publish the summary.
    async fn finish(self: &Arc<Self>, abort_listener: bool) {
        let summary = {
            let mut guard = self.state.lock();
            let state = &mut *guard;
            let Some(session) = state.session.as_mut() else {
                return;
            };

            let discard = match session.end() {
                Ok(true) => false,
                Ok(false) => return,
                // Still in the lobby: the session is gone without ever running
                Err(_) => true,
            };

            let summary = SessionSummary {
                code: session.code.clone(),
                kind: session.kind,
                best_synchrony: state.scorer.best(),
                final_synchrony: state.scorer.score(),
                local_breaths: state.local_breaths,
                remote_breaths: state.remote_breaths,
                participants: session
                    .registry
                    .snapshot()
                    .into_iter()
                    .map(|p| p.display_name)
                    .collect(),
                started_at: session.started_at,
                ended_at: session.ended_at,
            };

            if discard {
                state.session = None;
            }
            state.scorer.clear_window();
            state.touch = TouchFallbackDetector::new(LOCAL_PARTICIPANT, self.sequence.clone());
            state.input = InputMode::None;
            state.last_summary = Some(summary.clone());
            summary
        };

        let handles: Vec<JoinHandle<()>> = {
            let mut tasks = self.tasks.lock();
            let mut handles = vec![tasks.sampling.take(), tasks.scoring.take()];
            if abort_listener {
                handles.push(tasks.listener.take());
            }
            handles.into_iter().flatten().collect()
        };
        for handle in handles {
            handle.abort();
            let _ = handle.await;
        }

        info!(
            "[{}] Session finished: best synchrony {:.2}, {} local / {} remote breaths",
            summary.code, summary.best_synchrony, summary.local_breaths, summary.remote_breaths
        );
        let _ = self.session_tx.send(SessionEvent::Ended(summary));
    }

    /// Leave an ended room so the relay can drop it
    async fn vacate(&self, code: &SessionCode, local_id: ParticipantId) {
        if let Err(e) = self.transport.leave_session(code, local_id).await {
            debug!("[{}] Could not leave ended room: {}", code, e);
        }
    }

    /// Apply one relay message; returns false once the session is over
    async fn handle_relay_event(self: &Arc<Self>, event: RelayEvent) -> bool {
        let now = self.clock.now_ms();

        match event {
            RelayEvent::ParticipantJoined {
                participant_id,
                name,
            } => {
                let joined = {
                    let state = self.state.lock();
                    state.session.as_ref().and_then(|s| {
                        let participant =
                            Participant::new(participant_id, name, participant_id == s.host_id);
                        s.add_participant(participant.clone()).then_some(participant)
                    })
                };
                if let Some(participant) = joined {
                    info!("{} joined ({})", participant.display_name, participant_id);
                    let _ = self.session_tx.send(SessionEvent::ParticipantJoined(participant));
                }
                true
            }
            RelayEvent::ParticipantLeft { participant_id } => {
                let (removed, host_left) = {
                    let state = self.state.lock();
                    match state.session.as_ref() {
                        Some(s) => (
                            s.registry.remove(participant_id),
                            participant_id == s.host_id && participant_id != s.local_id,
                        ),
                        None => (None, false),
                    }
                };
                if let Some(participant) = removed {
                    // Window entries from this participant age out on their own
                    info!("{} left ({})", participant.display_name, participant_id);
                    let _ = self.session_tx.send(SessionEvent::ParticipantLeft(participant_id));
                }
                if host_left && self.config.end_on_host_leave {
                    warn!("Host left, ending session");
                    self.finish(false).await;
                    return false;
                }
                true
            }
            RelayEvent::BreathSync {
                participant_id,
                phase,
                seq,
                ..
            } => {
                let mut guard = self.state.lock();
                let state = &mut *guard;
                let Some(session) = state.session.as_ref() else {
                    return true;
                };

                session.registry.set_phase(participant_id, phase);
                if phase == BreathPhase::Exhale && session.is_active() {
                    // Stamped with our own receipt time, never the sender's clock
                    let accepted = state.scorer.record_remote(participant_id, seq, now);
                    if accepted && participant_id != session.local_id {
                        state.remote_breaths += 1;
                    }
                    trace!(
                        participant = %session.registry.display_name(participant_id),
                        seq,
                        accepted,
                        "Remote breath"
                    );
                }
                true
            }
            RelayEvent::ExerciseStart { kind, .. } => {
                if self.mark_started() {
                    info!("Exercise started: {}", kind.as_str());
                }
                true
            }
            RelayEvent::SessionEnded => {
                let room = {
                    let state = self.state.lock();
                    state.session.as_ref().map(|s| (s.code.clone(), s.local_id))
                };
                self.finish(false).await;
                if let Some((code, local_id)) = room {
                    self.vacate(&code, local_id).await;
                }
                false
            }
        }
    }
}

async fn run_listener(shared: Arc<Shared>, mut rx: broadcast::Receiver<RelayEvent>) {
    loop {
        match rx.recv().await {
            Ok(event) => {
                if !shared.handle_relay_event(event).await {
                    break;
                }
            }
            Err(RecvError::Lagged(missed)) => {
                warn!("Relay listener lagged, {} message(s) lost", missed);
            }
            Err(RecvError::Closed) => {
                debug!("Relay channel closed");
                break;
            }
        }
    }
}

async fn run_scoring(shared: Arc<Shared>) {
    let mut ticker = interval(Duration::from_millis(shared.config.score_tick_ms));
    ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

    loop {
        ticker.tick().await;
        let now = shared.clock.now_ms();
        shared.state.lock().scorer.tick(now);
    }
}

async fn run_sampling(shared: Arc<Shared>, mut source: SourceGuard) {
    let mut detector = BreathCycleDetector::new(
        shared.config.detector.clone(),
        LOCAL_PARTICIPANT,
        shared.sequence.clone(),
    );
    let mut ticker = interval(Duration::from_millis(shared.config.sample_interval_ms));
    ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

    loop {
        ticker.tick().await;
        let now = shared.clock.now_ms();

        let sample = match source.0.next_sample(now) {
            Ok(sample) => sample,
            Err(e) => {
                error!("Energy source stopped: {}", e);
                break;
            }
        };

        let before = detector.state();
        let event = detector.process(sample);
        if before != DetectorState::Breathing && detector.state() == DetectorState::Breathing {
            shared.announce_inhale(now, BreathSource::Mic).await;
        }
        if let Some(event) = event {
            shared.emit_local(event).await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event::EnergySample;
    use crate::transport::LocalRelay;
    use tokio::sync::broadcast::error::TryRecvError;
    use tokio::time::sleep;

    /// Energy source that plays back a volume curve by timestamp
    struct ScriptedSource {
        curve: fn(u64) -> f32,
        released: Arc<AtomicBool>,
    }

    impl EnergySource for ScriptedSource {
        fn next_sample(&mut self, timestamp_ms: u64) -> Result<EnergySample, SamplerError> {
            if self.released.load(Ordering::Relaxed) {
                return Err(SamplerError::Released);
            }
            Ok(EnergySample::new(timestamp_ms, (self.curve)(timestamp_ms)))
        }

        fn release(&mut self) {
            self.released.store(true, Ordering::Relaxed);
        }
    }

    fn two_breaths(t: u64) -> f32 {
        match t {
            0..=1199 => 0.01,
            1200..=1399 => 0.5,
            1400..=1999 => 0.05,
            2000..=2199 => 0.5,
            _ => 0.05,
        }
    }

    fn silence(_: u64) -> f32 {
        0.01
    }

    fn controller(relay: &Arc<LocalRelay>) -> SessionController {
        let transport: Arc<dyn SyncTransport> = relay.clone();
        SessionController::new(Config::default(), transport)
    }

    async fn settle() {
        sleep(Duration::from_millis(50)).await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_join_unknown_code() {
        let relay = Arc::new(LocalRelay::default());
        let guest = controller(&relay);

        let err = guest.join_session("ABCD-EFGH", "Aki").await.unwrap_err();
        assert_eq!(err, SessionError::NotFound(SessionCode::parse("ABCD-EFGH")));
        assert_eq!(guest.session_state(), None);
        assert!(guest.participants().is_empty());
        assert_eq!(relay.room_count(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_join_full_room() {
        let relay = Arc::new(LocalRelay::new(1));
        let host = controller(&relay);
        let guest = controller(&relay);

        let code = host.create_session(ActivityKind::GroupBreathing, "Host").await.unwrap();
        let err = guest.join_session(code.as_str(), "Aki").await.unwrap_err();

        assert_eq!(err, SessionError::Full(code.clone()));
        assert_eq!(guest.session_state(), None);
        assert!(guest.participants().is_empty());
        assert_eq!(host.participants().len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_join_ended_room() {
        let relay = Arc::new(LocalRelay::default());
        let host = controller(&relay);
        let guest = controller(&relay);

        let code = host.create_session(ActivityKind::GroupBreathing, "Host").await.unwrap();
        host.start_session().await.unwrap();
        host.end_session().await.unwrap();
        settle().await;

        let err = guest.join_session(code.as_str(), "Aki").await.unwrap_err();
        assert_eq!(err, SessionError::Ended(code));
        assert_eq!(guest.session_state(), None);
        assert!(guest.participants().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_ended_room_is_dropped_once_everyone_leaves() {
        let relay = Arc::new(LocalRelay::default());
        let host = controller(&relay);
        let guest = controller(&relay);

        let code = host.create_session(ActivityKind::GroupBreathing, "Host").await.unwrap();
        guest.join_session(code.as_str(), "Aki").await.unwrap();
        host.start_session().await.unwrap();
        settle().await;
        assert_eq!(relay.room_count(), 1);

        host.end_session().await.unwrap();
        settle().await;

        assert_eq!(guest.session_state(), Some(SessionState::Ended));
        assert_eq!(relay.room_count(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_create_fails_without_relay() {
        let relay = Arc::new(LocalRelay::default());
        relay.set_reachable(false);
        let host = controller(&relay);
        let mut breaths = host.subscribe_breath_cycles();

        let err = host
            .create_session(ActivityKind::GroupBreathing, "Host")
            .await
            .unwrap_err();
        assert_eq!(err, SessionError::Create(TransportError::Unreachable));

        // Solo detection still works
        assert!(host.press().await);
        let event = host.release().await.unwrap();
        assert_eq!(event.participant_id, LOCAL_PARTICIPANT);
        assert_eq!(breaths.recv().await.unwrap(), event);
    }

    #[tokio::test(start_paused = true)]
    async fn test_end_session_is_idempotent() {
        let relay = Arc::new(LocalRelay::default());
        let host = controller(&relay);
        let mut events = host.subscribe_session_events();

        host.create_session(ActivityKind::GroupBreathing, "Host").await.unwrap();
        host.start_session().await.unwrap();
        assert_eq!(events.recv().await.unwrap(), SessionEvent::Started);

        host.end_session().await.unwrap();
        host.end_session().await.unwrap();
        settle().await;

        assert!(matches!(events.recv().await.unwrap(), SessionEvent::Ended(_)));
        assert!(matches!(events.try_recv(), Err(TryRecvError::Empty)));
        assert_eq!(host.session_state(), Some(SessionState::Ended));
    }

    #[tokio::test(start_paused = true)]
    async fn test_lifecycle_rules() {
        let relay = Arc::new(LocalRelay::default());
        let host = controller(&relay);
        let guest = controller(&relay);

        assert_eq!(host.start_session().await, Err(SessionError::NoSession));

        let code = host.create_session(ActivityKind::Campfire, "Host").await.unwrap();
        assert!(matches!(
            host.create_session(ActivityKind::Campfire, "Again").await,
            Err(SessionError::AlreadyInSession(_))
        ));
        assert!(matches!(
            host.end_session().await,
            Err(SessionError::InvalidTransition { .. })
        ));

        guest.join_session(code.as_str(), "Aki").await.unwrap();
        assert_eq!(guest.start_session().await, Err(SessionError::NotHost("start the session")));

        host.start_session().await.unwrap();
        settle().await;
        assert_eq!(guest.session_state(), Some(SessionState::Active));
        assert_eq!(guest.end_session().await, Err(SessionError::NotHost("end the session")));
        assert!(matches!(
            host.start_session().await,
            Err(SessionError::InvalidTransition { .. })
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn test_guest_sees_roster_and_joins() {
        let relay = Arc::new(LocalRelay::default());
        let host = controller(&relay);
        let guest = controller(&relay);
        let mut host_events = host.subscribe_session_events();

        let code = host.create_session(ActivityKind::GroupBreathing, "Host").await.unwrap();
        let guest_id = guest.join_session(&code.as_str().to_lowercase(), "Aki").await.unwrap();
        settle().await;

        match host_events.recv().await.unwrap() {
            SessionEvent::ParticipantJoined(p) => {
                assert_eq!(p.id, guest_id);
                assert_eq!(p.display_name, "Aki");
                assert!(!p.is_host);
            }
            other => panic!("unexpected event {:?}", other),
        }
        assert_eq!(host.participants().len(), 2);

        let names: Vec<String> = guest.participants().into_iter().map(|p| p.display_name).collect();
        assert!(names.contains(&"Host".to_string()));
        assert!(names.contains(&"Aki".to_string()));
    }

    #[tokio::test(start_paused = true)]
    async fn test_breaths_are_scored_once_despite_echo_and_redelivery() {
        let relay = Arc::new(LocalRelay::default().with_redelivery());
        let host = controller(&relay);
        let guest = controller(&relay);

        let code = host.create_session(ActivityKind::GroupBreathing, "Host").await.unwrap();
        let guest_id = guest.join_session(code.as_str(), "Aki").await.unwrap();
        host.start_session().await.unwrap();
        settle().await;

        for _ in 0..4 {
            host.press().await;
            guest.press().await;
            sleep(Duration::from_millis(900)).await;
            host.release().await.unwrap();
            guest.release().await.unwrap();
            sleep(Duration::from_millis(100)).await;
        }
        settle().await;

        assert!(host.synchrony_level() > 0.3, "level {}", host.synchrony_level());
        assert!(host.best_synchrony() >= host.synchrony_level());
        assert_eq!(host.participant_phase(guest_id), Some(BreathPhase::Exhale));
        assert_eq!(host.active_participants().len(), 2);

        host.end_session().await.unwrap();
        settle().await;

        let host_summary = host.last_summary().unwrap();
        assert_eq!(host_summary.local_breaths, 4);
        assert_eq!(host_summary.remote_breaths, 4);
        assert!(host_summary.best_synchrony > 0.3);

        let guest_summary = guest.last_summary().unwrap();
        assert_eq!(guest_summary.local_breaths, 4);
        assert_eq!(guest_summary.remote_breaths, 4);
        assert_eq!(guest.session_state(), Some(SessionState::Ended));
    }

    #[tokio::test(start_paused = true)]
    async fn test_microphone_scenario_emits_two_cycles() {
        let relay = Arc::new(LocalRelay::default());
        let solo = controller(&relay);
        let mut breaths = solo.subscribe_breath_cycles();
        let released = Arc::new(AtomicBool::new(false));

        solo.attach_source(Box::new(ScriptedSource {
            curve: two_breaths,
            released: released.clone(),
        }));
        assert_eq!(solo.input_mode(), InputMode::Microphone);
        sleep(Duration::from_millis(3000)).await;

        let first = breaths.recv().await.unwrap();
        let second = breaths.recv().await.unwrap();
        assert!(matches!(breaths.try_recv(), Err(TryRecvError::Empty)));
        assert_eq!(first.source, BreathSource::Mic);
        assert!(second.timestamp_ms - first.timestamp_ms >= 800);
        assert_eq!(second.seq, first.seq + 1);

        solo.shutdown().await;
        assert!(released.load(Ordering::Relaxed));
    }

    #[tokio::test(start_paused = true)]
    async fn test_ending_releases_audio_and_clears_window() {
        let relay = Arc::new(LocalRelay::default());
        let host = controller(&relay);
        let released = Arc::new(AtomicBool::new(false));

        host.create_session(ActivityKind::GroupBreathing, "Host").await.unwrap();
        host.start_session().await.unwrap();
        host.attach_source(Box::new(ScriptedSource {
            curve: silence,
            released: released.clone(),
        }));
        host.press().await;
        host.release().await;
        settle().await;

        host.end_session().await.unwrap();
        assert!(released.load(Ordering::Relaxed));
        assert_eq!(host.synchrony_level(), 0.0);
        assert!(host.active_participants().is_empty());
        assert_eq!(host.input_mode(), InputMode::None);
        assert_eq!(host.last_summary().unwrap().local_breaths, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_host_leaving_ends_guest_session() {
        let relay = Arc::new(LocalRelay::default());
        let host = controller(&relay);
        let guest = controller(&relay);
        let mut guest_events = guest.subscribe_session_events();

        let code = host.create_session(ActivityKind::GroupBreathing, "Host").await.unwrap();
        guest.join_session(code.as_str(), "Aki").await.unwrap();
        host.start_session().await.unwrap();
        settle().await;
        assert_eq!(guest_events.recv().await.unwrap(), SessionEvent::Started);

        let host_id = host.local_participant().unwrap();
        relay.leave_session(&code, host_id).await.unwrap();
        settle().await;

        assert_eq!(guest_events.recv().await.unwrap(), SessionEvent::ParticipantLeft(host_id));
        assert!(matches!(guest_events.recv().await.unwrap(), SessionEvent::Ended(_)));
        assert_eq!(guest.session_state(), Some(SessionState::Ended));
    }

    #[tokio::test(start_paused = true)]
    async fn test_late_joiner_starts_active() {
        let relay = Arc::new(LocalRelay::default());
        let host = controller(&relay);
        let guest = controller(&relay);

        let code = host.create_session(ActivityKind::BalloonRace, "Host").await.unwrap();
        host.start_session().await.unwrap();

        guest.join_session(code.as_str(), "Late").await.unwrap();
        assert_eq!(guest.session_state(), Some(SessionState::Active));
    }

    #[tokio::test(start_paused = true)]
    async fn test_device_unavailable_reported_once() {
        let relay = Arc::new(LocalRelay::default());
        let solo = controller(&relay);
        let mut events = solo.subscribe_session_events();

        assert_eq!(solo.fall_back_to_touch(SamplerError::NoDevice), InputMode::Touch);
        assert_eq!(solo.fall_back_to_touch(SamplerError::NoDevice), InputMode::Touch);

        assert_eq!(
            events.recv().await.unwrap(),
            SessionEvent::DeviceUnavailable(SamplerError::NoDevice)
        );
        assert!(matches!(events.try_recv(), Err(TryRecvError::Empty)));
        assert_eq!(solo.input_mode(), InputMode::Touch);
    }
}
