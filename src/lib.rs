//! BreathSync
//!
//! Microphone breath-cycle detection with a touch fallback, plus a rolling
//! synchrony score for groups breathing together over a session relay.

pub mod audio;
pub mod commands;
pub mod config;
pub mod console;
pub mod controller;
pub mod detector;
pub mod event;
pub mod registry;
pub mod scorer;
pub mod session;
pub mod transport;

pub use config::{Config, ConfigError};
pub use controller::{InputMode, SessionClock, SessionController, SessionEvent, LOCAL_PARTICIPANT};
pub use event::{BreathEvent, BreathPhase, BreathSource, EnergySample, ParticipantId};
pub use session::{ActivityKind, SessionCode, SessionError, SessionState, SessionSummary};
pub use transport::{LocalRelay, RelayEvent, SyncTransport, TransportError};
