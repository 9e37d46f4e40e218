//! Public event surface (§6). Internally, results flow through per-kind
//! channels; `Controller::events()` exposes the ergonomic broadcast
//! default built from them (§9 "event emitter → typed channels").

use crate::phase::Phase;

/// Capacity of the public `RadioEvent` broadcast channel. A slow
/// subscriber observes `broadcast::error::RecvError::Lagged` rather than
/// ever back-pressuring the Controller's event loop.
pub const EVENT_CHANNEL_CAPACITY: usize = 256;

#[derive(Debug, Clone, PartialEq)]
pub enum RadioEvent {
    Login { ok: bool, error_code: u32, connection_string: String },
    Status { civ_port: u16, audio_port: u16, auth_ok: bool, connected: bool },
    Capabilities { civ_address: u8, audio_name: String, support_tx: bool },
    Civ { payload: Vec<u8> },
    CivFrame { frame: Vec<u8> },
    Audio { pcm16: Vec<i16> },
    Error { message: String },
    ConnectionLost { session: SessionLabel, elapsed_ms: u64 },
    ConnectionRestored { downtime_ms: u64 },
    ReconnectAttempting { attempt: u32, delay_ms: u64 },
    ReconnectFailed { attempt: u32, error: String, will_retry: bool, next_delay_ms: Option<u64> },
    PhaseChanged { from: Phase, to: Phase },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionLabel {
    Control,
    Civ,
    Audio,
}

impl From<crate::session::SessionKind> for SessionLabel {
    fn from(kind: crate::session::SessionKind) -> Self {
        match kind {
            crate::session::SessionKind::Control => SessionLabel::Control,
            crate::session::SessionKind::Civ => SessionLabel::Civ,
            crate::session::SessionKind::Audio => SessionLabel::Audio,
        }
    }
}
