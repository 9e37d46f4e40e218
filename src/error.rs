//! Error taxonomy for the Icom WLAN client core (§7 of the protocol spec).

use crate::phase::Phase;
use std::io;

/// Result alias used throughout the crate.
pub type Result<T> = std::result::Result<T, RadioError>;

/// Errors surfaced by the core.
///
/// Transport and protocol errors are usually handled locally (see the
/// `error` event and the demux's drop-silently path); this enum is the
/// vocabulary used when an error must propagate to a caller — the
/// rejection value of `connect()`, or a field on a lifecycle event.
#[derive(Debug, thiserror::Error)]
pub enum RadioError {
    /// Socket send/recv failure.
    #[error("transport error: {0}")]
    Transport(#[from] io::Error),

    /// A packet failed length/magic/field validation and was rejected
    /// before it could reach the state machine.
    #[error("protocol error: {0}")]
    Protocol(String),

    /// `LoginResponse` carried a non-zero error code.
    #[error("login rejected by radio (error code {error_code})")]
    Auth {
        /// Big-endian `u32` at offset 0x30 of the LoginResponse packet.
        error_code: u32,
    },

    /// The radio reported `connected=false` in a `Status` packet, or
    /// rejected a token renewal.
    #[error("radio reported busy/rejected")]
    Busy,

    /// A readiness await (login / CI-V / audio / overall attempt)
    /// expired before the radio responded.
    #[error("timed out waiting for radio during {phase}")]
    Timeout {
        /// Phase the connection attempt was in when the timeout fired.
        phase: Phase,
    },

    /// `disconnect()` cancelled an in-flight `connect()` attempt.
    #[error("connection attempt aborted: {reason} (session {session_id}, phase {phase})")]
    Aborted {
        reason: String,
        session_id: u64,
        phase: Phase,
    },

    /// `connect()` was called while phase == DISCONNECTING.
    #[error("cannot connect while disconnecting")]
    DisconnectInProgress,

    /// An illegal phase transition was attempted.
    #[error("illegal phase transition: {from} -> {to}")]
    IllegalTransition { from: Phase, to: Phase },
}

impl RadioError {
    /// `true` for errors that should trigger the reconnect loop when they
    /// occur on an already-CONNECTED controller (§7 propagation policy).
    pub fn triggers_reconnect(&self) -> bool {
        matches!(self, RadioError::Busy | RadioError::Timeout { .. } | RadioError::Transport(_))
    }
}

/// Manual `Clone`: `io::Error` isn't `Clone`, so the `Transport` variant is
/// reconstructed from its kind and message. Needed to resolve every waiter
/// of a `connect()` call that multiple callers are awaiting at once.
impl Clone for RadioError {
    fn clone(&self) -> Self {
        match self {
            RadioError::Transport(e) => RadioError::Transport(io::Error::new(e.kind(), e.to_string())),
            RadioError::Protocol(s) => RadioError::Protocol(s.clone()),
            RadioError::Auth { error_code } => RadioError::Auth { error_code: *error_code },
            RadioError::Busy => RadioError::Busy,
            RadioError::Timeout { phase } => RadioError::Timeout { phase: *phase },
            RadioError::Aborted { reason, session_id, phase } => {
                RadioError::Aborted { reason: reason.clone(), session_id: *session_id, phase: *phase }
            }
            RadioError::DisconnectInProgress => RadioError::DisconnectInProgress,
            RadioError::IllegalTransition { from, to } => RadioError::IllegalTransition { from: *from, to: *to },
        }
    }
}
