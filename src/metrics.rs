//! Cumulative atomic counters for the life of a `Controller` (§3.1).
//!
//! Same `Atomic*` counters plus a `*Snapshot` split as a periodic stats
//! reporter would use, except these counters are never reset on read —
//! `get_metrics()` is a pure snapshot, not an interval rate.

use std::sync::atomic::{AtomicU64, Ordering};

#[derive(Debug, Default)]
pub struct Metrics {
    pub control_packets_sent: AtomicU64,
    pub control_packets_received: AtomicU64,
    pub civ_packets_sent: AtomicU64,
    pub civ_packets_received: AtomicU64,
    pub civ_frames_reassembled: AtomicU64,
    pub audio_frames_sent: AtomicU64,
    pub audio_frames_received: AtomicU64,
    pub audio_silence_frames_sent: AtomicU64,
    pub retransmits_served: AtomicU64,
    pub retransmits_requested: AtomicU64,
    pub protocol_errors: AtomicU64,
    pub transport_errors: AtomicU64,
    pub reconnect_count: AtomicU64,
}

macro_rules! record_fn {
    ($name:ident, $field:ident) => {
        pub fn $name(&self) {
            self.$field.fetch_add(1, Ordering::Relaxed);
        }
    };
}

impl Metrics {
    pub fn new() -> Self {
        Self::default()
    }

    record_fn!(record_control_packet_sent, control_packets_sent);
    record_fn!(record_control_packet_received, control_packets_received);
    record_fn!(record_civ_packet_sent, civ_packets_sent);
    record_fn!(record_civ_packet_received, civ_packets_received);
    record_fn!(record_civ_frame_reassembled, civ_frames_reassembled);
    record_fn!(record_audio_frame_sent, audio_frames_sent);
    record_fn!(record_audio_frame_received, audio_frames_received);
    record_fn!(record_audio_silence_frame_sent, audio_silence_frames_sent);
    record_fn!(record_retransmit_served, retransmits_served);
    record_fn!(record_retransmit_requested, retransmits_requested);
    record_fn!(record_protocol_error, protocol_errors);
    record_fn!(record_transport_error, transport_errors);
    record_fn!(record_reconnect, reconnect_count);

    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            control_packets_sent: self.control_packets_sent.load(Ordering::Relaxed),
            control_packets_received: self.control_packets_received.load(Ordering::Relaxed),
            civ_packets_sent: self.civ_packets_sent.load(Ordering::Relaxed),
            civ_packets_received: self.civ_packets_received.load(Ordering::Relaxed),
            civ_frames_reassembled: self.civ_frames_reassembled.load(Ordering::Relaxed),
            audio_frames_sent: self.audio_frames_sent.load(Ordering::Relaxed),
            audio_frames_received: self.audio_frames_received.load(Ordering::Relaxed),
            audio_silence_frames_sent: self.audio_silence_frames_sent.load(Ordering::Relaxed),
            retransmits_served: self.retransmits_served.load(Ordering::Relaxed),
            retransmits_requested: self.retransmits_requested.load(Ordering::Relaxed),
            protocol_errors: self.protocol_errors.load(Ordering::Relaxed),
            transport_errors: self.transport_errors.load(Ordering::Relaxed),
            reconnect_count: self.reconnect_count.load(Ordering::Relaxed),
        }
    }
}

/// Owned point-in-time copy returned by `Controller::get_metrics()`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, serde::Serialize)]
pub struct MetricsSnapshot {
    pub control_packets_sent: u64,
    pub control_packets_received: u64,
    pub civ_packets_sent: u64,
    pub civ_packets_received: u64,
    pub civ_frames_reassembled: u64,
    pub audio_frames_sent: u64,
    pub audio_frames_received: u64,
    pub audio_silence_frames_sent: u64,
    pub retransmits_served: u64,
    pub retransmits_requested: u64,
    pub protocol_errors: u64,
    pub transport_errors: u64,
    pub reconnect_count: u64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn snapshot_is_non_destructive() {
        let metrics = Metrics::new();
        metrics.record_civ_packet_sent();
        metrics.record_civ_packet_sent();
        let first = metrics.snapshot();
        let second = metrics.snapshot();
        assert_eq!(first.civ_packets_sent, 2);
        assert_eq!(second.civ_packets_sent, 2);
    }
}
