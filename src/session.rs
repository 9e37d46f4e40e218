//! Per-endpoint session state machine: identity, tracked sequencing,
//! retransmission history, and the AYT/Ping/Idle keep-alive timers (§4.3).

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Instant, SystemTime, UNIX_EPOCH};

use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::{self, Duration};
use tracing::debug;

use crate::codec::{self, build_control, build_ping, SEQ_OFFSET, TYPE_ARE_YOU_THERE, TYPE_NULL};
use crate::error::Result;
use crate::udp_endpoint::UdpEndpoint;

pub const AYT_INTERVAL: Duration = Duration::from_millis(500);
pub const PING_INTERVAL: Duration = Duration::from_millis(500);
pub const IDLE_CHECK_INTERVAL: Duration = Duration::from_millis(100);
pub const IDLE_THRESHOLD: Duration = Duration::from_millis(200);

/// Which of the three sessions a [`Tick`] or inbound datagram belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SessionKind {
    Control,
    Civ,
    Audio,
}

/// A timer firing. Ticks are funneled into the Controller's single event
/// loop rather than acting directly, so that packet construction and
/// session-state mutation stay on one task (§5).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Tick {
    Ayt(SessionKind),
    Ping(SessionKind),
    Idle(SessionKind),
}

fn new_local_id() -> u32 {
    let now = SystemTime::now().duration_since(UNIX_EPOCH).unwrap_or_default();
    (now.as_nanos() as u64 & 0xffff_ffff) as u32
}

fn now_timestamp_low32() -> u32 {
    let now = SystemTime::now().duration_since(UNIX_EPOCH).unwrap_or_default();
    (now.as_millis() as u64 & 0xffff_ffff) as u32
}

pub struct Session {
    pub kind: SessionKind,
    endpoint: Arc<UdpEndpoint>,
    pub local_id: u32,
    pub remote_id: u32,
    pub local_token: u16,
    pub rig_token: u32,
    pub tracked_seq: u16,
    pub ping_seq: u16,
    pub inner_seq: u16,
    tx_history: HashMap<u16, Vec<u8>>,
    pub last_sent_at: Instant,
    pub last_received_at: Instant,
    ayt_handle: Option<JoinHandle<()>>,
    ping_handle: Option<JoinHandle<()>>,
    idle_handle: Option<JoinHandle<()>>,
}

impl Session {
    pub fn new(kind: SessionKind, endpoint: Arc<UdpEndpoint>) -> Self {
        let now = Instant::now();
        Session {
            kind,
            endpoint,
            local_id: new_local_id(),
            remote_id: 0,
            local_token: 0,
            rig_token: 0,
            tracked_seq: 1,
            ping_seq: 0,
            inner_seq: 0x30,
            tx_history: HashMap::new(),
            last_sent_at: now,
            last_received_at: now,
            ayt_handle: None,
            ping_handle: None,
            idle_handle: None,
        }
    }

    pub fn endpoint(&self) -> &Arc<UdpEndpoint> {
        &self.endpoint
    }

    /// Stamp, record in `tx_history`, and send. Returns the seq used.
    pub async fn send_tracked(&mut self, mut packet: Vec<u8>) -> Result<u16> {
        let seq = self.tracked_seq;
        self.tracked_seq = self.tracked_seq.wrapping_add(1);
        codec::put_u16_le(&mut packet, SEQ_OFFSET, seq);
        self.tx_history.insert(seq, packet.clone());
        self.endpoint.send(&packet).await?;
        self.last_sent_at = Instant::now();
        debug!(session = ?self.kind, seq, "sent tracked packet");
        Ok(seq)
    }

    pub async fn send_untracked(&mut self, packet: &[u8]) -> Result<()> {
        self.endpoint.send(packet).await?;
        self.last_sent_at = Instant::now();
        Ok(())
    }

    /// Resend history for `seq`, or a placeholder NULL control if the
    /// history has already been evicted — this still satisfies the
    /// radio's retransmit request.
    pub async fn retransmit(&mut self, seq: u16) -> Result<()> {
        if let Some(bytes) = self.tx_history.get(&seq).cloned() {
            self.endpoint.send(&bytes).await?;
        } else {
            let buf = build_control(TYPE_NULL, seq, self.local_id, self.remote_id);
            self.endpoint.send(&buf).await?;
        }
        self.last_sent_at = Instant::now();
        Ok(())
    }

    pub fn start_are_you_there(&mut self, tx: mpsc::Sender<Tick>) {
        self.stop_are_you_there();
        let kind = self.kind;
        self.ayt_handle = Some(tokio::spawn(async move {
            let mut interval = time::interval(AYT_INTERVAL);
            loop {
                interval.tick().await;
                if tx.send(Tick::Ayt(kind)).await.is_err() {
                    break;
                }
            }
        }));
    }

    pub fn stop_are_you_there(&mut self) {
        if let Some(h) = self.ayt_handle.take() {
            h.abort();
        }
    }

    pub fn start_ping(&mut self, tx: mpsc::Sender<Tick>) {
        self.stop_ping();
        let kind = self.kind;
        self.ping_handle = Some(tokio::spawn(async move {
            let mut interval = time::interval(PING_INTERVAL);
            loop {
                interval.tick().await;
                if tx.send(Tick::Ping(kind)).await.is_err() {
                    break;
                }
            }
        }));
    }

    pub fn stop_ping(&mut self) {
        if let Some(h) = self.ping_handle.take() {
            h.abort();
        }
    }

    pub fn start_idle(&mut self, tx: mpsc::Sender<Tick>) {
        self.stop_idle();
        let kind = self.kind;
        self.idle_handle = Some(tokio::spawn(async move {
            let mut interval = time::interval(IDLE_CHECK_INTERVAL);
            loop {
                interval.tick().await;
                if tx.send(Tick::Idle(kind)).await.is_err() {
                    break;
                }
            }
        }));
    }

    pub fn stop_idle(&mut self) {
        if let Some(h) = self.idle_handle.take() {
            h.abort();
        }
    }

    /// Build an ARE_YOU_THERE control packet using current identity.
    pub fn build_are_you_there(&self) -> [u8; codec::HEADER_SIZE] {
        build_control(TYPE_ARE_YOU_THERE, 0, self.local_id, 0)
    }

    /// Build a ping request stamped with the current ping_seq and a
    /// timestamp taken from the lower 32 bits of the system clock.
    pub fn build_ping_request(&self) -> [u8; codec::PING_SIZE] {
        build_ping(self.ping_seq, self.local_id, self.remote_id, false, now_timestamp_low32())
    }

    pub fn advance_ping_seq(&mut self) {
        self.ping_seq = self.ping_seq.wrapping_add(1);
    }

    /// Hand out the current inner-sequence value (the big-endian field
    /// shared by Token/Login/ConnInfo payloads) and advance it.
    pub fn next_inner_seq(&mut self) -> u16 {
        let seq = self.inner_seq;
        self.inner_seq = self.inner_seq.wrapping_add(1);
        seq
    }

    pub fn idle_due(&self) -> bool {
        self.last_sent_at.elapsed() > IDLE_THRESHOLD
    }

    pub fn record_received(&mut self) {
        self.last_received_at = Instant::now();
    }

    /// Stop all timers and reinitialize per-session identity before a
    /// (re)connect attempt. The radio binds session liveness to
    /// `(local_id, tokens)`, so a reconnect must never reuse stale values.
    pub fn reset_state(&mut self) {
        self.stop_are_you_there();
        self.stop_ping();
        self.stop_idle();
        self.local_id = new_local_id();
        self.remote_id = 0;
        self.local_token = 0;
        self.rig_token = 0;
        self.tracked_seq = 1;
        self.ping_seq = 0;
        self.inner_seq = 0x30;
        self.tx_history.clear();
        let now = Instant::now();
        self.last_sent_at = now;
        self.last_received_at = now;
    }

    pub fn shutdown(&mut self) {
        self.stop_are_you_there();
        self.stop_ping();
        self.stop_idle();
    }
}

impl Drop for Session {
    fn drop(&mut self) {
        self.shutdown();
    }
}
