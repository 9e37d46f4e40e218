//! CI-V keep-alive watchdog and outbound CI-V/OpenClose framing (§4.4).

use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::{self, Duration};
use tracing::debug;

use crate::codec::{build_civ, build_close, build_open};
use crate::error::Result;
use crate::session::Session;

pub const WATCHDOG_INTERVAL: Duration = Duration::from_millis(500);
pub const WATCHDOG_SILENCE_THRESHOLD: Duration = Duration::from_millis(2000);

/// Fired by the background watchdog task; the Controller decides whether
/// to act on it by checking the session's `last_received_at` itself, to
/// keep the decision on the single event-loop task.
#[derive(Debug, Clone, Copy)]
pub struct WatchdogTick;

pub struct CivSubsession {
    civ_seq: u16,
    watchdog_handle: Option<JoinHandle<()>>,
}

impl CivSubsession {
    pub fn new() -> Self {
        CivSubsession { civ_seq: 0, watchdog_handle: None }
    }

    pub fn next_civ_seq(&mut self) -> u16 {
        let seq = self.civ_seq;
        self.civ_seq = self.civ_seq.wrapping_add(1);
        seq
    }

    pub async fn send_open(&mut self, session: &mut Session) -> Result<()> {
        let civ_seq = self.next_civ_seq();
        let packet = build_open(0, session.local_id, session.remote_id, civ_seq);
        session.send_untracked(&packet).await
    }

    pub async fn send_close(&mut self, session: &mut Session) -> Result<()> {
        let civ_seq = self.next_civ_seq();
        let packet = build_close(0, session.local_id, session.remote_id, civ_seq);
        session.send_untracked(&packet).await
    }

    pub async fn send_frame(&mut self, session: &mut Session, payload: &[u8]) -> Result<()> {
        let civ_seq = self.next_civ_seq();
        let packet = build_civ(0, session.local_id, session.remote_id, civ_seq, payload);
        session.send_untracked(&packet).await
    }

    pub fn start_watchdog(&mut self, tx: mpsc::Sender<WatchdogTick>) {
        self.stop_watchdog();
        self.watchdog_handle = Some(tokio::spawn(async move {
            let mut interval = time::interval(WATCHDOG_INTERVAL);
            loop {
                interval.tick().await;
                if tx.send(WatchdogTick).await.is_err() {
                    break;
                }
            }
        }));
    }

    pub fn stop_watchdog(&mut self) {
        if let Some(h) = self.watchdog_handle.take() {
            h.abort();
        }
    }
}

impl Default for CivSubsession {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for CivSubsession {
    fn drop(&mut self) {
        self.stop_watchdog();
    }
}

/// `true` if the watchdog should resend an Open to keep the CI-V session
/// from dying silently.
pub fn watchdog_should_reopen(last_received_elapsed: Duration) -> bool {
    last_received_elapsed > WATCHDOG_SILENCE_THRESHOLD
}
