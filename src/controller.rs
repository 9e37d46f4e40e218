//! Connection state machine: handshake sequencing, inbound-packet demux,
//! the health monitor, and the reconnect loop (§4.7).
//!
//! Everything that mutates a `Session`, `CivSubsession`, or the CI-V
//! reassembler runs inside `ControllerActor::run`'s single `select!` loop.
//! `Controller` is the cheap, `Clone`-free handle callers hold: every
//! public method either sends a `Command` and awaits a oneshot reply, or —
//! for audio enqueue and the read-only phase/metrics getters — reaches
//! into a small piece of state that's safe to share directly.

use std::net::SocketAddr;
use std::sync::{Arc, Mutex};

use tokio::sync::{broadcast, mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio::time::{self, Duration};
use tracing::{debug, info, warn};

use crate::audio_subsession::AudioSubsession;
use crate::civ_reassembler::CivReassembler;
use crate::civ_subsession::{self, CivSubsession, WatchdogTick};
use crate::codec;
use crate::config::RadioConfig;
use crate::error::{RadioError, Result};
use crate::events::{RadioEvent, SessionLabel, EVENT_CHANNEL_CAPACITY};
use crate::metrics::{Metrics, MetricsSnapshot};
use crate::phase::Phase;
use crate::session::{Session, SessionKind, Tick};
use crate::udp_endpoint::{self, UdpEndpoint};

const TOKEN_RENEWAL_INTERVAL: Duration = Duration::from_secs(60);
const POST_DISCONNECT_DRAIN: Duration = Duration::from_millis(200);
const RECONNECT_SETTLE: Duration = Duration::from_secs(5);

/// Tunable knobs for the health monitor and reconnect loop, set at
/// construction from `RadioConfig` and adjustable via `configure_monitor`.
#[derive(Debug, Clone)]
pub struct MonitorConfig {
    pub check_interval: Duration,
    pub session_timeout_ms: u64,
    pub auto_reconnect: bool,
    pub max_reconnect_attempts: Option<u32>,
    pub reconnect_base_delay_ms: u64,
    pub reconnect_max_delay_ms: u64,
    pub connect_timeout_ms: u64,
    pub subsession_timeout_ms: u64,
}

impl From<&RadioConfig> for MonitorConfig {
    fn from(cfg: &RadioConfig) -> Self {
        MonitorConfig {
            check_interval: Duration::from_millis(cfg.check_interval_ms),
            session_timeout_ms: cfg.session_timeout_ms,
            auto_reconnect: cfg.auto_reconnect,
            max_reconnect_attempts: cfg.max_reconnect_attempts(),
            reconnect_base_delay_ms: cfg.reconnect_base_delay_ms,
            reconnect_max_delay_ms: cfg.reconnect_max_delay_ms,
            connect_timeout_ms: cfg.connect_timeout_ms,
            subsession_timeout_ms: cfg.subsession_timeout_ms,
        }
    }
}

enum Command {
    Connect(oneshot::Sender<Result<()>>),
    Disconnect { reason: Option<String>, silent: bool, reply: oneshot::Sender<()> },
    SendCiv(Vec<u8>, oneshot::Sender<Result<()>>),
    ConfigureMonitor(MonitorConfig, oneshot::Sender<()>),
    ReconnectTeardown(oneshot::Sender<()>),
    ReconnectConnect(oneshot::Sender<Result<()>>),
    GiveUpReconnect,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum BringupStage {
    AwaitingAyt,
    AwaitingReady,
    Ready,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ConnectStage {
    AwaitingIAmHere,
    AwaitingReady,
    AwaitingLoginResponse,
    AwaitingConnInfo,
    AwaitingStatus,
    BringingUpSubsessions,
}

struct ConnectAttempt {
    session_id: u64,
    is_reconnect: bool,
    stage: ConnectStage,
    civ_bringup: BringupStage,
    audio_bringup: BringupStage,
    waiters: Vec<oneshot::Sender<Result<()>>>,
    overall_deadline: time::Instant,
    subsession_deadline: Option<time::Instant>,
}

fn connect_attempt_deadline(attempt: &ConnectAttempt) -> time::Instant {
    match attempt.subsession_deadline {
        Some(d) => std::cmp::min(d, attempt.overall_deadline),
        None => attempt.overall_deadline,
    }
}

fn backoff_delay(attempt: u32, base: Duration, max: Duration) -> Duration {
    let shift = attempt.saturating_sub(1).min(31);
    let scaled = base.saturating_mul(1u32.checked_shl(shift).unwrap_or(u32::MAX));
    std::cmp::min(scaled, max)
}

fn bytes_to_i16_le(bytes: &[u8]) -> Vec<i16> {
    bytes.chunks_exact(2).map(|c| i16::from_le_bytes([c[0], c[1]])).collect()
}

fn spawn_recv_loop(
    kind: SessionKind,
    endpoint: Arc<UdpEndpoint>,
    tx: mpsc::Sender<(SessionKind, Vec<u8>)>,
    err_tx: mpsc::Sender<(SessionKind, RadioError)>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut buf = [0u8; udp_endpoint::MAX_DATAGRAM_SIZE];
        loop {
            match endpoint.recv(&mut buf).await {
                Ok(n) => {
                    if tx.send((kind, buf[..n].to_vec())).await.is_err() {
                        break;
                    }
                }
                Err(e) => {
                    debug!(?kind, error = %e, "recv error, continuing");
                    if err_tx.send((kind, e)).await.is_err() {
                        break;
                    }
                }
            }
        }
    })
}

/// Public handle to a running connection. Cheap to clone-by-reference
/// (everything it holds is itself shared); `Drop` aborts the actor task.
pub struct Controller {
    cmd_tx: mpsc::Sender<Command>,
    events_tx: broadcast::Sender<RadioEvent>,
    metrics: Arc<Metrics>,
    phase_shared: Arc<Mutex<Phase>>,
    audio_sub: Arc<Mutex<AudioSubsession>>,
    actor_handle: JoinHandle<()>,
}

impl Controller {
    pub async fn new(config: RadioConfig) -> Result<Self> {
        let control_remote_addr: SocketAddr = config
            .control_addr()
            .parse()
            .map_err(|_| RadioError::Protocol(format!("invalid host/port {}", config.control_addr())))?;

        let civ_endpoint = Arc::new(UdpEndpoint::bind_unconnected(&config.bind_host, config.recv_buf_size).await?);
        let audio_endpoint = Arc::new(UdpEndpoint::bind_unconnected(&config.bind_host, config.recv_buf_size).await?);
        let control_endpoint = Arc::new(UdpEndpoint::connect(control_remote_addr, config.recv_buf_size).await?);

        let (cmd_tx, cmd_rx) = mpsc::channel(64);
        let (tick_tx, tick_rx) = mpsc::channel(256);
        let (watchdog_tx, watchdog_rx) = mpsc::channel(16);
        let (dgram_tx, dgram_rx) = mpsc::channel(256);
        let (error_tx, error_rx) = mpsc::channel(64);
        let (events_tx, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);

        let metrics = Arc::new(Metrics::new());

        let control = Session::new(SessionKind::Control, control_endpoint.clone());
        let civ_session = Session::new(SessionKind::Civ, civ_endpoint.clone());
        let audio_session = Session::new(SessionKind::Audio, audio_endpoint.clone());

        let control_recv_handle = spawn_recv_loop(SessionKind::Control, control_endpoint, dgram_tx.clone(), error_tx.clone());
        let civ_recv_handle = spawn_recv_loop(SessionKind::Civ, civ_endpoint, dgram_tx.clone(), error_tx.clone());
        let audio_recv_handle = spawn_recv_loop(SessionKind::Audio, audio_endpoint, dgram_tx.clone(), error_tx.clone());

        let audio_sub = Arc::new(Mutex::new(AudioSubsession::new(
            audio_session.endpoint().clone(),
            config.audio_volume,
            metrics.clone(),
        )));
        let phase_shared = Arc::new(Mutex::new(Phase::Idle));
        let monitor = MonitorConfig::from(&config);

        let actor = ControllerActor {
            config,
            control_remote_addr,
            phase: Phase::Idle,
            phase_shared: phase_shared.clone(),
            session_id: 0,
            control,
            civ_session,
            audio_session,
            civ_sub: CivSubsession::new(),
            audio_sub: audio_sub.clone(),
            reassembler: CivReassembler::new(),
            metrics: metrics.clone(),
            events_tx: events_tx.clone(),
            cmd_tx: cmd_tx.clone(),
            tick_tx,
            watchdog_tx,
            dgram_tx: dgram_tx.clone(),
            error_tx: error_tx.clone(),
            cmd_rx,
            tick_rx,
            watchdog_rx,
            dgram_rx,
            error_rx,
            connect_attempt: None,
            civ_address: 0,
            audio_name: String::new(),
            support_tx: false,
            last_rig_name: String::new(),
            health_interval: time::interval(monitor.check_interval),
            renewal_interval: time::interval(TOKEN_RENEWAL_INTERVAL),
            monitor,
            renewal_active: false,
            last_disconnect_at: None,
            reconnect_handle: None,
            control_recv_handle: Some(control_recv_handle),
            _civ_recv_handle: civ_recv_handle,
            _audio_recv_handle: audio_recv_handle,
        };

        let actor_handle = tokio::spawn(actor.run());

        Ok(Controller { cmd_tx, events_tx, metrics, phase_shared, audio_sub, actor_handle })
    }

    /// Idempotent: returns immediately if already `Connected`, joins an
    /// in-flight attempt if `Connecting`/`Reconnecting`, and fails fast if
    /// `Disconnecting`.
    pub async fn connect(&self) -> Result<()> {
        let (tx, rx) = oneshot::channel();
        self.send_command(Command::Connect(tx)).await?;
        rx.await.map_err(|_| RadioError::Protocol("controller task is gone".into()))?
    }

    /// Idempotent full teardown; never errors. `silent` suppresses the
    /// `PhaseChanged`/reason `Error` events this teardown would otherwise
    /// broadcast, while still resolving any in-flight connect waiters and
    /// settling session state exactly as a normal disconnect would.
    pub async fn disconnect(&self, reason: Option<String>, silent: bool) {
        let (tx, rx) = oneshot::channel();
        if self.cmd_tx.send(Command::Disconnect { reason, silent, reply: tx }).await.is_ok() {
            let _ = rx.await;
        }
    }

    pub async fn send_civ(&self, payload: Vec<u8>) -> Result<()> {
        let (tx, rx) = oneshot::channel();
        self.send_command(Command::SendCiv(payload, tx)).await?;
        rx.await.map_err(|_| RadioError::Protocol("controller task is gone".into()))?
    }

    pub async fn configure_monitor(&self, cfg: MonitorConfig) {
        let (tx, rx) = oneshot::channel();
        if self.cmd_tx.send(Command::ConfigureMonitor(cfg, tx)).await.is_ok() {
            let _ = rx.await;
        }
    }

    /// Enqueue PCM16 samples for the 50 Hz transmit scheduler. Bypasses the
    /// actor's command channel entirely — the audio queue is its own small
    /// shared lock, so enqueueing never waits on handshake or reconnect work.
    pub fn enqueue_audio_pcm16(&self, samples: &[i16], leading_silence: bool) {
        self.audio_sub.lock().unwrap().enqueue_pcm16(samples, leading_silence);
    }

    pub fn enqueue_audio_float32(&self, samples: &[f32], leading_silence: bool) {
        self.audio_sub.lock().unwrap().enqueue_float32(samples, leading_silence);
    }

    pub fn enqueue_trailing_silence(&self) {
        self.audio_sub.lock().unwrap().enqueue_trailing_silence();
    }

    pub fn phase(&self) -> Phase {
        *self.phase_shared.lock().unwrap()
    }

    pub fn get_metrics(&self) -> MetricsSnapshot {
        self.metrics.snapshot()
    }

    pub fn events(&self) -> broadcast::Receiver<RadioEvent> {
        self.events_tx.subscribe()
    }

    async fn send_command(&self, cmd: Command) -> Result<()> {
        self.cmd_tx.send(cmd).await.map_err(|_| RadioError::Protocol("controller task is gone".into()))
    }
}

impl Drop for Controller {
    fn drop(&mut self) {
        self.actor_handle.abort();
    }
}

struct ControllerActor {
    config: RadioConfig,
    control_remote_addr: SocketAddr,

    phase: Phase,
    phase_shared: Arc<Mutex<Phase>>,
    session_id: u64,

    control: Session,
    civ_session: Session,
    audio_session: Session,
    civ_sub: CivSubsession,
    audio_sub: Arc<Mutex<AudioSubsession>>,
    reassembler: CivReassembler,

    metrics: Arc<Metrics>,
    events_tx: broadcast::Sender<RadioEvent>,

    cmd_tx: mpsc::Sender<Command>,
    tick_tx: mpsc::Sender<Tick>,
    watchdog_tx: mpsc::Sender<WatchdogTick>,
    dgram_tx: mpsc::Sender<(SessionKind, Vec<u8>)>,
    error_tx: mpsc::Sender<(SessionKind, RadioError)>,

    cmd_rx: mpsc::Receiver<Command>,
    tick_rx: mpsc::Receiver<Tick>,
    watchdog_rx: mpsc::Receiver<WatchdogTick>,
    dgram_rx: mpsc::Receiver<(SessionKind, Vec<u8>)>,
    error_rx: mpsc::Receiver<(SessionKind, RadioError)>,

    connect_attempt: Option<ConnectAttempt>,

    civ_address: u8,
    audio_name: String,
    support_tx: bool,
    last_rig_name: String,

    health_interval: time::Interval,
    renewal_interval: time::Interval,
    monitor: MonitorConfig,
    renewal_active: bool,
    last_disconnect_at: Option<time::Instant>,
    reconnect_handle: Option<JoinHandle<()>>,

    control_recv_handle: Option<JoinHandle<()>>,
    _civ_recv_handle: JoinHandle<()>,
    _audio_recv_handle: JoinHandle<()>,
}

impl ControllerActor {
    async fn run(mut self) {
        loop {
            let deadline = self.connect_attempt.as_ref().map(connect_attempt_deadline);
            tokio::select! {
                Some(cmd) = self.cmd_rx.recv() => self.handle_command(cmd).await,
                Some(tick) = self.tick_rx.recv() => self.handle_tick(tick).await,
                Some(_) = self.watchdog_rx.recv() => self.handle_civ_watchdog().await,
                Some((kind, bytes)) = self.dgram_rx.recv() => self.handle_datagram(kind, bytes).await,
                Some((kind, err)) = self.error_rx.recv() => self.handle_transport_error(kind, err).await,
                _ = self.health_interval.tick() => self.handle_health_tick().await,
                _ = self.renewal_interval.tick() => self.handle_token_renewal_tick().await,
                _ = time::sleep_until(deadline.unwrap_or_else(time::Instant::now)), if deadline.is_some() => {
                    self.handle_connect_timeout().await;
                }
                else => break,
            }
        }
    }

    fn session_mut(&mut self, kind: SessionKind) -> &mut Session {
        match kind {
            SessionKind::Control => &mut self.control,
            SessionKind::Civ => &mut self.civ_session,
            SessionKind::Audio => &mut self.audio_session,
        }
    }

    fn set_phase(&mut self, new: Phase) -> Result<()> {
        self.set_phase_impl(new, true)
    }

    /// Transition without broadcasting `PhaseChanged` — used by silent
    /// disconnects, which still have to settle internal state and resolve
    /// waiters but must not surface the teardown to event subscribers.
    fn set_phase_quiet(&mut self, new: Phase) -> Result<()> {
        self.set_phase_impl(new, false)
    }

    fn set_phase_impl(&mut self, new: Phase, emit: bool) -> Result<()> {
        if !self.phase.can_transition_to(new) {
            return Err(RadioError::IllegalTransition { from: self.phase, to: new });
        }
        let from = self.phase;
        self.phase = new;
        *self.phase_shared.lock().unwrap() = new;
        info!(%from, to = %new, "phase changed");
        if emit {
            let _ = self.events_tx.send(RadioEvent::PhaseChanged { from, to: new });
        }
        Ok(())
    }

    /// An illegal transition reaching here is a logic bug, not a runtime
    /// condition callers can recover from — log it and surface it as an
    /// error event rather than losing it silently.
    fn report_phase_error(&self, err: RadioError) {
        warn!(%err, "phase transition rejected");
        self.emit_error_event(err.to_string());
    }

    fn emit_error_event(&self, message: String) {
        let _ = self.events_tx.send(RadioEvent::Error { message });
    }

    async fn handle_transport_error(&mut self, kind: SessionKind, err: RadioError) {
        self.metrics.record_transport_error();
        self.emit_error_event(format!("{kind:?} transport error: {err}"));
        if self.phase == Phase::Connected && err.triggers_reconnect() {
            self.begin_reconnect().await;
        }
    }

    // ── Commands ────────────────────────────────────────────────────────

    async fn handle_command(&mut self, cmd: Command) {
        match cmd {
            Command::Connect(reply) => self.handle_connect_command(reply).await,
            Command::Disconnect { reason, silent, reply } => {
                self.handle_disconnect(reason, silent).await;
                let _ = reply.send(());
            }
            Command::SendCiv(payload, reply) => self.handle_send_civ(payload, reply).await,
            Command::ConfigureMonitor(cfg, reply) => {
                self.health_interval = time::interval(cfg.check_interval);
                self.monitor = cfg;
                let _ = reply.send(());
            }
            Command::ReconnectTeardown(reply) => {
                self.teardown_sessions().await;
                let _ = reply.send(());
            }
            Command::ReconnectConnect(reply) => {
                self.begin_connect_attempt(vec![reply], true).await;
            }
            Command::GiveUpReconnect => {
                if self.phase == Phase::Reconnecting {
                    if let Err(e) = self.set_phase(Phase::Idle) {
                        self.report_phase_error(e);
                    }
                }
            }
        }
    }

    async fn handle_connect_command(&mut self, reply: oneshot::Sender<Result<()>>) {
        match self.phase {
            Phase::Connected => {
                let _ = reply.send(Ok(()));
            }
            Phase::Connecting | Phase::Reconnecting => {
                if let Some(attempt) = &mut self.connect_attempt {
                    attempt.waiters.push(reply);
                } else {
                    let _ = reply.send(Err(RadioError::Protocol("no attempt in flight for current phase".into())));
                }
            }
            Phase::Disconnecting => {
                let _ = reply.send(Err(RadioError::DisconnectInProgress));
            }
            Phase::Idle => {
                self.begin_connect_attempt(vec![reply], false).await;
            }
        }
    }

    async fn handle_send_civ(&mut self, payload: Vec<u8>, reply: oneshot::Sender<Result<()>>) {
        if self.phase != Phase::Connected {
            let _ = reply.send(Err(RadioError::Protocol("not connected".into())));
            return;
        }
        let result = self.civ_sub.send_frame(&mut self.civ_session, &payload).await;
        if result.is_ok() {
            self.metrics.record_civ_packet_sent();
        }
        let _ = reply.send(result);
    }

    // ── Connect sequence ────────────────────────────────────────────────

    async fn begin_connect_attempt(&mut self, waiters: Vec<oneshot::Sender<Result<()>>>, is_reconnect: bool) {
        self.session_id += 1;
        let session_id = self.session_id;
        if let Err(e) = self.set_phase(if is_reconnect { Phase::Reconnecting } else { Phase::Connecting }) {
            for w in waiters {
                let _ = w.send(Err(e.clone()));
            }
            self.report_phase_error(e);
            return;
        }

        match UdpEndpoint::connect(self.control_remote_addr, self.config.recv_buf_size).await {
            Ok(endpoint) => {
                if let Some(h) = self.control_recv_handle.take() {
                    h.abort();
                }
                let endpoint = Arc::new(endpoint);
                self.control = Session::new(SessionKind::Control, endpoint.clone());
                self.control_recv_handle =
                    Some(spawn_recv_loop(SessionKind::Control, endpoint, self.dgram_tx.clone(), self.error_tx.clone()));
            }
            Err(e) => {
                for w in waiters {
                    let _ = w.send(Err(e.clone()));
                }
                // Already in Reconnecting if this is a reconnect attempt — the
                // driver will retry, there's no phase to unwind to here.
                if !is_reconnect {
                    if let Err(e) = self.set_phase(Phase::Idle) {
                        self.report_phase_error(e);
                    }
                }
                return;
            }
        }
        self.civ_session.reset_state();
        self.audio_session.reset_state();
        self.civ_sub = CivSubsession::new();
        self.audio_sub.lock().unwrap().stop();
        self.reassembler = CivReassembler::new();
        self.renewal_active = false;

        self.connect_attempt = Some(ConnectAttempt {
            session_id,
            is_reconnect,
            stage: ConnectStage::AwaitingIAmHere,
            civ_bringup: BringupStage::AwaitingAyt,
            audio_bringup: BringupStage::AwaitingAyt,
            waiters,
            overall_deadline: time::Instant::now() + Duration::from_millis(self.monitor.connect_timeout_ms),
            subsession_deadline: None,
        });
        self.control.start_are_you_there(self.tick_tx.clone());
    }

    async fn handle_connect_timeout(&mut self) {
        let phase = self.phase;
        self.fail_connect_attempt(RadioError::Timeout { phase }).await;
    }

    async fn fail_connect_attempt(&mut self, err: RadioError) {
        if let Some(attempt) = self.connect_attempt.take() {
            for w in attempt.waiters {
                let _ = w.send(Err(err.clone()));
            }
            self.teardown_sessions().await;
            if !attempt.is_reconnect {
                if let Err(e) = self.set_phase(Phase::Idle) {
                    self.report_phase_error(e);
                }
            }
        }
    }

    async fn succeed_connect_attempt(&mut self) {
        let result = self.set_phase(Phase::Connected);
        if let Some(attempt) = self.connect_attempt.take() {
            for w in attempt.waiters {
                let _ = w.send(result.clone());
            }
        }
        if let Err(e) = result {
            self.report_phase_error(e);
        }
    }

    async fn maybe_finish_subsession_bringup(&mut self) {
        let ready = matches!(
            &self.connect_attempt,
            Some(a) if a.stage == ConnectStage::BringingUpSubsessions
                && a.civ_bringup == BringupStage::Ready
                && a.audio_bringup == BringupStage::Ready
        );
        if ready {
            self.succeed_connect_attempt().await;
        }
    }

    async fn teardown_sessions(&mut self) {
        let disconnect = codec::build_control(codec::TYPE_DISCONNECT, 0, self.control.local_id, self.control.remote_id);
        let _ = self.control.send_untracked(&disconnect).await;
        self.control.shutdown();
        self.civ_session.shutdown();
        self.audio_session.shutdown();
        self.civ_sub.stop_watchdog();
        self.audio_sub.lock().unwrap().stop();
        self.renewal_active = false;
    }

    async fn handle_disconnect(&mut self, reason: Option<String>, silent: bool) {
        if let Some(h) = self.reconnect_handle.take() {
            h.abort();
        }
        match self.phase {
            Phase::Idle | Phase::Disconnecting => {}
            Phase::Reconnecting => {
                self.teardown_sessions().await;
                let result = if silent { self.set_phase_quiet(Phase::Idle) } else { self.set_phase(Phase::Idle) };
                if let Err(e) = result {
                    self.report_phase_error(e);
                }
            }
            Phase::Connecting | Phase::Connected => {
                if let Some(attempt) = self.connect_attempt.take() {
                    let abort_reason = reason.clone().unwrap_or_else(|| "disconnect requested".into());
                    for w in attempt.waiters {
                        let _ = w.send(Err(RadioError::Aborted {
                            reason: abort_reason.clone(),
                            session_id: attempt.session_id,
                            phase: self.phase,
                        }));
                    }
                }
                let result = if silent { self.set_phase_quiet(Phase::Disconnecting) } else { self.set_phase(Phase::Disconnecting) };
                if let Err(e) = result {
                    self.report_phase_error(e);
                }
                self.teardown_sessions().await;
                time::sleep(POST_DISCONNECT_DRAIN).await;
                let result = if silent { self.set_phase_quiet(Phase::Idle) } else { self.set_phase(Phase::Idle) };
                if let Err(e) = result {
                    self.report_phase_error(e);
                }
            }
        }
        if !silent {
            if let Some(message) = reason {
                self.emit_error_event(message);
            }
        }
    }

    // ── Health monitor / reconnect ──────────────────────────────────────

    async fn handle_health_tick(&mut self) {
        if self.phase != Phase::Connected {
            return;
        }
        let timeout = Duration::from_millis(self.monitor.session_timeout_ms);
        let checks = [
            (SessionLabel::Control, self.control.last_received_at.elapsed()),
            (SessionLabel::Civ, self.civ_session.last_received_at.elapsed()),
            (SessionLabel::Audio, self.audio_session.last_received_at.elapsed()),
        ];
        for (label, elapsed) in checks {
            if elapsed > timeout {
                let _ = self.events_tx.send(RadioEvent::ConnectionLost { session: label, elapsed_ms: elapsed.as_millis() as u64 });
                if (RadioError::Timeout { phase: self.phase }).triggers_reconnect() {
                    self.begin_reconnect().await;
                }
                return;
            }
        }
    }

    async fn begin_reconnect(&mut self) {
        if self.phase != Phase::Connected {
            return;
        }
        if let Err(e) = self.set_phase(Phase::Reconnecting) {
            self.report_phase_error(e);
            return;
        }
        self.last_disconnect_at = Some(time::Instant::now());
        if !self.monitor.auto_reconnect {
            self.teardown_sessions().await;
            if let Err(e) = self.set_phase(Phase::Idle) {
                self.report_phase_error(e);
            }
            return;
        }
        self.spawn_reconnect_driver();
    }

    fn spawn_reconnect_driver(&mut self) {
        if let Some(h) = self.reconnect_handle.take() {
            h.abort();
        }
        let cmd_tx = self.cmd_tx.clone();
        let events_tx = self.events_tx.clone();
        let metrics = self.metrics.clone();
        let base = Duration::from_millis(self.monitor.reconnect_base_delay_ms);
        let max_delay = Duration::from_millis(self.monitor.reconnect_max_delay_ms);
        let max_attempts = self.monitor.max_reconnect_attempts;
        let disconnect_at = time::Instant::now();

        self.reconnect_handle = Some(tokio::spawn(async move {
            let mut attempt: u32 = 0;
            loop {
                attempt += 1;
                if let Some(max) = max_attempts {
                    if attempt > max {
                        let _ = cmd_tx.send(Command::GiveUpReconnect).await;
                        break;
                    }
                }

                let delay = backoff_delay(attempt, base, max_delay);
                let _ = events_tx.send(RadioEvent::ReconnectAttempting { attempt, delay_ms: delay.as_millis() as u64 });
                time::sleep(delay).await;

                let (tx1, rx1) = oneshot::channel();
                if cmd_tx.send(Command::ReconnectTeardown(tx1)).await.is_err() {
                    break;
                }
                let _ = rx1.await;
                time::sleep(RECONNECT_SETTLE).await;

                let (tx2, rx2) = oneshot::channel();
                if cmd_tx.send(Command::ReconnectConnect(tx2)).await.is_err() {
                    break;
                }
                let outcome = time::timeout(Duration::from_secs(30), rx2).await;
                let will_retry = max_attempts.map_or(true, |m| attempt < m);

                let failure = match outcome {
                    Ok(Ok(Ok(()))) => {
                        metrics.record_reconnect();
                        let downtime = disconnect_at.elapsed();
                        let _ = events_tx.send(RadioEvent::ConnectionRestored { downtime_ms: downtime.as_millis() as u64 });
                        break;
                    }
                    Ok(Ok(Err(e))) => e.to_string(),
                    Ok(Err(_)) => "controller task is gone".to_string(),
                    Err(_) => "connect attempt timed out".to_string(),
                };

                let next_delay_ms = if will_retry { Some(backoff_delay(attempt + 1, base, max_delay).as_millis() as u64) } else { None };
                let _ = events_tx.send(RadioEvent::ReconnectFailed { attempt, error: failure, will_retry, next_delay_ms });
                if !will_retry {
                    let _ = cmd_tx.send(Command::GiveUpReconnect).await;
                    break;
                }
            }
        }));
    }

    async fn handle_token_renewal_tick(&mut self) {
        if !self.renewal_active || self.phase != Phase::Connected {
            return;
        }
        let inner_seq = self.control.next_inner_seq();
        let rig_token = self.control.rig_token;
        let req = codec::build_token_request(0, self.control.local_id, self.control.remote_id, inner_seq, codec::TOKEN_REQ_RENEWAL, rig_token);
        let _ = self.control.send_tracked(req.to_vec()).await;
    }

    // ── Timers ──────────────────────────────────────────────────────────

    async fn handle_tick(&mut self, tick: Tick) {
        match tick {
            Tick::Ayt(kind) => self.handle_ayt_tick(kind).await,
            Tick::Ping(kind) => self.handle_ping_tick(kind).await,
            Tick::Idle(kind) => self.handle_idle_tick(kind).await,
        }
    }

    async fn handle_ayt_tick(&mut self, kind: SessionKind) {
        let pkt = self.session_mut(kind).build_are_you_there().to_vec();
        let _ = self.session_mut(kind).send_untracked(&pkt).await;
        if kind == SessionKind::Control {
            self.metrics.record_control_packet_sent();
        }
    }

    async fn handle_ping_tick(&mut self, kind: SessionKind) {
        let pkt = self.session_mut(kind).build_ping_request().to_vec();
        let _ = self.session_mut(kind).send_untracked(&pkt).await;
        self.session_mut(kind).advance_ping_seq();
    }

    async fn handle_idle_tick(&mut self, kind: SessionKind) {
        if !self.session_mut(kind).idle_due() {
            return;
        }
        let session = self.session_mut(kind);
        let keepalive = codec::build_control(codec::TYPE_NULL, 0, session.local_id, session.remote_id);
        let _ = session.send_untracked(&keepalive).await;
    }

    async fn handle_civ_watchdog(&mut self) {
        if civ_subsession::watchdog_should_reopen(self.civ_session.last_received_at.elapsed()) {
            let _ = self.civ_sub.send_open(&mut self.civ_session).await;
        }
    }

    // ── Inbound demux (§4.7) ────────────────────────────────────────────

    async fn handle_datagram(&mut self, kind: SessionKind, bytes: Vec<u8>) {
        self.session_mut(kind).record_received();
        if kind == SessionKind::Control {
            self.metrics.record_control_packet_received();
        }
        match bytes.len() {
            codec::HEADER_SIZE => self.handle_control_frame(kind, &bytes).await,
            codec::PING_SIZE => self.handle_ping_frame(kind, &bytes).await,
            codec::TOKEN_SIZE => self.handle_token_frame(&bytes).await,
            codec::STATUS_SIZE => self.handle_status_frame(&bytes).await,
            codec::LOGIN_RESPONSE_SIZE => self.handle_login_response_frame(&bytes).await,
            codec::CONN_INFO_SIZE => self.handle_conn_info_frame(&bytes).await,
            codec::CAPABILITIES_SIZE => self.handle_capabilities_frame(&bytes),
            codec::LOGIN_SIZE => {} // Login is client → radio only; unexpected inbound, ignore.
            _ => self.handle_other_frame(kind, bytes).await,
        }
    }

    async fn handle_control_frame(&mut self, kind: SessionKind, bytes: &[u8]) {
        let Some(header) = codec::parse_control(bytes) else {
            self.metrics.record_protocol_error();
            return;
        };
        match header.pkt_type {
            codec::TYPE_I_AM_HERE => self.handle_i_am_here(kind, header).await,
            codec::TYPE_READY => self.handle_i_am_ready(kind).await,
            codec::TYPE_RETRANSMIT => {
                self.metrics.record_retransmit_requested();
                let _ = self.session_mut(kind).retransmit(header.seq).await;
                self.metrics.record_retransmit_served();
            }
            codec::TYPE_DISCONNECT => self.handle_remote_disconnect(kind).await,
            _ => {}
        }
    }

    async fn handle_i_am_here(&mut self, kind: SessionKind, header: codec::ControlHeader) {
        self.session_mut(kind).remote_id = header.sent_id;
        match kind {
            SessionKind::Control => {
                let proceed = matches!(&self.connect_attempt, Some(a) if a.stage == ConnectStage::AwaitingIAmHere);
                if !proceed {
                    return;
                }
                self.control.stop_are_you_there();
                let ready = codec::build_control(codec::TYPE_READY, 0, self.control.local_id, self.control.remote_id);
                let _ = self.control.send_untracked(&ready).await;
                self.control.start_ping(self.tick_tx.clone());
                if let Some(attempt) = &mut self.connect_attempt {
                    attempt.stage = ConnectStage::AwaitingReady;
                }
            }
            SessionKind::Civ => {
                let proceed = matches!(&self.connect_attempt, Some(a) if a.civ_bringup == BringupStage::AwaitingAyt);
                if !proceed {
                    return;
                }
                self.civ_session.stop_are_you_there();
                let ready = codec::build_control(codec::TYPE_READY, 0, self.civ_session.local_id, self.civ_session.remote_id);
                let _ = self.civ_session.send_untracked(&ready).await;
                if let Some(attempt) = &mut self.connect_attempt {
                    attempt.civ_bringup = BringupStage::AwaitingReady;
                }
            }
            SessionKind::Audio => {
                let proceed = matches!(&self.connect_attempt, Some(a) if a.audio_bringup == BringupStage::AwaitingAyt);
                if !proceed {
                    return;
                }
                self.audio_session.stop_are_you_there();
                let ready = codec::build_control(codec::TYPE_READY, 0, self.audio_session.local_id, self.audio_session.remote_id);
                let _ = self.audio_session.send_untracked(&ready).await;
                if let Some(attempt) = &mut self.connect_attempt {
                    attempt.audio_bringup = BringupStage::AwaitingReady;
                }
            }
        }
    }

    async fn handle_i_am_ready(&mut self, kind: SessionKind) {
        match kind {
            SessionKind::Control => {
                let proceed = matches!(&self.connect_attempt, Some(a) if a.stage == ConnectStage::AwaitingReady);
                if !proceed {
                    return;
                }
                let inner_seq = self.control.next_inner_seq();
                let login = codec::build_login(
                    0,
                    self.control.local_id,
                    self.control.remote_id,
                    inner_seq,
                    &self.config.username,
                    &self.config.password,
                    &self.config.client_name,
                );
                let _ = self.control.send_tracked(login.to_vec()).await;
                self.control.start_idle(self.tick_tx.clone());
                if let Some(attempt) = &mut self.connect_attempt {
                    attempt.stage = ConnectStage::AwaitingLoginResponse;
                }
            }
            SessionKind::Civ => {
                let proceed = matches!(&self.connect_attempt, Some(a) if a.civ_bringup == BringupStage::AwaitingReady);
                if !proceed {
                    return;
                }
                if let Some(attempt) = &mut self.connect_attempt {
                    attempt.civ_bringup = BringupStage::Ready;
                }
                self.civ_session.start_ping(self.tick_tx.clone());
                self.civ_session.start_idle(self.tick_tx.clone());
                let _ = self.civ_sub.send_open(&mut self.civ_session).await;
                self.civ_sub.start_watchdog(self.watchdog_tx.clone());
                self.maybe_finish_subsession_bringup().await;
            }
            SessionKind::Audio => {
                let proceed = matches!(&self.connect_attempt, Some(a) if a.audio_bringup == BringupStage::AwaitingReady);
                if !proceed {
                    return;
                }
                if let Some(attempt) = &mut self.connect_attempt {
                    attempt.audio_bringup = BringupStage::Ready;
                }
                self.audio_session.start_ping(self.tick_tx.clone());
                self.audio_session.start_idle(self.tick_tx.clone());
                self.audio_sub.lock().unwrap().start(self.audio_session.local_id, self.audio_session.remote_id);
                self.maybe_finish_subsession_bringup().await;
            }
        }
    }

    async fn handle_remote_disconnect(&mut self, kind: SessionKind) {
        if kind != SessionKind::Control {
            return;
        }
        warn!("radio sent DISCONNECT on control session");
        match self.phase {
            Phase::Connected => {
                if RadioError::Busy.triggers_reconnect() {
                    self.begin_reconnect().await;
                }
            }
            Phase::Connecting | Phase::Reconnecting => self.fail_connect_attempt(RadioError::Busy).await,
            _ => {}
        }
    }

    async fn handle_ping_frame(&mut self, kind: SessionKind, bytes: &[u8]) {
        let Some(ping) = codec::parse_ping(bytes) else {
            self.metrics.record_protocol_error();
            return;
        };
        if ping.is_reply {
            self.session_mut(kind).advance_ping_seq();
            return;
        }
        let session = self.session_mut(kind);
        let reply = codec::build_ping(ping.header.seq, session.local_id, session.remote_id, true, ping.timestamp);
        let _ = session.send_untracked(&reply).await;
    }

    async fn handle_token_frame(&mut self, bytes: &[u8]) {
        let Some(token) = codec::parse_token(bytes) else {
            self.metrics.record_protocol_error();
            return;
        };
        if token.response == codec::TOKEN_RENEWAL_REJECTED {
            // The radio rejected our renewal, possibly reassigning our
            // identity in the process. Adopt whatever it sent before
            // re-answering ConnInfo, so the reply carries the IDs the
            // radio now expects rather than the stale pre-rejection ones.
            self.control.remote_id = token.header.sent_id;
            self.control.local_id = token.header.rcvd_id;
            let inner_seq = self.control.next_inner_seq();
            let civ_port = self.civ_session.endpoint().local_addr().port();
            let audio_port = self.audio_session.endpoint().local_addr().port();
            let reply = codec::build_conn_info_reply(
                0,
                self.control.local_id,
                self.control.remote_id,
                inner_seq,
                &self.last_rig_name,
                &self.config.username,
                civ_port,
                audio_port,
            );
            let _ = self.control.send_tracked(reply.to_vec()).await;
        }
    }

    async fn handle_status_frame(&mut self, bytes: &[u8]) {
        let Some(status) = codec::parse_status(bytes) else {
            self.metrics.record_protocol_error();
            return;
        };
        let _ = self.events_tx.send(RadioEvent::Status {
            civ_port: status.civ_port,
            audio_port: status.audio_port,
            auth_ok: status.error == 0,
            connected: status.connected,
        });

        match self.phase {
            Phase::Connecting | Phase::Reconnecting => {
                if !status.connected {
                    self.fail_connect_attempt(RadioError::Busy).await;
                    return;
                }
                if status.civ_port == 0 || status.audio_port == 0 {
                    return; // still bringing up; the event above is all the caller gets for now.
                }
                let should_program_ports = matches!(&self.connect_attempt, Some(a) if a.stage == ConnectStage::AwaitingStatus);
                if should_program_ports {
                    let civ_remote = SocketAddr::new(self.control_remote_addr.ip(), status.civ_port);
                    let audio_remote = SocketAddr::new(self.control_remote_addr.ip(), status.audio_port);
                    let _ = self.civ_session.endpoint().set_remote(civ_remote).await;
                    let _ = self.audio_session.endpoint().set_remote(audio_remote).await;
                    self.civ_session.start_are_you_there(self.tick_tx.clone());
                    self.audio_session.start_are_you_there(self.tick_tx.clone());
                    if let Some(attempt) = &mut self.connect_attempt {
                        attempt.stage = ConnectStage::BringingUpSubsessions;
                        attempt.subsession_deadline = Some(time::Instant::now() + Duration::from_millis(self.monitor.subsession_timeout_ms));
                    }
                }
            }
            Phase::Connected => {
                if !status.connected && RadioError::Busy.triggers_reconnect() {
                    self.begin_reconnect().await;
                }
            }
            _ => {}
        }
    }

    async fn handle_login_response_frame(&mut self, bytes: &[u8]) {
        let Some(resp) = codec::parse_login_response(bytes) else {
            self.metrics.record_protocol_error();
            return;
        };
        let _ = self.events_tx.send(RadioEvent::Login {
            ok: resp.is_success(),
            error_code: resp.error,
            connection_string: resp.connection_string.clone(),
        });

        let proceed = matches!(&self.connect_attempt, Some(a) if a.stage == ConnectStage::AwaitingLoginResponse);
        if !proceed {
            return;
        }
        if !resp.is_success() {
            self.fail_connect_attempt(RadioError::Auth { error_code: resp.error }).await;
            return;
        }
        self.control.rig_token = resp.token;
        let inner_seq = self.control.next_inner_seq();
        let confirm = codec::build_token_request(0, self.control.local_id, self.control.remote_id, inner_seq, codec::TOKEN_REQ_CONFIRM, resp.token);
        let _ = self.control.send_tracked(confirm.to_vec()).await;
        self.renewal_active = true;
        if let Some(attempt) = &mut self.connect_attempt {
            attempt.stage = ConnectStage::AwaitingConnInfo;
        }
    }

    async fn handle_conn_info_frame(&mut self, bytes: &[u8]) {
        let Some(info) = codec::parse_conn_info(bytes) else {
            self.metrics.record_protocol_error();
            return;
        };
        self.last_rig_name = info.rig_name.clone();
        let inner_seq = self.control.next_inner_seq();
        let civ_port = self.civ_session.endpoint().local_addr().port();
        let audio_port = self.audio_session.endpoint().local_addr().port();
        let reply = codec::build_conn_info_reply(
            0,
            self.control.local_id,
            self.control.remote_id,
            inner_seq,
            &info.rig_name,
            &self.config.username,
            civ_port,
            audio_port,
        );
        let _ = self.control.send_tracked(reply.to_vec()).await;

        if let Some(attempt) = &mut self.connect_attempt {
            if attempt.stage == ConnectStage::AwaitingConnInfo {
                attempt.stage = ConnectStage::AwaitingStatus;
            }
        }
    }

    fn handle_capabilities_frame(&mut self, bytes: &[u8]) {
        match codec::parse_capabilities(bytes) {
            Some(cap) => {
                self.civ_address = cap.civ_address;
                self.audio_name = cap.audio_name.clone();
                self.support_tx = cap.support_tx;
                let _ = self.events_tx.send(RadioEvent::Capabilities {
                    civ_address: cap.civ_address,
                    audio_name: cap.audio_name,
                    support_tx: cap.support_tx,
                });
            }
            None => self.metrics.record_protocol_error(),
        }
    }

    async fn handle_other_frame(&mut self, kind: SessionKind, bytes: Vec<u8>) {
        if let Some(civ) = codec::parse_civ(&bytes) {
            self.metrics.record_civ_packet_received();
            let _ = self.events_tx.send(RadioEvent::Civ { payload: civ.payload.clone() });
            for frame in self.reassembler.feed(&civ.payload) {
                self.metrics.record_civ_frame_reassembled();
                let _ = self.events_tx.send(RadioEvent::CivFrame { frame });
            }
            return;
        }
        if let Some(audio) = codec::parse_audio(&bytes) {
            self.metrics.record_audio_frame_received();
            let pcm16 = bytes_to_i16_le(&audio.payload);
            let _ = self.events_tx.send(RadioEvent::Audio { pcm16 });
            return;
        }
        if let Some(range) = codec::parse_retransmit_range(&bytes) {
            for seq in range.seqs {
                self.metrics.record_retransmit_requested();
                let _ = self.session_mut(kind).retransmit(seq).await;
                self.metrics.record_retransmit_served();
            }
            return;
        }
        self.metrics.record_protocol_error();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn backoff_delay_doubles_until_capped() {
        let base = Duration::from_millis(2000);
        let max = Duration::from_millis(30_000);
        assert_eq!(backoff_delay(1, base, max), Duration::from_millis(2000));
        assert_eq!(backoff_delay(2, base, max), Duration::from_millis(4000));
        assert_eq!(backoff_delay(3, base, max), Duration::from_millis(8000));
        assert_eq!(backoff_delay(10, base, max), max);
    }

    #[test]
    fn bytes_to_i16_le_round_trips() {
        let samples: [i16; 3] = [1, -2, 32000];
        let mut bytes = Vec::new();
        for s in samples {
            bytes.extend_from_slice(&s.to_le_bytes());
        }
        assert_eq!(bytes_to_i16_le(&bytes), samples.to_vec());
    }

    #[tokio::test]
    async fn connect_then_disconnect_returns_to_idle() {
        // A radio that never answers: connect() should time out rather than
        // hang, and disconnect() on an idle controller must be a no-op.
        let server = tokio::net::UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let addr = server.local_addr().unwrap();
        let config = RadioConfig::builder()
            .host(addr.ip().to_string())
            .port(addr.port())
            .username("tester".into())
            .password("secret".into())
            .connect_timeout_ms(200)
            .build();
        let controller = Controller::new(config).await.unwrap();
        assert_eq!(controller.phase(), Phase::Idle);
        controller.disconnect(None, false).await;
        assert_eq!(controller.phase(), Phase::Idle);

        let result = controller.connect().await;
        assert!(result.is_err());
        assert_eq!(controller.phase(), Phase::Idle);
    }

    #[tokio::test]
    async fn silent_disconnect_settles_state_without_broadcasting_it() {
        let server = tokio::net::UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let addr = server.local_addr().unwrap();
        let config = RadioConfig::builder()
            .host(addr.ip().to_string())
            .port(addr.port())
            .username("tester".into())
            .password("secret".into())
            .connect_timeout_ms(100_000)
            .build();
        let controller = Arc::new(Controller::new(config).await.unwrap());
        let mut events = controller.events();

        // Kick off a connect attempt that the (silent) radio above will
        // never answer, so there's an in-flight waiter and Connecting state
        // for the silent disconnect below to settle out from under it.
        let waiter = {
            let controller = controller.clone();
            tokio::spawn(async move { controller.connect().await })
        };
        while controller.phase() != Phase::Connecting {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }

        controller.disconnect(Some("shutting down".into()), true).await;
        assert_eq!(controller.phase(), Phase::Idle);
        assert!(waiter.await.unwrap().is_err(), "the aborted connect() should still resolve, just with an error");

        let mut saw_phase_changed = false;
        let mut saw_error_event = false;
        while let Ok(Ok(event)) = tokio::time::timeout(Duration::from_millis(100), events.recv()).await {
            match event {
                RadioEvent::PhaseChanged { .. } => saw_phase_changed = true,
                RadioEvent::Error { .. } => saw_error_event = true,
                _ => {}
            }
        }
        assert!(!saw_phase_changed, "silent disconnect must not broadcast PhaseChanged");
        assert!(!saw_error_event, "silent disconnect must not broadcast its reason");
    }
}
