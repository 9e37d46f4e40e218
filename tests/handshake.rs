//! Loopback mock-radio integration tests.
//!
//! Each test plays the radio side of the real wire format against a live
//! `Controller`, using only the crate's public API on the client side.
//! Packet layouts here intentionally duplicate (rather than import) the
//! private codec, since a real radio implementation is exactly this kind
//! of external, independent encoder.

use std::time::Duration;

use tokio::net::UdpSocket;
use tokio::time::timeout;

use icom_wlan_rs::{MonitorConfig, Phase, RadioConfig, RadioEvent};

const TYPE_NULL: u8 = 0x00;
const TYPE_ARE_YOU_THERE: u8 = 0x03;
const TYPE_I_AM_HERE: u8 = 0x04;
const TYPE_READY: u8 = 0x06;

fn put_u16_le(buf: &mut [u8], off: usize, v: u16) {
    buf[off..off + 2].copy_from_slice(&v.to_le_bytes());
}
fn put_u32_le(buf: &mut [u8], off: usize, v: u32) {
    buf[off..off + 4].copy_from_slice(&v.to_le_bytes());
}
fn put_u16_be(buf: &mut [u8], off: usize, v: u16) {
    buf[off..off + 2].copy_from_slice(&v.to_be_bytes());
}
fn put_u32_be(buf: &mut [u8], off: usize, v: u32) {
    buf[off..off + 4].copy_from_slice(&v.to_be_bytes());
}
fn get_u32_le(buf: &[u8], off: usize) -> u32 {
    u32::from_le_bytes([buf[off], buf[off + 1], buf[off + 2], buf[off + 3]])
}

fn write_ascii(buf: &mut [u8], off: usize, len: usize, s: &str) {
    let bytes = s.as_bytes();
    let n = bytes.len().min(len);
    buf[off..off + n].copy_from_slice(&bytes[..n]);
}

fn header(len: usize, pkt_type: u8, seq: u16, sent_id: u32, rcvd_id: u32) -> Vec<u8> {
    let mut buf = vec![0u8; len];
    put_u32_le(&mut buf, 0x00, len as u32);
    put_u16_le(&mut buf, 0x04, pkt_type as u16);
    put_u16_le(&mut buf, 0x06, seq);
    put_u32_le(&mut buf, 0x08, sent_id);
    put_u32_le(&mut buf, 0x0c, rcvd_id);
    buf
}

fn control(pkt_type: u8, sent_id: u32, rcvd_id: u32) -> Vec<u8> {
    header(16, pkt_type, 0, sent_id, rcvd_id)
}

fn login_response(sent_id: u32, rcvd_id: u32, token: u32, error: u32, connection_string: &str) -> Vec<u8> {
    let mut buf = header(96, TYPE_NULL, 0, sent_id, rcvd_id);
    put_u32_be(&mut buf, 0x1c, token);
    put_u32_be(&mut buf, 0x30, error);
    write_ascii(&mut buf, 0x40, 16, connection_string);
    buf
}

fn conn_info_from_radio(sent_id: u32, rcvd_id: u32, rig_name: &str) -> Vec<u8> {
    let mut buf = header(144, TYPE_NULL, 0, sent_id, rcvd_id);
    write_ascii(&mut buf, 0x40, 32, rig_name);
    buf[0x60] = 0; // not busy
    buf
}

fn status(sent_id: u32, rcvd_id: u32, error: u32, connected: bool, civ_port: u16, audio_port: u16) -> Vec<u8> {
    let mut buf = header(80, TYPE_NULL, 0, sent_id, rcvd_id);
    put_u32_le(&mut buf, 0x30, error);
    buf[0x40] = if connected { 0 } else { 1 };
    put_u16_be(&mut buf, 0x42, civ_port);
    put_u16_be(&mut buf, 0x46, audio_port);
    buf
}

fn civ_frame(sent_id: u32, rcvd_id: u32, civ_seq: u16, payload: &[u8]) -> Vec<u8> {
    let mut buf = header(0x15 + payload.len(), TYPE_NULL, 0, sent_id, rcvd_id);
    buf[0x10] = 0xc1;
    put_u16_le(&mut buf, 0x11, payload.len() as u16);
    put_u16_be(&mut buf, 0x13, civ_seq);
    buf[0x15..].copy_from_slice(payload);
    buf
}

fn audio_frame(sent_id: u32, rcvd_id: u32, send_seq: u16, payload: &[u8]) -> Vec<u8> {
    let mut buf = header(0x18 + payload.len(), TYPE_NULL, 0, sent_id, rcvd_id);
    if payload.len() == 160 {
        buf[0x10] = 0x97;
        buf[0x11] = 0x81;
    } else {
        buf[0x10] = 0x00;
        buf[0x11] = 0x80;
    }
    put_u16_be(&mut buf, 0x12, send_seq);
    put_u16_be(&mut buf, 0x16, payload.len() as u16);
    buf[0x18..].copy_from_slice(payload);
    buf
}

/// One side of the AYT -> I_AM_HERE -> ARE_YOU_READY -> I_AM_READY dance
/// shared by the control session and both sub-sessions. Returns the
/// client's local id (learned from its AYT) and the peer address it's
/// talking to.
async fn bring_up_session(sock: &UdpSocket, radio_id: u32) -> (u32, std::net::SocketAddr) {
    let mut buf = [0u8; 2048];
    let (n, peer) = sock.recv_from(&mut buf).await.unwrap();
    assert_eq!(n, 16);
    assert_eq!(buf[0x04], TYPE_ARE_YOU_THERE);
    let client_id = get_u32_le(&buf, 0x08);

    sock.send_to(&control(TYPE_I_AM_HERE, radio_id, client_id), peer).await.unwrap();

    let (n, _) = sock.recv_from(&mut buf).await.unwrap();
    assert_eq!(n, 16);
    assert_eq!(buf[0x04], TYPE_READY);

    sock.send_to(&control(TYPE_READY, radio_id, client_id), peer).await.unwrap();
    (client_id, peer)
}

async fn run_control_handshake(
    control_sock: UdpSocket,
    radio_id: u32,
    rig_name: &'static str,
    login_error: u32,
    civ_port: u16,
    audio_port: u16,
    send_zero_ports_first: bool,
) {
    let (client_id, peer) = bring_up_session(&control_sock, radio_id).await;

    let mut buf = [0u8; 2048];
    let (n, _) = control_sock.recv_from(&mut buf).await.unwrap();
    assert_eq!(n, 128, "expected Login packet");

    control_sock
        .send_to(&login_response(radio_id, client_id, 0xAABBCCDD, login_error, "OK"), peer)
        .await
        .unwrap();
    if login_error != 0 {
        return;
    }

    // TokenConfirm, sent tracked.
    let (n, _) = control_sock.recv_from(&mut buf).await.unwrap();
    assert_eq!(n, 64, "expected TokenConfirm");

    control_sock.send_to(&conn_info_from_radio(radio_id, client_id, rig_name), peer).await.unwrap();
    let (n, _) = control_sock.recv_from(&mut buf).await.unwrap();
    assert_eq!(n, 144, "expected ConnInfo reply");

    if send_zero_ports_first {
        control_sock.send_to(&status(radio_id, client_id, 0, true, 0, 0), peer).await.unwrap();
    }
    control_sock
        .send_to(&status(radio_id, client_id, 0, true, civ_port, audio_port), peer)
        .await
        .unwrap();

    // Keep answering idle/ping traffic so the session doesn't look dead.
    loop {
        let Ok((n, from)) = control_sock.recv_from(&mut buf).await else { break };
        if n == 21 && buf[0x04] == 0x07 && buf[0x10] == 0 {
            let mut reply = buf[..21].to_vec();
            reply[0x10] = 1;
            let _ = control_sock.send_to(&reply, from).await;
        }
    }
}

async fn run_subsession_bringup(
    sock: std::sync::Arc<UdpSocket>,
    radio_id: u32,
    ready_tx: tokio::sync::oneshot::Sender<(u32, std::net::SocketAddr)>,
) {
    let (client_id, peer) = bring_up_session(&sock, radio_id).await;
    let _ = ready_tx.send((client_id, peer));
    let mut buf = [0u8; 2048];
    loop {
        let Ok((_n, _from)) = sock.recv_from(&mut buf).await else { break };
    }
}

struct MockRadio {
    control_addr: std::net::SocketAddr,
    civ_port: u16,
    audio_port: u16,
    civ_sock: std::sync::Arc<UdpSocket>,
    audio_sock: std::sync::Arc<UdpSocket>,
    civ_ready: tokio::sync::oneshot::Receiver<(u32, std::net::SocketAddr)>,
    audio_ready: tokio::sync::oneshot::Receiver<(u32, std::net::SocketAddr)>,
    handles: Vec<tokio::task::JoinHandle<()>>,
}

impl MockRadio {
    /// Waits for the CI-V sub-session handshake to finish, then sends one
    /// raw CI-V frame from the mock radio's side.
    async fn send_civ_frame(&mut self, civ_seq: u16, payload: &[u8]) {
        let (client_id, peer) = (&mut self.civ_ready).await.unwrap();
        let radio_id: u32 = 0x5EED_0001;
        self.civ_sock.send_to(&civ_frame(radio_id, client_id, civ_seq, payload), peer).await.unwrap();
    }

    /// Waits for the Audio sub-session handshake to finish, then sends one
    /// raw audio frame from the mock radio's side.
    async fn send_audio_frame(&mut self, send_seq: u16, payload: &[u8]) {
        let (client_id, peer) = (&mut self.audio_ready).await.unwrap();
        let radio_id: u32 = 0x5EED_0001;
        self.audio_sock.send_to(&audio_frame(radio_id, client_id, send_seq, payload), peer).await.unwrap();
    }
}

async fn spawn_mock_radio(rig_name: &'static str, login_error: u32, send_zero_ports_first: bool) -> MockRadio {
    let control_sock = UdpSocket::bind("127.0.0.1:0").await.unwrap();
    let civ_sock = std::sync::Arc::new(UdpSocket::bind("127.0.0.1:0").await.unwrap());
    let audio_sock = std::sync::Arc::new(UdpSocket::bind("127.0.0.1:0").await.unwrap());

    let control_addr = control_sock.local_addr().unwrap();
    let civ_port = civ_sock.local_addr().unwrap().port();
    let audio_port = audio_sock.local_addr().unwrap().port();
    let radio_id: u32 = 0x5EED_0001;

    let (civ_tx, civ_ready) = tokio::sync::oneshot::channel();
    let (audio_tx, audio_ready) = tokio::sync::oneshot::channel();

    let mut handles = Vec::new();
    handles.push(tokio::spawn(async move {
        run_control_handshake(control_sock, radio_id, rig_name, login_error, civ_port, audio_port, send_zero_ports_first).await;
    }));
    if login_error == 0 {
        handles.push(tokio::spawn(run_subsession_bringup(civ_sock.clone(), radio_id, civ_tx)));
        handles.push(tokio::spawn(run_subsession_bringup(audio_sock.clone(), radio_id, audio_tx)));
    }

    MockRadio { control_addr, civ_port, audio_port, civ_sock, audio_sock, civ_ready, audio_ready, handles }
}

impl Drop for MockRadio {
    fn drop(&mut self) {
        for h in &self.handles {
            h.abort();
        }
    }
}

fn test_config(control_addr: std::net::SocketAddr) -> RadioConfig {
    RadioConfig::builder()
        .host(control_addr.ip().to_string())
        .port(control_addr.port())
        .bind_host("127.0.0.1".to_string())
        .username("tester".to_string())
        .password("secret".to_string())
        .connect_timeout_ms(5_000)
        .subsession_timeout_ms(5_000)
        .build()
}

#[tokio::test]
async fn full_handshake_reaches_connected() {
    let radio = spawn_mock_radio("IC-705", 0, true).await;
    let controller = icom_wlan_rs::Controller::new(test_config(radio.control_addr)).await.unwrap();

    let mut events = controller.events();
    controller.connect().await.expect("handshake should succeed");
    assert_eq!(controller.phase(), Phase::Connected);

    let mut saw_status_with_ports = false;
    while let Ok(Ok(event)) = timeout(Duration::from_millis(200), events.recv()).await {
        if let RadioEvent::Status { civ_port, audio_port, connected, .. } = event {
            if civ_port == radio.civ_port && audio_port == radio.audio_port && connected {
                saw_status_with_ports = true;
            }
        }
    }
    assert!(saw_status_with_ports, "client should have observed the Status carrying real ports (S3/S4)");

    controller.disconnect(None, false).await;
    assert_eq!(controller.phase(), Phase::Idle);
}

#[tokio::test]
async fn civ_and_audio_frames_are_delivered_as_events() {
    let mut radio = spawn_mock_radio("IC-705", 0, false).await;
    let controller = icom_wlan_rs::Controller::new(test_config(radio.control_addr)).await.unwrap();
    let mut events = controller.events();

    controller.connect().await.expect("handshake should succeed");

    // S6: two CI-V frames split across separate inbound packets, a short
    // one followed by one with an extra leading noise byte.
    radio.send_civ_frame(0, &[0xfe, 0xfe, 0xe0, 0xa4, 0x03, 0xfd]).await;
    // S5: a 160-byte audio payload, which build_audio encodes with the
    // "short frame" identity bytes.
    radio.send_audio_frame(0, &[0x11u8; 160]).await;

    let mut saw_civ_frame = false;
    let mut saw_audio = false;
    let deadline = tokio::time::Instant::now() + Duration::from_secs(2);
    while tokio::time::Instant::now() < deadline && !(saw_civ_frame && saw_audio) {
        let Ok(Ok(event)) = timeout(Duration::from_millis(200), events.recv()).await else { continue };
        match event {
            RadioEvent::CivFrame { frame } => {
                assert_eq!(frame, vec![0xfe, 0xfe, 0xe0, 0xa4, 0x03, 0xfd]);
                saw_civ_frame = true;
            }
            RadioEvent::Audio { pcm16 } => {
                assert_eq!(pcm16.len(), 80);
                saw_audio = true;
            }
            _ => {}
        }
    }
    assert!(saw_civ_frame, "expected a reassembled CI-V frame event");
    assert!(saw_audio, "expected a decoded audio frame event");

    controller.disconnect(None, false).await;
}

#[tokio::test]
async fn login_rejection_surfaces_auth_error_and_stays_idle() {
    let radio = spawn_mock_radio("IC-705", 0x0000_0001, false).await;
    let controller = icom_wlan_rs::Controller::new(test_config(radio.control_addr)).await.unwrap();

    let mut events = controller.events();
    let result = controller.connect().await;
    assert!(result.is_err(), "login error must reject connect()");

    let mut saw_login_failure = false;
    while let Ok(Ok(event)) = timeout(Duration::from_millis(200), events.recv()).await {
        if let RadioEvent::Login { ok: false, error_code: 1, .. } = event {
            saw_login_failure = true;
        }
    }
    assert!(saw_login_failure);
    assert_eq!(controller.phase(), Phase::Idle);
}

#[tokio::test]
async fn civ_send_is_rejected_before_connect() {
    let radio = spawn_mock_radio("IC-705", 0, false).await;
    let controller = icom_wlan_rs::Controller::new(test_config(radio.control_addr)).await.unwrap();
    let result = controller.send_civ(vec![0xfe, 0xfe, 0xe0, 0xa4, 0x03, 0xfd]).await;
    assert!(result.is_err());
}

#[tokio::test]
async fn silence_triggers_reconnect_attempts_then_gives_up() {
    // S7: once the radio goes silent, the health monitor must declare the
    // connection lost and the reconnect driver must try (and, capped at one
    // attempt here, give up) rather than leaving the controller stuck in
    // `Reconnecting` forever.
    let radio = spawn_mock_radio("IC-705", 0, true).await;
    let controller = icom_wlan_rs::Controller::new(test_config(radio.control_addr)).await.unwrap();
    let mut events = controller.events();

    controller.connect().await.expect("handshake should succeed");
    assert_eq!(controller.phase(), Phase::Connected);

    controller
        .configure_monitor(MonitorConfig {
            check_interval: Duration::from_millis(50),
            session_timeout_ms: 200,
            auto_reconnect: true,
            max_reconnect_attempts: Some(1),
            reconnect_base_delay_ms: 50,
            reconnect_max_delay_ms: 50,
            connect_timeout_ms: 300,
            subsession_timeout_ms: 300,
        })
        .await;

    // Kill the mock radio outright: no more AYT/ping/status replies at all.
    drop(radio);

    // The reconnect driver waits out a fixed settle period between tearing
    // the old session down and dialing the new one, on top of the backoff
    // delay and connect timeout configured above — give it enough room.
    let mut saw_connection_lost = false;
    let mut saw_reconnect_attempting = false;
    let mut saw_reconnect_failed_final = false;
    let deadline = tokio::time::Instant::now() + Duration::from_secs(9);
    while tokio::time::Instant::now() < deadline && !saw_reconnect_failed_final {
        let Ok(Ok(event)) = timeout(Duration::from_millis(200), events.recv()).await else { continue };
        match event {
            RadioEvent::ConnectionLost { .. } => saw_connection_lost = true,
            RadioEvent::ReconnectAttempting { attempt, .. } if attempt == 1 => saw_reconnect_attempting = true,
            RadioEvent::ReconnectFailed { will_retry: false, .. } => saw_reconnect_failed_final = true,
            _ => {}
        }
    }
    assert!(saw_connection_lost, "health monitor should report the silent session as lost");
    assert!(saw_reconnect_attempting, "reconnect driver should announce its first attempt");
    assert!(saw_reconnect_failed_final, "reconnect driver should give up once max_reconnect_attempts is exhausted");

    let idle_deadline = tokio::time::Instant::now() + Duration::from_secs(2);
    while tokio::time::Instant::now() < idle_deadline && controller.phase() != Phase::Idle {
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    assert_eq!(controller.phase(), Phase::Idle, "giving up on reconnect must return the controller to Idle");
}

#[tokio::test]
async fn audio_enqueue_before_connect_does_not_panic() {
    let radio = spawn_mock_radio("IC-705", 0, false).await;
    let controller = icom_wlan_rs::Controller::new(test_config(radio.control_addr)).await.unwrap();
    // Enqueueing is a lock-only operation independent of connection phase;
    // it must not block or panic even with nothing consuming the queue yet.
    controller.enqueue_audio_pcm16(&[1, 2, 3, 4], true);
    controller.enqueue_trailing_silence();
}
