//! Drift-compensated 50 Hz transmit-audio scheduler (§4.5).
//!
//! Ideal send times are computed from a fixed `t0`, never from cumulative
//! per-frame increments, so scheduler jitter cannot accumulate across a
//! long-running connection.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex};

use tokio::task::JoinHandle;
use tokio::time::{self, Duration};

use crate::codec::build_audio;
use crate::metrics::Metrics;
use crate::udp_endpoint::UdpEndpoint;

pub const FRAME_SAMPLES: usize = 240;
pub const FRAME_BYTES: usize = FRAME_SAMPLES * 2;
pub const FRAME_DURATION: Duration = Duration::from_millis(20);
pub const SAMPLE_RATE_HZ: u32 = 12_000;
pub const LEADING_SILENCE_FRAMES: usize = 3;
pub const TRAILING_SILENCE_FRAMES: usize = 5;

/// How far ahead of the ideal instant the coarse sleep stops, handing off
/// to a cooperative `yield_now` spin for the last stretch.
const SPIN_MARGIN: Duration = Duration::from_millis(1);

pub type Frame = [i16; FRAME_SAMPLES];

fn silence_frame() -> Frame {
    [0i16; FRAME_SAMPLES]
}

fn frame_to_bytes(frame: &Frame) -> Vec<u8> {
    let mut out = Vec::with_capacity(FRAME_BYTES);
    for sample in frame {
        out.extend_from_slice(&sample.to_le_bytes());
    }
    out
}

fn scale_sample(s: f32, volume: f32) -> i16 {
    let clipped = s.clamp(-1.0, 1.0);
    let scaled = (clipped as f64 * volume as f64 * 32767.0).round();
    scaled.clamp(i16::MIN as f64, i16::MAX as f64) as i16
}

pub struct AudioSubsession {
    endpoint: Arc<UdpEndpoint>,
    queue: Arc<Mutex<VecDeque<Frame>>>,
    volume: f32,
    metrics: Arc<Metrics>,
    scheduler_handle: Option<JoinHandle<()>>,
}

impl AudioSubsession {
    pub fn new(endpoint: Arc<UdpEndpoint>, volume: f32, metrics: Arc<Metrics>) -> Self {
        AudioSubsession { endpoint, queue: Arc::new(Mutex::new(VecDeque::new())), volume, metrics, scheduler_handle: None }
    }

    /// Start the 50 Hz send loop. `local_id`/`remote_id` are captured for
    /// the lifetime of the scheduler task; a reconnect calls `stop()` and
    /// `start()` again with fresh identity.
    pub fn start(&mut self, local_id: u32, remote_id: u32) {
        self.stop();
        let endpoint = self.endpoint.clone();
        let queue = self.queue.clone();
        let metrics = self.metrics.clone();
        self.scheduler_handle = Some(tokio::spawn(run_scheduler(endpoint, queue, metrics, local_id, remote_id)));
    }

    /// Halt the scheduler and drop any queued frames. Only called on full
    /// disconnect — unkeying PTT only enqueues trailing silence.
    pub fn stop(&mut self) {
        if let Some(h) = self.scheduler_handle.take() {
            h.abort();
        }
        self.queue.lock().unwrap().clear();
    }

    pub fn enqueue_pcm16(&self, samples: &[i16], leading_silence: bool) {
        let mut q = self.queue.lock().unwrap();
        if leading_silence {
            for _ in 0..LEADING_SILENCE_FRAMES {
                q.push_back(silence_frame());
            }
        }
        for chunk in samples.chunks(FRAME_SAMPLES) {
            let mut frame = silence_frame();
            frame[..chunk.len()].copy_from_slice(chunk);
            q.push_back(frame);
        }
    }

    pub fn enqueue_float32(&self, samples: &[f32], leading_silence: bool) {
        let scaled: Vec<i16> = samples.iter().map(|s| scale_sample(*s, self.volume)).collect();
        self.enqueue_pcm16(&scaled, leading_silence);
    }

    pub fn enqueue_trailing_silence(&self) {
        let mut q = self.queue.lock().unwrap();
        for _ in 0..TRAILING_SILENCE_FRAMES {
            q.push_back(silence_frame());
        }
    }

    pub fn queue_len(&self) -> usize {
        self.queue.lock().unwrap().len()
    }
}

impl Drop for AudioSubsession {
    fn drop(&mut self) {
        self.stop();
    }
}

async fn run_scheduler(
    endpoint: Arc<UdpEndpoint>,
    queue: Arc<Mutex<VecDeque<Frame>>>,
    metrics: Arc<Metrics>,
    local_id: u32,
    remote_id: u32,
) {
    let t0 = time::Instant::now();
    let mut next_frame_index: u32 = 0;
    let mut send_seq: u16 = 0;
    loop {
        let ideal = t0 + FRAME_DURATION * (next_frame_index + 1);
        let now = time::Instant::now();
        if ideal > now + SPIN_MARGIN {
            time::sleep_until(ideal - SPIN_MARGIN).await;
        }
        while time::Instant::now() < ideal {
            tokio::task::yield_now().await;
        }

        let queued = queue.lock().unwrap().pop_front();
        let frame = queued.unwrap_or_else(silence_frame);
        let bytes = frame_to_bytes(&frame);
        let packet = build_audio(0, local_id, remote_id, send_seq, &bytes);
        send_seq = send_seq.wrapping_add(1);
        let _ = endpoint.send(&packet).await;
        if queued.is_some() {
            metrics.record_audio_frame_sent();
        } else {
            metrics.record_audio_silence_frame_sent();
        }
        next_frame_index = next_frame_index.wrapping_add(1);
    }
}
