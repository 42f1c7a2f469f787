//! Opaque media stage.
//!
//! On the receive side: depayload -> raw parse (f32le interleaved at
//! the configured rate/channels) -> audio backend. On the send side:
//! audio backend -> format filter -> payload. The stage exposes a
//! single attachment point (`sink` when receiving, `src` when
//! sending) and a coarse activation state; everything else is
//! internal.

use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use bytes::Bytes;
use log::{debug, info};
use parking_lot::Mutex;
use ringbuf::{
    traits::{Consumer, Producer, Split},
    HeapCons, HeapProd, HeapRb,
};
use tokio::task::JoinHandle;

use crate::config::Config;
use crate::error::ConstructionError;
use crate::pad::Pad;
use crate::payload::PRIMARY_PT;

/// Fixed RTP header length used by the opaque payloader. CSRC lists
/// and header extensions are never produced on this link.
const RTP_HEADER_LEN: usize = 12;

/// Timestamp advance per 10 ms capture tick at the 90 kHz payload
/// clock.
const TICK_TS_ADVANCE: u32 = 900;

/// Activation state of the stage.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StageState {
    /// Built and configured, no data flowing yet
    Idle,
    /// Actively consuming or producing data
    Playing,
    /// Producer went away; configuration retained, resumes on relink
    Paused,
}

/// Audio sample format negotiated with the backend.
#[derive(Debug, Clone)]
pub struct AudioFormat {
    /// Samples per second
    pub sample_rate: u32,
    /// Interleaved channel count
    pub channels: u16,
    /// Client identity announced to the audio system
    pub client_name: Option<String>,
}

/// Opaque audio device seam. Samples are f32le interleaved.
pub trait AudioBackend: Send {
    /// Open the device for the given format.
    fn open(&mut self, format: &AudioFormat) -> Result<(), String>;

    /// Play out decoded samples (receive role).
    fn write(&mut self, samples: &[f32]);

    /// Capture samples into `buf`, returning how many were read
    /// (send role).
    fn read(&mut self, buf: &mut [f32]) -> usize;

    /// Release the device.
    fn close(&mut self) {}
}

/// In-process backend backed by a lock-free ring buffer. Written
/// samples can be read back out, which is enough for the bundled
/// binary and for tests; real device backends plug in through the
/// same trait.
pub struct LoopbackBackend {
    producer: HeapProd<f32>,
    consumer: HeapCons<f32>,
}

impl LoopbackBackend {
    /// Create a loopback backend holding up to `capacity` samples.
    pub fn new(capacity: usize) -> Self {
        let rb = HeapRb::<f32>::new(capacity);
        let (producer, consumer) = rb.split();
        Self { producer, consumer }
    }
}

impl Default for LoopbackBackend {
    fn default() -> Self {
        // One second of stereo at 48 kHz.
        Self::new(48000 * 2)
    }
}

impl AudioBackend for LoopbackBackend {
    fn open(&mut self, format: &AudioFormat) -> Result<(), String> {
        debug!(
            "loopback backend open: {} Hz, {} channels, client {:?}",
            format.sample_rate, format.channels, format.client_name
        );
        Ok(())
    }

    fn write(&mut self, samples: &[f32]) {
        // Overflow drops the tail; the loopback consumer is best
        // effort.
        self.producer.push_slice(samples);
    }

    fn read(&mut self, buf: &mut [f32]) -> usize {
        self.consumer.pop_slice(buf)
    }
}

struct StageInner {
    /// Shared with the sink chain closure, which gates consumption
    /// on it.
    state: Arc<Mutex<StageState>>,
    sink: Option<Pad>,
    src: Option<Pad>,
    backend: Arc<Mutex<Box<dyn AudioBackend>>>,
    format: AudioFormat,
    capture: Mutex<Option<JoinHandle<()>>>,
}

/// The media stage handle. Cheap to clone; clones share the stage.
#[derive(Clone)]
pub struct MediaStage {
    inner: Arc<StageInner>,
}

impl std::fmt::Debug for MediaStage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MediaStage").finish_non_exhaustive()
    }
}

impl MediaStage {
    /// Build the receive chain: depayload -> raw parse -> backend.
    ///
    /// The returned stage is `Idle` and owns one `sink` pad; it
    /// starts consuming once a producer is linked and the stage is
    /// set `Playing`.
    pub fn receive(
        config: &Config,
        mut backend: Box<dyn AudioBackend>,
    ) -> Result<Self, ConstructionError> {
        let format = Self::format_of(config);
        backend
            .open(&format)
            .map_err(|e| ConstructionError::new("audio_sink", e))?;

        let state = Arc::new(Mutex::new(StageState::Idle));
        let backend = Arc::new(Mutex::new(backend));

        let chain_state = state.clone();
        let chain_backend = backend.clone();
        let sink = Pad::with_chain("sink", move |buf: Bytes| {
            if *chain_state.lock() != StageState::Playing {
                return;
            }
            let Some(payload) = depayload(&buf) else {
                debug!("dropping malformed data unit ({} bytes)", buf.len());
                return;
            };
            let samples = parse_f32le(payload);
            chain_backend.lock().write(&samples);
        });

        Ok(Self {
            inner: Arc::new(StageInner {
                state,
                sink: Some(sink),
                src: None,
                backend,
                format,
                capture: Mutex::new(None),
            }),
        })
    }

    /// Build the send chain: backend -> format filter -> payload.
    ///
    /// The returned stage is `Idle` and owns one `src` pad; capture
    /// starts when the stage is set `Playing`.
    pub fn send(
        config: &Config,
        mut backend: Box<dyn AudioBackend>,
    ) -> Result<Self, ConstructionError> {
        let format = Self::format_of(config);
        backend
            .open(&format)
            .map_err(|e| ConstructionError::new("audio_src", e))?;

        Ok(Self {
            inner: Arc::new(StageInner {
                state: Arc::new(Mutex::new(StageState::Idle)),
                sink: None,
                src: Some(Pad::new_src("src")),
                backend: Arc::new(Mutex::new(backend)),
                format,
                capture: Mutex::new(None),
            }),
        })
    }

    fn format_of(config: &Config) -> AudioFormat {
        AudioFormat {
            sample_rate: config.bitrate,
            channels: config.channels,
            client_name: config.client_name.clone(),
        }
    }

    /// Current activation state.
    pub fn state(&self) -> StageState {
        *self.inner.state.lock()
    }

    /// The inbound attachment point (receive role).
    pub fn sink_pad(&self) -> Option<Pad> {
        self.inner.sink.clone()
    }

    /// The outbound attachment point (send role).
    pub fn src_pad(&self) -> Option<Pad> {
        self.inner.src.clone()
    }

    /// Transition the stage. Pausing retains the configuration; a
    /// later `Playing` transition resumes where construction left
    /// off.
    pub fn set_state(&self, next: StageState) {
        {
            let mut state = self.inner.state.lock();
            if *state == next {
                return;
            }
            info!("media stage: {:?} -> {:?}", *state, next);
            *state = next;
        }
        if self.inner.src.is_some() {
            match next {
                StageState::Playing => self.start_capture(),
                StageState::Idle | StageState::Paused => self.stop_capture(),
            }
        }
    }

    /// Stop data flow and release the backend. Idempotent.
    pub fn teardown(&self) {
        self.set_state(StageState::Idle);
        self.stop_capture();
        self.inner.backend.lock().close();
    }

    fn start_capture(&self) {
        let mut capture = self.inner.capture.lock();
        if capture.is_some() {
            return;
        }
        let Some(src) = self.inner.src.clone() else {
            return;
        };
        let inner = self.inner.clone();
        let samples_per_tick =
            (inner.format.sample_rate / 100) as usize * inner.format.channels as usize;
        *capture = Some(tokio::spawn(async move {
            let mut interval = tokio::time::interval(Duration::from_millis(10));
            let mut frame = vec![0f32; samples_per_tick.max(1)];
            let mut seq: u16 = 0;
            let mut ts: u32 = 0;
            let ssrc = derive_ssrc();
            loop {
                interval.tick().await;
                if *inner.state.lock() != StageState::Playing {
                    break;
                }
                let n = inner.backend.lock().read(&mut frame);
                if n == 0 {
                    continue;
                }
                src.push(payloadize(seq, ts, ssrc, &frame[..n]));
                seq = seq.wrapping_add(1);
                ts = ts.wrapping_add(TICK_TS_ADVANCE);
            }
        }));
    }

    fn stop_capture(&self) {
        if let Some(task) = self.inner.capture.lock().take() {
            task.abort();
        }
    }
}

fn derive_ssrc() -> u32 {
    let nanos = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.subsec_nanos())
        .unwrap_or(0);
    nanos ^ std::process::id()
}

/// Frame captured samples into one opaque payload unit.
fn payloadize(seq: u16, ts: u32, ssrc: u32, samples: &[f32]) -> Bytes {
    let mut buf = Vec::with_capacity(RTP_HEADER_LEN + samples.len() * 4);
    buf.push(0x80); // version 2, no padding, no extension, no CSRC
    buf.push(PRIMARY_PT & 0x7f);
    buf.extend_from_slice(&seq.to_be_bytes());
    buf.extend_from_slice(&ts.to_be_bytes());
    buf.extend_from_slice(&ssrc.to_be_bytes());
    for sample in samples {
        buf.extend_from_slice(&sample.to_le_bytes());
    }
    Bytes::from(buf)
}

/// Strip the payload framing from an inbound data unit.
fn depayload(buf: &[u8]) -> Option<&[u8]> {
    if buf.len() < RTP_HEADER_LEN {
        return None;
    }
    if (buf[0] >> 6) != 2 {
        return None;
    }
    let csrc_count = (buf[0] & 0x0f) as usize;
    let header_len = RTP_HEADER_LEN + csrc_count * 4;
    buf.get(header_len..)
}

/// Interpret a payload as f32le interleaved samples.
fn parse_f32le(payload: &[u8]) -> Vec<f32> {
    payload
        .chunks_exact(4)
        .map(|chunk| f32::from_le_bytes([chunk[0], chunk[1], chunk[2], chunk[3]]))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn receive_config() -> Config {
        Config {
            receive: true,
            ..Config::default()
        }
    }

    #[test]
    fn test_receive_stage_starts_idle() {
        let stage =
            MediaStage::receive(&receive_config(), Box::new(LoopbackBackend::default())).unwrap();
        assert_eq!(stage.state(), StageState::Idle);
        assert!(stage.sink_pad().is_some());
        assert!(stage.src_pad().is_none());
    }

    #[test]
    fn test_receive_chain_plays_out_samples() {
        let stage =
            MediaStage::receive(&receive_config(), Box::new(LoopbackBackend::default())).unwrap();
        stage.set_state(StageState::Playing);

        let src = Pad::new_src("recv_rtp_src_0");
        src.link_to(&stage.sink_pad().unwrap());
        src.push(payloadize(0, 0, 1, &[0.5f32, -0.5f32]));

        let mut out = [0f32; 4];
        let n = stage.inner.backend.lock().read(&mut out);
        assert_eq!(n, 2);
        assert_eq!(out[0], 0.5);
        assert_eq!(out[1], -0.5);
    }

    #[test]
    fn test_paused_stage_discards_nothing_but_stays_silent() {
        let stage =
            MediaStage::receive(&receive_config(), Box::new(LoopbackBackend::default())).unwrap();
        stage.set_state(StageState::Playing);
        stage.set_state(StageState::Paused);

        let src = Pad::new_src("recv_rtp_src_0");
        src.link_to(&stage.sink_pad().unwrap());
        src.push(payloadize(0, 0, 1, &[1.0f32]));

        let mut out = [0f32; 2];
        assert_eq!(stage.inner.backend.lock().read(&mut out), 0);
        // Configuration survives the pause.
        assert_eq!(stage.state(), StageState::Paused);
    }

    #[test]
    fn test_backend_failure_is_construction_error() {
        struct BrokenBackend;
        impl AudioBackend for BrokenBackend {
            fn open(&mut self, _: &AudioFormat) -> Result<(), String> {
                Err("no such device".to_string())
            }
            fn write(&mut self, _: &[f32]) {}
            fn read(&mut self, _: &mut [f32]) -> usize {
                0
            }
        }
        let err = MediaStage::receive(&receive_config(), Box::new(BrokenBackend)).unwrap_err();
        assert_eq!(err.component, "audio_sink");
    }

    #[test]
    fn test_payload_round_trip() {
        let unit = payloadize(7, 900, 42, &[0.25f32, 0.75f32]);
        let payload = depayload(&unit).unwrap();
        assert_eq!(parse_f32le(payload), vec![0.25, 0.75]);
    }

    #[test]
    fn test_depayload_rejects_short_or_bad_version() {
        assert!(depayload(&[0x80, 96]).is_none());
        let mut unit = payloadize(0, 0, 1, &[0.0f32]).to_vec();
        unit[0] = 0x40; // version 1
        assert!(depayload(&unit).is_none());
    }

    #[tokio::test]
    async fn test_send_stage_captures_and_pushes() {
        let config = Config {
            send: true,
            ..Config::default()
        };
        let stage = MediaStage::send(&config, Box::new(LoopbackBackend::default())).unwrap();
        let src = stage.src_pad().unwrap();

        let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel();
        let sink = Pad::with_chain("send_rtp_sink_0", move |buf| {
            let _ = tx.send(buf);
        });
        src.link_to(&sink);

        // Prime the backend with one tick worth of audio.
        stage.inner.backend.lock().write(&[0.1f32; 960]);
        stage.set_state(StageState::Playing);

        let unit = tokio::time::timeout(Duration::from_secs(1), rx.recv())
            .await
            .expect("capture produced no data")
            .unwrap();
        let payload = depayload(&unit).unwrap();
        assert!(!payload.is_empty());

        stage.teardown();
        assert_eq!(stage.state(), StageState::Idle);
    }
}
