//! End-to-end orchestrator scenarios over a scripted engine.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use tokio::sync::mpsc::UnboundedSender;

use audio_link::{
    AudioLink, Config, ConstructionError, EngineCallbacks, EngineEvent, EngineSettings,
    ExitReason, FlowId, LoopbackBackend, Pad, Role, SessionStats, StageState, TransportEngine,
};

/// Shared view into the mock engine, kept by the test after the
/// engine box moves into the session.
#[derive(Default)]
struct MockState {
    events: Mutex<Option<UnboundedSender<EngineEvent>>>,
    send_sink: Mutex<Option<Pad>>,
    start_count: AtomicUsize,
    stop_count: AtomicUsize,
    stats_queries: AtomicUsize,
}

impl MockState {
    fn emit(&self, event: EngineEvent) {
        let guard = self.events.lock();
        guard
            .as_ref()
            .expect("callbacks not registered")
            .send(event)
            .expect("event channel closed");
    }

    fn flow_appeared(&self, name: &str) -> Pad {
        let pad = Pad::new_src(name);
        self.emit(EngineEvent::FlowAppeared { pad: pad.clone() });
        pad
    }

    fn flow_removed(&self, pad: &Pad) {
        self.emit(EngineEvent::FlowRemoved { pad: pad.clone() });
    }
}

struct MockEngine {
    state: Arc<MockState>,
    fail_on_start: bool,
}

impl TransportEngine for MockEngine {
    fn configure(&mut self, settings: &EngineSettings) -> Result<(), ConstructionError> {
        if settings.role == Role::Send {
            *self.state.send_sink.lock() = Some(Pad::new_sink("send_rtp_sink_0"));
        }
        Ok(())
    }

    fn set_callbacks(&mut self, callbacks: EngineCallbacks) {
        *self.state.events.lock() = Some(callbacks.events);
    }

    fn start(&mut self) -> Result<(), ConstructionError> {
        if self.fail_on_start {
            return Err(ConstructionError::new("rtpbin", "simulated failure"));
        }
        self.state.start_count.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    fn stop(&mut self) {
        self.state.stop_count.fetch_add(1, Ordering::SeqCst);
    }

    fn send_rtp_sink(&self) -> Option<Pad> {
        self.state.send_sink.lock().clone()
    }

    fn stats(&self, session: FlowId) -> SessionStats {
        self.state.stats_queries.fetch_add(1, Ordering::SeqCst);
        SessionStats {
            session,
            packets_received: 5,
            bytes_received: 600,
            ..SessionStats::default()
        }
    }
}

fn mock_engine() -> (Box<MockEngine>, Arc<MockState>) {
    let state = Arc::new(MockState::default());
    (
        Box::new(MockEngine {
            state: state.clone(),
            fail_on_start: false,
        }),
        state,
    )
}

fn receive_config() -> Config {
    Config {
        receive: true,
        bind_port: 6000,
        latency: 100,
        ..Config::default()
    }
}

fn send_config() -> Config {
    Config {
        send: true,
        remote_address: "10.0.0.5".to_string(),
        remote_port: 6000,
        ..Config::default()
    }
}

fn start_receive() -> (AudioLink, Arc<MockState>) {
    let (engine, state) = mock_engine();
    let link = AudioLink::start(
        Role::Receive,
        &receive_config(),
        engine,
        Box::new(LoopbackBackend::default()),
    )
    .expect("construction failed");
    (link, state)
}

#[tokio::test]
async fn receive_flow_links_and_activates_stage() {
    let (mut link, state) = start_receive();
    assert_eq!(link.media().state(), StageState::Idle);

    let pad = state.flow_appeared("recv_rtp_src_0");
    link.control().quit();

    assert_eq!(link.run().await, ExitReason::UserRequested);
    assert_eq!(link.media().state(), StageState::Playing);
    assert_eq!(link.media().sink_pad().unwrap().peer(), Some(pad));
}

#[tokio::test]
async fn new_inbound_producer_supersedes_old() {
    let (mut link, state) = start_receive();

    let a = state.flow_appeared("recv_rtp_src_0");
    let b = state.flow_appeared("recv_rtp_src_1");
    link.control().quit();

    assert_eq!(link.run().await, ExitReason::UserRequested);
    assert!(!a.is_linked());
    assert_eq!(link.media().sink_pad().unwrap().peer(), Some(b));
}

#[tokio::test]
async fn inbound_flow_removal_pauses_stage() {
    let (mut link, state) = start_receive();

    let pad = state.flow_appeared("recv_rtp_src_0");
    state.flow_removed(&pad);
    link.control().quit();

    assert_eq!(link.run().await, ExitReason::UserRequested);
    assert_eq!(link.media().state(), StageState::Paused);
    assert!(!link.media().sink_pad().unwrap().is_linked());
}

#[tokio::test]
async fn send_flow_links_media_source_once() {
    let (engine, state) = mock_engine();
    let mut link = AudioLink::start(
        Role::Send,
        &send_config(),
        engine,
        Box::new(LoopbackBackend::default()),
    )
    .expect("construction failed");

    state.flow_appeared("send_rtp_src_0");
    state.flow_appeared("send_rtp_src_0");
    link.control().quit();

    assert_eq!(link.run().await, ExitReason::UserRequested);
    let transport_sink = state.send_sink.lock().clone().unwrap();
    assert_eq!(transport_sink.peer(), link.media().src_pad());
    link.shutdown();
}

#[tokio::test]
async fn stats_request_does_not_terminate_loop() {
    let (mut link, state) = start_receive();

    let control = link.control();
    control.dump_stats();
    control.quit();

    assert_eq!(link.run().await, ExitReason::UserRequested);
    assert_eq!(state.stats_queries.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn fatal_engine_error_terminates_loop() {
    let (mut link, state) = start_receive();

    state.emit(EngineEvent::Error {
        source: "rtpbin".to_string(),
        message: "internal data stream error".to_string(),
        detail: Some("streaming stopped".to_string()),
    });

    assert_eq!(link.run().await, ExitReason::FatalError);
}

#[tokio::test]
async fn shutdown_is_idempotent() {
    let (mut link, state) = start_receive();
    link.control().quit();
    assert_eq!(link.run().await, ExitReason::UserRequested);

    link.shutdown();
    link.shutdown();
    assert_eq!(state.stop_count.load(Ordering::SeqCst), 1);
    drop(link);
    assert_eq!(state.stop_count.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn failed_engine_start_tears_topology_down() {
    let state = Arc::new(MockState::default());
    let engine = Box::new(MockEngine {
        state: state.clone(),
        fail_on_start: true,
    });

    let err = AudioLink::start(
        Role::Receive,
        &receive_config(),
        engine,
        Box::new(LoopbackBackend::default()),
    )
    .unwrap_err();

    assert_eq!(err.component, "rtpbin");
    assert_eq!(state.stop_count.load(Ordering::SeqCst), 1);
}
