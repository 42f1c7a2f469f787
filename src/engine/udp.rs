//! Thin UDP transport backend.
//!
//! Owns the RTP and RTCP sockets and surfaces flow lifecycle events,
//! delegating all RTP session math (jitter buffering, reordering,
//! retransmission scheduling, loss statistics) to richer backends
//! behind the same trait. Sockets are configured through socket2 so
//! the buffer sizes survive bursty links.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use bytes::Bytes;
use log::{info, warn};
use socket2::{Domain, Protocol, Socket, Type};
use tokio::net::UdpSocket;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use crate::config::Role;
use crate::error::ConstructionError;
use crate::pad::Pad;
use crate::payload::RTX_PT;
use crate::rtx::RtxDirection;

use super::{EngineCallbacks, EngineEvent, EngineSettings, FlowId, SessionStats, TransportEngine};

/// Datagram receive buffer size. Larger than any sane RTP MTU.
const RECV_BUF_LEN: usize = 2048;

#[derive(Default)]
struct Counters {
    packets_sent: AtomicU64,
    packets_received: AtomicU64,
    bytes_sent: AtomicU64,
    bytes_received: AtomicU64,
    rtcp_received: AtomicU64,
}

/// UDP socket backend for the transport engine seam.
pub struct UdpEngine {
    settings: Option<EngineSettings>,
    callbacks: Option<EngineCallbacks>,
    running: Arc<AtomicBool>,
    counters: Arc<Counters>,
    send_sink: Option<Pad>,
    rtp_local: Option<SocketAddr>,
    tasks: Vec<JoinHandle<()>>,
}

impl UdpEngine {
    /// Create an unconfigured engine.
    pub fn new() -> Self {
        Self {
            settings: None,
            callbacks: None,
            running: Arc::new(AtomicBool::new(false)),
            counters: Arc::new(Counters::default()),
            send_sink: None,
            rtp_local: None,
            tasks: Vec::new(),
        }
    }

    /// Actual local RTP socket address after start. Useful when the
    /// configured bind port was 0.
    pub fn rtp_local_addr(&self) -> Option<SocketAddr> {
        self.rtp_local
    }

    fn start_receive(
        &mut self,
        settings: &EngineSettings,
        callbacks: &EngineCallbacks,
    ) -> Result<(), ConstructionError> {
        let bind = settings
            .rtp_bind
            .ok_or_else(|| ConstructionError::new("rtpsrc", "no bind address"))?;
        let rtp = bind_udp("rtpsrc", bind)?;
        let rtcp = bind_udp("rtcpsrc", settings.rtcp_bind)?;
        self.rtp_local = rtp.local_addr().ok();

        // The receiver rtx bin has to exist before the flow pad is
        // announced, mirroring the engine's own setup order.
        let bin = callbacks.rtx_factory.request(0, RtxDirection::Receiver);
        let flow_pad = Pad::new_src("recv_rtp_src_0");
        let out = flow_pad.clone();
        let splice = Pad::with_chain("rtx_out_0", move |buf| out.push(buf));
        bin.src_pad().link_to(&splice);

        let running = self.running.clone();
        let counters = self.counters.clone();
        let events = callbacks.events.clone();
        let pt_map = callbacks.pt_map.clone();
        self.tasks.push(tokio::spawn(async move {
            let mut buf = [0u8; RECV_BUF_LEN];
            let mut announced = false;
            while running.load(Ordering::Acquire) {
                let n = match rtp.recv_from(&mut buf).await {
                    Ok((n, _)) => n,
                    Err(e) => {
                        let _ = events.send(EngineEvent::Error {
                            source: "rtpsrc".to_string(),
                            message: "receive failed".to_string(),
                            detail: Some(e.to_string()),
                        });
                        break;
                    }
                };
                counters.packets_received.fetch_add(1, Ordering::Relaxed);
                counters.bytes_received.fetch_add(n as u64, Ordering::Relaxed);

                if n >= 12 {
                    let pt = buf[1] & 0x7f;
                    if pt != RTX_PT && pt_map.resolve(0, pt).is_none() {
                        warn!("dropping datagram with unnegotiated payload type {}", pt);
                        continue;
                    }
                }
                if !announced {
                    announced = true;
                    let _ = events.send(EngineEvent::FlowAppeared {
                        pad: flow_pad.clone(),
                    });
                }
                bin.push(Bytes::copy_from_slice(&buf[..n]));
            }
        }));

        self.spawn_rtcp_drain(rtcp);
        info!("udp engine listening on {}", bind);
        Ok(())
    }

    fn start_send(
        &mut self,
        settings: &EngineSettings,
        callbacks: &EngineCallbacks,
    ) -> Result<(), ConstructionError> {
        let remote = settings
            .rtp_remote
            .ok_or_else(|| ConstructionError::new("rtpsink", "no remote address configured"))?;
        let bind: SocketAddr = if remote.is_ipv4() {
            "0.0.0.0:0".parse().expect("static addr")
        } else {
            "[::]:0".parse().expect("static addr")
        };
        let rtp = bind_udp("rtpsink", bind)?;
        let rtcp = bind_udp("rtcpsrc", settings.rtcp_bind)?;
        self.rtp_local = rtp.local_addr().ok();

        let bin = callbacks.rtx_factory.request(0, RtxDirection::Sender);
        let (out_tx, mut out_rx) = mpsc::unbounded_channel::<Bytes>();
        let splice = Pad::with_chain("rtx_out_0", move |buf| {
            let _ = out_tx.send(buf);
        });
        bin.src_pad().link_to(&splice);

        // Outbound media enters through this pad and leaves through
        // the sender rtx bin.
        let ingress = bin.clone();
        self.send_sink = Some(Pad::with_chain("send_rtp_sink_0", move |buf| {
            ingress.push(buf)
        }));

        let running = self.running.clone();
        let counters = self.counters.clone();
        let events = callbacks.events.clone();
        self.tasks.push(tokio::spawn(async move {
            while let Some(buf) = out_rx.recv().await {
                if !running.load(Ordering::Acquire) {
                    break;
                }
                match rtp.send_to(&buf, remote).await {
                    Ok(n) => {
                        counters.packets_sent.fetch_add(1, Ordering::Relaxed);
                        counters.bytes_sent.fetch_add(n as u64, Ordering::Relaxed);
                    }
                    Err(e) => {
                        let _ = events.send(EngineEvent::Error {
                            source: "rtpsink".to_string(),
                            message: "send failed".to_string(),
                            detail: Some(e.to_string()),
                        });
                        break;
                    }
                }
            }
        }));

        self.spawn_rtcp_drain(rtcp);

        // The egress flow exists as soon as the session is up.
        let _ = callbacks.events.send(EngineEvent::FlowAppeared {
            pad: Pad::new_src("send_rtp_src_0"),
        });
        info!("udp engine sending to {}", remote);
        Ok(())
    }

    /// Consume inbound RTCP, counting it. Feedback generation and
    /// interpretation belong to a full session-manager backend.
    fn spawn_rtcp_drain(&mut self, rtcp: UdpSocket) {
        let running = self.running.clone();
        let counters = self.counters.clone();
        self.tasks.push(tokio::spawn(async move {
            let mut buf = [0u8; RECV_BUF_LEN];
            while running.load(Ordering::Acquire) {
                match rtcp.recv_from(&mut buf).await {
                    Ok(_) => {
                        counters.rtcp_received.fetch_add(1, Ordering::Relaxed);
                    }
                    Err(_) => break,
                }
            }
        }));
    }
}

impl Default for UdpEngine {
    fn default() -> Self {
        Self::new()
    }
}

impl TransportEngine for UdpEngine {
    fn configure(&mut self, settings: &EngineSettings) -> Result<(), ConstructionError> {
        self.settings = Some(settings.clone());
        Ok(())
    }

    fn set_callbacks(&mut self, callbacks: EngineCallbacks) {
        self.callbacks = Some(callbacks);
    }

    fn start(&mut self) -> Result<(), ConstructionError> {
        let settings = self
            .settings
            .clone()
            .ok_or_else(|| ConstructionError::new("transport", "engine not configured"))?;
        let callbacks = self
            .callbacks
            .clone()
            .ok_or_else(|| ConstructionError::new("transport", "no callbacks registered"))?;

        self.running.store(true, Ordering::Release);
        let result = match settings.role {
            Role::Receive => self.start_receive(&settings, &callbacks),
            Role::Send => self.start_send(&settings, &callbacks),
        };
        if result.is_err() {
            self.stop();
        }
        result
    }

    fn stop(&mut self) {
        if !self.running.swap(false, Ordering::AcqRel) && self.tasks.is_empty() {
            return;
        }
        for task in self.tasks.drain(..) {
            task.abort();
        }
        info!("udp engine stopped");
    }

    fn send_rtp_sink(&self) -> Option<Pad> {
        self.send_sink.clone()
    }

    fn stats(&self, session: FlowId) -> SessionStats {
        SessionStats {
            session,
            packets_sent: self.counters.packets_sent.load(Ordering::Relaxed),
            packets_received: self.counters.packets_received.load(Ordering::Relaxed),
            bytes_sent: self.counters.bytes_sent.load(Ordering::Relaxed),
            bytes_received: self.counters.bytes_received.load(Ordering::Relaxed),
            rtcp_received: self.counters.rtcp_received.load(Ordering::Relaxed),
            // Loss and jitter estimation are delegated to a full
            // session-manager backend.
            packets_lost: 0,
            jitter: 0,
        }
    }
}

fn bind_udp(component: &'static str, addr: SocketAddr) -> Result<UdpSocket, ConstructionError> {
    let domain = if addr.is_ipv4() {
        Domain::IPV4
    } else {
        Domain::IPV6
    };
    let socket = Socket::new(domain, Type::DGRAM, Some(Protocol::UDP))
        .map_err(|e| ConstructionError::new(component, e.to_string()))?;
    socket
        .set_reuse_address(true)
        .map_err(|e| ConstructionError::new(component, e.to_string()))?;
    let _ = socket.set_recv_buffer_size(1024 * 1024);
    let _ = socket.set_send_buffer_size(1024 * 1024);
    socket
        .set_nonblocking(true)
        .map_err(|e| ConstructionError::new(component, e.to_string()))?;
    socket
        .bind(&addr.into())
        .map_err(|e| ConstructionError::new(component, e.to_string()))?;
    UdpSocket::from_std(socket.into()).map_err(|e| ConstructionError::new(component, e.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::payload::{PayloadDescriptor, PtMap, PRIMARY_PT};
    use crate::rtx::RtxBinFactory;
    use std::time::Duration;

    fn localhost_settings(role: Role) -> EngineSettings {
        EngineSettings {
            role,
            latency_ms: 100,
            do_retransmission: true,
            avpf_profile: true,
            rtp_bind: Some("127.0.0.1:0".parse().unwrap()),
            rtcp_bind: "127.0.0.1:0".parse().unwrap(),
            rtp_remote: Some("127.0.0.1:9".parse().unwrap()),
            rtcp_remote: None,
            payload: Arc::new(PayloadDescriptor::opaque_audio()),
        }
    }

    fn callbacks() -> (EngineCallbacks, mpsc::UnboundedReceiver<EngineEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (
            EngineCallbacks {
                pt_map: PtMap::new(Arc::new(PayloadDescriptor::opaque_audio())),
                rtx_factory: Arc::new(RtxBinFactory::new()),
                events: tx,
            },
            rx,
        )
    }

    #[tokio::test]
    async fn test_first_datagram_announces_flow() {
        let mut engine = UdpEngine::new();
        engine.configure(&localhost_settings(Role::Receive)).unwrap();
        let (callbacks, mut events) = callbacks();
        engine.set_callbacks(callbacks);
        engine.start().unwrap();

        let local = engine.rtp_local_addr().unwrap();
        let probe = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let mut datagram = vec![0x80u8, PRIMARY_PT & 0x7f];
        datagram.extend_from_slice(&[0u8; 10]);
        probe.send_to(&datagram, local).await.unwrap();

        let event = tokio::time::timeout(Duration::from_secs(2), events.recv())
            .await
            .expect("no event before timeout")
            .unwrap();
        match event {
            EngineEvent::FlowAppeared { pad } => assert_eq!(pad.name(), "recv_rtp_src_0"),
            other => panic!("unexpected event: {:?}", other),
        }
        engine.stop();
    }

    #[tokio::test]
    async fn test_send_role_announces_egress_once() {
        let mut engine = UdpEngine::new();
        engine.configure(&localhost_settings(Role::Send)).unwrap();
        let (callbacks, mut events) = callbacks();
        engine.set_callbacks(callbacks);
        engine.start().unwrap();

        let event = events.recv().await.unwrap();
        match event {
            EngineEvent::FlowAppeared { pad } => assert_eq!(pad.name(), "send_rtp_src_0"),
            other => panic!("unexpected event: {:?}", other),
        }
        assert!(engine.send_rtp_sink().is_some());
        assert!(events.try_recv().is_err());
        engine.stop();
        engine.stop(); // idempotent
    }
}
