//! Transport engine contract.
//!
//! The RTP/RTCP session manager is an external collaborator: it owns
//! packetization, jitter buffering, retransmission timing and loss
//! statistics. The orchestrator configures it, hands it the payload
//! negotiator and the retransmission bin factory, and observes it
//! through typed lifecycle events delivered over a channel consumed
//! by the single orchestrator loop.

use std::fmt;
use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;

use tokio::sync::mpsc::UnboundedSender;

use crate::config::{Config, Role};
use crate::error::ConstructionError;
use crate::pad::Pad;
use crate::payload::{PayloadDescriptor, PtMap};
use crate::rtx::RtxBinFactory;

pub mod udp;

pub use udp::UdpEngine;

/// Logical RTP session id assigned by the transport engine.
pub type FlowId = u32;

/// Endpoint lifecycle and failure events raised by the engine.
///
/// Delivered strictly in raise order; a removal is never observed
/// before the corresponding appearance for the same flow.
#[derive(Debug)]
pub enum EngineEvent {
    /// A new flow endpoint appeared on the engine
    FlowAppeared {
        /// The engine-side attachment point for the flow
        pad: Pad,
    },
    /// A flow endpoint disappeared
    FlowRemoved {
        /// The attachment point that went away
        pad: Pad,
    },
    /// Unrecoverable failure on an active session
    Error {
        /// Identity of the failing component
        source: String,
        /// Human-readable failure description
        message: String,
        /// Additional diagnostic detail, if available
        detail: Option<String>,
    },
}

/// Configuration applied to the engine before start. Derived from
/// the startup [`Config`](crate::config::Config) once per session.
#[derive(Debug, Clone)]
pub struct EngineSettings {
    /// Operating role of this node
    pub role: Role,
    /// Jitter buffer latency budget in milliseconds
    pub latency_ms: u32,
    /// Retransmission-based loss recovery
    pub do_retransmission: bool,
    /// RTP/AVPF feedback profile (NACK-style feedback)
    pub avpf_profile: bool,
    /// Local RTP bind address (receive role)
    pub rtp_bind: Option<SocketAddr>,
    /// Local RTCP bind address (always bound, RTP port + 1)
    pub rtcp_bind: SocketAddr,
    /// Remote RTP address (send role)
    pub rtp_remote: Option<SocketAddr>,
    /// Remote RTCP address, if a remote is configured
    pub rtcp_remote: Option<SocketAddr>,
    /// Capability set announced for the primary payload type
    pub payload: Arc<PayloadDescriptor>,
}

impl EngineSettings {
    /// Derive engine settings from the startup configuration.
    ///
    /// RTCP uses port+1 on both the local and remote side. The
    /// receive role binds RTP locally and only needs a remote for
    /// RTCP reports; the send role needs a remote RTP address.
    pub fn from_config(
        role: Role,
        config: &Config,
        payload: Arc<PayloadDescriptor>,
    ) -> Result<Self, ConstructionError> {
        let bind_ip: IpAddr = config
            .bind_address
            .parse()
            .map_err(|_| ConstructionError::new("transport", format!(
                "invalid bind address {:?}",
                config.bind_address
            )))?;
        let remote_ip: Option<IpAddr> = if config.remote_address.is_empty() {
            None
        } else {
            Some(config.remote_address.parse().map_err(|_| {
                ConstructionError::new(
                    "transport",
                    format!("invalid remote address {:?}", config.remote_address),
                )
            })?)
        };
        let rtcp_port = |port: u16| {
            port.checked_add(1)
                .ok_or_else(|| ConstructionError::new("transport", "RTCP port would overflow"))
        };

        let settings = match role {
            Role::Receive => Self {
                role,
                latency_ms: config.latency,
                do_retransmission: true,
                avpf_profile: true,
                rtp_bind: Some(SocketAddr::new(bind_ip, config.bind_port)),
                rtcp_bind: SocketAddr::new(bind_ip, rtcp_port(config.bind_port)?),
                rtp_remote: None,
                rtcp_remote: match remote_ip {
                    Some(ip) => Some(SocketAddr::new(ip, rtcp_port(config.remote_port)?)),
                    None => None,
                },
                payload,
            },
            Role::Send => {
                let remote = remote_ip.ok_or_else(|| {
                    ConstructionError::new("rtpsink", "no remote address configured")
                })?;
                Self {
                    role,
                    latency_ms: config.latency,
                    do_retransmission: true,
                    avpf_profile: true,
                    rtp_bind: None,
                    rtcp_bind: SocketAddr::new(bind_ip, rtcp_port(config.bind_port)?),
                    rtp_remote: Some(SocketAddr::new(remote, config.remote_port)),
                    rtcp_remote: Some(SocketAddr::new(remote, rtcp_port(config.remote_port)?)),
                    payload,
                }
            }
        };
        Ok(settings)
    }
}

/// Callbacks the orchestrator registers on the engine before start.
#[derive(Clone)]
pub struct EngineCallbacks {
    /// Payload-type negotiator, callable from engine threads
    pub pt_map: PtMap,
    /// Retransmission bin factory, invoked on first use of a flow
    pub rtx_factory: Arc<RtxBinFactory>,
    /// Lifecycle and error event channel into the orchestrator loop
    pub events: UnboundedSender<EngineEvent>,
}

/// Snapshot of one RTP session's counters.
///
/// The engine owns the statistics math; fields it does not track are
/// reported as zero.
#[derive(Debug, Clone, Default)]
pub struct SessionStats {
    /// Logical session id the snapshot belongs to
    pub session: FlowId,
    /// RTP packets sent
    pub packets_sent: u64,
    /// RTP packets received
    pub packets_received: u64,
    /// Bytes sent
    pub bytes_sent: u64,
    /// Bytes received
    pub bytes_received: u64,
    /// RTCP packets received
    pub rtcp_received: u64,
    /// Estimated packets lost
    pub packets_lost: u64,
    /// Estimated interarrival jitter (engine clock units)
    pub jitter: u32,
}

impl fmt::Display for SessionStats {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "session={} packets-sent={} packets-received={} bytes-sent={} \
             bytes-received={} rtcp-received={} packets-lost={} jitter={}",
            self.session,
            self.packets_sent,
            self.packets_received,
            self.bytes_sent,
            self.bytes_received,
            self.rtcp_received,
            self.packets_lost,
            self.jitter
        )
    }
}

/// The transport engine seam.
///
/// Call order is fixed: `configure`, `set_callbacks`, `start`.
/// Starting before callbacks are registered would lose the engine's
/// chance to request retransmission bins while it builds its flows.
pub trait TransportEngine: Send {
    /// Apply session settings. Must be called before `start`.
    fn configure(&mut self, settings: &EngineSettings) -> Result<(), ConstructionError>;

    /// Register the negotiator, bin factory and event channel.
    fn set_callbacks(&mut self, callbacks: EngineCallbacks);

    /// Bring the engine's flows up. Socket or resource failures
    /// surface here as construction errors.
    fn start(&mut self) -> Result<(), ConstructionError>;

    /// Stop all engine activity. Idempotent.
    fn stop(&mut self);

    /// The engine-side sink pad for outbound media (send role).
    fn send_rtp_sink(&self) -> Option<Pad>;

    /// Snapshot the counters of one session.
    fn stats(&self, session: FlowId) -> SessionStats;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_settings_receive_role() {
        let config = Config {
            receive: true,
            bind_port: 6000,
            latency: 100,
            ..Config::default()
        };
        let settings = EngineSettings::from_config(
            Role::Receive,
            &config,
            Arc::new(PayloadDescriptor::opaque_audio()),
        )
        .unwrap();
        assert_eq!(settings.rtp_bind.unwrap().port(), 6000);
        assert_eq!(settings.rtcp_bind.port(), 6001);
        assert!(settings.rtp_remote.is_none());
        assert_eq!(settings.latency_ms, 100);
        assert!(settings.do_retransmission);
    }

    #[test]
    fn test_settings_send_role_rtcp_is_port_plus_one() {
        let config = Config {
            send: true,
            remote_address: "10.0.0.5".to_string(),
            remote_port: 6000,
            ..Config::default()
        };
        let settings = EngineSettings::from_config(
            Role::Send,
            &config,
            Arc::new(PayloadDescriptor::opaque_audio()),
        )
        .unwrap();
        assert_eq!(settings.rtp_remote.unwrap().port(), 6000);
        assert_eq!(settings.rtcp_remote.unwrap().port(), 6001);
    }

    #[test]
    fn test_settings_send_role_requires_remote() {
        let config = Config {
            send: true,
            ..Config::default()
        };
        let err = EngineSettings::from_config(
            Role::Send,
            &config,
            Arc::new(PayloadDescriptor::opaque_audio()),
        )
        .unwrap_err();
        assert_eq!(err.component, "rtpsink");
    }

    #[test]
    fn test_stats_display_is_single_line() {
        let stats = SessionStats {
            session: 0,
            packets_sent: 10,
            bytes_sent: 1200,
            ..SessionStats::default()
        };
        let line = stats.to_string();
        assert!(!line.contains('\n'));
        assert!(line.contains("packets-sent=10"));
        assert!(line.contains("bytes-sent=1200"));
    }
}
