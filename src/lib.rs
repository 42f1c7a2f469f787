//! audio-link - point-to-point RTP audio streaming
//!
//! Streams a single audio channel pair between two network nodes
//! over RTP/RTCP, in either a sending or receiving role, with
//! retransmission-based loss recovery and jitter buffering.
//!
//! The heart of the crate is the session orchestrator: it assembles
//! the transport topology, negotiates payload typing, rewires flows
//! as endpoints appear and disappear at runtime, and drives the
//! session lifecycle from start through statistics reporting to
//! shutdown. The RTP session math itself lives behind the
//! [`TransportEngine`] seam; a thin UDP backend ships for the
//! bundled binary.

pub mod config;
pub mod engine;
pub mod error;
pub mod link;
pub mod media;
pub mod pad;
pub mod payload;
pub mod rtx;
pub mod session;

pub use config::{Config, Role};
pub use engine::{
    EngineCallbacks, EngineEvent, EngineSettings, FlowId, SessionStats, TransportEngine, UdpEngine,
};
pub use error::{ConfigError, ConstructionError, ExitReason};
pub use link::LinkManager;
pub use media::{AudioBackend, AudioFormat, LoopbackBackend, MediaStage, StageState};
pub use pad::{Pad, PadDirection};
pub use payload::{PayloadDescriptor, PtMap, PRIMARY_PT, RTX_PT};
pub use rtx::{RtxBin, RtxBinFactory, RtxDirection};
pub use session::{AudioLink, Control, ControlHandle};
