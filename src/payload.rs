//! Payload type negotiation.
//!
//! The link uses one fixed payload mapping: the primary payload type
//! 96 carries the opaque audio payload at a 90 kHz clock, and 97 is
//! reserved as its retransmission shadow. The negotiator answers the
//! transport engine's payload-type queries when network signaling
//! alone cannot resolve the typing.

use std::sync::Arc;

use crate::engine::FlowId;

/// Primary payload type for the audio flow.
pub const PRIMARY_PT: u8 = 96;
/// Retransmission shadow payload type.
pub const RTX_PT: u8 = 97;

/// Capability set announced for the primary payload type. Immutable,
/// shared by reference between the negotiator and the topology
/// builder.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PayloadDescriptor {
    /// Media class
    pub media: &'static str,
    /// RTP clock rate in Hz
    pub clock_rate: u32,
    /// Encoding name
    pub encoding: &'static str,
}

impl PayloadDescriptor {
    /// The fixed descriptor for the opaque audio payload.
    pub fn opaque_audio() -> Self {
        Self {
            media: "application",
            clock_rate: 90000,
            encoding: "generic-opaque-payload",
        }
    }
}

/// Answers "what does payload type N carry?" for the transport
/// engine. Holds no mutable state and is safe to call from the
/// engine's own threads.
#[derive(Debug, Clone)]
pub struct PtMap {
    descriptor: Arc<PayloadDescriptor>,
}

impl PtMap {
    /// Create a negotiator over the fixed descriptor.
    pub fn new(descriptor: Arc<PayloadDescriptor>) -> Self {
        Self { descriptor }
    }

    /// Resolve a payload type for the given flow.
    ///
    /// Returns the fixed descriptor for the primary payload type and
    /// no answer otherwise, letting the engine fall back to its own
    /// negotiation or fail the flow.
    pub fn resolve(&self, _flow_id: FlowId, pt: u8) -> Option<Arc<PayloadDescriptor>> {
        (pt == PRIMARY_PT).then(|| self.descriptor.clone())
    }
}
