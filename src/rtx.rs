//! Retransmission sub-graphs.
//!
//! The transport engine asks for one retransmission bin per logical
//! RTP session the first time it wires up that flow. A bin wraps a
//! single retransmission stage configured with the 96->97 payload
//! type remap and exposes two deterministically named pads
//! (`sink_<id>` / `src_<id>`) so the engine can splice it in without
//! any further topology knowledge. The buffering and reissue timing
//! itself is owned by the engine; at this layer the stage carries the
//! remap configuration and forwards data units unchanged.

use std::collections::HashMap;
use std::sync::Arc;

use bytes::Bytes;
use log::debug;
use parking_lot::Mutex;

use crate::engine::FlowId;
use crate::pad::Pad;
use crate::payload::{PRIMARY_PT, RTX_PT};

/// Which side of the retransmission protocol a bin implements.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RtxDirection {
    /// Buffers outbound packets and reissues them on request
    Sender,
    /// Detects gaps in inbound packets and requests reissue
    Receiver,
}

/// Retransmission sub-graph for one logical RTP session.
pub struct RtxBin {
    flow_id: FlowId,
    direction: RtxDirection,
    /// Primary payload type and its retransmission shadow
    pt_map: (u8, u8),
    sink: Pad,
    src: Pad,
}

impl RtxBin {
    fn new(flow_id: FlowId, direction: RtxDirection) -> Arc<Self> {
        let src = Pad::new_src(format!("src_{}", flow_id));
        let out = src.clone();
        // Reissue scheduling lives in the engine; the stage passes
        // primary-payload units straight through.
        let sink = Pad::with_chain(format!("sink_{}", flow_id), move |buf| out.push(buf));
        Arc::new(Self {
            flow_id,
            direction,
            pt_map: (PRIMARY_PT, RTX_PT),
            sink,
            src,
        })
    }

    /// Logical session id this bin belongs to.
    pub fn flow_id(&self) -> FlowId {
        self.flow_id
    }

    /// Protocol side of this bin.
    pub fn direction(&self) -> RtxDirection {
        self.direction
    }

    /// Primary payload type and its retransmission shadow.
    pub fn pt_map(&self) -> (u8, u8) {
        self.pt_map
    }

    /// Inbound attachment point (`sink_<id>`).
    pub fn sink_pad(&self) -> Pad {
        self.sink.clone()
    }

    /// Outbound attachment point (`src_<id>`).
    pub fn src_pad(&self) -> Pad {
        self.src.clone()
    }

    /// Feed a data unit into the bin's sink side.
    pub fn push(&self, buf: Bytes) {
        self.sink.chain(buf);
    }
}

/// Lazily builds retransmission bins, one per logical session.
///
/// Invoked synchronously by the transport engine while it sets up a
/// flow, hence the interior mutability. Bins live for the rest of the
/// process.
pub struct RtxBinFactory {
    bins: Mutex<HashMap<(FlowId, RtxDirection), Arc<RtxBin>>>,
}

impl RtxBinFactory {
    /// Create an empty factory.
    pub fn new() -> Self {
        Self {
            bins: Mutex::new(HashMap::new()),
        }
    }

    /// Get or build the bin for a session and direction.
    ///
    /// Requesting the same pair twice returns the same bin; element
    /// construction itself cannot fail.
    pub fn request(&self, flow_id: FlowId, direction: RtxDirection) -> Arc<RtxBin> {
        let mut bins = self.bins.lock();
        bins.entry((flow_id, direction))
            .or_insert_with(|| {
                debug!("building {:?} rtx bin for session {}", direction, flow_id);
                RtxBin::new(flow_id, direction)
            })
            .clone()
    }
}

impl Default for RtxBinFactory {
    fn default() -> Self {
        Self::new()
    }
}
