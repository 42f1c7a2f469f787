//! Dynamic link management.
//!
//! The transport engine's flow endpoints appear and disappear as the
//! network session negotiates; this module rewires them to and from
//! the media stage as they do. All handlers run on the orchestrator
//! loop, so transitions are serialized by construction and need no
//! locking of their own.

use log::{debug, info, warn};

use crate::media::{MediaStage, StageState};
use crate::pad::Pad;

/// Prefix of primary inbound media flow pads.
const RECV_FLOW_PREFIX: &str = "recv_rtp_src_";
/// Prefix of outbound media flow pads.
const SEND_FLOW_PREFIX: &str = "send_rtp_src_";

/// Reacts to flow lifecycle events by (re)wiring the media stage.
pub struct LinkManager {
    media: MediaStage,
    /// Engine-side sink for outbound media (send role only)
    transport_sink: Option<Pad>,
    /// The outbound link is established exactly once per session
    outbound_linked: bool,
}

impl LinkManager {
    /// Create a manager over the media stage and, for the send role,
    /// the engine's outbound sink pad.
    pub fn new(media: MediaStage, transport_sink: Option<Pad>) -> Self {
        Self {
            media,
            transport_sink,
            outbound_linked: false,
        }
    }

    /// A flow endpoint appeared on the engine.
    pub fn flow_appeared(&mut self, pad: &Pad) {
        if pad.name().starts_with(RECV_FLOW_PREFIX) {
            self.link_inbound(pad);
        } else if pad.name().starts_with(SEND_FLOW_PREFIX) {
            self.link_outbound(pad);
        } else {
            // Retransmission and control pads are wired by the
            // engine itself.
            debug!("ignoring engine-internal pad {}", pad.name());
        }
    }

    /// A flow endpoint disappeared from the engine.
    pub fn flow_removed(&mut self, pad: &Pad) {
        if !pad.name().starts_with(RECV_FLOW_PREFIX) {
            debug!("ignoring removal of pad {}", pad.name());
            return;
        }
        if !pad.unlink() {
            // Benign duplicate removal.
            warn!("inbound flow {} was not linked", pad.name());
        }
        // The producer is gone but the stage keeps its configuration
        // and resumes on the next appearance.
        self.media.set_state(StageState::Paused);
    }

    fn link_inbound(&mut self, pad: &Pad) {
        let Some(sink) = self.media.sink_pad() else {
            warn!("inbound flow {} in a session with no media sink", pad.name());
            return;
        };
        if let Some(old) = sink.peer() {
            // A new network sender supersedes the old one; replace
            // rather than error.
            info!("inbound producer {} replaces {}", pad.name(), old.name());
            old.unlink();
        }
        pad.link_to(&sink);
        self.media.set_state(StageState::Playing);
    }

    fn link_outbound(&mut self, pad: &Pad) {
        if self.outbound_linked {
            warn!("duplicate outbound flow {}, already linked", pad.name());
            return;
        }
        let (Some(src), Some(sink)) = (self.media.src_pad(), self.transport_sink.clone()) else {
            warn!(
                "outbound flow {} in a session with no outbound path",
                pad.name()
            );
            return;
        };
        src.link_to(&sink);
        self.outbound_linked = true;
        info!("outbound media linked to {}", sink.name());
    }
}
