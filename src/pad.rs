//! Named attachment points between sub-graphs.
//!
//! A `Pad` is one end of a potential data link: source pads push data
//! units downstream, sink pads receive them through an installed chain
//! function. A sink pad has at most one upstream peer at any time;
//! link and unlink happen at pad granularity so a producer can be
//! swapped without touching the rest of the graph.

use std::fmt;
use std::sync::Arc;

use bytes::Bytes;
use log::{debug, warn};
use parking_lot::Mutex;

/// Data direction of a pad.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PadDirection {
    /// Produces data units
    Src,
    /// Consumes data units
    Sink,
}

type ChainFn = Arc<dyn Fn(Bytes) + Send + Sync>;

struct PadInner {
    name: String,
    direction: PadDirection,
    /// Current link peer, if any
    peer: Mutex<Option<Pad>>,
    /// Chain function invoked for each data unit pushed to this pad
    chain: Mutex<Option<ChainFn>>,
}

/// A named attachment point. Cheap to clone; clones refer to the
/// same underlying pad.
#[derive(Clone)]
pub struct Pad {
    inner: Arc<PadInner>,
}

impl Pad {
    fn new(name: impl Into<String>, direction: PadDirection) -> Self {
        Self {
            inner: Arc::new(PadInner {
                name: name.into(),
                direction,
                peer: Mutex::new(None),
                chain: Mutex::new(None),
            }),
        }
    }

    /// Create a source pad.
    pub fn new_src(name: impl Into<String>) -> Self {
        Self::new(name, PadDirection::Src)
    }

    /// Create a sink pad without a chain function. Data pushed to it
    /// is dropped until a chain is installed.
    pub fn new_sink(name: impl Into<String>) -> Self {
        Self::new(name, PadDirection::Sink)
    }

    /// Create a sink pad with a chain function.
    pub fn with_chain(
        name: impl Into<String>,
        chain: impl Fn(Bytes) + Send + Sync + 'static,
    ) -> Self {
        let pad = Self::new(name, PadDirection::Sink);
        *pad.inner.chain.lock() = Some(Arc::new(chain));
        pad
    }

    /// Pad name.
    pub fn name(&self) -> &str {
        &self.inner.name
    }

    /// Pad direction.
    pub fn direction(&self) -> PadDirection {
        self.inner.direction
    }

    /// Whether this pad currently has a link peer.
    pub fn is_linked(&self) -> bool {
        self.inner.peer.lock().is_some()
    }

    /// The current link peer, if any.
    pub fn peer(&self) -> Option<Pad> {
        self.inner.peer.lock().clone()
    }

    /// Link this source pad to a sink pad.
    ///
    /// Any existing link on either side is detached first, so the
    /// single-upstream invariant of sink pads holds across the call.
    /// Linking an already-linked pair is logged and ignored.
    pub fn link_to(&self, sink: &Pad) {
        debug_assert_eq!(self.direction(), PadDirection::Src);
        debug_assert_eq!(sink.direction(), PadDirection::Sink);

        if let Some(existing) = sink.peer() {
            if existing == *self {
                warn!("pads {} and {} are already linked", self.name(), sink.name());
                return;
            }
            debug!(
                "detaching {} from {} before relink",
                existing.name(),
                sink.name()
            );
            existing.unlink();
        }
        if self.is_linked() {
            self.unlink();
        }

        *self.inner.peer.lock() = Some(sink.clone());
        *sink.inner.peer.lock() = Some(self.clone());
        debug!("linked {} -> {}", self.name(), sink.name());
    }

    /// Detach this pad from its peer, if any.
    ///
    /// Unlinking an already-unlinked pad can arise from benign
    /// duplicate events; it is logged and reported as `false`.
    pub fn unlink(&self) -> bool {
        let peer = self.inner.peer.lock().take();
        match peer {
            Some(peer) => {
                peer.inner.peer.lock().take();
                debug!("unlinked {} from {}", self.name(), peer.name());
                true
            }
            None => {
                debug!("unlink requested on already-unlinked pad {}", self.name());
                false
            }
        }
    }

    /// Deliver a data unit to this sink pad, running its chain
    /// function. Used by owners that feed a sink directly rather
    /// than through a link.
    pub fn chain(&self, buf: Bytes) {
        debug_assert_eq!(self.direction(), PadDirection::Sink);
        let chain = self.inner.chain.lock().clone();
        if let Some(chain) = chain {
            chain(buf);
        }
    }

    /// Push a data unit downstream.
    ///
    /// Forwards to the peer's chain function when linked; drops the
    /// unit otherwise. The transport engine quiesces the affected pad
    /// around link changes, so an in-flight unit is never split
    /// across two producers.
    pub fn push(&self, buf: Bytes) {
        let peer = self.inner.peer.lock().clone();
        let Some(peer) = peer else {
            return;
        };
        let chain = peer.inner.chain.lock().clone();
        if let Some(chain) = chain {
            chain(buf);
        }
    }
}

impl PartialEq for Pad {
    fn eq(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }
}

impl Eq for Pad {}

impl fmt::Debug for Pad {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Pad")
            .field("name", &self.inner.name)
            .field("direction", &self.inner.direction)
            .field("linked", &self.is_linked())
            .finish()
    }
}
