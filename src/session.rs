//! Session orchestration.
//!
//! Owns the whole topology: builds the media stage, configures the
//! transport engine, registers the payload negotiator, the
//! retransmission bin factory and the link manager, then drives a
//! single-threaded cooperative event loop until termination. All
//! callbacks dispatch on that loop, so nothing here needs locking.

use std::sync::Arc;

use log::{error, info};
use tokio::sync::mpsc::{self, UnboundedReceiver, UnboundedSender};

use crate::config::{Config, Role};
use crate::engine::{EngineCallbacks, EngineEvent, EngineSettings, TransportEngine};
use crate::error::{ConstructionError, ExitReason};
use crate::link::LinkManager;
use crate::media::{AudioBackend, MediaStage, StageState};
use crate::payload::{PayloadDescriptor, PtMap};
use crate::rtx::RtxBinFactory;

/// Operator commands delivered into the run loop.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Control {
    /// Print the current session statistics; the loop keeps running
    DumpStats,
    /// Terminate gracefully
    Quit,
}

/// Clonable handle used by signal handlers (and tests) to steer a
/// running session.
#[derive(Clone)]
pub struct ControlHandle {
    tx: UnboundedSender<Control>,
}

impl ControlHandle {
    /// Request a statistics dump.
    pub fn dump_stats(&self) {
        let _ = self.tx.send(Control::DumpStats);
    }

    /// Request graceful termination.
    pub fn quit(&self) {
        let _ = self.tx.send(Control::Quit);
    }
}

/// A constructed, running audio link session.
pub struct AudioLink {
    role: Role,
    engine: Box<dyn TransportEngine>,
    media: MediaStage,
    links: LinkManager,
    events: UnboundedReceiver<EngineEvent>,
    control_rx: UnboundedReceiver<Control>,
    control_tx: UnboundedSender<Control>,
    stopped: bool,
}

impl std::fmt::Debug for AudioLink {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AudioLink")
            .field("role", &self.role)
            .field("stopped", &self.stopped)
            .finish_non_exhaustive()
    }
}

impl AudioLink {
    /// Build the role-specific topology and bring the engine up.
    ///
    /// The engine is started only after the negotiator and the bin
    /// factory are registered: the engine requests retransmission
    /// bins while it creates its own flows. On failure everything
    /// already built is torn down before the error returns.
    pub fn start(
        role: Role,
        config: &Config,
        mut engine: Box<dyn TransportEngine>,
        backend: Box<dyn AudioBackend>,
    ) -> Result<Self, ConstructionError> {
        let payload = Arc::new(PayloadDescriptor::opaque_audio());

        let media = match role {
            Role::Receive => MediaStage::receive(config, backend)?,
            Role::Send => MediaStage::send(config, backend)?,
        };

        let settings = match EngineSettings::from_config(role, config, payload.clone()) {
            Ok(settings) => settings,
            Err(e) => {
                media.teardown();
                return Err(e);
            }
        };
        if let Err(e) = engine.configure(&settings) {
            media.teardown();
            return Err(e);
        }

        let (event_tx, events) = mpsc::unbounded_channel();
        engine.set_callbacks(EngineCallbacks {
            pt_map: PtMap::new(payload),
            rtx_factory: Arc::new(RtxBinFactory::new()),
            events: event_tx,
        });
        if let Err(e) = engine.start() {
            engine.stop();
            media.teardown();
            return Err(e);
        }

        let links = LinkManager::new(media.clone(), engine.send_rtp_sink());
        let (control_tx, control_rx) = mpsc::unbounded_channel();
        info!("session started in {:?} role", role);

        Ok(Self {
            role,
            engine,
            media,
            links,
            events,
            control_rx,
            control_tx,
            stopped: false,
        })
    }

    /// Handle for steering the running session.
    pub fn control(&self) -> ControlHandle {
        ControlHandle {
            tx: self.control_tx.clone(),
        }
    }

    /// The media stage of this session.
    pub fn media(&self) -> &MediaStage {
        &self.media
    }

    /// Run the event loop until termination.
    ///
    /// Engine events are drained ahead of control commands so a
    /// quit arriving behind a burst of lifecycle events still
    /// observes them in order.
    pub async fn run(&mut self) -> ExitReason {
        if self.role == Role::Send {
            // The send chain produces data as soon as the graph is
            // up; the receive chain waits for its first producer.
            self.media.set_state(StageState::Playing);
        }

        let events = &mut self.events;
        let control = &mut self.control_rx;
        let links = &mut self.links;
        let engine = &self.engine;

        loop {
            tokio::select! {
                biased;
                event = events.recv() => match event {
                    Some(EngineEvent::FlowAppeared { pad }) => links.flow_appeared(&pad),
                    Some(EngineEvent::FlowRemoved { pad }) => links.flow_removed(&pad),
                    Some(EngineEvent::Error { source, message, detail }) => {
                        error!("Error received from element {}: {}", source, message);
                        error!(
                            "Debugging information: {}",
                            detail.as_deref().unwrap_or("none")
                        );
                        return ExitReason::FatalError;
                    }
                    None => {
                        error!("transport engine event channel closed");
                        return ExitReason::FatalError;
                    }
                },
                cmd = control.recv() => match cmd {
                    Some(Control::DumpStats) => {
                        println!("Statistics: {}", engine.stats(0));
                    }
                    Some(Control::Quit) | None => return ExitReason::UserRequested,
                },
            }
        }
    }

    /// Stop the engine and the media stage and release their
    /// resources. Calling it again is a no-op.
    pub fn shutdown(&mut self) {
        if self.stopped {
            return;
        }
        self.stopped = true;
        self.engine.stop();
        self.media.teardown();
        info!("session shut down");
    }
}

impl Drop for AudioLink {
    fn drop(&mut self) {
        self.shutdown();
    }
}
