//! Error types for the audio link.

use thiserror::Error;

/// Invalid or contradictory startup options.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum ConfigError {
    /// Exactly one of --send / --receive must be given.
    #[error("--receive or --send must be specified (but not both)")]
    RoleConflict,
}

/// A sub-graph or attachment point could not be built.
///
/// Carries the identity of the failing component so the operator
/// knows which part of the topology to look at.
#[derive(Debug, Error)]
#[error("constructing {component} failed: {reason}")]
pub struct ConstructionError {
    /// Name of the component that failed to build
    pub component: &'static str,
    /// Diagnostic detail
    pub reason: String,
}

impl ConstructionError {
    /// Create a construction error for the named component.
    pub fn new(component: &'static str, reason: impl Into<String>) -> Self {
        Self {
            component,
            reason: reason.into(),
        }
    }
}

/// Why the run loop terminated.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExitReason {
    /// A termination signal was received
    UserRequested,
    /// The transport engine reported an unrecoverable failure
    FatalError,
}

impl ExitReason {
    /// Process exit code. 0 is reserved for user-requested termination.
    pub fn code(&self) -> i32 {
        match self {
            ExitReason::UserRequested => 0,
            ExitReason::FatalError => 1,
        }
    }
}
