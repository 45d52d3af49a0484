//! Error types for the coordination core

use crate::channel::ChannelId;

/// Lifecycle misuse of a [`StateCoordinator`](crate::coordinator::StateCoordinator)
#[derive(Debug, thiserror::Error)]
pub enum CoordinatorError {
    #[error("coordinator loop already started")]
    AlreadyStarted,
    #[error("coordinator has been shut down")]
    ShutDown,
    #[error("no tokio runtime available to run the coordinator loop")]
    NoRuntime,
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),
    #[error("coordinator loop terminated abnormally: {0}")]
    LoopFailed(String),
}

/// Misuse of a [`ClientChannel`](crate::channel::ClientChannel)
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum ChannelError {
    #[error("channel {0} is closed")]
    Closed(ChannelId),
}

/// Failure reported by game logic from a reconciliation or advance step
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum PolicyError {
    #[error("proposal from channel {channel} rejected: {reason}")]
    Rejected { channel: ChannelId, reason: String },
    #[error("{0}")]
    Failed(String),
}

impl PolicyError {
    pub fn failed(reason: impl Into<String>) -> Self {
        Self::Failed(reason.into())
    }
}

/// Why a tick was aborted. The authoritative state is left as it was
/// before the tick.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum TickError {
    #[error("tick {tick}: reconciliation failed: {source}")]
    Reconcile {
        tick: u64,
        #[source]
        source: PolicyError,
    },
    #[error("tick {tick}: autonomous advance failed: {source}")]
    Advance {
        tick: u64,
        #[source]
        source: PolicyError,
    },
    #[error("tick {tick}: {stage} panicked: {message}")]
    Panicked {
        tick: u64,
        stage: TickStage,
        message: String,
    },
}

impl TickError {
    /// Number of the tick that was being produced
    pub fn tick(&self) -> u64 {
        match self {
            Self::Reconcile { tick, .. } | Self::Advance { tick, .. } | Self::Panicked { tick, .. } => {
                *tick
            }
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TickStage {
    Reconcile,
    Advance,
}

impl std::fmt::Display for TickStage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Reconcile => write!(f, "reconciliation policy"),
            Self::Advance => write!(f, "autonomous advancer"),
        }
    }
}
