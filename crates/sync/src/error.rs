use chain::ChainError;
use thiserror::Error;

use crate::peers::PeerId;

/// Failures of a sync cycle.
///
/// Per-request failures (`Timeout`, `Malformed`, `Request`, `NoEligiblePeer`) are
/// handled inside the scheduler by retrying elsewhere; they appear here so
/// that negotiation and the fetcher can report them. Only cycle-level
/// failures and collaborator errors end a cycle.
#[derive(Debug, Error)]
pub enum SyncError {
    #[error("peer {0} timed out")]
    Timeout(PeerId),
    #[error("malformed response from {peer}: {reason}")]
    Malformed { peer: PeerId, reason: String },
    #[error("request to {peer} failed: {source}")]
    Request {
        peer: PeerId,
        #[source]
        source: TransportError,
    },
    #[error("no eligible peer")]
    NoEligiblePeer,
    #[error("no progress for {rounds} scheduling rounds")]
    CycleStalled { rounds: u32 },
    #[error("sync cycle already running")]
    AlreadySyncing,
    #[error("no peer is heavier than the local chain")]
    NothingToSync,
    #[error("sync target peer {0} lost without replacement")]
    TargetLost(PeerId),
    #[error("import of block {number} failed: {reason}")]
    Import { number: u64, reason: String },
    #[error("chain error: {0}")]
    Chain(#[from] ChainError),
}

impl SyncError {
    /// Whether the error is attributable to a single peer's behaviour.
    pub fn is_peer_fault(&self) -> bool {
        matches!(
            self,
            SyncError::Timeout(_) | SyncError::Malformed { .. } | SyncError::Request { .. }
        )
    }
}

/// Errors surfaced by the transport collaborator for one request.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum TransportError {
    #[error("request timed out")]
    Timeout,
    #[error("peer disconnected")]
    Disconnected,
    #[error("request not supported by protocol: {0}")]
    Unsupported(&'static str),
    #[error("transport error: {0}")]
    Other(String),
}
