//! Chain synchronization engine.
//!
//! [`downloader::Downloader`] brings the local chain up to the heaviest
//! peer's head with staged, multi-peer retrieval. [`fetcher::Fetcher`]
//! imports blocks announced at the tip while the downloader is idle or busy
//! elsewhere. Both select and score peers through the shared
//! [`peers::PeerRegistry`] and report traffic to an [`events::EventSink`].
//!
//! Storage and the wire are collaborators: the engine talks to them through
//! [`ChainStore`] and [`Transport`].

pub mod config;
pub mod downloader;
pub mod error;
pub mod events;
pub mod fetcher;
pub mod peers;
pub mod protocol;
pub mod queue;
pub mod service;

use std::future::Future;

use alloy_primitives::B256;
use chain::{Block, BlockBody, BlockHeader, ChainError, ChainHead, ImportError, MemoryChain, Receipt};

pub use config::{FetcherConfig, SyncConfig, SyncMode};
pub use downloader::{Downloader, Phase, SegmentView, SyncOutcome, SyncReport};
pub use error::{SyncError, TransportError};
pub use events::{Category, CountingSink, Direction, Event, EventSink, MemorySink, NoopSink};
pub use fetcher::{Announcement, FetchRequest, Fetcher, FetcherInput, FetcherStats, Intake};
pub use peers::{Criteria, PeerId, PeerInfo, PeerRegistry};
pub use protocol::Protocol;
pub use service::{PeerEvent, ServiceStats, SyncService};

// ---------------------------------------------------------------------------
// Collaborator traits
// ---------------------------------------------------------------------------

/// Origin of a header request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HashOrNumber {
    Hash(B256),
    Number(u64),
}

/// Request/response access to remote peers.
///
/// Each method is one protocol round trip. Which methods a peer answers is
/// decided by its [`Protocol`]: legacy peers serve `request_hashes` and
/// `request_blocks`, header-split peers headers and bodies, state-capable
/// peers additionally receipts and node data. Deadlines are enforced by the
/// caller.
pub trait Transport: Send + Sync {
    fn request_headers(
        &self,
        peer: PeerId,
        origin: HashOrNumber,
        count: u64,
        skip: u64,
        reverse: bool,
    ) -> impl Future<Output = Result<Vec<BlockHeader>, TransportError>> + Send;

    fn request_bodies(
        &self,
        peer: PeerId,
        hashes: Vec<B256>,
    ) -> impl Future<Output = Result<Vec<BlockBody>, TransportError>> + Send;

    fn request_receipts(
        &self,
        peer: PeerId,
        hashes: Vec<B256>,
    ) -> impl Future<Output = Result<Vec<Vec<Receipt>>, TransportError>> + Send;

    fn request_node_data(
        &self,
        peer: PeerId,
        hashes: Vec<B256>,
    ) -> impl Future<Output = Result<Vec<Vec<u8>>, TransportError>> + Send;

    /// Legacy dialect: `count` canonical hashes starting at block `from`.
    fn request_hashes(
        &self,
        peer: PeerId,
        from: u64,
        count: u64,
    ) -> impl Future<Output = Result<Vec<B256>, TransportError>> + Send;

    /// Legacy dialect: full blocks by hash.
    fn request_blocks(
        &self,
        peer: PeerId,
        hashes: Vec<B256>,
    ) -> impl Future<Output = Result<Vec<Block>, TransportError>> + Send;
}

/// Local chain and state storage.
pub trait ChainStore: Send + Sync {
    fn current_head(&self) -> ChainHead;

    fn has_block(&self, hash: &B256) -> bool;

    /// Store a linked header chain. On failure the error carries the index
    /// of the first rejected header; earlier headers stay stored.
    fn insert_headers(&self, headers: &[BlockHeader]) -> Result<usize, ImportError>;

    /// Commit full blocks (with receipts when present). On failure the
    /// blocks before the error index stay committed.
    fn insert_blocks(&self, blocks: &[Block]) -> Result<usize, ImportError>;

    fn state_root_known(&self, root: &B256) -> bool;

    /// Store one state node, returning referenced nodes still missing.
    fn commit_state_node(&self, hash: B256, data: &[u8]) -> Result<Vec<B256>, ChainError>;

    /// Proof-of-work sanity check of a header before it enters a segment.
    fn verify_seal(&self, _header: &BlockHeader) -> bool {
        true
    }
}

impl ChainStore for MemoryChain {
    fn current_head(&self) -> ChainHead {
        MemoryChain::head(self)
    }

    fn has_block(&self, hash: &B256) -> bool {
        MemoryChain::has_block(self, hash)
    }

    fn insert_headers(&self, headers: &[BlockHeader]) -> Result<usize, ImportError> {
        MemoryChain::insert_headers(self, headers)
    }

    fn insert_blocks(&self, blocks: &[Block]) -> Result<usize, ImportError> {
        MemoryChain::insert_blocks(self, blocks)
    }

    fn state_root_known(&self, root: &B256) -> bool {
        MemoryChain::state_root_known(self, root)
    }

    fn commit_state_node(&self, hash: B256, data: &[u8]) -> Result<Vec<B256>, ChainError> {
        MemoryChain::commit_state_node(self, hash, data)
    }
}
