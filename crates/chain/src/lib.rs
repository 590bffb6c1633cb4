pub mod memory;
pub mod trie;
pub mod types;

use alloy_primitives::{B256, U256};
use thiserror::Error;

pub use memory::MemoryChain;
pub use types::{Block, BlockBody, BlockHeader, Receipt};

/// The local chain tip: hash, number and cumulative difficulty.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChainHead {
    pub hash: B256,
    pub number: u64,
    pub td: U256,
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ChainError {
    #[error("unknown parent {0}")]
    UnknownParent(B256),
    #[error("unknown state node {0}")]
    UnknownNode(B256),
    #[error("state node hash mismatch: expected {expected}, got {got}")]
    NodeMismatch { expected: B256, got: B256 },
    #[error("storage error: {0}")]
    Storage(String),
}

/// A batch import that stopped part-way. Entries before `index` were committed.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
#[error("import failed at index {index}: {reason}")]
pub struct ImportError {
    pub index: usize,
    pub reason: String,
}
