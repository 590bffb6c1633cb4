use std::collections::{BTreeMap, HashMap};

use alloy_primitives::{B256, U256};
use parking_lot::RwLock;
use tracing::{debug, info};

use crate::trie::empty_trie_hash;
use crate::types::{keccak256, receipts_match, Block, BlockBody, BlockHeader, Receipt};
use crate::{ChainError, ChainHead, ImportError};

/// Extracts the hashes a state node references. The chain store does not
/// interpret trie encodings itself; the owner of the state format supplies this.
pub type NodeResolver = fn(&[u8]) -> Vec<B256>;

fn no_children(_: &[u8]) -> Vec<B256> {
    Vec::new()
}

struct StoredHeader {
    header: BlockHeader,
    td: U256,
}

struct Inner {
    headers: HashMap<B256, StoredHeader>,
    bodies: HashMap<B256, BlockBody>,
    receipts: HashMap<B256, Vec<Receipt>>,
    /// Canonical block chain, number -> hash.
    canonical: BTreeMap<u64, B256>,
    head: ChainHead,
    state: HashMap<B256, Vec<u8>>,
}

/// In-memory chain store.
///
/// Tracks a header tree with total difficulty per header, the subset of
/// blocks whose bodies are known, the canonical chain (heaviest known block)
/// and a content-addressed state node store.
pub struct MemoryChain {
    inner: RwLock<Inner>,
    resolver: NodeResolver,
}

impl MemoryChain {
    /// Create a chain seeded with `genesis` as its only block.
    pub fn new(genesis: BlockHeader) -> Self {
        let hash = genesis.hash();
        let head = ChainHead {
            hash,
            number: genesis.number,
            td: genesis.difficulty,
        };
        let mut canonical = BTreeMap::new();
        canonical.insert(genesis.number, hash);
        let mut headers = HashMap::new();
        headers.insert(
            hash,
            StoredHeader {
                td: genesis.difficulty,
                header: genesis,
            },
        );
        let mut bodies = HashMap::new();
        bodies.insert(hash, BlockBody::default());

        info!(number = head.number, hash = %hash, "chain store initialized");
        Self {
            inner: RwLock::new(Inner {
                headers,
                bodies,
                receipts: HashMap::new(),
                canonical,
                head,
                state: HashMap::new(),
            }),
            resolver: no_children,
        }
    }

    /// Use `resolver` to find the children of committed state nodes.
    pub fn with_resolver(mut self, resolver: NodeResolver) -> Self {
        self.resolver = resolver;
        self
    }

    pub fn head(&self) -> ChainHead {
        self.inner.read().head
    }

    pub fn has_block(&self, hash: &B256) -> bool {
        self.inner.read().bodies.contains_key(hash)
    }

    pub fn has_header(&self, hash: &B256) -> bool {
        self.inner.read().headers.contains_key(hash)
    }

    pub fn header(&self, hash: &B256) -> Option<BlockHeader> {
        self.inner.read().headers.get(hash).map(|s| s.header.clone())
    }

    pub fn total_difficulty(&self, hash: &B256) -> Option<U256> {
        self.inner.read().headers.get(hash).map(|s| s.td)
    }

    pub fn canonical_hash(&self, number: u64) -> Option<B256> {
        self.inner.read().canonical.get(&number).copied()
    }

    pub fn header_by_number(&self, number: u64) -> Option<BlockHeader> {
        let inner = self.inner.read();
        let hash = inner.canonical.get(&number)?;
        inner.headers.get(hash).map(|s| s.header.clone())
    }

    pub fn body(&self, hash: &B256) -> Option<BlockBody> {
        self.inner.read().bodies.get(hash).cloned()
    }

    pub fn block(&self, hash: &B256) -> Option<Block> {
        let inner = self.inner.read();
        let header = inner.headers.get(hash)?.header.clone();
        let body = inner.bodies.get(hash)?.clone();
        Some(Block {
            header,
            body,
            receipts: inner.receipts.get(hash).cloned(),
        })
    }

    pub fn receipts(&self, hash: &B256) -> Option<Vec<Receipt>> {
        self.inner.read().receipts.get(hash).cloned()
    }

    /// Insert a header chain. Already-known headers are skipped.
    ///
    /// Returns the number of headers processed. On failure, headers before the
    /// failing index remain stored.
    pub fn insert_headers(&self, headers: &[BlockHeader]) -> Result<usize, ImportError> {
        let mut inner = self.inner.write();
        for (index, header) in headers.iter().enumerate() {
            let hash = header.hash();
            if inner.headers.contains_key(&hash) {
                continue;
            }
            let parent_td = match inner.headers.get(&header.parent_hash) {
                Some(parent) if parent.header.number + 1 == header.number => parent.td,
                Some(_) => {
                    return Err(ImportError {
                        index,
                        reason: format!("non-sequential number {}", header.number),
                    })
                }
                None => {
                    return Err(ImportError {
                        index,
                        reason: ChainError::UnknownParent(header.parent_hash).to_string(),
                    })
                }
            };
            inner.headers.insert(
                hash,
                StoredHeader {
                    header: header.clone(),
                    td: parent_td + header.difficulty,
                },
            );
        }
        Ok(headers.len())
    }

    /// Insert full blocks, each of which must extend a known block.
    ///
    /// The canonical head moves to the heaviest inserted block. On failure,
    /// blocks before the failing index remain committed.
    pub fn insert_blocks(&self, blocks: &[Block]) -> Result<usize, ImportError> {
        let mut inner = self.inner.write();
        for (index, block) in blocks.iter().enumerate() {
            let header = &block.header;
            let hash = header.hash();
            if !inner.bodies.contains_key(&header.parent_hash) {
                return Err(ImportError {
                    index,
                    reason: ChainError::UnknownParent(header.parent_hash).to_string(),
                });
            }
            if !block.body.matches(header) {
                return Err(ImportError {
                    index,
                    reason: format!("body does not match header {}", header.number),
                });
            }
            if let Some(receipts) = &block.receipts {
                if !receipts_match(receipts, header) {
                    return Err(ImportError {
                        index,
                        reason: format!("receipts do not match header {}", header.number),
                    });
                }
            }

            let parent_td = match inner.headers.get(&header.parent_hash) {
                Some(parent) => parent.td,
                None => {
                    return Err(ImportError {
                        index,
                        reason: ChainError::UnknownParent(header.parent_hash).to_string(),
                    })
                }
            };
            let td = parent_td + header.difficulty;
            inner.headers.insert(
                hash,
                StoredHeader {
                    header: header.clone(),
                    td,
                },
            );
            inner.bodies.insert(hash, block.body.clone());
            if let Some(receipts) = &block.receipts {
                inner.receipts.insert(hash, receipts.clone());
            }

            if td > inner.head.td {
                if inner.head.hash != header.parent_hash {
                    debug!(old = %inner.head.hash, new = %hash, number = header.number, "canonical chain reorganized");
                }
                set_canonical_head(&mut inner, hash, header.number, td);
            }
        }
        Ok(blocks.len())
    }

    pub fn state_root_known(&self, root: &B256) -> bool {
        *root == empty_trie_hash() || self.inner.read().state.contains_key(root)
    }

    pub fn state_node(&self, hash: &B256) -> Option<Vec<u8>> {
        self.inner.read().state.get(hash).cloned()
    }

    /// Store a state node and return the children it references that are not yet stored.
    pub fn commit_state_node(&self, hash: B256, data: &[u8]) -> Result<Vec<B256>, ChainError> {
        let got = keccak256(data);
        if got != hash {
            return Err(ChainError::NodeMismatch {
                expected: hash,
                got,
            });
        }
        let children = (self.resolver)(data);
        let mut inner = self.inner.write();
        inner.state.insert(hash, data.to_vec());
        Ok(children
            .into_iter()
            .filter(|child| !inner.state.contains_key(child))
            .collect())
    }
}

/// Rewrite the canonical index so that it ends at `hash`.
fn set_canonical_head(inner: &mut Inner, hash: B256, number: u64, td: U256) {
    let stale: Vec<u64> = inner.canonical.range(number + 1..).map(|(n, _)| *n).collect();
    for n in stale {
        inner.canonical.remove(&n);
    }

    let mut cursor = hash;
    let mut cursor_number = number;
    loop {
        if inner.canonical.get(&cursor_number) == Some(&cursor) {
            break;
        }
        inner.canonical.insert(cursor_number, cursor);
        let Some(stored) = inner.headers.get(&cursor) else {
            break;
        };
        if cursor_number == 0 {
            break;
        }
        cursor = stored.header.parent_hash;
        cursor_number -= 1;
    }

    inner.head = ChainHead { hash, number, td };
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::trie::ordered_trie_root;

    fn genesis() -> BlockHeader {
        BlockHeader {
            difficulty: U256::from(1000),
            ..BlockHeader::default()
        }
    }

    fn child(parent: &BlockHeader, difficulty: u64, salt: u8) -> BlockHeader {
        BlockHeader {
            parent_hash: parent.hash(),
            number: parent.number + 1,
            difficulty: U256::from(difficulty),
            extra_data: vec![salt],
            timestamp: parent.timestamp + 14,
            ..BlockHeader::default()
        }
    }

    fn empty_block(header: BlockHeader) -> Block {
        Block::new(header, BlockBody::default())
    }

    #[test]
    fn insert_blocks_advances_head() {
        let g = genesis();
        let chain = MemoryChain::new(g.clone());
        let h1 = child(&g, 100, 0);
        let h2 = child(&h1, 100, 0);

        let imported = chain
            .insert_blocks(&[empty_block(h1.clone()), empty_block(h2.clone())])
            .unwrap();
        assert_eq!(imported, 2);

        let head = chain.head();
        assert_eq!(head.number, 2);
        assert_eq!(head.hash, h2.hash());
        assert_eq!(head.td, U256::from(1200));
        assert_eq!(chain.canonical_hash(1), Some(h1.hash()));
    }

    #[test]
    fn partial_import_reports_failure_index() {
        let g = genesis();
        let chain = MemoryChain::new(g.clone());
        let h1 = child(&g, 100, 0);
        let h2 = child(&h1, 100, 0);
        let bad = Block::new(
            h2,
            BlockBody {
                transactions: vec![vec![1, 2, 3]],
                uncles: vec![],
            },
        );

        let err = chain
            .insert_blocks(&[empty_block(h1.clone()), bad])
            .unwrap_err();
        assert_eq!(err.index, 1);
        assert_eq!(chain.head().hash, h1.hash());
    }

    #[test]
    fn heavier_fork_becomes_canonical() {
        let g = genesis();
        let chain = MemoryChain::new(g.clone());
        let a1 = child(&g, 100, 1);
        let a2 = child(&a1, 100, 1);
        chain
            .insert_blocks(&[empty_block(a1), empty_block(a2.clone())])
            .unwrap();

        let b1 = child(&g, 500, 2);
        chain.insert_blocks(&[empty_block(b1.clone())]).unwrap();

        let head = chain.head();
        assert_eq!(head.hash, b1.hash());
        assert_eq!(head.number, 1);
        assert_eq!(chain.canonical_hash(2), None);
        assert!(chain.has_block(&a2.hash()));
    }

    #[test]
    fn insert_headers_requires_linkage() {
        let g = genesis();
        let chain = MemoryChain::new(g.clone());
        let h1 = child(&g, 100, 0);
        let orphan = child(&child(&h1, 100, 0), 100, 0);

        let err = chain.insert_headers(&[h1.clone(), orphan]).unwrap_err();
        assert_eq!(err.index, 1);
        assert!(chain.has_header(&h1.hash()));
        assert!(!chain.has_block(&h1.hash()));
    }

    #[test]
    fn receipts_checked_against_root() {
        let g = genesis();
        let chain = MemoryChain::new(g.clone());
        let receipts = vec![vec![0xc1, 0x01]];
        let mut h1 = child(&g, 100, 0);
        h1.receipts_root = ordered_trie_root(&receipts);

        let mut block = empty_block(h1);
        block.receipts = Some(vec![vec![0xc1, 0x02]]);
        assert!(chain.insert_blocks(std::slice::from_ref(&block)).is_err());

        block.receipts = Some(receipts);
        assert_eq!(chain.insert_blocks(&[block]).unwrap(), 1);
    }

    #[test]
    fn state_nodes_report_missing_children() {
        fn resolver(data: &[u8]) -> Vec<B256> {
            data.chunks_exact(32).map(B256::from_slice).collect()
        }
        let chain = MemoryChain::new(genesis()).with_resolver(resolver);

        let leaf = vec![0x01, 0x02];
        let leaf_hash = keccak256(&leaf);
        let root = leaf_hash.to_vec();
        let root_hash = keccak256(&root);

        assert!(!chain.state_root_known(&root_hash));
        let missing = chain.commit_state_node(root_hash, &root).unwrap();
        assert_eq!(missing, vec![leaf_hash]);
        assert!(chain.commit_state_node(leaf_hash, &leaf).unwrap().is_empty());
        assert!(chain.state_root_known(&root_hash));

        let err = chain.commit_state_node(root_hash, &leaf).unwrap_err();
        assert!(matches!(err, ChainError::NodeMismatch { .. }));
    }
}
