//! Simulated peer network.
//!
//! A [`SimNetwork`] is a generated canonical chain plus a state trie at its
//! head, shared by a set of [`SimPeer`]s. [`SimTransport`] serves the chain
//! to the sync engine with per-peer latency and misbehaviour.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use alloy_primitives::{B256, U256};
use chain::trie::ordered_trie_root;
use chain::types::keccak256;
use chain::{Block, BlockBody, BlockHeader, Receipt};
use parking_lot::Mutex;
use rand::rngs::StdRng;
use rand::Rng;
use sync::{HashOrNumber, PeerId, Protocol, Transport, TransportError};
use tracing::{debug, trace};

use crate::config::RuntimeConfig;

/// Branch nodes under the state root; each has the same number of leaves.
const STATE_FAN_OUT: usize = 8;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PeerKind {
    /// Serves correct data, occasionally leaving a request unanswered.
    Honest,
    /// Breaks header linkage and tampers with bodies, receipts and state.
    Malicious,
    /// Answers single-header lookups, never bulk requests.
    Stalling,
}

#[derive(Debug, Clone)]
pub struct SimPeer {
    pub id: PeerId,
    pub kind: PeerKind,
    pub protocol: Protocol,
}

/// Children of a simulated state node: a count byte followed by that many
/// 32-byte hashes, then payload.
pub fn node_children(data: &[u8]) -> Vec<B256> {
    let Some((&count, rest)) = data.split_first() else {
        return Vec::new();
    };
    rest.chunks_exact(32)
        .take(count as usize)
        .map(B256::from_slice)
        .collect()
}

fn encode_node(children: &[B256], payload: &[u8]) -> Vec<u8> {
    let mut data = Vec::with_capacity(1 + children.len() * 32 + payload.len());
    data.push(children.len() as u8);
    for child in children {
        data.extend_from_slice(child.as_slice());
    }
    data.extend_from_slice(payload);
    data
}

pub struct SimNetwork {
    blocks: Vec<Block>,
    tds: Vec<U256>,
    by_hash: HashMap<B256, usize>,
    state: HashMap<B256, Vec<u8>>,
    state_root: B256,
    peers: Vec<SimPeer>,
}

impl SimNetwork {
    /// Generate a chain of `chain_length + tip_blocks` blocks on top of the
    /// default genesis, and the peer set described by `config`.
    pub fn generate(config: &RuntimeConfig, rng: &mut StdRng) -> Self {
        let (state, state_root) = generate_state(rng);

        let genesis = BlockHeader::default();
        let mut blocks = vec![Block::new(genesis.clone(), BlockBody::default())];
        let mut tds = vec![genesis.difficulty];
        let total = config.chain_length + config.tip_blocks;
        for number in 1..=total {
            let parent = &blocks[blocks.len() - 1].header;
            let mut header = BlockHeader {
                parent_hash: parent.hash(),
                number,
                difficulty: U256::from(rng.gen_range(100u64..200)),
                timestamp: number * 13,
                gas_limit: 8_000_000,
                state_root,
                extra_data: b"vec-sim".to_vec(),
                ..BlockHeader::default()
            };
            let mut body = BlockBody::default();
            let mut receipts: Vec<Receipt> = Vec::new();
            if config.tx_every > 0 && number % config.tx_every == 0 {
                let count = rng.gen_range(1..=4);
                for _ in 0..count {
                    let len = rng.gen_range(16..96);
                    body.transactions.push((0..len).map(|_| rng.gen()).collect());
                    receipts.push((0..32).map(|_| rng.gen()).collect());
                }
                header.transactions_root = ordered_trie_root(&body.transactions);
                header.receipts_root = ordered_trie_root(&receipts);
                header.gas_used = 21_000 * count as u64;
            }
            tds.push(tds[tds.len() - 1] + header.difficulty);
            blocks.push(Block {
                header,
                body,
                receipts: Some(receipts),
            });
        }

        let by_hash = blocks.iter().enumerate().map(|(i, b)| (b.hash(), i)).collect();
        let peers = generate_peers(config, rng);
        debug!(blocks = blocks.len(), peers = peers.len(), state_nodes = state.len(), "generated network");
        Self {
            blocks,
            tds,
            by_hash,
            state,
            state_root,
            peers,
        }
    }

    pub fn genesis(&self) -> &BlockHeader {
        &self.blocks[0].header
    }

    pub fn block(&self, number: u64) -> Option<&Block> {
        self.blocks.get(number as usize)
    }

    pub fn td(&self, number: u64) -> Option<U256> {
        self.tds.get(number as usize).copied()
    }

    pub fn state_root(&self) -> B256 {
        self.state_root
    }

    pub fn state_nodes(&self) -> usize {
        self.state.len()
    }

    pub fn peers(&self) -> &[SimPeer] {
        &self.peers
    }

    pub fn peer(&self, id: &PeerId) -> Option<&SimPeer> {
        self.peers.iter().find(|p| p.id == *id)
    }

    fn by_hash(&self, hash: &B256) -> Option<&Block> {
        self.by_hash.get(hash).map(|&i| &self.blocks[i])
    }
}

fn generate_state(rng: &mut StdRng) -> (HashMap<B256, Vec<u8>>, B256) {
    let mut state = HashMap::new();
    let mut branches = Vec::with_capacity(STATE_FAN_OUT);
    for _ in 0..STATE_FAN_OUT {
        let mut leaves = Vec::with_capacity(STATE_FAN_OUT);
        for _ in 0..STATE_FAN_OUT {
            let payload: Vec<u8> = (0..64).map(|_| rng.gen()).collect();
            let leaf = encode_node(&[], &payload);
            let hash = keccak256(&leaf);
            state.insert(hash, leaf);
            leaves.push(hash);
        }
        let branch = encode_node(&leaves, &[]);
        let hash = keccak256(&branch);
        state.insert(hash, branch);
        branches.push(hash);
    }
    let root = encode_node(&branches, &[]);
    let root_hash = keccak256(&root);
    state.insert(root_hash, root);
    (state, root_hash)
}

fn generate_peers(config: &RuntimeConfig, rng: &mut StdRng) -> Vec<SimPeer> {
    let mut peers = Vec::with_capacity(config.total_peers());
    let mut push = |kind: PeerKind, protocol: Protocol, rng: &mut StdRng| {
        let mut id = [0u8; 64];
        rng.fill(&mut id[..]);
        peers.push(SimPeer {
            id: PeerId(id),
            kind,
            protocol,
        });
    };
    for i in 0..config.honest_peers {
        let protocol = if i < config.legacy_peers {
            Protocol::Legacy
        } else {
            Protocol::StateCapable
        };
        push(PeerKind::Honest, protocol, rng);
    }
    for _ in 0..config.malicious_peers {
        push(PeerKind::Malicious, Protocol::StateCapable, rng);
    }
    for _ in 0..config.stalling_peers {
        push(PeerKind::Stalling, Protocol::StateCapable, rng);
    }
    peers
}

// ---------------------------------------------------------------------------
// Transport
// ---------------------------------------------------------------------------

pub struct SimTransport {
    network: Arc<SimNetwork>,
    latency: Duration,
    jitter_ms: u64,
    stall_probability: f64,
    rng: Mutex<StdRng>,
}

impl SimTransport {
    pub fn new(network: Arc<SimNetwork>, config: &RuntimeConfig, rng: StdRng) -> Self {
        Self {
            network,
            latency: Duration::from_millis(config.latency_ms),
            jitter_ms: config.jitter_ms,
            stall_probability: config.stall_probability,
            rng: Mutex::new(rng),
        }
    }

    /// Wait out the peer's response time. Returns how the peer behaves, or
    /// never returns if the request goes unanswered.
    async fn respond(&self, peer: PeerId, bulk: bool, what: &'static str) -> Result<PeerKind, TransportError> {
        let sim = self
            .network
            .peer(&peer)
            .ok_or(TransportError::Disconnected)?;
        let kind = sim.kind;
        let (delay, stalled) = {
            let mut rng = self.rng.lock();
            let jitter = rng.gen_range(0..=self.jitter_ms);
            (
                self.latency + Duration::from_millis(jitter),
                rng.gen_bool(self.stall_probability),
            )
        };
        if (kind == PeerKind::Stalling && bulk) || (kind == PeerKind::Honest && stalled) {
            trace!(peer = %peer, what, "request left unanswered");
            return std::future::pending().await;
        }
        tokio::time::sleep(delay).await;
        Ok(kind)
    }

    fn protocol(&self, peer: &PeerId) -> Result<Protocol, TransportError> {
        self.network
            .peer(peer)
            .map(|p| p.protocol)
            .ok_or(TransportError::Disconnected)
    }
}

impl Transport for SimTransport {
    async fn request_headers(
        &self,
        peer: PeerId,
        origin: HashOrNumber,
        count: u64,
        skip: u64,
        reverse: bool,
    ) -> Result<Vec<BlockHeader>, TransportError> {
        if !self.protocol(&peer)?.serves_headers() {
            return Err(TransportError::Unsupported("headers"));
        }
        let kind = self.respond(peer, count > 1, "headers").await?;
        let network = &self.network;
        let start = match origin {
            HashOrNumber::Number(n) => n,
            HashOrNumber::Hash(hash) => match network.by_hash(&hash) {
                Some(block) => block.number(),
                None => return Ok(Vec::new()),
            },
        };
        let step = skip + 1;
        let mut headers = Vec::with_capacity(count as usize);
        let mut number = Some(start);
        while let Some(n) = number {
            if headers.len() as u64 >= count {
                break;
            }
            let Some(block) = network.block(n) else { break };
            headers.push(block.header.clone());
            number = if reverse { n.checked_sub(step) } else { n.checked_add(step) };
        }
        if kind == PeerKind::Malicious && headers.len() > 1 {
            headers[1].parent_hash = B256::repeat_byte(0xba);
        }
        Ok(headers)
    }

    async fn request_bodies(&self, peer: PeerId, hashes: Vec<B256>) -> Result<Vec<BlockBody>, TransportError> {
        if !self.protocol(&peer)?.serves_bodies() {
            return Err(TransportError::Unsupported("bodies"));
        }
        let kind = self.respond(peer, true, "bodies").await?;
        let mut bodies: Vec<BlockBody> = hashes
            .iter()
            .filter_map(|h| self.network.by_hash(h).map(|b| b.body.clone()))
            .collect();
        if kind == PeerKind::Malicious {
            for body in &mut bodies {
                body.transactions.push(vec![0xde, 0xad]);
            }
        }
        Ok(bodies)
    }

    async fn request_receipts(
        &self,
        peer: PeerId,
        hashes: Vec<B256>,
    ) -> Result<Vec<Vec<Receipt>>, TransportError> {
        if !self.protocol(&peer)?.serves_receipts() {
            return Err(TransportError::Unsupported("receipts"));
        }
        let kind = self.respond(peer, true, "receipts").await?;
        let mut receipts: Vec<Vec<Receipt>> = hashes
            .iter()
            .filter_map(|h| {
                self.network
                    .by_hash(h)
                    .map(|b| b.receipts.clone().unwrap_or_default())
            })
            .collect();
        if kind == PeerKind::Malicious {
            for list in &mut receipts {
                list.push(vec![0xde, 0xad]);
            }
        }
        Ok(receipts)
    }

    async fn request_node_data(&self, peer: PeerId, hashes: Vec<B256>) -> Result<Vec<Vec<u8>>, TransportError> {
        if !self.protocol(&peer)?.serves_state() {
            return Err(TransportError::Unsupported("node data"));
        }
        let kind = self.respond(peer, true, "node data").await?;
        let mut nodes: Vec<Vec<u8>> = hashes
            .iter()
            .filter_map(|h| self.network.state.get(h).cloned())
            .collect();
        if kind == PeerKind::Malicious {
            for node in &mut nodes {
                node.push(0xff);
            }
        }
        Ok(nodes)
    }

    async fn request_hashes(&self, peer: PeerId, from: u64, count: u64) -> Result<Vec<B256>, TransportError> {
        if !self.protocol(&peer)?.serves_hashes() {
            return Err(TransportError::Unsupported("hashes"));
        }
        self.respond(peer, count > 1, "hashes").await?;
        Ok((from..from.saturating_add(count))
            .map_while(|n| self.network.block(n).map(Block::hash))
            .collect())
    }

    async fn request_blocks(&self, peer: PeerId, hashes: Vec<B256>) -> Result<Vec<Block>, TransportError> {
        if !self.protocol(&peer)?.serves_hashes() {
            return Err(TransportError::Unsupported("blocks"));
        }
        self.respond(peer, hashes.len() > 1, "blocks").await?;
        Ok(hashes
            .iter()
            .filter_map(|h| {
                self.network
                    .by_hash(h)
                    .map(|b| Block::new(b.header.clone(), b.body.clone()))
            })
            .collect())
    }
}
