#![allow(dead_code)]

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;
use std::time::Duration;

use alloy_primitives::{B256, U256};
use chain::trie::ordered_trie_root;
use chain::types::keccak256;
use chain::{Block, BlockBody, BlockHeader, Receipt};
use sync::{HashOrNumber, PeerId, Transport, TransportError};

pub fn peer_id(n: u8) -> PeerId {
    let mut bytes = [0u8; 64];
    bytes[0] = n;
    PeerId(bytes)
}

/// Total difficulty of block `n` of [`build_chain`].
pub fn td_at(n: u64) -> U256 {
    U256::from(10 * n)
}

/// Canonical chain of `len` blocks on top of the default genesis. Every
/// `tx_every`-th block carries one transaction and one receipt; the rest
/// are empty.
pub fn build_chain(len: u64, tx_every: u64) -> Vec<Block> {
    let mut blocks = vec![Block::new(BlockHeader::default(), BlockBody::default())];
    for n in 1..=len {
        let parent = &blocks[n as usize - 1].header;
        let mut header = BlockHeader {
            parent_hash: parent.hash(),
            number: n,
            difficulty: U256::from(10),
            timestamp: n,
            ..BlockHeader::default()
        };
        let mut body = BlockBody::default();
        let mut receipts: Vec<Receipt> = Vec::new();
        if tx_every > 0 && n % tx_every == 0 {
            body.transactions = vec![vec![0xf0, n as u8, (n >> 8) as u8]];
            receipts = vec![vec![0xc0, n as u8]];
            header.transactions_root = ordered_trie_root(&body.transactions);
            header.receipts_root = ordered_trie_root(&receipts);
        }
        blocks.push(Block {
            header,
            body,
            receipts: Some(receipts),
        });
    }
    blocks
}

/// State node format used by the tests: a count byte followed by that many
/// 32-byte child hashes, then arbitrary payload.
pub fn node_children(data: &[u8]) -> Vec<B256> {
    let Some(&count) = data.first() else {
        return Vec::new();
    };
    data[1..]
        .chunks_exact(32)
        .take(count as usize)
        .map(B256::from_slice)
        .collect()
}

pub fn node(children: &[&[u8]], payload: u8) -> Vec<u8> {
    let mut data = vec![children.len() as u8];
    for child in children {
        data.extend_from_slice(keccak256(child).as_slice());
    }
    data.push(payload);
    data
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum Behaviour {
    #[default]
    Honest,
    /// Header ranges come back with a broken parent link.
    CorruptHeaders,
    /// Answers single-header lookups only; everything else hangs.
    SilentAfterHandshake,
    /// Never answers body requests.
    SilentBodies,
    /// Header ranges are a forged but internally linked fork that starts
    /// on the real parent of the first requested header.
    ForgedRanges,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Request {
    Headers { origin: HashOrNumber, count: u64 },
    Bodies(Vec<B256>),
    Receipts(Vec<B256>),
    Nodes(Vec<B256>),
    Hashes { from: u64, count: u64 },
    Blocks(Vec<B256>),
}

#[derive(Debug, Clone)]
pub struct Recorded {
    pub peer: PeerId,
    pub request: Request,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
enum Key {
    Headers(u64),
    Body(B256),
    Receipt(B256),
    Node(B256),
}

/// A relinked copy of `headers` with different timestamps.
pub fn forge(headers: &[BlockHeader]) -> Vec<BlockHeader> {
    let Some(first) = headers.first() else {
        return Vec::new();
    };
    let mut parent = first.parent_hash;
    headers
        .iter()
        .map(|h| {
            let header = BlockHeader {
                parent_hash: parent,
                timestamp: h.timestamp + 1_000,
                ..h.clone()
            };
            parent = header.hash();
            header
        })
        .collect()
}

// ---------------------------------------------------------------------------
// Mock transport
// ---------------------------------------------------------------------------

pub struct MockTransport {
    blocks: Vec<Block>,
    by_hash: HashMap<B256, usize>,
    state: HashMap<B256, Vec<u8>>,
    behaviours: Mutex<HashMap<PeerId, Behaviour>>,
    latencies: Mutex<HashMap<PeerId, Duration>>,
    requests: Mutex<Vec<Recorded>>,
    outstanding: Mutex<HashSet<Key>>,
    duplicates: AtomicUsize,
    bodies_in_flight: AtomicUsize,
    max_bodies_in_flight: AtomicUsize,
}

/// Removes its keys from the outstanding set when the request finishes or is
/// dropped by the caller.
struct Outstanding<'a> {
    transport: &'a MockTransport,
    keys: Vec<Key>,
    bodies: usize,
}

impl Drop for Outstanding<'_> {
    fn drop(&mut self) {
        let mut outstanding = self.transport.outstanding.lock().unwrap();
        for key in &self.keys {
            outstanding.remove(key);
        }
        self.transport
            .bodies_in_flight
            .fetch_sub(self.bodies, Ordering::SeqCst);
    }
}

impl MockTransport {
    pub fn new(blocks: Vec<Block>) -> Self {
        let by_hash = blocks
            .iter()
            .enumerate()
            .map(|(i, b)| (b.hash(), i))
            .collect();
        Self {
            blocks,
            by_hash,
            state: HashMap::new(),
            behaviours: Mutex::new(HashMap::new()),
            latencies: Mutex::new(HashMap::new()),
            requests: Mutex::new(Vec::new()),
            outstanding: Mutex::new(HashSet::new()),
            duplicates: AtomicUsize::new(0),
            bodies_in_flight: AtomicUsize::new(0),
            max_bodies_in_flight: AtomicUsize::new(0),
        }
    }

    pub fn with_state(mut self, nodes: Vec<Vec<u8>>) -> Self {
        for data in nodes {
            self.state.insert(keccak256(&data), data);
        }
        self
    }

    pub fn set_behaviour(&self, peer: PeerId, behaviour: Behaviour) {
        self.behaviours.lock().unwrap().insert(peer, behaviour);
    }

    pub fn set_latency(&self, peer: PeerId, latency: Duration) {
        self.latencies.lock().unwrap().insert(peer, latency);
    }

    pub fn requests(&self) -> Vec<Recorded> {
        self.requests.lock().unwrap().clone()
    }

    pub fn requests_to(&self, peer: PeerId) -> Vec<Request> {
        self.requests()
            .into_iter()
            .filter(|r| r.peer == peer)
            .map(|r| r.request)
            .collect()
    }

    /// Times a request key was issued while already outstanding.
    pub fn duplicates(&self) -> usize {
        self.duplicates.load(Ordering::SeqCst)
    }

    pub fn max_bodies_in_flight(&self) -> usize {
        self.max_bodies_in_flight.load(Ordering::SeqCst)
    }

    fn begin(&self, peer: PeerId, request: Request) -> Behaviour {
        self.requests.lock().unwrap().push(Recorded { peer, request });
        self.behaviours
            .lock()
            .unwrap()
            .get(&peer)
            .copied()
            .unwrap_or_default()
    }

    fn track(&self, keys: Vec<Key>, bodies: usize) -> Outstanding<'_> {
        {
            let mut outstanding = self.outstanding.lock().unwrap();
            for key in &keys {
                if !outstanding.insert(*key) {
                    self.duplicates.fetch_add(1, Ordering::SeqCst);
                }
            }
        }
        let now = self.bodies_in_flight.fetch_add(bodies, Ordering::SeqCst) + bodies;
        self.max_bodies_in_flight.fetch_max(now, Ordering::SeqCst);
        Outstanding {
            transport: self,
            keys,
            bodies,
        }
    }

    async fn wait(&self, peer: PeerId) {
        let latency = self.latencies.lock().unwrap().get(&peer).copied();
        if let Some(latency) = latency {
            tokio::time::sleep(latency).await;
        }
    }

    fn block(&self, hash: &B256) -> Option<&Block> {
        self.by_hash.get(hash).map(|&i| &self.blocks[i])
    }
}

impl Transport for MockTransport {
    async fn request_headers(
        &self,
        peer: PeerId,
        origin: HashOrNumber,
        count: u64,
        skip: u64,
        _reverse: bool,
    ) -> Result<Vec<BlockHeader>, TransportError> {
        let behaviour = self.begin(peer, Request::Headers { origin, count });
        let keys = match origin {
            HashOrNumber::Number(n) => vec![Key::Headers(n)],
            HashOrNumber::Hash(_) => Vec::new(),
        };
        let _guard = self.track(keys, 0);
        if behaviour == Behaviour::SilentAfterHandshake && count > 1 {
            return std::future::pending().await;
        }
        self.wait(peer).await;

        let start = match origin {
            HashOrNumber::Number(n) => n as usize,
            HashOrNumber::Hash(h) => match self.by_hash.get(&h) {
                Some(&i) => i,
                None => return Ok(Vec::new()),
            },
        };
        let mut headers: Vec<BlockHeader> = self
            .blocks
            .iter()
            .skip(start)
            .step_by(skip as usize + 1)
            .take(count as usize)
            .map(|b| b.header.clone())
            .collect();
        match behaviour {
            Behaviour::CorruptHeaders if headers.len() > 1 => {
                headers[1].parent_hash = B256::repeat_byte(0xee);
            }
            Behaviour::ForgedRanges if count > 1 && skip == 0 => {
                headers = forge(&headers);
            }
            _ => {}
        }
        Ok(headers)
    }

    async fn request_bodies(&self, peer: PeerId, hashes: Vec<B256>) -> Result<Vec<BlockBody>, TransportError> {
        let behaviour = self.begin(peer, Request::Bodies(hashes.clone()));
        let _guard = self.track(hashes.iter().map(|h| Key::Body(*h)).collect(), hashes.len());
        if matches!(behaviour, Behaviour::SilentBodies | Behaviour::SilentAfterHandshake) {
            return std::future::pending().await;
        }
        self.wait(peer).await;
        Ok(hashes
            .iter()
            .filter_map(|h| self.block(h).map(|b| b.body.clone()))
            .collect())
    }

    async fn request_receipts(
        &self,
        peer: PeerId,
        hashes: Vec<B256>,
    ) -> Result<Vec<Vec<Receipt>>, TransportError> {
        let behaviour = self.begin(peer, Request::Receipts(hashes.clone()));
        let _guard = self.track(hashes.iter().map(|h| Key::Receipt(*h)).collect(), 0);
        if behaviour == Behaviour::SilentAfterHandshake {
            return std::future::pending().await;
        }
        self.wait(peer).await;
        Ok(hashes
            .iter()
            .filter_map(|h| self.block(h).map(|b| b.receipts.clone().unwrap_or_default()))
            .collect())
    }

    async fn request_node_data(&self, peer: PeerId, hashes: Vec<B256>) -> Result<Vec<Vec<u8>>, TransportError> {
        let behaviour = self.begin(peer, Request::Nodes(hashes.clone()));
        let _guard = self.track(hashes.iter().map(|h| Key::Node(*h)).collect(), 0);
        if behaviour == Behaviour::SilentAfterHandshake {
            return std::future::pending().await;
        }
        self.wait(peer).await;
        Ok(hashes.iter().filter_map(|h| self.state.get(h).cloned()).collect())
    }

    async fn request_hashes(&self, peer: PeerId, from: u64, count: u64) -> Result<Vec<B256>, TransportError> {
        let behaviour = self.begin(peer, Request::Hashes { from, count });
        if behaviour == Behaviour::SilentAfterHandshake && count > 1 {
            return std::future::pending().await;
        }
        self.wait(peer).await;
        Ok(self
            .blocks
            .iter()
            .skip(from as usize)
            .take(count as usize)
            .map(Block::hash)
            .collect())
    }

    async fn request_blocks(&self, peer: PeerId, hashes: Vec<B256>) -> Result<Vec<Block>, TransportError> {
        self.begin(peer, Request::Blocks(hashes.clone()));
        self.wait(peer).await;
        Ok(hashes
            .iter()
            .filter_map(|h| self.block(h).map(|b| Block::new(b.header.clone(), b.body.clone())))
            .collect())
    }
}
