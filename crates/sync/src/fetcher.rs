//! Propagation reconciler.
//!
//! Imports blocks announced (or broadcast whole) at the chain tip, one at a
//! time, independently of bulk sync. Announcements are filtered, held for a
//! short aggregation delay so that several peers announcing the same block
//! result in a single fetch, then fetched from the fastest announcer and
//! imported if they extend the current local head.
//!
//! [`Fetcher`] is a plain state machine: `notify`, `enqueue`, `due` and
//! `complete` are synchronous and deterministic. [`Fetcher::run`] drives it
//! from a channel and owns the outstanding fetches.

use std::collections::{BTreeMap, HashMap, HashSet, VecDeque};
use std::sync::Arc;
use std::time::Duration;

use alloy_primitives::B256;
use chain::{Block, BlockBody, BlockHeader};
use futures::future::BoxFuture;
use futures::stream::{FuturesUnordered, StreamExt};
use futures::FutureExt;
use tokio::sync::mpsc;
use tokio::time::{timeout, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace, warn};

use crate::config::FetcherConfig;
use crate::downloader::SegmentView;
use crate::error::{SyncError, TransportError};
use crate::events::{Category, Direction, Event, EventSink};
use crate::peers::{PeerId, PeerRegistry};
use crate::protocol::Protocol;
use crate::{ChainStore, HashOrNumber, Transport};

/// A peer's notification that it has a new block.
#[derive(Debug, Clone)]
pub struct Announcement {
    pub peer: PeerId,
    pub hash: B256,
    pub number: Option<u64>,
    /// Header sent along with the announcement, if any; saves a round trip.
    pub header: Option<BlockHeader>,
    pub timestamp: Instant,
}

#[derive(Debug, Clone)]
pub enum FetcherInput {
    Announce(Announcement),
    /// A complete block pushed by a peer.
    Broadcast { peer: PeerId, block: Block },
    Disconnected(PeerId),
}

/// What intake did with an announcement or broadcast.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Intake {
    /// New block; waiting for the aggregation delay.
    Accepted,
    /// Another peer already announced this block.
    Aggregated,
    /// Already present, being retrieved, or recently imported.
    Known,
    /// Too far from the local head.
    TooFar,
    /// The sender exceeded its rate allowance.
    Dos,
    /// The attached header does not hash to the announced hash.
    Malformed,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct FetcherStats {
    pub announces_accepted: u64,
    pub announces_filtered: u64,
    pub announces_dos: u64,
    /// Announcements evicted from a full per-peer queue.
    pub announces_evicted: u64,
    pub broadcasts_accepted: u64,
    pub broadcasts_filtered: u64,
    pub broadcasts_dos: u64,
    pub fetches: u64,
    pub fetch_failures: u64,
    pub imported: u64,
    /// Blocks discarded at import: not linked to the head, bad seal, or
    /// rejected by the chain.
    pub discarded: u64,
}

/// A fetch chosen by [`Fetcher::due`].
#[derive(Debug, Clone)]
pub struct FetchRequest {
    pub peer: PeerId,
    pub protocol: Protocol,
    pub hash: B256,
    pub header: Option<BlockHeader>,
}

#[derive(Debug)]
struct RateWindow {
    start: Instant,
    count: usize,
}

#[derive(Debug)]
struct Queued {
    origin: PeerId,
    block: Block,
}

pub struct Fetcher {
    config: FetcherConfig,
    peers: Arc<PeerRegistry>,
    sink: Arc<dyn EventSink>,
    segment: SegmentView,
    /// Announcements waiting out the aggregation delay, in arrival order.
    announced: HashMap<B256, Vec<Announcement>>,
    /// Hashes each peer has pending, oldest first.
    per_peer: HashMap<PeerId, VecDeque<B256>>,
    rates: HashMap<PeerId, RateWindow>,
    fetching: HashMap<B256, PeerId>,
    /// Retrieved blocks waiting for their parent to become the head.
    queued: BTreeMap<u64, Vec<Queued>>,
    queued_hashes: HashSet<B256>,
    recent: HashSet<B256>,
    recent_prev: HashSet<B256>,
    stats: FetcherStats,
}

type Done = (FetchRequest, Instant, Result<Block, SyncError>);

impl Fetcher {
    pub fn new(
        config: FetcherConfig,
        peers: Arc<PeerRegistry>,
        sink: Arc<dyn EventSink>,
        segment: SegmentView,
    ) -> Self {
        Self {
            config,
            peers,
            sink,
            segment,
            announced: HashMap::new(),
            per_peer: HashMap::new(),
            rates: HashMap::new(),
            fetching: HashMap::new(),
            queued: BTreeMap::new(),
            queued_hashes: HashSet::new(),
            recent: HashSet::new(),
            recent_prev: HashSet::new(),
            stats: FetcherStats::default(),
        }
    }

    pub fn stats(&self) -> FetcherStats {
        self.stats
    }

    /// Blocks announced and waiting for the aggregation delay.
    pub fn pending(&self) -> usize {
        self.announced.len()
    }

    pub fn in_flight(&self) -> usize {
        self.fetching.len()
    }

    fn emit(&self, category: Category, direction: Direction) {
        self.sink.record(Event::new(category, direction, 1, 0));
    }

    /// Count one message against the peer's rate window.
    fn over_rate(&mut self, peer: PeerId, now: Instant) -> bool {
        let window = self.config.rate_window();
        let rate = self.rates.entry(peer).or_insert(RateWindow { start: now, count: 0 });
        if now.saturating_duration_since(rate.start) >= window {
            rate.start = now;
            rate.count = 0;
        }
        rate.count += 1;
        rate.count > self.config.max_announce_rate
    }

    fn is_known<C: ChainStore>(&self, hash: &B256, number: Option<u64>, chain: &C) -> bool {
        self.recent.contains(hash)
            || self.recent_prev.contains(hash)
            || self.fetching.contains_key(hash)
            || self.queued_hashes.contains(hash)
            || chain.has_block(hash)
            || self.segment.contains(hash, number)
    }

    /// Take in one announcement.
    pub fn notify<C: ChainStore>(&mut self, announcement: Announcement, chain: &C) -> Intake {
        let peer = announcement.peer;
        let hash = announcement.hash;
        self.emit(Category::Announces, Direction::In);

        if self.over_rate(peer, announcement.timestamp) {
            debug!(peer = %peer, hash = %hash, "announcement rate exceeded");
            self.emit(Category::Announces, Direction::Dos);
            self.stats.announces_dos += 1;
            return Intake::Dos;
        }
        if announcement.header.as_ref().is_some_and(|h| h.hash() != hash) {
            warn!(peer = %peer, hash = %hash, "announced header does not match hash");
            self.emit(Category::Announces, Direction::Drop);
            self.peers.record_malformed(&peer);
            return Intake::Malformed;
        }
        let number = announcement
            .number
            .or_else(|| announcement.header.as_ref().map(|h| h.number));
        let head = chain.current_head().number;
        if number.is_some_and(|n| out_of_range(&self.config, n, head)) {
            trace!(peer = %peer, hash = %hash, number, head, "announcement out of range");
            self.emit(Category::Announces, Direction::FilterOut);
            self.stats.announces_filtered += 1;
            return Intake::TooFar;
        }
        if self.is_known(&hash, number, chain) {
            trace!(peer = %peer, hash = %hash, "announcement already known");
            self.emit(Category::Announces, Direction::FilterOut);
            self.stats.announces_filtered += 1;
            return Intake::Known;
        }

        self.emit(Category::Announces, Direction::FilterIn);
        self.stats.announces_accepted += 1;
        self.track(peer, hash);
        match self.announced.get_mut(&hash) {
            Some(existing) => {
                if existing.iter().all(|a| a.peer != peer) {
                    existing.push(announcement);
                }
                Intake::Aggregated
            }
            None => {
                debug!(peer = %peer, hash = %hash, number, "block announced");
                self.announced.insert(hash, vec![announcement]);
                Intake::Accepted
            }
        }
    }

    /// Append `hash` to the peer's queue, evicting its oldest entry when full.
    fn track(&mut self, peer: PeerId, hash: B256) {
        let queue = self.per_peer.entry(peer).or_default();
        if queue.contains(&hash) {
            return;
        }
        queue.push_back(hash);
        if queue.len() <= self.config.max_pending_per_peer {
            return;
        }
        let Some(evicted) = queue.pop_front() else {
            return;
        };
        debug!(peer = %peer, hash = %evicted, "announcement queue full, dropping oldest");
        self.emit(Category::Announces, Direction::Drop);
        self.stats.announces_evicted += 1;
        if let Some(list) = self.announced.get_mut(&evicted) {
            list.retain(|a| a.peer != peer);
            if list.is_empty() {
                self.announced.remove(&evicted);
            }
        }
    }

    fn forget(&mut self, hash: &B256) -> Vec<Announcement> {
        let announcements = self.announced.remove(hash).unwrap_or_default();
        for a in &announcements {
            if let Some(queue) = self.per_peer.get_mut(&a.peer) {
                queue.retain(|h| h != hash);
                if queue.is_empty() {
                    self.per_peer.remove(&a.peer);
                }
            }
        }
        announcements
    }

    /// Drop the per-peer state of a disconnected peer.
    pub fn remove_peer(&mut self, peer: &PeerId) {
        self.rates.remove(peer);
        let Some(hashes) = self.per_peer.remove(peer) else {
            return;
        };
        for hash in hashes {
            if let Some(list) = self.announced.get_mut(&hash) {
                list.retain(|a| a.peer != *peer);
                if list.is_empty() {
                    self.announced.remove(&hash);
                }
            }
        }
    }

    /// Earliest instant at which an aggregated announcement becomes due.
    pub fn next_due(&self) -> Option<Instant> {
        let delay = self.config.arrive_timeout();
        self.announced
            .values()
            .filter_map(|list| list.first())
            .map(|a| a.timestamp + delay)
            .min()
    }

    /// Announcements whose aggregation delay has passed, each resolved to a
    /// single fetch from the announcer with the best throughput (earliest
    /// announcer on ties). Blocks that became known meanwhile are dropped.
    pub fn due<C: ChainStore>(&mut self, now: Instant, chain: &C) -> Vec<FetchRequest> {
        let delay = self.config.arrive_timeout();
        let mut ready: Vec<(Instant, B256)> = self
            .announced
            .iter()
            .filter_map(|(hash, list)| list.first().map(|a| (a.timestamp, *hash)))
            .filter(|(at, _)| *at + delay <= now)
            .collect();
        ready.sort();

        let mut requests = Vec::new();
        for (_, hash) in ready {
            let announcements = self.forget(&hash);
            let number = announcements
                .first()
                .and_then(|a| a.number.or_else(|| a.header.as_ref().map(|h| h.number)));
            if chain.has_block(&hash)
                || self.recent.contains(&hash)
                || self.queued_hashes.contains(&hash)
                || self.segment.contains(&hash, number)
            {
                trace!(hash = %hash, number, "announced block became known while waiting");
                continue;
            }
            let mut best: Option<(f64, FetchRequest)> = None;
            for a in announcements {
                let Some(info) = self.peers.peer(&a.peer).filter(|p| !p.banned) else {
                    continue;
                };
                if best.as_ref().is_some_and(|(tp, _)| *tp >= info.throughput) {
                    continue;
                }
                best = Some((
                    info.throughput,
                    FetchRequest {
                        peer: a.peer,
                        protocol: info.protocol,
                        hash,
                        header: a.header,
                    },
                ));
            }
            let Some((_, request)) = best else {
                debug!(hash = %hash, "no announcer left to fetch from");
                continue;
            };
            trace!(peer = %request.peer, hash = %hash, "fetching announced block");
            self.fetching.insert(hash, request.peer);
            self.stats.fetches += 1;
            requests.push(request);
        }
        requests
    }

    /// Take in a fully retrieved block from a fetch.
    pub fn complete<C: ChainStore>(
        &mut self,
        request: FetchRequest,
        elapsed: Duration,
        result: Result<Block, SyncError>,
        chain: &C,
    ) -> usize {
        self.fetching.remove(&request.hash);
        match result {
            Ok(block) => {
                self.peers.record_delivery(&request.peer, 1, elapsed);
                self.sink.record(Event::new(
                    Category::Headers,
                    Direction::In,
                    1,
                    block.header.rlp_encode().len(),
                ));
                if !block.header.has_empty_body() {
                    self.sink.record(Event::new(
                        Category::Bodies,
                        Direction::In,
                        1,
                        block.body.encoded_len(),
                    ));
                }
                if self.segment.contains(&request.hash, Some(block.number())) {
                    debug!(hash = %request.hash, "fetched block is covered by bulk sync, dropping");
                } else {
                    self.queue(request.peer, block, chain);
                }
            }
            Err(SyncError::Timeout(peer)) => {
                debug!(peer = %peer, hash = %request.hash, "announced block fetch timed out");
                self.emit(Category::Announces, Direction::Timeout);
                self.stats.fetch_failures += 1;
            }
            Err(SyncError::Malformed { peer, reason }) => {
                warn!(peer = %peer, hash = %request.hash, reason, "malformed announced block");
                self.emit(Category::Announces, Direction::Drop);
                self.peers.record_malformed(&peer);
                self.stats.fetch_failures += 1;
            }
            Err(e) => {
                debug!(peer = %request.peer, hash = %request.hash, err = %e, "announced block fetch failed");
                self.emit(Category::Announces, Direction::Drop);
                self.stats.fetch_failures += 1;
            }
        }
        self.import_ready(chain)
    }

    /// Take in a block broadcast by a peer.
    pub fn enqueue<C: ChainStore>(&mut self, peer: PeerId, block: Block, now: Instant, chain: &C) -> Intake {
        let hash = block.hash();
        let number = block.number();
        self.emit(Category::Broadcasts, Direction::In);

        if self.over_rate(peer, now) {
            debug!(peer = %peer, hash = %hash, "broadcast rate exceeded");
            self.emit(Category::Broadcasts, Direction::Dos);
            self.stats.broadcasts_dos += 1;
            return Intake::Dos;
        }
        if out_of_range(&self.config, number, chain.current_head().number) {
            self.emit(Category::Broadcasts, Direction::FilterOut);
            self.stats.broadcasts_filtered += 1;
            return Intake::TooFar;
        }
        // A pending fetch for the same hash is superseded by the broadcast.
        let fetching = self.fetching.contains_key(&hash);
        if !fetching && self.is_known(&hash, Some(number), chain) {
            self.emit(Category::Broadcasts, Direction::FilterOut);
            self.stats.broadcasts_filtered += 1;
            return Intake::Known;
        }
        if !block.body.matches(&block.header) {
            warn!(peer = %peer, hash = %hash, "broadcast body does not match header");
            self.emit(Category::Broadcasts, Direction::Drop);
            self.peers.record_malformed(&peer);
            return Intake::Malformed;
        }

        self.emit(Category::Broadcasts, Direction::FilterIn);
        self.stats.broadcasts_accepted += 1;
        self.forget(&hash);
        self.queue(peer, block, chain);
        self.import_ready(chain);
        Intake::Accepted
    }

    fn queue<C: ChainStore>(&mut self, origin: PeerId, block: Block, chain: &C) {
        let hash = block.hash();
        if chain.has_block(&hash) || !self.queued_hashes.insert(hash) {
            return;
        }
        self.queued
            .entry(block.number())
            .or_default()
            .push(Queued { origin, block });
    }

    /// Import queued blocks that extend the current local head. Stale blocks
    /// and blocks at the next height that do not link to the head are
    /// discarded. Returns the number imported.
    pub fn import_ready<C: ChainStore>(&mut self, chain: &C) -> usize {
        let mut imported = 0;
        loop {
            let head = chain.current_head();
            while let Some(entry) = self.queued.first_entry() {
                let number = *entry.key();
                if number > head.number && !out_of_range(&self.config, number, head.number) {
                    break;
                }
                for stale in entry.remove() {
                    trace!(hash = %stale.block.hash(), "dropping stale queued block");
                    self.queued_hashes.remove(&stale.block.hash());
                    self.stats.discarded += 1;
                }
            }
            let Some(candidates) = self.queued.remove(&(head.number + 1)) else {
                return imported;
            };
            let mut extended = false;
            for Queued { origin, block } in candidates {
                let hash = block.hash();
                self.queued_hashes.remove(&hash);
                if extended || block.header.parent_hash != head.hash {
                    debug!(peer = %origin, hash = %hash, "announced block does not extend head");
                    self.stats.discarded += 1;
                    continue;
                }
                if !chain.verify_seal(&block.header) {
                    warn!(peer = %origin, hash = %hash, "announced block has invalid seal");
                    self.peers.record_malformed(&origin);
                    self.stats.discarded += 1;
                    continue;
                }
                match chain.insert_blocks(std::slice::from_ref(&block)) {
                    Ok(_) => {
                        info!(number = block.number(), hash = %hash, peer = %origin, "imported announced block");
                        self.remember(hash);
                        self.stats.imported += 1;
                        imported += 1;
                        extended = true;
                    }
                    Err(e) => {
                        debug!(peer = %origin, hash = %hash, reason = %e.reason, "announced block rejected");
                        self.stats.discarded += 1;
                    }
                }
            }
            if !extended {
                return imported;
            }
        }
    }

    fn remember(&mut self, hash: B256) {
        if self.recent.len() >= self.config.recent_cap {
            self.recent_prev = std::mem::take(&mut self.recent);
        }
        self.recent.insert(hash);
    }

    /// Drive the fetcher until `cancel` fires or the input channel closes.
    pub async fn run<T: Transport, C: ChainStore>(
        mut self,
        transport: &T,
        chain: &C,
        mut inputs: mpsc::Receiver<FetcherInput>,
        cancel: CancellationToken,
    ) -> FetcherStats {
        let mut fetches: FuturesUnordered<BoxFuture<'_, Done>> = FuturesUnordered::new();
        let fetch_timeout = self.config.fetch_timeout();

        loop {
            let wake = self.next_due();
            tokio::select! {
                biased;
                _ = cancel.cancelled() => break,
                input = inputs.recv() => match input {
                    Some(FetcherInput::Announce(announcement)) => {
                        self.notify(announcement, chain);
                    }
                    Some(FetcherInput::Broadcast { peer, block }) => {
                        self.enqueue(peer, block, Instant::now(), chain);
                    }
                    Some(FetcherInput::Disconnected(peer)) => self.remove_peer(&peer),
                    None => break,
                },
                Some((request, sent, result)) = fetches.next(), if !fetches.is_empty() => {
                    self.complete(request, sent.elapsed(), result, chain);
                }
                _ = sleep_until(wake), if wake.is_some() => {
                    for request in self.due(Instant::now(), chain) {
                        let sink = self.sink.clone();
                        fetches.push(
                            async move {
                                let sent = Instant::now();
                                let result = fetch_block(transport, &*sink, &request, fetch_timeout).await;
                                (request, sent, result)
                            }
                            .boxed(),
                        );
                    }
                }
            }
        }
        debug!(stats = ?self.stats, "fetcher stopped");
        self.stats
    }
}

fn out_of_range(config: &FetcherConfig, number: u64, head: u64) -> bool {
    number > head + config.max_queue_dist || number + config.max_uncle_dist < head
}

async fn sleep_until(at: Option<Instant>) {
    if let Some(at) = at {
        tokio::time::sleep_until(at).await;
    }
}

async fn bounded<R>(
    peer: PeerId,
    limit: Duration,
    request: impl std::future::Future<Output = Result<R, TransportError>>,
) -> Result<R, SyncError> {
    match timeout(limit, request).await {
        Ok(Ok(reply)) => Ok(reply),
        Ok(Err(TransportError::Timeout)) | Err(_) => Err(SyncError::Timeout(peer)),
        Ok(Err(source)) => Err(SyncError::Request { peer, source }),
    }
}

/// Retrieve one announced block: header (unless announced with it), then
/// body (unless the header commits to an empty one). Legacy peers serve the
/// whole block in one request.
pub async fn fetch_block<T: Transport>(
    transport: &T,
    sink: &dyn EventSink,
    request: &FetchRequest,
    limit: Duration,
) -> Result<Block, SyncError> {
    let peer = request.peer;
    let hash = request.hash;
    let malformed = |reason: &str| SyncError::Malformed {
        peer,
        reason: reason.to_string(),
    };

    if !request.protocol.serves_headers() {
        sink.record(Event::new(Category::Blocks, Direction::Out, 1, 0));
        let blocks = bounded(peer, limit, transport.request_blocks(peer, vec![hash])).await?;
        let block = blocks
            .into_iter()
            .find(|b| b.hash() == hash)
            .ok_or_else(|| malformed("requested block not served"))?;
        if !block.body.matches(&block.header) {
            return Err(malformed("block body does not match header"));
        }
        return Ok(block);
    }

    let header = match &request.header {
        Some(header) => header.clone(),
        None => {
            sink.record(Event::new(Category::Headers, Direction::Out, 1, 0));
            let headers = bounded(
                peer,
                limit,
                transport.request_headers(peer, HashOrNumber::Hash(hash), 1, 0, false),
            )
            .await?;
            headers
                .into_iter()
                .find(|h| h.hash() == hash)
                .ok_or_else(|| malformed("requested header not served"))?
        }
    };

    let body = if header.has_empty_body() {
        BlockBody::default()
    } else {
        sink.record(Event::new(Category::Bodies, Direction::Out, 1, 0));
        let bodies = bounded(peer, limit, transport.request_bodies(peer, vec![hash])).await?;
        let body = bodies
            .into_iter()
            .next()
            .ok_or_else(|| malformed("requested body not served"))?;
        if !body.matches(&header) {
            return Err(malformed("body does not match header"));
        }
        body
    };
    Ok(Block::new(header, body))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::{CountingSink, NoopSink};
    use alloy_primitives::U256;
    use chain::MemoryChain;

    fn peer(n: u8) -> PeerId {
        let mut bytes = [0u8; 64];
        bytes[0] = n;
        PeerId(bytes)
    }

    fn child(parent: &BlockHeader) -> BlockHeader {
        BlockHeader {
            parent_hash: parent.hash(),
            number: parent.number + 1,
            difficulty: U256::from(10),
            ..BlockHeader::default()
        }
    }

    fn setup(config: FetcherConfig) -> (Fetcher, Arc<PeerRegistry>, MemoryChain) {
        let registry = Arc::new(PeerRegistry::new(3, 3));
        for n in 1..=3 {
            registry.register(peer(n), Protocol::StateCapable, B256::ZERO, U256::from(100));
        }
        let fetcher = Fetcher::new(config, registry.clone(), Arc::new(NoopSink), SegmentView::default());
        (fetcher, registry, MemoryChain::new(BlockHeader::default()))
    }

    fn announce(from: PeerId, header: &BlockHeader, at: Instant) -> Announcement {
        Announcement {
            peer: from,
            hash: header.hash(),
            number: Some(header.number),
            header: None,
            timestamp: at,
        }
    }

    #[test]
    fn same_block_from_two_peers_is_fetched_once() {
        let (mut fetcher, registry, chain) = setup(FetcherConfig::default());
        let header = child(&BlockHeader::default());
        let t0 = Instant::now();

        assert_eq!(fetcher.notify(announce(peer(1), &header, t0), &chain), Intake::Accepted);
        assert_eq!(
            fetcher.notify(announce(peer(2), &header, t0 + Duration::from_millis(100)), &chain),
            Intake::Aggregated
        );
        // Peer 2 is faster.
        registry.record_delivery(&peer(2), 100, Duration::from_millis(100));

        assert!(fetcher.due(t0 + Duration::from_millis(100), &chain).is_empty());
        assert_eq!(fetcher.next_due(), Some(t0 + Duration::from_millis(500)));

        let requests = fetcher.due(t0 + Duration::from_millis(500), &chain);
        assert_eq!(requests.len(), 1);
        assert_eq!(requests[0].peer, peer(2));
        assert_eq!(fetcher.in_flight(), 1);

        // Announcing again while the fetch runs is a no-op.
        assert_eq!(fetcher.notify(announce(peer(3), &header, t0), &chain), Intake::Known);
        assert!(fetcher.due(t0 + Duration::from_secs(5), &chain).is_empty());
    }

    #[test]
    fn ties_go_to_the_earliest_announcer() {
        let (mut fetcher, _, chain) = setup(FetcherConfig::default());
        let header = child(&BlockHeader::default());
        let t0 = Instant::now();
        fetcher.notify(announce(peer(3), &header, t0), &chain);
        fetcher.notify(announce(peer(1), &header, t0), &chain);
        let requests = fetcher.due(t0 + Duration::from_secs(1), &chain);
        assert_eq!(requests[0].peer, peer(3));
    }

    #[test]
    fn known_and_distant_blocks_are_filtered() {
        let (mut fetcher, _, chain) = setup(FetcherConfig::default());
        let genesis = BlockHeader::default();
        let t0 = Instant::now();

        assert_eq!(fetcher.notify(announce(peer(1), &genesis, t0), &chain), Intake::Known);

        let far = BlockHeader {
            number: 1_000,
            ..BlockHeader::default()
        };
        assert_eq!(fetcher.notify(announce(peer(1), &far, t0), &chain), Intake::TooFar);
        assert_eq!(fetcher.stats().announces_filtered, 2);
        assert_eq!(fetcher.pending(), 0);
    }

    #[test]
    fn rate_limit_marks_dos() {
        let config = FetcherConfig {
            max_announce_rate: 2,
            ..FetcherConfig::default()
        };
        let (mut fetcher, _, chain) = setup(config);
        let t0 = Instant::now();
        let mut parent = BlockHeader::default();
        let mut intakes = Vec::new();
        for _ in 0..3 {
            let header = child(&parent);
            intakes.push(fetcher.notify(announce(peer(1), &header, t0), &chain));
            parent = header;
        }
        assert_eq!(intakes, vec![Intake::Accepted, Intake::Accepted, Intake::Dos]);
        assert_eq!(fetcher.stats().announces_dos, 1);

        // A new window resets the allowance.
        let header = child(&parent);
        let later = t0 + Duration::from_secs(2);
        assert_eq!(fetcher.notify(announce(peer(1), &header, later), &chain), Intake::Accepted);
    }

    #[test]
    fn full_peer_queue_drops_oldest() {
        let config = FetcherConfig {
            max_pending_per_peer: 2,
            ..FetcherConfig::default()
        };
        let (mut fetcher, _, chain) = setup(config);
        let t0 = Instant::now();
        let a = child(&BlockHeader::default());
        let b = child(&a);
        let c = child(&b);
        for h in [&a, &b, &c] {
            fetcher.notify(announce(peer(1), h, t0), &chain);
        }
        assert_eq!(fetcher.pending(), 2);
        assert_eq!(fetcher.stats().announces_evicted, 1);
        let hashes: Vec<B256> = fetcher
            .due(t0 + Duration::from_secs(1), &chain)
            .into_iter()
            .map(|r| r.hash)
            .collect();
        assert!(!hashes.contains(&a.hash()));
        assert!(hashes.contains(&b.hash()) && hashes.contains(&c.hash()));
    }

    #[test]
    fn mismatched_header_is_malformed() {
        let (mut fetcher, registry, chain) = setup(FetcherConfig::default());
        let header = child(&BlockHeader::default());
        let mut ann = announce(peer(1), &header, Instant::now());
        ann.header = Some(BlockHeader::default());
        assert_eq!(fetcher.notify(ann, &chain), Intake::Malformed);
        assert_eq!(registry.peer(&peer(1)).map(|p| p.malformed), Some(1));
    }

    #[test]
    fn fetched_blocks_import_in_order_once_linked() {
        let (mut fetcher, _, chain) = setup(FetcherConfig::default());
        let one = child(&BlockHeader::default());
        let two = child(&one);
        let request = |h: &BlockHeader| FetchRequest {
            peer: peer(1),
            protocol: Protocol::StateCapable,
            hash: h.hash(),
            header: None,
        };

        // Block 2 arrives first and waits for its parent.
        let imported = fetcher.complete(
            request(&two),
            Duration::from_millis(10),
            Ok(Block::new(two.clone(), BlockBody::default())),
            &chain,
        );
        assert_eq!(imported, 0);
        let imported = fetcher.complete(
            request(&one),
            Duration::from_millis(10),
            Ok(Block::new(one.clone(), BlockBody::default())),
            &chain,
        );
        assert_eq!(imported, 2);
        assert_eq!(chain.head().hash, two.hash());
        assert_eq!(fetcher.stats().imported, 2);

        // Recently imported blocks are deduplicated.
        let ann = announce(peer(2), &two, Instant::now());
        assert_eq!(fetcher.notify(ann, &chain), Intake::Known);
    }

    #[test]
    fn unlinked_block_is_discarded() {
        let (mut fetcher, _, chain) = setup(FetcherConfig::default());
        let orphan = BlockHeader {
            parent_hash: B256::repeat_byte(9),
            number: 1,
            ..BlockHeader::default()
        };
        let imported = fetcher.complete(
            FetchRequest {
                peer: peer(1),
                protocol: Protocol::StateCapable,
                hash: orphan.hash(),
                header: None,
            },
            Duration::from_millis(10),
            Ok(Block::new(orphan, BlockBody::default())),
            &chain,
        );
        assert_eq!(imported, 0);
        assert_eq!(fetcher.stats().discarded, 1);
        assert_eq!(chain.head().number, 0);
    }

    #[test]
    fn stale_queued_blocks_are_dropped_before_import() {
        let (mut fetcher, _, chain) = setup(FetcherConfig::default());
        let one = child(&BlockHeader::default());
        chain
            .insert_blocks(&[Block::new(one.clone(), BlockBody::default())])
            .unwrap();
        let sibling = BlockHeader {
            timestamp: 7,
            ..one.clone()
        };
        let two = child(&one);
        fetcher.queue(peer(1), Block::new(sibling, BlockBody::default()), &chain);
        fetcher.queue(peer(1), Block::new(two.clone(), BlockBody::default()), &chain);

        assert_eq!(fetcher.import_ready(&chain), 1);
        assert_eq!(chain.head().hash, two.hash());
        assert_eq!(fetcher.stats().discarded, 1);
        assert!(fetcher.queued.is_empty());
        assert!(fetcher.queued_hashes.is_empty());
    }

    #[test]
    fn blocks_claimed_by_bulk_sync_during_aggregation_are_not_fetched() {
        let registry = Arc::new(PeerRegistry::new(3, 3));
        registry.register(peer(1), Protocol::StateCapable, B256::ZERO, U256::from(100));
        let segment = SegmentView::default();
        let mut fetcher = Fetcher::new(
            FetcherConfig::default(),
            registry,
            Arc::new(NoopSink),
            segment.clone(),
        );
        let chain = MemoryChain::new(BlockHeader::default());
        let one = child(&BlockHeader::default());
        let two = child(&one);
        let t0 = Instant::now();

        assert_eq!(fetcher.notify(announce(peer(1), &one, t0), &chain), Intake::Accepted);
        assert_eq!(fetcher.notify(announce(peer(1), &two, t0), &chain), Intake::Accepted);
        // A sync cycle towards block 1 starts inside the aggregation window.
        segment.begin(0, 1, one.hash());

        let requests = fetcher.due(t0 + Duration::from_secs(1), &chain);
        let hashes: Vec<B256> = requests.iter().map(|r| r.hash).collect();
        assert_eq!(hashes, vec![two.hash()]);
        assert_eq!(fetcher.stats().fetches, 1);

        // A fetch that completes after the cycle claimed its block is dropped.
        segment.extend([two.hash()]);
        let imported = fetcher.complete(
            requests[0].clone(),
            Duration::from_millis(10),
            Ok(Block::new(two.clone(), BlockBody::default())),
            &chain,
        );
        assert_eq!(imported, 0);
        assert!(!fetcher.queued_hashes.contains(&two.hash()));
        segment.finish();
    }

    #[test]
    fn malformed_fetch_scores_the_peer() {
        let (mut fetcher, registry, chain) = setup(FetcherConfig::default());
        let header = child(&BlockHeader::default());
        let request = |n: u8| FetchRequest {
            peer: peer(n),
            protocol: Protocol::StateCapable,
            hash: header.hash(),
            header: None,
        };

        fetcher.complete(
            request(1),
            Duration::from_millis(10),
            Err(SyncError::Malformed {
                peer: peer(1),
                reason: "body does not match header".into(),
            }),
            &chain,
        );
        fetcher.complete(
            request(2),
            Duration::from_millis(10),
            Err(SyncError::Request {
                peer: peer(2),
                source: TransportError::Disconnected,
            }),
            &chain,
        );

        assert_eq!(registry.peer(&peer(1)).map(|p| p.malformed), Some(1));
        assert_eq!(registry.peer(&peer(2)).map(|p| p.malformed), Some(0));
        assert_eq!(fetcher.stats().fetch_failures, 2);
    }

    #[test]
    fn broadcast_imports_directly() {
        let registry = Arc::new(PeerRegistry::new(3, 3));
        registry.register(peer(1), Protocol::HeaderSplit, B256::ZERO, U256::from(10));
        let sink = Arc::new(CountingSink::new());
        let mut fetcher = Fetcher::new(
            FetcherConfig::default(),
            registry,
            sink.clone(),
            SegmentView::default(),
        );
        let chain = MemoryChain::new(BlockHeader::default());
        let block = Block::new(child(&BlockHeader::default()), BlockBody::default());

        let intake = fetcher.enqueue(peer(1), block.clone(), Instant::now(), &chain);
        assert_eq!(intake, Intake::Accepted);
        assert_eq!(chain.head().hash, block.hash());
        assert_eq!(
            fetcher.enqueue(peer(1), block, Instant::now(), &chain),
            Intake::Known
        );
        assert_eq!(sink.count(Category::Broadcasts, Direction::FilterIn), 1);
        assert_eq!(sink.count(Category::Broadcasts, Direction::FilterOut), 1);
    }

    #[test]
    fn disconnected_peer_announcements_are_dropped() {
        let (mut fetcher, _, chain) = setup(FetcherConfig::default());
        let header = child(&BlockHeader::default());
        let t0 = Instant::now();
        fetcher.notify(announce(peer(1), &header, t0), &chain);
        fetcher.remove_peer(&peer(1));
        assert_eq!(fetcher.pending(), 0);
        assert!(fetcher.due(t0 + Duration::from_secs(1), &chain).is_empty());
    }
}
