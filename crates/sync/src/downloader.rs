//! Retrieval scheduler.
//!
//! One call to [`Downloader::synchronise`] runs one sync cycle:
//!
//! 1. negotiate a target with the heaviest idle peer and find the common
//!    ancestor,
//! 2. pipeline header ranges across peers, admitting them in block order,
//! 3. fill bodies (and receipts in fast mode) for admitted headers,
//! 4. in fast mode, retrieve the target's state trie,
//! 5. import the verified contiguous prefix as it becomes complete.
//!
//! Requests are futures in a [`FuturesUnordered`]; all bookkeeping happens
//! on the task that drives the cycle.

use std::collections::HashSet;
use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use alloy_primitives::{B256, U256};
use chain::{Block, BlockBody, BlockHeader, Receipt};
use futures::future::BoxFuture;
use futures::stream::{FuturesUnordered, StreamExt};
use futures::FutureExt;
use parking_lot::{Mutex, RwLock};
use tokio::time::{error::Elapsed, timeout_at, Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace, warn};

use crate::config::SyncConfig;
use crate::error::{SyncError, TransportError};
use crate::events::{Category, Direction, Event, EventSink};
use crate::peers::{Criteria, PeerId, PeerInfo, PeerRegistry};
use crate::protocol::Protocol;
use crate::queue::{skeleton_numbers, Admission, Entry, Filled, HeaderRange, Queue, Rejection};
use crate::{ChainStore, HashOrNumber, Transport};

/// Stage of the current sync cycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    Idle,
    NegotiatingHead,
    FetchingHeaders,
    FetchingBodiesAndReceipts,
    StateSync,
    Importing,
}

/// Anchor hashes fetched per request from a legacy peer, which can only
/// list consecutive hashes.
const LEGACY_SKELETON_SPAN: u64 = 2048;

/// Summary of a completed cycle.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SyncReport {
    /// Peer whose head was the sync target (the last one, if replaced).
    pub peer: PeerId,
    /// Common ancestor the segment was anchored at.
    pub ancestor: u64,
    pub target: u64,
    pub target_hash: B256,
    pub imported: u64,
    pub headers: u64,
    pub bodies: u64,
    pub receipts: u64,
    pub state_nodes: u64,
    pub rounds: u32,
    pub elapsed: Duration,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SyncOutcome {
    Completed(SyncReport),
    /// The cancellation signal fired; reservations were released.
    Cancelled,
}

#[derive(Debug, Default)]
struct SegmentState {
    active: bool,
    ancestor: u64,
    target: u64,
    hashes: HashSet<B256>,
}

/// Read-only view of the active cycle's segment, shared with the fetcher so
/// that announcements for blocks already being retrieved are dropped.
#[derive(Debug, Clone, Default)]
pub struct SegmentView {
    inner: Arc<RwLock<SegmentState>>,
}

impl SegmentView {
    pub(crate) fn begin(&self, ancestor: u64, target: u64, target_hash: B256) {
        let mut state = self.inner.write();
        state.active = true;
        state.ancestor = ancestor;
        state.target = target;
        state.hashes.clear();
        state.hashes.insert(target_hash);
    }

    pub(crate) fn extend(&self, hashes: impl IntoIterator<Item = B256>) {
        self.inner.write().hashes.extend(hashes);
    }

    pub(crate) fn finish(&self) {
        let mut state = self.inner.write();
        state.active = false;
        state.hashes.clear();
    }

    pub fn is_active(&self) -> bool {
        self.inner.read().active
    }

    /// Target block number of the active cycle.
    pub fn target(&self) -> Option<u64> {
        let state = self.inner.read();
        state.active.then_some(state.target)
    }

    /// Whether the active cycle has admitted `hash` or will retrieve block
    /// `number`.
    pub fn contains(&self, hash: &B256, number: Option<u64>) -> bool {
        let state = self.inner.read();
        state.active
            && (state.hashes.contains(hash)
                || number.is_some_and(|n| n > state.ancestor && n <= state.target))
    }
}

/// Handle to the retrieval scheduler. Clones share the same cycle guard, so
/// at most one cycle runs across all of them.
#[derive(Clone)]
pub struct Downloader {
    config: Arc<SyncConfig>,
    peers: Arc<PeerRegistry>,
    sink: Arc<dyn EventSink>,
    syncing: Arc<AtomicBool>,
    phase: Arc<Mutex<Phase>>,
    segment: SegmentView,
}

/// Resets the shared cycle state however the cycle ends.
struct CycleGuard<'a> {
    downloader: &'a Downloader,
}

impl Drop for CycleGuard<'_> {
    fn drop(&mut self) {
        self.downloader.segment.finish();
        *self.downloader.phase.lock() = Phase::Idle;
        self.downloader.syncing.store(false, Ordering::Release);
    }
}

#[derive(Debug, Clone)]
struct Target {
    peer: PeerId,
    hash: B256,
    number: u64,
    td: U256,
    state_root: B256,
    ancestor: (u64, B256),
    /// Hashes at header range ends, as served by `peer`.
    skeleton: Vec<(u64, B256)>,
}

impl Downloader {
    pub fn new(config: SyncConfig, peers: Arc<PeerRegistry>, sink: Arc<dyn EventSink>) -> Self {
        Self {
            config: Arc::new(config),
            peers,
            sink,
            syncing: Arc::new(AtomicBool::new(false)),
            phase: Arc::new(Mutex::new(Phase::Idle)),
            segment: SegmentView::default(),
        }
    }

    pub fn config(&self) -> &SyncConfig {
        &self.config
    }

    pub fn peers(&self) -> &Arc<PeerRegistry> {
        &self.peers
    }

    pub fn segment_view(&self) -> SegmentView {
        self.segment.clone()
    }

    pub fn phase(&self) -> Phase {
        *self.phase.lock()
    }

    pub fn is_syncing(&self) -> bool {
        self.syncing.load(Ordering::Acquire)
    }

    fn set_phase(&self, phase: Phase) {
        let mut current = self.phase.lock();
        if *current != phase {
            debug!(from = ?*current, to = ?phase, "sync phase");
            *current = phase;
        }
    }

    fn emit(&self, category: Category, direction: Direction, count: usize, bytes: usize) {
        self.sink.record(Event::new(category, direction, count, bytes));
    }

    /// Run one sync cycle against the heaviest idle peer.
    ///
    /// Returns `AlreadySyncing` if another cycle is active. Per-request
    /// failures are retried internally; the cycle fails only when it stops
    /// making progress, loses its target without replacement, exhausts a
    /// task's retries or the chain rejects an import.
    pub async fn synchronise<T: Transport, C: ChainStore>(
        &self,
        transport: &T,
        chain: &C,
        cancel: &CancellationToken,
    ) -> Result<SyncOutcome, SyncError> {
        if self
            .syncing
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return Err(SyncError::AlreadySyncing);
        }
        let _guard = CycleGuard { downloader: self };
        let started = Instant::now();

        self.set_phase(Phase::NegotiatingHead);
        let Some(target) = self.negotiate(transport, chain, cancel).await? else {
            info!("sync cycle cancelled during negotiation");
            return Ok(SyncOutcome::Cancelled);
        };
        info!(
            peer = %target.peer,
            target = target.number,
            hash = %target.hash,
            ancestor = target.ancestor.0,
            "sync cycle started"
        );
        self.segment.begin(target.ancestor.0, target.number, target.hash);

        let outcome = Cycle::new(self, transport, chain, target, started).run(cancel).await;
        match &outcome {
            Ok(SyncOutcome::Completed(report)) => info!(
                target = report.target,
                imported = report.imported,
                rounds = report.rounds,
                elapsed_ms = report.elapsed.as_millis() as u64,
                "sync cycle complete"
            ),
            Ok(SyncOutcome::Cancelled) => info!("sync cycle cancelled"),
            Err(e) => warn!(err = %e, "sync cycle failed"),
        }
        outcome
    }

    /// Request bounded by the request timeout and the cancellation signal.
    /// `None` means cancelled.
    async fn bounded<R>(
        &self,
        cancel: &CancellationToken,
        request: impl Future<Output = Result<R, TransportError>>,
    ) -> Option<Result<R, TransportError>> {
        let deadline = Instant::now() + self.config.request_timeout();
        tokio::select! {
            _ = cancel.cancelled() => None,
            reply = timeout_at(deadline, request) => Some(within(reply)),
        }
    }

    /// Turn a failed negotiation request into a peer-attributed error,
    /// scoring the peer for timeouts.
    fn negotiation_failure(&self, peer: PeerId, category: Category, err: TransportError) -> SyncError {
        if err == TransportError::Timeout {
            self.emit(category, Direction::Timeout, 1, 0);
            self.peers.record_timeout(&peer);
            SyncError::Timeout(peer)
        } else {
            self.emit(category, Direction::Drop, 1, 0);
            SyncError::Request { peer, source: err }
        }
    }

    fn negotiation_malformed(&self, peer: PeerId, category: Category, reason: &str) -> SyncError {
        warn!(peer = %peer, reason, "malformed negotiation response");
        self.emit(category, Direction::Drop, 1, 0);
        self.peers.record_malformed(&peer);
        SyncError::Malformed {
            peer,
            reason: reason.to_string(),
        }
    }

    async fn negotiate<T: Transport, C: ChainStore>(
        &self,
        transport: &T,
        chain: &C,
        cancel: &CancellationToken,
    ) -> Result<Option<Target>, SyncError> {
        let local = chain.current_head();
        let mut tried: Vec<PeerId> = Vec::new();
        loop {
            let criteria = Criteria::default()
                .throughput(self.config.min_throughput)
                .excluding(tried.iter().copied());
            let Some(peer) = self.peers.best_peer(&criteria) else {
                return Err(SyncError::NoEligiblePeer);
            };
            let Some(info) = self.peers.peer(&peer) else {
                tried.push(peer);
                continue;
            };
            if info.head_td <= local.td {
                debug!(peer = %peer, peer_td = %info.head_td, local_td = %local.td, "no heavier peer");
                return Err(SyncError::NothingToSync);
            }
            if !self.peers.mark_busy(&peer) {
                tried.push(peer);
                continue;
            }
            let found = self.locate_target(transport, chain, cancel, &info, local.number).await;
            self.peers.mark_idle(&peer);
            match found {
                Err(e) if e.is_peer_fault() => {
                    debug!(peer = %peer, err = %e, "sync target negotiation failed, trying next peer");
                    tried.push(peer);
                }
                other => return other,
            }
        }
    }

    /// Fetch the peer's head header and locate the common ancestor.
    async fn locate_target<T: Transport, C: ChainStore>(
        &self,
        transport: &T,
        chain: &C,
        cancel: &CancellationToken,
        info: &PeerInfo,
        local_number: u64,
    ) -> Result<Option<Target>, SyncError> {
        let peer = info.id;
        let head = if info.protocol.serves_headers() {
            self.emit(Category::Headers, Direction::Out, 1, 0);
            let request =
                transport.request_headers(peer, HashOrNumber::Hash(info.head_hash), 1, 0, false);
            let Some(reply) = self.bounded(cancel, request).await else {
                return Ok(None);
            };
            let headers =
                reply.map_err(|e| self.negotiation_failure(peer, Category::Headers, e))?;
            self.emit(Category::Headers, Direction::In, headers.len(), 0);
            headers.into_iter().next()
        } else {
            self.emit(Category::Blocks, Direction::Out, 1, 0);
            let request = transport.request_blocks(peer, vec![info.head_hash]);
            let Some(reply) = self.bounded(cancel, request).await else {
                return Ok(None);
            };
            let blocks = reply.map_err(|e| self.negotiation_failure(peer, Category::Blocks, e))?;
            self.emit(Category::Blocks, Direction::In, blocks.len(), 0);
            blocks.into_iter().next().map(|b| b.header)
        };
        let Some(head) = head.filter(|h| h.hash() == info.head_hash) else {
            return Err(self.negotiation_malformed(peer, Category::Headers, "advertised head not served"));
        };

        let top = local_number.min(head.number);
        let floor = top.saturating_sub(self.config.ancestor_lookback);
        let count = top - floor + 1;
        trace!(peer = %peer, floor, count, "searching common ancestor");

        let candidates: Vec<(u64, B256)> = if info.protocol.serves_headers() {
            self.emit(Category::Headers, Direction::Out, count as usize, 0);
            let request = transport.request_headers(peer, HashOrNumber::Number(floor), count, 0, false);
            let Some(reply) = self.bounded(cancel, request).await else {
                return Ok(None);
            };
            let headers =
                reply.map_err(|e| self.negotiation_failure(peer, Category::Headers, e))?;
            self.emit(Category::Headers, Direction::In, headers.len(), 0);
            let sequential = headers.len() as u64 <= count
                && headers.iter().zip(floor..).all(|(h, n)| h.number == n);
            if !sequential {
                return Err(self.negotiation_malformed(peer, Category::Headers, "ancestor headers out of sequence"));
            }
            headers.iter().map(|h| (h.number, h.hash())).collect()
        } else {
            self.emit(Category::Hashes, Direction::Out, count as usize, 0);
            let request = transport.request_hashes(peer, floor, count);
            let Some(reply) = self.bounded(cancel, request).await else {
                return Ok(None);
            };
            let hashes = reply.map_err(|e| self.negotiation_failure(peer, Category::Hashes, e))?;
            self.emit(Category::Hashes, Direction::In, hashes.len(), hashes.len() * 32);
            if hashes.len() as u64 > count {
                return Err(self.negotiation_malformed(peer, Category::Hashes, "too many ancestor hashes"));
            }
            (floor..).zip(hashes).collect()
        };

        let Some(&ancestor) = candidates.iter().rev().find(|(_, h)| chain.has_block(h)) else {
            return Err(SyncError::Malformed {
                peer,
                reason: format!("no common ancestor within {} blocks", self.config.ancestor_lookback),
            });
        };
        if ancestor.0 >= head.number {
            return Err(SyncError::NothingToSync);
        }
        let skeleton = self
            .skeleton(transport, cancel, info, ancestor.0, head.number)
            .await?;
        let Some(skeleton) = skeleton else {
            return Ok(None);
        };
        Ok(Some(Target {
            peer,
            hash: info.head_hash,
            number: head.number,
            td: info.head_td,
            state_root: head.state_root,
            ancestor,
            skeleton,
        }))
    }

    /// Fetch the hash at every header range end below the target from the
    /// target peer. Ranges served by other peers are checked against these.
    async fn skeleton<T: Transport>(
        &self,
        transport: &T,
        cancel: &CancellationToken,
        info: &PeerInfo,
        ancestor: u64,
        target: u64,
    ) -> Result<Option<Vec<(u64, B256)>>, SyncError> {
        let peer = info.id;
        let batch = self.config.header_batch.max(1);
        let numbers = skeleton_numbers(ancestor, target, batch);
        let per_request = if info.protocol.serves_headers() {
            batch
        } else {
            (LEGACY_SKELETON_SPAN / batch).max(1)
        };
        let mut skeleton = Vec::with_capacity(numbers.len());

        for chunk in numbers.chunks(per_request as usize) {
            let first = chunk[0];
            let count = chunk.len() as u64;
            let fetched: Vec<(u64, B256)> = if info.protocol.serves_headers() {
                self.emit(Category::Headers, Direction::Out, chunk.len(), 0);
                let request =
                    transport.request_headers(peer, HashOrNumber::Number(first), count, batch - 1, false);
                let Some(reply) = self.bounded(cancel, request).await else {
                    return Ok(None);
                };
                let headers =
                    reply.map_err(|e| self.negotiation_failure(peer, Category::Headers, e))?;
                self.emit(Category::Headers, Direction::In, headers.len(), 0);
                headers.iter().map(|h| (h.number, h.hash())).collect()
            } else {
                let span = (count - 1) * batch + 1;
                self.emit(Category::Hashes, Direction::Out, span as usize, 0);
                let request = transport.request_hashes(peer, first, span);
                let Some(reply) = self.bounded(cancel, request).await else {
                    return Ok(None);
                };
                let hashes = reply.map_err(|e| self.negotiation_failure(peer, Category::Hashes, e))?;
                self.emit(Category::Hashes, Direction::In, hashes.len(), hashes.len() * 32);
                if hashes.len() as u64 != span {
                    return Err(self.negotiation_malformed(peer, Category::Hashes, "short skeleton"));
                }
                chunk
                    .iter()
                    .copied()
                    .zip(hashes.into_iter().step_by(batch as usize))
                    .collect()
            };
            let in_order = fetched.len() == chunk.len()
                && fetched.iter().zip(chunk).all(|((n, _), expected)| n == expected);
            if !in_order {
                return Err(self.negotiation_malformed(peer, Category::Headers, "skeleton out of sequence"));
            }
            skeleton.extend(fetched);
        }
        if !skeleton.is_empty() {
            debug!(peer = %peer, anchors = skeleton.len(), "skeleton fetched");
        }
        Ok(Some(skeleton))
    }
}

fn within<R>(reply: Result<Result<R, TransportError>, Elapsed>) -> Result<R, TransportError> {
    reply.unwrap_or_else(|_| Err(TransportError::Timeout))
}

#[derive(Debug)]
enum Request {
    Headers(HeaderRange),
    Bodies { numbers: Vec<u64>, hashes: Vec<B256> },
    Receipts { numbers: Vec<u64>, hashes: Vec<B256> },
    Nodes(Vec<B256>),
}

impl Request {
    fn category(&self) -> Category {
        match self {
            Request::Headers(_) => Category::Headers,
            Request::Bodies { .. } => Category::Bodies,
            Request::Receipts { .. } => Category::Receipts,
            Request::Nodes(_) => Category::States,
        }
    }

    fn len(&self) -> usize {
        match self {
            Request::Headers(range) => range.count as usize,
            Request::Bodies { numbers, .. } | Request::Receipts { numbers, .. } => numbers.len(),
            Request::Nodes(hashes) => hashes.len(),
        }
    }
}

enum Reply {
    Headers(Vec<BlockHeader>),
    /// Legacy answer to a header range: full blocks.
    Blocks(Vec<Block>),
    Bodies(Vec<BlockBody>),
    Receipts(Vec<Vec<Receipt>>),
    Nodes(Vec<Vec<u8>>),
}

struct Completed {
    peer: PeerId,
    request: Request,
    sent: Instant,
    reply: Result<Reply, TransportError>,
}

type InFlight<'a> = FuturesUnordered<BoxFuture<'a, Completed>>;

/// State of one running cycle. Lives on the task that called `synchronise`.
struct Cycle<'a, T, C> {
    downloader: &'a Downloader,
    config: &'a SyncConfig,
    peers: &'a PeerRegistry,
    transport: &'a T,
    chain: &'a C,
    target: Target,
    queue: Queue,
    report: SyncReport,
    started: Instant,
    header_requests: usize,
    fill_requests: usize,
}

impl<'a, T: Transport, C: ChainStore> Cycle<'a, T, C> {
    fn new(
        downloader: &'a Downloader,
        transport: &'a T,
        chain: &'a C,
        target: Target,
        started: Instant,
    ) -> Self {
        let config: &SyncConfig = &downloader.config;
        let mut queue = Queue::new(target.ancestor, (target.number, target.hash), config)
            .with_skeleton(target.peer, &target.skeleton);
        if config.mode.wants_state() && !chain.state_root_known(&target.state_root) {
            queue.schedule_node(target.state_root);
        }
        let report = SyncReport {
            peer: target.peer,
            ancestor: target.ancestor.0,
            target: target.number,
            target_hash: target.hash,
            imported: 0,
            headers: 0,
            bodies: 0,
            receipts: 0,
            state_nodes: 0,
            rounds: 0,
            elapsed: Duration::ZERO,
        };
        Self {
            downloader,
            config,
            peers: &downloader.peers,
            transport,
            chain,
            target,
            queue,
            report,
            started,
            header_requests: 0,
            fill_requests: 0,
        }
    }

    async fn run(mut self, cancel: &CancellationToken) -> Result<SyncOutcome, SyncError> {
        let mut inflight: InFlight<'a> = FuturesUnordered::new();
        let result = self.drive(&mut inflight, cancel).await;

        // Dropping the futures abandons the outstanding requests.
        drop(inflight);
        for peer in self.queue.release_all() {
            self.peers.mark_idle(&peer);
        }

        result.map(|done| {
            if done {
                self.report.peer = self.target.peer;
                self.report.elapsed = self.started.elapsed();
                SyncOutcome::Completed(self.report)
            } else {
                SyncOutcome::Cancelled
            }
        })
    }

    /// Returns `Ok(true)` when the segment is fully imported, `Ok(false)` on
    /// cancellation.
    async fn drive(&mut self, inflight: &mut InFlight<'a>, cancel: &CancellationToken) -> Result<bool, SyncError> {
        let mut ticker = tokio::time::interval(self.config.round_interval());
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        ticker.tick().await;
        let mut stalled_rounds = 0u32;
        let mut progressed = false;

        loop {
            if cancel.is_cancelled() {
                return Ok(false);
            }
            self.check_target()?;
            if self.queue.has_failed() {
                warn!("retrieval task exhausted its retries");
                return Err(SyncError::NoEligiblePeer);
            }
            progressed |= self.import()?;
            if self.is_complete() {
                return Ok(true);
            }
            self.dispatch(inflight);
            self.downloader.set_phase(self.current_phase());

            tokio::select! {
                biased;
                _ = cancel.cancelled() => {}
                Some(done) = inflight.next(), if !inflight.is_empty() => {
                    progressed |= self.handle(done)?;
                }
                _ = ticker.tick() => {
                    self.report.rounds += 1;
                    if progressed {
                        stalled_rounds = 0;
                    } else {
                        stalled_rounds += 1;
                        debug!(
                            stalled_rounds,
                            in_flight = inflight.len(),
                            tip = self.queue.tip().0,
                            "no progress this round"
                        );
                    }
                    progressed = false;
                    if stalled_rounds >= self.config.max_stall_rounds {
                        return Err(SyncError::CycleStalled { rounds: stalled_rounds });
                    }
                }
            }
        }
    }

    fn wants_state(&self) -> bool {
        self.config.mode.wants_state()
    }

    fn is_complete(&self) -> bool {
        self.queue.headers_done()
            && self.queue.segment_len() == 0
            && (!self.wants_state() || self.queue.state_done())
    }

    fn current_phase(&self) -> Phase {
        if !self.queue.headers_done() {
            Phase::FetchingHeaders
        } else if self.queue.outstanding_fill() > 0 {
            Phase::FetchingBodiesAndReceipts
        } else if self.wants_state() && !self.queue.state_done() {
            Phase::StateSync
        } else {
            Phase::Importing
        }
    }

    fn is_alive(&self, peer: &PeerId) -> bool {
        self.peers.peer(peer).is_some_and(|p| !p.banned)
    }

    /// Keep the target peer, or switch to another peer at least as heavy.
    /// Open disputes need the peer the skeleton came from.
    fn check_target(&mut self) -> Result<(), SyncError> {
        if let Some(arbiter) = self.queue.arbiter() {
            if self.queue.has_disputes() && !self.is_alive(&arbiter) {
                warn!(peer = %arbiter, "skeleton source lost with disputes open");
                return Err(SyncError::TargetLost(arbiter));
            }
        }
        if self.is_alive(&self.target.peer) {
            return Ok(());
        }
        let replacement = self
            .peers
            .peers()
            .into_iter()
            .find(|p| !p.banned && p.head_td >= self.target.td);
        match replacement {
            Some(p) => {
                info!(old = %self.target.peer, new = %p.id, "sync target peer replaced");
                self.target.peer = p.id;
                Ok(())
            }
            None => Err(SyncError::TargetLost(self.target.peer)),
        }
    }

    // ------------------------------------------------------------------
    // Dispatch
    // ------------------------------------------------------------------

    fn dispatch(&mut self, inflight: &mut InFlight<'a>) {
        self.queue.schedule_fill();
        self.dispatch_headers(inflight);
        self.dispatch_fill(inflight);
    }

    fn deadline(&self) -> Instant {
        Instant::now() + self.config.request_timeout()
    }

    fn criteria(&self) -> Criteria {
        Criteria::default().throughput(self.config.min_throughput)
    }

    fn dispatch_headers(&mut self, inflight: &mut InFlight<'a>) {
        let criteria = self.criteria();
        let allow_repeat = self.peers.count(&criteria) <= 1;
        let mut skipped: Vec<PeerId> = Vec::new();

        while self.header_requests < self.config.header_fan_out
            && self.queue.has_header_work()
            && self.queue.buffered() < self.config.max_buffered_blocks
        {
            let Some(peer) = self
                .peers
                .best_peer(&criteria.clone().excluding(skipped.iter().copied()))
            else {
                break;
            };
            skipped.push(peer);
            let Some(info) = self.peers.peer(&peer) else {
                continue;
            };
            if !self.peers.mark_busy(&peer) {
                continue;
            }
            let deadline = self.deadline();
            let Some(range) = self.queue.reserve_headers(peer, deadline, allow_repeat) else {
                self.peers.mark_idle(&peer);
                continue;
            };
            self.header_requests += 1;
            trace!(peer = %peer, from = range.from, count = range.count, "requesting headers");
            self.launch(inflight, peer, info.protocol, Request::Headers(range), deadline);
        }
    }

    fn dispatch_fill(&mut self, inflight: &mut InFlight<'a>) {
        let criteria = self.criteria().protocol(Protocol::HeaderSplit);
        let state_criteria = self.criteria().protocol(Protocol::StateCapable);
        let allow_repeat = self.peers.count(&criteria) <= 1;
        let allow_state_repeat = self.peers.count(&state_criteria) <= 1;
        let mut skipped: Vec<PeerId> = Vec::new();

        while self.fill_requests < self.config.fill_fan_out
            && (self.queue.has_body_work()
                || self.queue.has_receipt_work()
                || self.queue.has_node_work())
        {
            let Some(peer) = self
                .peers
                .best_peer(&criteria.clone().excluding(skipped.iter().copied()))
            else {
                break;
            };
            skipped.push(peer);
            let Some(info) = self.peers.peer(&peer) else {
                continue;
            };
            if !self.peers.mark_busy(&peer) {
                continue;
            }
            let deadline = self.deadline();
            let request = self.reserve_fill(peer, info.protocol, deadline, allow_repeat, allow_state_repeat);
            let Some(request) = request else {
                self.peers.mark_idle(&peer);
                continue;
            };
            self.fill_requests += 1;
            trace!(peer = %peer, kind = ?request.category(), items = request.len(), "requesting fill");
            self.launch(inflight, peer, info.protocol, request, deadline);
        }
    }

    /// Reserve the next batch this peer can serve: bodies first, then
    /// receipts, then state nodes.
    fn reserve_fill(
        &mut self,
        peer: PeerId,
        protocol: Protocol,
        deadline: Instant,
        allow_repeat: bool,
        allow_state_repeat: bool,
    ) -> Option<Request> {
        if protocol.serves_bodies() {
            let (numbers, hashes) =
                self.queue
                    .reserve_bodies(peer, self.config.body_batch, deadline, allow_repeat);
            if !numbers.is_empty() {
                return Some(Request::Bodies { numbers, hashes });
            }
        }
        if protocol.serves_receipts() {
            let (numbers, hashes) =
                self.queue
                    .reserve_receipts(peer, self.config.receipt_batch, deadline, allow_state_repeat);
            if !numbers.is_empty() {
                return Some(Request::Receipts { numbers, hashes });
            }
        }
        if protocol.serves_state() {
            let hashes =
                self.queue
                    .reserve_nodes(peer, self.config.node_batch, deadline, allow_state_repeat);
            if !hashes.is_empty() {
                return Some(Request::Nodes(hashes));
            }
        }
        None
    }

    fn launch(
        &mut self,
        inflight: &mut InFlight<'a>,
        peer: PeerId,
        protocol: Protocol,
        request: Request,
        deadline: Instant,
    ) {
        let transport = self.transport;
        let sent = Instant::now();
        let downloader = self.downloader;
        let future = match request {
            Request::Headers(range) if protocol.serves_headers() => {
                downloader.emit(Category::Headers, Direction::Out, range.count as usize, 0);
                async move {
                    let call = transport.request_headers(
                        peer,
                        HashOrNumber::Number(range.from),
                        range.count,
                        0,
                        false,
                    );
                    let reply = within(timeout_at(deadline, call).await).map(Reply::Headers);
                    Completed {
                        peer,
                        request: Request::Headers(range),
                        sent,
                        reply,
                    }
                }
                .boxed()
            }
            Request::Headers(range) => {
                downloader.emit(Category::Hashes, Direction::Out, range.count as usize, 0);
                async move {
                    let call = async {
                        let hashes = transport.request_hashes(peer, range.from, range.count).await?;
                        let blocks = if hashes.is_empty() {
                            Vec::new()
                        } else {
                            transport.request_blocks(peer, hashes).await?
                        };
                        Ok::<_, TransportError>(Reply::Blocks(blocks))
                    };
                    let reply = within(timeout_at(deadline, call).await);
                    Completed {
                        peer,
                        request: Request::Headers(range),
                        sent,
                        reply,
                    }
                }
                .boxed()
            }
            Request::Bodies { numbers, hashes } => {
                downloader.emit(Category::Bodies, Direction::Out, numbers.len(), 0);
                async move {
                    let call = transport.request_bodies(peer, hashes.clone());
                    let reply = within(timeout_at(deadline, call).await).map(Reply::Bodies);
                    Completed {
                        peer,
                        request: Request::Bodies { numbers, hashes },
                        sent,
                        reply,
                    }
                }
                .boxed()
            }
            Request::Receipts { numbers, hashes } => {
                downloader.emit(Category::Receipts, Direction::Out, numbers.len(), 0);
                async move {
                    let call = transport.request_receipts(peer, hashes.clone());
                    let reply = within(timeout_at(deadline, call).await).map(Reply::Receipts);
                    Completed {
                        peer,
                        request: Request::Receipts { numbers, hashes },
                        sent,
                        reply,
                    }
                }
                .boxed()
            }
            Request::Nodes(hashes) => {
                downloader.emit(Category::States, Direction::Out, hashes.len(), 0);
                async move {
                    let call = transport.request_node_data(peer, hashes.clone());
                    let reply = within(timeout_at(deadline, call).await).map(Reply::Nodes);
                    Completed {
                        peer,
                        request: Request::Nodes(hashes),
                        sent,
                        reply,
                    }
                }
                .boxed()
            }
        };
        inflight.push(future);
    }

    // ------------------------------------------------------------------
    // Responses
    // ------------------------------------------------------------------

    /// Process one finished request. Returns whether anything was accepted.
    fn handle(&mut self, done: Completed) -> Result<bool, SyncError> {
        let Completed {
            peer,
            request,
            sent,
            reply,
        } = done;
        match request {
            Request::Headers(_) => self.header_requests = self.header_requests.saturating_sub(1),
            _ => self.fill_requests = self.fill_requests.saturating_sub(1),
        }
        self.peers.mark_idle(&peer);
        let elapsed = sent.elapsed();

        match (request, reply) {
            (request, Err(err)) => {
                self.on_failure(peer, request, err);
                Ok(false)
            }
            (Request::Headers(range), Ok(Reply::Headers(headers))) => {
                let bytes = headers.iter().map(|h| h.rlp_encode().len()).sum();
                self.downloader
                    .emit(Category::Headers, Direction::In, headers.len(), bytes);
                self.on_headers(peer, range, headers, None, elapsed)
            }
            (Request::Headers(range), Ok(Reply::Blocks(blocks))) => {
                let bytes = blocks
                    .iter()
                    .map(|b| b.header.rlp_encode().len() + b.body.encoded_len())
                    .sum();
                self.downloader
                    .emit(Category::Hashes, Direction::In, blocks.len(), blocks.len() * 32);
                self.downloader
                    .emit(Category::Blocks, Direction::In, blocks.len(), bytes);
                let (headers, bodies) = blocks.into_iter().map(|b| (b.header, b.body)).unzip();
                self.on_headers(peer, range, headers, Some(bodies), elapsed)
            }
            (Request::Bodies { numbers, .. }, Ok(Reply::Bodies(bodies))) => {
                let bytes = bodies.iter().map(BlockBody::encoded_len).sum();
                self.downloader
                    .emit(Category::Bodies, Direction::In, bodies.len(), bytes);
                let filled = self.queue.deliver_bodies(peer, &numbers, bodies);
                self.report.bodies += filled.accepted as u64;
                Ok(self.on_filled(peer, Category::Bodies, filled, elapsed))
            }
            (Request::Receipts { numbers, .. }, Ok(Reply::Receipts(receipts))) => {
                let bytes = receipts.iter().flatten().map(Vec::len).sum();
                self.downloader
                    .emit(Category::Receipts, Direction::In, receipts.len(), bytes);
                let filled = self.queue.deliver_receipts(peer, &numbers, receipts);
                self.report.receipts += filled.accepted as u64;
                Ok(self.on_filled(peer, Category::Receipts, filled, elapsed))
            }
            (Request::Nodes(hashes), Ok(Reply::Nodes(data))) => {
                let bytes = data.iter().map(Vec::len).sum();
                self.downloader
                    .emit(Category::States, Direction::In, data.len(), bytes);
                let chain = self.chain;
                let filled = self
                    .queue
                    .deliver_nodes(peer, &hashes, data, |hash, blob| chain.commit_state_node(hash, blob))?;
                self.report.state_nodes += filled.accepted as u64;
                Ok(self.on_filled(peer, Category::States, filled, elapsed))
            }
            (request, Ok(_)) => {
                self.on_failure(peer, request, TransportError::Other("mismatched reply".into()));
                Ok(false)
            }
        }
    }

    fn on_failure(&mut self, peer: PeerId, request: Request, err: TransportError) {
        let category = request.category();
        let count = request.len();
        let timed_out = err == TransportError::Timeout;
        if timed_out {
            warn!(peer = %peer, kind = ?category, items = count, "request timed out");
            self.downloader.emit(category, Direction::Timeout, count, 0);
            self.peers.record_timeout(&peer);
        } else {
            debug!(peer = %peer, kind = ?category, err = %err, "request failed");
            self.downloader.emit(category, Direction::Drop, count, 0);
        }
        match (request, timed_out) {
            (Request::Headers(range), true) => self.queue.expire_headers(peer, range.from),
            (Request::Headers(range), false) => self.queue.reject_headers(peer, range.from),
            (Request::Bodies { numbers, .. }, true) => self.queue.expire_bodies(peer, &numbers),
            (Request::Bodies { numbers, .. }, false) => self.queue.reject_bodies(peer, &numbers),
            (Request::Receipts { numbers, .. }, true) => self.queue.expire_receipts(peer, &numbers),
            (Request::Receipts { numbers, .. }, false) => self.queue.reject_receipts(peer, &numbers),
            (Request::Nodes(hashes), true) => self.queue.expire_nodes(peer, &hashes),
            (Request::Nodes(hashes), false) => self.queue.reject_nodes(peer, &hashes),
        }
    }

    fn on_malformed(&self, peer: PeerId, category: Category, count: usize, reason: &str) {
        warn!(peer = %peer, kind = ?category, reason, "malformed response");
        self.downloader.emit(category, Direction::Drop, count, 0);
        self.peers.record_malformed(&peer);
    }

    fn on_headers(
        &mut self,
        peer: PeerId,
        range: HeaderRange,
        headers: Vec<BlockHeader>,
        bodies: Option<Vec<BlockBody>>,
        elapsed: Duration,
    ) -> Result<bool, SyncError> {
        let received = headers.len();
        match self.queue.deliver_headers(range.from, peer, headers, bodies) {
            Ok(accepted) => {
                self.peers.record_delivery(&peer, accepted, elapsed);
                self.report.headers += accepted as u64;
                for wrong in self.queue.take_disproved() {
                    self.on_malformed(
                        wrong,
                        Category::Headers,
                        0,
                        "header range contradicted the skeleton",
                    );
                }
                let chain = self.chain;
                let verify_seal = self.config.verify_seal;
                let admission = self.queue.admit(|h| !verify_seal || chain.verify_seal(h));
                self.on_admission(admission)?;
                Ok(true)
            }
            Err(Rejection::Empty) => {
                debug!(peer = %peer, from = range.from, "peer returned no headers");
                self.peers.record_delivery(&peer, 0, elapsed);
                Ok(false)
            }
            Err(Rejection::Malformed(reason)) => {
                self.on_malformed(peer, Category::Headers, received, &reason);
                Ok(false)
            }
            Err(Rejection::Disputed(number)) => {
                debug!(
                    peer = %peer,
                    from = range.from,
                    anchor = number,
                    "header range disputed, asking the skeleton source"
                );
                self.downloader
                    .emit(Category::Headers, Direction::Drop, received, 0);
                Ok(false)
            }
            Err(Rejection::Stale) => {
                self.downloader
                    .emit(Category::Headers, Direction::Drop, received, 0);
                Ok(false)
            }
        }
    }

    fn on_admission(&mut self, admission: Admission) -> Result<(), SyncError> {
        if let Some((peer, reason)) = &admission.rejected {
            self.on_malformed(*peer, Category::Headers, 0, reason);
        }
        if let Some(anchor) = admission.unlinked {
            let peer = self.queue.arbiter().unwrap_or(self.target.peer);
            let reason = format!("skeleton anchor {anchor} does not link to the segment");
            self.on_malformed(peer, Category::Headers, 0, &reason);
            return Err(SyncError::Malformed { peer, reason });
        }
        let (Some(first), Some(last)) = (admission.admitted.first(), admission.admitted.last()) else {
            return Ok(());
        };
        debug!(from = first.0, to = last.0, "headers admitted");
        self.downloader
            .segment
            .extend(admission.admitted.iter().map(|(_, hash)| *hash));

        if self.config.mode.wants_receipts() {
            let headers: Vec<BlockHeader> = admission
                .admitted
                .iter()
                .filter_map(|(n, _)| self.queue.entry(*n).map(|e| e.header.clone()))
                .collect();
            self.chain
                .insert_headers(&headers)
                .map_err(|e| SyncError::Import {
                    number: first.0 + e.index as u64,
                    reason: e.reason,
                })?;
        }
        Ok(())
    }

    fn on_filled(&mut self, peer: PeerId, category: Category, filled: Filled, elapsed: Duration) -> bool {
        match &filled.malformed {
            Some(reason) => self.on_malformed(peer, category, filled.missing, reason),
            None => {
                if filled.missing > 0 {
                    debug!(peer = %peer, kind = ?category, missing = filled.missing, "partial delivery");
                }
                self.peers.record_delivery(&peer, filled.accepted, elapsed);
            }
        }
        filled.accepted > 0
    }

    // ------------------------------------------------------------------
    // Import
    // ------------------------------------------------------------------

    /// Hand complete blocks from the front of the segment to the chain. In
    /// fast mode the target block waits for its state.
    fn import(&mut self) -> Result<bool, SyncError> {
        let hold = (self.wants_state() && !self.queue.state_done()).then_some(self.target.number);
        let batch = self.config.import_batch.max(1);
        let mut progressed = false;
        loop {
            let entries = self.queue.take_ready(batch, hold);
            let Some(first) = entries.first().map(|e| e.header.number) else {
                break;
            };
            let origins: Vec<PeerId> = entries.iter().map(|e| e.origin).collect();
            let blocks: Vec<Block> = entries.into_iter().map(Entry::into_block).collect();
            match self.chain.insert_blocks(&blocks) {
                Ok(imported) => {
                    self.report.imported += imported as u64;
                    progressed = true;
                    debug!(from = first, count = imported, "blocks imported");
                }
                Err(e) => {
                    self.report.imported += e.index as u64;
                    let number = first + e.index as u64;
                    if let Some(origin) = origins.get(e.index) {
                        self.peers.record_malformed(origin);
                    }
                    warn!(number, reason = %e.reason, "chain rejected block");
                    return Err(SyncError::Import {
                        number,
                        reason: e.reason,
                    });
                }
            }
        }
        Ok(progressed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn segment_view_tracks_active_cycle() {
        let view = SegmentView::default();
        let hash = B256::repeat_byte(7);
        assert!(!view.contains(&hash, Some(5)));

        view.begin(10, 20, hash);
        assert!(view.contains(&hash, None));
        assert!(view.contains(&B256::ZERO, Some(15)));
        assert!(!view.contains(&B256::ZERO, Some(10)));
        assert!(!view.contains(&B256::ZERO, Some(21)));
        assert_eq!(view.target(), Some(20));

        view.extend([B256::repeat_byte(1)]);
        assert!(view.contains(&B256::repeat_byte(1), None));

        view.finish();
        assert!(!view.is_active());
        assert!(!view.contains(&hash, Some(15)));
    }

    #[test]
    fn request_accounting() {
        let request = Request::Bodies {
            numbers: vec![1, 2, 3],
            hashes: vec![B256::ZERO; 3],
        };
        assert_eq!(request.category(), Category::Bodies);
        assert_eq!(request.len(), 3);
        let range = Request::Headers(HeaderRange { from: 5, count: 192 });
        assert_eq!(range.len(), 192);
    }
}
