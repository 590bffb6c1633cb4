//! Staged retrieval queue and the candidate chain segment.
//!
//! Every stage (header ranges, bodies, receipts, state nodes) keeps a
//! [`TaskQueue`] keyed by the data it retrieves. A key is in flight to at
//! most one peer at a time. [`Queue`] stitches the stages together: header
//! ranges arrive in any order but are admitted into the segment strictly by
//! block number, and body/receipt tasks exist only for admitted headers.

use std::collections::{BTreeMap, HashMap};

use alloy_primitives::B256;
use chain::types::receipts_match;
use chain::{Block, BlockBody, BlockHeader, ChainError, Receipt};
use tokio::time::Instant;
use tracing::{debug, trace};

use crate::config::SyncConfig;
use crate::peers::PeerId;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskState {
    Pending,
    InFlight { peer: PeerId, deadline: Instant },
    Delivered,
    TimedOut,
    Failed,
}

impl TaskState {
    fn is_reservable(&self) -> bool {
        matches!(self, TaskState::Pending | TaskState::TimedOut)
    }
}

#[derive(Debug)]
struct Task {
    state: TaskState,
    attempts: u32,
    /// Last peer that failed this task; it is skipped on the next reservation.
    excluded: Option<PeerId>,
    /// Only this peer may reserve the task.
    pinned: Option<PeerId>,
}

/// Task table of one stage.
#[derive(Debug)]
pub struct TaskQueue<K> {
    tasks: BTreeMap<K, Task>,
    max_retries: u32,
}

impl<K: Ord + Copy> TaskQueue<K> {
    pub fn new(max_retries: u32) -> Self {
        Self {
            tasks: BTreeMap::new(),
            max_retries,
        }
    }

    /// Add a pending task. Returns false if the key is already known.
    pub fn insert(&mut self, key: K) -> bool {
        if self.tasks.contains_key(&key) {
            return false;
        }
        self.tasks.insert(
            key,
            Task {
                state: TaskState::Pending,
                attempts: 0,
                excluded: None,
                pinned: None,
            },
        );
        true
    }

    /// Reserve `key` for `peer`. Fails unless the task is pending or timed out.
    pub fn reserve(&mut self, key: K, peer: PeerId, deadline: Instant) -> bool {
        match self.tasks.get_mut(&key) {
            Some(task) if task.state.is_reservable() => {
                task.state = TaskState::InFlight { peer, deadline };
                task.attempts += 1;
                true
            }
            _ => false,
        }
    }

    /// Reserve up to `max` reservable tasks, lowest keys first. Tasks last
    /// failed by `peer` are skipped unless `allow_repeat` is set.
    pub fn reserve_batch(
        &mut self,
        peer: PeerId,
        max: usize,
        deadline: Instant,
        allow_repeat: bool,
    ) -> Vec<K> {
        let keys: Vec<K> = self
            .tasks
            .iter()
            .filter(|(_, t)| t.state.is_reservable())
            .filter(|(_, t)| match t.pinned {
                Some(p) => p == peer,
                None => allow_repeat || t.excluded != Some(peer),
            })
            .map(|(k, _)| *k)
            .take(max)
            .collect();
        for key in &keys {
            self.reserve(*key, peer, deadline);
        }
        keys
    }

    pub fn reserve_next(&mut self, peer: PeerId, deadline: Instant, allow_repeat: bool) -> Option<K> {
        self.reserve_batch(peer, 1, deadline, allow_repeat).pop()
    }

    /// Restrict future reservations of `key` to `peer`.
    pub fn pin(&mut self, key: K, peer: PeerId) {
        if let Some(task) = self.tasks.get_mut(&key) {
            task.pinned = Some(peer);
        }
    }

    pub fn is_held_by(&self, key: K, peer: PeerId) -> bool {
        matches!(self.state(key), Some(TaskState::InFlight { peer: p, .. }) if p == peer)
    }

    /// Mark a task delivered. Stale deliveries (the task is no longer in
    /// flight to `peer`) are refused.
    pub fn deliver(&mut self, key: K, peer: PeerId) -> bool {
        if !self.is_held_by(key, peer) {
            return false;
        }
        if let Some(task) = self.tasks.get_mut(&key) {
            task.state = TaskState::Delivered;
        }
        true
    }

    /// The request for `key` passed its deadline. Returns false if the task
    /// has run out of attempts and is now failed.
    pub fn expire(&mut self, key: K, peer: PeerId) -> bool {
        self.retry(key, peer, TaskState::TimedOut)
    }

    /// The data delivered for `key` was unusable. The task goes back to
    /// pending with `peer` excluded. Returns false if it is now failed.
    pub fn reject(&mut self, key: K, peer: PeerId) -> bool {
        self.retry(key, peer, TaskState::Pending)
    }

    fn retry(&mut self, key: K, peer: PeerId, next: TaskState) -> bool {
        let max_retries = self.max_retries;
        let Some(task) = self.tasks.get_mut(&key) else {
            return true;
        };
        if task.state == TaskState::Failed {
            return false;
        }
        task.excluded = Some(peer);
        if task.attempts >= max_retries {
            task.state = TaskState::Failed;
            false
        } else {
            task.state = next;
            true
        }
    }

    /// Return an in-flight task to pending without counting the attempt.
    pub fn release(&mut self, key: K) -> Option<PeerId> {
        let task = self.tasks.get_mut(&key)?;
        match task.state {
            TaskState::InFlight { peer, .. } => {
                task.state = TaskState::Pending;
                task.attempts = task.attempts.saturating_sub(1);
                Some(peer)
            }
            _ => None,
        }
    }

    /// Release every in-flight task, returning the peers that held them.
    pub fn release_all(&mut self) -> Vec<PeerId> {
        let keys: Vec<K> = self
            .tasks
            .iter()
            .filter(|(_, t)| matches!(t.state, TaskState::InFlight { .. }))
            .map(|(k, _)| *k)
            .collect();
        keys.into_iter().filter_map(|k| self.release(k)).collect()
    }

    pub fn remove(&mut self, key: K) -> Option<TaskState> {
        self.tasks.remove(&key).map(|t| t.state)
    }

    pub fn state(&self, key: K) -> Option<TaskState> {
        self.tasks.get(&key).map(|t| t.state)
    }

    pub fn contains(&self, key: K) -> bool {
        self.tasks.contains_key(&key)
    }

    pub fn len(&self) -> usize {
        self.tasks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tasks.is_empty()
    }

    pub fn in_flight(&self) -> usize {
        self.tasks
            .values()
            .filter(|t| matches!(t.state, TaskState::InFlight { .. }))
            .count()
    }

    pub fn in_flight_keys(&self) -> Vec<K> {
        self.tasks
            .iter()
            .filter(|(_, t)| matches!(t.state, TaskState::InFlight { .. }))
            .map(|(k, _)| *k)
            .collect()
    }

    /// Tasks not yet delivered or failed.
    pub fn outstanding(&self) -> usize {
        self.tasks
            .values()
            .filter(|t| t.state.is_reservable() || matches!(t.state, TaskState::InFlight { .. }))
            .count()
    }

    pub fn has_reservable(&self) -> bool {
        self.tasks.values().any(|t| t.state.is_reservable())
    }

    pub fn has_failed(&self) -> bool {
        self.tasks.values().any(|t| t.state == TaskState::Failed)
    }

    /// Whether every task has been delivered.
    pub fn is_settled(&self) -> bool {
        self.tasks.values().all(|t| t.state == TaskState::Delivered)
    }
}

/// A contiguous run of headers requested in one header task.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HeaderRange {
    pub from: u64,
    pub count: u64,
}

impl HeaderRange {
    pub fn last(&self) -> u64 {
        self.from + self.count - 1
    }
}

/// Why a delivery was refused.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Rejection {
    /// The peer had nothing for the request.
    Empty,
    /// The response failed verification.
    Malformed(String),
    /// No such request is in flight to this peer.
    Stale,
    /// A header contradicts the skeleton anchor at this number. The range
    /// goes to the skeleton's source before anyone is blamed.
    Disputed(u64),
}

/// Outcome of a body, receipt or node delivery.
#[derive(Debug, Default, PartialEq, Eq)]
pub struct Filled {
    pub accepted: usize,
    /// Requested items the peer did not supply; back to pending.
    pub missing: usize,
    pub malformed: Option<String>,
}

/// A header admitted into the candidate segment, with whatever has been
/// retrieved for it so far.
#[derive(Debug, Clone)]
pub struct Entry {
    pub header: BlockHeader,
    pub hash: B256,
    /// Peer whose header response put this entry in the segment.
    pub origin: PeerId,
    pub body: Option<BlockBody>,
    pub receipts: Option<Vec<Receipt>>,
}

impl Entry {
    fn is_complete(&self, wants_receipts: bool) -> bool {
        self.body.is_some() && (!wants_receipts || self.receipts.is_some())
    }

    pub fn into_block(self) -> Block {
        Block {
            header: self.header,
            body: self.body.unwrap_or_default(),
            receipts: self.receipts,
        }
    }
}

struct HeaderDelivery {
    peer: PeerId,
    headers: Vec<BlockHeader>,
    bodies: Option<Vec<BlockBody>>,
}

/// Result of one admission pass.
#[derive(Debug, Default)]
pub struct Admission {
    /// (number, hash) of every newly admitted header, ascending.
    pub admitted: Vec<(u64, B256)>,
    /// Peer whose buffered range failed to link, and why.
    pub rejected: Option<(PeerId, String)>,
    /// Anchor of a span that leads to its anchor but not to the segment
    /// tip. The skeleton itself is wrong.
    pub unlinked: Option<u64>,
}

enum SpanFault {
    /// The delivery at this key does not lead to the rest of the span, or
    /// failed verification.
    Piece(u64, String),
    Unlinked,
}

/// Range ends strictly between `ancestor` and `target`. Header ranges are
/// laid out on the same grid, so each of these closes exactly one range.
pub fn skeleton_numbers(ancestor: u64, target: u64, batch: u64) -> Vec<u64> {
    let batch = batch.max(1);
    (1..)
        .map(|i| ancestor + i * batch)
        .take_while(|&n| n < target)
        .collect()
}

/// Staged queue of one sync cycle, anchored at the common ancestor and
/// extending to the target head.
pub struct Queue {
    headers: TaskQueue<u64>,
    ranges: BTreeMap<u64, u64>,
    results: BTreeMap<u64, HeaderDelivery>,
    bodies: TaskQueue<u64>,
    receipts: TaskQueue<u64>,
    nodes: TaskQueue<B256>,
    segment: BTreeMap<u64, Entry>,
    /// Last admitted header, initially the common ancestor.
    tip: (u64, B256),
    target: (u64, B256),
    /// Expected hash at range ends. Always holds the target.
    anchors: BTreeMap<u64, B256>,
    /// Peer the skeleton came from; disputed ranges are pinned to it.
    arbiter: Option<PeerId>,
    /// Peers whose ranges contradicted an anchor, keyed by anchor number.
    disputes: BTreeMap<u64, Vec<PeerId>>,
    /// Disputing peers the arbiter has shown wrong, not yet reported.
    disproved: Vec<PeerId>,
    fill_cursor: u64,
    wants_receipts: bool,
    queue_depth: usize,
}

impl Queue {
    /// Lay out header ranges covering `(anchor, target]`.
    pub fn new(anchor: (u64, B256), target: (u64, B256), config: &SyncConfig) -> Self {
        let mut headers = TaskQueue::new(config.max_retries);
        let mut ranges = BTreeMap::new();
        let batch = config.header_batch.max(1);
        let mut from = anchor.0 + 1;
        while from <= target.0 {
            let count = batch.min(target.0 - from + 1);
            headers.insert(from);
            ranges.insert(from, count);
            from += count;
        }
        Self {
            headers,
            ranges,
            results: BTreeMap::new(),
            bodies: TaskQueue::new(config.max_retries),
            receipts: TaskQueue::new(config.max_retries),
            nodes: TaskQueue::new(config.max_retries),
            segment: BTreeMap::new(),
            tip: anchor,
            target,
            anchors: BTreeMap::from([target]),
            arbiter: None,
            disputes: BTreeMap::new(),
            disproved: Vec::new(),
            fill_cursor: anchor.0 + 1,
            wants_receipts: config.mode.wants_receipts(),
            queue_depth: config.queue_depth,
        }
    }

    /// Anchor header ranges to `arbiter`'s skeleton. Anchors outside the
    /// segment are ignored.
    pub fn with_skeleton(mut self, arbiter: PeerId, skeleton: &[(u64, B256)]) -> Self {
        let (tip, target) = (self.tip.0, self.target.0);
        self.anchors.extend(
            skeleton
                .iter()
                .copied()
                .filter(|(n, _)| *n > tip && *n < target),
        );
        self.arbiter = Some(arbiter);
        self
    }

    pub fn target(&self) -> (u64, B256) {
        self.target
    }

    pub fn arbiter(&self) -> Option<PeerId> {
        self.arbiter
    }

    pub fn has_disputes(&self) -> bool {
        !self.disputes.is_empty()
    }

    /// Peers whose disputed ranges turned out wrong since the last call.
    pub fn take_disproved(&mut self) -> Vec<PeerId> {
        std::mem::take(&mut self.disproved)
    }

    /// Last admitted header (number, hash).
    pub fn tip(&self) -> (u64, B256) {
        self.tip
    }

    // ------------------------------------------------------------------
    // Headers
    // ------------------------------------------------------------------

    pub fn reserve_headers(
        &mut self,
        peer: PeerId,
        deadline: Instant,
        allow_repeat: bool,
    ) -> Option<HeaderRange> {
        let from = self.headers.reserve_next(peer, deadline, allow_repeat)?;
        let count = self.ranges.get(&from).copied()?;
        Some(HeaderRange { from, count })
    }

    pub fn has_header_work(&self) -> bool {
        self.headers.has_reservable()
    }

    pub fn headers_in_flight(&self) -> usize {
        self.headers.in_flight()
    }

    pub fn header_in_flight_keys(&self) -> Vec<u64> {
        self.headers.in_flight_keys()
    }

    /// Accept a header range response. Headers must start at the range's
    /// first number, be internally hash-linked and agree with every anchor
    /// they cover. A short response is kept and the remainder becomes a new
    /// range. Legacy responses carry their bodies in `bodies`.
    pub fn deliver_headers(
        &mut self,
        from: u64,
        peer: PeerId,
        headers: Vec<BlockHeader>,
        bodies: Option<Vec<BlockBody>>,
    ) -> Result<usize, Rejection> {
        if !self.headers.is_held_by(from, peer) {
            return Err(Rejection::Stale);
        }
        let count = self.ranges.get(&from).copied().unwrap_or(0);
        if let Err(rejection) = self.check_headers(from, count, &headers, bodies.as_deref()) {
            self.headers.reject(from, peer);
            return Err(match rejection {
                Rejection::Disputed(number) => self.dispute(from, number, peer),
                other => other,
            });
        }

        let got = headers.len() as u64;
        let settled: Vec<u64> = self
            .disputes
            .range(from..from + got)
            .map(|(n, _)| *n)
            .collect();
        for number in settled {
            if let Some(wrong) = self.disputes.remove(&number) {
                debug!(peer = %peer, number, disputers = wrong.len(), "anchor dispute settled");
                self.disproved.extend(wrong);
            }
        }
        if got < count {
            self.ranges.insert(from, got);
            self.ranges.insert(from + got, count - got);
            self.headers.insert(from + got);
            debug!(peer = %peer, from, got, count, "short header response, splitting range");
        }
        self.headers.deliver(from, peer);
        self.results.insert(
            from,
            HeaderDelivery {
                peer,
                headers,
                bodies,
            },
        );
        Ok(got as usize)
    }

    fn check_headers(
        &self,
        from: u64,
        count: u64,
        headers: &[BlockHeader],
        bodies: Option<&[BlockBody]>,
    ) -> Result<(), Rejection> {
        let Some(first) = headers.first() else {
            return Err(Rejection::Empty);
        };
        if headers.len() as u64 > count {
            return Err(Rejection::Malformed(format!(
                "{} headers for a range of {count}",
                headers.len()
            )));
        }
        if first.number != from {
            return Err(Rejection::Malformed(format!(
                "range starts at {} instead of {from}",
                first.number
            )));
        }
        for pair in headers.windows(2) {
            if pair[1].number != pair[0].number + 1 || pair[1].parent_hash != pair[0].hash() {
                return Err(Rejection::Malformed(format!(
                    "broken link at header {}",
                    pair[1].number
                )));
            }
        }
        let contradicts = |h: &&BlockHeader| {
            self.anchors
                .get(&h.number)
                .is_some_and(|anchor| *anchor != h.hash())
        };
        if let Some(header) = headers.iter().find(contradicts) {
            return Err(Rejection::Disputed(header.number));
        }
        if let Some(bodies) = bodies {
            if bodies.len() != headers.len() {
                return Err(Rejection::Malformed("block count mismatch".into()));
            }
            if let Some(h) = headers.iter().zip(bodies).find(|(h, b)| !b.matches(h)) {
                return Err(Rejection::Malformed(format!(
                    "body does not match header {}",
                    h.0.number
                )));
            }
        }
        Ok(())
    }

    /// Record that `peer` contradicted the anchor at `number`. Unless the
    /// peer is the arbiter itself, the range is pinned to the arbiter and
    /// blame waits for its answer.
    fn dispute(&mut self, from: u64, number: u64, peer: PeerId) -> Rejection {
        match self.arbiter {
            Some(arbiter) if arbiter != peer => {
                self.headers.pin(from, arbiter);
                let disputers = self.disputes.entry(number).or_default();
                if !disputers.contains(&peer) {
                    disputers.push(peer);
                }
                debug!(peer = %peer, number, arbiter = %arbiter, "header range disputes the skeleton");
                Rejection::Disputed(number)
            }
            _ => Rejection::Malformed(format!("header {number} does not match the skeleton")),
        }
    }

    /// Move buffered header ranges into the segment, one anchored span at a
    /// time. A span is admitted once every range up to its anchor has
    /// arrived. It is verified backwards: the anchor vouches for the range
    /// that ends on it, and each range's first parent hash vouches for the
    /// range before. The first range that fails is requeued and its sender
    /// reported.
    pub fn admit(&mut self, verify: impl Fn(&BlockHeader) -> bool) -> Admission {
        let mut admission = Admission::default();
        loop {
            let start = self.tip.0 + 1;
            let Some(end) = self.anchors.range(start..).next().map(|(n, _)| *n) else {
                break;
            };
            let Some(pieces) = self.span_pieces(start, end) else {
                break;
            };
            match self.check_span(&pieces, &verify) {
                Ok(()) => {}
                Err(SpanFault::Piece(from, reason)) => {
                    if let Some(delivery) = self.results.remove(&from) {
                        self.headers.reject(from, delivery.peer);
                        admission.rejected = Some((delivery.peer, reason));
                    }
                    break;
                }
                Err(SpanFault::Unlinked) => {
                    admission.unlinked = Some(end);
                    break;
                }
            }
            for from in pieces {
                if let Some(delivery) = self.results.remove(&from) {
                    self.admit_delivery(from, delivery, &mut admission);
                }
            }
        }
        admission
    }

    /// Keys of the buffered deliveries tiling `start..=end`, if all arrived.
    fn span_pieces(&self, start: u64, end: u64) -> Option<Vec<u64>> {
        let mut pieces = Vec::new();
        let mut next = start;
        while next <= end {
            let delivery = self.results.get(&next)?;
            pieces.push(next);
            next += delivery.headers.len() as u64;
        }
        Some(pieces)
    }

    fn check_span(&self, pieces: &[u64], verify: &impl Fn(&BlockHeader) -> bool) -> Result<(), SpanFault> {
        // The last piece matched its anchor on delivery.
        let mut expected: Option<B256> = None;
        for &from in pieces.iter().rev() {
            let Some(delivery) = self.results.get(&from) else {
                continue;
            };
            let (Some(first), Some(last)) = (delivery.headers.first(), delivery.headers.last()) else {
                continue;
            };
            if expected.is_some_and(|hash| hash != last.hash()) {
                return Err(SpanFault::Piece(
                    from,
                    format!("headers {from}..={} do not lead to the next range", last.number),
                ));
            }
            if let Some(h) = delivery.headers.iter().find(|h| !verify(h)) {
                return Err(SpanFault::Piece(
                    from,
                    format!("header {} failed seal verification", h.number),
                ));
            }
            expected = Some(first.parent_hash);
        }
        if expected == Some(self.tip.1) {
            Ok(())
        } else {
            Err(SpanFault::Unlinked)
        }
    }

    fn admit_delivery(&mut self, from: u64, delivery: HeaderDelivery, admission: &mut Admission) {
        let peer = delivery.peer;
        let bodies = delivery.bodies.map(|b| b.into_iter().map(Some).collect::<Vec<_>>());
        for (i, header) in delivery.headers.into_iter().enumerate() {
            let hash = header.hash();
            let number = header.number;
            let body = match &bodies {
                Some(b) => b[i].clone(),
                None => header.has_empty_body().then(BlockBody::default),
            };
            let receipts = (self.wants_receipts && header.has_empty_receipts()).then(Vec::new);
            self.segment.insert(
                number,
                Entry {
                    header,
                    hash,
                    origin: peer,
                    body,
                    receipts,
                },
            );
            self.tip = (number, hash);
            admission.admitted.push((number, hash));
        }
        self.headers.remove(from);
        self.ranges.remove(&from);
        trace!(from, tip = self.tip.0, "header range admitted");
    }

    /// Headers admitted or waiting for admission.
    pub fn buffered(&self) -> usize {
        let waiting: usize = self.results.values().map(|d| d.headers.len()).sum();
        self.segment.len() + waiting
    }

    pub fn headers_done(&self) -> bool {
        self.ranges.is_empty() && self.results.is_empty()
    }

    // ------------------------------------------------------------------
    // Bodies and receipts
    // ------------------------------------------------------------------

    /// Create body and receipt tasks for admitted headers, keeping the
    /// number of outstanding fill tasks within the queue depth. Returns the
    /// number of tasks created.
    pub fn schedule_fill(&mut self) -> usize {
        // Entries imported since the last call may have been at or past the
        // cursor.
        let floor = self
            .segment
            .first_key_value()
            .map_or(self.tip.0 + 1, |(&n, _)| n);
        self.fill_cursor = self.fill_cursor.max(floor);
        let mut created = 0;
        while let Some(entry) = self.segment.get(&self.fill_cursor) {
            let number = self.fill_cursor;
            let needs_body = entry.body.is_none() && !self.bodies.contains(number);
            let needs_receipts =
                self.wants_receipts && entry.receipts.is_none() && !self.receipts.contains(number);
            let needed = usize::from(needs_body) + usize::from(needs_receipts);
            if self.outstanding_fill() + needed > self.queue_depth {
                if needs_body && self.outstanding_fill() < self.queue_depth {
                    self.bodies.insert(number);
                    created += 1;
                }
                break;
            }
            if needs_body {
                self.bodies.insert(number);
            }
            if needs_receipts {
                self.receipts.insert(number);
            }
            created += needed;
            self.fill_cursor += 1;
        }
        created
    }

    /// Pending plus in-flight body and receipt tasks.
    pub fn outstanding_fill(&self) -> usize {
        self.bodies.outstanding() + self.receipts.outstanding()
    }

    pub fn fill_in_flight(&self) -> usize {
        self.bodies.in_flight() + self.receipts.in_flight() + self.nodes.in_flight()
    }

    pub fn has_body_work(&self) -> bool {
        self.bodies.has_reservable()
    }

    pub fn has_receipt_work(&self) -> bool {
        self.receipts.has_reservable()
    }

    fn hashes_for(&self, numbers: &[u64]) -> Vec<B256> {
        numbers
            .iter()
            .filter_map(|n| self.segment.get(n).map(|e| e.hash))
            .collect()
    }

    /// Reserve up to `max` body tasks; returns their numbers and hashes.
    pub fn reserve_bodies(
        &mut self,
        peer: PeerId,
        max: usize,
        deadline: Instant,
        allow_repeat: bool,
    ) -> (Vec<u64>, Vec<B256>) {
        let numbers = self.bodies.reserve_batch(peer, max, deadline, allow_repeat);
        let hashes = self.hashes_for(&numbers);
        (numbers, hashes)
    }

    pub fn reserve_receipts(
        &mut self,
        peer: PeerId,
        max: usize,
        deadline: Instant,
        allow_repeat: bool,
    ) -> (Vec<u64>, Vec<B256>) {
        let numbers = self.receipts.reserve_batch(peer, max, deadline, allow_repeat);
        let hashes = self.hashes_for(&numbers);
        (numbers, hashes)
    }

    /// Pair bodies with the requested headers, in request order. The first
    /// body that fails its header's commitments marks the response
    /// malformed; everything not accepted goes back to pending.
    pub fn deliver_bodies(&mut self, peer: PeerId, numbers: &[u64], bodies: Vec<BlockBody>) -> Filled {
        let mut filled = Filled::default();
        if bodies.len() > numbers.len() {
            filled.malformed = Some(format!("{} bodies for {} requested", bodies.len(), numbers.len()));
        }
        let mut bodies = bodies.into_iter();
        for &number in numbers {
            let body = bodies.next();
            if !self.bodies.is_held_by(number, peer) {
                continue;
            }
            let accepted = match (body, self.segment.get_mut(&number)) {
                _ if filled.malformed.is_some() => false,
                (Some(body), Some(entry)) if body.matches(&entry.header) => {
                    entry.body = Some(body);
                    true
                }
                (Some(_), Some(_)) => {
                    filled.malformed = Some(format!("body does not match header {number}"));
                    false
                }
                _ => false,
            };
            if accepted {
                self.bodies.remove(number);
                filled.accepted += 1;
            } else {
                self.bodies.reject(number, peer);
                filled.missing += 1;
            }
        }
        filled
    }

    pub fn deliver_receipts(
        &mut self,
        peer: PeerId,
        numbers: &[u64],
        receipts: Vec<Vec<Receipt>>,
    ) -> Filled {
        let mut filled = Filled::default();
        if receipts.len() > numbers.len() {
            filled.malformed = Some(format!(
                "{} receipt lists for {} requested",
                receipts.len(),
                numbers.len()
            ));
        }
        let mut receipts = receipts.into_iter();
        for &number in numbers {
            let list = receipts.next();
            if !self.receipts.is_held_by(number, peer) {
                continue;
            }
            let accepted = match (list, self.segment.get_mut(&number)) {
                _ if filled.malformed.is_some() => false,
                (Some(list), Some(entry)) if receipts_match(&list, &entry.header) => {
                    entry.receipts = Some(list);
                    true
                }
                (Some(_), Some(_)) => {
                    filled.malformed = Some(format!("receipts do not match header {number}"));
                    false
                }
                _ => false,
            };
            if accepted {
                self.receipts.remove(number);
                filled.accepted += 1;
            } else {
                self.receipts.reject(number, peer);
                filled.missing += 1;
            }
        }
        filled
    }

    /// Return a fill request's tasks after a timeout.
    pub fn expire_bodies(&mut self, peer: PeerId, numbers: &[u64]) {
        for &n in numbers {
            self.bodies.expire(n, peer);
        }
    }

    pub fn expire_receipts(&mut self, peer: PeerId, numbers: &[u64]) {
        for &n in numbers {
            self.receipts.expire(n, peer);
        }
    }

    pub fn reject_bodies(&mut self, peer: PeerId, numbers: &[u64]) {
        for &n in numbers {
            self.bodies.reject(n, peer);
        }
    }

    pub fn reject_receipts(&mut self, peer: PeerId, numbers: &[u64]) {
        for &n in numbers {
            self.receipts.reject(n, peer);
        }
    }

    pub fn expire_headers(&mut self, peer: PeerId, from: u64) {
        self.headers.expire(from, peer);
    }

    pub fn reject_headers(&mut self, peer: PeerId, from: u64) {
        self.headers.reject(from, peer);
    }

    // ------------------------------------------------------------------
    // State nodes
    // ------------------------------------------------------------------

    /// Add a state node to retrieve. Nodes already scheduled, in flight or
    /// delivered in this cycle are coalesced.
    pub fn schedule_node(&mut self, hash: B256) -> bool {
        self.nodes.insert(hash)
    }

    pub fn has_node_work(&self) -> bool {
        self.nodes.has_reservable()
    }

    pub fn state_done(&self) -> bool {
        self.nodes.is_settled()
    }

    pub fn reserve_nodes(
        &mut self,
        peer: PeerId,
        max: usize,
        deadline: Instant,
        allow_repeat: bool,
    ) -> Vec<B256> {
        self.nodes.reserve_batch(peer, max, deadline, allow_repeat)
    }

    /// Match node data to the requested hashes by content hash and commit
    /// each through `commit`, which returns the children still missing.
    pub fn deliver_nodes(
        &mut self,
        peer: PeerId,
        requested: &[B256],
        data: Vec<Vec<u8>>,
        mut commit: impl FnMut(B256, &[u8]) -> Result<Vec<B256>, ChainError>,
    ) -> Result<Filled, ChainError> {
        let mut filled = Filled::default();
        let mut by_hash: HashMap<B256, Vec<u8>> = HashMap::with_capacity(data.len());
        for blob in data {
            let hash = chain::types::keccak256(&blob);
            if requested.contains(&hash) {
                by_hash.insert(hash, blob);
            } else if filled.malformed.is_none() {
                filled.malformed = Some(format!("unrequested state node {hash}"));
            }
        }
        for &hash in requested {
            match by_hash.remove(&hash) {
                Some(blob) if self.nodes.deliver(hash, peer) => {
                    for child in commit(hash, &blob)? {
                        self.nodes.insert(child);
                    }
                    filled.accepted += 1;
                }
                _ => {
                    self.nodes.reject(hash, peer);
                    filled.missing += 1;
                }
            }
        }
        Ok(filled)
    }

    pub fn expire_nodes(&mut self, peer: PeerId, hashes: &[B256]) {
        for &h in hashes {
            self.nodes.expire(h, peer);
        }
    }

    pub fn reject_nodes(&mut self, peer: PeerId, hashes: &[B256]) {
        for &h in hashes {
            self.nodes.reject(h, peer);
        }
    }

    // ------------------------------------------------------------------
    // Import
    // ------------------------------------------------------------------

    /// Remove up to `max` complete entries from the front of the segment.
    /// The entry at `hold` (if any) is never taken.
    pub fn take_ready(&mut self, max: usize, hold: Option<u64>) -> Vec<Entry> {
        let mut ready = Vec::new();
        while ready.len() < max {
            let Some(entry) = self.segment.first_entry() else {
                break;
            };
            if Some(*entry.key()) == hold || !entry.get().is_complete(self.wants_receipts) {
                break;
            }
            ready.push(entry.remove());
        }
        ready
    }

    /// Entries not yet imported.
    pub fn segment_len(&self) -> usize {
        self.segment.len()
    }

    pub fn entry(&self, number: u64) -> Option<&Entry> {
        self.segment.get(&number)
    }

    /// Whether any stage has a task that ran out of retries.
    pub fn has_failed(&self) -> bool {
        self.headers.has_failed()
            || self.bodies.has_failed()
            || self.receipts.has_failed()
            || self.nodes.has_failed()
    }

    /// Release every in-flight reservation. Returns the peers that held them.
    pub fn release_all(&mut self) -> Vec<PeerId> {
        let mut peers = self.headers.release_all();
        peers.extend(self.bodies.release_all());
        peers.extend(self.receipts.release_all());
        peers.extend(self.nodes.release_all());
        peers.sort();
        peers.dedup();
        peers
    }
}
