//! Peer registry.
//!
//! Peer records live in an arena keyed by [`PeerId`]. The downloader and the
//! fetcher only ever hold identifiers; every read or mutation goes through
//! the registry, which locks the one record involved.

use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use alloy_primitives::{B256, U256};
use parking_lot::{Mutex, RwLock};
use tracing::{debug, info, warn};

use crate::config::SyncConfig;
use crate::protocol::Protocol;

/// Weight of a new throughput sample in the running estimate.
const THROUGHPUT_IMPACT: f64 = 0.1;
/// Factor applied to the throughput estimate on each timeout.
const TIMEOUT_DECAY: f64 = 0.5;

/// 64-byte node identity.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct PeerId(pub [u8; 64]);

impl PeerId {
    pub fn as_bytes(&self) -> &[u8; 64] {
        &self.0
    }
}

impl From<[u8; 64]> for PeerId {
    fn from(bytes: [u8; 64]) -> Self {
        Self(bytes)
    }
}

impl fmt::Display for PeerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&hex::encode(&self.0[..8]))
    }
}

impl fmt::Debug for PeerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "PeerId({self})")
    }
}

struct PeerRecord {
    protocol: Protocol,
    head_hash: B256,
    head_td: U256,
    idle: bool,
    /// Items per second, exponentially averaged.
    throughput: f64,
    /// Deliveries folded into `throughput`.
    samples: u64,
    consecutive_timeouts: u32,
    malformed: u32,
    seq: u64,
    banned: bool,
}

/// Point-in-time copy of a peer record.
#[derive(Debug, Clone, PartialEq)]
pub struct PeerInfo {
    pub id: PeerId,
    pub protocol: Protocol,
    pub head_hash: B256,
    pub head_td: U256,
    pub idle: bool,
    pub throughput: f64,
    pub samples: u64,
    pub consecutive_timeouts: u32,
    pub malformed: u32,
    pub seq: u64,
    pub banned: bool,
}

/// Eligibility filter for [`PeerRegistry::best_peer`].
#[derive(Debug, Clone)]
pub struct Criteria {
    pub min_protocol: Protocol,
    pub min_throughput: f64,
    pub exclude: Vec<PeerId>,
}

impl Default for Criteria {
    fn default() -> Self {
        Self {
            min_protocol: Protocol::Legacy,
            min_throughput: 0.0,
            exclude: Vec::new(),
        }
    }
}

impl Criteria {
    pub fn protocol(mut self, min: Protocol) -> Self {
        self.min_protocol = min;
        self
    }

    pub fn throughput(mut self, min: f64) -> Self {
        self.min_throughput = min;
        self
    }

    pub fn excluding(mut self, peers: impl IntoIterator<Item = PeerId>) -> Self {
        self.exclude.extend(peers);
        self
    }

    /// Capability part of the filter: ignores idleness and exclusions.
    /// Peers not yet measured pass the throughput floor.
    fn admits(&self, record: &PeerRecord) -> bool {
        !record.banned
            && record.protocol >= self.min_protocol
            && (record.samples == 0 || record.throughput >= self.min_throughput)
    }
}

pub struct PeerRegistry {
    peers: RwLock<HashMap<PeerId, Arc<Mutex<PeerRecord>>>>,
    next_seq: AtomicU64,
    max_consecutive_timeouts: u32,
    max_malformed: u32,
}

impl PeerRegistry {
    pub fn new(max_consecutive_timeouts: u32, max_malformed: u32) -> Self {
        Self {
            peers: RwLock::new(HashMap::new()),
            next_seq: AtomicU64::new(0),
            max_consecutive_timeouts,
            max_malformed,
        }
    }

    pub fn from_config(config: &SyncConfig) -> Self {
        Self::new(config.max_consecutive_timeouts, config.max_malformed)
    }

    fn record(&self, id: &PeerId) -> Option<Arc<Mutex<PeerRecord>>> {
        self.peers.read().get(id).cloned()
    }

    fn with_record<R>(&self, id: &PeerId, f: impl FnOnce(&mut PeerRecord) -> R) -> Option<R> {
        let record = self.record(id)?;
        let mut guard = record.lock();
        Some(f(&mut *guard))
    }

    /// Add a peer after its handshake. Registering a known id replaces the
    /// record, which clears any ban and resets its scores.
    pub fn register(&self, id: PeerId, protocol: Protocol, head_hash: B256, head_td: U256) {
        let seq = self.next_seq.fetch_add(1, Ordering::Relaxed);
        let record = PeerRecord {
            protocol,
            head_hash,
            head_td,
            idle: true,
            throughput: 0.0,
            samples: 0,
            consecutive_timeouts: 0,
            malformed: 0,
            seq,
            banned: false,
        };
        let replaced = self
            .peers
            .write()
            .insert(id, Arc::new(Mutex::new(record)))
            .is_some();
        info!(peer = %id, %protocol, td = %head_td, seq, replaced, "peer registered");
    }

    pub fn unregister(&self, id: &PeerId) -> bool {
        let removed = self.peers.write().remove(id).is_some();
        if removed {
            info!(peer = %id, "peer unregistered");
        }
        removed
    }

    pub fn contains(&self, id: &PeerId) -> bool {
        self.peers.read().contains_key(id)
    }

    pub fn len(&self) -> usize {
        self.peers.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.peers.read().is_empty()
    }

    pub fn mark_idle(&self, id: &PeerId) {
        self.with_record(id, |r| r.idle = true);
    }

    /// Reserve an idle, unbanned peer. Returns false if the peer is unknown,
    /// banned or already busy, so two callers can never reserve it at once.
    pub fn mark_busy(&self, id: &PeerId) -> bool {
        self.with_record(id, |r| {
            if r.idle && !r.banned {
                r.idle = false;
                true
            } else {
                false
            }
        })
        .unwrap_or(false)
    }

    /// Pick the idle peer with the heaviest advertised chain among those
    /// meeting `criteria`. Ties go to the higher throughput, then to the
    /// earlier registration.
    pub fn best_peer(&self, criteria: &Criteria) -> Option<PeerId> {
        let records: Vec<(PeerId, Arc<Mutex<PeerRecord>>)> = self
            .peers
            .read()
            .iter()
            .map(|(id, r)| (*id, r.clone()))
            .collect();

        records
            .into_iter()
            .filter(|(id, _)| !criteria.exclude.contains(id))
            .filter_map(|(id, record)| {
                let r = record.lock();
                if r.idle && criteria.admits(&r) {
                    Some((id, r.head_td, r.throughput, r.seq))
                } else {
                    None
                }
            })
            .max_by(|a, b| {
                a.1.cmp(&b.1)
                    .then(a.2.total_cmp(&b.2))
                    .then(b.3.cmp(&a.3))
            })
            .map(|(id, ..)| id)
    }

    /// Number of registered peers meeting the capability part of
    /// `criteria`, busy or not.
    pub fn count(&self, criteria: &Criteria) -> usize {
        self.peers
            .read()
            .values()
            .filter(|r| criteria.admits(&r.lock()))
            .count()
    }

    pub fn set_head(&self, id: &PeerId, hash: B256, td: U256) {
        self.with_record(id, |r| {
            if td > r.head_td {
                r.head_hash = hash;
                r.head_td = td;
            }
        });
    }

    /// Fold a successful response of `items` items into the throughput
    /// estimate and clear the consecutive-timeout counter.
    pub fn record_delivery(&self, id: &PeerId, items: usize, elapsed: Duration) {
        self.with_record(id, |r| {
            let secs = elapsed.as_secs_f64().max(0.001);
            let measured = items as f64 / secs;
            r.throughput = if r.samples == 0 {
                measured
            } else {
                (1.0 - THROUGHPUT_IMPACT) * r.throughput + THROUGHPUT_IMPACT * measured
            };
            r.samples += 1;
            r.consecutive_timeouts = 0;
        });
    }

    /// Register a missed deadline. Returns true if the peer is now banned.
    pub fn record_timeout(&self, id: &PeerId) -> bool {
        let threshold = self.max_consecutive_timeouts;
        self.with_record(id, |r| {
            r.throughput *= TIMEOUT_DECAY;
            r.consecutive_timeouts += 1;
            if !r.banned && r.consecutive_timeouts >= threshold {
                r.banned = true;
                r.idle = false;
                warn!(peer = %id, timeouts = r.consecutive_timeouts, "peer banned after consecutive timeouts");
            } else {
                debug!(peer = %id, timeouts = r.consecutive_timeouts, throughput = r.throughput, "peer timed out");
            }
            r.banned
        })
        .unwrap_or(false)
    }

    /// Register a response that failed verification. Returns true if the
    /// peer is now banned.
    pub fn record_malformed(&self, id: &PeerId) -> bool {
        let threshold = self.max_malformed;
        self.with_record(id, |r| {
            r.malformed += 1;
            if !r.banned && r.malformed >= threshold {
                r.banned = true;
                r.idle = false;
                warn!(peer = %id, malformed = r.malformed, "peer banned after malformed responses");
            } else {
                debug!(peer = %id, malformed = r.malformed, "malformed response recorded");
            }
            r.banned
        })
        .unwrap_or(false)
    }

    pub fn is_banned(&self, id: &PeerId) -> bool {
        self.with_record(id, |r| r.banned).unwrap_or(false)
    }

    pub fn peer(&self, id: &PeerId) -> Option<PeerInfo> {
        let record = self.record(id)?;
        let r = record.lock();
        Some(PeerInfo {
            id: *id,
            protocol: r.protocol,
            head_hash: r.head_hash,
            head_td: r.head_td,
            idle: r.idle,
            throughput: r.throughput,
            samples: r.samples,
            consecutive_timeouts: r.consecutive_timeouts,
            malformed: r.malformed,
            seq: r.seq,
            banned: r.banned,
        })
    }

    /// Snapshots of all peers in registration order.
    pub fn peers(&self) -> Vec<PeerInfo> {
        let ids: Vec<PeerId> = self.peers.read().keys().copied().collect();
        let mut infos: Vec<PeerInfo> = ids.iter().filter_map(|id| self.peer(id)).collect();
        infos.sort_by_key(|p| p.seq);
        infos
    }

    /// Idle, unbanned peers in registration order.
    pub fn idle_peers(&self) -> Vec<PeerId> {
        self.peers()
            .into_iter()
            .filter(|p| p.idle && !p.banned)
            .map(|p| p.id)
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn id(n: u8) -> PeerId {
        let mut bytes = [0u8; 64];
        bytes[0] = n;
        PeerId(bytes)
    }

    fn registry() -> PeerRegistry {
        PeerRegistry::new(3, 2)
    }

    #[test]
    fn display_is_short_hex() {
        let mut bytes = [0u8; 64];
        bytes[..8].copy_from_slice(&[0xde, 0xad, 0xbe, 0xef, 0, 1, 2, 3]);
        assert_eq!(PeerId(bytes).to_string(), "deadbeef00010203");
    }

    #[test]
    fn best_peer_prefers_weight_then_throughput_then_seq() {
        let reg = registry();
        reg.register(id(1), Protocol::HeaderSplit, B256::ZERO, U256::from(100));
        reg.register(id(2), Protocol::HeaderSplit, B256::ZERO, U256::from(100));
        reg.register(id(3), Protocol::HeaderSplit, B256::ZERO, U256::from(50));

        // Equal weight and throughput: earliest registration wins.
        assert_eq!(reg.best_peer(&Criteria::default()), Some(id(1)));

        reg.record_delivery(&id(2), 100, Duration::from_secs(1));
        assert_eq!(reg.best_peer(&Criteria::default()), Some(id(2)));

        reg.set_head(&id(3), B256::repeat_byte(3), U256::from(500));
        assert_eq!(reg.best_peer(&Criteria::default()), Some(id(3)));
    }

    #[test]
    fn best_peer_honours_criteria() {
        let reg = registry();
        reg.register(id(1), Protocol::Legacy, B256::ZERO, U256::from(900));
        reg.register(id(2), Protocol::StateCapable, B256::ZERO, U256::from(100));

        let state = Criteria::default().protocol(Protocol::StateCapable);
        assert_eq!(reg.best_peer(&state), Some(id(2)));
        assert_eq!(reg.best_peer(&Criteria::default().excluding([id(1)])), Some(id(2)));
        assert_eq!(reg.count(&state), 1);
    }

    #[test]
    fn throughput_floor_applies_once_measured() {
        let reg = registry();
        reg.register(id(1), Protocol::HeaderSplit, B256::ZERO, U256::from(100));
        reg.register(id(2), Protocol::HeaderSplit, B256::ZERO, U256::from(50));
        let floor = Criteria::default().throughput(20.0);

        // Fresh peers have no samples and stay eligible.
        assert_eq!(reg.best_peer(&floor), Some(id(1)));
        assert_eq!(reg.count(&floor), 2);

        reg.record_delivery(&id(1), 10, Duration::from_secs(1));
        assert_eq!(reg.peer(&id(1)).map(|p| p.samples), Some(1));
        assert_eq!(reg.best_peer(&floor), Some(id(2)));

        reg.record_delivery(&id(2), 100, Duration::from_secs(1));
        assert_eq!(reg.best_peer(&floor), Some(id(2)));
        assert_eq!(reg.count(&floor), 1);
    }

    #[test]
    fn busy_peers_are_skipped_and_reserved_once() {
        let reg = registry();
        reg.register(id(1), Protocol::HeaderSplit, B256::ZERO, U256::from(10));
        assert!(reg.mark_busy(&id(1)));
        assert!(!reg.mark_busy(&id(1)));
        assert_eq!(reg.best_peer(&Criteria::default()), None);
        reg.mark_idle(&id(1));
        assert_eq!(reg.idle_peers(), vec![id(1)]);
    }

    #[test]
    fn timeouts_ban_at_threshold_and_reset_on_delivery() {
        let reg = registry();
        reg.register(id(1), Protocol::HeaderSplit, B256::ZERO, U256::from(10));

        assert!(!reg.record_timeout(&id(1)));
        assert!(!reg.record_timeout(&id(1)));
        reg.record_delivery(&id(1), 10, Duration::from_millis(100));
        assert_eq!(reg.peer(&id(1)).unwrap().consecutive_timeouts, 0);

        assert!(!reg.record_timeout(&id(1)));
        assert!(!reg.record_timeout(&id(1)));
        assert!(reg.record_timeout(&id(1)));
        assert!(reg.is_banned(&id(1)));
        assert!(!reg.mark_busy(&id(1)));
        assert_eq!(reg.best_peer(&Criteria::default()), None);

        // Re-registration clears the ban.
        reg.register(id(1), Protocol::HeaderSplit, B256::ZERO, U256::from(10));
        assert!(!reg.is_banned(&id(1)));
        assert_eq!(reg.best_peer(&Criteria::default()), Some(id(1)));
    }

    #[test]
    fn malformed_responses_ban() {
        let reg = registry();
        reg.register(id(1), Protocol::HeaderSplit, B256::ZERO, U256::from(10));
        assert!(!reg.record_malformed(&id(1)));
        assert!(reg.record_malformed(&id(1)));
        assert!(reg.idle_peers().is_empty());
    }

    #[test]
    fn throughput_decays_on_timeout() {
        let reg = registry();
        reg.register(id(1), Protocol::HeaderSplit, B256::ZERO, U256::from(10));
        reg.record_delivery(&id(1), 200, Duration::from_secs(1));
        assert_eq!(reg.peer(&id(1)).unwrap().throughput, 200.0);
        reg.record_delivery(&id(1), 100, Duration::from_secs(1));
        assert!((reg.peer(&id(1)).unwrap().throughput - 190.0).abs() < 1e-9);
        reg.record_timeout(&id(1));
        assert!((reg.peer(&id(1)).unwrap().throughput - 95.0).abs() < 1e-9);
    }

    #[test]
    fn unknown_peers_are_inert() {
        let reg = registry();
        assert!(!reg.mark_busy(&id(9)));
        assert!(!reg.record_timeout(&id(9)));
        assert!(!reg.unregister(&id(9)));
        assert!(reg.peer(&id(9)).is_none());
    }
}
