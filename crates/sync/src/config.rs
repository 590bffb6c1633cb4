use std::time::Duration;

use serde::Deserialize;

/// Which data a sync cycle retrieves besides headers and bodies.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SyncMode {
    /// Headers and bodies; blocks are executed by the chain.
    #[default]
    Full,
    /// Headers, bodies and receipts, plus the state trie at the sync target.
    Fast,
}

impl SyncMode {
    pub fn wants_receipts(self) -> bool {
        matches!(self, SyncMode::Fast)
    }

    pub fn wants_state(self) -> bool {
        matches!(self, SyncMode::Fast)
    }
}

/// Retrieval scheduler tunables.
#[derive(Debug, Clone, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct SyncConfig {
    pub mode: SyncMode,
    /// Headers per header task.
    pub header_batch: u64,
    /// Bodies per request.
    pub body_batch: usize,
    /// Receipt lists per request.
    pub receipt_batch: usize,
    /// State nodes per request.
    pub node_batch: usize,
    /// Concurrently outstanding header tasks.
    pub header_fan_out: usize,
    /// Concurrently outstanding body, receipt and state requests.
    pub fill_fan_out: usize,
    /// Bound on pending plus in-flight body and receipt tasks.
    pub queue_depth: usize,
    /// Header requests pause while the segment holds this many blocks.
    pub max_buffered_blocks: usize,
    /// Blocks handed to the chain per import call.
    pub import_batch: usize,
    pub request_timeout_ms: u64,
    /// Consecutive timeouts after which a peer is banned.
    pub max_consecutive_timeouts: u32,
    /// Malformed responses after which a peer is banned.
    pub max_malformed: u32,
    /// Attempts per task before the cycle gives up on it.
    pub max_retries: u32,
    pub round_interval_ms: u64,
    /// Scheduling rounds without progress before the cycle fails.
    pub max_stall_rounds: u32,
    /// Minimum throughput (items/s) for a peer to be picked as sync target.
    pub min_throughput: f64,
    /// How many blocks below the local head to search for a common ancestor.
    pub ancestor_lookback: u64,
    /// Ask the chain collaborator to check header seals before admission.
    pub verify_seal: bool,
    /// Interval at which the service checks for a heavier peer to sync with.
    pub sync_interval_ms: u64,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            mode: SyncMode::Full,
            header_batch: 192,
            body_batch: 128,
            receipt_batch: 256,
            node_batch: 384,
            header_fan_out: 4,
            fill_fan_out: 8,
            queue_depth: 1024,
            max_buffered_blocks: 2048,
            import_batch: 64,
            request_timeout_ms: 15_000,
            max_consecutive_timeouts: 3,
            max_malformed: 3,
            max_retries: 5,
            round_interval_ms: 500,
            max_stall_rounds: 60,
            min_throughput: 0.0,
            ancestor_lookback: 64,
            verify_seal: true,
            sync_interval_ms: 10_000,
        }
    }
}

impl SyncConfig {
    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout_ms)
    }

    pub fn round_interval(&self) -> Duration {
        Duration::from_millis(self.round_interval_ms)
    }

    pub fn sync_interval(&self) -> Duration {
        Duration::from_millis(self.sync_interval_ms)
    }
}

/// Propagation reconciler tunables.
#[derive(Debug, Clone, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct FetcherConfig {
    /// Aggregation delay between the first announcement of a block and its fetch.
    pub arrive_timeout_ms: u64,
    /// Deadline for each header or body fetch.
    pub fetch_timeout_ms: u64,
    /// Per-peer announcement queue bound; the oldest entry is dropped on overflow.
    pub max_pending_per_peer: usize,
    /// Announcements per peer per window before further ones count as DOS.
    pub max_announce_rate: usize,
    pub rate_window_ms: u64,
    /// Announcements further ahead of the local head are dropped.
    pub max_queue_dist: u64,
    /// Announcements further behind the local head are dropped.
    pub max_uncle_dist: u64,
    /// Imported hashes remembered for dedup before the set is rotated.
    pub recent_cap: usize,
}

impl Default for FetcherConfig {
    fn default() -> Self {
        Self {
            arrive_timeout_ms: 500,
            fetch_timeout_ms: 5_000,
            max_pending_per_peer: 256,
            max_announce_rate: 64,
            rate_window_ms: 1_000,
            max_queue_dist: 32,
            max_uncle_dist: 7,
            recent_cap: 10_000,
        }
    }
}

impl FetcherConfig {
    pub fn arrive_timeout(&self) -> Duration {
        Duration::from_millis(self.arrive_timeout_ms)
    }

    pub fn fetch_timeout(&self) -> Duration {
        Duration::from_millis(self.fetch_timeout_ms)
    }

    pub fn rate_window(&self) -> Duration {
        Duration::from_millis(self.rate_window_ms)
    }
}
