//! Sync service: owns the peer registry and runs the downloader and fetcher
//! from a stream of peer events.

use std::sync::Arc;

use alloy_primitives::{B256, U256};
use chain::Block;
use tokio::sync::mpsc;
use tokio::task::{JoinError, JoinSet};
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::config::{FetcherConfig, SyncConfig};
use crate::downloader::{Downloader, SyncOutcome};
use crate::error::SyncError;
use crate::events::{Category, Direction, Event, EventSink};
use crate::fetcher::{Announcement, Fetcher, FetcherInput, FetcherStats};
use crate::peers::{Criteria, PeerId, PeerRegistry};
use crate::protocol::Protocol;
use crate::{ChainStore, Transport};

const FETCHER_QUEUE: usize = 1024;

/// What the transport layer reports about its peers.
#[derive(Debug, Clone)]
pub enum PeerEvent {
    Connected {
        id: PeerId,
        version: u32,
        head_hash: B256,
        head_td: U256,
    },
    Disconnected(PeerId),
    /// The peer advertised a new head.
    Head { id: PeerId, hash: B256, td: U256 },
    Announce(Announcement),
    /// A whole block pushed by a peer, with the chain weight it reaches.
    Broadcast { peer: PeerId, block: Block, td: U256 },
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ServiceStats {
    pub cycles_completed: u64,
    pub cycles_failed: u64,
    pub cycles_cancelled: u64,
    pub blocks_synced: u64,
    pub fetcher: FetcherStats,
}

impl ServiceStats {
    fn record(&mut self, joined: Result<Result<SyncOutcome, SyncError>, JoinError>) {
        match joined {
            Ok(Ok(SyncOutcome::Completed(report))) => {
                self.cycles_completed += 1;
                self.blocks_synced += report.imported;
            }
            Ok(Ok(SyncOutcome::Cancelled)) => self.cycles_cancelled += 1,
            Ok(Err(SyncError::NothingToSync | SyncError::AlreadySyncing)) => {}
            Ok(Err(e)) => {
                debug!(err = %e, "sync cycle ended with error");
                self.cycles_failed += 1;
            }
            Err(e) => {
                warn!(err = %e, "sync cycle task failed");
                self.cycles_failed += 1;
            }
        }
    }
}

pub struct SyncService<T, C> {
    config: SyncConfig,
    fetcher_config: FetcherConfig,
    peers: Arc<PeerRegistry>,
    downloader: Downloader,
    transport: Arc<T>,
    chain: Arc<C>,
    sink: Arc<dyn EventSink>,
}

impl<T, C> SyncService<T, C>
where
    T: Transport + 'static,
    C: ChainStore + 'static,
{
    pub fn new(
        config: SyncConfig,
        fetcher_config: FetcherConfig,
        transport: Arc<T>,
        chain: Arc<C>,
        sink: Arc<dyn EventSink>,
    ) -> Self {
        let peers = Arc::new(PeerRegistry::from_config(&config));
        let downloader = Downloader::new(config.clone(), peers.clone(), sink.clone());
        Self {
            config,
            fetcher_config,
            peers,
            downloader,
            transport,
            chain,
            sink,
        }
    }

    pub fn peers(&self) -> &Arc<PeerRegistry> {
        &self.peers
    }

    pub fn downloader(&self) -> &Downloader {
        &self.downloader
    }

    /// Process peer events until `cancel` fires or the event stream ends.
    ///
    /// A sync cycle starts whenever a newly connected peer, or the periodic
    /// check, finds a peer heavier than the local chain and no cycle is
    /// running. On exit the running cycle and the fetcher are cancelled and
    /// awaited.
    pub async fn run(self, mut events: mpsc::Receiver<PeerEvent>, cancel: CancellationToken) -> ServiceStats {
        let work = cancel.child_token();
        let (fetch_tx, fetch_rx) = mpsc::channel(FETCHER_QUEUE);
        let fetcher = Fetcher::new(
            self.fetcher_config.clone(),
            self.peers.clone(),
            self.sink.clone(),
            self.downloader.segment_view(),
        );
        let fetcher_task = {
            let transport = self.transport.clone();
            let chain = self.chain.clone();
            let token = work.clone();
            tokio::spawn(async move { fetcher.run(&*transport, &*chain, fetch_rx, token).await })
        };

        let mut stats = ServiceStats::default();
        let mut cycles: JoinSet<Result<SyncOutcome, SyncError>> = JoinSet::new();
        let mut ticker = tokio::time::interval(self.config.sync_interval());
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        info!(mode = ?self.config.mode, "sync service started");
        loop {
            tokio::select! {
                biased;
                _ = cancel.cancelled() => break,
                Some(joined) = cycles.join_next() => {
                    stats.record(joined);
                    // Catch up right away if the network moved on meanwhile.
                    self.maybe_sync(&mut cycles, &work);
                }
                event = events.recv() => match event {
                    Some(event) => self.on_event(event, &fetch_tx, &mut cycles, &work),
                    None => break,
                },
                _ = ticker.tick() => self.maybe_sync(&mut cycles, &work),
            }
        }

        work.cancel();
        while let Some(joined) = cycles.join_next().await {
            stats.record(joined);
        }
        drop(fetch_tx);
        stats.fetcher = match fetcher_task.await {
            Ok(fetcher) => fetcher,
            Err(e) => {
                warn!(err = %e, "fetcher task failed");
                FetcherStats::default()
            }
        };
        info!(
            completed = stats.cycles_completed,
            failed = stats.cycles_failed,
            synced = stats.blocks_synced,
            "sync service stopped"
        );
        stats
    }

    fn on_event(
        &self,
        event: PeerEvent,
        fetch_tx: &mpsc::Sender<FetcherInput>,
        cycles: &mut JoinSet<Result<SyncOutcome, SyncError>>,
        work: &CancellationToken,
    ) {
        match event {
            PeerEvent::Connected {
                id,
                version,
                head_hash,
                head_td,
            } => {
                let Some(protocol) = Protocol::from_version(version) else {
                    warn!(peer = %id, version, "unsupported protocol version, ignoring peer");
                    return;
                };
                self.peers.register(id, protocol, head_hash, head_td);
                self.maybe_sync(cycles, work);
            }
            PeerEvent::Disconnected(id) => {
                self.peers.unregister(&id);
                self.forward(fetch_tx, FetcherInput::Disconnected(id), Category::Announces);
            }
            PeerEvent::Head { id, hash, td } => self.peers.set_head(&id, hash, td),
            PeerEvent::Announce(announcement) => {
                self.forward(fetch_tx, FetcherInput::Announce(announcement), Category::Announces);
            }
            PeerEvent::Broadcast { peer, block, td } => {
                self.peers.set_head(&peer, block.hash(), td);
                self.forward(fetch_tx, FetcherInput::Broadcast { peer, block }, Category::Broadcasts);
            }
        }
    }

    fn forward(&self, fetch_tx: &mpsc::Sender<FetcherInput>, input: FetcherInput, category: Category) {
        if fetch_tx.try_send(input).is_err() {
            debug!(kind = ?category, "fetcher queue full, dropping input");
            self.sink.record(Event::new(category, Direction::Drop, 1, 0));
        }
    }

    /// Start a cycle if none is running and some peer is heavier than the
    /// local chain.
    fn maybe_sync(&self, cycles: &mut JoinSet<Result<SyncOutcome, SyncError>>, work: &CancellationToken) {
        if !cycles.is_empty() || self.downloader.is_syncing() || work.is_cancelled() {
            return;
        }
        let local = self.chain.current_head();
        let heavier = self
            .peers
            .best_peer(&Criteria::default().throughput(self.config.min_throughput))
            .and_then(|id| self.peers.peer(&id))
            .is_some_and(|p| p.head_td > local.td);
        if !heavier {
            return;
        }

        debug!(local = local.number, "starting sync cycle");
        let downloader = self.downloader.clone();
        let transport = self.transport.clone();
        let chain = self.chain.clone();
        let token = work.child_token();
        cycles.spawn(async move { downloader.synchronise(&*transport, &*chain, &token).await });
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn report(imported: u64) -> SyncOutcome {
        SyncOutcome::Completed(crate::downloader::SyncReport {
            peer: PeerId([1u8; 64]),
            ancestor: 0,
            target: imported,
            target_hash: B256::ZERO,
            imported,
            headers: imported,
            bodies: 0,
            receipts: 0,
            state_nodes: 0,
            rounds: 1,
            elapsed: std::time::Duration::from_secs(1),
        })
    }

    #[test]
    fn stats_classify_outcomes() {
        let mut stats = ServiceStats::default();
        stats.record(Ok(Ok(report(10))));
        stats.record(Ok(Ok(SyncOutcome::Cancelled)));
        stats.record(Ok(Err(SyncError::NothingToSync)));
        stats.record(Ok(Err(SyncError::CycleStalled { rounds: 60 })));
        assert_eq!(stats.cycles_completed, 1);
        assert_eq!(stats.blocks_synced, 10);
        assert_eq!(stats.cycles_cancelled, 1);
        assert_eq!(stats.cycles_failed, 1);
    }
}
