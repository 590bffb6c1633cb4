//! Chain sync simulator.
//!
//! Generates a canonical chain, hands it to a set of simulated peers with
//! configurable latency and misbehaviour, and runs the sync service against
//! them until the local chain has caught up with the network and imported a
//! few blocks announced at the tip.

pub mod config;
pub mod network;
pub mod report;

use std::sync::Arc;
use std::time::Duration;

use chain::{Block, MemoryChain};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use sync::{Announcement, CountingSink, PeerEvent, SyncService};
use thiserror::Error;
use tokio::sync::mpsc;
use tokio::task::JoinError;
use tokio::time::{interval, sleep_until, Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use config::RuntimeConfig;
use network::{node_children, PeerKind, SimNetwork, SimTransport};
use report::SimReport;

const POLL_INTERVAL: Duration = Duration::from_millis(50);
const EVENT_QUEUE: usize = 256;

#[derive(Debug, Error)]
pub enum SimError {
    #[error("local chain stuck at block {head}, waiting for {target}")]
    Timeout { head: u64, target: u64 },
    #[error("simulation cancelled at block {head}")]
    Cancelled { head: u64 },
    #[error("sync service stopped early")]
    ServiceGone,
    #[error("sync service task failed: {0}")]
    Join(#[from] JoinError),
}

/// Run one simulation to completion or until `cancel` fires.
pub async fn simulate(config: RuntimeConfig, cancel: CancellationToken) -> Result<SimReport, SimError> {
    let mut rng = match config.seed {
        Some(seed) => StdRng::seed_from_u64(seed),
        None => StdRng::from_entropy(),
    };
    let network = Arc::new(SimNetwork::generate(&config, &mut rng));
    let transport = Arc::new(SimTransport::new(
        network.clone(),
        &config,
        StdRng::seed_from_u64(rng.gen()),
    ));
    let chain = Arc::new(MemoryChain::new(network.genesis().clone()).with_resolver(node_children));
    let sink = Arc::new(CountingSink::new());

    let service = SyncService::new(
        config.sync.clone(),
        config.fetcher.clone(),
        transport,
        chain.clone(),
        sink.clone(),
    );
    let registry = service.peers().clone();
    let (events, rx) = mpsc::channel(EVENT_QUEUE);
    let service_cancel = cancel.child_token();
    let service_task = tokio::spawn(service.run(rx, service_cancel.clone()));

    let target = config.chain_length;
    info!(
        target,
        mode = ?config.sync.mode,
        peers = network.peers().len(),
        state_nodes = network.state_nodes(),
        "simulation started"
    );
    let started = Instant::now();
    let deadline = started + Duration::from_secs(config.timeout_secs);

    let driven = drive(&config, &network, &chain, &events, deadline, &cancel, started).await;

    service_cancel.cancel();
    drop(events);
    let stats = service_task.await?;
    let time_to_sync = driven?;

    let banned = registry
        .peers()
        .into_iter()
        .filter(|p| p.banned)
        .filter_map(|p| network.peer(&p.id).map(|sim| (p.id, sim.kind)))
        .collect();
    let report = SimReport {
        target,
        head: chain.head().number,
        time_to_sync,
        elapsed: started.elapsed(),
        stats,
        banned,
        events: sink.snapshot(),
    };
    info!(
        head = report.head,
        elapsed = ?report.elapsed,
        banned = report.banned.len(),
        "simulation finished"
    );
    Ok(report)
}

/// Connect every peer, wait for bulk sync, then propagate the tip blocks.
/// Returns the time bulk sync took.
async fn drive(
    config: &RuntimeConfig,
    network: &SimNetwork,
    chain: &MemoryChain,
    events: &mpsc::Sender<PeerEvent>,
    deadline: Instant,
    cancel: &CancellationToken,
    started: Instant,
) -> Result<Duration, SimError> {
    let target = config.chain_length;
    let (head_hash, head_td) = match (network.block(target), network.td(target)) {
        (Some(block), Some(td)) => (block.hash(), td),
        _ => return Err(SimError::Timeout { head: 0, target }),
    };
    for peer in network.peers() {
        send(
            events,
            PeerEvent::Connected {
                id: peer.id,
                version: peer.protocol.version(),
                head_hash,
                head_td,
            },
        )
        .await?;
    }

    wait_for(chain, target, deadline, cancel).await?;
    let time_to_sync = started.elapsed();
    info!(head = target, elapsed = ?time_to_sync, "caught up with the network");

    let grace = config.fetcher.arrive_timeout() + config.fetcher.fetch_timeout() * 2;
    let honest: Vec<_> = network
        .peers()
        .iter()
        .filter(|p| p.kind == PeerKind::Honest)
        .collect();
    for number in target + 1..=target + config.tip_blocks {
        let (Some(block), Some(td)) = (network.block(number), network.td(number)) else {
            break;
        };
        let hash = block.hash();
        for peer in &honest {
            send(events, PeerEvent::Head { id: peer.id, hash, td }).await?;
            send(
                events,
                PeerEvent::Announce(Announcement {
                    peer: peer.id,
                    hash,
                    number: Some(number),
                    header: None,
                    timestamp: Instant::now(),
                }),
            )
            .await?;
        }

        match wait_for(chain, number, deadline.min(Instant::now() + grace), cancel).await {
            Err(SimError::Timeout { head, .. }) if Instant::now() < deadline => {
                let Some(peer) = honest.first() else {
                    return Err(SimError::Timeout { head, target: number });
                };
                warn!(number, head, "announced block not imported, broadcasting it");
                send(
                    events,
                    PeerEvent::Broadcast {
                        peer: peer.id,
                        block: Block::new(block.header.clone(), block.body.clone()),
                        td,
                    },
                )
                .await?;
                wait_for(chain, number, deadline, cancel).await?;
            }
            other => other?,
        }
    }
    Ok(time_to_sync)
}

async fn send(events: &mpsc::Sender<PeerEvent>, event: PeerEvent) -> Result<(), SimError> {
    events.send(event).await.map_err(|_| SimError::ServiceGone)
}

async fn wait_for(
    chain: &MemoryChain,
    number: u64,
    deadline: Instant,
    cancel: &CancellationToken,
) -> Result<(), SimError> {
    let mut ticker = interval(POLL_INTERVAL);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    loop {
        let head = chain.head().number;
        if head >= number {
            return Ok(());
        }
        tokio::select! {
            _ = cancel.cancelled() => return Err(SimError::Cancelled { head }),
            _ = sleep_until(deadline) => return Err(SimError::Timeout { head, target: number }),
            _ = ticker.tick() => {}
        }
    }
}
