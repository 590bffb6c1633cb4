use std::fmt;
use std::time::Duration;

use sync::events::Totals;
use sync::{Category, Direction, PeerId, ServiceStats};

use crate::network::PeerKind;

/// Outcome of one simulation run.
#[derive(Debug, Clone)]
pub struct SimReport {
    /// Block the network was at when the run started.
    pub target: u64,
    /// Final local head.
    pub head: u64,
    /// Time until the local chain first reached `target`.
    pub time_to_sync: Duration,
    pub elapsed: Duration,
    pub stats: ServiceStats,
    pub banned: Vec<(PeerId, PeerKind)>,
    pub events: Vec<(Category, Direction, Totals)>,
}

impl SimReport {
    /// Banned peers that were serving correct data.
    pub fn honest_banned(&self) -> usize {
        self.banned
            .iter()
            .filter(|(_, kind)| *kind == PeerKind::Honest)
            .count()
    }
}

impl fmt::Display for SimReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "sync target     {}", self.target)?;
        writeln!(f, "local head      {}", self.head)?;
        writeln!(f, "time to sync    {:.2?}", self.time_to_sync)?;
        writeln!(f, "total time      {:.2?}", self.elapsed)?;
        writeln!(
            f,
            "cycles          {} completed, {} failed, {} cancelled",
            self.stats.cycles_completed, self.stats.cycles_failed, self.stats.cycles_cancelled
        )?;
        writeln!(f, "blocks synced   {}", self.stats.blocks_synced)?;
        writeln!(
            f,
            "announced       {} imported, {} fetches, {} failed, {} filtered",
            self.stats.fetcher.imported,
            self.stats.fetcher.fetches,
            self.stats.fetcher.fetch_failures,
            self.stats.fetcher.announces_filtered
        )?;
        writeln!(f, "banned peers    {}", self.banned.len())?;
        for (id, kind) in &self.banned {
            writeln!(f, "  {id} ({kind:?})")?;
        }
        writeln!(f, "events")?;
        for (category, direction, totals) in &self.events {
            writeln!(
                f,
                "  {:<12} {:<10} {:>8} items {:>10} bytes",
                format!("{category:?}"),
                format!("{direction:?}"),
                totals.count,
                totals.bytes
            )?;
        }
        Ok(())
    }
}
