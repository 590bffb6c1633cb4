use std::path::PathBuf;

use clap::Parser;
use serde::Deserialize;
use sync::{FetcherConfig, SyncConfig, SyncMode};
use thiserror::Error;

// ============================================================================
// CLI STRUCTS
// ============================================================================

/// vec-sim: runs the chain sync engine against a simulated peer network.
#[derive(Parser, Debug, Default)]
#[command(name = "vec-sim", version = "0.1.0")]
pub struct Cli {
    /// Path to TOML configuration file.
    #[arg(short = 'C', long)]
    pub config: Option<PathBuf>,

    /// Number of blocks the network is ahead of the local genesis.
    #[arg(short = 'n', long = "chain-length")]
    pub chain_length: Option<u64>,

    /// Blocks announced at the tip once bulk sync has caught up.
    #[arg(long = "tip-blocks")]
    pub tip_blocks: Option<u64>,

    /// Every n-th block carries a transaction (0 for all-empty blocks).
    #[arg(long = "tx-every")]
    pub tx_every: Option<u64>,

    /// Sync mode: full or fast.
    #[arg(long)]
    pub mode: Option<String>,

    /// Peers serving correct data.
    #[arg(long = "honest-peers")]
    pub honest_peers: Option<usize>,

    /// Honest peers speaking the legacy eth/61 dialect (counted in honest-peers).
    #[arg(long = "legacy-peers")]
    pub legacy_peers: Option<usize>,

    /// Peers corrupting header ranges and bodies.
    #[arg(long = "malicious-peers")]
    pub malicious_peers: Option<usize>,

    /// Peers that complete the handshake and then never answer bulk requests.
    #[arg(long = "stalling-peers")]
    pub stalling_peers: Option<usize>,

    /// Base response latency in milliseconds.
    #[arg(long = "latency-ms")]
    pub latency_ms: Option<u64>,

    /// Uniform random latency added on top of the base, in milliseconds.
    #[arg(long = "jitter-ms")]
    pub jitter_ms: Option<u64>,

    /// Probability that any single request to an honest peer goes unanswered.
    #[arg(long = "stall-probability")]
    pub stall_probability: Option<f64>,

    /// RNG seed for reproducible runs.
    #[arg(long)]
    pub seed: Option<u64>,

    /// Give up if the local chain has not caught up after this many seconds.
    #[arg(long = "timeout-secs")]
    pub timeout_secs: Option<u64>,

    /// Log level (trace, debug, info, warn, error).
    #[arg(long = "log-level")]
    pub log_level: Option<String>,
}

// ============================================================================
// CONFIG FILE STRUCTS
// ============================================================================

/// Configuration loaded from TOML file.
#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ConfigFile {
    pub chain_length: Option<u64>,
    pub tip_blocks: Option<u64>,
    pub tx_every: Option<u64>,
    pub mode: Option<String>,
    pub honest_peers: Option<usize>,
    pub legacy_peers: Option<usize>,
    pub malicious_peers: Option<usize>,
    pub stalling_peers: Option<usize>,
    pub latency_ms: Option<u64>,
    pub jitter_ms: Option<u64>,
    pub stall_probability: Option<f64>,
    pub seed: Option<u64>,
    pub timeout_secs: Option<u64>,
    pub log_level: Option<String>,
    /// Downloader tunables.
    pub sync: Option<SyncConfig>,
    /// Fetcher tunables.
    pub fetcher: Option<FetcherConfig>,
}

// ============================================================================
// RUNTIME CONFIG
// ============================================================================

/// Final merged configuration for runtime.
#[derive(Debug, Clone)]
pub struct RuntimeConfig {
    pub chain_length: u64,
    pub tip_blocks: u64,
    pub tx_every: u64,
    pub honest_peers: usize,
    pub legacy_peers: usize,
    pub malicious_peers: usize,
    pub stalling_peers: usize,
    pub latency_ms: u64,
    pub jitter_ms: u64,
    pub stall_probability: f64,
    pub seed: Option<u64>,
    pub timeout_secs: u64,
    pub log_level: String,
    pub sync: SyncConfig,
    pub fetcher: FetcherConfig,
}

impl RuntimeConfig {
    /// Merge CLI args with config file. Precedence: CLI > config file > defaults.
    pub fn from_cli_and_file(cli: &Cli, file: ConfigFile) -> Result<Self, ConfigError> {
        let chain_length = cli
            .chain_length
            .or(file.chain_length)
            .ok_or(ConfigError::MissingRequired("chain-length"))?;
        if chain_length == 0 {
            return Err(ConfigError::Invalid("chain-length must be at least 1".into()));
        }

        let tip_blocks = cli.tip_blocks.or(file.tip_blocks).unwrap_or(3);
        let tx_every = cli.tx_every.or(file.tx_every).unwrap_or(4);

        let mut sync = file.sync.unwrap_or_default();
        if let Some(mode) = cli.mode.clone().or(file.mode) {
            sync.mode = parse_mode(&mode)?;
        }
        let fetcher = file.fetcher.unwrap_or_default();

        let honest_peers = cli.honest_peers.or(file.honest_peers).unwrap_or(4);
        if honest_peers == 0 {
            return Err(ConfigError::Invalid("at least one honest peer is required".into()));
        }
        let legacy_peers = cli.legacy_peers.or(file.legacy_peers).unwrap_or(0);
        if legacy_peers > honest_peers {
            return Err(ConfigError::Invalid(format!(
                "legacy-peers ({legacy_peers}) exceeds honest-peers ({honest_peers})"
            )));
        }
        if legacy_peers == honest_peers && sync.mode == SyncMode::Fast {
            return Err(ConfigError::Invalid(
                "fast sync needs at least one honest eth/63 peer".into(),
            ));
        }
        let malicious_peers = cli.malicious_peers.or(file.malicious_peers).unwrap_or(1);
        let stalling_peers = cli.stalling_peers.or(file.stalling_peers).unwrap_or(1);

        let latency_ms = cli.latency_ms.or(file.latency_ms).unwrap_or(50);
        let jitter_ms = cli.jitter_ms.or(file.jitter_ms).unwrap_or(25);
        let stall_probability = cli
            .stall_probability
            .or(file.stall_probability)
            .unwrap_or(0.02);
        if !(0.0..=1.0).contains(&stall_probability) {
            return Err(ConfigError::Invalid(format!(
                "stall-probability must be within [0, 1], got {stall_probability}"
            )));
        }

        let seed = cli.seed.or(file.seed);
        let timeout_secs = cli.timeout_secs.or(file.timeout_secs).unwrap_or(300);

        let log_level = cli
            .log_level
            .clone()
            .or(file.log_level)
            .unwrap_or_else(|| "info".to_string());

        Ok(RuntimeConfig {
            chain_length,
            tip_blocks,
            tx_every,
            honest_peers,
            legacy_peers,
            malicious_peers,
            stalling_peers,
            latency_ms,
            jitter_ms,
            stall_probability,
            seed,
            timeout_secs,
            log_level,
            sync,
            fetcher,
        })
    }

    pub fn total_peers(&self) -> usize {
        self.honest_peers + self.malicious_peers + self.stalling_peers
    }
}

fn parse_mode(mode: &str) -> Result<SyncMode, ConfigError> {
    match mode {
        "full" => Ok(SyncMode::Full),
        "fast" => Ok(SyncMode::Fast),
        other => Err(ConfigError::Invalid(format!(
            "unknown sync mode {other:?}, expected full or fast"
        ))),
    }
}

// ============================================================================
// ERRORS
// ============================================================================

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("--{0} is required (via CLI or config file)")]
    MissingRequired(&'static str),
    #[error("invalid configuration: {0}")]
    Invalid(String),
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("config parse error: {0}")]
    Toml(#[from] toml::de::Error),
}

// ============================================================================
// LOADING FUNCTIONS
// ============================================================================

/// Load TOML config file, returns default if path is None.
pub fn load_config_file(path: Option<&PathBuf>) -> Result<ConfigFile, ConfigError> {
    match path {
        Some(p) => {
            let content = std::fs::read_to_string(p)?;
            toml::from_str(&content).map_err(ConfigError::Toml)
        }
        None => Ok(ConfigFile::default()),
    }
}
