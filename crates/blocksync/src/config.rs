use std::path::PathBuf;
use std::time::Duration;

use clap::Parser;
use serde::Deserialize;
use sync::ExchangeConfig;
use thiserror::Error;

// ============================================================================
// CLI STRUCTS
// ============================================================================

/// blocksync: staged header/body downloader driven through a p2p sentry.
#[derive(Parser, Debug)]
#[command(name = "blocksync", version)]
pub struct Cli {
    /// Path to TOML configuration file.
    #[arg(short = 'C', long)]
    pub config: Option<PathBuf>,

    /// Chain to sync (mainnet, ropsten, sepolia).
    #[arg(long)]
    pub chain: Option<String>,

    /// Sentry gRPC/JSON-RPC endpoint (host:port).
    #[arg(long = "sentry.api.addr")]
    pub sentry_api_addr: Option<String>,

    /// Max number of blocks requested to peers in a single request.
    #[arg(long)]
    pub max_blocks_per_req: Option<u64>,

    /// Max number of pending requests made to each peer.
    #[arg(long)]
    pub max_requests_per_peer: Option<usize>,

    /// Time (secs) after which a response is considered lost and re-tried.
    #[arg(long)]
    pub request_deadline_s: Option<u64>,

    /// Time (msecs) to wait before a new request when no peer accepted
    /// the last one.
    #[arg(long)]
    pub no_peer_delay_ms: Option<u64>,

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
    pub chain: Option<String>,
    pub sentry_api_addr: Option<String>,
    pub max_blocks_per_req: Option<u64>,
    pub max_requests_per_peer: Option<usize>,
    pub request_deadline_s: Option<u64>,
    pub no_peer_delay_ms: Option<u64>,
    pub log_level: Option<String>,
}

// ============================================================================
// RUNTIME CONFIG
// ============================================================================

/// Final merged configuration for runtime.
#[derive(Debug)]
pub struct RuntimeConfig {
    pub chain: String,
    pub sentry_api_addr: String,
    pub exchange: ExchangeConfig,
    pub log_level: String,
}

impl RuntimeConfig {
    /// Merge CLI args with config file. Precedence: CLI > config file > defaults.
    pub fn from_cli_and_file(cli: &Cli, file: ConfigFile) -> Result<Self, ConfigError> {
        let defaults = ExchangeConfig::default();

        let chain = cli
            .chain
            .clone()
            .or(file.chain)
            .unwrap_or_else(|| "mainnet".to_string());

        let sentry_api_addr = cli
            .sentry_api_addr
            .clone()
            .or(file.sentry_api_addr)
            .unwrap_or_else(|| "127.0.0.1:9091".to_string());

        let max_blocks_per_req = cli
            .max_blocks_per_req
            .or(file.max_blocks_per_req)
            .unwrap_or(defaults.max_blocks_per_req);
        if max_blocks_per_req == 0 {
            return Err(ConfigError::InvalidValue("max_blocks_per_req"));
        }

        let max_requests_per_peer = cli
            .max_requests_per_peer
            .or(file.max_requests_per_peer)
            .unwrap_or(defaults.max_requests_per_peer);
        if max_requests_per_peer == 0 {
            return Err(ConfigError::InvalidValue("max_requests_per_peer"));
        }

        let request_deadline = cli
            .request_deadline_s
            .or(file.request_deadline_s)
            .map(Duration::from_secs)
            .unwrap_or(defaults.request_deadline);

        let no_peer_delay = cli
            .no_peer_delay_ms
            .or(file.no_peer_delay_ms)
            .map(Duration::from_millis)
            .unwrap_or(defaults.no_peer_delay);

        let log_level = cli
            .log_level
            .clone()
            .or(file.log_level)
            .unwrap_or_else(|| "info".to_string());

        Ok(RuntimeConfig {
            chain,
            sentry_api_addr,
            exchange: ExchangeConfig {
                max_blocks_per_req,
                max_requests_per_peer,
                request_deadline,
                no_peer_delay,
            },
            log_level,
        })
    }
}

// ============================================================================
// ERRORS
// ============================================================================

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("--{0} must be greater than zero")]
    InvalidValue(&'static str),
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

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(args: &[&str]) -> Cli {
        Cli::try_parse_from(std::iter::once("blocksync").chain(args.iter().copied())).unwrap()
    }

    #[test]
    fn defaults_match_the_documented_values() {
        let rc = RuntimeConfig::from_cli_and_file(&parse(&[]), ConfigFile::default()).unwrap();
        assert_eq!(rc.chain, "mainnet");
        assert_eq!(rc.sentry_api_addr, "127.0.0.1:9091");
        assert_eq!(rc.exchange.max_blocks_per_req, 128);
        assert_eq!(rc.exchange.max_requests_per_peer, 4);
        assert_eq!(rc.exchange.request_deadline, Duration::from_secs(30));
        assert_eq!(rc.exchange.no_peer_delay, Duration::from_millis(1000));
    }

    #[test]
    fn cli_overrides_file() {
        let cli = parse(&["--max_blocks_per_req", "64", "--chain", "sepolia"]);
        let file = ConfigFile {
            max_blocks_per_req: Some(32),
            chain: Some("ropsten".to_string()),
            sentry_api_addr: Some("10.0.0.1:9999".to_string()),
            ..Default::default()
        };
        let rc = RuntimeConfig::from_cli_and_file(&cli, file).unwrap();
        assert_eq!(rc.exchange.max_blocks_per_req, 64);
        assert_eq!(rc.chain, "sepolia");
        assert_eq!(rc.sentry_api_addr, "10.0.0.1:9999");
    }

    #[test]
    fn zero_values_are_rejected() {
        let cli = parse(&["--max_blocks_per_req", "0"]);
        assert!(RuntimeConfig::from_cli_and_file(&cli, ConfigFile::default()).is_err());
        let cli = parse(&["--max_requests_per_peer", "0"]);
        assert!(RuntimeConfig::from_cli_and_file(&cli, ConfigFile::default()).is_err());
    }

    #[test]
    fn deadline_flags_convert_to_durations() {
        let cli = parse(&["--request_deadline_s", "5", "--no_peer_delay_ms", "250"]);
        let rc = RuntimeConfig::from_cli_and_file(&cli, ConfigFile::default()).unwrap();
        assert_eq!(rc.exchange.request_deadline, Duration::from_secs(5));
        assert_eq!(rc.exchange.no_peer_delay, Duration::from_millis(250));
    }

    #[test]
    fn unknown_cli_flag_fails_parsing() {
        assert!(Cli::try_parse_from(["blocksync", "--bogus"]).is_err());
    }
}
