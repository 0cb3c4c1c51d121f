use std::{
    net::{IpAddr, Ipv4Addr, SocketAddr},
    num::NonZeroU32,
    path::PathBuf,
    time::Duration,
};

use clap::Parser;
use poll_tally::{
    btc,
    config::{TallyConfig, UpstreamConfig},
    retry::{Backoff, RetryPolicy},
    types::Network,
};
use tracing_subscriber::filter::LevelFilter;
use url::Url;

const DEFAULT_RPC_ADDR: SocketAddr =
    SocketAddr::new(IpAddr::V4(Ipv4Addr::LOCALHOST), 6120);

#[derive(Clone, Debug, Parser)]
#[command(author, version, about, long_about = None)]
pub struct Cli {
    /// Bitcoin API root (Esplora compatible). Defaults to a public API for
    /// the selected network
    #[arg(long)]
    bitcoin_api_url: Option<Url>,
    /// Confirmed transactions read per BTC option address, newest first
    #[arg(default_value_t = btc::DEFAULT_HISTORY_LIMIT, long)]
    btc_history_limit: usize,
    /// Public read root of the snapshot cache. Without one, snapshots are
    /// cached in memory
    #[arg(long)]
    cache_read_url: Option<Url>,
    /// Bearer token for cache writes
    #[arg(long, env = "POLL_TALLY_CACHE_TOKEN", hide_env_values = true)]
    cache_token: Option<String>,
    /// Authenticated write root of the snapshot cache
    #[arg(long)]
    cache_write_url: Option<Url>,
    /// Write logs to daily rotated files in this directory
    #[arg(long)]
    log_dir: Option<PathBuf>,
    /// Log level, overridden by `RUST_LOG`
    #[arg(default_value_t = LevelFilter::INFO, long)]
    log_level: LevelFilter,
    /// Bound on in-flight upstream requests per fan-out
    #[arg(default_value_t = 16, long)]
    max_concurrent_requests: usize,
    #[arg(default_value_t = Network::Mainnet, long, value_enum)]
    network: Network,
    /// JSON file with the poll definitions to serve
    #[arg(default_value = "polls.json", long, short)]
    polls_file: PathBuf,
    #[arg(default_value_t = 30, long)]
    request_timeout_secs: u64,
    /// Process-wide upstream request rate limit
    #[arg(default_value_t = UpstreamConfig::DEFAULT_REQUESTS_PER_SECOND, long)]
    requests_per_second: NonZeroU32,
    /// Attempts per PoX registry page, including the first
    #[arg(default_value_t = 18, long)]
    retry_attempts: u32,
    /// Delay between PoX registry retries, or the initial delay with
    /// `--retry-exponential`
    #[arg(default_value_t = 10_000, long)]
    retry_delay_ms: u64,
    /// Back off exponentially with jitter instead of a fixed delay
    #[arg(long)]
    retry_exponential: bool,
    /// Socket address to serve JSON-RPC on
    #[arg(default_value_t = DEFAULT_RPC_ADDR, long)]
    rpc_addr: SocketAddr,
    /// Stacks API root. Defaults to a public API for the selected network
    #[arg(long)]
    stacks_api_url: Option<Url>,
}

#[derive(Clone, Debug)]
pub struct Config {
    pub log_dir: Option<PathBuf>,
    pub log_level: LevelFilter,
    pub network: Network,
    pub polls_file: PathBuf,
    pub rpc_addr: SocketAddr,
    pub tally: TallyConfig,
    pub upstream: UpstreamConfig,
}

impl Cli {
    fn retry_policy(&self) -> RetryPolicy {
        let delay = Duration::from_millis(self.retry_delay_ms);
        if self.retry_exponential {
            RetryPolicy::exponential(self.retry_attempts, delay)
        } else {
            RetryPolicy {
                max_attempts: self.retry_attempts,
                backoff: Backoff::Fixed { delay },
            }
        }
    }

    pub fn get_config(self) -> anyhow::Result<Config> {
        let stacks_api_url = match &self.stacks_api_url {
            Some(url) => url.clone(),
            None => Url::parse(self.network.default_stacks_api_url())?,
        };
        let bitcoin_api_url = match &self.bitcoin_api_url {
            Some(url) => url.clone(),
            None => Url::parse(self.network.default_bitcoin_api_url())?,
        };
        if self.cache_write_url.is_some() && self.cache_read_url.is_none() {
            anyhow::bail!("`--cache-write-url` requires `--cache-read-url`");
        }
        let upstream = UpstreamConfig {
            cache_read_url: self.cache_read_url.clone(),
            cache_write_url: self.cache_write_url.clone(),
            cache_token: self.cache_token.clone(),
            request_timeout: Duration::from_secs(self.request_timeout_secs),
            requests_per_second: self.requests_per_second,
            ..UpstreamConfig::new(self.network, stacks_api_url, bitcoin_api_url)
        };
        let tally = TallyConfig {
            network: self.network,
            max_concurrent_requests: self.max_concurrent_requests.max(1),
            btc_history_limit: self.btc_history_limit.max(1),
            retry: self.retry_policy(),
            ..TallyConfig::default()
        };
        Ok(Config {
            log_dir: self.log_dir,
            log_level: self.log_level,
            network: self.network,
            polls_file: self.polls_file,
            rpc_addr: self.rpc_addr,
            tally,
            upstream,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config(args: &[&str]) -> Config {
        let args = std::iter::once("poll_tally_app")
            .chain(["--polls-file", "polls.json"])
            .chain(args.iter().copied());
        Cli::try_parse_from(args).unwrap().get_config().unwrap()
    }

    #[test]
    fn test_defaults() {
        let config = config(&[]);
        assert_eq!(config.network, Network::Mainnet);
        assert_eq!(config.rpc_addr, DEFAULT_RPC_ADDR);
        assert_eq!(config.log_level, LevelFilter::INFO);
        assert_eq!(config.tally.retry, RetryPolicy::default());
        assert_eq!(
            config.upstream.stacks_api_url.as_str(),
            "https://api.hiro.so/"
        );
        assert!(config.upstream.cache_read_url.is_none());
    }

    #[test]
    fn test_testnet_with_exponential_retry() {
        let config = config(&[
            "--network",
            "testnet",
            "--retry-attempts",
            "5",
            "--retry-delay-ms",
            "250",
            "--retry-exponential",
            "--requests-per-second",
            "4",
            "--btc-history-limit",
            "100",
        ]);
        assert_eq!(config.tally.network, Network::Testnet);
        assert_eq!(config.upstream.network, Network::Testnet);
        assert_eq!(
            config.tally.retry,
            RetryPolicy::exponential(5, Duration::from_millis(250))
        );
        assert_eq!(config.upstream.requests_per_second.get(), 4);
        assert_eq!(config.tally.btc_history_limit, 100);
        assert!(
            config
                .upstream
                .bitcoin_api_url
                .as_str()
                .starts_with("https://mempool.space/testnet4/api")
        );
    }

    #[test]
    fn test_cache_write_requires_read() {
        let res = Cli::try_parse_from([
            "poll_tally_app",
            "--polls-file",
            "polls.json",
            "--cache-write-url",
            "https://cache.example.com/upload",
        ])
        .unwrap()
        .get_config();
        assert!(res.is_err());
    }

    #[test]
    fn test_rejects_unknown_network() {
        let res = Cli::try_parse_from([
            "poll_tally_app",
            "--polls-file",
            "polls.json",
            "--network",
            "regtest",
        ]);
        assert!(res.is_err());
    }
}
