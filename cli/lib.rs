use std::{fmt::Write as _, net::Ipv4Addr, time::Duration};

use clap::{Parser, Subcommand};
use http::HeaderMap;
use jsonrpsee::{core::client::ClientT, http_client::HttpClientBuilder};
use poll_tally::{
    btc::PoxCycles,
    types::{PollId, PollResultSet, StacksAddress},
};
use poll_tally_app_rpc_api::RpcClient;
use tracing_subscriber::layer::SubscriberExt as _;
use url::{Host, Url};

#[derive(Clone, Debug, Subcommand)]
#[command(arg_required_else_help(true))]
pub enum Command {
    /// List the polls served by the daemon
    ListPolls,
    /// Merged results for a poll across all voting channels
    PollResults {
        poll_id: PollId,
        /// Print the raw result set as JSON
        #[arg(long)]
        json: bool,
    },
    /// Load the next batch of ledger votes, newest first
    PollVotes {
        poll_id: PollId,
        /// Number of votes already loaded by earlier calls
        #[arg(default_value_t = 0, long)]
        already_loaded: u64,
        #[arg(long)]
        page_size: Option<u64>,
    },
    /// Cached balances for a poll's snapshot height
    SnapshotBalances { poll_id: PollId },
    /// BTC reward address to stacker mapping, e.g. `120,121`
    StackerMapping { cycles: PoxCycles },
    /// Daemon status
    Status,
    /// Stop the daemon
    Stop,
    /// Vote cast by one address in a poll's ledger
    VoteByUser {
        poll_id: PollId,
        address: StacksAddress,
    },
}

const DEFAULT_RPC_HOST: Host = Host::Ipv4(Ipv4Addr::LOCALHOST);

const DEFAULT_RPC_PORT: u16 = 6120;

const DEFAULT_TIMEOUT_SECS: u64 = 60;

#[derive(Clone, Debug, Parser)]
#[command(author, version, about, long_about = None)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Command,
    /// Host used for requests to the RPC server
    #[arg(default_value_t = DEFAULT_RPC_HOST, long, value_parser = Host::parse)]
    pub rpc_host: Host,
    /// Port used for requests to the RPC server
    #[arg(default_value_t = DEFAULT_RPC_PORT, long)]
    pub rpc_port: u16,
    /// Timeout for RPC requests in seconds.
    #[arg(default_value_t = DEFAULT_TIMEOUT_SECS, long = "timeout")]
    timeout_secs: u64,
    #[arg(short, long, help = "Enable verbose HTTP output")]
    pub verbose: bool,
}

impl Cli {
    pub fn new(
        command: Command,
        rpc_host: Option<Host>,
        rpc_port: Option<u16>,
        timeout_secs: Option<u64>,
        verbose: Option<bool>,
    ) -> Self {
        Self {
            command,
            rpc_host: rpc_host.unwrap_or(DEFAULT_RPC_HOST),
            rpc_port: rpc_port.unwrap_or(DEFAULT_RPC_PORT),
            timeout_secs: timeout_secs.unwrap_or(DEFAULT_TIMEOUT_SECS),
            verbose: verbose.unwrap_or(false),
        }
    }

    fn rpc_url(&self) -> Result<Url, url::ParseError> {
        Url::parse(&format!("http://{}:{}", self.rpc_host, self.rpc_port))
    }
}

/// Fixed-width table of the merged tallies
fn render_results(results: &PollResultSet) -> String {
    let mut out = String::new();
    let snapshot = match results.snapshot_height {
        Some(height) => format!("snapshot {height}"),
        None => "chain tip".to_owned(),
    };
    let _ = writeln!(out, "poll {} at {snapshot}", results.poll_id);
    let _ = writeln!(
        out,
        "total votes: {}, unique voters: {}",
        results.total_votes, results.total_unique_voters
    );
    let _ = writeln!(
        out,
        "{:<24} {:>14} {:>8} {:>14} {:>14}",
        "option", "votes", "%", "locked", "unlocked"
    );
    for tally in &results.tallies {
        let _ = writeln!(
            out,
            "{:<24} {:>14} {:>8.2} {:>14} {:>14}",
            tally.option_id.0,
            tally.raw_count,
            tally.percentage,
            tally.locked_stx,
            tally.unlocked_stx
        );
    }
    out.trim_end().to_owned()
}

/// Handle a command, returning CLI output
async fn handle_command<RpcClient>(
    rpc_client: &RpcClient,
    command: Command,
) -> anyhow::Result<String>
where
    RpcClient: ClientT + Sync,
{
    Ok(match command {
        Command::ListPolls => {
            let polls = rpc_client.list_polls().await?;
            serde_json::to_string_pretty(&polls)?
        }
        Command::PollResults { poll_id, json } => {
            let results = rpc_client.poll_results(poll_id).await?;
            if json {
                serde_json::to_string_pretty(&results)?
            } else {
                render_results(&results)
            }
        }
        Command::PollVotes {
            poll_id,
            already_loaded,
            page_size,
        } => {
            let votes = rpc_client
                .poll_votes(poll_id, already_loaded, page_size)
                .await?;
            serde_json::to_string_pretty(&votes)?
        }
        Command::SnapshotBalances { poll_id } => {
            let balances = rpc_client.snapshot_balances(poll_id).await?;
            serde_json::to_string_pretty(&balances)?
        }
        Command::StackerMapping { cycles } => {
            let mapping = rpc_client.stacker_mapping(cycles.0).await?;
            serde_json::to_string_pretty(&mapping)?
        }
        Command::Status => {
            let status = rpc_client.status().await?;
            serde_json::to_string_pretty(&status)?
        }
        Command::Stop => {
            let () = rpc_client.stop().await?;
            String::default()
        }
        Command::VoteByUser { poll_id, address } => {
            let vote = rpc_client.vote_by_user(poll_id, address).await?;
            serde_json::to_string_pretty(&vote)?
        }
    })
}

fn set_tracing_subscriber() -> anyhow::Result<()> {
    let stdout_layer = tracing_subscriber::fmt::layer()
        .with_ansi(std::io::IsTerminal::is_terminal(&std::io::stdout()))
        .with_file(true)
        .with_line_number(true);

    let subscriber = tracing_subscriber::registry().with(stdout_layer);
    tracing::subscriber::set_global_default(subscriber)?;
    Ok(())
}

impl Cli {
    pub async fn run(self) -> anyhow::Result<String> {
        if self.verbose {
            set_tracing_subscriber()?;
        }
        let request_id = uuid::Uuid::new_v4().as_simple().to_string();
        tracing::info!(%request_id);
        let builder = HttpClientBuilder::default()
            .request_timeout(Duration::from_secs(self.timeout_secs))
            .set_max_logging_length(1024)
            .set_headers(HeaderMap::from_iter([(
                http::header::HeaderName::from_static("x-request-id"),
                http::header::HeaderValue::from_str(&request_id)?,
            )]));
        let client = builder.build(self.rpc_url()?)?;
        let result = handle_command(&client, self.command).await?;
        Ok(result)
    }
}
