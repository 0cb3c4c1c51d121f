use std::path::Path;

use clap::Parser as _;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{
    EnvFilter, Layer as _, filter::LevelFilter, layer::SubscriberExt as _,
};

mod app;
mod cli;
mod rpc_server;

/// The returned guard must be held for the lifetime of the program, or
/// buffered file logs are lost.
fn set_tracing_subscriber(
    log_level: LevelFilter,
    log_dir: Option<&Path>,
) -> anyhow::Result<Option<WorkerGuard>> {
    let env_filter = || {
        EnvFilter::builder()
            .with_default_directive(log_level.into())
            .from_env_lossy()
    };
    let stdout_layer = tracing_subscriber::fmt::layer()
        .with_ansi(std::io::IsTerminal::is_terminal(&std::io::stdout()))
        .with_file(true)
        .with_line_number(true)
        .with_filter(env_filter());
    let (file_layer, guard) = match log_dir {
        Some(log_dir) => {
            let appender =
                tracing_appender::rolling::daily(log_dir, "poll_tally.log");
            let (writer, guard) = tracing_appender::non_blocking(appender);
            let layer = tracing_subscriber::fmt::layer()
                .with_ansi(false)
                .with_file(true)
                .with_line_number(true)
                .with_writer(writer)
                .with_filter(env_filter());
            (Some(layer), Some(guard))
        }
        None => (None, None),
    };
    let subscriber = tracing_subscriber::registry()
        .with(stdout_layer)
        .with(file_layer);
    tracing::subscriber::set_global_default(subscriber)?;
    Ok(guard)
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = cli::Cli::parse();
    let config = cli.get_config()?;
    let _log_guard =
        set_tracing_subscriber(config.log_level, config.log_dir.as_deref())?;
    tracing::info!(
        network = %config.network,
        stacks_api = %config.upstream.stacks_api_url,
        bitcoin_api = %config.upstream.bitcoin_api_url,
        "starting poll tally daemon"
    );
    let app = app::App::new(&config)?;
    let (addr, handle) =
        rpc_server::run_server(app.clone(), config.rpc_addr).await?;
    tracing::info!(%addr, "serving JSON-RPC");
    tokio::select! {
        res = tokio::signal::ctrl_c() => {
            res?;
            tracing::info!("received interrupt, shutting down");
        }
        () = app.shutdown_requested() => {}
        () = handle.clone().stopped() => {
            tracing::warn!("RPC server stopped unexpectedly");
            return Ok(());
        }
    }
    handle.stop()?;
    handle.stopped().await;
    Ok(())
}
