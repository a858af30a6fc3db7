use std::env;
use std::future::Future;
use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand};
use sweaty_core::config::Config;
use sweaty_providers::{build_provider, Credentials};
use sweaty_storage::HttpFetcher;
use sweaty_sync::{
    regenerate_outputs, reset_backfill, Interrupt, RunOptions, RuntimeConfig, SyncPipeline,
};
use tracing::warn;
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

mod settings;

#[derive(Debug, Parser)]
#[command(name = "sweaty")]
#[command(about = "Incremental activity sync and heatmap aggregation")]
struct Cli {
    /// Base config file; `config.local.yaml` next to it overrides it.
    #[arg(long, global = true, default_value = "config.yaml")]
    config: PathBuf,
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Fetch recent activities, continue the backfill, regenerate outputs.
    Sync(SyncArgs),
    /// Clear the selected source's backfill cursor.
    Reset,
    /// Regenerate outputs from stored activities without calling the provider.
    Aggregate,
}

#[derive(Debug, Clone, Copy, Default, Args)]
struct SyncArgs {
    #[arg(long)]
    prune_deleted: bool,
    #[arg(long)]
    reset_backfill: bool,
    /// Fetch and report without writing anything.
    #[arg(long)]
    dry_run: bool,
}

/// The first signal asks the run to stop after the current page. Resolves to
/// `true` when a second one arrives while it is still busy, e.g. sleeping
/// on the rate limiter.
async fn escalate_on_repeat<F, Fut>(mut next_signal: F, interrupt: Interrupt) -> bool
where
    F: FnMut() -> Fut,
    Fut: Future<Output = std::io::Result<()>>,
{
    if next_signal().await.is_err() {
        return false;
    }
    warn!("interrupt received; stopping after the current page (press Ctrl-C again to exit now)");
    interrupt.trigger();
    next_signal().await.is_ok()
}

fn init_tracing() {
    let filter =
        EnvFilter::try_from_env("SWEATY_LOG").unwrap_or_else(|_| EnvFilter::new("sweaty=info,warn"));
    let format = env::var("SWEATY_LOG_FORMAT").unwrap_or_else(|_| "compact".to_string());
    let registry = tracing_subscriber::registry().with(filter);
    match format.as_str() {
        "json" => registry
            .with(fmt::layer().json().with_ansi(false).with_writer(std::io::stderr))
            .init(),
        _ => registry
            .with(fmt::layer().compact().with_writer(std::io::stderr))
            .init(),
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing();
    let cli = Cli::parse();
    let config = settings::load_config(&cli.config)?;
    let runtime = RuntimeConfig::from_env();

    match cli.command.unwrap_or(Commands::Sync(SyncArgs::default())) {
        Commands::Sync(args) => run_sync(config, runtime, args).await?,
        Commands::Reset => {
            reset_backfill(&runtime.data_dir, config.source).await?;
            println!("backfill cursor cleared: source={}", config.source);
        }
        Commands::Aggregate => {
            let report = regenerate_outputs(&config, &runtime.data_dir).await?;
            println!(
                "aggregates written: days={} groups={} data_dir={}",
                report.days.len(),
                report.groups.len(),
                runtime.data_dir.display()
            );
        }
    }

    Ok(())
}

async fn run_sync(config: Config, runtime: RuntimeConfig, args: SyncArgs) -> Result<()> {
    let http = HttpFetcher::new(runtime.http_config())?;
    let provider = match build_provider(&config, &Credentials::from_env(), http) {
        Ok(provider) => provider,
        Err(err) => {
            // stored data stays readable even when the source is unreachable
            if !args.dry_run {
                regenerate_outputs(&config, &runtime.data_dir).await?;
            }
            return Err(err).with_context(|| format!("building {} client", config.source));
        }
    };

    let interrupt = Interrupt::new();
    let on_signal = interrupt.clone();
    tokio::spawn(async move {
        if escalate_on_repeat(tokio::signal::ctrl_c, on_signal).await {
            // every file is replaced atomically, so leaving mid-page is safe
            warn!("second interrupt; exiting without finishing the current page");
            std::process::exit(130);
        }
    });

    let pipeline =
        SyncPipeline::new(config, &runtime.data_dir, provider)?.with_interrupt(interrupt);
    let summary = pipeline
        .run_once(RunOptions {
            prune_deleted: args.prune_deleted,
            reset_backfill: args.reset_backfill,
            dry_run: args.dry_run,
        })
        .await?;

    println!(
        "sync complete: run_id={} source={} stop={} fetched={} new_or_updated={} dropped={} deleted={} stored={}",
        summary.run_id,
        summary.source,
        summary.stop_reason.as_str(),
        summary.fetched,
        summary.new_or_updated,
        summary.dropped,
        summary.deleted,
        summary.stored_activities
    );
    summary.ensure_success()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    /// Delivers `available` signals, then never again.
    fn signals(available: usize) -> impl FnMut() -> std::pin::Pin<Box<dyn Future<Output = std::io::Result<()>> + Send>> {
        let calls = Arc::new(AtomicUsize::new(0));
        move || {
            let n = calls.fetch_add(1, Ordering::SeqCst);
            Box::pin(async move {
                if n < available {
                    Ok(())
                } else {
                    std::future::pending().await
                }
            })
        }
    }

    #[tokio::test]
    async fn second_signal_escalates() {
        let interrupt = Interrupt::new();
        assert!(escalate_on_repeat(signals(2), interrupt.clone()).await);
        assert!(interrupt.is_triggered());
    }

    #[tokio::test]
    async fn single_signal_only_requests_a_stop() {
        let interrupt = Interrupt::new();
        let watcher = escalate_on_repeat(signals(1), interrupt.clone());
        tokio::pin!(watcher);
        tokio::select! {
            biased;
            _ = &mut watcher => panic!("one signal must not exit"),
            _ = tokio::task::yield_now() => {}
        }
        assert!(interrupt.is_triggered());
    }

    #[test]
    fn bare_invocation_defaults_to_sync() {
        let cli = Cli::try_parse_from(["sweaty"]).unwrap();
        assert!(cli.command.is_none());
        let cli = Cli::try_parse_from(["sweaty", "sync", "--dry-run", "--config", "x.yaml"]).unwrap();
        assert!(matches!(cli.command, Some(Commands::Sync(SyncArgs { dry_run: true, .. }))));
        assert_eq!(cli.config, PathBuf::from("x.yaml"));
    }
}
