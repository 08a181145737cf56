use std::io::Write;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use clap::Parser;
use tokio::signal;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use cachelimit::config::{CachelimitConfig, LogFormat, LoggingConfig};
use cachelimit::{Clock, CounterStore, Limiter, MemoryStore, SystemClock};

/// Drive a limiter against an in-process store and report each decision.
#[derive(Debug, Parser)]
#[command(name = "cachelimit", version, about)]
struct Cli {
    /// YAML configuration file
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Identity to rate limit
    #[arg(short, long, default_value = "anonymous")]
    identity: String,

    /// Number of checks to run
    #[arg(short = 'n', long, default_value_t = 10)]
    hits: u64,

    /// Pause between checks in milliseconds
    #[arg(long, default_value_t = 0)]
    interval_ms: u64,

    /// Override the configured threshold
    #[arg(long)]
    max_hits_per_minute: Option<u64>,

    /// Print one JSON object per decision
    #[arg(long)]
    json: bool,
}

fn init_tracing(logging: &LoggingConfig) {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(logging.level.as_str()));

    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_thread_ids(true);

    match logging.format {
        LogFormat::Text => builder.init(),
        LogFormat::Json => builder.json().init(),
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let mut config = CachelimitConfig::load(cli.config.as_deref())?;
    if let Some(max) = cli.max_hits_per_minute {
        config.limiter.max_hits_per_minute = max;
    }

    init_tracing(&config.logging);
    info!("Version: {}", env!("CARGO_PKG_VERSION"));
    match &cli.config {
        Some(path) => info!(path = %path.display(), "Configuration loaded"),
        None => info!("Configuration loaded from defaults and environment"),
    }

    let clock: Arc<dyn Clock> = Arc::new(SystemClock::new());
    let store = Arc::new(MemoryStore::with_clock(clock.clone()));
    let limiter = config.limiter.build_limiter(store, clock)?;
    info!(
        description = %limiter.description(),
        max_hits_per_minute = limiter.max_hits_per_minute(),
        "Limiter initialized"
    );

    let ctx = CancellationToken::new();
    tokio::spawn(cancel_on_shutdown(ctx.clone()));

    run_checks(&limiter, &ctx, &cli, &mut std::io::stdout()).await?;

    let estimate = limiter.estimate(&CancellationToken::new(), &cli.identity).await?;
    info!(
        identity = %cli.identity,
        mitigated = estimate.mitigated,
        rate = estimate.rate,
        "Final estimate"
    );

    Ok(())
}

/// Run `cli.hits` decisions for `cli.identity`, writing one line each to `out`.
///
/// A failed decision ends the run with an error. Cancellation during the
/// pause between checks ends it cleanly.
async fn run_checks<S: CounterStore>(
    limiter: &Limiter<S>,
    ctx: &CancellationToken,
    cli: &Cli,
    out: &mut impl Write,
) -> anyhow::Result<()> {
    for hit in 1..=cli.hits {
        let decision = limiter
            .limited(ctx, &cli.identity)
            .await
            .with_context(|| format!("rate limit decision unavailable at hit {}", hit))?;

        if cli.json {
            let line = serde_json::json!({
                "hit": hit,
                "identity": cli.identity,
                "decision": decision,
            });
            writeln!(out, "{}", line)?;
        } else {
            writeln!(out, "{:>4} {} {}", hit, cli.identity, decision)?;
        }

        if cli.interval_ms > 0 {
            tokio::select! {
                _ = tokio::time::sleep(Duration::from_millis(cli.interval_ms)) => {}
                _ = ctx.cancelled() => break,
            }
        }
    }
    Ok(())
}

/// Cancel `ctx` on Ctrl+C or SIGTERM.
async fn cancel_on_shutdown(ctx: CancellationToken) {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            warn!(error = %e, "Failed to install Ctrl+C handler");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                warn!(error = %e, "Failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            info!("Received Ctrl+C, cancelling");
        }
        _ = terminate => {
            info!("Received SIGTERM, cancelling");
        }
    }

    ctx.cancel();
}
