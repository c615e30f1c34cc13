//! pgtup-agent — PostgreSQL tuple-counter metrics agent.
//!
//! Samples `tup_inserted` / `tup_updated` from `pg_stat_database` every
//! interval and exposes them on `/metrics` as Prometheus counters (lifetime
//! totals) and gauges (last-interval deltas).
//!
//! Sampling and scraping are independent: the scrape interval should be at
//! least the sampling interval, otherwise a scraper sees the same gauge value
//! several times.

mod http;

#[cfg(not(target_env = "msvc"))]
use tikv_jemallocator::Jemalloc;

#[cfg(not(target_env = "msvc"))]
#[global_allocator]
static GLOBAL: Jemalloc = Jemalloc;

use std::net::SocketAddr;
use std::process;
use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use tokio_util::sync::CancellationToken;
use tracing::level_filters::LevelFilter;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use pgtup_core::source::PostgresSource;
use pgtup_core::{Driver, Publisher};

/// PostgreSQL tuple-counter metrics agent.
#[derive(Parser)]
#[command(name = "pgtup-agent", about = "PostgreSQL tuple-counter metrics agent", version = pgtup_core::VERSION)]
struct Args {
    /// PostgreSQL connection string (URL or key=value).
    /// If not set, PGHOST/PGPORT/PGUSER/PGPASSWORD/PGDATABASE are used.
    #[arg(long, env = "DATABASE_URL", hide_env_values = true)]
    database_url: Option<String>,

    /// Listen address of the metrics endpoint.
    #[arg(long, default_value = "0.0.0.0:5480", env = "PGTUP_LISTEN")]
    listen: SocketAddr,

    /// Sampling interval in milliseconds.
    #[arg(long, default_value = "10000", env = "PGTUP_INTERVAL_MS", value_parser = parse_interval_ms)]
    interval_ms: u64,

    /// Snapshot fetch timeout in milliseconds. Defaults to (and is capped at) the interval.
    #[arg(long, env = "PGTUP_FETCH_TIMEOUT_MS")]
    fetch_timeout_ms: Option<u64>,

    /// Metric name prefix.
    #[arg(long, default_value = "pg", env = "PGTUP_PREFIX")]
    prefix: String,

    /// Increase logging verbosity (-v for debug, -vv for trace). Default is info level.
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,

    /// Quiet mode - only show errors.
    #[arg(short, long)]
    quiet: bool,
}

impl Args {
    fn interval(&self) -> Duration {
        Duration::from_millis(self.interval_ms)
    }

    /// Fetch timeout, never longer than the interval.
    fn fetch_timeout(&self) -> Duration {
        match self.fetch_timeout_ms {
            Some(ms) if ms > 0 => Duration::from_millis(ms).min(self.interval()),
            _ => self.interval(),
        }
    }
}

fn parse_interval_ms(s: &str) -> Result<u64, String> {
    match s.trim().parse::<u64>() {
        Ok(0) => Err("interval must be greater than zero".to_string()),
        Ok(ms) => Ok(ms),
        Err(e) => Err(format!("invalid interval '{}': {}", s, e)),
    }
}

/// Initializes the tracing subscriber with the appropriate log level.
/// Default level is INFO. Use -q for quiet mode (errors only).
fn init_logging(verbose: u8, quiet: bool) {
    let level = if quiet {
        LevelFilter::ERROR
    } else {
        match verbose {
            0 => LevelFilter::INFO,
            1 => LevelFilter::DEBUG,
            _ => LevelFilter::TRACE,
        }
    };

    let filter = EnvFilter::builder()
        .with_default_directive(level.into())
        .from_env_lossy();

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .init();
}

fn main() {
    let args = Args::parse();
    init_logging(args.verbose, args.quiet);

    info!(version = pgtup_core::VERSION, "pgtup-agent starting");
    info!(
        interval_ms = args.interval_ms,
        fetch_timeout_ms = args.fetch_timeout().as_millis() as u64,
        listen = %args.listen,
        prefix = %args.prefix,
        "configuration loaded (scrape interval should be >= sampling interval)"
    );

    let publisher = match Publisher::new(&args.prefix) {
        Ok(p) => Arc::new(p),
        Err(e) => {
            error!(error = %e, "failed to set up metrics registry");
            process::exit(1);
        }
    };

    let source = match &args.database_url {
        Some(url) => PostgresSource::with_connection_string(url.clone()),
        None => match PostgresSource::from_env() {
            Ok(source) => source,
            Err(e) => {
                error!(error = %e, "no PostgreSQL connection configured");
                process::exit(1);
            }
        },
    };
    let mut source = source.with_statement_timeout(args.fetch_timeout());

    // A database we cannot reach at startup is fatal; later failures are not.
    if let Err(e) = source.try_connect() {
        error!(error = %e, "could not connect to PostgreSQL");
        process::exit(1);
    }

    let driver = Driver::new(source, publisher.clone(), args.interval())
        .with_fetch_timeout(args.fetch_timeout());

    let runtime = match tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
    {
        Ok(rt) => rt,
        Err(e) => {
            error!(error = %e, "failed to build tokio runtime");
            process::exit(1);
        }
    };

    let code = runtime.block_on(async_main(args.listen, driver, publisher));
    process::exit(code);
}

async fn async_main(listen: SocketAddr, driver: Driver, publisher: Arc<Publisher>) -> i32 {
    let cancel = CancellationToken::new();
    tokio::spawn(shutdown_signal(cancel.clone()));

    let listener = match tokio::net::TcpListener::bind(listen).await {
        Ok(l) => l,
        Err(e) => {
            error!(%listen, error = %e, "failed to bind metrics listener");
            return 1;
        }
    };
    info!(%listen, "serving metrics at /metrics");

    let sampler = tokio::spawn(driver.run(cancel.clone()));

    let app = http::router(publisher);
    let server = axum::serve(listener, app).with_graceful_shutdown(cancel.clone().cancelled_owned());
    let code = match server.await {
        Ok(()) => 0,
        Err(e) => {
            error!(error = %e, "metrics server failed");
            1
        }
    };

    cancel.cancel();
    if let Err(e) = sampler.await {
        warn!(error = %e, "sampling loop ended abnormally");
    }
    info!("pgtup-agent stopped");
    code
}

/// Cancels `cancel` on Ctrl-C or SIGTERM.
async fn shutdown_signal(cancel: CancellationToken) {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            warn!(error = %e, "failed to listen for Ctrl-C");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut sig) => {
                sig.recv().await;
            }
            Err(e) => {
                warn!(error = %e, "failed to listen for SIGTERM");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
    info!("received shutdown signal");
    cancel.cancel();
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_interval_rejects_zero_and_garbage() {
        assert_eq!(parse_interval_ms("250"), Ok(250));
        assert!(parse_interval_ms("0").is_err());
        assert!(parse_interval_ms("ten").is_err());
    }

    #[test]
    fn defaults_match_agent_conventions() {
        let args = Args::try_parse_from(["pgtup-agent"]).unwrap();
        assert_eq!(args.listen, "0.0.0.0:5480".parse::<SocketAddr>().unwrap());
        assert_eq!(args.interval(), Duration::from_secs(10));
        assert_eq!(args.fetch_timeout(), Duration::from_secs(10));
        assert_eq!(args.prefix, "pg");
    }

    #[test]
    fn fetch_timeout_is_capped_at_interval() {
        let args = Args::try_parse_from([
            "pgtup-agent",
            "--interval-ms",
            "1000",
            "--fetch-timeout-ms",
            "5000",
        ])
        .unwrap();
        assert_eq!(args.fetch_timeout(), Duration::from_secs(1));

        let args = Args::try_parse_from([
            "pgtup-agent",
            "--interval-ms",
            "1000",
            "--fetch-timeout-ms",
            "300",
        ])
        .unwrap();
        assert_eq!(args.fetch_timeout(), Duration::from_millis(300));
    }

    #[test]
    fn cli_definition_is_consistent() {
        use clap::CommandFactory;
        Args::command().debug_assert();
    }
}
