//! CLI entry point for contend
//!
//! Provides two benchmarks against one shared SQLite database:
//! - `run`: timed write contention between N peers
//! - `pool`: query throughput through a round-robin connection pool
//!
//! # Usage
//!
//! ```bash
//! contend run --peers 3 --backend rollback --duration-ms 5000
//! contend pool --concurrency 8 --queries 10000 --use-mutex
//! ```
//!
//! Settings come from `config/contend.toml` (or `--config`), then
//! `CONTEND_*` environment variables, then the flags.

#[cfg(not(test))]
#[global_allocator]
static GLOBAL: mimalloc::MiMalloc = mimalloc::MiMalloc;

use std::path::PathBuf;
use std::time::{Duration, Instant};

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use contend_core::config::{ContendConfig, DEFAULT_CONFIG_PATH};
use contend_core::{tracing_init, Batch, ConnectionFactory, EndTime, PeerId};
use contend_peer::{reset_tables, PeerCoordinator, PeerEvent, PeerHandle, Registry};
use contend_pool::ConnectionJobPool;
use contend_sqlite::SqliteBackend;
use futures::future::try_join_all;
use tokio::sync::broadcast;
use tracing::{debug, info};

/// Extra time a peer gets past the deadline to reconcile.
const SETTLE_TIME: Duration = Duration::from_secs(30);

#[derive(Parser, Debug)]
#[command(name = "contend")]
#[command(about = "Timed write-contention and connection pool benchmarks", long_about = None)]
struct Cli {
    /// Configuration file (TOML)
    #[arg(long, global = true, default_value = DEFAULT_CONFIG_PATH)]
    config: PathBuf,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Start N peers on one database and run one timed contention round
    Run {
        /// Number of peers
        #[arg(long)]
        peers: Option<usize>,

        /// Backend label from the configured catalog
        #[arg(long)]
        backend: Option<String>,

        /// Length of the round in milliseconds
        #[arg(long)]
        duration_ms: Option<u64>,

        /// Delete the database files before the first peer opens
        #[arg(long)]
        clear: bool,
    },

    /// Measure query throughput through the connection pool
    Pool {
        /// Number of pooled connections
        #[arg(long)]
        concurrency: Option<usize>,

        /// Funnel every connection through one global mutex
        #[arg(long)]
        use_mutex: bool,

        /// Number of queries to issue
        #[arg(long)]
        queries: Option<usize>,

        /// Backend label from the configured catalog
        #[arg(long)]
        backend: Option<String>,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let mut config = ContendConfig::load_from(&cli.config)
        .with_context(|| format!("loading {}", cli.config.display()))?;

    match cli.command {
        Commands::Run {
            peers,
            backend,
            duration_ms,
            clear,
        } => {
            if let Some(peers) = peers {
                config.benchmark.peers = peers;
            }
            if let Some(backend) = backend {
                config.benchmark.backend = backend;
            }
            if let Some(duration_ms) = duration_ms {
                config.benchmark.duration_ms = duration_ms;
            }
            config.benchmark.clear |= clear;
            config.validate()?;
            tracing_init::init_from_config(&config)?;
            run_contention(&config).await
        }
        Commands::Pool {
            concurrency,
            use_mutex,
            queries,
            backend,
        } => {
            if let Some(concurrency) = concurrency {
                config.pool.concurrency = concurrency;
            }
            if let Some(queries) = queries {
                config.pool.queries = queries;
            }
            if let Some(backend) = backend {
                config.benchmark.backend = backend;
            }
            config.pool.use_mutex |= use_mutex;
            config.validate()?;
            tracing_init::init_from_config(&config)?;
            run_pool(&config).await
        }
    }
}

async fn run_contention(config: &ContendConfig) -> Result<()> {
    let settings = &config.benchmark;
    let backend = SqliteBackend::new(config.backend(&settings.backend)?.clone());
    let (bus, registry) = Registry::in_memory();

    println!(
        "contend: {} peers on '{}' ({}) for {} ms",
        settings.peers,
        backend.label(),
        backend.path().display(),
        settings.duration_ms
    );

    let mut peers: Vec<(PeerHandle, broadcast::Receiver<PeerEvent>)> = Vec::new();
    for index in 0..settings.peers {
        let peer = PeerCoordinator::new(bus.clone());
        let events = peer.subscribe();
        // Only the first peer clears; later ones would wipe a live database.
        let clear = settings.clear && index == 0;
        peer.initialize(&backend, clear)
            .await
            .with_context(|| format!("starting peer {}", index))?;
        peers.push((peer, events));
    }
    info!(peers = registry.count().await, "All peers registered");

    let (first, _) = &peers[0];
    first.request_start(settings.duration()).await?;

    let deadline = settings.duration() + SETTLE_TIME;
    let rounds = peers
        .iter_mut()
        .map(|(peer, events)| follow_round(peer.id().clone(), events, deadline));
    try_join_all(rounds).await?;

    println!("{} peers still connected", registry.count().await);
    for (peer, _) in peers {
        peer.close();
    }
    Ok(())
}

/// Print one peer's transcript until it is ready again.
async fn follow_round(
    peer: PeerId,
    events: &mut broadcast::Receiver<PeerEvent>,
    deadline: Duration,
) -> Result<EndTime> {
    let short = peer.as_str().get(..8).unwrap_or(peer.as_str());
    let mut end = None;
    let started = Instant::now();
    loop {
        let remaining = deadline.saturating_sub(started.elapsed());
        let event = match tokio::time::timeout(remaining, events.recv()).await {
            Ok(Ok(event)) => event,
            Ok(Err(broadcast::error::RecvError::Lagged(skipped))) => {
                debug!(peer = short, skipped, "Transcript lagged");
                continue;
            }
            Ok(Err(broadcast::error::RecvError::Closed)) => bail!("peer {} went away", short),
            Err(_) => bail!("peer {} did not finish within {:?}", short, deadline),
        };
        match event {
            PeerEvent::Log(line) => println!("[{}] {}", short, line),
            PeerEvent::Go(at) => end = Some(at),
            PeerEvent::Clients(count) => println!("[{}] clients: {}", short, count),
            PeerEvent::Ready => {
                if let Some(end) = end {
                    return Ok(end);
                }
            }
        }
    }
}

async fn run_pool(config: &ContendConfig) -> Result<()> {
    let settings = &config.pool;
    let backend = SqliteBackend::new(config.backend(&config.benchmark.backend)?.clone());
    let pool = ConnectionJobPool::open(&backend, settings).await?;
    reset_tables(&pool).await?;

    let started = Instant::now();
    let queries = (0..settings.queries).map(|_| {
        pool.query(Batch::new().sql("SELECT value FROM kv WHERE key = 'counter'"))
    });
    try_join_all(queries).await?;
    let elapsed = started.elapsed();

    let rate = settings.queries as f64 / elapsed.as_secs_f64().max(f64::EPSILON);
    println!(
        "{} queries over {} connections (global mutex {}) in {:.1} ms: {:.0} queries/s",
        settings.queries,
        pool.size(),
        if pool.uses_global_mutex() { "on" } else { "off" },
        elapsed.as_secs_f64() * 1000.0,
        rate
    );
    for (job, stats) in pool.stats().jobs.iter().enumerate() {
        println!(
            "  job {}: {} completed, {} failed, {} skipped",
            job, stats.completed, stats.failed, stats.skipped
        );
    }
    pool.shutdown().await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn test_cli_is_well_formed() {
        Cli::command().debug_assert();
    }

    #[test]
    fn test_run_flags() {
        let cli = Cli::try_parse_from([
            "contend",
            "run",
            "--peers",
            "3",
            "--backend",
            "rollback",
            "--duration-ms",
            "2000",
            "--clear",
        ])
        .unwrap();
        match cli.command {
            Commands::Run {
                peers,
                backend,
                duration_ms,
                clear,
            } => {
                assert_eq!(peers, Some(3));
                assert_eq!(backend.as_deref(), Some("rollback"));
                assert_eq!(duration_ms, Some(2000));
                assert!(clear);
            }
            other => panic!("unexpected command {:?}", other),
        }
        assert_eq!(cli.config, PathBuf::from(DEFAULT_CONFIG_PATH));
    }

    #[test]
    fn test_pool_flags_and_global_config() {
        let cli = Cli::try_parse_from([
            "contend",
            "pool",
            "--use-mutex",
            "--concurrency",
            "8",
            "--config",
            "bench.toml",
        ])
        .unwrap();
        assert_eq!(cli.config, PathBuf::from("bench.toml"));
        match cli.command {
            Commands::Pool {
                concurrency,
                use_mutex,
                queries,
                ..
            } => {
                assert_eq!(concurrency, Some(8));
                assert!(use_mutex);
                assert_eq!(queries, None);
            }
            other => panic!("unexpected command {:?}", other),
        }
    }
}
