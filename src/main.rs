use anyhow::{bail, Context};
use clap::{Parser, Subcommand, ValueEnum};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::signal;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use ratewarden::config::EngineConfig;
use ratewarden::ratelimit::{Maintenance, RateLimitKey, RateLimiter};

#[derive(Parser, Debug)]
#[command(name = "ratewarden", version, about = "In-process rate limiting engine")]
struct Cli {
    /// Path to the YAML configuration file
    #[arg(short, long, global = true, default_value = "ratewarden.yaml")]
    config: PathBuf,

    /// Log output format
    #[arg(long, global = true, value_enum, default_value_t = LogFormat::Pretty)]
    log_format: LogFormat,

    #[command(subcommand)]
    command: Command,
}

#[derive(Clone, Copy, Debug, ValueEnum)]
enum LogFormat {
    Pretty,
    Json,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Load the configuration and print the limit for every class
    Validate,

    /// Drive synthetic clients through one class and print the metrics
    Simulate {
        /// Key class to exercise
        #[arg(long)]
        class: String,

        /// Number of concurrent clients, each with its own key
        #[arg(long, default_value_t = 4)]
        clients: usize,

        /// Requests sent by each client
        #[arg(long, default_value_t = 50)]
        requests: usize,

        /// Requests per second per client
        #[arg(long, default_value_t = 10.0)]
        rate: f64,

        /// Largest cost of a single request
        #[arg(long, default_value_t = 1)]
        max_cost: u64,

        /// Seed for reproducible request costs
        #[arg(long)]
        seed: Option<u64>,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.log_format);

    info!(version = env!("CARGO_PKG_VERSION"), "Starting ratewarden");

    let config = EngineConfig::load(&cli.config)
        .with_context(|| format!("failed to load {}", cli.config.display()))?;

    match cli.command {
        Command::Validate => validate(&config),
        Command::Simulate {
            class,
            clients,
            requests,
            rate,
            max_cost,
            seed,
        } => {
            let settings = Simulation {
                class,
                clients,
                requests,
                rate,
                max_cost,
                seed,
            };
            simulate(&config, settings).await
        }
    }
}

fn init_tracing(format: LogFormat) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let subscriber = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_writer(std::io::stderr);

    match format {
        LogFormat::Json => subscriber.json().init(),
        LogFormat::Pretty => subscriber.init(),
    }
}

fn validate(config: &EngineConfig) -> anyhow::Result<()> {
    let limits = config.limiter_configs()?;
    let mut classes: Vec<_> = limits.iter().collect();
    classes.sort_by(|a, b| a.0.cmp(b.0));

    for (class, limit) in classes {
        println!(
            "{}: {} capacity={} window={:?} rate={:.3}/s",
            class,
            limit.algorithm(),
            limit.capacity(),
            limit.window(),
            limit.refill_rate()
        );
    }
    info!(classes = limits.len(), "Configuration is valid");
    Ok(())
}

#[derive(Debug)]
struct Simulation {
    class: String,
    clients: usize,
    requests: usize,
    rate: f64,
    max_cost: u64,
    seed: Option<u64>,
}

async fn simulate(config: &EngineConfig, sim: Simulation) -> anyhow::Result<()> {
    if !(sim.rate.is_finite() && sim.rate > 0.0) {
        bail!("--rate must be a positive number");
    }
    if sim.max_cost == 0 {
        bail!("--max-cost must be at least 1");
    }

    let limiter = Arc::new(RateLimiter::from_config(config)?);
    if !limiter.limits().contains_key(&sim.class) {
        bail!("class '{}' is not configured", sim.class);
    }

    let maintenance = Maintenance::spawn(Arc::clone(&limiter), config.registry.sweep_interval());
    let period = Duration::try_from_secs_f64(1.0 / sim.rate)
        .context("--rate is too small")?
        .max(Duration::from_micros(1));

    info!(
        class = %sim.class,
        clients = sim.clients,
        requests = sim.requests,
        "Starting simulation"
    );

    let mut tasks = tokio::task::JoinSet::new();
    for client in 0..sim.clients {
        let limiter = Arc::clone(&limiter);
        let key = RateLimitKey::new(sim.class.clone()).with("client", format!("client-{}", client));
        let mut rng = match sim.seed {
            Some(seed) => StdRng::seed_from_u64(seed.wrapping_add(client as u64)),
            None => StdRng::from_entropy(),
        };
        let (requests, max_cost) = (sim.requests, sim.max_cost);

        tasks.spawn(async move {
            let mut ticker = tokio::time::interval(period);
            for _ in 0..requests {
                ticker.tick().await;
                let cost = rng.gen_range(1..=max_cost);
                if let Err(e) = limiter.check(&key, cost) {
                    warn!(key = %key, error = %e, "Request failed");
                }
            }
        });
    }

    let interrupted = tokio::select! {
        _ = async { while tasks.join_next().await.is_some() {} } => false,
        _ = shutdown_signal() => true,
    };
    if interrupted {
        tasks.abort_all();
    } else {
        info!("Simulation finished");
    }

    maintenance.shutdown().await;

    let mut keys: Vec<_> = (0..sim.clients)
        .map(|client| RateLimitKey::new(sim.class.clone()).with("client", format!("client-{}", client)))
        .filter_map(|key| limiter.status(&key))
        .collect();
    keys.sort_by(|a, b| a.key.cmp(&b.key));

    let report = serde_json::json!({
        "metrics": limiter.snapshot(),
        "keys": keys,
    });
    println!("{}", serde_json::to_string_pretty(&report)?);
    Ok(())
}

/// Wait for a shutdown signal (Ctrl+C or SIGTERM).
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            warn!(error = %e, "Failed to listen for Ctrl+C");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut stream) => {
                stream.recv().await;
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
            info!("Received Ctrl+C, stopping simulation");
        }
        _ = terminate => {
            info!("Received SIGTERM, stopping simulation");
        }
    }
}
