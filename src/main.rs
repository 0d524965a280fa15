use anyhow::Result;
use clap::{Parser, Subcommand};
use proxy_prober::proxy::{
    CheckerConfig, HttpProbe, ProbePool, ProbeState, ProxyParser, Registry,
};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

/// A batch proxy prober with a concurrent worker pool
#[derive(Parser)]
#[command(name = "proxy-prober")]
#[command(about = "A batch proxy prober with a concurrent worker pool")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Parse a proxy list and print it in export format without probing
    Parse {
        /// Input file with one "type ip:port" candidate per line
        input: PathBuf,
        /// Output file for the exported list
        #[arg(short, long)]
        output: Option<PathBuf>,
    },
    /// Probe every proxy of a list and export the results
    Check {
        /// Input file with one "type ip:port" candidate per line
        input: PathBuf,
        /// Output file for the exported results
        #[arg(short, long)]
        output: Option<PathBuf>,
        /// Attempts per proxy (1-10)
        #[arg(short, long, default_value = "3")]
        attempts: u32,
        /// Number of concurrent workers (1-32)
        #[arg(short = 'n', long, default_value = "8")]
        workers: usize,
        /// Timeout per attempt in seconds (1-60)
        #[arg(long, default_value = "20")]
        timeout: u64,
        /// URL to fetch through each proxy
        #[arg(long, default_value = "http://httpbin.org/ip")]
        test_url: String,
        /// Override the User-Agent header
        #[arg(long)]
        user_agent: Option<String>,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "proxy_prober=info".into()),
        )
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();

    let cli = Cli::parse();

    match cli.command {
        Commands::Parse { input, output } => {
            let registry = Registry::new();
            let report = ProxyParser::import_file(&registry, &input)?;
            println!(
                "Parsed lines: {} | Servers added: {} | Rejected: {} | Duplicates: {}",
                report.lines, report.added, report.rejected, report.duplicates
            );
            write_results(&registry, output)?;
        }
        Commands::Check {
            input,
            output,
            attempts,
            workers,
            timeout,
            test_url,
            user_agent,
        } => {
            let config = CheckerConfig::new()
                .with_attempts(attempts)
                .with_workers(workers)
                .with_timeout(Duration::from_secs(timeout))
                .with_test_url(test_url);
            config.validate()?;

            let registry = Arc::new(Registry::new());
            let report = ProxyParser::import_file(&registry, &input)?;
            println!(
                "Loaded {} proxies from {:?} ({} lines, {} rejected)",
                report.added, input, report.lines, report.rejected
            );
            println!(
                "Checking with {} workers, {} attempts, timeout: {}s",
                config.workers, config.attempts, timeout
            );
            println!("Test URL: {}", config.test_url);
            println!();

            let probe = match user_agent {
                Some(ua) => HttpProbe::with_user_agent(ua),
                None => HttpProbe::new(),
            };
            let pool = ProbePool::new(Arc::clone(&registry), Arc::new(probe), config)?;
            pool.start_testing();

            tokio::select! {
                _ = pool.wait_idle() => {}
                _ = tokio::signal::ctrl_c() => {
                    let cancelled = pool.abort_testing();
                    eprintln!(
                        "Aborted: {} queued proxies cancelled, waiting for probes in flight...",
                        cancelled
                    );
                    pool.wait_idle().await;
                }
            }

            let entries = registry.snapshot();
            let good = entries
                .iter()
                .filter(|e| e.status().state() == ProbeState::Ok)
                .count();
            let bad = entries
                .iter()
                .filter(|e| e.status().state() == ProbeState::Fail)
                .count();
            println!("Results: {} good, {} bad", good, bad);

            write_results(&registry, output)?;
        }
    }

    Ok(())
}

fn write_results(registry: &Registry, output: Option<PathBuf>) -> Result<()> {
    match output {
        Some(path) => {
            let count = ProxyParser::export_file(registry, &path)?;
            println!("Saved {} proxies to {:?}", count, path);
        }
        None => {
            ProxyParser::export(registry, &mut std::io::stdout().lock())?;
        }
    }
    Ok(())
}
