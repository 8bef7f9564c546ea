//! evq - multi-process worker-pool coordinator for batch record processing.

mod cli;
mod error;
mod job;
mod logging;
mod paths;
mod pool;
mod record;
mod shm;
pub mod version;

use anyhow::Result;
use clap::Parser;
use owo_colors::{OwoColorize, Stream::Stderr};

use cli::{Cli, Commands};
use job::JobSummary;

fn main() {
    let cli = Cli::parse();

    // Worker mode never returns: stdout is the phase protocol channel and
    // logging is initialized after the rank claim, so it skips everything
    // below.
    if let Commands::Worker(args) = &cli.command {
        pool::run_worker_main(args.to_worker_config());
    }

    init_logging(&cli);
    tracing::debug!(version = %version::full_version(), "evq starting");

    let result = match &cli.command {
        Commands::Run(args) => cmd_run(args),
        Commands::Completions(args) => {
            args.generate();
            Ok(())
        }
        Commands::Worker(_) => unreachable!("worker mode handled above"),
    };

    if let Err(e) = result {
        eprintln!(
            "{}: {}",
            "error"
                .if_supports_color(Stderr, |text| text.red())
                .if_supports_color(Stderr, |text| text.bold()),
            e
        );
        for cause in e.chain().skip(1) {
            eprintln!(
                "  {}: {}",
                "caused by".if_supports_color(Stderr, |text| text.yellow()),
                cause
            );
        }
        std::process::exit(1);
    }
}

/// Initialize the tracing subscriber from the global CLI flags.
fn init_logging(cli: &Cli) {
    let config = if cli.quiet {
        logging::LogConfig::new().with_filter("error".to_string())
    } else {
        match cli.verbose {
            0 => logging::LogConfig::new(),
            1 => logging::LogConfig::new().with_filter("debug".to_string()),
            _ => logging::LogConfig::new().with_filter("trace".to_string()),
        }
    };
    logging::init(config.with_env_overrides());
}

/// Run a batch job and report the outcome.
fn cmd_run(args: &cli::RunArgs) -> Result<()> {
    let options = args.to_run_options();
    let summary = job::run_job(&options)?;
    print_summary(&summary);

    if summary.failed_workers > 0 {
        anyhow::bail!(
            "job finished with {} failed worker(s); see logs under {}",
            summary.failed_workers,
            summary.top_dir.display()
        );
    }
    if summary.decode_failures > 0 {
        anyhow::bail!(
            "job finished with {} result decode failure(s)",
            summary.decode_failures
        );
    }
    Ok(())
}

fn print_summary(summary: &JobSummary) {
    println!(
        "job {}: {} workers, {} records seeded, started {}",
        summary.job_id,
        summary.workers,
        summary.records,
        summary.started_at.format("%Y-%m-%d %H:%M:%S UTC")
    );
    for status in &summary.statuses {
        let rank = status
            .rank
            .map(|r| r.to_string())
            .unwrap_or_else(|| "-".to_string());
        println!(
            "  worker {} (pid {}, rank {}): {}, {} records processed, {}",
            status.worker, status.pid, rank, status.state, status.processed, status.exit
        );
    }
    println!("total records processed: {}", summary.total_processed);
    println!(
        "finished in {:.2}s; worker logs under {}",
        summary.elapsed.as_secs_f64(),
        summary.top_dir.display()
    );
    if summary.failed_workers > 0 {
        println!("worker logs:");
        for path in &summary.log_paths {
            println!("  {}", path.display());
        }
    }
}
