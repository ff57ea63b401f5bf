//! Pendulum DST Simulator CLI
//!
//! Run deterministic simulation tests of the halt/restart protocol.

use anyhow::{bail, Context};
use clap::Parser;
use pendulum_core::QuorumMode;
use pendulum_sim::scenarios::ScenarioId;
use pendulum_sim::{ScenarioResult, ScenarioRunner};
use tracing::{error, info, Level};
use tracing_subscriber::FmtSubscriber;

/// Pendulum Deterministic Simulation Testing CLI
#[derive(Parser, Debug)]
#[command(name = "pendulum-sim")]
#[command(about = "Run deterministic simulation tests for the pendulum swarm", long_about = None)]
struct Args {
    /// Master seed for determinism (0 = random from time)
    #[arg(short, long, default_value = "42")]
    seed: u64,

    /// Number of pendulum instances
    #[arg(short = 'n', long, default_value = "5")]
    instances: u32,

    /// Scenario to run (near_miss, clear_swing, lost_restart, duplicate_restart, manual_reset, all)
    #[arg(short = 'S', long, default_value = "all")]
    scenario: String,

    /// Number of consecutive seeds to test (for CI mode)
    #[arg(long, default_value = "1")]
    seeds: usize,

    /// Simulated duration in seconds (scenarios may extend it)
    #[arg(short, long, default_value = "10")]
    duration: f64,

    /// RESTART counting: distinct or raw
    #[arg(long, default_value = "distinct")]
    quorum: QuorumMode,

    /// Verbose output
    #[arg(short, long)]
    verbose: bool,

    /// JSON output for CI parsing
    #[arg(long)]
    json: bool,

    /// Export the run's timeline to a JSON file
    #[arg(long)]
    export: Option<String>,
}

fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    // Initialize logging
    let level = if args.verbose { Level::DEBUG } else { Level::INFO };
    let subscriber = FmtSubscriber::builder()
        .with_max_level(if args.json { Level::WARN } else { level })
        .with_writer(std::io::stderr)
        .finish();
    tracing::subscriber::set_global_default(subscriber)
        .context("failed to set tracing subscriber")?;

    if !args.json {
        info!("Pendulum DST Simulator v{}", env!("CARGO_PKG_VERSION"));
        info!("━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━");
    }

    let scenarios: Vec<ScenarioId> = if args.scenario == "all" {
        ScenarioId::all()
    } else {
        vec![args
            .scenario
            .parse()
            .map_err(anyhow::Error::msg)
            .context("available scenarios: near_miss, clear_swing, lost_restart, duplicate_restart, manual_reset, all")?]
    };

    let base_seed = if args.seed == 0 {
        std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .map(|d| d.as_nanos() as u64)
            .unwrap_or(42)
    } else {
        args.seed
    };

    // Handle --export mode
    if let Some(export_path) = &args.export {
        if scenarios.len() > 1 {
            bail!("--export only supports a single scenario, not 'all'");
        }

        let runner = ScenarioRunner::new(base_seed, args.instances)
            .with_duration(args.duration)
            .with_quorum_mode(args.quorum);
        let (result, export) = runner.run_with_export(scenarios[0]);
        export
            .write_to_file(export_path)
            .with_context(|| format!("failed to write export to {export_path}"))?;
        info!("Exported {} frames to {}", export.frames.len(), export_path);

        report(&result);
        if !result.passed {
            std::process::exit(1);
        }
        return Ok(());
    }

    let mut all_results: Vec<ScenarioResult> = Vec::new();
    for seed_offset in 0..args.seeds {
        let seed = base_seed.wrapping_add(seed_offset as u64);
        let runner = ScenarioRunner::new(seed, args.instances)
            .with_duration(args.duration)
            .with_quorum_mode(args.quorum);

        for scenario in &scenarios {
            let result = runner.run(*scenario);
            if !args.json {
                report(&result);
            }
            all_results.push(result);
        }
    }

    let total = all_results.len();
    let failed_count = all_results.iter().filter(|r| !r.passed).count();

    if args.json {
        let summary = serde_json::json!({
            "total": total,
            "passed": total - failed_count,
            "failed": failed_count,
            "results": all_results.iter().map(|r| {
                serde_json::json!({
                    "scenario": r.scenario.name(),
                    "seed": r.seed,
                    "passed": r.passed,
                    "ticks": r.total_ticks,
                    "time_secs": r.final_time_secs,
                    "halts": r.metrics.halts,
                    "restarts": r.metrics.restarts,
                    "resumes": r.metrics.resumes,
                    "min_gap": r.metrics.min_gap,
                    "messages_dropped": r.metrics.messages_dropped,
                    "failure_reason": r.failure_reason,
                })
            }).collect::<Vec<_>>(),
        });
        println!("{}", serde_json::to_string_pretty(&summary)?);
    } else {
        info!("━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━");
        if failed_count == 0 {
            info!("✅ All {} scenario runs passed!", total);
        } else {
            error!("❌ {}/{} scenario runs failed!", failed_count, total);
        }
    }

    // Exit with proper code for CI
    if failed_count > 0 {
        std::process::exit(1);
    }
    Ok(())
}

fn report(result: &ScenarioResult) {
    if result.passed {
        info!("✓ {} (seed={}) PASSED", result.scenario.name(), result.seed);
    } else {
        error!(
            "✗ {} (seed={}) FAILED: {}",
            result.scenario.name(),
            result.seed,
            result.failure_reason.as_deref().unwrap_or("unknown")
        );
    }
}
