//! Steplink Bridge Harness CLI
//!
//! Run deterministic bridge scenarios against a scripted authoritative world,
//! or bridge to a live authoritative simulator over ZeroMQ.

use clap::Parser;
use steplink_sim::scenarios::ScenarioId;
use steplink_sim::{run_scenario, RunReport, ScenarioResult};
use tracing::{error, info, Level};
use tracing_subscriber::FmtSubscriber;

/// Steplink Lock-Step Bridge CLI
#[derive(Parser, Debug)]
#[command(name = "steplink-sim")]
#[command(about = "Run deterministic lock-step bridge scenarios", long_about = None)]
struct Args {
    /// Master seed for determinism (0 = random from time)
    #[arg(short, long, default_value = "42")]
    seed: u64,

    /// Scenario to run (steady_state, churn, late_join, accident, time_limit, stall, unknown_kind, light_control, all)
    #[arg(short = 'S', long, default_value = "all")]
    scenario: String,

    /// Number of consecutive seeds to test (for CI mode)
    #[arg(long, default_value = "1")]
    seeds: usize,

    /// Verbose output
    #[arg(short, long)]
    verbose: bool,

    /// JSON output for CI parsing
    #[arg(long)]
    json: bool,

    /// Bridge to a live authoritative simulator instead of the scripted world
    #[arg(long)]
    live: bool,

    /// Live mode: authoritative simulator host
    #[arg(long, default_value = "127.0.0.1")]
    host: String,

    /// Live mode: authoritative simulator port
    #[arg(long, default_value = "5555")]
    port: u16,

    /// Live mode: simulated seconds to run before disconnecting
    #[arg(short, long, default_value = "10")]
    duration: f64,
}

/// Drive a live authoritative simulator through one bounded run.
#[cfg(feature = "zeromq")]
fn run_live(args: &Args, seed: u64) -> Result<RunReport, String> {
    use std::time::Duration;
    use steplink_core::{RunSettings, Transport, TransportConfig};
    use steplink_sim::{derive_run_id, BlueprintFactory, BridgeHost, NodeBlueprint};

    let time_limit = Duration::try_from_secs_f64(args.duration)
        .map_err(|e| format!("invalid duration: {e}"))?;

    let config = TransportConfig {
        host: args.host.clone(),
        port: args.port,
        ..TransportConfig::default()
    };
    info!("Connecting to {}", config.endpoint());
    let transport = Transport::connect(&config).map_err(|e| e.to_string())?;

    let step_size = Duration::from_millis(100);
    let settings = RunSettings {
        run_id: derive_run_id(seed),
        seed,
        step_size,
        time_limit: Some(time_limit),
        ..RunSettings::default()
    };
    let factory = BlueprintFactory::new(step_size)
        .with_blueprint("car", NodeBlueprint::new("steplink.node.Car", "car[*]"))
        .with_blueprint("bicycle", NodeBlueprint::new("steplink.node.Bicycle", "bicycle[*]"));
    let max_steps = (args.duration / step_size.as_secs_f64()).ceil() as u64 + 1;

    Ok(BridgeHost::new(transport, factory, settings)
        .with_max_steps(max_steps)
        .run())
}

#[cfg(not(feature = "zeromq"))]
fn run_live(_args: &Args, _seed: u64) -> Result<RunReport, String> {
    Err("live mode requires the `zeromq` feature (rebuild with --features zeromq)".to_string())
}

fn main() {
    let args = Args::parse();

    // Initialize logging
    let level = if args.verbose { Level::DEBUG } else { Level::INFO };
    let subscriber = FmtSubscriber::builder()
        .with_max_level(level)
        .finish();
    tracing::subscriber::set_global_default(subscriber)
        .expect("Failed to set tracing subscriber");

    if !args.json {
        info!("Steplink Bridge Harness v0.1.0");
        info!("━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━");
    }

    // Determine base seed
    let base_seed = if args.seed == 0 {
        std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .map(|d| d.as_nanos() as u64)
            .unwrap_or(42)
    } else {
        args.seed
    };

    // Handle --live mode against a real authoritative simulator
    if args.live {
        match run_live(&args, base_seed) {
            Ok(report) => {
                let clean = report.end.is_some() && report.error.is_none();
                if args.json {
                    match serde_json::to_string_pretty(&report) {
                        Ok(rendered) => println!("{}", rendered),
                        Err(e) => error!("Failed to render report: {}", e),
                    }
                } else if clean {
                    info!(
                        "✓ live run finished: {} steps, {:.1}s simulated, end={:?}",
                        report.steps, report.final_time, report.end
                    );
                } else {
                    error!(
                        "✗ live run failed after {} steps: {}",
                        report.steps,
                        report.error.as_deref().unwrap_or("no cooperative finish")
                    );
                }
                if !clean {
                    std::process::exit(1);
                }
            }
            Err(e) => {
                error!("✗ live run aborted: {}", e);
                std::process::exit(1);
            }
        }
        return;
    }

    // Parse scenarios
    let scenarios: Vec<ScenarioId> = if args.scenario == "all" {
        ScenarioId::all()
    } else {
        vec![args.scenario.parse().unwrap_or_else(|e| {
            eprintln!("Error: {}", e);
            eprintln!("Available scenarios: steady_state, churn, late_join, accident, time_limit, stall, unknown_kind, light_control, all");
            std::process::exit(1);
        })]
    };

    // Run simulations
    let mut all_results: Vec<ScenarioResult> = Vec::new();
    let mut failed_count = 0;

    for seed_offset in 0..args.seeds {
        let seed = base_seed.wrapping_add(seed_offset as u64);

        for scenario in &scenarios {
            let result = run_scenario(*scenario, seed);

            if !args.json {
                if result.passed {
                    info!("✓ {} (seed={}) PASSED", scenario.name(), seed);
                } else {
                    error!(
                        "✗ {} (seed={}) FAILED: {}",
                        scenario.name(),
                        seed,
                        result.failure_reason.as_deref().unwrap_or("unknown")
                    );
                }
            }

            if !result.passed {
                failed_count += 1;
            }

            all_results.push(result);
        }
    }

    // Summary
    let total = all_results.len();
    let passed = total - failed_count;

    if args.json {
        // JSON output for CI parsing
        let summary = serde_json::json!({
            "total": total,
            "passed": passed,
            "failed": failed_count,
            "results": all_results.iter().map(|r| {
                serde_json::json!({
                    "scenario": r.scenario.name(),
                    "seed": r.seed,
                    "passed": r.passed,
                    "steps": r.report.steps,
                    "end": r.report.end,
                    "time_secs": r.report.final_time,
                    "failure_reason": r.failure_reason,
                })
            }).collect::<Vec<_>>(),
        });
        match serde_json::to_string_pretty(&summary) {
            Ok(rendered) => println!("{}", rendered),
            Err(e) => error!("Failed to render summary: {}", e),
        }
    } else {
        info!("");
        info!("━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━");

        if failed_count == 0 {
            info!("✅ All {} scenario runs passed!", total);
        } else {
            error!("❌ {}/{} scenario runs failed!", failed_count, total);

            // List failed seeds
            for result in &all_results {
                if !result.passed {
                    error!(
                        "  - {} seed={}: {}",
                        result.scenario.name(),
                        result.seed,
                        result.failure_reason.as_deref().unwrap_or("unknown")
                    );
                }
            }
        }
    }

    // Exit with proper code for CI
    if failed_count > 0 {
        std::process::exit(1);
    }
}
