//! Runkeeper CLI Entry Point
//!
//! Command-line front-end for the run engine. Every command prints a JSON
//! body followed by an HTTP-style status line.
//!
//! # Usage
//!
//! ```bash
//! # Create a run from a definition file
//! runkeeper create nightly.yaml
//!
//! # Drive it until it blocks or finishes
//! runkeeper resume nightly
//!
//! # Inspect what happened
//! runkeeper trace nightly
//!
//! # Decide an approval gate (resumes unless --no-resume)
//! runkeeper approve nightly --note "checked" --actor ops
//! runkeeper reject nightly --note "wrong target"
//!
//! # Stop a run
//! runkeeper cancel nightly
//! ```

use std::env;
use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;

use colored::Colorize;
use log::{error, info};
use serde::Serialize;

use runkeeper::error::EngineError;
use runkeeper::workflow::model::Decision;
use runkeeper::{
    load_run_definition, EngineConfig, FileRunStore, ProcessRunner, RunController, APP_NAME,
    VERSION,
};

/// What the user asked for.
#[derive(Debug, PartialEq)]
enum Command {
    Create { file: PathBuf },
    Resume { run_id: String },
    Trace { run_id: String },
    Decide {
        run_id: String,
        decision: Decision,
        note: Option<String>,
        actor: Option<String>,
        resume: bool,
    },
    Cancel { run_id: String },
}

/// Command-line configuration parsed from arguments.
#[derive(Debug, PartialEq)]
struct Config {
    command: Command,
    store_dir: Option<PathBuf>,
    config_file: Option<PathBuf>,
    verbose: bool,
}

/// Configures the logging system with appropriate formatting.
fn setup_logging(verbose: bool) {
    let level = if verbose { "debug" } else { "info" };

    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(level))
        .format(|buf, record| {
            use std::io::Write;

            match record.level() {
                log::Level::Warn | log::Level::Error => {
                    writeln!(buf, "[{}] {}", record.level(), record.args())
                }
                _ => writeln!(buf, "{}", record.args()),
            }
        })
        .init();
}

/// Prints usage information.
fn print_usage() {
    println!("Usage: runkeeper [OPTIONS] <COMMAND> [ARGS]");
    println!();
    println!("Commands:");
    println!("  create <FILE>       Create a pending run from a YAML/JSON definition");
    println!("  resume <RUN_ID>     Drive a run until it waits for approval or finishes");
    println!("  trace <RUN_ID>      Print a run's execution trace");
    println!("  approve <RUN_ID>    Approve the gate the run is waiting on");
    println!("  reject <RUN_ID>     Reject the gate the run is waiting on (requires --note)");
    println!("  cancel <RUN_ID>     Cancel a run");
    println!();
    println!("Options:");
    println!("  --store DIR         Run store directory (default: .runkeeper/runs)");
    println!("  --config FILE       Engine configuration YAML");
    println!("  --note TEXT         Decision note (approve/reject)");
    println!("  --actor NAME        Who made the decision (approve/reject)");
    println!("  --no-resume         Do not resume after approving");
    println!("  --verbose           Enable debug logging");
    println!("  --help              Show this help message");
    println!("  --version           Show version information");
}

/// Parses command-line arguments into a Config struct.
///
/// Returns `Ok(None)` when help or version was printed.
fn parse_arguments(args: &[String]) -> Result<Option<Config>, String> {
    let mut positional: Vec<String> = Vec::new();
    let mut store_dir = None;
    let mut config_file = None;
    let mut note = None;
    let mut actor = None;
    let mut no_resume = false;
    let mut verbose = false;
    let mut i = 1; // Skip program name

    let value = |i: usize, flag: &str| -> Result<String, String> {
        args.get(i)
            .cloned()
            .ok_or_else(|| format!("{} requires an argument", flag))
    };

    while i < args.len() {
        let arg = &args[i];

        match arg.as_str() {
            "--help" | "-h" => {
                print_usage();
                return Ok(None);
            }
            "--version" | "-V" => {
                println!("{} {}", APP_NAME, VERSION);
                return Ok(None);
            }
            "--verbose" | "-v" => verbose = true,
            "--no-resume" => no_resume = true,
            "--store" => {
                i += 1;
                store_dir = Some(PathBuf::from(value(i, "--store")?));
            }
            "--config" => {
                i += 1;
                config_file = Some(PathBuf::from(value(i, "--config")?));
            }
            "--note" => {
                i += 1;
                note = Some(value(i, "--note")?);
            }
            "--actor" => {
                i += 1;
                actor = Some(value(i, "--actor")?);
            }
            arg if arg.starts_with('-') => {
                return Err(format!("Unknown option: {}", arg));
            }
            _ => positional.push(arg.clone()),
        }
        i += 1;
    }

    let mut positional = positional.into_iter();
    let name = positional.next().ok_or("Missing command")?;
    let target = positional
        .next()
        .ok_or_else(|| format!("'{}' requires an argument", name))?;
    if let Some(extra) = positional.next() {
        return Err(format!("Unexpected argument: {}", extra));
    }

    let command = match name.as_str() {
        "create" => Command::Create {
            file: PathBuf::from(target),
        },
        "resume" => Command::Resume { run_id: target },
        "trace" => Command::Trace { run_id: target },
        "approve" | "reject" => {
            let decision = Decision::parse(&name)
                .ok_or_else(|| format!("Unknown decision: {}", name))?;
            if decision == Decision::Rejected && note.as_deref().map_or(true, |n| n.trim().is_empty()) {
                return Err("reject requires --note".to_string());
            }
            Command::Decide {
                run_id: target,
                decision,
                note,
                actor,
                resume: decision == Decision::Approved && !no_resume,
            }
        }
        "cancel" => Command::Cancel { run_id: target },
        other => return Err(format!("Unknown command: {}", other)),
    };

    Ok(Some(Config {
        command,
        store_dir,
        config_file,
        verbose,
    }))
}

/// Prints a JSON body and the status line; returns whether it counts as success.
fn report<T: Serialize>(body: &T, status: u16) -> Result<bool, Box<dyn std::error::Error>> {
    println!("{}", serde_json::to_string_pretty(body)?);
    let line = format!("HTTP {}", status);
    let success = matches!(status, 200 | 202);
    if success {
        eprintln!("{}", line.green().bold());
    } else {
        eprintln!("{}", line.red().bold());
    }
    Ok(success)
}

/// Prints an engine error in the same shape as a response.
fn report_error(err: &EngineError) -> Result<bool, Box<dyn std::error::Error>> {
    error!("{}", err);
    let body = serde_json::json!({ "ok": false, "error": err.to_string() });
    report(&body, err.http_status())
}

/// Main application logic.
async fn run(config: Config) -> Result<bool, Box<dyn std::error::Error>> {
    let mut engine_config = EngineConfig::load(config.config_file.as_deref())?;
    if let Some(dir) = config.store_dir {
        engine_config.store_dir = dir;
    }

    let store = FileRunStore::open(&engine_config.store_dir).await?;
    let runner = ProcessRunner::from_config(&engine_config);
    let controller = RunController::new(Arc::new(store), Arc::new(runner), engine_config);

    let result = match config.command {
        Command::Create { file } => {
            let run = match load_run_definition(&file, controller.config()) {
                Ok(run) => run,
                Err(e) => return report_error(&e),
            };
            controller.create_run(run).await.map(|run| {
                info!("Run {} created", run.id);
                (serde_json::to_value(&run), 200)
            })
        }
        Command::Resume { run_id } => controller
            .execute_manual_workflow_run(&run_id)
            .await
            .map(|outcome| (serde_json::to_value(&outcome), outcome.http_status())),
        Command::Trace { run_id } => controller
            .get_workflow_run_trace(&run_id)
            .await
            .map(|trace| (serde_json::to_value(&trace), 200)),
        Command::Decide {
            run_id,
            decision,
            note,
            actor,
            resume,
        } => match controller.decide_approval(&run_id, decision, note, actor).await {
            Ok(_) if resume => controller
                .execute_manual_workflow_run(&run_id)
                .await
                .map(|outcome| (serde_json::to_value(&outcome), outcome.http_status())),
            Ok(run) => Ok((serde_json::to_value(&run), 200)),
            Err(e) => Err(e),
        },
        Command::Cancel { run_id } => controller
            .request_cancel(&run_id)
            .await
            .map(|run| (serde_json::to_value(&run), 200)),
    };

    match result {
        Ok((body, status)) => report(&body?, status),
        Err(e) => report_error(&e),
    }
}

fn main() -> ExitCode {
    let args: Vec<String> = env::args().collect();

    let config = match parse_arguments(&args) {
        Ok(Some(config)) => config,
        Ok(None) => return ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("Error: {}", e);
            eprintln!();
            print_usage();
            return ExitCode::FAILURE;
        }
    };

    setup_logging(config.verbose);

    let runtime = match tokio::runtime::Runtime::new() {
        Ok(runtime) => runtime,
        Err(e) => {
            eprintln!("Error: failed to start runtime: {}", e);
            return ExitCode::FAILURE;
        }
    };

    match runtime.block_on(run(config)) {
        Ok(true) => ExitCode::SUCCESS,
        Ok(false) => ExitCode::FAILURE,
        Err(e) => {
            eprintln!();
            eprintln!("Error: {}", e);
            ExitCode::FAILURE
        }
    }
}
