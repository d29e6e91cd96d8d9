//! Stepflow CLI Entry Point
//!
//! Provides command-line interface for running built-in flows.
//!
//! # Usage
//!
//! ```bash
//! # List built-in flows
//! stepflow --list
//!
//! # Run a flow with parameters
//! stepflow squares --param numbers='[1, 2, 3]'
//!
//! # Pass a file's contents as a parameter
//! stepflow csv_inspect --param file=@data.csv
//!
//! # Bind a YAML manifest to a flow's handlers
//! stepflow squares --manifest squares.yaml
//!
//! # Validate and print the graph without running it
//! stepflow branches --dry-run
//! ```

use std::env;
use std::process::ExitCode;

use colored::Colorize;
use log::{error, info, warn};
use serde_json::json;

use stepflow::execution::{task_counts, Engine, RunResult};
use stepflow::flows::{self, BuiltinFlow};
use stepflow::workflow::{infer_value, load_flow, split_assignment, Flow, Parameters, Topology};
use stepflow::{APP_NAME, VERSION};

/// Command-line configuration parsed from arguments.
#[derive(Debug, Default)]
struct Config {
    flow_name: Option<String>,
    params: Vec<String>,
    manifest: Option<String>,
    max_parallel: Option<usize>,
    dry_run: bool,
    json: bool,
    timeline: bool,
    list: bool,
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

/// Prints the application banner with version information.
fn print_banner() {
    println!();
    println!("{} v{}", APP_NAME.bold(), VERSION);
    println!("Step-Graph Execution Engine");
    println!();
}

/// Prints usage information.
fn print_usage() {
    println!("Usage: stepflow [OPTIONS] <FLOW>");
    println!();
    println!("Arguments:");
    println!("  <FLOW>               Name of a built-in flow (see --list)");
    println!();
    println!("Options:");
    println!("  --param NAME=VALUE   Set a flow parameter (repeatable; @path reads a file)");
    println!("  --manifest PATH      Load the graph from YAML, bound to FLOW's handlers");
    println!("  --parallel N         Maximum concurrent tasks (default: CPU count)");
    println!("  --dry-run            Validate and print the graph without running it");
    println!("  --json               Print run state and final artifacts as JSON");
    println!("  --timeline           Print a Gantt chart of the run");
    println!("  --list               List built-in flows");
    println!("  --verbose            Enable debug logging");
    println!("  --help               Show this help message");
    println!("  --version            Show version information");
    println!();
    println!("Examples:");
    println!("  stepflow artifacts --param start_value=3");
    println!("  stepflow squares --param numbers='[4, 5]' --timeline");
    println!("  stepflow csv_inspect --param file=@data.csv --json");
}

/// Prints the built-in flow catalog with declared parameters.
fn print_catalog() {
    println!("Built-in flows:");
    println!();
    for builtin in flows::catalog() {
        println!("  {:12} {}", builtin.name.bold(), builtin.description);
        for parameter in (builtin.build)().parameters {
            println!(
                "  {:12}   --param {}=<{}> (default: {}) {}",
                "", parameter.name, parameter.kind, parameter.default, parameter.help
            );
        }
    }
}

/// Parses command-line arguments into a Config struct.
fn parse_arguments(args: &[String]) -> Result<Config, String> {
    let mut config = Config::default();
    let mut i = 1; // Skip program name

    let value_of = |i: usize, flag: &str| -> Result<String, String> {
        args.get(i)
            .cloned()
            .ok_or_else(|| format!("{} requires an argument", flag))
    };

    while i < args.len() {
        let arg = &args[i];

        match arg.as_str() {
            "--help" | "-h" => {
                print_usage();
                std::process::exit(0);
            }
            "--version" | "-V" => {
                println!("{} {}", APP_NAME, VERSION);
                std::process::exit(0);
            }
            "--dry-run" => config.dry_run = true,
            "--json" => config.json = true,
            "--timeline" => config.timeline = true,
            "--list" => config.list = true,
            "--verbose" | "-v" => config.verbose = true,
            "--param" | "-p" => {
                i += 1;
                config.params.push(value_of(i, "--param")?);
            }
            "--manifest" => {
                i += 1;
                config.manifest = Some(value_of(i, "--manifest")?);
            }
            "--parallel" => {
                i += 1;
                let raw = value_of(i, "--parallel")?;
                let n: usize = raw
                    .parse()
                    .map_err(|_| format!("Invalid parallel value: {}", raw))?;
                if n == 0 {
                    return Err("--parallel must be at least 1".to_string());
                }
                config.max_parallel = Some(n);
            }
            arg if arg.starts_with('-') => {
                return Err(format!("Unknown option: {}", arg));
            }
            _ => {
                if config.flow_name.is_some() {
                    return Err(format!("Unexpected argument: {}", arg));
                }
                config.flow_name = Some(arg.clone());
            }
        }
        i += 1;
    }

    if config.flow_name.is_none() && !config.list {
        return Err("No flow given".to_string());
    }

    Ok(config)
}

/// Coerces `NAME=VALUE` assignments by each parameter's declared kind.
///
/// Undeclared names are inferred from the raw text.
fn build_parameters(flow: &Flow, assignments: &[String]) -> Result<Parameters, Box<dyn std::error::Error>> {
    let mut params = Parameters::new();

    for assignment in assignments {
        let (name, raw) = split_assignment(assignment)?;
        let value = match flow.get_parameter(name) {
            Some(parameter) => parameter.coerce(raw)?,
            None => infer_value(raw),
        };
        params.insert(name, value);
    }

    Ok(params)
}

/// Resolves the flow to run: the built-in graph, or a manifest bound to
/// the built-in's handlers.
fn resolve_flow(builtin: &BuiltinFlow, manifest: Option<&str>) -> Result<Flow, Box<dyn std::error::Error>> {
    let Some(path) = manifest else {
        return Ok((builtin.build)());
    };

    let registry = (builtin.registry)();
    let flow = load_flow(path, &registry).map_err(|e| {
        error!("Failed to load manifest: {}", e);
        format!("Could not load flow from '{}': {}", path, e)
    })?;
    Ok(flow)
}

/// Prints the validated structure of a flow.
fn print_topology(flow: &Flow, topology: &Topology) {
    println!("Flow '{}' is valid ({} steps)", flow.name.bold(), flow.len());
    println!();
    for name in &topology.order {
        let Some(step) = flow.get_step(name) else {
            continue;
        };

        let mut notes = Vec::new();
        if let Some(source) = &step.foreach {
            notes.push(format!("foreach over '{}'", source));
        } else if step.next.len() > 1 {
            notes.push("branch".to_string());
        }
        if step.join {
            notes.push("join".to_string());
        }
        if let Some(join) = topology.matching_join(name) {
            notes.push(format!("closed by '{}'", join));
        }
        let policy = step.retry_policy();
        if policy.max_attempts > 1 {
            notes.push(format!("{} attempts, {:?} backoff", policy.max_attempts, policy.backoff));
        }

        let next = if step.next.is_empty() {
            "(end)".to_string()
        } else {
            step.next.join(", ")
        };
        let notes = if notes.is_empty() {
            String::new()
        } else {
            format!("  [{}]", notes.join("; "))
        };
        println!("  {:16} -> {}{}", name, next, notes);
    }
}

/// Prints the outcome of a run.
fn print_summary(result: &RunResult) {
    println!();
    let status = if result.is_success() {
        result.status.to_string().green().bold()
    } else {
        result.status.to_string().red().bold()
    };
    println!("Run {}: {} in {:.2?}", result.state.run_id, status, result.elapsed);

    let mut counts: Vec<(&str, usize)> = task_counts(&result.tasks).into_iter().collect();
    counts.sort();
    for (step, count) in counts {
        let attempts = result.attempts_for(step);
        println!("  {:16} {} task(s), {} attempt(s)", step, count, attempts);
    }

    if let Some(failure) = &result.failure {
        println!();
        println!("{} {}", "Failure:".red(), failure);
    }

    if let Some(artifacts) = &result.artifacts {
        println!();
        println!("Final artifacts:");
        for (key, value) in artifacts.iter() {
            println!("  {:16} {}", key, value);
        }
    }
}

/// Main application entry point.
fn run() -> Result<bool, Box<dyn std::error::Error>> {
    let args: Vec<String> = env::args().collect();

    // Parse arguments
    let config = parse_arguments(&args).map_err(|e| {
        eprintln!("Error: {}", e);
        eprintln!();
        print_usage();
        e
    })?;

    if config.list {
        print_catalog();
        return Ok(true);
    }

    setup_logging(config.verbose);

    if !config.json {
        print_banner();
    }

    let flow_name = config.flow_name.as_deref().unwrap_or_default();
    let builtin = flows::builtin(flow_name).ok_or_else(|| {
        format!("Unknown flow '{}'; run with --list to see built-in flows", flow_name)
    })?;

    let flow = resolve_flow(&builtin, config.manifest.as_deref())?;
    let params = build_parameters(&flow, &config.params)?;
    info!("Flow '{}' loaded: {} steps, {} parameter(s) supplied", flow.name, flow.len(), params.len());

    let mut engine = Engine::new(flow);
    if let Some(n) = config.max_parallel {
        engine.set_max_parallel(n);
    }

    if config.dry_run {
        info!("Mode: DRY RUN (no steps will execute)");
        let topology = engine.validate()?;
        print_topology(engine.flow(), &topology);
        return Ok(true);
    }

    let result = engine.run(params)?;

    if config.json {
        let report = json!({
            "state": result.state,
            "artifacts": result.artifacts.as_ref().map(|a| a.to_json()),
            "failure": result.failure.as_ref().map(|f| f.to_string()),
        });
        println!("{}", serde_json::to_string_pretty(&report)?);
    } else {
        print_summary(&result);
    }

    if config.timeline {
        println!("{}", result.timeline.gantt_chart());
    }

    if !result.is_success() {
        warn!("Run of '{}' did not complete", engine.flow().name);
    }
    Ok(result.is_success())
}

fn main() -> ExitCode {
    match run() {
        Ok(true) => ExitCode::SUCCESS,
        Ok(false) => ExitCode::FAILURE,
        Err(e) => {
            eprintln!();
            eprintln!("Error: {}", e);
            ExitCode::FAILURE
        }
    }
}
