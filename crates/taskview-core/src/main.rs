//! `taskview` command-line entry point

use anyhow::Context;
use clap::{value_parser, Arg, ArgAction, Command};
use taskview_core::simulator::{run_simulator, SimulatorConfig};
use taskview_core::EngineConfig;
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Command::new("taskview")
        .version(taskview_core::VERSION)
        .about("Optimistic mutation and view-cache coherence engine")
        .arg(
            Arg::new("log-json")
                .long("log-json")
                .global(true)
                .action(ArgAction::SetTrue)
                .help("Emit logs as JSON lines"),
        )
        .subcommand(
            Command::new("simulate")
                .about("Drive random intents against the in-memory backend")
                .arg(
                    Arg::new("ops")
                        .long("ops")
                        .default_value("500")
                        .value_parser(value_parser!(u64))
                        .help("Number of operations to simulate"),
                )
                .arg(
                    Arg::new("seed")
                        .long("seed")
                        .default_value("42")
                        .value_parser(value_parser!(u64))
                        .help("Random seed for reproducibility"),
                )
                .arg(
                    Arg::new("failure-rate")
                        .long("failure-rate")
                        .default_value("0.1")
                        .value_parser(value_parser!(f64))
                        .help("Probability that a backend write fails"),
                )
                .arg(
                    Arg::new("tasks")
                        .long("tasks")
                        .default_value("8")
                        .value_parser(value_parser!(usize))
                        .help("Tasks stored before the first operation"),
                )
                .arg(
                    Arg::new("stop-on-violation")
                        .long("stop-on-violation")
                        .action(ArgAction::SetTrue)
                        .help("Stop simulation on first violation"),
                ),
        )
        .subcommand(
            Command::new("config")
                .about("Print or check engine configuration")
                .arg(
                    Arg::new("check")
                        .long("check")
                        .value_name("FILE")
                        .help("Validate a TOML config file instead of printing defaults"),
                ),
        );

    let matches = cli.get_matches();
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    if matches.get_flag("log-json") {
        tracing_subscriber::fmt().with_env_filter(filter).json().init();
    } else {
        tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_target(false)
            .init();
    }

    match matches.subcommand() {
        Some(("simulate", args)) => {
            let config = SimulatorConfig {
                ops: args.get_one::<u64>("ops").copied().unwrap_or(500),
                seed: args.get_one::<u64>("seed").copied().unwrap_or(42),
                failure_rate: args.get_one::<f64>("failure-rate").copied().unwrap_or(0.1),
                initial_tasks: args.get_one::<usize>("tasks").copied().unwrap_or(8),
                stop_on_violation: args.get_flag("stop-on-violation"),
            };
            println!("Running taskview simulator...");
            println!("Operations: {}", config.ops);
            println!("Seed: {}", config.seed);
            println!();

            let report = run_simulator(config).await;
            println!("{}", report.generate_text());
            if !report.passed() {
                std::process::exit(1);
            }
        }
        Some(("config", args)) => match args.get_one::<String>("check") {
            Some(path) => {
                let text = std::fs::read_to_string(path)
                    .with_context(|| format!("reading {path}"))?;
                let config = EngineConfig::from_toml_str(&text)
                    .with_context(|| format!("loading {path}"))?;
                println!("{path}: ok (debounce {}ms)", config.debounce_ms);
            }
            None => {
                print!("{}", toml::to_string_pretty(&EngineConfig::default())?);
            }
        },
        _ => {}
    }
    Ok(())
}
