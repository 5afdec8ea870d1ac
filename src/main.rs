use anyhow::{anyhow, Context, Result};
use clap::Parser;
use rand::rngs::StdRng;
use rand::SeedableRng;
use std::time::Instant;
use tracing_subscriber::EnvFilter;

mod ca;
mod cli;
mod config;
mod executor;
mod http;
mod model;
mod oracle;
mod report;
mod rest;
mod runtime;
mod sca;
mod util;

use ca::ActsTool;
use cli::{Command, InitConfigArgs, RootArgs, RunArgs, SequencesArgs};
use config::{
    default_config, default_out_dir, load_config, stub_config, validate_config, write_config,
    RunConfig,
};
use executor::{run_all, ExecutorSettings};
use http::UreqTransport;
use oracle::Oracle;
use rest::{discover_bindings, load_operations, MatchThresholds};
use sca::SequenceCoveringArray;

fn main() -> Result<()> {
    let args = RootArgs::parse();
    let verbose = matches!(&args.command, Command::Run(run) if run.verbose);
    init_tracing(if verbose { "debug" } else { "info" });

    match args.command {
        Command::Run(args) => cmd_run(args),
        Command::Sequences(args) => cmd_sequences(args),
        Command::InitConfig(args) => cmd_init_config(args),
    }
}

fn init_tracing(default_level: &str) {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_target(false)
        .try_init();
}

/// Config file (or defaults) with CLI overrides and env fallbacks applied.
fn resolve_config(args: &RunArgs) -> Result<RunConfig> {
    let mut config = match &args.config {
        Some(path) => load_config(path)?,
        None => default_config(),
    };
    if let Some(base_url) = &args.base_url {
        config.base_url = Some(base_url.clone());
    }
    if let Some(budget) = args.budget {
        config.budget_seconds = budget;
    }
    if let Some(strength) = args.sequence_strength {
        config.sequence_strength = strength;
    }
    if let Some(strength) = args.ca_strength {
        config.ca_strength = strength;
    }
    if let Some(command) = &args.tool_command {
        config.tool_command = command.clone();
    }
    if let Some(command) = &args.lm_command {
        config.lm_command = Some(command.clone());
    }
    for raw in &args.headers {
        let (key, value) = cli::parse_header(raw)
            .ok_or_else(|| anyhow!("--header expects KEY=VALUE (got {raw:?})"))?;
        config.headers.insert(key, value);
    }
    if args.seed.is_some() {
        config.seed = args.seed;
    }
    if args.cleanup {
        config.cleanup = true;
    }
    config.apply_env();
    validate_config(&config, true)?;
    Ok(config)
}

fn cmd_run(args: RunArgs) -> Result<()> {
    let config = resolve_config(&args)?;
    let api = load_operations(&args.spec)?;
    let base_url = config
        .base_url
        .clone()
        .or_else(|| api.servers.first().cloned())
        .ok_or_else(|| anyhow!("no server URL in the description; pass --base-url"))?;
    if !base_url.starts_with("http://") && !base_url.starts_with("https://") {
        return Err(anyhow!(
            "server URL {base_url:?} is not absolute; pass --base-url"
        ));
    }
    let out = match &args.out {
        Some(out) => out.clone(),
        None => default_out_dir(&util::slug(&api.title))?,
    };

    let mut operations = api.operations;
    let thresholds = MatchThresholds {
        accept: config.match_accept,
        reject: config.match_reject,
    };
    let bindings = discover_bindings(&mut operations, &thresholds);
    if args.verbose {
        eprintln!(
            "loaded {} operations from {} ({bindings} response bindings)",
            operations.len(),
            args.spec.display()
        );
        eprintln!("testing {base_url}");
    }

    let started = Instant::now();
    let tool = ActsTool::new(&config.tool_command)?.with_deadline(started + config.budget());
    let transport = UreqTransport::new(config.request_timeout());
    let oracle = config
        .lm_command
        .clone()
        .map(|command| Oracle::from_command(command, config.oracle_max_calls));
    let settings = ExecutorSettings::from_config(&config, &base_url);
    let (sequences, report) = run_all(
        operations,
        &transport,
        &tool,
        oracle,
        settings,
        config.sequence_strength,
    );

    let written = report::write_reports(&out, &api.title, &sequences, &report)?;
    if args.verbose {
        for rel in &written {
            eprintln!("wrote {}", util::display_path(&out.join(rel), None));
        }
    }
    if args.json {
        let text =
            serde_json::to_string_pretty(&report.stats).context("serialize run statistics")?;
        println!("{text}");
    } else {
        println!("{}", report.stats.summary_line());
        println!("reports: {}", out.display());
    }
    Ok(())
}

fn cmd_sequences(args: SequencesArgs) -> Result<()> {
    if args.strength == 0 {
        return Err(anyhow!("--strength must be at least 1"));
    }
    let api = load_operations(&args.spec)?;
    let mut rng = match args.seed {
        Some(seed) => StdRng::seed_from_u64(seed),
        None => StdRng::from_entropy(),
    };
    let mut sca = SequenceCoveringArray::new(&api.operations, args.strength);
    let sequences = sca.build(&mut rng);
    let coverage = sca.coverage(&sequences);

    if args.json {
        let payload = serde_json::json!({
            "title": api.title,
            "operations": api.operations.len(),
            "requested_strength": sca.requested_strength(),
            "strength": sca.strength(),
            "sequences": sequences,
            "coverage": coverage,
        });
        let text = serde_json::to_string_pretty(&payload).context("serialize sequences")?;
        println!("{text}");
        return Ok(());
    }
    for (idx, sequence) in sequences.iter().enumerate() {
        let names: Vec<&str> = sequence.iter().map(|id| id.as_str()).collect();
        println!("{:>3}. {}", idx + 1, names.join(" -> "));
    }
    println!(
        "{} sequences over {} operations, {} permutations (strength {}{})",
        sequences.len(),
        api.operations.len(),
        sca.total_count(),
        sca.strength(),
        if sca.strength() < sca.requested_strength() {
            format!(", requested {}", sca.requested_strength())
        } else {
            String::new()
        }
    );
    Ok(())
}

fn cmd_init_config(args: InitConfigArgs) -> Result<()> {
    if args.out.exists() && !args.force {
        return Err(anyhow!(
            "{} already exists; pass --force to overwrite",
            args.out.display()
        ));
    }
    write_config(&args.out, &stub_config())?;
    println!("wrote {}", args.out.display());
    Ok(())
}
