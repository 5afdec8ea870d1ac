//! CLI argument parsing.
//!
//! The CLI stays thin: it loads the description and config, then hands off
//! to the executor or the sequence builder.
use clap::{Parser, Subcommand};
use std::path::PathBuf;

#[derive(Parser, Debug)]
#[command(
    name = "restcov",
    version,
    about = "Combinatorial black-box test generator for REST APIs",
    after_help = "Commands:\n  run --spec <file>          Generate and execute tests, write reports\n  sequences --spec <file>    Print the operation sequences that would run\n  init-config --out <file>   Write a run config stub\n\nExamples:\n  restcov init-config --out restcov.json\n  restcov sequences --spec petstore.yaml --strength 2\n  restcov run --spec petstore.yaml --config restcov.json --out /tmp/petstore-run",
    subcommand_required = true,
    arg_required_else_help = true
)]
pub struct RootArgs {
    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    Run(RunArgs),
    Sequences(SequencesArgs),
    InitConfig(InitConfigArgs),
}

/// Inputs for a full test run.
#[derive(Parser, Debug)]
#[command(about = "Generate and execute combinatorial tests against a live API")]
pub struct RunArgs {
    /// OpenAPI 3 or Swagger 2 description (JSON or YAML)
    #[arg(long, value_name = "FILE")]
    pub spec: PathBuf,

    /// Run config (restcov.json); defaults apply when omitted
    #[arg(long, value_name = "FILE")]
    pub config: Option<PathBuf>,

    /// Server under test; overrides the config and the description
    #[arg(long, value_name = "URL")]
    pub base_url: Option<String>,

    /// Report directory (default: <data dir>/restcov/runs/<title>)
    #[arg(long, value_name = "DIR")]
    pub out: Option<PathBuf>,

    /// Wall-clock budget in seconds
    #[arg(long, value_name = "SECS")]
    pub budget: Option<u64>,

    #[arg(long, value_name = "N")]
    pub sequence_strength: Option<usize>,

    #[arg(long, value_name = "N")]
    pub ca_strength: Option<usize>,

    /// Covering-array tool command ({algo} {strength} {input} {output})
    #[arg(long, value_name = "CMD")]
    pub tool_command: Option<String>,

    /// Oracle command; receives the prompt on stdin
    #[arg(long, value_name = "CMD")]
    pub lm_command: Option<String>,

    /// Extra request header, repeatable
    #[arg(long = "header", value_name = "KEY=VALUE")]
    pub headers: Vec<String>,

    #[arg(long, value_name = "N")]
    pub seed: Option<u64>,

    /// Delete created resources at the end of the run
    #[arg(long)]
    pub cleanup: bool,

    /// Print statistics as JSON instead of a summary line
    #[arg(long)]
    pub json: bool,

    /// Emit debug logs and progress lines
    #[arg(long)]
    pub verbose: bool,
}

/// Inputs for printing the sequence covering array.
#[derive(Parser, Debug)]
#[command(about = "Build and print the operation sequences without executing them")]
pub struct SequencesArgs {
    #[arg(long, value_name = "FILE")]
    pub spec: PathBuf,

    /// Sequence strength (permutation length to cover)
    #[arg(long, value_name = "N", default_value_t = 2)]
    pub strength: usize,

    #[arg(long, value_name = "N")]
    pub seed: Option<u64>,

    /// Emit machine-readable JSON output
    #[arg(long)]
    pub json: bool,
}

#[derive(Parser, Debug)]
#[command(about = "Write a run config stub")]
pub struct InitConfigArgs {
    #[arg(long, value_name = "FILE")]
    pub out: PathBuf,

    /// Overwrite an existing file
    #[arg(long)]
    pub force: bool,
}

/// Split a `KEY=VALUE` header flag.
pub fn parse_header(raw: &str) -> Option<(String, String)> {
    let (key, value) = raw.split_once('=')?;
    let key = key.trim();
    if key.is_empty() {
        return None;
    }
    Some((key.to_string(), value.trim().to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn cli_definition_is_consistent() {
        RootArgs::command().debug_assert();
    }

    #[test]
    fn run_flags_parse() {
        let args = RootArgs::try_parse_from([
            "restcov",
            "run",
            "--spec",
            "api.yaml",
            "--header",
            "Authorization=Bearer t",
            "--header",
            "X-Env=ci",
            "--ca-strength",
            "3",
            "--cleanup",
        ])
        .expect("parse");
        let Command::Run(run) = args.command else {
            panic!("expected run");
        };
        assert_eq!(run.spec, PathBuf::from("api.yaml"));
        assert_eq!(run.headers.len(), 2);
        assert_eq!(run.ca_strength, Some(3));
        assert!(run.cleanup);
        assert!(run.budget.is_none());
    }

    #[test]
    fn header_flags_split_on_first_equals() {
        assert_eq!(
            parse_header("X-Q = a=b"),
            Some(("X-Q".to_string(), "a=b".to_string()))
        );
        assert_eq!(parse_header("novalue"), None);
        assert_eq!(parse_header("=x"), None);
    }
}
