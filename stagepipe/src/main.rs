//! `stagepipe`: run a pipeline definition against a set of targets.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::LazyLock;

use anyhow::{Result, bail};
use clap::{Parser, Subcommand};
use regex::Regex;
use tracing::debug;

use stagepipe::context::RunContext;
use stagepipe::core::selection::ALL;
use stagepipe::definition::load_definition;
use stagepipe::error::FatalError;
use stagepipe::exit_codes;
use stagepipe::io::barrier::{CancellationToken, SystemClock};
use stagepipe::io::cluster::ShellJobCounter;
use stagepipe::io::config::{Settings, load_settings};
use stagepipe::io::environment::ProcessEnvironment;
use stagepipe::io::log_sink::ConsoleSink;
use stagepipe::io::process::ShellRunner;
use stagepipe::io::report_store::write_report;
use stagepipe::logging;
use stagepipe::pipeline::Pipeline;

static VAR_KEY_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^[A-Za-z_][A-Za-z0-9_]*$").unwrap());

#[derive(Parser)]
#[command(
    name = "stagepipe",
    version,
    about = "Run stage pipelines of local and cluster-dispatched commands"
)]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Run a pipeline definition.
    Run {
        /// Pipeline definition (TOML).
        definition: PathBuf,
        /// Target directories to fan out over (replaces the definition's list).
        targets: Vec<String>,
        /// Stages to run: digits naming stage indices (e.g. "012") or "all".
        #[arg(short, long, default_value = ALL)]
        stages: String,
        /// Engine settings file.
        #[arg(short, long, default_value = "stagepipe.toml")]
        config: PathBuf,
        /// Override a definition variable (repeatable).
        #[arg(long = "var", value_name = "KEY=VALUE", value_parser = parse_var)]
        vars: Vec<(String, String)>,
        /// Pipeline log verbosity (overrides the settings file).
        #[arg(short, long)]
        verbosity: Option<u8>,
        /// Write a JSON run report here.
        #[arg(long)]
        report: Option<PathBuf>,
    },
    /// List the stages of a definition with their indices.
    Stages {
        definition: PathBuf,
    },
}

fn main() {
    match run() {
        Ok(code) => std::process::exit(code),
        Err(err) => {
            eprintln!("{:#}", err);
            std::process::exit(exit_codes::INVALID);
        }
    }
}

fn run() -> Result<i32> {
    let cli = Cli::parse();
    match cli.command {
        Command::Run {
            definition,
            targets,
            stages,
            config,
            vars,
            verbosity,
            report,
        } => cmd_run(RunArgs {
            definition,
            targets,
            stages,
            config,
            vars: vars.into_iter().collect(),
            verbosity,
            report,
        }),
        Command::Stages { definition } => cmd_stages(&definition),
    }
}

struct RunArgs {
    definition: PathBuf,
    targets: Vec<String>,
    stages: String,
    config: PathBuf,
    vars: BTreeMap<String, String>,
    verbosity: Option<u8>,
    report: Option<PathBuf>,
}

fn cmd_run(args: RunArgs) -> Result<i32> {
    let mut settings = load_settings(&args.config)?;
    if let Some(verbosity) = args.verbosity {
        settings.verbosity = verbosity;
    }
    logging::init(settings.verbosity);
    debug!(config = %args.config.display(), "settings loaded");

    let def = load_definition(&args.definition)?;
    let name = def.name.clone();
    let mut pipeline = match def.build(&args.vars) {
        Ok(pipeline) => pipeline,
        Err(err) => return Ok(fatal(&name, &err)),
    };
    if !args.targets.is_empty() {
        pipeline.set_targets(args.targets);
    }
    if let Err(err) = pipeline.select(&args.stages) {
        return Ok(fatal(&name, &err));
    }

    let code = execute(&mut pipeline, &settings)?;
    if let Some(path) = &args.report {
        write_report(path, &pipeline.report())?;
    }
    Ok(code)
}

/// Wire the real collaborators and run one pass.
fn execute(pipeline: &mut Pipeline, settings: &Settings) -> Result<i32> {
    let mut sink = ConsoleSink::new(settings.verbosity, settings.left_width, settings.right_width);
    if let Some(path) = &settings.log_file {
        sink = sink.with_log_file(path)?;
    }
    let runner = ShellRunner;
    let mut counter = ShellJobCounter::new(&runner, &settings.cluster);
    if let Some(dir) = pipeline.workdir() {
        counter = counter.with_workdir(dir);
    }
    let cancel = CancellationToken::new();
    let cx = RunContext {
        runner: &runner,
        counter: &counter,
        clock: &SystemClock,
        cancel: &cancel,
        env: &ProcessEnvironment,
        log: &sink,
        settings,
    };

    let outcome = pipeline
        .initialize(&cx)
        .and_then(|()| pipeline.run(&cx).map(|_| ()));
    Ok(match outcome {
        Ok(()) => exit_codes::OK,
        Err(err) => fatal(pipeline.name(), &err),
    })
}

fn fatal(pipeline: &str, err: &FatalError) -> i32 {
    eprint!("{}", err.render(pipeline));
    err.exit_code()
}

fn cmd_stages(definition: &Path) -> Result<i32> {
    let def = load_definition(definition)?;
    let name = def.name.clone();
    let pipeline = match def.build(&BTreeMap::new()) {
        Ok(pipeline) => pipeline,
        Err(err) => return Ok(fatal(&name, &err)),
    };
    for (index, stage) in pipeline.stages().iter().enumerate() {
        println!("{index}\t{}", stage.name());
    }
    Ok(exit_codes::OK)
}

fn parse_var(raw: &str) -> Result<(String, String)> {
    let Some((key, value)) = raw.split_once('=') else {
        bail!("expected KEY=VALUE, got `{raw}`");
    };
    if !VAR_KEY_RE.is_match(key) {
        bail!("invalid variable name `{key}`");
    }
    Ok((key.to_string(), value.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_run_with_stages_and_vars() {
        let cli = Cli::parse_from([
            "stagepipe",
            "run",
            "mcn.toml",
            "subj01",
            "subj02",
            "--stages",
            "012",
            "--var",
            "out_stem=asl",
        ]);
        match cli.command {
            Command::Run {
                targets,
                stages,
                vars,
                ..
            } => {
                assert_eq!(targets, vec!["subj01", "subj02"]);
                assert_eq!(stages, "012");
                assert_eq!(vars, vec![("out_stem".to_string(), "asl".to_string())]);
            }
            Command::Stages { .. } => panic!("expected run"),
        }
    }

    #[test]
    fn stages_default_to_all() {
        let cli = Cli::parse_from(["stagepipe", "run", "mcn.toml"]);
        assert!(matches!(cli.command, Command::Run { ref stages, .. } if stages == ALL));
    }

    #[test]
    fn var_values_may_contain_equals() {
        assert_eq!(
            parse_var("filter=thr=0").expect("parse"),
            ("filter".to_string(), "thr=0".to_string())
        );
    }

    #[test]
    fn var_keys_are_validated() {
        assert!(parse_var("1abc=x").is_err());
        assert!(parse_var("out-stem=x").is_err());
        assert!(parse_var("noequals").is_err());
    }
}
