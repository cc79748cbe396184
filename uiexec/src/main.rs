//! `uiexec`: run a UI test suite with failure triage, an approval gate and
//! bounded retries.

use std::env;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result, bail};
use clap::{Args, Parser, Subcommand};

use uiexec::exit_codes;
use uiexec::io::approver::{Approver, AutoApprover, CommandApprover, ConsoleApprover};
use uiexec::io::classifier::{Classifier, CommandClassifier, UnconfiguredClassifier};
use uiexec::io::attempt_log::validate_run_id;
use uiexec::io::config::{
    ApproverKind, DEFAULT_CONFIG_FILE, RunnerConfig, load_config, write_config,
};
use uiexec::io::test_runner::CommandTestRunner;
use uiexec::logging;
use uiexec::orchestrator::Orchestrator;
use uiexec::report::render_summary;
use uiexec::steps::prepare;

#[derive(Parser)]
#[command(
    name = "uiexec",
    version,
    about = "Run UI test suites with failure triage, approval and bounded retries"
)]
struct Cli {
    /// Path to the config file.
    #[arg(long, global = true, default_value = DEFAULT_CONFIG_FILE)]
    config: PathBuf,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Run the suite until it is accepted or the retry budget is spent.
    Run(RunArgs),
    /// Load and validate the config, then print it as resolved.
    CheckConfig,
    /// Write a default config file.
    Init {
        /// Overwrite an existing file.
        #[arg(short, long)]
        force: bool,
    },
}

#[derive(Args, Debug, Default)]
struct RunArgs {
    /// Suite selector (overrides `suite` in the config).
    #[arg(long)]
    suite: Option<String>,

    /// Target environment (overrides `environment` in the config).
    #[arg(long = "env")]
    environment: Option<String>,

    /// Additional attempts after the first.
    #[arg(long, allow_negative_numbers = true)]
    max_retries: Option<i64>,

    /// Extra runner override, repeatable.
    #[arg(long = "set", value_name = "KEY=VALUE", value_parser = parse_key_value)]
    overrides: Vec<(String, String)>,

    /// Explicit run id (default: `<suite-slug>-<unix-millis>`).
    #[arg(long, value_parser = parse_run_id)]
    run_id: Option<String>,

    /// Print the full JSON report instead of a summary.
    #[arg(long)]
    json: bool,
}

fn main() {
    logging::init();
    let cli = match Cli::try_parse() {
        Ok(cli) => cli,
        Err(err) => {
            let code = if err.use_stderr() {
                exit_codes::FATAL
            } else {
                exit_codes::OK
            };
            if let Err(print_err) = err.print() {
                eprintln!("{print_err}");
            }
            std::process::exit(code);
        }
    };
    match run(cli) {
        Ok(code) => std::process::exit(code),
        Err(err) => {
            eprintln!("{err:#}");
            std::process::exit(exit_codes::FATAL);
        }
    }
}

fn run(cli: Cli) -> Result<i32> {
    match cli.command {
        Command::Run(args) => cmd_run(&cli.config, args),
        Command::CheckConfig => cmd_check_config(&cli.config),
        Command::Init { force } => cmd_init(&cli.config, force),
    }
}

fn cmd_run(config_path: &Path, args: RunArgs) -> Result<i32> {
    let mut cfg = load_config(config_path)?;
    apply_run_args(&mut cfg, &args);
    let raw = cfg.raw_run_config();
    let workdir = env::current_dir().context("resolve working directory")?;

    let runner = CommandTestRunner::new(cfg.runner.clone(), workdir.clone());
    let classifier: Box<dyn Classifier> = if cfg.classifier.command.is_empty() {
        Box::new(UnconfiguredClassifier)
    } else {
        Box::new(CommandClassifier::new(
            cfg.classifier.clone(),
            &raw.resolved_environment(),
            workdir.clone(),
        )?)
    };
    let approval_timeout = Duration::from_secs(cfg.approver.timeout_secs);
    let approver: Box<dyn Approver> = match cfg.approver.kind {
        ApproverKind::Auto => Box::new(AutoApprover),
        ApproverKind::Command => Box::new(CommandApprover::new(
            cfg.approver.command.clone(),
            approval_timeout,
            workdir,
        )),
        ApproverKind::Console => Box::new(ConsoleApprover::stdio(approval_timeout)),
    };

    let mut orchestrator = Orchestrator::new(runner, classifier, approver)
        .with_parallelism(cfg.classifier.parallelism);
    if let Some(dir) = &cfg.artifacts_dir {
        orchestrator = orchestrator.with_artifacts_dir(dir.clone());
    }
    if let Some(run_id) = args.run_id {
        orchestrator = orchestrator.with_run_id(run_id);
    }

    let report = orchestrator.run(&raw);
    if args.json {
        println!(
            "{}",
            serde_json::to_string_pretty(&report).context("serialize run report")?
        );
    } else {
        print!("{}", render_summary(&report));
    }
    Ok(exit_codes::for_reason(report.terminal_reason))
}

fn apply_run_args(cfg: &mut RunnerConfig, args: &RunArgs) {
    if let Some(suite) = &args.suite {
        cfg.suite = suite.clone();
    }
    if let Some(environment) = &args.environment {
        cfg.environment = environment.clone();
    }
    if let Some(max_retries) = args.max_retries {
        cfg.max_retries = max_retries;
    }
    for (key, value) in &args.overrides {
        cfg.overrides.insert(key.clone(), value.clone());
    }
}

fn cmd_check_config(config_path: &Path) -> Result<i32> {
    let cfg = load_config(config_path)?;
    prepare(&cfg.raw_run_config())
        .with_context(|| format!("validate {}", config_path.display()))?;
    print!(
        "{}",
        toml::to_string_pretty(&cfg).context("serialize config toml")?
    );
    Ok(exit_codes::OK)
}

fn cmd_init(config_path: &Path, force: bool) -> Result<i32> {
    if config_path.exists() && !force {
        bail!(
            "{} already exists (use --force to overwrite)",
            config_path.display()
        );
    }
    let cfg = RunnerConfig {
        suite: "tests/ui".to_string(),
        ..RunnerConfig::default()
    };
    write_config(config_path, &cfg)?;
    println!("wrote {}", config_path.display());
    Ok(exit_codes::OK)
}

fn parse_key_value(raw: &str) -> Result<(String, String), String> {
    let (key, value) = raw
        .split_once('=')
        .ok_or_else(|| format!("expected KEY=VALUE, got '{raw}'"))?;
    let key = key.trim();
    if key.is_empty() {
        return Err(format!("empty key in '{raw}'"));
    }
    Ok((key.to_string(), value.to_string()))
}

fn parse_run_id(raw: &str) -> Result<String, String> {
    validate_run_id(raw)?;
    Ok(raw.to_string())
}
