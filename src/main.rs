//! ShardFS - command-line entry point.

use std::path::PathBuf;
use std::process::ExitCode;

use clap::{Parser, ValueEnum};
use tracing::debug;

use shardfs::cli::{Outcome, Repl};
use shardfs::pfs::{Pfs, PfsConfig, SeekPolicyConfig};

#[derive(Parser)]
#[command(author, version, about, long_about = None)]
#[command(name = "shardfs")]
struct Cli {
    /// Directory for segment files; segments stay in memory when omitted
    #[arg(short, long)]
    data_dir: Option<PathBuf>,
    /// JSON configuration file
    #[arg(short, long)]
    config: Option<PathBuf>,
    /// Seek enforcement for files opened for write
    #[arg(long, value_enum)]
    seek_policy: Option<PolicyArg>,
    /// Run a shell command and exit (repeatable)
    #[arg(short, long)]
    execute: Vec<String>,
    /// Enable debug logging
    #[arg(short, long)]
    verbose: bool,
}

#[derive(Clone, Copy, ValueEnum)]
enum PolicyArg {
    Auto,
    DenyNonAppend,
    Deferred,
}

impl From<PolicyArg> for SeekPolicyConfig {
    fn from(arg: PolicyArg) -> Self {
        match arg {
            PolicyArg::Auto => SeekPolicyConfig::Auto,
            PolicyArg::DenyNonAppend => SeekPolicyConfig::DenyNonAppend,
            PolicyArg::Deferred => SeekPolicyConfig::Deferred,
        }
    }
}

fn main() -> ExitCode {
    let cli = Cli::parse();

    let default_filter = if cli.verbose { "debug" } else { "warn" };
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(default_filter)),
        )
        .with_writer(std::io::stderr)
        .init();

    match run(cli) {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("Error: {}", e);
            ExitCode::FAILURE
        }
    }
}

fn run(cli: Cli) -> Result<(), Box<dyn std::error::Error>> {
    let mut config = match &cli.config {
        Some(path) => PfsConfig::from_json(&std::fs::read_to_string(path)?)?,
        None => PfsConfig::default(),
    };
    if let Some(dir) = cli.data_dir {
        config.data_dir = Some(dir);
    }
    if let Some(policy) = cli.seek_policy {
        config = config.seek_policy(policy.into());
    }
    debug!(?config, "opening engine");

    let mut repl = Repl::new(Pfs::open(config)?);
    if cli.execute.is_empty() {
        repl.run()?;
        return Ok(());
    }
    for line in &cli.execute {
        match repl.execute(line)? {
            Outcome::Exit => break,
            Outcome::Continue(output) if output.is_empty() => {}
            Outcome::Continue(output) => println!("{}", output),
        }
    }
    Ok(())
}
