use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::process::Command;
use std::time::Duration;

use anyhow::{Context, Result, bail};
use clap::{Parser, Subcommand};
use tracing::{debug, info};
use trainkit::fixture::train;
use trainkit::output::{write_human, write_json};
use trainkit::{CommunicatorKind, TestkitConfig, World, inspect_archives, with_local_mode_lock};

#[derive(Parser)]
#[command(name = "trainkit")]
#[command(about = "Test utilities for distributed training and local-mode serving", long_about = None)]
pub struct Cli {
    /// Verbosity level (-v for info, -vv for debug, -vvv for trace)
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    pub verbose: u8,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Training entry point that fails on rank 0 before creating a communicator
    FailureFixture {
        /// Communicator kind built by the surviving ranks
        #[arg(long, default_value = "naive", value_parser = parse_kind)]
        communicator: CommunicatorKind,
    },

    /// Check that `<group>.tar.gz` archives contain the expected members
    VerifyArchives {
        /// Directory holding the archives
        #[arg(long)]
        output_path: PathBuf,

        /// Expected members, as GROUP=MEMBER[,MEMBER...] (repeatable)
        #[arg(
            long = "expect",
            value_name = "GROUP=MEMBERS",
            required = true,
            value_parser = parse_expectation
        )]
        expectations: Vec<(String, Vec<String>)>,

        /// Print the report as JSON
        #[arg(long)]
        json: bool,
    },

    /// Run a command while holding the local-mode lock
    WithLock {
        /// Lock file (default: `TRAINKIT_LOCK_PATH` or the bundled resources path)
        #[arg(long)]
        lock_path: Option<PathBuf>,

        /// Milliseconds to keep the lock after the command exits (default: 5000)
        #[arg(long)]
        release_delay_ms: Option<u64>,

        /// Command and arguments
        #[arg(required = true, trailing_var_arg = true, allow_hyphen_values = true)]
        command: Vec<String>,
    },
}

fn parse_kind(s: &str) -> Result<CommunicatorKind, String> {
    s.parse().map_err(|e: trainkit::CommError| e.to_string())
}

fn parse_expectation(s: &str) -> Result<(String, Vec<String>), String> {
    let Some((group, members)) = s.split_once('=') else {
        return Err(format!("expected GROUP=MEMBER[,MEMBER...], got '{s}'"));
    };
    let group = group.trim();
    if group.is_empty() {
        return Err(format!("empty group name in '{s}'"));
    }
    let members = members
        .split(',')
        .map(str::trim)
        .filter(|m| !m.is_empty())
        .map(str::to_owned)
        .collect();
    Ok((group.to_owned(), members))
}

/// Run the CLI and return the process exit code.
pub fn run() -> Result<i32> {
    let cli = Cli::parse();
    crate::logging::init(cli.verbose);

    match cli.command {
        Commands::FailureFixture { communicator } => run_failure_fixture(communicator),
        Commands::VerifyArchives {
            output_path,
            expectations,
            json,
        } => run_verify_archives(&output_path, expectations, json),
        Commands::WithLock {
            lock_path,
            release_delay_ms,
            command,
        } => run_with_lock(lock_path, release_delay_ms, &command),
    }
}

fn run_failure_fixture(kind: CommunicatorKind) -> Result<i32> {
    let world = World::from_env().context("failed to read distributed world from environment")?;
    let comm = train(&world, kind)?;
    info!(
        rank = comm.rank(),
        size = comm.size(),
        kind = %comm.kind(),
        "joined communicator"
    );
    Ok(0)
}

fn run_verify_archives(
    output_path: &Path,
    expectations: Vec<(String, Vec<String>)>,
    json: bool,
) -> Result<i32> {
    if !output_path.is_dir() {
        bail!("Output path is not a directory: {}", output_path.display());
    }

    let mut map: BTreeMap<String, Vec<String>> = BTreeMap::new();
    for (group, members) in expectations {
        map.entry(group).or_default().extend(members);
    }

    let report = inspect_archives(output_path, &map);
    let mut stdout = std::io::stdout().lock();
    if json {
        write_json(&report, &mut stdout)?;
    } else {
        write_human(&report, &mut stdout)?;
    }
    Ok(i32::from(!report.ok))
}

fn run_with_lock(
    lock_path: Option<PathBuf>,
    release_delay_ms: Option<u64>,
    command: &[String],
) -> Result<i32> {
    let testkit = TestkitConfig::from_env()?;
    let mut config = testkit.lock;
    if let Some(path) = lock_path {
        config.path = path;
    }
    if let Some(millis) = release_delay_ms {
        config.release_delay = Duration::from_millis(millis);
    }

    let Some((program, args)) = command.split_first() else {
        bail!("No command given");
    };
    debug!(
        lock = %config.path.display(),
        endpoint = %testkit.local_mode.base_url(),
        "serializing access to the local-mode endpoint"
    );

    let status = with_local_mode_lock(&config, || Command::new(program).args(args).status())
        .with_context(|| format!("failed to lock {}", config.path.display()))?
        .with_context(|| format!("failed to run {program}"))?;

    // A signal-terminated child has no code; report it as a plain failure.
    Ok(status.code().unwrap_or(1))
}
