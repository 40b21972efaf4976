//! fiu-ctrl: remote control for processes exposing fiu control pipes.
//!
//! Sends every command to every target, in order, and reports replies of `-1`.
//!
//! # Usage
//!
//! ```bash
//! # Make all I/O in process 1234 fail 10% of the time
//! fiu-ctrl -c "enable_random name=posix/io/*,probability=0.1" 1234
//!
//! # Same thing through an explicit pipe prefix
//! fiu-ctrl -c "enable_random name=posix/io/*,probability=0.1" /run/app/ctl
//!
//! # Deprecated flag form of the above
//! fiu-ctrl -e 'posix/io/*' -p 0.1 1234
//!
//! # Show which processes can be controlled
//! fiu-ctrl --list
//! ```
//!
//! ## Configuration
//! - FIU_LOG: tracing filter (default: warn)
//! - FIU_CONFIG / --config: YAML configuration file
//! - FIU__CONTROL__BASE_PREFIX: base prefix for pid targets

use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::time::Duration;

use clap::{ArgMatches, CommandFactory, FromArgMatches, Parser};
use tracing::debug;

use fiu::config::Config;
use fiu::control::{list_targets, ControlClient, ControlTarget};
use fiu::protocol::{Command, ParseError, Reply};
use fiu::utils::bootstrap::init_tracing_with_default;
use fiu::FailInfo;

#[derive(Parser, Debug)]
#[command(name = "fiu-ctrl")]
#[command(about = "Enable and disable failure points in running processes")]
#[command(version)]
struct Cli {
    /// Process ids or explicit pipe prefixes to control.
    #[arg(value_name = "TARGET")]
    targets: Vec<String>,

    /// Command to send, e.g. "enable name=posix/io/read" (repeatable).
    #[arg(short = 'c', long = "command", value_name = "COMMAND")]
    commands: Vec<String>,

    /// Base prefix for pid targets (default: ${TMPDIR:-/tmp}/fiu-ctrl).
    #[arg(short = 'f', long = "fifo-base", value_name = "BASE")]
    fifo_base: Option<PathBuf>,

    /// Seconds to wait for each reply; 0 waits forever.
    #[arg(short = 't', long = "timeout", value_name = "SECS")]
    timeout: Option<u64>,

    /// List processes that expose control pipes, then exit.
    #[arg(short = 'l', long = "list")]
    list: bool,

    /// Configuration file.
    #[arg(long = "config", value_name = "FILE")]
    config: Option<String>,

    /// Enable a failure point (deprecated, use -c).
    #[arg(short = 'e', value_name = "NAME")]
    enable: Vec<String>,

    /// Probability for the preceding -e (deprecated, use -c).
    #[arg(short = 'p', value_name = "PROB", allow_negative_numbers = true)]
    probability: Vec<f64>,

    /// Fail code for the preceding -e (deprecated, use -c).
    #[arg(short = 'u', value_name = "FAILNUM", allow_negative_numbers = true)]
    failnum: Vec<i64>,

    /// Fail info for the preceding -e (deprecated, use -c).
    #[arg(short = 'i', value_name = "FAILINFO")]
    failinfo: Vec<u64>,

    /// Disable a failure point (deprecated, use -c).
    #[arg(short = 'd', value_name = "NAME")]
    disable: Vec<String>,
}

/// One command-building option, in the position it appeared.
#[derive(Debug, Clone, PartialEq)]
enum Step {
    Raw(String),
    Enable(String),
    Probability(f64),
    Failnum(i64),
    Failinfo(u64),
    Disable(String),
}

fn positioned<T: Clone>(
    matches: &ArgMatches,
    id: &str,
    values: &[T],
    wrap: impl Fn(T) -> Step,
) -> Vec<(usize, Step)> {
    matches
        .indices_of(id)
        .into_iter()
        .flatten()
        .zip(values.iter().cloned())
        .map(|(index, value)| (index, wrap(value)))
        .collect()
}

/// Gather command options in command-line order.
fn collect_steps(matches: &ArgMatches, cli: &Cli) -> Vec<Step> {
    let mut steps = Vec::new();
    steps.extend(positioned(matches, "commands", &cli.commands, Step::Raw));
    steps.extend(positioned(matches, "enable", &cli.enable, Step::Enable));
    steps.extend(positioned(matches, "probability", &cli.probability, Step::Probability));
    steps.extend(positioned(matches, "failnum", &cli.failnum, Step::Failnum));
    steps.extend(positioned(matches, "failinfo", &cli.failinfo, Step::Failinfo));
    steps.extend(positioned(matches, "disable", &cli.disable, Step::Disable));
    steps.sort_by_key(|(index, _)| *index);
    steps.into_iter().map(|(_, step)| step).collect()
}

/// Parameters collected for one deprecated `-e`.
#[derive(Debug)]
struct PendingEnable {
    name: Option<String>,
    probability: Option<f64>,
    failnum: i64,
    failinfo: FailInfo,
}

impl Default for PendingEnable {
    fn default() -> Self {
        Self {
            name: None,
            probability: None,
            failnum: 1,
            failinfo: FailInfo::NONE,
        }
    }
}

impl PendingEnable {
    /// Emit the pending enable, if any, and reset the parameters.
    fn flush(&mut self, commands: &mut Vec<Command>) -> Result<(), ParseError> {
        let pending = std::mem::take(self);
        let Some(name) = pending.name else {
            *self = pending;
            return Ok(());
        };
        let built = match pending.probability {
            Some(probability) => Command::EnableRandom {
                name,
                probability,
                failnum: pending.failnum,
                failinfo: pending.failinfo,
                onetime: false,
            },
            None => Command::Enable {
                name,
                failnum: pending.failnum,
                failinfo: pending.failinfo,
                onetime: false,
            },
        };
        commands.push(Command::parse(&built.to_string())?);
        Ok(())
    }
}

/// Turn options into commands.
///
/// `-p`, `-u` and `-i` modify the `-e` they follow. Given before any `-e`,
/// they modify the first one. The parameters reset after each enable.
/// Flag-built commands go through the same parser as `-c` ones.
fn assemble(steps: Vec<Step>) -> Result<Vec<Command>, ParseError> {
    let mut pending = PendingEnable::default();
    let mut commands = Vec::new();

    for step in steps {
        match step {
            Step::Raw(line) => {
                pending.flush(&mut commands)?;
                commands.push(Command::parse(&line)?);
            }
            Step::Enable(name) => {
                pending.flush(&mut commands)?;
                pending.name = Some(name);
            }
            Step::Disable(name) => {
                pending.flush(&mut commands)?;
                commands.push(Command::parse(&Command::Disable { name }.to_string())?);
            }
            Step::Probability(p) => pending.probability = Some(p),
            Step::Failnum(n) => pending.failnum = n,
            Step::Failinfo(i) => pending.failinfo = FailInfo::new(i),
        }
    }
    pending.flush(&mut commands)?;
    Ok(commands)
}

/// A target is a pid when it is all digits, otherwise a pipe prefix.
fn parse_target(raw: &str, base: &Path) -> ControlTarget {
    match raw.parse::<u32>() {
        Ok(pid) if raw.bytes().all(|b| b.is_ascii_digit()) => {
            ControlTarget::pid_with_base(base, pid)
        }
        _ => ControlTarget::path(raw),
    }
}

/// Send all commands to one target. Returns whether every command succeeded.
async fn control_target(raw: &str, client: &ControlClient, commands: &[Command]) -> bool {
    let mut connection = match client.connect().await {
        Ok(c) => c,
        Err(e) => {
            eprintln!("fiu-ctrl: {}: {}", raw, e);
            return false;
        }
    };

    let mut ok = true;
    for command in commands {
        match connection.send(command).await {
            Ok(Reply::Error) => {
                eprintln!("fiu-ctrl: {}: warning: command failed: {}", raw, command);
                ok = false;
            }
            Ok(reply) => debug!(target = %raw, command = %command, reply = %reply, "Sent"),
            Err(e) => {
                eprintln!("fiu-ctrl: {}: {}", raw, e);
                return false;
            }
        }
    }
    ok
}

async fn run() -> Result<ExitCode, Box<dyn std::error::Error>> {
    let matches = Cli::command().get_matches();
    let cli = Cli::from_arg_matches(&matches)?;
    let config = Config::load(cli.config.as_deref())?;

    let base = cli
        .fifo_base
        .clone()
        .unwrap_or_else(|| config.control.base_prefix.clone());
    let timeout = match cli.timeout {
        Some(0) => None,
        Some(secs) => Some(Duration::from_secs(secs)),
        None => config.control.reply_timeout(),
    };

    if cli.list {
        for target in list_targets(&base)? {
            println!("{}\t{}", target.pid, target.prefix.display());
        }
        return Ok(ExitCode::SUCCESS);
    }

    let commands = assemble(collect_steps(&matches, &cli))?;
    if commands.is_empty() {
        return Err("no commands given (use -c COMMAND)".into());
    }
    if cli.targets.is_empty() {
        return Err("no targets given".into());
    }

    let mut all_ok = true;
    for raw in &cli.targets {
        let target = parse_target(raw, &base);
        let client = match ControlClient::resolve(target) {
            Ok(client) => client.with_timeout(timeout),
            Err(e) => {
                eprintln!("fiu-ctrl: {}: {}", raw, e);
                all_ok = false;
                continue;
            }
        };
        all_ok &= control_target(raw, &client, &commands).await;
    }

    Ok(if all_ok {
        ExitCode::SUCCESS
    } else {
        ExitCode::FAILURE
    })
}

#[tokio::main]
async fn main() -> ExitCode {
    init_tracing_with_default("warn");

    match run().await {
        Ok(code) => code,
        Err(e) => {
            eprintln!("fiu-ctrl: {}", e);
            ExitCode::from(2)
        }
    }
}
