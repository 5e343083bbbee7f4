//! Single-run command line front end.
//!
//! Maps argv straight onto one [`RunSpec`], executes it, and prints the
//! result as `key=value` lines (or JSON with `--json`). Captured output
//! of the target is echoed back on the matching stream before the
//! result block.

use crate::error::RunError;
use crate::executor::RunExecutor;
use crate::host;
use crate::result::{RunResult, RunStatus};
use crate::spec::{OutputSink, ResourceLimits, RunSpec, StdinSource};
use anyhow::Context;
use clap::Parser;
use std::collections::BTreeSet;
use std::ffi::OsString;
use std::io::Write;
use std::path::PathBuf;
use std::process::ExitCode;
use std::time::Duration;

/// Wall-time slack granted on top of a sole CPU limit, so that a run
/// stalling without burning CPU still terminates.
const WALL_SLACK: Duration = Duration::from_secs(30);

#[derive(Parser, Debug)]
#[command(
    author,
    version,
    about = "Run a command with measured, hard resource limits",
    long_about = None
)]
struct Cli {
    /// CPU time limit in seconds, summed over the whole process tree
    #[arg(long, value_name = "SECONDS", value_parser = parse_seconds)]
    cpu_time: Option<Duration>,

    /// Wall clock limit in seconds (default: CPU limit + 30s when --cpu-time is given)
    #[arg(long, value_name = "SECONDS", value_parser = parse_seconds)]
    wall_time: Option<Duration>,

    /// Memory ceiling in bytes, with optional K/M/G/T suffix (e.g. 512M)
    #[arg(long, value_name = "SIZE", value_parser = parse_size)]
    memory: Option<u64>,

    /// CPU cores the tree may run on, Linux list format (e.g. 0,3-5)
    #[arg(long, value_name = "LIST", value_parser = host::parse_cpu_list)]
    cores: Option<BTreeSet<u32>>,

    /// NUMA memory nodes the tree may allocate on, Linux list format
    #[arg(long, value_name = "LIST", value_parser = host::parse_cpu_list)]
    memory_nodes: Option<BTreeSet<u32>>,

    /// Working directory for the command
    #[arg(long, value_name = "DIR")]
    chdir: Option<PathBuf>,

    /// Environment override (format: KEY=VALUE), repeatable
    #[arg(long = "env", value_name = "KEY=VALUE", value_parser = parse_env)]
    env_overrides: Vec<(String, String)>,

    /// Redirect the command's stdin from this file (default: /dev/null)
    #[arg(long, value_name = "FILE")]
    stdin: Option<PathBuf>,

    /// Write the command's stdout to this file instead of echoing it
    #[arg(long, value_name = "FILE")]
    stdout: Option<PathBuf>,

    /// Write the command's stderr to this file instead of echoing it
    #[arg(long, value_name = "FILE")]
    stderr: Option<PathBuf>,

    /// Limit check interval in milliseconds
    #[arg(long, value_name = "MS", default_value_t = 50)]
    poll_interval_ms: u64,

    /// Print the result as JSON instead of key=value lines
    #[arg(long)]
    json: bool,

    /// Command and arguments to execute
    #[arg(
        required = true,
        trailing_var_arg = true,
        allow_hyphen_values = true,
        value_name = "COMMAND"
    )]
    command: Vec<OsString>,
}

impl Cli {
    fn to_spec(&self) -> RunSpec {
        let mut spec = RunSpec::new(self.command.clone());
        spec.working_dir = self.chdir.clone();
        spec.env_overrides = self
            .env_overrides
            .iter()
            .map(|(key, value)| (OsString::from(key), OsString::from(value)))
            .collect();
        spec.limits = ResourceLimits {
            cpu_time: self.cpu_time,
            wall_time: self
                .wall_time
                .or_else(|| self.cpu_time.map(|cpu| cpu + WALL_SLACK)),
            memory: self.memory,
            cores: self.cores.clone(),
            memory_nodes: self.memory_nodes.clone(),
        };
        if let Some(path) = &self.stdin {
            spec.stdin = StdinSource::File(path.clone());
        }
        spec.stdout = match &self.stdout {
            Some(path) => OutputSink::File(path.clone()),
            None => OutputSink::Capture,
        };
        spec.stderr = match &self.stderr {
            Some(path) => OutputSink::File(path.clone()),
            None => OutputSink::Capture,
        };
        spec
    }
}

pub fn run() -> anyhow::Result<ExitCode> {
    env_logger::init();
    let cli = Cli::parse();
    let spec = cli.to_spec();

    let executor = match RunExecutor::new() {
        Ok(executor) => executor.with_poll_interval(Duration::from_millis(cli.poll_interval_ms)),
        Err(err) => {
            eprintln!("runcage: {}", err);
            return Ok(ExitCode::from(error_exit_code(&err)));
        }
    };

    match executor.execute(&spec) {
        Ok(result) => {
            if cli.json {
                // The JSON carries the captured streams; no echo.
                let rendered =
                    serde_json::to_string_pretty(&result).context("serializing run result")?;
                println!("{}", rendered);
            } else {
                echo_captured(&result)?;
                print_key_values(&result)?;
            }
            Ok(ExitCode::from(result_exit_code(&result)))
        }
        Err(err) => {
            eprintln!("runcage: {}", err);
            Ok(ExitCode::from(error_exit_code(&err)))
        }
    }
}

/// Captured target output goes back out on the stream it came from,
/// ahead of the result block.
fn echo_captured(result: &RunResult) -> anyhow::Result<()> {
    if let Some(stdout) = &result.stdout {
        let mut out = std::io::stdout().lock();
        out.write_all(stdout.as_bytes())
            .context("echoing captured stdout")?;
        out.flush().context("flushing stdout")?;
    }
    if let Some(stderr) = &result.stderr {
        let mut err = std::io::stderr().lock();
        err.write_all(stderr.as_bytes())
            .context("echoing captured stderr")?;
        err.flush().context("flushing stderr")?;
    }
    Ok(())
}

fn print_key_values(result: &RunResult) -> anyhow::Result<()> {
    let mut out = std::io::stdout().lock();
    writeln!(out, "status={}", result.status)?;
    if let Some(code) = result.exit_code {
        writeln!(out, "exitcode={}", code)?;
    }
    if let Some(signal) = result.term_signal {
        writeln!(out, "exitsignal={}", signal)?;
    }
    if let Some(reason) = result.termination_reason() {
        writeln!(out, "terminationreason={}", reason)?;
    }
    writeln!(out, "walltime={:.6}s", result.wall_time.as_secs_f64())?;
    if let Some(usage) = &result.usage {
        writeln!(out, "cputime={:.6}s", usage.cpu_time.as_secs_f64())?;
        writeln!(out, "memory={}B", usage.peak_memory)?;
    }
    if let Some(detail) = &result.measurement_error {
        writeln!(out, "measurement_error={}", detail)?;
    }
    Ok(())
}

/// Exit code mirrors the target where possible: its own exit code, or
/// 128 plus the terminating signal, like a shell reports.
fn result_exit_code(result: &RunResult) -> u8 {
    if result.status == RunStatus::Exited {
        if let Some(code) = result.exit_code {
            return (code & 0xff) as u8;
        }
    }
    if let Some(signal) = result.term_signal {
        return (128 + (signal & 0x3f)) as u8;
    }
    if let Some(code) = result.exit_code {
        return (code & 0xff) as u8;
    }
    0
}

fn error_exit_code(err: &RunError) -> u8 {
    match err {
        RunError::InvalidSpec(_) => 2,
        RunError::ResourceUnavailable(_) => 125,
        RunError::SpawnFailed(_) => 127,
        _ => 1,
    }
}

fn parse_seconds(raw: &str) -> Result<Duration, String> {
    let seconds: f64 = raw
        .parse()
        .map_err(|_| format!("invalid seconds value: {:?}", raw))?;
    if !seconds.is_finite() || seconds <= 0.0 {
        return Err(format!("seconds must be positive: {:?}", raw));
    }
    Duration::try_from_secs_f64(seconds).map_err(|err| err.to_string())
}

/// Byte sizes with single-letter binary suffixes: `512M`, `2G`, `16384`.
/// A trailing `B` or `iB` is tolerated (`512MB`, `512MiB`).
fn parse_size(raw: &str) -> Result<u64, String> {
    let trimmed = raw.trim();
    let trimmed = trimmed.strip_suffix(['B', 'b']).unwrap_or(trimmed);
    let trimmed = trimmed.strip_suffix(['i', 'I']).unwrap_or(trimmed);

    let (digits, multiplier) = match trimmed.chars().last() {
        Some(c) if c.is_ascii_alphabetic() => {
            let multiplier: u64 = match c.to_ascii_uppercase() {
                'K' => 1 << 10,
                'M' => 1 << 20,
                'G' => 1 << 30,
                'T' => 1 << 40,
                _ => return Err(format!("unknown size suffix {:?} in {:?}", c, raw)),
            };
            (&trimmed[..trimmed.len() - 1], multiplier)
        }
        _ => (trimmed, 1),
    };

    let value: u64 = digits
        .trim()
        .parse()
        .map_err(|_| format!("invalid size: {:?}", raw))?;
    value
        .checked_mul(multiplier)
        .ok_or_else(|| format!("size overflows: {:?}", raw))
}

fn parse_env(raw: &str) -> Result<(String, String), String> {
    match raw.split_once('=') {
        Some((key, value)) if !key.is_empty() => Ok((key.to_string(), value.to_string())),
        _ => Err(format!("expected KEY=VALUE, got {:?}", raw)),
    }
}
