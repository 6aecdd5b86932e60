//! Command-line surface (§6). Out of scope as "the core consumes a
//! validated `SessionConfig`" (§1), but kept here in the teacher's own
//! `clap` derive style so the binary in `main.rs` has something real to
//! build a `SessionConfig` from.

use std::ffi::OsString;
use std::io::Read;
use std::net::SocketAddr;
use std::path::PathBuf;

use clap::Parser;

use crate::config::{CaptureMode, ExtraEvent, SessionConfig, SourceDestination};
use crate::error::{AdaptystError, Result};
use crate::filter::{FilterPattern, FilterSpec};

#[derive(Debug, Parser)]
#[command(
    name = "adaptyst",
    version,
    disable_version_flag = true,
    about = "Drives a patched sampling profiler and concentrates its output into a per-thread result tree."
)]
pub struct Cli {
    /// On-CPU sampling frequency, in Hz.
    #[arg(short = 'F', long = "freq", default_value = "10")]
    pub freq: u32,

    /// Event buffer depth (1 = no buffering).
    #[arg(short = 'B', long = "buffer", default_value = "1")]
    pub buffer: u32,

    /// Off-CPU sampling frequency (0 disables, -1 captures all).
    #[arg(short = 'f', long = "off-cpu-freq", default_value = "0")]
    pub off_cpu_freq: i64,

    /// Off-CPU buffer depth (0 = adaptive).
    #[arg(short = 'b', long = "off-cpu-buffer", default_value = "0")]
    pub off_cpu_buffer: u32,

    /// Post-processing thread count.
    #[arg(short = 'p', long = "post-process", default_value = "0")]
    pub post_process: u32,

    /// Delegate to a remote ingest peer at HOST:PORT.
    #[arg(short = 'a', long = "address")]
    pub address: Option<SocketAddr>,

    /// Source-code destination: srv, file:<path>, or fd:<n>.
    #[arg(short = 'c', long = "codes")]
    pub codes: Option<String>,

    /// Server-side buffer depth (mutually exclusive with --address).
    #[arg(short = 's', long = "server-buffer")]
    pub server_buffer: Option<u32>,

    /// Seconds to sleep after probes are ready, before starting the command.
    #[arg(short = 'w', long = "warmup", default_value = "1")]
    pub warmup: u32,

    /// Extra event as EVENT,PERIOD,TITLE. Repeatable.
    #[arg(short = 'e', long = "event")]
    pub event: Vec<String>,

    /// Enable the CARM roofline event bundle with this sampling period.
    #[arg(short = 'r', long = "roofline")]
    pub roofline: Option<u32>,

    /// Stack filter as (deny|allow|python):<path>. `-` reads the path's
    /// content from stdin; forbidden for `python`.
    #[arg(short = 'i', long = "filter")]
    pub filter: Option<String>,

    /// Mark filtered-out frames instead of dropping them. Requires --filter.
    #[arg(short = 'k', long = "mark")]
    pub mark: bool,

    /// Capture mode.
    #[arg(short = 'm', long = "mode", default_value = "user")]
    pub mode: ModeArg,

    /// Suppress progress output.
    #[arg(short = 'q', long = "quiet")]
    pub quiet: bool,

    /// Print version information and exit.
    #[arg(short = 'v', long = "version", action = clap::ArgAction::Version)]
    pub version: (),

    /// Command to profile: either a pre-split argv after `--`, or a single
    /// shell-like string to be split.
    #[arg(trailing_var_arg = true, allow_hyphen_values = true, required = true)]
    pub command: Vec<OsString>,
}

#[derive(Debug, Clone, Copy, clap::ValueEnum)]
pub enum ModeArg {
    Kernel,
    User,
    Both,
}

impl From<ModeArg> for CaptureMode {
    fn from(mode: ModeArg) -> Self {
        match mode {
            ModeArg::Kernel => CaptureMode::Kernel,
            ModeArg::User => CaptureMode::User,
            ModeArg::Both => CaptureMode::Both,
        }
    }
}

/// Splits `raw` into the profiled command's argv. A single element is taken
/// to be an unsplit shell-like string (the `COMMAND…` positional's second
/// accepted shape, §6); more than one element is already a pre-split argv
/// from after `--` and is passed through untouched.
fn resolve_command(raw: Vec<OsString>) -> Result<Vec<OsString>> {
    if raw.len() != 1 {
        return Ok(raw);
    }
    let single = raw[0]
        .to_str()
        .ok_or_else(|| AdaptystError::User("command string must be valid UTF-8".into()))?;
    let parts = shlex::split(single)
        .ok_or_else(|| AdaptystError::User(format!("could not parse command string '{single}'")))?;
    if parts.is_empty() {
        return Err(AdaptystError::User("no command given to profile".into()));
    }
    Ok(parts.into_iter().map(OsString::from).collect())
}

fn read_filter_source(path_spec: &str, allow_stdin: bool) -> Result<String> {
    if path_spec == "-" {
        if !allow_stdin {
            return Err(AdaptystError::User(
                "--filter python:- is not allowed; python filters must name a file".into(),
            ));
        }
        let mut buf = String::new();
        std::io::stdin()
            .read_to_string(&mut buf)
            .map_err(|e| AdaptystError::User(format!("failed to read filter from stdin: {e}")))?;
        return Ok(buf);
    }
    std::fs::read_to_string(path_spec)
        .map_err(|e| AdaptystError::User(format!("failed to read filter file '{path_spec}': {e}")))
}

fn parse_filter(spec: &str) -> Result<FilterSpec> {
    let (kind, path_spec) = spec
        .split_once(':')
        .ok_or_else(|| AdaptystError::User(format!("malformed --filter '{spec}'")))?;
    match kind {
        "allow" => {
            let text = read_filter_source(path_spec, true)?;
            Ok(FilterSpec::Allow(FilterPattern::parse(&text)?))
        }
        "deny" => {
            let text = read_filter_source(path_spec, true)?;
            Ok(FilterSpec::Deny(FilterPattern::parse(&text)?))
        }
        "python" => {
            let text = read_filter_source(path_spec, false)?;
            let _ = text;
            Ok(FilterSpec::Script(PathBuf::from(path_spec)))
        }
        other => Err(AdaptystError::User(format!(
            "unrecognized --filter kind '{other}'"
        ))),
    }
}

impl Cli {
    /// Turns the raw CLI into a `SessionConfig`, given the tool paths loaded
    /// from the config file (§6). Does not call `SessionConfig::validate`;
    /// the caller does that once, against the detected hardware-thread
    /// count (§4.5 step 1).
    pub fn into_session_config(
        self,
        perf_path: PathBuf,
        carm_tool_path: Option<PathBuf>,
        roofline_benchmark_path: Option<PathBuf>,
    ) -> Result<SessionConfig> {
        let extra_events = self
            .event
            .iter()
            .map(|spec| ExtraEvent::parse(spec, false))
            .collect::<Result<Vec<_>>>()?;

        let filter = match &self.filter {
            Some(spec) => parse_filter(spec)?,
            None => FilterSpec::None,
        };

        let codes_dst = match &self.codes {
            Some(spec) => SourceDestination::parse(spec)?,
            None => SourceDestination::BundleHere,
        };

        let command = resolve_command(self.command)?;

        Ok(SessionConfig {
            freq: self.freq,
            buffer: self.buffer,
            off_cpu_freq: self.off_cpu_freq,
            off_cpu_buffer: self.off_cpu_buffer,
            post_process: self.post_process,
            mode: self.mode.into(),
            warmup_seconds: self.warmup,
            extra_events,
            filter,
            filter_mark: self.mark,
            remote_address: self.address,
            server_buffer: self.server_buffer,
            codes_dst,
            roofline: self.roofline,
            quiet: self.quiet,
            command,
            perf_path,
            carm_tool_path,
            roofline_benchmark_path,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::Parser;

    #[test]
    fn verify_cli() {
        use clap::CommandFactory;
        Cli::command().debug_assert();
    }

    #[test]
    fn parses_defaults_and_trailing_command() {
        let cli = Cli::parse_from(["adaptyst", "--", "/bin/true", "--flag"]);
        assert_eq!(cli.freq, 10);
        assert_eq!(cli.command, vec![OsString::from("/bin/true"), OsString::from("--flag")]);
    }

    #[test]
    fn resolve_command_splits_single_shell_string() {
        let resolved = resolve_command(vec![OsString::from("./cmd --flag value")]).unwrap();
        assert_eq!(
            resolved,
            vec![
                OsString::from("./cmd"),
                OsString::from("--flag"),
                OsString::from("value")
            ]
        );
    }

    #[test]
    fn resolve_command_passes_through_pre_split_argv() {
        let resolved =
            resolve_command(vec![OsString::from("./cmd"), OsString::from("a b")]).unwrap();
        assert_eq!(resolved, vec![OsString::from("./cmd"), OsString::from("a b")]);
    }

    #[test]
    fn rejects_reserved_title_prefix_via_event_flag() {
        let cli = Cli::parse_from([
            "adaptyst", "-e", "cycles,1000,CARM_FOO", "--", "/bin/true",
        ]);
        let result = cli.into_session_config(PathBuf::from("/opt/perf"), None, None);
        assert!(result.is_err());
    }

    #[test]
    fn filter_python_rejects_stdin() {
        let err = parse_filter("python:-").unwrap_err();
        assert!(matches!(err, AdaptystError::User(_)));
    }
}
