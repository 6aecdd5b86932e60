//! Profiler probe (§4.4): launches the patched sampler as a child process
//! pinned to the profiler CPU set, wires its data connection, and surfaces
//! its exit code without aborting its siblings.
//!
//! The probe binary's exact flag grammar is not spec-mandated ("compute
//! argv from event kind, capture mode, frequency/period, buffer depths,
//! filter spec, and the ingest server's dial instructions" — §4.4); the
//! concrete flags built in [`build_argv`] are this implementation's choice,
//! modeled on `perf record`'s own flag shapes since the probe wraps a
//! patched `perf`.

use std::collections::BTreeSet;
use std::ffi::OsString;
use std::os::fd::RawFd;
use std::os::unix::process::CommandExt;
use std::path::{Path, PathBuf};
use std::process::{Child, Command, Stdio};
use std::thread;

use crate::config::CaptureMode;
use crate::cpu;
use crate::error::{AdaptystError, Result};
use crate::filter::FilterSpec;

/// One probe's event family (§3 `Probe`).
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EventKind {
    /// The syscall/thread-tree probe.
    ThreadTree,
    /// The always-present on-CPU + off-CPU sampling probe.
    OnOffCpu { freq: u32, off_cpu_freq: i64, off_cpu_buffer: u32 },
    /// An extra event, including CARM roofline-bundle events (§4.5 step 4).
    Named { event_name: String, period: u64, title: String },
}

impl EventKind {
    pub fn label(&self) -> String {
        match self {
            EventKind::ThreadTree => "tree".to_string(),
            EventKind::OnOffCpu { .. } => "main".to_string(),
            EventKind::Named { title, .. } => title.clone(),
        }
    }
}

/// Everything `build_argv` needs for one probe, independent of where its
/// data connection is bound.
#[derive(Debug, Clone)]
pub struct ProbeSpec {
    pub event_kind: EventKind,
    pub mode: CaptureMode,
    pub filter: FilterSpec,
    pub filter_mark: bool,
    pub buffer_size: u32,
}

fn mode_flag(mode: CaptureMode) -> &'static str {
    match mode {
        CaptureMode::Kernel => "kernel",
        CaptureMode::User => "user",
        CaptureMode::Both => "both",
    }
}

fn filter_args(filter: &FilterSpec, mark: bool) -> Vec<OsString> {
    let mut args = Vec::new();
    match filter {
        FilterSpec::None => return args,
        FilterSpec::Allow(pattern) => {
            args.push("--filter-mode".into());
            args.push("allow".into());
            args.push("--filter-pattern".into());
            args.push(pattern.render().into());
        }
        FilterSpec::Deny(pattern) => {
            args.push("--filter-mode".into());
            args.push("deny".into());
            args.push("--filter-pattern".into());
            args.push(pattern.render().into());
        }
        FilterSpec::Script(path) => {
            args.push("--filter-mode".into());
            args.push("python".into());
            args.push("--filter-script".into());
            args.push(path.into());
        }
    }
    if mark {
        args.push("--filter-mark".into());
    }
    args
}

/// Builds the probe's argv. `dial_type`/`dial_instructions` are the data
/// acceptor's own `type_tag()`/`dial_instructions()`.
pub fn build_argv(
    perf_path: &Path,
    spec: &ProbeSpec,
    dial_type: &str,
    dial_instructions: &str,
) -> (PathBuf, Vec<OsString>) {
    let binary = perf_path.join("bin").join("perf");
    let mut args: Vec<OsString> = vec!["adaptyst-probe".into()];

    match &spec.event_kind {
        EventKind::ThreadTree => {
            args.push("--probe".into());
            args.push("syscall-tree".into());
        }
        EventKind::OnOffCpu {
            freq,
            off_cpu_freq,
            off_cpu_buffer,
        } => {
            args.push("--probe".into());
            args.push("on-off-cpu".into());
            args.push("--freq".into());
            args.push(freq.to_string().into());
            args.push("--off-cpu-freq".into());
            args.push(off_cpu_freq.to_string().into());
            args.push("--off-cpu-buffer".into());
            args.push(off_cpu_buffer.to_string().into());
        }
        EventKind::Named {
            event_name,
            period,
            title,
        } => {
            args.push("--probe".into());
            args.push("event".into());
            args.push("--event-name".into());
            args.push(event_name.into());
            args.push("--period".into());
            args.push(period.to_string().into());
            args.push("--title".into());
            args.push(title.into());
        }
    }

    args.push("--mode".into());
    args.push(mode_flag(spec.mode).into());
    args.push("--buffer".into());
    args.push(spec.buffer_size.to_string().into());
    args.extend(filter_args(&spec.filter, spec.filter_mark));
    args.push("--connect".into());
    args.push(dial_type.into());
    args.push(dial_instructions.into());

    (binary, args)
}

/// Descriptors the pipe-transport probe must `dup2` onto before exec, so
/// the child inherits its end of the acceptor's OS pipe pair at fixed
/// numbers matching `dial_instructions()` (`fd_fd`).
#[derive(Debug, Clone, Copy)]
pub struct PipeDup {
    pub child_write: RawFd,
    pub child_read: RawFd,
    pub target_write: RawFd,
    pub target_read: RawFd,
}

/// A spawned, not-yet-reaped probe child process.
pub struct LaunchedProbe {
    pub label: String,
    child: Child,
}

/// Spawns one probe, pinned to `cpus` (§4.4 "Set the child's CPU affinity
/// to `profiler_set`, or inherit when isolation is disabled").
pub fn spawn(
    perf_path: &Path,
    spec: &ProbeSpec,
    dial_type: &str,
    dial_instructions: &str,
    pipe_dup: Option<PipeDup>,
    cpus: &BTreeSet<usize>,
) -> Result<LaunchedProbe> {
    let label = spec.event_kind.label();
    let (binary, argv) = build_argv(perf_path, spec, dial_type, dial_instructions);

    let mut command = Command::new(&binary);
    command
        .args(&argv)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped());

    let cpu_ids: Vec<usize> = cpus.iter().copied().collect();
    unsafe {
        command.pre_exec(move || {
            if let Some(dup) = pipe_dup {
                if libc::dup2(dup.child_write, dup.target_write) < 0 {
                    return Err(std::io::Error::last_os_error());
                }
                if libc::dup2(dup.child_read, dup.target_read) < 0 {
                    return Err(std::io::Error::last_os_error());
                }
            }
            if !cpu_ids.is_empty() {
                let mut set: libc::cpu_set_t = std::mem::zeroed();
                libc::CPU_ZERO(&mut set);
                for &cpu in &cpu_ids {
                    libc::CPU_SET(cpu, &mut set);
                }
                if libc::sched_setaffinity(0, std::mem::size_of::<libc::cpu_set_t>(), &set) != 0 {
                    return Err(std::io::Error::last_os_error());
                }
            }
            Ok(())
        });
    }

    let mut child = command
        .spawn()
        .map_err(|e| AdaptystError::Tool {
            tool: format!("{} ({label} probe)", binary.display()),
            code: e.raw_os_error().unwrap_or(-1),
        })?;

    drain_pipe(child.stdout.take(), "stdout", &label);
    drain_pipe(child.stderr.take(), "stderr", &label);

    Ok(LaunchedProbe { label, child })
}

fn drain_pipe<R: std::io::Read + Send + 'static>(pipe: Option<R>, which: &'static str, label: &str) {
    let Some(mut pipe) = pipe else { return };
    let label = label.to_string();
    thread::spawn(move || {
        use std::io::BufRead;
        let reader = std::io::BufReader::new(&mut pipe);
        for line in reader.lines().map_while(std::io::Result::ok) {
            log::debug!("probe '{label}' {which}: {line}");
        }
    });
}

impl LaunchedProbe {
    pub fn pid(&self) -> u32 {
        self.child.id()
    }

    /// Blocks until this probe's child exits (§4.4 "wait for the child in
    /// parallel with the session"; the session controller calls this from
    /// its own worker thread per probe).
    pub fn wait(mut self) -> Result<()> {
        let status = self
            .child
            .wait()
            .map_err(|e| AdaptystError::Connection(format!("waiting on probe '{}': {e}", self.label)))?;
        if status.success() {
            Ok(())
        } else {
            Err(AdaptystError::Tool {
                tool: self.label,
                code: status.code().unwrap_or(-1),
            })
        }
    }

    /// Best-effort termination used during fatal-error teardown (§4.5 step
    /// 9, §5 "Cancellation").
    pub fn terminate(&self) {
        unsafe {
            libc::kill(self.child.id() as i32, libc::SIGTERM);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::filter::FilterSpec;

    fn base_spec() -> ProbeSpec {
        ProbeSpec {
            event_kind: EventKind::OnOffCpu {
                freq: 10,
                off_cpu_freq: -1,
                off_cpu_buffer: 0,
            },
            mode: CaptureMode::User,
            filter: FilterSpec::None,
            filter_mark: false,
            buffer_size: 1,
        }
    }

    #[test]
    fn builds_on_off_cpu_argv() {
        let spec = base_spec();
        let (binary, argv) = build_argv(Path::new("/opt/perf"), &spec, "tcp", "127.0.0.1_9000");
        assert_eq!(binary, Path::new("/opt/perf/bin/perf"));
        assert!(argv.iter().any(|a| a == "on-off-cpu"));
        assert!(argv.iter().any(|a| a == "127.0.0.1_9000"));
    }

    #[test]
    fn named_event_argv_carries_title() {
        let mut spec = base_spec();
        spec.event_kind = EventKind::Named {
            event_name: "cycles".to_string(),
            period: 1_000_000,
            title: "CYCLES".to_string(),
        };
        let (_, argv) = build_argv(Path::new("/opt/perf"), &spec, "pipe", "10_11");
        assert!(argv.iter().any(|a| a == "CYCLES"));
        assert!(argv.iter().any(|a| a == "1000000"));
    }

    #[test]
    fn thread_tree_argv_has_no_frequency_flags() {
        let mut spec = base_spec();
        spec.event_kind = EventKind::ThreadTree;
        let (_, argv) = build_argv(Path::new("/opt/perf"), &spec, "tcp", "h_1");
        assert!(argv.iter().any(|a| a == "syscall-tree"));
        assert!(!argv.iter().any(|a| a == "--freq"));
    }
}
