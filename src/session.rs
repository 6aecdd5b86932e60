//! Session controller (§4.5): top-level orchestrator. Builds the probe set
//! from config, binds (or dials) the ingest connection, runs the warmup
//! handshake, starts the profiled command, waits for everything to settle,
//! and propagates the consolidated exit status.
//!
//! The profiled command's wrapper — which in the original tool stamps the
//! session epoch and drives the control protocol as "peer" — is out of
//! scope (§1: "Discovery of the patched sampling tool's binary and script
//! paths"). This implementation has the session controller play the peer
//! role directly: it dials the control connection itself (self-dialing its
//! own bound acceptor for local sessions, or `-a HOST:PORT` for remote
//! ones), sends `start`/the filename, stamps the epoch once it has spawned
//! the command, and drives the rest of the exchange.

use std::collections::BTreeSet;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::os::unix::process::CommandExt;
use std::path::{Path, PathBuf};
use std::process::{Child, Command, Stdio};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use crate::archiver::SourceArchiver;
use crate::carm;
use crate::config::SessionConfig;
use crate::cpu;
use crate::error::{AdaptystError, Result};
use crate::ingest::{self, ControlSessionOutcome};
use crate::probe::{self, EventKind, LaunchedProbe, PipeDup, ProbeSpec};
use crate::subclient::{RecordParser, SampleParser, ThreadTreeParser};
use crate::transport::{dial_tcp, Acceptor, Connection, PipeAcceptor, TcpAcceptor};

const CONTROL_ACCEPT_TIMEOUT: Duration = Duration::from_secs(30);
const DATA_ACCEPT_TIMEOUT: Duration = Duration::from_secs(60);
const FILE_TIMEOUT_SECONDS: u64 = 60;
const DEFAULT_DATA_BUF_SIZE: usize = 64 * 1024;

pub struct SessionOutcome {
    pub exit_code: i32,
    pub result_dir: Option<PathBuf>,
}

/// Runs one session to completion. Never returns `Err` for a failure that
/// happened after session state was created — those are folded into
/// `SessionOutcome.exit_code` instead, so the temp directory handling in
/// `main.rs` can decide whether to keep `working_dir` (§3 "Lifecycle").
pub fn run(
    config: &SessionConfig,
    working_dir: &Path,
    result_dir_name: &str,
    archiver: Option<&dyn SourceArchiver>,
) -> SessionOutcome {
    match run_inner(config, working_dir, result_dir_name, archiver) {
        Ok(outcome) => outcome,
        Err(e) => {
            log::error!("session failed: {e}");
            SessionOutcome {
                exit_code: e.exit_code(),
                result_dir: None,
            }
        }
    }
}

fn run_inner(
    config: &SessionConfig,
    working_dir: &Path,
    result_dir_name: &str,
    archiver: Option<&dyn SourceArchiver>,
) -> Result<SessionOutcome> {
    // Step 1: validate.
    let hw_threads = cpu::hardware_thread_count();
    config.validate(hw_threads)?;

    // Step 2: tool paths. `perf_path` was already verified while loading the
    // tool config (§6); the roofline-only paths are verified here, since
    // they are only required when `--roofline` is actually set.
    if config.roofline.is_some() {
        if let Some(carm_tool_path) = &config.carm_tool_path {
            crate::config::verify_regular_file(carm_tool_path)?;
        }
        if let Some(roofline_benchmark_path) = &config.roofline_benchmark_path {
            crate::config::verify_regular_file(roofline_benchmark_path)?;
        }
    }

    // Step 3: CPU partition, pin the controller thread to the profiler set.
    let partition = cpu::partition_for_post_process(hw_threads, config.post_process)?;
    cpu::pin_current_thread(partition.profiler_set())?;

    // Step 4: probe list.
    let probe_specs = build_probe_specs(config)?;

    let result = match config.remote_address {
        Some(addr) => run_remote(config, &partition, &probe_specs, working_dir, result_dir_name, addr),
        None => run_local(config, &partition, &probe_specs, working_dir, result_dir_name, archiver),
    }?;

    // Step 10: clean temp dir only on a fully clean run.
    if result.exit_code == 0 {
        if let Some(result_dir) = &result.result_dir {
            if let Some(parent) = result_dir.parent() {
                let _ = std::fs::remove_dir_all(parent);
            }
        }
    }
    Ok(result)
}

fn build_probe_specs(config: &SessionConfig) -> Result<Vec<ProbeSpec>> {
    let mut kinds = vec![
        EventKind::ThreadTree,
        EventKind::OnOffCpu {
            freq: config.freq,
            off_cpu_freq: config.off_cpu_freq,
            off_cpu_buffer: config.off_cpu_buffer,
        },
    ];
    for event in &config.extra_events {
        kinds.push(EventKind::Named {
            event_name: event.event_name.clone(),
            period: event.period,
            title: event.title.clone(),
        });
    }
    if let Some(period) = config.roofline {
        let vendor = carm::detect_vendor()?;
        kinds.extend(carm::carm_bundle(vendor, period as u64));
    }

    Ok(kinds
        .into_iter()
        .map(|event_kind| ProbeSpec {
            event_kind,
            mode: config.mode,
            filter: config.filter.clone(),
            filter_mark: config.filter_mark,
            buffer_size: config.buffer,
        })
        .collect())
}

fn sample_result_key(spec: &ProbeSpec) -> String {
    match &spec.event_kind {
        EventKind::ThreadTree => unreachable!("thread-tree probe has no sample result key"),
        EventKind::OnOffCpu { .. } => "sample_main".to_string(),
        EventKind::Named { title, .. } => format!("sample_{title}"),
    }
}

fn make_parser(spec: &ProbeSpec) -> Box<dyn RecordParser> {
    match &spec.event_kind {
        EventKind::ThreadTree => Box::new(ThreadTreeParser::new()),
        _ => Box::new(SampleParser::new(sample_result_key(spec))),
    }
}

/// Runs the peer protocol plus probe/command orchestration shared by both
/// local and remote sessions, once `control` is connected and (for local
/// sessions only) each probe's pipe dup descriptors are known.
#[allow(clippy::too_many_arguments)]
fn drive_session(
    control: &mut dyn Connection,
    config: &SessionConfig,
    partition: &cpu::CpuPartition,
    probe_specs: &[ProbeSpec],
    pipe_dups: &[Option<PipeDup>],
    working_dir: &Path,
    result_dir_name: &str,
) -> Result<(i32, PathBuf)> {
    control.write_line(&format!("start {} {}", probe_specs.len(), result_dir_name))?;

    let filename = config
        .command
        .first()
        .map(|s| s.to_string_lossy().into_owned())
        .unwrap_or_default();
    control.write_line(&filename)?;

    let dial_line = control
        .read_line()?
        .ok_or_else(|| AdaptystError::Connection("control closed before dial instructions".into()))?;
    let mut dial_parts = dial_line.split_whitespace();
    let dial_type = dial_parts
        .next()
        .ok_or_else(|| AdaptystError::Protocol(format!("malformed dial-instructions frame '{dial_line}'")))?
        .to_string();
    let instructions: Vec<String> = dial_parts.map(str::to_string).collect();
    if instructions.len() != probe_specs.len() {
        return Err(AdaptystError::Protocol(format!(
            "server advertised {} dial instructions for {} probes",
            instructions.len(),
            probe_specs.len()
        )));
    }

    let mut launched: Vec<LaunchedProbe> = Vec::with_capacity(probe_specs.len());
    for (i, spec) in probe_specs.iter().enumerate() {
        let pipe_dup = if dial_type == "pipe" { pipe_dups[i] } else { None };
        let spawn_result = probe::spawn(
            &config.perf_path,
            spec,
            &dial_type,
            &instructions[i],
            pipe_dup,
            partition.profiler_set(),
        );

        // The probe now has its own `dup2`'d copies of the pipe ends (or
        // never will, if spawning failed before exec). Either way the
        // controller process's own copies must be closed here: this
        // process runs the ingest server on another thread, so without
        // this the parent would keep the data pipe's write end open for
        // the rest of the session, and the subclient's EOF-driven read
        // loop (§4.2) would never see the probe's exit.
        if let Some(dup) = pipe_dup {
            unsafe {
                libc::close(dup.child_write);
                libc::close(dup.child_read);
            }
        }

        match spawn_result {
            Ok(probe) => launched.push(probe),
            Err(e) => {
                for probe in &launched {
                    probe.terminate();
                }
                return Err(e);
            }
        }
    }

    let ready_line = control.read_line()?.ok_or_else(|| {
        AdaptystError::Connection("control closed before start_profile".into())
    })?;
    if ready_line != "start_profile" {
        return Err(AdaptystError::Protocol(format!(
            "expected 'start_profile', got '{ready_line}'"
        )));
    }

    std::thread::sleep(Duration::from_secs(config.warmup_seconds as u64));

    let mut command_child = spawn_command(config, partition.command_set())?;

    let epoch = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_nanos() as u64;
    control.write_line(&epoch.to_string())?;

    let ack = control
        .read_line()?
        .ok_or_else(|| AdaptystError::Connection("control closed before tstamp_ack".into()))?;
    if ack != "tstamp_ack" {
        return Err(AdaptystError::Protocol(format!(
            "expected 'tstamp_ack', got '{ack}'"
        )));
    }

    let command_status = command_child
        .wait()
        .map_err(|e| AdaptystError::Connection(format!("waiting for profiled command: {e}")))?;
    let command_exit_code = command_status.code().unwrap_or(-1);

    let any_probe_failed = std::thread::scope(|scope| {
        let handles: Vec<_> = launched
            .into_iter()
            .map(|probe| scope.spawn(move || probe.wait()))
            .collect();
        let mut failed = false;
        for handle in handles {
            if let Err(e) = handle.join().expect("probe wait thread panicked") {
                log::warn!("probe failed: {e}");
                failed = true;
            }
        }
        failed
    });

    if config.file_upload_active() {
        let out_files_line = control
            .read_line()?
            .ok_or_else(|| AdaptystError::Connection("control closed before out_files".into()))?;
        if !out_files_line.starts_with("out_files") {
            return Err(AdaptystError::Protocol(format!(
                "expected 'out_files ...', got '{out_files_line}'"
            )));
        }
        // No externally-supplied source-path/benchmark-artifact list is
        // wired up yet (§1: production of that list is out of scope), so
        // the peer has nothing to upload this session.
        control.write_line("<STOP>")?;
        let fin = control
            .read_line()?
            .ok_or_else(|| AdaptystError::Connection("control closed before finished".into()))?;
        if fin != "finished" {
            return Err(AdaptystError::Protocol(format!(
                "expected 'finished', got '{fin}'"
            )));
        }
    } else {
        let fin = control.read_line()?.ok_or_else(|| {
            AdaptystError::Connection("control closed before profiling_finished".into())
        })?;
        if fin != "profiling_finished" {
            return Err(AdaptystError::Protocol(format!(
                "expected 'profiling_finished', got '{fin}'"
            )));
        }
    }

    let exit_code = if any_probe_failed { 2 } else { command_exit_code };
    Ok((exit_code, working_dir.join(result_dir_name)))
}

fn run_local(
    config: &SessionConfig,
    partition: &cpu::CpuPartition,
    probe_specs: &[ProbeSpec],
    working_dir: &Path,
    result_dir_name: &str,
    archiver: Option<&dyn SourceArchiver>,
) -> Result<SessionOutcome> {
    let loopback = IpAddr::V4(Ipv4Addr::LOCALHOST);
    let control_acceptor = TcpAcceptor::bind(loopback, 0, true)?;
    let control_addr = SocketAddr::new(loopback, control_acceptor.port());

    let mut data_acceptors: Vec<Box<dyn Acceptor>> = Vec::with_capacity(probe_specs.len());
    let mut pipe_dups: Vec<Option<PipeDup>> = Vec::with_capacity(probe_specs.len());
    for i in 0..probe_specs.len() {
        let target_read = 20 + (i as i32) * 2;
        let target_write = 21 + (i as i32) * 2;
        let acceptor = PipeAcceptor::new(target_read, target_write)?;
        let (child_write, child_read) = acceptor.child_facing_fds();
        pipe_dups.push(Some(PipeDup {
            child_write,
            child_read,
            target_write,
            target_read,
        }));
        data_acceptors.push(Box::new(acceptor));
    }

    let file_acceptor: Option<Box<dyn Acceptor>> = if config.file_upload_active() {
        Some(Box::new(TcpAcceptor::bind(loopback, 0, true)?))
    } else {
        None
    };

    let parsers: Vec<Box<dyn RecordParser>> = probe_specs.iter().map(make_parser).collect();

    std::thread::scope(|scope| -> Result<SessionOutcome> {
        let file_acceptor_ref = file_acceptor.as_deref();
        let ingest_handle = scope.spawn(move || -> Result<ControlSessionOutcome> {
            let control_conn = control_acceptor.accept(DEFAULT_DATA_BUF_SIZE, Some(CONTROL_ACCEPT_TIMEOUT))?;
            ingest::run_control_session(
                control_conn,
                working_dir,
                &data_acceptors,
                parsers,
                DEFAULT_DATA_BUF_SIZE,
                Some(DATA_ACCEPT_TIMEOUT),
                file_acceptor_ref,
                FILE_TIMEOUT_SECONDS,
                archiver,
            )
        });

        let mut control = dial_tcp(control_addr)?;
        let drive_result = drive_session(
            control.as_mut(),
            config,
            partition,
            probe_specs,
            &pipe_dups,
            working_dir,
            result_dir_name,
        );

        let ingest_outcome = ingest_handle.join().expect("ingest thread panicked");

        let (exit_code, result_dir) = drive_result?;
        let outcome = ingest_outcome?;
        let exit_code = if !outcome.subclient_errors.is_empty() {
            for e in &outcome.subclient_errors {
                log::warn!("subclient failed: {e}");
            }
            2
        } else {
            exit_code
        };

        Ok(SessionOutcome {
            exit_code,
            result_dir: Some(result_dir),
        })
    })
}

fn run_remote(
    config: &SessionConfig,
    partition: &cpu::CpuPartition,
    probe_specs: &[ProbeSpec],
    working_dir: &Path,
    result_dir_name: &str,
    addr: SocketAddr,
) -> Result<SessionOutcome> {
    let mut control = dial_tcp(addr)?;
    let pipe_dups = vec![None; probe_specs.len()];
    let (exit_code, result_dir) = drive_session(
        control.as_mut(),
        config,
        partition,
        probe_specs,
        &pipe_dups,
        working_dir,
        result_dir_name,
    )?;
    Ok(SessionOutcome {
        exit_code,
        result_dir: Some(result_dir),
    })
}

fn spawn_command(config: &SessionConfig, cpus: &BTreeSet<usize>) -> Result<Child> {
    let (name, args) = config
        .command
        .split_first()
        .ok_or_else(|| AdaptystError::User("no command given to profile".into()))?;

    let mut command = Command::new(name);
    command
        .args(args)
        .stdin(Stdio::inherit())
        .stdout(Stdio::inherit())
        .stderr(Stdio::inherit());

    let cpu_ids: Vec<usize> = cpus.iter().copied().collect();
    unsafe {
        command.pre_exec(move || {
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

    command
        .spawn()
        .map_err(|e| AdaptystError::Tool {
            tool: name.to_string_lossy().into_owned(),
            code: e.raw_os_error().unwrap_or(-1),
        })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{CaptureMode, SourceDestination};
    use crate::filter::FilterSpec;
    use std::ffi::OsString;

    fn base_config() -> SessionConfig {
        SessionConfig {
            freq: 10,
            buffer: 1,
            off_cpu_freq: -1,
            off_cpu_buffer: 0,
            post_process: 1,
            mode: CaptureMode::User,
            warmup_seconds: 1,
            extra_events: vec![],
            filter: FilterSpec::None,
            filter_mark: false,
            remote_address: None,
            server_buffer: None,
            codes_dst: SourceDestination::BundleHere,
            roofline: None,
            quiet: false,
            command: vec![OsString::from("/bin/true")],
            perf_path: PathBuf::from("/opt/perf"),
            carm_tool_path: None,
            roofline_benchmark_path: None,
        }
    }

    #[test]
    fn build_probe_specs_always_has_tree_and_main() {
        let config = base_config();
        let specs = build_probe_specs(&config).unwrap();
        assert_eq!(specs.len(), 2);
        assert!(matches!(specs[0].event_kind, EventKind::ThreadTree));
        assert!(matches!(specs[1].event_kind, EventKind::OnOffCpu { .. }));
    }

    #[test]
    fn build_probe_specs_appends_extra_events() {
        let mut config = base_config();
        config.extra_events.push(crate::config::ExtraEvent {
            event_name: "cycles".to_string(),
            period: 1000,
            title: "CYCLES".to_string(),
        });
        let specs = build_probe_specs(&config).unwrap();
        assert_eq!(specs.len(), 3);
        assert_eq!(sample_result_key(&specs[2]), "sample_CYCLES");
    }

    #[test]
    fn sample_result_key_uses_main_for_on_off_cpu() {
        let config = base_config();
        let specs = build_probe_specs(&config).unwrap();
        assert_eq!(sample_result_key(&specs[1]), "sample_main");
    }
}
