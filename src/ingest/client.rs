//! Ingest client control protocol (§4.3): the server side of the state
//! machine `AwaitStart -> AwaitStartProfile -> AwaitTimestamp -> Collecting
//! -> AwaitFiles -> Done`, with `Failed` reachable from any state by simply
//! returning an `Err` after sending the matching `error_*` frame.
//!
//! Implemented as one straight-line function rather than an explicit state
//! struct: the table in §4.3 has no branching besides the per-file loop in
//! `AwaitFiles`, so a state enum would only add ceremony around what is, in
//! practice, a fixed sequence of reads and writes on one connection.

use std::collections::BTreeSet;
use std::fs::File;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::{Condvar, Mutex};

use crate::archiver::SourceArchiver;
use crate::error::{AdaptystError, Result};
use crate::ingest::merge::{self, MergedOutput};
use crate::subclient::{self, RecordParser};
use crate::transport::{Acceptor, Connection};

/// §9 open question: unspecified by context, treated as a tunable >= 4 KiB.
const FILE_BUFFER_SIZE: usize = 64 * 1024;
const CODE_PATHS_MANIFEST: &str = "code_paths.lst";

/// Result of running one session's control connection to completion.
/// `subclient_errors` is non-empty exactly when one or more probes failed
/// (§4.2: this does not abort the session — the merge still runs over
/// whichever subclients succeeded).
pub struct ControlSessionOutcome {
    pub result_dir: PathBuf,
    pub merged: MergedOutput,
    pub subclient_errors: Vec<AdaptystError>,
    pub archived_source: bool,
}

/// Drives one session over an already-accepted control connection.
///
/// `data_acceptors`/`parsers` must be the same length and in subclient
/// creation order (§5 "Ordering"). `file_acceptor` is `None` exactly when
/// the caller already determined `file_upload_active() == false` (§9 open
/// question: remote sessions with `-c srv` skip the phase entirely).
#[allow(clippy::too_many_arguments)]
pub fn run_control_session(
    mut control: Box<dyn Connection>,
    working_dir: &Path,
    data_acceptors: &[Box<dyn Acceptor>],
    parsers: Vec<Box<dyn RecordParser>>,
    buf_size: usize,
    accept_timeout: Option<Duration>,
    file_acceptor: Option<&dyn Acceptor>,
    file_timeout_seconds: u64,
    archiver: Option<&dyn SourceArchiver>,
) -> Result<ControlSessionOutcome> {
    assert_eq!(
        data_acceptors.len(),
        parsers.len(),
        "one RecordParser per data acceptor is required"
    );

    let (result_dir, processed_dir, out_dir) =
        await_start(control.as_mut(), working_dir, data_acceptors.len())?;

    // AwaitStartProfile: the profiled filename is recorded for forensic
    // purposes only; nothing downstream interprets it.
    let _profiled_filename = control.read_line()?.ok_or_else(|| {
        AdaptystError::Connection("control connection closed before profiled filename".into())
    })?;

    let type_tag = data_acceptors.first().map(|a| a.type_tag()).unwrap_or("pipe");
    let instructions: Vec<String> = data_acceptors.iter().map(|a| a.dial_instructions()).collect();
    control.write_line(&format!("{type_tag} {}", instructions.join(" ")))?;

    let (subclient_results, profile_start_tstamp) = run_subclients_and_barrier(
        control.as_mut(),
        data_acceptors,
        parsers,
        buf_size,
        accept_timeout,
    )?;

    let mut oks = Vec::with_capacity(subclient_results.len());
    let mut errs = Vec::new();
    for result in subclient_results {
        match result {
            Ok(value) => oks.push(value),
            Err(e) => errs.push(e),
        }
    }

    let merged = merge::merge(oks, profile_start_tstamp)?;
    write_merged_output(&processed_dir, &merged)?;

    let archived_source = match file_acceptor {
        Some(file_acceptor) => run_file_upload_phase(
            control.as_mut(),
            file_acceptor,
            &processed_dir,
            &out_dir,
            file_timeout_seconds,
            archiver,
        )?,
        None => {
            control.write_line("profiling_finished")?;
            false
        }
    };

    Ok(ControlSessionOutcome {
        result_dir,
        merged,
        subclient_errors: errs,
        archived_source,
    })
}

fn protocol_fail(control: &mut dyn Connection, error_frame: &str, message: String) -> AdaptystError {
    let _ = control.write_line(error_frame);
    let _ = control.close();
    AdaptystError::Protocol(message)
}

/// AwaitStart: parses `start <N> <result_dir>`, creates the result
/// directory layout, and returns `(result_dir, processed_dir, out_dir)`.
fn await_start(
    control: &mut dyn Connection,
    working_dir: &Path,
    expected_subclients: usize,
) -> Result<(PathBuf, PathBuf, PathBuf)> {
    let line = control
        .read_line()?
        .ok_or_else(|| AdaptystError::Connection("control connection closed before 'start'".into()))?;

    let mut parts = line.splitn(3, ' ');
    if parts.next() != Some("start") {
        return Err(protocol_fail(
            control,
            "error_wrong_command",
            format!("expected 'start <N> <result_dir>', got '{line}'"),
        ));
    }
    let n: usize = match parts.next().and_then(|s| s.parse().ok()) {
        Some(n) if n >= 1 => n,
        _ => {
            return Err(protocol_fail(
                control,
                "error_wrong_command",
                format!("'start' frame has an invalid subclient count: '{line}'"),
            ))
        }
    };
    if n != expected_subclients {
        return Err(protocol_fail(
            control,
            "error_wrong_command",
            format!("'start' requested {n} subclients, session has {expected_subclients}"),
        ));
    }
    let result_dir_name = match parts.next().filter(|s| !s.is_empty()) {
        Some(name) => name,
        None => {
            return Err(protocol_fail(
                control,
                "error_wrong_command",
                format!("'start' frame is missing a result dir: '{line}'"),
            ))
        }
    };

    let result_dir = working_dir.join(result_dir_name);
    let processed_dir = result_dir.join("processed");
    let out_dir = result_dir.join("out");
    if let Err(e) = std::fs::create_dir_all(&processed_dir).and_then(|_| std::fs::create_dir_all(&out_dir)) {
        return Err(protocol_fail(
            control,
            "error_result_dir",
            format!("could not create result dir {}: {e}", result_dir.display()),
        ));
    }

    Ok((result_dir, processed_dir, out_dir))
}

type SubclientResults = Vec<Result<serde_json::Value>>;

/// Spawns one subclient per data acceptor, waits on the accepted-count
/// barrier, drives the `start_profile`/timestamp/`tstamp_ack` exchange, then
/// joins every subclient thread (§4.2, §4.3 Collecting, §5 "Ordering").
fn run_subclients_and_barrier(
    control: &mut dyn Connection,
    data_acceptors: &[Box<dyn Acceptor>],
    parsers: Vec<Box<dyn RecordParser>>,
    buf_size: usize,
    accept_timeout: Option<Duration>,
) -> Result<(SubclientResults, u64)> {
    let barrier = Arc::new((Mutex::new(0usize), Condvar::new()));
    let expected = data_acceptors.len();

    std::thread::scope(|scope| {
        let handles: Vec<_> = data_acceptors
            .iter()
            .zip(parsers)
            .map(|(acceptor, parser)| {
                let barrier = Arc::clone(&barrier);
                let notify: subclient::ReadinessSignal = Arc::new(move || {
                    let (lock, cvar) = &*barrier;
                    let mut count = lock.lock();
                    *count += 1;
                    cvar.notify_all();
                });
                scope.spawn(move || {
                    subclient::run(acceptor.as_ref(), buf_size, accept_timeout, parser, notify)
                })
            })
            .collect();

        {
            let (lock, cvar) = &*barrier;
            let mut count = lock.lock();
            while *count < expected {
                cvar.wait(&mut count);
            }
        }
        control.write_line("start_profile")?;

        let tstamp_line = control.read_line()?.ok_or_else(|| {
            AdaptystError::Connection("control connection closed before timestamp".into())
        })?;
        let profile_start_tstamp: u64 = match tstamp_line.trim().parse() {
            Ok(ts) => ts,
            Err(_) => {
                return Err(protocol_fail(
                    control,
                    "error_tstamp",
                    format!("expected a u64 timestamp, got '{tstamp_line}'"),
                ))
            }
        };
        control.write_line("tstamp_ack")?;

        let results = handles
            .into_iter()
            .map(|h| h.join().expect("subclient thread panicked"))
            .collect();

        Ok((results, profile_start_tstamp))
    })
}

/// Writes `metadata.json` and every `<pid_tid>.json` in parallel (§4.3:
/// "the merge must have completed before writes start").
fn write_merged_output(processed_dir: &Path, merged: &MergedOutput) -> Result<()> {
    std::thread::scope(|scope| -> Result<()> {
        let metadata_handle = scope.spawn(|| {
            write_json_line(&processed_dir.join("metadata.json"), &merged.metadata)
        });

        let thread_handles: Vec<_> = merged
            .per_thread
            .iter()
            .map(|(pid_tid, fields)| {
                let path = processed_dir.join(format!("{pid_tid}.json"));
                let value = serde_json::Value::Object(fields.clone());
                scope.spawn(move || write_json_line(&path, &value))
            })
            .collect();

        metadata_handle.join().expect("metadata writer thread panicked")?;
        for handle in thread_handles {
            handle.join().expect("per-thread writer thread panicked")?;
        }
        Ok(())
    })
}

fn write_json_line(path: &Path, value: &serde_json::Value) -> Result<()> {
    let mut file = File::create(path)
        .map_err(|e| AdaptystError::Connection(format!("create {}: {e}", path.display())))?;
    serde_json::to_writer(&mut file, value)
        .map_err(|e| AdaptystError::Connection(format!("write {}: {e}", path.display())))?;
    file.write_all(b"\n")
        .map_err(|e| AdaptystError::Connection(format!("write {}: {e}", path.display())))
}

/// AwaitFiles (§4.3 "File-upload subphase"). Returns whether a
/// `code_paths.lst` upload triggered `SourceArchiver::archive`.
fn run_file_upload_phase(
    control: &mut dyn Connection,
    file_acceptor: &dyn Acceptor,
    processed_dir: &Path,
    out_dir: &Path,
    file_timeout_seconds: u64,
    archiver: Option<&dyn SourceArchiver>,
) -> Result<bool> {
    control.write_line(&format!(
        "out_files {} {}",
        file_acceptor.type_tag(),
        file_acceptor.dial_instructions()
    ))?;

    let mut archived_source = false;
    let timeout = Duration::from_secs(file_timeout_seconds.max(1));

    loop {
        let line = control.read_line()?.ok_or_else(|| {
            AdaptystError::Connection("control connection closed during file upload".into())
        })?;
        if line == "<STOP>" {
            control.write_line("finished")?;
            break;
        }

        let Some((selector, name)) = parse_upload_line(&line) else {
            // §8 scenario 5: a malformed upload name does not abort the
            // session, the loop simply continues.
            control.write_line("error_wrong_file_format")?;
            continue;
        };

        let outcome = if name == CODE_PATHS_MANIFEST {
            receive_code_paths_manifest(file_acceptor, timeout, processed_dir, archiver)
        } else {
            let dest_dir = if selector == 'o' { out_dir } else { processed_dir };
            receive_plain_file(file_acceptor, timeout, &dest_dir.join(name))
        };

        match outcome {
            Ok(did_archive) => {
                archived_source |= did_archive;
                control.write_line("out_file_ok")?;
            }
            Err(AdaptystError::Timeout(_)) => {
                control.write_line("error_out_file_timeout")?;
            }
            Err(_) => {
                control.write_line("error_out_file")?;
            }
        }
    }

    Ok(archived_source)
}

/// `o <name>` / `p <name>`: first byte selects destination, second MUST be
/// a space, remainder is a basename (slashes rejected).
fn parse_upload_line(line: &str) -> Option<(char, &str)> {
    let mut chars = line.char_indices();
    let (_, selector) = chars.next()?;
    if selector != 'o' && selector != 'p' {
        return None;
    }
    let (second_byte, second_char) = chars.next()?;
    if second_char != ' ' {
        return None;
    }
    let name = &line[second_byte + 1..];
    if name.is_empty() || name.contains('/') || name.contains('\\') {
        return None;
    }
    Some((selector, name))
}

fn receive_plain_file(acceptor: &dyn Acceptor, timeout: Duration, dest: &Path) -> Result<bool> {
    let mut conn = acceptor.accept(FILE_BUFFER_SIZE, Some(timeout))?;
    let mut file = File::create(dest)
        .map_err(|e| AdaptystError::Connection(format!("create {}: {e}", dest.display())))?;
    let mut chunk = vec![0u8; FILE_BUFFER_SIZE];
    loop {
        let n = conn.read_bytes(&mut chunk, Some(timeout))?;
        if n == 0 {
            break;
        }
        file.write_all(&chunk[..n])
            .map_err(|e| AdaptystError::Connection(format!("write {}: {e}", dest.display())))?;
    }
    Ok(false)
}

/// Special-cased per §4.3: read as newline-framed paths instead of raw
/// bytes, canonicalize each, and hand the resulting set to the
/// `SourceArchiver`.
fn receive_code_paths_manifest(
    acceptor: &dyn Acceptor,
    timeout: Duration,
    processed_dir: &Path,
    archiver: Option<&dyn SourceArchiver>,
) -> Result<bool> {
    let mut conn = acceptor.accept(FILE_BUFFER_SIZE, Some(timeout))?;
    let mut paths = BTreeSet::new();
    loop {
        match conn.read_line_timeout(timeout.as_secs().max(1))? {
            None => break,
            Some(line) => {
                let trimmed = line.trim();
                if trimmed.is_empty() {
                    continue;
                }
                let canonical = std::fs::canonicalize(trimmed)
                    .map_err(|e| AdaptystError::Connection(format!("canonicalize {trimmed}: {e}")))?;
                paths.insert(canonical);
            }
        }
    }

    if let Some(archiver) = archiver {
        archiver.archive(&paths, &processed_dir.join("src.zip"))?;
        Ok(true)
    } else {
        Ok(false)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_valid_upload_lines() {
        assert_eq!(parse_upload_line("o metadata.json"), Some(('o', "metadata.json")));
        assert_eq!(parse_upload_line("p src.zip"), Some(('p', "src.zip")));
    }

    #[test]
    fn rejects_unknown_selector() {
        assert_eq!(parse_upload_line("x foo.txt"), None);
    }

    #[test]
    fn rejects_path_traversal() {
        assert_eq!(parse_upload_line("o ../escape.txt"), None);
    }

    #[test]
    fn rejects_missing_separator() {
        assert_eq!(parse_upload_line("ofoo.txt"), None);
    }

    /// Drives `run_control_session` end to end over real loopback TCP: a
    /// fake peer thread plays the session controller's side of §4.3 while
    /// this function plays the ingest server, with one `SampleParser`
    /// subclient and no file-upload phase.
    #[test]
    fn drives_one_subclient_session_to_completion_over_tcp() {
        use std::net::{IpAddr, Ipv4Addr, SocketAddr};
        use crate::transport::{dial_tcp, TcpAcceptor};

        let working_dir = tempfile::tempdir().unwrap();

        let control_acceptor =
            TcpAcceptor::bind(IpAddr::V4(Ipv4Addr::LOCALHOST), 0, true).unwrap();
        let control_addr = SocketAddr::new(IpAddr::V4(Ipv4Addr::LOCALHOST), control_acceptor.port());

        let data_acceptor: Box<dyn Acceptor> =
            Box::new(TcpAcceptor::bind(IpAddr::V4(Ipv4Addr::LOCALHOST), 0, true).unwrap());

        let peer = std::thread::spawn(move || -> Result<()> {
            let mut control = dial_tcp(control_addr)?;
            control.write_line("start 1 result")?;
            control.write_line("profiled-command")?;

            let instructions = control
                .read_line()?
                .ok_or_else(|| AdaptystError::Connection("missing dial instructions".into()))?;
            let mut parts = instructions.splitn(2, ' ');
            assert_eq!(parts.next(), Some("tcp"));
            let host_port = parts.next().expect("missing tcp host_port");
            let (host, port) = host_port.rsplit_once('_').expect("malformed host_port");
            let addr = SocketAddr::new(
                host.parse::<IpAddr>().expect("invalid host"),
                port.parse::<u16>().expect("invalid port"),
            );

            let mut data = dial_tcp(addr)?;
            data.write_line("SAMPLE 100 200 cycles=42")?;
            data.write_line("<STOP>")?;

            assert_eq!(control.read_line()?.as_deref(), Some("start_profile"));
            control.write_line("1000")?;
            assert_eq!(control.read_line()?.as_deref(), Some("tstamp_ack"));
            assert_eq!(control.read_line()?.as_deref(), Some("profiling_finished"));
            Ok(())
        });

        let control_conn = control_acceptor
            .accept(4096, Some(Duration::from_secs(5)))
            .unwrap();

        let outcome = run_control_session(
            control_conn,
            working_dir.path(),
            &[data_acceptor],
            vec![Box::new(subclient::SampleParser::new("sample_main"))],
            4096,
            Some(Duration::from_secs(5)),
            None,
            5,
            None,
        )
        .unwrap();

        peer.join().unwrap().unwrap();

        assert!(outcome.subclient_errors.is_empty());
        assert!(!outcome.archived_source);
        assert_eq!(outcome.result_dir, working_dir.path().join("result"));

        let per_thread = &outcome.merged.per_thread["100_200"];
        assert_eq!(per_thread["cycles"], 42);

        let metadata_path = outcome.result_dir.join("processed").join("metadata.json");
        assert!(metadata_path.exists());
        let thread_path = outcome.result_dir.join("processed").join("100_200.json");
        assert!(thread_path.exists());
    }
}
