//! `SessionConfig` (§3), the tool-path config file (§6), and validation
//! (§4.5 step 1, §7 UserError/EnvError).

use std::collections::BTreeMap;
use std::env;
use std::ffi::OsString;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};

use crate::cpu::max_post_process_threads;
use crate::error::{AdaptystError, Result};
use crate::filter::FilterSpec;

pub const CARM_TITLE_PREFIX: &str = "CARM_";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CaptureMode {
    Kernel,
    User,
    Both,
}

impl Default for CaptureMode {
    fn default() -> Self {
        CaptureMode::User
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExtraEvent {
    pub event_name: String,
    pub period: u64,
    pub title: String,
}

impl ExtraEvent {
    pub fn parse(spec: &str, injected_by_roofline: bool) -> Result<Self> {
        let mut parts = spec.splitn(3, ',');
        let event_name = parts
            .next()
            .filter(|s| !s.is_empty())
            .ok_or_else(|| AdaptystError::User(format!("malformed --event '{spec}'")))?
            .to_string();
        let period: u64 = parts
            .next()
            .ok_or_else(|| AdaptystError::User(format!("malformed --event '{spec}'")))?
            .parse()
            .map_err(|_| AdaptystError::User(format!("--event period must be >= 1 in '{spec}'")))?;
        if period < 1 {
            return Err(AdaptystError::User(format!(
                "--event period must be >= 1 in '{spec}'"
            )));
        }
        let title = parts
            .next()
            .filter(|s| !s.is_empty())
            .ok_or_else(|| AdaptystError::User(format!("malformed --event '{spec}'")))?
            .to_string();
        if !injected_by_roofline && title.starts_with(CARM_TITLE_PREFIX) {
            return Err(AdaptystError::User(format!(
                "event title '{title}' uses the reserved '{CARM_TITLE_PREFIX}' prefix"
            )));
        }
        Ok(ExtraEvent {
            event_name,
            period,
            title,
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SourceDestination {
    BundleHere,
    SendToServer,
    WriteToFile(PathBuf),
    WriteToFd(i32),
}

impl SourceDestination {
    pub fn parse(spec: &str) -> Result<Self> {
        if spec == "srv" {
            return Ok(SourceDestination::SendToServer);
        }
        if let Some(path) = spec.strip_prefix("file:") {
            if path.is_empty() {
                return Err(AdaptystError::User("--codes file: requires a path".into()));
            }
            return Ok(SourceDestination::WriteToFile(PathBuf::from(path)));
        }
        if let Some(fd) = spec.strip_prefix("fd:") {
            let fd: i32 = fd
                .parse()
                .map_err(|_| AdaptystError::User(format!("--codes fd: must be numeric in '{spec}'")))?;
            return Ok(SourceDestination::WriteToFd(fd));
        }
        Err(AdaptystError::User(format!(
            "unrecognized --codes destination '{spec}'"
        )))
    }
}

#[derive(Debug, Clone)]
pub struct SessionConfig {
    pub freq: u32,
    pub buffer: u32,
    pub off_cpu_freq: i64,
    pub off_cpu_buffer: u32,
    pub post_process: u32,
    pub mode: CaptureMode,
    pub warmup_seconds: u32,
    pub extra_events: Vec<ExtraEvent>,
    pub filter: FilterSpec,
    pub filter_mark: bool,
    pub remote_address: Option<SocketAddr>,
    pub server_buffer: Option<u32>,
    pub codes_dst: SourceDestination,
    pub roofline: Option<u32>,
    pub quiet: bool,
    pub command: Vec<OsString>,
    pub perf_path: PathBuf,
    pub carm_tool_path: Option<PathBuf>,
    pub roofline_benchmark_path: Option<PathBuf>,
}

impl SessionConfig {
    /// §4.5 step 1: reject incompatible combinations before any session
    /// state is created.
    pub fn validate(&self, hw_threads: usize) -> Result<()> {
        if self.command.is_empty() {
            return Err(AdaptystError::User("no command given to profile".into()));
        }
        if self.freq < 1 {
            return Err(AdaptystError::User("--freq must be >= 1".into()));
        }
        if self.buffer < 1 {
            return Err(AdaptystError::User("--buffer must be >= 1".into()));
        }
        if self.off_cpu_freq < -1 {
            return Err(AdaptystError::User("--off-cpu-freq must be >= -1".into()));
        }
        if self.warmup_seconds < 1 {
            return Err(AdaptystError::User("--warmup must be >= 1".into()));
        }
        let max_post_process = max_post_process_threads(hw_threads);
        if self.post_process > max_post_process {
            return Err(AdaptystError::User(format!(
                "--post-process must be <= {max_post_process} on this machine"
            )));
        }
        if matches!(self.codes_dst, SourceDestination::SendToServer) && self.remote_address.is_none()
        {
            return Err(AdaptystError::User(
                "--codes srv requires --address".into(),
            ));
        }
        if self.server_buffer.is_some() && self.remote_address.is_some() {
            return Err(AdaptystError::User(
                "--server-buffer is mutually exclusive with --address".into(),
            ));
        }
        if self.filter_mark && matches!(self.filter, FilterSpec::None) {
            return Err(AdaptystError::User("--mark requires --filter".into()));
        }
        if let FilterSpec::Script(_) = &self.filter {
            // `python:<path>` forbids stdin, enforced at CLI-parse time where
            // the raw `-` token is still visible; nothing further to check
            // here.
        }
        if let Some(roofline_period) = self.roofline {
            if roofline_period < 1 {
                return Err(AdaptystError::User("--roofline must be >= 1".into()));
            }
            if !cfg!(target_arch = "x86_64") && !cfg!(target_arch = "x86") {
                return Err(AdaptystError::Env(
                    "--roofline is only supported on x86".into(),
                ));
            }
        }
        Ok(())
    }

    /// Whether this session needs to run the local file-upload phase at all.
    /// §9 open question: "file upload is active iff the session needs to
    /// return artifacts to the initiator, which for remote sessions with
    /// `-c srv` is NONE (the peer already has them)."
    pub fn file_upload_active(&self) -> bool {
        if self.remote_address.is_some() {
            !matches!(self.codes_dst, SourceDestination::SendToServer)
        } else {
            true
        }
    }
}

/// Tool paths read from the two-file config (§6).
#[derive(Debug, Clone)]
pub struct ToolConfig {
    pub perf_path: PathBuf,
    pub carm_tool_path: Option<PathBuf>,
    pub roofline_benchmark_path: Option<PathBuf>,
}

/// Parses `key=value` lines; `#` starts a comment, blank lines are ignored.
/// A syntax error (a non-blank, non-comment line without `=`) is fatal.
pub fn parse_kv(text: &str) -> Result<BTreeMap<String, String>> {
    let mut map = BTreeMap::new();
    for (lineno, raw_line) in text.lines().enumerate() {
        let line = raw_line.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }
        let (key, value) = line.split_once('=').ok_or_else(|| {
            AdaptystError::User(format!(
                "config syntax error at line {}: expected 'key=value'",
                lineno + 1
            ))
        })?;
        map.insert(key.trim().to_string(), value.trim().to_string());
    }
    Ok(map)
}

/// Renders a key=value map back to text form, for the round-trip law
/// ("parse + render is the identity modulo comments and whitespace").
pub fn render_kv(map: &BTreeMap<String, String>) -> String {
    let mut out = String::new();
    for (key, value) in map {
        out.push_str(key);
        out.push('=');
        out.push_str(value);
        out.push('\n');
    }
    out
}

fn read_optional(path: &Path) -> Result<BTreeMap<String, String>> {
    match std::fs::read_to_string(path) {
        Ok(text) => parse_kv(&text),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            log::debug!("config file {} not found, continuing with defaults", path.display());
            Ok(BTreeMap::new())
        }
        Err(e) => Err(AdaptystError::Env(format!(
            "could not read config file {}: {e}",
            path.display()
        ))),
    }
}

/// Loads the system config then the local config (later overrides earlier),
/// honoring the `ADAPTYST_CONFIG`/`ADAPTYST_LOCAL_CONFIG`/`ADAPTYST_SCRIPT_DIR`
/// path overrides (§6).
pub fn load_tool_config(default_system: &Path, default_local: &Path) -> Result<ToolConfig> {
    let system_path = env::var_os("ADAPTYST_CONFIG")
        .map(PathBuf::from)
        .unwrap_or_else(|| default_system.to_path_buf());
    let local_path = env::var_os("ADAPTYST_LOCAL_CONFIG")
        .map(PathBuf::from)
        .unwrap_or_else(|| default_local.to_path_buf());

    let mut merged = read_optional(&system_path)?;
    merged.extend(read_optional(&local_path)?);

    let perf_path = merged
        .get("perf_path")
        .ok_or_else(|| AdaptystError::Env("config key 'perf_path' is required".into()))?;
    let perf_path = PathBuf::from(perf_path);
    let script_dir = env::var_os("ADAPTYST_SCRIPT_DIR").map(PathBuf::from);
    verify_tool_directory(&perf_path, script_dir.as_deref())?;

    Ok(ToolConfig {
        perf_path,
        carm_tool_path: merged.get("carm_tool_path").map(PathBuf::from),
        roofline_benchmark_path: merged.get("roofline_benchmark_path").map(PathBuf::from),
    })
}

/// Relative location of the patched `perf`'s Python trace-event script
/// package under its scripts directory (§6: "`libexec/perf-core/scripts/
/// python/.../Trace`").
const TRACE_SCRIPT_RELATIVE_PATH: &str = "Perf-Trace-Util/lib/Perf/Trace";

/// §4.5 step 2: verify existence and file-type, resolving symlinks, for both
/// `bin/perf` and the `Trace` script package. `script_dir_override`, when
/// set via `ADAPTYST_SCRIPT_DIR`, replaces the default
/// `libexec/perf-core/scripts/python` location derived from `perf_path`
/// (§6 lists `ADAPTYST_SCRIPT_DIR` as its own override, independent of
/// `perf_path`, for deployments that install perf's Python scripts
/// somewhere other than under the `perf_path` tree).
fn verify_tool_directory(path: &Path, script_dir_override: Option<&Path>) -> Result<()> {
    let metadata = std::fs::metadata(path).map_err(|e| {
        AdaptystError::Env(format!("perf_path {} is not accessible: {e}", path.display()))
    })?;
    if !metadata.is_dir() {
        return Err(AdaptystError::Env(format!(
            "perf_path {} must be a directory",
            path.display()
        )));
    }
    let bin_perf = path.join("bin").join("perf");
    verify_regular_file(&bin_perf)?;

    let scripts_python_dir = match script_dir_override {
        Some(dir) => dir.to_path_buf(),
        None => path.join("libexec").join("perf-core").join("scripts").join("python"),
    };
    let trace_dir = scripts_python_dir.join(TRACE_SCRIPT_RELATIVE_PATH);
    let trace_metadata = std::fs::metadata(&trace_dir).map_err(|e| {
        AdaptystError::Env(format!("Trace script dir {} is not accessible: {e}", trace_dir.display()))
    })?;
    if !trace_metadata.is_dir() {
        return Err(AdaptystError::Env(format!(
            "Trace script dir {} must be a directory",
            trace_dir.display()
        )));
    }
    Ok(())
}

pub fn verify_regular_file(path: &Path) -> Result<()> {
    let metadata = std::fs::metadata(path).map_err(|e| {
        AdaptystError::Env(format!("{} is not accessible: {e}", path.display()))
    })?;
    if !metadata.is_file() {
        return Err(AdaptystError::Env(format!(
            "{} must be a regular file",
            path.display()
        )));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn kv_parse_ignores_comments_and_blanks() {
        let text = "# header\n\nperf_path=/opt/perf\n  carm_tool_path = /opt/carm \n";
        let map = parse_kv(text).unwrap();
        assert_eq!(map.get("perf_path").unwrap(), "/opt/perf");
        assert_eq!(map.get("carm_tool_path").unwrap(), "/opt/carm");
    }

    #[test]
    fn kv_parse_rejects_syntax_error() {
        assert!(parse_kv("not_a_kv_line\n").is_err());
    }

    #[test]
    fn kv_round_trip_identity() {
        let text = "a=1\nb=2\n";
        let map = parse_kv(text).unwrap();
        let rendered = render_kv(&map);
        let reparsed = parse_kv(&rendered).unwrap();
        assert_eq!(map, reparsed);
    }

    fn make_fake_perf_tree(root: &Path, trace_dir: &Path) {
        std::fs::create_dir_all(root.join("bin")).unwrap();
        std::fs::write(root.join("bin").join("perf"), b"").unwrap();
        std::fs::create_dir_all(trace_dir).unwrap();
    }

    #[test]
    fn verify_tool_directory_accepts_perf_path_derived_trace_dir() {
        let root = tempfile::tempdir().unwrap();
        let trace_dir = root
            .path()
            .join("libexec")
            .join("perf-core")
            .join("scripts")
            .join("python")
            .join(TRACE_SCRIPT_RELATIVE_PATH);
        make_fake_perf_tree(root.path(), &trace_dir);
        assert!(verify_tool_directory(root.path(), None).is_ok());
    }

    #[test]
    fn verify_tool_directory_rejects_missing_trace_dir() {
        let root = tempfile::tempdir().unwrap();
        std::fs::create_dir_all(root.path().join("bin")).unwrap();
        std::fs::write(root.path().join("bin").join("perf"), b"").unwrap();
        assert!(verify_tool_directory(root.path(), None).is_err());
    }

    #[test]
    fn verify_tool_directory_honors_script_dir_override() {
        let root = tempfile::tempdir().unwrap();
        std::fs::create_dir_all(root.path().join("bin")).unwrap();
        std::fs::write(root.path().join("bin").join("perf"), b"").unwrap();

        let scripts = tempfile::tempdir().unwrap();
        let trace_dir = scripts.path().join(TRACE_SCRIPT_RELATIVE_PATH);
        std::fs::create_dir_all(&trace_dir).unwrap();

        assert!(verify_tool_directory(root.path(), None).is_err());
        assert!(verify_tool_directory(root.path(), Some(scripts.path())).is_ok());
    }

    #[test]
    fn extra_event_rejects_reserved_prefix() {
        assert!(ExtraEvent::parse("cycles,1000,CARM_FOO", false).is_err());
        assert!(ExtraEvent::parse("cycles,1000,CARM_FOO", true).is_ok());
    }

    #[test]
    fn extra_event_requires_positive_period() {
        assert!(ExtraEvent::parse("cycles,0,TITLE", false).is_err());
    }

    #[test]
    fn codes_srv_without_address_is_rejected() {
        let cfg = sample_config();
        assert!(cfg.validate(8).is_ok());

        let mut cfg2 = sample_config();
        cfg2.codes_dst = SourceDestination::SendToServer;
        cfg2.remote_address = None;
        assert!(cfg2.validate(8).is_err());
    }

    fn sample_config() -> SessionConfig {
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
            command: vec!["/bin/true".into()],
            perf_path: PathBuf::from("/opt/perf"),
            carm_tool_path: None,
            roofline_benchmark_path: None,
        }
    }
}
