//! Subclient (§4.2): one per probe, runs on its own thread. Reads the
//! probe's line-oriented records through a pluggable `RecordParser`,
//! accumulates them into a JSON-shaped contribution to the merged output,
//! and signals readiness to the owning ingest client once its data
//! connection is accepted.
//!
//! A subclient's record grammar is probe-dependent (on-CPU/off-CPU samples,
//! named hardware events, and the syscall/thread-tree probe each parse their
//! own line shape); what every `RecordParser` implementation shares is that
//! it yields a JSON object whose top-level keys are exactly the ones the
//! merge algorithm understands (`syscall_meta`, `syscall`, or a
//! `sample*`-prefixed key).

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use serde_json::{json, Map, Value};

use crate::error::{AdaptystError, Result};
use crate::transport::{Acceptor, Connection};

/// Callback a subclient invokes once it has accepted its data connection.
/// The ingest client's barrier counts these to unblock `start_profile`
/// (§4.3, §5 "Suspension points").
pub type ReadinessSignal = Arc<dyn Fn() + Send + Sync>;

/// Parses one probe's line-oriented record stream into its contribution to
/// the merged output.
pub trait RecordParser: Send {
    fn parse_line(&mut self, line: &str) -> Result<()>;

    /// Consumes the parser, yielding its accumulated contribution as a JSON
    /// object `ingest::merge` folds into the session-wide `MergedOutput`.
    fn finish(self: Box<Self>) -> Result<Value>;
}

const STOP_TOKEN: &str = "<STOP>";

/// Runs one subclient to completion on the calling thread. The ingest
/// client spawns one of these per probe on its own worker thread (§4.2:
/// "runs concurrently with its siblings on independent threads").
///
/// Completion contract: returns the parser's result on clean EOF or
/// `<STOP>`; propagates `ConnectionError`/`TimeoutError` from the transport
/// and `ProtocolError` from a malformed record. A failed subclient does not
/// touch its siblings — the caller is responsible for collecting every
/// subclient's `Result` before deciding the session's fate (§4.2).
pub fn run(
    acceptor: &dyn Acceptor,
    buf_size: usize,
    accept_timeout: Option<Duration>,
    mut parser: Box<dyn RecordParser>,
    notify: ReadinessSignal,
) -> Result<Value> {
    let mut conn = acceptor.accept(buf_size, accept_timeout)?;
    notify();

    loop {
        match conn.read_line()? {
            None => break,
            Some(line) if line == STOP_TOKEN => break,
            Some(line) => parser.parse_line(&line)?,
        }
    }
    parser.finish()
}

/// `pid_tid` keys are underscore-joined, matching the convention the rest of
/// the protocol uses for composite identifiers (`host_port`, `fd_fd`).
fn pid_tid_key(pid: u64, tid: u64) -> String {
    format!("{pid}_{tid}")
}

/// Thread-tree / syscall probe. Two record shapes:
///
/// - `THREAD <tid> <parent|-> <command_name> <pid> <start_time> <end_time>`
/// - `CHAIN <chain_id> <frame>[|<frame>...]`
///
/// Yields `{"syscall_meta": {...}, "syscall": {...}}`.
#[derive(Default)]
pub struct ThreadTreeParser {
    tids: Vec<u64>,
    meta: BTreeMap<u64, Value>,
    callchains: Map<String, Value>,
}

impl ThreadTreeParser {
    pub fn new() -> Self {
        Self::default()
    }

    fn malformed(line: &str) -> AdaptystError {
        AdaptystError::Protocol(format!("malformed thread-tree record: '{line}'"))
    }
}

impl RecordParser for ThreadTreeParser {
    fn parse_line(&mut self, line: &str) -> Result<()> {
        let mut fields = line.splitn(2, ' ');
        match fields.next() {
            Some("THREAD") => {
                let rest = fields.next().ok_or_else(|| Self::malformed(line))?;
                let mut parts = rest.splitn(5, ' ');
                let tid: u64 = parts
                    .next()
                    .and_then(|s| s.parse().ok())
                    .ok_or_else(|| Self::malformed(line))?;
                let parent = match parts.next().ok_or_else(|| Self::malformed(line))? {
                    "-" => Value::Null,
                    p => Value::from(p.parse::<u64>().map_err(|_| Self::malformed(line))?),
                };
                let command_name = parts.next().ok_or_else(|| Self::malformed(line))?;
                let pid: u64 = parts
                    .next()
                    .and_then(|s| s.parse().ok())
                    .ok_or_else(|| Self::malformed(line))?;
                let remainder = parts.next().ok_or_else(|| Self::malformed(line))?;
                let mut times = remainder.split(' ');
                let start_time: i64 = times
                    .next()
                    .and_then(|s| s.parse().ok())
                    .ok_or_else(|| Self::malformed(line))?;
                let end_time: i64 = times
                    .next()
                    .and_then(|s| s.parse().ok())
                    .ok_or_else(|| Self::malformed(line))?;

                if self.meta.contains_key(&tid) {
                    return Err(AdaptystError::Protocol(format!(
                        "duplicate THREAD record for tid {tid}"
                    )));
                }
                self.tids.push(tid);
                self.meta.insert(
                    tid,
                    json!({
                        "parent": parent,
                        "tag": [command_name, format!("{pid}/{tid}"), start_time, end_time],
                    }),
                );
                Ok(())
            }
            Some("CHAIN") => {
                let rest = fields.next().ok_or_else(|| Self::malformed(line))?;
                let (chain_id, frames) = rest.split_once(' ').ok_or_else(|| Self::malformed(line))?;
                if self.callchains.contains_key(chain_id) {
                    return Err(AdaptystError::Protocol(format!(
                        "duplicate chain id '{chain_id}' from a single subclient"
                    )));
                }
                let frame_list: Vec<Value> = frames
                    .split('|')
                    .map(|f| Value::from(f.to_string()))
                    .collect();
                self.callchains
                    .insert(chain_id.to_string(), Value::Array(frame_list));
                Ok(())
            }
            _ => Err(Self::malformed(line)),
        }
    }

    fn finish(self: Box<Self>) -> Result<Value> {
        let meta: Map<String, Value> = self
            .meta
            .into_iter()
            .map(|(tid, v)| (tid.to_string(), v))
            .collect();
        Ok(json!({
            "syscall_meta": {
                "tids": self.tids,
                "meta": meta,
            },
            "syscall": self.callchains,
        }))
    }
}

/// On-CPU/off-CPU and named hardware-event probes share this grammar:
///
/// - `SAMPLE <pid> <tid> <field>=<value>[,<field>=<value>...]`
/// - `OFFCPU <pid> <tid> <ts> <duration>`
///
/// `sampled_time` and `first_time` are carved-out well-known fields (§9);
/// everything else under `SAMPLE` is preserved verbatim as an event-specific
/// counter. Yields `{"<result_key>": {pid_tid: {...}}}`.
pub struct SampleParser {
    result_key: String,
    entries: BTreeMap<String, Map<String, Value>>,
}

impl SampleParser {
    pub fn new(result_key: impl Into<String>) -> Self {
        SampleParser {
            result_key: result_key.into(),
            entries: BTreeMap::new(),
        }
    }

    fn malformed(line: &str) -> AdaptystError {
        AdaptystError::Protocol(format!("malformed sample record: '{line}'"))
    }

    fn entry(&mut self, pid_tid: String) -> &mut Map<String, Value> {
        self.entries.entry(pid_tid).or_default()
    }
}

impl RecordParser for SampleParser {
    fn parse_line(&mut self, line: &str) -> Result<()> {
        let mut fields = line.splitn(2, ' ');
        match fields.next() {
            Some("SAMPLE") => {
                let rest = fields.next().ok_or_else(|| Self::malformed(line))?;
                let mut parts = rest.splitn(3, ' ');
                let pid: u64 = parts
                    .next()
                    .and_then(|s| s.parse().ok())
                    .ok_or_else(|| Self::malformed(line))?;
                let tid: u64 = parts
                    .next()
                    .and_then(|s| s.parse().ok())
                    .ok_or_else(|| Self::malformed(line))?;
                let field_list = parts.next().ok_or_else(|| Self::malformed(line))?;
                let key = pid_tid_key(pid, tid);
                for field in field_list.split(',') {
                    let (name, value) = field.split_once('=').ok_or_else(|| Self::malformed(line))?;
                    let value: Value = if let Ok(n) = value.parse::<u64>() {
                        Value::from(n)
                    } else {
                        Value::from(value.to_string())
                    };
                    self.entry(key.clone()).insert(name.to_string(), value);
                }
                Ok(())
            }
            Some("OFFCPU") => {
                let rest = fields.next().ok_or_else(|| Self::malformed(line))?;
                let mut parts = rest.splitn(4, ' ');
                let pid: u64 = parts
                    .next()
                    .and_then(|s| s.parse().ok())
                    .ok_or_else(|| Self::malformed(line))?;
                let tid: u64 = parts
                    .next()
                    .and_then(|s| s.parse().ok())
                    .ok_or_else(|| Self::malformed(line))?;
                let ts: u64 = parts
                    .next()
                    .and_then(|s| s.parse().ok())
                    .ok_or_else(|| Self::malformed(line))?;
                let duration: u64 = parts
                    .next()
                    .and_then(|s| s.parse().ok())
                    .ok_or_else(|| Self::malformed(line))?;
                let key = pid_tid_key(pid, tid);
                let regions = self
                    .entry(key)
                    .entry("offcpu_regions".to_string())
                    .or_insert_with(|| Value::Array(Vec::new()));
                regions
                    .as_array_mut()
                    .expect("offcpu_regions is always an array")
                    .push(json!([ts, duration]));
                Ok(())
            }
            _ => Err(Self::malformed(line)),
        }
    }

    fn finish(self: Box<Self>) -> Result<Value> {
        let entries: Map<String, Value> = self
            .entries
            .into_iter()
            .map(|(k, v)| (k, Value::Object(v)))
            .collect();
        let mut result = Map::new();
        result.insert(self.result_key, Value::Object(entries));
        Ok(Value::Object(result))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn thread_tree_parses_threads_and_chains() {
        let mut parser: Box<dyn RecordParser> = Box::new(ThreadTreeParser::new());
        parser.parse_line("THREAD 10 - myprog 1000 5 100").unwrap();
        parser.parse_line("THREAD 11 10 myprog 1000 6 99").unwrap();
        parser.parse_line("CHAIN c1 main|run|work").unwrap();
        let value = parser.finish().unwrap();
        assert_eq!(value["syscall_meta"]["tids"], json!([10, 11]));
        assert_eq!(value["syscall_meta"]["meta"]["10"]["parent"], Value::Null);
        assert_eq!(
            value["syscall_meta"]["meta"]["10"]["tag"],
            json!(["myprog", "1000/10", 5, 100])
        );
        assert_eq!(value["syscall"]["c1"], json!(["main", "run", "work"]));
    }

    #[test]
    fn thread_tree_rejects_duplicate_chain_id() {
        let mut parser: Box<dyn RecordParser> = Box::new(ThreadTreeParser::new());
        parser.parse_line("CHAIN c1 a|b").unwrap();
        assert!(matches!(
            parser.parse_line("CHAIN c1 c|d"),
            Err(AdaptystError::Protocol(_))
        ));
    }

    #[test]
    fn thread_tree_rejects_malformed_line() {
        let mut parser: Box<dyn RecordParser> = Box::new(ThreadTreeParser::new());
        assert!(matches!(
            parser.parse_line("GARBAGE"),
            Err(AdaptystError::Protocol(_))
        ));
    }

    #[test]
    fn sample_parser_aggregates_fields_and_offcpu() {
        let mut parser: Box<dyn RecordParser> = Box::new(SampleParser::new("sample_cycles"));
        parser
            .parse_line("SAMPLE 1000 10 sampled_time=42,cycles=7")
            .unwrap();
        parser.parse_line("OFFCPU 1000 10 500 25").unwrap();
        let value = parser.finish().unwrap();
        let entry = &value["sample_cycles"]["1000_10"];
        assert_eq!(entry["sampled_time"], json!(42));
        assert_eq!(entry["cycles"], json!(7));
        assert_eq!(entry["offcpu_regions"], json!([[500, 25]]));
    }

    #[test]
    fn sample_parser_rejects_malformed_line() {
        let mut parser: Box<dyn RecordParser> = Box::new(SampleParser::new("sample_cycles"));
        assert!(matches!(
            parser.parse_line("NOPE"),
            Err(AdaptystError::Protocol(_))
        ));
    }
}
