//! Merge algorithm (§4.3 "Merge algorithm"): folds every subclient's
//! per-probe JSON contribution into one `MergedOutput`, then rebases every
//! off-CPU region timestamp against the session epoch.
//!
//! Subclient results are folded in subclient-creation order (§5
//! "Ordering": "results are independent and merged in subclient-creation
//! order to make duplicate-chain-id detection deterministic").

use std::collections::{BTreeMap, HashSet};

use serde_json::{json, Map, Value};

use crate::error::{AdaptystError, Result};

/// One session's fully merged result: the shared metadata document plus one
/// entry per observed thread for its own `<pid_tid>.json` file (§3
/// `MergedOutput`).
#[derive(Debug, Clone, Default)]
pub struct MergedOutput {
    pub metadata: Value,
    pub per_thread: BTreeMap<String, Map<String, Value>>,
}

/// Folds `results` (one JSON object per subclient, in creation order) into a
/// `MergedOutput`, rebasing off-CPU timestamps against `profile_start_tstamp`.
pub fn merge(results: Vec<Value>, profile_start_tstamp: u64) -> Result<MergedOutput> {
    let mut thread_tree: Vec<Value> = Vec::new();
    let mut known_tids: HashSet<u64> = HashSet::new();
    let mut callchains: Map<String, Value> = Map::new();
    let mut sampled_times: Map<String, Value> = Map::new();
    let mut offcpu_regions: Map<String, Value> = Map::new();
    let mut per_thread: BTreeMap<String, Map<String, Value>> = BTreeMap::new();

    for result in results {
        let obj = result
            .as_object()
            .ok_or_else(|| AdaptystError::Protocol("subclient result must be a JSON object".into()))?;
        for (key, value) in obj {
            if key == "syscall_meta" {
                merge_thread_tree(value, &mut thread_tree, &mut known_tids)?;
            } else if key == "syscall" {
                merge_callchains(value, &mut callchains)?;
            } else if key.starts_with("sample") {
                merge_samples(
                    key,
                    value,
                    &mut thread_tree,
                    &mut known_tids,
                    &mut sampled_times,
                    &mut offcpu_regions,
                    &mut per_thread,
                )?;
            }
        }
    }

    rebase_offcpu(&mut offcpu_regions, profile_start_tstamp);

    let metadata = json!({
        "thread_tree": thread_tree,
        "callchains": callchains,
        "offcpu_regions": offcpu_regions,
        "sampled_times": sampled_times,
    });

    Ok(MergedOutput {
        metadata,
        per_thread,
    })
}

fn tid_from_pid_tid(pid_tid: &str) -> Result<u64> {
    pid_tid
        .rsplit('_')
        .next()
        .and_then(|s| s.parse().ok())
        .ok_or_else(|| AdaptystError::Protocol(format!("malformed pid_tid key '{pid_tid}'")))
}

/// Renders an underscore-joined `pid_tid` dictionary key as the slash-joined
/// `"pid/tid"` form spec.md's `tag` field uses for display (§3, §4.3) — the
/// two separators are not interchangeable, only the key format is
/// underscore-joined.
fn pid_tid_to_tag(pid_tid: &str) -> String {
    match pid_tid.rsplit_once('_') {
        Some((pid, tid)) => format!("{pid}/{tid}"),
        None => pid_tid.to_string(),
    }
}

fn merge_thread_tree(
    value: &Value,
    thread_tree: &mut Vec<Value>,
    known_tids: &mut HashSet<u64>,
) -> Result<()> {
    let tids = value
        .get("tids")
        .and_then(Value::as_array)
        .ok_or_else(|| AdaptystError::Protocol("syscall_meta missing 'tids'".into()))?;
    let meta = value
        .get("meta")
        .and_then(Value::as_object)
        .ok_or_else(|| AdaptystError::Protocol("syscall_meta missing 'meta'".into()))?;

    for tid_value in tids {
        let tid = tid_value
            .as_u64()
            .ok_or_else(|| AdaptystError::Protocol("tid must be numeric".into()))?;
        let tid_meta = meta
            .get(&tid.to_string())
            .ok_or_else(|| AdaptystError::Protocol(format!("syscall_meta missing entry for tid {tid}")))?;
        if !known_tids.insert(tid) {
            return Err(AdaptystError::Protocol(format!(
                "duplicate tid {tid} across thread-tree records"
            )));
        }

        let mut record = Map::new();
        record.insert("identifier".to_string(), Value::from(tid));
        if let Some(fields) = tid_meta.as_object() {
            for (k, v) in fields {
                record.insert(k.clone(), v.clone());
            }
        }
        thread_tree.push(Value::Object(record));
    }
    Ok(())
}

fn merge_callchains(value: &Value, callchains: &mut Map<String, Value>) -> Result<()> {
    let obj = value
        .as_object()
        .ok_or_else(|| AdaptystError::Protocol("syscall value must be an object".into()))?;
    for (chain_id, frames) in obj {
        // §9 open question, resolved: a chain-id collision is an error
        // rather than the original's silent last-writer-wins overwrite.
        if callchains.contains_key(chain_id) {
            return Err(AdaptystError::Protocol(format!(
                "duplicate chain id '{chain_id}' during merge"
            )));
        }
        callchains.insert(chain_id.clone(), frames.clone());
    }
    Ok(())
}

#[allow(clippy::too_many_arguments)]
fn merge_samples(
    key: &str,
    value: &Value,
    thread_tree: &mut Vec<Value>,
    known_tids: &mut HashSet<u64>,
    sampled_times: &mut Map<String, Value>,
    offcpu_regions: &mut Map<String, Value>,
    per_thread: &mut BTreeMap<String, Map<String, Value>>,
) -> Result<()> {
    let obj = value
        .as_object()
        .ok_or_else(|| AdaptystError::Protocol(format!("{key} value must be an object")))?;

    for (pid_tid, fields) in obj {
        let tid = tid_from_pid_tid(pid_tid)?;
        if known_tids.insert(tid) {
            // No thread-tree record supplied this tid: synthesize the
            // placeholder §8 invariant requires.
            thread_tree.push(json!({
                "identifier": tid,
                "parent": Value::Null,
                "tag": ["?", pid_tid_to_tag(pid_tid), -1, -1],
            }));
        }

        let fields = fields
            .as_object()
            .ok_or_else(|| AdaptystError::Protocol(format!("{key}.{pid_tid} must be an object")))?;
        for (field, field_value) in fields {
            match field.as_str() {
                "sampled_time" => {
                    sampled_times.insert(pid_tid.clone(), field_value.clone());
                }
                "offcpu_regions" => {
                    let entry = offcpu_regions
                        .entry(pid_tid.clone())
                        .or_insert_with(|| Value::Array(Vec::new()));
                    if let (Value::Array(existing), Some(incoming)) =
                        (entry, field_value.as_array())
                    {
                        existing.extend(incoming.iter().cloned());
                    }
                }
                "first_time" => {
                    // Discarded per §4.3.
                }
                other => {
                    per_thread
                        .entry(pid_tid.clone())
                        .or_default()
                        .insert(other.to_string(), field_value.clone());
                }
            }
        }
    }
    Ok(())
}

/// `ts := ts - profile_start_tstamp`, unsigned subtraction per §4.3. The
/// protocol contract guarantees the epoch is <= every observed timestamp;
/// `saturating_sub` only guards against a misbehaving peer rather than
/// panicking the merge.
fn rebase_offcpu(offcpu_regions: &mut Map<String, Value>, epoch: u64) {
    for regions in offcpu_regions.values_mut() {
        let Value::Array(regions) = regions else {
            continue;
        };
        for region in regions {
            let Value::Array(pair) = region else { continue };
            if let Some(ts) = pair.first().and_then(Value::as_u64) {
                pair[0] = Value::from(ts.saturating_sub(epoch));
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn merges_thread_tree_and_samples() {
        let tree = json!({
            "syscall_meta": {
                "tids": [10],
                "meta": {"10": {"parent": Value::Null, "tag": ["prog", "1000/10", 0, 100]}},
            },
            "syscall": {"c1": ["main", "work"]},
        });
        let samples = json!({
            "sample_cycles": {
                "1000_10": {"sampled_time": 5, "first_time": 1, "cycles": 99},
            },
        });
        let merged = merge(vec![tree, samples], 0).unwrap();
        assert_eq!(merged.metadata["thread_tree"].as_array().unwrap().len(), 1);
        assert_eq!(merged.metadata["sampled_times"]["1000_10"], json!(5));
        assert_eq!(merged.per_thread["1000_10"]["cycles"], json!(99));
        assert!(merged.per_thread["1000_10"].get("first_time").is_none());
        assert!(merged.per_thread["1000_10"].get("sampled_time").is_none());
    }

    #[test]
    fn synthesizes_placeholder_for_unknown_tid() {
        let samples = json!({
            "sample_cycles": {"42_7": {"sampled_time": 1}},
        });
        let merged = merge(vec![samples], 0).unwrap();
        let tree = merged.metadata["thread_tree"].as_array().unwrap();
        assert_eq!(tree.len(), 1);
        assert_eq!(tree[0]["parent"], Value::Null);
        assert_eq!(tree[0]["tag"], json!(["?", "42/7", -1, -1]));
    }

    #[test]
    fn rejects_duplicate_chain_id_across_subclients() {
        let a = json!({"syscall": {"c1": ["x"]}});
        let b = json!({"syscall": {"c1": ["y"]}});
        assert!(matches!(
            merge(vec![a, b], 0),
            Err(AdaptystError::Protocol(_))
        ));
    }

    #[test]
    fn rebases_offcpu_timestamps_against_epoch() {
        let samples = json!({
            "sample_offcpu": {
                "1000_10": {"offcpu_regions": [[1_700_000_000_000_000_500u64, 25]]},
            },
        });
        let merged = merge(vec![samples], 1_700_000_000_000_000_000).unwrap();
        assert_eq!(
            merged.metadata["offcpu_regions"]["1000_10"],
            json!([[500, 25]])
        );
    }
}
