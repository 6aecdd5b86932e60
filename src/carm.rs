//! CARM roofline event bundle (§4.5 step 4, GLOSSARY "CARM"): on x86 with
//! `--roofline` set, synthesizes a vendor-specific set of extra events
//! instead of requiring the user to spell them out with `-e`.

use crate::config::CARM_TITLE_PREFIX;
use crate::error::{AdaptystError, Result};
use crate::probe::EventKind;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Vendor {
    Intel,
    Amd,
}

/// Reads `/proc/cpuinfo`'s `vendor_id` line. Anything other than Intel/AMD
/// is an `EnvError` (§4.5 step 4: "fail on any other vendor").
pub fn detect_vendor() -> Result<Vendor> {
    let cpuinfo = std::fs::read_to_string("/proc/cpuinfo")
        .map_err(|e| AdaptystError::Env(format!("could not read /proc/cpuinfo: {e}")))?;
    vendor_from_cpuinfo(&cpuinfo)
}

fn vendor_from_cpuinfo(cpuinfo: &str) -> Result<Vendor> {
    let vendor_line = cpuinfo
        .lines()
        .find_map(|line| line.strip_prefix("vendor_id"))
        .and_then(|rest| rest.split_once(':'))
        .map(|(_, v)| v.trim())
        .ok_or_else(|| AdaptystError::Env("/proc/cpuinfo has no 'vendor_id' field".into()))?;

    match vendor_line {
        "GenuineIntel" => Ok(Vendor::Intel),
        "AuthenticAMD" => Ok(Vendor::Amd),
        other => Err(AdaptystError::Env(format!(
            "unsupported CPU vendor for --roofline: '{other}'"
        ))),
    }
}

/// The CARM bundle for `vendor`, each event period set to `period` (the
/// `--roofline` argument). Titles carry the reserved `CARM_` prefix, which
/// is only legal when injected here (§3 `SessionConfig`'s reserved-prefix
/// rule).
pub fn carm_bundle(vendor: Vendor, period: u64) -> Vec<EventKind> {
    let event_names: &[(&str, &str)] = match vendor {
        Vendor::Intel => &[
            ("cycles", "CARM_CYCLES"),
            ("mem_inst_retired.all_loads", "CARM_LOADS"),
            ("mem_inst_retired.all_stores", "CARM_STORES"),
            ("fp_arith_inst_retired.scalar", "CARM_FLOPS_SCALAR"),
            ("fp_arith_inst_retired.vector", "CARM_FLOPS_VECTOR"),
        ],
        Vendor::Amd => &[
            ("cycles", "CARM_CYCLES"),
            ("ls_dispatch.ld", "CARM_LOADS"),
            ("ls_dispatch.store", "CARM_STORES"),
            ("fp_ret_sse_avx_ops.all", "CARM_FLOPS_VECTOR"),
        ],
    };

    event_names
        .iter()
        .map(|(event_name, title)| {
            debug_assert!(title.starts_with(CARM_TITLE_PREFIX));
            EventKind::Named {
                event_name: event_name.to_string(),
                period,
                title: title.to_string(),
            }
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn detects_intel_vendor() {
        let cpuinfo = "processor\t: 0\nvendor_id\t: GenuineIntel\nmodel name\t: x\n";
        assert_eq!(vendor_from_cpuinfo(cpuinfo).unwrap(), Vendor::Intel);
    }

    #[test]
    fn detects_amd_vendor() {
        let cpuinfo = "vendor_id\t: AuthenticAMD\n";
        assert_eq!(vendor_from_cpuinfo(cpuinfo).unwrap(), Vendor::Amd);
    }

    #[test]
    fn rejects_unknown_vendor() {
        let cpuinfo = "vendor_id\t: SomeOtherVendor\n";
        assert!(matches!(vendor_from_cpuinfo(cpuinfo), Err(AdaptystError::Env(_))));
    }

    #[test]
    fn carm_bundle_titles_use_reserved_prefix() {
        let bundle = carm_bundle(Vendor::Intel, 1_000_000);
        assert!(bundle.iter().all(|e| match e {
            EventKind::Named { title, .. } => title.starts_with(CARM_TITLE_PREFIX),
            _ => false,
        }));
    }
}
