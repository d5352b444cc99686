//! Patch operations.
//!
//! Each operation is self-contained: it builds its patterns, scans, and
//! only writes once its anchors are fully resolved, so a failed operation
//! leaves the target untouched rather than half-patched.

mod asserts;
mod quality;
mod saves;

pub use asserts::*;
pub use quality::*;
pub use saves::*;

use strum::{Display, EnumString};
use tracing::{info, warn};

use crate::memory::ModuleMap;
use crate::pattern::Scanner;

/// One independently selectable patch pass.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Display, EnumString)]
#[strum(serialize_all = "snake_case")]
pub enum Operation {
    DisableAsserts,
    PatchQualityTable,
    DisableWorkerSaves,
}

impl Operation {
    /// Operations applied when the caller requests none explicitly.
    pub const DEFAULT_SET: &'static [Operation] = &[Operation::DisableAsserts];
}

/// Parse a comma-separated operation list. Unknown names are logged and
/// skipped, duplicates collapse, and an empty outcome falls back to
/// [`Operation::DEFAULT_SET`].
pub fn parse_operations(list: &str) -> Vec<Operation> {
    let mut operations = Vec::new();
    for name in list.split(',') {
        let name = name.trim();
        if name.is_empty() {
            continue;
        }
        match name.parse::<Operation>() {
            Ok(op) if !operations.contains(&op) => operations.push(op),
            Ok(_) => {}
            Err(_) => warn!("Ignoring unknown operation {name:?}"),
        }
    }
    if operations.is_empty() {
        Operation::DEFAULT_SET.to_vec()
    } else {
        operations
    }
}

/// Run every requested operation against the mapped module.
///
/// Failures are isolated: one operation missing its anchor never stops
/// the others. Returns true only when every requested operation applied.
pub fn run(map: &ModuleMap, operations: &[Operation], quality: &QualityParams) -> bool {
    let scanner = Scanner::new(map);
    let mut all_ok = true;
    for op in operations {
        let outcome = match op {
            Operation::DisableAsserts => disable_asserts(&scanner),
            Operation::PatchQualityTable => patch_quality_table(&scanner, quality),
            Operation::DisableWorkerSaves => disable_worker_saves(&scanner),
        };
        match outcome {
            Ok(()) => info!("{op} applied"),
            Err(e) => {
                warn!("{op} failed: {e}");
                all_ok = false;
            }
        }
    }
    all_ok
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn operation_names_round_trip() {
        for op in [
            Operation::DisableAsserts,
            Operation::PatchQualityTable,
            Operation::DisableWorkerSaves,
        ] {
            assert_eq!(op.to_string().parse::<Operation>().unwrap(), op);
        }
        assert_eq!(
            "disable_asserts".parse::<Operation>().unwrap(),
            Operation::DisableAsserts
        );
    }

    #[test]
    fn parse_skips_unknown_names_and_duplicates() {
        let ops = parse_operations("disable_asserts, bogus,,patch_quality_table,disable_asserts");
        assert_eq!(
            ops,
            vec![Operation::DisableAsserts, Operation::PatchQualityTable]
        );
    }

    #[test]
    fn parse_falls_back_to_the_default_set() {
        assert_eq!(parse_operations(""), Operation::DEFAULT_SET.to_vec());
        assert_eq!(parse_operations(" , bogus "), Operation::DEFAULT_SET.to_vec());
    }

    #[test]
    fn run_reports_failure_when_an_anchor_is_missing() {
        // SAFETY: an empty map is never dereferenced.
        let map = unsafe { ModuleMap::from_ranges(Vec::new(), Vec::new(), Vec::new()) };
        let ok = run(
            &map,
            &[Operation::DisableAsserts],
            &QualityParams::default(),
        );
        assert!(!ok);
    }
}
