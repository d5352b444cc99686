//! # bakefix-agent
//!
//! Load-time patch agent for `bake.exe`, built as a DLL and injected by
//! the launcher before the tool's entry point runs. On attach it reads
//! the requested operations and settings from the environment, applies
//! the patches against the host image, then signals the launcher's ready
//! event.

use std::path::{Path, PathBuf};

use tracing::{error, info, warn};

use bakefix_core::ops::{self, Operation};
use bakefix_core::{KeyValueFile, ModuleMap, QualityParams};

#[cfg(target_os = "windows")]
mod entry;
#[cfg(target_os = "windows")]
mod platform;

/// Comma-separated list of operations to run.
pub const OPS_VAR: &str = "BAKEFIX_OPS";
/// Path of the settings file.
pub const CONFIG_VAR: &str = "BAKEFIX_CONFIG";
/// Name of the launcher's ready event.
pub const READY_EVENT_VAR: &str = "BAKEFIX_READY_EVENT";
/// Settings file looked up next to the tool when no path is given.
pub const DEFAULT_CONFIG: &str = "bakefix.conf";

/// Operations requested through the environment, or the default set.
pub fn requested_operations() -> Vec<Operation> {
    match std::env::var(OPS_VAR) {
        Ok(list) => ops::parse_operations(&list),
        Err(_) => Operation::DEFAULT_SET.to_vec(),
    }
}

/// Settings path from the environment, or the default next to the tool.
pub fn config_path() -> PathBuf {
    std::env::var_os(CONFIG_VAR)
        .map(PathBuf::from)
        .unwrap_or_else(|| PathBuf::from(DEFAULT_CONFIG))
}

/// Quality overrides for the table patch. The settings file is read and
/// persisted only when the operation is actually requested.
pub fn quality_params(config_path: &Path, operations: &[Operation]) -> QualityParams {
    if !operations.contains(&Operation::PatchQualityTable) {
        return QualityParams::default();
    }
    let mut config = KeyValueFile::load(config_path);
    let params = QualityParams::from_config(&mut config);
    if let Err(e) = config.save() {
        warn!(
            "Could not persist settings to {}: {e}",
            config.path().display()
        );
    }
    params
}

/// One full patch pass against the current process image. Returns true
/// only when every requested operation applied.
pub fn run_attach_pass() -> bool {
    let operations = requested_operations();
    let names: Vec<String> = operations.iter().map(|op| op.to_string()).collect();
    info!("Requested operations: {}", names.join(", "));

    let quality = quality_params(&config_path(), &operations);
    let map = match ModuleMap::current_module() {
        Ok(map) => map,
        Err(e) => {
            error!("Could not map the host module: {e}");
            return false;
        }
    };
    ops::run(&map, &operations, &quality)
}
