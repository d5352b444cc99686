//! # bakefix-core
//!
//! In-memory patching for the legacy `bake.exe` lightmap baker.
//!
//! This crate provides:
//! - Classification of the loaded image into code and data ranges
//! - A byte-pattern language mixing literals with wildcards, numeric
//!   ranges, call targets, and string cross-references
//! - A scanner that locates patterns inside the classified ranges
//! - Write primitives that lift page protection around each patch and
//!   keep the instruction cache coherent
//! - The load-time patch operations themselves, driven by a flag set
//!   and a small settings file

pub mod config;
pub mod error;
pub mod memory;
pub mod ops;
pub mod pattern;

pub use config::KeyValueFile;
pub use error::{Error, Result};
pub use memory::{MemoryRange, ModuleMap, patch};
pub use ops::{Operation, QualityParams, QualityPreset, REFERENCE_PRESET, parse_operations, run};
pub use pattern::{Match, PatternElement, Scanner, call_target, push_string_ref};
