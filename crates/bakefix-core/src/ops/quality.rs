//! Raise the quality caps baked into the preset table.
//!
//! The tool ships a read-only table of named quality presets and the
//! batch path always bakes with the "production" row. The interesting
//! knobs, sample and photon counts, were sized for 2004-era hardware.
//! This pass finds the row by its stock values and rewrites it with
//! counts from the settings file, leaving the rest of the row and the
//! table layout untouched.

use tracing::info;

use crate::config::KeyValueFile;
use crate::error::{Error, Result};
use crate::memory::patch;
use crate::pattern::{POINTER_SIZE, PatternElement, Scanner};

/// Preset row the batch bake path uses.
const PRESET_NAME: &str = "production";

pub const SAMPLE_COUNT_KEY: &str = "sample_count";
pub const PHOTON_COUNT_KEY: &str = "photon_count";

/// Value fields of one preset row, after the leading name pointer. Field
/// order and widths mirror the executable's table layout.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct QualityPreset {
    pub sample_count: i32,
    pub photon_count: i32,
    pub bounce_limit: i32,
    pub aa_sample_count: i32,
    pub gather_distance: f32,
    pub filter_width: f32,
}

impl QualityPreset {
    /// Encoded length of the value fields.
    pub const ENCODED_LEN: usize = 24;

    pub fn to_le_bytes(&self) -> [u8; Self::ENCODED_LEN] {
        let mut bytes = [0u8; Self::ENCODED_LEN];
        bytes[0..4].copy_from_slice(&self.sample_count.to_le_bytes());
        bytes[4..8].copy_from_slice(&self.photon_count.to_le_bytes());
        bytes[8..12].copy_from_slice(&self.bounce_limit.to_le_bytes());
        bytes[12..16].copy_from_slice(&self.aa_sample_count.to_le_bytes());
        bytes[16..20].copy_from_slice(&self.gather_distance.to_le_bytes());
        bytes[20..24].copy_from_slice(&self.filter_width.to_le_bytes());
        bytes
    }
}

/// Stock production values, matched byte-for-byte to find the row and
/// copied for every field the settings file does not override.
pub const REFERENCE_PRESET: QualityPreset = QualityPreset {
    sample_count: 400,
    photon_count: 2_000_000,
    bounce_limit: 6,
    aa_sample_count: 4,
    gather_distance: 0.5,
    filter_width: 1.25,
};

/// The two fields sourced from the settings file.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct QualityParams {
    pub sample_count: i32,
    pub photon_count: i32,
}

impl Default for QualityParams {
    fn default() -> Self {
        Self {
            sample_count: REFERENCE_PRESET.sample_count,
            photon_count: REFERENCE_PRESET.photon_count,
        }
    }
}

impl QualityParams {
    /// Read both overrides, writing defaults back for absent or unusable
    /// entries.
    pub fn from_config(config: &mut KeyValueFile) -> Self {
        Self {
            sample_count: config.get_i32_or(SAMPLE_COUNT_KEY, REFERENCE_PRESET.sample_count),
            photon_count: config.get_i32_or(PHOTON_COUNT_KEY, REFERENCE_PRESET.photon_count),
        }
    }

    fn apply_to(&self, preset: QualityPreset) -> QualityPreset {
        QualityPreset {
            sample_count: self.sample_count,
            photon_count: self.photon_count,
            ..preset
        }
    }
}

pub fn patch_quality_table(scanner: &Scanner<'_>, params: &QualityParams) -> Result<()> {
    let pattern = [
        PatternElement::string_ref(PRESET_NAME),
        PatternElement::Bytes(REFERENCE_PRESET.to_le_bytes().to_vec()),
    ];
    let row = scanner
        .find_first_in_rdata(&pattern)
        .ok_or(Error::AnchorNotFound("production preset row"))?;

    let patched = params.apply_to(REFERENCE_PRESET);
    // The name pointer stays; only the value fields after it change.
    unsafe { patch::write_bytes(row.addr + POINTER_SIZE, &patched.to_le_bytes())? };
    info!(
        "Production preset now bakes {} samples / {} photons",
        patched.sample_count, patched.photon_count
    );
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::{MemoryRange, ModuleMap};

    const ROW: usize = POINTER_SIZE + QualityPreset::ENCODED_LEN;

    const DRAFT: QualityPreset = QualityPreset {
        sample_count: 64,
        photon_count: 250_000,
        bounce_limit: 2,
        aa_sample_count: 1,
        gather_distance: 1.0,
        filter_width: 1.0,
    };
    const FINAL: QualityPreset = QualityPreset {
        sample_count: 1024,
        photon_count: 4_000_000,
        bounce_limit: 8,
        aa_sample_count: 8,
        gather_distance: 0.25,
        filter_width: 1.5,
    };

    /// Strings followed by a three-row preset table, one flat buffer.
    fn preset_rdata() -> Vec<u8> {
        let table = 23;
        let mut rdata = vec![0u8; table + 3 * ROW];
        let base = rdata.as_ptr() as usize;
        rdata[0..6].copy_from_slice(b"draft\0");
        rdata[6..17].copy_from_slice(b"production\0");
        rdata[17..23].copy_from_slice(b"final\0");
        let names = [base, base + 6, base + 17];
        for (i, preset) in [DRAFT, REFERENCE_PRESET, FINAL].iter().enumerate() {
            let at = table + i * ROW;
            rdata[at..at + POINTER_SIZE].copy_from_slice(&names[i].to_le_bytes());
            rdata[at + POINTER_SIZE..at + ROW].copy_from_slice(&preset.to_le_bytes());
        }
        rdata
    }

    #[test]
    fn encoded_layout_is_stable() {
        let bytes = REFERENCE_PRESET.to_le_bytes();
        assert_eq!(&bytes[0..4], &400i32.to_le_bytes());
        assert_eq!(&bytes[4..8], &2_000_000i32.to_le_bytes());
        assert_eq!(&bytes[8..12], &6i32.to_le_bytes());
        assert_eq!(&bytes[12..16], &4i32.to_le_bytes());
        assert_eq!(&bytes[16..20], &0.5f32.to_le_bytes());
        assert_eq!(&bytes[20..24], &1.25f32.to_le_bytes());
    }

    #[test]
    fn overrides_leave_other_fields_alone() {
        let params = QualityParams {
            sample_count: 1600,
            photon_count: 8_000_000,
        };
        let patched = params.apply_to(REFERENCE_PRESET);
        assert_eq!(patched.sample_count, 1600);
        assert_eq!(patched.photon_count, 8_000_000);
        assert_eq!(patched.bounce_limit, REFERENCE_PRESET.bounce_limit);
        assert_eq!(patched.aa_sample_count, REFERENCE_PRESET.aa_sample_count);
        assert_eq!(patched.gather_distance, REFERENCE_PRESET.gather_distance);
        assert_eq!(patched.filter_width, REFERENCE_PRESET.filter_width);
    }

    #[test]
    fn rewrites_the_production_row_in_place() {
        let rdata = preset_rdata();
        let snapshot = rdata.clone();
        let ranges = vec![MemoryRange::new(rdata.as_ptr() as usize, rdata.len())];
        // SAFETY: the buffer outlives the scan.
        let map = unsafe { ModuleMap::from_ranges(Vec::new(), ranges, Vec::new()) };
        let scanner = Scanner::new(&map);

        let params = QualityParams {
            sample_count: 1600,
            photon_count: 8_000_000,
        };
        patch_quality_table(&scanner, &params).unwrap();

        let production = 23 + ROW;
        let mut expected = snapshot;
        expected[production + POINTER_SIZE..production + ROW]
            .copy_from_slice(&params.apply_to(REFERENCE_PRESET).to_le_bytes());
        assert_eq!(rdata, expected);
    }

    #[test]
    fn missing_row_reports_anchor_failure() {
        // The name string exists but no row carries the stock values.
        let rdata = b"production\0".to_vec();
        let ranges = vec![MemoryRange::new(rdata.as_ptr() as usize, rdata.len())];
        // SAFETY: the buffer outlives the scan.
        let map = unsafe { ModuleMap::from_ranges(Vec::new(), ranges, Vec::new()) };
        let scanner = Scanner::new(&map);

        let err = patch_quality_table(&scanner, &QualityParams::default()).unwrap_err();
        assert!(err.is_anchor_not_found());
    }

    #[test]
    fn from_config_reads_and_writes_back() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("bakefix.conf");
        std::fs::write(&path, "sample_count = 1600\n").unwrap();

        let mut config = KeyValueFile::load(&path);
        let params = QualityParams::from_config(&mut config);
        assert_eq!(params.sample_count, 1600);
        assert_eq!(params.photon_count, REFERENCE_PRESET.photon_count);
        // The absent photon count was written back as its default.
        assert!(config.is_edited());
        assert_eq!(config.get_str(PHOTON_COUNT_KEY), Some("2000000"));
    }
}
