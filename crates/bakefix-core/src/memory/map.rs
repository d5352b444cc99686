//! Module memory classification.
//!
//! The scanner only ever looks at the primary loaded image, split into
//! executable, read-only, and writable ranges. The split is probed once at
//! construction time and never refreshed: the target's section layout does
//! not change during the short patch pass.

use crate::error::Result;

/// Page granularity of the probe walk.
pub const PAGE_SIZE: usize = 0x1000;

/// One contiguous run of same-protection pages.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MemoryRange {
    pub base: usize,
    pub len: usize,
}

impl MemoryRange {
    pub fn new(base: usize, len: usize) -> Self {
        Self { base, len }
    }

    /// First address past the range.
    pub fn end(&self) -> usize {
        self.base + self.len
    }

    pub fn contains(&self, addr: usize) -> bool {
        addr >= self.base && addr < self.end()
    }
}

/// Construction-time snapshot of the primary module's classified ranges.
///
/// Ranges appear in ascending address order, exactly as the probe walk
/// produced them. No mutation after construction.
#[derive(Debug, Clone)]
pub struct ModuleMap {
    code: Vec<MemoryRange>,
    rdata: Vec<MemoryRange>,
    data: Vec<MemoryRange>,
    module_base: usize,
    module_size: usize,
}

impl ModuleMap {
    /// Probe and classify the current process's primary module.
    #[cfg(target_os = "windows")]
    pub fn current_module() -> Result<Self> {
        platform::probe_current_module()
    }

    #[cfg(not(target_os = "windows"))]
    pub fn current_module() -> Result<Self> {
        Err(crate::error::Error::ModuleQueryFailed(
            "module probing is only supported on Windows".to_string(),
        ))
    }

    /// Build a map over caller-supplied ranges.
    ///
    /// # Safety
    ///
    /// Every range must describe memory that stays readable for the
    /// lifetime of the map; the scanner dereferences addresses inside
    /// these ranges without further checks.
    pub unsafe fn from_ranges(
        code: Vec<MemoryRange>,
        rdata: Vec<MemoryRange>,
        data: Vec<MemoryRange>,
    ) -> Self {
        let module_base = code
            .iter()
            .chain(&rdata)
            .chain(&data)
            .map(|range| range.base)
            .min()
            .unwrap_or(0);
        let module_end = code
            .iter()
            .chain(&rdata)
            .chain(&data)
            .map(MemoryRange::end)
            .max()
            .unwrap_or(module_base);
        Self {
            code,
            rdata,
            data,
            module_base,
            module_size: module_end - module_base,
        }
    }

    /// Executable ranges, ascending.
    pub fn code(&self) -> &[MemoryRange] {
        &self.code
    }

    /// Read-only data ranges, ascending.
    pub fn rdata(&self) -> &[MemoryRange] {
        &self.rdata
    }

    /// Writable data ranges, ascending.
    pub fn data(&self) -> &[MemoryRange] {
        &self.data
    }

    pub fn module_base(&self) -> usize {
        self.module_base
    }

    pub fn module_size(&self) -> usize {
        self.module_size
    }

    pub fn is_in_rdata(&self, addr: usize) -> bool {
        self.rdata_range_containing(addr).is_some()
    }

    /// Read-only range holding `addr`, if any.
    pub fn rdata_range_containing(&self, addr: usize) -> Option<MemoryRange> {
        self.rdata.iter().copied().find(|range| range.contains(addr))
    }

    /// Code range holding `addr`, if any.
    pub fn code_range_containing(&self, addr: usize) -> Option<MemoryRange> {
        self.code.iter().copied().find(|range| range.contains(addr))
    }
}

#[cfg(target_os = "windows")]
mod platform {
    use std::ffi::c_void;

    use tracing::debug;
    use windows::Win32::System::LibraryLoader::GetModuleHandleW;
    use windows::Win32::System::Memory::{
        MEM_COMMIT, MEMORY_BASIC_INFORMATION, PAGE_EXECUTE, PAGE_EXECUTE_READ,
        PAGE_EXECUTE_READWRITE, PAGE_EXECUTE_WRITECOPY, PAGE_GUARD, PAGE_READONLY, PAGE_READWRITE,
        VirtualQuery,
    };
    use windows::Win32::System::ProcessStatus::{GetModuleInformation, MODULEINFO};
    use windows::Win32::System::Threading::GetCurrentProcess;
    use windows::core::PCWSTR;

    use super::{MemoryRange, ModuleMap, PAGE_SIZE};
    use crate::error::{Error, Result};

    /// Any protection value that grants instruction fetch.
    const EXECUTE_ANY: u32 = PAGE_EXECUTE.0
        | PAGE_EXECUTE_READ.0
        | PAGE_EXECUTE_READWRITE.0
        | PAGE_EXECUTE_WRITECOPY.0;

    pub(super) fn probe_current_module() -> Result<ModuleMap> {
        // SAFETY: a null module name resolves the primary executable image.
        let module = unsafe { GetModuleHandleW(PCWSTR::null()) }
            .map_err(|e| Error::ModuleQueryFailed(e.to_string()))?;

        let mut info = MODULEINFO::default();
        // SAFETY: the pseudo handle and module handle are valid for the
        // current process; info is a writable out parameter.
        unsafe {
            GetModuleInformation(
                GetCurrentProcess(),
                module,
                &mut info,
                size_of::<MODULEINFO>() as u32,
            )
        }
        .map_err(|e| Error::ModuleQueryFailed(e.to_string()))?;

        let base = info.lpBaseOfDll as usize;
        let size = info.SizeOfImage as usize;
        let mut map = ModuleMap {
            code: Vec::new(),
            rdata: Vec::new(),
            data: Vec::new(),
            module_base: base,
            module_size: size,
        };

        let page_mask = !(PAGE_SIZE - 1);
        let mut cursor = base & page_mask;
        let scan_end = ((base + size) & page_mask) + PAGE_SIZE;

        while cursor < scan_end {
            let mut region = MEMORY_BASIC_INFORMATION::default();
            // SAFETY: region is a writable out parameter; VirtualQuery
            // tolerates unmapped addresses.
            let written = unsafe {
                VirtualQuery(
                    Some(cursor as *const c_void),
                    &mut region,
                    size_of::<MEMORY_BASIC_INFORMATION>(),
                )
            };
            if written == 0 {
                // A single failed probe is non-fatal; resume on the next page.
                debug!("VirtualQuery failed at {cursor:#x}, skipping one page");
                cursor += PAGE_SIZE;
                continue;
            }

            let range = MemoryRange::new(region.BaseAddress as usize, region.RegionSize);
            classify(&mut map, &region, range);
            cursor = range.end();
        }

        debug!(
            "module at {base:#x} ({size:#x} bytes): {} code / {} rdata / {} data ranges",
            map.code.len(),
            map.rdata.len(),
            map.data.len(),
        );
        Ok(map)
    }

    fn classify(map: &mut ModuleMap, region: &MEMORY_BASIC_INFORMATION, range: MemoryRange) {
        if region.State != MEM_COMMIT || region.Protect.contains(PAGE_GUARD) {
            return;
        }
        if region.Protect.0 & EXECUTE_ANY != 0 {
            map.code.push(range);
        } else if region.Protect == PAGE_READWRITE {
            // Exact match only; copy-on-write pages are skipped.
            map.data.push(range);
        } else if region.Protect == PAGE_READONLY {
            map.rdata.push(range);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn range_bounds_are_half_open() {
        let range = MemoryRange::new(0x1000, 0x100);
        assert_eq!(range.end(), 0x1100);
        assert!(range.contains(0x1000));
        assert!(range.contains(0x10FF));
        assert!(!range.contains(0x1100));
        assert!(!range.contains(0x0FFF));
    }

    #[test]
    fn synthetic_map_classifies_lookups() {
        let code = vec![MemoryRange::new(0x40_1000, 0x2000)];
        let rdata = vec![
            MemoryRange::new(0x40_4000, 0x1000),
            MemoryRange::new(0x40_6000, 0x800),
        ];
        let data = vec![MemoryRange::new(0x40_8000, 0x1000)];
        // SAFETY: the test never scans this map, so the ranges are only
        // used as numbers.
        let map = unsafe { ModuleMap::from_ranges(code, rdata, data) };

        assert!(map.is_in_rdata(0x40_4000));
        assert!(map.is_in_rdata(0x40_67FF));
        assert!(!map.is_in_rdata(0x40_5000));
        assert!(!map.is_in_rdata(0x40_1000));

        assert_eq!(
            map.code_range_containing(0x40_2FFF),
            Some(MemoryRange::new(0x40_1000, 0x2000))
        );
        assert_eq!(map.code_range_containing(0x40_3000), None);

        assert_eq!(map.module_base(), 0x40_1000);
        assert_eq!(map.module_size(), 0x40_9000 - 0x40_1000);
    }

    #[test]
    fn empty_map_has_no_ranges() {
        // SAFETY: no ranges at all.
        let map = unsafe { ModuleMap::from_ranges(Vec::new(), Vec::new(), Vec::new()) };
        assert!(map.code().is_empty());
        assert!(!map.is_in_rdata(0x1234));
        assert_eq!(map.module_size(), 0);
    }
}
