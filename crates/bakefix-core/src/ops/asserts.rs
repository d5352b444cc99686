//! Make fatal asserts non-fatal.
//!
//! The baking tool funnels every assert through one display routine taking
//! `(expression, file, line, is_fatal)`. A fatal assert kills a bake hours
//! in, usually over a stale precondition nobody has maintained in years.
//! This pass resolves the display routine from a known call site, turns
//! the process-exit routine it reaches into an immediate return, and flips
//! the is-fatal argument at every call site so asserts only report.

use tracing::{debug, info};

use crate::error::{Error, Result};
use crate::memory::patch::{self, CALL_NEAR, RET};
use crate::pattern::{
    POINTER_SIZE, PUSH_IMM, PatternElement, Scanner, call_target, push_string_ref,
};

/// Assert expression always present in the render-target setup path.
const ANCHOR_EXPRESSION: &str = "render_targets_initialized()";
/// Line number of the anchor assert. Historical variation across tool
/// revisions: 284 to 301.
const ANCHOR_LINE_RANGE: (i32, i32) = (250, 350);
/// Any plausible source line.
const FATAL_LINE_RANGE: (i32, i32) = (1, 65_535);
/// How far into the display routine the exit call may sit.
const EXIT_SEARCH_WINDOW: usize = 0x80;

/// push 1, the is-fatal argument.
const PUSH_FATAL: [u8; 2] = [0x6A, 0x01];
/// push -1, the exit code handed to the process-exit routine.
const PUSH_EXIT_CODE: [u8; 2] = [0x6A, 0xFF];
/// int3.
const TRAP: u8 = 0xCC;

/// Call-site shape of a fatal assert: push 1, push line, push file, push
/// expression, call the display routine. Unknown parts stay wildcarded so
/// one pattern covers every site.
fn fatal_site_pattern(
    line_range: (i32, i32),
    expression: Option<&str>,
    display_assert: Option<usize>,
) -> Vec<PatternElement> {
    let mut pattern = vec![
        PatternElement::Bytes(PUSH_FATAL.to_vec()),
        PatternElement::Byte(PUSH_IMM),
        PatternElement::I32Range(line_range.0, line_range.1),
        PatternElement::Byte(PUSH_IMM),
        PatternElement::Any(POINTER_SIZE),
    ];
    match expression {
        Some(text) => pattern.extend(push_string_ref(text)),
        None => pattern.extend([
            PatternElement::Byte(PUSH_IMM),
            PatternElement::Any(POINTER_SIZE),
        ]),
    }
    match display_assert {
        Some(target) => pattern.push(PatternElement::CallTo(target)),
        None => pattern.extend([PatternElement::Byte(CALL_NEAR), PatternElement::Any(4)]),
    }
    pattern
}

pub fn disable_asserts(scanner: &Scanner<'_>) -> Result<()> {
    let anchor_pattern = fatal_site_pattern(ANCHOR_LINE_RANGE, Some(ANCHOR_EXPRESSION), None);
    let anchor = scanner
        .find_first_in_code(&anchor_pattern)
        .ok_or(Error::AnchorNotFound("assert anchor call site"))?;
    // SAFETY: every match of the pattern ends in a 5-byte near call.
    let display_assert = unsafe { call_target(anchor.end() - 5) };
    debug!("Assert display routine at {display_assert:#x}");

    let exit_pattern = [
        PatternElement::Bytes(PUSH_EXIT_CODE.to_vec()),
        PatternElement::Byte(CALL_NEAR),
        PatternElement::Any(4),
    ];
    let exit_site = scanner
        .find_in_window(display_assert, EXIT_SEARCH_WINDOW, &exit_pattern)
        .ok_or(Error::AnchorNotFound("exit call inside the assert display routine"))?;
    // SAFETY: same call tail shape as the anchor.
    let exit_fn = unsafe { call_target(exit_site.end() - 5) };

    // The exit routine now returns before tearing anything down.
    unsafe { patch::write_value(exit_fn, RET)? };
    debug!("Exit routine at {exit_fn:#x} neutralized");

    let site_pattern = fatal_site_pattern(FATAL_LINE_RANGE, None, Some(display_assert));
    let sites = scanner.find_in_code(&site_pattern, 0);
    if sites.is_empty() {
        return Err(Error::AnchorNotFound("fatal assert call sites"));
    }
    for site in &sites {
        // push 1 becomes push 0: the assert reports and execution goes on.
        unsafe { patch::write_value(site.addr + 1, 0u8)? };
    }
    info!("Defused {} fatal assert sites", sites.len());

    // Some revisions plant an int3 right after the display call; clear it
    // so attached debuggers do not stop the bake either.
    let trap_pattern = [
        PatternElement::CallTo(display_assert),
        PatternElement::Byte(TRAP),
    ];
    let traps = scanner.find_in_code(&trap_pattern, 0);
    for trap in &traps {
        unsafe { patch::nop_fill(trap.addr + 5, 1)? };
    }
    if !traps.is_empty() {
        debug!("Cleared {} post-assert debug traps", traps.len());
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::{MemoryRange, ModuleMap, patch::NOP};

    /// Byte length of one assembled assert call site.
    const SITE: usize = 14 + 2 * POINTER_SIZE;

    /// Fixed-size code buffer filled with 0x33 noise, patched in place.
    struct CodeBuilder {
        bytes: Vec<u8>,
    }

    impl CodeBuilder {
        fn new(len: usize) -> Self {
            Self {
                bytes: vec![0x33; len],
            }
        }

        fn base(&self) -> usize {
            self.bytes.as_ptr() as usize
        }

        fn put(&mut self, offset: usize, data: &[u8]) {
            self.bytes[offset..offset + data.len()].copy_from_slice(data);
        }

        fn put_call(&mut self, offset: usize, target_offset: usize) {
            self.bytes[offset] = CALL_NEAR;
            let rel = (target_offset as i64 - (offset as i64 + 5)) as i32;
            self.put(offset + 1, &rel.to_le_bytes());
        }

        fn put_assert_site(
            &mut self,
            offset: usize,
            line: i32,
            file: usize,
            expr: usize,
            display_offset: usize,
        ) {
            self.put(offset, &PUSH_FATAL);
            self.bytes[offset + 2] = PUSH_IMM;
            self.put(offset + 3, &line.to_le_bytes());
            self.bytes[offset + 7] = PUSH_IMM;
            self.put(offset + 8, &file.to_le_bytes());
            self.bytes[offset + 8 + POINTER_SIZE] = PUSH_IMM;
            self.put(offset + 9 + POINTER_SIZE, &expr.to_le_bytes());
            self.put_call(offset + 9 + 2 * POINTER_SIZE, display_offset);
        }
    }

    fn rdata_strings() -> (Vec<u8>, [usize; 3]) {
        let mut rdata = Vec::new();
        let mut offsets = [0usize; 3];
        for (slot, text) in [
            "render_targets_initialized()",
            "geometry_pass.cpp",
            "mesh_budget_exceeded(lod)",
        ]
        .iter()
        .enumerate()
        {
            offsets[slot] = rdata.len();
            rdata.extend_from_slice(text.as_bytes());
            rdata.push(0);
        }
        (rdata, offsets)
    }

    #[test]
    fn full_pass_defuses_every_site() {
        let (rdata, offsets) = rdata_strings();
        let rdata_base = rdata.as_ptr() as usize;
        let [anchor_expr, file, other_expr] =
            offsets.map(|off| rdata_base + off);

        let site_b = SITE + 3;
        let trap = 2 * SITE + 6;
        let display = 2 * SITE + 16;
        let exit = display + 24;
        let mut code = CodeBuilder::new(display + 32);

        code.put_assert_site(0, 292, file, anchor_expr, display);
        code.put_assert_site(site_b, 1105, file, other_expr, display);
        code.put_call(trap, display);
        code.bytes[trap + 5] = TRAP;
        // Display routine: prologue, then push -1 and call the exit fn.
        code.put(display, &[0x8B, 0xFF, 0x55, 0x8B, 0xEC]);
        code.put(display + 9, &PUSH_EXIT_CODE);
        code.put_call(display + 11, exit);
        code.bytes[display + 16] = RET;
        // Exit routine prologue, to be stamped over.
        code.put(exit, &[0x55, 0x8B, 0xEC]);

        let ranges = vec![MemoryRange::new(code.base(), code.bytes.len())];
        let rdata_ranges = vec![MemoryRange::new(rdata_base, rdata.len())];
        // SAFETY: both buffers outlive the scan.
        let map = unsafe { ModuleMap::from_ranges(ranges, rdata_ranges, Vec::new()) };
        let scanner = Scanner::new(&map);

        disable_asserts(&scanner).unwrap();

        // Both call sites now push 0 for is-fatal.
        assert_eq!(code.bytes[1], 0x00);
        assert_eq!(code.bytes[site_b + 1], 0x00);
        // Line numbers were left alone.
        assert_eq!(&code.bytes[3..7], &292i32.to_le_bytes());
        assert_eq!(&code.bytes[site_b + 3..site_b + 7], &1105i32.to_le_bytes());
        // The exit routine returns immediately; the trap is gone.
        assert_eq!(code.bytes[exit], RET);
        assert_eq!(code.bytes[trap + 5], NOP);
        // The display routine body is untouched.
        assert_eq!(&code.bytes[display..display + 5], &[0x8B, 0xFF, 0x55, 0x8B, 0xEC]);
        assert_eq!(code.bytes[display + 16], RET);
    }

    #[test]
    fn missing_anchor_changes_nothing() {
        let (rdata, offsets) = rdata_strings();
        let rdata_base = rdata.as_ptr() as usize;
        // Only the non-anchor expression appears in code.
        let other_expr = rdata_base + offsets[2];
        let file = rdata_base + offsets[1];

        let mut code = CodeBuilder::new(2 * SITE);
        code.put_assert_site(0, 1105, file, other_expr, 2 * SITE - 5);
        let snapshot = code.bytes.clone();

        let ranges = vec![MemoryRange::new(code.base(), code.bytes.len())];
        let rdata_ranges = vec![MemoryRange::new(rdata_base, rdata.len())];
        // SAFETY: both buffers outlive the scan.
        let map = unsafe { ModuleMap::from_ranges(ranges, rdata_ranges, Vec::new()) };
        let scanner = Scanner::new(&map);

        let err = disable_asserts(&scanner).unwrap_err();
        assert!(err.is_anchor_not_found());
        assert_eq!(code.bytes, snapshot);
    }

    #[test]
    fn fatal_flag_flip_touches_only_offset_one() {
        // One generic site embedded at offset 17 of a 64-byte noise
        // buffer; pointer operands stay noise, covered by wildcards.
        let mut code = CodeBuilder::new(64);
        let display = 60;
        code.put(17, &PUSH_FATAL);
        code.bytes[19] = PUSH_IMM;
        code.put(20, &300i32.to_le_bytes());
        code.bytes[24] = PUSH_IMM;
        code.bytes[25 + POINTER_SIZE] = PUSH_IMM;
        code.put_call(26 + 2 * POINTER_SIZE, display);

        let ranges = vec![MemoryRange::new(code.base(), code.bytes.len())];
        // SAFETY: the buffer outlives the scan.
        let map = unsafe { ModuleMap::from_ranges(ranges, Vec::new(), Vec::new()) };
        let scanner = Scanner::new(&map);

        let pattern = fatal_site_pattern(FATAL_LINE_RANGE, None, Some(code.base() + display));
        let sites = scanner.find_in_code(&pattern, 0);
        assert_eq!(sites.len(), 1);
        assert_eq!(sites[0].addr, code.base() + 17);

        let mut expected = code.bytes.clone();
        expected[18] = 0x00;
        unsafe { patch::write_value(sites[0].addr + 1, 0u8).unwrap() };
        assert_eq!(code.bytes, expected);
    }
}
