//! In-place byte patching.
//!
//! Every write funnels through [`write_bytes`], which lifts page protection
//! for the duration of the copy and flushes the instruction cache afterwards
//! so patched code takes effect immediately.

use crate::error::Result;

/// x86 single-byte no-op.
pub const NOP: u8 = 0x90;
/// x86 near call opcode (rel32 operand).
pub const CALL_NEAR: u8 = 0xE8;
/// x86 near jump opcode (rel32 operand).
pub const JMP_NEAR: u8 = 0xE9;
/// x86 near return opcode.
pub const RET: u8 = 0xC3;

/// Copy `bytes` to `addr`, toggling write access around the copy.
///
/// # Safety
///
/// `addr` must point at `bytes.len()` bytes owned by this process. On
/// non-Windows builds the destination must already be writable.
pub unsafe fn write_bytes(addr: usize, bytes: &[u8]) -> Result<()> {
    unsafe {
        with_write_access(addr, bytes.len(), || {
            std::ptr::copy_nonoverlapping(bytes.as_ptr(), addr as *mut u8, bytes.len());
        })
    }
}

/// Write one POD value at `addr` in native layout.
///
/// # Safety
///
/// Same contract as [`write_bytes`].
pub unsafe fn write_value<T: Copy>(addr: usize, value: T) -> Result<()> {
    let bytes = unsafe {
        std::slice::from_raw_parts(&raw const value as *const u8, size_of::<T>())
    };
    unsafe { write_bytes(addr, bytes) }
}

/// Write a slice of POD values at `addr` in native layout.
///
/// # Safety
///
/// Same contract as [`write_bytes`].
pub unsafe fn write_array<T: Copy>(addr: usize, values: &[T]) -> Result<()> {
    let bytes = unsafe {
        std::slice::from_raw_parts(values.as_ptr() as *const u8, size_of_val(values))
    };
    unsafe { write_bytes(addr, bytes) }
}

/// Read one POD value from `addr`, unaligned.
///
/// # Safety
///
/// `addr` must point at `size_of::<T>()` readable bytes.
pub unsafe fn read_value<T: Copy>(addr: usize) -> T {
    unsafe { (addr as *const T).read_unaligned() }
}

/// Overwrite `len` bytes at `addr` with NOPs.
///
/// # Safety
///
/// Same contract as [`write_bytes`].
pub unsafe fn nop_fill(addr: usize, len: usize) -> Result<()> {
    unsafe { write_bytes(addr, &vec![NOP; len]) }
}

/// NOP every byte in `start..end`.
///
/// # Safety
///
/// Same contract as [`write_bytes`].
pub unsafe fn nop_fill_range(start: usize, end: usize) -> Result<()> {
    unsafe { nop_fill(start, end - start) }
}

/// Retarget the rel32 call or jump instruction at `addr` to `target`.
///
/// Only the four displacement bytes change; the opcode stays.
///
/// # Safety
///
/// `addr` must point at a 5-byte rel32-operand instruction owned by this
/// process.
pub unsafe fn patch_call(addr: usize, target: usize) -> Result<()> {
    let displacement = target.wrapping_sub(addr.wrapping_add(5)) as u32;
    unsafe { write_bytes(addr + 1, &displacement.to_le_bytes()) }
}

/// Emit a 5-byte near call to `target` at `addr`.
///
/// # Safety
///
/// Same contract as [`patch_call`].
pub unsafe fn write_call(addr: usize, target: usize) -> Result<()> {
    unsafe {
        write_value(addr, CALL_NEAR)?;
        patch_call(addr, target)
    }
}

/// Emit a 5-byte near jump to `target` at `addr`.
///
/// # Safety
///
/// Same contract as [`patch_call`].
pub unsafe fn write_jump(addr: usize, target: usize) -> Result<()> {
    unsafe {
        write_value(addr, JMP_NEAR)?;
        patch_call(addr, target)
    }
}

/// Replace a 6-byte absolute indirect call with a near call to `target`
/// plus one trailing NOP.
///
/// # Safety
///
/// `addr` must point at a 6-byte instruction owned by this process.
pub unsafe fn patch_absolute_call(addr: usize, target: usize) -> Result<()> {
    unsafe {
        write_call(addr, target)?;
        nop_fill(addr + 5, 1)
    }
}

#[cfg(target_os = "windows")]
unsafe fn with_write_access(addr: usize, len: usize, write: impl FnOnce()) -> Result<()> {
    use std::ffi::c_void;

    use windows::Win32::System::Diagnostics::Debug::FlushInstructionCache;
    use windows::Win32::System::Memory::{
        PAGE_EXECUTE_READWRITE, PAGE_PROTECTION_FLAGS, VirtualProtect,
    };
    use windows::Win32::System::Threading::GetCurrentProcess;

    use crate::error::Error;

    let mut previous = PAGE_PROTECTION_FLAGS::default();
    // SAFETY: caller guarantees addr..addr+len lies inside this process.
    unsafe { VirtualProtect(addr as *const c_void, len, PAGE_EXECUTE_READWRITE, &mut previous) }
        .map_err(|e| Error::ProtectFailed {
            address: addr,
            message: e.to_string(),
        })?;

    write();

    // SAFETY: restoring the protection recorded above on the same span.
    unsafe { VirtualProtect(addr as *const c_void, len, previous, &mut previous) }.map_err(|e| {
        Error::ProtectFailed {
            address: addr,
            message: e.to_string(),
        }
    })?;

    // SAFETY: pseudo handle to the current process; span just written.
    unsafe { FlushInstructionCache(GetCurrentProcess(), Some(addr as *const c_void), len) }
        .map_err(|e| Error::FlushFailed {
            address: addr,
            message: e.to_string(),
        })?;
    Ok(())
}

// Non-Windows builds only patch caller-owned buffers, which are already
// writable, so no protection dance is needed.
#[cfg(not(target_os = "windows"))]
unsafe fn with_write_access(_addr: usize, _len: usize, write: impl FnOnce()) -> Result<()> {
    write();
    Ok(())
}
