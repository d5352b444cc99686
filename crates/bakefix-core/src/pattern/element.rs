//! Pattern element vocabulary.
//!
//! A pattern is a flat `Vec<PatternElement>` matched left to right against
//! module bytes. Elements mix literal bytes with semantic probes such as
//! "a call landing on this routine" or "a pointer into read-only data
//! naming this string".

use crate::memory::ModuleMap;
use crate::memory::patch::{self, CALL_NEAR};

/// Width of an in-image pointer on the build target.
pub const POINTER_SIZE: usize = size_of::<usize>();

/// x86 push imm32 opcode.
pub const PUSH_IMM: u8 = 0x68;

#[derive(Debug, Clone, PartialEq)]
pub enum PatternElement {
    /// Exactly this byte.
    Byte(u8),
    /// Exactly this byte run.
    Bytes(Vec<u8>),
    /// Any content, fixed width.
    Any(usize),
    /// Any content, width between min and max inclusive. The scanner tries
    /// the shortest width first.
    AnyRange(usize, usize),
    /// Little-endian i32 within the inclusive range.
    I32Range(i32, i32),
    /// Little-endian u32 within the inclusive range.
    U32Range(u32, u32),
    /// Little-endian f32 within the inclusive range.
    F32Range(f32, f32),
    /// Near call whose rel32 operand resolves to this address.
    CallTo(usize),
    /// Pointer-sized value addressing this NUL-terminated string in
    /// read-only data.
    StringRef(String),
}

impl PatternElement {
    /// Literal little-endian u32.
    pub fn lit_u32(value: u32) -> Self {
        Self::Bytes(value.to_le_bytes().to_vec())
    }

    /// Literal little-endian i32.
    pub fn lit_i32(value: i32) -> Self {
        Self::Bytes(value.to_le_bytes().to_vec())
    }

    /// Literal little-endian f32.
    pub fn lit_f32(value: f32) -> Self {
        Self::Bytes(value.to_le_bytes().to_vec())
    }

    pub fn string_ref(text: impl Into<String>) -> Self {
        Self::StringRef(text.into())
    }

    /// Fewest bytes this element can consume.
    pub fn size_required(&self) -> usize {
        match self {
            Self::Byte(_) => 1,
            Self::Bytes(bytes) => bytes.len(),
            Self::Any(len) => *len,
            Self::AnyRange(min, _) => *min,
            Self::I32Range(..) | Self::U32Range(..) | Self::F32Range(..) => 4,
            Self::CallTo(_) => 5,
            Self::StringRef(_) => POINTER_SIZE,
        }
    }

    /// Consumed width when it does not depend on the match, `None` for
    /// variable-width elements.
    pub fn fixed_size(&self) -> Option<usize> {
        match self {
            Self::AnyRange(..) => None,
            other => Some(other.size_required()),
        }
    }

    /// Byte every match must start with, if the element pins one.
    pub(crate) fn lead_byte(&self) -> Option<u8> {
        match self {
            Self::Byte(byte) => Some(*byte),
            Self::Bytes(bytes) => bytes.first().copied(),
            Self::CallTo(_) => Some(CALL_NEAR),
            _ => None,
        }
    }

    /// Whether this element matches at `addr`, assuming `size_required()`
    /// bytes are readable there.
    ///
    /// # Safety
    ///
    /// `addr..addr + size_required()` must be readable. [`AnyRange`]
    /// elements are width-driven and must be handled by the scanner, not
    /// here.
    ///
    /// [`AnyRange`]: PatternElement::AnyRange
    pub(crate) unsafe fn matches_at(&self, map: &ModuleMap, addr: usize) -> bool {
        match self {
            Self::Byte(expected) => unsafe { patch::read_value::<u8>(addr) == *expected },
            Self::Bytes(expected) => {
                let actual =
                    unsafe { std::slice::from_raw_parts(addr as *const u8, expected.len()) };
                actual == expected.as_slice()
            }
            Self::Any(_) | Self::AnyRange(..) => true,
            Self::I32Range(lo, hi) => {
                let value = unsafe { patch::read_value::<i32>(addr) };
                (*lo..=*hi).contains(&value)
            }
            Self::U32Range(lo, hi) => {
                let value = unsafe { patch::read_value::<u32>(addr) };
                (*lo..=*hi).contains(&value)
            }
            Self::F32Range(lo, hi) => {
                let value = unsafe { patch::read_value::<f32>(addr) };
                (*lo..=*hi).contains(&value)
            }
            Self::CallTo(target) => {
                unsafe {
                    patch::read_value::<u8>(addr) == CALL_NEAR && call_target(addr) == *target
                }
            }
            Self::StringRef(text) => {
                let pointer = unsafe { patch::read_value::<usize>(addr) };
                string_ref_matches(map, pointer, text)
            }
        }
    }
}

/// Resolve the destination of the rel32 call or jump instruction at `addr`.
///
/// # Safety
///
/// `addr..addr + 5` must be readable.
pub unsafe fn call_target(addr: usize) -> usize {
    let displacement = unsafe { patch::read_value::<i32>(addr + 1) };
    addr.wrapping_add(5).wrapping_add_signed(displacement as isize)
}

/// Push-immediate of a read-only string: `68 <ptr>` where the pointer
/// names `text`.
pub fn push_string_ref(text: &str) -> [PatternElement; 2] {
    [PatternElement::Byte(PUSH_IMM), PatternElement::string_ref(text)]
}

fn string_ref_matches(map: &ModuleMap, pointer: usize, text: &str) -> bool {
    let Some(range) = map.rdata_range_containing(pointer) else {
        return false;
    };
    // The stored string must fit inside the range, terminator included.
    let needed = text.len() + 1;
    if pointer + needed > range.end() {
        return false;
    }
    // SAFETY: pointer..pointer+needed verified inside a readable range.
    let stored = unsafe { std::slice::from_raw_parts(pointer as *const u8, needed) };
    &stored[..text.len()] == text.as_bytes() && stored[text.len()] == 0
}
