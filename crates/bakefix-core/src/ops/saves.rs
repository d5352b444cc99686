//! Stop distributed-merge runs from rewriting the scene.
//!
//! When the tool merges worker tiles it saves the radiosity tables back
//! into the scene file twice, through the editable-mesh handle and again
//! through the scene tag. With several workers merging against one scene
//! that second writer corrupts the output. This pass walks a chain of
//! discoveries through the merge path, then NOPs both save calls. Nothing
//! is written until the whole chain resolves.

use tracing::{debug, info};

use crate::error::{Error, Result};
use crate::memory::patch::{self, CALL_NEAR};
use crate::pattern::{
    POINTER_SIZE, PUSH_IMM, PatternElement, Scanner, call_target, push_string_ref,
};

const MERGE_ANCHOR: &str = "merging worker tiles";
const MERGE_DONE: &str = "radiosity merge complete, writing output tables\n";
const EDITABLE_FAIL: &str = "radiosity_control.editable_mesh.create_new(mesh_path) failed";
const SCENE_WARN: &str = "### WARN: scene tag is read-only with stale radiosity references!";

/// Distance bounds between related globals in the data section.
const INDEX_NEAR: u32 = 0x200;
const MESH_NEAR: u32 = 0x1000;

/// Merge-mode value the save path compares against.
const WORKER_MERGE_MODE: u8 = 0x02;

const CDQ: u8 = 0x99;
const POP_ECX: u8 = 0x59;
const JNZ_SHORT: u8 = 0x75;
const JMP_SHORT: u8 = 0xEB;
const STORE_EAX: u8 = 0xA3;
const PUSH_ONE: [u8; 2] = [0x6A, 0x01];
const PUSH_GLOBAL: [u8; 2] = [0xFF, 0x35];
const IDIV_GLOBAL: [u8; 2] = [0xF7, 0x3D];
const CMP_EDX_GLOBAL: [u8; 2] = [0x3B, 0x15];
const CMP_GLOBAL_IMM8: [u8; 2] = [0x83, 0x3D];
const PUSH_EBP_DISP: [u8; 2] = [0xFF, 0xB5];

/// A 4-byte global address expected within `radius` of one discovered
/// earlier.
fn near_global(center: u32, radius: u32) -> PatternElement {
    PatternElement::U32Range(center.saturating_sub(radius), center.saturating_add(radius))
}

pub fn disable_worker_saves(scanner: &Scanner<'_>) -> Result<()> {
    // The merge banner pins the push of the worker-count global.
    let mut count_pattern = push_string_ref(MERGE_ANCHOR).to_vec();
    count_pattern.extend([
        PatternElement::Byte(CALL_NEAR),
        PatternElement::Any(4),
        PatternElement::Byte(POP_ECX),
        PatternElement::Bytes(PUSH_GLOBAL.to_vec()),
    ]);
    let count_site = scanner
        .find_first_in_code(&count_pattern)
        .ok_or(Error::AnchorNotFound("worker count push"))?;
    // SAFETY: the 4-byte operand follows the matched push opcode.
    let worker_count = unsafe { patch::read_value::<u32>(count_site.end()) };

    // Division by the worker count names the index global.
    let index_pattern = [
        PatternElement::Byte(CDQ),
        PatternElement::Bytes(IDIV_GLOBAL.to_vec()),
        PatternElement::lit_u32(worker_count),
        PatternElement::Bytes(CMP_EDX_GLOBAL.to_vec()),
        near_global(worker_count, INDEX_NEAR),
    ];
    let index_site = scanner
        .find_first_in_code(&index_pattern)
        .ok_or(Error::AnchorNotFound("worker index compare"))?;
    // SAFETY: the range element consumed the operand's 4 bytes.
    let worker_index = unsafe { patch::read_value::<u32>(index_site.end() - 4) };

    // The store into the editable-mesh handle sits just before the
    // creation-failure report.
    let mut mesh_pattern = vec![
        PatternElement::Byte(STORE_EAX),
        near_global(worker_index, MESH_NEAR),
        PatternElement::AnyRange(2, 10),
        PatternElement::Byte(JNZ_SHORT),
        PatternElement::Any(1),
        PatternElement::Bytes(PUSH_ONE.to_vec()),
        PatternElement::Byte(PUSH_IMM),
        PatternElement::I32Range(600, 700),
        PatternElement::Byte(PUSH_IMM),
        PatternElement::Any(POINTER_SIZE),
    ];
    mesh_pattern.extend(push_string_ref(EDITABLE_FAIL));
    mesh_pattern.extend([PatternElement::Byte(CALL_NEAR), PatternElement::Any(4)]);
    let mesh_site = scanner
        .find_first_in_code(&mesh_pattern)
        .ok_or(Error::AnchorNotFound("editable mesh store"))?;
    // SAFETY: the store opcode is followed by its 4-byte operand.
    let editable_mesh = unsafe { patch::read_value::<u32>(mesh_site.addr + 1) };
    debug!(
        "Worker globals: count {worker_count:#x}, index {worker_index:#x}, \
         mesh {editable_mesh:#x}"
    );

    // The merge-path save: mode check, completion banner, then the push
    // of the mesh handle into the tag-save call.
    let mut merge_pattern = vec![
        PatternElement::Bytes(CMP_GLOBAL_IMM8.to_vec()),
        near_global(editable_mesh, MESH_NEAR),
        PatternElement::Byte(WORKER_MERGE_MODE),
    ];
    merge_pattern.extend(push_string_ref(MERGE_DONE));
    merge_pattern.extend([
        PatternElement::Byte(CALL_NEAR),
        PatternElement::Any(4),
        PatternElement::Byte(JMP_SHORT),
        PatternElement::Any(1),
        PatternElement::AnyRange(0, 0x40),
        PatternElement::Bytes(PUSH_GLOBAL.to_vec()),
        PatternElement::lit_u32(editable_mesh),
        PatternElement::Byte(CALL_NEAR),
        PatternElement::Any(4),
    ]);
    let merge_site = scanner
        .find_first_in_code(&merge_pattern)
        .ok_or(Error::AnchorNotFound("merge tag save call"))?;
    let merge_call = merge_site.end() - 5;
    // SAFETY: the match ends with the 5-byte save call.
    let tag_save = unsafe { call_target(merge_call) };

    // The second writer calls the same save routine on the scene tag,
    // pushing a local far below the frame base.
    let mut scene_pattern = vec![
        PatternElement::Bytes(PUSH_EBP_DISP.to_vec()),
        PatternElement::Any(2),
        PatternElement::Bytes(vec![0xFF, 0xFF]),
        PatternElement::CallTo(tag_save),
        PatternElement::AnyRange(0, 0x10),
    ];
    scene_pattern.extend(push_string_ref(SCENE_WARN));
    let scene_site = scanner
        .find_first_in_code(&scene_pattern)
        .ok_or(Error::AnchorNotFound("scene tag save call"))?;
    let scene_call = scene_site.addr + 6;

    // Whole chain resolved; only now do the two save calls go away.
    unsafe {
        patch::nop_fill(merge_call, 5)?;
        patch::nop_fill(scene_call, 5)?;
    }
    info!("Worker tile merge saves disabled (tag save at {tag_save:#x})");
    Ok(())
}
