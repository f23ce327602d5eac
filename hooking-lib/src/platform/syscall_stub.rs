//! Byte layout of ntdll Nt* system call stubs, of the jump written over them and of the
//! gateway that re-issues the system call.
//!
//! ```text
//! x64 stub:  4C 8B D1        mov r10, rcx
//!            B8 <id>         mov eax, <id>
//!            F6 04 25 ..     test byte ptr [SharedUserData+0x308], 1
//!            75 03           jne  +3
//!            0F 05           syscall
//!            C3              ret
//! x86 stub:  B8 <id>         mov eax, <id>
//!            BA <addr>       mov edx, <KiFastSystemCall>
//!            FF D2           call edx
//!            C2 <n>          ret n
//! ```

use shared::errors::PatchError;

#[cfg(target_pointer_width = "64")]
pub const PATCH_LEN: usize = 13; // mov r10,imm64 ; jmp r10
#[cfg(target_pointer_width = "32")]
pub const PATCH_LEN: usize = 7; // mov eax,imm32 ; jmp eax

#[cfg(target_pointer_width = "64")]
pub const GATEWAY_LEN: usize = 11; // mov r10,rcx ; mov eax,<id> ; syscall ; ret
#[cfg(target_pointer_width = "32")]
pub const GATEWAY_LEN: usize = 10; // mov eax,<id> ; int 2E ; ret ; padding

/// Bytes of the original stub inspected before patching.
pub const STUB_SCAN_LEN: usize = 20;

/// What a clean stub tells us.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StubLayout {
    pub syscall_id: u32,
    /// Prologue bytes the jump overwrites, restored on removal.
    pub saved: [u8; PATCH_LEN],
}

/// Check that `prologue` (read at `target`) is an unpatched stub with room for the jump.
pub fn inspect(target: usize, prologue: &[u8]) -> Result<StubLayout, PatchError> {
    if looks_patched(prologue) {
        return Err(PatchError::AlreadyPatched { target });
    }
    let (mov_at, syscall_id) = syscall_id(prologue).ok_or(PatchError::UnrecognizedStub { target })?;

    // Everything before the first control transfer may be overwritten.
    let transfer = first_transfer(prologue, mov_at + 5).ok_or(PatchError::UnrecognizedStub { target })?;
    if transfer < PATCH_LEN {
        return Err(PatchError::InsufficientSpace { target });
    }

    let mut saved = [0u8; PATCH_LEN];
    saved.copy_from_slice(&prologue[..PATCH_LEN]);
    Ok(StubLayout { syscall_id, saved })
}

/// Offset and immediate of the first `mov eax,<imm32>`.
fn syscall_id(prologue: &[u8]) -> Option<(usize, u32)> {
    prologue
        .windows(5)
        .position(|w| w[0] == 0xB8)
        .map(|at| {
            let w = &prologue[at..at + 5];
            (at, u32::from_le_bytes([w[1], w[2], w[3], w[4]]))
        })
}

/// Offset of the first `syscall`, `int 2E`, `call edx` or `call [edx]` at or after `from`.
fn first_transfer(prologue: &[u8], from: usize) -> Option<usize> {
    prologue
        .get(from..)?
        .windows(2)
        .position(|w| matches!(w, [0x0F, 0x05] | [0xCD, 0x2E] | [0xFF, 0xD2] | [0xFF, 0x12]))
        .map(|offset| from + offset)
}

/// Whether the prologue already starts with a jump we (or someone else) wrote.
pub fn looks_patched(prologue: &[u8]) -> bool {
    matches!(
        prologue,
        [0x49, 0xBA, ..] | [0xE9, ..] | [0xFF, 0x25, ..] | [0xB8, _, _, _, _, 0xFF, 0xE0, ..]
    )
}

pub fn jump_to(replacement: usize) -> [u8; PATCH_LEN] {
    let mut patch = [0u8; PATCH_LEN];
    #[cfg(target_pointer_width = "64")]
    {
        // mov r10,<replacement> ; jmp r10
        patch[0] = 0x49;
        patch[1] = 0xBA;
        patch[2..10].copy_from_slice(&(replacement as u64).to_le_bytes());
        patch[10] = 0x41;
        patch[11] = 0xFF;
        patch[12] = 0xE2;
    }
    #[cfg(target_pointer_width = "32")]
    {
        // mov eax,<replacement> ; jmp eax
        patch[0] = 0xB8;
        patch[1..5].copy_from_slice(&(replacement as u32).to_le_bytes());
        patch[5] = 0xFF;
        patch[6] = 0xE0;
    }
    patch
}

/// A clean stub issuing system call `id`.
pub fn gateway_code(id: u32) -> [u8; GATEWAY_LEN] {
    let id = id.to_le_bytes();
    #[cfg(target_pointer_width = "64")]
    let bytes = [
        0x4C, 0x8B, 0xD1, // mov r10, rcx
        0xB8, id[0], id[1], id[2], id[3], // mov eax, <id>
        0x0F, 0x05, // syscall
        0xC3, // ret
    ];
    #[cfg(target_pointer_width = "32")]
    let bytes = [
        0xB8, id[0], id[1], id[2], id[3], // mov eax, <id>
        0xCD, 0x2E, // int 2E
        0xC3, // ret
        0x90, 0x90,
    ];
    bytes
}
