//! # Imprewire
//!
//! **Imprewire** rewires the import table of a Windows executable while it
//! starts. The target is launched under a debugger; at the process-creation
//! event, before the loader has resolved a single import, its import
//! directory is rebuilt in freshly allocated memory near the image base.
//! Imports can be added from any DLL, and existing imports can be forwarded
//! to alternate DLL/function pairs once the loader has resolved them. The
//! debugger then detaches and the target runs untouched.
//!
//! ## Pipeline
//!
//! **Parse** (update strings and the target's import directory) $\to$
//! **Merge** (existing imports + updates + forwardings) $\to$ **Allocate**
//! (near the image base, Detours-style) $\to$ **Write** (thunk arrays,
//! descriptor table, string pool) $\to$ **Resolve** (forwardings, at the
//! loader's initial breakpoint).
//!
//! Everything up to the write is pure and platform-independent; the remote
//! side goes through the [`memory::VirtualMemory`] trait, with the Win32
//! implementation in the `os` module.
//!
//! ## Usage Example
//!
//! ```rust
//! use imprewire::{parse_import_updates, prepare_new_module_imports};
//!
//! fn main() -> Result<(), imprewire::Error> {
//!     // One import by name, one by ordinal.
//!     let (updates, forwardings) = parse_import_updates(&[
//!         "hook.dll!InstallHooks",
//!         "user32.dll#120",
//!     ])?;
//!     assert!(forwardings.is_empty());
//!
//!     // With no existing imports every touched DLL comes out brand new.
//!     let new_imports = prepare_new_module_imports(&[], &updates, &forwardings)?;
//!     assert_eq!(new_imports.len(), 2);
//!     Ok(())
//! }
//! ```
//!
//! ## Feature Flags
//!
//! Structured logging through `tracing` is enabled by default; build with
//! `--no-default-features` for a silent library.

/// Error types for parsing, merging and remote-memory failures.
pub mod error;
/// Resolution of forwarded imports after loader resolution.
pub mod forwards;
/// Bounds-checked PE image reading.
pub mod image;
/// The import-directory data model.
pub mod imports;
/// Byte accounting for the new import directory.
pub mod layout;
/// Remote-memory abstraction and the near-base allocator.
pub mod memory;
/// Merging of existing imports with updates and forwardings.
pub mod merge;
/// The debug-session state machine.
pub mod session;
/// The import update mini-language parser.
pub mod updates;
/// Serialization of the new import directory into the target.
pub mod writer;

/// Process launching, debug-event loop and Win32 memory access.
#[cfg(windows)]
pub mod os;

// Re-exports (Public API)
pub use error::{Error, Result};
pub use image::{PeImage, read_module_imports};
pub use imports::{Forwarding, FunctionImport, FunctionThunk, ImportUpdate, ModuleImport};
pub use layout::calculate_import_directory_size;
pub use memory::{VirtualMemory, find_and_allocate_near_base};
pub use merge::prepare_new_module_imports;
pub use updates::parse_import_updates;
pub use writer::{patch_data_directories, write_import_directory};

#[cfg(windows)]
pub use os::DebugSession;

// Re-export log macros for internal use across modules.
// This allows pipeline stages to use `crate::debug!` regardless of the logging backend.
#[cfg(feature = "tracing")]
#[allow(unused_imports)]
pub(crate) use tracing::{debug, error, info, warn};

#[cfg(not(feature = "tracing"))]
mod quiet {
    #[macro_export]
    macro_rules! debug {
        ($($arg:tt)*) => {};
    }
    #[macro_export]
    macro_rules! error {
        ($($arg:tt)*) => {};
    }
    #[macro_export]
    macro_rules! info {
        ($($arg:tt)*) => {};
    }
    #[macro_export]
    macro_rules! trace {
        ($($arg:tt)*) => {};
    }
    #[macro_export]
    macro_rules! warn {
        ($($arg:tt)*) => {};
    }
}

#[cfg(not(feature = "tracing"))]
pub(crate) use quiet::*;

#[cfg(test)]
mod tests {
    //! The whole pipeline against an in-process target: parse, merge, size,
    //! allocate, write, patch, then forward resolution after a simulated
    //! loader pass.

    use super::*;
    use crate::forwards::resolve_forwarded_imports;
    use crate::memory::{MemoryRegion, RegionState, testing::MockMemory};

    const IMAGE_BASE: u64 = 0x1_4000_0000;

    fn put_u16(data: &mut [u8], offset: usize, value: u16) {
        data[offset..offset + 2].copy_from_slice(&value.to_le_bytes());
    }

    fn put_u32(data: &mut [u8], offset: usize, value: u32) {
        data[offset..offset + 4].copy_from_slice(&value.to_le_bytes());
    }

    fn put_u64(data: &mut [u8], offset: usize, value: u64) {
        data[offset..offset + 8].copy_from_slice(&value.to_le_bytes());
    }

    /// A 64-bit image with one `.idata` section importing
    /// `TestDll.dll!CreateWidget` and `TestDll.dll#5`.
    fn build_target_image() -> Vec<u8> {
        let e_lfanew = 0x80usize;
        let optional = e_lfanew + 24;
        let mut data = vec![0u8; 0x600];

        put_u16(&mut data, 0, 0x5A4D);
        put_u32(&mut data, 0x3C, e_lfanew as u32);
        put_u32(&mut data, e_lfanew, 0x0000_4550);
        put_u16(&mut data, e_lfanew + 6, 1);
        put_u16(&mut data, e_lfanew + 20, 240);

        put_u16(&mut data, optional, 0x20B);
        put_u64(&mut data, optional + 24, IMAGE_BASE);
        put_u32(&mut data, optional + 60, 0x400);
        put_u32(&mut data, optional + 108, 16);
        put_u32(&mut data, optional + 112 + 8, 0x1000);
        put_u32(&mut data, optional + 112 + 12, 40);

        let section = optional + 240;
        data[section..section + 6].copy_from_slice(b".idata");
        put_u32(&mut data, section + 8, 0x200);
        put_u32(&mut data, section + 12, 0x1000);
        put_u32(&mut data, section + 16, 0x200);
        put_u32(&mut data, section + 20, 0x400);

        let raw = |rva: usize| rva - 0x1000 + 0x400;
        put_u32(&mut data, raw(0x1000), 0x1050);
        put_u32(&mut data, raw(0x1000) + 12, 0x1080);
        put_u32(&mut data, raw(0x1000) + 16, 0x1060);
        for base in [0x1050usize, 0x1060] {
            put_u64(&mut data, raw(base), 0x1090);
            put_u64(&mut data, raw(base) + 8, imports::ORDINAL_FLAG64 | 5);
        }
        data[raw(0x1080)..raw(0x1080) + 12].copy_from_slice(b"TestDll.dll\0");
        put_u16(&mut data, raw(0x1090), 7);
        data[raw(0x1090) + 2..raw(0x1090) + 15].copy_from_slice(b"CreateWidget\0");

        data
    }

    #[test]
    fn full_pipeline_rewrites_and_forwards() {
        let file_bytes = build_target_image();
        let image = PeImage::parse(file_bytes.clone()).unwrap();
        assert!(image.is_64bit());
        let original_imports = read_module_imports(&image).unwrap();

        let (updates, forwardings) = parse_import_updates(&[
            "hook.dll!Install",
            "TestDll.dll#5:hook.dll!Install",
        ])
        .unwrap();

        let mut new_imports =
            prepare_new_module_imports(&original_imports, &updates, &forwardings).unwrap();

        // The ordinal import is forwarded away; the hook DLL is brand new.
        assert_eq!(new_imports.len(), 2);
        assert_eq!(new_imports[0].dll_name, "TESTDLL.DLL");
        assert_eq!(new_imports[0].first_thunks.len(), 1);
        assert!(new_imports[0].needs_rewrite());
        assert_eq!(new_imports[1].dll_name, "HOOK.DLL");

        // A target with committed headers, a free gap, and the end marker.
        let mut memory = MockMemory::with_window(IMAGE_BASE, 0x40000);
        memory.regions = vec![
            MemoryRegion {
                base: IMAGE_BASE,
                size: 0x10000,
                state: RegionState::Committed,
            },
            MemoryRegion {
                base: IMAGE_BASE + 0x10000,
                size: 0x20000,
                state: RegionState::Free,
            },
            MemoryRegion {
                base: IMAGE_BASE + 0x30000,
                size: 0xfff,
                state: RegionState::Free,
            },
        ];
        // Loader-mapped headers: below SizeOfHeaders the mapping is 1:1.
        memory.write(IMAGE_BASE, &file_bytes[..0x400]).unwrap();

        let size = calculate_import_directory_size(&new_imports, true);
        let block = find_and_allocate_near_base(&mut memory, IMAGE_BASE, size.total_size(), true)
            .unwrap()
            .unwrap();
        assert_eq!(block, IMAGE_BASE + 0x10000);

        let directory =
            write_import_directory(&mut memory, block, IMAGE_BASE, true, &mut new_imports)
                .unwrap();
        patch_data_directories(&mut memory, IMAGE_BASE, &directory).unwrap();

        // The header now points at the new descriptor table.
        let header_entry = IMAGE_BASE + 0x80 + 24 + 112 + 8;
        let mut expected = Vec::new();
        expected.extend_from_slice(&directory.rva.to_le_bytes());
        expected.extend_from_slice(&directory.size.to_le_bytes());
        assert_eq!(memory.bytes_at(header_entry, 8), &expected[..]);

        // Play loader: resolve every slot of the new import address table.
        let resolved_install: u64 = 0x7FFB_1234_5678;
        for module in &new_imports {
            for (slot, _) in module.first_thunks.iter().enumerate() {
                let address = IMAGE_BASE + module.first_thunk_rva as u64 + slot as u64 * 8;
                let value = if module.dll_name == "HOOK.DLL" {
                    resolved_install
                } else {
                    0x7FFA_0000_0000 + slot as u64
                };
                memory.write(address, &value.to_le_bytes()).unwrap();
            }
        }

        resolve_forwarded_imports(
            &mut memory,
            IMAGE_BASE,
            true,
            &original_imports,
            &new_imports,
            &forwardings,
        )
        .unwrap();

        // Ordinal 5 was slot 1 of the original import address table; its slot
        // now holds the resolved address of HOOK.DLL!Install.
        assert_eq!(
            memory.bytes_at(IMAGE_BASE + 0x1060 + 8, 8),
            &resolved_install.to_le_bytes()
        );
    }
}
