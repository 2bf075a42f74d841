//! Byte accounting for a new import directory.
//!
//! The calculator walks the merged module list and totals three regions: the
//! thunk arrays, the string pool (DLL names plus hint/name blobs) and the
//! descriptor table. Only modules flagged for rewrite contribute thunk and
//! string bytes; untouched modules cost a descriptor entry and nothing else.

use crate::imports::{FunctionImport, ModuleImport, NewImportDataSize};

/// Reserved bytes per thunk slot in a 32-bit image.
pub const THUNK_ENTRY_SIZE32: u32 = 8;
/// Reserved bytes per thunk slot in a 64-bit image.
pub const THUNK_ENTRY_SIZE64: u32 = 16;
/// Size of one `IMAGE_IMPORT_DESCRIPTOR` entry.
pub const IMPORT_DESCRIPTOR_SIZE: u32 = 20;
/// Size of the hint preceding each imported function name.
pub const IMPORT_HINT_SIZE: u32 = 2;

/// Bytes reserved per thunk slot for the given pointer width.
pub fn thunk_entry_size(is_64bit: bool) -> u32 {
    if is_64bit {
        THUNK_ENTRY_SIZE64
    } else {
        THUNK_ENTRY_SIZE32
    }
}

/// Computes the region sizes a new import directory requires.
///
/// Thunk-array bytes are summed across all modules needing a rewrite; each
/// such module reserves one slot per thunk plus a zero terminator. String
/// bytes cover every unplaced DLL name (`dll_name_rva == 0`) and every
/// unplaced by-name import (`rva == 0`), null terminators included. The
/// descriptor table holds one entry per module plus the all-zero terminator.
pub fn calculate_import_directory_size(
    module_imports: &[ModuleImport],
    is_64bit: bool,
) -> NewImportDataSize {
    let mut size = NewImportDataSize::default();

    for module_import in module_imports {
        if module_import.dll_name_rva == 0 {
            size.strings_array_size += module_import.dll_name.len() as u32 + 1;
        }

        size.import_desc_table_size += IMPORT_DESCRIPTOR_SIZE;

        if module_import.needs_rewrite() {
            size.thunks_array_size +=
                (module_import.first_thunks.len() as u32 + 1) * thunk_entry_size(is_64bit);

            for thunk in &module_import.first_thunks {
                if let FunctionImport::ByName { rva: 0, name, .. } = &thunk.import {
                    size.strings_array_size += IMPORT_HINT_SIZE + name.len() as u32 + 1;
                }
            }
        }
    }

    size.import_desc_table_size += IMPORT_DESCRIPTOR_SIZE;
    size
}
