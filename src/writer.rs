//! Serializes the merged import table into the target process.
//!
//! The allocated block is filled in four regions, in address order: the
//! first-thunk arrays, the original-first-thunk arrays (an identical copy the
//! loader leaves unresolved), the descriptor table and the string pool. The
//! region boundaries come from the size calculator, so the writer never
//! outgrows the allocation.
//!
//! Once the block is populated, [`patch_data_directories`] points the image's
//! import data-directory entry at the new descriptor table and clears the
//! bound-import entry, which is stale the moment the table moves.

use crate::{
    Result, debug,
    error::Error,
    image::{
        BOUND_IMPORT_DIRECTORY_INDEX, DATA_DIRECTORY_OFFSET32, DATA_DIRECTORY_OFFSET64,
        E_LFANEW_OFFSET, IMPORT_DIRECTORY_INDEX, OPTIONAL_HEADER_OFFSET, PE32_MAGIC,
        PE32PLUS_MAGIC,
    },
    imports::{FunctionImport, ModuleImport, ORDINAL_FLAG32, ORDINAL_FLAG64},
    layout::{IMPORT_DESCRIPTOR_SIZE, calculate_import_directory_size},
    memory::{PAGE_READWRITE, VirtualMemory},
};

/// Location of the freshly written descriptor table, in data-directory form.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct NewImportDirectory {
    pub rva: u32,
    pub size: u32,
}

fn read_u16_remote(memory: &impl VirtualMemory, address: u64) -> Result<u16> {
    let mut bytes = [0u8; 2];
    memory.read(address, &mut bytes)?;
    Ok(u16::from_le_bytes(bytes))
}

fn read_u32_remote(memory: &impl VirtualMemory, address: u64) -> Result<u32> {
    let mut bytes = [0u8; 4];
    memory.read(address, &mut bytes)?;
    Ok(u32::from_le_bytes(bytes))
}

/// Writes `data` through a temporary `PAGE_READWRITE` window, restoring the
/// previous protection afterwards.
fn write_protected(memory: &mut impl VirtualMemory, address: u64, data: &[u8]) -> Result<()> {
    let previous = memory.protect(address, data.len() as u64, PAGE_READWRITE)?;
    let result = memory.write(address, data);
    memory.protect(address, data.len() as u64, previous)?;
    result
}

/// Fills the block at `new_imports_addr` with the new import directory and
/// assigns the final RVAs back into `module_imports`.
///
/// Modules whose `first_thunk_rva` is non-zero are untouched: their existing
/// arrays and strings are referenced from the new descriptor table but never
/// rewritten. Returns the descriptor table's RVA and size, ready for
/// [`patch_data_directories`].
pub fn write_import_directory(
    memory: &mut impl VirtualMemory,
    new_imports_addr: u64,
    image_base: u64,
    is_64bit: bool,
    module_imports: &mut [ModuleImport],
) -> Result<NewImportDirectory> {
    let size = calculate_import_directory_size(module_imports, is_64bit);
    let base_rva = (new_imports_addr - image_base) as u32;

    // Region cursors, in block order.
    let mut first_thunks_rva = base_rva;
    let mut original_first_thunks_rva = base_rva + size.thunks_array_size;
    let descriptors_rva = base_rva + 2 * size.thunks_array_size;
    let mut strings_rva = descriptors_rva + size.import_desc_table_size;

    let thunk_word_size: u32 = if is_64bit { 8 } else { 4 };

    for module_import in module_imports.iter_mut() {
        if !module_import.needs_rewrite() {
            continue;
        }

        let mut words: Vec<u64> = Vec::with_capacity(module_import.first_thunks.len() + 1);
        for thunk in &mut module_import.first_thunks {
            let word = match &mut thunk.import {
                FunctionImport::ByName { rva, hint, name } => {
                    if *rva == 0 {
                        // Place the hint/name blob in the string pool.
                        memory.write(image_base + strings_rva as u64, &hint.to_le_bytes())?;
                        let mut name_bytes = name.clone().into_bytes();
                        name_bytes.push(0);
                        memory.write(image_base + strings_rva as u64 + 2, &name_bytes)?;
                        *rva = strings_rva;
                        strings_rva += 2 + name_bytes.len() as u32;
                    }
                    *rva as u64
                }
                FunctionImport::ByOrdinal(ordinal) => {
                    if is_64bit {
                        ORDINAL_FLAG64 | *ordinal as u64
                    } else {
                        (ORDINAL_FLAG32 | *ordinal) as u64
                    }
                }
                FunctionImport::Null => {
                    return Err(Error::Internal(format!(
                        "null thunk in the live import list of {}",
                        module_import.dll_name
                    )));
                }
            };
            words.push(word);
        }
        words.push(0); // array terminator

        let mut array = Vec::with_capacity(words.len() * thunk_word_size as usize);
        for word in &words {
            if is_64bit {
                array.extend_from_slice(&word.to_le_bytes());
            } else {
                array.extend_from_slice(&(*word as u32).to_le_bytes());
            }
        }
        memory.write(image_base + first_thunks_rva as u64, &array)?;
        memory.write(image_base + original_first_thunks_rva as u64, &array)?;

        if module_import.dll_name_rva == 0 {
            let mut name_bytes = module_import.dll_name.clone().into_bytes();
            name_bytes.push(0);
            memory.write(image_base + strings_rva as u64, &name_bytes)?;
            module_import.dll_name_rva = strings_rva;
            strings_rva += name_bytes.len() as u32;
        }

        module_import.first_thunk_rva = first_thunks_rva;
        module_import.original_first_thunk_rva = original_first_thunks_rva;
        debug!(
            "{}: thunk arrays written at RVA {:#x}/{:#x}",
            module_import.dll_name, first_thunks_rva, original_first_thunks_rva
        );

        first_thunks_rva += array.len() as u32;
        original_first_thunks_rva += array.len() as u32;
    }

    // Descriptor table: one entry per module plus the all-zero terminator.
    let mut descriptors =
        Vec::with_capacity((module_imports.len() + 1) * IMPORT_DESCRIPTOR_SIZE as usize);
    for module_import in module_imports.iter() {
        descriptors.extend_from_slice(&module_import.original_first_thunk_rva.to_le_bytes());
        descriptors.extend_from_slice(&0u32.to_le_bytes()); // TimeDateStamp
        descriptors.extend_from_slice(&0u32.to_le_bytes()); // ForwarderChain
        descriptors.extend_from_slice(&module_import.dll_name_rva.to_le_bytes());
        descriptors.extend_from_slice(&module_import.first_thunk_rva.to_le_bytes());
    }
    descriptors.extend_from_slice(&[0u8; IMPORT_DESCRIPTOR_SIZE as usize]);
    memory.write(image_base + descriptors_rva as u64, &descriptors)?;

    Ok(NewImportDirectory {
        rva: descriptors_rva,
        size: size.import_desc_table_size,
    })
}

/// Repoints the loaded image's import data-directory entry at `directory` and
/// clears the bound-import entry.
///
/// The header pages are read-only in the target, so each entry is patched
/// through a temporary protection change.
pub fn patch_data_directories(
    memory: &mut impl VirtualMemory,
    image_base: u64,
    directory: &NewImportDirectory,
) -> Result<()> {
    let e_lfanew = read_u32_remote(memory, image_base + E_LFANEW_OFFSET)?;
    let optional = image_base + e_lfanew as u64 + OPTIONAL_HEADER_OFFSET;

    let magic = read_u16_remote(memory, optional)?;
    let (count_offset, directory_offset) = match magic {
        PE32_MAGIC => (92, DATA_DIRECTORY_OFFSET32),
        PE32PLUS_MAGIC => (108, DATA_DIRECTORY_OFFSET64),
        other => {
            return Err(Error::InvalidImage(format!(
                "unknown optional header magic {other:#x} in the loaded image"
            )));
        }
    };
    let directory_count = read_u32_remote(memory, optional + count_offset)?;
    let directories = optional + directory_offset;

    let mut entry = [0u8; 8];
    entry[..4].copy_from_slice(&directory.rva.to_le_bytes());
    entry[4..].copy_from_slice(&directory.size.to_le_bytes());
    write_protected(
        memory,
        directories + IMPORT_DIRECTORY_INDEX as u64 * 8,
        &entry,
    )?;
    debug!(
        "import directory repointed to RVA {:#x} ({} bytes)",
        directory.rva, directory.size
    );

    // Pre-bound addresses no longer match the rewritten table.
    if directory_count > BOUND_IMPORT_DIRECTORY_INDEX as u32 {
        write_protected(
            memory,
            directories + BOUND_IMPORT_DIRECTORY_INDEX as u64 * 8,
            &[0u8; 8],
        )?;
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::imports::FunctionThunk;
    use crate::memory::testing::MockMemory;

    const IMAGE_BASE: u64 = 0x1_4000_0000;
    const BLOCK_RVA: u32 = 0x20000;

    fn by_name(rva: u32, hint: u16, name: &str) -> FunctionThunk {
        FunctionThunk::new(FunctionImport::ByName {
            rva,
            hint,
            name: name.into(),
        })
    }

    fn modules() -> Vec<ModuleImport> {
        vec![
            ModuleImport {
                dll_name: "TEST0.DLL".into(),
                dll_name_rva: 0x100,
                original_first_thunk_rva: 0x180,
                first_thunk_rva: 0x200,
                first_thunks: vec![by_name(0x300, 1, "Alpha")],
            },
            ModuleImport {
                dll_name: "NEW.DLL".into(),
                dll_name_rva: 0,
                original_first_thunk_rva: 0,
                first_thunk_rva: 0,
                first_thunks: vec![
                    by_name(0, 0, "Beta"),
                    FunctionThunk::new(FunctionImport::ByOrdinal(7)),
                ],
            },
        ]
    }

    #[test]
    fn writes_the_directory_and_assigns_final_rvas() {
        let block = IMAGE_BASE + BLOCK_RVA as u64;
        let mut memory = MockMemory::with_window(block, 0x1000);
        let mut modules = modules();

        let directory =
            write_import_directory(&mut memory, block, IMAGE_BASE, true, &mut modules).unwrap();

        // Region layout: 48 thunk bytes twice, then 60 descriptor bytes.
        assert_eq!(
            directory,
            NewImportDirectory {
                rva: BLOCK_RVA + 96,
                size: 60
            }
        );

        // The untouched module kept its RVAs.
        assert_eq!(modules[0].first_thunk_rva, 0x200);
        assert_eq!(modules[0].original_first_thunk_rva, 0x180);
        assert_eq!(modules[0].dll_name_rva, 0x100);

        // The rewritten module got the block's region starts.
        assert_eq!(modules[1].first_thunk_rva, BLOCK_RVA);
        assert_eq!(modules[1].original_first_thunk_rva, BLOCK_RVA + 48);
        let strings_rva = BLOCK_RVA + 96 + 60;
        assert_eq!(
            modules[1].first_thunks[0].import,
            FunctionImport::ByName {
                rva: strings_rva,
                hint: 0,
                name: "Beta".into(),
            }
        );
        // DLL name follows the hint/name blob (2 + 4 + 1 bytes).
        assert_eq!(modules[1].dll_name_rva, strings_rva + 7);

        // Both thunk arrays carry the same words: name RVA, ordinal, terminator.
        let mut expected = Vec::new();
        expected.extend_from_slice(&(strings_rva as u64).to_le_bytes());
        expected.extend_from_slice(&(ORDINAL_FLAG64 | 7).to_le_bytes());
        expected.extend_from_slice(&0u64.to_le_bytes());
        assert_eq!(memory.bytes_at(block, 24), &expected[..]);
        assert_eq!(memory.bytes_at(block + 48, 24), &expected[..]);

        // String pool: hint 0, "Beta\0", "NEW.DLL\0".
        assert_eq!(
            memory.bytes_at(IMAGE_BASE + strings_rva as u64, 15),
            b"\x00\x00Beta\0NEW.DLL\0"
        );

        // Descriptor table: TEST0.DLL entry, NEW.DLL entry, zero terminator.
        let mut expected = Vec::new();
        for module in &modules {
            expected.extend_from_slice(&module.original_first_thunk_rva.to_le_bytes());
            expected.extend_from_slice(&[0u8; 8]);
            expected.extend_from_slice(&module.dll_name_rva.to_le_bytes());
            expected.extend_from_slice(&module.first_thunk_rva.to_le_bytes());
        }
        expected.extend_from_slice(&[0u8; 20]);
        assert_eq!(
            memory.bytes_at(IMAGE_BASE + directory.rva as u64, 60),
            &expected[..]
        );
    }

    #[test]
    fn thunk_words_are_32_bit_for_pe32_targets() {
        let block = IMAGE_BASE + BLOCK_RVA as u64;
        let mut memory = MockMemory::with_window(block, 0x1000);
        let mut modules = vec![ModuleImport {
            dll_name: "NEW.DLL".into(),
            dll_name_rva: 0,
            original_first_thunk_rva: 0,
            first_thunk_rva: 0,
            first_thunks: vec![
                by_name(0, 3, "Beta"),
                FunctionThunk::new(FunctionImport::ByOrdinal(7)),
            ],
        }];

        let directory =
            write_import_directory(&mut memory, block, IMAGE_BASE, false, &mut modules).unwrap();

        // 24 thunk bytes twice (3 slots at 8 reserved bytes each), 40
        // descriptor bytes, then the string pool.
        assert_eq!(
            directory,
            NewImportDirectory {
                rva: BLOCK_RVA + 48,
                size: 40
            }
        );
        let strings_rva = BLOCK_RVA + 48 + 40;

        let mut expected = Vec::new();
        expected.extend_from_slice(&strings_rva.to_le_bytes());
        expected.extend_from_slice(&(ORDINAL_FLAG32 | 7).to_le_bytes());
        expected.extend_from_slice(&0u32.to_le_bytes());
        assert_eq!(memory.bytes_at(block, 12), &expected[..]);
        assert_eq!(memory.bytes_at(block + 24, 12), &expected[..]);
        assert_eq!(
            memory.bytes_at(IMAGE_BASE + strings_rva as u64, 7),
            b"\x03\x00Beta\0"
        );
    }

    #[test]
    fn patches_import_and_bound_import_entries() {
        let mut memory = MockMemory::with_window(IMAGE_BASE, 0x400);
        // Minimal loaded header: e_lfanew, PE32+ magic, 16 directories, and a
        // stale bound-import entry.
        let e_lfanew = 0x80u64;
        let optional = IMAGE_BASE + e_lfanew + 24;
        memory
            .write(IMAGE_BASE + E_LFANEW_OFFSET, &(e_lfanew as u32).to_le_bytes())
            .unwrap();
        memory
            .write(optional, &PE32PLUS_MAGIC.to_le_bytes())
            .unwrap();
        memory.write(optional + 108, &16u32.to_le_bytes()).unwrap();
        let directories = optional + 112;
        memory
            .write(directories + 11 * 8, &[0xAAu8; 8])
            .unwrap();

        let directory = NewImportDirectory {
            rva: 0x20060,
            size: 60,
        };
        patch_data_directories(&mut memory, IMAGE_BASE, &directory).unwrap();

        let mut expected = Vec::new();
        expected.extend_from_slice(&0x20060u32.to_le_bytes());
        expected.extend_from_slice(&60u32.to_le_bytes());
        assert_eq!(memory.bytes_at(directories + 8, 8), &expected[..]);
        assert_eq!(memory.bytes_at(directories + 11 * 8, 8), &[0u8; 8]);

        // Each patched entry was unprotected and then restored.
        assert_eq!(
            memory.protections,
            vec![
                (directories + 8, 8, PAGE_READWRITE),
                (directories + 8, 8, 0x02),
                (directories + 11 * 8, 8, PAGE_READWRITE),
                (directories + 11 * 8, 8, 0x02),
            ]
        );
    }

    #[test]
    fn unknown_loaded_header_magic_is_rejected() {
        let mut memory = MockMemory::with_window(IMAGE_BASE, 0x400);
        let e_lfanew = 0x80u64;
        memory
            .write(IMAGE_BASE + E_LFANEW_OFFSET, &(e_lfanew as u32).to_le_bytes())
            .unwrap();
        memory
            .write(IMAGE_BASE + e_lfanew + 24, &0x1234u16.to_le_bytes())
            .unwrap();

        let directory = NewImportDirectory { rva: 0x1000, size: 40 };
        let result = patch_data_directories(&mut memory, IMAGE_BASE, &directory);
        assert!(matches!(result, Err(Error::InvalidImage(_))));
    }
}
