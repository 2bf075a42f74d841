//! Resolves forwarded imports once the loader has populated the new table.
//!
//! At the time this runs, the loader has resolved every slot of the rewritten
//! import address table, including the forwarding targets. Each forwarding
//! copies the resolved target address from its slot in the new table into the
//! source's slot in the original table, so code bound to the old slot calls
//! the replacement from then on.

use crate::{
    Result, debug,
    error::Error,
    imports::{Forwarding, ModuleImport},
    memory::{PAGE_READWRITE, VirtualMemory},
};

/// Finds the module and slot index an import key refers to.
///
/// The key is in canonical form, `DLL!Function` or `DLL#ordinal`.
fn find_slot<'a>(
    imports: &'a [ModuleImport],
    import_name: &str,
) -> Option<(&'a ModuleImport, usize)> {
    if let Some((dll_name, function_name)) = import_name.split_once('!') {
        let module = imports.iter().find(|m| m.dll_name == dll_name)?;
        Some((module, module.find_thunk_by_name(function_name)?))
    } else {
        let (dll_name, ordinal) = import_name.split_once('#')?;
        let ordinal = ordinal.parse().ok()?;
        let module = imports.iter().find(|m| m.dll_name == dll_name)?;
        Some((module, module.find_thunk_by_ordinal(ordinal)?))
    }
}

fn slot_address(module: &ModuleImport, slot: usize, image_base: u64, word_size: u64) -> u64 {
    image_base + module.first_thunk_rva as u64 + slot as u64 * word_size
}

/// Copies each forwarding's resolved target address over its source slot.
///
/// Sources are looked up in `original_imports`, targets in `new_imports`; the
/// merge step has already validated both, so a miss here is
/// [`Error::Internal`]. Source slots sit in read-only pages once the loader is
/// done, hence the protection dance around each write.
pub fn resolve_forwarded_imports(
    memory: &mut impl VirtualMemory,
    image_base: u64,
    is_64bit: bool,
    original_imports: &[ModuleImport],
    new_imports: &[ModuleImport],
    forwardings: &[Forwarding],
) -> Result<()> {
    let word_size: u64 = if is_64bit { 8 } else { 4 };

    for forwarding in forwardings {
        let (from_module, from_slot) =
            find_slot(original_imports, &forwarding.from).ok_or_else(|| {
                Error::Internal(format!(
                    "forwarding source '{}' not found in the original imports",
                    forwarding.from
                ))
            })?;
        let (to_module, to_slot) = find_slot(new_imports, &forwarding.to).ok_or_else(|| {
            Error::Internal(format!(
                "forwarding target '{}' not found in the new imports",
                forwarding.to
            ))
        })?;

        let from_address = slot_address(from_module, from_slot, image_base, word_size);
        let to_address = slot_address(to_module, to_slot, image_base, word_size);

        let mut resolved = [0u8; 8];
        let resolved = &mut resolved[..word_size as usize];
        memory.read(to_address, resolved)?;

        let previous = memory.protect(from_address, word_size, PAGE_READWRITE)?;
        let result = memory.write(from_address, resolved);
        memory.protect(from_address, word_size, previous)?;
        result?;

        debug!(
            "{} -> {}: slot {:#x} now holds the address from {:#x}",
            forwarding.from, forwarding.to, from_address, to_address
        );
    }

    Ok(())
}
