//! Reconciles an existing import table with requested updates and forwardings.
//!
//! Modules untouched by any update are carried over verbatim and keep their
//! RVAs, so the remote writer leaves them alone. Touched modules get a freshly
//! built thunk list and their RVAs reset to zero, which marks them for
//! rewriting. Conflicting forwardings fail here, before any remote memory has
//! been touched.

use crate::{
    Error, Result,
    imports::{Forwarding, FunctionImport, FunctionThunk, ImportUpdate, ModuleImport},
};

fn is_forwarded_from(forwardings: &[Forwarding], import_name: &str) -> bool {
    forwardings.iter().any(|f| f.from == import_name)
}

fn is_forwarded_to(forwardings: &[Forwarding], import_name: &str) -> bool {
    forwardings.iter().any(|f| f.to == import_name)
}

/// Builds the new import table from `existing_imports`, `updates` and
/// `forwardings`.
///
/// Within a rebuilt module, retained existing thunks precede newly appended
/// ones; brand-new DLLs come after all existing modules, in the order their
/// updates were first seen. A rebuilt module that ends up with no thunks is
/// dropped entirely.
///
/// # Errors
///
/// Returns [`Error::Conflict`] when an existing import is both a forwarding
/// source and a forwarding target, or when a forwarding source matches no
/// import at all. Returns [`Error::Internal`] if a null thunk shows up in a
/// live thunk list.
pub fn prepare_new_module_imports(
    existing_imports: &[ModuleImport],
    updates: &[ImportUpdate],
    forwardings: &[Forwarding],
) -> Result<Vec<ModuleImport>> {
    let mut imports: Vec<ModuleImport> = Vec::with_capacity(existing_imports.len());

    // DLLs touched by at least one update, in first-seen order.
    let mut pending_dll_names: Vec<&str> = Vec::new();
    for update in updates {
        if !pending_dll_names.contains(&update.dll_name.as_str()) {
            pending_dll_names.push(&update.dll_name);
        }
    }

    for existing_import in existing_imports {
        if !pending_dll_names.contains(&existing_import.dll_name.as_str()) {
            // An existing module without updates survives as-is.
            imports.push(existing_import.clone());
            continue;
        }

        let mut update_import_names: Vec<&str> = updates
            .iter()
            .filter(|u| u.dll_name == existing_import.dll_name)
            .map(|u| u.import_name.as_str())
            .collect();

        let mut new_thunks: Vec<FunctionThunk> = Vec::new();

        for existing_thunk in &existing_import.first_thunks {
            let import_name = existing_thunk
                .import
                .canonical_name(&existing_import.dll_name)
                .ok_or_else(|| {
                    Error::Internal(format!(
                        "null thunk in the live import list of {}",
                        existing_import.dll_name
                    ))
                })?;

            if is_forwarded_from(forwardings, &import_name) {
                if is_forwarded_to(forwardings, &import_name) {
                    return Err(Error::Conflict(format!(
                        "Forwarded import '{import_name}' can't be used as a forwarding target"
                    )));
                }
                // The slot is satisfied by forward resolution, not by table
                // presence, so it is dropped here.
            } else {
                new_thunks.push(existing_thunk.clone());
            }

            update_import_names.retain(|n| *n != import_name);
        }

        for update_import_name in update_import_names {
            if is_forwarded_from(forwardings, update_import_name) {
                return Err(Error::Conflict(format!(
                    "A non-existing import '{update_import_name}' can't be forwarded"
                )));
            }
            let update = updates
                .iter()
                .find(|u| u.import_name == update_import_name)
                .ok_or_else(|| Error::Internal("update lookup after name match".into()))?;
            new_thunks.push(FunctionThunk::new(update.import.clone()));
        }

        if !new_thunks.is_empty() {
            imports.push(ModuleImport {
                original_first_thunk_rva: 0,
                first_thunk_rva: 0,
                first_thunks: new_thunks,
                ..existing_import.clone()
            });
        }

        pending_dll_names.retain(|n| *n != existing_import.dll_name);
    }

    for new_dll_name in pending_dll_names {
        let mut new_thunks: Vec<FunctionThunk> = Vec::new();
        for update in updates.iter().filter(|u| u.dll_name == new_dll_name) {
            if is_forwarded_from(forwardings, &update.import_name) {
                return Err(Error::Conflict(format!(
                    "A non-existing import '{}' can't be forwarded",
                    update.import_name
                )));
            }
            new_thunks.push(FunctionThunk::new(update.import.clone()));
        }

        imports.push(ModuleImport {
            dll_name: new_dll_name.to_string(),
            dll_name_rva: 0,
            original_first_thunk_rva: 0,
            first_thunk_rva: 0,
            first_thunks: new_thunks,
        });
    }

    Ok(imports)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::updates::parse_import_updates;

    fn by_name(rva: u32, hint: u16, name: &str) -> FunctionThunk {
        FunctionThunk::new(FunctionImport::ByName {
            rva,
            hint,
            name: name.into(),
        })
    }

    fn by_ordinal(ordinal: u32) -> FunctionThunk {
        FunctionThunk::new(FunctionImport::ByOrdinal(ordinal))
    }

    fn existing_imports() -> Vec<ModuleImport> {
        vec![
            ModuleImport {
                dll_name: "TEST0.DLL".into(),
                dll_name_rva: 10,
                original_first_thunk_rva: 1,
                first_thunk_rva: 2,
                first_thunks: vec![
                    by_name(10, 11, "Function01"),
                    by_name(18, 12, "Function02"),
                ],
            },
            ModuleImport {
                dll_name: "TEST1.DLL".into(),
                dll_name_rva: 100,
                original_first_thunk_rva: 11,
                first_thunk_rva: 12,
                first_thunks: vec![
                    by_name(1100, 11, "Function11"),
                    by_name(1108, 12, "Function12"),
                    by_name(1116, 13, "Function13"),
                    by_ordinal(13),
                ],
            },
            ModuleImport {
                dll_name: "TEST2.DLL".into(),
                dll_name_rva: 200,
                original_first_thunk_rva: 21,
                first_thunk_rva: 22,
                first_thunks: vec![
                    by_name(2100, 21, "Function21"),
                    by_name(2108, 22, "Function22"),
                ],
            },
        ]
    }

    #[test]
    fn forwarding_a_missing_import_is_a_conflict() {
        let arguments = [
            "Test1.dll!Function13",
            "test1.dll!Function11:tEST2.dll!Function21",
            "test1.DLL!Function18:test3.dll!Function31", // Function18 never existed
            "test1.dll#14:test4.dll#41",                 // ordinal 14 never existed
        ];
        let (updates, forwardings) = parse_import_updates(&arguments).unwrap();
        let result = prepare_new_module_imports(&existing_imports(), &updates, &forwardings);
        assert!(matches!(result, Err(Error::Conflict(_))));
    }

    #[test]
    fn forwarding_source_that_is_also_a_target_is_a_conflict() {
        let arguments = [
            "test1.dll!Function11:tEST2.dll!Function21",
            "Test2.dll!Function21:Test1.dll!Function11",
        ];
        let (updates, forwardings) = parse_import_updates(&arguments).unwrap();
        let result = prepare_new_module_imports(&existing_imports(), &updates, &forwardings);
        assert!(matches!(result, Err(Error::Conflict(_))));
    }

    #[test]
    fn merge_rebuilds_touched_modules_and_keeps_the_rest() {
        let arguments = [
            "Test1.dll!Function13",
            "test2.dll!Function21",
            "Test2.dll!Function21:Test1.dll!Function11",
            "test1.dll#11",
            "test1.dll#13:test2.dll#21",
            "test1.DLL#13:test3.dll#31",
            "test1.DLL!Function12:test3.dll#33",
        ];
        let (updates, forwardings) = parse_import_updates(&arguments).unwrap();
        let new_imports =
            prepare_new_module_imports(&existing_imports(), &updates, &forwardings).unwrap();

        assert_eq!(new_imports.len(), 4);

        // TEST0.DLL was untouched: identical to the original, no rewrite flag.
        assert_eq!(new_imports[0], existing_imports()[0]);
        assert!(!new_imports[0].needs_rewrite());

        // TEST1.DLL: Function12 and ordinal 13 are forwarded away, ordinal 11
        // is appended after the retained thunks.
        assert_eq!(new_imports[1].dll_name, "TEST1.DLL");
        assert_eq!(new_imports[1].dll_name_rva, 100);
        assert!(new_imports[1].needs_rewrite());
        assert_eq!(new_imports[1].original_first_thunk_rva, 0);
        assert_eq!(
            new_imports[1].first_thunks,
            vec![
                by_name(1100, 11, "Function11"),
                by_name(1116, 13, "Function13"),
                by_ordinal(11),
            ]
        );

        // TEST2.DLL: Function21 is forwarded away, ordinal 21 is appended.
        assert_eq!(new_imports[2].dll_name, "TEST2.DLL");
        assert_eq!(new_imports[2].dll_name_rva, 200);
        assert!(new_imports[2].needs_rewrite());
        assert_eq!(
            new_imports[2].first_thunks,
            vec![by_name(2108, 22, "Function22"), by_ordinal(21)]
        );

        // TEST3.DLL is brand new: all RVAs zero, thunks in first-seen order.
        assert_eq!(new_imports[3].dll_name, "TEST3.DLL");
        assert_eq!(new_imports[3].dll_name_rva, 0);
        assert!(new_imports[3].needs_rewrite());
        assert_eq!(
            new_imports[3].first_thunks,
            vec![by_ordinal(31), by_ordinal(33)]
        );
    }

    #[test]
    fn module_emptied_by_forwarding_is_dropped() {
        let existing = vec![ModuleImport {
            dll_name: "TEST2.DLL".into(),
            dll_name_rva: 200,
            original_first_thunk_rva: 21,
            first_thunk_rva: 22,
            first_thunks: vec![by_name(2100, 21, "Function21")],
        }];
        let (updates, forwardings) =
            parse_import_updates(&["test2.dll!Function21:test5.dll!Other"]).unwrap();
        let new_imports = prepare_new_module_imports(&existing, &updates, &forwardings).unwrap();

        // TEST2.DLL lost its only thunk; only the forwarding target remains.
        assert_eq!(new_imports.len(), 1);
        assert_eq!(new_imports[0].dll_name, "TEST5.DLL");
    }

    #[test]
    fn null_thunk_in_a_live_list_is_an_internal_error() {
        let existing = vec![ModuleImport {
            dll_name: "TEST0.DLL".into(),
            dll_name_rva: 10,
            original_first_thunk_rva: 1,
            first_thunk_rva: 2,
            first_thunks: vec![FunctionThunk::new(FunctionImport::Null)],
        }];
        let (updates, forwardings) = parse_import_updates(&["test0.dll!Extra"]).unwrap();
        let result = prepare_new_module_imports(&existing, &updates, &forwardings);
        assert!(matches!(result, Err(Error::Internal(_))));
    }
}
