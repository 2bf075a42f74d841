//! Parser for the import update mini-language.
//!
//! Each update string is one of:
//!
//! * `dll_name.dll!FunctionName`, an import by name,
//! * `dll_name.dll#ordinal`, an import by ordinal,
//! * `from:to`, forwarding import `from` to the resolved address of `to`
//!   (both sides follow the two forms above).
//!
//! DLL names are upper-cased to form the canonical key, function names keep
//! their given case. The first occurrence of a canonical key wins; later
//! duplicates are dropped so the output order stays reproducible.

use crate::{
    Error, Result,
    imports::{Forwarding, FunctionImport, ImportUpdate},
};

/// Parses a single `dll!function` or `dll#ordinal` specification.
///
/// The ordinal form is tried first: a `#` that splits the string into exactly
/// two non-empty parts with an unsigned-integer second part. Anything else
/// falls back to the name form, which requires exactly one `!`.
fn parse_function_import(s: &str) -> Result<ImportUpdate> {
    let by_ordinal_parts: Vec<&str> = s.split('#').collect();
    if let [dll_name, ordinal] = by_ordinal_parts[..] {
        if !dll_name.is_empty() {
            if let Ok(ordinal) = ordinal.parse::<u32>() {
                let dll_name = dll_name.to_uppercase();
                return Ok(ImportUpdate {
                    import_name: format!("{dll_name}#{ordinal}"),
                    dll_name,
                    import: FunctionImport::ByOrdinal(ordinal),
                });
            }
        }
    }

    let by_name_parts: Vec<&str> = s.split('!').collect();
    if let [dll_name, function_name] = by_name_parts[..] {
        let dll_name = dll_name.to_uppercase();
        return Ok(ImportUpdate {
            import_name: format!("{dll_name}!{function_name}"),
            dll_name,
            import: FunctionImport::ByName {
                rva: 0,
                hint: 0,
                name: function_name.to_string(),
            },
        });
    }

    Err(Error::Format(s.to_string()))
}

/// Turns raw update strings into deduplicated updates and forwardings.
///
/// Both sides of a forwarding are also registered as plain updates, so the
/// merge step knows about every referenced import even when only one side
/// appears standalone.
///
/// # Errors
///
/// Returns [`Error::Format`] naming the offending string when an entry has
/// more than one `:` or either side fails to parse.
pub fn parse_import_updates(
    raw_updates: &[impl AsRef<str>],
) -> Result<(Vec<ImportUpdate>, Vec<Forwarding>)> {
    let mut updates: Vec<ImportUpdate> = Vec::new();
    let mut forwardings: Vec<Forwarding> = Vec::new();

    let mut add_update = |update: ImportUpdate, updates: &mut Vec<ImportUpdate>| {
        if !updates.iter().any(|u| u.import_name == update.import_name) {
            updates.push(update);
        }
    };

    for raw_update in raw_updates {
        let raw_update = raw_update.as_ref();
        let forwarding_parts: Vec<&str> = raw_update.split(':').collect();
        match forwarding_parts[..] {
            [update] => {
                let update = parse_function_import(update)?;
                add_update(update, &mut updates);
            }
            [from, to] => {
                let from = parse_function_import(from)?;
                let to = parse_function_import(to)?;

                let forwarding = Forwarding::new(&from.import_name, &to.import_name);
                if !forwardings.contains(&forwarding) {
                    forwardings.push(forwarding);
                }

                add_update(from, &mut updates);
                add_update(to, &mut updates);
            }
            _ => return Err(Error::Format(raw_update.to_string())),
        }
    }

    Ok((updates, forwardings))
}
