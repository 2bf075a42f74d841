//! Data structures describing a PE import directory.
//!
//! These types model both directions of the pipeline: the snapshot parsed from
//! the on-disk image (the "original imports") and the table that is about to be
//! serialized into the remote process (the "new imports"). An entry whose
//! `first_thunk_rva` is zero has been modified and not yet committed to remote
//! memory; the remote writer flips that flag by assigning the final RVAs.

/// High bit of a 32-bit thunk word; set when the slot imports by ordinal.
pub const ORDINAL_FLAG32: u32 = 0x8000_0000;
/// High bit of a 64-bit thunk word; set when the slot imports by ordinal.
pub const ORDINAL_FLAG64: u64 = 0x8000_0000_0000_0000;

/// One slot of an import thunk array, before loader resolution.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FunctionImport {
    /// Import resolved by function name.
    ByName {
        /// RVA of the hint/name blob; `0` until the entry has been written
        /// into the remote process.
        rva: u32,
        /// Export-table hint preceding the name on the wire.
        hint: u16,
        /// Function name, case preserved.
        name: String,
    },
    /// Import resolved by export ordinal.
    ByOrdinal(u32),
    /// A parsed zero thunk (array terminator). Never part of a live thunk list.
    Null,
}

impl FunctionImport {
    /// Derives the canonical import key for this entry within `dll_name`,
    /// e.g. `KERNEL32.DLL!CreateFileW` or `KERNEL32.DLL#5`.
    ///
    /// Returns [`None`] for [`FunctionImport::Null`], which has no identity.
    pub fn canonical_name(&self, dll_name: &str) -> Option<String> {
        match self {
            FunctionImport::ByName { name, .. } => Some(format!("{dll_name}!{name}")),
            FunctionImport::ByOrdinal(ordinal) => Some(format!("{dll_name}#{ordinal}")),
            FunctionImport::Null => None,
        }
    }
}

/// A single position in a module's import address table.
///
/// Array position is significant: the loader resolves slot `i` of the first
/// thunk array into slot `i` of the import address table.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FunctionThunk {
    pub import: FunctionImport,
}

impl FunctionThunk {
    pub fn new(import: FunctionImport) -> Self {
        Self { import }
    }
}

/// All imports a PE image pulls from one DLL.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ModuleImport {
    /// Imported DLL name, upper-cased for comparison.
    pub dll_name: String,
    /// RVA of the DLL name string; `0` when the name has not been written yet.
    pub dll_name_rva: u32,
    /// RVA of the original-first-thunk array (import name table).
    pub original_first_thunk_rva: u32,
    /// RVA of the first-thunk array (import address table); `0` marks a module
    /// whose thunks were modified and still need to be written remotely.
    pub first_thunk_rva: u32,
    /// The active thunk list, in slot order.
    pub first_thunks: Vec<FunctionThunk>,
}

impl ModuleImport {
    /// Slot index of the thunk importing `function_name`, if any.
    pub fn find_thunk_by_name(&self, function_name: &str) -> Option<usize> {
        self.first_thunks.iter().position(
            |t| matches!(&t.import, FunctionImport::ByName { name, .. } if name == function_name),
        )
    }

    /// Slot index of the thunk importing `ordinal`, if any.
    pub fn find_thunk_by_ordinal(&self, ordinal: u32) -> Option<usize> {
        self.first_thunks
            .iter()
            .position(|t| matches!(&t.import, FunctionImport::ByOrdinal(o) if *o == ordinal))
    }

    /// `true` when this module's thunk list still has to be serialized into
    /// the remote process.
    pub fn needs_rewrite(&self) -> bool {
        self.first_thunk_rva == 0
    }
}

/// A normalized request to add (or reference) one import.
///
/// `import_name` is the canonical deduplication key: the DLL segment is
/// upper-cased, the function segment keeps its given case.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ImportUpdate {
    pub import_name: String,
    pub dll_name: String,
    pub import: FunctionImport,
}

/// Redirects calls made through the `from` import slot to the resolved
/// address of the `to` import.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Forwarding {
    pub from: String,
    pub to: String,
}

impl Forwarding {
    pub fn new(from: impl Into<String>, to: impl Into<String>) -> Self {
        Self {
            from: from.into(),
            to: to.into(),
        }
    }
}

/// Byte requirements of a new import directory, per region.
///
/// Derived by the size calculator, consumed by the allocator and the writer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct NewImportDataSize {
    /// Bytes of one thunk array region (the directory carries two of them).
    pub thunks_array_size: u32,
    /// Bytes of the string pool (DLL names and hint/name blobs).
    pub strings_array_size: u32,
    /// Bytes of the descriptor table, terminator descriptor included.
    pub import_desc_table_size: u32,
}

impl NewImportDataSize {
    /// Total allocation size: the thunk region is counted twice because both
    /// the first-thunk and original-first-thunk arrays are written.
    pub fn total_size(&self) -> u32 {
        2 * self.thunks_array_size + self.strings_array_size + self.import_desc_table_size
    }
}
