//! Bounds-checked reader for an on-disk PE image.
//!
//! The debugged process hands us a file handle to the image it was created
//! from; everything the engine needs from it flows through [`PeImage`]:
//! pointer width, data-directory lookup and byte reads by RVA. The image is
//! untrusted input, so every access is length-validated against the header
//! fields and the section table before any bytes are interpreted.

use crate::{
    Result,
    error::Error,
    imports::{FunctionImport, FunctionThunk, ModuleImport, ORDINAL_FLAG32, ORDINAL_FLAG64},
};

const DOS_MAGIC: u16 = 0x5A4D;
const PE_SIGNATURE: u32 = 0x0000_4550;
/// Optional-header magic of a 32-bit image.
pub const PE32_MAGIC: u16 = 0x10B;
/// Optional-header magic of a 64-bit image.
pub const PE32PLUS_MAGIC: u16 = 0x20B;
/// File offset of the `e_lfanew` field in the DOS header.
pub const E_LFANEW_OFFSET: u64 = 0x3C;
/// Offset of the optional header relative to the PE signature.
pub const OPTIONAL_HEADER_OFFSET: u64 = 24;
/// Data-directory slot of the import table.
pub const IMPORT_DIRECTORY_INDEX: usize = 1;
/// Data-directory slot of the bound-import table.
pub const BOUND_IMPORT_DIRECTORY_INDEX: usize = 11;
/// Offset of the data-directory array within a PE32 optional header.
pub const DATA_DIRECTORY_OFFSET32: u64 = 96;
/// Offset of the data-directory array within a PE32+ optional header.
pub const DATA_DIRECTORY_OFFSET64: u64 = 112;

const SECTION_HEADER_SIZE: usize = 40;
const DATA_DIRECTORY_COUNT: usize = 16;

fn truncated(what: &str) -> Error {
    Error::InvalidImage(format!("truncated image while reading {what}"))
}

fn read_u16(data: &[u8], offset: usize, what: &str) -> Result<u16> {
    let bytes = data
        .get(offset..offset + 2)
        .ok_or_else(|| truncated(what))?;
    Ok(u16::from_le_bytes([bytes[0], bytes[1]]))
}

fn read_u32(data: &[u8], offset: usize, what: &str) -> Result<u32> {
    let bytes = data
        .get(offset..offset + 4)
        .ok_or_else(|| truncated(what))?;
    Ok(u32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]))
}

fn read_u64(data: &[u8], offset: usize, what: &str) -> Result<u64> {
    let bytes = data
        .get(offset..offset + 8)
        .ok_or_else(|| truncated(what))?;
    let mut word = [0u8; 8];
    word.copy_from_slice(bytes);
    Ok(u64::from_le_bytes(word))
}

/// One data-directory entry: an RVA and a byte size.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct DataDirectory {
    pub rva: u32,
    pub size: u32,
}

#[derive(Debug, Clone, Copy)]
struct Section {
    virtual_address: u32,
    raw_offset: u32,
    raw_size: u32,
}

/// A parsed PE image held in memory, addressable by RVA.
pub struct PeImage {
    data: Vec<u8>,
    is_64bit: bool,
    image_base: u64,
    size_of_headers: u32,
    data_directories: Vec<DataDirectory>,
    sections: Vec<Section>,
}

impl PeImage {
    /// Parses the DOS/NT headers and the section table of `data`.
    pub fn parse(data: Vec<u8>) -> Result<Self> {
        if read_u16(&data, 0, "DOS header")? != DOS_MAGIC {
            return Err(Error::InvalidImage("missing MZ signature".into()));
        }
        let e_lfanew = read_u32(&data, E_LFANEW_OFFSET as usize, "e_lfanew")? as usize;
        if read_u32(&data, e_lfanew, "PE signature")? != PE_SIGNATURE {
            return Err(Error::InvalidImage("missing PE signature".into()));
        }

        let number_of_sections = read_u16(&data, e_lfanew + 6, "file header")? as usize;
        let size_of_optional_header = read_u16(&data, e_lfanew + 20, "file header")? as usize;

        let optional = e_lfanew + OPTIONAL_HEADER_OFFSET as usize;
        let magic = read_u16(&data, optional, "optional header magic")?;
        let is_64bit = match magic {
            PE32_MAGIC => false,
            PE32PLUS_MAGIC => true,
            other => {
                return Err(Error::InvalidImage(format!(
                    "unknown optional header magic {other:#x}"
                )));
            }
        };

        let image_base = if is_64bit {
            read_u64(&data, optional + 24, "image base")?
        } else {
            read_u32(&data, optional + 28, "image base")? as u64
        };
        let size_of_headers = read_u32(&data, optional + 60, "size of headers")?;

        let (count_offset, directory_offset) = if is_64bit {
            (optional + 108, optional + DATA_DIRECTORY_OFFSET64 as usize)
        } else {
            (optional + 92, optional + DATA_DIRECTORY_OFFSET32 as usize)
        };
        let directory_count =
            (read_u32(&data, count_offset, "directory count")? as usize).min(DATA_DIRECTORY_COUNT);

        let mut data_directories = Vec::with_capacity(directory_count);
        for index in 0..directory_count {
            let offset = directory_offset + index * 8;
            data_directories.push(DataDirectory {
                rva: read_u32(&data, offset, "data directory")?,
                size: read_u32(&data, offset + 4, "data directory")?,
            });
        }

        let section_table = optional + size_of_optional_header;
        let mut sections = Vec::with_capacity(number_of_sections);
        for index in 0..number_of_sections {
            let offset = section_table + index * SECTION_HEADER_SIZE;
            sections.push(Section {
                virtual_address: read_u32(&data, offset + 12, "section header")?,
                raw_size: read_u32(&data, offset + 16, "section header")?,
                raw_offset: read_u32(&data, offset + 20, "section header")?,
            });
        }

        Ok(Self {
            data,
            is_64bit,
            image_base,
            size_of_headers,
            data_directories,
            sections,
        })
    }

    /// `true` when the image uses the PE32+ (64-bit) format.
    pub fn is_64bit(&self) -> bool {
        self.is_64bit
    }

    /// Preferred load address from the optional header.
    pub fn image_base(&self) -> u64 {
        self.image_base
    }

    /// The data-directory entry at `index`, if the header carries one.
    pub fn data_directory(&self, index: usize) -> Option<DataDirectory> {
        self.data_directories.get(index).copied()
    }

    /// Maps `rva` to a file offset and the number of file-backed bytes
    /// available from there.
    fn locate(&self, rva: u32) -> Result<(usize, usize)> {
        if rva < self.size_of_headers {
            let offset = rva as usize;
            let available = (self.size_of_headers as usize)
                .min(self.data.len())
                .saturating_sub(offset);
            return Ok((offset, available));
        }
        for section in &self.sections {
            if rva >= section.virtual_address
                && rva - section.virtual_address < section.raw_size
            {
                let delta = (rva - section.virtual_address) as usize;
                let offset = section.raw_offset as usize + delta;
                let available = (section.raw_size as usize - delta)
                    .min(self.data.len().saturating_sub(offset));
                return Ok((offset, available));
            }
        }
        Err(Error::InvalidImage(format!(
            "RVA {rva:#x} maps outside every section"
        )))
    }

    /// Reads exactly `len` bytes at `rva`.
    pub fn read_at_rva(&self, rva: u32, len: usize) -> Result<&[u8]> {
        let (offset, available) = self.locate(rva)?;
        if len > available {
            return Err(Error::InvalidImage(format!(
                "read of {len} bytes at RVA {rva:#x} crosses the section end"
            )));
        }
        Ok(&self.data[offset..offset + len])
    }

    /// Reads a null-terminated ASCII string at `rva`.
    pub fn read_c_string_at_rva(&self, rva: u32) -> Result<String> {
        let (offset, available) = self.locate(rva)?;
        let bytes = &self.data[offset..offset + available];
        let end = bytes.iter().position(|b| *b == 0).ok_or_else(|| {
            Error::InvalidImage(format!("unterminated string at RVA {rva:#x}"))
        })?;
        Ok(String::from_utf8_lossy(&bytes[..end]).into_owned())
    }
}

/// Parses the image's import directory into the import model.
///
/// DLL names are upper-cased on the way in; the thunk lists come from the
/// first-thunk arrays, matching what the loader will resolve in place.
pub fn read_module_imports(image: &PeImage) -> Result<Vec<ModuleImport>> {
    let directory = match image.data_directory(IMPORT_DIRECTORY_INDEX) {
        Some(directory) if directory.rva != 0 => directory,
        _ => return Ok(Vec::new()),
    };

    let mut imports = Vec::new();
    for index in 0u32.. {
        let descriptor = image.read_at_rva(directory.rva + index * 20, 20)?;
        let name_rva = u32::from_le_bytes(descriptor[12..16].try_into().unwrap());
        if name_rva == 0 {
            break;
        }
        let original_first_thunk_rva = u32::from_le_bytes(descriptor[0..4].try_into().unwrap());
        let first_thunk_rva = u32::from_le_bytes(descriptor[16..20].try_into().unwrap());

        let dll_name = image.read_c_string_at_rva(name_rva)?.to_uppercase();
        let first_thunks = read_thunks(image, first_thunk_rva)?;

        imports.push(ModuleImport {
            dll_name,
            dll_name_rva: name_rva,
            original_first_thunk_rva,
            first_thunk_rva,
            first_thunks,
        });
    }

    Ok(imports)
}

fn read_thunks(image: &PeImage, first_thunk_rva: u32) -> Result<Vec<FunctionThunk>> {
    let entry_size: u32 = if image.is_64bit() { 8 } else { 4 };
    let mut thunks = Vec::new();
    let mut rva = first_thunk_rva;

    loop {
        let bytes = image.read_at_rva(rva, entry_size as usize)?;
        let (word, is_ordinal) = if image.is_64bit() {
            let word = u64::from_le_bytes(bytes.try_into().unwrap());
            (word, word & ORDINAL_FLAG64 != 0)
        } else {
            let word = u32::from_le_bytes(bytes.try_into().unwrap());
            (word as u64, word & ORDINAL_FLAG32 != 0)
        };
        if word == 0 {
            break;
        }

        let import = if is_ordinal {
            FunctionImport::ByOrdinal((word & 0xFFFF) as u32)
        } else {
            let name_rva = word as u32;
            let hint_bytes = image.read_at_rva(name_rva, 2)?;
            FunctionImport::ByName {
                rva: name_rva,
                hint: u16::from_le_bytes([hint_bytes[0], hint_bytes[1]]),
                name: image.read_c_string_at_rva(name_rva + 2)?,
            }
        };
        thunks.push(FunctionThunk::new(import));
        rva += entry_size;
    }

    Ok(thunks)
}
