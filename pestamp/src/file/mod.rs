//! PE file abstraction.
//!
//! This module maps a PE image into an addressable in-memory view and exposes
//! the pieces of it the rest of the crate needs: raw byte access, the parsed
//! section table, translation from relative virtual addresses (RVAs) to file
//! offsets, and the image's CodeView record (the debug-directory entry that
//! names the matching PDB).
//!
//! Validation of the overall image shape (DOS header, PE32 optional header,
//! section table) is delegated to `goblin`; everything that needs exact byte
//! offsets - the mini-decomposer and the field marker - works on the raw
//! bytes through [`crate::image`].
//!
//! # Key Components
//!
//! - [`PeFile`] - the loaded image, backed by a [`Backend`]
//! - [`Physical`] - memory-mapped file backend for disk access
//! - [`Memory`] - in-memory buffer backend, used mostly by tests
//!
//! # Examples
//!
//! ```rust,no_run
//! use pestamp::file::PeFile;
//! use std::path::Path;
//!
//! let file = PeFile::from_file(Path::new("app.exe"))?;
//! let offset = file.translate(0x1000)?;
//! println!("RVA 0x1000 is at file offset 0x{offset:x}");
//! # Ok::<(), pestamp::Error>(())
//! ```

pub mod io;

mod memory;
mod physical;

use std::path::{Path, PathBuf};

use goblin::pe::{optional_header::MAGIC_32, section_table::SectionTable, PE};

use crate::{
    image::{FileOffset, Rva},
    Error::Goblin,
    Result,
};
pub use memory::Memory;
pub use physical::Physical;

/// Backend trait for image data sources.
///
/// Abstracts over the source of PE bytes, allowing both on-disk and in-memory
/// representations behind one interface.
pub trait Backend {
    /// Returns a bounds-checked slice of the data at the given offset and length.
    ///
    /// # Errors
    ///
    /// Returns an error if the requested range is out of bounds.
    fn data_slice(&self, offset: usize, len: usize) -> Result<&[u8]>;

    /// Returns the entire data buffer.
    fn data(&self) -> &[u8];

    /// Returns the total length of the data buffer.
    fn len(&self) -> usize;
}

/// The CodeView record of an image: the link from a PE to its PDB.
#[derive(Debug, Clone)]
pub struct CodeViewInfo {
    /// The 16 byte signature that must match the PDB's header signature.
    pub signature: [u8; 16],
    /// The age recorded in the image; incremented by incremental links.
    pub age: u32,
    /// The PDB path embedded by the linker.
    pub pdb_path: PathBuf,
}

/// A loaded 32-bit PE image.
///
/// Exposes the raw bytes, the section table, and RVA to file offset
/// translation. The header region (everything below `SizeOfHeaders`) is
/// identity-mapped; section data is mapped through the section table.
pub struct PeFile {
    backend: Box<dyn Backend>,
    path: PathBuf,
    e_lfanew: u32,
    size_of_headers: u32,
    sections: Vec<SectionTable>,
    codeview: Option<CodeViewInfo>,
}

impl PeFile {
    /// Loads a PE image from the given path, memory-mapping it.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read, is not a valid PE, or is
    /// not a 32-bit (PE32) image.
    pub fn from_file(path: &Path) -> Result<PeFile> {
        let input = Physical::new(path)?;

        Self::load(input, path.to_path_buf())
    }

    /// Loads a PE image from a memory buffer.
    ///
    /// # Errors
    ///
    /// Returns an error if the data is not a valid 32-bit PE image.
    pub fn from_mem(data: Vec<u8>) -> Result<PeFile> {
        let input = Memory::new(data);

        Self::load(input, PathBuf::new())
    }

    fn load<T: Backend + 'static>(data: T, path: PathBuf) -> Result<PeFile> {
        if data.len() == 0 {
            return Err(malformed_pe!("Provided input was empty"));
        }

        let (e_lfanew, size_of_headers, sections, codeview) = match PE::parse(data.data()) {
            Ok(pe) => {
                let Some(optional_header) = pe.header.optional_header else {
                    return Err(malformed_pe!("File does not have an OptionalHeader"));
                };

                if optional_header.standard_fields.magic != MAGIC_32 {
                    return Err(malformed_pe!(
                        "Only 32-bit (PE32) images are supported - magic is {:#x}",
                        optional_header.standard_fields.magic
                    ));
                }

                let codeview = pe.debug_data.as_ref().and_then(|debug| {
                    debug.codeview_pdb70_debug_info.as_ref().map(|cv| {
                        let name: Vec<u8> = cv
                            .filename
                            .iter()
                            .copied()
                            .take_while(|&byte| byte != 0)
                            .collect();
                        CodeViewInfo {
                            signature: cv.signature,
                            age: cv.age,
                            pdb_path: PathBuf::from(String::from_utf8_lossy(&name).into_owned()),
                        }
                    })
                });

                (
                    pe.header.dos_header.pe_pointer,
                    optional_header.windows_fields.size_of_headers,
                    pe.sections.clone(),
                    codeview,
                )
            }
            Err(error) => return Err(Goblin(error)),
        };

        Ok(PeFile {
            backend: Box::new(data),
            path,
            e_lfanew,
            size_of_headers,
            sections,
            codeview,
        })
    }

    /// Returns the path this image was loaded from; empty for memory-backed images.
    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Returns the total size of the loaded image in bytes.
    #[must_use]
    pub fn len(&self) -> usize {
        self.backend.len()
    }

    /// Returns `true` if the image has a length of zero.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Returns the raw bytes of the image.
    #[must_use]
    pub fn data(&self) -> &[u8] {
        self.backend.data()
    }

    /// Returns a bounds-checked slice of the image at the given offset and length.
    ///
    /// # Errors
    ///
    /// Returns an error if the requested range is out of bounds.
    pub fn data_slice(&self, offset: usize, len: usize) -> Result<&[u8]> {
        self.backend.data_slice(offset, len)
    }

    /// Returns the file offset of the NT headers (`e_lfanew`).
    #[must_use]
    pub fn e_lfanew(&self) -> u32 {
        self.e_lfanew
    }

    /// Returns the `SizeOfHeaders` field of the optional header.
    #[must_use]
    pub fn size_of_headers(&self) -> u32 {
        self.size_of_headers
    }

    /// Returns the parsed section table.
    #[must_use]
    pub fn sections(&self) -> &[SectionTable] {
        &self.sections
    }

    /// Returns the image's CodeView record, if it has one.
    #[must_use]
    pub fn codeview(&self) -> Option<&CodeViewInfo> {
        self.codeview.as_ref()
    }

    /// Translates a relative virtual address to a file offset.
    ///
    /// The header region is identity-mapped. Addresses inside a section map
    /// through `PointerToRawData`; addresses in a section's virtual-only tail
    /// (beyond its raw data) have no on-disk location.
    ///
    /// # Errors
    ///
    /// Returns an error if the RVA does not correspond to any on-disk byte.
    pub fn translate(&self, rva: Rva) -> Result<FileOffset> {
        if rva < self.size_of_headers {
            return Ok(rva);
        }

        for section in &self.sections {
            let virtual_len = section.virtual_size.max(section.size_of_raw_data);
            let Some(section_max) = section.virtual_address.checked_add(virtual_len) else {
                return Err(malformed_pe!(
                    "Section malformed, causing integer overflow - {} + {}",
                    section.virtual_address,
                    virtual_len
                ));
            };

            if rva >= section.virtual_address && rva < section_max {
                let relative = rva - section.virtual_address;
                if relative >= section.size_of_raw_data {
                    return Err(malformed_pe!(
                        "RVA {:#x} lies in the virtual-only tail of a section",
                        rva
                    ));
                }
                return Ok(section.pointer_to_raw_data + relative);
            }
        }

        Err(malformed_pe!(
            "RVA could not be converted to a file offset - {:#x}",
            rva
        ))
    }
}
