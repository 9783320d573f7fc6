//! PE on-disk structure layouts and constants.
//!
//! The schemas here describe the bit-exact layout of the PE structures the
//! canonicalizer touches, as zero-sized marker types usable with
//! [`crate::image::typed::TypedView`]. Offsets follow the Microsoft PE/COFF
//! specification; only the 32-bit (PE32) optional header shape is declared,
//! which is the only shape the crate accepts.

pub mod checksum;

use crate::image::typed::{Field, Layout};

/// Number of entries in the optional header's data directory array.
pub const DATA_DIRECTORY_COUNT: usize = 16;

/// Index of the export data directory.
pub const DIRECTORY_ENTRY_EXPORT: usize = 0;
/// Index of the resource data directory.
pub const DIRECTORY_ENTRY_RESOURCE: usize = 2;
/// Index of the security (Authenticode) data directory. Its `VirtualAddress`
/// is a file offset, not an RVA.
pub const DIRECTORY_ENTRY_SECURITY: usize = 4;
/// Index of the debug data directory.
pub const DIRECTORY_ENTRY_DEBUG: usize = 6;

/// Debug names for the data directories, by index.
pub const DATA_DIRECTORY_NAMES: [&str; DATA_DIRECTORY_COUNT] = [
    "Export Directory",
    "Import Directory",
    "Resource Directory",
    "Exception Directory",
    "Security Directory",
    "Base Relocation Directory",
    "Debug Directory",
    "Architecture Directory",
    "Global Pointer Directory",
    "TLS Directory",
    "Load Config Directory",
    "Bound Import Directory",
    "Import Address Table",
    "Delay Import Directory",
    "COM Descriptor Directory",
    "Reserved Directory",
];

/// `IMAGE_DEBUG_TYPE_CODEVIEW`: the debug directory entry type that names
/// the matching PDB.
pub const DEBUG_TYPE_CODEVIEW: u32 = 2;

/// The `RSDS` magic of a PDB 7.0 CodeView record.
pub const CV_SIGNATURE_PDB70: u32 = 0x5344_5352;

/// `IMAGE_DOS_HEADER`.
pub struct DosHeader;

impl DosHeader {
    /// The `MZ` magic.
    pub const E_MAGIC: Field<u16> = Field::new(0);
    /// File offset of the NT headers.
    pub const E_LFANEW: Field<u32> = Field::new(60);
}

impl Layout for DosHeader {
    const SIZE: u32 = 64;
}

/// `IMAGE_NT_HEADERS` for a PE32 image: signature, file header, and the
/// 224-byte optional header including all 16 data directory entries.
pub struct NtHeaders;

impl NtHeaders {
    /// The `PE\0\0` signature.
    pub const SIGNATURE: Field<u32> = Field::new(0);
    /// `FileHeader.Machine`.
    pub const FILE_MACHINE: Field<u16> = Field::new(4);
    /// `FileHeader.NumberOfSections`.
    pub const FILE_NUMBER_OF_SECTIONS: Field<u16> = Field::new(6);
    /// `FileHeader.TimeDateStamp`.
    pub const FILE_TIME_DATE_STAMP: Field<u32> = Field::new(8);
    /// `FileHeader.SizeOfOptionalHeader`.
    pub const FILE_SIZE_OF_OPTIONAL_HEADER: Field<u16> = Field::new(20);
    /// `OptionalHeader.Magic` (0x10B for PE32).
    pub const OPTIONAL_MAGIC: Field<u16> = Field::new(24);
    /// `OptionalHeader.SizeOfHeaders`.
    pub const OPTIONAL_SIZE_OF_HEADERS: Field<u32> = Field::new(84);
    /// `OptionalHeader.CheckSum`.
    pub const OPTIONAL_CHECK_SUM: Field<u32> = Field::new(88);

    /// Byte offset of the data directory array within the NT headers.
    pub const DATA_DIRECTORY_OFFSET: u32 = 120;

    /// `OptionalHeader.DataDirectory[index].VirtualAddress`.
    #[must_use]
    pub const fn data_directory_rva(index: usize) -> Field<u32> {
        Field::new(Self::DATA_DIRECTORY_OFFSET + (index as u32) * 8)
    }

    /// `OptionalHeader.DataDirectory[index].Size`.
    #[must_use]
    pub const fn data_directory_size(index: usize) -> Field<u32> {
        Field::new(Self::DATA_DIRECTORY_OFFSET + (index as u32) * 8 + 4)
    }
}

impl Layout for NtHeaders {
    const SIZE: u32 = 248;
}

/// `IMAGE_EXPORT_DIRECTORY`.
pub struct ExportDirectory;

impl ExportDirectory {
    /// Link time of the exporting module.
    pub const TIME_DATE_STAMP: Field<u32> = Field::new(4);
    /// RVA of the exporting module's name string.
    pub const NAME: Field<u32> = Field::new(12);
    /// RVA of the export address table.
    pub const ADDRESS_OF_FUNCTIONS: Field<u32> = Field::new(28);
    /// RVA of the export name pointer table.
    pub const ADDRESS_OF_NAMES: Field<u32> = Field::new(32);
    /// RVA of the export ordinal table.
    pub const ADDRESS_OF_NAME_ORDINALS: Field<u32> = Field::new(36);
}

impl Layout for ExportDirectory {
    const SIZE: u32 = 40;
}

/// `IMAGE_RESOURCE_DIRECTORY` (the root directory header only).
pub struct ResourceDirectory;

impl ResourceDirectory {
    /// Creation time written by the resource compiler.
    pub const TIME_DATE_STAMP: Field<u32> = Field::new(4);
}

impl Layout for ResourceDirectory {
    const SIZE: u32 = 16;
}

/// One `IMAGE_DEBUG_DIRECTORY` entry. The debug data directory is an array
/// of these; its element count is the directory size divided by this size.
pub struct DebugDirectory;

impl DebugDirectory {
    /// Time the debug data was created.
    pub const TIME_DATE_STAMP: Field<u32> = Field::new(4);
    /// The format of the pointed-to debug data.
    pub const TYPE: Field<u32> = Field::new(12);
    /// Size of the pointed-to debug data.
    pub const SIZE_OF_DATA: Field<u32> = Field::new(16);
    /// RVA of the debug data, when mapped.
    pub const ADDRESS_OF_RAW_DATA: Field<u32> = Field::new(20);
    /// File offset of the debug data.
    pub const POINTER_TO_RAW_DATA: Field<u32> = Field::new(24);
}

impl Layout for DebugDirectory {
    const SIZE: u32 = 28;
}

/// `CV_INFO_PDB70`: the CodeView record naming the matching PDB. The fixed
/// part is followed by the NUL-terminated PDB path.
pub struct CvInfoPdb70;

impl CvInfoPdb70 {
    /// The `RSDS` magic.
    pub const CV_SIGNATURE: Field<u32> = Field::new(0);
    /// The 16-byte signature that must match the PDB's.
    pub const SIGNATURE: Field<[u8; 16]> = Field::new(4);
    /// The age that must match the PDB's.
    pub const AGE: Field<u32> = Field::new(20);
}

impl Layout for CvInfoPdb70 {
    const SIZE: u32 = 24;
}

/// Directories whose structure embeds a `TimeDateStamp` the linker fills
/// with the build time.
pub trait TimestampedDirectory: Layout {
    /// The directory's `TimeDateStamp` field.
    const TIME_DATE_STAMP: Field<u32>;
}

impl TimestampedDirectory for ExportDirectory {
    const TIME_DATE_STAMP: Field<u32> = ExportDirectory::TIME_DATE_STAMP;
}

impl TimestampedDirectory for ResourceDirectory {
    const TIME_DATE_STAMP: Field<u32> = ResourceDirectory::TIME_DATE_STAMP;
}
