//! Enumerates the build-volatile PE fields and records their patches.
//!
//! The marker walks the decomposed image through typed views, translates
//! each volatile field from RVA to file offset, and inserts one patch per
//! field into the [`PatchAddressSpace`]:
//!
//! 1. the export and resource directory timestamps (skipped when the
//!    directory is absent or the field is already zero),
//! 2. every debug directory entry timestamp,
//! 3. the CodeView record's age and 16-byte signature,
//! 4. the optional header checksum (masked only, stamped later),
//! 5. the file header timestamp.

use log::info;

use crate::{
    canonicalize::{CANONICAL_PDB_AGE, CANONICAL_TIMESTAMP},
    file::PeFile,
    image::{
        typed::TypedView, BlockId, FileOffset, ImageLayout, Rva,
    },
    patch::PatchAddressSpace,
    pe::{
        CvInfoPdb70, DebugDirectory, DosHeader, ExportDirectory, NtHeaders, ResourceDirectory,
        TimestampedDirectory, DATA_DIRECTORY_NAMES, DEBUG_TYPE_CODEVIEW, DIRECTORY_ENTRY_DEBUG,
        DIRECTORY_ENTRY_EXPORT, DIRECTORY_ENTRY_RESOURCE,
    },
    Error::{MissingCodeView, MultipleCodeView, PatchConflict},
    Result,
};

/// File ranges of interest recorded while marking.
#[derive(Debug, Default)]
pub struct MarkedRanges {
    /// Start of the 16-byte CodeView signature patch, when a PDB is in play.
    /// Its bytes are filled in after the content GUID has been derived.
    pub pdb_guid: Option<FileOffset>,
}

/// Marks every volatile field of the decomposed image in `patches`.
///
/// `mark_pdb_fields` selects whether the CodeView age and signature are
/// patched; it is set when a PDB accompanies the image.
///
/// # Errors
///
/// Returns an error if a volatile field cannot be reached through the block
/// graph, if patches conflict, or if the image's CodeView records are not as
/// expected ([`MultipleCodeView`], [`MissingCodeView`]).
pub fn mark_image(
    file: &PeFile,
    layout: &ImageLayout,
    dos_header_block: BlockId,
    mark_pdb_fields: bool,
    patches: &mut PatchAddressSpace,
) -> Result<MarkedRanges> {
    info!("Finding PE fields that need updating.");

    let timestamp = CANONICAL_TIMESTAMP.to_le_bytes().to_vec();
    let mut marked = MarkedRanges::default();

    let dos_header = TypedView::<DosHeader>::new(&layout.graph, dos_header_block, 0)?;
    let nt_headers = dos_header.dereference::<NtHeaders, _>(DosHeader::E_LFANEW)?;

    mark_directory_timestamp::<ExportDirectory>(file, &nt_headers, DIRECTORY_ENTRY_EXPORT, patches)?;
    mark_directory_timestamp::<ResourceDirectory>(
        file,
        &nt_headers,
        DIRECTORY_ENTRY_RESOURCE,
        patches,
    )?;

    // Find the debug directory and update every debug timestamp; within it,
    // there must be at most one CodeView entry pointing at the PDB.
    let mut codeview: Option<TypedView<CvInfoPdb70>> = None;
    let debug_rva_field = NtHeaders::data_directory_rva(DIRECTORY_ENTRY_DEBUG);
    if nt_headers.has_reference(debug_rva_field) {
        let debug_directory = nt_headers.dereference::<DebugDirectory, _>(debug_rva_field)?;

        for index in 0..debug_directory.element_count() {
            let entry = debug_directory.element(index)?;
            mark(
                file,
                entry.field_rva(DebugDirectory::TIME_DATE_STAMP),
                4,
                Some(timestamp.clone()),
                format!("Debug Directory {index} Timestamp"),
                patches,
            )?;

            if entry.get(DebugDirectory::TYPE)? == DEBUG_TYPE_CODEVIEW {
                if codeview.is_some() {
                    return Err(MultipleCodeView);
                }
                codeview =
                    Some(entry.dereference::<CvInfoPdb70, _>(DebugDirectory::POINTER_TO_RAW_DATA)?);
            }
        }
    }

    // The CodeView record holds the PDB age and signature the PDB rewrite
    // must agree with.
    if mark_pdb_fields {
        let Some(codeview) = codeview else {
            return Err(MissingCodeView);
        };

        mark(
            file,
            codeview.field_rva(CvInfoPdb70::AGE),
            4,
            Some(CANONICAL_PDB_AGE.to_le_bytes().to_vec()),
            "PDB Age",
            patches,
        )?;

        let signature_rva = codeview.field_rva(CvInfoPdb70::SIGNATURE);
        let signature_offset = file.translate(signature_rva)?;
        mark(file, signature_rva, 16, None, "PDB GUID", patches)?;
        marked.pdb_guid = Some(signature_offset);
    }

    // The checksum range is masked out of the content hash but only written
    // after stamping, once its input bytes are final.
    mark(
        file,
        nt_headers.field_rva(NtHeaders::OPTIONAL_CHECK_SUM),
        4,
        None,
        "PE Checksum",
        patches,
    )?;

    mark(
        file,
        nt_headers.field_rva(NtHeaders::FILE_TIME_DATE_STAMP),
        4,
        Some(timestamp),
        "PE Timestamp",
        patches,
    )?;

    Ok(marked)
}

/// Marks the `TimeDateStamp` of a data directory of schema `T`.
///
/// A missing directory is not an error, and a timestamp that is already zero
/// is left alone - such images are already canonical in this field.
fn mark_directory_timestamp<T: TimestampedDirectory>(
    file: &PeFile,
    nt_headers: &TypedView<'_, NtHeaders>,
    index: usize,
    patches: &mut PatchAddressSpace,
) -> Result<()> {
    let rva_field = NtHeaders::data_directory_rva(index);
    if !nt_headers.has_reference(rva_field) {
        info!("PE file contains no {}.", DATA_DIRECTORY_NAMES[index]);
        return Ok(());
    }

    let directory = nt_headers.dereference::<T, _>(rva_field)?;
    if directory.get(T::TIME_DATE_STAMP)? == 0 {
        return Ok(());
    }

    mark(
        file,
        directory.field_rva(T::TIME_DATE_STAMP),
        4,
        Some(CANONICAL_TIMESTAMP.to_le_bytes().to_vec()),
        format!("{} Timestamp", DATA_DIRECTORY_NAMES[index]),
        patches,
    )
}

/// Translates `rva` to a file offset and inserts a patch of `size` bytes.
fn mark(
    file: &PeFile,
    rva: Rva,
    size: u32,
    data: Option<Vec<u8>>,
    name: impl Into<String>,
    patches: &mut PatchAddressSpace,
) -> Result<()> {
    let name = name.into();
    let offset = file.translate(rva)?;

    if !patches.insert(offset, size, data, name.clone()) {
        return Err(PatchConflict(format!(
            "Failed to insert patch '{name}' of {size} bytes at file offset {offset:#x}"
        )));
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{image::decomposer::MiniDecomposer, test::SyntheticPe};

    fn mark_synthetic(image: Vec<u8>, mark_pdb_fields: bool) -> Result<(PatchAddressSpace, MarkedRanges)> {
        let file = PeFile::from_mem(image).unwrap();
        let (layout, dos_header_block) = MiniDecomposer::decompose(&file).unwrap();
        let mut patches = PatchAddressSpace::new();
        let marked = mark_image(&file, &layout, dos_header_block, mark_pdb_fields, &mut patches)?;
        Ok((patches, marked))
    }

    #[test]
    fn marks_all_fields_of_a_full_image() {
        let image = SyntheticPe::default().with_codeview(true).with_export(true).build();
        let (patches, marked) = mark_synthetic(image, true).unwrap();

        let ranges: Vec<(u32, u32, String)> = patches
            .iter()
            .map(|patch| (patch.start, patch.len, patch.name.to_string()))
            .collect();

        assert_eq!(
            ranges,
            vec![
                (0x88, 4, "PE Timestamp".to_string()),
                (0xD8, 4, "PE Checksum".to_string()),
                (0x404, 4, "Debug Directory 0 Timestamp".to_string()),
                (0x424, 16, "PDB GUID".to_string()),
                (0x434, 4, "PDB Age".to_string()),
                (0x464, 4, "Export Directory Timestamp".to_string()),
            ]
        );
        assert_eq!(marked.pdb_guid, Some(0x424));

        // Checksum and GUID are masked-only at this point.
        for patch in patches.iter() {
            match patch.name {
                "PE Checksum" | "PDB GUID" => assert!(patch.data.is_none()),
                _ => assert!(patch.data.is_some()),
            }
        }
    }

    #[test]
    fn absent_directories_and_zero_timestamps_are_skipped() {
        let image = SyntheticPe::default().with_file_timestamp(0).build();
        let (patches, marked) = mark_synthetic(image, false).unwrap();

        // No export, resource or debug directory, no PDB fields; the file
        // header timestamp is patched even when it is already zero.
        let names: Vec<&str> = patches.iter().map(|patch| patch.name).collect();
        assert_eq!(names, vec!["PE Timestamp", "PE Checksum"]);
        assert!(marked.pdb_guid.is_none());
    }

    #[test]
    fn zero_export_timestamp_is_left_alone() {
        let image = SyntheticPe::default()
            .with_export(true)
            .with_directory_timestamp(0)
            .build();
        let (patches, _) = mark_synthetic(image, false).unwrap();

        assert!(!patches.iter().any(|patch| patch.name.starts_with("Export")));
    }

    #[test]
    fn missing_codeview_with_pdb_fails() {
        let image = SyntheticPe::default().build();
        assert!(matches!(
            mark_synthetic(image, true),
            Err(MissingCodeView)
        ));
    }

    #[test]
    fn two_codeview_entries_fail() {
        let image = SyntheticPe::default()
            .with_codeview(true)
            .with_second_codeview(true)
            .build();
        assert!(matches!(
            mark_synthetic(image, true),
            Err(MultipleCodeView)
        ));
    }
}
