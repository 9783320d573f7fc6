//! The two-pass mini-decomposer.
//!
//! Pass 1 walks the DOS header, the NT headers, the section table and every
//! data directory target, materializing each parsed structure as a block and
//! recording every RVA-valued field in a transient reference map. Pass 2
//! resolves the recorded references against the materialized blocks,
//! silently dropping any reference whose endpoint lies in an un-decomposed
//! part of the image - the decomposer is deliberately partial.

use std::collections::BTreeMap;

use log::warn;

use crate::{
    file::{io::read_le_at, PeFile},
    image::{typed::Layout, Block, BlockGraph, BlockId, ImageLayout, Reference, ReferenceKind, Rva},
    pe::{
        DebugDirectory, DosHeader, ExportDirectory, NtHeaders, DATA_DIRECTORY_COUNT,
        DATA_DIRECTORY_NAMES, DIRECTORY_ENTRY_DEBUG, DIRECTORY_ENTRY_EXPORT,
        DIRECTORY_ENTRY_SECURITY,
    },
    Result,
};

const DOS_MAGIC: u16 = 0x5A4D;
const NT_SIGNATURE: u32 = 0x0000_4550;
const PE32_OPTIONAL_HEADER_SIZE: u16 = 224;

struct PendingReference {
    kind: ReferenceKind,
    size: u8,
    destination: Rva,
}

/// Decomposes the PE-structural parts of an image into a block graph.
pub struct MiniDecomposer<'a> {
    file: &'a PeFile,
    references: BTreeMap<Rva, PendingReference>,
}

impl<'a> MiniDecomposer<'a> {
    /// Runs both decomposition passes over `file`.
    ///
    /// Returns the populated layout and the id of the DOS-header block.
    ///
    /// # Errors
    ///
    /// Returns an error if a required header is missing, out of bounds, or
    /// inconsistent with the rest of the image.
    pub fn decompose(file: &'a PeFile) -> Result<(ImageLayout, BlockId)> {
        let mut decomposer = MiniDecomposer {
            file,
            references: BTreeMap::new(),
        };

        let mut graph = BlockGraph::new();
        let dos_header_block = decomposer.parse_headers(&mut graph)?;
        decomposer.parse_data_directories(&mut graph)?;
        decomposer.finalize_references(&mut graph);

        let layout = ImageLayout {
            graph,
            sections: file.sections().to_vec(),
        };

        Ok((layout, dos_header_block))
    }

    /// Records a reference in the transient map. References whose endpoints
    /// are never materialized are dropped by the second pass.
    fn add_reference(&mut self, source: Rva, kind: ReferenceKind, size: u8, destination: Rva) {
        self.references.insert(
            source,
            PendingReference {
                kind,
                size,
                destination,
            },
        );
    }

    /// Pass 1, headers: one block from offset 0 through the end of the NT
    /// headers, and one for the section table.
    fn parse_headers(&mut self, graph: &mut BlockGraph) -> Result<BlockId> {
        let data = self.file.data();

        let mut cursor = 0_usize;
        let dos_magic = read_le_at::<u16>(data, &mut cursor)?;
        if dos_magic != DOS_MAGIC {
            return Err(malformed_pe!("Invalid DOS magic - {:#x}", dos_magic));
        }

        let e_lfanew = self.file.e_lfanew();
        let nt_end = e_lfanew as usize + NtHeaders::SIZE as usize;
        if (e_lfanew as usize) < DosHeader::SIZE as usize || nt_end > data.len() {
            return Err(malformed_pe!(
                "NT headers at {:#x} do not fit in a {} byte file",
                e_lfanew,
                data.len()
            ));
        }

        let mut cursor = e_lfanew as usize;
        let signature = read_le_at::<u32>(data, &mut cursor)?;
        if signature != NT_SIGNATURE {
            return Err(malformed_pe!("Invalid NT signature - {:#x}", signature));
        }

        let mut cursor = e_lfanew as usize + NtHeaders::FILE_SIZE_OF_OPTIONAL_HEADER.offset() as usize;
        let optional_size = read_le_at::<u16>(data, &mut cursor)?;
        if optional_size < PE32_OPTIONAL_HEADER_SIZE {
            return Err(malformed_pe!(
                "Optional header of {} bytes is too small for PE32",
                optional_size
            ));
        }

        let dos_header_block = graph.insert(Block::new(
            0,
            data[..nt_end].to_vec(),
            "DOS and NT Headers",
        ))?;

        self.add_reference(
            DosHeader::E_LFANEW.offset(),
            ReferenceKind::Relative,
            4,
            e_lfanew,
        );

        let mut cursor = e_lfanew as usize + NtHeaders::FILE_NUMBER_OF_SECTIONS.offset() as usize;
        let section_count = read_le_at::<u16>(data, &mut cursor)?;
        let table_start = e_lfanew as usize + 24 + optional_size as usize;
        let table_len = section_count as usize * 40;
        if table_start + table_len > data.len() {
            return Err(malformed_pe!(
                "Section table of {} entries does not fit in the file",
                section_count
            ));
        }

        if table_len > 0 {
            graph.insert(Block::new(
                table_start as Rva,
                data[table_start..table_start + table_len].to_vec(),
                "Section Table",
            ))?;
        }

        Ok(dos_header_block)
    }

    /// Pass 1, directories: one block per non-empty data directory target,
    /// plus the per-entry raw data blocks of the debug directory.
    fn parse_data_directories(&mut self, graph: &mut BlockGraph) -> Result<()> {
        let data = self.file.data();
        let directories = self.file.e_lfanew() + NtHeaders::DATA_DIRECTORY_OFFSET;

        for index in 0..DATA_DIRECTORY_COUNT {
            let entry = directories + (index as u32) * 8;
            let mut cursor = entry as usize;
            let rva = read_le_at::<u32>(data, &mut cursor)?;
            let size = read_le_at::<u32>(data, &mut cursor)?;

            if rva == 0 || size == 0 {
                continue;
            }

            // The security directory is addressed by file offset, not RVA,
            // and carries nothing the canonicalizer patches.
            if index == DIRECTORY_ENTRY_SECURITY {
                continue;
            }

            self.add_reference(entry, ReferenceKind::Relative, 4, rva);

            let Some(block) = self.copy_block(rva, size, DATA_DIRECTORY_NAMES[index]) else {
                continue;
            };
            let block_id = match graph.insert(block) {
                Ok(id) => id,
                Err(error) => {
                    warn!(
                        "Skipping overlapping data directory {} - {}",
                        DATA_DIRECTORY_NAMES[index], error
                    );
                    continue;
                }
            };

            match index {
                DIRECTORY_ENTRY_DEBUG => self.parse_debug_directory(graph, block_id)?,
                DIRECTORY_ENTRY_EXPORT => self.parse_export_directory(graph, block_id),
                _ => {}
            }
        }

        Ok(())
    }

    /// Materializes the raw data of each debug directory entry and records
    /// the references leading to it.
    fn parse_debug_directory(&mut self, graph: &mut BlockGraph, block_id: BlockId) -> Result<()> {
        let block = graph.block(block_id);
        let directory_rva = block.rva();
        let count = block.len() / DebugDirectory::SIZE;

        let mut raw_blocks = Vec::new();
        for index in 0..count {
            let entry = index * DebugDirectory::SIZE;
            let entry_rva = directory_rva + entry;
            let data = block.data();

            let mut cursor = (entry + DebugDirectory::SIZE_OF_DATA.offset()) as usize;
            let size_of_data = read_le_at::<u32>(data, &mut cursor)?;
            let address_of_raw = read_le_at::<u32>(data, &mut cursor)?;

            if address_of_raw == 0 || size_of_data == 0 {
                continue;
            }

            self.add_reference(
                entry_rva + DebugDirectory::ADDRESS_OF_RAW_DATA.offset(),
                ReferenceKind::Relative,
                4,
                address_of_raw,
            );
            self.add_reference(
                entry_rva + DebugDirectory::POINTER_TO_RAW_DATA.offset(),
                ReferenceKind::Relative,
                4,
                address_of_raw,
            );

            if let Some(raw) = self.copy_block(
                address_of_raw,
                size_of_data,
                format!("Debug Data {index}"),
            ) {
                raw_blocks.push(raw);
            }
        }

        for raw in raw_blocks {
            if let Err(error) = graph.insert(raw) {
                warn!("Skipping overlapping debug data block - {error}");
            }
        }

        Ok(())
    }

    /// Records the table references of the export directory. Their
    /// destinations lie in un-decomposed section data, so pass 2 normally
    /// drops them again; they are recorded for completeness.
    fn parse_export_directory(&mut self, graph: &BlockGraph, block_id: BlockId) {
        let block = graph.block(block_id);
        if block.len() < ExportDirectory::SIZE {
            return;
        }

        let fields = [
            ExportDirectory::NAME,
            ExportDirectory::ADDRESS_OF_FUNCTIONS,
            ExportDirectory::ADDRESS_OF_NAMES,
            ExportDirectory::ADDRESS_OF_NAME_ORDINALS,
        ];

        for field in fields {
            let mut cursor = field.offset() as usize;
            let Ok(rva) = read_le_at::<u32>(block.data(), &mut cursor) else {
                continue;
            };
            if rva != 0 {
                self.add_reference(
                    block.rva() + field.offset(),
                    ReferenceKind::Relative,
                    4,
                    rva,
                );
            }
        }
    }

    /// Copies `[rva, rva + size)` out of the image, or returns `None` when
    /// the range has no on-disk bytes.
    fn copy_block(&self, rva: Rva, size: u32, name: impl Into<String>) -> Option<Block> {
        let name = name.into();
        let Ok(offset) = self.file.translate(rva) else {
            warn!("Skipping block '{name}' at {rva:#x} - RVA has no file offset");
            return None;
        };

        let Ok(bytes) = self.file.data_slice(offset as usize, size as usize) else {
            warn!("Skipping block '{name}' at {rva:#x} - {size} bytes exceed the file");
            return None;
        };

        Some(Block::new(rva, bytes.to_vec(), name))
    }

    /// Pass 2: attach every recorded reference whose source and destination
    /// both fall inside materialized blocks; skip the rest silently.
    fn finalize_references(&self, graph: &mut BlockGraph) {
        for (&source, pending) in &self.references {
            let Some(source_block) = graph.containing_block(source, u32::from(pending.size)) else {
                continue;
            };
            let Some(target_block) = graph.containing_block(pending.destination, 1) else {
                continue;
            };

            let source_offset = source - graph.block(source_block).rva();
            let target_offset = pending.destination - graph.block(target_block).rva();
            graph.block_mut(source_block).set_reference(
                source_offset,
                Reference {
                    kind: pending.kind,
                    size: pending.size,
                    target: (target_block, target_offset),
                },
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        image::typed::TypedView,
        pe::{CvInfoPdb70, CV_SIGNATURE_PDB70},
        test::SyntheticPe,
    };

    #[test]
    fn decomposes_headers_and_directories() {
        let image = SyntheticPe::default().with_codeview(true).with_export(true).build();
        let file = PeFile::from_mem(image).unwrap();
        let (layout, dos_header_block) = MiniDecomposer::decompose(&file).unwrap();

        // Headers block covers the DOS header through the NT headers.
        let headers = layout.graph.block(dos_header_block);
        assert_eq!(headers.rva(), 0);
        assert_eq!(headers.len(), 0x80 + 248);

        // Section table, debug directory, debug data, export directory.
        assert_eq!(layout.graph.containing_block(0x178, 80).unwrap(), {
            let id = layout.graph.containing_block(0x178, 1).unwrap();
            assert_eq!(layout.graph.block(id).name(), "Section Table");
            id
        });
        assert!(layout.graph.containing_block(0x2000, 28).is_some());
        assert!(layout.graph.containing_block(0x2020, 24).is_some());
        assert!(layout.graph.containing_block(0x2060, 40).is_some());
        assert_eq!(layout.sections.len(), 2);
    }

    #[test]
    fn typed_walk_reaches_the_codeview_record() {
        let image = SyntheticPe::default().with_codeview(true).build();
        let file = PeFile::from_mem(image).unwrap();
        let (layout, dos_header_block) = MiniDecomposer::decompose(&file).unwrap();

        let dos = TypedView::<DosHeader>::new(&layout.graph, dos_header_block, 0).unwrap();
        let nt = dos
            .dereference::<NtHeaders, _>(DosHeader::E_LFANEW)
            .unwrap();
        assert_eq!(nt.rva(), 0x80);
        assert_eq!(nt.get(NtHeaders::FILE_TIME_DATE_STAMP).unwrap(), 0x5E1A_2B3C);

        let debug = nt
            .dereference::<DebugDirectory, _>(NtHeaders::data_directory_rva(
                DIRECTORY_ENTRY_DEBUG,
            ))
            .unwrap();
        assert_eq!(debug.element_count(), 1);

        let codeview = debug
            .dereference::<CvInfoPdb70, _>(DebugDirectory::POINTER_TO_RAW_DATA)
            .unwrap();
        assert_eq!(
            codeview.get(CvInfoPdb70::CV_SIGNATURE).unwrap(),
            CV_SIGNATURE_PDB70
        );
        assert_eq!(codeview.get(CvInfoPdb70::AGE).unwrap(), 2);
        assert_eq!(
            codeview.get(CvInfoPdb70::SIGNATURE).unwrap(),
            SyntheticPe::TEST_GUID
        );
    }

    #[test]
    fn unmaterialized_destinations_are_dropped() {
        let image = SyntheticPe::default().with_export(true).build();
        let file = PeFile::from_mem(image).unwrap();
        let (layout, _) = MiniDecomposer::decompose(&file).unwrap();

        // The export directory's function table points into un-decomposed
        // section data, so no reference survives pass 2.
        let export = layout.graph.containing_block(0x2060, 40).unwrap();
        let view = TypedView::<ExportDirectory>::new(&layout.graph, export, 0).unwrap();
        assert_ne!(view.get(ExportDirectory::ADDRESS_OF_FUNCTIONS).unwrap(), 0);
        assert!(!view.has_reference(ExportDirectory::ADDRESS_OF_FUNCTIONS));
    }

    #[test]
    fn absent_directories_have_no_reference() {
        let image = SyntheticPe::default().build();
        let file = PeFile::from_mem(image).unwrap();
        let (layout, dos_header_block) = MiniDecomposer::decompose(&file).unwrap();

        let dos = TypedView::<DosHeader>::new(&layout.graph, dos_header_block, 0).unwrap();
        let nt = dos
            .dereference::<NtHeaders, _>(DosHeader::E_LFANEW)
            .unwrap();
        assert!(!nt.has_reference(NtHeaders::data_directory_rva(DIRECTORY_ENTRY_EXPORT)));
        assert!(!nt.has_reference(NtHeaders::data_directory_rva(DIRECTORY_ENTRY_DEBUG)));
    }
}
