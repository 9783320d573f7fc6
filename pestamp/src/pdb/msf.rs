//! MSF 7.0 container reading.
//!
//! Layout, per the public format documentation: page 0 holds the superblock
//! (magic, page size, page count, directory size, and the page numbers of
//! the *directory index* pages); the index pages list the pages of the
//! stream directory; the directory lists every stream's size and page
//! numbers. A stream size of `0xFFFF_FFFF` denotes a nil stream.

use std::{fs, path::Path, sync::Arc};

use memmap2::Mmap;

use crate::{file::io::read_le_at, pdb::stream::PdbStream, pdb::PdbFile, Result};

/// The 32-byte magic that opens every MSF 7.0 container.
pub const MSF_MAGIC: [u8; 32] = *b"Microsoft C/C++ MSF 7.00\r\n\x1aDS\0\0\0";

/// Stream size marking a nil stream in the directory.
pub const NIL_STREAM_SIZE: u32 = 0xFFFF_FFFF;

/// File offset of the page size field in the superblock.
pub const PAGE_SIZE_OFFSET: usize = 32;
/// File offset of the active free page map number in the superblock.
pub const FREE_PAGE_MAP_OFFSET: usize = 36;
/// File offset of the page count in the superblock.
pub const PAGE_COUNT_OFFSET: usize = 40;
/// File offset of the directory byte size in the superblock.
pub const DIRECTORY_SIZE_OFFSET: usize = 44;
/// File offset of the directory index page list in the superblock.
pub const DIRECTORY_INDEX_OFFSET: usize = 52;

/// Reads the container at `path` into a [`PdbFile`].
///
/// # Errors
///
/// Returns an error if the file cannot be opened or mapped, or if the
/// superblock, directory, or any page list is inconsistent.
pub fn read(path: &Path) -> Result<PdbFile> {
    let file = fs::File::open(path)?;
    let mapping = Arc::new(unsafe { Mmap::map(&file) }?);
    let data: &[u8] = &mapping;

    if data.len() < DIRECTORY_INDEX_OFFSET || data[..32] != MSF_MAGIC {
        return Err(malformed_pdb!("Invalid MSF magic in {}", path.display()));
    }

    let mut cursor = PAGE_SIZE_OFFSET;
    let page_size = read_le_at::<u32>(data, &mut cursor)?;
    let _free_page_map = read_le_at::<u32>(data, &mut cursor)?;
    let page_count = read_le_at::<u32>(data, &mut cursor)?;
    let directory_size = read_le_at::<u32>(data, &mut cursor)?;

    if !page_size.is_power_of_two() || !(512..=32_768).contains(&page_size) {
        return Err(malformed_pdb!("Invalid MSF page size - {}", page_size));
    }
    if (page_count as u64) * (page_size as u64) > data.len() as u64 {
        return Err(malformed_pdb!(
            "MSF claims {} pages of {} bytes but the file has only {} bytes",
            page_count,
            page_size,
            data.len()
        ));
    }

    // The superblock lists the pages of the directory index; the index
    // lists the pages of the directory itself.
    let directory_pages = directory_size.div_ceil(page_size);
    let index_pages = (directory_pages * 4).div_ceil(page_size);
    if DIRECTORY_INDEX_OFFSET + index_pages as usize * 4 > page_size as usize {
        return Err(malformed_pdb!(
            "MSF directory of {} bytes does not fit the superblock index",
            directory_size
        ));
    }

    let read_page_number = |cursor: &mut usize| -> Result<u32> {
        let page = read_le_at::<u32>(data, cursor)?;
        if page >= page_count {
            return Err(malformed_pdb!(
                "MSF page number {} exceeds the page count {}",
                page,
                page_count
            ));
        }
        Ok(page)
    };

    let mut cursor = DIRECTORY_INDEX_OFFSET;
    let mut directory = Vec::with_capacity((directory_pages as usize) * page_size as usize);
    for _ in 0..index_pages {
        let index_page = read_page_number(&mut cursor)?;

        let mut page_cursor = index_page as usize * page_size as usize;
        let in_this_page =
            (directory_pages as usize - directory.len() / page_size as usize).min(page_size as usize / 4);
        for _ in 0..in_this_page {
            let directory_page = read_page_number(&mut page_cursor)?;
            let start = directory_page as usize * page_size as usize;
            directory.extend_from_slice(&data[start..start + page_size as usize]);
        }
    }
    directory.truncate(directory_size as usize);

    // Parse the directory: stream count, sizes, then the page lists.
    let mut cursor = 0_usize;
    let stream_count = read_le_at::<u32>(&directory, &mut cursor)?;
    if stream_count > 0xFFFF {
        return Err(malformed_pdb!(
            "MSF directory claims {} streams",
            stream_count
        ));
    }

    let mut sizes = Vec::with_capacity(stream_count as usize);
    for _ in 0..stream_count {
        sizes.push(read_le_at::<u32>(&directory, &mut cursor)?);
    }

    let mut pdb = PdbFile::new();
    for size in sizes {
        if size == NIL_STREAM_SIZE {
            pdb.push_stream(None);
            continue;
        }

        let page_count = size.div_ceil(page_size);
        let mut pages = Vec::with_capacity(page_count as usize);
        for _ in 0..page_count {
            let page = read_le_at::<u32>(&directory, &mut cursor)?;
            pages.push(page);
        }

        pdb.push_stream(Some(PdbStream::mapped(
            Arc::clone(&mapping),
            pages,
            page_size,
            size,
        )));
    }

    Ok(pdb)
}
