//! Canonical MSF 7.0 serialization.
//!
//! The writer lays a container out as a pure function of its stream
//! contents: fixed 4096-byte pages, superblock on page 0, both free page
//! maps on pages 1 and 2, stream data in stream order on ascending
//! contiguous pages, then the directory and its index. Two containers with
//! identical streams therefore serialize to identical bytes, which is what
//! makes the PDB rewrite canonical.

use std::{fs, path::Path};

use crate::{
    file::io::write_le_at,
    pdb::msf::{
        DIRECTORY_INDEX_OFFSET, DIRECTORY_SIZE_OFFSET, FREE_PAGE_MAP_OFFSET, MSF_MAGIC,
        NIL_STREAM_SIZE, PAGE_COUNT_OFFSET, PAGE_SIZE_OFFSET,
    },
    pdb::PdbFile,
    Result,
};

/// The page size of every container this writer produces.
pub const PAGE_SIZE: u32 = 4096;

/// Serializes `pdb` to a fresh container at `path`.
///
/// # Errors
///
/// Returns an error if a stream cannot be read out of its backing, if the
/// container would outgrow a single free-page-map interval, or if the file
/// cannot be written.
pub fn write(path: &Path, pdb: &PdbFile) -> Result<()> {
    // Pages 0 (superblock), 1 and 2 (free page maps) are fixed; stream data
    // begins on page 3.
    let mut output = vec![0_u8; 3 * PAGE_SIZE as usize];

    let mut sizes = Vec::with_capacity(pdb.stream_count());
    let mut page_lists = Vec::with_capacity(pdb.stream_count());
    for index in 0..pdb.stream_count() {
        match pdb.stream(index) {
            Some(stream) => {
                let bytes = stream.read_to_vec()?;
                sizes.push(bytes.len() as u32);
                page_lists.push(append_pages(&mut output, &bytes));
            }
            None => {
                sizes.push(NIL_STREAM_SIZE);
                page_lists.push(Vec::new());
            }
        }
    }

    // Directory: stream count, sizes, page lists.
    let mut directory = Vec::new();
    directory.extend_from_slice(&(pdb.stream_count() as u32).to_le_bytes());
    for size in &sizes {
        directory.extend_from_slice(&size.to_le_bytes());
    }
    for pages in &page_lists {
        for page in pages {
            directory.extend_from_slice(&page.to_le_bytes());
        }
    }

    let directory_pages = append_pages(&mut output, &directory);

    let mut index = Vec::new();
    for page in &directory_pages {
        index.extend_from_slice(&page.to_le_bytes());
    }
    let index_pages = append_pages(&mut output, &index);

    if DIRECTORY_INDEX_OFFSET + index_pages.len() * 4 > PAGE_SIZE as usize {
        return Err(malformed_pdb!(
            "Directory of {} bytes does not fit the superblock index",
            directory.len()
        ));
    }

    let page_count = (output.len() / PAGE_SIZE as usize) as u32;
    if page_count > PAGE_SIZE * 8 {
        return Err(malformed_pdb!(
            "Container of {} pages exceeds one free page map interval",
            page_count
        ));
    }

    // Superblock.
    output[..32].copy_from_slice(&MSF_MAGIC);
    write_le_at(&mut output, PAGE_SIZE_OFFSET, PAGE_SIZE)?;
    write_le_at(&mut output, FREE_PAGE_MAP_OFFSET, 1_u32)?;
    write_le_at(&mut output, PAGE_COUNT_OFFSET, page_count)?;
    write_le_at(&mut output, DIRECTORY_SIZE_OFFSET, directory.len() as u32)?;
    let mut offset = DIRECTORY_INDEX_OFFSET;
    for page in &index_pages {
        write_le_at(&mut output, offset, *page)?;
        offset += 4;
    }

    // Free page maps: a set bit marks a free page. Every page we emitted is
    // in use; the rest of the map is free. Both maps get the same bitmap.
    let mut free_map = vec![0xFF_u8; PAGE_SIZE as usize];
    for page in 0..page_count {
        free_map[(page / 8) as usize] &= !(1 << (page % 8));
    }
    let fpm1 = PAGE_SIZE as usize;
    output[fpm1..fpm1 + PAGE_SIZE as usize].copy_from_slice(&free_map);
    let fpm2 = 2 * PAGE_SIZE as usize;
    output[fpm2..fpm2 + PAGE_SIZE as usize].copy_from_slice(&free_map);

    fs::write(path, output)?;

    Ok(())
}

/// Appends `bytes` to the paged output, zero-padding the final page, and
/// returns the page numbers used. Empty inputs occupy no pages.
fn append_pages(output: &mut Vec<u8>, bytes: &[u8]) -> Vec<u32> {
    let first_page = (output.len() / PAGE_SIZE as usize) as u32;
    let page_count = (bytes.len() as u32).div_ceil(PAGE_SIZE);

    output.extend_from_slice(bytes);
    let padding = (PAGE_SIZE as usize - bytes.len() % PAGE_SIZE as usize) % PAGE_SIZE as usize;
    output.extend(std::iter::repeat(0_u8).take(padding));

    (first_page..first_page + page_count).collect()
}
