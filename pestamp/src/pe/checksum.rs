//! PE optional-header checksum computation.
//!
//! The checksum covers the whole file with the checksum field itself treated
//! as zero, so it can only be stamped after every other patch has been
//! written. [`update_file_checksum`] is called as the last step of the image
//! commit.

use std::{
    fs,
    io::{Seek, SeekFrom, Write},
    path::Path,
};

use crate::{
    file::io::{read_le_at, write_le_at},
    Result,
};

/// Recomputes the optional header checksum of the image at `path` and writes
/// it in place.
///
/// # Errors
///
/// Returns an error if the file cannot be read or rewritten, or if its
/// headers are too damaged to locate the checksum field.
pub fn update_file_checksum(path: &Path) -> Result<()> {
    let data = fs::read(path)?;
    let offset = checksum_offset(&data)?;
    let value = compute_checksum(&data, offset);

    let mut encoded = [0_u8; 4];
    write_le_at(&mut encoded, 0, value)?;

    let mut file = fs::OpenOptions::new().write(true).open(path)?;
    file.seek(SeekFrom::Start(offset as u64))?;
    file.write_all(&encoded)?;

    Ok(())
}

/// Locates the `OptionalHeader.CheckSum` field.
fn checksum_offset(data: &[u8]) -> Result<usize> {
    let mut cursor = 60_usize;
    let e_lfanew = read_le_at::<u32>(data, &mut cursor)? as usize;

    let mut cursor = e_lfanew;
    let signature = read_le_at::<u32>(data, &mut cursor)?;
    if signature != 0x0000_4550 {
        return Err(malformed_pe!(
            "NT signature missing while updating checksum - found {:#x}",
            signature
        ));
    }

    // Signature + file header + 64 bytes into the optional header.
    let offset = e_lfanew + 88;
    if offset + 4 > data.len() {
        return Err(malformed_pe!("Checksum field lies outside the file"));
    }

    Ok(offset)
}

/// Computes the PE checksum of `data`, with the four bytes at
/// `checksum_offset` treated as zero: a 16-bit ones-complement-style sum
/// with carry folding, plus the file length.
fn compute_checksum(data: &[u8], checksum_offset: usize) -> u32 {
    let mut sum: u32 = 0;

    let mut offset = 0;
    while offset < data.len() {
        let word = if offset >= checksum_offset && offset < checksum_offset + 4 {
            0
        } else {
            let low = u32::from(data[offset]);
            let high = if offset + 1 < data.len() {
                u32::from(data[offset + 1])
            } else {
                0
            };
            low | (high << 8)
        };

        sum += word;
        sum = (sum & 0xFFFF) + (sum >> 16);
        offset += 2;
    }

    sum = (sum & 0xFFFF) + (sum >> 16);
    sum + data.len() as u32
}
