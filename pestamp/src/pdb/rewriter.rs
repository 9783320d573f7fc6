//! Field-level PDB normalization.
//!
//! Loads nothing itself - it operates on a [`PdbFile`] already in memory,
//! replacing the old directory with a nil stream and rewriting the variable
//! fields of the header info, DBI, symbol record, and public symbol info
//! streams. Streams are coerced to byte-buffer backings on first write;
//! every stream the rewriter does not touch is preserved byte for byte.

use log::{info, warn};

use crate::{
    file::io::write_le_at,
    pdb::{
        dbi::{normalize_dbi_stream, NIL_STREAM_INDEX},
        PdbFile, DBI_STREAM, HEADER_INFO_STREAM, OLD_DIRECTORY_STREAM,
    },
    Result,
};

/// Size of the fixed `PdbInfoHeader70`: version, timestamp, age, signature.
pub const INFO_HEADER_SIZE: usize = 28;

/// Offset of the `timestamp` field in the header info stream.
pub const INFO_TIMESTAMP_OFFSET: usize = 4;

/// Offset of the `age` field in the header info stream.
pub const INFO_AGE_OFFSET: usize = 8;

/// Offset of the `signature` GUID in the header info stream.
pub const INFO_SIGNATURE_OFFSET: usize = 12;

/// Offset of the known padding word in the public symbol info stream header.
const PUBLIC_PADDING_OFFSET: usize = 24;

/// Normalizes every variable field of `pdb` to the given deterministic
/// values.
///
/// # Errors
///
/// Returns an error if a required stream is missing, too short, or
/// malformed.
pub fn update_pdb(pdb: &mut PdbFile, timestamp: u32, age: u32, signature: [u8; 16]) -> Result<()> {
    // The old directory is meaningless once the container is rewritten; a
    // fresh PDB does not have one.
    pdb.replace_stream(OLD_DIRECTORY_STREAM, None);

    info!("Updating PDB header.");
    let header = pdb.make_writable(HEADER_INFO_STREAM)?;
    if header.len() < INFO_HEADER_SIZE {
        return Err(malformed_pdb!(
            "Header info stream of {} bytes is too short",
            header.len()
        ));
    }
    write_le_at(header, INFO_TIMESTAMP_OFFSET, timestamp)?;
    write_le_at(header, INFO_AGE_OFFSET, age)?;
    write_le_at(header, INFO_SIGNATURE_OFFSET, signature)?;

    info!("Updating PDB DBI stream.");
    let dbi = pdb.make_writable(DBI_STREAM)?;
    let streams = normalize_dbi_stream(dbi, age)?;

    if streams.symbol_record_stream == NIL_STREAM_INDEX {
        warn!("DBI names no symbol record stream, skipping.");
    } else {
        info!("Updating PDB symbol record stream.");
        let records = pdb.make_writable(streams.symbol_record_stream as usize)?;
        normalize_symbol_record_stream(records)?;
    }

    if streams.public_symbol_info_stream == NIL_STREAM_INDEX {
        warn!("DBI names no public symbol info stream, skipping.");
    } else {
        info!("Updating PDB public symbol info stream.");
        let public = pdb.make_writable(streams.public_symbol_info_stream as usize)?;
        if public.len() < PUBLIC_PADDING_OFFSET + 4 {
            return Err(malformed_pdb!(
                "Public symbol info stream of {} bytes is too short",
                public.len()
            ));
        }
        write_le_at(public, PUBLIC_PADDING_OFFSET, 0_u32)?;
    }

    Ok(())
}

/// Zeroes the tail padding of every symbol record.
///
/// A record is a 16-bit size `n` (excluding the size field itself) followed
/// by `n` bytes; `n + 2` is a multiple of 4 and `n` is at least 2. The
/// record's name string is NUL terminated within the last up-to-3 bytes;
/// compilers leak uninitialized bytes between that terminator and the
/// record end.
fn normalize_symbol_record_stream(data: &mut [u8]) -> Result<()> {
    let mut cursor = 0_usize;

    while cursor + 2 <= data.len() {
        let size = u16::from_le_bytes([data[cursor], data[cursor + 1]]) as usize;
        cursor += 2;

        if size < 2 || (size + 2) % 4 != 0 {
            return Err(malformed_pdb!(
                "Symbol record of size {} at {} is malformed",
                size,
                cursor - 2
            ));
        }
        let Some(end) = cursor.checked_add(size) else {
            return Err(malformed_pdb!("Symbol record overflows the stream"));
        };
        if end > data.len() {
            return Err(malformed_pdb!(
                "Symbol record of size {} at {} exceeds the stream",
                size,
                cursor - 2
            ));
        }

        // Find the terminator within the final padding window and zero
        // everything from there to the record end.
        let mut tail = end.saturating_sub(3).max(cursor);
        while tail + 1 < end && data[tail] != 0 {
            tail += 1;
        }
        for byte in &mut data[tail..end] {
            *byte = 0;
        }

        cursor = end;
    }

    if cursor != data.len() {
        return Err(malformed_pdb!(
            "Trailing {} bytes after the last symbol record",
            data.len() - cursor
        ));
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record(size: u16, payload: &[u8]) -> Vec<u8> {
        assert_eq!(payload.len(), size as usize);
        let mut data = size.to_le_bytes().to_vec();
        data.extend_from_slice(payload);
        data
    }

    #[test]
    fn junk_after_the_terminator_is_zeroed() {
        // Type, data, "f\0", then two junk bytes of padding.
        let mut payload = vec![0x0E, 0x11];
        payload.extend_from_slice(&[1, 2, 3, 4, 5, 6, 7, 8]);
        payload.extend_from_slice(b"f\0");
        payload.extend_from_slice(&[0xCC, 0xCC]);
        let mut data = record(14, &payload);
        let original = record(14, &payload);

        normalize_symbol_record_stream(&mut data).unwrap();

        // The terminator sits at the start of the padding window; only the
        // junk behind it changes.
        assert_eq!(data[..13], original[..13]);
        assert_eq!(&data[13..], &[0, 0, 0]);
    }

    #[test]
    fn record_bytes_before_padding_are_untouched() {
        let mut payload = vec![0x0E, 0x11, 0xAA, 0xBB, 0xCC, 0xDD];
        payload.extend_from_slice(b"ab\0");
        payload.push(0x5A); // junk byte after the terminator
        let mut data = record(10, &payload);

        normalize_symbol_record_stream(&mut data).unwrap();

        assert_eq!(
            &data[2..10],
            &[0x0E, 0x11, 0xAA, 0xBB, 0xCC, 0xDD, b'a', b'b']
        );
        assert_eq!(&data[10..12], &[0, 0]);
    }

    #[test]
    fn multiple_records_are_walked() {
        let mut data = record(6, &[0x3C, 0x11, 0x07, 0x00, 0x00, 0x00]);
        let mut second = vec![0x0E, 0x11, 0, 0, 0, 0];
        second.extend_from_slice(b"x\0");
        second.extend_from_slice(&[0xEE, 0xEE]);
        data.extend_from_slice(&record(10, &second));

        let original = data.clone();
        normalize_symbol_record_stream(&mut data).unwrap();

        assert_eq!(data[..8], original[..8]);
        assert_eq!(&data[data.len() - 3..], &[0, 0, 0]);
    }

    #[test]
    fn malformed_records_fail() {
        // Size not congruent to 2 mod 4.
        let mut data = record(4, &[0, 0, 0, 0]);
        assert!(normalize_symbol_record_stream(&mut data).is_err());

        // Size smaller than the record type field.
        let mut data = vec![0, 0];
        assert!(normalize_symbol_record_stream(&mut data).is_err());

        // Size past the end of the stream.
        let mut data = vec![0x0A, 0x00, 0x11, 0x0E];
        assert!(normalize_symbol_record_stream(&mut data).is_err());

        // A lone trailing byte.
        let mut data = record(2, &[0x06, 0x11]);
        data.push(0xFF);
        assert!(normalize_symbol_record_stream(&mut data).is_err());
    }
}
