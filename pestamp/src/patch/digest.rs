//! Content GUID derivation.
//!
//! The PDB signature is derived by streaming the PE file through MD5 with
//! every patched range skipped: the digest then depends solely on the
//! invariant bytes of the image, so two independent builds agree on the
//! GUID exactly when their non-volatile content agrees.

use std::{
    fs,
    io::{Read, Seek, SeekFrom},
    path::Path,
};

use md5::{Digest, Md5};

use crate::{patch::PatchAddressSpace, Result};

const CHUNK_SIZE: usize = 4096;

/// Derives the 16-byte content GUID of the image at `path`, masking out the
/// ranges recorded in `patches`.
///
/// # Errors
///
/// Returns an error if the file cannot be read, comes up short, or a patch
/// range lies outside it.
pub fn derive_guid(path: &Path, patches: &PatchAddressSpace) -> Result<[u8; 16]> {
    let mut file = fs::File::open(path)?;
    let file_size = file.metadata()?.len();

    let mut hasher = Md5::new();
    let mut cursor = 0_u64;

    // Hash the data between the masked ranges, seeking over each range.
    for patch in patches.iter() {
        let start = u64::from(patch.start);
        let end = start + u64::from(patch.len);
        if end > file_size {
            return Err(malformed_pe!(
                "Patch '{}' at {:#x} lies outside the {} byte file",
                patch.name,
                patch.start,
                file_size
            ));
        }

        if cursor < start {
            consume(&mut file, start - cursor, &mut hasher)?;
        }

        file.seek(SeekFrom::Start(end))?;
        cursor = end;
    }

    if cursor < file_size {
        consume(&mut file, file_size - cursor, &mut hasher)?;
    }

    Ok(hasher.finalize().into())
}

/// Computes the MD5 digest of the whole file at `path`.
///
/// # Errors
///
/// Returns an error if the file cannot be read.
pub fn file_digest(path: &Path) -> Result<[u8; 16]> {
    let mut file = fs::File::open(path)?;
    let size = file.metadata()?.len();

    let mut hasher = Md5::new();
    consume(&mut file, size, &mut hasher)?;

    Ok(hasher.finalize().into())
}

/// Formats a digest as lowercase hex.
#[must_use]
pub fn hex(bytes: &[u8]) -> String {
    bytes.iter().map(|byte| format!("{byte:02x}")).collect()
}

/// Feeds exactly `bytes` bytes from the file's current position into the
/// hash; a short read is an error.
fn consume(file: &mut fs::File, bytes: u64, hasher: &mut Md5) -> Result<()> {
    let mut buffer = [0_u8; CHUNK_SIZE];

    let mut remaining = bytes;
    while remaining > 0 {
        let chunk = remaining.min(CHUNK_SIZE as u64) as usize;
        file.read_exact(&mut buffer[..chunk])?;
        hasher.update(&buffer[..chunk]);
        remaining -= chunk as u64;
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn write_temp(data: &[u8]) -> tempfile::NamedTempFile {
        let file = tempfile::NamedTempFile::new().unwrap();
        fs::write(file.path(), data).unwrap();
        file
    }

    fn md5_of(data: &[u8]) -> [u8; 16] {
        let mut hasher = Md5::new();
        hasher.update(data);
        hasher.finalize().into()
    }

    #[test]
    fn unmasked_file_hashes_whole_content() {
        let data: Vec<u8> = (0_u32..10_000).map(|value| value as u8).collect();
        let file = write_temp(&data);

        let patches = PatchAddressSpace::new();
        assert_eq!(derive_guid(file.path(), &patches).unwrap(), md5_of(&data));
        assert_eq!(file_digest(file.path()).unwrap(), md5_of(&data));
    }

    #[test]
    fn masked_ranges_are_excluded() {
        let data: Vec<u8> = (0_u32..10_000).map(|value| value as u8).collect();
        let file = write_temp(&data);

        let mut patches = PatchAddressSpace::new();
        patches.insert(10, 4, Some(vec![0; 4]), "a");
        patches.insert(5_000, 16, None, "b");
        patches.insert(9_996, 4, None, "tail");

        let mut masked = Vec::new();
        masked.extend_from_slice(&data[..10]);
        masked.extend_from_slice(&data[14..5_000]);
        masked.extend_from_slice(&data[5_016..9_996]);

        let guid = derive_guid(file.path(), &patches).unwrap();
        assert_eq!(guid, md5_of(&masked));

        // Bytes inside a masked range do not affect the digest...
        let mut inside = data.clone();
        inside[11] = 0xEE;
        let changed = write_temp(&inside);
        assert_eq!(derive_guid(changed.path(), &patches).unwrap(), guid);

        // ...bytes outside do.
        let mut outside = data;
        outside[20] ^= 0xFF;
        let changed = write_temp(&outside);
        assert_ne!(derive_guid(changed.path(), &patches).unwrap(), guid);
    }

    #[test]
    fn patch_past_the_end_fails() {
        let file = write_temp(&[0_u8; 32]);

        let mut patches = PatchAddressSpace::new();
        patches.insert(30, 4, None, "overhang");
        assert!(derive_guid(file.path(), &patches).is_err());
    }

    #[test]
    fn hex_formatting() {
        assert_eq!(hex(&[0x00, 0x1A, 0xFF]), "001aff");
    }
}
