//! The patch address space.
//!
//! Changes to the PE file are represented as an ordered map from
//! non-overlapping file-offset ranges to pending byte-range edits. The map
//! is built once during analysis and then consumed twice: the content GUID
//! deriver masks the ranges out of its hash, and the commit step stamps the
//! replacement bytes onto the output file.
//!
//! An entry with no replacement bytes participates in masking but is not
//! stamped - the PE checksum works this way, as its value can only be
//! computed after every other patch has been written.

pub mod digest;
pub mod marker;

use std::{
    collections::BTreeMap,
    fs,
    io::{Seek, SeekFrom, Write},
    path::Path,
};

use log::info;

use crate::{image::FileOffset, Error::PatchConflict, Result};

#[derive(Debug)]
struct PatchEntry {
    len: u32,
    data: Option<Vec<u8>>,
    name: String,
}

/// A pending edit of the output file, as yielded by
/// [`PatchAddressSpace::iter`].
#[derive(Debug, Clone, Copy)]
pub struct Patch<'a> {
    /// File offset of the first byte of the range.
    pub start: FileOffset,
    /// Length of the range in bytes.
    pub len: u32,
    /// The replacement bytes, or `None` for ranges that are masked but
    /// stamped by a later pass.
    pub data: Option<&'a [u8]>,
    /// Human-readable name, for logging.
    pub name: &'a str,
}

/// An ordered map of non-overlapping file ranges to pending patches.
#[derive(Debug, Default)]
pub struct PatchAddressSpace {
    entries: BTreeMap<FileOffset, PatchEntry>,
}

impl PatchAddressSpace {
    /// Creates an empty patch address space.
    #[must_use]
    pub fn new() -> PatchAddressSpace {
        PatchAddressSpace::default()
    }

    /// Inserts a patch for `[start, start + len)`.
    ///
    /// Returns `false` - and does not insert - if the range is empty,
    /// overlaps an existing entry, or `data` is present with a length other
    /// than `len`.
    pub fn insert(
        &mut self,
        start: FileOffset,
        len: u32,
        data: Option<Vec<u8>>,
        name: impl Into<String>,
    ) -> bool {
        if len == 0 {
            return false;
        }
        let Some(end) = start.checked_add(len) else {
            return false;
        };
        if let Some(data) = &data {
            if data.len() as u32 != len {
                return false;
            }
        }

        if let Some((&prev_start, prev)) = self.entries.range(..=start).next_back() {
            if prev_start + prev.len > start {
                return false;
            }
        }
        if let Some((&next_start, _)) = self.entries.range(start..).next() {
            if end > next_start {
                return false;
            }
        }

        self.entries.insert(
            start,
            PatchEntry {
                len,
                data,
                name: name.into(),
            },
        );

        true
    }

    /// Fills in the replacement bytes of a previously inserted entry.
    ///
    /// Used for values that are only known after the space has been consumed
    /// once - the content GUID is derived with the range masked, then stored
    /// here before stamping.
    ///
    /// # Errors
    ///
    /// Returns an error if no entry starts at `start` or the data length
    /// does not match the entry's range.
    pub fn set_data(&mut self, start: FileOffset, data: Vec<u8>) -> Result<()> {
        let Some(entry) = self.entries.get_mut(&start) else {
            return Err(PatchConflict(format!(
                "No patch registered at file offset {start:#x}"
            )));
        };
        if data.len() as u32 != entry.len {
            return Err(PatchConflict(format!(
                "Patch '{}' expects {} bytes, got {}",
                entry.name,
                entry.len,
                data.len()
            )));
        }

        entry.data = Some(data);
        Ok(())
    }

    /// The number of patches in the space.
    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Returns `true` if no patches have been inserted.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Iterates patches in ascending file-offset order.
    pub fn iter(&self) -> impl Iterator<Item = Patch<'_>> {
        self.entries.iter().map(|(&start, entry)| Patch {
            start,
            len: entry.len,
            data: entry.data.as_deref(),
            name: &entry.name,
        })
    }

    /// Stamps every dataful patch onto the file at `path` with seek+write.
    ///
    /// Entries without data are skipped; they are computed and written by a
    /// later pass.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be opened or any write fails or
    /// comes up short.
    pub fn stamp(&self, path: &Path) -> Result<()> {
        let mut file = fs::OpenOptions::new().write(true).open(path)?;

        for patch in self.iter() {
            let Some(data) = patch.data else {
                continue;
            };

            info!(
                "  Patching {}, {} bytes at {:#x}",
                patch.name, patch.len, patch.start
            );

            file.seek(SeekFrom::Start(u64::from(patch.start)))?;
            file.write_all(data)?;
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn insert_rejects_overlap() {
        let mut patches = PatchAddressSpace::new();

        assert!(patches.insert(0x100, 4, Some(vec![1, 2, 3, 4]), "a"));
        assert!(patches.insert(0x104, 4, None, "adjacent"));

        assert!(!patches.insert(0x102, 2, None, "inside"));
        assert!(!patches.insert(0x0FE, 4, None, "head overlap"));
        assert!(!patches.insert(0x106, 4, None, "tail overlap"));
        assert!(!patches.insert(0x100, 8, None, "superset"));
        assert!(!patches.insert(0x200, 0, None, "empty"));
        assert!(!patches.insert(0x200, 4, Some(vec![1]), "bad data len"));

        assert_eq!(patches.len(), 2);
    }

    #[test]
    fn iteration_is_ordered() {
        let mut patches = PatchAddressSpace::new();
        patches.insert(0x300, 2, None, "c");
        patches.insert(0x100, 2, None, "a");
        patches.insert(0x200, 2, None, "b");

        let starts: Vec<u32> = patches.iter().map(|patch| patch.start).collect();
        assert_eq!(starts, vec![0x100, 0x200, 0x300]);
    }

    #[test]
    fn set_data_fills_deferred_entries() {
        let mut patches = PatchAddressSpace::new();
        patches.insert(0x10, 4, None, "deferred");

        assert!(patches.set_data(0x20, vec![0; 4]).is_err());
        assert!(patches.set_data(0x10, vec![0; 2]).is_err());
        patches.set_data(0x10, vec![1, 2, 3, 4]).unwrap();

        let patch = patches.iter().next().unwrap();
        assert_eq!(patch.data, Some(&[1, 2, 3, 4][..]));
    }

    #[test]
    fn stamp_writes_dataful_patches() {
        let file = tempfile::NamedTempFile::new().unwrap();
        fs::write(file.path(), [0xFF_u8; 16]).unwrap();

        let mut patches = PatchAddressSpace::new();
        patches.insert(2, 2, Some(vec![0xAA, 0xBB]), "pair");
        patches.insert(8, 4, None, "masked only");
        patches.insert(12, 1, Some(vec![0xCC]), "single");
        patches.stamp(file.path()).unwrap();

        let data = fs::read(file.path()).unwrap();
        assert_eq!(
            data,
            [
                0xFF, 0xFF, 0xAA, 0xBB, 0xFF, 0xFF, 0xFF, 0xFF, 0xFF, 0xFF, 0xFF, 0xFF, 0xCC,
                0xFF, 0xFF, 0xFF
            ]
        );
    }
}
