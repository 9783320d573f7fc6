//! PDB stream backings.
//!
//! A stream is an abstract byte sequence inside the MSF container. Streams
//! loaded from disk are backed by the container's memory mapping and a page
//! list ([`StreamSource::Mapped`]); they are read-only. Before the rewriter
//! touches a stream it is coerced into a mutable byte-buffer copy
//! ([`StreamSource::Bytes`]) via [`PdbStream::make_writable`].

use std::sync::Arc;

use memmap2::Mmap;

use crate::{Error::OutOfBounds, Result};

/// The backing of a [`PdbStream`].
pub enum StreamSource {
    /// Read-only view into the container mapping, through a page list.
    Mapped {
        /// The container's file mapping, shared by all of its streams.
        data: Arc<Mmap>,
        /// Container page numbers holding this stream's bytes, in order.
        pages: Vec<u32>,
        /// The container's page size.
        page_size: u32,
    },
    /// Mutable byte-buffer backing.
    Bytes(Vec<u8>),
}

/// A byte sequence with a length and random-access reads.
pub struct PdbStream {
    len: u32,
    source: StreamSource,
}

impl PdbStream {
    /// Creates a writable stream owning `bytes`.
    #[must_use]
    pub fn from_bytes(bytes: Vec<u8>) -> PdbStream {
        PdbStream {
            len: bytes.len() as u32,
            source: StreamSource::Bytes(bytes),
        }
    }

    /// Creates a read-only stream of `len` bytes viewing the container
    /// mapping through `pages`.
    pub(crate) fn mapped(data: Arc<Mmap>, pages: Vec<u32>, page_size: u32, len: u32) -> PdbStream {
        PdbStream {
            len,
            source: StreamSource::Mapped {
                data,
                pages,
                page_size,
            },
        }
    }

    /// The stream length in bytes.
    #[must_use]
    pub fn len(&self) -> u32 {
        self.len
    }

    /// Returns `true` if the stream has no bytes.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Reads `buffer.len()` bytes starting at `position`.
    ///
    /// # Errors
    ///
    /// Returns an error if the range lies outside the stream or the backing
    /// pages lie outside the container.
    pub fn read_at(&self, position: u32, buffer: &mut [u8]) -> Result<()> {
        let Some(end) = position.checked_add(buffer.len() as u32) else {
            return Err(OutOfBounds);
        };
        if end > self.len {
            return Err(OutOfBounds);
        }

        match &self.source {
            StreamSource::Bytes(bytes) => {
                buffer.copy_from_slice(&bytes[position as usize..end as usize]);
            }
            StreamSource::Mapped {
                data,
                pages,
                page_size,
            } => {
                let mut copied = 0_usize;
                let mut position = position;
                while copied < buffer.len() {
                    let page_index = (position / page_size) as usize;
                    let page_offset = (position % page_size) as usize;
                    let span = buffer.len() - copied;
                    let span = span.min(*page_size as usize - page_offset);

                    let Some(&page) = pages.get(page_index) else {
                        return Err(OutOfBounds);
                    };
                    let start = page as usize * *page_size as usize + page_offset;
                    let Some(bytes) = data.get(start..start + span) else {
                        return Err(OutOfBounds);
                    };

                    buffer[copied..copied + span].copy_from_slice(bytes);
                    copied += span;
                    position += span as u32;
                }
            }
        }

        Ok(())
    }

    /// Copies the whole stream into a vector.
    ///
    /// # Errors
    ///
    /// Returns an error if the backing pages lie outside the container.
    pub fn read_to_vec(&self) -> Result<Vec<u8>> {
        let mut bytes = vec![0_u8; self.len as usize];
        self.read_at(0, &mut bytes)?;
        Ok(bytes)
    }

    /// Coerces this stream to a byte-buffer backing and returns the mutable
    /// bytes. A stream that is already byte-backed is returned as-is.
    ///
    /// # Errors
    ///
    /// Returns an error if a mapped stream cannot be copied out of the
    /// container.
    pub fn make_writable(&mut self) -> Result<&mut Vec<u8>> {
        let copied = match &self.source {
            StreamSource::Mapped { .. } => Some(self.read_to_vec()?),
            StreamSource::Bytes(_) => None,
        };
        if let Some(bytes) = copied {
            self.source = StreamSource::Bytes(bytes);
        }

        match &mut self.source {
            StreamSource::Bytes(bytes) => Ok(bytes),
            StreamSource::Mapped { .. } => Err(malformed_pdb!("Stream is not writable")),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn byte_stream_reads() {
        let stream = PdbStream::from_bytes(vec![1, 2, 3, 4, 5]);
        assert_eq!(stream.len(), 5);

        let mut buffer = [0_u8; 3];
        stream.read_at(1, &mut buffer).unwrap();
        assert_eq!(buffer, [2, 3, 4]);

        assert!(stream.read_at(3, &mut buffer).is_err());
        assert_eq!(stream.read_to_vec().unwrap(), vec![1, 2, 3, 4, 5]);
    }

    #[test]
    fn make_writable_mutates_in_place() {
        let mut stream = PdbStream::from_bytes(vec![0; 4]);
        stream.make_writable().unwrap()[2] = 0xAB;
        assert_eq!(stream.read_to_vec().unwrap(), vec![0, 0, 0xAB, 0]);
    }
}
