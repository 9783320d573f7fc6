//! Low-level byte order utilities for PE and PDB parsing.
//!
//! This module provides the [`LeBytes`] trait for safe, little-endian reading
//! and writing of primitive values in unaligned byte buffers. Every on-disk
//! structure this crate touches is little-endian, and none of the buffers are
//! guaranteed to be aligned, so all access goes through these helpers.

use crate::{Error::OutOfBounds, Result};

/// Trait for type specific safe little-endian readers / writers.
///
/// Implemented for the integer widths used in PE and PDB structures, plus
/// `[u8; 16]` for GUID-sized fields (which are copied verbatim).
pub trait LeBytes: Sized {
    #[allow(missing_docs)]
    type Bytes: Sized + AsRef<[u8]> + for<'a> TryFrom<&'a [u8]>;

    /// Decode Self from its little-endian byte representation
    fn from_le_bytes(bytes: Self::Bytes) -> Self;
    /// Encode Self into its little-endian byte representation
    fn to_le_bytes(self) -> Self::Bytes;
}

impl LeBytes for u8 {
    type Bytes = [u8; 1];

    fn from_le_bytes(bytes: Self::Bytes) -> Self {
        u8::from_le_bytes(bytes)
    }

    fn to_le_bytes(self) -> Self::Bytes {
        u8::to_le_bytes(self)
    }
}

impl LeBytes for u16 {
    type Bytes = [u8; 2];

    fn from_le_bytes(bytes: Self::Bytes) -> Self {
        u16::from_le_bytes(bytes)
    }

    fn to_le_bytes(self) -> Self::Bytes {
        u16::to_le_bytes(self)
    }
}

impl LeBytes for u32 {
    type Bytes = [u8; 4];

    fn from_le_bytes(bytes: Self::Bytes) -> Self {
        u32::from_le_bytes(bytes)
    }

    fn to_le_bytes(self) -> Self::Bytes {
        u32::to_le_bytes(self)
    }
}

impl LeBytes for u64 {
    type Bytes = [u8; 8];

    fn from_le_bytes(bytes: Self::Bytes) -> Self {
        u64::from_le_bytes(bytes)
    }

    fn to_le_bytes(self) -> Self::Bytes {
        u64::to_le_bytes(self)
    }
}

// GUID-sized fields are byte arrays with no endianness of their own.
impl LeBytes for [u8; 16] {
    type Bytes = [u8; 16];

    fn from_le_bytes(bytes: Self::Bytes) -> Self {
        bytes
    }

    fn to_le_bytes(self) -> Self::Bytes {
        self
    }
}

/// Safely read T in little-endian from the start of a data buffer.
///
/// ## Arguments
/// * 'data' - The data buffer to read from
pub fn read_le<T: LeBytes>(data: &[u8]) -> Result<T> {
    let mut offset = 0_usize;
    read_le_at(data, &mut offset)
}

/// Safely read T from an offset in little-endian from a data buffer.
///
/// ## Arguments
/// * 'data'    - The data buffer to read from
/// * 'offset'  - An offset to read from, will be advanced by the amount of bytes read
pub fn read_le_at<T: LeBytes>(data: &[u8], offset: &mut usize) -> Result<T> {
    let type_len = std::mem::size_of::<T>();
    let Some(end) = offset.checked_add(type_len) else {
        return Err(OutOfBounds);
    };

    if end > data.len() {
        return Err(OutOfBounds);
    }

    let Ok(read) = data[*offset..end].try_into() else {
        return Err(OutOfBounds);
    };

    *offset = end;

    Ok(T::from_le_bytes(read))
}

/// Safely write T at an offset in little-endian into a data buffer.
///
/// ## Arguments
/// * 'data'    - The data buffer to write into
/// * 'offset'  - The offset to write at
/// * 'value'   - The value to encode
pub fn write_le_at<T: LeBytes>(data: &mut [u8], offset: usize, value: T) -> Result<()> {
    let type_len = std::mem::size_of::<T>();
    let Some(end) = offset.checked_add(type_len) else {
        return Err(OutOfBounds);
    };

    if end > data.len() {
        return Err(OutOfBounds);
    }

    data[offset..end].copy_from_slice(value.to_le_bytes().as_ref());

    Ok(())
}
