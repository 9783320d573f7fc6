//! Bounds-checked typed access to block bytes.
//!
//! A [`TypedView`] is a structural cast: a (block, base offset, schema)
//! triple that grants field-wise access to the raw bytes of a block. Schemas
//! are zero-sized marker types declaring their byte size through [`Layout`]
//! and their fields as [`Field`] constants with compile-time-known offsets;
//! the concrete PE schemas live in [`crate::pe`].
//!
//! Reads go through the unaligned little-endian helpers of
//! [`crate::file::io`] - PE structures are 4-byte aligned at their declared
//! RVAs, but nothing guarantees the backing buffer is.

use std::marker::PhantomData;

use crate::{
    file::io::{read_le_at, LeBytes},
    image::{Block, BlockGraph, BlockId, Rva},
    Error::{MissingReference, TruncatedStructure},
    Result,
};

/// Byte size of a structure schema.
pub trait Layout {
    /// The size of the structure in bytes.
    const SIZE: u32;
}

/// A field of a structure schema: a byte offset tagged with the field's type.
pub struct Field<T> {
    offset: u32,
    _marker: PhantomData<T>,
}

impl<T> Field<T> {
    /// Declares a field at the given byte offset from the structure start.
    #[must_use]
    pub const fn new(offset: u32) -> Field<T> {
        Field {
            offset,
            _marker: PhantomData,
        }
    }

    /// The byte offset of this field from the structure start.
    #[must_use]
    pub const fn offset(self) -> u32 {
        self.offset
    }
}

impl<T> Clone for Field<T> {
    fn clone(&self) -> Self {
        *self
    }
}

impl<T> Copy for Field<T> {}

/// A structural cast of schema `T` onto a block at a base offset.
pub struct TypedView<'g, T> {
    graph: &'g BlockGraph,
    block: BlockId,
    base: u32,
    _marker: PhantomData<T>,
}

impl<'g, T: Layout> TypedView<'g, T> {
    /// Casts `T` onto `block` at `base`.
    ///
    /// # Errors
    ///
    /// Returns [`TruncatedStructure`] if `T` does not fit in the block at
    /// that offset.
    pub fn new(graph: &'g BlockGraph, block: BlockId, base: u32) -> Result<TypedView<'g, T>> {
        let len = graph.block(block).len();
        match base.checked_add(T::SIZE) {
            Some(end) if end <= len => Ok(TypedView {
                graph,
                block,
                base,
                _marker: PhantomData,
            }),
            _ => Err(TruncatedStructure {
                offset: base,
                size: T::SIZE,
                len,
            }),
        }
    }

    /// The block this view is cast onto.
    #[must_use]
    pub fn block(&self) -> &Block {
        self.graph.block(self.block)
    }

    /// The RVA of the structure start.
    #[must_use]
    pub fn rva(&self) -> Rva {
        self.block().rva() + self.base
    }

    /// The RVA of a field of the structure.
    #[must_use]
    pub fn field_rva<F>(&self, field: Field<F>) -> Rva {
        self.rva() + field.offset()
    }

    /// Reads the value of a field.
    ///
    /// # Errors
    ///
    /// Returns an error if the field lies outside the block.
    pub fn get<F: LeBytes>(&self, field: Field<F>) -> Result<F> {
        let mut offset = (self.base + field.offset()) as usize;
        read_le_at(self.block().data(), &mut offset)
    }

    /// Returns `true` if a reference is registered at the field's offset.
    #[must_use]
    pub fn has_reference<F>(&self, field: Field<F>) -> bool {
        self.block()
            .reference_at(self.base + field.offset())
            .is_some()
    }

    /// Follows the reference registered at the field's offset, casting `U`
    /// onto the destination.
    ///
    /// # Errors
    ///
    /// Returns [`MissingReference`] if no reference is registered at the
    /// field's offset (the destination was not materialized by the
    /// decomposer), or [`TruncatedStructure`] if `U` does not fit at the
    /// destination.
    pub fn dereference<U: Layout, F>(&self, field: Field<F>) -> Result<TypedView<'g, U>> {
        let offset = self.base + field.offset();
        let Some(reference) = self.block().reference_at(offset) else {
            return Err(MissingReference { offset });
        };

        let (target_block, target_offset) = reference.target;
        TypedView::new(self.graph, target_block, target_offset)
    }

    /// Casts `T` onto the `index`-th element of an array starting at this
    /// view's base.
    ///
    /// # Errors
    ///
    /// Returns [`TruncatedStructure`] if the element does not fit in the block.
    pub fn element(&self, index: u32) -> Result<TypedView<'g, T>> {
        TypedView::new(self.graph, self.block, self.base + index * T::SIZE)
    }

    /// The number of whole `T` elements between this view's base and the end
    /// of the block.
    #[must_use]
    pub fn element_count(&self) -> u32 {
        (self.block().len() - self.base) / T::SIZE
    }
}
