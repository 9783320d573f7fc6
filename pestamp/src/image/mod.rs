//! The mini-decomposer and its block graph.
//!
//! A canonicalizer does not need a full decomposition of the image - only the
//! PE headers and the structures reachable from the data directories carry
//! build-volatile fields. This module materializes exactly those ranges as
//! *blocks* (contiguous byte ranges at known RVAs) connected by typed
//! *references* (pointers from a field in one block to a location in
//! another), and leaves code and data sections untouched.
//!
//! # Key Components
//!
//! - [`Block`] / [`Reference`] / [`BlockGraph`] - the arena-backed graph
//! - [`ImageLayout`] - the graph plus the parsed section table
//! - [`decomposer::MiniDecomposer`] - builds the graph in two passes
//! - [`typed::TypedView`] - bounds-checked structural casts over block bytes
//!
//! References may form cycles (PE structures can be self-referential), so
//! references store *(arena index, offset)* pairs rather than owning
//! pointers; blocks are owned by the graph for its whole lifetime.

pub mod decomposer;
pub mod typed;

use std::collections::BTreeMap;

use goblin::pe::section_table::SectionTable;

use crate::Result;

/// A 32-bit relative virtual address within the PE image.
pub type Rva = u32;

/// A 32-bit byte offset within the on-disk PE file.
pub type FileOffset = u32;

/// Index of a block inside its [`BlockGraph`] arena.
pub type BlockId = usize;

/// The addressing mode of a [`Reference`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReferenceKind {
    /// An absolute virtual address.
    Absolute,
    /// An address relative to the image base (an RVA).
    Relative,
    /// An address relative to the location of the reference itself.
    PcRelative,
    /// An address relative to the start of the containing section.
    SectionRelative,
}

/// A typed pointer from a location inside one block to a location in another.
#[derive(Debug, Clone)]
pub struct Reference {
    /// The addressing mode of the stored value.
    pub kind: ReferenceKind,
    /// The width of the stored value in bytes (1, 2, 4 or 8).
    pub size: u8,
    /// The destination as an (arena index, in-block offset) pair.
    pub target: (BlockId, u32),
}

/// A contiguous byte range of the image at a known RVA.
///
/// Blocks own a copy of their bytes and an ordered map from in-block offsets
/// to outbound references.
#[derive(Debug)]
pub struct Block {
    rva: Rva,
    data: Vec<u8>,
    name: String,
    references: BTreeMap<u32, Reference>,
}

impl Block {
    /// Creates a block at `rva` owning a copy of `data`.
    pub fn new(rva: Rva, data: Vec<u8>, name: impl Into<String>) -> Block {
        Block {
            rva,
            data,
            name: name.into(),
            references: BTreeMap::new(),
        }
    }

    /// The starting RVA of this block.
    #[must_use]
    pub fn rva(&self) -> Rva {
        self.rva
    }

    /// The length of this block in bytes.
    #[must_use]
    pub fn len(&self) -> u32 {
        self.data.len() as u32
    }

    /// Returns `true` if the block has no bytes.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    /// The bytes of this block, copied verbatim from the source image.
    #[must_use]
    pub fn data(&self) -> &[u8] {
        &self.data
    }

    /// The debug name of this block.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Returns the reference registered at the given in-block offset.
    #[must_use]
    pub fn reference_at(&self, offset: u32) -> Option<&Reference> {
        self.references.get(&offset)
    }

    /// Registers `reference` at the given in-block offset, replacing any
    /// previous reference at that offset.
    pub fn set_reference(&mut self, offset: u32, reference: Reference) {
        self.references.insert(offset, reference);
    }
}

/// Mapping from RVAs to [`Block`]s, with containment lookup.
///
/// Blocks are stored in an arena and addressed by [`BlockId`]; a sorted
/// index over starting RVAs answers "which block contains this range".
/// Block ranges never overlap.
#[derive(Debug, Default)]
pub struct BlockGraph {
    blocks: Vec<Block>,
    index: BTreeMap<Rva, BlockId>,
}

impl BlockGraph {
    /// Creates an empty graph.
    #[must_use]
    pub fn new() -> BlockGraph {
        BlockGraph::default()
    }

    /// Inserts a block, returning its arena index.
    ///
    /// # Errors
    ///
    /// Returns an error if the block is empty or overlaps an existing block.
    pub fn insert(&mut self, block: Block) -> Result<BlockId> {
        if block.is_empty() {
            return Err(malformed_pe!(
                "Refusing to insert empty block '{}' at {:#x}",
                block.name(),
                block.rva()
            ));
        }

        let start = block.rva();
        let Some(end) = start.checked_add(block.len()) else {
            return Err(malformed_pe!(
                "Block '{}' at {:#x} overflows the address space",
                block.name(),
                block.rva()
            ));
        };

        if let Some((&prev_start, &prev_id)) = self.index.range(..=start).next_back() {
            let prev = &self.blocks[prev_id];
            if prev_start + prev.len() > start {
                return Err(malformed_pe!(
                    "Block '{}' at {:#x} overlaps block '{}' at {:#x}",
                    block.name(),
                    start,
                    prev.name(),
                    prev_start
                ));
            }
        }

        if let Some((&next_start, &next_id)) = self.index.range(start..).next() {
            if end > next_start {
                return Err(malformed_pe!(
                    "Block '{}' at {:#x} overlaps block '{}' at {:#x}",
                    block.name(),
                    start,
                    self.blocks[next_id].name(),
                    next_start
                ));
            }
        }

        let id = self.blocks.len();
        self.index.insert(start, id);
        self.blocks.push(block);

        Ok(id)
    }

    /// Returns the block with the given arena index.
    ///
    /// # Panics
    ///
    /// Panics if `id` was not returned by [`BlockGraph::insert`] on this graph.
    #[must_use]
    pub fn block(&self, id: BlockId) -> &Block {
        &self.blocks[id]
    }

    /// Returns the block with the given arena index, mutably.
    ///
    /// # Panics
    ///
    /// Panics if `id` was not returned by [`BlockGraph::insert`] on this graph.
    #[must_use]
    pub fn block_mut(&mut self, id: BlockId) -> &mut Block {
        &mut self.blocks[id]
    }

    /// Returns the block that fully contains `[rva, rva + size)`, if any.
    #[must_use]
    pub fn containing_block(&self, rva: Rva, size: u32) -> Option<BlockId> {
        let (&start, &id) = self.index.range(..=rva).next_back()?;
        let block = &self.blocks[id];

        let end = rva.checked_add(size)?;
        if end <= start + block.len() {
            Some(id)
        } else {
            None
        }
    }

    /// The number of blocks in the graph.
    #[must_use]
    pub fn block_count(&self) -> usize {
        self.blocks.len()
    }

    /// Iterates blocks in ascending RVA order.
    pub fn iter(&self) -> impl Iterator<Item = &Block> {
        self.index.values().map(|&id| &self.blocks[id])
    }
}

/// A decomposed image: the block graph plus the parsed section table.
#[derive(Debug)]
pub struct ImageLayout {
    /// The graph of PE-structural blocks.
    pub graph: BlockGraph,
    /// The section table parsed from the NT headers.
    pub sections: Vec<SectionTable>,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn block(rva: Rva, len: usize, name: &str) -> Block {
        Block::new(rva, vec![0; len], name)
    }

    #[test]
    fn insert_and_lookup() {
        let mut graph = BlockGraph::new();
        let a = graph.insert(block(0x100, 0x40, "a")).unwrap();
        let b = graph.insert(block(0x200, 0x10, "b")).unwrap();

        assert_eq!(graph.containing_block(0x100, 1), Some(a));
        assert_eq!(graph.containing_block(0x13F, 1), Some(a));
        assert_eq!(graph.containing_block(0x13F, 2), None);
        assert_eq!(graph.containing_block(0x140, 1), None);
        assert_eq!(graph.containing_block(0x208, 8), Some(b));
        assert_eq!(graph.containing_block(0x0, 1), None);
    }

    #[test]
    fn insert_rejects_overlap() {
        let mut graph = BlockGraph::new();
        graph.insert(block(0x100, 0x40, "a")).unwrap();

        assert!(graph.insert(block(0x100, 0x40, "dup")).is_err());
        assert!(graph.insert(block(0x13F, 0x10, "tail")).is_err());
        assert!(graph.insert(block(0xF0, 0x20, "head")).is_err());
        assert!(graph.insert(block(0x300, 0, "empty")).is_err());

        // Adjacent blocks are fine.
        assert!(graph.insert(block(0x140, 0x10, "next")).is_ok());
        assert!(graph.insert(block(0xF0, 0x10, "prev")).is_ok());
    }

    #[test]
    fn references() {
        let mut graph = BlockGraph::new();
        let a = graph.insert(block(0x100, 0x40, "a")).unwrap();
        let b = graph.insert(block(0x200, 0x10, "b")).unwrap();

        graph.block_mut(a).set_reference(
            8,
            Reference {
                kind: ReferenceKind::Relative,
                size: 4,
                target: (b, 4),
            },
        );

        let reference = graph.block(a).reference_at(8).unwrap();
        assert_eq!(reference.target, (b, 4));
        assert!(graph.block(a).reference_at(9).is_none());
    }
}
