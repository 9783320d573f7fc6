// Copyright 2026 the pestamp authors
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.
//
// SPDX-License-Identifier: Apache-2.0

#![deny(missing_docs)]

//! # pestamp
//!
//! Canonicalizes a matched pair of Windows build artifacts - a Portable
//! Executable (PE) image and its companion Program Database (PDB) file - by
//! replacing every field whose value varies from build to build with
//! deterministic values derived only from the stable content of the image.
//! Two independent builds of the same translation units, on different
//! machines at different times, then produce byte-identical output.
//!
//! # Architecture
//!
//! The library is organized around a small pipeline:
//!
//! - **File layer** ([`crate::file`]) - memory-mapped access to the image and
//!   translation between relative virtual addresses and file offsets.
//! - **Mini-decomposer** ([`crate::image`]) - parses just enough of the PE
//!   headers and data directories to build a graph of blocks and typed
//!   references between them. Code and data sections are not decomposed.
//! - **Patch address space** ([`crate::patch`]) - an ordered, non-overlapping
//!   map of byte-range edits over the file. It is used twice: to mask the
//!   volatile ranges out of a content hash, and to stamp the deterministic
//!   replacement values onto the output.
//! - **PDB rewriter** ([`crate::pdb`]) - loads the multi-stream PDB container,
//!   normalizes the variable fields in the header, DBI, symbol-record and
//!   public-symbol streams, and serializes a fresh canonical container.
//! - **Driver** ([`crate::Canonicalizer`]) - the two-phase orchestrator:
//!   `prepare` analyzes and plans without touching disk, `commit` writes.
//!
//! # Examples
//!
//! ```rust,no_run
//! use pestamp::{Canonicalizer, Options};
//! use std::path::PathBuf;
//!
//! let mut zap = Canonicalizer::new(Options {
//!     input_image: PathBuf::from("app.exe"),
//!     overwrite: true,
//!     ..Options::default()
//! });
//! zap.prepare()?;
//! zap.commit()?;
//! # Ok::<(), pestamp::Error>(())
//! ```
//!
//! # References
//!
//! - Microsoft PE/COFF Specification
//! - Microsoft MSF/PDB format documentation (LLVM "The PDB File Format")

#[macro_use]
pub(crate) mod error;

/// Shared functionality which is used in unit tests across modules.
#[cfg(test)]
pub(crate) mod test;

pub mod canonicalize;
pub mod file;
pub mod image;
pub mod patch;
pub mod pdb;
pub mod pe;

/// Result alias used throughout the crate.
pub type Result<T> = std::result::Result<T, Error>;

pub use canonicalize::{Canonicalizer, Options, CANONICAL_PDB_AGE, CANONICAL_TIMESTAMP};
pub use error::Error;
