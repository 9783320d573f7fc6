use std::path::PathBuf;

use thiserror::Error;

macro_rules! malformed_pe {
    ($msg:expr) => {
        crate::Error::MalformedPe {
            message: $msg.to_string(),
            file: file!(),
            line: line!(),
        }
    };

    ($fmt:expr, $($arg:tt)*) => {
        crate::Error::MalformedPe {
            message: format!($fmt, $($arg)*),
            file: file!(),
            line: line!(),
        }
    };
}

macro_rules! malformed_pdb {
    ($msg:expr) => {
        crate::Error::MalformedPdb {
            message: $msg.to_string(),
            file: file!(),
            line: line!(),
        }
    };

    ($fmt:expr, $($arg:tt)*) => {
        crate::Error::MalformedPdb {
            message: format!($fmt, $($arg)*),
            file: file!(),
            line: line!(),
        }
    };
}

macro_rules! malformed_dbi {
    ($msg:expr) => {
        crate::Error::MalformedDbi {
            message: $msg.to_string(),
            file: file!(),
            line: line!(),
        }
    };

    ($fmt:expr, $($arg:tt)*) => {
        crate::Error::MalformedDbi {
            message: format!($fmt, $($arg)*),
            file: file!(),
            line: line!(),
        }
    };
}

/// The generic Error type covering all failure modes of this library.
///
/// Every error is terminal: there are no retries and no partial recovery.
/// The canonicalization driver surfaces the first failure of its current
/// phase and stops.
#[derive(Error, Debug)]
pub enum Error {
    /// File I/O error.
    ///
    /// Wraps standard I/O errors that can occur while reading the input
    /// image, stamping the output, or serializing the PDB.
    #[error("{0}")]
    Io(#[from] std::io::Error),

    /// The PE image is damaged or inconsistent and could not be parsed.
    ///
    /// The error records the source location where the malformation was
    /// detected for debugging purposes.
    #[error("Malformed PE - {file}:{line}: {message}")]
    MalformedPe {
        /// The message to be printed for the malformed PE error
        message: String,
        /// The source file in which this error occured
        file: &'static str,
        /// The source line in which this error occured
        line: u32,
    },

    /// The PDB container is damaged or inconsistent.
    #[error("Malformed PDB - {file}:{line}: {message}")]
    MalformedPdb {
        /// The message to be printed for the malformed PDB error
        message: String,
        /// The source file in which this error occured
        file: &'static str,
        /// The source line in which this error occured
        line: u32,
    },

    /// The DBI stream of the PDB is damaged or inconsistent.
    #[error("Malformed DBI stream - {file}:{line}: {message}")]
    MalformedDbi {
        /// The message to be printed for the malformed DBI error
        message: String,
        /// The source file in which this error occured
        file: &'static str,
        /// The source line in which this error occured
        line: u32,
    },

    /// An out of bound access was attempted while reading raw bytes.
    #[error("Out of bound read would have occurred!")]
    OutOfBounds,

    /// A typed field was dereferenced but no reference is registered at
    /// its offset.
    ///
    /// This happens when the destination of an RVA-valued field lies in a
    /// part of the image that the mini-decomposer did not materialize.
    #[error("No reference registered at block offset {offset}")]
    MissingReference {
        /// Offset of the field inside its block
        offset: u32,
    },

    /// A structure does not fit in the block it was cast onto.
    #[error("Structure of {size} bytes at offset {offset} exceeds block of {len} bytes")]
    TruncatedStructure {
        /// Offset of the cast inside the block
        offset: u32,
        /// Size of the structure being cast
        size: u32,
        /// Length of the block
        len: u32,
    },

    /// Two patches overlap in the patch address space.
    #[error("Patch conflict - {0}")]
    PatchConflict(String),

    /// The image carries more than one CodeView debug directory entry.
    #[error("Found multiple CodeView debug directory entries")]
    MultipleCodeView,

    /// A PDB was supplied but the image has no CodeView entry naming it.
    #[error("Failed to find a CodeView debug directory entry")]
    MissingCodeView,

    /// The PE image and the PDB do not identify each other.
    #[error("PE and PDB are not matched - {0}")]
    PeAndPdbMismatch(String),

    /// An output file exists and overwriting was not enabled.
    #[error("Output file exists, must enable overwrite - {0}")]
    OutputExists(PathBuf),

    /// The requested configuration is invalid.
    #[error("{0}")]
    BadConfig(String),

    /// Error from the goblin crate during PE parsing.
    #[error("{0}")]
    Goblin(#[from] goblin::error::Error),
}
