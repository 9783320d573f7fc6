use std::path::PathBuf;

use clap::Parser;

/// pestamp - make a PE/PDB pair deterministic.
///
/// Replaces every build-varying field of the image (timestamps, checksum,
/// debug signature) with values derived from its stable content, and
/// rewrites the PDB to match, so that independent builds of the same
/// sources produce byte-identical artifacts.
#[derive(Debug, Parser)]
#[command(name = "pestamp", version, about, long_about = None)]
pub struct Cli {
    /// Path to the PE image to canonicalize.
    #[arg(long, value_name = "FILE")]
    pub input_image: PathBuf,

    /// Path to the matching PDB. Defaults to the PDB named by the image's
    /// CodeView record.
    #[arg(long, value_name = "FILE")]
    pub input_pdb: Option<PathBuf>,

    /// Where to write the canonicalized image. Defaults to the input image.
    #[arg(long, value_name = "FILE")]
    pub output_image: Option<PathBuf>,

    /// Where to write the canonicalized PDB. Defaults to a path derived
    /// from the output image.
    #[arg(long, value_name = "FILE")]
    pub output_pdb: Option<PathBuf>,

    /// Analyze and update the PDB, but do not write the image.
    #[arg(long)]
    pub no_write_image: bool,

    /// Patch the image, but do not write the PDB.
    #[arg(long)]
    pub no_write_pdb: bool,

    /// Overwrite existing outputs; required for in-place operation.
    #[arg(long)]
    pub overwrite: bool,

    /// Enable verbose (debug-level) logging output.
    #[arg(short, long)]
    pub verbose: bool,
}
