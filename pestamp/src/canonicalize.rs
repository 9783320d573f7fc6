//! The two-phase canonicalization driver.
//!
//! [`Canonicalizer::prepare`] does all the analysis without touching disk:
//! validate the inputs, decompose the image, mark the volatile fields,
//! derive the content GUID, and normalize the PDB in memory.
//! [`Canonicalizer::commit`] then writes: copy the image to its output path
//! (unless they are the same file), stamp the patches, recompute the PE
//! checksum, and serialize the PDB to a sibling temporary directory before
//! atomically replacing the destination.
//!
//! Failures are terminal at whatever phase they occur; no on-disk rollback
//! is needed because `commit` is the first step that writes.

use std::{
    fs,
    path::{Path, PathBuf},
};

use log::info;

use crate::{
    file::PeFile,
    image::{decomposer::MiniDecomposer, ImageLayout},
    patch::{digest, marker, PatchAddressSpace},
    pdb::{rewriter, writer, PdbFile},
    pe::checksum,
    Error::{BadConfig, OutputExists, PeAndPdbMismatch},
    Result,
};

/// The canonical timestamp: 2010-01-01T00:00:00Z.
///
/// Zero would be a special value to the loader, so an arbitrary fixed date
/// in the past is used instead. It should not lie too far back, or Windows
/// flags the image with compatibility warnings.
pub const CANONICAL_TIMESTAMP: u32 = 1_262_304_000;

/// The canonical PDB age.
pub const CANONICAL_PDB_AGE: u32 = 1;

/// What to canonicalize and where to put it.
#[derive(Debug, Clone)]
pub struct Options {
    /// The PE image to canonicalize.
    pub input_image: PathBuf,
    /// The matching PDB; located through the image's CodeView record when
    /// absent.
    pub input_pdb: Option<PathBuf>,
    /// Where to write the canonicalized image; defaults to `input_image`.
    pub output_image: Option<PathBuf>,
    /// Where to write the canonicalized PDB; derived from the image paths
    /// when absent.
    pub output_pdb: Option<PathBuf>,
    /// Whether to write the image at all.
    pub write_image: bool,
    /// Whether to write the PDB at all.
    pub write_pdb: bool,
    /// Allow overwriting existing outputs (including in-place operation).
    pub overwrite: bool,
}

impl Default for Options {
    fn default() -> Options {
        Options {
            input_image: PathBuf::new(),
            input_pdb: None,
            output_image: None,
            output_pdb: None,
            write_image: true,
            write_pdb: true,
            overwrite: false,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Phase {
    New,
    Validated,
    Decomposed,
    Marked,
    Hashed,
    PdbPrepared,
    Committed,
}

/// Drives the canonicalization of one PE/PDB pair.
pub struct Canonicalizer {
    options: Options,
    phase: Phase,

    input_pdb: Option<PathBuf>,
    output_image: PathBuf,
    output_pdb: Option<PathBuf>,

    layout: Option<ImageLayout>,
    patches: PatchAddressSpace,
    guid: Option<[u8; 16]>,
    pdb_file: Option<PdbFile>,
}

impl Canonicalizer {
    /// Creates a driver for the given options. Nothing is read until
    /// [`Canonicalizer::prepare`] runs.
    #[must_use]
    pub fn new(options: Options) -> Canonicalizer {
        Canonicalizer {
            options,
            phase: Phase::New,
            input_pdb: None,
            output_image: PathBuf::new(),
            output_pdb: None,
            layout: None,
            patches: PatchAddressSpace::new(),
            guid: None,
            pdb_file: None,
        }
    }

    /// The decomposed image layout, available once `prepare` has run.
    #[must_use]
    pub fn layout(&self) -> Option<&ImageLayout> {
        self.layout.as_ref()
    }

    /// The accumulated patch address space.
    #[must_use]
    pub fn patches(&self) -> &PatchAddressSpace {
        &self.patches
    }

    /// The resolved output image path; empty before [`Canonicalizer::prepare`].
    #[must_use]
    pub fn output_image(&self) -> &Path {
        &self.output_image
    }

    /// The resolved output PDB path, when a PDB is in play.
    #[must_use]
    pub fn output_pdb(&self) -> Option<&Path> {
        self.output_pdb.as_deref()
    }

    /// The derived content GUID, available once `prepare` has run with a PDB.
    #[must_use]
    pub fn guid(&self) -> Option<[u8; 16]> {
        self.guid
    }

    /// Validates the inputs, decomposes and marks the image, derives the
    /// content GUID, and normalizes the PDB in memory. Touches no output.
    ///
    /// # Errors
    ///
    /// Returns an error if the inputs are missing or mismatched, the image
    /// cannot be decomposed, patches conflict, or the PDB is malformed.
    pub fn prepare(&mut self) -> Result<()> {
        if self.phase != Phase::New {
            return Err(BadConfig("prepare may only run once".to_string()));
        }

        let pe_file = self.validate()?;
        self.phase = Phase::Validated;

        let (layout, dos_header_block) = MiniDecomposer::decompose(&pe_file)?;
        self.phase = Phase::Decomposed;

        let marked = marker::mark_image(
            &pe_file,
            &layout,
            dos_header_block,
            self.input_pdb.is_some(),
            &mut self.patches,
        )?;
        self.phase = Phase::Marked;

        if let Some(input_pdb) = self.input_pdb.clone() {
            info!("Calculating PDB GUID from PE file contents.");
            let guid = digest::derive_guid(&self.options.input_image, &self.patches)?;
            info!("Final GUID is {}.", digest::hex(&guid));
            if let Some(offset) = marked.pdb_guid {
                self.patches.set_data(offset, guid.to_vec())?;
            }
            self.guid = Some(guid);
            self.phase = Phase::Hashed;

            let mut pdb_file = PdbFile::read(&input_pdb)?;
            rewriter::update_pdb(&mut pdb_file, CANONICAL_TIMESTAMP, CANONICAL_PDB_AGE, guid)?;
            self.pdb_file = Some(pdb_file);
        } else {
            self.phase = Phase::Hashed;
        }

        // The input mapping is released here; commit re-opens the files it
        // touches.
        drop(pe_file);
        self.layout = Some(layout);
        self.phase = Phase::PdbPrepared;

        Ok(())
    }

    /// Writes the canonicalized artifacts.
    ///
    /// # Errors
    ///
    /// Returns an error on any I/O failure. The one late failure mode is
    /// checksum recomputation: if it fails, the output image is left stamped
    /// with an invalid checksum.
    pub fn commit(&mut self) -> Result<()> {
        if self.phase != Phase::PdbPrepared {
            return Err(BadConfig("commit requires a completed prepare".to_string()));
        }

        if self.options.write_image {
            if !paths_are_same_file(&self.options.input_image, &self.output_image) {
                fs::copy(&self.options.input_image, &self.output_image)?;
            }

            info!("Patching file: {}", self.output_image.display());
            self.patches.stamp(&self.output_image)?;
            info!("Finished patching file: {}", self.output_image.display());

            info!(
                "Updating checksum for PE file: {}",
                self.output_image.display()
            );
            checksum::update_file_checksum(&self.output_image)?;

            output_summary_stats(&self.output_image)?;
        }

        let pdb_file = self.pdb_file.take();
        if let (Some(pdb_file), Some(output_pdb)) = (pdb_file, self.output_pdb.clone()) {
            if self.options.write_pdb {
                self.write_pdb_file(pdb_file, &output_pdb)?;
                output_summary_stats(&output_pdb)?;
            }
        }

        self.phase = Phase::Committed;

        Ok(())
    }

    /// Checks the input files, locates the PDB, verifies the pair matches,
    /// and resolves the output paths.
    fn validate(&mut self) -> Result<PeFile> {
        let input_image = self.options.input_image.clone();
        info!("Analyzing PE file: {}", input_image.display());

        if !input_image.is_file() {
            return Err(BadConfig(format!(
                "PE file not found: {}",
                input_image.display()
            )));
        }

        let pe_file = PeFile::from_file(&input_image)?;

        self.input_pdb = match &self.options.input_pdb {
            Some(input_pdb) => {
                if !input_pdb.is_file() {
                    return Err(BadConfig(format!(
                        "PDB file not found: {}",
                        input_pdb.display()
                    )));
                }
                Some(input_pdb.clone())
            }
            // If the image has no CodeView entry (ie: no matching PDB file)
            // then accept this fact and operate on the PE alone.
            None => match pe_file.codeview() {
                Some(codeview) => {
                    let found = find_pdb_for_image(&input_image, &codeview.pdb_path)?;
                    info!("Found matching PDB file: {}", found.display());
                    Some(found)
                }
                None => None,
            },
        };

        if let Some(input_pdb) = &self.input_pdb {
            verify_matched(&pe_file, input_pdb)?;
        }

        self.output_image = self
            .options
            .output_image
            .clone()
            .unwrap_or_else(|| input_image.clone());

        self.output_pdb = match &self.input_pdb {
            None => {
                if let Some(ignored) = &self.options.output_pdb {
                    info!("Ignoring output-pdb path: {}", ignored.display());
                }
                None
            }
            Some(input_pdb) => Some(match &self.options.output_pdb {
                Some(output_pdb) => output_pdb.clone(),
                None => derive_output_pdb(&input_image, input_pdb, &self.output_image)?,
            }),
        };

        // Refuse to clobber anything unless overwriting was asked for. An
        // output that is the input itself counts: in-place operation needs
        // the flag too.
        if !self.options.overwrite {
            if self.options.write_image
                && (self.output_image.exists()
                    || paths_are_same_file(&input_image, &self.output_image))
            {
                return Err(OutputExists(self.output_image.clone()));
            }

            if self.options.write_pdb {
                if let (Some(input_pdb), Some(output_pdb)) = (&self.input_pdb, &self.output_pdb) {
                    if output_pdb.exists() || paths_are_same_file(input_pdb, output_pdb) {
                        return Err(OutputExists(output_pdb.clone()));
                    }
                }
            }
        }

        Ok(pe_file)
    }

    /// Serializes the PDB next to its destination and atomically replaces
    /// it. The in-memory container is dropped - closing its mapping of the
    /// input file - before the replace.
    fn write_pdb_file(&self, pdb_file: PdbFile, output_pdb: &Path) -> Result<()> {
        let parent = match output_pdb.parent() {
            Some(parent) if !parent.as_os_str().is_empty() => parent,
            _ => Path::new("."),
        };
        let Some(file_name) = output_pdb.file_name() else {
            return Err(BadConfig(format!(
                "Output PDB path has no file name: {}",
                output_pdb.display()
            )));
        };

        // The temporary directory lives beside the destination so the final
        // rename never crosses a volume boundary. It is removed on drop on
        // every exit path.
        let temp_dir = tempfile::Builder::new()
            .prefix(".pestamp-")
            .tempdir_in(parent)?;
        let temp_path = temp_dir.path().join(file_name);

        info!("Creating temporary PDB file: {}", temp_path.display());
        writer::write(&temp_path, &pdb_file)?;

        drop(pdb_file);

        info!(
            "Temporary PDB file replacing destination PDB: {}",
            output_pdb.display()
        );
        fs::rename(&temp_path, output_pdb)?;

        Ok(())
    }
}

/// Compares two paths by file identity rather than by name, so in-place
/// operation is detected through links and case differences. Paths that do
/// not both exist are never the same file.
fn paths_are_same_file(first: &Path, second: &Path) -> bool {
    same_file::is_same_file(first, second).unwrap_or(false)
}

/// Locates the PDB named by the image's CodeView record: first the embedded
/// path, then its basename beside the image.
fn find_pdb_for_image(input_image: &Path, embedded: &Path) -> Result<PathBuf> {
    if embedded.is_file() {
        return Ok(embedded.to_path_buf());
    }

    if let Some(file_name) = embedded.file_name() {
        let sibling = input_image.with_file_name(file_name);
        if sibling.is_file() {
            return Ok(sibling);
        }
    }

    Err(BadConfig(format!(
        "PDB file not found for PE file: {}",
        input_image.display()
    )))
}

/// Ensures the PDB and the PE file identify each other by signature and age.
fn verify_matched(pe_file: &PeFile, input_pdb: &Path) -> Result<()> {
    let Some(codeview) = pe_file.codeview() else {
        return Err(PeAndPdbMismatch(format!(
            "{} has no CodeView record naming a PDB",
            pe_file.path().display()
        )));
    };

    let pdb_file = PdbFile::read(input_pdb)?;
    let (signature, age) = pdb_file.signature_and_age()?;

    if signature != codeview.signature || age != codeview.age {
        return Err(PeAndPdbMismatch(format!(
            "{} does not match the image's CodeView record",
            input_pdb.display()
        )));
    }

    Ok(())
}

/// Derives the default output PDB path: the input PDB's basename beside the
/// output image when the image keeps its name, otherwise the output image
/// path with `.pdb` appended.
fn derive_output_pdb(
    input_image: &Path,
    input_pdb: &Path,
    output_image: &Path,
) -> Result<PathBuf> {
    if input_image.file_name() == output_image.file_name() {
        let Some(pdb_name) = input_pdb.file_name() else {
            return Err(BadConfig(format!(
                "Input PDB path has no file name: {}",
                input_pdb.display()
            )));
        };
        return Ok(output_image.with_file_name(pdb_name));
    }

    let mut with_extension = output_image.as_os_str().to_os_string();
    with_extension.push(".pdb");
    Ok(PathBuf::from(with_extension))
}

/// Logs the size and whole-file digest of a written artifact.
fn output_summary_stats(path: &Path) -> Result<()> {
    let size = fs::metadata(path)?.len();
    let digest = digest::file_digest(path)?;

    info!("Path: {}", path.display());
    info!("  Size  : {size}");
    info!("  Digest: {}", digest::hex(&digest));

    Ok(())
}
