mod app;

use anyhow::Context;
use clap::Parser;
use pestamp::{Canonicalizer, Options};

use crate::app::Cli;

fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    // Show pestamp info+ on stderr; --verbose enables debug; RUST_LOG overrides
    let level = if cli.verbose {
        log::LevelFilter::Debug
    } else {
        log::LevelFilter::Info
    };
    env_logger::Builder::new()
        .filter_module("pestamp", level)
        .parse_default_env()
        .target(env_logger::Target::Stderr)
        .format_timestamp(None)
        .format_module_path(false)
        .format_target(false)
        .init();

    let mut zap = Canonicalizer::new(Options {
        input_image: cli.input_image.clone(),
        input_pdb: cli.input_pdb,
        output_image: cli.output_image,
        output_pdb: cli.output_pdb,
        write_image: !cli.no_write_image,
        write_pdb: !cli.no_write_pdb,
        overwrite: cli.overwrite,
    });

    zap.prepare()
        .with_context(|| format!("failed to analyze {}", cli.input_image.display()))?;
    zap.commit()
        .with_context(|| format!("failed to write {}", zap.output_image().display()))?;

    Ok(())
}
