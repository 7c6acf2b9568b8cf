//! Entry point for the efimage builder.
//!
//! Simple flow: parse args → resolve modules → build image → write PE32+.

use std::fs::File;
use std::io::BufWriter;
use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::Parser;
use memmap2::Mmap;
use tracing::info;
use tracing_subscriber::EnvFilter;

use efimage::config::Config;
use efimage::image::Image;
use efimage::modules::{DependencyList, Module};
use efimage::pe;

fn main() -> Result<()> {
    let config = Config::parse();

    // Initialize logging
    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(&config.log_level))
        .unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt().with_env_filter(filter).init();

    let moddep_path = config.moddep_path();
    let moddep = std::fs::read_to_string(&moddep_path)
        .with_context(|| format!("failed to read {}", moddep_path.display()))?;
    let resolved = DependencyList::parse(&moddep)?.resolve(&config.modules)?;
    info!("resolved {} modules: {}", resolved.len(), resolved.join(" "));

    let mut modules = Vec::with_capacity(resolved.len() + 1);
    for name in &resolved {
        let module = Module::from_directory(&config.grub_root, name).with_context(|| {
            format!(
                "failed to load module '{}' from {}",
                name,
                config.grub_root.display()
            )
        })?;
        modules.push(module);
    }
    modules.push(Module::prefix(&config.prefix));

    // The map has to stay alive through emission: section contents are
    // read lazily while the image is being written out.
    let kernel_path = config.kernel_path();
    let kernel = File::open(&kernel_path)
        .with_context(|| format!("failed to open {}", kernel_path.display()))?;
    let mmap = unsafe { Mmap::map(&kernel)? };

    let image = Image::new(&mmap, &modules, pe::TOTAL_HEADER_SIZE, pe::UEFI_PAGE_SIZE)
        .with_context(|| format!("failed to build image from {}", kernel_path.display()))?;

    let output_path = config.output.clone().unwrap_or_else(|| {
        PathBuf::from(pe::image_file_name(image.machine()).unwrap_or("BOOT.EFI"))
    });

    let output = File::create(&output_path)
        .with_context(|| format!("failed to create {}", output_path.display()))?;
    let written = pe::write(&image, BufWriter::new(output))
        .with_context(|| format!("failed to write {}", output_path.display()))?;

    info!("wrote {} ({} bytes)", output_path.display(), written);
    Ok(())
}
