//! Command-line configuration.
//!
//! The tool works off a GRUB platform directory (the layout `grub-install`
//! ships): `kernel.img`, `moddep.lst`, and one `.mod` file per module.
//! Requested modules are expanded through `moddep.lst`, so only the
//! top-level feature modules need naming.

use std::path::PathBuf;

use clap::Parser;

/// Builds a bootable UEFI application image from a GRUB kernel and modules.
#[derive(Parser, Debug)]
#[command(author, version, about)]
pub struct Config {
    /// GRUB platform directory containing kernel.img, moddep.lst, and the
    /// module files.
    #[arg(long, default_value = "/usr/lib/grub/x86_64-efi")]
    pub grub_root: PathBuf,

    /// Module to embed in the image; repeatable. Dependencies are pulled
    /// in automatically.
    #[arg(
        short,
        long = "module",
        value_name = "NAME",
        default_values_t = ["normal", "tftp", "http", "linux", "fat", "iso9660"].map(String::from)
    )]
    pub modules: Vec<String>,

    /// Path GRUB uses at runtime to locate additional modules and its
    /// configuration.
    #[arg(long, default_value = "/boot/grub")]
    pub prefix: String,

    /// Kernel image to link (defaults to <grub-root>/kernel.img).
    #[arg(long)]
    pub kernel: Option<PathBuf>,

    /// Output file (defaults to the UEFI boot filename for the machine,
    /// e.g. BOOTx64.EFI).
    #[arg(short, long)]
    pub output: Option<PathBuf>,

    /// Log level (error, warn, info, debug, trace)
    #[arg(long, default_value = "warn")]
    pub log_level: String,
}

impl Config {
    pub fn kernel_path(&self) -> PathBuf {
        self.kernel
            .clone()
            .unwrap_or_else(|| self.grub_root.join("kernel.img"))
    }

    pub fn moddep_path(&self) -> PathBuf {
        self.grub_root.join("moddep.lst")
    }
}
