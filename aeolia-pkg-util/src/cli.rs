use clap::{Parser, Subcommand};
use std::path::PathBuf;

#[derive(Debug, Parser)]
#[command(name = "aeolia-pkg-util")]
#[command(about = "PS4 PKG project exporter", long_about = None)]
pub struct Cli {
    /// Path to the persisted key store
    #[arg(long, value_name = "FILE", default_value = "aeolia-keys.json", global = true)]
    pub keystore: PathBuf,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Debug, Subcommand)]
pub enum Command {
    /// Export a PKG as a GP4 project directory
    Export {
        /// Path to the PKG file
        #[arg(value_name = "PKG_FILE")]
        pkg_path: PathBuf,

        /// Output directory (defaults to the title id)
        #[arg(short, long, value_name = "DIR")]
        output: Option<PathBuf>,

        /// A passcode to try before the key ladder
        #[arg(short, long, value_name = "PASSCODE")]
        passcode: Option<String>,

        /// Keep encrypted entries as ciphertext
        #[arg(long)]
        no_decrypt: bool,

        /// Suppress progress output
        #[arg(short, long)]
        quiet: bool,
    },

    /// Display information about a PKG file
    Info {
        /// Path to the PKG file
        #[arg(value_name = "PKG_FILE")]
        pkg_path: PathBuf,
    },

    /// List entries in a PKG file
    List {
        /// Path to the PKG file
        #[arg(value_name = "PKG_FILE")]
        pkg_path: PathBuf,
    },

    /// Check every digest and signature of a PKG file
    Validate {
        /// Path to the PKG file
        #[arg(value_name = "PKG_FILE")]
        pkg_path: PathBuf,

        /// A passcode to try before the key ladder
        #[arg(short, long, value_name = "PASSCODE")]
        passcode: Option<String>,
    },

    /// Dump the values of an SFO parameter file
    Sfo {
        /// Path to the SFO file
        #[arg(value_name = "SFO_FILE")]
        sfo_path: PathBuf,
    },
}
