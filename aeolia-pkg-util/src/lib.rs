//! Library and CLI for exporting GP4 projects from PlayStation 4 PKG files.
//!
//! This crate ties the parsing layers together: it opens a package from
//! disk, runs the key acquisition ladder against a persisted key store, and
//! rebuilds a GP4 project tree — `sce_sys/` entries, the inner file system,
//! and a `Project.gp4` describing both.
//!
//! # Overview
//!
//! The main entry points are [`open_pkg`], which memory-maps and unlocks a
//! package, and [`ProjectExporter`], which performs the streaming export
//! with progress reporting and cooperative cancellation.
//!
//! # Example
//!
//! ```no_run
//! use aeolia_pkg::keystore::KeyStore;
//! use aeolia_pkg_util::{ProjectExporter, SilentProgress, open_pkg};
//!
//! let mut store = KeyStore::default();
//! let (pkg, _) = unsafe { open_pkg("game.pkg".as_ref(), &mut store) }.unwrap();
//!
//! let exporter = ProjectExporter::new(&pkg, SilentProgress, true);
//! let report = exporter.export("project/").unwrap();
//! assert!(!report.cancelled);
//! ```

pub mod export;
pub mod gp4;
pub mod progress;

pub use self::export::{CancelToken, ExportError, ExportReport, FailedEntry, ProjectExporter};
pub use self::progress::{ExportProgress, SilentProgress};

#[cfg(feature = "cli")]
pub use self::progress::ConsoleProgress;

use aeolia_pkg::keys::ZERO_PASSCODE;
use aeolia_pkg::keystore::KeyStore;
use aeolia_pkg::{Pkg, UnlockSource};
use snafu::{ResultExt, Snafu};
use std::path::Path;

/// Errors that can occur when opening a PKG file from disk.
#[derive(Debug, Snafu)]
pub enum OpenPkgError {
    #[snafu(display("failed to open file"))]
    OpenFile { source: std::io::Error },

    #[snafu(display("failed to memory map file"))]
    MmapFile { source: std::io::Error },

    #[snafu(display("failed to parse PKG"))]
    ParsePkg { source: aeolia_pkg::OpenError },
}

/// Opens a PKG file from disk and runs the key ladder.
///
/// The file is memory-mapped and parsed, then every key acquisition step is
/// tried against `store`. Key material discovered by the ladder itself (the
/// zero passcode, or an EKPFS recovered from the image-key entry) is cached
/// back into the store under the package's content ID; the caller decides
/// when to persist it.
///
/// Returns the package and the ladder step that unlocked it, if any.
///
/// # Safety
///
/// This function uses `unsafe` internally to create a memory map. The caller
/// must ensure the file is not modified or truncated while the returned
/// [`Pkg`] is in use.
pub unsafe fn open_pkg(
    path: &Path,
    store: &mut KeyStore,
) -> Result<(Pkg<memmap2::Mmap>, Option<UnlockSource>), OpenPkgError> {
    let file = std::fs::File::open(path).context(OpenFileSnafu)?;
    let raw = unsafe { memmap2::Mmap::map(&file).context(MmapFileSnafu)? };
    let mut pkg = Pkg::new(raw).context(ParsePkgSnafu)?;

    let source = pkg.unlock_with_store(store);
    let content_id = pkg.header().content_id().as_str().to_string();

    match source {
        Some(UnlockSource::ZeroPasscode) => store.set_passcode(&content_id, ZERO_PASSCODE),
        Some(UnlockSource::ImageKey) => {
            if let Some(ekpfs) = pkg.ekpfs() {
                store.set_ekpfs(&content_id, *ekpfs);
            }
        }
        _ => {}
    }

    Ok((pkg, source))
}
