use snafu::Snafu;
use std::path::PathBuf;

/// Errors that abort a project export.
///
/// Per-entry extraction problems never surface here; they are collected in
/// the [`ExportReport`](super::ExportReport) and the export continues.
#[derive(Debug, Snafu)]
#[non_exhaustive]
pub enum ExportError {
    #[snafu(display("content type {content_type:#x} has no project volume type"))]
    UnsupportedContentType { content_type: u32 },

    #[snafu(display("failed to read a meta table entry: {source}"))]
    ReadEntryFailed { source: aeolia_pkg::EntryReadError },

    #[snafu(display("cannot create directory {}: {source}", path.display()))]
    CreateDirectoryFailed {
        path: PathBuf,
        source: std::io::Error,
    },

    #[snafu(display("cannot create file {}: {source}", path.display()))]
    CreateFileFailed {
        path: PathBuf,
        source: std::io::Error,
    },

    #[snafu(display("cannot write to {}: {source}", path.display()))]
    WriteFailed {
        path: PathBuf,
        source: std::io::Error,
    },

    #[snafu(display("cannot open outer PFS: {source}"))]
    OpenOuterPfsFailed { source: aeolia_pkg::OpenPfsError },

    #[snafu(display("cannot open directory {path} on PFS: {source}"))]
    OpenPfsDirectoryFailed {
        path: String,
        source: aeolia_pfs::directory::OpenError,
    },

    #[snafu(display("outer PFS does not contain uroot directory"))]
    NoOuterUroot,

    #[snafu(display("outer PFS does not contain pfs_image.dat"))]
    NoInnerImage,

    #[snafu(display("cannot create decompressor for inner PFS: {source}"))]
    CreateDecompressorFailed { source: aeolia_pfs::pfsc::OpenError },

    #[snafu(display("cannot open inner PFS: {source}"))]
    OpenInnerPfsFailed { source: aeolia_pfs::OpenImageError },

    #[snafu(display("inner PFS does not contain uroot directory"))]
    NoInnerUroot,

    #[snafu(display("unsupported file name in PFS path: {path}"))]
    UnsupportedFileName { path: String },

    #[snafu(display("cannot read {path} from PFS: {source}"))]
    ReadPfsFileFailed {
        path: String,
        source: std::io::Error,
    },
}
