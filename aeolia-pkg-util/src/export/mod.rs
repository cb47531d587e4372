mod error;

pub use self::error::ExportError;

use crate::gp4::{Gp4Project, VolumeType};
use crate::progress::ExportProgress;
use aeolia_pfs::directory::{DirEntry, Directory};
use aeolia_pfs::file::File as PfsFile;
use aeolia_pfs::image::Image;
use aeolia_pfs::pfsc::PfscImage;
use aeolia_pkg::Pkg;
use log::warn;
use std::collections::VecDeque;
use std::fs::{File, create_dir_all};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

/// Cooperative cancellation signal for a running export.
///
/// The exporter checks the token between entries and between tree nodes;
/// cancelling leaves partial output on disk but releases every handle.
#[derive(Clone, Debug, Default)]
pub struct CancelToken(Arc<AtomicBool>);

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::Relaxed);
    }

    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::Relaxed)
    }
}

/// A meta entry that could not be exported.
#[derive(Clone, Debug)]
pub struct FailedEntry {
    pub name: String,
    pub reason: String,
}

/// Final status of an export run.
#[derive(Debug, Default)]
#[must_use]
pub struct ExportReport {
    /// Set when the run stopped at a cancellation point.
    pub cancelled: bool,
    /// Entries that were skipped; the rest of the export still completed.
    pub failed_entries: Vec<FailedEntry>,
}

/// Rebuilds a GP4 project tree from an opened PKG.
///
/// The export is a single-threaded streaming walk: package entries first,
/// then the inner PFS tree, then `Project.gp4`. Progress is reported as an
/// overall percentage that only reaches 100 once the project file exists.
pub struct ProjectExporter<'a, R: AsRef<[u8]>, P: ExportProgress> {
    pkg: &'a Pkg<R>,
    progress: P,
    decrypt_entries: bool,
    cancel: CancelToken,
}

impl<'a, R: AsRef<[u8]>, P: ExportProgress> ProjectExporter<'a, R, P> {
    /// Creates a new exporter for the given PKG.
    ///
    /// With `decrypt_entries` unset, encrypted entries are exported as their
    /// on-disk ciphertext and `param.sfo` is left untouched.
    pub fn new(pkg: &'a Pkg<R>, progress: P, decrypt_entries: bool) -> Self {
        Self {
            pkg,
            progress,
            decrypt_entries,
            cancel: CancelToken::new(),
        }
    }

    /// Attaches a cancellation token shared with the caller.
    pub fn with_cancel(mut self, cancel: CancelToken) -> Self {
        self.cancel = cancel;
        self
    }

    /// Exports the package into `output` and writes `Project.gp4`.
    pub fn export(&self, output: impl AsRef<Path>) -> Result<ExportReport, ExportError> {
        let output = output.as_ref();
        let header = self.pkg.header();
        let mut report = ExportReport::default();

        let volume_type = VolumeType::from_content_type(header.content_type()).ok_or(
            ExportError::UnsupportedContentType {
                content_type: header.content_type_raw(),
            },
        )?;

        create_dir_all(output).map_err(|e| ExportError::CreateDirectoryFailed {
            path: output.to_path_buf(),
            source: e,
        })?;

        let mut project = Gp4Project::new(
            volume_type,
            header.content_id().as_str(),
            self.pkg.passcode().unwrap_or(""),
        );

        // Package entries, in meta-table order.
        self.progress.progress(0, "exporting package entries");

        if self.export_entries(output, &mut project, &mut report)? {
            report.cancelled = true;
            return Ok(report);
        }

        // Recover the creation date and scrub the publishing fields.
        self.scrub_param_sfo(output, &mut project, &mut report);

        // Additional content records its entitlement key in the project.
        if header.content_type().is_additional_content() {
            match self.pkg.entitlement_key() {
                Ok(key) => project.entitlement_key = Some(hex(&key)),
                Err(e) => {
                    warn!("entitlement key unavailable: {e}");
                    report.failed_entries.push(FailedEntry {
                        name: "license.dat".into(),
                        reason: e.to_string(),
                    });
                }
            }
        }

        // The inner file system, when the package carries one.
        if self.pkg.pfs_image().is_some()
            && self.pkg.is_file_system_accessible()
            && self.export_pfs(output, &mut project)?
        {
            report.cancelled = true;
            return Ok(report);
        }

        // The project file is the last write; only then is the export done.
        let gp4_path = output.join("Project.gp4");
        project.save(&gp4_path).map_err(|e| ExportError::WriteFailed {
            path: gp4_path,
            source: e,
        })?;

        self.progress.progress(100, "project written");

        Ok(report)
    }

    /// Exports the non-generated meta entries into `sce_sys/`.
    ///
    /// Returns `true` when cancelled.
    fn export_entries(
        &self,
        output: &Path,
        project: &mut Gp4Project,
        report: &mut ExportReport,
    ) -> Result<bool, ExportError> {
        for item in self.pkg.entries() {
            if self.cancel.is_cancelled() {
                return Ok(true);
            }

            let (index, entry) =
                item.map_err(|source| ExportError::ReadEntryFailed { source })?;

            // Entries regenerated at packaging time never land in a project.
            if entry.entry_id().is_generated() {
                continue;
            }

            // Entries with no known name cannot be placed.
            let Some(rel) = entry.to_path(Path::new("sce_sys")) else {
                continue;
            };

            let rel_str = project_path(&rel);
            let path = output.join(&rel);

            let data = match self.pkg.extract_entry(index, &entry, self.decrypt_entries) {
                Ok(data) => data,
                Err(e) => {
                    warn!("skipping {rel_str}: {e}");
                    self.progress.entry_skipped(&rel_str, &e.to_string());
                    report.failed_entries.push(FailedEntry {
                        name: rel_str,
                        reason: e.to_string(),
                    });
                    continue;
                }
            };

            if let Some(parent) = path.parent() {
                create_dir_all(parent).map_err(|e| ExportError::CreateDirectoryFailed {
                    path: parent.to_path_buf(),
                    source: e,
                })?;
            }

            let mut file = File::create(&path).map_err(|e| ExportError::CreateFileFailed {
                path: path.clone(),
                source: e,
            })?;

            file.write_all(&data).map_err(|e| ExportError::WriteFailed {
                path: path.clone(),
                source: e,
            })?;

            if let Some(parent) = rel.parent().filter(|p| !p.as_os_str().is_empty()) {
                project.add_dir(&project_path(parent));
            }
            project.add_file(&rel_str);
        }

        Ok(false)
    }

    /// Reads `c_date`/`c_time` out of `PUBTOOLINFO`, records the creation
    /// date, and rewrites `param.sfo` without the publishing fields.
    fn scrub_param_sfo(&self, output: &Path, project: &mut Gp4Project, report: &mut ExportReport) {
        let path = output.join("sce_sys").join("param.sfo");

        let Ok(raw) = std::fs::read(&path) else {
            return;
        };

        let mut sfo = match aeolia_sfo::Sfo::parse(&raw) {
            Ok(sfo) => sfo,
            Err(e) => {
                // Without decryption the file is ciphertext; that is expected.
                if self.decrypt_entries {
                    warn!("cannot parse param.sfo: {e}");
                    report.failed_entries.push(FailedEntry {
                        name: "sce_sys/param.sfo".into(),
                        reason: e.to_string(),
                    });
                }
                return;
            }
        };

        if let Some(info) = sfo.get_str("PUBTOOLINFO")
            && let Some(date) = creation_date_from_pubtoolinfo(info)
        {
            project.creation_date = date;
        }

        sfo.remove("PUBTOOLINFO");
        sfo.remove("PUBTOOLVER");

        if let Err(e) = std::fs::write(&path, sfo.serialize()) {
            warn!("cannot rewrite param.sfo: {e}");
            report.failed_entries.push(FailedEntry {
                name: "sce_sys/param.sfo".into(),
                reason: e.to_string(),
            });
        }
    }

    /// Exports the inner PFS tree breadth-first, in dirent order.
    ///
    /// Returns `true` when cancelled.
    fn export_pfs(&self, output: &Path, project: &mut Gp4Project) -> Result<bool, ExportError> {
        let outer = self
            .pkg
            .open_pfs()
            .map_err(|source| ExportError::OpenOuterPfsFailed { source })?;

        let mut outer_root =
            outer
                .root()
                .open()
                .map_err(|source| ExportError::OpenPfsDirectoryFailed {
                    path: "/".into(),
                    source,
                })?;

        let mut outer_uroot = match outer_root.remove(b"uroot") {
            Some(DirEntry::Directory(d)) => {
                d.open()
                    .map_err(|source| ExportError::OpenPfsDirectoryFailed {
                        path: "/uroot".into(),
                        source,
                    })?
            }
            _ => return Err(ExportError::NoOuterUroot),
        };

        let inner_file = match outer_uroot.remove(b"pfs_image.dat") {
            Some(DirEntry::File(f)) => f,
            _ => return Err(ExportError::NoInnerImage),
        };

        // The inner image is usually PFSC-wrapped; plain images chain
        // directly.
        let is_compressed = inner_file.is_compressed();
        let file_image = inner_file.into_image();

        let inner_image: Box<dyn Image + '_> = if is_compressed {
            let pfsc = PfscImage::open(file_image)
                .map_err(|source| ExportError::CreateDecompressorFailed { source })?;
            Box::new(pfsc)
        } else {
            Box::new(file_image)
        };

        let inner = aeolia_pfs::open_image(inner_image)
            .map_err(|source| ExportError::OpenInnerPfsFailed { source })?;

        project.volume_timestamp = format_timestamp(inner.timestamp());

        let mut inner_root =
            inner
                .root()
                .open()
                .map_err(|source| ExportError::OpenPfsDirectoryFailed {
                    path: "/".into(),
                    source,
                })?;

        let inner_uroot = match inner_root.remove(b"uroot") {
            Some(DirEntry::Directory(d)) => d,
            _ => return Err(ExportError::NoInnerUroot),
        };

        // Phase 1: breadth-first walk collecting directories and files in
        // dirent order. The file list is needed up front for byte-accurate
        // progress.
        struct FileWork<'p> {
            file: PfsFile<'p>,
            path: PathBuf,
            rel: String,
        }

        let mut files: Vec<FileWork<'_>> = Vec::new();
        let mut queue: VecDeque<(Directory<'_>, PathBuf, String)> = VecDeque::new();
        queue.push_back((inner_uroot, output.to_path_buf(), String::new()));

        while let Some((dir, dir_path, rel)) = queue.pop_front() {
            if self.cancel.is_cancelled() {
                return Ok(true);
            }

            let entries = dir
                .open()
                .map_err(|source| ExportError::OpenPfsDirectoryFailed {
                    path: if rel.is_empty() { "/".into() } else { rel.clone() },
                    source,
                })?;

            for (name, item) in entries {
                let name = std::str::from_utf8(&name)
                    .map_err(|_| ExportError::UnsupportedFileName {
                        path: format!("{rel}/<non-utf8>"),
                    })?
                    .to_string();

                let child_rel = if rel.is_empty() {
                    name.clone()
                } else {
                    format!("{rel}/{name}")
                };
                let child_path = dir_path.join(&name);

                match item {
                    DirEntry::Directory(sub) => {
                        create_dir_all(&child_path).map_err(|e| {
                            ExportError::CreateDirectoryFailed {
                                path: child_path.clone(),
                                source: e,
                            }
                        })?;
                        project.add_dir(&child_rel);
                        queue.push_back((sub, child_path, child_rel));
                    }
                    DirEntry::File(file) => files.push(FileWork {
                        file,
                        path: child_path,
                        rel: child_rel,
                    }),
                    _ => unreachable!("DirEntry has no other variants"),
                }
            }
        }

        // Phase 2: stream the files out with byte-based progress.
        let total_bytes: u64 = files.iter().map(|w| w.file.len()).sum();
        let mut bytes_done: u64 = 0;

        for work in &files {
            if self.cancel.is_cancelled() {
                return Ok(true);
            }

            self.write_pfs_file(work.file.clone(), &work.path, &work.rel)?;

            bytes_done += work.file.len();
            let percent = (100 * bytes_done / total_bytes.max(1)).min(99) as u8;
            self.progress.progress(percent, &work.rel);

            project.add_file(&work.rel);
        }

        Ok(false)
    }

    fn write_pfs_file(
        &self,
        file: PfsFile<'_>,
        path: &Path,
        rel: &str,
    ) -> Result<(), ExportError> {
        let mut dest = File::create(path).map_err(|e| ExportError::CreateFileFailed {
            path: path.to_path_buf(),
            source: e,
        })?;

        let mut buffer = vec![0u8; 1024 * 1024];
        let mut offset = 0u64;

        loop {
            let read = match file.read_at(offset, &mut buffer) {
                Ok(0) => break,
                Ok(n) => n,
                Err(e) if e.kind() == std::io::ErrorKind::Interrupted => continue,
                Err(e) => {
                    return Err(ExportError::ReadPfsFileFailed {
                        path: rel.to_string(),
                        source: e,
                    });
                }
            };

            dest.write_all(&buffer[..read])
                .map_err(|e| ExportError::WriteFailed {
                    path: path.to_path_buf(),
                    source: e,
                })?;

            offset += read as u64;
        }

        Ok(())
    }
}

/// Renders a relative path with forward slashes for the project file.
fn project_path(path: &Path) -> String {
    path.components()
        .map(|c| c.as_os_str().to_string_lossy())
        .collect::<Vec<_>>()
        .join("/")
}

/// Formats Unix seconds as `YYYY-MM-DD HH:MM:SS` UTC.
fn format_timestamp(seconds: u64) -> String {
    chrono::DateTime::from_timestamp(seconds as i64, 0)
        .map(|dt| dt.format("%Y-%m-%d %H:%M:%S").to_string())
        .unwrap_or_default()
}

/// Extracts `c_date` and `c_time` from a `key=value,key=value` string.
fn creation_date_from_pubtoolinfo(info: &str) -> Option<String> {
    let mut c_date = None;
    let mut c_time = None;

    for pair in info.split(',') {
        let Some((key, value)) = pair.split_once('=') else {
            continue;
        };

        match key.trim() {
            "c_date" => c_date = Some(value.trim()),
            "c_time" => c_time = Some(value.trim()),
            _ => {}
        }
    }

    let date = c_date.filter(|d| d.len() == 8 && d.bytes().all(|b| b.is_ascii_digit()))?;
    let time = c_time.filter(|t| t.len() == 6 && t.bytes().all(|b| b.is_ascii_digit()))?;

    Some(format!(
        "{}-{}-{} {}:{}:{}",
        &date[0..4],
        &date[4..6],
        &date[6..8],
        &time[0..2],
        &time[2..4],
        &time[4..6]
    ))
}

fn hex(bytes: &[u8]) -> String {
    bytes.iter().map(|b| format!("{b:02x}")).collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pubtoolinfo_dates_parse() {
        assert_eq!(
            creation_date_from_pubtoolinfo("sdk_ver=05050000,c_date=20240131,c_time=235959"),
            Some("2024-01-31 23:59:59".to_string())
        );

        // Both fields are required.
        assert_eq!(creation_date_from_pubtoolinfo("c_date=20240131"), None);
        assert_eq!(creation_date_from_pubtoolinfo("c_date=2024,c_time=1200"), None);
        assert_eq!(creation_date_from_pubtoolinfo(""), None);
    }

    #[test]
    fn timestamps_format_as_utc() {
        assert_eq!(format_timestamp(0), "1970-01-01 00:00:00");
        assert_eq!(format_timestamp(1_600_000_000), "2020-09-13 12:26:40");
    }

    #[test]
    fn cancel_token_flips_once() {
        let token = CancelToken::new();
        assert!(!token.is_cancelled());

        let shared = token.clone();
        shared.cancel();
        assert!(token.is_cancelled());
    }
}
