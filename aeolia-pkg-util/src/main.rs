mod cli;

use aeolia_pkg::keystore::KeyStore;
use aeolia_pkg::validate::ValidationStatus;
use aeolia_pkg_util::{ConsoleProgress, ProjectExporter, SilentProgress};
use aeolia_sfo::{Sfo, Value};
use clap::Parser;
use cli::{Cli, Command};
use snafu::{ResultExt, Snafu};
use std::path::{Path, PathBuf};

/// Top-level application errors for aeolia-pkg-util.
#[derive(Debug, Snafu)]
enum Error {
    #[snafu(display("failed to open PKG file '{}'", path.display()))]
    OpenPkg {
        path: PathBuf,
        source: aeolia_pkg_util::OpenPkgError,
    },

    #[snafu(display("failed to load key store"))]
    LoadKeyStore {
        source: aeolia_pkg::keystore::LoadError,
    },

    #[snafu(display("failed to save key store"))]
    SaveKeyStore {
        source: aeolia_pkg::keystore::SaveError,
    },

    #[snafu(display("passcode was rejected"))]
    Passcode { source: aeolia_pkg::UnlockError },

    #[snafu(display("failed to export PKG"))]
    Export { source: aeolia_pkg_util::ExportError },

    #[snafu(display("failed to read entry"))]
    ReadEntry { source: aeolia_pkg::EntryReadError },

    #[snafu(display("failed to read '{}'", path.display()))]
    ReadSfo {
        path: PathBuf,
        source: std::io::Error,
    },

    #[snafu(display("failed to parse SFO"))]
    ParseSfo { source: aeolia_sfo::ParseError },

    #[snafu(display("failed to get current directory"))]
    GetCurrentDir { source: std::io::Error },
}

type Result<T, E = Error> = std::result::Result<T, E>;

#[snafu::report]
fn main() -> Result<()> {
    env_logger::init();

    let cli = Cli::parse();

    match cli.command {
        Command::Export {
            pkg_path,
            output,
            passcode,
            no_decrypt,
            quiet,
        } => cmd_export(
            &pkg_path,
            output.as_deref(),
            passcode.as_deref(),
            !no_decrypt,
            quiet,
            &cli.keystore,
        ),
        Command::Info { pkg_path } => cmd_info(&pkg_path, &cli.keystore),
        Command::List { pkg_path } => cmd_list(&pkg_path, &cli.keystore),
        Command::Validate { pkg_path, passcode } => {
            cmd_validate(&pkg_path, passcode.as_deref(), &cli.keystore)
        }
        Command::Sfo { sfo_path } => cmd_sfo(&sfo_path),
    }
}

/// Opens a package with the ladder, an optional explicit passcode, and
/// persists any newly cached keys.
fn open_with_store(
    path: &Path,
    passcode: Option<&str>,
    keystore: &Path,
) -> Result<aeolia_pkg::Pkg<memmap2::Mmap>> {
    let mut store = KeyStore::load(keystore).context(LoadKeyStoreSnafu)?;

    let (mut pkg, _) =
        unsafe { aeolia_pkg_util::open_pkg(path, &mut store).context(OpenPkgSnafu { path })? };

    if !pkg.is_file_system_accessible()
        && let Some(passcode) = passcode
    {
        pkg.try_passcode(passcode).context(PasscodeSnafu)?;
        store.set_passcode(pkg.header().content_id().as_str(), passcode);
    }

    store.save(keystore).context(SaveKeyStoreSnafu)?;

    Ok(pkg)
}

fn cmd_export(
    path: &Path,
    output: Option<&Path>,
    passcode: Option<&str>,
    decrypt: bool,
    quiet: bool,
    keystore: &Path,
) -> Result<()> {
    let pkg = open_with_store(path, passcode, keystore)?;

    // Use the title ID from the content ID as default output directory name.
    let output_dir = match output {
        Some(path) => path.to_path_buf(),
        None => {
            let title_id = pkg.header().content_id().title_id();
            std::env::current_dir()
                .context(GetCurrentDirSnafu)?
                .join(title_id)
        }
    };

    if !quiet {
        println!(
            "Exporting {} to {}...",
            path.display(),
            output_dir.display()
        );

        if !pkg.is_file_system_accessible() {
            println!("No file system keys recovered; exporting entries only.");
        }
    }

    let start = std::time::Instant::now();

    let report = if quiet {
        let exporter = ProjectExporter::new(&pkg, SilentProgress, decrypt);
        exporter.export(&output_dir).context(ExportSnafu)?
    } else {
        let progress = ConsoleProgress::new();
        let exporter = ProjectExporter::new(&pkg, progress, decrypt);
        exporter.export(&output_dir).context(ExportSnafu)?
    };

    let elapsed = start.elapsed();

    for failed in &report.failed_entries {
        eprintln!("failed: {} ({})", failed.name, failed.reason);
    }

    if !quiet {
        println!("Done in {:.2}s.", elapsed.as_secs_f64());
    }

    Ok(())
}

fn cmd_info(path: &Path, keystore: &Path) -> Result<()> {
    let pkg = open_with_store(path, None, keystore)?;
    let header = pkg.header();
    let content_id = header.content_id();

    println!("PKG: {}", path.display());
    println!();
    println!("Content ID:     {}", content_id);
    println!("  Service ID:   {}", content_id.service_id());
    println!("  Publisher:    {}", content_id.publisher_code());
    println!("  Title ID:     {}", content_id.title_id());
    println!("  Version:      {}", content_id.version());
    println!("  Label:        {}", content_id.label());
    println!(
        "Content Type:   0x{:02X} ({})",
        header.content_type_raw(),
        header.content_type()
    );
    println!("Content Flags:  {}", header.content_flags());
    println!(
        "DRM Type:       0x{:02X} ({})",
        header.drm_type(),
        header.drm_type_name()
    );
    println!("PKG Size:       {} bytes", header.pkg_size());
    println!("File Count:     {}", header.file_count());
    println!("Entry Count:    {}", header.entry_count());
    println!("Table Offset:   0x{:X}", header.table_offset());
    println!("PFS Offset:     0x{:X}", header.pfs_offset());
    println!("PFS Size:       {} bytes", header.pfs_size());
    println!(
        "File System:    {}",
        if pkg.is_file_system_accessible() {
            "accessible"
        } else {
            "locked"
        }
    );

    Ok(())
}

fn cmd_list(path: &Path, keystore: &Path) -> Result<()> {
    let pkg = open_with_store(path, None, keystore)?;

    println!("Entries in {}:", path.display());
    println!("{:>6}  {:>10}  {:>10}  Name", "Index", "ID", "Size");
    println!("{:-<6}  {:-<10}  {:-<10}  {:-<30}", "", "", "", "");

    for result in pkg.entries() {
        let (index, entry) = result.context(ReadEntrySnafu)?;
        let name = entry
            .name(pkg.entry_names())
            .map(|n| n.into_owned())
            .unwrap_or_else(|| format!("(id: 0x{:08X})", entry.id()));

        println!(
            "{:>6}  0x{:08X}  {:>10}  {}",
            index,
            entry.id(),
            entry.data_size(),
            name
        );
    }

    Ok(())
}

fn cmd_validate(path: &Path, passcode: Option<&str>, keystore: &Path) -> Result<()> {
    let pkg = open_with_store(path, passcode, keystore)?;

    println!("Validating {}:", path.display());
    println!("{:>6}  {:>10}  Check", "Status", "Offset");
    println!("{:-<6}  {:-<10}  {:-<40}", "", "", "");

    let mut failed = 0usize;

    for row in pkg.validate() {
        let status = match row.status {
            ValidationStatus::Ok => "ok",
            ValidationStatus::Fail => {
                failed += 1;
                "FAIL"
            }
            ValidationStatus::NoKey => "nokey",
        };

        println!("{:>6}  0x{:08X}  {}", status, row.location, row.name);
    }

    if failed > 0 {
        println!();
        println!("{failed} check(s) failed.");
    }

    Ok(())
}

fn cmd_sfo(path: &Path) -> Result<()> {
    let raw = std::fs::read(path).context(ReadSfoSnafu { path })?;
    let sfo = Sfo::parse(&raw).context(ParseSfoSnafu)?;

    for entry in sfo.entries() {
        match &entry.value {
            Value::Utf8(s) => println!("{} = \"{}\"", entry.key, s),
            Value::Utf8Special(s) => println!("{} = \"{}\" (special)", entry.key, s),
            Value::Integer(v) => println!("{} = 0x{:08X}", entry.key, v),
            _ => unreachable!("Value has no other variants"),
        }
    }

    Ok(())
}
