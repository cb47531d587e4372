//! A library for reading PlayStation 4 PFS (PlayStation File System) images.
//!
//! This crate provides functionality to parse and read files from PFS images,
//! which are used by the PlayStation 4 to store game data and other content.
//!
//! # Features
//!
//! - Parse PFS superblocks, inodes and directories
//! - Support for both encrypted and plaintext images
//! - Random access into PFSC-compressed streams
//! - Flat path table building, parsing and lookup
//! - Thread-safe: all read operations use positional I/O (`read_at`) —
//!   no shared mutable cursor, no locks in the read path
//!
//! # Example
//!
//! ```no_run
//! // Open a PFS image from a byte slice (e.g. memory-mapped file)
//! let data = std::fs::read("image.pfs").unwrap();
//! let pfs = aeolia_pfs::open_slice(&data, None).unwrap();
//!
//! // Access the root directory
//! let root = pfs.root();
//! ```
//!
//! # References
//!
//! - [PS4 Developer Wiki - PFS](https://www.psdevwiki.com/ps4/PFS)

use crate::header::Mode;

use self::directory::Directory;
use self::header::PfsHeader;
use self::inode::Inode;
use aes::Aes128;
use aes::cipher::KeyInit;
use snafu::{OptionExt, ResultExt, Snafu, ensure};
use std::sync::Arc;
use xts_mode::Xts128;

pub mod directory;
pub mod file;
pub mod flat;
pub mod header;
pub mod image;
pub mod inode;
pub mod pfsc;

/// Shared errors for PFS open operations.
///
/// These errors can occur in both [`open_slice()`] and [`open_image()`] during
/// the common phase: validating the superblock, reading inodes, and
/// precomputing block maps.
#[derive(Debug, Snafu)]
#[non_exhaustive]
pub enum OpenError {
    #[snafu(display("invalid block size"))]
    InvalidBlockSize,

    #[snafu(display("cannot read block #{block}"))]
    ReadBlockFailed { block: u32, source: std::io::Error },

    #[snafu(display("invalid super-root"))]
    InvalidSuperRoot,

    #[snafu(display("cannot load block map for inode #{inode}"))]
    LoadBlockMapFailed {
        inode: usize,
        source: inode::LoadBlocksError,
    },
}

/// Errors for [`open_slice()`].
#[derive(Debug, Snafu)]
#[snafu(module)]
#[non_exhaustive]
pub enum OpenSliceError {
    #[snafu(display("cannot parse superblock"))]
    ReadHeaderFailed { source: header::ReadError },

    #[snafu(display("block size too small for encryption"))]
    EncryptionBlockSizeTooSmall,

    #[snafu(display("encryption required but no key is provided"))]
    EmptyEkpfs,

    #[snafu(transparent)]
    Open { source: OpenError },
}

/// Errors for [`open_image()`].
#[derive(Debug, Snafu)]
#[snafu(module)]
#[non_exhaustive]
pub enum OpenImageError {
    #[snafu(display("cannot read superblock from image"))]
    ReadHeaderIoFailed { source: std::io::Error },

    #[snafu(display("cannot parse superblock"))]
    ReadHeaderFailed { source: header::ReadError },

    #[snafu(display("unsupported mode: {mode}"))]
    UnsupportedMode { mode: Mode },

    #[snafu(transparent)]
    Open { source: OpenError },
}

/// Represents a loaded PFS.
///
/// This type is `Send + Sync` and can be shared across threads via [`Arc`].
/// All read operations use positional I/O, so concurrent reads from multiple
/// threads do not require synchronization.
#[must_use]
pub struct Pfs<'a> {
    image: Box<dyn image::Image + 'a>,
    inodes: Vec<Inode>,
    /// Precomputed block maps: `block_maps[inode_index]` gives the
    /// logical-block -> physical-block mapping for that inode.
    block_maps: Vec<Vec<u32>>,
    root: usize,
    block_size: u32,
    timestamp: u64,
    /// Backing data for unencrypted, slice-backed images (from [`open_slice()`]).
    /// Enables zero-copy file access via [`file::File::as_slice()`].
    data: Option<&'a [u8]>,
}

impl<'a> std::fmt::Debug for Pfs<'a> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Pfs")
            .field("inode_count", &self.inodes.len())
            .field("root", &self.root)
            .field("block_size", &self.block_size)
            .field("slice_backed", &self.data.is_some())
            .finish_non_exhaustive()
    }
}

impl<'a> Pfs<'a> {
    /// Returns the number of inodes in this PFS.
    ///
    /// This represents the total number of files and directories in the filesystem.
    #[must_use]
    pub fn inode_count(&self) -> usize {
        self.inodes.len()
    }

    /// Returns the super-root directory of this PFS.
    ///
    /// The super-root contains `uroot` (the user-visible tree) and
    /// `flat_path_table`, plus the collision resolver `cr` when present.
    pub fn root(self: &Arc<Self>) -> Directory<'a> {
        Directory::new(self.clone(), self.root)
    }

    /// Returns the block size used by this PFS.
    #[must_use]
    pub fn block_size(&self) -> u32 {
        self.block_size
    }

    /// Returns the volume timestamp as seconds since the Unix epoch.
    #[must_use]
    pub fn timestamp(&self) -> u64 {
        self.timestamp
    }

    // --- Internal accessors for File / Directory / PfsFileImage ---

    pub(crate) fn image(&self) -> &dyn image::Image {
        &*self.image
    }

    pub(crate) fn inode(&self, index: usize) -> &Inode {
        &self.inodes[index]
    }

    pub(crate) fn block_map(&self, inode: usize) -> &[u32] {
        &self.block_maps[inode]
    }

    pub(crate) fn backing_data(&self) -> Option<&'a [u8]> {
        self.data
    }
}

/// Opens a PFS image for reading from a byte slice.
///
/// This is the primary entry point when the image data is already in memory.
///
/// For unencrypted images, this avoids intermediate buffer allocations during
/// superblock and inode parsing by reading directly from the slice, and
/// enables zero-copy file access via [`file::File::as_slice()`].
///
/// # Arguments
///
/// * `data` - The PFS image data as a byte slice
/// * `ekpfs` - The EKPFS key for encrypted images, or `None` for plaintext images
///
/// # Errors
///
/// Returns an [`OpenSliceError`] if:
/// - The superblock is invalid
/// - The image is encrypted but no key is provided
/// - The block structure is invalid
pub fn open_slice<'a>(
    data: &'a [u8],
    ekpfs: Option<&[u8]>,
) -> Result<Arc<Pfs<'a>>, OpenSliceError> {
    // Parse superblock directly from the slice.
    let header = PfsHeader::from_bytes(data).context(open_slice_error::ReadHeaderFailedSnafu)?;

    if !header.mode().is_encrypted() {
        let image = Box::new(image::UnencryptedSlice::new(data));
        return Ok(open_inner(image, &header, Some(data))?);
    }

    let ekpfs_bytes = ekpfs.context(open_slice_error::EmptyEkpfsSnafu)?;
    let (data_key, tweak_key) = image::get_xts_keys(ekpfs_bytes, header.key_seed());

    open_slice_with_keys(data, &data_key, &tweak_key)
}

/// Opens an encrypted PFS image with explicit XTS data and tweak keys.
///
/// Used when the keys were recovered directly rather than derived from an
/// EKPFS. For plaintext images this behaves like [`open_slice()`] and the
/// keys are ignored.
pub fn open_slice_with_keys<'a>(
    data: &'a [u8],
    data_key: &[u8; 16],
    tweak_key: &[u8; 16],
) -> Result<Arc<Pfs<'a>>, OpenSliceError> {
    let header = PfsHeader::from_bytes(data).context(open_slice_error::ReadHeaderFailedSnafu)?;

    let (image, backing_data): (Box<dyn image::Image + 'a>, Option<&'a [u8]>) =
        if header.mode().is_encrypted() {
            // One XTS sector is one PFS block; AES needs at least one block.
            ensure!(
                header.block_size() >= 16,
                open_slice_error::EncryptionBlockSizeTooSmallSnafu
            );

            let cipher_1 = Aes128::new(data_key.into());
            let cipher_2 = Aes128::new(tweak_key.into());

            let enc = image::EncryptedSlice::new(
                data,
                Xts128::<Aes128>::new(cipher_1, cipher_2),
                header.block_size() as usize,
                1,
            );

            (Box::new(enc), None)
        } else {
            (Box::new(image::UnencryptedSlice::new(data)), Some(data))
        };

    Ok(open_inner(image, &header, backing_data)?)
}

/// Opens a PFS image for reading from any [`Image`](image::Image) implementation.
///
/// This is used when the PFS image is behind a transformation layer (e.g.
/// a file within another PFS, optionally PFSC-compressed). The image is read
/// entirely through [`Image::read_at()`](image::Image::read_at).
///
/// # Errors
///
/// Returns an [`OpenImageError`] if the superblock or block structure is
/// invalid, or if the image reports itself as encrypted (decryption layers
/// sit below this entry point).
pub fn open_image<'a>(image: impl image::Image + 'a) -> Result<Arc<Pfs<'a>>, OpenImageError> {
    // Read superblock via positional read.
    let mut header_buf = [0u8; header::HEADER_SIZE];

    image
        .read_exact_at(0, &mut header_buf)
        .context(open_image_error::ReadHeaderIoFailedSnafu)?;

    let header =
        PfsHeader::from_bytes(&header_buf).context(open_image_error::ReadHeaderFailedSnafu)?;

    ensure!(
        !header.mode().is_encrypted(),
        open_image_error::UnsupportedModeSnafu {
            mode: header.mode()
        }
    );

    Ok(open_inner(Box::new(image), &header, None)?)
}

/// Shared implementation for [`open_slice()`] and [`open_image()`].
///
/// Validates the superblock fields, reads inodes, precomputes block maps,
/// and constructs the [`Pfs`].
fn open_inner<'a>(
    image: Box<dyn image::Image + 'a>,
    header: &PfsHeader,
    data: Option<&'a [u8]>,
) -> Result<Arc<Pfs<'a>>, OpenError> {
    let mode = header.mode();
    let block_size = header.block_size();
    let inode_count = header.inode_count();
    let inode_block_count = header.inode_block_count();
    let super_root = header.super_root_inode();

    ensure!(
        block_size > 0 && block_size.is_power_of_two(),
        InvalidBlockSizeSnafu
    );

    // Read and parse all inodes.
    let mut inodes: Vec<Inode> = Vec::with_capacity(inode_count);
    let mut block_buf = vec![0; block_size as usize];

    for block_num in 0..inode_block_count {
        let offset = (block_size as u64) + (block_num as u64) * (block_size as u64);

        image
            .read_exact_at(offset, &mut block_buf)
            .context(ReadBlockFailedSnafu { block: block_num })?;

        if parse_inodes_from_block(&block_buf, mode, &mut inodes, inode_count) {
            break;
        }
    }

    ensure!(super_root < inodes.len(), InvalidSuperRootSnafu);

    // Precompute block maps for all inodes.
    let block_maps = precompute_block_maps(&inodes, image.as_ref(), block_size)?;

    Ok(Arc::new(Pfs {
        image,
        inodes,
        block_maps,
        root: super_root,
        block_size,
        timestamp: header.timestamp(),
        data,
    }))
}

/// Precomputes block maps for all inodes.
fn precompute_block_maps(
    inodes: &[Inode],
    image: &dyn image::Image,
    block_size: u32,
) -> Result<Vec<Vec<u32>>, OpenError> {
    let mut maps = Vec::with_capacity(inodes.len());

    for (i, inode) in inodes.iter().enumerate() {
        let block_map = inode
            .load_block_map(image, block_size)
            .context(LoadBlockMapFailedSnafu { inode: i })?;
        maps.push(block_map);
    }

    Ok(maps)
}

/// Parses inodes from a single block of data.
///
/// Returns `true` if all expected inodes have been parsed, `false` if more
/// blocks are needed (the current block was exhausted before reaching
/// `inode_count`).
fn parse_inodes_from_block(
    block_data: &[u8],
    mode: Mode,
    inodes: &mut Vec<Inode>,
    inode_count: usize,
) -> bool {
    let reader = if mode.is_signed() {
        Inode::from_raw32_signed
    } else {
        Inode::from_raw32_unsigned
    };

    let mut src = block_data;

    while inodes.len() < inode_count {
        let inode = match reader(inodes.len(), &mut src) {
            Ok(v) => v,
            Err(inode::FromRawError::TooSmall) => return false,
        };

        inodes.push(inode);
    }

    true
}

#[cfg(test)]
mod tests {
    use super::directory::DirEntry;
    use super::directory::dirent::Dirent;
    use super::flat::{FlatNode, FlatPathTable, Lookup};
    use super::image::{block_tweak, get_xts_keys};
    use super::*;

    const BS: usize = 0x800;
    const MODE_DIR: u16 = 0x4000;
    const MODE_FILE: u16 = 0x8000;

    fn pattern(seed: u8, len: usize) -> Vec<u8> {
        (0..len).map(|i| seed.wrapping_add(i as u8)).collect()
    }

    /// Emits one unsigned inode record: 100-byte header plus 17 plain
    /// 4-byte block pointers, contiguous from `first_block`.
    fn push_inode(table: &mut Vec<u8>, mode: u16, size: u64, blocks: u32, first_block: u32) {
        let start = table.len();
        table.resize(start + 100, 0);
        table[start..start + 2].copy_from_slice(&mode.to_le_bytes());
        table[start + 2..start + 4].copy_from_slice(&1u16.to_le_bytes()); // nlink
        table[start + 8..start + 16].copy_from_slice(&size.to_le_bytes());
        table[start + 16..start + 24].copy_from_slice(&size.to_le_bytes()); // size_compressed
        table[start + 96..start + 100].copy_from_slice(&blocks.to_le_bytes());

        // Direct pointers: contiguous-run marker in slot 1.
        table.extend_from_slice(&first_block.to_le_bytes());
        table.extend_from_slice(&0xffffffffu32.to_le_bytes());
        table.extend_from_slice(&[0u8; 10 * 4]);
        // Indirect pointers.
        table.extend_from_slice(&[0u8; 5 * 4]);
    }

    fn dirents(entries: &[(&[u8], u32, u32)]) -> Vec<u8> {
        let mut out = Vec::new();
        for &(name, ino, ty) in entries {
            out.extend_from_slice(&Dirent::encode(ino, ty, name));
        }
        out.resize(BS, 0);
        out
    }

    /// Builds a plaintext unsigned PFS: superblock, one inode block, data
    /// blocks from block 2. Returns the image and the flat path table used
    /// for the `flat_path_table` file.
    fn build_pfs(timestamp: u64) -> (Vec<u8>, FlatPathTable) {
        let eboot = pattern(0x11, 0x200);
        let level1 = pattern(0x22, 0x900);

        let fpt = FlatPathTable::build(&[
            FlatNode {
                path: "/eboot.bin".into(),
                inode: 3,
                is_dir: false,
            },
            FlatNode {
                path: "/data".into(),
                inode: 4,
                is_dir: true,
            },
            FlatNode {
                path: "/data/level1.dat".into(),
                inode: 5,
                is_dir: false,
            },
        ])
        .unwrap();
        let fpt_bytes = fpt.write();

        // Inode table: 0 super_root, 1 flat_path_table, 2 uroot, 3 eboot,
        // 4 data, 5 level1.dat. Data blocks: D0=2 .. D5=7 (level1 spans 7-8).
        let mut table = Vec::new();
        push_inode(&mut table, MODE_DIR, BS as u64, 1, 2);
        push_inode(&mut table, MODE_FILE, fpt_bytes.len() as u64, 1, 3);
        push_inode(&mut table, MODE_DIR, BS as u64, 1, 4);
        push_inode(&mut table, MODE_FILE, eboot.len() as u64, 1, 5);
        push_inode(&mut table, MODE_DIR, BS as u64, 1, 6);
        push_inode(&mut table, MODE_FILE, level1.len() as u64, 2, 7);

        let mut image = vec![0u8; BS];
        image[0x00..0x08].copy_from_slice(&1u64.to_le_bytes()); // version
        image[0x08..0x10].copy_from_slice(&20130315u64.to_le_bytes()); // format
        image[0x20..0x24].copy_from_slice(&(BS as u32).to_le_bytes());
        image[0x28..0x30].copy_from_slice(&9u64.to_le_bytes()); // nblock
        image[0x30..0x38].copy_from_slice(&6u64.to_le_bytes()); // ndinode
        image[0x38..0x40].copy_from_slice(&7u64.to_le_bytes()); // ndblock
        image[0x40..0x48].copy_from_slice(&1u64.to_le_bytes()); // ndinodeblock
        image[0x48..0x50].copy_from_slice(&0u64.to_le_bytes()); // superroot_ino
        // Inode-block signature: only the atime slot matters to readers.
        image[0x50 + 0x18..0x50 + 0x20].copy_from_slice(&timestamp.to_le_bytes());
        image[0x370..0x380].copy_from_slice(&[0xA7; 16]); // key seed

        // Inode block.
        table.resize(BS, 0);
        image.extend_from_slice(&table);

        // Data blocks.
        image.extend_from_slice(&dirents(&[
            (b"uroot", 2, Dirent::DIRECTORY),
            (b"flat_path_table", 1, Dirent::FILE),
        ]));
        let mut fpt_block = fpt_bytes.clone();
        fpt_block.resize(BS, 0);
        image.extend_from_slice(&fpt_block);
        image.extend_from_slice(&dirents(&[
            (b"eboot.bin", 3, Dirent::FILE),
            (b"data", 4, Dirent::DIRECTORY),
        ]));
        let mut eboot_block = eboot.clone();
        eboot_block.resize(BS, 0);
        image.extend_from_slice(&eboot_block);
        image.extend_from_slice(&dirents(&[(b"level1.dat", 5, Dirent::FILE)]));
        let mut level1_blocks = level1.clone();
        level1_blocks.resize(2 * BS, 0);
        image.extend_from_slice(&level1_blocks);

        (image, fpt)
    }

    fn walk_to_inode(pfs: &Arc<Pfs<'_>>, path: &str) -> usize {
        let mut entries = pfs.root().open().unwrap();
        let mut current = match entries.remove(b"uroot").unwrap() {
            DirEntry::Directory(d) => d,
            _ => panic!("uroot is not a directory"),
        };

        let mut components = path.trim_start_matches('/').split('/').peekable();

        loop {
            let name = components.next().unwrap();
            let entries = current.open().unwrap();

            match entries.get(name.as_bytes()).unwrap() {
                DirEntry::Directory(d) if components.peek().is_some() => current = d.clone(),
                DirEntry::Directory(d) => return d.inode_index(),
                DirEntry::File(f) => {
                    assert!(components.peek().is_none());
                    return f.inode_index();
                }
            }
        }
    }

    #[test]
    fn open_plaintext_image() {
        let (image, _) = build_pfs(1_700_000_000);
        let pfs = open_slice(&image, None).unwrap();

        assert_eq!(pfs.inode_count(), 6);
        assert_eq!(pfs.block_size(), BS as u32);
        assert_eq!(pfs.timestamp(), 1_700_000_000);
    }

    #[test]
    fn directory_entries_keep_dirent_order() {
        let (image, _) = build_pfs(0);
        let pfs = open_slice(&image, None).unwrap();

        let root = pfs.root().open().unwrap();
        let names: Vec<&[u8]> = root.names().collect();
        assert_eq!(names, [&b"uroot"[..], &b"flat_path_table"[..]]);

        let uroot = match root.get(b"uroot").unwrap() {
            DirEntry::Directory(d) => d.open().unwrap(),
            _ => panic!("uroot is not a directory"),
        };
        let names: Vec<&[u8]> = uroot.names().collect();
        assert_eq!(names, [&b"eboot.bin"[..], &b"data"[..]]);
    }

    #[test]
    fn file_reads_and_zero_copy_agree() {
        let (image, _) = build_pfs(0);
        let pfs = open_slice(&image, None).unwrap();

        let mut uroot = match pfs.root().open().unwrap().remove(b"uroot").unwrap() {
            DirEntry::Directory(d) => d.open().unwrap(),
            _ => panic!(),
        };

        let eboot = match uroot.remove(b"eboot.bin").unwrap() {
            DirEntry::File(f) => f,
            _ => panic!(),
        };

        assert_eq!(eboot.len(), 0x200);

        let mut buf = vec![0u8; 0x200];
        eboot.read_at(0, &mut buf).unwrap();
        assert_eq!(buf, pattern(0x11, 0x200));
        assert_eq!(eboot.as_slice().unwrap(), pattern(0x11, 0x200).as_slice());
    }

    #[test]
    fn multi_block_file_reads_across_boundary() {
        let (image, _) = build_pfs(0);
        let pfs = open_slice(&image, None).unwrap();
        let ino = walk_to_inode(&pfs, "/data/level1.dat");
        assert_eq!(ino, 5);

        let pfs2 = pfs.clone();
        let mut uroot = match pfs2.root().open().unwrap().remove(b"uroot").unwrap() {
            DirEntry::Directory(d) => d.open().unwrap(),
            _ => panic!(),
        };
        let mut data = match uroot.remove(b"data").unwrap() {
            DirEntry::Directory(d) => d.open().unwrap(),
            _ => panic!(),
        };
        let level1 = match data.remove(b"level1.dat").unwrap() {
            DirEntry::File(f) => f,
            _ => panic!(),
        };

        let expected = pattern(0x22, 0x900);
        let mut buf = vec![0u8; 0x900];
        level1.read_at(0, &mut buf).unwrap();
        assert_eq!(buf, expected);

        // Window straddling the block boundary.
        let mut window = vec![0u8; 0x100];
        level1.read_at(BS as u64 - 0x80, &mut window).unwrap();
        assert_eq!(window, &expected[BS - 0x80..BS + 0x80]);
    }

    #[test]
    fn file_reader_supports_read_and_seek() {
        use std::io::{Read, Seek, SeekFrom};

        let (image, _) = build_pfs(0);
        let pfs = open_slice(&image, None).unwrap();

        let mut uroot = match pfs.root().open().unwrap().remove(b"uroot").unwrap() {
            DirEntry::Directory(d) => d.open().unwrap(),
            _ => panic!(),
        };
        let eboot = match uroot.remove(b"eboot.bin").unwrap() {
            DirEntry::File(f) => f,
            _ => panic!(),
        };

        let mut reader = eboot.reader();
        let mut all = Vec::new();
        reader.read_to_end(&mut all).unwrap();
        assert_eq!(all, pattern(0x11, 0x200));

        // Seek back relative to the end and reread the tail.
        reader.seek(SeekFrom::End(-0x10)).unwrap();
        let mut tail = Vec::new();
        reader.read_to_end(&mut tail).unwrap();
        assert_eq!(tail, &pattern(0x11, 0x200)[0x1F0..]);
    }

    #[test]
    fn flat_path_table_agrees_with_tree_walk() {
        let (image, _) = build_pfs(0);
        let pfs = open_slice(&image, None).unwrap();

        let fpt_file = match pfs.root().open().unwrap().remove(b"flat_path_table").unwrap() {
            DirEntry::File(f) => f,
            _ => panic!(),
        };

        let table = FlatPathTable::parse(fpt_file.as_slice().unwrap()).unwrap();

        for path in ["/eboot.bin", "/data", "/data/level1.dat"] {
            let inode = match table.lookup(path).unwrap() {
                Lookup::Direct { inode, .. } => inode as usize,
                Lookup::Collision { .. } => panic!("unexpected collision for {path}"),
            };
            assert_eq!(inode, walk_to_inode(&pfs, path), "lookup of {path}");
        }
    }

    #[test]
    fn encrypted_image_roundtrip() {
        let (mut image, _) = build_pfs(42);

        // Flip on the encrypted mode bit and encrypt everything after the
        // superblock block.
        image[0x1C..0x1E].copy_from_slice(&0x4u16.to_le_bytes());

        let ekpfs = [0x5Au8; 32];
        let seed = [0xA7u8; 16];
        let (data_key, tweak_key) = get_xts_keys(&ekpfs, &seed);
        let cipher = Xts128::<Aes128>::new(
            Aes128::new((&data_key).into()),
            Aes128::new((&tweak_key).into()),
        );

        for (i, chunk) in image.chunks_mut(BS).enumerate().skip(1) {
            cipher.encrypt_sector(chunk, block_tweak(i as u64));
        }

        // No key -> refused.
        assert!(matches!(
            open_slice(&image, None),
            Err(OpenSliceError::EmptyEkpfs)
        ));

        let pfs = open_slice(&image, Some(&ekpfs)).unwrap();
        assert_eq!(pfs.inode_count(), 6);
        assert_eq!(pfs.timestamp(), 42);

        // File contents decrypt transparently.
        let mut uroot = match pfs.root().open().unwrap().remove(b"uroot").unwrap() {
            DirEntry::Directory(d) => d.open().unwrap(),
            _ => panic!(),
        };
        let eboot = match uroot.remove(b"eboot.bin").unwrap() {
            DirEntry::File(f) => f,
            _ => panic!(),
        };

        // Encrypted images never expose zero-copy slices.
        assert!(eboot.as_slice().is_none());

        let mut buf = vec![0u8; 0x200];
        eboot.read_at(0, &mut buf).unwrap();
        assert_eq!(buf, pattern(0x11, 0x200));
    }

    #[test]
    fn open_via_image_adapter() {
        let (image, _) = build_pfs(0);
        let pfs = open_image(image::UnencryptedSlice::new(&image)).unwrap();
        assert_eq!(pfs.inode_count(), 6);

        // Image-backed files have no zero-copy path.
        let fpt_file = match pfs.root().open().unwrap().remove(b"flat_path_table").unwrap() {
            DirEntry::File(f) => f,
            _ => panic!(),
        };
        assert!(fpt_file.as_slice().is_none());
    }
}
