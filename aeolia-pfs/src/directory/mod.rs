use snafu::{OptionExt, ResultExt, ensure};

use self::dirent::Dirent;
use crate::Pfs;
use crate::file::File;
use crate::image::Image;
use crate::inode::Inode;
use std::sync::Arc;

pub mod dirent;

/// Errors of [`Directory::open()`].
#[derive(Debug, snafu::Snafu)]
#[non_exhaustive]
pub enum OpenError {
    #[snafu(display("inode #{inode} is not valid"))]
    InvalidInode { inode: usize },

    #[snafu(display("cannot read block #{block}"))]
    ReadBlock { block: u32, source: std::io::Error },

    #[snafu(display("cannot read directory entry"))]
    ReadDirEntry { source: dirent::ReadError },

    #[snafu(display("dirent #{dirent} in block #{block} has invalid size"))]
    DirentInvalidSize { block: u32, dirent: usize },

    #[snafu(display("dirent #{dirent} in block #{block} has unknown type"))]
    DirentUnknownType { block: u32, dirent: usize },
}

/// Represents a directory in the PFS.
///
/// Use [`open()`][Self::open] to read the directory contents.
#[derive(Clone)]
#[must_use]
pub struct Directory<'a> {
    pfs: Arc<Pfs<'a>>,
    inode: usize,
}

impl<'a> std::fmt::Debug for Directory<'a> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Directory")
            .field("inode", &self.inode)
            .field("mode", &self.mode())
            .finish_non_exhaustive()
    }
}

impl<'a> Directory<'a> {
    pub(super) fn new(pfs: Arc<Pfs<'a>>, inode: usize) -> Self {
        Self { pfs, inode }
    }

    /// Returns the inode index for this directory within the PFS.
    #[must_use]
    pub fn inode_index(&self) -> usize {
        self.inode
    }

    #[must_use]
    pub fn mode(&self) -> u16 {
        self.inode_ref().mode()
    }

    #[must_use]
    pub fn flags(&self) -> u32 {
        self.inode_ref().flags().value()
    }

    /// Opens this directory and reads its entries.
    ///
    /// Entries are returned in on-disk dirent order, which is the order
    /// consumers such as the project exporter walk them in.
    pub fn open(&self) -> Result<DirEntries<'a>, OpenError> {
        let blocks = self.pfs.block_map(self.inode);
        let block_size = self.pfs.block_size();
        let img = self.pfs.image();

        // Read all dirents, preserving their on-disk order.
        let mut items: Vec<(Vec<u8>, DirEntry<'a>)> = Vec::new();
        let mut block_data = vec![0; block_size as usize];

        for &block_num in blocks {
            // Read block data via positional read.
            let offset = (block_num as u64) * (block_size as u64);

            img.read_exact_at(offset, &mut block_data)
                .context(ReadBlockSnafu { block: block_num })?;

            // Read dirents in the block.
            let mut next = block_data.as_slice();

            for num in 0_usize.. {
                // Read dirent.
                let dirent = match Dirent::read(&mut next) {
                    Ok(v) => v,
                    Err(dirent::ReadError::TooSmall | dirent::ReadError::EndOfEntry) => {
                        break;
                    }
                    err => err.context(ReadDirEntrySnafu)?,
                };

                // Skip remaining padding.
                next = next
                    .get(dirent.padding_size()..)
                    .context(DirentInvalidSizeSnafu {
                        block: block_num,
                        dirent: num,
                    })?;

                // Check if inode valid.
                let inode = dirent.inode();
                ensure!(inode < self.pfs.inode_count(), InvalidInodeSnafu { inode });

                // Construct object.
                let entry = match dirent.ty() {
                    Dirent::FILE => DirEntry::File(File::new(self.pfs.clone(), inode)),
                    Dirent::DIRECTORY => {
                        DirEntry::Directory(Directory::new(self.pfs.clone(), inode))
                    }
                    Dirent::SELF | Dirent::PARENT => continue,
                    _ => {
                        return Err(DirentUnknownTypeSnafu {
                            block: block_num,
                            dirent: num,
                        }
                        .build());
                    }
                };

                items.push((dirent.name().to_vec(), entry));
            }
        }

        Ok(DirEntries { items })
    }

    fn inode_ref(&self) -> &Inode {
        self.pfs.inode(self.inode)
    }
}

/// Represents a collection of entries in a directory.
///
/// This type preserves the on-disk dirent order. It can be iterated over or
/// queried by name.
#[derive(Debug)]
#[must_use]
pub struct DirEntries<'a> {
    items: Vec<(Vec<u8>, DirEntry<'a>)>,
}

impl<'a> DirEntries<'a> {
    /// Returns the number of entries in the directory.
    #[must_use]
    pub fn len(&self) -> usize {
        self.items.len()
    }

    /// Returns `true` if the directory is empty.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    /// Returns a reference to the entry with the given name.
    #[must_use]
    pub fn get(&self, name: &[u8]) -> Option<&DirEntry<'a>> {
        self.items
            .iter()
            .find(|(n, _)| n.as_slice() == name)
            .map(|(_, e)| e)
    }

    /// Removes and returns the entry with the given name.
    pub fn remove(&mut self, name: &[u8]) -> Option<DirEntry<'a>> {
        let pos = self.items.iter().position(|(n, _)| n.as_slice() == name)?;
        Some(self.items.remove(pos).1)
    }

    /// Returns an iterator over the entries in on-disk order.
    pub fn iter(&self) -> impl Iterator<Item = (&[u8], &DirEntry<'a>)> {
        self.items.iter().map(|(n, e)| (n.as_slice(), e))
    }

    /// Returns an iterator over the entry names in on-disk order.
    pub fn names(&self) -> impl Iterator<Item = &[u8]> {
        self.items.iter().map(|(n, _)| n.as_slice())
    }
}

impl<'a> IntoIterator for DirEntries<'a> {
    type Item = (Vec<u8>, DirEntry<'a>);
    type IntoIter = std::vec::IntoIter<(Vec<u8>, DirEntry<'a>)>;

    fn into_iter(self) -> Self::IntoIter {
        self.items.into_iter()
    }
}

/// Represents an entry in a directory (either a file or subdirectory).
#[derive(Debug, Clone)]
#[non_exhaustive]
pub enum DirEntry<'a> {
    /// A subdirectory.
    Directory(Directory<'a>),
    /// A file.
    File(File<'a>),
}
