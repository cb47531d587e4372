use std::io::Read;

use snafu::{Snafu, ensure};
use zerocopy::{FromBytes, Immutable, IntoBytes, KnownLayout, little_endian::U32};

/// Errors when reading a directory entry.
#[derive(Debug, Snafu)]
#[non_exhaustive]
pub enum ReadError {
    #[snafu(display("i/o failed"))]
    IoFailed { source: std::io::Error },

    #[snafu(display("data too small"))]
    TooSmall,

    #[snafu(display("end of entry"))]
    EndOfEntry,
}

impl From<std::io::Error> for ReadError {
    fn from(v: std::io::Error) -> Self {
        if v.kind() == std::io::ErrorKind::UnexpectedEof {
            ReadError::TooSmall
        } else {
            ReadError::IoFailed { source: v }
        }
    }
}

/// Raw directory entry header (16 bytes).
///
/// https://www.psdevwiki.com/ps4/PFS#Dirents
#[derive(FromBytes, IntoBytes, Immutable, KnownLayout)]
#[repr(C)]
struct DirentRaw {
    ino: U32,
    ty: U32,
    namelen: U32,
    entsize: U32,
}

pub(crate) struct Dirent {
    raw: DirentRaw,
    name: Vec<u8>,
}

impl Dirent {
    pub const FILE: u32 = 2;
    pub const DIRECTORY: u32 = 3;
    pub const SELF: u32 = 4;
    pub const PARENT: u32 = 5;

    pub fn read<F: Read>(from: &mut F) -> Result<Self, ReadError> {
        // Read fixed header.
        let mut header_buf = [0u8; size_of::<DirentRaw>()];
        from.read_exact(&mut header_buf)?;

        let raw =
            DirentRaw::read_from_bytes(&header_buf).expect("header buffer is correctly sized");

        ensure!(raw.entsize.get() != 0, EndOfEntrySnafu);

        // Read name.
        let mut name = vec![0u8; raw.namelen.get() as usize];
        from.read_exact(&mut name)?;

        Ok(Self { raw, name })
    }

    /// Encodes a dirent record: 16-byte header, name, zero padding up to an
    /// 8-byte-aligned entry size.
    pub(crate) fn encode(inode: u32, ty: u32, name: &[u8]) -> Vec<u8> {
        let entsize = (size_of::<DirentRaw>() + name.len() + 7) & !7;
        let raw = DirentRaw {
            ino: inode.into(),
            ty: ty.into(),
            namelen: (name.len() as u32).into(),
            entsize: (entsize as u32).into(),
        };

        let mut out = Vec::with_capacity(entsize);
        out.extend_from_slice(raw.as_bytes());
        out.extend_from_slice(name);
        out.resize(entsize, 0);
        out
    }

    pub const fn inode(&self) -> usize {
        self.raw.ino.get() as usize
    }

    pub const fn ty(&self) -> u32 {
        self.raw.ty.get()
    }

    pub const fn name(&self) -> &[u8] {
        self.name.as_slice()
    }

    /// Returns the padding size after the name.
    pub fn padding_size(&self) -> usize {
        self.raw.entsize.get() as usize - size_of::<DirentRaw>() - self.name.len()
    }
}
