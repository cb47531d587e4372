use flate2::{FlushDecompress, Status};
use std::cmp::min;
use std::io::{self, ErrorKind};
use zerocopy::{
    FromBytes, Immutable, IntoBytes, KnownLayout,
    little_endian::{U32, U64},
};

use crate::image::Image;
use snafu::{Snafu, ensure};

/// PFSC header (48 bytes).
#[derive(Clone, Copy, FromBytes, KnownLayout, Immutable)]
#[repr(C)]
struct PfscHeader {
    /// 0x00: Magic bytes "PFSC"
    magic: [u8; 4],
    /// 0x04: Always zero
    _unknown_04: U32,
    /// 0x08: Payload variant: 2 = compressed, 6 = stored
    variant: U32,
    /// 0x0C: Sector size
    block_size: U32,
    /// 0x10: Sector size again, as a 64-bit value
    block_size2: U64,
    /// 0x18: Offset of the sector map
    block_offsets: U64,
    /// 0x20: Offset of the first sector payload
    data_start: U64,
    /// 0x28: Original (decompressed) data length
    data_length: U64,
}

const PFSC_MAGIC: &[u8; 4] = b"PFSC";

/// Errors when opening a PFSC compressed file.
#[derive(Debug, Snafu)]
#[non_exhaustive]
pub enum OpenError {
    #[snafu(display("i/o failed"))]
    IoFailed { source: std::io::Error },

    #[snafu(display("data too small"))]
    TooSmall,

    #[snafu(display("invalid magic"))]
    InvalidMagic,

    #[snafu(display("unsupported payload variant {variant}"))]
    UnsupportedVariant { variant: u32 },

    #[snafu(display("sector size fields disagree"))]
    BlockSizeMismatch,

    #[snafu(display("cannot read sector map"))]
    ReadSectorMapFailed { source: std::io::Error },

    #[snafu(display("sector map entry #{index} is invalid"))]
    InvalidSectorMap { index: usize },
}

/// A decompressing [`Image`] adapter for PFSC-compressed files.
///
/// PFSC presents a virtual `data_length`-byte stream split into fixed-size
/// sectors. The sector map gives each sector's on-disk range: a full-size
/// range is stored raw, an oversized range marks a sparse hole, and anything
/// shorter holds a deflate stream prefixed by a 2-byte zlib header.
///
/// Each sector is independently decodable, so `read_at` at any offset only
/// needs to touch the sectors it covers. All state is local to each call —
/// no shared mutable state, naturally thread-safe.
///
/// Created via [`PfscImage::open()`].
pub struct PfscImage<I: Image> {
    source: I,
    block_size: u32,
    sector_map: Vec<u64>,
    data_length: u64,
    variant: u32,
}

impl<I: Image> std::fmt::Debug for PfscImage<I> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PfscImage")
            .field("block_size", &self.block_size)
            .field("data_length", &self.data_length)
            .field("variant", &self.variant)
            .finish_non_exhaustive()
    }
}

impl<I: Image> PfscImage<I> {
    /// Opens a PFSC-compressed image from an underlying [`Image`] source.
    ///
    /// Reads the PFSC header and sector map at construction time and checks
    /// the map invariants: the first entry equals `data_start` and entries
    /// never decrease.
    pub fn open(source: I) -> Result<Self, OpenError> {
        // Read header.
        let mut header_buf = [0u8; size_of::<PfscHeader>()];

        source.read_exact_at(0, &mut header_buf).map_err(|e| {
            if e.kind() == ErrorKind::UnexpectedEof {
                OpenError::TooSmall
            } else {
                OpenError::IoFailed { source: e }
            }
        })?;

        let header =
            PfscHeader::read_from_bytes(&header_buf).expect("header buffer is correctly sized");

        ensure!(&header.magic == PFSC_MAGIC, InvalidMagicSnafu);

        // Both the compressed and stored variants decode the same way; the
        // distinction is informational.
        let variant = header.variant.get();
        ensure!(
            variant == 2 || variant == 6,
            UnsupportedVariantSnafu { variant }
        );

        let block_size = header.block_size.get();
        ensure!(
            block_size != 0 && u64::from(block_size) == header.block_size2.get(),
            BlockSizeMismatchSnafu
        );

        let data_start = header.data_start.get();
        let data_length = header.data_length.get();

        // Read the sector map: one entry per sector plus the end marker.
        let sector_count = data_length / u64::from(block_size) + 1;
        let mut sector_map: Vec<u64> = vec![0; sector_count as usize];

        source
            .read_exact_at(
                header.block_offsets.get(),
                sector_map.as_mut_slice().as_mut_bytes(),
            )
            .map_err(|e| OpenError::ReadSectorMapFailed { source: e })?;

        ensure!(
            sector_map.first() == Some(&data_start),
            InvalidSectorMapSnafu { index: 0usize }
        );

        for (i, pair) in sector_map.windows(2).enumerate() {
            ensure!(pair[0] <= pair[1], InvalidSectorMapSnafu { index: i + 1 });
        }

        Ok(Self {
            source,
            block_size,
            sector_map,
            data_length,
            variant,
        })
    }

    /// Returns the decompressed size of the file.
    #[must_use]
    pub fn decompressed_len(&self) -> u64 {
        self.data_length
    }

    /// Returns the sector size in bytes.
    #[must_use]
    pub fn sector_size(&self) -> u32 {
        self.block_size
    }

    /// Returns the payload variant recorded in the header (2 or 6).
    #[must_use]
    pub fn variant(&self) -> u32 {
        self.variant
    }

    /// Returns a reference to the underlying image source.
    pub fn source(&self) -> &I {
        &self.source
    }

    /// Returns the sector map.
    ///
    /// `sector_map()[i]` is the byte offset within the PFSC stream where
    /// sector `i`'s payload starts; the on-disk length of sector `i` is
    /// `sector_map()[i + 1] - sector_map()[i]`.
    pub fn sector_map(&self) -> &[u64] {
        &self.sector_map
    }

    /// Decodes a single sector into `out`.
    ///
    /// `out` must be exactly [`sector_size()`](Self::sector_size) bytes.
    pub fn read_sector(&self, num: u64, out: &mut [u8]) -> io::Result<()> {
        debug_assert_eq!(out.len(), self.block_size as usize);

        // Get the on-disk payload range.
        let end = match self.sector_map.get(num as usize + 1) {
            Some(&v) => v,
            None => return Err(io::Error::from(ErrorKind::InvalidInput)),
        };

        let offset = self.sector_map[num as usize];
        let size = end - offset;

        match size.cmp(&u64::from(self.block_size)) {
            std::cmp::Ordering::Less => {
                let mut compressed_buf = vec![0u8; size as usize];
                self.source.read_exact_at(offset, &mut compressed_buf)?;

                self.inflate_sector(num, &compressed_buf, out)?;
            }

            std::cmp::Ordering::Equal => {
                // Full-size sector is stored raw.
                self.source.read_exact_at(offset, out)?;
            }

            std::cmp::Ordering::Greater => {
                // Sparse hole.
                out.fill(0);
            }
        }

        Ok(())
    }

    /// Inflates one compressed sector payload into `out`.
    ///
    /// The payload starts with a 2-byte zlib header which is skipped; the
    /// rest is a raw deflate stream that must produce exactly one sector.
    fn inflate_sector(&self, num: u64, payload: &[u8], out: &mut [u8]) -> io::Result<()> {
        let stream = payload
            .get(2..)
            .ok_or_else(|| io::Error::other(format!("PFSC sector #{num} payload too short")))?;

        let mut inflater = flate2::Decompress::new(false);
        let mut consumed = 0usize;
        let mut produced = 0usize;

        // Some deflate implementations return short reads before the end of
        // the stream, so keep going until the sector is full or the inflater
        // makes no progress at all.
        while produced < out.len() {
            let in_before = inflater.total_in();
            let out_before = inflater.total_out();

            let status = inflater
                .decompress(&stream[consumed..], &mut out[produced..], FlushDecompress::Finish)
                .map_err(io::Error::other)?;

            let in_step = (inflater.total_in() - in_before) as usize;
            let out_step = (inflater.total_out() - out_before) as usize;
            consumed += in_step;
            produced += out_step;

            if status == Status::StreamEnd || (in_step == 0 && out_step == 0) {
                break;
            }
        }

        if produced != out.len() {
            return Err(io::Error::other(format!(
                "PFSC sector #{num} inflated to {produced} bytes, expected {}",
                out.len()
            )));
        }

        Ok(())
    }
}

impl<I: Image> Image for PfscImage<I> {
    fn read_at(&self, offset: u64, buf: &mut [u8]) -> io::Result<usize> {
        if buf.is_empty() || offset >= self.data_length {
            return Ok(0);
        }

        let block_size = u64::from(self.block_size);
        let mut copied = 0usize;
        let mut pos = offset;
        let mut sector_buf = vec![0u8; self.block_size as usize];

        while copied < buf.len() && pos < self.data_length {
            // Determine which sector and offset within it.
            let sector = pos / block_size;
            let offset_in_sector = (pos % block_size) as usize;

            self.read_sector(sector, &mut sector_buf)?;

            // Trim the last sector if it extends past the stream length.
            let sector_end = (sector + 1) * block_size;
            let valid_in_sector = if sector_end > self.data_length {
                (self.data_length - sector * block_size) as usize
            } else {
                self.block_size as usize
            };

            // Copy the relevant portion to the output buffer.
            let available = valid_in_sector - offset_in_sector;
            let n = min(available, buf.len() - copied);

            buf[copied..copied + n]
                .copy_from_slice(&sector_buf[offset_in_sector..offset_in_sector + n]);

            copied += n;
            pos += n as u64;
        }

        Ok(copied)
    }

    fn len(&self) -> u64 {
        self.data_length
    }
}
