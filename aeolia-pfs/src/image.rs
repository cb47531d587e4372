use aes::Aes128;
use hmac::{Hmac, Mac};
use sha2::Sha256;
use std::cmp::min;
use std::io;
use xts_mode::Xts128;

/// Encapsulates a PFS image with positional read support.
///
/// This trait provides thread-safe, stateless access to PFS image data.
/// Unlike `Read + Seek`, each call specifies its own offset, enabling
/// concurrent reads from multiple threads without synchronization.
pub trait Image: Send + Sync {
    /// Reads bytes from the image at the given offset into `buf`.
    ///
    /// Returns the number of bytes actually read. A short read indicates
    /// the end of the image was reached.
    fn read_at(&self, offset: u64, output_buf: &mut [u8]) -> io::Result<usize>;

    /// Reads exactly `buf.len()` bytes from the image at `offset`.
    ///
    /// Returns [`io::ErrorKind::UnexpectedEof`] if the image ends before the
    /// buffer is filled.
    fn read_exact_at(&self, offset: u64, output_buf: &mut [u8]) -> io::Result<()> {
        let mut total = 0;

        while total < output_buf.len() {
            let n = self.read_at(offset + total as u64, &mut output_buf[total..])?;

            if n == 0 {
                return Err(io::Error::new(
                    io::ErrorKind::UnexpectedEof,
                    "unexpected EOF in image",
                ));
            }

            total += n;
        }

        Ok(())
    }

    /// Returns the total length of the image in bytes.
    fn len(&self) -> u64;

    /// Returns `true` if the image is empty.
    fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// `Image` is implemented for `Box<dyn Image>` so that type-erased images
/// can be used where a concrete `I: Image` is expected.
impl Image for Box<dyn Image + '_> {
    fn read_at(&self, offset: u64, output_buf: &mut [u8]) -> io::Result<usize> {
        (**self).read_at(offset, output_buf)
    }

    fn read_exact_at(&self, offset: u64, output_buf: &mut [u8]) -> io::Result<()> {
        (**self).read_exact_at(offset, output_buf)
    }

    fn len(&self) -> u64 {
        (**self).len()
    }
}

/// Derives the XTS data key and tweak key from EKPFS and the PFS key seed.
pub fn get_xts_keys(ekpfs: &[u8], seed: &[u8; 16]) -> ([u8; 16], [u8; 16]) {
    let mut hmac = Hmac::<Sha256>::new_from_slice(ekpfs).unwrap();
    hmac.update(&[0x01, 0x00, 0x00, 0x00]);
    hmac.update(seed);

    let secret = hmac.finalize().into_bytes();
    let mut data_key: [u8; 16] = Default::default();
    let mut tweak_key: [u8; 16] = Default::default();

    tweak_key.copy_from_slice(&secret[..16]);
    data_key.copy_from_slice(&secret[16..]);

    (data_key, tweak_key)
}

/// Returns the XTS tweak for a PFS block: the block index encoded as a
/// 16-byte big-endian value.
#[must_use]
pub fn block_tweak(block_index: u64) -> [u8; 16] {
    (block_index as u128).to_be_bytes()
}

/// Unencrypted PFS image backed by a byte slice.
///
/// Reads are pure slice indexing — no locks, no allocation, no state.
pub struct UnencryptedSlice<'a> {
    data: &'a [u8],
}

impl<'a> UnencryptedSlice<'a> {
    /// Creates a new unencrypted image backed by `data`.
    pub fn new(data: &'a [u8]) -> Self {
        Self { data }
    }
}

impl Image for UnencryptedSlice<'_> {
    fn read_at(&self, offset: u64, output_buf: &mut [u8]) -> io::Result<usize> {
        let start = offset as usize;

        if start >= self.data.len() {
            return Ok(0);
        }

        let available = self.data.len() - start;
        let n = min(output_buf.len(), available);

        output_buf[..n].copy_from_slice(&self.data[start..start + n]);

        Ok(n)
    }

    fn len(&self) -> u64 {
        self.data.len() as u64
    }
}

/// Encrypted PFS image backed by a byte slice.
///
/// The image is decrypted with XTS-AES-128 where one XTS sector is one PFS
/// block and the tweak is the block index ([`block_tweak`]). Blocks before
/// [`encrypted_start`](Self::encrypted_start) — in practice block 0, which
/// holds the superblock — are stored in plaintext.
pub struct EncryptedSlice<'a> {
    data: &'a [u8],
    cipher: Xts128<Aes128>,
    block_size: usize,
    /// PFS block index where the ciphertext region begins.
    encrypted_start: u64,
}

impl<'a> EncryptedSlice<'a> {
    /// Creates a new encrypted image backed by `data`.
    pub fn new(
        data: &'a [u8],
        cipher: Xts128<Aes128>,
        block_size: usize,
        encrypted_start: u64,
    ) -> Self {
        Self {
            data,
            cipher,
            block_size,
            encrypted_start,
        }
    }

    /// Returns the XTS-AES-128 cipher used for decryption.
    pub fn cipher(&self) -> &Xts128<Aes128> {
        &self.cipher
    }

    /// Returns the PFS block index where encryption begins.
    pub fn encrypted_start(&self) -> u64 {
        self.encrypted_start
    }

    /// Decrypts a single PFS block in-place.
    ///
    /// `block_data` must be exactly one block long. Blocks before
    /// [`encrypted_start`](Self::encrypted_start) are left unchanged.
    pub fn decrypt_block(&self, block_index: u64, block_data: &mut [u8]) {
        debug_assert_eq!(block_data.len(), self.block_size);
        if block_index >= self.encrypted_start {
            self.cipher
                .decrypt_sector(block_data, block_tweak(block_index));
        }
    }
}

impl Image for EncryptedSlice<'_> {
    fn read_at(&self, offset: u64, output_buf: &mut [u8]) -> io::Result<usize> {
        let len = self.data.len() as u64;

        if output_buf.is_empty() || offset >= len {
            return Ok(0);
        }

        let block_size = self.block_size as u64;
        let mut copied = 0;
        let mut pos = offset;
        let mut scratch = vec![0u8; self.block_size];

        while copied < output_buf.len() && pos < len {
            let block = pos / block_size;
            let offset_in_block = (pos % block_size) as usize;
            let block_start = (block * block_size) as usize;

            // A block must be fully present to be decryptable.
            let src = self
                .data
                .get(block_start..block_start + self.block_size)
                .ok_or_else(|| io::Error::other(format!("incomplete XTS block #{block}")))?;

            scratch.copy_from_slice(src);
            self.decrypt_block(block, &mut scratch);

            // Copy the relevant portion to the output buffer.
            let available = self.block_size - offset_in_block;
            let remaining_image = (len - pos) as usize;
            let n = min(min(available, remaining_image), output_buf.len() - copied);

            output_buf[copied..copied + n]
                .copy_from_slice(&scratch[offset_in_block..offset_in_block + n]);

            copied += n;
            pos += n as u64;
        }

        Ok(copied)
    }

    fn len(&self) -> u64 {
        self.data.len() as u64
    }
}
