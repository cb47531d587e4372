//! A library for parsing, unlocking and validating PlayStation 4 PKG files.
//!
//! This crate provides functionality to parse PKG files, which are the package
//! format used by PlayStation 4 for distributing games, updates, and DLC.
//!
//! # Features
//!
//! - Parse PKG headers and metadata (content ID, type, DRM info)
//! - Iterate over and extract PKG entries, decrypting where keys allow
//! - Unlock the embedded PFS image via passcode, EKPFS or explicit XTS keys
//! - Run the key ladder against a persisted [`KeyStore`](keystore::KeyStore)
//! - Validate the package's digest and signature rows
//!
//! # Example
//!
//! ```no_run
//! use aeolia_pkg::Pkg;
//!
//! // Open a PKG from any byte source
//! let bytes = std::fs::read("game.pkg").unwrap();
//! let mut pkg = Pkg::new(bytes).unwrap();
//!
//! // Access header information
//! println!("Content ID: {}", pkg.header().content_id());
//! println!("Entry count: {}", pkg.entry_count());
//!
//! // Try the all-zeros passcode most published packages use
//! if pkg.try_passcode(aeolia_pkg::keys::ZERO_PASSCODE).is_ok() {
//!     println!("file system unlocked");
//! }
//! ```
//!
//! # References
//!
//! - [PS4 Developer Wiki - PKG files](https://www.psdevwiki.com/ps4/PKG_files)

use self::entry::{EntryId, EntryNames, PkgEntry};
use self::header::PkgHeader;
use self::keys::{DEBUG_IMAGE_IV, DEBUG_IMAGE_KEY, DEBUG_RIF_KEY, PASSCODE_LEN, ZERO_PASSCODE};
use self::keystore::KeyStore;
use aeolia_pfs::image::{block_tweak, get_xts_keys};
use aes::Aes128;
use aes::cipher::KeyInit;
use hmac::{Hmac, Mac};
use sha2::Sha256;
use snafu::{OptionExt, ResultExt, Snafu, ensure};
use std::sync::Arc;
use xts_mode::Xts128;

use open_error::*;

pub mod entry;
pub mod header;
pub mod keys;
pub mod keystore;
pub mod validate;

/// A parsed PS4 PKG file.
///
/// This struct provides read-only access to the PKG contents including
/// entries, headers, and the embedded PFS image. The PFS starts out locked;
/// use [`try_passcode()`](Self::try_passcode) and friends — or
/// [`unlock_with_store()`](Self::unlock_with_store) for the whole key
/// ladder — to gain access.
///
/// Reference: <https://www.psdevwiki.com/ps4/PKG_files>
#[must_use]
pub struct Pkg<R: AsRef<[u8]>> {
    raw: R,
    header: PkgHeader,
    entry_names: EntryNames,
    /// EKPFS candidate unwrapped from the image-key entry with the debug
    /// key; doubles as the entry secret for key index 3.
    image_key_secret: Option<[u8; 32]>,
    unlock: Option<Unlock>,
}

/// Key material recovered for the embedded PFS.
struct Unlock {
    passcode: Option<String>,
    ekpfs: Option<[u8; 32]>,
    data_key: [u8; 16],
    tweak_key: [u8; 16],
}

/// Which step of the key ladder produced the unlock.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[non_exhaustive]
pub enum UnlockSource {
    ZeroPasscode,
    CachedPasscode,
    ImageKey,
    CachedEkpfs,
    CachedXts,
}

impl<R: AsRef<[u8]>> std::fmt::Debug for Pkg<R> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Pkg")
            .field("header", &self.header)
            .field("entry_count", &self.entry_count())
            .field("unlocked", &self.unlock.is_some())
            .finish_non_exhaustive()
    }
}

impl<R: AsRef<[u8]>> Pkg<R> {
    /// Creates a new [`Pkg`] from raw bytes.
    ///
    /// Parses the header, the entry names blob and the image-key entry. The
    /// PFS stays locked until one of the `try_*` methods succeeds.
    pub fn new(raw: R) -> Result<Self, OpenError> {
        let header = PkgHeader::read(raw.as_ref()).context(ReadHeaderFailedSnafu)?;

        let mut pkg = Self {
            raw,
            header,
            entry_names: EntryNames::default(),
            image_key_secret: None,
            unlock: None,
        };
        pkg.load_entry_names()?;
        pkg.load_image_key();
        Ok(pkg)
    }

    /// Returns a reference to the PKG header.
    pub fn header(&self) -> &PkgHeader {
        &self.header
    }

    /// Returns the parsed entry names blob.
    pub fn entry_names(&self) -> &EntryNames {
        &self.entry_names
    }

    /// Returns the number of entries in the PKG.
    #[must_use]
    pub fn entry_count(&self) -> usize {
        self.header.entry_count()
    }

    /// Returns an iterator over all entries in the PKG, in meta-table order.
    ///
    /// Each item contains the entry index and the entry metadata.
    pub fn entries(&self) -> PkgEntries<'_> {
        PkgEntries {
            raw: self.raw.as_ref(),
            table_offset: self.header.table_offset(),
            current: 0,
            total: self.header.entry_count(),
        }
    }

    /// Finds an entry by its ID.
    ///
    /// Returns the entry and its index if found.
    pub fn find_entry(&self, id: EntryId) -> Result<(PkgEntry, usize), FindEntryError> {
        self.find_entry_raw(id.as_u32())
    }

    /// Finds an entry by its raw numeric ID.
    ///
    /// This is useful when working with unknown/unsupported IDs.
    pub fn find_entry_raw(&self, id: u32) -> Result<(PkgEntry, usize), FindEntryError> {
        for num in 0..self.header.entry_count() {
            let offset = self.header.table_offset() + num * PkgEntry::RAW_SIZE;
            let raw = self
                .raw
                .as_ref()
                .get(offset..(offset + PkgEntry::RAW_SIZE))
                .ok_or(FindEntryError::InvalidOffset { num })?;

            let entry =
                PkgEntry::read(raw).map_err(|source| FindEntryError::ReadFailed { source })?;

            if entry.id() == id {
                return Ok((entry, num));
            }
        }

        Err(FindEntryError::NotFound)
    }

    /// Returns an entry's on-disk bytes without any decryption.
    ///
    /// For encrypted entries this includes the AES padding.
    pub fn entry_data_raw(&self, entry: &PkgEntry) -> Result<&[u8], EntryDataError> {
        let offset = entry.data_offset();

        self.raw
            .as_ref()
            .get(offset..offset + entry.disk_size())
            .ok_or(EntryDataError::InvalidDataOffset)
    }

    /// Gets the decrypted data for the entry at `index`.
    ///
    /// Returns the logical `data_size` bytes with any padding removed.
    ///
    /// # Errors
    ///
    /// Returns [`EntryDataError::NoDecryptionKey`] if the entry is encrypted
    /// and no key material is available for its key index: index 3 needs the
    /// image-key entry, lower indexes need an unlocked passcode.
    pub fn entry_data(&self, index: usize, entry: &PkgEntry) -> Result<Vec<u8>, EntryDataError> {
        let raw_data = self.entry_data_raw(entry)?;

        if !entry.is_encrypted() {
            return Ok(raw_data.to_vec());
        }

        if raw_data.len() % 16 != 0 {
            return Err(EntryDataError::MisalignedData {
                size: raw_data.len(),
            });
        }

        let key_index = entry.key_index();
        let secret: &[u8] = if key_index == 3 {
            match &self.image_key_secret {
                Some(secret) => secret,
                None => return Err(EntryDataError::NoDecryptionKey { key_index }),
            }
        } else {
            match self.passcode() {
                Some(passcode) => passcode.as_bytes(),
                None => return Err(EntryDataError::NoDecryptionKey { key_index }),
            }
        };

        let content_id = self.header.content_id().as_str();
        let (iv, key) = keys::entry_iv_key(entry.as_bytes(), index as u32, content_id, secret);

        let mut decrypted = keys::decrypt_cbc(&key, &iv, raw_data);
        // Truncate to actual size (remove padding).
        decrypted.truncate(entry.data_size());
        Ok(decrypted)
    }

    /// Extracts an entry, optionally decrypting it.
    ///
    /// With `decrypt` unset, encrypted entries come back as their padded
    /// on-disk ciphertext.
    pub fn extract_entry(
        &self,
        index: usize,
        entry: &PkgEntry,
        decrypt: bool,
    ) -> Result<Vec<u8>, EntryDataError> {
        if decrypt {
            self.entry_data(index, entry)
        } else {
            self.entry_data_raw(entry).map(<[u8]>::to_vec)
        }
    }

    /// Returns the embedded PFS image bytes.
    ///
    /// Returns `None` for packages without a PFS image (license-only
    /// additional content) or when the recorded range is out of bounds.
    #[must_use]
    pub fn pfs_image(&self) -> Option<&[u8]> {
        let offset = self.header.pfs_offset();
        let size = self.header.pfs_size();

        if size == 0 {
            return None;
        }

        self.raw.as_ref().get(offset..(offset + size))
    }

    /// Returns `true` when the embedded PFS can be opened: either the image
    /// is plaintext or key material has been recovered.
    #[must_use]
    pub fn is_file_system_accessible(&self) -> bool {
        match self.pfs_is_encrypted() {
            Some(false) => true,
            Some(true) => self.unlock.is_some(),
            None => false,
        }
    }

    /// Returns the passcode the PFS was unlocked with, if any.
    #[must_use]
    pub fn passcode(&self) -> Option<&str> {
        self.unlock.as_ref()?.passcode.as_deref()
    }

    /// Returns the EKPFS the PFS was unlocked with, if known.
    #[must_use]
    pub fn ekpfs(&self) -> Option<&[u8; 32]> {
        self.unlock.as_ref()?.ekpfs.as_ref()
    }

    /// Returns the recovered XTS `(data, tweak)` key pair.
    #[must_use]
    pub fn xts_keys(&self) -> Option<(&[u8; 16], &[u8; 16])> {
        let unlock = self.unlock.as_ref()?;
        Some((&unlock.data_key, &unlock.tweak_key))
    }

    /// Opens the embedded PFS with whatever access has been established.
    pub fn open_pfs(&self) -> Result<Arc<aeolia_pfs::Pfs<'_>>, OpenPfsError> {
        let data = self
            .pfs_image()
            .context(open_pfs_error::NoPfsImageSnafu)?;

        let encrypted = self
            .pfs_is_encrypted()
            .context(open_pfs_error::NoPfsImageSnafu)?;

        if !encrypted {
            return aeolia_pfs::open_slice(data, None).context(open_pfs_error::OpenFailedSnafu);
        }

        let (data_key, tweak_key) = self.xts_keys().context(open_pfs_error::LockedSnafu)?;

        aeolia_pfs::open_slice_with_keys(data, data_key, tweak_key)
            .context(open_pfs_error::OpenFailedSnafu)
    }

    /// Verifies an EKPFS against the image-embedded MAC.
    ///
    /// The MAC is an HMAC-SHA256 over the PFS superblock region, recorded in
    /// the header's signed digest field.
    #[must_use]
    pub fn check_ekpfs(&self, ekpfs: &[u8]) -> bool {
        let Some(region) = self.pfs_image().and_then(|pfs| pfs.get(..0x380)) else {
            return false;
        };

        let mut hmac = <Hmac<Sha256> as Mac>::new_from_slice(ekpfs).unwrap();
        hmac.update(region);
        hmac.verify_slice(self.header.pfs_signed_digest()).is_ok()
    }

    /// Verifies a passcode by recomputing the EKPFS it derives.
    #[must_use]
    pub fn check_passcode(&self, passcode: &str) -> bool {
        if passcode.len() != PASSCODE_LEN {
            return false;
        }

        let ekpfs = keys::ekpfs_from_passcode(self.header.content_id().as_str(), passcode);
        self.check_ekpfs(&ekpfs)
    }

    /// Attempts to unlock the PFS with a passcode.
    pub fn try_passcode(&mut self, passcode: &str) -> Result<(), UnlockError> {
        ensure!(
            passcode.len() == PASSCODE_LEN,
            unlock_error::InvalidPasscodeSnafu
        );

        let ekpfs = keys::ekpfs_from_passcode(self.header.content_id().as_str(), passcode);
        self.install_ekpfs(ekpfs, Some(passcode.to_string()))
    }

    /// Attempts to unlock the PFS with an EKPFS.
    pub fn try_ekpfs(&mut self, ekpfs: &[u8; 32]) -> Result<(), UnlockError> {
        self.install_ekpfs(*ekpfs, None)
    }

    /// Attempts to unlock the PFS with explicit XTS data and tweak keys.
    ///
    /// Without an EKPFS there is no MAC to check, so the keys are probed by
    /// decrypting the first inode block and sanity-checking the leading
    /// dinode mode.
    pub fn try_xts(&mut self, data_key: [u8; 16], tweak_key: [u8; 16]) -> Result<(), UnlockError> {
        let pfs = self.pfs_image().context(unlock_error::NoPfsImageSnafu)?;

        let block_size = pfs
            .get(0x20..0x24)
            .map(|b| u32::from_le_bytes(b.try_into().unwrap()) as usize)
            .filter(|&bs| bs >= 16)
            .context(unlock_error::MismatchSnafu)?;

        let mut block = pfs
            .get(block_size..block_size * 2)
            .context(unlock_error::MismatchSnafu)?
            .to_vec();

        let cipher = Xts128::<Aes128>::new(
            Aes128::new((&data_key).into()),
            Aes128::new((&tweak_key).into()),
        );
        cipher.decrypt_sector(&mut block, block_tweak(1));

        // The first dinode must look like a file or directory, and its
        // reserved area must be clear. A bad key pair produces noise here.
        let mode = u16::from_le_bytes(block[..2].try_into().unwrap());
        let reserved = block
            .get(0x50..0x60)
            .context(unlock_error::MismatchSnafu)?;
        ensure!(
            matches!(mode & 0xF000, 0x4000 | 0x8000) && reserved.iter().all(|&b| b == 0),
            unlock_error::MismatchSnafu
        );

        self.unlock = Some(Unlock {
            passcode: None,
            ekpfs: None,
            data_key,
            tweak_key,
        });

        Ok(())
    }

    /// Runs the key acquisition ladder against a key store.
    ///
    /// The steps are tried in order: the all-zeros passcode, a cached
    /// passcode, the EKPFS unwrapped from the image-key entry, a cached
    /// EKPFS, and finally cached XTS keys under either the content ID or
    /// `content_id-<first 8 digest hex chars>`. Returns the winning step, or
    /// `None` when every step failed (including for plaintext images, which
    /// need no key at all).
    pub fn unlock_with_store(&mut self, store: &KeyStore) -> Option<UnlockSource> {
        if self.pfs_is_encrypted() != Some(true) {
            return None;
        }

        let content_id = self.header.content_id().as_str().to_string();

        if self.try_passcode(ZERO_PASSCODE).is_ok() {
            return Some(UnlockSource::ZeroPasscode);
        }

        if let Some(passcode) = store.get(&content_id).and_then(|k| k.passcode.clone())
            && self.try_passcode(&passcode).is_ok()
        {
            return Some(UnlockSource::CachedPasscode);
        }

        if let Some(secret) = self.image_key_secret
            && self.try_ekpfs(&secret).is_ok()
        {
            return Some(UnlockSource::ImageKey);
        }

        if let Some(ekpfs) = store.get(&content_id).and_then(|k| k.ekpfs)
            && self.try_ekpfs(&ekpfs).is_ok()
        {
            return Some(UnlockSource::CachedEkpfs);
        }

        for id in [content_id.clone(), self.digest_qualified_id()] {
            if let Some(xts) = store.get(&id).and_then(|k| k.xts.clone())
                && self.try_xts(xts.data, xts.tweak).is_ok()
            {
                return Some(UnlockSource::CachedXts);
            }
        }

        None
    }

    /// Returns the store key qualified by the PFS image digest:
    /// `content_id-<first 8 hex chars>`.
    #[must_use]
    pub fn digest_qualified_id(&self) -> String {
        let digest = self.header.pfs_image_digest();

        format!(
            "{}-{:02x}{:02x}{:02x}{:02x}",
            self.header.content_id(),
            digest[0],
            digest[1],
            digest[2],
            digest[3]
        )
    }

    /// Extracts the entitlement key from `license.dat`.
    ///
    /// Only additional-content packages carry one. The key is read from the
    /// license secret after unwrapping it with the debug RIF key.
    pub fn entitlement_key(&self) -> Result<[u8; 16], LicenseError> {
        let (entry, index) = match self.find_entry(EntryId::LicenseDat) {
            Ok(v) => v,
            Err(FindEntryError::NotFound) => return Err(LicenseError::NoLicense),
            Err(e) => return Err(LicenseError::FindFailed { source: e }),
        };

        let data = self
            .entry_data(index, &entry)
            .map_err(|source| LicenseError::ReadFailed { source })?;

        let secret = data
            .get(0x300..0x390)
            .ok_or(LicenseError::TruncatedLicense)?;

        let plain = keys::decrypt_cbc(&DEBUG_RIF_KEY, &[0u8; 16], secret);

        Ok(plain[0x70..0x80].try_into().unwrap())
    }

    fn pfs_is_encrypted(&self) -> Option<bool> {
        let mode = self.pfs_image()?.get(0x1C..0x1E)?;
        Some(u16::from_le_bytes(mode.try_into().unwrap()) & 0x4 != 0)
    }

    fn install_ekpfs(
        &mut self,
        ekpfs: [u8; 32],
        passcode: Option<String>,
    ) -> Result<(), UnlockError> {
        let pfs = self.pfs_image().context(unlock_error::NoPfsImageSnafu)?;

        ensure!(self.check_ekpfs(&ekpfs), unlock_error::MismatchSnafu);

        let seed: [u8; 16] = pfs
            .get(0x370..0x380)
            .context(unlock_error::MismatchSnafu)?
            .try_into()
            .unwrap();
        let (data_key, tweak_key) = get_xts_keys(&ekpfs, &seed);

        self.unlock = Some(Unlock {
            passcode,
            ekpfs: Some(ekpfs),
            data_key,
            tweak_key,
        });

        Ok(())
    }

    fn load_entry_names(&mut self) -> Result<(), OpenError> {
        let (entry, index) = match self.find_entry(EntryId::EntryNames) {
            Ok(v) => v,
            Err(FindEntryError::NotFound) => return Ok(()),
            Err(e) => return Err(OpenError::FindEntryNamesFailed { source: e }),
        };

        let blob = self
            .entry_data_raw(&entry)
            .map_err(|_| OpenError::InvalidEntryOffset { num: index })?;

        self.entry_names = EntryNames::new(blob.to_vec());
        Ok(())
    }

    /// Unwraps the EKPFS candidate from the image-key entry with the debug
    /// key pair. Absence is not an error; the key ladder has other steps.
    fn load_image_key(&mut self) {
        let Ok((entry, _)) = self.find_entry(EntryId::PfsImageKey) else {
            return;
        };

        let Ok(data) = self.entry_data_raw(&entry) else {
            return;
        };

        if data.len() % 16 != 0 || data.len() < 32 {
            return;
        }

        let plain = keys::decrypt_cbc(&DEBUG_IMAGE_KEY, &DEBUG_IMAGE_IV, data);
        self.image_key_secret = Some(plain[..32].try_into().unwrap());
    }
}

/// Iterator over PKG entries.
#[must_use = "iterators are lazy and do nothing unless consumed"]
pub struct PkgEntries<'a> {
    raw: &'a [u8],
    table_offset: usize,
    current: usize,
    total: usize,
}

impl std::fmt::Debug for PkgEntries<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PkgEntries")
            .field("current", &self.current)
            .field("total", &self.total)
            .finish_non_exhaustive()
    }
}

impl Iterator for PkgEntries<'_> {
    type Item = Result<(usize, PkgEntry), EntryReadError>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.current >= self.total {
            return None;
        }

        let num = self.current;
        self.current += 1;

        let offset = self.table_offset + num * PkgEntry::RAW_SIZE;
        let raw = match self.raw.get(offset..(offset + PkgEntry::RAW_SIZE)) {
            Some(v) => v,
            None => return Some(Err(EntryReadError::InvalidOffset { num })),
        };

        Some(
            PkgEntry::read(raw)
                .map_err(|source| EntryReadError::ReadFailed { source })
                .map(|entry| (num, entry)),
        )
    }

    fn size_hint(&self) -> (usize, Option<usize>) {
        let remaining = self.total - self.current;
        (remaining, Some(remaining))
    }
}

impl ExactSizeIterator for PkgEntries<'_> {}

#[derive(Debug, Snafu)]
#[snafu(module)]
#[non_exhaustive]
pub enum OpenError {
    #[snafu(display("invalid PKG header"))]
    ReadHeaderFailed { source: header::ReadError },

    #[snafu(display("entry #{num} has invalid data offset"))]
    InvalidEntryOffset { num: usize },

    #[snafu(display("failed to find entry names"))]
    FindEntryNamesFailed { source: FindEntryError },
}

#[derive(Debug, Snafu)]
#[snafu(module)]
#[non_exhaustive]
pub enum FindEntryError {
    #[snafu(display("failed to read entry"))]
    ReadFailed { source: entry::EntryError },

    #[snafu(display("entry #{num} has invalid offset"))]
    InvalidOffset { num: usize },

    #[snafu(display("the specified entry was not found"))]
    NotFound,
}

#[derive(Debug, Snafu)]
#[snafu(module)]
#[non_exhaustive]
pub enum EntryReadError {
    #[snafu(display("entry #{num} has invalid offset"))]
    InvalidOffset { num: usize },

    #[snafu(display("failed to read entry"))]
    ReadFailed { source: entry::EntryError },
}

#[derive(Debug, Snafu)]
#[snafu(module)]
#[non_exhaustive]
pub enum EntryDataError {
    #[snafu(display("no decryption key available for key index {key_index}"))]
    NoDecryptionKey { key_index: usize },

    #[snafu(display("entry has invalid data offset"))]
    InvalidDataOffset,

    #[snafu(display(
        "encrypted entry data is not block-aligned (size {size} is not a multiple of 16)"
    ))]
    MisalignedData { size: usize },
}

/// Errors of the `try_*` unlock operations.
#[derive(Debug, Snafu)]
#[snafu(module)]
#[non_exhaustive]
pub enum UnlockError {
    #[snafu(display("passcode must be {PASSCODE_LEN} characters"))]
    InvalidPasscode,

    #[snafu(display("package has no PFS image"))]
    NoPfsImage,

    #[snafu(display("key material failed verification"))]
    Mismatch,
}

/// Errors of [`Pkg::open_pfs()`].
#[derive(Debug, Snafu)]
#[snafu(module)]
#[non_exhaustive]
pub enum OpenPfsError {
    #[snafu(display("package has no PFS image"))]
    NoPfsImage,

    #[snafu(display("PFS is encrypted and no keys have been recovered"))]
    Locked,

    #[snafu(display("cannot open PFS"))]
    OpenFailed { source: aeolia_pfs::OpenSliceError },
}

/// Errors of [`Pkg::entitlement_key()`].
#[derive(Debug, Snafu)]
#[non_exhaustive]
pub enum LicenseError {
    #[snafu(display("package has no license entry"))]
    NoLicense,

    #[snafu(display("failed to find license entry"))]
    FindFailed { source: FindEntryError },

    #[snafu(display("failed to read license entry"))]
    ReadFailed { source: EntryDataError },

    #[snafu(display("license entry is too small for the secret"))]
    TruncatedLicense,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::validate::{ValidationStatus, hmac_sha256};
    use cmac::Cmac;
    use sha1::Sha1;
    use sha2::{Digest, Sha256};

    const CONTENT_ID: &str = "AA0000-BBBB00000_00-ZZZZZZZZZZZZZZZZ";
    const PFS_BS: usize = 0x400;
    const TABLE_OFFSET: usize = 0x1000;
    const PFS_OFFSET: usize = 0x2000;
    const LICENSE_KEY: [u8; 16] = [0xEE; 16];

    fn sha256(data: &[u8]) -> [u8; 32] {
        Sha256::digest(data).into()
    }

    /// Builds a minimal valid PFS image: superblock, one inode block with a
    /// single empty root directory, one directory block. Everything past the
    /// superblock is XTS-encrypted with keys derived from `ekpfs`.
    fn build_pfs(ekpfs: &[u8; 32]) -> Vec<u8> {
        let seed = [0x33u8; 16];

        let mut image = vec![0u8; PFS_BS];
        image[0x00..0x08].copy_from_slice(&1u64.to_le_bytes()); // version
        image[0x08..0x10].copy_from_slice(&20130315u64.to_le_bytes()); // format
        image[0x1C..0x1E].copy_from_slice(&0x4u16.to_le_bytes()); // mode: encrypted
        image[0x20..0x24].copy_from_slice(&(PFS_BS as u32).to_le_bytes());
        image[0x28..0x30].copy_from_slice(&3u64.to_le_bytes()); // nblock
        image[0x30..0x38].copy_from_slice(&1u64.to_le_bytes()); // ndinode
        image[0x40..0x48].copy_from_slice(&1u64.to_le_bytes()); // ndinodeblock
        image[0x50 + 0x18..0x50 + 0x20].copy_from_slice(&1_600_000_000u64.to_le_bytes());
        image[0x370..0x380].copy_from_slice(&seed);

        // One directory inode owning block 2.
        let mut inode = vec![0u8; PFS_BS];
        inode[0..2].copy_from_slice(&0x4000u16.to_le_bytes());
        inode[8..16].copy_from_slice(&(PFS_BS as u64).to_le_bytes());
        inode[96..100].copy_from_slice(&1u32.to_le_bytes()); // blocks
        inode[100..104].copy_from_slice(&2u32.to_le_bytes()); // direct[0]
        inode[104..108].copy_from_slice(&0xffffffffu32.to_le_bytes());
        image.extend_from_slice(&inode);

        // Empty directory block.
        image.extend_from_slice(&[0u8; PFS_BS]);

        let (data_key, tweak_key) = get_xts_keys(ekpfs, &seed);
        let cipher = Xts128::<Aes128>::new(
            Aes128::new((&data_key).into()),
            Aes128::new((&tweak_key).into()),
        );

        for (i, chunk) in image.chunks_mut(PFS_BS).enumerate().skip(1) {
            cipher.encrypt_sector(chunk, block_tweak(i as u64));
        }

        image
    }

    /// Builds a complete, internally consistent PKG. The PFS is locked with
    /// `passcode`; the image-key entry wraps the correct EKPFS only when
    /// `wrap_image_key` is set.
    fn build_pkg(passcode: &str, wrap_image_key: bool) -> Vec<u8> {
        let ekpfs = keys::ekpfs_from_passcode(CONTENT_ID, passcode);
        let pfs = build_pfs(&ekpfs);

        let mut secret = vec![0u8; 0x90];
        secret[0x70..0x80].copy_from_slice(&LICENSE_KEY);
        let mut license = vec![0u8; 0x400];
        license[0x300..0x390]
            .copy_from_slice(&keys::encrypt_cbc(&DEBUG_RIF_KEY, &[0u8; 16], &secret));

        let image_key_blob = if wrap_image_key {
            keys::encrypt_cbc(&DEBUG_IMAGE_KEY, &DEBUG_IMAGE_IV, &ekpfs)
        } else {
            vec![0u8; 32]
        };

        let names_blob = b"\0obsolete.dat\0".to_vec();
        let chunk_sha: Vec<u8> = pfs
            .chunks(0x10000)
            .flat_map(|c| <[u8; 20]>::from(Sha1::digest(c)))
            .collect();

        let mut param_sfo = b"\0PSF".to_vec();
        param_sfo.extend_from_slice(&[0x11; 0x4F]); // odd total size, tests padding strip
        let icon = vec![0x77u8; 0x40];

        // (id, plaintext, encrypted with key_index 0)
        let specs: Vec<(EntryId, Vec<u8>, bool)> = vec![
            (EntryId::Digests, vec![0u8; 7 * 32], false),
            (EntryId::EntryNames, names_blob, false),
            (EntryId::PfsImageKey, image_key_blob, false),
            (EntryId::ParamSfo, param_sfo, true),
            (EntryId::Icon0Png, icon, false),
            (EntryId::LicenseDat, license, false),
            (EntryId::PlaygoChunkSha, chunk_sha, false),
        ];

        // Lay out entry data slots, 16-aligned, starting after the table.
        let mut offsets = Vec::new();
        let mut cursor = TABLE_OFFSET + specs.len() * PkgEntry::RAW_SIZE;
        cursor = (cursor + 15) & !15;

        for (_, data, encrypted) in &specs {
            offsets.push(cursor);
            let disk = if *encrypted {
                (data.len() + 15) & !15
            } else {
                data.len()
            };
            cursor += (disk + 15) & !15;
        }

        let body_end = cursor;
        assert!(body_end <= PFS_OFFSET);

        let mut raw = vec![0u8; PFS_OFFSET];
        raw.extend_from_slice(&pfs);

        // Meta records, then (possibly encrypted) data slots.
        let mut digests = vec![0u8; specs.len() * 32];

        for (index, (id, data, encrypted)) in specs.iter().enumerate() {
            let mut record = [0u8; PkgEntry::RAW_SIZE];
            record[0..4].copy_from_slice(&id.as_u32().to_be_bytes());
            if *encrypted {
                record[8..12].copy_from_slice(&0x80000000u32.to_be_bytes());
                // flags2 key index 0 is already zero.
            }
            record[16..20].copy_from_slice(&(offsets[index] as u32).to_be_bytes());
            record[20..24].copy_from_slice(&(data.len() as u32).to_be_bytes());

            let table_at = TABLE_OFFSET + index * PkgEntry::RAW_SIZE;
            raw[table_at..table_at + PkgEntry::RAW_SIZE].copy_from_slice(&record);

            let on_disk = if *encrypted {
                let mut padded = data.clone();
                padded.resize((data.len() + 15) & !15, 0);
                let (iv, key) =
                    keys::entry_iv_key(&record, index as u32, CONTENT_ID, passcode.as_bytes());
                keys::encrypt_cbc(&key, &iv, &padded)
            } else {
                data.clone()
            };

            raw[offsets[index]..offsets[index] + on_disk.len()].copy_from_slice(&on_disk);

            if index != 0 {
                digests[index * 32..(index + 1) * 32].copy_from_slice(&sha256(data));
            }
        }

        // Patch the digests entry data now that every plaintext is known.
        // The digests entry's own slot stays zero.
        raw[offsets[0]..offsets[0] + digests.len()].copy_from_slice(&digests);

        // Header fields.
        raw[0x000..0x004].copy_from_slice(&0x7F434E54u32.to_be_bytes());
        raw[0x010..0x014].copy_from_slice(&(specs.len() as u32).to_be_bytes());
        raw[0x018..0x01C].copy_from_slice(&(TABLE_OFFSET as u32).to_be_bytes());
        raw[0x020..0x028].copy_from_slice(&(TABLE_OFFSET as u64).to_be_bytes());
        raw[0x028..0x030].copy_from_slice(&((body_end - TABLE_OFFSET) as u64).to_be_bytes());
        raw[0x040..0x064].copy_from_slice(CONTENT_ID.as_bytes());
        raw[0x074..0x078].copy_from_slice(&0x1Bu32.to_be_bytes()); // AC
        raw[0x410..0x418].copy_from_slice(&(PFS_OFFSET as u64).to_be_bytes());
        raw[0x418..0x420].copy_from_slice(&(pfs.len() as u64).to_be_bytes());
        let raw_len = raw.len() as u64;
        raw[0x430..0x438].copy_from_slice(&raw_len.to_be_bytes());

        // Digest fields, in dependency order.
        let main_digest = {
            let mut cmac = <Cmac<Aes128> as Mac>::new_from_slice(&ekpfs[..16]).unwrap();
            cmac.update(&raw[..0xA0]);
            let out: [u8; 16] = cmac.finalize().into_bytes().into();
            out
        };
        raw[0x0A0..0x0B0].copy_from_slice(&main_digest);

        let table_digest = sha256(&raw[TABLE_OFFSET..TABLE_OFFSET + specs.len() * PkgEntry::RAW_SIZE]);
        raw[0x100..0x120].copy_from_slice(&table_digest);
        let names_at = offsets[1];
        let names_len = 14;
        let names_digest = sha256(&raw[names_at..names_at + names_len]);
        raw[0x120..0x140].copy_from_slice(&names_digest);
        let tables_digest = sha256(&raw[0x100..0x140]);
        raw[0x140..0x160].copy_from_slice(&tables_digest);
        let body_digest = sha256(&raw[TABLE_OFFSET..body_end]);
        raw[0x160..0x180].copy_from_slice(&body_digest);

        let pfs_digest = sha256(&raw[PFS_OFFSET..PFS_OFFSET + 3 * PFS_BS]);
        raw[0x440..0x460].copy_from_slice(&pfs_digest);
        let signed_digest = hmac_sha256(&ekpfs, &raw[PFS_OFFSET..PFS_OFFSET + 0x380]);
        raw[0x460..0x480].copy_from_slice(&signed_digest);

        let pkg_digest = sha256(&raw[..0xFE0]);
        raw[0xFE0..0x1000].copy_from_slice(&pkg_digest);

        raw
    }

    #[test]
    fn zero_passcode_wins_the_ladder() {
        let raw = build_pkg(ZERO_PASSCODE, true);
        let mut pkg = Pkg::new(raw).unwrap();

        assert!(!pkg.is_file_system_accessible());

        let store = KeyStore::default();
        assert_eq!(
            pkg.unlock_with_store(&store),
            Some(UnlockSource::ZeroPasscode)
        );

        assert_eq!(pkg.passcode(), Some(ZERO_PASSCODE));
        assert!(pkg.is_file_system_accessible());

        // The PFS opens and exposes its (empty) super-root.
        let pfs = pkg.open_pfs().unwrap();
        assert_eq!(pfs.inode_count(), 1);
        assert_eq!(pfs.timestamp(), 1_600_000_000);
        assert!(pfs.root().open().unwrap().is_empty());
    }

    #[test]
    fn image_key_step_recovers_ekpfs() {
        let passcode = "THIS-IS-NOT-THE-ZERO-PASSCODE-00";
        assert_eq!(passcode.len(), keys::PASSCODE_LEN);

        let raw = build_pkg(passcode, true);
        let mut pkg = Pkg::new(raw).unwrap();

        let store = KeyStore::default();
        assert_eq!(pkg.unlock_with_store(&store), Some(UnlockSource::ImageKey));

        // Recovered via the image key, so no passcode is known.
        assert!(pkg.passcode().is_none());
        assert!(pkg.ekpfs().is_some());
        assert!(pkg.open_pfs().is_ok());
    }

    #[test]
    fn cached_keys_win_when_nothing_else_does() {
        let passcode = "THIS-IS-NOT-THE-ZERO-PASSCODE-00";

        // Broken image key: the ladder has to fall through to the store.
        let raw = build_pkg(passcode, false);

        let mut store = KeyStore::default();
        store.set_passcode(CONTENT_ID, passcode);

        let mut pkg = Pkg::new(raw.clone()).unwrap();
        assert_eq!(
            pkg.unlock_with_store(&store),
            Some(UnlockSource::CachedPasscode)
        );

        // Cached EKPFS.
        let ekpfs = keys::ekpfs_from_passcode(CONTENT_ID, passcode);
        let mut store = KeyStore::default();
        store.set_ekpfs(CONTENT_ID, ekpfs);

        let mut pkg = Pkg::new(raw.clone()).unwrap();
        assert_eq!(
            pkg.unlock_with_store(&store),
            Some(UnlockSource::CachedEkpfs)
        );

        // Cached XTS keys under the digest-qualified ID.
        let seed = [0x33u8; 16];
        let (data_key, tweak_key) = get_xts_keys(&ekpfs, &seed);

        let mut pkg = Pkg::new(raw.clone()).unwrap();
        let mut store = KeyStore::default();
        store.set_xts(&pkg.digest_qualified_id(), data_key, tweak_key);
        assert_eq!(pkg.unlock_with_store(&store), Some(UnlockSource::CachedXts));
        assert!(pkg.ekpfs().is_none());
        assert!(pkg.open_pfs().is_ok());

        // Nothing available at all.
        let mut pkg = Pkg::new(raw).unwrap();
        assert_eq!(pkg.unlock_with_store(&KeyStore::default()), None);
        assert!(!pkg.is_file_system_accessible());
    }

    #[test]
    fn check_operations_do_not_unlock() {
        let raw = build_pkg(ZERO_PASSCODE, true);
        let pkg = Pkg::new(raw).unwrap();

        assert!(pkg.check_passcode(ZERO_PASSCODE));
        assert!(!pkg.check_passcode("THIS-IS-NOT-THE-ZERO-PASSCODE-00"));
        assert!(!pkg.check_passcode("short"));

        let ekpfs = keys::ekpfs_from_passcode(CONTENT_ID, ZERO_PASSCODE);
        assert!(pkg.check_ekpfs(&ekpfs));
        assert!(!pkg.check_ekpfs(&[0u8; 32]));

        // Checking never changes the session state.
        assert!(!pkg.is_file_system_accessible());
    }

    #[test]
    fn wrong_xts_keys_are_rejected() {
        let raw = build_pkg(ZERO_PASSCODE, true);
        let mut pkg = Pkg::new(raw).unwrap();

        let err = pkg.try_xts([1; 16], [2; 16]).unwrap_err();
        assert!(matches!(err, UnlockError::Mismatch));
        assert!(!pkg.is_file_system_accessible());
    }

    #[test]
    fn extract_param_sfo() {
        let raw = build_pkg(ZERO_PASSCODE, true);
        let mut pkg = Pkg::new(raw).unwrap();

        let (entry, index) = pkg.find_entry(EntryId::ParamSfo).unwrap();
        assert!(entry.is_encrypted());

        // Locked: key index 0 needs the passcode.
        assert!(matches!(
            pkg.entry_data(index, &entry),
            Err(EntryDataError::NoDecryptionKey { key_index: 0 })
        ));

        pkg.try_passcode(ZERO_PASSCODE).unwrap();

        let data = pkg.entry_data(index, &entry).unwrap();
        assert_eq!(data.len(), entry.data_size());
        assert_eq!(&data[..4], &[0x00, 0x50, 0x53, 0x46]);

        // Raw extraction returns the padded ciphertext.
        let raw_data = pkg.extract_entry(index, &entry, false).unwrap();
        assert_eq!(raw_data.len(), entry.disk_size());
        assert_ne!(&raw_data[..4], &[0x00, 0x50, 0x53, 0x46]);
    }

    #[test]
    fn package_without_pfs_opens_with_no_view() {
        // License-only additional content: a bare header, no entries, no
        // PFS image.
        let mut raw = vec![0u8; 0x1000];
        raw[0x000..0x004].copy_from_slice(&0x7F434E54u32.to_be_bytes());
        raw[0x040..0x064].copy_from_slice(CONTENT_ID.as_bytes());
        raw[0x074..0x078].copy_from_slice(&0x1Cu32.to_be_bytes()); // AL

        let mut pkg = Pkg::new(raw).unwrap();

        assert!(pkg.pfs_image().is_none());
        assert!(!pkg.is_file_system_accessible());
        assert_eq!(pkg.unlock_with_store(&KeyStore::default()), None);
        assert!(matches!(
            pkg.try_passcode(ZERO_PASSCODE),
            Err(UnlockError::NoPfsImage)
        ));
        assert!(matches!(pkg.open_pfs(), Err(OpenPfsError::NoPfsImage)));
    }

    #[test]
    fn entitlement_key_comes_from_the_license_secret() {
        let raw = build_pkg(ZERO_PASSCODE, true);
        let pkg = Pkg::new(raw).unwrap();

        assert!(pkg.header().content_type().is_additional_content());
        assert_eq!(pkg.entitlement_key().unwrap(), LICENSE_KEY);
    }

    #[test]
    fn validator_passes_on_a_sound_package() {
        let raw = build_pkg(ZERO_PASSCODE, true);
        let mut pkg = Pkg::new(raw).unwrap();
        pkg.try_passcode(ZERO_PASSCODE).unwrap();

        let rows: Vec<_> = pkg.validate().collect();

        // Ordered by ascending location.
        assert!(rows.windows(2).all(|w| w[0].location <= w[1].location));

        for row in &rows {
            assert_eq!(
                row.status,
                ValidationStatus::Ok,
                "row '{}' at {:#x}",
                row.name,
                row.location
            );
        }
    }

    #[test]
    fn validator_reports_nokey_while_locked() {
        let raw = build_pkg(ZERO_PASSCODE, true);
        let pkg = Pkg::new(raw).unwrap();

        let rows: Vec<_> = pkg.validate().collect();

        let by_name = |name: &str| {
            rows.iter()
                .find(|r| r.name == name)
                .unwrap_or_else(|| panic!("row '{name}' missing"))
        };

        assert_eq!(by_name("Header CMAC").status, ValidationStatus::NoKey);
        assert_eq!(by_name("PFS Signed Digest").status, ValidationStatus::NoKey);
        // The encrypted entry cannot be digested without its key.
        assert!(
            rows.iter()
                .any(|r| r.name == "Entry Digest" && r.status == ValidationStatus::NoKey)
        );

        // Unkeyed digests still verify.
        assert_eq!(by_name("Header Digest").status, ValidationStatus::Ok);
        assert_eq!(by_name("Body Digest").status, ValidationStatus::Ok);
        assert_eq!(by_name("PFS Image Digest").status, ValidationStatus::Ok);
        assert_eq!(by_name("Chunk Digests").status, ValidationStatus::Ok);
    }

    #[test]
    fn validator_flags_tampered_data() {
        let mut raw = build_pkg(ZERO_PASSCODE, true);

        // Corrupt the icon entry's first byte.
        let at = {
            let pkg = Pkg::new(raw.clone()).unwrap();
            let (icon, _) = pkg.find_entry(EntryId::Icon0Png).unwrap();
            icon.data_offset()
        };
        raw[at] ^= 0xFF;

        let mut pkg = Pkg::new(raw).unwrap();
        pkg.try_passcode(ZERO_PASSCODE).unwrap();

        let rows: Vec<_> = pkg.validate().collect();
        let icon_row = rows
            .iter()
            .find(|r| r.name == "Entry Digest" && r.location == at as u64)
            .unwrap();

        assert_eq!(icon_row.status, ValidationStatus::Fail);
        // Collateral: the body digest covers the same bytes.
        assert_eq!(
            rows.iter().find(|r| r.name == "Body Digest").unwrap().status,
            ValidationStatus::Fail
        );
    }
}
