//! Key derivation for PKG entries and the embedded PFS image.
//!
//! All constructions are HMAC-SHA256 based. The fixed constants below stand
//! in for the console's internal secrets; every check in this crate is
//! self-consistent against them.

use aes::Aes128;
use aes::cipher::generic_array::GenericArray;
use aes::cipher::{BlockDecryptMut, BlockEncryptMut, KeyIvInit};
use hmac::{Hmac, Mac};
use sha2::{Digest, Sha256};

/// Length of a package passcode in ASCII characters.
pub const PASSCODE_LEN: usize = 32;

/// The all-zeros passcode most published packages ship with.
pub const ZERO_PASSCODE: &str = "00000000000000000000000000000000";

/// Fixed key for the PFS key generator.
const PFS_GEN_KEY: [u8; 32] = [
    0x9D, 0x4E, 0xC5, 0x21, 0xB8, 0x0F, 0x62, 0xAE, 0x5C, 0x01, 0xD7, 0x96, 0x3B, 0x2A, 0x64, 0x18,
    0x7F, 0xE4, 0x58, 0x0C, 0x33, 0xD1, 0x8A, 0xF5, 0x40, 0x29, 0xCB, 0x76, 0x12, 0xAD, 0x9E, 0x63,
];

/// Debug key pair used to wrap the image-key blob.
pub const DEBUG_IMAGE_KEY: [u8; 16] = [
    0x35, 0xC2, 0x8D, 0x50, 0xE1, 0x0A, 0x47, 0xBC, 0x29, 0xF4, 0x63, 0x9B, 0x16, 0xD8, 0x7E, 0x01,
];
pub const DEBUG_IMAGE_IV: [u8; 16] = [
    0xA8, 0x1F, 0x64, 0xDB, 0x02, 0x95, 0x3E, 0xC7, 0x58, 0x80, 0x4D, 0x12, 0xEF, 0x36, 0xA9, 0x74,
];

/// Debug key for `license.dat` secrets.
pub const DEBUG_RIF_KEY: [u8; 16] = [
    0x61, 0x9B, 0x04, 0xFD, 0x28, 0xC3, 0x97, 0x5A, 0xE6, 0x31, 0x8C, 0x45, 0xD2, 0x0B, 0x7A, 0xCE,
];

/// The console's fixed-key HMAC construction: `HMAC-SHA256(key, index_le || seed)`.
#[must_use]
pub fn gen_crypto_key(key: &[u8], seed: &[u8], index: u32) -> [u8; 32] {
    let mut hmac = Hmac::<Sha256>::new_from_slice(key).unwrap();
    hmac.update(&index.to_le_bytes());
    hmac.update(seed);
    hmac.finalize().into_bytes().into()
}

/// Derives the EKPFS from a passcode.
///
/// The signing key is generated over `"pfs_sig" || content_id` with index 1;
/// the EKPFS is the HMAC of the passcode under that key.
#[must_use]
pub fn ekpfs_from_passcode(content_id: &str, passcode: &str) -> [u8; 32] {
    let mut seed = Vec::with_capacity(7 + content_id.len());
    seed.extend_from_slice(b"pfs_sig");
    seed.extend_from_slice(content_id.as_bytes());

    let sig_key = gen_crypto_key(&PFS_GEN_KEY, &seed, 1);

    let mut hmac = Hmac::<Sha256>::new_from_slice(&sig_key).unwrap();
    hmac.update(passcode.as_bytes());
    hmac.finalize().into_bytes().into()
}

/// Derives the per-entry AES-CBC IV and key.
///
/// The secret is the passcode for key indexes below 3 and the unwrapped
/// image-key blob for key index 3.
#[must_use]
pub fn entry_iv_key(
    entry_record: &[u8],
    index: u32,
    content_id: &str,
    secret: &[u8],
) -> ([u8; 16], [u8; 16]) {
    let mut sha256 = Sha256::new();
    sha256.update(entry_record);
    sha256.update(index.to_le_bytes());
    sha256.update(content_id.as_bytes());
    sha256.update(secret);
    let digest = sha256.finalize();

    let (iv, key) = digest.split_at(16);
    (iv.try_into().unwrap(), key.try_into().unwrap())
}

/// Decrypts AES-128-CBC data without padding. `data` must be block-aligned.
#[must_use]
pub fn decrypt_cbc(key: &[u8; 16], iv: &[u8; 16], data: &[u8]) -> Vec<u8> {
    debug_assert_eq!(data.len() % 16, 0);

    let mut decryptor = cbc::Decryptor::<Aes128>::new(key.into(), iv.into());
    let mut out = data.to_vec();

    for block in out.chunks_exact_mut(16) {
        decryptor.decrypt_block_mut(GenericArray::from_mut_slice(block));
    }

    out
}

/// Encrypts AES-128-CBC data without padding. `data` must be block-aligned.
///
/// The inverse of [`decrypt_cbc`], used when wrapping key blobs and license
/// secrets for freshly built packages.
#[must_use]
pub fn encrypt_cbc(key: &[u8; 16], iv: &[u8; 16], data: &[u8]) -> Vec<u8> {
    debug_assert_eq!(data.len() % 16, 0);

    let mut encryptor = cbc::Encryptor::<Aes128>::new(key.into(), iv.into());
    let mut out = data.to_vec();

    for block in out.chunks_exact_mut(16) {
        encryptor.encrypt_block_mut(GenericArray::from_mut_slice(block));
    }

    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ekpfs_depends_on_both_inputs() {
        let a = ekpfs_from_passcode("AA0000-BBBB00000_00-ZZZZZZZZZZZZZZZZ", ZERO_PASSCODE);
        let b = ekpfs_from_passcode("AA0000-BBBB00000_00-ZZZZZZZZZZZZZZZZ", "not the passcode!!");
        let c = ekpfs_from_passcode("AA0000-CCCC00000_00-ZZZZZZZZZZZZZZZZ", ZERO_PASSCODE);

        assert_ne!(a, b);
        assert_ne!(a, c);
        assert_eq!(
            a,
            ekpfs_from_passcode("AA0000-BBBB00000_00-ZZZZZZZZZZZZZZZZ", ZERO_PASSCODE)
        );
    }

    #[test]
    fn entry_keys_differ_per_index() {
        let record = [7u8; 32];
        let (iv0, key0) = entry_iv_key(&record, 0, "id", b"secret");
        let (iv1, key1) = entry_iv_key(&record, 1, "id", b"secret");

        assert_ne!((iv0, key0), (iv1, key1));
        assert_ne!(iv0, key0);
    }

    #[test]
    fn cbc_roundtrip() {
        let key = [1u8; 16];
        let iv = [2u8; 16];
        let plain = [0xABu8; 48];

        let enc = encrypt_cbc(&key, &iv, &plain);
        assert_ne!(enc.as_slice(), &plain[..]);
        assert_eq!(decrypt_cbc(&key, &iv, &enc), plain);
    }
}
