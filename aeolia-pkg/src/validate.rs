//! Package integrity validation.
//!
//! Every digest and signature the package carries is checked and reported as
//! one row. Rows are emitted in ascending order of the byte range they
//! cover, so consumers can stream them next to a hex view. A missing key
//! never fails a row — it surfaces as [`ValidationStatus::NoKey`].

use crate::entry::{EntryId, PkgEntry};
use crate::{EntryDataError, Pkg};
use aes::Aes128;
use cmac::Cmac;
use hmac::{Hmac, Mac};
use sha1::Sha1;
use sha2::{Digest, Sha256};

/// Outcome of a single validation row.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ValidationStatus {
    /// The recorded value matches the computed one.
    Ok,
    /// The recorded value does not match.
    Fail,
    /// The check needs key material that has not been recovered.
    NoKey,
}

/// One validation row.
#[derive(Clone, Debug)]
pub struct ValidationResult {
    pub name: &'static str,
    pub description: &'static str,
    /// Byte offset the checked value covers; rows are ordered by this.
    pub location: u64,
    pub status: ValidationStatus,
}

enum Check {
    HeaderCmac,
    DigestTableEntries,
    DigestTableNames(PkgEntry),
    DigestTableSelf,
    BodyDigest,
    PfsImageDigest,
    PfsSignedDigest,
    HeaderDigest,
    EntryDigest { index: usize, entry: PkgEntry },
    ChunkDigests(PkgEntry),
}

struct Validation {
    name: &'static str,
    description: &'static str,
    location: u64,
    check: Check,
}

impl<R: AsRef<[u8]>> Pkg<R> {
    /// Validates every digest and signature row of the package.
    ///
    /// Rows are computed lazily as the iterator advances and come out
    /// ordered by ascending location. Validation never aborts: mismatches
    /// and missing keys are reported per row.
    pub fn validate(&self) -> impl Iterator<Item = ValidationResult> + '_ {
        let mut checks = self.validations();
        checks.sort_by_key(|v| v.location);

        checks.into_iter().map(|v| ValidationResult {
            name: v.name,
            description: v.description,
            location: v.location,
            status: self.evaluate(&v.check),
        })
    }

    fn validations(&self) -> Vec<Validation> {
        let mut out = vec![
            Validation {
                name: "Header CMAC",
                description: "AES-CMAC over the main header fields",
                location: 0xA0,
                check: Check::HeaderCmac,
            },
            Validation {
                name: "Meta Table Digest",
                description: "SHA-256 of the meta table",
                location: 0x100,
                check: Check::DigestTableEntries,
            },
            Validation {
                name: "Digest Table Digest",
                description: "SHA-256 of the two table digests",
                location: 0x140,
                check: Check::DigestTableSelf,
            },
            Validation {
                name: "Body Digest",
                description: "SHA-256 of the package body",
                location: 0x160,
                check: Check::BodyDigest,
            },
            Validation {
                name: "Header Digest",
                description: "SHA-256 of the header up to this digest",
                location: 0xFE0,
                check: Check::HeaderDigest,
            },
        ];

        if let Ok((entry, _)) = self.find_entry(EntryId::EntryNames) {
            out.push(Validation {
                name: "Entry Names Digest",
                description: "SHA-256 of the entry names blob",
                location: 0x120,
                check: Check::DigestTableNames(entry),
            });
        }

        if self.pfs_image().is_some() {
            out.push(Validation {
                name: "PFS Image Digest",
                description: "SHA-256 of the embedded PFS image",
                location: 0x440,
                check: Check::PfsImageDigest,
            });
            out.push(Validation {
                name: "PFS Signed Digest",
                description: "HMAC-SHA256 of the PFS superblock, keyed with the EKPFS",
                location: 0x460,
                check: Check::PfsSignedDigest,
            });
        }

        // One row per entry, checked against the digests meta.
        if self.find_entry(EntryId::Digests).is_ok() {
            for item in self.entries() {
                let Ok((index, entry)) = item else { continue };

                if entry.entry_id() == EntryId::Digests {
                    continue;
                }

                out.push(Validation {
                    name: "Entry Digest",
                    description: "SHA-256 of the decrypted entry data",
                    location: entry.data_offset() as u64,
                    check: Check::EntryDigest { index, entry },
                });
            }
        }

        if let Ok((entry, _)) = self.find_entry(EntryId::PlaygoChunkSha)
            && self.pfs_image().is_some()
        {
            out.push(Validation {
                name: "Chunk Digests",
                description: "SHA-1 table over 64 KiB chunks of the PFS image",
                location: entry.data_offset() as u64,
                check: Check::ChunkDigests(entry),
            });
        }

        out
    }

    fn evaluate(&self, check: &Check) -> ValidationStatus {
        let raw = self.raw.as_ref();
        let header = self.header.raw_header();

        match check {
            Check::HeaderCmac => {
                let Some(ekpfs) = self.ekpfs() else {
                    return ValidationStatus::NoKey;
                };

                let mut cmac = Cmac::<Aes128>::new_from_slice(&ekpfs[..16]).unwrap();
                cmac.update(&raw[..0xA0]);

                status(cmac.verify_slice(&header.header_cmac).is_ok())
            }

            Check::DigestTableEntries => {
                let table = self.header.table_offset();
                let len = self.entry_count() * PkgEntry::RAW_SIZE;

                match raw.get(table..table + len) {
                    Some(region) => digest_eq(region, &header.digest_table.digest_entries1),
                    None => ValidationStatus::Fail,
                }
            }

            Check::DigestTableNames(entry) => match self.entry_data_raw(entry) {
                Ok(blob) => digest_eq(blob, &header.digest_table.digest_entries2),
                Err(_) => ValidationStatus::Fail,
            },

            Check::DigestTableSelf => {
                digest_eq(&raw[0x100..0x140], &header.digest_table.digest_table_digest)
            }

            Check::BodyDigest => {
                let start = self.header.body_offset() as usize;
                let len = self.header.body_size() as usize;

                match raw.get(start..start + len) {
                    Some(region) => digest_eq(region, &header.digest_table.digest_body_digest),
                    None => ValidationStatus::Fail,
                }
            }

            Check::PfsImageDigest => match self.pfs_image() {
                Some(pfs) => digest_eq(pfs, self.header.pfs_image_digest()),
                None => ValidationStatus::Fail,
            },

            Check::PfsSignedDigest => match self.ekpfs() {
                Some(ekpfs) => status(self.check_ekpfs(ekpfs)),
                None => ValidationStatus::NoKey,
            },

            Check::HeaderDigest => digest_eq(&raw[..0xFE0], &header.pkg_digest),

            Check::EntryDigest { index, entry } => {
                let expected = match self.entry_digest(*index) {
                    Some(v) => v,
                    None => return ValidationStatus::Fail,
                };

                match self.entry_data(*index, entry) {
                    Ok(data) => digest_eq(&data, &expected),
                    Err(EntryDataError::NoDecryptionKey { .. }) => ValidationStatus::NoKey,
                    Err(_) => ValidationStatus::Fail,
                }
            }

            Check::ChunkDigests(entry) => {
                let Some(pfs) = self.pfs_image() else {
                    return ValidationStatus::Fail;
                };

                let Ok(expected) = self.entry_data_raw(entry) else {
                    return ValidationStatus::Fail;
                };

                let mut computed = Vec::with_capacity(expected.len());
                for chunk in pfs.chunks(0x10000) {
                    let digest: [u8; 20] = Sha1::digest(chunk).into();
                    computed.extend_from_slice(&digest);
                }

                status(computed == expected)
            }
        }
    }

    /// Reads the recorded digest for entry `index` from the digests meta.
    fn entry_digest(&self, index: usize) -> Option<[u8; 32]> {
        let (entry, _) = self.find_entry(EntryId::Digests).ok()?;
        let table = self.entry_data_raw(&entry).ok()?;

        table
            .get(index * 32..(index + 1) * 32)
            .map(|d| d.try_into().unwrap())
    }
}

fn digest_eq(data: &[u8], expected: &[u8; 32]) -> ValidationStatus {
    let computed: [u8; 32] = Sha256::digest(data).into();
    status(&computed == expected)
}

fn status(ok: bool) -> ValidationStatus {
    if ok {
        ValidationStatus::Ok
    } else {
        ValidationStatus::Fail
    }
}

/// An HMAC-SHA256 helper kept next to the validator so both the signed
/// digest row and fixture builders agree on the construction.
#[must_use]
pub fn hmac_sha256(key: &[u8], data: &[u8]) -> [u8; 32] {
    let mut hmac = Hmac::<Sha256>::new_from_slice(key).unwrap();
    hmac.update(data);
    hmac.finalize().into_bytes().into()
}
