//! Persisted key material, mapped by content ID.
//!
//! The store is a single JSON file. It is an explicit value handed to the
//! open path — there is no process-wide database.

use serde::{Deserialize, Serialize};
use snafu::{ResultExt, Snafu};
use std::collections::BTreeMap;
use std::path::Path;

/// Errors when loading a key store from disk.
#[derive(Debug, Snafu)]
#[non_exhaustive]
pub enum LoadError {
    #[snafu(display("cannot read key store"))]
    ReadFailed { source: std::io::Error },

    #[snafu(display("cannot parse key store"))]
    ParseFailed { source: serde_json::Error },
}

/// Errors when saving a key store to disk.
#[derive(Debug, Snafu)]
#[non_exhaustive]
pub enum SaveError {
    #[snafu(display("cannot serialize key store"))]
    SerializeFailed { source: serde_json::Error },

    #[snafu(display("cannot write key store"))]
    WriteFailed { source: std::io::Error },
}

/// An explicit XTS key pair.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StoredXts {
    pub data: [u8; 16],
    pub tweak: [u8; 16],
}

/// Key material known for one content ID.
#[derive(Debug, Default, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StoredKeys {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub passcode: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ekpfs: Option<[u8; 32]>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub xts: Option<StoredXts>,
}

/// A persisted `content_id → keys` map.
#[derive(Debug, Default, Serialize, Deserialize)]
#[must_use]
pub struct KeyStore {
    entries: BTreeMap<String, StoredKeys>,
}

impl KeyStore {
    /// Loads a key store, returning an empty store when the file does not
    /// exist yet.
    pub fn load(path: &Path) -> Result<Self, LoadError> {
        let raw = match std::fs::read(path) {
            Ok(raw) => raw,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Self::default()),
            Err(e) => return Err(LoadError::ReadFailed { source: e }),
        };

        serde_json::from_slice(&raw).context(ParseFailedSnafu)
    }

    /// Saves the store to a single JSON file.
    pub fn save(&self, path: &Path) -> Result<(), SaveError> {
        let raw = serde_json::to_vec_pretty(self).context(SerializeFailedSnafu)?;
        std::fs::write(path, raw).context(WriteFailedSnafu)
    }

    /// Returns the keys stored under `id`, if any.
    #[must_use]
    pub fn get(&self, id: &str) -> Option<&StoredKeys> {
        self.entries.get(id)
    }

    /// Returns the number of content IDs in the store.
    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Iterates over `(content_id, keys)` pairs.
    pub fn iter(&self) -> impl Iterator<Item = (&str, &StoredKeys)> {
        self.entries.iter().map(|(k, v)| (k.as_str(), v))
    }

    pub fn set_passcode(&mut self, id: &str, passcode: &str) {
        self.entries.entry(id.to_string()).or_default().passcode = Some(passcode.to_string());
    }

    pub fn set_ekpfs(&mut self, id: &str, ekpfs: [u8; 32]) {
        self.entries.entry(id.to_string()).or_default().ekpfs = Some(ekpfs);
    }

    pub fn set_xts(&mut self, id: &str, data: [u8; 16], tweak: [u8; 16]) {
        self.entries.entry(id.to_string()).or_default().xts = Some(StoredXts { data, tweak });
    }

    /// Removes all keys stored under `id`.
    pub fn remove(&mut self, id: &str) -> Option<StoredKeys> {
        self.entries.remove(id)
    }
}
