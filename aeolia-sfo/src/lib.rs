//! Codec for PlayStation 4 SFO (system file object) parameter files.
//!
//! An SFO is a small key/value table: `param.sfo` carries the title, version
//! and publishing metadata of a package. This crate parses and serializes
//! the binary layout with byte-exact round-trips, so a file can be edited in
//! place without disturbing unrelated bytes.
//!
//! # Example
//!
//! ```
//! use aeolia_sfo::{Sfo, Value};
//!
//! let mut sfo = Sfo::new();
//! sfo.set("TITLE", Value::Utf8("Example".into()));
//! sfo.set("APP_VER", Value::Utf8("01.00".into()));
//!
//! let raw = sfo.serialize();
//! let back = Sfo::parse(&raw).unwrap();
//! assert_eq!(back.get_str("TITLE"), Some("Example"));
//! ```
//!
//! # References
//!
//! - [PS4 Developer Wiki - Param.sfo](https://www.psdevwiki.com/ps4/Param.sfo)

use snafu::{OptionExt, Snafu, ensure};
use zerocopy::{
    FromBytes, Immutable, IntoBytes, KnownLayout, Unaligned,
    little_endian::{U16, U32},
};

/// `"\0PSF"`, the parameter file magic (big-endian 0x00505346).
const PSF_MAGIC: [u8; 4] = [0x00, 0x50, 0x53, 0x46];

/// `"SCEC"`: an outer container that prefixes the SFO with a 0x800-byte
/// envelope.
const SCEC_MAGIC: [u8; 4] = [0x53, 0x43, 0x45, 0x43];
const SCEC_SKIP: usize = 0x800;

const VERSION: u32 = 0x101;

/// Fixed SFO header (20 bytes).
#[derive(FromBytes, IntoBytes, Immutable, KnownLayout, Unaligned)]
#[repr(C)]
struct SfoHeaderRaw {
    magic: [u8; 4],
    version: U32,
    key_table_off: U32,
    data_table_off: U32,
    num_values: U32,
}

/// One index record (16 bytes).
#[derive(Clone, Copy, FromBytes, IntoBytes, Immutable, KnownLayout, Unaligned)]
#[repr(C)]
struct IndexEntryRaw {
    key_off: U16,
    format: U16,
    length: U32,
    max_length: U32,
    data_off: U32,
}

/// Value format codes.
const FORMAT_UTF8_SPECIAL: u16 = 0x004;
const FORMAT_UTF8: u16 = 0x204;
const FORMAT_INTEGER: u16 = 0x404;

/// Errors when parsing an SFO.
#[derive(Debug, Snafu)]
#[non_exhaustive]
pub enum ParseError {
    #[snafu(display("data too small"))]
    TooSmall,

    #[snafu(display("invalid magic"))]
    InvalidMagic,

    #[snafu(display("table offsets are inconsistent"))]
    InvalidTables,

    #[snafu(display("value #{index} has unknown format {format:#06x}"))]
    UnknownFormat { index: usize, format: u16 },

    #[snafu(display("value #{index} is malformed"))]
    MalformedValue { index: usize },

    #[snafu(display("key #{index} is malformed"))]
    MalformedKey { index: usize },
}

/// A typed SFO value.
#[derive(Clone, Debug, PartialEq, Eq)]
#[non_exhaustive]
pub enum Value {
    /// UTF-8 text stored without a NUL terminator.
    Utf8Special(String),
    /// NUL-terminated UTF-8 text; the recorded length includes the NUL.
    Utf8(String),
    /// 32-bit little-endian integer.
    Integer(u32),
}

impl Value {
    fn format(&self) -> u16 {
        match self {
            Self::Utf8Special(_) => FORMAT_UTF8_SPECIAL,
            Self::Utf8(_) => FORMAT_UTF8,
            Self::Integer(_) => FORMAT_INTEGER,
        }
    }

    /// The recorded data length of this value.
    fn length(&self) -> u32 {
        match self {
            Self::Utf8Special(s) => s.len() as u32,
            Self::Utf8(s) => s.len() as u32 + 1,
            Self::Integer(_) => 4,
        }
    }

    /// The smallest 4-byte-aligned slot that fits this value.
    fn default_max_length(&self) -> u32 {
        (self.length() + 3) & !3
    }
}

/// One key/value pair plus its reserved slot size.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SfoEntry {
    pub key: String,
    pub value: Value,
    /// Reserved capacity of the data slot; never below the value length.
    pub max_length: u32,
}

/// A parsed parameter table.
///
/// Entries are kept sorted ascending by key, which is also the on-disk
/// order the serializer writes.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
#[must_use]
pub struct Sfo {
    entries: Vec<SfoEntry>,
}

impl Sfo {
    /// Creates an empty parameter table.
    pub fn new() -> Self {
        Self::default()
    }

    /// Parses an SFO, skipping a `SCEC` envelope when present.
    pub fn parse(data: &[u8]) -> Result<Self, ParseError> {
        let body = if data.get(..4) == Some(&SCEC_MAGIC) {
            data.get(SCEC_SKIP..).context(TooSmallSnafu)?
        } else {
            data
        };

        let (header, _) =
            SfoHeaderRaw::read_from_prefix(body).map_err(|_| TooSmallSnafu.build())?;

        ensure!(header.magic == PSF_MAGIC, InvalidMagicSnafu);

        let key_table = header.key_table_off.get() as usize;
        let data_table = header.data_table_off.get() as usize;
        let count = header.num_values.get() as usize;

        ensure!(
            key_table <= data_table && data_table <= body.len(),
            InvalidTablesSnafu
        );
        ensure!(
            size_of::<SfoHeaderRaw>() + count * size_of::<IndexEntryRaw>() <= key_table,
            InvalidTablesSnafu
        );

        let mut entries = Vec::with_capacity(count);

        for index in 0..count {
            let at = size_of::<SfoHeaderRaw>() + index * size_of::<IndexEntryRaw>();
            let raw = IndexEntryRaw::read_from_bytes(&body[at..at + size_of::<IndexEntryRaw>()])
                .expect("index slice is exactly one record");

            // Key: NUL-terminated within the key table.
            let key_at = key_table + raw.key_off.get() as usize;
            let key_bytes = body
                .get(key_at..data_table)
                .and_then(|tail| tail.split(|&b| b == 0).next())
                .context(MalformedKeySnafu { index })?;
            let key = std::str::from_utf8(key_bytes)
                .map_err(|_| MalformedKeySnafu { index }.build())?
                .to_string();

            // Value: `length` bytes within the data table.
            let length = raw.length.get() as usize;
            let value_at = data_table + raw.data_off.get() as usize;
            let value_bytes = body
                .get(value_at..value_at + length)
                .context(MalformedValueSnafu { index })?;

            let value = match raw.format.get() {
                FORMAT_UTF8_SPECIAL => Value::Utf8Special(
                    std::str::from_utf8(value_bytes)
                        .map_err(|_| MalformedValueSnafu { index }.build())?
                        .to_string(),
                ),
                FORMAT_UTF8 => {
                    // The recorded length covers the NUL terminator.
                    ensure!(
                        value_bytes.last() == Some(&0),
                        MalformedValueSnafu { index }
                    );
                    Value::Utf8(
                        std::str::from_utf8(&value_bytes[..length - 1])
                            .map_err(|_| MalformedValueSnafu { index }.build())?
                            .to_string(),
                    )
                }
                FORMAT_INTEGER => {
                    ensure!(length == 4, MalformedValueSnafu { index });
                    Value::Integer(u32::from_le_bytes(value_bytes.try_into().unwrap()))
                }
                format => return Err(UnknownFormatSnafu { index, format }.build()),
            };

            entries.push(SfoEntry {
                key,
                value,
                max_length: raw.max_length.get(),
            });
        }

        Ok(Self { entries })
    }

    /// Serializes the table.
    ///
    /// Values are written sorted ascending by key; the data table starts at
    /// the next 4-byte boundary after the key table.
    #[must_use]
    pub fn serialize(&self) -> Vec<u8> {
        let mut entries: Vec<&SfoEntry> = self.entries.iter().collect();
        entries.sort_by(|a, b| a.key.cmp(&b.key));

        // Key table layout.
        let mut key_offsets = Vec::with_capacity(entries.len());
        let mut key_table = Vec::new();

        for entry in &entries {
            key_offsets.push(key_table.len() as u16);
            key_table.extend_from_slice(entry.key.as_bytes());
            key_table.push(0);
        }

        let key_table_off = size_of::<SfoHeaderRaw>() + entries.len() * size_of::<IndexEntryRaw>();
        let data_table_off = (key_table_off + key_table.len() + 3) & !3;

        // Data table layout: one slot of max_length per value.
        let mut data_offsets = Vec::with_capacity(entries.len());
        let mut data_table = Vec::new();

        for entry in &entries {
            let slot = entry.max_length.max(entry.value.length()) as usize;
            data_offsets.push(data_table.len() as u32);

            let start = data_table.len();
            match &entry.value {
                Value::Utf8Special(s) => data_table.extend_from_slice(s.as_bytes()),
                Value::Utf8(s) => {
                    data_table.extend_from_slice(s.as_bytes());
                    data_table.push(0);
                }
                Value::Integer(v) => data_table.extend_from_slice(&v.to_le_bytes()),
            }
            data_table.resize(start + slot, 0);
        }

        // Assemble.
        let mut out = Vec::with_capacity(data_table_off + data_table.len());

        let header = SfoHeaderRaw {
            magic: PSF_MAGIC,
            version: VERSION.into(),
            key_table_off: (key_table_off as u32).into(),
            data_table_off: (data_table_off as u32).into(),
            num_values: (entries.len() as u32).into(),
        };
        out.extend_from_slice(header.as_bytes());

        for (i, entry) in entries.iter().enumerate() {
            let raw = IndexEntryRaw {
                key_off: key_offsets[i].into(),
                format: entry.value.format().into(),
                length: entry.value.length().into(),
                max_length: entry.max_length.max(entry.value.length()).into(),
                data_off: data_offsets[i].into(),
            };
            out.extend_from_slice(raw.as_bytes());
        }

        out.extend_from_slice(&key_table);
        out.resize(data_table_off, 0);
        out.extend_from_slice(&data_table);

        out
    }

    /// Returns the value stored under `key`.
    #[must_use]
    pub fn get(&self, key: &str) -> Option<&Value> {
        self.entries
            .iter()
            .find(|e| e.key == key)
            .map(|e| &e.value)
    }

    /// Returns the string stored under `key`, for either text format.
    #[must_use]
    pub fn get_str(&self, key: &str) -> Option<&str> {
        match self.get(key)? {
            Value::Utf8(s) | Value::Utf8Special(s) => Some(s),
            Value::Integer(_) => None,
        }
    }

    /// Returns the integer stored under `key`.
    #[must_use]
    pub fn get_int(&self, key: &str) -> Option<u32> {
        match self.get(key)? {
            Value::Integer(v) => Some(*v),
            _ => None,
        }
    }

    /// Inserts or replaces a value, reserving the smallest aligned slot.
    ///
    /// A replaced entry keeps its slot when the new value still fits, so
    /// rewriting metadata does not shift the data table.
    pub fn set(&mut self, key: &str, value: Value) {
        if let Some(entry) = self.entries.iter_mut().find(|e| e.key == key) {
            entry.max_length = entry.max_length.max(value.default_max_length());
            entry.value = value;
            return;
        }

        let max_length = value.default_max_length();
        let at = self
            .entries
            .partition_point(|e| e.key.as_str() < key);
        self.entries.insert(
            at,
            SfoEntry {
                key: key.to_string(),
                value,
                max_length,
            },
        );
    }

    /// Removes and returns the entry stored under `key`.
    pub fn remove(&mut self, key: &str) -> Option<SfoEntry> {
        let at = self.entries.iter().position(|e| e.key == key)?;
        Some(self.entries.remove(at))
    }

    /// Returns the entries, sorted ascending by key.
    pub fn entries(&self) -> &[SfoEntry] {
        &self.entries
    }

    /// Returns the number of values.
    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn roundtrip_preserves_values_and_bytes() {
        let mut sfo = Sfo::new();
        sfo.set("TITLE", Value::Utf8("T".into()));
        sfo.set("VERSION", Value::Utf8("01.00".into()));

        let raw = sfo.serialize();
        let parsed = Sfo::parse(&raw).unwrap();

        assert_eq!(parsed.get_str("TITLE"), Some("T"));
        assert_eq!(parsed.get_str("VERSION"), Some("01.00"));
        assert_eq!(parsed, sfo);

        // Byte-exact both ways.
        assert_eq!(parsed.serialize(), raw);
    }

    #[test]
    fn all_value_formats_roundtrip() {
        let mut sfo = Sfo::new();
        sfo.set("APP_TYPE", Value::Integer(1));
        sfo.set("CATEGORY", Value::Utf8Special("gd".into()));
        sfo.set("TITLE", Value::Utf8("A Game".into()));

        let parsed = Sfo::parse(&sfo.serialize()).unwrap();

        assert_eq!(parsed.get_int("APP_TYPE"), Some(1));
        assert_eq!(parsed.get_str("CATEGORY"), Some("gd"));
        assert_eq!(parsed.get_str("TITLE"), Some("A Game"));
        assert_eq!(parsed, sfo);
    }

    #[test]
    fn entries_are_sorted_by_key_on_write() {
        let mut sfo = Sfo::new();
        sfo.set("ZULU", Value::Integer(1));
        sfo.set("ALPHA", Value::Integer(2));
        sfo.set("MIKE", Value::Integer(3));

        let keys: Vec<&str> = sfo.entries().iter().map(|e| e.key.as_str()).collect();
        assert_eq!(keys, ["ALPHA", "MIKE", "ZULU"]);

        let parsed = Sfo::parse(&sfo.serialize()).unwrap();
        let keys: Vec<&str> = parsed.entries().iter().map(|e| e.key.as_str()).collect();
        assert_eq!(keys, ["ALPHA", "MIKE", "ZULU"]);
    }

    #[test]
    fn utf8_length_counts_the_nul() {
        let mut sfo = Sfo::new();
        sfo.set("TITLE", Value::Utf8("abc".into()));

        let raw = sfo.serialize();

        // Single index entry at offset 20: length at +4, format at +2.
        let format = u16::from_le_bytes(raw[22..24].try_into().unwrap());
        let length = u32::from_le_bytes(raw[24..28].try_into().unwrap());
        assert_eq!(format, 0x204);
        assert_eq!(length, 4);
    }

    #[test]
    fn data_table_is_aligned() {
        let mut sfo = Sfo::new();
        // A 5-byte key makes the key table length odd.
        sfo.set("ODDKY", Value::Integer(7));

        let raw = sfo.serialize();
        let data_table_off = u32::from_le_bytes(raw[12..16].try_into().unwrap());
        assert_eq!(data_table_off % 4, 0);

        assert_eq!(Sfo::parse(&raw).unwrap().get_int("ODDKY"), Some(7));
    }

    #[test]
    fn scec_envelope_skips_exactly_0x800_bytes() {
        let mut sfo = Sfo::new();
        sfo.set("TITLE", Value::Utf8("wrapped".into()));
        let inner = sfo.serialize();

        let mut wrapped = vec![0u8; 0x800];
        wrapped[..4].copy_from_slice(b"SCEC");
        wrapped.extend_from_slice(&inner);

        let parsed = Sfo::parse(&wrapped).unwrap();
        assert_eq!(parsed.get_str("TITLE"), Some("wrapped"));

        // One byte short of the envelope is rejected.
        assert!(matches!(
            Sfo::parse(&wrapped[..0x7FF]),
            Err(ParseError::TooSmall)
        ));
    }

    #[test]
    fn replacing_a_value_keeps_its_slot() {
        let mut sfo = Sfo::new();
        sfo.set("PUBTOOLINFO", Value::Utf8("c_date=20240101,c_time=120000".into()));
        let before = sfo.entries()[0].max_length;

        sfo.set("PUBTOOLINFO", Value::Utf8(String::new()));
        assert_eq!(sfo.entries()[0].max_length, before);

        let parsed = Sfo::parse(&sfo.serialize()).unwrap();
        assert_eq!(parsed.get_str("PUBTOOLINFO"), Some(""));
        assert_eq!(parsed.entries()[0].max_length, before);
    }

    #[test]
    fn malformed_inputs_are_rejected() {
        assert!(matches!(Sfo::parse(&[0u8; 4]), Err(ParseError::TooSmall)));

        let mut bad_magic = Sfo::new().serialize();
        bad_magic[0] = 0xFF;
        assert!(matches!(
            Sfo::parse(&bad_magic),
            Err(ParseError::InvalidMagic)
        ));

        // data_table_off < key_table_off.
        let mut sfo = Sfo::new();
        sfo.set("A", Value::Integer(0));
        let mut crossed = sfo.serialize();
        let key_table_off = u32::from_le_bytes(crossed[8..12].try_into().unwrap());
        crossed[12..16].copy_from_slice(&(key_table_off - 1).to_le_bytes());
        assert!(matches!(
            Sfo::parse(&crossed),
            Err(ParseError::InvalidTables)
        ));
    }

    #[test]
    fn utf8_missing_nul_is_rejected() {
        let mut sfo = Sfo::new();
        sfo.set("K", Value::Utf8("xy".into()));
        let mut raw = sfo.serialize();

        // Overwrite the terminator inside the data table.
        let data_table_off = u32::from_le_bytes(raw[12..16].try_into().unwrap()) as usize;
        raw[data_table_off + 2] = b'!';

        assert!(matches!(
            Sfo::parse(&raw),
            Err(ParseError::MalformedValue { index: 0 })
        ));
    }
}
