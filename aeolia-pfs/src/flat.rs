//! Flat path table: the on-disk hash → inode lookup accelerator.
//!
//! The table is a list of `(hash, value)` rows sorted by hash. The top
//! nibble of `value` carries the entry type; the low 28 bits carry the inode
//! number, or — for colliding hashes — an offset into the collision
//! resolver blob, which holds full dirent records for each colliding path.

use crate::directory::dirent::Dirent;
use snafu::{Snafu, ensure};
use std::collections::BTreeMap;
use zerocopy::{FromBytes, Immutable, IntoBytes, KnownLayout, little_endian::U32};

/// Hashes a uroot-relative path (beginning with `/`).
///
/// The hash is case-insensitive: every byte is upper-cased before being
/// folded in as `h = to_upper(c) + 31 * h`.
#[must_use]
pub fn path_hash(path: &str) -> u32 {
    let mut h: u32 = 0;

    for b in path.bytes() {
        h = u32::from(b.to_ascii_uppercase()).wrapping_add(h.wrapping_mul(31));
    }

    h
}

/// Entry type stored in the top nibble of a table row value.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[repr(u32)]
pub enum FlatType {
    File = 0x0,
    Dir = 0x2,
    SceSysFile = 0x4,
    SceSysDir = 0x6,
    Collision = 0x8,
}

impl FlatType {
    const SHIFT: u32 = 28;
    const VALUE_MASK: u32 = (1 << Self::SHIFT) - 1;

    fn from_value(value: u32) -> Option<Self> {
        match value >> Self::SHIFT {
            0x0 => Some(Self::File),
            0x2 => Some(Self::Dir),
            0x4 => Some(Self::SceSysFile),
            0x6 => Some(Self::SceSysDir),
            0x8 => Some(Self::Collision),
            _ => None,
        }
    }
}

/// A node to be indexed: its full uroot-relative path and inode number.
#[derive(Clone, Debug)]
pub struct FlatNode {
    pub path: String,
    pub inode: u32,
    pub is_dir: bool,
}

impl FlatNode {
    fn flat_type(&self) -> FlatType {
        let sce_sys = self.path.starts_with("/sce_sys");

        match (sce_sys, self.is_dir) {
            (true, true) => FlatType::SceSysDir,
            (true, false) => FlatType::SceSysFile,
            (false, true) => FlatType::Dir,
            (false, false) => FlatType::File,
        }
    }
}

/// Raw table row (8 bytes).
#[derive(FromBytes, IntoBytes, Immutable, KnownLayout)]
#[repr(C)]
struct RowRaw {
    hash: U32,
    value: U32,
}

/// Errors when building a flat path table from a node list.
#[derive(Debug, Snafu)]
#[non_exhaustive]
pub enum BuildError {
    #[snafu(display("duplicate path '{path}'"))]
    DuplicatePath { path: String },

    #[snafu(display("inode #{inode} does not fit in 28 bits"))]
    InodeOutOfRange { inode: u32 },
}

/// Errors when parsing a flat path table.
#[derive(Debug, Snafu)]
#[non_exhaustive]
pub enum ParseError {
    #[snafu(display("table size is not a multiple of the row size"))]
    TruncatedRow,

    #[snafu(display("rows are not sorted by hash"))]
    UnsortedRows,

    #[snafu(display("row #{row} has an unknown type nibble"))]
    UnknownType { row: usize },
}

/// The result of a [`FlatPathTable::lookup()`].
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Lookup {
    /// The hash maps directly to an inode.
    Direct { ty: FlatType, inode: u32 },
    /// The hash collides; resolve through the collision blob at `offset`.
    Collision { offset: u32 },
}

/// A flat path table plus its collision resolver blob (empty when no two
/// paths collide).
#[derive(Debug, Default)]
#[must_use]
pub struct FlatPathTable {
    /// Rows sorted ascending by hash.
    rows: Vec<(u32, u32)>,
    resolver: Vec<u8>,
}

impl FlatPathTable {
    /// Builds a table from a node list.
    ///
    /// Nodes with identical full paths are rejected. When two distinct paths
    /// share a hash, a single `Collision` row is emitted for that hash and a
    /// dirent list for the colliding paths is appended to the resolver blob.
    pub fn build(nodes: &[FlatNode]) -> Result<Self, BuildError> {
        // Group by hash, keeping insertion order inside each bucket.
        let mut buckets: BTreeMap<u32, Vec<&FlatNode>> = BTreeMap::new();

        for node in nodes {
            ensure!(
                node.inode <= FlatType::VALUE_MASK,
                InodeOutOfRangeSnafu { inode: node.inode }
            );

            let bucket = buckets.entry(path_hash(&node.path)).or_default();

            ensure!(
                !bucket.iter().any(|n| n.path == node.path),
                DuplicatePathSnafu { path: &node.path }
            );

            bucket.push(node);
        }

        let mut rows = Vec::with_capacity(buckets.len());
        let mut resolver = Vec::new();

        for (hash, bucket) in buckets {
            if let [node] = bucket.as_slice() {
                let value = ((node.flat_type() as u32) << FlatType::SHIFT) | node.inode;
                rows.push((hash, value));
            } else {
                let offset = resolver.len() as u32;

                for node in &bucket {
                    let ty = if node.is_dir {
                        Dirent::DIRECTORY
                    } else {
                        Dirent::FILE
                    };
                    resolver.extend_from_slice(&Dirent::encode(
                        node.inode,
                        ty,
                        node.path.as_bytes(),
                    ));
                }

                // List trailer.
                resolver.extend_from_slice(&[0u8; 0x18]);

                let value = ((FlatType::Collision as u32) << FlatType::SHIFT) | offset;
                rows.push((hash, value));
            }
        }

        Ok(Self { rows, resolver })
    }

    /// Parses a table from its on-disk row encoding.
    ///
    /// The resolver blob (stored separately, as the `cr` file) is not part
    /// of this encoding; pass it to [`resolve_collision`] when a lookup
    /// returns [`Lookup::Collision`].
    pub fn parse(data: &[u8]) -> Result<Self, ParseError> {
        ensure!(data.len() % size_of::<RowRaw>() == 0, TruncatedRowSnafu);

        let mut rows = Vec::with_capacity(data.len() / size_of::<RowRaw>());

        for (i, chunk) in data.chunks_exact(size_of::<RowRaw>()).enumerate() {
            let raw = RowRaw::read_from_bytes(chunk).expect("chunk is exactly one row");
            let (hash, value) = (raw.hash.get(), raw.value.get());

            ensure!(
                FlatType::from_value(value).is_some(),
                UnknownTypeSnafu { row: i }
            );

            if let Some(&(prev, _)) = rows.last() {
                ensure!(prev <= hash, UnsortedRowsSnafu);
            }

            rows.push((hash, value));
        }

        Ok(Self {
            rows,
            resolver: Vec::new(),
        })
    }

    /// Serializes the rows to their on-disk encoding.
    #[must_use]
    pub fn write(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(self.rows.len() * size_of::<RowRaw>());

        for &(hash, value) in &self.rows {
            let raw = RowRaw {
                hash: hash.into(),
                value: value.into(),
            };
            out.extend_from_slice(raw.as_bytes());
        }

        out
    }

    /// Returns the rows, sorted ascending by hash.
    pub fn rows(&self) -> &[(u32, u32)] {
        &self.rows
    }

    /// Returns the collision resolver blob. Empty when no hashes collide.
    pub fn resolver(&self) -> &[u8] {
        &self.resolver
    }

    /// Returns `true` if any two indexed paths share a hash.
    #[must_use]
    pub fn has_collisions(&self) -> bool {
        self.rows
            .iter()
            .any(|&(_, v)| FlatType::from_value(v) == Some(FlatType::Collision))
    }

    /// Looks up a full uroot-relative path.
    pub fn lookup(&self, path: &str) -> Option<Lookup> {
        let hash = path_hash(path);
        let index = self.rows.binary_search_by_key(&hash, |&(h, _)| h).ok()?;
        let value = self.rows[index].1;

        match FlatType::from_value(value).expect("validated at parse/build time") {
            FlatType::Collision => Some(Lookup::Collision {
                offset: value & FlatType::VALUE_MASK,
            }),
            ty => Some(Lookup::Direct {
                ty,
                inode: value & FlatType::VALUE_MASK,
            }),
        }
    }
}

/// Resolves a colliding path through the resolver blob.
///
/// `offset` comes from [`Lookup::Collision`]. Returns the inode number of
/// the dirent whose name equals `path`, or `None` if the list does not
/// contain it.
#[must_use]
pub fn resolve_collision(resolver: &[u8], offset: u32, path: &str) -> Option<u32> {
    let mut src = resolver.get(offset as usize..)?;

    loop {
        let dirent = match Dirent::read(&mut src) {
            Ok(v) => v,
            Err(_) => return None,
        };

        if dirent.name() == path.as_bytes() {
            return Some(dirent.inode() as u32);
        }

        src = src.get(dirent.padding_size()..)?;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn node(path: &str, inode: u32, is_dir: bool) -> FlatNode {
        FlatNode {
            path: path.to_string(),
            inode,
            is_dir,
        }
    }

    #[test]
    fn hash_matches_reference_values() {
        assert_eq!(path_hash("/sce_sys/param.sfo"), 0x8BE5A360);
        assert_eq!(path_hash("/uroot"), 0x55080BE8);
        assert_eq!(path_hash(""), 0);
    }

    #[test]
    fn hash_is_case_insensitive() {
        assert_eq!(path_hash("/a/B"), path_hash("/a/b"));
        assert_eq!(
            path_hash("/sce_sys/param.sfo"),
            path_hash("/SCE_SYS/PARAM.SFO")
        );
    }

    #[test]
    fn type_tags() {
        let table = FlatPathTable::build(&[
            node("/sce_sys", 1, true),
            node("/sce_sys/param.sfo", 2, false),
            node("/data", 3, true),
            node("/eboot.bin", 4, false),
        ])
        .unwrap();

        let expect = [
            ("/sce_sys", FlatType::SceSysDir, 1),
            ("/sce_sys/param.sfo", FlatType::SceSysFile, 2),
            ("/data", FlatType::Dir, 3),
            ("/eboot.bin", FlatType::File, 4),
        ];

        for (path, ty, inode) in expect {
            assert_eq!(
                table.lookup(path),
                Some(Lookup::Direct { ty, inode }),
                "lookup of {path}"
            );
        }

        assert!(!table.has_collisions());
        assert!(table.resolver().is_empty());
        assert!(table.lookup("/missing").is_none());
    }

    #[test]
    fn write_parse_roundtrip_preserves_rows() {
        let built = FlatPathTable::build(&[
            node("/eboot.bin", 4, false),
            node("/data", 3, true),
            node("/data/level1.dat", 5, false),
        ])
        .unwrap();

        let parsed = FlatPathTable::parse(&built.write()).unwrap();
        assert_eq!(parsed.rows(), built.rows());

        // Rows come out sorted ascending by hash.
        assert!(parsed.rows().windows(2).all(|w| w[0].0 <= w[1].0));
    }

    #[test]
    fn colliding_paths_share_a_resolver_list() {
        // "/BA" and "/A`" collide: 'B' + 31*h == 'A' + 31*h + ('`' - 'A').
        assert_eq!(path_hash("/BA"), path_hash("/A`"));

        let table = FlatPathTable::build(&[
            node("/BA", 10, false),
            node("/A`", 11, false),
            node("/other", 12, false),
        ])
        .unwrap();

        assert!(table.has_collisions());

        let offset = match table.lookup("/BA").unwrap() {
            Lookup::Collision { offset } => offset,
            other => panic!("expected collision, got {other:?}"),
        };

        assert_eq!(resolve_collision(table.resolver(), offset, "/BA"), Some(10));
        assert_eq!(resolve_collision(table.resolver(), offset, "/A`"), Some(11));
        assert_eq!(resolve_collision(table.resolver(), offset, "/nope"), None);

        // The non-colliding path still resolves directly.
        assert_eq!(
            table.lookup("/other"),
            Some(Lookup::Direct {
                ty: FlatType::File,
                inode: 12
            })
        );
    }

    #[test]
    fn duplicate_paths_are_rejected() {
        let err = FlatPathTable::build(&[node("/a", 1, false), node("/a", 2, false)]).unwrap_err();
        assert!(matches!(err, BuildError::DuplicatePath { .. }));
    }

    #[test]
    fn oversized_inode_is_rejected() {
        let err = FlatPathTable::build(&[node("/a", 0x1000_0000, false)]).unwrap_err();
        assert!(matches!(err, BuildError::InodeOutOfRange { .. }));
    }

    #[test]
    fn parse_rejects_garbage() {
        assert!(matches!(
            FlatPathTable::parse(&[0u8; 7]),
            Err(ParseError::TruncatedRow)
        ));

        // Unknown type nibble.
        let mut bad = Vec::new();
        bad.extend_from_slice(&1u32.to_le_bytes());
        bad.extend_from_slice(&0xF000_0000u32.to_le_bytes());
        assert!(matches!(
            FlatPathTable::parse(&bad),
            Err(ParseError::UnknownType { row: 0 })
        ));

        // Descending hashes.
        let mut unsorted = Vec::new();
        for (h, v) in [(5u32, 1u32), (3u32, 2u32)] {
            unsorted.extend_from_slice(&h.to_le_bytes());
            unsorted.extend_from_slice(&v.to_le_bytes());
        }
        assert!(matches!(
            FlatPathTable::parse(&unsorted),
            Err(ParseError::UnsortedRows)
        ));
    }
}
