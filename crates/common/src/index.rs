//! Directory index codec
//!
//! Every cached directory carries an index file describing its children, so
//! that names, sizes and mtimes can be served before any body is fetched.
//!
//! # Format
//!
//! ```text
//! LazyFS\n
//! <kind> <size> <mtime> <name>\0
//! <kind> <size> <mtime> <name>\0
//! ...
//! ```
//!
//! `kind` is `f` (file) or `d` (directory). An index with no entries is a
//! fully known, empty directory. A directory whose contents must never be
//! cached replaces the entry list with the literal `Dynamic`:
//!
//! ```text
//! LazyFS\n
//! Dynamic\n
//! ```
//!
//! The single-line form `LazyFS Dynamic\n` is accepted on decode as well.

use std::collections::HashSet;

use thiserror::Error;

/// First line of every index file
pub const MARKER: &str = "LazyFS";

/// Literal that marks a directory as never cached
pub const DYNAMIC: &str = "Dynamic";

/// Name of the index file inside each cached directory. Names starting with
/// it are reserved for the index and its staging copies.
pub const INDEX_FILE: &str = "...";

const NUL: u8 = 0;

/// Kind of a child declared by an index
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum EntryKind {
    File,
    Directory,
}

impl EntryKind {
    /// Stable on-disk tag
    pub fn tag(self) -> char {
        match self {
            EntryKind::File => 'f',
            EntryKind::Directory => 'd',
        }
    }

    pub fn from_tag(tag: &str) -> Option<Self> {
        match tag {
            "f" => Some(EntryKind::File),
            "d" => Some(EntryKind::Directory),
            _ => None,
        }
    }
}

/// One child of an indexed directory.
///
/// `size` and `mtime` are hints used for stat until the body is fetched.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IndexEntry {
    pub kind: EntryKind,
    pub size: u64,
    /// Modification time (Unix timestamp)
    pub mtime: i64,
    pub name: String,
}

impl IndexEntry {
    pub fn file(name: impl Into<String>, size: u64, mtime: i64) -> Self {
        Self {
            kind: EntryKind::File,
            size,
            mtime,
            name: name.into(),
        }
    }

    pub fn dir(name: impl Into<String>, mtime: i64) -> Self {
        Self {
            kind: EntryKind::Directory,
            size: 0,
            mtime,
            name: name.into(),
        }
    }
}

/// Decoded contents of a directory index
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DirIndex {
    /// Never cached; every lookup asks the helper again
    Dynamic,
    /// Fully known listing, in on-disk order
    Listing(Vec<IndexEntry>),
}

/// Reasons an index can fail to decode
#[derive(Debug, Error, PartialEq, Eq)]
pub enum IndexError {
    #[error("missing 'LazyFS' marker line")]
    MissingMarker,
    #[error("last entry is not NUL-terminated")]
    Unterminated,
    #[error("malformed entry '{0}'")]
    MalformedEntry(String),
    #[error("unknown entry kind '{0}'")]
    UnknownKind(String),
    #[error("invalid entry name '{0}'")]
    InvalidName(String),
    #[error("duplicate entry name '{0}'")]
    DuplicateName(String),
    #[error("index is not valid UTF-8")]
    NotUtf8,
}

impl DirIndex {
    /// A fully known, empty directory
    pub fn empty() -> Self {
        DirIndex::Listing(Vec::new())
    }

    /// Build a listing, checking that names are valid and unique
    pub fn from_entries(entries: Vec<IndexEntry>) -> Result<Self, IndexError> {
        let mut seen = HashSet::with_capacity(entries.len());
        for entry in &entries {
            validate_name(&entry.name)?;
            if !seen.insert(entry.name.as_str()) {
                return Err(IndexError::DuplicateName(entry.name.clone()));
            }
        }
        Ok(DirIndex::Listing(entries))
    }

    pub fn is_dynamic(&self) -> bool {
        matches!(self, DirIndex::Dynamic)
    }

    /// Entries of a listing; a dynamic index has none
    pub fn entries(&self) -> &[IndexEntry] {
        match self {
            DirIndex::Dynamic => &[],
            DirIndex::Listing(entries) => entries,
        }
    }

    pub fn find(&self, name: &str) -> Option<&IndexEntry> {
        self.entries().iter().find(|e| e.name == name)
    }

    pub fn encode(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(MARKER.len() + 1 + self.entries().len() * 16);
        out.extend_from_slice(MARKER.as_bytes());
        out.push(b'\n');
        match self {
            DirIndex::Dynamic => {
                out.extend_from_slice(DYNAMIC.as_bytes());
                out.push(b'\n');
            }
            DirIndex::Listing(entries) => {
                for entry in entries {
                    let line = format!(
                        "{} {} {} {}",
                        entry.kind.tag(),
                        entry.size,
                        entry.mtime,
                        entry.name
                    );
                    out.extend_from_slice(line.as_bytes());
                    out.push(NUL);
                }
            }
        }
        out
    }

    pub fn decode(bytes: &[u8]) -> Result<Self, IndexError> {
        let newline = bytes
            .iter()
            .position(|&b| b == b'\n')
            .ok_or(IndexError::MissingMarker)?;
        let header = &bytes[..newline];
        let body = &bytes[newline + 1..];

        if header == format!("{} {}", MARKER, DYNAMIC).as_bytes() {
            return Ok(DirIndex::Dynamic);
        }
        if header != MARKER.as_bytes() {
            return Err(IndexError::MissingMarker);
        }
        if body == DYNAMIC.as_bytes() || body == format!("{}\n", DYNAMIC).as_bytes() {
            return Ok(DirIndex::Dynamic);
        }
        if body.is_empty() {
            return Ok(DirIndex::empty());
        }
        if body.last() != Some(&NUL) {
            return Err(IndexError::Unterminated);
        }

        let entries = body[..body.len() - 1]
            .split(|&b| b == NUL)
            .map(decode_entry)
            .collect::<Result<Vec<_>, _>>()?;
        Self::from_entries(entries)
    }
}

fn decode_entry(raw: &[u8]) -> Result<IndexEntry, IndexError> {
    let line = std::str::from_utf8(raw).map_err(|_| IndexError::NotUtf8)?;
    let mut fields = line.splitn(4, ' ');
    let (Some(kind), Some(size), Some(mtime), Some(name)) =
        (fields.next(), fields.next(), fields.next(), fields.next())
    else {
        return Err(IndexError::MalformedEntry(line.to_string()));
    };

    let kind = EntryKind::from_tag(kind).ok_or_else(|| IndexError::UnknownKind(kind.to_string()))?;
    let size = size
        .parse()
        .map_err(|_| IndexError::MalformedEntry(line.to_string()))?;
    let mtime = mtime
        .parse()
        .map_err(|_| IndexError::MalformedEntry(line.to_string()))?;

    Ok(IndexEntry {
        kind,
        size,
        mtime,
        name: name.to_string(),
    })
}

/// True if `name` can be carried as an entry name
pub fn is_valid_name(name: &str) -> bool {
    validate_name(name).is_ok()
}

fn validate_name(name: &str) -> Result<(), IndexError> {
    if name.is_empty()
        || name == "."
        || name == ".."
        || name.starts_with(INDEX_FILE)
        || name.contains('/')
        || name.contains('\0')
    {
        return Err(IndexError::InvalidName(name.to_string()));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_decode_listing() {
        let index = DirIndex::decode(b"LazyFS\nd 1 1 rox\0f 5 3 hello\0").unwrap();
        assert_eq!(
            index,
            DirIndex::Listing(vec![
                IndexEntry::dir("rox", 1).with_size(1),
                IndexEntry::file("hello", 5, 3),
            ])
        );
        assert_eq!(index.find("hello").unwrap().size, 5);
        assert!(index.find("missing").is_none());
    }

    #[test]
    fn test_decode_empty_listing() {
        let index = DirIndex::decode(b"LazyFS\n").unwrap();
        assert_eq!(index, DirIndex::empty());
        assert!(!index.is_dynamic());
    }

    #[test]
    fn test_decode_dynamic_forms() {
        assert!(DirIndex::decode(b"LazyFS\nDynamic\n").unwrap().is_dynamic());
        assert!(DirIndex::decode(b"LazyFS\nDynamic").unwrap().is_dynamic());
        assert!(DirIndex::decode(b"LazyFS Dynamic\n").unwrap().is_dynamic());
    }

    #[test]
    fn test_name_with_spaces() {
        let index = DirIndex::decode(b"LazyFS\nf 10 7 read me.txt\0").unwrap();
        assert_eq!(index.entries()[0].name, "read me.txt");
    }

    #[test]
    fn test_encode_matches_helper_bytes() {
        let index = DirIndex::from_entries(vec![IndexEntry::file("hello", 6, 3)]).unwrap();
        assert_eq!(index.encode(), b"LazyFS\nf 6 3 hello\0".to_vec());
        assert_eq!(DirIndex::Dynamic.encode(), b"LazyFS\nDynamic\n".to_vec());
        assert_eq!(DirIndex::empty().encode(), b"LazyFS\n".to_vec());
    }

    #[test]
    fn test_decode_errors() {
        assert_eq!(
            DirIndex::decode(b"NotLazy\nf 1 1 a\0"),
            Err(IndexError::MissingMarker)
        );
        assert_eq!(DirIndex::decode(b"LazyFS"), Err(IndexError::MissingMarker));
        assert_eq!(
            DirIndex::decode(b"LazyFS\nf 1 1 a"),
            Err(IndexError::Unterminated)
        );
        assert_eq!(
            DirIndex::decode(b"LazyFS\nl 1 1 link\0"),
            Err(IndexError::UnknownKind("l".into()))
        );
        assert_eq!(
            DirIndex::decode(b"LazyFS\nf x 1 a\0"),
            Err(IndexError::MalformedEntry("f x 1 a".into()))
        );
        assert_eq!(
            DirIndex::decode(b"LazyFS\nf 1 1\0"),
            Err(IndexError::MalformedEntry("f 1 1".into()))
        );
        assert_eq!(
            DirIndex::decode(b"LazyFS\nf 1 1 a\0d 1 1 a\0"),
            Err(IndexError::DuplicateName("a".into()))
        );
        assert_eq!(
            DirIndex::decode(b"LazyFS\nd 1 1 ..\0"),
            Err(IndexError::InvalidName("..".into()))
        );
        assert_eq!(
            DirIndex::decode(b"LazyFS\nf 1 1 ....tmp\0"),
            Err(IndexError::InvalidName("....tmp".into()))
        );
    }

    #[test]
    fn test_from_entries_rejects_slash() {
        let err = DirIndex::from_entries(vec![IndexEntry::file("a/b", 1, 1)]).unwrap_err();
        assert_eq!(err, IndexError::InvalidName("a/b".into()));
    }

    impl IndexEntry {
        fn with_size(mut self, size: u64) -> Self {
            self.size = size;
            self
        }
    }
}
