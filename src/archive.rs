//! Archive cursor abstraction and an in-memory reference implementation.
//!
//! An archive is a flat sequence of alternating key, value records. The
//! [`ArchiveGetter`] trait is the seam a host wires to its real compressed
//! file reader; [`InMemoryArchive`] is a reference backing used by the
//! BPS-tree and committed-domain tests in this crate.

use crate::error::{ArchiveError, ArchiveResult};

/// A stateful, single-threaded reader over one archive file.
///
/// Cursors are not `Send`/shareable: callers that need concurrent readers
/// construct one cursor per thread via [`ArchiveSource::getter`].
pub trait ArchiveGetter {
    /// Repositions the cursor to read the record starting at `offset`.
    fn reset(&mut self, offset: u64);

    /// Whether a subsequent `next` call would yield a record.
    fn has_next(&self) -> bool;

    /// Reads the record at the current position, returning its bytes and
    /// the offset of the record immediately following it.
    fn next(&mut self, buf: &mut Vec<u8>) -> ArchiveResult<(usize, u64)>;

    /// Whether the record at the current position starts with `prefix`,
    /// without fully materializing it.
    fn match_prefix(&mut self, prefix: &[u8]) -> ArchiveResult<bool>;

    /// Advances past the current record without returning its bytes.
    fn skip(&mut self) -> ArchiveResult<u64>;
}

/// An owner of archive data that can mint independent cursors over it, so
/// that concurrent readers need not serialize on a single cursor.
pub trait ArchiveSource {
    /// Concrete cursor type this source produces.
    type Getter: ArchiveGetter;

    /// Creates a fresh cursor positioned at offset 0.
    fn getter(&self) -> Self::Getter;
}

/// A simple archive held entirely in memory: a flat byte buffer plus a list
/// of record boundaries. Used as the reference backing for tests and for
/// hosts that have already decompressed a file into memory.
#[derive(Clone, Debug, Default)]
pub struct InMemoryArchive {
    records: Vec<Vec<u8>>,
    offsets: Vec<u64>,
}

impl InMemoryArchive {
    /// Builds an archive from an ordered list of records. Record `i` starts
    /// at offset `i` (offsets here are record indices, not byte positions -
    /// sufficient for an in-memory reference where "seek to offset" means
    /// "seek to record").
    pub fn from_records(records: Vec<Vec<u8>>) -> Self {
        let offsets = (0..records.len() as u64).collect();
        Self { records, offsets }
    }

    /// Number of records in the archive.
    pub fn len(&self) -> usize {
        self.records.len()
    }

    /// Whether the archive holds no records.
    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    /// The byte offsets of every record, suitable for building an
    /// Elias-Fano vector of record starts.
    pub fn offsets(&self) -> &[u64] {
        &self.offsets
    }

    /// Borrows the record at `ordinal`, if any.
    pub fn record(&self, ordinal: u64) -> Option<&[u8]> {
        self.records.get(ordinal as usize).map(|v| v.as_slice())
    }
}

impl ArchiveSource for InMemoryArchive {
    type Getter = InMemoryGetter;

    fn getter(&self) -> InMemoryGetter {
        InMemoryGetter {
            records: self.records.clone(),
            pos: 0,
        }
    }
}

/// Cursor over an [`InMemoryArchive`]. Cheap to construct (clones the
/// archive's records once), independent of any other cursor over the same
/// archive.
#[derive(Clone, Debug)]
pub struct InMemoryGetter {
    records: Vec<Vec<u8>>,
    pos: u64,
}

impl ArchiveGetter for InMemoryGetter {
    fn reset(&mut self, offset: u64) {
        self.pos = offset;
    }

    fn has_next(&self) -> bool {
        (self.pos as usize) < self.records.len()
    }

    fn next(&mut self, buf: &mut Vec<u8>) -> ArchiveResult<(usize, u64)> {
        let idx = self.pos as usize;
        let record = self.records.get(idx).ok_or(ArchiveError::OutOfBounds {
            ordinal: self.pos,
            count: self.records.len() as u64,
        })?;
        buf.clear();
        buf.extend_from_slice(record);
        self.pos += 1;
        Ok((record.len(), self.pos))
    }

    fn match_prefix(&mut self, prefix: &[u8]) -> ArchiveResult<bool> {
        let idx = self.pos as usize;
        let record = self.records.get(idx).ok_or(ArchiveError::OutOfBounds {
            ordinal: self.pos,
            count: self.records.len() as u64,
        })?;
        Ok(record.starts_with(prefix))
    }

    fn skip(&mut self) -> ArchiveResult<u64> {
        if (self.pos as usize) >= self.records.len() {
            return Err(ArchiveError::OutOfBounds {
                ordinal: self.pos,
                count: self.records.len() as u64,
            });
        }
        self.pos += 1;
        Ok(self.pos)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> InMemoryArchive {
        InMemoryArchive::from_records(vec![
            b"key1".to_vec(),
            b"val1".to_vec(),
            b"key2".to_vec(),
            b"val2".to_vec(),
        ])
    }

    #[test]
    fn reads_records_in_order() {
        let archive = sample();
        let mut getter = archive.getter();
        let mut buf = Vec::new();

        assert!(getter.has_next());
        let (n, next_offset) = getter.next(&mut buf).unwrap();
        assert_eq!(&buf[..n], b"key1");
        assert_eq!(next_offset, 1);

        let (_, _) = getter.next(&mut buf).unwrap();
        assert_eq!(buf, b"val1");
    }

    #[test]
    fn reset_repositions_cursor() {
        let archive = sample();
        let mut getter = archive.getter();
        getter.reset(2);
        let mut buf = Vec::new();
        let (_, _) = getter.next(&mut buf).unwrap();
        assert_eq!(buf, b"key2");
    }

    #[test]
    fn match_prefix_does_not_advance() {
        let archive = sample();
        let mut getter = archive.getter();
        getter.reset(2);
        assert!(getter.match_prefix(b"key").unwrap());
        assert!(!getter.match_prefix(b"val").unwrap());
        let mut buf = Vec::new();
        let (_, next_offset) = getter.next(&mut buf).unwrap();
        assert_eq!(buf, b"key2");
        assert_eq!(next_offset, 3);
    }

    #[test]
    fn skip_advances_without_materializing() {
        let archive = sample();
        let mut getter = archive.getter();
        let next_offset = getter.skip().unwrap();
        assert_eq!(next_offset, 1);
        let mut buf = Vec::new();
        let (_, _) = getter.next(&mut buf).unwrap();
        assert_eq!(buf, b"val1");
    }

    #[test]
    fn exhausted_cursor_reports_has_next_false() {
        let archive = sample();
        let mut getter = archive.getter();
        let mut buf = Vec::new();
        for _ in 0..4 {
            getter.next(&mut buf).unwrap();
        }
        assert!(!getter.has_next());
        assert!(getter.next(&mut buf).is_err());
    }

    #[test]
    fn independent_cursors_do_not_interfere() {
        let archive = sample();
        let mut a = archive.getter();
        let mut b = archive.getter();
        let mut buf_a = Vec::new();
        let mut buf_b = Vec::new();
        a.reset(0);
        b.reset(2);
        a.next(&mut buf_a).unwrap();
        b.next(&mut buf_b).unwrap();
        assert_eq!(buf_a, b"key1");
        assert_eq!(buf_b, b"key2");
    }
}
