//! BPS-tree: a sparse, multi-level in-memory sampling over a sorted key
//! archive, approximating a B+ tree index, generalized over the
//! [`ArchiveGetter`] seam instead of a concrete compressor getter.

use crate::archive::ArchiveGetter;
use crate::elias_fano::EliasFano;
use crate::error::{ArchiveError, ArchiveResult};
use std::cmp::Ordering;

/// A sampled key at some ordinal, used to narrow a seek before falling back
/// to probing the archive directly.
#[derive(Clone, Debug)]
struct Node {
    ordinal: u64,
    #[allow(dead_code)]
    file_offset: u64,
    key_prefix: Vec<u8>,
}

/// Sparse multi-level sampling plus binary search over a key/value archive,
/// bounded by an [`EliasFano`] vector of record offsets.
///
/// `mx[0]` holds the key at ordinal 0; level `d` holds keys at ordinals
/// `i*M + {1, 1+M/2}` recursively descended from level `d-1`. Construction
/// reads every sampled key once via `initialize`; queries afterwards only
/// touch the archive for the final narrowing probe.
pub struct BpsTree<G: ArchiveGetter> {
    offt: EliasFano,
    kv: G,
    mx: Vec<Vec<Node>>,
    m: u64,
}

/// A live position into a [`BpsTree`], identifying an ordinal.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct BpsTreeIterator {
    ordinal: u64,
}

impl BpsTreeIterator {
    /// The ordinal this iterator currently points at.
    pub fn ordinal(&self) -> u64 {
        self.ordinal
    }

    /// Advances by one ordinal. Returns `false` (without advancing) once the
    /// last ordinal (`count - 1`) has been reached.
    pub fn next(&mut self, count: u64) -> bool {
        if self.ordinal + 1 == count {
            return false;
        }
        self.ordinal += 1;
        true
    }
}

impl<G: ArchiveGetter> BpsTree<G> {
    /// Builds an uninitialized tree over `offt` file offsets and a branching
    /// factor `m`. Call [`BpsTree::initialize`] before issuing seeks.
    pub fn new(kv: G, offt: EliasFano, m: u64) -> Self {
        Self {
            offt,
            kv,
            mx: Vec::new(),
            m: m.max(2),
        }
    }

    /// Number of entries in the underlying offset vector.
    pub fn count(&self) -> u64 {
        self.offt.count()
    }

    /// Computes the sparse sampling `mx[0..=d]`, `d = ceil(log_M(count))`.
    /// Every sampled key is read once via the tree's own cursor and copied
    /// into an owned buffer so later queries never re-read the archive for
    /// the sampled set.
    pub fn initialize(&mut self) -> ArchiveResult<()> {
        let count = self.offt.count();
        if count == 0 {
            self.mx = Vec::new();
            return Ok(());
        }
        let d = log_base(count, self.m);
        let mut mx: Vec<Vec<Node>> = vec![Vec::new(); (d + 1) as usize];

        let (key0, off0) = self.lookup_key(0)?;
        mx[0].push(Node {
            ordinal: 0,
            file_offset: off0,
            key_prefix: key0,
        });
        self.traverse(&mut mx, count, 0, 0)?;
        self.mx = mx;
        Ok(())
    }

    fn traverse(&mut self, mx: &mut [Vec<Node>], n: u64, di: u64, i: u64) -> ArchiveResult<()> {
        if i >= n {
            return Ok(());
        }
        let mut j = 1u64;
        let step = self.m / 2;
        while j <= self.m {
            let ik = i * self.m + j;
            if ik >= n {
                break;
            }
            let (key, off) = self.lookup_key(ik)?;
            mx[(di + 1) as usize].push(Node {
                ordinal: ik,
                file_offset: off,
                key_prefix: key,
            });
            self.traverse(mx, n, di + 1, ik)?;
            j += step;
        }
        Ok(())
    }

    /// Reads the key at ordinal `i` and the file offset it starts at, via
    /// this tree's own cursor.
    fn lookup_key(&mut self, i: u64) -> ArchiveResult<(Vec<u8>, u64)> {
        if i >= self.offt.count() {
            return Err(ArchiveError::OutOfBounds {
                ordinal: i,
                count: self.offt.count(),
            });
        }
        let off = self.offt.get(i)?;
        self.kv.reset(off);
        let mut buf = Vec::new();
        self.kv.next(&mut buf)?;
        Ok((buf, off))
    }

    /// Reads the `(key, value)` pair at ordinal `i` via this tree's cursor.
    fn lookup(&mut self, i: u64) -> ArchiveResult<(Vec<u8>, Vec<u8>)> {
        if i >= self.offt.count() {
            return Err(ArchiveError::OutOfBounds {
                ordinal: i,
                count: self.offt.count(),
            });
        }
        let off = self.offt.get(i)?;
        self.kv.reset(off);
        let mut key = Vec::new();
        self.kv.next(&mut key)?;
        let mut val = Vec::new();
        self.kv.next(&mut val)?;
        Ok((key, val))
    }

    /// Multi-level narrowing: descends `mx[0..d)`, binary-searching each
    /// level. Returns the last sampled node compared against, plus the
    /// tightest ordinal bounds `(dl, dr)` implied so far.
    fn bs(&self, key: &[u8]) -> (Node, u64, u64) {
        let mut dl = 0u64;
        let mut dr = self.offt.count();
        let mut n = self.mx[0][0].clone();
        for level in &self.mx {
            let mut l = 0usize;
            let mut r = level.len();
            while l < r {
                let m = (l + r) / 2;
                n = level[m].clone();
                match n.key_prefix.as_slice().cmp(key) {
                    Ordering::Equal => return (n, n.ordinal, n.ordinal),
                    Ordering::Greater => {
                        r = m;
                        dr = n.ordinal;
                    }
                    Ordering::Less => {
                        l = m + 1;
                        dl = n.ordinal;
                    }
                }
            }
        }
        (n, dl, dr)
    }

    /// Seeks to the smallest ordinal whose key is `>= key`, using this
    /// tree's own cursor. `key = None` seeks to ordinal 0 (or `None` if the
    /// tree is empty). Returns `None` if every key present is smaller than
    /// `key`.
    pub fn seek(&mut self, key: Option<&[u8]>) -> ArchiveResult<Option<BpsTreeIterator>> {
        let count = self.offt.count();
        let key = match key {
            None if count > 0 => return Ok(Some(BpsTreeIterator { ordinal: 0 })),
            None => return Ok(None),
            Some(k) => k,
        };
        if count == 0 {
            return Ok(None);
        }
        let (n, dl, dr) = self.bs(key);
        let offt = &self.offt;
        let kv = &mut self.kv;
        let ordinal = narrow_ordinal(count, key, n, dl, dr, |i| {
            let off = offt.get(i)?;
            kv.reset(off);
            let mut buf = Vec::new();
            kv.next(&mut buf)?;
            Ok(buf)
        })?;
        Ok(ordinal.map(|ordinal| BpsTreeIterator { ordinal }))
    }

    /// Reentrant variant of [`BpsTree::seek`]: the caller supplies its own
    /// cursor so that concurrent readers can share this tree's immutable
    /// sampling without serializing on its internal cursor. Produces
    /// identical ordinals to [`BpsTree::seek`] for identical inputs.
    pub fn seek_with_getter<H: ArchiveGetter>(
        &self,
        g: &mut H,
        key: Option<&[u8]>,
    ) -> ArchiveResult<Option<BpsTreeIterator>> {
        let count = self.offt.count();
        let key = match key {
            None if count > 0 => return Ok(Some(BpsTreeIterator { ordinal: 0 })),
            None => return Ok(None),
            Some(k) => k,
        };
        if count == 0 {
            return Ok(None);
        }
        let (n, dl, dr) = self.bs(key);
        let offt = &self.offt;
        let ordinal = narrow_ordinal(count, key, n, dl, dr, |i| {
            let off = offt.get(i)?;
            g.reset(off);
            let mut buf = Vec::new();
            g.next(&mut buf)?;
            Ok(buf)
        })?;
        Ok(ordinal.map(|ordinal| BpsTreeIterator { ordinal }))
    }

    /// Reads the `(key, value)` pair the iterator points at, via this
    /// tree's own cursor.
    pub fn kv(&mut self, it: &BpsTreeIterator) -> ArchiveResult<(Vec<u8>, Vec<u8>)> {
        self.lookup(it.ordinal)
    }

    /// Reads the `(key, value)` pair the iterator points at, via a
    /// caller-supplied cursor.
    pub fn kv_from_getter<H: ArchiveGetter>(
        &self,
        g: &mut H,
        it: &BpsTreeIterator,
    ) -> ArchiveResult<(Vec<u8>, Vec<u8>)> {
        if it.ordinal >= self.offt.count() {
            return Err(ArchiveError::OutOfBounds {
                ordinal: it.ordinal,
                count: self.offt.count(),
            });
        }
        let off = self.offt.get(it.ordinal)?;
        g.reset(off);
        let mut key = Vec::new();
        g.next(&mut key)?;
        let mut val = Vec::new();
        g.next(&mut val)?;
        Ok((key, val))
    }

    /// Recovers the full key stored at `ordinal`. Used by the committed
    /// domain to resolve a shortened-key reference back to a full plain key.
    pub fn ordinal_lookup(&mut self, ordinal: u64) -> ArchiveResult<Vec<u8>> {
        let (key, _) = self.lookup_key(ordinal)?;
        Ok(key)
    }

    /// Convenience accessor for tests: the key at `ordinal`.
    pub fn key_at(&mut self, ordinal: u64) -> ArchiveResult<Vec<u8>> {
        self.ordinal_lookup(ordinal)
    }
}

/// Narrows from a sampled node's bounds `(dl, dr)` down to the smallest
/// ordinal whose key is `>= key`, reading candidate keys via `read_key`.
/// `None` if every key in `[0, count)` is smaller than `key`. Shared by
/// [`BpsTree::seek`] and [`BpsTree::seek_with_getter`] so the two agree on
/// every input.
fn narrow_ordinal(
    count: u64,
    key: &[u8],
    n: Node,
    dl: u64,
    dr: u64,
    mut read_key: impl FnMut(u64) -> ArchiveResult<Vec<u8>>,
) -> ArchiveResult<Option<u64>> {
    if n.key_prefix.as_slice() == key {
        return Ok(Some(n.ordinal));
    }
    let mut l = 0u64;
    let mut r = count;
    if n.key_prefix.as_slice() > key {
        if dr < r {
            r = dr;
        }
    } else if dl > l {
        l = dl;
    }
    while l < r {
        let m = l + (r - l) / 2;
        let k = read_key(m)?;
        match k.as_slice().cmp(key) {
            Ordering::Equal => return Ok(Some(m)),
            Ordering::Greater => r = m,
            Ordering::Less => l = m + 1,
        }
    }
    if l >= count { Ok(None) } else { Ok(Some(l)) }
}

/// `ceil(log_m(n))`, the sampling depth for `n` entries with branching
/// factor `m`.
fn log_base(n: u64, m: u64) -> u64 {
    if n <= 1 {
        return 0;
    }
    let mut cap = 1u64;
    let mut d = 0u64;
    while cap < n {
        cap = cap.saturating_mul(m);
        d += 1;
    }
    d
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::archive::{ArchiveSource, InMemoryArchive, InMemoryGetter};
    use crate::elias_fano::build_from_sorted;

    fn build_tree(keys: &[&[u8]]) -> (BpsTree<InMemoryGetter>, InMemoryArchive) {
        let mut records = Vec::new();
        let mut offsets = Vec::new();
        for (i, k) in keys.iter().enumerate() {
            offsets.push((i * 2) as u64);
            records.push(k.to_vec());
            records.push(format!("v{i}").into_bytes());
        }
        let archive = InMemoryArchive::from_records(records);
        let ef = build_from_sorted(&offsets).unwrap();
        let mut tree = BpsTree::new(archive.getter(), ef, 4);
        tree.initialize().unwrap();
        (tree, archive)
    }

    const KEYS: [&[u8]; 8] = [b"a", b"c", b"e", b"g", b"i", b"k", b"m", b"o"];

    #[test]
    fn seek_exact_match() {
        let (mut tree, _a) = build_tree(&KEYS);
        let it = tree.seek(Some(b"e")).unwrap().unwrap();
        assert_eq!(it.ordinal(), 2);
    }

    #[test]
    fn seek_successor_when_absent() {
        let (mut tree, _a) = build_tree(&KEYS);
        // "f" is not present; smallest key >= "f" is "g" at ordinal 3.
        let it = tree.seek(Some(b"f")).unwrap().unwrap();
        assert_eq!(it.ordinal(), 3);
    }

    #[test]
    fn seek_past_end_returns_none() {
        let (mut tree, _a) = build_tree(&KEYS);
        assert!(tree.seek(Some(b"z")).unwrap().is_none());
    }

    #[test]
    fn seek_none_key_starts_at_zero() {
        let (mut tree, _a) = build_tree(&KEYS);
        let it = tree.seek(None).unwrap().unwrap();
        assert_eq!(it.ordinal(), 0);
    }

    #[test]
    fn seek_before_start_returns_zero() {
        let (mut tree, _a) = build_tree(&KEYS);
        let it = tree.seek(Some(b"0")).unwrap().unwrap();
        assert_eq!(it.ordinal(), 0);
    }

    #[test]
    fn seek_with_getter_matches_seek() {
        let (mut tree, archive) = build_tree(&KEYS);
        for probe in [b"a".as_slice(), b"f", b"m", b"z", b"0"] {
            let want = tree.seek(Some(probe)).unwrap();
            let mut fresh = archive.getter();
            let got = tree.seek_with_getter(&mut fresh, Some(probe)).unwrap();
            assert_eq!(want, got, "probe {:?}", probe);
        }
    }

    #[test]
    fn iterator_advances_and_reads_kv() {
        let (mut tree, _a) = build_tree(&KEYS);
        let mut it = tree.seek(Some(b"a")).unwrap().unwrap();
        let (k, v) = tree.kv(&it).unwrap();
        assert_eq!(k, b"a");
        assert_eq!(v, b"v0");
        assert!(it.next(tree.count()));
        let (k, _v) = tree.kv(&it).unwrap();
        assert_eq!(k, b"c");
    }

    #[test]
    fn iterator_reports_end() {
        let (mut tree, _a) = build_tree(&KEYS);
        let mut it = tree.seek(Some(b"o")).unwrap().unwrap();
        assert_eq!(it.ordinal(), 7);
        assert!(!it.next(tree.count()));
    }

    #[test]
    fn ordinal_lookup_recovers_key() {
        let (mut tree, _a) = build_tree(&KEYS);
        for (i, k) in KEYS.iter().enumerate() {
            let recovered = tree.ordinal_lookup(i as u64).unwrap();
            assert_eq!(&recovered, k);
            let it = tree.seek(Some(&recovered)).unwrap().unwrap();
            assert_eq!(it.ordinal(), i as u64);
        }
    }

    #[test]
    fn empty_tree_seek_returns_none() {
        let archive = InMemoryArchive::from_records(vec![]);
        let ef = build_from_sorted(&[]).unwrap();
        let mut tree: BpsTree<InMemoryGetter> = BpsTree::new(archive.getter(), ef, 4);
        tree.initialize().unwrap();
        assert!(tree.seek(None).unwrap().is_none());
        assert!(tree.seek(Some(b"a")).unwrap().is_none());
    }
}
