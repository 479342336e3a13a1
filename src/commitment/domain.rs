//! Committed Domain: snapshot persistence, recovery, and multi-file merge
//! for the commitment subsystem. `seek_commitment` propagates a decode
//! failure on a present-but-malformed snapshot rather than swallowing it,
//! and the shortened-key decoder reads the ordinal from `buf[2..]` (after
//! the 2-byte step prefix).

use super::adapter::PatriciaAdapter;
use super::branch_data::BranchData;
use crate::archive::ArchiveGetter;
use crate::bps_tree::BpsTree;
use crate::config::CommitmentMode;
use crate::elias_fano::EliasFano;
use crate::error::{ArchiveError, ArchiveResult};
use crate::update_tree::UpdateTree;
use std::cmp::Ordering;
use std::collections::BTreeMap;
use std::collections::BinaryHeap;
use std::sync::atomic::{AtomicBool, Ordering as AtomicOrdering};
use std::sync::Arc;

/// Reserved key under which commitment-state snapshots are stored,
/// suffixed with a 2-byte big-endian step when written.
pub const STATE_KEY: &[u8] = b"state";

/// A half-open range of transaction numbers a file covers, plus a
/// human-readable label. Modeled without touching the filesystem; a host
/// adapter owns actual path construction.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct FileRange {
    /// First `tx_num` (inclusive) this file covers.
    pub start_tx_num: u64,
    /// Last `tx_num` (inclusive) this file covers.
    pub end_tx_num: u64,
    /// A host-assigned label (e.g. a file stem); not interpreted here.
    pub label: String,
}

impl FileRange {
    /// Whether `tx_num` falls within `[start_tx_num, end_tx_num]`.
    pub fn contains(&self, tx_num: u64) -> bool {
        tx_num >= self.start_tx_num && tx_num <= self.end_tx_num
    }
}

/// A thin `Arc<AtomicBool>` wrapper so a long-running merge can be asked
/// to stop from another thread without panicking or poisoning state.
#[derive(Clone, Debug, Default)]
pub struct CancellationToken(Arc<AtomicBool>);

impl CancellationToken {
    /// Builds a token in the not-cancelled state.
    pub fn new() -> Self {
        Self(Arc::new(AtomicBool::new(false)))
    }

    /// Requests cancellation; observed by subsequent `is_cancelled` calls.
    pub fn cancel(&self) {
        self.0.store(true, AtomicOrdering::SeqCst);
    }

    /// Whether cancellation has been requested.
    pub fn is_cancelled(&self) -> bool {
        self.0.load(AtomicOrdering::SeqCst)
    }
}

/// A snapshot of commitment progress, persisted under [`STATE_KEY`] at
/// aggregation-step boundaries for crash recovery.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct CommitmentState {
    /// The transaction number this snapshot was taken at.
    pub tx_num: u64,
    /// The block number this snapshot was taken at.
    pub block_num: u64,
    /// Opaque trie-state bytes from `PatriciaAdapter::encode_current_state`.
    pub trie_state: Vec<u8>,
}

impl CommitmentState {
    /// Encodes as `8B txNum || 8B blockNum || 2B trieStateLen || trieState`,
    /// all big-endian.
    pub fn encode(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(18 + self.trie_state.len());
        out.extend_from_slice(&self.tx_num.to_be_bytes());
        out.extend_from_slice(&self.block_num.to_be_bytes());
        out.extend_from_slice(&(self.trie_state.len() as u16).to_be_bytes());
        out.extend_from_slice(&self.trie_state);
        out
    }

    /// Decodes a previously-encoded snapshot. A buffer shorter than 10
    /// bytes means "absent" (`Ok(None)`); one of at least 10 but fewer than
    /// 18 bytes, or with an inconsistent length prefix, is a malformed
    /// snapshot (`Err`).
    pub fn decode(buf: &[u8]) -> ArchiveResult<Option<Self>> {
        if buf.len() < 10 {
            return Ok(None);
        }
        if buf.len() < 18 {
            return Err(ArchiveError::InvalidEncoding(
                "commitment state shorter than the 18-byte fixed header".into(),
            ));
        }
        let tx_num = u64::from_be_bytes(buf[0..8].try_into().unwrap());
        let block_num = u64::from_be_bytes(buf[8..16].try_into().unwrap());
        let trie_state_len = u16::from_be_bytes(buf[16..18].try_into().unwrap()) as usize;
        if buf.len() != 18 + trie_state_len {
            return Err(ArchiveError::InvalidEncoding(format!(
                "commitment state declares trieStateLen {trie_state_len} but buffer has {} remaining bytes",
                buf.len() - 18
            )));
        }
        Ok(Some(CommitmentState {
            tx_num,
            block_num,
            trie_state: buf[18..].to_vec(),
        }))
    }
}

/// Encodes a shortened key reference: a 2-byte big-endian file step
/// followed by the minimum-width big-endian encoding of `ordinal`.
pub fn encode_shortened_key(step: u16, ordinal: u64) -> Vec<u8> {
    let mut out = step.to_be_bytes().to_vec();
    let bytes = ordinal.to_be_bytes();
    let start = bytes.iter().position(|&b| b != 0).unwrap_or(7);
    out.extend_from_slice(&bytes[start..]);
    out
}

/// Decodes a shortened key reference. The ordinal is read from everything
/// after the first two bytes (`buf[2..]`).
pub fn decode_shortened_key(buf: &[u8]) -> ArchiveResult<(u16, u64)> {
    if buf.len() < 3 {
        return Err(ArchiveError::InvalidEncoding(
            "shortened key shorter than the 2-byte step plus one ordinal byte".into(),
        ));
    }
    let step = u16::from_be_bytes([buf[0], buf[1]]);
    let ordinal_bytes = &buf[2..];
    if ordinal_bytes.len() > 8 {
        return Err(ArchiveError::InvalidEncoding(
            "shortened key ordinal wider than 8 bytes".into(),
        ));
    }
    let mut padded = [0u8; 8];
    padded[8 - ordinal_bytes.len()..].copy_from_slice(ordinal_bytes);
    Ok((step, u64::from_be_bytes(padded)))
}

/// Account plain keys are a bare 20-byte address; anything longer is a
/// shortened reference.
const FULL_ACCOUNT_KEY_LEN: usize = 20;
/// Storage plain keys are address || slot, 52 bytes; anything shorter is a
/// shortened reference.
const FULL_STORAGE_KEY_LEN: usize = 52;

/// One generation of files a [`FileRange`] and its BPS-tree cover, for one
/// of the two plain-key shapes (account or storage).
pub struct FileSet<G: ArchiveGetter> {
    /// `(range, bps_tree)` pairs, ordered oldest first. Not required to be
    /// contiguous - `commitment_val_transform` searches for whichever file
    /// covers a given step.
    pub files: Vec<(FileRange, BpsTree<G>)>,
}

impl<G: ArchiveGetter> FileSet<G> {
    /// Resolves a shortened-key reference to its full plain key: locates
    /// the file whose range contains `step * aggregation_step`, then
    /// recovers the key at `ordinal` via that file's BPS-tree.
    pub fn resolve_shortened(&mut self, shortened: &[u8], aggregation_step: u64) -> ArchiveResult<Vec<u8>> {
        let (step, ordinal) = decode_shortened_key(shortened)?;
        let target_tx_num = step as u64 * aggregation_step;
        let found = self
            .files
            .iter_mut()
            .find(|(range, _)| range.contains(target_tx_num));
        match found {
            Some((_, tree)) => tree.ordinal_lookup(ordinal),
            None => Err(ArchiveError::KeyNotFound(format!(
                "no file covers tx_num {target_tx_num} for shortened-key step {step}"
            ))),
        }
    }
}

/// Rewrites a full plain key into a shortened reference against the
/// just-merged file: `seek(full_key)` locates its ordinal there, and the
/// reference's step is `merged_range.end_tx_num / aggregation_step`. Falls
/// back to the original full key (and logs a warning) if the key is not
/// found in the merged file - this should not happen for a well-formed
/// merge, but callers are expected to tolerate a missing key rather than
/// treat it as fatal.
fn replace_key_with_reference<G: ArchiveGetter>(
    merged_tree: &mut BpsTree<G>,
    merged_range: &FileRange,
    aggregation_step: u64,
    full_key: &[u8],
) -> ArchiveResult<Vec<u8>> {
    match merged_tree.seek(Some(full_key))? {
        Some(it) => {
            let (found_key, _) = merged_tree.kv(&it)?;
            if found_key == full_key {
                let step = (merged_range.end_tx_num / aggregation_step) as u16;
                Ok(encode_shortened_key(step, it.ordinal()))
            } else {
                tracing::warn!(
                    "shortened-key rewrite: full key not present in merged file, keeping full key"
                );
                Ok(full_key.to_vec())
            }
        }
        None => {
            tracing::warn!(
                "shortened-key rewrite: seek past end of merged file, keeping full key"
            );
            Ok(full_key.to_vec())
        }
    }
}

/// Everything `commitment_val_transform` needs: the old (pre-merge) file
/// sets to resolve shortened keys against, and the just-built merged files
/// to rewrite full keys against.
pub struct TransformContext<G: ArchiveGetter> {
    /// Pre-merge account files, used to resolve shortened account-key
    /// references in the incoming branch-data blob.
    pub old_accounts: FileSet<G>,
    /// Pre-merge storage files, same role for storage keys.
    pub old_storages: FileSet<G>,
    /// The freshly-merged account file's BPS-tree and range.
    pub merged_accounts: (FileRange, BpsTree<G>),
    /// The freshly-merged storage file's BPS-tree and range.
    pub merged_storages: (FileRange, BpsTree<G>),
}

/// Rewrites a branch-data blob's plain keys from the pre-merge file
/// generation to the post-merge one.
///
/// 1. Extract the account/storage plain-key lists from `value_blob`.
/// 2. Resolve any shortened account key against `ctx.old_accounts`, leaving
///    full (20-byte) keys untouched.
/// 3. Rewrite every resulting full key into a shortened reference against
///    `ctx.merged_accounts`.
/// 4. Repeat steps 2-3 for storage keys (full length 52) against
///    `ctx.old_storages`/`ctx.merged_storages`.
/// 5. Substitute the rewritten lists back via `BranchData::replace_plain_keys`.
pub fn commitment_val_transform<G: ArchiveGetter>(
    ctx: &mut TransformContext<G>,
    aggregation_step: u64,
    value_blob: &[u8],
) -> ArchiveResult<Vec<u8>> {
    let branch_data = BranchData::from_bytes(value_blob.to_vec());
    let (account_pks, storage_pks) = branch_data.extract_plain_keys()?;

    let mut new_account_pks = Vec::with_capacity(account_pks.len());
    for pk in &account_pks {
        let full = if pk.len() == FULL_ACCOUNT_KEY_LEN {
            pk.clone()
        } else {
            ctx.old_accounts.resolve_shortened(pk, aggregation_step)?
        };
        let (range, tree) = &mut ctx.merged_accounts;
        new_account_pks.push(replace_key_with_reference(tree, range, aggregation_step, &full)?);
    }

    let mut new_storage_pks = Vec::with_capacity(storage_pks.len());
    for pk in &storage_pks {
        let full = if pk.len() == FULL_STORAGE_KEY_LEN {
            pk.clone()
        } else {
            ctx.old_storages.resolve_shortened(pk, aggregation_step)?
        };
        let (range, tree) = &mut ctx.merged_storages;
        new_storage_pks.push(replace_key_with_reference(tree, range, aggregation_step, &full)?);
    }

    let rewritten = branch_data.replace_plain_keys(&new_account_pks, &new_storage_pks)?;
    Ok(rewritten.as_bytes().to_vec())
}

/// Persistence contract for the reserved `"state"` key: one value per
/// aggregation-step, keyed by the 2-byte big-endian step suffix.
pub trait CommitmentStateStore {
    /// Fetches the raw snapshot bytes stored at `step`, if any.
    fn get(&self, step: u16) -> ArchiveResult<Option<Vec<u8>>>;
    /// Stores (overwriting) the raw snapshot bytes at `step`.
    fn put(&mut self, step: u16, bytes: Vec<u8>) -> ArchiveResult<()>;
}

/// Reference [`CommitmentStateStore`] backed by an in-memory map, used by
/// tests and by hosts that have not yet wired a real key-value store.
#[derive(Default)]
pub struct InMemoryCommitmentStateStore {
    snapshots: BTreeMap<u16, Vec<u8>>,
}

impl CommitmentStateStore for InMemoryCommitmentStateStore {
    fn get(&self, step: u16) -> ArchiveResult<Option<Vec<u8>>> {
        Ok(self.snapshots.get(&step).cloned())
    }

    fn put(&mut self, step: u16, bytes: Vec<u8>) -> ArchiveResult<()> {
        self.snapshots.insert(step, bytes);
        Ok(())
    }
}

/// Drives touch buffering, commitment computation, and snapshot
/// persistence/recovery for one commitment-tracked domain.
pub struct CommittedDomain {
    mode: CommitmentMode,
    aggregation_step: u64,
    update_tree: UpdateTree,
    adapter: Box<dyn PatriciaAdapter>,
    state_store: Box<dyn CommitmentStateStore>,
    /// First tx_num not yet covered by a recovered or stored snapshot.
    tx_pointer: u64,
}

impl CommittedDomain {
    /// Builds a domain over `adapter`/`state_store`, governed by `mode`
    /// with the given `aggregation_step` (tx_num units per file
    /// generation).
    pub fn new(
        mode: CommitmentMode,
        aggregation_step: u64,
        adapter: Box<dyn PatriciaAdapter>,
        state_store: Box<dyn CommitmentStateStore>,
    ) -> Self {
        Self {
            mode,
            aggregation_step,
            update_tree: UpdateTree::new(mode),
            adapter,
            state_store,
            tx_pointer: 0,
        }
    }

    /// Borrows the update tree so a host can route touches into it.
    pub fn update_tree_mut(&mut self) -> &mut UpdateTree {
        &mut self.update_tree
    }

    /// First tx_num not yet covered by a recovered or stored commitment
    /// snapshot.
    pub fn tx_pointer(&self) -> u64 {
        self.tx_pointer
    }

    /// The adapter's current root hash, without draining the update tree
    /// or computing branch updates.
    pub fn current_root_hash(&mut self) -> [u8; 32] {
        self.adapter.root_hash()
    }

    /// Computes a commitment over everything touched since the last drain.
    /// Returns `(root_hash, branch_updates)`, both `None` when commitment
    /// is disabled.
    pub fn compute_commitment(
        &mut self,
        trace: bool,
    ) -> ArchiveResult<(Option<[u8; 32]>, Option<BTreeMap<Vec<u8>, BranchData>>)> {
        if self.mode == CommitmentMode::Disabled {
            return Ok((None, None));
        }

        let (plain_keys, hashed_keys, updates) = self.update_tree.list();
        if plain_keys.is_empty() {
            return Ok((Some(self.adapter.root_hash()), None));
        }

        self.adapter.reset();
        self.adapter.set_trace(trace);

        let (root, branch_updates) = match self.mode {
            CommitmentMode::Direct => self.adapter.review_keys(&plain_keys, &hashed_keys)?,
            CommitmentMode::Update => {
                self.adapter.process_updates(&plain_keys, &hashed_keys, &updates)?
            }
            CommitmentMode::Disabled => {
                return Err(ArchiveError::Unsupported(
                    "compute_commitment reached Disabled after the early return".into(),
                ))
            }
        };
        Ok((Some(root), Some(branch_updates)))
    }

    /// Persists the adapter's current trie state under [`STATE_KEY`],
    /// suffixed with the step `tx_num / aggregation_step`. Only supported
    /// when the adapter is the hex-Patricia variant.
    pub fn store_commitment_state(&mut self, tx_num: u64, block_num: u64) -> ArchiveResult<()> {
        if self.adapter.variant() != super::adapter::AdapterVariant::HexPatriciaHashed {
            return Err(ArchiveError::Unsupported(
                "store_commitment_state requires the hex-Patricia adapter variant".into(),
            ));
        }
        let trie_state = self.adapter.encode_current_state()?;
        let state = CommitmentState {
            tx_num,
            block_num,
            trie_state,
        };
        let step = (tx_num / self.aggregation_step) as u16;
        self.state_store.put(step, state.encode())?;
        tracing::debug!(tx_num, block_num, step, "stored commitment state snapshot");
        Ok(())
    }

    /// Recovers the most recent commitment snapshot at or after
    /// `since_tx`, restoring it into the adapter and advancing
    /// [`Self::tx_pointer`] to `latest_tx_num + aggregation_step`. Returns
    /// `(block_num, tx_num)`; `(0, 0)` if no snapshot exists yet. The scan
    /// walks steps forward and only stops on a repeated `tx_num` once a
    /// candidate has already been found, so a present-but-malformed
    /// snapshot propagates its decode error rather than being swallowed.
    pub fn seek_commitment(&mut self, since_tx: u64) -> ArchiveResult<(u64, u64)> {
        let agg_step = self.aggregation_step;
        let mut step = if since_tx == 0 {
            0
        } else {
            (since_tx / agg_step).saturating_sub(1)
        };
        let mut latest_tx_num = since_tx.saturating_sub(1);
        let mut previous_seen_tx_num: Option<u64> = None;
        let mut candidate: Option<Vec<u8>> = None;

        loop {
            let bytes = self.state_store.get(step)?;
            let bytes = match bytes {
                Some(b) if b.len() >= 8 => b,
                _ => break,
            };
            let observed_tx_num = u64::from_be_bytes(bytes[0..8].try_into().unwrap());
            if let Some(prev) = previous_seen_tx_num {
                if observed_tx_num == prev && candidate.is_some() {
                    break;
                }
            }
            previous_seen_tx_num = Some(observed_tx_num);
            candidate = Some(bytes);
            latest_tx_num = observed_tx_num;
            step += 1;
        }

        let Some(bytes) = candidate else {
            return Ok((0, 0));
        };
        let Some(state) = CommitmentState::decode(&bytes)? else {
            return Ok((0, 0));
        };
        self.adapter.set_state(&state.trie_state)?;
        self.tx_pointer = latest_tx_num + agg_step;
        Ok((state.block_num, state.tx_num))
    }
}

/// One input cursor into the multi-way value-domain merge: the current
/// `(key, value)` pair, the `end_tx_num` of the file it came from (used to
/// break ties in favor of the newer file), and which source it belongs to.
#[derive(Clone, Debug, PartialEq, Eq)]
struct CursorItem {
    key: Vec<u8>,
    val: Vec<u8>,
    end_tx_num: u64,
    source_index: usize,
}

impl Ord for CursorItem {
    fn cmp(&self, other: &Self) -> Ordering {
        match other.key.cmp(&self.key) {
            Ordering::Equal => self.end_tx_num.cmp(&other.end_tx_num),
            ord => ord,
        }
    }
}

impl PartialOrd for CursorItem {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

/// The write-side counterpart to [`ArchiveGetter`]: a seam a host wires to
/// its real compressed-file writer. `add_word` appends an opaque record;
/// `compress` finalizes the file. Real backends (on-disk compression,
/// recsplit index construction) are left to the host - only the seam is
/// specified here.
pub trait Compressor {
    /// Appends one opaque record (a key or a value) to the file being
    /// built.
    fn add_word(&mut self, word: &[u8]) -> ArchiveResult<()>;
    /// Finalizes the file; no further `add_word` calls are valid after.
    fn compress(&mut self) -> ArchiveResult<()>;
    /// Discards whatever has been written so far. Called by [`merge_files`]
    /// when a later step fails or cancellation is observed, so that a
    /// failed merge never leaves a finalized-looking partial file behind.
    fn abort(&mut self);
}

/// Delegate for merging the history and index files accompanying a value
/// domain merge. Left as a trait seam for a host to wire to its real
/// history/index merge logic.
pub trait HistoryMerger {
    /// Merges history and index files for the range this merge covers,
    /// observing `cancel`.
    fn merge_history_and_index(&mut self, cancel: &CancellationToken) -> ArchiveResult<()>;
}

/// A no-op [`HistoryMerger`] for hosts and tests that don't model
/// history/index files.
#[derive(Default)]
pub struct NoOpHistoryMerger;

impl HistoryMerger for NoOpHistoryMerger {
    fn merge_history_and_index(&mut self, _cancel: &CancellationToken) -> ArchiveResult<()> {
        Ok(())
    }
}

/// Delegate for building the merged value file's primary point index.
/// Left as a trait seam - a host wires this to its real index builder over
/// the decompressor and on-disk layout it owns.
pub trait PrimaryIndexBuilder {
    /// Builds the index over whatever file the implementor already knows
    /// about, observing `cancel`.
    fn build(&mut self, cancel: &CancellationToken) -> ArchiveResult<()>;
}

/// A no-op [`PrimaryIndexBuilder`] for hosts and tests that don't model a
/// primary index.
#[derive(Default)]
pub struct NoOpPrimaryIndexBuilder;

impl PrimaryIndexBuilder for NoOpPrimaryIndexBuilder {
    fn build(&mut self, _cancel: &CancellationToken) -> ArchiveResult<()> {
        Ok(())
    }
}

/// Host capability that, once [`Compressor::compress`] has finalized the
/// merged value file, reopens it as a fresh read-only cursor plus the
/// Elias-Fano vector of record offsets needed to build that file's
/// BPS-tree. Real backends reopen or re-map the just-written file; only
/// the call site is specified here.
pub trait MergedFileReopener<G: ArchiveGetter> {
    /// Produces a fresh cursor and offset vector over the merged file.
    fn reopen(&mut self) -> ArchiveResult<(G, EliasFano)>;
}

/// One input to the value-domain merge: a cursor already positioned at the
/// start of its file, plus the `end_tx_num` used for tie-breaking.
pub struct MergeSource<G: ArchiveGetter> {
    /// The cursor to read key/value pairs from, starting at offset 0.
    pub getter: G,
    /// The file's `end_tx_num`, used to prefer the newer file on a key tie.
    pub end_tx_num: u64,
}

/// An input cursor plus whether it has been exhausted, tracked across the
/// lifetime of one [`merge_value_domain`] call.
struct MergeCursor<G: ArchiveGetter> {
    getter: G,
    end_tx_num: u64,
    exhausted: bool,
}

fn read_pair<G: ArchiveGetter>(
    getter: &mut G,
    source_index: usize,
    end_tx_num: u64,
) -> ArchiveResult<Option<CursorItem>> {
    if !getter.has_next() {
        return Ok(None);
    }
    let mut key = Vec::new();
    getter.next(&mut key)?;
    if !getter.has_next() {
        return Err(ArchiveError::InvalidEncoding(
            "value domain file ended on a key with no matching value".into(),
        ));
    }
    let mut val = Vec::new();
    getter.next(&mut val)?;
    Ok(Some(CursorItem {
        key,
        val,
        end_tx_num,
        source_index,
    }))
}

fn advance_source<G: ArchiveGetter>(
    srcs: &mut [MergeCursor<G>],
    idx: usize,
    heap: &mut BinaryHeap<CursorItem>,
) -> ArchiveResult<()> {
    let src = &mut srcs[idx];
    if src.exhausted {
        return Ok(());
    }
    match read_pair(&mut src.getter, idx, src.end_tx_num)? {
        Some(item) => heap.push(item),
        None => src.exhausted = true,
    }
    Ok(())
}

/// Multi-way merges `sources` into `target`, applying `transform` to the
/// value of the final (trailing) written pair before it is written. The
/// merge buffers one pair behind the heap's pop order so it always knows
/// which pair is trailing when the input is exhausted, and the transform
/// runs only on that one pair rather than on every written record.
///
/// Skip criterion: a pair is dropped (never written) when
/// `target_start_tx_num == 0 && val.is_empty()`. On a key tie across
/// sources, the value from the file with the greatest `end_tx_num` (the
/// newest file) wins.
pub fn merge_value_domain<G: ArchiveGetter>(
    sources: Vec<MergeSource<G>>,
    target: &mut impl Compressor,
    target_start_tx_num: u64,
    cancel: &CancellationToken,
    mut transform: impl FnMut(&[u8]) -> ArchiveResult<Vec<u8>>,
) -> ArchiveResult<()> {
    let mut srcs: Vec<MergeCursor<G>> = sources
        .into_iter()
        .map(|s| MergeCursor {
            getter: s.getter,
            end_tx_num: s.end_tx_num,
            exhausted: false,
        })
        .collect();

    let mut heap: BinaryHeap<CursorItem> = BinaryHeap::new();
    for idx in 0..srcs.len() {
        advance_source(&mut srcs, idx, &mut heap)?;
    }

    let mut delayed: Option<(Vec<u8>, Vec<u8>)> = None;

    while let Some(top) = heap.pop() {
        if cancel.is_cancelled() {
            return Err(ArchiveError::Cancelled);
        }
        let CursorItem {
            key,
            val,
            source_index,
            ..
        } = top;

        advance_source(&mut srcs, source_index, &mut heap)?;
        while let Some(peek) = heap.peek() {
            if peek.key == key {
                let dup = heap.pop().unwrap();
                advance_source(&mut srcs, dup.source_index, &mut heap)?;
            } else {
                break;
            }
        }

        if let Some((prev_key, prev_val)) = delayed.take() {
            let skip = target_start_tx_num == 0 && prev_val.is_empty();
            if !skip {
                target.add_word(&prev_key)?;
                target.add_word(&prev_val)?;
            }
        }
        delayed = Some((key, val));
    }

    if let Some((key, val)) = delayed {
        let skip = target_start_tx_num == 0 && val.is_empty();
        if !skip {
            let transformed = transform(&val)?;
            target.add_word(&key)?;
            target.add_word(&transformed)?;
        }
    }

    target.compress()
}

/// Drives the commitment-specific file merge end to end:
///
/// 1. Merge history and index files via `history_merger`.
/// 2. Multi-way merge the value domain (`merge_value_domain`), running
///    `transform` (ordinarily [`commitment_val_transform`]) on the
///    trailing written pair.
/// 3. Build the primary index over the merged file (`primary_index_builder`).
/// 4. Reopen the merged file and build its BPS-tree (`reopener`).
///
/// On any error surfacing from steps 2-4, `target` is aborted before the
/// error propagates, so a failed merge never leaves a finalized-looking
/// partial file behind. A failure in step 1 aborts nothing in `target`
/// since nothing has been written to it yet.
#[allow(clippy::too_many_arguments)]
pub fn merge_files<G, H, C, P, R>(
    mut history_merger: H,
    sources: Vec<MergeSource<G>>,
    mut target: C,
    target_start_tx_num: u64,
    bps_tree_m: u64,
    cancel: &CancellationToken,
    transform: impl FnMut(&[u8]) -> ArchiveResult<Vec<u8>>,
    mut primary_index_builder: P,
    mut reopener: R,
) -> ArchiveResult<BpsTree<G>>
where
    G: ArchiveGetter,
    H: HistoryMerger,
    C: Compressor,
    P: PrimaryIndexBuilder,
    R: MergedFileReopener<G>,
{
    history_merger.merge_history_and_index(cancel)?;

    let outcome = merge_value_domain(sources, &mut target, target_start_tx_num, cancel, transform)
        .and_then(|_| primary_index_builder.build(cancel))
        .and_then(|_| reopener.reopen())
        .and_then(|(getter, offsets)| {
            let mut tree = BpsTree::new(getter, offsets, bps_tree_m);
            tree.initialize()?;
            Ok(tree)
        });

    if outcome.is_err() {
        target.abort();
    }
    outcome
}
