//! # state-archive-core
//!
//! Succinct Elias-Fano indices, a sparse BPS-tree archive reader, and a
//! mergeable Patricia-committed state domain.
//!
//! ## Role in System
//!
//! - **Archive Reader**: Turns a flat, sorted key archive plus an
//!   Elias-Fano offset vector into point lookups and ordered seeks, without
//!   loading the archive into memory.
//! - **Commitment Engine**: Buffers per-key touches into an update tree and
//!   drives a Patricia adapter to produce a state root and branch updates.
//! - **File Merger**: Multi-way merges the value files of an aggregation
//!   step into one, rewriting committed-domain branch references along the
//!   way.
//!
//! ## Pipeline
//!
//! ```text
//! [sorted (key, value) archive] ──offsets──→ [EliasFano]
//!                                                  │
//!                                                  ↓
//!                                           [BpsTree<G>] ──seek/kv──→ point + range queries
//!
//! [touch_account_key/touch_storage_key/touch_code_key]
//!                 │
//!                 ↓
//!         [UpdateTree] ──list()──→ [PatriciaAdapter] ──→ (root_hash, branch_updates)
//!                                                              │
//!                                                              ↓
//!                                                   [CommittedDomain::store_commitment_state]
//!
//! [MergeSource; N] ──merge_value_domain/merge_files──→ merged file + rebuilt BpsTree
//! ```
//!
//! ## Module Map
//!
//! | Module | Responsibility |
//! |--------|----------------|
//! | [`error`] | Crate-wide `ArchiveError`/`ArchiveResult`. |
//! | [`config`] | `CommitmentMode`, archive tuning knobs (`ArchiveConfig`). |
//! | [`elias_fano`] | Succinct monotone-sequence codec (`EliasFano`). |
//! | [`archive`] | `ArchiveGetter`/`ArchiveSource` cursor seam, `InMemoryArchive` reference backing. |
//! | [`bps_tree`] | Sparse sampling index over a sorted archive (`BpsTree<G>`). |
//! | [`nibbles`] | Nibble paths and hex-prefix encoding (`Nibbles`). |
//! | [`rlp`] | Minimal RLP encoder and Keccak256 hashing. |
//! | [`hashing`] | `hash_and_nibblize`: key hashing and account/storage key-length split. |
//! | [`update_tree`] | Ordered pending-touch map with per-cell merge laws (`UpdateTree`). |
//! | [`commitment`] | Patricia adapter, branch-data wire format, committed-domain snapshot and merge. |
//!
//! ## Domain Invariants
//!
//! | ID | Invariant | Enforcement Location |
//! |----|-----------|---------------------|
//! | INVARIANT-1 | Elias-Fano sequences are strictly monotone on construction | `elias_fano.rs` - `EliasFano::add_offset` |
//! | INVARIANT-2 | `BpsTree::seek` and `seek_with_getter` agree on every input | `bps_tree.rs` - shared `narrow_ordinal` |
//! | INVARIANT-3 | A touch merge never silently drops an already-set flag it should preserve | `update_tree.rs` - `touch_account`/`touch_code` |
//! | INVARIANT-4 | Deterministic state root for a given touch set | `commitment/adapter.rs` - `build_node` (sorted cell iteration) |
//! | INVARIANT-5 | A failed merge never leaves a finalized-looking partial file | `commitment/domain.rs` - `merge_files` aborts `target` on error |
//!
//! ## Concurrency
//!
//! Archive cursors ([`archive::ArchiveGetter`]) are stateful and
//! single-threaded; concurrent readers mint independent cursors via
//! [`archive::ArchiveSource::getter`] rather than sharing one. `BpsTree`'s
//! sampled index is read-only after `initialize` and safe to query from
//! multiple cursors concurrently through `seek_with_getter`.

#![warn(missing_docs)]

pub mod archive;
pub mod bps_tree;
pub mod commitment;
pub mod config;
pub mod elias_fano;
pub mod error;
pub mod hashing;
pub mod nibbles;
pub mod rlp;
pub mod update_tree;

pub use archive::{ArchiveGetter, ArchiveSource, InMemoryArchive, InMemoryGetter};
pub use bps_tree::{BpsTree, BpsTreeIterator};
pub use commitment::{
    AdapterVariant, BranchData, CancellationToken, CommitmentState, CommitmentStateStore,
    CommittedDomain, Compressor, FileRange, FileSet, HexPatriciaHashed, HistoryMerger,
    InMemoryCommitmentStateStore, MergeSource, MergedFileReopener, NoOpHistoryMerger,
    NoOpPrimaryIndexBuilder, NullAdapter, PatriciaAdapter, PrimaryIndexBuilder, TransformContext,
};
pub use config::{ArchiveConfig, CommitmentMode, DEFAULT_BPS_TREE_M, DEFAULT_EF_JUMP_TABLE_PERIOD};
pub use elias_fano::{build_from_sorted, EliasFano, EliasFanoIter};
pub use error::{ArchiveError, ArchiveResult};
pub use hashing::{hash_and_nibblize, ADDR_LEN};
pub use nibbles::Nibbles;
pub use rlp::{keccak256, rlp_encode_bytes, rlp_encode_list_items, rlp_encode_two_items};
pub use update_tree::{CommitmentItem, TouchKind, Update, UpdateFlags, UpdateTree};
