//! Commitment subsystem: the Patricia adapter capability, the wire format
//! for branch-node updates, and committed-domain snapshot persistence plus
//! multi-file merge.

pub mod adapter;
pub mod branch_data;
pub mod domain;

pub use adapter::{AdapterVariant, CellFn, HexPatriciaHashed, NullAdapter, PatriciaAdapter};
pub use branch_data::BranchData;
pub use domain::{
    commitment_val_transform, decode_shortened_key, encode_shortened_key, merge_files,
    merge_value_domain, CancellationToken, CommitmentState, CommitmentStateStore, CommittedDomain,
    Compressor, FileRange, FileSet, HistoryMerger, InMemoryCommitmentStateStore, MergeSource,
    MergedFileReopener, NoOpHistoryMerger, NoOpPrimaryIndexBuilder, PrimaryIndexBuilder,
    TransformContext, STATE_KEY,
};
