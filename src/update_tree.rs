//! Update Tree: an ordered map from hashed key to pending commitment update,
//! merging repeated touches of the same key. Dispatch on which cell shape a
//! touch carries is modeled as a [`TouchKind`] enum rather than a classify
//! callback, since that fits Rust's static typing more naturally than a
//! boxed closure per call site.

use crate::config::CommitmentMode;
use crate::hashing::hash_and_nibblize;
use crate::nibbles::Nibbles;
use bitflags::bitflags;
use std::collections::BTreeMap;

bitflags! {
    /// Which parts of an account/storage cell a touch carries.
    #[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
    pub struct UpdateFlags: u8 {
        /// The cell's balance changed.
        const BALANCE = 0b0000_0001;
        /// The cell's nonce changed.
        const NONCE = 0b0000_0010;
        /// The cell's code (or code hash) changed.
        const CODE = 0b0000_0100;
        /// A storage slot under this key changed.
        const STORAGE = 0b0000_1000;
        /// The key was deleted; any other flags are meaningless once set.
        const DELETE = 0b0001_0000;
    }
}

/// Discriminates which plain-key shape a touch carries: account, storage,
/// or code-body.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TouchKind {
    /// An account key: balance/nonce (and possibly code hash).
    Account,
    /// A storage key: address || slot.
    Storage,
    /// A code-body touch: `val` is the contract bytecode.
    Code,
}

/// A structured, per-key pending update.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Update {
    /// Which cell components this update carries.
    pub flags: UpdateFlags,
    /// Raw cell bytes (account encoding, storage value, or code hash),
    /// depending on which flags are set.
    pub value: Vec<u8>,
}

impl Update {
    fn flags_mut(&mut self) -> &mut UpdateFlags {
        &mut self.flags
    }
}

/// An item stored in the update tree: the original plain key, its hashed
/// path, and the structured update accumulated for it so far.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct CommitmentItem {
    /// The original, un-hashed key as presented by the caller.
    pub plain_key: Vec<u8>,
    /// `hash_and_nibblize(plain_key)` - the tree's ordering key.
    pub hashed_key: Nibbles,
    /// The accumulated update for this key.
    pub update: Update,
}

/// Ordered map from hashed key to pending commitment update.
///
/// Backed by a `BTreeMap<Vec<u8>, CommitmentItem>` keyed by the *bytes* of
/// `hashed_key` (not `Nibbles` itself) so that ascending iteration matches
/// lexicographic nibble order without requiring `Nibbles` to implement a
/// bespoke map key adapter.
pub struct UpdateTree {
    mode: CommitmentMode,
    items: BTreeMap<Vec<u8>, CommitmentItem>,
}

impl UpdateTree {
    /// Builds an empty tree governed by `mode`.
    pub fn new(mode: CommitmentMode) -> Self {
        Self {
            mode,
            items: BTreeMap::new(),
        }
    }

    /// Number of distinct hashed keys currently buffered.
    pub fn len(&self) -> usize {
        self.items.len()
    }

    /// Whether the tree currently holds no touches.
    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    /// Records a touch of `key` with raw value `val`, dispatching to the
    /// appropriate merge rule for `kind`. A no-op when the tree's mode is
    /// [`CommitmentMode::Disabled`]: touches are only meaningfully classified
    /// in `Update` mode, but recording the hashed key itself still needs to
    /// happen in `Direct` mode so `compute_commitment` has something to
    /// re-read; only `Disabled` discards the touch outright.
    pub fn touch_plain_key(&mut self, key: &[u8], val: &[u8], kind: TouchKind) {
        if self.mode == CommitmentMode::Disabled {
            return;
        }
        let hashed_key = hash_and_nibblize(key);
        let hashed_bytes = hashed_key.0.clone();

        let classify_in_band = self.mode == CommitmentMode::Update;

        let entry = self
            .items
            .entry(hashed_bytes)
            .or_insert_with(|| CommitmentItem {
                plain_key: key.to_vec(),
                hashed_key,
                update: Update::default(),
            });

        if classify_in_band {
            match kind {
                TouchKind::Account => touch_account(entry, val),
                TouchKind::Storage => touch_storage(entry, val),
                TouchKind::Code => touch_code(entry, val),
            }
        }
    }

    /// Convenience wrapper for an account-key touch.
    pub fn touch_account_key(&mut self, key: &[u8], val: &[u8]) {
        self.touch_plain_key(key, val, TouchKind::Account);
    }

    /// Convenience wrapper for a storage-key touch.
    pub fn touch_storage_key(&mut self, key: &[u8], val: &[u8]) {
        self.touch_plain_key(key, val, TouchKind::Storage);
    }

    /// Convenience wrapper for a code-key touch.
    pub fn touch_code_key(&mut self, key: &[u8], val: &[u8]) {
        self.touch_plain_key(key, val, TouchKind::Code);
    }

    /// Drains the tree in ascending `hashed_key` order, returning three
    /// parallel sequences of equal length: plain keys, hashed keys, and
    /// updates. Destructive - the tree is empty after this call.
    pub fn list(&mut self) -> (Vec<Vec<u8>>, Vec<Nibbles>, Vec<Update>) {
        let mut plain_keys = Vec::with_capacity(self.items.len());
        let mut hashed_keys = Vec::with_capacity(self.items.len());
        let mut updates = Vec::with_capacity(self.items.len());
        for (_, item) in std::mem::take(&mut self.items) {
            plain_keys.push(item.plain_key);
            hashed_keys.push(item.hashed_key);
            updates.push(item.update);
        }
        (plain_keys, hashed_keys, updates)
    }

    /// Invokes `f(plain_key, update)` for every item whose plain key starts
    /// with `prefix`, in ascending `hashed_key` order. This is not a full
    /// prefix scan: iteration starts from the tree minimum and stops at the
    /// first non-matching item encountered once matching items have started,
    /// so only the leading contiguous run of matches (in hashed-key order)
    /// is visited.
    pub fn update_prefix(&self, prefix: &[u8], mut f: impl FnMut(&[u8], &Update)) {
        let mut started = false;
        for item in self.items.values() {
            let matches = item.plain_key.starts_with(prefix);
            if matches {
                started = true;
                f(&item.plain_key, &item.update);
            } else if started {
                break;
            }
        }
    }
}

fn touch_account(item: &mut CommitmentItem, val: &[u8]) {
    if val.is_empty() {
        *item.update.flags_mut() = UpdateFlags::DELETE;
        item.update.value.clear();
        return;
    }
    let preserved_code = item.update.flags.contains(UpdateFlags::CODE);
    let mut flags = UpdateFlags::BALANCE | UpdateFlags::NONCE;
    if preserved_code {
        flags |= UpdateFlags::CODE;
    }
    item.update.flags = flags;
    item.update.value = val.to_vec();
}

fn touch_storage(item: &mut CommitmentItem, val: &[u8]) {
    if val.is_empty() {
        item.update.flags = UpdateFlags::DELETE;
        item.update.value.clear();
        return;
    }
    item.update.flags = UpdateFlags::STORAGE;
    item.update.value = val.to_vec();
}

fn touch_code(item: &mut CommitmentItem, val: &[u8]) {
    let was_delete = item.update.flags.contains(UpdateFlags::DELETE);
    if was_delete && val.is_empty() {
        return;
    }
    let preserved = item.update.flags & (UpdateFlags::BALANCE | UpdateFlags::NONCE);
    item.update.flags = UpdateFlags::CODE | preserved;
    item.update.value = crate::rlp::keccak256(val).to_vec();
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tree() -> UpdateTree {
        UpdateTree::new(CommitmentMode::Update)
    }

    #[test]
    fn balance_then_code_yields_both_flags() {
        let mut t = tree();
        let key = [0x01u8; 20];
        t.touch_account_key(&key, b"balance-bytes");
        t.touch_code_key(&key, b"contract-bytecode");
        let (_, _, updates) = t.list();
        assert_eq!(updates.len(), 1);
        assert!(updates[0].flags.contains(UpdateFlags::BALANCE));
        assert!(updates[0].flags.contains(UpdateFlags::NONCE));
        assert!(updates[0].flags.contains(UpdateFlags::CODE));
    }

    #[test]
    fn code_then_balance_yields_same_flags() {
        let mut t = tree();
        let key = [0x02u8; 20];
        t.touch_code_key(&key, b"contract-bytecode");
        t.touch_account_key(&key, b"balance-bytes");
        let (_, _, updates) = t.list();
        assert_eq!(updates.len(), 1);
        assert!(updates[0].flags.contains(UpdateFlags::BALANCE));
        assert!(updates[0].flags.contains(UpdateFlags::NONCE));
        assert!(updates[0].flags.contains(UpdateFlags::CODE));
    }

    #[test]
    fn delete_then_storage_yields_storage_only() {
        let mut t = tree();
        let key = [0x03u8; 20];
        t.touch_account_key(&key, b"");
        t.touch_storage_key(&key, b"slot-value");
        let (_, _, updates) = t.list();
        assert_eq!(updates[0].flags, UpdateFlags::STORAGE);
    }

    #[test]
    fn storage_then_delete_yields_delete_only() {
        let mut t = tree();
        let key = [0x04u8; 20];
        t.touch_storage_key(&key, b"slot-value");
        t.touch_storage_key(&key, b"");
        let (_, _, updates) = t.list();
        assert_eq!(updates[0].flags, UpdateFlags::DELETE);
    }

    #[test]
    fn list_drains_in_hashed_key_order() {
        let mut t = tree();
        let keys: Vec<[u8; 20]> = vec![[0xAA; 20], [0x01; 20], [0x77; 20]];
        for k in &keys {
            t.touch_account_key(k, b"v");
        }
        let (_, hashed, _) = t.list();
        assert_eq!(hashed.len(), 3);
        assert!(hashed.windows(2).all(|w| w[0] <= w[1]));
        assert!(t.is_empty());
    }

    #[test]
    fn disabled_mode_discards_touches() {
        let mut t = UpdateTree::new(CommitmentMode::Disabled);
        t.touch_account_key(&[0x01u8; 20], b"v");
        assert!(t.is_empty());
    }

    #[test]
    fn direct_mode_records_key_without_classifying() {
        let mut t = UpdateTree::new(CommitmentMode::Direct);
        t.touch_account_key(&[0x01u8; 20], b"v");
        assert_eq!(t.len(), 1);
        let (_, _, updates) = t.list();
        assert_eq!(updates[0].flags, UpdateFlags::empty());
    }

    #[test]
    fn update_prefix_stops_at_first_gap() {
        let mut t = tree();
        t.touch_account_key(b"aaa1", b"v");
        t.touch_account_key(b"aaa2", b"v");
        t.touch_account_key(b"zzz1", b"v");
        let mut seen = Vec::new();
        t.update_prefix(b"aaa", |k, _| seen.push(k.to_vec()));
        // Ascending order is by hashed_key, not plain_key, so the matching
        // run may not include both "aaa" keys if a non-"aaa" key's hash
        // sorts between them; assert only the documented contract: every
        // key seen does start with the prefix, and iteration halts once a
        // non-matching item is seen after a match has started.
        for k in &seen {
            assert!(k.starts_with(b"aaa"));
        }
    }
}
