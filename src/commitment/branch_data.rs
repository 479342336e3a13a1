//! Branch-node blob: an opaque, round-trippable value carried alongside a
//! trie branch update, tagged with the plain keys reachable under it so a
//! later file merge can rewrite those keys without re-walking the trie.

use crate::error::{ArchiveError, ArchiveResult};

/// The encoded branch-node value a [`super::adapter::PatriciaAdapter`]
/// emits per touched branch prefix.
///
/// Wire layout: `u16 BE` account-key count, then each account key as
/// `u8` length-prefixed bytes; `u16 BE` storage-key count, each similarly
/// length-prefixed; the remainder of the buffer is the opaque trie payload
/// (an RLP-encoded node, for the reference adapter).
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct BranchData(Vec<u8>);

impl BranchData {
    /// Builds a blob from explicit plain-key lists and an opaque payload.
    pub fn new(account_pks: &[Vec<u8>], storage_pks: &[Vec<u8>], payload: &[u8]) -> Self {
        let mut out = Vec::with_capacity(payload.len() + 4);
        write_key_list(&mut out, account_pks);
        write_key_list(&mut out, storage_pks);
        out.extend_from_slice(payload);
        BranchData(out)
    }

    /// Wraps an already-encoded blob without re-validating it.
    pub fn from_bytes(bytes: Vec<u8>) -> Self {
        BranchData(bytes)
    }

    /// Borrows the raw encoded bytes.
    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }

    /// Parses out the account and storage plain-key lists carried in this
    /// blob, leaving the payload untouched.
    pub fn extract_plain_keys(&self) -> ArchiveResult<(Vec<Vec<u8>>, Vec<Vec<u8>>)> {
        let (account_pks, _, rest) = read_key_list(&self.0)?;
        let (storage_pks, _, _) = read_key_list(rest)?;
        Ok((account_pks, storage_pks))
    }

    /// Returns the opaque payload following the two key lists.
    pub fn payload(&self) -> ArchiveResult<&[u8]> {
        let (_, _, rest) = read_key_list(&self.0)?;
        let (_, _, rest) = read_key_list(rest)?;
        Ok(rest)
    }

    /// Produces a new blob with the key lists replaced and the payload
    /// carried over unchanged. A no-op on value bytes when the new lists
    /// equal the old ones.
    pub fn replace_plain_keys(&self, new_account_pks: &[Vec<u8>], new_storage_pks: &[Vec<u8>]) -> ArchiveResult<Self> {
        let payload = self.payload()?;
        Ok(BranchData::new(new_account_pks, new_storage_pks, payload))
    }
}

fn write_key_list(out: &mut Vec<u8>, keys: &[Vec<u8>]) {
    out.extend_from_slice(&(keys.len() as u16).to_be_bytes());
    for k in keys {
        out.push(k.len() as u8);
        out.extend_from_slice(k);
    }
}

/// Reads a length-prefixed key list from the front of `buf`, returning the
/// parsed keys, how many bytes were consumed, and the remaining slice.
fn read_key_list(buf: &[u8]) -> ArchiveResult<(Vec<Vec<u8>>, usize, &[u8])> {
    if buf.len() < 2 {
        return Err(ArchiveError::InvalidEncoding(
            "branch data truncated before key-list count".into(),
        ));
    }
    let count = u16::from_be_bytes([buf[0], buf[1]]) as usize;
    let mut pos = 2usize;
    let mut keys = Vec::with_capacity(count);
    for _ in 0..count {
        if pos >= buf.len() {
            return Err(ArchiveError::InvalidEncoding(
                "branch data truncated inside key list".into(),
            ));
        }
        let len = buf[pos] as usize;
        pos += 1;
        if pos + len > buf.len() {
            return Err(ArchiveError::InvalidEncoding(
                "branch data key overruns buffer".into(),
            ));
        }
        keys.push(buf[pos..pos + len].to_vec());
        pos += len;
    }
    Ok((keys, pos, &buf[pos..]))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_trips_key_lists_and_payload() {
        let accounts = vec![vec![0xAAu8; 20], vec![0xBBu8; 3]];
        let storages = vec![vec![0xCCu8; 52]];
        let payload = b"rlp-node-bytes";
        let bd = BranchData::new(&accounts, &storages, payload);

        let (got_accounts, got_storages) = bd.extract_plain_keys().unwrap();
        assert_eq!(got_accounts, accounts);
        assert_eq!(got_storages, storages);
        assert_eq!(bd.payload().unwrap(), payload);
    }

    #[test]
    fn replace_plain_keys_preserves_payload() {
        let bd = BranchData::new(&[vec![1, 2, 3]], &[], b"payload-bytes");
        let replaced = bd
            .replace_plain_keys(&[vec![9, 9]], &[vec![7, 7, 7]])
            .unwrap();
        assert_eq!(replaced.payload().unwrap(), b"payload-bytes");
        let (accounts, storages) = replaced.extract_plain_keys().unwrap();
        assert_eq!(accounts, vec![vec![9, 9]]);
        assert_eq!(storages, vec![vec![7, 7, 7]]);
    }

    #[test]
    fn replace_with_identical_keys_is_a_value_no_op() {
        let bd = BranchData::new(&[vec![1, 2, 3]], &[vec![4, 5]], b"same-payload");
        let replaced = bd.replace_plain_keys(&[vec![1, 2, 3]], &[vec![4, 5]]).unwrap();
        assert_eq!(bd, replaced);
    }

    #[test]
    fn empty_key_lists_round_trip() {
        let bd = BranchData::new(&[], &[], b"x");
        let (a, s) = bd.extract_plain_keys().unwrap();
        assert!(a.is_empty());
        assert!(s.is_empty());
        assert_eq!(bd.payload().unwrap(), b"x");
    }

    #[test]
    fn truncated_blob_is_rejected() {
        let bd = BranchData::from_bytes(vec![0x00]);
        assert!(bd.extract_plain_keys().is_err());
    }
}
