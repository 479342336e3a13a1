//! Hash-and-nibblize: turns a plain key into the ordered path used inside
//! the update tree and the Patricia adapter.

use crate::nibbles::Nibbles;
use crate::rlp::keccak256;

/// Address-length prefix: plain keys up to this length are account keys;
/// longer keys are address || storage-slot keys.
pub const ADDR_LEN: usize = 20;

/// Hashes and nibble-expands a plain key.
///
/// Keys no longer than [`ADDR_LEN`] bytes (an account address) hash to
/// `nibbles(keccak(key))` - 64 nibbles. Longer keys (address followed by a
/// storage slot) hash each half independently and concatenate the two
///32-byte digests before nibblizing, yielding 128 nibbles. This keeps an
/// account's storage trie addressed under the same top-level path prefix
/// as the account itself would be, without ever hashing the two halves
/// together.
///
/// Pure: does not append a trie terminator nibble.
pub fn hash_and_nibblize(plain_key: &[u8]) -> Nibbles {
    if plain_key.len() <= ADDR_LEN {
        let digest = keccak256(plain_key);
        return Nibbles::from_bytes(&digest);
    }

    let (addr_part, storage_part) = plain_key.split_at(ADDR_LEN);
    let addr_digest = keccak256(addr_part);
    let storage_digest = keccak256(storage_part);

    let mut combined = Vec::with_capacity(64);
    combined.extend_from_slice(&addr_digest);
    combined.extend_from_slice(&storage_digest);
    Nibbles::from_bytes(&combined)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn account_key_yields_64_nibbles() {
        let addr = [0xABu8; 20];
        let hashed = hash_and_nibblize(&addr);
        assert_eq!(hashed.len(), 64);
    }

    #[test]
    fn storage_key_yields_128_nibbles() {
        let mut key = vec![0xABu8; 20];
        key.extend_from_slice(&[0xCDu8; 32]);
        let hashed = hash_and_nibblize(&key);
        assert_eq!(hashed.len(), 128);
    }

    #[test]
    fn is_deterministic() {
        let key = [0x01u8; 20];
        assert_eq!(hash_and_nibblize(&key), hash_and_nibblize(&key));
    }

    #[test]
    fn account_and_storage_halves_differ_from_whole_key_hash() {
        let addr = [0x11u8; 20];
        let mut storage_key = addr.to_vec();
        storage_key.extend_from_slice(&[0x22u8; 32]);

        let account_hash = hash_and_nibblize(&addr);
        let storage_hash = hash_and_nibblize(&storage_key);

        // The storage hash's first 64 nibbles come from keccak(addr) alone,
        // matching the account hash exactly (same top-level trie prefix).
        assert_eq!(storage_hash.slice_range(0, 64), account_hash);
    }
}
