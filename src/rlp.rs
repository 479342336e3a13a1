//! Minimal RLP encoding and Keccak256 hashing for the Patricia adapter.
//!
//! `rlp_encode_list_items` generalizes the two-item leaf/extension shape to
//! an arbitrary item count, since branch nodes need seventeen (sixteen
//! children plus a value slot).

use sha3::{Digest, Keccak256};

/// RLP-encodes a byte string.
pub fn rlp_encode_bytes(data: &[u8]) -> Vec<u8> {
    if data.len() == 1 && data[0] < 0x80 {
        vec![data[0]]
    } else if data.len() < 56 {
        let mut result = vec![0x80 + data.len() as u8];
        result.extend_from_slice(data);
        result
    } else {
        let len_bytes = encode_length(data.len());
        let mut result = vec![0xb7 + len_bytes.len() as u8];
        result.extend_from_slice(&len_bytes);
        result.extend_from_slice(data);
        result
    }
}

/// RLP-encodes two byte strings as a list (leaf/extension node shape).
pub fn rlp_encode_two_items(a: &[u8], b: &[u8]) -> Vec<u8> {
    rlp_encode_list_items(&[a.to_vec(), b.to_vec()])
}

/// RLP-encodes an arbitrary number of byte strings as a list (branch node
/// shape: sixteen children plus an optional value).
pub fn rlp_encode_list_items(items: &[Vec<u8>]) -> Vec<u8> {
    let encoded_items: Vec<Vec<u8>> = items.iter().map(|i| rlp_encode_bytes(i)).collect();
    let total_len: usize = encoded_items.iter().map(|e| e.len()).sum();

    let mut result = Vec::with_capacity(total_len + 9);
    if total_len < 56 {
        result.push(0xc0 + total_len as u8);
    } else {
        let len_bytes = encode_length(total_len);
        result.push(0xf7 + len_bytes.len() as u8);
        result.extend_from_slice(&len_bytes);
    }
    for encoded in encoded_items {
        result.extend(encoded);
    }
    result
}

fn encode_length(len: usize) -> Vec<u8> {
    let bytes = len.to_be_bytes();
    let start = bytes
        .iter()
        .position(|&b| b != 0)
        .unwrap_or(bytes.len() - 1);
    bytes[start..].to_vec()
}

/// Keccak256 of `data`.
pub fn keccak256(data: &[u8]) -> [u8; 32] {
    let mut hasher = Keccak256::new();
    hasher.update(data);
    hasher.finalize().into()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn single_byte_below_0x80_is_itself() {
        assert_eq!(rlp_encode_bytes(&[0x00]), vec![0x00]);
        assert_eq!(rlp_encode_bytes(&[0x7f]), vec![0x7f]);
    }

    #[test]
    fn short_string_gets_length_prefix() {
        assert_eq!(rlp_encode_bytes(&[0x80]), vec![0x81, 0x80]);
        assert_eq!(rlp_encode_bytes(b"dog"), vec![0x83, b'd', b'o', b'g']);
    }

    #[test]
    fn long_string_gets_length_of_length_prefix() {
        let data = vec![0x41u8; 56];
        let encoded = rlp_encode_bytes(&data);
        assert_eq!(encoded[0], 0xb7 + 1);
        assert_eq!(encoded[1], 56);
    }

    #[test]
    fn keccak_is_deterministic_and_32_bytes() {
        let h1 = keccak256(b"hello");
        let h2 = keccak256(b"hello");
        assert_eq!(h1, h2);
        assert_ne!(h1, keccak256(b"world"));
        assert_eq!(h1.len(), 32);
    }
}
