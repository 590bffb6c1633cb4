use alloy_primitives::{Address, B256, U256};
use sha3::{Digest, Keccak256};

use crate::trie::{empty_trie_hash, ordered_trie_root};

/// 8-byte proof-of-work nonce.
pub type BlockNonce = [u8; 8];

/// 256-byte bloom filter.
pub type Bloom = [u8; 256];

/// An opaque, RLP-encoded transaction receipt.
pub type Receipt = Vec<u8>;

/// Keccak-256 of arbitrary bytes.
pub fn keccak256(data: &[u8]) -> B256 {
    B256::from_slice(&Keccak256::digest(data))
}

/// Block header. Field order matches the canonical RLP layout.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BlockHeader {
    pub parent_hash: B256,
    pub uncle_hash: B256,
    pub coinbase: Address,
    pub state_root: B256,
    pub transactions_root: B256,
    pub receipts_root: B256,
    pub logs_bloom: Bloom,
    pub difficulty: U256,
    pub number: u64,
    pub gas_limit: u64,
    pub gas_used: u64,
    pub timestamp: u64,
    pub extra_data: Vec<u8>,
    pub mix_hash: B256,
    pub nonce: BlockNonce,
}

impl Default for BlockHeader {
    /// A header committing to an empty body and empty receipts.
    fn default() -> Self {
        Self {
            parent_hash: B256::ZERO,
            uncle_hash: empty_uncle_hash(),
            coinbase: Address::ZERO,
            state_root: empty_trie_hash(),
            transactions_root: empty_trie_hash(),
            receipts_root: empty_trie_hash(),
            logs_bloom: [0u8; 256],
            difficulty: U256::ZERO,
            number: 0,
            gas_limit: 0,
            gas_used: 0,
            timestamp: 0,
            extra_data: Vec::new(),
            mix_hash: B256::ZERO,
            nonce: [0u8; 8],
        }
    }
}

impl BlockHeader {
    /// Header hash (keccak256 of the RLP encoding).
    pub fn hash(&self) -> B256 {
        keccak256(&self.rlp_encode())
    }

    pub fn rlp_encode(&self) -> Vec<u8> {
        let fields = [
            rlp_encode_bytes(self.parent_hash.as_slice()),
            rlp_encode_bytes(self.uncle_hash.as_slice()),
            rlp_encode_bytes(self.coinbase.as_slice()),
            rlp_encode_bytes(self.state_root.as_slice()),
            rlp_encode_bytes(self.transactions_root.as_slice()),
            rlp_encode_bytes(self.receipts_root.as_slice()),
            rlp_encode_bytes(&self.logs_bloom),
            rlp_encode_u256(&self.difficulty),
            rlp_encode_u64(self.number),
            rlp_encode_u64(self.gas_limit),
            rlp_encode_u64(self.gas_used),
            rlp_encode_u64(self.timestamp),
            rlp_encode_bytes(&self.extra_data),
            rlp_encode_bytes(self.mix_hash.as_slice()),
            rlp_encode_bytes(&self.nonce),
        ];
        rlp_encode_list_from_encoded(&fields)
    }

    /// Whether the header commits to a body with no transactions and no uncles.
    /// Such bodies never need to be requested from the network.
    pub fn has_empty_body(&self) -> bool {
        self.transactions_root == empty_trie_hash() && self.uncle_hash == empty_uncle_hash()
    }

    /// Whether the header commits to an empty receipt list.
    pub fn has_empty_receipts(&self) -> bool {
        self.receipts_root == empty_trie_hash()
    }
}

/// Transactions and uncles of a block, as delivered by a bodies response.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BlockBody {
    /// RLP-encoded transactions, in block order.
    pub transactions: Vec<Vec<u8>>,
    pub uncles: Vec<BlockHeader>,
}

impl BlockBody {
    /// Check the body against the header's transaction and uncle commitments.
    pub fn matches(&self, header: &BlockHeader) -> bool {
        ordered_trie_root(&self.transactions) == header.transactions_root
            && compute_uncle_hash(&self.uncles) == header.uncle_hash
    }

    /// Approximate wire size, used for traffic accounting.
    pub fn encoded_len(&self) -> usize {
        let txs: usize = self.transactions.iter().map(Vec::len).sum();
        let uncles: usize = self.uncles.iter().map(|u| u.rlp_encode().len()).sum();
        txs + uncles
    }
}

/// Check a receipt list against the header's receipt commitment.
pub fn receipts_match(receipts: &[Receipt], header: &BlockHeader) -> bool {
    ordered_trie_root(receipts) == header.receipts_root
}

/// A fully assembled block, ready for import.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Block {
    pub header: BlockHeader,
    pub body: BlockBody,
    /// Present only when receipts were retrieved alongside the body.
    pub receipts: Option<Vec<Receipt>>,
}

impl Block {
    pub fn new(header: BlockHeader, body: BlockBody) -> Self {
        Self {
            header,
            body,
            receipts: None,
        }
    }

    pub fn hash(&self) -> B256 {
        self.header.hash()
    }

    pub fn number(&self) -> u64 {
        self.header.number
    }
}

/// keccak256 of the RLP empty list, the uncle hash of a block without uncles.
pub fn empty_uncle_hash() -> B256 {
    keccak256(&[0xc0])
}

/// Uncle hash for a list of uncle headers.
pub fn compute_uncle_hash(uncles: &[BlockHeader]) -> B256 {
    if uncles.is_empty() {
        return empty_uncle_hash();
    }
    let encoded: Vec<Vec<u8>> = uncles.iter().map(BlockHeader::rlp_encode).collect();
    keccak256(&rlp_encode_list_from_encoded(&encoded))
}

// ============================================================================
// RLP encoding helpers
// ============================================================================

/// RLP-encode a byte string.
pub fn rlp_encode_bytes(data: &[u8]) -> Vec<u8> {
    if data.len() == 1 && data[0] < 0x80 {
        return data.to_vec();
    }
    let mut out = rlp_length_prefix(data.len(), 0x80);
    out.extend_from_slice(data);
    out
}

/// RLP-encode a U256 as minimal big-endian bytes.
pub fn rlp_encode_u256(v: &U256) -> Vec<u8> {
    let buf = v.to_be_bytes::<32>();
    rlp_encode_bytes(trim_leading_zeros(&buf))
}

/// RLP-encode a u64 as minimal big-endian bytes.
pub fn rlp_encode_u64(v: u64) -> Vec<u8> {
    let buf = v.to_be_bytes();
    rlp_encode_bytes(trim_leading_zeros(&buf))
}

/// Wrap already-encoded items into an RLP list.
pub fn rlp_encode_list_from_encoded(items: &[Vec<u8>]) -> Vec<u8> {
    let payload_len: usize = items.iter().map(Vec::len).sum();
    let mut out = rlp_length_prefix(payload_len, 0xc0);
    for item in items {
        out.extend_from_slice(item);
    }
    out
}

/// Length prefix for a string (`offset = 0x80`) or list (`offset = 0xc0`).
pub(crate) fn rlp_length_prefix(len: usize, offset: u8) -> Vec<u8> {
    if len < 56 {
        return vec![offset + len as u8];
    }
    let len_buf = (len as u64).to_be_bytes();
    let len_bytes = trim_leading_zeros(&len_buf);
    let mut out = Vec::with_capacity(1 + len_bytes.len());
    out.push(offset + 55 + len_bytes.len() as u8);
    out.extend_from_slice(len_bytes);
    out
}

fn trim_leading_zeros(bytes: &[u8]) -> &[u8] {
    let start = bytes.iter().position(|&b| b != 0).unwrap_or(bytes.len());
    &bytes[start..]
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rlp_encode_empty_bytes() {
        assert_eq!(rlp_encode_bytes(&[]), vec![0x80]);
    }

    #[test]
    fn rlp_encode_single_byte() {
        assert_eq!(rlp_encode_bytes(&[0x42]), vec![0x42]);
        assert_eq!(rlp_encode_bytes(&[0x80]), vec![0x81, 0x80]);
    }

    #[test]
    fn rlp_encode_integers() {
        assert_eq!(rlp_encode_u64(0), vec![0x80]);
        assert_eq!(rlp_encode_u64(1), vec![0x01]);
        assert_eq!(rlp_encode_u64(1024), vec![0x82, 0x04, 0x00]);
        assert_eq!(rlp_encode_u256(&U256::ZERO), vec![0x80]);
    }

    #[test]
    fn rlp_long_string_prefix() {
        let data = vec![0xaa; 60];
        let encoded = rlp_encode_bytes(&data);
        assert_eq!(&encoded[..2], &[0xb8, 60]);
        assert_eq!(encoded.len(), 62);
    }

    #[test]
    fn default_header_has_empty_commitments() {
        let header = BlockHeader::default();
        assert!(header.has_empty_body());
        assert!(header.has_empty_receipts());
        assert!(BlockBody::default().matches(&header));
        assert!(receipts_match(&[], &header));
    }

    #[test]
    fn body_mismatch_detected() {
        let header = BlockHeader::default();
        let body = BlockBody {
            transactions: vec![vec![0xc0]],
            uncles: vec![],
        };
        assert!(!body.matches(&header));

        let committed = BlockHeader {
            transactions_root: ordered_trie_root(&body.transactions),
            ..BlockHeader::default()
        };
        assert!(body.matches(&committed));
        assert!(!committed.has_empty_body());
    }

    #[test]
    fn header_hash_changes_with_parent() {
        let a = BlockHeader::default();
        let b = BlockHeader {
            parent_hash: a.hash(),
            number: 1,
            ..BlockHeader::default()
        };
        assert_ne!(a.hash(), b.hash());
        assert_eq!(b.hash(), b.clone().hash());
    }
}
