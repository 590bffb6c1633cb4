use alloy_primitives::B256;

use crate::types::{keccak256, rlp_encode_bytes, rlp_encode_list_from_encoded, rlp_encode_u64};

/// Root of the Merkle-Patricia trie mapping `RLP(index) -> item`.
///
/// This is the commitment used for `transactions_root` and `receipts_root`.
/// The trie is built bottom-up from the sorted key set, so no intermediate
/// node store is needed.
pub fn ordered_trie_root(items: &[Vec<u8>]) -> B256 {
    if items.is_empty() {
        return empty_trie_hash();
    }

    let mut entries: Vec<(Vec<u8>, &[u8])> = items
        .iter()
        .enumerate()
        .map(|(i, item)| (to_nibbles(&rlp_encode_u64(i as u64)), item.as_slice()))
        .collect();
    entries.sort_by(|a, b| a.0.cmp(&b.0));

    keccak256(&encode_node(&entries, 0))
}

/// keccak256(RLP("")), the root of a trie with no entries.
pub fn empty_trie_hash() -> B256 {
    keccak256(&[0x80])
}

/// Encode the subtrie holding `entries` (sorted, distinct keys) below `depth` nibbles.
fn encode_node(entries: &[(Vec<u8>, &[u8])], depth: usize) -> Vec<u8> {
    if let [(key, value)] = entries {
        return encode_pair(&hex_to_compact(&key[depth..], true), &rlp_encode_bytes(value));
    }

    let first = &entries[0].0[depth..];
    let last = &entries[entries.len() - 1].0[depth..];
    let shared = first.iter().zip(last).take_while(|(a, b)| a == b).count();

    if shared > 0 {
        let child = encode_node(entries, depth + shared);
        return encode_pair(&hex_to_compact(&first[..shared], false), &node_ref(child));
    }

    let mut slots: Vec<Vec<u8>> = Vec::with_capacity(17);
    let mut value: &[u8] = &[];
    let mut rest = entries;
    if rest[0].0.len() == depth {
        value = rest[0].1;
        rest = &rest[1..];
    }
    for nibble in 0u8..16 {
        let split = rest
            .iter()
            .position(|(key, _)| key[depth] != nibble)
            .unwrap_or(rest.len());
        let (group, tail) = rest.split_at(split);
        if group.is_empty() {
            slots.push(vec![0x80]);
        } else {
            slots.push(node_ref(encode_node(group, depth + 1)));
        }
        rest = tail;
    }
    slots.push(rlp_encode_bytes(value));
    rlp_encode_list_from_encoded(&slots)
}

fn encode_pair(compact_key: &[u8], encoded_value: &[u8]) -> Vec<u8> {
    rlp_encode_list_from_encoded(&[rlp_encode_bytes(compact_key), encoded_value.to_vec()])
}

/// Nodes shorter than a hash are embedded in their parent; others are referenced by hash.
fn node_ref(encoded: Vec<u8>) -> Vec<u8> {
    if encoded.len() < 32 {
        encoded
    } else {
        rlp_encode_bytes(keccak256(&encoded).as_slice())
    }
}

fn to_nibbles(key: &[u8]) -> Vec<u8> {
    key.iter().flat_map(|b| [b >> 4, b & 0x0f]).collect()
}

/// Hex-prefix encoding of a nibble path.
fn hex_to_compact(nibbles: &[u8], leaf: bool) -> Vec<u8> {
    let odd = nibbles.len() % 2 == 1;
    let flag = (if leaf { 2 } else { 0 }) + u8::from(odd);
    let mut out = Vec::with_capacity(nibbles.len() / 2 + 1);
    let body = if odd {
        out.push((flag << 4) | nibbles[0]);
        &nibbles[1..]
    } else {
        out.push(flag << 4);
        nibbles
    };
    out.extend(body.chunks(2).map(|pair| (pair[0] << 4) | pair[1]));
    out
}
