//! RFC 6962 hashing primitives for the tiled Merkle tree.
//!
//! Leaves are hashed with a `0x00` domain-separation prefix, interior nodes
//! with `0x01`. Trees are left-complete: a tree over `n` leaves splits at
//! the largest power of two strictly less than `n`.

use sha2::{Digest, Sha256};

/// A 32-byte SHA-256 output.
pub type Hash = [u8; 32];

const LEAF_PREFIX: u8 = 0x00;
const NODE_PREFIX: u8 = 0x01;

/// Root of the empty tree: `SHA-256("")`.
pub fn empty_root() -> Hash {
    Sha256::digest([]).into()
}

/// Hash of a leaf entry: `SHA-256(0x00 || data)`.
pub fn leaf_hash(data: &[u8]) -> Hash {
    let mut hasher = Sha256::new();
    hasher.update([LEAF_PREFIX]);
    hasher.update(data);
    hasher.finalize().into()
}

/// Hash of an interior node: `SHA-256(0x01 || left || right)`.
pub fn node_hash(left: &Hash, right: &Hash) -> Hash {
    let mut hasher = Sha256::new();
    hasher.update([NODE_PREFIX]);
    hasher.update(left);
    hasher.update(right);
    hasher.finalize().into()
}

/// Combines a non-empty row of subtree roots into the root above them.
///
/// The nodes must all cover subtrees of one uniform width except the last,
/// which may cover fewer leaves (the right edge). Under that shape the
/// left-complete fold below reproduces the RFC 6962 tree head exactly.
pub fn subtree_hash(nodes: &[Hash]) -> Hash {
    match nodes.len() {
        0 => panic!("subtree_hash called with no nodes"),
        1 => nodes[0],
        n => {
            let split = largest_power_of_two_below(n);
            node_hash(&subtree_hash(&nodes[..split]), &subtree_hash(&nodes[split..]))
        }
    }
}

// Largest power of two strictly less than n (n >= 2).
fn largest_power_of_two_below(n: usize) -> usize {
    let mut k = 1;
    while k * 2 < n {
        k *= 2;
    }
    k
}

/// Reference RFC 6962 Merkle tree head over raw leaf data, used to check
/// the tiled computation against first principles.
#[cfg(test)]
pub(crate) fn reference_root(leaves: &[Vec<u8>]) -> Hash {
    fn mth(leaves: &[Vec<u8>]) -> Hash {
        match leaves.len() {
            0 => empty_root(),
            1 => leaf_hash(&leaves[0]),
            n => {
                let split = largest_power_of_two_below(n);
                node_hash(&mth(&leaves[..split]), &mth(&leaves[split..]))
            }
        }
    }
    mth(leaves)
}
