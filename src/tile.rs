use crate::errdata;
use crate::error::Result;
use crate::layout::TILE_WIDTH;
use crate::merkle::Hash;

const HASH_SIZE: usize = 32;

/// One tile's worth of Merkle node hashes.
///
/// The wire form is the plain concatenation of the 32-byte nodes; a file of
/// `32 * k` bytes holds a tile with `k` populated slots.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct HashTile {
    pub nodes: Vec<Hash>,
}

impl HashTile {
    /// Parses a tile from its on-disk form.
    pub fn from_bytes(raw: &[u8]) -> Result<Self> {
        if raw.is_empty() || raw.len() % HASH_SIZE != 0 {
            return errdata!("tile data has invalid length {}", raw.len());
        }
        let count = raw.len() / HASH_SIZE;
        if count > TILE_WIDTH as usize {
            return errdata!("tile holds {count} nodes, more than the maximum {TILE_WIDTH}");
        }
        let nodes = raw
            .chunks_exact(HASH_SIZE)
            .map(|c| {
                let mut h = [0u8; HASH_SIZE];
                h.copy_from_slice(c);
                h
            })
            .collect();
        Ok(Self { nodes })
    }

    /// Serializes the tile to its on-disk form.
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(self.nodes.len() * HASH_SIZE);
        for n in &self.nodes {
            out.extend_from_slice(n);
        }
        out
    }
}
