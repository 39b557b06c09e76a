//! Folds newly sequenced leaf hashes into the tiled Merkle tree.
//!
//! Tiles store one node row every [`TILE_HEIGHT`](crate::layout::TILE_HEIGHT)
//! tree levels: node `j` of tile `(level, index)` is the root of the
//! complete subtree covering leaves
//! `[(index*256 + j) * 256^level, (index*256 + j + 1) * 256^level)`.
//! Only roots of complete subtrees are ever stored; right-edge roots are
//! recomputed on demand from the tiles below them.

use std::collections::BTreeMap;

use crate::errdata;
use crate::error::Result;
use crate::layout::{self, TileId, TILE_WIDTH};
use crate::merkle::{self, Hash};
use crate::tile::HashTile;

/// The outcome of an integration step: the new tree size and root, plus
/// every tile created or extended by the new leaves.
#[derive(Debug)]
pub struct Integrated {
    pub size: u64,
    pub root: Hash,
    pub tiles: BTreeMap<TileId, HashTile>,
}

/// Integrates a contiguous run of new leaf hashes starting at sequence
/// number `from_seq` into the tree.
///
/// `read_tiles` resolves tile IDs against current storage for a given tree
/// size (`None` = absent). It is consulted for the stored prefix of the
/// first tile touched at each level, and for untouched right-edge tiles
/// when computing the new root.
pub fn integrate<F>(mut read_tiles: F, from_seq: u64, leaf_hashes: &[Hash]) -> Result<Integrated>
where
    F: FnMut(&[TileId], u64) -> Result<Vec<Option<HashTile>>>,
{
    let new_size = from_seq + leaf_hashes.len() as u64;
    let mut tiles: BTreeMap<TileId, HashTile> = BTreeMap::new();

    // Row of new complete-subtree roots at the current tile level. At
    // level l it covers row positions [from_seq >> 8l, new_size >> 8l).
    let mut row: Vec<Hash> = leaf_hashes.to_vec();
    let mut level: u64 = 0;
    while !row.is_empty() {
        let from = complete_nodes(from_seq, level);
        let to = complete_nodes(new_size, level);

        let first_tile = from / TILE_WIDTH;
        let last_tile = (to - 1) / TILE_WIDTH;
        for t in first_tile..=last_tile {
            let start = t * TILE_WIDTH;
            let mut nodes: Vec<Hash> = Vec::with_capacity(TILE_WIDTH as usize);
            if start < from {
                // The first touched tile continues a stored partial tile.
                let want = (from - start) as usize;
                let id = TileId::new(level, t);
                let got = read_tiles(&[id], from_seq)?
                    .into_iter()
                    .next()
                    .flatten()
                    .ok_or_else(|| {
                        crate::error::Error::InvalidData(format!(
                            "missing {id} needed to extend the tree"
                        ))
                    })?;
                if got.nodes.len() < want {
                    return errdata!("{id} has {} nodes, need {want}", got.nodes.len());
                }
                nodes.extend_from_slice(&got.nodes[..want]);
            }
            let lo = start.max(from);
            let hi = to.min(start + TILE_WIDTH);
            nodes.extend_from_slice(&row[(lo - from) as usize..(hi - from) as usize]);
            tiles.insert(TileId::new(level, t), HashTile { nodes });
        }

        // Roots of tiles completed by this batch become the next row up.
        let next_from = complete_nodes(from_seq, level + 1);
        let next_to = complete_nodes(new_size, level + 1);
        let mut next_row = Vec::with_capacity((next_to - next_from) as usize);
        for t in next_from..next_to {
            let tile = &tiles[&TileId::new(level, t)];
            next_row.push(merkle::subtree_hash(&tile.nodes));
        }
        row = next_row;
        level += 1;
    }

    let root = if new_size == 0 {
        merkle::empty_root()
    } else {
        tree_root(&mut read_tiles, &tiles, new_size)?
    };

    Ok(Integrated {
        size: new_size,
        root,
        tiles,
    })
}

// Number of complete row positions at a tile level: nodes exist at level
// l for every full 256^l-leaf subtree. The level can exceed the widest
// possible u64 tree, so guard the shift.
fn complete_nodes(size: u64, level: u64) -> u64 {
    if level >= 8 {
        0
    } else {
        size >> (level * layout::TILE_HEIGHT)
    }
}

// Smallest tile level whose single tile spans the whole tree.
fn top_level(size: u64) -> u64 {
    let mut level = 0;
    while level < 7 && (size - 1) >> ((level + 1) * layout::TILE_HEIGHT) > 0 {
        level += 1;
    }
    level
}

// Root of a tree of `size` leaves, combining stored full-subtree roots
// with recomputed right-edge roots.
fn tree_root<F>(read_tiles: &mut F, updated: &BTreeMap<TileId, HashTile>, size: u64) -> Result<Hash>
where
    F: FnMut(&[TileId], u64) -> Result<Vec<Option<HashTile>>>,
{
    subtree_root(read_tiles, updated, size, top_level(size), 0, size)
}

// Root of the subtree under tile `(level, index)` holding `sub_size`
// leaves, 1 ..= 256^(level+1).
fn subtree_root<F>(
    read_tiles: &mut F,
    updated: &BTreeMap<TileId, HashTile>,
    tree_size: u64,
    level: u64,
    index: u64,
    sub_size: u64,
) -> Result<Hash>
where
    F: FnMut(&[TileId], u64) -> Result<Vec<Option<HashTile>>>,
{
    if level == 0 {
        let nodes = tile_nodes(read_tiles, updated, tree_size, TileId::new(level, index))?;
        if nodes.len() < sub_size as usize {
            return errdata!(
                "tile(0, {index}) has {} nodes, need {sub_size}",
                nodes.len()
            );
        }
        return Ok(merkle::subtree_hash(&nodes[..sub_size as usize]));
    }

    let child_width = 1u64 << (level * layout::TILE_HEIGHT);
    let full_children = sub_size / child_width;
    let rem = sub_size % child_width;

    let mut hashes: Vec<Hash> = Vec::with_capacity(full_children as usize + 1);
    if full_children > 0 {
        let nodes = tile_nodes(read_tiles, updated, tree_size, TileId::new(level, index))?;
        if nodes.len() < full_children as usize {
            return errdata!(
                "tile({level}, {index}) has {} nodes, need {full_children}",
                nodes.len()
            );
        }
        hashes.extend_from_slice(&nodes[..full_children as usize]);
    }
    if rem > 0 {
        hashes.push(subtree_root(
            read_tiles,
            updated,
            tree_size,
            level - 1,
            index * TILE_WIDTH + full_children,
            rem,
        )?);
    }
    Ok(merkle::subtree_hash(&hashes))
}

// Nodes of a tile, preferring this integration's updated copy over storage.
fn tile_nodes<F>(
    read_tiles: &mut F,
    updated: &BTreeMap<TileId, HashTile>,
    tree_size: u64,
    id: TileId,
) -> Result<Vec<Hash>>
where
    F: FnMut(&[TileId], u64) -> Result<Vec<Option<HashTile>>>,
{
    if let Some(tile) = updated.get(&id) {
        return Ok(tile.nodes.clone());
    }
    let tile = read_tiles(&[id], tree_size)?
        .into_iter()
        .next()
        .flatten()
        .ok_or_else(|| {
            crate::error::Error::InvalidData(format!("missing {id} needed to compute the root"))
        })?;
    Ok(tile.nodes)
}
