//! Pure path and index arithmetic for the tiled log layout.
//!
//! Everything here is computed from indices alone; no I/O. Tile and bundle
//! indices are chunked into base-1000 groups to keep directory fan-out
//! bounded: index 123456789 becomes `x123/x456/789`, with every group but
//! the last prefixed by `x`. Partial (right-edge) files carry a `.p/<k>`
//! suffix, `k` being the number of populated slots.

/// Number of hashes in a fully populated tile.
pub const TILE_WIDTH: u64 = 256;

/// Number of entries in a fully populated entry bundle.
pub const ENTRY_BUNDLE_WIDTH: u64 = 256;

/// Tree levels spanned by one tile level: tiles store every 8th node row.
pub const TILE_HEIGHT: u64 = 8;

/// Path of the published checkpoint, relative to the log root.
pub const CHECKPOINT_PATH: &str = "checkpoint";

/// Directory holding internal log state (tree state, version, lock files).
pub const STATE_DIR: &str = ".state";

/// Identifies a single tile: `level` counts tile rows from the leaves up,
/// `index` counts tiles within the row from the left.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct TileId {
    pub level: u64,
    pub index: u64,
}

impl TileId {
    pub fn new(level: u64, index: u64) -> Self {
        Self { level, index }
    }
}

impl std::fmt::Display for TileId {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        write!(f, "tile({}, {})", self.level, self.index)
    }
}

// Dense base-1000 chunking of an index, most significant group first.
fn fmt_index(n: u64) -> String {
    let mut out = format!("{:03}", n % 1000);
    let mut n = n / 1000;
    while n > 0 {
        out = format!("x{:03}/{out}", n % 1000);
        n /= 1000;
    }
    out
}

// Appends the partial suffix for partially populated files.
fn partial_suffix(partial: u8) -> String {
    if partial == 0 {
        String::new()
    } else {
        format!(".p/{partial}")
    }
}

/// Relative path of the tile at `(level, index)`; `partial == 0` means the
/// fully populated tile.
pub fn tile_path(level: u64, index: u64, partial: u8) -> String {
    format!("tile/{level}/{}{}", fmt_index(index), partial_suffix(partial))
}

/// Relative path of the entry bundle at `index`; `partial == 0` means the
/// fully populated bundle.
pub fn entries_path(index: u64, partial: u8) -> String {
    format!("tile/entries/{}{}", fmt_index(index), partial_suffix(partial))
}

/// Number of populated nodes in the tile at `(level, index)` for a tree of
/// `tree_size` leaves, or 0 if that tile is fully populated or entirely
/// beyond the edge of the tree.
pub fn partial_tile_size(level: u64, index: u64, tree_size: u64) -> u8 {
    let size_at_level = if level >= 8 {
        0
    } else {
        tree_size >> (level * TILE_HEIGHT)
    };
    let full_tiles = size_at_level / TILE_WIDTH;
    if index == full_tiles {
        (size_at_level % TILE_WIDTH) as u8
    } else {
        0
    }
}

/// One entry bundle's contribution to a contiguous range of sequence
/// numbers: read bundle `index` (at partial size `partial`, 0 = full) and
/// take `n` entries starting at in-bundle offset `first`.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct BundleRange {
    pub index: u64,
    pub partial: u8,
    pub first: u64,
    pub n: u64,
}

/// Iterates over the entry bundles covering sequence range `[from, to)` in
/// a log of `tree_size` entries. `tree_size` determines whether the last
/// touched bundle exists as a full or a partial file.
pub fn range(from: u64, to: u64, tree_size: u64) -> impl Iterator<Item = BundleRange> {
    let mut pos = from;
    std::iter::from_fn(move || {
        if pos >= to {
            return None;
        }
        let index = pos / ENTRY_BUNDLE_WIDTH;
        let bundle_start = index * ENTRY_BUNDLE_WIDTH;
        let bundle_end = (bundle_start + ENTRY_BUNDLE_WIDTH).min(to);
        let partial = if bundle_start + ENTRY_BUNDLE_WIDTH <= tree_size {
            0
        } else {
            (tree_size - bundle_start) as u8
        };
        let ri = BundleRange {
            index,
            partial,
            first: pos - bundle_start,
            n: bundle_end - pos,
        };
        pos = bundle_end;
        Some(ri)
    })
}
