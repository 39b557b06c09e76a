use std::io::Cursor;

use byteorder::{BigEndian, ReadBytesExt, WriteBytesExt};

use crate::errdata;
use crate::error::Result;
use crate::merkle::{self, Hash};

/// A leaf entry supplied by the caller.
///
/// The storage engine treats entries as opaque: `marshal_bundle` produces
/// the bytes written into the entry bundle for the entry's assigned
/// sequence number, and `leaf_hash` the 32-byte Merkle leaf hash committed
/// to by the tree.
pub trait Entry: Send {
    /// Serializes the entry for inclusion in a bundle at position `index`.
    fn marshal_bundle(&self, index: u64) -> Vec<u8>;

    /// The Merkle leaf hash of this entry.
    fn leaf_hash(&self) -> Hash;
}

/// The default entry type: opaque bytes, bundled with a big-endian `u16`
/// length prefix and hashed as an RFC 6962 leaf.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PlainEntry {
    data: Vec<u8>,
}

impl PlainEntry {
    pub fn new(data: impl Into<Vec<u8>>) -> Self {
        Self { data: data.into() }
    }

    pub fn data(&self) -> &[u8] {
        &self.data
    }
}

impl Entry for PlainEntry {
    fn marshal_bundle(&self, _index: u64) -> Vec<u8> {
        // The framing caps entries at u16::MAX bytes.
        assert!(
            self.data.len() <= u16::MAX as usize,
            "entry of {} bytes exceeds bundle framing",
            self.data.len()
        );
        let mut out = Vec::with_capacity(2 + self.data.len());
        out.write_u16::<BigEndian>(self.data.len() as u16)
            .expect("write to Vec");
        out.extend_from_slice(&self.data);
        out
    }

    fn leaf_hash(&self) -> Hash {
        merkle::leaf_hash(&self.data)
    }
}

/// Parses a bundle of [`PlainEntry`] serializations back into the leaf
/// hashes of its entries. This is the inverse of `marshal_bundle` and the
/// default bundle hasher for the migration lifecycle.
pub fn bundle_leaf_hashes(bundle: &[u8]) -> Result<Vec<Hash>> {
    let mut hashes = Vec::new();
    let mut cur = Cursor::new(bundle);
    while (cur.position() as usize) < bundle.len() {
        let len = cur
            .read_u16::<BigEndian>()
            .map_err(|e| crate::error::Error::InvalidData(format!("truncated entry header: {e}")))?
            as usize;
        let start = cur.position() as usize;
        let end = start + len;
        if end > bundle.len() {
            return errdata!(
                "entry at offset {start} claims {len} bytes but only {} remain",
                bundle.len() - start
            );
        }
        hashes.push(merkle::leaf_hash(&bundle[start..end]));
        cur.set_position(end as u64);
    }
    Ok(hashes)
}
