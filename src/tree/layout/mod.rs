//! # Node Block Layout
//!
//! On-extent logic shared by both node flavors. Every node occupies one
//! fixed-size block:
//!
//! ```text
//! +---------------------+
//! | NodeHeader (24B)    |
//! +---------------------+
//! | Slot Array          |  u16 cell offsets, grows downward
//! +---------------------+
//! | Free Space          |  free_size = free_end - free_start
//! +---------------------+
//! | Cell Content        |  grows upward from the block end
//! +---------------------+
//! ```
//!
//! ## Header Layout (24 bytes)
//!
//! ```text
//! Offset  Size  Field       Description
//! ------  ----  ----------  -------------------------------------------
//! 0       1     node_type   LEAF (0x02) or INTERNAL (0x01)
//! 1       1     field_type  Layout family N0..N3
//! 2       1     flags       Bit 0: level-tail
//! 3       1     level       Height above the leaves (leaves = 0)
//! 4       2     count       Number of cells
//! 6       2     free_start  Offset where free space begins
//! 8       2     free_end    Offset where free space ends
//! 10      6     reserved    Zero
//! 16      8     tail_child  End-sentinel child (level-tail internal only)
//! ```
//!
//! The first two bytes are the load-bearing identity: a block whose
//! field-type byte is not a recognized variant is a fatal decode error.
//!
//! ## Staged Positions over a Flat Cell Array
//!
//! Cells are kept flat and fully keyed, sorted by `(bucket, name, seq)`.
//! Staged positions are derived by grouping: the LEFT index counts distinct
//! buckets before an entry, the MID index distinct names within its bucket,
//! the RIGHT index entries within its `(bucket, name)` group. The helpers
//! here convert between flat indexes and staged positions and plan inserts
//! (which stage a new entry opens, and the position it lands at).
//!
//! ## Cell Movement
//!
//! In-place inserts never move existing cell content: the new cell is
//! carved off the free range and only the slot array shifts. A split
//! rebuilds both halves compactly, so every cell of the split node may
//! move; the tracking layer invalidates the cached value offsets of such a
//! leaf and cursors re-derive them on demand.

mod internal_block;
mod leaf_block;

pub(crate) use internal_block::{ChildLookup, InternalBlock, InternalBlockMut};
pub(crate) use leaf_block::{LeafBlock, LeafBlockMut, LeafLookup};

use eyre::{ensure, Result};
use zerocopy::byteorder::{LittleEndian, U16, U64};
use zerocopy::{FromBytes, Immutable, IntoBytes, KnownLayout, Unaligned};

use crate::extent::{Laddr, NODE_BLOCK_SIZE};
use crate::tree::key::KeyRef;
use crate::tree::position::{SearchPosition, Stage};

pub(crate) const NODE_HEADER_SIZE: usize = 24;
pub(crate) const SLOT_SIZE: usize = 2;

const FLAG_LEVEL_TAIL: u8 = 0x01;

#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum NodeType {
    Internal = 0x01,
    Leaf = 0x02,
}

impl NodeType {
    pub(crate) fn from_byte(b: u8) -> Option<Self> {
        match b {
            0x01 => Some(NodeType::Internal),
            0x02 => Some(NodeType::Leaf),
            _ => None,
        }
    }
}

/// Layout family of a node's key/value encoding, ordered by generality.
/// Only `N0` is produced today; the header reserves the others, and a child
/// never uses a less general family than its parent.
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum FieldType {
    N0 = 0x01,
    N1 = 0x02,
    N2 = 0x03,
    N3 = 0x04,
}

impl FieldType {
    pub(crate) fn from_byte(b: u8) -> Option<Self> {
        match b {
            0x01 => Some(FieldType::N0),
            0x02 => Some(FieldType::N1),
            0x03 => Some(FieldType::N2),
            0x04 => Some(FieldType::N3),
            _ => None,
        }
    }
}

#[repr(C)]
#[derive(Debug, Clone, Copy, FromBytes, IntoBytes, Immutable, KnownLayout, Unaligned)]
pub(crate) struct NodeHeader {
    node_type: u8,
    field_type: u8,
    flags: u8,
    level: u8,
    count: U16<LittleEndian>,
    free_start: U16<LittleEndian>,
    free_end: U16<LittleEndian>,
    reserved: [u8; 6],
    tail_child: U64<LittleEndian>,
}

impl NodeHeader {
    pub(crate) fn init(
        data: &mut [u8],
        node_type: NodeType,
        field_type: FieldType,
        is_level_tail: bool,
        level: u8,
    ) {
        let header = Self {
            node_type: node_type as u8,
            field_type: field_type as u8,
            flags: if is_level_tail { FLAG_LEVEL_TAIL } else { 0 },
            level,
            count: U16::new(0),
            free_start: U16::new(NODE_HEADER_SIZE as u16),
            free_end: U16::new(NODE_BLOCK_SIZE as u16),
            reserved: [0; 6],
            tail_child: U64::new(0),
        };
        data[..NODE_HEADER_SIZE].copy_from_slice(header.as_bytes());
    }

    pub(crate) fn from_bytes(data: &[u8]) -> Result<&Self> {
        ensure!(
            data.len() >= NODE_HEADER_SIZE,
            "buffer too small for node header: {} < {}",
            data.len(),
            NODE_HEADER_SIZE
        );
        Self::ref_from_bytes(&data[..NODE_HEADER_SIZE])
            .map_err(|e| eyre::eyre!("failed to read node header: {:?}", e))
    }

    pub(crate) fn from_bytes_mut(data: &mut [u8]) -> Result<&mut Self> {
        ensure!(
            data.len() >= NODE_HEADER_SIZE,
            "buffer too small for node header: {} < {}",
            data.len(),
            NODE_HEADER_SIZE
        );
        Self::mut_from_bytes(&mut data[..NODE_HEADER_SIZE])
            .map_err(|e| eyre::eyre!("failed to read node header: {:?}", e))
    }

    pub(crate) fn node_type(&self) -> Option<NodeType> {
        NodeType::from_byte(self.node_type)
    }

    pub(crate) fn node_type_raw(&self) -> u8 {
        self.node_type
    }

    pub(crate) fn field_type(&self) -> Option<FieldType> {
        FieldType::from_byte(self.field_type)
    }

    pub(crate) fn field_type_raw(&self) -> u8 {
        self.field_type
    }

    pub(crate) fn is_level_tail(&self) -> bool {
        self.flags & FLAG_LEVEL_TAIL != 0
    }

    pub(crate) fn set_level_tail(&mut self, is_level_tail: bool) {
        if is_level_tail {
            self.flags |= FLAG_LEVEL_TAIL;
        } else {
            self.flags &= !FLAG_LEVEL_TAIL;
        }
    }

    pub(crate) fn level(&self) -> u8 {
        self.level
    }

    pub(crate) fn count(&self) -> u16 {
        self.count.get()
    }

    pub(crate) fn set_count(&mut self, count: u16) {
        self.count = U16::new(count);
    }

    pub(crate) fn free_start(&self) -> u16 {
        self.free_start.get()
    }

    pub(crate) fn set_free_start(&mut self, offset: u16) {
        self.free_start = U16::new(offset);
    }

    pub(crate) fn free_end(&self) -> u16 {
        self.free_end.get()
    }

    pub(crate) fn set_free_end(&mut self, offset: u16) {
        self.free_end = U16::new(offset);
    }

    pub(crate) fn free_size(&self) -> usize {
        self.free_end.get().saturating_sub(self.free_start.get()) as usize
    }

    pub(crate) fn tail_child(&self) -> Laddr {
        self.tail_child.get()
    }

    pub(crate) fn set_tail_child(&mut self, laddr: Laddr) {
        self.tail_child = U64::new(laddr);
    }
}

/// Validates the structural header fields shared by both node flavors.
pub(crate) fn validate_block(data: &[u8], expect: NodeType) -> Result<()> {
    ensure!(
        data.len() == NODE_BLOCK_SIZE,
        "invalid node block size: {} != {}",
        data.len(),
        NODE_BLOCK_SIZE
    );
    let header = NodeHeader::from_bytes(data)?;
    ensure!(
        header.node_type() == Some(expect),
        "expected {:?} block, got type {:#04x}",
        expect,
        header.node_type_raw()
    );
    ensure!(
        header.field_type().is_some(),
        "bad field type {:#04x}",
        header.field_type_raw()
    );
    let free_start = header.free_start() as usize;
    let free_end = header.free_end() as usize;
    ensure!(
        free_start == NODE_HEADER_SIZE + header.count() as usize * SLOT_SIZE,
        "free_start {} does not match count {}",
        free_start,
        header.count()
    );
    ensure!(
        free_start <= free_end && free_end <= NODE_BLOCK_SIZE,
        "corrupt free range: {}..{}",
        free_start,
        free_end
    );
    Ok(())
}

/// Ordered, fully-keyed cell array; implemented by both block flavors so the
/// staged-position arithmetic below is written once.
pub(crate) trait KeyedBlock {
    fn entry_count(&self) -> usize;
    fn entry_key(&self, index: usize) -> KeyRef<'_>;
}

/// Staged position of the entry at `index`.
pub(crate) fn position_of(block: &impl KeyedBlock, index: usize) -> SearchPosition {
    debug_assert!(index < block.entry_count());
    let mut pos = SearchPosition::begin();
    for i in 1..=index {
        advance(&mut pos, block.entry_key(i - 1), block.entry_key(i));
    }
    pos
}

fn advance(pos: &mut SearchPosition, prev: KeyRef<'_>, cur: KeyRef<'_>) {
    debug_assert!(prev < cur, "cells out of order");
    if cur.bucket != prev.bucket {
        pos.left += 1;
        pos.mid = 0;
        pos.right = 0;
    } else if cur.name != prev.name {
        pos.mid += 1;
        pos.right = 0;
    } else {
        pos.right += 1;
    }
}

/// Flat index of the entry at exactly `pos`. The position must name an
/// existing entry.
pub(crate) fn flat_of(block: &impl KeyedBlock, pos: &SearchPosition) -> usize {
    debug_assert!(!pos.is_end());
    let count = block.entry_count();
    let mut cur = SearchPosition::begin();
    for i in 0..count {
        if i > 0 {
            advance(&mut cur, block.entry_key(i - 1), block.entry_key(i));
        }
        if cur == *pos {
            return i;
        }
    }
    unreachable!("position {pos} names no entry");
}

/// First flat index whose staged position is `>= pos`; `count` when every
/// entry is before it. This is where a new entry at `pos` lands.
pub(crate) fn flat_lower_bound(block: &impl KeyedBlock, pos: &SearchPosition) -> usize {
    let count = block.entry_count();
    let mut cur = SearchPosition::begin();
    for i in 0..count {
        if i > 0 {
            advance(&mut cur, block.entry_key(i - 1), block.entry_key(i));
        }
        if cur >= *pos {
            return i;
        }
    }
    count
}

/// Binary search for the first entry with key `>= key`; the flag reports an
/// exact match.
pub(crate) fn lower_bound_flat(block: &impl KeyedBlock, key: KeyRef<'_>) -> (usize, bool) {
    let mut lo = 0usize;
    let mut hi = block.entry_count();
    while lo < hi {
        let mid = (lo + hi) / 2;
        if block.entry_key(mid) < key {
            lo = mid + 1;
        } else {
            hi = mid;
        }
    }
    let eq = lo < block.entry_count() && block.entry_key(lo) == key;
    (lo, eq)
}

/// Stage a new entry at flat index `flat` would open: the outermost
/// component the key does not share with its closest neighbor.
pub(crate) fn stage_of_insert(block: &impl KeyedBlock, key: KeyRef<'_>, flat: usize) -> Stage {
    let count = block.entry_count();
    if count == 0 {
        return Stage::Left;
    }
    let shared_pred = flat
        .checked_sub(1)
        .map(|i| block.entry_key(i).shared_components(&key));
    let shared_succ = (flat < count).then(|| block.entry_key(flat).shared_components(&key));
    let shared = shared_pred
        .into_iter()
        .chain(shared_succ)
        .max()
        .expect("non-empty block has a neighbor");
    match shared {
        2 => Stage::Right,
        1 => Stage::Mid,
        _ => Stage::Left,
    }
}

/// Decides where an insert lands and which stage it opens.
///
/// On input `pos` is the lower-bound position of the key (end when the key
/// sorts after every entry); on output it is the staged position the new
/// entry will occupy, never greater than the input.
pub(crate) fn plan_insert(
    block: &impl KeyedBlock,
    key: KeyRef<'_>,
    pos: &mut SearchPosition,
) -> Stage {
    let count = block.entry_count();
    if count == 0 {
        *pos = SearchPosition::begin();
        return Stage::Left;
    }
    let flat = if pos.is_end() {
        count
    } else {
        flat_of(block, pos)
    };

    let pred = flat.checked_sub(1).map(|i| block.entry_key(i));
    let succ = (flat < count).then(|| block.entry_key(flat));
    debug_assert!(pred.map_or(true, |k| k < key));
    debug_assert!(succ.map_or(true, |k| key < k));

    let stage = stage_of_insert(block, key, flat);
    let shared_pred = pred.map(|k| k.shared_components(&key));
    let shared_succ = succ.map(|k| k.shared_components(&key));

    // the entry joins the neighbor it shares the deeper prefix with; the
    // predecessor wins ties, and a successor anchor means the entry takes
    // over the successor's current position
    *pos = match (shared_pred, shared_succ) {
        (Some(p), s) if p >= s.unwrap_or(0) => {
            let base = position_of(block, flat - 1);
            match stage {
                Stage::Right => SearchPosition::new(base.left, base.mid, base.right + 1),
                Stage::Mid => SearchPosition::new(base.left, base.mid + 1, 0),
                Stage::Left => SearchPosition::new(base.left + 1, 0, 0),
            }
        }
        _ => position_of(block, flat),
    };
    stage
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tree::key::ObjectKey;
    use crate::tree::position::INDEX_END;

    struct Fixture(Vec<ObjectKey>);

    impl KeyedBlock for Fixture {
        fn entry_count(&self) -> usize {
            self.0.len()
        }
        fn entry_key(&self, index: usize) -> KeyRef<'_> {
            self.0[index].as_ref()
        }
    }

    fn fixture() -> Fixture {
        // buckets: 1 (two names, three entries), 2 (one name, one entry)
        Fixture(vec![
            ObjectKey::new(1, b"a", 1).unwrap(),
            ObjectKey::new(1, b"a", 5).unwrap(),
            ObjectKey::new(1, b"b", 0).unwrap(),
            ObjectKey::new(2, b"a", 0).unwrap(),
        ])
    }

    #[test]
    fn node_header_is_24_bytes() {
        assert_eq!(size_of::<NodeHeader>(), NODE_HEADER_SIZE);
    }

    #[test]
    fn field_type_rejects_unknown_bytes() {
        assert_eq!(FieldType::from_byte(0x01), Some(FieldType::N0));
        assert_eq!(FieldType::from_byte(0x00), None);
        assert_eq!(FieldType::from_byte(0x05), None);
    }

    #[test]
    fn positions_group_by_key_components() {
        let f = fixture();
        assert_eq!(position_of(&f, 0), SearchPosition::new(0, 0, 0));
        assert_eq!(position_of(&f, 1), SearchPosition::new(0, 0, 1));
        assert_eq!(position_of(&f, 2), SearchPosition::new(0, 1, 0));
        assert_eq!(position_of(&f, 3), SearchPosition::new(1, 0, 0));
    }

    #[test]
    fn flat_of_inverts_position_of() {
        let f = fixture();
        for i in 0..f.entry_count() {
            assert_eq!(flat_of(&f, &position_of(&f, i)), i);
        }
    }

    #[test]
    fn flat_lower_bound_handles_vacant_positions() {
        let f = fixture();
        // a brand-new name group in bucket 1 sorts before bucket 2
        assert_eq!(flat_lower_bound(&f, &SearchPosition::new(0, 2, 0)), 3);
        assert_eq!(flat_lower_bound(&f, &SearchPosition::new(0, 0, 1)), 1);
        assert_eq!(flat_lower_bound(&f, &SearchPosition::new(2, 0, 0)), 4);
    }

    #[test]
    fn plan_insert_joins_the_predecessor_group() {
        let f = fixture();
        // new seq under (1, "a"), between entries 1 and 2
        let key = ObjectKey::new(1, b"a", 9).unwrap();
        let mut pos = SearchPosition::new(0, 1, 0); // lower_bound landed on (1, "b", 0)
        let stage = plan_insert(&f, key.as_ref(), &mut pos);
        assert_eq!(stage, Stage::Right);
        assert_eq!(pos, SearchPosition::new(0, 0, 2));
    }

    #[test]
    fn plan_insert_opens_a_name_group() {
        let f = fixture();
        let key = ObjectKey::new(1, b"ab", 0).unwrap();
        let mut pos = SearchPosition::new(0, 1, 0);
        let stage = plan_insert(&f, key.as_ref(), &mut pos);
        assert_eq!(stage, Stage::Mid);
        assert_eq!(pos, SearchPosition::new(0, 1, 0));
    }

    #[test]
    fn plan_insert_opens_a_bucket_group_at_the_end() {
        let f = fixture();
        let key = ObjectKey::new(9, b"z", 0).unwrap();
        let mut pos = SearchPosition::end();
        let stage = plan_insert(&f, key.as_ref(), &mut pos);
        assert_eq!(stage, Stage::Left);
        assert_eq!(pos, SearchPosition::new(2, 0, 0));
    }

    #[test]
    fn plan_insert_into_empty_block() {
        let f = Fixture(Vec::new());
        let key = ObjectKey::new(1, b"a", 0).unwrap();
        let mut pos = SearchPosition::end();
        let stage = plan_insert(&f, key.as_ref(), &mut pos);
        assert_eq!(stage, Stage::Left);
        assert_eq!(pos, SearchPosition::begin());
    }

    #[test]
    fn plan_insert_never_moves_the_position_later() {
        let f = fixture();
        // appending to bucket 2's only name: lower bound is end
        let key = ObjectKey::new(2, b"a", 7).unwrap();
        let mut pos = SearchPosition::end();
        let stage = plan_insert(&f, key.as_ref(), &mut pos);
        assert_eq!(stage, Stage::Right);
        assert_eq!(pos, SearchPosition::new(1, 0, 1));
        assert!(pos < SearchPosition::end());
        assert_ne!(pos.left, INDEX_END);
    }
}
