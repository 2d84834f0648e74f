//! # Leaf Block
//!
//! On-extent layout of a leaf node. Each cell stores the metadata record
//! first so that a cell's offset doubles as the value pointer handed to
//! cursors:
//!
//! ```text
//! Cell:
//! +--------------------+----------------------------------+
//! | ObjectMeta (32B)   | key: bucket, seq, name_len, name |
//! +--------------------+----------------------------------+
//! ```
//!
//! Cells are sorted by key. Inserting never moves existing cells; a split
//! rebuilds both halves compactly, after which the tracking layer has
//! invalidated every cached value offset of this leaf and cursors re-derive
//! them on demand.

use std::fmt;

use eyre::{ensure, Result};

use crate::extent::NODE_BLOCK_SIZE;
use crate::tree::key::{KeyRef, ObjectKey};
use crate::tree::meta::{ObjectMeta, OBJECT_META_SIZE};
use crate::tree::position::{MatchHistory, MatchKind, SearchPosition, Stage};

use super::{
    flat_lower_bound, flat_of, lower_bound_flat, plan_insert, position_of, stage_of_insert,
    validate_block, FieldType, KeyedBlock, NodeHeader, NodeType, NODE_HEADER_SIZE, SLOT_SIZE,
};

/// Result of a leaf-level lower bound: the staged position, the value
/// offset when the position names an entry, and the final match kind.
#[derive(Debug, Clone, Copy)]
pub(crate) struct LeafLookup {
    pub pos: SearchPosition,
    pub value_off: Option<u16>,
    pub match_kind: MatchKind,
}

pub(crate) struct LeafBlock<'a> {
    data: &'a [u8],
}

pub(crate) struct LeafBlockMut<'a> {
    data: &'a mut [u8],
}

impl<'a> LeafBlock<'a> {
    pub(crate) fn from_block(data: &'a [u8]) -> Result<Self> {
        validate_block(data, NodeType::Leaf)?;
        Ok(Self { data })
    }

    fn header(&self) -> &NodeHeader {
        NodeHeader::from_bytes(self.data).expect("validated in from_block")
    }

    pub(crate) fn count(&self) -> usize {
        self.header().count() as usize
    }

    pub(crate) fn is_empty(&self) -> bool {
        self.count() == 0
    }

    pub(crate) fn free_size(&self) -> usize {
        self.header().free_size()
    }

    pub(crate) fn is_level_tail(&self) -> bool {
        self.header().is_level_tail()
    }

    pub(crate) fn field_type(&self) -> FieldType {
        self.header().field_type().expect("validated in from_block")
    }

    fn cell_offset(&self, index: usize) -> usize {
        debug_assert!(index < self.count());
        let slot = NODE_HEADER_SIZE + index * SLOT_SIZE;
        u16::from_le_bytes(self.data[slot..slot + SLOT_SIZE].try_into().unwrap()) as usize
    }

    pub(crate) fn key_at(&self, index: usize) -> KeyRef<'a> {
        let offset = self.cell_offset(index) + OBJECT_META_SIZE;
        KeyRef::decode(&self.data[offset..])
    }

    pub(crate) fn meta_at(&self, index: usize) -> ObjectMeta {
        ObjectMeta::read_at(self.data, self.cell_offset(index))
    }

    /// Value pointer of the entry at `pos`: the byte offset of its metadata
    /// record within this extent.
    pub(crate) fn value_offset(&self, pos: &SearchPosition) -> u16 {
        let flat = flat_of(self, pos);
        self.cell_offset(flat) as u16
    }

    pub(crate) fn meta_at_offset(&self, offset: u16) -> ObjectMeta {
        debug_assert!((offset as usize) + OBJECT_META_SIZE <= NODE_BLOCK_SIZE);
        ObjectMeta::read_at(self.data, offset as usize)
    }

    pub(crate) fn key_at_position(&self, pos: &SearchPosition) -> KeyRef<'a> {
        self.key_at(flat_of(self, pos))
    }

    pub(crate) fn largest_key(&self) -> KeyRef<'a> {
        debug_assert!(!self.is_empty());
        self.key_at(self.count() - 1)
    }

    /// Position and value pointer of the largest entry.
    pub(crate) fn largest_value(&self) -> (SearchPosition, u16) {
        debug_assert!(!self.is_empty());
        let last = self.count() - 1;
        (position_of(self, last), self.cell_offset(last) as u16)
    }

    pub(crate) fn lower_bound(&self, key: KeyRef<'_>, history: &mut MatchHistory) -> LeafLookup {
        let (flat, eq) = lower_bound_flat(self, key);
        if flat == self.count() {
            return LeafLookup {
                pos: SearchPosition::end(),
                value_off: None,
                match_kind: MatchKind::Lt,
            };
        }
        record_history(history, key, self.entry_key(flat));
        LeafLookup {
            pos: position_of(self, flat),
            value_off: Some(self.cell_offset(flat) as u16),
            match_kind: if eq { MatchKind::Eq } else { MatchKind::Lt },
        }
    }

    /// Plans an insert at the lower-bound position `pos`, adjusting it to
    /// the staged position the entry will occupy. Returns the stage the
    /// insert opens and the total space it needs.
    pub(crate) fn evaluate_insert(
        &self,
        key: KeyRef<'_>,
        history: &MatchHistory,
        pos: &mut SearchPosition,
    ) -> (Stage, usize) {
        debug_assert!(history.get(Stage::Right) != Some(MatchKind::Eq));
        let stage = plan_insert(self, key, pos);
        let size = SLOT_SIZE + OBJECT_META_SIZE + key.encoded_len();
        (stage, size)
    }
}

pub(crate) fn record_history(history: &mut MatchHistory, key: KeyRef<'_>, entry: KeyRef<'_>) {
    if key.bucket != entry.bucket {
        history.set(Stage::Left, MatchKind::Lt);
        return;
    }
    history.set(Stage::Left, MatchKind::Eq);
    if key.name != entry.name {
        history.set(Stage::Mid, MatchKind::Lt);
        return;
    }
    history.set(Stage::Mid, MatchKind::Eq);
    history.set(
        Stage::Right,
        if key.seq == entry.seq {
            MatchKind::Eq
        } else {
            MatchKind::Lt
        },
    );
}

impl KeyedBlock for LeafBlock<'_> {
    fn entry_count(&self) -> usize {
        self.count()
    }
    fn entry_key(&self, index: usize) -> KeyRef<'_> {
        self.key_at(index)
    }
}

impl fmt::Display for LeafBlock<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for i in 0..self.count() {
            let meta = self.meta_at(i);
            writeln!(
                f,
                "{} {} => laddr={:#x} len={} gen={}",
                position_of(self, i),
                self.key_at(i),
                meta.data_laddr,
                meta.data_len,
                meta.generation
            )?;
        }
        Ok(())
    }
}

impl<'a> LeafBlockMut<'a> {
    pub(crate) fn from_block(data: &'a mut [u8]) -> Result<Self> {
        validate_block(data, NodeType::Leaf)?;
        Ok(Self { data })
    }

    /// Formats a fresh leaf block. Leaves are always level 0.
    pub(crate) fn init(
        data: &'a mut [u8],
        field_type: FieldType,
        is_level_tail: bool,
    ) -> Result<Self> {
        ensure!(
            data.len() == NODE_BLOCK_SIZE,
            "invalid node block size: {} != {}",
            data.len(),
            NODE_BLOCK_SIZE
        );
        NodeHeader::init(data, NodeType::Leaf, field_type, is_level_tail, 0);
        Ok(Self { data })
    }

    pub(crate) fn as_read(&self) -> LeafBlock<'_> {
        LeafBlock { data: self.data }
    }

    fn header_mut(&mut self) -> &mut NodeHeader {
        NodeHeader::from_bytes_mut(self.data).expect("validated in from_block")
    }

    pub(crate) fn set_level_tail(&mut self, is_level_tail: bool) {
        self.header_mut().set_level_tail(is_level_tail);
    }

    /// Inserts at the planned staged position; returns the value offset of
    /// the new entry.
    pub(crate) fn insert(
        &mut self,
        key: KeyRef<'_>,
        meta: &ObjectMeta,
        pos: &SearchPosition,
    ) -> Result<u16> {
        let flat = flat_lower_bound(&self.as_read(), pos);
        let offset = self.insert_at_flat(flat, key, meta)?;
        debug_assert_eq!(position_of(&self.as_read(), flat), *pos);
        Ok(offset)
    }

    fn insert_at_flat(&mut self, flat: usize, key: KeyRef<'_>, meta: &ObjectMeta) -> Result<u16> {
        let read = self.as_read();
        let count = read.count();
        debug_assert!(flat <= count);
        debug_assert!(flat == 0 || read.key_at(flat - 1) < key);
        debug_assert!(flat == count || key < read.key_at(flat));

        let header = read.header();
        let free_start = header.free_start() as usize;
        let free_end = header.free_end() as usize;
        let cell_size = OBJECT_META_SIZE + key.encoded_len();
        ensure!(
            header.free_size() >= SLOT_SIZE + cell_size,
            "leaf cell does not fit: need {}, free {}",
            SLOT_SIZE + cell_size,
            header.free_size()
        );

        let cell_offset = free_end - cell_size;
        meta.write_at(self.data, cell_offset);
        key.encode_into(&mut self.data[cell_offset + OBJECT_META_SIZE..cell_offset + cell_size]);

        let slot = NODE_HEADER_SIZE + flat * SLOT_SIZE;
        self.data.copy_within(slot..free_start, slot + SLOT_SIZE);
        self.data[slot..slot + SLOT_SIZE].copy_from_slice(&(cell_offset as u16).to_le_bytes());

        let header = self.header_mut();
        header.set_count(count as u16 + 1);
        header.set_free_start((free_start + SLOT_SIZE) as u16);
        header.set_free_end(cell_offset as u16);
        Ok(cell_offset as u16)
    }

    /// Splits this block into `right_data` and inserts the pending entry on
    /// whichever side owns its position. Both halves are rebuilt compactly.
    ///
    /// Returns the split position in pre-insert coordinates, whether the
    /// insert landed left, the value offset, and the insert's stage in the
    /// destination block's coordinates; when the insert landed right,
    /// `insert_pos` is rewritten in those coordinates too. The level-tail
    /// role moves to the right sibling.
    pub(crate) fn split_insert(
        &mut self,
        right_data: &mut [u8],
        key: KeyRef<'_>,
        meta: &ObjectMeta,
        insert_pos: &mut SearchPosition,
    ) -> Result<(SearchPosition, bool, u16, Stage)> {
        let read = self.as_read();
        let count = read.count();
        ensure!(count >= 2, "cannot split a leaf with {} entries", count);

        let flat = flat_lower_bound(&read, insert_pos);
        let new_size = SLOT_SIZE + OBJECT_META_SIZE + key.encoded_len();
        let split_at = choose_split(count, flat, new_size, |i| {
            SLOT_SIZE + OBJECT_META_SIZE + read.key_at(i).encoded_len()
        });
        let split_pos = position_of(&read, split_at);
        let is_insert_left = flat < split_at;
        let field_type = read.field_type();
        let was_level_tail = read.is_level_tail();

        let entries: Vec<(ObjectKey, ObjectMeta)> = (0..count)
            .map(|i| (read.key_at(i).to_owned(), read.meta_at(i)))
            .collect();

        let mut right = LeafBlockMut::init(right_data, field_type, was_level_tail)?;
        for (i, (entry_key, entry_meta)) in entries[split_at..].iter().enumerate() {
            right.insert_at_flat(i, entry_key.as_ref(), entry_meta)?;
        }

        NodeHeader::init(self.data, NodeType::Leaf, field_type, false, 0);
        for (i, (entry_key, entry_meta)) in entries[..split_at].iter().enumerate() {
            self.insert_at_flat(i, entry_key.as_ref(), entry_meta)?;
        }

        let (value_off, stage) = if is_insert_left {
            let stage = stage_of_insert(&self.as_read(), key, flat);
            (self.insert_at_flat(flat, key, meta)?, stage)
        } else {
            let stage = stage_of_insert(&right.as_read(), key, flat - split_at);
            let off = right.insert_at_flat(flat - split_at, key, meta)?;
            *insert_pos = position_of(&right.as_read(), flat - split_at);
            (off, stage)
        };
        Ok((split_pos, is_insert_left, value_off, stage))
    }
}

/// Picks the split index balancing the byte load of both halves, counting
/// the pending insert on the side it will land on.
pub(crate) fn choose_split(
    count: usize,
    insert_flat: usize,
    insert_size: usize,
    entry_size: impl Fn(usize) -> usize,
) -> usize {
    let capacity = NODE_BLOCK_SIZE - NODE_HEADER_SIZE;
    let total: usize = (0..count).map(&entry_size).sum();

    let mut best: Option<(usize, usize)> = None;
    let mut left = 0usize;
    for split_at in 1..count {
        left += entry_size(split_at - 1);
        let mut left_load = left;
        let mut right_load = total - left;
        if insert_flat < split_at {
            left_load += insert_size;
        } else {
            right_load += insert_size;
        }
        if left_load > capacity || right_load > capacity {
            continue;
        }
        let imbalance = left_load.abs_diff(right_load);
        if best.map_or(true, |(_, b)| imbalance < b) {
            best = Some((split_at, imbalance));
        }
    }
    let (split_at, _) = best.expect("bounded cells always admit a split point");
    split_at
}

impl KeyedBlock for LeafBlockMut<'_> {
    fn entry_count(&self) -> usize {
        self.as_read().count()
    }
    fn entry_key(&self, index: usize) -> KeyRef<'_> {
        let offset = self.as_read().cell_offset(index) + OBJECT_META_SIZE;
        KeyRef::decode(&self.data[offset..])
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tree::key::ObjectKey;

    fn block() -> Vec<u8> {
        vec![0u8; NODE_BLOCK_SIZE]
    }

    fn meta(gen: u32) -> ObjectMeta {
        ObjectMeta {
            generation: gen,
            ..ObjectMeta::default()
        }
    }

    fn insert(data: &mut [u8], bucket: u64, name: &[u8], seq: u64, gen: u32) -> u16 {
        let key = ObjectKey::new(bucket, name, seq).unwrap();
        let mut leaf = LeafBlockMut::from_block(data).unwrap();
        let mut pos = leaf
            .as_read()
            .lower_bound(key.as_ref(), &mut MatchHistory::default())
            .pos;
        let (_, _) = leaf.as_read().evaluate_insert(
            key.as_ref(),
            &MatchHistory::default(),
            &mut pos,
        );
        leaf.insert(key.as_ref(), &meta(gen), &pos).unwrap()
    }

    #[test]
    fn init_produces_an_empty_tail_leaf() {
        let mut data = block();
        LeafBlockMut::init(&mut data, FieldType::N0, true).unwrap();

        let leaf = LeafBlock::from_block(&data).unwrap();
        assert!(leaf.is_empty());
        assert!(leaf.is_level_tail());
        assert_eq!(leaf.free_size(), NODE_BLOCK_SIZE - NODE_HEADER_SIZE);
    }

    #[test]
    fn inserts_stay_sorted_regardless_of_order() {
        let mut data = block();
        LeafBlockMut::init(&mut data, FieldType::N0, true).unwrap();

        insert(&mut data, 2, b"b", 0, 0);
        insert(&mut data, 1, b"a", 5, 1);
        insert(&mut data, 1, b"a", 1, 2);
        insert(&mut data, 1, b"c", 0, 3);

        let leaf = LeafBlock::from_block(&data).unwrap();
        assert_eq!(leaf.count(), 4);
        let keys: Vec<_> = (0..4).map(|i| leaf.key_at(i).to_owned()).collect();
        let mut sorted = keys.clone();
        sorted.sort();
        assert_eq!(keys, sorted);
        assert_eq!(position_of(&leaf, 3), SearchPosition::new(1, 0, 0));
    }

    #[test]
    fn lower_bound_reports_match_and_value() {
        let mut data = block();
        LeafBlockMut::init(&mut data, FieldType::N0, true).unwrap();
        let off = insert(&mut data, 1, b"a", 5, 7);

        let leaf = LeafBlock::from_block(&data).unwrap();
        let key = ObjectKey::new(1, b"a", 5).unwrap();
        let mut history = MatchHistory::default();
        let found = leaf.lower_bound(key.as_ref(), &mut history);
        assert_eq!(found.match_kind, MatchKind::Eq);
        assert_eq!(found.value_off, Some(off));
        assert_eq!(leaf.meta_at_offset(off).generation, 7);
        assert_eq!(history.get(Stage::Right), Some(MatchKind::Eq));

        let miss = ObjectKey::new(9, b"z", 0).unwrap();
        let found = leaf.lower_bound(miss.as_ref(), &mut MatchHistory::default());
        assert!(found.pos.is_end());
        assert_eq!(found.value_off, None);
    }

    #[test]
    fn existing_cells_do_not_move_on_insert() {
        let mut data = block();
        LeafBlockMut::init(&mut data, FieldType::N0, true).unwrap();
        let first = insert(&mut data, 5, b"m", 0, 0);

        // insert before and after the existing entry
        insert(&mut data, 1, b"a", 0, 1);
        insert(&mut data, 9, b"z", 0, 2);

        let leaf = LeafBlock::from_block(&data).unwrap();
        assert_eq!(leaf.value_offset(&SearchPosition::new(1, 0, 0)), first);
    }

    #[test]
    fn split_moves_the_tail_and_its_role() {
        let mut data = block();
        LeafBlockMut::init(&mut data, FieldType::N0, true).unwrap();
        for i in 0..6 {
            insert(&mut data, i, b"n", 0, i as u32);
        }

        let mut right_data = block();
        let key = ObjectKey::new(2, b"n", 5).unwrap();
        let mut pos = SearchPosition::new(2, 0, 1);
        let (split_pos, is_left, _off, _stage) = LeafBlockMut::from_block(&mut data)
            .unwrap()
            .split_insert(&mut right_data, key.as_ref(), &meta(99), &mut pos)
            .unwrap();

        let left = LeafBlock::from_block(&data).unwrap();
        let right = LeafBlock::from_block(&right_data).unwrap();
        assert!(!left.is_level_tail());
        assert!(right.is_level_tail());
        assert_eq!(left.count() + right.count(), 7);
        assert!(left.largest_key() < right.key_at(0));
        assert!(!split_pos.is_end());
        // every key is reachable on one side
        let total: Vec<_> = (0..left.count())
            .map(|i| left.key_at(i).to_owned())
            .chain((0..right.count()).map(|i| right.key_at(i).to_owned()))
            .collect();
        assert_eq!(total.len(), 7);
        let mut sorted = total.clone();
        sorted.sort();
        assert_eq!(total, sorted);
        // the pending insert landed on exactly one side
        let inserted = ObjectKey::new(2, b"n", 5).unwrap();
        let on_left = (0..left.count()).any(|i| left.key_at(i) == inserted.as_ref());
        let on_right = (0..right.count()).any(|i| right.key_at(i) == inserted.as_ref());
        assert!(on_left != on_right);
        assert_eq!(on_left, is_left);
    }

    #[test]
    fn split_rebases_a_right_side_insert() {
        let mut data = block();
        LeafBlockMut::init(&mut data, FieldType::N0, true).unwrap();
        for i in 0..4 {
            insert(&mut data, i, b"n", 0, 0);
        }

        let mut right_data = block();
        // sorts after everything: lands in the right sibling
        let key = ObjectKey::new(9, b"z", 1).unwrap();
        let mut pos = SearchPosition::new(4, 0, 0);
        let (_, is_left, off, _stage) = LeafBlockMut::from_block(&mut data)
            .unwrap()
            .split_insert(&mut right_data, key.as_ref(), &meta(42), &mut pos)
            .unwrap();

        assert!(!is_left);
        let right = LeafBlock::from_block(&right_data).unwrap();
        assert_eq!(right.key_at_position(&pos), key.as_ref());
        assert_eq!(right.meta_at_offset(off).generation, 42);
    }

    #[test]
    fn split_leaves_both_halves_compact() {
        let mut data = block();
        LeafBlockMut::init(&mut data, FieldType::N0, true).unwrap();
        for i in 0..4 {
            insert(&mut data, i, b"n", 0, 0);
        }

        let mut right_data = block();
        let key = ObjectKey::new(9, b"z", 1).unwrap();
        let mut pos = SearchPosition::new(4, 0, 0);
        LeafBlockMut::from_block(&mut data)
            .unwrap()
            .split_insert(&mut right_data, key.as_ref(), &meta(0), &mut pos)
            .unwrap();

        // all the space the moved entries held is free again on the left,
        // so a later insert routed here still fits
        for side in [&data, &right_data] {
            let block = LeafBlock::from_block(side).unwrap();
            let used: usize = (0..block.count())
                .map(|i| SLOT_SIZE + OBJECT_META_SIZE + block.key_at(i).encoded_len())
                .sum();
            assert_eq!(block.free_size(), NODE_BLOCK_SIZE - NODE_HEADER_SIZE - used);
        }
    }
}
