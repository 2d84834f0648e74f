//! # Internal Block
//!
//! On-extent layout of an internal node. Each cell pairs a separator key
//! with the address of the child owning that key range:
//!
//! ```text
//! Cell:
//! +------------------+----------------------------------+
//! | child laddr (8B) | key: bucket, seq, name_len, name |
//! +------------------+----------------------------------+
//! ```
//!
//! The separator is the largest key of the child, so a search routes to the
//! first cell whose key is `>= `the search key. A level-tail internal node
//! additionally owns the end-sentinel child in the header's `tail_child`
//! field; keys beyond every separator route there.

use std::fmt;

use eyre::{ensure, Result};

use crate::extent::{Laddr, NODE_BLOCK_SIZE};
use crate::tree::key::{KeyRef, ObjectKey};
use crate::tree::position::{MatchHistory, SearchPosition, Stage};

use super::leaf_block::{choose_split, record_history};
use super::{
    flat_lower_bound, flat_of, lower_bound_flat, plan_insert, position_of, stage_of_insert,
    validate_block, FieldType, KeyedBlock, NodeHeader, NodeType, NODE_HEADER_SIZE, SLOT_SIZE,
};

const CHILD_ADDR_SIZE: usize = 8;

/// Result of an internal-level lower bound: the child slot position and the
/// child's address.
#[derive(Debug, Clone, Copy)]
pub(crate) struct ChildLookup {
    pub pos: SearchPosition,
    pub child: Laddr,
}

pub(crate) struct InternalBlock<'a> {
    data: &'a [u8],
}

pub(crate) struct InternalBlockMut<'a> {
    data: &'a mut [u8],
}

impl<'a> InternalBlock<'a> {
    pub(crate) fn from_block(data: &'a [u8]) -> Result<Self> {
        validate_block(data, NodeType::Internal)?;
        Ok(Self { data })
    }

    fn header(&self) -> &NodeHeader {
        NodeHeader::from_bytes(self.data).expect("validated in from_block")
    }

    pub(crate) fn count(&self) -> usize {
        self.header().count() as usize
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

    pub(crate) fn level(&self) -> u8 {
        self.header().level()
    }

    pub(crate) fn tail_child(&self) -> Laddr {
        debug_assert!(self.is_level_tail());
        self.header().tail_child()
    }

    fn cell_offset(&self, index: usize) -> usize {
        debug_assert!(index < self.count());
        let slot = NODE_HEADER_SIZE + index * SLOT_SIZE;
        u16::from_le_bytes(self.data[slot..slot + SLOT_SIZE].try_into().unwrap()) as usize
    }

    pub(crate) fn key_at(&self, index: usize) -> KeyRef<'a> {
        let offset = self.cell_offset(index) + CHILD_ADDR_SIZE;
        KeyRef::decode(&self.data[offset..])
    }

    pub(crate) fn child_at(&self, index: usize) -> Laddr {
        let offset = self.cell_offset(index);
        u64::from_le_bytes(self.data[offset..offset + CHILD_ADDR_SIZE].try_into().unwrap())
    }

    /// Child address at a slot position; the end sentinel names the tail
    /// child of a level-tail node.
    pub(crate) fn child_at_position(&self, pos: &SearchPosition) -> Laddr {
        if pos.is_end() {
            self.tail_child()
        } else {
            self.child_at(flat_of(self, pos))
        }
    }

    pub(crate) fn key_at_position(&self, pos: &SearchPosition) -> KeyRef<'a> {
        self.key_at(flat_of(self, pos))
    }

    pub(crate) fn largest_key(&self) -> KeyRef<'a> {
        debug_assert!(self.count() > 0);
        self.key_at(self.count() - 1)
    }

    /// Routes a key to the child that owns it.
    pub(crate) fn lower_bound(
        &self,
        key: KeyRef<'_>,
        history: &mut MatchHistory,
    ) -> Result<ChildLookup> {
        let (flat, _) = lower_bound_flat(self, key);
        if flat == self.count() {
            ensure!(
                self.is_level_tail(),
                "key {} routes beyond the largest separator of a non-tail node",
                key
            );
            return Ok(ChildLookup {
                pos: SearchPosition::end(),
                child: self.header().tail_child(),
            });
        }
        record_history(history, key, self.entry_key(flat));
        Ok(ChildLookup {
            pos: position_of(self, flat),
            child: self.child_at(flat),
        })
    }

    /// Plans a separator insert; see the leaf counterpart for the position
    /// adjustment contract.
    pub(crate) fn evaluate_insert(
        &self,
        key: KeyRef<'_>,
        pos: &mut SearchPosition,
    ) -> (Stage, usize) {
        let stage = plan_insert(self, key, pos);
        let size = SLOT_SIZE + CHILD_ADDR_SIZE + key.encoded_len();
        (stage, size)
    }
}

impl KeyedBlock for InternalBlock<'_> {
    fn entry_count(&self) -> usize {
        self.count()
    }
    fn entry_key(&self, index: usize) -> KeyRef<'_> {
        self.key_at(index)
    }
}

impl fmt::Display for InternalBlock<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for i in 0..self.count() {
            writeln!(
                f,
                "{} {} => child {:#x}",
                position_of(self, i),
                self.key_at(i),
                self.child_at(i)
            )?;
        }
        if self.is_level_tail() {
            writeln!(f, "(END) => child {:#x}", self.header().tail_child())?;
        }
        Ok(())
    }
}

impl<'a> InternalBlockMut<'a> {
    pub(crate) fn from_block(data: &'a mut [u8]) -> Result<Self> {
        validate_block(data, NodeType::Internal)?;
        Ok(Self { data })
    }

    pub(crate) fn init(
        data: &'a mut [u8],
        field_type: FieldType,
        is_level_tail: bool,
        level: u8,
    ) -> Result<Self> {
        ensure!(
            data.len() == NODE_BLOCK_SIZE,
            "invalid node block size: {} != {}",
            data.len(),
            NODE_BLOCK_SIZE
        );
        ensure!(level > 0, "internal node cannot be at leaf level");
        NodeHeader::init(data, NodeType::Internal, field_type, is_level_tail, level);
        Ok(Self { data })
    }

    pub(crate) fn as_read(&self) -> InternalBlock<'_> {
        InternalBlock { data: self.data }
    }

    fn header_mut(&mut self) -> &mut NodeHeader {
        NodeHeader::from_bytes_mut(self.data).expect("validated in from_block")
    }

    pub(crate) fn set_level_tail(&mut self, is_level_tail: bool) {
        self.header_mut().set_level_tail(is_level_tail);
    }

    pub(crate) fn set_tail_child(&mut self, laddr: Laddr) {
        self.header_mut().set_tail_child(laddr);
    }

    /// Swaps the child address recorded at `pos`, checking the old value.
    /// Used when a child split makes the slot refer to the right half.
    pub(crate) fn replace_child_addr(
        &mut self,
        pos: &SearchPosition,
        new_addr: Laddr,
        old_addr: Laddr,
    ) -> Result<()> {
        if pos.is_end() {
            let read = self.as_read();
            ensure!(read.is_level_tail(), "end position in a non-tail node");
            ensure!(
                read.header().tail_child() == old_addr,
                "tail child mismatch: {:#x} != {:#x}",
                read.header().tail_child(),
                old_addr
            );
            self.header_mut().set_tail_child(new_addr);
            return Ok(());
        }
        let read = self.as_read();
        let flat = flat_of(&read, pos);
        let offset = read.cell_offset(flat);
        let current = read.child_at(flat);
        ensure!(
            current == old_addr,
            "child address mismatch at {}: {:#x} != {:#x}",
            pos,
            current,
            old_addr
        );
        self.data[offset..offset + CHILD_ADDR_SIZE].copy_from_slice(&new_addr.to_le_bytes());
        Ok(())
    }

    /// Inserts a separator at the planned staged position.
    pub(crate) fn insert(
        &mut self,
        key: KeyRef<'_>,
        child: Laddr,
        pos: &SearchPosition,
    ) -> Result<()> {
        let flat = flat_lower_bound(&self.as_read(), pos);
        self.insert_at_flat(flat, key, child)?;
        debug_assert_eq!(position_of(&self.as_read(), flat), *pos);
        Ok(())
    }

    fn insert_at_flat(&mut self, flat: usize, key: KeyRef<'_>, child: Laddr) -> Result<()> {
        let read = self.as_read();
        let count = read.count();
        debug_assert!(flat <= count);
        debug_assert!(flat == 0 || read.key_at(flat - 1) < key);
        debug_assert!(flat == count || key < read.key_at(flat));

        let header = read.header();
        let free_start = header.free_start() as usize;
        let free_end = header.free_end() as usize;
        let cell_size = CHILD_ADDR_SIZE + key.encoded_len();
        ensure!(
            header.free_size() >= SLOT_SIZE + cell_size,
            "separator cell does not fit: need {}, free {}",
            SLOT_SIZE + cell_size,
            header.free_size()
        );

        let cell_offset = free_end - cell_size;
        self.data[cell_offset..cell_offset + CHILD_ADDR_SIZE]
            .copy_from_slice(&child.to_le_bytes());
        key.encode_into(&mut self.data[cell_offset + CHILD_ADDR_SIZE..cell_offset + cell_size]);

        let slot = NODE_HEADER_SIZE + flat * SLOT_SIZE;
        self.data.copy_within(slot..free_start, slot + SLOT_SIZE);
        self.data[slot..slot + SLOT_SIZE].copy_from_slice(&(cell_offset as u16).to_le_bytes());

        let header = self.header_mut();
        header.set_count(count as u16 + 1);
        header.set_free_start((free_start + SLOT_SIZE) as u16);
        header.set_free_end(cell_offset as u16);
        Ok(())
    }

    /// Splits into `right_data` and inserts the pending separator on the
    /// owning side. Both halves are rebuilt compactly; the tail child and
    /// the level-tail role move to the right sibling, and `insert_pos` and
    /// the returned stage are rebased into the destination block's
    /// coordinates when the insert lands right.
    pub(crate) fn split_insert(
        &mut self,
        right_data: &mut [u8],
        key: KeyRef<'_>,
        child: Laddr,
        insert_pos: &mut SearchPosition,
    ) -> Result<(SearchPosition, bool, Stage)> {
        let read = self.as_read();
        let count = read.count();
        ensure!(count >= 2, "cannot split an internal node with {} cells", count);

        let flat = flat_lower_bound(&read, insert_pos);
        let new_size = SLOT_SIZE + CHILD_ADDR_SIZE + key.encoded_len();
        let split_at = choose_split(count, flat, new_size, |i| {
            SLOT_SIZE + CHILD_ADDR_SIZE + read.key_at(i).encoded_len()
        });
        let split_pos = position_of(&read, split_at);
        let is_insert_left = flat < split_at;
        let was_level_tail = read.is_level_tail();
        let tail_child = read.header().tail_child();
        let field_type = read.field_type();
        let level = read.level();

        let separators: Vec<(ObjectKey, Laddr)> = (0..count)
            .map(|i| (read.key_at(i).to_owned(), read.child_at(i)))
            .collect();

        let mut right = InternalBlockMut::init(right_data, field_type, was_level_tail, level)?;
        if was_level_tail {
            right.set_tail_child(tail_child);
        }
        for (i, (sep_key, sep_child)) in separators[split_at..].iter().enumerate() {
            right.insert_at_flat(i, sep_key.as_ref(), *sep_child)?;
        }

        NodeHeader::init(self.data, NodeType::Internal, field_type, false, level);
        for (i, (sep_key, sep_child)) in separators[..split_at].iter().enumerate() {
            self.insert_at_flat(i, sep_key.as_ref(), *sep_child)?;
        }

        let stage = if is_insert_left {
            let stage = stage_of_insert(&self.as_read(), key, flat);
            self.insert_at_flat(flat, key, child)?;
            stage
        } else {
            let stage = stage_of_insert(&right.as_read(), key, flat - split_at);
            right.insert_at_flat(flat - split_at, key, child)?;
            *insert_pos = position_of(&right.as_read(), flat - split_at);
            stage
        };
        Ok((split_pos, is_insert_left, stage))
    }
}

impl KeyedBlock for InternalBlockMut<'_> {
    fn entry_count(&self) -> usize {
        self.as_read().count()
    }
    fn entry_key(&self, index: usize) -> KeyRef<'_> {
        let offset = self.as_read().cell_offset(index) + CHILD_ADDR_SIZE;
        KeyRef::decode(&self.data[offset..])
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tree::key::ObjectKey;
    use crate::tree::position::MatchKind;

    fn block() -> Vec<u8> {
        vec![0u8; NODE_BLOCK_SIZE]
    }

    fn insert(data: &mut [u8], bucket: u64, name: &[u8], seq: u64, child: Laddr) {
        let key = ObjectKey::new(bucket, name, seq).unwrap();
        let mut node = InternalBlockMut::from_block(data).unwrap();
        let mut pos = match node
            .as_read()
            .lower_bound(key.as_ref(), &mut MatchHistory::default())
        {
            Ok(found) => found.pos,
            Err(_) => SearchPosition::end(),
        };
        node.as_read().evaluate_insert(key.as_ref(), &mut pos);
        node.insert(key.as_ref(), child, &pos).unwrap();
    }

    #[test]
    fn fresh_root_routes_everything_to_the_tail_child() {
        let mut data = block();
        let mut node = InternalBlockMut::init(&mut data, FieldType::N0, true, 1).unwrap();
        node.set_tail_child(0x42);

        let read = InternalBlock::from_block(&data).unwrap();
        let key = ObjectKey::new(7, b"x", 0).unwrap();
        let found = read
            .lower_bound(key.as_ref(), &mut MatchHistory::default())
            .unwrap();
        assert!(found.pos.is_end());
        assert_eq!(found.child, 0x42);
        assert_eq!(read.child_at_position(&SearchPosition::end()), 0x42);
    }

    #[test]
    fn separators_route_by_largest_key() {
        let mut data = block();
        InternalBlockMut::init(&mut data, FieldType::N0, true, 1).unwrap();
        InternalBlockMut::from_block(&mut data)
            .unwrap()
            .set_tail_child(0x30);
        insert(&mut data, 1, b"m", 9, 0x10);
        insert(&mut data, 4, b"m", 9, 0x20);

        let read = InternalBlock::from_block(&data).unwrap();
        let mut history = MatchHistory::default();

        // at or below the first separator
        let key = ObjectKey::new(1, b"a", 0).unwrap();
        let found = read.lower_bound(key.as_ref(), &mut history).unwrap();
        assert_eq!(found.child, 0x10);

        // exactly the first separator stays in its child
        let key = ObjectKey::new(1, b"m", 9).unwrap();
        let found = read.lower_bound(key.as_ref(), &mut history).unwrap();
        assert_eq!(found.child, 0x10);
        assert_eq!(history.get(Stage::Right), Some(MatchKind::Eq));

        // between separators
        let key = ObjectKey::new(2, b"a", 0).unwrap();
        let found = read.lower_bound(key.as_ref(), &mut history).unwrap();
        assert_eq!(found.child, 0x20);

        // beyond every separator
        let key = ObjectKey::new(9, b"a", 0).unwrap();
        let found = read.lower_bound(key.as_ref(), &mut history).unwrap();
        assert!(found.pos.is_end());
        assert_eq!(found.child, 0x30);
    }

    #[test]
    fn routing_beyond_a_non_tail_node_is_an_error() {
        let mut data = block();
        InternalBlockMut::init(&mut data, FieldType::N0, false, 1).unwrap();
        insert(&mut data, 1, b"m", 0, 0x10);

        let read = InternalBlock::from_block(&data).unwrap();
        let key = ObjectKey::new(5, b"z", 0).unwrap();
        let result = read.lower_bound(key.as_ref(), &mut MatchHistory::default());
        assert!(result.is_err());
    }

    #[test]
    fn replace_child_addr_checks_the_old_value() {
        let mut data = block();
        InternalBlockMut::init(&mut data, FieldType::N0, true, 1).unwrap();
        InternalBlockMut::from_block(&mut data)
            .unwrap()
            .set_tail_child(0x30);
        insert(&mut data, 1, b"m", 0, 0x10);

        let pos = SearchPosition::begin();
        let mut node = InternalBlockMut::from_block(&mut data).unwrap();
        assert!(node.replace_child_addr(&pos, 0x11, 0x99).is_err());
        node.replace_child_addr(&pos, 0x11, 0x10).unwrap();
        assert_eq!(node.as_read().child_at(0), 0x11);

        let end = SearchPosition::end();
        node.replace_child_addr(&end, 0x31, 0x30).unwrap();
        assert_eq!(node.as_read().header().tail_child(), 0x31);
    }

    #[test]
    fn split_moves_tail_child_to_the_right_sibling() {
        let mut data = block();
        InternalBlockMut::init(&mut data, FieldType::N0, true, 2).unwrap();
        InternalBlockMut::from_block(&mut data)
            .unwrap()
            .set_tail_child(0xFF);
        for i in 0..6u64 {
            insert(&mut data, i, b"s", 0, 0x100 + i);
        }

        let mut right_data = block();
        let key = ObjectKey::new(6, b"s", 0).unwrap();
        let mut pos = SearchPosition::new(6, 0, 0);
        let (split_pos, is_left, _stage) = InternalBlockMut::from_block(&mut data)
            .unwrap()
            .split_insert(&mut right_data, key.as_ref(), 0x106, &mut pos)
            .unwrap();

        let left = InternalBlock::from_block(&data).unwrap();
        let right = InternalBlock::from_block(&right_data).unwrap();
        assert!(!left.is_level_tail());
        assert!(right.is_level_tail());
        assert_eq!(right.header().tail_child(), 0xFF);
        assert_eq!(right.level(), 2);
        assert!(!is_left);
        assert!(!split_pos.is_end());
        assert_eq!(left.count() + right.count(), 7);
        assert_eq!(right.child_at_position(&pos), 0x106);
    }
}
