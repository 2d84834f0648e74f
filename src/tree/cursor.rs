//! # Tree Cursors
//!
//! A cursor is a stable handle to one `(leaf, position)` pair plus a cached
//! value pointer. Cursors self-register in their leaf's tracking map (the
//! end sentinel stays detached) and are repositioned by the leaf during
//! inserts and splits, so a handle taken before a structural mutation still
//! names the same logical key afterwards.

use eyre::{ensure, Result};

use super::key::ObjectKey;
use super::layout::LeafBlock;
use super::meta::ObjectMeta;
use super::node::NodeId;
use super::position::SearchPosition;
use super::BTree;

/// Index of a cursor in the tree's cursor arena.
pub type CursorId = usize;

pub(crate) struct TreeCursor {
    pub leaf: NodeId,
    pub pos: SearchPosition,
    /// Byte offset of the metadata record inside the leaf extent; `None`
    /// after an invalidation, re-derived on demand.
    pub value_off: Option<u16>,
}

impl BTree {
    pub(crate) fn new_cursor(
        &mut self,
        leaf: NodeId,
        pos: SearchPosition,
        value_off: Option<u16>,
    ) -> CursorId {
        debug_assert_eq!(pos.is_end(), value_off.is_none());
        if cfg!(debug_assertions) {
            if let Some(off) = value_off {
                let current = self.node_extent(leaf).read(|data| {
                    LeafBlock::from_block(data)
                        .expect("validated at load time")
                        .value_offset(&pos)
                });
                debug_assert_eq!(off, current);
            }
        }
        let id = self.cursors.len();
        self.cursors.push(TreeCursor {
            leaf,
            pos,
            value_off,
        });
        if !pos.is_end() {
            let prev = self.leaf_mut(leaf).cursors.insert(pos, id);
            debug_assert!(prev.is_none(), "duplicate tracked cursor at {pos}");
        }
        id
    }

    /// Re-registers a cursor on a new leaf/position during split fix-ups.
    /// The caller has already removed it from the old map, and its cached
    /// pointer must have been invalidated.
    pub(crate) fn cursor_update_track(&mut self, id: CursorId, leaf: NodeId, pos: SearchPosition) {
        debug_assert!(!pos.is_end());
        let cursor = &mut self.cursors[id];
        debug_assert!(cursor.value_off.is_none());
        cursor.leaf = leaf;
        cursor.pos = pos;
        let prev = self.leaf_mut(leaf).cursors.insert(pos, id);
        debug_assert!(prev.is_none(), "duplicate tracked cursor at {pos}");
    }

    /// Adopts a freshly derived value pointer; a still-cached pointer must
    /// agree.
    pub(crate) fn cursor_set_value_off(&mut self, id: CursorId, value_off: Option<u16>) {
        let Some(off) = value_off else { return };
        match self.cursors[id].value_off {
            None => self.cursors[id].value_off = Some(off),
            Some(cached) => debug_assert_eq!(cached, off),
        }
    }

    /// Whether the cursor is the end sentinel of an empty tree lookup.
    pub fn cursor_is_end(&self, id: CursorId) -> bool {
        self.cursors[id].pos.is_end()
    }

    /// The cursor's staged position within its leaf. Diagnostic.
    pub fn cursor_position(&self, id: CursorId) -> SearchPosition {
        self.cursors[id].pos
    }

    /// The key the cursor is standing on.
    pub fn cursor_key(&self, id: CursorId) -> Result<ObjectKey> {
        let cursor = &self.cursors[id];
        ensure!(!cursor.pos.is_end(), "cursor is at the end sentinel");
        let pos = cursor.pos;
        Ok(self.node_extent(cursor.leaf).read(|data| {
            LeafBlock::from_block(data)
                .expect("validated at load time")
                .key_at_position(&pos)
                .to_owned()
        }))
    }

    /// The metadata record the cursor points at. Re-derives and re-caches
    /// the value pointer if a mutation invalidated it.
    pub fn cursor_value(&mut self, id: CursorId) -> Result<ObjectMeta> {
        ensure!(
            !self.cursors[id].pos.is_end(),
            "cursor is at the end sentinel"
        );
        let leaf = self.cursors[id].leaf;
        let pos = self.cursors[id].pos;
        let extent = self.node_extent(leaf);
        let off = match self.cursors[id].value_off {
            Some(off) => off,
            None => {
                let off = extent.read(|data| {
                    LeafBlock::from_block(data)
                        .expect("validated at load time")
                        .value_offset(&pos)
                });
                self.cursors[id].value_off = Some(off);
                off
            }
        };
        Ok(extent.read(|data| {
            LeafBlock::from_block(data)
                .expect("validated at load time")
                .meta_at_offset(off)
        }))
    }
}
