//! # Leaf Node Orchestration
//!
//! Value-level mutation and cursor tracking. `insert_value` is the single
//! entry point for writing a new entry: it either inserts in place or
//! splits the leaf, and in both cases fixes up the cursor-tracking map so
//! every outstanding cursor stays positioned on its logical key. Cached
//! value pointers are invalidated eagerly from the mutation point onward
//! and re-derived on demand.

use eyre::Result;
use tracing::debug;

use crate::extent::Transaction;

use super::cursor::CursorId;
use super::key::KeyRef;
use super::layout::{LeafBlock, LeafBlockMut};
use super::meta::ObjectMeta;
use super::position::{MatchHistory, SearchPosition, Stage, INDEX_END};
use super::node::NodeId;
use super::BTree;

impl BTree {
    /// Inserts a value the search proved absent, at the lower-bound
    /// position `pos` carried out of the descent.
    pub(crate) fn insert_value(
        &mut self,
        ctx: &mut Transaction<'_>,
        id: NodeId,
        key: KeyRef<'_>,
        meta: &ObjectMeta,
        pos: SearchPosition,
        history: &MatchHistory,
    ) -> Result<CursorId> {
        debug_assert!(!pos.is_end() || self.node_is_level_tail(id));
        let extent = self.node_extent(id);
        ctx.prepare_mutate(&extent);

        let mut insert_pos = pos;
        let (stage, size) = extent.read(|data| -> Result<_> {
            Ok(LeafBlock::from_block(data)?.evaluate_insert(key, history, &mut insert_pos))
        })?;
        let free_size =
            extent.read(|data| -> Result<_> { Ok(LeafBlock::from_block(data)?.free_size()) })?;

        if free_size >= size {
            let value_off =
                extent.write(|data| LeafBlockMut::from_block(data)?.insert(key, meta, &insert_pos))?;
            debug_assert!(insert_pos <= pos);
            debug_assert_eq!(
                extent.read(|data| LeafBlock::from_block(data).unwrap().free_size()),
                free_size - size
            );
            let cursor = self.track_cursor_insert(id, insert_pos, stage, value_off);
            self.validate_tracked_cursors(id);
            return Ok(cursor);
        }

        debug!(
            laddr = self.node_laddr(id),
            insert_pos = %insert_pos,
            size,
            free_size,
            "tree.leaf.split"
        );
        if self.node_is_root(id) {
            self.upgrade_root(ctx, id)?;
        }
        let field_type = self.node_field_type(id);
        let is_level_tail = self.node_is_level_tail(id);
        let right = self.allocate_leaf(ctx, field_type, is_level_tail)?;
        let right_extent = self.node_extent(right);

        let (split_pos, is_insert_left, value_off, stage) = extent.write(|data| {
            right_extent.write(|right_data| {
                LeafBlockMut::from_block(data)?.split_insert(
                    right_data,
                    key,
                    meta,
                    &mut insert_pos,
                )
            })
        })?;
        self.track_cursor_split(id, split_pos, right);
        let cursor = if is_insert_left {
            self.track_cursor_insert(id, insert_pos, stage, value_off)
        } else {
            self.track_cursor_insert(right, insert_pos, stage, value_off)
        };
        self.validate_tracked_cursors(id);
        self.validate_tracked_cursors(right);

        self.insert_parent(ctx, id, right)?;
        Ok(cursor)
    }

    /// Returns the tracked cursor at `pos`, creating one on a miss. The
    /// end sentinel (empty-root lookups, and inserts past every entry)
    /// yields a detached cursor that is never tracked.
    pub(crate) fn get_or_track_cursor(
        &mut self,
        id: NodeId,
        pos: SearchPosition,
        value_off: Option<u16>,
    ) -> CursorId {
        if pos.is_end() {
            debug_assert!(self.node_is_level_tail(id));
            debug_assert!(value_off.is_none());
            return self.new_cursor(id, pos, None);
        }
        if let Some(&cursor) = self.leaf_ref(id).cursors.get(&pos) {
            debug_assert_eq!(self.cursors[cursor].leaf, id);
            debug_assert_eq!(self.cursors[cursor].pos, pos);
            self.cursor_set_value_off(cursor, value_off);
            return cursor;
        }
        self.new_cursor(id, pos, value_off)
    }

    /// Invalidates cached value pointers from the mutation point on,
    /// shifts tracked cursors at the insert's stage, and materializes the
    /// cursor for the new entry.
    pub(crate) fn track_cursor_insert(
        &mut self,
        id: NodeId,
        insert_pos: SearchPosition,
        stage: Stage,
        value_off: u16,
    ) -> CursorId {
        let invalidate_from = insert_pos.with_index(Stage::Right, 0);
        let stale: Vec<CursorId> = self
            .leaf_ref(id)
            .cursors
            .range(invalidate_from..)
            .map(|(_, &cursor)| cursor)
            .collect();
        for cursor in stale {
            self.cursors[cursor].value_off = None;
        }

        let upper = insert_pos.with_index(stage, INDEX_END);
        let affected: Vec<(SearchPosition, CursorId)> = self
            .leaf_ref(id)
            .cursors
            .range(insert_pos..upper)
            .map(|(&pos, &cursor)| (pos, cursor))
            .collect();
        for (pos, _) in &affected {
            self.leaf_mut(id).cursors.remove(pos);
        }
        for (mut pos, cursor) in affected {
            pos.bump(stage);
            self.cursor_update_track(cursor, id, pos);
        }

        self.new_cursor(id, insert_pos, Some(value_off))
    }

    /// Hands every tracked cursor at or after the split position to the
    /// right sibling, invalidating cached value pointers first. The split
    /// rebuilt the left block too, so every cached pointer of this leaf is
    /// stale, not just those past the split position.
    pub(crate) fn track_cursor_split(
        &mut self,
        id: NodeId,
        split_pos: SearchPosition,
        right: NodeId,
    ) {
        let stale: Vec<CursorId> = self
            .leaf_ref(id)
            .cursors
            .values()
            .copied()
            .collect();
        for cursor in stale {
            self.cursors[cursor].value_off = None;
        }

        let moved: Vec<(SearchPosition, CursorId)> = self
            .leaf_ref(id)
            .cursors
            .range(split_pos..)
            .map(|(&pos, &cursor)| (pos, cursor))
            .collect();
        for (pos, _) in &moved {
            self.leaf_mut(id).cursors.remove(pos);
        }
        for (pos, cursor) in moved {
            let mut new_pos = pos;
            new_pos.rebase_onto(&split_pos);
            self.cursor_update_track(cursor, right, new_pos);
        }
    }

    /// Full consistency pass over the cursor-tracking map. Debug builds
    /// only.
    pub(crate) fn validate_tracked_cursors(&self, id: NodeId) {
        if !cfg!(debug_assertions) {
            return;
        }
        let extent = self.node_extent(id);
        for (&pos, &cursor) in &self.leaf_ref(id).cursors {
            assert!(!pos.is_end());
            assert_eq!(self.cursors[cursor].leaf, id);
            assert_eq!(self.cursors[cursor].pos, pos);
            let current_off = extent.read(|data| {
                LeafBlock::from_block(data)
                    .expect("validated at load time")
                    .value_offset(&pos)
            });
            if let Some(cached) = self.cursors[cursor].value_off {
                assert_eq!(cached, current_off, "stale cached value pointer");
            }
        }
    }
}
