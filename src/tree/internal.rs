//! # Internal Node Orchestration
//!
//! Child resolution and the structural-mutation engine. `apply_child_split`
//! is where a completed child split lands: the slot that used to name the
//! left child is repointed at the right half, the left child's new largest
//! key is inserted as a fresh separator, and when that does not fit the
//! node itself splits and recurses upward. Throughout, the child-tracking
//! map is fixed up synchronously so every live node keeps a valid parent
//! link.

use std::ops::Bound;

use eyre::Result;
use tracing::debug;

use crate::extent::{Laddr, SuperHandle, Transaction};

use super::layout::{FieldType, InternalBlock, InternalBlockMut};
use super::node::{NodeId, NodeLink};
use super::position::{SearchPosition, Stage, INDEX_END};
use super::BTree;

impl BTree {
    /// Resolves the child at `pos`, loading and tracking it on a miss.
    /// The "or track" half is what keeps parent/child back-references
    /// consistent with handles held by ongoing operations.
    pub(crate) fn get_or_track_child(
        &mut self,
        ctx: &mut Transaction<'_>,
        parent: NodeId,
        pos: SearchPosition,
        child_addr: Laddr,
    ) -> Result<NodeId> {
        if let Some(&child) = self.internal_ref(parent).children.get(&pos) {
            debug_assert_eq!(self.node_laddr(child), child_addr);
            debug_assert!(matches!(
                self.nodes[child].core().link,
                NodeLink::Child { parent: p, pos: q } if p == parent && q == pos
            ));
            self.validate_child(parent, child);
            return Ok(child);
        }
        let child = self.load_node(ctx, child_addr, pos.is_end())?;
        self.as_child(child, pos, parent, true);
        Ok(child)
    }

    /// Applies a completed split of the child at `pos`: `left` is the
    /// original child (now holding the lower half), `right` the fresh
    /// sibling holding the upper half and the original's tail role.
    pub(crate) fn apply_child_split(
        &mut self,
        ctx: &mut Transaction<'_>,
        id: NodeId,
        pos: SearchPosition,
        left: NodeId,
        right: NodeId,
    ) -> Result<()> {
        debug_assert!(!pos.is_end() || self.node_is_level_tail(id));
        let extent = self.node_extent(id);
        ctx.prepare_mutate(&extent);

        // the slot at pos now names the upper half
        let left_addr = self.node_laddr(left);
        let right_addr = self.node_laddr(right);
        extent.write(|data| {
            InternalBlockMut::from_block(data)?.replace_child_addr(&pos, right_addr, left_addr)
        })?;
        self.replace_track(id, pos, right, left);

        let left_key = self.node_largest_key(left);
        let mut insert_pos = pos;
        let (stage, size) = extent.read(|data| -> Result<_> {
            Ok(InternalBlock::from_block(data)?.evaluate_insert(left_key.as_ref(), &mut insert_pos))
        })?;
        let free_size =
            extent.read(|data| -> Result<_> { Ok(InternalBlock::from_block(data)?.free_size()) })?;

        if free_size >= size {
            extent.write(|data| {
                InternalBlockMut::from_block(data)?.insert(left_key.as_ref(), left_addr, &insert_pos)
            })?;
            debug_assert!(insert_pos <= pos);
            self.track_child_insert(id, insert_pos, stage, left, Some(right));
            self.validate_tracked_children(id);
            return Ok(());
        }

        debug!(
            laddr = self.node_laddr(id),
            insert_pos = %insert_pos,
            size,
            free_size,
            "tree.internal.split"
        );
        if self.node_is_root(id) {
            self.upgrade_root(ctx, id)?;
        }
        let field_type = self.node_field_type(id);
        let is_level_tail = self.node_is_level_tail(id);
        let level = self.node_level(id);
        let sibling = self.allocate_internal(ctx, field_type, is_level_tail, level)?;
        let sibling_extent = self.node_extent(sibling);

        let (split_pos, is_insert_left, stage) = extent.write(|data| {
            sibling_extent.write(|right_data| {
                InternalBlockMut::from_block(data)?.split_insert(
                    right_data,
                    left_key.as_ref(),
                    left_addr,
                    &mut insert_pos,
                )
            })
        })?;
        self.track_child_split(id, split_pos, sibling);
        if is_insert_left {
            self.track_child_insert(id, insert_pos, stage, left, None);
        } else {
            self.track_child_insert(sibling, insert_pos, stage, left, None);
        }
        self.validate_tracked_children(id);
        self.validate_tracked_children(sibling);

        self.insert_parent(ctx, id, sibling)
    }

    /// Allocates the internal node that becomes the new root one level
    /// above `old_level`, with `old_addr` as its sole, end-sentinel child,
    /// and installs it as root. The caller re-attaches the old root.
    pub(crate) fn allocate_root(
        &mut self,
        ctx: &mut Transaction<'_>,
        old_level: u8,
        old_addr: Laddr,
        sup: SuperHandle,
    ) -> Result<NodeId> {
        let root = self.allocate_internal(ctx, FieldType::N0, true, old_level + 1)?;
        self.node_extent(root).write(|data| -> Result<()> {
            InternalBlockMut::from_block(data)?.set_tail_child(old_addr);
            Ok(())
        })?;
        self.make_root(ctx, root, sup)?;
        Ok(root)
    }

    /// Shifts tracked children at and after an insert one step along the
    /// insert's stage, then tracks the inserted child. `nxt` is the
    /// expected successor of the insert, checked in debug builds.
    pub(crate) fn track_child_insert(
        &mut self,
        id: NodeId,
        insert_pos: SearchPosition,
        stage: Stage,
        inserted: NodeId,
        nxt: Option<NodeId>,
    ) {
        let upper = insert_pos.with_index(stage, INDEX_END);
        let affected: Vec<(SearchPosition, NodeId)> = self
            .internal_ref(id)
            .children
            .range(insert_pos..upper)
            .map(|(&pos, &child)| (pos, child))
            .collect();
        for (pos, _) in &affected {
            self.internal_mut(id).children.remove(pos);
        }
        for (mut pos, child) in affected {
            debug_assert!(!pos.is_end());
            pos.bump(stage);
            self.as_child(child, pos, id, true);
        }
        self.as_child(inserted, insert_pos, id, true);

        if cfg!(debug_assertions) {
            if let Some(nxt) = nxt {
                let successor = self
                    .internal_ref(id)
                    .children
                    .range((Bound::Excluded(insert_pos), Bound::Unbounded))
                    .next()
                    .map(|(_, &child)| child);
                debug_assert_eq!(successor, Some(nxt), "right half is not the successor");
            }
        }
    }

    /// Swaps the tracked child at `pos`, checking the old occupant.
    pub(crate) fn replace_track(
        &mut self,
        id: NodeId,
        pos: SearchPosition,
        new_child: NodeId,
        old_child: NodeId,
    ) {
        let removed = self.internal_mut(id).children.remove(&pos);
        debug_assert_eq!(removed, Some(old_child));
        self.as_child(new_child, pos, id, true);
    }

    /// Hands every tracked child at or after the split position to the new
    /// right sibling, rebasing positions into its coordinates.
    pub(crate) fn track_child_split(
        &mut self,
        id: NodeId,
        split_pos: SearchPosition,
        right: NodeId,
    ) {
        let moved: Vec<(SearchPosition, NodeId)> = self
            .internal_ref(id)
            .children
            .range(split_pos..)
            .map(|(&pos, &child)| (pos, child))
            .collect();
        for (pos, _) in &moved {
            self.internal_mut(id).children.remove(pos);
        }
        for (pos, child) in moved {
            let mut new_pos = pos;
            new_pos.rebase_onto(&split_pos);
            self.as_child(child, new_pos, right, false);
        }
    }

    /// Full consistency pass over the child-tracking map. Debug builds
    /// only.
    pub(crate) fn validate_tracked_children(&self, id: NodeId) {
        if !cfg!(debug_assertions) {
            return;
        }
        for (&pos, &child) in &self.internal_ref(id).children {
            match self.nodes[child].core().link {
                NodeLink::Child { parent, pos: tracked } => {
                    assert_eq!(parent, id);
                    assert_eq!(tracked, pos, "tracking map key disagrees with parent link");
                }
                _ => panic!("tracked child has no parent link"),
            }
            self.validate_child(id, child);
        }
    }
}
