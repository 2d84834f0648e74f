//! # Tree Orchestration
//!
//! The in-memory node layer of the copy-on-write B+tree. This module owns
//! everything between the public [`BTree`] facade and the on-block layouts:
//! loading nodes over extents, tracked top-down search, inserts with
//! in-place and split paths, and the bookkeeping that keeps outstanding
//! handles valid through structural mutation.
//!
//! ## Node Arena
//!
//! Nodes and cursors live in per-tree arenas and are addressed by plain
//! indexes (`NodeId`, [`CursorId`]). Links run both ways:
//!
//! ```text
//!            BTree.root ──────────────┐
//!                                     v
//!   InternalNode ── children: BTreeMap<SearchPosition, NodeId> ──> child
//!        ^                                                           │
//!        └────────────── link: Child { parent, pos } ────────────────┘
//!
//!   LeafNode ── cursors: BTreeMap<SearchPosition, CursorId> ──> TreeCursor
//!        ^                                                           │
//!        └───────────────────────── leaf ────────────────────────────┘
//! ```
//!
//! Every tracked child records its position inside its parent, and every
//! tracked cursor its position inside its leaf. Structural mutations keep
//! both sides consistent: an insert shifts the tracked positions at its
//! stage, a split hands the tail of a tracking map to the new right sibling
//! with rebased positions, and root growth re-attaches the old root as the
//! end-sentinel child of the new one.
//!
//! ## Mutation Flow
//!
//! ```text
//! insert(key, meta)
//!   └── lower_bound_tracked           descend, tracking children
//!         └── leaf insert_value
//!               ├── fits: insert + track_insert
//!               └── else: upgrade_root?  split_insert
//!                         track_split + track_insert
//!                         insert_parent ──> apply_child_split (recurse up)
//! ```
//!
//! All tracker mutations happen synchronously between extent operations, so
//! any abandoned transaction leaves no observable in-memory inconsistency
//! behind: the tree object is simply dropped with it.

pub mod key;
pub mod meta;
pub mod position;

mod cursor;
mod internal;
mod layout;
mod leaf;
mod node;

pub use cursor::CursorId;
pub use key::{KeyRef, ObjectKey, MAX_NAME_LEN};
pub use meta::ObjectMeta;
pub use position::{MatchHistory, MatchKind, SearchPosition, Stage};

use eyre::{ensure, Result};
use tracing::debug;

use crate::extent::{Transaction, L_ADDR_NULL};

use cursor::TreeCursor;
use layout::FieldType;
use node::{NodeId, NodeSlot};

/// Outcome of a lower-bound search: a cursor at the first entry not less
/// than the key, and whether it matched exactly.
#[derive(Debug, Clone, Copy)]
pub struct LookupResult {
    pub cursor: CursorId,
    pub match_kind: MatchKind,
}

/// The object-metadata tree bound to one transaction's lifetime.
///
/// All node and cursor state lives in arenas inside this object; the
/// extents they wrap belong to the transaction passed into each call.
pub struct BTree {
    nodes: Vec<NodeSlot>,
    cursors: Vec<TreeCursor>,
    root: Option<NodeId>,
}

impl BTree {
    pub fn new() -> Self {
        Self {
            nodes: Vec::new(),
            cursors: Vec::new(),
            root: None,
        }
    }

    /// Formats the store: allocates an empty level-tail root leaf and
    /// persists its address in the superblock.
    pub fn mkfs(ctx: &mut Transaction<'_>) -> Result<()> {
        let sup = ctx.get_super()?;
        ensure!(
            sup.root_laddr() == L_ADDR_NULL,
            "store is already formatted (root at {:#x})",
            sup.root_laddr()
        );
        let mut tree = BTree::new();
        let root = tree.allocate_leaf(ctx, FieldType::N0, true)?;
        tree.make_root(ctx, root, sup)?;
        debug!(laddr = tree.node_laddr(root), "tree.mkfs");
        Ok(())
    }

    /// Loads the persisted root through the superblock and installs it.
    pub fn load_root(&mut self, ctx: &mut Transaction<'_>) -> Result<()> {
        ensure!(self.root.is_none(), "root is already loaded");
        let sup = ctx.get_super()?;
        let addr = sup.root_laddr();
        ensure!(addr != L_ADDR_NULL, "store is not formatted");
        let root = self.load_node(ctx, addr, true)?;
        ensure!(
            self.node_field_type(root) == FieldType::N0,
            "root node has field type {:?}",
            self.node_field_type(root)
        );
        self.as_root(root, sup);
        debug!(laddr = addr, level = self.node_level(root), "tree.load_root");
        Ok(())
    }

    fn root_or_load(&mut self, ctx: &mut Transaction<'_>) -> Result<NodeId> {
        if let Some(root) = self.root {
            return Ok(root);
        }
        self.load_root(ctx)?;
        Ok(self.root.expect("installed by load_root"))
    }

    /// Descends to the first entry not less than `key`.
    pub fn lower_bound(
        &mut self,
        ctx: &mut Transaction<'_>,
        key: &ObjectKey,
    ) -> Result<LookupResult> {
        let root = self.root_or_load(ctx)?;
        let mut history = MatchHistory::default();
        self.lower_bound_tracked(ctx, root, key.as_ref(), &mut history)
    }

    /// Inserts `meta` under `key`. An existing key is left untouched and
    /// reported through the returned flag.
    pub fn insert(
        &mut self,
        ctx: &mut Transaction<'_>,
        key: &ObjectKey,
        meta: &ObjectMeta,
    ) -> Result<(CursorId, bool)> {
        let root = self.root_or_load(ctx)?;
        let mut history = MatchHistory::default();
        let found = self.lower_bound_tracked(ctx, root, key.as_ref(), &mut history)?;
        if found.match_kind == MatchKind::Eq {
            return Ok((found.cursor, false));
        }
        let leaf = self.cursors[found.cursor].leaf;
        let pos = self.cursors[found.cursor].pos;
        let cursor = self.insert_value(ctx, leaf, key.as_ref(), meta, pos, &history)?;
        Ok((cursor, true))
    }

    /// Point lookup convenience over `lower_bound`.
    pub fn get(
        &mut self,
        ctx: &mut Transaction<'_>,
        key: &ObjectKey,
    ) -> Result<Option<ObjectMeta>> {
        let found = self.lower_bound(ctx, key)?;
        if found.match_kind == MatchKind::Eq {
            Ok(Some(self.cursor_value(found.cursor)?))
        } else {
            Ok(None)
        }
    }

    /// Cursor at the smallest entry; an end-sentinel cursor on an empty
    /// tree.
    pub fn lookup_smallest(&mut self, ctx: &mut Transaction<'_>) -> Result<CursorId> {
        let root = self.root_or_load(ctx)?;
        self.lookup_smallest_in(ctx, root)
    }

    /// Cursor at the largest entry; an end-sentinel cursor on an empty
    /// tree.
    pub fn lookup_largest(&mut self, ctx: &mut Transaction<'_>) -> Result<CursorId> {
        let root = self.root_or_load(ctx)?;
        self.lookup_largest_in(ctx, root)
    }

    /// Height of the tree: the root's level.
    pub fn level(&mut self, ctx: &mut Transaction<'_>) -> Result<u8> {
        let root = self.root_or_load(ctx)?;
        Ok(self.node_level(root))
    }

    /// Full recursive dump of every node reachable from the root.
    pub fn dump(&mut self, ctx: &mut Transaction<'_>) -> Result<String> {
        let root = self.root_or_load(ctx)?;
        let mut out = String::new();
        self.dump_node(ctx, self.node_laddr(root), 0, &mut out)?;
        Ok(out)
    }

    /// One-line summary of the root.
    pub fn dump_brief(&mut self, ctx: &mut Transaction<'_>) -> Result<String> {
        let root = self.root_or_load(ctx)?;
        Ok(format!(
            "root laddr={:#x} level={} field_type={:?}",
            self.node_laddr(root),
            self.node_level(root),
            self.node_field_type(root),
        ))
    }
}

impl Default for BTree {
    fn default() -> Self {
        Self::new()
    }
}
