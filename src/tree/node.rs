//! # Node Arena and Common Lifetime
//!
//! Arena slots for both node flavors, plus the lifecycle shared by them:
//! loading and allocating over extents, attaching as root or child,
//! top-down tracked search, and root growth. A node is either root (owns
//! the [`SuperHandle`]) or a child (records its parent and position); the
//! two states are mutually exclusive whenever the node is observable.

use std::collections::BTreeMap;
use std::mem;

use eyre::{bail, ensure, Result};
use tracing::{debug, trace};
use zerocopy::FromBytes;

use crate::extent::{Extent, Laddr, SuperHandle, Transaction};

use super::cursor::CursorId;
use super::key::{KeyRef, ObjectKey};
use super::layout::{
    ChildLookup, FieldType, InternalBlock, InternalBlockMut, LeafBlock, LeafBlockMut, LeafLookup,
    NodeHeader, NodeType, NODE_HEADER_SIZE,
};
use super::position::{MatchHistory, SearchPosition};
use super::{BTree, LookupResult};

pub(crate) type NodeId = usize;

/// Either end of a node's upward link.
pub(crate) enum NodeLink {
    /// Window between allocate/load and attachment.
    Detached,
    /// This node is the root and owns the superblock handle.
    Root(SuperHandle),
    /// Position of this node inside its parent's child-tracking map.
    Child { parent: NodeId, pos: SearchPosition },
}

pub(crate) struct NodeCore {
    pub laddr: Laddr,
    pub extent: Extent,
    pub link: NodeLink,
}

pub(crate) struct InternalNode {
    pub core: NodeCore,
    /// Tracked children, keyed by their position in this node.
    pub children: BTreeMap<SearchPosition, NodeId>,
}

pub(crate) struct LeafNode {
    pub core: NodeCore,
    /// Tracked cursors, keyed by their position in this leaf.
    pub cursors: BTreeMap<SearchPosition, CursorId>,
}

pub(crate) enum NodeSlot {
    Internal(InternalNode),
    Leaf(LeafNode),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum NodeKind {
    Internal,
    Leaf,
}

impl NodeSlot {
    pub(crate) fn core(&self) -> &NodeCore {
        match self {
            NodeSlot::Internal(node) => &node.core,
            NodeSlot::Leaf(node) => &node.core,
        }
    }

    pub(crate) fn core_mut(&mut self) -> &mut NodeCore {
        match self {
            NodeSlot::Internal(node) => &mut node.core,
            NodeSlot::Leaf(node) => &mut node.core,
        }
    }

    pub(crate) fn kind(&self) -> NodeKind {
        match self {
            NodeSlot::Internal(_) => NodeKind::Internal,
            NodeSlot::Leaf(_) => NodeKind::Leaf,
        }
    }
}

impl BTree {
    pub(crate) fn node_kind(&self, id: NodeId) -> NodeKind {
        self.nodes[id].kind()
    }

    pub(crate) fn node_extent(&self, id: NodeId) -> Extent {
        self.nodes[id].core().extent.clone()
    }

    pub(crate) fn node_laddr(&self, id: NodeId) -> Laddr {
        self.nodes[id].core().laddr
    }

    pub(crate) fn node_is_root(&self, id: NodeId) -> bool {
        matches!(self.nodes[id].core().link, NodeLink::Root(_))
    }

    pub(crate) fn internal_ref(&self, id: NodeId) -> &InternalNode {
        match &self.nodes[id] {
            NodeSlot::Internal(node) => node,
            NodeSlot::Leaf(_) => unreachable!("node {id} is not internal"),
        }
    }

    pub(crate) fn internal_mut(&mut self, id: NodeId) -> &mut InternalNode {
        match &mut self.nodes[id] {
            NodeSlot::Internal(node) => node,
            NodeSlot::Leaf(_) => unreachable!("node {id} is not internal"),
        }
    }

    pub(crate) fn leaf_ref(&self, id: NodeId) -> &LeafNode {
        match &self.nodes[id] {
            NodeSlot::Leaf(node) => node,
            NodeSlot::Internal(_) => unreachable!("node {id} is not a leaf"),
        }
    }

    pub(crate) fn leaf_mut(&mut self, id: NodeId) -> &mut LeafNode {
        match &mut self.nodes[id] {
            NodeSlot::Leaf(node) => node,
            NodeSlot::Internal(_) => unreachable!("node {id} is not a leaf"),
        }
    }

    fn header_of(&self, id: NodeId) -> NodeHeader {
        self.nodes[id].core().extent.read(|data| {
            // INVARIANT: the block was validated when the node was loaded
            // or allocated
            NodeHeader::read_from_bytes(&data[..NODE_HEADER_SIZE]).unwrap()
        })
    }

    pub(crate) fn node_level(&self, id: NodeId) -> u8 {
        self.header_of(id).level()
    }

    pub(crate) fn node_is_level_tail(&self, id: NodeId) -> bool {
        self.header_of(id).is_level_tail()
    }

    pub(crate) fn node_field_type(&self, id: NodeId) -> FieldType {
        self.header_of(id)
            .field_type()
            .expect("validated at load time")
    }

    pub(crate) fn node_largest_key(&self, id: NodeId) -> ObjectKey {
        let extent = self.node_extent(id);
        match self.node_kind(id) {
            NodeKind::Leaf => extent.read(|data| {
                LeafBlock::from_block(data)
                    .expect("validated at load time")
                    .largest_key()
                    .to_owned()
            }),
            NodeKind::Internal => extent.read(|data| {
                InternalBlock::from_block(data)
                    .expect("validated at load time")
                    .largest_key()
                    .to_owned()
            }),
        }
    }

    /// Loads the node at `addr` and constructs a detached arena slot for
    /// it. The caller attaches it as root or child.
    pub(crate) fn load_node(
        &mut self,
        ctx: &mut Transaction<'_>,
        addr: Laddr,
        expect_level_tail: bool,
    ) -> Result<NodeId> {
        let extent = ctx.read_extent(addr)?;
        let (node_type, is_level_tail, level) = extent.read(|data| -> Result<_> {
            let header = NodeHeader::from_bytes(data)?;
            ensure!(
                header.field_type().is_some(),
                "load failed: bad field type {:#04x} at laddr {:#x}",
                header.field_type_raw(),
                addr
            );
            let Some(node_type) = header.node_type() else {
                bail!(
                    "load failed: bad node type {:#04x} at laddr {:#x}",
                    header.node_type_raw(),
                    addr
                );
            };
            Ok((node_type, header.is_level_tail(), header.level()))
        })?;
        ensure!(
            is_level_tail == expect_level_tail,
            "level-tail mismatch at laddr {:#x}: on-extent {}, expected {}",
            addr,
            is_level_tail,
            expect_level_tail
        );

        let core = NodeCore {
            laddr: addr,
            extent: extent.clone(),
            link: NodeLink::Detached,
        };
        let slot = match node_type {
            NodeType::Leaf => {
                ensure!(level == 0, "leaf at laddr {:#x} claims level {}", addr, level);
                extent.read(|data| LeafBlock::from_block(data).map(|_| ()))?;
                NodeSlot::Leaf(LeafNode {
                    core,
                    cursors: BTreeMap::new(),
                })
            }
            NodeType::Internal => {
                ensure!(level > 0, "internal node at laddr {:#x} claims level 0", addr);
                extent.read(|data| InternalBlock::from_block(data).map(|_| ()))?;
                NodeSlot::Internal(InternalNode {
                    core,
                    children: BTreeMap::new(),
                })
            }
        };
        let id = self.nodes.len();
        self.nodes.push(slot);
        trace!(laddr = addr, level, "tree.node.load");
        Ok(id)
    }

    pub(crate) fn allocate_leaf(
        &mut self,
        ctx: &mut Transaction<'_>,
        field_type: FieldType,
        is_level_tail: bool,
    ) -> Result<NodeId> {
        let extent = ctx.alloc_extent()?;
        extent.write(|data| LeafBlockMut::init(data, field_type, is_level_tail).map(|_| ()))?;
        let id = self.nodes.len();
        self.nodes.push(NodeSlot::Leaf(LeafNode {
            core: NodeCore {
                laddr: extent.laddr(),
                extent,
                link: NodeLink::Detached,
            },
            cursors: BTreeMap::new(),
        }));
        trace!(laddr = self.node_laddr(id), "tree.leaf.allocate");
        Ok(id)
    }

    pub(crate) fn allocate_internal(
        &mut self,
        ctx: &mut Transaction<'_>,
        field_type: FieldType,
        is_level_tail: bool,
        level: u8,
    ) -> Result<NodeId> {
        let extent = ctx.alloc_extent()?;
        extent.write(|data| {
            InternalBlockMut::init(data, field_type, is_level_tail, level).map(|_| ())
        })?;
        let id = self.nodes.len();
        self.nodes.push(NodeSlot::Internal(InternalNode {
            core: NodeCore {
                laddr: extent.laddr(),
                extent,
                link: NodeLink::Detached,
            },
            children: BTreeMap::new(),
        }));
        trace!(laddr = self.node_laddr(id), level, "tree.internal.allocate");
        Ok(id)
    }

    /// Installs a detached node as the tree root and registers it with the
    /// root tracker.
    pub(crate) fn as_root(&mut self, id: NodeId, sup: SuperHandle) {
        debug_assert!(matches!(self.nodes[id].core().link, NodeLink::Detached));
        debug_assert_eq!(sup.root_laddr(), self.node_laddr(id));
        debug_assert!(self.node_is_level_tail(id));
        self.nodes[id].core_mut().link = NodeLink::Root(sup);
        self.root = Some(id);
    }

    /// Persists this node's address as the root pointer, then installs it.
    pub(crate) fn make_root(
        &mut self,
        ctx: &mut Transaction<'_>,
        id: NodeId,
        mut sup: SuperHandle,
    ) -> Result<()> {
        sup.write_root_laddr(ctx, self.node_laddr(id))?;
        self.as_root(id, sup);
        Ok(())
    }

    /// Records the parent link and inserts the node into the parent's
    /// child-tracking map. `validate` runs the cross-checks; it is skipped
    /// during split fix-ups where the invariants are in motion.
    pub(crate) fn as_child(
        &mut self,
        id: NodeId,
        pos: SearchPosition,
        parent: NodeId,
        validate: bool,
    ) {
        debug_assert!(!matches!(self.nodes[id].core().link, NodeLink::Root(_)));
        self.nodes[id].core_mut().link = NodeLink::Child { parent, pos };
        let prev = self.internal_mut(parent).children.insert(pos, id);
        debug_assert!(prev.is_none(), "duplicate tracked child at {pos}");
        if validate {
            self.validate_child(parent, id);
        }
    }

    /// Grows the tree by one level: the current root hands its super
    /// handle to a fresh internal node and re-attaches as its end-sentinel
    /// child.
    pub(crate) fn upgrade_root(&mut self, ctx: &mut Transaction<'_>, id: NodeId) -> Result<()> {
        debug_assert!(self.node_is_root(id));
        debug_assert!(self.node_is_level_tail(id));
        debug_assert_eq!(self.node_field_type(id), FieldType::N0);

        // detach first: exactly one node may hold the super handle
        let sup = match mem::replace(&mut self.nodes[id].core_mut().link, NodeLink::Detached) {
            NodeLink::Root(sup) => sup,
            _ => unreachable!("upgrade_root on a non-root node"),
        };
        self.root = None;

        let old_level = self.node_level(id);
        let old_addr = self.node_laddr(id);
        let new_root = self.allocate_root(ctx, old_level, old_addr, sup)?;
        self.as_child(id, SearchPosition::end(), new_root, true);
        debug!(
            old_root = old_addr,
            new_root = self.node_laddr(new_root),
            level = old_level + 1,
            "tree.upgrade_root"
        );
        Ok(())
    }

    /// Propagates a completed child split into the parent.
    pub(crate) fn insert_parent(
        &mut self,
        ctx: &mut Transaction<'_>,
        left: NodeId,
        right: NodeId,
    ) -> Result<()> {
        let (parent, pos) = match self.nodes[left].core().link {
            NodeLink::Child { parent, pos } => (parent, pos),
            // the caller upgrades the root before splitting it
            _ => unreachable!("split node has no parent"),
        };
        self.apply_child_split(ctx, parent, pos, left, right)
    }

    /// Recursive descent carrying the match history; terminates at a leaf
    /// with a materialized cursor.
    pub(crate) fn lower_bound_tracked(
        &mut self,
        ctx: &mut Transaction<'_>,
        id: NodeId,
        key: KeyRef<'_>,
        history: &mut MatchHistory,
    ) -> Result<LookupResult> {
        match self.node_kind(id) {
            NodeKind::Internal => {
                let extent = self.node_extent(id);
                let found = extent.read(|data| -> Result<ChildLookup> {
                    InternalBlock::from_block(data)?.lower_bound(key, history)
                })?;
                let child = self.get_or_track_child(ctx, id, found.pos, found.child)?;
                self.lower_bound_tracked(ctx, child, key, history)
            }
            NodeKind::Leaf => {
                let extent = self.node_extent(id);
                let found = extent.read(|data| -> Result<LeafLookup> {
                    Ok(LeafBlock::from_block(data)?.lower_bound(key, history))
                })?;
                let cursor = self.get_or_track_cursor(id, found.pos, found.value_off);
                Ok(LookupResult {
                    cursor,
                    match_kind: found.match_kind,
                })
            }
        }
    }

    pub(crate) fn lookup_smallest_in(
        &mut self,
        ctx: &mut Transaction<'_>,
        id: NodeId,
    ) -> Result<CursorId> {
        match self.node_kind(id) {
            NodeKind::Internal => {
                let pos = SearchPosition::begin();
                let extent = self.node_extent(id);
                let child_addr = extent.read(|data| -> Result<Laddr> {
                    Ok(InternalBlock::from_block(data)?.child_at_position(&pos))
                })?;
                let child = self.get_or_track_child(ctx, id, pos, child_addr)?;
                self.lookup_smallest_in(ctx, child)
            }
            NodeKind::Leaf => {
                let extent = self.node_extent(id);
                let (pos, value_off) = extent.read(|data| -> Result<_> {
                    let block = LeafBlock::from_block(data)?;
                    if block.is_empty() {
                        Ok((SearchPosition::end(), None))
                    } else {
                        let pos = SearchPosition::begin();
                        let off = block.value_offset(&pos);
                        Ok((pos, Some(off)))
                    }
                })?;
                debug_assert!(!pos.is_end() || self.node_is_root(id));
                Ok(self.get_or_track_cursor(id, pos, value_off))
            }
        }
    }

    pub(crate) fn lookup_largest_in(
        &mut self,
        ctx: &mut Transaction<'_>,
        id: NodeId,
    ) -> Result<CursorId> {
        match self.node_kind(id) {
            NodeKind::Internal => {
                // only tail internal nodes own an end child; descending by
                // the tail chain reaches the right-most leaf
                let pos = SearchPosition::end();
                let extent = self.node_extent(id);
                let child_addr = extent.read(|data| -> Result<Laddr> {
                    Ok(InternalBlock::from_block(data)?.child_at_position(&pos))
                })?;
                let child = self.get_or_track_child(ctx, id, pos, child_addr)?;
                self.lookup_largest_in(ctx, child)
            }
            NodeKind::Leaf => {
                let extent = self.node_extent(id);
                let (pos, value_off) = extent.read(|data| -> Result<_> {
                    let block = LeafBlock::from_block(data)?;
                    if block.is_empty() {
                        Ok((SearchPosition::end(), None))
                    } else {
                        let (pos, off) = block.largest_value();
                        Ok((pos, Some(off)))
                    }
                })?;
                debug_assert!(!pos.is_end() || self.node_is_root(id));
                Ok(self.get_or_track_cursor(id, pos, value_off))
            }
        }
    }

    /// Cross-checks one tracked parent/child edge. Debug builds only.
    pub(crate) fn validate_child(&self, parent: NodeId, child: NodeId) {
        if !cfg!(debug_assertions) {
            return;
        }
        let pos = match self.nodes[child].core().link {
            NodeLink::Child { parent: p, pos } => {
                assert_eq!(p, parent, "child tracks a different parent");
                pos
            }
            _ => panic!("tracked child has no parent link"),
        };
        assert_eq!(self.node_level(parent), self.node_level(child) + 1);
        assert!(self.node_field_type(parent) <= self.node_field_type(child));

        let recorded = self.node_extent(parent).read(|data| {
            InternalBlock::from_block(data)
                .expect("validated at load time")
                .child_at_position(&pos)
        });
        assert_eq!(recorded, self.node_laddr(child), "stale child address");

        if pos.is_end() {
            assert!(self.node_is_level_tail(parent));
            assert!(self.node_is_level_tail(child));
        } else {
            assert!(!self.node_is_level_tail(child));
            let separator = self.node_extent(parent).read(|data| {
                InternalBlock::from_block(data)
                    .expect("validated at load time")
                    .key_at_position(&pos)
                    .to_owned()
            });
            assert_eq!(
                separator,
                self.node_largest_key(child),
                "separator does not name the child's largest key"
            );
        }
    }

    pub(crate) fn dump_node(
        &self,
        ctx: &mut Transaction<'_>,
        laddr: Laddr,
        depth: usize,
        out: &mut String,
    ) -> Result<()> {
        use std::fmt::Write;

        let extent = ctx.read_extent(laddr)?;
        let header = extent.read(|data| NodeHeader::from_bytes(data).map(|h| *h))?;
        let indent = "  ".repeat(depth);
        match header.node_type() {
            Some(NodeType::Leaf) => extent.read(|data| -> Result<()> {
                let block = LeafBlock::from_block(data)?;
                writeln!(
                    out,
                    "{indent}leaf laddr={laddr:#x} count={} tail={}",
                    block.count(),
                    block.is_level_tail()
                )?;
                for line in block.to_string().lines() {
                    writeln!(out, "{indent}  {line}")?;
                }
                Ok(())
            }),
            Some(NodeType::Internal) => {
                let (children, count, tail) = extent.read(|data| -> Result<_> {
                    let block = InternalBlock::from_block(data)?;
                    let mut children: Vec<Laddr> = (0..block.count())
                        .map(|i| block.child_at(i))
                        .collect();
                    if block.is_level_tail() {
                        children.push(block.tail_child());
                    }
                    Ok((children, block.count(), block.is_level_tail()))
                })?;
                writeln!(
                    out,
                    "{indent}internal laddr={laddr:#x} level={} count={count} tail={tail}",
                    header.level()
                )?;
                for child in children {
                    self.dump_node(ctx, child, depth + 1, out)?;
                }
                Ok(())
            }
            None => bail!("bad node type at laddr {:#x}", laddr),
        }
    }
}
