//! # Silt - Object Metadata Index
//!
//! Silt is the object-metadata index of a log-structured object store: a
//! persistent, copy-on-write B+tree mapping structured object keys to
//! fixed-shape metadata records. Leaves hold key/metadata entries; internal
//! nodes hold key/child-address entries. Addresses are logical block numbers
//! resolved through a transactional extent store.
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────────────────────────────────┐
//! │        Public API (BTree)            │
//! ├──────────────────────────────────────┤
//! │  Node Orchestration (tree module)    │
//! │  - tracked descent, cursor registry  │
//! │  - insert, split, root growth        │
//! ├──────────────────────────────────────┤
//! │  Node Block Layout (tree::layout)    │
//! │  - slotted cells, staged positions   │
//! ├──────────────────────────────────────┤
//! │  Extent Store (extent module)        │
//! │  - transactions, COW, superblock     │
//! └──────────────────────────────────────┘
//! ```
//!
//! ## Quick Start
//!
//! ```ignore
//! use silt::{BTree, BlockStore, ObjectKey, ObjectMeta};
//!
//! let mut store = BlockStore::new();
//! let mut tx = store.begin();
//! BTree::mkfs(&mut tx)?;
//!
//! let mut tree = BTree::new();
//! let key = ObjectKey::new(1, b"snapshots/alpha", 7)?;
//! let (cursor, inserted) = tree.insert(&mut tx, &key, &ObjectMeta::default())?;
//! assert!(inserted);
//! tx.commit()?;
//! ```
//!
//! ## Module Overview
//!
//! - [`extent`]: in-memory transactional block store, superblock handling
//! - [`tree`]: node orchestration, cursors, on-block node layouts

pub mod extent;
pub mod tree;

pub use extent::{BlockStore, Extent, Laddr, SuperHandle, Transaction, L_ADDR_NULL, NODE_BLOCK_SIZE};
pub use tree::{
    BTree, CursorId, LookupResult, MatchKind, ObjectKey, ObjectMeta, SearchPosition,
    MAX_NAME_LEN,
};
