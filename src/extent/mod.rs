//! # Extent Store
//!
//! This module provides the transactional block layer underneath the tree.
//! Tree nodes occupy fixed-size extents addressed by logical block address
//! (laddr). All reads and writes go through a [`Transaction`]:
//!
//! ```text
//! BlockStore            committed blocks, survives transactions
//!   └── Transaction     private view of the store
//!         ├── read_extent(laddr)   copy-on-first-open
//!         ├── alloc_extent()       fresh zeroed block, born mutable
//!         ├── prepare_mutate(..)   marks an open extent writable (COW)
//!         └── commit()             publishes every mutable extent
//! ```
//!
//! ## Copy-on-Write Model
//!
//! Opening an extent copies the committed bytes into a transaction-private
//! buffer; repeated opens of the same laddr within one transaction share that
//! buffer. Mutations require an explicit `prepare_mutate` and stay private
//! until `commit`. Dropping a transaction without committing aborts it: the
//! committed store is left byte-identical, which is what makes half-applied
//! tree mutations safe to abandon.
//!
//! ## Sharing Model
//!
//! An [`Extent`] is a shared handle (`Rc<RefCell<..>>`): the node object and
//! its block views alias the same buffer. The store is single-threaded
//! cooperative, so interior mutability is sufficient; the `read`/`write`
//! closures keep borrows scoped to one call.
//!
//! ## Superblock
//!
//! Block 0 is the superblock. It carries the root node address and is the
//! only block written outside the node layouts; see [`superblock`].

mod superblock;

pub use superblock::{SuperHandle, SUPERBLOCK_LADDR, SUPER_MAGIC, SUPER_VERSION};

use std::cell::RefCell;
use std::rc::Rc;

use eyre::{bail, Result};
use hashbrown::HashMap;
use tracing::trace;

use superblock::SuperblockHeader;

/// Logical block address within the store's address space.
pub type Laddr = u64;

/// The null address. Block 0 is the superblock, so no node ever lives there.
pub const L_ADDR_NULL: Laddr = 0;

/// Fixed extent size for every node, independent of field type.
pub const NODE_BLOCK_SIZE: usize = 4096;

struct ExtentInner {
    laddr: Laddr,
    data: Box<[u8]>,
    mutable: bool,
}

/// Shared handle to one open block of a transaction.
///
/// Cloning the handle shares the underlying buffer. Read and write access is
/// scoped through closures so no borrow outlives a single call.
#[derive(Clone)]
pub struct Extent {
    inner: Rc<RefCell<ExtentInner>>,
}

impl Extent {
    fn open(laddr: Laddr, data: Box<[u8]>, mutable: bool) -> Self {
        debug_assert_eq!(data.len(), NODE_BLOCK_SIZE);
        Self {
            inner: Rc::new(RefCell::new(ExtentInner {
                laddr,
                data,
                mutable,
            })),
        }
    }

    pub fn laddr(&self) -> Laddr {
        self.inner.borrow().laddr
    }

    /// Whether `prepare_mutate` has been issued (fresh extents are born
    /// mutable).
    pub fn is_mutable(&self) -> bool {
        self.inner.borrow().mutable
    }

    pub fn read<R>(&self, f: impl FnOnce(&[u8]) -> R) -> R {
        let inner = self.inner.borrow();
        f(&inner.data)
    }

    /// Mutable view of the block. Panics if the extent has not been prepared
    /// for mutation; a write without COW intent is a programmer bug.
    pub fn write<R>(&self, f: impl FnOnce(&mut [u8]) -> R) -> R {
        let mut inner = self.inner.borrow_mut();
        assert!(
            inner.mutable,
            "write to extent {:#x} without prepare_mutate",
            inner.laddr
        );
        f(&mut inner.data)
    }

    fn make_mutable(&self) {
        self.inner.borrow_mut().mutable = true;
    }

    fn snapshot(&self) -> Option<(Laddr, Box<[u8]>)> {
        let inner = self.inner.borrow();
        inner.mutable.then(|| (inner.laddr, inner.data.clone()))
    }
}

impl std::fmt::Debug for Extent {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let inner = self.inner.borrow();
        f.debug_struct("Extent")
            .field("laddr", &inner.laddr)
            .field("mutable", &inner.mutable)
            .finish()
    }
}

/// In-memory store of committed extents.
///
/// One transaction at a time: `begin` borrows the store mutably for the
/// transaction's whole lifetime.
pub struct BlockStore {
    blocks: HashMap<Laddr, Box<[u8]>>,
    next_laddr: Laddr,
}

impl BlockStore {
    pub fn new() -> Self {
        Self {
            blocks: HashMap::new(),
            next_laddr: SUPERBLOCK_LADDR + 1,
        }
    }

    pub fn begin(&mut self) -> Transaction<'_> {
        let next_laddr = self.next_laddr;
        Transaction {
            store: self,
            open: HashMap::new(),
            next_laddr,
        }
    }

    /// Number of committed blocks, superblock included.
    pub fn block_count(&self) -> usize {
        self.blocks.len()
    }
}

impl Default for BlockStore {
    fn default() -> Self {
        Self::new()
    }
}

/// A private view of the store. All tree operations run inside one.
pub struct Transaction<'s> {
    store: &'s mut BlockStore,
    open: HashMap<Laddr, Extent>,
    next_laddr: Laddr,
}

impl Transaction<'_> {
    /// Opens the extent at `laddr`. The first open within a transaction
    /// copies the committed bytes; later opens return the same handle.
    pub fn read_extent(&mut self, laddr: Laddr) -> Result<Extent> {
        if let Some(extent) = self.open.get(&laddr) {
            return Ok(extent.clone());
        }
        let Some(block) = self.store.blocks.get(&laddr) else {
            bail!("read of unallocated extent {:#x}", laddr);
        };
        let extent = Extent::open(laddr, block.clone(), false);
        self.open.insert(laddr, extent.clone());
        Ok(extent)
    }

    /// Allocates a fresh zeroed extent at the next free laddr.
    pub fn alloc_extent(&mut self) -> Result<Extent> {
        let laddr = self.next_laddr;
        self.next_laddr += 1;
        let extent = Extent::open(laddr, vec![0u8; NODE_BLOCK_SIZE].into_boxed_slice(), true);
        self.open.insert(laddr, extent.clone());
        trace!(laddr, "extent.alloc");
        Ok(extent)
    }

    /// Signals copy-on-write intent for an open extent. Until this is
    /// called, the extent is a stable read view.
    pub fn prepare_mutate(&self, extent: &Extent) {
        extent.make_mutable();
    }

    /// Reads the superblock, formatting it on first use.
    pub fn get_super(&mut self) -> Result<SuperHandle> {
        if !self.open.contains_key(&SUPERBLOCK_LADDR)
            && !self.store.blocks.contains_key(&SUPERBLOCK_LADDR)
        {
            let extent = Extent::open(
                SUPERBLOCK_LADDR,
                vec![0u8; NODE_BLOCK_SIZE].into_boxed_slice(),
                true,
            );
            extent.write(|data| SuperblockHeader::format(data));
            self.open.insert(SUPERBLOCK_LADDR, extent);
            trace!("extent.superblock.format");
        }
        let extent = self.read_extent(SUPERBLOCK_LADDR)?;
        let root_laddr = extent.read(|data| -> Result<Laddr> {
            Ok(SuperblockHeader::from_bytes(data)?.root_laddr())
        })?;
        Ok(SuperHandle::new(root_laddr))
    }

    pub(crate) fn write_root_laddr(&mut self, laddr: Laddr) -> Result<()> {
        let extent = self.read_extent(SUPERBLOCK_LADDR)?;
        self.prepare_mutate(&extent);
        extent.write(|data| -> Result<()> {
            SuperblockHeader::from_bytes_mut(data)?.set_root_laddr(laddr);
            Ok(())
        })
    }

    /// Publishes every mutable open extent to the store. Dropping the
    /// transaction instead aborts it.
    pub fn commit(self) -> Result<()> {
        let mut published = 0usize;
        for extent in self.open.values() {
            if let Some((laddr, data)) = extent.snapshot() {
                self.store.blocks.insert(laddr, data);
                published += 1;
            }
        }
        self.store.next_laddr = self.next_laddr;
        trace!(published, "extent.commit");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn alloc_starts_above_superblock() {
        let mut store = BlockStore::new();
        let mut tx = store.begin();

        let extent = tx.alloc_extent().unwrap();
        assert_eq!(extent.laddr(), SUPERBLOCK_LADDR + 1);
        assert!(extent.is_mutable());
    }

    #[test]
    fn read_of_unallocated_extent_fails() {
        let mut store = BlockStore::new();
        let mut tx = store.begin();

        let result = tx.read_extent(42);
        assert!(result.is_err());
        assert!(result.unwrap_err().to_string().contains("unallocated"));
    }

    #[test]
    fn repeated_reads_share_one_handle() {
        let mut store = BlockStore::new();
        {
            let mut tx = store.begin();
            let extent = tx.alloc_extent().unwrap();
            extent.write(|data| data[100] = 7);
            tx.commit().unwrap();
        }

        let mut tx = store.begin();
        let a = tx.read_extent(1).unwrap();
        let b = tx.read_extent(1).unwrap();
        tx.prepare_mutate(&a);
        a.write(|data| data[100] = 9);
        assert_eq!(b.read(|data| data[100]), 9);
    }

    #[test]
    fn commit_publishes_only_mutable_extents() {
        let mut store = BlockStore::new();
        {
            let mut tx = store.begin();
            let a = tx.alloc_extent().unwrap();
            a.write(|data| data[0] = 1);
            let b = tx.alloc_extent().unwrap();
            b.write(|data| data[0] = 2);
            tx.commit().unwrap();
        }
        assert_eq!(store.block_count(), 2);

        {
            let mut tx = store.begin();
            let a = tx.read_extent(1).unwrap();
            tx.prepare_mutate(&a);
            a.write(|data| data[0] = 10);
            // b stays a read view
            tx.read_extent(2).unwrap();
            tx.commit().unwrap();
        }

        let mut tx = store.begin();
        assert_eq!(tx.read_extent(1).unwrap().read(|d| d[0]), 10);
        assert_eq!(tx.read_extent(2).unwrap().read(|d| d[0]), 2);
    }

    #[test]
    fn dropped_transaction_discards_writes() {
        let mut store = BlockStore::new();
        {
            let mut tx = store.begin();
            let a = tx.alloc_extent().unwrap();
            a.write(|data| data[0] = 1);
            tx.commit().unwrap();
        }

        {
            let mut tx = store.begin();
            let a = tx.read_extent(1).unwrap();
            tx.prepare_mutate(&a);
            a.write(|data| data[0] = 99);
            // no commit
        }

        let mut tx = store.begin();
        assert_eq!(tx.read_extent(1).unwrap().read(|d| d[0]), 1);
    }

    #[test]
    fn aborted_alloc_does_not_leak_laddrs_forward() {
        let mut store = BlockStore::new();
        {
            let mut tx = store.begin();
            tx.alloc_extent().unwrap();
            // no commit
        }
        let mut tx = store.begin();
        // the aborted allocation is reused
        assert_eq!(tx.alloc_extent().unwrap().laddr(), 1);
    }

    #[test]
    fn write_without_prepare_mutate_panics() {
        let mut store = BlockStore::new();
        {
            let mut tx = store.begin();
            tx.alloc_extent().unwrap();
            tx.commit().unwrap();
        }
        let mut tx = store.begin();
        let extent = tx.read_extent(1).unwrap();
        let result = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| {
            extent.write(|data| data[0] = 1);
        }));
        assert!(result.is_err());
    }

    #[test]
    fn get_super_formats_once_and_persists() {
        let mut store = BlockStore::new();
        {
            let mut tx = store.begin();
            let sup = tx.get_super().unwrap();
            assert_eq!(sup.root_laddr(), L_ADDR_NULL);
            tx.write_root_laddr(17).unwrap();
            tx.commit().unwrap();
        }

        let mut tx = store.begin();
        let sup = tx.get_super().unwrap();
        assert_eq!(sup.root_laddr(), 17);
    }
}
