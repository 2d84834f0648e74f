//! # Superblock
//!
//! Block 0 of the store carries the persisted root pointer of the tree.
//!
//! ## Layout (16 bytes)
//!
//! ```text
//! Offset  Size  Field       Description
//! ------  ----  ----------  --------------------------------
//! 0       4     magic       Store identity ("SILT")
//! 4       2     version     Format version
//! 6       2     reserved    Zero
//! 8       8     root_laddr  Current tree root (0 = unset)
//! ```
//!
//! The rest of the block is reserved. A [`SuperHandle`] mediates access to
//! the root pointer within one transaction and is owned by the current root
//! node; growing the root moves the handle to the new root.

use eyre::{ensure, Result};
use zerocopy::byteorder::{LittleEndian, U16, U32, U64};
use zerocopy::{FromBytes, Immutable, IntoBytes, KnownLayout, Unaligned};

use super::{Laddr, Transaction, L_ADDR_NULL};

/// The superblock always lives at block 0.
pub const SUPERBLOCK_LADDR: Laddr = 0;

pub const SUPER_MAGIC: u32 = 0x544c_4953; // "SILT"
pub const SUPER_VERSION: u16 = 1;

#[repr(C)]
#[derive(Debug, Clone, Copy, FromBytes, IntoBytes, Immutable, KnownLayout, Unaligned)]
pub(crate) struct SuperblockHeader {
    magic: U32<LittleEndian>,
    version: U16<LittleEndian>,
    reserved: U16<LittleEndian>,
    root_laddr: U64<LittleEndian>,
}

impl SuperblockHeader {
    pub(crate) fn format(data: &mut [u8]) {
        let header = Self {
            magic: U32::new(SUPER_MAGIC),
            version: U16::new(SUPER_VERSION),
            reserved: U16::new(0),
            root_laddr: U64::new(L_ADDR_NULL),
        };
        data[..size_of::<Self>()].copy_from_slice(header.as_bytes());
    }

    pub(crate) fn from_bytes(data: &[u8]) -> Result<&Self> {
        ensure!(
            data.len() >= size_of::<Self>(),
            "buffer too small for superblock: {} < {}",
            data.len(),
            size_of::<Self>()
        );
        let header = Self::ref_from_bytes(&data[..size_of::<Self>()])
            .map_err(|e| eyre::eyre!("failed to read superblock: {:?}", e))?;
        ensure!(
            header.magic.get() == SUPER_MAGIC,
            "bad superblock magic: {:#010x}",
            header.magic.get()
        );
        ensure!(
            header.version.get() == SUPER_VERSION,
            "unsupported superblock version: {}",
            header.version.get()
        );
        Ok(header)
    }

    pub(crate) fn from_bytes_mut(data: &mut [u8]) -> Result<&mut Self> {
        Self::from_bytes(data)?;
        Ok(Self::mut_from_bytes(&mut data[..size_of::<Self>()])
            .expect("superblock header validated above"))
    }

    pub(crate) fn root_laddr(&self) -> Laddr {
        self.root_laddr.get()
    }

    pub(crate) fn set_root_laddr(&mut self, laddr: Laddr) {
        self.root_laddr = U64::new(laddr);
    }
}

/// Scoped handle to the transaction's root pointer.
///
/// Held by the current root node only; `upgrade_root` transfers it to the
/// new root when the tree grows a level.
#[derive(Debug)]
pub struct SuperHandle {
    root_laddr: Laddr,
}

impl SuperHandle {
    pub(crate) fn new(root_laddr: Laddr) -> Self {
        Self { root_laddr }
    }

    pub fn root_laddr(&self) -> Laddr {
        self.root_laddr
    }

    /// Persists a new root address through the transaction.
    pub fn write_root_laddr(&mut self, ctx: &mut Transaction<'_>, laddr: Laddr) -> Result<()> {
        ctx.write_root_laddr(laddr)?;
        self.root_laddr = laddr;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn superblock_header_is_16_bytes() {
        assert_eq!(size_of::<SuperblockHeader>(), 16);
    }

    #[test]
    fn format_then_parse_round_trip() {
        let mut data = [0u8; 64];
        SuperblockHeader::format(&mut data);

        let header = SuperblockHeader::from_bytes(&data).unwrap();
        assert_eq!(header.root_laddr(), L_ADDR_NULL);
    }

    #[test]
    fn bad_magic_is_rejected() {
        let mut data = [0u8; 64];
        SuperblockHeader::format(&mut data);
        data[0] ^= 0xFF;

        let result = SuperblockHeader::from_bytes(&data);
        assert!(result.is_err());
        assert!(result.unwrap_err().to_string().contains("magic"));
    }

    #[test]
    fn set_root_laddr_writes_through() {
        let mut data = [0u8; 64];
        SuperblockHeader::format(&mut data);

        SuperblockHeader::from_bytes_mut(&mut data)
            .unwrap()
            .set_root_laddr(0xABCD);
        assert_eq!(SuperblockHeader::from_bytes(&data).unwrap().root_laddr(), 0xABCD);
    }
}
