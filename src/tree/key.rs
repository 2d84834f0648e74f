//! # Object Keys
//!
//! An object key is the structured triple `(bucket, name, seq)`:
//!
//! - **bucket**: placement group of the object
//! - **name**: variable-length object name (raw bytes, at most
//!   [`MAX_NAME_LEN`])
//! - **seq**: version sequence within the name
//!
//! Keys order lexicographically by component, and the three components map
//! one-to-one onto the three position stages of a node: distinct buckets
//! form LEFT groups, distinct names MID groups, and seq entries RIGHT
//! entries.
//!
//! ## Encoded Form (within a node cell)
//!
//! ```text
//! Offset  Size  Field
//! ------  ----  ---------
//! 0       8     bucket (LE)
//! 8       8     seq (LE)
//! 16      2     name_len (LE)
//! 18      n     name
//! ```

use std::cmp::Ordering;
use std::fmt;

use eyre::{ensure, Result};
use smallvec::SmallVec;

/// Upper bound on the name component, keeping every cell well under a
/// quarter of a node block.
pub const MAX_NAME_LEN: usize = 1024;

/// Fixed prefix of an encoded key (bucket + seq + name_len).
pub const KEY_FIXED_LEN: usize = 18;

/// Owned object key.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ObjectKey {
    bucket: u64,
    name: SmallVec<[u8; 16]>,
    seq: u64,
}

impl ObjectKey {
    pub fn new(bucket: u64, name: &[u8], seq: u64) -> Result<Self> {
        ensure!(
            name.len() <= MAX_NAME_LEN,
            "object name too long: {} > {}",
            name.len(),
            MAX_NAME_LEN
        );
        Ok(Self {
            bucket,
            name: SmallVec::from_slice(name),
            seq,
        })
    }

    pub fn bucket(&self) -> u64 {
        self.bucket
    }

    pub fn name(&self) -> &[u8] {
        &self.name
    }

    pub fn seq(&self) -> u64 {
        self.seq
    }

    pub fn as_ref(&self) -> KeyRef<'_> {
        KeyRef {
            bucket: self.bucket,
            name: &self.name,
            seq: self.seq,
        }
    }
}

impl PartialOrd for ObjectKey {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for ObjectKey {
    fn cmp(&self, other: &Self) -> Ordering {
        self.as_ref().cmp(&other.as_ref())
    }
}

impl fmt::Display for ObjectKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_ref())
    }
}

/// Borrowed view of a key, pointing into a node block or an [`ObjectKey`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct KeyRef<'a> {
    pub bucket: u64,
    pub name: &'a [u8],
    pub seq: u64,
}

impl<'a> KeyRef<'a> {
    pub fn to_owned(self) -> ObjectKey {
        ObjectKey {
            bucket: self.bucket,
            name: SmallVec::from_slice(self.name),
            seq: self.seq,
        }
    }

    /// Number of leading components shared with `other`: 2 when bucket and
    /// name agree, 1 when only the bucket does, 0 otherwise.
    pub fn shared_components(&self, other: &KeyRef<'_>) -> u8 {
        if self.bucket != other.bucket {
            0
        } else if self.name != other.name {
            1
        } else {
            2
        }
    }

    pub fn encoded_len(&self) -> usize {
        KEY_FIXED_LEN + self.name.len()
    }

    /// Writes the encoded form; `out` must hold exactly `encoded_len` bytes.
    pub fn encode_into(&self, out: &mut [u8]) {
        debug_assert_eq!(out.len(), self.encoded_len());
        out[0..8].copy_from_slice(&self.bucket.to_le_bytes());
        out[8..16].copy_from_slice(&self.seq.to_le_bytes());
        out[16..18].copy_from_slice(&(self.name.len() as u16).to_le_bytes());
        out[18..].copy_from_slice(self.name);
    }

    /// Decodes a key from the start of `data`.
    pub fn decode(data: &'a [u8]) -> KeyRef<'a> {
        let bucket = u64::from_le_bytes(data[0..8].try_into().unwrap());
        let seq = u64::from_le_bytes(data[8..16].try_into().unwrap());
        let name_len = u16::from_le_bytes(data[16..18].try_into().unwrap()) as usize;
        KeyRef {
            bucket,
            name: &data[18..18 + name_len],
            seq,
        }
    }
}

impl PartialOrd for KeyRef<'_> {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for KeyRef<'_> {
    fn cmp(&self, other: &Self) -> Ordering {
        self.bucket
            .cmp(&other.bucket)
            .then_with(|| self.name.cmp(other.name))
            .then_with(|| self.seq.cmp(&other.seq))
    }
}

impl fmt::Display for KeyRef<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}/{}@{}",
            self.bucket,
            String::from_utf8_lossy(self.name),
            self.seq
        )
    }
}
