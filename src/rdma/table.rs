//! Resource index tables.
//!
//! Completions carry a 24-bit resource number: the kernel-assigned QP or SRQ
//! number in legacy mode, or a driver-chosen user index ("uidx") when the
//! adapter reports CQE version 1 or later. These tables resolve such numbers
//! back to the in-process object.
//!
//! A table is split into `TABLE_SIZE` chunks of `CHUNK_SIZE` slots each.
//! Chunks are allocated on first use and freed when their last entry is
//! cleared, so the table grows without ever moving stored entries.

use std::sync::{Arc, Weak};

use crate::error::{Error, Result};
use crate::rdma::qp::QpInner;
use crate::rdma::srq::SrqInner;
use crate::rdma::wq::WqInner;

const CHUNK_SHIFT: u32 = 12;
const CHUNK_MASK: u32 = (1 << CHUNK_SHIFT) - 1;
const CHUNK_SIZE: usize = 1 << CHUNK_SHIFT;
const TABLE_SIZE: usize = 1 << (24 - CHUNK_SHIFT);

#[derive(Debug)]
struct Chunk<T> {
    refcnt: u32,
    slots: Option<Box<[Option<T>]>>,
}

impl<T> Default for Chunk<T> {
    fn default() -> Self {
        Self {
            refcnt: 0,
            slots: None,
        }
    }
}

/// A two-level table keyed by a 24-bit index.
#[derive(Debug)]
pub struct IndexTable<T> {
    chunks: Vec<Chunk<T>>,
}

impl<T> Default for IndexTable<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> IndexTable<T> {
    /// Create an empty table. No chunk is allocated yet.
    pub fn new() -> Self {
        let mut chunks = Vec::with_capacity(TABLE_SIZE);
        chunks.resize_with(TABLE_SIZE, Chunk::default);
        Self { chunks }
    }

    #[inline]
    fn split(index: u32) -> Option<(usize, usize)> {
        let tind = (index >> CHUNK_SHIFT) as usize;
        (tind < TABLE_SIZE).then_some((tind, (index & CHUNK_MASK) as usize))
    }

    /// Store `value` at `index`, allocating the chunk if needed.
    ///
    /// Used in legacy mode with kernel-assigned numbers.
    pub fn store_at(&mut self, index: u32, value: T) -> Result<()> {
        let (tind, slot) = Self::split(index).ok_or(Error::InvalidArgument("index exceeds 24 bits"))?;
        let chunk = &mut self.chunks[tind];
        let slots = chunk.slots.get_or_insert_with(|| {
            let mut v = Vec::with_capacity(CHUNK_SIZE);
            v.resize_with(CHUNK_SIZE, || None);
            v.into_boxed_slice()
        });
        if slots[slot].replace(value).is_none() {
            chunk.refcnt += 1;
        }
        Ok(())
    }

    /// Store `value` at the lowest free index and return that index.
    ///
    /// A chunk accepts at most `CHUNK_SIZE - 1` entries before the next
    /// chunk is opened.
    pub fn store(&mut self, value: T) -> Result<u32> {
        let tind = self
            .chunks
            .iter()
            .position(|c| c.refcnt < CHUNK_MASK)
            .ok_or(Error::OutOfMemory("no free user index"))?;
        let chunk = &self.chunks[tind];
        let slot = match &chunk.slots {
            Some(slots) if chunk.refcnt > 0 => slots
                .iter()
                .position(Option::is_none)
                .ok_or(Error::OutOfMemory("no free user index"))?,
            _ => 0,
        };
        let index = ((tind as u32) << CHUNK_SHIFT) | slot as u32;
        self.store_at(index, value)?;
        Ok(index)
    }

    /// Look up the entry at `index`.
    pub fn lookup(&self, index: u32) -> Option<&T> {
        let (tind, slot) = Self::split(index)?;
        let chunk = &self.chunks[tind];
        if chunk.refcnt == 0 {
            return None;
        }
        chunk.slots.as_ref()?[slot].as_ref()
    }

    /// Remove the entry at `index`. Clearing an empty slot is a no-op.
    pub fn clear(&mut self, index: u32) -> Option<T> {
        let (tind, slot) = Self::split(index)?;
        let chunk = &mut self.chunks[tind];
        let value = chunk.slots.as_mut()?[slot].take()?;
        chunk.refcnt -= 1;
        if chunk.refcnt == 0 {
            chunk.slots = None;
        }
        Some(value)
    }

    /// Number of stored entries.
    pub fn len(&self) -> usize {
        self.chunks.iter().map(|c| c.refcnt as usize).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.chunks.iter().all(|c| c.refcnt == 0)
    }

    /// Number of allocated chunks.
    pub fn allocated_chunks(&self) -> usize {
        self.chunks.iter().filter(|c| c.slots.is_some()).count()
    }
}

/// Resource kind of a table entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RscType {
    Qp,
    Srq,
    /// SRQ created through the extended path (XRC or tag matching).
    Xsrq,
    Rwq,
}

/// A table entry: a non-owning reference to a QP, SRQ or RWQ.
#[derive(Debug, Clone)]
pub enum Resource {
    Qp(Weak<QpInner>),
    Srq(Weak<SrqInner>, RscType),
    Rwq(Weak<WqInner>),
}

impl Resource {
    pub(crate) fn qp(qp: &Arc<QpInner>) -> Self {
        Resource::Qp(Arc::downgrade(qp))
    }

    pub(crate) fn srq(srq: &Arc<SrqInner>, ty: RscType) -> Self {
        Resource::Srq(Arc::downgrade(srq), ty)
    }

    pub(crate) fn rwq(wq: &Arc<WqInner>) -> Self {
        Resource::Rwq(Arc::downgrade(wq))
    }

    /// Resource kind.
    pub fn kind(&self) -> RscType {
        match self {
            Resource::Qp(_) => RscType::Qp,
            Resource::Srq(_, ty) => *ty,
            Resource::Rwq(_) => RscType::Rwq,
        }
    }

    /// The resource number completions carry for this object, if it is
    /// still alive.
    pub fn rsn(&self) -> Option<u32> {
        match self {
            Resource::Qp(w) => w.upgrade().map(|qp| qp.rsn()),
            Resource::Srq(w, _) => w.upgrade().map(|srq| srq.rsn()),
            Resource::Rwq(w) => w.upgrade().map(|wq| wq.rsn()),
        }
    }

    /// Whether the referenced object is still alive.
    pub fn is_alive(&self) -> bool {
        match self {
            Resource::Qp(w) => w.strong_count() > 0,
            Resource::Srq(w, _) => w.strong_count() > 0,
            Resource::Rwq(w) => w.strong_count() > 0,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_store_lookup_clear() {
        let mut table = IndexTable::new();
        let a = table.store("a").unwrap();
        let b = table.store("b").unwrap();
        assert_eq!((a, b), (0, 1));
        assert_eq!(table.lookup(a), Some(&"a"));
        assert_eq!(table.lookup(b), Some(&"b"));

        assert_eq!(table.clear(a), Some("a"));
        assert_eq!(table.lookup(a), None);
        assert_eq!(table.clear(a), None);

        // The lowest free index is reused.
        assert_eq!(table.store("c").unwrap(), 0);
        assert_eq!(table.len(), 2);
    }

    #[test]
    fn test_growth_preserves_entries() {
        let mut table = IndexTable::new();
        let n = CHUNK_SIZE + 10;
        let indices: Vec<u32> = (0..n).map(|i| table.store(i).unwrap()).collect();
        assert_eq!(table.allocated_chunks(), 2);

        // A chunk holds at most CHUNK_SIZE - 1 entries.
        assert_eq!(indices[CHUNK_SIZE - 2], (CHUNK_SIZE - 2) as u32);
        assert_eq!(indices[CHUNK_SIZE - 1], CHUNK_SIZE as u32);

        for (value, idx) in indices.iter().enumerate() {
            assert_eq!(table.lookup(*idx), Some(&value));
        }
    }

    #[test]
    fn test_chunk_freed_with_last_entry() {
        let mut table = IndexTable::new();
        table.store_at(0x12_3456, 7u32).unwrap();
        assert_eq!(table.allocated_chunks(), 1);
        assert_eq!(table.lookup(0x12_3456), Some(&7));
        assert_eq!(table.lookup(0x12_3457), None);

        table.clear(0x12_3456);
        assert_eq!(table.allocated_chunks(), 0);
        assert!(table.is_empty());
        assert!(table.store_at(1 << 24, 1).is_err());
    }
}
