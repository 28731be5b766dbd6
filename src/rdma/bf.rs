//! Doorbell registers ("BF" entries).
//!
//! Every UAR page carries four register windows. The first two of each UAR
//! are regular registers, the last two are fast-path registers. Static
//! registers are mapped when the context opens and handed out round-robin by
//! the kernel, so several QPs may ring through the same one. Dynamic
//! registers are leased one-to-one to thread domains and never need a lock.

use std::ptr::NonNull;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};

use crate::error::{Error, Result};
use crate::mmap::{MapKind, MappedPage, Mapper};
use crate::utils::lock;

/// Size of one adapter UAR page.
pub const ADAPTER_PAGE_SIZE: usize = 4096;
/// Offset of the first register window in a UAR.
pub const BF_OFFSET: usize = 0x800;
/// Register windows per UAR.
pub const NUM_BFREGS_PER_UAR: u32 = 4;
/// Non-fast-path register windows per UAR.
pub const NUM_NON_FP_BFREGS_PER_UAR: u32 = 2;

/// One doorbell register window.
#[derive(Debug)]
pub struct Bf {
    reg: Option<NonNull<u8>>,
    buf_size: u32,
    uuarn: u32,
    dyn_index: Option<u32>,
    need_lock: bool,
    /// Serializes writers of a shared register.
    lock: spin::Mutex<()>,
    /// Offset toggle between the two halves of the window.
    offset: AtomicU32,
}

// SAFETY: the register is device memory; concurrent writers are serialized by
// `lock` when `need_lock` is set and excluded by ownership otherwise.
unsafe impl Send for Bf {}
unsafe impl Sync for Bf {}

impl Bf {
    /// The index of this register as seen by the adapter.
    #[inline]
    pub fn uuarn(&self) -> u32 {
        self.uuarn
    }

    /// Size of the write-combining half window. Zero if doorbells must go
    /// through plain 8-byte writes.
    #[inline]
    pub fn buf_size(&self) -> u32 {
        self.buf_size
    }

    /// Whether doorbell writes must take the register lock.
    #[inline]
    pub fn need_lock(&self) -> bool {
        self.need_lock
    }

    /// Dynamic slot number, for dedicated registers.
    #[inline]
    pub fn dyn_index(&self) -> Option<u32> {
        self.dyn_index
    }

    /// Address of the register window.
    #[inline]
    pub fn reg(&self) -> Option<NonNull<u8>> {
        self.reg
    }

    /// Run `f` with the current write address, then flip to the other half
    /// of the window.
    ///
    /// Shared registers are locked for the duration of `f`. Registers with a
    /// single owner are written without the lock.
    pub fn ring<R>(&self, f: impl FnOnce(NonNull<u8>) -> R) -> Option<R> {
        let reg = self.reg?;
        let _guard = self.need_lock.then(|| self.lock.lock());
        let offset = self.offset.load(Ordering::Relaxed);
        let target = NonNull::new(reg.as_ptr().wrapping_add(offset as usize))?;
        let ret = f(target);
        if self.buf_size > 0 {
            self.offset.store(offset ^ self.buf_size, Ordering::Relaxed);
        }
        Some(ret)
    }
}

/// Geometry of the register pages.
#[derive(Debug, Clone, Copy)]
pub struct BfLayout {
    pub uars_per_page: u32,
    pub bf_reg_size: u32,
    pub page_size: usize,
}

impl BfLayout {
    /// Dynamic registers served by one mapped system page.
    #[inline]
    pub fn dyn_bfregs_per_page(&self) -> u32 {
        self.uars_per_page * NUM_NON_FP_BFREGS_PER_UAR
    }

    /// `(page index, byte offset within the page)` of a dynamic slot.
    pub fn dyn_position(&self, dyn_index: u32) -> (u32, usize) {
        let per_page = self.dyn_bfregs_per_page();
        let page = dyn_index / per_page;
        let uar_in_page = (dyn_index % per_page) / NUM_NON_FP_BFREGS_PER_UAR;
        let index_in_uar = dyn_index % NUM_NON_FP_BFREGS_PER_UAR;
        let offset = uar_in_page as usize * ADAPTER_PAGE_SIZE
            + BF_OFFSET
            + index_in_uar as usize * self.bf_reg_size as usize;
        (page, offset)
    }
}

#[derive(Debug)]
struct DynBfregs {
    /// Usage counter per dynamic slot.
    count: Vec<u32>,
    /// Mapped pages per page group.
    pages: Vec<Option<MappedPage>>,
    /// Register entries, built on first acquisition of a slot.
    bfs: Vec<Option<Arc<Bf>>>,
}

/// All doorbell registers of a context.
#[derive(Debug)]
pub struct BfPool {
    layout: BfLayout,
    statics: Vec<Arc<Bf>>,
    _static_pages: Vec<MappedPage>,
    dynamic: Mutex<DynBfregs>,
}

impl BfPool {
    /// Map the static registers and prepare `num_dyn` dynamic slots.
    ///
    /// `tot_uuars` counts non-fast-path registers; the trailing
    /// `low_lat_uuars` of them are dedicated to single QPs and need no lock.
    pub fn open(
        mapper: &dyn Mapper,
        layout: BfLayout,
        tot_uuars: u32,
        low_lat_uuars: u32,
        num_dyn: u32,
        single_threaded: bool,
    ) -> Result<Self> {
        let gross_uuars = tot_uuars / NUM_NON_FP_BFREGS_PER_UAR * NUM_BFREGS_PER_UAR;
        let per_page = NUM_NON_FP_BFREGS_PER_UAR * layout.uars_per_page;
        let num_pages = tot_uuars.div_ceil(per_page.max(1));

        let mut pages = Vec::with_capacity(num_pages as usize);
        let mut statics = Vec::with_capacity(gross_uuars as usize);
        for i in 0..num_pages {
            let page = mapper.map(MapKind::Regular, i, layout.page_size)?;
            for j in 0..layout.uars_per_page {
                for k in 0..NUM_BFREGS_PER_UAR {
                    let bfi = (i * layout.uars_per_page + j) * NUM_BFREGS_PER_UAR + k;
                    if bfi >= gross_uuars {
                        break;
                    }
                    let offset = ADAPTER_PAGE_SIZE * j as usize
                        + BF_OFFSET
                        + k as usize * layout.bf_reg_size as usize;
                    let reg = NonNull::new(page.as_ptr().wrapping_add(offset));
                    let need_lock =
                        !single_threaded && need_uuar_lock(bfi, tot_uuars, low_lat_uuars);
                    statics.push(Arc::new(Bf {
                        reg,
                        buf_size: if bfi > 0 { layout.bf_reg_size / 2 } else { 0 },
                        uuarn: bfi,
                        dyn_index: None,
                        need_lock,
                        lock: spin::Mutex::new(()),
                        offset: AtomicU32::new(0),
                    }));
                }
            }
            pages.push(page);
        }

        let num_dyn_pages = num_dyn.div_ceil(layout.dyn_bfregs_per_page().max(1));
        let dynamic = DynBfregs {
            count: vec![0; num_dyn as usize],
            pages: (0..num_dyn_pages).map(|_| None).collect(),
            bfs: (0..num_dyn).map(|_| None).collect(),
        };

        Ok(Self {
            layout,
            statics,
            _static_pages: pages,
            dynamic: Mutex::new(dynamic),
        })
    }

    /// Index of the first dynamic register in the global register space.
    #[inline]
    pub fn start_dyn_index(&self) -> u32 {
        self.statics.len() as u32
    }

    /// A statically mapped register by its global index.
    pub fn static_bf(&self, uuarn: u32) -> Option<Arc<Bf>> {
        self.statics.get(uuarn as usize).cloned()
    }

    /// Number of statically mapped registers.
    pub fn num_static(&self) -> usize {
        self.statics.len()
    }

    /// Lease a dedicated register.
    ///
    /// Takes the first free dynamic slot and maps its page if no other slot
    /// of the same page group did so already. Fails with
    /// [`Error::Exhausted`] when every slot is in use.
    pub fn acquire_dedicated(&self, mapper: &dyn Mapper) -> Result<Arc<Bf>> {
        let mut dynamic = lock(&self.dynamic);
        let dyn_index = dynamic
            .count
            .iter()
            .position(|&c| c == 0)
            .ok_or(Error::Exhausted)?;
        dynamic.count[dyn_index] += 1;

        if let Some(bf) = &dynamic.bfs[dyn_index] {
            return Ok(bf.clone());
        }

        let (page_index, offset) = self.layout.dyn_position(dyn_index as u32);
        let page_slot = page_index as usize;
        if dynamic.pages[page_slot].is_none() {
            match mapper.map(MapKind::RegularDyn, page_index, self.layout.page_size) {
                Ok(page) => dynamic.pages[page_slot] = Some(page),
                Err(e) => {
                    dynamic.count[dyn_index] -= 1;
                    log::debug!("rmlx5: cannot map dynamic UAR page {}: {}", page_index, e);
                    return Err(e.into());
                }
            }
        }
        let base = dynamic.pages[page_slot]
            .as_ref()
            .map(MappedPage::as_ptr)
            .ok_or(Error::OutOfMemory("dynamic UAR page"))?;

        let bf = Arc::new(Bf {
            reg: NonNull::new(base.wrapping_add(offset)),
            buf_size: self.layout.bf_reg_size / 2,
            uuarn: self.start_dyn_index() + dyn_index as u32,
            dyn_index: Some(dyn_index as u32),
            need_lock: false,
            lock: spin::Mutex::new(()),
            offset: AtomicU32::new(0),
        });
        dynamic.bfs[dyn_index] = Some(bf.clone());
        Ok(bf)
    }

    /// Return a dedicated register to the pool. Its page stays mapped.
    pub fn release_dedicated(&self, bf: &Bf) {
        let Some(dyn_index) = bf.dyn_index else {
            return;
        };
        let mut dynamic = lock(&self.dynamic);
        if let Some(count) = dynamic.count.get_mut(dyn_index as usize) {
            *count = count.saturating_sub(1);
        }
    }

    /// Number of dynamic slots currently leased.
    pub fn dedicated_in_use(&self) -> usize {
        lock(&self.dynamic).count.iter().filter(|&&c| c > 0).count()
    }
}

/// Whether a static register is shared between QPs.
fn need_uuar_lock(uuarn: u32, tot_uuars: u32, low_lat_uuars: u32) -> bool {
    if uuarn == 0 {
        return false;
    }
    let i = uuarn / 2 + uuarn % 2;
    i < tot_uuars.saturating_sub(low_lat_uuars)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mmap::AnonMapper;

    fn layout() -> BfLayout {
        BfLayout {
            uars_per_page: 1,
            bf_reg_size: 512,
            page_size: 4096,
        }
    }

    #[test]
    fn test_static_registers() {
        let mapper = AnonMapper::new();
        let pool = BfPool::open(&mapper, layout(), 8, 2, 0, false).unwrap();
        assert_eq!(pool.num_static(), 16);
        assert_eq!(mapper.map_count(), 4);

        let bf0 = pool.static_bf(0).unwrap();
        assert_eq!(bf0.buf_size(), 0);
        assert!(!bf0.need_lock());

        let bf1 = pool.static_bf(1).unwrap();
        assert_eq!(bf1.buf_size(), 256);
        assert!(bf1.need_lock());
        let base = pool.static_bf(0).unwrap().reg().unwrap().as_ptr() as usize;
        assert_eq!(bf1.reg().unwrap().as_ptr() as usize - base, 512);

        // The trailing low-latency registers are not shared.
        assert!(!pool.static_bf(15).unwrap().need_lock());

        let single = BfPool::open(&mapper, layout(), 8, 2, 0, true).unwrap();
        assert!(!single.static_bf(1).unwrap().need_lock());
    }

    #[test]
    fn test_dedicated_capacity() {
        let mapper = AnonMapper::new();
        let pool = BfPool::open(&mapper, layout(), 2, 0, 4, false).unwrap();
        let before = mapper.map_count();

        let bfs: Vec<_> = (0..4).map(|_| pool.acquire_dedicated(&mapper).unwrap()).collect();
        assert!(matches!(pool.acquire_dedicated(&mapper), Err(Error::Exhausted)));
        assert_eq!(pool.dedicated_in_use(), 4);
        // Two slots share one page.
        assert_eq!(mapper.map_count() - before, 2);
        assert!(bfs.iter().all(|bf| !bf.need_lock()));
        assert_eq!(bfs[0].uuarn(), pool.start_dyn_index());

        let (_, off0) = layout().dyn_position(0);
        let (_, off1) = layout().dyn_position(1);
        assert_eq!(off0, BF_OFFSET);
        assert_eq!(off1, BF_OFFSET + 512);
    }

    #[test]
    fn test_release_then_reacquire_same_page() {
        let mapper = AnonMapper::new();
        let pool = BfPool::open(&mapper, layout(), 2, 0, 4, false).unwrap();
        let a = pool.acquire_dedicated(&mapper).unwrap();
        let b = pool.acquire_dedicated(&mapper).unwrap();
        let reg_a = a.reg().unwrap();
        let maps = mapper.map_count();

        pool.release_dedicated(&a);
        let again = pool.acquire_dedicated(&mapper).unwrap();
        assert_eq!(again.dyn_index(), Some(0));
        assert_eq!(again.reg().unwrap(), reg_a);
        assert_eq!(mapper.map_count(), maps);

        pool.release_dedicated(&b);
        pool.release_dedicated(&again);
        assert_eq!(pool.dedicated_in_use(), 0);
    }

    #[test]
    fn test_map_failure_releases_slot() {
        let mapper = AnonMapper::new();
        let pool = BfPool::open(&mapper, layout(), 2, 0, 2, false).unwrap();
        mapper.fail_on(MapKind::RegularDyn);
        assert!(matches!(pool.acquire_dedicated(&mapper), Err(Error::Map(_))));
        assert_eq!(pool.dedicated_in_use(), 0);
    }

    #[test]
    fn test_ring_toggles_offset() {
        let mapper = AnonMapper::new();
        let pool = BfPool::open(&mapper, layout(), 2, 0, 1, false).unwrap();
        let bf = pool.acquire_dedicated(&mapper).unwrap();
        let first = bf.ring(|p| p.as_ptr() as usize).unwrap();
        let second = bf.ring(|p| p.as_ptr() as usize).unwrap();
        assert_eq!(second - first, 256);
        let third = bf.ring(|p| p.as_ptr() as usize).unwrap();
        assert_eq!(third, first);
    }

    #[test]
    fn test_ring_locks_only_shared_registers() {
        let mapper = AnonMapper::new();
        let pool = BfPool::open(&mapper, layout(), 8, 2, 1, false).unwrap();
        let shared = pool.static_bf(1).unwrap();
        assert!(shared.need_lock());
        assert_eq!(shared.ring(|_| shared.lock.is_locked()), Some(true));
        assert!(!shared.lock.is_locked());

        let dedicated = pool.acquire_dedicated(&mapper).unwrap();
        let low_lat = pool.static_bf(15).unwrap();
        for bf in [&dedicated, &low_lat] {
            // Holding the lock elsewhere must not stall a single-owner ring.
            let _held = bf.lock.lock();
            let first = bf.ring(|p| p.as_ptr() as usize).unwrap();
            let second = bf.ring(|p| p.as_ptr() as usize).unwrap();
            assert_eq!(second - first, 256);
        }
    }

    #[test]
    fn test_shared_ring_from_many_threads() {
        let mapper = AnonMapper::new();
        let pool = BfPool::open(&mapper, layout(), 8, 2, 0, false).unwrap();
        let bf = pool.static_bf(1).unwrap();
        let base = bf.ring(|p| p.as_ptr() as usize).unwrap();
        bf.ring(|_| ()).unwrap();

        std::thread::scope(|s| {
            for _ in 0..4 {
                s.spawn(|| {
                    for _ in 0..1000 {
                        bf.ring(|_| ()).unwrap();
                    }
                });
            }
        });
        // An even number of flips lands back on the first half.
        assert_eq!(bf.ring(|p| p.as_ptr() as usize), Some(base));
    }

    #[test]
    fn test_concurrent_acquire_respects_capacity() {
        let mapper = AnonMapper::new();
        let pool = BfPool::open(&mapper, layout(), 2, 0, 4, false).unwrap();
        let before = mapper.map_count();

        let results: Vec<Result<Arc<Bf>>> = std::thread::scope(|s| {
            let handles: Vec<_> = (0..10)
                .map(|_| s.spawn(|| pool.acquire_dedicated(&mapper)))
                .collect();
            handles.into_iter().map(|h| h.join().unwrap()).collect()
        });

        let mut slots: Vec<u32> = results
            .iter()
            .filter_map(|r| r.as_ref().ok())
            .map(|bf| bf.dyn_index().unwrap())
            .collect();
        slots.sort_unstable();
        assert_eq!(slots, vec![0, 1, 2, 3]);
        let exhausted = results
            .iter()
            .filter(|r| matches!(r, Err(Error::Exhausted)))
            .count();
        assert_eq!(exhausted, 6);
        assert_eq!(pool.dedicated_in_use(), 4);
        // Each page group was mapped once despite the race.
        assert_eq!(mapper.map_count() - before, 2);
    }
}
