//! Doorbell records.
//!
//! A doorbell record is a pair of big-endian 32-bit counters the adapter
//! reads to learn a queue's producer or consumer index. Records are carved
//! out of shared pages; a page is released once its last record is freed.

use std::fmt;
use std::ptr::NonNull;
use std::sync::{Arc, Mutex};

use crate::error::{Error, Result};
use crate::mmap::MappedPage;
use crate::utils::lock;

/// Bytes reserved per record.
pub const DBREC_SIZE: usize = 64;

/// Receive counter of a QP record.
pub const RCV_DBR: usize = 0;
/// Send counter of a QP record.
pub const SND_DBR: usize = 1;
/// Consumer index of a CQ record.
pub const CQ_SET_CI: usize = 0;
/// Arm counter of a CQ record.
pub const CQ_ARM_DB: usize = 1;

#[derive(Debug)]
struct DbPage {
    mem: MappedPage,
    free: Vec<bool>,
    use_cnt: usize,
}

/// Pool of doorbell record pages.
#[derive(Debug)]
pub struct DbrecPool {
    page_size: usize,
    pages: Mutex<Vec<Option<DbPage>>>,
}

impl DbrecPool {
    pub fn new(page_size: usize) -> Arc<Self> {
        Arc::new(Self {
            page_size,
            pages: Mutex::new(Vec::new()),
        })
    }

    #[inline]
    fn per_page(&self) -> usize {
        self.page_size / DBREC_SIZE
    }

    /// Allocate a zeroed record.
    pub fn alloc(self: &Arc<Self>) -> Result<Dbrec> {
        let per_page = self.per_page();
        let mut pages = lock(&self.pages);

        let found = pages.iter().enumerate().find_map(|(i, p)| {
            let p = p.as_ref()?;
            (p.use_cnt < per_page).then_some(i)
        });
        let page_index = match found {
            Some(i) => i,
            None => {
                let mem = MappedPage::anonymous(self.page_size, false)
                    .map_err(|_| Error::OutOfMemory("doorbell record page"))?;
                let page = DbPage {
                    mem,
                    free: vec![true; per_page],
                    use_cnt: 0,
                };
                match pages.iter().position(Option::is_none) {
                    Some(i) => {
                        pages[i] = Some(page);
                        i
                    }
                    None => {
                        pages.push(Some(page));
                        pages.len() - 1
                    }
                }
            }
        };

        let page = pages[page_index]
            .as_mut()
            .ok_or(Error::OutOfMemory("doorbell record page"))?;
        let slot = page
            .free
            .iter()
            .position(|&f| f)
            .ok_or(Error::OutOfMemory("doorbell record"))?;
        page.free[slot] = false;
        page.use_cnt += 1;

        let ptr = page.mem.as_ptr().wrapping_add(slot * DBREC_SIZE).cast::<u32>();
        let ptr = NonNull::new(ptr).ok_or(Error::OutOfMemory("doorbell record"))?;
        let rec = Dbrec {
            pool: self.clone(),
            page: page_index,
            slot,
            ptr,
        };
        rec.zero();
        Ok(rec)
    }

    fn free(&self, page_index: usize, slot: usize) {
        let mut pages = lock(&self.pages);
        let Some(Some(page)) = pages.get_mut(page_index) else {
            return;
        };
        page.free[slot] = true;
        page.use_cnt -= 1;
        if page.use_cnt == 0 {
            pages[page_index] = None;
        }
    }

    /// Number of pages currently held.
    pub fn num_pages(&self) -> usize {
        lock(&self.pages).iter().filter(|p| p.is_some()).count()
    }
}

/// One doorbell record, returned to its pool on drop.
pub struct Dbrec {
    pool: Arc<DbrecPool>,
    page: usize,
    slot: usize,
    ptr: NonNull<u32>,
}

// SAFETY: the record is exclusively owned; the adapter is the only other
// party accessing it.
unsafe impl Send for Dbrec {}
unsafe impl Sync for Dbrec {}

impl fmt::Debug for Dbrec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Dbrec")
            .field("addr", &format_args!("{:#x}", self.addr()))
            .field("0", &self.get(0))
            .field("1", &self.get(1))
            .finish()
    }
}

impl Dbrec {
    /// Address of the record as passed to the kernel.
    #[inline]
    pub fn addr(&self) -> u64 {
        self.ptr.as_ptr() as u64
    }

    /// Read counter `i` (0 or 1) in host order.
    #[inline]
    pub fn get(&self, i: usize) -> u32 {
        debug_assert!(i < 2);
        // SAFETY: the record holds two aligned u32 counters.
        u32::from_be(unsafe { self.ptr.as_ptr().add(i).read_volatile() })
    }

    /// Write counter `i` (0 or 1) from host order.
    #[inline]
    pub fn set(&self, i: usize, value: u32) {
        debug_assert!(i < 2);
        // SAFETY: the record holds two aligned u32 counters.
        unsafe { self.ptr.as_ptr().add(i).write_volatile(value.to_be()) }
    }

    /// Zero both counters.
    #[inline]
    pub fn zero(&self) {
        self.set(0, 0);
        self.set(1, 0);
    }
}

impl Drop for Dbrec {
    fn drop(&mut self) {
        self.pool.free(self.page, self.slot);
    }
}
