//! Queue buffers.
//!
//! Work queue and completion queue memory is page aligned and zeroed. It is
//! backed by anonymous pages, huge pages, device-contiguous pages or an
//! allocator supplied through a parent domain.

use std::fmt;
use std::ptr::NonNull;
use std::sync::Arc;

use crate::config::AllocType;
use crate::error::{Error, Result};
use crate::mmap::{MapKind, MappedPage, Mapper};
use crate::utils::ilog2;

/// Huge page granularity.
pub const HUGE_PAGE_SIZE: usize = 2 << 20;

/// What an external allocation is for.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BufResource {
    Qp,
    Srq,
    Rwq,
}

/// Result of an external allocation request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExternalAlloc {
    /// The allocator provided zero-initialised memory at this address.
    Allocated(NonNull<u8>),
    /// The allocator declines; use the built-in allocation path.
    UseDefault,
    /// The allocator failed.
    Failed,
}

/// Application-supplied buffer allocator, attached to a parent domain.
pub trait BufAllocator: Send + Sync + fmt::Debug {
    fn alloc(&self, size: usize, alignment: usize, resource: BufResource) -> ExternalAlloc;

    /// Release memory obtained from [`BufAllocator::alloc`].
    fn free(&self, ptr: NonNull<u8>, resource: BufResource);
}

enum Backing {
    Mapped(MappedPage),
    External(Arc<dyn BufAllocator>, BufResource),
}

impl fmt::Debug for Backing {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Backing::Mapped(p) => f.debug_tuple("Mapped").field(&p.len()).finish(),
            Backing::External(_, r) => f.debug_tuple("External").field(r).finish(),
        }
    }
}

/// A zeroed, page-aligned queue buffer.
#[derive(Debug)]
pub struct Buf {
    ptr: NonNull<u8>,
    len: usize,
    huge: bool,
    backing: Backing,
}

// SAFETY: the buffer is exclusively owned, access is synchronized by the
// owning queue.
unsafe impl Send for Buf {}
unsafe impl Sync for Buf {}

#[inline]
fn round_to(n: usize, align: usize) -> usize {
    n.div_ceil(align) * align
}

impl Buf {
    /// Allocate `size` bytes, rounded up to whole pages.
    pub fn alloc(mapper: &dyn Mapper, size: usize, page_size: usize, ty: AllocType) -> Result<Self> {
        if size == 0 {
            return Err(Error::InvalidArgument("empty buffer"));
        }

        let try_huge = || MappedPage::anonymous(round_to(size, HUGE_PAGE_SIZE), true);
        let try_contig = || {
            let pages = size.div_ceil(page_size).next_power_of_two();
            mapper.map(MapKind::Contig, ilog2(pages as u32), pages * page_size)
        };
        let anon = || MappedPage::anonymous(round_to(size, page_size), false);

        let (page, huge) = match ty {
            AllocType::Anon => (anon()?, false),
            AllocType::Huge => (try_huge()?, true),
            AllocType::Contig => (try_contig()?, false),
            AllocType::PreferHuge => match try_huge() {
                Ok(p) => (p, true),
                Err(e) => {
                    log::warn!("rmlx5: huge page allocation failed ({}), using regular pages", e);
                    (anon()?, false)
                }
            },
            AllocType::PreferContig => match try_contig() {
                Ok(p) => (p, false),
                Err(e) => {
                    log::warn!("rmlx5: contiguous allocation failed ({}), using regular pages", e);
                    (anon()?, false)
                }
            },
            AllocType::All => match try_huge() {
                Ok(p) => (p, true),
                Err(_) => match try_contig() {
                    Ok(p) => (p, false),
                    Err(e) => {
                        log::warn!("rmlx5: falling back to regular pages ({})", e);
                        (anon()?, false)
                    }
                },
            },
        };

        let ptr = NonNull::new(page.as_ptr()).ok_or(Error::OutOfMemory("queue buffer"))?;
        let buf = Self {
            ptr,
            len: size,
            huge,
            backing: Backing::Mapped(page),
        };
        buf.zero();
        Ok(buf)
    }

    /// Allocate through an external allocator, falling back to `alloc` with
    /// `ty` when the allocator declines.
    pub fn alloc_external(
        allocator: &Arc<dyn BufAllocator>,
        resource: BufResource,
        mapper: &dyn Mapper,
        size: usize,
        page_size: usize,
        ty: AllocType,
    ) -> Result<Self> {
        let alloc_size = round_to(size, page_size);
        match allocator.alloc(alloc_size, page_size, resource) {
            ExternalAlloc::Allocated(ptr) => {
                let buf = Self {
                    ptr,
                    len: size,
                    huge: false,
                    backing: Backing::External(allocator.clone(), resource),
                };
                buf.zero();
                Ok(buf)
            }
            ExternalAlloc::UseDefault => Self::alloc(mapper, size, page_size, ty),
            ExternalAlloc::Failed => Err(Error::OutOfMemory("external buffer allocator")),
        }
    }

    /// Start address.
    #[inline]
    pub fn as_ptr(&self) -> *mut u8 {
        self.ptr.as_ptr()
    }

    /// Start address as passed to the kernel.
    #[inline]
    pub fn addr(&self) -> u64 {
        self.ptr.as_ptr() as u64
    }

    /// Requested length in bytes.
    #[inline]
    pub fn len(&self) -> usize {
        self.len
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Whether huge pages back this buffer.
    #[inline]
    pub fn is_huge(&self) -> bool {
        self.huge
    }

    /// Whether an external allocator provided this buffer.
    #[inline]
    pub fn is_external(&self) -> bool {
        matches!(self.backing, Backing::External(..))
    }

    /// Zero the whole buffer.
    pub fn zero(&self) {
        // SAFETY: the buffer spans at least `len` writable bytes.
        unsafe { self.ptr.as_ptr().write_bytes(0, self.len) };
    }

    /// Pointer to byte `offset`.
    ///
    /// # Safety
    ///
    /// `offset` must be within the buffer.
    #[inline]
    pub(crate) unsafe fn at(&self, offset: usize) -> *mut u8 {
        debug_assert!(offset < self.len);
        self.ptr.as_ptr().add(offset)
    }
}

impl Drop for Buf {
    fn drop(&mut self) {
        if let Backing::External(allocator, resource) = &self.backing {
            allocator.free(self.ptr, *resource);
        }
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use std::alloc::{self, Layout};
    use std::sync::Mutex;

    use super::*;
    use crate::mmap::AnonMapper;

    /// Heap-backed allocator recording every call.
    #[derive(Debug, Default)]
    pub(crate) struct HeapAllocator {
        pub decline: bool,
        pub live: Mutex<Vec<(usize, usize)>>,
        pub frees: Mutex<Vec<BufResource>>,
    }

    impl BufAllocator for HeapAllocator {
        fn alloc(&self, size: usize, alignment: usize, _resource: BufResource) -> ExternalAlloc {
            if self.decline {
                return ExternalAlloc::UseDefault;
            }
            let Ok(layout) = Layout::from_size_align(size, alignment) else {
                return ExternalAlloc::Failed;
            };
            // SAFETY: non-zero size.
            let ptr = unsafe { alloc::alloc_zeroed(layout) };
            match NonNull::new(ptr) {
                Some(p) => {
                    self.live.lock().unwrap().push((ptr as usize, size));
                    ExternalAlloc::Allocated(p)
                }
                None => ExternalAlloc::Failed,
            }
        }

        fn free(&self, ptr: NonNull<u8>, resource: BufResource) {
            let mut live = self.live.lock().unwrap();
            let pos = live.iter().position(|(p, _)| *p == ptr.as_ptr() as usize).unwrap();
            let (_, size) = live.remove(pos);
            let layout = Layout::from_size_align(size, 4096).unwrap();
            // SAFETY: allocated above with the same layout.
            unsafe { alloc::dealloc(ptr.as_ptr(), layout) };
            self.frees.lock().unwrap().push(resource);
        }
    }

    #[test]
    fn test_anon_is_zeroed() {
        let mapper = AnonMapper::new();
        let buf = Buf::alloc(&mapper, 5000, 4096, AllocType::Anon).unwrap();
        assert_eq!(buf.len(), 5000);
        assert_eq!(buf.addr() % 4096, 0);
        // SAFETY: in bounds.
        unsafe { *buf.at(4999) = 7 };
        buf.zero();
        assert_eq!(unsafe { *buf.at(4999) }, 0);
        assert!(Buf::alloc(&mapper, 0, 4096, AllocType::Anon).is_err());
    }

    #[test]
    fn test_contig_fallback() {
        let mapper = AnonMapper::new();
        mapper.fail_on(MapKind::Contig);
        assert!(Buf::alloc(&mapper, 4096, 4096, AllocType::Contig).is_err());
        let buf = Buf::alloc(&mapper, 4096, 4096, AllocType::PreferContig).unwrap();
        assert!(!buf.is_huge());
    }

    #[test]
    fn test_external_allocator() {
        let mapper = AnonMapper::new();
        let heap = Arc::new(HeapAllocator::default());
        let allocator: Arc<dyn BufAllocator> = heap.clone();
        let buf = Buf::alloc_external(&allocator, BufResource::Qp, &mapper, 100, 4096, AllocType::Anon)
            .unwrap();
        assert!(buf.is_external());
        assert_eq!(heap.live.lock().unwrap().len(), 1);
        drop(buf);
        assert!(heap.live.lock().unwrap().is_empty());
        assert_eq!(*heap.frees.lock().unwrap(), vec![BufResource::Qp]);

        let declining: Arc<dyn BufAllocator> = Arc::new(HeapAllocator {
            decline: true,
            ..Default::default()
        });
        let buf = Buf::alloc_external(&declining, BufResource::Srq, &mapper, 100, 4096, AllocType::Anon)
            .unwrap();
        assert!(!buf.is_external());
    }
}
