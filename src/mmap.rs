//! Device register and buffer mappings.
//!
//! The device exposes UAR pages, the core clock page and physically
//! contiguous buffers through `mmap` on its command fd. The page to map is
//! selected by encoding a command and an index into the file offset.

use std::io;
use std::os::unix::io::RawFd;
use std::ptr::{self, NonNull};
use std::sync::atomic::{AtomicUsize, Ordering};

/// What to map.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MapKind {
    /// A statically assigned UAR page.
    Regular,
    /// A dynamically allocated write-combined UAR page.
    RegularDyn,
    /// A non-cached UAR page.
    NonCached,
    /// The free-running core clock page.
    CoreClock,
    /// Physically contiguous pages; the index is the log2 of the page count.
    Contig,
}

impl MapKind {
    /// The mmap command code of this mapping.
    pub const fn command(self) -> u64 {
        match self {
            MapKind::Regular => 0,
            MapKind::Contig => 1,
            MapKind::NonCached => 3,
            MapKind::CoreClock => 5,
            MapKind::RegularDyn => 6,
        }
    }
}

/// Command shift within the page offset.
const MMAP_CMD_SHIFT: u64 = 8;
/// Low index byte mask.
const MMAP_INDEX_MASK: u64 = (1 << MMAP_CMD_SHIFT) - 1;
/// Bits above the low index byte land here.
const MMAP_EXT_INDEX_SHIFT: u64 = 16;

/// Encode a mapping request into the page number passed as the mmap offset.
pub const fn encode_offset(kind: MapKind, index: u32) -> u64 {
    let index = index as u64;
    (kind.command() << MMAP_CMD_SHIFT)
        | (index & MMAP_INDEX_MASK)
        | ((index >> MMAP_CMD_SHIFT) << MMAP_EXT_INDEX_SHIFT)
}

/// A mapped region, unmapped on drop.
#[derive(Debug)]
pub struct MappedPage {
    addr: NonNull<u8>,
    len: usize,
}

// SAFETY: the mapping is plain device or anonymous memory owned by this value.
unsafe impl Send for MappedPage {}
unsafe impl Sync for MappedPage {}

impl MappedPage {
    fn map(fd: RawFd, len: usize, flags: libc::c_int, offset: libc::off_t) -> io::Result<Self> {
        if len == 0 {
            return Err(io::Error::from_raw_os_error(libc::EINVAL));
        }

        // SAFETY: FFI, no existing mapping is touched since the address is null.
        let addr = unsafe {
            libc::mmap(
                ptr::null_mut(),
                len,
                libc::PROT_READ | libc::PROT_WRITE,
                flags,
                fd,
                offset,
            )
        };
        if addr == libc::MAP_FAILED {
            return Err(io::Error::last_os_error());
        }
        let addr = NonNull::new(addr.cast()).ok_or_else(io::Error::last_os_error)?;
        Ok(Self { addr, len })
    }

    /// Map private anonymous memory, optionally backed by huge pages.
    pub fn anonymous(len: usize, huge: bool) -> io::Result<Self> {
        let mut flags = libc::MAP_PRIVATE | libc::MAP_ANONYMOUS;
        if huge {
            flags |= libc::MAP_HUGETLB;
        }
        Self::map(-1, len, flags, 0)
    }

    /// Start address.
    #[inline]
    pub fn as_ptr(&self) -> *mut u8 {
        self.addr.as_ptr()
    }

    /// Mapped length in bytes.
    #[inline]
    pub fn len(&self) -> usize {
        self.len
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }
}

impl Drop for MappedPage {
    fn drop(&mut self) {
        // SAFETY: the region was mapped by `MappedPage::map` with this length.
        let ret = unsafe { libc::munmap(self.addr.as_ptr().cast(), self.len) };
        if ret != 0 {
            log::error!("rmlx5: failed to munmap: {}", io::Error::last_os_error());
        }
    }
}

/// Maps device pages into the process.
pub trait Mapper: Send + Sync {
    /// Map `len` bytes of the page selected by `kind` and `index`.
    fn map(&self, kind: MapKind, index: u32, len: usize) -> io::Result<MappedPage>;
}

/// Maps pages from the device command fd.
#[derive(Debug)]
pub struct FdMapper {
    fd: RawFd,
    page_size: usize,
}

impl FdMapper {
    /// The fd must stay open for as long as any mapping is alive.
    pub fn new(fd: RawFd, page_size: usize) -> Self {
        Self { fd, page_size }
    }
}

impl Mapper for FdMapper {
    fn map(&self, kind: MapKind, index: u32, len: usize) -> io::Result<MappedPage> {
        let offset = encode_offset(kind, index)
            .checked_mul(self.page_size as u64)
            .and_then(|o| libc::off_t::try_from(o).ok())
            .ok_or_else(|| io::Error::from_raw_os_error(libc::EINVAL))?;
        MappedPage::map(self.fd, len, libc::MAP_SHARED, offset)
    }
}

/// Backs every request with fresh anonymous memory.
///
/// Used where no device is present; counts map calls.
#[derive(Debug, Default)]
pub struct AnonMapper {
    calls: AtomicUsize,
    fail_kinds: spin::Mutex<Vec<MapKind>>,
}

impl AnonMapper {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of successful mappings made so far.
    pub fn map_count(&self) -> usize {
        self.calls.load(Ordering::Relaxed)
    }

    /// Make every later request of `kind` fail with `ENOMEM`.
    pub fn fail_on(&self, kind: MapKind) {
        self.fail_kinds.lock().push(kind);
    }
}

impl Mapper for AnonMapper {
    fn map(&self, kind: MapKind, _index: u32, len: usize) -> io::Result<MappedPage> {
        if self.fail_kinds.lock().contains(&kind) {
            return Err(io::Error::from_raw_os_error(libc::ENOMEM));
        }
        let page = MappedPage::anonymous(len, false)?;
        self.calls.fetch_add(1, Ordering::Relaxed);
        Ok(page)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_offset_encoding() {
        assert_eq!(encode_offset(MapKind::Regular, 3), 3);
        assert_eq!(encode_offset(MapKind::RegularDyn, 1), (6 << 8) | 1);
        assert_eq!(encode_offset(MapKind::RegularDyn, 0x1_02), (6 << 8) | 0x02 | (1 << 16));
        assert_eq!(encode_offset(MapKind::CoreClock, 0), 5 << 8);
    }

    #[test]
    fn test_anon_mapper() {
        let mapper = AnonMapper::new();
        let page = mapper.map(MapKind::RegularDyn, 0, 4096).unwrap();
        // SAFETY: freshly mapped, writable, 4096 bytes long.
        unsafe { page.as_ptr().write_volatile(0xab) };
        assert_eq!(page.len(), 4096);
        assert_eq!(mapper.map_count(), 1);

        mapper.fail_on(MapKind::RegularDyn);
        assert!(mapper.map(MapKind::RegularDyn, 1, 4096).is_err());
        assert_eq!(mapper.map_count(), 1);
    }
}
