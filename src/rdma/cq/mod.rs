//! Completion queue.

mod clean;
mod cqe;

use std::fmt;
use std::sync::Arc;

use bitflags::bitflags;

pub use self::cqe::*;
use super::buf::Buf;
use super::caps::VendorCaps;
use super::context::Context;
use super::dbrec::{Dbrec, CQ_ARM_DB, CQ_SET_CI};
use crate::abi::*;
use crate::config::{AllocPrefix, AllocType};
use crate::error::{DestroyError, Error, Result};
use crate::utils::checked_pow2_roundup;

bitflags! {
    /// Work completion fields a CQ must be able to report.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct WcFlags: u64 {
        const BYTE_LEN = 1 << 0;
        const IMM = 1 << 1;
        const QP_NUM = 1 << 2;
        const SRC_QP = 1 << 3;
        const SLID = 1 << 4;
        const SL = 1 << 5;
        const DLID_PATH_BITS = 1 << 6;
        const COMPLETION_TIMESTAMP = 1 << 7;
        const CVLAN = 1 << 8;
        const FLOW_TAG = 1 << 9;
        const TM_INFO = 1 << 10;
        const COMPLETION_TIMESTAMP_WALLCLOCK = 1 << 11;

        const STANDARD = Self::BYTE_LEN.bits() | Self::IMM.bits() | Self::QP_NUM.bits()
            | Self::SRC_QP.bits() | Self::SLID.bits() | Self::SL.bits()
            | Self::DLID_PATH_BITS.bits();
    }
}

impl Default for WcFlags {
    fn default() -> Self {
        WcFlags::STANDARD
    }
}

/// `comp_mask` bit: `flags` is valid.
pub const CQ_INIT_ATTR_MASK_FLAGS: u32 = 1 << 0;
/// Creation flag: the CQ is only used from one thread.
pub const CREATE_CQ_ATTR_SINGLE_THREADED: u32 = 1 << 0;

/// Vendor `comp_mask` bits.
pub const MLX5_CQ_INIT_ATTR_MASK_COMPRESSED_CQE: u32 = 1 << 0;
pub const MLX5_CQ_INIT_ATTR_MASK_FLAGS: u32 = 1 << 1;
/// Vendor flag: pad 64-byte completions into 128-byte entries.
pub const MLX5_CQ_INIT_ATTR_FLAGS_CQE_PAD: u32 = 1 << 0;

const SUPPORTED_WC_FLAGS: WcFlags = WcFlags::all();
const SUPPORTED_COMP_MASK: u32 = CQ_INIT_ATTR_MASK_FLAGS;
const SUPPORTED_FLAGS: u32 = CREATE_CQ_ATTR_SINGLE_THREADED;
const SUPPORTED_VENDOR_COMP_MASK: u32 =
    MLX5_CQ_INIT_ATTR_MASK_COMPRESSED_CQE | MLX5_CQ_INIT_ATTR_MASK_FLAGS;
const SUPPORTED_VENDOR_FLAGS: u32 = MLX5_CQ_INIT_ATTR_FLAGS_CQE_PAD;

/// Largest ring the adapter accepts.
const MAX_CQ_ENTRIES: u32 = 1 << 24;

/// Extended CQ creation attributes.
#[derive(Debug, Clone, Copy, Default)]
pub struct CqInitAttr {
    /// Minimum number of entries.
    pub cqe: u32,
    pub comp_vector: u32,
    pub wc_flags: WcFlags,
    pub comp_mask: u32,
    pub flags: u32,
}

/// Vendor CQ creation attributes.
#[derive(Debug, Clone, Copy, Default)]
pub struct Mlx5CqInitAttr {
    pub comp_mask: u32,
    pub cqe_comp_res_format: u8,
    pub flags: u32,
}

bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub(crate) struct CqFlags: u32 {
        /// Created through the extended path.
        const EXTENDED = 1 << 0;
        const SINGLE_THREADED = 1 << 1;
    }
}

/// Ring state, guarded by the CQ lock.
pub(crate) struct CqRing {
    buf: Option<Buf>,
    db: Option<Dbrec>,
    /// Number of entries, a power of two.
    ncqe: u32,
    cqe_size: usize,
    cons_index: u32,
}

impl fmt::Debug for CqRing {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CqRing")
            .field("ncqe", &self.ncqe)
            .field("cqe_size", &self.cqe_size)
            .field("cons_index", &self.cons_index)
            .finish()
    }
}

impl CqRing {
    /// The hardware-visible part of entry `n` (taken modulo the ring size).
    fn cqe64(&self, n: u32) -> Option<Cqe64> {
        let buf = self.buf.as_ref()?;
        let offset = (n & (self.ncqe - 1)) as usize * self.cqe_size;
        let part = if self.cqe_size == 128 { CQE64_SIZE } else { 0 };
        // SAFETY: the offset stays within the ring buffer.
        Some(unsafe { Cqe64::new(buf.at(offset + part)) })
    }

    /// Start of the full entry `n`.
    fn cqe_ptr(&self, n: u32) -> Option<*mut u8> {
        let buf = self.buf.as_ref()?;
        let offset = (n & (self.ncqe - 1)) as usize * self.cqe_size;
        // SAFETY: the offset stays within the ring buffer.
        Some(unsafe { buf.at(offset) })
    }

    /// The entry at `n`, if software owns it.
    fn sw_cqe(&self, n: u32) -> Option<Cqe64> {
        let cqe = self.cqe64(n)?;
        let sw_owner = (n & self.ncqe != 0) as u8;
        (cqe.opcode() != opcode::INVALID && cqe.owner() == sw_owner).then_some(cqe)
    }

    /// Publish the consumer index.
    fn update_cons_index(&self) {
        if let Some(db) = &self.db {
            db.set(CQ_SET_CI, self.cons_index & 0xff_ffff);
        }
    }

    #[inline]
    pub(crate) fn cons_index(&self) -> u32 {
        self.cons_index
    }

    /// Software-owned entries from the consumer index on, oldest first.
    pub(crate) fn pending(&self) -> Vec<CqeInfo> {
        let mut out = Vec::new();
        let mut n = self.cons_index;
        while let Some(cqe) = self.sw_cqe(n) {
            out.push(cqe.into());
            n = n.wrapping_add(1);
            if n.wrapping_sub(self.cons_index) >= self.ncqe {
                break;
            }
        }
        out
    }

    /// Consume up to `n` entries as a poller would.
    #[cfg(test)]
    pub(crate) fn consume(&mut self, n: usize) {
        for _ in 0..n {
            if self.sw_cqe(self.cons_index).is_none() {
                break;
            }
            self.cons_index = self.cons_index.wrapping_add(1);
        }
        self.update_cons_index();
    }
}

/// Mark every entry of a fresh ring invalid.
fn init_ring(buf: &Buf, ncqe: u32, cqe_size: usize) {
    let part = if cqe_size == 128 { CQE64_SIZE } else { 0 };
    for i in 0..ncqe as usize {
        // SAFETY: `i` indexes an entry of the ring.
        let cqe = unsafe { Cqe64::new(buf.at(i * cqe_size + part)) };
        cqe.set_op_own(opcode::INVALID << 4);
    }
}

/// Ownership holder of a completion queue.
pub(crate) struct CqInner {
    pub(crate) ctx: Context,
    handle: Handle,
    cqn: u32,
    flags: CqFlags,
    ring: spin::Mutex<CqRing>,
}

impl fmt::Debug for CqInner {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CqInner")
            .field("handle", &self.handle)
            .field("cqn", &self.cqn)
            .finish()
    }
}

impl CqInner {
    #[inline]
    pub(crate) fn handle(&self) -> Handle {
        self.handle
    }

    #[inline]
    pub(crate) fn cqn(&self) -> u32 {
        self.cqn
    }

    #[inline]
    pub(crate) fn is_extended(&self) -> bool {
        self.flags.contains(CqFlags::EXTENDED)
    }

    #[inline]
    pub(crate) fn lock(&self) -> spin::MutexGuard<'_, CqRing> {
        self.ring.lock()
    }
}

/// Completion queue.
pub struct Cq {
    inner: Arc<CqInner>,
    live: bool,
}

impl fmt::Debug for Cq {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Cq")
            .field("cqn", &self.inner.cqn)
            .field("capacity", &self.capacity())
            .finish()
    }
}

impl Cq {
    /// The default CQ depth.
    pub const DEFAULT_CQ_DEPTH: u32 = 128;

    /// Create a completion queue with at least `cqe` entries.
    pub fn new(ctx: &Context, cqe: u32) -> Result<Cq> {
        if cqe == 0 {
            return Err(Error::InvalidArgument("CQ needs at least one entry"));
        }
        let attr = CqInitAttr {
            cqe,
            ..Default::default()
        };
        Self::create(ctx, &attr, CqFlags::empty(), None)
    }

    /// Create a completion queue through the extended path.
    pub fn new_ex(ctx: &Context, attr: &CqInitAttr, mlx5_attr: Option<&Mlx5CqInitAttr>) -> Result<Cq> {
        Self::create(ctx, attr, CqFlags::EXTENDED, mlx5_attr)
    }

    fn create(
        ctx: &Context,
        attr: &CqInitAttr,
        mut flags: CqFlags,
        mlx5_attr: Option<&Mlx5CqInitAttr>,
    ) -> Result<Cq> {
        if attr.cqe == 0 {
            log::debug!("rmlx5: CQE invalid");
            return Err(Error::InvalidArgument("CQ needs at least one entry"));
        }
        if attr.comp_mask & !SUPPORTED_COMP_MASK != 0 {
            log::debug!("rmlx5: unsupported comp_mask {:#x} for create_cq", attr.comp_mask);
            return Err(Error::InvalidArgument("unsupported CQ comp_mask"));
        }
        if attr.comp_mask & CQ_INIT_ATTR_MASK_FLAGS != 0 && attr.flags & !SUPPORTED_FLAGS != 0 {
            log::debug!("rmlx5: unsupported creation flags {:#x} for create_cq", attr.flags);
            return Err(Error::InvalidArgument("unsupported CQ creation flags"));
        }
        if attr.wc_flags.bits() & !SUPPORTED_WC_FLAGS.bits() != 0 {
            log::debug!("rmlx5: unsupported wc_flags {:#x}", attr.wc_flags.bits());
            return Err(Error::NotSupported("work completion fields"));
        }

        let caps = ctx.caps();
        let ncqe = match attr.cqe.checked_add(1).and_then(checked_pow2_roundup) {
            Some(ncqe) if ncqe <= MAX_CQ_ENTRIES => ncqe,
            _ => {
                log::debug!("rmlx5: CQE {} too large", attr.cqe);
                return Err(Error::InvalidArgument("CQ too deep"));
            }
        };
        if ncqe - 1 > caps.max_cqe {
            return Err(Error::CapabilityNotEnough("max_cqe", caps.max_cqe, ncqe - 1));
        }

        let mut drv = Mlx5CreateCq {
            cqe_size: ctx.config().cqe_size.bytes() as u32,
            ..Default::default()
        };
        if let Some(m) = mlx5_attr {
            if m.comp_mask & !SUPPORTED_VENDOR_COMP_MASK != 0 {
                log::debug!("rmlx5: unsupported vendor comp_mask for create_cq");
                return Err(Error::InvalidArgument("unsupported vendor CQ comp_mask"));
            }
            if m.comp_mask & MLX5_CQ_INIT_ATTR_MASK_COMPRESSED_CQE != 0 {
                let comp = caps.cqe_comp_caps;
                if comp.max_num == 0 || m.cqe_comp_res_format as u32 & comp.supported_format == 0 {
                    log::debug!("rmlx5: CQE compression is not supported");
                    return Err(Error::InvalidArgument("CQE compression not supported"));
                }
                drv.cqe_comp_en = 1;
                drv.cqe_comp_res_format = m.cqe_comp_res_format;
            }
            if m.comp_mask & MLX5_CQ_INIT_ATTR_MASK_FLAGS != 0 {
                if m.flags & !SUPPORTED_VENDOR_FLAGS != 0 {
                    log::debug!("rmlx5: unsupported vendor flags for create_cq");
                    return Err(Error::InvalidArgument("unsupported vendor CQ flags"));
                }
                if m.flags & MLX5_CQ_INIT_ATTR_FLAGS_CQE_PAD != 0 {
                    if !caps.vendor_caps.contains(VendorCaps::CQE_128B_PAD) || drv.cqe_size != 128 {
                        log::debug!("rmlx5: {}B CQE padding is not supported", drv.cqe_size);
                        return Err(Error::InvalidArgument("CQE padding not supported"));
                    }
                    drv.flags |= MLX5_CREATE_CQ_FLAGS_CQE_128B_PAD;
                }
            }
        }

        if attr.comp_mask & CQ_INIT_ATTR_MASK_FLAGS != 0
            && attr.flags & CREATE_CQ_ATTR_SINGLE_THREADED != 0
        {
            flags |= CqFlags::SINGLE_THREADED;
        }

        let cqe_size = drv.cqe_size as usize;
        let buf = alloc_cq_buf(ctx, ncqe, cqe_size)?;
        let db = ctx.alloc_dbrec()?;
        db.set(CQ_SET_CI, 0);
        db.set(CQ_ARM_DB, 0);

        drv.buf_addr = buf.addr();
        drv.db_addr = db.addr();
        let cmd = CreateCq {
            cqe: ncqe - 1,
            comp_vector: attr.comp_vector,
            flags: attr.flags,
            reserved: 0,
            drv,
        };
        let resp = ctx.kernel().create_cq(&cmd).map_err(|e| {
            log::debug!("rmlx5: create_cq failed: {}", e);
            e
        })?;

        let inner = CqInner {
            ctx: ctx.clone(),
            handle: resp.handle,
            cqn: resp.cqn,
            flags,
            ring: spin::Mutex::new(CqRing {
                buf: Some(buf),
                db: Some(db),
                ncqe,
                cqe_size,
                cons_index: 0,
            }),
        };
        Ok(Cq {
            inner: Arc::new(inner),
            live: true,
        })
    }

    /// Get the underlying [`Context`].
    pub fn context(&self) -> &Context {
        &self.inner.ctx
    }

    pub(crate) fn inner(&self) -> &Arc<CqInner> {
        &self.inner
    }

    /// The CQ number.
    #[inline]
    pub fn cqn(&self) -> u32 {
        self.inner.cqn
    }

    /// Kernel handle.
    #[inline]
    pub fn handle(&self) -> Handle {
        self.inner.handle
    }

    /// Get the capacity of the completion queue.
    #[inline]
    pub fn capacity(&self) -> u32 {
        self.inner.lock().ncqe - 1
    }

    /// Entry size in bytes.
    #[inline]
    pub fn cqe_size(&self) -> usize {
        self.inner.lock().cqe_size
    }

    /// Whether the CQ was created through the extended path.
    #[inline]
    pub fn is_extended(&self) -> bool {
        self.inner.is_extended()
    }

    /// Whether the CQ is only used from one thread.
    #[inline]
    pub fn is_single_threaded(&self) -> bool {
        self.inner.flags.contains(CqFlags::SINGLE_THREADED)
    }

    /// Address of the ring buffer.
    pub fn buf_addr(&self) -> u64 {
        self.inner.lock().buf.as_ref().map_or(0, Buf::addr)
    }

    /// Current consumer index.
    pub fn cons_index(&self) -> u32 {
        self.inner.lock().cons_index
    }

    /// Consumer index as published in the doorbell record.
    pub fn published_cons_index(&self) -> u32 {
        self.inner.lock().db.as_ref().map_or(0, |db| db.get(CQ_SET_CI))
    }

    /// Completions currently awaiting a poller, oldest first.
    pub fn pending(&self) -> Vec<CqeInfo> {
        self.inner.lock().pending()
    }

    /// Resize the ring to hold at least `cqe` entries.
    ///
    /// Pending completions are carried over to the new ring in order.
    /// Requesting the current size is a no-op.
    pub fn resize(&self, cqe: u32) -> Result<()> {
        if cqe == 0 {
            return Err(Error::InvalidArgument("CQ needs at least one entry"));
        }
        if cqe as u64 * 64 > i32::MAX as u64 {
            return Err(Error::InvalidArgument("CQ too deep"));
        }
        let ctx = &self.inner.ctx;
        let ncqe = match cqe.checked_add(1).and_then(checked_pow2_roundup) {
            Some(ncqe) if ncqe <= MAX_CQ_ENTRIES && ncqe - 1 <= ctx.caps().max_cqe => ncqe,
            _ => return Err(Error::InvalidArgument("CQ too deep")),
        };

        let mut ring = self.inner.lock();
        if ncqe == ring.ncqe {
            return Ok(());
        }

        let cqe_size = ring.cqe_size;
        let new_buf = alloc_cq_buf(ctx, ncqe, cqe_size).map_err(|e| {
            log::debug!("rmlx5: cannot allocate resize buffer: {}", e);
            Error::OutOfMemory("CQ resize buffer")
        })?;
        let cmd = ResizeCq {
            cqe: ncqe - 1,
            reserved: 0,
            drv: Mlx5ResizeCq {
                buf_addr: new_buf.addr(),
                cqe_size: cqe_size as u16,
                ..Default::default()
            },
        };
        ctx.kernel().resize_cq(self.inner.handle, &cmd)?;

        ring.copy_to_resized(&new_buf, ncqe);
        ring.buf = Some(new_buf);
        ring.ncqe = ncqe;
        ring.update_cons_index();
        Ok(())
    }

    /// Set completion moderation.
    pub fn modify(&self, cq_count: u16, cq_period: u16) -> Result<()> {
        let cmd = ModifyCq {
            attr_mask: CQ_ATTR_MODERATE,
            cq_count,
            cq_period,
        };
        Ok(self.inner.ctx.kernel().modify_cq(self.inner.handle, &cmd)?)
    }

    fn destroy_impl(&mut self) -> Result<()> {
        self.inner.ctx.kernel().destroy_cq(self.inner.handle).map_err(|e| {
            log::debug!("rmlx5: destroy_cq failed: {}", e);
            e
        })?;
        self.live = false;
        let mut ring = self.inner.lock();
        drop(ring.db.take());
        drop(ring.buf.take());
        Ok(())
    }

    /// Destroy the CQ. Fails while QPs, SRQs or work queues still use it.
    pub fn destroy(mut self) -> Result<(), DestroyError<Cq>> {
        match self.destroy_impl() {
            Ok(()) => Ok(()),
            Err(e) => Err(DestroyError::new(self, e)),
        }
    }
}

impl Drop for Cq {
    fn drop(&mut self) {
        if self.live {
            if let Err(e) = self.destroy_impl() {
                log::error!("rmlx5: cannot destroy CQ {} on drop: {}", self.inner.cqn, e);
            }
        }
    }
}

/// Moderation modify mask bit.
pub const CQ_ATTR_MODERATE: u32 = 1 << 0;

fn alloc_cq_buf(ctx: &Context, ncqe: u32, cqe_size: usize) -> Result<Buf> {
    let ty = ctx.config().alloc_type(AllocPrefix::Cq, AllocType::Anon);
    let buf = Buf::alloc(
        ctx.mapper(),
        ncqe as usize * cqe_size,
        ctx.caps().page_size,
        ty,
    )?;
    init_ring(&buf, ncqe, cqe_size);
    Ok(buf)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{Config, CqeSize};
    use crate::kernel::Op;
    use crate::rdma::caps::DeviceCaps;
    use crate::rdma::context::tests::{test_context, test_context_with};

    fn cqe(qpn: u32) -> CqeInfo {
        CqeInfo {
            opcode: opcode::REQ,
            qpn,
            srqn_uidx: 0,
            wqe_counter: qpn as u16,
        }
    }

    fn qpns(cq: &Cq) -> Vec<u32> {
        cq.pending().iter().map(|c| c.qpn).collect()
    }

    #[test]
    fn test_create_rounds_and_validates() {
        let (ctx, _kernel) = test_context();
        let cq = Cq::new(&ctx, 100).unwrap();
        assert_eq!(cq.capacity(), 127);
        assert_eq!(cq.cqe_size(), 64);
        assert!(!cq.is_extended());
        assert!(cq.pending().is_empty());

        assert!(matches!(Cq::new(&ctx, 0), Err(Error::InvalidArgument(_))));
        for cqe in [0x8000_0000, u32::MAX, MAX_CQ_ENTRIES] {
            assert!(matches!(Cq::new(&ctx, cqe), Err(Error::InvalidArgument(_))));
        }
        assert!(matches!(cq.resize(u32::MAX), Err(Error::InvalidArgument(_))));
        assert!(matches!(cq.resize(0x7fff_ffff), Err(Error::InvalidArgument(_))));
        assert_eq!(cq.capacity(), 127);
        let caps = DeviceCaps {
            max_cqe: 255,
            ..Default::default()
        };
        let (small, _kernel) = test_context_with(caps, Config::default());
        assert!(Cq::new(&small, 255).is_ok());
        assert!(matches!(
            Cq::new(&small, 256),
            Err(Error::CapabilityNotEnough("max_cqe", 255, 511))
        ));
    }

    #[test]
    fn test_cqe_padding_needs_128b_entries() {
        let pad = Mlx5CqInitAttr {
            comp_mask: MLX5_CQ_INIT_ATTR_MASK_FLAGS,
            flags: MLX5_CQ_INIT_ATTR_FLAGS_CQE_PAD,
            ..Default::default()
        };
        let attr = CqInitAttr {
            cqe: 16,
            ..Default::default()
        };

        let (ctx, _kernel) = test_context();
        assert!(matches!(
            Cq::new_ex(&ctx, &attr, Some(&pad)),
            Err(Error::InvalidArgument(_))
        ));

        let caps = DeviceCaps {
            vendor_caps: VendorCaps::CQE_128B_PAD,
            ..Default::default()
        };
        let config = Config {
            cqe_size: CqeSize::B128,
            ..Default::default()
        };
        let (ctx, kernel) = test_context_with(caps, config);
        let cq = Cq::new_ex(&ctx, &attr, Some(&pad)).unwrap();
        assert!(cq.is_extended());
        assert_eq!(cq.cqe_size(), 128);
        kernel.post_cqe(cq.handle(), cqe(4)).unwrap();
        assert_eq!(qpns(&cq), vec![4]);
    }

    #[test]
    fn test_resize_carries_pending_completions() {
        let (ctx, kernel) = test_context();
        let cq = Cq::new(&ctx, 7).unwrap();
        for qpn in 1..=3 {
            kernel.post_cqe(cq.handle(), cqe(qpn)).unwrap();
        }

        cq.resize(7).unwrap();
        assert_eq!(cq.capacity(), 7);
        assert_eq!(cq.cons_index(), 0);

        cq.resize(60).unwrap();
        assert_eq!(cq.capacity(), 63);
        assert_eq!(qpns(&cq), vec![1, 2, 3]);
        assert_eq!(cq.cons_index(), 1);
        assert_eq!(cq.published_cons_index(), 1);

        kernel.post_cqe(cq.handle(), cqe(9)).unwrap();
        assert_eq!(qpns(&cq), vec![1, 2, 3, 9]);
    }

    #[test]
    fn test_failed_resize_keeps_ring() {
        let (ctx, kernel) = test_context();
        let cq = Cq::new(&ctx, 7).unwrap();
        kernel.post_cqe(cq.handle(), cqe(5)).unwrap();
        let addr = cq.buf_addr();

        kernel.fail_next(Op::ResizeCq, libc::ENOMEM);
        assert!(cq.resize(30).is_err());
        assert_eq!(cq.capacity(), 7);
        assert_eq!(cq.buf_addr(), addr);
        assert_eq!(qpns(&cq), vec![5]);
    }

    #[test]
    fn test_clean_compacts_across_wraparound() {
        let (ctx, kernel) = test_context();
        let cq = Cq::new(&ctx, 3).unwrap();
        assert_eq!(cq.capacity(), 3);

        kernel.post_cqe(cq.handle(), cqe(7)).unwrap();
        kernel.post_cqe(cq.handle(), cqe(7)).unwrap();
        cq.inner().lock().consume(2);
        assert_eq!(cq.cons_index(), 2);

        // The third entry lands in slot 0 with the next pass's owner bit.
        for qpn in [1, 2, 3] {
            kernel.post_cqe(cq.handle(), cqe(qpn)).unwrap();
        }
        assert_eq!(qpns(&cq), vec![1, 2, 3]);

        let freed = cq.inner().lock().clean(2, None, false);
        assert_eq!(freed, 1);
        assert_eq!(qpns(&cq), vec![1, 3]);
        assert_eq!(cq.cons_index(), 3);
        assert_eq!(cq.published_cons_index(), 3);

        assert_eq!(cq.inner().lock().clean(8, None, false), 0);
        assert_eq!(qpns(&cq), vec![1, 3]);
    }

    #[test]
    fn test_modify_and_destroy() {
        let (ctx, kernel) = test_context();
        let cq = Cq::new(&ctx, 16).unwrap();
        cq.modify(8, 16).unwrap();

        kernel.fail_next(Op::DestroyCq, libc::EIO);
        let cq = cq.destroy().unwrap_err().into_inner();
        cq.destroy().unwrap();
        assert_eq!(kernel.live_objects(), 0);
    }
}
