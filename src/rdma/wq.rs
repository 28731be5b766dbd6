//! Receive work queues and their indirection tables.
//!
//! A work queue is a receive queue without a send side, user-indexed on
//! every context. RSS QPs spread incoming packets over the work queues of
//! an indirection table.

use std::fmt;
use std::sync::Arc;

use bitflags::bitflags;

use super::buf::{Buf, BufResource};
use super::context::Context;
use super::cq::{Cq, CqInner};
use super::dbrec::{Dbrec, RCV_DBR, SND_DBR};
use super::pd::{Pd, PdInner};
use super::qp::QpType;
use super::sizing::{calc_rwq_size, WqGeometry};
use super::table::Resource;
use crate::abi::*;
use crate::config::{AllocPrefix, AllocType};
use crate::error::{DestroyError, Error, Result};
use crate::utils::UserRef;

/// Kernel work queue type code of receive queues, the only kind there is.
const WQT_RQ: u32 = 0;

/// Work queue state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
#[repr(u32)]
pub enum WqState {
    #[default]
    Reset = 0,
    Rdy = 1,
    Err = 2,
}

impl TryFrom<u32> for WqState {
    type Error = u32;

    fn try_from(state: u32) -> Result<Self, u32> {
        match state {
            0 => Ok(WqState::Reset),
            1 => Ok(WqState::Rdy),
            2 => Ok(WqState::Err),
            other => Err(other),
        }
    }
}

bitflags! {
    /// Attributes a work queue modify applies to.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
    pub struct WqAttrMask: u32 {
        const STATE = 1 << 0;
        const CURR_STATE = 1 << 1;
        const FLAGS = 1 << 2;
    }
}

/// Striding receive queue layout, in log2 units.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct StridingRqAttr {
    pub single_stride_log_num_of_bytes: u32,
    pub single_wqe_log_num_of_strides: u32,
    pub two_byte_shift_en: bool,
}

/// Work queue creation attributes.
#[derive(Debug, Clone, Copy)]
pub struct WqInitAttr<'a> {
    pub pd: &'a Pd,
    pub cq: &'a Cq,
    pub max_wr: u32,
    pub max_sge: u32,
    pub create_flags: u32,
    pub striding: Option<StridingRqAttr>,
}

/// Work queue modify attributes.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct WqAttr {
    pub mask: WqAttrMask,
    pub wq_state: WqState,
    pub curr_wq_state: WqState,
    pub flags: u32,
    pub flags_mask: u32,
}

#[derive(Debug, Default)]
struct RwqCursors {
    head: u32,
    tail: u32,
}

pub(crate) struct WqInner {
    ctx: Context,
    pd: UserRef<PdInner>,
    handle: Handle,
    wqn: u32,
    uidx: u32,
    cq: Arc<CqInner>,
    geometry: WqGeometry,
    wq_sig: bool,
    striding: bool,
    state: spin::Mutex<WqState>,
    cursors: spin::Mutex<RwqCursors>,
    buf: Buf,
    db: Dbrec,
}

impl fmt::Debug for WqInner {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WqInner")
            .field("wqn", &self.wqn)
            .field("uidx", &self.uidx)
            .field("pd", &self.pd.handle())
            .finish()
    }
}

impl WqInner {
    /// Work queues always report completions by user index.
    #[inline]
    pub(crate) fn rsn(&self) -> u32 {
        self.uidx
    }
}

/// Receive work queue.
pub struct Wq {
    inner: Arc<WqInner>,
    live: bool,
}

impl fmt::Debug for Wq {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_fmt(format_args!("Wq<{}>", self.inner.wqn))
    }
}

fn check_striding(ctx: &Context, attr: &StridingRqAttr) -> Result<()> {
    let caps = &ctx.caps().striding_rq_caps;
    if caps.supported_qpts & (1 << QpType::RawPacket as u32) == 0 {
        return Err(Error::NotSupported("striding receive queues"));
    }
    let bytes = caps.min_single_stride_log_num_of_bytes..=caps.max_single_stride_log_num_of_bytes;
    let strides = caps.min_single_wqe_log_num_of_strides..=caps.max_single_wqe_log_num_of_strides;
    if !bytes.contains(&attr.single_stride_log_num_of_bytes) {
        log::debug!(
            "rmlx5: stride size 2^{} outside {:?}",
            attr.single_stride_log_num_of_bytes,
            bytes
        );
        return Err(Error::InvalidArgument("single stride size"));
    }
    if !strides.contains(&attr.single_wqe_log_num_of_strides) {
        log::debug!(
            "rmlx5: 2^{} strides per WQE outside {:?}",
            attr.single_wqe_log_num_of_strides,
            strides
        );
        return Err(Error::InvalidArgument("strides per WQE"));
    }
    Ok(())
}

impl Wq {
    /// Create a receive work queue.
    pub fn new(ctx: &Context, attr: &WqInitAttr<'_>) -> Result<Wq> {
        let pd = attr.pd;
        if !pd.context().same_as(ctx) || !attr.cq.context().same_as(ctx) {
            return Err(Error::InvalidArgument("PD or CQ belongs to another context"));
        }
        if let Some(striding) = &attr.striding {
            check_striding(ctx, striding)?;
        }
        let wq_sig = ctx.config().rwq_signature;
        let (wq_size, geometry) = calc_rwq_size(
            ctx.caps(),
            attr.max_wr,
            attr.max_sge,
            wq_sig,
            attr.striding.is_some(),
        )?;

        let ty = ctx.config().alloc_type(AllocPrefix::Rwq, AllocType::Anon);
        let page_size = ctx.caps().page_size;
        let buf = match pd.inner().allocator() {
            Some(allocator) => Buf::alloc_external(
                allocator,
                BufResource::Rwq,
                ctx.mapper(),
                wq_size as usize,
                page_size,
                ty,
            )?,
            None => Buf::alloc(ctx.mapper(), wq_size as usize, page_size, ty)?,
        };
        buf.zero();
        let db = ctx.alloc_dbrec()?;
        db.zero();

        let slot = ctx.reserve_uidx()?;
        let mut cmd = CreateWq {
            pd_handle: pd.handle(),
            cq_handle: attr.cq.handle(),
            wq_type: WQT_RQ,
            max_wr: attr.max_wr,
            max_sge: attr.max_sge,
            create_flags: attr.create_flags,
            drv: Mlx5CreateWq {
                buf_addr: buf.addr(),
                db_addr: db.addr(),
                rq_wqe_count: geometry.wqe_cnt,
                rq_wqe_shift: geometry.wqe_shift,
                user_index: slot.uidx(),
                flags: if wq_sig { MLX5_RWQ_FLAG_SIGNATURE } else { 0 },
                ..Default::default()
            },
        };
        if let Some(s) = &attr.striding {
            cmd.drv.comp_mask |= MLX5_IB_CREATE_WQ_STRIDING_RQ;
            cmd.drv.single_stride_log_num_of_bytes = s.single_stride_log_num_of_bytes;
            cmd.drv.single_wqe_log_num_of_strides = s.single_wqe_log_num_of_strides;
            cmd.drv.two_byte_shift_en = s.two_byte_shift_en as u32;
        }

        let resp = ctx.kernel().create_wq(&cmd).map_err(|e| {
            log::debug!("rmlx5: create_wq failed: {}", e);
            e
        })?;

        let uidx = slot.uidx();
        let inner = Arc::new(WqInner {
            ctx: ctx.clone(),
            pd: UserRef::new(pd.inner()),
            handle: resp.handle,
            wqn: resp.wqn,
            uidx,
            cq: attr.cq.inner().clone(),
            geometry,
            wq_sig,
            striding: attr.striding.is_some(),
            state: spin::Mutex::new(WqState::Reset),
            cursors: spin::Mutex::new(RwqCursors::default()),
            buf,
            db,
        });
        if let Err(e) = slot.commit(Resource::rwq(&inner)) {
            if let Err(e) = ctx.kernel().destroy_wq(resp.handle) {
                log::warn!("rmlx5: cannot undo WQ {}: {}", resp.wqn, e);
            }
            return Err(e);
        }
        Ok(Wq { inner, live: true })
    }

    /// Get the underlying [`Context`].
    pub fn context(&self) -> &Context {
        &self.inner.ctx
    }

    #[inline]
    pub fn wqn(&self) -> u32 {
        self.inner.wqn
    }

    /// Kernel handle.
    #[inline]
    pub fn handle(&self) -> Handle {
        self.inner.handle
    }

    /// User index completions carry.
    #[inline]
    pub fn uidx(&self) -> u32 {
        self.inner.uidx
    }

    #[inline]
    pub fn state(&self) -> WqState {
        *self.inner.state.lock()
    }

    /// Receive queue geometry.
    #[inline]
    pub fn geometry(&self) -> &WqGeometry {
        &self.inner.geometry
    }

    #[inline]
    pub fn wq_sig(&self) -> bool {
        self.inner.wq_sig
    }

    #[inline]
    pub fn is_striding(&self) -> bool {
        self.inner.striding
    }

    /// Start address of the descriptor buffer.
    #[inline]
    pub fn buf_addr(&self) -> u64 {
        self.inner.buf.addr()
    }

    /// Receive doorbell counter.
    #[inline]
    pub fn rcv_db(&self) -> u32 {
        self.inner.db.get(RCV_DBR)
    }

    /// Consumer and producer indices of the receive ring.
    pub fn cursors(&self) -> (u32, u32) {
        let c = self.inner.cursors.lock();
        (c.head, c.tail)
    }

    /// Modify the work queue. Moving from RESET to RDY drops any stale
    /// completions and rewinds the ring.
    pub fn modify(&self, attr: &WqAttr) -> Result<()> {
        let inner = &*self.inner;
        let cur = *inner.state.lock();
        if attr.mask.contains(WqAttrMask::STATE) {
            if attr.mask.contains(WqAttrMask::CURR_STATE) && attr.curr_wq_state != cur {
                return Err(Error::InvalidArgument("current WQ state mismatch"));
            }
            if cur == WqState::Reset && attr.wq_state == WqState::Rdy {
                inner.cq.lock().clean(inner.rsn(), None, true);
                *inner.cursors.lock() = RwqCursors::default();
                inner.db.set(RCV_DBR, 0);
                inner.db.set(SND_DBR, 0);
            }
        }

        let cmd = ModifyWq {
            attr_mask: attr.mask.bits(),
            wq_state: attr.wq_state as u32,
            curr_wq_state: attr.curr_wq_state as u32,
            flags: attr.flags,
            flags_mask: attr.flags_mask,
        };
        inner.ctx.kernel().modify_wq(inner.handle, &cmd).map_err(|e| {
            log::debug!("rmlx5: modify_wq failed: {}", e);
            e
        })?;
        if attr.mask.contains(WqAttrMask::STATE) {
            *inner.state.lock() = attr.wq_state;
        }
        Ok(())
    }

    fn destroy_impl(&mut self) -> Result<()> {
        let inner = &*self.inner;
        inner.ctx.kernel().destroy_wq(inner.handle).map_err(|e| {
            log::debug!("rmlx5: destroy_wq failed: {}", e);
            e
        })?;
        inner.cq.lock().clean(inner.rsn(), None, true);
        inner.ctx.clear_uidx(inner.uidx);
        self.live = false;
        Ok(())
    }

    /// Destroy the work queue. Fails while an indirection table uses it.
    pub fn destroy(mut self) -> Result<(), DestroyError<Wq>> {
        match self.destroy_impl() {
            Ok(()) => Ok(()),
            Err(e) => Err(DestroyError::new(self, e)),
        }
    }
}

impl Drop for Wq {
    fn drop(&mut self) {
        if self.live {
            if let Err(e) = self.destroy_impl() {
                log::error!("rmlx5: cannot destroy WQ {} on drop: {}", self.inner.wqn, e);
            }
        }
    }
}

/// Receive work queue indirection table.
pub struct RwqIndTable {
    ctx: Context,
    handle: Handle,
    ind_tbl_num: u32,
    log_size: u32,
    live: bool,
}

impl fmt::Debug for RwqIndTable {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_fmt(format_args!("RwqIndTable<{}>", self.ind_tbl_num))
    }
}

impl RwqIndTable {
    /// Create a table of `1 << log_size` entries from the first entries of
    /// `wqs`.
    pub fn new(ctx: &Context, log_size: u32, wqs: &[&Wq]) -> Result<RwqIndTable> {
        let n = 1usize
            .checked_shl(log_size)
            .filter(|n| *n <= wqs.len())
            .ok_or(Error::InvalidArgument("indirection table larger than the WQ list"))?;
        if wqs[..n].iter().any(|wq| !wq.context().same_as(ctx)) {
            return Err(Error::InvalidArgument("WQ belongs to another context"));
        }

        // The payload is padded to whole u64 words.
        let mut table: Vec<u32> = wqs[..n].iter().map(|wq| wq.handle()).collect();
        table.resize(n.next_multiple_of(2), 0);

        let resp = ctx.kernel().create_rwq_ind_table(log_size, &table).map_err(|e| {
            log::debug!("rmlx5: create_rwq_ind_table failed: {}", e);
            e
        })?;
        Ok(RwqIndTable {
            ctx: ctx.clone(),
            handle: resp.handle,
            ind_tbl_num: resp.ind_tbl_num,
            log_size,
            live: true,
        })
    }

    /// Kernel handle.
    #[inline]
    pub fn handle(&self) -> Handle {
        self.handle
    }

    #[inline]
    pub fn ind_tbl_num(&self) -> u32 {
        self.ind_tbl_num
    }

    #[inline]
    pub fn log_size(&self) -> u32 {
        self.log_size
    }

    fn destroy_impl(&mut self) -> Result<()> {
        self.ctx.kernel().destroy_rwq_ind_table(self.handle)?;
        self.live = false;
        Ok(())
    }

    /// Destroy the table. Fails while RSS QPs use it.
    pub fn destroy(mut self) -> Result<(), DestroyError<RwqIndTable>> {
        match self.destroy_impl() {
            Ok(()) => Ok(()),
            Err(e) => Err(DestroyError::new(self, e)),
        }
    }
}

impl Drop for RwqIndTable {
    fn drop(&mut self) {
        if self.live {
            if let Err(e) = self.destroy_impl() {
                log::error!(
                    "rmlx5: cannot destroy indirection table {} on drop: {}",
                    self.ind_tbl_num,
                    e
                );
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::kernel::Op;
    use crate::rdma::context::tests::test_context;
    use crate::rdma::cq::{opcode, CqeInfo};
    use crate::rdma::qp::{QpBuilder, QpFlavor, QpType, RxHashConf};

    fn wq_attr<'a>(pd: &'a Pd, cq: &'a Cq) -> WqInitAttr<'a> {
        WqInitAttr {
            pd,
            cq,
            max_wr: 64,
            max_sge: 1,
            create_flags: 0,
            striding: None,
        }
    }

    fn state(wq_state: WqState) -> WqAttr {
        WqAttr {
            mask: WqAttrMask::STATE,
            wq_state,
            ..Default::default()
        }
    }

    #[test]
    fn test_wq_is_user_indexed() -> anyhow::Result<()> {
        let (ctx, kernel) = test_context();
        let pd = Pd::new(&ctx)?;
        let cq = Cq::new(&ctx, 64)?;
        let wq = Wq::new(&ctx, &wq_attr(&pd, &cq))?;
        let cmd = kernel.last_create_wq().unwrap();
        assert_eq!(cmd.drv.user_index, wq.uidx());
        assert_eq!(cmd.drv.rq_wqe_count, 64);
        assert_eq!(ctx.lookup_uidx(wq.uidx()).and_then(|r| r.rsn()), Some(wq.uidx()));

        let uidx = wq.uidx();
        wq.destroy().unwrap();
        assert!(ctx.lookup_uidx(uidx).is_none());
        Ok(())
    }

    #[test]
    fn test_ready_transition_cleans_cq() -> anyhow::Result<()> {
        let (ctx, kernel) = test_context();
        let pd = Pd::new(&ctx)?;
        let cq = Cq::new(&ctx, 64)?;
        let wq = Wq::new(&ctx, &wq_attr(&pd, &cq))?;
        let stale = CqeInfo {
            opcode: opcode::RESP_SEND,
            qpn: 0,
            srqn_uidx: wq.uidx(),
            wqe_counter: 0,
        };
        kernel.post_cqe(cq.handle(), stale)?;
        kernel.post_cqe(cq.handle(), CqeInfo { srqn_uidx: wq.uidx() + 1, ..stale })?;

        let mismatch = WqAttr {
            mask: WqAttrMask::STATE | WqAttrMask::CURR_STATE,
            wq_state: WqState::Rdy,
            curr_wq_state: WqState::Err,
            ..Default::default()
        };
        assert!(wq.modify(&mismatch).is_err());
        assert_eq!(cq.pending().len(), 2);

        wq.modify(&state(WqState::Rdy))?;
        assert_eq!(wq.state(), WqState::Rdy);
        assert_eq!(kernel.wq_state(wq.handle()), Some(WqState::Rdy));
        assert_eq!(cq.pending().len(), 1);
        assert_eq!(wq.rcv_db(), 0);
        Ok(())
    }

    #[test]
    fn test_striding_range_checks() {
        let (ctx, kernel) = test_context();
        let pd = Pd::new(&ctx).unwrap();
        let cq = Cq::new(&ctx, 16).unwrap();
        let mut attr = wq_attr(&pd, &cq);
        attr.striding = Some(StridingRqAttr {
            single_stride_log_num_of_bytes: 5,
            single_wqe_log_num_of_strides: 9,
            two_byte_shift_en: false,
        });
        assert!(matches!(Wq::new(&ctx, &attr), Err(Error::InvalidArgument(_))));

        attr.striding = Some(StridingRqAttr {
            single_stride_log_num_of_bytes: 6,
            single_wqe_log_num_of_strides: 9,
            two_byte_shift_en: true,
        });
        let wq = Wq::new(&ctx, &attr).unwrap();
        assert!(wq.is_striding());
        let cmd = kernel.last_create_wq().unwrap();
        assert_eq!(cmd.drv.comp_mask, MLX5_IB_CREATE_WQ_STRIDING_RQ);
        assert_eq!(cmd.drv.two_byte_shift_en, 1);
    }

    #[test]
    fn test_failed_create_frees_uidx() {
        let (ctx, kernel) = test_context();
        let pd = Pd::new(&ctx).unwrap();
        let cq = Cq::new(&ctx, 16).unwrap();
        let pages = ctx.dbrec_pages();
        kernel.fail_next(Op::CreateWq, libc::EINVAL);
        assert!(Wq::new(&ctx, &wq_attr(&pd, &cq)).is_err());
        assert_eq!(ctx.dbrec_pages(), pages);
        assert_eq!(pd.users(), 0);
    }

    #[test]
    fn test_oversized_depth_is_rejected() {
        let (ctx, kernel) = test_context();
        let pd = Pd::new(&ctx).unwrap();
        let cq = Cq::new(&ctx, 16).unwrap();
        for max_wr in [1 << 28, u32::MAX] {
            let attr = WqInitAttr {
                max_wr,
                ..wq_attr(&pd, &cq)
            };
            assert!(matches!(Wq::new(&ctx, &attr), Err(Error::InvalidArgument(_))));
        }
        assert!(kernel.last_create_wq().is_none());
    }

    #[test]
    fn test_ind_table_and_rss_qp() -> anyhow::Result<()> {
        let (ctx, kernel) = test_context();
        let pd = Pd::new(&ctx)?;
        let cq = Cq::new(&ctx, 16)?;
        let wq0 = Wq::new(&ctx, &wq_attr(&pd, &cq))?;
        let wq1 = Wq::new(&ctx, &wq_attr(&pd, &cq))?;
        assert!(RwqIndTable::new(&ctx, 2, &[&wq0, &wq1]).is_err());

        let table = RwqIndTable::new(&ctx, 0, &[&wq0, &wq1])?;
        let (log, entries) = kernel.last_ind_table().unwrap();
        assert_eq!(log, 0);
        assert_eq!(entries, vec![wq0.handle(), 0]);

        let conf = RxHashConf {
            rx_hash_function: 1,
            rx_hash_key: vec![0x5a; 40],
            rx_hash_fields_mask: 0x3f,
        };
        let long = RxHashConf {
            rx_hash_key: vec![0; RX_HASH_KEY_LEN + 1],
            ..conf.clone()
        };
        assert!(QpBuilder::new()
            .qp_type(QpType::RawPacket)
            .rss(&table, long)
            .build(&pd)
            .is_err());

        let qp = QpBuilder::new()
            .qp_type(QpType::RawPacket)
            .rss(&table, conf)
            .build(&pd)?;
        assert_eq!(qp.flavor(), QpFlavor::Rss);
        let cmd = kernel.last_create_rss_qp().unwrap();
        assert_eq!(cmd.rx_key_len, 40);
        assert_eq!(cmd.ind_tbl_handle, table.handle());
        let err = qp.query(Default::default()).unwrap_err();
        assert_eq!(err.errno(), libc::ENOSYS);

        let wq0 = wq0.destroy().unwrap_err().into_inner();
        let table = table.destroy().unwrap_err().into_inner();
        qp.destroy().unwrap();
        table.destroy().unwrap();
        wq0.destroy().unwrap();
        Ok(())
    }
}
