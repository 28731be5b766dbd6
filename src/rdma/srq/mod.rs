//! Shared receive queues.
//!
//! Receive descriptors of an SRQ form a free list threaded through the
//! buffer: each descriptor starts with a next segment whose big endian
//! `next_wqe_index` points at the following free slot. Slots consumed by
//! departing QPs come back through CQ cleanup.
//!
//! Basic SRQs are always found through the SRQ table by SRQ number.
//! Extended SRQs (XRC and tag matching) are user-indexed when the context
//! is, since their completions may arrive on CQs of other contexts' QPs.

mod tm;

use std::fmt;
use std::sync::Arc;

pub use self::tm::{SrqOp, TmCap};
use self::tm::TmState;
use super::buf::{Buf, BufResource};
use super::context::{Context, UidxSlot};
use super::cq::{Cq, CqInner};
use super::dbrec::Dbrec;
use super::pd::{Pd, PdInner};
use super::qp::{Qp, QpAttr, QpAttrMask, QpCaps, QpInit, QpState, QpType, SrqLink};
use super::sizing::{calc_srq_size, SrqGeometry};
use super::table::{Resource, RscType};
use super::xrcd::{Xrcd, XrcdInner};
use crate::abi::*;
use crate::config::{AllocPrefix, AllocType};
use crate::error::{DestroyError, Error, Result};
use crate::utils::UserRef;

/// Byte offset of `next_wqe_index` within a descriptor's next segment.
const NEXT_WQE_INDEX_OFFSET: usize = 2;

/// Basic SRQ creation attributes.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SrqInitAttr {
    pub max_wr: u32,
    pub max_sge: u32,
    /// Limit event watermark.
    pub srq_limit: u32,
}

/// Kind of an extended SRQ.
#[derive(Debug, Clone, Copy)]
pub enum SrqType<'a> {
    Basic,
    /// XRC SRQ; completions go to `cq`.
    Xrc { xrcd: &'a Xrcd, cq: &'a Cq },
    /// Tag-matching SRQ. `cq` must be an extended CQ.
    Tm { cq: &'a Cq, cap: TmCap },
}

/// Extended SRQ creation attributes.
#[derive(Debug, Clone, Copy)]
pub struct SrqInitAttrEx<'a> {
    pub pd: &'a Pd,
    pub srq_type: SrqType<'a>,
    pub attr: SrqInitAttr,
}

/// Kind of an existing SRQ.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SrqKind {
    Basic,
    Xrc,
    Tm,
}

#[derive(Debug)]
struct SrqRing {
    head: u16,
    tail: u16,
}

/// Ownership holder of a shared receive queue.
pub(crate) struct SrqInner {
    ctx: Context,
    pd: UserRef<PdInner>,
    handle: Handle,
    srqn: u32,
    rsn: u32,
    kind: SrqKind,
    /// Table kind: extended SRQs register as [`RscType::Xsrq`].
    rsc_type: RscType,
    geometry: SrqGeometry,
    wq_sig: bool,
    cq: Option<Arc<CqInner>>,
    xrcd: Option<Arc<XrcdInner>>,
    ring: spin::Mutex<SrqRing>,
    tm: Option<spin::Mutex<TmState>>,
    cmd_qp: spin::Mutex<Option<Qp>>,
    buf: Buf,
    db: Dbrec,
}

impl fmt::Debug for SrqInner {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SrqInner")
            .field("srqn", &self.srqn)
            .field("kind", &self.kind)
            .field("pd", &self.pd.handle())
            .field("xrcd", &self.xrcd.as_ref().map(|x| x.handle()))
            .finish()
    }
}

impl SrqInner {
    #[inline]
    pub(crate) fn handle(&self) -> Handle {
        self.handle
    }

    /// The number completions of this SRQ carry: the user index of an
    /// user-indexed extended SRQ, the SRQ number otherwise.
    #[inline]
    pub(crate) fn rsn(&self) -> u32 {
        self.rsn
    }

    fn mask(&self) -> u16 {
        (self.geometry.max - 1) as u16
    }

    fn next_ptr(&self, ind: u16) -> *mut u16 {
        let offset = ((ind as usize) << self.geometry.wqe_shift) + NEXT_WQE_INDEX_OFFSET;
        // SAFETY: `ind` is masked to the slot count, so the offset is
        // within the buffer.
        unsafe { self.buf.at(offset).cast::<u16>() }
    }

    fn next_of(&self, ind: u16) -> u16 {
        // SAFETY: aligned pointer into the descriptor buffer.
        u16::from_be(unsafe { self.next_ptr(ind & self.mask()).read_volatile() })
    }

    fn set_next(&self, ind: u16, next: u16) {
        // SAFETY: aligned pointer into the descriptor buffer.
        unsafe { self.next_ptr(ind & self.mask()).write_volatile(next.to_be()) }
    }

    /// Give a consumed slot back: link it after the current tail.
    pub(crate) fn free_wqe(&self, ind: u16) {
        let ind = ind & self.mask();
        let mut ring = self.ring.lock();
        self.set_next(ring.tail, ind);
        ring.tail = ind;
    }

    /// Slots on the free list, the tail anchor included.
    fn free_slots(&self) -> usize {
        let ring = self.ring.lock();
        let mut count = 1;
        let mut ind = ring.head;
        while ind != ring.tail && count <= self.geometry.max as usize {
            ind = self.next_of(ind);
            count += 1;
        }
        count
    }

    /// Destroy the command QP and the kernel object without touching the
    /// resource tables.
    fn teardown(&self) {
        let cmd_qp = self.cmd_qp.lock().take();
        if let Some(qp) = cmd_qp {
            if let Err(e) = qp.destroy() {
                log::warn!("rmlx5: cannot destroy SRQ command QP: {}", e.error);
            }
        }
        if let Err(e) = self.ctx.kernel().destroy_srq(self.handle) {
            log::warn!("rmlx5: cannot undo SRQ {}: {}", self.srqn, e);
        }
    }

    /// Pop the head of the free list, as posting a receive would.
    #[cfg(test)]
    pub(crate) fn take_wqe(&self) -> Option<u16> {
        let mut ring = self.ring.lock();
        if ring.head == ring.tail {
            return None;
        }
        let ind = ring.head;
        ring.head = self.next_of(ind);
        Some(ind)
    }

    #[cfg(test)]
    pub(crate) fn free_list_tail(&self) -> u16 {
        self.ring.lock().tail
    }
}

/// Shared receive queue.
pub struct Srq {
    inner: Arc<SrqInner>,
    live: bool,
}

impl fmt::Debug for Srq {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_fmt(format_args!("Srq<{}>", self.inner.srqn))
    }
}

/// Buffer, doorbell record and command template shared by both paths.
struct Prepared {
    geometry: SrqGeometry,
    buf: Buf,
    db: Dbrec,
    cmd: CreateSrq,
}

fn prepare(pd: &PdInner, attr: &SrqInitAttr, srq_type: u32) -> Result<Prepared> {
    let ctx = pd.context();
    let geometry = calc_srq_size(ctx.caps(), attr.max_wr, attr.max_sge)?;

    let ty = ctx.config().alloc_type(AllocPrefix::Srq, AllocType::Anon);
    let page_size = ctx.caps().page_size;
    let buf = match pd.allocator() {
        Some(allocator) => Buf::alloc_external(
            allocator,
            BufResource::Srq,
            ctx.mapper(),
            geometry.bytes(),
            page_size,
            ty,
        )?,
        None => Buf::alloc(ctx.mapper(), geometry.bytes(), page_size, ty)?,
    };
    buf.zero();
    let mask = geometry.max - 1;
    for i in 0..geometry.max {
        let offset = ((i as usize) << geometry.wqe_shift) + NEXT_WQE_INDEX_OFFSET;
        let next = ((i + 1) & mask) as u16;
        // SAFETY: in bounds of the descriptor buffer, u16-aligned.
        unsafe { buf.at(offset).cast::<u16>().write_volatile(next.to_be()) };
    }

    let db = ctx.alloc_dbrec()?;
    db.zero();

    let cmd = CreateSrq {
        pd_handle: pd.handle(),
        srq_type,
        max_wr: attr.max_wr,
        max_sge: attr.max_sge,
        srq_limit: attr.srq_limit,
        drv: Mlx5CreateSrq {
            buf_addr: buf.addr(),
            db_addr: db.addr(),
            flags: if ctx.config().srq_signature { MLX5_SRQ_FLAG_SIGNATURE } else { 0 },
            uidx: UIDX_NONE,
            ..Default::default()
        },
        ..Default::default()
    };
    Ok(Prepared {
        geometry,
        buf,
        db,
        cmd,
    })
}

/// Bring the command QP of a tag-matching SRQ to RTS, looped back onto
/// itself through port 1.
fn connect_cmd_qp(ctx: &Context, qp: &Qp) -> Result<()> {
    let port = ctx.kernel().query_port(1)?;
    let init = QpAttr {
        qp_state: QpState::Init,
        port_num: 1,
        ..Default::default()
    };
    qp.modify(
        &init,
        QpAttrMask::STATE | QpAttrMask::PKEY_INDEX | QpAttrMask::PORT | QpAttrMask::ACCESS_FLAGS,
    )?;

    let mut rtr = QpAttr {
        qp_state: QpState::Rtr,
        path_mtu: 1,
        dest_qp_num: qp.qpn(),
        ..Default::default()
    };
    rtr.ah_attr.dlid = port.lid;
    rtr.ah_attr.port_num = 1;
    qp.modify(
        &rtr,
        QpAttrMask::STATE
            | QpAttrMask::AV
            | QpAttrMask::PATH_MTU
            | QpAttrMask::DEST_QPN
            | QpAttrMask::RQ_PSN
            | QpAttrMask::MAX_DEST_RD_ATOMIC
            | QpAttrMask::MIN_RNR_TIMER,
    )?;

    let rts = QpAttr {
        qp_state: QpState::Rts,
        ..Default::default()
    };
    qp.modify(
        &rts,
        QpAttrMask::STATE
            | QpAttrMask::TIMEOUT
            | QpAttrMask::RETRY_CNT
            | QpAttrMask::RNR_RETRY
            | QpAttrMask::SQ_PSN
            | QpAttrMask::MAX_QP_RD_ATOMIC,
    )?;
    Ok(())
}

impl Srq {
    /// Create a basic SRQ.
    pub fn new(pd: &Pd, attr: &SrqInitAttr) -> Result<Srq> {
        let ctx = pd.context();
        let Prepared {
            geometry,
            buf,
            db,
            cmd,
        } = prepare(pd.inner(), attr, SRQT_BASIC)?;

        let mut table = ctx.srq_table();
        let resp = ctx.kernel().create_srq(&cmd).map_err(|e| {
            log::debug!("rmlx5: create_srq failed: {}", e);
            e
        })?;

        let inner = Arc::new(SrqInner {
            ctx: ctx.clone(),
            pd: UserRef::new(pd.inner()),
            handle: resp.handle,
            srqn: resp.srqn,
            rsn: resp.srqn,
            kind: SrqKind::Basic,
            rsc_type: RscType::Srq,
            geometry,
            wq_sig: ctx.config().srq_signature,
            cq: None,
            xrcd: None,
            ring: spin::Mutex::new(SrqRing {
                head: 0,
                tail: (geometry.max - 1) as u16,
            }),
            tm: None,
            cmd_qp: spin::Mutex::new(None),
            buf,
            db,
        });
        if let Err(e) = table.store_at(resp.srqn, Resource::srq(&inner, RscType::Srq)) {
            log::debug!("rmlx5: cannot register SRQ {}: {}", resp.srqn, e);
            drop(table);
            inner.teardown();
            return Err(e);
        }
        Ok(Srq { inner, live: true })
    }

    /// Create an SRQ of any kind.
    pub fn new_ex(ctx: &Context, attr: &SrqInitAttrEx<'_>) -> Result<Srq> {
        let pd = attr.pd;
        if !pd.context().same_as(ctx) {
            return Err(Error::InvalidArgument("PD belongs to another context"));
        }
        let (kind, srq_type, cq, xrcd, tm_cap) = match attr.srq_type {
            SrqType::Basic => return Srq::new(pd, &attr.attr),
            SrqType::Xrc { xrcd, cq } => (SrqKind::Xrc, SRQT_XRC, cq, Some(xrcd), None),
            SrqType::Tm { cq, cap } => {
                if !cq.is_extended() {
                    return Err(Error::InvalidArgument("tag matching needs an extended CQ"));
                }
                (SrqKind::Tm, SRQT_TM, cq, None, Some(cap))
            }
        };
        if !cq.context().same_as(ctx) {
            return Err(Error::InvalidArgument("CQ belongs to another context"));
        }

        let Prepared {
            geometry,
            buf,
            db,
            mut cmd,
        } = prepare(pd.inner(), &attr.attr, srq_type)?;
        cmd.xrcd_handle = xrcd.map(Xrcd::handle);
        cmd.cq_handle = Some(cq.handle());
        cmd.max_num_tags = tm_cap.map_or(0, |cap| cap.max_num_tags);

        let uses_uidx = ctx.caps().uses_uidx();
        let mut table = (!uses_uidx).then(|| ctx.srq_table());
        let slot: Option<UidxSlot<'_>> = if uses_uidx {
            Some(ctx.reserve_uidx()?)
        } else {
            None
        };
        if let Some(slot) = &slot {
            cmd.drv.uidx = slot.uidx();
        }

        let resp = ctx.kernel().create_srq(&cmd).map_err(|e| {
            log::debug!("rmlx5: create_srq ({:?}) failed: {}", kind, e);
            e
        })?;

        let (cmd_qp, tm) = match tm_cap {
            Some(cap) => {
                let mut init = QpInit::new(QpType::Rc);
                init.caps = QpCaps {
                    max_send_wr: cap.max_ops,
                    max_send_sge: 1,
                    ..Default::default()
                };
                init.send_cq = Some(cq.inner());
                init.recv_cq = Some(cq.inner());
                init.srq = Some(SrqLink::Handle(resp.handle));
                let qp = Qp::create(pd.inner(), init).and_then(|qp| {
                    connect_cmd_qp(ctx, &qp)?;
                    Ok(qp)
                });
                match qp {
                    Ok(qp) => {
                        let tm = TmState::new(cap.max_num_tags, qp.layout().sq.wqe_cnt);
                        (Some(qp), Some(spin::Mutex::new(tm)))
                    }
                    Err(e) => {
                        log::debug!("rmlx5: cannot set up the tag-matching command QP: {}", e);
                        if let Err(e) = ctx.kernel().destroy_srq(resp.handle) {
                            log::warn!("rmlx5: cannot undo SRQ {}: {}", resp.srqn, e);
                        }
                        return Err(e);
                    }
                }
            }
            None => (None, None),
        };

        let rsn = slot.as_ref().map_or(resp.srqn, UidxSlot::uidx);
        let inner = Arc::new(SrqInner {
            ctx: ctx.clone(),
            pd: UserRef::new(pd.inner()),
            handle: resp.handle,
            srqn: resp.srqn,
            rsn,
            kind,
            rsc_type: RscType::Xsrq,
            geometry,
            wq_sig: ctx.config().srq_signature,
            cq: Some(cq.inner().clone()),
            xrcd: xrcd.map(|x| x.inner().clone()),
            ring: spin::Mutex::new(SrqRing {
                head: 0,
                tail: (geometry.max - 1) as u16,
            }),
            tm,
            cmd_qp: spin::Mutex::new(cmd_qp),
            buf,
            db,
        });

        let entry = Resource::srq(&inner, RscType::Xsrq);
        let registered = match (slot, table.as_mut()) {
            (Some(slot), _) => slot.commit(entry).map(drop),
            (None, Some(table)) => table.store_at(resp.srqn, entry),
            (None, None) => Ok(()),
        };
        drop(table);
        if let Err(e) = registered {
            log::debug!("rmlx5: cannot register SRQ {}: {}", resp.srqn, e);
            inner.teardown();
            return Err(e);
        }
        Ok(Srq { inner, live: true })
    }

    pub(crate) fn inner(&self) -> &Arc<SrqInner> {
        &self.inner
    }

    /// Get the underlying [`Context`].
    pub fn context(&self) -> &Context {
        &self.inner.ctx
    }

    /// The SRQ number.
    #[inline]
    pub fn srq_num(&self) -> u32 {
        self.inner.srqn
    }

    /// Kernel handle.
    #[inline]
    pub fn handle(&self) -> Handle {
        self.inner.handle
    }

    #[inline]
    pub fn kind(&self) -> SrqKind {
        self.inner.kind
    }

    /// The number completions of this SRQ carry.
    #[inline]
    pub fn rsn(&self) -> u32 {
        self.inner.rsn
    }

    /// Usable depth.
    #[inline]
    pub fn max_wr(&self) -> u32 {
        self.inner.geometry.max_wr()
    }

    /// Scatter entries per receive.
    #[inline]
    pub fn max_sge(&self) -> u32 {
        self.inner.geometry.max_gs
    }

    /// Whether descriptors carry signatures.
    #[inline]
    pub fn wq_sig(&self) -> bool {
        self.inner.wq_sig
    }

    /// Receive doorbell counter.
    #[inline]
    pub fn db(&self) -> u32 {
        self.inner.db.get(0)
    }

    /// Free slots, counting the one always kept in reserve.
    pub fn free_slots(&self) -> usize {
        self.inner.free_slots()
    }

    /// QP number of the tag-matching command QP.
    pub fn cmd_qpn(&self) -> Option<u32> {
        self.inner.cmd_qp.lock().as_ref().map(Qp::qpn)
    }

    /// Tag entries of a tag-matching SRQ, the list anchor included.
    pub fn tm_num_tags(&self) -> Option<usize> {
        self.inner.tm.as_ref().map(|tm| tm.lock().num_tags())
    }

    /// Take a free tag entry for an application-posted list operation.
    pub fn tm_alloc_tag(&self, wr_id: u64) -> Option<u32> {
        let mut tm = self.inner.tm.as_ref()?.lock();
        let idx = tm.alloc_tag()?;
        if let Some(tag) = tm.tag_mut(idx) {
            tag.wr_id = wr_id;
        }
        Some(idx)
    }

    /// Return a tag entry.
    pub fn tm_free_tag(&self, idx: u32) {
        if let Some(tm) = &self.inner.tm {
            tm.lock().free_tag(idx);
        }
    }

    /// Record an outstanding list operation. Fails with
    /// [`Error::Exhausted`] when every command slot is in flight.
    pub fn tm_push_op(&self, op: SrqOp) -> Result<()> {
        let tm = self.inner.tm.as_ref().ok_or(Error::InvalidArgument("not a tag-matching SRQ"))?;
        let mut tm = tm.lock();
        if tm.op_slots() == 0 {
            return Err(Error::Exhausted);
        }
        tm.push_op(op).ok_or(Error::Exhausted)
    }

    /// Retire the oldest outstanding list operation.
    pub fn tm_pop_op(&self) -> Option<SrqOp> {
        self.inner.tm.as_ref()?.lock().pop_op()
    }

    /// Modify the depth or the limit watermark. `mask` takes
    /// [`SRQ_MAX_WR`] and [`SRQ_LIMIT`].
    pub fn modify(&self, attr: &SrqAttr, mask: u32) -> Result<()> {
        Ok(self.inner.ctx.kernel().modify_srq(self.inner.handle, attr, mask)?)
    }

    pub fn query(&self) -> Result<SrqAttr> {
        Ok(self.inner.ctx.kernel().query_srq(self.inner.handle)?)
    }

    fn destroy_impl(&mut self) -> Result<()> {
        let inner = &*self.inner;
        let ctx = &inner.ctx;

        let cmd_qp = inner.cmd_qp.lock().take();
        if let Some(qp) = cmd_qp {
            if let Err(e) = qp.destroy() {
                log::debug!("rmlx5: cannot destroy SRQ command QP: {}", e.error);
                *inner.cmd_qp.lock() = Some(e.object);
                return Err(e.error);
            }
        }

        ctx.kernel().destroy_srq(inner.handle).map_err(|e| {
            log::debug!("rmlx5: destroy_srq failed: {}", e);
            e
        })?;

        let user_indexed = ctx.caps().uses_uidx() && inner.rsc_type == RscType::Xsrq;
        if user_indexed {
            ctx.clear_uidx(inner.rsn);
        } else {
            ctx.srq_table().clear(inner.srqn);
        }
        if let (true, Some(cq)) = (user_indexed, &inner.cq) {
            cq.lock().clean(inner.rsn, None, true);
        }
        self.live = false;
        Ok(())
    }

    /// Destroy the SRQ. Fails while QPs receive from it.
    pub fn destroy(mut self) -> Result<(), DestroyError<Srq>> {
        match self.destroy_impl() {
            Ok(()) => Ok(()),
            Err(e) => Err(DestroyError::new(self, e)),
        }
    }
}

impl Drop for Srq {
    fn drop(&mut self) {
        if self.live {
            if let Err(e) = self.destroy_impl() {
                log::error!("rmlx5: cannot destroy SRQ {} on drop: {}", self.inner.srqn, e);
            }
        }
    }
}
