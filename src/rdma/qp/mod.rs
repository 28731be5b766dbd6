//! Queue pairs.
//!
//! Besides the ordinary transports this covers the device-specific
//! flavors: DC initiators and targets, underlay UD (a UD QP with a fixed
//! source QPN) and RSS raw-packet QPs spreading over a receive work queue
//! indirection table.

mod attr;
mod builder;
mod ty;

use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Arc;

use bitflags::bitflags;

pub use self::attr::*;
pub use self::builder::*;
pub use self::ty::*;
use super::bf::Bf;
use super::buf::{Buf, BufResource};
use super::caps::{AtomicCap, DeviceCapFlags, LinkLayer, PP_SUPPORT_BURST};
use super::context::{Context, UidxSlot};
use super::cq::CqInner;
use super::dbrec::{Dbrec, RCV_DBR, SND_DBR};
use super::gid::Gid;
use super::pd::PdInner;
use super::sizing::{calc_wq_size, QpLayout};
use super::srq::SrqInner;
use super::table::Resource;
use super::xrcd::XrcdInner;
use crate::abi::*;
use crate::config::{AllocPrefix, AllocType};
use crate::error::{DestroyError, Error, Result};
use crate::utils::UserRef;

/// Control segment flag asking for a completion on every send.
pub(crate) const WQE_CTRL_CQ_UPDATE: u8 = 2 << 2;

/// Smallest extended modify response that carries a DCT number.
const DCT_MIN_RESP_LEN: u32 = 8;

bitflags! {
    /// Offloads enabled on a QP after it was bound to a port.
    #[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash)]
    pub struct QpCapCache: u32 {
        const CSUM_UNDERLAY_UD = 1 << 0;
        const CSUM_RAW_OVER_ETH = 1 << 1;
        const RX_CSUM_VALID = 1 << 2;
    }
}

/// Dynamically connected transport attributes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DcInit {
    pub dc_type: DcType,
    /// Access key a DCT accepts. Ignored for initiators.
    pub access_key: u64,
}

/// RX hash configuration of an RSS QP.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RxHashConf {
    pub rx_hash_function: u8,
    pub rx_hash_key: Vec<u8>,
    pub rx_hash_fields_mask: u64,
}

/// How a QP refers to the SRQ it receives from.
pub(crate) enum SrqLink {
    /// An SRQ owned by this library; the QP returns its slots on cleanup.
    Shared(Arc<SrqInner>),
    /// A bare kernel handle, used by the command QP of a tag-matching SRQ.
    Handle(Handle),
}

impl SrqLink {
    fn handle(&self) -> Handle {
        match self {
            SrqLink::Shared(srq) => srq.handle(),
            SrqLink::Handle(h) => *h,
        }
    }

    fn srq(&self) -> Option<&SrqInner> {
        match self {
            SrqLink::Shared(srq) => Some(srq),
            SrqLink::Handle(_) => None,
        }
    }
}

/// Everything needed to create a QP.
pub(crate) struct QpInit<'a> {
    pub qp_type: QpType,
    pub caps: QpCaps,
    pub send_cq: Option<&'a Arc<CqInner>>,
    pub recv_cq: Option<&'a Arc<CqInner>>,
    pub srq: Option<SrqLink>,
    pub xrcd: Option<&'a Arc<XrcdInner>>,
    pub sq_sig_all: bool,
    pub create_flags: u32,
    pub source_qpn: u32,
    pub max_tso_header: Option<u16>,
    pub dc: Option<DcInit>,
    pub tunnel_offloads: bool,
    pub rss: Option<(Handle, RxHashConf)>,
}

impl QpInit<'_> {
    pub fn new(qp_type: QpType) -> Self {
        Self {
            qp_type,
            caps: QpCaps::default(),
            send_cq: None,
            recv_cq: None,
            srq: None,
            xrcd: None,
            sq_sig_all: false,
            create_flags: 0,
            source_qpn: 0,
            max_tso_header: None,
            dc: None,
            tunnel_offloads: false,
            rss: None,
        }
    }
}

#[derive(Debug)]
struct QpStatus {
    state: QpState,
    cap_cache: QpCapCache,
    max_tso: u32,
}

#[derive(Debug, Default)]
struct Cursors {
    sq_head: u32,
    sq_tail: u32,
    sq_cur_post: u32,
    rq_head: u32,
    rq_tail: u32,
}

/// Ownership holder of a queue pair.
pub(crate) struct QpInner {
    ctx: Context,
    pd: UserRef<PdInner>,
    handle: Handle,
    qp_type: QpType,
    flavor: QpFlavor,
    qpn: AtomicU32,
    rsn: AtomicU32,
    uidx: Option<u32>,
    registered: AtomicBool,
    send_cq: Option<Arc<CqInner>>,
    recv_cq: Option<Arc<CqInner>>,
    srq: Option<SrqLink>,
    xrcd: Option<Arc<XrcdInner>>,
    layout: QpLayout,
    wq_sig: bool,
    atomics_enabled: bool,
    sq_signal_bits: u8,
    bf: Option<Arc<Bf>>,
    status: spin::Mutex<QpStatus>,
    cursors: spin::Mutex<Cursors>,
    buf: Option<Buf>,
    sq_buf: Option<Buf>,
    db: Option<Dbrec>,
}

impl fmt::Debug for QpInner {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("QpInner")
            .field("handle", &self.handle)
            .field("qpn", &self.qpn())
            .field("flavor", &self.flavor)
            .field("pd", &self.pd.handle())
            .field("xrcd", &self.xrcd.as_ref().map(|x| x.handle()))
            .finish()
    }
}

impl QpInner {
    #[inline]
    pub(crate) fn qpn(&self) -> u32 {
        self.qpn.load(Ordering::Acquire)
    }

    /// The number completions of this QP carry: the user index, or the QP
    /// number when the QP is not user-indexed.
    #[inline]
    pub(crate) fn rsn(&self) -> u32 {
        self.rsn.load(Ordering::Acquire)
    }

    #[inline]
    pub(crate) fn handle(&self) -> Handle {
        self.handle
    }

    fn context(&self) -> &Context {
        &self.ctx
    }

    /// Remove every completion of this QP from its CQs, returning receive
    /// slots to the SRQ. Both CQs are locked together, lower CQN first.
    fn clean_cqs(&self) {
        let rsn = self.rsn();
        let use_uidx = self.uidx.is_some();
        let srq = self.srq.as_ref().and_then(SrqLink::srq);
        match (&self.send_cq, &self.recv_cq) {
            (Some(s), Some(r)) if Arc::ptr_eq(s, r) => {
                r.lock().clean(rsn, srq, use_uidx);
            }
            (Some(s), Some(r)) => {
                let (mut sg, mut rg) = if s.cqn() < r.cqn() {
                    let sg = s.lock();
                    (sg, r.lock())
                } else {
                    let rg = r.lock();
                    (s.lock(), rg)
                };
                rg.clean(rsn, srq, use_uidx);
                sg.clean(rsn, None, use_uidx);
            }
            (Some(s), None) => {
                s.lock().clean(rsn, None, use_uidx);
            }
            (None, Some(r)) => {
                r.lock().clean(rsn, srq, use_uidx);
            }
            (None, None) => {}
        }
    }

    fn reset_queues(&self) {
        *self.cursors.lock() = Cursors::default();
        if let Some(db) = &self.db {
            db.zero();
        }
    }
}

/// Queue pair.
pub struct Qp {
    inner: Arc<QpInner>,
    live: bool,
}

impl fmt::Debug for Qp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_fmt(format_args!("Qp<{}>", self.inner.qpn()))
    }
}

fn alloc_qp_buf(pd: &PdInner, size: usize, ty: AllocType) -> Result<Buf> {
    let ctx = pd.context();
    let page_size = ctx.caps().page_size;
    let buf = match pd.allocator() {
        Some(allocator) => {
            Buf::alloc_external(allocator, BufResource::Qp, ctx.mapper(), size, page_size, ty)?
        }
        None => Buf::alloc(ctx.mapper(), size, page_size, ty)?,
    };
    buf.zero();
    Ok(buf)
}

fn huge_by_type(ctx: &Context, flavor: QpFlavor) -> bool {
    let huge = &ctx.config().huge;
    match flavor {
        QpFlavor::Rc | QpFlavor::XrcIni | QpFlavor::XrcTgt | QpFlavor::Dci => huge.rc,
        QpFlavor::Uc => huge.uc,
        QpFlavor::Ud { .. } => huge.ud,
        QpFlavor::RawPacket => huge.raw_eth,
        QpFlavor::Dct | QpFlavor::Rss => false,
    }
}

impl Qp {
    /// Create a QP on `pd`.
    pub(crate) fn create(pd: &Arc<PdInner>, init: QpInit<'_>) -> Result<Qp> {
        let underlay = init.create_flags & QP_CREATE_SOURCE_QPN != 0;
        if underlay && init.qp_type != QpType::Ud {
            return Err(Error::InvalidArgument("source QPN is only valid for UD QPs"));
        }
        if init.max_tso_header.is_some() && init.qp_type != QpType::RawPacket {
            return Err(Error::InvalidArgument("TSO is only valid for raw packet QPs"));
        }
        if init.dc.is_some() && init.qp_type != QpType::Driver {
            return Err(Error::InvalidArgument("DC attributes need the driver QP type"));
        }
        let flavor = QpFlavor::resolve(
            init.qp_type,
            underlay,
            init.dc.map(|dc| dc.dc_type),
            init.rss.is_some(),
        )
        .ok_or(Error::InvalidArgument("QP type"))?;

        match flavor {
            QpFlavor::Rss => Self::create_rss(pd, init),
            QpFlavor::Dct => Self::create_dct(pd, init),
            _ => Self::create_wq_qp(pd, init, flavor),
        }
    }

    fn base_cmd(pd: &PdInner, init: &QpInit<'_>) -> CreateQp {
        CreateQp {
            pd_handle: pd.handle(),
            send_cq_handle: init.send_cq.map(|cq| cq.handle()),
            recv_cq_handle: init.recv_cq.map(|cq| cq.handle()),
            srq_handle: init.srq.as_ref().map(SrqLink::handle),
            xrcd_handle: init.xrcd.map(|x| x.handle()),
            qp_type: init.qp_type.into(),
            sq_sig_all: init.sq_sig_all as u8,
            max_send_wr: init.caps.max_send_wr,
            max_recv_wr: init.caps.max_recv_wr,
            max_send_sge: init.caps.max_send_sge,
            max_recv_sge: init.caps.max_recv_sge,
            max_inline_data: init.caps.max_inline_data,
            create_flags: init.create_flags,
            source_qpn: init.source_qpn,
            max_tso_header: init.max_tso_header.unwrap_or(0),
            ..Default::default()
        }
    }

    #[allow(clippy::too_many_arguments)]
    fn assemble(
        pd: &Arc<PdInner>,
        init: QpInit<'_>,
        flavor: QpFlavor,
        handle: Handle,
        qpn: u32,
        uidx: Option<u32>,
        layout: QpLayout,
        bf: Option<Arc<Bf>>,
        bufs: (Option<Buf>, Option<Buf>, Option<Dbrec>),
    ) -> Arc<QpInner> {
        let ctx = pd.context();
        let (buf, sq_buf, db) = bufs;
        Arc::new(QpInner {
            ctx: ctx.clone(),
            pd: UserRef::new(pd),
            handle,
            qp_type: init.qp_type,
            flavor,
            qpn: AtomicU32::new(qpn),
            rsn: AtomicU32::new(uidx.unwrap_or(qpn)),
            uidx,
            registered: AtomicBool::new(false),
            send_cq: init.send_cq.cloned(),
            recv_cq: init.recv_cq.cloned(),
            srq: init.srq,
            xrcd: init.xrcd.cloned(),
            layout,
            wq_sig: ctx.config().qp_signature,
            atomics_enabled: ctx.caps().atomic_cap == AtomicCap::Hca,
            sq_signal_bits: if init.sq_sig_all { WQE_CTRL_CQ_UPDATE } else { 0 },
            bf,
            status: spin::Mutex::new(QpStatus {
                state: QpState::Reset,
                cap_cache: QpCapCache::empty(),
                max_tso: 0,
            }),
            cursors: spin::Mutex::new(Cursors::default()),
            buf,
            sq_buf,
            db,
        })
    }

    fn create_wq_qp(pd: &Arc<PdInner>, mut init: QpInit<'_>, flavor: QpFlavor) -> Result<Qp> {
        let ctx = pd.context();
        let caps = ctx.caps();
        let config = ctx.config();

        let mut flags = 0;
        if config.qp_signature {
            flags |= MLX5_QP_FLAG_SIGNATURE;
        }
        if config.scatter_to_cqe {
            flags |= MLX5_QP_FLAG_SCATTER_CQE;
        }
        if init.tunnel_offloads {
            if caps.tunnel_offloads_caps == 0 {
                return Err(Error::NotSupported("tunnel offloads"));
            }
            flags |= MLX5_QP_FLAG_TUNNEL_OFFLOADS;
        }
        if flavor == QpFlavor::Dci {
            flags |= MLX5_QP_FLAG_TYPE_DCI;
        }

        let layout = calc_wq_size(
            caps,
            flavor,
            &mut init.caps,
            init.max_tso_header,
            init.srq.is_some(),
            config.qp_signature,
        )
        .map_err(|e| {
            log::debug!("rmlx5: cannot lay out QP queues: {}", e);
            e
        })?;

        let default_ty = if huge_by_type(ctx, flavor) {
            AllocType::PreferHuge
        } else {
            AllocType::Anon
        };
        let ty = config.alloc_type(AllocPrefix::Qp, default_ty);
        let buf = match layout.buf_size {
            0 => None,
            size => Some(alloc_qp_buf(pd, size, ty)?),
        };
        let sq_buf = match layout.sq_buf_size {
            0 => None,
            size => Some(alloc_qp_buf(pd, size, ty)?),
        };
        let db = ctx.alloc_dbrec()?;
        db.zero();

        let mut cmd = Self::base_cmd(pd, &init);
        cmd.drv.buf_addr = buf.as_ref().map_or(0, Buf::addr);
        cmd.drv.sq_buf_addr_or_access_key = sq_buf.as_ref().map_or(0, Buf::addr);
        cmd.drv.db_addr = db.addr();
        cmd.drv.sq_wqe_count = layout.sq.wqe_cnt;
        cmd.drv.rq_wqe_count = layout.rq.wqe_cnt;
        cmd.drv.rq_wqe_shift = layout.rq.wqe_shift;

        let td_bf = pd.td_bf().cloned();
        if let Some(index) = td_bf.as_ref().and_then(|bf| bf.dyn_index()) {
            flags |= MLX5_QP_FLAG_BFREG_INDEX;
            cmd.drv.bfreg_index = index;
        }
        cmd.drv.flags = flags;

        // Legacy numbering keeps the table locked until the QPN is stored.
        let uses_uidx = caps.uses_uidx() && flavor != QpFlavor::XrcTgt;
        let mut table = (!caps.uses_uidx()).then(|| ctx.qp_table());
        let slot: Option<UidxSlot<'_>> = if uses_uidx {
            Some(ctx.reserve_uidx()?)
        } else {
            None
        };
        cmd.drv.uidx = slot.as_ref().map_or(UIDX_NONE, UidxSlot::uidx);

        let resp = ctx.kernel().create_qp(&cmd).map_err(|e| {
            log::debug!("rmlx5: create_qp failed: {}", e);
            e
        })?;

        let bf = match td_bf {
            Some(bf) => Some(bf),
            None => {
                let bf = ctx.bfs().static_bf(resp.bfreg_index);
                if bf.is_none() {
                    log::warn!("rmlx5: kernel chose unknown bfreg {}", resp.bfreg_index);
                }
                bf
            }
        };

        let mut layout = layout;
        layout.rq.max_post = layout.rq.wqe_cnt;
        let needs_entry = layout.sq.wqe_cnt > 0 || layout.rq.wqe_cnt > 0;
        let inner = Self::assemble(
            pd,
            init,
            flavor,
            resp.handle,
            resp.qpn,
            slot.as_ref().map(UidxSlot::uidx),
            layout,
            bf,
            (buf, sq_buf, Some(db)),
        );

        let registered = match (slot, table.as_mut()) {
            (Some(slot), _) => slot.commit(Resource::qp(&inner)).map(drop),
            (None, Some(table)) if needs_entry => table
                .store_at(resp.qpn, Resource::qp(&inner))
                .map(|_| inner.registered.store(true, Ordering::Release)),
            _ => Ok(()),
        };
        drop(table);
        if let Err(e) = registered {
            log::debug!("rmlx5: cannot register QP {}: {}", resp.qpn, e);
            if let Err(e) = ctx.kernel().destroy_qp(resp.handle) {
                log::warn!("rmlx5: cannot undo QP {}: {}", resp.qpn, e);
            }
            return Err(e);
        }
        log::trace!("rmlx5: created QP {} ({:?})", resp.qpn, flavor);
        Ok(Qp { inner, live: true })
    }

    fn create_dct(pd: &Arc<PdInner>, init: QpInit<'_>) -> Result<Qp> {
        let ctx = pd.context();
        if init.srq.is_none() {
            return Err(Error::InvalidArgument("DCT needs an SRQ"));
        }
        let mut cmd = Self::base_cmd(pd, &init);
        cmd.drv.flags = MLX5_QP_FLAG_TYPE_DCT;
        if init.tunnel_offloads {
            cmd.drv.flags |= MLX5_QP_FLAG_TUNNEL_OFFLOADS;
        }
        cmd.drv.sq_buf_addr_or_access_key = init.dc.map_or(0, |dc| dc.access_key);

        let slot = if ctx.caps().uses_uidx() {
            Some(ctx.reserve_uidx()?)
        } else {
            None
        };
        cmd.drv.uidx = slot.as_ref().map_or(UIDX_NONE, UidxSlot::uidx);

        let resp = ctx.kernel().create_qp(&cmd).map_err(|e| {
            log::debug!("rmlx5: create_qp (DCT) failed: {}", e);
            e
        })?;
        let uidx = slot.as_ref().map(UidxSlot::uidx);
        let inner = Self::assemble(
            pd,
            init,
            QpFlavor::Dct,
            resp.handle,
            resp.qpn,
            uidx,
            QpLayout::default(),
            None,
            (None, None, None),
        );
        if let Some(slot) = slot {
            if let Err(e) = slot.commit(Resource::qp(&inner)) {
                if let Err(e) = ctx.kernel().destroy_qp(resp.handle) {
                    log::warn!("rmlx5: cannot undo DCT: {}", e);
                }
                return Err(e);
            }
        }
        Ok(Qp { inner, live: true })
    }

    fn create_rss(pd: &Arc<PdInner>, init: QpInit<'_>) -> Result<Qp> {
        let ctx = pd.context();
        let Some((ind_tbl_handle, conf)) = init.rss.as_ref() else {
            return Err(Error::InvalidArgument("RSS QP needs an indirection table"));
        };
        if conf.rx_hash_key.len() > RX_HASH_KEY_LEN {
            return Err(Error::InvalidArgument("RX hash key too long"));
        }
        let mut cmd = CreateRssQp {
            pd_handle: pd.handle(),
            ind_tbl_handle: *ind_tbl_handle,
            rx_hash_fields_mask: conf.rx_hash_fields_mask,
            rx_hash_function: conf.rx_hash_function,
            rx_key_len: conf.rx_hash_key.len() as u8,
            create_flags: if init.tunnel_offloads { MLX5_QP_FLAG_TUNNEL_OFFLOADS } else { 0 },
            ..Default::default()
        };
        cmd.rx_hash_key[..conf.rx_hash_key.len()].copy_from_slice(&conf.rx_hash_key);

        let resp = ctx.kernel().create_rss_qp(&cmd).map_err(|e| {
            log::debug!("rmlx5: create_rss_qp failed: {}", e);
            e
        })?;
        let inner = Self::assemble(
            pd,
            init,
            QpFlavor::Rss,
            resp.handle,
            resp.qpn,
            None,
            QpLayout::default(),
            None,
            (None, None, None),
        );
        Ok(Qp { inner, live: true })
    }

    pub(crate) fn inner(&self) -> &Arc<QpInner> {
        &self.inner
    }

    /// Get the underlying [`Context`].
    pub fn context(&self) -> &Context {
        &self.inner.ctx
    }

    /// The QP number. A DCT reports zero until it reaches RTR.
    #[inline]
    pub fn qpn(&self) -> u32 {
        self.inner.qpn()
    }

    /// Kernel handle.
    #[inline]
    pub fn handle(&self) -> Handle {
        self.inner.handle
    }

    #[inline]
    pub fn qp_type(&self) -> QpType {
        self.inner.qp_type
    }

    #[inline]
    pub fn flavor(&self) -> QpFlavor {
        self.inner.flavor
    }

    /// Last state this QP was successfully moved to.
    #[inline]
    pub fn state(&self) -> QpState {
        self.inner.status.lock().state
    }

    /// User index, if the QP is user-indexed.
    #[inline]
    pub fn uidx(&self) -> Option<u32> {
        self.inner.uidx
    }

    /// The number completions of this QP carry.
    #[inline]
    pub fn rsn(&self) -> u32 {
        self.inner.rsn()
    }

    /// Capabilities actually provided.
    pub fn caps(&self) -> QpCaps {
        let l = &self.inner.layout;
        QpCaps {
            max_send_wr: l.sq.max_post,
            max_recv_wr: l.rq.max_post,
            max_send_sge: l.sq.max_gs,
            max_recv_sge: l.rq.max_gs,
            max_inline_data: l.max_inline_data,
        }
    }

    /// Queue geometry.
    #[inline]
    pub fn layout(&self) -> &QpLayout {
        &self.inner.layout
    }

    /// The doorbell register this QP rings.
    #[inline]
    pub fn bf(&self) -> Option<&Arc<Bf>> {
        self.inner.bf.as_ref()
    }

    /// Whether the adapter executes atomics for this QP.
    #[inline]
    pub fn atomics_enabled(&self) -> bool {
        self.inner.atomics_enabled
    }

    /// Whether work queue entries carry signatures.
    #[inline]
    pub fn wq_sig(&self) -> bool {
        self.inner.wq_sig
    }

    /// Control segment signal bits applied to every send.
    #[inline]
    pub fn sq_signal_bits(&self) -> u8 {
        self.inner.sq_signal_bits
    }

    /// Checksum offloads enabled by the last port binding.
    #[inline]
    pub fn csum_caps(&self) -> QpCapCache {
        self.inner.status.lock().cap_cache
    }

    /// Largest TSO payload, zero when TSO is off.
    #[inline]
    pub fn max_tso(&self) -> u32 {
        self.inner.status.lock().max_tso
    }

    /// Receive doorbell counter.
    pub fn rcv_db(&self) -> Option<u32> {
        self.inner.db.as_ref().map(|db| db.get(RCV_DBR))
    }

    /// Send doorbell counter.
    pub fn snd_db(&self) -> Option<u32> {
        self.inner.db.as_ref().map(|db| db.get(SND_DBR))
    }

    /// Start address of the main work queue buffer.
    pub fn buf_addr(&self) -> Option<u64> {
        self.inner.buf.as_ref().map(Buf::addr)
    }

    /// Start address of the separate send queue buffer of split layouts.
    pub fn sq_buf_addr(&self) -> Option<u64> {
        self.inner.sq_buf.as_ref().map(Buf::addr)
    }

    /// Send and receive queue indices: `(sq_head, sq_tail, sq_cur_post, rq_head, rq_tail)`.
    pub fn cursors(&self) -> (u32, u32, u32, u32, u32) {
        let c = self.inner.cursors.lock();
        (c.sq_head, c.sq_tail, c.sq_cur_post, c.rq_head, c.rq_tail)
    }

    /// Modify the QP.
    pub fn modify(&self, attr: &QpAttr, mask: QpAttrMask) -> Result<()> {
        let inner = &*self.inner;
        match inner.flavor {
            QpFlavor::Dct => return self.modify_dct(attr, mask),
            QpFlavor::Rss => return Err(Error::NotImplemented("modify of RSS QPs")),
            _ => {}
        }
        let ctx = inner.context();
        let caps = ctx.caps();
        if inner.flavor.is_underlay() && !(mask - (QpAttrMask::STATE | QpAttrMask::CUR_STATE)).is_empty() {
            return Err(Error::InvalidArgument("underlay QP accepts state changes only"));
        }

        let cmd = ModifyQp {
            attr: *attr,
            mask,
            ex: mask.contains(QpAttrMask::RATE_LIMIT),
            burst: BurstInfo::default(),
        };
        ctx.kernel().modify_qp(inner.handle, &cmd).map_err(|e| {
            log::debug!("rmlx5: modify_qp failed: {}", e);
            e
        })?;

        {
            let mut status = inner.status.lock();
            if inner.flavor.is_underlay() && caps.device_cap_flags.contains(DeviceCapFlags::UD_IP_CSUM) {
                status.cap_cache |= QpCapCache::CSUM_UNDERLAY_UD | QpCapCache::RX_CSUM_VALID;
            }
            let eth = caps.link_layer(attr.port_num) == Some(LinkLayer::Ethernet);
            if mask.contains(QpAttrMask::PORT) && inner.flavor == QpFlavor::RawPacket && eth {
                if caps.device_cap_flags.contains(DeviceCapFlags::RAW_IP_CSUM) {
                    status.cap_cache |= QpCapCache::CSUM_RAW_OVER_ETH | QpCapCache::RX_CSUM_VALID;
                }
                if caps.tso_caps.supported_qpts & (1 << QpType::RawPacket as u32) != 0 {
                    status.max_tso = caps.tso_caps.max_tso;
                }
            }
            if mask.contains(QpAttrMask::STATE) {
                status.state = attr.qp_state;
            }
        }

        if mask.contains(QpAttrMask::STATE) {
            match attr.qp_state {
                QpState::Reset => {
                    inner.clean_cqs();
                    inner.reset_queues();
                }
                QpState::Rtr if inner.flavor == QpFlavor::RawPacket || inner.flavor.is_underlay() => {
                    let rq_head = inner.cursors.lock().rq_head;
                    if let Some(db) = &inner.db {
                        db.set(RCV_DBR, rq_head & 0xffff);
                    }
                }
                _ => {}
            }
        }
        Ok(())
    }

    fn modify_dct(&self, attr: &QpAttr, mask: QpAttrMask) -> Result<()> {
        let inner = &self.inner;
        let ctx = inner.context();
        let cmd = ModifyQp {
            attr: *attr,
            mask,
            ex: true,
            burst: BurstInfo::default(),
        };
        let resp = ctx.kernel().modify_qp(inner.handle, &cmd).map_err(|e| {
            log::debug!("rmlx5: modify_qp (DCT) failed: {}", e);
            e
        })?;

        if mask.contains(QpAttrMask::STATE) && attr.qp_state == QpState::Rtr {
            if resp.response_length < DCT_MIN_RESP_LEN {
                log::debug!("rmlx5: kernel returned no DCT number");
                return Err(Error::InvalidArgument("modify response lacks the DCT number"));
            }
            inner.qpn.store(resp.dctn, Ordering::Release);
            if inner.uidx.is_none() {
                inner.rsn.store(resp.dctn, Ordering::Release);
                ctx.qp_table().store_at(resp.dctn, Resource::qp(inner))?;
                inner.registered.store(true, Ordering::Release);
            }
        }
        if mask.contains(QpAttrMask::STATE) {
            inner.status.lock().state = attr.qp_state;
        }
        Ok(())
    }

    /// Set the send rate limit and the pacing burst parameters.
    pub fn modify_rate_limit(&self, attr: &RateLimitAttr) -> Result<()> {
        if attr.comp_mask != 0 {
            return Err(Error::InvalidArgument("rate limit comp_mask"));
        }
        let ctx = self.inner.context();
        let burst = attr.max_burst_sz != 0 || attr.typical_pkt_sz != 0;
        let supports_burst = ctx.caps().packet_pacing_caps.cap_flags & PP_SUPPORT_BURST != 0;
        if burst && (attr.rate_limit == 0 || !supports_burst) {
            return Err(Error::InvalidArgument("burst parameters need a rate and device support"));
        }
        let cmd = ModifyQp {
            attr: QpAttr {
                rate_limit: attr.rate_limit,
                ..Default::default()
            },
            mask: QpAttrMask::RATE_LIMIT,
            ex: true,
            burst: BurstInfo {
                max_burst_sz: attr.max_burst_sz,
                typical_pkt_sz: attr.typical_pkt_sz,
                reserved: 0,
            },
        };
        ctx.kernel().modify_qp(self.inner.handle, &cmd).map_err(|e| {
            log::debug!("rmlx5: rate limit modify failed: {}", e);
            e
        })?;
        Ok(())
    }

    /// Query the QP. Send capabilities come from the local layout.
    pub fn query(&self, mask: QpAttrMask) -> Result<QpQuery> {
        let inner = &self.inner;
        if inner.flavor == QpFlavor::Rss {
            return Err(Error::NotImplemented("query of RSS QPs"));
        }
        let resp = inner.context().kernel().query_qp(inner.handle, mask)?;
        let state = QpState::try_from(resp.state).unwrap_or_else(|_| self.state());
        Ok(QpQuery {
            state,
            cap: QpCaps {
                max_send_wr: inner.layout.sq.max_post,
                max_recv_wr: resp.max_recv_wr,
                max_send_sge: inner.layout.sq.max_gs,
                max_recv_sge: resp.max_recv_sge,
                max_inline_data: inner.layout.max_inline_data,
            },
        })
    }

    /// Join a multicast group.
    pub fn attach_mcast(&self, gid: &Gid, lid: u16) -> Result<()> {
        let cmd = Mcast {
            qp_handle: self.inner.handle,
            gid: *gid,
            lid,
        };
        Ok(self.inner.context().kernel().attach_mcast(&cmd)?)
    }

    /// Leave a multicast group.
    pub fn detach_mcast(&self, gid: &Gid, lid: u16) -> Result<()> {
        let cmd = Mcast {
            qp_handle: self.inner.handle,
            gid: *gid,
            lid,
        };
        Ok(self.inner.context().kernel().detach_mcast(&cmd)?)
    }

    fn destroy_impl(&mut self) -> Result<()> {
        let inner = &*self.inner;
        let ctx = inner.context();
        if inner.flavor == QpFlavor::Rss {
            ctx.kernel().destroy_qp(inner.handle).map_err(|e| {
                log::debug!("rmlx5: destroy_qp failed: {}", e);
                e
            })?;
            self.live = false;
            return Ok(());
        }

        let table = (!ctx.caps().uses_uidx()).then(|| ctx.qp_table());
        ctx.kernel().destroy_qp(inner.handle).map_err(|e| {
            log::debug!("rmlx5: destroy_qp failed: {}", e);
            e
        })?;
        inner.clean_cqs();
        if let Some(mut table) = table {
            if inner.registered.swap(false, Ordering::AcqRel) {
                table.clear(inner.qpn());
            }
        }
        if let Some(uidx) = inner.uidx {
            ctx.clear_uidx(uidx);
        }
        self.live = false;
        Ok(())
    }

    /// Destroy the QP.
    pub fn destroy(mut self) -> Result<(), DestroyError<Qp>> {
        match self.destroy_impl() {
            Ok(()) => Ok(()),
            Err(e) => Err(DestroyError::new(self, e)),
        }
    }
}

impl Drop for Qp {
    fn drop(&mut self) {
        if self.live {
            if let Err(e) = self.destroy_impl() {
                log::error!("rmlx5: cannot destroy QP {} on drop: {}", self.inner.qpn(), e);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;
    use crate::kernel::Op;
    use crate::rdma::caps::DeviceCaps;
    use crate::rdma::context::tests::{legacy_caps, test_context, test_context_with};
    use crate::rdma::cq::{opcode, Cq, CqeInfo};
    use crate::rdma::pd::{ParentDomainInitAttr, Pd};
    use crate::rdma::srq::{Srq, SrqInitAttr};
    use crate::rdma::table::RscType;
    use crate::rdma::td::Td;

    fn rc_builder<'a>(cq: &'a Cq) -> QpBuilder<'a> {
        QpBuilder::new()
            .qp_type(QpType::Rc)
            .send_cq(cq)
            .recv_cq(cq)
            .caps(QpCaps::new(16, 16, 2, 2, 0))
    }

    fn cqe(opcode: u8, qpn: u32) -> CqeInfo {
        CqeInfo {
            opcode,
            qpn,
            srqn_uidx: qpn,
            wqe_counter: 0,
        }
    }

    #[test]
    fn test_legacy_registration_and_scavenge() -> anyhow::Result<()> {
        let (ctx, kernel) = test_context_with(legacy_caps(), Config::default());
        let pd = Pd::new(&ctx)?;
        let cq = Cq::new(&ctx, 64)?;
        let qp1 = rc_builder(&cq).build(&pd)?;
        let qp2 = rc_builder(&cq).build(&pd)?;
        assert!(qp1.uidx().is_none());
        assert_eq!(qp1.rsn(), qp1.qpn());
        assert_eq!(
            ctx.lookup_qp(qp1.qpn()).and_then(|r| r.rsn()),
            Some(qp1.qpn())
        );

        for (op, qpn) in [
            (opcode::REQ, qp1.qpn()),
            (opcode::REQ, qp2.qpn()),
            (opcode::RESP_SEND, qp1.qpn()),
            (opcode::REQ, qp2.qpn()),
        ] {
            kernel.post_cqe(cq.handle(), cqe(op, qpn))?;
        }

        let qpn1 = qp1.qpn();
        qp1.destroy().unwrap();
        let left: Vec<u32> = cq.pending().iter().map(|c| c.qpn).collect();
        assert_eq!(left, vec![qp2.qpn(), qp2.qpn()]);
        assert!(ctx.lookup_qp(qpn1).is_none());
        assert_eq!(pd.users(), 1);
        Ok(())
    }

    #[test]
    fn test_uidx_registration() -> anyhow::Result<()> {
        let (ctx, _kernel) = test_context();
        let pd = Pd::new(&ctx)?;
        let cq = Cq::new(&ctx, 16)?;
        let qp = rc_builder(&cq).build(&pd)?;
        let uidx = qp.uidx().unwrap();
        assert_eq!(qp.rsn(), uidx);
        let entry = ctx.lookup_uidx(uidx).unwrap();
        assert_eq!(entry.kind(), RscType::Qp);
        assert_eq!(entry.rsn(), Some(uidx));
        assert!(ctx.lookup_qp(qp.qpn()).is_none());

        qp.destroy().unwrap();
        assert!(ctx.lookup_uidx(uidx).is_none());
        Ok(())
    }

    #[test]
    fn test_separate_cqs_are_both_cleaned() -> anyhow::Result<()> {
        let (ctx, kernel) = test_context_with(legacy_caps(), Config::default());
        let pd = Pd::new(&ctx)?;
        let scq = Cq::new(&ctx, 16)?;
        let rcq = Cq::new(&ctx, 16)?;
        let qp = QpBuilder::new()
            .qp_type(QpType::Rc)
            .send_cq(&scq)
            .recv_cq(&rcq)
            .caps(QpCaps::new(8, 8, 1, 1, 0))
            .build(&pd)?;
        kernel.post_cqe(scq.handle(), cqe(opcode::REQ, qp.qpn()))?;
        kernel.post_cqe(rcq.handle(), cqe(opcode::RESP_SEND, qp.qpn()))?;
        kernel.post_cqe(rcq.handle(), cqe(opcode::RESP_SEND, qp.qpn() + 100))?;

        let attr = QpAttr {
            qp_state: QpState::Init,
            ..Default::default()
        };
        qp.modify(&attr, QpAttrMask::STATE)?;
        let reset = QpAttr {
            qp_state: QpState::Reset,
            ..Default::default()
        };
        qp.modify(&reset, QpAttrMask::STATE)?;
        assert!(scq.pending().is_empty());
        assert_eq!(rcq.pending().len(), 1);
        assert_eq!(qp.state(), QpState::Reset);
        assert_eq!((qp.rcv_db(), qp.snd_db()), (Some(0), Some(0)));
        Ok(())
    }

    #[test]
    fn test_reversed_cq_pairs_destroy_concurrently() -> anyhow::Result<()> {
        let (ctx, kernel) = test_context();
        assert!(ctx.caps().uses_uidx());
        let pd = Pd::new(&ctx)?;
        let cq_a = Cq::new(&ctx, 256)?;
        let cq_b = Cq::new(&ctx, 256)?;
        let pair = |send: &Cq, recv: &Cq| {
            QpBuilder::new()
                .qp_type(QpType::Rc)
                .send_cq(send)
                .recv_cq(recv)
                .caps(QpCaps::new(8, 8, 1, 1, 0))
                .build(&pd)
        };
        let tagged = |opcode: u8, qp: &Qp| CqeInfo {
            opcode,
            qpn: qp.qpn(),
            srqn_uidx: qp.uidx().unwrap_or(u32::MAX),
            wqe_counter: 0,
        };
        let survivor = pair(&cq_a, &cq_b)?;

        for round in 1..=16 {
            let ab = pair(&cq_a, &cq_b)?;
            let ba = pair(&cq_b, &cq_a)?;
            kernel.post_cqe(cq_a.handle(), tagged(opcode::REQ, &survivor))?;
            kernel.post_cqe(cq_b.handle(), tagged(opcode::RESP_SEND, &survivor))?;
            for (qp, send, recv) in [(&ab, &cq_a, &cq_b), (&ba, &cq_b, &cq_a)] {
                kernel.post_cqe(send.handle(), tagged(opcode::REQ, qp))?;
                kernel.post_cqe(recv.handle(), tagged(opcode::RESP_SEND, qp))?;
            }

            std::thread::scope(|s| {
                s.spawn(move || ab.destroy().unwrap());
                s.spawn(move || ba.destroy().unwrap());
            });

            let uidx = survivor.uidx();
            for cq in [&cq_a, &cq_b] {
                let left = cq.pending();
                assert_eq!(left.len(), round);
                assert!(left.iter().all(|c| Some(c.srqn_uidx) == uidx));
            }
        }
        Ok(())
    }

    #[test]
    fn test_create_failure_unwinds() {
        let (ctx, kernel) = test_context();
        let pd = Pd::new(&ctx).unwrap();
        let cq = Cq::new(&ctx, 16).unwrap();
        let pages = ctx.dbrec_pages();
        kernel.fail_next(Op::CreateQp, libc::ENOMEM);
        let err = rc_builder(&cq).build(&pd).unwrap_err();
        assert_eq!(err.errno(), libc::ENOMEM);
        assert_eq!(pd.users(), 0);
        assert_eq!(ctx.dbrec_pages(), pages);

        let qp = rc_builder(&cq).build(&pd).unwrap();
        assert_eq!(pd.users(), 1);
        assert!(ctx.lookup_uidx(qp.uidx().unwrap()).is_some());
    }

    #[test]
    fn test_builder_validation() {
        let (ctx, _kernel) = test_context();
        let pd = Pd::new(&ctx).unwrap();
        let cq = Cq::new(&ctx, 16).unwrap();
        assert!(QpBuilder::new().send_cq(&cq).build(&pd).is_err());
        assert!(rc_builder(&cq).source_qpn(5).build(&pd).is_err());
        assert!(rc_builder(&cq).max_tso_header(64).build(&pd).is_err());
        assert!(rc_builder(&cq).dc(DcType::Dci, 0).build(&pd).is_err());
        assert!(QpBuilder::new().qp_type(QpType::Driver).build(&pd).is_err());

        let (other, _k) = test_context();
        let foreign = Cq::new(&other, 16).unwrap();
        assert!(rc_builder(&foreign).build(&pd).is_err());
    }

    #[test]
    fn test_static_and_thread_domain_registers() -> anyhow::Result<()> {
        let (ctx, kernel) = test_context();
        let pd = Pd::new(&ctx)?;
        let cq = Cq::new(&ctx, 16)?;
        let qp = rc_builder(&cq).build(&pd)?;
        let cmd = kernel.last_create_qp().unwrap();
        assert_eq!(cmd.drv.flags & MLX5_QP_FLAG_BFREG_INDEX, 0);
        assert!(qp.bf().is_some());

        let td = Td::new(&ctx, 0)?;
        let parent = Pd::new_parent(
            &ctx,
            ParentDomainInitAttr {
                pd: &pd,
                td: Some(&td),
                comp_mask: 0,
                allocator: None,
            },
        )?;
        let qp = rc_builder(&cq).build(&parent)?;
        let cmd = kernel.last_create_qp().unwrap();
        assert_ne!(cmd.drv.flags & MLX5_QP_FLAG_BFREG_INDEX, 0);
        assert_eq!(Some(cmd.drv.bfreg_index), td.bf().dyn_index());
        assert!(Arc::ptr_eq(qp.bf().unwrap(), td.bf()));
        assert_eq!(parent.users(), 1);
        Ok(())
    }

    #[test]
    fn test_dct_registers_at_rtr() -> anyhow::Result<()> {
        let (ctx, kernel) = test_context_with(legacy_caps(), Config::default());
        let pd = Pd::new(&ctx)?;
        let cq = Cq::new(&ctx, 16)?;
        let srq = Srq::new(&pd, &SrqInitAttr { max_wr: 16, max_sge: 1, srq_limit: 0 })?;
        let dct = QpBuilder::new()
            .qp_type(QpType::Driver)
            .dc(DcType::Dct, 0xdead_beef)
            .send_cq(&cq)
            .recv_cq(&cq)
            .srq(&srq)
            .build(&pd)?;
        assert_eq!(dct.qpn(), 0);
        let cmd = kernel.last_create_qp().unwrap();
        assert_ne!(cmd.drv.flags & MLX5_QP_FLAG_TYPE_DCT, 0);
        assert_eq!(cmd.drv.sq_buf_addr_or_access_key, 0xdead_beef);

        let init = QpAttr {
            qp_state: QpState::Init,
            port_num: 1,
            ..Default::default()
        };
        dct.modify(&init, QpAttrMask::STATE | QpAttrMask::PORT)?;
        let rtr = QpAttr {
            qp_state: QpState::Rtr,
            ..Default::default()
        };
        dct.modify(&rtr, QpAttrMask::STATE)?;
        assert_ne!(dct.qpn(), 0);
        assert!(kernel.last_modify_qp().unwrap().ex);
        assert_eq!(ctx.lookup_qp(dct.qpn()).and_then(|r| r.rsn()), Some(dct.qpn()));

        let qpn = dct.qpn();
        dct.destroy().unwrap();
        assert!(ctx.lookup_qp(qpn).is_none());
        Ok(())
    }

    #[test]
    fn test_dct_short_response() -> anyhow::Result<()> {
        let (ctx, kernel) = test_context();
        kernel.set_dct_resp_len(4);
        let pd = Pd::new(&ctx)?;
        let cq = Cq::new(&ctx, 16)?;
        let srq = Srq::new(&pd, &SrqInitAttr { max_wr: 16, max_sge: 1, srq_limit: 0 })?;
        let dct = QpBuilder::new()
            .qp_type(QpType::Driver)
            .dc(DcType::Dct, 1)
            .recv_cq(&cq)
            .srq(&srq)
            .build(&pd)?;
        dct.modify(&QpAttr { qp_state: QpState::Init, ..Default::default() }, QpAttrMask::STATE)?;
        let err = dct
            .modify(&QpAttr { qp_state: QpState::Rtr, ..Default::default() }, QpAttrMask::STATE)
            .unwrap_err();
        assert_eq!(err.errno(), libc::EINVAL);
        Ok(())
    }

    #[test]
    fn test_srq_slots_return_on_destroy() -> anyhow::Result<()> {
        let (ctx, kernel) = test_context_with(legacy_caps(), Config::default());
        let pd = Pd::new(&ctx)?;
        let cq = Cq::new(&ctx, 16)?;
        let srq = Srq::new(&pd, &SrqInitAttr { max_wr: 8, max_sge: 1, srq_limit: 0 })?;
        let qp = rc_builder(&cq).srq(&srq).build(&pd)?;
        assert_eq!(qp.layout().rq.wqe_cnt, 0);

        let slot = srq.inner().take_wqe().unwrap();
        let before = srq.free_slots();
        kernel.post_cqe(
            cq.handle(),
            CqeInfo {
                opcode: opcode::RESP_SEND,
                qpn: qp.qpn(),
                srqn_uidx: srq.srq_num(),
                wqe_counter: slot,
            },
        )?;
        qp.destroy().unwrap();
        assert_eq!(srq.free_slots(), before + 1);
        assert_eq!(srq.inner().free_list_tail(), slot);
        Ok(())
    }

    #[test]
    fn test_raw_packet_offloads() -> anyhow::Result<()> {
        let caps = DeviceCaps {
            link_layers: vec![LinkLayer::Ethernet],
            device_cap_flags: DeviceCapFlags::RAW_IP_CSUM,
            tso_caps: TsoCaps {
                max_tso: 1 << 16,
                supported_qpts: 1 << QpType::RawPacket as u32,
            },
            ..Default::default()
        };
        let (ctx, kernel) = test_context_with(caps, Config::default());
        let pd = Pd::new(&ctx)?;
        let cq = Cq::new(&ctx, 16)?;
        let qp = QpBuilder::new()
            .qp_type(QpType::RawPacket)
            .send_cq(&cq)
            .recv_cq(&cq)
            .caps(QpCaps::new(8, 8, 1, 1, 0))
            .max_tso_header(128)
            .build(&pd)?;
        assert!(qp.layout().is_split());
        assert!(qp.sq_buf_addr().is_some());
        let cmd = kernel.last_create_qp().unwrap();
        assert_eq!(cmd.max_tso_header, 128);

        let init = QpAttr {
            qp_state: QpState::Init,
            port_num: 1,
            ..Default::default()
        };
        qp.modify(&init, QpAttrMask::STATE | QpAttrMask::PORT)?;
        assert!(qp.csum_caps().contains(QpCapCache::CSUM_RAW_OVER_ETH));
        assert_eq!(qp.max_tso(), 1 << 16);

        qp.modify(&QpAttr { qp_state: QpState::Rtr, ..Default::default() }, QpAttrMask::STATE)?;
        assert_eq!(qp.rcv_db(), Some(0));
        Ok(())
    }

    #[test]
    fn test_underlay_accepts_state_only() -> anyhow::Result<()> {
        let caps = DeviceCaps {
            device_cap_flags: DeviceCapFlags::UD_IP_CSUM,
            ..Default::default()
        };
        let (ctx, _kernel) = test_context_with(caps, Config::default());
        let pd = Pd::new(&ctx)?;
        let cq = Cq::new(&ctx, 16)?;
        let qp = QpBuilder::new()
            .qp_type(QpType::Ud)
            .send_cq(&cq)
            .recv_cq(&cq)
            .caps(QpCaps::new(8, 8, 1, 1, 0))
            .source_qpn(0x1234)
            .build(&pd)?;
        assert!(qp.flavor().is_underlay());
        let init = QpAttr {
            qp_state: QpState::Init,
            port_num: 1,
            ..Default::default()
        };
        assert!(qp.modify(&init, QpAttrMask::STATE | QpAttrMask::PORT).is_err());
        qp.modify(&init, QpAttrMask::STATE)?;
        assert!(qp.csum_caps().contains(QpCapCache::CSUM_UNDERLAY_UD));
        Ok(())
    }

    #[test]
    fn test_rate_limit_validation() -> anyhow::Result<()> {
        let (ctx, kernel) = test_context();
        let pd = Pd::new(&ctx)?;
        let cq = Cq::new(&ctx, 16)?;
        let qp = rc_builder(&cq).build(&pd)?;
        let burst = RateLimitAttr {
            rate_limit: 1000,
            max_burst_sz: 4096,
            typical_pkt_sz: 1024,
            comp_mask: 0,
        };
        assert!(qp.modify_rate_limit(&burst).is_err());
        assert!(qp
            .modify_rate_limit(&RateLimitAttr { comp_mask: 1, ..Default::default() })
            .is_err());
        qp.modify_rate_limit(&RateLimitAttr { rate_limit: 1000, ..Default::default() })?;
        let cmd = kernel.last_modify_qp().unwrap();
        assert!(cmd.ex);
        assert_eq!(cmd.mask, QpAttrMask::RATE_LIMIT);
        assert_eq!(cmd.attr.rate_limit, 1000);
        Ok(())
    }

    #[test]
    fn test_query_reports_local_send_caps() -> anyhow::Result<()> {
        let (ctx, _kernel) = test_context();
        let pd = Pd::new(&ctx)?;
        let cq = Cq::new(&ctx, 16)?;
        let qp = rc_builder(&cq).build(&pd)?;
        let q = qp.query(QpAttrMask::STATE)?;
        assert_eq!(q.state, QpState::Reset);
        assert_eq!(q.cap.max_send_wr, qp.layout().sq.max_post);
        assert!(q.cap.max_send_wr >= 16);
        assert_eq!(q.cap.max_recv_wr, 16);

        let gid = Gid::from([0xff; 16]);
        qp.attach_mcast(&gid, 0xc001)?;
        qp.detach_mcast(&gid, 0xc001)?;
        Ok(())
    }
}
