//! An in-process kernel for running without an adapter.
//!
//! [`LoopbackKernel`] hands out handles and object numbers, keeps the
//! use counts the real driver keeps (so destroying a referenced object
//! fails with `EBUSY`), validates QP and WQ state transitions, and plays
//! the adapter's part on completion queues: it remembers each ring and can
//! write entries into it with [`LoopbackKernel::post_cqe`].

use std::collections::{HashMap, HashSet};
use std::sync::Mutex;

use super::{KResult, Kernel, KernelError};
use crate::abi::*;
use crate::rdma::cq::{opcode, Cqe64, CqeInfo, CQE64_SIZE};
use crate::rdma::gid::Gid;
use crate::rdma::qp::{QpAttrMask, QpState};
use crate::rdma::wq::{WqAttrMask, WqState};
use crate::utils::lock;

/// Kernel command kinds, for fault injection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Op {
    QueryDevice,
    QueryDeviceEx,
    QueryPort,
    QueryGidType,
    AllocPd,
    DeallocPd,
    RegMr,
    ReregMr,
    DeregMr,
    AllocMw,
    DeallocMw,
    CreateCq,
    ResizeCq,
    ModifyCq,
    DestroyCq,
    CreateSrq,
    ModifySrq,
    QuerySrq,
    DestroySrq,
    CreateQp,
    CreateRssQp,
    ModifyQp,
    QueryQp,
    DestroyQp,
    AttachMcast,
    DetachMcast,
    CreateAh,
    DestroyAh,
    OpenXrcd,
    CloseXrcd,
    CreateWq,
    ModifyWq,
    DestroyWq,
    CreateRwqIndTable,
    DestroyRwqIndTable,
    CreateFlow,
    DestroyFlow,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Kind {
    Pd,
    Mr,
    Mw,
    Cq,
    Srq,
    Qp,
    Ah,
    Xrcd,
    Wq,
    IndTable,
    Flow,
}

#[derive(Debug, Clone, Copy)]
struct CqRecord {
    buf_addr: u64,
    ncqe: u32,
    cqe_size: u32,
    /// Producer index.
    pi: u32,
}

#[derive(Debug, Clone, Copy)]
struct QpRecord {
    state: QpState,
    dct: bool,
    caps: QueryQpResp,
}

#[derive(Debug)]
struct Object {
    kind: Kind,
    /// Objects this one holds a use count on.
    deps: Vec<Handle>,
    /// Objects holding a use count on this one.
    users: u32,
    number: u32,
    cq: Option<CqRecord>,
    qp: Option<QpRecord>,
    srq: Option<SrqAttr>,
    wq_state: Option<WqState>,
}

impl Object {
    fn new(kind: Kind, number: u32) -> Self {
        Self {
            kind,
            deps: Vec::new(),
            users: 0,
            number,
            cq: None,
            qp: None,
            srq: None,
            wq_state: None,
        }
    }
}

/// The most recent command of each creating kind, for inspection.
#[derive(Debug, Default, Clone)]
struct LastCommands {
    create_cq: Option<CreateCq>,
    create_srq: Option<CreateSrq>,
    create_qp: Option<CreateQp>,
    create_rss_qp: Option<CreateRssQp>,
    modify_qp: Option<ModifyQp>,
    create_wq: Option<CreateWq>,
    ind_table: Option<(u32, Vec<u32>)>,
    create_flow: Option<CreateFlow>,
    create_ah: Option<CreateAh>,
}

#[derive(Debug)]
struct State {
    next_handle: Handle,
    next_number: u32,
    next_bfreg: u32,
    objects: HashMap<Handle, Object>,
    mcast: HashSet<(Handle, [u8; 16], u16)>,
    faults: HashMap<Op, i32>,
    last: LastCommands,

    device: DeviceAttr,
    device_ex: QueryDeviceExResp,
    ports: Vec<PortAttr>,
    gid_type: u32,
    dct_resp_len: u32,
}

/// Static registers handed out round robin, register 0 excluded.
const STATIC_BFREGS: u32 = 32;

/// `rereg_mr` flag: the MR moves to another PD.
const REREG_MR_CHANGE_PD: u32 = 1 << 1;

/// In-process [`Kernel`] implementation.
#[derive(Debug)]
pub struct LoopbackKernel {
    state: Mutex<State>,
}

impl Default for LoopbackKernel {
    fn default() -> Self {
        Self::new()
    }
}

fn errno<T>(e: i32) -> KResult<T> {
    Err(KernelError(e))
}

/// State transitions the driver accepts.
fn transition_allowed(from: QpState, to: QpState) -> bool {
    use QpState::*;
    matches!(
        (from, to),
        (_, Reset)
            | (_, Error)
            | (Reset, Init)
            | (Init, Init)
            | (Init, Rtr)
            | (Rtr, Rts)
            | (Rts, Rts)
            | (Rts, Sqd)
            | (Sqd, Rts)
            | (Sqd, Sqd)
            | (Sqe, Rts)
    )
}

impl State {
    fn take_fault(&mut self, op: Op) -> KResult<()> {
        match self.faults.remove(&op) {
            Some(e) => errno(e),
            None => Ok(()),
        }
    }

    fn number(&mut self) -> u32 {
        let n = self.next_number;
        self.next_number += 1;
        n
    }

    fn check(&self, h: Handle, kind: Kind) -> KResult<&Object> {
        match self.objects.get(&h) {
            Some(o) if o.kind == kind => Ok(o),
            _ => errno(libc::EINVAL),
        }
    }

    fn check_mut(&mut self, h: Handle, kind: Kind) -> KResult<&mut Object> {
        match self.objects.get_mut(&h) {
            Some(o) if o.kind == kind => Ok(o),
            _ => errno(libc::EINVAL),
        }
    }

    fn insert(&mut self, mut obj: Object, deps: Vec<Handle>) -> Handle {
        for d in &deps {
            if let Some(o) = self.objects.get_mut(d) {
                o.users += 1;
            }
        }
        obj.deps = deps;
        let h = self.next_handle;
        self.next_handle += 1;
        self.objects.insert(h, obj);
        h
    }

    fn remove(&mut self, h: Handle, kind: Kind) -> KResult<Object> {
        let obj = self.check(h, kind)?;
        if obj.users > 0 {
            return errno(libc::EBUSY);
        }
        let obj = self.objects.remove(&h).ok_or(KernelError(libc::EINVAL))?;
        for d in &obj.deps {
            if let Some(o) = self.objects.get_mut(d) {
                o.users -= 1;
            }
        }
        Ok(obj)
    }
}

impl LoopbackKernel {
    pub fn new() -> Self {
        let device = DeviceAttr {
            raw_fw_ver: (16 << 32) | (28 << 16) | 1002,
            vendor_id: 0x02c9,
            vendor_part_id: 4115,
            max_qp: 1 << 18,
            max_qp_wr: 1 << 15,
            max_sge: 30,
            max_cq: 1 << 24,
            max_cqe: (1 << 22) - 1,
            max_pd: 1 << 24,
            max_srq: 1 << 23,
            max_srq_wr: 1 << 15,
            max_srq_sge: 31,
            atomic_cap: 1,
            phys_port_cnt: 1,
            ..Default::default()
        };
        let port = PortAttr {
            state: 4,
            max_mtu: 5,
            active_mtu: 5,
            gid_tbl_len: 256,
            lid: 1,
            sm_lid: 1,
            link_layer: 1,
            reserved: [0; 3],
        };
        Self {
            state: Mutex::new(State {
                next_handle: 1,
                next_number: 0x40,
                next_bfreg: 0,
                objects: HashMap::new(),
                mcast: HashSet::new(),
                faults: HashMap::new(),
                last: LastCommands::default(),
                device,
                device_ex: QueryDeviceExResp {
                    base: device,
                    drv: Mlx5QueryDeviceExResp::default(),
                },
                ports: vec![port],
                gid_type: 0,
                dct_resp_len: 8,
            }),
        }
    }

    /// Make the next command of kind `op` fail with `errno`.
    pub fn fail_next(&self, op: Op, errno: i32) {
        lock(&self.state).faults.insert(op, errno);
    }

    /// Answer extended device queries with `resp`.
    pub fn set_device_ex(&self, resp: QueryDeviceExResp) {
        lock(&self.state).device_ex = resp;
    }

    /// Replace the port table.
    pub fn set_ports(&self, ports: Vec<PortAttr>) {
        lock(&self.state).ports = ports;
    }

    /// GID type reported for every index, 2 meaning RoCE v2.
    pub fn set_gid_type(&self, gid_type: u32) {
        lock(&self.state).gid_type = gid_type;
    }

    /// Response length reported by the extended modify of a DCT.
    pub fn set_dct_resp_len(&self, len: u32) {
        lock(&self.state).dct_resp_len = len;
    }

    /// Number of live kernel objects.
    pub fn live_objects(&self) -> usize {
        lock(&self.state).objects.len()
    }

    /// Use count of an object, `None` if it does not exist.
    pub fn users(&self, h: Handle) -> Option<u32> {
        lock(&self.state).objects.get(&h).map(|o| o.users)
    }

    /// Current state of a QP.
    pub fn qp_state(&self, h: Handle) -> Option<QpState> {
        lock(&self.state).objects.get(&h)?.qp.map(|q| q.state)
    }

    /// Current state of a WQ.
    pub fn wq_state(&self, h: Handle) -> Option<WqState> {
        lock(&self.state).objects.get(&h)?.wq_state
    }

    /// Producer index of a CQ ring.
    pub fn cq_producer_index(&self, h: Handle) -> Option<u32> {
        lock(&self.state).objects.get(&h)?.cq.map(|c| c.pi)
    }

    pub fn last_create_cq(&self) -> Option<CreateCq> {
        lock(&self.state).last.create_cq
    }

    pub fn last_create_srq(&self) -> Option<CreateSrq> {
        lock(&self.state).last.create_srq
    }

    pub fn last_create_qp(&self) -> Option<CreateQp> {
        lock(&self.state).last.create_qp
    }

    pub fn last_create_rss_qp(&self) -> Option<CreateRssQp> {
        lock(&self.state).last.create_rss_qp
    }

    pub fn last_modify_qp(&self) -> Option<ModifyQp> {
        lock(&self.state).last.modify_qp
    }

    pub fn last_create_wq(&self) -> Option<CreateWq> {
        lock(&self.state).last.create_wq
    }

    pub fn last_ind_table(&self) -> Option<(u32, Vec<u32>)> {
        lock(&self.state).last.ind_table.clone()
    }

    pub fn last_create_flow(&self) -> Option<CreateFlow> {
        lock(&self.state).last.create_flow.clone()
    }

    pub fn last_create_ah(&self) -> Option<CreateAh> {
        lock(&self.state).last.create_ah
    }

    /// Write a completion into a CQ ring as the adapter would, at the
    /// producer index and with the owner bit of the current pass.
    pub fn post_cqe(&self, cq: Handle, cqe: CqeInfo) -> KResult<()> {
        let mut state = lock(&self.state);
        let obj = state.check_mut(cq, Kind::Cq)?;
        let ring = obj.cq.as_mut().ok_or(KernelError(libc::EINVAL))?;
        write_cqe(ring, ring.pi, &cqe);
        ring.pi = ring.pi.wrapping_add(1);
        Ok(())
    }
}

fn write_cqe(ring: &CqRecord, n: u32, cqe: &CqeInfo) {
    let part = if ring.cqe_size == 128 { CQE64_SIZE } else { 0 };
    let offset = (n & (ring.ncqe - 1)) as usize * ring.cqe_size as usize + part;
    let ptr = (ring.buf_addr as usize + offset) as *mut u8;
    // SAFETY: the ring was registered by create or resize and stays mapped
    // until the CQ is destroyed, which removes this record.
    let entry = unsafe { Cqe64::new(ptr) };
    entry.fill(
        cqe.opcode,
        n & ring.ncqe != 0,
        cqe.qpn,
        cqe.srqn_uidx,
        cqe.wqe_counter,
    );
}

impl Kernel for LoopbackKernel {
    fn query_device(&self) -> KResult<DeviceAttr> {
        let mut state = lock(&self.state);
        state.take_fault(Op::QueryDevice)?;
        Ok(state.device)
    }

    fn query_device_ex(&self, vendor: bool) -> KResult<QueryDeviceExResp> {
        let mut state = lock(&self.state);
        state.take_fault(Op::QueryDeviceEx)?;
        let mut resp = state.device_ex;
        if !vendor {
            resp.drv = Mlx5QueryDeviceExResp::default();
        }
        Ok(resp)
    }

    fn query_port(&self, port: u8) -> KResult<PortAttr> {
        let mut state = lock(&self.state);
        state.take_fault(Op::QueryPort)?;
        let idx = (port as usize).checked_sub(1).ok_or(KernelError(libc::EINVAL))?;
        state.ports.get(idx).copied().ok_or(KernelError(libc::EINVAL))
    }

    fn query_gid_type(&self, port: u8, _index: u32) -> KResult<u32> {
        let mut state = lock(&self.state);
        state.take_fault(Op::QueryGidType)?;
        if port == 0 || port as usize > state.ports.len() {
            return errno(libc::EINVAL);
        }
        Ok(state.gid_type)
    }

    fn alloc_pd(&self) -> KResult<AllocPdResp> {
        let mut state = lock(&self.state);
        state.take_fault(Op::AllocPd)?;
        let pdn = state.number();
        let handle = state.insert(Object::new(Kind::Pd, pdn), Vec::new());
        Ok(AllocPdResp { handle, pdn })
    }

    fn dealloc_pd(&self, pd: Handle) -> KResult<()> {
        let mut state = lock(&self.state);
        state.take_fault(Op::DeallocPd)?;
        state.remove(pd, Kind::Pd).map(drop)
    }

    fn reg_mr(&self, cmd: &RegMr) -> KResult<RegMrResp> {
        let mut state = lock(&self.state);
        state.take_fault(Op::RegMr)?;
        state.check(cmd.pd_handle, Kind::Pd)?;
        if cmd.length == 0 {
            return errno(libc::EINVAL);
        }
        let key = state.number();
        let handle = state.insert(Object::new(Kind::Mr, key), vec![cmd.pd_handle]);
        Ok(RegMrResp {
            handle,
            lkey: key,
            rkey: key,
            reserved: 0,
        })
    }

    fn rereg_mr(&self, cmd: &RereMr) -> KResult<RegMrResp> {
        let mut state = lock(&self.state);
        state.take_fault(Op::ReregMr)?;
        let old_pd = *state
            .check(cmd.mr_handle, Kind::Mr)?
            .deps
            .first()
            .ok_or(KernelError(libc::EINVAL))?;
        if cmd.flags & REREG_MR_CHANGE_PD != 0 && cmd.pd_handle != old_pd {
            state.check(cmd.pd_handle, Kind::Pd)?;
            if let Some(o) = state.objects.get_mut(&old_pd) {
                o.users -= 1;
            }
            if let Some(o) = state.objects.get_mut(&cmd.pd_handle) {
                o.users += 1;
            }
        }
        let key = state.number();
        let mr = state.check_mut(cmd.mr_handle, Kind::Mr)?;
        if cmd.flags & REREG_MR_CHANGE_PD != 0 {
            mr.deps = vec![cmd.pd_handle];
        }
        mr.number = key;
        Ok(RegMrResp {
            handle: cmd.mr_handle,
            lkey: key,
            rkey: key,
            reserved: 0,
        })
    }

    fn dereg_mr(&self, mr: Handle) -> KResult<()> {
        let mut state = lock(&self.state);
        state.take_fault(Op::DeregMr)?;
        state.remove(mr, Kind::Mr).map(drop)
    }

    fn alloc_mw(&self, pd: Handle, mw_type: u32) -> KResult<AllocMwResp> {
        let mut state = lock(&self.state);
        state.take_fault(Op::AllocMw)?;
        state.check(pd, Kind::Pd)?;
        if mw_type != 1 && mw_type != 2 {
            return errno(libc::EINVAL);
        }
        let rkey = state.number();
        let handle = state.insert(Object::new(Kind::Mw, rkey), vec![pd]);
        Ok(AllocMwResp { handle, rkey })
    }

    fn dealloc_mw(&self, mw: Handle) -> KResult<()> {
        let mut state = lock(&self.state);
        state.take_fault(Op::DeallocMw)?;
        state.remove(mw, Kind::Mw).map(drop)
    }

    fn create_cq(&self, cmd: &CreateCq) -> KResult<CreateCqResp> {
        let mut state = lock(&self.state);
        state.take_fault(Op::CreateCq)?;
        state.last.create_cq = Some(*cmd);
        let ncqe = cmd.cqe + 1;
        if !ncqe.is_power_of_two() || cmd.drv.buf_addr == 0 || cmd.drv.db_addr == 0 {
            return errno(libc::EINVAL);
        }
        if cmd.drv.cqe_size != 64 && cmd.drv.cqe_size != 128 {
            return errno(libc::EINVAL);
        }
        let cqn = state.number();
        let mut obj = Object::new(Kind::Cq, cqn);
        obj.cq = Some(CqRecord {
            buf_addr: cmd.drv.buf_addr,
            ncqe,
            cqe_size: cmd.drv.cqe_size,
            pi: 0,
        });
        let handle = state.insert(obj, Vec::new());
        Ok(CreateCqResp {
            handle,
            cqe: cmd.cqe,
            cqn,
            reserved: 0,
        })
    }

    fn resize_cq(&self, cq: Handle, cmd: &ResizeCq) -> KResult<u32> {
        let mut state = lock(&self.state);
        state.take_fault(Op::ResizeCq)?;
        let obj = state.check_mut(cq, Kind::Cq)?;
        let ring = obj.cq.as_mut().ok_or(KernelError(libc::EINVAL))?;
        let ncqe = cmd.cqe + 1;
        if !ncqe.is_power_of_two() || cmd.drv.buf_addr == 0 {
            return errno(libc::EINVAL);
        }

        let marker = CqeInfo {
            opcode: opcode::RESIZE_CQ,
            qpn: 0,
            srqn_uidx: 0,
            wqe_counter: 0,
        };
        write_cqe(ring, ring.pi, &marker);
        ring.pi = ring.pi.wrapping_add(1);
        ring.buf_addr = cmd.drv.buf_addr;
        ring.ncqe = ncqe;
        Ok(cmd.cqe)
    }

    fn modify_cq(&self, cq: Handle, _cmd: &ModifyCq) -> KResult<()> {
        let mut state = lock(&self.state);
        state.take_fault(Op::ModifyCq)?;
        state.check(cq, Kind::Cq).map(drop)
    }

    fn destroy_cq(&self, cq: Handle) -> KResult<()> {
        let mut state = lock(&self.state);
        state.take_fault(Op::DestroyCq)?;
        state.remove(cq, Kind::Cq).map(drop)
    }

    fn create_srq(&self, cmd: &CreateSrq) -> KResult<CreateSrqResp> {
        let mut state = lock(&self.state);
        state.take_fault(Op::CreateSrq)?;
        state.last.create_srq = Some(*cmd);
        state.check(cmd.pd_handle, Kind::Pd)?;
        let mut deps = vec![cmd.pd_handle];
        match cmd.srq_type {
            SRQT_BASIC => {}
            SRQT_XRC => {
                let xrcd = cmd.xrcd_handle.ok_or(KernelError(libc::EINVAL))?;
                state.check(xrcd, Kind::Xrcd)?;
                deps.push(xrcd);
            }
            SRQT_TM => {}
            _ => return errno(libc::EINVAL),
        }
        if cmd.srq_type != SRQT_BASIC {
            let cq = cmd.cq_handle.ok_or(KernelError(libc::EINVAL))?;
            state.check(cq, Kind::Cq)?;
            deps.push(cq);
        }
        if cmd.drv.buf_addr == 0 || cmd.drv.db_addr == 0 {
            return errno(libc::EINVAL);
        }

        let srqn = state.number();
        let mut obj = Object::new(Kind::Srq, srqn);
        obj.srq = Some(SrqAttr {
            max_wr: cmd.max_wr,
            max_sge: cmd.max_sge,
            srq_limit: cmd.srq_limit,
        });
        let handle = state.insert(obj, deps);
        Ok(CreateSrqResp {
            handle,
            max_wr: cmd.max_wr,
            max_sge: cmd.max_sge,
            srqn,
        })
    }

    fn modify_srq(&self, srq: Handle, attr: &SrqAttr, mask: u32) -> KResult<()> {
        let mut state = lock(&self.state);
        state.take_fault(Op::ModifySrq)?;
        let obj = state.check_mut(srq, Kind::Srq)?;
        let cur = obj.srq.as_mut().ok_or(KernelError(libc::EINVAL))?;
        // Resizing an SRQ is not supported by the driver.
        if mask & SRQ_MAX_WR != 0 {
            return errno(libc::EINVAL);
        }
        if mask & SRQ_LIMIT != 0 {
            if attr.srq_limit > cur.max_wr {
                return errno(libc::EINVAL);
            }
            cur.srq_limit = attr.srq_limit;
        }
        Ok(())
    }

    fn query_srq(&self, srq: Handle) -> KResult<SrqAttr> {
        let mut state = lock(&self.state);
        state.take_fault(Op::QuerySrq)?;
        state.check(srq, Kind::Srq)?.srq.ok_or(KernelError(libc::EINVAL))
    }

    fn destroy_srq(&self, srq: Handle) -> KResult<()> {
        let mut state = lock(&self.state);
        state.take_fault(Op::DestroySrq)?;
        state.remove(srq, Kind::Srq).map(drop)
    }

    fn create_qp(&self, cmd: &CreateQp) -> KResult<CreateQpResp> {
        let mut state = lock(&self.state);
        state.take_fault(Op::CreateQp)?;
        state.last.create_qp = Some(*cmd);
        state.check(cmd.pd_handle, Kind::Pd)?;
        let mut deps = vec![cmd.pd_handle];
        for cq in [cmd.send_cq_handle, cmd.recv_cq_handle].into_iter().flatten() {
            state.check(cq, Kind::Cq)?;
            deps.push(cq);
        }
        if let Some(srq) = cmd.srq_handle {
            state.check(srq, Kind::Srq)?;
            deps.push(srq);
        }
        if let Some(xrcd) = cmd.xrcd_handle {
            state.check(xrcd, Kind::Xrcd)?;
            deps.push(xrcd);
        }

        let dct = cmd.drv.flags & MLX5_QP_FLAG_TYPE_DCT != 0;
        let no_buf = cmd.drv.buf_addr == 0 && cmd.drv.sq_buf_addr_or_access_key == 0;
        if !dct && cmd.drv.sq_wqe_count + cmd.drv.rq_wqe_count > 0 && no_buf {
            return errno(libc::EINVAL);
        }

        let bfreg_index = if cmd.drv.flags & MLX5_QP_FLAG_BFREG_INDEX != 0 {
            cmd.drv.bfreg_index
        } else {
            let i = 1 + state.next_bfreg % (STATIC_BFREGS - 1);
            state.next_bfreg += 1;
            i
        };
        let qpn = if dct { 0 } else { state.number() };
        let caps = QueryQpResp {
            state: QpState::Reset as u32,
            max_send_wr: cmd.max_send_wr,
            max_recv_wr: cmd.max_recv_wr,
            max_send_sge: cmd.max_send_sge,
            max_recv_sge: cmd.max_recv_sge,
            max_inline_data: cmd.max_inline_data,
        };
        let mut obj = Object::new(Kind::Qp, qpn);
        obj.qp = Some(QpRecord {
            state: QpState::Reset,
            dct,
            caps,
        });
        let handle = state.insert(obj, deps);
        Ok(CreateQpResp {
            handle,
            qpn,
            max_send_wr: cmd.max_send_wr,
            max_recv_wr: cmd.max_recv_wr,
            max_send_sge: cmd.max_send_sge,
            max_recv_sge: cmd.max_recv_sge,
            max_inline_data: cmd.max_inline_data,
            bfreg_index,
        })
    }

    fn create_rss_qp(&self, cmd: &CreateRssQp) -> KResult<CreateQpResp> {
        let mut state = lock(&self.state);
        state.take_fault(Op::CreateRssQp)?;
        state.last.create_rss_qp = Some(*cmd);
        state.check(cmd.pd_handle, Kind::Pd)?;
        state.check(cmd.ind_tbl_handle, Kind::IndTable)?;
        let qpn = state.number();
        let mut obj = Object::new(Kind::Qp, qpn);
        obj.qp = Some(QpRecord {
            state: QpState::Reset,
            dct: false,
            caps: QueryQpResp::default(),
        });
        let handle = state.insert(obj, vec![cmd.pd_handle, cmd.ind_tbl_handle]);
        Ok(CreateQpResp {
            handle,
            qpn,
            ..Default::default()
        })
    }

    fn modify_qp(&self, qp: Handle, cmd: &ModifyQp) -> KResult<ModifyQpRespEx> {
        let mut state = lock(&self.state);
        state.take_fault(Op::ModifyQp)?;
        state.last.modify_qp = Some(*cmd);
        let dct_resp_len = state.dct_resp_len;
        let dctn = state.next_number;

        let obj = state.check_mut(qp, Kind::Qp)?;
        let rec = obj.qp.as_mut().ok_or(KernelError(libc::EINVAL))?;
        let mut resp = ModifyQpRespEx::default();
        if cmd.mask.contains(QpAttrMask::CUR_STATE) && cmd.attr.cur_qp_state != rec.state {
            return errno(libc::EINVAL);
        }
        if !cmd.mask.contains(QpAttrMask::STATE) {
            return Ok(resp);
        }

        let to = cmd.attr.qp_state;
        if !transition_allowed(rec.state, to) {
            return errno(libc::EINVAL);
        }
        rec.state = to;
        rec.caps.state = to as u32;

        let assign_dctn = rec.dct && to == QpState::Rtr && cmd.ex;
        if assign_dctn {
            obj.number = dctn;
            resp.response_length = dct_resp_len;
            resp.dctn = dctn;
            state.next_number += 1;
        }
        Ok(resp)
    }

    fn query_qp(&self, qp: Handle, _mask: QpAttrMask) -> KResult<QueryQpResp> {
        let mut state = lock(&self.state);
        state.take_fault(Op::QueryQp)?;
        let obj = state.check(qp, Kind::Qp)?;
        obj.qp.map(|q| q.caps).ok_or(KernelError(libc::EINVAL))
    }

    fn destroy_qp(&self, qp: Handle) -> KResult<()> {
        let mut state = lock(&self.state);
        state.take_fault(Op::DestroyQp)?;
        state.remove(qp, Kind::Qp)?;
        state.mcast.retain(|(h, _, _)| *h != qp);
        Ok(())
    }

    fn attach_mcast(&self, cmd: &Mcast) -> KResult<()> {
        let mut state = lock(&self.state);
        state.take_fault(Op::AttachMcast)?;
        state.check(cmd.qp_handle, Kind::Qp)?;
        state.mcast.insert((cmd.qp_handle, *cmd.gid.raw(), cmd.lid));
        Ok(())
    }

    fn detach_mcast(&self, cmd: &Mcast) -> KResult<()> {
        let mut state = lock(&self.state);
        state.take_fault(Op::DetachMcast)?;
        state.check(cmd.qp_handle, Kind::Qp)?;
        if state.mcast.remove(&(cmd.qp_handle, *cmd.gid.raw(), cmd.lid)) {
            Ok(())
        } else {
            errno(libc::EINVAL)
        }
    }

    fn create_ah(&self, cmd: &CreateAh) -> KResult<CreateAhResp> {
        let mut state = lock(&self.state);
        state.take_fault(Op::CreateAh)?;
        state.last.create_ah = Some(*cmd);
        state.check(cmd.pd_handle, Kind::Pd)?;
        let gid: Gid = cmd.attr.grh.dgid;
        let raw = gid.raw();
        let mut dmac = [0u8; 6];
        dmac.copy_from_slice(&raw[10..16]);
        let number = state.number();
        let handle = state.insert(Object::new(Kind::Ah, number), vec![cmd.pd_handle]);
        Ok(CreateAhResp {
            handle,
            dmac,
            reserved: [0; 2],
        })
    }

    fn destroy_ah(&self, ah: Handle) -> KResult<()> {
        let mut state = lock(&self.state);
        state.take_fault(Op::DestroyAh)?;
        state.remove(ah, Kind::Ah).map(drop)
    }

    fn open_xrcd(&self, _fd: i32, _oflags: i32) -> KResult<Handle> {
        let mut state = lock(&self.state);
        state.take_fault(Op::OpenXrcd)?;
        let number = state.number();
        Ok(state.insert(Object::new(Kind::Xrcd, number), Vec::new()))
    }

    fn close_xrcd(&self, xrcd: Handle) -> KResult<()> {
        let mut state = lock(&self.state);
        state.take_fault(Op::CloseXrcd)?;
        state.remove(xrcd, Kind::Xrcd).map(drop)
    }

    fn create_wq(&self, cmd: &CreateWq) -> KResult<CreateWqResp> {
        let mut state = lock(&self.state);
        state.take_fault(Op::CreateWq)?;
        state.last.create_wq = Some(*cmd);
        state.check(cmd.pd_handle, Kind::Pd)?;
        state.check(cmd.cq_handle, Kind::Cq)?;
        if cmd.drv.buf_addr == 0 || cmd.drv.db_addr == 0 {
            return errno(libc::EINVAL);
        }
        let wqn = state.number();
        let mut obj = Object::new(Kind::Wq, wqn);
        obj.wq_state = Some(WqState::Reset);
        let handle = state.insert(obj, vec![cmd.pd_handle, cmd.cq_handle]);
        Ok(CreateWqResp {
            handle,
            wqn,
            max_wr: cmd.max_wr,
            max_sge: cmd.max_sge,
        })
    }

    fn modify_wq(&self, wq: Handle, cmd: &ModifyWq) -> KResult<()> {
        let mut state = lock(&self.state);
        state.take_fault(Op::ModifyWq)?;
        let obj = state.check_mut(wq, Kind::Wq)?;
        let cur = obj.wq_state.ok_or(KernelError(libc::EINVAL))?;
        let mask = WqAttrMask::from_bits_truncate(cmd.attr_mask);
        if mask.contains(WqAttrMask::CURR_STATE) && cmd.curr_wq_state != cur as u32 {
            return errno(libc::EINVAL);
        }
        if mask.contains(WqAttrMask::STATE) {
            let to = WqState::try_from(cmd.wq_state).map_err(|_| KernelError(libc::EINVAL))?;
            obj.wq_state = Some(to);
        }
        Ok(())
    }

    fn destroy_wq(&self, wq: Handle) -> KResult<()> {
        let mut state = lock(&self.state);
        state.take_fault(Op::DestroyWq)?;
        state.remove(wq, Kind::Wq).map(drop)
    }

    fn create_rwq_ind_table(&self, log_size: u32, table: &[u32]) -> KResult<CreateRwqIndTableResp> {
        let mut state = lock(&self.state);
        state.take_fault(Op::CreateRwqIndTable)?;
        state.last.ind_table = Some((log_size, table.to_vec()));
        let n = 1usize.checked_shl(log_size).ok_or(KernelError(libc::EINVAL))?;
        if table.len() < n {
            return errno(libc::EINVAL);
        }
        let deps = table[..n].to_vec();
        for wq in &deps {
            state.check(*wq, Kind::Wq)?;
        }
        let ind_tbl_num = state.number();
        let handle = state.insert(Object::new(Kind::IndTable, ind_tbl_num), deps);
        Ok(CreateRwqIndTableResp {
            handle,
            ind_tbl_num,
        })
    }

    fn destroy_rwq_ind_table(&self, table: Handle) -> KResult<()> {
        let mut state = lock(&self.state);
        state.take_fault(Op::DestroyRwqIndTable)?;
        state.remove(table, Kind::IndTable).map(drop)
    }

    fn create_flow(&self, cmd: &CreateFlow) -> KResult<Handle> {
        let mut state = lock(&self.state);
        state.take_fault(Op::CreateFlow)?;
        state.last.create_flow = Some(cmd.clone());
        state.check(cmd.qp_handle, Kind::Qp)?;
        let number = state.number();
        Ok(state.insert(Object::new(Kind::Flow, number), vec![cmd.qp_handle]))
    }

    fn destroy_flow(&self, flow: Handle) -> KResult<()> {
        let mut state = lock(&self.state);
        state.take_fault(Op::DestroyFlow)?;
        state.remove(flow, Kind::Flow).map(drop)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_dependency_counts() {
        let k = LoopbackKernel::new();
        let pd = k.alloc_pd().unwrap();
        let mr = k
            .reg_mr(&RegMr {
                pd_handle: pd.handle,
                length: 4096,
                ..Default::default()
            })
            .unwrap();
        assert_eq!(k.users(pd.handle), Some(1));
        assert_eq!(k.dealloc_pd(pd.handle), Err(KernelError(libc::EBUSY)));
        k.dereg_mr(mr.handle).unwrap();
        k.dealloc_pd(pd.handle).unwrap();
        assert_eq!(k.live_objects(), 0);
        assert_eq!(k.dealloc_pd(pd.handle), Err(KernelError(libc::EINVAL)));
    }

    #[test]
    fn test_fault_injection_is_one_shot() {
        let k = LoopbackKernel::new();
        k.fail_next(Op::AllocPd, libc::ENOMEM);
        assert_eq!(k.alloc_pd().unwrap_err().errno(), libc::ENOMEM);
        assert!(k.alloc_pd().is_ok());
    }

    #[test]
    fn test_qp_state_machine() {
        use crate::rdma::qp::QpAttr;

        let k = LoopbackKernel::new();
        let pd = k.alloc_pd().unwrap();
        let qp = k
            .create_qp(&CreateQp {
                pd_handle: pd.handle,
                qp_type: 2,
                ..Default::default()
            })
            .unwrap();
        let modify = |to: QpState| ModifyQp {
            attr: QpAttr {
                qp_state: to,
                ..Default::default()
            },
            mask: QpAttrMask::STATE,
            ex: false,
            burst: BurstInfo::default(),
        };
        assert!(k.modify_qp(qp.handle, &modify(QpState::Rts)).is_err());
        k.modify_qp(qp.handle, &modify(QpState::Init)).unwrap();
        k.modify_qp(qp.handle, &modify(QpState::Rtr)).unwrap();
        k.modify_qp(qp.handle, &modify(QpState::Rts)).unwrap();
        assert_eq!(k.qp_state(qp.handle), Some(QpState::Rts));
        k.modify_qp(qp.handle, &modify(QpState::Reset)).unwrap();
        assert_eq!(k.qp_state(qp.handle), Some(QpState::Reset));
    }
}
