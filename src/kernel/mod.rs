//! The privileged kernel command transport.
//!
//! All hardware objects are allocated, validated, and given numeric handles
//! by the kernel. This crate only prepares memory and parameters and hands
//! them over through [`Kernel`], one synchronous command per call. Errors
//! come back as raw errno values and are surfaced to callers unchanged.

use std::io;

use thiserror::Error;

use crate::abi::*;
use crate::rdma::qp::QpAttrMask;

mod loopback;
pub use self::loopback::*;

/// An errno returned by a kernel command.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
#[error("kernel command failed: {}", io::Error::from_raw_os_error(*.0))]
pub struct KernelError(pub i32);

impl KernelError {
    /// The raw errno value.
    #[inline]
    pub fn errno(&self) -> i32 {
        self.0
    }
}

/// Result of a kernel command.
pub type KResult<T> = Result<T, KernelError>;

/// Synchronous command interface to the kernel driver.
///
/// Implementations must be callable from any thread. Every method either
/// fully succeeds or leaves no kernel-side state behind.
pub trait Kernel: Send + Sync {
    fn query_device(&self) -> KResult<DeviceAttr>;
    /// `vendor` requests the vendor part of the response.
    fn query_device_ex(&self, vendor: bool) -> KResult<QueryDeviceExResp>;
    fn query_port(&self, port: u8) -> KResult<PortAttr>;
    fn query_gid_type(&self, port: u8, index: u32) -> KResult<u32>;

    fn alloc_pd(&self) -> KResult<AllocPdResp>;
    fn dealloc_pd(&self, pd: Handle) -> KResult<()>;

    fn reg_mr(&self, cmd: &RegMr) -> KResult<RegMrResp>;
    fn rereg_mr(&self, cmd: &RereMr) -> KResult<RegMrResp>;
    fn dereg_mr(&self, mr: Handle) -> KResult<()>;
    fn alloc_mw(&self, pd: Handle, mw_type: u32) -> KResult<AllocMwResp>;
    fn dealloc_mw(&self, mw: Handle) -> KResult<()>;

    fn create_cq(&self, cmd: &CreateCq) -> KResult<CreateCqResp>;
    fn resize_cq(&self, cq: Handle, cmd: &ResizeCq) -> KResult<u32>;
    fn modify_cq(&self, cq: Handle, cmd: &ModifyCq) -> KResult<()>;
    fn destroy_cq(&self, cq: Handle) -> KResult<()>;

    fn create_srq(&self, cmd: &CreateSrq) -> KResult<CreateSrqResp>;
    fn modify_srq(&self, srq: Handle, attr: &SrqAttr, mask: u32) -> KResult<()>;
    fn query_srq(&self, srq: Handle) -> KResult<SrqAttr>;
    fn destroy_srq(&self, srq: Handle) -> KResult<()>;

    fn create_qp(&self, cmd: &CreateQp) -> KResult<CreateQpResp>;
    fn create_rss_qp(&self, cmd: &CreateRssQp) -> KResult<CreateQpResp>;
    fn modify_qp(&self, qp: Handle, cmd: &ModifyQp) -> KResult<ModifyQpRespEx>;
    fn query_qp(&self, qp: Handle, mask: QpAttrMask) -> KResult<QueryQpResp>;
    fn destroy_qp(&self, qp: Handle) -> KResult<()>;
    fn attach_mcast(&self, cmd: &Mcast) -> KResult<()>;
    fn detach_mcast(&self, cmd: &Mcast) -> KResult<()>;

    fn create_ah(&self, cmd: &CreateAh) -> KResult<CreateAhResp>;
    fn destroy_ah(&self, ah: Handle) -> KResult<()>;

    fn open_xrcd(&self, fd: i32, oflags: i32) -> KResult<Handle>;
    fn close_xrcd(&self, xrcd: Handle) -> KResult<()>;

    fn create_wq(&self, cmd: &CreateWq) -> KResult<CreateWqResp>;
    fn modify_wq(&self, wq: Handle, cmd: &ModifyWq) -> KResult<()>;
    fn destroy_wq(&self, wq: Handle) -> KResult<()>;
    fn create_rwq_ind_table(&self, log_size: u32, table: &[u32]) -> KResult<CreateRwqIndTableResp>;
    fn destroy_rwq_ind_table(&self, table: Handle) -> KResult<()>;

    fn create_flow(&self, cmd: &CreateFlow) -> KResult<Handle>;
    fn destroy_flow(&self, flow: Handle) -> KResult<()>;
}
