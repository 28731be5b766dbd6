//! Fixed-layout command and response structures exchanged with the kernel.
//!
//! Each command carries the generic verbs payload followed by the
//! vendor-specific `drv` part. Vendor parts keep the kernel ABI layout.

use serde::{Deserialize, Serialize};
use static_assertions::const_assert_eq;

use crate::rdma::ah::AhAttr;
use crate::rdma::gid::Gid;
use crate::rdma::qp::{QpAttr, QpAttrMask};

/// Kernel object handle.
pub type Handle = u32;

/// Sentinel user index meaning "not user-indexed".
pub const UIDX_NONE: u32 = 0xff_ffff;

// === Device ===

/// Basic device attributes.
#[derive(Debug, Clone, Copy, Default)]
#[repr(C)]
pub struct DeviceAttr {
    pub raw_fw_ver: u64,
    pub node_guid: u64,
    pub vendor_id: u32,
    pub vendor_part_id: u32,
    pub hw_ver: u32,
    pub max_qp: u32,
    pub max_qp_wr: u32,
    pub device_cap_flags: u32,
    pub max_sge: u32,
    pub max_cq: u32,
    pub max_cqe: u32,
    pub max_mr: u32,
    pub max_pd: u32,
    pub max_srq: u32,
    pub max_srq_wr: u32,
    pub max_srq_sge: u32,
    pub atomic_cap: u32,
    pub phys_port_cnt: u8,
    pub reserved: [u8; 3],
}

/// Packet pacing capabilities as reported by the kernel.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
#[repr(C)]
pub struct PacketPacingCaps {
    pub qp_rate_limit_min: u32,
    pub qp_rate_limit_max: u32,
    pub supported_qpts: u32,
    pub cap_flags: u8,
    pub reserved: [u8; 3],
}

/// TSO capabilities.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
#[repr(C)]
pub struct TsoCaps {
    pub max_tso: u32,
    pub supported_qpts: u32,
}

/// RSS capabilities.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
#[repr(C)]
pub struct RssCaps {
    pub rx_hash_fields_mask: u64,
    pub rx_hash_function: u8,
    pub reserved: [u8; 7],
}

/// CQE compression capabilities.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
#[repr(C)]
pub struct CqeCompCaps {
    pub max_num: u32,
    pub supported_format: u32,
}

/// Striding receive queue capabilities.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
#[repr(C)]
pub struct StridingRqCaps {
    pub min_single_stride_log_num_of_bytes: u32,
    pub max_single_stride_log_num_of_bytes: u32,
    pub min_single_wqe_log_num_of_strides: u32,
    pub max_single_wqe_log_num_of_strides: u32,
    pub supported_qpts: u32,
    pub reserved: u32,
}

/// Vendor part of the extended device query response.
#[derive(Debug, Clone, Copy, Default)]
#[repr(C)]
pub struct Mlx5QueryDeviceExResp {
    pub comp_mask: u32,
    pub response_length: u32,
    pub tso_caps: TsoCaps,
    pub rss_caps: RssCaps,
    pub cqe_comp_caps: CqeCompCaps,
    pub packet_pacing_caps: PacketPacingCaps,
    pub support_multi_pkt_send_wqe: u32,
    pub flags: u32,
    pub sw_parsing_caps: u32,
    pub sw_parsing_supported_qpts: u32,
    pub striding_rq_caps: StridingRqCaps,
    pub tunnel_offloads_caps: u32,
    pub reserved: u32,
}

/// Extended device query response.
#[derive(Debug, Clone, Copy, Default)]
#[repr(C)]
pub struct QueryDeviceExResp {
    pub base: DeviceAttr,
    pub drv: Mlx5QueryDeviceExResp,
}

/// `support_multi_pkt_send_wqe` bits.
pub const MLX5_ALLOW_MPW: u32 = 1 << 0;
pub const MLX5_SUPPORT_EMPW: u32 = 1 << 1;

/// `flags` bits of the extended device query response.
pub const MLX5_QUERY_DEV_RESP_FLAGS_CQE_128B_COMP: u32 = 1 << 0;
pub const MLX5_QUERY_DEV_RESP_FLAGS_CQE_128B_PAD: u32 = 1 << 1;

/// Port attributes.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
#[repr(C)]
pub struct PortAttr {
    pub state: u32,
    pub max_mtu: u32,
    pub active_mtu: u32,
    pub gid_tbl_len: u32,
    pub lid: u16,
    pub sm_lid: u16,
    pub link_layer: u8,
    pub reserved: [u8; 3],
}

// === PD / MR / MW / XRCD ===

#[derive(Debug, Clone, Copy, Default)]
#[repr(C)]
pub struct AllocPdResp {
    pub handle: Handle,
    pub pdn: u32,
}

#[derive(Debug, Clone, Copy, Default)]
#[repr(C)]
pub struct RegMr {
    pub pd_handle: Handle,
    pub access_flags: u32,
    pub start: u64,
    pub length: u64,
    pub hca_va: u64,
}

#[derive(Debug, Clone, Copy, Default)]
#[repr(C)]
pub struct RegMrResp {
    pub handle: Handle,
    pub lkey: u32,
    pub rkey: u32,
    pub reserved: u32,
}

#[derive(Debug, Clone, Copy, Default)]
#[repr(C)]
pub struct RereMr {
    pub mr_handle: Handle,
    pub flags: u32,
    pub start: u64,
    pub length: u64,
    pub hca_va: u64,
    pub pd_handle: Handle,
    pub access_flags: u32,
}

#[derive(Debug, Clone, Copy, Default)]
#[repr(C)]
pub struct AllocMwResp {
    pub handle: Handle,
    pub rkey: u32,
}

// === CQ ===

#[derive(Debug, Clone, Copy, Default)]
#[repr(C)]
pub struct Mlx5CreateCq {
    pub buf_addr: u64,
    pub db_addr: u64,
    pub cqe_size: u32,
    pub cqe_comp_en: u8,
    pub cqe_comp_res_format: u8,
    pub flags: u16,
}
const_assert_eq!(std::mem::size_of::<Mlx5CreateCq>(), 24);

/// Vendor create-CQ flag: pad 64-byte CQEs to 128 bytes.
pub const MLX5_CREATE_CQ_FLAGS_CQE_128B_PAD: u16 = 1 << 0;

#[derive(Debug, Clone, Copy, Default)]
#[repr(C)]
pub struct CreateCq {
    pub cqe: u32,
    pub comp_vector: u32,
    pub flags: u32,
    pub reserved: u32,
    pub drv: Mlx5CreateCq,
}

#[derive(Debug, Clone, Copy, Default)]
#[repr(C)]
pub struct CreateCqResp {
    pub handle: Handle,
    pub cqe: u32,
    pub cqn: u32,
    pub reserved: u32,
}

#[derive(Debug, Clone, Copy, Default)]
#[repr(C)]
pub struct Mlx5ResizeCq {
    pub buf_addr: u64,
    pub cqe_size: u16,
    pub reserved0: u16,
    pub reserved1: u32,
}
const_assert_eq!(std::mem::size_of::<Mlx5ResizeCq>(), 16);

#[derive(Debug, Clone, Copy, Default)]
#[repr(C)]
pub struct ResizeCq {
    pub cqe: u32,
    pub reserved: u32,
    pub drv: Mlx5ResizeCq,
}

#[derive(Debug, Clone, Copy, Default)]
#[repr(C)]
pub struct ModifyCq {
    pub attr_mask: u32,
    pub cq_count: u16,
    pub cq_period: u16,
}

// === SRQ ===

#[derive(Debug, Clone, Copy, Default)]
#[repr(C)]
pub struct Mlx5CreateSrq {
    pub buf_addr: u64,
    pub db_addr: u64,
    pub flags: u32,
    pub reserved0: u32,
    pub uidx: u32,
    pub reserved1: u32,
}
const_assert_eq!(std::mem::size_of::<Mlx5CreateSrq>(), 32);

/// Vendor SRQ flag: software signatures are generated.
pub const MLX5_SRQ_FLAG_SIGNATURE: u32 = 1 << 0;

/// Kernel-side SRQ type codes.
pub const SRQT_BASIC: u32 = 0;
pub const SRQT_XRC: u32 = 1;
pub const SRQT_TM: u32 = 2;

#[derive(Debug, Clone, Copy, Default)]
#[repr(C)]
pub struct CreateSrq {
    pub pd_handle: Handle,
    pub srq_type: u32,
    pub max_wr: u32,
    pub max_sge: u32,
    pub srq_limit: u32,
    pub max_num_tags: u32,
    pub xrcd_handle: Option<Handle>,
    pub cq_handle: Option<Handle>,
    pub drv: Mlx5CreateSrq,
}

#[derive(Debug, Clone, Copy, Default)]
#[repr(C)]
pub struct CreateSrqResp {
    pub handle: Handle,
    pub max_wr: u32,
    pub max_sge: u32,
    pub srqn: u32,
}

/// SRQ attributes for modify and query.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
#[repr(C)]
pub struct SrqAttr {
    pub max_wr: u32,
    pub max_sge: u32,
    pub srq_limit: u32,
}

/// `attr_mask` bits for SRQ modify.
pub const SRQ_MAX_WR: u32 = 1 << 0;
pub const SRQ_LIMIT: u32 = 1 << 1;

// === QP ===

#[derive(Debug, Clone, Copy, Default)]
#[repr(C)]
pub struct Mlx5CreateQp {
    pub buf_addr: u64,
    pub db_addr: u64,
    pub sq_wqe_count: u32,
    pub rq_wqe_count: u32,
    pub rq_wqe_shift: u32,
    pub flags: u32,
    pub uidx: u32,
    pub bfreg_index: u32,
    /// SQ buffer address for split layouts, DC access key for DCTs.
    pub sq_buf_addr_or_access_key: u64,
}
const_assert_eq!(std::mem::size_of::<Mlx5CreateQp>(), 48);

/// Vendor create-QP flags.
pub const MLX5_QP_FLAG_SIGNATURE: u32 = 1 << 0;
pub const MLX5_QP_FLAG_SCATTER_CQE: u32 = 1 << 1;
pub const MLX5_QP_FLAG_TUNNEL_OFFLOADS: u32 = 1 << 2;
pub const MLX5_QP_FLAG_BFREG_INDEX: u32 = 1 << 3;
pub const MLX5_QP_FLAG_TYPE_DCT: u32 = 1 << 4;
pub const MLX5_QP_FLAG_TYPE_DCI: u32 = 1 << 5;

/// Generic create-QP flag requesting a fixed source QPN (underlay UD).
pub const QP_CREATE_SOURCE_QPN: u32 = 1 << 10;

#[derive(Debug, Clone, Copy, Default)]
#[repr(C)]
pub struct CreateQp {
    pub pd_handle: Handle,
    pub send_cq_handle: Option<Handle>,
    pub recv_cq_handle: Option<Handle>,
    pub srq_handle: Option<Handle>,
    pub xrcd_handle: Option<Handle>,
    pub qp_type: u32,
    pub sq_sig_all: u8,
    pub reserved: [u8; 3],
    pub max_send_wr: u32,
    pub max_recv_wr: u32,
    pub max_send_sge: u32,
    pub max_recv_sge: u32,
    pub max_inline_data: u32,
    pub create_flags: u32,
    pub source_qpn: u32,
    pub max_tso_header: u16,
    pub reserved1: u16,
    pub drv: Mlx5CreateQp,
}

#[derive(Debug, Clone, Copy, Default)]
#[repr(C)]
pub struct CreateQpResp {
    pub handle: Handle,
    pub qpn: u32,
    pub max_send_wr: u32,
    pub max_recv_wr: u32,
    pub max_send_sge: u32,
    pub max_recv_sge: u32,
    pub max_inline_data: u32,
    /// Kernel-selected static doorbell register.
    pub bfreg_index: u32,
}

/// RX hash key capacity of the RSS create command.
pub const RX_HASH_KEY_LEN: usize = 128;

#[derive(Debug, Clone, Copy)]
#[repr(C)]
pub struct CreateRssQp {
    pub pd_handle: Handle,
    pub ind_tbl_handle: Handle,
    pub rx_hash_fields_mask: u64,
    pub rx_hash_function: u8,
    pub rx_key_len: u8,
    pub reserved: [u8; 2],
    pub create_flags: u32,
    pub rx_hash_key: [u8; RX_HASH_KEY_LEN],
}

impl Default for CreateRssQp {
    fn default() -> Self {
        Self {
            pd_handle: 0,
            ind_tbl_handle: 0,
            rx_hash_fields_mask: 0,
            rx_hash_function: 0,
            rx_key_len: 0,
            reserved: [0; 2],
            create_flags: 0,
            rx_hash_key: [0; RX_HASH_KEY_LEN],
        }
    }
}

/// Rate-limit burst parameters accompanying an extended modify.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
#[repr(C)]
pub struct BurstInfo {
    pub max_burst_sz: u32,
    pub typical_pkt_sz: u16,
    pub reserved: u16,
}

#[derive(Debug, Clone, Copy)]
pub struct ModifyQp {
    pub attr: QpAttr,
    pub mask: QpAttrMask,
    /// Use the extended command (rate limiting, DCT creation).
    pub ex: bool,
    pub burst: BurstInfo,
}

#[derive(Debug, Clone, Copy, Default)]
#[repr(C)]
pub struct ModifyQpRespBase {
    pub comp_mask: u32,
    pub response_length: u32,
}

/// Extended modify response; `dctn` is valid once a DCT reaches RTR.
#[derive(Debug, Clone, Copy, Default)]
#[repr(C)]
pub struct ModifyQpRespEx {
    pub base: ModifyQpRespBase,
    pub response_length: u32,
    pub dctn: u32,
}

/// Queue capabilities reported by a QP query.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
#[repr(C)]
pub struct QueryQpResp {
    pub state: u32,
    pub max_send_wr: u32,
    pub max_recv_wr: u32,
    pub max_send_sge: u32,
    pub max_recv_sge: u32,
    pub max_inline_data: u32,
}

// === AH ===

#[derive(Debug, Clone, Copy, Default)]
#[repr(C)]
pub struct CreateAhResp {
    pub handle: Handle,
    pub dmac: [u8; 6],
    pub reserved: [u8; 2],
}

// === RWQ ===

#[derive(Debug, Clone, Copy, Default)]
#[repr(C)]
pub struct Mlx5CreateWq {
    pub buf_addr: u64,
    pub db_addr: u64,
    pub rq_wqe_count: u32,
    pub rq_wqe_shift: u32,
    pub user_index: u32,
    pub flags: u32,
    pub comp_mask: u32,
    pub single_stride_log_num_of_bytes: u32,
    pub single_wqe_log_num_of_strides: u32,
    pub two_byte_shift_en: u32,
}
const_assert_eq!(std::mem::size_of::<Mlx5CreateWq>(), 48);

/// Vendor RWQ flag: software signatures are generated.
pub const MLX5_RWQ_FLAG_SIGNATURE: u32 = 1 << 0;

/// `comp_mask` bit enabling striding receive queues.
pub const MLX5_IB_CREATE_WQ_STRIDING_RQ: u32 = 1 << 0;

#[derive(Debug, Clone, Copy, Default)]
#[repr(C)]
pub struct CreateWq {
    pub pd_handle: Handle,
    pub cq_handle: Handle,
    pub wq_type: u32,
    pub max_wr: u32,
    pub max_sge: u32,
    pub create_flags: u32,
    pub drv: Mlx5CreateWq,
}

#[derive(Debug, Clone, Copy, Default)]
#[repr(C)]
pub struct CreateWqResp {
    pub handle: Handle,
    pub wqn: u32,
    pub max_wr: u32,
    pub max_sge: u32,
}

#[derive(Debug, Clone, Copy, Default)]
#[repr(C)]
pub struct ModifyWq {
    pub attr_mask: u32,
    pub wq_state: u32,
    pub curr_wq_state: u32,
    pub flags: u32,
    pub flags_mask: u32,
}

#[derive(Debug, Clone, Copy, Default)]
#[repr(C)]
pub struct CreateRwqIndTableResp {
    pub handle: Handle,
    pub ind_tbl_num: u32,
}

// === Flow ===

/// A steering rule; `specs` carries the already-encoded flow specs.
#[derive(Debug, Clone, Default)]
pub struct CreateFlow {
    pub qp_handle: Handle,
    pub flow_type: u32,
    pub priority: u16,
    pub port: u8,
    pub flags: u32,
    pub num_of_specs: u8,
    pub specs: Vec<u8>,
}

/// Multicast membership command.
#[derive(Debug, Clone, Copy)]
pub struct Mcast {
    pub qp_handle: Handle,
    pub gid: Gid,
    pub lid: u16,
}

/// Address-handle create command.
#[derive(Debug, Clone, Copy)]
pub struct CreateAh {
    pub pd_handle: Handle,
    pub attr: AhAttr,
}
