//! Adapter capabilities, supplied once when a context opens.

use bitflags::bitflags;
use serde::{Deserialize, Serialize};

use crate::abi::{CqeCompCaps, PacketPacingCaps, StridingRqCaps, TsoCaps};

bitflags! {
    /// Vendor capability bits.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
    pub struct VendorCaps: u32 {
        const MPW_ALLOWED = 1 << 0;
        const ENHANCED_MPW = 1 << 1;
        const CQE_128B_COMP = 1 << 2;
        const CQE_128B_PAD = 1 << 3;
    }
}

bitflags! {
    /// Device capability bits the provider consults.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
    pub struct DeviceCapFlags: u32 {
        const UD_IP_CSUM = 1 << 18;
        const RAW_IP_CSUM = 1 << 26;
    }
}

bitflags! {
    /// Kernel commands that accept vendor payloads.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
    pub struct UhwCmds: u32 {
        const QUERY_DEVICE = 1 << 0;
        const CREATE_AH = 1 << 1;
    }
}

/// Packet pacing capability flag: burst control is supported.
pub const PP_SUPPORT_BURST: u8 = 1 << 0;

/// Link layer of a port.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LinkLayer {
    #[default]
    InfiniBand,
    Ethernet,
}

/// Atomic operation support.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AtomicCap {
    None,
    /// Atomic only within the HCA.
    #[default]
    Hca,
    /// Atomic with respect to the CPU as well.
    Global,
}

/// Adapter limits and layout constants.
///
/// The defaults describe a ConnectX-4 class adapter on a 4 KiB page system.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct DeviceCaps {
    /// System page size.
    pub page_size: usize,

    /// Largest send descriptor in bytes.
    pub max_sq_desc_sz: u32,

    /// Largest receive descriptor in bytes.
    pub max_rq_desc_sz: u32,

    /// Largest send queue in basic blocks.
    pub max_send_wqebb: u32,

    /// Largest receive queue depth.
    pub max_recv_wr: u32,

    /// Largest QP depth.
    pub max_qp_wr: u32,

    /// Largest SRQ depth.
    pub max_srq_recv_wr: u32,

    /// Largest scatter/gather list.
    pub max_sge: u32,

    /// Largest CQ depth.
    pub max_cqe: u32,

    /// Completion format version. Version 1 and above carries user indices
    /// in completions.
    pub cqe_version: u8,

    /// Statically assigned UARs, counted in non-fast-path registers.
    pub tot_uuars: u32,

    /// Trailing static registers dedicated to single QPs.
    pub low_lat_uuars: u32,

    /// Dynamically allocatable registers.
    pub num_dyn_bfregs: u32,

    /// Adapter UAR pages per system page.
    pub num_uars_per_page: u32,

    /// Size of one register window pair.
    pub bf_reg_size: u32,

    /// Whether the core clock page can be mapped.
    pub core_clock: bool,

    pub atomic_cap: AtomicCap,
    pub vendor_caps: VendorCaps,
    pub device_cap_flags: DeviceCapFlags,
    pub cmds_supp_uhw: UhwCmds,
    pub cqe_comp_caps: CqeCompCaps,
    pub packet_pacing_caps: PacketPacingCaps,
    pub striding_rq_caps: StridingRqCaps,
    pub tso_caps: TsoCaps,
    pub tunnel_offloads_caps: u32,

    /// Cached link layer, one entry per port.
    pub link_layers: Vec<LinkLayer>,
}

impl Default for DeviceCaps {
    fn default() -> Self {
        Self {
            page_size: 4096,
            max_sq_desc_sz: 512,
            max_rq_desc_sz: 512,
            max_send_wqebb: 1 << 15,
            max_recv_wr: 1 << 15,
            max_qp_wr: 1 << 15,
            max_srq_recv_wr: 1 << 15,
            max_sge: 30,
            max_cqe: (1 << 22) - 1,
            cqe_version: 1,
            tot_uuars: 16,
            low_lat_uuars: 4,
            num_dyn_bfregs: 32,
            num_uars_per_page: 1,
            bf_reg_size: 512,
            core_clock: true,
            atomic_cap: AtomicCap::Hca,
            vendor_caps: VendorCaps::empty(),
            device_cap_flags: DeviceCapFlags::empty(),
            cmds_supp_uhw: UhwCmds::QUERY_DEVICE | UhwCmds::CREATE_AH,
            cqe_comp_caps: CqeCompCaps::default(),
            packet_pacing_caps: PacketPacingCaps::default(),
            striding_rq_caps: StridingRqCaps {
                min_single_stride_log_num_of_bytes: 6,
                max_single_stride_log_num_of_bytes: 13,
                min_single_wqe_log_num_of_strides: 9,
                max_single_wqe_log_num_of_strides: 16,
                supported_qpts: 1 << 8,
                reserved: 0,
            },
            tso_caps: TsoCaps::default(),
            tunnel_offloads_caps: 0,
            link_layers: vec![LinkLayer::InfiniBand],
        }
    }
}

impl DeviceCaps {
    /// Load from a JSON snapshot.
    pub fn from_json(s: &str) -> serde_json::Result<Self> {
        serde_json::from_str(s)
    }

    /// Number of ports.
    #[inline]
    pub fn num_ports(&self) -> u8 {
        self.link_layers.len() as u8
    }

    /// Whether completions carry user indices.
    #[inline]
    pub fn uses_uidx(&self) -> bool {
        self.cqe_version >= 1
    }

    /// Link layer of a 1-based port number.
    pub fn link_layer(&self, port_num: u8) -> Option<LinkLayer> {
        let idx = (port_num as usize).checked_sub(1)?;
        self.link_layers.get(idx).copied()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_json_snapshot() {
        let caps = DeviceCaps::from_json(
            r#"{ "cqe_version": 0, "max_sq_desc_sz": 1024, "link_layers": ["ethernet", "ethernet"],
                 "vendor_caps": "CQE_128B_PAD" }"#,
        )
        .unwrap();
        assert!(!caps.uses_uidx());
        assert_eq!(caps.max_sq_desc_sz, 1024);
        assert_eq!(caps.num_ports(), 2);
        assert_eq!(caps.link_layer(2), Some(LinkLayer::Ethernet));
        assert_eq!(caps.link_layer(0), None);
        assert!(caps.vendor_caps.contains(VendorCaps::CQE_128B_PAD));
        assert_eq!(caps.page_size, 4096);
    }
}
