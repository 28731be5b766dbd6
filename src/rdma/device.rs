//! Device and port queries, and the free-running core clock.

use std::ptr;

use super::caps::VendorCaps;
use super::context::Context;
use crate::abi::*;
use crate::error::{Error, Result};

/// Basic device attributes with the formatted firmware version.
#[derive(Debug, Clone)]
pub struct DeviceInfo {
    pub attr: DeviceAttr,
    /// `major.minor.subminor`, the subminor padded to four digits.
    pub fw_ver: String,
}

/// Extended device attributes.
#[derive(Debug, Clone)]
pub struct DeviceInfoEx {
    pub base: DeviceInfo,
    pub tso_caps: TsoCaps,
    pub rss_caps: RssCaps,
    pub packet_pacing_caps: PacketPacingCaps,
    pub cqe_comp_caps: CqeCompCaps,
    pub striding_rq_caps: StridingRqCaps,
    pub tunnel_offloads_caps: u32,
    pub vendor_caps: VendorCaps,
}

/// `comp_mask` bit of [`RtValues`]: the raw clock is requested.
pub const RT_VALUES_MASK_RAW_CLOCK: u32 = 1 << 0;

/// Real-time values.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RtValues {
    pub comp_mask: u32,
    pub raw_clock: u64,
}

fn fw_ver_string(raw: u64) -> String {
    let major = (raw >> 32) & 0xffff;
    let minor = (raw >> 16) & 0xffff;
    let sub_minor = raw & 0xffff;
    format!("{}.{}.{:04}", major, minor, sub_minor)
}

impl Context {
    /// Query basic device attributes.
    pub fn query_device(&self) -> Result<DeviceInfo> {
        let attr = self.kernel().query_device()?;
        Ok(DeviceInfo {
            fw_ver: fw_ver_string(attr.raw_fw_ver),
            attr,
        })
    }

    /// Query extended device attributes, including the vendor part when the
    /// kernel accepts a vendor payload for this command.
    pub fn query_device_ex(&self) -> Result<DeviceInfoEx> {
        let vendor = self
            .caps()
            .cmds_supp_uhw
            .contains(super::caps::UhwCmds::QUERY_DEVICE);
        let resp = self.kernel().query_device_ex(vendor)?;
        let drv = &resp.drv;

        let mut vendor_caps = VendorCaps::empty();
        if drv.support_multi_pkt_send_wqe & MLX5_ALLOW_MPW != 0 {
            vendor_caps |= VendorCaps::MPW_ALLOWED;
        }
        if drv.support_multi_pkt_send_wqe & MLX5_SUPPORT_EMPW != 0 {
            vendor_caps |= VendorCaps::ENHANCED_MPW;
        }
        if drv.flags & MLX5_QUERY_DEV_RESP_FLAGS_CQE_128B_COMP != 0 {
            vendor_caps |= VendorCaps::CQE_128B_COMP;
        }
        if drv.flags & MLX5_QUERY_DEV_RESP_FLAGS_CQE_128B_PAD != 0 {
            vendor_caps |= VendorCaps::CQE_128B_PAD;
        }

        Ok(DeviceInfoEx {
            base: DeviceInfo {
                fw_ver: fw_ver_string(resp.base.raw_fw_ver),
                attr: resp.base,
            },
            tso_caps: drv.tso_caps,
            rss_caps: drv.rss_caps,
            packet_pacing_caps: drv.packet_pacing_caps,
            cqe_comp_caps: drv.cqe_comp_caps,
            striding_rq_caps: drv.striding_rq_caps,
            tunnel_offloads_caps: drv.tunnel_offloads_caps,
            vendor_caps,
        })
    }

    /// Query a port by its 1-based number.
    pub fn query_port(&self, port_num: u8) -> Result<PortAttr> {
        if port_num == 0 || port_num > self.caps().num_ports() {
            return Err(Error::InvalidArgument("port number"));
        }
        Ok(self.kernel().query_port(port_num)?)
    }

    /// Read the 64-bit core clock.
    ///
    /// The counter is exposed as two big-endian halves. The high half is
    /// read on both sides of the low half and the read repeats if it moved.
    pub fn read_clock(&self) -> Result<u64> {
        let page = self
            .core_clock()
            .ok_or(Error::NotSupported("core clock is not mapped"))?;
        let base = page.as_ptr().cast::<u32>();
        // SAFETY: the clock page is mapped for the context's lifetime and
        // holds the two counter words at its start.
        let read = |i: usize| u32::from_be(unsafe { ptr::read_volatile(base.add(i)) });

        let mut clockhi = read(0);
        let mut clocklo = read(1);
        let clockhi1 = read(0);
        if clockhi != clockhi1 {
            clockhi = clockhi1;
            clocklo = read(1);
        }
        Ok(((clockhi as u64) << 32) | clocklo as u64)
    }

    /// Query real-time values; only the raw clock is available.
    pub fn query_rt_values(&self, comp_mask: u32) -> Result<RtValues> {
        if comp_mask & !RT_VALUES_MASK_RAW_CLOCK != 0 {
            return Err(Error::InvalidArgument("unsupported rt values mask"));
        }
        let mut values = RtValues::default();
        if comp_mask & RT_VALUES_MASK_RAW_CLOCK != 0 {
            values.raw_clock = self.read_clock()?;
            values.comp_mask |= RT_VALUES_MASK_RAW_CLOCK;
        }
        Ok(values)
    }
}
