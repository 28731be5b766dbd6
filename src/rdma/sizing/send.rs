use super::{seg, WqGeometry, SEND_WQE_BB};
use crate::error::{Error, Result};
use crate::rdma::caps::DeviceCaps;
use crate::rdma::qp::{QpCaps, QpFlavor};
use crate::utils::{align_up, ilog2, pow2_roundup};

/// Size of a memory window bind descriptor.
const MW_BIND_SIZE: u32 = seg::UMR_CTRL + seg::MKEY_CONTEXT + if seg::UMR_KLM > 64 {
    seg::UMR_KLM
} else {
    64
};

/// Fixed per-descriptor size of a send work request before any data
/// segment, by transport.
pub fn sq_overhead(flavor: QpFlavor) -> Result<u32> {
    let rc = seg::CTRL + u32::max(seg::ATOMIC + seg::RADDR, MW_BIND_SIZE);
    let size = match flavor {
        QpFlavor::Dci => seg::DATAGRAM + rc,
        QpFlavor::Rc => rc,
        QpFlavor::Uc => seg::CTRL + u32::max(seg::RADDR, MW_BIND_SIZE),
        QpFlavor::Ud { underlay } => {
            let mut size = seg::CTRL + seg::DATAGRAM;
            if underlay {
                size += seg::ETH + seg::ETH_PAD;
            }
            size
        }
        QpFlavor::XrcIni => u32::max(
            seg::CTRL + MW_BIND_SIZE,
            seg::CTRL + seg::XRC + seg::RADDR,
        ),
        QpFlavor::XrcTgt => seg::CTRL + seg::XRC + seg::RADDR,
        QpFlavor::RawPacket => seg::CTRL + seg::ETH,
        QpFlavor::Dct | QpFlavor::Rss => {
            return Err(Error::InvalidArgument("transport has no send queue"))
        }
    };
    Ok(size)
}

/// Size of one send descriptor, aligned to the basic block.
pub fn calc_send_wqe(
    dev: &DeviceCaps,
    flavor: QpFlavor,
    caps: &QpCaps,
    max_tso_header: Option<u16>,
) -> Result<u32> {
    let mut size = sq_overhead(flavor)?;

    let inl_size = if caps.max_inline_data > 0 {
        size + align_up(seg::INL_DATA + caps.max_inline_data, 16)
    } else {
        0
    };

    if let Some(tso) = max_tso_header {
        size += align_up(tso as u32, 16);
    }

    let max_gather = dev.max_sq_desc_sz.saturating_sub(size) / seg::DATA;
    if caps.max_send_sge > max_gather {
        log::debug!(
            "rmlx5: {} send SGEs requested, at most {} fit",
            caps.max_send_sge,
            max_gather
        );
        return Err(Error::InvalidArgument("too many send SGEs"));
    }

    size += caps.max_send_sge * seg::DATA;
    let tot_size = u32::max(size, inl_size);
    if tot_size > dev.max_sq_desc_sz {
        log::debug!(
            "rmlx5: send descriptor of {} bytes exceeds {}",
            tot_size,
            dev.max_sq_desc_sz
        );
        return Err(Error::InvalidArgument("send descriptor too large"));
    }

    Ok(align_up(tot_size, SEND_WQE_BB))
}

/// Size the send queue. Returns the queue size in bytes and its geometry.
///
/// Writes the provided inline data capacity back into `caps`.
pub fn calc_sq_size(
    dev: &DeviceCaps,
    flavor: QpFlavor,
    caps: &mut QpCaps,
    max_tso_header: Option<u16>,
) -> Result<(u32, WqGeometry)> {
    if caps.max_send_wr == 0 {
        return Ok((0, WqGeometry::default()));
    }
    if caps.max_send_wr > dev.max_qp_wr {
        return Err(Error::CapabilityNotEnough(
            "max_send_wr",
            dev.max_qp_wr,
            caps.max_send_wr,
        ));
    }

    let wqe_size = calc_send_wqe(dev, flavor, caps, max_tso_header)?;
    if wqe_size > dev.max_sq_desc_sz {
        return Err(Error::InvalidArgument("send descriptor too large"));
    }

    caps.max_inline_data = wqe_size - sq_overhead(flavor)? - seg::INL_DATA;

    // Keep the multiplication below within 31 bits.
    if caps.max_send_wr > 0x7fff_ffff / dev.max_sq_desc_sz {
        log::debug!("rmlx5: max_send_wr {} overflows the SQ", caps.max_send_wr);
        return Err(Error::InvalidArgument("send queue too deep"));
    }

    let wq_size = pow2_roundup(caps.max_send_wr * wqe_size);
    let wqe_cnt = wq_size / SEND_WQE_BB;
    if wqe_cnt > dev.max_send_wqebb {
        log::debug!(
            "rmlx5: SQ of {} basic blocks exceeds {}",
            wqe_cnt,
            dev.max_send_wqebb
        );
        return Err(Error::InvalidArgument("send queue too deep"));
    }

    let geometry = WqGeometry {
        wqe_cnt,
        wqe_shift: ilog2(SEND_WQE_BB),
        max_post: wq_size / wqe_size,
        max_gs: caps.max_send_sge,
        offset: 0,
    };
    Ok((wq_size, geometry))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_overheads() {
        assert_eq!(MW_BIND_SIZE, 176);
        assert_eq!(sq_overhead(QpFlavor::Rc).unwrap(), 192);
        assert_eq!(sq_overhead(QpFlavor::Dci).unwrap(), 240);
        assert_eq!(sq_overhead(QpFlavor::Uc).unwrap(), 192);
        assert_eq!(sq_overhead(QpFlavor::Ud { underlay: false }).unwrap(), 64);
        assert_eq!(sq_overhead(QpFlavor::Ud { underlay: true }).unwrap(), 112);
        assert_eq!(sq_overhead(QpFlavor::XrcIni).unwrap(), 192);
        assert_eq!(sq_overhead(QpFlavor::XrcTgt).unwrap(), 48);
        assert_eq!(sq_overhead(QpFlavor::RawPacket).unwrap(), 48);
        assert!(sq_overhead(QpFlavor::Dct).is_err());
    }

    #[test]
    fn test_inline_reported_exactly() {
        let dev = DeviceCaps::default();
        let mut caps = QpCaps {
            max_send_wr: 16,
            max_send_sge: 1,
            max_inline_data: 1,
            ..Default::default()
        };
        let (_, sq) = calc_sq_size(&dev, QpFlavor::Ud { underlay: false }, &mut caps, None).unwrap();
        // 64 + 16 data bytes round to a 128-byte descriptor.
        assert_eq!(caps.max_inline_data, 128 - 64 - 4);
        assert_eq!(sq.max_post, 16);
    }

    #[test]
    fn test_tso_header_counts() {
        let dev = DeviceCaps::default();
        let caps = QpCaps {
            max_send_wr: 1,
            max_send_sge: 1,
            ..Default::default()
        };
        let plain = calc_send_wqe(&dev, QpFlavor::RawPacket, &caps, None).unwrap();
        let tso = calc_send_wqe(&dev, QpFlavor::RawPacket, &caps, Some(128)).unwrap();
        assert_eq!(plain, 64);
        assert_eq!(tso, 192);
    }

    #[test]
    fn test_gather_and_descriptor_limits() {
        let dev = DeviceCaps::default();
        let caps = QpCaps {
            max_send_wr: 1,
            max_send_sge: 21,
            ..Default::default()
        };
        // (512 - 192) / 16 = 20 entries fit after the RC overhead.
        assert!(calc_send_wqe(&dev, QpFlavor::Rc, &caps, None).is_err());

        let caps = QpCaps {
            max_send_wr: 1,
            max_send_sge: 1,
            max_inline_data: 400,
            ..Default::default()
        };
        assert!(calc_send_wqe(&dev, QpFlavor::Rc, &caps, None).is_err());
    }
}
