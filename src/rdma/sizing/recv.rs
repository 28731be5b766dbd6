use super::{seg, WqGeometry, SEND_WQE_BB};
use crate::error::{Error, Result};
use crate::rdma::caps::DeviceCaps;
use crate::rdma::qp::QpCaps;
use crate::utils::{checked_pow2_roundup, ilog2, pow2_roundup};

/// Size of one receive descriptor. Zero when receives go to an SRQ.
pub fn calc_rcv_wqe(dev: &DeviceCaps, caps: &QpCaps, has_srq: bool, wq_sig: bool) -> Result<u32> {
    if has_srq {
        return Ok(0);
    }

    let mut size = seg::DATA.saturating_mul(caps.max_recv_sge.max(1));
    if wq_sig {
        size = size.saturating_add(seg::RWQE_SIG);
    }
    if size > dev.max_rq_desc_sz {
        return Err(Error::InvalidArgument("receive descriptor too large"));
    }
    Ok(pow2_roundup(size))
}

/// Largest queue buffer the adapter accepts.
const MAX_WQ_BYTES: u32 = 0x7fff_ffff;

/// Slots in an SRQ are linked by 16-bit indices.
const MAX_SRQ_SLOTS: u32 = 1 << 16;

/// Bytes of `depth` descriptors of `wqe_size` bytes, the depth rounded up to
/// a power of two.
fn queue_bytes(depth: u32, wqe_size: u32) -> Result<u32> {
    checked_pow2_roundup(depth)
        .and_then(|n| n.checked_mul(wqe_size))
        .filter(|&bytes| bytes <= MAX_WQ_BYTES)
        .ok_or_else(|| {
            log::debug!("rmlx5: {} descriptors of {} bytes overflow the queue", depth, wqe_size);
            Error::InvalidArgument("receive queue too deep")
        })
}

/// Size the receive queue of a QP. A zero depth means no receive queue.
pub fn calc_rq_size(
    dev: &DeviceCaps,
    caps: &QpCaps,
    has_srq: bool,
    wq_sig: bool,
) -> Result<(u32, WqGeometry)> {
    if caps.max_recv_wr == 0 {
        return Ok((0, WqGeometry::default()));
    }
    if caps.max_recv_wr > dev.max_recv_wr {
        log::debug!(
            "rmlx5: max_recv_wr {} exceeds {}",
            caps.max_recv_wr,
            dev.max_recv_wr
        );
        return Err(Error::InvalidArgument("receive queue too deep"));
    }

    let wqe_size = calc_rcv_wqe(dev, caps, has_srq, wq_sig)?;
    if wqe_size > dev.max_rq_desc_sz {
        return Err(Error::InvalidArgument("receive descriptor too large"));
    }

    let wq_size = queue_bytes(caps.max_recv_wr, wqe_size)?;
    if wqe_size == 0 {
        return Ok((wq_size, WqGeometry::default()));
    }

    let wq_size = wq_size.max(SEND_WQE_BB);
    let wqe_cnt = wq_size / wqe_size;
    let sig = if wq_sig { seg::RWQE_SIG } else { 0 };
    let geometry = WqGeometry {
        wqe_cnt,
        wqe_shift: ilog2(wqe_size),
        max_post: 1 << ilog2(wqe_cnt),
        max_gs: (wqe_size - sig) / seg::DATA,
        offset: 0,
    };
    Ok((wq_size, geometry))
}

/// Size a receive work queue. Striding queues reserve a next segment in
/// every descriptor.
pub fn calc_rwq_size(
    dev: &DeviceCaps,
    max_wr: u32,
    max_sge: u32,
    wq_sig: bool,
    striding: bool,
) -> Result<(u32, WqGeometry)> {
    if max_wr == 0 {
        return Err(Error::InvalidArgument("work queue needs a depth"));
    }

    let next = if striding { seg::SRQ_NEXT } else { 0 };
    let sig = if wq_sig { seg::RWQE_SIG } else { 0 };
    let size = seg::DATA.saturating_mul(max_sge.max(1)).saturating_add(next + sig);
    if size > dev.max_rq_desc_sz {
        return Err(Error::InvalidArgument("receive descriptor too large"));
    }

    let wqe_size = pow2_roundup(size);
    let wq_size = queue_bytes(max_wr, wqe_size)?.max(SEND_WQE_BB);
    let wqe_cnt = wq_size / wqe_size;
    let geometry = WqGeometry {
        wqe_cnt,
        wqe_shift: ilog2(wqe_size),
        max_post: 1 << ilog2(wqe_cnt),
        max_gs: (wqe_size - sig - next) / seg::DATA,
        offset: 0,
    };
    Ok((wq_size, geometry))
}

/// Geometry of a shared receive queue.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SrqGeometry {
    /// Number of slots, a power of two.
    pub max: u32,
    pub wqe_shift: u32,
    /// Scatter entries actually available per descriptor.
    pub max_gs: u32,
}

impl SrqGeometry {
    #[inline]
    pub fn bytes(&self) -> usize {
        (self.max as usize) << self.wqe_shift
    }

    /// Depth reported back to the caller. One slot is kept free.
    #[inline]
    pub fn max_wr(&self) -> u32 {
        self.max - 1
    }
}

/// Size a shared receive queue.
///
/// Every descriptor begins with a next segment that links the free list.
pub fn calc_srq_size(dev: &DeviceCaps, max_wr: u32, max_sge: u32) -> Result<SrqGeometry> {
    if max_wr > dev.max_srq_recv_wr {
        log::debug!(
            "rmlx5: SRQ max_wr {} exceeds {}",
            max_wr,
            dev.max_srq_recv_wr
        );
        return Err(Error::InvalidArgument("SRQ too deep"));
    }
    // Early bound that keeps the size computation from overflowing.
    if max_sge > dev.max_rq_desc_sz / seg::DATA {
        log::debug!("rmlx5: SRQ max_sge {} too large", max_sge);
        return Err(Error::InvalidArgument("too many SRQ SGEs"));
    }

    let max = match max_wr.checked_add(1).and_then(checked_pow2_roundup) {
        Some(max) if max <= MAX_SRQ_SLOTS => max,
        _ => {
            log::debug!("rmlx5: SRQ max_wr {} exceeds {} slots", max_wr, MAX_SRQ_SLOTS);
            return Err(Error::InvalidArgument("SRQ too deep"));
        }
    };
    let size = pow2_roundup(u32::max(32, seg::SRQ_NEXT + max_sge * seg::DATA));
    if size > dev.max_rq_desc_sz {
        return Err(Error::InvalidArgument("SRQ descriptor too large"));
    }

    Ok(SrqGeometry {
        max,
        wqe_shift: ilog2(size),
        max_gs: (size - seg::SRQ_NEXT) / seg::DATA,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_zero_depth_means_no_rq() {
        let dev = DeviceCaps::default();
        let caps = QpCaps {
            max_recv_sge: 4,
            ..Default::default()
        };
        assert_eq!(calc_rq_size(&dev, &caps, false, false).unwrap(), (0, WqGeometry::default()));
    }

    #[test]
    fn test_oversized_rq_is_rejected() {
        let dev = DeviceCaps {
            max_recv_wr: u32::MAX,
            ..Default::default()
        };
        let caps = QpCaps {
            max_recv_wr: 1 << 28,
            max_recv_sge: 1,
            ..Default::default()
        };
        assert!(matches!(
            calc_rq_size(&dev, &caps, false, false),
            Err(Error::InvalidArgument(_))
        ));
        let caps = QpCaps {
            max_recv_wr: u32::MAX,
            ..caps
        };
        assert!(calc_rq_size(&dev, &caps, false, false).is_err());
        let caps = QpCaps {
            max_recv_wr: 4,
            max_recv_sge: u32::MAX,
            ..caps
        };
        assert!(calc_rq_size(&dev, &caps, false, false).is_err());
    }

    #[test]
    fn test_srq_attached_rq_is_empty() {
        let dev = DeviceCaps::default();
        let caps = QpCaps {
            max_recv_wr: 16,
            max_recv_sge: 1,
            ..Default::default()
        };
        let (bytes, rq) = calc_rq_size(&dev, &caps, true, false).unwrap();
        assert_eq!(bytes, 0);
        assert!(rq.is_empty());
    }

    #[test]
    fn test_signature_space() {
        let dev = DeviceCaps::default();
        let caps = QpCaps {
            max_recv_wr: 2,
            max_recv_sge: 1,
            ..Default::default()
        };
        let (bytes, rq) = calc_rq_size(&dev, &caps, false, true).unwrap();
        // 32-byte descriptors, floored at one basic block.
        assert_eq!(bytes, 64);
        assert_eq!(rq.wqe_cnt, 2);
        assert_eq!(rq.max_gs, 1);
        assert_eq!(rq.wqe_shift, 5);
    }

    #[test]
    fn test_rwq_striding() {
        let dev = DeviceCaps::default();
        let (bytes, rq) = calc_rwq_size(&dev, 100, 1, false, true).unwrap();
        assert_eq!(rq.wqe_shift, 5);
        assert_eq!(rq.wqe_cnt, 128);
        assert_eq!(rq.max_gs, 1);
        assert_eq!(bytes, 128 * 32);
        assert!(calc_rwq_size(&dev, 0, 1, false, false).is_err());
        assert!(calc_rwq_size(&dev, u32::MAX, 1, false, false).is_err());
        assert!(calc_rwq_size(&dev, 1, u32::MAX, false, true).is_err());
        // 2^28 descriptors of 16 bytes need 4 GiB.
        assert!(matches!(
            calc_rwq_size(&dev, 1 << 28, 1, false, false),
            Err(Error::InvalidArgument(_))
        ));
        let (bytes, _) = calc_rwq_size(&dev, 1 << 26, 1, false, false).unwrap();
        assert_eq!(bytes, 1 << 30);
    }

    #[test]
    fn test_srq_geometry() {
        let dev = DeviceCaps::default();
        let srq = calc_srq_size(&dev, 100, 1).unwrap();
        assert_eq!(srq.max, 128);
        assert_eq!(srq.max_wr(), 127);
        assert_eq!(srq.wqe_shift, 5);
        assert_eq!(srq.max_gs, 1);

        let srq = calc_srq_size(&dev, 127, 3).unwrap();
        assert_eq!(srq.max, 128);
        assert_eq!(srq.wqe_shift, 6);
        assert_eq!(srq.max_gs, 3);

        assert!(calc_srq_size(&dev, dev.max_srq_recv_wr + 1, 1).is_err());

        // Free-list links are 16 bits wide even when the adapter allows more.
        let deep = DeviceCaps {
            max_srq_recv_wr: u32::MAX,
            ..Default::default()
        };
        assert_eq!(calc_srq_size(&deep, 0xffff, 1).unwrap().max, 1 << 16);
        assert!(calc_srq_size(&deep, 1 << 16, 1).is_err());
        assert!(calc_srq_size(&deep, u32::MAX, 1).is_err());
        assert!(calc_srq_size(&dev, 1, 33).is_err());
        // 32 entries pass the early bound but not the descriptor limit.
        assert!(calc_srq_size(&dev, 1, 32).is_err());
    }
}
