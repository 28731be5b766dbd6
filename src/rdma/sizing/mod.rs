//! Work queue sizing.
//!
//! All functions here are pure: they take the adapter limits and the
//! requested capabilities and return the queue geometry, or
//! [`Error::InvalidArgument`](crate::Error::InvalidArgument) if the request
//! cannot be laid out on this adapter. Nothing is allocated.

mod recv;
mod send;

pub use self::recv::*;
pub use self::send::*;

use crate::error::Result;
use crate::rdma::caps::DeviceCaps;
use crate::rdma::qp::{QpCaps, QpFlavor};

/// Send work queue basic block size.
pub const SEND_WQE_BB: u32 = 64;

/// Hardware segment sizes.
pub mod seg {
    pub const CTRL: u32 = 16;
    pub const RADDR: u32 = 16;
    pub const ATOMIC: u32 = 16;
    pub const DATAGRAM: u32 = 48;
    pub const XRC: u32 = 16;
    pub const ETH: u32 = 32;
    pub const ETH_PAD: u32 = 16;
    pub const INL_DATA: u32 = 4;
    pub const DATA: u32 = 16;
    pub const RWQE_SIG: u32 = 16;
    pub const SRQ_NEXT: u32 = 16;
    pub const UMR_CTRL: u32 = 48;
    pub const MKEY_CONTEXT: u32 = 64;
    pub const UMR_KLM: u32 = 16;
}

/// Geometry of one work queue.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct WqGeometry {
    /// Number of slots. For send queues this counts basic blocks.
    pub wqe_cnt: u32,
    /// log2 of the slot size.
    pub wqe_shift: u32,
    /// Number of work requests that can be outstanding.
    pub max_post: u32,
    /// Scatter/gather entries per work request.
    pub max_gs: u32,
    /// Byte offset of this queue within its buffer.
    pub offset: usize,
}

impl WqGeometry {
    /// Queue size in bytes.
    #[inline]
    pub fn bytes(&self) -> usize {
        (self.wqe_cnt as usize) << self.wqe_shift
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.wqe_cnt == 0
    }
}

/// Layout of a QP's work queue memory.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct QpLayout {
    pub sq: WqGeometry,
    pub rq: WqGeometry,

    /// Size of the main buffer. Holds the RQ followed by the SQ, or only the
    /// RQ for split layouts.
    pub buf_size: usize,

    /// Size of the separate SQ buffer of split layouts, zero otherwise.
    pub sq_buf_size: usize,

    /// Inline data capacity actually provided.
    pub max_inline_data: u32,
}

impl QpLayout {
    /// Whether the send queue lives in its own buffer.
    #[inline]
    pub fn is_split(&self) -> bool {
        self.sq_buf_size > 0
    }
}

/// Compute the full QP layout.
///
/// `caps` is updated in place with the inline data capacity actually
/// provided, which may exceed the request.
pub fn calc_wq_size(
    dev: &DeviceCaps,
    flavor: QpFlavor,
    caps: &mut QpCaps,
    max_tso_header: Option<u16>,
    has_srq: bool,
    wq_sig: bool,
) -> Result<QpLayout> {
    let (sq_bytes, mut sq) = calc_sq_size(dev, flavor, caps, max_tso_header)?;
    let (rq_bytes, rq) = calc_rq_size(dev, caps, has_srq, wq_sig)?;

    let split = flavor.has_split_buffers();
    let (buf_size, sq_buf_size) = if split {
        sq.offset = 0;
        (rq_bytes as usize, sq_bytes as usize)
    } else {
        sq.offset = rq_bytes as usize;
        (sq_bytes as usize + rq_bytes as usize, 0)
    };

    Ok(QpLayout {
        sq,
        rq,
        buf_size,
        sq_buf_size,
        max_inline_data: caps.max_inline_data,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn caps(send_wr: u32, recv_wr: u32, send_sge: u32, recv_sge: u32, inline: u32) -> QpCaps {
        QpCaps {
            max_send_wr: send_wr,
            max_recv_wr: recv_wr,
            max_send_sge: send_sge,
            max_recv_sge: recv_sge,
            max_inline_data: inline,
        }
    }

    #[test]
    fn test_rc_srq_driven_send_only() {
        let dev = DeviceCaps::default();
        let mut c = caps(200, 0, 1, 0, 64);
        let layout = calc_wq_size(&dev, QpFlavor::Rc, &mut c, None, true, false).unwrap();

        assert!(layout.sq.wqe_cnt.is_power_of_two());
        assert!(layout.sq.max_post >= 200);
        assert_eq!(layout.sq.wqe_shift, 6);
        assert_eq!(layout.sq.max_gs, 1);
        assert_eq!(layout.rq, WqGeometry::default());
        assert_eq!(layout.buf_size, layout.sq.bytes());
        assert_eq!(layout.sq.offset, 0);
        assert!(!layout.is_split());

        // 192 bytes of overhead, 80 bytes of inline segment, rounded to 320.
        assert_eq!(layout.max_inline_data, 320 - 192 - 4);
        assert_eq!(c.max_inline_data, layout.max_inline_data);
        assert_eq!(layout.sq.bytes(), 65536);
    }

    #[test]
    fn test_rq_before_sq() {
        let dev = DeviceCaps::default();
        let mut c = caps(64, 100, 2, 3, 0);
        let layout = calc_wq_size(&dev, QpFlavor::Uc, &mut c, None, false, false).unwrap();
        assert_eq!(layout.rq.offset, 0);
        assert_eq!(layout.sq.offset, layout.rq.bytes());
        assert_eq!(layout.buf_size, layout.rq.bytes() + layout.sq.bytes());
        // 3 scatter entries round up to a 64-byte descriptor.
        assert_eq!(layout.rq.wqe_shift, 6);
        assert_eq!(layout.rq.wqe_cnt, 128);
        assert_eq!(layout.rq.max_gs, 4);
    }

    #[test]
    fn test_raw_packet_split_buffers() {
        let dev = DeviceCaps::default();
        let mut c = caps(64, 64, 1, 1, 0);
        let layout = calc_wq_size(&dev, QpFlavor::RawPacket, &mut c, None, false, false).unwrap();
        assert!(layout.is_split());
        assert_eq!(layout.buf_size, layout.rq.bytes());
        assert_eq!(layout.sq_buf_size, layout.sq.bytes());
        assert_eq!(layout.sq.offset, 0);

        let mut c = caps(64, 64, 1, 1, 0);
        let underlay = QpFlavor::Ud { underlay: true };
        assert!(calc_wq_size(&dev, underlay, &mut c, None, false, false)
            .unwrap()
            .is_split());
    }

    #[test]
    fn test_depths_are_powers_of_two() {
        let dev = DeviceCaps::default();
        for depth in [1u32, 3, 17, 100, 129, 1000, 4097] {
            for sge in [1u32, 2, 7] {
                let mut c = caps(depth, depth, sge, sge, 0);
                let layout =
                    calc_wq_size(&dev, QpFlavor::Rc, &mut c, None, false, false).unwrap();
                assert!(layout.sq.wqe_cnt.is_power_of_two());
                assert!(layout.sq.max_post >= depth);
                assert!(layout.rq.wqe_cnt.is_power_of_two());
                assert!(layout.rq.wqe_cnt >= depth);
                assert!(1 << layout.rq.wqe_shift <= dev.max_rq_desc_sz);
            }
        }
    }

    #[test]
    fn test_depth_over_limit() {
        let dev = DeviceCaps::default();
        let mut c = caps(dev.max_qp_wr + 1, 0, 1, 0, 0);
        assert!(calc_wq_size(&dev, QpFlavor::Rc, &mut c, None, true, false).is_err());
        let mut c = caps(1, dev.max_recv_wr + 1, 1, 1, 0);
        assert!(calc_wq_size(&dev, QpFlavor::Rc, &mut c, None, false, false).is_err());
    }
}
