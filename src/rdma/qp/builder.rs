use super::{DcInit, DcType, Qp, QpCaps, QpInit, QpType, RxHashConf, SrqLink};
use crate::abi::QP_CREATE_SOURCE_QPN;
use crate::error::{Error, Result};
use crate::rdma::cq::Cq;
use crate::rdma::pd::Pd;
use crate::rdma::srq::Srq;
use crate::rdma::wq::RwqIndTable;
use crate::rdma::xrcd::Xrcd;

/// Queue pair builder.
#[derive(Clone, Default)]
pub struct QpBuilder<'a> {
    /// Send completion queue for this QP.
    send_cq: Option<&'a Cq>,

    /// Receive completion queue for this QP. Can be the same to send CQ.
    recv_cq: Option<&'a Cq>,

    /// Shared receive queue replacing the QP's own receive queue.
    srq: Option<&'a Srq>,

    xrcd: Option<&'a Xrcd>,

    /// Capabilities of this QP.
    caps: QpCaps,

    /// Queue pair type.
    qp_type: Option<QpType>,

    /// Whether to signal for all send work requests.
    sq_sig_all: bool,

    source_qpn: Option<u32>,
    max_tso_header: Option<u16>,
    dc: Option<DcInit>,
    tunnel_offloads: bool,
    rss: Option<(&'a RwqIndTable, RxHashConf)>,
}

impl<'a> QpBuilder<'a> {
    /// Create a new queue pair builder.
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the send completion queue for this QP.
    pub fn send_cq(mut self, send_cq: &'a Cq) -> Self {
        self.send_cq = Some(send_cq);
        self
    }

    /// Set the receive completion queue for this QP.
    pub fn recv_cq(mut self, recv_cq: &'a Cq) -> Self {
        self.recv_cq = Some(recv_cq);
        self
    }

    /// Receive from a shared receive queue. The QP gets no receive queue of
    /// its own.
    pub fn srq(mut self, srq: &'a Srq) -> Self {
        self.srq = Some(srq);
        self
    }

    /// Set the XRC domain of an XRC target QP.
    pub fn xrcd(mut self, xrcd: &'a Xrcd) -> Self {
        self.xrcd = Some(xrcd);
        self
    }

    /// Set the capabilities of this QP.
    /// If not set, the QP will be unable to send or receive any work request.
    pub fn caps(mut self, caps: QpCaps) -> Self {
        self.caps = caps;
        self
    }

    /// Set the type of this QP.
    pub fn qp_type(mut self, qp_type: QpType) -> Self {
        self.qp_type = Some(qp_type);
        self
    }

    /// Set whether to signal for all send work requests.
    pub fn sq_sig_all(mut self, sq_sig_all: bool) -> Self {
        self.sq_sig_all = sq_sig_all;
        self
    }

    /// Send with a fixed source QPN. Makes a UD QP an underlay QP.
    pub fn source_qpn(mut self, qpn: u32) -> Self {
        self.source_qpn = Some(qpn);
        self
    }

    /// Enable TSO on a raw packet QP with headers up to `len` bytes.
    pub fn max_tso_header(mut self, len: u16) -> Self {
        self.max_tso_header = Some(len);
        self
    }

    /// Make a dynamically connected QP. Requires [`QpType::Driver`].
    pub fn dc(mut self, dc_type: DcType, access_key: u64) -> Self {
        self.dc = Some(DcInit { dc_type, access_key });
        self
    }

    /// Offload stateless processing of tunneled packets.
    pub fn tunnel_offloads(mut self, enable: bool) -> Self {
        self.tunnel_offloads = enable;
        self
    }

    /// Make an RSS QP hashing over the work queues of `table`. Requires
    /// [`QpType::RawPacket`].
    pub fn rss(mut self, table: &'a RwqIndTable, conf: RxHashConf) -> Self {
        self.rss = Some((table, conf));
        self
    }

    /// Create the QP on `pd`.
    pub fn build(self, pd: &Pd) -> Result<Qp> {
        let qp_type = self.qp_type.ok_or(Error::InvalidArgument("QP type must be set"))?;
        let ctx = pd.context();
        for cq in [self.send_cq, self.recv_cq].into_iter().flatten() {
            if !cq.context().same_as(ctx) {
                return Err(Error::InvalidArgument("CQ belongs to another context"));
            }
        }
        if self.srq.is_some_and(|srq| !srq.context().same_as(ctx)) {
            return Err(Error::InvalidArgument("SRQ belongs to another context"));
        }

        let init = QpInit {
            caps: self.caps,
            send_cq: self.send_cq.map(Cq::inner),
            recv_cq: self.recv_cq.map(Cq::inner),
            srq: self.srq.map(|srq| SrqLink::Shared(srq.inner().clone())),
            xrcd: self.xrcd.map(Xrcd::inner),
            sq_sig_all: self.sq_sig_all,
            create_flags: if self.source_qpn.is_some() { QP_CREATE_SOURCE_QPN } else { 0 },
            source_qpn: self.source_qpn.unwrap_or(0),
            max_tso_header: self.max_tso_header,
            dc: self.dc,
            tunnel_offloads: self.tunnel_offloads,
            rss: self.rss.map(|(table, conf)| (table.handle(), conf)),
            ..QpInit::new(qp_type)
        };
        Qp::create(pd.inner(), init)
    }
}
