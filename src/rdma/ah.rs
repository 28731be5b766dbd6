//! Address handles.

use std::fmt;

use rand::Rng;
use static_assertions::const_assert_eq;

use super::caps::{LinkLayer, UhwCmds};
use super::gid::Gid;
use super::pd::{Pd, PdInner};
use crate::abi::{CreateAh, Handle};
use crate::error::{DestroyError, Error, Result};
use crate::utils::UserRef;

/// UDP source ports RoCE v2 packets are spread over.
pub const ROCE_V2_UDP_SPORT_MIN: u16 = 0xC000;
pub const ROCE_V2_UDP_SPORT_MAX: u16 = 0xFFFF;

/// GID type value of RoCE v2 entries.
pub const GID_TYPE_ROCE_V2: u32 = 2;

/// Global routing header attributes.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct GlobalRoute {
    pub dgid: Gid,
    pub flow_label: u32,
    pub sgid_index: u8,
    pub hop_limit: u8,
    pub traffic_class: u8,
}

/// Address handle attributes.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct AhAttr {
    pub grh: GlobalRoute,
    pub dlid: u16,
    pub sl: u8,
    pub src_path_bits: u8,
    pub static_rate: u8,
    /// Whether `grh` is valid. Required on Ethernet ports.
    pub is_global: bool,
    /// 1-based port number.
    pub port_num: u8,
}

/// Address vector, as placed into datagram segments. Multi-byte fields are
/// big endian.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
#[repr(C)]
pub struct Av {
    /// Q_Key or DC access key.
    pub key: u64,
    pub dqp_dct: u32,
    pub stat_rate_sl: u8,
    pub fl_mlid: u8,
    pub rlid: u16,
    pub reserved0: [u8; 4],
    pub rmac: [u8; 6],
    pub tclass: u8,
    pub hop_limit: u8,
    pub grh_gid_fl: u32,
    pub rgid: [u8; 16],
}
const_assert_eq!(std::mem::size_of::<Av>(), 48);

impl Av {
    /// Remote LID, or the UDP source port on RoCE v2.
    #[inline]
    pub fn rlid(&self) -> u16 {
        u16::from_be(self.rlid)
    }

    #[inline]
    pub fn grh_gid_fl(&self) -> u32 {
        u32::from_be(self.grh_gid_fl)
    }

    fn build(attr: &AhAttr, eth: bool, roce_v2: bool) -> Self {
        let mut av = Av::default();
        let grh = if eth {
            if roce_v2 {
                let sport = rand::thread_rng().gen_range(ROCE_V2_UDP_SPORT_MIN..=ROCE_V2_UDP_SPORT_MAX);
                av.rlid = sport.to_be();
            }
            // RoCE packets always carry a GRH; the bit stays clear.
            0u32
        } else {
            av.fl_mlid = attr.src_path_bits & 0x7f;
            av.rlid = attr.dlid.to_be();
            1
        };
        av.stat_rate_sl = (attr.static_rate << 4) | attr.sl;
        if attr.is_global {
            av.tclass = attr.grh.traffic_class;
            av.hop_limit = attr.grh.hop_limit;
            av.grh_gid_fl = ((grh << 30)
                | ((attr.grh.sgid_index as u32) << 20)
                | (attr.grh.flow_label & 0xf_ffff))
                .to_be();
            av.rgid = *attr.grh.dgid.raw();
        }
        av
    }
}

/// Address handle.
pub struct Ah {
    pd: UserRef<PdInner>,
    av: Av,
    /// Set when the kernel resolved the destination MAC.
    kern_handle: Option<Handle>,
}

impl fmt::Debug for Ah {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Ah")
            .field("rlid", &self.av.rlid())
            .field("kernel", &self.kern_handle.is_some())
            .finish()
    }
}

impl Ah {
    /// Create an address handle.
    pub fn new(pd: &Pd, attr: &AhAttr) -> Result<Ah> {
        let ctx = pd.context();
        let link_layer = ctx
            .caps()
            .link_layer(attr.port_num)
            .ok_or(Error::InvalidArgument("port number"))?;
        let eth = link_layer == LinkLayer::Ethernet;
        if eth && !attr.is_global {
            return Err(Error::InvalidArgument("Ethernet AH needs a GRH"));
        }

        let roce_v2 = if eth {
            ctx.kernel()
                .query_gid_type(attr.port_num, attr.grh.sgid_index as u32)?
                == GID_TYPE_ROCE_V2
        } else {
            false
        };
        let mut av = Av::build(attr, eth, roce_v2);

        let mut kern_handle = None;
        if eth {
            if !ctx.caps().cmds_supp_uhw.contains(UhwCmds::CREATE_AH) {
                return Err(Error::NotSupported("Ethernet L2 address resolution"));
            }
            let cmd = CreateAh {
                pd_handle: pd.handle(),
                attr: *attr,
            };
            let resp = ctx.kernel().create_ah(&cmd).map_err(|e| {
                log::debug!("rmlx5: create_ah failed: {}", e);
                e
            })?;
            av.rmac = resp.dmac;
            kern_handle = Some(resp.handle);
        }

        Ok(Ah {
            pd: UserRef::new(pd.inner()),
            av,
            kern_handle,
        })
    }

    /// The address vector.
    #[inline]
    pub fn av(&self) -> &Av {
        &self.av
    }

    /// Whether the kernel holds an object for this handle.
    #[inline]
    pub fn is_kernel_ah(&self) -> bool {
        self.kern_handle.is_some()
    }

    fn destroy_impl(&mut self) -> Result<()> {
        if let Some(h) = self.kern_handle {
            self.pd.context().kernel().destroy_ah(h)?;
            self.kern_handle = None;
        }
        Ok(())
    }

    /// Destroy the address handle.
    pub fn destroy(mut self) -> Result<(), DestroyError<Ah>> {
        match self.destroy_impl() {
            Ok(()) => Ok(()),
            Err(e) => Err(DestroyError::new(self, e)),
        }
    }
}

impl Drop for Ah {
    fn drop(&mut self) {
        if let Err(e) = self.destroy_impl() {
            log::error!("rmlx5: cannot destroy AH on drop: {}", e);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::rdma::caps::DeviceCaps;
    use crate::rdma::context::tests::{test_context, test_context_with};
    use crate::config::Config;

    fn global_attr() -> AhAttr {
        let mut dgid = [0u8; 16];
        dgid[10..].copy_from_slice(&[0x02, 0x11, 0x22, 0x33, 0x44, 0x55]);
        AhAttr {
            grh: GlobalRoute {
                dgid: Gid::from(dgid),
                flow_label: 0x12345,
                sgid_index: 3,
                hop_limit: 64,
                traffic_class: 0x20,
            },
            sl: 2,
            static_rate: 1,
            is_global: true,
            port_num: 1,
            ..Default::default()
        }
    }

    #[test]
    fn test_infiniband_av() {
        let (ctx, kernel) = test_context();
        let pd = Pd::new(&ctx).unwrap();
        let attr = AhAttr {
            dlid: 0x1234,
            src_path_bits: 0xff,
            ..global_attr()
        };
        let ah = Ah::new(&pd, &attr).unwrap();
        let av = ah.av();
        assert_eq!(av.rlid(), 0x1234);
        assert_eq!(av.fl_mlid, 0x7f);
        assert_eq!(av.stat_rate_sl, 0x12);
        assert_eq!(av.grh_gid_fl(), (1 << 30) | (3 << 20) | 0x12345);
        assert_eq!(av.rgid, *attr.grh.dgid.raw());
        assert!(!ah.is_kernel_ah());
        assert!(kernel.last_create_ah().is_none());

        let bad_port = AhAttr {
            port_num: 2,
            ..attr
        };
        assert!(Ah::new(&pd, &bad_port).is_err());
    }

    #[test]
    fn test_roce_v2_av() {
        let caps = DeviceCaps {
            link_layers: vec![LinkLayer::Ethernet],
            ..Default::default()
        };
        let (ctx, kernel) = test_context_with(caps, Config::default());
        kernel.set_gid_type(GID_TYPE_ROCE_V2);
        let pd = Pd::new(&ctx).unwrap();

        let local = AhAttr {
            is_global: false,
            ..global_attr()
        };
        assert!(matches!(Ah::new(&pd, &local), Err(Error::InvalidArgument(_))));

        let ah = Ah::new(&pd, &global_attr()).unwrap();
        let av = ah.av();
        assert!(av.rlid() >= ROCE_V2_UDP_SPORT_MIN);
        assert_eq!(av.grh_gid_fl() >> 30, 0);
        assert_eq!(av.rmac, [0x02, 0x11, 0x22, 0x33, 0x44, 0x55]);
        assert!(ah.is_kernel_ah());
        assert_eq!(pd.users(), 1);

        ah.destroy().unwrap();
        assert_eq!(pd.users(), 0);
        pd.destroy().unwrap();
        assert_eq!(kernel.live_objects(), 0);
    }

    #[test]
    fn test_ethernet_without_kernel_ah() {
        let caps = DeviceCaps {
            link_layers: vec![LinkLayer::Ethernet],
            cmds_supp_uhw: UhwCmds::QUERY_DEVICE,
            ..Default::default()
        };
        let (ctx, _kernel) = test_context_with(caps, Config::default());
        let pd = Pd::new(&ctx).unwrap();
        let err = Ah::new(&pd, &global_attr()).unwrap_err();
        assert_eq!(err.errno(), libc::EOPNOTSUPP);
    }
}
