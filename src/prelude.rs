//! The prelude.
//!
//! The purpose of this module is to alleviate imports of common verbs
//! objects and their attributes.

pub use crate::config::Config;
pub use crate::error::{DestroyError, Error};
pub use crate::rdma::ah::{Ah, AhAttr};
pub use crate::rdma::caps::DeviceCaps;
pub use crate::rdma::context::Context;
pub use crate::rdma::cq::{Cq, CqInitAttr};
pub use crate::rdma::flow::{Flow, FlowAttr, FlowSpec};
pub use crate::rdma::gid::Gid;
pub use crate::rdma::mr::{Mr, Mw, Permission};
pub use crate::rdma::pd::Pd;
pub use crate::rdma::qp::{Qp, QpAttr, QpAttrMask, QpBuilder, QpCaps, QpState, QpType};
pub use crate::rdma::srq::{Srq, SrqInitAttr};
pub use crate::rdma::td::Td;
pub use crate::rdma::wq::{RwqIndTable, Wq, WqInitAttr};
pub use crate::rdma::xrcd::Xrcd;
