//! Userspace plumbing of an mlx5-style RDMA provider.
//!
//! `rmlx5` prepares everything the adapter reads straight from process
//! memory: work queue buffers sized to the adapter's rules, doorbell
//! records, doorbell registers and completion rings. Object creation and
//! state changes are delegated to the kernel through the [`Kernel`] trait,
//! one synchronous command per call.
//!
//! Resource holder types ([`Context`], [`Pd`], [`Cq`], [`Qp`], [`Srq`] and
//! the rest) own their kernel object and destroy it on drop. Objects that
//! others depend on are pinned by a use count, so destroying a [`Pd`] that
//! still has QPs fails with [`Error::Busy`] and hands the object back
//! through [`DestroyError`].
//!
//! The context also keeps the lookup tables that map the resource numbers
//! reported in completion entries back to their QPs and SRQs, and scrubs a
//! departing resource's completions out of its CQs.
//!
//! # Example
//!
//! ```rust
//! use rmlx5::prelude::*;
//! use anyhow::Result;
//!
//! fn main() -> Result<()> {
//!     let (context, _kernel) = Context::open_loopback(DeviceCaps::default(), Config::default())?;
//!     let pd = Pd::new(&context)?;
//!     let cq = Cq::new(&context, 128)?;
//!
//!     let qp = QpBuilder::new()
//!         .qp_type(QpType::Rc)
//!         .send_cq(&cq)
//!         .recv_cq(&cq)
//!         .caps(QpCaps::new(16, 16, 1, 1, 0))
//!         .build(&pd)?;
//!     assert!(context.lookup_uidx(qp.uidx().unwrap()).is_some());
//!     Ok(())
//! }
//! ```

pub mod abi;
pub mod config;
pub mod error;
pub mod kernel;
pub mod mmap;
pub mod prelude;
pub mod rdma;
mod utils;

pub use config::Config;
pub use error::{DestroyError, Error, Result};
pub use kernel::{Kernel, KernelError};
pub use rdma::ah::Ah;
pub use rdma::context::Context;
pub use rdma::cq::Cq;
pub use rdma::gid::Gid;
pub use rdma::mr::{Mr, Mw};
pub use rdma::pd::Pd;
pub use rdma::qp::{Qp, QpBuilder};
pub use rdma::srq::Srq;
pub use rdma::wq::{RwqIndTable, Wq};
pub use rdma::xrcd::Xrcd;
