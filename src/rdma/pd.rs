//! Protection domains and parent domains.

use std::fmt;
use std::sync::atomic::AtomicU32;
use std::sync::Arc;

use super::bf::Bf;
use super::buf::BufAllocator;
use super::context::Context;
use super::td::{Td, TdInner};
use crate::abi::Handle;
use crate::error::{DestroyError, Error, Result};
use crate::utils::{Counted, UserRef};

/// `comp_mask` bit of [`ParentDomainInitAttr`]: `allocator` is set.
pub const PARENT_DOMAIN_INIT_ATTR_ALLOCATORS: u32 = 1 << 0;

/// Parent domain creation attributes.
#[derive(Clone)]
pub struct ParentDomainInitAttr<'a> {
    /// The base protection domain.
    pub pd: &'a Pd,
    /// Optional thread domain whose register the QPs will use.
    pub td: Option<&'a Td>,
    pub comp_mask: u32,
    /// Buffer allocator for queues created on this domain.
    pub allocator: Option<Arc<dyn BufAllocator>>,
}

impl fmt::Debug for ParentDomainInitAttr<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ParentDomainInitAttr")
            .field("pd", &self.pd.handle())
            .field("td", &self.td.is_some())
            .field("comp_mask", &self.comp_mask)
            .finish()
    }
}

pub(crate) enum PdKind {
    Base,
    Parent {
        base: UserRef<PdInner>,
        td: Option<UserRef<TdInner>>,
        allocator: Option<Arc<dyn BufAllocator>>,
    },
}

/// Ownership holder of a protection domain.
pub(crate) struct PdInner {
    ctx: Context,
    handle: Handle,
    pdn: u32,
    kind: PdKind,
    users: AtomicU32,
}

impl Counted for PdInner {
    fn users(&self) -> &AtomicU32 {
        &self.users
    }
}

impl fmt::Debug for PdInner {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PdInner")
            .field("handle", &self.handle)
            .field("pdn", &self.pdn)
            .field("parent", &self.is_parent())
            .finish()
    }
}

impl PdInner {
    #[inline]
    pub(crate) fn context(&self) -> &Context {
        &self.ctx
    }

    /// Kernel handle. A parent domain answers with its base PD's handle.
    #[inline]
    pub(crate) fn handle(&self) -> Handle {
        self.handle
    }

    #[inline]
    pub(crate) fn is_parent(&self) -> bool {
        matches!(self.kind, PdKind::Parent { .. })
    }

    /// The dedicated register of the attached thread domain.
    pub(crate) fn td_bf(&self) -> Option<&Arc<Bf>> {
        match &self.kind {
            PdKind::Parent { td: Some(td), .. } => Some(td.bf()),
            _ => None,
        }
    }

    pub(crate) fn allocator(&self) -> Option<&Arc<dyn BufAllocator>> {
        match &self.kind {
            PdKind::Parent { allocator, .. } => allocator.as_ref(),
            PdKind::Base => None,
        }
    }
}

/// Protection domain.
///
/// A parent domain is a protection domain as well; it forwards to a base
/// PD and may carry a thread domain and a buffer allocator.
pub struct Pd {
    inner: Arc<PdInner>,
    live: bool,
}

impl fmt::Debug for Pd {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_fmt(format_args!("Pd<{}>", self.inner.pdn))
    }
}

impl Pd {
    /// Allocate a protection domain.
    pub fn new(ctx: &Context) -> Result<Pd> {
        let resp = ctx.kernel().alloc_pd().map_err(|e| {
            log::debug!("rmlx5: alloc_pd failed: {}", e);
            e
        })?;
        Ok(Pd {
            inner: Arc::new(PdInner {
                ctx: ctx.clone(),
                handle: resp.handle,
                pdn: resp.pdn,
                kind: PdKind::Base,
                users: AtomicU32::new(0),
            }),
            live: true,
        })
    }

    /// Create a parent domain over a base protection domain.
    pub fn new_parent(ctx: &Context, attr: ParentDomainInitAttr<'_>) -> Result<Pd> {
        if attr.comp_mask & !PARENT_DOMAIN_INIT_ATTR_ALLOCATORS != 0 {
            log::debug!("rmlx5: unsupported parent domain comp_mask {:#x}", attr.comp_mask);
            return Err(Error::InvalidArgument("parent domain comp_mask"));
        }
        let wants_allocator = attr.comp_mask & PARENT_DOMAIN_INIT_ATTR_ALLOCATORS != 0;
        if wants_allocator != attr.allocator.is_some() {
            return Err(Error::InvalidArgument("parent domain allocator"));
        }
        let base = attr.pd.inner();
        if base.is_parent() {
            return Err(Error::InvalidArgument("parent domain over a parent domain"));
        }
        if !base.ctx.same_as(ctx) {
            return Err(Error::InvalidArgument("PD belongs to another context"));
        }
        if let Some(td) = attr.td {
            if !td.inner().context().same_as(ctx) {
                return Err(Error::InvalidArgument("TD belongs to another context"));
            }
        }

        Ok(Pd {
            inner: Arc::new(PdInner {
                ctx: ctx.clone(),
                handle: base.handle,
                pdn: base.pdn,
                kind: PdKind::Parent {
                    base: UserRef::new(base),
                    td: attr.td.map(|td| UserRef::new(td.inner())),
                    allocator: attr.allocator,
                },
                users: AtomicU32::new(0),
            }),
            live: true,
        })
    }

    pub(crate) fn inner(&self) -> &Arc<PdInner> {
        &self.inner
    }

    /// Get the underlying [`Context`].
    pub fn context(&self) -> &Context {
        &self.inner.ctx
    }

    /// Kernel handle.
    #[inline]
    pub fn handle(&self) -> Handle {
        self.inner.handle
    }

    /// The protection domain number.
    #[inline]
    pub fn pdn(&self) -> u32 {
        self.inner.pdn
    }

    /// Whether this is a parent domain.
    #[inline]
    pub fn is_parent(&self) -> bool {
        self.inner.is_parent()
    }

    /// Number of objects created on this domain that are still alive.
    #[inline]
    pub fn users(&self) -> u32 {
        self.inner.user_count()
    }

    fn destroy_impl(&mut self) -> Result<()> {
        if self.inner.user_count() > 0 {
            return Err(Error::Busy("protection domain"));
        }
        if !self.inner.is_parent() {
            self.inner.ctx.kernel().dealloc_pd(self.inner.handle).map_err(|e| {
                log::debug!("rmlx5: dealloc_pd failed: {}", e);
                e
            })?;
        }
        self.live = false;
        Ok(())
    }

    /// Deallocate the domain. Fails while QPs, SRQs, WQs, MRs, MWs, AHs or
    /// parent domains use it.
    pub fn destroy(mut self) -> Result<(), DestroyError<Pd>> {
        match self.destroy_impl() {
            Ok(()) => Ok(()),
            Err(e) => Err(DestroyError::new(self, e)),
        }
    }
}

impl Drop for Pd {
    fn drop(&mut self) {
        if self.live {
            if let Err(e) = self.destroy_impl() {
                log::error!("rmlx5: cannot deallocate PD {} on drop: {}", self.inner.pdn, e);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::kernel::Op;
    use crate::rdma::buf::tests::HeapAllocator;
    use crate::rdma::context::tests::test_context;

    #[test]
    fn test_parent_domain_pins_base_and_td() -> anyhow::Result<()> {
        let (ctx, kernel) = test_context();
        let pd = Pd::new(&ctx)?;
        let td = Td::new(&ctx, 0)?;
        let parent = Pd::new_parent(
            &ctx,
            ParentDomainInitAttr {
                pd: &pd,
                td: Some(&td),
                comp_mask: 0,
                allocator: None,
            },
        )?;
        assert!(parent.is_parent());
        assert_eq!(parent.handle(), pd.handle());
        assert_eq!(parent.inner().td_bf().map(|bf| bf.uuarn()), Some(td.bf().uuarn()));
        assert_eq!(pd.users(), 1);
        assert_eq!(td.users(), 1);

        let td = match td.destroy() {
            Err(e) => {
                assert!(matches!(e.error, Error::Busy(_)));
                e.into_inner()
            }
            Ok(()) => panic!("TD destroyed while referenced"),
        };
        let pd = match pd.destroy() {
            Err(e) => e.into_inner(),
            Ok(()) => panic!("PD destroyed while referenced"),
        };
        assert_eq!(kernel.live_objects(), 1);

        parent.destroy().unwrap();
        assert_eq!(td.users(), 0);
        td.destroy().unwrap();
        pd.destroy().unwrap();
        assert_eq!(kernel.live_objects(), 0);
        Ok(())
    }

    #[test]
    fn test_parent_domain_validation() {
        let (ctx, _kernel) = test_context();
        let pd = Pd::new(&ctx).unwrap();
        let attr = |comp_mask, allocator: Option<Arc<dyn BufAllocator>>| ParentDomainInitAttr {
            pd: &pd,
            td: None,
            comp_mask,
            allocator,
        };
        assert!(Pd::new_parent(&ctx, attr(1 << 1, None)).is_err());
        assert!(Pd::new_parent(&ctx, attr(PARENT_DOMAIN_INIT_ATTR_ALLOCATORS, None)).is_err());
        assert!(Pd::new_parent(&ctx, attr(0, Some(Arc::new(HeapAllocator::default())))).is_err());

        let parent = Pd::new_parent(
            &ctx,
            attr(
                PARENT_DOMAIN_INIT_ATTR_ALLOCATORS,
                Some(Arc::new(HeapAllocator::default())),
            ),
        )
        .unwrap();
        assert!(parent.inner().allocator().is_some());
        let nested = ParentDomainInitAttr {
            pd: &parent,
            td: None,
            comp_mask: 0,
            allocator: None,
        };
        assert!(Pd::new_parent(&ctx, nested).is_err());

        let (other, _k) = test_context();
        let foreign = ParentDomainInitAttr {
            pd: &pd,
            td: None,
            comp_mask: 0,
            allocator: None,
        };
        assert!(Pd::new_parent(&other, foreign).is_err());
    }

    #[test]
    fn test_kernel_failure_passes_through() {
        let (ctx, kernel) = test_context();
        kernel.fail_next(Op::AllocPd, libc::ENOMEM);
        let err = Pd::new(&ctx).unwrap_err();
        assert_eq!(err.errno(), libc::ENOMEM);

        let pd = Pd::new(&ctx).unwrap();
        kernel.fail_next(Op::DeallocPd, libc::EIO);
        let pd = pd.destroy().unwrap_err().into_inner();
        pd.destroy().unwrap();
    }
}
