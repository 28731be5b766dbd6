//! Thread domains.

use std::fmt;
use std::sync::atomic::AtomicU32;
use std::sync::Arc;

use super::bf::Bf;
use super::context::Context;
use crate::error::{DestroyError, Error, Result};
use crate::utils::Counted;

/// Ownership holder of a thread domain. The dedicated register returns to
/// the pool when the last reference drops.
pub(crate) struct TdInner {
    ctx: Context,
    bf: Arc<Bf>,
    users: AtomicU32,
}

impl Counted for TdInner {
    fn users(&self) -> &AtomicU32 {
        &self.users
    }
}

impl TdInner {
    #[inline]
    pub(crate) fn bf(&self) -> &Arc<Bf> {
        &self.bf
    }

    #[inline]
    pub(crate) fn context(&self) -> &Context {
        &self.ctx
    }
}

impl Drop for TdInner {
    fn drop(&mut self) {
        self.ctx.bfs().release_dedicated(&self.bf);
    }
}

/// Thread domain.
///
/// A thread domain promises that only one thread posts through the QPs of
/// the parent domains it is attached to. In return those QPs ring a
/// dedicated doorbell register without taking a lock.
pub struct Td {
    inner: Arc<TdInner>,
    live: bool,
}

impl fmt::Debug for Td {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Td")
            .field("uuarn", &self.inner.bf.uuarn())
            .field("users", &self.inner.user_count())
            .finish()
    }
}

impl Td {
    /// Allocate a thread domain. `comp_mask` must be zero.
    pub fn new(ctx: &Context, comp_mask: u32) -> Result<Td> {
        if comp_mask != 0 {
            return Err(Error::InvalidArgument("thread domain comp_mask"));
        }
        let bf = ctx.bfs().acquire_dedicated(ctx.mapper()).map_err(|e| {
            log::debug!("rmlx5: cannot allocate a dedicated BF: {}", e);
            e
        })?;
        Ok(Td {
            inner: Arc::new(TdInner {
                ctx: ctx.clone(),
                bf,
                users: AtomicU32::new(0),
            }),
            live: true,
        })
    }

    pub(crate) fn inner(&self) -> &Arc<TdInner> {
        &self.inner
    }

    /// The dedicated doorbell register.
    #[inline]
    pub fn bf(&self) -> &Arc<Bf> {
        &self.inner.bf
    }

    /// Number of parent domains attached to this thread domain.
    #[inline]
    pub fn users(&self) -> u32 {
        self.inner.user_count()
    }

    /// Destroy the thread domain. Fails while a parent domain uses it.
    pub fn destroy(mut self) -> Result<(), DestroyError<Td>> {
        if self.inner.user_count() > 0 {
            return Err(DestroyError::new(self, Error::Busy("thread domain")));
        }
        self.live = false;
        Ok(())
    }
}

impl Drop for Td {
    fn drop(&mut self) {
        if self.live && self.inner.user_count() > 0 {
            log::error!(
                "rmlx5: thread domain dropped while {} parent domains use it",
                self.inner.user_count()
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::rdma::context::tests::test_context_with;
    use crate::rdma::caps::DeviceCaps;
    use crate::config::Config;

    #[test]
    fn test_exhaustion_and_release() {
        let caps = DeviceCaps {
            num_dyn_bfregs: 2,
            ..Default::default()
        };
        let (ctx, _kernel) = test_context_with(caps, Config::default());
        assert!(Td::new(&ctx, 1).is_err());

        let a = Td::new(&ctx, 0).unwrap();
        let b = Td::new(&ctx, 0).unwrap();
        assert!(!a.bf().need_lock());
        assert_ne!(a.bf().uuarn(), b.bf().uuarn());
        assert!(matches!(Td::new(&ctx, 0), Err(Error::Exhausted)));
        assert_eq!(Error::Exhausted.errno(), libc::ENOENT);

        let uuarn = a.bf().uuarn();
        a.destroy().unwrap();
        assert_eq!(ctx.bfs().dedicated_in_use(), 1);
        let c = Td::new(&ctx, 0).unwrap();
        assert_eq!(c.bf().uuarn(), uuarn);
        drop(b);
        drop(c);
        assert_eq!(ctx.bfs().dedicated_in_use(), 0);
    }
}
