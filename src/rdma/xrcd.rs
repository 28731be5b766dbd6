//! Extended reliable connection domains.

use std::fmt;
use std::sync::Arc;

use super::context::Context;
use crate::abi::Handle;
use crate::error::{DestroyError, Result};

pub(crate) struct XrcdInner {
    ctx: Context,
    handle: Handle,
}

impl XrcdInner {
    #[inline]
    pub(crate) fn handle(&self) -> Handle {
        self.handle
    }
}

/// XRC domain. The kernel refuses to close it while XRC SRQs or target QPs
/// use it.
pub struct Xrcd {
    inner: Arc<XrcdInner>,
    live: bool,
}

impl fmt::Debug for Xrcd {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_fmt(format_args!("Xrcd<{}>", self.inner.handle))
    }
}

impl Xrcd {
    /// Open an XRC domain, optionally shared through the inode behind `fd`
    /// (`-1` for a private domain).
    pub fn open(ctx: &Context, fd: i32, oflags: i32) -> Result<Xrcd> {
        let handle = ctx.kernel().open_xrcd(fd, oflags).map_err(|e| {
            log::debug!("rmlx5: open_xrcd failed: {}", e);
            e
        })?;
        Ok(Xrcd {
            inner: Arc::new(XrcdInner {
                ctx: ctx.clone(),
                handle,
            }),
            live: true,
        })
    }

    pub(crate) fn inner(&self) -> &Arc<XrcdInner> {
        &self.inner
    }

    /// Kernel handle.
    #[inline]
    pub fn handle(&self) -> Handle {
        self.inner.handle
    }

    fn close_impl(&mut self) -> Result<()> {
        self.inner.ctx.kernel().close_xrcd(self.inner.handle)?;
        self.live = false;
        Ok(())
    }

    /// Close the domain.
    pub fn close(mut self) -> Result<(), DestroyError<Xrcd>> {
        match self.close_impl() {
            Ok(()) => Ok(()),
            Err(e) => Err(DestroyError::new(self, e)),
        }
    }
}

impl Drop for Xrcd {
    fn drop(&mut self) {
        if self.live {
            if let Err(e) = self.close_impl() {
                log::error!("rmlx5: cannot close XRCD {} on drop: {}", self.inner.handle, e);
            }
        }
    }
}
