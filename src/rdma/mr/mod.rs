mod perm;

use std::cell::UnsafeCell;
use std::fmt;
use std::marker::PhantomData;

pub use self::perm::*;
use super::pd::{Pd, PdInner};
use crate::abi::*;
use crate::error::{DestroyError, Error, Result};
use crate::utils::UserRef;

/// Local memory region.
///
/// A memory region is a virtual memory space registered to the RDMA device.
/// The registered memory itself does not belong to this type, but it must
/// outlive this type's lifetime (`'mem`) or there can be dangling pointers.
///
/// **Subtyping:** [`Mr<'a>`] is *covariant* over `'a`.
pub struct Mr<'a> {
    pd: UserRef<PdInner>,
    handle: Handle,
    addr: *mut u8,
    len: usize,
    lkey: u32,
    rkey: u32,
    perm: Permission,
    live: bool,
    _marker: PhantomData<&'a UnsafeCell<[u8]>>,
}

// SAFETY: the MR only records the address of memory it does not access.
unsafe impl Send for Mr<'_> {}
unsafe impl Sync for Mr<'_> {}

impl fmt::Debug for Mr<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Mr")
            .field("addr", &self.addr)
            .field("len", &self.len)
            .field("lkey", &self.lkey)
            .finish()
    }
}

fn check_perm(perm: Permission) -> Result<()> {
    if perm.needs_local_write() && !perm.contains(Permission::LOCAL_WRITE) {
        return Err(Error::InvalidArgument("remote write or atomic needs local write"));
    }
    Ok(())
}

impl<'a> Mr<'a> {
    /// Register a memory region with the given protection domain.
    pub fn reg(pd: &Pd, buf: &'a [u8], perm: Permission) -> Result<Self> {
        check_perm(perm)?;
        if buf.is_empty() {
            return Err(Error::InvalidArgument("empty memory region"));
        }
        let cmd = RegMr {
            pd_handle: pd.handle(),
            access_flags: perm.into(),
            start: buf.as_ptr() as u64,
            length: buf.len() as u64,
            hca_va: buf.as_ptr() as u64,
        };
        let resp = pd.context().kernel().reg_mr(&cmd).map_err(|e| {
            log::debug!("rmlx5: reg_mr failed: {}", e);
            e
        })?;
        Ok(Self {
            pd: UserRef::new(pd.inner()),
            handle: resp.handle,
            addr: buf.as_ptr() as *mut u8,
            len: buf.len(),
            lkey: resp.lkey,
            rkey: resp.rkey,
            perm,
            live: true,
            _marker: PhantomData,
        })
    }

    /// Change the translation, protection domain or permissions of the
    /// region in place. The keys may change.
    ///
    /// `pd` is required with [`ReregFlags::CHANGE_PD`], `buf` with
    /// [`ReregFlags::CHANGE_TRANSLATION`] and `perm` with
    /// [`ReregFlags::CHANGE_ACCESS`].
    pub fn rereg(
        &mut self,
        flags: ReregFlags,
        pd: Option<&Pd>,
        buf: Option<&'a [u8]>,
        perm: Option<Permission>,
    ) -> Result<()> {
        if flags.contains(ReregFlags::KEEP_VALID) {
            return Err(Error::NotSupported("rereg_mr with KEEP_VALID"));
        }
        if flags.is_empty() {
            return Err(Error::InvalidArgument("rereg_mr without changes"));
        }

        let new_pd = if flags.contains(ReregFlags::CHANGE_PD) {
            let pd = pd.ok_or(Error::InvalidArgument("rereg_mr needs a PD"))?;
            if !pd.context().same_as(self.pd.context()) {
                return Err(Error::InvalidArgument("PD belongs to another context"));
            }
            Some(pd)
        } else {
            None
        };
        let new_buf = if flags.contains(ReregFlags::CHANGE_TRANSLATION) {
            let buf = buf.ok_or(Error::InvalidArgument("rereg_mr needs a range"))?;
            if buf.is_empty() {
                return Err(Error::InvalidArgument("empty memory region"));
            }
            Some(buf)
        } else {
            None
        };
        let new_perm = if flags.contains(ReregFlags::CHANGE_ACCESS) {
            let perm = perm.ok_or(Error::InvalidArgument("rereg_mr needs permissions"))?;
            check_perm(perm)?;
            Some(perm)
        } else {
            None
        };

        let (addr, len) = match new_buf {
            Some(b) => (b.as_ptr() as *mut u8, b.len()),
            None => (self.addr, self.len),
        };
        let cmd = RereMr {
            mr_handle: self.handle,
            flags: flags.bits(),
            start: addr as u64,
            length: len as u64,
            hca_va: addr as u64,
            pd_handle: new_pd.map_or(self.pd.handle(), Pd::handle),
            access_flags: new_perm.unwrap_or(self.perm).into(),
        };
        let resp = self.pd.context().kernel().rereg_mr(&cmd).map_err(|e| {
            log::debug!("rmlx5: rereg_mr failed: {}", e);
            e
        })?;

        if let Some(pd) = new_pd {
            self.pd = UserRef::new(pd.inner());
        }
        self.addr = addr;
        self.len = len;
        self.perm = new_perm.unwrap_or(self.perm);
        self.lkey = resp.lkey;
        self.rkey = resp.rkey;
        Ok(())
    }

    /// Kernel handle.
    #[inline]
    pub fn handle(&self) -> Handle {
        self.handle
    }

    /// Get the start address of the registered memory area.
    #[inline]
    pub fn addr(&self) -> *mut u8 {
        self.addr
    }

    /// Get the length of the registered memory area.
    #[allow(clippy::len_without_is_empty)]
    #[inline]
    pub fn len(&self) -> usize {
        self.len
    }

    /// Get the local key of the memory region.
    #[inline]
    pub fn lkey(&self) -> u32 {
        self.lkey
    }

    /// Get the remote key of the memory region.
    #[inline]
    pub fn rkey(&self) -> u32 {
        self.rkey
    }

    #[inline]
    pub fn permission(&self) -> Permission {
        self.perm
    }

    fn dereg_impl(&mut self) -> Result<()> {
        self.pd.context().kernel().dereg_mr(self.handle).map_err(|e| {
            log::debug!("rmlx5: dereg_mr failed: {}", e);
            e
        })?;
        self.live = false;
        Ok(())
    }

    /// Deregister the memory region.
    pub fn dereg(mut self) -> Result<(), DestroyError<Self>> {
        match self.dereg_impl() {
            Ok(()) => Ok(()),
            Err(e) => Err(DestroyError::new(self, e)),
        }
    }
}

impl Drop for Mr<'_> {
    fn drop(&mut self) {
        if self.live {
            if let Err(e) = self.dereg_impl() {
                log::error!("rmlx5: cannot dereg MR {:#x} on drop: {}", self.lkey, e);
            }
        }
    }
}

/// Memory window type.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u32)]
pub enum MwType {
    Type1 = 1,
    Type2 = 2,
}

/// Memory window.
pub struct Mw {
    pd: UserRef<PdInner>,
    handle: Handle,
    rkey: u32,
    mw_type: MwType,
    live: bool,
}

impl fmt::Debug for Mw {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Mw")
            .field("rkey", &self.rkey)
            .field("type", &self.mw_type)
            .finish()
    }
}

impl Mw {
    /// Allocate a memory window.
    pub fn alloc(pd: &Pd, mw_type: MwType) -> Result<Mw> {
        let resp = pd.context().kernel().alloc_mw(pd.handle(), mw_type as u32)?;
        Ok(Mw {
            pd: UserRef::new(pd.inner()),
            handle: resp.handle,
            rkey: resp.rkey,
            mw_type,
            live: true,
        })
    }

    #[inline]
    pub fn rkey(&self) -> u32 {
        self.rkey
    }

    #[inline]
    pub fn mw_type(&self) -> MwType {
        self.mw_type
    }

    fn dealloc_impl(&mut self) -> Result<()> {
        self.pd.context().kernel().dealloc_mw(self.handle)?;
        self.live = false;
        Ok(())
    }

    /// Deallocate the memory window.
    pub fn dealloc(mut self) -> Result<(), DestroyError<Self>> {
        match self.dealloc_impl() {
            Ok(()) => Ok(()),
            Err(e) => Err(DestroyError::new(self, e)),
        }
    }
}

impl Drop for Mw {
    fn drop(&mut self) {
        if self.live {
            if let Err(e) = self.dealloc_impl() {
                log::error!("rmlx5: cannot dealloc MW {:#x} on drop: {}", self.rkey, e);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::rdma::context::tests::test_context;

    #[test]
    fn test_mr_pins_pd() -> anyhow::Result<()> {
        let (ctx, kernel) = test_context();
        let pd = Pd::new(&ctx)?;
        let buf = vec![0u8; 4096];
        let mr = Mr::reg(&pd, &buf, Permission::default())?;
        assert_eq!(mr.len(), 4096);
        assert_eq!(mr.addr() as usize, buf.as_ptr() as usize);
        assert_eq!(pd.users(), 1);
        assert_eq!(kernel.users(pd.handle()), Some(1));

        let pd = pd.destroy().unwrap_err().into_inner();
        mr.dereg().unwrap();
        assert_eq!(pd.users(), 0);
        pd.destroy().unwrap();
        assert_eq!(kernel.live_objects(), 0);
        Ok(())
    }

    #[test]
    fn test_permission_checks() {
        let (ctx, _kernel) = test_context();
        let pd = Pd::new(&ctx).unwrap();
        let buf = [0u8; 64];
        assert!(Mr::reg(&pd, &buf, Permission::REMOTE_WRITE).is_err());
        assert!(Mr::reg(&pd, &buf, Permission::REMOTE_READ).is_ok());
        assert!(Mr::reg(&pd, &[], Permission::default()).is_err());
    }

    #[test]
    fn test_rereg_moves_pd_and_range() {
        let (ctx, kernel) = test_context();
        let pd1 = Pd::new(&ctx).unwrap();
        let pd2 = Pd::new(&ctx).unwrap();
        let a = vec![0u8; 128];
        let b = vec![0u8; 256];
        let mut mr = Mr::reg(&pd1, &a, Permission::default()).unwrap();
        let old_key = mr.lkey();

        let err = mr.rereg(ReregFlags::KEEP_VALID, None, None, None).unwrap_err();
        assert_eq!(err.errno(), libc::EOPNOTSUPP);
        assert!(mr.rereg(ReregFlags::CHANGE_PD, None, None, None).is_err());

        mr.rereg(
            ReregFlags::CHANGE_PD | ReregFlags::CHANGE_TRANSLATION,
            Some(&pd2),
            Some(&b),
            None,
        )
        .unwrap();
        assert_ne!(mr.lkey(), old_key);
        assert_eq!(mr.len(), 256);
        assert_eq!(pd1.users(), 0);
        assert_eq!(pd2.users(), 1);
        assert_eq!(kernel.users(pd1.handle()), Some(0));
        assert_eq!(kernel.users(pd2.handle()), Some(1));

        mr.rereg(ReregFlags::CHANGE_ACCESS, None, None, Some(Permission::LOCAL_WRITE))
            .unwrap();
        assert_eq!(mr.permission(), Permission::LOCAL_WRITE);
    }

    #[test]
    fn test_mw_lifecycle() {
        let (ctx, kernel) = test_context();
        let pd = Pd::new(&ctx).unwrap();
        let mw = Mw::alloc(&pd, MwType::Type2).unwrap();
        assert_eq!(mw.mw_type(), MwType::Type2);
        assert_eq!(pd.users(), 1);
        mw.dealloc().unwrap();
        assert_eq!(pd.users(), 0);
        drop(pd);
        assert_eq!(kernel.live_objects(), 0);
    }
}
