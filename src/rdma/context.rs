use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard, Weak};

use crate::config::Config;
use crate::error::{Error, Result};
use crate::kernel::{Kernel, LoopbackKernel};
use crate::mmap::{AnonMapper, MapKind, MappedPage, Mapper};
use crate::utils::lock;

use super::bf::{BfLayout, BfPool};
use super::caps::DeviceCaps;
use super::dbrec::{Dbrec, DbrecPool};
use super::table::{IndexTable, Resource};

pub(crate) struct ContextInner {
    kernel: Arc<dyn Kernel>,
    mapper: Arc<dyn Mapper>,
    caps: DeviceCaps,
    config: Config,

    bfs: BfPool,
    dbrecs: Arc<DbrecPool>,

    /// Dense user-index table, used when completions carry user indices.
    uidx_table: Mutex<IndexTable<Resource>>,
    /// QPs by QP number, used otherwise.
    qp_table: Mutex<IndexTable<Resource>>,
    /// SRQs by SRQ number.
    srq_table: Mutex<IndexTable<Resource>>,

    pub(crate) core_clock: Option<MappedPage>,
}

/// Device context.
///
/// This type is a simple wrapper of an `Arc` and is guaranteed to have the
/// same memory layout with it.
///
/// A context owns everything that is process-wide for one device: the
/// statically mapped doorbell registers, the dynamic register pool, the
/// doorbell record pages and the resource tables completions are resolved
/// through. Adapter capabilities and configuration are fixed at open time.
#[derive(Clone)]
#[repr(transparent)]
pub struct Context {
    inner: Arc<ContextInner>,
}

impl fmt::Debug for Context {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Context")
            .field("static_bfs", &self.inner.bfs.num_static())
            .field("cqe_version", &self.inner.caps.cqe_version)
            .field("cqe_size", &self.inner.config.cqe_size)
            .finish()
    }
}

impl Context {
    /// Open a context over a kernel command transport and a register mapper.
    ///
    /// Maps the static doorbell registers and, if the adapter exposes one,
    /// the core clock page. A missing clock page only disables
    /// [`Context::read_clock`].
    pub fn open(
        kernel: Arc<dyn Kernel>,
        mapper: Arc<dyn Mapper>,
        caps: DeviceCaps,
        config: Config,
    ) -> Result<Self> {
        if !caps.page_size.is_power_of_two() || caps.page_size < 4096 {
            return Err(Error::InvalidArgument("page size"));
        }
        if caps.link_layers.is_empty() {
            return Err(Error::InvalidArgument("device has no ports"));
        }

        let layout = BfLayout {
            uars_per_page: caps.num_uars_per_page.max(1),
            bf_reg_size: caps.bf_reg_size,
            page_size: caps.page_size,
        };
        let bfs = BfPool::open(
            &*mapper,
            layout,
            caps.tot_uuars,
            caps.low_lat_uuars,
            caps.num_dyn_bfregs,
            config.single_threaded,
        )
        .map_err(|e| {
            log::debug!("rmlx5: cannot map static UARs: {}", e);
            e
        })?;

        let core_clock = if caps.core_clock {
            match mapper.map(MapKind::CoreClock, 0, caps.page_size) {
                Ok(page) => Some(page),
                Err(e) => {
                    log::warn!("rmlx5: failed to map internal clock page: {}", e);
                    None
                }
            }
        } else {
            None
        };

        log::debug!(
            "rmlx5: opened context, {} static BFs, cqe version {}",
            bfs.num_static(),
            caps.cqe_version
        );
        Ok(Context {
            inner: Arc::new(ContextInner {
                kernel,
                mapper,
                dbrecs: DbrecPool::new(caps.page_size),
                caps,
                config,
                bfs,
                uidx_table: Mutex::new(IndexTable::new()),
                qp_table: Mutex::new(IndexTable::new()),
                srq_table: Mutex::new(IndexTable::new()),
                core_clock,
            }),
        })
    }

    /// Open a context backed by the in-process loopback kernel and
    /// anonymous memory.
    pub fn open_loopback(caps: DeviceCaps, config: Config) -> Result<(Self, Arc<LoopbackKernel>)> {
        let kernel = Arc::new(LoopbackKernel::new());
        let ctx = Self::open(kernel.clone(), Arc::new(AnonMapper::new()), caps, config)?;
        Ok((ctx, kernel))
    }

    #[inline]
    pub(crate) fn kernel(&self) -> &dyn Kernel {
        &*self.inner.kernel
    }

    #[inline]
    pub(crate) fn mapper(&self) -> &dyn Mapper {
        &*self.inner.mapper
    }

    /// Adapter capabilities this context was opened with.
    #[inline]
    pub fn caps(&self) -> &DeviceCaps {
        &self.inner.caps
    }

    /// Configuration this context was opened with.
    #[inline]
    pub fn config(&self) -> &Config {
        &self.inner.config
    }

    /// Doorbell registers.
    #[inline]
    pub fn bfs(&self) -> &BfPool {
        &self.inner.bfs
    }

    #[inline]
    pub(crate) fn alloc_dbrec(&self) -> Result<Dbrec> {
        self.inner.dbrecs.alloc()
    }

    /// Number of doorbell record pages currently held.
    pub fn dbrec_pages(&self) -> usize {
        self.inner.dbrecs.num_pages()
    }

    #[inline]
    pub(crate) fn core_clock(&self) -> Option<&MappedPage> {
        self.inner.core_clock.as_ref()
    }

    /// Whether two handles refer to the same context.
    #[inline]
    pub fn same_as(&self, other: &Context) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }

    // --- Resource tables ---

    /// Take a user index with a placeholder entry. The index is released
    /// when the slot drops without [`UidxSlot::commit`].
    pub(crate) fn reserve_uidx(&self) -> Result<UidxSlot<'_>> {
        let uidx = lock(&self.inner.uidx_table)
            .store(Resource::Qp(Weak::new()))
            .map_err(|e| {
                log::debug!("rmlx5: cannot allocate a user index: {}", e);
                e
            })?;
        Ok(UidxSlot {
            ctx: self,
            uidx,
            committed: false,
        })
    }

    pub(crate) fn clear_uidx(&self, uidx: u32) {
        lock(&self.inner.uidx_table).clear(uidx);
    }

    /// The resource registered under a user index.
    pub fn lookup_uidx(&self, uidx: u32) -> Option<Resource> {
        lock(&self.inner.uidx_table).lookup(uidx).cloned()
    }

    /// The QP table, locked. Legacy registration holds this guard across
    /// the kernel command that assigns the QP number.
    #[inline]
    pub(crate) fn qp_table(&self) -> MutexGuard<'_, IndexTable<Resource>> {
        lock(&self.inner.qp_table)
    }

    #[inline]
    pub(crate) fn srq_table(&self) -> MutexGuard<'_, IndexTable<Resource>> {
        lock(&self.inner.srq_table)
    }

    /// The QP registered under a QP number.
    pub fn lookup_qp(&self, qpn: u32) -> Option<Resource> {
        self.qp_table().lookup(qpn).cloned()
    }

    /// The SRQ registered under an SRQ number.
    pub fn lookup_srq(&self, srqn: u32) -> Option<Resource> {
        self.srq_table().lookup(srqn).cloned()
    }
}

/// A reserved user index.
pub(crate) struct UidxSlot<'a> {
    ctx: &'a Context,
    uidx: u32,
    committed: bool,
}

impl UidxSlot<'_> {
    #[inline]
    pub fn uidx(&self) -> u32 {
        self.uidx
    }

    /// Point the index at the finished object and keep it.
    pub fn commit(mut self, resource: Resource) -> Result<u32> {
        lock(&self.ctx.inner.uidx_table).store_at(self.uidx, resource)?;
        self.committed = true;
        Ok(self.uidx)
    }
}

impl Drop for UidxSlot<'_> {
    fn drop(&mut self) {
        if !self.committed {
            self.ctx.clear_uidx(self.uidx);
        }
    }
}
