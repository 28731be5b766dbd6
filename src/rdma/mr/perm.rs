use bitflags::bitflags;

bitflags! {
    /// Memory region permissions.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    #[repr(transparent)]
    pub struct Permission: u32 {
        const LOCAL_WRITE = 1 << 0;
        const REMOTE_WRITE = 1 << 1;
        const REMOTE_READ = 1 << 2;
        const REMOTE_ATOMIC = 1 << 3;
        const MW_BIND = 1 << 4;
        const ZERO_BASED = 1 << 5;
        const ON_DEMAND = 1 << 6;
    }
}

impl Permission {
    pub const EMPTY: Self = Self::empty();

    /// Whether the adapter requires local write access alongside these
    /// permissions.
    #[inline]
    pub fn needs_local_write(self) -> bool {
        self.intersects(Self::REMOTE_WRITE | Self::REMOTE_ATOMIC)
    }
}

impl Default for Permission {
    /// Allow local write, remote read/write, and remote atomic.
    fn default() -> Self {
        Self::LOCAL_WRITE | Self::REMOTE_READ | Self::REMOTE_WRITE | Self::REMOTE_ATOMIC
    }
}

impl From<Permission> for u32 {
    fn from(p: Permission) -> Self {
        p.bits()
    }
}

bitflags! {
    /// What a re-registration changes.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
    pub struct ReregFlags: u32 {
        /// New address range.
        const CHANGE_TRANSLATION = 1 << 0;
        /// Move to another protection domain.
        const CHANGE_PD = 1 << 1;
        /// New permissions.
        const CHANGE_ACCESS = 1 << 2;
        /// Keep the MR valid while changing it. Not supported.
        const KEEP_VALID = 1 << 3;
    }
}
