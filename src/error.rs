//! Error types shared by every verbs object.

use std::{fmt, io};

use thiserror::Error;

use crate::kernel::KernelError;

/// Errors returned by resource creation, modification and teardown.
#[derive(Debug, Error)]
pub enum Error {
    /// Rejected locally before any kernel command was issued.
    #[error("invalid argument: {0}")]
    InvalidArgument(&'static str),

    /// A requested capability exceeds what the adapter advertises.
    #[error("capability not enough: {0} supports up to {1}, {2} required")]
    CapabilityNotEnough(&'static str, u32, u32),

    /// The adapter or the current configuration cannot honor the request.
    #[error("operation not supported: {0}")]
    NotSupported(&'static str),

    /// The object kind does not implement this operation (e.g. RSS QPs).
    #[error("operation not implemented for {0}")]
    NotImplemented(&'static str),

    /// No free dedicated doorbell register is left.
    #[error("no free dedicated doorbell register")]
    Exhausted,

    /// Local allocation failed (buffer, doorbell record, table slot).
    #[error("out of memory: {0}")]
    OutOfMemory(&'static str),

    /// The object is still referenced by dependents.
    #[error("resource busy: {0} is still referenced")]
    Busy(&'static str),

    /// Configuration could not be parsed.
    #[error("invalid configuration: {0}")]
    Config(String),

    /// The kernel command transport rejected the command.
    #[error(transparent)]
    Kernel(#[from] KernelError),

    /// Mapping device memory failed.
    #[error("I/O error while mapping device memory")]
    Map(#[from] io::Error),
}

impl Error {
    /// The errno-equivalent code of this error.
    pub fn errno(&self) -> i32 {
        match self {
            Error::InvalidArgument(_) | Error::CapabilityNotEnough(..) | Error::Config(_) => {
                libc::EINVAL
            }
            Error::NotSupported(_) => libc::EOPNOTSUPP,
            Error::NotImplemented(_) => libc::ENOSYS,
            Error::Exhausted => libc::ENOENT,
            Error::OutOfMemory(_) => libc::ENOMEM,
            Error::Busy(_) => libc::EBUSY,
            Error::Kernel(e) => e.errno(),
            Error::Map(e) => e.raw_os_error().unwrap_or(libc::ENOMEM),
        }
    }
}

/// Result alias used across the crate.
pub type Result<T, E = Error> = std::result::Result<T, E>;

/// A failed destroy hands the object back so it can be retried later.
#[derive(Error)]
#[error("cannot destroy object: {error}")]
pub struct DestroyError<T> {
    /// The object that could not be destroyed.
    pub object: T,

    /// Why the teardown failed.
    #[source]
    pub error: Error,
}

impl<T> DestroyError<T> {
    pub(crate) fn new(object: T, error: Error) -> Self {
        Self { object, error }
    }

    /// Recover the object.
    pub fn into_inner(self) -> T {
        self.object
    }
}

impl<T> fmt::Debug for DestroyError<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DestroyError")
            .field("error", &self.error)
            .finish_non_exhaustive()
    }
}

impl<T> From<DestroyError<T>> for Error {
    fn from(e: DestroyError<T>) -> Self {
        let DestroyError { object, error } = e;
        drop(object);
        error
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_errno_mapping() {
        assert_eq!(Error::Exhausted.errno(), libc::ENOENT);
        assert_eq!(Error::Busy("td").errno(), libc::EBUSY);
        assert_eq!(Error::NotImplemented("rss qp").errno(), libc::ENOSYS);
        assert_eq!(Error::Kernel(KernelError(libc::EPERM)).errno(), libc::EPERM);
        assert_eq!(Error::CapabilityNotEnough("max_send_wr", 4, 5).errno(), libc::EINVAL);
    }

    #[test]
    fn test_destroy_error_returns_object() {
        let e = DestroyError::new(42u32, Error::Busy("pd"));
        assert!(e.to_string().contains("busy"));
        assert_eq!(e.into_inner(), 42);
    }
}
