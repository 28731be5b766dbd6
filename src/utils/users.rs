//! Use counts for objects whose destroy must fail while dependents remain.

use std::ops::Deref;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;

/// An object that counts its dependents.
pub(crate) trait Counted {
    fn users(&self) -> &AtomicU32;

    #[inline]
    fn user_count(&self) -> u32 {
        self.users().load(Ordering::Acquire)
    }
}

/// A counted reference: the target's use count is held for as long as this
/// value lives.
pub(crate) struct UserRef<T: Counted>(Arc<T>);

impl<T: Counted> UserRef<T> {
    pub fn new(target: &Arc<T>) -> Self {
        target.users().fetch_add(1, Ordering::AcqRel);
        Self(target.clone())
    }

    #[inline]
    pub fn arc(&self) -> &Arc<T> {
        &self.0
    }
}

impl<T: Counted> Clone for UserRef<T> {
    fn clone(&self) -> Self {
        Self::new(&self.0)
    }
}

impl<T: Counted> Deref for UserRef<T> {
    type Target = T;

    #[inline]
    fn deref(&self) -> &T {
        &self.0
    }
}

impl<T: Counted> Drop for UserRef<T> {
    fn drop(&mut self) {
        self.0.users().fetch_sub(1, Ordering::AcqRel);
    }
}
