use core::num::NonZeroU32;
use derive_more::{Deref, DerefMut};
use indexmap::IndexMap as _IndexMap;
use rustc_hash::FxBuildHasher;
use std::{cell::UnsafeCell, collections::HashMap as _HashMap};

/// A minimal `UnsafeCell` wrapper that is `Sync` when `T: Sync`.
///
/// Used internally to enable interior mutability across threads while
/// correctness is ensured by scheduling (the acquisition protocol grants
/// exactly one thread access to a work-unit body per frame).
#[derive(Debug, Deref, DerefMut)]
#[repr(transparent)]
pub(crate) struct SyncUnsafeCell<T>(UnsafeCell<T>);

unsafe impl<T: Sync> Sync for SyncUnsafeCell<T> {}

impl<T> SyncUnsafeCell<T> {
    pub(crate) fn new(val: T) -> Self {
        Self(UnsafeCell::new(val))
    }

    pub(crate) fn into_inner(self) -> T {
        self.0.into_inner()
    }
}

/// Stable handle of a registered work unit.
///
/// Assigned by the scheduler at registration and never reused within a
/// scheduler's lifetime. Identity and equality of work units are by
/// handle.
pub type UnitId = NonZeroU32;

pub(crate) type HashMap<K, V> = _HashMap<K, V, FxBuildHasher>;
pub(crate) type IndexMap<K, V> = _IndexMap<K, V, FxBuildHasher>;
