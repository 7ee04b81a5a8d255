// Copyright © 2021 VMware, Inc. All Rights Reserved.
// SPDX-License-Identifier: Apache-2.0 OR MIT

//! Shared helpers for the scenario tests.

use core::cell::UnsafeCell;

/// Interior-mutable cell whose mutual exclusion comes from the runtime's own
/// locks rather than the type system; the scenarios assert exactly that
/// exclusion.
pub struct UnsafeSyncCell<T: ?Sized> {
    pub inner: UnsafeCell<T>,
}

impl<T> UnsafeSyncCell<T> {
    pub fn new(v: T) -> Self {
        UnsafeSyncCell {
            inner: UnsafeCell::new(v),
        }
    }
}

unsafe impl<T: ?Sized + Send> Send for UnsafeSyncCell<T> {}
unsafe impl<T: ?Sized + Send> Sync for UnsafeSyncCell<T> {}
