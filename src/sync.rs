// Copyright (c) 2022 Octavian Oncescu
// Copyright (c) 2022-2024 The Membercoin Core developers
// Licensed under the Apache License, Version 2.0 see LICENSE-APACHE or
// http://www.apache.org/licenses/LICENSE-2.0 or the MIT license, see
// LICENSE-MIT or http://opensource.org/licenses/MIT

//! Lock-order instrumented mutexes.
//!
//! The chain lock is always taken before the mempool lock; violating that
//! order is a deadlock waiting for the right interleaving. In debug builds
//! every [`OrderedMutex`] acquisition checks the thread's currently held
//! ranks and panics on a violation; release builds compile down to a plain
//! `parking_lot::Mutex`.

use parking_lot::{Mutex, MutexGuard};
use std::ops::{Deref, DerefMut};

/// Global acquisition order. A thread may only acquire a mutex with a rank
/// strictly greater than every rank it already holds.
pub const RANK_CHAIN: u8 = 0;
pub const RANK_MEMPOOL: u8 = 1;
pub const RANK_ORPHANS: u8 = 2;

#[cfg(debug_assertions)]
mod held {
    use std::cell::RefCell;

    thread_local! {
        static HELD: RefCell<Vec<(u8, &'static str)>> = const { RefCell::new(Vec::new()) };
    }

    pub fn acquire(rank: u8, name: &'static str) {
        HELD.with(|held| {
            let mut held = held.borrow_mut();
            if let Some(&(top_rank, top_name)) = held.last() {
                assert!(
                    rank > top_rank,
                    "lock order violation: acquiring '{name}' (rank {rank}) while \
                     holding '{top_name}' (rank {top_rank})"
                );
            }
            held.push((rank, name));
        });
    }

    pub fn release(rank: u8) {
        HELD.with(|held| {
            let mut held = held.borrow_mut();
            if let Some(pos) = held.iter().rposition(|(r, _)| *r == rank) {
                held.remove(pos);
            }
        });
    }
}

pub struct OrderedMutex<T> {
    rank: u8,
    name: &'static str,
    inner: Mutex<T>,
}

impl<T> OrderedMutex<T> {
    #[must_use]
    pub fn new(rank: u8, name: &'static str, value: T) -> Self {
        Self {
            rank,
            name,
            inner: Mutex::new(value),
        }
    }

    pub fn lock(&self) -> OrderedMutexGuard<'_, T> {
        #[cfg(debug_assertions)]
        held::acquire(self.rank, self.name);
        OrderedMutexGuard {
            rank: self.rank,
            guard: self.inner.lock(),
        }
    }
}

pub struct OrderedMutexGuard<'a, T> {
    rank: u8,
    guard: MutexGuard<'a, T>,
}

impl<T> Deref for OrderedMutexGuard<'_, T> {
    type Target = T;

    fn deref(&self) -> &T {
        &self.guard
    }
}

impl<T> DerefMut for OrderedMutexGuard<'_, T> {
    fn deref_mut(&mut self) -> &mut T {
        &mut self.guard
    }
}

impl<T> Drop for OrderedMutexGuard<'_, T> {
    fn drop(&mut self) {
        #[cfg(debug_assertions)]
        held::release(self.rank);
        let _ = self.rank;
    }
}
