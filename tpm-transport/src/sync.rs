// SPDX-FileCopyrightText: © 2025 Phala Network <dstack@phala.network>
//
// SPDX-License-Identifier: Apache-2.0

//! FIFO-fair mutex
//!
//! `std::sync::Mutex` makes no ordering promise between waiters. Device
//! access must be granted in arrival order, so callers take a ticket and wait
//! until it is served before touching the inner lock.

use std::ops::{Deref, DerefMut};
use std::sync::{Condvar, Mutex, MutexGuard, PoisonError};

#[derive(Debug, Default)]
struct Tickets {
    next: u64,
    serving: u64,
}

#[derive(Debug)]
pub struct FairMutex<T> {
    tickets: Mutex<Tickets>,
    turn: Condvar,
    inner: Mutex<T>,
}

impl<T> FairMutex<T> {
    pub fn new(value: T) -> Self {
        Self {
            tickets: Mutex::new(Tickets::default()),
            turn: Condvar::new(),
            inner: Mutex::new(value),
        }
    }

    /// Block until every earlier caller has released the lock.
    pub fn lock(&self) -> FairMutexGuard<'_, T> {
        let mut tickets = self.tickets.lock().unwrap_or_else(PoisonError::into_inner);
        let ticket = tickets.next;
        tickets.next += 1;
        while tickets.serving != ticket {
            tickets = self
                .turn
                .wait(tickets)
                .unwrap_or_else(PoisonError::into_inner);
        }
        drop(tickets);

        let guard = self.inner.lock().unwrap_or_else(PoisonError::into_inner);
        FairMutexGuard { owner: self, guard }
    }

    /// Number of callers holding or waiting for the lock
    pub fn queue_len(&self) -> u64 {
        let tickets = self.tickets.lock().unwrap_or_else(PoisonError::into_inner);
        tickets.next - tickets.serving
    }

    fn advance(&self) {
        let mut tickets = self.tickets.lock().unwrap_or_else(PoisonError::into_inner);
        tickets.serving += 1;
        drop(tickets);
        self.turn.notify_all();
    }
}

pub struct FairMutexGuard<'a, T> {
    owner: &'a FairMutex<T>,
    guard: MutexGuard<'a, T>,
}

impl<T> Deref for FairMutexGuard<'_, T> {
    type Target = T;

    fn deref(&self) -> &T {
        &self.guard
    }
}

impl<T> DerefMut for FairMutexGuard<'_, T> {
    fn deref_mut(&mut self) -> &mut T {
        &mut self.guard
    }
}

impl<T> Drop for FairMutexGuard<'_, T> {
    fn drop(&mut self) {
        // The next ticket may briefly block on `inner` until our guard field
        // drops; it is the only contender.
        self.owner.advance();
    }
}
