//! A counting semaphore for reserving resources against a starting capacity.
//!
//! Unlike a plain semaphore, the capacity that can currently be reserved may
//! shrink or grow at runtime based on observed availability (free memory,
//! load average), while a hard ceiling set at construction never changes.
//!
//! Waiters are served in strict FIFO order. When the request at the head of
//! the queue cannot be satisfied, every request behind it keeps waiting even
//! if it would fit. Large requests therefore never starve, at the cost of
//! idle capacity while the head waits.

use std::collections::VecDeque;
use std::sync::{Mutex, MutexGuard};

use tokio::sync::oneshot;
use tracing::info;

use crate::error::SemaphoreError;

struct Waiter {
    amount: i64,
    ready: oneshot::Sender<()>,
}

struct SemaphoreState {
    /// The maximum that can be reserved right now, given the last observed
    /// actual availability.
    cur_size: i64,
    /// The amount currently reserved. May exceed `cur_size` but never
    /// `max_size`.
    reserved: i64,
    waiters: VecDeque<Waiter>,
}

impl SemaphoreState {
    /// Grants queued requests from the front until one does not fit.
    fn run_waiters(&mut self, name: &str) {
        loop {
            let available = self.cur_size - self.reserved;
            match self.waiters.front() {
                None => return,
                Some(w) if w.amount > available => {
                    info!(
                        "Attempted to reserve {} {}, but only {} were available.",
                        w.amount, name, available
                    );
                    return;
                }
                Some(_) => {}
            }
            if let Some(w) = self.waiters.pop_front() {
                self.reserved += w.amount;
                if w.ready.send(()).is_err() {
                    // The waiting task went away; hand the capacity back.
                    self.reserved -= w.amount;
                }
            }
        }
    }
}

/// A queued request. Dropping it before the grant is observed returns the
/// amount, whether or not it was granted in the meantime.
struct PendingAcquire<'a> {
    sem: &'a ResourceSemaphore,
    amount: i64,
    ready: oneshot::Receiver<()>,
    finished: bool,
}

impl Drop for PendingAcquire<'_> {
    fn drop(&mut self) {
        if self.finished {
            return;
        }
        // Grants are only sent under the lock, so none can race the close.
        let mut st = self.sem.lock();
        self.ready.close();
        if self.ready.try_recv().is_ok() {
            st.reserved -= self.amount;
        }
        st.waiters.retain(|w| !w.ready.is_closed());
        st.run_waiters(&self.sem.name);
    }
}

/// A semaphore whose currently-available size tracks observed resource
/// availability.
pub struct ResourceSemaphore {
    name: String,
    /// The maximum that's allowed to be reserved, ever.
    max_size: i64,
    state: Mutex<SemaphoreState>,
}

impl ResourceSemaphore {
    /// Creates a new semaphore with the given capacity.
    ///
    /// `name` is used only in log and error messages, e.g. `"threads"`.
    pub fn new(size: i64, name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            max_size: size,
            state: Mutex::new(SemaphoreState {
                cur_size: size,
                reserved: 0,
                waiters: VecDeque::new(),
            }),
        }
    }

    fn lock(&self) -> MutexGuard<'_, SemaphoreState> {
        // The state is only mutated through this type's methods, none of
        // which leave it half-updated, so a poisoned lock is still usable.
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Returns the diagnostic name of this semaphore.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Returns the hard ceiling set at construction.
    pub fn max_size(&self) -> i64 {
        self.max_size
    }

    /// Reserves `n` of the resource, waiting until it is available.
    ///
    /// Returns an error immediately if `n` is negative or exceeds the
    /// maximum size, since such a request can never be served.
    ///
    /// Dropping the returned future cancels the request. If it was already
    /// granted, the amount is released again.
    pub async fn acquire(&self, n: i64) -> Result<(), SemaphoreError> {
        if n < 0 {
            return Err(SemaphoreError::Negative {
                name: self.name.clone(),
                requested: n,
            });
        }
        if n > self.max_size {
            return Err(SemaphoreError::Unsatisfiable {
                name: self.name.clone(),
                requested: n,
                max: self.max_size,
            });
        }

        let mut pending = {
            let mut st = self.lock();
            let available = st.cur_size - st.reserved;
            if st.waiters.is_empty() && available >= n {
                st.reserved += n;
                return Ok(());
            }
            if st.waiters.is_empty() {
                info!(
                    "Attempted to reserve {} {}, but only {} were available.",
                    n, self.name, available
                );
            }
            let (tx, rx) = oneshot::channel();
            st.waiters.push_back(Waiter {
                amount: n,
                ready: tx,
            });
            PendingAcquire {
                sem: self,
                amount: n,
                ready: rx,
                finished: false,
            }
        };

        let granted = (&mut pending.ready).await;
        pending.finished = true;
        granted.map_err(|_| SemaphoreError::Closed {
            name: self.name.clone(),
        })
    }

    /// Releases `n` of the resource.
    ///
    /// # Panics
    ///
    /// Panics if more is released than is currently reserved.
    pub fn release(&self, n: i64) {
        let mut st = self.lock();
        let reserved = st.reserved - n;
        if reserved < 0 {
            drop(st);
            panic!(
                "semaphore {}: bad release of {} ({} reserved)",
                self.name,
                n,
                reserved + n
            );
        }
        st.reserved = reserved;
        st.run_waiters(&self.name);
    }

    /// Returns the amount of the resource in use, including both
    /// reservations and usage that is unaccounted for.
    pub fn in_use(&self) -> i64 {
        let st = self.lock();
        self.max_size - st.cur_size + st.reserved
    }

    /// Returns the amount explicitly reserved.
    pub fn reserved(&self) -> i64 {
        self.lock().reserved
    }

    /// Returns the amount which could be reserved right now without waiting.
    pub fn available(&self) -> i64 {
        let st = self.lock();
        st.cur_size - st.reserved
    }

    /// Returns the currently reservable size, including what is reserved.
    pub fn current_size(&self) -> i64 {
        self.lock().cur_size
    }

    /// Returns the number of requests waiting on the semaphore.
    pub fn queue_length(&self) -> usize {
        self.lock().waiters.len()
    }

    /// Sets the current actual availability, e.g. from measured free memory.
    ///
    /// Returns the difference between what is actually available plus what
    /// is reserved, and the maximum. A negative value means either a job is
    /// using more than it reserved or something outside the semaphore is
    /// consuming the resource.
    pub fn update_actual(&self, n: i64) -> i64 {
        let mut st = self.lock();
        let actual = n + st.reserved;
        let old_size = st.cur_size;
        st.cur_size = actual.min(self.max_size);
        if old_size < st.cur_size {
            st.run_waiters(&self.name);
        }
        actual - self.max_size
    }

    /// Changes the current size directly, for limits which change while the
    /// actual consumption is invisible.
    pub fn update_size(&self, n: i64) {
        let mut st = self.lock();
        let old_size = st.cur_size;
        st.cur_size = n;
        if old_size < st.cur_size {
            st.run_waiters(&self.name);
        }
    }

    /// Sets the current availability from the free amount and the part of
    /// the reservations which is actually in use.
    ///
    /// Handles the case where, say, 30 of 32 GB are reserved but only 16 GB
    /// have been touched so far, so 16 GB still look free.
    pub fn update_free_used(&self, free: i64, used_reservation: i64) -> i64 {
        let actual = free + used_reservation;
        let mut st = self.lock();
        let old_size = st.cur_size;
        if used_reservation <= st.reserved {
            st.cur_size = actual.min(self.max_size);
        } else {
            // Using more than reserved; shrink the cap by the excess.
            let adjust = used_reservation - st.reserved;
            st.cur_size = (actual - adjust).min(self.max_size - adjust);
        }
        if old_size < st.cur_size {
            st.run_waiters(&self.name);
        }
        actual - self.max_size
    }
}

impl std::fmt::Debug for ResourceSemaphore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let st = self.lock();
        f.debug_struct("ResourceSemaphore")
            .field("name", &self.name)
            .field("max_size", &self.max_size)
            .field("cur_size", &st.cur_size)
            .field("reserved", &st.reserved)
            .field("waiters", &st.waiters.len())
            .finish()
    }
}
