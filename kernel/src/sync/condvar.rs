//! Condition variables with Mesa semantics, built on top of `sync::lock`.
//!
//! A waiter must re-check its predicate after `wait` returns: a signal only
//! promises "re-evaluate," not "the condition definitely holds," since
//! another thread may run between the signal and the waiter actually
//! resuming.

use alloc::rc::Rc;
use alloc::vec::Vec;
use core::cell::RefCell;

use crate::sync::lock::{self, Lock};
use crate::sync::semaphore::Semaphore;
use crate::task::scheduler::thread_current;
use crate::task::thread::Priority;

/// One parked waiter: its own private one-shot semaphore, plus the priority
/// it had at the moment it started waiting (used to pick which waiter a
/// `signal` wakes).
struct WaiterSlot {
    sema: Rc<RefCell<Semaphore>>,
    recorded_priority: Priority,
}

pub struct Condvar {
    waiters: Vec<WaiterSlot>,
}

impl Condvar {
    pub const fn new() -> Self {
        Self { waiters: Vec::new() }
    }

    /// Atomically release `guard` and block, then reacquire it before
    /// returning. `lock` must be held by the caller on entry, and is held
    /// by the caller again on return.
    pub fn wait(&mut self, guard: &Rc<RefCell<Lock>>) {
        let recorded_priority = thread_current().borrow().priority;
        let sema = Rc::new(RefCell::new(Semaphore::new(0)));
        self.waiters.push(WaiterSlot {
            sema: sema.clone(),
            recorded_priority,
        });

        lock::release(guard);
        // No lock and no `self` borrow is held here: the condvar's waiters
        // vector has its own entry already recorded, and the private sema
        // is only ever touched by this waiter and by whichever thread
        // signals it.
        let sema_ptr: *mut Semaphore = sema.as_ptr();
        unsafe { (*sema_ptr).down() };

        lock::acquire(guard);
    }

    /// Wake the single highest-priority waiter, if any. `guard` must be held
    /// by the caller (Mesa semantics: the woken thread blocks again on
    /// `guard` before it can run, so the caller's critical section is never
    /// interrupted by the wakeup itself).
    pub fn signal(&mut self, _guard: &Rc<RefCell<Lock>>) {
        if self.waiters.is_empty() {
            return;
        }
        // Manual scan rather than `max_by_key` (which returns the *last* of
        // equal maxima): ties must break FIFO, so only a strictly higher
        // priority replaces the current pick.
        let mut best = 0;
        let mut best_priority = self.waiters[0].recorded_priority;
        for (i, w) in self.waiters.iter().enumerate().skip(1) {
            if w.recorded_priority > best_priority {
                best = i;
                best_priority = w.recorded_priority;
            }
        }
        let slot = self.waiters.remove(best);
        let sema_ptr: *mut Semaphore = slot.sema.as_ptr();
        unsafe { (*sema_ptr).up() };
    }

    /// Wake every waiter.
    pub fn broadcast(&mut self, guard: &Rc<RefCell<Lock>>) {
        while !self.waiters.is_empty() {
            self.signal(guard);
        }
    }

    pub fn has_waiters(&self) -> bool {
        !self.waiters.is_empty()
    }
}

impl Default for Condvar {
    fn default() -> Self {
        Self::new()
    }
}
