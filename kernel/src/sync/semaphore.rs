//! Counting semaphore with strict priority-ordered wakeup.
//!
//! The building block `sync::lock` and `sync::condvar` are made of.

use alloc::collections::VecDeque;
use alloc::rc::Rc;
use core::cell::RefCell;

use crate::arch::interrupts::{in_interrupt_context, intr_disable, intr_set_level};
use crate::task::scheduler::{thread_block, thread_current, thread_unblock, thread_yield_head};
use crate::task::thread::Thread;

/// `value == 0` whenever `waiters` is non-empty, checked after every public
/// operation returns.
pub struct Semaphore {
    value: u32,
    waiters: VecDeque<Rc<RefCell<Thread>>>,
}

impl Semaphore {
    pub const fn new(value: u32) -> Self {
        Self {
            value,
            waiters: VecDeque::new(),
        }
    }

    pub fn value(&self) -> u32 {
        self.value
    }

    /// Block until the count is positive, then consume one unit. Must not
    /// be called from interrupt context.
    pub fn down(&mut self) {
        debug_assert!(!in_interrupt_context(), "sema_down called from interrupt context");
        let level = intr_disable();
        while self.value == 0 {
            let cur = thread_current();
            self.waiters.push_back(cur);
            // thread_block disables interrupts itself; the caller's level
            // is restored once we're scheduled back in.
            thread_block();
        }
        self.value -= 1;
        intr_set_level(level);
    }

    /// Non-blocking; may be called from interrupt context. Returns whether
    /// a unit was consumed.
    pub fn try_down(&mut self) -> bool {
        let level = intr_disable();
        let acquired = if self.value > 0 {
            self.value -= 1;
            true
        } else {
            false
        };
        intr_set_level(level);
        acquired
    }

    /// Release one unit, waking the highest-(current-)priority waiter if
    /// any. If the waker now outranks the calling thread, yield the CPU to
    /// it immediately.
    pub fn up(&mut self) {
        let level = intr_disable();

        // Sort by descending effective priority, snapshotted now (not at
        // down-time) since donation may have raised a waiter's priority
        // since it queued. Ties keep arrival order (`sort_by` is stable).
        self.waiters
            .make_contiguous()
            .sort_by(|a, b| b.borrow().priority.cmp(&a.borrow().priority));

        let woken = self.waiters.pop_front();
        self.value += 1;

        if let Some(ref t) = woken {
            thread_unblock(t);
        }

        intr_set_level(level);

        if let Some(t) = woken {
            let woke_higher = {
                let caller_prio = thread_current().borrow().priority;
                t.borrow().priority > caller_prio
            };
            if woke_higher {
                thread_yield_head();
            }
        }
    }
}
