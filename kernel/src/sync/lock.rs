//! Mutual exclusion with transitive priority donation.
//!
//! A thread blocked trying to acquire a held lock temporarily lends its
//! priority to the holder — and, if the holder is itself blocked on
//! another lock, to that lock's holder in turn, and so on. This keeps a
//! high-priority thread from starving behind a chain of lower-priority
//! holders (unbounded priority inversion).

use alloc::rc::{Rc, Weak};
use core::cell::RefCell;

use crate::arch::interrupts::{in_interrupt_context, intr_disable, intr_set_level};
use crate::sync::semaphore::Semaphore;
use crate::task::scheduler::{thread_current, thread_set_priority_other, thread_yield_head, SCHEDULER};
use crate::task::thread::{Priority, Thread, ThreadStatus};

/// Replaces the `PRI_MIN - 1` sentinel a C implementation would reach for
/// with a tagged variant: a lock either has no donor, or a known one.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Donation {
    NoDonation,
    Donated(Priority),
}

pub struct Lock {
    holder: Option<Weak<RefCell<Thread>>>,
    sema: Semaphore,
    /// Maximum effective priority of any thread in the transitive
    /// wait-chain rooted at `holder` waiting to acquire this lock.
    pub donated_priority: Donation,
}

impl Lock {
    pub fn new() -> Rc<RefCell<Lock>> {
        Rc::new(RefCell::new(Self {
            holder: None,
            sema: Semaphore::new(1),
            donated_priority: Donation::NoDonation,
        }))
    }

    pub fn is_held_by(&self, t: &Rc<RefCell<Thread>>) -> bool {
        self.holder
            .as_ref()
            .and_then(Weak::upgrade)
            .is_some_and(|h| Rc::ptr_eq(&h, t))
    }

    pub fn holder(&self) -> Option<Rc<RefCell<Thread>>> {
        self.holder.as_ref().and_then(Weak::upgrade)
    }
}

/// Acquire `lock`, donating priority transitively across any chain of
/// threads it has to wait behind.
///
/// # Panics (debug builds)
/// If called from interrupt context, or if the caller already holds this
/// lock.
pub fn acquire(lock: &Rc<RefCell<Lock>>) {
    debug_assert!(!in_interrupt_context(), "lock_acquire called from interrupt context");
    let caller = thread_current();
    debug_assert!(!lock.borrow().is_held_by(&caller), "recursive lock acquire");

    let level = intr_disable();
    caller.borrow_mut().blocked_on = Some(Rc::downgrade(lock));
    donate_along_chain(lock, &caller);
    intr_set_level(level);

    // Block on the binary semaphore via a raw pointer: no live borrow of
    // `lock`'s RefCell may span this call, because `release` (running on
    // whichever thread currently holds the lock) needs `borrow_mut` on
    // this very `Lock` while we're suspended here.
    let sema_ptr: *mut Semaphore = unsafe { &mut (*lock.as_ptr()).sema };
    unsafe { (*sema_ptr).down() };

    let level = intr_disable();
    lock.borrow_mut().holder = Some(Rc::downgrade(&caller));
    caller.borrow_mut().blocked_on = None;
    insert_held_lock_ordered(&caller, lock.clone());
    intr_set_level(level);
}

/// Walk `holder -> holder.blocked_on -> ...`, raising every thread in the
/// chain that is currently outranked by the caller.
fn donate_along_chain(lock: &Rc<RefCell<Lock>>, caller: &Rc<RefCell<Thread>>) {
    let mut cur_lock = lock.clone();
    loop {
        let Some(thrd) = cur_lock.borrow().holder() else {
            break;
        };

        let caller_prio = caller.borrow().priority;
        if thrd.borrow().priority >= caller_prio {
            break;
        }

        thrd.borrow_mut().donated = true;
        thread_set_priority_other(&thrd, caller_prio, false);

        {
            let mut l = cur_lock.borrow_mut();
            let should_raise = match l.donated_priority {
                Donation::Donated(p) => p < caller_prio,
                Donation::NoDonation => true,
            };
            if should_raise {
                l.donated_priority = Donation::Donated(caller_prio);
            }
        }

        let next_lock = {
            let t = thrd.borrow();
            if t.status == ThreadStatus::Blocked {
                t.blocked_on.as_ref().and_then(Weak::upgrade)
            } else {
                None
            }
        };
        match next_lock {
            Some(next) => cur_lock = next,
            None => break,
        }
    }
}

fn lock_sort_key(l: &Rc<RefCell<Lock>>) -> Priority {
    match l.borrow().donated_priority {
        Donation::Donated(p) => p,
        Donation::NoDonation => 0,
    }
}

/// Insert `lock` into `t`'s held-locks list, keeping it ordered by
/// descending `donated_priority`.
fn insert_held_lock_ordered(t: &Rc<RefCell<Thread>>, lock: Rc<RefCell<Lock>>) {
    let new_key = lock_sort_key(&lock);
    let mut th = t.borrow_mut();
    let pos = th
        .locks_held
        .iter()
        .position(|l| lock_sort_key(l) < new_key)
        .unwrap_or(th.locks_held.len());
    th.locks_held.insert(pos, lock);
}

/// Non-blocking acquire. Never donates; on success the lock is appended to
/// the holder's list unordered, since no donation was involved.
pub fn try_acquire(lock: &Rc<RefCell<Lock>>) -> bool {
    let caller = thread_current();
    debug_assert!(!lock.borrow().is_held_by(&caller), "recursive lock try_acquire");

    let sema_ptr: *mut Semaphore = unsafe { &mut (*lock.as_ptr()).sema };
    let acquired = unsafe { (*sema_ptr).try_down() };

    if acquired {
        let level = intr_disable();
        lock.borrow_mut().holder = Some(Rc::downgrade(&caller));
        caller.borrow_mut().locks_held.push(lock.clone());
        intr_set_level(level);
    }
    acquired
}

/// Release `lock`, waking the highest-priority waiter and handing the CPU
/// to it immediately if it now outranks the caller.
///
/// # Panics (debug builds)
/// If the caller doesn't hold this lock, or is itself blocked elsewhere.
pub fn release(lock: &Rc<RefCell<Lock>>) {
    let caller = thread_current();
    debug_assert!(lock.borrow().is_held_by(&caller), "release of a lock not held by the caller");
    debug_assert!(caller.borrow().blocked_on.is_none(), "release while blocked on another lock");

    let level = intr_disable();
    lock.borrow_mut().holder = None;
    intr_set_level(level);

    let sema_ptr: *mut Semaphore = unsafe { &mut (*lock.as_ptr()).sema };
    unsafe { (*sema_ptr).up() };

    let level = intr_disable();
    caller.borrow_mut().locks_held.retain(|l| !Rc::ptr_eq(l, lock));
    lock.borrow_mut().donated_priority = Donation::NoDonation;
    caller.borrow_mut().refresh_priority_from_locks();
    intr_set_level(level);

    // `up()` above may have checked the yield condition against the
    // caller's still-donated priority (donation hadn't been reverted yet
    // at that point). Re-check now that it has: if some ready thread
    // outranks the caller's restored priority, yield to it before
    // returning, per the "release implies immediate handoff" guarantee.
    let caller_prio = caller.borrow().priority;
    if SCHEDULER.lock().has_higher_priority_ready(caller_prio) {
        thread_yield_head();
    }
}
