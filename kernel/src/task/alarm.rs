//! Monotonic tick counter and the timer-alarm sleep queue.
//!
//! `sleep` is armed from thread context; `sweep` runs from the timer
//! interrupt handler and wakes every thread whose deadline has passed.
//! Insertion and removal both run with interrupts disabled, so a thread
//! can never be swept before its own `wake_tick` write is visible, and the
//! sweep can never race a second `sleep` call touching the same queue.

use alloc::rc::{Rc, Weak};
use alloc::vec::Vec;
use core::cell::RefCell;
use core::sync::atomic::{AtomicU64, Ordering};

use crate::arch::interrupts::{intr_disable, intr_set_level};
use crate::sync::spinlock::SpinLock;
use crate::task::scheduler::{thread_block, thread_current, thread_unblock};
use crate::task::thread::Thread;

static TICKS: AtomicU64 = AtomicU64::new(0);

/// Advance the tick counter by one. Called once per timer interrupt.
pub fn tick() {
    TICKS.fetch_add(1, Ordering::Relaxed);
}

/// The current tick count.
pub fn now() -> u64 {
    TICKS.load(Ordering::Relaxed)
}

/// Threads currently sleeping, keyed by their own `wake_tick` field. A
/// `Weak` reference so a thread that dies before waking doesn't keep this
/// queue alive, and so the queue holds no ownership stake in the thread.
static ALARM_QUEUE: SpinLock<Vec<Weak<RefCell<Thread>>>> = SpinLock::new(Vec::new());

/// Block the calling thread until at least `ticks` timer ticks have
/// elapsed. A no-op for `ticks == 0`. Must not be called from interrupt
/// context.
pub fn sleep(ticks: u64) {
    debug_assert!(!crate::arch::interrupts::in_interrupt_context());
    if ticks == 0 {
        return;
    }

    let level = intr_disable();
    let wake = now() + ticks;
    let cur = thread_current();
    cur.borrow_mut().wake_tick = Some(wake);
    ALARM_QUEUE.lock().push(Rc::downgrade(&cur));
    // thread_block disables interrupts itself and restores them on the
    // way back out, but we still hold `level` from before — restore it
    // only after the thread has actually been scheduled away and back.
    thread_block();
    intr_set_level(level);
}

/// Scan the alarm queue once, waking every thread whose deadline has
/// passed. Called from the timer interrupt handler; runs with interrupts
/// already disabled by virtue of handler entry.
pub fn sweep() {
    let now = now();
    let mut queue = ALARM_QUEUE.lock();
    queue.retain(|weak| {
        let Some(t) = weak.upgrade() else {
            return false;
        };
        let due = matches!(t.borrow().wake_tick, Some(w) if w <= now);
        if due {
            t.borrow_mut().wake_tick = None;
            thread_unblock(&t);
            false
        } else {
            true
        }
    });
}
