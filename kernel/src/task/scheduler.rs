//! Priority scheduler: a ready queue ordered by strict priority, with
//! round-robin among threads of equal priority.
//!
//! Preemption points are timer-tick interrupts and explicit yields; there is
//! no parallelism, so "atomic" means "interrupts disabled." This is the
//! layer `sync::semaphore`, `sync::lock`, `sync::condvar`, and `task::alarm`
//! call into to block and wake threads.

use alloc::collections::VecDeque;
use alloc::rc::Rc;
use core::cell::RefCell;

use crate::arch::interrupts::{intr_disable, intr_set_level};
use crate::sync::spinlock::SpinLock;
use crate::task::thread::{self, Priority, Thread, ThreadStatus};

/// The global scheduler instance.
pub static SCHEDULER: SpinLock<Scheduler> = SpinLock::new(Scheduler::new());

pub struct Scheduler {
    ready: VecDeque<Rc<RefCell<Thread>>>,
    current: Option<Rc<RefCell<Thread>>>,
}

impl Scheduler {
    pub const fn new() -> Self {
        Self {
            ready: VecDeque::new(),
            current: None,
        }
    }

    /// Install the already-running boot thread as `current` without going
    /// through a context switch.
    pub fn set_current(&mut self, t: Rc<RefCell<Thread>>) {
        self.current = Some(t);
    }

    pub fn current(&self) -> Option<Rc<RefCell<Thread>>> {
        self.current.clone()
    }

    /// Create a new thread and enqueue it as ready.
    pub fn spawn(&mut self, priority: Priority, entry: extern "C" fn() -> !) -> Rc<RefCell<Thread>> {
        let t = Thread::new(priority, entry);
        self.ready.push_back(t.clone());
        t
    }

    pub fn ready_count(&self) -> usize {
        self.ready.len()
    }

    /// Remove and return the highest-priority ready thread, breaking ties in
    /// favor of whichever has waited longest (front of the queue).
    fn pick_next(&mut self) -> Option<Rc<RefCell<Thread>>> {
        if self.ready.is_empty() {
            return None;
        }
        let mut best_idx = 0;
        let mut best_prio = self.ready[0].borrow().priority;
        for (i, t) in self.ready.iter().enumerate().skip(1) {
            let p = t.borrow().priority;
            if p > best_prio {
                best_prio = p;
                best_idx = i;
            }
        }
        self.ready.remove(best_idx)
    }

    /// Is any ready thread's priority strictly higher than `prio`?
    pub fn has_higher_priority_ready(&self, prio: Priority) -> bool {
        self.ready.iter().any(|t| t.borrow().priority > prio)
    }
}

/// Dummy target for `context_switch`'s "save old RSP here" pointer when
/// there is no old thread to resume (the dying-thread case).
static mut DEAD_RSP: u64 = 0;

/// Pick the next ready thread and context-switch into it. Drops the
/// scheduler lock before the actual switch so the destination thread's own
/// code can lock the scheduler again once it resumes.
///
/// # Safety
/// Must be called with interrupts disabled.
fn do_schedule() {
    let (old_rsp_ptr, new_rsp) = {
        let mut sched = SCHEDULER.lock();
        let next = match sched.pick_next() {
            Some(t) => t,
            None => return,
        };

        let old = sched.current.take();
        let old_rsp_ptr: *mut u64 = match &old {
            Some(o) => unsafe { &mut (*o.as_ptr()).kernel_rsp as *mut u64 },
            None => &raw mut DEAD_RSP,
        };

        if let Some(o) = old {
            let dying = o.borrow().status == ThreadStatus::Dying;
            if !dying {
                o.borrow_mut().status = ThreadStatus::Ready;
                sched.ready.push_back(o);
            }
        }

        next.borrow_mut().status = ThreadStatus::Running;
        let new_rsp = unsafe { (*next.as_ptr()).kernel_rsp };
        sched.current = Some(next);

        (old_rsp_ptr, new_rsp)
    };

    unsafe {
        thread::context_switch(old_rsp_ptr, new_rsp);
    }
}

/// The currently running thread.
///
/// # Panics
/// If called before the scheduler has a current thread installed.
pub fn thread_current() -> Rc<RefCell<Thread>> {
    SCHEDULER
        .lock()
        .current()
        .expect("thread_current: scheduler has no running thread")
}

/// Block the calling thread. The caller is responsible for having already
/// recorded it somewhere it can be found again (a semaphore's waiter queue,
/// the alarm queue, ...) before calling this.
///
/// Must not be called from interrupt context.
pub fn thread_block() {
    debug_assert!(!crate::arch::interrupts::in_interrupt_context());
    let level = intr_disable();
    if let Some(cur) = SCHEDULER.lock().current() {
        cur.borrow_mut().status = ThreadStatus::Blocked;
    }
    do_schedule();
    intr_set_level(level);
}

/// Move a blocked thread back onto the ready queue. Safe to call from
/// interrupt context (the alarm sweep and `sema_up` both do).
pub fn thread_unblock(t: &Rc<RefCell<Thread>>) {
    let level = intr_disable();
    {
        let mut th = t.borrow_mut();
        debug_assert_eq!(th.status, ThreadStatus::Blocked, "unblocking a non-blocked thread");
        th.status = ThreadStatus::Ready;
    }
    SCHEDULER.lock().ready.push_back(t.clone());
    intr_set_level(level);
}

/// Yield the CPU: the caller stays ready (at the back of its priority
/// class) and the scheduler immediately picks whichever ready thread has
/// the highest priority — typically a thread this call just unblocked.
pub fn thread_yield_head() {
    let level = intr_disable();
    {
        let mut sched = SCHEDULER.lock();
        if let Some(cur) = sched.current.take() {
            cur.borrow_mut().status = ThreadStatus::Ready;
            sched.ready.push_back(cur);
        }
    }
    do_schedule();
    intr_set_level(level);
}

/// Set the current thread's base priority (and, absent any active
/// donation, its effective priority).
pub fn thread_set_priority(prio: Priority) {
    let cur = thread_current();
    {
        let mut t = cur.borrow_mut();
        t.base_priority = prio;
        if !t.donated {
            t.priority = prio;
        }
    }
    // A lower self-assigned priority may no longer beat the best ready
    // thread; yield so the scheduler re-evaluates who should run.
    let should_yield = {
        let t = cur.borrow();
        SCHEDULER.lock().has_higher_priority_ready(t.priority)
    };
    if should_yield {
        thread_yield_head();
    }
}

/// Directly set another thread's effective priority, used by the donation
/// walk in `sync::lock::acquire`. `refresh_base` also updates the thread's
/// base priority; donation never does (`refresh_base = false`).
pub fn thread_set_priority_other(t: &Rc<RefCell<Thread>>, prio: Priority, refresh_base: bool) {
    let mut th = t.borrow_mut();
    if refresh_base {
        th.base_priority = prio;
    }
    th.priority = prio;
}
