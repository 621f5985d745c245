//! Thread control block, priority donation state, and the raw context switch.
//!
//! A `Thread` is always reached through `Rc<RefCell<Thread>>`: this kernel
//! targets a single core, so "shared between threads" never means "shared
//! between cores" — it means "reachable from whichever thread is currently
//! running, with interrupts disabled for the duration of any mutation."
//! Back-pointers (a thread's `blocked_on` lock, a lock's `holder`) are
//! `Weak` so the donation graph's cycles don't leak memory.

use alloc::boxed::Box;
use alloc::rc::{Rc, Weak};
use alloc::vec::Vec;
use core::cell::RefCell;
use core::sync::atomic::{AtomicU64, Ordering};

use crate::sync::lock::Lock;

/// Thread priority. Higher runs first.
pub type Priority = u8;

pub const PRI_MIN: Priority = 0;
pub const PRI_DEFAULT: Priority = 31;
pub const PRI_MAX: Priority = 63;

static NEXT_TID: AtomicU64 = AtomicU64::new(1);

fn alloc_tid() -> u64 {
    NEXT_TID.fetch_add(1, Ordering::Relaxed)
}

/// Scheduling state of a thread.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ThreadStatus {
    Running,
    Ready,
    Blocked,
    Dying,
}

/// Callee-saved register context for `context_switch`.
///
/// The context switch pushes these onto the old thread's kernel stack and
/// pops them from the new thread's kernel stack. Layout must match the
/// push/pop order in `context_switch_asm`.
#[derive(Debug, Clone, Copy)]
#[repr(C)]
#[allow(dead_code)]
pub struct Context {
    pub r15: u64,
    pub r14: u64,
    pub r13: u64,
    pub r12: u64,
    pub rbx: u64,
    pub rbp: u64,
    pub rip: u64,
}

impl Context {
    pub const fn empty() -> Self {
        Self {
            r15: 0,
            r14: 0,
            r13: 0,
            r12: 0,
            rbx: 0,
            rbp: 0,
            rip: 0,
        }
    }
}

/// Size of each thread's kernel-mode stack (32 KiB).
pub const KERNEL_STACK_SIZE: usize = 4096 * 8;

/// An aligned kernel stack.
#[repr(C, align(16))]
pub struct KernelStack {
    pub data: [u8; KERNEL_STACK_SIZE],
}

impl KernelStack {
    /// Top of the stack (stacks grow downward).
    pub fn top(&self) -> u64 {
        self.data.as_ptr() as u64 + KERNEL_STACK_SIZE as u64
    }
}

/// The thread control block.
///
/// Holds both the priority-donation bookkeeping (`sync::lock` and
/// `sync::semaphore` operate on these fields directly) and the scheduling
/// substrate (saved kernel stack pointer, kernel stack storage) needed to
/// actually context-switch between threads.
pub struct Thread {
    pub tid: u64,
    pub base_priority: Priority,
    pub priority: Priority,
    /// Set while `priority` differs from `base_priority` due to donation.
    pub donated: bool,
    pub status: ThreadStatus,
    /// The lock this thread is currently blocked trying to acquire, if any.
    pub blocked_on: Option<Weak<RefCell<Lock>>>,
    /// Locks currently held, ordered by descending `donated_priority`.
    pub locks_held: Vec<Rc<RefCell<Lock>>>,
    /// Tick at which a sleeping thread should wake, if it is sleeping.
    pub wake_tick: Option<u64>,
    /// Saved kernel RSP. Valid only while this thread is not running.
    pub kernel_rsp: u64,
    pub kernel_stack: Box<KernelStack>,
}

impl Thread {
    /// Create a new thread that will begin executing `entry` the first time
    /// it is switched to.
    pub fn new(priority: Priority, entry: extern "C" fn() -> !) -> Rc<RefCell<Thread>> {
        let tid = alloc_tid();
        // Allocate the kernel stack directly on the heap; placing a 32 KiB
        // array on the caller's own stack first would risk overflowing it.
        let kernel_stack = unsafe {
            let layout = core::alloc::Layout::new::<KernelStack>();
            let ptr = alloc::alloc::alloc_zeroed(layout) as *mut KernelStack;
            if ptr.is_null() {
                panic!("failed to allocate kernel stack for thread {}", tid);
            }
            Box::from_raw(ptr)
        };

        let mut thread = Self {
            tid,
            base_priority: priority,
            priority,
            donated: false,
            status: ThreadStatus::Ready,
            blocked_on: None,
            locks_held: Vec::new(),
            wake_tick: None,
            kernel_rsp: 0,
            kernel_stack,
        };
        thread.prepare_initial_stack(entry);
        Rc::new(RefCell::new(thread))
    }

    /// Create the thread object for code that is already running (the boot
    /// thread). Its kernel stack is whatever the CPU is currently using;
    /// `kernel_rsp` is filled in the first time it's switched *away from*.
    pub fn new_current(priority: Priority) -> Rc<RefCell<Thread>> {
        let tid = alloc_tid();
        let kernel_stack = unsafe {
            let layout = core::alloc::Layout::new::<KernelStack>();
            let ptr = alloc::alloc::alloc_zeroed(layout) as *mut KernelStack;
            if ptr.is_null() {
                panic!("failed to allocate kernel stack for thread {}", tid);
            }
            Box::from_raw(ptr)
        };

        Rc::new(RefCell::new(Self {
            tid,
            base_priority: priority,
            priority,
            donated: false,
            status: ThreadStatus::Running,
            blocked_on: None,
            locks_held: Vec::new(),
            wake_tick: None,
            kernel_rsp: 0,
            kernel_stack,
        }))
    }

    /// Lay out the kernel stack so that when `context_switch` pops from it
    /// for the first time, execution arrives at `entry`.
    fn prepare_initial_stack(&mut self, entry: extern "C" fn() -> !) {
        let top = self.kernel_stack.top();
        let sp = top - 7 * 8;

        // SAFETY: we own this stack and it's big enough.
        unsafe {
            let ptr = sp as *mut u64;
            // Must match the pop order in context_switch_asm:
            //   pop r15, pop r14, pop r13, pop r12, pop rbx, pop rbp, ret
            ptr.add(0).write(0);
            ptr.add(1).write(0);
            ptr.add(2).write(0);
            ptr.add(3).write(0);
            ptr.add(4).write(0);
            ptr.add(5).write(0);
            ptr.add(6).write(entry as u64);
        }

        self.kernel_rsp = sp;
    }

    /// Effective priority inherited by a thread holding no donated locks.
    pub fn refresh_priority_from_locks(&mut self) {
        match self.locks_held.iter().filter_map(|lock| {
            match lock.borrow().donated_priority {
                crate::sync::lock::Donation::Donated(p) => Some(p),
                crate::sync::lock::Donation::NoDonation => None,
            }
        }).max() {
            Some(p) => {
                self.donated = true;
                self.priority = p;
            }
            None => {
                self.donated = false;
                self.priority = self.base_priority;
            }
        }
    }
}

core::arch::global_asm!(
    ".global context_switch_asm",
    "context_switch_asm:",
    // rdi = &mut old.kernel_rsp
    // rsi = new.kernel_rsp
    "push rbp",
    "push rbx",
    "push r12",
    "push r13",
    "push r14",
    "push r15",
    "mov [rdi], rsp",
    "mov rsp, rsi",
    "pop r15",
    "pop r14",
    "pop r13",
    "pop r12",
    "pop rbx",
    "pop rbp",
    "ret",
);

extern "C" {
    fn context_switch_asm(old_rsp_ptr: *mut u64, new_rsp: u64);
}

/// Switch from the thread whose kernel RSP lives at `old_rsp_ptr` to the
/// thread whose saved RSP is `new_rsp`.
///
/// # Safety
/// Both RSP values must point at valid, correctly laid-out kernel stacks,
/// and interrupts must be disabled by the caller.
pub unsafe fn context_switch(old_rsp_ptr: *mut u64, new_rsp: u64) {
    unsafe {
        context_switch_asm(old_rsp_ptr, new_rsp);
    }
}
