//! Interrupt level control and context tracking.
//!
//! The synchronization and scheduling subsystems need two things beyond what
//! [`crate::sync::spinlock`] already provides internally: a way to snapshot
//! and restore the interrupt flag across a region that spans a potential
//! thread block (`sema_down`, `lock_acquire`, ...), and a way to tell whether
//! the CPU is currently servicing an interrupt, so blocking primitives can
//! refuse to be called from handler context.

use core::sync::atomic::{AtomicU32, Ordering};

/// Whether interrupts are enabled or disabled, mirroring RFLAGS.IF.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IntrLevel {
    Off,
    On,
}

/// Depth counter incremented on interrupt handler entry, decremented on
/// exit. Greater than zero while any handler is running.
static INTERRUPT_DEPTH: AtomicU32 = AtomicU32::new(0);

/// True while the CPU is executing an interrupt handler.
///
/// Blocking primitives (`sema_down`, `lock_acquire`, `cond_wait`, `sleep`)
/// debug-assert this is false on entry.
pub fn in_interrupt_context() -> bool {
    INTERRUPT_DEPTH.load(Ordering::Relaxed) > 0
}

/// RAII marker for "we are now inside an interrupt handler". Handlers that
/// call into code sensitive to interrupt-context should wrap their body in
/// this, e.g. the timer handler before sweeping the alarm queue.
pub struct InterruptScope;

impl InterruptScope {
    pub fn enter() -> Self {
        INTERRUPT_DEPTH.fetch_add(1, Ordering::Relaxed);
        InterruptScope
    }
}

impl Drop for InterruptScope {
    fn drop(&mut self) {
        INTERRUPT_DEPTH.fetch_sub(1, Ordering::Relaxed);
    }
}

/// Read RFLAGS.IF without altering it.
#[inline(always)]
pub fn intr_get_level() -> IntrLevel {
    let rflags: u64;
    unsafe {
        core::arch::asm!(
            "pushfq",
            "pop {}",
            out(reg) rflags,
            options(nomem, preserves_flags)
        );
    }
    if rflags & (1 << 9) != 0 {
        IntrLevel::On
    } else {
        IntrLevel::Off
    }
}

/// Disable interrupts and return the previous level.
#[inline(always)]
pub fn intr_disable() -> IntrLevel {
    let old = intr_get_level();
    unsafe {
        core::arch::asm!("cli", options(nomem, nostack));
    }
    old
}

/// Enable interrupts and return the previous level.
#[inline(always)]
pub fn intr_enable() -> IntrLevel {
    let old = intr_get_level();
    unsafe {
        core::arch::asm!("sti", options(nomem, nostack));
    }
    old
}

/// Restore a previously saved interrupt level, returning the level that was
/// active just before the call.
#[inline(always)]
pub fn intr_set_level(level: IntrLevel) -> IntrLevel {
    match level {
        IntrLevel::Off => intr_disable(),
        IntrLevel::On => intr_enable(),
    }
}
