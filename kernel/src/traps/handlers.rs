//! Interrupt and exception handlers.

use x86_64::structures::idt::{InterruptStackFrame, PageFaultErrorCode};

/// IST index used for the double fault handler's dedicated stack.
pub const DOUBLE_FAULT_IST_INDEX: u8 = 1;

/// Breakpoint exception handler (INT 3).
///
/// This is a trap-type exception triggered by the `int3` instruction.
/// It's commonly used for debugging.
///
/// # Safety
///
/// This function must only be called by the CPU as an interrupt handler.
pub extern "x86-interrupt" fn breakpoint_handler(_stack_frame: InterruptStackFrame) {
    klog::info!("breakpoint exception triggered");
}

/// Double fault handler (INT 8).
///
/// Double faults happen when an exception occurs while the CPU is already
/// trying to invoke an exception handler. Runs on its own IST stack since
/// the triggering condition is frequently a blown kernel stack.
pub extern "x86-interrupt" fn double_fault_handler(
    stack_frame: InterruptStackFrame,
    error_code: u64,
) -> ! {
    panic!("double fault (error code {}): {:#?}", error_code, stack_frame);
}

/// Timer interrupt handler (Local APIC timer, periodic).
///
/// Advances the monotonic tick counter and sweeps the alarm sleep queue,
/// waking any thread whose deadline has elapsed. Both run with interrupts
/// disabled by virtue of handler entry, which is what keeps the queue
/// consistent with threads arming timers from thread context.
pub extern "x86-interrupt" fn timer_handler(_stack_frame: InterruptStackFrame) {
    let _scope = crate::arch::interrupts::InterruptScope::enter();
    crate::task::alarm::tick();
    crate::task::alarm::sweep();
    khal::apic::eoi();
}

/// Spurious interrupt handler (vector 0xFF).
///
/// The APIC can raise this when an interrupt is withdrawn before the CPU
/// acknowledges it. No EOI is sent for a genuinely spurious interrupt.
pub extern "x86-interrupt" fn spurious_handler(_stack_frame: InterruptStackFrame) {}

/// Page fault handler (INT 14).
///
/// Consults the faulting thread's supplemental page table: a fault on a
/// tracked page means "not resident" (swapped out or not yet loaded from
/// its backing file), and is resolved by loading it in. A fault on a page
/// the table doesn't know about is a genuine error.
pub extern "x86-interrupt" fn page_fault_handler(
    stack_frame: InterruptStackFrame,
    error_code: PageFaultErrorCode,
) {
    let fault_addr = crate::arch::cpu::read_cr2();

    match crate::memory::spt::resolve_fault(crate::memory::address::VirtAddr::new(fault_addr)) {
        Ok(()) => {}
        Err(_) => {
            panic!(
                "unhandled page fault at {:#x} (error code {:?}): {:#?}",
                fault_addr, error_code, stack_frame
            );
        }
    }
}
