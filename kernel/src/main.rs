#![cfg_attr(not(test), no_std)]
#![cfg_attr(not(test), no_main)]
#![feature(alloc_error_handler)]

extern crate alloc;

mod arch;
mod fs;
mod memory;
mod sync;
mod task;
mod traps;
mod util;

use arch::x86_64::boot;
use task::scheduler::SCHEDULER;
use task::thread::{Thread, PRI_DEFAULT};

/// APIC timer initial count. Not calibrated against a real tick source
/// (no HPET/PIT calibration in this teaching core) — chosen to give a
/// human-visible tick rate under QEMU's default TSC-deadline emulation.
const TIMER_INITIAL_COUNT: u32 = 10_000_000;

/// Sector count backing the synthetic swap disk: enough slots to evict a
/// handful of frames without claiming to be a production-sized swap area.
const SWAP_DISK_SECTORS: usize = 4096;

const ROOTFS_MODULE_PATH: &str = "rootfs.tar";

/// Kernel entry point called by the Limine bootloader.
///
/// # Safety
/// Called exactly once, by the bootloader, with the CPU in the state
/// Limine's protocol guarantees (long mode, HHDM mapping of all physical
/// memory, interrupts disabled).
#[unsafe(no_mangle)]
unsafe extern "C" fn _start() -> ! {
    assert!(boot::is_base_revision_supported(), "unsupported Limine base revision");

    klog::init();
    klog::info!("booting");

    unsafe {
        memory::address::init_hhdm(boot::get_hhdm_offset());
    }

    memory::pmm::init(boot::get_memory_map());
    memory::heap::init();
    memory::frame::init();
    memory::swap::init(khal::disk::Disk::new(SWAP_DISK_SECTORS));

    mount_rootfs();

    traps::init_idt();
    khal::pic::disable();
    let hhdm_offset = memory::address::hhdm_offset();
    khal::ioapic::init(hhdm_offset);
    let apic_id = khal::apic::init(hhdm_offset);
    khal::apic::enable_timer(khal::apic::TIMER_VECTOR, TIMER_INITIAL_COUNT, khal::apic::TimerDivide::By16);
    klog::info!("local APIC {} online, timer armed", apic_id);

    let boot_thread = Thread::new_current(PRI_DEFAULT);
    SCHEDULER.lock().set_current(boot_thread);

    spawn_demo_threads();

    arch::interrupts::intr_enable();
    klog::info!("boot complete, entering idle loop");

    loop {
        arch::cpu::halt();
    }
}

/// Loads the boot module holding the root filesystem archive (if the
/// bootloader config stages one) and hands its bytes to `memory::mmap` as
/// the disk mmap'd files are read from and written back to.
fn mount_rootfs() {
    let Some((addr, size)) = boot::get_module(ROOTFS_MODULE_PATH) else {
        klog::warn!("no {} module staged, mmap disk left uninitialized", ROOTFS_MODULE_PATH);
        return;
    };

    let ramdisk = unsafe { khal::ramdisk::RamDisk::new(addr, size) };
    let sector_count = ramdisk.sector_count().max(1);
    let mut disk = khal::disk::Disk::new(sector_count);
    let bytes = unsafe { ramdisk.as_slice() };
    for lba in 0..sector_count {
        let start = lba * khal::ramdisk::SECTOR_SIZE;
        let end = (start + khal::ramdisk::SECTOR_SIZE).min(bytes.len());
        let mut sector = [0u8; khal::ramdisk::SECTOR_SIZE];
        sector[..end - start].copy_from_slice(&bytes[start..end]);
        disk.sector_write(lba as u64, &sector);
    }

    memory::mmap::init(disk);
    klog::info!("mounted {} ({} sectors)", ROOTFS_MODULE_PATH, sector_count);
}

/// Spawns a couple of demo threads that exercise the priority scheduler and
/// the alarm queue, so a serial log from a fresh boot shows the subsystems
/// actually running rather than just an idle CPU.
fn spawn_demo_threads() {
    let mut sched = SCHEDULER.lock();
    sched.spawn(PRI_DEFAULT, demo_low_priority_worker);
    sched.spawn(PRI_DEFAULT + 1, demo_high_priority_worker);
}

extern "C" fn demo_low_priority_worker() -> ! {
    loop {
        klog::debug!("demo worker (low priority) tick");
        task::alarm::sleep(50);
    }
}

extern "C" fn demo_high_priority_worker() -> ! {
    loop {
        klog::debug!("demo worker (high priority) tick");
        task::alarm::sleep(30);
    }
}
