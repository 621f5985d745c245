//! Hardware Abstraction Layer.
#![no_std]

extern crate alloc;

pub mod apic;
pub mod disk;
pub mod ioapic;
pub mod pic;
pub mod port;
pub mod ramdisk;
pub mod serial;

pub use serial::Serial;
