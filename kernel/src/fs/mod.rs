//! Read-only filesystem support: a USTAR archive staged by the bootloader
//! as the root filesystem for `memory::mmap`.

pub mod tar;
