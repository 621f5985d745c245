//! Flat, sector-addressed block device.
//!
//! Backs both the swap device and (alongside the read-only ramdisk) the
//! file-system device the kernel mounts a ramdisk tar archive on. Unlike
//! [`crate::ramdisk::RamDisk`], which only ever has to serve boot-time
//! reads, a `Disk` must support writes too — the swap allocator evicts
//! pages onto it.

use alloc::vec;
use alloc::vec::Vec;

/// Sector size in bytes, matching [`crate::ramdisk::SECTOR_SIZE`].
pub const SECTOR_SIZE: usize = 512;

/// A flat block device backed by a contiguous, heap-allocated byte buffer.
///
/// Real hardware would back this with AHCI/NVMe/virtio-blk registers; for
/// an instructional kernel a plain memory buffer exercises the same sector
/// read/write contract without a device driver.
pub struct Disk {
    data: Vec<u8>,
}

impl Disk {
    /// Create a disk of `sector_count` zeroed sectors.
    pub fn new(sector_count: usize) -> Self {
        Self {
            data: vec![0u8; sector_count * SECTOR_SIZE],
        }
    }

    /// Number of `SECTOR_SIZE`-byte sectors on this device.
    #[inline]
    pub fn sector_count(&self) -> usize {
        self.data.len() / SECTOR_SIZE
    }

    /// Read sector `lba` into `buf`. `buf` must be exactly `SECTOR_SIZE` bytes.
    ///
    /// # Panics
    /// If `lba` is out of range or `buf.len() != SECTOR_SIZE`.
    pub fn sector_read(&self, lba: u64, buf: &mut [u8]) {
        assert_eq!(buf.len(), SECTOR_SIZE, "disk: short read buffer");
        let offset = lba as usize * SECTOR_SIZE;
        buf.copy_from_slice(&self.data[offset..offset + SECTOR_SIZE]);
    }

    /// Write `buf` to sector `lba`. `buf` must be exactly `SECTOR_SIZE` bytes.
    ///
    /// # Panics
    /// If `lba` is out of range or `buf.len() != SECTOR_SIZE`.
    pub fn sector_write(&mut self, lba: u64, buf: &[u8]) {
        assert_eq!(buf.len(), SECTOR_SIZE, "disk: short write buffer");
        let offset = lba as usize * SECTOR_SIZE;
        self.data[offset..offset + SECTOR_SIZE].copy_from_slice(buf);
    }
}
