//! Remote virtual-memory primitives and the near-base allocator.
//!
//! The [`VirtualMemory`] trait is the only doorway the engine has into the
//! target process's address space: query a region, allocate, read, write,
//! change protection. The Windows implementation lives in [`crate::os`]; tests
//! substitute an in-process mock.
//!
//! [`find_and_allocate_near_base`] is a port of the `FindAndAllocateNearBase`
//! technique from the Detours library: it walks the target's regions starting
//! at the image base and reserves the first block whose displacement from the
//! base still fits in a 32-bit RVA field.

use crate::{Error, Result, debug};

/// Allocation granularity of the Windows virtual-memory manager (64 KiB).
pub const ALLOCATION_GRANULARITY: u64 = 0x10000;

/// `PAGE_READWRITE` protection flag, mirrored so platform-independent code can
/// request it without pulling in Win32 bindings.
pub const PAGE_READWRITE: u32 = 0x04;

/// Allocation state of one virtual-memory region.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RegionState {
    Free,
    Reserved,
    Committed,
}

/// One region descriptor as reported by the OS.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MemoryRegion {
    pub base: u64,
    pub size: u64,
    pub state: RegionState,
}

impl MemoryRegion {
    /// First address past this region.
    pub fn end(&self) -> u64 {
        self.base + self.size
    }
}

/// The contract the engine requires from a target address space.
///
/// Each operation is individually atomic at the OS level; no multi-step
/// transaction is ever attempted on top of them.
pub trait VirtualMemory {
    /// Describes the region containing `address`.
    fn query_region(&self, address: u64) -> Result<MemoryRegion>;

    /// Reserves and commits `size` readable/writable bytes at `address`.
    ///
    /// Failure here may be transient (another allocator raced us); the
    /// near-base scan tolerates it and probes the next candidate.
    fn allocate(&mut self, address: u64, size: u64) -> Result<u64>;

    /// Fills `buf` from remote memory at `address`.
    fn read(&self, address: u64, buf: &mut [u8]) -> Result<()>;

    /// Writes `data` to remote memory at `address`.
    fn write(&mut self, address: u64, data: &[u8]) -> Result<()>;

    /// Changes the protection of `[address, address + size)` and returns the
    /// previous protection flags.
    fn protect(&mut self, address: u64, size: u64, protection: u32) -> Result<u32>;
}

/// Scans the target's address space upward from `image_base` and reserves a
/// committed, readable/writable block of `bytes_count` bytes close enough to
/// the base for 32-bit RVAs to reach it.
///
/// Returns `Ok(None)` when the scan runs out of address space. The end of the
/// usable range is recognized by the OS reporting a region whose size has all
/// low 12 bits set, which only happens for the reserved region at the top.
/// Individual allocation failures inside a free region are tolerated; the scan
/// simply probes the next granularity boundary.
///
/// # Errors
///
/// Returns [`Error::OutOfRange`] when a candidate block would end more than
/// `u32::MAX` bytes past `image_base` in a 64-bit process (32-bit processes
/// are exempt, every address already fits). Region queries failing is fatal.
pub fn find_and_allocate_near_base(
    memory: &mut impl VirtualMemory,
    image_base: u64,
    bytes_count: u32,
    is_64bit: bool,
) -> Result<Option<u64>> {
    let check_within_bounds = |address: u64| -> Result<()> {
        if is_64bit && address + bytes_count as u64 - 1 - image_base > u32::MAX as u64 {
            Err(Error::OutOfRange {
                address,
                image_base,
            })
        } else {
            Ok(())
        }
    };

    // The probe address only ever moves forward, one region per iteration.
    let mut probe = image_base;
    loop {
        let region = memory.query_region(probe)?;

        // Usermode address space has such an unaligned region size always at
        // the end and only at the end.
        if region.size & 0xfff == 0xfff {
            return Ok(None);
        }

        if region.state == RegionState::Free {
            // The region may start below the image base; candidates never do.
            let candidate = image_base.max(region.base);
            let mut candidate =
                (candidate + ALLOCATION_GRANULARITY - 1) & !(ALLOCATION_GRANULARITY - 1);

            check_within_bounds(candidate)?;
            debug!(
                "free region at {:#x}..{:#x}",
                region.base,
                region.end()
            );

            while candidate < region.end() {
                match memory.allocate(candidate, bytes_count as u64) {
                    Ok(address) => {
                        check_within_bounds(address)?;
                        debug!(
                            "[{:#x}..{:#x}] allocated for the new import directory",
                            address,
                            address + bytes_count as u64
                        );
                        return Ok(Some(address));
                    }
                    Err(err) => {
                        // Lost a race for this spot; try the next boundary.
                        debug!("allocation probe at {:#x} failed: {}", candidate, err);
                    }
                }
                candidate += ALLOCATION_GRANULARITY;
            }
        }

        probe = region.end();
    }
}
