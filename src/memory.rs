// Copyright © 2024 Axis Communications AB
//
// SPDX-License-Identifier: Apache-2.0

//! Guest memory tables received over vhost-user.
//!
//! A `SET_MEM_TABLE` message carries one file descriptor per region plus
//! the region geometry. The regions are mmapped into our address space
//! through `vm-memory`, which owns the mappings; the resulting
//! [`GuestMemoryMmap`] is shared out as an `Arc` so that in-flight queue
//! elements (including parked GPIO IRQ elements) keep an old table alive
//! until they retire, even if the frontend installs a new one.

use std::fs::File;
use std::os::unix::io::{FromRawFd, RawFd};
use std::sync::Arc;

use thiserror::Error as ThisError;
use vhost_user::message::VhostUserMemoryRegion;
use vm_memory::{Bytes, FileOffset, GuestAddress, GuestMemory, GuestMemoryMmap};

#[derive(Debug, ThisError)]
pub enum Error {
    /// A guest range is unmapped or crosses a region boundary.
    #[error("invalid guest address range {addr:#x}+{len:#x}")]
    InvalidGuestRange { addr: u64, len: usize },
    /// Failed to mmap the regions of a memory table.
    #[error("failed to map guest memory: {0}")]
    Map(#[source] vm_memory::Error),
    /// A vring address did not fall inside any region.
    #[error("vring address {0:#x} not covered by the memory table")]
    UnmappedVringAddress(u64),
}

type Result<T> = std::result::Result<T, Error>;

// Ring addresses arrive in the frontend's virtual address space; this
// records enough of the table to translate them to guest-physical.
struct AddrMapping {
    vmm_addr: u64,
    size: u64,
    gpa_base: u64,
}

/// One installed memory table.
pub struct GuestRam {
    mem: Arc<GuestMemoryMmap>,
    mappings: Vec<AddrMapping>,
}

impl GuestRam {
    /// Map the regions of a `SET_MEM_TABLE` message. Takes ownership of
    /// the file descriptors; they are closed when the mappings go away.
    pub fn new(regions: &[VhostUserMemoryRegion], fds: &[RawFd]) -> Result<Self> {
        let mut ranges: Vec<(GuestAddress, usize, Option<FileOffset>)> = Vec::new();
        let mut mappings: Vec<AddrMapping> = Vec::new();

        for (region, &fd) in regions.iter().zip(fds.iter()) {
            // Safe because the fd arrived via SCM_RIGHTS and is ours to own.
            let file = unsafe { File::from_raw_fd(fd) };
            ranges.push((
                GuestAddress(region.guest_phys_addr),
                region.memory_size as usize,
                Some(FileOffset::new(file, region.mmap_offset)),
            ));
            mappings.push(AddrMapping {
                vmm_addr: region.user_addr,
                size: region.memory_size,
                gpa_base: region.guest_phys_addr,
            });
        }

        ranges.sort_by_key(|(addr, _, _)| addr.0);
        let mem = GuestMemoryMmap::from_ranges_with_files(ranges).map_err(Error::Map)?;
        Ok(GuestRam {
            mem: Arc::new(mem),
            mappings,
        })
    }

    #[cfg(test)]
    pub fn from_mem(mem: GuestMemoryMmap) -> Self {
        GuestRam {
            mem: Arc::new(mem),
            mappings: Vec::new(),
        }
    }

    pub fn mem(&self) -> &Arc<GuestMemoryMmap> {
        &self.mem
    }

    /// Translate a frontend virtual address (as used in `SET_VRING_ADDR`)
    /// to a guest physical address.
    pub fn vmm_va_to_gpa(&self, vmm_va: u64) -> Result<u64> {
        for mapping in self.mappings.iter() {
            if vmm_va >= mapping.vmm_addr && vmm_va - mapping.vmm_addr < mapping.size {
                return Ok(vmm_va - mapping.vmm_addr + mapping.gpa_base);
            }
        }
        Err(Error::UnmappedVringAddress(vmm_va))
    }
}

/// Copy `len` bytes out of guest memory.
///
/// The range must lie within a single mapped region; requests that would
/// need splicing across regions fail like unmapped ones do.
pub fn read_guest(mem: &GuestMemoryMmap, addr: GuestAddress, len: usize) -> Result<Vec<u8>> {
    let slice = mem.get_slice(addr, len).map_err(|_| Error::InvalidGuestRange {
        addr: addr.0,
        len,
    })?;
    let mut buf = vec![0u8; len];
    slice.copy_to(&mut buf[..]);
    Ok(buf)
}

/// Copy bytes into guest memory; the dual of [`read_guest`].
pub fn write_guest(mem: &GuestMemoryMmap, addr: GuestAddress, data: &[u8]) -> Result<()> {
    let slice = mem
        .get_slice(addr, data.len())
        .map_err(|_| Error::InvalidGuestRange {
            addr: addr.0,
            len: data.len(),
        })?;
    slice.copy_from(data);
    Ok(())
}

/// Read a single byte-valued object at a guest address.
pub fn read_obj<T: vm_memory::ByteValued>(mem: &GuestMemoryMmap, addr: GuestAddress) -> Result<T> {
    mem.read_obj(addr).map_err(|_| Error::InvalidGuestRange {
        addr: addr.0,
        len: std::mem::size_of::<T>(),
    })
}

/// Write a single byte-valued object at a guest address.
pub fn write_obj<T: vm_memory::ByteValued>(
    mem: &GuestMemoryMmap,
    val: T,
    addr: GuestAddress,
) -> Result<()> {
    mem.write_obj(val, addr).map_err(|_| Error::InvalidGuestRange {
        addr: addr.0,
        len: std::mem::size_of::<T>(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn guest_round_trip() {
        let mem = GuestMemoryMmap::from_ranges(&[(GuestAddress(0), 0x4000)]).unwrap();
        let data = [0xde, 0xad, 0xbe, 0xef];
        write_guest(&mem, GuestAddress(0x1000), &data).unwrap();
        assert_eq!(read_guest(&mem, GuestAddress(0x1000), 4).unwrap(), data);
    }

    #[test]
    fn unmapped_range_rejected() {
        let mem = GuestMemoryMmap::from_ranges(&[(GuestAddress(0), 0x1000)]).unwrap();
        assert!(read_guest(&mem, GuestAddress(0x1000), 1).is_err());
        assert!(write_guest(&mem, GuestAddress(0xff0), &[0u8; 32]).is_err());
    }

    #[test]
    fn no_cross_region_splicing() {
        let mem = GuestMemoryMmap::from_ranges(&[
            (GuestAddress(0), 0x1000),
            (GuestAddress(0x1000), 0x1000),
        ])
        .unwrap();
        // The regions are contiguous in guest physical space but distinct
        // mappings; a straddling access must be refused.
        assert!(read_guest(&mem, GuestAddress(0xff8), 16).is_err());
    }
}
