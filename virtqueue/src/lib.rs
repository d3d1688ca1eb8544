// Copyright © 2024 Axis Communications AB
//
// SPDX-License-Identifier: Apache-2.0

//! Split-virtqueue engine for a vhost-user device backend.
//!
//! One [`Virtqueue`] tracks the guest-resident descriptor table, available
//! ring and used ring of a single queue. [`Virtqueue::pop`] drains the
//! next pending request into a [`VqElement`], a descriptor chain resolved
//! into device-readable (*out*) and device-writable (*in*) vectors;
//! [`Virtqueue::push`] publishes a completion on the used ring.
//!
//! Only the backend mutates the queue state; the guest is the concurrent
//! peer on the other side of the rings, so `avail.idx` is read with
//! acquire ordering and `used.idx` is published with release ordering.
//! Ring-format violations are not recoverable: a driver handing us a
//! malformed ring is exactly the kind of bug the tests exist to surface,
//! so callers abort on them.

pub mod defs;

use std::mem::size_of;
use std::num::Wrapping;
use std::sync::atomic::Ordering;

use thiserror::Error as ThisError;
use vm_memory::{
    Address, ByteValued, Bytes, GuestAddress, GuestMemory, GuestMemoryError, GuestMemoryMmap,
};

use defs::*;

/// Virtqueue errors. All of these indicate a protocol violation by the
/// guest except `GuestMemory`, which covers ring accesses that faulted.
#[derive(Debug, ThisError)]
pub enum Error {
    /// Failed to access guest memory backing a ring.
    #[error("error accessing guest memory: {0}")]
    GuestMemory(#[source] GuestMemoryError),
    /// A descriptor index was outside the descriptor table.
    #[error("invalid descriptor index {index} (queue size {size})")]
    InvalidDescriptorIndex { index: u16, size: u16 },
    /// A descriptor chain went round in circles.
    #[error("descriptor chain longer than queue size (loop?)")]
    DescriptorChainLoop,
    /// Indirect descriptors are not negotiated.
    #[error("unexpected indirect descriptor")]
    UnexpectedIndirectDescriptor,
    /// A descriptor's buffer is not contained in any mapped region.
    #[error("descriptor buffer {addr:#x}+{len:#x} outside mapped memory")]
    BufferOutOfRange { addr: u64, len: u32 },
    /// The queue was used before being fully configured.
    #[error("virtqueue is not ready")]
    NotReady,
}

type Result<T> = std::result::Result<T, Error>;

/// One entry of the descriptor table.
#[repr(C)]
#[derive(Default, Clone, Copy, Debug)]
pub struct Descriptor {
    addr: u64,
    len: u32,
    flags: u16,
    next: u16,
}

// Safe because Descriptor is a plain packed-layout struct of integers.
unsafe impl ByteValued for Descriptor {}

impl Descriptor {
    pub fn new(addr: u64, len: u32, flags: u16, next: u16) -> Self {
        Descriptor {
            addr,
            len,
            flags,
            next,
        }
    }

    pub fn addr(&self) -> GuestAddress {
        GuestAddress(self.addr)
    }

    pub fn len(&self) -> u32 {
        self.len
    }

    pub fn has_next(&self) -> bool {
        self.flags & VIRTQ_DESC_F_NEXT != 0
    }

    pub fn is_indirect(&self) -> bool {
        self.flags & VIRTQ_DESC_F_INDIRECT != 0
    }

    /// Device-writable, i.e. an *in* buffer from the guest's perspective
    /// of the transfer.
    pub fn is_write_only(&self) -> bool {
        self.flags & VIRTQ_DESC_F_WRITE != 0
    }
}

/// One entry of the used ring.
#[repr(C)]
#[derive(Clone, Copy, Default, Debug)]
pub struct VirtqUsedElem {
    id: u32,
    len: u32,
}

// Safe because VirtqUsedElem is a plain struct of integers.
unsafe impl ByteValued for VirtqUsedElem {}

impl VirtqUsedElem {
    pub fn new(id: u16, len: u32) -> Self {
        VirtqUsedElem {
            id: u32::from(id),
            len,
        }
    }

    pub fn id(&self) -> u32 {
        self.id
    }

    pub fn len(&self) -> u32 {
        self.len
    }
}

/// A guest buffer reference: one descriptor's worth of memory.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Iovec {
    pub addr: GuestAddress,
    pub len: u32,
}

/// A drained request: the descriptor chain of one available-ring entry,
/// partitioned into *out* (guest to device) and *in* (device to guest)
/// buffers, preserving chain order within each group.
#[derive(Debug, Default)]
pub struct VqElement {
    /// Head descriptor index, echoed back on the used ring.
    pub head_index: u16,
    pub out_sg: Vec<Iovec>,
    pub in_sg: Vec<Iovec>,
}

impl VqElement {
    /// Total length of the device-writable buffers, the upper bound for
    /// `used_bytes`.
    pub fn in_len(&self) -> u32 {
        self.in_sg.iter().map(|iov| iov.len).sum()
    }
}

/// State of one split virtqueue.
#[derive(Debug)]
pub struct Virtqueue {
    max_size: u16,
    size: u16,
    ready: bool,
    desc_table: GuestAddress,
    avail_ring: GuestAddress,
    used_ring: GuestAddress,
    next_avail: Wrapping<u16>,
    next_used: Wrapping<u16>,
}

impl Virtqueue {
    pub fn new(max_size: u16) -> Self {
        Virtqueue {
            max_size,
            size: max_size,
            ready: false,
            desc_table: GuestAddress(0),
            avail_ring: GuestAddress(0),
            used_ring: GuestAddress(0),
            next_avail: Wrapping(0),
            next_used: Wrapping(0),
        }
    }

    pub fn max_size(&self) -> u16 {
        self.max_size
    }

    /// The queue size the driver selected.
    pub fn actual_size(&self) -> u16 {
        self.size.min(self.max_size)
    }

    pub fn set_size(&mut self, size: u16) {
        self.size = size;
    }

    pub fn ready(&self) -> bool {
        self.ready
    }

    pub fn set_ready(&mut self, ready: bool) {
        self.ready = ready;
    }

    pub fn set_desc_table_address(&mut self, addr: GuestAddress) {
        self.desc_table = addr;
    }

    pub fn set_avail_ring_address(&mut self, addr: GuestAddress) {
        self.avail_ring = addr;
    }

    pub fn set_used_ring_address(&mut self, addr: GuestAddress) {
        self.used_ring = addr;
    }

    pub fn next_avail(&self) -> u16 {
        self.next_avail.0
    }

    pub fn set_next_avail(&mut self, next_avail: u16) {
        self.next_avail = Wrapping(next_avail);
    }

    pub fn next_used(&self) -> u16 {
        self.next_used.0
    }

    pub fn set_next_used(&mut self, next_used: u16) {
        self.next_used = Wrapping(next_used);
    }

    pub fn reset(&mut self) {
        self.ready = false;
        self.size = self.max_size;
        self.desc_table = GuestAddress(0);
        self.avail_ring = GuestAddress(0);
        self.used_ring = GuestAddress(0);
        self.next_avail = Wrapping(0);
        self.next_used = Wrapping(0);
    }

    /// Check that the configured rings are sane and land inside guest
    /// memory.
    pub fn is_valid(&self, mem: &GuestMemoryMmap) -> bool {
        let size = u64::from(self.actual_size());
        let desc_table_size = VIRTQ_DESCRIPTOR_SIZE * size;
        let avail_ring_size = VIRTQ_AVAIL_RING_META_SIZE + VIRTQ_AVAIL_ELEMENT_SIZE * size;
        let used_ring_size = VIRTQ_USED_RING_META_SIZE + VIRTQ_USED_ELEMENT_SIZE * size;
        if !self.ready {
            false
        } else if self.size > self.max_size || self.size == 0 || !self.size.is_power_of_two() {
            false
        } else if !range_in_memory(mem, self.desc_table, desc_table_size) {
            false
        } else if !range_in_memory(mem, self.avail_ring, avail_ring_size) {
            false
        } else if !range_in_memory(mem, self.used_ring, used_ring_size) {
            false
        } else {
            self.desc_table.mask(0xf) == 0
                && self.avail_ring.mask(0x1) == 0
                && self.used_ring.mask(0x3) == 0
        }
    }

    /// Read the driver's `avail.idx`.
    pub fn avail_idx(&self, mem: &GuestMemoryMmap, order: Ordering) -> Result<Wrapping<u16>> {
        let addr = self.avail_ring.unchecked_add(2);
        mem.load(addr, order).map(Wrapping).map_err(Error::GuestMemory)
    }

    /// Drain the next available request, if any.
    pub fn pop(&mut self, mem: &GuestMemoryMmap) -> Result<Option<VqElement>> {
        if !self.ready {
            return Err(Error::NotReady);
        }

        let avail_idx = self.avail_idx(mem, Ordering::Acquire)?;
        if avail_idx == self.next_avail {
            return Ok(None);
        }

        let size = self.actual_size();
        let slot_offset = VIRTQ_AVAIL_RING_HEADER_SIZE
            + u64::from(self.next_avail.0 % size) * VIRTQ_AVAIL_ELEMENT_SIZE;
        let head_index: u16 = mem
            .load(self.avail_ring.unchecked_add(slot_offset), Ordering::Acquire)
            .map_err(Error::GuestMemory)?;

        let elem = self.walk_chain(mem, head_index)?;
        self.next_avail += Wrapping(1);
        Ok(Some(elem))
    }

    // Walks one descriptor chain, classifying descriptors into out/in
    // vectors. The walk is bounded by the queue size so a next-pointer
    // cycle cannot hang the backend.
    fn walk_chain(&self, mem: &GuestMemoryMmap, head_index: u16) -> Result<VqElement> {
        let size = self.actual_size();
        let mut elem = VqElement {
            head_index,
            ..Default::default()
        };

        let mut index = head_index;
        let mut ttl = size;
        loop {
            if index >= size {
                return Err(Error::InvalidDescriptorIndex { index, size });
            }
            if ttl == 0 {
                return Err(Error::DescriptorChainLoop);
            }
            ttl -= 1;

            let desc_addr = self
                .desc_table
                .unchecked_add(u64::from(index) * size_of::<Descriptor>() as u64);
            let desc: Descriptor = mem.read_obj(desc_addr).map_err(Error::GuestMemory)?;

            if desc.is_indirect() {
                return Err(Error::UnexpectedIndirectDescriptor);
            }
            if desc.len() > 0 && !range_in_memory(mem, desc.addr(), u64::from(desc.len())) {
                return Err(Error::BufferOutOfRange {
                    addr: desc.addr().raw_value(),
                    len: desc.len(),
                });
            }

            let iov = Iovec {
                addr: desc.addr(),
                len: desc.len(),
            };
            if desc.is_write_only() {
                elem.in_sg.push(iov);
            } else {
                elem.out_sg.push(iov);
            }

            if desc.has_next() {
                index = desc.next;
            } else {
                return Ok(elem);
            }
        }
    }

    /// Publish a completed element on the used ring.
    ///
    /// The element write must be visible before the index update, hence
    /// the release store on `used.idx`.
    pub fn push(&mut self, mem: &GuestMemoryMmap, head_index: u16, len: u32) -> Result<()> {
        if head_index >= self.actual_size() {
            return Err(Error::InvalidDescriptorIndex {
                index: head_index,
                size: self.actual_size(),
            });
        }

        let slot = u64::from(self.next_used.0 % self.actual_size());
        let offset = VIRTQ_USED_RING_HEADER_SIZE + slot * VIRTQ_USED_ELEMENT_SIZE;
        mem.write_obj(
            VirtqUsedElem::new(head_index, len),
            self.used_ring.unchecked_add(offset),
        )
        .map_err(Error::GuestMemory)?;

        self.next_used += Wrapping(1);

        mem.store(
            self.next_used.0,
            self.used_ring.unchecked_add(2),
            Ordering::Release,
        )
        .map_err(Error::GuestMemory)
    }

    /// Whether the guest currently wants used-buffer notifications.
    pub fn needs_notification(&self, mem: &GuestMemoryMmap) -> Result<bool> {
        let flags: u16 = mem
            .load(self.avail_ring, Ordering::Acquire)
            .map_err(Error::GuestMemory)?;
        Ok(flags & VRING_AVAIL_F_NO_INTERRUPT == 0)
    }
}

fn range_in_memory(mem: &GuestMemoryMmap, addr: GuestAddress, len: u64) -> bool {
    if len == 0 {
        return mem.address_in_range(addr);
    }
    match addr.checked_add(len - 1) {
        Some(end) => mem.address_in_range(addr) && mem.address_in_range(end),
        None => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const QUEUE_SIZE: u16 = 16;
    const DESC_TABLE: u64 = 0x100;
    const AVAIL_RING: u64 = 0x400;
    const USED_RING: u64 = 0x800;

    fn test_mem() -> GuestMemoryMmap {
        GuestMemoryMmap::from_ranges(&[(GuestAddress(0), 0x10000)]).unwrap()
    }

    fn test_queue() -> Virtqueue {
        let mut vq = Virtqueue::new(QUEUE_SIZE);
        vq.set_desc_table_address(GuestAddress(DESC_TABLE));
        vq.set_avail_ring_address(GuestAddress(AVAIL_RING));
        vq.set_used_ring_address(GuestAddress(USED_RING));
        vq.set_ready(true);
        vq
    }

    fn write_desc(mem: &GuestMemoryMmap, index: u16, desc: Descriptor) {
        let addr = GuestAddress(DESC_TABLE + u64::from(index) * 16);
        mem.write_obj(desc, addr).unwrap();
    }

    fn publish_avail(mem: &GuestMemoryMmap, slot: u16, head: u16, avail_idx: u16) {
        mem.write_obj(head, GuestAddress(AVAIL_RING + 4 + u64::from(slot) * 2))
            .unwrap();
        mem.write_obj(avail_idx, GuestAddress(AVAIL_RING + 2)).unwrap();
    }

    #[test]
    fn pop_empty() {
        let mem = test_mem();
        let mut vq = test_queue();
        assert!(vq.pop(&mem).unwrap().is_none());
    }

    #[test]
    fn pop_not_ready() {
        let mem = test_mem();
        let mut vq = test_queue();
        vq.set_ready(false);
        assert!(matches!(vq.pop(&mem), Err(Error::NotReady)));
    }

    #[test]
    fn pop_single_chain() {
        let mem = test_mem();
        let mut vq = test_queue();

        write_desc(&mem, 0, Descriptor::new(0x2000, 8, VIRTQ_DESC_F_NEXT, 1));
        write_desc(&mem, 1, Descriptor::new(0x3000, 4, VIRTQ_DESC_F_WRITE, 0));
        publish_avail(&mem, 0, 0, 1);

        let elem = vq.pop(&mem).unwrap().unwrap();
        assert_eq!(elem.head_index, 0);
        assert_eq!(
            elem.out_sg,
            vec![Iovec {
                addr: GuestAddress(0x2000),
                len: 8
            }]
        );
        assert_eq!(
            elem.in_sg,
            vec![Iovec {
                addr: GuestAddress(0x3000),
                len: 4
            }]
        );
        assert_eq!(elem.in_len(), 4);
        assert_eq!(vq.next_avail(), 1);

        assert!(vq.pop(&mem).unwrap().is_none());
    }

    #[test]
    fn chain_order_is_preserved_per_group() {
        let mem = test_mem();
        let mut vq = test_queue();

        write_desc(&mem, 2, Descriptor::new(0x2000, 1, VIRTQ_DESC_F_NEXT, 5));
        write_desc(
            &mem,
            5,
            Descriptor::new(0x2100, 2, VIRTQ_DESC_F_WRITE | VIRTQ_DESC_F_NEXT, 3),
        );
        write_desc(&mem, 3, Descriptor::new(0x2200, 3, VIRTQ_DESC_F_NEXT, 4));
        write_desc(&mem, 4, Descriptor::new(0x2300, 4, VIRTQ_DESC_F_WRITE, 0));
        publish_avail(&mem, 0, 2, 1);

        let elem = vq.pop(&mem).unwrap().unwrap();
        assert_eq!(elem.head_index, 2);
        let out_lens: Vec<u32> = elem.out_sg.iter().map(|iov| iov.len).collect();
        let in_lens: Vec<u32> = elem.in_sg.iter().map(|iov| iov.len).collect();
        assert_eq!(out_lens, vec![1, 3]);
        assert_eq!(in_lens, vec![2, 4]);
    }

    #[test]
    fn chain_loop_detected() {
        let mem = test_mem();
        let mut vq = test_queue();

        write_desc(&mem, 0, Descriptor::new(0x2000, 1, VIRTQ_DESC_F_NEXT, 1));
        write_desc(&mem, 1, Descriptor::new(0x2100, 1, VIRTQ_DESC_F_NEXT, 0));
        publish_avail(&mem, 0, 0, 1);

        assert!(matches!(vq.pop(&mem), Err(Error::DescriptorChainLoop)));
    }

    #[test]
    fn descriptor_index_out_of_range() {
        let mem = test_mem();
        let mut vq = test_queue();

        write_desc(&mem, 0, Descriptor::new(0x2000, 1, VIRTQ_DESC_F_NEXT, QUEUE_SIZE));
        publish_avail(&mem, 0, 0, 1);

        assert!(matches!(
            vq.pop(&mem),
            Err(Error::InvalidDescriptorIndex { .. })
        ));
    }

    #[test]
    fn buffer_outside_memory() {
        let mem = test_mem();
        let mut vq = test_queue();

        write_desc(&mem, 0, Descriptor::new(0x2000_0000, 16, 0, 0));
        publish_avail(&mem, 0, 0, 1);

        assert!(matches!(vq.pop(&mem), Err(Error::BufferOutOfRange { .. })));
    }

    #[test]
    fn indirect_rejected() {
        let mem = test_mem();
        let mut vq = test_queue();

        write_desc(&mem, 0, Descriptor::new(0x2000, 16, VIRTQ_DESC_F_INDIRECT, 0));
        publish_avail(&mem, 0, 0, 1);

        assert!(matches!(
            vq.pop(&mem),
            Err(Error::UnexpectedIndirectDescriptor)
        ));
    }

    #[test]
    fn push_publishes_in_order() {
        let mem = test_mem();
        let mut vq = test_queue();

        vq.push(&mem, 3, 1).unwrap();
        vq.push(&mem, 7, 5).unwrap();

        let used_idx: u16 = mem.read_obj(GuestAddress(USED_RING + 2)).unwrap();
        assert_eq!(used_idx, 2);

        let e0: VirtqUsedElem = mem.read_obj(GuestAddress(USED_RING + 4)).unwrap();
        assert_eq!(e0.id(), 3);
        assert_eq!(e0.len(), 1);
        let e1: VirtqUsedElem = mem.read_obj(GuestAddress(USED_RING + 12)).unwrap();
        assert_eq!(e1.id(), 7);
        assert_eq!(e1.len(), 5);
    }

    #[test]
    fn push_increments_used_idx_by_one() {
        let mem = test_mem();
        let mut vq = test_queue();

        for i in 0..5u16 {
            vq.push(&mem, i % QUEUE_SIZE, 0).unwrap();
            let used_idx: u16 = mem.read_obj(GuestAddress(USED_RING + 2)).unwrap();
            assert_eq!(used_idx, i + 1);
        }
    }

    #[test]
    fn push_bad_head_rejected() {
        let mem = test_mem();
        let mut vq = test_queue();
        assert!(vq.push(&mem, QUEUE_SIZE, 0).is_err());
    }

    #[test]
    fn notification_suppression() {
        let mem = test_mem();
        let vq = test_queue();

        mem.write_obj(0u16, GuestAddress(AVAIL_RING)).unwrap();
        assert!(vq.needs_notification(&mem).unwrap());

        mem.write_obj(VRING_AVAIL_F_NO_INTERRUPT, GuestAddress(AVAIL_RING))
            .unwrap();
        assert!(!vq.needs_notification(&mem).unwrap());
    }

    #[test]
    fn ring_validation() {
        let mem = test_mem();
        let mut vq = test_queue();
        assert!(vq.is_valid(&mem));

        vq.set_size(12);
        assert!(!vq.is_valid(&mem));
        vq.set_size(8);
        assert!(vq.is_valid(&mem));

        vq.set_used_ring_address(GuestAddress(0xffff_0000));
        assert!(!vq.is_valid(&mem));
    }
}
