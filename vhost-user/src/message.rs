// Copyright © 2024 Axis Communications AB
//
// SPDX-License-Identifier: Apache-2.0

//! Wire format of the vhost-user protocol, backend side.
//!
//! A message is a 12-byte header (`request`, `flags`, `size`) followed by
//! `size` bytes of payload. File descriptors ride along as `SCM_RIGHTS`
//! ancillary data on the requests that carry them.

use std::mem;

use bitflags::bitflags;

/// Upper bound for the payload of a single message. Only `SET_MEM_TABLE`
/// and the config-space accesses have variable sizes and both fit well
/// below this.
pub const MAX_MSG_SIZE: usize = 0x1000;

/// Maximum number of file descriptors attached to one message. Bounds the
/// number of memory regions a frontend can hand us in one table.
pub const MAX_ATTACHED_FD_ENTRIES: usize = 32;

/// Requests sent by the frontend (the guest side) to the backend.
#[repr(u32)]
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum FrontendReq {
    /// Get the supported feature bit mask.
    GetFeatures = 1,
    /// Enable features using a bit mask.
    SetFeatures = 2,
    /// Claim the session.
    SetOwner = 3,
    /// Release the session.
    ResetOwner = 4,
    /// Install the memory map used to translate ring and buffer addresses.
    SetMemTable = 5,
    /// Set the size of a queue.
    SetVringNum = 8,
    /// Set the addresses of the rings of a queue.
    SetVringAddr = 9,
    /// Set the base offset of the available ring.
    SetVringBase = 10,
    /// Stop a queue and fetch its available-ring base.
    GetVringBase = 11,
    /// Install the eventfd the guest kicks when it adds buffers.
    SetVringKick = 12,
    /// Install the eventfd the backend signals when buffers are used.
    SetVringCall = 13,
    /// Install the eventfd used to report queue errors.
    SetVringErr = 14,
    /// Get the protocol feature bit mask.
    GetProtocolFeatures = 15,
    /// Enable protocol features.
    SetProtocolFeatures = 16,
    /// Query how many queues the backend supports.
    GetQueueNum = 17,
    /// Enable or disable a queue.
    SetVringEnable = 18,
    /// Read from the device configuration space.
    GetConfig = 24,
    /// Write to the device configuration space.
    SetConfig = 25,
}

impl FrontendReq {
    /// Decode a request code from the header. Unknown codes (including
    /// requests this backend never needs, such as logging or IOTLB setup)
    /// decode to `None` and are rejected as invalid messages.
    pub fn from_raw(value: u32) -> Option<FrontendReq> {
        use FrontendReq::*;
        Some(match value {
            1 => GetFeatures,
            2 => SetFeatures,
            3 => SetOwner,
            4 => ResetOwner,
            5 => SetMemTable,
            8 => SetVringNum,
            9 => SetVringAddr,
            10 => SetVringBase,
            11 => GetVringBase,
            12 => SetVringKick,
            13 => SetVringCall,
            14 => SetVringErr,
            15 => GetProtocolFeatures,
            16 => SetProtocolFeatures,
            17 => GetQueueNum,
            18 => SetVringEnable,
            24 => GetConfig,
            25 => SetConfig,
            _ => return None,
        })
    }
}

/// Message payload validator. Validates syntax only; semantic checks such
/// as feature-negotiation ordering live in the dispatcher.
pub trait VhostUserMsgValidator {
    fn is_valid(&self) -> bool {
        true
    }
}

bitflags! {
    /// Flags in the message header.
    #[derive(Clone, Copy, Debug, PartialEq, Eq)]
    pub struct VhostUserHeaderFlag: u32 {
        /// Bits[0..2] hold the protocol version number.
        const VERSION = 0x3;
        /// The message is a reply.
        const REPLY = 0x4;
        /// The sender wants an ack even for messages without a reply body.
        const NEED_REPLY = 0x8;
        /// All bits with assigned meaning beyond the version.
        const ALL_FLAGS = 0xc;
        /// All reserved bits.
        const RESERVED_BITS = !0xf;
    }
}

/// The fixed message header.
#[repr(C, packed)]
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct VhostUserMsgHeader {
    request: u32,
    flags: u32,
    size: u32,
}

impl VhostUserMsgHeader {
    pub fn new(request: FrontendReq, flags: u32, size: u32) -> Self {
        // Default to protocol version 1.
        let flags = (flags & VhostUserHeaderFlag::ALL_FLAGS.bits()) | 0x1;
        VhostUserMsgHeader {
            request: request as u32,
            flags,
            size,
        }
    }

    pub fn code(&self) -> Option<FrontendReq> {
        FrontendReq::from_raw(self.request)
    }

    pub fn raw_code(&self) -> u32 {
        self.request
    }

    pub fn version(&self) -> u32 {
        self.flags & VhostUserHeaderFlag::VERSION.bits()
    }

    pub fn is_reply(&self) -> bool {
        (self.flags & VhostUserHeaderFlag::REPLY.bits()) != 0
    }

    pub fn is_need_reply(&self) -> bool {
        (self.flags & VhostUserHeaderFlag::NEED_REPLY.bits()) != 0
    }

    pub fn size(&self) -> u32 {
        self.size
    }
}

impl VhostUserMsgValidator for VhostUserMsgHeader {
    fn is_valid(&self) -> bool {
        self.code().is_some()
            && self.size as usize <= MAX_MSG_SIZE
            && self.version() == 0x1
            && (self.flags & VhostUserHeaderFlag::RESERVED_BITS.bits()) == 0
    }
}

bitflags! {
    /// Transport-specific bits in the virtio feature set.
    #[derive(Clone, Copy, Debug, PartialEq, Eq)]
    pub struct VhostUserVirtioFeatures: u64 {
        /// The backend supports protocol-feature negotiation.
        const PROTOCOL_FEATURES = 0x4000_0000;
    }
}

bitflags! {
    /// Vhost-user protocol feature flags.
    #[derive(Clone, Copy, Debug, PartialEq, Eq)]
    pub struct VhostUserProtocolFeatures: u64 {
        /// Multiple queues.
        const MQ = 0x0000_0001;
        /// Acks for requests with the NEED_REPLY flag set.
        const REPLY_ACK = 0x0000_0008;
        /// Device configuration space accesses.
        const CONFIG = 0x0000_0200;
    }
}

/// A 64-bit value, used both for feature masks and for the vring fd
/// messages where the low byte carries the queue index.
#[repr(C, packed)]
#[derive(Default, Clone, Copy)]
pub struct VhostUserU64 {
    pub value: u64,
}

impl VhostUserU64 {
    pub fn new(value: u64) -> Self {
        VhostUserU64 { value }
    }
}

impl VhostUserMsgValidator for VhostUserU64 {}

/// Fixed part of the `SET_MEM_TABLE` payload.
#[repr(C, packed)]
#[derive(Default, Clone, Copy)]
pub struct VhostUserMemory {
    pub num_regions: u32,
    pub padding1: u32,
}

impl VhostUserMemory {
    pub fn new(cnt: u32) -> Self {
        VhostUserMemory {
            num_regions: cnt,
            padding1: 0,
        }
    }
}

impl VhostUserMsgValidator for VhostUserMemory {
    fn is_valid(&self) -> bool {
        self.padding1 == 0
            && self.num_regions >= 1
            && self.num_regions <= MAX_ATTACHED_FD_ENTRIES as u32
    }
}

/// One memory region descriptor within the `SET_MEM_TABLE` payload.
#[repr(C, packed)]
#[derive(Default, Clone, Copy)]
pub struct VhostUserMemoryRegion {
    /// Guest physical address of the region.
    pub guest_phys_addr: u64,
    /// Size of the region.
    pub memory_size: u64,
    /// Virtual address of the region in the frontend process. Ring
    /// addresses arrive in this address space.
    pub user_addr: u64,
    /// Offset of the region within the attached file descriptor.
    pub mmap_offset: u64,
}

impl VhostUserMemoryRegion {
    pub fn new(guest_phys_addr: u64, memory_size: u64, user_addr: u64, mmap_offset: u64) -> Self {
        VhostUserMemoryRegion {
            guest_phys_addr,
            memory_size,
            user_addr,
            mmap_offset,
        }
    }
}

impl VhostUserMsgValidator for VhostUserMemoryRegion {
    fn is_valid(&self) -> bool {
        self.memory_size != 0
            && self.guest_phys_addr.checked_add(self.memory_size).is_some()
            && self.user_addr.checked_add(self.memory_size).is_some()
            && self.mmap_offset.checked_add(self.memory_size).is_some()
    }
}

/// Vring state: an `(index, value)` pair used for sizes, bases and the
/// enable flag.
#[repr(C, packed)]
#[derive(Default, Clone, Copy)]
pub struct VhostUserVringState {
    pub index: u32,
    pub num: u32,
}

impl VhostUserVringState {
    pub fn new(index: u32, num: u32) -> Self {
        VhostUserVringState { index, num }
    }
}

impl VhostUserMsgValidator for VhostUserVringState {}

bitflags! {
    /// Flags for the vring address message.
    #[derive(Clone, Copy, Debug, PartialEq, Eq)]
    pub struct VhostUserVringAddrFlags: u32 {
        /// Used-ring updates should be logged (unsupported here).
        const VHOST_VRING_F_LOG = 0x1;
    }
}

/// Vring address descriptor. All addresses are in the frontend's virtual
/// address space and must be translated through the memory table.
#[repr(C, packed)]
#[derive(Default, Clone, Copy)]
pub struct VhostUserVringAddr {
    pub index: u32,
    pub flags: u32,
    pub descriptor: u64,
    pub used: u64,
    pub available: u64,
    pub log: u64,
}

impl VhostUserMsgValidator for VhostUserVringAddr {
    fn is_valid(&self) -> bool {
        (self.flags & !VhostUserVringAddrFlags::all().bits()) == 0
            && self.descriptor & 0xf == 0
            && self.available & 0x1 == 0
            && self.used & 0x3 == 0
    }
}

bitflags! {
    /// Flags for the device configuration messages.
    #[derive(Clone, Copy, Debug, PartialEq, Eq)]
    pub struct VhostUserConfigFlags: u32 {
        const WRITABLE = 0x1;
        const LIVE_MIGRATION = 0x2;
    }
}

/// Starting position (inclusive) of the device configuration space as seen
/// over the protocol.
pub const VHOST_USER_CONFIG_OFFSET: u32 = 0x100;

/// Ending position (exclusive) of the device configuration space.
pub const VHOST_USER_CONFIG_SIZE: u32 = 0x1000;

/// Header of a configuration space access; followed by `size` payload
/// bytes in both requests (writes) and replies (reads).
#[repr(C, packed)]
#[derive(Default, Clone, Copy)]
pub struct VhostUserConfig {
    pub offset: u32,
    pub size: u32,
    pub flags: u32,
}

impl VhostUserConfig {
    pub fn new(offset: u32, size: u32, flags: VhostUserConfigFlags) -> Self {
        VhostUserConfig {
            offset,
            size,
            flags: flags.bits(),
        }
    }
}

impl VhostUserMsgValidator for VhostUserConfig {
    fn is_valid(&self) -> bool {
        (self.flags & !VhostUserConfigFlags::all().bits()) == 0
            && self.offset < VHOST_USER_CONFIG_SIZE
            && self.size != 0
            && self.size <= VHOST_USER_CONFIG_SIZE - VHOST_USER_CONFIG_OFFSET
            && self.size + self.offset <= VHOST_USER_CONFIG_SIZE
    }
}

/// Sanity bound so a corrupt header cannot make us allocate gigabytes.
pub const fn max_payload_size() -> usize {
    MAX_MSG_SIZE - mem::size_of::<VhostUserMsgHeader>()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn request_codes() {
        assert_eq!(FrontendReq::from_raw(0), None);
        assert_eq!(FrontendReq::from_raw(1), Some(FrontendReq::GetFeatures));
        assert_eq!(FrontendReq::from_raw(19), None);
        assert_eq!(FrontendReq::from_raw(25), Some(FrontendReq::SetConfig));
        assert_eq!(FrontendReq::from_raw(26), None);
    }

    #[test]
    fn header_ops() {
        let hdr = VhostUserMsgHeader::new(FrontendReq::GetFeatures, 0, 0x100);
        assert_eq!(hdr.code(), Some(FrontendReq::GetFeatures));
        assert_eq!(hdr.version(), 0x1);
        assert!(!hdr.is_reply());
        assert!(!hdr.is_need_reply());
        assert_eq!(hdr.size(), 0x100);
        assert!(hdr.is_valid());

        let mut bad = hdr;
        bad.size = 0x2000;
        assert!(!bad.is_valid());

        let mut bad = hdr;
        bad.flags &= !0x1;
        assert!(!bad.is_valid());

        let mut bad = hdr;
        bad.request = 0;
        assert!(!bad.is_valid());
    }

    #[test]
    fn memory_table_payload() {
        let mut msg = VhostUserMemory::new(1);
        assert!(msg.is_valid());
        msg.num_regions = MAX_ATTACHED_FD_ENTRIES as u32;
        assert!(msg.is_valid());
        msg.num_regions += 1;
        assert!(!msg.is_valid());
        msg.num_regions = 1;
        msg.padding1 = 1;
        assert!(!msg.is_valid());

        let mut region = VhostUserMemoryRegion::new(0, 0x1000, 0, 0);
        assert!(region.is_valid());
        region.guest_phys_addr = 0xFFFF_FFFF_FFFF_F000;
        assert!(!region.is_valid());
        region.guest_phys_addr = 0;
        region.memory_size = 0;
        assert!(!region.is_valid());
    }

    #[test]
    fn vring_addr_alignment() {
        let mut msg = VhostUserVringAddr::default();
        assert!(msg.is_valid());
        msg.descriptor = 1;
        assert!(!msg.is_valid());
        msg.descriptor = 0;
        msg.available = 1;
        assert!(!msg.is_valid());
        msg.available = 0;
        msg.used = 2;
        assert!(!msg.is_valid());
        msg.used = 0;
        msg.flags = 0x2;
        assert!(!msg.is_valid());
    }

    #[test]
    fn config_bounds() {
        let msg = VhostUserConfig::new(0x100, 8, VhostUserConfigFlags::empty());
        assert!(msg.is_valid());
        let msg = VhostUserConfig::new(0x100, 0, VhostUserConfigFlags::empty());
        assert!(!msg.is_valid());
        let msg = VhostUserConfig::new(0x1000, 4, VhostUserConfigFlags::empty());
        assert!(!msg.is_valid());
    }
}
