// Copyright © 2024 Axis Communications AB
//
// SPDX-License-Identifier: Apache-2.0

//! The platform (PCI/MMIO) personality.
//!
//! The guest's PCI frontend tunnels BAR accesses through a single queue.
//! Each message carries `{op, bar, size, addr}`; MMIO reads return their
//! data in the in vector, MMIO writes carry the value either appended to
//! the header (posted) or in a second out vector. There is no status
//! field; the used-ring entry itself signals completion.

use std::mem::size_of;
use std::sync::Arc;

use log::{debug, error};
use vhost_user::message::VhostUserProtocolFeatures;
use vhost_user::Listener;
use virtio_bindings::virtio_config::{VIRTIO_F_ACCESS_PLATFORM, VIRTIO_F_VERSION_1};
use vm_memory::{Address, ByteValued, GuestMemoryMmap};

use super::BackendOps;
use crate::device::{PoppedElement, VuDev};
use crate::devices::gpio::GpioDev;
use crate::memory;
use crate::model::ModelHub;

pub const VIRTIO_PCIDEV_OP_MMIO_READ: u8 = 3;
pub const VIRTIO_PCIDEV_OP_MMIO_WRITE: u8 = 4;

const CMD_QUEUE: usize = 0;

/// Header of every request; writes may append their payload directly
/// after it.
#[repr(C)]
#[derive(Clone, Copy, Debug, Default)]
pub struct VirtioPcidevMsg {
    pub op: u8,
    pub bar: u8,
    pub reserved: u16,
    pub size: u32,
    pub addr: u64,
}

// Safe because the struct is plain integers with explicit layout.
unsafe impl ByteValued for VirtioPcidevMsg {}

pub struct PlatformDev {
    pub vu: VuDev,
}

impl PlatformDev {
    pub fn new(listener: Option<Listener>) -> Self {
        PlatformDev {
            vu: VuDev::new(
                "platform",
                1,
                (1u64 << VIRTIO_F_VERSION_1) | (1u64 << VIRTIO_F_ACCESS_PLATFORM),
                VhostUserProtocolFeatures::REPLY_ACK,
                Vec::new(),
                listener,
            ),
        }
    }
}

/// Drain and service the command queue.
pub fn handle_cmdq(platform: &mut PlatformDev, gpio: &mut GpioDev, hub: &mut ModelHub) {
    let dma_mem = platform.vu.mem().cloned();
    let mut ops = BackendOps::new(gpio, dma_mem);
    let mut notify_mem: Option<Arc<GuestMemoryMmap>> = None;

    loop {
        let popped = platform
            .vu
            .pop(CMD_QUEUE)
            .unwrap_or_else(|e| panic!("platform: malformed virtqueue: {}", e));
        let Some(PoppedElement { elem, mem }) = popped else {
            break;
        };

        debug!(
            "platform: elem index {} out_num {} in_num {}",
            elem.head_index,
            elem.out_sg.len(),
            elem.in_sg.len()
        );

        let hdr_len = size_of::<VirtioPcidevMsg>();
        assert!(!elem.out_sg.is_empty(), "platform: request without header");
        assert!(
            elem.out_sg[0].len as usize >= hdr_len,
            "platform: short request header"
        );
        let hdr: VirtioPcidevMsg = memory::read_obj(&mem, elem.out_sg[0].addr)
            .expect("platform: request header vanished from guest memory");

        assert_eq!(hdr.size, 4, "platform: unsupported access size {}", hdr.size);

        let used = match hdr.op {
            VIRTIO_PCIDEV_OP_MMIO_READ => {
                assert_eq!(elem.in_sg.len(), 1, "platform: bad mmio read in count");
                assert!(
                    elem.in_sg[0].len >= 4,
                    "platform: mmio read buffer too small"
                );
                let value = match hub.platform.read(hdr.addr, hdr.size, &mut ops) {
                    Ok(value) => value,
                    Err(e) => {
                        error!("platform: read {:#x} failed: {}", hdr.addr, e);
                        0
                    }
                };
                memory::write_guest(&mem, elem.in_sg[0].addr, &value.to_le_bytes())
                    .expect("platform: mmio read buffer vanished from guest memory");
                4
            }
            VIRTIO_PCIDEV_OP_MMIO_WRITE => {
                assert!(elem.in_sg.is_empty(), "platform: bad mmio write in count");
                let value_bytes = match elem.out_sg.len() {
                    // Posted write: the value sits right after the header.
                    1 => {
                        assert!(
                            elem.out_sg[0].len as usize >= hdr_len + 4,
                            "platform: posted write without payload"
                        );
                        memory::read_guest(
                            &mem,
                            elem.out_sg[0].addr.unchecked_add(hdr_len as u64),
                            4,
                        )
                    }
                    2 => {
                        assert!(
                            elem.out_sg[1].len >= 4,
                            "platform: write payload too small"
                        );
                        memory::read_guest(&mem, elem.out_sg[1].addr, 4)
                    }
                    n => panic!("platform: bad mmio write out count {}", n),
                }
                .expect("platform: write payload vanished from guest memory");
                let value = u32::from_le_bytes(value_bytes.try_into().unwrap());
                if let Err(e) = hub.platform.write(hdr.addr, hdr.size, value, &mut ops) {
                    error!("platform: write {:#x} failed: {}", hdr.addr, e);
                }
                hdr_len as u32
            }
            op => panic!("platform: unsupported op {:#x}", op),
        };

        platform
            .vu
            .push(CMD_QUEUE, &mem, elem.head_index, used)
            .unwrap_or_else(|e| panic!("platform: used ring: {}", e));
        notify_mem = Some(mem);
    }

    if let Some(mem) = notify_mem.or_else(|| platform.vu.mem().cloned()) {
        platform.vu.notify(CMD_QUEUE, &mem);
    }
}
