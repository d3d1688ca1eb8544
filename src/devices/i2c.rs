// Copyright © 2024 Axis Communications AB
//
// SPDX-License-Identifier: Apache-2.0

//! The virtio-i2c personality.
//!
//! One command queue. Every request starts with a fixed out header
//! carrying the wire address; the last in vector holds the status byte.
//! Write requests optionally carry a second out vector with the payload,
//! read requests carry the data buffer as the first in vector.

use std::mem::size_of;
use std::sync::Arc;

use log::{debug, error};
use vhost_user::message::VhostUserProtocolFeatures;
use vhost_user::Listener;
use virtio_bindings::virtio_config::VIRTIO_F_VERSION_1;
use vm_memory::{ByteValued, GuestMemoryMmap};

use super::BackendOps;
use crate::device::{PoppedElement, VuDev};
use crate::devices::gpio::GpioDev;
use crate::memory;
use crate::model::ModelHub;

/// Feature bit: zero-length (address-only) requests are supported.
pub const VIRTIO_I2C_F_ZERO_LENGTH_REQUEST: u64 = 0;

pub const VIRTIO_I2C_MSG_OK: u8 = 0;
pub const VIRTIO_I2C_MSG_ERR: u8 = 1;

const CMD_QUEUE: usize = 0;

/// Fixed header of every request, in the first out vector.
#[repr(C)]
#[derive(Clone, Copy, Debug, Default)]
pub struct VirtioI2cOutHdr {
    pub addr: u16,
    pub padding: u16,
    pub flags: u32,
}

// Safe because the struct is plain integers with explicit layout.
unsafe impl ByteValued for VirtioI2cOutHdr {}

pub struct I2cDev {
    pub vu: VuDev,
}

impl I2cDev {
    pub fn new(listener: Option<Listener>) -> Self {
        I2cDev {
            vu: VuDev::new(
                "i2c",
                1,
                (1u64 << VIRTIO_F_VERSION_1) | (1u64 << VIRTIO_I2C_F_ZERO_LENGTH_REQUEST),
                VhostUserProtocolFeatures::REPLY_ACK,
                Vec::new(),
                listener,
            ),
        }
    }
}

/// Drain and service the command queue.
pub fn handle_cmdq(
    i2c: &mut I2cDev,
    gpio: &mut GpioDev,
    dma_mem: Option<Arc<GuestMemoryMmap>>,
    hub: &mut ModelHub,
) {
    let mut ops = BackendOps::new(gpio, dma_mem);
    let mut notify_mem: Option<Arc<GuestMemoryMmap>> = None;

    loop {
        let popped = i2c
            .vu
            .pop(CMD_QUEUE)
            .unwrap_or_else(|e| panic!("i2c: malformed virtqueue: {}", e));
        let Some(PoppedElement { elem, mem }) = popped else {
            break;
        };

        debug!(
            "i2c: elem index {} out_num {} in_num {}",
            elem.head_index,
            elem.out_sg.len(),
            elem.in_sg.len()
        );

        let out_num = elem.out_sg.len();
        let in_num = elem.in_sg.len();
        assert!(out_num >= 1, "i2c: request without out header");
        assert_eq!(
            elem.out_sg[0].len as usize,
            size_of::<VirtioI2cOutHdr>(),
            "i2c: bad request header size"
        );
        let hdr: VirtioI2cOutHdr = memory::read_obj(&mem, elem.out_sg[0].addr)
            .expect("i2c: request header vanished from guest memory");

        let mut used: u32 = 0;
        let ok;
        let status_iov;

        if (out_num == 1 || out_num == 2) && in_num == 1 {
            // Write, or an address-only probe when there is no payload.
            let payload = if out_num == 2 {
                memory::read_guest(&mem, elem.out_sg[1].addr, elem.out_sg[1].len as usize)
            } else {
                Ok(Vec::new())
            };
            ok = match payload {
                Ok(data) => match hub.i2c.write(hdr.addr, &data, &mut ops) {
                    Ok(()) => true,
                    Err(e) => {
                        error!("i2c: write to {:#x} failed: {}", hdr.addr, e);
                        false
                    }
                },
                Err(e) => {
                    error!("i2c: reading write payload failed: {}", e);
                    false
                }
            };
            status_iov = elem.in_sg[0];
        } else if out_num == 1 && in_num == 2 {
            let data_iov = elem.in_sg[0];
            let wanted = data_iov.len as usize;
            ok = match hub.i2c.read(hdr.addr, wanted, &mut ops) {
                Ok(data) if data.len() >= wanted => {
                    match memory::write_guest(&mem, data_iov.addr, &data[..wanted]) {
                        Ok(()) => true,
                        Err(e) => {
                            error!("i2c: writing read data failed: {}", e);
                            false
                        }
                    }
                }
                Ok(data) => {
                    error!(
                        "i2c: model returned {} bytes, expected {}",
                        data.len(),
                        wanted
                    );
                    false
                }
                Err(e) => {
                    error!("i2c: read from {:#x} failed: {}", hdr.addr, e);
                    false
                }
            };
            used += wanted as u32;
            status_iov = elem.in_sg[1];
        } else {
            panic!(
                "i2c: unsupported element topology out_num {} in_num {}",
                out_num, in_num
            );
        }

        assert!(status_iov.len >= 1, "i2c: no room for the status byte");
        let status = if ok { VIRTIO_I2C_MSG_OK } else { VIRTIO_I2C_MSG_ERR };
        memory::write_obj(&mem, status, status_iov.addr)
            .expect("i2c: status buffer vanished from guest memory");
        used += 1;

        i2c.vu
            .push(CMD_QUEUE, &mem, elem.head_index, used)
            .unwrap_or_else(|e| panic!("i2c: used ring: {}", e));
        notify_mem = Some(mem);
    }

    if let Some(mem) = notify_mem.or_else(|| i2c.vu.mem().cloned()) {
        i2c.vu.notify(CMD_QUEUE, &mem);
    }
}
