// Copyright © 2024 Axis Communications AB
//
// SPDX-License-Identifier: Apache-2.0

//! The virtio-gpio personality.
//!
//! Queue 0 carries commands with an immediate response. Queue 1 is the
//! event queue: the guest submits one buffer per pin it wants interrupts
//! from, and the buffer is parked until a model (or the harness) raises
//! the interrupt, or until the guest tears the trigger down with
//! `IRQ_TYPE_NONE`.

use std::mem::size_of;
use std::sync::Arc;

use log::{debug, error, warn};
use vhost_user::message::VhostUserProtocolFeatures;
use vhost_user::Listener;
use virtio_bindings::virtio_config::VIRTIO_F_VERSION_1;
use vm_memory::{ByteValued, GuestMemoryMmap};

use super::BackendOps;
use crate::device::{PoppedElement, VuDev};
use crate::memory;
use crate::model::gpio::NGPIO;
use crate::model::ModelHub;

/// Feature bit: the device supports interrupts.
pub const VIRTIO_GPIO_F_IRQ: u64 = 0;

pub const VIRTIO_GPIO_MSG_GET_DIRECTION: u16 = 0x0002;
pub const VIRTIO_GPIO_MSG_SET_VALUE: u16 = 0x0005;
pub const VIRTIO_GPIO_MSG_IRQ_TYPE: u16 = 0x0006;

pub const VIRTIO_GPIO_STATUS_OK: u8 = 0x0;

pub const VIRTIO_GPIO_DIRECTION_IN: u8 = 0x02;

pub const VIRTIO_GPIO_IRQ_TYPE_NONE: u32 = 0x00;

pub const VIRTIO_GPIO_IRQ_STATUS_INVALID: u8 = 0x0;
pub const VIRTIO_GPIO_IRQ_STATUS_VALID: u8 = 0x1;

const CMD_QUEUE: usize = 0;
const EVENT_QUEUE: usize = 1;

#[repr(C)]
#[derive(Clone, Copy, Debug, Default)]
pub struct VirtioGpioRequest {
    pub msg_type: u16,
    pub gpio: u16,
    pub value: u32,
}

// Safe because the struct is plain integers with explicit layout.
unsafe impl ByteValued for VirtioGpioRequest {}

#[repr(C)]
#[derive(Clone, Copy, Debug, Default)]
pub struct VirtioGpioResponse {
    pub status: u8,
    pub value: u8,
}

// Safe because the struct is plain integers with explicit layout.
unsafe impl ByteValued for VirtioGpioResponse {}

#[repr(C)]
#[derive(Clone, Copy, Debug, Default)]
pub struct VirtioGpioIrqRequest {
    pub gpio: u16,
}

// Safe because the struct is plain integers with explicit layout.
unsafe impl ByteValued for VirtioGpioIrqRequest {}

#[repr(C)]
#[derive(Clone, Copy, Debug, Default)]
pub struct VirtioGpioIrqResponse {
    pub status: u8,
}

// Safe because the struct is plain integers with explicit layout.
unsafe impl ByteValued for VirtioGpioIrqResponse {}

#[repr(C)]
#[derive(Clone, Copy, Debug, Default)]
struct VirtioGpioConfig {
    ngpio: u16,
    padding: [u8; 2],
    gpio_names_size: u32,
}

// Safe because the struct is plain integers with explicit layout.
unsafe impl ByteValued for VirtioGpioConfig {}

/// An event-queue element waiting for its interrupt, together with the
/// memory table it must be completed against.
struct ParkedIrq {
    elem: virtqueue::VqElement,
    mem: Arc<GuestMemoryMmap>,
}

pub struct GpioDev {
    pub vu: VuDev,
    irq_elements: Vec<Option<ParkedIrq>>,
}

impl GpioDev {
    pub fn new(listener: Option<Listener>) -> Self {
        let config = VirtioGpioConfig {
            ngpio: NGPIO as u16,
            ..Default::default()
        };
        GpioDev {
            vu: VuDev::new(
                "gpio",
                2,
                (1u64 << VIRTIO_F_VERSION_1) | (1u64 << VIRTIO_GPIO_F_IRQ),
                VhostUserProtocolFeatures::REPLY_ACK | VhostUserProtocolFeatures::CONFIG,
                config.as_slice().to_vec(),
                listener,
            ),
            irq_elements: (0..NGPIO).map(|_| None).collect(),
        }
    }

    /// Complete the parked IRQ element for `pin`, if any.
    ///
    /// Raising an interrupt with nothing parked is legal: the guest may
    /// still be on its way to resubscribe. Level interrupts re-fire on
    /// unmask, edges stay latched in the pin model.
    pub fn send_irq_response(&mut self, pin: u32, status: u8) {
        let Some(slot) = self.irq_elements.get_mut(pin as usize) else {
            warn!("gpio: irq for pin {} out of range", pin);
            return;
        };
        let Some(parked) = slot.take() else {
            debug!("gpio: no irq buffer parked for pin {}", pin);
            return;
        };

        let ParkedIrq { elem, mem } = parked;
        assert_eq!(
            elem.in_sg[0].len as usize,
            size_of::<VirtioGpioIrqResponse>(),
            "gpio: bad irq response buffer"
        );
        memory::write_obj(&mem, VirtioGpioIrqResponse { status }, elem.in_sg[0].addr)
            .expect("gpio: irq response buffer vanished from guest memory");

        self.vu
            .push(
                EVENT_QUEUE,
                &mem,
                elem.head_index,
                size_of::<VirtioGpioIrqResponse>() as u32,
            )
            .unwrap_or_else(|e| panic!("gpio: event used ring: {}", e));
        self.vu.notify(EVENT_QUEUE, &mem);
    }

    #[cfg(test)]
    fn parked(&self, pin: u32) -> bool {
        self.irq_elements[pin as usize].is_some()
    }
}

/// Drain and service the command queue.
pub fn handle_cmdq(gpio: &mut GpioDev, dma_mem: Option<Arc<GuestMemoryMmap>>, hub: &mut ModelHub) {
    let mut notify_mem: Option<Arc<GuestMemoryMmap>> = None;

    loop {
        let popped = gpio
            .vu
            .pop(CMD_QUEUE)
            .unwrap_or_else(|e| panic!("gpio: malformed virtqueue: {}", e));
        let Some(PoppedElement { elem, mem }) = popped else {
            break;
        };

        debug!(
            "gpio: elem index {} out_num {} in_num {}",
            elem.head_index,
            elem.out_sg.len(),
            elem.in_sg.len()
        );

        assert_eq!(elem.out_sg.len(), 1, "gpio: bad command out count");
        assert_eq!(elem.in_sg.len(), 1, "gpio: bad command in count");
        assert_eq!(
            elem.out_sg[0].len as usize,
            size_of::<VirtioGpioRequest>(),
            "gpio: bad command request size"
        );
        assert_eq!(
            elem.in_sg[0].len as usize,
            size_of::<VirtioGpioResponse>(),
            "gpio: bad command response size"
        );

        let req: VirtioGpioRequest = memory::read_obj(&mem, elem.out_sg[0].addr)
            .expect("gpio: command request vanished from guest memory");

        debug!(
            "gpio: req type {:#x} gpio {:#x} value {:#x}",
            req.msg_type, req.gpio, req.value
        );

        let pin = u32::from(req.gpio);
        let value = match req.msg_type {
            VIRTIO_GPIO_MSG_IRQ_TYPE => {
                {
                    let mut ops = BackendOps::new(gpio, dma_mem.clone());
                    if let Err(e) = hub.gpio.set_irq_type(pin, req.value, &mut ops) {
                        panic!("gpio: set_irq_type({}, {:#x}): {}", pin, req.value, e);
                    }
                }
                // Tearing the trigger down wakes any parked subscription so
                // the guest is not left waiting on an interrupt that can no
                // longer arrive.
                if req.value == VIRTIO_GPIO_IRQ_TYPE_NONE {
                    gpio.send_irq_response(pin, VIRTIO_GPIO_IRQ_STATUS_INVALID);
                }
                0
            }
            VIRTIO_GPIO_MSG_GET_DIRECTION => VIRTIO_GPIO_DIRECTION_IN,
            VIRTIO_GPIO_MSG_SET_VALUE => {
                if let Err(e) = hub.gpio.set_value(pin, req.value) {
                    error!("gpio: set_value({}, {}): {}", pin, req.value, e);
                }
                0
            }
            // The remaining commands could be wired to models for testing
            // of drivers' control of GPIOs.
            _ => 0,
        };

        let resp = VirtioGpioResponse {
            status: VIRTIO_GPIO_STATUS_OK,
            value,
        };
        memory::write_obj(&mem, resp, elem.in_sg[0].addr)
            .expect("gpio: command response vanished from guest memory");

        gpio.vu
            .push(
                CMD_QUEUE,
                &mem,
                elem.head_index,
                size_of::<VirtioGpioResponse>() as u32,
            )
            .unwrap_or_else(|e| panic!("gpio: used ring: {}", e));
        notify_mem = Some(mem);
    }

    if let Some(mem) = notify_mem.or_else(|| gpio.vu.mem().cloned()) {
        gpio.vu.notify(CMD_QUEUE, &mem);
    }
}

/// Drain the event queue, parking each subscription in its pin's slot.
pub fn handle_eventq(gpio: &mut GpioDev, dma_mem: Option<Arc<GuestMemoryMmap>>, hub: &mut ModelHub) {
    loop {
        let popped = gpio
            .vu
            .pop(EVENT_QUEUE)
            .unwrap_or_else(|e| panic!("gpio: malformed event virtqueue: {}", e));
        let Some(PoppedElement { elem, mem }) = popped else {
            break;
        };

        debug!(
            "gpio: event elem index {} out_num {} in_num {}",
            elem.head_index,
            elem.out_sg.len(),
            elem.in_sg.len()
        );

        assert_eq!(elem.out_sg.len(), 1, "gpio: bad event out count");
        assert_eq!(elem.in_sg.len(), 1, "gpio: bad event in count");
        assert_eq!(
            elem.out_sg[0].len as usize,
            size_of::<VirtioGpioIrqRequest>(),
            "gpio: bad event request size"
        );
        assert_eq!(
            elem.in_sg[0].len as usize,
            size_of::<VirtioGpioIrqResponse>(),
            "gpio: bad event response size"
        );

        let req: VirtioGpioIrqRequest = memory::read_obj(&mem, elem.out_sg[0].addr)
            .expect("gpio: event request vanished from guest memory");
        let pin = u32::from(req.gpio);

        debug!("gpio: irq subscription for pin {}", pin);

        assert!((pin as usize) < gpio.irq_elements.len(), "gpio: pin {} out of range", pin);
        assert!(
            gpio.irq_elements[pin as usize].is_none(),
            "gpio: duplicate irq subscription for pin {}",
            pin
        );
        gpio.irq_elements[pin as usize] = Some(ParkedIrq { elem, mem });

        // The unmask may complete the subscription synchronously if the
        // interrupt condition is already pending.
        let mut ops = BackendOps::new(gpio, dma_mem.clone());
        if let Err(e) = hub.gpio.unmask(pin, &mut ops) {
            panic!("gpio: unmask({}): {}", pin, e);
        }
    }
}
