// Copyright © 2024 Axis Communications AB
//
// SPDX-License-Identifier: Apache-2.0

//! The three virtio device personalities and the host-callback plumbing
//! that lets models reach back into them.

pub mod gpio;
pub mod i2c;
pub mod platform;

use std::sync::Arc;

use vm_memory::{GuestAddress, GuestMemoryMmap};

use crate::memory;
use crate::model::{HostOps, ModelError};
use gpio::GpioDev;

/// The live [`HostOps`] implementation handed to models while a request
/// or control command is being serviced.
///
/// DMA goes through the platform device's memory table; it is the device
/// doing bus-mastering on behalf of the chip being modeled.
pub struct BackendOps<'a> {
    gpio: &'a mut GpioDev,
    dma_mem: Option<Arc<GuestMemoryMmap>>,
}

impl<'a> BackendOps<'a> {
    pub fn new(gpio: &'a mut GpioDev, dma_mem: Option<Arc<GuestMemoryMmap>>) -> Self {
        BackendOps { gpio, dma_mem }
    }

    fn dma_mem(&self) -> Result<&GuestMemoryMmap, ModelError> {
        self.dma_mem
            .as_deref()
            .ok_or_else(|| ModelError::Failure("no guest memory mapped for dma".to_string()))
    }
}

impl HostOps for BackendOps<'_> {
    fn trigger_gpio_irq(&mut self, pin: u32) {
        self.gpio
            .send_irq_response(pin, gpio::VIRTIO_GPIO_IRQ_STATUS_VALID);
    }

    fn dma_read(&mut self, addr: u64, len: usize) -> Result<Vec<u8>, ModelError> {
        let mem = self.dma_mem()?;
        Ok(memory::read_guest(mem, GuestAddress(addr), len)?)
    }

    fn dma_write(&mut self, addr: u64, data: &[u8]) -> Result<(), ModelError> {
        let mem = self.dma_mem()?;
        Ok(memory::write_guest(mem, GuestAddress(addr), data)?)
    }
}


#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::HostOps;

    #[test]
    fn dma_round_trip() {
        let mem = GuestMemoryMmap::from_ranges(&[(GuestAddress(0), 0x4000)]).unwrap();
        let mut gpio = GpioDev::new(None);
        let mut ops = BackendOps::new(&mut gpio, Some(Arc::new(mem)));

        let data = vec![1, 2, 3, 4, 5];
        ops.dma_write(0x1000, &data).unwrap();
        assert_eq!(ops.dma_read(0x1000, data.len()).unwrap(), data);
    }

    #[test]
    fn dma_invalid_gpa() {
        let mem = GuestMemoryMmap::from_ranges(&[(GuestAddress(0), 0x1000)]).unwrap();
        let mut gpio = GpioDev::new(None);
        let mut ops = BackendOps::new(&mut gpio, Some(Arc::new(mem)));

        assert!(ops.dma_read(0x1000, 1).is_err());
        assert!(ops.dma_write(0xfff, &[0, 0]).is_err());
    }

    #[test]
    fn dma_without_memory() {
        let mut gpio = GpioDev::new(None);
        let mut ops = BackendOps::new(&mut gpio, None);
        assert!(ops.dma_read(0, 1).is_err());
    }
}
