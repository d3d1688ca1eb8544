// Copyright © 2024 Axis Communications AB
//
// SPDX-License-Identifier: Apache-2.0

//! The model layer: software stand-ins for the hardware under test.
//!
//! Three surfaces mirror the three emulated buses. The GPIO surface is a
//! fixed array of pin state machines; the I2C and platform surfaces
//! dispatch to a chip model loaded by name through the control channel.
//! Models call back into the backend only through the [`HostOps`]
//! capability they are handed on every invocation: raising a GPIO
//! interrupt and DMA to guest memory.

pub mod gpio;
pub mod i2c;
pub mod platform;

use thiserror::Error as ThisError;

use crate::control::{self, Args};
use gpio::GpioHub;
use i2c::I2cHub;
use platform::PlatformHub;

#[derive(Debug, ThisError)]
pub enum ModelError {
    #[error("no {0} model loaded")]
    NoModel(&'static str),
    #[error("unknown model {0:?}")]
    UnknownModel(String),
    #[error("unknown method {0:?}")]
    UnknownMethod(String),
    #[error("unknown surface {0:?}")]
    UnknownSurface(String),
    #[error("bad argument: {0}")]
    BadArgument(String),
    #[error("{0}")]
    Failure(String),
    #[error(transparent)]
    Control(#[from] control::Error),
    #[error("guest memory: {0}")]
    Dma(#[from] crate::memory::Error),
}

pub type Result<T> = std::result::Result<T, ModelError>;

/// Host callbacks exposed to models.
pub trait HostOps {
    /// Complete the parked IRQ element for `pin` with a valid status.
    /// Does nothing (beyond a debug log) when nothing is parked.
    fn trigger_gpio_irq(&mut self, pin: u32);

    /// Copy `len` bytes out of guest memory.
    fn dma_read(&mut self, addr: u64, len: usize) -> Result<Vec<u8>>;

    /// Copy bytes into guest memory.
    fn dma_write(&mut self, addr: u64, data: &[u8]) -> Result<()>;
}

/// All model state, bundled so the backend can hand out one `&mut`.
pub struct ModelHub {
    pub i2c: I2cHub,
    pub gpio: GpioHub,
    pub platform: PlatformHub,
}

impl ModelHub {
    pub fn new() -> Self {
        ModelHub {
            i2c: I2cHub::new(),
            gpio: GpioHub::new(),
            platform: PlatformHub::new(),
        }
    }

    /// Apply one control-channel command.
    pub fn dispatch(
        &mut self,
        surface: &str,
        method: &str,
        args: &Args,
        ops: &mut dyn HostOps,
    ) -> Result<()> {
        match surface {
            "i2c" => match method {
                "load_model" => self.i2c.load_model(args.pos_str(0, "model name")?, args),
                "unload_model" => {
                    self.i2c.unload_model();
                    Ok(())
                }
                _ => self.i2c.control(method, args, ops),
            },
            "gpio" => match method {
                "set_input" => {
                    let pin = args.pos_int(0, "pin")? as u32;
                    let value = args.pos_int(1, "value")? != 0;
                    self.gpio.set_input(pin, value, ops)
                }
                "set_irq_type" => {
                    let pin = args.pos_int(0, "pin")? as u32;
                    let irq_type = args.pos_int(1, "irq type")? as u32;
                    self.gpio.set_irq_type(pin, irq_type, ops)
                }
                "unmask" => {
                    let pin = args.pos_int(0, "pin")? as u32;
                    self.gpio.unmask(pin, ops)
                }
                _ => Err(ModelError::UnknownMethod(method.to_string())),
            },
            "platform" => match method {
                "load_model" => {
                    self.platform
                        .load_model(args.pos_str(0, "model name")?, args)
                }
                "unload_model" => {
                    self.platform.unload_model();
                    Ok(())
                }
                _ => self.platform.control(method, args, ops),
            },
            _ => Err(ModelError::UnknownSurface(surface.to_string())),
        }
    }
}

impl Default for ModelHub {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
pub mod testing {
    use super::*;

    /// Records host callbacks for assertions, in place of a live backend.
    #[derive(Default)]
    pub struct RecordingOps {
        pub triggered: Vec<u32>,
        pub guest: std::collections::HashMap<u64, u8>,
    }

    impl HostOps for RecordingOps {
        fn trigger_gpio_irq(&mut self, pin: u32) {
            self.triggered.push(pin);
        }

        fn dma_read(&mut self, addr: u64, len: usize) -> Result<Vec<u8>> {
            (0..len as u64)
                .map(|i| {
                    self.guest
                        .get(&(addr + i))
                        .copied()
                        .ok_or(ModelError::Dma(crate::memory::Error::InvalidGuestRange {
                            addr: addr + i,
                            len: 1,
                        }))
                })
                .collect()
        }

        fn dma_write(&mut self, addr: u64, data: &[u8]) -> Result<()> {
            for (i, b) in data.iter().enumerate() {
                self.guest.insert(addr + i as u64, *b);
            }
            Ok(())
        }
    }
}
