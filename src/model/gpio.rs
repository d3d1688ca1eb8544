// Copyright © 2024 Axis Communications AB
//
// SPDX-License-Identifier: Apache-2.0

//! GPIO pin state machines.
//!
//! Each pin tracks its input level, the interrupt trigger mode the guest
//! driver configured, a mask bit and an edge latch. The guest unmasks a
//! pin once per interrupt it is willing to take, so delivering an
//! interrupt re-masks the pin; a latched edge or an active level fires as
//! soon as the pin is unmasked again.

use log::debug;

use super::{HostOps, ModelError, Result};

/// Number of pins the device exposes (and reports in its config space).
pub const NGPIO: u32 = 64;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum IrqType {
    None,
    EdgeRising,
    EdgeFalling,
    EdgeBoth,
    LevelHigh,
    LevelLow,
}

impl IrqType {
    pub fn from_raw(raw: u32) -> Result<IrqType> {
        Ok(match raw {
            0x00 => IrqType::None,
            0x01 => IrqType::EdgeRising,
            0x02 => IrqType::EdgeFalling,
            0x03 => IrqType::EdgeBoth,
            0x04 => IrqType::LevelHigh,
            0x08 => IrqType::LevelLow,
            other => {
                return Err(ModelError::BadArgument(format!(
                    "invalid irq type {:#x}",
                    other
                )))
            }
        })
    }
}

pub struct GpioPin {
    pin: u32,
    state: bool,
    irq_type: IrqType,
    masked: bool,
    edge_irq_latched: bool,
    out_value: Option<bool>,
}

impl GpioPin {
    fn new(pin: u32) -> Self {
        GpioPin {
            pin,
            state: false,
            irq_type: IrqType::None,
            masked: true,
            edge_irq_latched: false,
            out_value: None,
        }
    }

    fn level_irq_active(&self) -> bool {
        match self.irq_type {
            IrqType::LevelHigh => self.state,
            IrqType::LevelLow => !self.state,
            _ => false,
        }
    }

    fn latch_edge_irq(&self, old: bool, new: bool) -> bool {
        match self.irq_type {
            IrqType::EdgeRising => !old && new,
            IrqType::EdgeFalling => old && !new,
            IrqType::EdgeBoth => old != new,
            _ => false,
        }
    }

    fn check_irq(&mut self, ops: &mut dyn HostOps) {
        if self.irq_type == IrqType::None || self.masked {
            return;
        }
        if !self.edge_irq_latched && !self.level_irq_active() {
            return;
        }

        self.masked = true;
        self.edge_irq_latched = false;

        debug!("gpio pin {}: trigger irq", self.pin);
        ops.trigger_gpio_irq(self.pin);
    }

    pub fn set_irq_type(&mut self, irq_type: IrqType, ops: &mut dyn HostOps) {
        debug!("gpio pin {}: set_irq_type {:?}", self.pin, irq_type);
        if irq_type == IrqType::None {
            self.masked = true;
        }
        self.irq_type = irq_type;
        self.edge_irq_latched = false;
        self.check_irq(ops);
    }

    pub fn unmask(&mut self, ops: &mut dyn HostOps) {
        debug!("gpio pin {}: unmask", self.pin);
        self.masked = false;
        self.check_irq(ops);
    }

    /// Drive the input level, e.g. from the control channel or a model
    /// wiring a chip's interrupt line to this pin.
    pub fn set_input(&mut self, value: bool, ops: &mut dyn HostOps) {
        let old = self.state;
        if old != value {
            debug!(
                "gpio pin {}: type={:?} input {} -> {}",
                self.pin, self.irq_type, old, value
            );
        }
        self.state = value;
        if self.latch_edge_irq(old, value) {
            debug!("gpio pin {}: latching edge", self.pin);
            self.edge_irq_latched = true;
        }
        self.check_irq(ops);
    }

    /// The guest driver set an output value on this pin.
    pub fn set_value(&mut self, value: bool) {
        debug!("gpio pin {}: set_value {}", self.pin, value);
        self.out_value = Some(value);
    }

    pub fn out_value(&self) -> Option<bool> {
        self.out_value
    }
}

pub struct GpioHub {
    pins: Vec<GpioPin>,
}

impl GpioHub {
    pub fn new() -> Self {
        GpioHub {
            pins: (0..NGPIO).map(GpioPin::new).collect(),
        }
    }

    fn pin_mut(&mut self, pin: u32) -> Result<&mut GpioPin> {
        self.pins
            .get_mut(pin as usize)
            .ok_or_else(|| ModelError::BadArgument(format!("pin {} out of range", pin)))
    }

    pub fn set_irq_type(&mut self, pin: u32, raw_type: u32, ops: &mut dyn HostOps) -> Result<()> {
        let irq_type = IrqType::from_raw(raw_type)?;
        self.pin_mut(pin)?.set_irq_type(irq_type, ops);
        Ok(())
    }

    pub fn unmask(&mut self, pin: u32, ops: &mut dyn HostOps) -> Result<()> {
        self.pin_mut(pin)?.unmask(ops);
        Ok(())
    }

    pub fn set_input(&mut self, pin: u32, value: bool, ops: &mut dyn HostOps) -> Result<()> {
        self.pin_mut(pin)?.set_input(value, ops);
        Ok(())
    }

    pub fn set_value(&mut self, pin: u32, value: u32) -> Result<()> {
        self.pin_mut(pin)?.set_value(value != 0);
        Ok(())
    }

    /// The last output value the guest driver wrote, if any.
    pub fn out_value(&self, pin: u32) -> Option<bool> {
        self.pins.get(pin as usize).and_then(|p| p.out_value())
    }
}

impl Default for GpioHub {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::testing::RecordingOps;

    #[test]
    fn irq_level_low() {
        let mut ops = RecordingOps::default();
        let mut pin = GpioPin::new(1);

        pin.set_irq_type(IrqType::LevelLow, &mut ops);
        assert!(ops.triggered.is_empty());

        pin.unmask(&mut ops);
        assert_eq!(ops.triggered, vec![1]);
        ops.triggered.clear();

        pin.set_input(true, &mut ops);
        pin.unmask(&mut ops);
        assert!(ops.triggered.is_empty());
    }

    #[test]
    fn irq_level_high() {
        let mut ops = RecordingOps::default();
        let mut pin = GpioPin::new(2);

        pin.set_irq_type(IrqType::LevelHigh, &mut ops);
        pin.unmask(&mut ops);
        assert!(ops.triggered.is_empty());

        pin.set_input(true, &mut ops);
        assert_eq!(ops.triggered, vec![2]);
        ops.triggered.clear();

        pin.set_input(false, &mut ops);
        pin.unmask(&mut ops);
        assert!(ops.triggered.is_empty());
    }

    #[test]
    fn irq_edge_rising() {
        let mut ops = RecordingOps::default();
        let mut pin = GpioPin::new(63);

        pin.set_irq_type(IrqType::EdgeRising, &mut ops);
        pin.set_input(false, &mut ops);
        pin.set_input(true, &mut ops);
        assert!(ops.triggered.is_empty());

        pin.unmask(&mut ops);
        assert_eq!(ops.triggered, vec![63]);
        ops.triggered.clear();

        pin.set_input(false, &mut ops);
        pin.set_input(true, &mut ops);
        pin.unmask(&mut ops);
        assert_eq!(ops.triggered, vec![63]);
    }

    #[test]
    fn irq_edge_falling() {
        let mut ops = RecordingOps::default();
        let mut pin = GpioPin::new(0);

        pin.set_irq_type(IrqType::EdgeFalling, &mut ops);
        pin.unmask(&mut ops);
        pin.set_input(false, &mut ops);
        pin.set_input(true, &mut ops);
        assert!(ops.triggered.is_empty());

        pin.set_input(false, &mut ops);
        assert_eq!(ops.triggered, vec![0]);
        ops.triggered.clear();

        pin.set_input(true, &mut ops);
        pin.set_input(false, &mut ops);
        pin.set_input(true, &mut ops);
        pin.unmask(&mut ops);
        assert_eq!(ops.triggered, vec![0]);
    }

    #[test]
    fn irq_edge_both() {
        let mut ops = RecordingOps::default();
        let mut pin = GpioPin::new(32);

        pin.set_irq_type(IrqType::EdgeBoth, &mut ops);
        pin.unmask(&mut ops);
        pin.set_input(false, &mut ops);
        pin.set_input(true, &mut ops);
        assert_eq!(ops.triggered, vec![32]);

        pin.set_input(false, &mut ops);
        assert_eq!(ops.triggered, vec![32]);
        ops.triggered.clear();

        pin.set_input(true, &mut ops);
        pin.unmask(&mut ops);
        assert_eq!(ops.triggered, vec![32]);
    }

    #[test]
    fn irq_type_none_masks() {
        let mut ops = RecordingOps::default();
        let mut pin = GpioPin::new(5);

        pin.set_irq_type(IrqType::LevelHigh, &mut ops);
        pin.set_input(true, &mut ops);
        pin.set_irq_type(IrqType::None, &mut ops);
        pin.unmask(&mut ops);
        assert!(ops.triggered.is_empty());
    }

    #[test]
    fn hub_validates_pins_and_types() {
        let mut ops = RecordingOps::default();
        let mut hub = GpioHub::new();
        assert!(hub.set_input(NGPIO, true, &mut ops).is_err());
        assert!(hub.set_irq_type(0, 0x05, &mut ops).is_err());
        hub.set_value(7, 1).unwrap();
        assert_eq!(hub.out_value(7), Some(true));
        assert_eq!(hub.out_value(8), None);
    }
}
