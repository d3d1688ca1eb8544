// Copyright © 2024 Axis Communications AB
//
// SPDX-License-Identifier: Apache-2.0

//! I2C chip models.
//!
//! The hub owns whichever model the harness loaded and routes bus
//! transactions to it. The wire address carries the read/write bit in
//! bit 0, so models see the plain 7-bit chip address.

use std::collections::BTreeMap;

use log::debug;

use super::{HostOps, ModelError, Result};
use crate::control::{parse_int, Args};

/// One emulated I2C chip.
pub trait I2cModel {
    /// A bus read of `len` bytes addressed to the chip.
    fn read(&mut self, addr: u16, len: usize, ops: &mut dyn HostOps) -> Result<Vec<u8>>;

    /// A bus write addressed to the chip. `data` is empty for an
    /// address-only (probe) transfer.
    fn write(&mut self, addr: u16, data: &[u8], ops: &mut dyn HostOps) -> Result<()>;

    /// Model-specific commands from the control channel.
    fn control(&mut self, method: &str, _args: &Args, _ops: &mut dyn HostOps) -> Result<()> {
        Err(ModelError::UnknownMethod(method.to_string()))
    }
}

pub struct I2cHub {
    model: Option<Box<dyn I2cModel>>,
}

impl I2cHub {
    pub fn new() -> Self {
        I2cHub { model: None }
    }

    pub fn load_model(&mut self, name: &str, args: &Args) -> Result<()> {
        self.model = Some(build_model(name, args)?);
        debug!("i2c: loaded model {}", name);
        Ok(())
    }

    pub fn unload_model(&mut self) {
        self.model = None;
    }

    pub fn read(&mut self, wire_addr: u16, len: usize, ops: &mut dyn HostOps) -> Result<Vec<u8>> {
        debug!("i2c read addr {:#x} len {}", wire_addr, len);
        let model = self.model.as_mut().ok_or(ModelError::NoModel("i2c"))?;
        model.read(wire_addr >> 1, len, ops)
    }

    pub fn write(&mut self, wire_addr: u16, data: &[u8], ops: &mut dyn HostOps) -> Result<()> {
        debug!("i2c write addr {:#x} len {}", wire_addr, data.len());
        let model = self.model.as_mut().ok_or(ModelError::NoModel("i2c"))?;
        model.write(wire_addr >> 1, data, ops)
    }

    pub fn control(&mut self, method: &str, args: &Args, ops: &mut dyn HostOps) -> Result<()> {
        let model = self.model.as_mut().ok_or(ModelError::NoModel("i2c"))?;
        model.control(method, args, ops)
    }
}

impl Default for I2cHub {
    fn default() -> Self {
        Self::new()
    }
}

fn build_model(name: &str, args: &Args) -> Result<Box<dyn I2cModel>> {
    match name {
        "simple-smbus" => Ok(Box::new(SimpleSmbusModel::from_args(args)?)),
        _ => Err(ModelError::UnknownModel(name.to_string())),
    }
}

/// Backing register storage for [`SmbusModel`].
pub trait RegisterMap {
    fn reg_read(&mut self, addr: u8) -> Result<u64>;
    fn reg_write(&mut self, addr: u8, val: u64) -> Result<()>;
}

/// SMBus-style register access on top of raw bus transfers.
///
/// The first written byte latches the register address; remaining bytes
/// are register values, `regbytes` wide each. Reads return consecutive
/// registers starting at the latched address.
pub struct SmbusModel<R> {
    regs: R,
    reg_addr: u8,
    regbytes: usize,
    big_endian: bool,
}

impl<R: RegisterMap> SmbusModel<R> {
    pub fn new(regs: R, regbytes: usize, big_endian: bool) -> Self {
        SmbusModel {
            regs,
            reg_addr: 0,
            regbytes,
            big_endian,
        }
    }

    fn val_to_bytes(&self, val: u64) -> Vec<u8> {
        if self.big_endian {
            val.to_be_bytes()[8 - self.regbytes..].to_vec()
        } else {
            val.to_le_bytes()[..self.regbytes].to_vec()
        }
    }

    fn bytes_to_val(&self, data: &[u8]) -> u64 {
        let mut val = 0u64;
        if self.big_endian {
            for byte in data {
                val = (val << 8) | u64::from(*byte);
            }
        } else {
            for byte in data.iter().rev() {
                val = (val << 8) | u64::from(*byte);
            }
        }
        val
    }
}

impl<R: RegisterMap> I2cModel for SmbusModel<R> {
    fn read(&mut self, _addr: u16, len: usize, _ops: &mut dyn HostOps) -> Result<Vec<u8>> {
        let mut data = Vec::with_capacity(len);
        for idx in (0..len).step_by(self.regbytes) {
            let addr = self.reg_addr.wrapping_add(idx as u8);
            let val = self.regs.reg_read(addr)?;
            debug!("smbus read addr {:#04x} val {:#x}", addr, val);
            data.extend_from_slice(&self.val_to_bytes(val));
        }
        data.truncate(len);
        Ok(data)
    }

    fn write(&mut self, _addr: u16, data: &[u8], _ops: &mut dyn HostOps) -> Result<()> {
        let Some((&reg_addr, values)) = data.split_first() else {
            return Err(ModelError::Failure("empty smbus write".to_string()));
        };
        self.reg_addr = reg_addr;

        if values.is_empty() {
            return Ok(());
        }
        if values.len() % self.regbytes != 0 {
            return Err(ModelError::Failure(format!(
                "smbus write of {} bytes not a multiple of {}",
                values.len(),
                self.regbytes
            )));
        }
        for (idx, chunk) in values.chunks(self.regbytes).enumerate() {
            let addr = self.reg_addr.wrapping_add((idx * self.regbytes) as u8);
            let val = self.bytes_to_val(chunk);
            debug!("smbus write addr {:#04x} val {:#x}", addr, val);
            self.regs.reg_write(addr, val)?;
        }
        Ok(())
    }
}

/// A fixed register map; access to an unlisted register is a bus error.
pub struct SimpleRegs {
    regs: BTreeMap<u8, u64>,
}

impl SimpleRegs {
    pub fn new(regs: BTreeMap<u8, u64>) -> Self {
        SimpleRegs { regs }
    }
}

impl RegisterMap for SimpleRegs {
    fn reg_read(&mut self, addr: u8) -> Result<u64> {
        self.regs
            .get(&addr)
            .copied()
            .ok_or_else(|| ModelError::Failure(format!("read of unknown register {:#04x}", addr)))
    }

    fn reg_write(&mut self, addr: u8, val: u64) -> Result<()> {
        match self.regs.get_mut(&addr) {
            Some(slot) => {
                *slot = val;
                Ok(())
            }
            None => Err(ModelError::Failure(format!(
                "write of unknown register {:#04x}",
                addr
            ))),
        }
    }
}

pub type SimpleSmbusModel = SmbusModel<SimpleRegs>;

impl SimpleSmbusModel {
    /// Build from control-channel arguments:
    /// `regs=0x00:0x12,0x01:0x34 [regbytes=N] [byteorder=little|big]`
    pub fn from_args(args: &Args) -> Result<Self> {
        let regs = parse_reg_list(args.get_str("regs").unwrap_or(""))?;
        let regbytes = args.int_or("regbytes", 1)? as usize;
        if regbytes == 0 || regbytes > 8 {
            return Err(ModelError::BadArgument(format!(
                "regbytes {} out of range",
                regbytes
            )));
        }
        let big_endian = match args.get_str("byteorder").unwrap_or("little") {
            "little" => false,
            "big" => true,
            other => {
                return Err(ModelError::BadArgument(format!(
                    "byteorder {:?} not recognized",
                    other
                )))
            }
        };
        Ok(SmbusModel::new(SimpleRegs::new(regs), regbytes, big_endian))
    }
}

fn parse_reg_list(spec: &str) -> Result<BTreeMap<u8, u64>> {
    let mut regs = BTreeMap::new();
    for entry in spec.split(',').filter(|entry| !entry.is_empty()) {
        let (addr, val) = entry.split_once(':').ok_or_else(|| {
            ModelError::BadArgument(format!("register entry {:?} is not addr:val", entry))
        })?;
        regs.insert(parse_int(addr)? as u8, parse_int(val)?);
    }
    Ok(regs)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::testing::RecordingOps;
    use std::collections::HashMap;

    // A register file accepting any address, for exercising the SMBus
    // protocol logic itself.
    #[derive(Default)]
    struct SparseRegs {
        regs: HashMap<u8, u64>,
    }

    impl RegisterMap for SparseRegs {
        fn reg_read(&mut self, addr: u8) -> Result<u64> {
            Ok(self.regs.get(&addr).copied().unwrap_or(0))
        }

        fn reg_write(&mut self, addr: u8, val: u64) -> Result<()> {
            self.regs.insert(addr, val);
            Ok(())
        }
    }

    #[test]
    fn smbus_single_byte_registers() {
        let mut ops = RecordingOps::default();
        let mut m = SmbusModel::new(SparseRegs::default(), 1, false);

        m.write(0, &[0x12, 0x34], &mut ops).unwrap();
        m.write(0, &[0x13, 0xab, 0xcd], &mut ops).unwrap();

        assert_eq!(m.regs.regs[&0x12], 0x34);
        assert_eq!(m.regs.regs[&0x13], 0xab);
        assert_eq!(m.regs.regs[&0x14], 0xcd);

        m.write(0, &[0x12], &mut ops).unwrap();
        assert_eq!(m.read(0, 1, &mut ops).unwrap(), vec![0x34]);

        m.write(0, &[0x12], &mut ops).unwrap();
        assert_eq!(m.read(0, 3, &mut ops).unwrap(), vec![0x34, 0xab, 0xcd]);
    }

    #[test]
    fn smbus_two_byte_big_endian() {
        let mut ops = RecordingOps::default();
        let mut m = SmbusModel::new(SparseRegs::default(), 2, true);

        m.write(0, &[0x12, 0x34, 0x56, 0xab, 0xcd], &mut ops).unwrap();
        assert_eq!(m.regs.regs[&0x12], 0x3456);
        assert_eq!(m.regs.regs[&0x14], 0xabcd);

        m.write(0, &[0x12], &mut ops).unwrap();
        assert_eq!(m.read(0, 2, &mut ops).unwrap(), vec![0x34, 0x56]);

        m.write(0, &[0x14], &mut ops).unwrap();
        assert_eq!(m.read(0, 2, &mut ops).unwrap(), vec![0xab, 0xcd]);

        m.write(0, &[0x12], &mut ops).unwrap();
        assert_eq!(
            m.read(0, 4, &mut ops).unwrap(),
            vec![0x34, 0x56, 0xab, 0xcd]
        );
    }

    #[test]
    fn smbus_two_byte_little_endian() {
        let mut ops = RecordingOps::default();
        let mut m = SmbusModel::new(SparseRegs::default(), 2, false);

        m.write(0, &[0x12, 0x34, 0x56, 0xab, 0xcd], &mut ops).unwrap();
        assert_eq!(m.regs.regs[&0x12], 0x5634);
        assert_eq!(m.regs.regs[&0x14], 0xcdab);

        m.write(0, &[0x12], &mut ops).unwrap();
        assert_eq!(m.read(0, 2, &mut ops).unwrap(), vec![0x34, 0x56]);
    }

    #[test]
    fn smbus_rejects_bad_writes() {
        let mut ops = RecordingOps::default();
        let mut m = SmbusModel::new(SparseRegs::default(), 2, false);
        assert!(m.write(0, &[], &mut ops).is_err());
        assert!(m.write(0, &[0x10, 0x01], &mut ops).is_err());
    }

    #[test]
    fn simple_model_is_strict() {
        let mut regs = BTreeMap::new();
        regs.insert(0x01, 0x12);
        regs.insert(0x02, 0x34);
        let mut regs = SimpleRegs::new(regs);

        assert_eq!(regs.reg_read(0x01).unwrap(), 0x12);
        assert_eq!(regs.reg_read(0x02).unwrap(), 0x34);

        regs.reg_write(0x01, 0x56).unwrap();
        assert_eq!(regs.reg_read(0x01).unwrap(), 0x56);
        assert_eq!(regs.reg_read(0x02).unwrap(), 0x34);

        assert!(regs.reg_write(0x03, 0x00).is_err());
        assert!(regs.reg_read(0x03).is_err());
    }

    #[test]
    fn simple_model_from_args() {
        let args = Args::parse(&["regs=0x00:0x12,0x01:0xff", "regbytes=1"]).unwrap();
        let mut ops = RecordingOps::default();
        let mut m = SimpleSmbusModel::from_args(&args).unwrap();

        m.write(0x09, &[0x00], &mut ops).unwrap();
        assert_eq!(m.read(0x09, 2, &mut ops).unwrap(), vec![0x12, 0xff]);

        assert!(SimpleSmbusModel::from_args(
            &Args::parse(&["regs=0x00:0x12", "byteorder=middle"]).unwrap()
        )
        .is_err());
    }

    #[test]
    fn hub_requires_model() {
        let mut ops = RecordingOps::default();
        let mut hub = I2cHub::new();
        assert!(matches!(
            hub.read(0x12, 1, &mut ops),
            Err(ModelError::NoModel("i2c"))
        ));

        let args = Args::parse(&["regs=0x80:0x50"]).unwrap();
        hub.load_model("simple-smbus", &args).unwrap();
        hub.write(0x12, &[0x80], &mut ops).unwrap();
        // The hub strips the read/write bit: wire address 0x12 is chip 0x09.
        assert_eq!(hub.read(0x12, 1, &mut ops).unwrap(), vec![0x50]);

        hub.unload_model();
        assert!(hub.write(0x12, &[0], &mut ops).is_err());
        assert!(hub.load_model("no-such-model", &args).is_err());
    }
}
