// Copyright © 2024 Axis Communications AB
//
// SPDX-License-Identifier: Apache-2.0

//! Platform (MMIO) device models.
//!
//! The guest sees the model's registers through a PCI BAR. The low part
//! of the BAR is reserved for the bus-scan window: the probe logic walks
//! it looking for cores, and the canned answers below terminate that scan
//! immediately so only the device under test is discovered.

use std::collections::BTreeMap;

use log::debug;

use super::{HostOps, ModelError, Result};
use crate::control::{parse_int, Args};

const BCMA_SCAN_ER_VALID: u32 = 1;
const BCMA_SCAN_ER_TAG_END: u32 = 0xe;
const BCMA_CORE_SIZE: u64 = 0x1000;

/// One emulated MMIO register block.
pub trait PlatformModel {
    fn read(&mut self, addr: u64, size: u32, ops: &mut dyn HostOps) -> Result<u32>;
    fn write(&mut self, addr: u64, size: u32, value: u32, ops: &mut dyn HostOps) -> Result<()>;

    /// Model-specific commands from the control channel.
    fn control(&mut self, method: &str, _args: &Args, _ops: &mut dyn HostOps) -> Result<()> {
        Err(ModelError::UnknownMethod(method.to_string()))
    }
}

pub struct PlatformHub {
    model: Option<Box<dyn PlatformModel>>,
}

impl PlatformHub {
    pub fn new() -> Self {
        PlatformHub { model: None }
    }

    pub fn load_model(&mut self, name: &str, args: &Args) -> Result<()> {
        self.model = Some(build_model(name, args)?);
        debug!("platform: loaded model {}", name);
        Ok(())
    }

    pub fn unload_model(&mut self) {
        self.model = None;
    }

    pub fn read(&mut self, addr: u64, size: u32, ops: &mut dyn HostOps) -> Result<u32> {
        debug!("platform read addr {:#x} size {}", addr, size);
        if addr == 0 {
            return Ok(BCMA_SCAN_ER_TAG_END | BCMA_SCAN_ER_VALID);
        }
        if addr < BCMA_CORE_SIZE {
            return Ok(0);
        }
        let model = self.model.as_mut().ok_or(ModelError::NoModel("platform"))?;
        model.read(addr, size, ops)
    }

    pub fn write(&mut self, addr: u64, size: u32, value: u32, ops: &mut dyn HostOps) -> Result<()> {
        debug!(
            "platform write addr {:#x} size {} value {:#x}",
            addr, size, value
        );
        let model = self.model.as_mut().ok_or(ModelError::NoModel("platform"))?;
        model.write(addr, size, value, ops)
    }

    pub fn control(&mut self, method: &str, args: &Args, ops: &mut dyn HostOps) -> Result<()> {
        let model = self.model.as_mut().ok_or(ModelError::NoModel("platform"))?;
        model.control(method, args, ops)
    }
}

impl Default for PlatformHub {
    fn default() -> Self {
        Self::new()
    }
}

fn build_model(name: &str, args: &Args) -> Result<Box<dyn PlatformModel>> {
    match name {
        "simple-regs" => Ok(Box::new(SimpleReg32Model::from_args(args)?)),
        _ => Err(ModelError::UnknownModel(name.to_string())),
    }
}

/// A fixed map of 32-bit registers; everything else is a bus error.
pub struct SimpleReg32Model {
    regs: BTreeMap<u64, u32>,
}

impl SimpleReg32Model {
    /// Build from control-channel arguments: `regs=0x1000:0x12,...`
    pub fn from_args(args: &Args) -> Result<Self> {
        let mut regs = BTreeMap::new();
        for entry in args
            .get_str("regs")
            .unwrap_or("")
            .split(',')
            .filter(|entry| !entry.is_empty())
        {
            let (addr, val) = entry.split_once(':').ok_or_else(|| {
                ModelError::BadArgument(format!("register entry {:?} is not addr:val", entry))
            })?;
            regs.insert(parse_int(addr)?, parse_int(val)? as u32);
        }
        Ok(SimpleReg32Model { regs })
    }

    fn check_size(size: u32) -> Result<()> {
        if size != 4 {
            return Err(ModelError::BadArgument(format!(
                "unsupported access size {}",
                size
            )));
        }
        Ok(())
    }
}

impl PlatformModel for SimpleReg32Model {
    fn read(&mut self, addr: u64, size: u32, _ops: &mut dyn HostOps) -> Result<u32> {
        Self::check_size(size)?;
        self.regs
            .get(&addr)
            .copied()
            .ok_or_else(|| ModelError::Failure(format!("read of unknown register {:#x}", addr)))
    }

    fn write(&mut self, addr: u64, size: u32, value: u32, _ops: &mut dyn HostOps) -> Result<()> {
        Self::check_size(size)?;
        match self.regs.get_mut(&addr) {
            Some(slot) => {
                *slot = value;
                Ok(())
            }
            None => Err(ModelError::Failure(format!(
                "write of unknown register {:#x}",
                addr
            ))),
        }
    }
}
