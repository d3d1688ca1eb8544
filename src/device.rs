// Copyright © 2024 Axis Communications AB
//
// SPDX-License-Identifier: Apache-2.0

//! Per-device vhost-user state machine.
//!
//! One [`VuDev`] exists per emulated device. It owns the listening
//! socket until the frontend connects, then the connected endpoint, the
//! vrings, the negotiated feature state and the current guest memory
//! table. The request dispatcher in the `vhost-user` crate drives it
//! through the [`VhostUserDeviceReqHandler`] trait.

use std::os::unix::io::{AsRawFd, FromRawFd, RawFd};
use std::sync::Arc;

use log::debug;
use vhost_user::message::{
    VhostUserConfigFlags, VhostUserMemoryRegion, VhostUserProtocolFeatures,
    VhostUserVirtioFeatures, VhostUserVringAddrFlags, VhostUserVringState,
};
use vhost_user::{
    DeviceReqHandler, Error as VuError, Listener, Result as VuResult, VhostUserDeviceReqHandler,
};
use virtqueue::{VqElement, Virtqueue};
use vm_memory::{GuestAddress, GuestMemoryMmap};
use vmm_sys_util::eventfd::EventFd;

use crate::memory::GuestRam;

/// Queue depth offered to the frontend.
pub const MAX_QUEUE_SIZE: u16 = 1024;

/// One vring and its plumbing.
pub struct Vring {
    pub queue: Virtqueue,
    pub kick: Option<EventFd>,
    pub call: Option<EventFd>,
    pub err: Option<EventFd>,
    pub enabled: bool,
}

impl Vring {
    fn new(max_size: u16) -> Self {
        Vring {
            queue: Virtqueue::new(max_size),
            kick: None,
            call: None,
            err: None,
            enabled: false,
        }
    }

    /// A ring is serviced only once its geometry is configured, the kick
    /// fd is installed and the frontend has enabled it.
    pub fn running(&self) -> bool {
        self.queue.ready() && self.enabled && self.kick.is_some()
    }
}

/// An element popped off a queue together with the memory table it was
/// popped under. Holding the `Arc` keeps that table mapped until the
/// element is pushed back, even across a `SET_MEM_TABLE`.
pub struct PoppedElement {
    pub elem: VqElement,
    pub mem: Arc<GuestMemoryMmap>,
}

pub struct VuDev {
    name: &'static str,
    virtio_features: u64,
    protocol_features: VhostUserProtocolFeatures,
    config_space: Vec<u8>,

    pub vrings: Vec<Vring>,

    listener: Option<Listener>,
    conn: Option<DeviceReqHandler>,
    guest_ram: Option<GuestRam>,

    owned: bool,
    acked_features: u64,
    acked_protocol_features: u64,

    quit: bool,
}

impl VuDev {
    pub fn new(
        name: &'static str,
        num_queues: usize,
        virtio_features: u64,
        protocol_features: VhostUserProtocolFeatures,
        config_space: Vec<u8>,
        listener: Option<Listener>,
    ) -> Self {
        VuDev {
            name,
            virtio_features,
            protocol_features,
            config_space,
            vrings: (0..num_queues).map(|_| Vring::new(MAX_QUEUE_SIZE)).collect(),
            listener,
            conn: None,
            guest_ram: None,
            owned: false,
            acked_features: 0,
            acked_protocol_features: 0,
            quit: false,
        }
    }

    pub fn name(&self) -> &'static str {
        self.name
    }

    pub fn listener_fd(&self) -> Option<RawFd> {
        self.listener.as_ref().map(|l| l.as_raw_fd())
    }

    /// Accept the frontend connection and drop the listener; each device
    /// serves exactly one connection per run.
    pub fn accept(&mut self) -> VuResult<RawFd> {
        let listener = self.listener.take().ok_or(VuError::InvalidOperation)?;
        let endpoint = listener.accept()?;
        let fd = endpoint.as_raw_fd();
        self.conn = Some(DeviceReqHandler::new(endpoint));
        debug!("{}: frontend connected", self.name);
        Ok(fd)
    }

    /// Handle one message from the connected frontend.
    pub fn handle_request(&mut self) -> VuResult<()> {
        let mut conn = self.conn.take().ok_or(VuError::InvalidOperation)?;
        let res = conn.handle_request(self);
        self.conn = Some(conn);
        res
    }

    pub fn set_quit(&mut self) {
        self.quit = true;
        self.conn = None;
    }

    pub fn quit(&self) -> bool {
        self.quit
    }

    pub fn mem(&self) -> Option<&Arc<GuestMemoryMmap>> {
        self.guest_ram.as_ref().map(|ram| ram.mem())
    }

    #[cfg(test)]
    pub fn set_guest_ram_for_test(&mut self, ram: GuestRam) {
        self.guest_ram = Some(ram);
    }

    /// Drain the next available element from a queue.
    pub fn pop(&mut self, qidx: usize) -> Result<Option<PoppedElement>, virtqueue::Error> {
        let mem = match self.guest_ram.as_ref() {
            Some(ram) => ram.mem().clone(),
            None => return Ok(None),
        };
        let vring = &mut self.vrings[qidx];
        if !vring.running() {
            return Ok(None);
        }
        Ok(vring
            .queue
            .pop(&mem)?
            .map(|elem| PoppedElement { elem, mem }))
    }

    /// Publish a completion, retiring the element.
    pub fn push(
        &mut self,
        qidx: usize,
        mem: &GuestMemoryMmap,
        head_index: u16,
        used_bytes: u32,
    ) -> Result<(), virtqueue::Error> {
        self.vrings[qidx].queue.push(mem, head_index, used_bytes)
    }

    /// Signal the guest that the used ring advanced, unless it asked us
    /// not to.
    pub fn notify(&mut self, qidx: usize, mem: &GuestMemoryMmap) {
        let vring = &self.vrings[qidx];
        match vring.queue.needs_notification(mem) {
            Ok(false) => return,
            Ok(true) => {}
            Err(e) => {
                log::warn!("{}: reading avail flags failed: {}", self.name, e);
                return;
            }
        }
        if let Some(call) = vring.call.as_ref() {
            if let Err(e) = call.write(1) {
                log::warn!("{}: call eventfd write failed: {}", self.name, e);
            }
        }
    }

    fn check_queue_index(&self, index: u32) -> VuResult<usize> {
        // Validate against the number of queues this personality has, not
        // some byte-size of the array.
        if (index as usize) < self.vrings.len() {
            Ok(index as usize)
        } else {
            Err(VuError::InvalidParam)
        }
    }

    fn take_fd(fd: Option<RawFd>) -> Option<EventFd> {
        // Safe because the descriptor arrived via SCM_RIGHTS and is ours;
        // wrapping it hands its lifetime to the EventFd.
        fd.map(|fd| unsafe { EventFd::from_raw_fd(fd) })
    }
}

impl VhostUserDeviceReqHandler for VuDev {
    fn set_owner(&mut self) -> VuResult<()> {
        if self.owned {
            return Err(VuError::InvalidOperation);
        }
        self.owned = true;
        Ok(())
    }

    fn reset_owner(&mut self) -> VuResult<()> {
        self.owned = false;
        self.acked_features = 0;
        self.acked_protocol_features = 0;
        Ok(())
    }

    fn get_features(&mut self) -> VuResult<u64> {
        Ok(self.virtio_features | VhostUserVirtioFeatures::PROTOCOL_FEATURES.bits())
    }

    fn set_features(&mut self, features: u64) -> VuResult<()> {
        let supported = self.virtio_features | VhostUserVirtioFeatures::PROTOCOL_FEATURES.bits();
        if features & !supported != 0 {
            return Err(VuError::InvalidParam);
        }
        self.acked_features = features;

        // Without VHOST_USER_F_PROTOCOL_FEATURES rings start out enabled;
        // with it they stay disabled until SET_VRING_ENABLE.
        let vring_enabled =
            features & VhostUserVirtioFeatures::PROTOCOL_FEATURES.bits() == 0;
        for vring in self.vrings.iter_mut() {
            vring.enabled = vring_enabled;
        }
        Ok(())
    }

    fn set_mem_table(&mut self, regions: &[VhostUserMemoryRegion], fds: &[RawFd]) -> VuResult<()> {
        debug!("{}: memory table with {} regions", self.name, regions.len());
        let ram = GuestRam::new(regions, fds)
            .map_err(|e| VuError::ReqHandlerError(std::io::Error::other(e)))?;
        // The previous table (if any) stays alive through the Arcs held
        // by in-flight elements and is unmapped when the last one retires.
        self.guest_ram = Some(ram);
        Ok(())
    }

    fn set_vring_num(&mut self, index: u32, num: u32) -> VuResult<()> {
        let index = self.check_queue_index(index)?;
        if num == 0 || num > u32::from(MAX_QUEUE_SIZE) || !num.is_power_of_two() {
            return Err(VuError::InvalidParam);
        }
        self.vrings[index].queue.set_size(num as u16);
        Ok(())
    }

    fn set_vring_addr(
        &mut self,
        index: u32,
        _flags: VhostUserVringAddrFlags,
        descriptor: u64,
        used: u64,
        available: u64,
        _log: u64,
    ) -> VuResult<()> {
        let index = self.check_queue_index(index)?;
        let ram = self.guest_ram.as_ref().ok_or(VuError::InvalidParam)?;

        let to_gpa = |addr| {
            ram.vmm_va_to_gpa(addr)
                .map_err(|e| VuError::ReqHandlerError(std::io::Error::other(e)))
        };
        let desc_table = to_gpa(descriptor)?;
        let avail_ring = to_gpa(available)?;
        let used_ring = to_gpa(used)?;

        let queue = &mut self.vrings[index].queue;
        queue.set_desc_table_address(GuestAddress(desc_table));
        queue.set_avail_ring_address(GuestAddress(avail_ring));
        queue.set_used_ring_address(GuestAddress(used_ring));
        Ok(())
    }

    fn set_vring_base(&mut self, index: u32, base: u32) -> VuResult<()> {
        let index = self.check_queue_index(index)?;
        let queue = &mut self.vrings[index].queue;
        queue.set_next_avail(base as u16);
        queue.set_next_used(base as u16);
        Ok(())
    }

    fn get_vring_base(&mut self, index: u32) -> VuResult<VhostUserVringState> {
        let idx = self.check_queue_index(index)?;
        // Fetching the base stops the ring; the kick watch is reconciled
        // away by the event loop afterwards.
        self.vrings[idx].queue.set_ready(false);
        let next_avail = self.vrings[idx].queue.next_avail();
        debug!("{}: vring {} stopped at base {}", self.name, idx, next_avail);
        Ok(VhostUserVringState::new(index, u32::from(next_avail)))
    }

    fn set_vring_kick(&mut self, index: u8, fd: Option<RawFd>) -> VuResult<()> {
        let index = self.check_queue_index(u32::from(index))?;
        // Replacing the fd drops (closes) the previous one.
        self.vrings[index].kick = Self::take_fd(fd);
        // Receiving the kick fd (re)starts the ring. The ring geometry is
        // checked when the first element is popped; the frontend may still
        // be sending configuration messages at this point.
        self.vrings[index].queue.set_ready(true);
        Ok(())
    }

    fn set_vring_call(&mut self, index: u8, fd: Option<RawFd>) -> VuResult<()> {
        let index = self.check_queue_index(u32::from(index))?;
        self.vrings[index].call = Self::take_fd(fd);
        Ok(())
    }

    fn set_vring_err(&mut self, index: u8, fd: Option<RawFd>) -> VuResult<()> {
        let index = self.check_queue_index(u32::from(index))?;
        self.vrings[index].err = Self::take_fd(fd);
        Ok(())
    }

    fn get_protocol_features(&mut self) -> VuResult<VhostUserProtocolFeatures> {
        Ok(self.protocol_features)
    }

    fn set_protocol_features(&mut self, features: u64) -> VuResult<()> {
        self.acked_protocol_features = features;
        Ok(())
    }

    fn get_queue_num(&mut self) -> VuResult<u64> {
        Ok(self.vrings.len() as u64)
    }

    fn set_vring_enable(&mut self, index: u32, enable: bool) -> VuResult<()> {
        if self.acked_features & VhostUserVirtioFeatures::PROTOCOL_FEATURES.bits() == 0 {
            return Err(VuError::InvalidOperation);
        }
        let index = self.check_queue_index(index)?;
        self.vrings[index].enabled = enable;
        debug!("{}: vring {} {}", self.name, index, if enable { "enabled" } else { "disabled" });
        Ok(())
    }

    fn get_config(
        &mut self,
        offset: u32,
        size: u32,
        _flags: VhostUserConfigFlags,
    ) -> VuResult<Vec<u8>> {
        let offset = offset as usize;
        let size = size as usize;
        if self.config_space.is_empty() {
            return Err(VuError::InvalidOperation);
        }
        if offset.checked_add(size).map_or(true, |end| end > self.config_space.len()) {
            return Err(VuError::InvalidParam);
        }
        Ok(self.config_space[offset..offset + size].to_vec())
    }

    fn set_config(
        &mut self,
        _offset: u32,
        _buf: &[u8],
        _flags: VhostUserConfigFlags,
    ) -> VuResult<()> {
        // All exposed config spaces are read-only.
        Err(VuError::InvalidOperation)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_dev() -> VuDev {
        VuDev::new(
            "test",
            2,
            0x1,
            VhostUserProtocolFeatures::CONFIG,
            vec![1, 2, 3, 4],
            None,
        )
    }

    #[test]
    fn owner_can_be_set_once() {
        let mut dev = test_dev();
        dev.set_owner().unwrap();
        assert!(dev.set_owner().is_err());
        dev.reset_owner().unwrap();
        dev.set_owner().unwrap();
    }

    #[test]
    fn features_round_trip() {
        let mut dev = test_dev();
        let features = dev.get_features().unwrap();
        assert_eq!(
            features,
            0x1 | VhostUserVirtioFeatures::PROTOCOL_FEATURES.bits()
        );
        dev.set_features(features).unwrap();
        assert!(dev.set_features(1u64 << 40).is_err());
    }

    #[test]
    fn rings_enabled_without_protocol_features() {
        let mut dev = test_dev();
        dev.set_features(0x1).unwrap();
        assert!(dev.vrings.iter().all(|vring| vring.enabled));

        dev.set_features(0x1 | VhostUserVirtioFeatures::PROTOCOL_FEATURES.bits())
            .unwrap();
        assert!(dev.vrings.iter().all(|vring| !vring.enabled));
    }

    #[test]
    fn enable_requires_negotiation() {
        let mut dev = test_dev();
        assert!(dev.set_vring_enable(0, true).is_err());
        dev.set_features(VhostUserVirtioFeatures::PROTOCOL_FEATURES.bits())
            .unwrap();
        dev.set_vring_enable(0, true).unwrap();
        assert!(dev.vrings[0].enabled);
        assert!(dev.set_vring_enable(2, true).is_err());
    }

    #[test]
    fn queue_index_validated_by_count() {
        let mut dev = test_dev();
        assert!(dev.set_vring_num(1, 256).is_ok());
        assert!(dev.set_vring_num(2, 256).is_err());
        assert!(dev.set_vring_num(0, 0).is_err());
        assert!(dev.set_vring_num(0, 24).is_err());
        assert!(dev.set_vring_num(0, 2048).is_err());
    }

    #[test]
    fn get_vring_base_stops_ring() {
        let mut dev = test_dev();
        dev.vrings[0].queue.set_ready(true);
        dev.vrings[0].queue.set_next_avail(7);
        let state = dev.get_vring_base(0).unwrap();
        assert_eq!({ state.num }, 7);
        assert!(!dev.vrings[0].queue.ready());
    }

    #[test]
    fn config_space_bounds() {
        let mut dev = test_dev();
        assert_eq!(
            dev.get_config(0, 4, VhostUserConfigFlags::empty()).unwrap(),
            vec![1, 2, 3, 4]
        );
        assert_eq!(
            dev.get_config(2, 2, VhostUserConfigFlags::empty()).unwrap(),
            vec![3, 4]
        );
        assert!(dev.get_config(2, 4, VhostUserConfigFlags::empty()).is_err());
        assert!(dev
            .set_config(0, &[0], VhostUserConfigFlags::empty())
            .is_err());
    }
}
