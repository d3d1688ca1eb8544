// Copyright © 2024 Axis Communications AB
//
// SPDX-License-Identifier: Apache-2.0

//! Dispatch of frontend requests onto a backend device object.

use std::mem;
use std::os::unix::io::{AsRawFd, RawFd};
use std::slice;

use log::debug;

use crate::connection::Endpoint;
use crate::message::*;
use crate::{Error, Result};

/// Operations a backend device must provide. The dispatcher translates
/// each wire message into exactly one call.
///
/// All methods take `&mut self`: the whole backend runs on one thread and
/// the device object is exclusively owned by its connection while a
/// request is being handled.
#[allow(missing_docs)]
pub trait VhostUserDeviceReqHandler {
    fn set_owner(&mut self) -> Result<()>;
    fn reset_owner(&mut self) -> Result<()>;
    fn get_features(&mut self) -> Result<u64>;
    fn set_features(&mut self, features: u64) -> Result<()>;
    fn set_mem_table(&mut self, regions: &[VhostUserMemoryRegion], fds: &[RawFd]) -> Result<()>;
    fn set_vring_num(&mut self, index: u32, num: u32) -> Result<()>;
    fn set_vring_addr(
        &mut self,
        index: u32,
        flags: VhostUserVringAddrFlags,
        descriptor: u64,
        used: u64,
        available: u64,
        log: u64,
    ) -> Result<()>;
    fn set_vring_base(&mut self, index: u32, base: u32) -> Result<()>;
    fn get_vring_base(&mut self, index: u32) -> Result<VhostUserVringState>;
    fn set_vring_kick(&mut self, index: u8, fd: Option<RawFd>) -> Result<()>;
    fn set_vring_call(&mut self, index: u8, fd: Option<RawFd>) -> Result<()>;
    fn set_vring_err(&mut self, index: u8, fd: Option<RawFd>) -> Result<()>;
    fn get_protocol_features(&mut self) -> Result<VhostUserProtocolFeatures>;
    fn set_protocol_features(&mut self, features: u64) -> Result<()>;
    fn get_queue_num(&mut self) -> Result<u64>;
    fn set_vring_enable(&mut self, index: u32, enable: bool) -> Result<()>;
    fn get_config(&mut self, offset: u32, size: u32, flags: VhostUserConfigFlags)
        -> Result<Vec<u8>>;
    fn set_config(&mut self, offset: u32, buf: &[u8], flags: VhostUserConfigFlags) -> Result<()>;
}

/// Reads one message at a time from a connected endpoint and relays it to
/// the device object passed in by the caller.
pub struct DeviceReqHandler {
    sock: Endpoint,

    virtio_features: u64,
    acked_virtio_features: u64,
    protocol_features: VhostUserProtocolFeatures,
    acked_protocol_features: u64,

    // Acks for bodyless requests are only sent once REPLY_ACK has been
    // negotiated.
    reply_ack_enabled: bool,
}

impl DeviceReqHandler {
    pub fn new(sock: Endpoint) -> Self {
        DeviceReqHandler {
            sock,
            virtio_features: 0,
            acked_virtio_features: 0,
            protocol_features: VhostUserProtocolFeatures::empty(),
            acked_protocol_features: 0,
            reply_ack_enabled: false,
        }
    }

    /// Receive and handle a single request.
    ///
    /// Returns `Error::Disconnected` when the peer has closed the socket;
    /// the caller treats that as the device's graceful shutdown signal.
    pub fn handle_request<S: VhostUserDeviceReqHandler>(&mut self, backend: &mut S) -> Result<()> {
        // Stream sockets and SCM_RIGHTS interact subtly: attached
        // descriptors are delivered with the first byte of the message, so
        // the header must be received in one read and the payload in a
        // second one sized from the header.
        let (hdr, rfds) = self.sock.recv_header()?;
        let rfds = self.check_attached_rfds(&hdr, rfds)?;
        let buf = match hdr.size() {
            0 => Vec::new(),
            len => self.sock.recv_data(len as usize)?,
        };
        let size = buf.len();

        let req = hdr.code().ok_or(Error::InvalidMessage)?;
        debug!("vhost-user request {:?} size {}", req, size);

        match req {
            FrontendReq::SetOwner => {
                self.check_request_size(&hdr, size, 0)?;
                backend.set_owner()?;
            }
            FrontendReq::ResetOwner => {
                self.check_request_size(&hdr, size, 0)?;
                backend.reset_owner()?;
            }
            FrontendReq::GetFeatures => {
                self.check_request_size(&hdr, size, 0)?;
                let features = backend.get_features()?;
                self.send_reply_message(&hdr, &VhostUserU64::new(features))?;
                self.virtio_features = features;
                self.update_reply_ack_flag();
            }
            FrontendReq::SetFeatures => {
                let msg = self.extract_request_body::<VhostUserU64>(&hdr, size, &buf)?;
                let features = msg.value;
                backend.set_features(features)?;
                self.acked_virtio_features = features;
                self.update_reply_ack_flag();
            }
            FrontendReq::SetMemTable => {
                let res = self.set_mem_table(&hdr, size, &buf, rfds, backend);
                self.send_ack_message(&hdr, res)?;
            }
            FrontendReq::SetVringNum => {
                let msg = self.extract_request_body::<VhostUserVringState>(&hdr, size, &buf)?;
                let res = backend.set_vring_num(msg.index, msg.num);
                self.send_ack_message(&hdr, res)?;
            }
            FrontendReq::SetVringAddr => {
                let msg = self.extract_request_body::<VhostUserVringAddr>(&hdr, size, &buf)?;
                let flags =
                    VhostUserVringAddrFlags::from_bits(msg.flags).ok_or(Error::InvalidMessage)?;
                let res = backend.set_vring_addr(
                    msg.index,
                    flags,
                    msg.descriptor,
                    msg.used,
                    msg.available,
                    msg.log,
                );
                self.send_ack_message(&hdr, res)?;
            }
            FrontendReq::SetVringBase => {
                let msg = self.extract_request_body::<VhostUserVringState>(&hdr, size, &buf)?;
                let res = backend.set_vring_base(msg.index, msg.num);
                self.send_ack_message(&hdr, res)?;
            }
            FrontendReq::GetVringBase => {
                let msg = self.extract_request_body::<VhostUserVringState>(&hdr, size, &buf)?;
                let reply = backend.get_vring_base(msg.index)?;
                self.send_reply_message(&hdr, &reply)?;
            }
            FrontendReq::SetVringKick => {
                self.check_request_size(&hdr, size, mem::size_of::<VhostUserU64>())?;
                let (index, fd) = Self::handle_vring_fd_request(&buf, rfds)?;
                let res = backend.set_vring_kick(index, fd);
                self.send_ack_message(&hdr, res)?;
            }
            FrontendReq::SetVringCall => {
                self.check_request_size(&hdr, size, mem::size_of::<VhostUserU64>())?;
                let (index, fd) = Self::handle_vring_fd_request(&buf, rfds)?;
                let res = backend.set_vring_call(index, fd);
                self.send_ack_message(&hdr, res)?;
            }
            FrontendReq::SetVringErr => {
                self.check_request_size(&hdr, size, mem::size_of::<VhostUserU64>())?;
                let (index, fd) = Self::handle_vring_fd_request(&buf, rfds)?;
                let res = backend.set_vring_err(index, fd);
                self.send_ack_message(&hdr, res)?;
            }
            FrontendReq::GetProtocolFeatures => {
                self.check_request_size(&hdr, size, 0)?;
                let features = backend.get_protocol_features()?;
                self.send_reply_message(&hdr, &VhostUserU64::new(features.bits()))?;
                self.protocol_features = features;
                self.update_reply_ack_flag();
            }
            FrontendReq::SetProtocolFeatures => {
                let msg = self.extract_request_body::<VhostUserU64>(&hdr, size, &buf)?;
                let features = msg.value;
                backend.set_protocol_features(features)?;
                self.acked_protocol_features = features;
                self.update_reply_ack_flag();
            }
            FrontendReq::GetQueueNum => {
                self.check_request_size(&hdr, size, 0)?;
                let num = backend.get_queue_num()?;
                self.send_reply_message(&hdr, &VhostUserU64::new(num))?;
            }
            FrontendReq::SetVringEnable => {
                let msg = self.extract_request_body::<VhostUserVringState>(&hdr, size, &buf)?;
                let enable = match msg.num {
                    1 => true,
                    0 => false,
                    _ => return Err(Error::InvalidParam),
                };
                let res = backend.set_vring_enable(msg.index, enable);
                self.send_ack_message(&hdr, res)?;
            }
            FrontendReq::GetConfig => {
                if self.acked_protocol_features & VhostUserProtocolFeatures::CONFIG.bits() == 0 {
                    return Err(Error::InvalidOperation);
                }
                self.get_config(&hdr, &buf, backend)?;
            }
            FrontendReq::SetConfig => {
                if self.acked_protocol_features & VhostUserProtocolFeatures::CONFIG.bits() == 0 {
                    return Err(Error::InvalidOperation);
                }
                let res = self.set_config(size, &buf, backend);
                self.send_ack_message(&hdr, res)?;
            }
        }
        Ok(())
    }

    fn set_mem_table<S: VhostUserDeviceReqHandler>(
        &mut self,
        hdr: &VhostUserMsgHeader,
        size: usize,
        buf: &[u8],
        rfds: Option<Vec<RawFd>>,
        backend: &mut S,
    ) -> Result<()> {
        self.check_request_size(hdr, size, hdr.size() as usize)?;

        let hdrsize = mem::size_of::<VhostUserMemory>();
        if size < hdrsize {
            Endpoint::close_rfds(rfds);
            return Err(Error::InvalidMessage);
        }
        // Safe: the payload is at least as large as VhostUserMemory and the
        // struct is packed plain data.
        let msg = unsafe { &*(buf.as_ptr() as *const VhostUserMemory) };
        if !msg.is_valid() {
            Endpoint::close_rfds(rfds);
            return Err(Error::InvalidMessage);
        }
        let num_regions = msg.num_regions as usize;
        if size != hdrsize + num_regions * mem::size_of::<VhostUserMemoryRegion>() {
            Endpoint::close_rfds(rfds);
            return Err(Error::InvalidMessage);
        }

        // One descriptor per region, no more, no fewer.
        let fds = match rfds {
            None => return Err(Error::InvalidMessage),
            Some(fds) => {
                if fds.len() != num_regions {
                    Endpoint::close_rfds(Some(fds));
                    return Err(Error::InvalidMessage);
                }
                fds
            }
        };

        // Safe: bounds were validated against the message size above.
        let regions = unsafe {
            slice::from_raw_parts(
                buf.as_ptr().add(hdrsize) as *const VhostUserMemoryRegion,
                num_regions,
            )
        };
        for region in regions.iter() {
            if !region.is_valid() {
                Endpoint::close_rfds(Some(fds));
                return Err(Error::InvalidMessage);
            }
        }

        backend.set_mem_table(regions, &fds)
    }

    fn get_config<S: VhostUserDeviceReqHandler>(
        &mut self,
        hdr: &VhostUserMsgHeader,
        buf: &[u8],
        backend: &mut S,
    ) -> Result<()> {
        if buf.len() < mem::size_of::<VhostUserConfig>() {
            return Err(Error::InvalidMessage);
        }
        // Safe: size checked above, packed plain data.
        let msg = unsafe { &*(buf.as_ptr() as *const VhostUserConfig) };
        if !msg.is_valid() {
            return Err(Error::InvalidMessage);
        }
        let (offset, size) = (msg.offset, msg.size);
        if buf.len() - mem::size_of::<VhostUserConfig>() != size as usize {
            return Err(Error::InvalidMessage);
        }
        let flags = VhostUserConfigFlags::from_bits(msg.flags).ok_or(Error::InvalidMessage)?;

        // A zero-length payload in the reply tells the frontend the access
        // failed.
        let reply_hdr = self.reply_header::<VhostUserConfig>(hdr, size as usize);
        match backend.get_config(offset, size, flags) {
            Ok(ref data) if data.len() == size as usize => {
                let body = VhostUserConfig::new(offset, size, flags);
                self.sock
                    .send_message_with_payload(&reply_hdr, &body, data.as_slice())?;
            }
            Ok(_) | Err(_) => {
                let reply_hdr = self.reply_header::<VhostUserConfig>(hdr, 0);
                let body = VhostUserConfig::new(offset, 0, flags);
                self.sock.send_message(&reply_hdr, &body)?;
            }
        }
        Ok(())
    }

    fn set_config<S: VhostUserDeviceReqHandler>(
        &mut self,
        size: usize,
        buf: &[u8],
        backend: &mut S,
    ) -> Result<()> {
        if size < mem::size_of::<VhostUserConfig>() {
            return Err(Error::InvalidMessage);
        }
        // Safe: size checked above, packed plain data.
        let msg = unsafe { &*(buf.as_ptr() as *const VhostUserConfig) };
        if !msg.is_valid() {
            return Err(Error::InvalidMessage);
        }
        if size - mem::size_of::<VhostUserConfig>() != msg.size as usize {
            return Err(Error::InvalidMessage);
        }
        let flags = VhostUserConfigFlags::from_bits(msg.flags).ok_or(Error::InvalidMessage)?;

        let data = &buf[mem::size_of::<VhostUserConfig>()..];
        backend.set_config(msg.offset, data, flags)
    }

    // The payload of the vring fd messages holds the queue index in bits
    // 0-7 and the no-fd marker in bit 8; the descriptor itself arrives as
    // ancillary data.
    fn handle_vring_fd_request(
        buf: &[u8],
        rfds: Option<Vec<RawFd>>,
    ) -> Result<(u8, Option<RawFd>)> {
        if buf.len() < mem::size_of::<VhostUserU64>() {
            Endpoint::close_rfds(rfds);
            return Err(Error::InvalidMessage);
        }
        // Safe: size checked above, packed plain data.
        let msg = unsafe { &*(buf.as_ptr() as *const VhostUserU64) };
        let value = msg.value;
        let nofd = value & 0x100u64 != 0;

        let mut rfd = None;
        match rfds {
            Some(fds) => {
                if !nofd && fds.len() == 1 {
                    rfd = Some(fds[0]);
                } else {
                    Endpoint::close_rfds(Some(fds));
                    return Err(Error::InvalidMessage);
                }
            }
            None => {
                if !nofd {
                    return Err(Error::InvalidMessage);
                }
            }
        }
        Ok((value as u8, rfd))
    }

    fn check_request_size(
        &self,
        hdr: &VhostUserMsgHeader,
        size: usize,
        expected: usize,
    ) -> Result<()> {
        if hdr.size() as usize != expected || hdr.is_reply() || size != expected {
            return Err(Error::InvalidMessage);
        }
        Ok(())
    }

    fn check_attached_rfds(
        &self,
        hdr: &VhostUserMsgHeader,
        rfds: Option<Vec<RawFd>>,
    ) -> Result<Option<Vec<RawFd>>> {
        match hdr.code() {
            Some(FrontendReq::SetMemTable)
            | Some(FrontendReq::SetVringKick)
            | Some(FrontendReq::SetVringCall)
            | Some(FrontendReq::SetVringErr) => Ok(rfds),
            _ => {
                if rfds.is_some() {
                    Endpoint::close_rfds(rfds);
                    Err(Error::InvalidMessage)
                } else {
                    Ok(rfds)
                }
            }
        }
    }

    fn extract_request_body<'a, T: Sized + VhostUserMsgValidator>(
        &self,
        hdr: &VhostUserMsgHeader,
        size: usize,
        buf: &'a [u8],
    ) -> Result<&'a T> {
        self.check_request_size(hdr, size, mem::size_of::<T>())?;
        // Safe: length was validated to match T exactly and the payload
        // types are packed plain data.
        let msg = unsafe { &*(buf.as_ptr() as *const T) };
        if !msg.is_valid() {
            return Err(Error::InvalidMessage);
        }
        Ok(msg)
    }

    fn update_reply_ack_flag(&mut self) {
        let vflag = VhostUserVirtioFeatures::PROTOCOL_FEATURES.bits();
        let pflag = VhostUserProtocolFeatures::REPLY_ACK;
        self.reply_ack_enabled = (self.virtio_features & vflag) != 0
            && (self.acked_virtio_features & vflag) != 0
            && self.protocol_features.contains(pflag)
            && (self.acked_protocol_features & pflag.bits()) != 0;
    }

    fn reply_header<T: Sized>(
        &self,
        req: &VhostUserMsgHeader,
        payload_size: usize,
    ) -> VhostUserMsgHeader {
        VhostUserMsgHeader::new(
            req.code().unwrap(),
            VhostUserHeaderFlag::REPLY.bits(),
            (mem::size_of::<T>() + payload_size) as u32,
        )
    }

    fn send_ack_message(&mut self, req: &VhostUserMsgHeader, res: Result<()>) -> Result<()> {
        if self.reply_ack_enabled && req.is_need_reply() {
            let hdr = self.reply_header::<VhostUserU64>(req, 0);
            let val = match &res {
                Ok(_) => 0,
                Err(_) => 1,
            };
            self.sock.send_message(&hdr, &VhostUserU64::new(val))?;
        }
        res
    }

    fn send_reply_message<T>(&mut self, req: &VhostUserMsgHeader, msg: &T) -> Result<()> {
        let hdr = self.reply_header::<T>(req, 0);
        self.sock.send_message(&hdr, msg)
    }
}

impl AsRawFd for DeviceReqHandler {
    fn as_raw_fd(&self) -> RawFd {
        self.sock.as_raw_fd()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::connection::Listener;
    use std::io::{Read, Write};
    use std::os::unix::net::UnixStream;
    use std::path::PathBuf;

    #[derive(Default)]
    struct RecordingBackend {
        owned: bool,
        acked_features: u64,
        vring_num: Vec<(u32, u32)>,
        enabled: Vec<(u32, bool)>,
    }

    impl VhostUserDeviceReqHandler for RecordingBackend {
        fn set_owner(&mut self) -> Result<()> {
            if self.owned {
                return Err(Error::InvalidOperation);
            }
            self.owned = true;
            Ok(())
        }

        fn reset_owner(&mut self) -> Result<()> {
            self.owned = false;
            Ok(())
        }

        fn get_features(&mut self) -> Result<u64> {
            Ok(0x1234)
        }

        fn set_features(&mut self, features: u64) -> Result<()> {
            self.acked_features = features;
            Ok(())
        }

        fn set_mem_table(
            &mut self,
            _regions: &[VhostUserMemoryRegion],
            _fds: &[RawFd],
        ) -> Result<()> {
            Ok(())
        }

        fn set_vring_num(&mut self, index: u32, num: u32) -> Result<()> {
            self.vring_num.push((index, num));
            Ok(())
        }

        fn set_vring_addr(
            &mut self,
            _index: u32,
            _flags: VhostUserVringAddrFlags,
            _descriptor: u64,
            _used: u64,
            _available: u64,
            _log: u64,
        ) -> Result<()> {
            Ok(())
        }

        fn set_vring_base(&mut self, _index: u32, _base: u32) -> Result<()> {
            Ok(())
        }

        fn get_vring_base(&mut self, index: u32) -> Result<VhostUserVringState> {
            Ok(VhostUserVringState::new(index, 3))
        }

        fn set_vring_kick(&mut self, _index: u8, _fd: Option<RawFd>) -> Result<()> {
            Ok(())
        }

        fn set_vring_call(&mut self, _index: u8, _fd: Option<RawFd>) -> Result<()> {
            Ok(())
        }

        fn set_vring_err(&mut self, _index: u8, _fd: Option<RawFd>) -> Result<()> {
            Ok(())
        }

        fn get_protocol_features(&mut self) -> Result<VhostUserProtocolFeatures> {
            Ok(VhostUserProtocolFeatures::REPLY_ACK)
        }

        fn set_protocol_features(&mut self, _features: u64) -> Result<()> {
            Ok(())
        }

        fn get_queue_num(&mut self) -> Result<u64> {
            Ok(2)
        }

        fn set_vring_enable(&mut self, index: u32, enable: bool) -> Result<()> {
            self.enabled.push((index, enable));
            Ok(())
        }

        fn get_config(
            &mut self,
            _offset: u32,
            size: u32,
            _flags: VhostUserConfigFlags,
        ) -> Result<Vec<u8>> {
            Ok(vec![0xa5; size as usize])
        }

        fn set_config(
            &mut self,
            _offset: u32,
            _buf: &[u8],
            _flags: VhostUserConfigFlags,
        ) -> Result<()> {
            Ok(())
        }
    }

    fn connect(name: &str) -> (UnixStream, DeviceReqHandler) {
        let mut path = PathBuf::from(std::env::temp_dir());
        path.push(format!("vhost-user-handler-{}-{}", std::process::id(), name));
        let listener = Listener::new(&path).unwrap();
        let client = UnixStream::connect(&path).unwrap();
        let handler = DeviceReqHandler::new(listener.accept().unwrap());
        (client, handler)
    }

    fn send_request(client: &mut UnixStream, request: FrontendReq, payload: &[u8]) {
        let hdr = VhostUserMsgHeader::new(request, 0, payload.len() as u32);
        let bytes = unsafe {
            slice::from_raw_parts(
                &hdr as *const VhostUserMsgHeader as *const u8,
                mem::size_of::<VhostUserMsgHeader>(),
            )
        };
        client.write_all(bytes).unwrap();
        if !payload.is_empty() {
            client.write_all(payload).unwrap();
        }
    }

    #[test]
    fn bodyless_and_bodied_requests() {
        let (mut client, mut handler) = connect("basic");
        let mut backend = RecordingBackend::default();

        send_request(&mut client, FrontendReq::SetOwner, &[]);
        handler.handle_request(&mut backend).unwrap();
        assert!(backend.owned);

        send_request(&mut client, FrontendReq::SetFeatures, &0x1230u64.to_ne_bytes());
        handler.handle_request(&mut backend).unwrap();
        assert_eq!(backend.acked_features, 0x1230);

        let state = VhostUserVringState::new(1, 256);
        let bytes = unsafe {
            slice::from_raw_parts(
                &state as *const VhostUserVringState as *const u8,
                mem::size_of::<VhostUserVringState>(),
            )
        };
        send_request(&mut client, FrontendReq::SetVringNum, bytes);
        handler.handle_request(&mut backend).unwrap();
        assert_eq!(backend.vring_num, vec![(1, 256)]);
    }

    #[test]
    fn get_features_replies() {
        let (mut client, mut handler) = connect("features");
        let mut backend = RecordingBackend::default();

        send_request(&mut client, FrontendReq::GetFeatures, &[]);
        handler.handle_request(&mut backend).unwrap();

        let mut reply = [0u8; 20];
        client.read_exact(&mut reply).unwrap();
        let value = u64::from_ne_bytes(reply[12..20].try_into().unwrap());
        assert_eq!(value, 0x1234);
        let flags = u32::from_ne_bytes(reply[4..8].try_into().unwrap());
        assert_ne!(flags & VhostUserHeaderFlag::REPLY.bits(), 0);
    }

    #[test]
    fn backend_errors_propagate() {
        let (mut client, mut handler) = connect("errors");
        let mut backend = RecordingBackend::default();

        send_request(&mut client, FrontendReq::SetOwner, &[]);
        handler.handle_request(&mut backend).unwrap();
        send_request(&mut client, FrontendReq::SetOwner, &[]);
        assert!(handler.handle_request(&mut backend).is_err());
    }

    #[test]
    fn disconnect_surfaces_as_error() {
        let (client, mut handler) = connect("disconnect");
        let mut backend = RecordingBackend::default();
        drop(client);
        assert!(matches!(
            handler.handle_request(&mut backend),
            Err(Error::Disconnected)
        ));
    }

    #[test]
    fn unexpected_fds_rejected() {
        // A request that must not carry descriptors arrives with one.
        let (mut client, mut handler) = connect("badfds");
        let mut backend = RecordingBackend::default();

        let hdr = VhostUserMsgHeader::new(FrontendReq::SetOwner, 0, 0);
        let bytes = unsafe {
            slice::from_raw_parts(
                &hdr as *const VhostUserMsgHeader as *const u8,
                mem::size_of::<VhostUserMsgHeader>(),
            )
        };
        use vmm_sys_util::sock_ctrl_msg::ScmSocket;
        let fd = client.as_raw_fd();
        client.send_with_fds(&[bytes], &[fd]).unwrap();
        assert!(handler.handle_request(&mut backend).is_err());
    }
}
