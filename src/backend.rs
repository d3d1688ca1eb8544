// Copyright © 2024 Axis Communications AB
//
// SPDX-License-Identifier: Apache-2.0

//! The backend process core: device bundle plus epoll event loop.
//!
//! Everything runs on one thread. The loop watches three kinds of file
//! descriptors: listening sockets (one-shot; accepting promotes the
//! connection to a socket watch), connected vhost-user sockets (one
//! protocol message per event), and per-queue kick eventfds (service the
//! queue). The control channel is drained once per wake, before the
//! ready set is dispatched, so harness commands are applied ahead of
//! whatever guest activity woke us.

use std::collections::HashMap;
use std::io::ErrorKind;
use std::os::unix::io::{AsRawFd, RawFd};
use std::path::Path;

use epoll::{ControlOptions, Event, Events};
use log::{debug, info};
use thiserror::Error as ThisError;
use vhost_user::{Error as VuError, Listener};

use crate::control::{parse_line, ControlLine, ControlReader};
use crate::device::VuDev;
use crate::devices::gpio::{self, GpioDev};
use crate::devices::i2c::{self, I2cDev};
use crate::devices::platform::{self, PlatformDev};
use crate::devices::BackendOps;
use crate::model::{ModelError, ModelHub};

#[derive(Debug, ThisError)]
pub enum Error {
    #[error("failed to bind {path}: {source}")]
    Bind {
        path: String,
        source: VuError,
    },
    #[error("failed to set up the control channel: {0}")]
    ControlSetup(std::io::Error),
    #[error("reading the control channel: {0}")]
    ControlIo(std::io::Error),
    #[error("control command {line:?}: {source}")]
    Control {
        line: String,
        source: ModelError,
    },
    #[error("malformed control line: {0}")]
    ControlParse(#[from] crate::control::Error),
    #[error("failed to read main script {path}: {source}")]
    MainScript {
        path: String,
        source: std::io::Error,
    },
    #[error("epoll: {0}")]
    Epoll(std::io::Error),
    #[error("{dev}: failed to accept frontend: {source}")]
    Accept {
        dev: &'static str,
        source: VuError,
    },
    #[error("{dev}: protocol error: {source}")]
    Protocol {
        dev: &'static str,
        source: VuError,
    },
}

type Result<T> = std::result::Result<T, Error>;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum DevId {
    I2c,
    Gpio,
    Platform,
}

#[derive(Clone, Copy, Debug)]
enum WatchKind {
    Listen,
    Socket,
    Queue(usize),
}

#[derive(Clone, Copy, Debug)]
struct Watch {
    dev: DevId,
    kind: WatchKind,
}

/// The three devices, the model layer and the control channel.
pub struct Backend {
    pub i2c: I2cDev,
    pub gpio: GpioDev,
    pub platform: Option<PlatformDev>,
    pub hub: ModelHub,
    control: ControlReader,
}

impl Backend {
    pub fn new(
        work_dir: &Path,
        i2c_socket: &Path,
        gpio_socket: &Path,
        pci_socket: Option<&Path>,
    ) -> Result<Self> {
        let bind = |path: &Path| {
            Listener::new(path).map_err(|source| Error::Bind {
                path: path.display().to_string(),
                source,
            })
        };

        let i2c = I2cDev::new(Some(bind(i2c_socket)?));
        let gpio = GpioDev::new(Some(bind(gpio_socket)?));
        let platform = match pci_socket {
            Some(path) => Some(PlatformDev::new(Some(bind(path)?))),
            None => None,
        };

        Ok(Backend {
            i2c,
            gpio,
            platform,
            hub: ModelHub::new(),
            control: ControlReader::new(work_dir).map_err(Error::ControlSetup)?,
        })
    }

    fn vu(&self, dev: DevId) -> &VuDev {
        match dev {
            DevId::I2c => &self.i2c.vu,
            DevId::Gpio => &self.gpio.vu,
            DevId::Platform => &self.platform.as_ref().expect("platform device").vu,
        }
    }

    fn vu_mut(&mut self, dev: DevId) -> &mut VuDev {
        match dev {
            DevId::I2c => &mut self.i2c.vu,
            DevId::Gpio => &mut self.gpio.vu,
            DevId::Platform => &mut self.platform.as_mut().expect("platform device").vu,
        }
    }

    fn all_quit(&self) -> bool {
        self.i2c.vu.quit()
            && self.gpio.vu.quit()
            && self.platform.as_ref().map_or(true, |p| p.vu.quit())
    }

    /// Run the startup script: the same command language as the control
    /// channel, applied once before the guest boots. Errors here are
    /// fatal; a test cannot run with a half-configured model layer.
    pub fn run_startup_script(&mut self, path: &Path) -> Result<()> {
        let script = std::fs::read_to_string(path).map_err(|source| Error::MainScript {
            path: path.display().to_string(),
            source,
        })?;
        for line in script.lines() {
            self.apply_control_line(line)?;
        }
        Ok(())
    }

    /// Drain pending harness commands. Called exactly once per epoll
    /// wake.
    pub fn process_control(&mut self) -> Result<()> {
        let lines = self.control.poll_lines().map_err(Error::ControlIo)?;
        for line in lines {
            self.apply_control_line(&line)?;
        }
        Ok(())
    }

    fn apply_control_line(&mut self, line: &str) -> Result<()> {
        match parse_line(line)? {
            None => Ok(()),
            Some(ControlLine::Log(msg)) => {
                info!("harness: {}", msg);
                Ok(())
            }
            Some(ControlLine::Command {
                surface,
                method,
                args,
            }) => {
                debug!("control: {}", line);
                let Backend {
                    gpio,
                    platform,
                    hub,
                    ..
                } = self;
                let dma_mem = platform.as_ref().and_then(|p| p.vu.mem().cloned());
                let mut ops = BackendOps::new(gpio, dma_mem);
                hub.dispatch(&surface, &method, &args, &mut ops)
                    .map_err(|source| Error::Control {
                        line: line.to_string(),
                        source,
                    })
            }
        }
    }

    /// Service one queue after its kick fired.
    fn handle_queue(&mut self, dev: DevId, qidx: usize) {
        let Backend {
            i2c,
            gpio,
            platform,
            hub,
            ..
        } = self;
        let dma_mem = platform.as_ref().and_then(|p| p.vu.mem().cloned());

        match (dev, qidx) {
            (DevId::I2c, 0) => i2c::handle_cmdq(i2c, gpio, dma_mem, hub),
            (DevId::Gpio, 0) => gpio::handle_cmdq(gpio, dma_mem, hub),
            (DevId::Gpio, 1) => gpio::handle_eventq(gpio, dma_mem, hub),
            (DevId::Platform, 0) => {
                platform::handle_cmdq(platform.as_mut().expect("platform device"), gpio, hub)
            }
            (dev, qidx) => panic!("no handler for {:?} queue {}", dev, qidx),
        }
    }
}

/// The epoll reactor and its watch table.
pub struct EventLoop {
    epfd: RawFd,
    watches: HashMap<RawFd, Watch>,
}

impl EventLoop {
    pub fn new() -> Result<Self> {
        let epfd = epoll::create(true).map_err(Error::Epoll)?;
        Ok(EventLoop {
            epfd,
            watches: HashMap::new(),
        })
    }

    /// Register the listening sockets of every configured device.
    pub fn register_listeners(&mut self, backend: &Backend) -> Result<()> {
        let mut devs = vec![DevId::I2c, DevId::Gpio];
        if backend.platform.is_some() {
            devs.push(DevId::Platform);
        }
        for dev in devs {
            let fd = backend
                .vu(dev)
                .listener_fd()
                .expect("device without listener");
            self.add_watch(fd, dev, WatchKind::Listen, true)?;
        }
        Ok(())
    }

    fn add_watch(&mut self, fd: RawFd, dev: DevId, kind: WatchKind, oneshot: bool) -> Result<()> {
        let mut events = Events::EPOLLIN;
        if oneshot {
            events |= Events::EPOLLONESHOT;
        }
        debug!("watch add fd {} {:?} {:?}", fd, dev, kind);
        epoll::ctl(
            self.epfd,
            ControlOptions::EPOLL_CTL_ADD,
            fd,
            Event::new(events, fd as u64),
        )
        .map_err(Error::Epoll)?;
        self.watches.insert(fd, Watch { dev, kind });
        Ok(())
    }

    fn remove_watch(&mut self, fd: RawFd) {
        debug!("watch remove fd {}", fd);
        let _ = epoll::ctl(
            self.epfd,
            ControlOptions::EPOLL_CTL_DEL,
            fd,
            Event::new(Events::empty(), 0),
        );
        self.watches.remove(&fd);
    }

    /// Remove every watch belonging to a device.
    fn remove_device(&mut self, dev: DevId) {
        let fds: Vec<RawFd> = self
            .watches
            .iter()
            .filter(|(_, watch)| watch.dev == dev)
            .map(|(fd, _)| *fd)
            .collect();
        for fd in fds {
            self.remove_watch(fd);
        }
    }

    /// Bring the kick-fd watches of a device in line with its vring
    /// state. Installed kicks of started rings are watched; everything
    /// else (replaced fds, stopped rings) is dropped.
    fn sync_queue_watches(&mut self, dev: DevId, vu: &VuDev) -> Result<()> {
        let mut desired: HashMap<RawFd, usize> = HashMap::new();
        for (qidx, vring) in vu.vrings.iter().enumerate() {
            if !vring.queue.ready() {
                continue;
            }
            if let Some(kick) = vring.kick.as_ref() {
                desired.insert(kick.as_raw_fd(), qidx);
            }
        }

        let stale: Vec<RawFd> = self
            .watches
            .iter()
            .filter(|(fd, watch)| {
                watch.dev == dev
                    && matches!(watch.kind, WatchKind::Queue(_))
                    && !desired.contains_key(fd)
            })
            .map(|(fd, _)| *fd)
            .collect();
        for fd in stale {
            self.remove_watch(fd);
        }

        for (fd, qidx) in desired {
            if !self.watches.contains_key(&fd) {
                self.add_watch(fd, dev, WatchKind::Queue(qidx), false)?;
            }
        }
        Ok(())
    }

    /// Run until every configured device has seen its frontend
    /// disconnect.
    pub fn run(&mut self, backend: &mut Backend) -> Result<()> {
        let mut events = vec![Event::new(Events::empty(), 0); 10];

        loop {
            let nfds = match epoll::wait(self.epfd, -1, &mut events) {
                Ok(n) => n,
                // A signal (e.g. SIGCHLD from the guest) interrupting the
                // wait is not an error.
                Err(e) if e.kind() == ErrorKind::Interrupted => continue,
                Err(e) => return Err(Error::Epoll(e)),
            };

            backend.process_control()?;

            for event in events.iter().take(nfds) {
                let fd = event.data as RawFd;
                // Watches removed earlier in this batch may still have
                // events queued.
                let Some(&watch) = self.watches.get(&fd) else {
                    continue;
                };

                match watch.kind {
                    WatchKind::Listen => {
                        self.remove_watch(fd);
                        let name = backend.vu(watch.dev).name();
                        let sock_fd = backend
                            .vu_mut(watch.dev)
                            .accept()
                            .map_err(|source| Error::Accept { dev: name, source })?;
                        self.add_watch(sock_fd, watch.dev, WatchKind::Socket, false)?;
                    }
                    WatchKind::Socket => match backend.vu_mut(watch.dev).handle_request() {
                        Ok(()) => {
                            self.sync_queue_watches(watch.dev, backend.vu(watch.dev))?;
                        }
                        Err(VuError::Disconnected) => {
                            info!("{}: frontend disconnected", backend.vu(watch.dev).name());
                            self.remove_device(watch.dev);
                            backend.vu_mut(watch.dev).set_quit();
                        }
                        Err(VuError::SocketRetry(_)) => {}
                        Err(source) => {
                            return Err(Error::Protocol {
                                dev: backend.vu(watch.dev).name(),
                                source,
                            })
                        }
                    },
                    WatchKind::Queue(qidx) => {
                        let vring = &backend.vu(watch.dev).vrings[qidx];
                        if let Some(kick) = vring.kick.as_ref() {
                            let _ = kick.read();
                        }
                        // A disabled ring's kick is read only to be
                        // discarded.
                        if backend.vu(watch.dev).vrings[qidx].enabled {
                            backend.handle_queue(watch.dev, qidx);
                        }
                    }
                }
            }

            if backend.all_quit() {
                break;
            }
        }
        Ok(())
    }
}

impl Drop for EventLoop {
    fn drop(&mut self) {
        // Safe: the fd belongs to this struct and is closed exactly once.
        unsafe { libc::close(self.epfd) };
    }
}
