// Copyright © 2024 Axis Communications AB
//
// SPDX-License-Identifier: Apache-2.0

//! The roadtest backend: vhost-user device emulation for testing kernel
//! drivers under UML, with chip behavior supplied by loadable models.

mod backend;
mod control;
mod device;
mod devices;
mod memory;
mod model;
mod uml;

use std::path::{Path, PathBuf};
use std::process;

use clap::{Arg, Command};
use env_logger::Env;
use log::{error, info, warn};
use thiserror::Error as ThisError;

use backend::{Backend, EventLoop};

/// Environment variable naming the per-run work directory. The control
/// channel and the UML console log live there.
pub const ENV_WORK_DIR: &str = "ROADTEST_WORK_DIR";

#[derive(Debug, ThisError)]
enum Error {
    #[error("{ENV_WORK_DIR} must point to the work directory")]
    WorkDirNotSet,
    #[error(transparent)]
    Backend(#[from] backend::Error),
    #[error("failed to spawn UML: {0}")]
    SpawnUml(std::io::Error),
}

fn cli() -> Command {
    Command::new("backend")
        .about("vhost-user device backend for driver tests under UML")
        .arg(
            Arg::new("main-script")
                .long("main-script")
                .value_name("PATH")
                .required(true)
                .help("Startup script for the model layer"),
        )
        .arg(
            Arg::new("gpio-socket")
                .long("gpio-socket")
                .value_name("PATH")
                .required(true)
                .help("vhost-user socket for the GPIO device"),
        )
        .arg(
            Arg::new("i2c-socket")
                .long("i2c-socket")
                .value_name("PATH")
                .required(true)
                .help("vhost-user socket for the I2C device"),
        )
        .arg(
            Arg::new("pci-socket")
                .long("pci-socket")
                .value_name("PATH")
                .help("vhost-user socket for the platform (PCI) device"),
        )
        .arg(
            Arg::new("uml")
                .num_args(1..)
                .last(true)
                .required(true)
                .value_name("UML_BINARY [args...]")
                .help("Guest kernel command line"),
        )
}

fn run() -> Result<(), Error> {
    let matches = cli().get_matches();

    let work_dir: PathBuf = std::env::var_os(ENV_WORK_DIR)
        .ok_or(Error::WorkDirNotSet)?
        .into();

    let main_script = matches.get_one::<String>("main-script").unwrap();
    let i2c_socket = matches.get_one::<String>("i2c-socket").unwrap();
    let gpio_socket = matches.get_one::<String>("gpio-socket").unwrap();
    let pci_socket = matches.get_one::<String>("pci-socket");
    let uml_argv: Vec<String> = matches
        .get_many::<String>("uml")
        .unwrap()
        .cloned()
        .collect();

    let mut backend = Backend::new(
        &work_dir,
        Path::new(i2c_socket),
        Path::new(gpio_socket),
        pci_socket.map(Path::new),
    )?;
    backend.run_startup_script(Path::new(main_script))?;

    let mut event_loop = EventLoop::new()?;
    event_loop.register_listeners(&backend)?;

    let mut child = uml::spawn(&work_dir, &uml_argv).map_err(Error::SpawnUml)?;
    info!("uml started as pid {}", child.id());

    // On a clean run every frontend has disconnected, which means the
    // guest is shutting down; reap it. On a protocol error the guest is
    // left to the harness, which owns the work directory and the run.
    event_loop.run(&mut backend)?;

    match child.wait() {
        Ok(status) => info!("uml exited with {}", status),
        Err(e) => warn!("failed to reap uml: {}", e),
    }

    Ok(())
}

fn main() {
    env_logger::Builder::from_env(Env::default().default_filter_or("info")).init();

    if let Err(e) = run() {
        error!("{}", e);
        process::exit(1);
    }
}
