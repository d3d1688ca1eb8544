// Copyright © 2024 Axis Communications AB
//
// SPDX-License-Identifier: Apache-2.0

//! Supervisor for the UML guest.
//!
//! The kernel under test runs as an ordinary child process. Its console
//! output goes to `uml.txt` in the work directory so the harness can
//! collect it; stdin comes from `/dev/null` so an interactive UML
//! monitor never hangs the run. The child is kept only to be reaped
//! after the event loop finishes; there is no signal forwarding.

use std::fs::OpenOptions;
use std::io;
use std::os::unix::fs::OpenOptionsExt;
use std::path::Path;
use std::process::{Child, Command, Stdio};

pub const UML_LOG_FILE: &str = "uml.txt";

/// Spawn the UML binary with the given argv, which embeds the vhost-user
/// socket paths. The listeners are already bound, so the guest can
/// connect back as soon as it boots.
pub fn spawn(work_dir: &Path, argv: &[String]) -> io::Result<Child> {
    let log = OpenOptions::new()
        .create(true)
        .write(true)
        .truncate(true)
        .mode(0o600)
        .open(work_dir.join(UML_LOG_FILE))?;
    let log_err = log.try_clone()?;

    Command::new(&argv[0])
        .args(&argv[1..])
        .current_dir(work_dir)
        .stdin(Stdio::null())
        .stdout(Stdio::from(log))
        .stderr(Stdio::from(log_err))
        .spawn()
}
