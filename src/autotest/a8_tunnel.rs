// Copyright 2024 The SensorNet Testbed Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! SSH tunnel to the A8's companion-MCU UART.
//!
//! A local socat creates a pseudo-terminal and bridges it, through an SSH
//! session, to a remote socat holding the on-board UART. The autotest
//! serial then speaks to the pty exactly like it would to a local TTY.

use std::path::Path;
use std::path::PathBuf;
use std::time::Duration;

use anyhow::bail;
use anyhow::Context;
use base::wait_cond;
use base::ChildConfig;
use base::Supervisor;
use log::info;

/// Local pty bridged to the A8-M3 UART.
pub const A8_TTY_PATH: &str = "/tmp/tty_a8_m3";

/// UART of the A8's companion MCU, on the A8 side.
const REMOTE_UART: &str = "/dev/ttyA8_M3";

const PTY_WAIT: Duration = Duration::from_secs(5);

pub struct A8Tunnel {
    supervisor: Supervisor,
    pty: PathBuf,
}

impl A8Tunnel {
    /// Starts the tunnel and waits for the local pty to appear.
    pub fn start(ssh_host: &str) -> anyhow::Result<A8Tunnel> {
        let local = format!("pty,link={},raw,echo=0", A8_TTY_PATH);
        // Commas and colons inside the exec address are escaped so socat
        // does not split on them.
        let remote = format!(
            "exec:ssh -o StrictHostKeyChecking=no {} socat - open\\:{}\\,b500000\\,raw\\,echo=0",
            ssh_host, REMOTE_UART
        );
        let mut supervisor = Supervisor::new("a8-tunnel");
        supervisor
            .start(&["socat", &local, &remote], ChildConfig::default())
            .context("failed to start a8 tunnel")?;

        let pty = PathBuf::from(A8_TTY_PATH);
        let pty_probe = pty.clone();
        if !wait_cond(PTY_WAIT, true, move || pty_probe.exists()) {
            supervisor.stop();
            bail!("a8 tunnel pty {} did not appear", pty.display());
        }
        info!("A8 tunnel ready on {}", pty.display());
        Ok(A8Tunnel { supervisor, pty })
    }

    pub fn pty(&self) -> &Path {
        &self.pty
    }

    pub fn stop(&mut self) {
        self.supervisor.stop();
    }
}

impl Drop for A8Tunnel {
    fn drop(&mut self) {
        self.stop();
    }
}
