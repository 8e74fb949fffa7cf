// Copyright 2024 The SensorNet Testbed Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! Open node A8: an embedded Linux SoC.
//!
//! The A8 boots on its own once powered; the gateway only watches its boot
//! console, checks that its TTY (dis)appears with the power rail, and runs
//! commands on it over SSH. Firmware for the A8's companion MCU is copied
//! and flashed through that SSH session.

use std::io::Read;
use std::path::Path;
use std::path::PathBuf;
use std::process::Command;
use std::process::Stdio;
use std::sync::atomic::AtomicBool;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::thread;
use std::time::Duration;
use std::time::Instant;

use base::process::exit_code;
use base::wait_cond;
use log::error;
use log::info;
use regex::Regex;

pub const TTY: &str = "/dev/ttyON_A8";
pub const BAUDRATE: u32 = 115200;

/// Printed by the A8's getty once Linux is up.
const BOOT_PROMPT: &str = " login: ";

const SSH_OPTS: [&str; 2] = ["-o", "StrictHostKeyChecking=no"];

pub struct NodeA8 {
    tty: PathBuf,
    baudrate: u32,
    ssh_host: String,
    boot_watch: Option<Arc<AtomicBool>>,
}

impl NodeA8 {
    pub fn new() -> NodeA8 {
        NodeA8 {
            tty: PathBuf::from(TTY),
            baudrate: BAUDRATE,
            ssh_host: String::from("root@node-a8"),
            boot_watch: None,
        }
    }

    pub fn ssh_host(&self) -> &str {
        &self.ssh_host
    }

    /// Waits for the A8 TTY device to show up after power-on.
    pub fn wait_tty_appeared(&self, timeout: Duration) -> i32 {
        let tty = self.tty.clone();
        if wait_cond(timeout, true, move || tty.exists()) {
            0
        } else {
            error!("Open A8 tty not visible: {}", self.tty.display());
            1
        }
    }

    /// Waits for the A8 TTY device to vanish after power-off.
    pub fn wait_tty_disappeared(&self, timeout: Duration) -> i32 {
        let tty = self.tty.clone();
        if wait_cond(timeout, false, move || tty.exists()) {
            0
        } else {
            error!("Open A8 tty still exists: {}", self.tty.display());
            1
        }
    }

    /// Watches the boot console in the background until the login prompt
    /// shows up or `timeout` elapses. The outcome is only logged; the boot
    /// happens while the experiment is already running.
    pub fn boot_watch_start(&mut self, timeout: Duration) {
        self.boot_watch_stop();
        let stop = Arc::new(AtomicBool::new(false));
        self.boot_watch = Some(stop.clone());
        let tty = self.tty.clone();
        let baudrate = self.baudrate;
        thread::Builder::new()
            .name("a8-boot-watch".to_owned())
            .spawn(move || boot_watch(&tty, baudrate, timeout, stop))
            .expect("failed to spawn boot watch thread");
    }

    /// Ends the boot watch. The watcher thread notices within its read
    /// timeout.
    pub fn boot_watch_stop(&mut self) {
        if let Some(stop) = self.boot_watch.take() {
            stop.store(true, Ordering::SeqCst);
        }
    }

    /// Copies a local file onto the A8.
    pub fn ssh_copy(&self, src: &Path, dst: &str) -> i32 {
        let target = format!("{}:{}", self.ssh_host, dst);
        run_tool("scp", &[src.to_str().unwrap_or_default(), &target])
    }

    /// Runs a command on the A8.
    pub fn ssh_run(&self, command: &str) -> i32 {
        run_tool("ssh", &[&self.ssh_host, command])
    }

    /// Runs a command on the A8 and captures its trimmed stdout.
    pub fn ssh_output(&self, command: &str) -> Option<String> {
        let output = Command::new("ssh")
            .args(SSH_OPTS)
            .arg(&self.ssh_host)
            .arg(command)
            .stdin(Stdio::null())
            .output();
        match output {
            Ok(output) if output.status.success() => {
                Some(String::from_utf8_lossy(&output.stdout).trim().to_string())
            }
            Ok(output) => {
                error!("ssh {:?} failed: {}", command, exit_code(&output.status));
                None
            }
            Err(e) => {
                error!("ssh failed to run: {}", e);
                None
            }
        }
    }
}

impl Default for NodeA8 {
    fn default() -> NodeA8 {
        NodeA8::new()
    }
}

impl Drop for NodeA8 {
    fn drop(&mut self) {
        self.boot_watch_stop();
    }
}

fn run_tool(tool: &str, args: &[&str]) -> i32 {
    let mut command = Command::new(tool);
    command
        .args(SSH_OPTS)
        .args(args)
        .stdin(Stdio::null())
        .stdout(Stdio::null())
        .stderr(Stdio::null());
    match command.status() {
        Ok(status) => exit_code(&status),
        Err(e) => {
            error!("{} failed to run: {}", tool, e);
            1
        }
    }
}

fn boot_watch(tty: &Path, baudrate: u32, timeout: Duration, stop: Arc<AtomicBool>) {
    let prompt = Regex::new(BOOT_PROMPT).expect("invalid boot prompt pattern");
    let mut console = match base::open_serial(tty, baudrate) {
        Ok(console) => console,
        Err(e) => {
            error!("A8 boot console open failed: {}", e);
            return;
        }
    };

    let deadline = Instant::now() + timeout;
    let mut seen = String::new();
    let mut buf = [0u8; 256];
    while Instant::now() < deadline && !stop.load(Ordering::SeqCst) {
        // The console has a 0.5 s read timeout, so the loop stays
        // responsive to `stop` without extra plumbing.
        match console.read(&mut buf) {
            Ok(0) => continue,
            Ok(n) => {
                seen.push_str(&String::from_utf8_lossy(&buf[..n]));
                if prompt.is_match(&seen) {
                    info!("Boot A8 succeeded in time: {:?}", timeout);
                    return;
                }
                // Only the tail can still complete a match.
                if seen.len() > 4096 {
                    let mut cut = seen.len() - BOOT_PROMPT.len();
                    while !seen.is_char_boundary(cut) {
                        cut -= 1;
                    }
                    seen.drain(..cut);
                }
            }
            Err(e) => {
                error!("A8 boot console read failed: {}", e);
                return;
            }
        }
    }
    if !stop.load(Ordering::SeqCst) {
        error!("Boot A8 failed in time: {:?}", timeout);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tty_wait_on_missing_path() {
        let node = NodeA8::new();
        // The device is absent on a development machine.
        assert_eq!(node.wait_tty_appeared(Duration::ZERO), 1);
        assert_eq!(node.wait_tty_disappeared(Duration::ZERO), 0);
    }

    #[test]
    fn boot_watch_stop_without_start() {
        let mut node = NodeA8::new();
        node.boot_watch_stop();
        node.boot_watch_stop();
    }
}
