// Copyright 2024 The SensorNet Testbed Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! OpenOCD invocations for flashing, resetting and debugging a node.
//!
//! Flash and reset run the external tool to completion and surface its exit
//! code unchanged. The debug server is a long-lived child kept under
//! supervision until `debug_stop`.

use std::path::Path;
use std::path::PathBuf;
use std::process::Command;
use std::process::Stdio;

use base::process::exit_code;
use base::ChildConfig;
use base::Supervisor;
use log::debug;
use log::error;

pub struct OpenOcd {
    program: String,
    config: PathBuf,
    debug_server: Option<Supervisor>,
}

impl OpenOcd {
    pub fn new(config: &Path) -> OpenOcd {
        OpenOcd {
            program: "openocd".to_owned(),
            config: config.to_owned(),
            debug_server: None,
        }
    }

    /// Runs a different tool binary in place of openocd. Test seam.
    pub fn with_program(mut self, program: &str) -> OpenOcd {
        self.program = program.to_owned();
        self
    }

    /// Writes and verifies `firmware`, then restarts the node.
    pub fn flash(&self, firmware: &Path) -> i32 {
        let firmware = firmware.display().to_string();
        self.run(&[
            "init",
            "targets",
            "reset halt",
            &format!("flash write_image erase {}", firmware),
            &format!("verify_image {}", firmware),
            "reset run",
            "shutdown",
        ])
    }

    /// Toggles the reset pin.
    pub fn reset(&self) -> i32 {
        self.run(&["init", "reset run", "shutdown"])
    }

    /// Starts the GDB server. It keeps the debug adapter until
    /// [`OpenOcd::debug_stop`].
    pub fn debug_start(&mut self) -> i32 {
        self.debug_stop();
        let config = self.config.display().to_string();
        let argv = [
            self.program.as_str(),
            "--debug=0",
            "-f",
            config.as_str(),
            "-c",
            "init",
        ];
        let mut supervisor = Supervisor::new("openocd-debug");
        match supervisor.start(&argv, ChildConfig::default()) {
            Ok(_) => {
                self.debug_server = Some(supervisor);
                0
            }
            Err(e) => {
                error!("openocd debug server failed to start: {}", e);
                1
            }
        }
    }

    /// Stops the GDB server. A server that was never started is fine.
    pub fn debug_stop(&mut self) -> i32 {
        if let Some(mut supervisor) = self.debug_server.take() {
            supervisor.stop();
        }
        0
    }

    fn run(&self, commands: &[&str]) -> i32 {
        let mut command = Command::new(&self.program);
        command
            .arg("--debug=0")
            .arg("-f")
            .arg(&self.config)
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null());
        for step in commands {
            command.arg("-c").arg(step);
        }
        debug!("openocd: {:?}", command);
        match command.status() {
            Ok(status) => exit_code(&status),
            Err(e) => {
                error!("openocd failed to run: {}", e);
                1
            }
        }
    }
}

impl Drop for OpenOcd {
    fn drop(&mut self) {
        self.debug_stop();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn debug_stop_without_start_is_fine() {
        let mut openocd = OpenOcd::new(Path::new("board.cfg"));
        assert_eq!(openocd.debug_stop(), 0);
        assert_eq!(openocd.debug_stop(), 0);
    }

    #[test]
    fn surfaces_tool_exit_code() {
        let openocd = OpenOcd::new(Path::new("board.cfg")).with_program("true");
        assert_eq!(openocd.flash(Path::new("firmware.elf")), 0);
        let openocd = OpenOcd::new(Path::new("board.cfg")).with_program("false");
        assert_eq!(openocd.reset(), 1);
    }

    #[test]
    fn missing_tool_is_a_failure() {
        let openocd = OpenOcd::new(Path::new("board.cfg")).with_program("/nonexistent/openocd");
        assert_eq!(openocd.reset(), 1);
    }
}
