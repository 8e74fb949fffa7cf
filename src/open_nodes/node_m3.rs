// Copyright 2024 The SensorNet Testbed Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! Open node M3: a 32-bit MCU flashed and reset over JTAG, with its UART
//! exposed over TCP during experiments.

use std::path::Path;

use log::info;

use crate::config;
use crate::config::Firmware;
use crate::utils::openocd::OpenOcd;
use crate::utils::serial_redirection::SerialRedirection;

pub const TTY: &str = "/dev/ttyON_M3";
pub const BAUDRATE: u32 = 500000;

pub struct NodeM3 {
    openocd: OpenOcd,
    serial_redirection: SerialRedirection,
}

impl NodeM3 {
    pub fn new() -> NodeM3 {
        NodeM3 {
            openocd: OpenOcd::new(&config::static_path("iot-lab-m3.cfg")),
            serial_redirection: SerialRedirection::new(TTY, BAUDRATE),
        }
    }

    /// Flashes `firmware_path`, or the idle firmware when `None`.
    pub fn flash(&self, firmware_path: Option<&Path>) -> i32 {
        let idle = config::firmware_path(Firmware::IdleM3);
        let firmware = firmware_path.unwrap_or(&idle);
        info!("Flash firmware on M3: {}", firmware.display());
        self.openocd.flash(firmware)
    }

    pub fn reset(&self) -> i32 {
        info!("Reset M3 node");
        self.openocd.reset()
    }

    /// Flashes the experiment firmware and exposes the UART on TCP.
    pub fn setup(&mut self, firmware_path: Option<&Path>) -> i32 {
        let mut ret = 0;
        ret += self.flash(firmware_path);
        ret += self.serial_redirection.start();
        ret
    }

    /// Releases the UART and leaves the idle firmware running.
    pub fn teardown(&mut self) -> i32 {
        let mut ret = 0;
        ret += self.debug_stop();
        ret += self.serial_redirection.stop();
        ret += self.flash(None);
        ret
    }

    pub fn serial_redirection_start(&mut self) -> i32 {
        self.serial_redirection.start()
    }

    pub fn serial_redirection_stop(&mut self) -> i32 {
        self.serial_redirection.stop()
    }

    pub fn debug_start(&mut self) -> i32 {
        info!("M3 node debugger start");
        self.openocd.debug_start()
    }

    pub fn debug_stop(&mut self) -> i32 {
        info!("M3 node debugger stop");
        self.openocd.debug_stop()
    }
}

impl Default for NodeM3 {
    fn default() -> NodeM3 {
        NodeM3::new()
    }
}
