// Copyright 2024 The SensorNet Testbed Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! The autotest scenario.
//!
//! A fixed, order-sensitive recipe: bring up the control node, exercise the
//! open node's sensors and both interconnects, capture measurement streams
//! and evaluate pass/fail predicates on them. Each check lands in the
//! report's `success` or `error` list; setup and basic liveness failures
//! are fatal and abort the remaining tests, but teardown always runs.

use std::collections::BTreeMap;
use std::collections::BTreeSet;
use std::fmt;
use std::fs;
use std::path::Path;
use std::sync::Arc;
use std::thread;
use std::time::Duration;
use std::time::Instant;
use std::time::SystemTime;
use std::time::UNIX_EPOCH;

use control_node::extract_measures;
use control_node::measure::tokenize;
use control_node::BoardType;
use control_node::Consumption;
use control_node::PowerSource;
use control_node::Radio;
use control_node::RadioMode;
use log::debug;
use log::error;
use log::info;
use once_cell::sync::Lazy;
use regex::Regex;
use serde::Serialize;
use sync::Mutex;
use thiserror::Error;

use crate::autotest::a8_tunnel::A8Tunnel;
use crate::autotest::open_node_serial::OnSerial;
use crate::autotest::open_node_serial::OpenNodeSerial;
use crate::config;
use crate::config::Firmware;
use crate::gateway_manager::ManagerInner;
use crate::gateway_manager::NodeId;
use crate::open_nodes::node_m3;

/// RSSI value the control node reports when it hears nothing. Typical noise
/// floor of the current firmware; override for boards that report another
/// sentinel.
pub const NO_SIGNAL_RSSI: i64 = -91;

static MAC_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"^([0-9a-f]{2}:){5}[0-9a-f]{2}$").expect("static MAC pattern")
});

/// Consumption settings used by every engine measurement: one averaged
/// sample every ~0.1 s.
const ENGINE_PERIOD_US: u32 = 1100;
const ENGINE_AVERAGE: u32 = 64;

#[derive(Debug, Error)]
#[error("{0}")]
pub struct FatalError(String);

impl FatalError {
    fn new(message: impl Into<String>) -> FatalError {
        FatalError(message.into())
    }
}

/// Scenario switches, straight from the caller.
#[derive(Copy, Clone, Debug, Default)]
pub struct AutotestOptions {
    /// Radio channel for the ping-pong and RSSI tests; without one the
    /// radio tests are skipped.
    pub channel: Option<u8>,
    /// Leave the open node powered and its LEDs blinking on full success.
    pub blink: bool,
    /// Exercise the on-board flash memory.
    pub flash: bool,
    /// Exercise the GPS PPS counter.
    pub gps: bool,
}

/// Outcome of one autotest run.
#[derive(Clone, Debug, Default, Serialize)]
pub struct AutotestReport {
    /// 0 when every check passed.
    pub ret: i32,
    pub success: Vec<String>,
    pub error: Vec<String>,
    pub mac: BTreeMap<String, String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub open_node_m3_uid: Option<String>,
    /// Non-fatal observations worth surfacing to the operator.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub warnings: Option<BTreeMap<String, String>>,
}

fn tst_ok(ok: bool) -> i32 {
    if ok {
        0
    } else {
        1
    }
}

fn unix_time() -> f64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs_f64())
        .unwrap_or(0.0)
}

fn distinct<T: Ord>(values: impl IntoIterator<Item = T>) -> usize {
    values.into_iter().collect::<BTreeSet<T>>().len()
}

/// The consumption sample the control node attributes to an event at time
/// `t`: the first sample strictly after it. Out of range is NaN, not a
/// crash.
fn consumption_at(timestamps: &[f64], values: &[f64], t: f64) -> f64 {
    let idx = timestamps.partition_point(|&ts| ts <= t);
    values.get(idx).copied().unwrap_or(f64::NAN)
}

pub struct AutoTestManager<'a> {
    g_m: &'a mut ManagerInner,
    on_serial: Option<Box<dyn OnSerial>>,
    a8_tunnel: Option<A8Tunnel>,
    report: AutotestReport,
    cn_measures: Arc<Mutex<Vec<Vec<String>>>>,
    no_signal_rssi: i64,
}

impl<'a> AutoTestManager<'a> {
    pub fn new(g_m: &'a mut ManagerInner) -> AutoTestManager<'a> {
        AutoTestManager {
            g_m,
            on_serial: None,
            a8_tunnel: None,
            report: AutotestReport::default(),
            cn_measures: Arc::new(Mutex::new(Vec::new())),
            no_signal_rssi: NO_SIGNAL_RSSI,
        }
    }

    /// Runs the whole scenario and returns the report. Teardown runs no
    /// matter how far the tests got.
    pub fn auto_tests(mut self, options: AutotestOptions) -> AutotestReport {
        let board_type = match self.g_m.board().board_type() {
            Some(board_type) => board_type,
            None => {
                let token = self.g_m.board().board_type_token().to_owned();
                self.report.ret = self.check(1, "board_type", &token);
                return self.report;
            }
        };

        let mut ret_val = 0;
        if let Err(e) = self.run_tests(board_type, options, &mut ret_val) {
            error!("Fatal error in tests, stop further tests: {}", e);
            ret_val += 1;
        }

        ret_val += self.teardown(options.blink && ret_val == 0);
        self.report.ret = ret_val;
        self.report
    }

    fn run_tests(
        &mut self,
        board_type: BoardType,
        options: AutotestOptions,
        ret_val: &mut i32,
    ) -> Result<(), FatalError> {
        self.setup_control_node()?;

        // Battery first: the battery-to-DC switch does not reboot the open
        // node, the other direction does.
        *ret_val += self.test_consumption_batt(board_type);

        self.setup_open_node_connection(board_type)?;
        self.check_get_time()?;
        *ret_val += self.get_uid();

        let ret = self.g_m.open_power_start(Some(PowerSource::Dc));
        *ret_val += self.check(ret, "switch_to_dc", ret);

        // Inertial measurement unit.
        *ret_val += self.test_xyz_sensor("get_gyro");
        *ret_val += self.test_xyz_sensor("get_accelero");
        *ret_val += self.test_xyz_sensor("get_magneto");

        // On-board peripherals the A8 does not have.
        if board_type == BoardType::M3 {
            *ret_val += self.test_pressure();
            *ret_val += self.test_light();
            *ret_val += self.test_flash(options.flash);
        }

        // Open-node <-> control-node interconnects.
        *ret_val += self.test_on_cn(5, &["test_gpio"], None, &[]);
        *ret_val += self.test_on_cn(1, &["test_i2c"], None, &[]);

        // Radio.
        *ret_val += self.test_radio_ping_pong(options.channel);
        *ret_val += self.test_radio_with_rssi(options.channel);

        // Consumption on DC.
        *ret_val += self.test_consumption_dc(board_type);
        if board_type == BoardType::M3 {
            *ret_val += self.test_leds_with_consumption(board_type);
        }

        *ret_val += self.test_gps(options.gps);

        // Visual status.
        self.on_call(&["leds_off", "7"]);
        if *ret_val == 0 {
            self.on_call(&["leds_blink", "7", "500"]);
            self.g_m.protocol().green_led_blink();
        }
        Ok(())
    }

    fn setup_control_node(&mut self) -> Result<(), FatalError> {
        info!("Setup autotests");
        let mut ret_val = 0;

        ret_val += self.g_m.node_soft_reset(NodeId::ControlNode);
        let measures = self.cn_measures.clone();
        ret_val += self
            .g_m
            .cn_start_debug(Box::new(move |line| measures.lock().push(tokenize(line))));
        thread::sleep(Duration::from_secs(1));
        ret_val += self.g_m.protocol().set_time();

        let mac = fs::read_to_string(config::LOCAL_MAC_PATH)
            .map(|s| s.trim().to_string())
            .unwrap_or_default();
        self.report.mac.insert("GWT".to_owned(), mac.clone());
        let mac_ok = MAC_RE.is_match(&mac);
        ret_val += self.check(tst_ok(mac_ok), "gw_mac_addr", &mac);

        self.check(ret_val, "setup_cn_connection", ret_val);
        if ret_val != 0 {
            return Err(FatalError::new("Setup control node failed"));
        }
        Ok(())
    }

    /// Powers the open node on DC and opens the autotest serial. Any
    /// failure here is fatal: no test can run without the open node.
    fn setup_open_node_connection(&mut self, board_type: BoardType) -> Result<(), FatalError> {
        let mut ret_val = 0;
        ret_val += self.g_m.open_power_start(Some(PowerSource::Dc));
        thread::sleep(Duration::from_secs(2));

        ret_val += match board_type {
            BoardType::M3 => self.setup_open_node_m3(),
            BoardType::A8 => self.setup_open_node_a8(),
        };

        if ret_val != 0 {
            return Err(FatalError::new("Setup open node failed"));
        }
        Ok(())
    }

    fn setup_open_node_m3(&mut self) -> i32 {
        let mut ret_val = 0;

        let firmware = config::firmware_path(Firmware::AutotestM3);
        let ret = self.g_m.node_flash(NodeId::OpenM3, &firmware);
        ret_val += self.check(ret, "flash_m3", ret);
        thread::sleep(Duration::from_secs(2));

        match OpenNodeSerial::start(Path::new(node_m3::TTY), node_m3::BAUDRATE) {
            Ok(serial) => {
                self.on_serial = Some(Box::new(serial));
                ret_val += self.check(0, "open_M3_serial", "OK");
            }
            Err(e) => {
                ret_val += self.check(1, "open_M3_serial", e.to_string());
            }
        }
        ret_val
    }

    fn setup_open_node_a8(&mut self) -> i32 {
        let mut ret_val = 0;

        let (tty_ret, ssh_host) = match self.g_m.node_a8() {
            Some(a8) => (
                a8.wait_tty_appeared(Duration::from_secs(20)),
                a8.ssh_host().to_owned(),
            ),
            None => {
                return self.check(1, "access_A8_serial_port", "no A8 on this gateway");
            }
        };
        ret_val += tty_ret;

        debug!("Wait that open A8 node starts");
        let tunnel = match A8Tunnel::start(&ssh_host) {
            Ok(tunnel) => tunnel,
            Err(e) => {
                ret_val += self.check(1, "open_a8_init_error", e.to_string());
                return ret_val;
            }
        };

        // The A8's own MAC, read over SSH.
        let mac = self
            .g_m
            .node_a8()
            .and_then(|a8| a8.ssh_output("cat /sys/class/net/eth0/address"))
            .unwrap_or_default();
        self.report.mac.insert("A8".to_owned(), mac.clone());
        let mac_ok = MAC_RE.is_match(&mac);
        ret_val += self.check(tst_ok(mac_ok), "a8_mac_addr", &mac);

        // Flash the autotest firmware on the A8's companion MCU through the
        // A8 itself.
        let firmware = config::firmware_path(Firmware::AutotestA8);
        let scp_ret = self
            .g_m
            .node_a8()
            .map(|a8| a8.ssh_copy(&firmware, "/tmp/a8_autotest.elf"))
            .unwrap_or(1);
        if scp_ret != 0 {
            ret_val += self.check(1, "scp_a8_autotest", scp_ret);
            return ret_val;
        }
        let flash_ret = self
            .g_m
            .node_a8()
            .map(|a8| a8.ssh_run("flash_a8.sh /tmp/a8_autotest.elf"))
            .unwrap_or(1);
        if flash_ret != 0 {
            ret_val += self.check(1, "flash_a8_autotest", flash_ret);
            return ret_val;
        }
        thread::sleep(Duration::from_secs(5));

        match OpenNodeSerial::start(tunnel.pty(), 500000) {
            Ok(serial) => {
                self.on_serial = Some(Box::new(serial));
                ret_val += self.check(0, "open_A8_serial", "OK");
            }
            Err(e) => {
                ret_val += self.check(1, "open_A8_serial", e.to_string());
            }
        }
        self.a8_tunnel = Some(tunnel);
        ret_val
    }

    fn teardown(&mut self, keep_leds_on: bool) -> i32 {
        let mut ret_val = 0;
        info!("Teardown autotests");

        // Make sure the node is back on DC whatever a failed test left
        // behind.
        ret_val += self.g_m.open_power_start(Some(PowerSource::Dc));

        match self.on_serial.take() {
            Some(mut serial) => serial.stop(),
            None => ret_val += 1,
        }

        if !keep_leds_on {
            debug!("Stop open node, no blinking");
            ret_val += self.g_m.open_power_stop(Some(PowerSource::Dc));
        } else {
            debug!("Set status on LEDs");
        }

        self.g_m.cn_stop();
        debug!("cn_serial stopped");

        if let Some(mut tunnel) = self.a8_tunnel.take() {
            tunnel.stop();
        }

        self.check(ret_val, "teardown", ret_val)
    }

    /// Overrides the RSSI value treated as "no signal".
    pub fn set_no_signal_rssi(&mut self, rssi: i64) {
        self.no_signal_rssi = rssi;
    }

    fn add_warning(&mut self, operation: &str, message: &str) {
        self.report
            .warnings
            .get_or_insert_with(BTreeMap::new)
            .insert(operation.to_owned(), message.to_owned());
    }

    /// Records `operation` as passed (ret == 0) or failed and returns the
    /// failure count contribution.
    fn check<D: fmt::Debug>(&mut self, ret: i32, operation: &str, log_message: D) -> i32 {
        if ret == 0 {
            self.report.success.push(operation.to_owned());
            debug!("autotest: {:?} OK: {:?}", operation, log_message);
        } else {
            self.report.error.push(operation.to_owned());
            error!("Autotest: {:?}: {:?}", operation, log_message);
        }
        ret.abs()
    }

    /// Runs `command` `num` times and parses each acked answer. Failed
    /// calls are already recorded by `on_call` and skipped here.
    fn run_test<T, F>(&mut self, num: usize, command: &[&str], parse: F) -> Vec<T>
    where
        F: Fn(&[String]) -> Option<T>,
    {
        let mut values = Vec::new();
        for _ in 0..num {
            let (ret, answer) = self.on_call(command);
            if ret != 0 {
                continue;
            }
            if let Some(value) = answer.as_deref().and_then(&parse) {
                values.push(value);
            }
        }
        values
    }

    /// Sends `command` to the open node; a valid answer is
    /// `ACK <command> [fields...]`. Anything else is recorded as a failed
    /// command.
    fn on_call(&mut self, command: &[&str]) -> (i32, Option<Vec<String>>) {
        let answer = match self.on_serial.as_mut() {
            Some(serial) => serial.send_command(command),
            None => None,
        };
        let acked = matches!(
            answer.as_deref(),
            Some([ack, name, ..]) if ack == "ACK" && name == command[0]
        );
        if !acked {
            self.check(1, &format!("On Command: {:?}", command), &answer);
            return (1, answer);
        }
        (0, answer)
    }

    //
    // Basic liveness.
    //

    /// `get_time` is the canary for open-node serial communication; losing
    /// it is fatal.
    fn check_get_time(&mut self) -> Result<(), FatalError> {
        // get_time: ACK get_time 122953 tick_32khz
        let (_, answer) = self.on_call(&["get_time"]);

        let values = self.run_test(5, &["get_time"], |answer| {
            let ticks = answer.get(2)?;
            Some(!ticks.is_empty() && ticks.chars().all(|c| c.is_ascii_digit()))
        });
        let ok = values.iter().any(|parsed| *parsed);
        let ret = self.check(tst_ok(ok), "m3_comm_with_get_time", &answer);
        if ret != 0 {
            return Err(FatalError::new(
                "get_time failed. Can't communicate with open node",
            ));
        }
        Ok(())
    }

    fn get_uid(&mut self) -> i32 {
        // get_uid: ACK get_uid 05D8FF323632483343037109
        let values = self.run_test(1, &["get_uid"], |answer| answer.get(2).cloned());
        let ok = !values.is_empty();

        if let Some(uid_str) = values.first() {
            let uid = uid_str
                .as_bytes()
                .chunks(4)
                .map(|chunk| String::from_utf8_lossy(chunk).into_owned())
                .collect::<Vec<_>>()
                .join(":");
            self.report.open_node_m3_uid = Some(uid);
        }
        self.check(tst_ok(ok), "get_uid", &values)
    }

    //
    // Sensors.
    //

    fn test_xyz_sensor(&mut self, sensor: &str) -> i32 {
        // ACK get_gyro 1.07625 1.75 5.2500002E-2 dps
        let values = self.run_test(10, &[sensor], |answer| {
            let x: f64 = answer.get(2)?.parse().ok()?;
            let y: f64 = answer.get(3)?.parse().ok()?;
            let z: f64 = answer.get(4)?.parse().ok()?;
            Some((x, y, z))
        });
        let ok = 1 < distinct(
            values
                .iter()
                .map(|(x, y, z)| (x.to_bits(), y.to_bits(), z.to_bits())),
        );
        self.check(tst_ok(ok), sensor, &values)
    }

    fn test_pressure(&mut self) -> i32 {
        // ACK get_pressure 9.944219E2 mbar
        let values = self.run_test(10, &["get_pressure"], |answer| {
            answer.get(2)?.parse::<f64>().ok()
        });
        let ok = 1 < distinct(values.iter().map(|v| v.to_bits()));
        self.check(tst_ok(ok), "test_pressure", &values)
    }

    fn test_light(&mut self) -> i32 {
        // ACK get_light 5.2001953E1 lux
        let parse = |answer: &[String]| answer.get(2)?.parse::<f64>().ok();

        self.on_call(&["leds_on", "7"]);
        let mut values = self.run_test(5, &["get_light"], parse);
        self.on_call(&["leds_off", "7"]);
        values.extend(self.run_test(5, &["get_light"], parse));

        let ok = 1 < distinct(values.iter().map(|v| v.to_bits()));
        self.check(tst_ok(ok), "get_light", &values)
    }

    fn test_flash(&mut self, flash: bool) -> i32 {
        if !flash {
            return 0;
        }
        let values = self.run_test(1, &["test_flash"], |answer| Some(answer.to_vec()));
        let ok = !values.is_empty();
        self.check(tst_ok(ok), "test_flash", &values)
    }

    //
    // Open-node <-> control-node interconnects.
    //

    /// Puts the control node in a test role, drives the paired open-node
    /// command `num` times (one success suffices), then releases the role.
    fn test_on_cn(
        &mut self,
        num: usize,
        cn_command: &[&str],
        on_command: Option<&[&str]>,
        args: &[&str],
    ) -> i32 {
        let on_command = on_command.unwrap_or(cn_command);
        let operation = format!("{}_on_cn", cn_command[0]);
        let mut ret_val = 0;

        let mut start_command: Vec<&str> = cn_command.to_vec();
        start_command.push("start");
        start_command.extend_from_slice(args);
        ret_val += self.g_m.protocol().send_cmd(&start_command);

        let mut full_on_command: Vec<&str> = on_command.to_vec();
        full_on_command.extend_from_slice(args);
        let values = self.run_test(num, &full_on_command, |_| Some(0));
        let ok = !values.is_empty();
        ret_val += self.check(tst_ok(ok), &operation, &values);

        let mut stop_command: Vec<&str> = cn_command.to_vec();
        stop_command.push("stop");
        let ret = self.g_m.protocol().send_cmd(&stop_command);
        ret_val += self.check(ret, &operation, "cleanup error");

        ret_val
    }

    //
    // Radio.
    //

    fn test_radio_ping_pong(&mut self, channel: Option<u8>) -> i32 {
        let channel = match channel {
            Some(channel) => channel.to_string(),
            None => return 0,
        };
        self.test_on_cn(
            10,
            &["test_radio_ping_pong"],
            Some(&["radio_ping_pong"]),
            &[channel.as_str(), "3dBm"],
        )
    }

    fn test_radio_with_rssi(&mut self, channel: Option<u8>) -> i32 {
        let channel = match channel {
            Some(channel) => channel,
            None => return 0,
        };
        let radio = match Radio::new(RadioMode::Rssi, vec![channel], 10, 0) {
            Ok(radio) => radio,
            Err(e) => return self.check(1, "rssi_measures", e.to_string()),
        };

        let mut ret_val = 0;
        self.cn_measures.lock().clear();

        // Capture RSSI while the open node fires 10 packets.
        ret_val += self.g_m.protocol().config_radio(Some(&radio));
        let channel_str = channel.to_string();
        for _ in 0..10 {
            self.on_call(&["radio_pkt", channel_str.as_str(), "3dBm"]);
            thread::sleep(Duration::from_millis(500));
        }
        ret_val += self.g_m.protocol().config_radio(None);

        let measures = extract_measures(&self.cn_measures.lock());
        let values: Vec<i64> = measures.radio.values.iter().map(|(_, rssi)| *rssi).collect();

        if values.is_empty() {
            self.add_warning("rssi_measures", "no radio frames captured");
        }
        let ok = values.iter().any(|rssi| *rssi != self.no_signal_rssi);
        ret_val += self.check(tst_ok(ok), "rssi_measures", &values);
        ret_val
    }

    //
    // Consumption.
    //

    fn engine_consumption(&self, power: PowerSource, board_type: BoardType) -> Consumption {
        Consumption::new(
            power,
            board_type,
            ENGINE_PERIOD_US,
            ENGINE_AVERAGE,
            true,
            true,
            true,
        )
        .expect("engine consumption constants are valid")
    }

    fn test_consumption_dc(&mut self, board_type: BoardType) -> i32 {
        let mut ret_val = 0;

        let consumption = self.engine_consumption(PowerSource::Dc, board_type);
        ret_val += self.g_m.open_power_start(Some(PowerSource::Dc));

        self.cn_measures.lock().clear();
        ret_val += self.g_m.protocol().config_consumption(Some(&consumption));
        thread::sleep(Duration::from_secs(2));
        ret_val += self.g_m.protocol().config_consumption(None);
        thread::sleep(Duration::from_secs(2));

        let measures = extract_measures(&self.cn_measures.lock());
        let values = &measures.consumption.values;

        let ok = 1 < distinct(
            values
                .iter()
                .map(|(p, v, c)| (p.to_bits(), v.to_bits(), c.to_bits())),
        );
        ret_val += self.check(tst_ok(ok), "consumption_dc", values);
        ret_val
    }

    fn test_consumption_batt(&mut self, board_type: BoardType) -> i32 {
        let mut ret_val = 0;
        ret_val += self.g_m.open_power_start(Some(PowerSource::Battery));

        // The M3 needs a firmware that draws something; the A8's Linux is
        // load enough on its own.
        if board_type == BoardType::M3 {
            thread::sleep(Duration::from_secs(1));
            let firmware = config::firmware_path(Firmware::AutotestM3);
            let ret = self.g_m.node_flash(NodeId::OpenM3, &firmware);
            ret_val += self.check(ret, "flash_m3_on_battery", ret);
        }

        let consumption = self.engine_consumption(PowerSource::Battery, board_type);
        self.cn_measures.lock().clear();
        ret_val += self.g_m.protocol().config_consumption(Some(&consumption));

        // Toggle the rail to put a visible edge in the stream.
        ret_val += self.g_m.open_power_stop(Some(PowerSource::Battery));
        thread::sleep(Duration::from_secs(1));
        ret_val += self.g_m.open_power_start(Some(PowerSource::Battery));
        thread::sleep(Duration::from_secs(1));

        ret_val += self.g_m.protocol().config_consumption(None);
        thread::sleep(Duration::from_secs(1));

        let measures = extract_measures(&self.cn_measures.lock());
        let values = &measures.consumption.values;

        let ok = 1 < distinct(
            values
                .iter()
                .map(|(p, v, c)| (p.to_bits(), v.to_bits(), c.to_bits())),
        );
        ret_val += self.check(tst_ok(ok), "consumption_batt", values);
        ret_val
    }

    /// LEDs demonstrably draw power: the sample right after each non-zero
    /// LED mask switch must exceed the all-off sample.
    fn test_leds_with_consumption(&mut self, board_type: BoardType) -> i32 {
        self.on_call(&["leds_off", "7"]);

        let mut ret_val = 0;
        let consumption = self.engine_consumption(PowerSource::Dc, board_type);
        ret_val += self.g_m.open_power_start(Some(PowerSource::Dc));

        self.cn_measures.lock().clear();
        let mut leds_timestamps = Vec::new();
        ret_val += self.g_m.protocol().config_consumption(Some(&consumption));
        for leds in ["0", "1", "2", "4", "7"] {
            self.on_call(&["leds_on", leds]);
            thread::sleep(Duration::from_millis(500));
            leds_timestamps.push(unix_time());
            thread::sleep(Duration::from_millis(500));
            self.on_call(&["leds_off", "7"]);
        }
        ret_val += self.g_m.protocol().config_consumption(None);
        thread::sleep(Duration::from_secs(1));

        let measures = extract_measures(&self.cn_measures.lock());
        let values: Vec<f64> = measures
            .consumption
            .values
            .iter()
            .map(|(power, _, _)| *power)
            .collect();
        let timestamps = &measures.consumption.timestamps;
        debug!(
            "t0, tEnd: {:?} - {:?}",
            timestamps.first(),
            timestamps.last()
        );
        debug!("leds_timestamps: {:?}", leds_timestamps);

        let mut led_consumption: Vec<f64> = leds_timestamps
            .iter()
            .map(|&t| consumption_at(timestamps, &values, t))
            .collect();

        let led_0 = led_consumption.remove(0);
        let ok = led_consumption.iter().all(|&v| led_0 < v);
        ret_val += self.check(tst_ok(ok), "leds_using_conso", (led_0, &led_consumption));
        ret_val
    }

    //
    // GPS.
    //

    fn test_pps_open_node(&mut self, timeout: Duration) -> i32 {
        let (ret, answer) = self.on_call(&["test_pps_start"]);
        if ret != 0 {
            return self.check(1, "test_pps_start", &answer);
        }

        let deadline = Instant::now() + timeout;
        let mut outcome = None;
        while Instant::now() < deadline {
            thread::sleep(Duration::from_secs(5));
            let (ret, answer) = self.on_call(&["test_pps_get"]);
            if ret != 0 {
                return self.check(1, "test_pps_get", &answer);
            }
            let pps_count = answer
                .as_deref()
                .and_then(|a| a.get(2))
                .and_then(|count| count.parse::<i64>().ok());
            if let Some(count) = pps_count {
                if count > 2 {
                    outcome = Some(self.check(0, "test_pps_open_node", count));
                    break;
                }
            }
        }
        let ret_val = match outcome {
            Some(ret) => ret,
            None => self.check(1, "test_pps_open_node_timeout", 0),
        };
        let _ = self.on_call(&["test_pps_stop"]);
        ret_val
    }

    fn test_gps(&mut self, gps: bool) -> i32 {
        if !gps {
            return 0;
        }
        let ret_val = self.test_pps_open_node(Duration::from_secs(120));
        self.check(ret_val, "test_gps", ret_val)
    }
}

#[cfg(test)]
mod tests {
    use std::collections::VecDeque;

    use super::*;
    use crate::board_config::BoardConfig;

    struct ScriptedSerial {
        answers: VecDeque<Option<Vec<String>>>,
    }

    impl ScriptedSerial {
        fn new(answers: Vec<Option<Vec<&str>>>) -> ScriptedSerial {
            ScriptedSerial {
                answers: answers
                    .into_iter()
                    .map(|a| a.map(|tokens| tokens.iter().map(|t| t.to_string()).collect()))
                    .collect(),
            }
        }
    }

    impl OnSerial for ScriptedSerial {
        fn send_command(&mut self, _command: &[&str]) -> Option<Vec<String>> {
            self.answers.pop_front().unwrap_or(None)
        }

        fn stop(&mut self) {}
    }

    fn inner(board: &str) -> ManagerInner {
        ManagerInner::new_for_tests(BoardConfig::new(board, "test-gateway"))
    }

    #[test]
    fn check_records_success_and_error() {
        let mut g_m = inner("m3");
        let mut engine = AutoTestManager::new(&mut g_m);
        assert_eq!(engine.check(0, "op1", ["1", "2"]), 0);
        assert!(engine.report.success.contains(&"op1".to_owned()));
        assert_eq!(engine.check(1, "op2", ["3", "4"]), 1);
        assert!(engine.report.error.contains(&"op2".to_owned()));
    }

    #[test]
    fn run_test_mixes_successes_and_failures() {
        let mut g_m = inner("m3");
        let mut engine = AutoTestManager::new(&mut g_m);
        engine.on_serial = Some(Box::new(ScriptedSerial::new(vec![
            Some(vec!["ACK", "cmd", "3.14"]),
            None,
            Some(vec!["NACK", "cmd", "1.414"]),
        ])));

        let values = engine.run_test(3, &["cmd"], |answer| answer.get(2)?.parse::<f64>().ok());
        assert_eq!(values, vec![3.14]);
        assert_eq!(
            engine.report.error,
            vec!["On Command: [\"cmd\"]", "On Command: [\"cmd\"]"]
        );
        assert!(engine.report.success.is_empty());
    }

    #[test]
    fn get_uid_formats_colon_groups() {
        let mut g_m = inner("m3");
        let mut engine = AutoTestManager::new(&mut g_m);
        engine.on_serial = Some(Box::new(ScriptedSerial::new(vec![Some(vec![
            "ACK",
            "get_uid",
            "05D8FF323632483343037109",
        ])])));

        assert_eq!(engine.get_uid(), 0);
        assert_eq!(
            engine.report.open_node_m3_uid.as_deref(),
            Some("05D8:FF32:3632:4833:4303:7109")
        );
    }

    #[test]
    fn unknown_board_type_fails_immediately() {
        let mut g_m = inner("unknown");
        let report = AutoTestManager::new(&mut g_m).auto_tests(AutotestOptions::default());
        assert_ne!(report.ret, 0);
        assert_eq!(report.error, vec!["board_type"]);
        assert!(report.success.is_empty());
    }

    #[test]
    fn consumption_alignment_law() {
        let timestamps = [1.0, 2.0, 3.0];
        let values = [10.0, 20.0, 30.0];
        // First sample strictly after the event.
        assert_eq!(consumption_at(&timestamps, &values, 0.5), 10.0);
        assert_eq!(consumption_at(&timestamps, &values, 1.0), 20.0);
        assert_eq!(consumption_at(&timestamps, &values, 2.5), 30.0);
        // Past the last sample: NaN, not a panic.
        assert!(consumption_at(&timestamps, &values, 3.0).is_nan());
        assert!(consumption_at(&[], &[], 1.0).is_nan());
    }

    #[test]
    fn ack_validation_matches_first_two_tokens() {
        let mut g_m = inner("m3");
        let mut engine = AutoTestManager::new(&mut g_m);
        engine.on_serial = Some(Box::new(ScriptedSerial::new(vec![
            Some(vec!["ACK", "echo", "hello"]),
            Some(vec!["ACK", "other_cmd"]),
        ])));

        let (ret, _) = engine.on_call(&["echo"]);
        assert_eq!(ret, 0);
        // ACK for the wrong command is a failure.
        let (ret, _) = engine.on_call(&["echo"]);
        assert_eq!(ret, 1);
    }

    #[test]
    fn distinct_counts_unique_values() {
        assert_eq!(distinct([1, 1, 1]), 1);
        assert_eq!(distinct([1, 2, 1]), 2);
        assert_eq!(distinct(Vec::<i32>::new()), 0);
    }
}
