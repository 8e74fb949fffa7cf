// Copyright 2024 The SensorNet Testbed Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! Experiment lifecycle orchestration.
//!
//! One [`GatewayManager`] per gateway owns the "an experiment is running"
//! state and drives the control node, the open node and the serial
//! redirection through the ordered start/stop sequences. Every public
//! operation takes the single manager mutex, so no two operations overlap;
//! the sequences themselves run on locked inner methods that are free to
//! call each other.

use std::path::Path;
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use anyhow::bail;
use base::OneshotTimer;
use control_node::ControlNodeLink;
use control_node::MeasureSink;
use control_node::PowerSource;
use control_node::PowerState;
use control_node::Profile;
use control_node::Protocol;
use log::debug;
use log::error;
use log::info;
use log::warn;
use sync::Mutex;

use crate::autotest::engine::AutoTestManager;
use crate::autotest::engine::AutotestOptions;
use crate::autotest::engine::AutotestReport;
use crate::board_config::BoardConfig;
use crate::config;
use crate::config::Firmware;
use crate::open_nodes::NodeA8;
use crate::open_nodes::OpenNode;
use crate::utils::openocd::OpenOcd;

const A8_TTY_WAIT: Duration = Duration::from_secs(5);
const A8_BOOT_TIMEOUT: Duration = Duration::from_secs(5 * 60);
// Give the control node firmware time to come back after the soft reset.
const CONTROL_NODE_SETTLE: Duration = Duration::from_secs(1);

/// Node addressed by flash and reset operations.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum NodeId {
    /// The always-on control node (`gwt`).
    ControlNode,
    /// The M3 open node.
    OpenM3,
}

impl std::fmt::Display for NodeId {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        match self {
            NodeId::ControlNode => write!(f, "gwt"),
            NodeId::OpenM3 => write!(f, "m3"),
        }
    }
}

/// Handle to the per-gateway controller. Clones share the same state.
#[derive(Clone)]
pub struct GatewayManager {
    inner: Arc<Mutex<ManagerInner>>,
}

impl GatewayManager {
    pub fn new(board: BoardConfig) -> GatewayManager {
        GatewayManager {
            inner: Arc::new(Mutex::new(ManagerInner::new(board))),
        }
    }

    /// Flashes the control-node firmware. Must succeed before the gateway
    /// can serve experiments.
    pub fn setup(&self) -> anyhow::Result<()> {
        let mut inner = self.inner.lock();
        let firmware = config::firmware_path(Firmware::ControlNode);
        let ret = inner.node_flash(NodeId::ControlNode, &firmware);
        if ret != 0 {
            bail!(
                "control node flash failed: {{ret: {}, firmware: {}}}",
                ret,
                firmware.display()
            );
        }
        Ok(())
    }

    /// Starts an experiment. A running experiment is stopped first.
    ///
    /// `timeout` of zero means no automatic stop. Returns 0 when every
    /// start step succeeded.
    pub fn exp_start(
        &self,
        exp_id: u32,
        user: &str,
        firmware_path: Option<&Path>,
        profile_mapping: Option<&serde_json::Value>,
        timeout: Duration,
    ) -> i32 {
        let manager = self.clone();
        let mut inner = self.inner.lock();
        inner.exp_start(exp_id, user, firmware_path, profile_mapping, timeout, manager)
    }

    /// Stops the current experiment. Stopping an idle gateway warns and
    /// returns 0.
    pub fn exp_stop(&self) -> i32 {
        self.inner.lock().exp_stop()
    }

    /// Replaces the profile of the running experiment and re-applies it.
    pub fn exp_update_profile(&self, profile_mapping: &serde_json::Value) -> i32 {
        let mut inner = self.inner.lock();
        let board_type = match inner.board.board_type() {
            Some(board_type) => board_type,
            None => {
                error!("Board type not managed: {}", inner.board.board_type_token());
                return 1;
            }
        };
        match Profile::from_mapping(profile_mapping, board_type) {
            Ok(profile) => {
                inner.profile = Some(profile);
                inner.update_profile()
            }
            Err(e) => {
                error!("Invalid profile: {}", e);
                1
            }
        }
    }

    /// Zeroes the control-node clock.
    pub fn reset_time(&self) -> i32 {
        self.inner.lock().reset_time()
    }

    /// Powers the open node on, from `power` or the current profile.
    pub fn open_power_start(&self, power: Option<PowerSource>) -> i32 {
        self.inner.lock().open_power_start(power)
    }

    /// Powers the open node off.
    pub fn open_power_stop(&self, power: Option<PowerSource>) -> i32 {
        self.inner.lock().open_power_stop(power)
    }

    /// Flashes `firmware` on the given node.
    pub fn node_flash(&self, node: NodeId, firmware: &Path) -> i32 {
        self.inner.lock().node_flash(node, firmware)
    }

    /// Resets the given node through its JTAG adapter.
    pub fn node_soft_reset(&self, node: NodeId) -> i32 {
        self.inner.lock().node_soft_reset(node)
    }

    /// Runs the self-diagnostic scenario. Mutually exclusive with every
    /// other operation, experiments included.
    pub fn auto_tests(&self, options: AutotestOptions) -> AutotestReport {
        let mut inner = self.inner.lock();
        AutoTestManager::new(&mut inner).auto_tests(options)
    }

    pub fn experiment_is_running(&self) -> bool {
        self.inner.lock().experiment_is_running
    }

    pub fn current_experiment(&self) -> Option<(u32, String)> {
        let inner = self.inner.lock();
        match (inner.exp_id, inner.user.as_ref()) {
            (Some(exp_id), Some(user)) => Some((exp_id, user.clone())),
            _ => None,
        }
    }

    /// Timeout-timer entry point: stops the experiment only when the
    /// (exp_id, user) it was armed for is still the one running.
    fn timeout_exp_stop(&self, exp_id: u32, user: &str) {
        let mut inner = self.inner.lock();
        debug!("Timeout experiment: {:?} {:?}", user, exp_id);
        if inner.exp_id == Some(exp_id) && inner.user.as_deref() == Some(user) {
            debug!("Still running. Stop exp");
            inner.exp_stop();
        }
    }
}

pub(crate) struct ManagerInner {
    board: BoardConfig,
    exp_id: Option<u32>,
    user: Option<String>,
    experiment_is_running: bool,
    profile: Option<Profile>,
    open_node_state: PowerState,
    cn_link: Arc<ControlNodeLink>,
    protocol: Protocol,
    cn_openocd: OpenOcd,
    open_node: Option<OpenNode>,
    timeout_timer: Option<OneshotTimer>,
}

impl ManagerInner {
    fn new(board: BoardConfig) -> ManagerInner {
        let cn_link = Arc::new(ControlNodeLink::new(Path::new(config::CONTROL_NODE_TTY)));
        let protocol = Protocol::new(cn_link.clone());
        let open_node = board.board_type().map(OpenNode::new);
        ManagerInner {
            board,
            exp_id: None,
            user: None,
            experiment_is_running: false,
            profile: None,
            open_node_state: PowerState::Stop,
            cn_link,
            protocol,
            cn_openocd: OpenOcd::new(&config::static_path("iot-lab-cn.cfg")),
            open_node,
            timeout_timer: None,
        }
    }

    fn exp_start(
        &mut self,
        exp_id: u32,
        user: &str,
        firmware_path: Option<&Path>,
        profile_mapping: Option<&serde_json::Value>,
        timeout: Duration,
        manager: GatewayManager,
    ) -> i32 {
        let board_type = match self.board.board_type() {
            Some(board_type) => board_type,
            None => {
                error!(
                    "Board type not managed: {:?}",
                    self.board.board_type_token()
                );
                return 1;
            }
        };

        if self.experiment_is_running {
            warn!("Experiment running. Stop previous experiment");
            self.exp_stop();
        }

        let profile = match profile_mapping {
            Some(mapping) => match Profile::from_mapping(mapping, board_type) {
                Ok(profile) => profile,
                Err(e) => {
                    error!("Invalid profile: {}", e);
                    return 1;
                }
            },
            None => config::default_profile(board_type),
        };

        info!("Start experiment {} of user {:?}", exp_id, user);
        self.exp_id = Some(exp_id);
        self.user = Some(user.to_owned());
        self.profile = Some(profile);
        self.experiment_is_running = true;

        let mut ret_val = 0;

        // Prepare gateway.
        ret_val += self.node_soft_reset(NodeId::ControlNode);
        thread::sleep(CONTROL_NODE_SETTLE);
        let streams = config::experiment_streams(user, exp_id, self.board.hostname());
        ret_val += self.cn_link.start(Some(&streams), false, None);

        // Prepare control node.
        ret_val += self.protocol.green_led_blink();
        ret_val += self.open_power_start(Some(PowerSource::Dc));
        ret_val += self.reset_time();
        ret_val += self.update_profile();

        // Prepare open node.
        match self.open_node.as_mut() {
            Some(OpenNode::M3(m3)) => {
                ret_val += m3.setup(firmware_path);
            }
            Some(OpenNode::A8(a8)) => {
                let ret = a8.wait_tty_appeared(A8_TTY_WAIT);
                ret_val += ret;
                if ret == 0 {
                    a8.boot_watch_start(A8_BOOT_TIMEOUT);
                }
            }
            None => {
                error!("No open node for board {}", self.board.board_type_token());
                ret_val += 1;
            }
        }

        if !timeout.is_zero() {
            debug!("Setting timeout to: {:?}", timeout);
            let user = user.to_owned();
            self.timeout_timer = Some(OneshotTimer::arm("exp-timeout", timeout, move || {
                manager.timeout_exp_stop(exp_id, &user)
            }));
        }
        ret_val
    }

    pub(crate) fn exp_stop(&mut self) -> i32 {
        if !self.experiment_is_running {
            warn!("No experiment running. Don't stop");
            return 0;
        }
        info!("Stop experiment");
        if let Some(timer) = self.timeout_timer.take() {
            timer.cancel();
        }

        let mut ret_val = 0;

        // Back to the default profile; this also means DC power.
        self.profile = Some(
            self.board
                .board_type()
                .map(config::default_profile)
                .unwrap_or_else(Profile::default_profile),
        );
        ret_val += self.update_profile();
        ret_val += self.open_power_start(Some(PowerSource::Dc));
        ret_val += self.protocol.green_led_on();

        // Open-node teardown.
        match self.open_node.as_mut() {
            Some(OpenNode::M3(m3)) => {
                ret_val += m3.teardown();
            }
            Some(OpenNode::A8(a8)) => a8.boot_watch_stop(),
            None => {}
        }
        ret_val += self.open_power_stop(Some(PowerSource::Dc));
        if let Some(OpenNode::A8(a8)) = self.open_node.as_ref() {
            ret_val += a8.wait_tty_disappeared(A8_TTY_WAIT);
        }

        self.cn_link.stop();

        self.user = None;
        self.exp_id = None;
        self.profile = None;
        self.experiment_is_running = false;

        ret_val
    }

    /// Re-applies the current profile: power source under the current
    /// on/off state, then consumption, then radio.
    pub(crate) fn update_profile(&mut self) -> i32 {
        debug!("Update profile");
        let profile = match self.profile.clone() {
            Some(profile) => profile,
            None => {
                error!("No profile to apply");
                return 1;
            }
        };

        let mut ret = 0;
        ret += self
            .protocol
            .start_stop(self.open_node_state, profile.power);
        ret += self.protocol.config_consumption(profile.consumption.as_ref());
        ret += self.protocol.config_radio(profile.radio.as_ref());

        if ret != 0 {
            error!("Profile update failed");
        }
        ret
    }

    pub(crate) fn reset_time(&mut self) -> i32 {
        debug!("Reset control node time");
        let ret = self.protocol.set_time();
        if ret != 0 {
            error!("Reset time failed");
        }
        ret
    }

    pub(crate) fn open_power_start(&mut self, power: Option<PowerSource>) -> i32 {
        debug!("Open power start");
        let power = match power.or_else(|| self.profile.as_ref().map(|p| p.power)) {
            Some(power) => power,
            None => {
                error!("No power source selected");
                return 1;
            }
        };
        let ret = self.protocol.start_stop(PowerState::Start, power);
        if ret != 0 {
            error!("Open power start failed");
        } else {
            self.open_node_state = PowerState::Start;
        }
        ret
    }

    pub(crate) fn open_power_stop(&mut self, power: Option<PowerSource>) -> i32 {
        debug!("Open power stop");
        let power = match power.or_else(|| self.profile.as_ref().map(|p| p.power)) {
            Some(power) => power,
            None => {
                error!("No power source selected");
                return 1;
            }
        };
        let ret = self.protocol.start_stop(PowerState::Stop, power);
        if ret != 0 {
            error!("Open power stop failed");
        } else {
            self.open_node_state = PowerState::Stop;
        }
        ret
    }

    pub(crate) fn node_soft_reset(&mut self, node: NodeId) -> i32 {
        debug!("Node {} reset", node);
        let ret = match node {
            NodeId::ControlNode => self.cn_openocd.reset(),
            NodeId::OpenM3 => match self.open_node.as_mut() {
                Some(OpenNode::M3(m3)) => m3.reset(),
                _ => {
                    error!("No M3 node on this gateway");
                    1
                }
            },
        };
        if ret != 0 {
            error!("Node {} reset failed: {}", node, ret);
        }
        ret
    }

    pub(crate) fn node_flash(&mut self, node: NodeId, firmware: &Path) -> i32 {
        info!("Flash firmware on {}: {}", node, firmware.display());
        let ret = match node {
            NodeId::ControlNode => self.cn_openocd.flash(firmware),
            NodeId::OpenM3 => match self.open_node.as_mut() {
                Some(OpenNode::M3(m3)) => m3.flash(Some(firmware)),
                _ => {
                    error!("No M3 node on this gateway");
                    1
                }
            },
        };
        if ret != 0 {
            error!("Flash firmware failed on {}: {}", node, ret);
        }
        ret
    }

    // Autotest engine access.

    pub(crate) fn board(&self) -> &BoardConfig {
        &self.board
    }

    pub(crate) fn protocol(&self) -> &Protocol {
        &self.protocol
    }

    pub(crate) fn cn_start_debug(&self, sink: MeasureSink) -> i32 {
        self.cn_link.start(None, true, Some(sink))
    }

    pub(crate) fn cn_stop(&self) -> i32 {
        self.cn_link.stop()
    }

    pub(crate) fn node_a8(&mut self) -> Option<&mut NodeA8> {
        match self.open_node.as_mut() {
            Some(OpenNode::A8(a8)) => Some(a8),
            _ => None,
        }
    }

    #[cfg(test)]
    pub(crate) fn new_for_tests(board: BoardConfig) -> ManagerInner {
        ManagerInner::new(board)
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    fn manager(board_token: &str) -> GatewayManager {
        GatewayManager::new(BoardConfig::new(board_token, "test-gateway"))
    }

    fn with_cn_jtag(manager: GatewayManager, program: &str) -> GatewayManager {
        manager.inner.lock().cn_openocd =
            OpenOcd::new(Path::new("iot-lab-cn.cfg")).with_program(program);
        manager
    }

    #[test]
    fn setup_flashes_the_control_node() {
        let manager = with_cn_jtag(manager("m3"), "true");
        assert!(manager.setup().is_ok());
    }

    #[test]
    fn setup_fails_when_control_node_flash_fails() {
        let manager = with_cn_jtag(manager("m3"), "false");
        assert!(manager.setup().is_err());
    }

    #[test]
    fn stop_when_idle_returns_zero() {
        let manager = manager("m3");
        assert_eq!(manager.exp_stop(), 0);
        assert_eq!(manager.exp_stop(), 0);
        assert!(!manager.experiment_is_running());
    }

    #[test]
    fn start_with_unsupported_board_fails() {
        let manager = manager("leonardo");
        let ret = manager.exp_start(1, "user", None, None, Duration::ZERO);
        assert_ne!(ret, 0);
        assert!(!manager.experiment_is_running());
    }

    #[test]
    fn start_with_invalid_profile_fails_without_state_change() {
        let manager = manager("m3");
        let mapping = json!({"power": "solar"});
        let ret = manager.exp_start(1, "user", None, Some(&mapping), Duration::ZERO);
        assert_eq!(ret, 1);
        assert!(!manager.experiment_is_running());
        assert_eq!(manager.current_experiment(), None);
    }

    #[test]
    fn update_profile_with_invalid_mapping_fails() {
        let manager = manager("m3");
        assert_eq!(manager.exp_update_profile(&json!({"bogus": 1})), 1);
    }

    #[test]
    fn stale_timeout_does_not_stop_idle_gateway() {
        let manager = manager("m3");
        manager.timeout_exp_stop(10, "user");
        assert!(!manager.experiment_is_running());
    }

    #[test]
    fn node_id_tokens() {
        assert_eq!(NodeId::ControlNode.to_string(), "gwt");
        assert_eq!(NodeId::OpenM3.to_string(), "m3");
    }
}
