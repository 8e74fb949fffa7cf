// Copyright 2024 The SensorNet Testbed Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! Experiment state-machine behavior without gateway hardware.
//!
//! The external tools (JTAG, bridge, relay) are absent here, so every
//! hardware step reports failure, but the lifecycle invariants must hold
//! regardless: state transitions, timeout-driven stop and stale-timeout
//! safety do not depend on the tools succeeding.

use std::thread;
use std::time::Duration;

use gatewayd::BoardConfig;
use gatewayd::GatewayManager;

fn manager() -> GatewayManager {
    GatewayManager::new(BoardConfig::new("m3", "test-gateway"))
}

#[test]
fn timeout_stops_the_experiment() {
    let manager = manager();
    manager.exp_start(12, "tester", None, None, Duration::from_secs(1));
    assert!(manager.experiment_is_running());

    thread::sleep(Duration::from_secs(5));
    assert!(!manager.experiment_is_running());
    assert_eq!(manager.current_experiment(), None);
}

#[test]
fn stale_timeout_does_not_stop_the_next_experiment() {
    let manager = manager();
    manager.exp_start(10, "tester", None, None, Duration::from_secs(2));
    manager.exp_stop();

    manager.exp_start(11, "tester", None, None, Duration::ZERO);
    thread::sleep(Duration::from_secs(5));
    // Experiment 10's timer must not have stopped experiment 11.
    assert!(manager.experiment_is_running());
    assert_eq!(
        manager.current_experiment(),
        Some((11, "tester".to_owned()))
    );
    manager.exp_stop();
    assert!(!manager.experiment_is_running());
}

#[test]
fn start_while_running_stops_the_previous_experiment() {
    let manager = manager();
    manager.exp_start(1, "alice", None, None, Duration::ZERO);
    assert!(manager.experiment_is_running());

    manager.exp_start(2, "bob", None, None, Duration::ZERO);
    assert_eq!(manager.current_experiment(), Some((2, "bob".to_owned())));

    manager.exp_stop();
    assert!(!manager.experiment_is_running());
}

#[test]
fn stop_after_stop_is_a_warning_not_an_error() {
    let manager = manager();
    manager.exp_start(3, "carol", None, None, Duration::ZERO);
    manager.exp_stop();
    assert_eq!(manager.exp_stop(), 0);
}
