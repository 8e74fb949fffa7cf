// Copyright 2024 The SensorNet Testbed Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! Per-gateway controller of a wireless-sensor-network testbed.
//!
//! Each gateway couples an always-on *control node* (power gating and
//! measurements) with a user-programmable *open node*. This crate owns the
//! experiment lifecycle: it drives the control node through its bridge
//! process, flashes and resets the open node, redirects its serial console
//! over TCP, and runs the factory self-diagnostic.

pub mod autotest;
pub mod board_config;
pub mod config;
pub mod gateway_manager;
pub mod open_nodes;
pub mod utils;

pub use crate::autotest::AutotestOptions;
pub use crate::autotest::AutotestReport;
pub use crate::board_config::BoardConfig;
pub use crate::gateway_manager::GatewayManager;
pub use crate::gateway_manager::NodeId;
