// Copyright 2024 The SensorNet Testbed Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! Gateway self-diagnostic: exercises every peripheral connection between
//! the control node and the open node and reports pass/fail per subsystem.

pub mod a8_tunnel;
pub mod engine;
pub mod open_node_serial;

pub use engine::AutotestOptions;
pub use engine::AutotestReport;
