// Copyright 2024 The SensorNet Testbed Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! Host-side plumbing shared by the gateway daemon: child-process
//! supervision, condition polling, one-shot timers and raw serial ports.

pub mod common;
pub mod process;
pub mod serial;

pub use crate::common::wait_cond;
pub use crate::common::OneshotTimer;
pub use crate::process::ChildConfig;
pub use crate::process::ProcessError;
pub use crate::process::Supervisor;
pub use crate::serial::open_serial;
pub use crate::serial::SerialError;
