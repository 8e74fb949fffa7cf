// Copyright 2024 The SensorNet Testbed Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! Communication with the control node of a testbed gateway.
//!
//! The control node is driven through an external bridge binary that owns
//! the framed serial line. The bridge takes UTF-8 command lines on stdin and
//! reports everything else — command answers, acks, errors and asynchronous
//! measurement frames — as lines on stderr. [`link`] supervises that bridge
//! and multiplexes its stderr; [`protocol`] provides the typed commands;
//! [`profile`] models the measurement configuration those commands carry;
//! [`measure`] parses the asynchronous measurement frames.

pub mod link;
pub mod measure;
pub mod profile;
pub mod protocol;

pub use crate::link::ControlNodeLink;
pub use crate::link::ExperimentStreams;
pub use crate::link::MeasureSink;
pub use crate::measure::extract_measures;
pub use crate::measure::MeasureSet;
pub use crate::profile::BoardType;
pub use crate::profile::Consumption;
pub use crate::profile::PowerSource;
pub use crate::profile::Profile;
pub use crate::profile::ProfileError;
pub use crate::profile::Radio;
pub use crate::profile::RadioMode;
pub use crate::protocol::PowerState;
pub use crate::protocol::Protocol;
