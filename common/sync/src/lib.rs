// Copyright 2024 The SensorNet Testbed Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! A mutex wrapper that panics on lock poisoning.
//!
//! A poisoned lock means another thread panicked while holding it, which is a
//! program bug in this codebase, not a recoverable condition. The wrapper
//! keeps call sites free of `LockResult` plumbing.

mod mutex;

pub use crate::mutex::Mutex;
pub use crate::mutex::MutexGuard;
