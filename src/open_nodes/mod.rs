// Copyright 2024 The SensorNet Testbed Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! Per-board open-node adapters.

pub mod node_a8;
pub mod node_m3;

pub use node_a8::NodeA8;
pub use node_m3::NodeM3;

use control_node::BoardType;

/// The open node hosted by this gateway.
pub enum OpenNode {
    M3(NodeM3),
    A8(NodeA8),
}

impl OpenNode {
    pub fn new(board_type: BoardType) -> OpenNode {
        match board_type {
            BoardType::M3 => OpenNode::M3(NodeM3::new()),
            BoardType::A8 => OpenNode::A8(NodeA8::new()),
        }
    }
}
