// Copyright 2024 The SensorNet Testbed Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! Static gateway paths and experiment file layout.

use std::fs;
use std::path::Path;
use std::path::PathBuf;

use control_node::ExperimentStreams;
use control_node::Profile;
use log::debug;
use log::warn;

/// Directory holding the per-gateway configuration files (`board_type`).
pub const GATEWAY_CONFIG_DIR: &str = "/var/local/config";

/// Directory holding firmware blobs and tool configuration shipped with the
/// gateway image.
pub const STATIC_DIR: &str = "/var/lib/gateway/static";

/// Root of the per-user measurement file tree.
pub const EXP_FILES_DIR: &str = "/iotlab/users";

/// Gateway MAC address, used by the autotest report.
pub const LOCAL_MAC_PATH: &str = "/sys/class/net/eth0/address";

/// Control-node serial line, held by the bridge while the link is started.
pub const CONTROL_NODE_TTY: &str = "/dev/ttyCN";

pub fn static_path(name: &str) -> PathBuf {
    Path::new(STATIC_DIR).join(name)
}

/// Firmware blobs shipped with the gateway.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum Firmware {
    ControlNode,
    IdleM3,
    AutotestM3,
    AutotestA8,
}

pub fn firmware_path(firmware: Firmware) -> PathBuf {
    static_path(match firmware {
        Firmware::ControlNode => "control_node.elf",
        Firmware::IdleM3 => "idle_m3.elf",
        Firmware::AutotestM3 => "m3_autotest.elf",
        Firmware::AutotestA8 => "a8_autotest.elf",
    })
}

/// Profile applied outside experiments and when the scheduler supplies none.
///
/// The gateway image may override the built-in default with a JSON document;
/// a missing or malformed document falls back to DC with no measurements.
pub fn default_profile(board_type: control_node::BoardType) -> Profile {
    let path = static_path("default_profile.json");
    match fs::read_to_string(&path) {
        Ok(text) => match serde_json::from_str(&text)
            .map_err(control_node::ProfileError::from)
            .and_then(|mapping| Profile::from_mapping(&mapping, board_type))
        {
            Ok(profile) => profile,
            Err(e) => {
                warn!("invalid default profile {}: {}", path.display(), e);
                Profile::default_profile()
            }
        },
        Err(e) => {
            debug!("no default profile document ({}): {}", path.display(), e);
            Profile::default_profile()
        }
    }
}

/// Derives the four measurement stream files for `(user, exp_id)` and makes
/// sure their directories exist. The bridge appends to these paths; the
/// controller only names them.
pub fn experiment_streams(user: &str, exp_id: u32, node_id: &str) -> ExperimentStreams {
    let exp_dir = Path::new(EXP_FILES_DIR)
        .join(user)
        .join(".iot-lab")
        .join(exp_id.to_string());
    let file = |kind: &str| exp_dir.join(kind).join(format!("{}.oml", node_id));
    let streams = ExperimentStreams {
        node_id: node_id.to_owned(),
        exp_id,
        consumption: file("consumption"),
        radio: file("radio"),
        event: file("event"),
        sniffer: file("sniffer"),
    };
    for path in [
        &streams.consumption,
        &streams.radio,
        &streams.event,
        &streams.sniffer,
    ] {
        if let Some(parent) = path.parent() {
            if let Err(e) = fs::create_dir_all(parent) {
                warn!("failed to create {}: {}", parent.display(), e);
            }
        }
    }
    streams
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn firmware_paths_live_in_static_dir() {
        assert_eq!(
            firmware_path(Firmware::IdleM3),
            Path::new(STATIC_DIR).join("idle_m3.elf")
        );
    }

    #[test]
    fn default_profile_falls_back_without_document() {
        // No gateway image on a development machine: the built-in default.
        let profile = default_profile(control_node::BoardType::M3);
        assert_eq!(profile.power, control_node::PowerSource::Dc);
        assert!(profile.consumption.is_none());
        assert!(profile.radio.is_none());
    }
}
