// Copyright 2024 The SensorNet Testbed Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! Typed commands for the control-node firmware.
//!
//! Every operation serializes to one space-separated command line, sent
//! through [`ControlNodeLink::send_command`]. A positive answer is
//! `[<command>, "ack"]`; anything else (nack, unexpected tokens, timeout)
//! counts as failure. Operations return 0 on success, nonzero otherwise, so
//! callers can accumulate return codes across a sequence of steps.

use std::sync::Arc;

use log::error;

use crate::link::ControlNodeLink;
use crate::profile::Consumption;
use crate::profile::PowerSource;
use crate::profile::Radio;
use crate::profile::RadioMode;

/// Requested open-node power rail state.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum PowerState {
    Start,
    Stop,
}

impl PowerState {
    fn token(&self) -> &'static str {
        match self {
            PowerState::Start => "start",
            PowerState::Stop => "stop",
        }
    }
}

/// Typed wrapper over the bridge link.
pub struct Protocol {
    link: Arc<ControlNodeLink>,
}

impl Protocol {
    pub fn new(link: Arc<ControlNodeLink>) -> Protocol {
        Protocol { link }
    }

    /// Zeroes the control-node clock. The measured clock delta arrives as an
    /// asynchronous `config_ack set_time` line logged by the link.
    pub fn set_time(&self) -> i32 {
        self.send_cmd(&["set_time"])
    }

    /// Switches the open-node power rail. DC also charges the battery.
    pub fn start_stop(&self, action: PowerState, power: PowerSource) -> i32 {
        let power = power.to_string();
        self.send_cmd(&[action.token(), &power])
    }

    /// Configures the consumption stream; `None` disables it.
    pub fn config_consumption(&self, consumption: Option<&Consumption>) -> i32 {
        let command = consumption_command(consumption);
        let command: Vec<&str> = command.iter().map(String::as_str).collect();
        self.send_cmd(&command)
    }

    /// Configures the radio stream; `None` (or mode `off`) disables it.
    pub fn config_radio(&self, radio: Option<&Radio>) -> i32 {
        let command = radio_command(radio);
        let command: Vec<&str> = command.iter().map(String::as_str).collect();
        self.send_cmd(&command)
    }

    pub fn green_led_on(&self) -> i32 {
        self.send_cmd(&["green_led_on"])
    }

    pub fn green_led_blink(&self) -> i32 {
        self.send_cmd(&["green_led_blink"])
    }

    /// Sends a raw command and validates its ack. Autotest interconnect
    /// checks drive control-node test roles through this.
    pub fn send_cmd(&self, command: &[&str]) -> i32 {
        let answer = self.link.send_command(command);
        let acked = matches!(
            answer.as_deref(),
            Some([name, ack, ..]) if name == command[0] && ack == "ack"
        );
        if acked {
            0
        } else {
            error!("Command {:?} failed: {:?}", command, answer);
            1
        }
    }
}

fn consumption_command(consumption: Option<&Consumption>) -> Vec<String> {
    let mut command = vec!["config_consumption_measure".to_owned()];
    match consumption {
        Some(consumption) if consumption.measures_anything() => {
            command.push("start".to_owned());
            command.push(consumption.source_token().to_owned());
            command.push("p".to_owned());
            command.push(consumption.period.to_string());
            command.push("a".to_owned());
            command.push(consumption.average.to_string());
            for (enabled, name) in [
                (consumption.power, "power"),
                (consumption.voltage, "voltage"),
                (consumption.current, "current"),
            ] {
                if enabled {
                    command.push(name.to_owned());
                }
            }
        }
        _ => command.push("stop".to_owned()),
    }
    command
}

fn radio_command(radio: Option<&Radio>) -> Vec<String> {
    let radio = match radio {
        Some(radio) if radio.mode != RadioMode::Off => radio,
        _ => return vec!["config_radio_stop".to_owned()],
    };
    let name = match radio.mode {
        RadioMode::Rssi => "config_radio_measure",
        RadioMode::Sniffer => "config_radio_sniffer",
        RadioMode::Off => unreachable!(),
    };
    let channels = radio
        .channels
        .iter()
        .map(|c| c.to_string())
        .collect::<Vec<_>>()
        .join(",");
    vec![
        name.to_owned(),
        channels,
        radio.period.to_string(),
        radio.num_per_channel.to_string(),
    ]
}

#[cfg(test)]
mod tests {
    use std::path::Path;

    use super::*;
    use crate::profile::BoardType;

    #[test]
    fn consumption_start_tokens() {
        let consumption = Consumption::new(
            PowerSource::Dc,
            BoardType::M3,
            1100,
            64,
            true,
            true,
            false,
        )
        .unwrap();
        assert_eq!(
            consumption_command(Some(&consumption)),
            vec![
                "config_consumption_measure",
                "start",
                "3.3V",
                "p",
                "1100",
                "a",
                "64",
                "power",
                "voltage",
            ]
        );
    }

    #[test]
    fn consumption_none_or_empty_stops() {
        assert_eq!(
            consumption_command(None),
            vec!["config_consumption_measure", "stop"]
        );
        let nothing = Consumption::new(
            PowerSource::Dc,
            BoardType::M3,
            1100,
            64,
            false,
            false,
            false,
        )
        .unwrap();
        assert_eq!(
            consumption_command(Some(&nothing)),
            vec!["config_consumption_measure", "stop"]
        );
    }

    #[test]
    fn radio_rssi_tokens() {
        let radio = Radio::new(RadioMode::Rssi, vec![11, 14], 10, 1).unwrap();
        assert_eq!(
            radio_command(Some(&radio)),
            vec!["config_radio_measure", "11,14", "10", "1"]
        );
        let single = Radio::new(RadioMode::Rssi, vec![26], 10, 0).unwrap();
        assert_eq!(
            radio_command(Some(&single)),
            vec!["config_radio_measure", "26", "10", "0"]
        );
    }

    #[test]
    fn radio_off_and_none_stop() {
        assert_eq!(radio_command(None), vec!["config_radio_stop"]);
        let off = Radio::new(RadioMode::Off, vec![11], 10, 1).unwrap();
        assert_eq!(radio_command(Some(&off)), vec!["config_radio_stop"]);
    }

    const NACK_BRIDGE: &str = r#"
echo cn_serial_ready >&2
while read -r line; do
    set -- $line
    echo "$1 nack" >&2
done
"#;

    #[test]
    fn nack_is_a_failure() {
        let link = Arc::new(
            ControlNodeLink::new(Path::new("/dev/null")).with_bridge(
                &["sh", "-c", NACK_BRIDGE, "fake-bridge"],
                &[],
            ),
        );
        assert_eq!(link.start(None, false, None), 0);
        let protocol = Protocol::new(link.clone());
        assert_eq!(protocol.set_time(), 1);
        assert_eq!(
            protocol.start_stop(PowerState::Start, PowerSource::Dc),
            1
        );
        link.stop();
    }
}
