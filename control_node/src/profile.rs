// Copyright 2024 The SensorNet Testbed Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! Measurement profile attached to an experiment.
//!
//! A profile arrives from the scheduler as an untyped JSON mapping and is
//! validated into [`Profile`] before anything is sent to the control node.
//! Closed sets (power source, sampling periods, radio channels) are enforced
//! here so the protocol layer only ever serializes valid configurations.

use std::fmt;

use remain::sorted;
use serde::Deserialize;
use serde::Serialize;
use thiserror::Error;

/// Board type hosted by this gateway.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BoardType {
    M3,
    A8,
}

impl BoardType {
    pub fn from_token(token: &str) -> Option<BoardType> {
        match token {
            "m3" => Some(BoardType::M3),
            "a8" => Some(BoardType::A8),
            _ => None,
        }
    }

    /// Supply rail measured when the open node runs on DC.
    fn alim(&self) -> &'static str {
        match self {
            BoardType::M3 => "3.3V",
            BoardType::A8 => "5V",
        }
    }
}

impl fmt::Display for BoardType {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            BoardType::M3 => write!(f, "m3"),
            BoardType::A8 => write!(f, "a8"),
        }
    }
}

/// Power source of the open node. DC also charges the battery; battery
/// discharges it.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PowerSource {
    Dc,
    Battery,
}

impl fmt::Display for PowerSource {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            PowerSource::Dc => write!(f, "dc"),
            PowerSource::Battery => write!(f, "battery"),
        }
    }
}

const PERIODS_US: [u32; 8] = [140, 204, 332, 588, 1100, 2116, 4156, 8244];
const AVERAGES: [u32; 8] = [1, 4, 16, 64, 128, 256, 512, 1024];
const CHANNELS: std::ops::RangeInclusive<u8> = 11..=26;

#[sorted]
#[derive(Error, Debug)]
pub enum ProfileError {
    #[error("invalid consumption average {0}")]
    Average(u32),
    #[error("invalid radio channel {0}")]
    Channel(u8),
    #[error("continuous radio capture requires exactly one channel")]
    ContinuousChannels,
    #[error("radio configuration without channels")]
    EmptyChannels,
    #[error("malformed profile mapping: {0}")]
    Mapping(#[from] serde_json::Error),
    #[error("invalid consumption period {0}")]
    Period(u32),
}

/// Consumption sampling configuration for the control node.
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct Consumption {
    pub power_source: PowerSource,
    pub board_type: BoardType,
    /// INA226 conversion period in microseconds.
    pub period: u32,
    /// Number of samples averaged per emitted frame.
    pub average: u32,
    pub power: bool,
    pub voltage: bool,
    pub current: bool,
}

impl Consumption {
    pub fn new(
        power_source: PowerSource,
        board_type: BoardType,
        period: u32,
        average: u32,
        power: bool,
        voltage: bool,
        current: bool,
    ) -> Result<Consumption, ProfileError> {
        if !PERIODS_US.contains(&period) {
            return Err(ProfileError::Period(period));
        }
        if !AVERAGES.contains(&average) {
            return Err(ProfileError::Average(average));
        }
        Ok(Consumption {
            power_source,
            board_type,
            period,
            average,
            power,
            voltage,
            current,
        })
    }

    /// Rail the control node samples for this configuration.
    pub fn source_token(&self) -> &'static str {
        match self.power_source {
            PowerSource::Battery => "BATT",
            PowerSource::Dc => self.board_type.alim(),
        }
    }

    /// A configuration that measures nothing disables the stream.
    pub fn measures_anything(&self) -> bool {
        self.power || self.voltage || self.current
    }
}

#[derive(Copy, Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RadioMode {
    Rssi,
    Sniffer,
    Off,
}

/// Radio capture configuration for the control node.
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct Radio {
    pub mode: RadioMode,
    /// IEEE 802.15.4 channels, each in `[11, 26]`.
    pub channels: Vec<u8>,
    /// Dwell time per channel in milliseconds.
    pub period: u32,
    /// Measurements per channel before hopping; 0 stays on one channel.
    pub num_per_channel: u32,
}

impl Radio {
    pub fn new(
        mode: RadioMode,
        channels: Vec<u8>,
        period: u32,
        num_per_channel: u32,
    ) -> Result<Radio, ProfileError> {
        if channels.is_empty() {
            return Err(ProfileError::EmptyChannels);
        }
        if let Some(&channel) = channels.iter().find(|c| !CHANNELS.contains(c)) {
            return Err(ProfileError::Channel(channel));
        }
        if num_per_channel == 0 && channels.len() != 1 {
            return Err(ProfileError::ContinuousChannels);
        }
        Ok(Radio {
            mode,
            channels,
            period,
            num_per_channel,
        })
    }
}

/// Validated experiment profile: power source plus optional measurement
/// streams.
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct Profile {
    pub name: Option<String>,
    pub power: PowerSource,
    pub consumption: Option<Consumption>,
    pub radio: Option<Radio>,
}

// Raw deserialization targets; every field is re-validated before it lands
// in the public types.
#[derive(Deserialize)]
#[serde(deny_unknown_fields)]
struct ProfileMapping {
    #[serde(default)]
    profilename: Option<String>,
    power: PowerSource,
    #[serde(default)]
    consumption: Option<ConsumptionMapping>,
    #[serde(default)]
    radio: Option<RadioMapping>,
}

#[derive(Deserialize)]
#[serde(deny_unknown_fields)]
struct ConsumptionMapping {
    period: u32,
    average: u32,
    #[serde(default)]
    power: bool,
    #[serde(default)]
    voltage: bool,
    #[serde(default)]
    current: bool,
}

#[derive(Deserialize)]
#[serde(deny_unknown_fields)]
struct RadioMapping {
    mode: RadioMode,
    channels: Vec<u8>,
    #[serde(default)]
    period: u32,
    #[serde(default)]
    num_per_channel: u32,
}

impl Profile {
    /// Builds a profile from the scheduler's untyped mapping.
    pub fn from_mapping(
        mapping: &serde_json::Value,
        board_type: BoardType,
    ) -> Result<Profile, ProfileError> {
        let raw: ProfileMapping = serde_json::from_value(mapping.clone())?;

        let consumption = match raw.consumption {
            Some(c) => Some(Consumption::new(
                raw.power,
                board_type,
                c.period,
                c.average,
                c.power,
                c.voltage,
                c.current,
            )?),
            None => None,
        };
        let radio = match raw.radio {
            Some(r) => Some(Radio::new(r.mode, r.channels, r.period, r.num_per_channel)?),
            None => None,
        };

        Ok(Profile {
            name: raw.profilename,
            power: raw.power,
            consumption,
            radio,
        })
    }

    /// DC power, no measurements. Applied outside experiments and when the
    /// scheduler supplies no profile.
    pub fn default_profile() -> Profile {
        Profile {
            name: None,
            power: PowerSource::Dc,
            consumption: None,
            radio: None,
        }
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    #[test]
    fn default_profile_is_dc_with_no_measures() {
        let profile = Profile::default_profile();
        assert_eq!(profile.power, PowerSource::Dc);
        assert!(profile.consumption.is_none());
        assert!(profile.radio.is_none());
    }

    #[test]
    fn full_mapping_accepted() {
        let mapping = json!({
            "profilename": "monitor",
            "power": "battery",
            "consumption": {
                "period": 1100,
                "average": 64,
                "power": true,
                "voltage": true,
                "current": true,
            },
            "radio": {
                "mode": "rssi",
                "channels": [11, 26],
                "period": 10,
                "num_per_channel": 1,
            },
        });
        let profile = Profile::from_mapping(&mapping, BoardType::M3).unwrap();
        assert_eq!(profile.power, PowerSource::Battery);
        let consumption = profile.consumption.unwrap();
        assert_eq!(consumption.period, 1100);
        assert_eq!(consumption.source_token(), "BATT");
        let radio = profile.radio.unwrap();
        assert_eq!(radio.mode, RadioMode::Rssi);
        assert_eq!(radio.channels, vec![11, 26]);
    }

    #[test]
    fn minimal_mapping_accepted() {
        let profile = Profile::from_mapping(&json!({"power": "dc"}), BoardType::A8).unwrap();
        assert_eq!(profile.power, PowerSource::Dc);
        assert!(profile.consumption.is_none());
    }

    #[test]
    fn unknown_key_rejected() {
        let mapping = json!({"power": "dc", "wattage": 9000});
        assert!(Profile::from_mapping(&mapping, BoardType::M3).is_err());
    }

    #[test]
    fn empty_mapping_rejected() {
        assert!(Profile::from_mapping(&json!({}), BoardType::M3).is_err());
    }

    #[test]
    fn bad_power_source_rejected() {
        let mapping = json!({"power": "solar"});
        assert!(Profile::from_mapping(&mapping, BoardType::M3).is_err());
    }

    #[test]
    fn period_outside_closed_set_rejected() {
        let mapping = json!({
            "power": "dc",
            "consumption": {"period": 1000, "average": 64},
        });
        assert!(matches!(
            Profile::from_mapping(&mapping, BoardType::M3),
            Err(ProfileError::Period(1000))
        ));
    }

    #[test]
    fn average_outside_closed_set_rejected() {
        let mapping = json!({
            "power": "dc",
            "consumption": {"period": 1100, "average": 63},
        });
        assert!(matches!(
            Profile::from_mapping(&mapping, BoardType::M3),
            Err(ProfileError::Average(63))
        ));
    }

    #[test]
    fn channel_out_of_range_rejected() {
        let mapping = json!({
            "power": "dc",
            "radio": {"mode": "rssi", "channels": [11, 27], "period": 10, "num_per_channel": 1},
        });
        assert!(matches!(
            Profile::from_mapping(&mapping, BoardType::M3),
            Err(ProfileError::Channel(27))
        ));
    }

    #[test]
    fn continuous_capture_needs_one_channel() {
        assert!(matches!(
            Radio::new(RadioMode::Rssi, vec![11, 12], 10, 0),
            Err(ProfileError::ContinuousChannels)
        ));
        assert!(Radio::new(RadioMode::Rssi, vec![11], 10, 0).is_ok());
    }

    #[test]
    fn dc_source_follows_board_alim() {
        let m3 = Consumption::new(PowerSource::Dc, BoardType::M3, 1100, 64, true, true, true);
        assert_eq!(m3.unwrap().source_token(), "3.3V");
        let a8 = Consumption::new(PowerSource::Dc, BoardType::A8, 1100, 64, true, true, true);
        assert_eq!(a8.unwrap().source_token(), "5V");
    }
}
