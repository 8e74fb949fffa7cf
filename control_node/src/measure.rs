// Copyright 2024 The SensorNet Testbed Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! Asynchronous measurement frames emitted by the control-node bridge.
//!
//! A frame is one space-separated text record:
//! `measures_debug <kind> <timestamp_seconds> <field...>`.

use log::debug;

/// Splits a raw frame line into its tokens.
pub fn tokenize(line: &str) -> Vec<String> {
    line.split(' ').map(str::to_owned).collect()
}

/// One measurement stream: values paired index-wise with timestamps.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct Series<T> {
    pub values: Vec<T>,
    pub timestamps: Vec<f64>,
}

/// Measurement frames grouped by kind, input order preserved.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct MeasureSet {
    /// `(power, voltage, current)` triples.
    pub consumption: Series<(f64, f64, f64)>,
    /// `(channel, rssi_dBm)` pairs.
    pub radio: Series<(i64, i64)>,
}

/// Extracts the known measurement kinds from raw frames.
///
/// Unknown kinds and malformed frames are dropped with a debug log.
pub fn extract_measures(frames: &[Vec<String>]) -> MeasureSet {
    let mut measures = MeasureSet::default();

    for frame in frames {
        match frame.get(1).map(String::as_str) {
            Some("consumption_measure") => {
                let parsed = (|| {
                    let timestamp: f64 = frame.get(2)?.parse().ok()?;
                    let power: f64 = frame.get(3)?.parse().ok()?;
                    let voltage: f64 = frame.get(4)?.parse().ok()?;
                    let current: f64 = frame.get(5)?.parse().ok()?;
                    Some((timestamp, (power, voltage, current)))
                })();
                match parsed {
                    Some((timestamp, values)) => {
                        measures.consumption.values.push(values);
                        measures.consumption.timestamps.push(timestamp);
                    }
                    None => debug!("malformed consumption frame: {:?}", frame),
                }
            }
            Some("radio_measure") => {
                let parsed = (|| {
                    let timestamp: f64 = frame.get(2)?.parse().ok()?;
                    let channel: i64 = frame.get(3)?.parse().ok()?;
                    let rssi: i64 = frame.get(4)?.parse().ok()?;
                    Some((timestamp, (channel, rssi)))
                })();
                match parsed {
                    Some((timestamp, values)) => {
                        measures.radio.values.push(values);
                        measures.radio.timestamps.push(timestamp);
                    }
                    None => debug!("malformed radio frame: {:?}", frame),
                }
            }
            _ => debug!("unhandled measure type: {:?}", frame),
        }
    }

    measures
}

#[cfg(test)]
mod tests {
    use super::*;

    fn frame(tokens: &[&str]) -> Vec<String> {
        tokens.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn extracts_known_kinds_in_order() {
        let frames = vec![
            frame(&[
                "measures_debug",
                "consumption_measure",
                "123.45",
                "1.0",
                "2.0",
                "3.0",
            ]),
            frame(&["measures_debug", "radio_measure", "122.0", "22", "-91"]),
            frame(&[
                "measures_debug",
                "consumption_measure",
                "124.0",
                "4.0",
                "5.0",
                "6.0",
            ]),
            frame(&["measures_debug", "unhandled"]),
        ];
        let measures = extract_measures(&frames);
        assert_eq!(
            measures.consumption.values,
            vec![(1.0, 2.0, 3.0), (4.0, 5.0, 6.0)]
        );
        assert_eq!(measures.consumption.timestamps, vec![123.45, 124.0]);
        assert_eq!(measures.radio.values, vec![(22, -91)]);
        assert_eq!(measures.radio.timestamps, vec![122.0]);
    }

    #[test]
    fn empty_input_yields_empty_set() {
        assert_eq!(extract_measures(&[]), MeasureSet::default());
    }

    #[test]
    fn malformed_frames_are_skipped() {
        let frames = vec![
            frame(&["measures_debug", "consumption_measure", "123.45", "1.0"]),
            frame(&["measures_debug", "radio_measure", "not_a_time", "22", "-91"]),
            frame(&["measures_debug", "radio_measure", "125.0", "22", "-70"]),
        ];
        let measures = extract_measures(&frames);
        assert!(measures.consumption.values.is_empty());
        assert_eq!(measures.radio.values, vec![(22, -70)]);
    }

    #[test]
    fn tokenize_splits_on_single_spaces() {
        assert_eq!(
            tokenize("measures_debug: radio_measure 1.0 11 -91"),
            vec!["measures_debug:", "radio_measure", "1.0", "11", "-91"]
        );
    }
}
