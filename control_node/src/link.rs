// Copyright 2024 The SensorNet Testbed Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! Supervised link to the control-node bridge process.
//!
//! The bridge owns the control-node TTY. We feed it command lines on stdin
//! and sort its stderr lines into command answers, acks, error reports and
//! asynchronous measurement frames. At most one command is in flight; the
//! answer slot holds a single entry and an unexpected second answer is
//! dropped with an error log.

use std::io::Write;
use std::path::Path;
use std::path::PathBuf;
use std::process::ChildStdin;
use std::sync::mpsc;
use std::sync::mpsc::Receiver;
use std::sync::mpsc::SyncSender;
use std::time::Duration;

use base::ChildConfig;
use base::Supervisor;
use log::debug;
use log::error;
use log::info;
use sync::Mutex;
use tempfile::NamedTempFile;

/// Bridge binary owning the control-node serial line.
pub const BRIDGE_PROGRAM: &str = "control_node_serial_interface";

/// The bridge answers within this long or the command failed.
const REPLY_TIMEOUT: Duration = Duration::from_secs(1);

/// Receives each raw `measures_debug:` line from the bridge. Called on the
/// reader thread, so it must not block.
pub type MeasureSink = Box<dyn FnMut(&str) + Send>;

/// Measurement stream files of a running experiment, consumed by the bridge.
#[derive(Clone, Debug)]
pub struct ExperimentStreams {
    pub node_id: String,
    pub exp_id: u32,
    pub consumption: PathBuf,
    pub radio: PathBuf,
    pub event: PathBuf,
    pub sniffer: PathBuf,
}

impl ExperimentStreams {
    /// Renders the stream configuration blob the bridge takes via `-c`.
    fn render(&self) -> String {
        format!(
            "<omlc id='{id}' exp_id='{exp}'>\n\
             \x20 <collect url='file:{consumption}' encoding='text'>\n\
             \x20   <stream name=\"consumption\" mp=\"consumption\" samples='1' />\n\
             \x20 </collect>\n\
             \x20 <collect url='file:{radio}' encoding='text'>\n\
             \x20   <stream name=\"radio\" mp=\"radio\" samples='1' />\n\
             \x20 </collect>\n\
             \x20 <collect url='file:{event}' encoding='text'>\n\
             \x20   <stream name=\"event\" mp=\"event\" samples='1' />\n\
             \x20 </collect>\n\
             \x20 <collect url='file:{sniffer}' encoding='text'>\n\
             \x20   <stream name=\"sniffer\" mp=\"sniffer\" samples='1' />\n\
             \x20 </collect>\n\
             </omlc>\n",
            id = self.node_id,
            exp = self.exp_id,
            consumption = self.consumption.display(),
            radio = self.radio.display(),
            event = self.event.display(),
            sniffer = self.sniffer.display(),
        )
    }
}

struct Started {
    supervisor: Supervisor,
    stdin: ChildStdin,
    answers: Receiver<Vec<String>>,
    // Deleted when the link stops.
    _streams_cfg: Option<NamedTempFile>,
}

/// Link to the control-node bridge. All methods are internally serialized;
/// `send_command` callers queue on the link mutex.
pub struct ControlNodeLink {
    tty: PathBuf,
    bridge_argv: Vec<String>,
    extra_args: Vec<String>,
    state: Mutex<Option<Started>>,
}

impl ControlNodeLink {
    pub fn new(tty: &Path) -> ControlNodeLink {
        ControlNodeLink {
            tty: tty.to_owned(),
            bridge_argv: vec![BRIDGE_PROGRAM.to_owned()],
            extra_args: Vec::new(),
            state: Mutex::new(None),
        }
    }

    /// Replaces the bridge command and appends extra arguments. Test seam.
    pub fn with_bridge(mut self, argv: &[&str], extra_args: &[&str]) -> ControlNodeLink {
        self.bridge_argv = argv.iter().map(|s| s.to_string()).collect();
        self.extra_args = extra_args.iter().map(|s| s.to_string()).collect();
        self
    }

    /// Starts the bridge and blocks until it reports `cn_serial_ready`.
    ///
    /// With `streams`, a transient configuration blob naming the measurement
    /// files is written and passed to the bridge. With `debug_measures`, the
    /// bridge is asked to report measurement frames on stderr (`-d`), which
    /// the autotest engine captures instead of stream files. `measure_sink`
    /// receives every measurement line; without one, frames are reported as
    /// errors since nobody consumes them.
    ///
    /// Returns 0 once the bridge is ready, nonzero when it exited first.
    pub fn start(
        &self,
        streams: Option<&ExperimentStreams>,
        debug_measures: bool,
        measure_sink: Option<MeasureSink>,
    ) -> i32 {
        let mut state = self.state.lock();
        if state.is_some() {
            error!("control node bridge already started");
            return 1;
        }

        let streams_cfg = match streams.map(write_streams_cfg).transpose() {
            Ok(file) => file,
            Err(e) => {
                error!("failed to write stream configuration: {}", e);
                return 1;
            }
        };

        let mut argv: Vec<String> = self.bridge_argv.clone();
        argv.push("-t".to_owned());
        argv.push(self.tty.display().to_string());
        if let Some(cfg) = &streams_cfg {
            argv.push("-c".to_owned());
            argv.push(cfg.path().display().to_string());
        }
        if debug_measures {
            argv.push("-d".to_owned());
        }
        argv.extend(self.extra_args.iter().cloned());
        let argv: Vec<&str> = argv.iter().map(String::as_str).collect();

        let mut sink = measure_sink
            .unwrap_or_else(|| Box::new(|line: &str| error!("unhandled measure frame: {}", line)));
        let (ready_tx, ready_rx) = mpsc::channel();
        let exit_ready_tx = ready_tx.clone();
        let (answer_tx, answer_rx) = mpsc::sync_channel(1);

        let mut supervisor = Supervisor::new("control-node-bridge");
        let stdin = match supervisor.start(
            &argv,
            ChildConfig {
                stdin: true,
                stderr_sink: Some(Box::new(move |line| {
                    handle_line(line, &mut sink, &answer_tx, &ready_tx)
                })),
                on_exit: Some(Box::new(move |code| {
                    error!("control node bridge exited prematurely: {}", code);
                    let _ = exit_ready_tx.send(1);
                })),
            },
        ) {
            Ok(Some(stdin)) => stdin,
            Ok(None) => unreachable!("stdin requested"),
            Err(e) => {
                error!("failed to start control node bridge: {}", e);
                return 1;
            }
        };

        // Blocks until the ready token or the bridge's early death. A
        // dropped sender means the reader is gone, which is the same
        // failure.
        let ret = ready_rx.recv().unwrap_or(1);
        if ret == 0 {
            *state = Some(Started {
                supervisor,
                stdin,
                answers: answer_rx,
                _streams_cfg: streams_cfg,
            });
        }
        ret
    }

    /// Sends one command line and waits for its answer.
    ///
    /// Answers are matched positionally: whatever non-asynchronous line the
    /// bridge prints next is the answer. Stale answers left in the slot are
    /// discarded before sending. Returns `None` on timeout or when the
    /// bridge is not running.
    pub fn send_command(&self, command: &[&str]) -> Option<Vec<String>> {
        let mut state = self.state.lock();
        let started = match state.as_mut() {
            Some(started) => started,
            None => {
                error!("control node bridge is not running");
                return None;
            }
        };

        // Discard answers from previously timed-out commands.
        while started.answers.try_recv().is_ok() {}

        debug!("control_node_cmd: {:?}", command);
        let line = format!("{}\n", command.join(" "));
        let answer = match started.stdin.write_all(line.as_bytes()) {
            Ok(()) => match started.answers.recv_timeout(REPLY_TIMEOUT) {
                Ok(answer) => Some(answer),
                Err(_) => {
                    error!("control node answer timeout");
                    None
                }
            },
            Err(e) => {
                error!("control node bridge stdin write failed: {}", e);
                None
            }
        };
        debug!("control_node_answer: {:?}", answer);
        answer
    }

    /// Terminates the bridge and joins the reader. Idempotent.
    pub fn stop(&self) -> i32 {
        if let Some(mut started) = self.state.lock().take() {
            started.supervisor.stop();
        }
        0
    }

    pub fn started(&self) -> bool {
        self.state.lock().is_some()
    }
}

impl Drop for ControlNodeLink {
    fn drop(&mut self) {
        self.stop();
    }
}

fn write_streams_cfg(streams: &ExperimentStreams) -> std::io::Result<NamedTempFile> {
    let mut file = tempfile::Builder::new()
        .suffix("--streams.config")
        .tempfile()?;
    file.write_all(streams.render().as_bytes())?;
    file.flush()?;
    Ok(file)
}

/// Sorts one bridge stderr line per the link grammar.
fn handle_line(
    line: &str,
    measure_sink: &mut MeasureSink,
    answer_tx: &SyncSender<Vec<String>>,
    ready_tx: &mpsc::Sender<i32>,
) {
    if line.is_empty() {
        return;
    }
    let tokens: Vec<String> = line.split(' ').map(str::to_owned).collect();
    match tokens[0].as_str() {
        "config_ack" => {
            let name = tokens.get(1).map(String::as_str).unwrap_or("");
            debug!("config_ack {}", name);
            if name == "set_time" {
                match tokens.get(2).and_then(|d| d.parse::<f64>().ok()) {
                    Some(delta) => {
                        info!("Control node set time delta: {} us", (1e6 * delta) as i64)
                    }
                    None => error!("config_ack set_time without a delta: {}", line),
                }
            }
        }
        "error" => {
            error!(
                "Control node error: {:?}",
                tokens.get(1).map(String::as_str).unwrap_or("")
            );
        }
        "cn_serial_error:" => error!("{}", line),
        "measures_debug:" => measure_sink(line),
        "cn_serial_ready" => {
            let _ = ready_tx.send(0);
        }
        _ => {
            if answer_tx.try_send(tokens).is_err() {
                error!("control node answer slot full, dropping: {:?}", line);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;

    // Stands in for the bridge binary: reports readiness, then acks every
    // stdin command, interleaving a measurement frame when asked to.
    const FAKE_BRIDGE: &str = r#"
echo cn_serial_ready >&2
while read -r line; do
    set -- $line
    case "$1" in
    emit_measure)
        echo 'measures_debug: consumption_measure 123.45 1.0 2.0 3.0' >&2
        echo "$1 ack" >&2
        ;;
    be_silent)
        ;;
    *)
        echo "$1 ack" >&2
        ;;
    esac
done
"#;

    fn fake_link() -> ControlNodeLink {
        ControlNodeLink::new(Path::new("/dev/null")).with_bridge(
            &["sh", "-c", FAKE_BRIDGE, "fake-bridge"],
            &[],
        )
    }

    #[test]
    fn start_command_stop() {
        let link = fake_link();
        assert_eq!(link.start(None, false, None), 0);
        assert!(link.started());
        assert_eq!(
            link.send_command(&["set_time"]),
            Some(vec!["set_time".to_owned(), "ack".to_owned()])
        );
        assert_eq!(link.stop(), 0);
        assert!(!link.started());
    }

    #[test]
    fn stop_is_idempotent() {
        let link = fake_link();
        assert_eq!(link.stop(), 0);
        assert_eq!(link.start(None, false, None), 0);
        assert_eq!(link.stop(), 0);
        assert_eq!(link.stop(), 0);
    }

    #[test]
    fn start_fails_when_bridge_dies_first() {
        let link = ControlNodeLink::new(Path::new("/dev/null"))
            .with_bridge(&["sh", "-c", "exit 7", "fake-bridge"], &[]);
        assert_ne!(link.start(None, false, None), 0);
        assert!(!link.started());
    }

    #[test]
    fn command_timeout_returns_none() {
        let link = fake_link();
        assert_eq!(link.start(None, false, None), 0);
        assert_eq!(link.send_command(&["be_silent"]), None);
        // The link recovers for the next command.
        assert_eq!(
            link.send_command(&["green_led_on"]),
            Some(vec!["green_led_on".to_owned(), "ack".to_owned()])
        );
        link.stop();
    }

    #[test]
    fn measure_lines_reach_the_sink_not_the_answer_slot() {
        let measures: Arc<sync::Mutex<Vec<String>>> = Arc::new(sync::Mutex::new(Vec::new()));
        let sink_measures = measures.clone();
        let link = fake_link();
        assert_eq!(
            link.start(
                None,
                false,
                Some(Box::new(move |line: &str| {
                    sink_measures.lock().push(line.to_owned())
                })),
            ),
            0
        );
        // The frame is printed before the ack but must not be taken as the
        // answer.
        assert_eq!(
            link.send_command(&["emit_measure"]),
            Some(vec!["emit_measure".to_owned(), "ack".to_owned()])
        );
        link.stop();
        let measures = measures.lock();
        assert_eq!(measures.len(), 1);
        assert!(measures[0].starts_with("measures_debug: consumption_measure"));
    }

    #[test]
    fn send_without_start_fails() {
        let link = fake_link();
        assert_eq!(link.send_command(&["set_time"]), None);
    }

    #[test]
    fn streams_cfg_names_all_four_files() {
        let streams = ExperimentStreams {
            node_id: "m3-7".to_owned(),
            exp_id: 123,
            consumption: PathBuf::from("/tmp/consumption"),
            radio: PathBuf::from("/tmp/radio"),
            event: PathBuf::from("/tmp/event"),
            sniffer: PathBuf::from("/tmp/sniffer"),
        };
        let blob = streams.render();
        assert!(blob.contains("id='m3-7'"));
        assert!(blob.contains("exp_id='123'"));
        for stream in ["consumption", "radio", "event", "sniffer"] {
            assert!(blob.contains(&format!("file:/tmp/{}", stream)));
            assert!(blob.contains(&format!("name=\"{}\"", stream)));
        }
    }
}
