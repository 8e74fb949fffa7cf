// Copyright 2024 The SensorNet Testbed Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! Line-oriented serial interface to the open node's self-test firmware.
//!
//! One command line out, one answer line back, up to 5 s later. Some
//! firmware revisions only push bytes out when the line is polled, so the
//! reader sleeps 100 ms between reads instead of spinning on the 0.5 s
//! port timeout.

use std::fs::File;
use std::io::Read;
use std::io::Write;
use std::path::Path;
use std::sync::atomic::AtomicBool;
use std::sync::atomic::Ordering;
use std::sync::mpsc;
use std::sync::mpsc::Receiver;
use std::sync::mpsc::Sender;
use std::sync::Arc;
use std::thread;
use std::thread::JoinHandle;
use std::time::Duration;

use base::SerialError;
use control_node::measure::tokenize;
use log::debug;
use log::error;

const REPLY_TIMEOUT: Duration = Duration::from_secs(5);
const POLL_PAUSE: Duration = Duration::from_millis(100);

/// Command/answer seam to the open node. The autotest engine only depends
/// on this trait, so tests can script answers.
pub trait OnSerial: Send {
    /// Sends one command and returns the next answer line, tokenized, or
    /// `None` on timeout.
    fn send_command(&mut self, command: &[&str]) -> Option<Vec<String>>;

    /// Releases the TTY.
    fn stop(&mut self);
}

/// Serial implementation over the open node's TTY.
pub struct OpenNodeSerial {
    port: File,
    answers: Receiver<String>,
    stop: Arc<AtomicBool>,
    reader: Option<JoinHandle<()>>,
}

impl OpenNodeSerial {
    pub fn start(tty: &Path, baudrate: u32) -> Result<OpenNodeSerial, SerialError> {
        let port = base::open_serial(tty, baudrate)?;
        let reader_port = port
            .try_clone()
            .map_err(|e| SerialError::Open(tty.to_owned(), e))?;
        let (answer_tx, answers) = mpsc::channel();
        let stop = Arc::new(AtomicBool::new(false));
        let reader_stop = stop.clone();
        let reader = thread::Builder::new()
            .name("open-node-serial".to_owned())
            .spawn(move || reader_thread(reader_port, answer_tx, reader_stop))
            .expect("failed to spawn serial reader thread");
        Ok(OpenNodeSerial {
            port,
            answers,
            stop,
            reader: Some(reader),
        })
    }
}

impl OnSerial for OpenNodeSerial {
    fn send_command(&mut self, command: &[&str]) -> Option<Vec<String>> {
        // Discard lines from earlier exchanges.
        while self.answers.try_recv().is_ok() {}

        let line = format!("{}\n", command.join(" "));
        debug!("open_node_cmd: {:?}", command);
        if let Err(e) = self.port.write_all(line.as_bytes()) {
            error!("open node serial write failed: {}", e);
            return None;
        }
        match self.answers.recv_timeout(REPLY_TIMEOUT) {
            Ok(answer) => Some(tokenize(&answer)),
            Err(_) => None,
        }
    }

    fn stop(&mut self) {
        self.stop.store(true, Ordering::SeqCst);
        if let Some(reader) = self.reader.take() {
            let _ = reader.join();
        }
    }
}

impl Drop for OpenNodeSerial {
    fn drop(&mut self) {
        OnSerial::stop(self);
    }
}

fn reader_thread(mut port: File, answer_tx: Sender<String>, stop: Arc<AtomicBool>) {
    let mut pending: Vec<u8> = Vec::new();
    let mut buf = [0u8; 256];
    while !stop.load(Ordering::SeqCst) {
        match port.read(&mut buf) {
            // Port read timeout, no data yet.
            Ok(0) => {}
            Ok(n) => {
                pending.extend_from_slice(&buf[..n]);
                while let Some(pos) = pending.iter().position(|b| *b == b'\n') {
                    let raw: Vec<u8> = pending.drain(..=pos).collect();
                    let line = String::from_utf8_lossy(&raw).trim().to_string();
                    if !line.is_empty() && answer_tx.send(line).is_err() {
                        return;
                    }
                }
            }
            Err(e) => {
                error!("open node serial read failed: {}", e);
                return;
            }
        }
        thread::sleep(POLL_PAUSE);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn start_fails_on_missing_tty() {
        assert!(OpenNodeSerial::start(Path::new("/nonexistent/tty"), 500000).is_err());
    }
}
