// Copyright 2024 The SensorNet Testbed Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! TCP redirection of the open-node UART.
//!
//! An external `socat` relay bridges the UART and a single TCP client on
//! port 20000. The relay exits whenever its client disconnects or the TTY
//! hiccups, so the worker respawns it until `stop` is requested, backing off
//! half a second after an error exit.

use std::process::Command;
use std::process::Stdio;
use std::sync::atomic::AtomicBool;
use std::sync::atomic::AtomicI32;
use std::sync::atomic::AtomicUsize;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::thread;
use std::thread::JoinHandle;
use std::time::Duration;

use base::process::exit_code;
use log::error;
use log::info;

/// TCP port the open-node UART is exposed on.
pub const TCP_PORT: u16 = 20000;

const RESTART_BACKOFF: Duration = Duration::from_millis(500);

struct Shared {
    run: AtomicBool,
    child_pid: AtomicI32,
    restarts: AtomicUsize,
}

pub struct SerialRedirection {
    argv: Vec<String>,
    shared: Arc<Shared>,
    worker: Option<JoinHandle<()>>,
}

impl SerialRedirection {
    pub fn new(tty: &str, baudrate: u32) -> SerialRedirection {
        let argv = vec![
            "socat".to_owned(),
            "-d".to_owned(),
            format!("TCP4-LISTEN:{},reuseaddr", TCP_PORT),
            format!("open:{},b{},echo=0,raw", tty, baudrate),
        ];
        SerialRedirection::with_command(argv)
    }

    /// Runs an arbitrary relay command instead of socat. Test seam.
    fn with_command(argv: Vec<String>) -> SerialRedirection {
        SerialRedirection {
            argv,
            shared: Arc::new(Shared {
                run: AtomicBool::new(false),
                child_pid: AtomicI32::new(0),
                restarts: AtomicUsize::new(0),
            }),
            worker: None,
        }
    }

    pub fn start(&mut self) -> i32 {
        if self.worker.is_some() {
            error!("serial redirection already running");
            return 1;
        }
        self.shared.run.store(true, Ordering::SeqCst);
        self.shared.restarts.store(0, Ordering::SeqCst);
        let argv = self.argv.clone();
        let shared = self.shared.clone();
        let worker = thread::Builder::new()
            .name("serial-redirection".to_owned())
            .spawn(move || relay_loop(argv, shared))
            .expect("failed to spawn serial redirection thread");
        self.worker = Some(worker);
        0
    }

    pub fn stop(&mut self) -> i32 {
        self.shared.run.store(false, Ordering::SeqCst);
        let pid = self.shared.child_pid.load(Ordering::SeqCst);
        if pid != 0 {
            // SAFETY: pid belongs to a child the relay loop spawned and has
            // not reaped yet; a stale pid only yields ESRCH.
            unsafe {
                libc::kill(pid, libc::SIGTERM);
            }
        }
        if let Some(worker) = self.worker.take() {
            let _ = worker.join();
        }
        0
    }

    pub fn running(&self) -> bool {
        self.worker.is_some()
    }
}

impl Drop for SerialRedirection {
    fn drop(&mut self) {
        self.stop();
    }
}

fn relay_loop(argv: Vec<String>, shared: Arc<Shared>) {
    let mut first = true;
    while shared.run.load(Ordering::SeqCst) {
        if !first {
            shared.restarts.fetch_add(1, Ordering::SeqCst);
        }
        first = false;

        let mut child = match Command::new(&argv[0])
            .args(&argv[1..])
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .spawn()
        {
            Ok(child) => child,
            Err(e) => {
                error!("serial redirection spawn failed: {}", e);
                if shared.run.load(Ordering::SeqCst) {
                    thread::sleep(RESTART_BACKOFF);
                }
                continue;
            }
        };
        shared.child_pid.store(child.id() as i32, Ordering::SeqCst);

        let code = match child.wait() {
            Ok(status) => exit_code(&status),
            Err(e) => {
                error!("serial redirection wait failed: {}", e);
                255
            }
        };
        shared.child_pid.store(0, Ordering::SeqCst);

        if !shared.run.load(Ordering::SeqCst) {
            break;
        }
        info!("serial redirection relay exited with {}, restarting", code);
        if code != 0 {
            thread::sleep(RESTART_BACKOFF);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fake(cmd: &[&str]) -> SerialRedirection {
        SerialRedirection::with_command(cmd.iter().map(|s| s.to_string()).collect())
    }

    #[test]
    fn multiple_start_stop_cycles() {
        let mut redirection = fake(&["sleep", "30"]);
        for _ in 0..3 {
            assert_eq!(redirection.start(), 0);
            assert!(redirection.running());
            assert_eq!(redirection.stop(), 0);
            assert!(!redirection.running());
        }
    }

    #[test]
    fn stop_without_start() {
        let mut redirection = fake(&["sleep", "30"]);
        assert_eq!(redirection.stop(), 0);
        assert_eq!(redirection.stop(), 0);
    }

    #[test]
    fn double_start_is_an_error() {
        let mut redirection = fake(&["sleep", "30"]);
        assert_eq!(redirection.start(), 0);
        assert_eq!(redirection.start(), 1);
        redirection.stop();
    }

    #[test]
    fn restarts_child_that_keeps_dying() {
        let mut redirection = fake(&["sh", "-c", "exit 1"]);
        assert_eq!(redirection.start(), 0);
        thread::sleep(Duration::from_millis(1500));
        assert!(redirection.shared.restarts.load(Ordering::SeqCst) >= 1);
        redirection.stop();
    }

    #[test]
    fn stop_while_child_already_gone() {
        // The relay died and the worker sits in its back-off; stop must
        // still succeed.
        let mut redirection = fake(&["sh", "-c", "exit 1"]);
        assert_eq!(redirection.start(), 0);
        thread::sleep(Duration::from_millis(100));
        assert_eq!(redirection.stop(), 0);
    }
}
