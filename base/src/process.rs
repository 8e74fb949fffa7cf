// Copyright 2024 The SensorNet Testbed Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! Supervision of one external child process.
//!
//! A [`Supervisor`] owns at most one running child. The worker thread drains
//! the child's stderr line by line into an optional sink, reaps the child,
//! and reports terminations that were not requested through [`Supervisor::stop`]
//! to an optional exit callback.

use std::io;
use std::io::BufRead;
use std::io::BufReader;
use std::os::unix::process::ExitStatusExt;
use std::process::Child;
use std::process::ChildStdin;
use std::process::Command;
use std::process::ExitStatus;
use std::process::Stdio;
use std::sync::atomic::AtomicBool;
use std::sync::atomic::AtomicI32;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::thread;
use std::thread::JoinHandle;

use log::error;
use log::warn;
use remain::sorted;
use thiserror::Error;

/// Receives one stderr line at a time, trailing newline removed.
pub type LineSink = Box<dyn FnMut(&str) + Send>;

/// Receives the exit code of a child that terminated on its own.
pub type ExitCallback = Box<dyn FnOnce(i32) + Send>;

#[sorted]
#[derive(Error, Debug)]
pub enum ProcessError {
    #[error("supervisor already has a running child")]
    AlreadyRunning,
    #[error("empty command line")]
    EmptyCommand,
    #[error("failed to spawn {0}: {1}")]
    Spawn(String, io::Error),
}

/// Per-start wiring of the supervised child.
#[derive(Default)]
pub struct ChildConfig {
    /// Open a pipe to the child's stdin and hand it back from `start`.
    pub stdin: bool,
    /// Sink for the child's stderr lines. Without one, stderr goes to null.
    pub stderr_sink: Option<LineSink>,
    /// Invoked with the exit code when the child terminates without `stop`
    /// having been requested.
    pub on_exit: Option<ExitCallback>,
}

/// Maps an exit status to a single code, `128 + signal` for signaled
/// children.
pub fn exit_code(status: &ExitStatus) -> i32 {
    if let Some(code) = status.code() {
        code
    } else if let Some(signal) = status.signal() {
        if signal >= 128 {
            warn!("child exit: unexpected signal({:?})", signal);
            255
        } else {
            128 + signal
        }
    } else {
        255
    }
}

struct Shared {
    // 0 while no child is running.
    pid: AtomicI32,
    stop_requested: AtomicBool,
}

/// Owns the lifecycle of one supervised child command.
pub struct Supervisor {
    label: String,
    shared: Arc<Shared>,
    worker: Option<JoinHandle<()>>,
}

impl Supervisor {
    pub fn new(label: &str) -> Supervisor {
        Supervisor {
            label: label.to_owned(),
            shared: Arc::new(Shared {
                pid: AtomicI32::new(0),
                stop_requested: AtomicBool::new(false),
            }),
            worker: None,
        }
    }

    /// Spawns `argv` and starts the worker thread.
    ///
    /// Returns the child's stdin pipe when `cfg.stdin` was set. A previous
    /// child must have been stopped (or have exited) first; pipes are always
    /// fresh for the new child.
    pub fn start(
        &mut self,
        argv: &[&str],
        cfg: ChildConfig,
    ) -> Result<Option<ChildStdin>, ProcessError> {
        let program = *argv.first().ok_or(ProcessError::EmptyCommand)?;
        if self.running() {
            return Err(ProcessError::AlreadyRunning);
        }
        // Reap a worker left over from a child that exited on its own.
        if let Some(worker) = self.worker.take() {
            let _ = worker.join();
        }

        let mut command = Command::new(program);
        command
            .args(&argv[1..])
            .stdin(if cfg.stdin {
                Stdio::piped()
            } else {
                Stdio::null()
            })
            .stdout(Stdio::null())
            .stderr(if cfg.stderr_sink.is_some() {
                Stdio::piped()
            } else {
                Stdio::null()
            });

        let mut child = command
            .spawn()
            .map_err(|e| ProcessError::Spawn(program.to_owned(), e))?;
        let stdin = child.stdin.take();

        self.shared.stop_requested.store(false, Ordering::SeqCst);
        self.shared.pid.store(child.id() as i32, Ordering::SeqCst);

        let shared = self.shared.clone();
        let label = self.label.clone();
        let worker = thread::Builder::new()
            .name(format!("{}-supervisor", self.label))
            .spawn(move || worker_thread(label, child, cfg, shared))
            .expect("failed to spawn supervisor thread");
        self.worker = Some(worker);

        Ok(stdin)
    }

    /// True while the child is alive.
    pub fn running(&self) -> bool {
        self.shared.pid.load(Ordering::SeqCst) != 0
    }

    /// Terminates the child if there is one and joins the worker.
    ///
    /// Idempotent; a child that is already gone is not an error.
    pub fn stop(&mut self) {
        self.shared.stop_requested.store(true, Ordering::SeqCst);
        let pid = self.shared.pid.load(Ordering::SeqCst);
        if pid != 0 {
            // SAFETY: sending SIGTERM to a pid we spawned and have not yet
            // reaped; an ESRCH for an already-exited child is ignored.
            unsafe {
                libc::kill(pid, libc::SIGTERM);
            }
        }
        if let Some(worker) = self.worker.take() {
            let _ = worker.join();
        }
    }
}

impl Drop for Supervisor {
    fn drop(&mut self) {
        self.stop();
    }
}

fn worker_thread(label: String, mut child: Child, cfg: ChildConfig, shared: Arc<Shared>) {
    let ChildConfig {
        stderr_sink,
        on_exit,
        ..
    } = cfg;

    if let Some(mut sink) = stderr_sink {
        // stderr was piped; drain it until EOF, which the child's exit
        // implies.
        let stderr = child.stderr.take().expect("stderr not piped");
        for line in BufReader::new(stderr).lines() {
            match line {
                Ok(line) => sink(&line),
                Err(e) => {
                    error!("{}: stderr read failed: {}", label, e);
                    break;
                }
            }
        }
    }

    let code = match child.wait() {
        Ok(status) => exit_code(&status),
        Err(e) => {
            error!("{}: wait failed: {}", label, e);
            255
        }
    };
    shared.pid.store(0, Ordering::SeqCst);

    if !shared.stop_requested.load(Ordering::SeqCst) {
        if let Some(on_exit) = on_exit {
            on_exit(code);
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::mpsc;
    use std::time::Duration;

    use super::*;

    #[test]
    fn exit_callback_fires_on_own_exit() {
        let (tx, rx) = mpsc::channel();
        let mut sup = Supervisor::new("test");
        sup.start(
            &["sh", "-c", "exit 3"],
            ChildConfig {
                on_exit: Some(Box::new(move |code| tx.send(code).unwrap())),
                ..Default::default()
            },
        )
        .unwrap();
        assert_eq!(rx.recv_timeout(Duration::from_secs(5)).unwrap(), 3);
        assert!(!sup.running());
    }

    #[test]
    fn stop_suppresses_exit_callback() {
        let (tx, rx) = mpsc::channel::<i32>();
        let mut sup = Supervisor::new("test");
        sup.start(
            &["sleep", "30"],
            ChildConfig {
                on_exit: Some(Box::new(move |code| {
                    let _ = tx.send(code);
                })),
                ..Default::default()
            },
        )
        .unwrap();
        assert!(sup.running());
        sup.stop();
        assert!(!sup.running());
        assert!(rx.recv_timeout(Duration::from_millis(200)).is_err());
    }

    #[test]
    fn stop_is_idempotent() {
        let mut sup = Supervisor::new("test");
        sup.stop();
        sup.start(&["true"], ChildConfig::default()).unwrap();
        sup.stop();
        sup.stop();
    }

    #[test]
    fn restart_gets_fresh_pipes() {
        let mut sup = Supervisor::new("test");
        for _ in 0..3 {
            let (tx, rx) = mpsc::channel();
            sup.start(
                &["sh", "-c", "echo ready >&2"],
                ChildConfig {
                    stderr_sink: Some(Box::new(move |line| {
                        let _ = tx.send(line.to_owned());
                    })),
                    ..Default::default()
                },
            )
            .unwrap();
            assert_eq!(rx.recv_timeout(Duration::from_secs(5)).unwrap(), "ready");
            sup.stop();
        }
    }

    #[test]
    fn stderr_lines_reach_sink_in_order() {
        let (tx, rx) = mpsc::channel();
        let mut sup = Supervisor::new("test");
        sup.start(
            &["sh", "-c", "echo one >&2; echo two >&2"],
            ChildConfig {
                stderr_sink: Some(Box::new(move |line| {
                    let _ = tx.send(line.to_owned());
                })),
                ..Default::default()
            },
        )
        .unwrap();
        assert_eq!(rx.recv_timeout(Duration::from_secs(5)).unwrap(), "one");
        assert_eq!(rx.recv_timeout(Duration::from_secs(5)).unwrap(), "two");
        sup.stop();
    }

    #[test]
    fn spawn_failure_is_reported() {
        let mut sup = Supervisor::new("test");
        match sup.start(&["/nonexistent/binary"], ChildConfig::default()) {
            Err(ProcessError::Spawn(program, _)) => {
                assert_eq!(program, "/nonexistent/binary")
            }
            other => panic!("unexpected: {:?}", other.map(|_| ())),
        }
    }
}
