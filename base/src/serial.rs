// Copyright 2024 The SensorNet Testbed Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! Raw serial-port setup through termios.

use std::fs::File;
use std::fs::OpenOptions;
use std::io;
use std::os::unix::fs::OpenOptionsExt;
use std::os::unix::io::AsRawFd;
use std::path::Path;
use std::path::PathBuf;

use remain::sorted;
use thiserror::Error;

#[sorted]
#[derive(Error, Debug)]
pub enum SerialError {
    #[error("failed to open {0}: {1}")]
    Open(PathBuf, io::Error),
    #[error("termios setup failed: {0}")]
    Termios(io::Error),
    #[error("unsupported baud rate {0}")]
    UnsupportedBaud(u32),
}

fn baud_to_speed(baud: u32) -> Result<libc::speed_t, SerialError> {
    Ok(match baud {
        9600 => libc::B9600,
        19200 => libc::B19200,
        38400 => libc::B38400,
        57600 => libc::B57600,
        115200 => libc::B115200,
        230400 => libc::B230400,
        500000 => libc::B500000,
        921600 => libc::B921600,
        _ => return Err(SerialError::UnsupportedBaud(baud)),
    })
}

/// Opens `path` as a raw serial port at `baud`.
///
/// The port is configured with a 0.5 s read timeout (`VMIN=0`, `VTIME=5`) so
/// readers wake up periodically even when the node firmware stays silent,
/// and the input buffer is flushed so a fresh session does not see stale
/// bytes.
pub fn open_serial(path: &Path, baud: u32) -> Result<File, SerialError> {
    let speed = baud_to_speed(baud)?;
    let file = OpenOptions::new()
        .read(true)
        .write(true)
        .custom_flags(libc::O_NOCTTY)
        .open(path)
        .map_err(|e| SerialError::Open(path.to_owned(), e))?;
    let fd = file.as_raw_fd();

    // SAFETY: fd is owned by `file` and stays open for the whole block; the
    // termios struct is fully initialized by tcgetattr before use.
    unsafe {
        let mut termios: libc::termios = std::mem::zeroed();
        if libc::tcgetattr(fd, &mut termios) < 0 {
            return Err(SerialError::Termios(io::Error::last_os_error()));
        }
        libc::cfmakeraw(&mut termios);
        if libc::cfsetispeed(&mut termios, speed) < 0 || libc::cfsetospeed(&mut termios, speed) < 0
        {
            return Err(SerialError::Termios(io::Error::last_os_error()));
        }
        termios.c_cc[libc::VMIN] = 0;
        termios.c_cc[libc::VTIME] = 5;
        if libc::tcsetattr(fd, libc::TCSANOW, &termios) < 0 {
            return Err(SerialError::Termios(io::Error::last_os_error()));
        }
        if libc::tcflush(fd, libc::TCIFLUSH) < 0 {
            return Err(SerialError::Termios(io::Error::last_os_error()));
        }
    }

    Ok(file)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unsupported_baud_rejected() {
        assert!(matches!(
            baud_to_speed(12345),
            Err(SerialError::UnsupportedBaud(12345))
        ));
        assert!(baud_to_speed(500000).is_ok());
    }

    #[test]
    fn missing_device_reported() {
        assert!(matches!(
            open_serial(Path::new("/nonexistent/tty"), 115200),
            Err(SerialError::Open(_, _))
        ));
    }

    #[test]
    fn non_tty_reported() {
        // /dev/null opens but is not a terminal.
        assert!(matches!(
            open_serial(Path::new("/dev/null"), 115200),
            Err(SerialError::Termios(_))
        ));
    }
}
