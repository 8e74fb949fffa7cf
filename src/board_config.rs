// Copyright 2024 The SensorNet Testbed Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! Which board this gateway physically hosts.
//!
//! The board type is read once from the host configuration file and never
//! changes for the lifetime of the process. The raw token is kept as read so
//! that an unsupported board can still be reported by name; supported
//! boards map to [`BoardType`].

use std::ffi::CStr;
use std::fs;
use std::io;
use std::path::Path;
use std::path::PathBuf;

use control_node::BoardType;
use once_cell::sync::OnceCell;
use remain::sorted;
use thiserror::Error;

use crate::config;

#[sorted]
#[derive(Error, Debug)]
pub enum BoardConfigError {
    #[error("empty board_type file {0}")]
    Empty(PathBuf),
    #[error("failed to read {0}: {1}")]
    Read(PathBuf, io::Error),
}

#[derive(Clone, Debug)]
pub struct BoardConfig {
    board_type_token: String,
    hostname: String,
}

impl BoardConfig {
    /// Reads the board type from `<dir>/board_type`.
    pub fn read_from(dir: &Path) -> Result<BoardConfig, BoardConfigError> {
        let path = dir.join("board_type");
        let token = fs::read_to_string(&path)
            .map_err(|e| BoardConfigError::Read(path.clone(), e))?
            .trim()
            .to_lowercase();
        if token.is_empty() {
            return Err(BoardConfigError::Empty(path));
        }
        Ok(BoardConfig {
            board_type_token: token,
            hostname: hostname(),
        })
    }

    /// Explicit construction, for tests and tools.
    pub fn new(board_type_token: &str, hostname: &str) -> BoardConfig {
        BoardConfig {
            board_type_token: board_type_token.to_lowercase(),
            hostname: hostname.to_owned(),
        }
    }

    /// The raw token from the configuration file, lowercased.
    pub fn board_type_token(&self) -> &str {
        &self.board_type_token
    }

    /// The board type, when this gateway hosts a supported one.
    pub fn board_type(&self) -> Option<BoardType> {
        BoardType::from_token(&self.board_type_token)
    }

    /// Gateway host name, used as the measurement stream node id.
    pub fn hostname(&self) -> &str {
        &self.hostname
    }
}

static BOARD_CONFIG: OnceCell<BoardConfig> = OnceCell::new();

/// Loads the process-wide board config from the default location. Later
/// calls return the cached value.
pub fn init_global() -> Result<&'static BoardConfig, BoardConfigError> {
    BOARD_CONFIG.get_or_try_init(|| BoardConfig::read_from(Path::new(config::GATEWAY_CONFIG_DIR)))
}

fn hostname() -> String {
    let mut buf = [0u8; 256];
    // SAFETY: the buffer outlives the call and gethostname null-terminates
    // within its bounds on success.
    let ret = unsafe { libc::gethostname(buf.as_mut_ptr() as *mut libc::c_char, buf.len() - 1) };
    if ret != 0 {
        return String::from("unknown-gateway");
    }
    CStr::from_bytes_until_nul(&buf)
        .map(|s| s.to_string_lossy().into_owned())
        .unwrap_or_else(|_| String::from("unknown-gateway"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn reads_and_normalizes_token() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(dir.path().join("board_type"), "M3\n").unwrap();
        let board = BoardConfig::read_from(dir.path()).unwrap();
        assert_eq!(board.board_type_token(), "m3");
        assert_eq!(board.board_type(), Some(BoardType::M3));
    }

    #[test]
    fn unsupported_token_is_kept() {
        let board = BoardConfig::new("leonardo", "gw-1");
        assert_eq!(board.board_type_token(), "leonardo");
        assert_eq!(board.board_type(), None);
    }

    #[test]
    fn missing_file_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        assert!(matches!(
            BoardConfig::read_from(dir.path()),
            Err(BoardConfigError::Read(_, _))
        ));
    }

    #[test]
    fn empty_file_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(dir.path().join("board_type"), "\n").unwrap();
        assert!(matches!(
            BoardConfig::read_from(dir.path()),
            Err(BoardConfigError::Empty(_))
        ));
    }

    #[test]
    fn hostname_is_nonempty() {
        assert!(!hostname().is_empty());
    }
}
