//! Board configuration loading.
//!
//! A config file describes every board the daemon knows about.  Each board
//! names exactly one control path (a console-server service or a set of GPIO
//! lines) and optionally a local serial console, an access list, a per-port
//! USB power path, and a chain of boot stages.
//!
//! ```toml
//! [[boards]]
//! board = "db410c-01"
//! name = "DragonBoard 410c #1"
//! console = "/dev/ttyUSB3"
//! users = ["alice", "bob"]
//!
//! [boards.gpio]
//! power = { line = 17 }
//! boot_key = { line = 22, active_low = true }
//!
//! [[boards.boot_stages]]
//! kind = "dfu"
//! ```

use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::Deserialize;
use thiserror::Error;
use tracing::debug;

use boardd_core::{BootStage, BootStageKind};

/// Paths tried in order when no config file is given explicitly.
const DEFAULT_PATHS: &[&str] = &["./boardd.toml", "/etc/boardd.toml"];

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("no config file found (tried {DEFAULT_PATHS:?})")]
    NotFound,

    #[error("failed to read {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse {path}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: toml::de::Error,
    },

    #[error("board {board:?}: {reason}")]
    Invalid { board: String, reason: String },
}

#[derive(Debug, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub boards: Vec<BoardConfig>,
}

#[derive(Debug, Deserialize)]
pub struct BoardConfig {
    /// Identifier clients select the board by.
    pub board: String,

    /// Human-readable label shown in board listings.
    #[serde(default)]
    pub name: Option<String>,

    #[serde(default)]
    pub description: Option<String>,

    /// Usernames allowed to select this board.  Absent means unrestricted.
    #[serde(default)]
    pub users: Option<Vec<String>>,

    /// Local serial console device.
    #[serde(default)]
    pub console: Option<String>,

    /// Console-server service name, mutually exclusive with `gpio`.
    #[serde(default)]
    pub conmux: Option<String>,

    #[serde(default)]
    pub gpio: Option<GpioConfig>,

    /// Keep VBUS asserted regardless of lifecycle state.
    #[serde(default)]
    pub usb_always_on: bool,

    /// How long the boot key is held past power-key release, in seconds.
    /// Absent means the board has no boot key to sequence.
    #[serde(default)]
    pub boot_key_timeout: Option<u64>,

    /// Per-port USB power path below `/sys/bus/usb/devices`.
    #[serde(default)]
    pub ppps_path: Option<String>,

    #[serde(default)]
    pub boot_stages: Vec<BootStageConfig>,
}

impl BoardConfig {
    pub fn boot_key_timeout(&self) -> Option<Duration> {
        self.boot_key_timeout.map(Duration::from_secs)
    }
}

#[derive(Debug, Deserialize)]
pub struct GpioConfig {
    #[serde(default)]
    pub power: Option<GpioLine>,
    #[serde(default)]
    pub boot_key: Option<GpioLine>,
    #[serde(default)]
    pub power_key: Option<GpioLine>,
    #[serde(default)]
    pub usb_disconnect: Option<GpioLine>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct GpioLine {
    pub line: u32,
    #[serde(default)]
    pub active_low: bool,
}

#[derive(Debug, Deserialize)]
pub struct BootStageConfig {
    pub kind: StageKind,
    /// Backend-specific options, e.g. the flash command template.
    #[serde(default)]
    pub options: String,
}

#[derive(Debug, Clone, Copy, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StageKind {
    Dfu,
    UsbLoad,
}

impl BootStageConfig {
    pub fn to_stage(&self) -> BootStage {
        let kind = match self.kind {
            StageKind::Dfu => BootStageKind::Dfu,
            StageKind::UsbLoad => BootStageKind::UsbLoad,
        };
        BootStage {
            kind,
            options: self.options.clone(),
        }
    }
}

/// Loads the config from `path`, or from the first default path that exists.
pub fn load(path: Option<&Path>) -> Result<Config, ConfigError> {
    let path = match path {
        Some(path) => path.to_path_buf(),
        None => DEFAULT_PATHS
            .iter()
            .map(PathBuf::from)
            .find(|p| p.exists())
            .ok_or(ConfigError::NotFound)?,
    };

    debug!("loading config from {}", path.display());

    let text = fs::read_to_string(&path).map_err(|source| ConfigError::Read {
        path: path.clone(),
        source,
    })?;
    let config: Config =
        toml::from_str(&text).map_err(|source| ConfigError::Parse { path, source })?;

    for board in &config.boards {
        validate(board)?;
    }

    Ok(config)
}

fn validate(board: &BoardConfig) -> Result<(), ConfigError> {
    let invalid = |reason: &str| ConfigError::Invalid {
        board: board.board.clone(),
        reason: reason.to_string(),
    };

    if board.board.is_empty() {
        return Err(invalid("board identifier must not be empty"));
    }
    if board.conmux.is_some() && board.gpio.is_some() {
        return Err(invalid("conmux and gpio control are mutually exclusive"));
    }
    if board.console.is_none() && board.conmux.is_none() && board.gpio.is_none() {
        return Err(invalid("needs a console, conmux, or gpio section"));
    }

    Ok(())
}
