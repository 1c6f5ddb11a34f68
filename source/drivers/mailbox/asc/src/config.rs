// Copyright 2024 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! Mailbox configuration loaded from TOML.
//!
//! ```toml
//! compatible = "apple,t8103-smc-mailbox"
//! recv-queue-depth = 16
//!
//! [shmem-window]
//! base = 0x2_1000_0000
//! size = 0x4000
//! ```

use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use nexus_hal::MmioWindow;
use serde::Deserialize;
use thiserror::Error;

use crate::queue::RECV_QUEUE_DEPTH;
use crate::router::MAX_CHANNELS;

/// Default depth of the transmit backlog.
pub const TX_BACKLOG_DEPTH: usize = 20;
const DEFAULT_READY_TIMEOUT_MS: u64 = 1000;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read mailbox config {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to parse mailbox config: {0}")]
    Parse(#[from] toml::de::Error),
    #[error("unknown mailbox compatible {0:?}")]
    UnknownCompatible(String),
    #[error("I/O-mapped shared memory needs a shmem-window")]
    MissingShmemWindow,
    #[error("invalid mailbox config: {0}")]
    Invalid(&'static str),
}

/// How endpoint buffers are backed.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ShmemKind {
    None,
    CoherentDma,
    SartDma,
    IoMapped,
}

/// Per-compatible behaviour.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Variant {
    /// Speaks the RTKit management protocol.
    pub rtkit: bool,
    pub shmem: ShmemKind,
}

impl Variant {
    pub fn from_compatible(compatible: &str) -> Option<Self> {
        let (rtkit, shmem) = match compatible {
            "apple,t8103-ans-mailbox" => (true, ShmemKind::SartDma),
            "apple,t8103-smc-mailbox" => (true, ShmemKind::IoMapped),
            "apple,t8103-rtkit-mailbox" => (true, ShmemKind::CoherentDma),
            "apple,t8103-sepos-mailbox" => (false, ShmemKind::None),
            _ => return None,
        };
        Some(Self { rtkit, shmem })
    }
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "kebab-case", deny_unknown_fields)]
struct RawConfig {
    compatible: String,
    #[serde(default)]
    shmem_window: Option<RawWindow>,
    #[serde(default)]
    recv_queue_depth: Option<usize>,
    #[serde(default)]
    max_channels: Option<usize>,
    #[serde(default)]
    tx_backlog_depth: Option<usize>,
    #[serde(default)]
    ready_timeout_ms: Option<u64>,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct RawWindow {
    base: u64,
    size: u64,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct MailboxConfig {
    pub variant: Variant,
    pub shmem_window: Option<MmioWindow>,
    pub recv_queue_depth: usize,
    pub max_channels: usize,
    pub tx_backlog_depth: usize,
    pub ready_timeout: Duration,
}

impl MailboxConfig {
    /// Defaults for `compatible`; I/O-mapped variants still need a window.
    pub fn for_compatible(compatible: &str) -> Result<Self, ConfigError> {
        let variant = Variant::from_compatible(compatible)
            .ok_or_else(|| ConfigError::UnknownCompatible(compatible.to_string()))?;
        Ok(Self {
            variant,
            shmem_window: None,
            recv_queue_depth: RECV_QUEUE_DEPTH,
            max_channels: MAX_CHANNELS,
            tx_backlog_depth: TX_BACKLOG_DEPTH,
            ready_timeout: Duration::from_millis(DEFAULT_READY_TIMEOUT_MS),
        })
    }

    pub fn with_shmem_window(mut self, window: MmioWindow) -> Self {
        self.shmem_window = Some(window);
        self
    }

    pub fn from_toml_str(input: &str) -> Result<Self, ConfigError> {
        let raw: RawConfig = toml::from_str(input)?;
        let mut config = Self::for_compatible(&raw.compatible)?;
        config.shmem_window = raw.shmem_window.map(|w| MmioWindow::new(w.base, w.size));
        if let Some(depth) = raw.recv_queue_depth {
            config.recv_queue_depth = depth;
        }
        if let Some(max) = raw.max_channels {
            config.max_channels = max;
        }
        if let Some(depth) = raw.tx_backlog_depth {
            config.tx_backlog_depth = depth;
        }
        if let Some(ms) = raw.ready_timeout_ms {
            config.ready_timeout = Duration::from_millis(ms);
        }
        config.validate()?;
        Ok(config)
    }

    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let input = fs::read_to_string(path)
            .map_err(|source| ConfigError::Read { path: path.to_path_buf(), source })?;
        Self::from_toml_str(&input)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.variant.shmem == ShmemKind::IoMapped && self.shmem_window.is_none() {
            return Err(ConfigError::MissingShmemWindow);
        }
        if self.recv_queue_depth == 0 {
            return Err(ConfigError::Invalid("recv-queue-depth must be non-zero"));
        }
        if self.max_channels == 0 || self.max_channels > 256 {
            return Err(ConfigError::Invalid("max-channels must be in 1..=256"));
        }
        if self.tx_backlog_depth == 0 {
            return Err(ConfigError::Invalid("tx-backlog-depth must be non-zero"));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn defaults_follow_compatible() {
        let config = MailboxConfig::from_toml_str("compatible = \"apple,t8103-ans-mailbox\"")
            .expect("config");
        assert_eq!(config.variant, Variant { rtkit: true, shmem: ShmemKind::SartDma });
        assert_eq!(config.recv_queue_depth, 16);
        assert_eq!(config.max_channels, 20);
        assert_eq!(config.ready_timeout, Duration::from_secs(1));
    }

    #[test]
    fn iomem_requires_window() {
        let err = MailboxConfig::from_toml_str("compatible = \"apple,t8103-smc-mailbox\"")
            .expect_err("window missing");
        assert!(matches!(err, ConfigError::MissingShmemWindow));

        let config = MailboxConfig::from_toml_str(
            "compatible = \"apple,t8103-smc-mailbox\"\n[shmem-window]\nbase = 0x1000\nsize = 0x4000\n",
        )
        .expect("config");
        assert_eq!(config.shmem_window, Some(MmioWindow::new(0x1000, 0x4000)));
    }

    #[test]
    fn rejects_unknown_and_invalid() {
        assert!(matches!(
            MailboxConfig::from_toml_str("compatible = \"acme,mailbox\""),
            Err(ConfigError::UnknownCompatible(_))
        ));
        assert!(matches!(
            MailboxConfig::from_toml_str("compatible = \"apple,t8103-rtkit-mailbox\"\nrecv-queue-depth = 0"),
            Err(ConfigError::Invalid(_))
        ));
        assert!(matches!(
            MailboxConfig::from_toml_str("compatible = \"apple,t8103-rtkit-mailbox\"\nbogus = 1"),
            Err(ConfigError::Parse(_))
        ));
    }

    #[test]
    fn loads_from_file() {
        let mut file = tempfile::NamedTempFile::new().expect("temp file");
        writeln!(file, "compatible = \"apple,t8103-sepos-mailbox\"\nready-timeout-ms = 50")
            .expect("write");
        let config = MailboxConfig::load(file.path()).expect("load");
        assert!(!config.variant.rtkit);
        assert_eq!(config.ready_timeout, Duration::from_millis(50));

        let missing = MailboxConfig::load(Path::new("/nonexistent/mailbox.toml"));
        assert!(matches!(missing, Err(ConfigError::Read { .. })));
    }
}
