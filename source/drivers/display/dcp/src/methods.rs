// Copyright 2024 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! Host-initiated DCP methods used by the driver.

use crate::wire::Tag;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Method {
    SetupVideoLimits,
    SetCreateDfb,
    StartSignal,
    FlushSupportsPower,
}

impl Method {
    pub const fn tag(self) -> Tag {
        match self {
            Self::SetupVideoLimits => Tag::new(b"A029"),
            Self::SetCreateDfb => Tag::new(b"A357"),
            Self::StartSignal => Tag::new(b"A401"),
            Self::FlushSupportsPower => Tag::new(b"A462"),
        }
    }

    /// Bytes the coprocessor writes back.
    pub const fn out_len(self) -> u32 {
        match self {
            Self::SetupVideoLimits | Self::SetCreateDfb => 0,
            Self::StartSignal | Self::FlushSupportsPower => 4,
        }
    }
}

/// Input of flush-supports-power.
pub fn flush_supports_power(supported: bool) -> [u8; 4] {
    u32::from(supported).to_le_bytes()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tags() {
        assert_eq!(Method::StartSignal.tag(), Tag::new(b"A401"));
        assert_eq!(Method::FlushSupportsPower.out_len(), 4);
        assert_eq!(flush_supports_power(true), [1, 0, 0, 0]);
    }
}
