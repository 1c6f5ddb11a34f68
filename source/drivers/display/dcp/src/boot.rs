// Copyright 2024 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! Bootstrap sequence run from the D116 callback.
//!
//! Each step is one host call. Its ack advances the sequence; once the last
//! step is acked the original callback is acked.

use crate::context::ContextId;
use crate::methods::{self, Method};

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum BootStep {
    #[default]
    Idle,
    CreateDfb,
    StartSignal,
    SetupVideoLimits,
    FlushSupportsPower,
    Done,
}

impl BootStep {
    pub const fn advance(self) -> Self {
        match self {
            Self::Idle => Self::CreateDfb,
            Self::CreateDfb => Self::StartSignal,
            Self::StartSignal => Self::SetupVideoLimits,
            Self::SetupVideoLimits => Self::FlushSupportsPower,
            Self::FlushSupportsPower | Self::Done => Self::Done,
        }
    }

    /// Call issued on entering this step.
    pub const fn method(self) -> Option<Method> {
        match self {
            Self::CreateDfb => Some(Method::SetCreateDfb),
            Self::StartSignal => Some(Method::StartSignal),
            Self::SetupVideoLimits => Some(Method::SetupVideoLimits),
            Self::FlushSupportsPower => Some(Method::FlushSupportsPower),
            Self::Idle | Self::Done => None,
        }
    }

    pub fn input(self) -> Vec<u8> {
        match self {
            Self::FlushSupportsPower => methods::flush_supports_power(true).to_vec(),
            _ => Vec::new(),
        }
    }
}

/// Progress of a running bootstrap.
#[derive(Debug, Default)]
pub struct BootSequence {
    pub step: BootStep,
    /// Context of the D116 callback awaiting its ack.
    pub pending: Option<ContextId>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn steps_run_in_order() {
        let tags: Vec<_> = core::iter::successors(Some(BootStep::Idle.advance()), |s| {
            Some(s.advance()).filter(|next| next != s)
        })
        .map(|step| step.method().map(|m| m.tag().to_string()))
        .collect();
        assert_eq!(
            tags,
            vec![
                Some("A357".to_string()),
                Some("A401".to_string()),
                Some("A029".to_string()),
                Some("A462".to_string()),
                None,
            ]
        );
    }

    #[test]
    fn done_is_terminal() {
        assert_eq!(BootStep::Done.advance(), BootStep::Done);
        assert_eq!(BootStep::Done.method(), None);
        assert_eq!(BootStep::FlushSupportsPower.input(), vec![1, 0, 0, 0]);
        assert!(BootStep::StartSignal.input().is_empty());
    }
}
