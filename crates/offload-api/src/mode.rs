// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

// Copyright 2025 Oxide Computer Company

use alloc::string::String;
use core::fmt;
use core::fmt::Display;
use core::str::FromStr;
use serde::Deserialize;
use serde::Serialize;

/// The acceleration mode of a single flow.
///
/// ```text
///                     accelerate()
///        +-------+ ------------------> +--------------+
///        | Decel |                     | AccelPending |
///        +-------+ <------------------ +--------------+
///          ^   ^     nack (< limit)      |          |
///          |   |     tx fail (< limit)   | ack      | nack (>= limit)
///          |   |                         v          v
///          |   |   cessation       +-------+   FailAccelEngine
///          |   +------------------ | Accel |
///          |                       +-------+
///          |                         |   ^
///          |             decelerate()|   | tx fail (< limit)
///          |                         v   |
///          |        ack         +--------------+   nack
///          +------------------- | DecelPending | --------> FailDecel
///                               +--------------+
/// ```
///
/// Every `Fail*` mode, as well as `Denied`, is terminal: the flow
/// continues to be forwarded by software and no further acceleration
/// is attempted. A flow marked defunct ends in `FailDefunct` no matter
/// which response resolves it.
#[derive(
    Clone, Copy, Debug, Default, Deserialize, Eq, Hash, PartialEq, Serialize,
)]
pub enum AccelMode {
    /// Not accelerated; the flow may be accelerated.
    #[default]
    Decel,
    /// A create rule was handed to the engine and is awaiting a
    /// response.
    AccelPending,
    /// The engine has installed the rule.
    Accel,
    /// A destroy rule was handed to the engine and is awaiting a
    /// response.
    DecelPending,
    /// The rule could not be built from the flow's topology.
    FailRule,
    /// The engine's transmit channel refused too many commands.
    FailDriver,
    /// The engine rejected too many create rules.
    FailAccelEngine,
    /// The engine repeatedly ceased acceleration without the flow
    /// showing any activity.
    FailNoAction,
    /// The engine rejected a destroy rule.
    FailDecel,
    /// The flow was marked defunct.
    FailDefunct,
    /// The flow was never eligible for acceleration.
    Denied,
}

impl AccelMode {
    /// Is this a terminal failure (or denial) mode?
    pub fn is_fail(&self) -> bool {
        matches!(
            self,
            Self::FailRule
                | Self::FailDriver
                | Self::FailAccelEngine
                | Self::FailNoAction
                | Self::FailDecel
                | Self::FailDefunct
                | Self::Denied
        )
    }

    /// Does the engine (possibly) hold a rule for the flow in this
    /// mode?
    pub fn is_offloaded(&self) -> bool {
        matches!(self, Self::Accel | Self::DecelPending)
    }
}

impl Display for AccelMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Decel => "DECEL",
            Self::AccelPending => "ACCEL_PENDING",
            Self::Accel => "ACCEL",
            Self::DecelPending => "DECEL_PENDING",
            Self::FailRule => "FAIL_RULE",
            Self::FailDriver => "FAIL_DRIVER",
            Self::FailAccelEngine => "FAIL_ACCEL_ENGINE",
            Self::FailNoAction => "FAIL_NO_ACTION",
            Self::FailDecel => "FAIL_DECEL",
            Self::FailDefunct => "FAIL_DEFUNCT",
            Self::Denied => "DENIED",
        };
        write!(f, "{s}")
    }
}

impl FromStr for AccelMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_uppercase().as_str() {
            "DECEL" => Ok(Self::Decel),
            "ACCEL_PENDING" => Ok(Self::AccelPending),
            "ACCEL" => Ok(Self::Accel),
            "DECEL_PENDING" => Ok(Self::DecelPending),
            "FAIL_RULE" => Ok(Self::FailRule),
            "FAIL_DRIVER" => Ok(Self::FailDriver),
            "FAIL_ACCEL_ENGINE" => Ok(Self::FailAccelEngine),
            "FAIL_NO_ACTION" => Ok(Self::FailNoAction),
            "FAIL_DECEL" => Ok(Self::FailDecel),
            "FAIL_DEFUNCT" => Ok(Self::FailDefunct),
            "DENIED" => Ok(Self::Denied),
            _ => Err(format!("invalid accel mode: {s}")),
        }
    }
}
