// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

// Copyright 2025 Oxide Computer Company

use crate::AccelMode;
use serde::Deserialize;
use serde::Serialize;

/// A count, its running total, and the limit it is checked against.
#[derive(
    Clone, Copy, Debug, Default, Deserialize, Eq, PartialEq, Serialize,
)]
pub struct BoundedCount {
    pub count: u32,
    pub total: u64,
    pub limit: u32,
}

/// The externally visible state of one flow's acceleration.
#[derive(Clone, Debug, Deserialize, Eq, PartialEq, Serialize)]
pub struct FrontEndDump {
    pub serial: u64,
    pub can_accel: bool,
    pub mode: AccelMode,
    pub decelerate_pending: bool,
    pub flush_happened_total: u64,
    pub no_action_seen: BoundedCount,
    pub driver_fail: BoundedCount,
    pub ae_nack: BoundedCount,
}
