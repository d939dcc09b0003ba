// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

// Copyright 2025 Oxide Computer Company

use crate::Protocol;
use alloc::vec::Vec;
use serde::Deserialize;
use serde::Serialize;

pub const DEF_AE_NACK_LIMIT: u32 = 250;
pub const DEF_DRIVER_FAIL_LIMIT: u32 = 250;
pub const DEF_NO_ACTION_LIMIT: u32 = 250;

/// The retry bounds applied to each flow.
///
/// A flow copies these when it is created; changing them later only
/// affects flows created afterwards.
#[derive(Clone, Copy, Debug, Deserialize, Eq, PartialEq, Serialize)]
#[serde(default)]
pub struct AccelLimits {
    /// Consecutive create rejections before `FailAccelEngine`.
    pub ae_nack_limit: u32,
    /// Consecutive transmit failures before `FailDriver`.
    pub driver_fail_limit: u32,
    /// Consecutive idle cessations before `FailNoAction`.
    pub no_action_limit: u32,
}

impl Default for AccelLimits {
    fn default() -> Self {
        Self {
            ae_nack_limit: DEF_AE_NACK_LIMIT,
            driver_fail_limit: DEF_DRIVER_FAIL_LIMIT,
            no_action_limit: DEF_NO_ACTION_LIMIT,
        }
    }
}

/// Configuration of an offload session.
#[derive(Clone, Debug, Deserialize, Eq, PartialEq, Serialize)]
#[serde(default)]
pub struct OffloadCfg {
    pub limits: AccelLimits,
    /// Maximum number of flows offloaded at once, if any.
    pub accel_limit: Option<u32>,
    /// The protocols an engine rule can express.
    pub supported_protocols: Vec<Protocol>,
}

impl Default for OffloadCfg {
    fn default() -> Self {
        Self {
            limits: AccelLimits::default(),
            accel_limit: None,
            supported_protocols: vec![
                Protocol::TCP,
                Protocol::UDP,
                Protocol::IPV6,
                Protocol::GRE,
                Protocol::ESP,
            ],
        }
    }
}

impl OffloadCfg {
    pub fn supports(&self, proto: Protocol) -> bool {
        self.supported_protocols.contains(&proto)
    }
}
