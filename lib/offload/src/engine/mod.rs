// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

// Copyright 2025 Oxide Computer Company

//! The offload engine coordinator.
pub mod accel;
pub mod classify;
pub mod conn;
pub mod iface;
pub mod policy;
pub mod rule;
pub mod session;

use conn::Serial;
use rule::CreateRule;
use rule::DestroyRule;
use rule::RuleTuple;
use std::string::String;

/// A command could not be handed to the engine.
#[derive(Clone, Debug, Eq, PartialEq, thiserror::Error)]
pub enum TxError {
    #[error("engine channel full")]
    ChannelFull,

    #[error("engine channel closed")]
    Closed,

    #[error("{0}")]
    Other(String),
}

/// The channel to a hardware acceleration engine.
///
/// Both methods only queue a command. The engine answers each queued
/// command at most once, later and from its own context, through
/// [`session::OffloadMgr::create_resp`] or
/// [`session::OffloadMgr::destroy_resp`], quoting the serial it was
/// given. Nothing assumes an answer ever arrives.
pub trait AccelEngine: Send + Sync {
    fn tx_create(&self, serial: Serial, rule: &CreateRule)
    -> Result<(), TxError>;

    fn tx_destroy(
        &self,
        serial: Serial,
        rule: &DestroyRule,
    ) -> Result<(), TxError>;
}

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum AeStatus {
    Ack,
    /// Rejected, with the engine's error code.
    Nack(u32),
}

impl AeStatus {
    pub fn is_ack(&self) -> bool {
        matches!(self, Self::Ack)
    }
}

/// An engine's answer to a create or destroy command.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct AeResponse {
    pub serial: Serial,
    pub status: AeStatus,
    /// The tuple of the rule being answered, as echoed by the engine.
    pub tuple: RuleTuple,
}
