// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

// Copyright 2025 Oxide Computer Company

//! The classifier contract.
//!
//! A classifier inspects a flow's packets and contributes to the
//! merged verdict computed in [`super::policy`]. Each flow carries its
//! own list of assigned classifiers, ordered by [`ClassifierKind`],
//! which is also their priority: later kinds override earlier ones
//! wherever the merge is last-wins.
use super::conn::Conn;
use super::conn::FlowTuple;
use super::conn::PacketCtx;
use super::conn::Side;
use super::rule::CreateRule;
use crate::api::Protocol;
use crate::api::TimerGroup;
use core::fmt;
use core::fmt::Display;
use std::sync::Arc;

/// The type of a classifier, in ascending priority order.
#[derive(Clone, Copy, Debug, Eq, Hash, Ord, PartialEq, PartialOrd)]
pub enum ClassifierKind {
    /// Assigned to every flow; can never be unassigned.
    Default,
    Dscp,
    Pcc,
    Nl,
    Hyfi,
}

impl Display for ClassifierKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Default => "default",
            Self::Dscp => "dscp",
            Self::Pcc => "pcc",
            Self::Nl => "nl",
            Self::Hyfi => "hyfi",
        };
        write!(f, "{s}")
    }
}

/// Whether a classifier has any interest in a flow.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub enum Relevance {
    /// Never again; the classifier is unassigned.
    No,
    /// Undecided. The flow may not be accelerated until it decides.
    Maybe,
    #[default]
    Yes,
}

/// A classifier's opinion on acceleration.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub enum AccelPermit {
    #[default]
    DontCare,
    No,
    Accel,
}

/// What a classifier wants done with a flow, as of one packet.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub struct ProcessResponse {
    pub relevance: Relevance,
    pub drop: bool,
    pub accel: AccelPermit,
    pub timer_group: Option<TimerGroup>,
    /// `(flow, return)` QoS tags.
    pub qos_tags: Option<(u32, u32)>,
    /// `(flow, return)` DSCP remark values.
    pub dscp: Option<(u8, u8)>,
    /// Forbid DSCP remarking for this packet, whatever any classifier
    /// asks for.
    pub dscp_deny: bool,
}

impl ProcessResponse {
    pub fn relevant() -> Self {
        Self::default()
    }

    pub fn irrelevant() -> Self {
        Self { relevance: Relevance::No, ..Self::default() }
    }

    pub fn undecided() -> Self {
        Self { relevance: Relevance::Maybe, ..Self::default() }
    }
}

pub trait Classifier: Send + Sync {
    fn kind(&self) -> ClassifierKind;

    /// Inspect a packet sent by `sender` on `conn`.
    fn process(
        &self,
        conn: &Conn,
        sender: Side,
        pkt: &PacketCtx,
    ) -> ProcessResponse;

    /// Contribute to an engine rule about to be sent for `conn`.
    fn sync_to_rule(&self, _conn: &Conn, _rule: &mut CreateRule) {}
}

/// Produces a classifier instance for each new flow.
pub trait ClassifierFactory: Send + Sync {
    fn kind(&self) -> ClassifierKind;

    /// The instance for a flow with addressing `tuple`, or `None` if
    /// this classifier has nothing to say about such flows.
    fn assign(&self, tuple: &FlowTuple) -> Option<Arc<dyn Classifier>>;
}

/// The classifier every flow has.
///
/// It always claims relevance and places the flow in a timer group
/// chosen by protocol.
#[derive(Clone, Copy, Debug)]
pub struct DefaultClassifier {
    timer_group: TimerGroup,
}

impl DefaultClassifier {
    pub fn new(proto: Protocol) -> Self {
        let timer_group = match proto {
            Protocol::TCP | Protocol::UDP => TimerGroup::Generic,
            Protocol::IPV6 | Protocol::GRE | Protocol::ESP => {
                TimerGroup::Tunnel
            }
            _ => TimerGroup::Short,
        };
        Self { timer_group }
    }

    pub fn timer_group(&self) -> TimerGroup {
        self.timer_group
    }
}

impl Classifier for DefaultClassifier {
    fn kind(&self) -> ClassifierKind {
        ClassifierKind::Default
    }

    fn process(
        &self,
        _conn: &Conn,
        _sender: Side,
        _pkt: &PacketCtx,
    ) -> ProcessResponse {
        ProcessResponse {
            timer_group: Some(self.timer_group),
            ..ProcessResponse::relevant()
        }
    }
}
