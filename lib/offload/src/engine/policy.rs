// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

// Copyright 2025 Oxide Computer Company

//! Merge the verdicts of a flow's classifiers.
use super::classify::AccelPermit;
use super::classify::ClassifierKind;
use super::classify::Relevance;
use super::conn::Conn;
use super::conn::PacketCtx;
use super::conn::Side;
use crate::api::TimerGroup;
use crate::ddi::time::Moment;

/// The merged decision for one packet.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct Verdict {
    pub drop: bool,
    pub accel: bool,
    pub flow_qos_tag: u32,
    pub return_qos_tag: u32,
    pub timer_group: TimerGroup,
    /// `(flow, return)` DSCP remark values, when remarking is wanted
    /// and nobody denied it.
    pub dscp: Option<(u8, u8)>,
}

/// Run each classifier assigned to `conn`, in priority order, over
/// `pkt` and merge what they say.
///
/// * A classifier that declares itself irrelevant is unassigned from
///   the flow, unless it is the default classifier.
/// * An undecided classifier, or one that refuses acceleration,
///   withholds acceleration for this packet.
/// * Drop is sticky.
/// * Timer group and QoS tags are last-wins.
/// * A DSCP denial cancels DSCP remarking for this packet, including
///   requests from later classifiers.
///
/// If the merged timer group differs from the flow's, the flow's idle
/// timer is reset into the new group.
pub fn arbitrate(
    conn: &Conn,
    sender: Side,
    pkt: &PacketCtx,
    now: Moment,
) -> Verdict {
    let current_group = conn.timer_group();
    let mut v = Verdict {
        drop: false,
        accel: true,
        flow_qos_tag: pkt.priority,
        return_qos_tag: pkt.priority,
        timer_group: current_group,
        dscp: None,
    };
    let mut dscp_denied = false;

    for c in conn.classifiers() {
        let resp = c.process(conn, sender, pkt);

        match resp.relevance {
            Relevance::No => {
                if c.kind() != ClassifierKind::Default {
                    conn.unassign(c.kind());
                }
                continue;
            }

            Relevance::Maybe => v.accel = false,

            Relevance::Yes => {
                if resp.accel == AccelPermit::No {
                    v.accel = false;
                }
            }
        }

        v.drop |= resp.drop;

        if let Some(group) = resp.timer_group {
            v.timer_group = group;
        }

        if let Some((flow, ret)) = resp.qos_tags {
            v.flow_qos_tag = flow;
            v.return_qos_tag = ret;
        }

        if resp.dscp_deny {
            dscp_denied = true;
            v.dscp = None;
        }

        if let Some(dscp) = resp.dscp {
            if !dscp_denied {
                v.dscp = Some(dscp);
            }
        }
    }

    if v.timer_group != current_group {
        conn.reset_timer(v.timer_group, now);
    }

    v
}
