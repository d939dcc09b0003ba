// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

// Copyright 2025 Oxide Computer Company

//! Engine rules and how they are built.
//!
//! A [`CreateRule`] tells the engine everything it needs to forward
//! both directions of a flow on its own: the addressing before and
//! after translation, the engine interfaces at each end, and whatever
//! layer-2 encapsulation (VLAN tags, PPPoE sessions, source MAC
//! rewrites) the packets must carry. Most of that comes from folding
//! over each direction's interface stack with [`walk()`]. A rule is
//! built fresh for every attempt and thrown away once it has been
//! handed to the engine.
use super::conn::Conn;
use super::conn::FlowTuple;
use super::conn::Side;
use super::iface::IPSEC_IF_NUM;
use super::iface::IfaceInfo;
use super::iface::IfaceKind;
use super::iface::IfaceList;
use super::iface::NetDevices;
use super::iface::PppoeInfo;
use super::iface::PptpInfo;
use super::iface::VlanInfo;
use super::policy::Verdict;
use crate::api::MacAddr;
use crate::api::OffloadCfg;
use crate::api::Protocol;
use bitflags::bitflags;
use std::net::IpAddr;
use std::string::String;

/// Bit position of the 802.1p priority within a VLAN tag.
pub const VLAN_PRIO_SHIFT: u32 = 13;

const VLAN_VID_MASK: u16 = 0x0FFF;
const VLAN_PRIO_MASK: u8 = 0x7;

bitflags! {
    /// How the engine forwards the flow.
    #[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
    pub struct RuleFlags: u16 {
        const ROUTED = 1 << 0;
        const BRIDGE_FLOW = 1 << 1;
        /// The flow's packets arrived encapsulated at layer 2.
        const L2_ENCAP = 1 << 2;
    }
}

bitflags! {
    /// Which optional parts of a [`CreateRule`] are populated.
    #[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
    pub struct ValidFlags: u16 {
        const CONN = 1 << 0;
        const FLOW_VLAN = 1 << 1;
        const RETURN_VLAN = 1 << 2;
        const FLOW_PPPOE = 1 << 3;
        const RETURN_PPPOE = 1 << 4;
        const FLOW_SRC_MAC = 1 << 5;
        const RETURN_SRC_MAC = 1 << 6;
        const QOS = 1 << 7;
        const DSCP_MARKING = 1 << 8;
    }
}

/// Why a rule could not be built.
#[derive(Clone, Debug, Eq, PartialEq, thiserror::Error)]
pub enum RuleError {
    #[error("protocol {0} cannot be offloaded")]
    UnsupportedProtocol(Protocol),

    #[error("no {0} interfaces")]
    NoIfaces(Side),

    #[error("{0} interface {1} is unknown to the engine")]
    NoAeIface(Side, String),

    #[error("too many {kind} interfaces on the {side} side")]
    TooMany { side: Side, kind: IfaceKind },

    #[error("topology changed during build (regen {start} -> {end})")]
    StaleTopology { start: u32, end: u32 },
}

impl RuleError {
    /// A transient error says nothing about the flow itself; a later
    /// attempt may well succeed.
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::StaleTopology { .. })
    }
}

/// The identity of a flow as the engine matches it.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct RuleTuple {
    pub proto: Protocol,
    pub flow_ip: IpAddr,
    pub flow_ident: u16,
    pub return_ip: IpAddr,
    pub return_ident: u16,
}

/// Forwarding data for the two directions of a flow.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct ConnRule {
    pub flow_ifnum: i32,
    pub return_ifnum: i32,
    pub flow_mtu: u32,
    pub return_mtu: u32,
    pub flow_ip_xlate: IpAddr,
    pub flow_ident_xlate: u16,
    pub return_ip_xlate: IpAddr,
    pub return_ident_xlate: u16,
    pub flow_mac: MacAddr,
    pub return_mac: MacAddr,
    pub dest_mac_xlate: MacAddr,
}

/// VLAN tags pushed on ingress (the flow direction) and egress (the
/// return direction).
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub struct VlanRule {
    pub ingress: Option<u32>,
    pub egress: Option<u32>,
}

#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub struct PppoeRule {
    pub flow: Option<PppoeInfo>,
    pub ret: Option<PppoeInfo>,
}

#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub struct SrcMacRule {
    pub flow: Option<MacAddr>,
    pub ret: Option<MacAddr>,
}

#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub struct QosRule {
    pub flow_qos_tag: u32,
    pub return_qos_tag: u32,
}

#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub struct DscpRule {
    pub flow_dscp: u8,
    pub return_dscp: u8,
}

/// The rule asking the engine to take over a flow.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct CreateRule {
    pub tuple: RuleTuple,
    pub conn: ConnRule,
    pub vlan_primary: VlanRule,
    pub vlan_secondary: VlanRule,
    pub pppoe: PppoeRule,
    pub src_mac: SrcMacRule,
    pub qos: QosRule,
    pub dscp: Option<DscpRule>,
    pub valid: ValidFlags,
    pub flags: RuleFlags,
}

/// The rule asking the engine to give a flow back.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct DestroyRule {
    pub tuple: RuleTuple,
}

/// What one direction's interface stack contributes to a rule.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub struct SideWalk {
    /// The engine interface the direction enters through.
    pub ifnum: i32,
    pub mtu: u32,
    /// The first usable MAC seen in the stack.
    pub mac: Option<MacAddr>,
    /// A MAC the engine must rewrite the source address to.
    pub src_mac: Option<MacAddr>,
    /// Primary and secondary (QinQ) tags.
    pub vlan: [Option<u32>; 2],
    pub pppoe: Option<PppoeInfo>,
    pub pptp: Option<PptpInfo>,
    counts: [u8; IfaceKind::COUNT],
}

fn vlan_tag(vlan: &VlanInfo, prio: u8) -> u32 {
    (u32::from(vlan.tpid) << 16)
        | (u32::from(prio & VLAN_PRIO_MASK) << VLAN_PRIO_SHIFT)
        | u32::from(vlan.vid & VLAN_VID_MASK)
}

/// Fold over one direction's interface stack, outermost first.
///
/// `qos_tag` selects the egress priority of any VLAN tags. The stack
/// is rejected if it is empty, if its outermost device is unknown to
/// the engine, or if it holds more devices of some kind than a rule
/// can describe.
pub fn walk(
    side: Side,
    list: &IfaceList,
    qos_tag: u32,
    devs: &dyn NetDevices,
) -> Result<SideWalk, RuleError> {
    let first = list.first().ok_or(RuleError::NoIfaces(side))?;
    let ifnum = first
        .ae_ifnum
        .filter(|n| *n >= 0)
        .ok_or_else(|| RuleError::NoAeIface(side, first.name.clone()))?;
    let mut w = SideWalk { ifnum, mtu: first.mtu, ..Default::default() };

    for iface in list {
        let kind = iface.info.kind();
        let seen = w.counts[kind as usize];
        if kind.max_per_direction().is_some_and(|max| seen >= max) {
            return Err(RuleError::TooMany { side, kind });
        }
        w.counts[kind as usize] = seen.saturating_add(1);

        match iface.info {
            IfaceInfo::Bridge { mac } => {
                if mac.is_valid_unicast() {
                    w.mac = Some(mac);
                    w.src_mac = Some(mac);
                }
            }

            // Further ethernet devices are artifacts of how the stack
            // was recorded; only the first one's MAC counts.
            IfaceInfo::Ethernet { mac } => {
                if w.mac.is_none() {
                    w.mac = Some(mac);
                }
            }

            IfaceInfo::Vlan(vlan) => {
                let prio = devs.vlan_egress_prio(iface.ifindex, qos_tag);
                w.vlan[usize::from(seen)] = Some(vlan_tag(&vlan, prio));
                if w.mac.is_none() && vlan.mac.is_valid_unicast() {
                    w.mac = Some(vlan.mac);
                    w.src_mac = Some(vlan.mac);
                }
            }

            IfaceInfo::Pppoe(info) => w.pppoe = Some(info),
            IfaceInfo::IpsecTunnel => w.ifnum = IPSEC_IF_NUM,
            IfaceInfo::Pptp(info) => w.pptp = Some(info),
            IfaceInfo::Other => {}
        }
    }

    Ok(w)
}

/// The engine tuple for `tuple`, with PPTP call ids standing in for
/// ports when the flow is a PPTP tunnel.
fn rule_tuple(tuple: &FlowTuple, pptp: Option<PptpInfo>) -> RuleTuple {
    let (flow_ident, return_ident) = match pptp {
        Some(p) => (p.src_call, p.dst_call),
        None => (tuple.from.port, tuple.to_nat.port),
    };

    RuleTuple {
        proto: tuple.proto,
        flow_ip: tuple.from.addr,
        flow_ident,
        return_ip: tuple.to_nat.addr,
        return_ident,
    }
}

pub struct RuleBuilder<'a> {
    cfg: &'a OffloadCfg,
    devs: &'a dyn NetDevices,
}

impl<'a> RuleBuilder<'a> {
    pub fn new(cfg: &'a OffloadCfg, devs: &'a dyn NetDevices) -> Self {
        Self { cfg, devs }
    }

    /// Build the rule accelerating `conn` as `verdict` describes.
    ///
    /// The flow's regeneration counter is sampled before the walk and
    /// again once the rule is complete. If the topology changed in
    /// between the rule describes a stack that no longer exists, and
    /// [`RuleError::StaleTopology`] is returned instead.
    pub fn build_create(
        &self,
        conn: &Conn,
        verdict: &Verdict,
        is_l2_encap: bool,
    ) -> Result<CreateRule, RuleError> {
        let regen_start = conn.regen_occurrences();
        let tuple = conn.tuple();

        if !self.cfg.supports(tuple.proto) {
            return Err(RuleError::UnsupportedProtocol(tuple.proto));
        }

        let (from, to) = {
            let ifaces = conn.ifaces();
            let from = walk(
                Side::From,
                &ifaces.from,
                verdict.return_qos_tag,
                self.devs,
            )?;
            let to =
                walk(Side::To, &ifaces.to, verdict.flow_qos_tag, self.devs)?;
            (from, to)
        };

        let pptp = from.pptp.or(to.pptp);
        let flow_mtu = match from.pptp {
            // The MTU of the PPTP pseudo-device is meaningless; use the
            // device carrying the tunnel.
            Some(_) => self
                .devs
                .mtu_by_local_addr(tuple.from.addr)
                .unwrap_or(from.mtu),
            None => from.mtu,
        };

        let (flow_ident_xlate, return_ident_xlate) = match pptp {
            Some(p) => (p.src_call, p.dst_call),
            None => (tuple.from_nat.port, tuple.to.port),
        };

        let nodes = conn.nodes();
        let mut return_mac = nodes.to_nat;
        let dest_mac_xlate =
            if conn.is_routed() { nodes.to } else { return_mac };
        if conn.direction().is_nat() {
            return_mac = dest_mac_xlate;
        }

        let mut flags = RuleFlags::empty();
        if conn.is_routed() {
            flags |= RuleFlags::ROUTED;
        } else {
            flags |= RuleFlags::BRIDGE_FLOW;
            if is_l2_encap {
                flags |= RuleFlags::L2_ENCAP;
            }
        }

        let mut valid = ValidFlags::CONN | ValidFlags::QOS;
        valid.set(ValidFlags::FLOW_VLAN, from.vlan[0].is_some());
        valid.set(ValidFlags::RETURN_VLAN, to.vlan[0].is_some());
        valid.set(ValidFlags::FLOW_PPPOE, from.pppoe.is_some());
        valid.set(ValidFlags::RETURN_PPPOE, to.pppoe.is_some());
        valid.set(ValidFlags::FLOW_SRC_MAC, from.src_mac.is_some());
        valid.set(ValidFlags::RETURN_SRC_MAC, to.src_mac.is_some());
        valid.set(ValidFlags::DSCP_MARKING, verdict.dscp.is_some());

        let mut rule = CreateRule {
            tuple: rule_tuple(tuple, pptp),
            conn: ConnRule {
                flow_ifnum: from.ifnum,
                return_ifnum: to.ifnum,
                flow_mtu,
                return_mtu: to.mtu,
                flow_ip_xlate: tuple.from_nat.addr,
                flow_ident_xlate,
                return_ip_xlate: tuple.to.addr,
                return_ident_xlate,
                flow_mac: nodes.from,
                return_mac,
                dest_mac_xlate,
            },
            vlan_primary: VlanRule { ingress: from.vlan[0], egress: to.vlan[0] },
            vlan_secondary: VlanRule {
                ingress: from.vlan[1],
                egress: to.vlan[1],
            },
            pppoe: PppoeRule { flow: from.pppoe, ret: to.pppoe },
            src_mac: SrcMacRule { flow: from.src_mac, ret: to.src_mac },
            qos: QosRule {
                flow_qos_tag: verdict.flow_qos_tag,
                return_qos_tag: verdict.return_qos_tag,
            },
            dscp: verdict.dscp.map(|(flow_dscp, return_dscp)| DscpRule {
                flow_dscp,
                return_dscp,
            }),
            valid,
            flags,
        };

        for c in conn.classifiers() {
            c.sync_to_rule(conn, &mut rule);
        }

        let regen_end = conn.regen_occurrences();
        if regen_end != regen_start {
            return Err(RuleError::StaleTopology {
                start: regen_start,
                end: regen_end,
            });
        }

        Ok(rule)
    }

    /// Build the rule withdrawing `conn` from the engine.
    pub fn build_destroy(&self, conn: &Conn) -> DestroyRule {
        let tuple = conn.tuple();
        let pptp =
            if tuple.proto == Protocol::GRE { conn.pptp() } else { None };
        DestroyRule { tuple: rule_tuple(tuple, pptp) }
    }
}
