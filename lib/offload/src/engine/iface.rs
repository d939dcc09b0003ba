// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

// Copyright 2025 Oxide Computer Company

//! Interface hierarchies.
//!
//! For each direction of a flow, the directory records the stack of
//! logical devices a packet crosses, outermost (the physical port)
//! first and innermost last. The rule builder folds over these to
//! fill in the layer-2 parts of an engine rule.
use crate::api::MacAddr;
use core::fmt;
use core::fmt::Display;
use std::net::IpAddr;
use std::string::String;
use std::sync::Arc;

/// The deepest interface stack recorded for one direction.
pub const IFACE_HIERARCHY_MAX: usize = 10;

/// The engine interface number reserved for IPsec tunnel traffic.
pub const IPSEC_IF_NUM: i32 = 8;

/// One direction's interface stack, outermost first.
pub type IfaceList = heapless::Vec<Arc<Iface>, IFACE_HIERARCHY_MAX>;

#[derive(Clone, Copy, Debug, Eq, Hash, Ord, PartialEq, PartialOrd)]
pub enum IfaceKind {
    Ethernet,
    Bridge,
    Vlan,
    Pppoe,
    IpsecTunnel,
    Pptp,
    Other,
}

impl IfaceKind {
    pub const COUNT: usize = 7;

    /// How many interfaces of this kind may appear in one direction's
    /// stack, or `None` if extra occurrences are simply ignored.
    pub const fn max_per_direction(&self) -> Option<u8> {
        match self {
            Self::Bridge | Self::Pppoe | Self::IpsecTunnel | Self::Pptp => {
                Some(1)
            }
            // Primary plus one QinQ tag.
            Self::Vlan => Some(2),
            Self::Ethernet | Self::Other => None,
        }
    }
}

impl Display for IfaceKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Ethernet => "ethernet",
            Self::Bridge => "bridge",
            Self::Vlan => "vlan",
            Self::Pppoe => "pppoe",
            Self::IpsecTunnel => "ipsec",
            Self::Pptp => "pptp",
            Self::Other => "other",
        };
        write!(f, "{s}")
    }
}

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct VlanInfo {
    /// The 12-bit VLAN identifier.
    pub vid: u16,
    pub tpid: u16,
    /// The VLAN device's own address, usually inherited from the
    /// device beneath it.
    pub mac: MacAddr,
}

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct PppoeInfo {
    pub session_id: u16,
    pub peer_mac: MacAddr,
}

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct PptpInfo {
    pub src_call: u16,
    pub dst_call: u16,
}

/// What a device is, along with the data the rule needs from it.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum IfaceInfo {
    Ethernet { mac: MacAddr },
    Bridge { mac: MacAddr },
    Vlan(VlanInfo),
    Pppoe(PppoeInfo),
    IpsecTunnel,
    Pptp(PptpInfo),
    Other,
}

impl IfaceInfo {
    pub fn kind(&self) -> IfaceKind {
        match self {
            Self::Ethernet { .. } => IfaceKind::Ethernet,
            Self::Bridge { .. } => IfaceKind::Bridge,
            Self::Vlan(_) => IfaceKind::Vlan,
            Self::Pppoe(_) => IfaceKind::Pppoe,
            Self::IpsecTunnel => IfaceKind::IpsecTunnel,
            Self::Pptp(_) => IfaceKind::Pptp,
            Self::Other => IfaceKind::Other,
        }
    }
}

/// A logical network device.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct Iface {
    pub name: String,
    pub ifindex: u32,
    /// The number the acceleration engine knows this device by, if it
    /// knows it at all.
    pub ae_ifnum: Option<i32>,
    pub mtu: u32,
    pub info: IfaceInfo,
}

impl Display for Iface {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}({})", self.name, self.info.kind())
    }
}

/// The four interface stacks of a flow.
#[derive(Clone, Debug, Default)]
pub struct IfaceLists {
    pub from: IfaceList,
    pub to: IfaceList,
    pub from_nat: IfaceList,
    pub to_nat: IfaceList,
}

/// Queries the rule builder makes of the host's network devices.
pub trait NetDevices: Send + Sync {
    /// The 3-bit 802.1p priority the VLAN device `ifindex` maps
    /// `qos_tag` to on egress.
    fn vlan_egress_prio(&self, _ifindex: u32, _qos_tag: u32) -> u8 {
        0
    }

    /// The MTU of the device owning the local address `addr`.
    fn mtu_by_local_addr(&self, _addr: IpAddr) -> Option<u32> {
        None
    }
}

/// A host with no VLAN priority maps and no address lookups.
#[derive(Clone, Copy, Debug, Default)]
pub struct NoDevices;

impl NetDevices for NoDevices {}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn cardinality() {
        assert_eq!(IfaceKind::Vlan.max_per_direction(), Some(2));
        assert_eq!(IfaceKind::Bridge.max_per_direction(), Some(1));
        assert_eq!(IfaceKind::Ethernet.max_per_direction(), None);
        let info = IfaceInfo::Pptp(PptpInfo { src_call: 1, dst_call: 2 });
        assert_eq!(info.kind(), IfaceKind::Pptp);
    }
}
