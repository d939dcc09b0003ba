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

/// An IP protocol number.
#[derive(
    Clone,
    Copy,
    Debug,
    Deserialize,
    Eq,
    Hash,
    Ord,
    PartialEq,
    PartialOrd,
    Serialize,
)]
pub struct Protocol(pub u8);

impl Protocol {
    pub const ICMP: Self = Self(1);
    pub const TCP: Self = Self(6);
    pub const UDP: Self = Self(17);
    pub const IPV6: Self = Self(41);
    pub const GRE: Self = Self(47);
    pub const ESP: Self = Self(50);

    /// Does this protocol identify flows by transport ports?
    pub fn is_ported(&self) -> bool {
        matches!(*self, Self::TCP | Self::UDP)
    }
}

impl Display for Protocol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match *self {
            Self::ICMP => write!(f, "ICMP"),
            Self::TCP => write!(f, "TCP"),
            Self::UDP => write!(f, "UDP"),
            Self::IPV6 => write!(f, "IPv6"),
            Self::GRE => write!(f, "GRE"),
            Self::ESP => write!(f, "ESP"),
            Self(n) => write!(f, "{n}"),
        }
    }
}

impl FromStr for Protocol {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "icmp" => Ok(Self::ICMP),
            "tcp" => Ok(Self::TCP),
            "udp" => Ok(Self::UDP),
            "ipv6" => Ok(Self::IPV6),
            "gre" => Ok(Self::GRE),
            "esp" => Ok(Self::ESP),
            n => n
                .parse::<u8>()
                .map(Self)
                .map_err(|_| format!("invalid protocol: {s}")),
        }
    }
}

/// How a flow crosses the forwarding path with respect to address
/// translation.
#[derive(
    Clone, Copy, Debug, Default, Deserialize, Eq, PartialEq, Serialize,
)]
pub enum FlowDirection {
    /// Routed without translation.
    #[default]
    NonNat,
    /// Destination translated on the way in.
    IngressNat,
    /// Source translated on the way out.
    EgressNat,
    /// Switched between two ports of a bridge.
    Bridged,
}

impl FlowDirection {
    pub fn is_nat(&self) -> bool {
        matches!(self, Self::IngressNat | Self::EgressNat)
    }
}

impl Display for FlowDirection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::NonNat => "NON_NAT",
            Self::IngressNat => "INGRESS_NAT",
            Self::EgressNat => "EGRESS_NAT",
            Self::Bridged => "BRIDGED",
        };
        write!(f, "{s}")
    }
}

/// The bucket that decides how long an idle flow is kept before it is
/// reaped.
#[derive(
    Clone, Copy, Debug, Default, Deserialize, Eq, PartialEq, Serialize,
)]
pub enum TimerGroup {
    /// Flows still being classified.
    #[default]
    Classifying,
    /// Short-lived flows.
    Short,
    /// The common case.
    Generic,
    /// Long-lived tunnels.
    Tunnel,
}

impl TimerGroup {
    /// The idle time, in seconds, before a flow in this group expires.
    pub const fn ttl_secs(&self) -> u64 {
        match self {
            Self::Classifying => 10,
            Self::Short => 30,
            Self::Generic => 240,
            Self::Tunnel => 3600,
        }
    }
}

impl Display for TimerGroup {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Classifying => "CLASSIFYING",
            Self::Short => "SHORT",
            Self::Generic => "GENERIC",
            Self::Tunnel => "TUNNEL",
        };
        write!(f, "{s}")
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn protocol_parse() {
        assert_eq!("gre".parse::<Protocol>(), Ok(Protocol::GRE));
        assert_eq!("132".parse::<Protocol>(), Ok(Protocol(132)));
        assert!("sctp".parse::<Protocol>().is_err());
        assert!(Protocol::UDP.is_ported());
        assert!(!Protocol::ESP.is_ported());
    }
}
