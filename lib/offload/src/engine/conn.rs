// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

// Copyright 2025 Oxide Computer Company

//! Flow records and the directory that holds them.
//!
//! A [`Conn`] is the record of one tracked flow. It owns the flow's
//! [`FrontEnd`], its four interface stacks, the classifiers assigned
//! to it, and its idle timer. The [`ConnDb`] finds flows by their
//! [`FlowKey`] on the packet path and by their [`Serial`] when an
//! engine response or cessation notice comes back.
use super::accel::FrontEnd;
use super::classify::Classifier;
use super::classify::ClassifierKind;
use super::iface::IfaceInfo;
use super::iface::IfaceLists;
use super::iface::PptpInfo;
use crate::api::AccelLimits;
use crate::api::FlowDirection;
use crate::api::MacAddr;
use crate::api::Protocol;
use crate::api::TimerGroup;
use crate::ddi::sync::KMutex;
use crate::ddi::sync::KRwLock;
use crate::ddi::time::MILLIS;
use crate::ddi::time::Moment;
use core::fmt;
use core::fmt::Display;
use std::boxed::Box;
use std::collections::BTreeMap;
use std::net::IpAddr;
use std::sync::Arc;
use std::vec::Vec;

/// The correlation id of a flow.
///
/// Every flow gets a fresh serial from the directory when it is
/// created. Serials are never reused, so a late response for a flow
/// that has since been removed simply finds nothing.
#[derive(Clone, Copy, Debug, Eq, Hash, Ord, PartialEq, PartialOrd)]
pub struct Serial(pub u64);

impl Display for Serial {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// One of the two directions of a flow.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum Side {
    /// The flow's originator.
    From,
    /// The flow's responder.
    To,
}

impl Display for Side {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::From => write!(f, "from"),
            Self::To => write!(f, "to"),
        }
    }
}

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct Endpoint {
    pub addr: IpAddr,
    /// The transport port, zero for protocols without ports.
    pub port: u16,
}

impl Display for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.addr, self.port)
    }
}

/// A flow's addressing before and after translation.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct FlowTuple {
    pub proto: Protocol,
    pub from: Endpoint,
    pub from_nat: Endpoint,
    pub to: Endpoint,
    pub to_nat: Endpoint,
}

impl FlowTuple {
    /// A tuple for a flow that sees no translation.
    pub fn new(proto: Protocol, from: Endpoint, to: Endpoint) -> Self {
        Self { proto, from, from_nat: from, to, to_nat: to }
    }

    pub fn key(&self) -> FlowKey {
        FlowKey {
            proto: self.proto,
            src: self.from.addr,
            sport: self.from.port,
            dst: self.to.addr,
            dport: self.to.port,
        }
    }
}

impl Display for FlowTuple {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {} -> {}", self.proto, self.from, self.to)
    }
}

/// The lookup key of a flow in the directory.
#[derive(Clone, Copy, Debug, Eq, Hash, Ord, PartialEq, PartialOrd)]
pub struct FlowKey {
    pub proto: Protocol,
    pub src: IpAddr,
    pub sport: u16,
    pub dst: IpAddr,
    pub dport: u16,
}

/// The link-layer addresses of the nodes at each end of a flow.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub struct FlowNodes {
    pub from: MacAddr,
    pub from_nat: MacAddr,
    pub to: MacAddr,
    pub to_nat: MacAddr,
}

/// Everything the coordinator is told about one packet.
///
/// The addressing, interface stacks, and node addresses are the
/// surrounding system's view of the flow the packet belongs to; they
/// seed the flow record when the packet is the flow's first, and
/// replace the interface stacks when the flow is regenerated.
#[derive(Clone, Debug)]
pub struct PacketCtx {
    pub tuple: FlowTuple,
    pub nodes: FlowNodes,
    pub ifaces: IfaceLists,
    pub direction: FlowDirection,
    pub is_routed: bool,
    pub is_l2_encap: bool,
    /// Whether the surrounding system considers the flow eligible for
    /// acceleration at all.
    pub can_accel: bool,
    /// The packet's own priority, the starting QoS tag.
    pub priority: u32,
    /// The source of this packet.
    pub src: IpAddr,
    pub len: usize,
}

pub type DefunctFn = Box<dyn Fn(&Arc<Conn>) + Send + Sync>;

struct ConnData {
    ifaces: IfaceLists,
    regen_occurrences: u32,
    regen_required: bool,
    timer_group: TimerGroup,
    last_touched: Moment,
    defunct: bool,
    classifiers: Vec<Arc<dyn Classifier>>,
    from_pkts: u64,
    to_pkts: u64,
    bytes: u64,
    dropped_pkts: u64,
}

/// Per-flow packet totals.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub struct ConnTotals {
    pub from_pkts: u64,
    pub to_pkts: u64,
    pub bytes: u64,
    pub dropped_pkts: u64,
}

/// The record of one tracked flow.
pub struct Conn {
    serial: Serial,
    tuple: FlowTuple,
    nodes: FlowNodes,
    direction: FlowDirection,
    is_routed: bool,
    fe: FrontEnd,
    data: KMutex<ConnData>,
    on_defunct: Option<DefunctFn>,
}

impl Conn {
    /// Create the record for the flow `pkt` belongs to, along with its
    /// front end. The front end starts in `Decel`, or `Denied` when
    /// `can_accel` is false.
    pub fn new(
        serial: Serial,
        pkt: &PacketCtx,
        can_accel: bool,
        limits: &AccelLimits,
        now: Moment,
    ) -> Self {
        let data = ConnData {
            ifaces: pkt.ifaces.clone(),
            regen_occurrences: 0,
            regen_required: false,
            timer_group: TimerGroup::default(),
            last_touched: now,
            defunct: false,
            classifiers: Vec::new(),
            from_pkts: 0,
            to_pkts: 0,
            bytes: 0,
            dropped_pkts: 0,
        };

        Self {
            serial,
            tuple: pkt.tuple,
            nodes: pkt.nodes,
            direction: pkt.direction,
            is_routed: pkt.is_routed,
            fe: FrontEnd::new(serial, pkt.tuple.proto, can_accel, limits),
            data: KMutex::new(data),
            on_defunct: None,
        }
    }

    /// Assign `classifiers`; they run in ascending priority order
    /// whatever order they are given in.
    pub fn with_classifiers(
        self,
        mut classifiers: Vec<Arc<dyn Classifier>>,
    ) -> Self {
        classifiers.sort_by_key(|c| c.kind());
        self.data.lock().classifiers = classifiers;
        self
    }

    pub fn with_timer_group(self, group: TimerGroup) -> Self {
        self.data.lock().timer_group = group;
        self
    }

    /// Register the function called, once, when the flow is marked
    /// defunct.
    pub fn with_defunct_cb(mut self, cb: DefunctFn) -> Self {
        self.on_defunct = Some(cb);
        self
    }

    pub fn serial(&self) -> Serial {
        self.serial
    }

    pub fn tuple(&self) -> &FlowTuple {
        &self.tuple
    }

    pub fn nodes(&self) -> &FlowNodes {
        &self.nodes
    }

    pub fn direction(&self) -> FlowDirection {
        self.direction
    }

    pub fn is_routed(&self) -> bool {
        self.is_routed
    }

    pub fn fe(&self) -> &FrontEnd {
        &self.fe
    }

    /// Which side of the flow sent a packet with source `src`.
    pub fn sender(&self, src: IpAddr) -> Side {
        if src == self.tuple.from.addr { Side::From } else { Side::To }
    }

    /// A copy of the flow's interface stacks. The copy holds its own
    /// references to the interfaces, which are released when it is
    /// dropped.
    pub fn ifaces(&self) -> IfaceLists {
        self.data.lock().ifaces.clone()
    }

    /// Replace the flow's interface stacks. This is a topology change:
    /// the regeneration counter moves, invalidating any rule being
    /// built from the old stacks.
    pub fn set_ifaces(&self, ifaces: IfaceLists) {
        let mut data = self.data.lock();
        data.ifaces = ifaces;
        data.regen_occurrences = data.regen_occurrences.wrapping_add(1);
        data.regen_required = false;
    }

    pub fn regen_occurrences(&self) -> u32 {
        self.data.lock().regen_occurrences
    }

    /// Flag the flow's topology as out of date. The next packet on the
    /// flow regenerates it.
    pub fn mark_regen_required(&self) {
        self.data.lock().regen_required = true;
    }

    pub fn regen_required(&self) -> bool {
        self.data.lock().regen_required
    }

    /// The PPTP call ids of the flow's originating side, if it is a
    /// PPTP flow.
    pub fn pptp(&self) -> Option<PptpInfo> {
        self.data.lock().ifaces.from.iter().find_map(|iface| match iface.info {
            IfaceInfo::Pptp(info) => Some(info),
            _ => None,
        })
    }

    pub fn classifiers(&self) -> Vec<Arc<dyn Classifier>> {
        self.data.lock().classifiers.clone()
    }

    /// Remove the classifier of type `kind` from the flow for good.
    /// The default classifier can never be removed.
    pub fn unassign(&self, kind: ClassifierKind) -> bool {
        if kind == ClassifierKind::Default {
            return false;
        }

        let mut data = self.data.lock();
        let before = data.classifiers.len();
        data.classifiers.retain(|c| c.kind() != kind);
        before != data.classifiers.len()
    }

    pub fn timer_group(&self) -> TimerGroup {
        self.data.lock().timer_group
    }

    /// Refresh the idle timer. Fails if the flow is already defunct.
    pub fn touch(&self, now: Moment) -> bool {
        let mut data = self.data.lock();
        if data.defunct {
            return false;
        }
        data.last_touched = now;
        true
    }

    /// Move the flow to a new timer group and restart its timer.
    pub fn reset_timer(&self, group: TimerGroup, now: Moment) {
        let mut data = self.data.lock();
        data.timer_group = group;
        data.last_touched = now;
    }

    /// Has the flow been idle longer than its timer group allows?
    pub fn is_expired(&self, now: Moment) -> bool {
        let data = self.data.lock();
        now.delta_as_millis(data.last_touched)
            >= data.timer_group.ttl_secs() * MILLIS
    }

    pub fn idle_millis(&self, now: Moment) -> u64 {
        now.delta_as_millis(self.data.lock().last_touched)
    }

    pub fn is_defunct(&self) -> bool {
        self.data.lock().defunct
    }

    /// Mark the flow permanently invalid and notify the registered
    /// callback. Only the first call has any effect.
    pub fn make_defunct(self: &Arc<Self>) {
        {
            let mut data = self.data.lock();
            if data.defunct {
                return;
            }
            data.defunct = true;
        }

        if let Some(cb) = &self.on_defunct {
            cb(self);
        }
    }

    pub fn update_totals(&self, sender: Side, len: usize, dropped: bool) {
        let mut data = self.data.lock();
        match sender {
            Side::From => data.from_pkts += 1,
            Side::To => data.to_pkts += 1,
        }
        data.bytes += len as u64;
        if dropped {
            data.dropped_pkts += 1;
        }
    }

    pub fn totals(&self) -> ConnTotals {
        let data = self.data.lock();
        ConnTotals {
            from_pkts: data.from_pkts,
            to_pkts: data.to_pkts,
            bytes: data.bytes,
            dropped_pkts: data.dropped_pkts,
        }
    }
}

impl fmt::Debug for Conn {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Conn")
            .field("serial", &self.serial)
            .field("tuple", &self.tuple)
            .field("mode", &self.fe.mode())
            .finish()
    }
}

#[derive(Default)]
struct DbInner {
    next_serial: u64,
    by_key: BTreeMap<FlowKey, Arc<Conn>>,
    by_serial: BTreeMap<Serial, Arc<Conn>>,
}

/// The directory of live flows.
#[derive(Default)]
pub struct ConnDb {
    inner: KRwLock<DbInner>,
}

impl ConnDb {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn find(&self, key: &FlowKey) -> Option<Arc<Conn>> {
        self.inner.read().by_key.get(key).cloned()
    }

    pub fn find_by_serial(&self, serial: Serial) -> Option<Arc<Conn>> {
        self.inner.read().by_serial.get(&serial).cloned()
    }

    /// Find the flow for `key`, creating it with `make` if there is
    /// none. The boolean is true when this call created the flow.
    ///
    /// Two packets of a new flow may race to create it; the lookup is
    /// repeated under the write lock so exactly one of them wins and
    /// the other gets the winner's record.
    pub fn insert_or_get(
        &self,
        key: FlowKey,
        make: impl FnOnce(Serial) -> Conn,
    ) -> (Arc<Conn>, bool) {
        let mut inner = self.inner.write();
        if let Some(conn) = inner.by_key.get(&key) {
            return (conn.clone(), false);
        }

        inner.next_serial += 1;
        let serial = Serial(inner.next_serial);
        let conn = Arc::new(make(serial));
        inner.by_key.insert(key, conn.clone());
        inner.by_serial.insert(serial, conn.clone());
        (conn, true)
    }

    /// Remove the flow from the directory. Holders of a reference keep
    /// a usable record until they drop it.
    pub fn remove(&self, conn: &Conn) -> bool {
        let mut inner = self.inner.write();
        let found = inner.by_serial.remove(&conn.serial).is_some();
        inner.by_key.remove(&conn.tuple.key());
        found
    }

    /// Remove every flow whose idle timer has run out and mark each
    /// one defunct. Returns the removed flows.
    pub fn expire(&self, now: Moment) -> Vec<Arc<Conn>> {
        let expired: Vec<Arc<Conn>> = {
            let mut inner = self.inner.write();
            let expired: Vec<Arc<Conn>> = inner
                .by_serial
                .values()
                .filter(|c| c.is_expired(now))
                .cloned()
                .collect();

            for conn in &expired {
                inner.by_serial.remove(&conn.serial);
                inner.by_key.remove(&conn.tuple.key());
            }
            expired
        };

        // Callbacks run without the directory lock held.
        for conn in &expired {
            flow_expired_probe(conn, now);
            conn.make_defunct();
        }
        expired
    }

    /// Flag every flow as needing regeneration.
    pub fn mark_regen_all(&self) {
        for conn in self.inner.read().by_serial.values() {
            conn.mark_regen_required();
        }
    }

    /// All live flows, in serial order.
    pub fn flows(&self) -> Vec<Arc<Conn>> {
        self.inner.read().by_serial.values().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.inner.read().by_serial.len()
    }
}

fn flow_expired_probe(conn: &Conn, now: Moment) {
    cfg_if! {
        if #[cfg(feature = "usdt")] {
            use std::string::ToString;
            crate::offload_provider::flow__expired!(|| (
                conn.serial.0,
                conn.timer_group().to_string(),
                conn.idle_millis(now)
            ));
        } else {
            let (_, _) = (conn, now);
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use core::time::Duration;
    use std::net::Ipv4Addr;
    use std::sync::atomic::AtomicU32;
    use std::sync::atomic::Ordering;

    fn pkt(sport: u16) -> PacketCtx {
        let from = Endpoint { addr: Ipv4Addr::new(10, 0, 0, 1).into(), port: sport };
        let to = Endpoint { addr: Ipv4Addr::new(10, 0, 0, 2).into(), port: 80 };
        PacketCtx {
            tuple: FlowTuple::new(Protocol::TCP, from, to),
            nodes: FlowNodes::default(),
            ifaces: IfaceLists::default(),
            direction: FlowDirection::NonNat,
            is_routed: true,
            is_l2_encap: false,
            can_accel: true,
            priority: 0,
            src: from.addr,
            len: 64,
        }
    }

    #[test]
    fn insert_or_get_creates_once() {
        let db = ConnDb::new();
        let p = pkt(1000);
        let now = Moment::now();
        let lim = AccelLimits::default();
        let (a, created_a) = db.insert_or_get(p.tuple.key(), |s| {
            Conn::new(s, &p, true, &lim, now)
        });
        let (b, created_b) = db.insert_or_get(p.tuple.key(), |s| {
            Conn::new(s, &p, true, &lim, now)
        });
        assert!(created_a);
        assert!(!created_b);
        assert_eq!(a.serial(), b.serial());
        assert_eq!(db.len(), 1);
        assert!(db.find_by_serial(a.serial()).is_some());

        let (c, _) = db.insert_or_get(pkt(1001).tuple.key(), |s| {
            Conn::new(s, &p, true, &lim, now)
        });
        assert_ne!(a.serial(), c.serial());
        assert!(db.remove(&a));
        assert!(db.find(&p.tuple.key()).is_none());
        assert!(!db.remove(&a));
    }

    #[test]
    fn expire_marks_defunct_once() {
        let db = ConnDb::new();
        let p = pkt(1000);
        let now = Moment::now();
        let calls = Arc::new(AtomicU32::new(0));
        let calls2 = calls.clone();
        let lim = AccelLimits::default();
        let (conn, _) = db.insert_or_get(p.tuple.key(), |s| {
            Conn::new(s, &p, true, &lim, now)
                .with_timer_group(TimerGroup::Short)
                .with_defunct_cb(Box::new(move |_: &Arc<Conn>| {
                    calls2.fetch_add(1, Ordering::SeqCst);
                }))
        });

        assert!(db.expire(now + Duration::from_secs(29)).is_empty());
        let gone = db.expire(now + Duration::from_secs(30));
        assert_eq!(gone.len(), 1);
        assert_eq!(db.len(), 0);
        assert!(conn.is_defunct());
        assert!(!conn.touch(now));
        conn.make_defunct();
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn set_ifaces_bumps_regen() {
        let p = pkt(1000);
        let conn =
            Conn::new(Serial(1), &p, true, &AccelLimits::default(), Moment::now());
        conn.mark_regen_required();
        assert!(conn.regen_required());
        conn.set_ifaces(IfaceLists::default());
        assert_eq!(conn.regen_occurrences(), 1);
        assert!(!conn.regen_required());
    }
}
