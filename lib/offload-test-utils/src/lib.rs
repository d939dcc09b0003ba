// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

// Copyright 2025 Oxide Computer Company

//! Common routines for integration tests.

// This type of pedantry is more trouble than it's worth here.
#![allow(dead_code)]

#[macro_use]
pub mod offload_state;

// Let's make our lives easier and pub use a bunch of stuff.
pub use offload::ExecCtx;
pub use offload::api::AccelMode;
pub use offload::api::FlowDirection;
pub use offload::api::MacAddr;
pub use offload::api::OffloadCfg;
pub use offload::api::Protocol;
pub use offload::api::TimerGroup;
pub use offload::ddi::sync::KMutex;
pub use offload::ddi::time::Moment;
pub use offload::engine::AccelEngine;
pub use offload::engine::AeResponse;
pub use offload::engine::AeStatus;
pub use offload::engine::TxError;
pub use offload::engine::classify::AccelPermit;
pub use offload::engine::classify::Classifier;
pub use offload::engine::classify::ClassifierFactory;
pub use offload::engine::classify::ClassifierKind;
pub use offload::engine::classify::ProcessResponse;
pub use offload::engine::classify::Relevance;
pub use offload::engine::conn::Conn;
pub use offload::engine::conn::Endpoint;
pub use offload::engine::conn::FlowNodes;
pub use offload::engine::conn::FlowTuple;
pub use offload::engine::conn::PacketCtx;
pub use offload::engine::conn::Serial;
pub use offload::engine::conn::Side;
pub use offload::engine::iface::Iface;
pub use offload::engine::iface::IfaceInfo;
pub use offload::engine::iface::IfaceList;
pub use offload::engine::iface::IfaceLists;
pub use offload::engine::iface::NetDevices;
pub use offload::engine::iface::NoDevices;
pub use offload::engine::iface::PppoeInfo;
pub use offload::engine::iface::PptpInfo;
pub use offload::engine::iface::VlanInfo;
pub use offload::engine::rule::CreateRule;
pub use offload::engine::rule::DestroyRule;
pub use offload::engine::rule::RuleFlags;
pub use offload::engine::rule::RuleTuple;
pub use offload::engine::rule::ValidFlags;
pub use offload::engine::session::FwdDecision;
pub use offload::engine::session::OffloadMgr;
pub use offload::provider::LogLevel;
pub use offload::provider::LogProvider;
pub use offload_state::*;
pub use std::net::IpAddr;
pub use std::net::Ipv4Addr;
pub use std::sync::Arc;

pub const ETH0_MAC: MacAddr = MacAddr::from_const([0x02, 0, 0, 0, 0, 0xE0]);
pub const ETH1_MAC: MacAddr = MacAddr::from_const([0x02, 0, 0, 0, 0, 0xE1]);
pub const BR_MAC: MacAddr = MacAddr::from_const([0x02, 0, 0, 0, 0, 0xB0]);
pub const HOST_MAC: MacAddr = MacAddr::from_const([0x02, 0, 0, 0, 1, 1]);
pub const PEER_MAC: MacAddr = MacAddr::from_const([0x02, 0, 0, 0, 2, 2]);

pub const LAN_IP: Ipv4Addr = Ipv4Addr::new(192, 168, 1, 10);
pub const WAN_IP: Ipv4Addr = Ipv4Addr::new(198, 51, 100, 1);
pub const REMOTE_IP: Ipv4Addr = Ipv4Addr::new(203, 0, 113, 7);

/// A command the [`TestEngine`] accepted.
#[derive(Clone, Debug)]
pub enum SentCmd {
    Create(Serial, CreateRule),
    Destroy(Serial, DestroyRule),
}

impl SentCmd {
    pub fn serial(&self) -> Serial {
        match self {
            Self::Create(s, _) | Self::Destroy(s, _) => *s,
        }
    }
}

/// An acceleration engine that queues nothing. It records every
/// command handed to it and can be told to refuse the next few.
#[derive(Default)]
pub struct TestEngine {
    sent: KMutex<Vec<SentCmd>>,
    fail_next: KMutex<u32>,
}

impl TestEngine {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Refuse the next `n` commands with [`TxError::ChannelFull`].
    pub fn fail_next(&self, n: u32) {
        *self.fail_next.lock() = n;
    }

    /// Drain the record of accepted commands.
    pub fn take_sent(&self) -> Vec<SentCmd> {
        std::mem::take(&mut *self.sent.lock())
    }

    pub fn sent_count(&self) -> usize {
        self.sent.lock().len()
    }

    fn tx(&self, cmd: SentCmd) -> Result<(), TxError> {
        let mut fail = self.fail_next.lock();
        if *fail > 0 {
            *fail -= 1;
            return Err(TxError::ChannelFull);
        }
        self.sent.lock().push(cmd);
        Ok(())
    }
}

impl AccelEngine for TestEngine {
    fn tx_create(&self, serial: Serial, rule: &CreateRule) -> Result<(), TxError> {
        self.tx(SentCmd::Create(serial, *rule))
    }

    fn tx_destroy(
        &self,
        serial: Serial,
        rule: &DestroyRule,
    ) -> Result<(), TxError> {
        self.tx(SentCmd::Destroy(serial, *rule))
    }
}

/// A log provider that keeps every message.
#[derive(Clone, Default)]
pub struct CaptureLog {
    msgs: Arc<KMutex<Vec<(LogLevel, String)>>>,
}

impl CaptureLog {
    pub fn count(&self, level: LogLevel) -> usize {
        self.msgs.lock().iter().filter(|(l, _)| *l == level).count()
    }

    pub fn contains(&self, needle: &str) -> bool {
        self.msgs.lock().iter().any(|(_, m)| m.contains(needle))
    }
}

impl LogProvider for CaptureLog {
    fn log(&self, level: LogLevel, msg: &str) {
        self.msgs.lock().push((level, msg.to_string()));
    }
}

/// A classifier answering every packet with the same response. The
/// response can be changed while flows are live.
pub struct ScriptClassifier {
    kind: ClassifierKind,
    resp: KMutex<ProcessResponse>,
}

impl ScriptClassifier {
    pub fn new(kind: ClassifierKind, resp: ProcessResponse) -> Arc<Self> {
        Arc::new(Self { kind, resp: KMutex::new(resp) })
    }

    pub fn set(&self, resp: ProcessResponse) {
        *self.resp.lock() = resp;
    }
}

impl Classifier for ScriptClassifier {
    fn kind(&self) -> ClassifierKind {
        self.kind
    }

    fn process(&self, _: &Conn, _: Side, _: &PacketCtx) -> ProcessResponse {
        *self.resp.lock()
    }
}

/// Hands the same [`ScriptClassifier`] to every flow of `proto`, or
/// to every flow if `proto` is `None`.
pub struct ScriptFactory {
    pub classifier: Arc<ScriptClassifier>,
    pub proto: Option<Protocol>,
}

impl ClassifierFactory for ScriptFactory {
    fn kind(&self) -> ClassifierKind {
        self.classifier.kind
    }

    fn assign(&self, tuple: &FlowTuple) -> Option<Arc<dyn Classifier>> {
        match self.proto {
            Some(p) if p != tuple.proto => None,
            _ => Some(self.classifier.clone()),
        }
    }
}

/// A [`NetDevices`] with a fixed VLAN egress priority.
pub struct FixedPrio(pub u8);

impl NetDevices for FixedPrio {
    fn vlan_egress_prio(&self, _ifindex: u32, _qos_tag: u32) -> u8 {
        self.0
    }

    fn mtu_by_local_addr(&self, _addr: IpAddr) -> Option<u32> {
        None
    }
}

// ================================================================
// Interfaces
// ================================================================

fn iface(
    name: &str,
    ifindex: u32,
    ae_ifnum: Option<i32>,
    info: IfaceInfo,
) -> Arc<Iface> {
    Arc::new(Iface { name: name.to_string(), ifindex, ae_ifnum, mtu: 1500, info })
}

pub fn eth(name: &str, ae_ifnum: i32, mac: MacAddr) -> Arc<Iface> {
    iface(name, ae_ifnum as u32, Some(ae_ifnum), IfaceInfo::Ethernet { mac })
}

pub fn bridge(name: &str, mac: MacAddr) -> Arc<Iface> {
    iface(name, 100, None, IfaceInfo::Bridge { mac })
}

pub fn vlan(name: &str, vid: u16, mac: MacAddr) -> Arc<Iface> {
    let info = VlanInfo { vid, tpid: 0x8100, mac };
    iface(name, 200 + u32::from(vid), None, IfaceInfo::Vlan(info))
}

pub fn pppoe(name: &str, session_id: u16, peer_mac: MacAddr) -> Arc<Iface> {
    let info = PppoeInfo { session_id, peer_mac };
    iface(name, 300, None, IfaceInfo::Pppoe(info))
}

pub fn ipsec(name: &str) -> Arc<Iface> {
    iface(name, 400, None, IfaceInfo::IpsecTunnel)
}

pub fn pptp(name: &str, src_call: u16, dst_call: u16) -> Arc<Iface> {
    let info = PptpInfo { src_call, dst_call };
    iface(name, 500, None, IfaceInfo::Pptp(info))
}

/// Build an interface stack, outermost first.
pub fn list(ifaces: &[Arc<Iface>]) -> IfaceList {
    IfaceList::from_slice(ifaces).unwrap()
}

// ================================================================
// Packets
// ================================================================

/// Describe a routed packet from `from` to `to` crossing the given
/// interface stacks, sent by `from`.
pub fn pkt(
    proto: Protocol,
    from: (Ipv4Addr, u16),
    to: (Ipv4Addr, u16),
    ifaces: IfaceLists,
) -> PacketCtx {
    let from = Endpoint { addr: from.0.into(), port: from.1 };
    let to = Endpoint { addr: to.0.into(), port: to.1 };
    PacketCtx {
        tuple: FlowTuple::new(proto, from, to),
        nodes: FlowNodes {
            from: HOST_MAC,
            from_nat: HOST_MAC,
            to: PEER_MAC,
            to_nat: PEER_MAC,
        },
        ifaces,
        direction: FlowDirection::NonNat,
        is_routed: true,
        is_l2_encap: false,
        can_accel: true,
        priority: 0,
        src: from.addr,
        len: 1000,
    }
}

/// A TCP packet between two plain Ethernet ports.
pub fn tcp_pkt(sport: u16) -> PacketCtx {
    pkt(
        Protocol::TCP,
        (LAN_IP, sport),
        (REMOTE_IP, 443),
        simple_ifaces(),
    )
}

pub fn simple_ifaces() -> IfaceLists {
    IfaceLists {
        from: list(&[eth("eth0", 1, ETH0_MAC)]),
        to: list(&[eth("eth1", 2, ETH1_MAC)]),
        ..Default::default()
    }
}

/// The same packet sent by the other end.
pub fn reply(pkt: &PacketCtx) -> PacketCtx {
    let mut r = pkt.clone();
    r.src = pkt.tuple.to.addr;
    r
}

// ================================================================
// Sessions
// ================================================================

pub fn ack(serial: Serial, tuple: RuleTuple) -> AeResponse {
    AeResponse { serial, status: AeStatus::Ack, tuple }
}

pub fn nack(serial: Serial, tuple: RuleTuple) -> AeResponse {
    AeResponse { serial, status: AeStatus::Nack(1), tuple }
}

/// A session with a [`TestEngine`] and a [`CaptureLog`].
pub struct TestSession {
    pub mgr: Arc<OffloadMgr>,
    pub engine: Arc<TestEngine>,
    pub log: CaptureLog,
}

impl TestSession {
    pub fn new(cfg: OffloadCfg) -> Self {
        Self::with_devs(cfg, Arc::new(NoDevices))
    }

    pub fn with_devs(cfg: OffloadCfg, devs: Arc<dyn NetDevices>) -> Self {
        let engine = TestEngine::new();
        let log = CaptureLog::default();
        let ectx = Arc::new(ExecCtx { log: Box::new(log.clone()) });
        let mgr = OffloadMgr::new("test", ectx, cfg, engine.clone(), devs)
            .unwrap();
        Self { mgr, engine, log }
    }

    /// Process `pkt` and return its flow.
    pub fn send(&self, pkt: &PacketCtx) -> Arc<Conn> {
        assert_eq!(self.mgr.process_packet(pkt), FwdDecision::Pass);
        self.mgr.find(&pkt.tuple.key()).unwrap()
    }

    /// Answer every command the engine has accepted so far.
    pub fn answer_all(&self, ok: bool) {
        for cmd in self.engine.take_sent() {
            let status = if ok { AeStatus::Ack } else { AeStatus::Nack(1) };
            match cmd {
                SentCmd::Create(serial, rule) => {
                    let resp = AeResponse { serial, status, tuple: rule.tuple };
                    self.mgr.create_resp(&resp);
                }
                SentCmd::Destroy(serial, rule) => {
                    let resp = AeResponse { serial, status, tuple: rule.tuple };
                    self.mgr.destroy_resp(&resp);
                }
            }
        }
    }

    /// Send `pkt` and ack the resulting create.
    pub fn accelerate(&self, pkt: &PacketCtx) -> Arc<Conn> {
        let conn = self.send(pkt);
        self.answer_all(true);
        assert_eq!(conn.fe().mode(), AccelMode::Accel);
        conn
    }
}
