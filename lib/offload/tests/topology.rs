// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

// Copyright 2025 Oxide Computer Company

//! Integration tests of rule construction from interface stacks and
//! of flows whose topology changes under them.

use offload_test_utils::*;

#[ctor::ctor]
fn register_usdt() {
    usdt::register_probes().unwrap();
}

const VLAN_MAC: MacAddr = MacAddr::from_const([0x02, 0, 0, 0, 0, 0x64]);

/// Take the single create the engine was sent and ack it.
fn created(ts: &TestSession) -> CreateRule {
    match ts.engine.take_sent().as_slice() {
        [SentCmd::Create(serial, rule)] => {
            ts.mgr.create_resp(&ack(*serial, rule.tuple));
            *rule
        }
        sent => panic!("expected one create, got {sent:?}"),
    }
}

#[test]
fn bridged_vlan_stack() {
    let ts = TestSession::new(OffloadCfg::default());
    let ifaces = IfaceLists {
        from: list(&[
            eth("eth0", 1, ETH0_MAC),
            bridge("br0", BR_MAC),
            vlan("vlan100", 100, VLAN_MAC),
        ]),
        to: list(&[eth("eth1", 2, ETH1_MAC)]),
        ..Default::default()
    };
    let p = pkt(Protocol::ESP, (LAN_IP, 0), (REMOTE_IP, 0), ifaces);

    let conn = ts.send(&p);
    assert_eq!(ts.mgr.accel_state_get(&conn), AccelMode::AccelPending);

    let rule = created(&ts);
    assert_eq!(rule.conn.flow_ifnum, 1);
    assert_eq!(rule.conn.return_ifnum, 2);
    assert_eq!(rule.vlan_primary.ingress, Some((0x8100 << 16) | 100));
    assert_eq!(rule.vlan_primary.egress, None);
    assert_eq!(rule.src_mac.flow, Some(BR_MAC));
    assert_eq!(rule.src_mac.ret, None);
    assert!(rule.valid.contains(ValidFlags::FLOW_VLAN | ValidFlags::FLOW_SRC_MAC));
    assert!(!rule.valid.contains(ValidFlags::RETURN_VLAN));
    assert!(rule.flags.contains(RuleFlags::ROUTED));

    assert_eq!(ts.mgr.accel_state_get(&conn), AccelMode::Accel);
    let stats = ts.mgr.stats();
    assert_eq!(stats.accelerated, 1);
    assert_eq!(stats.non_ported_accelerated, 1);
    assert_eq!(stats.ported_accelerated, 0);
}

#[test]
fn bridge_vlan_pppoe_stack() {
    let ts = TestSession::with_devs(OffloadCfg::default(), Arc::new(FixedPrio(5)));
    let ifaces = IfaceLists {
        from: list(&[eth("eth0", 1, ETH0_MAC)]),
        to: list(&[
            eth("eth1", 2, ETH1_MAC),
            bridge("br1", BR_MAC),
            vlan("vlan7", 7, VLAN_MAC),
            pppoe("ppp0", 0x1234, PEER_MAC),
        ]),
        ..Default::default()
    };
    let p = pkt(Protocol::TCP, (LAN_IP, 1025), (REMOTE_IP, 80), ifaces);
    ts.send(&p);

    let rule = created(&ts);
    assert_eq!(rule.vlan_primary.egress, Some((0x8100 << 16) | (5 << 13) | 7));
    assert_eq!(rule.src_mac.ret, Some(BR_MAC));
    let pppoe = rule.pppoe.ret.unwrap();
    assert_eq!(pppoe.session_id, 0x1234);
    assert_eq!(pppoe.peer_mac, PEER_MAC);
    assert!(rule.valid.contains(
        ValidFlags::RETURN_VLAN
            | ValidFlags::RETURN_PPPOE
            | ValidFlags::RETURN_SRC_MAC
    ));
}

#[test]
fn three_vlans_fail_rule() {
    let ts = TestSession::new(OffloadCfg::default());
    let ifaces = IfaceLists {
        from: list(&[
            eth("eth0", 1, ETH0_MAC),
            vlan("vlan10", 10, VLAN_MAC),
            vlan("vlan20", 20, VLAN_MAC),
            vlan("vlan30", 30, VLAN_MAC),
        ]),
        to: list(&[eth("eth1", 2, ETH1_MAC)]),
        ..Default::default()
    };
    let p = pkt(Protocol::TCP, (LAN_IP, 1025), (REMOTE_IP, 80), ifaces);

    let conn = ts.send(&p);
    assert_eq!(ts.mgr.accel_state_get(&conn), AccelMode::FailRule);
    assert_eq!(ts.engine.sent_count(), 0);
    assert_eq!(ts.mgr.stats().rule_invalid, 1);
    assert!(ts.log.contains("rule invalid"));

    // FailRule is terminal for the flow.
    ts.send(&p);
    assert_eq!(ts.mgr.stats().rule_invalid, 1);
}

#[test]
fn unknown_outer_device_fails_rule() {
    let ts = TestSession::new(OffloadCfg::default());
    let mut ifaces = simple_ifaces();
    ifaces.to = list(&[bridge("br0", BR_MAC)]);
    let p = pkt(Protocol::UDP, (LAN_IP, 5000), (REMOTE_IP, 5000), ifaces);

    let conn = ts.send(&p);
    assert_eq!(ts.mgr.accel_state_get(&conn), AccelMode::FailRule);
}

/// Changes the topology of every flow it contributes a rule to.
struct Mover;

impl Classifier for Mover {
    fn kind(&self) -> ClassifierKind {
        ClassifierKind::Hyfi
    }

    fn process(&self, _: &Conn, _: Side, _: &PacketCtx) -> ProcessResponse {
        ProcessResponse::relevant()
    }

    fn sync_to_rule(&self, conn: &Conn, _rule: &mut CreateRule) {
        conn.set_ifaces(conn.ifaces());
    }
}

struct MoverFactory;

impl ClassifierFactory for MoverFactory {
    fn kind(&self) -> ClassifierKind {
        ClassifierKind::Hyfi
    }

    fn assign(&self, _tuple: &FlowTuple) -> Option<Arc<dyn Classifier>> {
        Some(Arc::new(Mover))
    }
}

#[test]
fn topology_change_during_build_is_transient() {
    let ts = TestSession::new(OffloadCfg::default());
    ts.mgr.register_classifier(Arc::new(MoverFactory));

    let conn = ts.send(&tcp_pkt(1));
    assert_eq!(ts.mgr.accel_state_get(&conn), AccelMode::Decel);
    assert_eq!(ts.engine.sent_count(), 0);
    assert_eq!(ts.mgr.inflight_count(), 0);
    assert_eq!(conn.regen_occurrences(), 1);

    // Each packet retries, and each retry is abandoned the same way.
    ts.send(&tcp_pkt(1));
    let stats = ts.mgr.stats();
    assert_eq!(stats.stale_topology, 2);
    assert_eq!(stats.rule_invalid, 0);
    assert_eq!(ts.engine.sent_count(), 0);
}

#[test]
fn regeneration_moves_offloaded_flow() {
    let ts = TestSession::new(OffloadCfg::default());
    let mut p = tcp_pkt(1);

    let conn = ts.accelerate(&p);
    assert_eq!(conn.regen_occurrences(), 0);

    // The return path moves to another port.
    ts.mgr.mark_regen_all();
    assert!(conn.regen_required());
    p.ifaces.to = list(&[eth("eth2", 3, ETH1_MAC)]);
    ts.send(&p);
    assert_eq!(ts.mgr.accel_state_get(&conn), AccelMode::DecelPending);
    assert!(!conn.regen_required());
    assert_eq!(conn.regen_occurrences(), 1);

    ts.answer_all(true);
    assert_eq!(ts.mgr.accel_state_get(&conn), AccelMode::Decel);

    ts.send(&p);
    let rule = created(&ts);
    assert_eq!(rule.conn.return_ifnum, 3);
    assert_eq!(ts.mgr.accel_state_get(&conn), AccelMode::Accel);
    assert_eq!(ts.mgr.stats().accelerated, 1);
}

#[test]
fn pptp_destroy_uses_call_ids() {
    let ts = TestSession::new(OffloadCfg::default());
    let ifaces = IfaceLists {
        from: list(&[eth("eth0", 1, ETH0_MAC), pptp("pptp0", 11, 22)]),
        to: list(&[eth("eth1", 2, ETH1_MAC)]),
        ..Default::default()
    };
    let p = pkt(Protocol::GRE, (LAN_IP, 0), (REMOTE_IP, 0), ifaces);

    let conn = ts.send(&p);
    let rule = created(&ts);
    assert_eq!(rule.tuple.flow_ident, 11);
    assert_eq!(rule.tuple.return_ident, 22);

    ts.mgr.decelerate(&conn);
    match ts.engine.take_sent().as_slice() {
        [SentCmd::Destroy(serial, d)] => {
            assert_eq!(*serial, conn.serial());
            assert_eq!(d.tuple, rule.tuple);
        }
        sent => panic!("expected one destroy, got {sent:?}"),
    }
}

#[test]
fn nat_flow_return_mac() {
    let ts = TestSession::new(OffloadCfg::default());
    let mut p = tcp_pkt(1);
    p.direction = FlowDirection::EgressNat;
    p.tuple.from_nat = Endpoint { addr: WAN_IP.into(), port: 61000 };
    p.nodes.to_nat = MacAddr::from_const([0x02, 0, 0, 0, 3, 3]);

    ts.send(&p);
    let rule = created(&ts);
    assert_eq!(rule.conn.flow_ip_xlate, IpAddr::from(WAN_IP));
    assert_eq!(rule.conn.flow_ident_xlate, 61000);
    assert_eq!(rule.conn.dest_mac_xlate, PEER_MAC);
    assert_eq!(rule.conn.return_mac, PEER_MAC);
}

#[test]
fn bridged_flow_flags() {
    let ts = TestSession::new(OffloadCfg::default());
    let mut p = tcp_pkt(1);
    p.is_routed = false;
    p.is_l2_encap = true;

    ts.send(&p);
    let rule = created(&ts);
    assert!(rule.flags.contains(RuleFlags::BRIDGE_FLOW | RuleFlags::L2_ENCAP));
    assert!(!rule.flags.contains(RuleFlags::ROUTED));
    assert_eq!(rule.conn.dest_mac_xlate, rule.conn.return_mac);
}
