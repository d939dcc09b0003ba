// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

// Copyright 2025 Oxide Computer Company

//! The offload session manager.
//!
//! An [`OffloadMgr`] ties the pieces together. On the packet path it
//! finds or creates the flow, runs the policy arbiter, and, when the
//! flow may be accelerated, builds and sends a create rule. From the
//! engine's context it takes create/destroy responses and cessation
//! notices and feeds them to the flow's state machine.
//!
//! # Locking
//!
//! Each flow's front end has its own lock; the module-wide counters
//! live behind `globals`. When both are held the front end lock is
//! always taken first, and no flow logic runs with `globals` held.
//! The engine is never called with either lock held.
use super::AccelEngine;
use super::AeResponse;
use super::accel::Ceased;
use super::accel::CreateAck;
use super::accel::DecelStart;
use super::accel::DefunctAction;
use super::accel::FeState;
use super::classify::Classifier;
use super::classify::ClassifierFactory;
use super::classify::DefaultClassifier;
use super::conn::Conn;
use super::conn::FlowKey;
use super::conn::PacketCtx;
use super::conn::Serial;
use super::iface::IfaceLists;
use super::iface::NetDevices;
use super::policy::Verdict;
use super::policy::arbitrate;
use super::rule::RuleBuilder;
use super::rule::RuleError;
use crate::ExecCtx;
use crate::api::AccelMode;
use crate::api::FrontEndDump;
use crate::api::OffloadCfg;
use crate::api::Protocol;
use crate::ddi::kstat;
use crate::ddi::kstat::KStatNamed;
use crate::ddi::kstat::KStatProvider;
use crate::ddi::kstat::KStatU64;
use crate::ddi::sync::KMutex;
use crate::ddi::sync::KRwLock;
use crate::ddi::time::Moment;
use crate::provider::LogLevel;
use kstat_macro::KStatProvider;
use std::collections::BTreeMap;
use std::string::String;
use std::string::ToString;
use std::sync::Arc;
use std::sync::Weak;
use std::vec::Vec;

/// Module-wide offload statistics.
#[derive(KStatProvider)]
pub struct OffloadStats {
    /// Flows the engine currently holds a rule for.
    pub accelerated: KStatU64,
    pub ported_accelerated: KStatU64,
    pub non_ported_accelerated: KStatU64,
    /// Create commands claimed or awaiting a response.
    pub accel_pending: KStatU64,
    /// Destroy commands awaiting a response.
    pub pending_decel: KStatU64,
    /// Accelerations skipped because `accel_limit` was reached.
    pub accel_limited: KStatU64,
    pub rule_invalid: KStatU64,
    pub stale_topology: KStatU64,
    pub driver_fail: KStatU64,
    pub ae_nack: KStatU64,
    /// Cessations that overtook the ack of their create.
    pub flush: KStatU64,
    /// Cessations of offloaded flows.
    pub ceased: KStatU64,
    pub flows_created: KStatU64,
    pub flows_expired: KStatU64,
    pub pkts_processed: KStatU64,
    pub pkts_dropped: KStatU64,
    pub accel_cmds: KStatU64,
    pub accel_cmd_ms: KStatU64,
    pub decel_cmds: KStatU64,
    pub decel_cmd_ms: KStatU64,
}

impl OffloadStats {
    fn accel_up(&mut self, proto: Protocol) {
        self.accelerated += 1;
        if proto.is_ported() {
            self.ported_accelerated += 1;
        } else {
            self.non_ported_accelerated += 1;
        }
    }

    fn accel_down(&mut self, proto: Protocol) {
        self.accelerated -= 1;
        if proto.is_ported() {
            self.ported_accelerated -= 1;
        } else {
            self.non_ported_accelerated -= 1;
        }
    }
}

struct Globals {
    stats: KStatNamed<OffloadStats>,
    terminate_pending: bool,
}

/// What the forwarding path should do with a packet.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum FwdDecision {
    Pass,
    Drop,
}

#[derive(Debug, thiserror::Error)]
pub enum OffloadError {
    #[error("session is terminating")]
    Terminating,

    #[error("kstat: {0}")]
    KStat(#[from] kstat::Error),
}

#[derive(Clone, Copy)]
enum Cmd {
    Create,
    Destroy,
}

impl Cmd {
    fn as_str(&self) -> &'static str {
        match self {
            Self::Create => "create",
            Self::Destroy => "destroy",
        }
    }
}

/// The coordinator for one acceleration engine.
pub struct OffloadMgr {
    name: String,
    ectx: Arc<ExecCtx>,
    cfg: OffloadCfg,
    engine: Arc<dyn AccelEngine>,
    devs: Arc<dyn NetDevices>,
    db: super::conn::ConnDb,
    factories: KRwLock<Vec<Arc<dyn ClassifierFactory>>>,
    /// Flows with a command outstanding at the engine, by serial. The
    /// entry keeps the flow alive until its response is handled.
    inflight: KMutex<BTreeMap<Serial, Arc<Conn>>>,
    globals: KMutex<Globals>,
    me: Weak<OffloadMgr>,
}

impl OffloadMgr {
    pub fn new(
        name: &str,
        ectx: Arc<ExecCtx>,
        cfg: OffloadCfg,
        engine: Arc<dyn AccelEngine>,
        devs: Arc<dyn NetDevices>,
    ) -> Result<Arc<Self>, OffloadError> {
        let stats = KStatNamed::new("offload", name, OffloadStats::new())?;
        let globals = Globals { stats, terminate_pending: false };

        Ok(Arc::new_cyclic(|me| Self {
            name: name.to_string(),
            ectx,
            cfg,
            engine,
            devs,
            db: super::conn::ConnDb::new(),
            factories: KRwLock::new(Vec::new()),
            inflight: KMutex::new(BTreeMap::new()),
            globals: KMutex::new(globals),
            me: me.clone(),
        }))
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn cfg(&self) -> &OffloadCfg {
        &self.cfg
    }

    /// Assign classifiers from `factory` to flows created from now on.
    pub fn register_classifier(&self, factory: Arc<dyn ClassifierFactory>) {
        let mut factories = self.factories.write();
        factories.push(factory);
        factories.sort_by_key(|f| f.kind());
    }

    fn log(&self, level: LogLevel, msg: &str) {
        self.ectx.log.log(level, &format!("{}: {msg}", self.name));
    }

    fn with_stats<R>(&self, f: impl FnOnce(&mut OffloadStats) -> R) -> R {
        let mut globals = self.globals.lock();
        f(globals.stats.vals.as_mut())
    }

    /// A snapshot of the module-wide statistics.
    pub fn stats(&self) -> OffloadStatsSnap {
        self.globals.lock().stats.vals.snapshot()
    }

    pub fn find(&self, key: &FlowKey) -> Option<Arc<Conn>> {
        self.db.find(key)
    }

    pub fn find_by_serial(&self, serial: Serial) -> Option<Arc<Conn>> {
        self.db.find_by_serial(serial)
    }

    pub fn flows(&self) -> Vec<Arc<Conn>> {
        self.db.flows()
    }

    /// The number of commands awaiting an engine response.
    #[cfg(any(feature = "test-help", test))]
    pub fn inflight_count(&self) -> usize {
        self.inflight.lock().len()
    }

    fn new_conn(&self, serial: Serial, pkt: &PacketCtx, now: Moment) -> Conn {
        let tuple = &pkt.tuple;
        let ports_ok = if tuple.proto.is_ported() {
            tuple.from.port != 0 && tuple.to.port != 0
        } else {
            tuple.from.port == 0 && tuple.to.port == 0
        };
        let can_accel = pkt.can_accel && ports_ok;

        let default = DefaultClassifier::new(tuple.proto);
        let mut classifiers: Vec<Arc<dyn Classifier>> =
            vec![Arc::new(default)];
        for f in self.factories.read().iter() {
            if let Some(c) = f.assign(tuple) {
                classifiers.push(c);
            }
        }

        let me = self.me.clone();
        Conn::new(serial, pkt, can_accel, &self.cfg.limits, now)
            .with_classifiers(classifiers)
            .with_timer_group(default.timer_group())
            .with_defunct_cb(Box::new(move |conn: &Arc<Conn>| {
                if let Some(mgr) = me.upgrade() {
                    mgr.defunct(conn);
                }
            }))
    }

    fn find_or_create(
        &self,
        pkt: &PacketCtx,
        now: Moment,
    ) -> Result<Arc<Conn>, OffloadError> {
        let key = pkt.tuple.key();
        if let Some(conn) = self.db.find(&key) {
            return Ok(conn);
        }

        if self.globals.lock().terminate_pending {
            return Err(OffloadError::Terminating);
        }

        let (conn, created) =
            self.db.insert_or_get(key, |serial| self.new_conn(serial, pkt, now));
        if created {
            self.with_stats(|s| s.flows_created += 1);
        }
        Ok(conn)
    }

    /// Process one packet of a tracked flow.
    ///
    /// The packet is only ever dropped on a classifier's say-so.
    /// Anything that stops the flow from being accelerated leaves the
    /// packet to the software path.
    pub fn process_packet(&self, pkt: &PacketCtx) -> FwdDecision {
        let now = Moment::now();
        let Ok(conn) = self.find_or_create(pkt, now) else {
            return FwdDecision::Pass;
        };

        // Already reaped; the directory no longer tracks it.
        if !conn.touch(now) {
            return FwdDecision::Pass;
        }

        let sender = conn.sender(pkt.src);
        if conn.regen_required() {
            self.regenerate(&conn, pkt.ifaces.clone());
        }

        let verdict = arbitrate(&conn, sender, pkt, now);
        conn.update_totals(sender, pkt.len, verdict.drop);
        if verdict.drop {
            self.with_stats(|s| s.pkts_dropped += 1);
            return FwdDecision::Drop;
        }
        self.with_stats(|s| s.pkts_processed += 1);

        if verdict.accel {
            self.accelerate(&conn, &verdict, pkt.is_l2_encap, now);
        }

        FwdDecision::Pass
    }

    fn pin(&self, conn: &Arc<Conn>) {
        self.inflight.lock().insert(conn.serial(), conn.clone());
    }

    fn unpin(&self, serial: Serial) -> Option<Arc<Conn>> {
        self.inflight.lock().remove(&serial)
    }

    /// Reserve an acceleration slot. Called with the flow lock held.
    ///
    /// Flows awaiting a create response count against `accel_limit`
    /// alongside those already offloaded. Nothing is admitted once the
    /// session is terminating.
    fn admit(&self) -> bool {
        let mut globals = self.globals.lock();
        if globals.terminate_pending {
            return false;
        }

        let s = globals.stats.vals.as_mut();
        if let Some(limit) = self.cfg.accel_limit {
            let held = s.accelerated.val() + s.accel_pending.val();
            if held >= u64::from(limit) {
                s.accel_limited += 1;
                return false;
            }
        }

        s.accel_pending += 1;
        true
    }

    /// Try to hand `conn` to the engine.
    ///
    /// The flow moves to `AccelPending` before the rule is built, so
    /// only one caller ever builds and sends a rule for it, and a
    /// response racing the return of the transmit finds the flow
    /// already waiting for it.
    fn accelerate(
        &self,
        conn: &Arc<Conn>,
        verdict: &Verdict,
        is_l2_encap: bool,
        now: Moment,
    ) {
        let fe = conn.fe();
        {
            let mut s = fe.lock();
            if s.mode() != AccelMode::Decel || !self.admit() {
                return;
            }
            s.accel_pending_set(now);
        }

        let builder = RuleBuilder::new(&self.cfg, self.devs.as_ref());
        let rule = match builder.build_create(conn, verdict, is_l2_encap) {
            Ok(rule) => rule,
            Err(e) => {
                self.rule_failed(conn, &e);
                return;
            }
        };

        let serial = conn.serial();
        self.pin(conn);
        let res = self.engine.tx_create(serial, &rule);
        ae_tx_probe(serial, Cmd::Create, res.is_ok());

        match res {
            Ok(()) => fe.lock().tx_ok(),

            Err(e) => {
                self.unpin(serial);
                let mode = {
                    let mut s = fe.lock();
                    let mode = s.create_tx_failed();
                    self.with_stats(|st| {
                        st.accel_pending -= 1;
                        st.driver_fail += 1;
                    });
                    mode
                };
                self.log(
                    LogLevel::Warn,
                    &format!("flow {serial}: create not sent ({e}), now {mode}"),
                );
            }
        }
    }

    fn rule_failed(&self, conn: &Conn, err: &RuleError) {
        rule_build_fail_probe(conn.serial(), err);
        let mut s = conn.fe().lock();
        if err.is_transient() {
            s.accel_abandon(AccelMode::Decel);
            self.with_stats(|st| {
                st.accel_pending -= 1;
                st.stale_topology += 1;
            });
        } else {
            s.accel_abandon(AccelMode::FailRule);
            self.with_stats(|st| {
                st.accel_pending -= 1;
                st.rule_invalid += 1;
            });
            drop(s);
            self.log(
                LogLevel::Warn,
                &format!("flow {}: rule invalid: {err}", conn.serial()),
            );
        }
    }

    fn cmd_done(&self, s: &mut FeState, cmd: Cmd) {
        let ms = s
            .cmd_time_begun
            .take()
            .map(|begun| Moment::now().delta_as_millis(begun))
            .unwrap_or(0);

        self.with_stats(|st| match cmd {
            Cmd::Create => {
                st.accel_cmds += 1;
                st.accel_cmd_ms += ms;
            }
            Cmd::Destroy => {
                st.decel_cmds += 1;
                st.decel_cmd_ms += ms;
            }
        });
    }

    /// Handle the engine's answer to a create command.
    pub fn create_resp(&self, resp: &AeResponse) {
        ae_resp_probe(resp.serial, Cmd::Create, resp.status.is_ack());
        let Some(conn) = self.unpin(resp.serial) else {
            self.log(
                LogLevel::Error,
                &format!("create response for unknown flow {}", resp.serial),
            );
            return;
        };

        let fe = conn.fe();
        let decelerate = {
            let mut s = fe.lock();
            let mode = s.mode();
            if mode != AccelMode::AccelPending {
                drop(s);
                self.log(
                    LogLevel::Warn,
                    &format!("flow {}: stray create response in {mode}", resp.serial),
                );
                return;
            }
            self.cmd_done(&mut s, Cmd::Create);

            if resp.status.is_ack() {
                match s.create_ack() {
                    CreateAck::Accelerated { decelerate } => {
                        self.with_stats(|st| {
                            st.accel_pending -= 1;
                            st.accel_up(fe.proto());
                        });
                        decelerate
                    }
                    CreateAck::Flushed(_) => {
                        self.with_stats(|st| st.accel_pending -= 1);
                        false
                    }
                }
            } else {
                let mode = s.create_nack();
                self.with_stats(|st| {
                    st.accel_pending -= 1;
                    st.ae_nack += 1;
                });
                if mode.is_fail() {
                    drop(s);
                    self.log(
                        LogLevel::Warn,
                        &format!("flow {}: create rejected, now {mode}", resp.serial),
                    );
                }
                false
            }
        };

        if decelerate {
            self.decelerate(&conn);
        }
    }

    /// Withdraw `conn` from the engine.
    ///
    /// Safe to call in any mode and any number of times. If a create is
    /// outstanding the decelerate is deferred until it resolves.
    pub fn decelerate(&self, conn: &Arc<Conn>) {
        let fe = conn.fe();
        {
            let mut s = fe.lock();
            if s.decel_begin(Moment::now()) == DecelStart::NoOp {
                return;
            }
            self.with_stats(|st| st.pending_decel += 1);
        }

        let serial = conn.serial();
        let rule = RuleBuilder::new(&self.cfg, self.devs.as_ref())
            .build_destroy(conn);
        self.pin(conn);
        let res = self.engine.tx_destroy(serial, &rule);
        ae_tx_probe(serial, Cmd::Destroy, res.is_ok());

        match res {
            Ok(()) => fe.lock().tx_ok(),

            Err(e) => {
                self.unpin(serial);
                let mode = {
                    let mut s = fe.lock();
                    let mode = s.decel_tx_failed();
                    self.with_stats(|st| {
                        st.pending_decel -= 1;
                        st.driver_fail += 1;
                        // The flow leaves the offloaded states without
                        // the engine confirming it.
                        if mode == AccelMode::FailDriver {
                            st.accel_down(fe.proto());
                        }
                    });
                    mode
                };
                self.log(
                    LogLevel::Warn,
                    &format!("flow {serial}: destroy not sent ({e}), now {mode}"),
                );
            }
        }
    }

    /// Handle the engine's answer to a destroy command.
    pub fn destroy_resp(&self, resp: &AeResponse) {
        ae_resp_probe(resp.serial, Cmd::Destroy, resp.status.is_ack());
        let Some(conn) = self.unpin(resp.serial) else {
            self.log(
                LogLevel::Error,
                &format!("destroy response for unknown flow {}", resp.serial),
            );
            return;
        };

        let fe = conn.fe();
        let mut s = fe.lock();
        self.cmd_done(&mut s, Cmd::Destroy);
        let resolved = s.destroy_resp(resp.status.is_ack());
        self.with_stats(|st| {
            st.pending_decel -= 1;
            if resolved.is_some() {
                st.accel_down(fe.proto());
            }
        });
    }

    /// The engine stopped accelerating the flow `serial` on its own.
    pub fn accel_ceased(&self, serial: Serial) {
        let Some(conn) = self.db.find_by_serial(serial) else {
            return;
        };

        let fe = conn.fe();
        let mut s = fe.lock();
        match s.ceased() {
            Ceased::Deferred => self.with_stats(|st| st.flush += 1),
            Ceased::Ignored => {}
            Ceased::Ended(_) => self.with_stats(|st| {
                st.ceased += 1;
                st.accel_down(fe.proto());
            }),
        }
    }

    /// The flow's traffic showed progress while offloaded.
    pub fn action_seen(&self, conn: &Conn) {
        conn.fe().lock().action_seen();
    }

    pub fn accel_state_get(&self, conn: &Conn) -> AccelMode {
        conn.fe().mode()
    }

    pub fn dump(&self, conn: &Conn) -> FrontEndDump {
        conn.fe().dump()
    }

    /// React to `conn` being marked defunct. This is the callback
    /// registered with every flow the session creates.
    fn defunct(&self, conn: &Arc<Conn>) {
        let action = conn.fe().lock().defunct();
        if action == DefunctAction::Decelerate {
            self.decelerate(conn);
        }
    }

    /// Remove `conn` from the directory and mark it defunct.
    pub fn make_defunct(&self, conn: &Arc<Conn>) {
        self.db.remove(conn);
        conn.make_defunct();
    }

    /// Mark every flow defunct.
    pub fn defunct_all(&self) {
        for conn in self.db.flows() {
            self.make_defunct(&conn);
        }
    }

    /// Reap flows idle beyond their timer group. Returns how many were
    /// reaped.
    pub fn expire(&self, now: Moment) -> usize {
        let gone = self.db.expire(now).len();
        self.with_stats(|s| s.flows_expired += gone as u64);
        gone
    }

    /// Flag every flow's topology as out of date.
    pub fn mark_regen_all(&self) {
        self.db.mark_regen_all();
    }

    /// Replace `conn`'s interface stacks after a topology change. The
    /// flow is decelerated first: whatever the engine holds for it
    /// describes the old topology.
    pub fn regenerate(&self, conn: &Arc<Conn>, ifaces: IfaceLists) {
        self.decelerate(conn);
        conn.set_ifaces(ifaces);
    }

    /// Stop accepting new flows and decelerate every existing one.
    pub fn terminate(&self) {
        self.globals.lock().terminate_pending = true;
        self.log(LogLevel::Note, "terminating");
        for conn in self.db.flows() {
            self.decelerate(&conn);
        }
    }

    pub fn is_terminating(&self) -> bool {
        self.globals.lock().terminate_pending
    }
}

fn rule_build_fail_probe(serial: Serial, err: &RuleError) {
    cfg_if! {
        if #[cfg(feature = "usdt")] {
            crate::offload_provider::rule__build__fail!(
                || (serial.0, err.to_string())
            );
        } else {
            let (_, _) = (serial, err);
        }
    }
}

fn ae_tx_probe(serial: Serial, cmd: Cmd, ok: bool) {
    cfg_if! {
        if #[cfg(feature = "usdt")] {
            crate::offload_provider::ae__tx!(
                || (serial.0, cmd.as_str(), u8::from(ok))
            );
        } else {
            let (_, _, _) = (serial, cmd, ok);
        }
    }
}

fn ae_resp_probe(serial: Serial, cmd: Cmd, ack: bool) {
    cfg_if! {
        if #[cfg(feature = "usdt")] {
            crate::offload_provider::ae__resp!(
                || (serial.0, cmd.as_str(), u8::from(ack))
            );
        } else {
            let (_, _, _) = (serial, cmd, ack);
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::api::FlowDirection;
    use crate::api::MacAddr;
    use crate::engine::AeStatus;
    use crate::engine::TxError;
    use crate::engine::conn::Endpoint;
    use crate::engine::conn::FlowNodes;
    use crate::engine::conn::FlowTuple;
    use crate::engine::iface::Iface;
    use crate::engine::iface::IfaceInfo;
    use crate::engine::iface::IfaceList;
    use crate::engine::iface::NoDevices;
    use crate::engine::rule::CreateRule;
    use crate::engine::rule::DestroyRule;
    use crate::engine::rule::RuleTuple;
    use crate::provider::NullLog;
    use std::boxed::Box;
    use std::net::Ipv4Addr;

    #[derive(Default)]
    struct Recorder {
        fail: KMutex<bool>,
        sent: KMutex<Vec<(Serial, Cmd)>>,
    }

    impl AccelEngine for Recorder {
        fn tx_create(
            &self,
            serial: Serial,
            _rule: &CreateRule,
        ) -> Result<(), TxError> {
            if *self.fail.lock() {
                return Err(TxError::ChannelFull);
            }
            self.sent.lock().push((serial, Cmd::Create));
            Ok(())
        }

        fn tx_destroy(
            &self,
            serial: Serial,
            _rule: &DestroyRule,
        ) -> Result<(), TxError> {
            if *self.fail.lock() {
                return Err(TxError::ChannelFull);
            }
            self.sent.lock().push((serial, Cmd::Destroy));
            Ok(())
        }
    }

    fn mgr(cfg: OffloadCfg) -> (Arc<OffloadMgr>, Arc<Recorder>) {
        let engine = Arc::new(Recorder::default());
        let ectx = Arc::new(ExecCtx { log: Box::new(NullLog) });
        let mgr =
            OffloadMgr::new("ae0", ectx, cfg, engine.clone(), Arc::new(NoDevices))
                .unwrap();
        (mgr, engine)
    }

    fn eth(ae: i32) -> IfaceList {
        let mac = MacAddr::from_const([2, 0, 0, 0, 0, ae as u8]);
        let iface = Iface {
            name: "eth".into(),
            ifindex: ae as u32,
            ae_ifnum: Some(ae),
            mtu: 1500,
            info: IfaceInfo::Ethernet { mac },
        };
        IfaceList::from_slice(&[Arc::new(iface)]).unwrap()
    }

    fn pkt(sport: u16) -> PacketCtx {
        let from =
            Endpoint { addr: Ipv4Addr::new(10, 0, 0, 1).into(), port: sport };
        let to = Endpoint { addr: Ipv4Addr::new(10, 0, 0, 2).into(), port: 80 };
        PacketCtx {
            tuple: FlowTuple::new(Protocol::TCP, from, to),
            nodes: FlowNodes::default(),
            ifaces: IfaceLists { from: eth(1), to: eth(2), ..Default::default() },
            direction: FlowDirection::NonNat,
            is_routed: true,
            is_l2_encap: false,
            can_accel: true,
            priority: 0,
            src: from.addr,
            len: 60,
        }
    }

    fn ack(serial: Serial) -> AeResponse {
        let ip = Ipv4Addr::UNSPECIFIED.into();
        let tuple = RuleTuple {
            proto: Protocol::TCP,
            flow_ip: ip,
            flow_ident: 0,
            return_ip: ip,
            return_ident: 0,
        };
        AeResponse { serial, status: AeStatus::Ack, tuple }
    }

    #[test]
    fn accelerate_and_back() {
        let (mgr, engine) = mgr(OffloadCfg::default());
        assert_eq!(mgr.process_packet(&pkt(1000)), FwdDecision::Pass);
        let conn = mgr.find(&pkt(1000).tuple.key()).unwrap();
        assert_eq!(mgr.accel_state_get(&conn), AccelMode::AccelPending);
        assert_eq!(mgr.inflight_count(), 1);

        // A second packet while pending sends nothing.
        mgr.process_packet(&pkt(1000));
        assert_eq!(engine.sent.lock().len(), 1);

        mgr.create_resp(&ack(conn.serial()));
        assert_eq!(mgr.accel_state_get(&conn), AccelMode::Accel);
        let stats = mgr.stats();
        assert_eq!(stats.accelerated, 1);
        assert_eq!(stats.ported_accelerated, 1);
        assert_eq!(stats.accel_cmds, 1);

        mgr.decelerate(&conn);
        mgr.decelerate(&conn);
        assert_eq!(mgr.accel_state_get(&conn), AccelMode::DecelPending);
        assert_eq!(mgr.stats().pending_decel, 1);

        mgr.destroy_resp(&ack(conn.serial()));
        assert_eq!(mgr.accel_state_get(&conn), AccelMode::Decel);
        let stats = mgr.stats();
        assert_eq!(stats.accelerated, 0);
        assert_eq!(stats.pending_decel, 0);
        assert_eq!(mgr.inflight_count(), 0);
        assert_eq!(engine.sent.lock().len(), 2);
    }

    #[test]
    fn zero_port_tcp_denied() {
        let (mgr, engine) = mgr(OffloadCfg::default());
        mgr.process_packet(&pkt(0));
        let conn = mgr.find(&pkt(0).tuple.key()).unwrap();
        assert_eq!(mgr.accel_state_get(&conn), AccelMode::Denied);
        assert!(engine.sent.lock().is_empty());
    }

    #[test]
    fn accel_limit_respected() {
        let cfg = OffloadCfg { accel_limit: Some(1), ..Default::default() };
        let (mgr, _engine) = mgr(cfg);
        mgr.process_packet(&pkt(1));
        let a = mgr.find(&pkt(1).tuple.key()).unwrap();
        mgr.create_resp(&ack(a.serial()));

        mgr.process_packet(&pkt(2));
        let b = mgr.find(&pkt(2).tuple.key()).unwrap();
        assert_eq!(mgr.accel_state_get(&b), AccelMode::Decel);
        assert_eq!(mgr.stats().accel_limited, 1);
    }

    #[test]
    fn accel_limit_counts_outstanding_creates() {
        let cfg = OffloadCfg { accel_limit: Some(1), ..Default::default() };
        let (mgr, engine) = mgr(cfg);
        mgr.process_packet(&pkt(1));
        mgr.process_packet(&pkt(2));
        let a = mgr.find(&pkt(1).tuple.key()).unwrap();
        let b = mgr.find(&pkt(2).tuple.key()).unwrap();
        assert_eq!(mgr.accel_state_get(&a), AccelMode::AccelPending);
        assert_eq!(mgr.accel_state_get(&b), AccelMode::Decel);
        assert_eq!(engine.sent.lock().len(), 1);

        let stats = mgr.stats();
        assert_eq!(stats.accel_pending, 1);
        assert_eq!(stats.accel_limited, 1);

        mgr.create_resp(&ack(a.serial()));
        let stats = mgr.stats();
        assert_eq!(stats.accelerated, 1);
        assert_eq!(stats.accel_pending, 0);
    }

    #[test]
    fn tx_failure_unpins() {
        let (mgr, engine) = mgr(OffloadCfg::default());
        *engine.fail.lock() = true;
        mgr.process_packet(&pkt(1));
        let conn = mgr.find(&pkt(1).tuple.key()).unwrap();
        assert_eq!(mgr.accel_state_get(&conn), AccelMode::Decel);
        assert_eq!(mgr.inflight_count(), 0);
        assert_eq!(mgr.stats().driver_fail, 1);
        assert_eq!(mgr.stats().accel_pending, 0);
        assert_eq!(conn.fe().dump().driver_fail.count, 1);
    }

    #[test]
    fn stray_response_ignored() {
        let (mgr, _engine) = mgr(OffloadCfg::default());
        mgr.create_resp(&ack(Serial(42)));
        mgr.destroy_resp(&ack(Serial(42)));
        mgr.accel_ceased(Serial(42));
        assert_eq!(mgr.stats(), OffloadStatsSnap::default());
    }

    #[test]
    fn terminate_refuses_new_flows() {
        let (mgr, engine) = mgr(OffloadCfg::default());
        mgr.process_packet(&pkt(1));
        let conn = mgr.find(&pkt(1).tuple.key()).unwrap();
        mgr.create_resp(&ack(conn.serial()));

        mgr.terminate();
        assert!(mgr.is_terminating());
        assert_eq!(mgr.accel_state_get(&conn), AccelMode::DecelPending);
        assert_eq!(mgr.process_packet(&pkt(2)), FwdDecision::Pass);
        assert!(mgr.find(&pkt(2).tuple.key()).is_none());
        assert_eq!(engine.sent.lock().len(), 2);

        // Once withdrawn, the flow is not offered to the engine again.
        mgr.destroy_resp(&ack(conn.serial()));
        mgr.process_packet(&pkt(1));
        assert_eq!(mgr.accel_state_get(&conn), AccelMode::Decel);
        assert_eq!(engine.sent.lock().len(), 2);
        assert_eq!(mgr.stats().accel_pending, 0);
    }
}
