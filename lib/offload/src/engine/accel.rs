// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

// Copyright 2025 Oxide Computer Company

//! The per-flow acceleration state machine.
//!
//! A [`FrontEnd`] holds the [`AccelMode`] of one flow together with
//! the counters bounding its retries. All of it lives behind the
//! front end's own lock; the transition methods on [`FeState`] are
//! called with that lock held and report what the caller must do
//! next (update module-wide counters, transmit, decelerate). They
//! never touch anything outside the flow.
use super::conn::Serial;
use crate::api::AccelLimits;
use crate::api::AccelMode;
use crate::api::BoundedCount;
use crate::api::FrontEndDump;
use crate::api::Protocol;
use crate::ddi::sync::KMutex;
use crate::ddi::sync::KMutexGuard;
use crate::ddi::time::Moment;

/// The acceleration state of one flow.
#[derive(Debug)]
pub struct FeState {
    serial: Serial,
    mode: AccelMode,
    /// A decelerate was asked for while a create was outstanding.
    pub decelerate_pending: bool,
    /// The engine reported the flow gone while a create was
    /// outstanding. Its eventual ack is treated as a cessation.
    pub flush_happened: bool,
    pub flush_happened_total: u64,
    pub is_defunct: bool,

    pub no_action_seen: u32,
    pub no_action_seen_total: u64,
    pub no_action_seen_limit: u32,

    pub driver_fail: u32,
    pub driver_fail_total: u64,
    pub driver_fail_limit: u32,

    pub ae_nack: u32,
    pub ae_nack_total: u64,
    pub ae_nack_limit: u32,

    /// When the outstanding command was issued.
    pub cmd_time_begun: Option<Moment>,
}

/// How an acked create resolved.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum CreateAck {
    /// The flow is now offloaded. If `decelerate` is set a decelerate
    /// arrived while the create was outstanding and must be started
    /// now.
    Accelerated { decelerate: bool },
    /// The engine flushed the flow before its ack arrived; the flow
    /// was never really offloaded.
    Flushed(AccelMode),
}

/// What a decelerate request should do.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum DecelStart {
    /// Send a destroy rule; the flow is now `DecelPending`.
    Start,
    /// Nothing to do now. Either the flow isn't offloaded, a
    /// deceleration is already underway, or it was deferred until
    /// the outstanding create resolves.
    NoOp,
}

/// What an engine-initiated cessation did.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum Ceased {
    /// Recorded against the outstanding create.
    Deferred,
    /// The flow wasn't offloaded.
    Ignored,
    /// The flow left the offloaded state for this mode.
    Ended(AccelMode),
}

/// What a defunct notice requires.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum DefunctAction {
    None,
    Decelerate,
}

impl FeState {
    fn new(serial: Serial, can_accel: bool, limits: &AccelLimits) -> Self {
        Self {
            serial,
            mode: if can_accel { AccelMode::Decel } else { AccelMode::Denied },
            decelerate_pending: false,
            flush_happened: false,
            flush_happened_total: 0,
            is_defunct: false,
            no_action_seen: 0,
            no_action_seen_total: 0,
            no_action_seen_limit: limits.no_action_limit,
            driver_fail: 0,
            driver_fail_total: 0,
            driver_fail_limit: limits.driver_fail_limit,
            ae_nack: 0,
            ae_nack_total: 0,
            ae_nack_limit: limits.ae_nack_limit,
            cmd_time_begun: None,
        }
    }

    pub fn mode(&self) -> AccelMode {
        self.mode
    }

    fn set_mode(&mut self, mode: AccelMode) {
        if self.mode != mode {
            mode_probe(self.serial, self.mode, mode);
            self.mode = mode;
        }
    }

    /// A defunct flow can only come to rest in `FailDefunct`.
    fn settle(&self, mode: AccelMode) -> AccelMode {
        if self.is_defunct && mode != AccelMode::Accel {
            AccelMode::FailDefunct
        } else {
            mode
        }
    }

    /// Resolve an outstanding create into `mode`. Returns whether a
    /// decelerate was deferred and must now be started, which is only
    /// possible if the flow ended up offloaded.
    ///
    /// A flush noted against this create dies with it.
    fn pending_clear(&mut self, mode: AccelMode) -> bool {
        let deferred = self.decelerate_pending;
        self.decelerate_pending = false;
        self.flush_happened = false;
        self.set_mode(mode);
        deferred && mode == AccelMode::Accel
    }

    /// Enter `AccelPending`. Only a flow in `Decel` may do so.
    pub fn accel_pending_set(&mut self, now: Moment) -> bool {
        if self.mode != AccelMode::Decel {
            return false;
        }
        self.set_mode(AccelMode::AccelPending);
        self.cmd_time_begun = Some(now);
        true
    }

    /// Abandon a create before it was sent, e.g. because the topology
    /// moved under the rule.
    pub fn accel_abandon(&mut self, mode: AccelMode) {
        let mode = self.settle(mode);
        self.pending_clear(mode);
        self.cmd_time_begun = None;
    }

    /// A command reached the engine's channel.
    pub fn tx_ok(&mut self) {
        self.driver_fail = 0;
    }

    fn driver_failed(&mut self) -> bool {
        self.driver_fail += 1;
        self.driver_fail_total += 1;
        self.driver_fail >= self.driver_fail_limit
    }

    /// The create could not be handed to the engine.
    pub fn create_tx_failed(&mut self) -> AccelMode {
        let mode = if self.driver_failed() {
            AccelMode::FailDriver
        } else {
            AccelMode::Decel
        };
        let mode = self.settle(mode);
        self.pending_clear(mode);
        self.cmd_time_begun = None;
        mode
    }

    /// The engine rejected the create.
    pub fn create_nack(&mut self) -> AccelMode {
        self.ae_nack += 1;
        self.ae_nack_total += 1;
        let mode = if self.ae_nack >= self.ae_nack_limit {
            AccelMode::FailAccelEngine
        } else {
            AccelMode::Decel
        };
        let mode = self.settle(mode);
        self.pending_clear(mode);
        mode
    }

    /// The engine installed the create.
    pub fn create_ack(&mut self) -> CreateAck {
        if self.flush_happened {
            self.no_action_seen += 1;
            let mode = self.settle(AccelMode::Decel);
            self.pending_clear(mode);
            return CreateAck::Flushed(mode);
        }

        self.ae_nack = 0;
        let decelerate = self.pending_clear(AccelMode::Accel);
        if !decelerate {
            // Reset when the flow is seen making progress.
            self.no_action_seen += 1;
        }
        CreateAck::Accelerated { decelerate }
    }

    /// Begin deceleration.
    pub fn decel_begin(&mut self, now: Moment) -> DecelStart {
        if self.decelerate_pending {
            return DecelStart::NoOp;
        }

        if self.mode == AccelMode::AccelPending {
            self.decelerate_pending = true;
            return DecelStart::NoOp;
        }

        if self.mode != AccelMode::Accel {
            return DecelStart::NoOp;
        }

        self.set_mode(AccelMode::DecelPending);
        self.cmd_time_begun = Some(now);
        DecelStart::Start
    }

    /// The destroy could not be handed to the engine. The rule is still
    /// installed, so below the limit the flow stays offloaded.
    pub fn decel_tx_failed(&mut self) -> AccelMode {
        let mode = if self.driver_failed() {
            AccelMode::FailDriver
        } else {
            AccelMode::Accel
        };
        self.set_mode(mode);
        self.cmd_time_begun = None;
        mode
    }

    /// The engine answered the destroy. Returns the resulting mode, or
    /// `None` if the flow was not waiting on one.
    pub fn destroy_resp(&mut self, ack: bool) -> Option<AccelMode> {
        if self.mode != AccelMode::DecelPending {
            return None;
        }

        let mode = if ack { AccelMode::Decel } else { AccelMode::FailDecel };
        let mode = self.settle(mode);
        self.set_mode(mode);
        Some(mode)
    }

    /// The engine stopped accelerating the flow of its own accord.
    pub fn ceased(&mut self) -> Ceased {
        if self.mode == AccelMode::AccelPending {
            self.flush_happened = true;
            self.flush_happened_total += 1;
            return Ceased::Deferred;
        }

        if self.mode != AccelMode::Accel {
            return Ceased::Ignored;
        }

        if self.no_action_seen > 0 {
            self.no_action_seen_total += 1;
        }

        let mode = if self.no_action_seen >= self.no_action_seen_limit {
            AccelMode::FailNoAction
        } else {
            AccelMode::Decel
        };
        let mode = self.settle(mode);
        self.set_mode(mode);
        Ceased::Ended(mode)
    }

    /// The flow was marked defunct.
    pub fn defunct(&mut self) -> DefunctAction {
        if self.is_defunct {
            return DefunctAction::None;
        }
        self.is_defunct = true;

        match self.mode {
            m if m.is_fail() => DefunctAction::None,
            AccelMode::Decel => {
                self.set_mode(AccelMode::FailDefunct);
                DefunctAction::None
            }
            AccelMode::DecelPending => DefunctAction::None,
            _ => DefunctAction::Decelerate,
        }
    }

    /// The flow showed signs of progress while offloaded.
    pub fn action_seen(&mut self) {
        self.no_action_seen = 0;
    }
}

/// The acceleration front end of one flow.
pub struct FrontEnd {
    proto: Protocol,
    can_accel: bool,
    state: KMutex<FeState>,
}

impl FrontEnd {
    pub fn new(
        serial: Serial,
        proto: Protocol,
        can_accel: bool,
        limits: &AccelLimits,
    ) -> Self {
        Self {
            proto,
            can_accel,
            state: KMutex::new(FeState::new(serial, can_accel, limits)),
        }
    }

    pub fn proto(&self) -> Protocol {
        self.proto
    }

    pub fn can_accel(&self) -> bool {
        self.can_accel
    }

    pub fn mode(&self) -> AccelMode {
        self.state.lock().mode
    }

    /// Acquire the front end's lock.
    pub fn lock(&self) -> KMutexGuard<'_, FeState> {
        self.state.lock()
    }

    pub fn dump(&self) -> FrontEndDump {
        let s = self.state.lock();
        FrontEndDump {
            serial: s.serial.0,
            can_accel: self.can_accel,
            mode: s.mode,
            decelerate_pending: s.decelerate_pending,
            flush_happened_total: s.flush_happened_total,
            no_action_seen: BoundedCount {
                count: s.no_action_seen,
                total: s.no_action_seen_total,
                limit: s.no_action_seen_limit,
            },
            driver_fail: BoundedCount {
                count: s.driver_fail,
                total: s.driver_fail_total,
                limit: s.driver_fail_limit,
            },
            ae_nack: BoundedCount {
                count: s.ae_nack,
                total: s.ae_nack_total,
                limit: s.ae_nack_limit,
            },
        }
    }
}

fn mode_probe(serial: Serial, from: AccelMode, to: AccelMode) {
    cfg_if! {
        if #[cfg(feature = "usdt")] {
            use std::string::ToString;
            crate::offload_provider::accel__mode!(
                || (serial.0, from.to_string(), to.to_string())
            );
        } else {
            let (_, _, _) = (serial, from, to);
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;

    fn st(limits: AccelLimits) -> FeState {
        FeState::new(Serial(1), true, &limits)
    }

    fn accelerated() -> FeState {
        let mut s = st(AccelLimits::default());
        assert!(s.accel_pending_set(Moment::now()));
        assert_eq!(s.create_ack(), CreateAck::Accelerated { decelerate: false });
        s
    }

    #[test]
    fn denied_never_accelerates() {
        let mut s = FeState::new(Serial(1), false, &AccelLimits::default());
        assert_eq!(s.mode(), AccelMode::Denied);
        assert!(!s.accel_pending_set(Moment::now()));
        assert_eq!(s.defunct(), DefunctAction::None);
        assert_eq!(s.mode(), AccelMode::Denied);
    }

    #[test]
    fn nack_limit_boundary() {
        let limits = AccelLimits { ae_nack_limit: 3, ..Default::default() };
        let mut s = st(limits);
        for _ in 0..2 {
            assert!(s.accel_pending_set(Moment::now()));
            assert_eq!(s.create_nack(), AccelMode::Decel);
        }
        assert!(s.accel_pending_set(Moment::now()));
        assert_eq!(s.create_nack(), AccelMode::FailAccelEngine);
        assert!(!s.accel_pending_set(Moment::now()));
        assert_eq!(s.ae_nack_total, 3);
    }

    #[test]
    fn ack_resets_nack() {
        let mut s = st(AccelLimits::default());
        s.accel_pending_set(Moment::now());
        s.create_nack();
        s.accel_pending_set(Moment::now());
        s.create_ack();
        assert_eq!(s.ae_nack, 0);
        assert_eq!(s.ae_nack_total, 1);
        assert_eq!(s.mode(), AccelMode::Accel);
    }

    #[test]
    fn decelerate_while_pending_deferred() {
        let mut s = st(AccelLimits::default());
        s.accel_pending_set(Moment::now());
        assert_eq!(s.decel_begin(Moment::now()), DecelStart::NoOp);
        assert!(s.decelerate_pending);
        assert_eq!(s.decel_begin(Moment::now()), DecelStart::NoOp);
        assert_eq!(s.create_ack(), CreateAck::Accelerated { decelerate: true });
        assert!(!s.decelerate_pending);
        assert_eq!(s.decel_begin(Moment::now()), DecelStart::Start);
        assert_eq!(s.mode(), AccelMode::DecelPending);
    }

    #[test]
    fn deferred_decel_dropped_on_nack() {
        let mut s = st(AccelLimits::default());
        s.accel_pending_set(Moment::now());
        s.decel_begin(Moment::now());
        assert_eq!(s.create_nack(), AccelMode::Decel);
        assert!(!s.decelerate_pending);
    }

    #[test]
    fn decelerate_idempotent() {
        let mut s = accelerated();
        assert_eq!(s.decel_begin(Moment::now()), DecelStart::Start);
        assert_eq!(s.decel_begin(Moment::now()), DecelStart::NoOp);
        assert_eq!(s.destroy_resp(true), Some(AccelMode::Decel));
        assert_eq!(s.destroy_resp(true), None);
        assert_eq!(s.decel_begin(Moment::now()), DecelStart::NoOp);
    }

    #[test]
    fn destroy_nack_fails() {
        let mut s = accelerated();
        s.decel_begin(Moment::now());
        assert_eq!(s.destroy_resp(false), Some(AccelMode::FailDecel));
    }

    #[test]
    fn flush_before_ack() {
        let mut s = st(AccelLimits::default());
        s.accel_pending_set(Moment::now());
        assert_eq!(s.ceased(), Ceased::Deferred);
        assert_eq!(s.create_ack(), CreateAck::Flushed(AccelMode::Decel));
        assert!(!s.flush_happened);
        assert_eq!(s.flush_happened_total, 1);
        assert_eq!(s.no_action_seen, 1);
    }

    #[test]
    fn flush_does_not_outlive_unsent_create() {
        let mut s = st(AccelLimits::default());
        s.accel_pending_set(Moment::now());
        assert_eq!(s.ceased(), Ceased::Deferred);
        assert_eq!(s.create_tx_failed(), AccelMode::Decel);
        assert!(!s.flush_happened);

        assert!(s.accel_pending_set(Moment::now()));
        assert_eq!(s.create_ack(), CreateAck::Accelerated { decelerate: false });
        assert_eq!(s.mode(), AccelMode::Accel);
        assert_eq!(s.flush_happened_total, 1);
    }

    #[test]
    fn flush_does_not_outlive_abandoned_create() {
        let mut s = st(AccelLimits::default());
        s.accel_pending_set(Moment::now());
        assert_eq!(s.ceased(), Ceased::Deferred);
        s.accel_abandon(AccelMode::Decel);
        assert!(!s.flush_happened);
        assert_eq!(s.mode(), AccelMode::Decel);

        assert!(s.accel_pending_set(Moment::now()));
        assert_eq!(s.create_ack(), CreateAck::Accelerated { decelerate: false });
        assert_eq!(s.mode(), AccelMode::Accel);
    }

    #[test]
    fn no_action_limit() {
        let limits = AccelLimits { no_action_limit: 2, ..Default::default() };
        let mut s = st(limits);
        s.accel_pending_set(Moment::now());
        s.create_ack();
        assert_eq!(s.ceased(), Ceased::Ended(AccelMode::Decel));
        s.accel_pending_set(Moment::now());
        s.create_ack();
        assert_eq!(s.ceased(), Ceased::Ended(AccelMode::FailNoAction));
        assert_eq!(s.no_action_seen_total, 2);
    }

    #[test]
    fn action_seen_resets_no_action() {
        let limits = AccelLimits { no_action_limit: 2, ..Default::default() };
        let mut s = st(limits);
        for _ in 0..4 {
            s.accel_pending_set(Moment::now());
            s.create_ack();
            s.action_seen();
            assert_eq!(s.ceased(), Ceased::Ended(AccelMode::Decel));
        }
        assert_eq!(s.no_action_seen_total, 0);
    }

    #[test]
    fn driver_fail_paths() {
        let limits = AccelLimits { driver_fail_limit: 2, ..Default::default() };
        let mut s = st(limits);
        s.accel_pending_set(Moment::now());
        assert_eq!(s.create_tx_failed(), AccelMode::Decel);
        s.accel_pending_set(Moment::now());
        s.tx_ok();
        s.create_ack();
        assert_eq!(s.driver_fail, 0);

        s.decel_begin(Moment::now());
        assert_eq!(s.decel_tx_failed(), AccelMode::Accel);
        s.decel_begin(Moment::now());
        assert_eq!(s.decel_tx_failed(), AccelMode::FailDriver);
    }

    #[test]
    fn defunct_transitions() {
        let mut s = st(AccelLimits::default());
        assert_eq!(s.defunct(), DefunctAction::None);
        assert_eq!(s.mode(), AccelMode::FailDefunct);

        let mut s = accelerated();
        assert_eq!(s.defunct(), DefunctAction::Decelerate);
        assert_eq!(s.defunct(), DefunctAction::None);

        let mut s = accelerated();
        s.decel_begin(Moment::now());
        assert_eq!(s.defunct(), DefunctAction::None);
        assert_eq!(s.destroy_resp(true), Some(AccelMode::FailDefunct));
    }

    #[test]
    fn defunct_while_pending_then_nack() {
        let mut s = st(AccelLimits::default());
        s.accel_pending_set(Moment::now());
        assert_eq!(s.defunct(), DefunctAction::Decelerate);
        s.decel_begin(Moment::now());
        assert_eq!(s.create_nack(), AccelMode::FailDefunct);
        assert_eq!(s.ae_nack, 1);
    }
}
