// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

// Copyright 2025 Oxide Computer Company

//! Routines for verifying session-wide offload counters.

use offload::engine::session::OffloadStatsSnap;
use std::collections::BTreeMap;

/// The expected value of the session counters that track live state,
/// as opposed to ones that only ever count events. Manipulated by the
/// macros that follow and checked with [`assert_offload!`].
///
/// `accelerated`: flows the engine holds a rule for, split further
/// into `ported` and `non_ported`.
///
/// `pending_decel`: destroy commands awaiting an answer.
///
/// `inflight`: commands of either kind awaiting an answer.
pub struct OffloadState {
    pub counts: BTreeMap<String, u64>,
}

impl OffloadState {
    pub fn new() -> Self {
        Self {
            counts: BTreeMap::from(
                [
                    ("accelerated", 0),
                    ("ported", 0),
                    ("non_ported", 0),
                    ("pending_decel", 0),
                    ("inflight", 0),
                ]
                .map(|(name, val)| (name.to_string(), val)),
            ),
        }
    }
}

impl Default for OffloadState {
    fn default() -> Self {
        Self::new()
    }
}

/// Look up a tracked counter in a stats snapshot.
pub fn stat_field(snap: &OffloadStatsSnap, field: &str) -> u64 {
    match field {
        "accelerated" => snap.accelerated,
        "ported" => snap.ported_accelerated,
        "non_ported" => snap.non_ported_accelerated,
        "pending_decel" => snap.pending_decel,
        f => panic!("not a stats field: {f}"),
    }
}

/// Assert that the session's counters match the expected state.
#[macro_export]
macro_rules! assert_offload {
    ($ts:expr, $st:expr) => {
        let snap = $ts.mgr.stats();
        for (field, expected_val) in $st.counts.iter() {
            let actual_val = match field.as_str() {
                "inflight" => $ts.mgr.inflight_count() as u64,
                f => $crate::offload_state::stat_field(&snap, f),
            };
            assert!(
                *expected_val == actual_val,
                "field value mismatch: field: {}, expected: {}, actual: {}",
                field,
                expected_val,
                actual_val,
            );
        }
    };
}

/// Update the `OffloadState` and assert.
///
/// ```ignore
/// update!(ts, st, ["incr:accelerated,ported", "decr:inflight"]);
/// ```
#[macro_export]
macro_rules! update {
    ($ts:expr, $st:expr, $instructions:expr) => {
        for inst in $instructions {
            let (op, fields) = match inst.split_once(":") {
                Some(v) => v,
                None => panic!("malformed instruction: {}", inst),
            };

            for f in fields.split(",") {
                let v = match $st.counts.get_mut(f) {
                    Some(v) => v,
                    None => panic!("field does not exist: {}", f),
                };

                match op {
                    "incr" => *v += 1,
                    "decr" => *v -= 1,
                    "zero" => *v = 0,
                    _ => panic!("unknown op: {} instruction: {}", op, inst),
                }
            }
        }
        $crate::assert_offload!($ts, $st);
    };
}
