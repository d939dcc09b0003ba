// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

// Copyright 2025 Oxide Computer Company

//! Connection acceleration coordinator.
//!
//! Decides which tracked flows may be handed to a hardware fast path,
//! builds the engine rule describing each such flow, drives the
//! asynchronous create/destroy protocol with the engine, and unwinds
//! acceleration when a flow changes, fails, or dies. See
//! [`engine::session::OffloadMgr`] for the entry points.

#![allow(clippy::len_without_is_empty)]
#![deny(unreachable_patterns)]
#![deny(unused_must_use)]
// Enable features needed for USDT, if needed.
#![cfg_attr(all(feature = "usdt", not(usdt_stable_asm)), feature(asm))]
#![cfg_attr(
    all(feature = "usdt", target_os = "macos", not(usdt_stable_asm_sym)),
    feature(asm_sym)
)]

#[macro_use]
extern crate cfg_if;

// This is needed so that the kstat-macro (`#[derive(KStatProvider)]`)
// can use fully-qualified type paths.
extern crate self as offload;

use std::boxed::Box;

pub mod api;
pub mod ddi;
pub mod engine;
#[cfg(any(feature = "std", test))]
pub mod print;
pub mod provider;

/// The execution context handed to an offload session.
pub struct ExecCtx {
    pub log: Box<dyn provider::LogProvider>,
}

// ================================================================
// DTrace USDT Provider
//
// Probes for acceleration mode changes and engine traffic. A flow is
// named by its serial.
// ================================================================
#[cfg(feature = "usdt")]
#[usdt::provider]
mod offload_provider {
    fn accel__mode(serial: u64, from: &str, to: &str) {}
    fn rule__build__fail(serial: u64, err: &str) {}
    fn ae__tx(serial: u64, cmd: &str, ok: u8) {}
    fn ae__resp(serial: u64, cmd: &str, ack: u8) {}
    fn flow__expired(serial: u64, group: &str, idle_ms: u64) {}
}
