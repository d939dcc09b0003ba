// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

// Copyright 2025 Oxide Computer Company

//! Types shared between the offload coordinator and its consumers.

#![no_std]
#![deny(unreachable_patterns)]
#![deny(unused_must_use)]

#[cfg(any(feature = "std", test))]
#[macro_use]
extern crate std;

#[macro_use]
extern crate alloc;

pub mod cfg;
pub mod dump;
pub mod flow;
pub mod mac;
pub mod mode;

pub use cfg::*;
pub use dump::*;
pub use flow::*;
pub use mac::*;
pub use mode::*;

/// The overall version of the API. Anytime a type in this crate is
/// added, removed, or modified in a way visible to consumers, this
/// number should increment.
pub const API_VERSION: u64 = 1;
