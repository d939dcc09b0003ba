// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

// Copyright 2025 Oxide Computer Company

//! Named 64-bit statistics.
//!
//! Counters are grouped into a provider struct whose fields are all
//! [`KStatU64`], and the group is registered under a module/name pair
//! via [`KStatNamed`]. The names follow kstat rules so the same
//! providers can later be exported to a kstat-like facility unchanged.
use core::fmt;
use core::fmt::Display;
use std::boxed::Box;
use std::string::String;
use std::string::ToString;

/// Longest permitted kstat name, including the terminating NUL.
pub const KSTAT_STRLEN: usize = 31;

/// A provider of named kstats.
///
/// Rather than implementing this trait manually, the kstat-macro
/// should be used.
///
/// ```ignore
/// #[derive(KStatProvider)]
/// struct SomeStats {
///     cmds_out: KStatU64,
///     errors_out: KStatU64,
/// }
/// ```
///
/// To update the values use the `+=` and `-=` operators.
pub trait KStatProvider {
    const NUM_FIELDS: u32;
    type Snap;

    fn init(&mut self) -> Result<(), Error>;

    fn new() -> Self;

    fn num_fields(&self) -> u32 {
        Self::NUM_FIELDS
    }

    /// Return a snapshot of the stats. This is how you obtain a copy,
    /// as opposed to the traditional clone().
    fn snapshot(&self) -> Self::Snap;
}

/// An initialized [`KStatProvider`], registered under `module:name`.
pub struct KStatNamed<T: KStatProvider> {
    pub vals: Box<T>,
    module: String,
    name: String,
}

impl<T: KStatProvider> KStatNamed<T> {
    pub fn new(
        module: &str,
        name: &str,
        provider: T,
    ) -> Result<KStatNamed<T>, Error> {
        check_name(module)?;
        check_name(name)?;
        let mut vals = Box::new(provider);
        vals.init()?;
        Ok(Self { vals, module: module.to_string(), name: name.to_string() })
    }

    pub fn module(&self) -> &str {
        &self.module
    }

    pub fn name(&self) -> &str {
        &self.name
    }
}

fn check_name(name: &str) -> Result<(), Error> {
    if name.contains('\0') {
        return Err(Error::NulChar);
    }

    if name.len() + 1 > KSTAT_STRLEN {
        return Err(Error::NameTooLong(name.to_string()));
    }

    Ok(())
}

/// A 64-bit unsigned named kstat.
///
/// Subtraction saturates at zero: a counter tracking a population
/// must never wrap around to a huge value.
#[derive(Debug, Default)]
pub struct KStatU64 {
    value: u64,
}

impl KStatU64 {
    pub fn init(&mut self, name: &str) -> Result<(), Error> {
        check_name(name)
    }

    pub fn new() -> Self {
        Self { value: 0 }
    }

    pub fn set(&mut self, val: u64) {
        self.value = val;
    }

    pub fn val(&self) -> u64 {
        self.value
    }
}

impl core::ops::AddAssign<u64> for KStatU64 {
    #[inline]
    fn add_assign(&mut self, other: u64) {
        self.value = self.value.wrapping_add(other);
    }
}

impl core::ops::SubAssign<u64> for KStatU64 {
    #[inline]
    fn sub_assign(&mut self, other: u64) {
        self.value = self.value.saturating_sub(other);
    }
}

/// A kstat error.
#[derive(Clone, Debug, Eq, PartialEq)]
pub enum Error {
    NameTooLong(String),
    NulChar,
}

impl Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            Self::NameTooLong(name) => {
                write!(f, "kstat name too long: {}", name)
            }

            Self::NulChar => write!(f, "kstat name contains NUL char"),
        }
    }
}

impl std::error::Error for Error {}
