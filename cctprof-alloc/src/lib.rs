// Copyright 2024-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Memory for code that runs inside a sampling signal handler.
//!
//! The general-purpose heap may be interrupted mid-operation by the very
//! sample that wants to allocate, so everything the unwinder and the calling
//! context tree need at sample time comes from a [SharedArena]: one region of
//! pages reserved up front and handed out with an atomic bump pointer.

#![cfg_attr(not(test), no_std)]
#![cfg_attr(not(test), deny(clippy::panic))]
#![cfg_attr(not(test), deny(clippy::unwrap_used))]
#![cfg_attr(not(test), deny(clippy::expect_used))]
#![cfg_attr(not(test), deny(clippy::todo))]
#![cfg_attr(not(test), deny(clippy::unimplemented))]

extern crate alloc;

mod arena;
mod utils;
pub mod vec;
#[cfg(unix)]
mod virtual_alloc;

pub use arena::*;
#[cfg(unix)]
pub use virtual_alloc::*;

// Expose allocator_api2 for our users.
pub use allocator_api2::alloc::*;

/// The error type for `try_reserve` methods.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum TryReserveError {
    /// Error due to the computed capacity exceeding the collection's maximum
    /// (usually `isize::MAX` bytes).
    CapacityOverflow,

    /// The memory allocator returned an error.
    AllocError,
}

impl core::fmt::Display for TryReserveError {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        match self {
            TryReserveError::CapacityOverflow => f.write_str("capacity overflow"),
            TryReserveError::AllocError => f.write_str("arena exhausted"),
        }
    }
}

impl core::error::Error for TryReserveError {}

impl From<AllocError> for TryReserveError {
    fn from(_: AllocError) -> Self {
        TryReserveError::AllocError
    }
}
