// Copyright the quiver authors. All Rights Reserved.
// SPDX-License-Identifier: Apache-2.0

#![cfg_attr(not(any(test, feature = "std")), no_std)]

extern crate alloc;

/// Checks that the condition holds, otherwise returns the given value
///
/// This is used instead of deeply nested conditionals to keep the main flow
/// of a function at the left margin.
macro_rules! ensure {
    ($cond:expr) => {
        ensure!($cond, ());
    };
    ($cond:expr, $otherwise:expr) => {
        if !($cond) {
            return $otherwise;
        }
    };
}

/// Documents an invariant the caller is expected to uphold
///
/// In debug builds the invariant is asserted.
macro_rules! assume {
    ($cond:expr) => {
        assume!($cond, "assumption failed: {}", stringify!($cond));
    };
    ($cond:expr, $($fmt:tt)*) => {
        debug_assert!($cond, $($fmt)*);
    };
}

/// Emits a structured trace event when the `event-tracing` feature is enabled
///
/// Compiles to nothing otherwise, keeping the hot path free of formatting.
macro_rules! probe {
    ($($fields:tt)*) => {
        #[cfg(feature = "event-tracing")]
        {
            tracing::trace!($($fields)*);
        }
    };
}

pub mod buffer;
pub mod builder;
pub mod connection;
pub mod counter;
pub mod crypto;
pub mod frame;
pub mod packet;
pub mod partition;
pub mod path;
pub mod range;
pub mod recovery;
pub mod time;
pub mod transmission;
pub mod transport;
pub mod varint;
pub mod window;
