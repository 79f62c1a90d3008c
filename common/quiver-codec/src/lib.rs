// Copyright the quiver authors. All Rights Reserved.
// SPDX-License-Identifier: Apache-2.0

//! Bounds-checked wire serialization for untrusted input
//!
//! Every parser in the endpoint core feeds on bytes an attacker controls,
//! so this crate never indexes a slice without proving the access first:
//! decoding consumes a [`DecoderBuffer`] by value and hands back the tail,
//! making it impossible to read the same bytes twice or skip a length
//! check. Encoding mirrors the same idea with a positioned [`EncoderBuffer`]
//! and a size-only [`SizeEstimator`] sharing one [`Encoder`] trait.

#![forbid(unsafe_code)]
#![cfg_attr(all(not(test), not(feature = "std")), no_std)]

#[cfg(feature = "alloc")]
extern crate alloc;

#[cfg(any(feature = "testing", test))]
pub mod testing;

pub mod decoder;
pub mod encoder;

pub use decoder::*;
pub use encoder::*;

use core::fmt;

/// The ways untrusted bytes can fail to parse
///
/// The taxonomy matches how callers recover: `Truncated` means wait for or
/// drop the datagram, everything else means the peer broke the format and
/// the surrounding handshake or connection fails.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CodecError {
    /// The input ended before `needed` more bytes were available
    Truncated(usize),
    /// Decoding finished but `remaining` bytes were left over
    TrailingBytes(usize),
    /// A length prefix cannot be represented in the platform's `usize`
    LengthOverflow,
    /// The bytes violate the format's rules
    Malformed(&'static str),
}

impl fmt::Display for CodecError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            Self::Truncated(needed) => write!(f, "input truncated, needed {needed} bytes"),
            Self::TrailingBytes(remaining) => {
                write!(f, "{remaining} bytes left over after decoding")
            }
            Self::LengthOverflow => write!(f, "length prefix exceeds the address space"),
            Self::Malformed(reason) => write!(f, "{reason}"),
        }
    }
}

#[cfg(feature = "std")]
impl std::error::Error for CodecError {}

impl From<CodecError> for &'static str {
    fn from(error: CodecError) -> Self {
        match error {
            CodecError::Truncated(_) => "input truncated",
            CodecError::TrailingBytes(_) => "bytes left over after decoding",
            CodecError::LengthOverflow => "length prefix exceeds the address space",
            CodecError::Malformed(reason) => reason,
        }
    }
}

/// Fails a decode with [`CodecError::Malformed`] unless the condition holds
///
/// The message should state the format rule that was broken.
#[macro_export]
macro_rules! malformed {
    ($cond:expr, $message:expr) => {
        if !($cond) {
            return Err($crate::CodecError::Malformed($message).into());
        }
    };
}
