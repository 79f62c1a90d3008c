// Copyright the quiver authors. All Rights Reserved.
// SPDX-License-Identifier: Apache-2.0

//! Connection identifiers

use core::fmt;
use quiver_codec::{impl_decode, Encode, Encoder};

/// Maximum connection ID length defined by QUIC version 1
pub const MAX_LEN: usize = 20;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct InvalidLength;

impl fmt::Display for InvalidLength {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "connection id exceeds {MAX_LEN} bytes")
    }
}

#[cfg(feature = "std")]
impl std::error::Error for InvalidLength {}

/// An opaque connection ID of up to 20 bytes
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct ConnectionId {
    bytes: [u8; MAX_LEN],
    len: u8,
}

impl ConnectionId {
    pub const EMPTY: Self = Self {
        bytes: [0; MAX_LEN],
        len: 0,
    };

    #[inline]
    pub fn as_bytes(&self) -> &[u8] {
        &self.bytes[..self.len as usize]
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.len as usize
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }
}

impl TryFrom<&[u8]> for ConnectionId {
    type Error = InvalidLength;

    #[inline]
    fn try_from(slice: &[u8]) -> Result<Self, Self::Error> {
        ensure!(slice.len() <= MAX_LEN, Err(InvalidLength));
        let mut bytes = [0; MAX_LEN];
        bytes[..slice.len()].copy_from_slice(slice);
        Ok(Self {
            bytes,
            len: slice.len() as u8,
        })
    }
}

impl AsRef<[u8]> for ConnectionId {
    #[inline]
    fn as_ref(&self) -> &[u8] {
        self.as_bytes()
    }
}

impl fmt::Debug for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "0x")?;
        for byte in self.as_bytes() {
            write!(f, "{byte:02x}")?;
        }
        Ok(())
    }
}

impl_decode!(
    impl<'a> ConnectionId {
        fn decode(buffer: DecoderBuffer) -> Result<Self> {
            let len = buffer.len();
            let (slice, buffer) = buffer.decode_slice(len)?;
            let id = Self::try_from(slice.into_inner())
                .map_err(|_| quiver_codec::CodecError::Malformed("connection id exceeds 20 bytes"))?;
            Ok((id, buffer))
        }
    }
);

impl Encode for ConnectionId {
    #[inline]
    fn encode<E: Encoder>(&self, encoder: &mut E) {
        encoder.write_slice(self.as_bytes());
    }
}
