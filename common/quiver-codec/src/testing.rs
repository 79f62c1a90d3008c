// Copyright the quiver authors. All Rights Reserved.
// SPDX-License-Identifier: Apache-2.0

//! Round-trip helpers shared by codec consumers' test suites

use crate::{Decode, DecoderBuffer, Encode};
use core::fmt::Debug;

/// Encodes a value, decodes the bytes, and checks the result is identical,
/// returning the encoding
pub fn encode_then_decode<T>(value: &T) -> Vec<u8>
where
    T: Encode + Debug + PartialEq + for<'a> Decode<'a>,
{
    let encoded = value.encode_to_vec();

    let buffer = DecoderBuffer::new(&encoded);
    let (decoded, remaining) = buffer.decode::<T>().expect("decoding should succeed");
    assert!(remaining.is_empty(), "decoding should consume all bytes");
    assert_eq!(&decoded, value);

    encoded
}

#[macro_export]
macro_rules! assert_codec_round_trip_value {
    ($ty:ty, $value:expr) => {{
        let value: &$ty = &$value;
        $crate::testing::encode_then_decode(value)
    }};
}

#[macro_export]
macro_rules! assert_codec_round_trip_bytes {
    ($ty:ty, $bytes:expr) => {{
        let buffer = $crate::DecoderBuffer::new($bytes);
        let (value, remaining) = buffer
            .decode::<$ty>()
            .expect("decoding from bytes should succeed");
        assert!(remaining.is_empty());
        let reencoded = $crate::Encode::encode_to_vec(&value);
        assert_eq!(&reencoded[..], &$bytes[..]);
        value
    }};
}
