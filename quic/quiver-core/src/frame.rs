// Copyright the quiver authors. All Rights Reserved.
// SPDX-License-Identifier: Apache-2.0

//! Wire codecs for the frames the core itself produces
//!
//! The scheduler owns most framing decisions, but the core generates a few
//! frames directly: ACKs built from an ack tracker's received ranges, the
//! probes and padding the builder emits, and the close frame. Frame
//! payloads the core only transports (STREAM, flow control, ...) stay
//! opaque byte slices.

use crate::{
    range::{RangeTracker, SubRange},
    varint::VarInt,
};
use alloc::vec::Vec;
use quiver_codec::{impl_decode, malformed, CodecError, Encode, Encoder};

pub mod tag {
    pub const PADDING: u8 = 0x00;
    pub const PING: u8 = 0x01;
    pub const ACK: u8 = 0x02;
    pub const CRYPTO: u8 = 0x06;
    pub const PATH_CHALLENGE: u8 = 0x1a;
    pub const PATH_RESPONSE: u8 = 0x1b;
    pub const CONNECTION_CLOSE: u8 = 0x1c;
    pub const CONNECTION_CLOSE_APP: u8 = 0x1d;
    pub const HANDSHAKE_DONE: u8 = 0x1e;
}

//
// PING
//

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct Ping;

impl Encode for Ping {
    #[inline]
    fn encode<E: Encoder>(&self, encoder: &mut E) {
        encoder.encode(&tag::PING);
    }
}

impl_decode!(
    impl<'a> Ping {
        fn decode(buffer: DecoderBuffer) -> Result<Self> {
            let (tag, buffer) = buffer.decode::<u8>()?;
            malformed!(tag == tag::PING, "expected a ping frame");
            Ok((Ping, buffer))
        }
    }
);

//
// ACK
//
// Largest Acknowledged (i), ACK Delay (i), ACK Range Count (i),
// First ACK Range (i), then (Gap, Length) pairs walking downward.
//

/// An ACK frame borrowing the tracker's received ranges
#[derive(Clone, Copy, Debug)]
pub struct Ack<'a> {
    pub ack_delay: VarInt,
    pub ranges: &'a RangeTracker,
}

impl<'a> Ack<'a> {
    /// Builds an ACK over everything the tracker has received
    ///
    /// The tracker must be non-empty; an empty tracker has nothing to
    /// acknowledge and the scheduler should not have asked.
    pub fn new(ranges: &'a RangeTracker, ack_delay: VarInt) -> Option<Self> {
        ensure!(!ranges.is_empty(), None);
        Some(Self { ack_delay, ranges })
    }
}

impl Encode for Ack<'_> {
    fn encode<E: Encoder>(&self, encoder: &mut E) {
        let range_count = self.ranges.len();
        assume!(range_count > 0, "an ACK must acknowledge something");

        let Some(largest) = self.ranges.get(range_count - 1) else {
            return;
        };

        encoder.encode(&tag::ACK);
        encoder.encode(&VarInt::new(largest.high()).unwrap_or(VarInt::MAX));
        encoder.encode(&self.ack_delay);
        encoder.encode(&VarInt::try_from(range_count - 1).unwrap_or(VarInt::MAX));
        encoder.encode(&VarInt::new(largest.count - 1).unwrap_or(VarInt::MAX));

        // remaining ranges walk from high to low; each gap counts the
        // unacknowledged packets between two ranges, minus the mandatory
        // hole of one
        let mut previous_low = largest.low;
        for index in (0..range_count - 1).rev() {
            let Some(range) = self.ranges.get(index) else {
                break;
            };
            let gap = previous_low - range.high() - 2;
            encoder.encode(&VarInt::new(gap).unwrap_or(VarInt::MAX));
            encoder.encode(&VarInt::new(range.count - 1).unwrap_or(VarInt::MAX));
            previous_low = range.low;
        }
    }
}

/// A decoded ACK frame with its ranges materialized lowest-first
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct DecodedAck {
    pub largest_acknowledged: u64,
    pub ack_delay: u64,
    pub ranges: Vec<SubRange>,
}

impl_decode!(
    impl<'a> DecodedAck {
        fn decode(buffer: DecoderBuffer) -> Result<Self> {
            let (tag, buffer) = buffer.decode::<u8>()?;
            malformed!(tag == tag::ACK, "expected an ack frame");

            let (largest, buffer) = buffer.decode::<VarInt>()?;
            let (ack_delay, buffer) = buffer.decode::<VarInt>()?;
            let (range_count, buffer) = buffer.decode::<VarInt>()?;
            let (first_range, buffer) = buffer.decode::<VarInt>()?;

            let largest = largest.as_u64();
            malformed!(
                first_range.as_u64() <= largest,
                "first ack range exceeds the largest acknowledged"
            );

            let mut ranges = Vec::new();
            let mut low = largest - first_range.as_u64();
            ranges.push(SubRange {
                low,
                count: first_range.as_u64() + 1,
            });

            let mut buffer = buffer;
            for _ in 0..range_count.as_u64() {
                let (gap, remaining) = buffer.decode::<VarInt>()?;
                let (length, remaining) = remaining.decode::<VarInt>()?;
                buffer = remaining;

                let high = low
                    .checked_sub(gap.as_u64() + 2)
                    .ok_or(CodecError::Malformed("ack range underflow"))?;
                low = high
                    .checked_sub(length.as_u64())
                    .ok_or(CodecError::Malformed("ack range underflow"))?;
                ranges.push(SubRange {
                    low,
                    count: length.as_u64() + 1,
                });
            }

            ranges.reverse();

            let ack = Self {
                largest_acknowledged: largest,
                ack_delay: ack_delay.as_u64(),
                ranges,
            };
            Ok((ack, buffer))
        }
    }
);

//
// CRYPTO
//

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Crypto<'a> {
    pub offset: VarInt,
    pub data: &'a [u8],
}

impl Encode for Crypto<'_> {
    #[inline]
    fn encode<E: Encoder>(&self, encoder: &mut E) {
        encoder.encode(&tag::CRYPTO);
        encoder.encode(&self.offset);
        encoder.encode_with_len_prefix::<VarInt, _>(&self.data);
    }
}

impl_decode!(
    impl<'a> Crypto<'a> {
        fn decode(buffer: DecoderBuffer) -> Result<Self> {
            let (tag, buffer) = buffer.decode::<u8>()?;
            malformed!(tag == tag::CRYPTO, "expected a crypto frame");
            let (offset, buffer) = buffer.decode::<VarInt>()?;
            let (data, buffer) = buffer.decode_slice_with_len_prefix::<VarInt>()?;
            let frame = Self {
                offset,
                data: data.into_inner(),
            };
            Ok((frame, buffer))
        }
    }
);

//
// PATH_CHALLENGE / PATH_RESPONSE
//

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct PathChallenge {
    pub data: [u8; 8],
}

impl Encode for PathChallenge {
    #[inline]
    fn encode<E: Encoder>(&self, encoder: &mut E) {
        encoder.encode(&tag::PATH_CHALLENGE);
        encoder.write_slice(&self.data);
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct PathResponse {
    pub data: [u8; 8],
}

impl Encode for PathResponse {
    #[inline]
    fn encode<E: Encoder>(&self, encoder: &mut E) {
        encoder.encode(&tag::PATH_RESPONSE);
        encoder.write_slice(&self.data);
    }
}

impl_decode!(
    impl<'a> PathChallenge {
        fn decode(buffer: DecoderBuffer) -> Result<Self> {
            let (tag, buffer) = buffer.decode::<u8>()?;
            malformed!(tag == tag::PATH_CHALLENGE, "expected a path challenge");
            let (slice, buffer) = buffer.decode_slice(8)?;
            let mut data = [0u8; 8];
            data.copy_from_slice(slice.as_slice());
            Ok((Self { data }, buffer))
        }
    }
);

//
// CONNECTION_CLOSE (transport flavor, type 0x1c)
//

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ConnectionClose<'a> {
    pub error_code: VarInt,
    /// The frame type that triggered the error, zero for none
    pub frame_type: VarInt,
    pub reason: &'a [u8],
}

impl Encode for ConnectionClose<'_> {
    #[inline]
    fn encode<E: Encoder>(&self, encoder: &mut E) {
        encoder.encode(&tag::CONNECTION_CLOSE);
        encoder.encode(&self.error_code);
        encoder.encode(&self.frame_type);
        encoder.encode_with_len_prefix::<VarInt, _>(&self.reason);
    }
}

impl_decode!(
    impl<'a> ConnectionClose<'a> {
        fn decode(buffer: DecoderBuffer) -> Result<Self> {
            let (tag, buffer) = buffer.decode::<u8>()?;
            malformed!(
                tag == tag::CONNECTION_CLOSE,
                "expected a connection close frame"
            );
            let (error_code, buffer) = buffer.decode::<VarInt>()?;
            let (frame_type, buffer) = buffer.decode::<VarInt>()?;
            let (reason, buffer) = buffer.decode_slice_with_len_prefix::<VarInt>()?;
            let frame = Self {
                error_code,
                frame_type,
                reason: reason.into_inner(),
            };
            Ok((frame, buffer))
        }
    }
);

//
// HANDSHAKE_DONE
//

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct HandshakeDone;

impl Encode for HandshakeDone {
    #[inline]
    fn encode<E: Encoder>(&self, encoder: &mut E) {
        encoder.encode(&tag::HANDSHAKE_DONE);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::range::ACK_TRACKER_RANGES;
    use quiver_codec::DecoderBuffer;

    #[test]
    fn ping_round_trip() {
        let encoded = Ping.encode_to_vec();
        assert_eq!(encoded, [tag::PING]);
        let buffer = DecoderBuffer::new(&encoded);
        let (_, remaining) = buffer.decode::<Ping>().unwrap();
        assert!(remaining.is_empty());
    }

    #[test]
    fn ack_single_range() {
        let mut tracker = RangeTracker::new(ACK_TRACKER_RANGES);
        tracker.add_range(7, 4).unwrap();

        let ack = Ack::new(&tracker, VarInt::from_u8(0)).unwrap();
        let encoded = ack.encode_to_vec();
        // type, largest 10, delay 0, count 0, first range 3
        assert_eq!(encoded, [tag::ACK, 10, 0, 0, 3]);

        let buffer = DecoderBuffer::new(&encoded);
        let (decoded, remaining) = buffer.decode::<DecodedAck>().unwrap();
        assert!(remaining.is_empty());
        assert_eq!(decoded.largest_acknowledged, 10);
        assert_eq!(decoded.ranges, vec![SubRange { low: 7, count: 4 }]);
    }

    #[test]
    fn ack_multiple_ranges_round_trip() {
        let mut tracker = RangeTracker::new(ACK_TRACKER_RANGES);
        tracker.add_range(1, 2).unwrap();
        tracker.add_range(10, 5).unwrap();
        tracker.add_value(100).unwrap();

        let ack = Ack::new(&tracker, VarInt::from_u8(25)).unwrap();
        let encoded = ack.encode_to_vec();

        let buffer = DecoderBuffer::new(&encoded);
        let (decoded, remaining) = buffer.decode::<DecodedAck>().unwrap();
        assert!(remaining.is_empty());

        assert_eq!(decoded.largest_acknowledged, 100);
        assert_eq!(decoded.ack_delay, 25);
        assert_eq!(
            decoded.ranges,
            vec![
                SubRange { low: 1, count: 2 },
                SubRange { low: 10, count: 5 },
                SubRange { low: 100, count: 1 },
            ]
        );
    }

    #[test]
    fn ack_rejects_empty_tracker() {
        let tracker = RangeTracker::new(ACK_TRACKER_RANGES);
        assert!(Ack::new(&tracker, VarInt::ZERO).is_none());
    }

    #[test]
    fn ack_decode_rejects_underflow() {
        // largest 1 with a first range of 3 reaches below packet zero
        let encoded = [tag::ACK, 1, 0, 0, 3];
        let buffer = DecoderBuffer::new(&encoded);
        assert!(buffer.decode::<DecodedAck>().is_err());
    }

    #[test]
    fn crypto_round_trip() {
        let frame = Crypto {
            offset: VarInt::from_u16(1024),
            data: &[1, 2, 3, 4, 5],
        };
        let encoded = frame.encode_to_vec();
        let buffer = DecoderBuffer::new(&encoded);
        let (decoded, remaining) = buffer.decode::<Crypto>().unwrap();
        assert!(remaining.is_empty());
        assert_eq!(decoded, frame);
    }

    #[test]
    fn path_challenge_round_trip() {
        let frame = PathChallenge {
            data: [1, 2, 3, 4, 5, 6, 7, 8],
        };
        let encoded = frame.encode_to_vec();
        assert_eq!(encoded.len(), 9);
        let buffer = DecoderBuffer::new(&encoded);
        let (decoded, remaining) = buffer.decode::<PathChallenge>().unwrap();
        assert!(remaining.is_empty());
        assert_eq!(decoded, frame);
    }

    #[test]
    fn connection_close_round_trip() {
        let frame = ConnectionClose {
            error_code: VarInt::from_u8(0x0a),
            frame_type: VarInt::ZERO,
            reason: b"tls alert",
        };
        let encoded = frame.encode_to_vec();
        let buffer = DecoderBuffer::new(&encoded);
        let (decoded, remaining) = buffer.decode::<ConnectionClose>().unwrap();
        assert!(remaining.is_empty());
        assert_eq!(decoded, frame);
    }
}
