// Copyright the quiver authors. All Rights Reserved.
// SPDX-License-Identifier: Apache-2.0

//! QUIC variable-length integer encoding
//!
//! The two most significant bits of the first byte encode the base-2
//! logarithm of the integer length in bytes; the value occupies the
//! remaining bits in network byte order. Integers are encoded on 1, 2, 4 or
//! 8 bytes and hold 6-, 14-, 30- or 62-bit values respectively.

use core::{
    convert::{TryFrom, TryInto},
    fmt,
    ops::Deref,
};
use quiver_codec::{impl_decode, Encode, Encoder};

#[cfg(any(test, feature = "generator"))]
use bolero_generator::TypeGenerator;

pub const MAX_VARINT_VALUE: u64 = 4_611_686_018_427_387_903;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct VarIntError;

impl fmt::Display for VarIntError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "varint range exceeded")
    }
}

#[cfg(feature = "std")]
impl std::error::Error for VarIntError {}

#[derive(Clone, Copy, Debug, Default, Eq, Hash, PartialEq, PartialOrd, Ord)]
#[cfg_attr(any(test, feature = "generator"), derive(TypeGenerator))]
pub struct VarInt(#[cfg_attr(any(test, feature = "generator"), generator(Self::GENERATOR))] u64);

impl VarInt {
    pub const MAX: Self = Self(MAX_VARINT_VALUE);

    pub const ZERO: Self = Self(0);

    #[cfg(any(test, feature = "generator"))]
    const GENERATOR: core::ops::RangeInclusive<u64> = 0..=MAX_VARINT_VALUE;

    #[inline]
    pub const fn new(value: u64) -> Result<Self, VarIntError> {
        if value > MAX_VARINT_VALUE {
            return Err(VarIntError);
        }
        Ok(Self(value))
    }

    #[inline]
    pub const fn from_u8(value: u8) -> Self {
        Self(value as u64)
    }

    #[inline]
    pub const fn from_u16(value: u16) -> Self {
        Self(value as u64)
    }

    #[inline]
    pub const fn from_u32(value: u32) -> Self {
        Self(value as u64)
    }

    #[inline]
    pub const fn as_u64(self) -> u64 {
        self.0
    }

    #[inline]
    pub fn checked_add(self, value: Self) -> Option<Self> {
        Self::new(self.0.checked_add(value.0)?).ok()
    }

    #[inline]
    pub fn checked_add_usize(self, value: usize) -> Option<Self> {
        let value: Self = value.try_into().ok()?;
        self.checked_add(value)
    }

    #[inline]
    #[must_use]
    pub fn saturating_add(self, value: Self) -> Self {
        Self::new(self.0.saturating_add(value.0)).unwrap_or(Self::MAX)
    }

    #[inline]
    pub fn checked_sub(self, value: Self) -> Option<Self> {
        Some(Self(self.0.checked_sub(value.0)?))
    }

    #[inline]
    #[must_use]
    pub fn saturating_sub(self, value: Self) -> Self {
        Self(self.0.saturating_sub(value.0))
    }

    /// Returns the number of bytes the value occupies on the wire
    #[inline]
    pub fn encoding_length(self) -> usize {
        match self.0 {
            0..=0x3f => 1,
            0x40..=0x3fff => 2,
            0x4000..=0x3fff_ffff => 4,
            _ => 8,
        }
    }

    /// Returns the two-bit length class for the value
    #[inline]
    fn two_bit(self) -> u8 {
        match self.encoding_length() {
            1 => 0b00,
            2 => 0b01,
            4 => 0b10,
            _ => 0b11,
        }
    }

    /// Re-encodes `replacement` into the space previously used by `self`
    ///
    /// The replacement must not require a longer encoding than the value it
    /// replaces; the original length class is preserved so surrounding bytes
    /// are untouched.
    #[inline]
    pub fn encode_updated<E: Encoder>(self, replacement: Self, encoder: &mut E) {
        debug_assert!(
            self.encoding_length() >= replacement.encoding_length(),
            "the replacement must fit in the original encoding"
        );

        encode_with_class(replacement.0, self.two_bit(), encoder);
    }
}

#[inline]
fn encode_with_class<E: Encoder>(value: u64, two_bit: u8, encoder: &mut E) {
    let len = 1usize << two_bit;
    encoder.write_sized(len, |buffer| {
        let bytes = ((two_bit as u64) << (len * 8 - 2) | value).to_be_bytes();
        buffer.copy_from_slice(&bytes[8 - len..]);
    });
}

impl Encode for VarInt {
    #[inline]
    fn encode<E: Encoder>(&self, encoder: &mut E) {
        encode_with_class(self.0, self.two_bit(), encoder);
    }

    #[inline]
    fn encoding_size(&self) -> usize {
        self.encoding_length()
    }
}

impl_decode!(
    impl<'a> VarInt {
        fn decode(buffer: DecoderBuffer) -> Result<Self> {
            let header = buffer.peek_byte(0)?;

            Ok(match (header >> 6) & 0b11 {
                0b00 => {
                    let value = header & (2u8.pow(6) - 1);
                    let buffer = buffer.skip(1)?;
                    (Self(value.into()), buffer)
                }
                0b01 => {
                    let (value, buffer) = buffer.decode::<u16>()?;
                    let value = value & (2u16.pow(14) - 1);
                    (Self(value.into()), buffer)
                }
                0b10 => {
                    let (value, buffer) = buffer.decode::<u32>()?;
                    let value = value & (2u32.pow(30) - 1);
                    (Self(value.into()), buffer)
                }
                0b11 => {
                    let (value, buffer) = buffer.decode::<u64>()?;
                    let value = value & (2u64.pow(62) - 1);
                    (Self(value), buffer)
                }
                _ => unreachable!(),
            })
        }
    }
);

impl fmt::Display for VarInt {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

impl AsRef<u64> for VarInt {
    #[inline]
    fn as_ref(&self) -> &u64 {
        &self.0
    }
}

impl Deref for VarInt {
    type Target = u64;

    #[inline]
    fn deref(&self) -> &Self::Target {
        &self.0
    }
}

macro_rules! impl_from_lesser {
    ($ty:ty) => {
        impl From<$ty> for VarInt {
            #[inline]
            fn from(value: $ty) -> Self {
                Self(value.into())
            }
        }
    };
}

impl_from_lesser!(u8);
impl_from_lesser!(u16);
impl_from_lesser!(u32);

impl From<VarInt> for u64 {
    #[inline]
    fn from(value: VarInt) -> u64 {
        value.0
    }
}

impl TryFrom<u64> for VarInt {
    type Error = VarIntError;

    #[inline]
    fn try_from(value: u64) -> Result<Self, Self::Error> {
        Self::new(value)
    }
}

impl TryFrom<usize> for VarInt {
    type Error = VarIntError;

    #[inline]
    fn try_from(value: usize) -> Result<Self, Self::Error> {
        Self::new(value as u64)
    }
}

impl TryFrom<VarInt> for usize {
    type Error = <usize as TryFrom<u64>>::Error;

    #[inline]
    fn try_from(value: VarInt) -> Result<Self, Self::Error> {
        value.0.try_into()
    }
}

impl core::ops::Add for VarInt {
    type Output = Self;

    #[inline]
    #[track_caller]
    fn add(self, rhs: Self) -> Self {
        if cfg!(debug_assertions) {
            self.checked_add(rhs).expect("VarInt overflow occurred")
        } else {
            Self(self.0 + rhs.0)
        }
    }
}

impl core::ops::AddAssign<Self> for VarInt {
    #[inline]
    #[track_caller]
    fn add_assign(&mut self, rhs: Self) {
        *self = *self + rhs;
    }
}

impl core::ops::Sub for VarInt {
    type Output = Self;

    #[inline]
    #[track_caller]
    fn sub(self, rhs: Self) -> Self {
        // Bounds check is inherited from u64
        Self(self.0 - rhs.0)
    }
}

impl core::ops::SubAssign<Self> for VarInt {
    #[inline]
    #[track_caller]
    fn sub_assign(&mut self, rhs: Self) {
        self.0 -= rhs.0;
    }
}

impl PartialEq<u64> for VarInt {
    #[inline]
    fn eq(&self, other: &u64) -> bool {
        self.0.eq(other)
    }
}

impl PartialOrd<u64> for VarInt {
    #[inline]
    fn partial_cmp(&self, other: &u64) -> Option<core::cmp::Ordering> {
        self.0.partial_cmp(other)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bolero::check;
    use quiver_codec::{DecoderBuffer, EncoderBuffer};

    fn round_trip(value: VarInt) -> Vec<u8> {
        let encoded = value.encode_to_vec();
        let buffer = DecoderBuffer::new(&encoded);
        let (decoded, remaining) = buffer.decode::<VarInt>().unwrap();
        assert!(remaining.is_empty());
        assert_eq!(decoded, value);
        encoded
    }

    #[test]
    fn round_trip_test() {
        check!().with_type::<VarInt>().cloned().for_each(|value| {
            round_trip(value);
        });
    }

    #[test]
    fn encoding_examples() {
        assert_eq!(round_trip(VarInt::from_u8(0x3f)), [0x3f]);
        assert_eq!(round_trip(VarInt::from_u8(0x40)), [0x40, 0x40]);
        assert_eq!(round_trip(VarInt::from_u16(0x3fff)), [0x7f, 0xff]);
        assert_eq!(
            round_trip(VarInt::from_u32(0x3fff_ffff)),
            [0x7f, 0xff, 0xff, 0xff]
        );
        assert_eq!(
            round_trip(VarInt::MAX),
            [0xff, 0xff, 0xff, 0xff, 0xff, 0xff, 0xff, 0xff]
        );
        // the canonical RFC 9000 example values
        assert_eq!(
            round_trip(VarInt::new(151_288_809_941_952_652).unwrap()),
            [0xc2, 0x19, 0x7c, 0x5e, 0xff, 0x14, 0xe8, 0x8c]
        );
        assert_eq!(
            round_trip(VarInt::new(494_878_333).unwrap()),
            [0x9d, 0x7f, 0x3e, 0x7d]
        );
        assert_eq!(round_trip(VarInt::new(15_293).unwrap()), [0x7b, 0xbd]);
    }

    #[test]
    fn out_of_range() {
        assert!(VarInt::new(MAX_VARINT_VALUE).is_ok());
        assert_eq!(VarInt::new(MAX_VARINT_VALUE + 1), Err(VarIntError));
        assert_eq!(VarInt::new(u64::MAX), Err(VarIntError));
    }

    #[test]
    fn truncated_input() {
        let bytes = [0x7f];
        let buffer = DecoderBuffer::new(&bytes);
        assert!(buffer.decode::<VarInt>().is_err());

        let bytes = [0xc0, 0x01, 0x02];
        let buffer = DecoderBuffer::new(&bytes);
        assert!(buffer.decode::<VarInt>().is_err());
    }

    #[test]
    fn encode_updated_test() {
        let mut bytes = [0u8; 2];
        let mut encoder = EncoderBuffer::new(&mut bytes);
        let placeholder = VarInt::from_u16(0x1000);
        encoder.encode(&placeholder);

        encoder.set_position(0);
        placeholder.encode_updated(VarInt::from_u8(7), &mut encoder);

        let buffer = DecoderBuffer::new(&bytes);
        let (value, _) = buffer.decode::<VarInt>().unwrap();
        assert_eq!(value, VarInt::from_u8(7));
    }
}
