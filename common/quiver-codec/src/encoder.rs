// Copyright the quiver authors. All Rights Reserved.
// SPDX-License-Identifier: Apache-2.0

//! Positioned encode into caller-provided storage
//!
//! Values encode through the [`Encoder`] trait so the same impl serves two
//! backends: [`EncoderBuffer`] writes into a mutable slice, and
//! [`SizeEstimator`] only counts, which is how length prefixes and
//! allocation sizes are computed without encoding twice.

use core::mem::size_of;

pub trait Encoder: Sized {
    /// Hands `write` a slice of exactly `len` bytes at the write position
    fn write_sized<F: FnOnce(&mut [u8])>(&mut self, len: usize, write: F);

    /// Total storage behind the encoder
    fn capacity(&self) -> usize;

    /// Bytes written so far
    fn len(&self) -> usize;

    #[inline]
    fn is_empty(&self) -> bool {
        self.len() == 0
    }

    #[inline]
    fn remaining_capacity(&self) -> usize {
        self.capacity().saturating_sub(self.len())
    }

    /// Copies `slice` at the write position
    #[inline]
    fn write_slice(&mut self, slice: &[u8]) {
        self.write_sized(slice.len(), |bytes| bytes.copy_from_slice(slice));
    }

    /// Writes `count` copies of `value`
    #[inline]
    fn write_repeated(&mut self, count: usize, value: u8) {
        self.write_sized(count, |bytes| bytes.fill(value));
    }

    /// Encodes `value` at the write position
    #[inline]
    fn encode<T: Encode>(&mut self, value: &T) {
        value.encode(self)
    }

    /// Encodes `value` preceded by its size as an `L`
    #[inline]
    fn encode_with_len_prefix<L, T>(&mut self, value: &T)
    where
        L: TryFrom<usize> + Encode,
        L::Error: core::fmt::Debug,
        T: Encode,
    {
        value.encode_with_len_prefix::<L, Self>(self)
    }
}

/// A value with a wire representation
pub trait Encode {
    fn encode<E: Encoder>(&self, encoder: &mut E);

    /// The number of bytes [`encode`](Self::encode) will produce
    #[inline]
    fn encoding_size(&self) -> usize {
        let mut estimator = SizeEstimator::default();
        self.encode(&mut estimator);
        estimator.len()
    }

    /// Encodes the value preceded by its size as an `L`
    #[inline]
    fn encode_with_len_prefix<L, E>(&self, encoder: &mut E)
    where
        L: TryFrom<usize> + Encode,
        L::Error: core::fmt::Debug,
        E: Encoder,
    {
        let len = L::try_from(self.encoding_size()).expect("length prefix out of range");
        len.encode(encoder);
        self.encode(encoder);
    }

    /// Encodes into a freshly sized vec
    #[cfg(feature = "alloc")]
    fn encode_to_vec(&self) -> alloc::vec::Vec<u8> {
        let mut bytes = alloc::vec![0u8; self.encoding_size()];
        let mut encoder = EncoderBuffer::new(&mut bytes);
        self.encode(&mut encoder);
        bytes
    }
}

/// Writes into a caller-provided slice, tracking the position
#[derive(Debug, PartialEq, Eq)]
pub struct EncoderBuffer<'a> {
    bytes: &'a mut [u8],
    position: usize,
}

impl<'a> EncoderBuffer<'a> {
    #[inline]
    pub fn new(bytes: &'a mut [u8]) -> Self {
        Self { bytes, position: 0 }
    }

    /// Moves the write position, e.g. to patch an earlier field
    ///
    /// # Panics
    /// Panics when `position` passes the end of the storage.
    #[inline]
    pub fn set_position(&mut self, position: usize) {
        assert!(
            position <= self.bytes.len(),
            "position {position} past the end of the buffer"
        );
        self.position = position;
    }

    /// Splits the written prefix off from the unused tail
    #[inline]
    pub fn split_off(self) -> (&'a mut [u8], &'a mut [u8]) {
        self.bytes.split_at_mut(self.position)
    }

    /// The bytes written so far
    #[inline]
    pub fn as_mut_slice(&mut self) -> &mut [u8] {
        &mut self.bytes[..self.position]
    }
}

impl Encoder for EncoderBuffer<'_> {
    #[inline]
    fn write_sized<F: FnOnce(&mut [u8])>(&mut self, len: usize, write: F) {
        let end = self.position + len;
        assert!(
            end <= self.bytes.len(),
            "write of {len} bytes overflows the buffer"
        );
        write(&mut self.bytes[self.position..end]);
        self.position = end;
    }

    #[inline]
    fn capacity(&self) -> usize {
        self.bytes.len()
    }

    #[inline]
    fn len(&self) -> usize {
        self.position
    }
}

/// Counts bytes without storing them
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct SizeEstimator {
    len: usize,
}

impl Encoder for SizeEstimator {
    #[inline]
    fn write_sized<F: FnOnce(&mut [u8])>(&mut self, len: usize, _write: F) {
        self.len += len;
    }

    #[inline]
    fn capacity(&self) -> usize {
        usize::MAX
    }

    #[inline]
    fn len(&self) -> usize {
        self.len
    }
}

macro_rules! impl_encode_integer {
    ($ty:ty) => {
        impl Encode for $ty {
            #[inline]
            fn encode<E: Encoder>(&self, encoder: &mut E) {
                encoder.write_sized(size_of::<$ty>(), |bytes| {
                    bytes.copy_from_slice(&self.to_be_bytes());
                });
            }

            #[inline]
            fn encoding_size(&self) -> usize {
                size_of::<$ty>()
            }
        }
    };
}

impl_encode_integer!(u8);
impl_encode_integer!(u16);
impl_encode_integer!(u32);
impl_encode_integer!(u64);

impl Encode for &[u8] {
    #[inline]
    fn encode<E: Encoder>(&self, encoder: &mut E) {
        encoder.write_slice(self);
    }

    #[inline]
    fn encoding_size(&self) -> usize {
        self.len()
    }
}

impl Encode for () {
    #[inline]
    fn encode<E: Encoder>(&self, _encoder: &mut E) {}

    #[inline]
    fn encoding_size(&self) -> usize {
        0
    }
}
