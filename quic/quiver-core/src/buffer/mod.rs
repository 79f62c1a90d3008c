// Copyright the quiver authors. All Rights Reserved.
// SPDX-License-Identifier: Apache-2.0

//! Out-of-order stream reassembly with four delivery disciplines
//!
//! The buffer accepts stream bytes at arbitrary offsets, tracks what has
//! been written in a [`RangeTracker`], and exposes the contiguous prefix at
//! the read cursor. How the backing memory is organized is the mode's
//! business:
//!
//! - `Single`: one growable chunk, data always front-aligned, one read
//!   buffer. Used for crypto streams.
//! - `Circular`: one chunk used as a ring; draining advances the ring start
//!   instead of copying.
//! - `Multiple`: a chunk list; reads may pin the front chunk while new data
//!   lands in later chunks, and reads continue where the last one stopped.
//! - `AppOwned`: the application supplies fixed-size chunks in FIFO order;
//!   the buffer never allocates and returns each chunk once drained.

use crate::range::{RangeTracker, RECV_BUFFER_RANGES};
use alloc::{collections::VecDeque, vec::Vec};
use bytes::BytesMut;
use core::fmt;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Mode {
    Single,
    Circular,
    Multiple,
    AppOwned,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Error {
    /// The write exceeds the virtual length, the flow-control credit, or
    /// the provided backing capacity
    BufferTooSmall,
    InvalidParameter,
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            Self::BufferTooSmall => write!(f, "write exceeds buffer capacity"),
            Self::InvalidParameter => write!(f, "invalid parameter"),
        }
    }
}

#[cfg(feature = "std")]
impl std::error::Error for Error {}

struct Chunk {
    data: BytesMut,
    /// Absolute stream offset anchoring index 0 (ring chunks wrap modulo
    /// the allocation length)
    start: u64,
    external_ref: bool,
    app_owned: bool,
}

impl Chunk {
    #[inline]
    fn alloc_len(&self) -> u64 {
        self.data.len() as u64
    }
}

impl fmt::Debug for Chunk {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("Chunk")
            .field("start", &self.start)
            .field("alloc", &self.data.len())
            .field("external_ref", &self.external_ref)
            .field("app_owned", &self.app_owned)
            .finish()
    }
}

#[derive(Debug)]
pub struct ReceiveBuffer {
    mode: Mode,
    /// Stream offset at the read cursor
    base_offset: u64,
    /// Highest offset the writer may reach (non-app-owned modes)
    virtual_length: u64,
    /// Total capacity ever provided in app-owned mode, for overflow checks
    provided_capacity: u64,
    /// Bytes currently exposed to the reader and not yet drained
    read_pending_length: u64,
    /// Set between a read and the next drain in the single-cursor modes
    read_in_progress: bool,
    written_ranges: RangeTracker,
    chunks: VecDeque<Chunk>,
}

impl ReceiveBuffer {
    /// Creates a buffer with `alloc_length` bytes of initial backing and a
    /// `virtual_length` write ceiling
    ///
    /// App-owned buffers start with no backing at all; chunks arrive via
    /// [`provide_chunks`](Self::provide_chunks).
    pub fn new(mode: Mode, alloc_length: u32, virtual_length: u32) -> Self {
        assume!(
            mode == Mode::AppOwned || alloc_length > 0,
            "allocating modes need an initial chunk"
        );
        let mut chunks = VecDeque::new();
        if mode != Mode::AppOwned && alloc_length > 0 {
            chunks.push_back(Chunk {
                data: BytesMut::zeroed(alloc_length as usize),
                start: 0,
                external_ref: false,
                app_owned: false,
            });
        }

        Self {
            mode,
            base_offset: 0,
            virtual_length: virtual_length as u64,
            provided_capacity: 0,
            read_pending_length: 0,
            read_in_progress: false,
            written_ranges: RangeTracker::new(RECV_BUFFER_RANGES),
            chunks,
        }
    }

    #[inline]
    pub fn mode(&self) -> Mode {
        self.mode
    }

    #[inline]
    pub fn base_offset(&self) -> u64 {
        self.base_offset
    }

    #[inline]
    pub fn read_pending_length(&self) -> u64 {
        self.read_pending_length
    }

    /// The furthest stream offset ever written (or drained past)
    pub fn total_length(&self) -> u64 {
        self.written_ranges
            .max_value()
            .map_or(0, |max| max + 1)
            .max(self.base_offset)
    }

    /// Bytes contiguously readable from the read cursor
    #[inline]
    fn contiguous_length(&self) -> u64 {
        self.written_ranges.contiguous_length(self.base_offset)
    }

    /// `true` when a read would expose bytes not yet handed out
    pub fn has_unread_data(&self) -> bool {
        self.contiguous_length() > self.read_pending_length
    }

    /// Number of buffers the next read needs to expose everything readable
    pub fn read_buffer_needed_count(&self) -> usize {
        match self.mode {
            Mode::Single => 1,
            Mode::Circular => 2,
            Mode::Multiple => 3,
            Mode::AppOwned => {
                let readable = self.contiguous_length();
                ensure!(readable > 0, 0);
                self.segments(self.base_offset, readable, usize::MAX).len()
            }
        }
    }

    /// Accepts `data` at stream offset `offset`
    ///
    /// `write_limit` carries the flow-control credit: on input the number
    /// of new bytes the stream may grow by, on output the number of new
    /// bytes this write actually added. Returns whether new bytes became
    /// readable at the read cursor.
    pub fn write(
        &mut self,
        offset: u64,
        data: &[u8],
        write_limit: &mut u64,
    ) -> Result<bool, Error> {
        let length = data.len() as u64;
        if length == 0 {
            *write_limit = 0;
            return Ok(false);
        }

        let end = offset.checked_add(length).ok_or(Error::InvalidParameter)?;

        // the writer may never pass the advertised window
        let virtual_end = match self.mode {
            Mode::AppOwned => self.writable_end(),
            _ => self.base_offset + self.virtual_length,
        };
        ensure!(end <= virtual_end, Err(Error::BufferTooSmall));

        // entirely behind the read cursor: a pure retransmit
        if end <= self.base_offset {
            *write_limit = 0;
            return Ok(false);
        }

        // flow-control accounting for the newly extended portion
        let current_max = self.total_length();
        if end > current_max {
            let newly_written = end - current_max;
            ensure!(newly_written <= *write_limit, Err(Error::BufferTooSmall));
            *write_limit = newly_written;
        } else {
            *write_limit = 0;
        }

        self.prepare_write(end)?;
        self.copy_into_chunks(offset, data);

        let updated = self
            .written_ranges
            .add_range(offset, length)
            .map_err(|_| Error::InvalidParameter)?;
        ensure!(updated, Ok(false));

        // ready when the (now merged) range around this write reaches back
        // to the read cursor
        let ready = match self.written_ranges.search(offset, end - 1) {
            Ok(index) => self
                .written_ranges
                .get(index)
                .map_or(false, |range| range.low <= self.base_offset),
            Err(_) => false,
        };

        probe!(offset, length, ready, "receive buffer write");

        Ok(ready)
    }

    /// Exposes up to `max_buffers` contiguous slices starting at the read
    /// cursor, returning the stream offset of the first byte
    ///
    /// In `Multiple` mode successive reads continue where the previous one
    /// stopped; the other modes expose everything from the cursor and
    /// require a drain between reads.
    pub fn read<'a>(&'a mut self, max_buffers: usize, buffers: &mut Vec<&'a [u8]>) -> u64 {
        buffers.clear();

        let (from, available) = match self.mode {
            Mode::Multiple => {
                let from = self.base_offset + self.read_pending_length;
                (
                    from,
                    self.contiguous_length()
                        .saturating_sub(self.read_pending_length),
                )
            }
            _ => {
                ensure!(!self.read_in_progress, self.base_offset);
                (self.base_offset, self.contiguous_length())
            }
        };
        ensure!(available > 0, from);

        let segments = self.segments(from, available, max_buffers);
        let mut emitted = 0u64;
        for (chunk_index, _, len) in &segments {
            self.chunks[*chunk_index].external_ref = true;
            emitted += *len as u64;
        }

        match self.mode {
            Mode::Multiple => self.read_pending_length += emitted,
            _ => {
                self.read_pending_length = emitted;
                self.read_in_progress = true;
            }
        }

        for (chunk_index, data_index, len) in segments {
            buffers.push(&self.chunks[chunk_index].data[data_index..data_index + len]);
        }

        from
    }

    /// Releases `length` bytes back to the buffer, advancing the read
    /// cursor
    ///
    /// Returns `true` iff this drain consumed the entire pending read.
    pub fn drain(&mut self, length: u64) -> bool {
        assume!(
            length <= self.read_pending_length,
            "cannot drain more than was read"
        );
        let prior_pending = self.read_pending_length;

        self.base_offset += length;
        self.read_pending_length = self.read_pending_length.saturating_sub(length);
        self.read_in_progress = false;

        match self.mode {
            Mode::Single => {
                // keep the data front-aligned so reads stay one buffer
                if let Some(front) = self.chunks.front_mut() {
                    let shift = length as usize;
                    if shift > 0 && shift < front.data.len() {
                        front.data.copy_within(shift.., 0);
                    }
                    front.start = self.base_offset;
                }
            }
            Mode::Circular => {
                // the ring start is implied by the base offset
            }
            Mode::Multiple | Mode::AppOwned => {
                // front chunks that fell entirely behind the cursor retire;
                // app-owned chunks return to the application by dropping
                while let Some(front_end) = self.chunks.front().map(|_| self.front_end()) {
                    ensure!(self.base_offset >= front_end, break);
                    self.chunks.pop_front();
                }
            }
        }

        if self.read_pending_length == 0 {
            for chunk in &mut self.chunks {
                chunk.external_ref = false;
            }
        }

        probe!(length, prior_pending, "receive buffer drain");

        length == prior_pending
    }

    /// Appends application-owned chunks to the backing pool (AppOwned only)
    pub fn provide_chunks(
        &mut self,
        provided: impl IntoIterator<Item = BytesMut>,
    ) -> Result<(), Error> {
        ensure!(self.mode == Mode::AppOwned, Err(Error::InvalidParameter));

        let provided: Vec<BytesMut> = provided.into_iter().collect();
        let additional: u64 = provided.iter().map(|chunk| chunk.len() as u64).sum();

        // reject aggregate capacity the offset arithmetic cannot express
        ensure!(
            self.provided_capacity + additional <= u32::MAX as u64,
            Err(Error::InvalidParameter)
        );

        let mut start = self.writable_end();
        for data in provided {
            ensure!(!data.is_empty(), Err(Error::InvalidParameter));
            let alloc = data.len() as u64;
            self.chunks.push_back(Chunk {
                data,
                start,
                external_ref: false,
                app_owned: true,
            });
            start += alloc;
        }
        self.provided_capacity += additional;
        self.virtual_length += additional;

        Ok(())
    }

    /// Raises the write ceiling; app-owned buffers grow only through
    /// [`provide_chunks`](Self::provide_chunks)
    pub fn increase_virtual_buffer_length(&mut self, length: u32) {
        assume!(self.mode != Mode::AppOwned);
        ensure!(self.mode != Mode::AppOwned);
        if (length as u64) > self.virtual_length {
            self.virtual_length = length as u64;
        }
    }

    /// Where index 0 of the front chunk stops serving the stream
    fn front_end(&self) -> u64 {
        let Some(front) = self.chunks.front() else {
            return self.base_offset;
        };

        match self.mode {
            // a ring serves a full allocation ahead of the cursor, unless a
            // later chunk has pinned its upper edge
            Mode::Circular | Mode::Multiple => self
                .chunks
                .get(1)
                .map_or(self.base_offset + front.alloc_len(), |next| next.start),
            Mode::Single | Mode::AppOwned => front.start + front.alloc_len(),
        }
    }

    /// One past the last offset the current backing can hold
    fn writable_end(&self) -> u64 {
        ensure!(!self.chunks.is_empty(), self.base_offset);
        if self.chunks.len() == 1 {
            self.front_end()
        } else {
            let last = &self.chunks[self.chunks.len() - 1];
            last.start + last.alloc_len()
        }
    }

    /// Makes sure backing exists for every offset up to `end`
    fn prepare_write(&mut self, end: u64) -> Result<(), Error> {
        ensure!(end > self.writable_end(), Ok(()));

        let needed = end - self.base_offset;
        let target = needed.next_power_of_two();

        match self.mode {
            Mode::AppOwned => Err(Error::BufferTooSmall),
            Mode::Single => {
                self.grow_front(target);
                Ok(())
            }
            Mode::Circular => {
                self.grow_front(target);
                Ok(())
            }
            Mode::Multiple => {
                if self.chunks.len() == 1 && !self.chunks[0].external_ref {
                    self.grow_front(target);
                } else if self.chunks.len() > 1
                    && !self.chunks[self.chunks.len() - 1].external_ref
                {
                    self.grow_tail(target);
                } else {
                    // the existing chunks are pinned by a pending read:
                    // new data lands in a fresh chunk instead
                    let start = self.writable_end();
                    self.chunks.push_back(Chunk {
                        data: BytesMut::zeroed(target as usize),
                        start,
                        external_ref: false,
                        app_owned: false,
                    });
                }
                Ok(())
            }
        }
    }

    /// Replaces the front chunk with a larger one, unwrapping any ring
    /// layout so the new chunk starts at the read cursor
    fn grow_front(&mut self, target: u64) {
        let Some(front) = self.chunks.front() else {
            return;
        };
        let old_alloc = front.alloc_len();
        let mut data = BytesMut::zeroed(target as usize);

        // carry over the full window of live bytes
        for i in 0..old_alloc {
            let offset = self.base_offset + i;
            let old_index = self.chunk_index(front, offset);
            data[i as usize] = front.data[old_index];
        }

        let external_ref = front.external_ref;
        self.chunks[0] = Chunk {
            data,
            start: self.base_offset,
            external_ref,
            app_owned: false,
        };
    }

    /// Reallocates the final chunk in place, preserving its contents
    fn grow_tail(&mut self, target: u64) {
        let index = self.chunks.len() - 1;
        let tail = &mut self.chunks[index];
        let mut data = BytesMut::zeroed(target as usize);
        data[..tail.data.len()].copy_from_slice(&tail.data);
        tail.data = data;
    }

    /// The data index serving absolute `offset` within `chunk`
    #[inline]
    fn chunk_index(&self, chunk: &Chunk, offset: u64) -> usize {
        let relative = offset - chunk.start;
        match self.mode {
            Mode::Circular | Mode::Multiple => (relative % chunk.alloc_len()) as usize,
            Mode::Single | Mode::AppOwned => relative as usize,
        }
    }

    /// Copies `data` into the chunks covering `[offset, offset + len)`,
    /// clipped to the read cursor
    fn copy_into_chunks(&mut self, offset: u64, data: &[u8]) {
        let end = offset + data.len() as u64;
        let mut cursor = offset.max(self.base_offset);

        for index in 0..self.chunks.len() {
            ensure!(cursor < end, ());

            let (span_start, span_end) = self.chunk_span(index);
            if cursor >= span_end {
                continue;
            }
            assume!(cursor >= span_start, "chunk coverage must be contiguous");

            let copy_end = end.min(span_end);
            let is_ring = matches!(self.mode, Mode::Circular | Mode::Multiple);
            let chunk = &self.chunks[index];
            let alloc = chunk.alloc_len();
            let chunk_start = chunk.start;

            let mut from = cursor;
            while from < copy_end {
                let relative = from - chunk_start;
                let data_index = if is_ring {
                    (relative % alloc) as usize
                } else {
                    relative as usize
                };
                // a ring write is split at the wrap point
                let run = (copy_end - from).min(alloc - data_index as u64) as usize;
                let src = &data[(from - offset) as usize..(from - offset) as usize + run];
                self.chunks[index].data[data_index..data_index + run].copy_from_slice(src);
                from += run as u64;
            }

            cursor = copy_end;
        }

        assume!(cursor >= end, "write was not fully covered by chunks");
    }

    /// The absolute span chunk `index` currently serves
    fn chunk_span(&self, index: usize) -> (u64, u64) {
        if index == 0 {
            (self.base_offset, self.front_end())
        } else {
            let chunk = &self.chunks[index];
            (chunk.start, chunk.start + chunk.alloc_len())
        }
    }

    /// Collects up to `max_buffers` `(chunk, data index, len)` segments
    /// covering `[from, from + len)`
    fn segments(&self, from: u64, len: u64, max_buffers: usize) -> Vec<(usize, usize, usize)> {
        let mut segments = Vec::new();
        let end = from + len;
        let mut cursor = from;

        'chunks: for index in 0..self.chunks.len() {
            if cursor >= end || segments.len() == max_buffers {
                break;
            }

            let (span_start, span_end) = self.chunk_span(index);
            if cursor >= span_end {
                continue;
            }
            assume!(cursor >= span_start, "read cursor fell into a gap");

            let chunk = &self.chunks[index];
            let alloc = chunk.alloc_len();
            let is_ring = matches!(self.mode, Mode::Circular | Mode::Multiple);
            let copy_end = end.min(span_end);

            let mut sub = cursor;
            while sub < copy_end {
                if segments.len() == max_buffers {
                    break 'chunks;
                }
                let relative = sub - chunk.start;
                let data_index = if is_ring {
                    (relative % alloc) as usize
                } else {
                    relative as usize
                };
                let run = (copy_end - sub).min(alloc - data_index as u64) as usize;
                segments.push((index, data_index, run));
                sub += run as u64;
            }

            cursor = copy_end;
        }

        segments
    }

    #[cfg(test)]
    pub(crate) fn chunk_count(&self) -> usize {
        self.chunks.len()
    }

    #[cfg(test)]
    pub(crate) fn external_references(&self) -> Vec<bool> {
        self.chunks.iter().map(|chunk| chunk.external_ref).collect()
    }

    #[cfg(test)]
    pub(crate) fn read_start(&self) -> u64 {
        let Some(front) = self.chunks.front() else {
            return 0;
        };
        let relative = self.base_offset - front.start;
        match self.mode {
            Mode::Circular | Mode::Multiple => relative % front.alloc_len(),
            Mode::Single | Mode::AppOwned => relative,
        }
    }

    #[cfg(test)]
    pub(crate) fn read_length(&self) -> u64 {
        self.contiguous_length()
            .min(self.front_end() - self.base_offset)
    }
}
