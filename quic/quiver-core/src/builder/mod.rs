// Copyright the quiver authors. All Rights Reserved.
// SPDX-License-Identifier: Apache-2.0

//! The packet builder
//!
//! Builds a chain of UDP datagrams, each holding one or more coalesced QUIC
//! packets. The builder owns the datapath send batch from allocation until
//! handoff: `prepare` opens a packet of the right type (finalizing the
//! previous one when the type changes), the scheduler writes frames into
//! the reserved payload region, and `finalize` pads, encrypts, applies
//! header protection, reports the packet to loss detection, and ships the
//! batch when complete.

use crate::{
    connection::{Connection, ConnectionId},
    crypto::{EncryptLevel, Key, KeyType, ENCRYPTION_OVERHEAD},
    packet::{
        self, KeyPhase, PacketType, HP_SAMPLE_LENGTH, PACKET_NUMBER_LENGTH,
    },
    path::{Path, MAX_MTU},
    time::Timestamp,
};
use alloc::{sync::Arc, vec::Vec};
use core::{fmt, time::Duration};

#[cfg(test)]
mod tests;

/// Most datagrams a single flush will batch before handing off
pub const MAX_DATAGRAMS_PER_SEND: usize = 40;

/// Spare bytes below which another QUIC packet is not worth coalescing
pub const MIN_PACKET_SPARE_SPACE: u16 = 40;

/// Client Initial datagrams are padded to at least this size
pub const INITIAL_PACKET_MIN_LENGTH: u16 = 1200;

/// Padding target for 1-RTT tail-loss probes, sized to elicit a stateless
/// reset plus a little fudge
pub const STATELESS_RESET_PROBE_LENGTH: u16 = 41 + 8;

/// Short-header packets batched before one header-protection pass
pub const MAX_HP_BATCH: usize = 16;

/// What the scheduler wants to put on the wire
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct SendFlags(u32);

impl SendFlags {
    pub const ACK: Self = Self(1 << 0);
    pub const CRYPTO: Self = Self(1 << 1);
    pub const PING: Self = Self(1 << 2);
    pub const CONNECTION_CLOSE: Self = Self(1 << 3);
    pub const PATH_CHALLENGE: Self = Self(1 << 4);
    pub const PMTUD: Self = Self(1 << 5);

    #[inline]
    #[must_use]
    pub const fn union(self, other: Self) -> Self {
        Self(self.0 | other.0)
    }

    #[inline]
    pub const fn contains(self, other: Self) -> bool {
        self.0 & other.0 != 0
    }
}

/// Frame metadata recorded with each sent packet, consumed by loss
/// detection when the packet is acknowledged or declared lost
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum SentFrame {
    Padding { length: u16 },
    Ping,
    Ack { largest_acknowledged: u64 },
    Crypto { offset: u64, length: u16 },
    Stream { id: u64, offset: u64, length: u16, fin: bool },
    MaxData { maximum: u64 },
    ConnectionClose,
    PathChallenge,
    PathResponse,
    HandshakeDone,
}

impl SentFrame {
    /// Everything except ACK, PADDING and CONNECTION_CLOSE elicits an ACK
    #[inline]
    pub fn is_ack_eliciting(&self) -> bool {
        !matches!(
            self,
            Self::Padding { .. } | Self::Ack { .. } | Self::ConnectionClose
        )
    }
}

/// Ownership of this record moves to loss detection on packet send
#[derive(Clone, Debug)]
pub struct SentPacketMetadata {
    pub packet_number: u64,
    pub key_type: KeyType,
    pub key_phase: KeyPhase,
    pub is_ack_eliciting: bool,
    pub is_pmtud: bool,
    pub suspected_lost: bool,
    pub sent_time: Timestamp,
    pub packet_length: u16,
    pub frames: Vec<SentFrame>,
}

/// A batch of finished datagrams owned by the builder until handoff
#[derive(Debug, Default)]
pub struct SendContext {
    pub datagrams: Vec<Vec<u8>>,
}

/// The UDP datapath collaborator
///
/// The datapath holds a sent batch until its completion callback; the
/// builder never blocks on it.
pub trait Datapath {
    /// Allocates a send batch; `None` models allocation failure
    fn alloc_send_context(&mut self) -> Option<SendContext>;

    /// Allocates a datagram payload buffer of `len` bytes
    fn alloc_datagram(&mut self, len: u16) -> Option<Vec<u8>>;

    /// Whether batched datagrams other than the last should be padded to
    /// their full size
    fn is_padding_preferred(&self) -> bool {
        false
    }

    fn is_send_context_full(&self, context: &SendContext) -> bool;

    /// Sends from the explicitly bound local address
    fn send_to(&mut self, path: &Path, context: SendContext);

    /// Sends specifying both local and remote addresses
    fn send_from_to(&mut self, path: &Path, context: SendContext);
}

/// The loss-detection collaborator
pub trait LossDetection {
    /// Takes ownership of a sent packet's metadata; called before the
    /// datagram is handed to the datapath
    fn on_packet_sent(&mut self, metadata: SentPacketMetadata) -> Result<(), ()>;

    /// Re-arms the loss timer after a retransmittable batch went out
    fn update_loss_detection_timer(&mut self);
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum BuilderError {
    /// No source connection ID is available to stamp packets with
    NoSourceCid,
}

impl fmt::Display for BuilderError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            Self::NoSourceCid => write!(f, "no source connection id to send with"),
        }
    }
}

#[cfg(feature = "std")]
impl std::error::Error for BuilderError {}

/// A short header awaiting its batched header-protection pass
///
/// `datagram: None` points into the datagram currently being built.
#[derive(Clone, Copy, Debug)]
struct BatchedHeader {
    datagram: Option<usize>,
    packet_start: u16,
    dest_cid_len: u8,
}

pub struct PacketBuilder<'a, D: Datapath, L: LossDetection> {
    connection: &'a mut Connection,
    path: &'a Path,
    datapath: &'a mut D,
    loss_detection: &'a mut L,

    source_cid: ConnectionId,
    send_allowance: u32,

    send_context: Option<SendContext>,
    datagram: Option<Vec<u8>>,
    datagram_length: u16,
    total_datagrams: usize,

    packet_type: Option<PacketType>,
    encrypt_level: EncryptLevel,
    key_type: KeyType,
    key: Option<Arc<dyn Key>>,
    packet_start: u16,
    header_length: u16,
    payload_length_offset: u16,
    packet_number_length: u8,
    minimum_datagram_length: u16,
    encryption_overhead: u16,

    packet_number: u64,
    is_ack_eliciting: bool,
    is_pmtud: bool,
    key_phase: KeyPhase,
    frames: Vec<SentFrame>,

    cipher_batch: [[u8; HP_SAMPLE_LENGTH]; MAX_HP_BATCH],
    header_batch: Vec<BatchedHeader>,

    packet_batch_sent: bool,
    packet_batch_retransmittable: bool,
}

impl<'a, D: Datapath, L: LossDetection> PacketBuilder<'a, D, L> {
    /// Starts a flush, computing the send allowance from congestion
    /// control and the path's amplification budget
    pub fn new(
        connection: &'a mut Connection,
        path: &'a Path,
        datapath: &'a mut D,
        loss_detection: &'a mut L,
        now: Timestamp,
    ) -> Result<Self, BuilderError> {
        let Some(source_cid) = connection.source_cids.first().copied() else {
            probe!("no source cid to send with");
            return Err(BuilderError::NoSourceCid);
        };

        let (time_since_last_send, time_valid) = match connection.last_flush_time {
            Some(last_flush) => (now.saturating_duration_since(last_flush), true),
            None => (Duration::ZERO, false),
        };

        let send_allowance = connection
            .congestion_control
            .send_allowance(time_since_last_send, time_valid)
            .min(path.allowance);
        connection.last_flush_time = Some(now);

        let encryption_overhead = if connection.settings.encryption_enabled {
            ENCRYPTION_OVERHEAD as u16
        } else {
            0
        };

        Ok(Self {
            connection,
            path,
            datapath,
            loss_detection,
            source_cid,
            send_allowance,
            send_context: None,
            datagram: None,
            datagram_length: 0,
            total_datagrams: 0,
            packet_type: None,
            encrypt_level: EncryptLevel::Initial,
            key_type: KeyType::Initial,
            key: None,
            packet_start: 0,
            header_length: 0,
            payload_length_offset: 0,
            packet_number_length: PACKET_NUMBER_LENGTH as u8,
            minimum_datagram_length: 0,
            encryption_overhead,
            packet_number: 0,
            is_ack_eliciting: false,
            is_pmtud: false,
            key_phase: KeyPhase::Zero,
            frames: Vec::new(),
            cipher_batch: [[0; HP_SAMPLE_LENGTH]; MAX_HP_BATCH],
            header_batch: Vec::with_capacity(MAX_HP_BATCH),
            packet_batch_sent: false,
            packet_batch_retransmittable: false,
        })
    }

    #[inline]
    pub fn send_allowance(&self) -> u32 {
        self.send_allowance
    }

    #[inline]
    pub fn total_datagrams(&self) -> usize {
        self.total_datagrams
    }

    /// Picks the key type for pending control frames by walking the
    /// available write keys from the lowest encryption level up
    pub fn key_type_for_control_frames(&self, send_flags: SendFlags) -> Option<KeyType> {
        let current = self.connection.keys.current_write_key()?;

        for key_type in KeyType::all() {
            if key_type > current {
                break;
            }
            // crypto data is never written with 0-RTT keys
            if key_type == KeyType::ZeroRtt {
                continue;
            }
            if !self.connection.keys.has_key(key_type) {
                continue;
            }

            let level = key_type.encrypt_level();
            if level == EncryptLevel::OneRtt {
                // always allowed to send with 1-RTT
                return Some(KeyType::OneRtt);
            }

            let space = self.connection.space(level);
            if send_flags.contains(SendFlags::ACK)
                && space.ack_tracker.ack_eliciting_packets_to_acknowledge() > 0
            {
                return Some(key_type);
            }

            if send_flags.contains(SendFlags::CRYPTO)
                && self.connection.crypto_pending_level == Some(level)
            {
                return Some(key_type);
            }
        }

        if send_flags.contains(SendFlags::CONNECTION_CLOSE.union(SendFlags::PING)) {
            // always sent with the current write key (0-RTT falls back to
            // Initial since close frames cannot use 0-RTT)
            return Some(if current == KeyType::ZeroRtt {
                KeyType::Initial
            } else {
                current
            });
        }

        if self.connection.keys.has_key(KeyType::OneRtt) {
            return Some(KeyType::OneRtt);
        }

        probe!("failed to pick a packet type for control frames");
        None
    }

    /// Picks the key type for stream data: 1-RTT, else 0-RTT early data
    pub fn key_type_for_stream_frames(&self) -> Option<KeyType> {
        if self.connection.keys.has_key(KeyType::OneRtt) {
            Some(KeyType::OneRtt)
        } else if self.connection.keys.has_key(KeyType::ZeroRtt) {
            Some(KeyType::ZeroRtt)
        } else {
            None
        }
    }

    pub fn prepare_for_control_frames(
        &mut self,
        is_tail_loss_probe: bool,
        send_flags: SendFlags,
        now: Timestamp,
    ) -> bool {
        debug_assert!(!send_flags.contains(SendFlags::PMTUD));
        let Some(key_type) = self.key_type_for_control_frames(send_flags) else {
            return false;
        };
        self.prepare(key_type, is_tail_loss_probe, false, now)
    }

    pub fn prepare_for_stream_frames(&mut self, is_tail_loss_probe: bool, now: Timestamp) -> bool {
        let Some(key_type) = self.key_type_for_stream_frames() else {
            return false;
        };
        self.prepare(key_type, is_tail_loss_probe, false, now)
    }

    pub fn prepare_for_path_mtu_discovery(&mut self, now: Timestamp) -> bool {
        self.prepare(KeyType::OneRtt, false, true, now)
    }

    /// Makes sure an open packet of the right type is ready for frames
    ///
    /// Finalizes the current packet when the type changes. Returns `false`
    /// when nothing can be prepared: missing key (which silently aborts
    /// the connection), allocation failure, or batch limits.
    pub fn prepare(
        &mut self,
        new_key_type: KeyType,
        is_tail_loss_probe: bool,
        is_pmtud: bool,
        now: Timestamp,
    ) -> bool {
        if !self.connection.keys.has_key(new_key_type) {
            // a missing key at this point means the connection already hit
            // a fatal error; nothing can be sent, not even a close
            probe!("null key in builder prepare");
            self.connection.silently_abort();
            return false;
        }

        debug_assert!(!(is_pmtud && is_tail_loss_probe));

        let new_packet_type = PacketType::from_key_type(new_key_type);
        let datagram_size = (self.path.mtu as u32).min(self.path.allowance) as u16;

        let mut new_quic_packet = false;
        if self.packet_type != Some(new_packet_type) || is_pmtud {
            if self.send_context.is_some() {
                self.finalize(is_pmtud, now);
            }
            if self.send_context.is_none() && self.total_datagrams >= MAX_DATAGRAMS_PER_SEND {
                return false;
            }
            new_quic_packet = true;
        } else if self.datagram.is_none() {
            new_quic_packet = true;
        } else {
            let capacity = self.datagram.as_ref().map_or(0, |d| d.len() as u16);
            assume!(capacity - self.datagram_length >= MIN_PACKET_SPARE_SPACE);
        }

        if self.datagram.is_none() {
            if self.send_context.is_none() {
                self.send_context = self.datapath.alloc_send_context();
                if self.send_context.is_none() {
                    probe!("send context allocation failed");
                    return false;
                }
            }

            let base_length = if is_pmtud { MAX_MTU } else { datagram_size };
            let mut new_datagram_length = base_length.min(self.path.max_udp_payload_size);
            if let Some(peer_limit) = self.connection.peer_max_udp_payload_size {
                new_datagram_length = new_datagram_length.min(peer_limit);
            }

            let Some(datagram) = self.datapath.alloc_datagram(new_datagram_length) else {
                probe!("datagram allocation failed");
                return false;
            };
            assume!(datagram.len() == new_datagram_length as usize);
            self.datagram = Some(datagram);
            self.datagram_length = 0;
            self.minimum_datagram_length = 0;

            if is_tail_loss_probe && !self.connection.is_server() {
                if self.connection.keys.current_write_key() == Some(KeyType::OneRtt) {
                    // pad 1-RTT probes enough to elicit a stateless reset
                    self.minimum_datagram_length = STATELESS_RESET_PROBE_LENGTH;
                } else {
                    // Initial/Handshake probes unblock a server stuck on
                    // source address validation
                    self.minimum_datagram_length = new_datagram_length;
                }
            } else if new_packet_type == PacketType::Initial && !self.connection.is_server() {
                self.minimum_datagram_length =
                    INITIAL_PACKET_MIN_LENGTH.min(new_datagram_length);
            } else if is_pmtud {
                self.minimum_datagram_length = new_datagram_length;
            }

            probe!(space = self.datagram_capacity(), "new udp datagram");
        }

        if new_quic_packet {
            self.start_packet(new_packet_type, new_key_type, is_pmtud);
        }

        debug_assert_eq!(self.packet_type, Some(new_packet_type));
        true
    }

    /// Initializes the next QUIC packet's header at the datagram cursor
    fn start_packet(&mut self, packet_type: PacketType, key_type: KeyType, is_pmtud: bool) {
        let encrypt_level = key_type.encrypt_level();
        let space = self.connection.space_mut(encrypt_level);
        let packet_number = space.next_packet_number;
        space.next_packet_number += 1;

        let key_phase = space.current_key_phase;

        self.packet_type = Some(packet_type);
        self.encrypt_level = encrypt_level;
        self.key_type = key_type;
        self.key = self.connection.keys.key(key_type).cloned();
        assume!(self.key.is_some(), "prepare checked the key");

        self.packet_number = packet_number;
        self.is_ack_eliciting = false;
        self.is_pmtud = is_pmtud;
        self.key_phase = key_phase;
        self.frames.clear();

        self.packet_start = self.datagram_length;
        self.header_length = 0;
        self.payload_length_offset = 0;
        self.packet_number_length = PACKET_NUMBER_LENGTH as u8;

        let version = self.connection.quic_version;
        let dest_cid = self.path.dest_cid;
        let source_cid = self.source_cid;
        let spin_bit = self.path.spin_bit;
        let token = core::mem::take(&mut self.connection.initial_token);
        let packet_start = self.packet_start as usize;

        let Some(datagram) = self.datagram.as_mut() else {
            assume!(false, "prepare allocated the datagram");
            return;
        };
        let buffer = &mut datagram[packet_start..];

        if packet_type == PacketType::OneRtt {
            if let Some(len) =
                packet::encode_short_header(dest_cid.as_bytes(), packet_number, spin_bit, key_phase, buffer)
            {
                self.header_length = len;
            }
        } else {
            let token = if packet_type == PacketType::Initial {
                &token[..]
            } else {
                &[]
            };
            if let Some(header) = packet::encode_long_header(
                version,
                packet_type,
                dest_cid.as_bytes(),
                source_cid.as_bytes(),
                token,
                packet_number as u32,
                buffer,
            ) {
                self.header_length = header.len;
                self.payload_length_offset = header.payload_length_offset;
                self.packet_number_length = header.packet_number_length;
            }
        }

        self.connection.initial_token = token;
        self.datagram_length += self.header_length;

        probe!(
            packet_number,
            packet_type = ?packet_type,
            "new quic packet"
        );
    }

    #[inline]
    fn datagram_capacity(&self) -> u16 {
        self.datagram.as_ref().map_or(0, |d| d.len() as u16)
    }

    /// Payload bytes still writable in the open packet
    pub fn available_payload_space(&self) -> usize {
        ensure!(self.datagram.is_some(), 0);
        (self.datagram_capacity() as usize)
            .saturating_sub(self.datagram_length as usize + self.encryption_overhead as usize)
    }

    /// Copies an encoded frame into the packet and records its metadata
    pub fn write_frame(&mut self, encoded: &[u8], frame: SentFrame) -> bool {
        ensure!(encoded.len() <= self.available_payload_space(), false);

        let start = self.datagram_length as usize;
        let datagram = self
            .datagram
            .as_mut()
            .expect("available_payload_space checked the datagram");
        datagram[start..start + encoded.len()].copy_from_slice(encoded);
        self.datagram_length += encoded.len() as u16;

        self.is_ack_eliciting |= frame.is_ack_eliciting();
        self.frames.push(frame);
        true
    }

    /// Completes the open QUIC packet and, when the datagram or batch is
    /// done, hands it down the stack
    pub fn finalize(&mut self, flush: bool, now: Timestamp) {
        let final_quic_packet = self.finalize_packet(flush, now);

        if !final_quic_packet {
            return;
        }

        if let Some(mut datagram) = self.datagram.take() {
            datagram.truncate(self.datagram_length as usize);
            if let Some(context) = self.send_context.as_mut() {
                context.datagrams.push(datagram);
                let index = context.datagrams.len() - 1;
                // pin any header-protection entries that pointed at the
                // in-progress datagram
                for header in &mut self.header_batch {
                    if header.datagram.is_none() {
                        header.datagram = Some(index);
                    }
                }
            }
            self.datagram_length = 0;
            self.total_datagrams += 1;
        }

        let context_full = self
            .send_context
            .as_ref()
            .map_or(false, |context| self.datapath.is_send_context_full(context));
        if flush || context_full {
            self.finalize_header_protection();
            self.send_batch();
        }

        if self.packet_type == Some(PacketType::Retry) {
            // a Retry is terminal for the sender
            assume!(self.packet_number == 0);
            self.connection.close_silently();
        }
    }

    /// Pads, patches, encrypts and protects the open packet
    ///
    /// Returns whether the datagram is complete.
    fn finalize_packet(&mut self, flush: bool, now: Timestamp) -> bool {
        if self.datagram.is_none() || self.frames.is_empty() {
            // nothing was framed: undo the header
            if self.datagram.is_some() {
                let space = self.connection.space_mut(self.encrypt_level);
                space.next_packet_number -= 1;
                self.datagram_length -= self.header_length;
                self.header_length = 0;
                self.packet_type = None;

                if self.datagram_length == 0 {
                    self.datagram = None;
                }
            }
            return flush;
        }

        let capacity = self.datagram_capacity();
        let mut payload_length = self.datagram_length - (self.packet_start + self.header_length);
        let expected_final_length = self.datagram_length + self.encryption_overhead;
        let is_short_header = self.packet_type == Some(PacketType::OneRtt);

        assume!(capacity >= expected_final_length);

        let mut final_quic_packet = flush
            || is_short_header
            || capacity - expected_final_length < MIN_PACKET_SPARE_SPACE;

        if final_quic_packet && !flush && self.datapath.is_padding_preferred() {
            // when the datapath batches contiguously, all but the final
            // datagram must be full length
            self.minimum_datagram_length = capacity;
            final_quic_packet = true;
        }

        // padding: reach the minimum datagram length, and always leave
        // header protection at least four bytes of packet number + payload
        // to sample
        let padding_length = if final_quic_packet
            && expected_final_length < self.minimum_datagram_length
        {
            self.minimum_datagram_length - expected_final_length
        } else if (self.packet_number_length as u16 + payload_length) < 4 {
            4 - self.packet_number_length as u16 - payload_length
        } else {
            0
        };

        if padding_length > 0 {
            let datagram = self.datagram.as_mut().expect("checked above");
            let start = self.datagram_length as usize;
            datagram[start..start + padding_length as usize].fill(0);
            self.frames.push(SentFrame::Padding {
                length: padding_length,
            });
            payload_length += padding_length;
            self.datagram_length += padding_length;
        }

        // long headers carry the payload length; patch the reserved slot
        if !is_short_header {
            let datagram = self.datagram.as_mut().expect("checked above");
            let slot = (self.packet_start + self.payload_length_offset) as usize;
            packet::encode_varint16(
                self.packet_number_length as u16 + payload_length + self.encryption_overhead,
                &mut datagram[slot..slot + 2],
            );
        }

        if self.connection.settings.encryption_enabled && !self.protect_packet(payload_length) {
            return final_quic_packet;
        }

        // hand the metadata to loss detection before the datagram can
        // reach the wire
        let packet_length = self.header_length
            + payload_length
            + if self.connection.settings.encryption_enabled {
                self.encryption_overhead
            } else {
                0
            };
        let metadata = SentPacketMetadata {
            packet_number: self.packet_number,
            key_type: self.key_type,
            key_phase: self.key_phase,
            is_ack_eliciting: self.is_ack_eliciting,
            is_pmtud: self.is_pmtud,
            suspected_lost: false,
            sent_time: now,
            packet_length,
            frames: core::mem::take(&mut self.frames),
        };

        probe!(
            packet_number = self.packet_number,
            packet_length,
            "packet sent"
        );

        if self.loss_detection.on_packet_sent(metadata).is_err() {
            // the datagram is already scheduled; keep the connection alive
            // and let loss detection recover on its own
            return final_quic_packet;
        }

        if self.is_ack_eliciting {
            self.packet_batch_retransmittable = true;
            self.send_allowance = self
                .send_allowance
                .saturating_sub(packet_length as u32);
        }

        final_quic_packet
    }

    /// Encrypts the payload and applies (or batches) header protection
    fn protect_packet(&mut self, unpadded_payload_length: u16) -> bool {
        let mut payload_length = unpadded_payload_length;
        payload_length += self.encryption_overhead;
        self.datagram_length += self.encryption_overhead;

        let Some(key) = self.key.clone() else {
            assume!(false, "an open packet always has a key");
            return false;
        };
        let is_short_header = self.packet_type == Some(PacketType::OneRtt);
        let packet_start = self.packet_start as usize;
        let header_length = self.header_length as usize;
        let packet_number = self.packet_number;
        let pn_length = self.packet_number_length as usize;

        {
            let datagram = self.datagram.as_mut().expect("checked by caller");
            let packet =
                &mut datagram[packet_start..packet_start + header_length + payload_length as usize];
            let (header, payload) = packet.split_at_mut(header_length);

            if key.seal(packet_number, header, payload).is_err() {
                probe!("encryption failure");
                self.connection.silently_abort();
                return false;
            }
        }

        if self.connection.settings.header_protection_enabled {
            let pn_start = packet_start + header_length - pn_length;
            let sample_start = pn_start + 4;

            if is_short_header {
                let datagram = self.datagram.as_ref().expect("checked by caller");
                let mut sample = [0u8; HP_SAMPLE_LENGTH];
                sample.copy_from_slice(&datagram[sample_start..sample_start + HP_SAMPLE_LENGTH]);

                // short headers batch the mask computation
                self.cipher_batch[self.header_batch.len()] = sample;
                self.header_batch.push(BatchedHeader {
                    datagram: None,
                    packet_start: self.packet_start,
                    dest_cid_len: self.path.dest_cid.len() as u8,
                });

                if self.header_batch.len() == MAX_HP_BATCH {
                    self.finalize_header_protection();
                }
            } else {
                // long headers protect immediately since coalesced levels
                // use different keys
                assume!(self.header_batch.is_empty() || is_short_header);
                let datagram = self.datagram.as_mut().expect("checked by caller");
                let sample_end = sample_start + HP_SAMPLE_LENGTH;
                let mut sample = [0u8; HP_SAMPLE_LENGTH];
                sample.copy_from_slice(&datagram[sample_start..sample_end]);
                let mask = key.header_protection_mask(&sample);
                packet::apply_long_header_protection(
                    &mut datagram[packet_start..],
                    header_length - pn_length,
                    pn_length,
                    &mask,
                );
            }
        }

        // count bytes toward the current key phase and trigger an update
        // before the per-key limit can be reached
        let max_bytes_per_key = self.connection.settings.max_bytes_per_key;
        let handshake_confirmed = self.connection.handshake_confirmed;
        let space = self.connection.space_mut(self.encrypt_level);
        space.current_key_phase_bytes_sent +=
            (payload_length - self.encryption_overhead) as u64;

        if is_short_header
            && space.current_key_phase_bytes_sent + MAX_MTU as u64 >= max_bytes_per_key
            && !space.awaiting_key_phase_confirmation
            && handshake_confirmed
        {
            // masks batched so far belong to the outgoing key
            self.finalize_header_protection();

            if let Some(new_key) = self.connection.try_key_phase_update() {
                self.key = Some(new_key);
            }
        }

        true
    }

    /// Computes the batched header-protection masks and applies them to
    /// every batched short header, oldest first
    fn finalize_header_protection(&mut self) {
        ensure!(!self.header_batch.is_empty());
        let Some(key) = self.key.clone() else {
            return;
        };

        let batch = core::mem::take(&mut self.header_batch);
        for (index, header) in batch.iter().enumerate() {
            let mask = key.header_protection_mask(&self.cipher_batch[index]);

            let buffer = match header.datagram {
                Some(datagram_index) => self
                    .send_context
                    .as_mut()
                    .and_then(|context| context.datagrams.get_mut(datagram_index)),
                None => self.datagram.as_mut(),
            };
            let Some(buffer) = buffer else {
                assume!(false, "batched header lost its datagram");
                continue;
            };

            packet::apply_short_header_protection(
                &mut buffer[header.packet_start as usize..],
                header.dest_cid_len as usize,
                &mask,
            );
        }

        self.cipher_batch = [[0; HP_SAMPLE_LENGTH]; MAX_HP_BATCH];
    }

    fn send_batch(&mut self) {
        let Some(context) = self.send_context.take() else {
            return;
        };

        probe!(datagrams = self.total_datagrams, "sending batch");

        if self.path.is_local_address_bound {
            self.datapath.send_to(self.path, context);
        } else {
            self.datapath.send_from_to(self.path, context);
        }

        self.packet_batch_sent = true;
    }

    /// Ends the flush: refreshes the loss timer when a retransmittable
    /// batch went out and wipes header-protection scratch state
    pub fn cleanup(mut self) {
        debug_assert!(
            self.send_context.is_none(),
            "finalize(flush) must run before cleanup"
        );

        if self.packet_batch_sent && self.packet_batch_retransmittable {
            self.loss_detection.update_loss_detection_timer();
        }

        self.frames.clear();
        self.cipher_batch = [[0; HP_SAMPLE_LENGTH]; MAX_HP_BATCH];
    }
}
