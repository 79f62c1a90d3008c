// Copyright the quiver authors. All Rights Reserved.
// SPDX-License-Identifier: Apache-2.0

//! Per-connection state owned by the packet pipeline
//!
//! A connection owns its packet-number spaces, write keys, and congestion
//! controller exclusively; everything here runs on the connection's worker
//! with no locking.

pub mod id;
pub mod settings;

pub use id::ConnectionId;
pub use settings::{CongestionControlAlgorithm, Settings};

use crate::{
    crypto::{EncryptLevel, Key, KeySet, KeyType},
    packet::KeyPhase,
    range::{RangeError, RangeTracker, ACK_TRACKER_RANGES},
    recovery::CongestionController,
    time::Timestamp,
    transmission::BlockedReasons,
};
use alloc::{sync::Arc, vec::Vec};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Role {
    Client,
    Server,
}

/// Tracks packets received from the peer within one packet-number space
#[derive(Clone, Debug)]
pub struct AckTracker {
    packet_numbers_received: RangeTracker,
    ack_eliciting_packets_to_acknowledge: u32,
}

impl Default for AckTracker {
    fn default() -> Self {
        Self {
            packet_numbers_received: RangeTracker::new(ACK_TRACKER_RANGES),
            ack_eliciting_packets_to_acknowledge: 0,
        }
    }
}

impl AckTracker {
    /// Records a received packet number, reporting duplicates
    pub fn on_packet_received(
        &mut self,
        packet_number: u64,
        ack_eliciting: bool,
    ) -> Result<bool, RangeError> {
        if self.packet_numbers_received.is_range_contained(packet_number, 1) {
            return Ok(true);
        }

        self.packet_numbers_received.add_value(packet_number)?;
        if ack_eliciting {
            self.ack_eliciting_packets_to_acknowledge += 1;
        }
        Ok(false)
    }

    /// The value packet-number decoding centers on
    #[inline]
    pub fn expected_packet_number(&self) -> u64 {
        self.packet_numbers_received
            .max_value()
            .map_or(0, |largest| largest + 1)
    }

    #[inline]
    pub fn ack_eliciting_packets_to_acknowledge(&self) -> u32 {
        self.ack_eliciting_packets_to_acknowledge
    }

    /// Called once an ACK frame covering the tracked packets was built
    pub fn on_ack_frame_sent(&mut self) {
        self.ack_eliciting_packets_to_acknowledge = 0;
    }

    #[inline]
    pub fn received_packets(&self) -> &RangeTracker {
        &self.packet_numbers_received
    }
}

/// One packet-number space (Initial, Handshake, or application data)
#[derive(Clone, Debug)]
pub struct PacketSpace {
    pub encrypt_level: EncryptLevel,
    /// Next packet number to send, strictly monotone within the space
    pub next_packet_number: u64,
    /// Current 1-RTT key phase bit (application space only)
    pub current_key_phase: KeyPhase,
    pub current_key_phase_bytes_sent: u64,
    /// A key update was sent and the peer has not confirmed it yet
    pub awaiting_key_phase_confirmation: bool,
    pub ack_tracker: AckTracker,
}

impl PacketSpace {
    fn new(encrypt_level: EncryptLevel) -> Self {
        Self {
            encrypt_level,
            next_packet_number: 0,
            current_key_phase: KeyPhase::Zero,
            current_key_phase_bytes_sent: 0,
            awaiting_key_phase_confirmation: false,
            ack_tracker: AckTracker::default(),
        }
    }
}

/// Why a connection stopped, if it has
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum CloseState {
    #[default]
    Open,
    /// Killed locally without notifying the peer
    SilentlyAborted,
    /// Closed locally with NO_ERROR, no close frame pending
    SilentlyClosed,
}

pub struct Connection {
    pub role: Role,
    pub settings: Settings,
    pub quic_version: u32,
    pub keys: KeySet,
    /// Next-phase 1-RTT key pre-staged by the TLS collaborator; consumed
    /// by a send-triggered key update
    staged_one_rtt_key: Option<Arc<dyn Key>>,
    spaces: [PacketSpace; EncryptLevel::COUNT],
    pub congestion_control: CongestionController,
    pub source_cids: Vec<ConnectionId>,
    pub initial_token: Vec<u8>,
    /// Peer's max_udp_payload_size transport parameter, once known
    pub peer_max_udp_payload_size: Option<u16>,
    pub handshake_confirmed: bool,
    /// Crypto level with handshake data ready to send, owned by TLS
    pub crypto_pending_level: Option<EncryptLevel>,
    pub close_state: CloseState,
    pub last_flush_time: Option<Timestamp>,
    pub blocked_reasons: BlockedReasons,
}

impl Connection {
    pub fn new(role: Role, settings: Settings, quic_version: u32, datagram_payload_size: u16) -> Self {
        Self {
            role,
            settings,
            quic_version,
            keys: KeySet::new(),
            staged_one_rtt_key: None,
            spaces: [
                PacketSpace::new(EncryptLevel::Initial),
                PacketSpace::new(EncryptLevel::Handshake),
                PacketSpace::new(EncryptLevel::OneRtt),
            ],
            congestion_control: CongestionController::new(&settings, datagram_payload_size),
            source_cids: Vec::new(),
            initial_token: Vec::new(),
            peer_max_udp_payload_size: None,
            handshake_confirmed: false,
            crypto_pending_level: None,
            close_state: CloseState::Open,
            last_flush_time: None,
            blocked_reasons: BlockedReasons::NONE,
        }
    }

    #[inline]
    pub fn is_server(&self) -> bool {
        self.role == Role::Server
    }

    #[inline]
    pub fn space(&self, level: EncryptLevel) -> &PacketSpace {
        &self.spaces[level.index()]
    }

    #[inline]
    pub fn space_mut(&mut self, level: EncryptLevel) -> &mut PacketSpace {
        &mut self.spaces[level.index()]
    }

    #[inline]
    pub fn is_open(&self) -> bool {
        self.close_state == CloseState::Open
    }

    /// Kills the connection without telling the peer, used when a fatal
    /// error leaves nothing sendable
    pub fn silently_abort(&mut self) {
        if self.is_open() {
            self.close_state = CloseState::SilentlyAborted;
        }
    }

    /// Closes the connection locally with NO_ERROR
    pub fn close_silently(&mut self) {
        if self.is_open() {
            self.close_state = CloseState::SilentlyClosed;
        }
    }

    /// Pre-stages the next-phase 1-RTT write key
    ///
    /// Key derivation belongs to TLS; the send path only swaps handles. A
    /// send-triggered update that finds no staged key is deferred.
    pub fn stage_one_rtt_key(&mut self, key: Arc<dyn Key>) {
        self.staged_one_rtt_key = Some(key);
    }

    /// Performs a key-phase update if a staged key is available, returning
    /// the new write key
    pub fn try_key_phase_update(&mut self) -> Option<Arc<dyn Key>> {
        let new_key = self.staged_one_rtt_key.take()?;
        self.keys.replace_key(KeyType::OneRtt, new_key.clone());

        let space = self.space_mut(EncryptLevel::OneRtt);
        space.current_key_phase = !space.current_key_phase;
        space.current_key_phase_bytes_sent = 0;
        space.awaiting_key_phase_confirmation = true;

        Some(new_key)
    }
}

impl core::fmt::Debug for Connection {
    fn fmt(&self, f: &mut core::fmt::Formatter) -> core::fmt::Result {
        f.debug_struct("Connection")
            .field("role", &self.role)
            .field("quic_version", &self.quic_version)
            .field("close_state", &self.close_state)
            .field("handshake_confirmed", &self.handshake_confirmed)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ack_tracker_duplicates() {
        let mut tracker = AckTracker::default();
        assert_eq!(tracker.expected_packet_number(), 0);

        assert!(!tracker.on_packet_received(0, true).unwrap());
        assert!(!tracker.on_packet_received(1, false).unwrap());
        assert!(tracker.on_packet_received(1, true).unwrap());

        assert_eq!(tracker.ack_eliciting_packets_to_acknowledge(), 1);
        assert_eq!(tracker.expected_packet_number(), 2);

        tracker.on_ack_frame_sent();
        assert_eq!(tracker.ack_eliciting_packets_to_acknowledge(), 0);
    }

    #[test]
    fn key_phase_update_requires_staged_key() {
        let mut connection = Connection::new(Role::Client, Settings::default(), 1, 1280);
        connection
            .keys
            .set_key(KeyType::OneRtt, crate::crypto::testing::key(1));

        // nothing staged: the update is deferred
        assert!(connection.try_key_phase_update().is_none());
        assert_eq!(
            connection.space(EncryptLevel::OneRtt).current_key_phase,
            KeyPhase::Zero
        );

        connection.stage_one_rtt_key(crate::crypto::testing::key(2));
        assert!(connection.try_key_phase_update().is_some());

        let space = connection.space(EncryptLevel::OneRtt);
        assert_eq!(space.current_key_phase, KeyPhase::One);
        assert!(space.awaiting_key_phase_confirmation);
        assert_eq!(space.current_key_phase_bytes_sent, 0);
    }

    #[test]
    fn close_states() {
        let mut connection = Connection::new(Role::Server, Settings::default(), 1, 1280);
        assert!(connection.is_open());
        connection.silently_abort();
        assert_eq!(connection.close_state, CloseState::SilentlyAborted);
        // a later close does not overwrite the abort
        connection.close_silently();
        assert_eq!(connection.close_state, CloseState::SilentlyAborted);
    }
}
