// Copyright the quiver authors. All Rights Reserved.
// SPDX-License-Identifier: Apache-2.0

use super::*;
use crate::{
    connection::{CloseState, Role, Settings},
    crypto::{self, testing::TestKey},
    time::{Clock, NoopClock},
};

struct TestDatapath {
    sent: Vec<SendContext>,
    context_capacity: usize,
    padding_preferred: bool,
    fail_context_alloc: bool,
}

impl Default for TestDatapath {
    fn default() -> Self {
        Self {
            sent: Vec::new(),
            context_capacity: 64,
            padding_preferred: false,
            fail_context_alloc: false,
        }
    }
}

impl Datapath for TestDatapath {
    fn alloc_send_context(&mut self) -> Option<SendContext> {
        if self.fail_context_alloc {
            None
        } else {
            Some(SendContext::default())
        }
    }

    fn alloc_datagram(&mut self, len: u16) -> Option<Vec<u8>> {
        Some(vec![0; len as usize])
    }

    fn is_padding_preferred(&self) -> bool {
        self.padding_preferred
    }

    fn is_send_context_full(&self, context: &SendContext) -> bool {
        context.datagrams.len() >= self.context_capacity
    }

    fn send_to(&mut self, _path: &Path, context: SendContext) {
        self.sent.push(context);
    }

    fn send_from_to(&mut self, _path: &Path, context: SendContext) {
        self.sent.push(context);
    }
}

#[derive(Default)]
struct TestLossDetection {
    packets: Vec<SentPacketMetadata>,
    timer_updates: usize,
    fail_next: bool,
}

impl LossDetection for TestLossDetection {
    fn on_packet_sent(&mut self, metadata: SentPacketMetadata) -> Result<(), ()> {
        if self.fail_next {
            self.fail_next = false;
            return Err(());
        }
        self.packets.push(metadata);
        Ok(())
    }

    fn update_loss_detection_timer(&mut self) {
        self.timer_updates += 1;
    }
}

const DEST_CID: &[u8] = &[9, 9, 9, 9, 9, 9, 9, 9];
const MTU: u16 = 1280;

fn connection(role: Role, keys: &[(KeyType, u8)]) -> Connection {
    let settings = Settings {
        pacing_enabled: false,
        ..Default::default()
    };
    let mut connection = Connection::new(role, settings, 1, MTU);
    connection
        .source_cids
        .push(ConnectionId::try_from(&[1, 2, 3, 4][..]).unwrap());
    for (key_type, key_byte) in keys {
        connection
            .keys
            .set_key(*key_type, crypto::testing::key(*key_byte));
    }
    connection
}

fn path() -> Path {
    Path::new(ConnectionId::try_from(DEST_CID).unwrap(), MTU)
}

fn now() -> Timestamp {
    NoopClock.get_time()
}

/// Undoes header protection and payload encryption of a short-header
/// packet built with `TestKey`
fn decode_short_packet(datagram: &[u8], key: &TestKey) -> (u32, Vec<u8>) {
    let mut bytes = datagram.to_vec();
    let pn_start = 1 + DEST_CID.len();
    let sample_start = pn_start + 4;

    let mut sample = [0u8; HP_SAMPLE_LENGTH];
    sample.copy_from_slice(&bytes[sample_start..sample_start + HP_SAMPLE_LENGTH]);
    let mask = crypto::Key::header_protection_mask(key, &sample);
    packet::apply_short_header_protection(&mut bytes, DEST_CID.len(), &mask);

    let mut pn_bytes = [0u8; 4];
    pn_bytes.copy_from_slice(&bytes[pn_start..pn_start + 4]);
    let packet_number = u32::from_be_bytes(pn_bytes);

    let mut payload = bytes[pn_start + 4..].to_vec();
    key.unseal(packet_number as u64, &mut payload);
    payload.truncate(payload.len() - ENCRYPTION_OVERHEAD);

    (packet_number, payload)
}

#[test]
fn initialize_requires_source_cid() {
    let mut connection = connection(Role::Client, &[(KeyType::Initial, 1)]);
    connection.source_cids.clear();
    let path = path();
    let mut datapath = TestDatapath::default();
    let mut loss = TestLossDetection::default();

    let result = PacketBuilder::new(&mut connection, &path, &mut datapath, &mut loss, now());
    assert_eq!(result.err(), Some(BuilderError::NoSourceCid));
}

#[test]
fn missing_key_silently_aborts() {
    let mut connection = connection(Role::Client, &[(KeyType::Initial, 1)]);
    let path = path();
    let mut datapath = TestDatapath::default();
    let mut loss = TestLossDetection::default();

    let mut builder =
        PacketBuilder::new(&mut connection, &path, &mut datapath, &mut loss, now()).unwrap();
    assert!(!builder.prepare(KeyType::OneRtt, false, false, now()));
    builder.cleanup();

    assert_eq!(connection.close_state, CloseState::SilentlyAborted);
}

#[test]
fn context_alloc_failure_is_retryable() {
    let mut connection = connection(Role::Client, &[(KeyType::Initial, 1)]);
    let path = path();
    let mut datapath = TestDatapath {
        fail_context_alloc: true,
        ..Default::default()
    };
    let mut loss = TestLossDetection::default();

    let mut builder =
        PacketBuilder::new(&mut connection, &path, &mut datapath, &mut loss, now()).unwrap();
    assert!(!builder.prepare(KeyType::Initial, false, false, now()));
    builder.cleanup();

    // the connection survives an allocation failure
    assert!(connection.is_open());
}

#[test]
fn client_initial_is_padded() {
    let mut connection = connection(Role::Client, &[(KeyType::Initial, 1)]);
    connection.crypto_pending_level = Some(EncryptLevel::Initial);
    let path = path();
    let mut datapath = TestDatapath::default();
    let mut loss = TestLossDetection::default();

    let mut builder =
        PacketBuilder::new(&mut connection, &path, &mut datapath, &mut loss, now()).unwrap();
    assert!(builder.prepare_for_control_frames(false, SendFlags::CRYPTO, now()));
    assert!(builder.write_frame(
        &[0x06, 0x00, 0x04, 1, 2, 3, 4],
        SentFrame::Crypto { offset: 0, length: 4 },
    ));
    builder.finalize(true, now());
    builder.cleanup();

    assert_eq!(datapath.sent.len(), 1);
    let datagram = &datapath.sent[0].datagrams[0];
    assert!(datagram.len() >= INITIAL_PACKET_MIN_LENGTH as usize);

    // the padding shows up in the sent-packet metadata
    assert_eq!(loss.packets.len(), 1);
    assert!(loss.packets[0]
        .frames
        .iter()
        .any(|frame| matches!(frame, SentFrame::Padding { .. })));
    assert!(loss.packets[0].is_ack_eliciting);
}

#[test]
fn server_initial_is_not_padded_to_minimum() {
    let mut connection = connection(Role::Server, &[(KeyType::Initial, 1)]);
    connection.crypto_pending_level = Some(EncryptLevel::Initial);
    let path = path();
    let mut datapath = TestDatapath::default();
    let mut loss = TestLossDetection::default();

    let mut builder =
        PacketBuilder::new(&mut connection, &path, &mut datapath, &mut loss, now()).unwrap();
    assert!(builder.prepare(KeyType::Initial, false, false, now()));
    assert!(builder.write_frame(&[0x01], SentFrame::Ping));
    builder.finalize(true, now());
    builder.cleanup();

    let datagram = &datapath.sent[0].datagrams[0];
    assert!(datagram.len() < INITIAL_PACKET_MIN_LENGTH as usize);
}

#[test]
fn short_header_round_trip() {
    let key_byte = 0x5a;
    let mut connection = connection(Role::Client, &[(KeyType::OneRtt, key_byte)]);
    let path = path();
    let mut datapath = TestDatapath::default();
    let mut loss = TestLossDetection::default();

    let frame_bytes = [0x01, 0x02, 0x03, 0x04, 0x05];
    let mut builder =
        PacketBuilder::new(&mut connection, &path, &mut datapath, &mut loss, now()).unwrap();
    assert!(builder.prepare(KeyType::OneRtt, false, false, now()));
    assert!(builder.write_frame(&frame_bytes, SentFrame::Ping));
    builder.finalize(true, now());
    builder.cleanup();

    assert_eq!(loss.timer_updates, 1);
    assert_eq!(datapath.sent.len(), 1);
    let datagram = &datapath.sent[0].datagrams[0];

    let key = TestKey::new(key_byte);
    let (packet_number, payload) = decode_short_packet(datagram, &key);
    assert_eq!(packet_number, 0);
    assert_eq!(&payload[..frame_bytes.len()], &frame_bytes);

    // the unmasked first byte carries the fixed bit and pn length 4
    let mut bytes = datagram.clone();
    let pn_start = 1 + DEST_CID.len();
    let mut sample = [0u8; HP_SAMPLE_LENGTH];
    sample.copy_from_slice(&bytes[pn_start + 4..pn_start + 4 + HP_SAMPLE_LENGTH]);
    let mask = crypto::Key::header_protection_mask(&key, &sample);
    packet::apply_short_header_protection(&mut bytes, DEST_CID.len(), &mask);
    assert_eq!(bytes[0] & 0b1100_0011, 0b0100_0011);
    assert_eq!(&bytes[1..1 + DEST_CID.len()], DEST_CID);
}

#[test]
fn packet_numbers_are_monotone() {
    let mut connection = connection(Role::Client, &[(KeyType::OneRtt, 1)]);
    let path = path();
    let mut datapath = TestDatapath::default();
    let mut loss = TestLossDetection::default();

    for _ in 0..5 {
        let mut builder =
            PacketBuilder::new(&mut connection, &path, &mut datapath, &mut loss, now()).unwrap();
        assert!(builder.prepare(KeyType::OneRtt, false, false, now()));
        assert!(builder.write_frame(&[0x01], SentFrame::Ping));
        builder.finalize(true, now());
        builder.cleanup();
    }

    let numbers: Vec<u64> = loss.packets.iter().map(|packet| packet.packet_number).collect();
    assert_eq!(numbers, [0, 1, 2, 3, 4]);
}

#[test]
fn empty_packet_is_undone() {
    let mut connection = connection(Role::Client, &[(KeyType::OneRtt, 1)]);
    let path = path();
    let mut datapath = TestDatapath::default();
    let mut loss = TestLossDetection::default();

    let mut builder =
        PacketBuilder::new(&mut connection, &path, &mut datapath, &mut loss, now()).unwrap();
    assert!(builder.prepare(KeyType::OneRtt, false, false, now()));
    // no frames written
    builder.finalize(true, now());
    builder.cleanup();

    assert!(loss.packets.is_empty());
    assert_eq!(
        connection
            .space(EncryptLevel::OneRtt)
            .next_packet_number,
        0,
        "the unused packet number is returned"
    );
    assert!(datapath.sent.iter().all(|context| context.datagrams.is_empty()));
    assert_eq!(loss.timer_updates, 0);
}

#[test]
fn coalesces_initial_and_handshake() {
    let mut connection = connection(
        Role::Client,
        &[(KeyType::Initial, 1), (KeyType::Handshake, 2)],
    );
    let path = path();
    let mut datapath = TestDatapath::default();
    let mut loss = TestLossDetection::default();

    let mut builder =
        PacketBuilder::new(&mut connection, &path, &mut datapath, &mut loss, now()).unwrap();
    assert!(builder.prepare(KeyType::Initial, false, false, now()));
    assert!(builder.write_frame(&[0x06, 0x00, 0x01, 0xaa], SentFrame::Crypto { offset: 0, length: 1 }));
    // switching key types finalizes the Initial packet into the same datagram
    assert!(builder.prepare(KeyType::Handshake, false, false, now()));
    assert!(builder.write_frame(&[0x06, 0x01, 0x01, 0xbb], SentFrame::Crypto { offset: 1, length: 1 }));
    builder.finalize(true, now());
    builder.cleanup();

    assert_eq!(datapath.sent.len(), 1);
    assert_eq!(datapath.sent[0].datagrams.len(), 1, "packets are coalesced");

    assert_eq!(loss.packets.len(), 2);
    assert_eq!(loss.packets[0].key_type, KeyType::Initial);
    assert_eq!(loss.packets[1].key_type, KeyType::Handshake);
    // long header form bit on the datagram's first byte
    assert_eq!(datapath.sent[0].datagrams[0][0] & 0x80, 0x80);
}

#[test]
fn allowance_is_deducted_for_ack_eliciting_packets() {
    let mut connection = connection(Role::Client, &[(KeyType::OneRtt, 1)]);
    let path = path();
    let mut datapath = TestDatapath::default();
    let mut loss = TestLossDetection::default();

    let mut builder =
        PacketBuilder::new(&mut connection, &path, &mut datapath, &mut loss, now()).unwrap();
    let initial_allowance = builder.send_allowance();
    assert!(initial_allowance > 0);

    assert!(builder.prepare(KeyType::OneRtt, false, false, now()));
    assert!(builder.write_frame(&[0x01], SentFrame::Ping));
    builder.finalize(true, now());

    let send_allowance = builder.send_allowance();
    builder.cleanup();

    let packet_length = loss.packets[0].packet_length as u32;
    assert_eq!(send_allowance, initial_allowance - packet_length);
}

#[test]
fn pure_ack_packets_do_not_consume_allowance() {
    let mut connection = connection(Role::Client, &[(KeyType::OneRtt, 1)]);
    let path = path();
    let mut datapath = TestDatapath::default();
    let mut loss = TestLossDetection::default();

    let mut builder =
        PacketBuilder::new(&mut connection, &path, &mut datapath, &mut loss, now()).unwrap();
    let initial_allowance = builder.send_allowance();

    assert!(builder.prepare(KeyType::OneRtt, false, false, now()));
    assert!(builder.write_frame(
        &[0x02, 0x00, 0x00, 0x00, 0x00],
        SentFrame::Ack { largest_acknowledged: 0 },
    ));
    builder.finalize(true, now());

    let send_allowance = builder.send_allowance();
    builder.cleanup();

    assert_eq!(send_allowance, initial_allowance);
    assert!(!loss.packets[0].is_ack_eliciting);

    // a non-retransmittable batch does not rearm the loss timer
    assert_eq!(loss.timer_updates, 0);
}

#[test]
fn batch_allowance_never_exceeds_initial_allowance() {
    let mut connection = connection(Role::Client, &[(KeyType::OneRtt, 1)]);
    let path = path();
    let mut datapath = TestDatapath::default();
    let mut loss = TestLossDetection::default();

    let mut builder =
        PacketBuilder::new(&mut connection, &path, &mut datapath, &mut loss, now()).unwrap();
    let allowance_at_start = builder.send_allowance();

    for _ in 0..8 {
        assert!(builder.prepare(KeyType::OneRtt, false, false, now()));
        assert!(builder.write_frame(&[0x01], SentFrame::Ping));
        builder.finalize(false, now());
    }
    builder.finalize(true, now());
    builder.cleanup();

    let total: u32 = loss
        .packets
        .iter()
        .map(|packet| packet.packet_length as u32)
        .sum();
    assert!(total <= allowance_at_start);
}

#[test]
fn key_phase_update_triggers_on_byte_limit() {
    let mut connection = connection(Role::Client, &[(KeyType::OneRtt, 1)]);
    connection.settings.max_bytes_per_key = 1000;
    connection.handshake_confirmed = true;
    connection.stage_one_rtt_key(crypto::testing::key(2));
    let path = path();
    let mut datapath = TestDatapath::default();
    let mut loss = TestLossDetection::default();

    let mut builder =
        PacketBuilder::new(&mut connection, &path, &mut datapath, &mut loss, now()).unwrap();
    assert!(builder.prepare(KeyType::OneRtt, false, false, now()));
    assert!(builder.write_frame(&[0x01], SentFrame::Ping));
    builder.finalize(false, now());

    // a couple bytes plus the next full MTU cross the limit, so the first
    // finalize already swaps phase for the next packet
    assert!(builder.prepare(KeyType::OneRtt, false, false, now()));
    assert!(builder.write_frame(&[0x01], SentFrame::Ping));
    builder.finalize(true, now());
    builder.cleanup();

    assert_eq!(loss.packets[0].key_phase, KeyPhase::Zero);
    assert_eq!(loss.packets[1].key_phase, KeyPhase::One);

    let space = connection.space(EncryptLevel::OneRtt);
    assert_eq!(space.current_key_phase, KeyPhase::One);
    assert!(space.awaiting_key_phase_confirmation);

    // the second datagram decodes under the new key
    let key = TestKey::new(2);
    let datagram = &datapath.sent[0].datagrams[1];
    let (packet_number, _) = decode_short_packet(datagram, &key);
    assert_eq!(packet_number, 1);
}

#[test]
fn key_phase_update_waits_for_handshake_confirmation() {
    let mut connection = connection(Role::Client, &[(KeyType::OneRtt, 1)]);
    connection.settings.max_bytes_per_key = 100;
    connection.handshake_confirmed = false;
    connection.stage_one_rtt_key(crypto::testing::key(2));
    let path = path();
    let mut datapath = TestDatapath::default();
    let mut loss = TestLossDetection::default();

    let mut builder =
        PacketBuilder::new(&mut connection, &path, &mut datapath, &mut loss, now()).unwrap();
    assert!(builder.prepare(KeyType::OneRtt, false, false, now()));
    assert!(builder.write_frame(&[0x01], SentFrame::Ping));
    builder.finalize(true, now());
    builder.cleanup();

    // no update happened; the deferral is not an error
    assert_eq!(
        connection.space(EncryptLevel::OneRtt).current_key_phase,
        KeyPhase::Zero
    );
    assert!(connection.is_open());
}

#[test]
fn header_protection_batches_across_datagrams() {
    let key_byte = 0x21;
    let mut connection = connection(Role::Client, &[(KeyType::OneRtt, key_byte)]);
    let path = path();
    let mut datapath = TestDatapath::default();
    let mut loss = TestLossDetection::default();

    let count = MAX_HP_BATCH + 3;
    let mut builder =
        PacketBuilder::new(&mut connection, &path, &mut datapath, &mut loss, now()).unwrap();
    for _ in 0..count {
        assert!(builder.prepare(KeyType::OneRtt, false, false, now()));
        assert!(builder.write_frame(&[0x01], SentFrame::Ping));
        builder.finalize(false, now());
    }
    builder.finalize(true, now());
    builder.cleanup();

    assert_eq!(datapath.sent.len(), 1);
    assert_eq!(datapath.sent[0].datagrams.len(), count);

    // every datagram, including those protected by the mid-flush batch
    // flush, decodes to its packet number
    let key = TestKey::new(key_byte);
    for (index, datagram) in datapath.sent[0].datagrams.iter().enumerate() {
        let (packet_number, _) = decode_short_packet(datagram, &key);
        assert_eq!(packet_number as usize, index);
    }
}

#[test]
fn pmtud_datagram_is_full_size() {
    let mut connection = connection(Role::Client, &[(KeyType::OneRtt, 1)]);
    let mut path = path();
    path.max_udp_payload_size = MAX_MTU;
    let mut datapath = TestDatapath::default();
    let mut loss = TestLossDetection::default();

    let mut builder =
        PacketBuilder::new(&mut connection, &path, &mut datapath, &mut loss, now()).unwrap();
    assert!(builder.prepare_for_path_mtu_discovery(now()));
    assert!(builder.write_frame(&[0x01], SentFrame::Ping));
    builder.finalize(true, now());
    builder.cleanup();

    let datagram = &datapath.sent[0].datagrams[0];
    assert_eq!(datagram.len(), MAX_MTU as usize);
    assert!(loss.packets[0].is_pmtud);
}

#[test]
fn peer_udp_payload_limit_caps_datagrams() {
    let mut connection = connection(Role::Client, &[(KeyType::OneRtt, 1)]);
    connection.peer_max_udp_payload_size = Some(1200);
    let path = path();
    let mut datapath = TestDatapath::default();
    let mut loss = TestLossDetection::default();

    let mut builder =
        PacketBuilder::new(&mut connection, &path, &mut datapath, &mut loss, now()).unwrap();
    assert!(builder.prepare(KeyType::OneRtt, false, false, now()));
    assert!(builder.write_frame(&[0x01], SentFrame::Ping));
    builder.finalize(true, now());
    builder.cleanup();

    assert!(datapath.sent[0].datagrams[0].len() <= 1200);
}

#[test]
fn control_frame_key_selection() {
    // ACKs prefer the lowest level with ack-eliciting packets pending
    let mut connection = connection(
        Role::Client,
        &[(KeyType::Initial, 1), (KeyType::Handshake, 2)],
    );
    connection
        .space_mut(EncryptLevel::Initial)
        .ack_tracker
        .on_packet_received(0, true)
        .unwrap();
    let path = path();
    let mut datapath = TestDatapath::default();
    let mut loss = TestLossDetection::default();
    let builder =
        PacketBuilder::new(&mut connection, &path, &mut datapath, &mut loss, now()).unwrap();
    assert_eq!(
        builder.key_type_for_control_frames(SendFlags::ACK),
        Some(KeyType::Initial)
    );

    // crypto data goes out at its pending level
    drop(builder);
    connection.crypto_pending_level = Some(EncryptLevel::Handshake);
    connection.space_mut(EncryptLevel::Initial).ack_tracker.on_ack_frame_sent();
    let builder =
        PacketBuilder::new(&mut connection, &path, &mut datapath, &mut loss, now()).unwrap();
    assert_eq!(
        builder.key_type_for_control_frames(SendFlags::CRYPTO),
        Some(KeyType::Handshake)
    );

    // close and ping use the current write key
    assert_eq!(
        builder.key_type_for_control_frames(SendFlags::CONNECTION_CLOSE),
        Some(KeyType::Handshake)
    );

    // 1-RTT wins once available
    drop(builder);
    connection.keys.set_key(KeyType::OneRtt, crypto::testing::key(3));
    let builder =
        PacketBuilder::new(&mut connection, &path, &mut datapath, &mut loss, now()).unwrap();
    assert_eq!(
        builder.key_type_for_control_frames(SendFlags::ACK),
        Some(KeyType::OneRtt)
    );
}

#[test]
fn stream_frame_key_selection() {
    let mut connection = connection(Role::Client, &[(KeyType::Initial, 1)]);
    let path = path();
    let mut datapath = TestDatapath::default();
    let mut loss = TestLossDetection::default();

    let builder =
        PacketBuilder::new(&mut connection, &path, &mut datapath, &mut loss, now()).unwrap();
    assert_eq!(builder.key_type_for_stream_frames(), None);
    drop(builder);

    connection.keys.set_key(KeyType::ZeroRtt, crypto::testing::key(2));
    let builder =
        PacketBuilder::new(&mut connection, &path, &mut datapath, &mut loss, now()).unwrap();
    assert_eq!(builder.key_type_for_stream_frames(), Some(KeyType::ZeroRtt));
    drop(builder);

    connection.keys.set_key(KeyType::OneRtt, crypto::testing::key(3));
    let builder =
        PacketBuilder::new(&mut connection, &path, &mut datapath, &mut loss, now()).unwrap();
    assert_eq!(builder.key_type_for_stream_frames(), Some(KeyType::OneRtt));
}

#[test]
fn loss_detection_error_keeps_connection_alive() {
    let mut connection = connection(Role::Client, &[(KeyType::OneRtt, 1)]);
    let path = path();
    let mut datapath = TestDatapath::default();
    let mut loss = TestLossDetection {
        fail_next: true,
        ..Default::default()
    };

    let mut builder =
        PacketBuilder::new(&mut connection, &path, &mut datapath, &mut loss, now()).unwrap();
    assert!(builder.prepare(KeyType::OneRtt, false, false, now()));
    assert!(builder.write_frame(&[0x01], SentFrame::Ping));
    builder.finalize(true, now());
    builder.cleanup();

    // the datagram was already scheduled and still goes out
    assert_eq!(datapath.sent.len(), 1);
    assert_eq!(datapath.sent[0].datagrams.len(), 1);
    assert!(connection.is_open());
}

#[test]
fn amplification_allowance_caps_send_allowance() {
    let mut connection = connection(Role::Server, &[(KeyType::Initial, 1)]);
    let mut path = path();
    path.allowance = 500;
    let mut datapath = TestDatapath::default();
    let mut loss = TestLossDetection::default();

    let builder =
        PacketBuilder::new(&mut connection, &path, &mut datapath, &mut loss, now()).unwrap();
    assert!(builder.send_allowance() <= 500);
}
