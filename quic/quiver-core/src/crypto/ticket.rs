// Copyright the quiver authors. All Rights Reserved.
// SPDX-License-Identifier: Apache-2.0

//! Resumption-ticket serialization
//!
//! The TLS collaborator opaquely stores these blobs: the client keeps the
//! server's NewSessionTicket plus the transport state needed to attempt
//! 0-RTT; the server keeps the state needed to validate a resumed client.
//! Both start with a version byte so the format can evolve; unknown
//! versions are refused.

use crate::{transport::parameters::ZeroRttParameters, varint::VarInt};
use alloc::vec::Vec;
use quiver_codec::{
    malformed, CodecError, DecoderBuffer, Encode, Encoder, EncoderBuffer,
};

/// Current ticket serialization version
pub const TICKET_VERSION: u8 = 0;

/// State a client stores alongside a received session ticket
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ClientTicket {
    pub quic_version: u32,
    pub parameters: ZeroRttParameters,
    pub server_ticket: Vec<u8>,
}

/// State a server encrypts into the tickets it issues
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ServerTicket {
    pub quic_version: u32,
    pub parameters: ZeroRttParameters,
    pub app_data: Vec<u8>,
}

/// Encodes the client's resumption state
pub fn encode_client_ticket(
    quic_version: u32,
    parameters: &ZeroRttParameters,
    server_ticket: &[u8],
) -> Vec<u8> {
    let parameters_len = parameters.encoding_size();
    let ticket_len_prefix = VarInt::try_from(server_ticket.len()).expect("ticket fits a varint");
    let parameters_len_prefix = VarInt::try_from(parameters_len).expect("parameters fit a varint");

    let total = 1
        + ticket_len_prefix.encoding_size()
        + server_ticket.len()
        + parameters_len_prefix.encoding_size()
        + parameters_len
        + 4;

    let mut bytes = alloc::vec![0u8; total];
    let mut encoder = EncoderBuffer::new(&mut bytes);
    encoder.encode(&TICKET_VERSION);
    encoder.encode(&ticket_len_prefix);
    encoder.write_slice(server_ticket);
    encoder.encode(&parameters_len_prefix);
    encoder.encode(parameters);
    encoder.encode(&quic_version);
    debug_assert_eq!(encoder.remaining_capacity(), 0);

    bytes
}

/// Decodes a blob previously produced by [`encode_client_ticket`]
pub fn decode_client_ticket(bytes: &[u8]) -> Result<ClientTicket, CodecError> {
    let buffer = DecoderBuffer::new(bytes);

    let (version, buffer) = buffer.decode::<u8>()?;
    malformed!(version == TICKET_VERSION, "unsupported ticket version");

    let (server_ticket, buffer) = buffer.decode_slice_with_len_prefix::<VarInt>()?;
    let server_ticket = server_ticket.into_inner().to_vec();

    let (parameters, buffer) = buffer.decode_with_len_prefix::<VarInt, ZeroRttParameters>()?;

    let (quic_version, buffer) = buffer.decode::<u32>()?;
    buffer.ensure_empty()?;

    Ok(ClientTicket {
        quic_version,
        parameters,
        server_ticket,
    })
}

/// Encodes the server's resumption state
pub fn encode_server_ticket(
    quic_version: u32,
    alpn: &[u8],
    parameters: &ZeroRttParameters,
    app_data: &[u8],
) -> Vec<u8> {
    let parameters_len = parameters.encoding_size();
    let alpn_len_prefix = VarInt::try_from(alpn.len()).expect("alpn fits a varint");
    let parameters_len_prefix = VarInt::try_from(parameters_len).expect("parameters fit a varint");
    let app_data_len_prefix = VarInt::try_from(app_data.len()).expect("app data fits a varint");

    let total = 1
        + 4
        + alpn_len_prefix.encoding_size()
        + alpn.len()
        + parameters_len_prefix.encoding_size()
        + parameters_len
        + app_data_len_prefix.encoding_size()
        + app_data.len();

    let mut bytes = alloc::vec![0u8; total];
    let mut encoder = EncoderBuffer::new(&mut bytes);
    encoder.encode(&TICKET_VERSION);
    encoder.encode(&quic_version);
    encoder.encode(&alpn_len_prefix);
    encoder.write_slice(alpn);
    encoder.encode(&parameters_len_prefix);
    encoder.encode(parameters);
    encoder.encode(&app_data_len_prefix);
    encoder.write_slice(app_data);
    debug_assert_eq!(encoder.remaining_capacity(), 0);

    bytes
}

/// Decodes a blob previously produced by [`encode_server_ticket`]
///
/// `negotiated_alpn` is the connection's negotiated ALPN; a ticket issued
/// under a different protocol is refused.
pub fn decode_server_ticket(
    bytes: &[u8],
    negotiated_alpn: &[u8],
) -> Result<ServerTicket, CodecError> {
    let buffer = DecoderBuffer::new(bytes);

    let (version, buffer) = buffer.decode::<u8>()?;
    malformed!(version == TICKET_VERSION, "unsupported ticket version");

    let (quic_version, buffer) = buffer.decode::<u32>()?;

    let (alpn, buffer) = buffer.decode_slice_with_len_prefix::<VarInt>()?;
    malformed!(
        alpn.as_slice() == negotiated_alpn,
        "ticket alpn does not match the negotiated alpn"
    );

    let (parameters, buffer) = buffer.decode_with_len_prefix::<VarInt, ZeroRttParameters>()?;

    let (app_data, buffer) = buffer.decode_slice_with_len_prefix::<VarInt>()?;
    let app_data = app_data.into_inner().to_vec();
    buffer.ensure_empty()?;

    Ok(ServerTicket {
        quic_version,
        parameters,
        app_data,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::parameters::{
        ActiveConnectionIdLimit, InitialMaxData, InitialMaxStreamsBidi,
    };

    const QUIC_VERSION: u32 = 1;
    const ALPN: &[u8] = b"test";

    fn parameters() -> ZeroRttParameters {
        ZeroRttParameters {
            active_connection_id_limit: ActiveConnectionIdLimit::new(VarInt::from_u8(4)).unwrap(),
            initial_max_data: InitialMaxData::new(VarInt::from_u32(100_000)).unwrap(),
            initial_max_streams_bidi: InitialMaxStreamsBidi::new(VarInt::from_u8(100)).unwrap(),
            ..Default::default()
        }
    }

    #[test]
    fn client_round_trip() {
        let server_ticket = [0u8, 1, 2, 3, 4, 5];
        let encoded = encode_client_ticket(QUIC_VERSION, &parameters(), &server_ticket);
        assert!(!encoded.is_empty());

        let decoded = decode_client_ticket(&encoded).unwrap();
        assert_eq!(decoded.quic_version, QUIC_VERSION);
        assert_eq!(decoded.server_ticket, server_ticket);
        assert_eq!(decoded.parameters, parameters());
    }

    #[test]
    fn server_round_trip() {
        let app_data = [10u8, 9, 8, 7, 6];
        let encoded = encode_server_ticket(QUIC_VERSION, ALPN, &parameters(), &app_data);
        assert!(!encoded.is_empty());

        let decoded = decode_server_ticket(&encoded, ALPN).unwrap();
        assert_eq!(decoded.quic_version, QUIC_VERSION);
        assert_eq!(decoded.app_data, app_data);
        assert_eq!(decoded.parameters, parameters());
    }

    #[test]
    fn server_round_trip_without_app_data() {
        let encoded = encode_server_ticket(QUIC_VERSION, ALPN, &parameters(), &[]);
        let decoded = decode_server_ticket(&encoded, ALPN).unwrap();
        assert!(decoded.app_data.is_empty());
        assert_eq!(decoded.parameters, parameters());
    }

    #[test]
    fn end_to_end() {
        let app_data = [10u8, 9, 8, 7, 6, 5, 4, 3, 2, 1];
        let server_ticket = encode_server_ticket(QUIC_VERSION, ALPN, &parameters(), &app_data);

        let client_ticket = encode_client_ticket(QUIC_VERSION, &parameters(), &server_ticket);
        let decoded_client = decode_client_ticket(&client_ticket).unwrap();
        assert_eq!(decoded_client.quic_version, QUIC_VERSION);
        assert_eq!(decoded_client.server_ticket, server_ticket);
        assert_eq!(decoded_client.parameters, parameters());

        let decoded_server = decode_server_ticket(&decoded_client.server_ticket, ALPN).unwrap();
        assert_eq!(decoded_server.app_data, app_data);
        assert_eq!(decoded_server.parameters, parameters());
    }

    #[test]
    fn unknown_version_is_refused() {
        let mut encoded = encode_client_ticket(QUIC_VERSION, &parameters(), &[1, 2, 3]);
        encoded[0] = 1;
        assert!(decode_client_ticket(&encoded).is_err());

        let mut encoded = encode_server_ticket(QUIC_VERSION, ALPN, &parameters(), &[]);
        encoded[0] = 0xff;
        assert!(decode_server_ticket(&encoded, ALPN).is_err());
    }

    #[test]
    fn alpn_mismatch_is_refused() {
        let encoded = encode_server_ticket(QUIC_VERSION, ALPN, &parameters(), &[]);
        assert!(decode_server_ticket(&encoded, b"other").is_err());
    }

    #[test]
    fn truncated_tickets_are_refused() {
        let encoded = encode_client_ticket(QUIC_VERSION, &parameters(), &[1, 2, 3]);
        for len in 0..encoded.len() {
            assert!(
                decode_client_ticket(&encoded[..len]).is_err(),
                "len {len} should fail"
            );
        }

        let encoded = encode_server_ticket(QUIC_VERSION, ALPN, &parameters(), &[9; 4]);
        for len in 0..encoded.len() {
            assert!(
                decode_server_ticket(&encoded[..len], ALPN).is_err(),
                "len {len} should fail"
            );
        }
    }

    #[test]
    fn trailing_bytes_are_refused() {
        let mut encoded = encode_client_ticket(QUIC_VERSION, &parameters(), &[1, 2, 3]);
        encoded.push(0);
        assert!(decode_client_ticket(&encoded).is_err());
    }
}
