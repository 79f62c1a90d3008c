// Copyright the quiver authors. All Rights Reserved.
// SPDX-License-Identifier: Apache-2.0

//! Transport-parameter serialization
//!
//! Parameters are a sequence of `(varint id, varint length, value)` triples.
//! Each recognized parameter is its own type carrying its id, codec value,
//! default and validation; the role-specific containers are assembled from
//! them so server-only parameters cannot be encoded by a client at all.

use crate::{connection::ConnectionId, varint::VarInt};
use core::{
    convert::{TryFrom, TryInto},
    net::{Ipv4Addr, Ipv6Addr},
    time::Duration,
};
use quiver_codec::{
    impl_decode, malformed, CodecError, Decode, DecoderBuffer, DecoderResult, Encode, Encoder,
};

type TransportParameterId = VarInt;
type TransportParameterLength = VarInt;

/// The greased "disable 1-RTT encryption" parameter used by test tooling.
/// Compliant peers refuse it rather than negotiate away packet protection.
const DISABLE_1RTT_ENCRYPTION_ID: TransportParameterId = VarInt::from_u16(0xbaad);

/// One transport parameter
pub trait TransportParameter: Sized {
    /// The wire ID for the parameter
    const ID: TransportParameterId;

    /// Whether the parameter may appear in this container's context
    const ENABLED: bool = true;

    /// The wire representation of the value
    type CodecValue;

    fn from_codec_value(value: Self::CodecValue) -> Self;

    /// Returns the codec value, or `None` when the parameter should be
    /// omitted from the encoding
    fn try_into_codec_value(&self) -> Option<&Self::CodecValue>;

    fn default_value() -> Self;
}

/// Validates decoded parameter values
pub trait TransportParameterValidator: Sized {
    fn validate(self) -> Result<Self, CodecError> {
        Ok(self)
    }
}

/// Codec shim pairing a parameter with its length prefix
struct TransportParameterCodec<T>(T);

impl<'a, T: TransportParameter> Decode<'a> for TransportParameterCodec<T>
where
    T::CodecValue: Decode<'a>,
{
    fn decode(buffer: DecoderBuffer<'a>) -> DecoderResult<'a, Self> {
        let (value, buffer) = buffer.decode_with_len_prefix::<TransportParameterLength, _>()?;
        Ok((Self(T::from_codec_value(value)), buffer))
    }
}

impl<T: TransportParameter> Encode for TransportParameterCodec<&T>
where
    T::CodecValue: Encode,
{
    fn encode<E: Encoder>(&self, buffer: &mut E) {
        if let Some(value) = self.0.try_into_codec_value() {
            buffer.encode(&T::ID);
            buffer.encode_with_len_prefix::<TransportParameterLength, _>(value);
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ValidationError(&'static str);

impl core::fmt::Display for ValidationError {
    fn fmt(&self, f: &mut core::fmt::Formatter) -> core::fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[cfg(feature = "std")]
impl std::error::Error for ValidationError {}

impl From<CodecError> for ValidationError {
    fn from(error: CodecError) -> Self {
        ValidationError(error.into())
    }
}

impl From<crate::varint::VarIntError> for ValidationError {
    fn from(_: crate::varint::VarIntError) -> Self {
        ValidationError("provided value exceeds maximum encodable value")
    }
}

/// Declares a transport parameter type wrapping a codec value
macro_rules! transport_parameter {
    ($name:ident($codec_ty:ty), $tag:expr) => {
        transport_parameter!($name($codec_ty), $tag, <$codec_ty as Default>::default());
    };
    ($name:ident($codec_ty:ty), $tag:expr, $default:expr) => {
        #[derive(Clone, Copy, Debug, PartialEq, Eq)]
        pub struct $name($codec_ty);

        impl Default for $name {
            fn default() -> Self {
                Self($default)
            }
        }

        impl $name {
            pub fn new<T: TryInto<$codec_ty>>(value: T) -> Option<Self> {
                value
                    .try_into()
                    .ok()
                    .map(Self)
                    .and_then(|value| value.validate().ok())
            }
        }

        impl TryFrom<$codec_ty> for $name {
            type Error = ValidationError;

            fn try_from(value: $codec_ty) -> Result<Self, Self::Error> {
                Self(value).validate().map_err(ValidationError::from)
            }
        }

        impl TransportParameter for $name {
            type CodecValue = $codec_ty;

            const ID: TransportParameterId = TransportParameterId::from_u16($tag);

            fn from_codec_value(value: Self::CodecValue) -> Self {
                Self(value)
            }

            fn try_into_codec_value(&self) -> Option<&Self::CodecValue> {
                // skip encoding values that match the protocol default
                if self.0 == $default {
                    None
                } else {
                    Some(&self.0)
                }
            }

            fn default_value() -> Self {
                Self($default)
            }
        }

        impl core::ops::Deref for $name {
            type Target = $codec_ty;

            fn deref(&self) -> &Self::Target {
                &self.0
            }
        }
    };
}

macro_rules! varint_transport_parameter {
    ($name:ident, $tag:expr $(, $default:expr)?) => {
        transport_parameter!($name(VarInt), $tag $(, $default)?);

        impl TryFrom<u64> for $name {
            type Error = ValidationError;

            fn try_from(value: u64) -> Result<Self, Self::Error> {
                let value = VarInt::new(value)?;
                Self::try_from(value)
            }
        }

        impl $name {
            pub const fn as_varint(self) -> VarInt {
                self.0
            }
        }
    };
}

/// Implements `TransportParameter` for `Option<T>`, used for parameters
/// with no meaningful default
macro_rules! optional_transport_parameter {
    ($ty:ty) => {
        impl TransportParameter for Option<$ty> {
            type CodecValue = $ty;

            const ID: TransportParameterId = <$ty as TransportParameter>::ID;

            fn from_codec_value(value: Self::CodecValue) -> Self {
                Some(value)
            }

            fn try_into_codec_value(&self) -> Option<&Self::CodecValue> {
                self.as_ref()
            }

            fn default_value() -> Self {
                None
            }
        }

        impl TransportParameterValidator for Option<$ty> {
            fn validate(self) -> Result<Self, CodecError> {
                if let Some(value) = self {
                    Ok(Some(value.validate()?))
                } else {
                    Ok(None)
                }
            }
        }
    };
}

macro_rules! connection_id_parameter {
    ($name:ident, $tag:expr) => {
        transport_parameter!($name(ConnectionId), $tag, ConnectionId::EMPTY);

        // the inner connection id enforces its own length bounds
        impl TransportParameterValidator for $name {}

        impl TryFrom<&[u8]> for $name {
            type Error = crate::connection::id::InvalidLength;

            fn try_from(value: &[u8]) -> Result<Self, Self::Error> {
                Ok(Self(ConnectionId::try_from(value)?))
            }
        }

        impl $name {
            pub fn connection_id(&self) -> &ConnectionId {
                &self.0
            }
        }

        impl_decode!(
            impl<'a> $name {
                fn decode(buffer: DecoderBuffer) -> Result<Self> {
                    let (connection_id, buffer) = buffer.decode()?;
                    Ok((Self(connection_id), buffer))
                }
            }
        );

        impl Encode for $name {
            fn encode<E: Encoder>(&self, encoder: &mut E) {
                self.0.encode(encoder)
            }
        }
    };
}

//
// original_destination_connection_id (0x00), server-only
//

connection_id_parameter!(OriginalDestinationConnectionId, 0x00);
optional_transport_parameter!(OriginalDestinationConnectionId);

//
// max_idle_timeout (0x01), milliseconds; zero disables the timeout
//

transport_parameter!(MaxIdleTimeout(VarInt), 0x01, VarInt::from_u8(0));

impl MaxIdleTimeout {
    pub fn as_duration(&self) -> Option<Duration> {
        let duration = Duration::from_millis(self.0.as_u64());
        if duration.is_zero() {
            None
        } else {
            Some(duration)
        }
    }
}

impl TransportParameterValidator for MaxIdleTimeout {}

//
// stateless_reset_token (0x02), server-only
//

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct StatelessResetToken([u8; 16]);

impl StatelessResetToken {
    pub const ZEROED: Self = Self([0; 16]);

    pub fn as_bytes(&self) -> &[u8; 16] {
        &self.0
    }
}

impl From<[u8; 16]> for StatelessResetToken {
    fn from(bytes: [u8; 16]) -> Self {
        Self(bytes)
    }
}

impl_decode!(
    impl<'a> StatelessResetToken {
        fn decode(buffer: DecoderBuffer) -> Result<Self> {
            let (slice, buffer) = buffer.decode_slice(16)?;
            let mut token = [0u8; 16];
            token.copy_from_slice(slice.as_slice());
            Ok((Self(token), buffer))
        }
    }
);

impl Encode for StatelessResetToken {
    fn encode<E: Encoder>(&self, encoder: &mut E) {
        encoder.write_slice(&self.0);
    }
}

impl TransportParameter for StatelessResetToken {
    type CodecValue = Self;

    const ID: TransportParameterId = TransportParameterId::from_u16(0x02);

    fn from_codec_value(value: Self) -> Self {
        value
    }

    fn try_into_codec_value(&self) -> Option<&Self> {
        Some(self)
    }

    fn default_value() -> Self {
        Self::ZEROED
    }
}

impl TransportParameterValidator for StatelessResetToken {}

optional_transport_parameter!(StatelessResetToken);

//
// max_udp_payload_size (0x03), default 65527, valid range 1200..=65527
//

transport_parameter!(MaxUdpPayloadSize(VarInt), 0x03, VarInt::from_u16(65527));

impl TransportParameterValidator for MaxUdpPayloadSize {
    fn validate(self) -> Result<Self, CodecError> {
        malformed!(
            (1200..=65527).contains(&*self.0),
            "max_udp_payload_size should be within 1200 and 65527 bytes"
        );
        Ok(self)
    }
}

impl TryFrom<u16> for MaxUdpPayloadSize {
    type Error = ValidationError;

    fn try_from(value: u16) -> Result<Self, Self::Error> {
        let value: VarInt = value.into();
        Self(value).validate().map_err(ValidationError::from)
    }
}

//
// initial_max_data (0x04) and the per-stream flow control limits
//

varint_transport_parameter!(InitialMaxData, 0x04);
impl TransportParameterValidator for InitialMaxData {}

varint_transport_parameter!(InitialMaxStreamDataBidiLocal, 0x05);
impl TransportParameterValidator for InitialMaxStreamDataBidiLocal {}

varint_transport_parameter!(InitialMaxStreamDataBidiRemote, 0x06);
impl TransportParameterValidator for InitialMaxStreamDataBidiRemote {}

varint_transport_parameter!(InitialMaxStreamDataUni, 0x07);
impl TransportParameterValidator for InitialMaxStreamDataUni {}

//
// initial_max_streams_bidi (0x08) / initial_max_streams_uni (0x09)
//
// Values above 2^60 would allow stream IDs that cannot be encoded as a
// varint, so they are rejected.
//

varint_transport_parameter!(InitialMaxStreamsBidi, 0x08);

impl TransportParameterValidator for InitialMaxStreamsBidi {
    fn validate(self) -> Result<Self, CodecError> {
        malformed!(
            *self.0 <= 2u64.pow(60),
            "initial_max_streams_bidi cannot be greater than 2^60"
        );
        Ok(self)
    }
}

varint_transport_parameter!(InitialMaxStreamsUni, 0x09);

impl TransportParameterValidator for InitialMaxStreamsUni {
    fn validate(self) -> Result<Self, CodecError> {
        malformed!(
            *self.0 <= 2u64.pow(60),
            "initial_max_streams_uni cannot be greater than 2^60"
        );
        Ok(self)
    }
}

//
// ack_delay_exponent (0x0a), default 3, values above 20 invalid
//

transport_parameter!(AckDelayExponent(u8), 0x0a, 3);

impl AckDelayExponent {
    pub const fn as_u8(self) -> u8 {
        self.0
    }
}

impl TransportParameterValidator for AckDelayExponent {
    fn validate(self) -> Result<Self, CodecError> {
        malformed!(self.0 <= 20, "ack_delay_exponent cannot be greater than 20");
        Ok(self)
    }
}

//
// max_ack_delay (0x0b), milliseconds, default 25, values of 2^14 or more
// invalid
//

transport_parameter!(MaxAckDelay(VarInt), 0x0b, VarInt::from_u8(25));

impl MaxAckDelay {
    pub fn as_duration(&self) -> Duration {
        Duration::from_millis(self.0.as_u64())
    }
}

impl TransportParameterValidator for MaxAckDelay {
    fn validate(self) -> Result<Self, CodecError> {
        malformed!(
            *self.0 < 2u64.pow(14),
            "max_ack_delay must be less than 2^14"
        );
        Ok(self)
    }
}

//
// disable_active_migration (0x0c), zero-length presence flag
//

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum MigrationSupport {
    #[default]
    Enabled,
    Disabled,
}

impl TransportParameter for MigrationSupport {
    type CodecValue = ();

    const ID: TransportParameterId = TransportParameterId::from_u16(0x0c);

    fn from_codec_value(_value: ()) -> Self {
        MigrationSupport::Disabled
    }

    fn try_into_codec_value(&self) -> Option<&()> {
        if let MigrationSupport::Disabled = self {
            Some(&())
        } else {
            None
        }
    }

    fn default_value() -> Self {
        MigrationSupport::Enabled
    }
}

impl TransportParameterValidator for MigrationSupport {}

//
// preferred_address (0x0d), server-only
//

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct SocketAddressV4 {
    pub ip: Ipv4Addr,
    pub port: u16,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct SocketAddressV6 {
    pub ip: Ipv6Addr,
    pub port: u16,
}

impl SocketAddressV4 {
    pub fn new(ip: [u8; 4], port: u16) -> Self {
        Self {
            ip: Ipv4Addr::from(ip),
            port,
        }
    }

    fn is_unspecified(&self) -> bool {
        self.ip.is_unspecified() && self.port == 0
    }
}

impl SocketAddressV6 {
    pub fn new(ip: [u8; 16], port: u16) -> Self {
        Self {
            ip: Ipv6Addr::from(ip),
            port,
        }
    }

    fn is_unspecified(&self) -> bool {
        self.ip.is_unspecified() && self.port == 0
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct PreferredAddress {
    pub ipv4_address: Option<SocketAddressV4>,
    pub ipv6_address: Option<SocketAddressV6>,
    pub connection_id: ConnectionId,
    pub stateless_reset_token: StatelessResetToken,
}

impl TransportParameter for PreferredAddress {
    type CodecValue = Self;

    const ID: TransportParameterId = TransportParameterId::from_u16(0x0d);

    fn from_codec_value(value: Self) -> Self {
        value
    }

    fn try_into_codec_value(&self) -> Option<&Self> {
        Some(self)
    }

    fn default_value() -> Self {
        unimplemented!("preferred_address is always wrapped in Option")
    }
}

impl TransportParameterValidator for PreferredAddress {
    fn validate(self) -> Result<Self, CodecError> {
        malformed!(
            self.ipv4_address.is_some() || self.ipv6_address.is_some(),
            "at least one address needs to be specified"
        );
        Ok(self)
    }
}

optional_transport_parameter!(PreferredAddress);

impl_decode!(
    impl<'a> PreferredAddress {
        fn decode(buffer: DecoderBuffer) -> Result<Self> {
            let (ip, buffer) = buffer.decode_slice(4)?;
            let mut v4 = [0u8; 4];
            v4.copy_from_slice(ip.as_slice());
            let (v4_port, buffer) = buffer.decode::<u16>()?;
            let ipv4_address = Some(SocketAddressV4::new(v4, v4_port))
                .filter(|addr| !addr.is_unspecified());

            let (ip, buffer) = buffer.decode_slice(16)?;
            let mut v6 = [0u8; 16];
            v6.copy_from_slice(ip.as_slice());
            let (v6_port, buffer) = buffer.decode::<u16>()?;
            let ipv6_address = Some(SocketAddressV6::new(v6, v6_port))
                .filter(|addr| !addr.is_unspecified());

            let (connection_id, buffer) = buffer.decode_with_len_prefix::<u8, ConnectionId>()?;
            let (stateless_reset_token, buffer) = buffer.decode()?;

            let preferred_address = Self {
                ipv4_address,
                ipv6_address,
                connection_id,
                stateless_reset_token,
            };
            Ok((preferred_address, buffer))
        }
    }
);

impl Encode for PreferredAddress {
    fn encode<E: Encoder>(&self, buffer: &mut E) {
        if let Some(addr) = self.ipv4_address.as_ref() {
            buffer.write_slice(&addr.ip.octets());
            buffer.encode(&addr.port);
        } else {
            buffer.write_repeated(6, 0);
        }

        if let Some(addr) = self.ipv6_address.as_ref() {
            buffer.write_slice(&addr.ip.octets());
            buffer.encode(&addr.port);
        } else {
            buffer.write_repeated(18, 0);
        }

        buffer.encode_with_len_prefix::<u8, _>(&self.connection_id);
        buffer.encode(&self.stateless_reset_token);
    }
}

//
// active_connection_id_limit (0x0e), default 2, minimum 2
//

varint_transport_parameter!(ActiveConnectionIdLimit, 0x0e, VarInt::from_u8(2));

impl TransportParameterValidator for ActiveConnectionIdLimit {
    fn validate(self) -> Result<Self, CodecError> {
        malformed!(
            *self.0 >= 2,
            "active_connection_id_limit must be at least 2"
        );
        Ok(self)
    }
}

//
// initial_source_connection_id (0x0f) / retry_source_connection_id (0x10)
//

connection_id_parameter!(InitialSourceConnectionId, 0x0f);
optional_transport_parameter!(InitialSourceConnectionId);

connection_id_parameter!(RetrySourceConnectionId, 0x10);
optional_transport_parameter!(RetrySourceConnectionId);

/// A parameter slot that is compile-time disabled in this context
///
/// Decoding a disabled parameter is a protocol violation; encoding emits
/// nothing.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct DisabledParameter<T>(core::marker::PhantomData<T>);

impl<T> Default for DisabledParameter<T> {
    fn default() -> Self {
        Self(core::marker::PhantomData)
    }
}

impl<T: TransportParameter> TransportParameter for DisabledParameter<T> {
    type CodecValue = T::CodecValue;

    const ID: TransportParameterId = T::ID;
    const ENABLED: bool = false;

    fn from_codec_value(_value: Self::CodecValue) -> Self {
        Self(core::marker::PhantomData)
    }

    fn try_into_codec_value(&self) -> Option<&Self::CodecValue> {
        None
    }

    fn default_value() -> Self {
        Self(core::marker::PhantomData)
    }
}

impl<T> TransportParameterValidator for DisabledParameter<T> {}

/// Transport parameters sent by the client
pub type ClientTransportParameters = TransportParameters<
    DisabledParameter<OriginalDestinationConnectionId>,
    DisabledParameter<StatelessResetToken>,
    DisabledParameter<PreferredAddress>,
    DisabledParameter<RetrySourceConnectionId>,
>;

/// Transport parameters sent by the server
pub type ServerTransportParameters = TransportParameters<
    Option<OriginalDestinationConnectionId>,
    Option<StatelessResetToken>,
    Option<PreferredAddress>,
    Option<RetrySourceConnectionId>,
>;

macro_rules! impl_transport_parameters {
    (
        pub struct TransportParameters <
        $($server_param:ident),* $(,)? >
        { $($field:ident : $field_ty:ty),* $(,)? }
    ) => {
        #[derive(Clone, Copy, Debug, PartialEq)]
        pub struct TransportParameters<$($server_param),*> {
            $(
                pub $field: $field_ty
            ),*
        }

        impl<$($server_param),*> Default for TransportParameters<$($server_param),*>
        where
            $(
                $server_param: TransportParameter,
            )*
        {
            fn default() -> Self {
                Self {
                    $(
                        $field: TransportParameter::default_value(),
                    )*
                }
            }
        }

        impl<$($server_param),*> Encode for TransportParameters<$($server_param),*>
        where
            $(
                $server_param: TransportParameter,
                $server_param::CodecValue: Encode,
            )*
        {
            fn encode<E: Encoder>(&self, buffer: &mut E) {
                $(
                    buffer.encode(&TransportParameterCodec(&self.$field));
                )*
            }
        }

        impl<'a, $($server_param),*> TransportParameters<$($server_param),*>
        where
            $(
                $server_param: TransportParameter + TransportParameterValidator,
                $server_param::CodecValue: Decode<'a>,
            )*
        {
            fn decode_parameters(
                mut buffer: DecoderBuffer<'a>
            ) -> Result<TransportParameters<$($server_param),*>, CodecError> {
                let mut parameters = Self::default();

                /// Tracks decoded fields for duplicate detection
                #[derive(Default)]
                struct UsedFields {
                    $(
                        $field: bool,
                    )*
                }

                let mut used_fields = UsedFields::default();

                while !buffer.is_empty() {
                    let (id, inner_buffer) = buffer.decode::<TransportParameterId>()?;

                    buffer = match id {
                        $(
                            id if id == <$field_ty>::ID => {
                                malformed!(
                                    <$field_ty>::ENABLED,
                                    concat!(stringify!($field), " is not allowed in this context")
                                );

                                malformed!(
                                    !core::mem::replace(&mut used_fields.$field, true),
                                    concat!("duplicate value for ", stringify!($field))
                                );

                                let (value, inner_buffer) =
                                    inner_buffer.decode::<TransportParameterCodec<$field_ty>>()?;

                                parameters.$field = value.0.validate()?;

                                inner_buffer
                            }
                        )*
                        id if id == DISABLE_1RTT_ENCRYPTION_ID => {
                            malformed!(
                                false,
                                "disabling 1-rtt encryption is not supported"
                            );
                            unreachable!()
                        }
                        _ => {
                            // unknown ids are skipped: a varint length plus payload
                            inner_buffer.skip_with_len_prefix::<TransportParameterLength>()?
                        }
                    }
                }

                Ok(parameters)
            }
        }
    };
}

impl_transport_parameters!(
    pub struct TransportParameters<
        OriginalDestinationConnectionId,
        StatelessResetToken,
        PreferredAddress,
        RetrySourceConnectionId,
    > {
        max_idle_timeout: MaxIdleTimeout,
        max_udp_payload_size: MaxUdpPayloadSize,
        initial_max_data: InitialMaxData,
        initial_max_stream_data_bidi_local: InitialMaxStreamDataBidiLocal,
        initial_max_stream_data_bidi_remote: InitialMaxStreamDataBidiRemote,
        initial_max_stream_data_uni: InitialMaxStreamDataUni,
        initial_max_streams_bidi: InitialMaxStreamsBidi,
        initial_max_streams_uni: InitialMaxStreamsUni,
        ack_delay_exponent: AckDelayExponent,
        max_ack_delay: MaxAckDelay,
        migration_support: MigrationSupport,
        active_connection_id_limit: ActiveConnectionIdLimit,
        original_destination_connection_id: OriginalDestinationConnectionId,
        stateless_reset_token: StatelessResetToken,
        preferred_address: PreferredAddress,
        initial_source_connection_id: Option<InitialSourceConnectionId>,
        retry_source_connection_id: RetrySourceConnectionId,
    }
);

/// The flow-control limits an endpoint stores with a resumption ticket
///
/// Only the parameters that remain meaningful across connections are kept;
/// everything else is renegotiated on resumption.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct ZeroRttParameters {
    pub active_connection_id_limit: ActiveConnectionIdLimit,
    pub initial_max_data: InitialMaxData,
    pub initial_max_stream_data_bidi_local: InitialMaxStreamDataBidiLocal,
    pub initial_max_stream_data_bidi_remote: InitialMaxStreamDataBidiRemote,
    pub initial_max_stream_data_uni: InitialMaxStreamDataUni,
    pub initial_max_streams_bidi: InitialMaxStreamsBidi,
    pub initial_max_streams_uni: InitialMaxStreamsUni,
}

impl<OriginalDestinationConnectionId, StatelessResetToken, PreferredAddress, RetrySourceConnectionId>
    TransportParameters<
        OriginalDestinationConnectionId,
        StatelessResetToken,
        PreferredAddress,
        RetrySourceConnectionId,
    >
{
    /// Extracts the parameters to be saved with a resumption ticket
    pub fn zero_rtt_parameters(&self) -> ZeroRttParameters {
        ZeroRttParameters {
            active_connection_id_limit: self.active_connection_id_limit,
            initial_max_data: self.initial_max_data,
            initial_max_stream_data_bidi_local: self.initial_max_stream_data_bidi_local,
            initial_max_stream_data_bidi_remote: self.initial_max_stream_data_bidi_remote,
            initial_max_stream_data_uni: self.initial_max_stream_data_uni,
            initial_max_streams_bidi: self.initial_max_streams_bidi,
            initial_max_streams_uni: self.initial_max_streams_uni,
        }
    }
}

macro_rules! zero_rtt_fields {
    ($macro:ident!($($args:tt)*)) => {
        $macro!(
            $($args)*
            active_connection_id_limit: ActiveConnectionIdLimit,
            initial_max_data: InitialMaxData,
            initial_max_stream_data_bidi_local: InitialMaxStreamDataBidiLocal,
            initial_max_stream_data_bidi_remote: InitialMaxStreamDataBidiRemote,
            initial_max_stream_data_uni: InitialMaxStreamDataUni,
            initial_max_streams_bidi: InitialMaxStreamsBidi,
            initial_max_streams_uni: InitialMaxStreamsUni,
        )
    };
}

impl Encode for ZeroRttParameters {
    fn encode<E: Encoder>(&self, buffer: &mut E) {
        buffer.encode(&TransportParameterCodec(&self.active_connection_id_limit));
        buffer.encode(&TransportParameterCodec(&self.initial_max_data));
        buffer.encode(&TransportParameterCodec(
            &self.initial_max_stream_data_bidi_local,
        ));
        buffer.encode(&TransportParameterCodec(
            &self.initial_max_stream_data_bidi_remote,
        ));
        buffer.encode(&TransportParameterCodec(&self.initial_max_stream_data_uni));
        buffer.encode(&TransportParameterCodec(&self.initial_max_streams_bidi));
        buffer.encode(&TransportParameterCodec(&self.initial_max_streams_uni));
    }
}

impl_decode!(
    impl<'a> ZeroRttParameters {
        fn decode(buffer: DecoderBuffer) -> Result<Self> {
            let mut parameters = Self::default();
            let mut buffer = buffer;

            macro_rules! decode_fields {
                ($parameters:ident, $id:ident, $inner:ident, $($field:ident: $ty:ident,)*) => {
                    match $id {
                        $(
                            id if id == $ty::ID => {
                                let (value, inner) =
                                    $inner.decode::<TransportParameterCodec<$ty>>()?;
                                $parameters.$field = value.0.validate()?;
                                inner
                            }
                        )*
                        _ => {
                            return Err(CodecError::Malformed(
                                "unexpected parameter in resumption state",
                            ));
                        }
                    }
                };
            }

            while !buffer.is_empty() {
                let (id, inner) = buffer.decode::<TransportParameterId>()?;
                buffer = zero_rtt_fields!(decode_fields!(parameters, id, inner,));
            }

            Ok((parameters, buffer))
        }
    }
);

impl_decode!(
    impl<'a> ClientTransportParameters {
        fn decode(buffer: DecoderBuffer) -> Result<Self> {
            let len = buffer.len();
            let (slice, buffer) = buffer.decode_slice(len)?;
            let parameters = Self::decode_parameters(slice)?;
            Ok((parameters, buffer))
        }
    }
);

impl_decode!(
    impl<'a> ServerTransportParameters {
        fn decode(buffer: DecoderBuffer) -> Result<Self> {
            let len = buffer.len();
            let (slice, buffer) = buffer.decode_slice(len)?;
            let parameters = Self::decode_parameters(slice)?;
            Ok((parameters, buffer))
        }
    }
);
