// Copyright the quiver authors. All Rights Reserved.
// SPDX-License-Identifier: Apache-2.0

//! Version-information blob used for compatible version negotiation
//!
//! The blob is a chosen version followed by the list of other supported
//! versions, all 32-bit network-order values.

use alloc::vec::Vec;
use quiver_codec::{malformed, CodecError, DecoderBuffer, Encode, Encoder};

/// The role of the endpoint parsing a blob
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Role {
    Client,
    Server,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct VersionInformation {
    pub chosen_version: u32,
    pub other_versions: Vec<u32>,
}

impl VersionInformation {
    pub fn new(chosen_version: u32, other_versions: Vec<u32>) -> Self {
        Self {
            chosen_version,
            other_versions,
        }
    }

    /// Parses a version-information blob received from the peer
    ///
    /// A server parses the client's blob, which must carry at least one
    /// entry in the other-versions list; a client accepts an empty list.
    pub fn parse(role: Role, bytes: &[u8]) -> Result<Self, CodecError> {
        let buffer = DecoderBuffer::new(bytes);
        let (chosen_version, buffer) = buffer.decode::<u32>()?;

        let remaining = buffer.len();
        malformed!(
            remaining % 4 == 0,
            "other versions list must be a multiple of four bytes"
        );
        if role == Role::Server {
            malformed!(
                remaining >= 4,
                "client version information must list at least one version"
            );
        }

        let mut other_versions = Vec::with_capacity(remaining / 4);
        let mut buffer = buffer;
        while !buffer.is_empty() {
            let (version, remaining) = buffer.decode::<u32>()?;
            other_versions.push(version);
            buffer = remaining;
        }

        Ok(Self {
            chosen_version,
            other_versions,
        })
    }
}

impl Encode for VersionInformation {
    fn encode<E: Encoder>(&self, encoder: &mut E) {
        encoder.encode(&self.chosen_version);
        for version in &self.other_versions {
            encoder.encode(version);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const VALID_BLOB: &[u8] = &[
        0, 0, 0, 1, // chosen version
        0, 0, 0, 1, // other versions[0]
        0xab, 0xcd, 0, 0, // other versions[1]
        0xff, 0, 0, 0x1d, // other versions[2]
    ];

    #[test]
    fn parse_truncated_blobs() {
        for role in [Role::Client, Role::Server] {
            // not enough room for the chosen version
            assert!(VersionInformation::parse(role, &VALID_BLOB[..3]).is_err());
            // partial other-versions entries
            assert!(VersionInformation::parse(role, &VALID_BLOB[..5]).is_err());
            assert!(VersionInformation::parse(role, &VALID_BLOB[..6]).is_err());
            assert!(VersionInformation::parse(role, &VALID_BLOB[..11]).is_err());
            assert!(VersionInformation::parse(role, &VALID_BLOB[..15]).is_err());
        }

        // a bare chosen version is only valid when a client parses it
        assert!(VersionInformation::parse(Role::Server, &VALID_BLOB[..4]).is_err());
        assert!(VersionInformation::parse(Role::Client, &VALID_BLOB[..4]).is_ok());
    }

    #[test]
    fn parse_valid_blob() {
        let info = VersionInformation::parse(Role::Server, VALID_BLOB).unwrap();
        assert_eq!(info.chosen_version, 1);
        assert_eq!(info.other_versions, vec![1, 0xabcd_0000, 0xff00_001d]);
    }

    #[test]
    fn encode_round_trip() {
        for role in [Role::Client, Role::Server] {
            let info = VersionInformation::new(1, vec![1, 2]);
            let encoded = info.encode_to_vec();
            assert_eq!(encoded.len(), 12);
            let parsed = VersionInformation::parse(role, &encoded).unwrap();
            assert_eq!(parsed, info);
        }
    }
}
