// Copyright the quiver authors. All Rights Reserved.
// SPDX-License-Identifier: Apache-2.0

//! Packet-protection seams
//!
//! The TLS engine owns key derivation; the core only borrows opaque sealing
//! keys. A [`Key`] bundles the AEAD packet key and the header-protection key
//! for one key type, mirroring how the handshake installs them together.

pub mod ticket;

use alloc::sync::Arc;
use core::fmt;

/// AEAD tag length added to every protected payload
pub const ENCRYPTION_OVERHEAD: usize = 16;

/// AEAD nonce length
pub const IV_LENGTH: usize = 12;

/// Bytes of header-protection mask applied to a header
pub const HP_MASK_LENGTH: usize = 5;

/// The four key types, ordered from lowest to highest encryption level
///
/// The ordering is load-bearing: frame scheduling walks key types from
/// `Initial` upward when picking the level for control frames.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord)]
pub enum KeyType {
    Initial = 0,
    ZeroRtt = 1,
    Handshake = 2,
    OneRtt = 3,
}

impl KeyType {
    pub const COUNT: usize = 4;

    #[inline]
    pub fn all() -> [Self; Self::COUNT] {
        [Self::Initial, Self::ZeroRtt, Self::Handshake, Self::OneRtt]
    }

    /// The packet-number space the key type belongs to
    #[inline]
    pub fn encrypt_level(self) -> EncryptLevel {
        match self {
            Self::Initial => EncryptLevel::Initial,
            Self::Handshake => EncryptLevel::Handshake,
            // 0-RTT shares the application space with 1-RTT
            Self::ZeroRtt | Self::OneRtt => EncryptLevel::OneRtt,
        }
    }
}

/// Packet-number spaces, one per encryption level
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord)]
pub enum EncryptLevel {
    Initial = 0,
    Handshake = 1,
    OneRtt = 2,
}

impl EncryptLevel {
    pub const COUNT: usize = 3;

    #[inline]
    pub fn index(self) -> usize {
        self as usize
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CryptoError {
    EncryptionFailure,
}

impl fmt::Display for CryptoError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            Self::EncryptionFailure => write!(f, "packet protection failed"),
        }
    }
}

#[cfg(feature = "std")]
impl std::error::Error for CryptoError {}

/// A sealing key pair: AEAD packet key plus header-protection key
pub trait Key {
    /// Encrypts `payload` in place using nonce `iv XOR packet_number`
    ///
    /// The final [`ENCRYPTION_OVERHEAD`] bytes of `payload` are reserved for
    /// the authentication tag and must not contain frame data.
    fn seal(
        &self,
        packet_number: u64,
        header: &[u8],
        payload: &mut [u8],
    ) -> Result<(), CryptoError>;

    /// Computes the five-byte header-protection mask from a ciphertext
    /// sample
    fn header_protection_mask(&self, sample: &[u8]) -> [u8; HP_MASK_LENGTH];
}

/// Combines a static IV with a packet number to form a nonce
#[inline]
pub fn combine_iv_and_packet_number(iv: &[u8; IV_LENGTH], packet_number: u64) -> [u8; IV_LENGTH] {
    let mut nonce = *iv;
    for (nonce_byte, pn_byte) in nonce
        .iter_mut()
        .rev()
        .zip(packet_number.to_be_bytes().iter().rev())
    {
        *nonce_byte ^= pn_byte;
    }
    nonce
}

/// The write keys available to the packet builder
///
/// Keys are installed by the TLS collaborator as the handshake progresses
/// and discarded once their level is confirmed dead.
#[derive(Clone, Default)]
pub struct KeySet {
    keys: [Option<Arc<dyn Key>>; KeyType::COUNT],
    current_write_key: Option<KeyType>,
}

impl KeySet {
    #[inline]
    pub fn new() -> Self {
        Self::default()
    }

    /// Installs a write key, advancing the current write key if needed
    pub fn set_key(&mut self, key_type: KeyType, key: Arc<dyn Key>) {
        self.keys[key_type as usize] = Some(key);
        if self.current_write_key.map_or(true, |current| current < key_type) {
            self.current_write_key = Some(key_type);
        }
    }

    /// Replaces a key without touching the current write key, used for
    /// key-phase updates
    pub fn replace_key(&mut self, key_type: KeyType, key: Arc<dyn Key>) {
        self.keys[key_type as usize] = Some(key);
    }

    pub fn discard_key(&mut self, key_type: KeyType) {
        self.keys[key_type as usize] = None;
    }

    #[inline]
    pub fn key(&self, key_type: KeyType) -> Option<&Arc<dyn Key>> {
        self.keys[key_type as usize].as_ref()
    }

    #[inline]
    pub fn has_key(&self, key_type: KeyType) -> bool {
        self.keys[key_type as usize].is_some()
    }

    #[inline]
    pub fn current_write_key(&self) -> Option<KeyType> {
        self.current_write_key
    }
}

impl fmt::Debug for KeySet {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("KeySet")
            .field("current_write_key", &self.current_write_key)
            .field(
                "installed",
                &KeyType::all()
                    .iter()
                    .filter(|ty| self.has_key(**ty))
                    .collect::<alloc::vec::Vec<_>>(),
            )
            .finish()
    }
}

/// A no-op key used when packet protection is disabled
pub mod null {
    use super::*;

    #[derive(Debug, Default)]
    pub struct NullKey;

    impl Key for NullKey {
        fn seal(
            &self,
            _packet_number: u64,
            _header: &[u8],
            _payload: &mut [u8],
        ) -> Result<(), CryptoError> {
            Ok(())
        }

        fn header_protection_mask(&self, _sample: &[u8]) -> [u8; HP_MASK_LENGTH] {
            [0; HP_MASK_LENGTH]
        }
    }

    pub fn key() -> Arc<dyn Key> {
        Arc::new(NullKey)
    }
}

/// Deterministic keys for exercising the packet pipeline in tests
pub mod testing {
    use super::*;

    /// XOR-keystream "cipher" with a recognizable tag
    ///
    /// Not secret in any way; it exists so tests can verify that payload
    /// bytes were transformed with the expected key and nonce and can undo
    /// the transformation.
    #[derive(Clone, Debug)]
    pub struct TestKey {
        pub key_byte: u8,
        pub iv: [u8; IV_LENGTH],
    }

    impl TestKey {
        pub fn new(key_byte: u8) -> Self {
            Self {
                key_byte,
                iv: [key_byte; IV_LENGTH],
            }
        }

        /// Reverses `seal` over a protected payload
        pub fn unseal(&self, packet_number: u64, payload: &mut [u8]) {
            let nonce = combine_iv_and_packet_number(&self.iv, packet_number);
            let (data, _tag) = payload.split_at_mut(payload.len() - ENCRYPTION_OVERHEAD);
            for byte in data {
                *byte ^= self.key_byte ^ nonce[IV_LENGTH - 1];
            }
        }
    }

    impl Key for TestKey {
        fn seal(
            &self,
            packet_number: u64,
            _header: &[u8],
            payload: &mut [u8],
        ) -> Result<(), CryptoError> {
            ensure!(
                payload.len() >= ENCRYPTION_OVERHEAD,
                Err(CryptoError::EncryptionFailure)
            );
            let nonce = combine_iv_and_packet_number(&self.iv, packet_number);
            let tag_start = payload.len() - ENCRYPTION_OVERHEAD;
            let (data, tag) = payload.split_at_mut(tag_start);
            for byte in data {
                *byte ^= self.key_byte ^ nonce[IV_LENGTH - 1];
            }
            for (i, byte) in tag.iter_mut().enumerate() {
                *byte = self.key_byte.wrapping_add(i as u8);
            }
            Ok(())
        }

        fn header_protection_mask(&self, sample: &[u8]) -> [u8; HP_MASK_LENGTH] {
            let mut mask = [0u8; HP_MASK_LENGTH];
            for (i, byte) in mask.iter_mut().enumerate() {
                *byte = sample.get(i).copied().unwrap_or(0) ^ self.key_byte;
            }
            mask
        }
    }

    pub fn key(key_byte: u8) -> Arc<dyn Key> {
        Arc::new(TestKey::new(key_byte))
    }
}
