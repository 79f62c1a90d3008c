// Copyright the quiver authors. All Rights Reserved.
// SPDX-License-Identifier: Apache-2.0

//! Per-connection configuration

/// Congestion-control algorithm selection
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum CongestionControlAlgorithm {
    #[default]
    Cubic,
    Bbr,
}

/// Knobs consumed by the packet pipeline and congestion control
///
/// Everything here has a working default; endpoints override individual
/// fields before handing the settings to a connection.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Settings {
    /// Disabled only by test tooling; peers refuse to negotiate it off
    pub encryption_enabled: bool,
    pub header_protection_enabled: bool,
    /// Bytes sent under one 1-RTT key before a key-phase update is forced
    pub max_bytes_per_key: u64,
    pub pacing_enabled: bool,
    pub initial_window_packets: u32,
    pub send_idle_timeout_ms: u32,
    pub hystart_enabled: bool,
    pub ecn_enabled: bool,
    pub congestion_control_algorithm: CongestionControlAlgorithm,
    /// Whether the datapath prefers fully padded datagrams when batching
    pub datagram_padding_preferred: bool,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            encryption_enabled: true,
            header_protection_enabled: true,
            max_bytes_per_key: 1 << 62,
            pacing_enabled: true,
            initial_window_packets: 10,
            send_idle_timeout_ms: 1000,
            hystart_enabled: true,
            ecn_enabled: false,
            congestion_control_algorithm: CongestionControlAlgorithm::Cubic,
            datagram_padding_preferred: false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults() {
        let settings = Settings::default();
        assert!(settings.encryption_enabled);
        assert!(settings.header_protection_enabled);
        assert_eq!(settings.initial_window_packets, 10);
        assert_eq!(
            settings.congestion_control_algorithm,
            CongestionControlAlgorithm::Cubic
        );
    }
}
