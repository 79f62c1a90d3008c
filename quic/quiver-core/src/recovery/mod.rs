// Copyright the quiver authors. All Rights Reserved.
// SPDX-License-Identifier: Apache-2.0

//! Congestion control and the events that drive it
//!
//! Loss detection owns the timers and feeds the controller ack, loss, and
//! ECN events; the controller answers one question for the packet builder:
//! how many bytes may go on the wire right now.

pub mod bbr;
pub mod cubic;

use crate::{
    connection::settings::{CongestionControlAlgorithm, Settings},
    time::Timestamp,
};
use core::time::Duration;

/// Below this smoothed RTT, pacing gains nothing over just sending
pub const MIN_PACING_RTT: Duration = Duration::from_millis(1);

/// Notification that previously in-flight bytes were acknowledged
#[derive(Clone, Copy, Debug)]
pub struct AckEvent {
    pub time_now: Timestamp,
    pub largest_packet_number_acked: u64,
    pub largest_sent_packet_number: u64,
    /// Bytes newly acknowledged that counted toward bytes in flight
    pub num_retransmittable_bytes: u32,
    pub smoothed_rtt: Duration,
    pub min_rtt: Duration,
    pub min_rtt_valid: bool,
    /// An implicit ACK (key discard) rather than a real one
    pub is_implicit: bool,
    pub has_loss: bool,
    pub is_largest_acked_packet_app_limited: bool,
}

/// Notification that in-flight bytes were declared lost
#[derive(Clone, Copy, Debug)]
pub struct LossEvent {
    pub largest_packet_number_lost: u64,
    pub largest_sent_packet_number: u64,
    pub num_retransmittable_bytes: u32,
    pub persistent_congestion: bool,
}

/// Notification that the peer reported new ECN-CE marks
#[derive(Clone, Copy, Debug)]
pub struct EcnEvent {
    pub largest_packet_number_acked: u64,
    pub largest_sent_packet_number: u64,
}

/// Snapshot of the controller's view of the network
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct NetworkStatistics {
    pub bytes_in_flight: u32,
    pub congestion_window: u32,
    pub smoothed_rtt: Duration,
    /// Estimated bottleneck bandwidth in bytes per second, zero when the
    /// controller does not model bandwidth
    pub bandwidth: u64,
}

/// The pluggable congestion controllers
///
/// A sum type rather than trait objects: the set of algorithms is closed
/// and the dispatch cost shows up on the send path.
#[derive(Clone, Debug)]
pub enum CongestionController {
    Cubic(cubic::Cubic),
    Bbr(bbr::Bbr),
}

macro_rules! dispatch {
    ($self:ident, $controller:ident => $expr:expr) => {
        match $self {
            CongestionController::Cubic($controller) => $expr,
            CongestionController::Bbr($controller) => $expr,
        }
    };
}

impl CongestionController {
    /// Creates the controller selected by the connection settings
    pub fn new(settings: &Settings, datagram_payload_size: u16) -> Self {
        match settings.congestion_control_algorithm {
            CongestionControlAlgorithm::Cubic => {
                Self::Cubic(cubic::Cubic::new(settings, datagram_payload_size))
            }
            CongestionControlAlgorithm::Bbr => {
                Self::Bbr(bbr::Bbr::new(settings, datagram_payload_size))
            }
        }
    }

    /// `true` when the window has room or an exemption is outstanding
    #[inline]
    pub fn can_send(&self) -> bool {
        dispatch!(self, controller => controller.can_send())
    }

    /// Allows `count` packets to bypass congestion control, used for probes
    #[inline]
    pub fn set_exemption(&mut self, count: u8) {
        dispatch!(self, controller => controller.set_exemption(count))
    }

    #[inline]
    pub fn exemptions(&self) -> u8 {
        dispatch!(self, controller => controller.exemptions())
    }

    /// Bytes that may be sent this flush, after pacing
    #[inline]
    pub fn send_allowance(&mut self, time_since_last_send: Duration, time_valid: bool) -> u32 {
        dispatch!(self, controller => controller.send_allowance(time_since_last_send, time_valid))
    }

    #[inline]
    pub fn on_data_sent(&mut self, bytes: u32) {
        dispatch!(self, controller => controller.on_data_sent(bytes))
    }

    /// Removes bytes that will never be acknowledged (e.g. discarded keys);
    /// returns `true` if sending became unblocked
    #[inline]
    pub fn on_data_invalidated(&mut self, bytes: u32) -> bool {
        dispatch!(self, controller => controller.on_data_invalidated(bytes))
    }

    /// Returns `true` if the send-blocked state changed
    #[inline]
    pub fn on_data_acknowledged(&mut self, event: &AckEvent) -> bool {
        dispatch!(self, controller => controller.on_data_acknowledged(event))
    }

    #[inline]
    pub fn on_data_lost(&mut self, event: &LossEvent) -> bool {
        dispatch!(self, controller => controller.on_data_lost(event))
    }

    #[inline]
    pub fn on_ecn(&mut self, event: &EcnEvent) {
        dispatch!(self, controller => controller.on_ecn(event))
    }

    /// Undoes the last congestion response if loss detection retracts it
    #[inline]
    pub fn on_spurious_congestion_event(&mut self) -> bool {
        dispatch!(self, controller => controller.on_spurious_congestion_event())
    }

    #[inline]
    pub fn congestion_window(&self) -> u32 {
        dispatch!(self, controller => controller.congestion_window())
    }

    #[inline]
    pub fn bytes_in_flight(&self) -> u32 {
        dispatch!(self, controller => controller.bytes_in_flight())
    }

    #[inline]
    pub fn bytes_in_flight_max(&self) -> u32 {
        dispatch!(self, controller => controller.bytes_in_flight_max())
    }

    #[inline]
    pub fn is_app_limited(&self) -> bool {
        dispatch!(self, controller => controller.is_app_limited())
    }

    #[inline]
    pub fn set_app_limited(&mut self) {
        dispatch!(self, controller => controller.set_app_limited())
    }

    /// Partial reset preserves bytes in flight; a full reset zeroes it
    #[inline]
    pub fn reset(&mut self, full_reset: bool) {
        dispatch!(self, controller => controller.reset(full_reset))
    }

    #[inline]
    pub fn network_statistics(&self) -> NetworkStatistics {
        dispatch!(self, controller => controller.network_statistics())
    }

    /// Emits the current flow state to the tracing layer
    pub fn log_out_flow_status(&self) {
        let stats = self.network_statistics();
        probe!(
            bytes_in_flight = stats.bytes_in_flight,
            congestion_window = stats.congestion_window,
            smoothed_rtt_us = stats.smoothed_rtt.as_micros() as u64,
            bandwidth = stats.bandwidth,
            "out flow status"
        );
        let _ = stats;
    }
}

/// The shared pacing arithmetic for [`send_allowance`]
///
/// Returns the new allowance and updates `last_send_allowance`. Pacing
/// spreads a congestion window over a smoothed RTT; when it is off (or the
/// timing inputs are unusable) the full open window is returned.
#[inline]
pub(crate) fn paced_send_allowance(
    congestion_window: u32,
    bytes_in_flight: u32,
    last_send_allowance: &mut u32,
    pacing: Option<Duration>,
    time_since_last_send: Duration,
) -> u32 {
    if bytes_in_flight >= congestion_window {
        *last_send_allowance = 0;
        return 0;
    }

    let room = congestion_window - bytes_in_flight;

    let smoothed_rtt = match pacing {
        Some(rtt) if rtt >= MIN_PACING_RTT => rtt,
        _ => {
            *last_send_allowance = 0;
            return room;
        }
    };

    let elapsed = time_since_last_send.as_micros() as u64;
    let grant = (congestion_window as u64 * elapsed) / smoothed_rtt.as_micros() as u64;
    let allowance = (*last_send_allowance as u64)
        .saturating_add(grant)
        .min(room as u64) as u32;

    *last_send_allowance = allowance;
    allowance
}
