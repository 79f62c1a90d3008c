// Copyright the quiver authors. All Rights Reserved.
// SPDX-License-Identifier: Apache-2.0

//! CUBIC congestion control with HyStart++ slow-start exit
//!
//! Window growth follows RFC 8312: after a congestion event the window
//! tracks `W(t) = C*(t-K)^3 + W_max`, raced against a Reno-style AIMD
//! window so CUBIC never grows slower than classic TCP. HyStart++
//! (RFC 9406) watches for RTT inflation during slow start and moves to a
//! conservative growth divisor before loss forces an exit.

use crate::{
    connection::settings::Settings,
    counter::Counter,
    recovery::{paced_send_allowance, AckEvent, EcnEvent, LossEvent, NetworkStatistics},
    time::Timestamp,
};
use core::time::Duration;
#[cfg(not(feature = "std"))]
use num_traits::Float as _;

/// Aggressiveness of the cubic polynomial (RFC 8312 section 5.1)
const C: f32 = 0.4;

/// Multiplicative decrease factor (RFC 8312 section 4.5)
const BETA_CUBIC: f32 = 0.7;

/// Window floor after any congestion response, in packets
const MINIMUM_WINDOW_PACKETS: u32 = 2;

/// Window used while persistent congestion is declared, in packets
const PERSISTENT_CONGESTION_WINDOW_PACKETS: u32 = 2;

/// Samples per HyStart++ round before the delay comparison runs
const HYSTART_MIN_SAMPLES: u32 = 8;
const HYSTART_MIN_RTT_THRESHOLD: Duration = Duration::from_millis(4);
const HYSTART_MAX_RTT_THRESHOLD: Duration = Duration::from_millis(16);
/// Rounds spent in conservative slow start before declaring the exit real
const HYSTART_CONSERVATIVE_ROUNDS: u32 = 5;
/// Growth divisor while in conservative slow start
const HYSTART_GROWTH_DIVISOR: u32 = 4;

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum HyStartState {
    #[default]
    NotStarted,
    /// RTT inflation seen; growing conservatively while confirming
    Active,
    Done,
}

/// State saved at a congestion event so a spurious loss can be unwound
#[derive(Clone, Copy, Debug)]
struct Snapshot {
    congestion_window: u32,
    slow_start_threshold: u32,
    window_max: u32,
    window_last_max: u32,
    k_cubic: Duration,
    aimd_window: u32,
    aimd_accumulator: u32,
}

#[derive(Clone, Debug)]
pub struct Cubic {
    datagram_payload_size: u16,
    initial_window_packets: u32,
    send_idle_timeout: Duration,
    hystart_enabled: bool,
    pacing_enabled: bool,

    congestion_window: u32,
    bytes_in_flight: Counter,
    bytes_in_flight_max: u32,
    slow_start_threshold: u32,
    /// Window size just before the last reduction, in bytes
    window_max: u32,
    window_last_max: u32,
    window_prior: u32,
    k_cubic: Duration,
    aimd_window: u32,
    aimd_accumulator: u32,
    exemptions: u8,
    last_send_allowance: u32,

    smoothed_rtt: Duration,
    has_rtt_sample: bool,
    time_of_last_ack: Option<Timestamp>,
    time_of_cong_avoid_start: Option<Timestamp>,

    recovery_sent_packet_number: u64,
    is_in_recovery: bool,
    is_in_persistent_congestion: bool,
    has_had_congestion_event: bool,

    hystart_state: HyStartState,
    hystart_round_end: u64,
    hystart_ack_count: u32,
    /// Microseconds; `u64::MAX` when no sample exists for the round
    min_rtt_in_last_round: u64,
    min_rtt_in_current_round: u64,
    hystart_css_baseline: u64,
    hystart_rounds_left: u32,
    cwnd_slow_start_growth_divisor: u32,

    prev: Option<Snapshot>,
}

impl Cubic {
    pub fn new(settings: &Settings, datagram_payload_size: u16) -> Self {
        let congestion_window = initial_window(settings.initial_window_packets, datagram_payload_size);
        Self {
            datagram_payload_size,
            initial_window_packets: settings.initial_window_packets,
            send_idle_timeout: Duration::from_millis(settings.send_idle_timeout_ms as u64),
            hystart_enabled: settings.hystart_enabled,
            pacing_enabled: settings.pacing_enabled,

            congestion_window,
            bytes_in_flight: Counter::new(0),
            bytes_in_flight_max: congestion_window / 2,
            slow_start_threshold: u32::MAX,
            window_max: 0,
            window_last_max: 0,
            window_prior: 0,
            k_cubic: Duration::ZERO,
            aimd_window: 0,
            aimd_accumulator: 0,
            exemptions: 0,
            last_send_allowance: 0,

            smoothed_rtt: Duration::ZERO,
            has_rtt_sample: false,
            time_of_last_ack: None,
            time_of_cong_avoid_start: None,

            recovery_sent_packet_number: 0,
            is_in_recovery: false,
            is_in_persistent_congestion: false,
            has_had_congestion_event: false,

            hystart_state: HyStartState::NotStarted,
            hystart_round_end: 0,
            hystart_ack_count: 0,
            min_rtt_in_last_round: u64::MAX,
            min_rtt_in_current_round: u64::MAX,
            hystart_css_baseline: u64::MAX,
            hystart_rounds_left: 0,
            cwnd_slow_start_growth_divisor: 1,

            prev: None,
        }
    }

    #[inline]
    pub fn can_send(&self) -> bool {
        *self.bytes_in_flight < self.congestion_window || self.exemptions > 0
    }

    #[inline]
    pub fn set_exemption(&mut self, count: u8) {
        self.exemptions = count;
    }

    #[inline]
    pub fn exemptions(&self) -> u8 {
        self.exemptions
    }

    #[inline]
    pub fn congestion_window(&self) -> u32 {
        self.congestion_window
    }

    #[inline]
    pub fn bytes_in_flight(&self) -> u32 {
        *self.bytes_in_flight
    }

    #[inline]
    pub fn bytes_in_flight_max(&self) -> u32 {
        self.bytes_in_flight_max
    }

    /// CUBIC does not track application-limited state
    #[inline]
    pub fn is_app_limited(&self) -> bool {
        false
    }

    #[inline]
    pub fn set_app_limited(&mut self) {}

    pub fn send_allowance(&mut self, time_since_last_send: Duration, time_valid: bool) -> u32 {
        let pacing = (self.pacing_enabled && time_valid && self.has_rtt_sample)
            .then_some(self.smoothed_rtt);
        paced_send_allowance(
            self.congestion_window,
            *self.bytes_in_flight,
            &mut self.last_send_allowance,
            pacing,
            time_since_last_send,
        )
    }

    pub fn on_data_sent(&mut self, bytes: u32) {
        if self.bytes_in_flight.try_add(bytes as usize).is_ok() && *self.bytes_in_flight > self.bytes_in_flight_max {
            self.bytes_in_flight_max = *self.bytes_in_flight;
        }

        if self.exemptions > 0 {
            self.exemptions -= 1;
        }

        if self.last_send_allowance > bytes {
            self.last_send_allowance -= bytes;
        } else {
            self.last_send_allowance = 0;
        }
    }

    pub fn on_data_invalidated(&mut self, bytes: u32) -> bool {
        let was_blocked = !self.can_send();
        self.bytes_in_flight.saturating_sub(bytes);
        was_blocked && self.can_send()
    }

    pub fn on_data_acknowledged(&mut self, event: &AckEvent) -> bool {
        let was_blocked = !self.can_send();
        let now = event.time_now;
        let bytes = event.num_retransmittable_bytes;

        self.bytes_in_flight.saturating_sub(bytes);

        if event.is_implicit {
            self.time_of_last_ack = Some(now);
            return was_blocked != !self.can_send();
        }

        if event.min_rtt_valid || !event.smoothed_rtt.is_zero() {
            self.smoothed_rtt = event.smoothed_rtt;
            self.has_rtt_sample = true;
        }

        // A long idle gap must not count toward the cubic curve, otherwise
        // W(t) jumps when sending resumes (RFC 8312 section 5.8).
        if let (Some(last_ack), Some(start)) = (self.time_of_last_ack, self.time_of_cong_avoid_start)
        {
            let idle = now.saturating_duration_since(last_ack);
            if idle > self.send_idle_timeout {
                self.time_of_cong_avoid_start = Some(start + idle);
            }
        }
        self.time_of_last_ack = Some(now);

        if self.is_in_recovery {
            if event.largest_packet_number_acked > self.recovery_sent_packet_number {
                // a packet sent after the congestion event was acknowledged
                self.is_in_recovery = false;
                self.is_in_persistent_congestion = false;
                self.time_of_cong_avoid_start = Some(now);
                self.aimd_accumulator = 0;
            }
            return was_blocked != !self.can_send();
        }

        if bytes == 0 {
            return was_blocked != !self.can_send();
        }

        if self.congestion_window < self.slow_start_threshold {
            self.congestion_window = self
                .congestion_window
                .saturating_add(bytes / self.cwnd_slow_start_growth_divisor.max(1));

            if self.hystart_enabled && event.min_rtt_valid {
                self.hystart_on_ack(event);
            }

            if self.congestion_window >= self.slow_start_threshold {
                self.on_slow_start_exit(now);
            }
        } else {
            self.congestion_avoidance(now, bytes);
        }

        was_blocked != !self.can_send()
    }

    pub fn on_data_lost(&mut self, event: &LossEvent) -> bool {
        let was_blocked = !self.can_send();

        // only one window reduction per round trip
        if !self.has_had_congestion_event
            || event.largest_packet_number_lost > self.recovery_sent_packet_number
        {
            self.on_congestion_event(event.largest_sent_packet_number);
        }

        if event.persistent_congestion && !self.is_in_persistent_congestion {
            self.is_in_persistent_congestion = true;
            self.congestion_window =
                PERSISTENT_CONGESTION_WINDOW_PACKETS * self.datagram_payload_size as u32;
        }

        self.bytes_in_flight.saturating_sub(event.num_retransmittable_bytes);

        was_blocked != !self.can_send()
    }

    pub fn on_ecn(&mut self, event: &EcnEvent) {
        if !self.has_had_congestion_event
            || event.largest_packet_number_acked > self.recovery_sent_packet_number
        {
            self.on_congestion_event(event.largest_sent_packet_number);
        }
    }

    /// Restores the pre-loss state after loss detection retracts the event
    pub fn on_spurious_congestion_event(&mut self) -> bool {
        ensure!(self.is_in_recovery, false);
        let Some(prev) = self.prev.take() else {
            return false;
        };

        self.congestion_window = prev.congestion_window;
        self.slow_start_threshold = prev.slow_start_threshold;
        self.window_max = prev.window_max;
        self.window_last_max = prev.window_last_max;
        self.k_cubic = prev.k_cubic;
        self.aimd_window = prev.aimd_window;
        self.aimd_accumulator = prev.aimd_accumulator;
        self.is_in_recovery = false;
        self.is_in_persistent_congestion = false;

        true
    }

    pub fn reset(&mut self, full_reset: bool) {
        self.congestion_window =
            initial_window(self.initial_window_packets, self.datagram_payload_size);
        self.bytes_in_flight_max = self.congestion_window / 2;
        self.slow_start_threshold = u32::MAX;
        self.window_max = 0;
        self.window_last_max = 0;
        self.window_prior = 0;
        self.k_cubic = Duration::ZERO;
        self.aimd_window = 0;
        self.aimd_accumulator = 0;
        self.last_send_allowance = 0;
        self.is_in_recovery = false;
        self.is_in_persistent_congestion = false;
        self.has_had_congestion_event = false;
        self.time_of_cong_avoid_start = None;
        self.hystart_state = HyStartState::NotStarted;
        self.hystart_round_end = 0;
        self.hystart_ack_count = 0;
        self.min_rtt_in_last_round = u64::MAX;
        self.min_rtt_in_current_round = u64::MAX;
        self.hystart_css_baseline = u64::MAX;
        self.hystart_rounds_left = 0;
        self.cwnd_slow_start_growth_divisor = 1;
        self.prev = None;

        if full_reset {
            self.bytes_in_flight = Counter::new(0);
        }
    }

    pub fn network_statistics(&self) -> NetworkStatistics {
        let bandwidth = if self.has_rtt_sample && !self.smoothed_rtt.is_zero() {
            (self.congestion_window as u64).saturating_mul(1_000_000)
                / self.smoothed_rtt.as_micros().max(1) as u64
        } else {
            0
        };

        NetworkStatistics {
            bytes_in_flight: *self.bytes_in_flight,
            congestion_window: self.congestion_window,
            smoothed_rtt: self.smoothed_rtt,
            bandwidth,
        }
    }

    #[inline]
    fn minimum_window(&self) -> u32 {
        MINIMUM_WINDOW_PACKETS * self.datagram_payload_size as u32
    }

    #[inline]
    fn packets(&self, bytes: u32) -> f32 {
        bytes as f32 / self.datagram_payload_size as f32
    }

    /// RFC 8312 Eq. 1, in packets
    #[inline]
    fn w_cubic(&self, t: Duration) -> f32 {
        C * (t.as_secs_f32() - self.k_cubic.as_secs_f32()).powi(3) + self.packets(self.window_max)
    }

    fn on_congestion_event(&mut self, largest_sent_packet_number: u64) {
        self.prev = Some(Snapshot {
            congestion_window: self.congestion_window,
            slow_start_threshold: self.slow_start_threshold,
            window_max: self.window_max,
            window_last_max: self.window_last_max,
            k_cubic: self.k_cubic,
            aimd_window: self.aimd_window,
            aimd_accumulator: self.aimd_accumulator,
        });

        self.has_had_congestion_event = true;
        self.is_in_recovery = true;
        self.recovery_sent_packet_number = largest_sent_packet_number;

        // HyStart's sampling is meaningless once real loss shows up
        self.hystart_state = HyStartState::Done;
        self.cwnd_slow_start_growth_divisor = 1;

        self.window_prior = self.congestion_window;

        // fast convergence (RFC 8312 section 4.6): when the saturation
        // point is dropping, release the bandwidth earlier
        let mut w_max = self.packets(self.congestion_window);
        if self.congestion_window < self.window_last_max {
            w_max = (w_max * (1.0 + BETA_CUBIC) / 2.0).max(self.packets(self.minimum_window()));
        }
        self.window_last_max = self.congestion_window;
        self.window_max = (w_max * self.datagram_payload_size as f32) as u32;

        let cwnd_start = ((self.congestion_window as f32 * BETA_CUBIC) as u32)
            .max(self.minimum_window());

        self.k_cubic = Duration::from_secs_f32(
            ((w_max - self.packets(cwnd_start)) / C).max(0.0).cbrt(),
        );

        self.congestion_window = cwnd_start;
        self.slow_start_threshold = cwnd_start;
        self.aimd_window = cwnd_start;
        self.aimd_accumulator = 0;
        // the cubic epoch starts when recovery ends; cleared here so a
        // stale epoch is never used
        self.time_of_cong_avoid_start = None;
    }

    fn on_slow_start_exit(&mut self, now: Timestamp) {
        // exiting without loss: treat the current window as the plateau
        self.window_max = self.congestion_window;
        self.window_last_max = self.congestion_window;
        self.k_cubic = Duration::ZERO;
        self.aimd_window = self.congestion_window;
        self.aimd_accumulator = 0;
        self.time_of_cong_avoid_start = Some(now);
    }

    fn congestion_avoidance(&mut self, now: Timestamp, bytes: u32) {
        let start = *self.time_of_cong_avoid_start.get_or_insert(now);
        let t = now.saturating_duration_since(start);
        let rtt = self.smoothed_rtt.max(Duration::from_micros(1));

        // limit the increase to half the acked bytes, as the Linux
        // implementation does
        let max_cwnd = self.congestion_window as f32 + bytes as f32 / 2.0;

        let target = self.w_cubic(t + rtt) * self.datagram_payload_size as f32;
        let cwnd = self.congestion_window as f32;
        if cwnd < target {
            let increment = (target - cwnd) / cwnd * self.datagram_payload_size as f32;
            self.congestion_window = (cwnd + increment).min(max_cwnd) as u32;
        }

        // Reno-friendly region: one datagram per window of acked bytes
        self.aimd_accumulator = self.aimd_accumulator.saturating_add(bytes);
        if self.aimd_window > 0 && self.aimd_accumulator >= self.aimd_window {
            self.aimd_accumulator -= self.aimd_window;
            self.aimd_window = self
                .aimd_window
                .saturating_add(self.datagram_payload_size as u32);
        }
        if self.aimd_window > self.congestion_window {
            self.congestion_window = self.aimd_window.min(max_cwnd as u32);
        }
    }

    fn hystart_on_ack(&mut self, event: &AckEvent) {
        if event.largest_packet_number_acked >= self.hystart_round_end {
            // a full round has been acknowledged
            self.hystart_round_end = event.largest_sent_packet_number;
            self.min_rtt_in_last_round = self.min_rtt_in_current_round;
            self.min_rtt_in_current_round = u64::MAX;
            self.hystart_ack_count = 0;

            if self.hystart_state == HyStartState::Active {
                self.hystart_rounds_left = self.hystart_rounds_left.saturating_sub(1);
                if self.hystart_rounds_left == 0 {
                    // the inflation held: leave slow start for good
                    self.hystart_state = HyStartState::Done;
                    self.cwnd_slow_start_growth_divisor = 1;
                    self.slow_start_threshold = self.congestion_window;
                }
            }
        }

        let rtt = event.min_rtt.as_micros() as u64;
        if self.hystart_ack_count < HYSTART_MIN_SAMPLES {
            self.min_rtt_in_current_round = self.min_rtt_in_current_round.min(rtt);
            self.hystart_ack_count += 1;
            ensure!(self.hystart_ack_count == HYSTART_MIN_SAMPLES);
        } else {
            return;
        }

        ensure!(
            self.min_rtt_in_last_round != u64::MAX && self.min_rtt_in_current_round != u64::MAX
        );

        match self.hystart_state {
            HyStartState::NotStarted => {
                let eta = (self.min_rtt_in_last_round / 8)
                    .clamp(
                        HYSTART_MIN_RTT_THRESHOLD.as_micros() as u64,
                        HYSTART_MAX_RTT_THRESHOLD.as_micros() as u64,
                    );
                if self.min_rtt_in_current_round >= self.min_rtt_in_last_round + eta {
                    self.hystart_state = HyStartState::Active;
                    self.hystart_css_baseline = self.min_rtt_in_last_round;
                    self.hystart_rounds_left = HYSTART_CONSERVATIVE_ROUNDS;
                    self.cwnd_slow_start_growth_divisor = HYSTART_GROWTH_DIVISOR;
                }
            }
            HyStartState::Active => {
                if self.min_rtt_in_current_round < self.hystart_css_baseline {
                    // false alarm, the delay went back down
                    self.hystart_state = HyStartState::NotStarted;
                    self.hystart_css_baseline = u64::MAX;
                    self.cwnd_slow_start_growth_divisor = 1;
                }
            }
            HyStartState::Done => {}
        }
    }

    #[cfg(test)]
    pub(crate) fn hystart_state(&self) -> HyStartState {
        self.hystart_state
    }

    #[cfg(test)]
    pub(crate) fn slow_start_threshold(&self) -> u32 {
        self.slow_start_threshold
    }

    #[cfg(test)]
    pub(crate) fn set_bytes_in_flight(&mut self, bytes: u32) {
        self.bytes_in_flight = Counter::new(bytes);
    }
}

#[inline]
fn initial_window(initial_window_packets: u32, datagram_payload_size: u16) -> u32 {
    initial_window_packets.saturating_mul(datagram_payload_size as u32)
}
