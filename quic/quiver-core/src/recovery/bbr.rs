// Copyright the quiver authors. All Rights Reserved.
// SPDX-License-Identifier: Apache-2.0

//! BBR congestion control
//!
//! Models the path instead of reacting to loss: a windowed-max filter over
//! delivery-rate samples estimates the bottleneck bandwidth, a min filter
//! over RTT samples estimates the propagation delay, and the pair gives a
//! bandwidth-delay product that drives both pacing and the congestion
//! window. The state machine probes for more bandwidth (ProbeBw) and
//! periodically drains the pipe to refresh the RTT estimate (ProbeRtt).

use crate::{
    connection::settings::Settings,
    counter::Counter,
    recovery::{paced_send_allowance, AckEvent, EcnEvent, LossEvent, NetworkStatistics},
    time::Timestamp,
    window::SlidingWindowExtremum,
};
use core::time::Duration;

/// Gains are fixed-point with a unit of 256
pub const GAIN_UNIT: u32 = 256;

/// Startup gain: 2/ln(2), enough to double delivered bandwidth per round
pub const HIGH_GAIN: u32 = GAIN_UNIT * 2885 / 1000 + 1;

/// Drain gain: the inverse of the startup gain
pub const DRAIN_GAIN: u32 = GAIN_UNIT * 1000 / 2885;

/// Congestion window gain while cruising in ProbeBw
const PROBE_BW_CWND_GAIN: u32 = 2 * GAIN_UNIT;

/// The eight-phase pacing-gain cycle used in ProbeBw
const PACING_CYCLE: [u32; 8] = [
    GAIN_UNIT * 5 / 4,
    GAIN_UNIT * 3 / 4,
    GAIN_UNIT,
    GAIN_UNIT,
    GAIN_UNIT,
    GAIN_UNIT,
    GAIN_UNIT,
    GAIN_UNIT,
];

/// Floor for the congestion window, in packets
const MIN_CWND_PACKETS: u32 = 4;

/// How long ProbeRtt holds the window at the floor
const PROBE_RTT_DURATION: Duration = Duration::from_millis(200);

/// A min-RTT sample older than this forces a ProbeRtt visit
const MIN_RTT_EXPIRY: Duration = Duration::from_secs(10);

/// Bandwidth filter window, in round trips
const BANDWIDTH_WINDOW_ROUNDS: u64 = 10;
const BANDWIDTH_FILTER_CAPACITY: usize = 3;

/// Rounds without 25% bandwidth growth before startup declares the
/// bottleneck found
const STARTUP_SLOW_ROUND_LIMIT: u32 = 3;

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum State {
    #[default]
    Startup,
    Drain,
    ProbeBw,
    ProbeRtt,
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum RecoveryState {
    #[default]
    NotInRecovery,
    /// First round after loss: hold the recovery window steady
    Conservative,
    /// Later rounds: grow the recovery window by acknowledged bytes
    Growth,
}

/// Bottleneck-bandwidth estimator
///
/// Delivery-rate samples taken while the sender is application-limited
/// under-report the path and are ignored, unless they exceed the current
/// estimate anyway.
#[derive(Clone, Debug)]
struct BandwidthFilter {
    windowed_max: SlidingWindowExtremum,
    app_limited: bool,
    app_limited_exit_target: u64,
}

impl BandwidthFilter {
    fn new() -> Self {
        Self {
            windowed_max: SlidingWindowExtremum::new(
                BANDWIDTH_WINDOW_ROUNDS,
                BANDWIDTH_FILTER_CAPACITY,
            ),
            app_limited: false,
            app_limited_exit_target: 0,
        }
    }

    /// Bytes per second, zero before the first sample
    #[inline]
    fn bandwidth(&self) -> u64 {
        self.windowed_max.get().map_or(0, |entry| entry.value)
    }

    fn on_sample(&mut self, sample: u64, round: u64, largest_acked: u64) {
        if self.app_limited && largest_acked > self.app_limited_exit_target {
            self.app_limited = false;
        }

        if !self.app_limited || sample > self.bandwidth() {
            self.windowed_max.update_max(sample, round);
        }
    }
}

#[derive(Clone, Debug)]
pub struct Bbr {
    datagram_payload_size: u16,
    pacing_enabled: bool,

    state: State,
    recovery_state: RecoveryState,

    bytes_in_flight: Counter,
    bytes_in_flight_max: u32,
    congestion_window: u32,
    initial_congestion_window: u32,
    initial_congestion_window_packets: u32,
    recovery_window: u32,

    /// Fixed-point gains in units of [`GAIN_UNIT`]
    pacing_gain: u32,
    cwnd_gain: u32,

    /// Microseconds, `u64::MAX` before the first sample
    min_rtt: u64,
    min_rtt_timestamp: Option<Timestamp>,
    rtt_sample_expired: bool,

    round_trip_counter: u64,
    end_of_round_trip: Option<u64>,

    bandwidth_filter: BandwidthFilter,
    max_ack_height_filter: SlidingWindowExtremum,
    aggregated_ack_bytes: u64,
    ack_aggregation_start_time: Option<Timestamp>,

    send_quantum: u64,
    slow_startup_round_counter: u32,
    last_estimated_startup_bandwidth: u64,
    btlbw_found: bool,

    pacing_cycle_index: usize,
    cycle_start: Option<Timestamp>,
    exiting_quiescence: bool,

    exemptions: u8,
    last_send_allowance: u32,
    end_of_recovery: Option<u64>,
    probe_rtt_end_time: Option<Timestamp>,
    probe_rtt_round: Option<u64>,

    smoothed_rtt: Duration,
    has_rtt_sample: bool,
    last_ack_time: Option<Timestamp>,
    largest_sent_packet_number: u64,
}

impl Bbr {
    pub fn new(settings: &Settings, datagram_payload_size: u16) -> Self {
        let initial_congestion_window =
            settings.initial_window_packets * datagram_payload_size as u32;
        Self {
            datagram_payload_size,
            pacing_enabled: settings.pacing_enabled,

            state: State::Startup,
            recovery_state: RecoveryState::NotInRecovery,

            bytes_in_flight: Counter::new(0),
            bytes_in_flight_max: 0,
            congestion_window: initial_congestion_window,
            initial_congestion_window,
            initial_congestion_window_packets: settings.initial_window_packets,
            recovery_window: initial_congestion_window,

            pacing_gain: HIGH_GAIN,
            cwnd_gain: HIGH_GAIN,

            min_rtt: u64::MAX,
            min_rtt_timestamp: None,
            rtt_sample_expired: true,

            round_trip_counter: 0,
            end_of_round_trip: None,

            bandwidth_filter: BandwidthFilter::new(),
            max_ack_height_filter: SlidingWindowExtremum::new(
                BANDWIDTH_WINDOW_ROUNDS,
                BANDWIDTH_FILTER_CAPACITY,
            ),
            aggregated_ack_bytes: 0,
            ack_aggregation_start_time: None,

            send_quantum: 0,
            slow_startup_round_counter: 0,
            last_estimated_startup_bandwidth: 0,
            btlbw_found: false,

            pacing_cycle_index: 0,
            cycle_start: None,
            exiting_quiescence: false,

            exemptions: 0,
            last_send_allowance: 0,
            end_of_recovery: None,
            probe_rtt_end_time: None,
            probe_rtt_round: None,

            smoothed_rtt: Duration::ZERO,
            has_rtt_sample: false,
            last_ack_time: None,
            largest_sent_packet_number: 0,
        }
    }

    #[inline]
    pub fn can_send(&self) -> bool {
        *self.bytes_in_flight < self.congestion_window() || self.exemptions > 0
    }

    #[inline]
    pub fn set_exemption(&mut self, count: u8) {
        self.exemptions = count;
    }

    #[inline]
    pub fn exemptions(&self) -> u8 {
        self.exemptions
    }

    /// The effective congestion window for the current state
    pub fn congestion_window(&self) -> u32 {
        if self.state == State::ProbeRtt {
            return self.minimum_window();
        }

        if self.recovery_state != RecoveryState::NotInRecovery {
            return self.congestion_window.min(self.recovery_window);
        }

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

    #[inline]
    pub fn is_app_limited(&self) -> bool {
        self.bandwidth_filter.app_limited
    }

    /// Marks the bandwidth filter app-limited until the packets currently
    /// in flight are acknowledged
    pub fn set_app_limited(&mut self) {
        self.bandwidth_filter.app_limited = true;
        self.bandwidth_filter.app_limited_exit_target = self.largest_sent_packet_number;
    }

    pub fn send_allowance(&mut self, time_since_last_send: Duration, time_valid: bool) -> u32 {
        let pacing = (self.pacing_enabled && time_valid && self.has_rtt_sample)
            .then_some(self.smoothed_rtt);
        paced_send_allowance(
            self.congestion_window(),
            *self.bytes_in_flight,
            &mut self.last_send_allowance,
            pacing,
            time_since_last_send,
        )
    }

    pub fn on_data_sent(&mut self, bytes: u32) {
        if self.bytes_in_flight.try_add(bytes as usize).is_ok()
            && *self.bytes_in_flight > self.bytes_in_flight_max
        {
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
        self.largest_sent_packet_number = self
            .largest_sent_packet_number
            .max(event.largest_sent_packet_number);

        if event.is_implicit {
            return was_blocked != !self.can_send();
        }

        if !event.smoothed_rtt.is_zero() {
            self.smoothed_rtt = event.smoothed_rtt;
            self.has_rtt_sample = true;
        }
        if event.min_rtt_valid {
            self.update_min_rtt(event.min_rtt, now);
        }

        let round_start = self.update_round_trip_counter(event);

        if bytes > 0 {
            self.update_bandwidth(event, now);
            self.update_ack_aggregation(bytes, now);
        }
        self.last_ack_time = Some(now);

        self.update_recovery_state_on_ack(event, round_start, bytes);

        match self.state {
            State::Startup => {
                if round_start {
                    self.check_startup_full_pipe();
                }
                if self.btlbw_found {
                    self.enter_drain();
                }
            }
            State::Drain => {
                if *self.bytes_in_flight <= self.target_window(GAIN_UNIT) {
                    self.enter_probe_bw(now);
                }
            }
            State::ProbeBw => {
                self.advance_pacing_cycle(now);
            }
            State::ProbeRtt => {
                self.run_probe_rtt(now);
            }
        }

        // a stale RTT estimate forces a ProbeRtt visit once per expiry
        if self.state != State::ProbeRtt
            && self.rtt_sample_expired
            && !self.exiting_quiescence
        {
            self.enter_probe_rtt();
        }
        self.exiting_quiescence = false;

        if bytes > 0 {
            self.update_congestion_window(bytes);
            self.update_send_quantum();
        }

        was_blocked != !self.can_send()
    }

    pub fn on_data_lost(&mut self, event: &LossEvent) -> bool {
        let was_blocked = !self.can_send();
        let bytes = event.num_retransmittable_bytes;

        self.largest_sent_packet_number = self
            .largest_sent_packet_number
            .max(event.largest_sent_packet_number);

        if self.recovery_state == RecoveryState::NotInRecovery {
            self.recovery_state = RecoveryState::Conservative;
            self.end_of_recovery = Some(event.largest_sent_packet_number);
            self.recovery_window = (*self.bytes_in_flight)
                .saturating_sub(bytes)
                .max(self.minimum_window());
        } else {
            // losses shrink an established recovery window
            self.recovery_window = self
                .recovery_window
                .saturating_sub(bytes)
                .max(self.minimum_window());
        }

        self.bytes_in_flight.saturating_sub(bytes);

        if event.persistent_congestion {
            self.congestion_window = self.minimum_window();
            self.recovery_window = self.minimum_window();
        }

        was_blocked != !self.can_send()
    }

    pub fn on_ecn(&mut self, event: &EcnEvent) {
        if self.recovery_state == RecoveryState::NotInRecovery {
            self.recovery_state = RecoveryState::Conservative;
            self.end_of_recovery = Some(event.largest_sent_packet_number);
            self.recovery_window = (*self.bytes_in_flight).max(self.minimum_window());
        }
    }

    /// BBR's model is not loss-driven, so a retracted loss changes nothing
    #[inline]
    pub fn on_spurious_congestion_event(&mut self) -> bool {
        false
    }

    pub fn reset(&mut self, full_reset: bool) {
        let bytes_in_flight = self.bytes_in_flight;
        *self = Self::new(
            &Settings {
                pacing_enabled: self.pacing_enabled,
                initial_window_packets: self.initial_congestion_window_packets,
                ..Default::default()
            },
            self.datagram_payload_size,
        );
        if !full_reset {
            self.bytes_in_flight = bytes_in_flight;
        }
    }

    pub fn network_statistics(&self) -> NetworkStatistics {
        NetworkStatistics {
            bytes_in_flight: *self.bytes_in_flight,
            congestion_window: self.congestion_window(),
            smoothed_rtt: self.smoothed_rtt,
            bandwidth: self.bandwidth_filter.bandwidth(),
        }
    }

    #[inline]
    fn minimum_window(&self) -> u32 {
        MIN_CWND_PACKETS * self.datagram_payload_size as u32
    }

    /// The bandwidth-delay product scaled by `gain`, in bytes
    fn target_window(&self, gain: u32) -> u32 {
        let bandwidth = self.bandwidth_filter.bandwidth();
        if bandwidth == 0 || self.min_rtt == u64::MAX {
            // no model yet: scale the initial window instead
            return ((self.initial_congestion_window as u64 * gain as u64)
                / GAIN_UNIT as u64) as u32;
        }

        let bdp = bandwidth * self.min_rtt / 1_000_000;
        let target = bdp * gain as u64 / GAIN_UNIT as u64;
        target.try_into().unwrap_or(u32::MAX)
    }

    fn update_min_rtt(&mut self, min_rtt: Duration, now: Timestamp) {
        let sample = min_rtt.as_micros() as u64;

        self.rtt_sample_expired = self.min_rtt_timestamp.map_or(true, |timestamp| {
            now.saturating_duration_since(timestamp) > MIN_RTT_EXPIRY
        });

        if self.rtt_sample_expired || sample <= self.min_rtt {
            self.min_rtt = sample;
            self.min_rtt_timestamp = Some(now);
        }
    }

    fn update_round_trip_counter(&mut self, event: &AckEvent) -> bool {
        let round_over = self
            .end_of_round_trip
            .map_or(true, |end| event.largest_packet_number_acked > end);
        ensure!(round_over, false);

        self.round_trip_counter += 1;
        self.end_of_round_trip = Some(event.largest_sent_packet_number);
        true
    }

    fn update_bandwidth(&mut self, event: &AckEvent, now: Timestamp) {
        let Some(last_ack_time) = self.last_ack_time else {
            return;
        };
        let elapsed = now.saturating_duration_since(last_ack_time).as_micros() as u64;
        let elapsed = elapsed.max(1);

        let sample = event.num_retransmittable_bytes as u64 * 1_000_000 / elapsed;
        self.bandwidth_filter.on_sample(
            sample,
            self.round_trip_counter,
            event.largest_packet_number_acked,
        );
    }

    /// Tracks how far ack arrival outpaces the bandwidth estimate, to
    /// compensate the window for ack batching by the network
    fn update_ack_aggregation(&mut self, bytes: u32, now: Timestamp) {
        let bandwidth = self.bandwidth_filter.bandwidth();
        ensure!(bandwidth > 0);

        let start = *self.ack_aggregation_start_time.get_or_insert(now);
        let expected =
            bandwidth * now.saturating_duration_since(start).as_micros() as u64 / 1_000_000;

        self.aggregated_ack_bytes += bytes as u64;
        if self.aggregated_ack_bytes <= expected {
            // the ack rate fell back to the model; restart the epoch
            self.aggregated_ack_bytes = 0;
            self.ack_aggregation_start_time = Some(now);
            return;
        }

        self.max_ack_height_filter
            .update_max(self.aggregated_ack_bytes - expected, self.round_trip_counter);
    }

    fn update_recovery_state_on_ack(&mut self, event: &AckEvent, round_start: bool, bytes: u32) {
        match self.recovery_state {
            RecoveryState::NotInRecovery => return,
            RecoveryState::Conservative => {
                if round_start {
                    self.recovery_state = RecoveryState::Growth;
                }
            }
            RecoveryState::Growth => {
                self.recovery_window = self.recovery_window.saturating_add(bytes);
            }
        }

        if !event.has_loss
            && self
                .end_of_recovery
                .map_or(true, |end| event.largest_packet_number_acked > end)
        {
            self.recovery_state = RecoveryState::NotInRecovery;
            self.end_of_recovery = None;
        }
    }

    fn check_startup_full_pipe(&mut self) {
        let bandwidth = self.bandwidth_filter.bandwidth();
        ensure!(bandwidth > 0);

        // still growing by 25% per round: the pipe is not full yet
        if bandwidth * 4 >= self.last_estimated_startup_bandwidth * 5 {
            self.last_estimated_startup_bandwidth = bandwidth;
            self.slow_startup_round_counter = 0;
            return;
        }

        self.slow_startup_round_counter += 1;
        if self.slow_startup_round_counter >= STARTUP_SLOW_ROUND_LIMIT {
            self.btlbw_found = true;
        }
    }

    fn enter_drain(&mut self) {
        self.state = State::Drain;
        self.pacing_gain = DRAIN_GAIN;
        self.cwnd_gain = HIGH_GAIN;
    }

    fn enter_probe_bw(&mut self, now: Timestamp) {
        self.state = State::ProbeBw;
        self.cwnd_gain = PROBE_BW_CWND_GAIN;
        // skip the drain phase when starting the cycle
        self.pacing_cycle_index = 2;
        self.pacing_gain = PACING_CYCLE[self.pacing_cycle_index];
        self.cycle_start = Some(now);
    }

    fn advance_pacing_cycle(&mut self, now: Timestamp) {
        let cycle_start = *self.cycle_start.get_or_insert(now);
        let min_rtt = Duration::from_micros(self.min_rtt.min(1_000_000));
        ensure!(now.saturating_duration_since(cycle_start) >= min_rtt);

        self.pacing_cycle_index = (self.pacing_cycle_index + 1) % PACING_CYCLE.len();
        self.pacing_gain = PACING_CYCLE[self.pacing_cycle_index];
        self.cycle_start = Some(now);
    }

    fn enter_probe_rtt(&mut self) {
        self.state = State::ProbeRtt;
        self.pacing_gain = GAIN_UNIT;
        self.probe_rtt_end_time = None;
        self.probe_rtt_round = None;
    }

    fn run_probe_rtt(&mut self, now: Timestamp) {
        if self.probe_rtt_end_time.is_none() {
            // wait for the window to drain to the floor before timing
            ensure!(*self.bytes_in_flight <= self.minimum_window());
            self.probe_rtt_end_time = Some(now + PROBE_RTT_DURATION);
            self.probe_rtt_round = Some(self.round_trip_counter);
        }

        let Some(end_time) = self.probe_rtt_end_time else {
            return;
        };
        let round_passed = self
            .probe_rtt_round
            .map_or(false, |round| self.round_trip_counter > round);
        ensure!(now.has_elapsed(end_time) && round_passed);

        // the probe refreshed the estimate
        self.min_rtt_timestamp = Some(now);
        self.rtt_sample_expired = false;

        if self.btlbw_found {
            self.enter_probe_bw(now);
        } else {
            self.state = State::Startup;
            self.pacing_gain = HIGH_GAIN;
            self.cwnd_gain = HIGH_GAIN;
        }
    }

    fn update_congestion_window(&mut self, acked_bytes: u32) {
        ensure!(self.state != State::ProbeRtt);

        let mut target = self.target_window(self.cwnd_gain);
        // compensate for ack aggregation so batched acks do not starve
        // the pipe
        target = target.saturating_add(
            self.max_ack_height_filter
                .get()
                .map_or(0, |entry| entry.value)
                .try_into()
                .unwrap_or(u32::MAX),
        );

        if self.btlbw_found {
            self.congestion_window = self
                .congestion_window
                .saturating_add(acked_bytes)
                .min(target);
        } else {
            // startup: grow unconditionally, the target is still forming
            self.congestion_window = self.congestion_window.saturating_add(acked_bytes);
        }

        self.congestion_window = self.congestion_window.max(self.minimum_window());
    }

    fn update_send_quantum(&mut self) {
        let bandwidth = self.bandwidth_filter.bandwidth();
        let mss = self.datagram_payload_size as u64;

        // low rates pace single datagrams; high rates amortize per-burst
        // costs up to 64KB
        self.send_quantum = if bandwidth < 1_200_000 {
            mss
        } else if bandwidth < 24_000_000 {
            2 * mss
        } else {
            (bandwidth / 1000).clamp(2 * mss, 64 * 1024)
        };
    }

    #[cfg(test)]
    pub(crate) fn state(&self) -> State {
        self.state
    }

    #[cfg(test)]
    pub(crate) fn recovery_state(&self) -> RecoveryState {
        self.recovery_state
    }

    #[cfg(test)]
    pub(crate) fn gains(&self) -> (u32, u32) {
        (self.pacing_gain, self.cwnd_gain)
    }

    #[cfg(test)]
    pub(crate) fn set_bytes_in_flight(&mut self, bytes: u32) {
        self.bytes_in_flight = Counter::new(bytes);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::time::{Clock, NoopClock};

    const MTU: u16 = 1280;

    fn settings() -> Settings {
        Settings {
            pacing_enabled: false,
            ..Default::default()
        }
    }

    fn bbr() -> Bbr {
        Bbr::new(&settings(), MTU)
    }

    fn ack(now: Timestamp, largest_acked: u64, largest_sent: u64, bytes: u32) -> AckEvent {
        AckEvent {
            time_now: now,
            largest_packet_number_acked: largest_acked,
            largest_sent_packet_number: largest_sent,
            num_retransmittable_bytes: bytes,
            smoothed_rtt: Duration::from_millis(50),
            min_rtt: Duration::from_millis(40),
            min_rtt_valid: true,
            is_implicit: false,
            has_loss: false,
            is_largest_acked_packet_app_limited: false,
        }
    }

    #[test]
    fn initial_state() {
        let cc = bbr();
        assert_eq!(cc.state(), State::Startup);
        assert_eq!(cc.recovery_state(), RecoveryState::NotInRecovery);
        assert_eq!(cc.bytes_in_flight(), 0);
        assert_eq!(cc.bytes_in_flight_max(), 0);
        assert_eq!(cc.exemptions(), 0);
        assert_eq!(cc.congestion_window(), 10 * MTU as u32);
        assert!(!cc.is_app_limited());
    }

    #[test]
    fn initial_gains_are_high_gain() {
        let cc = bbr();
        let expected = 256 * 2885 / 1000 + 1;
        assert_eq!(HIGH_GAIN, expected);
        assert_eq!(cc.gains(), (expected, expected));
    }

    #[test]
    fn probe_rtt_window_is_floor() {
        let mut cc = bbr();
        let initial = cc.congestion_window();

        cc.enter_probe_rtt();
        let probe_rtt_window = cc.congestion_window();
        assert_eq!(probe_rtt_window, MIN_CWND_PACKETS * MTU as u32);
        assert!(probe_rtt_window < initial);
        assert_ne!(probe_rtt_window, 0);
    }

    #[test]
    fn spurious_congestion_is_ignored() {
        let mut cc = bbr();
        assert!(!cc.on_spurious_congestion_event());

        cc.on_data_lost(&LossEvent {
            largest_packet_number_lost: 1,
            largest_sent_packet_number: 5,
            num_retransmittable_bytes: 1000,
            persistent_congestion: false,
        });
        assert!(!cc.on_spurious_congestion_event());
    }

    #[test]
    fn can_send_semantics() {
        let mut cc = bbr();

        cc.set_bytes_in_flight(cc.congestion_window() - 1);
        assert!(cc.can_send());

        cc.set_bytes_in_flight(cc.congestion_window());
        assert!(!cc.can_send());

        cc.set_exemption(1);
        assert!(cc.can_send());
    }

    #[test]
    fn loss_enters_recovery_and_bounds_window() {
        let mut cc = bbr();
        cc.on_data_sent(8000);

        cc.on_data_lost(&LossEvent {
            largest_packet_number_lost: 2,
            largest_sent_packet_number: 8,
            num_retransmittable_bytes: 2000,
            persistent_congestion: false,
        });

        assert_eq!(cc.recovery_state(), RecoveryState::Conservative);
        // the effective window is bounded by the recovery window
        assert!(cc.congestion_window() <= cc.congestion_window);
    }

    #[test]
    fn recovery_exits_after_end_of_recovery_ack() {
        let mut cc = bbr();
        let now = NoopClock.get_time();
        cc.on_data_sent(8000);

        cc.on_data_lost(&LossEvent {
            largest_packet_number_lost: 2,
            largest_sent_packet_number: 8,
            num_retransmittable_bytes: 2000,
            persistent_congestion: false,
        });
        assert_ne!(cc.recovery_state(), RecoveryState::NotInRecovery);

        cc.on_data_acknowledged(&ack(now, 9, 12, 2000));
        assert_eq!(cc.recovery_state(), RecoveryState::NotInRecovery);
    }

    #[test]
    fn startup_exits_to_drain_without_bandwidth_growth() {
        let mut cc = bbr();
        let mut now = NoopClock.get_time();
        let mut pn = 0;

        // several rounds delivering the same bandwidth: startup gives up
        // and drains
        for _ in 0..16 {
            pn += 10;
            cc.on_data_sent(10_000);
            let event = ack(now, pn, pn + 10, 10_000);
            cc.on_data_acknowledged(&event);
            now += Duration::from_millis(10);
            ensure!(cc.state() == State::Startup, break);
        }

        assert_ne!(cc.state(), State::Startup);
    }

    #[test]
    fn app_limited_round_trip() {
        let mut cc = bbr();
        let now = NoopClock.get_time();

        cc.on_data_sent(1000);
        cc.on_data_acknowledged(&ack(now, 1, 5, 1000));

        cc.set_app_limited();
        assert!(cc.is_app_limited());

        // acknowledged past the exit target clears the flag
        cc.on_data_acknowledged(&ack(now + Duration::from_millis(10), 6, 10, 1000));
        assert!(!cc.is_app_limited());
    }

    #[test]
    fn reset_scenarios() {
        let mut cc = bbr();
        cc.on_data_sent(5000);

        cc.reset(false);
        assert_eq!(cc.bytes_in_flight(), 5000);
        assert_eq!(cc.state(), State::Startup);
        assert_eq!(cc.gains(), (HIGH_GAIN, HIGH_GAIN));

        cc.reset(true);
        assert_eq!(cc.bytes_in_flight(), 0);
        assert_eq!(cc.congestion_window(), 10 * MTU as u32);
    }

    #[test]
    fn network_statistics() {
        let mut cc = bbr();
        let now = NoopClock.get_time();
        cc.on_data_sent(4000);
        cc.on_data_acknowledged(&ack(now, 1, 3, 2000));
        cc.on_data_acknowledged(&ack(now + Duration::from_millis(5), 2, 3, 2000));

        let stats = cc.network_statistics();
        assert_eq!(stats.bytes_in_flight, 0);
        assert_eq!(stats.congestion_window, cc.congestion_window());
        assert!(stats.bandwidth > 0);
    }
}
