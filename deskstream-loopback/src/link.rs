//! Simulated transport between the two pipelines.
//!
//! Every serialised message is metered through a [`LinkModel`]: a
//! rolling throughput window, a drain-at-capacity send queue and a
//! deterministic loss model. Lost packets are counted as NACKs and
//! assumed retransmitted, so delivery itself is lossless. The model's
//! [`LinkReport`] is what the client pipeline receives as telemetry.

use std::collections::VecDeque;
use std::time::{Duration, Instant};

use crate::config::LinkConfig;

/// Payload bytes per simulated packet.
const PACKET_BYTES: u64 = 1_200;

/// Telemetry snapshot handed to the client pipeline.
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct LinkReport {
    pub bwe_bps: u64,
    pub rtt_ms: u32,
    pub loss_rate: f32,
    /// NACKs since the previous report.
    pub nack: u32,
}

/// Rolling-window link meter.
pub struct LinkModel {
    /// Samples: `(when, bytes)`.
    samples: VecDeque<(Instant, u64)>,
    window: Duration,
    total_bytes: u64,
    bytes_sent: u64,

    capacity_bps: u64,
    base_rtt: Duration,
    loss_rate: f64,
    max_queue: Duration,

    /// Bits waiting to drain at `capacity_bps`.
    backlog_bits: f64,
    last_drain: Option<Instant>,
    smoothed_rtt_us: u64,
    loss_credit: f64,

    // Since the last report.
    packets: u64,
    lost: u64,
}

impl LinkModel {
    pub fn new(config: &LinkConfig) -> Self {
        Self {
            samples: VecDeque::with_capacity(256),
            window: Duration::from_secs(1),
            total_bytes: 0,
            bytes_sent: 0,
            capacity_bps: config.capacity_bps.max(1),
            base_rtt: Duration::from_millis(config.base_rtt_ms),
            loss_rate: config.loss_rate.clamp(0.0, 1.0) as f64,
            max_queue: Duration::from_millis(config.max_queue_ms),
            backlog_bits: 0.0,
            last_drain: None,
            smoothed_rtt_us: 0,
            loss_credit: 0.0,
            packets: 0,
            lost: 0,
        }
    }

    /// Meter one message of `bytes` sent now.
    pub fn transmit(&mut self, bytes: u64) {
        self.transmit_at(Instant::now(), bytes);
    }

    /// Meter with an explicit timestamp (useful for testing).
    pub fn transmit_at(&mut self, when: Instant, bytes: u64) {
        self.drain(when);

        self.samples.push_back((when, bytes));
        self.total_bytes += bytes;
        self.bytes_sent += bytes;
        self.evict(when);

        let packets = bytes.div_ceil(PACKET_BYTES).max(1);
        self.packets += packets;

        // Random loss, spread evenly.
        self.loss_credit += self.loss_rate * packets as f64;
        let random_loss = (self.loss_credit + 1e-9).floor();
        self.loss_credit = (self.loss_credit - random_loss).max(0.0);
        self.lost += random_loss as u64;

        // Queue overflow.
        self.backlog_bits += (bytes * 8) as f64;
        let limit_bits = self.capacity_bps as f64 * self.max_queue.as_secs_f64();
        if self.backlog_bits > limit_bits {
            let excess = self.backlog_bits - limit_bits;
            self.lost += (excess / (PACKET_BYTES * 8) as f64).ceil() as u64;
            self.backlog_bits = limit_bits;
        }
        self.lost = self.lost.min(self.packets);

        self.record_rtt(self.base_rtt + self.queue_delay());
    }

    /// Time the newest byte waits before it is on the wire.
    pub fn queue_delay(&self) -> Duration {
        Duration::from_secs_f64(self.backlog_bits / self.capacity_bps as f64)
    }

    /// Throughput over the rolling window, bits/second.
    pub fn throughput_bps(&self) -> u64 {
        let (Some((first, _)), Some((last, _))) = (self.samples.front(), self.samples.back()) else {
            return 0;
        };
        let elapsed = last.duration_since(*first).max(Duration::from_millis(1));
        (self.total_bytes as f64 * 8.0 / elapsed.as_secs_f64()) as u64
    }

    /// Smoothed round-trip time.
    pub fn rtt(&self) -> Duration {
        if self.smoothed_rtt_us == 0 {
            self.base_rtt
        } else {
            Duration::from_micros(self.smoothed_rtt_us)
        }
    }

    pub fn bytes_sent(&self) -> u64 {
        self.bytes_sent
    }

    /// Bandwidth estimate: full capacity while the queue is empty, the
    /// measured throughput once packets start to queue.
    pub fn bandwidth_estimate(&self) -> u64 {
        if self.backlog_bits > 0.0 {
            self.throughput_bps().min(self.capacity_bps).max(1)
        } else {
            self.capacity_bps
        }
    }

    /// Snapshot for the client; resets the per-report loss counters.
    pub fn report(&mut self) -> LinkReport {
        self.drain(Instant::now());
        let loss_rate = if self.packets == 0 {
            0.0
        } else {
            self.lost as f32 / self.packets as f32
        };
        let report = LinkReport {
            bwe_bps: self.bandwidth_estimate(),
            rtt_ms: self.rtt().as_millis().min(u32::MAX as u128) as u32,
            loss_rate,
            nack: self.lost.min(u32::MAX as u64) as u32,
        };
        self.packets = 0;
        self.lost = 0;
        report
    }

    /// Forget queue state and RTT history, as after a reconnect.
    pub fn reset(&mut self) {
        self.samples.clear();
        self.total_bytes = 0;
        self.backlog_bits = 0.0;
        self.last_drain = None;
        self.smoothed_rtt_us = 0;
        self.loss_credit = 0.0;
        self.packets = 0;
        self.lost = 0;
    }

    // ── Internal ─────────────────────────────────────────────────

    fn drain(&mut self, now: Instant) {
        if let Some(prev) = self.last_drain {
            let drained = self.capacity_bps as f64 * now.saturating_duration_since(prev).as_secs_f64();
            self.backlog_bits = (self.backlog_bits - drained).max(0.0);
        }
        self.last_drain = Some(now);
    }

    /// EWMA, α = 1/8.
    fn record_rtt(&mut self, rtt: Duration) {
        let rtt_us = rtt.as_micros() as u64;
        if self.smoothed_rtt_us == 0 {
            self.smoothed_rtt_us = rtt_us;
        } else {
            self.smoothed_rtt_us = self.smoothed_rtt_us * 7 / 8 + rtt_us / 8;
        }
    }

    fn evict(&mut self, now: Instant) {
        while let Some(&(ts, bytes)) = self.samples.front() {
            if now.duration_since(ts) > self.window {
                self.samples.pop_front();
                self.total_bytes = self.total_bytes.saturating_sub(bytes);
            } else {
                break;
            }
        }
    }
}

// ── Tests ────────────────────────────────────────────────────────
