//! Traffic statistics aggregation
//!
//! The orchestrator polls the tunnel engine on a fixed timer and feeds the
//! counters through a [`StatsAggregator`], which turns cumulative counters
//! into incremental rates, suppresses idle noise below a minimum-rate
//! floor, and zeroes out cleanly when the engine reports its counters
//! unavailable. Snapshots are published through a `tokio::sync::watch`
//! channel so late subscribers always see the most recent value and slow
//! subscribers never block the polling timer.

use crate::config::StatsConfig;
use crate::engine::EngineCounters;
use std::time::Instant;

/// One merged statistics snapshot, produced at most once per poll interval
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TrafficSnapshot {
    /// Upload rate in bytes/sec, zero when below the noise floor
    pub tx_rate_bps: u64,
    /// Download rate in bytes/sec, zero when below the noise floor
    pub rx_rate_bps: u64,
    /// Upload packet rate in packets/sec
    pub tx_packet_rate: u64,
    /// Download packet rate in packets/sec
    pub rx_packet_rate: u64,
    /// Cumulative bytes uploaded this session (never thresholded)
    pub tx_total: u64,
    /// Cumulative bytes downloaded this session (never thresholded)
    pub rx_total: u64,
}

impl TrafficSnapshot {
    pub fn tx_rate_display(&self) -> String {
        format!("{}/s", format_bytes(self.tx_rate_bps))
    }

    pub fn rx_rate_display(&self) -> String {
        format!("{}/s", format_bytes(self.rx_rate_bps))
    }
}

impl std::fmt::Display for TrafficSnapshot {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "up {} ({} total) / down {} ({} total)",
            self.tx_rate_display(),
            format_bytes(self.tx_total),
            self.rx_rate_display(),
            format_bytes(self.rx_total)
        )
    }
}

/// Format a byte count with binary units for display
pub fn format_bytes(bytes: u64) -> String {
    const UNITS: [&str; 5] = ["B", "KiB", "MiB", "GiB", "TiB"];
    let mut value = bytes as f64;
    let mut unit = 0;
    while value >= 1024.0 && unit < UNITS.len() - 1 {
        value /= 1024.0;
        unit += 1;
    }
    if unit == 0 {
        format!("{bytes} B")
    } else {
        format!("{:.1} {}", value, UNITS[unit])
    }
}

/// Turns cumulative engine counters into rate snapshots.
///
/// Keeps the last-seen counters and poll timestamp; owned by the single
/// polling task, so no internal locking is needed.
#[derive(Debug)]
pub struct StatsAggregator {
    config: StatsConfig,
    previous: Option<(EngineCounters, Instant)>,
}

impl StatsAggregator {
    pub fn new(config: StatsConfig) -> Self {
        Self {
            config,
            previous: None,
        }
    }

    /// Process one poll's counters into a snapshot.
    ///
    /// A `None` reading (engine counters unavailable) clears all previous
    /// state and yields the all-zero snapshot - never a stale or guessed
    /// value.
    pub fn poll(&mut self, counters: Option<EngineCounters>) -> TrafficSnapshot {
        self.poll_at(counters, Instant::now())
    }

    fn poll_at(&mut self, counters: Option<EngineCounters>, now: Instant) -> TrafficSnapshot {
        let Some(current) = counters else {
            self.previous = None;
            return TrafficSnapshot::default();
        };

        // First poll has no prior timestamp; use the fixed interval as the
        // elapsed denominator instead of dividing by zero.
        let (prev, elapsed_secs) = match self.previous {
            Some((prev, at)) => {
                let elapsed = now.saturating_duration_since(at).as_secs_f64();
                (prev, if elapsed > 0.0 { elapsed } else { self.config.interval.as_secs_f64() })
            }
            None => (EngineCounters::default(), self.config.interval.as_secs_f64()),
        };
        self.previous = Some((current, now));

        let rate = |cur: u64, last: u64| -> u64 {
            (cur.saturating_sub(last) as f64 / elapsed_secs).round() as u64
        };

        let tx_rate = rate(current.tx_bytes, prev.tx_bytes);
        let rx_rate = rate(current.rx_bytes, prev.rx_bytes);

        TrafficSnapshot {
            tx_rate_bps: if tx_rate < self.config.min_rate { 0 } else { tx_rate },
            rx_rate_bps: if rx_rate < self.config.min_rate { 0 } else { rx_rate },
            tx_packet_rate: rate(current.tx_packets, prev.tx_packets),
            rx_packet_rate: rate(current.rx_packets, prev.rx_packets),
            tx_total: current.tx_bytes,
            rx_total: current.rx_bytes,
        }
    }

    /// Forget all previous counters; the next poll behaves like the first.
    pub fn reset(&mut self) {
        self.previous = None;
    }
}

impl Default for StatsAggregator {
    fn default() -> Self {
        Self::new(StatsConfig::default())
    }
}
