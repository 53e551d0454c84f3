// SPDX-FileCopyrightText: 2025 The seedgate Contributors
// SPDX-License-Identifier: GPL-3.0-or-later

use std::collections::VecDeque;
use std::time::Duration;

use tokio::time::Instant;

const TICK: Duration = Duration::from_secs(1);
pub const SPEED_WINDOW: usize = 5;

/// Moving average of throughput over the last few whole seconds.
#[derive(Debug)]
pub struct SpeedMeter {
    history: VecDeque<u64>,
    bytes_this_tick: u64,
    tick_started: Instant,
}

impl Default for SpeedMeter {
    fn default() -> Self {
        Self::new()
    }
}

impl SpeedMeter {
    pub fn new() -> Self {
        Self {
            history: VecDeque::with_capacity(SPEED_WINDOW),
            bytes_this_tick: 0,
            tick_started: Instant::now(),
        }
    }

    pub fn record(&mut self, bytes: u64) {
        self.roll(Instant::now());
        self.bytes_this_tick += bytes;
    }

    /// Bytes per second, or `None` until one full second has been observed.
    pub fn measured(&mut self) -> Option<f64> {
        self.roll(Instant::now());
        if self.history.is_empty() {
            return None;
        }
        let total: u64 = self.history.iter().sum();
        Some(total as f64 / self.history.len() as f64)
    }

    fn roll(&mut self, now: Instant) {
        let elapsed = now.duration_since(self.tick_started);
        let ticks = elapsed.as_secs();
        if ticks == 0 {
            return;
        }

        self.push(self.bytes_this_tick);
        self.bytes_this_tick = 0;
        // Idle seconds count as zero, but only a window's worth matters.
        for _ in 1..ticks.min(SPEED_WINDOW as u64 + 1) {
            self.push(0);
        }
        self.tick_started += TICK * ticks as u32;
    }

    fn push(&mut self, sample: u64) {
        if self.history.len() == SPEED_WINDOW {
            self.history.pop_front();
        }
        self.history.push_back(sample);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_no_measurement_before_first_tick() {
        tokio::time::pause();
        let mut meter = SpeedMeter::new();
        meter.record(10_000);
        assert_eq!(meter.measured(), None);
    }

    #[tokio::test]
    async fn test_averages_over_window() {
        tokio::time::pause();
        let mut meter = SpeedMeter::new();
        for bytes in [1000, 2000, 3000] {
            meter.record(bytes);
            tokio::time::advance(TICK).await;
        }
        assert_eq!(meter.measured(), Some(2000.0));
    }

    #[tokio::test]
    async fn test_idle_time_decays_the_average() {
        tokio::time::pause();
        let mut meter = SpeedMeter::new();
        meter.record(5000);
        tokio::time::advance(TICK).await;
        assert_eq!(meter.measured(), Some(5000.0));

        tokio::time::advance(Duration::from_secs(60)).await;
        assert_eq!(meter.measured(), Some(0.0));
    }
}
