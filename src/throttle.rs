// SPDX-FileCopyrightText: 2025 The seedgate Contributors
// SPDX-License-Identifier: GPL-3.0-or-later

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;

use tokio::time::Instant;

/// One second of traffic at the configured rate.
struct Bucket {
    last_refill_time: Instant,
    tokens: f64,
    fill_rate: f64, // bytes per second
    capacity: f64,
}

impl Bucket {
    fn new(rate: f64) -> Self {
        Bucket {
            last_refill_time: Instant::now(),
            tokens: rate, // Start with a full bucket
            fill_rate: rate,
            capacity: rate,
        }
    }

    fn set_rate(&mut self, new_rate: f64) {
        self.fill_rate = new_rate;
        self.capacity = new_rate;
        self.tokens = new_rate;
        self.last_refill_time = Instant::now();
    }

    fn refill(&mut self) {
        let now = Instant::now();
        let elapsed = now.duration_since(self.last_refill_time);
        self.last_refill_time = now;

        let tokens_to_add = elapsed.as_secs_f64() * self.fill_rate;
        self.tokens = f64::min(self.capacity, self.tokens + tokens_to_add);
    }

    fn take(&mut self, amount: f64) -> Grant {
        self.refill();

        if amount > self.capacity {
            // A single write larger than one second of budget drains the
            // bucket and sleeps off the remainder.
            let owed = amount - self.tokens.max(0.0);
            self.tokens = 0.0;
            Grant::AfterDebt(Duration::from_secs_f64(owed / self.fill_rate))
        } else if self.tokens >= amount {
            self.tokens -= amount;
            Grant::Now
        } else {
            let tokens_needed = amount - self.tokens;
            Grant::Retry(Duration::from_secs_f64(
                (tokens_needed / self.fill_rate).max(0.001),
            ))
        }
    }
}

/// Global upload rate limiter shared by every active transfer.
///
/// The configured rate lives in an atomic so it can be changed while writes
/// are waiting; each waiting writer picks the new rate up on its next pass.
/// A rate of zero means unlimited.
pub struct BandwidthThrottle {
    rate_bps: AtomicU64,
    bucket: Mutex<Bucket>,
}

impl BandwidthThrottle {
    pub fn new(rate_bps: u64) -> Self {
        Self {
            rate_bps: AtomicU64::new(rate_bps),
            bucket: Mutex::new(Bucket::new(rate_bps as f64)),
        }
    }

    pub fn unlimited() -> Self {
        Self::new(0)
    }

    pub fn rate(&self) -> u64 {
        self.rate_bps.load(Ordering::Acquire)
    }

    pub fn set_rate(&self, rate_bps: u64) {
        self.rate_bps.store(rate_bps, Ordering::Release);
        self.lock_bucket().set_rate(rate_bps as f64);
    }

    fn lock_bucket(&self) -> MutexGuard<'_, Bucket> {
        match self.bucket.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    /// Waits until `amount` bytes may be written.
    pub async fn acquire(&self, amount: usize) {
        let amount = amount as f64;
        loop {
            let rate = self.rate();
            if rate == 0 {
                return; // Unlimited
            }
            let rate = rate as f64;

            let grant = {
                let mut bucket = self.lock_bucket();
                if bucket.fill_rate != rate {
                    bucket.set_rate(rate);
                }
                bucket.take(amount)
            };

            match grant {
                Grant::Now => return,
                Grant::AfterDebt(debt) => {
                    tokio::time::sleep(debt).await;
                    return;
                }
                Grant::Retry(wait_time) => tokio::time::sleep(wait_time).await,
            }
        }
    }
}

enum Grant {
    Now,
    AfterDebt(Duration),
    Retry(Duration),
}
