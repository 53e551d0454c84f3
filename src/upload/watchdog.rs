// SPDX-FileCopyrightText: 2025 The seedgate Contributors
// SPDX-License-Identifier: GPL-3.0-or-later

use crate::stats::{StatsSink, UploadStat};

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, Weak};
use std::time::Duration;

use tokio::sync::Notify;
use tokio::time::Instant;
use tracing::{event, Level};

pub const DEFAULT_STALL_DELAY: Duration = Duration::from_secs(120);

/// One-shot close flag a transfer loop selects on alongside its writes.
#[derive(Debug, Default)]
pub struct StallSignal {
    closed: AtomicBool,
    notify: Notify,
}

impl StallSignal {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn close(&self) {
        if !self.closed.swap(true, Ordering::AcqRel) {
            self.notify.notify_waiters();
        }
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    pub async fn closed(&self) {
        loop {
            let notified = self.notify.notified();
            if self.is_closed() {
                return;
            }
            notified.await;
        }
    }
}

struct WatchdogState {
    channel: Option<Arc<StallSignal>>,
    scheduled: bool,
    next_deadline: Option<Instant>,
    triggered: bool,
    delay: Duration,
}

/// Closes the bound signal once it has seen a full `delay` without activity.
///
/// Each write calls [`activate`](Self::activate) before it starts and
/// [`deactivate`](Self::deactivate) once it finishes. At most one timer task
/// is pending at a time; when it fires early because of a later activation
/// it sleeps again for the difference instead of closing.
pub struct StalledWatchdog {
    state: Arc<Mutex<WatchdogState>>,
    stats: Arc<dyn StatsSink>,
}

fn lock(state: &Mutex<WatchdogState>) -> MutexGuard<'_, WatchdogState> {
    match state.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}

impl StalledWatchdog {
    pub fn new(delay: Duration, stats: Arc<dyn StatsSink>) -> Self {
        Self {
            state: Arc::new(Mutex::new(WatchdogState {
                channel: None,
                scheduled: false,
                next_deadline: None,
                triggered: false,
                delay,
            })),
            stats,
        }
    }

    pub fn set_delay(&self, delay: Duration) {
        lock(&self.state).delay = delay;
    }

    pub fn activate(&self, channel: Arc<StallSignal>) {
        let mut state = lock(&self.state);
        let deadline = Instant::now() + state.delay;
        state.next_deadline = Some(deadline);
        state.channel = Some(channel);
        if !state.scheduled {
            state.scheduled = true;
            self.schedule(deadline);
        }
    }

    /// Marks the watchdog idle. A pending timer is left to notice on its own.
    pub fn deactivate(&self) {
        let mut state = lock(&self.state);
        state.next_deadline = None;
        state.channel = None;
    }

    pub fn triggered(&self) -> bool {
        lock(&self.state).triggered
    }

    fn schedule(&self, at: Instant) {
        let state = Arc::downgrade(&self.state);
        let stats = self.stats.clone();
        tokio::spawn(async move {
            tokio::time::sleep_until(at).await;
            fire(state, stats);
        });
    }
}

fn fire(state: Weak<Mutex<WatchdogState>>, stats: Arc<dyn StatsSink>) {
    let Some(shared) = state.upgrade() else {
        return;
    };

    let channel = {
        let mut state = lock(&shared);
        state.scheduled = false;
        let Some(deadline) = state.next_deadline else {
            return;
        };

        let now = Instant::now();
        if now < deadline {
            state.scheduled = true;
            let weak = Arc::downgrade(&shared);
            tokio::spawn(async move {
                tokio::time::sleep_until(deadline).await;
                fire(weak, stats);
            });
            return;
        }

        state.next_deadline = None;
        state.triggered = true;
        state.channel.take()
    };

    if let Some(channel) = channel {
        event!(Level::WARN, "Upload stalled, closing connection");
        stats.increment(UploadStat::Stalled);
        channel.close();
    }
}
