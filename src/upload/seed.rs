// SPDX-FileCopyrightText: 2025 The seedgate Contributors
// SPDX-License-Identifier: GPL-3.0-or-later

//! Slot client for swarm seeding. Idle seeding yields to everything else;
//! pieces a peer is actively waiting for run now or not at all.

use super::slot_manager::{SlotDecision, SlotRequest, SlotUser, UploadSlotManager};
use super::speed::SpeedMeter;
use crate::errors::UploadError;
use crate::throttle::BandwidthThrottle;

use std::net::IpAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

use tokio::io::{AsyncWrite, AsyncWriteExt};
use tokio::sync::Notify;
use tracing::{event, Level};

#[derive(Debug)]
struct SeedUser {
    id: u64,
    host: IpAddr,
    meter: Mutex<SpeedMeter>,
    preempted: AtomicBool,
    preempt_notify: Notify,
    promoted: Notify,
}

impl SeedUser {
    fn meter(&self) -> MutexGuard<'_, SpeedMeter> {
        match self.meter.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    fn was_preempted(&self) -> bool {
        self.preempted.load(Ordering::Acquire)
    }
}

impl SlotUser for SeedUser {
    fn id(&self) -> u64 {
        self.id
    }

    fn host(&self) -> IpAddr {
        self.host
    }

    fn measured_bandwidth(&self) -> Option<f64> {
        self.meter().measured()
    }

    fn release_slot(&self) {
        self.preempted.store(true, Ordering::Release);
        self.preempt_notify.notify_waiters();
    }

    fn slot_available(&self) {
        self.promoted.notify_one();
    }
}

pub struct SeedUploader {
    user: Arc<SeedUser>,
    slots: Arc<UploadSlotManager>,
}

impl SeedUploader {
    pub fn new(id: u64, host: IpAddr, slots: Arc<UploadSlotManager>) -> Self {
        Self {
            user: Arc::new(SeedUser {
                id,
                host,
                meter: Mutex::new(SpeedMeter::new()),
                preempted: AtomicBool::new(false),
                preempt_notify: Notify::new(),
                promoted: Notify::new(),
            }),
            slots,
        }
    }

    pub fn id(&self) -> u64 {
        self.user.id
    }

    /// Asks for a slot. An idle seed that gets queued waits here until the
    /// scheduler promotes it; dropping the future withdraws the request.
    /// `None` means the request was turned down.
    pub async fn acquire(&self, wanted: bool) -> Option<SeedSlot> {
        self.user.preempted.store(false, Ordering::Release);
        let id = self.user.id;

        match self.slots.request_slot(SlotRequest::seed(self.user.clone(), wanted)) {
            SlotDecision::Granted => return Some(self.slot()),
            SlotDecision::Rejected => return None,
            SlotDecision::Queued(position) => {
                event!(Level::DEBUG, id, position, "Seed upload queued");
            }
        }

        let mut guard = QueueGuard {
            slots: &self.slots,
            id,
            armed: true,
        };
        loop {
            let promoted = self.user.promoted.notified();
            if self.slots.is_active(id) {
                break;
            }
            if self.slots.position_in_queue(id).is_none() {
                guard.armed = false;
                return None;
            }
            promoted.await;
        }
        guard.armed = false;
        Some(self.slot())
    }

    fn slot(&self) -> SeedSlot {
        SeedSlot {
            user: self.user.clone(),
            slots: self.slots.clone(),
        }
    }
}

/// Withdraws a queued request if the waiting future goes away.
struct QueueGuard<'a> {
    slots: &'a UploadSlotManager,
    id: u64,
    armed: bool,
}

impl Drop for QueueGuard<'_> {
    fn drop(&mut self) {
        if self.armed {
            self.slots.cancel_request(self.id);
        }
    }
}

/// An active seed slot. Dropping it hands the slot back.
pub struct SeedSlot {
    user: Arc<SeedUser>,
    slots: Arc<UploadSlotManager>,
}

impl SeedSlot {
    pub fn was_preempted(&self) -> bool {
        self.user.was_preempted()
    }

    /// Resolves when the scheduler takes this slot away.
    pub async fn preempted(&self) {
        loop {
            let notified = self.user.preempt_notify.notified();
            if self.user.was_preempted() {
                return;
            }
            notified.await;
        }
    }

    /// Writes one block to the swarm peer under the shared throttle. The
    /// bytes count towards this slot's measured throughput.
    pub async fn send<W>(
        &self,
        throttle: &BandwidthThrottle,
        writer: &mut W,
        data: &[u8],
    ) -> Result<(), UploadError>
    where
        W: AsyncWrite + Unpin,
    {
        tokio::select! {
            biased;
            _ = self.preempted() => Err(UploadError::Preempted),
            written = async {
                throttle.acquire(data.len()).await;
                writer.write_all(data).await
            } => {
                written?;
                self.user.meter().record(data.len() as u64);
                Ok(())
            }
        }
    }
}

impl Drop for SeedSlot {
    fn drop(&mut self) {
        if !self.user.was_preempted() {
            self.slots.request_done(self.user.id);
        }
    }
}
