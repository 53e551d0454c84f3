// SPDX-FileCopyrightText: 2025 The seedgate Contributors
// SPDX-License-Identifier: GPL-3.0-or-later

//! Admission control for upload slots.
//!
//! Two families of callers compete for the same pool of slots. HTTP uploads
//! run at [`Priority::TransferMedium`], may wait in the HTTP queue and are
//! never preempted. Seed uploads run at [`Priority::SeedLow`] while idle
//! seeding (preemptible, waiting in the resumable queue) or at
//! [`Priority::DownloadHigh`] when the peer actively wants the data (must run
//! now or fail).
//!
//! The manager never blocks a caller. Preempted users learn about it through
//! [`SlotUser::release_slot`], queued seed users through
//! [`SlotUser::slot_available`]. Both callbacks run after the internal lock
//! has been released, so a user may call straight back into the manager.

use crate::config::UploadSettings;

use std::collections::VecDeque;
use std::net::IpAddr;
use std::sync::{Arc, Mutex, MutexGuard};

use tracing::{event, Level};

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Priority {
    SeedLow,
    TransferMedium,
    DownloadHigh,
}

/// Something that occupies or waits for a slot.
pub trait SlotUser: Send + Sync {
    /// Identity used to match requests, queue entries and releases.
    fn id(&self) -> u64;

    fn host(&self) -> IpAddr;

    /// Current throughput in bytes per second, if the user has measured any.
    fn measured_bandwidth(&self) -> Option<f64>;

    /// The scheduler revoked this user's slot. The user must stop
    /// transferring promptly and must not call `request_done` again.
    fn release_slot(&self);

    /// A queued resumable request was promoted into the active set.
    fn slot_available(&self) {}
}

#[derive(Clone)]
pub struct SlotRequest {
    user: Arc<dyn SlotUser>,
    priority: Priority,
    preemptible: bool,
    queueable: bool,
    resumable: bool,
}

impl SlotRequest {
    /// A peer-initiated HTTP upload.
    pub fn http(user: Arc<dyn SlotUser>) -> Self {
        Self {
            user,
            priority: Priority::TransferMedium,
            preemptible: false,
            queueable: true,
            resumable: false,
        }
    }

    /// A seed upload. Wanted pieces must be served now; idle seeding yields.
    pub fn seed(user: Arc<dyn SlotUser>, wanted: bool) -> Self {
        if wanted {
            Self {
                user,
                priority: Priority::DownloadHigh,
                preemptible: false,
                queueable: false,
                resumable: true,
            }
        } else {
            Self {
                user,
                priority: Priority::SeedLow,
                preemptible: true,
                queueable: true,
                resumable: true,
            }
        }
    }

    pub fn priority(&self) -> Priority {
        self.priority
    }

    pub fn id(&self) -> u64 {
        self.user.id()
    }
}

impl std::fmt::Debug for SlotRequest {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SlotRequest")
            .field("id", &self.user.id())
            .field("priority", &self.priority)
            .field("preemptible", &self.preemptible)
            .field("queueable", &self.queueable)
            .finish()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SlotDecision {
    Granted,
    /// 1-based position in the wait queue.
    Queued(usize),
    Rejected,
}

impl SlotDecision {
    /// Wire form: `0` granted, queue position, or `-1` rejected.
    pub fn code(self) -> i64 {
        match self {
            SlotDecision::Granted => 0,
            SlotDecision::Queued(position) => position as i64,
            SlotDecision::Rejected => -1,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SlotLimits {
    pub hard_max: usize,
    pub soft_max: usize,
    pub http_queue_size: usize,
    pub seed_queue_size: usize,
    pub min_upload_speed_bps: f64,
}

impl From<&UploadSettings> for SlotLimits {
    fn from(settings: &UploadSettings) -> Self {
        Self {
            hard_max: settings.hard_max_uploads,
            soft_max: settings.soft_max_uploads,
            http_queue_size: settings.http_queue_size,
            seed_queue_size: settings.seed_queue_size,
            min_upload_speed_bps: settings.min_upload_speed_bps as f64,
        }
    }
}

struct SlotState {
    limits: SlotLimits,
    /// Descending priority, then admission order.
    active: Vec<SlotRequest>,
    http_queue: VecDeque<SlotRequest>,
    seed_queue: VecDeque<SlotRequest>,
}

impl SlotState {
    fn queue(&self, resumable: bool) -> &VecDeque<SlotRequest> {
        if resumable {
            &self.seed_queue
        } else {
            &self.http_queue
        }
    }

    fn queue_mut(&mut self, resumable: bool) -> &mut VecDeque<SlotRequest> {
        if resumable {
            &mut self.seed_queue
        } else {
            &mut self.http_queue
        }
    }

    fn queue_capacity(&self, resumable: bool) -> usize {
        if resumable {
            self.limits.seed_queue_size
        } else {
            self.limits.http_queue_size
        }
    }

    fn is_active(&self, id: u64) -> bool {
        self.active.iter().any(|r| r.id() == id)
    }

    fn queued_index(&self, id: u64) -> Option<(bool, usize)> {
        if let Some(i) = self.http_queue.iter().position(|r| r.id() == id) {
            return Some((false, i));
        }
        self.seed_queue
            .iter()
            .position(|r| r.id() == id)
            .map(|i| (true, i))
    }

    /// Can `count` sessions run alongside the active set minus `excluded`?
    fn has_free_slot(&self, count: usize, excluded: &[usize]) -> bool {
        if count >= self.limits.hard_max {
            return false;
        }
        if count < self.limits.soft_max {
            return true;
        }
        // Past the soft cap only while someone is actually moving data.
        self.active
            .iter()
            .enumerate()
            .filter(|(i, _)| !excluded.contains(i))
            .any(|(_, r)| {
                r.user
                    .measured_bandwidth()
                    .is_some_and(|bw| bw > self.limits.min_upload_speed_bps)
            })
    }

    fn insert_active(&mut self, request: SlotRequest) {
        let at = self
            .active
            .iter()
            .position(|r| r.priority < request.priority)
            .unwrap_or(self.active.len());
        self.active.insert(at, request);
    }

    /// Indices of active sessions `request` may preempt, cheapest first:
    /// lowest priority, most recently admitted.
    fn preemption_candidates(&self, request: &SlotRequest) -> Vec<usize> {
        let mut candidates: Vec<usize> = (0..self.active.len())
            .rev()
            .filter(|&i| {
                let r = &self.active[i];
                r.preemptible && r.priority < request.priority
            })
            .collect();
        // Stable sort keeps most-recent-first within one priority.
        candidates.sort_by_key(|&i| self.active[i].priority);
        candidates
    }

    /// Promotes the head of the resumable queue while it fits.
    fn promote_resumable(&mut self) -> Vec<Arc<dyn SlotUser>> {
        let mut promoted = Vec::new();
        while let Some(head) = self.seed_queue.front() {
            let priority = head.priority;
            let blocked = self.active.iter().any(|r| r.priority > priority);
            if blocked || !self.has_free_slot(self.active.len(), &[]) {
                break;
            }
            if let Some(request) = self.seed_queue.pop_front() {
                event!(Level::DEBUG, id = request.id(), "Promoting queued seed upload");
                promoted.push(request.user.clone());
                self.insert_active(request);
            }
        }
        promoted
    }
}

pub struct UploadSlotManager {
    state: Mutex<SlotState>,
}

impl UploadSlotManager {
    pub fn new(limits: SlotLimits) -> Self {
        Self {
            state: Mutex::new(SlotState {
                limits,
                active: Vec::new(),
                http_queue: VecDeque::new(),
                seed_queue: VecDeque::new(),
            }),
        }
    }

    fn lock(&self) -> MutexGuard<'_, SlotState> {
        match self.state.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    pub fn request_slot(&self, request: SlotRequest) -> SlotDecision {
        let id = request.id();
        let (decision, victims) = {
            let mut state = self.lock();
            Self::decide(&mut state, request)
        };

        for victim in victims {
            event!(Level::INFO, victim = victim.id(), for_id = id, "Preempting upload");
            victim.release_slot();
        }
        event!(Level::DEBUG, id, ?decision, "Slot request decided");
        decision
    }

    fn decide(
        state: &mut SlotState,
        request: SlotRequest,
    ) -> (SlotDecision, Vec<Arc<dyn SlotUser>>) {
        let id = request.id();
        if state.is_active(id) {
            return (SlotDecision::Granted, Vec::new());
        }

        let queued = state.queued_index(id);
        let higher_active = state.active.iter().any(|r| r.priority > request.priority);

        if !higher_active {
            // Waiters ahead of us in our own queue count against capacity.
            let ahead = if request.queueable {
                queued.map_or_else(|| state.queue(request.resumable).len(), |(_, i)| i)
            } else {
                0
            };
            let candidates = state.preemption_candidates(&request);

            let fit = (0..=candidates.len()).find(|&k| {
                let count = state.active.len() - k + ahead;
                state.has_free_slot(count, &candidates[..k])
            });

            if let Some(k) = fit {
                let mut victims_idx = candidates[..k].to_vec();
                victims_idx.sort_unstable_by(|a, b| b.cmp(a));
                let victims = victims_idx
                    .into_iter()
                    .map(|i| state.active.remove(i).user)
                    .collect();

                if let Some((resumable, i)) = queued {
                    state.queue_mut(resumable).remove(i);
                }
                state.insert_active(request);
                return (SlotDecision::Granted, victims);
            }
        }

        if !request.queueable {
            return (SlotDecision::Rejected, Vec::new());
        }
        if let Some((_, i)) = queued {
            return (SlotDecision::Queued(i + 1), Vec::new());
        }

        let capacity = state.queue_capacity(request.resumable);
        let queue = state.queue_mut(request.resumable);
        if queue.len() >= capacity {
            return (SlotDecision::Rejected, Vec::new());
        }
        queue.push_back(request);
        (SlotDecision::Queued(queue.len()), Vec::new())
    }

    /// Withdraws a waiting request, or finishes an active one.
    pub fn cancel_request(&self, id: u64) {
        {
            let mut state = self.lock();
            if let Some((resumable, i)) = state.queued_index(id) {
                state.queue_mut(resumable).remove(i);
                event!(Level::DEBUG, id, "Queued slot request cancelled");
                return;
            }
        }
        self.request_done(id);
    }

    /// Frees `id`'s slot, if it holds one, and resumes queued seed uploads.
    pub fn request_done(&self, id: u64) {
        let promoted = {
            let mut state = self.lock();
            if let Some(i) = state.active.iter().position(|r| r.id() == id) {
                state.active.remove(i);
                event!(Level::DEBUG, id, "Upload slot released");
            }
            state.promote_resumable()
        };
        for user in promoted {
            user.slot_available();
        }
    }

    pub fn update_limits(&self, limits: SlotLimits) {
        let promoted = {
            let mut state = self.lock();
            state.limits = limits;
            state.promote_resumable()
        };
        for user in promoted {
            user.slot_available();
        }
    }

    pub fn limits(&self) -> SlotLimits {
        self.lock().limits
    }

    /// 1-based position of `id` in whichever queue holds it.
    pub fn position_in_queue(&self, id: u64) -> Option<usize> {
        self.lock().queued_index(id).map(|(_, i)| i + 1)
    }

    pub fn is_active(&self, id: u64) -> bool {
        self.lock().is_active(id)
    }

    pub fn num_active(&self) -> usize {
        self.lock().active.len()
    }

    pub fn num_queued(&self) -> usize {
        let state = self.lock();
        state.http_queue.len() + state.seed_queue.len()
    }

    /// Active and queued requests from `host`.
    pub fn num_users_for_host(&self, host: IpAddr) -> usize {
        let state = self.lock();
        state
            .active
            .iter()
            .chain(state.http_queue.iter())
            .chain(state.seed_queue.iter())
            .filter(|r| r.user.host() == host)
            .count()
    }

    /// Sum of the active sessions' measured throughput.
    pub fn measured_bandwidth(&self) -> f64 {
        self.lock()
            .active
            .iter()
            .filter_map(|r| r.user.measured_bandwidth())
            .sum()
    }

    /// Would a new HTTP request be admitted right now?
    pub fn has_http_slot(&self) -> bool {
        let state = self.lock();
        if state
            .active
            .iter()
            .any(|r| r.priority > Priority::TransferMedium)
        {
            return false;
        }
        let candidates: Vec<usize> = (0..state.active.len())
            .filter(|&i| {
                let r = &state.active[i];
                r.preemptible && r.priority < Priority::TransferMedium
            })
            .collect();
        let count = state.active.len() - candidates.len() + state.http_queue.len();
        state.has_free_slot(count, &candidates)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::rngs::StdRng;
    use rand::{Rng, SeedableRng};
    use std::net::Ipv4Addr;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
    use std::sync::Weak;

    struct StubUser {
        id: u64,
        host: IpAddr,
        bandwidth: Mutex<Option<f64>>,
        released: AtomicBool,
        promoted: AtomicUsize,
    }

    impl StubUser {
        fn new(id: u64) -> Arc<Self> {
            Self::on_host(id, IpAddr::V4(Ipv4Addr::new(10, 0, 0, id as u8)))
        }

        fn on_host(id: u64, host: IpAddr) -> Arc<Self> {
            Arc::new(Self {
                id,
                host,
                bandwidth: Mutex::new(None),
                released: AtomicBool::new(false),
                promoted: AtomicUsize::new(0),
            })
        }

        fn set_bandwidth(&self, bw: f64) {
            *self.bandwidth.lock().unwrap() = Some(bw);
        }

        fn was_released(&self) -> bool {
            self.released.load(Ordering::SeqCst)
        }
    }

    impl SlotUser for StubUser {
        fn id(&self) -> u64 {
            self.id
        }
        fn host(&self) -> IpAddr {
            self.host
        }
        fn measured_bandwidth(&self) -> Option<f64> {
            *self.bandwidth.lock().unwrap()
        }
        fn release_slot(&self) {
            self.released.store(true, Ordering::SeqCst);
        }
        fn slot_available(&self) {
            self.promoted.fetch_add(1, Ordering::SeqCst);
        }
    }

    fn limits(hard_max: usize, soft_max: usize, queue: usize) -> SlotLimits {
        SlotLimits {
            hard_max,
            soft_max,
            http_queue_size: queue,
            seed_queue_size: queue,
            min_upload_speed_bps: 3072.0,
        }
    }

    fn http(user: &Arc<StubUser>) -> SlotRequest {
        SlotRequest::http(user.clone())
    }

    fn seed(user: &Arc<StubUser>, wanted: bool) -> SlotRequest {
        SlotRequest::seed(user.clone(), wanted)
    }

    #[test]
    fn test_decision_codes() {
        assert_eq!(SlotDecision::Granted.code(), 0);
        assert_eq!(SlotDecision::Queued(3).code(), 3);
        assert_eq!(SlotDecision::Rejected.code(), -1);
    }

    #[test]
    fn test_grants_until_soft_max_then_queues_slow_sessions() {
        let manager = UploadSlotManager::new(limits(4, 2, 5));
        let users: Vec<_> = (1..=3).map(StubUser::new).collect();

        assert_eq!(manager.request_slot(http(&users[0])), SlotDecision::Granted);
        assert_eq!(manager.request_slot(http(&users[1])), SlotDecision::Granted);
        assert_eq!(manager.request_slot(http(&users[2])), SlotDecision::Queued(1));
        assert_eq!(manager.num_active(), 2);
    }

    #[test]
    fn test_fast_session_opens_soft_band() {
        let manager = UploadSlotManager::new(limits(3, 1, 5));
        let fast = StubUser::new(1);
        let second = StubUser::new(2);
        let third = StubUser::new(3);

        assert_eq!(manager.request_slot(http(&fast)), SlotDecision::Granted);
        assert_eq!(manager.request_slot(http(&second)), SlotDecision::Queued(1));

        fast.set_bandwidth(10_000.0);
        assert_eq!(manager.request_slot(http(&second)), SlotDecision::Granted);
        assert_eq!(manager.position_in_queue(2), None);

        // Hard cap holds no matter how fast the sessions are.
        second.set_bandwidth(10_000.0);
        assert_eq!(manager.request_slot(http(&third)), SlotDecision::Granted);
        let fourth = StubUser::new(4);
        assert_eq!(manager.request_slot(http(&fourth)), SlotDecision::Queued(1));
        assert_eq!(manager.num_active(), 3);
    }

    #[test]
    fn test_repeated_request_from_active_user_is_granted_once() {
        let manager = UploadSlotManager::new(limits(2, 2, 2));
        let user = StubUser::new(1);
        assert_eq!(manager.request_slot(http(&user)), SlotDecision::Granted);
        assert_eq!(manager.request_slot(http(&user)), SlotDecision::Granted);
        assert_eq!(manager.num_active(), 1);
    }

    #[test]
    fn test_http_preempts_one_slow_seed_at_soft_max() {
        let manager = UploadSlotManager::new(limits(4, 2, 5));
        let seed_a = StubUser::new(1);
        let seed_b = StubUser::new(2);
        let web = StubUser::new(3);

        assert_eq!(manager.request_slot(seed(&seed_a, false)), SlotDecision::Granted);
        assert_eq!(manager.request_slot(seed(&seed_b, false)), SlotDecision::Granted);
        seed_a.set_bandwidth(100.0);
        seed_b.set_bandwidth(100.0);

        assert_eq!(manager.request_slot(http(&web)), SlotDecision::Granted);
        // The most recently admitted seed goes first.
        assert!(!seed_a.was_released());
        assert!(seed_b.was_released());
        assert_eq!(manager.num_active(), 2);
        assert!(manager.is_active(1));
        assert!(manager.is_active(3));
    }

    #[test]
    fn test_http_never_preempted_by_seed() {
        let manager = UploadSlotManager::new(limits(2, 1, 5));
        let web = StubUser::new(1);
        let seeder = StubUser::new(2);

        assert_eq!(manager.request_slot(http(&web)), SlotDecision::Granted);
        assert_eq!(manager.request_slot(seed(&seeder, true)), SlotDecision::Rejected);
        assert!(!web.was_released());
    }

    #[test]
    fn test_wanted_seed_preempts_idle_seed_and_blocks_lower_priorities() {
        let manager = UploadSlotManager::new(limits(1, 1, 5));
        let idle = StubUser::new(1);
        let wanted = StubUser::new(2);
        let web = StubUser::new(3);

        assert_eq!(manager.request_slot(seed(&idle, false)), SlotDecision::Granted);
        assert_eq!(manager.request_slot(seed(&wanted, true)), SlotDecision::Granted);
        assert!(idle.was_released());

        // A higher-priority session is active, so this can only queue.
        assert_eq!(manager.request_slot(http(&web)), SlotDecision::Queued(1));
        assert!(!manager.has_http_slot());
    }

    #[test]
    fn test_http_queue_capacity_rejects_overflow() {
        let manager = UploadSlotManager::new(limits(1, 1, 2));
        let holder = StubUser::new(1);
        assert_eq!(manager.request_slot(http(&holder)), SlotDecision::Granted);

        let waiting: Vec<_> = (2..=4).map(StubUser::new).collect();
        assert_eq!(manager.request_slot(http(&waiting[0])), SlotDecision::Queued(1));
        assert_eq!(manager.request_slot(http(&waiting[1])), SlotDecision::Queued(2));
        assert_eq!(manager.request_slot(http(&waiting[2])), SlotDecision::Rejected);
        assert_eq!(manager.num_queued(), 2);
    }

    #[test]
    fn test_queued_http_must_poll_and_waits_its_turn() {
        let manager = UploadSlotManager::new(limits(1, 1, 5));
        let holder = StubUser::new(1);
        let first = StubUser::new(2);
        let second = StubUser::new(3);

        manager.request_slot(http(&holder));
        assert_eq!(manager.request_slot(http(&first)), SlotDecision::Queued(1));
        assert_eq!(manager.request_slot(http(&second)), SlotDecision::Queued(2));

        manager.request_done(1);
        // HTTP waiters are not promoted; the one behind still waits for the head.
        assert_eq!(first.promoted.load(Ordering::SeqCst), 0);
        assert_eq!(manager.request_slot(http(&second)), SlotDecision::Queued(2));
        assert_eq!(manager.request_slot(http(&first)), SlotDecision::Granted);
        assert_eq!(manager.request_slot(http(&second)), SlotDecision::Queued(1));
    }

    #[test]
    fn test_queue_positions_only_move_forward() {
        let manager = UploadSlotManager::new(limits(1, 1, 10));
        let holder = StubUser::new(100);
        manager.request_slot(http(&holder));

        let waiters: Vec<_> = (1..=5).map(StubUser::new).collect();
        for user in &waiters {
            manager.request_slot(http(user));
        }
        let last = waiters.last().unwrap().clone();

        let mut positions = vec![manager.request_slot(http(&last)).code()];
        manager.cancel_request(100);
        for user in &waiters[..4] {
            assert_eq!(manager.request_slot(http(user)), SlotDecision::Granted);
            positions.push(manager.request_slot(http(&last)).code());
            manager.request_done(user.id);
            positions.push(manager.request_slot(http(&last)).code());
        }

        assert_eq!(*positions.last().unwrap(), 0);
        assert!(positions.windows(2).all(|w| w[1] == 0 || w[1] <= w[0]));
    }

    #[test]
    fn test_request_done_promotes_queued_seeds_in_order() {
        let manager = UploadSlotManager::new(limits(1, 1, 5));
        let holder = StubUser::new(1);
        let first = StubUser::new(2);
        let second = StubUser::new(3);

        assert_eq!(manager.request_slot(http(&holder)), SlotDecision::Granted);
        assert_eq!(manager.request_slot(seed(&first, false)), SlotDecision::Queued(1));
        assert_eq!(manager.request_slot(seed(&second, false)), SlotDecision::Queued(2));

        manager.request_done(1);
        assert_eq!(first.promoted.load(Ordering::SeqCst), 1);
        assert_eq!(second.promoted.load(Ordering::SeqCst), 0);
        assert!(manager.is_active(2));
        assert_eq!(manager.position_in_queue(3), Some(1));

        manager.request_done(2);
        assert!(manager.is_active(3));
        assert_eq!(manager.num_queued(), 0);
    }

    #[test]
    fn test_raising_limits_promotes_seeds() {
        let manager = UploadSlotManager::new(limits(1, 1, 5));
        let holder = StubUser::new(1);
        let waiting = StubUser::new(2);
        manager.request_slot(seed(&holder, false));
        assert_eq!(manager.request_slot(seed(&waiting, false)), SlotDecision::Queued(1));

        manager.update_limits(limits(2, 2, 5));
        assert!(manager.is_active(2));
        assert_eq!(waiting.promoted.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_cancel_removes_queued_entry_without_touching_active() {
        let manager = UploadSlotManager::new(limits(1, 1, 5));
        let holder = StubUser::new(1);
        let waiting = StubUser::new(2);
        manager.request_slot(http(&holder));
        manager.request_slot(http(&waiting));

        manager.cancel_request(2);
        assert_eq!(manager.num_queued(), 0);
        assert!(manager.is_active(1));

        manager.cancel_request(1);
        assert_eq!(manager.num_active(), 0);
    }

    #[test]
    fn test_counts_users_per_host_and_total_bandwidth() {
        let host = IpAddr::V4(Ipv4Addr::new(192, 168, 1, 9));
        let manager = UploadSlotManager::new(limits(1, 1, 5));
        let a = StubUser::on_host(1, host);
        let b = StubUser::on_host(2, host);
        let other = StubUser::new(3);
        a.set_bandwidth(2048.0);

        manager.request_slot(http(&a));
        manager.request_slot(http(&b));
        manager.request_slot(http(&other));

        assert_eq!(manager.num_users_for_host(host), 2);
        assert_eq!(manager.measured_bandwidth(), 2048.0);
    }

    struct ReentrantUser {
        id: u64,
        manager: Weak<UploadSlotManager>,
    }

    impl SlotUser for ReentrantUser {
        fn id(&self) -> u64 {
            self.id
        }
        fn host(&self) -> IpAddr {
            IpAddr::V4(Ipv4Addr::LOCALHOST)
        }
        fn measured_bandwidth(&self) -> Option<f64> {
            None
        }
        fn release_slot(&self) {
            // Would deadlock if callbacks ran under the manager's lock.
            if let Some(manager) = self.manager.upgrade() {
                let _ = manager.num_active();
            }
        }
    }

    #[test]
    fn test_preemption_callback_may_reenter_manager() {
        let manager = Arc::new(UploadSlotManager::new(limits(1, 1, 5)));
        let idle = Arc::new(ReentrantUser {
            id: 1,
            manager: Arc::downgrade(&manager),
        });
        let wanted = StubUser::new(2);

        assert_eq!(
            manager.request_slot(SlotRequest::seed(idle, false)),
            SlotDecision::Granted
        );
        assert_eq!(manager.request_slot(seed(&wanted, true)), SlotDecision::Granted);
    }

    #[test]
    fn test_random_workload_respects_capacity_and_priority() {
        let mut rng = StdRng::seed_from_u64(0x5eed);
        let manager = UploadSlotManager::new(limits(4, 2, 3));
        let users: Vec<_> = (1..=12).map(StubUser::new).collect();

        for _ in 0..2000 {
            let user = &users[rng.random_range(0..users.len())];
            if rng.random_bool(0.3) {
                user.set_bandwidth(rng.random_range(0.0..8000.0));
            }
            let request = match rng.random_range(0..4) {
                0 => Some(http(user)),
                1 => Some(seed(user, rng.random_bool(0.3))),
                2 => {
                    manager.request_done(user.id);
                    None
                }
                _ => {
                    manager.cancel_request(user.id);
                    None
                }
            };
            if let Some(request) = request {
                let (was_active, active_before) = {
                    let state = manager.lock();
                    let priorities: Vec<Priority> =
                        state.active.iter().map(|r| r.priority).collect();
                    (state.is_active(user.id), priorities)
                };
                let priority = request.priority();
                if manager.request_slot(request) == SlotDecision::Granted && !was_active {
                    // Nothing is admitted past a higher-priority session.
                    assert!(
                        active_before.iter().all(|&p| p <= priority),
                        "{:?} admitted over {:?}",
                        priority,
                        active_before
                    );
                    assert!(manager.is_active(user.id));
                }
            }

            let state = manager.lock();
            assert!(state.active.len() <= 4);
            // Ordered by descending priority.
            assert!(state
                .active
                .windows(2)
                .all(|w| w[0].priority >= w[1].priority));
            for request in state.http_queue.iter().chain(state.seed_queue.iter()) {
                assert!(!state.is_active(request.id()));
            }
        }
    }
}
