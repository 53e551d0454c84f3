// SPDX-FileCopyrightText: 2025 The seedgate Contributors
// SPDX-License-Identifier: GPL-3.0-or-later

use crate::storage::Sha1Urn;

use std::collections::{HashMap, HashSet};
use std::net::IpAddr;
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;

use tokio::time::Instant;

/// Hosts are not judged until they have been around this long.
const FIRST_CHECK_TIME: Duration = Duration::from_secs(30);
/// Averaging less than this between requests counts as hammering.
const MIN_REQUEST_INTERVAL: Duration = Duration::from_secs(5);
const IDLE_EXPIRY: Duration = Duration::from_secs(10 * 60);

#[derive(Debug)]
struct HostRecord {
    first_request: Instant,
    last_request: Instant,
    num_requests: u32,
    active_uploads: HashSet<Sha1Urn>,
}

impl HostRecord {
    fn new(now: Instant) -> Self {
        Self {
            first_request: now,
            last_request: now,
            num_requests: 0,
            active_uploads: HashSet::new(),
        }
    }

    fn is_hammering(&self) -> bool {
        let span = self.last_request.duration_since(self.first_request);
        if span <= FIRST_CHECK_TIME {
            return false;
        }
        span / self.num_requests.max(1) < MIN_REQUEST_INTERVAL
    }
}

/// Per-host request history used to turn away abusive peers.
#[derive(Debug, Default)]
pub struct RequestCache {
    hosts: Mutex<HashMap<IpAddr, HostRecord>>,
}

impl RequestCache {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<IpAddr, HostRecord>> {
        match self.hosts.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    /// Records a request from `host` and reports whether the host is now
    /// hammering us.
    pub fn count_request(&self, host: IpAddr) -> bool {
        let now = Instant::now();
        let mut hosts = self.lock();
        hosts.retain(|_, record| {
            !record.active_uploads.is_empty()
                || now.duration_since(record.last_request) < IDLE_EXPIRY
        });

        let record = hosts.entry(host).or_insert_with(|| HostRecord::new(now));
        record.num_requests += 1;
        record.last_request = now;
        record.is_hammering()
    }

    /// True if `host` is already uploading `urn` on another connection.
    pub fn is_dupe(&self, host: IpAddr, urn: &Sha1Urn) -> bool {
        self.lock()
            .get(&host)
            .is_some_and(|record| record.active_uploads.contains(urn))
    }

    pub fn started_upload(&self, host: IpAddr, urn: Sha1Urn) {
        let now = Instant::now();
        self.lock()
            .entry(host)
            .or_insert_with(|| HostRecord::new(now))
            .active_uploads
            .insert(urn);
    }

    pub fn upload_done(&self, host: IpAddr, urn: &Sha1Urn) {
        if let Some(record) = self.lock().get_mut(&host) {
            record.active_uploads.remove(urn);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::Ipv4Addr;

    fn host(n: u8) -> IpAddr {
        IpAddr::V4(Ipv4Addr::new(172, 16, 0, n))
    }

    #[tokio::test]
    async fn test_hammering_needs_history_and_frequency() {
        tokio::time::pause();
        let cache = RequestCache::new();

        // A burst inside the grace period is tolerated.
        for _ in 0..20 {
            assert!(!cache.count_request(host(1)));
            tokio::time::advance(Duration::from_secs(1)).await;
        }
        // 31 s across 21 requests averages well under 5 s.
        tokio::time::advance(Duration::from_secs(11)).await;
        assert!(cache.count_request(host(1)));
    }

    #[tokio::test]
    async fn test_patient_host_is_not_hammering() {
        tokio::time::pause();
        let cache = RequestCache::new();
        for _ in 0..10 {
            assert!(!cache.count_request(host(2)));
            tokio::time::advance(Duration::from_secs(60)).await;
        }
    }

    #[tokio::test]
    async fn test_duplicate_upload_detection() {
        let cache = RequestCache::new();
        let urn = Sha1Urn::of_bytes(b"song");
        cache.count_request(host(3));
        assert!(!cache.is_dupe(host(3), &urn));

        cache.started_upload(host(3), urn);
        assert!(cache.is_dupe(host(3), &urn));
        assert!(!cache.is_dupe(host(4), &urn));

        cache.upload_done(host(3), &urn);
        assert!(!cache.is_dupe(host(3), &urn));
    }

    #[tokio::test]
    async fn test_idle_hosts_are_pruned() {
        tokio::time::pause();
        let cache = RequestCache::new();
        let urn = Sha1Urn::of_bytes(b"long transfer");
        cache.count_request(host(5));
        cache.count_request(host(6));
        cache.started_upload(host(6), urn);

        tokio::time::advance(IDLE_EXPIRY + Duration::from_secs(1)).await;
        cache.count_request(host(7));
        // host 6 still has an upload running and is kept.
        assert_eq!(cache.lock().len(), 2);
        assert!(!cache.lock().contains_key(&host(5)));
        assert!(cache.is_dupe(host(6), &urn));
    }
}
