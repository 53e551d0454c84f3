// SPDX-FileCopyrightText: 2025 The seedgate Contributors
// SPDX-License-Identifier: GPL-3.0-or-later

use std::sync::atomic::{AtomicU64, Ordering};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum UploadStat {
    Attempted,
    Completed,
    Interrupted,
    Stalled,
    Queued,
    LimitReached,
    Banned,
    Freeloader,
    FileNotFound,
    Malformed,
    TraditionalGet,
    UrnGet,
    UnknownUrnGet,
    ThexServed,
    BrowseHost,
    PushProxy,
    UpdateFile,
    Preempted,
    BytesUploaded,
}

impl UploadStat {
    pub const ALL: [UploadStat; 19] = [
        UploadStat::Attempted,
        UploadStat::Completed,
        UploadStat::Interrupted,
        UploadStat::Stalled,
        UploadStat::Queued,
        UploadStat::LimitReached,
        UploadStat::Banned,
        UploadStat::Freeloader,
        UploadStat::FileNotFound,
        UploadStat::Malformed,
        UploadStat::TraditionalGet,
        UploadStat::UrnGet,
        UploadStat::UnknownUrnGet,
        UploadStat::ThexServed,
        UploadStat::BrowseHost,
        UploadStat::PushProxy,
        UploadStat::UpdateFile,
        UploadStat::Preempted,
        UploadStat::BytesUploaded,
    ];

    pub fn name(self) -> &'static str {
        match self {
            UploadStat::Attempted => "attempted",
            UploadStat::Completed => "completed",
            UploadStat::Interrupted => "interrupted",
            UploadStat::Stalled => "stalled",
            UploadStat::Queued => "queued",
            UploadStat::LimitReached => "limit_reached",
            UploadStat::Banned => "banned",
            UploadStat::Freeloader => "freeloader",
            UploadStat::FileNotFound => "file_not_found",
            UploadStat::Malformed => "malformed",
            UploadStat::TraditionalGet => "traditional_get",
            UploadStat::UrnGet => "urn_get",
            UploadStat::UnknownUrnGet => "unknown_urn_get",
            UploadStat::ThexServed => "thex_served",
            UploadStat::BrowseHost => "browse_host",
            UploadStat::PushProxy => "push_proxy",
            UploadStat::UpdateFile => "update_file",
            UploadStat::Preempted => "preempted",
            UploadStat::BytesUploaded => "bytes_uploaded",
        }
    }

    fn slot(self) -> usize {
        self as usize
    }
}

/// Receives upload events. Injected wherever events originate.
pub trait StatsSink: Send + Sync {
    fn increment(&self, stat: UploadStat) {
        self.add_data(stat, 1);
    }

    fn add_data(&self, stat: UploadStat, amount: u64);
}

#[derive(Debug, Default)]
pub struct UploadStats {
    counters: [AtomicU64; UploadStat::ALL.len()],
}

impl UploadStats {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, stat: UploadStat) -> u64 {
        self.counters[stat.slot()].load(Ordering::Relaxed)
    }

    /// Non-zero counters, for the shutdown summary.
    pub fn snapshot(&self) -> Vec<(&'static str, u64)> {
        UploadStat::ALL
            .iter()
            .map(|&stat| (stat.name(), self.get(stat)))
            .filter(|&(_, value)| value > 0)
            .collect()
    }
}

impl StatsSink for UploadStats {
    fn add_data(&self, stat: UploadStat, amount: u64) {
        self.counters[stat.slot()].fetch_add(amount, Ordering::Relaxed);
    }
}
