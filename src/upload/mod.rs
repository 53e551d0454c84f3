// SPDX-FileCopyrightText: 2025 The seedgate Contributors
// SPDX-License-Identifier: GPL-3.0-or-later

pub mod manager;
pub mod piece_reader;
pub mod request;
pub mod request_cache;
pub mod response;
pub mod seed;
pub mod session;
pub mod slot_manager;
pub mod speed;
pub mod watchdog;

pub use manager::{NoPushRouting, PushRouter, UploadManager};
pub use session::HttpUploader;

use std::fmt;

/// Where one request on an upload connection currently stands.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum UploadState {
    Connecting,
    Queued,
    Uploading,
    ThexRequest,
    LimitReached,
    UnavailableRange,
    FileNotFound,
    MalformedRequest,
    Banned,
    Freeloader,
    BrowseHost,
    PushProxy,
    UpdateFile,
    Complete,
    Interrupted,
}

impl UploadState {
    /// States that move file data.
    pub fn is_transfer(self) -> bool {
        matches!(self, UploadState::Uploading | UploadState::ThexRequest)
    }
}

impl fmt::Display for UploadState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            UploadState::Connecting => "connecting",
            UploadState::Queued => "queued",
            UploadState::Uploading => "uploading",
            UploadState::ThexRequest => "thex",
            UploadState::LimitReached => "limit reached",
            UploadState::UnavailableRange => "unavailable range",
            UploadState::FileNotFound => "file not found",
            UploadState::MalformedRequest => "malformed request",
            UploadState::Banned => "banned",
            UploadState::Freeloader => "freeloader",
            UploadState::BrowseHost => "browse host",
            UploadState::PushProxy => "push proxy",
            UploadState::UpdateFile => "update file",
            UploadState::Complete => "complete",
            UploadState::Interrupted => "interrupted",
        };
        f.write_str(name)
    }
}
