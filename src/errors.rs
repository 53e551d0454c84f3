// SPDX-FileCopyrightText: 2025 The seedgate Contributors
// SPDX-License-Identifier: GPL-3.0-or-later

use thiserror::Error;

#[derive(Error, Debug)]
pub enum StorageError {
    #[error("An I/O error occurred")]
    Io(#[from] std::io::Error),

    #[error("Shared path is not a regular file: {0}")]
    NotAFile(std::path::PathBuf),
}

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Could not resolve the configuration directory")]
    NoConfigDir,

    #[error("Failed to access settings file")]
    Io(#[from] std::io::Error),

    #[error("Failed to parse settings file")]
    Parse(#[from] toml::de::Error),

    #[error("Failed to serialize settings")]
    Serialize(#[from] toml::ser::Error),
}

#[derive(Error, Debug)]
pub enum RequestError {
    #[error("Failed to read request")]
    Io(#[from] std::io::Error),

    #[error("Malformed request line: {0}")]
    RequestLine(String),

    #[error("Unsupported method: {0}")]
    Method(String),

    #[error("Malformed header line")]
    Header,

    #[error("Request head exceeds the allowed size")]
    TooLarge,

    #[error("Connection closed in the middle of a request head")]
    Truncated,

    #[error("Malformed request target: {0}")]
    Target(String),

    #[error("Malformed range header: {0}")]
    Range(String),
}

#[derive(Error, Debug)]
pub enum UploadError {
    #[error("Network write failed")]
    Io(#[from] std::io::Error),

    #[error("Transfer stalled and was closed by the watchdog")]
    Stalled,

    #[error("Reading the shared file failed: {0}")]
    ReadFailed(String),

    #[error("Upload slot was revoked by the scheduler")]
    Preempted,

    #[error("Piece reader shut down before the range was delivered")]
    ReaderShutdown,
}
