// SPDX-FileCopyrightText: 2025 The seedgate Contributors
// SPDX-License-Identifier: GPL-3.0-or-later

use crate::errors::ConfigError;

use directories::ProjectDirs;
use serde::{Deserialize, Serialize};

use std::fs;
use std::path::PathBuf;
use std::time::Duration;

use tracing::{event, Level};

const SETTINGS_FILE_NAME: &str = "settings.toml";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Settings {
    pub client_id: String,
    pub client_port: u16,
    pub shared_files: Vec<PathBuf>,
    pub allow_partial_sharing: bool,
    /// Serve plain browsers instead of answering them with the freeloader page.
    pub allow_browser: bool,
    pub update_file: Option<PathBuf>,
    pub max_connections: usize,
    pub disk_read_permits: usize,
    /// Global upload rate in bytes per second. Zero disables throttling.
    pub upload_limit_bps: u64,
    pub upload: UploadSettings,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            client_id: String::new(),
            client_port: 6346,
            shared_files: Vec::new(),
            allow_partial_sharing: true,
            allow_browser: false,
            update_file: None,
            max_connections: 64,
            disk_read_permits: 8,
            upload_limit_bps: 0,
            upload: UploadSettings::default(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct UploadSettings {
    pub hard_max_uploads: usize,
    pub soft_max_uploads: usize,
    pub http_queue_size: usize,
    pub seed_queue_size: usize,
    pub uploads_per_person: usize,
    pub min_upload_speed_bps: u64,
    pub stall_timeout_secs: u64,
    pub piece_buffer_size: usize,
    pub piece_max_buffers: usize,
    pub min_poll_secs: u64,
    pub max_poll_secs: u64,
    pub keep_alive_secs: u64,
}

impl Default for UploadSettings {
    fn default() -> Self {
        Self {
            hard_max_uploads: 20,
            soft_max_uploads: 5,
            http_queue_size: 10,
            seed_queue_size: 10,
            uploads_per_person: 3,
            min_upload_speed_bps: 3 * 1024,
            stall_timeout_secs: 120,
            piece_buffer_size: 8 * 1024,
            piece_max_buffers: 3,
            min_poll_secs: 45,
            max_poll_secs: 120,
            keep_alive_secs: 15,
        }
    }
}

impl UploadSettings {
    pub fn stall_timeout(&self) -> Duration {
        Duration::from_secs(self.stall_timeout_secs)
    }

    pub fn min_poll(&self) -> Duration {
        Duration::from_secs(self.min_poll_secs)
    }

    pub fn max_poll(&self) -> Duration {
        Duration::from_secs(self.max_poll_secs)
    }

    pub fn keep_alive(&self) -> Duration {
        Duration::from_secs(self.keep_alive_secs)
    }
}

/// Returns `(config_dir, data_dir)` for this platform.
pub fn get_app_paths() -> Option<(PathBuf, PathBuf)> {
    let dirs = ProjectDirs::from("org", "seedgate", "seedgate")?;
    Some((
        dirs.config_dir().to_path_buf(),
        dirs.data_local_dir().to_path_buf(),
    ))
}

pub fn settings_path() -> Result<PathBuf, ConfigError> {
    let (config_dir, _) = get_app_paths().ok_or(ConfigError::NoConfigDir)?;
    Ok(config_dir.join(SETTINGS_FILE_NAME))
}

pub fn parse_settings(content: &str) -> Result<Settings, ConfigError> {
    Ok(toml::from_str(content)?)
}

/// Loads settings from disk, falling back to defaults if the file is missing
/// or cannot be parsed.
pub fn load_settings() -> Settings {
    let path = match settings_path() {
        Ok(path) => path,
        Err(e) => {
            event!(Level::WARN, error = %e, "Using default settings");
            return Settings::default();
        }
    };

    match fs::read_to_string(&path) {
        Ok(content) => match parse_settings(&content) {
            Ok(settings) => settings,
            Err(e) => {
                event!(Level::ERROR, path = ?path, error = %e, "Invalid settings file, using defaults");
                Settings::default()
            }
        },
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Settings::default(),
        Err(e) => {
            event!(Level::ERROR, path = ?path, error = %e, "Could not read settings file, using defaults");
            Settings::default()
        }
    }
}

/// Settings read back from disk while running. The listening port and the
/// client id stay as they were; `None` if nothing else changed.
pub fn reloaded_settings(current: &Settings, mut reloaded: Settings) -> Option<Settings> {
    reloaded.client_port = current.client_port;
    reloaded.client_id.clone_from(&current.client_id);
    (reloaded != *current).then_some(reloaded)
}

pub fn save_settings(settings: &Settings) -> Result<(), ConfigError> {
    let path = settings_path()?;
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)?;
    }
    let content = toml::to_string_pretty(settings)?;
    fs::write(&path, content)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_settings_round_trip_through_toml() {
        let mut settings = Settings::default();
        settings.shared_files.push(PathBuf::from("/srv/share/a.bin"));
        settings.upload.hard_max_uploads = 7;

        let text = toml::to_string_pretty(&settings).unwrap();
        let parsed = parse_settings(&text).unwrap();
        assert_eq!(parsed, settings);
    }

    #[test]
    fn test_partial_file_fills_in_defaults() {
        let parsed = parse_settings("client_port = 7000\n[upload]\nsoft_max_uploads = 2\n").unwrap();
        assert_eq!(parsed.client_port, 7000);
        assert_eq!(parsed.upload.soft_max_uploads, 2);
        assert_eq!(parsed.upload.hard_max_uploads, 20);
        assert_eq!(parsed.upload.piece_max_buffers, 3);
        assert_eq!(parsed.upload.stall_timeout(), Duration::from_secs(120));
    }

    #[test]
    fn test_garbage_is_a_parse_error() {
        assert!(matches!(
            parse_settings("client_port = \"not a number\""),
            Err(ConfigError::Parse(_))
        ));
    }

    #[test]
    fn test_reload_keeps_port_and_client_id() {
        let mut current = Settings::default();
        current.client_port = 7000;
        current.client_id = "-SG0100-abcdefghijkl".to_string();

        let mut on_disk = Settings::default();
        assert_eq!(reloaded_settings(&current, on_disk.clone()), None);

        on_disk.upload.hard_max_uploads = 40;
        on_disk.client_port = 6346;
        let applied = reloaded_settings(&current, on_disk).unwrap();
        assert_eq!(applied.upload.hard_max_uploads, 40);
        assert_eq!(applied.client_port, 7000);
        assert_eq!(applied.client_id, current.client_id);
    }
}
