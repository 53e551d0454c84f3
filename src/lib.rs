// SPDX-FileCopyrightText: 2025 The seedgate Contributors
// SPDX-License-Identifier: GPL-3.0-or-later

//! Upload serving core: slot admission and preemption, throttled in-order
//! file streaming and the HTTP front end that drives it.
//!
//! The `seedgate` binary serves the shared library over HTTP. Swarm code that
//! seeds over other protocols takes its slots from the same scheduler through
//! [`upload::UploadManager::new_seed_uploader`].

pub mod altloc;
pub mod config;
pub mod errors;
pub mod http;
pub mod resource_manager;
pub mod server;
pub mod stats;
pub mod storage;
pub mod throttle;
pub mod upload;
