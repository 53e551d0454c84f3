// SPDX-FileCopyrightText: 2025 The seedgate Contributors
// SPDX-License-Identifier: GPL-3.0-or-later

//! Reads a region of a shared file with a few reads in flight at once and
//! hands the pieces out strictly in offset order.

use crate::config::UploadSettings;
use crate::resource_manager::ResourceManagerClient;
use crate::storage;

use std::cmp::Ordering;
use std::collections::BinaryHeap;
use std::fs::File;
use std::io;
use std::sync::{Arc, Mutex, MutexGuard, Weak};

use tokio::sync::Notify;
use tracing::{event, Level};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PieceReaderConfig {
    pub buffer_size: usize,
    pub max_buffers: usize,
}

impl Default for PieceReaderConfig {
    fn default() -> Self {
        Self {
            buffer_size: 8 * 1024,
            max_buffers: 3,
        }
    }
}

impl From<&UploadSettings> for PieceReaderConfig {
    fn from(settings: &UploadSettings) -> Self {
        Self {
            buffer_size: settings.piece_buffer_size.max(1),
            max_buffers: settings.piece_max_buffers.max(1),
        }
    }
}

#[derive(Debug)]
pub struct Piece {
    offset: u64,
    buffer: Vec<u8>,
}

impl Piece {
    pub fn offset(&self) -> u64 {
        self.offset
    }

    pub fn data(&self) -> &[u8] {
        &self.buffer
    }

    pub fn len(&self) -> usize {
        self.buffer.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buffer.is_empty()
    }
}

// Min-heap order on offset.
struct HeapEntry(Piece);

impl PartialEq for HeapEntry {
    fn eq(&self, other: &Self) -> bool {
        self.0.offset == other.0.offset
    }
}

impl Eq for HeapEntry {}

impl PartialOrd for HeapEntry {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for HeapEntry {
    fn cmp(&self, other: &Self) -> Ordering {
        other.0.offset.cmp(&self.0.offset)
    }
}

/// Told when the next contiguous piece is ready or the reader gave up.
pub trait PieceListener: Send + Sync {
    fn data_available(&self);
    fn read_failed(&self, error: &io::Error);
}

/// Where read jobs run.
pub trait ReadExecutor: Send + Sync {
    fn submit(&self, job: PieceReaderJob);
}

/// One positioned read of `buffer.len()` bytes at `offset`.
pub struct PieceReaderJob {
    reader: Weak<ReaderShared>,
    file: Arc<File>,
    offset: u64,
    buffer: Vec<u8>,
}

impl PieceReaderJob {
    pub fn offset(&self) -> u64 {
        self.offset
    }

    /// Performs the read on the current thread. Blocks.
    pub fn run(mut self) {
        let result = storage::read_at(&self.file, self.offset, &mut self.buffer);
        self.finish(result);
    }

    pub fn fail(self, error: io::Error) {
        self.finish(Err(error));
    }

    fn finish(self, result: io::Result<()>) {
        let Some(reader) = self.reader.upgrade() else {
            return;
        };
        match result {
            Ok(()) => reader.complete(Piece {
                offset: self.offset,
                buffer: self.buffer,
            }),
            Err(e) => reader.fail(e),
        }
    }
}

/// Runs each job on the blocking pool once a disk-read permit is available.
pub struct DiskReadExecutor {
    resources: ResourceManagerClient,
}

impl DiskReadExecutor {
    pub fn new(resources: ResourceManagerClient) -> Self {
        Self { resources }
    }
}

impl ReadExecutor for DiskReadExecutor {
    fn submit(&self, job: PieceReaderJob) {
        let resources = self.resources.clone();
        tokio::spawn(async move {
            let permit = match resources.acquire_disk_read().await {
                Ok(permit) => permit,
                Err(e) => {
                    job.fail(io::Error::other(e));
                    return;
                }
            };
            if let Err(e) = tokio::task::spawn_blocking(move || job.run()).await {
                event!(Level::ERROR, error = %e, "Disk read task panicked");
            }
            drop(permit);
        });
    }
}

/// [`PieceListener`] for an async consumer.
#[derive(Debug, Default)]
pub struct ReaderSignal {
    notify: Notify,
    error: Mutex<Option<String>>,
}

impl ReaderSignal {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub async fn wait(&self) {
        self.notify.notified().await;
    }

    pub fn take_error(&self) -> Option<String> {
        match self.error.lock() {
            Ok(mut guard) => guard.take(),
            Err(poisoned) => poisoned.into_inner().take(),
        }
    }
}

impl PieceListener for ReaderSignal {
    fn data_available(&self) {
        self.notify.notify_one();
    }

    fn read_failed(&self, error: &io::Error) {
        match self.error.lock() {
            Ok(mut guard) => *guard = Some(error.to_string()),
            Err(poisoned) => *poisoned.into_inner() = Some(error.to_string()),
        }
        self.notify.notify_one();
    }
}

struct ReaderState {
    read_offset: u64,
    processing_offset: u64,
    remaining: u64,
    outstanding: usize,
    completed: BinaryHeap<HeapEntry>,
    spare: Vec<Vec<u8>>,
    started: bool,
    suspended: bool,
    shutdown: bool,
}

struct ReaderShared {
    state: Mutex<ReaderState>,
    file: Arc<File>,
    config: PieceReaderConfig,
    executor: Arc<dyn ReadExecutor>,
    listener: Arc<dyn PieceListener>,
}

impl ReaderShared {
    fn lock(&self) -> MutexGuard<'_, ReaderState> {
        match self.state.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    fn spawn_jobs(self: &Arc<Self>) {
        let jobs = {
            let mut state = self.lock();
            let mut jobs = Vec::new();
            if !state.started || state.suspended || state.shutdown {
                return;
            }
            while state.remaining > 0 && state.outstanding < self.config.max_buffers {
                let len = state.remaining.min(self.config.buffer_size as u64) as usize;
                let mut buffer = state.spare.pop().unwrap_or_default();
                buffer.resize(len, 0);

                jobs.push(PieceReaderJob {
                    reader: Arc::downgrade(self),
                    file: self.file.clone(),
                    offset: state.processing_offset,
                    buffer,
                });
                state.outstanding += 1;
                state.processing_offset += len as u64;
                state.remaining -= len as u64;
            }
            jobs
        };
        // The executor may run a job inline, which re-enters `complete`.
        for job in jobs {
            self.executor.submit(job);
        }
    }

    fn complete(&self, piece: Piece) {
        let ready = {
            let mut state = self.lock();
            if state.shutdown {
                return;
            }
            let ready = piece.offset == state.read_offset;
            state.completed.push(HeapEntry(piece));
            ready
        };
        if ready {
            self.listener.data_available();
        }
    }

    fn fail(&self, error: io::Error) {
        {
            let mut state = self.lock();
            if state.shutdown {
                return;
            }
            state.shutdown = true;
            state.completed.clear();
        }
        event!(Level::ERROR, error = %error, "Piece read failed");
        self.listener.read_failed(&error);
    }
}

pub struct FilePieceReader {
    shared: Arc<ReaderShared>,
}

impl FilePieceReader {
    /// Prepares to read `length` bytes from `offset`. No I/O happens until
    /// [`start`](Self::start).
    pub fn new(
        file: Arc<File>,
        offset: u64,
        length: u64,
        config: PieceReaderConfig,
        executor: Arc<dyn ReadExecutor>,
        listener: Arc<dyn PieceListener>,
    ) -> Self {
        let state = ReaderState {
            read_offset: offset,
            processing_offset: offset,
            remaining: length,
            outstanding: 0,
            completed: BinaryHeap::with_capacity(config.max_buffers),
            spare: Vec::new(),
            started: false,
            suspended: false,
            shutdown: false,
        };
        Self {
            shared: Arc::new(ReaderShared {
                state: Mutex::new(state),
                file,
                config,
                executor,
                listener,
            }),
        }
    }

    pub fn start(&self) {
        self.shared.lock().started = true;
        self.shared.spawn_jobs();
    }

    /// True if the piece at the current read offset is buffered.
    pub fn has_next(&self) -> bool {
        let state = self.shared.lock();
        state
            .completed
            .peek()
            .is_some_and(|entry| entry.0.offset == state.read_offset)
    }

    pub fn next(&self) -> Option<Piece> {
        let mut state = self.shared.lock();
        let read_offset = state.read_offset;
        match state.completed.peek() {
            Some(entry) if entry.0.offset == read_offset => {}
            _ => return None,
        }
        let piece = state.completed.pop()?.0;
        state.read_offset += piece.len() as u64;
        Some(piece)
    }

    /// Hands a consumed piece's buffer back and lets the next read start.
    pub fn release(&self, piece: Piece) {
        {
            let mut state = self.shared.lock();
            state.outstanding = state.outstanding.saturating_sub(1);
            if !state.shutdown {
                state.spare.push(piece.buffer);
            }
        }
        self.shared.spawn_jobs();
    }

    pub fn suspend(&self) {
        self.shared.lock().suspended = true;
    }

    pub fn resume(&self) {
        self.shared.lock().suspended = false;
        self.shared.spawn_jobs();
    }

    pub fn shutdown(&self) {
        let mut state = self.shared.lock();
        state.shutdown = true;
        state.completed.clear();
        state.spare.clear();
    }

    pub fn is_shutdown(&self) -> bool {
        self.shared.lock().shutdown
    }

    /// Every byte has been handed to the consumer.
    pub fn is_finished(&self) -> bool {
        let state = self.shared.lock();
        state.remaining == 0 && state.completed.is_empty() && state.outstanding == 0
    }

    pub fn outstanding(&self) -> usize {
        self.shared.lock().outstanding
    }
}
