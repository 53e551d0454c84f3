// SPDX-FileCopyrightText: 2025 The seedgate Contributors
// SPDX-License-Identifier: GPL-3.0-or-later

use super::piece_reader::{FilePieceReader, PieceReaderConfig, ReadExecutor, ReaderSignal};
use super::response::FileSection;
use super::slot_manager::SlotUser;
use super::speed::SpeedMeter;
use super::watchdog::{StallSignal, StalledWatchdog};
use super::UploadState;
use crate::errors::UploadError;
use crate::http::Method;
use crate::stats::{StatsSink, UploadStat};
use crate::storage::{FileDesc, Sha1Urn};
use crate::throttle::BandwidthThrottle;

use std::net::{IpAddr, SocketAddr};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

use tokio::io::{AsyncWrite, AsyncWriteExt};
use tokio::sync::Notify;
use tokio::time::Instant;
use tracing::{event, Level};

/// The part of an upload connection the slot manager sees.
#[derive(Debug)]
pub struct SessionShared {
    id: u64,
    host: IpAddr,
    meter: Mutex<SpeedMeter>,
    preempted: AtomicBool,
    preempt_notify: Notify,
}

impl SessionShared {
    pub fn new(id: u64, host: IpAddr) -> Arc<Self> {
        Arc::new(Self {
            id,
            host,
            meter: Mutex::new(SpeedMeter::new()),
            preempted: AtomicBool::new(false),
            preempt_notify: Notify::new(),
        })
    }

    fn meter(&self) -> MutexGuard<'_, SpeedMeter> {
        match self.meter.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    pub fn record_bytes(&self, bytes: u64) {
        self.meter().record(bytes);
    }

    pub fn was_preempted(&self) -> bool {
        self.preempted.load(Ordering::Acquire)
    }

    fn clear_preemption(&self) {
        self.preempted.store(false, Ordering::Release);
    }

    /// Resolves once the scheduler has taken the slot away.
    pub async fn preempted(&self) {
        loop {
            let notified = self.preempt_notify.notified();
            if self.was_preempted() {
                return;
            }
            notified.await;
        }
    }
}

impl SlotUser for SessionShared {
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
}

/// Services a transfer draws on.
#[derive(Clone)]
pub struct TransferContext {
    pub throttle: Arc<BandwidthThrottle>,
    pub executor: Arc<dyn ReadExecutor>,
    pub reader_config: PieceReaderConfig,
    pub stats: Arc<dyn StatsSink>,
}

/// The slot an uploader was granted and the download it was granted for.
#[derive(Debug, Clone, Copy)]
struct HeldSlot {
    urn: Sha1Urn,
    method: Method,
}

/// State of one upload connection. Successive HTTP/1.1 requests reuse the
/// same uploader; [`reinitialize`](Self::reinitialize) resets everything
/// that belongs to a single request. A granted slot outlives the request
/// and stays with the connection while the peer keeps fetching the same file.
pub struct HttpUploader {
    shared: Arc<SessionShared>,
    peer: SocketAddr,
    state: UploadState,
    last_transfer_state: Option<UploadState>,
    method: Method,
    file: Option<Arc<FileDesc>>,
    begin: u64,
    end: u64,
    amount_uploaded: u64,
    total_uploaded: u64,
    last_poll: Option<Instant>,
    slot: Option<HeldSlot>,
    watchdog: StalledWatchdog,
}

impl HttpUploader {
    pub fn new(id: u64, peer: SocketAddr, watchdog: StalledWatchdog) -> Self {
        Self {
            shared: SessionShared::new(id, peer.ip()),
            peer,
            state: UploadState::Connecting,
            last_transfer_state: None,
            method: Method::Get,
            file: None,
            begin: 0,
            end: 0,
            amount_uploaded: 0,
            total_uploaded: 0,
            last_poll: None,
            slot: None,
            watchdog,
        }
    }

    /// Prepares for the next request on this connection. The cumulative byte
    /// count survives.
    pub fn reinitialize(&mut self, method: Method) {
        self.state = UploadState::Connecting;
        self.method = method;
        self.file = None;
        self.begin = 0;
        self.end = 0;
        self.amount_uploaded = 0;
        if self.slot.is_none() {
            self.shared.clear_preemption();
        }
    }

    pub fn id(&self) -> u64 {
        self.shared.id
    }

    pub fn host(&self) -> IpAddr {
        self.shared.host
    }

    pub fn peer(&self) -> SocketAddr {
        self.peer
    }

    pub fn shared(&self) -> Arc<SessionShared> {
        self.shared.clone()
    }

    pub fn state(&self) -> UploadState {
        self.state
    }

    pub fn set_state(&mut self, state: UploadState) {
        if state.is_transfer() {
            self.last_transfer_state = Some(state);
        }
        self.state = state;
    }

    pub fn last_transfer_state(&self) -> Option<UploadState> {
        self.last_transfer_state
    }

    pub fn method(&self) -> Method {
        self.method
    }

    pub fn file(&self) -> Option<&Arc<FileDesc>> {
        self.file.as_ref()
    }

    pub fn set_file(&mut self, file: Arc<FileDesc>, begin: u64, end: u64) {
        self.file = Some(file);
        self.begin = begin;
        self.end = end;
    }

    pub fn range(&self) -> (u64, u64) {
        (self.begin, self.end)
    }

    pub fn amount_uploaded(&self) -> u64 {
        self.amount_uploaded
    }

    pub fn total_uploaded(&self) -> u64 {
        self.total_uploaded
    }

    pub fn holds_slot(&self) -> bool {
        self.slot.is_some()
    }

    /// Records a granted slot for `urn` under the current method.
    pub fn accept(&mut self, urn: Sha1Urn) {
        self.slot = Some(HeldSlot {
            urn,
            method: self.method,
        });
    }

    /// True if this request carries on the download the held slot was
    /// granted for.
    pub fn continues_upload(&self, urn: &Sha1Urn) -> bool {
        self.slot
            .is_some_and(|held| held.urn == *urn && held.method == self.method)
            && !self.was_preempted()
    }

    /// Forgets the held slot and returns the file it was granted for.
    pub fn take_slot(&mut self) -> Option<Sha1Urn> {
        let held = self.slot.take()?;
        self.shared.clear_preemption();
        Some(held.urn)
    }

    pub fn last_poll(&self) -> Option<Instant> {
        self.last_poll
    }

    pub fn record_poll(&mut self, at: Instant) {
        self.last_poll = Some(at);
    }

    pub fn was_preempted(&self) -> bool {
        self.shared.was_preempted()
    }

    pub fn set_stall_delay(&self, delay: std::time::Duration) {
        self.watchdog.set_delay(delay);
    }

    /// Streams `section` to `writer` in order, one piece at a time. Each
    /// write passes the throttle and is guarded by the stall watchdog.
    pub async fn transfer<W>(
        &mut self,
        section: &FileSection,
        ctx: &TransferContext,
        writer: &mut W,
    ) -> Result<(), UploadError>
    where
        W: AsyncWrite + Unpin,
    {
        let file = tokio::fs::File::open(&section.file.path)
            .await?
            .into_std()
            .await;
        let signal = ReaderSignal::new();
        let reader = FilePieceReader::new(
            Arc::new(file),
            section.begin,
            section.len(),
            ctx.reader_config,
            ctx.executor.clone(),
            signal.clone(),
        );
        reader.start();

        let stall = StallSignal::new();
        let result = self
            .pump(&reader, &signal, &stall, ctx, writer, section.len())
            .await;

        self.watchdog.deactivate();
        reader.shutdown();
        if let Err(e) = &result {
            event!(
                Level::DEBUG,
                id = self.id(),
                peer = %self.peer,
                sent = self.amount_uploaded,
                error = %e,
                "Transfer ended early"
            );
        }
        result
    }

    async fn pump<W>(
        &mut self,
        reader: &FilePieceReader,
        signal: &ReaderSignal,
        stall: &Arc<StallSignal>,
        ctx: &TransferContext,
        writer: &mut W,
        length: u64,
    ) -> Result<(), UploadError>
    where
        W: AsyncWrite + Unpin,
    {
        let mut remaining = length;
        while remaining > 0 {
            let Some(piece) = reader.next() else {
                if let Some(error) = signal.take_error() {
                    return Err(UploadError::ReadFailed(error));
                }
                if reader.is_shutdown() {
                    return Err(UploadError::ReaderShutdown);
                }
                tokio::select! {
                    biased;
                    _ = self.shared.preempted() => return Err(UploadError::Preempted),
                    _ = signal.wait() => {}
                }
                continue;
            };

            self.watchdog.activate(stall.clone());
            let outcome = tokio::select! {
                biased;
                _ = self.shared.preempted() => Err(UploadError::Preempted),
                _ = stall.closed() => Err(UploadError::Stalled),
                written = write_piece(&ctx.throttle, writer, piece.data()) => {
                    written.map_err(UploadError::from)
                }
            };
            self.watchdog.deactivate();
            outcome?;

            let sent = piece.len() as u64;
            self.amount_uploaded += sent;
            self.total_uploaded += sent;
            self.shared.record_bytes(sent);
            ctx.stats.add_data(UploadStat::BytesUploaded, sent);
            remaining -= sent;
            reader.release(piece);
        }
        writer.flush().await?;
        Ok(())
    }
}

async fn write_piece<W>(
    throttle: &BandwidthThrottle,
    writer: &mut W,
    data: &[u8],
) -> std::io::Result<()>
where
    W: AsyncWrite + Unpin,
{
    throttle.acquire(data.len()).await;
    writer.write_all(data).await
}
