// SPDX-FileCopyrightText: 2025 The seedgate Contributors
// SPDX-License-Identifier: GPL-3.0-or-later

//! Turns parsed requests into responses and drives admitted transfers.

use super::piece_reader::{DiskReadExecutor, PieceReaderConfig, ReadExecutor};
use super::request::{is_browser, RequestTarget};
use super::request_cache::RequestCache;
use super::response::{Body, FileSection, UploadResponse, INACTIVE_RETRY_AFTER_SECS};
use super::seed::SeedUploader;
use super::session::{HttpUploader, TransferContext};
use super::slot_manager::{SlotDecision, SlotLimits, SlotRequest, UploadSlotManager};
use super::watchdog::StalledWatchdog;
use super::UploadState;
use crate::altloc::{parse_x_alt, AltLocStore, AltLocTable};
use crate::config::Settings;
use crate::errors::UploadError;
use crate::http::{Method, RangeSpec, RequestHead};
use crate::resource_manager::{ResourceLimits, ResourceManagerClient};
use crate::stats::{StatsSink, UploadStat, UploadStats};
use crate::storage::{FileDesc, Library, Sha1Urn};
use crate::throttle::BandwidthThrottle;

use std::fmt::Write as _;
use std::net::{IpAddr, SocketAddr};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use tokio::io::{AsyncWrite, AsyncWriteExt};
use tokio::time::Instant;
use tracing::{event, Level};

const MAX_ADVERTISED_ALT_LOCS: usize = 10;
/// Peers that can try someone else are asked to come back sooner.
const RETRY_AFTER_WITH_ALT_LOCS_SECS: u64 = 15 * 60;
const RETRY_AFTER_SECS: u64 = 20 * 60;
const GNUTELLA_PACKETS: &str = "application/x-gnutella-packets";

/// Forwards push requests to firewalled leaves on behalf of a push proxy.
pub trait PushRouter: Send + Sync {
    /// True if a push was sent towards `server_id`.
    fn forward_push(&self, server_id: &str, requester: SocketAddr) -> bool;
}

/// Used when this node is not acting as anyone's push proxy.
#[derive(Debug, Default)]
pub struct NoPushRouting;

impl PushRouter for NoPushRouting {
    fn forward_push(&self, _server_id: &str, _requester: SocketAddr) -> bool {
        false
    }
}

pub struct UploadManager {
    settings: Mutex<Settings>,
    library: Arc<Library>,
    slots: Arc<UploadSlotManager>,
    throttle: Arc<BandwidthThrottle>,
    alt_locs: Arc<dyn AltLocStore>,
    push_router: Arc<dyn PushRouter>,
    stats: Arc<UploadStats>,
    requests: RequestCache,
    executor: Arc<dyn ReadExecutor>,
    resources: ResourceManagerClient,
    next_id: AtomicU64,
}

impl UploadManager {
    pub fn new(settings: &Settings, library: Arc<Library>, resources: ResourceManagerClient) -> Self {
        Self {
            slots: Arc::new(UploadSlotManager::new(SlotLimits::from(&settings.upload))),
            throttle: Arc::new(BandwidthThrottle::new(settings.upload_limit_bps)),
            alt_locs: Arc::new(AltLocTable::new()),
            push_router: Arc::new(NoPushRouting),
            stats: Arc::new(UploadStats::new()),
            requests: RequestCache::new(),
            executor: Arc::new(DiskReadExecutor::new(resources.clone())),
            settings: Mutex::new(settings.clone()),
            library,
            resources,
            next_id: AtomicU64::new(1),
        }
    }

    pub fn with_push_router(mut self, router: Arc<dyn PushRouter>) -> Self {
        self.push_router = router;
        self
    }

    fn lock_settings(&self) -> MutexGuard<'_, Settings> {
        match self.settings.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    pub fn settings(&self) -> Settings {
        self.lock_settings().clone()
    }

    pub fn slots(&self) -> &Arc<UploadSlotManager> {
        &self.slots
    }

    pub fn stats(&self) -> &Arc<UploadStats> {
        &self.stats
    }

    pub fn throttle(&self) -> &Arc<BandwidthThrottle> {
        &self.throttle
    }

    /// Pushes new limits into every running component. Sessions pick up the
    /// stall delay and reader sizing on their next transfer.
    pub fn apply_settings(&self, settings: &Settings) {
        self.slots.update_limits(SlotLimits::from(&settings.upload));
        self.throttle.set_rate(settings.upload_limit_bps);
        if let Err(e) = self.resources.update_limits(ResourceLimits {
            max_connections: settings.max_connections,
            disk_read_permits: settings.disk_read_permits,
        }) {
            event!(Level::WARN, error = %e, "Could not update resource limits");
        }
        *self.lock_settings() = settings.clone();
        event!(
            Level::INFO,
            hard_max = settings.upload.hard_max_uploads,
            soft_max = settings.upload.soft_max_uploads,
            rate = settings.upload_limit_bps,
            "Upload settings applied"
        );
    }

    pub fn new_uploader(&self, peer: SocketAddr) -> HttpUploader {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let delay = self.lock_settings().upload.stall_timeout();
        HttpUploader::new(id, peer, StalledWatchdog::new(delay, self.stats.clone()))
    }

    /// A slot client for swarm seeding that shares this manager's slots.
    pub fn new_seed_uploader(&self, host: IpAddr) -> SeedUploader {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        SeedUploader::new(id, host, self.slots.clone())
    }

    /// How long the connection may sit idle before the next request.
    pub fn idle_timeout(&self, uploader: &HttpUploader) -> Duration {
        let settings = self.lock_settings();
        if uploader.state() == UploadState::Queued {
            settings.upload.max_poll()
        } else {
            settings.upload.keep_alive()
        }
    }

    /// Response for a request head that could not be parsed at all.
    pub fn malformed(&self, uploader: &mut HttpUploader) -> UploadResponse {
        uploader.reinitialize(Method::Get);
        self.stats.increment(UploadStat::Attempted);
        self.stats.increment(UploadStat::Malformed);
        uploader.set_state(UploadState::MalformedRequest);
        UploadResponse::MalformedRequest
    }

    /// Decides what to answer. Nothing is written here. A granted slot stays
    /// with the connection while the peer asks for more of the same file and
    /// is handed back as soon as it asks for anything else.
    pub async fn handle_request(
        &self,
        uploader: &mut HttpUploader,
        head: &RequestHead,
    ) -> UploadResponse {
        uploader.reinitialize(head.method);
        self.stats.increment(UploadStat::Attempted);

        let response = self.route(uploader, head).await;
        let keeps_slot = matches!(response, UploadResponse::File { .. })
            && uploader
                .file()
                .is_some_and(|file| uploader.continues_upload(&file.urn));
        if !keeps_slot {
            self.release_slot(uploader);
        }
        uploader.set_state(response.state());
        self.count_outcome(&response);
        event!(
            Level::DEBUG,
            id = uploader.id(),
            peer = %uploader.peer(),
            target = %head.target,
            status = response.status(),
            state = %response.state(),
            "Upload request handled"
        );
        response
    }

    fn count_outcome(&self, response: &UploadResponse) {
        let stat = match response {
            UploadResponse::Queued { .. } => UploadStat::Queued,
            UploadResponse::LimitReached { .. } => UploadStat::LimitReached,
            UploadResponse::Banned => UploadStat::Banned,
            UploadResponse::Freeloader => UploadStat::Freeloader,
            UploadResponse::FileNotFound => UploadStat::FileNotFound,
            UploadResponse::MalformedRequest => UploadStat::Malformed,
            UploadResponse::Thex { .. } => UploadStat::ThexServed,
            UploadResponse::BrowseHost { .. } => UploadStat::BrowseHost,
            UploadResponse::PushProxy { .. } => UploadStat::PushProxy,
            UploadResponse::UpdateFile { .. } => UploadStat::UpdateFile,
            UploadResponse::File { .. } | UploadResponse::UnavailableRange { .. } => return,
        };
        self.stats.increment(stat);
    }

    async fn route(&self, uploader: &mut HttpUploader, head: &RequestHead) -> UploadResponse {
        let settings = self.settings();
        if !settings.allow_browser && is_browser(head.header("User-Agent")) {
            return UploadResponse::Freeloader;
        }

        let target = match RequestTarget::parse(&head.target) {
            Ok(target) => target,
            Err(e) => {
                event!(Level::DEBUG, peer = %uploader.peer(), error = %e, "Rejecting request");
                return UploadResponse::MalformedRequest;
            }
        };

        let file = match target {
            RequestTarget::BrowseHost => return self.browse_host(head),
            RequestTarget::PushProxy { server_id } => {
                return UploadResponse::PushProxy {
                    forwarded: self.push_router.forward_push(&server_id, uploader.peer()),
                };
            }
            RequestTarget::UpdateFile => return update_file(&settings).await,
            RequestTarget::Thex(urn) => return self.thex(&urn),
            RequestTarget::Traditional { index, name } => {
                self.stats.increment(UploadStat::TraditionalGet);
                match self.library.get(index, &name) {
                    Some(file) => file,
                    None => return UploadResponse::FileNotFound,
                }
            }
            RequestTarget::Urn(urn) => match self.library.get_by_urn(&urn) {
                Some(file) => {
                    self.stats.increment(UploadStat::UrnGet);
                    file
                }
                None => {
                    self.stats.increment(UploadStat::UnknownUrnGet);
                    return UploadResponse::FileNotFound;
                }
            },
        };

        if let Some(value) = head.header("X-Alt") {
            for addr in parse_x_alt(value) {
                self.alt_locs.add(&file.urn, addr);
            }
        }

        let claimed = head
            .header("X-Gnutella-Content-URN")
            .and_then(|value| value.parse::<Sha1Urn>().ok());
        if claimed.is_some_and(|urn| urn != file.urn) {
            return UploadResponse::FileNotFound;
        }
        if file.is_partial() && !settings.allow_partial_sharing {
            return UploadResponse::FileNotFound;
        }

        let range = match head.range() {
            Ok(range) => range,
            Err(e) => {
                event!(Level::DEBUG, peer = %uploader.peer(), error = %e, "Rejecting request");
                return UploadResponse::MalformedRequest;
            }
        };
        let (begin, end) = match resolve_section(&file, range) {
            Ok(section) => section,
            Err(response) => return response,
        };
        uploader.set_file(file.clone(), begin, end);

        let section = FileSection { file, begin, end };
        if head.method == Method::Head {
            return UploadResponse::File {
                alt_locs: self.advertised_alt_locs(&section.file.urn),
                section,
            };
        }
        self.admit(uploader, section, &settings)
    }

    fn admit(
        &self,
        uploader: &mut HttpUploader,
        section: FileSection,
        settings: &Settings,
    ) -> UploadResponse {
        let id = uploader.id();
        let host = uploader.host();
        let urn = section.file.urn;

        // The next chunk of an accepted download was admitted already.
        if uploader.continues_upload(&urn) {
            return UploadResponse::File {
                alt_locs: self.advertised_alt_locs(&urn),
                section,
            };
        }
        self.release_slot(uploader);

        if self.requests.count_request(host) {
            event!(Level::INFO, peer = %uploader.peer(), "Banning host for hammering");
            self.slots.cancel_request(id);
            return UploadResponse::Banned;
        }
        if self.requests.is_dupe(host, &urn) {
            return self.limit_reached(&urn);
        }

        let already_queued = self.slots.position_in_queue(id).is_some();
        if !already_queued
            && self.slots.num_users_for_host(host) >= settings.upload.uploads_per_person
        {
            return self.limit_reached(&urn);
        }

        let now = Instant::now();
        if already_queued {
            let too_soon = uploader
                .last_poll()
                .is_some_and(|last| now.duration_since(last) < settings.upload.min_poll());
            if too_soon {
                event!(Level::INFO, peer = %uploader.peer(), "Queued peer polled too early");
                self.slots.cancel_request(id);
                return UploadResponse::Banned;
            }
        }

        match self.slots.request_slot(SlotRequest::http(uploader.shared())) {
            SlotDecision::Granted => {
                self.requests.started_upload(host, urn);
                uploader.accept(urn);
                UploadResponse::File {
                    alt_locs: self.advertised_alt_locs(&urn),
                    section,
                }
            }
            SlotDecision::Queued(position) => {
                uploader.record_poll(now);
                UploadResponse::Queued {
                    position,
                    poll_min_secs: settings.upload.min_poll_secs,
                    poll_max_secs: settings.upload.max_poll_secs,
                    alt_locs: self.advertised_alt_locs(&urn),
                }
            }
            SlotDecision::Rejected => self.limit_reached(&urn),
        }
    }

    fn limit_reached(&self, urn: &Sha1Urn) -> UploadResponse {
        let retry_after_secs = if self.alt_locs.has_alt_locs(urn) {
            RETRY_AFTER_WITH_ALT_LOCS_SECS
        } else {
            RETRY_AFTER_SECS
        };
        UploadResponse::LimitReached { retry_after_secs }
    }

    fn advertised_alt_locs(&self, urn: &Sha1Urn) -> Vec<SocketAddr> {
        self.alt_locs.alt_locs(urn, MAX_ADVERTISED_ALT_LOCS)
    }

    fn browse_host(&self, head: &RequestHead) -> UploadResponse {
        let accepts = head
            .header("Accept")
            .is_some_and(|accept| accept.contains(GNUTELLA_PACKETS));
        if !accepts {
            return UploadResponse::FileNotFound;
        }
        let mut listing = String::new();
        for file in self.library.iter() {
            let _ = writeln!(listing, "{}\t{}\t{}\t{}", file.index, file.size, file.urn, file.name);
        }
        UploadResponse::BrowseHost { listing }
    }

    fn thex(&self, urn: &Sha1Urn) -> UploadResponse {
        let Some(file) = self.library.get_by_urn(urn) else {
            return UploadResponse::FileNotFound;
        };
        match (&file.hash_tree, file.is_partial()) {
            (Some(tree), false) => UploadResponse::Thex {
                urn: *urn,
                tree: tree.serialize(),
            },
            _ => UploadResponse::FileNotFound,
        }
    }

    fn transfer_context(&self) -> TransferContext {
        let settings = self.lock_settings();
        TransferContext {
            throttle: self.throttle.clone(),
            executor: self.executor.clone(),
            reader_config: PieceReaderConfig::from(&settings.upload),
            stats: self.stats.clone(),
        }
    }

    /// Writes `response` and, for a granted GET, streams the file. The
    /// uploader ends in `Complete` or `Interrupted` when data was involved.
    /// A failed or preempted transfer gives its slot back; a completed one
    /// keeps it for the next chunk.
    pub async fn respond<W>(
        &self,
        uploader: &mut HttpUploader,
        response: UploadResponse,
        writer: &mut W,
    ) -> Result<(), UploadError>
    where
        W: AsyncWrite + Unpin,
    {
        let result = self.write_response(uploader, response, writer).await;
        if uploader.state().is_transfer() {
            self.finish_transfer(uploader, &result);
        }
        result
    }

    async fn write_response<W>(
        &self,
        uploader: &mut HttpUploader,
        response: UploadResponse,
        writer: &mut W,
    ) -> Result<(), UploadError>
    where
        W: AsyncWrite + Unpin,
    {
        response.head().write_to(writer).await?;
        if uploader.method() == Method::Head {
            writer.flush().await?;
            return Ok(());
        }
        match response.into_body() {
            Body::File(section) => {
                uploader.set_stall_delay(self.lock_settings().upload.stall_timeout());
                let ctx = self.transfer_context();
                uploader.transfer(&section, &ctx, writer).await
            }
            Body::Bytes(bytes) => {
                writer.write_all(&bytes).await?;
                writer.flush().await?;
                Ok(())
            }
            Body::Empty => {
                writer.flush().await?;
                Ok(())
            }
        }
    }

    fn finish_transfer(&self, uploader: &mut HttpUploader, result: &Result<(), UploadError>) {
        match result {
            Ok(()) => {
                uploader.set_state(UploadState::Complete);
                if uploader.method() == Method::Get {
                    self.stats.increment(UploadStat::Completed);
                }
                return;
            }
            Err(UploadError::Preempted) => {
                uploader.set_state(UploadState::Interrupted);
                self.stats.increment(UploadStat::Preempted);
            }
            Err(e) => {
                uploader.set_state(UploadState::Interrupted);
                self.stats.increment(UploadStat::Interrupted);
                event!(
                    Level::DEBUG,
                    id = uploader.id(),
                    peer = %uploader.peer(),
                    error = %e,
                    "Upload interrupted"
                );
            }
        }
        self.release_slot(uploader);
    }

    fn release_slot(&self, uploader: &mut HttpUploader) {
        let preempted = uploader.was_preempted();
        let Some(urn) = uploader.take_slot() else {
            return;
        };
        // A preempted session's slot is already gone.
        if !preempted {
            self.slots.request_done(uploader.id());
        }
        self.requests.upload_done(uploader.host(), &urn);
    }

    /// The peer went away: give back any slot and drop out of the queue.
    pub fn connection_closed(&self, uploader: &mut HttpUploader) {
        if uploader.holds_slot() {
            self.release_slot(uploader);
        } else if self.slots.position_in_queue(uploader.id()).is_some() {
            self.slots.cancel_request(uploader.id());
        }
        if uploader.state().is_transfer() {
            uploader.set_state(UploadState::Interrupted);
        }
        event!(
            Level::DEBUG,
            id = uploader.id(),
            peer = %uploader.peer(),
            uploaded = uploader.total_uploaded(),
            "Upload connection closed"
        );
    }
}

/// Picks the bytes to send, or the response explaining why none can be.
fn resolve_section(file: &FileDesc, range: Option<RangeSpec>) -> Result<(u64, u64), UploadResponse> {
    let requested = match range {
        Some(spec) => spec.resolve(file.size),
        None => Some((0, file.size)),
    };

    let Some(progress) = file.partial_progress() else {
        return requested.ok_or_else(|| {
            let mut available = crate::storage::RangeSet::new();
            available.add(0, file.size);
            UploadResponse::UnavailableRange {
                available,
                retry_after_secs: None,
            }
        });
    };

    let available = progress.available();
    let served = requested.and_then(|(begin, end)| {
        if range.is_some() {
            available.first_overlap(begin, end)
        } else if available.contains(begin, end) {
            Some((begin, end))
        } else {
            None
        }
    });
    served.ok_or_else(|| UploadResponse::UnavailableRange {
        retry_after_secs: (!progress.is_downloading()).then_some(INACTIVE_RETRY_AFTER_SECS),
        available,
    })
}

async fn update_file(settings: &Settings) -> UploadResponse {
    let Some(path) = &settings.update_file else {
        return UploadResponse::FileNotFound;
    };
    match tokio::fs::read(path).await {
        Ok(content) => UploadResponse::UpdateFile { content },
        Err(e) => {
            event!(Level::WARN, path = %path.display(), error = %e, "Could not read update file");
            UploadResponse::FileNotFound
        }
    }
}
