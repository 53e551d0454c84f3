// SPDX-FileCopyrightText: 2025 The seedgate Contributors
// SPDX-License-Identifier: GPL-3.0-or-later

use std::collections::VecDeque;
use thiserror::Error;
use tokio::sync::{mpsc, oneshot};
use tracing::{event, Level};

// Grant at most this many queued permits per pass, then re-queue the work.
const PERMIT_GRANT_BATCH_SIZE: usize = 64;

/// Disk reads may wait behind this many other reads before failing.
pub const DISK_READ_QUEUE_SIZE: usize = 256;

#[derive(Debug, Clone, Copy, Eq, PartialEq, Hash)]
pub enum ResourceType {
    /// An inbound peer connection. Never queued: the accept loop rejects.
    Connection,
    /// One positioned read against a shared file.
    DiskRead,
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ResourceManagerError {
    #[error("The resource manager has been shut down.")]
    ManagerShutdown,
    #[error("The request queue for the resource is full.")]
    QueueFull,
}

/// Held for as long as the resource is in use; dropping it hands the permit
/// back to the manager.
#[derive(Debug)]
pub struct PermitGuard {
    resource: ResourceType,
    control_tx: mpsc::UnboundedSender<ControlCommand>,
}

impl PermitGuard {
    pub fn resource(&self) -> ResourceType {
        self.resource
    }
}

impl Drop for PermitGuard {
    fn drop(&mut self) {
        let _ = self.control_tx.send(ControlCommand::Release {
            resource: self.resource,
        });
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ResourceLimits {
    pub max_connections: usize,
    pub disk_read_permits: usize,
}

#[derive(Clone, Debug)]
pub struct ResourceManagerClient {
    acquire_tx: mpsc::Sender<AcquireCommand>,
    control_tx: mpsc::UnboundedSender<ControlCommand>,
}

impl ResourceManagerClient {
    pub async fn acquire_connection(&self) -> Result<PermitGuard, ResourceManagerError> {
        self.acquire(ResourceType::Connection).await
    }

    pub async fn acquire_disk_read(&self) -> Result<PermitGuard, ResourceManagerError> {
        self.acquire(ResourceType::DiskRead).await
    }

    pub fn update_limits(&self, limits: ResourceLimits) -> Result<(), ResourceManagerError> {
        self.control_tx
            .send(ControlCommand::UpdateLimits { limits })
            .map_err(|_| ResourceManagerError::ManagerShutdown)
    }

    async fn acquire(&self, resource: ResourceType) -> Result<PermitGuard, ResourceManagerError> {
        let (respond_to, rx) = oneshot::channel();
        self.acquire_tx
            .send(AcquireCommand {
                resource,
                respond_to,
            })
            .await
            .map_err(|_| ResourceManagerError::ManagerShutdown)?;

        match rx.await {
            Ok(result) => result,
            Err(_) => Err(ResourceManagerError::ManagerShutdown),
        }
    }
}

type Responder = oneshot::Sender<Result<PermitGuard, ResourceManagerError>>;

#[derive(Debug)]
struct AcquireCommand {
    resource: ResourceType,
    respond_to: Responder,
}

#[derive(Debug)]
enum ControlCommand {
    Release { resource: ResourceType },
    UpdateLimits { limits: ResourceLimits },
    ProcessQueue { resource: ResourceType },
}

struct ResourceState {
    limit: usize,
    in_use: usize,
    max_queue_size: usize,
    wait_queue: VecDeque<Responder>,
}

impl ResourceState {
    fn new(limit: usize, max_queue_size: usize) -> Self {
        Self {
            limit,
            in_use: 0,
            max_queue_size,
            wait_queue: VecDeque::new(),
        }
    }
}

/// Actor that hands out connection and disk-read permits.
pub struct ResourceManager {
    acquire_rx: mpsc::Receiver<AcquireCommand>,
    control_rx: mpsc::UnboundedReceiver<ControlCommand>,
    control_tx: mpsc::UnboundedSender<ControlCommand>,
    connections: ResourceState,
    disk_reads: ResourceState,
}

impl ResourceManager {
    pub fn new(limits: ResourceLimits) -> (Self, ResourceManagerClient) {
        let (acquire_tx, acquire_rx) = mpsc::channel(256);
        let (control_tx, control_rx) = mpsc::unbounded_channel();

        let client = ResourceManagerClient {
            acquire_tx,
            control_tx: control_tx.clone(),
        };
        let actor = Self {
            acquire_rx,
            control_rx,
            control_tx,
            connections: ResourceState::new(limits.max_connections, 0),
            disk_reads: ResourceState::new(limits.disk_read_permits, DISK_READ_QUEUE_SIZE),
        };
        (actor, client)
    }

    pub async fn run(mut self) {
        loop {
            tokio::select! {
                Some(cmd) = self.acquire_rx.recv() => self.handle_acquire(cmd.resource, cmd.respond_to),
                Some(cmd) = self.control_rx.recv() => match cmd {
                    ControlCommand::Release { resource } => self.handle_release(resource),
                    ControlCommand::UpdateLimits { limits } => self.handle_update_limits(limits),
                    ControlCommand::ProcessQueue { resource } => self.handle_process_queue(resource),
                },
                else => break,
            }
        }
        event!(Level::DEBUG, "Resource manager shut down.");
    }

    fn state_mut(&mut self, resource: ResourceType) -> &mut ResourceState {
        match resource {
            ResourceType::Connection => &mut self.connections,
            ResourceType::DiskRead => &mut self.disk_reads,
        }
    }

    fn guard(&self, resource: ResourceType) -> PermitGuard {
        PermitGuard {
            resource,
            control_tx: self.control_tx.clone(),
        }
    }

    fn handle_acquire(&mut self, resource: ResourceType, respond_to: Responder) {
        let state = self.state_mut(resource);

        if state.in_use < state.limit {
            state.in_use += 1;
            // If the requester went away the returned guard is dropped here,
            // which releases the permit again.
            let _ = respond_to.send(Ok(self.guard(resource)));
        } else if state.wait_queue.len() < state.max_queue_size {
            state.wait_queue.push_back(respond_to);
        } else {
            let _ = respond_to.send(Err(ResourceManagerError::QueueFull));
        }
    }

    fn handle_release(&mut self, resource: ResourceType) {
        let state = self.state_mut(resource);
        state.in_use = state.in_use.saturating_sub(1);
        if !state.wait_queue.is_empty() {
            let _ = self
                .control_tx
                .send(ControlCommand::ProcessQueue { resource });
        }
    }

    fn handle_update_limits(&mut self, limits: ResourceLimits) {
        event!(
            Level::DEBUG,
            max_connections = limits.max_connections,
            disk_read_permits = limits.disk_read_permits,
            "Updating resource limits"
        );
        self.connections.limit = limits.max_connections;
        self.disk_reads.limit = limits.disk_read_permits;
        let _ = self.control_tx.send(ControlCommand::ProcessQueue {
            resource: ResourceType::DiskRead,
        });
    }

    fn handle_process_queue(&mut self, resource: ResourceType) {
        for _ in 0..PERMIT_GRANT_BATCH_SIZE {
            let state = self.state_mut(resource);
            if state.in_use >= state.limit {
                return;
            }
            let Some(next_in_line) = state.wait_queue.pop_front() else {
                return;
            };
            if next_in_line.is_closed() {
                continue;
            }
            state.in_use += 1;
            let guard = self.guard(resource);
            // A failed send drops the guard, which releases the permit again.
            let _ = next_in_line.send(Ok(guard));
        }

        let state = self.state_mut(resource);
        if state.in_use < state.limit && !state.wait_queue.is_empty() {
            let _ = self
                .control_tx
                .send(ControlCommand::ProcessQueue { resource });
        }
    }
}
