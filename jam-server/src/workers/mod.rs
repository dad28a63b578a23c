//! Session worker lifecycle
//!
//! A session goes through three stages here:
//! - pending: the worker was started but has not announced itself yet
//! - active: the orchestrator holds a control connection to it
//! - gone: the control connection closed; the record and memberships are
//!   removed and connected members are told the session closed
//!
//! The pending entry is registered before the worker is spawned. The
//! worker's handshake and the end of address discovery can arrive in either
//! order; whichever comes second activates the session.

pub mod provisioner;
pub mod sanitize;

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use dashmap::DashMap;
use futures::{SinkExt, StreamExt};
use serde_json::Value;
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio::time::Instant;
use tokio_util::codec::Framed;
use tracing::{debug, info, warn};

use jam_protocol::{CorrelatedFrame, CorrelationId, CreateSessionParams, FrameCodec};
use jam_utils::{short_id, JamError, Result};

use crate::config::WorkerConfig;
use crate::router::MessageRouter;
use crate::store::{DocumentStore, SessionRecord};

pub use provisioner::{ProcessProvisioner, ProvisionParams, Provisioner, WorkerAddress, WorkerHandle};
use sanitize::{sanitize, DESCRIPTION_MAX, TITLE_MAX};

/// Outbound frames buffered per worker connection
const CONTROL_QUEUE: usize = 256;

/// Timing and limits the manager works with
#[derive(Debug, Clone)]
pub struct WorkerSettings {
    /// Address workers send their handshake to
    pub handshake_addr: String,
    pub discovery_attempts: u32,
    pub discovery_delay: Duration,
    pub pending_ttl: Duration,
    pub max_depth: usize,
    pub max_width: usize,
    pub default_length_secs: u64,
    pub max_length_secs: u64,
}

impl WorkerSettings {
    pub fn from_config(config: &WorkerConfig, handshake_addr: impl Into<String>) -> Self {
        Self {
            handshake_addr: handshake_addr.into(),
            discovery_attempts: config.discovery_attempts,
            discovery_delay: Duration::from_millis(config.discovery_delay_ms),
            pending_ttl: Duration::from_secs(config.pending_ttl_secs),
            max_depth: config.max_depth,
            max_width: config.max_width,
            default_length_secs: config.default_length_secs,
            max_length_secs: config.max_length_secs,
        }
    }
}

/// A worker that has not completed its handshake
#[derive(Debug, Clone)]
struct PendingSession {
    owner_account_id: Option<String>,
    /// Set once discovery has found the worker
    handle: Option<WorkerHandle>,
    handshake_seen: bool,
    registered_at: Instant,
}

struct ActiveWorker {
    sender: mpsc::Sender<String>,
    handle: WorkerHandle,
    /// Distinguishes this connection from a later one for the same session
    generation: u64,
}

pub struct WorkerManager {
    provisioner: Arc<dyn Provisioner>,
    store: Arc<dyn DocumentStore>,
    router: Arc<MessageRouter>,
    settings: WorkerSettings,
    pending: DashMap<String, PendingSession>,
    active: DashMap<String, ActiveWorker>,
    next_generation: AtomicU64,
}

impl WorkerManager {
    pub fn new(
        provisioner: Arc<dyn Provisioner>,
        store: Arc<dyn DocumentStore>,
        router: Arc<MessageRouter>,
        settings: WorkerSettings,
    ) -> Self {
        Self {
            provisioner,
            store,
            router,
            settings,
            pending: DashMap::new(),
            active: DashMap::new(),
            next_generation: AtomicU64::new(1),
        }
    }

    pub fn is_active(&self, session_id: &str) -> bool {
        self.active.contains_key(session_id)
    }

    pub fn is_pending(&self, session_id: &str) -> bool {
        self.pending.contains_key(session_id)
    }

    pub fn active_count(&self) -> usize {
        self.active.len()
    }

    /// Start a worker for a new session and return its id
    pub async fn provision(
        self: &Arc<Self>,
        owner: Option<&str>,
        params: CreateSessionParams,
    ) -> Result<String> {
        let session_id = self.fresh_session_id()?;
        let title = sanitize(&params.title, TITLE_MAX);
        let description = sanitize(&params.description, DESCRIPTION_MAX);
        let length_secs = params
            .length_secs
            .unwrap_or(self.settings.default_length_secs)
            .clamp(1, self.settings.max_length_secs);

        self.pending.insert(
            session_id.clone(),
            PendingSession {
                owner_account_id: owner.map(str::to_string),
                handle: None,
                handshake_seen: false,
                registered_at: Instant::now(),
            },
        );

        let spawn_params = ProvisionParams {
            session_id: session_id.clone(),
            title: title.clone(),
            description: description.clone(),
            owner_account_id: owner.map(str::to_string),
            length_secs,
            max_depth: self.settings.max_depth,
            max_width: self.settings.max_width,
            handshake_addr: self.settings.handshake_addr.clone(),
        };
        let handle = match self.provisioner.provision(&spawn_params) {
            Ok(handle) => handle,
            Err(e) => {
                self.pending.remove(&session_id);
                return Err(e);
            }
        };

        let address = match self.discover(&session_id, &handle).await {
            Ok(address) => address,
            Err(e) => {
                warn!("Provisioning {} failed: {}", session_id, e);
                self.pending.remove(&session_id);
                self.terminate_quietly(&handle);
                return Err(e);
            }
        };
        let handle = WorkerHandle {
            pid: handle.pid,
            address: Some(address),
        };

        let record = SessionRecord {
            session_id: session_id.clone(),
            title,
            description,
            owner_account_id: owner.map(str::to_string),
            member_account_ids: Vec::new(),
            worker: handle.clone(),
            start_time: Utc::now(),
            length_secs,
        };
        let persisted = self.store.put_session(record).and_then(|()| match owner {
            Some(owner) => self.store.add_member(&session_id, owner),
            None => Ok(()),
        });
        if let Err(e) = persisted {
            self.pending.remove(&session_id);
            self.terminate_quietly(&handle);
            let _ = self.store.delete_session(&session_id);
            return Err(e);
        }
        self.router.open_session(&session_id, owner);

        match self.pending.get_mut(&session_id) {
            Some(mut entry) => entry.handle = Some(handle),
            None => {
                return Err(JamError::internal(format!(
                    "pending entry for {} vanished",
                    session_id
                )))
            }
        }

        if let Some(handle) = self.take_ready(&session_id) {
            self.activate_or_drop(&session_id, handle).await;
        } else {
            self.spawn_pending_expiry(session_id.clone());
        }

        info!("Provisioned session {} (owner {:?})", session_id, owner);
        Ok(session_id)
    }

    /// A worker announced itself on the handshake listener
    ///
    /// Returns false when nothing was waiting for this session id.
    pub async fn on_handshake(self: &Arc<Self>, session_id: &str) -> bool {
        match self.pending.get_mut(session_id) {
            Some(mut entry) => entry.handshake_seen = true,
            None => {
                debug!("Ignoring handshake for unknown session {}", session_id);
                return false;
            }
        }

        if let Some(handle) = self.take_ready(session_id) {
            self.activate_or_drop(session_id, handle).await;
        } else {
            debug!("Handshake for {} arrived before discovery finished", session_id);
        }
        true
    }

    /// Forward a request to the session's worker
    pub async fn write(&self, session_id: &str, cid: CorrelationId, request: Value) -> Result<()> {
        let sender = self
            .active
            .get(session_id)
            .map(|worker| worker.sender.clone())
            .ok_or_else(|| JamError::SessionNotFound(session_id.to_string()))?;
        let line = CorrelatedFrame::new(cid, request).encode();
        sender.send(line).await.map_err(|_| JamError::ConnectionClosed)
    }

    /// Record that `account_id` joined `session_id`
    pub fn join(&self, session_id: &str, account_id: &str) -> Result<()> {
        self.store.add_member(session_id, account_id)
    }

    /// The worker is gone: forget it everywhere
    ///
    /// Returns false when the session was already unknown.
    pub fn on_worker_disconnect(&self, session_id: &str) -> bool {
        let active = self.active.remove(session_id).map(|(_, worker)| worker);
        let record = match self.store.delete_session(session_id) {
            Ok(record) => record,
            Err(e) => {
                warn!("Failed to delete record of {}: {}", session_id, e);
                None
            }
        };
        if active.is_none() && record.is_none() {
            return false;
        }

        if let Some(record) = &record {
            if let Err(e) = self.store.pull_session(session_id, &record.member_account_ids) {
                warn!("Failed to pull {} from accounts: {}", session_id, e);
            }
        }
        self.router.close_session(session_id);

        let handle = record.map(|r| r.worker).or(active.map(|w| w.handle));
        if let Some(handle) = handle {
            self.terminate_quietly(&handle);
        }
        info!("Session {} is gone", session_id);
        true
    }

    /// Re-attach to every persisted worker after a restart
    ///
    /// Workers that cannot be reached are treated as disconnected.
    pub async fn reconnect(self: &Arc<Self>) -> Result<usize> {
        let records = self.store.list_sessions()?;
        let mut restored = 0;

        for record in records {
            self.router
                .open_session(&record.session_id, record.owner_account_id.as_deref());
            match self.activate(&record.session_id, record.worker.clone()).await {
                Ok(()) => restored += 1,
                Err(e) => {
                    warn!("Worker for {} is unreachable: {}", record.session_id, e);
                    self.on_worker_disconnect(&record.session_id);
                }
            }
        }

        info!("Reconnected to {} workers", restored);
        Ok(restored)
    }

    /// Stop every known worker and clear all session state
    pub fn purge_all(&self) -> Result<usize> {
        let mut handles: Vec<WorkerHandle> = self
            .store
            .list_sessions()?
            .into_iter()
            .map(|record| record.worker)
            .collect();
        handles.extend(self.active.iter().map(|worker| worker.handle.clone()));
        handles.extend(self.pending.iter().filter_map(|entry| entry.handle.clone()));
        handles.sort_by_key(|handle| handle.pid);
        handles.dedup_by_key(|handle| handle.pid);

        self.pending.clear();
        self.active.clear();
        for handle in &handles {
            self.terminate_quietly(handle);
        }

        let cleared = self.store.clear_sessions()?;
        self.router.clear();
        info!("Purged {} sessions ({} workers)", cleared, handles.len());
        Ok(cleared)
    }

    fn fresh_session_id(&self) -> Result<String> {
        loop {
            let id = short_id();
            let taken = self.pending.contains_key(&id)
                || self.active.contains_key(&id)
                || self.store.get_session(&id)?.is_some();
            if !taken {
                return Ok(id);
            }
        }
    }

    async fn discover(&self, session_id: &str, handle: &WorkerHandle) -> Result<WorkerAddress> {
        for attempt in 1..=self.settings.discovery_attempts {
            if let Some(address) = self.provisioner.discover_address(handle)? {
                debug!("Discovered {} at {:?} (attempt {})", session_id, address, attempt);
                return Ok(address);
            }
            tokio::time::sleep(self.settings.discovery_delay).await;
        }
        Err(JamError::DiscoveryTimeout {
            session_id: session_id.to_string(),
            attempts: self.settings.discovery_attempts,
        })
    }

    /// Remove the pending entry once both the handshake and the address are in
    fn take_ready(&self, session_id: &str) -> Option<WorkerHandle> {
        self.pending
            .remove_if(session_id, |_, entry| entry.handshake_seen && entry.handle.is_some())
            .and_then(|(_, entry)| entry.handle)
    }

    fn spawn_pending_expiry(self: &Arc<Self>, session_id: String) {
        let Some(registered_at) = self.pending.get(&session_id).map(|e| e.registered_at) else {
            return;
        };
        let manager = Arc::clone(self);
        let deadline = registered_at + self.settings.pending_ttl;

        tokio::spawn(async move {
            tokio::time::sleep_until(deadline).await;
            if let Some((_, entry)) = manager.pending.remove(&session_id) {
                warn!(
                    "Worker for {} never completed its handshake (owner {:?})",
                    session_id, entry.owner_account_id
                );
                manager.on_worker_disconnect(&session_id);
            }
        });
    }

    async fn activate_or_drop(self: &Arc<Self>, session_id: &str, handle: WorkerHandle) {
        if let Err(e) = self.activate(session_id, handle).await {
            warn!("Failed to attach to worker {}: {}", session_id, e);
            self.on_worker_disconnect(session_id);
        }
    }

    /// Open the control connection and start pumping frames
    async fn activate(self: &Arc<Self>, session_id: &str, handle: WorkerHandle) -> Result<()> {
        let address = handle
            .address
            .clone()
            .ok_or_else(|| JamError::connection(format!("no address for {}", session_id)))?;
        let stream = TcpStream::connect(address.control_addr())
            .await
            .map_err(|e| JamError::connection(format!("{}: {}", address.control_addr(), e)))?;

        let (mut sink, mut frames) = Framed::new(stream, FrameCodec::new()).split();
        let (tx, mut rx) = mpsc::channel::<String>(CONTROL_QUEUE);
        let generation = self.next_generation.fetch_add(1, Ordering::SeqCst);

        self.active.insert(
            session_id.to_string(),
            ActiveWorker {
                sender: tx,
                handle,
                generation,
            },
        );

        let id = session_id.to_string();
        tokio::spawn(async move {
            while let Some(line) = rx.recv().await {
                if let Err(e) = sink.send(line).await {
                    warn!("Write to worker {} failed: {}", id, e);
                    break;
                }
            }
        });

        let manager = Arc::clone(self);
        let id = session_id.to_string();
        tokio::spawn(async move {
            while let Some(frame) = frames.next().await {
                match frame {
                    Ok(line) if line.is_empty() => continue,
                    Ok(line) => {
                        manager.router.on_worker_frame(&id, &line);
                    }
                    Err(e) => {
                        warn!("Read from worker {} failed: {}", id, e);
                        break;
                    }
                }
            }
            manager.on_control_closed(&id, generation);
        });

        info!("Session {} active at {}", session_id, address.control_addr());
        Ok(())
    }

    fn on_control_closed(&self, session_id: &str, generation: u64) {
        let current = self
            .active
            .get(session_id)
            .map(|worker| worker.generation == generation)
            .unwrap_or(false);
        if current {
            debug!("Control connection to {} closed", session_id);
            self.on_worker_disconnect(session_id);
        }
    }

    fn terminate_quietly(&self, handle: &WorkerHandle) {
        if let Err(e) = self.provisioner.terminate(handle) {
            warn!("Failed to terminate worker {:?}: {}", handle.pid, e);
        }
    }
}
