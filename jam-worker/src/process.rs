//! Session actor
//!
//! One task owns the tree, the sound registry and the connected accounts.
//! The control socket, streaming connections and the deadline all reach it
//! through a single event channel, so every request runs to completion
//! before the next one is looked at.

use std::collections::BTreeSet;
use std::path::PathBuf;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::{json, Map, Value};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use jam_protocol::{error_reply, reply, CorrelatedFrame, CorrelationId, WorkerRequest};
use jam_utils::{JamError, Result};

use crate::sounds::SoundRegistry;
use crate::tree::LoopTree;

/// How long to wait for the control writer to flush on exit
const FLUSH_TIMEOUT: Duration = Duration::from_secs(2);

/// Static description of the session, returned by `info`
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionInfo {
    pub session_id: String,
    pub title: String,
    pub description: String,
    pub owner_account_id: Option<String>,
    pub start_time: DateTime<Utc>,
    pub length_secs: u64,
    pub max_depth: usize,
    pub max_width: usize,
}

/// Everything that can wake the actor
#[derive(Debug)]
pub enum WorkerEvent {
    /// A new orchestrator connection; replaces any previous one
    ControlAttached {
        sender: mpsc::Sender<String>,
        writer: JoinHandle<()>,
    },
    /// One raw line from the control socket
    Frame(String),
    /// An upload finished writing its file
    UploadComplete { file_id: String, bytes: u64 },
}

/// Whether the actor keeps going after a request
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    Continue,
    End,
}

/// Why `run` returned
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExitReason {
    EndSession,
    Deadline,
    ChannelClosed,
}

struct ControlLink {
    sender: mpsc::Sender<String>,
    writer: JoinHandle<()>,
}

pub struct SessionProcess {
    info: SessionInfo,
    tree: LoopTree,
    sounds: SoundRegistry,
    accounts: BTreeSet<String>,
    control: Option<ControlLink>,
}

impl SessionProcess {
    pub fn new(info: SessionInfo, sounds_dir: impl Into<PathBuf>) -> Self {
        let tree = LoopTree::new(info.max_depth, info.max_width);
        Self {
            info,
            tree,
            sounds: SoundRegistry::new(sounds_dir),
            accounts: BTreeSet::new(),
            control: None,
        }
    }

    pub fn info(&self) -> &SessionInfo {
        &self.info
    }

    pub fn tree(&self) -> &LoopTree {
        &self.tree
    }

    pub fn sounds(&self) -> &SoundRegistry {
        &self.sounds
    }

    pub fn connected_accounts(&self) -> Vec<String> {
        self.accounts.iter().cloned().collect()
    }

    /// Answer one control-socket line
    ///
    /// Never fails: unparseable input becomes an error reply, addressed to
    /// the caller's correlation id when one could be read.
    pub fn handle_frame(&mut self, raw: &str) -> (CorrelatedFrame, Outcome) {
        let frame = match CorrelatedFrame::parse(raw) {
            Ok(frame) => frame,
            Err(e) => {
                warn!("Unparseable control frame: {}", e);
                let cid = e
                    .correlation_id()
                    .map(CorrelationId::new)
                    .unwrap_or_else(CorrelationId::unsolicited);
                let payload = error_reply(e.to_string(), &self.connected_accounts());
                return (CorrelatedFrame::new(cid, payload), Outcome::Continue);
            }
        };

        let request = match WorkerRequest::from_value(&frame.payload) {
            Ok(request) => request,
            Err(e) => {
                debug!("Rejected request {}: {}", frame.payload, e);
                let payload = error_reply(e.to_string(), &self.connected_accounts());
                return (
                    CorrelatedFrame::new(frame.correlation_id, payload),
                    Outcome::Continue,
                );
            }
        };

        let name = request.name();
        let (payload, outcome) = match self.handle_request(request) {
            Ok((res, outcome)) => (reply(res, &self.connected_accounts()), outcome),
            Err(e) => {
                debug!("{} failed: {}", name, e);
                (error_reply(e.to_string(), &self.connected_accounts()), Outcome::Continue)
            }
        };
        (CorrelatedFrame::new(frame.correlation_id, payload), outcome)
    }

    /// Apply one request and build its `res` body
    pub fn handle_request(&mut self, request: WorkerRequest) -> Result<(Map<String, Value>, Outcome)> {
        let mut res = Map::new();
        let mut outcome = Outcome::Continue;

        match request {
            WorkerRequest::Info => {
                res.insert("info".into(), json!(self.info));
            }
            WorkerRequest::Nodes => {
                res.insert("nodes".into(), json!(self.tree.summaries()));
            }
            WorkerRequest::Sounds => {
                res.insert("sounds".into(), json!(self.sounds.list()));
            }
            WorkerRequest::Chain => {
                res.insert("chain".into(), self.chain_value());
            }
            WorkerRequest::AddAccount(account) => {
                if self.accounts.insert(account.clone()) {
                    info!("Account {} joined", account);
                }
                res.insert("addedAccount".into(), json!(account));
            }
            WorkerRequest::DeleteAccount(account) => {
                if self.accounts.remove(&account) {
                    info!("Account {} left", account);
                }
                res.insert("deletedAccount".into(), json!(account));
            }
            WorkerRequest::EndSession => {
                info!("Session {} ended on request", self.info.session_id);
                res.insert("endSession".into(), json!(true));
                outcome = Outcome::End;
            }
            WorkerRequest::AddNode { parent } => {
                let uid = self.tree.add_node(parent.as_deref())?;
                let parent = parent.unwrap_or_else(|| self.tree.root_uid().to_string());
                res.insert("addedNode".into(), self.summary(&uid)?);
                res.insert("updatedNode".into(), self.summary(&parent)?);
            }
            WorkerRequest::DeleteNode(uid) => {
                let removed = self.tree.delete_node(&uid)?;
                self.sounds.release(&removed.orphaned_sounds);
                res.insert("deletedNode".into(), json!(uid));
                res.insert("deletedNodes".into(), json!(removed.removed));
                res.insert("updatedNode".into(), self.summary(&removed.parent)?);
                if !removed.orphaned_sounds.is_empty() {
                    res.insert("releasedSounds".into(), json!(removed.orphaned_sounds));
                }
            }
            WorkerRequest::SelectNode(uid) => {
                let parent = self.tree.select_node(&uid)?;
                res.insert("updatedNode".into(), self.summary(&parent)?);
                res.insert("chain".into(), self.chain_value());
            }
            WorkerRequest::AssignSound { sound, to_node } => {
                let change = self.sounds.assign(&mut self.tree, &sound, &to_node)?;
                res.insert("soundNodeChange".into(), json!(change));
            }
            WorkerRequest::UpsertSound(params) => {
                let result = self.sounds.upsert(&mut self.tree, params)?;
                let key = if result.created { "addedSound" } else { "updatedSound" };
                res.insert(key.into(), json!(result.sound));
                if let Some(change) = result.node_change {
                    res.insert("soundNodeChange".into(), json!(change));
                }
            }
            WorkerRequest::DeleteSound(uid) => {
                let sound = self.sounds.delete(&mut self.tree, &uid)?;
                res.insert("deletedSound".into(), json!(uid));
                if let Some(node) = sound.node_uid {
                    res.insert("updatedNode".into(), self.summary(&node)?);
                }
            }
        }

        Ok((res, outcome))
    }

    /// Unsolicited broadcast after an upload completes
    pub fn upload_notice(&self, file_id: &str) -> CorrelatedFrame {
        let mut res = Map::new();
        res.insert("uploadedSoundFile".into(), json!(file_id));
        CorrelatedFrame::unsolicited(reply(res, &self.connected_accounts()))
    }

    fn summary(&self, uid: &str) -> Result<Value> {
        self.tree
            .get(uid)
            .map(|node| json!(node.summary()))
            .ok_or_else(|| JamError::NodeNotFound(uid.to_string()))
    }

    fn chain_value(&self) -> Value {
        let chain: Vec<_> = self.tree.chain().iter().map(|n| n.summary()).collect();
        json!(chain)
    }

    /// Drive the actor until the session ends
    pub async fn run(mut self, mut events: mpsc::Receiver<WorkerEvent>, deadline: Instant) -> ExitReason {
        let sleep = tokio::time::sleep_until(deadline);
        tokio::pin!(sleep);

        let reason = loop {
            tokio::select! {
                _ = &mut sleep => {
                    info!("Session {} reached its deadline", self.info.session_id);
                    break ExitReason::Deadline;
                }
                event = events.recv() => {
                    let Some(event) = event else {
                        break ExitReason::ChannelClosed;
                    };
                    if self.on_event(event).await == Outcome::End {
                        break ExitReason::EndSession;
                    }
                }
            }
        };

        self.close_control().await;
        reason
    }

    async fn on_event(&mut self, event: WorkerEvent) -> Outcome {
        match event {
            WorkerEvent::ControlAttached { sender, writer } => {
                let link = ControlLink { sender, writer };
                if let Some(old) = self.control.replace(link) {
                    info!("Control connection replaced");
                    old.writer.abort();
                }
                Outcome::Continue
            }
            WorkerEvent::Frame(raw) => {
                let (reply, outcome) = self.handle_frame(&raw);
                self.emit(reply).await;
                outcome
            }
            WorkerEvent::UploadComplete { file_id, bytes } => {
                info!("Upload of {} complete ({} bytes)", file_id, bytes);
                let notice = self.upload_notice(&file_id);
                self.emit(notice).await;
                Outcome::Continue
            }
        }
    }

    async fn emit(&mut self, frame: CorrelatedFrame) {
        let Some(link) = &self.control else {
            debug!("No control connection, dropping {}", frame.correlation_id);
            return;
        };
        if link.sender.send(frame.encode()).await.is_err() {
            warn!("Control connection closed");
            self.control = None;
        }
    }

    /// Let queued replies reach the orchestrator before exiting
    async fn close_control(&mut self) {
        if let Some(ControlLink { sender, writer }) = self.control.take() {
            drop(sender);
            if tokio::time::timeout(FLUSH_TIMEOUT, writer).await.is_err() {
                warn!("Control writer did not finish within {:?}", FLUSH_TIMEOUT);
            }
        }
    }
}
