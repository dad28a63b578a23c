//! Routing of worker replies to browser links
//!
//! Requests from a link are forwarded to the worker under a router-issued
//! correlation id. When the reply comes back, the requester gets it under
//! its own correlation id and every other connected member of the session
//! gets it as an unsolicited (`-1`) frame. The owner is always included,
//! even when not currently connected to the session.

use std::collections::{BTreeSet, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use dashmap::DashMap;
use serde_json::{json, Value};
use tracing::{debug, info, trace, warn};

use jam_protocol::{reply_connected_accounts, CorrelatedFrame, CorrelationId, ServerFrame};
use jam_utils::{JamError, Result};

use crate::auth::AuthRegistry;

/// Message sent to requests still in flight when their session closes
const SESSION_CLOSED: &str = "Session closed";

/// Membership view of one open session
#[derive(Debug, Clone, Default)]
pub struct SessionRoute {
    pub owner: Option<String>,
    pub connected: HashSet<String>,
}

impl SessionRoute {
    /// Connected members plus the owner
    fn recipients(&self) -> BTreeSet<String> {
        let mut recipients: BTreeSet<String> = self.connected.iter().cloned().collect();
        if let Some(owner) = &self.owner {
            recipients.insert(owner.clone());
        }
        recipients
    }
}

#[derive(Debug, Clone)]
struct PendingRequest {
    session_id: String,
    token: String,
    client_cid: CorrelationId,
}

pub struct MessageRouter {
    auth: Arc<AuthRegistry>,
    routes: DashMap<String, SessionRoute>,
    /// Worker correlation id -> original request
    pending: DashMap<u64, PendingRequest>,
    next_cid: AtomicU64,
}

impl MessageRouter {
    pub fn new(auth: Arc<AuthRegistry>) -> Self {
        Self {
            auth,
            routes: DashMap::new(),
            pending: DashMap::new(),
            next_cid: AtomicU64::new(1),
        }
    }

    pub fn open_session(&self, session_id: &str, owner: Option<&str>) {
        self.routes.insert(
            session_id.to_string(),
            SessionRoute {
                owner: owner.map(str::to_string),
                connected: HashSet::new(),
            },
        );
        debug!("Routing open for session {}", session_id);
    }

    pub fn is_open(&self, session_id: &str) -> bool {
        self.routes.contains_key(session_id)
    }

    pub fn owner(&self, session_id: &str) -> Option<String> {
        self.routes.get(session_id).and_then(|r| r.owner.clone())
    }

    pub fn connected_accounts(&self, session_id: &str) -> Vec<String> {
        let mut accounts: Vec<String> = self
            .routes
            .get(session_id)
            .map(|r| r.connected.iter().cloned().collect())
            .unwrap_or_default();
        accounts.sort();
        accounts
    }

    pub fn pending_requests(&self) -> usize {
        self.pending.len()
    }

    /// Remember a request and hand out the correlation id to forward it under
    pub fn register_request(
        &self,
        session_id: &str,
        token: &str,
        client_cid: CorrelationId,
    ) -> Result<CorrelationId> {
        if !self.is_open(session_id) {
            return Err(JamError::SessionNotFound(session_id.to_string()));
        }
        let id = self.next_cid.fetch_add(1, Ordering::SeqCst);
        self.pending.insert(
            id,
            PendingRequest {
                session_id: session_id.to_string(),
                token: token.to_string(),
                client_cid,
            },
        );
        Ok(CorrelationId::from(id))
    }

    /// Forget a request that never reached its worker
    pub fn cancel_request(&self, cid: &CorrelationId) {
        if let Ok(id) = cid.as_str().parse::<u64>() {
            self.pending.remove(&id);
        }
    }

    /// Deliver one frame read from a worker's control connection
    ///
    /// Returns the number of links the frame reached.
    pub fn on_worker_frame(&self, session_id: &str, raw: &str) -> usize {
        let frame = match CorrelatedFrame::parse(raw) {
            Ok(frame) => frame,
            Err(e) => {
                warn!("Unparseable frame from worker {}: {}", session_id, e);
                return 0;
            }
        };

        if let Some(accounts) = reply_connected_accounts(&frame.payload) {
            if let Some(mut route) = self.routes.get_mut(session_id) {
                route.connected = accounts.into_iter().collect();
            }
        }

        let requester = self.take_pending(session_id, &frame.correlation_id);

        if let Some(message) = frame.payload.get("error") {
            let message = message.as_str().map(str::to_string).unwrap_or_else(|| message.to_string());
            return match requester {
                Some(request) => {
                    let reply = ServerFrame::jam_error(request.client_cid, Some(session_id), message);
                    usize::from(self.auth.send_to_token(&request.token, &reply))
                }
                None => {
                    warn!("Worker {} reported: {}", session_id, message);
                    0
                }
            };
        }

        let res = frame.payload.get("res").cloned().unwrap_or(Value::Null);
        self.fan_out(session_id, requester, res)
    }

    /// Tear down routing for a session
    ///
    /// Requests still waiting for the worker are failed, then every
    /// previously connected member and the owner get a `closeSession` event.
    pub fn close_session(&self, session_id: &str) -> usize {
        let Some((_, route)) = self.routes.remove(session_id) else {
            return 0;
        };

        let orphaned: Vec<u64> = self
            .pending
            .iter()
            .filter(|entry| entry.session_id == session_id)
            .map(|entry| *entry.key())
            .collect();
        for id in orphaned {
            if let Some((_, request)) = self.pending.remove(&id) {
                let reply = ServerFrame::jam_error(request.client_cid, Some(session_id), SESSION_CLOSED);
                self.auth.send_to_token(&request.token, &reply);
            }
        }

        let event = ServerFrame::jam_response(
            CorrelationId::unsolicited(),
            session_id,
            json!({ "closeSession": session_id, "connectedAccounts": [] }),
        );
        let delivered = route
            .recipients()
            .iter()
            .filter(|account| self.auth.send_to_account(account, &event))
            .count();
        info!("Closed session {} ({} notified)", session_id, delivered);
        delivered
    }

    /// Drop every route and in-flight request
    pub fn clear(&self) {
        self.routes.clear();
        self.pending.clear();
    }

    fn take_pending(&self, session_id: &str, cid: &CorrelationId) -> Option<PendingRequest> {
        if cid.is_unsolicited() {
            return None;
        }
        let id = cid.as_str().parse::<u64>().ok()?;
        let (_, request) = self
            .pending
            .remove_if(&id, |_, request| request.session_id == session_id)?;
        Some(request)
    }

    fn fan_out(&self, session_id: &str, requester: Option<PendingRequest>, res: Value) -> usize {
        let Some(recipients) = self.routes.get(session_id).map(|r| r.recipients()) else {
            debug!("Dropping reply for closed session {}", session_id);
            return 0;
        };

        let mut delivered = 0;
        let mut skip_account = None;
        if let Some(request) = requester {
            skip_account = self.auth.get(&request.token).and_then(|s| s.account_id);
            let reply = ServerFrame::jam_response(request.client_cid, session_id, res.clone());
            if self.auth.send_to_token(&request.token, &reply) {
                delivered += 1;
            }
        }

        let broadcast = ServerFrame::jam_response(CorrelationId::unsolicited(), session_id, res);
        for account in recipients {
            if skip_account.as_deref() == Some(account.as_str()) {
                continue;
            }
            if self.auth.send_to_account(&account, &broadcast) {
                delivered += 1;
            } else {
                trace!("No live link for {} in session {}", account, session_id);
            }
        }
        delivered
    }
}
