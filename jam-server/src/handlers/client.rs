//! Browser links
//!
//! Each WebSocket link gets a writer task fed by an mpsc queue; that queue's
//! sender is the `ClientLink` the auth registry binds to tokens, so every
//! frame for a link (replies, fan-out, notices) leaves through one FIFO.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;

use chrono::Utc;
use futures::{SinkExt, StreamExt};
use serde_json::json;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{broadcast, mpsc};
use tokio_tungstenite::tungstenite::Message;
use tracing::{debug, error, info, warn};

use jam_protocol::{
    ClientFrame, CorrelationId, CreateSessionParams, JamRequest, ServerFrame, SessionNotice,
    SessionRequest, WorkerRequest,
};
use jam_utils::{JamError, Result};

use super::ServerContext;
use crate::auth::ClientLink;

/// Frames buffered per browser link
const LINK_QUEUE: usize = 256;

/// Per-link bookkeeping
pub struct LinkState {
    link: ClientLink,
    token: Option<String>,
    /// Session id -> account this link added to it
    joined: HashMap<String, String>,
}

impl LinkState {
    pub fn new(link: ClientLink) -> Self {
        Self {
            link,
            token: None,
            joined: HashMap::new(),
        }
    }
}

/// Accept browser links until shutdown
pub async fn serve_clients(
    listener: TcpListener,
    ctx: Arc<ServerContext>,
    mut shutdown_rx: broadcast::Receiver<()>,
) {
    loop {
        tokio::select! {
            result = listener.accept() => {
                match result {
                    Ok((stream, peer_addr)) => {
                        let ctx = Arc::clone(&ctx);
                        tokio::spawn(async move {
                            handle_link(stream, peer_addr, ctx).await;
                        });
                    }
                    Err(e) => {
                        error!("Client accept error: {}", e);
                    }
                }
            }
            _ = shutdown_rx.recv() => {
                info!("Shutdown signal received, stopping client listener");
                break;
            }
        }
    }
}

async fn handle_link(stream: TcpStream, peer_addr: SocketAddr, ctx: Arc<ServerContext>) {
    let ws = match tokio_tungstenite::accept_async(stream).await {
        Ok(ws) => ws,
        Err(e) => {
            debug!("WebSocket handshake with {} failed: {}", peer_addr, e);
            return;
        }
    };
    let (mut sink, mut source) = ws.split();
    let (tx, mut rx) = mpsc::channel::<String>(LINK_QUEUE);
    let link = ClientLink::new(ctx.auth.next_link_id(), tx);
    info!("{} connected from {}", link.id(), peer_addr);

    let writer = tokio::spawn(async move {
        while let Some(text) = rx.recv().await {
            if let Err(e) = sink.send(Message::Text(text)).await {
                debug!("Link write failed: {}", e);
                break;
            }
        }
        let _ = sink.close().await;
    });

    let mut state = LinkState::new(link);
    while let Some(message) = source.next().await {
        match message {
            Ok(Message::Text(text)) => {
                if let Some(reply) = handle_text(&ctx, &mut state, &text).await {
                    state.link.send(&reply);
                }
            }
            Ok(Message::Close(_)) => break,
            Ok(_) => continue,
            Err(e) => {
                debug!("{} read failed: {}", state.link.id(), e);
                break;
            }
        }
    }

    on_link_closed(&ctx, &state).await;
    // Tokens bound to this link see it closed once the receiver is gone
    writer.abort();
    info!("{} disconnected", state.link.id());
}

/// Handle one text frame; the return value is the immediate reply, if any
pub async fn handle_text(
    ctx: &Arc<ServerContext>,
    state: &mut LinkState,
    text: &str,
) -> Option<ServerFrame> {
    let frame = match ClientFrame::parse(text) {
        Ok(frame) => frame,
        Err(e) => {
            debug!("Bad frame from {}: {}", state.link.id(), e);
            let cid = e
                .correlation_id()
                .map(CorrelationId::new)
                .unwrap_or_else(CorrelationId::unsolicited);
            return Some(ServerFrame::jam_error(cid, None, e.to_string()));
        }
    };

    match frame {
        ClientFrame::Token(token) => {
            if ctx.auth.validate(&token, Utc::now()).is_ok()
                && ctx.auth.bind_connection(&token, state.link.clone())
            {
                state.token = Some(token);
                None
            } else {
                Some(ServerFrame::notice(SessionNotice::Expired))
            }
        }
        ClientFrame::Session {
            correlation_id,
            request,
        } => Some(handle_session(ctx, state, correlation_id, request)),
        ClientFrame::Jam {
            correlation_id,
            request,
        } => handle_jam(ctx, state, correlation_id, request).await,
    }
}

fn handle_session(
    ctx: &ServerContext,
    state: &mut LinkState,
    cid: CorrelationId,
    request: SessionRequest,
) -> ServerFrame {
    let account_id = match request {
        SessionRequest::Logout { token } => {
            let revoked = ctx.auth.revoke(&token);
            if state.token.as_deref() == Some(token.as_str()) {
                state.token = None;
            }
            debug!("Logout (revoked: {})", revoked);
            return ServerFrame::session(cid, json!({ "loggedOff": true }));
        }
        SessionRequest::Login { account_id } => {
            if let Err(e) = ctx.store.ensure_account(&account_id) {
                warn!("Failed to load account {}: {}", account_id, e);
                return ServerFrame::session(cid, json!({ "error": e.to_string() }));
            }
            Some(account_id)
        }
        SessionRequest::Anonymous => None,
    };

    let session = ctx.auth.issue(account_id.as_deref(), Utc::now());
    ctx.auth.bind_connection(&session.token, state.link.clone());
    state.token = Some(session.token.clone());
    info!("Issued token for {:?} on {}", account_id, state.link.id());

    ServerFrame::session(
        cid,
        json!({
            "token": session.token,
            "expiresAt": session.expires_at.to_rfc3339(),
            "accountId": session.account_id,
        }),
    )
}

async fn handle_jam(
    ctx: &Arc<ServerContext>,
    state: &mut LinkState,
    cid: CorrelationId,
    request: JamRequest,
) -> Option<ServerFrame> {
    let session_id = request.session_id.as_deref();
    let auth = match ctx.auth.validate(&request.token, Utc::now()) {
        Ok(auth) => auth,
        Err(e) => return Some(ServerFrame::jam_error(cid, session_id, e.to_string())),
    };
    ctx.auth.bind_connection(&request.token, state.link.clone());
    state.token = Some(request.token.clone());

    let Some(session_id) = session_id else {
        return create_session(ctx, state, cid, auth.account_id, &request);
    };

    let forwarded = match WorkerRequest::from_value(&request.req) {
        Ok(parsed) => authorize_request(ctx, session_id, auth.account_id.as_deref(), parsed),
        Err(e) => Err(JamError::protocol(e.to_string())),
    };
    let forwarded = match forwarded {
        Ok(forwarded) => forwarded,
        Err(e) => return Some(ServerFrame::jam_error(cid, Some(session_id), e.to_string())),
    };

    match &forwarded {
        WorkerRequest::AddAccount(account) => {
            if let Err(e) = ctx.workers.join(session_id, account) {
                return Some(ServerFrame::jam_error(cid, Some(session_id), e.to_string()));
            }
            state.joined.insert(session_id.to_string(), account.clone());
        }
        WorkerRequest::DeleteAccount(_) => {
            state.joined.remove(session_id);
        }
        _ => {}
    }

    let worker_cid = match ctx.router.register_request(session_id, &request.token, cid.clone()) {
        Ok(worker_cid) => worker_cid,
        Err(e) => return Some(ServerFrame::jam_error(cid, Some(session_id), e.to_string())),
    };
    if let Err(e) = ctx
        .workers
        .write(session_id, worker_cid.clone(), forwarded.to_value())
        .await
    {
        ctx.router.cancel_request(&worker_cid);
        return Some(ServerFrame::jam_error(cid, Some(session_id), e.to_string()));
    }
    None
}

/// `createSession` without a session id; provisioning runs in the background
fn create_session(
    ctx: &Arc<ServerContext>,
    state: &LinkState,
    cid: CorrelationId,
    owner: Option<String>,
    request: &JamRequest,
) -> Option<ServerFrame> {
    let params = match CreateSessionParams::from_request(&request.req) {
        Some(Ok(params)) => params,
        Some(Err(e)) => return Some(ServerFrame::jam_error(cid, None, e.to_string())),
        None => return Some(ServerFrame::jam_error(cid, None, "sessionId required")),
    };

    let ctx = Arc::clone(ctx);
    let link = state.link.clone();
    tokio::spawn(async move {
        let reply = match ctx.workers.provision(owner.as_deref(), params).await {
            Ok(session_id) => {
                ServerFrame::jam_response(cid, &session_id, json!({ "sessionId": session_id }))
            }
            Err(e) => {
                warn!("createSession failed: {}", e);
                ServerFrame::jam_error(cid, None, e.to_string())
            }
        };
        link.send(&reply);
    });
    None
}

/// Pin account fields to the authenticated account and check ownership
pub fn authorize_request(
    ctx: &ServerContext,
    session_id: &str,
    account_id: Option<&str>,
    request: WorkerRequest,
) -> Result<WorkerRequest> {
    let require_account = || {
        account_id
            .map(str::to_string)
            .ok_or_else(|| JamError::PermissionDenied("login required".into()))
    };

    match request {
        WorkerRequest::AddAccount(_) => Ok(WorkerRequest::AddAccount(require_account()?)),
        WorkerRequest::DeleteAccount(_) => Ok(WorkerRequest::DeleteAccount(require_account()?)),
        WorkerRequest::UpsertSound(mut params) => {
            params.account_id = account_id.map(str::to_string);
            Ok(WorkerRequest::UpsertSound(params))
        }
        WorkerRequest::EndSession => {
            let owner = ctx.router.owner(session_id);
            match (owner.as_deref(), account_id) {
                (Some(owner), Some(account)) if owner == account => Ok(WorkerRequest::EndSession),
                _ => Err(JamError::PermissionDenied(
                    "only the owner can end the session".into(),
                )),
            }
        }
        other => Ok(other),
    }
}

/// Memberships this link still speaks for
///
/// An account that has since been bound to another open link keeps its seat.
fn departures(ctx: &ServerContext, state: &LinkState) -> Vec<(String, String)> {
    state
        .joined
        .iter()
        .filter(|(session_id, account)| match ctx.auth.account_link(account) {
            Some(link) if link != state.link.id() => {
                debug!("{} moved to {}, keeping it in {}", account, link, session_id);
                false
            }
            _ => true,
        })
        .map(|(session_id, account)| (session_id.clone(), account.clone()))
        .collect()
}

/// Leave every session this link joined
async fn on_link_closed(ctx: &ServerContext, state: &LinkState) {
    for (session_id, account) in departures(ctx, state) {
        let leave = WorkerRequest::DeleteAccount(account.clone()).to_value();
        if let Err(e) = ctx
            .workers
            .write(&session_id, CorrelationId::unsolicited(), leave)
            .await
        {
            debug!("Could not remove {} from {}: {}", account, session_id, e);
        }
    }
}
