//! Auth session registry
//!
//! Maps opaque tokens to auth sessions and keeps a reverse index from
//! account id to its single live token. A token may be bound to one browser
//! link, which is how notices and session responses reach that account.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use rand::distributions::Alphanumeric;
use rand::Rng;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use jam_protocol::{ServerFrame, SessionNotice};
use jam_utils::{JamError, Result};

/// Length of issued tokens
pub const TOKEN_LEN: usize = 32;

/// Identifier of one browser link
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct LinkId(u64);

impl LinkId {
    pub fn value(&self) -> u64 {
        self.0
    }
}

impl std::fmt::Display for LinkId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "Link({})", self.0)
    }
}

/// Sending half of a browser link
#[derive(Debug, Clone)]
pub struct ClientLink {
    id: LinkId,
    sender: mpsc::Sender<String>,
}

/// What happened to a best-effort send
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Delivery {
    Sent,
    /// Queue full; the frame was dropped but the link is alive
    Dropped,
    Closed,
}

impl ClientLink {
    pub fn new(id: LinkId, sender: mpsc::Sender<String>) -> Self {
        Self { id, sender }
    }

    pub fn id(&self) -> LinkId {
        self.id
    }

    pub fn is_open(&self) -> bool {
        !self.sender.is_closed()
    }

    pub fn send(&self, frame: &ServerFrame) -> Delivery {
        match self.sender.try_send(frame.encode()) {
            Ok(()) => Delivery::Sent,
            Err(mpsc::error::TrySendError::Full(_)) => {
                warn!("{} is not keeping up, dropping frame", self.id);
                Delivery::Dropped
            }
            Err(mpsc::error::TrySendError::Closed(_)) => Delivery::Closed,
        }
    }
}

/// One issued token
#[derive(Debug, Clone)]
pub struct AuthSession {
    pub token: String,
    pub expires_at: DateTime<Utc>,
    pub account_id: Option<String>,
    pub connection: Option<ClientLink>,
}

/// Outcome of a prune sweep
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PruneReport {
    /// Tokens dropped because their link had closed
    pub removed_closed: Vec<String>,
    /// Tokens dropped because they expired
    pub removed_expired: Vec<String>,
    /// Live links that were pinged
    pub pinged: usize,
}

impl PruneReport {
    pub fn removed(&self) -> usize {
        self.removed_closed.len() + self.removed_expired.len()
    }
}

/// Registry of all auth sessions
///
/// Thread-safe for concurrent access from link handler tasks.
pub struct AuthRegistry {
    /// Token -> auth session
    sessions: DashMap<String, AuthSession>,
    /// Account id -> token (reverse index)
    accounts: DashMap<String, String>,
    ttl: chrono::Duration,
    next_link_id: AtomicU64,
}

impl AuthRegistry {
    pub fn new(ttl: Duration) -> Self {
        Self {
            sessions: DashMap::new(),
            accounts: DashMap::new(),
            ttl: chrono::Duration::from_std(ttl).unwrap_or_else(|_| chrono::Duration::minutes(15)),
            next_link_id: AtomicU64::new(1),
        }
    }

    /// Allocate an id for a new browser link
    pub fn next_link_id(&self) -> LinkId {
        LinkId(self.next_link_id.fetch_add(1, Ordering::SeqCst))
    }

    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }

    /// Issue a fresh token, optionally tied to an account
    ///
    /// An account holds at most one token; issuing another revokes the old one.
    pub fn issue(&self, account_id: Option<&str>, now: DateTime<Utc>) -> AuthSession {
        let token = self.fresh_token();
        let session = AuthSession {
            token: token.clone(),
            expires_at: now + self.ttl,
            account_id: account_id.map(str::to_string),
            connection: None,
        };
        self.sessions.insert(token.clone(), session.clone());

        if let Some(account) = account_id {
            let previous = self.accounts.insert(account.to_string(), token);
            if let Some(old) = previous {
                debug!("Account {} re-issued, revoking previous token", account);
                self.remove_token(&old, Some(SessionNotice::LoggedOff));
            }
        }

        session
    }

    /// Check a token, sliding its expiry forward
    pub fn validate(&self, token: &str, now: DateTime<Utc>) -> Result<AuthSession> {
        {
            let mut entry = self
                .sessions
                .get_mut(token)
                .ok_or(JamError::AuthSessionNotFound)?;
            if entry.expires_at >= now {
                entry.expires_at = now + self.ttl;
                return Ok(entry.value().clone());
            }
        }

        self.remove_token(token, Some(SessionNotice::Expired));
        Err(JamError::AuthSessionExpired)
    }

    /// Attach (or replace) the live link for a token
    ///
    /// Returns false when the token is unknown.
    pub fn bind_connection(&self, token: &str, link: ClientLink) -> bool {
        match self.sessions.get_mut(token) {
            Some(mut entry) => {
                debug!("Bound {} to token", link.id());
                entry.connection = Some(link);
                true
            }
            None => false,
        }
    }

    /// Drop a token, telling its link it has been logged off
    pub fn revoke(&self, token: &str) -> bool {
        self.remove_token(token, Some(SessionNotice::LoggedOff))
            .is_some()
    }

    /// Current token of an account
    pub fn token_for(&self, account_id: &str) -> Option<String> {
        self.accounts.get(account_id).map(|t| t.value().clone())
    }

    /// Open link the account's token is currently bound to
    pub fn account_link(&self, account_id: &str) -> Option<LinkId> {
        let token = self.token_for(account_id)?;
        let entry = self.sessions.get(&token)?;
        entry
            .connection
            .as_ref()
            .filter(|link| link.is_open())
            .map(ClientLink::id)
    }

    pub fn get(&self, token: &str) -> Option<AuthSession> {
        self.sessions.get(token).map(|s| s.value().clone())
    }

    /// Best-effort delivery to the link bound to `token`
    pub fn send_to_token(&self, token: &str, frame: &ServerFrame) -> bool {
        let Some(mut entry) = self.sessions.get_mut(token) else {
            return false;
        };
        let delivery = match &entry.connection {
            Some(link) => link.send(frame),
            None => return false,
        };
        if delivery == Delivery::Closed {
            debug!("Clearing closed link on token");
            entry.connection = None;
        }
        delivery == Delivery::Sent
    }

    /// Best-effort delivery to whatever link the account is bound to
    pub fn send_to_account(&self, account_id: &str, frame: &ServerFrame) -> bool {
        match self.token_for(account_id) {
            Some(token) => self.send_to_token(&token, frame),
            None => false,
        }
    }

    /// Sweep the registry
    ///
    /// Entries whose link has closed or whose expiry has passed are removed
    /// (expired ones are told so first). Every remaining bound link is pinged.
    pub fn prune(&self, now: DateTime<Utc>) -> PruneReport {
        let mut report = PruneReport::default();
        let ping = ServerFrame::notice(SessionNotice::Ping);

        for entry in self.sessions.iter() {
            let session = entry.value();
            match &session.connection {
                Some(link) if !link.is_open() => {
                    report.removed_closed.push(session.token.clone());
                }
                _ if session.expires_at < now => {
                    report.removed_expired.push(session.token.clone());
                }
                Some(link) => {
                    if link.send(&ping) == Delivery::Sent {
                        report.pinged += 1;
                    }
                }
                None => {}
            }
        }

        // Removal happens after iteration; DashMap shards are locked while iterating
        for token in &report.removed_closed {
            self.remove_token(token, None);
        }
        for token in &report.removed_expired {
            self.remove_token(token, Some(SessionNotice::Expired));
        }

        report
    }

    fn remove_token(&self, token: &str, notice: Option<SessionNotice>) -> Option<AuthSession> {
        let (_, session) = self.sessions.remove(token)?;

        if let Some(account) = session.account_id.as_deref() {
            self.accounts.remove_if(account, |_, t| t == token);
        }
        if let (Some(notice), Some(link)) = (notice, session.connection.as_ref()) {
            link.send(&ServerFrame::notice(notice));
        }
        Some(session)
    }

    fn fresh_token(&self) -> String {
        loop {
            let token: String = rand::thread_rng()
                .sample_iter(&Alphanumeric)
                .take(TOKEN_LEN)
                .map(char::from)
                .collect();
            if !self.sessions.contains_key(&token) {
                return token;
            }
        }
    }
}

/// Time from `now` until the next wall-clock multiple of `phase`
pub fn delay_until_aligned(now: DateTime<Utc>, phase: Duration) -> Duration {
    let phase_ms = phase.as_millis().max(1) as i64;
    let offset = now.timestamp_millis().rem_euclid(phase_ms);
    if offset == 0 {
        Duration::ZERO
    } else {
        Duration::from_millis((phase_ms - offset) as u64)
    }
}

/// Run `prune` on a phase-aligned schedule until cancelled
pub fn spawn_prune_task(
    registry: Arc<AuthRegistry>,
    interval: Duration,
    phase: Duration,
    mut cancel_rx: oneshot::Receiver<()>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let start = tokio::time::Instant::now() + delay_until_aligned(Utc::now(), phase);
        let mut ticker = tokio::time::interval_at(start, interval);

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    let report = registry.prune(Utc::now());
                    if report.removed() > 0 {
                        info!(
                            closed = report.removed_closed.len(),
                            expired = report.removed_expired.len(),
                            pinged = report.pinged,
                            "Pruned auth sessions"
                        );
                    } else {
                        debug!(pinged = report.pinged, "Prune sweep");
                    }
                }
                _ = &mut cancel_rx => {
                    debug!("Prune task stopped");
                    break;
                }
            }
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn registry() -> AuthRegistry {
        AuthRegistry::new(Duration::from_secs(15 * 60))
    }

    fn link(registry: &AuthRegistry) -> (ClientLink, mpsc::Receiver<String>) {
        let (tx, rx) = mpsc::channel(16);
        (ClientLink::new(registry.next_link_id(), tx), rx)
    }

    #[test]
    fn test_issue_then_validate_returns_same_account() {
        let registry = registry();
        let now = Utc::now();

        let named = registry.issue(Some("alice"), now);
        assert_eq!(named.token.len(), TOKEN_LEN);
        assert!(named.token.chars().all(|c| c.is_ascii_alphanumeric()));
        let checked = registry.validate(&named.token, now).unwrap();
        assert_eq!(checked.account_id.as_deref(), Some("alice"));

        let anon = registry.issue(None, now);
        assert!(registry.validate(&anon.token, now).unwrap().account_id.is_none());
        assert_ne!(named.token, anon.token);
    }

    #[test]
    fn test_validate_slides_expiry() {
        let registry = registry();
        let now = Utc::now();
        let session = registry.issue(None, now);

        let later = now + chrono::Duration::minutes(10);
        let refreshed = registry.validate(&session.token, later).unwrap();
        assert_eq!(refreshed.expires_at, later + chrono::Duration::minutes(15));

        // Would have expired without the refresh
        let after = now + chrono::Duration::minutes(20);
        assert!(registry.validate(&session.token, after).is_ok());
    }

    #[test]
    fn test_validate_unknown_and_expired() {
        let registry = registry();
        let now = Utc::now();
        assert!(matches!(
            registry.validate("nope", now),
            Err(JamError::AuthSessionNotFound)
        ));

        let session = registry.issue(Some("bob"), now);
        let late = now + chrono::Duration::minutes(16);
        assert!(matches!(
            registry.validate(&session.token, late),
            Err(JamError::AuthSessionExpired)
        ));
        assert!(registry.get(&session.token).is_none());
        assert!(registry.token_for("bob").is_none());
    }

    #[test]
    fn test_reissue_revokes_previous_token() {
        let registry = registry();
        let now = Utc::now();
        let first = registry.issue(Some("alice"), now);
        let (l, mut rx) = link(&registry);
        registry.bind_connection(&first.token, l);

        let second = registry.issue(Some("alice"), now);
        assert!(registry.get(&first.token).is_none());
        assert_eq!(registry.token_for("alice"), Some(second.token));
        assert_eq!(rx.try_recv().unwrap(), r#"ses:-1:{"loggedOff":true}"#);
    }

    #[test]
    fn test_bind_unknown_token_is_noop() {
        let registry = registry();
        let (l, _rx) = link(&registry);
        assert!(!registry.bind_connection("missing", l));
        assert!(registry.is_empty());
    }

    #[test]
    fn test_account_link_follows_rebind() {
        let registry = registry();
        let session = registry.issue(Some("alice"), Utc::now());
        assert!(registry.account_link("alice").is_none());

        let (first, _first_rx) = link(&registry);
        let first_id = first.id();
        registry.bind_connection(&session.token, first);
        assert_eq!(registry.account_link("alice"), Some(first_id));

        let (second, second_rx) = link(&registry);
        let second_id = second.id();
        registry.bind_connection(&session.token, second);
        assert_eq!(registry.account_link("alice"), Some(second_id));

        drop(second_rx);
        assert!(registry.account_link("alice").is_none());
        assert!(registry.account_link("bob").is_none());
    }

    #[test]
    fn test_revoke_notifies_and_clears_index() {
        let registry = registry();
        let session = registry.issue(Some("0"), Utc::now());
        let (l, mut rx) = link(&registry);
        registry.bind_connection(&session.token, l);

        assert!(registry.revoke(&session.token));
        assert_eq!(rx.try_recv().unwrap(), r#"ses:-1:{"loggedOff":true}"#);
        // A falsy-looking account id is still removed from the index
        assert!(registry.token_for("0").is_none());
        assert!(!registry.revoke(&session.token));
    }

    #[test]
    fn test_prune_removes_exactly_expired_and_closed() {
        let registry = registry();
        let now = Utc::now();

        let fresh = registry.issue(Some("fresh"), now);
        let (fresh_link, mut fresh_rx) = link(&registry);
        registry.bind_connection(&fresh.token, fresh_link);

        let closed = registry.issue(Some("closed"), now);
        let (closed_link, closed_rx) = link(&registry);
        registry.bind_connection(&closed.token, closed_link);
        drop(closed_rx);

        let stale = registry.issue(Some("stale"), now - chrono::Duration::minutes(30));
        let (stale_link, mut stale_rx) = link(&registry);
        registry.bind_connection(&stale.token, stale_link);

        let unbound = registry.issue(None, now);

        let report = registry.prune(now);
        assert_eq!(report.removed_closed, vec![closed.token.clone()]);
        assert_eq!(report.removed_expired, vec![stale.token.clone()]);
        assert_eq!(report.pinged, 1);

        assert!(registry.get(&fresh.token).is_some());
        assert!(registry.get(&unbound.token).is_some());
        assert!(registry.get(&closed.token).is_none());
        assert!(registry.get(&stale.token).is_none());

        // Reverse index follows the forward entries
        assert!(registry.token_for("fresh").is_some());
        assert!(registry.token_for("closed").is_none());
        assert!(registry.token_for("stale").is_none());

        assert_eq!(fresh_rx.try_recv().unwrap(), r#"ses:-1:{"ping":true}"#);
        assert_eq!(stale_rx.try_recv().unwrap(), r#"ses:-1:{"expired":true}"#);
    }

    #[test]
    fn test_send_to_account_clears_closed_link() {
        let registry = registry();
        let session = registry.issue(Some("carol"), Utc::now());
        let (l, rx) = link(&registry);
        registry.bind_connection(&session.token, l);

        let frame = ServerFrame::notice(SessionNotice::Ping);
        assert!(registry.send_to_account("carol", &frame));

        drop(rx);
        assert!(!registry.send_to_account("carol", &frame));
        assert!(registry.get(&session.token).unwrap().connection.is_none());
        // The auth session itself survives
        assert!(registry.token_for("carol").is_some());
        assert!(!registry.send_to_account("nobody", &frame));
    }

    #[test]
    fn test_delay_until_aligned() {
        let phase = Duration::from_secs(10);
        let on_boundary = Utc.timestamp_opt(1_700_000_000, 0).unwrap();
        assert_eq!(delay_until_aligned(on_boundary, phase), Duration::ZERO);

        let past = on_boundary + chrono::Duration::milliseconds(3_250);
        assert_eq!(delay_until_aligned(past, phase), Duration::from_millis(6_750));
    }

    #[tokio::test]
    async fn test_prune_task_stops_on_cancel() {
        let registry = Arc::new(registry());
        let (cancel_tx, cancel_rx) = oneshot::channel();
        let handle = spawn_prune_task(
            Arc::clone(&registry),
            Duration::from_millis(10),
            Duration::from_millis(10),
            cancel_rx,
        );
        cancel_tx.send(()).unwrap();
        handle.await.unwrap();
    }
}
