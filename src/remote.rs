//! Remote registry + HQ client (§4.I): federation between a central HQ
//! instance and its remote peers.
//!
//! Two halves live in this module, mirroring the HQ/remote asymmetry of
//! §3/§4.I:
//! - [`RemoteRegistry`] is the HQ-side store: add/remove/lookup/list plus a
//!   session-ownership map built from each remote's periodic session list.
//! - [`HqClient`] is the remote-side piece: registers with HQ on startup
//!   (HTTP Basic), deregisters on shutdown, retrying registration with
//!   exponential backoff the way the teacher's `ClaudeApiClient` retries API
//!   calls, generalized here to network registration (§4.I supplement).

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use reqwest::Client;
use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;

/// Registration retry floor (§4.I, §5).
pub const BACKOFF_FLOOR: Duration = Duration::from_millis(100);
/// Registration retry cap (§4.I, §5).
pub const BACKOFF_CAP: Duration = Duration::from_secs(30);

/// One remote peer as tracked by an HQ instance (§3).
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Remote {
    /// Stable identifier, chosen by the remote and reused across
    /// reconnects (§4.I).
    pub id: String,
    /// Human-readable name.
    pub display_name: String,
    /// URL HQ can reach this remote at.
    pub url: String,
    /// Bearer token HQ uses when calling back into this remote, set at
    /// registration time.
    pub bearer_token: String,
    /// Last time HQ heard from this remote.
    pub last_seen: DateTime<Utc>,
    /// Session ids this remote currently owns.
    pub owned_sessions: HashSet<String>,
}

impl Remote {
    /// Mark this remote as seen now and replace its owned-session set with
    /// what it just reported.
    pub fn observe(&mut self, owned_sessions: HashSet<String>, now: DateTime<Utc>) {
        self.last_seen = now;
        self.owned_sessions = owned_sessions;
    }
}

/// HQ-side store of registered remotes (§4.I).
#[derive(Debug, Default)]
pub struct RemoteRegistry {
    remotes: RwLock<HashMap<String, Remote>>,
}

impl RemoteRegistry {
    /// Create an empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Add or replace a remote (registration is idempotent per §4.I: the
    /// same id reused across reconnects simply overwrites).
    pub async fn add(&self, remote: Remote) {
        self.remotes.write().await.insert(remote.id.clone(), remote);
    }

    /// Remove a remote by id (DELETE `/api/remotes/{id}`).
    pub async fn remove(&self, id: &str) -> Option<Remote> {
        self.remotes.write().await.remove(id)
    }

    /// Look up a remote by id.
    pub async fn lookup(&self, id: &str) -> Option<Remote> {
        self.remotes.read().await.get(id).cloned()
    }

    /// List every registered remote.
    pub async fn list(&self) -> Vec<Remote> {
        self.remotes.read().await.values().cloned().collect()
    }

    /// Find which remote owns `session_id`, if any, per the ownership map
    /// built from each remote's periodic session list (§4.I).
    pub async fn owner_of(&self, session_id: &str) -> Option<String> {
        self.remotes
            .read()
            .await
            .values()
            .find(|remote| remote.owned_sessions.contains(session_id))
            .map(|remote| remote.id.clone())
    }

    /// Update a remote's last-seen timestamp and owned-session set from its
    /// periodic report.
    pub async fn record_heartbeat(&self, id: &str, owned_sessions: HashSet<String>, now: DateTime<Utc>) -> bool {
        let mut remotes = self.remotes.write().await;
        let Some(remote) = remotes.get_mut(id) else {
            return false;
        };
        remote.observe(owned_sessions, now);
        true
    }
}

/// Registration payload posted to HQ on startup (§4.I).
#[derive(Debug, Clone, Serialize)]
struct RegisterPayload<'a> {
    id: &'a str,
    name: &'a str,
    url: &'a str,
    token: &'a str,
}

/// Hand-rolled exponential backoff, doubling from [`BACKOFF_FLOOR`] and
/// capping at [`BACKOFF_CAP`] (§4.I, §5), mirroring the teacher's
/// `ClaudeApiClient::retry_with_backoff` shape.
#[derive(Debug, Clone, Copy)]
struct Backoff {
    delay: Duration,
}

impl Backoff {
    const fn new() -> Self {
        Self { delay: BACKOFF_FLOOR }
    }

    fn next_delay(&mut self) -> Duration {
        let current = self.delay;
        self.delay = (self.delay * 2).min(BACKOFF_CAP);
        current
    }
}

/// Remote-side client: registers with HQ, deregisters on shutdown, and
/// retries registration under transient network failure without ever
/// crashing the remote (§4.I).
#[derive(Debug)]
pub struct HqClient {
    http: Client,
    hq_url: String,
    id: String,
    display_name: String,
    self_url: String,
    basic_auth: (String, String),
    bearer_token: Arc<RwLock<String>>,
}

impl HqClient {
    /// Create a client that will register `id`/`display_name`/`self_url`
    /// with the HQ instance at `hq_url`, authenticating registration calls
    /// with `basic_auth` (username, password) — remote → HQ uses Basic
    /// auth, the opposite direction from the bearer token HQ is handed at
    /// registration time (§4.I auth asymmetry).
    ///
    /// # Panics
    ///
    /// Panics if the HTTP client cannot be built with the default
    /// configuration.
    #[must_use]
    #[expect(clippy::expect_used, reason = "default reqwest Client::builder configuration is infallible")]
    pub fn new(hq_url: String, id: String, display_name: String, self_url: String, basic_auth: (String, String)) -> Self {
        let http = Client::builder()
            .timeout(Duration::from_secs(10))
            .build()
            .expect("failed to build HQ HTTP client");
        Self {
            http,
            hq_url,
            id,
            display_name,
            self_url,
            basic_auth,
            bearer_token: Arc::new(RwLock::new(String::new())),
        }
    }

    /// The bearer token HQ issued at registration, for authenticating
    /// inbound calls from HQ.
    pub async fn bearer_token(&self) -> String {
        self.bearer_token.read().await.clone()
    }

    /// Register with HQ, retrying transient failures with exponential
    /// backoff up to `max_attempts` times. Registration is idempotent: the
    /// same id is reused across every attempt and every reconnect.
    ///
    /// # Errors
    ///
    /// Returns the last transport error if every attempt fails.
    pub async fn register(&self, max_attempts: u32) -> Result<(), reqwest::Error> {
        let mut backoff = Backoff::new();
        let mut attempts = 0;
        loop {
            attempts += 1;
            match self.try_register().await {
                Ok(token) => {
                    *self.bearer_token.write().await = token;
                    return Ok(());
                }
                Err(err) => {
                    if attempts >= max_attempts {
                        return Err(err);
                    }
                    tracing::warn!(attempt = attempts, error = %err, "HQ registration failed, retrying");
                    tokio::time::sleep(backoff.next_delay()).await;
                }
            }
        }
    }

    async fn try_register(&self) -> Result<String, reqwest::Error> {
        let payload = RegisterPayload {
            id: &self.id,
            name: &self.display_name,
            url: &self.self_url,
            token: &self.id,
        };
        let response = self
            .http
            .post(format!("{}/api/remotes", self.hq_url))
            .basic_auth(&self.basic_auth.0, Some(&self.basic_auth.1))
            .json(&payload)
            .send()
            .await?
            .error_for_status()?;
        #[derive(Deserialize)]
        struct RegisterResponse {
            token: String,
        }
        let body: RegisterResponse = response.json().await?;
        Ok(body.token)
    }

    /// Deregister from HQ on shutdown. Transport failures are logged but
    /// never propagated as fatal (§4.I: "never crash the remote").
    pub async fn deregister(&self) {
        let result = self
            .http
            .delete(format!("{}/api/remotes/{}", self.hq_url, self.id))
            .basic_auth(&self.basic_auth.0, Some(&self.basic_auth.1))
            .send()
            .await;
        if let Err(err) = result {
            tracing::warn!(error = %err, "HQ deregistration failed");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn remote(id: &str) -> Remote {
        Remote {
            id: id.to_owned(),
            display_name: id.to_owned(),
            url: format!("https://{id}.example"),
            bearer_token: "tok".to_owned(),
            last_seen: Utc::now(),
            owned_sessions: HashSet::new(),
        }
    }

    #[tokio::test]
    async fn add_lookup_list_remove_round_trip() {
        let registry = RemoteRegistry::new();
        registry.add(remote("r1")).await;
        assert!(registry.lookup("r1").await.is_some());
        assert_eq!(registry.list().await.len(), 1);
        assert!(registry.remove("r1").await.is_some());
        assert!(registry.lookup("r1").await.is_none());
    }

    #[tokio::test]
    async fn owner_of_finds_remote_holding_session() {
        let registry = RemoteRegistry::new();
        let mut r = remote("r1");
        r.owned_sessions.insert("sess-1".to_owned());
        registry.add(r).await;
        assert_eq!(registry.owner_of("sess-1").await.as_deref(), Some("r1"));
        assert_eq!(registry.owner_of("sess-2").await, None);
    }

    #[tokio::test]
    async fn record_heartbeat_updates_ownership_and_returns_false_for_unknown() {
        let registry = RemoteRegistry::new();
        registry.add(remote("r1")).await;
        let mut owned = HashSet::new();
        owned.insert("sess-9".to_owned());
        assert!(registry.record_heartbeat("r1", owned.clone(), Utc::now()).await);
        assert_eq!(registry.owner_of("sess-9").await.as_deref(), Some("r1"));
        assert!(!registry.record_heartbeat("unknown", owned, Utc::now()).await);
    }

    #[test]
    fn backoff_doubles_and_caps() {
        let mut backoff = Backoff::new();
        assert_eq!(backoff.next_delay(), BACKOFF_FLOOR);
        assert_eq!(backoff.next_delay(), BACKOFF_FLOOR * 2);
        for _ in 0..20 {
            backoff.next_delay();
        }
        assert_eq!(backoff.next_delay(), BACKOFF_CAP);
    }
}
