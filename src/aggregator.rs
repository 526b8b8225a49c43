//! Buffer aggregator (§4.G): multiplexes local and HQ-remote snapshot
//! streams to subscribing clients.
//!
//! The aggregator is intentionally transport-agnostic (§4.G, §1 scope): it
//! exposes subscribe-by-session-id-set over plain channels. The external
//! HTTP layer adapts [`ClientSubscription`] to `axum::extract::ws`, the way
//! the teacher's own `ws_console_handler` already wraps a per-session
//! broadcast channel (`console_handle.snapshot_and_subscribe()`) for its
//! own console feature — this module generalizes that pattern to many
//! sessions per client and an optional remote hop.
//!
//! Local lookup and the HQ-remote hop are both trait boundaries
//! ([`LocalSnapshotSource`], [`RemoteSnapshotSource`]), the same way
//! [`crate::git_ops::GitOps`] fixes the Git surface this crate depends on
//! without owning the implementation.

use std::collections::HashSet;
use std::sync::Arc;

use async_trait::async_trait;
use serde::Serialize;
use tokio::sync::{mpsc, watch};

use crate::remote::RemoteRegistry;
use crate::snapshot::BufferSnapshot;

/// Bound on a client's outbound channel (§4.G backpressure). Once full, the
/// aggregator drops the newest snapshot for the session that just changed
/// rather than block or reorder — the next change still gets a chance.
pub const CLIENT_CHANNEL_CAPACITY: usize = 8;

/// A frame delivered to an aggregator client: binary snapshot updates or
/// JSON control events (§4.G).
#[derive(Debug, Clone)]
pub enum ClientFrame {
    /// A changed buffer snapshot for one subscribed session.
    Snapshot {
        /// The session this snapshot belongs to.
        session_id: String,
        /// The snapshot itself.
        snapshot: Arc<BufferSnapshot>,
    },
    /// A control event, sent as a JSON text frame by the transport adapter.
    Control(ControlEvent),
}

/// JSON control events multiplexed alongside binary snapshot frames (§4.G).
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ControlEvent {
    /// Subscription to `session_id` is now active and will receive
    /// snapshots.
    Subscribed {
        /// The session id now subscribed.
        session_id: String,
    },
    /// `session_id` does not exist locally or on any registered remote.
    NotFound {
        /// The session id that could not be found.
        session_id: String,
    },
    /// The remote owning `session_id` went offline mid-subscription (§8
    /// scenario S6); the subscription for that session is terminated.
    RemoteUnavailable {
        /// The session id whose remote went away.
        session_id: String,
    },
}

/// Looks up a locally-hosted session's live snapshot feed.
#[async_trait]
pub trait LocalSnapshotSource: Send + Sync {
    /// Subscribe to `session_id`'s snapshot feed, if it is hosted locally.
    async fn subscribe(&self, session_id: &str) -> Option<watch::Receiver<Option<Arc<BufferSnapshot>>>>;
}

/// Opens (or reuses) an aggregated upstream connection to a remote and
/// subscribes to one of its sessions (§4.G, §4.I). Implementations own
/// connection pooling/reuse; the aggregator only asks for a per-session
/// feed.
#[async_trait]
pub trait RemoteSnapshotSource: Send + Sync {
    /// Subscribe to `session_id` on the remote identified by `remote_id`.
    /// Returns `None` if the remote is unreachable.
    async fn subscribe(&self, remote_id: &str, session_id: &str) -> Option<watch::Receiver<Option<Arc<BufferSnapshot>>>>;
}

/// Default remote snapshot source for a daemon with no HQ-remote transport
/// wired in: every lookup reports the remote unreachable. Streaming a
/// remote's actual snapshots over the network is part of the external
/// HTTP/WebSocket layer this crate does not implement (§1 scope); this
/// stands in until that layer is plugged in via [`Aggregator::new`].
#[derive(Debug, Default)]
pub struct NoRemoteSnapshotSource;

#[async_trait]
impl RemoteSnapshotSource for NoRemoteSnapshotSource {
    async fn subscribe(&self, _remote_id: &str, _session_id: &str) -> Option<watch::Receiver<Option<Arc<BufferSnapshot>>>> {
        None
    }
}

/// Multiplexes local and HQ-remote snapshot sources to subscribing
/// clients (§4.G).
pub struct Aggregator {
    local: Arc<dyn LocalSnapshotSource>,
    remote: Arc<dyn RemoteSnapshotSource>,
    remotes: Arc<RemoteRegistry>,
}

impl std::fmt::Debug for Aggregator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Aggregator").finish_non_exhaustive()
    }
}

impl Aggregator {
    /// Create an aggregator over a local snapshot source, an HQ-remote
    /// snapshot source, and the remote registry used to resolve ownership.
    #[must_use]
    pub fn new(local: Arc<dyn LocalSnapshotSource>, remote: Arc<dyn RemoteSnapshotSource>, remotes: Arc<RemoteRegistry>) -> Self {
        Self { local, remote, remotes }
    }

    /// Subscribe a client to `session_ids`. Each session resolves
    /// independently: local first, then HQ-remote ownership, else
    /// [`ControlEvent::NotFound`]. An initial snapshot is delivered
    /// immediately for every resolved session, then only on change (§4.G).
    pub async fn subscribe(&self, session_ids: HashSet<String>) -> mpsc::Receiver<ClientFrame> {
        let (tx, rx) = mpsc::channel(CLIENT_CHANNEL_CAPACITY.max(session_ids.len()));
        for session_id in session_ids {
            self.spawn_forwarder(session_id, tx.clone()).await;
        }
        rx
    }

    async fn spawn_forwarder(&self, session_id: String, tx: mpsc::Sender<ClientFrame>) {
        if let Some(feed) = self.local.subscribe(&session_id).await {
            let _ = tx
                .send(ClientFrame::Control(ControlEvent::Subscribed {
                    session_id: session_id.clone(),
                }))
                .await;
            tokio::spawn(forward_local(session_id, feed, tx));
            return;
        }

        if let Some(remote_id) = self.remotes.owner_of(&session_id).await {
            if let Some(feed) = self.remote.subscribe(&remote_id, &session_id).await {
                let _ = tx
                    .send(ClientFrame::Control(ControlEvent::Subscribed {
                        session_id: session_id.clone(),
                    }))
                    .await;
                tokio::spawn(forward_remote(session_id, feed, tx));
                return;
            }
            let _ = tx
                .send(ClientFrame::Control(ControlEvent::RemoteUnavailable { session_id }))
                .await;
            return;
        }

        let _ = tx.send(ClientFrame::Control(ControlEvent::NotFound { session_id })).await;
    }
}

async fn forward_local(
    session_id: String,
    mut feed: watch::Receiver<Option<Arc<BufferSnapshot>>>,
    tx: mpsc::Sender<ClientFrame>,
) {
    if let Some(snapshot) = feed.borrow().clone() {
        let _ = tx
            .try_send(ClientFrame::Snapshot { session_id: session_id.clone(), snapshot });
    }
    while feed.changed().await.is_ok() {
        let Some(snapshot) = feed.borrow().clone() else {
            continue;
        };
        // Latest-wins (§4.G, §5): a full client channel just drops this
        // emission rather than blocking or reordering.
        let _ = tx.try_send(ClientFrame::Snapshot {
            session_id: session_id.clone(),
            snapshot,
        });
    }
}

async fn forward_remote(
    session_id: String,
    mut feed: watch::Receiver<Option<Arc<BufferSnapshot>>>,
    tx: mpsc::Sender<ClientFrame>,
) {
    if let Some(snapshot) = feed.borrow().clone() {
        let _ = tx.try_send(ClientFrame::Snapshot { session_id: session_id.clone(), snapshot });
    }
    while feed.changed().await.is_ok() {
        let Some(snapshot) = feed.borrow().clone() else {
            continue;
        };
        let _ = tx.try_send(ClientFrame::Snapshot {
            session_id: session_id.clone(),
            snapshot,
        });
    }
    // The remote's feed task exited: treat as the remote going offline (§8
    // scenario S6).
    let _ = tx
        .send(ClientFrame::Control(ControlEvent::RemoteUnavailable { session_id }))
        .await;
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use tokio::sync::Mutex;

    struct FakeLocal {
        feeds: Mutex<HashMap<String, watch::Receiver<Option<Arc<BufferSnapshot>>>>>,
    }

    #[async_trait]
    impl LocalSnapshotSource for FakeLocal {
        async fn subscribe(&self, session_id: &str) -> Option<watch::Receiver<Option<Arc<BufferSnapshot>>>> {
            self.feeds.lock().await.get(session_id).cloned()
        }
    }

    struct NoRemote;

    #[async_trait]
    impl RemoteSnapshotSource for NoRemote {
        async fn subscribe(&self, _remote_id: &str, _session_id: &str) -> Option<watch::Receiver<Option<Arc<BufferSnapshot>>>> {
            None
        }
    }

    fn snapshot() -> Arc<BufferSnapshot> {
        Arc::new(BufferSnapshot::from_grid(1, 1, 0, 0, 0, vec![vec![crate::snapshot::Cell::blank()]]))
    }

    #[tokio::test]
    async fn subscribing_to_known_local_session_delivers_initial_snapshot() {
        let (_tx, rx) = watch::channel(Some(snapshot()));
        let mut feeds = HashMap::new();
        feeds.insert("sess-1".to_owned(), rx);
        let local = Arc::new(FakeLocal { feeds: Mutex::new(feeds) });
        let remote = Arc::new(NoRemote);
        let registry = Arc::new(RemoteRegistry::new());
        let aggregator = Aggregator::new(local, remote, registry);

        let mut client_rx = aggregator.subscribe(HashSet::from(["sess-1".to_owned()])).await;
        let first = client_rx.recv().await.unwrap();
        assert!(matches!(first, ClientFrame::Control(ControlEvent::Subscribed { .. })));
        let second = client_rx.recv().await.unwrap();
        assert!(matches!(second, ClientFrame::Snapshot { .. }));
    }

    #[tokio::test]
    async fn unknown_session_yields_not_found() {
        let local = Arc::new(FakeLocal { feeds: Mutex::new(HashMap::new()) });
        let remote = Arc::new(NoRemote);
        let registry = Arc::new(RemoteRegistry::new());
        let aggregator = Aggregator::new(local, remote, registry);

        let mut client_rx = aggregator.subscribe(HashSet::from(["ghost".to_owned()])).await;
        let event = client_rx.recv().await.unwrap();
        assert!(matches!(event, ClientFrame::Control(ControlEvent::NotFound { .. })));
    }
}
