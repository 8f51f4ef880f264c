use std::sync::Arc;

use tokio::sync::{broadcast, RwLock};

/// Which transport, if any, currently carries the session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    /// Persistent WebSocket is up
    Connected,
    /// WebSocket unavailable, polling over HTTP
    Degraded,
}

impl std::fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConnectionState::Disconnected => write!(f, "disconnected"),
            ConnectionState::Connecting => write!(f, "connecting"),
            ConnectionState::Connected => write!(f, "connected"),
            ConnectionState::Degraded => write!(f, "degraded"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Transition {
    pub from: ConnectionState,
    pub to: ConnectionState,
}

#[derive(Debug)]
struct Inner {
    state: ConnectionState,
    terminal: bool,
}

/// Shared view of the session's connection state.
///
/// Only the session writes; everyone else reads or subscribes. Once
/// [`SessionState::terminate`] has run the state is pinned to `Disconnected`.
#[derive(Debug, Clone)]
pub struct SessionState {
    inner: Arc<RwLock<Inner>>,
    events: broadcast::Sender<Transition>,
}

impl Default for SessionState {
    fn default() -> Self {
        Self::new()
    }
}

impl SessionState {
    pub fn new() -> Self {
        let (events, _) = broadcast::channel(64);
        Self {
            inner: Arc::new(RwLock::new(Inner {
                state: ConnectionState::Disconnected,
                terminal: false,
            })),
            events,
        }
    }

    pub async fn current(&self) -> ConnectionState {
        self.inner.read().await.state
    }

    pub async fn is_terminal(&self) -> bool {
        self.inner.read().await.terminal
    }

    /// Receive every transition from now on.
    pub fn subscribe(&self) -> broadcast::Receiver<Transition> {
        self.events.subscribe()
    }

    /// Move to `to`. Returns false when nothing changed, either because the
    /// state already was `to` or because the session has terminated.
    pub(crate) async fn transition(&self, to: ConnectionState) -> bool {
        let mut inner = self.inner.write().await;
        if inner.terminal || inner.state == to {
            return false;
        }
        let from = inner.state;
        inner.state = to;
        drop(inner);

        tracing::info!(from = %from, to = %to, "Connection state changed");
        let _ = self.events.send(Transition { from, to });
        true
    }

    /// Final transition to `Disconnected`; every later transition is ignored.
    pub(crate) async fn terminate(&self) {
        let mut inner = self.inner.write().await;
        if inner.terminal {
            return;
        }
        let from = inner.state;
        inner.state = ConnectionState::Disconnected;
        inner.terminal = true;
        drop(inner);

        let to = ConnectionState::Disconnected;
        if from != to {
            tracing::info!(from = %from, to = %to, "Connection state changed");
            let _ = self.events.send(Transition { from, to });
        }
    }
}
