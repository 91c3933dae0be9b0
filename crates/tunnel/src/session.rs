//! Registry of live tunnel connections.

use std::sync::Arc;

use {
    dashmap::DashMap,
    tokio::sync::mpsc,
    tracing::debug,
};

use berth_protocol::{TunnelClaims, TunnelFrame};

/// One attached agent connection.
pub struct TunnelHandle {
    pub conn_id: String,
    pub claims: TunnelClaims,
    /// Outgoing frames toward the agent; the connection's write loop drains
    /// this.
    sender: mpsc::UnboundedSender<TunnelFrame>,
    /// In-flight exchanges: frames from the agent carrying this `id` are
    /// routed to the waiting forwarder.
    pending: DashMap<String, mpsc::UnboundedSender<TunnelFrame>>,
}

impl TunnelHandle {
    #[must_use]
    pub fn new(
        conn_id: String,
        claims: TunnelClaims,
        sender: mpsc::UnboundedSender<TunnelFrame>,
    ) -> Arc<Self> {
        Arc::new(Self {
            conn_id,
            claims,
            sender,
            pending: DashMap::new(),
        })
    }

    /// Queue a frame toward the agent. Returns false when the connection's
    /// write loop is gone.
    pub fn send(&self, frame: TunnelFrame) -> bool {
        self.sender.send(frame).is_ok()
    }

    /// Open a response channel for a fresh exchange id.
    #[must_use]
    pub fn register_exchange(&self, id: &str) -> mpsc::UnboundedReceiver<TunnelFrame> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.pending.insert(id.to_string(), tx);
        rx
    }

    pub fn finish_exchange(&self, id: &str) {
        self.pending.remove(id);
    }

    /// Route an agent frame to its exchange. Unmatched ids are dropped.
    pub fn route(&self, id: &str, frame: TunnelFrame) {
        if let Some(entry) = self.pending.get(id) {
            let _ = entry.send(frame);
        } else {
            debug!(conn_id = %self.conn_id, id, "frame for unknown exchange dropped");
        }
    }

    /// Abort every in-flight exchange (connection lost).
    pub fn abort_all(&self) {
        self.pending.clear();
    }
}

/// All live tunnels, addressable by workspace id and by subdomain.
#[derive(Default)]
pub struct TunnelSessions {
    by_workspace: DashMap<String, Arc<TunnelHandle>>,
    subdomain_to_workspace: DashMap<String, String>,
}

impl TunnelSessions {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Attach a connection, displacing any previous one for the workspace.
    pub fn attach(&self, handle: Arc<TunnelHandle>) {
        let workspace_id = handle.claims.workspace_id.clone();
        let subdomain = handle.claims.subdomain.clone();
        if let Some(old) = self.by_workspace.insert(workspace_id.clone(), handle) {
            old.abort_all();
        }
        self.subdomain_to_workspace.insert(subdomain, workspace_id);
    }

    /// Detach only if `conn_id` still owns the slot (a reconnect may have
    /// displaced it already).
    pub fn detach(&self, workspace_id: &str, conn_id: &str) -> bool {
        let removed = self
            .by_workspace
            .remove_if(workspace_id, |_, handle| handle.conn_id == conn_id);
        if let Some((_, handle)) = removed {
            handle.abort_all();
            self.subdomain_to_workspace
                .remove_if(&handle.claims.subdomain, |_, ws| ws == workspace_id);
            return true;
        }
        false
    }

    #[must_use]
    pub fn get(&self, workspace_id: &str) -> Option<Arc<TunnelHandle>> {
        self.by_workspace.get(workspace_id).map(|h| Arc::clone(&h))
    }

    #[must_use]
    pub fn get_by_subdomain(&self, subdomain: &str) -> Option<Arc<TunnelHandle>> {
        let workspace_id = self.subdomain_to_workspace.get(subdomain)?;
        self.get(&workspace_id)
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.by_workspace.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.by_workspace.is_empty()
    }
}

#[allow(clippy::unwrap_used)]
#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn claims(workspace: &str, subdomain: &str) -> TunnelClaims {
        TunnelClaims {
            workspace_id: workspace.into(),
            user_id: "user-1".into(),
            subdomain: subdomain.into(),
            exposed_ports: HashMap::new(),
            scope: berth_protocol::scopes::TUNNEL_CONNECT.into(),
            exp: 0,
        }
    }

    #[test]
    fn attach_and_resolve_by_subdomain() {
        let sessions = TunnelSessions::new();
        let (tx, _rx) = mpsc::unbounded_channel();
        sessions.attach(TunnelHandle::new("c1".into(), claims("ws-1", "demo"), tx));

        assert!(sessions.get("ws-1").is_some());
        assert_eq!(
            sessions.get_by_subdomain("demo").unwrap().claims.workspace_id,
            "ws-1"
        );
        assert!(sessions.get_by_subdomain("other").is_none());
    }

    #[test]
    fn reconnect_displaces_and_stale_detach_is_ignored() {
        let sessions = TunnelSessions::new();
        let (tx1, _rx1) = mpsc::unbounded_channel();
        let (tx2, _rx2) = mpsc::unbounded_channel();
        sessions.attach(TunnelHandle::new("c1".into(), claims("ws-1", "demo"), tx1));
        sessions.attach(TunnelHandle::new("c2".into(), claims("ws-1", "demo"), tx2));

        // The old connection's cleanup must not tear down the new session.
        assert!(!sessions.detach("ws-1", "c1"));
        assert_eq!(sessions.get("ws-1").unwrap().conn_id, "c2");

        assert!(sessions.detach("ws-1", "c2"));
        assert!(sessions.get("ws-1").is_none());
        assert!(sessions.get_by_subdomain("demo").is_none());
    }

    #[test]
    fn routing_reaches_registered_exchange() {
        let (tx, _rx) = mpsc::unbounded_channel();
        let handle = TunnelHandle::new("c1".into(), claims("ws-1", "demo"), tx);

        let mut exchange = handle.register_exchange("r1");
        handle.route("r1", TunnelFrame::data("r1", b"chunk", true));
        let frame = exchange.try_recv().unwrap();
        assert_eq!(frame.data_bytes(), b"chunk");

        // Unknown ids are dropped silently.
        handle.route("r2", TunnelFrame::data("r2", b"x", true));
        handle.finish_exchange("r1");
        handle.route("r1", TunnelFrame::data("r1", b"late", true));
        assert!(exchange.try_recv().is_err());
    }
}
