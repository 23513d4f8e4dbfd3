//! Node directory: maps a node identity to its active tunnel session.

use std::net::SocketAddr;

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::Serialize;
use tracing::info;

use crate::registry::CorrelationRegistry;
use crate::session::{NodeId, Session, SessionId};
use crate::{Error, Result};

/// Directory entry for one node.
#[derive(Debug, Clone)]
pub struct NodeRoute {
    pub session: Session,
    pub registered_at: DateTime<Utc>,
    pub last_seen: DateTime<Utc>,
}

/// Serializable view of a route, for the directory query endpoints.
#[derive(Debug, Clone, Serialize)]
pub struct RouteInfo {
    pub node_id: NodeId,
    pub session_id: SessionId,
    pub peer_addr: Option<SocketAddr>,
    pub registered_at: DateTime<Utc>,
    pub last_seen: DateTime<Utc>,
}

/// Routes calls addressed to a node onto that node's tunnel. A node has at
/// most one route; rebinding replaces it and fails whatever was still
/// waiting on the superseded session.
#[derive(Clone)]
pub struct NodeDirectory {
    routes: std::sync::Arc<DashMap<NodeId, NodeRoute>>,
    registry: CorrelationRegistry,
}

impl NodeDirectory {
    pub fn new(registry: CorrelationRegistry) -> Self {
        Self {
            routes: std::sync::Arc::new(DashMap::new()),
            registry,
        }
    }

    pub fn registry(&self) -> &CorrelationRegistry {
        &self.registry
    }

    /// Point `session.node()` at `session`, returning the superseded session
    /// if the node already had one. The old session is closed and its
    /// pending calls are failed.
    pub fn bind(&self, session: Session) -> Option<Session> {
        let now = Utc::now();
        let node = session.node().clone();
        let route = NodeRoute {
            session,
            registered_at: now,
            last_seen: now,
        };

        let old = self.routes.insert(node.clone(), route)?.session;
        let evicted = self.registry.evict_session(old.id());
        old.close();
        info!(node = %node, old_session = %old.id(), evicted, "node reconnected, superseded old session");
        Some(old)
    }

    /// Remove every route that points at `session` and fail its pending
    /// calls. A newer session for the same node is left alone.
    pub fn unbind(&self, session: SessionId) -> usize {
        self.routes.retain(|_, route| route.session.id() != session);
        self.registry.evict_session(session)
    }

    pub fn lookup(&self, node: &NodeId) -> Result<Session> {
        match self.routes.get(node) {
            Some(route) if route.session.is_alive() => Ok(route.session.clone()),
            Some(_) => Err(Error::NoRoute(format!("node {} (session not connected)", node))),
            None => Err(Error::NoRoute(format!("node {}", node))),
        }
    }

    /// Record traffic from `session`.
    pub fn touch(&self, node: &NodeId, session: SessionId) {
        if let Some(mut route) = self.routes.get_mut(node) {
            if route.session.id() == session {
                route.last_seen = Utc::now();
            }
        }
    }

    pub fn route(&self, node: &NodeId) -> Option<RouteInfo> {
        self.routes.get(node).map(|r| route_info(r.key(), &r))
    }

    pub fn routes(&self) -> Vec<RouteInfo> {
        let mut routes: Vec<RouteInfo> = self.routes.iter().map(|r| route_info(r.key(), &r)).collect();
        routes.sort_by(|a, b| a.node_id.cmp(&b.node_id));
        routes
    }

    pub fn len(&self) -> usize {
        self.routes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.routes.is_empty()
    }

    /// Close every session and fail every pending call.
    pub fn shutdown(&self) {
        for route in self.routes.iter() {
            route.session.close();
        }
        self.routes.clear();
        self.registry.shutdown();
    }
}

fn route_info(node: &NodeId, route: &NodeRoute) -> RouteInfo {
    RouteInfo {
        node_id: node.clone(),
        session_id: route.session.id(),
        peer_addr: route.session.peer(),
        registered_at: route.registered_at,
        last_seen: route.last_seen,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::{CorrelationId, ForwardRequest};
    use crate::registry::DuplicatePolicy;
    use crate::session::Outbound;
    use std::time::Duration;
    use tokio_util::sync::CancellationToken;

    fn directory() -> NodeDirectory {
        NodeDirectory::new(CorrelationRegistry::new(DuplicatePolicy::Reject))
    }

    fn open(node: &str) -> (Session, Outbound) {
        Session::open(NodeId::parse(node).unwrap(), None, 8)
    }

    #[test]
    fn test_bind_then_lookup() {
        let dir = directory();
        let (session, _out) = open("node-a");
        assert!(dir.bind(session.clone()).is_none());
        let found = dir.lookup(session.node()).unwrap();
        assert_eq!(found.id(), session.id());
    }

    #[test]
    fn test_unbind_then_lookup() {
        let dir = directory();
        let (session, _out) = open("node-a");
        dir.bind(session.clone());
        dir.unbind(session.id());
        assert!(matches!(dir.lookup(session.node()), Err(Error::NoRoute(_))));
        assert!(dir.is_empty());
    }

    #[test]
    fn test_unknown_node() {
        let dir = directory();
        assert!(matches!(dir.lookup(&NodeId::parse("ghost").unwrap()), Err(Error::NoRoute(_))));
    }

    #[test]
    fn test_dead_session_is_not_routable() {
        let dir = directory();
        let (session, out) = open("node-a");
        dir.bind(session.clone());
        drop(out);
        assert!(dir.lookup(session.node()).is_err());
    }

    #[tokio::test]
    async fn test_rebind_supersedes_and_evicts() {
        let dir = directory();
        let (old, _old_out) = open("node-a");
        let (new, _new_out) = open("node-a");
        dir.bind(old.clone());

        let handle = dir
            .registry()
            .register(old.id(), ForwardRequest::new(CorrelationId::generate(), "GET", "/"))
            .await
            .unwrap();

        let superseded = dir.bind(new.clone()).unwrap();
        assert_eq!(superseded.id(), old.id());
        assert!(!old.is_alive());
        assert_eq!(dir.len(), 1);
        assert_eq!(dir.lookup(new.node()).unwrap().id(), new.id());

        let result = handle.wait(Duration::from_secs(5), &CancellationToken::new()).await;
        assert!(matches!(result, Err(Error::SessionClosed(s)) if s == old.id()));

        // The old session's teardown must not remove the new route.
        dir.unbind(old.id());
        assert_eq!(dir.lookup(new.node()).unwrap().id(), new.id());
    }

    #[test]
    fn test_routes_snapshot() {
        let dir = directory();
        let (b, _ob) = open("node-b");
        let (a, _oa) = open("node-a");
        dir.bind(b);
        dir.bind(a.clone());
        dir.touch(a.node(), a.id());
        let routes = dir.routes();
        assert_eq!(routes.len(), 2);
        assert_eq!(routes[0].node_id.as_str(), "node-a");
        assert!(routes[0].last_seen >= routes[0].registered_at);
        assert_eq!(dir.route(a.node()).unwrap().session_id, a.id());
    }

    #[test]
    fn test_shutdown_closes_sessions() {
        let dir = directory();
        let (a, _oa) = open("node-a");
        dir.bind(a.clone());
        dir.shutdown();
        assert!(!a.is_alive());
        assert!(dir.is_empty());
        assert!(dir.registry().is_shut_down());
    }
}
