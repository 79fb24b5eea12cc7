//! Routing table
//!
//! Resolves a next-hop node id to the connection that reaches it. The adapter
//! only reads the table; whoever accepts and drops connections owns it.

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::RwLock;
use tracing::debug;

use crate::ids::NodeId;
use crate::transport::Transport;

/// How a node is reached
#[derive(Clone)]
pub enum Reachability {
    /// Over a connection this node opened (uplink)
    Client(Arc<dyn Transport>),
    /// Over a connection a peer opened to this node
    Server(Arc<dyn Transport>),
}

impl Reachability {
    pub fn transport(&self) -> &Arc<dyn Transport> {
        match self {
            Reachability::Client(t) | Reachability::Server(t) => t,
        }
    }

    pub fn side(&self) -> &'static str {
        match self {
            Reachability::Client(_) => "client",
            Reachability::Server(_) => "server",
        }
    }
}

impl std::fmt::Debug for Reachability {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}({})", self.side(), self.transport().name())
    }
}

/// Lookup interface consumed by the dispatcher
pub trait RoutingTable: Send + Sync {
    fn lookup(&self, node: &NodeId) -> Option<Reachability>;

    /// Every distinct client-side transport
    fn all_client_transports(&self) -> Vec<Arc<dyn Transport>>;

    /// Every distinct server-side transport
    fn all_server_transports(&self) -> Vec<Arc<dyn Transport>>;
}

/// In-memory routing table keyed by node id, with an optional default route
#[derive(Default)]
pub struct StaticRoutingTable {
    routes: RwLock<HashMap<NodeId, Reachability>>,
    default_route: RwLock<Option<Reachability>>,
}

impl StaticRoutingTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register_client(&self, node: impl Into<NodeId>, transport: Arc<dyn Transport>) {
        let node = node.into();
        debug!("Route {} -> client transport {}", node, transport.name());
        self.routes.write().insert(node, Reachability::Client(transport));
    }

    pub fn register_server(&self, node: impl Into<NodeId>, transport: Arc<dyn Transport>) {
        let node = node.into();
        debug!("Route {} -> server transport {}", node, transport.name());
        self.routes.write().insert(node, Reachability::Server(transport));
    }

    pub fn unregister(&self, node: &NodeId) -> Option<Reachability> {
        self.routes.write().remove(node)
    }

    /// Route used for node ids without an explicit entry (typically the uplink)
    pub fn set_default_route(&self, route: Option<Reachability>) {
        *self.default_route.write() = route;
    }

    pub fn len(&self) -> usize {
        self.routes.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.routes.read().is_empty()
    }

    fn collect(&self, client_side: bool) -> Vec<Arc<dyn Transport>> {
        let routes = self.routes.read();
        let default_route = self.default_route.read();

        let mut transports: Vec<Arc<dyn Transport>> = Vec::new();
        for route in routes.values().chain(default_route.iter()) {
            let matches = match route {
                Reachability::Client(_) => client_side,
                Reachability::Server(_) => !client_side,
            };
            if !matches {
                continue;
            }
            // Several nodes can sit behind one connection
            let transport = route.transport();
            if !transports.iter().any(|t| same_transport(t, transport)) {
                transports.push(transport.clone());
            }
        }
        transports
    }
}

fn same_transport(a: &Arc<dyn Transport>, b: &Arc<dyn Transport>) -> bool {
    Arc::as_ptr(a) as *const () == Arc::as_ptr(b) as *const ()
}

impl RoutingTable for StaticRoutingTable {
    fn lookup(&self, node: &NodeId) -> Option<Reachability> {
        self.routes
            .read()
            .get(node)
            .cloned()
            .or_else(|| self.default_route.read().clone())
    }

    fn all_client_transports(&self) -> Vec<Arc<dyn Transport>> {
        self.collect(true)
    }

    fn all_server_transports(&self) -> Vec<Arc<dyn Transport>> {
        self.collect(false)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::loopback::LoopbackTransport;

    #[test]
    fn test_lookup_registered_and_unknown() {
        let table = StaticRoutingTable::new();
        let (csms, _rx) = LoopbackTransport::new("csms");
        table.register_client("CSMS", csms);

        let route = table.lookup(&NodeId::new("CSMS")).unwrap();
        assert_eq!(route.side(), "client");
        assert!(table.lookup(&NodeId::new("CS999")).is_none());
    }

    #[test]
    fn test_default_route_catches_unknown_nodes() {
        let table = StaticRoutingTable::new();
        let (uplink, _rx) = LoopbackTransport::new("uplink");
        table.set_default_route(Some(Reachability::Client(uplink)));

        let route = table.lookup(&NodeId::new("anything")).unwrap();
        assert_eq!(route.transport().name(), "uplink");
    }

    #[test]
    fn test_shared_transport_listed_once() {
        let table = StaticRoutingTable::new();
        let (lc, _rx) = LoopbackTransport::new("lc1");
        let (cs, _rx2) = LoopbackTransport::new("cs1");
        table.register_server("LC1", lc.clone());
        table.register_server("CS-behind-LC1", lc);
        table.register_server("CS1", cs);

        assert_eq!(table.all_server_transports().len(), 2);
        assert!(table.all_client_transports().is_empty());

        table.unregister(&NodeId::new("CS1"));
        assert_eq!(table.all_server_transports().len(), 1);
    }
}
