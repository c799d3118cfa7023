//! Route resolution collaborator.
//!
//! Given a routing key (address plus transfer capability), resolution
//! either yields a destination route or nothing. It is a pure lookup;
//! policy lives outside the engine.

use crate::transport::{Capabilities, RouteId};

/// A resolved destination for an attached link.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Route {
    /// Route the application stream pair is opened on.
    pub route_id: RouteId,
}

/// Resolves link attach requests to application routes.
pub trait Router: Send + Sync {
    /// Whether any route exists behind this network route id; gates
    /// connection acceptance before any link attaches.
    fn accepts(&self, route_id: RouteId, authorization: u64) -> bool;

    /// Resolve `address`/`capabilities` under `authorization`, scoped
    /// to the network route the connection arrived on.
    fn resolve(
        &self,
        route_id: RouteId,
        authorization: u64,
        address: Option<&str>,
        capabilities: Capabilities,
    ) -> Option<Route>;
}

/// One entry in a [`TableRouter`].
#[derive(Clone, Debug)]
pub struct TableRoute {
    /// Address constraint; `None` matches any address.
    pub address: Option<String>,
    pub capabilities: Capabilities,
    pub target: RouteId,
}

/// Static table-backed router used by the bundled server and tests.
#[derive(Clone, Debug, Default)]
pub struct TableRouter {
    entries: Vec<TableRoute>,
}

impl TableRouter {
    /// Create an empty table.
    #[must_use]
    pub fn new() -> Self { Self::default() }

    /// Append a route entry; earlier entries win.
    #[must_use]
    pub fn with_route(mut self, entry: TableRoute) -> Self {
        self.entries.push(entry);
        self
    }

    /// A table with a single wildcard entry for each capability,
    /// pointing at `target`.
    #[must_use]
    pub fn wildcard(target: RouteId) -> Self {
        Self::new()
            .with_route(TableRoute {
                address: None,
                capabilities: Capabilities::SendOnly,
                target,
            })
            .with_route(TableRoute {
                address: None,
                capabilities: Capabilities::ReceiveOnly,
                target,
            })
    }
}

impl Router for TableRouter {
    fn accepts(&self, _route_id: RouteId, _authorization: u64) -> bool {
        !self.entries.is_empty()
    }

    fn resolve(
        &self,
        _route_id: RouteId,
        _authorization: u64,
        address: Option<&str>,
        capabilities: Capabilities,
    ) -> Option<Route> {
        self.entries
            .iter()
            .find(|entry| {
                entry.capabilities == capabilities
                    && entry
                        .address
                        .as_deref()
                        .is_none_or(|constraint| Some(constraint) == address)
            })
            .map(|entry| Route {
                route_id: entry.target,
            })
    }
}
