//! Node registry: one [`NodeConnection`] per endpoint.
//!
//! Connections are created lazily on first reference and live as long as
//! the registry. Entries are never removed, so an endpoint always maps to
//! the same connection instance. The registry is single-owner (no Arc, no
//! Mutex): it belongs to one logical client and is mutated through
//! `&mut self`.

use std::collections::HashMap;

use crate::connection::{Connection, NodeConnection};
use crate::error::Result;
use crate::params::ConnectionParameters;

/// Endpoint identity → connection, in insertion order.
#[derive(Debug, Default)]
pub struct NodeRegistry {
    index: HashMap<String, usize>,
    nodes: Vec<NodeConnection>,
}

impl NodeRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Return the connection for `endpoint`, creating it from `parameters`
    /// if this is the first reference. Performs no I/O.
    ///
    /// `parameters` is only consulted when `endpoint` is not yet known. The
    /// connection is registered under its canonical
    /// [`endpoint`](NodeConnection::endpoint) (IPv6 hosts bracketed), and
    /// `endpoint` is kept as an alias when spelled differently, so
    /// `::1:7000` and `[::1]:7000` name the same connection.
    pub fn get_or_create(
        &mut self,
        endpoint: &str,
        parameters: impl FnOnce() -> Result<ConnectionParameters>,
    ) -> Result<&mut NodeConnection> {
        if let Some(&idx) = self.index.get(endpoint) {
            return Ok(&mut self.nodes[idx]);
        }

        let conn = NodeConnection::new(parameters()?)?;
        let idx = match self.index.get(conn.endpoint()) {
            Some(&idx) => idx,
            None => {
                let idx = self.nodes.len();
                self.index.insert(conn.endpoint().to_string(), idx);
                self.nodes.push(conn);
                idx
            }
        };
        if !self.index.contains_key(endpoint) {
            self.index.insert(endpoint.to_string(), idx);
        }
        Ok(&mut self.nodes[idx])
    }

    /// Register an existing connection under its own endpoint.
    ///
    /// Returns the connection back if the endpoint is already present.
    pub fn insert(&mut self, conn: NodeConnection) -> std::result::Result<(), NodeConnection> {
        if self.index.contains_key(conn.endpoint()) {
            return Err(conn);
        }
        self.index.insert(conn.endpoint().to_string(), self.nodes.len());
        self.nodes.push(conn);
        Ok(())
    }

    pub fn get(&self, endpoint: &str) -> Option<&NodeConnection> {
        self.index.get(endpoint).map(|&idx| &self.nodes[idx])
    }

    pub fn get_mut(&mut self, endpoint: &str) -> Option<&mut NodeConnection> {
        self.index.get(endpoint).map(|&idx| &mut self.nodes[idx])
    }

    pub fn contains(&self, endpoint: &str) -> bool {
        self.index.contains_key(endpoint)
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    /// Endpoints in the order they were first referenced.
    pub fn endpoints(&self) -> impl Iterator<Item = &str> {
        self.nodes.iter().map(NodeConnection::endpoint)
    }

    /// Endpoints whose connection is currently open.
    pub fn connected_endpoints(&self) -> Vec<String> {
        self.nodes
            .iter()
            .filter(|c| c.is_connected())
            .map(|c| c.endpoint().to_string())
            .collect()
    }

    /// Close every connection. Entries stay registered and reconnect on use.
    pub fn disconnect_all(&mut self) {
        for conn in &mut self.nodes {
            conn.disconnect();
        }
    }
}
