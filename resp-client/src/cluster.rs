//! Cluster router.
//!
//! Routes each command to the node owning its key's hash slot, follows
//! MOVED and ASK redirects up to explicit limits, and rebuilds the slot map
//! from `CLUSTER SLOTS` when it has no owner for a slot.
//!
//! # Example
//!
//! ```no_run
//! use resp_client::{ClusterConfig, ClusterConnection, Connection};
//! use resp_proto::Command;
//!
//! fn example() -> resp_client::Result<()> {
//!     let config = ClusterConfig::new(["127.0.0.1:7000", "127.0.0.1:7001"]);
//!     let mut cluster = ClusterConnection::new(config)?;
//!     cluster.connect()?;
//!     cluster.execute_command(&Command::new("SET").key("hello").arg("world"))?;
//!     let value = cluster.execute_command(&Command::new("GET").key("hello"))?;
//!     assert_eq!(value.as_bytes(), Some(&b"world"[..]));
//!     Ok(())
//! }
//! ```

use std::collections::VecDeque;

use resp_proto::{Command, RedirectKind, Value, hash_slot, parse_cluster_slots, parse_redirect};
use tracing::{debug, info, warn};

use crate::connection::{Connection, NodeConnection};
use crate::error::{Error, Result};
use crate::params::ConnectionParameters;
use crate::pool::NodeRegistry;
use crate::slots::SlotMap;

/// How many redirects of each kind a single command may follow.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RedirectLimits {
    pub moved: usize,
    pub ask: usize,
}

impl Default for RedirectLimits {
    fn default() -> Self {
        Self { moved: 1, ask: 1 }
    }
}

/// Configuration for a cluster connection.
#[derive(Debug, Clone)]
pub struct ClusterConfig {
    /// `host:port` of nodes used to discover the topology.
    pub seeds: Vec<String>,
    /// Template for every node connection. Host and port are replaced per
    /// node; credentials, timeouts and TLS settings are kept.
    pub node_defaults: ConnectionParameters,
    pub limits: RedirectLimits,
}

impl ClusterConfig {
    pub fn new<I, S>(seeds: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            seeds: seeds.into_iter().map(Into::into).collect(),
            node_defaults: ConnectionParameters::default(),
            limits: RedirectLimits::default(),
        }
    }

    /// Set the node connection template.
    pub fn node_defaults(mut self, parameters: ConnectionParameters) -> Self {
        self.node_defaults = parameters;
        self
    }

    /// Set the redirect limits.
    pub fn limits(mut self, limits: RedirectLimits) -> Self {
        self.limits = limits;
        self
    }
}

/// Compute the slot a command routes to.
///
/// All keys must hash to the same slot.
pub fn slot_for(command: &Command) -> Result<u16> {
    let keys = command.keys();
    let (first, rest) = keys
        .split_first()
        .ok_or_else(|| Error::NoKey(command.name()))?;
    let slot = hash_slot(first);
    if rest.iter().any(|key| hash_slot(key) != slot) {
        return Err(Error::CrossSlot(command.name()));
    }
    Ok(slot)
}

/// A connection to a whole cluster, presenting the same execution contract
/// as a single node.
pub struct ClusterConnection {
    config: ClusterConfig,
    registry: NodeRegistry,
    slots: SlotMap,
    /// Node of each written, not yet read, pipelined command.
    pending: VecDeque<String>,
    /// Set after a node failure; the next routed command rediscovers.
    stale: bool,
}

impl ClusterConnection {
    /// Create a cluster connection. Performs no I/O.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidArgument`] when there are no seeds, a seed is
    /// not `host:port`, or the node template is invalid.
    pub fn new(config: ClusterConfig) -> Result<Self> {
        if config.seeds.is_empty() {
            return Err(Error::InvalidArgument(
                "cluster needs at least one seed".to_string(),
            ));
        }
        for seed in &config.seeds {
            config.node_defaults.with_endpoint(seed)?.validate()?;
        }
        Ok(Self {
            config,
            registry: NodeRegistry::new(),
            slots: SlotMap::new(),
            pending: VecDeque::new(),
            stale: false,
        })
    }

    pub fn config(&self) -> &ClusterConfig {
        &self.config
    }

    pub fn slot_map(&self) -> &SlotMap {
        &self.slots
    }

    pub fn registry(&self) -> &NodeRegistry {
        &self.registry
    }

    /// Number of pipelined replies still to be read.
    pub fn pending(&self) -> usize {
        self.pending.len()
    }

    /// The connection for `endpoint`, created on first use.
    pub fn node(&mut self, endpoint: &str) -> Result<&mut NodeConnection> {
        let defaults = &self.config.node_defaults;
        self.registry
            .get_or_create(endpoint, || defaults.with_endpoint(endpoint))
    }

    // ── Topology ────────────────────────────────────────────────────────

    /// Query `CLUSTER SLOTS` and rebuild the slot map.
    ///
    /// Connected nodes are asked first, then the remaining known nodes,
    /// then the seeds. The first usable answer wins.
    pub fn refresh_topology(&mut self) -> Result<()> {
        if !self.pending.is_empty() {
            return Err(self.pending_error("refresh the topology"));
        }

        let mut candidates = self.registry.connected_endpoints();
        for endpoint in self
            .registry
            .endpoints()
            .chain(self.config.seeds.iter().map(String::as_str))
        {
            if !candidates.iter().any(|c| c == endpoint) {
                candidates.push(endpoint.to_string());
            }
        }

        let mut last_error = String::from("no nodes to ask");
        for endpoint in candidates {
            let reply = match self
                .node(&endpoint)
                .and_then(|conn| conn.execute_command(&Command::cluster_slots()))
            {
                Ok(reply) => reply,
                Err(e) => {
                    warn!(endpoint = %endpoint, error = %e, "topology query failed");
                    last_error = e.to_string();
                    continue;
                }
            };

            match parse_cluster_slots(&reply) {
                Some(ranges) if !ranges.is_empty() => {
                    self.slots.replace_from_ranges(&ranges);
                    self.stale = false;
                    info!(
                        source = %endpoint,
                        ranges = ranges.len(),
                        nodes = self.slots.endpoints().len(),
                        "cluster topology refreshed"
                    );
                    return Ok(());
                }
                _ => {
                    let detail = match &reply {
                        Value::Error(msg) => String::from_utf8_lossy(msg).into_owned(),
                        _ => "invalid CLUSTER SLOTS reply".to_string(),
                    };
                    warn!(endpoint = %endpoint, error = %detail, "topology query rejected");
                    last_error = detail;
                }
            }
        }

        Err(Error::TopologyUnavailable(last_error))
    }

    /// The endpoint owning `slot`, discovering the topology if needed.
    fn endpoint_for_slot(&mut self, slot: u16) -> Result<String> {
        if self.stale || self.slots.lookup(slot).is_none() {
            self.refresh_topology()?;
        }
        self.slots
            .lookup(slot)
            .map(str::to_string)
            .ok_or(Error::NoNodeForSlot(slot))
    }

    fn pending_error(&self, operation: &str) -> Error {
        Error::InvalidArgument(format!(
            "cannot {operation} with {} unread pipelined replies",
            self.pending.len()
        ))
    }

    /// Drop every unread pipelined reply. Nodes still owing replies are
    /// disconnected so their late bytes are never read as someone else's.
    fn abandon_pending(&mut self) {
        let mut owing: Vec<String> = self.pending.drain(..).collect();
        owing.sort_unstable();
        owing.dedup();
        for endpoint in owing {
            if let Some(conn) = self.registry.get_mut(&endpoint) {
                conn.disconnect();
            }
        }
    }

    /// The node a pipelined command for `slot` is written to.
    fn write_target(&mut self, slot: u16) -> Result<String> {
        let known = self
            .slots
            .lookup(slot)
            .filter(|_| !self.stale)
            .map(str::to_string);
        match known {
            Some(endpoint) => Ok(endpoint),
            // Discovery would interleave with unread replies.
            None if self.pending.is_empty() => self.endpoint_for_slot(slot),
            None => Err(Error::NoNodeForSlot(slot)),
        }
    }

    /// Write one pipelined command and remember which node owes its reply.
    fn write_to(&mut self, endpoint: String, command: &Command) -> Result<()> {
        if let Err(e) = self.node(&endpoint).and_then(|conn| conn.write_request(command)) {
            if e.is_connection_error() {
                self.stale = true;
            }
            self.abandon_pending();
            return Err(e);
        }
        self.pending.push_back(endpoint);
        Ok(())
    }

    // ── Routing ─────────────────────────────────────────────────────────

    /// Execute a command on the node owning its slot, following at most
    /// `limits.moved` MOVED and `limits.ask` ASK redirects.
    ///
    /// MOVED patches the slot map. ASK retries on the target after `ASKING`
    /// and leaves the slot map alone. Other error replies are returned as
    /// [`Value::Error`].
    pub fn execute_command_with_limits(
        &mut self,
        command: &Command,
        limits: RedirectLimits,
    ) -> Result<Value> {
        if !self.pending.is_empty() {
            return Err(self.pending_error("execute a command"));
        }

        let slot = slot_for(command)?;
        let mut endpoint = self.endpoint_for_slot(slot)?;
        let mut moved = 0;
        let mut asked = 0;
        let mut asking = false;

        loop {
            let reply = match self.dispatch(&endpoint, command, asking) {
                Ok(reply) => reply,
                Err(e) => {
                    if e.is_connection_error() {
                        self.stale = true;
                    }
                    return Err(e);
                }
            };
            asking = false;

            let Some(redirect) = parse_redirect(&reply) else {
                return Ok(reply);
            };

            match redirect.kind {
                RedirectKind::Moved => {
                    if moved >= limits.moved {
                        return Err(Error::TooManyRedirects {
                            kind: redirect.kind,
                            slot: redirect.slot,
                            endpoint: redirect.endpoint,
                        });
                    }
                    moved += 1;
                    debug!(
                        slot = redirect.slot,
                        from = %endpoint,
                        to = %redirect.endpoint,
                        "MOVED"
                    );
                    self.slots.set_slot(redirect.slot, &redirect.endpoint);
                }
                RedirectKind::Ask => {
                    if asked >= limits.ask {
                        return Err(Error::TooManyRedirects {
                            kind: redirect.kind,
                            slot: redirect.slot,
                            endpoint: redirect.endpoint,
                        });
                    }
                    asked += 1;
                    asking = true;
                    debug!(
                        slot = redirect.slot,
                        from = %endpoint,
                        to = %redirect.endpoint,
                        "ASK"
                    );
                }
            }
            endpoint = redirect.endpoint;
        }
    }

    /// Send `command` to `endpoint`, preceded by `ASKING` when requested.
    fn dispatch(&mut self, endpoint: &str, command: &Command, asking: bool) -> Result<Value> {
        let conn = self.node(endpoint)?;
        if !asking {
            return conn.execute_command(command);
        }

        conn.write_request(&Command::asking())?;
        conn.write_request(command)?;
        let asking_reply = conn.read()?;
        let reply = conn.read()?;
        if let Value::Error(msg) = asking_reply {
            return Err(Error::Redis(String::from_utf8_lossy(&msg).into_owned()));
        }
        Ok(reply)
    }
}

impl Connection for ClusterConnection {
    /// Discover the topology and open a connection to every slot owner.
    fn connect(&mut self) -> Result<()> {
        if !self.slots.is_initialized() || self.stale {
            self.refresh_topology()?;
        }
        let endpoints: Vec<String> = self.slots.endpoints().iter().map(|e| e.to_string()).collect();
        for endpoint in endpoints {
            self.node(&endpoint)?.connect()?;
        }
        Ok(())
    }

    fn disconnect(&mut self) {
        self.registry.disconnect_all();
        self.pending.clear();
    }

    fn is_connected(&self) -> bool {
        !self.registry.connected_endpoints().is_empty()
    }

    /// Write a command to the node owning its slot without reading.
    ///
    /// Replies to pipelined commands are returned as-is: redirects are not
    /// followed.
    fn write_request(&mut self, command: &Command) -> Result<()> {
        let endpoint = self.write_target(slot_for(command)?)?;
        self.write_to(endpoint, command)
    }

    /// Route every command first, then write them in order. A command that
    /// cannot be routed fails the batch before anything is sent.
    fn write_requests(&mut self, commands: &[Command]) -> Result<()> {
        let slots = commands.iter().map(slot_for).collect::<Result<Vec<_>>>()?;
        let mut targets = Vec::with_capacity(slots.len());
        for slot in slots {
            targets.push(self.write_target(slot)?);
        }
        for (command, endpoint) in commands.iter().zip(targets) {
            self.write_to(endpoint, command)?;
        }
        Ok(())
    }

    /// Read the reply to the oldest unread pipelined command.
    ///
    /// Any failure abandons every outstanding reply, so a later pipeline
    /// never receives replies meant for this one.
    fn read(&mut self) -> Result<Value> {
        let Some(endpoint) = self.pending.pop_front() else {
            return Err(Error::InvalidArgument(
                "no pipelined command is waiting for a reply".to_string(),
            ));
        };
        let result = self.node(&endpoint).and_then(|conn| conn.read());
        if let Err(e) = &result {
            if e.is_connection_error() {
                self.stale = true;
            }
            self.abandon_pending();
        }
        result
    }

    fn execute_command(&mut self, command: &Command) -> Result<Value> {
        let limits = self.config.limits;
        self.execute_command_with_limits(command, limits)
    }

    /// The node connection template.
    fn parameters(&self) -> &ConnectionParameters {
        &self.config.node_defaults
    }
}

impl std::fmt::Debug for ClusterConnection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ClusterConnection")
            .field("seeds", &self.config.seeds)
            .field("nodes", &self.registry.len())
            .field("slots", &self.slots)
            .field("pending", &self.pending.len())
            .finish()
    }
}
