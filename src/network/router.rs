//! BACnet network router (Clause 6.6)
//!
//! The routing table data structures and the [`NetworkRouter`] engine
//! that interconnects multiple BACnet networks: it forwards NPDUs
//! between ports per the Figure 6-12 flowchart, processes network layer
//! messages, and maintains reachability (including the 30-second
//! congestion timer for Router-Busy networks).
//!
//! The router optionally hosts a local application entity on one port;
//! local traffic and the local copy of global broadcasts are handed to
//! the application callback.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use log::{debug, info, warn};
use tokio::task::JoinHandle;

use super::{
    BacnetAddress, NetworkError, NetworkMessageType, NetworkPriority, Npdu, Result,
};
use crate::datalink::TransportPort;

/// Congestion timer per Clause 6.6.3.5
const DEFAULT_BUSY_TIMEOUT: Duration = Duration::from_secs(30);

/// Router tuning knobs
#[derive(Debug, Clone)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct RouterConfig {
    /// How long a Router-Busy network stays excluded from
    /// Who-Is-Router responses before being promoted back to reachable.
    pub busy_timeout: Duration,
}

impl Default for RouterConfig {
    fn default() -> Self {
        Self {
            busy_timeout: DEFAULT_BUSY_TIMEOUT,
        }
    }
}

/// Reachability state of a routing table entry
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NetworkReachability {
    Reachable,
    /// Congested; advisory only, NPDUs are still forwarded
    Busy,
    Unreachable,
}

/// A single router port connecting to one BACnet network.
pub struct RouterPort {
    /// Unique port identifier
    pub port_id: u8,
    /// Network number of the directly connected network
    pub network_number: u16,
    /// The data link transport behind this port
    pub transport: Arc<dyn TransportPort>,
    /// Local MAC on this network, learned from the transport at startup
    pub mac_address: Vec<u8>,
    /// Largest NPDU the data link can carry
    pub max_npdu_length: usize,
    /// False when the network number was learned via Network-Number-Is
    pub network_number_configured: bool,
}

impl RouterPort {
    pub fn new(port_id: u8, network_number: u16, transport: Arc<dyn TransportPort>) -> Self {
        let max_npdu_length = transport.max_npdu_length();
        Self {
            port_id,
            network_number,
            transport,
            mac_address: Vec::new(),
            max_npdu_length,
            network_number_configured: true,
        }
    }
}

/// A routing table entry (Clause 6.6.1)
pub struct RoutingTableEntry {
    pub network_number: u16,
    /// Port the network is reachable through
    pub port_id: u8,
    /// Next-hop router MAC, or `None` when directly connected
    pub next_router_mac: Option<Vec<u8>>,
    pub reachability: NetworkReachability,
    /// Handle of the 30-second congestion timer while Busy
    busy_timer: Option<JoinHandle<()>>,
}

impl RoutingTableEntry {
    fn cancel_timer(&mut self) {
        if let Some(timer) = self.busy_timer.take() {
            timer.abort();
        }
    }
}

/// The router's complete routing table: ports plus reachability entries.
#[derive(Default)]
pub struct RoutingTable {
    ports: HashMap<u8, RouterPort>,
    entries: HashMap<u16, RoutingTableEntry>,
}

impl RoutingTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a port and create its directly-connected entry.
    ///
    /// Fails if the port ID is taken or another port already claims the
    /// same network.
    pub fn add_port(&mut self, port: RouterPort) -> Result<()> {
        if self.ports.contains_key(&port.port_id) {
            return Err(NetworkError::Configuration(format!(
                "port {} already registered",
                port.port_id
            )));
        }
        if self.entries.contains_key(&port.network_number) {
            return Err(NetworkError::Configuration(format!(
                "network {} already in routing table",
                port.network_number
            )));
        }
        self.entries.insert(
            port.network_number,
            RoutingTableEntry {
                network_number: port.network_number,
                port_id: port.port_id,
                next_router_mac: None,
                reachability: NetworkReachability::Reachable,
                busy_timer: None,
            },
        );
        self.ports.insert(port.port_id, port);
        Ok(())
    }

    pub fn port(&self, port_id: u8) -> Option<&RouterPort> {
        self.ports.get(&port_id)
    }

    pub fn ports(&self) -> impl Iterator<Item = &RouterPort> {
        self.ports.values()
    }

    pub fn entry(&self, dnet: u16) -> Option<&RoutingTableEntry> {
        self.entries.get(&dnet)
    }

    /// Port and entry able to reach `dnet`, if any
    pub fn route(&self, dnet: u16) -> Option<(&RouterPort, &RoutingTableEntry)> {
        let entry = self.entries.get(&dnet)?;
        let port = self.ports.get(&entry.port_id)?;
        Some((port, entry))
    }

    /// Networks with Reachable entries, optionally excluding one port.
    /// Busy networks are excluded; this feeds Who-Is-Router responses.
    pub fn reachable_networks(&self, exclude_port: Option<u8>) -> Vec<u16> {
        let mut networks: Vec<u16> = self
            .entries
            .values()
            .filter(|e| e.reachability == NetworkReachability::Reachable)
            .filter(|e| exclude_port != Some(e.port_id))
            .map(|e| e.network_number)
            .collect();
        networks.sort_unstable();
        networks
    }

    /// Add or refresh a route. An existing entry is re-pointed and
    /// promoted to Reachable; its busy timer is cancelled.
    pub fn update_route(
        &mut self,
        dnet: u16,
        port_id: u8,
        next_router_mac: Option<Vec<u8>>,
    ) -> Result<()> {
        if !self.ports.contains_key(&port_id) {
            return Err(NetworkError::Configuration(format!(
                "unknown port {}",
                port_id
            )));
        }
        match self.entries.get_mut(&dnet) {
            Some(entry) => {
                entry.cancel_timer();
                entry.port_id = port_id;
                entry.next_router_mac = next_router_mac;
                entry.reachability = NetworkReachability::Reachable;
            }
            None => {
                self.entries.insert(
                    dnet,
                    RoutingTableEntry {
                        network_number: dnet,
                        port_id,
                        next_router_mac,
                        reachability: NetworkReachability::Reachable,
                        busy_timer: None,
                    },
                );
            }
        }
        Ok(())
    }

    pub fn remove_entry(&mut self, dnet: u16) {
        if let Some(mut entry) = self.entries.remove(&dnet) {
            entry.cancel_timer();
        }
    }

    /// Mark a network Busy; returns false if there is no entry.
    /// The caller is responsible for arming the promotion timer.
    pub fn mark_busy(&mut self, dnet: u16) -> bool {
        match self.entries.get_mut(&dnet) {
            Some(entry) => {
                entry.cancel_timer();
                entry.reachability = NetworkReachability::Busy;
                true
            }
            None => false,
        }
    }

    fn set_busy_timer(&mut self, dnet: u16, timer: JoinHandle<()>) {
        if let Some(entry) = self.entries.get_mut(&dnet) {
            entry.busy_timer = Some(timer);
        } else {
            timer.abort();
        }
    }

    pub fn mark_available(&mut self, dnet: u16) {
        if let Some(entry) = self.entries.get_mut(&dnet) {
            entry.cancel_timer();
            entry.reachability = NetworkReachability::Reachable;
        }
    }

    /// Timer callback: promote back to Reachable only when still Busy
    fn mark_available_if_busy(&mut self, dnet: u16) {
        if let Some(entry) = self.entries.get_mut(&dnet) {
            if entry.reachability == NetworkReachability::Busy {
                entry.busy_timer = None;
                entry.reachability = NetworkReachability::Reachable;
            }
        }
    }

    pub fn mark_unreachable(&mut self, dnet: u16) {
        if let Some(entry) = self.entries.get_mut(&dnet) {
            entry.cancel_timer();
            entry.reachability = NetworkReachability::Unreachable;
        }
    }
}

/// Callback receiving `(apdu_bytes, source_address)` for APDUs delivered
/// to the hosted application entity.
pub type ApplicationCallback = Arc<dyn Fn(&[u8], &BacnetAddress) + Send + Sync>;

/// Drop and throughput counters. Routing failures are silent on the
/// wire; these are the only trace they leave.
#[derive(Debug, Default)]
pub struct RouterCounters {
    pub npdus_routed: AtomicU64,
    pub malformed_npdus: AtomicU64,
    pub unknown_network: AtomicU64,
    pub hop_count_exhausted: AtomicU64,
}

impl RouterCounters {
    pub fn snapshot(&self) -> (u64, u64, u64, u64) {
        (
            self.npdus_routed.load(Ordering::Relaxed),
            self.malformed_npdus.load(Ordering::Relaxed),
            self.unknown_network.load(Ordering::Relaxed),
            self.hop_count_exhausted.load(Ordering::Relaxed),
        )
    }
}

struct RouterInner {
    config: RouterConfig,
    table: Mutex<RoutingTable>,
    application_port_id: Option<u8>,
    application_callback: Mutex<Option<ApplicationCallback>>,
    counters: RouterCounters,
    // Busy timers hold this weakly so they never keep the router alive
    self_weak: std::sync::Weak<RouterInner>,
}

/// BACnet router engine per Clause 6.6. Cheap to clone; all clones share
/// the same routing table.
#[derive(Clone)]
pub struct NetworkRouter {
    inner: Arc<RouterInner>,
}

impl NetworkRouter {
    /// Build a router over the given ports. Each port must have a unique
    /// ID and network number. `application_port_id` selects the port on
    /// which the router's own application entity resides.
    pub fn new(ports: Vec<RouterPort>, application_port_id: Option<u8>) -> Result<Self> {
        Self::with_config(ports, application_port_id, RouterConfig::default())
    }

    pub fn with_config(
        ports: Vec<RouterPort>,
        application_port_id: Option<u8>,
        config: RouterConfig,
    ) -> Result<Self> {
        let mut table = RoutingTable::new();
        for port in ports {
            table.add_port(port)?;
        }
        if let Some(port_id) = application_port_id {
            if table.port(port_id).is_none() {
                return Err(NetworkError::Configuration(format!(
                    "application port {} not found",
                    port_id
                )));
            }
        }
        Ok(Self {
            inner: Arc::new_cyclic(|weak| RouterInner {
                config,
                table: Mutex::new(table),
                application_port_id,
                application_callback: Mutex::new(None),
                counters: RouterCounters::default(),
                self_weak: weak.clone(),
            }),
        })
    }

    /// Install the callback for APDUs delivered locally. Typically wired
    /// to [`crate::transaction::TransactionManager::application_callback`].
    pub fn set_application_callback(&self, callback: ApplicationCallback) {
        *self.inner.application_callback.lock().unwrap() = Some(callback);
    }

    /// Start all port transports and wire one receive callback per port.
    pub async fn start(&self) -> std::result::Result<(), crate::datalink::DataLinkError> {
        let ports: Vec<(u8, Arc<dyn TransportPort>)> = {
            let table = self.inner.table.lock().unwrap();
            table
                .ports()
                .map(|p| (p.port_id, p.transport.clone()))
                .collect()
        };
        for (port_id, transport) in ports {
            let inner = self.inner.clone();
            transport.on_receive(Arc::new(move |npdu, source_mac| {
                inner.on_port_receive(port_id, npdu, source_mac);
            }));
            transport.start().await?;
            let mac = transport.local_mac();
            let mut table = self.inner.table.lock().unwrap();
            if let Some(port) = table.ports.get_mut(&port_id) {
                port.mac_address = mac;
            }
        }
        info!("network router started");
        Ok(())
    }

    /// Stop all port transports.
    pub async fn stop(&self) -> std::result::Result<(), crate::datalink::DataLinkError> {
        let transports: Vec<Arc<dyn TransportPort>> = {
            let table = self.inner.table.lock().unwrap();
            table.ports().map(|p| p.transport.clone()).collect()
        };
        for transport in transports {
            transport.stop().await?;
        }
        info!("network router stopped");
        Ok(())
    }

    /// Run `f` against the routing table
    pub fn with_table<R>(&self, f: impl FnOnce(&mut RoutingTable) -> R) -> R {
        f(&mut self.inner.table.lock().unwrap())
    }

    pub fn counters(&self) -> &RouterCounters {
        &self.inner.counters
    }

    /// Mark a network Busy and arm the promotion timer.
    pub fn mark_network_busy(&self, dnet: u16) {
        self.inner.mark_network_busy(dnet);
    }

    /// Send an APDU to `destination`, wrapping it in an NPDU and routing
    /// it to the right port. This is the application-layer entry point.
    pub fn send(
        &self,
        apdu: &[u8],
        destination: &BacnetAddress,
        expecting_reply: bool,
        priority: NetworkPriority,
    ) -> Result<()> {
        self.inner.send(apdu, destination, expecting_reply, priority)
    }
}

impl RouterInner {
    fn on_port_receive(&self, port_id: u8, data: &[u8], source_mac: &[u8]) {
        let npdu = match Npdu::decode(data) {
            Ok(npdu) => npdu,
            Err(e) => {
                self.counters.malformed_npdus.fetch_add(1, Ordering::Relaxed);
                warn!("dropped malformed NPDU on port {}: {}", port_id, e);
                return;
            }
        };
        self.process_npdu(port_id, npdu, source_mac);
    }

    /// The Figure 6-12 forwarding flowchart.
    fn process_npdu(&self, port_id: u8, npdu: Npdu, source_mac: &[u8]) {
        if npdu.is_network_message {
            self.handle_network_message(port_id, &npdu, source_mac);
            return;
        }

        let dnet = match &npdu.destination {
            None => {
                // No DNET: traffic for this station
                self.deliver_to_application(&npdu, source_mac);
                return;
            }
            Some(dest) => dest.network.unwrap_or(0xFFFF),
        };

        if dnet == 0xFFFF {
            self.deliver_to_application(&npdu, source_mac);
            self.forward_global_broadcast(port_id, &npdu, source_mac);
            return;
        }

        self.forward_to_network(port_id, &npdu, source_mac, dnet);
    }

    fn deliver_to_application(&self, npdu: &Npdu, source_mac: &[u8]) {
        let callback = match self.application_callback.lock().unwrap().clone() {
            Some(cb) => cb,
            None => return,
        };
        // A missing SNET means the sender is on the arrival port's own
        // network; hand it up as a local address so replies take the
        // local-unicast path and match the requester's transaction key.
        let source = match &npdu.source {
            Some(source) => source.clone(),
            None => BacnetAddress::local(source_mac.to_vec()),
        };
        callback(&npdu.apdu, &source);
    }

    fn forward_global_broadcast(&self, arrival_port_id: u8, npdu: &Npdu, source_mac: &[u8]) {
        let forwarded = match self.prepare_forwarded_npdu(arrival_port_id, npdu, source_mac) {
            Some(npdu) => npdu,
            None => return,
        };
        let encoded = match forwarded.encode() {
            Ok(bytes) => bytes,
            Err(e) => {
                warn!("failed to re-encode global broadcast: {}", e);
                return;
            }
        };
        let targets: Vec<Arc<dyn TransportPort>> = {
            let table = self.table.lock().unwrap();
            table
                .ports()
                .filter(|p| p.port_id != arrival_port_id)
                .map(|p| p.transport.clone())
                .collect()
        };
        for transport in targets {
            let _ = transport.send_broadcast(&encoded);
        }
        self.counters.npdus_routed.fetch_add(1, Ordering::Relaxed);
    }

    fn forward_to_network(&self, arrival_port_id: u8, npdu: &Npdu, source_mac: &[u8], dnet: u16) {
        enum Next {
            Direct(Arc<dyn TransportPort>),
            Hop(Arc<dyn TransportPort>, Vec<u8>),
        }
        let next = {
            let table = self.table.lock().unwrap();
            match table.route(dnet) {
                None => {
                    drop(table);
                    self.counters.unknown_network.fetch_add(1, Ordering::Relaxed);
                    debug!("no route to network {}, discarding", dnet);
                    return;
                }
                Some((port, entry)) => match &entry.next_router_mac {
                    None => Next::Direct(port.transport.clone()),
                    Some(mac) => Next::Hop(port.transport.clone(), mac.clone()),
                },
            }
        };

        match next {
            Next::Direct(transport) => {
                // Strip DNET/DADR and the hop count; inject SNET/SADR
                let source = self.inject_source(arrival_port_id, npdu, source_mac);
                let dadr = npdu
                    .destination
                    .as_ref()
                    .map(|d| d.mac.clone())
                    .unwrap_or_default();
                let local_npdu = Npdu {
                    destination: None,
                    source,
                    hop_count: super::DEFAULT_HOP_COUNT,
                    ..npdu.clone()
                };
                let encoded = match local_npdu.encode() {
                    Ok(bytes) => bytes,
                    Err(e) => {
                        warn!("failed to re-encode NPDU for network {}: {}", dnet, e);
                        return;
                    }
                };
                if dadr.is_empty() {
                    // Zero-length DADR: directed broadcast on that network
                    let _ = transport.send_broadcast(&encoded);
                } else {
                    let _ = transport.send_unicast(&encoded, &dadr);
                }
                self.counters.npdus_routed.fetch_add(1, Ordering::Relaxed);
            }
            Next::Hop(transport, next_hop_mac) => {
                let forwarded = match self.prepare_forwarded_npdu(arrival_port_id, npdu, source_mac)
                {
                    Some(npdu) => npdu,
                    None => return,
                };
                let encoded = match forwarded.encode() {
                    Ok(bytes) => bytes,
                    Err(e) => {
                        warn!("failed to re-encode NPDU for network {}: {}", dnet, e);
                        return;
                    }
                };
                let _ = transport.send_unicast(&encoded, &next_hop_mac);
                self.counters.npdus_routed.fetch_add(1, Ordering::Relaxed);
            }
        }
    }

    /// Inject SNET/SADR and decrement the hop count; `None` when the hop
    /// count is exhausted.
    fn prepare_forwarded_npdu(
        &self,
        arrival_port_id: u8,
        npdu: &Npdu,
        source_mac: &[u8],
    ) -> Option<Npdu> {
        let new_hop_count = npdu.hop_count.saturating_sub(1);
        if new_hop_count == 0 {
            self.counters.hop_count_exhausted.fetch_add(1, Ordering::Relaxed);
            debug!("hop count exhausted, discarding NPDU");
            return None;
        }
        let source = self.inject_source(arrival_port_id, npdu, source_mac);
        Some(Npdu {
            source,
            hop_count: new_hop_count,
            ..npdu.clone()
        })
    }

    /// SNET/SADR from the arrival port, unless the NPDU already has one
    fn inject_source(
        &self,
        arrival_port_id: u8,
        npdu: &Npdu,
        source_mac: &[u8],
    ) -> Option<BacnetAddress> {
        if npdu.source.is_some() {
            return npdu.source.clone();
        }
        let table = self.table.lock().unwrap();
        let port = table.port(arrival_port_id)?;
        Some(BacnetAddress {
            network: Some(port.network_number),
            mac: source_mac.to_vec(),
        })
    }

    // -- Network layer messages ---------------------------------------------

    fn handle_network_message(&self, port_id: u8, npdu: &Npdu, source_mac: &[u8]) {
        let Some(message_type) = npdu.network_message_type() else {
            return;
        };
        let data = &npdu.network_message_data;
        debug!(
            "network message {} on port {} from {}",
            message_type,
            port_id,
            crate::util::format_mac(source_mac)
        );

        match message_type {
            NetworkMessageType::WhoIsRouterToNetwork => {
                self.answer_who_is_router(port_id, data, source_mac);
            }
            NetworkMessageType::IAmRouterToNetwork => {
                self.learn_routes(port_id, data, source_mac);
            }
            NetworkMessageType::RouterBusyToNetwork => {
                for dnet in parse_network_list(data) {
                    self.mark_network_busy(dnet);
                }
            }
            NetworkMessageType::RouterAvailableToNetwork => {
                let mut table = self.table.lock().unwrap();
                for dnet in parse_network_list(data) {
                    table.mark_available(dnet);
                }
            }
            NetworkMessageType::RejectMessageToNetwork => {
                warn!(
                    "Reject-Message-To-Network on port {}: {}",
                    port_id,
                    hex::encode(data)
                );
            }
            NetworkMessageType::WhatIsNetworkNumber => {
                let response = {
                    let table = self.table.lock().unwrap();
                    table.port(port_id).and_then(|port| {
                        if port.network_number_configured {
                            let mut body = port.network_number.to_be_bytes().to_vec();
                            body.push(1); // configured
                            Some(body)
                        } else {
                            None
                        }
                    })
                };
                if let Some(body) = response {
                    self.send_network_message(
                        port_id,
                        NetworkMessageType::NetworkNumberIs,
                        body,
                        None,
                    );
                }
            }
            NetworkMessageType::NetworkNumberIs => {
                if data.len() >= 2 {
                    let network = u16::from_be_bytes([data[0], data[1]]);
                    self.learn_network_number(port_id, network);
                }
            }
            other => {
                debug!("ignoring network message {} on port {}", other, port_id);
            }
        }
    }

    fn answer_who_is_router(&self, port_id: u8, data: &[u8], source_mac: &[u8]) {
        let networks = {
            let table = self.table.lock().unwrap();
            if data.len() >= 2 {
                let dnet = u16::from_be_bytes([data[0], data[1]]);
                match table.entry(dnet) {
                    Some(entry)
                        if entry.reachability == NetworkReachability::Reachable
                            && entry.port_id != port_id =>
                    {
                        vec![dnet]
                    }
                    _ => Vec::new(),
                }
            } else {
                table.reachable_networks(Some(port_id))
            }
        };
        if networks.is_empty() {
            return;
        }
        let mut body = Vec::with_capacity(networks.len() * 2);
        for network in networks {
            body.extend_from_slice(&network.to_be_bytes());
        }
        debug!(
            "answering Who-Is-Router on port {} toward {}",
            port_id,
            crate::util::format_mac(source_mac)
        );
        self.send_network_message(port_id, NetworkMessageType::IAmRouterToNetwork, body, None);
    }

    fn learn_routes(&self, port_id: u8, data: &[u8], source_mac: &[u8]) {
        let mut table = self.table.lock().unwrap();
        for dnet in parse_network_list(data) {
            // Never relearn a directly-connected network
            if matches!(table.entry(dnet), Some(entry) if entry.next_router_mac.is_none()) {
                continue;
            }
            let _ = table.update_route(dnet, port_id, Some(source_mac.to_vec()));
        }
    }

    fn learn_network_number(&self, port_id: u8, network: u16) {
        let mut table = self.table.lock().unwrap();
        let Some(port) = table.ports.get_mut(&port_id) else {
            return;
        };
        if port.network_number_configured || port.network_number == network {
            return;
        }
        let old = port.network_number;
        port.network_number = network;
        port.network_number_configured = false;
        table.remove_entry(old);
        let _ = table.update_route(network, port_id, None);
        info!("port {} learned network number {}", port_id, network);
    }

    fn mark_network_busy(&self, dnet: u16) {
        let mut table = self.table.lock().unwrap();
        if !table.mark_busy(dnet) {
            return;
        }
        let busy_timeout = self.config.busy_timeout;
        let weak = self.self_weak.clone();
        let timer = tokio::spawn(async move {
            tokio::time::sleep(busy_timeout).await;
            if let Some(inner) = weak.upgrade() {
                inner.table.lock().unwrap().mark_available_if_busy(dnet);
                debug!("network {} promoted back to reachable", dnet);
            }
        });
        table.set_busy_timer(dnet, timer);
    }

    /// Send a network message on one port (broadcast, or unicast when a
    /// MAC is given).
    fn send_network_message(
        &self,
        port_id: u8,
        message_type: NetworkMessageType,
        body: Vec<u8>,
        unicast_mac: Option<&[u8]>,
    ) {
        let transport = {
            let table = self.table.lock().unwrap();
            match table.port(port_id) {
                Some(port) => port.transport.clone(),
                None => return,
            }
        };
        let npdu = Npdu::network_message(message_type, body);
        let encoded = match npdu.encode() {
            Ok(bytes) => bytes,
            Err(e) => {
                warn!("failed to encode network message: {}", e);
                return;
            }
        };
        let result = match unicast_mac {
            Some(mac) => transport.send_unicast(&encoded, mac),
            None => transport.send_broadcast(&encoded),
        };
        if let Err(e) = result {
            warn!("failed to send network message on port {}: {}", port_id, e);
        }
    }

    // -- Application-layer send ---------------------------------------------

    fn send(
        &self,
        apdu: &[u8],
        destination: &BacnetAddress,
        expecting_reply: bool,
        priority: NetworkPriority,
    ) -> Result<()> {
        let app_port_id = self.application_port_id.ok_or_else(|| {
            NetworkError::Configuration("no application port configured".into())
        })?;

        let base = Npdu {
            expecting_reply,
            priority,
            apdu: apdu.to_vec(),
            ..Default::default()
        };

        // Local broadcast or unicast: emit on the application port with
        // no NPCI addressing.
        if destination.is_local() {
            let transport = self.port_transport(app_port_id)?;
            let encoded = base.encode()?;
            return if destination.is_broadcast() {
                transport
                    .send_broadcast(&encoded)
                    .map_err(|e| NetworkError::Configuration(e.to_string()))
            } else {
                transport
                    .send_unicast(&encoded, &destination.mac)
                    .map_err(|e| NetworkError::Configuration(e.to_string()))
            };
        }

        // Global broadcast: every port, destination preserved.
        if destination.is_global_broadcast() {
            let npdu = Npdu {
                destination: Some(destination.clone()),
                ..base
            };
            let encoded = npdu.encode()?;
            let transports: Vec<Arc<dyn TransportPort>> = {
                let table = self.table.lock().unwrap();
                table.ports().map(|p| p.transport.clone()).collect()
            };
            for transport in transports {
                let _ = transport.send_broadcast(&encoded);
            }
            return Ok(());
        }

        // Remote destination: route toward DNET.
        let dnet = destination
            .network
            .ok_or_else(|| NetworkError::InvalidAddress("missing network number".into()))?;

        enum Out {
            Direct(Arc<dyn TransportPort>),
            Hop(Arc<dyn TransportPort>, Vec<u8>),
        }
        let out = {
            let table = self.table.lock().unwrap();
            match table.route(dnet) {
                None => {
                    warn!("no route to network {} for send", dnet);
                    return Err(NetworkError::NetworkUnreachable(dnet));
                }
                Some((port, entry)) => match &entry.next_router_mac {
                    None => Out::Direct(port.transport.clone()),
                    Some(mac) => Out::Hop(port.transport.clone(), mac.clone()),
                },
            }
        };

        let npdu = Npdu {
            destination: Some(destination.clone()),
            ..base
        };
        let encoded = npdu.encode()?;
        let result = match out {
            Out::Direct(transport) => {
                if destination.mac.is_empty() {
                    transport.send_broadcast(&encoded)
                } else {
                    transport.send_unicast(&encoded, &destination.mac)
                }
            }
            Out::Hop(transport, next_hop_mac) => transport.send_unicast(&encoded, &next_hop_mac),
        };
        result.map_err(|e| NetworkError::Configuration(e.to_string()))
    }

    fn port_transport(&self, port_id: u8) -> Result<Arc<dyn TransportPort>> {
        let table = self.table.lock().unwrap();
        table
            .port(port_id)
            .map(|p| p.transport.clone())
            .ok_or_else(|| {
                NetworkError::Configuration(format!("application port {} not found", port_id))
            })
    }
}

/// Parse a list of 2-byte network numbers
fn parse_network_list(data: &[u8]) -> Vec<u16> {
    data.chunks_exact(2)
        .map(|c| u16::from_be_bytes([c[0], c[1]]))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::datalink::{ReceiveCallback, TransportPort};
    use async_trait::async_trait;

    #[derive(Debug, Clone, PartialEq)]
    enum Sent {
        Unicast(Vec<u8>, Vec<u8>),
        Broadcast(Vec<u8>),
    }

    #[derive(Default)]
    struct MockPort {
        mac: Vec<u8>,
        sent: Mutex<Vec<Sent>>,
        callback: Mutex<Option<ReceiveCallback>>,
    }

    impl MockPort {
        fn new(mac: Vec<u8>) -> Arc<Self> {
            Arc::new(Self {
                mac,
                ..Default::default()
            })
        }

        fn deliver(&self, npdu: &[u8], source_mac: &[u8]) {
            let callback = self.callback.lock().unwrap().clone().expect("not wired");
            callback(npdu, source_mac);
        }

        fn take_sent(&self) -> Vec<Sent> {
            std::mem::take(&mut self.sent.lock().unwrap())
        }
    }

    #[async_trait]
    impl TransportPort for MockPort {
        async fn start(&self) -> crate::datalink::Result<()> {
            Ok(())
        }

        async fn stop(&self) -> crate::datalink::Result<()> {
            Ok(())
        }

        fn send_unicast(&self, npdu: &[u8], mac: &[u8]) -> crate::datalink::Result<()> {
            self.sent
                .lock()
                .unwrap()
                .push(Sent::Unicast(npdu.to_vec(), mac.to_vec()));
            Ok(())
        }

        fn send_broadcast(&self, npdu: &[u8]) -> crate::datalink::Result<()> {
            self.sent.lock().unwrap().push(Sent::Broadcast(npdu.to_vec()));
            Ok(())
        }

        fn on_receive(&self, callback: ReceiveCallback) {
            *self.callback.lock().unwrap() = Some(callback);
        }

        fn local_mac(&self) -> Vec<u8> {
            self.mac.clone()
        }

        fn max_npdu_length(&self) -> usize {
            1497
        }
    }

    async fn two_port_router() -> (NetworkRouter, Arc<MockPort>, Arc<MockPort>) {
        let port1 = MockPort::new(vec![0x01]);
        let port2 = MockPort::new(vec![0x02]);
        let router = NetworkRouter::new(
            vec![
                RouterPort::new(1, 10, port1.clone()),
                RouterPort::new(2, 30, port2.clone()),
            ],
            Some(1),
        )
        .unwrap();
        router.start().await.unwrap();
        (router, port1, port2)
    }

    #[test]
    fn test_duplicate_port_and_network_rejected() {
        let port = MockPort::new(vec![0x01]);
        let mut table = RoutingTable::new();
        table.add_port(RouterPort::new(1, 10, port.clone())).unwrap();
        assert!(table.add_port(RouterPort::new(1, 20, port.clone())).is_err());
        assert!(table.add_port(RouterPort::new(2, 10, port)).is_err());
    }

    #[tokio::test]
    async fn test_hop_count_decrement_via_next_hop() {
        let (router, port1, port2) = two_port_router().await;
        router.with_table(|t| t.update_route(20, 2, Some(vec![0xCC])).unwrap());

        let npdu = Npdu {
            destination: Some(BacnetAddress::remote(20, vec![0x0B])),
            source: Some(BacnetAddress::remote(10, vec![0x0A])),
            hop_count: 128,
            apdu: vec![0xFF],
            ..Default::default()
        };
        port1.deliver(&npdu.encode().unwrap(), &[0x0A]);

        let sent = port2.take_sent();
        assert_eq!(sent.len(), 1);
        match &sent[0] {
            Sent::Unicast(frame, mac) => {
                assert_eq!(mac, &vec![0xCC]);
                let forwarded = Npdu::decode(frame).unwrap();
                assert_eq!(
                    forwarded.destination,
                    Some(BacnetAddress::remote(20, vec![0x0B]))
                );
                assert_eq!(forwarded.source, Some(BacnetAddress::remote(10, vec![0x0A])));
                assert_eq!(forwarded.hop_count, 127);
                assert_eq!(forwarded.apdu, vec![0xFF]);
            }
            other => panic!("expected unicast, got {:?}", other),
        }
        assert!(port1.take_sent().is_empty());
    }

    #[tokio::test]
    async fn test_hop_exhaustion_discards() {
        let (router, port1, port2) = two_port_router().await;
        router.with_table(|t| t.update_route(20, 2, Some(vec![0xCC])).unwrap());

        let npdu = Npdu {
            destination: Some(BacnetAddress::remote(20, vec![0x0B])),
            hop_count: 1,
            apdu: vec![0xFF],
            ..Default::default()
        };
        port1.deliver(&npdu.encode().unwrap(), &[0x0A]);

        assert!(port2.take_sent().is_empty());
        let (_, _, _, exhausted) = router.counters().snapshot();
        assert_eq!(exhausted, 1);
    }

    #[tokio::test]
    async fn test_directly_connected_strips_destination() {
        let (_router, port1, port2) = two_port_router().await;

        // Network 30 is directly connected on port 2
        let npdu = Npdu {
            destination: Some(BacnetAddress::remote(30, vec![0x0B])),
            hop_count: 200,
            apdu: vec![0xEE],
            ..Default::default()
        };
        port1.deliver(&npdu.encode().unwrap(), &[0x0A]);

        let sent = port2.take_sent();
        assert_eq!(sent.len(), 1);
        match &sent[0] {
            Sent::Unicast(frame, mac) => {
                assert_eq!(mac, &vec![0x0B]);
                let local = Npdu::decode(frame).unwrap();
                assert!(local.destination.is_none());
                // SNET/SADR injected from the arrival port
                assert_eq!(local.source, Some(BacnetAddress::remote(10, vec![0x0A])));
            }
            other => panic!("expected unicast, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_directed_broadcast_on_empty_dadr() {
        let (_router, port1, port2) = two_port_router().await;

        let npdu = Npdu {
            destination: Some(BacnetAddress::remote_broadcast(30)),
            apdu: vec![0xBB],
            ..Default::default()
        };
        port1.deliver(&npdu.encode().unwrap(), &[0x0A]);

        let sent = port2.take_sent();
        assert_eq!(sent.len(), 1);
        assert!(matches!(&sent[0], Sent::Broadcast(_)));
    }

    #[tokio::test]
    async fn test_global_broadcast_floods_and_delivers() {
        let (router, port1, port2) = two_port_router().await;
        let delivered = Arc::new(Mutex::new(Vec::new()));
        let sink = delivered.clone();
        router.set_application_callback(Arc::new(move |apdu, source| {
            sink.lock().unwrap().push((apdu.to_vec(), source.clone()));
        }));

        let npdu = Npdu {
            destination: Some(BacnetAddress::global_broadcast()),
            hop_count: 255,
            apdu: vec![0xAB],
            ..Default::default()
        };
        port1.deliver(&npdu.encode().unwrap(), &[0x0A]);

        // Delivered locally once
        let delivered = delivered.lock().unwrap();
        assert_eq!(delivered.len(), 1);
        assert_eq!(delivered[0].0, vec![0xAB]);

        // Flooded to port 2 only, with the hop count decremented
        assert!(port1.take_sent().is_empty());
        let sent = port2.take_sent();
        assert_eq!(sent.len(), 1);
        match &sent[0] {
            Sent::Broadcast(frame) => {
                let flooded = Npdu::decode(frame).unwrap();
                assert_eq!(flooded.hop_count, 254);
                assert!(flooded.destination.unwrap().is_global_broadcast());
            }
            other => panic!("expected broadcast, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_unknown_dnet_discarded_with_counter() {
        let (router, port1, port2) = two_port_router().await;

        let npdu = Npdu {
            destination: Some(BacnetAddress::remote(99, vec![0x0B])),
            apdu: vec![0xFF],
            ..Default::default()
        };
        port1.deliver(&npdu.encode().unwrap(), &[0x0A]);

        assert!(port2.take_sent().is_empty());
        let (_, _, unknown, _) = router.counters().snapshot();
        assert_eq!(unknown, 1);
    }

    #[tokio::test]
    async fn test_malformed_npdu_counted() {
        let (router, port1, _port2) = two_port_router().await;
        port1.deliver(&[0x01], &[0x0A]);
        let (_, malformed, _, _) = router.counters().snapshot();
        assert_eq!(malformed, 1);
    }

    #[tokio::test]
    async fn test_send_destination_kinds() {
        let (router, port1, port2) = two_port_router().await;
        router.with_table(|t| t.update_route(20, 2, Some(vec![0xCC])).unwrap());

        // Local broadcast goes out the application port without NPCI addressing
        router
            .send(&[0x10], &BacnetAddress::local_broadcast(), false, NetworkPriority::Normal)
            .unwrap();
        let sent = port1.take_sent();
        match &sent[..] {
            [Sent::Broadcast(frame)] => {
                let npdu = Npdu::decode(frame).unwrap();
                assert!(npdu.destination.is_none());
            }
            other => panic!("unexpected {:?}", other),
        }

        // Local unicast
        router
            .send(&[0x11], &BacnetAddress::local(vec![0x42]), true, NetworkPriority::Normal)
            .unwrap();
        assert!(matches!(&port1.take_sent()[..], [Sent::Unicast(_, mac)] if mac == &vec![0x42]));

        // Global broadcast goes out every port
        router
            .send(&[0x12], &BacnetAddress::global_broadcast(), false, NetworkPriority::Normal)
            .unwrap();
        assert_eq!(port1.take_sent().len(), 1);
        assert_eq!(port2.take_sent().len(), 1);

        // Remote unicast via next hop
        router
            .send(&[0x13], &BacnetAddress::remote(20, vec![0x0B]), true, NetworkPriority::Normal)
            .unwrap();
        let sent = port2.take_sent();
        match &sent[..] {
            [Sent::Unicast(frame, mac)] => {
                assert_eq!(mac, &vec![0xCC]);
                let npdu = Npdu::decode(frame).unwrap();
                assert_eq!(npdu.destination, Some(BacnetAddress::remote(20, vec![0x0B])));
            }
            other => panic!("unexpected {:?}", other),
        }

        // Unroutable destination is an error
        assert!(matches!(
            router.send(&[0x14], &BacnetAddress::remote(77, vec![0x0B]), true, NetworkPriority::Normal),
            Err(NetworkError::NetworkUnreachable(77))
        ));
    }

    #[tokio::test]
    async fn test_who_is_router_answered_excluding_arrival_port() {
        let (router, port1, _port2) = two_port_router().await;
        router.with_table(|t| t.update_route(20, 2, Some(vec![0xCC])).unwrap());

        let query = Npdu::network_message(NetworkMessageType::WhoIsRouterToNetwork, vec![]);
        port1.deliver(&query.encode().unwrap(), &[0x0A]);

        let sent = port1.take_sent();
        assert_eq!(sent.len(), 1);
        match &sent[0] {
            Sent::Broadcast(frame) => {
                let response = Npdu::decode(frame).unwrap();
                assert_eq!(
                    response.network_message_type(),
                    Some(NetworkMessageType::IAmRouterToNetwork)
                );
                // Networks 20 and 30 are reachable via port 2; network 10
                // is on the asking port and is not advertised.
                assert_eq!(response.network_message_data, vec![0x00, 20, 0x00, 30]);
            }
            other => panic!("expected broadcast, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_i_am_router_learns_routes() {
        let (router, port1, port2) = two_port_router().await;

        let announce =
            Npdu::network_message(NetworkMessageType::IAmRouterToNetwork, vec![0x00, 50, 0x00, 51]);
        port1.deliver(&announce.encode().unwrap(), &[0x77]);

        router.with_table(|t| {
            let entry = t.entry(50).expect("route learned");
            assert_eq!(entry.port_id, 1);
            assert_eq!(entry.next_router_mac, Some(vec![0x77]));
            assert!(t.entry(51).is_some());
            // Directly-connected entries are never overwritten
            assert!(t.entry(10).unwrap().next_router_mac.is_none());
        });

        // Forwarding now works toward the learned network
        let npdu = Npdu {
            destination: Some(BacnetAddress::remote(50, vec![0x0B])),
            apdu: vec![0x01],
            ..Default::default()
        };
        port2.deliver(&npdu.encode().unwrap(), &[0x0C]);
        assert!(matches!(&port1.take_sent()[..], [Sent::Unicast(_, mac)] if mac == &vec![0x77]));
    }

    #[tokio::test(start_paused = true)]
    async fn test_router_busy_promotes_after_timeout() {
        let (router, port1, _port2) = two_port_router().await;
        router.with_table(|t| t.update_route(20, 2, Some(vec![0xCC])).unwrap());

        let busy = Npdu::network_message(NetworkMessageType::RouterBusyToNetwork, vec![0x00, 20]);
        port1.deliver(&busy.encode().unwrap(), &[0xCC]);

        router.with_table(|t| {
            assert_eq!(t.entry(20).unwrap().reachability, NetworkReachability::Busy);
            // Busy networks are not advertised
            assert!(!t.reachable_networks(None).contains(&20));
        });

        // Congestion is advisory: forwarding still happens while Busy
        let npdu = Npdu {
            destination: Some(BacnetAddress::remote(20, vec![0x0B])),
            apdu: vec![0x01],
            ..Default::default()
        };
        port1.deliver(&npdu.encode().unwrap(), &[0x0A]);

        tokio::time::sleep(Duration::from_secs(31)).await;
        router.with_table(|t| {
            assert_eq!(
                t.entry(20).unwrap().reachability,
                NetworkReachability::Reachable
            );
        });
    }

    #[tokio::test]
    async fn test_router_available_clears_busy() {
        let (router, port1, _port2) = two_port_router().await;
        router.with_table(|t| t.update_route(20, 2, Some(vec![0xCC])).unwrap());
        router.mark_network_busy(20);

        let available =
            Npdu::network_message(NetworkMessageType::RouterAvailableToNetwork, vec![0x00, 20]);
        port1.deliver(&available.encode().unwrap(), &[0xCC]);

        router.with_table(|t| {
            assert_eq!(
                t.entry(20).unwrap().reachability,
                NetworkReachability::Reachable
            );
        });
    }

    #[tokio::test]
    async fn test_routing_determinism() {
        // The same input sequence always yields the same outbound frames
        let mut transcripts = Vec::new();
        for _ in 0..2 {
            let (router, port1, port2) = two_port_router().await;
            router.with_table(|t| t.update_route(20, 2, Some(vec![0xCC])).unwrap());
            let inputs = [
                Npdu {
                    destination: Some(BacnetAddress::remote(20, vec![0x0B])),
                    hop_count: 9,
                    apdu: vec![0x01],
                    ..Default::default()
                },
                Npdu {
                    destination: Some(BacnetAddress::remote(30, vec![0x0C])),
                    apdu: vec![0x02],
                    ..Default::default()
                },
                Npdu {
                    destination: Some(BacnetAddress::remote(99, vec![0x0D])),
                    apdu: vec![0x03],
                    ..Default::default()
                },
            ];
            for npdu in &inputs {
                port1.deliver(&npdu.encode().unwrap(), &[0x0A]);
            }
            transcripts.push((port1.take_sent(), port2.take_sent()));
        }
        assert_eq!(transcripts[0], transcripts[1]);
    }
}
