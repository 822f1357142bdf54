//! The node orchestrator: one loopback UDP socket, a reliable transport per
//! neighbor link, the distance-vector glue, and the bulk-transfer state
//! machine.
//!
//! Concurrency layout: everything above the transports (routing table,
//! advertisement caches, send lifecycle, statistics) lives in one `State`
//! behind a `tokio::sync::Mutex`, and that lock *is* held across blocking
//! sends: a whole `change` or burst runs as one critical section. The
//! receive loop never takes it: ACKs go straight to the per-link transport,
//! so the blocking send the lock protects can still complete. In-order
//! deliveries queue on an unbounded channel and are applied by a single
//! task, one batch at a time.

use std::collections::BTreeMap;
use std::io;
use std::mem;
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

use rand::Rng;
use spin::Mutex as SpinMutex;
use tokio::net::UdpSocket;
use tokio::sync::{mpsc, Mutex};
use tracing::{debug, trace, warn};

use crate::command::{CommandError, SendCommand, SendKey, SendStat};
use crate::config::{NodeConfig, TransportConfig};
use crate::message::{Control, Datagram};
use crate::report::Reporter;
use crate::routing::{link_weight, round3, Route, RoutingTable};
use crate::transport::{Delivery, Transport};

/// A directly-connected peer: its link parameters and reliable transport.
pub struct Neighbor {
    port: u16,
    /// Spin-guarded so the receive loop can flip the loss coin without
    /// touching the node lock.
    link: SpinMutex<Link>,
    transport: Transport,
}

#[derive(Clone, Copy)]
struct Link {
    loss_rate: f64,
    weight: f64,
}

impl Neighbor {
    fn new(port: u16, loss_rate: f64, transport: Transport) -> Self {
        let loss_rate = round3(loss_rate);
        Neighbor {
            port,
            link: SpinMutex::new(Link {
                loss_rate,
                weight: link_weight(loss_rate),
            }),
            transport,
        }
    }

    /// Port of this neighbor; its name everywhere in the protocol.
    pub fn port(&self) -> u16 {
        self.port
    }

    /// Probability that an inbound datagram from this neighbor is dropped.
    pub fn loss_rate(&self) -> f64 {
        self.link.lock().loss_rate
    }

    /// Routing weight of the link, `round3(1 / (1 - loss_rate))`.
    pub fn weight(&self) -> f64 {
        self.link.lock().weight
    }

    /// Stores a new loss rate and re-derives the weight. Returns `false`
    /// when the rate equals the stored one after rounding.
    fn set_loss_rate(&self, loss_rate: f64) -> bool {
        let loss_rate = round3(loss_rate);
        let mut link = self.link.lock();
        if link.loss_rate == loss_rate {
            return false;
        }
        link.loss_rate = loss_rate;
        link.weight = link_weight(loss_rate);
        true
    }
}

/// Upper-layer state, serialized behind the node-wide lock.
#[derive(Default)]
struct State {
    table: RoutingTable,
    /// Latest advertisement of each neighbor, replaced wholesale.
    adverts: BTreeMap<u16, Vec<Route>>,
    /// Set once the first full broadcast loop has run; afterwards empty
    /// advertisements are skipped instead of sent as bootstrap markers.
    sent_broadcast: bool,
    current_send: Option<SendCommand>,
    stats: BTreeMap<SendKey, SendStat>,
}

/// Handle to a running node. Clones share the node.
#[derive(Clone)]
pub struct Node {
    inner: Arc<Inner>,
}

struct Inner {
    port: u16,
    socket: Arc<UdpSocket>,
    /// Fixed at startup; links change cost but never appear or vanish.
    neighbors: BTreeMap<u16, Neighbor>,
    state: Mutex<State>,
    reporter: Arc<dyn Reporter>,
}

impl Node {
    /// Binds `127.0.0.1:<port>` and brings the node up: receive loop,
    /// delivery task, the initial table, and, when flagged `last`, the
    /// bootstrap broadcast that opens the distance-vector exchange.
    pub async fn start(
        config: NodeConfig,
        transport: TransportConfig,
        reporter: Arc<dyn Reporter>,
    ) -> io::Result<Node> {
        let socket = UdpSocket::bind(("127.0.0.1", config.port)).await?;
        Ok(Node::start_on(socket, config, &transport, reporter).await)
    }

    async fn start_on(
        socket: UdpSocket,
        config: NodeConfig,
        transport: &TransportConfig,
        reporter: Arc<dyn Reporter>,
    ) -> Node {
        let socket = Arc::new(socket);
        let (delivery_tx, delivery_rx) = mpsc::unbounded_channel();
        let neighbors = config
            .neighbors
            .iter()
            .map(|(&port, &rate)| {
                let transport =
                    Transport::new(socket.clone(), port, transport, delivery_tx.clone());
                (port, Neighbor::new(port, rate, transport))
            })
            .collect();
        let inner = Arc::new(Inner {
            port: config.port,
            socket,
            neighbors,
            state: Mutex::new(State::default()),
            reporter,
        });
        tokio::spawn(inner.clone().receive_loop());
        tokio::spawn(inner.clone().delivery_loop(delivery_rx));

        // Seed the table with the direct links and show it; the last node
        // additionally kicks off the network-wide exchange.
        {
            let mut guard = inner.state.lock().await;
            let state = &mut *guard;
            state.table.recompute(&inner.link_weights(), &state.adverts);
            inner.reporter.routing_table(inner.port, &state.table.routes());
            if config.last {
                inner.broadcast(state).await;
            }
        }
        Node { inner }
    }

    /// This node's port.
    pub fn port(&self) -> u16 {
        self.inner.port
    }

    /// The neighbor on `port`, if that link exists.
    pub fn neighbor(&self, port: u16) -> Option<&Neighbor> {
        self.inner.neighbors.get(&port)
    }

    /// Snapshot of the routing table, in ascending destination order.
    pub async fn routes(&self) -> Vec<Route> {
        self.inner.state.lock().await.table.routes()
    }

    /// Applies a `change` command: for every listed link whose rounded
    /// rate actually moves, retune it locally and tell that neighbor,
    /// blocking until the notice is acked. Once all notices are out,
    /// recompute and re-advertise if the table moved. Naming only
    /// unchanged rates is a complete no-op.
    pub async fn change(&self, updates: &[(u16, f64)]) {
        let inner = &self.inner;
        let mut state = inner.state.lock().await;
        let mut any = false;
        for &(port, rate) in updates {
            let Some(neighbor) = inner.neighbors.get(&port) else {
                warn!(node = inner.port, port, "change names an unknown neighbor, skipped");
                continue;
            };
            if !neighbor.set_loss_rate(rate) {
                trace!(node = inner.port, port, rate, "change is a no-op");
                continue;
            }
            any = true;
            let (rate, weight) = (neighbor.loss_rate(), neighbor.weight());
            debug!(node = inner.port, port, rate, weight, "link retuned");
            inner.reporter.link_cost_changed(port, rate, weight);
            neighbor
                .transport
                .send_message(&Control::Change(rate).to_string())
                .await;
        }
        if any {
            inner.recompute_and_advertise(&mut state).await;
        }
    }

    /// Applies a `send` command: plan one leg per neighbor (ascending
    /// port order) and launch the first burst. Returns once that burst is
    /// fully acked; later legs advance as END notices come back.
    pub async fn send(&self, dest: u16, count: u32) -> Result<(), CommandError> {
        if count == 0 {
            return Err(CommandError::EmptyBurst);
        }
        let inner = &self.inner;
        let mut state = inner.state.lock().await;
        if state.table.next_hop(dest).is_none() {
            return Err(CommandError::NoRoute(dest));
        }
        if state.current_send.is_some() {
            return Err(CommandError::SendBusy);
        }
        let mut command = SendCommand::new(dest, count, inner.neighbors.keys().copied());
        // A routable destination implies at least one neighbor.
        let Some(first) = command.next_leg() else {
            return Err(CommandError::NoRoute(dest));
        };
        command.started_at = now_millis();
        state.current_send = Some(command);
        let key = SendKey {
            source: inner.port,
            dest,
            count,
        };
        inner.dispatch_burst(first, key).await;
        Ok(())
    }
}

impl Inner {
    fn link_weights(&self) -> BTreeMap<u16, f64> {
        self.neighbors
            .iter()
            .map(|(&port, neighbor)| (port, neighbor.weight()))
            .collect()
    }

    /// Recomputes the table; on change, shows it and re-advertises.
    /// Returns whether the table changed.
    async fn recompute_and_advertise(&self, state: &mut State) -> bool {
        let changed = state.table.recompute(&self.link_weights(), &state.adverts);
        if changed {
            debug!(node = self.port, "routing table changed");
            self.reporter.routing_table(self.port, &state.table.routes());
            self.broadcast(state).await;
        }
        changed
    }

    /// Advertises the table to every neighbor, split horizon applied. An
    /// empty advertisement goes out only while this node has never
    /// broadcast, as the bootstrap marker that wakes silent links up.
    async fn broadcast(&self, state: &mut State) {
        for (&port, neighbor) in &self.neighbors {
            let advert = state.table.advertisement(port);
            if advert.is_empty() && state.sent_broadcast {
                continue;
            }
            neighbor
                .transport
                .send_message(&Control::Dv(advert).to_string())
                .await;
            self.reporter.dv_sent(port);
        }
        state.sent_broadcast = true;
    }

    /// One blocking burst of `key.count` packets over the link to `to`.
    async fn dispatch_burst(&self, to: u16, key: SendKey) {
        let Some(neighbor) = self.neighbors.get(&to) else {
            warn!(node = self.port, to, "burst toward a non-neighbor dropped");
            return;
        };
        let payload = Control::Send {
            source: key.source,
            dest: key.dest,
            count: key.count,
        }
        .to_string();
        self.reporter.transfer_started(self.port);
        neighbor.transport.send_burst(&payload, key.count).await;
        self.reporter.transfer_finished(self.port);
    }

    /// One blocking END notice over the link to `to`.
    async fn send_end(&self, to: u16, end: &Control) {
        let Some(neighbor) = self.neighbors.get(&to) else {
            warn!(node = self.port, to, "end notice toward a non-neighbor dropped");
            return;
        };
        self.reporter.transfer_started(self.port);
        neighbor.transport.send_message(&end.to_string()).await;
        self.reporter.transfer_finished(self.port);
    }

    async fn receive_loop(self: Arc<Self>) {
        let mut buf = vec![0u8; 4096];
        loop {
            let (len, from) = match self.socket.recv_from(&mut buf).await {
                Ok(received) => received,
                Err(e) => {
                    warn!(node = self.port, "socket receive failed: {e}");
                    continue;
                }
            };
            let Some(neighbor) = self.neighbors.get(&from.port()) else {
                warn!(node = self.port, %from, "datagram from unknown port dropped");
                continue;
            };
            let datagram: Datagram = match std::str::from_utf8(&buf[..len]).map(str::parse) {
                Ok(Ok(datagram)) => datagram,
                _ => {
                    warn!(node = self.port, from = neighbor.port, "malformed datagram dropped");
                    continue;
                }
            };
            // Raw data datagrams count toward the loss statistics even
            // when the flip right below eats them.
            if matches!(datagram, Datagram::Data(_)) {
                neighbor.transport.bump_raw_count();
            }
            if rand::thread_rng().gen_bool(neighbor.loss_rate()) {
                trace!(node = self.port, from = neighbor.port, "datagram lost on the link");
                continue;
            }
            match datagram {
                Datagram::Ack(seq) => neighbor.transport.handle_ack(seq).await,
                Datagram::Data(packet) => neighbor.transport.handle_data(packet).await,
            }
        }
    }

    async fn delivery_loop(self: Arc<Self>, mut deliveries: mpsc::UnboundedReceiver<Delivery>) {
        while let Some(delivery) = deliveries.recv().await {
            self.process_delivery(delivery).await;
        }
    }

    async fn process_delivery(&self, delivery: Delivery) {
        let mut state = self.state.lock().await;
        let from = delivery.from;
        // The batch's raw count is credited to its first burst packet.
        let mut raw = delivery.raw_count;
        for payload in delivery.payloads {
            let control: Control = match payload.parse() {
                Ok(control) => control,
                Err(_) => {
                    warn!(node = self.port, from, payload = %payload, "unparseable message dropped");
                    continue;
                }
            };
            trace!(node = self.port, from, message = %control, "delivered");
            match control {
                Control::Dv(routes) => self.handle_dv(&mut state, from, routes).await,
                Control::Change(rate) => self.handle_change(&mut state, from, rate).await,
                Control::Send {
                    source,
                    dest,
                    count,
                } => {
                    let key = SendKey {
                        source,
                        dest,
                        count,
                    };
                    self.handle_burst_packet(&mut state, from, key, mem::take(&mut raw))
                        .await;
                }
                Control::End {
                    source,
                    finish_millis,
                } => self.handle_end(&mut state, source, finish_millis).await,
            }
        }
    }

    /// A neighbor advertised its table: cache it wholesale, recompute,
    /// and make sure this node's own first broadcast eventually happens
    /// even if nothing changed, so the bootstrap flood reaches everyone.
    async fn handle_dv(&self, state: &mut State, from: u16, routes: Vec<Route>) {
        self.reporter.dv_received(from);
        state.adverts.insert(from, routes);
        let changed = self.recompute_and_advertise(state).await;
        if !changed && !state.sent_broadcast {
            self.broadcast(state).await;
        }
    }

    /// The neighbor on `from` retuned the link from its side; mirror it.
    async fn handle_change(&self, state: &mut State, from: u16, rate: f64) {
        if !(0.0..1.0).contains(&rate) {
            warn!(node = self.port, from, rate, "change notice with invalid rate dropped");
            return;
        }
        let Some(neighbor) = self.neighbors.get(&from) else {
            return;
        };
        if !neighbor.set_loss_rate(rate) {
            return;
        }
        let (rate, weight) = (neighbor.loss_rate(), neighbor.weight());
        debug!(node = self.port, from, rate, weight, "link retuned by neighbor");
        self.reporter.link_cost_changed(from, rate, weight);
        self.recompute_and_advertise(state).await;
    }

    /// One packet of a bulk burst arrived in order. Tally it; the packet
    /// completing the burst either triggers the END notice back to the
    /// source (here at the destination) or pushes the whole burst one hop
    /// further along the route.
    async fn handle_burst_packet(&self, state: &mut State, from: u16, key: SendKey, raw: u32) {
        let stat = state.stats.entry(key).or_default();
        stat.record(raw);
        if stat.valid < key.count {
            return;
        }
        let stat = *stat;
        state.stats.remove(&key);
        debug!(node = self.port, from, ?key, total = stat.total, "burst complete");
        self.reporter
            .burst_received(from, key, stat.total, stat.loss_rate());
        if key.dest == self.port {
            let end = Control::End {
                source: key.source,
                finish_millis: now_millis(),
            };
            match state.table.next_hop(key.source) {
                Some(next) => self.send_end(next, &end).await,
                None => {
                    warn!(node = self.port, source = key.source, "no route for end notice, dropped")
                }
            }
        } else {
            match state.table.next_hop(key.dest) {
                Some(next) => self.dispatch_burst(next, key).await,
                None => warn!(node = self.port, dest = key.dest, "no route to forward burst, dropped"),
            }
        }
    }

    /// An END notice came back. At the burst's source it closes the
    /// current leg and launches the next; anywhere else it is relayed
    /// toward that source.
    async fn handle_end(&self, state: &mut State, source: u16, finish_millis: u64) {
        if source != self.port {
            let end = Control::End {
                source,
                finish_millis,
            };
            match state.table.next_hop(source) {
                Some(next) => self.send_end(next, &end).await,
                None => warn!(node = self.port, source, "no route to relay end notice, dropped"),
            }
            return;
        }
        let Some(command) = state.current_send.as_mut() else {
            warn!(node = self.port, "end notice without an outstanding send");
            return;
        };
        let elapsed = finish_millis.saturating_sub(command.started_at);
        self.reporter
            .leg_finished(command.current, command.dest, elapsed);
        match command.next_leg() {
            Some(next) => {
                command.started_at = now_millis();
                let key = SendKey {
                    source: self.port,
                    dest: command.dest,
                    count: command.count,
                };
                self.dispatch_burst(next, key).await;
            }
            None => {
                let dest = command.dest;
                state.current_send = None;
                debug!(node = self.port, dest, "send command complete");
                self.reporter.send_finished(dest);
            }
        }
    }
}

/// Milliseconds since the UNIX epoch; every node shares the host clock.
fn now_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}
