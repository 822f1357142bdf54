//! Per-link reliable transport: selective-repeat ARQ over a shared UDP
//! socket.
//!
//! Each neighbor link runs one [`Transport`]. The sender numbers packets with
//! a per-link monotonic sequence, keeps at most `window` of them
//! unacknowledged, and retransmits every in-flight packet on a fixed interval
//! until its ACK arrives; there is no give-up. The receiver ACKs everything
//! inside its window, buffers out-of-order packets, and hands payloads to the
//! upper layer strictly in sequence order, one [`Delivery`] per window slide.
//!
//! The owning node performs the artificial loss flip *before* calling in, so
//! the state here only ever sees datagrams that survived the link.

use std::collections::{BTreeMap, BTreeSet, VecDeque};
use std::mem;
use std::net::{Ipv4Addr, SocketAddr};
use std::sync::Arc;

use spin::Mutex;
use tokio::net::UdpSocket;
use tokio::sync::{mpsc, Notify};
use tokio::time::{self, Duration};
use tracing::{trace, warn};

use crate::config::TransportConfig;
use crate::message::{Datagram, Packet};

/// One in-order batch of payloads delivered by a link.
///
/// `raw_count` is the number of data datagrams observed on the link since the
/// previous delivery, counted before the loss flip and including duplicates;
/// the bulk-transfer statistics are computed from it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Delivery {
    /// Port of the neighbor the payloads came from.
    pub from: u16,
    /// Payloads in strict sequence order.
    pub payloads: Vec<String>,
    /// Raw data datagrams seen since the previous delivery.
    pub raw_count: u32,
}

/// The reliable transport of one directed neighbor link.
#[derive(Clone)]
pub struct Transport {
    inner: Arc<Inner>,
}

struct Inner {
    socket: Arc<UdpSocket>,
    peer: SocketAddr,
    window: u64,
    timeout: Duration,
    send: Mutex<SendWindow>,
    recv: Mutex<RecvWindow>,
    /// Signaled on every ACK so blocking sends can re-check their batch.
    acked: Notify,
    delivery: mpsc::UnboundedSender<Delivery>,
}

/// Sender-side window state. Sequence numbers are never reused or reset.
#[derive(Default)]
struct SendWindow {
    next_seq: u64,
    base: u64,
    /// Acked seqs at or above `base`; drained as the window slides.
    acked: BTreeSet<u64>,
    /// Packets assigned beyond the window, waiting for it to open.
    queued: VecDeque<Packet>,
    /// Transmitted, unacked packets; the retransmit timers read it.
    in_flight: BTreeMap<u64, Packet>,
}

/// Receiver-side window state.
#[derive(Default)]
struct RecvWindow {
    base: u64,
    /// Received but not yet deliverable packets, keyed by seq.
    buffered: BTreeMap<u64, Packet>,
    raw_count: u32,
}

impl Transport {
    /// Creates the transport for the link to `peer_port` on loopback.
    ///
    /// In-order batches are pushed onto `delivery`; the node consumes them
    /// from a single task.
    pub fn new(
        socket: Arc<UdpSocket>,
        peer_port: u16,
        config: &TransportConfig,
        delivery: mpsc::UnboundedSender<Delivery>,
    ) -> Self {
        Transport {
            inner: Arc::new(Inner {
                socket,
                peer: SocketAddr::from((Ipv4Addr::LOCALHOST, peer_port)),
                window: config.window,
                timeout: config.timeout(),
                send: Mutex::new(SendWindow::default()),
                recv: Mutex::new(RecvWindow::default()),
                acked: Notify::new(),
                delivery,
            }),
        }
    }

    /// Port of the peer this link leads to.
    pub fn peer_port(&self) -> u16 {
        self.inner.peer.port()
    }

    /// Sends one payload as a single packet and waits until it is acked.
    pub async fn send_message(&self, payload: &str) {
        self.send_batch(std::iter::once(payload.to_owned())).await;
    }

    /// Sends `count` independently-numbered packets carrying the same
    /// payload and waits until every one of them is acked.
    pub async fn send_burst(&self, payload: &str, count: u32) {
        self.send_batch((0..count).map(|_| payload.to_owned())).await;
    }

    async fn send_batch(&self, payloads: impl Iterator<Item = String>) {
        // Assign sequence numbers and split the batch into packets that fit
        // the current window and packets queued behind it.
        let (last, to_send) = {
            let mut send = self.inner.send.lock();
            let mut to_send = Vec::new();
            let mut last = None;
            for payload in payloads {
                let seq = send.next_seq;
                send.next_seq += 1;
                last = Some(seq);
                let packet = Packet { seq, payload };
                if seq < send.base + self.inner.window {
                    send.in_flight.insert(seq, packet.clone());
                    to_send.push(packet);
                } else {
                    send.queued.push_back(packet);
                }
            }
            (last, to_send)
        };
        let Some(last) = last else { return };
        for packet in to_send {
            self.inner.transmit(packet).await;
        }

        // Wait for the window base to pass the whole batch. The future is
        // registered before each check so an ACK landing in between is not
        // lost.
        let notified = self.inner.acked.notified();
        tokio::pin!(notified);
        loop {
            notified.as_mut().enable();
            if self.inner.send.lock().base > last {
                return;
            }
            notified.as_mut().await;
            notified.set(self.inner.acked.notified());
        }
    }

    /// Handles an ACK from the peer, sliding the window and transmitting any
    /// queued packets that now fit.
    ///
    /// ACKs outside `[base, base + window)` and duplicates are ignored: the
    /// sender and receiver windows stay equal in size, so the only ones seen
    /// in practice come from retransmissions racing their own ACK.
    pub async fn handle_ack(&self, seq: u64) {
        let to_send = {
            let mut send = self.inner.send.lock();
            let send = &mut *send;
            if seq < send.base || seq >= send.base + self.inner.window || send.acked.contains(&seq)
            {
                trace!(seq, base = send.base, peer = %self.inner.peer, "ignored ack");
                return;
            }
            send.acked.insert(seq);
            send.in_flight.remove(&seq);
            let mut to_send = Vec::new();
            if seq == send.base {
                while send.acked.remove(&send.base) {
                    send.base += 1;
                }
                let open_end = send.base + self.inner.window;
                while send.queued.front().is_some_and(|p| p.seq < open_end) {
                    let packet = send.queued.pop_front().unwrap();
                    send.in_flight.insert(packet.seq, packet.clone());
                    to_send.push(packet);
                }
            }
            to_send
        };
        self.inner.acked.notify_waiters();
        for packet in to_send {
            self.inner.transmit(packet).await;
        }
    }

    /// Handles a data packet from the peer: ACK, buffer, and deliver every
    /// now-contiguous payload in order.
    ///
    /// A packet at or above `base + window` breaks the equal-windows
    /// invariant and is dropped without an ACK.
    pub async fn handle_data(&self, packet: Packet) {
        let seq = packet.seq;
        let delivered = {
            let mut recv = self.inner.recv.lock();
            let recv = &mut *recv;
            if seq >= recv.base + self.inner.window {
                warn!(seq, base = recv.base, peer = %self.inner.peer, "data above window dropped");
                return;
            }
            let mut delivered = None;
            if seq >= recv.base && !recv.buffered.contains_key(&seq) {
                recv.buffered.insert(seq, packet);
                if seq == recv.base {
                    let mut payloads = Vec::new();
                    while let Some(p) = recv.buffered.remove(&recv.base) {
                        payloads.push(p.payload);
                        recv.base += 1;
                    }
                    delivered = Some(Delivery {
                        from: self.inner.peer.port(),
                        payloads,
                        raw_count: mem::take(&mut recv.raw_count),
                    });
                }
            } else {
                trace!(seq, base = recv.base, "duplicate or stale data, re-acked");
            }
            delivered
        };
        self.inner.send_raw(&Datagram::Ack(seq).to_string()).await;
        if let Some(delivery) = delivered {
            // The node's delivery task outlives every transport.
            let _ = self.inner.delivery.send(delivery);
        }
    }

    /// Counts one raw data datagram, ahead of the owner's loss flip.
    pub fn bump_raw_count(&self) {
        self.inner.recv.lock().raw_count += 1;
    }
}

impl Inner {
    /// First transmission of a packet: send it and start its retransmit
    /// timer. The packet is already registered in `in_flight`.
    async fn transmit(self: &Arc<Self>, packet: Packet) {
        trace!(seq = packet.seq, peer = %self.peer, "send data");
        self.send_raw(&packet.to_string()).await;
        let inner = self.clone();
        let seq = packet.seq;
        tokio::spawn(async move {
            loop {
                time::sleep(inner.timeout).await;
                let wire = {
                    let send = inner.send.lock();
                    match send.in_flight.get(&seq) {
                        Some(packet) => packet.to_string(),
                        None => return,
                    }
                };
                trace!(seq, peer = %inner.peer, "retransmit");
                inner.send_raw(&wire).await;
            }
        });
    }

    /// One unreliable datagram to the peer. Send errors are swallowed; the
    /// retransmit timer is the only retry mechanism.
    async fn send_raw(&self, wire: &str) {
        if let Err(e) = self.socket.send_to(wire.as_bytes(), self.peer).await {
            trace!(peer = %self.peer, "send failed: {e}");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::Rng;

    fn config(window: u64, timeout_ms: u64) -> TransportConfig {
        TransportConfig { window, timeout_ms }
    }

    struct End {
        transport: Transport,
        delivered: mpsc::UnboundedReceiver<Delivery>,
        port: u16,
    }

    /// Wires two transports over real loopback sockets, with an inbound loss
    /// flip at each end, the way a node's receive loop drives them.
    async fn link(config: TransportConfig, loss_a: f64, loss_b: f64) -> (End, End) {
        let socket_a = Arc::new(UdpSocket::bind("127.0.0.1:0").await.unwrap());
        let socket_b = Arc::new(UdpSocket::bind("127.0.0.1:0").await.unwrap());
        let port_a = socket_a.local_addr().unwrap().port();
        let port_b = socket_b.local_addr().unwrap().port();
        let (tx_a, rx_a) = mpsc::unbounded_channel();
        let (tx_b, rx_b) = mpsc::unbounded_channel();
        let a = Transport::new(socket_a.clone(), port_b, &config, tx_a);
        let b = Transport::new(socket_b.clone(), port_a, &config, tx_b);
        tokio::spawn(pump(socket_a, a.clone(), loss_a));
        tokio::spawn(pump(socket_b, b.clone(), loss_b));
        (
            End {
                transport: a,
                delivered: rx_a,
                port: port_a,
            },
            End {
                transport: b,
                delivered: rx_b,
                port: port_b,
            },
        )
    }

    async fn pump(socket: Arc<UdpSocket>, transport: Transport, loss: f64) {
        let mut buf = vec![0u8; 4096];
        loop {
            let Ok((len, _)) = socket.recv_from(&mut buf).await else {
                return;
            };
            let text = std::str::from_utf8(&buf[..len]).unwrap();
            let datagram: Datagram = text.parse().unwrap();
            if matches!(datagram, Datagram::Data(_)) {
                transport.bump_raw_count();
            }
            if rand::thread_rng().gen_bool(loss) {
                continue;
            }
            match datagram {
                Datagram::Ack(seq) => transport.handle_ack(seq).await,
                Datagram::Data(packet) => transport.handle_data(packet).await,
            }
        }
    }

    async fn next_payloads(end: &mut End) -> Vec<String> {
        end.delivered.recv().await.unwrap().payloads
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn delivers_one_message() {
        // Timeout far beyond any loopback round trip: no retransmit may
        // inflate the raw count.
        let (a, mut b) = link(config(10, 5_000), 0.0, 0.0).await;
        a.transport.send_message("hello").await;
        let delivery = b.delivered.recv().await.unwrap();
        assert_eq!(delivery.payloads, ["hello"]);
        assert_eq!(delivery.raw_count, 1);
        assert_eq!(delivery.from, a.port);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn burst_completes_under_loss() {
        let (a, mut b) = link(config(5, 40), 0.3, 0.3).await;
        // Returning at all proves every packet of the batch was acked.
        a.transport.send_burst("SEND_1,2,20", 20).await;
        let mut payloads = Vec::new();
        while payloads.len() < 20 {
            payloads.extend(next_payloads(&mut b).await);
        }
        assert_eq!(payloads.len(), 20);
        assert!(payloads.iter().all(|p| p == "SEND_1,2,20"));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn delivery_order_matches_injection_order() {
        let (a, mut b) = link(config(10, 40), 0.25, 0.25).await;
        let sent: Vec<String> = (0..30).map(|i| format!("msg-{i}")).collect();
        for payload in &sent {
            a.transport.send_message(payload).await;
        }
        let mut received = Vec::new();
        while received.len() < sent.len() {
            received.extend(next_payloads(&mut b).await);
        }
        assert_eq!(received, sent);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn queues_packets_beyond_the_window() {
        let (a, mut b) = link(config(4, 300), 0.0, 0.0).await;
        a.transport.send_burst("burst", 12).await;
        let mut payloads = Vec::new();
        while payloads.len() < 12 {
            payloads.extend(next_payloads(&mut b).await);
        }
        let send = a.transport.inner.send.lock();
        assert_eq!(send.base, 12);
        assert_eq!(send.next_seq, 12);
        assert!(send.queued.is_empty());
        assert!(send.in_flight.is_empty());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn receiver_acks_duplicates_but_delivers_once() {
        // No pump on the probe side: read the raw ACKs ourselves.
        let probe = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let socket = Arc::new(UdpSocket::bind("127.0.0.1:0").await.unwrap());
        let (tx, mut rx) = mpsc::unbounded_channel();
        let transport = Transport::new(
            socket,
            probe.local_addr().unwrap().port(),
            &config(10, 300),
            tx,
        );

        let packet = Packet {
            seq: 0,
            payload: "dup".to_owned(),
        };
        transport.handle_data(packet.clone()).await;
        transport.handle_data(packet).await;

        let mut buf = [0u8; 64];
        for _ in 0..2 {
            let (len, _) = probe.recv_from(&mut buf).await.unwrap();
            assert_eq!(&buf[..len], b"ACK,0");
        }
        assert_eq!(rx.recv().await.unwrap().payloads, ["dup"]);
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn data_above_window_gets_no_ack() {
        let probe = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let socket = Arc::new(UdpSocket::bind("127.0.0.1:0").await.unwrap());
        let (tx, mut rx) = mpsc::unbounded_channel();
        let transport = Transport::new(
            socket,
            probe.local_addr().unwrap().port(),
            &config(10, 300),
            tx,
        );

        transport
            .handle_data(Packet {
                seq: 10,
                payload: "anomaly".to_owned(),
            })
            .await;

        let mut buf = [0u8; 64];
        let silent =
            time::timeout(Duration::from_millis(100), probe.recv_from(&mut buf)).await;
        assert!(silent.is_err(), "above-window data must not be acked");
        assert!(rx.try_recv().is_err());
        assert_eq!(transport.inner.recv.lock().base, 0);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn acks_outside_the_window_are_ignored() {
        let probe = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let socket = Arc::new(UdpSocket::bind("127.0.0.1:0").await.unwrap());
        let (tx, _rx) = mpsc::unbounded_channel();
        let transport = Transport::new(
            socket,
            probe.local_addr().unwrap().port(),
            &config(10, 300),
            tx,
        );

        let sender = transport.clone();
        let batch = tokio::spawn(async move { sender.send_message("one").await });

        let mut buf = [0u8; 64];
        let (len, _) = probe.recv_from(&mut buf).await.unwrap();
        assert_eq!(&buf[..len], b"0_one");

        // Above the window and entirely unsent: both must leave state alone.
        transport.handle_ack(10).await;
        transport.handle_ack(10_000).await;
        assert_eq!(transport.inner.send.lock().base, 0);

        transport.handle_ack(0).await;
        batch.await.unwrap();
        assert_eq!(transport.inner.send.lock().base, 1);

        // Duplicate of an ack already consumed by the window slide.
        transport.handle_ack(0).await;
        assert_eq!(transport.inner.send.lock().base, 1);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn raw_count_resets_per_delivery() {
        let (a, mut b) = link(config(10, 5_000), 0.0, 0.0).await;
        a.transport.send_message("first").await;
        assert_eq!(b.delivered.recv().await.unwrap().raw_count, 1);
        a.transport.send_message("second").await;
        assert_eq!(b.delivered.recv().await.unwrap().raw_count, 1);
    }
}
