//! The server: socket tasks, dispatcher and peer table.
//!
//! Datagrams from every listening port and frames from the interface meet
//! in one dispatcher loop. Routing is by flag byte; data frames back out to
//! peers are keyed by the destination tunnel IP. Each peer is one
//! `Arc<Peer>` indexed twice in the table: under its session key and, once
//! a tunnel address is assigned, under the IP-derived route key.

use std::collections::HashMap;
use std::net::{Ipv4Addr, SocketAddr};
use std::sync::Arc;
use std::time::Duration;

use log::{debug, error, info, warn};
use tokio::net::UdpSocket;
use tokio::sync::{broadcast, mpsc, oneshot, Mutex, RwLock};
use tokio::time::sleep;

use porthop_protocol::transport::{TunTransport, UdpTransport};
use porthop_protocol::{
    flags, fragmentate, route_key, Cipher, Ipv4Pool, Morpher, Packet, RandMorpher, Reassembler,
    SessionId, SessionState, HDR_LEN, IFACE_BUFSIZE, STALE_AFTER,
};

use crate::config::{Config, MorphKind};
use crate::error::{Error, Result};
use crate::peer::Peer;

const QUEUE_CAP: usize = 2048;
const HANDSHAKE_RETRIES: u32 = 5;
const HANDSHAKE_RETRY_INTERVAL: Duration = Duration::from_secs(2);

// flag byte combinations the dispatcher routes on
const KNOCK: u8 = flags::PSH;
const HEARTBEAT_ACK: u8 = flags::PSH | flags::ACK;
const HANDSHAKE: u8 = flags::HSH;
const HANDSHAKE_ACK: u8 = flags::HSH | flags::ACK;
const DATA: u8 = flags::DAT;
const DATA_MFR: u8 = flags::DAT | flags::MFR;
const FINISH: u8 = flags::FIN;

struct Inbound {
    addr: SocketAddr,
    port_index: usize,
    data: Vec<u8>,
}

struct Outbound {
    addr: SocketAddr,
    data: Vec<u8>,
}

struct Queues {
    from_net_rx: mpsc::Receiver<Inbound>,
    from_iface_rx: mpsc::Receiver<Vec<u8>>,
    to_net_rx: Vec<mpsc::Receiver<Outbound>>,
    to_iface_rx: mpsc::Receiver<Vec<u8>>,
}

pub struct Server {
    config: Config,
    cipher: Cipher,
    gateway: Ipv4Addr,
    mask: u8,
    peers: RwLock<HashMap<u64, Arc<Peer>>>,
    pool: Mutex<Ipv4Pool>,
    reassembler: Mutex<Reassembler>,
    morpher: Option<Mutex<Box<dyn Morpher>>>,
    from_net_tx: mpsc::Sender<Inbound>,
    from_iface_tx: mpsc::Sender<Vec<u8>>,
    to_net_tx: Vec<mpsc::Sender<Outbound>>,
    to_iface_tx: mpsc::Sender<Vec<u8>>,
    queues: std::sync::Mutex<Option<Queues>>,
    shutdown: broadcast::Sender<()>,
}

impl Server {
    pub fn new(config: Config) -> Result<Arc<Server>> {
        config.validate()?;
        let pool = Ipv4Pool::from_cidr(&config.server.tunnel_network)?;
        let cipher = Cipher::new(config.common.key.as_bytes());
        let morpher: Option<Mutex<Box<dyn Morpher>>> = match config.common.morph {
            MorphKind::None => None,
            MorphKind::Randsize => Some(Mutex::new(Box::new(RandMorpher::new(config.common.mtu)))),
        };

        let port_count = config.port_count();
        let mut to_net_tx = Vec::with_capacity(port_count);
        let mut to_net_rx = Vec::with_capacity(port_count);
        for _ in 0..port_count {
            let (tx, rx) = mpsc::channel(QUEUE_CAP);
            to_net_tx.push(tx);
            to_net_rx.push(rx);
        }
        let (from_net_tx, from_net_rx) = mpsc::channel(QUEUE_CAP);
        let (from_iface_tx, from_iface_rx) = mpsc::channel(QUEUE_CAP);
        let (to_iface_tx, to_iface_rx) = mpsc::channel(QUEUE_CAP);
        let (shutdown, _) = broadcast::channel(4);

        Ok(Arc::new(Server {
            gateway: pool.gateway(),
            mask: pool.mask(),
            cipher,
            config,
            peers: RwLock::new(HashMap::new()),
            pool: Mutex::new(pool),
            reassembler: Mutex::new(Reassembler::new()),
            morpher,
            from_net_tx,
            from_iface_tx,
            to_net_tx,
            to_iface_tx,
            queues: std::sync::Mutex::new(Some(Queues {
                from_net_rx,
                from_iface_rx,
                to_net_rx,
                to_iface_rx,
            })),
            shutdown,
        }))
    }

    /// The server's own tunnel address.
    pub fn gateway(&self) -> Ipv4Addr {
        self.gateway
    }

    /// Handle for triggering a graceful shutdown from outside.
    pub fn shutdown_handle(&self) -> broadcast::Sender<()> {
        self.shutdown.clone()
    }

    pub async fn peer_count(&self) -> usize {
        self.peers
            .read()
            .await
            .keys()
            .filter(|k| **k >= 1u64 << 32)
            .count()
    }

    /// Binds the port range, spawns the I/O tasks and runs the dispatcher
    /// until shutdown is signalled. On the way out every connected peer is
    /// notified.
    pub async fn run(self: Arc<Self>, tun: Arc<dyn TunTransport>) -> Result<()> {
        let queues = {
            let mut slot = match self.queues.lock() {
                Ok(s) => s,
                Err(poisoned) => poisoned.into_inner(),
            };
            slot.take().ok_or(Error::AlreadyRunning)?
        };
        let Queues {
            mut from_net_rx,
            mut from_iface_rx,
            to_net_rx,
            mut to_iface_rx,
        } = queues;

        let mut sockets: Vec<Arc<dyn UdpTransport>> = Vec::with_capacity(self.config.port_count());
        for port in self.config.ports() {
            let socket = UdpSocket::bind((self.config.server.listen, port)).await?;
            sockets.push(Arc::new(socket));
        }
        if tun.mtu() < self.config.common.mtu {
            warn!(
                "interface mtu {} is below the configured mtu {}",
                tun.mtu(),
                self.config.common.mtu
            );
        }
        let [start, end] = self.config.server.port_range;
        info!(
            "listening on {} udp ports {start}..={end}, tunnel gateway {}/{}",
            sockets.len(),
            self.gateway,
            self.mask
        );

        for (port_index, socket) in sockets.iter().enumerate() {
            let socket = socket.clone();
            let tx = self.from_net_tx.clone();
            let mut shutdown = self.shutdown.subscribe();
            tokio::spawn(async move {
                let mut buf = vec![0u8; IFACE_BUFSIZE];
                loop {
                    tokio::select! {
                        received = socket.recv_from(&mut buf) => match received {
                            Ok((n, addr)) => {
                                let msg = Inbound { addr, port_index, data: buf[..n].to_vec() };
                                if tx.send(msg).await.is_err() {
                                    break;
                                }
                            }
                            Err(e) => {
                                error!("udp recv failed, stopping this port's reader: {e}");
                                break;
                            }
                        },
                        _ = shutdown.recv() => break,
                    }
                }
            });
        }

        for (socket, mut rx) in sockets.iter().cloned().zip(to_net_rx) {
            tokio::spawn(async move {
                while let Some(out) = rx.recv().await {
                    if let Err(e) = socket.send_to(&out.data, out.addr).await {
                        debug!("udp send to {} failed: {e}", out.addr);
                    }
                }
            });
        }

        {
            let tun = tun.clone();
            let shutdown = self.shutdown.clone();
            tokio::spawn(async move {
                while let Some(frame) = to_iface_rx.recv().await {
                    if let Err(e) = tun.send(&frame).await {
                        // an unusable interface takes the whole server down
                        error!("interface write failed: {e}");
                        let _ = shutdown.send(());
                        break;
                    }
                }
            });
        }

        {
            let tun = tun.clone();
            let tx = self.from_iface_tx.clone();
            let shutdown_tx = self.shutdown.clone();
            let mut shutdown = self.shutdown.subscribe();
            tokio::spawn(async move {
                loop {
                    // headroom so the data header can be written in place
                    let mut buf = vec![0u8; HDR_LEN + IFACE_BUFSIZE];
                    tokio::select! {
                        received = tun.recv(&mut buf[HDR_LEN..]) => match received {
                            Ok(n) => {
                                buf.truncate(HDR_LEN + n);
                                if tx.send(buf).await.is_err() {
                                    break;
                                }
                            }
                            Err(e) => {
                                error!("interface read failed: {e}");
                                let _ = shutdown_tx.send(());
                                break;
                            }
                        },
                        _ = shutdown.recv() => break,
                    }
                }
            });
        }

        {
            let server = self.clone();
            let mut shutdown = self.shutdown.subscribe();
            tokio::spawn(async move {
                let mut tick = tokio::time::interval(STALE_AFTER / 2);
                tick.tick().await;
                loop {
                    tokio::select! {
                        _ = tick.tick() => server.reassembler.lock().await.sweep(STALE_AFTER),
                        _ = shutdown.recv() => break,
                    }
                }
            });
        }

        if self.config.common.peer_timeout > 0 {
            tokio::spawn(self.clone().peer_timeout_watcher());
        }

        let mut shutdown = self.shutdown.subscribe();
        loop {
            tokio::select! {
                Some(msg) = from_net_rx.recv() => self.clone().handle_datagram(msg).await,
                Some(frame) = from_iface_rx.recv() => self.handle_frame(frame).await,
                _ = shutdown.recv() => break,
            }
        }
        info!("shutting down");
        self.notify_shutdown().await;
        Ok(())
    }

    async fn handle_datagram(self: Arc<Self>, msg: Inbound) {
        let packet = match self.cipher.open(&msg.data) {
            Ok(p) => p,
            Err(e) => {
                debug!("dropping undecodable datagram from {}: {e}", msg.addr);
                return;
            }
        };
        match packet.header.flag.bits() {
            KNOCK => self.handle_knock(msg.addr, msg.port_index, packet).await,
            HEARTBEAT_ACK => self.handle_heartbeat_ack(packet).await,
            HANDSHAKE => {
                self.clone()
                    .handle_handshake(msg.addr, msg.port_index, packet)
                    .await
            }
            HANDSHAKE_ACK => self.handle_handshake_ack(packet).await,
            DATA | DATA_MFR => self.handle_data(packet).await,
            FINISH => self.handle_finish(packet).await,
            other => warn!(
                "dropping datagram with unknown flag 0x{other:02x} from {}",
                msg.addr
            ),
        }
    }

    /// Fetches the peer for a session key, creating it on first contact,
    /// and records the source address either way.
    async fn intern_peer(&self, sid: SessionId, addr: SocketAddr, port_index: usize) -> Arc<Peer> {
        let key = sid.session_key();
        let mut peers = self.peers.write().await;
        match peers.get(&key) {
            Some(peer) => {
                peer.learn_addr(addr, port_index);
                peer.clone()
            }
            None => {
                info!("new peer {sid} knocking from {addr}");
                let peer = Arc::new(Peer::new(key, addr, port_index));
                peers.insert(key, peer.clone());
                peer
            }
        }
    }

    async fn handle_knock(&self, addr: SocketAddr, port_index: usize, packet: Packet) {
        let sid = SessionId(packet.header.sid);
        let peer = self.intern_peer(sid, addr, port_index).await;
        peer.touch();
        if peer.state() == SessionState::Working {
            self.send_to_peer(&peer, Packet::heartbeat_ack()).await;
        }
    }

    async fn handle_handshake(
        self: Arc<Self>,
        addr: SocketAddr,
        port_index: usize,
        packet: Packet,
    ) {
        let sid = SessionId(packet.header.sid);
        let peer = self.intern_peer(sid, addr, port_index).await;
        peer.touch();
        if !peer.transition(SessionState::Init, SessionState::Handshake) {
            debug!("duplicate handshake from {sid} in state {}", peer.state());
            return;
        }

        let assigned = self.pool.lock().await.next();
        let ip = match assigned {
            Ok(ip) => ip,
            Err(e) => {
                warn!("rejecting handshake from {sid}: {e}");
                self.send_to_peer(&peer, Packet::handshake_reject(&e.to_string()))
                    .await;
                self.peers.write().await.remove(&sid.session_key());
                return;
            }
        };

        peer.set_tunnel_ip(ip);
        self.peers.write().await.insert(route_key(ip), peer.clone());
        info!("assigned {ip} to peer {sid}");
        self.send_to_peer(&peer, Packet::handshake_reply(ip, self.mask))
            .await;

        // resend the reply until the client acks, then give up on the peer
        let (tx, mut rx) = oneshot::channel();
        peer.arm_handshake(tx);
        let server = self.clone();
        tokio::spawn(async move {
            for attempt in 1..=HANDSHAKE_RETRIES {
                tokio::select! {
                    _ = &mut rx => return,
                    _ = sleep(HANDSHAKE_RETRY_INTERVAL) => {
                        debug!("handshake reply to {sid} unanswered, resend {attempt}");
                        server
                            .send_to_peer(&peer, Packet::handshake_reply(ip, server.mask))
                            .await;
                    }
                }
            }
            warn!("handshake with {sid} timed out, tearing down");
            for _ in 0..3 {
                server.send_to_peer(&peer, Packet::finish(sid.0)).await;
            }
            server.forget_peer(&peer).await;
        });
    }

    async fn handle_handshake_ack(&self, packet: Packet) {
        let sid = SessionId(packet.header.sid);
        let peer = match self.peers.read().await.get(&sid.session_key()).cloned() {
            Some(peer) => peer,
            None => {
                debug!("handshake ack from unknown session {sid}");
                return;
            }
        };
        peer.touch();
        if peer.transition(SessionState::Handshake, SessionState::Working) {
            info!("peer {sid} connected");
            peer.complete_handshake();
        } else {
            warn!(
                "handshake ack from {sid} in state {}, kicking",
                peer.state()
            );
            self.kick_peer(&peer).await;
        }
    }

    async fn handle_data(&self, packet: Packet) {
        let sid = SessionId(packet.header.sid);
        let peer = match self.peers.read().await.get(&sid.session_key()).cloned() {
            Some(peer) => peer,
            None => {
                debug!("data from unknown session {sid}");
                return;
            }
        };
        if peer.state() != SessionState::Working {
            debug!("data from {sid} in state {}, dropping", peer.state());
            return;
        }
        peer.touch();
        let frames = self.reassembler.lock().await.reassemble(vec![packet]);
        for frame in frames {
            if self.to_iface_tx.send(frame.into_payload()).await.is_err() {
                break;
            }
        }
    }

    async fn handle_heartbeat_ack(&self, packet: Packet) {
        let sid = SessionId(packet.header.sid);
        if let Some(peer) = self.peers.read().await.get(&sid.session_key()) {
            peer.touch();
        }
    }

    async fn handle_finish(&self, packet: Packet) {
        let sid = SessionId(packet.header.sid);
        let peer = match self.peers.read().await.get(&sid.session_key()).cloned() {
            Some(peer) => peer,
            None => return,
        };
        info!("peer {sid} disconnecting");
        self.delete_peer(&peer).await;
    }

    /// Routes one interface frame to the peer owning its destination IP.
    /// The buffer arrives with `HDR_LEN` bytes of headroom.
    async fn handle_frame(&self, frame: Vec<u8>) {
        if frame.len() < HDR_LEN + 20 {
            debug!("dropping short interface frame ({} bytes)", frame.len());
            return;
        }
        let dst = Ipv4Addr::new(
            frame[HDR_LEN + 16],
            frame[HDR_LEN + 17],
            frame[HDR_LEN + 18],
            frame[HDR_LEN + 19],
        );
        let peer = match self.peers.read().await.get(&route_key(dst)).cloned() {
            Some(peer) => peer,
            None => {
                debug!("no peer for destination {dst}, dropping frame");
                return;
            }
        };
        if peer.state() != SessionState::Working {
            return;
        }

        let oversized = frame.len() - HDR_LEN > self.config.common.mtu;
        match &self.morpher {
            Some(morpher) if oversized => {
                let seq = peer.next_seq();
                let packets = {
                    let mut morpher = morpher.lock().await;
                    fragmentate(seq, 0, &frame[HDR_LEN..], morpher.as_mut())
                };
                for packet in packets {
                    self.transmit(&peer, packet).await;
                }
            }
            _ => {
                self.send_to_peer(&peer, Packet::from_frame(frame)).await;
            }
        }
    }

    /// Stamps the peer's next sequence number and transmits.
    async fn send_to_peer(&self, peer: &Peer, mut packet: Packet) {
        packet.header.seq = peer.next_seq();
        self.transmit(peer, packet).await;
    }

    /// Seals a packet and queues it on the port a randomly chosen learned
    /// address was seen on.
    async fn transmit(&self, peer: &Peer, mut packet: Packet) {
        let (addr, port_index) = match peer.pick_addr() {
            Some(pick) => pick,
            None => {
                debug!("peer {:x} has no known address", peer.id());
                return;
            }
        };
        match self.cipher.seal(&mut packet) {
            Ok(data) => {
                if self.to_net_tx[port_index]
                    .send(Outbound { addr, data })
                    .await
                    .is_err()
                {
                    debug!("send queue for port index {port_index} is gone");
                }
            }
            Err(e) => error!("failed to seal packet: {e}"),
        }
    }

    /// Removes both table entries and returns the tunnel address to the
    /// pool. Any pending handshake retry loop is cancelled.
    async fn forget_peer(&self, peer: &Peer) {
        peer.abort_handshake();
        let ip = peer.tunnel_ip();
        {
            let mut peers = self.peers.write().await;
            peers.remove(&peer.id());
            if let Some(ip) = ip {
                peers.remove(&route_key(ip));
            }
        }
        if let Some(ip) = ip {
            self.pool.lock().await.release(ip);
        }
    }

    /// Orderly removal: the peer is forgotten and told twice that the
    /// session is gone.
    async fn delete_peer(&self, peer: &Peer) {
        peer.set_state(SessionState::Fin);
        self.forget_peer(peer).await;
        for _ in 0..2 {
            self.send_to_peer(peer, Packet::finish_ack()).await;
        }
    }

    /// Forced removal: delete plus three teardown messages so the client
    /// notices even with loss.
    async fn kick_peer(&self, peer: &Peer) {
        self.delete_peer(peer).await;
        let sid = (peer.id() >> 32) as u32;
        for _ in 0..3 {
            self.send_to_peer(peer, Packet::finish(sid)).await;
        }
    }

    /// Probes every working peer at half the timeout interval and kicks the
    /// ones that stayed silent for a whole interval.
    async fn peer_timeout_watcher(self: Arc<Self>) {
        let timeout = Duration::from_secs(self.config.common.peer_timeout);
        let half = timeout / 2;
        let mut shutdown = self.shutdown.subscribe();
        loop {
            tokio::select! {
                _ = sleep(half) => {}
                _ = shutdown.recv() => return,
            }
            for peer in self.session_peers().await {
                if peer.state() == SessionState::Working {
                    self.send_to_peer(&peer, Packet::heartbeat()).await;
                }
            }
            tokio::select! {
                _ = sleep(half) => {}
                _ = shutdown.recv() => return,
            }
            for peer in self.session_peers().await {
                if peer.idle() > timeout {
                    warn!("peer {:x} timed out, kicking", peer.id());
                    let server = self.clone();
                    tokio::spawn(async move { server.kick_peer(&peer).await });
                }
            }
        }
    }

    /// Snapshot of peers under their session keys only, so dually-indexed
    /// peers are visited once.
    async fn session_peers(&self) -> Vec<Arc<Peer>> {
        self.peers
            .read()
            .await
            .iter()
            .filter(|(key, _)| **key >= 1u64 << 32)
            .map(|(_, peer)| peer.clone())
            .collect()
    }

    async fn notify_shutdown(&self) {
        let peers = self.session_peers().await;
        info!("notifying {} peers of shutdown", peers.len());
        for peer in peers {
            let sid = (peer.id() >> 32) as u32;
            for _ in 0..2 {
                self.send_to_peer(&peer, Packet::finish_ack()).await;
            }
            for _ in 0..2 {
                self.send_to_peer(&peer, Packet::finish(sid)).await;
            }
            self.forget_peer(&peer).await;
        }
    }
}
