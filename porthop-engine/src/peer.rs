//! Per-peer session record.
//!
//! One `Peer` is shared (via `Arc`) between both peer-table entries and
//! every task that touches the session, so all mutable state is atomic or
//! behind peer-local locks. The table lock is never needed to update a
//! peer.

use std::collections::HashMap;
use std::net::{Ipv4Addr, SocketAddr};
use std::sync::atomic::{AtomicU32, AtomicU8, Ordering};
use std::sync::{Mutex, RwLock};
use std::time::Instant;

use rand::seq::SliceRandom;
use rand::thread_rng;
use tokio::sync::oneshot;

use porthop_protocol::SessionState;

/// Source addresses learned for a peer, with the index of the local port
/// each was seen on. Kept as map + list so a random pick is O(1).
#[derive(Default)]
struct AddrSet {
    index: HashMap<SocketAddr, usize>,
    list: Vec<(SocketAddr, usize)>,
}

pub struct Peer {
    id: u64,
    state: AtomicU8,
    seq: AtomicU32,
    addrs: RwLock<AddrSet>,
    tunnel_ip: RwLock<Option<Ipv4Addr>>,
    last_seen: Mutex<Instant>,
    hs_done: Mutex<Option<oneshot::Sender<()>>>,
}

impl Peer {
    pub fn new(id: u64, addr: SocketAddr, port_index: usize) -> Peer {
        let peer = Peer {
            id,
            state: AtomicU8::new(SessionState::Init.as_u8()),
            seq: AtomicU32::new(0),
            addrs: RwLock::new(AddrSet::default()),
            tunnel_ip: RwLock::new(None),
            last_seen: Mutex::new(Instant::now()),
            hs_done: Mutex::new(None),
        };
        peer.learn_addr(addr, port_index);
        peer
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    /// Records a source address and the local port it arrived on. Port
    /// hopping means a peer shows up from many (addr, port) pairs over time.
    pub fn learn_addr(&self, addr: SocketAddr, port_index: usize) {
        let mut addrs = match self.addrs.write() {
            Ok(a) => a,
            Err(poisoned) => poisoned.into_inner(),
        };
        match addrs.index.insert(addr, port_index) {
            Some(_) => {
                for entry in &mut addrs.list {
                    if entry.0 == addr {
                        entry.1 = port_index;
                    }
                }
            }
            None => addrs.list.push((addr, port_index)),
        }
    }

    /// Picks a random known address to send from any learned pair.
    pub fn pick_addr(&self) -> Option<(SocketAddr, usize)> {
        let addrs = match self.addrs.read() {
            Ok(a) => a,
            Err(poisoned) => poisoned.into_inner(),
        };
        addrs.list.choose(&mut thread_rng()).copied()
    }

    pub fn addr_count(&self) -> usize {
        match self.addrs.read() {
            Ok(a) => a.list.len(),
            Err(poisoned) => poisoned.into_inner().list.len(),
        }
    }

    /// Next outbound sequence number. Every send consumes one, control
    /// messages included.
    pub fn next_seq(&self) -> u32 {
        self.seq.fetch_add(1, Ordering::Relaxed) + 1
    }

    pub fn state(&self) -> SessionState {
        SessionState::from_u8(self.state.load(Ordering::SeqCst))
    }

    pub fn set_state(&self, state: SessionState) {
        self.state.store(state.as_u8(), Ordering::SeqCst);
    }

    /// Atomically moves `from` → `to`; false if the peer was not in `from`.
    pub fn transition(&self, from: SessionState, to: SessionState) -> bool {
        self.state
            .compare_exchange(from.as_u8(), to.as_u8(), Ordering::SeqCst, Ordering::SeqCst)
            .is_ok()
    }

    pub fn touch(&self) {
        let mut t = match self.last_seen.lock() {
            Ok(t) => t,
            Err(poisoned) => poisoned.into_inner(),
        };
        *t = Instant::now();
    }

    pub fn idle(&self) -> std::time::Duration {
        let t = match self.last_seen.lock() {
            Ok(t) => t,
            Err(poisoned) => poisoned.into_inner(),
        };
        t.elapsed()
    }

    pub fn set_tunnel_ip(&self, ip: Ipv4Addr) {
        let mut slot = match self.tunnel_ip.write() {
            Ok(s) => s,
            Err(poisoned) => poisoned.into_inner(),
        };
        *slot = Some(ip);
    }

    pub fn tunnel_ip(&self) -> Option<Ipv4Addr> {
        match self.tunnel_ip.read() {
            Ok(s) => *s,
            Err(poisoned) => *poisoned.into_inner(),
        }
    }

    /// Arms the handshake-completion signal. The retry task holds the
    /// receiving end.
    pub fn arm_handshake(&self, tx: oneshot::Sender<()>) {
        let mut slot = match self.hs_done.lock() {
            Ok(s) => s,
            Err(poisoned) => poisoned.into_inner(),
        };
        *slot = Some(tx);
    }

    /// Fires the handshake-completion signal. Single use: later calls (a
    /// duplicate ack, a teardown after completion) are no-ops.
    pub fn complete_handshake(&self) {
        let tx = {
            let mut slot = match self.hs_done.lock() {
                Ok(s) => s,
                Err(poisoned) => poisoned.into_inner(),
            };
            slot.take()
        };
        if let Some(tx) = tx {
            let _ = tx.send(());
        }
    }

    /// Drops the signal without firing it, cancelling any retry loop.
    pub fn abort_handshake(&self) {
        let mut slot = match self.hs_done.lock() {
            Ok(s) => s,
            Err(poisoned) => poisoned.into_inner(),
        };
        *slot = None;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn addr(port: u16) -> SocketAddr {
        format!("127.0.0.1:{port}").parse().unwrap()
    }

    #[test]
    fn seq_starts_at_one() {
        let peer = Peer::new(1 << 32, addr(1000), 0);
        assert_eq!(peer.next_seq(), 1);
        assert_eq!(peer.next_seq(), 2);
    }

    #[test]
    fn addr_set_dedupes_and_updates_port() {
        let peer = Peer::new(1 << 32, addr(1000), 0);
        peer.learn_addr(addr(1000), 3);
        peer.learn_addr(addr(2000), 1);
        assert_eq!(peer.addr_count(), 2);
        for _ in 0..20 {
            let (a, idx) = peer.pick_addr().unwrap();
            if a == addr(1000) {
                assert_eq!(idx, 3);
            } else {
                assert_eq!((a, idx), (addr(2000), 1));
            }
        }
    }

    #[test]
    fn guarded_transition() {
        let peer = Peer::new(1 << 32, addr(1000), 0);
        peer.set_state(SessionState::Handshake);
        assert!(peer.transition(SessionState::Handshake, SessionState::Working));
        assert!(!peer.transition(SessionState::Handshake, SessionState::Working));
        assert_eq!(peer.state(), SessionState::Working);
    }

    #[tokio::test]
    async fn handshake_signal_is_single_use() {
        let peer = Peer::new(1 << 32, addr(1000), 0);
        let (tx, rx) = oneshot::channel();
        peer.arm_handshake(tx);
        peer.complete_handshake();
        peer.complete_handshake();
        assert!(rx.await.is_ok());
    }

    #[tokio::test]
    async fn aborted_handshake_drops_the_sender() {
        let peer = Peer::new(1 << 32, addr(1000), 0);
        let (tx, rx) = oneshot::channel();
        peer.arm_handshake(tx);
        peer.abort_handshake();
        assert!(rx.await.is_err());
    }
}
