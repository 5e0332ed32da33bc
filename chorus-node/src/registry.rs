//! Peer registry: id-keyed arena owning each peer's link, plus a non-owning socket index.
//!
//! The two maps are only ever changed together, so `by_socket` is always the exact
//! inverse of the socket ids held in `peers`.

use std::collections::{BTreeMap, HashMap};
use std::net::SocketAddr;

use chorus_core::PeerId;

/// Identity of one accepted or connected socket. Never reused.
pub type SocketId = u64;

#[derive(Debug)]
pub struct Peer<L> {
    pub id: PeerId,
    /// `None` while an outbound connect is still in progress.
    pub socket: Option<SocketId>,
    pub addr: Option<SocketAddr>,
    pub link: Option<L>,
}

impl<L> Peer<L> {
    /// True once the peer has a live socket.
    pub fn is_connected(&self) -> bool {
        self.socket.is_some()
    }
}

#[derive(Debug)]
pub struct Registry<L> {
    next_peer: PeerId,
    next_socket: SocketId,
    peers: BTreeMap<PeerId, Peer<L>>,
    by_socket: HashMap<SocketId, PeerId>,
}

impl<L> Default for Registry<L> {
    fn default() -> Self {
        Self::new()
    }
}

impl<L> Registry<L> {
    pub fn new() -> Self {
        Self {
            next_peer: 1,
            next_socket: 1,
            peers: BTreeMap::new(),
            by_socket: HashMap::new(),
        }
    }

    fn next_peer_id(&mut self) -> PeerId {
        let id = self.next_peer;
        self.next_peer += 1;
        id
    }

    /// Allocate a socket id ahead of [`register`](Self::register) or [`attach`](Self::attach).
    pub fn allocate_socket(&mut self) -> SocketId {
        let id = self.next_socket;
        self.next_socket += 1;
        id
    }

    /// Tentative entry for an outbound connect whose socket does not exist yet.
    pub fn reserve(&mut self) -> PeerId {
        let id = self.next_peer_id();
        self.peers.insert(
            id,
            Peer {
                id,
                socket: None,
                addr: None,
                link: None,
            },
        );
        id
    }

    /// Complete a reserved entry. Gives the link back if the entry was removed in the
    /// meantime or already has a socket.
    pub fn attach(&mut self, id: PeerId, socket: SocketId, addr: SocketAddr, link: L) -> Result<(), L> {
        match self.peers.get_mut(&id) {
            Some(peer) if peer.socket.is_none() => {
                peer.socket = Some(socket);
                peer.addr = Some(addr);
                peer.link = Some(link);
                self.by_socket.insert(socket, id);
                Ok(())
            }
            _ => Err(link),
        }
    }

    /// New entry for an accepted socket.
    pub fn register(&mut self, socket: SocketId, addr: SocketAddr, link: L) -> PeerId {
        let id = self.next_peer_id();
        self.peers.insert(
            id,
            Peer {
                id,
                socket: Some(socket),
                addr: Some(addr),
                link: Some(link),
            },
        );
        self.by_socket.insert(socket, id);
        id
    }

    /// Remove a peer and its socket index entry. `None` if already absent.
    pub fn remove(&mut self, id: PeerId) -> Option<Peer<L>> {
        let peer = self.peers.remove(&id)?;
        if let Some(socket) = peer.socket {
            self.by_socket.remove(&socket);
        }
        Some(peer)
    }

    pub fn remove_by_socket(&mut self, socket: SocketId) -> Option<Peer<L>> {
        let id = self.peer_for_socket(socket)?;
        self.remove(id)
    }

    pub fn get(&self, id: PeerId) -> Option<&Peer<L>> {
        self.peers.get(&id)
    }

    pub fn contains(&self, id: PeerId) -> bool {
        self.peers.contains_key(&id)
    }

    pub fn peer_for_socket(&self, socket: SocketId) -> Option<PeerId> {
        self.by_socket.get(&socket).copied()
    }

    pub fn find_by_addr(&self, addr: SocketAddr) -> Option<PeerId> {
        self.peers
            .values()
            .find(|p| p.addr == Some(addr))
            .map(|p| p.id)
    }

    /// Ids of peers with a live socket, ascending.
    pub fn connected(&self) -> Vec<PeerId> {
        self.peers
            .values()
            .filter(|p| p.is_connected())
            .map(|p| p.id)
            .collect()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Peer<L>> {
        self.peers.values()
    }

    /// Number of entries, tentative ones included.
    pub fn len(&self) -> usize {
        self.peers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.peers.is_empty()
    }

    /// Take every entry out, leaving the registry empty. Id counters are kept.
    pub fn drain(&mut self) -> Vec<Peer<L>> {
        self.by_socket.clear();
        std::mem::take(&mut self.peers).into_values().collect()
    }

    /// `by_socket` is exactly the inverse of the sockets held in `peers`.
    pub fn is_consistent(&self) -> bool {
        let forward = self
            .peers
            .values()
            .filter_map(|p| p.socket.map(|s| (s, p.id)))
            .all(|(s, id)| self.by_socket.get(&s) == Some(&id));
        let backward = self
            .by_socket
            .iter()
            .all(|(s, id)| self.peers.get(id).and_then(|p| p.socket) == Some(*s));
        forward && backward
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::Rng;

    fn addr(port: u16) -> SocketAddr {
        SocketAddr::from(([127, 0, 0, 1], port))
    }

    #[test]
    fn ids_are_monotonic_and_never_reused() {
        let mut r: Registry<()> = Registry::new();
        let s = r.allocate_socket();
        let a = r.register(s, addr(1), ());
        let b = r.reserve();
        r.remove(a);
        let s = r.allocate_socket();
        let c = r.register(s, addr(2), ());
        assert!(a < b && b < c);
        assert!(r.get(a).is_none());
    }

    #[test]
    fn attach_completes_reservation() {
        let mut r: Registry<u8> = Registry::new();
        let id = r.reserve();
        assert!(!r.get(id).unwrap().is_connected());
        assert!(r.connected().is_empty());
        let s = r.allocate_socket();
        assert!(r.attach(id, s, addr(9), 7).is_ok());
        assert_eq!(r.peer_for_socket(s), Some(id));
        assert_eq!(r.connected(), vec![id]);
        assert_eq!(r.find_by_addr(addr(9)), Some(id));
        assert!(r.is_consistent());
    }

    #[test]
    fn attach_after_removal_is_refused() {
        let mut r: Registry<u8> = Registry::new();
        let id = r.reserve();
        r.remove(id);
        let s = r.allocate_socket();
        assert_eq!(r.attach(id, s, addr(9), 7), Err(7));
        assert!(r.peer_for_socket(s).is_none());
        assert!(r.is_empty());
    }

    #[test]
    fn remove_is_idempotent() {
        let mut r: Registry<()> = Registry::new();
        let s = r.allocate_socket();
        let id = r.register(s, addr(1), ());
        assert!(r.remove(id).is_some());
        assert!(r.remove(id).is_none());
        assert!(r.remove_by_socket(s).is_none());
        assert!(r.is_consistent());
    }

    #[test]
    fn remove_by_socket_clears_both_maps() {
        let mut r: Registry<()> = Registry::new();
        let s = r.allocate_socket();
        let id = r.register(s, addr(1), ());
        let peer = r.remove_by_socket(s).unwrap();
        assert_eq!(peer.id, id);
        assert!(!r.contains(id));
        assert!(r.peer_for_socket(s).is_none());
    }

    #[test]
    fn random_operations_keep_bijection() {
        let mut rng = rand::thread_rng();
        let mut r: Registry<()> = Registry::new();
        let mut sockets = Vec::new();
        let mut ids = Vec::new();
        for _ in 0..2000 {
            match rng.gen_range(0..6) {
                0 => {
                    let s = r.allocate_socket();
                    sockets.push(s);
                    ids.push(r.register(s, addr(rng.gen()), ()));
                }
                1 => ids.push(r.reserve()),
                2 if !ids.is_empty() => {
                    let id = ids[rng.gen_range(0..ids.len())];
                    let s = r.allocate_socket();
                    sockets.push(s);
                    let _ = r.attach(id, s, addr(rng.gen()), ());
                }
                3 if !ids.is_empty() => {
                    let id = ids[rng.gen_range(0..ids.len())];
                    r.remove(id);
                }
                4 if !sockets.is_empty() => {
                    let s = sockets[rng.gen_range(0..sockets.len())];
                    r.remove_by_socket(s);
                }
                _ => {
                    if rng.gen_bool(0.05) {
                        r.drain();
                    }
                }
            }
            assert!(r.is_consistent());
        }
    }
}
