//! `ConnectionRegistry` (§4.8): the multiplexer's map from socket id to connection,
//! plus the secondary index listener-side duplicate-handshake detection needs.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex};

use collections::seq::SeqNo;
use rand::Rng;

use crate::connection::Connection;

/// `(peerAddr, peerSocketId, peerISN)` — a listener re-sends the same conclusion
/// idempotently if this triple already maps to a live connection (§4.7).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct PeerKey {
	pub peer_addr: SocketAddr,
	pub peer_socket_id: u32,
	pub peer_isn: u32,
}

struct Inner {
	by_id: HashMap<u32, Arc<Connection>>,
	by_peer: HashMap<PeerKey, u32>,
}

/// Owns every live connection on one multiplexer. Socket ids are drawn from a
/// 29-bit random space and decremented per allocation (§4.8); a collision (vanishingly
/// unlikely, but the allocator must still be correct) is resolved by re-drawing.
pub struct ConnectionRegistry {
	inner: Mutex<Inner>,
	next_id: Mutex<u32>,
}

const SOCKET_ID_MASK: u32 = (1 << 29) - 1;

impl ConnectionRegistry {
	pub fn new() -> Self {
		let seed = rand::thread_rng().gen::<u32>() & SOCKET_ID_MASK;
		Self { inner: Mutex::new(Inner { by_id: HashMap::new(), by_peer: HashMap::new() }), next_id: Mutex::new(seed.max(1)) }
	}

	/// Draw the next socket id, redrawing on collision with a currently-registered one.
	pub fn allocate_id(&self) -> u32 {
		loop {
			let id = {
				let mut next = self.next_id.lock().unwrap();
				let id = *next;
				*next = if *next <= 1 { SOCKET_ID_MASK } else { *next - 1 };
				id
			};

			if !self.inner.lock().unwrap().by_id.contains_key(&id) {
				return id;
			}
		}
	}

	pub fn insert(&self, id: u32, conn: Arc<Connection>) {
		self.inner.lock().unwrap().by_id.insert(id, conn);
	}

	pub fn index_peer(&self, key: PeerKey, id: u32) {
		self.inner.lock().unwrap().by_peer.insert(key, id);
	}

	pub fn lookup(&self, id: u32) -> Option<Arc<Connection>> {
		self.inner.lock().unwrap().by_id.get(&id).cloned()
	}

	pub fn lookup_peer(&self, key: &PeerKey) -> Option<Arc<Connection>> {
		let inner = self.inner.lock().unwrap();
		let id = inner.by_peer.get(key)?;
		inner.by_id.get(id).cloned()
	}

	pub fn remove(&self, id: u32) {
		self.inner.lock().unwrap().by_id.remove(&id);
	}

	/// All currently registered connections, for the GC sweep and the SndQueue's
	/// due-connection scan.
	pub fn all(&self) -> Vec<Arc<Connection>> {
		self.inner.lock().unwrap().by_id.values().cloned().collect()
	}

	pub fn len(&self) -> usize {
		self.inner.lock().unwrap().by_id.len()
	}

	pub fn is_empty(&self) -> bool {
		self.len() == 0
	}
}

impl Default for ConnectionRegistry {
	fn default() -> Self {
		Self::new()
	}
}

/// Convert a fresh `SeqNo` draw into the initial sequence number a handshake hands
/// out, kept here since ISN generation is a registry-adjacent concern (one random
/// draw per new connection, §4.7's "ISN=random").
pub fn random_isn() -> SeqNo {
	SeqNo::new(rand::thread_rng().gen::<u32>() & 0x7FFF_FFFF)
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn allocate_id_avoids_registered_collisions() {
		let registry = ConnectionRegistry::new();
		let a = registry.allocate_id();
		assert!(a > 0 && a <= SOCKET_ID_MASK);

		// Force the allocator to wrap past a value and confirm it never hands back an
		// id that's already registered, by registering a block of upcoming ids.
		let mut seen = std::collections::HashSet::new();
		for _ in 0..32 {
			seen.insert(registry.allocate_id());
		}
		assert_eq!(seen.len(), 32, "ids handed out in one registry should never repeat without being released");
	}

	#[test]
	fn peer_key_round_trips_through_index() {
		let registry = ConnectionRegistry::new();
		let key = PeerKey { peer_addr: "127.0.0.1:9000".parse().unwrap(), peer_socket_id: 5, peer_isn: 10 };
		registry.index_peer(key, 77);
		// No connection inserted under id 77 yet, so lookup_peer should report absent
		// rather than panicking on the missing by_id entry.
		assert!(registry.lookup_peer(&key).is_none());
	}
}
