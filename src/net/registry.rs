//! Peer Registry (spec.md §4.2): the two immutable indexes derived from
//! configured peer records, plus the mutable per-peer [`Session`]s they
//! own. Grounded on the teacher's separation of an immutable identity
//! index from mutable per-device connection state
//! (`core-new/.../persistent/manager.rs`'s `active_connections` map sits
//! beside, not inside, the static device list).

use std::collections::HashMap;
use std::net::Ipv4Addr;
use std::sync::Arc;

use crate::net::identity::PeerId;
use crate::net::session::Session;

#[derive(Debug, Clone, Copy)]
pub struct PeerRecord {
	pub overlay_ipv4: Ipv4Addr,
	pub peer_id: PeerId,
}

#[derive(Debug, thiserror::Error)]
pub enum RegistryError {
	#[error("peer id {0} is assigned to more than one overlay address")]
	DuplicatePeerId(PeerId),
	#[error("the local node's own overlay address {0} must not appear in the peer table")]
	SelfPeer(Ipv4Addr),
}

pub struct PeerRegistry {
	by_ip: HashMap<Ipv4Addr, PeerId>,
	by_id: HashMap<PeerId, Ipv4Addr>,
	sessions: HashMap<PeerId, Arc<Session>>,
}

impl PeerRegistry {
	/// Builds the registry from configured peer records (spec.md §4.2).
	/// `own_address` must not appear among `records`.
	pub fn build(
		own_address: Ipv4Addr,
		records: impl IntoIterator<Item = PeerRecord>,
	) -> Result<Self, RegistryError> {
		let mut by_ip = HashMap::new();
		let mut by_id = HashMap::new();
		let mut sessions = HashMap::new();

		for record in records {
			if record.overlay_ipv4 == own_address {
				return Err(RegistryError::SelfPeer(record.overlay_ipv4));
			}
			if by_id.contains_key(&record.peer_id) {
				return Err(RegistryError::DuplicatePeerId(record.peer_id));
			}

			by_ip.insert(record.overlay_ipv4, record.peer_id);
			by_id.insert(record.peer_id, record.overlay_ipv4);
			sessions.insert(record.peer_id, Session::new(record.peer_id));
		}

		Ok(Self {
			by_ip,
			by_id,
			sessions,
		})
	}

	pub fn resolve_by_ip(&self, ip: Ipv4Addr) -> Option<PeerId> {
		self.by_ip.get(&ip).copied()
	}

	pub fn resolve_by_id(&self, peer_id: PeerId) -> Option<Ipv4Addr> {
		self.by_id.get(&peer_id).copied()
	}

	pub fn all(&self) -> impl Iterator<Item = PeerRecord> + '_ {
		self.by_ip.iter().map(|(&overlay_ipv4, &peer_id)| PeerRecord {
			overlay_ipv4,
			peer_id,
		})
	}

	pub fn session(&self, peer_id: PeerId) -> Option<&Arc<Session>> {
		self.sessions.get(&peer_id)
	}

	pub fn session_by_ip(&self, ip: Ipv4Addr) -> Option<&Arc<Session>> {
		let peer_id = self.by_ip.get(&ip)?;
		self.sessions.get(peer_id)
	}

	pub fn len(&self) -> usize {
		self.by_ip.len()
	}

	pub fn is_empty(&self) -> bool {
		self.by_ip.is_empty()
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	fn peer_id() -> PeerId {
		crate::net::identity::PrivateKey::generate().peer_id()
	}

	#[test]
	fn resolves_both_directions() {
		let pa = peer_id();
		let registry = PeerRegistry::build(
			Ipv4Addr::new(10, 1, 1, 1),
			[PeerRecord {
				overlay_ipv4: Ipv4Addr::new(10, 1, 1, 2),
				peer_id: pa,
			}],
		)
		.unwrap();

		assert_eq!(
			registry.resolve_by_ip(Ipv4Addr::new(10, 1, 1, 2)),
			Some(pa)
		);
		assert_eq!(
			registry.resolve_by_id(pa),
			Some(Ipv4Addr::new(10, 1, 1, 2))
		);
		assert_eq!(registry.resolve_by_ip(Ipv4Addr::new(10, 1, 1, 9)), None);
	}

	#[test]
	fn rejects_self_address() {
		let pa = peer_id();
		let own = Ipv4Addr::new(10, 1, 1, 1);
		let err = PeerRegistry::build(
			own,
			[PeerRecord {
				overlay_ipv4: own,
				peer_id: pa,
			}],
		)
		.unwrap_err();
		assert!(matches!(err, RegistryError::SelfPeer(_)));
	}

	#[test]
	fn rejects_duplicate_peer_id() {
		let pa = peer_id();
		let err = PeerRegistry::build(
			Ipv4Addr::new(10, 1, 1, 1),
			[
				PeerRecord {
					overlay_ipv4: Ipv4Addr::new(10, 1, 1, 2),
					peer_id: pa,
				},
				PeerRecord {
					overlay_ipv4: Ipv4Addr::new(10, 1, 1, 3),
					peer_id: pa,
				},
			],
		)
		.unwrap_err();
		assert!(matches!(err, RegistryError::DuplicatePeerId(_)));
	}

	#[test]
	fn every_peer_starts_with_an_idle_session() {
		let pa = peer_id();
		let registry = PeerRegistry::build(
			Ipv4Addr::new(10, 1, 1, 1),
			[PeerRecord {
				overlay_ipv4: Ipv4Addr::new(10, 1, 1, 2),
				peer_id: pa,
			}],
		)
		.unwrap();

		let session = registry.session(pa).unwrap();
		assert_eq!(session.state(), crate::net::session::State::Idle);
	}
}
