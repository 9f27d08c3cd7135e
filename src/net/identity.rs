//! Overlay identity types: the stable peer id and the long-lived keypair
//! backing it. Serde wire format mirrors the teacher's hex-encoded
//! protobuf keypair (`apps/p2p-relay/src/config.rs`), swapped to base64
//! to match spec.md's "opaque bytes, base-encoded" private key field.

use std::fmt;
use std::str::FromStr;

use libp2p::identity::Keypair;
use serde::{de::Error as DeError, Deserialize, Deserializer, Serialize, Serializer};

/// A peer's stable fingerprint, derived from its public key.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct PeerId(pub libp2p::PeerId);

impl fmt::Display for PeerId {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		fmt::Display::fmt(&self.0, f)
	}
}

impl FromStr for PeerId {
	type Err = libp2p::identity::ParseError;

	fn from_str(s: &str) -> Result<Self, Self::Err> {
		Ok(Self(libp2p::PeerId::from_str(s)?))
	}
}

impl Serialize for PeerId {
	fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
		serializer.serialize_str(&self.0.to_string())
	}
}

impl<'de> Deserialize<'de> for PeerId {
	fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
		let s = String::deserialize(deserializer)?;
		s.parse().map_err(DeError::custom)
	}
}

/// Wraps the local node's long-lived keypair. `Debug` is hand-rolled to
/// avoid ever printing key material.
#[derive(Clone)]
pub struct PrivateKey(pub Keypair);

impl fmt::Debug for PrivateKey {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		f.debug_struct("PrivateKey")
			.field("peer_id", &self.0.public().to_peer_id())
			.finish()
	}
}

impl PrivateKey {
	pub fn generate() -> Self {
		Self(Keypair::generate_ed25519())
	}

	pub fn peer_id(&self) -> PeerId {
		PeerId(self.0.public().to_peer_id())
	}
}

impl Serialize for PrivateKey {
	fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
		let bytes = self
			.0
			.to_protobuf_encoding()
			.map_err(serde::ser::Error::custom)?;
		serializer.serialize_str(&base64::Engine::encode(
			&base64::engine::general_purpose::STANDARD,
			bytes,
		))
	}
}

impl<'de> Deserialize<'de> for PrivateKey {
	fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
		let s = String::deserialize(deserializer)?;
		let bytes = base64::Engine::decode(&base64::engine::general_purpose::STANDARD, s)
			.map_err(DeError::custom)?;
		Keypair::from_protobuf_encoding(&bytes)
			.map(PrivateKey)
			.map_err(DeError::custom)
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn private_key_roundtrips_through_json() {
		let key = PrivateKey::generate();
		let peer_id = key.peer_id();

		let encoded = serde_json::to_string(&key).unwrap();
		let decoded: PrivateKey = serde_json::from_str(&encoded).unwrap();

		assert_eq!(decoded.peer_id(), peer_id);
	}

	#[test]
	fn peer_id_roundtrips_through_string() {
		let key = PrivateKey::generate();
		let peer_id = key.peer_id();
		let parsed: PeerId = peer_id.to_string().parse().unwrap();
		assert_eq!(parsed, peer_id);
	}
}
