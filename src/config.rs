//! YAML configuration shape and validation (spec.md §6). Loaded once by
//! the CLI (or directly by tests) and handed to [`crate::Interface`] as an
//! already-parsed value — the core never touches the filesystem to find
//! its own config.

use std::collections::HashMap;
use std::net::Ipv4Addr;
use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::cidr::Ipv4Cidr;
use crate::net::identity::{PeerId, PrivateKey};

fn default_interface_name() -> String {
	"hs0".to_string()
}

fn default_listen_port() -> u16 {
	8001
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InterfaceSection {
	#[serde(default = "default_interface_name")]
	pub name: String,
	pub id: PeerId,
	#[serde(default = "default_listen_port")]
	pub listen_port: u16,
	pub address: Ipv4Cidr,
	pub private_key: PrivateKey,
	pub discover_key: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PeerEntry {
	pub id: PeerId,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RouteEntry {
	pub ip: Ipv4Addr,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
	pub interface: InterfaceSection,
	#[serde(default)]
	pub peers: HashMap<Ipv4Addr, PeerEntry>,
	/// Optional, future use (spec.md §6); parsed and kept but not acted on.
	#[serde(default)]
	pub routes: HashMap<String, RouteEntry>,
	#[serde(default)]
	pub verbose: bool,
}

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
	#[error("failed to read config file {path}: {source}")]
	Read {
		path: String,
		#[source]
		source: std::io::Error,
	},
	#[error("failed to parse config yaml: {0}")]
	Parse(#[from] serde_yaml::Error),
	#[error("peer id {id} is assigned to more than one overlay address ({first} and {second})")]
	DuplicatePeerId {
		id: String,
		first: Ipv4Addr,
		second: Ipv4Addr,
	},
	#[error("the interface's own address {0} must not also be listed as a peer")]
	SelfPeer(Ipv4Addr),
}

impl Config {
	/// Reads and validates a config file (spec.md §6 validation rules).
	pub fn read(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
		let path_ref = path.as_ref();
		let raw = std::fs::read_to_string(path_ref).map_err(|source| ConfigError::Read {
			path: path_ref.display().to_string(),
			source,
		})?;
		let config: Config = serde_yaml::from_str(&raw)?;
		config.validate()?;
		Ok(config)
	}

	/// Re-validates after mutation (the CLI's `add` subcommand calls this
	/// before writing a modified config back to disk).
	pub(crate) fn validate(&self) -> Result<(), ConfigError> {
		// `peers` is a map keyed on IPv4, so duplicate IPs are structurally
		// impossible once parsed; duplicate peer ids across two IPs are not.
		let mut seen_ids: HashMap<PeerId, Ipv4Addr> = HashMap::with_capacity(self.peers.len());
		for (&ip, entry) in &self.peers {
			if let Some(&first_ip) = seen_ids.get(&entry.id) {
				return Err(ConfigError::DuplicatePeerId {
					id: entry.id.to_string(),
					first: first_ip,
					second: ip,
				});
			}
			seen_ids.insert(entry.id, ip);

			if ip == self.interface.address.address {
				return Err(ConfigError::SelfPeer(ip));
			}
		}
		Ok(())
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	fn sample_yaml(own: &str, peer_ip: &str, peer_id: &str) -> String {
		format!(
			"interface:\n  name: hs0\n  id: {own_id}\n  listen_port: 8001\n  address: \"{own}/24\"\n  private_key: \"{key}\"\n  discover_key: shared-secret\npeers:\n  {peer_ip}:\n    id: {peer_id}\n",
			own_id = PrivateKey::generate().peer_id(),
			key = {
				let k = PrivateKey::generate();
				serde_json::to_value(&k).unwrap().as_str().unwrap().to_string()
			},
			own = own,
			peer_ip = peer_ip,
			peer_id = peer_id,
		)
	}

	#[test]
	fn rejects_self_as_peer() {
		let own_id = PrivateKey::generate().peer_id().to_string();
		let yaml = sample_yaml("10.1.1.1", "10.1.1.1", &own_id);
		let config: Config = serde_yaml::from_str(&yaml).unwrap();
		assert!(matches!(config.validate(), Err(ConfigError::SelfPeer(_))));
	}

	#[test]
	fn accepts_distinct_peer() {
		let peer_id = PrivateKey::generate().peer_id().to_string();
		let yaml = sample_yaml("10.1.1.1", "10.1.1.2", &peer_id);
		let config: Config = serde_yaml::from_str(&yaml).unwrap();
		assert!(config.validate().is_ok());
	}

	#[test]
	fn rejects_duplicate_peer_id_across_two_ips() {
		let peer_id = PrivateKey::generate();
		let peer_id_str = peer_id.peer_id().to_string();
		let mut yaml = sample_yaml("10.1.1.1", "10.1.1.2", &peer_id_str);
		yaml.push_str(&format!("  10.1.1.3:\n    id: {peer_id_str}\n"));
		let config: Config = serde_yaml::from_str(&yaml).unwrap();
		assert!(matches!(
			config.validate(),
			Err(ConfigError::DuplicatePeerId { .. })
		));
	}
}
