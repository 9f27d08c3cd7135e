//! Discovery Loop (spec.md §4.4): the single cooperative task per
//! interface that keeps peer sessions populated. Grounded on the
//! polling shape of `examples/original_source/p2p/discover.go` and on
//! the DHT query bookkeeping style of
//! `core-new/src/infrastructure/networking/discovery.rs`.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use libp2p::gossipsub;
use sha2::{Digest, Sha256};
use tokio::sync::mpsc;
use tokio::time::interval;

use crate::net::registry::PeerRegistry;
use crate::net::session::Stream;
use crate::net::substrate::{self, Handle};

const BEACON_INTERVAL: Duration = Duration::from_secs(5);
const READVERTISE_INTERVAL: Duration = Duration::from_secs(3 * 60 * 60);

/// Derives the gossip rendezvous topic from a shared discovery key
/// (spec.md §3: `sha256("hyprspace-" + discover_key)`, lowercase hex).
pub fn rendezvous_topic(discover_key: &str) -> gossipsub::IdentTopic {
	let mut hasher = Sha256::new();
	hasher.update(b"hyprspace-");
	hasher.update(discover_key.as_bytes());
	let digest = hasher.finalize();
	gossipsub::IdentTopic::new(hex::encode(digest))
}

/// Shared reachability flag, updated by the substrate's event stream and
/// read by the discovery loop's heuristic (spec.md §4.4).
#[derive(Clone, Default)]
pub struct Reachability(Arc<AtomicBool>);

impl Reachability {
	pub fn set(&self, publicly_reachable: bool) {
		self.0.store(publicly_reachable, Ordering::Relaxed);
	}

	pub fn get(&self) -> bool {
		self.0.load(Ordering::Relaxed)
	}
}

/// Runs the discovery loop until `shutdown` fires. Installs streams onto
/// `registry`'s sessions as dials succeed; newly accepted inbound streams
/// are handed to the forwarding engine directly by the substrate's accept
/// task, not by this loop (spec.md §9: inbound never touches Session
/// state). `events` is the substrate's event stream, used here to react
/// to rendezvous beacons (step 2) and reachability changes.
#[allow(clippy::too_many_arguments)]
pub async fn run(
	registry: Arc<PeerRegistry>,
	substrate: Handle,
	protocol_version: String,
	discover_key: String,
	reachability: Reachability,
	mut events: mpsc::UnboundedReceiver<substrate::Event>,
	mut shutdown: mpsc::Receiver<()>,
	on_active_stream: mpsc::UnboundedSender<(crate::net::identity::PeerId, Stream, bool)>,
) {
	let topic = rendezvous_topic(&discover_key);
	substrate.subscribe(topic.clone());
	let data_plane_protocol = substrate::data_plane_protocol(&protocol_version);

	let mut beacon_ticker = interval(BEACON_INTERVAL);
	let mut readvertise_ticker = interval(READVERTISE_INTERVAL);

	loop {
		tokio::select! {
			_ = shutdown.recv() => {
				tracing::info!("discovery loop stopping");
				break;
			}
			_ = beacon_ticker.tick() => {
				substrate.publish(topic.clone(), vec![1u8]);
				dial_unconnected_peers(&registry, &substrate, &data_plane_protocol, &reachability, &on_active_stream).await;
			}
			_ = readvertise_ticker.tick() => {
				substrate.publish(topic.clone(), vec![1u8]);
			}
			event = events.recv() => {
				match event {
					Some(substrate::Event::ReachabilityChanged { publicly_reachable }) => {
						reachability.set(publicly_reachable);
					}
					Some(substrate::Event::GossipMessage { topic: received_topic, .. }) if received_topic == topic.to_string() => {
						// A beacon on our rendezvous topic (spec.md §4.4 step
						// 2): the sender is whichever peer delivered the
						// message, which libp2p's gossipsub attributes at
						// the swarm-event layer rather than in the message
						// body itself, so a fresh sweep over every still-Idle
						// configured peer covers the same ground without
						// needing to thread the source peer id through here.
						dial_unconnected_peers(&registry, &substrate, &data_plane_protocol, &reachability, &on_active_stream).await;
					}
					Some(_) => {}
					None => break,
				}
			}
		}
	}
}

/// For every configured peer with no active session, kick a DHT lookup
/// and attempt to dial (spec.md §4.4 steps 2 and 3 share this path: both
/// just need "a peer id with no active session, try to connect").
async fn dial_unconnected_peers(
	registry: &Arc<PeerRegistry>,
	substrate: &Handle,
	protocol: &libp2p::StreamProtocol,
	reachability: &Reachability,
	on_active_stream: &mpsc::UnboundedSender<(crate::net::identity::PeerId, Stream, bool)>,
) {
	for record in registry.all() {
		let Some(session) = registry.session(record.peer_id) else {
			continue;
		};

		if session.state() != crate::net::session::State::Idle {
			continue;
		}
		if !session.begin_dial() {
			continue;
		}

		let addresses = substrate.find_peer(record.peer_id).await;
		// Reachability heuristic (spec.md §4.4): if we're publicly
		// reachable and the remote only advertises relay addresses, let
		// them dial us instead of hairpinning through a relay.
		if reachability.get() && !addresses.is_empty() && addresses.iter().all(is_relay_address) {
			session.mark_dial_failed(false);
			continue;
		}

		if let Err(err) = substrate.dial(record.peer_id, addresses).await {
			tracing::debug!(peer = %record.peer_id, %err, "dial failed");
			session.mark_dial_failed(is_retriable_dial_error(&err));
			continue;
		}

		// Re-check for an already-open data-plane stream before opening a
		// new one — e.g. the remote may have dialed and opened a stream to
		// us while our own dial was in flight (spec.md §4.3: `connections_to`).
		if !substrate.connections_to(record.peer_id).is_empty() {
			session.mark_dial_failed(false);
			continue;
		}

		match substrate.open_stream(record.peer_id, protocol.clone()).await {
			Ok(stream) => {
				substrate.mark_stream_open(record.peer_id);
				let _ = on_active_stream.send((record.peer_id, stream, true));
			}
			Err(err) => {
				tracing::debug!(peer = %record.peer_id, %err, "stream open failed");
				session.mark_dial_failed(is_retriable_dial_error(&err));
			}
		}
	}
}

fn is_relay_address(addr: &libp2p::Multiaddr) -> bool {
	addr.iter().any(|proto| matches!(proto, libp2p::multiaddr::Protocol::P2pCircuit))
}

/// "failed to dial" / "no addresses" map to Backoff; anything else maps
/// to an immediate retry (spec.md §4.5).
fn is_retriable_dial_error(message: &str) -> bool {
	let lowered = message.to_ascii_lowercase();
	lowered.contains("dial") || lowered.contains("no addresses") || lowered.contains("timeout")
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn rendezvous_topic_is_stable_hex_sha256() {
		let topic = rendezvous_topic("shared-secret");
		let mut hasher = Sha256::new();
		hasher.update(b"hyprspace-shared-secret");
		let expected = hex::encode(hasher.finalize());
		assert_eq!(topic.to_string(), expected);
	}

	#[test]
	fn different_keys_produce_different_topics() {
		assert_ne!(
			rendezvous_topic("a").to_string(),
			rendezvous_topic("b").to_string()
		);
	}

	#[test]
	fn retriable_errors_are_recognized() {
		assert!(is_retriable_dial_error("failed to dial all addresses"));
		assert!(is_retriable_dial_error("no addresses for peer"));
		assert!(!is_retriable_dial_error("protocol not supported"));
	}
}
