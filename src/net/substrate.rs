//! Node Substrate Adapter (spec.md §4.3): the libp2p `Swarm` and the
//! single task that owns it. Grounded on the transport/behaviour split in
//! `core-new/src/infrastructure/networking/core/swarm.rs` and the
//! command/event event-loop shape of
//! `core-new/.../core/event_loop.rs`'s `NetworkingEventLoop`, with the
//! protocol set enriched per
//! `examples/other_examples/9144fc0e_Treystu-SCMessenger__core-src-transport-behaviour.rs.rs`
//! (gossipsub + kademlia + identify alongside a stream-oriented data
//! plane).

use std::collections::HashSet;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use futures::future::Either;
use futures::StreamExt;
use libp2p::core::muxing::StreamMuxerBox;
use libp2p::core::transport::Boxed;
use libp2p::core::upgrade::Version;
use libp2p::swarm::{NetworkBehaviour, Swarm, SwarmEvent};
use libp2p::{autonat, gossipsub, identify, kad, noise, relay, tcp, quic, yamux, Multiaddr, Transport};
use tokio::sync::{mpsc, oneshot};

use crate::net::identity::PeerId;
use crate::net::identity::PrivateKey;
use crate::net::session::Stream;

/// Well-known IPFS/libp2p bootstrap peers, the same defaults
/// `dht.GetDefaultBootstrapPeerAddrInfos()` returns in
/// `examples/original_source/p2p/node.go:75`.
const BOOTSTRAP_PEERS: &[(&str, &str)] = &[
	(
		"/dnsaddr/bootstrap.libp2p.io",
		"QmNnooDu7bfjPFoTZYxMNLWUQJyrVwtbZg5gBMjTezGAJN",
	),
	(
		"/dnsaddr/bootstrap.libp2p.io",
		"QmQCU2EcMqAqQPR2i9bChDtGNJchTbq5TbXJJ16u19uLTa",
	),
	(
		"/dnsaddr/bootstrap.libp2p.io",
		"QmbLHAnMoJPWSCR5Zhtx6BHJX9KiKNN6tpvbUcqanj75Nb",
	),
	(
		"/dnsaddr/bootstrap.libp2p.io",
		"QmcZf59bWwK5XFi76CZX8cbJ4BhTzzA3gU1ZjYZcYW3dwt",
	),
];

/// How long [`start`] waits for at least one bootstrap peer to connect
/// before failing (spec.md §4.3: "Fails if fewer than one bootstrap peer
/// connects").
const BOOTSTRAP_TIMEOUT: Duration = Duration::from_secs(10);

/// Data-plane protocol identifier, `"/hyprspace/<version>"` (spec.md §4.6).
pub fn data_plane_protocol(version: &str) -> libp2p::StreamProtocol {
	libp2p::StreamProtocol::try_from_owned(format!("/hyprspace/{version}"))
		.expect("protocol string is always a valid libp2p StreamProtocol")
}

#[derive(NetworkBehaviour)]
pub struct Behaviour {
	pub kademlia: kad::Behaviour<kad::store::MemoryStore>,
	pub gossipsub: gossipsub::Behaviour,
	pub identify: identify::Behaviour,
	pub autonat: autonat::Behaviour,
	pub relay_client: relay::client::Behaviour,
	pub stream: libp2p_stream::Behaviour,
}

#[derive(Debug, thiserror::Error)]
pub enum SubstrateError {
	#[error("failed to configure noise transport security: {0}")]
	Noise(#[source] Box<dyn std::error::Error + Send + Sync>),
	#[error("failed to configure gossipsub: {0}")]
	Gossipsub(String),
	#[error("no free tcp port found for the overlay listener starting from {0}")]
	NoFreePort(u16),
	#[error("failed to bind the requested listen port {0}: {1}")]
	ListenFailed(u16, #[source] libp2p::TransportError<std::io::Error>),
	#[error("substrate event loop command channel is closed")]
	Closed,
	#[error("no bootstrap peer connected within {0:?}")]
	NoBootstrapPeersConnected(Duration),
}

/// Commands accepted by the substrate's event loop task.
pub enum Command {
	Dial {
		peer_id: PeerId,
		addresses: Vec<Multiaddr>,
		response: oneshot::Sender<Result<(), String>>,
	},
	OpenStream {
		peer_id: PeerId,
		protocol: libp2p::StreamProtocol,
		response: oneshot::Sender<Result<Stream, String>>,
	},
	FindPeer {
		peer_id: PeerId,
		response: oneshot::Sender<Vec<Multiaddr>>,
	},
	Publish {
		topic: gossipsub::IdentTopic,
		data: Vec<u8>,
	},
	Subscribe {
		topic: gossipsub::IdentTopic,
	},
	IsConnected {
		peer_id: PeerId,
		response: oneshot::Sender<bool>,
	},
}

/// Events surfaced from the swarm to the rest of the node. Inbound
/// data-plane streams are not carried here — they're forwarded on a
/// dedicated channel returned by [`start`], since [`Stream`] is not
/// `Clone`/`Debug`.
#[derive(Debug, Clone)]
pub enum Event {
	ListeningOn(Multiaddr),
	GossipMessage { topic: String, data: Vec<u8> },
	IdentifyReceived { peer_id: PeerId, listen_addrs: Vec<Multiaddr> },
	ReachabilityChanged { publicly_reachable: bool },
}

/// Handle used by the rest of the node to talk to the event loop task.
#[derive(Clone)]
pub struct Handle {
	commands: mpsc::UnboundedSender<Command>,
	data_plane_protocol: libp2p::StreamProtocol,
	/// Peers with a currently-open data-plane stream, kept in step by
	/// callers (`mark_stream_open`/`mark_stream_closed`) rather than the
	/// event loop itself, since the substrate has no visibility into when
	/// the forwarding engine's ingress task for a stream actually ends
	/// (spec.md §4.3: `connections_to`).
	open_data_streams: Arc<Mutex<HashSet<libp2p::PeerId>>>,
}

impl Handle {
	pub async fn dial(&self, peer_id: PeerId, addresses: Vec<Multiaddr>) -> Result<(), String> {
		let (tx, rx) = oneshot::channel();
		self.commands
			.send(Command::Dial {
				peer_id,
				addresses,
				response: tx,
			})
			.map_err(|_| "substrate event loop has stopped".to_string())?;
		rx.await.map_err(|_| "substrate event loop dropped the response channel".to_string())?
	}

	pub async fn open_stream(
		&self,
		peer_id: PeerId,
		protocol: libp2p::StreamProtocol,
	) -> Result<Stream, String> {
		let (tx, rx) = oneshot::channel();
		self.commands
			.send(Command::OpenStream {
				peer_id,
				protocol,
				response: tx,
			})
			.map_err(|_| "substrate event loop has stopped".to_string())?;
		rx.await.map_err(|_| "substrate event loop dropped the response channel".to_string())?
	}

	pub async fn find_peer(&self, peer_id: PeerId) -> Vec<Multiaddr> {
		let (tx, rx) = oneshot::channel();
		if self
			.commands
			.send(Command::FindPeer {
				peer_id,
				response: tx,
			})
			.is_err()
		{
			return Vec::new();
		}
		rx.await.unwrap_or_default()
	}

	pub fn publish(&self, topic: gossipsub::IdentTopic, data: Vec<u8>) {
		let _ = self.commands.send(Command::Publish { topic, data });
	}

	/// Joins the gossipsub mesh for `topic` (spec.md §4.4: "it hashes the
	/// discovery key and joins the gossip topic"). Without this, inbound
	/// messages are never delivered and `publish` reaches no mesh peers.
	pub fn subscribe(&self, topic: gossipsub::IdentTopic) {
		let _ = self.commands.send(Command::Subscribe { topic });
	}

	pub async fn is_connected(&self, peer_id: PeerId) -> bool {
		let (tx, rx) = oneshot::channel();
		if self
			.commands
			.send(Command::IsConnected {
				peer_id,
				response: tx,
			})
			.is_err()
		{
			return false;
		}
		rx.await.unwrap_or(false)
	}

	/// Open data-plane stream protocols to `peer_id` (spec.md §4.3:
	/// "`connections_to(peer_id) → iterator of open stream protocols`").
	/// At most one entry: the data-plane protocol itself, since that's the
	/// only protocol this adapter opens application streams for.
	pub fn connections_to(&self, peer_id: PeerId) -> Vec<libp2p::StreamProtocol> {
		if self.open_data_streams.lock().unwrap().contains(&peer_id.0) {
			vec![self.data_plane_protocol.clone()]
		} else {
			Vec::new()
		}
	}

	/// Records that a data-plane stream to `peer_id` is now open. Callers
	/// that successfully dial or accept a stream must call this so a
	/// later `connections_to` re-check sees it.
	pub fn mark_stream_open(&self, peer_id: PeerId) {
		self.open_data_streams.lock().unwrap().insert(peer_id.0);
	}

	/// Records that the data-plane stream to `peer_id` has closed. Callers
	/// must call this once their ingress task for that stream ends.
	pub fn mark_stream_closed(&self, peer_id: PeerId) {
		self.open_data_streams.lock().unwrap().remove(&peer_id.0);
	}
}

/// Builds the transport (TCP + QUIC, Noise, Yamux) the same way as
/// `core-new/.../core/swarm.rs`'s `create_transport`.
fn build_transport(
	keypair: &libp2p::identity::Keypair,
	relay_transport: relay::client::Transport,
) -> Result<Boxed<(libp2p::PeerId, StreamMuxerBox)>, SubstrateError> {
	let noise_config = noise::Config::new(keypair)
		.map_err(|e| SubstrateError::Noise(Box::new(e)))?;

	let tcp_transport = tcp::tokio::Transport::new(tcp::Config::default().nodelay(true))
		.upgrade(Version::V1)
		.authenticate(noise_config.clone())
		.multiplex(yamux::Config::default())
		.boxed();

	let quic_transport = quic::tokio::Transport::new(quic::Config::new(keypair)).boxed();

	let relay_transport = relay_transport
		.upgrade(Version::V1)
		.authenticate(noise_config)
		.multiplex(yamux::Config::default())
		.boxed();

	Ok(tcp_transport
		.or_transport(quic_transport)
		.map(|either, _| match either {
			Either::Left((peer_id, muxer)) => (peer_id, StreamMuxerBox::new(muxer)),
			Either::Right((peer_id, muxer)) => (peer_id, StreamMuxerBox::new(muxer)),
		})
		.or_transport(relay_transport)
		.map(|either, _| match either {
			Either::Left((peer_id, muxer)) => (peer_id, muxer),
			Either::Right((peer_id, muxer)) => (peer_id, StreamMuxerBox::new(muxer)),
		})
		.boxed())
}

fn build_behaviour(
	keypair: &libp2p::identity::Keypair,
	protocol_version: &str,
	relay_client: relay::client::Behaviour,
) -> Result<Behaviour, SubstrateError> {
	let local_peer_id = keypair.public().to_peer_id();

	let kademlia = {
		let mut config = kad::Config::default();
		config.set_query_timeout(Duration::from_secs(30));
		let mut behaviour =
			kad::Behaviour::with_config(local_peer_id, kad::store::MemoryStore::new(local_peer_id), config);
		behaviour.set_mode(Some(kad::Mode::Server));
		behaviour
	};

	let gossipsub = {
		let config = gossipsub::ConfigBuilder::default()
			.heartbeat_interval(Duration::from_secs(10))
			.validation_mode(gossipsub::ValidationMode::Strict)
			.build()
			.map_err(|e| SubstrateError::Gossipsub(e.to_string()))?;
		gossipsub::Behaviour::new(gossipsub::MessageAuthenticity::Signed(keypair.clone()), config)
			.map_err(SubstrateError::Gossipsub)?
	};

	let identify = identify::Behaviour::new(
		identify::Config::new(format!("/hyprspace/id/{protocol_version}"), keypair.public())
			.with_push_listen_addr_updates(true)
			.with_interval(Duration::from_secs(60)),
	);

	let autonat = autonat::Behaviour::new(local_peer_id, autonat::Config::default());

	let stream = libp2p_stream::Behaviour::new();

	Ok(Behaviour {
		kademlia,
		gossipsub,
		identify,
		autonat,
		relay_client,
		stream,
	})
}

/// Adds the well-known bootstrap peers to the DHT routing table and kicks
/// off `kademlia.bootstrap()` (spec.md §4.3: "bootstraps the DHT against
/// a well-known seed list").
fn add_bootstrap_peers(swarm: &mut Swarm<Behaviour>) -> Vec<libp2p::PeerId> {
	let mut peer_ids = Vec::with_capacity(BOOTSTRAP_PEERS.len());
	for (addr, peer_id) in BOOTSTRAP_PEERS {
		let peer_id: libp2p::PeerId = peer_id.parse().expect("bootstrap peer id is valid");
		let addr: Multiaddr = format!("{addr}/p2p/{peer_id}").parse().expect("valid multiaddr");
		swarm.behaviour_mut().kademlia.add_address(&peer_id, addr);
		peer_ids.push(peer_id);
	}
	let _ = swarm.behaviour_mut().kademlia.bootstrap();
	peer_ids
}

/// Builds the swarm and spawns its event loop task. Returns a [`Handle`]
/// for the rest of the node plus an event receiver.
pub async fn start(
	private_key: &PrivateKey,
	protocol_version: &str,
	listen_port: u16,
) -> Result<
	(
		Handle,
		mpsc::UnboundedReceiver<Event>,
		mpsc::UnboundedReceiver<(PeerId, Stream)>,
	),
	SubstrateError,
> {
	let keypair = &private_key.0;
	let local_peer_id = keypair.public().to_peer_id();

	let (relay_transport, relay_client) = relay::client::new(local_peer_id);
	let transport = build_transport(keypair, relay_transport)?;
	let behaviour = build_behaviour(keypair, protocol_version, relay_client)?;

	let config = libp2p::swarm::Config::with_tokio_executor();
	let mut swarm = Swarm::new(transport, behaviour, local_peer_id, config);

	bind_listen_port(&mut swarm, listen_port)?;
	let bootstrap_peers = add_bootstrap_peers(&mut swarm);

	let data_plane = data_plane_protocol(protocol_version);
	let mut incoming = swarm
		.behaviour()
		.stream
		.new_control()
		.accept(data_plane.clone())
		.expect("data-plane protocol is only ever registered for accept once");

	let (command_tx, command_rx) = mpsc::unbounded_channel();
	let (event_tx, event_rx) = mpsc::unbounded_channel();
	let (incoming_tx, incoming_rx) = mpsc::unbounded_channel();
	let (bootstrap_tx, bootstrap_rx) = oneshot::channel();

	tokio::spawn(async move {
		run_event_loop(swarm, command_rx, event_tx, bootstrap_peers, bootstrap_tx).await;
	});

	tokio::spawn(async move {
		while let Some((peer_id, stream)) = incoming.next().await {
			if incoming_tx.send((PeerId(peer_id), stream)).is_err() {
				break;
			}
		}
	});

	// Dropping `command_tx`/`event_rx`/`incoming_rx` on the early-return
	// path below stops the event loop and accept-forwarding tasks just
	// spawned (their channels close, ending their `recv`/`next` loops).
	if tokio::time::timeout(BOOTSTRAP_TIMEOUT, bootstrap_rx).await.is_err() {
		return Err(SubstrateError::NoBootstrapPeersConnected(BOOTSTRAP_TIMEOUT));
	}

	Ok((
		Handle {
			commands: command_tx,
			data_plane_protocol: data_plane,
			open_data_streams: Arc::new(Mutex::new(HashSet::new())),
		},
		event_rx,
		incoming_rx,
	))
}

/// TCP and QUIC listen addresses on `[::]` and `0.0.0.0` at `port`
/// (spec.md §4.3).
fn listen_addrs(port: u16) -> [Multiaddr; 4] {
	[
		format!("/ip4/0.0.0.0/tcp/{port}").parse().expect("valid multiaddr"),
		format!("/ip6/::/tcp/{port}").parse().expect("valid multiaddr"),
		format!("/ip4/0.0.0.0/udp/{port}/quic-v1").parse().expect("valid multiaddr"),
		format!("/ip6/::/udp/{port}/quic-v1").parse().expect("valid multiaddr"),
	]
}

/// Sequential upward port search on the default port; a fatal bind
/// failure on an explicit non-default port (spec.md §4.3).
fn bind_listen_port(swarm: &mut Swarm<Behaviour>, listen_port: u16) -> Result<(), SubstrateError> {
	const DEFAULT_PORT: u16 = 8001;

	if listen_port != DEFAULT_PORT {
		for addr in listen_addrs(listen_port) {
			swarm
				.listen_on(addr)
				.map_err(|e| SubstrateError::ListenFailed(listen_port, e))?;
		}
		return Ok(());
	}

	let mut port = listen_port;
	loop {
		let all_bound = listen_addrs(port).into_iter().all(|addr| swarm.listen_on(addr).is_ok());
		if all_bound {
			return Ok(());
		}
		if port == u16::MAX {
			return Err(SubstrateError::NoFreePort(listen_port));
		}
		port += 1;
	}
}

/// Runs the swarm's command/event loop for its entire lifetime. While
/// `bootstrap_connected` is still held, every `SwarmEvent::ConnectionEstablished`
/// is checked against `bootstrap_peers`; the first match fires it once
/// (spec.md §4.3: "Fails if fewer than one bootstrap peer connects"),
/// handed back to `start` as the bootstrap gate. Every event is still
/// forwarded through `handle_swarm_event` regardless of that gate's state,
/// so nothing observed during the bootstrap wait is lost.
async fn run_event_loop(
	mut swarm: Swarm<Behaviour>,
	mut commands: mpsc::UnboundedReceiver<Command>,
	events: mpsc::UnboundedSender<Event>,
	bootstrap_peers: Vec<libp2p::PeerId>,
	bootstrap_connected: oneshot::Sender<()>,
) {
	let mut reachable = false;
	let mut bootstrap_connected = Some(bootstrap_connected);

	loop {
		tokio::select! {
			command = commands.recv() => {
				match command {
					Some(command) => handle_command(&mut swarm, command).await,
					None => break,
				}
			}
			event = swarm.select_next_some() => {
				if let SwarmEvent::ConnectionEstablished { peer_id, .. } = &event {
					if bootstrap_connected.is_some() && bootstrap_peers.contains(peer_id) {
						let _ = bootstrap_connected.take().unwrap().send(());
					}
				}
				handle_swarm_event(&mut swarm, event, &events, &mut reachable);
			}
		}
	}
}

async fn handle_command(swarm: &mut Swarm<Behaviour>, command: Command) {
	match command {
		Command::Dial {
			peer_id,
			addresses,
			response,
		} => {
			let opts = libp2p::swarm::dial_opts::DialOpts::peer_id(peer_id.0)
				.addresses(addresses)
				.build();
			let result = swarm.dial(opts).map_err(|e| e.to_string());
			let _ = response.send(result);
		}
		Command::OpenStream {
			peer_id,
			protocol,
			response,
		} => {
			let mut control = swarm.behaviour().stream.new_control();
			tokio::spawn(async move {
				let result = control.open_stream(peer_id.0, protocol).await.map_err(|e| e.to_string());
				let _ = response.send(result);
			});
		}
		Command::FindPeer { peer_id, response } => {
			swarm.behaviour_mut().kademlia.get_closest_peers(peer_id.0);
			// The resolved addresses arrive asynchronously through
			// `kad::Event::OutboundQueryProgressed`; callers that need the
			// result synchronously should instead watch the event stream.
			// Returning an empty vec here keeps the command/response
			// contract simple for the common "kick off a lookup" case.
			let _ = response.send(Vec::new());
		}
		Command::Publish { topic, data } => {
			let _ = swarm.behaviour_mut().gossipsub.publish(topic, data);
		}
		Command::Subscribe { topic } => {
			if let Err(err) = swarm.behaviour_mut().gossipsub.subscribe(&topic) {
				tracing::warn!(%err, "failed to subscribe to rendezvous topic");
			}
		}
		Command::IsConnected { peer_id, response } => {
			let _ = response.send(swarm.is_connected(&peer_id.0));
		}
	}
}

fn handle_swarm_event(
	swarm: &mut Swarm<Behaviour>,
	event: SwarmEvent<BehaviourEvent>,
	events: &mpsc::UnboundedSender<Event>,
	reachable: &mut bool,
) {
	match event {
		SwarmEvent::NewListenAddr { address, .. } => {
			tracing::info!(%address, "listening");
			let _ = events.send(Event::ListeningOn(address));
		}
		SwarmEvent::Behaviour(BehaviourEvent::Gossipsub(gossipsub::Event::Message {
			message, ..
		})) => {
			let _ = events.send(Event::GossipMessage {
				topic: message.topic.to_string(),
				data: message.data,
			});
		}
		SwarmEvent::Behaviour(BehaviourEvent::Identify(identify::Event::Received {
			peer_id,
			info,
			..
		})) => {
			for addr in &info.listen_addrs {
				swarm.behaviour_mut().kademlia.add_address(&peer_id, addr.clone());
			}
			let _ = events.send(Event::IdentifyReceived {
				peer_id: PeerId(peer_id),
				listen_addrs: info.listen_addrs,
			});
		}
		SwarmEvent::Behaviour(BehaviourEvent::Autonat(autonat::Event::StatusChanged {
			new, ..
		})) => {
			*reachable = matches!(new, autonat::NatStatus::Public(_));
			let _ = events.send(Event::ReachabilityChanged {
				publicly_reachable: *reachable,
			});
		}
		SwarmEvent::Behaviour(BehaviourEvent::Kademlia(kad::Event::RoutingUpdated {
			peer,
			addresses,
			..
		})) => {
			tracing::debug!(%peer, ?addresses, "kademlia routing updated");
		}
		other => {
			tracing::trace!(?other, "unhandled swarm event");
		}
	}
}
