//! Ties together every component into one running overlay interface:
//! `up()` brings everything online, `shutdown()` deterministically tears
//! it down (spec.md §5: "cancelling it cancels discovery and all
//! ingress tasks ... closing the substrate ... then releasing the
//! TUN"). Grounded on the start/stop shape of
//! `core-new/src/infrastructure/cli/daemon.rs`'s `Daemon::start`, scaled
//! down from a socket server to one in-process value per interface.

use std::path::PathBuf;
use std::sync::Arc;

use tokio::sync::mpsc;

use crate::config::Config;
use crate::net::discovery::{self, Reachability};
use crate::net::forwarding;
use crate::net::registry::{PeerRecord, PeerRegistry, RegistryError};
use crate::net::substrate::{self, Event as SubstrateEvent, SubstrateError};
use crate::state::{InterfaceState, StateError, StateFiles};
use crate::tun_device::{DeviceError, TunDevice};

/// The data-plane protocol version suffix (spec.md §6: `"/hyprspace/<version>"`).
pub const PROTOCOL_VERSION: &str = env!("CARGO_PKG_VERSION");

#[derive(Debug, thiserror::Error)]
pub enum InterfaceError {
	#[error(transparent)]
	Registry(#[from] RegistryError),
	#[error(transparent)]
	Device(#[from] DeviceError),
	#[error(transparent)]
	Substrate(#[from] SubstrateError),
	#[error(transparent)]
	State(#[from] StateError),
}

/// One running overlay interface: its TUN device, peer registry,
/// substrate, and the tasks that move packets between them.
pub struct Interface {
	name: String,
	state_files: StateFiles,
	registry: Arc<PeerRegistry>,
	shutdown_egress: mpsc::Sender<()>,
	shutdown_discovery: mpsc::Sender<()>,
	accept_task: tokio::task::JoinHandle<()>,
	state_task: tokio::task::JoinHandle<()>,
}

impl Interface {
	/// Brings the interface up: creates the TUN device, builds the peer
	/// registry, starts the libp2p substrate, and spawns the egress,
	/// ingress-accept, discovery, and state-persistence tasks.
	pub async fn up(config: Config, run_dir: PathBuf) -> Result<Self, InterfaceError> {
		let iface = &config.interface;

		let tun = TunDevice::create(&iface.name, iface.address)?;
		let (tun_reader, tun_writer) = tun.split();

		let records = config.peers.iter().map(|(&overlay_ipv4, entry)| PeerRecord {
			overlay_ipv4,
			peer_id: entry.id,
		});
		let registry = Arc::new(PeerRegistry::build(iface.address.address, records)?);

		let (substrate_handle, mut events, mut incoming) =
			substrate::start(&iface.private_key, PROTOCOL_VERSION, iface.listen_port).await?;

		let reachability = Reachability::default();

		let state_files = StateFiles::new(&run_dir, &iface.name);
		state_files.acquire_lock()?;

		let (egress_shutdown_tx, egress_shutdown_rx) = mpsc::channel(1);
		tokio::spawn(forwarding::run_egress(tun_reader, registry.clone(), egress_shutdown_rx));

		let (on_active_stream_tx, mut on_active_stream_rx) =
			mpsc::unbounded_channel::<(crate::net::identity::PeerId, crate::net::session::Stream, bool)>();
		{
			let registry = registry.clone();
			let tun_writer = tun_writer.clone();
			let substrate_handle = substrate_handle.clone();
			tokio::spawn(async move {
				while let Some((peer_id, stream, _dialed)) = on_active_stream_rx.recv().await {
					if let Some(session) = registry.session(peer_id) {
						let substrate_handle = substrate_handle.clone();
						forwarding::spawn_dialed_ingress(session.clone(), stream, tun_writer.clone(), move || {
							substrate_handle.mark_stream_closed(peer_id)
						});
					}
				}
			});
		}

		let (discovery_events_tx, discovery_events_rx) = mpsc::unbounded_channel();
		let (discovery_shutdown_tx, discovery_shutdown_rx) = mpsc::channel(1);
		{
			let registry = registry.clone();
			let reachability = reachability.clone();
			let substrate_handle = substrate_handle.clone();
			let protocol_version = PROTOCOL_VERSION.to_string();
			let discover_key = iface.discover_key.clone();
			let on_active_stream_tx = on_active_stream_tx.clone();
			tokio::spawn(async move {
				discovery::run(
					registry,
					substrate_handle,
					protocol_version,
					discover_key,
					reachability,
					discovery_events_rx,
					discovery_shutdown_rx,
					on_active_stream_tx,
				)
				.await;
			});
		}

		// Fan substrate events out to the discovery loop and update the
		// shared reachability flag in lockstep.
		{
			let reachability = reachability.clone();
			tokio::spawn(async move {
				while let Some(event) = events.recv().await {
					if let SubstrateEvent::ReachabilityChanged { publicly_reachable } = &event {
						reachability.set(*publicly_reachable);
					}
					if discovery_events_tx.send(event).is_err() {
						break;
					}
				}
			});
		}

		// Authenticate and spawn ingress for every accepted inbound
		// stream (spec.md §3 invariant 4, §4.5, §7 error 5). An unknown
		// peer id's stream is simply dropped, which resets it on the
		// remote side without touching any other session.
		let accept_task = {
			let registry = registry.clone();
			let tun_writer = tun_writer.clone();
			let substrate_handle = substrate_handle.clone();
			tokio::spawn(async move {
				while let Some((peer_id, stream)) = incoming.recv().await {
					match forwarding::authenticate_inbound(&registry, peer_id) {
						Some(_overlay_ip) => {
							substrate_handle.mark_stream_open(peer_id);
							let substrate_handle = substrate_handle.clone();
							forwarding::spawn_accepted_ingress(peer_id, stream, tun_writer.clone(), move || {
								substrate_handle.mark_stream_closed(peer_id)
							});
						}
						None => {
							tracing::warn!(%peer_id, "rejected inbound stream from unconfigured peer");
							drop(stream);
						}
					}
				}
			})
		};

		let state_task = {
			let registry = registry.clone();
			let state_files_path = run_dir.clone();
			let name = iface.name.clone();
			tokio::spawn(async move {
				let files = StateFiles::new(&state_files_path, &name);
				let mut ticker = tokio::time::interval(std::time::Duration::from_secs(5));
				loop {
					ticker.tick().await;
					let mut state = InterfaceState::default();
					for record in registry.all() {
						let connected = registry
							.session(record.peer_id)
							.map(|s| s.state() == crate::net::session::State::Active)
							.unwrap_or(false);
						state.peers.insert(record.overlay_ipv4, connected);
					}
					if let Err(err) = files.write(&state) {
						tracing::warn!(%err, "failed to write interface state file");
					}
				}
			})
		};

		Ok(Self {
			name: iface.name.clone(),
			state_files,
			registry,
			shutdown_egress: egress_shutdown_tx,
			shutdown_discovery: discovery_shutdown_tx,
			accept_task,
			state_task,
		})
	}

	pub fn name(&self) -> &str {
		&self.name
	}

	pub fn registry(&self) -> &Arc<PeerRegistry> {
		&self.registry
	}

	/// Deterministically tears the interface down: stop discovery, stop
	/// egress, abort the accept and state tasks, then release the lock
	/// file (spec.md §5 shutdown ordering).
	pub async fn shutdown(self) {
		let _ = self.shutdown_discovery.send(()).await;
		let _ = self.shutdown_egress.send(()).await;
		self.accept_task.abort();
		self.state_task.abort();
		self.state_files.release_lock();
	}
}
