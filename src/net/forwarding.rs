//! Forwarding Engine (spec.md §4.7): one egress path that reads the TUN
//! device directly from the TUN-read task (no dedicated egress task —
//! spec.md §5), and one ingress task per active or accepted stream.
//! Grounded on the teacher's stream-oriented read-loop shape in
//! `examples/other_examples/5625f161_lu-zero-rustyguard__examples-tun.rs.rs`
//! generalized to per-peer session routing.

use std::net::Ipv4Addr;
use std::sync::Arc;

use tokio::io::split;
use tokio::sync::mpsc;

use crate::net::codec::{self, FrameError};
use crate::net::identity::PeerId;
use crate::net::registry::PeerRegistry;
use crate::net::session::{Session, Stream};
use crate::tun_device::{TunReader, TunWriter, MTU};

/// Reads packets from the TUN device and forwards them to the peer
/// session that owns their destination address, until `shutdown` fires.
pub async fn run_egress(
	mut tun: TunReader,
	registry: Arc<PeerRegistry>,
	mut shutdown: mpsc::Receiver<()>,
) {
	let mut buf = [0u8; MTU];
	loop {
		tokio::select! {
			_ = shutdown.recv() => {
				tracing::info!("egress loop stopping");
				return;
			}
			result = tun.read_packet(&mut buf) => {
				match result {
					Ok(n) => forward_one(&registry, &buf[..n]).await,
					Err(err) => {
						tracing::error!(%err, "tun read error, stopping egress loop");
						return;
					}
				}
			}
		}
	}
}

async fn forward_one(registry: &Arc<PeerRegistry>, packet: &[u8]) {
	let Some(dest) = destination_address(packet) else {
		return;
	};
	let Some(session) = registry.session_by_ip(dest) else {
		// Unknown destination: silently dropped (spec.md §4.7).
		return;
	};

	match session.write_frame(packet).await {
		Ok(true) | Ok(false) => {}
		Err(err) => {
			tracing::debug!(%dest, %err, "write to peer failed, session torn down");
		}
	}
}

/// Extracts the destination IPv4 address from bytes 16..19 of an IPv4
/// header (fixed offset, no header-length parsing needed — spec.md
/// §4.7).
fn destination_address(packet: &[u8]) -> Option<Ipv4Addr> {
	let bytes: [u8; 4] = packet.get(16..20)?.try_into().ok()?;
	Some(Ipv4Addr::from(bytes))
}

/// Spawns the ingress task for a stream this node actively dialed. The
/// session's `generation` is captured at spawn time so a stale teardown
/// can never clobber a subsequently superseded session (spec.md §9).
/// `on_close` runs once the stream's ingress task ends, so the caller can
/// clear any substrate-level open-stream bookkeeping (spec.md §4.3:
/// `connections_to`).
pub fn spawn_dialed_ingress(
	session: Arc<Session>,
	stream: Stream,
	tun: TunWriter,
	on_close: impl FnOnce() + Send + 'static,
) {
	let (read, write) = split(stream);
	let generation = session.mark_active(write);
	tokio::spawn({
		let session = session.clone();
		async move {
			// Zero-length sentinel write to guarantee the remote's accept
			// callback fires (spec.md §4.5, §9).
			if let Err(err) = session.write_frame(&[]).await {
				tracing::debug!(%err, "sentinel write failed");
				on_close();
				return;
			}
			run_ingress(read, tun, Some((session, generation))).await;
			on_close();
		}
	});
}

/// Spawns the ingress task for an inbound, accepted stream. Accepted
/// streams never touch Session state (spec.md §9: "inbound duplication
/// is tolerated") — they're read-only conduits authenticated against
/// `by_id` by the caller before this is invoked. `on_close` runs once the
/// stream's ingress task ends (see `spawn_dialed_ingress`).
pub fn spawn_accepted_ingress(peer_id: PeerId, stream: Stream, tun: TunWriter, on_close: impl FnOnce() + Send + 'static) {
	tracing::debug!(%peer_id, "accepted inbound data-plane stream");
	tokio::spawn(async move {
		run_ingress(stream, tun, None).await;
		on_close();
	});
}

/// Authenticates an inbound stream's remote peer against the registry
/// (spec.md §3 invariant 4, §4.5: "Authentication is performed by the
/// acceptor"). Returns `None` if the peer isn't in `by_id`.
pub fn authenticate_inbound(registry: &PeerRegistry, peer_id: PeerId) -> Option<Ipv4Addr> {
	registry.resolve_by_id(peer_id)
}

async fn run_ingress<R>(mut reader: R, tun: TunWriter, owner: Option<(Arc<Session>, u64)>)
where
	R: tokio::io::AsyncRead + Unpin,
{
	let mut buf = Vec::with_capacity(MTU);
	loop {
		match codec::read_frame(&mut reader, &mut buf).await {
			Ok(0) => {
				// The zero-length sentinel written on entry to Active
				// (spec.md §9) — not data, skip it.
				continue;
			}
			Ok(n) => {
				if let Err(err) = tun.write_packet(&buf[..n]).await {
					tracing::debug!(%err, "tun write failed, tearing down ingress");
					break;
				}
			}
			Err(FrameError::Io(err)) => {
				tracing::debug!(%err, "ingress stream closed");
				break;
			}
			Err(err @ FrameError::TooLarge(_)) => {
				tracing::warn!(%err, "oversized frame on ingress stream");
				break;
			}
		}
	}

	if let Some((session, generation)) = owner {
		session.mark_closed(generation);
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn extracts_destination_from_fixed_offset() {
		let mut packet = vec![0u8; 20];
		packet[0] = 0x45; // IPv4, IHL=5
		packet[16..20].copy_from_slice(&[10, 1, 1, 42]);
		assert_eq!(
			destination_address(&packet),
			Some(Ipv4Addr::new(10, 1, 1, 42))
		);
	}

	#[test]
	fn too_short_packet_has_no_destination() {
		let packet = vec![0u8; 10];
		assert_eq!(destination_address(&packet), None);
	}
}
