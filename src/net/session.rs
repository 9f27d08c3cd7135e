//! Session Manager (spec.md §4.5): the per-peer `Idle/Dialing/Active/
//! Backoff` state machine. A [`Session`] is the Rust name for spec.md's
//! "Session Slot" — renamed to avoid colliding with libp2p's own
//! `Stream`/`Connection` vocabulary (see SPEC_FULL.md's glossary addendum).
//!
//! Grounded on the teacher's separation of connection-state bookkeeping
//! from the swarm itself (`core-new/.../persistent/manager.rs`'s
//! `RetryScheduler`/`RetryInfo`), simplified to the flat 5s backoff spec.md
//! actually asks for.

use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use tokio::io::WriteHalf;
use tokio::sync::Mutex as AsyncMutex;

use crate::net::codec::{self, FrameError};
use crate::net::identity::PeerId;

/// A raw, authenticated, bidirectional data-plane substream.
pub type Stream = libp2p_stream::Stream;

const BACKOFF: Duration = Duration::from_secs(5);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum State {
	Idle,
	Dialing,
	Active,
	Backoff,
}

struct Inner {
	state: State,
	backoff_until: Option<Instant>,
	writer: Option<Arc<AsyncMutex<WriteHalf<Stream>>>>,
	/// Bumped every time a stream is installed. Lets a reader task spawned
	/// for a since-superseded stream recognize it's stale and avoid
	/// clobbering a newer session's Active state when it tears itself
	/// down (spec.md §9: "the slot id is captured when the ingress task
	/// is spawned").
	generation: u64,
}

/// Per-peer mutable session state, owned by the [`crate::net::registry::PeerRegistry`].
pub struct Session {
	pub peer_id: PeerId,
	inner: Mutex<Inner>,
}

impl Session {
	pub fn new(peer_id: PeerId) -> Arc<Self> {
		Arc::new(Self {
			peer_id,
			inner: Mutex::new(Inner {
				state: State::Idle,
				backoff_until: None,
				writer: None,
				generation: 0,
			}),
		})
	}

	/// Current state, resolving an elapsed backoff back to `Idle` so
	/// callers don't each need to know about `backoff_until`.
	pub fn state(&self) -> State {
		let inner = self.inner.lock().unwrap();
		match inner.state {
			State::Backoff if inner.backoff_until.map_or(true, |until| Instant::now() >= until) => {
				State::Idle
			}
			other => other,
		}
	}

	/// `Idle -> Dialing`. Returns `false` if another dial/active session
	/// already occupies the slot, or backoff hasn't elapsed yet.
	pub fn begin_dial(&self) -> bool {
		let mut inner = self.inner.lock().unwrap();
		let eligible = match inner.state {
			State::Idle => true,
			State::Backoff => inner.backoff_until.map_or(true, |until| Instant::now() >= until),
			State::Dialing | State::Active => false,
		};
		if eligible {
			inner.state = State::Dialing;
		}
		eligible
	}

	/// `Dialing -> Active`, installing the new stream's write half.
	/// Returns the generation under which it was installed.
	pub fn mark_active(&self, writer: WriteHalf<Stream>) -> u64 {
		let mut inner = self.inner.lock().unwrap();
		inner.generation += 1;
		inner.state = State::Active;
		inner.writer = Some(Arc::new(AsyncMutex::new(writer)));
		inner.generation
	}

	/// `Dialing -> Backoff` ("failed to dial"/"no addresses") or `Idle`
	/// (any other error) per spec.md §4.5.
	pub fn mark_dial_failed(&self, retriable: bool) {
		let mut inner = self.inner.lock().unwrap();
		if retriable {
			inner.state = State::Backoff;
			inner.backoff_until = Some(Instant::now() + BACKOFF);
		} else {
			inner.state = State::Idle;
		}
	}

	/// `Active -> Idle`. A no-op if `generation` no longer matches the
	/// currently installed stream (a newer session already superseded
	/// it) — this is what keeps a stale stream from ever being reused.
	pub fn mark_closed(&self, generation: u64) {
		let mut inner = self.inner.lock().unwrap();
		if inner.generation == generation {
			inner.state = State::Idle;
			inner.writer = None;
		}
	}

	pub fn generation(&self) -> u64 {
		self.inner.lock().unwrap().generation
	}

	/// Writes one frame to the active stream. Returns `Ok(false)` if the
	/// slot isn't Active (caller drops the packet, per spec.md §4.7).
	/// A write error tears the slot down to Idle before returning.
	pub async fn write_frame(&self, payload: &[u8]) -> Result<bool, FrameError> {
		let (writer, generation) = {
			let inner = self.inner.lock().unwrap();
			match (&inner.state, &inner.writer) {
				(State::Active, Some(writer)) => (writer.clone(), inner.generation),
				_ => return Ok(false),
			}
		};

		let mut guard = writer.lock().await;
		let result = codec::write_frame(&mut *guard, payload).await;
		drop(guard);

		if let Err(err) = result {
			self.mark_closed(generation);
			return Err(err);
		}
		Ok(true)
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	fn peer() -> PeerId {
		crate::net::identity::PrivateKey::generate().peer_id()
	}

	#[test]
	fn starts_idle() {
		let session = Session::new(peer());
		assert_eq!(session.state(), State::Idle);
	}

	#[test]
	fn dial_then_failure_goes_to_backoff() {
		let session = Session::new(peer());
		assert!(session.begin_dial());
		assert_eq!(session.state(), State::Dialing);
		session.mark_dial_failed(true);
		assert_eq!(session.state(), State::Backoff);
	}

	#[test]
	fn non_retriable_failure_returns_to_idle_immediately() {
		let session = Session::new(peer());
		assert!(session.begin_dial());
		session.mark_dial_failed(false);
		assert_eq!(session.state(), State::Idle);
	}

	#[test]
	fn cannot_begin_second_dial_while_dialing() {
		let session = Session::new(peer());
		assert!(session.begin_dial());
		assert!(!session.begin_dial());
	}

	#[test]
	fn stale_generation_does_not_clobber_newer_session() {
		let session = Session::new(peer());
		assert!(session.begin_dial());
		let (_a, b) = tokio::io::duplex(64);
		let (_read, write) = tokio::io::split(b);
		let stale_generation = session.mark_active(write);
		assert_eq!(session.state(), State::Active);

		// A newer dial supersedes the stream.
		session.mark_closed(stale_generation);
		assert_eq!(session.state(), State::Idle);
		assert!(session.begin_dial());
		let (_a2, b2) = tokio::io::duplex(64);
		let (_read2, write2) = tokio::io::split(b2);
		session.mark_active(write2);
		assert_eq!(session.state(), State::Active);

		// The stale generation's teardown must not affect the new stream.
		session.mark_closed(stale_generation);
		assert_eq!(session.state(), State::Active);
	}
}
