//! Persisted per-interface state (spec.md §6): a `<interface>.state` YAML
//! file the discovery loop rewrites on every tick, plus a
//! `<interface>.lock` PID file written at start and removed at clean
//! shutdown. Grounded on the PID-file convention in
//! `core-new/src/infrastructure/cli/daemon.rs`'s `Daemon::start`/`stop`.

use std::collections::HashMap;
use std::net::Ipv4Addr;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

#[derive(Debug, thiserror::Error)]
pub enum StateError {
	#[error("failed to write state file {path}: {source}")]
	Write {
		path: String,
		#[source]
		source: std::io::Error,
	},
	#[error("failed to write lock file {path}: {source}")]
	Lock {
		path: String,
		#[source]
		source: std::io::Error,
	},
}

#[derive(Debug, Default, Serialize, Deserialize)]
pub struct InterfaceState {
	#[serde(flatten)]
	pub peers: HashMap<Ipv4Addr, bool>,
}

/// Handles to the `<interface>.state` and `<interface>.lock` files for
/// one running interface.
pub struct StateFiles {
	state_path: PathBuf,
	lock_path: PathBuf,
}

impl StateFiles {
	pub fn new(run_dir: impl AsRef<Path>, interface_name: &str) -> Self {
		let run_dir = run_dir.as_ref();
		Self {
			state_path: run_dir.join(format!("{interface_name}.state")),
			lock_path: run_dir.join(format!("{interface_name}.lock")),
		}
	}

	/// Writes the supervisor's PID to the lock file (spec.md §6). Called
	/// once at interface start.
	pub fn acquire_lock(&self) -> Result<(), StateError> {
		std::fs::write(&self.lock_path, std::process::id().to_string()).map_err(|source| {
			StateError::Lock {
				path: self.lock_path.display().to_string(),
				source,
			}
		})
	}

	/// Removes the lock file on clean shutdown.
	pub fn release_lock(&self) {
		let _ = std::fs::remove_file(&self.lock_path);
	}

	/// Overwrites the state file with the current connectivity snapshot.
	/// Called by the discovery loop each tick (spec.md §6, §7: reflects
	/// `connected: false` within 5 s of a peer failure).
	pub fn write(&self, state: &InterfaceState) -> Result<(), StateError> {
		let yaml = serde_yaml::to_string(state).expect("InterfaceState always serializes");
		std::fs::write(&self.state_path, yaml).map_err(|source| StateError::Write {
			path: self.state_path.display().to_string(),
			source,
		})
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn writes_and_reads_back_state() {
		let dir = std::env::temp_dir().join(format!("hyprspace-state-test-{}", std::process::id()));
		std::fs::create_dir_all(&dir).unwrap();
		let files = StateFiles::new(&dir, "hs0");

		let mut state = InterfaceState::default();
		state.peers.insert(Ipv4Addr::new(10, 1, 1, 2), true);
		files.write(&state).unwrap();

		let raw = std::fs::read_to_string(dir.join("hs0.state")).unwrap();
		let read_back: InterfaceState = serde_yaml::from_str(&raw).unwrap();
		assert_eq!(read_back.peers.get(&Ipv4Addr::new(10, 1, 1, 2)), Some(&true));

		std::fs::remove_dir_all(&dir).ok();
	}

	#[test]
	fn lock_lifecycle_writes_and_removes_pid_file() {
		let dir = std::env::temp_dir().join(format!("hyprspace-lock-test-{}", std::process::id()));
		std::fs::create_dir_all(&dir).unwrap();
		let files = StateFiles::new(&dir, "hs0");

		files.acquire_lock().unwrap();
		assert!(dir.join("hs0.lock").exists());
		files.release_lock();
		assert!(!dir.join("hs0.lock").exists());

		std::fs::remove_dir_all(&dir).ok();
	}
}
