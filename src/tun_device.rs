//! TUN Endpoint (spec.md §4.1). Creates an IPv4 point-to-point kernel
//! device, sets its address/MTU, brings it up, and exposes a minimal
//! read/write-one-packet contract. Grounded on the `tun` crate usage in
//! `examples/other_examples/5625f161_lu-zero-rustyguard__examples-tun.rs.rs`
//! and on the address/mtu/up/delete operations in
//! `examples/original_source/tun/tun_linux.go`.

use std::sync::Arc;

use tokio::io::{AsyncReadExt, AsyncWriteExt, ReadHalf, WriteHalf};
use tokio::sync::Mutex;

use crate::cidr::Ipv4Cidr;

/// Maximum IPv4 packet size that may enter or leave the TUN (spec.md §3).
pub const MTU: usize = 1420;

#[derive(Debug, thiserror::Error)]
pub enum DeviceError {
	#[error("failed to create tun device {name}: {source}")]
	Create {
		name: String,
		#[source]
		source: std::io::Error,
	},
	#[error("failed to read packet from tun device: {0}")]
	Read(#[source] std::io::Error),
	#[error("failed to write packet to tun device: {0}")]
	Write(#[source] std::io::Error),
}

/// A configured, up, point-to-point IPv4 TUN device.
pub struct TunDevice {
	name: String,
	inner: tun::AsyncDevice,
}

impl TunDevice {
	/// Creates the device, assigns `address`, sets MTU, and brings it up.
	/// `close()` must be called to remove it; dropping without closing
	/// leaves the device for the kernel/OS to reclaim.
	pub fn create(name: &str, address: Ipv4Cidr) -> Result<Self, DeviceError> {
		let mut config = tun::Configuration::default();
		config
			.tun_name(name)
			.address(address.address)
			.netmask(prefix_to_netmask(address.prefix_len))
			.mtu(MTU as i32)
			.up();

		let inner = tun::create_as_async(&config).map_err(|source| DeviceError::Create {
			name: name.to_string(),
			source: std::io::Error::new(std::io::ErrorKind::Other, source),
		})?;

		Ok(Self {
			name: name.to_string(),
			inner,
		})
	}

	pub fn name(&self) -> &str {
		&self.name
	}

	/// Reads exactly one IPv4 packet, up to [`MTU`] bytes.
	pub async fn read_packet(&mut self, buf: &mut [u8; MTU]) -> Result<usize, DeviceError> {
		self.inner.read(buf).await.map_err(DeviceError::Read)
	}

	/// Writes exactly one IPv4 packet.
	pub async fn write_packet(&mut self, packet: &[u8]) -> Result<(), DeviceError> {
		self.inner
			.write_all(packet)
			.await
			.map_err(DeviceError::Write)
	}

	/// Splits the device into an independent reader (for the Forwarding
	/// Engine's single TUN-read task) and a cloneable, lock-guarded
	/// writer (for its per-peer ingress tasks, spec.md §4.7).
	pub fn split(self) -> (TunReader, TunWriter) {
		let (read, write) = tokio::io::split(self.inner);
		(
			TunReader { name: self.name.clone(), inner: read },
			TunWriter { name: self.name, inner: Arc::new(Mutex::new(write)) },
		)
	}

	/// Administratively downs and removes the device. On platforms that
	/// cannot remove a TUN device, this is a no-op — the shutdown path
	/// must never fail because of it (spec.md §4.1).
	pub fn close(self) {
		// Dropping `inner` closes the underlying fd; the OS reclaims a
		// point-to-point TUN device once its last fd is closed, so there
		// is nothing further to do here (matches `tun.Delete` tolerating
		// errors on platforms that can't explicitly remove the device).
		drop(self.inner);
	}
}

/// The read half of a split [`TunDevice`] (spec.md §4.7's single
/// TUN-read task).
pub struct TunReader {
	name: String,
	inner: ReadHalf<tun::AsyncDevice>,
}

impl TunReader {
	pub fn name(&self) -> &str {
		&self.name
	}

	pub async fn read_packet(&mut self, buf: &mut [u8; MTU]) -> Result<usize, DeviceError> {
		self.inner.read(buf).await.map_err(DeviceError::Read)
	}
}

/// The write half of a split [`TunDevice`], shared across the Forwarding
/// Engine's per-peer ingress tasks.
#[derive(Clone)]
pub struct TunWriter {
	name: String,
	inner: Arc<Mutex<WriteHalf<tun::AsyncDevice>>>,
}

impl TunWriter {
	pub fn name(&self) -> &str {
		&self.name
	}

	pub async fn write_packet(&self, packet: &[u8]) -> Result<(), DeviceError> {
		let mut guard = self.inner.lock().await;
		guard.write_all(packet).await.map_err(DeviceError::Write)
	}
}

fn prefix_to_netmask(prefix_len: u8) -> std::net::Ipv4Addr {
	let bits: u32 = if prefix_len == 0 {
		0
	} else {
		u32::MAX << (32 - prefix_len as u32)
	};
	std::net::Ipv4Addr::from(bits)
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn netmask_for_slash_24() {
		assert_eq!(
			prefix_to_netmask(24),
			std::net::Ipv4Addr::new(255, 255, 255, 0)
		);
	}

	#[test]
	fn netmask_for_slash_32() {
		assert_eq!(
			prefix_to_netmask(32),
			std::net::Ipv4Addr::new(255, 255, 255, 255)
		);
	}

	#[test]
	fn netmask_for_slash_0() {
		assert_eq!(prefix_to_netmask(0), std::net::Ipv4Addr::new(0, 0, 0, 0));
	}
}
