//! Minimal IPv4 CIDR parsing, just enough for the interface's own
//! `address: "10.1.1.1/24"` config field. Not a general-purpose CIDR type.

use std::net::Ipv4Addr;
use std::str::FromStr;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Ipv4Cidr {
	pub address: Ipv4Addr,
	pub prefix_len: u8,
}

#[derive(Debug, thiserror::Error)]
pub enum CidrParseError {
	#[error("missing '/' prefix length in \"{0}\"")]
	MissingPrefix(String),
	#[error("invalid ipv4 address in \"{0}\"")]
	InvalidAddress(String),
	#[error("invalid prefix length in \"{0}\" (must be 0-32)")]
	InvalidPrefixLen(String),
}

impl FromStr for Ipv4Cidr {
	type Err = CidrParseError;

	fn from_str(s: &str) -> Result<Self, Self::Err> {
		let (addr, prefix) = s
			.split_once('/')
			.ok_or_else(|| CidrParseError::MissingPrefix(s.to_string()))?;

		let address = addr
			.parse::<Ipv4Addr>()
			.map_err(|_| CidrParseError::InvalidAddress(s.to_string()))?;

		let prefix_len = prefix
			.parse::<u8>()
			.ok()
			.filter(|p| *p <= 32)
			.ok_or_else(|| CidrParseError::InvalidPrefixLen(s.to_string()))?;

		Ok(Self { address, prefix_len })
	}
}

impl std::fmt::Display for Ipv4Cidr {
	fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
		write!(f, "{}/{}", self.address, self.prefix_len)
	}
}

impl serde::Serialize for Ipv4Cidr {
	fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
		serializer.serialize_str(&self.to_string())
	}
}

impl<'de> serde::Deserialize<'de> for Ipv4Cidr {
	fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
		let s = String::deserialize(deserializer)?;
		s.parse().map_err(serde::de::Error::custom)
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn parses_valid_cidr() {
		let cidr: Ipv4Cidr = "10.1.1.1/24".parse().unwrap();
		assert_eq!(cidr.address, Ipv4Addr::new(10, 1, 1, 1));
		assert_eq!(cidr.prefix_len, 24);
	}

	#[test]
	fn rejects_missing_prefix() {
		assert!("10.1.1.1".parse::<Ipv4Cidr>().is_err());
	}

	#[test]
	fn rejects_out_of_range_prefix() {
		assert!("10.1.1.1/33".parse::<Ipv4Cidr>().is_err());
	}

	#[test]
	fn rejects_garbage_address() {
		assert!("not-an-ip/24".parse::<Ipv4Cidr>().is_err());
	}
}
