//! Core library for the hyprspace peer-to-peer overlay VPN.
//!
//! The binary target (`src/main.rs`) is a thin CLI front end; everything
//! that actually dials peers, frames packets and drives the TUN device
//! lives here so it can be exercised directly in tests.

pub mod cidr;
pub mod cli;
pub mod config;
pub mod interface;
pub mod net;
pub mod state;
pub mod tun_device;

pub use config::Config;
pub use interface::{Interface, InterfaceError};
