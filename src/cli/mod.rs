//! Thin CLI front end over the core [`crate::Interface`] type (out of
//! core scope per spec.md §6; SPEC_FULL.md A1). Subcommands parse flags,
//! load/validate the YAML config, and call into the core's public API —
//! they never reach past it into Session Slots or the codec directly.
//! Grounded on the subcommand-enum/match shape of `apps/cli/src/main.rs`
//! and the runtime-dir convention in
//! `core-new/src/infrastructure/cli/daemon.rs`'s `DaemonConfig::new`.

use std::net::Ipv4Addr;
use std::path::{Path, PathBuf};

use anyhow::{bail, Context as _, Result};
use clap::{Parser, Subcommand};

use crate::cidr::Ipv4Cidr;
use crate::config::{Config, InterfaceSection, PeerEntry};
use crate::interface::Interface;
use crate::net::identity::{PeerId, PrivateKey};
use crate::state::InterfaceState;

#[derive(Parser, Debug)]
#[command(name = "hyprspace", about = "Peer-to-peer overlay VPN over libp2p")]
pub struct Cli {
	/// Path to the interface's YAML config file.
	#[arg(long, global = true, default_value = "hyprspace.yaml")]
	pub config: PathBuf,

	/// Directory for `<interface>.state`/`<interface>.lock` files.
	/// Defaults to the platform runtime directory, falling back to the
	/// cache directory and then `/tmp`.
	#[arg(long, global = true)]
	pub run_dir: Option<PathBuf>,

	/// Enable verbose (debug-level) logging.
	#[arg(long, short = 'v', global = true)]
	pub verbose: bool,

	#[command(subcommand)]
	pub command: Command,
}

#[derive(Subcommand, Debug)]
pub enum Command {
	/// Generate a new config file with a freshly generated identity.
	Init {
		/// Interface (TUN device) name.
		#[arg(long, default_value = "hs0")]
		name: String,
		/// This node's overlay address, e.g. "10.1.1.1/24".
		#[arg(long)]
		address: Ipv4Cidr,
		#[arg(long, default_value_t = 8001)]
		listen_port: u16,
		/// Shared secret identifying this overlay's rendezvous topic.
		#[arg(long)]
		discover_key: String,
	},
	/// Add a peer to the config's peer table.
	Add {
		/// The peer's overlay IPv4 address.
		ip: Ipv4Addr,
		/// The peer's id (base58 peer id string, from `id`/`keygen`).
		id: String,
	},
	/// Bring the interface up.
	Up {
		/// Run in the foreground instead of delegating to a supervising
		/// daemon process (spec.md §6).
		#[arg(short = 'f', long)]
		foreground: bool,
	},
	/// Tear a running interface down.
	Down,
	/// List configured peers and their last-known connectivity.
	Peers,
	/// Print this node's peer id, for sharing with other peers.
	Id {
		/// Print as a `peers:` map entry ready to paste into a remote
		/// config.
		#[arg(long, conflicts_with = "cmd")]
		yaml: bool,
		/// Print as an `hyprspace add` invocation a peer can run directly.
		#[arg(long, conflicts_with = "yaml")]
		cmd: bool,
	},
	/// Check the current version (no update channel is configured).
	Update,
	/// Generate a new keypair and print it, without touching any config.
	Keygen,
}

pub async fn run(cli: Cli) -> Result<()> {
	init_tracing(cli.verbose);
	let run_dir = resolve_run_dir(cli.run_dir.as_deref());

	match cli.command {
		Command::Init {
			name,
			address,
			listen_port,
			discover_key,
		} => init(&cli.config, name, address, listen_port, discover_key),
		Command::Add { ip, id } => add(&cli.config, ip, id),
		Command::Up { foreground } => up(cli.config, run_dir, cli.verbose, foreground).await,
		Command::Down => down(&cli.config, &run_dir),
		Command::Peers => peers(&cli.config, &run_dir),
		Command::Id { yaml, cmd } => id(&cli.config, yaml, cmd),
		Command::Update => update(),
		Command::Keygen => keygen(),
	}
}

fn init_tracing(verbose: bool) {
	let filter = if verbose { "debug" } else { "info" };
	tracing_subscriber::fmt()
		.with_env_filter(tracing_subscriber::EnvFilter::new(filter))
		.init();
}

/// Mirrors `DaemonConfig::new`'s runtime-dir fallback chain.
fn resolve_run_dir(explicit: Option<&Path>) -> PathBuf {
	explicit.map(Path::to_path_buf).unwrap_or_else(|| {
		dirs::runtime_dir()
			.or_else(dirs::cache_dir)
			.unwrap_or_else(|| PathBuf::from("/tmp"))
	})
}

fn init(
	path: &Path,
	name: String,
	address: Ipv4Cidr,
	listen_port: u16,
	discover_key: String,
) -> Result<()> {
	if path.exists() {
		bail!("config file {} already exists", path.display());
	}

	let private_key = PrivateKey::generate();
	let id = private_key.peer_id();

	let config = Config {
		interface: InterfaceSection {
			name,
			id,
			listen_port,
			address,
			private_key,
			discover_key,
		},
		peers: Default::default(),
		routes: Default::default(),
		verbose: false,
	};

	write_config(path, &config)?;
	println!("Wrote {}", path.display());
	println!("Peer id: {id}");
	println!("Share this id (see `hyprspace id`) with peers you want to add you.");
	Ok(())
}

fn add(path: &Path, ip: Ipv4Addr, id: String) -> Result<()> {
	let mut config = Config::read(path).with_context(|| format!("reading {}", path.display()))?;
	let peer_id: PeerId = id
		.parse()
		.with_context(|| format!("\"{id}\" is not a valid peer id"))?;

	config.peers.insert(ip, PeerEntry { id: peer_id });
	config
		.validate()
		.context("adding this peer would violate a config invariant")?;

	write_config(path, &config)?;
	println!("Added peer {ip} ({peer_id})");
	Ok(())
}

fn write_config(path: &Path, config: &Config) -> Result<()> {
	let yaml = serde_yaml::to_string(config).context("serializing config")?;
	std::fs::write(path, yaml).with_context(|| format!("writing {}", path.display()))?;
	Ok(())
}

async fn up(config_path: PathBuf, run_dir: PathBuf, verbose: bool, foreground: bool) -> Result<()> {
	if !foreground {
		return spawn_daemon(&config_path, &run_dir, verbose);
	}

	let config = Config::read(&config_path)
		.with_context(|| format!("reading {}", config_path.display()))?;
	let name = config.interface.name.clone();

	tracing::info!(interface = %name, "bringing interface up");
	let interface = Interface::up(config, run_dir).await?;

	wait_for_shutdown_signal().await;
	tracing::info!(interface = %name, "shutting down");
	interface.shutdown().await;
	Ok(())
}

/// Re-execs this binary in the background with `--foreground`, the way
/// `apps/cli/src/main.rs`'s `Commands::Start` launches its daemon
/// process (stdout/stderr redirected to null, detached via `spawn`).
fn spawn_daemon(config_path: &Path, run_dir: &Path, verbose: bool) -> Result<()> {
	let current_exe = std::env::current_exe().context("resolving current executable")?;

	let mut command = std::process::Command::new(current_exe);
	command
		.arg("--config")
		.arg(config_path)
		.arg("--run-dir")
		.arg(run_dir);
	if verbose {
		command.arg("--verbose");
	}
	command.arg("up").arg("--foreground");
	command.stdout(std::process::Stdio::null());
	command.stderr(std::process::Stdio::null());

	let child = command.spawn().context("spawning supervising daemon")?;
	println!("hyprspace started in the background (pid {})", child.id());
	Ok(())
}

async fn wait_for_shutdown_signal() {
	let ctrl_c = async {
		tokio::signal::ctrl_c()
			.await
			.expect("failed to install ctrl-c handler");
	};

	#[cfg(unix)]
	let terminate = async {
		tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
			.expect("failed to install SIGTERM handler")
			.recv()
			.await;
	};
	#[cfg(not(unix))]
	let terminate = std::future::pending::<()>();

	tokio::select! {
		_ = ctrl_c => {},
		_ = terminate => {},
	}
}

fn down(config_path: &Path, run_dir: &Path) -> Result<()> {
	let config = Config::read(config_path)
		.with_context(|| format!("reading {}", config_path.display()))?;
	let lock_path = run_dir.join(format!("{}.lock", config.interface.name));

	let pid_raw = std::fs::read_to_string(&lock_path)
		.with_context(|| format!("{} not found — is the interface up?", lock_path.display()))?;
	let pid: i32 = pid_raw
		.trim()
		.parse()
		.with_context(|| format!("{} does not contain a valid pid", lock_path.display()))?;

	send_sigterm(pid)?;
	println!("Sent shutdown signal to pid {pid}");
	Ok(())
}

#[cfg(unix)]
fn send_sigterm(pid: i32) -> Result<()> {
	use nix::sys::signal::{kill, Signal};
	use nix::unistd::Pid;

	kill(Pid::from_raw(pid), Signal::SIGTERM).context("sending SIGTERM")?;
	Ok(())
}

#[cfg(not(unix))]
fn send_sigterm(_pid: i32) -> Result<()> {
	bail!("`down` requires signalling a running process, which is only supported on unix")
}

fn peers(config_path: &Path, run_dir: &Path) -> Result<()> {
	let config = Config::read(config_path)
		.with_context(|| format!("reading {}", config_path.display()))?;
	let state_path = run_dir.join(format!("{}.state", config.interface.name));

	let state: InterfaceState = std::fs::read_to_string(&state_path)
		.ok()
		.and_then(|raw| serde_yaml::from_str(&raw).ok())
		.unwrap_or_default();

	if config.peers.is_empty() {
		println!("No peers configured");
		return Ok(());
	}

	let mut ips: Vec<&Ipv4Addr> = config.peers.keys().collect();
	ips.sort();
	for ip in ips {
		let entry = &config.peers[ip];
		let connected = state.peers.get(ip).copied().unwrap_or(false);
		let status = if connected { "connected" } else { "disconnected" };
		println!("{ip}  {}  {status}", entry.id);
	}
	Ok(())
}

fn id(config_path: &Path, yaml: bool, cmd: bool) -> Result<()> {
	let config = Config::read(config_path)
		.with_context(|| format!("reading {}", config_path.display()))?;
	let own_ip = config.interface.address.address;
	let own_id = config.interface.id;

	if yaml {
		println!("{own_ip}:\n  id: {own_id}");
	} else if cmd {
		println!("hyprspace add {own_ip} {own_id}");
	} else {
		println!("{own_id}");
	}
	Ok(())
}

fn update() -> Result<()> {
	println!("hyprspace {}", env!("CARGO_PKG_VERSION"));
	println!("No update channel is configured for this build.");
	Ok(())
}

fn keygen() -> Result<()> {
	let private_key = PrivateKey::generate();
	println!("id: {}", private_key.peer_id());
	println!(
		"private_key: {}",
		serde_json::to_value(&private_key)
			.expect("PrivateKey always serializes")
			.as_str()
			.expect("PrivateKey serializes to a string")
	);
	Ok(())
}
