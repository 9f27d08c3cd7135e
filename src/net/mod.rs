//! Networking stack: identity, framing, per-peer session state, the peer
//! registry built from configuration, the libp2p substrate adapter, the
//! discovery loop that keeps sessions populated, and the forwarding
//! engine that moves packets between the TUN device and active sessions.

pub mod codec;
pub mod discovery;
pub mod forwarding;
pub mod identity;
pub mod registry;
pub mod session;
pub mod substrate;

pub use identity::{PeerId, PrivateKey};
pub use registry::{PeerRecord, PeerRegistry, RegistryError};
pub use session::{Session, State as SessionState};
