//! Signaling and relay core for a multi-user screen-sharing service.
//!
//! Browser peers connect over a WebSocket (`/stream`), create or join named
//! rooms, and exchange session descriptions and ICE candidates through
//! directed host→client sessions. When direct connectivity fails, sessions
//! in TURN mode receive short-lived credentials for the embedded relay.
//!
//! All room state is owned by a single hub task ([`hub::Hub`]); connections
//! talk to it through one shared event channel and per-user outbound queues.

pub mod auth;
pub mod client;
pub mod config;
pub mod hub;
pub mod id;
pub mod ip;
pub mod names;
pub mod protocol;
pub mod relay;
pub mod room;
pub mod server;

pub use auth::{AuthLookup, Users};
pub use config::{AuthMode, Config};
pub use id::Id;
pub use ip::{IpProvider, StaticProvider};
pub use relay::{InternalServer, TurnAuth};
pub use server::run_server;

/// Error type used throughout; handler errors end up as close reasons on the
/// offending connection.
pub type BoxError = Box<dyn std::error::Error + Send + Sync>;
