//! Market-data feed: wire format, control envelopes, authentication and the
//! connection lifecycle.

pub mod auth;
pub mod connection;
pub mod envelope;
pub mod session;
pub mod wire;

pub use auth::{AuthError, AuthProvider, ClientCredentialsAuth, StaticToken};
pub use connection::{ConnectionConfig, ConnectionManager, FrameHandler, FrameOutcome, TransportError};
pub use session::{ConnectionState, SessionConfig};
pub use wire::{decode, DecodeError, Tick, FRAME_LEN};
