//! Wire protocol: message types, framing, RPC correlation, and the responder
//!
//! The engine talks to peers through message-oriented RPC over any reliable
//! byte stream. `messages` defines the bodies, `framing` the length-prefixed
//! encoding, `rpc` the correlation/retry layer, and `server` the handler
//! answering a peer's requests.

pub mod framing;
pub mod messages;
pub mod rpc;
pub mod server;

pub use framing::{Envelope, FrameKind, MAX_FRAME_BYTES};
pub use messages::SyncMessage;
pub use rpc::{spawn_connection, PeerHandle, RequestHandler};
pub use server::EngineHandler;

// vim: ts=4
