//! Network Layer
//!
//! WebSocket transport. Handlers call into the round engine and never touch
//! phase or crash point themselves.

pub mod auth;
pub mod protocol;
pub mod server;

pub use auth::{AuthConfig, TokenClaims, AuthError, validate_token};
pub use protocol::{ClientMessage, ServerMessage, ErrorCode, BinaryCommand};
pub use server::{GameServer, ServerConfig, GameServerError, Dispatcher};
