//! Network Layer
//!
//! WebSocket presentation server. One engine per authenticated seat; all
//! round rules live in `round/` and `engine/`.

pub mod auth;
pub mod protocol;
pub mod server;

pub use auth::{authenticate, validate_token, AuthConfig, AuthError, TokenClaims};
pub use protocol::{ClientMessage, ErrorCode, ServerError, ServerMessage};
pub use server::{CrashSourceFactory, GameServer, GameServerError, ServerConfig};
