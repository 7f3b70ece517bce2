//! Protocol Messages
//!
//! JSON wire format for the WebSocket seat connection. Every message is an
//! object with a `type` tag.

use serde::{Serialize, Deserialize};

use crate::engine::snapshot::RoundSnapshot;
use crate::network::auth::AuthError;
use crate::round::ledger::{BetRejection, ErrorKind};
use crate::round::state::Bet;

// =============================================================================
// CLIENT -> SERVER MESSAGES
// =============================================================================

/// Messages sent from client to server.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClientMessage {
    /// Authenticate and open a seat.
    Auth(AuthRequest),

    /// Bet on the counting-down round.
    PlaceBet(PlaceBetRequest),

    /// Cash out the active bet.
    CashOut,

    /// Ask for the current snapshot.
    SyncRequest,

    /// Latency probe.
    Ping {
        /// Client clock, echoed back.
        timestamp: u64,
    },

    /// Close the seat.
    Leave,
}

/// Authentication request.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuthRequest {
    /// JWT from the auth provider. Required when the server has a key.
    #[serde(default)]
    pub token: Option<String>,
    /// Ledger account id, honoured only in development mode.
    #[serde(default)]
    pub player_id: Option<String>,
    /// Client version.
    #[serde(default)]
    pub client_version: Option<String>,
}

/// Bet placement request.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PlaceBetRequest {
    /// Stake in currency units.
    pub amount: u64,
    /// Optional auto-cashout threshold, above 1.00.
    #[serde(default)]
    pub auto_cashout: Option<f64>,
}

// =============================================================================
// SERVER -> CLIENT MESSAGES
// =============================================================================

/// Messages sent from server to client.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServerMessage {
    /// Authentication outcome.
    AuthResult(AuthResult),

    /// Engine state, pushed on every change and on request.
    Snapshot(RoundSnapshot),

    /// Bet accepted.
    BetPlaced {
        /// The recorded bet.
        bet: Bet,
    },

    /// Bet cashed out.
    CashedOut {
        /// The settled bet.
        bet: Bet,
    },

    /// Pong response.
    Pong {
        /// Echoed client timestamp.
        timestamp: u64,
        /// Server clock, Unix millis.
        server_time: u64,
    },

    /// Request failed.
    Error(ServerError),

    /// Server is shutting down.
    Shutdown {
        /// Why.
        reason: String,
    },
}

/// Authentication result.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuthResult {
    /// Whether the seat opened.
    pub success: bool,
    /// Ledger account id on success.
    pub player_id: Option<String>,
    /// Failure reason.
    pub error: Option<String>,
    /// Server version.
    pub server_version: String,
}

/// Error payload.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerError {
    /// Machine-readable code.
    pub code: ErrorCode,
    /// Human-readable message.
    pub message: String,
}

/// Error codes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorCode {
    /// Authentication failed.
    AuthFailed,
    /// Request needs an authenticated seat.
    NotAuthenticated,
    /// JWT expired.
    TokenExpired,
    /// JWT invalid.
    InvalidToken,
    /// Unparseable message.
    InvalidInput,
    /// Bad amount or threshold.
    Validation,
    /// Stake exceeds balance.
    InsufficientBalance,
    /// Request does not fit the round or bet state.
    StateConflict,
    /// Ledger or record service failed.
    Upstream,
    /// Connection limit reached.
    ServerOverloaded,
    /// Internal error.
    InternalError,
}

impl From<ErrorKind> for ErrorCode {
    fn from(kind: ErrorKind) -> Self {
        match kind {
            ErrorKind::Validation => ErrorCode::Validation,
            ErrorKind::InsufficientBalance => ErrorCode::InsufficientBalance,
            ErrorKind::StateConflict => ErrorCode::StateConflict,
            ErrorKind::Upstream => ErrorCode::Upstream,
        }
    }
}

impl ServerError {
    /// Build from a code and message.
    pub fn new(code: ErrorCode, message: impl Into<String>) -> Self {
        Self { code, message: message.into() }
    }
}

impl From<&BetRejection> for ServerError {
    fn from(rejection: &BetRejection) -> Self {
        Self::new(rejection.kind().into(), rejection.to_string())
    }
}

impl From<&AuthError> for ServerError {
    fn from(err: &AuthError) -> Self {
        let code = match err {
            AuthError::Expired => ErrorCode::TokenExpired,
            AuthError::InvalidSignature
            | AuthError::InvalidFormat
            | AuthError::InvalidIssuer
            | AuthError::InvalidAudience
            | AuthError::DecodeError(_) => ErrorCode::InvalidToken,
            AuthError::NotConfigured
            | AuthError::MissingClaim(_)
            | AuthError::InvalidPlayerId(_) => ErrorCode::AuthFailed,
        };
        Self::new(code, err.to_string())
    }
}

// =============================================================================
// SERIALIZATION HELPERS
// =============================================================================

impl ClientMessage {
    /// Serialize to JSON string.
    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }

    /// Deserialize from JSON string.
    pub fn from_json(s: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(s)
    }
}

impl ServerMessage {
    /// Serialize to JSON string.
    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }

    /// Deserialize from JSON string.
    pub fn from_json(s: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(s)
    }

    /// Error message for a rejected bet or cashout.
    pub fn rejection(rejection: &BetRejection) -> Self {
        ServerMessage::Error(rejection.into())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::round::state::Round;

    #[test]
    fn test_place_bet_wire_format() {
        let msg = ClientMessage::from_json(
            r#"{"type":"place_bet","amount":10000,"auto_cashout":2.0}"#,
        )
        .unwrap();
        match msg {
            ClientMessage::PlaceBet(req) => {
                assert_eq!(req.amount, 10_000);
                assert_eq!(req.auto_cashout, Some(2.0));
            }
            other => panic!("wrong message: {:?}", other),
        }

        let msg = ClientMessage::from_json(r#"{"type":"place_bet","amount":5000}"#).unwrap();
        assert!(matches!(msg, ClientMessage::PlaceBet(PlaceBetRequest { auto_cashout: None, .. })));
    }

    #[test]
    fn test_unit_client_messages() {
        assert!(matches!(
            ClientMessage::from_json(r#"{"type":"cash_out"}"#).unwrap(),
            ClientMessage::CashOut
        ));
        assert!(matches!(
            ClientMessage::from_json(r#"{"type":"sync_request"}"#).unwrap(),
            ClientMessage::SyncRequest
        ));
        assert!(matches!(
            ClientMessage::from_json(r#"{"type":"ping","timestamp":42}"#).unwrap(),
            ClientMessage::Ping { timestamp: 42 }
        ));
        assert!(ClientMessage::from_json(r#"{"type":"fly_to_moon"}"#).is_err());
    }

    #[test]
    fn test_auth_request_fields_optional() {
        let msg = ClientMessage::from_json(r#"{"type":"auth","token":"a.b.c"}"#).unwrap();
        match msg {
            ClientMessage::Auth(req) => {
                assert_eq!(req.token.as_deref(), Some("a.b.c"));
                assert!(req.player_id.is_none());
            }
            other => panic!("wrong message: {:?}", other),
        }
    }

    #[test]
    fn test_snapshot_message_is_flat() {
        let round = Round::countdown(10, tokio::time::Instant::now());
        let msg = ServerMessage::Snapshot(RoundSnapshot::capture(&round, 1.0, None));
        let json: serde_json::Value = serde_json::from_str(&msg.to_json().unwrap()).unwrap();
        assert_eq!(json["type"], "snapshot");
        assert_eq!(json["status"], "countdown");
        assert_eq!(json["multiplier"], 1.0);
    }

    #[test]
    fn test_rejection_error_codes() {
        let msg = ServerMessage::rejection(&BetRejection::InsufficientBalance {
            amount: 150_000,
            balance: 100_000,
        });
        let json = msg.to_json().unwrap();
        assert!(json.contains("\"code\":\"insufficient_balance\""));

        let err: ServerError = (&BetRejection::DuplicateBet).into();
        assert_eq!(err.code, ErrorCode::StateConflict);

        let err: ServerError = (&BetRejection::BelowMinimum { amount: 1, minimum: 1_000 }).into();
        assert_eq!(err.code, ErrorCode::Validation);

        let err: ServerError = (&BetRejection::Upstream("timeout".into())).into();
        assert_eq!(err.code, ErrorCode::Upstream);
    }

    #[test]
    fn test_auth_error_codes() {
        let err: ServerError = (&AuthError::Expired).into();
        assert_eq!(err.code, ErrorCode::TokenExpired);
        let err: ServerError = (&AuthError::InvalidSignature).into();
        assert_eq!(err.code, ErrorCode::InvalidToken);
    }
}
