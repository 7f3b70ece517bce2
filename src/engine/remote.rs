//! REST Ledger Client
//!
//! Balance, bet record, and history services backed by the HTTP ledger:
//!
//! - `GET  {base}/users`         list users, balance looked up by account id
//! - `PUT  {base}/users`         `{condition: {id}, data: {balance}}`
//! - `POST {base}/bets`          one bet record
//! - `POST {base}/game_history`  one crashed round
//!
//! The ledger has no atomic increment, so `adjust_balance` is a read followed
//! by a write. The round engine serializes its own calls; concurrent writers
//! outside the engine can still race.

use std::time::Duration;

use async_trait::async_trait;
use reqwest::{Client, StatusCode};
use serde::{Serialize, Deserialize};
use serde_json::Value;
use tracing::debug;

use crate::engine::services::{
    BalanceService, BetRecord, BetRecordService, HistoryRecord, HistoryService, ServiceError,
};
use crate::round::state::Account;

impl From<reqwest::Error> for ServiceError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_timeout() {
            ServiceError::Transport(format!("request timed out: {err}"))
        } else {
            ServiceError::Transport(err.to_string())
        }
    }
}

#[derive(Debug, Deserialize)]
struct RemoteUser {
    id: Value,
    #[serde(default)]
    balance: Value,
}

#[derive(Debug, Serialize)]
struct BalanceUpdate<'a> {
    condition: UserCondition<'a>,
    data: BalanceData,
}

#[derive(Debug, Serialize)]
struct UserCondition<'a> {
    id: &'a str,
}

impl<'a> BalanceUpdate<'a> {
    fn for_account(account: &'a Account, balance: u64) -> Self {
        Self {
            condition: UserCondition { id: &account.user_id },
            data: BalanceData { balance },
        }
    }
}

#[derive(Debug, Serialize)]
struct BalanceData {
    balance: u64,
}

/// HTTP client for the REST ledger.
#[derive(Clone, Debug)]
pub struct RemoteLedger {
    client: Client,
    base_url: String,
}

impl RemoteLedger {
    /// Create a client. `timeout` bounds every request.
    pub fn new(base_url: impl Into<String>, timeout: Duration) -> Result<Self, ServiceError> {
        let client = Client::builder().timeout(timeout).build()?;
        let base_url: String = base_url.into();
        let base_url = base_url.trim_end_matches('/').to_string();
        Ok(Self { client, base_url })
    }

    /// Base URL without a trailing slash.
    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    fn endpoint(&self, path: &str) -> String {
        format!("{}/{}", self.base_url, path)
    }

    async fn post_json<T: Serialize + ?Sized>(&self, path: &str, body: &T) -> Result<(), ServiceError> {
        let response = self.client.post(self.endpoint(path)).json(body).send().await?;
        check_status(response.status())
    }
}

fn check_status(status: StatusCode) -> Result<(), ServiceError> {
    if status.is_success() {
        Ok(())
    } else {
        Err(ServiceError::Rejected(format!("ledger returned {status}")))
    }
}

/// Ledger ids and balances may arrive as numbers or strings.
fn value_as_string(value: &Value) -> Option<String> {
    match value {
        Value::String(s) => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        _ => None,
    }
}

fn parse_balance(value: &Value) -> Option<u64> {
    match value {
        Value::Number(n) => n
            .as_u64()
            .or_else(|| n.as_f64().filter(|f| f.is_finite() && *f >= 0.0).map(|f| f.floor() as u64)),
        Value::String(s) => s.trim().parse::<u64>().ok(),
        Value::Null => Some(0),
        _ => None,
    }
}

/// Find a user's balance in a `GET /users` payload.
///
/// The payload is either a bare array or an object with a `data` array.
fn find_balance(payload: &Value, user_id: &str) -> Result<u64, ServiceError> {
    let users = match payload {
        Value::Array(users) => users.as_slice(),
        Value::Object(map) => map
            .get("data")
            .and_then(Value::as_array)
            .map(Vec::as_slice)
            .unwrap_or(&[]),
        _ => &[],
    };

    let user = users
        .iter()
        .filter_map(|raw| serde_json::from_value::<RemoteUser>(raw.clone()).ok())
        .find(|user| value_as_string(&user.id).as_deref() == Some(user_id))
        .ok_or_else(|| ServiceError::UnknownPlayer(user_id.to_string()))?;

    parse_balance(&user.balance)
        .ok_or_else(|| ServiceError::Transport(format!("unreadable balance for {user_id}")))
}

#[async_trait]
impl BalanceService for RemoteLedger {
    async fn read_balance(&self, account: &Account) -> Result<u64, ServiceError> {
        let response = self.client.get(self.endpoint("users")).send().await?;
        check_status(response.status())?;
        let payload: Value = response.json().await?;
        find_balance(&payload, &account.user_id)
    }

    async fn adjust_balance(&self, account: &Account, delta: i64) -> Result<u64, ServiceError> {
        let balance = self.read_balance(account).await?;
        let updated = if delta >= 0 {
            balance.saturating_add(delta.unsigned_abs())
        } else {
            balance
                .checked_sub(delta.unsigned_abs())
                .ok_or(ServiceError::InsufficientFunds { balance })?
        };

        let body = BalanceUpdate::for_account(account, updated);
        let response = self.client.put(self.endpoint("users")).json(&body).send().await?;
        check_status(response.status())?;

        debug!(player = %account.player_id.short(), delta, balance = updated, "Balance updated");
        Ok(updated)
    }
}

#[async_trait]
impl BetRecordService for RemoteLedger {
    async fn write_bet(&self, record: BetRecord) -> Result<(), ServiceError> {
        self.post_json("bets", &record).await
    }
}

#[async_trait]
impl HistoryService for RemoteLedger {
    async fn write_history(&self, record: HistoryRecord) -> Result<(), ServiceError> {
        self.post_json("game_history", &record).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    const USER: &str = "67e55044-10b1-426f-9247-bb680e5fe0c8";

    #[test]
    fn test_find_balance_in_wrapped_payload() {
        let payload = json!({
            "data": [
                { "id": "someone-else", "balance": 5 },
                { "id": USER, "balance": 100000 }
            ]
        });
        assert_eq!(find_balance(&payload, USER).unwrap(), 100_000);
    }

    #[test]
    fn test_find_balance_accepts_string_balance() {
        let payload = json!([{ "id": USER, "balance": "2500" }]);
        assert_eq!(find_balance(&payload, USER).unwrap(), 2_500);
    }

    #[test]
    fn test_find_balance_by_numeric_ledger_id() {
        let account = Account::new("1718031234567");
        let payload = json!([{ "id": 1718031234567u64, "balance": 700 }]);
        assert_eq!(find_balance(&payload, &account.user_id).unwrap(), 700);
    }

    #[test]
    fn test_find_balance_unknown_user() {
        let payload = json!({ "data": [] });
        assert!(matches!(
            find_balance(&payload, USER),
            Err(ServiceError::UnknownPlayer(_))
        ));
    }

    #[test]
    fn test_balance_update_body() {
        let account = Account::new(USER);
        let body = BalanceUpdate::for_account(&account, 42);
        assert_eq!(
            serde_json::to_value(&body).unwrap(),
            json!({ "condition": { "id": USER }, "data": { "balance": 42 } })
        );
    }

    #[test]
    fn test_endpoint_trims_trailing_slash() {
        let ledger = RemoteLedger::new("http://ledger.local/api/", Duration::from_secs(1)).unwrap();
        assert_eq!(ledger.base_url(), "http://ledger.local/api");
        assert_eq!(ledger.endpoint("bets"), "http://ledger.local/api/bets");
    }

    #[test]
    fn test_non_success_status_rejected() {
        assert!(check_status(StatusCode::OK).is_ok());
        assert!(matches!(
            check_status(StatusCode::INTERNAL_SERVER_ERROR),
            Err(ServiceError::Rejected(_))
        ));
    }
}
