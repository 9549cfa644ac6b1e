//! Wire protocol: one JSON object per line, each `{event, data}`.
//!
//! Payloads are strictly typed; amounts and multipliers must arrive as
//! numbers with at most two fractional digits, never as strings.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

use crate::engine::CycleSnapshot;
use crate::money::{Amount, Multiplier};
use crate::store::CycleState;

/// First client frame: `{"auth": {"token": "..."}}`.
#[derive(Debug, Deserialize)]
pub struct Handshake {
    pub auth: HandshakeAuth,
}

#[derive(Debug, Deserialize)]
pub struct HandshakeAuth {
    pub token: String,
}

/// Request envelope; `data` is parsed per event so a malformed payload can
/// still be acknowledged.
#[derive(Debug, Deserialize)]
pub struct ClientEnvelope {
    pub event: String,
    #[serde(default)]
    pub data: Value,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PlaceBetData {
    pub amount: Amount,
    #[serde(default)]
    pub auto_cashout_multiplier: Option<Multiplier>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CashOutData {
    pub bet_id: Uuid,
    #[serde(default)]
    pub token: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(tag = "event", content = "data", rename_all = "camelCase")]
pub enum ServerEvent {
    #[serde(rename_all = "camelCase")]
    AuthOk { user_id: Uuid },
    AuthFailed { error: &'static str },
    #[serde(rename_all = "camelCase")]
    GameState {
        cycle_id: Uuid,
        state: CycleState,
        multiplier: Multiplier,
        #[serde(skip_serializing_if = "Option::is_none")]
        crash_point: Option<Multiplier>,
        #[serde(skip_serializing_if = "Option::is_none")]
        countdown: Option<u64>,
    },
    #[serde(rename_all = "camelCase")]
    PlaceBetAck {
        success: bool,
        #[serde(skip_serializing_if = "Option::is_none")]
        bet_id: Option<Uuid>,
        #[serde(skip_serializing_if = "Option::is_none")]
        error: Option<&'static str>,
    },
    #[serde(rename_all = "camelCase")]
    CashOutAck {
        success: bool,
        #[serde(skip_serializing_if = "Option::is_none")]
        payout: Option<Amount>,
        #[serde(skip_serializing_if = "Option::is_none")]
        new_balance: Option<Amount>,
        #[serde(skip_serializing_if = "Option::is_none")]
        error: Option<&'static str>,
    },
    /// Broadcast; deliberately anonymised.
    #[serde(rename_all = "camelCase")]
    BetPlaced {
        amount: Amount,
        #[serde(skip_serializing_if = "Option::is_none")]
        auto_cashout_multiplier: Option<Multiplier>,
    },
    /// Broadcast; deliberately anonymised.
    BetCashedOut { multiplier: Multiplier },
    #[serde(rename_all = "camelCase")]
    ActivateCashout {
        bet_id: Uuid,
        #[serde(skip_serializing_if = "Option::is_none")]
        token: Option<String>,
    },
    #[serde(rename_all = "camelCase")]
    CashoutSuccess {
        bet_id: Uuid,
        payout: Amount,
        multiplier: Multiplier,
        new_balance: Amount,
    },
    #[serde(rename_all = "camelCase")]
    CashoutError { bet_id: Uuid, error: &'static str },
    #[serde(rename_all = "camelCase")]
    WalletUpdate {
        balance: Amount,
        currency: String,
        cause: &'static str,
        #[serde(skip_serializing_if = "Option::is_none")]
        correlation_id: Option<Uuid>,
    },
    #[serde(rename_all = "camelCase")]
    BetLost { bet_id: Uuid },
    #[serde(rename_all = "camelCase")]
    CycleVoided { cycle_id: Uuid },
    SystemError { error: &'static str },
}

/// The broadcast rendering of an engine snapshot. None until the first
/// cycle opens.
pub fn game_state(snapshot: &CycleSnapshot) -> Option<ServerEvent> {
    let cycle_id = snapshot.cycle_id?;
    Some(ServerEvent::GameState {
        cycle_id,
        state: snapshot.state,
        multiplier: snapshot.multiplier,
        crash_point: snapshot.crash_point,
        countdown: snapshot.countdown_ms,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn client_payloads_parse_strictly() {
        let env: ClientEnvelope =
            serde_json::from_str(r#"{"event":"placeBet","data":{"amount":100,"autoCashoutMultiplier":2.5}}"#)
                .unwrap();
        assert_eq!(env.event, "placeBet");
        let data: PlaceBetData = serde_json::from_value(env.data).unwrap();
        assert_eq!(data.amount.cents(), 10_000);
        assert_eq!(data.auto_cashout_multiplier.unwrap().hundredths(), 250);

        // Strings are rejected, not coerced.
        let env: ClientEnvelope =
            serde_json::from_str(r#"{"event":"placeBet","data":{"amount":"100"}}"#).unwrap();
        assert!(serde_json::from_value::<PlaceBetData>(env.data).is_err());

        // More than two fractional digits is rejected.
        let env: ClientEnvelope =
            serde_json::from_str(r#"{"event":"placeBet","data":{"amount":10.001}}"#).unwrap();
        assert!(serde_json::from_value::<PlaceBetData>(env.data).is_err());
    }

    #[test]
    fn server_events_use_camel_case_names() {
        let event = ServerEvent::CashoutSuccess {
            bet_id: Uuid::nil(),
            payout: Amount::from_cents(20_000),
            multiplier: Multiplier::from_hundredths(200),
            new_balance: Amount::from_cents(110_000),
        };
        let json: Value = serde_json::to_value(&event).unwrap();
        assert_eq!(json["event"], "cashoutSuccess");
        assert_eq!(json["data"]["payout"], 200.0);
        assert_eq!(json["data"]["newBalance"], 1100.0);
        assert_eq!(json["data"]["multiplier"], 2.0);
    }

    #[test]
    fn broadcast_bet_events_stay_anonymous() {
        let event = ServerEvent::BetPlaced {
            amount: Amount::from_cents(5_000),
            auto_cashout_multiplier: None,
        };
        let json: Value = serde_json::to_value(&event).unwrap();
        assert_eq!(json["event"], "betPlaced");
        assert!(json["data"].get("userId").is_none());
        assert!(json["data"].get("autoCashoutMultiplier").is_none());
    }

    #[test]
    fn game_state_carries_phase_fields() {
        use crate::engine::CycleSnapshot;
        let snapshot = CycleSnapshot {
            cycle_id: Some(Uuid::nil()),
            state: CycleState::Flying,
            multiplier: Multiplier::from_hundredths(137),
            crash_point: None,
            countdown_ms: None,
        };
        let json: Value = serde_json::to_value(game_state(&snapshot).unwrap()).unwrap();
        assert_eq!(json["event"], "gameState");
        assert_eq!(json["data"]["state"], "flying");
        assert_eq!(json["data"]["multiplier"], 1.37);
        assert!(json["data"].get("crashPoint").is_none());

        // Before the first cycle opens there is nothing to broadcast.
        assert!(game_state(&CycleSnapshot::default()).is_none());
    }
}
