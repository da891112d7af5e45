//! Wire Protocol
//!
//! Tagged message variants for the full-duplex client transport. Unknown
//! kinds and malformed payloads are rejected at the parse boundary with an
//! `error` frame; no untyped payload crosses into the engine.

use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::str::FromStr;
use uuid::Uuid;

use crate::models::{AuctionSnapshot, BidSummary, NotificationKind};

/// Client -> server messages
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase", rename_all_fields = "camelCase")]
pub enum ClientMessage {
    JoinAuction {
        auction_id: Uuid,
    },
    PlaceBid {
        auction_id: Uuid,
        amount: AmountInput,
    },
    GetBidHistory {
        auction_id: Uuid,
    },
}

/// Bid amount as received on the wire: JSON number or string.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum AmountInput {
    Number(serde_json::Number),
    Text(String),
}

impl AmountInput {
    /// Coerce to a decimal. Rejects anything non-finite or non-numeric.
    pub fn to_decimal(&self) -> Option<Decimal> {
        let text = match self {
            Self::Number(n) => n.to_string(),
            Self::Text(s) => s.trim().to_string(),
        };
        Decimal::from_str(&text)
            .or_else(|_| Decimal::from_scientific(&text))
            .ok()
    }
}

/// Server -> client messages
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase", rename_all_fields = "camelCase")]
pub enum ServerMessage {
    Connected {
        user_id: Uuid,
        username: String,
    },
    JoinedAuction {
        auction_id: Uuid,
        snapshot: AuctionSnapshot,
    },
    CurrentHighestBid {
        auction_id: Uuid,
        amount: Decimal,
        user_id: Option<Uuid>,
        username: Option<String>,
        timestamp: Option<i64>,
    },
    NewBid {
        #[serde(flatten)]
        bid: BidSummary,
    },
    BidPlaced {
        bid_id: Uuid,
        amount: Decimal,
    },
    BidError {
        code: BidErrorCode,
        message: String,
    },
    BidHistory {
        auction_id: Uuid,
        bids: Vec<BidSummary>,
    },
    AuctionEnded {
        auction_id: Uuid,
        winner_id: Option<Uuid>,
        winning_amount: Option<Decimal>,
    },
    UserNotification {
        kind: NotificationKind,
        payload: serde_json::Value,
    },
    Error {
        message: String,
    },
}

/// Rejection codes surfaced on `bidError`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum BidErrorCode {
    RateLimitExceeded,
    InvalidAmount,
    BidValidationError,
}

impl AuctionSnapshot {
    /// The `currentHighestBid` frame sent as a snapshot reply.
    pub fn highest_message(&self) -> ServerMessage {
        ServerMessage::CurrentHighestBid {
            auction_id: self.auction_id,
            amount: self.current_highest_bid,
            user_id: self.highest_bidder.as_ref().map(|b| b.user_id),
            username: self.highest_bidder.as_ref().map(|b| b.username.clone()),
            timestamp: self.highest_bidder.as_ref().map(|b| b.timestamp),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    #[test]
    fn place_bid_accepts_number_and_string_amounts() {
        let auction_id = Uuid::new_v4();

        let from_number: ClientMessage = serde_json::from_str(&format!(
            r#"{{"type":"placeBid","auctionId":"{auction_id}","amount":150.5}}"#
        ))
        .unwrap();
        let ClientMessage::PlaceBid { amount, .. } = from_number else {
            panic!("wrong variant");
        };
        assert_eq!(amount.to_decimal(), Some(dec!(150.5)));

        let from_text: ClientMessage = serde_json::from_str(&format!(
            r#"{{"type":"placeBid","auctionId":"{auction_id}","amount":"200"}}"#
        ))
        .unwrap();
        let ClientMessage::PlaceBid { amount, .. } = from_text else {
            panic!("wrong variant");
        };
        assert_eq!(amount.to_decimal(), Some(dec!(200)));
    }

    #[test]
    fn junk_amounts_do_not_coerce() {
        for junk in ["", "abc", "1.2.3", "NaN", "Infinity"] {
            assert_eq!(
                AmountInput::Text(junk.to_string()).to_decimal(),
                None,
                "{junk:?} should not parse"
            );
        }
    }

    #[test]
    fn unknown_kinds_fail_to_parse() {
        let result: Result<ClientMessage, _> =
            serde_json::from_str(r#"{"type":"adminDropTables"}"#);
        assert!(result.is_err());
    }

    #[test]
    fn new_bid_flattens_to_the_wire_shape() {
        let msg = ServerMessage::NewBid {
            bid: BidSummary {
                bid_id: Uuid::new_v4(),
                auction_id: Uuid::new_v4(),
                user_id: Uuid::new_v4(),
                username: "u7".to_string(),
                amount: dec!(400),
                timestamp: 1_700_000_000_000,
            },
        };

        let json: serde_json::Value = serde_json::to_value(&msg).unwrap();
        assert_eq!(json["type"], "newBid");
        assert!(json["bidId"].is_string());
        assert!(json["auctionId"].is_string());
        assert_eq!(json["username"], "u7");
    }

    #[test]
    fn bid_error_codes_use_wire_names() {
        let json = serde_json::to_string(&BidErrorCode::RateLimitExceeded).unwrap();
        assert_eq!(json, "\"RATE_LIMIT_EXCEEDED\"");
    }
}
