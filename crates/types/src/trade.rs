use serde::{Deserialize, Serialize};

/// Trade operations accepted by the TRADE action's `actionType` field. The
/// wire strings are the terminal's own request constants.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TradeAction {
    #[serde(rename = "ORDER_TYPE_BUY")]
    Buy,
    #[serde(rename = "ORDER_TYPE_SELL")]
    Sell,
    #[serde(rename = "ORDER_TYPE_BUY_LIMIT")]
    BuyLimit,
    #[serde(rename = "ORDER_TYPE_SELL_LIMIT")]
    SellLimit,
    #[serde(rename = "POSITION_MODIFY")]
    PositionModify,
    #[serde(rename = "POSITION_CLOSE_ID")]
    PositionCloseId,
    #[serde(rename = "ORDER_CANCEL")]
    OrderCancel,
}

impl TradeAction {
    pub fn parse(s: &str) -> anyhow::Result<Self> {
        serde_json::from_value(serde_json::Value::String(s.to_string()))
            .map_err(|_| anyhow::anyhow!("unknown trade action: {s}"))
    }

    pub fn is_market_entry(&self) -> bool {
        matches!(self, TradeAction::Buy | TradeAction::Sell)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            TradeAction::Buy => "ORDER_TYPE_BUY",
            TradeAction::Sell => "ORDER_TYPE_SELL",
            TradeAction::BuyLimit => "ORDER_TYPE_BUY_LIMIT",
            TradeAction::SellLimit => "ORDER_TYPE_SELL_LIMIT",
            TradeAction::PositionModify => "POSITION_MODIFY",
            TradeAction::PositionCloseId => "POSITION_CLOSE_ID",
            TradeAction::OrderCancel => "ORDER_CANCEL",
        }
    }
}

/// A validated order submission handed to the terminal.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TradeRequest {
    pub action_type: TradeAction,
    pub symbol: String,
    pub volume: f64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub price: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub stoploss: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub takeprofit: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub deviation: Option<u32>,
    /// Position or order ticket for modify/close/cancel operations.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub id: Option<u64>,
}

/// Terminal execution return codes (the subset the bridge reports).
pub mod retcode {
    pub const DONE: u32 = 10009;
    pub const INVALID_REQUEST: u32 = 10013;
    pub const INVALID_VOLUME: u32 = 10014;
    pub const INVALID_PRICE: u32 = 10015;
    pub const MARKET_CLOSED: u32 = 10018;
    pub const NO_MONEY: u32 = 10019;

    pub fn describe(code: u32) -> &'static str {
        match code {
            DONE => "request completed",
            INVALID_REQUEST => "invalid request",
            INVALID_VOLUME => "invalid volume",
            INVALID_PRICE => "invalid price",
            MARKET_CLOSED => "market closed",
            NO_MONEY => "insufficient funds",
            _ => "unknown retcode",
        }
    }
}

/// Immediate outcome of a trade submission, pushed on the Result channel.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TradeResult {
    pub retcode: u32,
    pub retcode_description: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub order: Option<u64>,
}

impl TradeResult {
    pub fn new(retcode: u32, order: Option<u64>) -> Self {
        Self {
            retcode,
            retcode_description: retcode::describe(retcode).to_string(),
            order,
        }
    }

    pub fn is_done(&self) -> bool {
        self.retcode == retcode::DONE
    }
}

/// Full request/result echo pushed on the Event channel once the order
/// finalizes. Deliberately independent of the Result-channel TradeResult.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TradeEvent {
    pub event: String,
    pub request: TradeRequest,
    pub result: TradeResult,
}

impl TradeEvent {
    pub fn new(request: TradeRequest, result: TradeResult) -> Self {
        Self {
            event: "trade".to_string(),
            request,
            result,
        }
    }
}
