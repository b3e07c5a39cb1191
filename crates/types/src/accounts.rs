use serde::{Deserialize, Serialize};

/// Full account snapshot returned by the ACCOUNT action.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AccountSnapshot {
    pub login: u64,
    pub name: String,
    pub server: String,
    pub currency: String,
    pub leverage: u32,
    pub balance: f64,
    pub equity: f64,
    pub margin: f64,
    pub margin_free: f64,
    pub trade_allowed: bool,
}

/// Condensed balance view returned by the BALANCE action.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BalanceInfo {
    pub balance: f64,
    pub equity: f64,
    pub margin: f64,
    pub margin_free: f64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum PositionSide {
    #[serde(rename = "POSITION_TYPE_BUY")]
    Buy,
    #[serde(rename = "POSITION_TYPE_SELL")]
    Sell,
}

/// An open position.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Position {
    pub id: u64,
    pub symbol: String,
    #[serde(rename = "type")]
    pub side: PositionSide,
    pub volume: f64,
    pub open_price: f64,
    pub current_price: f64,
    pub stoploss: f64,
    pub takeprofit: f64,
    pub profit: f64,
    pub time: i64,
}

/// A pending order.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Order {
    pub id: u64,
    pub symbol: String,
    #[serde(rename = "type")]
    pub order_type: String,
    pub volume: f64,
    pub open_price: f64,
    pub stoploss: f64,
    pub takeprofit: f64,
    pub time_setup: i64,
}

/// A historical deal, returned by HISTORY/TRADES.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Deal {
    pub ticket: u64,
    pub symbol: String,
    #[serde(rename = "type")]
    pub deal_type: String,
    pub volume: f64,
    pub price: f64,
    pub profit: f64,
    pub time: i64,
}
