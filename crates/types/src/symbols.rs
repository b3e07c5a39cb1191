use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

/// Instrument specification returned by SYMBOL_INFO.
///
/// Every price/volume field travels as a decimal string on the wire. The
/// terminal side emits text to avoid precision ambiguity across numeric
/// representations; this side parses the text into `Decimal` before any
/// arithmetic happens.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SymbolSpec {
    pub symbol: String,
    pub description: String,
    pub base_currency: String,
    pub quote_currency: String,
    pub digits: u32,
    #[serde(with = "rust_decimal::serde::str")]
    pub contract_size: Decimal,
    #[serde(with = "rust_decimal::serde::str")]
    pub tick_value: Decimal,
    #[serde(with = "rust_decimal::serde::str")]
    pub tick_size: Decimal,
    #[serde(with = "rust_decimal::serde::str")]
    pub volume_min: Decimal,
    #[serde(with = "rust_decimal::serde::str")]
    pub volume_max: Decimal,
    #[serde(with = "rust_decimal::serde::str")]
    pub bid: Decimal,
    #[serde(with = "rust_decimal::serde::str")]
    pub ask: Decimal,
}
