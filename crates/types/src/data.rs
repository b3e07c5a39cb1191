use serde::{Deserialize, Serialize};

/// One OHLCV bar. On the wire it is the positional array
/// `[time, open, high, low, close, volume]`.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(from = "BarRow", into = "BarRow")]
pub struct Bar {
    pub time: i64,
    pub open: f64,
    pub high: f64,
    pub low: f64,
    pub close: f64,
    pub volume: f64,
}

type BarRow = (i64, f64, f64, f64, f64, f64);

impl From<BarRow> for Bar {
    fn from((time, open, high, low, close, volume): BarRow) -> Self {
        Self {
            time,
            open,
            high,
            low,
            close,
            volume,
        }
    }
}

impl From<Bar> for BarRow {
    fn from(b: Bar) -> Self {
        (b.time, b.open, b.high, b.low, b.close, b.volume)
    }
}

/// A single bid/ask update from the terminal's market feed. Feeds both the
/// tick-mode live push (`[time_ms, bid, ask]`) and bar aggregation.
#[derive(Debug, Clone, PartialEq)]
pub struct MarketUpdate {
    pub symbol: String,
    pub time_ms: i64,
    pub bid: f64,
    pub ask: f64,
}

impl MarketUpdate {
    pub fn time_secs(&self) -> i64 {
        self.time_ms.div_euclid(1000)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bar_serializes_as_six_element_array() {
        let bar = Bar {
            time: 1_700_000_000,
            open: 1.05,
            high: 1.06,
            low: 1.04,
            close: 1.055,
            volume: 42.0,
        };
        let json = serde_json::to_value(bar).unwrap();
        let arr = json.as_array().expect("array payload");
        assert_eq!(arr.len(), 6);
        assert_eq!(arr[0], serde_json::json!(1_700_000_000_i64));

        let back: Bar = serde_json::from_value(json).unwrap();
        assert_eq!(back, bar);
    }

    #[test]
    fn update_time_floors_to_seconds() {
        let u = MarketUpdate {
            symbol: "EURUSD".into(),
            time_ms: 1_700_000_000_999,
            bid: 1.0,
            ask: 1.0,
        };
        assert_eq!(u.time_secs(), 1_700_000_000);
    }
}
