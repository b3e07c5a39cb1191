/// Chart timeframes accepted by the CONFIG command (`chartTF` field).
///
/// `Tick` streams raw bid/ask updates; the bar timeframes aggregate updates
/// into OHLCV bars that are pushed on completion.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Timeframe {
    Tick,
    M1,
    M5,
    M15,
    M30,
    H1,
    H4,
    D1,
    W1,
    Mn1,
}

impl Timeframe {
    pub fn parse(s: &str) -> anyhow::Result<Self> {
        let tf = match s.to_ascii_uppercase().as_str() {
            "TICK" => Timeframe::Tick,
            "M1" => Timeframe::M1,
            "M5" => Timeframe::M5,
            "M15" => Timeframe::M15,
            "M30" => Timeframe::M30,
            "H1" => Timeframe::H1,
            "H4" => Timeframe::H4,
            "D1" => Timeframe::D1,
            "W1" => Timeframe::W1,
            "MN1" => Timeframe::Mn1,
            other => anyhow::bail!("unknown timeframe: {other}"),
        };
        Ok(tf)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Timeframe::Tick => "TICK",
            Timeframe::M1 => "M1",
            Timeframe::M5 => "M5",
            Timeframe::M15 => "M15",
            Timeframe::M30 => "M30",
            Timeframe::H1 => "H1",
            Timeframe::H4 => "H4",
            Timeframe::D1 => "D1",
            Timeframe::W1 => "W1",
            Timeframe::Mn1 => "MN1",
        }
    }

    /// Bar bucket width in seconds; `None` for tick mode.
    pub fn bucket_secs(&self) -> Option<i64> {
        match self {
            Timeframe::Tick => None,
            Timeframe::M1 => Some(60),
            Timeframe::M5 => Some(5 * 60),
            Timeframe::M15 => Some(15 * 60),
            Timeframe::M30 => Some(30 * 60),
            Timeframe::H1 => Some(3_600),
            Timeframe::H4 => Some(4 * 3_600),
            Timeframe::D1 => Some(86_400),
            Timeframe::W1 => Some(7 * 86_400),
            // Calendar months are irregular; 30 days is the push bucket.
            Timeframe::Mn1 => Some(30 * 86_400),
        }
    }
}

impl std::fmt::Display for Timeframe {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Subscription key: at most one live stream exists per (symbol, timeframe).
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct SubKey {
    pub symbol: String,
    pub timeframe: Timeframe,
}

impl SubKey {
    pub fn new(symbol: impl Into<String>, timeframe: Timeframe) -> Self {
        Self {
            symbol: symbol.into(),
            timeframe,
        }
    }
}

impl std::fmt::Display for SubKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}@{}", self.symbol, self.timeframe)
    }
}
