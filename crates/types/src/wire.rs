use crate::data::Bar;
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Maximum frame size accepted on any channel.
pub const MAX_FRAME_BYTES: usize = 8 * 1024 * 1024;

/// A flat client command. Field names follow the wire convention of the
/// terminal protocol (`actionType`, `chartTF`, `fromDate`, ...). Unknown
/// fields are ignored on decode so older dispatchers tolerate newer clients.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct Command {
    pub action: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub action_type: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub symbol: Option<String>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub symbols: Vec<String>,
    #[serde(rename = "chartTF", skip_serializing_if = "Option::is_none")]
    pub chart_tf: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub from_date: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub to_date: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub id: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub volume: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub price: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub stoploss: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub takeprofit: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub deviation: Option<u32>,
    /// Bar rows for HISTORY/WRITE.
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub rows: Vec<Bar>,
}

impl Command {
    pub fn new(action: impl Into<String>) -> Self {
        Self {
            action: action.into(),
            ..Self::default()
        }
    }
}

/// Synchronous acknowledge on the Command channel. Terminal state for the
/// request: `Error` means no Result will follow.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Ack {
    Ok,
    Error,
}

impl Ack {
    pub fn as_str(&self) -> &'static str {
        match self {
            Ack::Ok => "OK",
            Ack::Error => "ERROR",
        }
    }

    pub fn parse(raw: &[u8]) -> anyhow::Result<Self> {
        match raw {
            b"OK" => Ok(Ack::Ok),
            b"ERROR" => Ok(Ack::Error),
            other => anyhow::bail!(
                "unrecognized acknowledge frame: {:?}",
                String::from_utf8_lossy(other)
            ),
        }
    }

    pub fn is_ok(&self) -> bool {
        matches!(self, Ack::Ok)
    }
}

/// One push on the Live channel. `data` is `[time_ms, bid, ask]` in tick
/// mode or `[time, open, high, low, close, volume]` in bar mode.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LiveTick {
    pub symbol: String,
    pub timeframe: String,
    pub status: String,
    pub data: Vec<f64>,
}

/// Wrap a result payload with the mandatory `error: false` marker. Payload
/// fields land at the top level of the object, as the protocol requires.
pub fn ok_envelope<T: Serialize>(payload: &T) -> Value {
    let mut value = serde_json::to_value(payload).unwrap_or(Value::Null);
    match value.as_object_mut() {
        Some(map) => {
            map.insert("error".to_string(), Value::Bool(false));
            value
        }
        None => serde_json::json!({ "error": false, "data": value }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn command_decodes_wire_field_names() {
        let raw = r#"{"action":"CONFIG","actionType":"CONFIG","symbol":"EURUSD","chartTF":"M1"}"#;
        let cmd: Command = serde_json::from_str(raw).unwrap();
        assert_eq!(cmd.action, "CONFIG");
        assert_eq!(cmd.action_type.as_deref(), Some("CONFIG"));
        assert_eq!(cmd.symbol.as_deref(), Some("EURUSD"));
        assert_eq!(cmd.chart_tf.as_deref(), Some("M1"));
    }

    #[test]
    fn command_tolerates_unknown_fields() {
        let raw = r#"{"action":"ACCOUNT","someFutureField":7}"#;
        let cmd: Command = serde_json::from_str(raw).unwrap();
        assert_eq!(cmd.action, "ACCOUNT");
    }

    #[test]
    fn command_round_trips_history_request() {
        let mut cmd = Command::new("HISTORY");
        cmd.action_type = Some("DATA".into());
        cmd.symbol = Some("XAUUSD".into());
        cmd.chart_tf = Some("M1".into());
        cmd.from_date = Some(1_700_000_000);
        cmd.to_date = Some(1_700_600_000);
        let json = serde_json::to_string(&cmd).unwrap();
        assert!(json.contains("\"chartTF\":\"M1\""));
        assert!(json.contains("\"fromDate\":1700000000"));
        let back: Command = serde_json::from_str(&json).unwrap();
        assert_eq!(back, cmd);
    }

    #[test]
    fn ack_parse() {
        assert_eq!(Ack::parse(b"OK").unwrap(), Ack::Ok);
        assert_eq!(Ack::parse(b"ERROR").unwrap(), Ack::Error);
        assert!(Ack::parse(b"MAYBE").is_err());
    }

    #[test]
    fn ok_envelope_injects_error_flag() {
        #[derive(Serialize)]
        struct P {
            balance: f64,
        }
        let v = ok_envelope(&P { balance: 100.0 });
        assert_eq!(v["error"], Value::Bool(false));
        assert_eq!(v["balance"], serde_json::json!(100.0));
    }
}
