//! Client SDK for the bridge: one command socket driven request/reply
//! style, three push sockets drained by background tasks.

pub mod stream;

use bytes::Bytes;
use futures_util::{SinkExt, StreamExt};
use serde_json::Value;
use std::time::Duration;
use tb_types::accounts::{AccountSnapshot, BalanceInfo, Deal, Order, Position};
use tb_types::calendar::CalendarEvent;
use tb_types::data::Bar;
use tb_types::keys::{SubKey, Timeframe};
use tb_types::symbols::SymbolSpec;
use tb_types::trade::{TradeRequest, TradeResult};
use tb_types::wire::{Ack, Command, LiveTick, MAX_FRAME_BYTES};
use thiserror::Error;
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tokio::sync::{broadcast, mpsc, Mutex};
use tokio::time::timeout;
use tokio_util::codec::length_delimited::LengthDelimitedCodec;
use tokio_util::codec::{FramedRead, FramedWrite};
use tracing::{debug, warn};

pub use stream::{EventStream, LiveStream};

fn frame_codec() -> LengthDelimitedCodec {
    LengthDelimitedCodec::builder()
        .max_frame_length(MAX_FRAME_BYTES)
        .new_codec()
}

/// Error-shaped Results become typed errors; everything else passes through.
fn check_error(v: Value) -> Result<Value, ClientError> {
    if v.get("error").and_then(Value::as_bool).unwrap_or(false) {
        return Err(ClientError::Remote {
            kind: v
                .get("kind")
                .and_then(Value::as_str)
                .unwrap_or("internal")
                .to_string(),
            description: v
                .get("description")
                .and_then(Value::as_str)
                .unwrap_or("unknown error")
                .to_string(),
        });
    }
    Ok(v)
}

#[derive(Debug, Error)]
pub enum ClientError {
    #[error("request timed out")]
    Timeout,
    #[error("command rejected by dispatcher")]
    Rejected,
    #[error("{kind} error from dispatcher: {description}")]
    Remote { kind: String, description: String },
    #[error("transport error: {0}")]
    Transport(#[from] std::io::Error),
    #[error("decode error: {0}")]
    Decode(#[from] serde_json::Error),
    #[error("protocol violation: {0}")]
    Protocol(String),
    #[error("connection closed")]
    Closed,
}

#[derive(Clone, Debug)]
pub struct ClientConfig {
    pub host: String,
    pub command_port: u16,
    pub result_port: u16,
    pub live_port: u16,
    pub event_port: u16,
    /// Deadline for the synchronous command acknowledge.
    pub command_timeout: Duration,
    /// Deadline for the matching Result push.
    pub result_timeout: Duration,
}

fn env_port(name: &str, default: u16) -> u16 {
    std::env::var(name)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            host: std::env::var("TB_HOST").unwrap_or_else(|_| "127.0.0.1".to_string()),
            command_port: env_port("TB_PORT_COMMAND", 2201),
            result_port: env_port("TB_PORT_RESULT", 2202),
            live_port: env_port("TB_PORT_LIVE", 2203),
            event_port: env_port("TB_PORT_EVENT", 2204),
            command_timeout: Duration::from_secs(5),
            result_timeout: Duration::from_secs(10),
        }
    }
}

impl ClientConfig {
    /// Explicit port set, used when the bridge binds ephemeral ports.
    pub fn with_ports(host: impl Into<String>, ports: [u16; 4]) -> Self {
        Self {
            host: host.into(),
            command_port: ports[0],
            result_port: ports[1],
            live_port: ports[2],
            event_port: ports[3],
            ..Self::default()
        }
    }
}

struct CommandSocket {
    reader: FramedRead<OwnedReadHalf, LengthDelimitedCodec>,
    writer: FramedWrite<OwnedWriteHalf, LengthDelimitedCodec>,
}

/// Connected bridge client. Cheap to share behind an `Arc`; the typed
/// helpers serialize their request/Result pairs internally so concurrent
/// callers cannot interleave correlation order.
pub struct BridgeClient {
    cfg: ClientConfig,
    command: Mutex<CommandSocket>,
    results: Mutex<mpsc::Receiver<Value>>,
    live_tx: broadcast::Sender<LiveTick>,
    event_tx: broadcast::Sender<Value>,
}

impl BridgeClient {
    /// Connect all four channels. Push sockets get a background reader each;
    /// the Result reader preserves arrival order in a bounded queue.
    pub async fn connect(cfg: ClientConfig) -> Result<Self, ClientError> {
        let command = TcpStream::connect((cfg.host.as_str(), cfg.command_port)).await?;
        let result = TcpStream::connect((cfg.host.as_str(), cfg.result_port)).await?;
        let live = TcpStream::connect((cfg.host.as_str(), cfg.live_port)).await?;
        let event = TcpStream::connect((cfg.host.as_str(), cfg.event_port)).await?;
        command.set_nodelay(true)?;

        let (result_tx, result_rx) = mpsc::channel::<Value>(1024);
        tokio::spawn(async move {
            let mut reader = FramedRead::new(result, frame_codec());
            while let Some(frame) = reader.next().await {
                let frame = match frame {
                    Ok(f) => f,
                    Err(e) => {
                        warn!(error = %e, "result read failed");
                        break;
                    }
                };
                match serde_json::from_slice::<Value>(&frame) {
                    Ok(v) => {
                        if result_tx.send(v).await.is_err() {
                            break;
                        }
                    }
                    Err(e) => warn!(error = %e, "unparseable result frame"),
                }
            }
            debug!("result stream ended");
        });

        let (live_tx, _) = broadcast::channel::<LiveTick>(1024);
        let fanout = live_tx.clone();
        tokio::spawn(async move {
            let mut reader = FramedRead::new(live, frame_codec());
            while let Some(Ok(frame)) = reader.next().await {
                match serde_json::from_slice::<LiveTick>(&frame) {
                    // no subscribers is fine, ticks are fire and forget
                    Ok(tick) => {
                        let _ = fanout.send(tick);
                    }
                    Err(e) => warn!(error = %e, "unparseable live frame"),
                }
            }
            debug!("live stream ended");
        });

        let (event_tx, _) = broadcast::channel::<Value>(256);
        let fanout = event_tx.clone();
        tokio::spawn(async move {
            let mut reader = FramedRead::new(event, frame_codec());
            while let Some(Ok(frame)) = reader.next().await {
                match serde_json::from_slice::<Value>(&frame) {
                    Ok(v) => {
                        let _ = fanout.send(v);
                    }
                    Err(e) => warn!(error = %e, "unparseable event frame"),
                }
            }
            debug!("event stream ended");
        });

        let (r, w) = command.into_split();
        Ok(Self {
            cfg,
            command: Mutex::new(CommandSocket {
                reader: FramedRead::new(r, frame_codec()),
                writer: FramedWrite::new(w, frame_codec()),
            }),
            results: Mutex::new(result_rx),
            live_tx,
            event_tx,
        })
    }

    /// Send one command and wait for its synchronous acknowledge.
    pub async fn send_command(&self, cmd: &Command) -> Result<(), ClientError> {
        let raw = serde_json::to_vec(cmd)?;
        let mut sock = self.command.lock().await;
        sock.writer.send(Bytes::from(raw)).await?;
        let frame = timeout(self.cfg.command_timeout, sock.reader.next())
            .await
            .map_err(|_| ClientError::Timeout)?
            .ok_or(ClientError::Closed)??;
        match Ack::parse(&frame) {
            Ok(ack) if ack.is_ok() => Ok(()),
            Ok(_) => Err(ClientError::Rejected),
            Err(e) => Err(ClientError::Protocol(e.to_string())),
        }
    }

    /// Next Result in arrival order, within the default deadline.
    /// Error-shaped Results come back as `ClientError::Remote`.
    pub async fn receive_result(&self) -> Result<Value, ClientError> {
        self.receive_result_within(self.cfg.result_timeout).await
    }

    pub async fn receive_result_within(&self, deadline: Duration) -> Result<Value, ClientError> {
        let mut rx = self.results.lock().await;
        let v = timeout(deadline, rx.recv())
            .await
            .map_err(|_| ClientError::Timeout)?
            .ok_or(ClientError::Closed)?;
        check_error(v)
    }

    /// Command/Result round trip with error unwrapping. Correlation is
    /// positional, so the Result queue stays locked until this command's
    /// answer is out.
    pub async fn request(&self, cmd: &Command) -> Result<Value, ClientError> {
        let mut rx = self.results.lock().await;
        self.send_command(cmd).await?;
        let v = timeout(self.cfg.result_timeout, rx.recv())
            .await
            .map_err(|_| ClientError::Timeout)?
            .ok_or(ClientError::Closed)?;
        drop(rx);
        check_error(v)
    }

    pub async fn account(&self) -> Result<AccountSnapshot, ClientError> {
        let v = self.request(&Command::new("ACCOUNT")).await?;
        Ok(serde_json::from_value(v)?)
    }

    pub async fn balance(&self) -> Result<BalanceInfo, ClientError> {
        let v = self.request(&Command::new("BALANCE")).await?;
        Ok(serde_json::from_value(v)?)
    }

    /// Configure a live subscription for `symbol` at `timeframe`.
    pub async fn config(&self, symbol: &str, timeframe: Timeframe) -> Result<(), ClientError> {
        let mut cmd = Command::new("CONFIG");
        cmd.symbol = Some(symbol.to_string());
        cmd.chart_tf = Some(timeframe.as_str().to_string());
        self.request(&cmd).await?;
        Ok(())
    }

    pub async fn positions(&self) -> Result<Vec<Position>, ClientError> {
        let v = self.request(&Command::new("POSITIONS")).await?;
        Ok(serde_json::from_value(v["positions"].clone())?)
    }

    pub async fn orders(&self) -> Result<Vec<Order>, ClientError> {
        let v = self.request(&Command::new("ORDERS")).await?;
        Ok(serde_json::from_value(v["orders"].clone())?)
    }

    pub async fn history(
        &self,
        symbol: &str,
        timeframe: Timeframe,
        from: i64,
        to: i64,
    ) -> Result<Vec<Bar>, ClientError> {
        let mut cmd = Command::new("HISTORY");
        cmd.action_type = Some("DATA".to_string());
        cmd.symbol = Some(symbol.to_string());
        cmd.chart_tf = Some(timeframe.as_str().to_string());
        cmd.from_date = Some(from);
        cmd.to_date = Some(to);
        let v = self.request(&cmd).await?;
        Ok(serde_json::from_value(v["data"].clone())?)
    }

    pub async fn write_history(
        &self,
        symbol: &str,
        timeframe: Timeframe,
        rows: Vec<Bar>,
    ) -> Result<u64, ClientError> {
        let mut cmd = Command::new("HISTORY");
        cmd.action_type = Some("WRITE".to_string());
        cmd.symbol = Some(symbol.to_string());
        cmd.chart_tf = Some(timeframe.as_str().to_string());
        cmd.rows = rows;
        let v = self.request(&cmd).await?;
        Ok(v["rows_written"].as_u64().unwrap_or(0))
    }

    pub async fn history_trades(&self, from: i64) -> Result<Vec<Deal>, ClientError> {
        let mut cmd = Command::new("HISTORY");
        cmd.action_type = Some("TRADES".to_string());
        cmd.from_date = Some(from);
        let v = self.request(&cmd).await?;
        Ok(serde_json::from_value(v["trades"].clone())?)
    }

    /// Empty `names` asks for every tradable symbol.
    pub async fn symbol_info(&self, names: &[&str]) -> Result<Vec<SymbolSpec>, ClientError> {
        let mut cmd = Command::new("SYMBOL_INFO");
        cmd.symbols = names.iter().map(|s| s.to_string()).collect();
        let v = self.request(&cmd).await?;
        Ok(serde_json::from_value(v["symbols"].clone())?)
    }

    pub async fn watchlist(&self) -> Result<Vec<String>, ClientError> {
        let v = self.request(&Command::new("WATCHLIST")).await?;
        Ok(serde_json::from_value(v["symbols"].clone())?)
    }

    pub async fn calendar(
        &self,
        symbol: Option<&str>,
        from: i64,
    ) -> Result<Vec<CalendarEvent>, ClientError> {
        let mut cmd = Command::new("CALENDAR");
        cmd.symbol = symbol.map(str::to_string);
        cmd.from_date = Some(from);
        let v = self.request(&cmd).await?;
        Ok(serde_json::from_value(v["data"].clone())?)
    }

    /// Submit a trade. A non-success retcode is a valid `TradeResult`, not
    /// an `Err`; only transport and dispatcher failures error here.
    pub async fn trade(&self, req: &TradeRequest) -> Result<TradeResult, ClientError> {
        let mut cmd = Command::new("TRADE");
        cmd.action_type = Some(req.action_type.as_str().to_string());
        if !req.symbol.is_empty() {
            cmd.symbol = Some(req.symbol.clone());
        }
        cmd.volume = Some(req.volume);
        cmd.price = req.price;
        cmd.stoploss = req.stoploss;
        cmd.takeprofit = req.takeprofit;
        cmd.deviation = req.deviation;
        cmd.id = req.id;
        let v = self.request(&cmd).await?;
        Ok(serde_json::from_value(v)?)
    }

    /// Drop every live subscription on the dispatcher side. Returns how
    /// many were cleared. Subscriptions are not restored automatically; the
    /// caller re-issues CONFIG after a terminal restart.
    pub async fn reset(&self) -> Result<u64, ClientError> {
        let v = self.request(&Command::new("RESET")).await?;
        Ok(v["cleared"].as_u64().unwrap_or(0))
    }

    /// CONFIG the subscription, then hand back a filtered live stream.
    /// Subscriptions do not survive a terminal restart; call this again
    /// after reconnecting.
    pub async fn subscribe(
        &self,
        symbol: &str,
        timeframe: Timeframe,
    ) -> Result<LiveStream, ClientError> {
        self.config(symbol, timeframe).await?;
        Ok(self.subscribe_live(Some(SubKey::new(symbol, timeframe))))
    }

    /// Live pushes, optionally filtered to one subscription key.
    pub fn subscribe_live(&self, filter: Option<SubKey>) -> LiveStream {
        LiveStream::new(self.live_tx.subscribe(), filter)
    }

    /// Trade events as raw JSON values.
    pub fn events(&self) -> EventStream {
        EventStream::new(self.event_tx.subscribe())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn config_defaults_cover_all_four_ports() {
        let cfg = ClientConfig::default();
        assert_eq!(cfg.command_port, 2201);
        assert_eq!(cfg.result_port, 2202);
        assert_eq!(cfg.live_port, 2203);
        assert_eq!(cfg.event_port, 2204);
        assert_eq!(cfg.command_timeout, Duration::from_secs(5));
        assert_eq!(cfg.result_timeout, Duration::from_secs(10));
    }

    #[test]
    fn with_ports_overrides_in_channel_order() {
        let cfg = ClientConfig::with_ports("10.0.0.5", [1, 2, 3, 4]);
        assert_eq!(cfg.host, "10.0.0.5");
        assert_eq!(cfg.command_port, 1);
        assert_eq!(cfg.event_port, 4);
    }

    #[test]
    fn error_shaped_results_become_remote_errors() {
        let v = serde_json::json!({
            "error": true,
            "kind": "decode",
            "description": "deserialization failed",
        });
        match check_error(v) {
            Err(ClientError::Remote { kind, description }) => {
                assert_eq!(kind, "decode");
                assert_eq!(description, "deserialization failed");
            }
            other => panic!("expected remote error, got {other:?}"),
        }
    }

    #[test]
    fn ok_results_pass_through_untouched() {
        let v = serde_json::json!({ "error": false, "balance": 10_000.0 });
        let v = check_error(v).expect("not an error result");
        assert_eq!(v["balance"], 10_000.0);
    }
}
