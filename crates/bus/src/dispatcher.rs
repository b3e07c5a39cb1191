use crate::live::SubHandle;
use crate::metrics::METRICS;
use crate::push::{frame_codec, PushChannel};
use bytes::Bytes;
use dashmap::DashMap;
use futures_util::{SinkExt, StreamExt};
use serde::Serialize;
use serde_json::{json, Value};
use std::sync::Arc;
use std::time::Instant;
use tb_terminal::Terminal;
use tb_types::data::{Bar, MarketUpdate};
use tb_types::error::{ErrorKind, ErrorResult};
use tb_types::keys::{SubKey, Timeframe};
use tb_types::trade::{TradeAction, TradeEvent, TradeRequest};
use tb_types::wire::{ok_envelope, Ack, Command};
use tokio::net::TcpStream;
use tokio::sync::Mutex;
use tokio_util::codec::{FramedRead, FramedWrite};
use tracing::{info, warn};

#[derive(Clone, Debug)]
pub struct DispatcherConfig {
    /// Per-connection queue depth on the push channels.
    pub push_queue_capacity: usize,
    /// Hard cap on SYMBOL_INFO result size.
    pub symbol_info_max: usize,
}

impl Default for DispatcherConfig {
    fn default() -> Self {
        let push_queue_capacity = std::env::var("TB_PUSH_QUEUE")
            .ok()
            .and_then(|v| v.parse().ok())
            .unwrap_or(1024);
        let symbol_info_max = std::env::var("TB_SYMBOL_INFO_MAX")
            .ok()
            .and_then(|v| v.parse().ok())
            .unwrap_or(2000);
        Self {
            push_queue_capacity,
            symbol_info_max,
        }
    }
}

/// Command loop plus the three push channels. One instance serves every
/// attached client; each accepted command produces exactly one Result push
/// and exchanges run one at a time across all connections, so Results
/// leave in ack order.
pub struct Dispatcher {
    terminal: Arc<dyn Terminal>,
    cfg: DispatcherConfig,
    pub(crate) subs: DashMap<SubKey, SubHandle>,
    /// Held from ack through Result publication. Clients correlate
    /// positionally, so frames from different connections must not
    /// interleave their acks and Results.
    exchange: Mutex<()>,
    results: PushChannel,
    live: PushChannel,
    events: PushChannel,
}

#[derive(Serialize)]
struct HistoryData<'a> {
    symbol: &'a str,
    timeframe: &'a str,
    data: Vec<Bar>,
}

fn exec_err(e: impl std::fmt::Display) -> ErrorResult {
    ErrorResult::new(ErrorKind::Execution, e.to_string())
}

impl Dispatcher {
    pub fn new(terminal: Arc<dyn Terminal>, cfg: DispatcherConfig) -> Arc<Self> {
        let cap = cfg.push_queue_capacity;
        Arc::new(Self {
            terminal,
            cfg,
            subs: DashMap::new(),
            exchange: Mutex::new(()),
            results: PushChannel::new("result", cap),
            live: PushChannel::new("live", cap),
            events: PushChannel::new("event", cap),
        })
    }

    pub fn results(&self) -> &PushChannel {
        &self.results
    }

    pub fn live(&self) -> &PushChannel {
        &self.live
    }

    pub fn events(&self) -> &PushChannel {
        &self.events
    }

    pub(crate) fn live_channel(&self) -> PushChannel {
        self.live.clone()
    }

    pub(crate) fn terminal_stream(&self) -> tokio::sync::broadcast::Receiver<MarketUpdate> {
        self.terminal.market_stream()
    }

    /// Serve one command connection until the peer disconnects. Malformed
    /// frames are acked ERROR and reported on the Result channel; the loop
    /// itself only ends on transport errors.
    pub async fn run_command_client(self: Arc<Self>, stream: TcpStream) {
        let peer = stream.peer_addr().ok();
        let (r, w) = stream.into_split();
        let mut reader = FramedRead::new(r, frame_codec());
        let mut writer = FramedWrite::new(w, frame_codec());
        METRICS.client_attached();
        info!(?peer, "command client attached");
        while let Some(frame) = reader.next().await {
            let frame = match frame {
                Ok(f) => f,
                Err(e) => {
                    warn!(?peer, error = %e, "command read failed");
                    break;
                }
            };
            let exchange = self.exchange.lock().await;
            let (ack, cmd) = self.decode_frame(&frame);
            if writer
                .send(Bytes::from_static(ack.as_str().as_bytes()))
                .await
                .is_err()
            {
                break;
            }
            if let Some(cmd) = cmd {
                self.handle_command(cmd).await;
            }
            drop(exchange);
        }
        METRICS.client_detached();
        info!(?peer, "command client detached");
    }

    /// Decode one raw frame. A decode failure publishes the error Result
    /// here, since no command object exists to route further.
    pub fn decode_frame(&self, raw: &[u8]) -> (Ack, Option<Command>) {
        match serde_json::from_slice::<Command>(raw) {
            Ok(cmd) => (Ack::Ok, Some(cmd)),
            Err(e) => {
                warn!(error = %e, "command frame rejected");
                METRICS.inc_error(ErrorKind::Decode.as_str());
                let err = ErrorResult::new(ErrorKind::Decode, "deserialization failed")
                    .with_invalid_message(String::from_utf8_lossy(raw));
                self.results.publish(&err);
                (Ack::Error, None)
            }
        }
    }

    /// Decode-then-handle for in-process callers. Returns the ack a socket
    /// client would have received.
    pub async fn process_frame(&self, raw: &[u8]) -> Ack {
        let _exchange = self.exchange.lock().await;
        let (ack, cmd) = self.decode_frame(raw);
        if let Some(cmd) = cmd {
            self.handle_command(cmd).await;
        }
        ack
    }

    /// Handle one decoded command and publish its single Result.
    pub async fn handle_command(&self, cmd: Command) {
        let started = Instant::now();
        let action = cmd.action.clone();
        METRICS.inc_command(&action);
        let result = match self.dispatch(&cmd).await {
            Ok(v) => v,
            Err(err) => {
                METRICS.inc_error(&err.kind);
                warn!(action = %action, kind = %err.kind, description = %err.description, "command failed");
                err.to_value()
            }
        };
        self.results.publish(&result);
        METRICS.observe_latency(&action, started.elapsed());
    }

    async fn dispatch(&self, cmd: &Command) -> Result<Value, ErrorResult> {
        match cmd.action.as_str() {
            "ACCOUNT" => {
                let snap = self.terminal.account().await.map_err(exec_err)?;
                Ok(ok_envelope(&snap))
            }
            "BALANCE" => {
                let info = self.terminal.balance().await.map_err(exec_err)?;
                Ok(ok_envelope(&info))
            }
            "CONFIG" => {
                let symbol = require_symbol(cmd)?;
                let tf = require_timeframe(cmd)?;
                self.configure_subscription(SubKey::new(symbol, tf));
                Ok(ok_envelope(&json!({
                    "description": "subscription configured",
                    "symbol": symbol,
                    "timeframe": tf.as_str(),
                })))
            }
            "HISTORY" => self.dispatch_history(cmd).await,
            "POSITIONS" => {
                let positions = self.terminal.positions().await.map_err(exec_err)?;
                Ok(ok_envelope(&json!({ "positions": positions })))
            }
            "ORDERS" => {
                let orders = self.terminal.orders().await.map_err(exec_err)?;
                Ok(ok_envelope(&json!({ "orders": orders })))
            }
            "TRADE" => {
                let req = trade_request(cmd)?;
                let result = self.terminal.execute(&req).await.map_err(exec_err)?;
                self.events.publish(&TradeEvent::new(req, result.clone()));
                Ok(ok_envelope(&result))
            }
            "SYMBOL_INFO" => self.dispatch_symbol_info(cmd).await,
            "CALENDAR" => {
                let from = cmd.from_date.unwrap_or(0);
                let events = self
                    .terminal
                    .calendar(cmd.symbol.as_deref(), from)
                    .await
                    .map_err(exec_err)?;
                Ok(ok_envelope(&json!({ "data": events })))
            }
            "RESET" => {
                let cleared = self.reset_subscriptions();
                Ok(ok_envelope(&json!({
                    "description": "subscriptions cleared",
                    "cleared": cleared,
                })))
            }
            "WATCHLIST" => {
                let symbols = self.terminal.watchlist().await.map_err(exec_err)?;
                Ok(ok_envelope(&json!({ "symbols": symbols })))
            }
            "" => Err(ErrorResult::new(ErrorKind::UnknownAction, "missing action")),
            other => Err(ErrorResult::new(
                ErrorKind::UnknownAction,
                format!("unknown action: {other}"),
            )),
        }
    }

    async fn dispatch_history(&self, cmd: &Command) -> Result<Value, ErrorResult> {
        let kind = cmd
            .action_type
            .as_deref()
            .ok_or_else(|| exec_err("missing actionType"))?;
        match kind {
            "DATA" => {
                let symbol = require_symbol(cmd)?;
                let tf = require_timeframe(cmd)?;
                let from = cmd.from_date.unwrap_or(0);
                let to = cmd.to_date.unwrap_or(i64::MAX);
                let data = self
                    .terminal
                    .history_bars(symbol, tf, from, to)
                    .await
                    .map_err(exec_err)?;
                Ok(ok_envelope(&HistoryData {
                    symbol,
                    timeframe: tf.as_str(),
                    data,
                }))
            }
            "WRITE" => {
                let symbol = require_symbol(cmd)?;
                let tf = require_timeframe(cmd)?;
                let written = self
                    .terminal
                    .write_history(symbol, tf, &cmd.rows)
                    .await
                    .map_err(exec_err)?;
                Ok(ok_envelope(&json!({
                    "description": "history stored",
                    "symbol": symbol,
                    "timeframe": tf.as_str(),
                    "rows_written": written,
                })))
            }
            "TRADES" => {
                let from = cmd.from_date.unwrap_or(0);
                let deals = self.terminal.history_deals(from).await.map_err(exec_err)?;
                Ok(ok_envelope(&json!({ "trades": deals })))
            }
            other => Err(exec_err(format!("unknown HISTORY actionType: {other}"))),
        }
    }

    async fn dispatch_symbol_info(&self, cmd: &Command) -> Result<Value, ErrorResult> {
        let names: Vec<String> = if !cmd.symbols.is_empty() {
            cmd.symbols.clone()
        } else if let Some(s) = &cmd.symbol {
            vec![s.clone()]
        } else {
            Vec::new()
        };
        let started = Instant::now();
        info!(requested = names.len(), "symbol info lookup started");
        let mut specs = self.terminal.symbol_info(&names).await.map_err(exec_err)?;
        if specs.len() > self.cfg.symbol_info_max {
            warn!(
                count = specs.len(),
                limit = self.cfg.symbol_info_max,
                "symbol info truncated"
            );
            specs.truncate(self.cfg.symbol_info_max);
        }
        info!(
            count = specs.len(),
            elapsed_ms = started.elapsed().as_millis() as u64,
            "symbol info lookup finished"
        );
        Ok(ok_envelope(&json!({ "symbols": specs })))
    }

    /// Drop every live subscription. Forwarder tasks exit once their watch
    /// sender is gone.
    pub fn reset_subscriptions(&self) -> usize {
        let cleared = self.subs.len();
        self.subs.clear();
        cleared
    }
}

fn require_symbol(cmd: &Command) -> Result<&str, ErrorResult> {
    cmd.symbol
        .as_deref()
        .filter(|s| !s.is_empty())
        .ok_or_else(|| exec_err("missing symbol"))
}

fn require_timeframe(cmd: &Command) -> Result<Timeframe, ErrorResult> {
    let raw = cmd
        .chart_tf
        .as_deref()
        .ok_or_else(|| exec_err("missing chartTF"))?;
    Timeframe::parse(raw).map_err(exec_err)
}

fn trade_request(cmd: &Command) -> Result<TradeRequest, ErrorResult> {
    let raw = cmd
        .action_type
        .as_deref()
        .ok_or_else(|| exec_err("missing actionType"))?;
    let action_type = TradeAction::parse(raw).map_err(exec_err)?;
    let needs_entry_fields = matches!(
        action_type,
        TradeAction::Buy | TradeAction::Sell | TradeAction::BuyLimit | TradeAction::SellLimit
    );
    let symbol = match &cmd.symbol {
        Some(s) if !s.is_empty() => s.clone(),
        _ if needs_entry_fields => return Err(exec_err("missing symbol")),
        _ => String::new(),
    };
    let volume = match cmd.volume {
        Some(v) => v,
        None if needs_entry_fields => return Err(exec_err("missing volume")),
        None => 0.0,
    };
    Ok(TradeRequest {
        action_type,
        symbol,
        volume,
        price: cmd.price,
        stoploss: cmd.stoploss,
        takeprofit: cmd.takeprofit,
        deviation: cmd.deviation,
        id: cmd.id,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use tb_terminal::SimTerminal;
    use tokio::sync::mpsc;
    use tokio::time::{timeout, Duration};

    fn dispatcher() -> Arc<Dispatcher> {
        Dispatcher::new(Arc::new(SimTerminal::new()), DispatcherConfig::default())
    }

    async fn next_json(rx: &mut mpsc::Receiver<Bytes>) -> Value {
        let frame = timeout(Duration::from_secs(1), rx.recv())
            .await
            .expect("result within deadline")
            .expect("channel open");
        serde_json::from_slice(&frame).expect("json frame")
    }

    fn attach_results(d: &Dispatcher) -> mpsc::Receiver<Bytes> {
        let (tx, rx) = mpsc::channel(64);
        d.results().attach_sender(tx);
        rx
    }

    #[tokio::test]
    async fn balance_returns_numeric_fields() {
        let d = dispatcher();
        let mut results = attach_results(&d);

        let ack = d.process_frame(br#"{"action":"BALANCE"}"#).await;
        assert!(ack.is_ok());
        let v = next_json(&mut results).await;
        assert_eq!(v["error"], Value::Bool(false));
        assert!(v["balance"].is_f64());
        assert!(v["equity"].is_f64());
    }

    #[tokio::test]
    async fn malformed_frame_acks_error_and_loop_survives() {
        let d = dispatcher();
        let mut results = attach_results(&d);

        let ack = d.process_frame(b"this is not json {").await;
        assert_eq!(ack, Ack::Error);
        let err = next_json(&mut results).await;
        assert_eq!(err["error"], Value::Bool(true));
        assert_eq!(err["kind"], "decode");
        assert_eq!(err["description"], "deserialization failed");
        assert_eq!(err["invalid_message"], "this is not json {");

        // the very next command is served normally
        let ack = d.process_frame(br#"{"action":"ACCOUNT"}"#).await;
        assert!(ack.is_ok());
        let v = next_json(&mut results).await;
        assert_eq!(v["error"], Value::Bool(false));
        assert_eq!(v["login"], 100_200_300);
    }

    /// SimTerminal with a deliberately slow ACCOUNT, for ordering tests.
    struct SlowAccount(SimTerminal);

    #[async_trait::async_trait]
    impl Terminal for SlowAccount {
        async fn account(&self) -> Result<tb_types::accounts::AccountSnapshot, tb_types::error::TerminalError> {
            tokio::time::sleep(Duration::from_millis(100)).await;
            self.0.account().await
        }
        async fn balance(&self) -> Result<tb_types::accounts::BalanceInfo, tb_types::error::TerminalError> {
            self.0.balance().await
        }
        async fn positions(&self) -> Result<Vec<tb_types::accounts::Position>, tb_types::error::TerminalError> {
            self.0.positions().await
        }
        async fn orders(&self) -> Result<Vec<tb_types::accounts::Order>, tb_types::error::TerminalError> {
            self.0.orders().await
        }
        async fn history_bars(
            &self,
            symbol: &str,
            timeframe: Timeframe,
            from: i64,
            to: i64,
        ) -> Result<Vec<Bar>, tb_types::error::TerminalError> {
            self.0.history_bars(symbol, timeframe, from, to).await
        }
        async fn write_history(
            &self,
            symbol: &str,
            timeframe: Timeframe,
            rows: &[Bar],
        ) -> Result<usize, tb_types::error::TerminalError> {
            self.0.write_history(symbol, timeframe, rows).await
        }
        async fn history_deals(&self, from: i64) -> Result<Vec<tb_types::accounts::Deal>, tb_types::error::TerminalError> {
            self.0.history_deals(from).await
        }
        async fn symbol_info(&self, names: &[String]) -> Result<Vec<tb_types::symbols::SymbolSpec>, tb_types::error::TerminalError> {
            self.0.symbol_info(names).await
        }
        async fn watchlist(&self) -> Result<Vec<String>, tb_types::error::TerminalError> {
            self.0.watchlist().await
        }
        async fn calendar(
            &self,
            symbol: Option<&str>,
            from: i64,
        ) -> Result<Vec<tb_types::calendar::CalendarEvent>, tb_types::error::TerminalError> {
            self.0.calendar(symbol, from).await
        }
        async fn execute(&self, req: &TradeRequest) -> Result<tb_types::trade::TradeResult, tb_types::error::TerminalError> {
            self.0.execute(req).await
        }
        fn market_stream(&self) -> tokio::sync::broadcast::Receiver<MarketUpdate> {
            self.0.market_stream()
        }
    }

    #[tokio::test]
    async fn concurrent_frames_publish_results_in_ack_order() {
        let d = Dispatcher::new(
            Arc::new(SlowAccount(SimTerminal::new())),
            DispatcherConfig::default(),
        );
        let mut results = attach_results(&d);

        // a slow ACCOUNT exchange starts first; a fast BALANCE from another
        // connection must not slip its Result in front of it
        let slow = tokio::spawn({
            let d = d.clone();
            async move { d.process_frame(br#"{"action":"ACCOUNT"}"#).await }
        });
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(d.process_frame(br#"{"action":"BALANCE"}"#).await.is_ok());
        assert!(slow.await.expect("join").is_ok());

        let first = next_json(&mut results).await;
        assert!(first.get("login").is_some(), "account result must come first");
        let second = next_json(&mut results).await;
        assert!(second.get("login").is_none());
        assert!(second["balance"].is_f64());
    }

    #[tokio::test]
    async fn unknown_action_is_structured_error() {
        let d = dispatcher();
        let mut results = attach_results(&d);

        // decodes fine, so the ack is OK and the error rides the Result channel
        let ack = d.process_frame(br#"{"action":"TELEPORT"}"#).await;
        assert!(ack.is_ok());
        let err = next_json(&mut results).await;
        assert_eq!(err["kind"], "unknown_action");
        assert!(err["description"].as_str().unwrap().contains("TELEPORT"));
    }

    #[tokio::test]
    async fn trade_pushes_result_and_event() {
        let d = dispatcher();
        let mut results = attach_results(&d);
        let (etx, mut events) = mpsc::channel(16);
        d.events().attach_sender(etx);

        let cmd = br#"{"action":"TRADE","actionType":"ORDER_TYPE_BUY","symbol":"EURUSD","volume":0.1}"#;
        assert!(d.process_frame(cmd).await.is_ok());

        let v = next_json(&mut results).await;
        assert_eq!(v["retcode"], 10009);
        assert!(v["order"].is_u64());

        let ev = next_json(&mut events).await;
        assert_eq!(ev["event"], "trade");
        assert_eq!(ev["request"]["symbol"], "EURUSD");
        assert_eq!(ev["result"]["retcode"], 10009);
    }

    #[tokio::test]
    async fn oversized_trade_rejected_without_position() {
        let d = dispatcher();
        let mut results = attach_results(&d);

        // volume_max for the seeded symbols is 500
        let cmd = br#"{"action":"TRADE","actionType":"ORDER_TYPE_BUY","symbol":"EURUSD","volume":1000.0}"#;
        assert!(d.process_frame(cmd).await.is_ok());
        let v = next_json(&mut results).await;
        assert_eq!(v["retcode"], 10014);

        assert!(d.process_frame(br#"{"action":"POSITIONS"}"#).await.is_ok());
        let v = next_json(&mut results).await;
        assert_eq!(v["positions"].as_array().unwrap().len(), 0);
    }

    #[tokio::test]
    async fn history_write_then_data_round_trip() {
        let d = dispatcher();
        let mut results = attach_results(&d);

        let write = br#"{"action":"HISTORY","actionType":"WRITE","symbol":"EURUSD","chartTF":"M1","rows":[[1700000000,1.0,1.1,0.9,1.05,3.0],[1700000060,1.05,1.2,1.0,1.1,4.0]]}"#;
        assert!(d.process_frame(write).await.is_ok());
        let v = next_json(&mut results).await;
        assert_eq!(v["rows_written"], 2);

        let read = br#"{"action":"HISTORY","actionType":"DATA","symbol":"EURUSD","chartTF":"M1","fromDate":1700000030}"#;
        assert!(d.process_frame(read).await.is_ok());
        let v = next_json(&mut results).await;
        let data = v["data"].as_array().unwrap();
        assert_eq!(data.len(), 1);
        assert_eq!(data[0][0], 1_700_000_060_i64);
    }

    #[tokio::test]
    async fn history_with_bad_timeframe_is_execution_error() {
        let d = dispatcher();
        let mut results = attach_results(&d);

        let cmd = br#"{"action":"HISTORY","actionType":"DATA","symbol":"EURUSD","chartTF":"M7"}"#;
        // well-formed json, so ack stays OK
        assert!(d.process_frame(cmd).await.is_ok());
        let err = next_json(&mut results).await;
        assert_eq!(err["kind"], "execution");
        assert!(err["description"].as_str().unwrap().contains("M7"));
    }

    #[tokio::test]
    async fn symbol_info_empty_request_lists_all() {
        let d = dispatcher();
        let mut results = attach_results(&d);

        assert!(d.process_frame(br#"{"action":"SYMBOL_INFO"}"#).await.is_ok());
        let v = next_json(&mut results).await;
        let symbols = v["symbols"].as_array().unwrap();
        assert_eq!(symbols.len(), 5);
        // decimal fields travel as strings
        assert!(symbols[0]["volume_max"].is_string());
    }

    #[tokio::test]
    async fn symbol_info_respects_result_cap() {
        let cfg = DispatcherConfig {
            symbol_info_max: 2,
            ..DispatcherConfig::default()
        };
        let d = Dispatcher::new(Arc::new(SimTerminal::new()), cfg);
        let mut results = attach_results(&d);

        assert!(d.process_frame(br#"{"action":"SYMBOL_INFO"}"#).await.is_ok());
        let v = next_json(&mut results).await;
        assert_eq!(v["symbols"].as_array().unwrap().len(), 2);
    }

    #[tokio::test]
    async fn config_then_reset_clears_subscriptions() {
        let d = dispatcher();
        let mut results = attach_results(&d);

        let cmd = br#"{"action":"CONFIG","symbol":"EURUSD","chartTF":"TICK"}"#;
        assert!(d.process_frame(cmd).await.is_ok());
        let v = next_json(&mut results).await;
        assert_eq!(v["error"], Value::Bool(false));
        assert_eq!(d.subs.len(), 1);

        assert!(d.process_frame(br#"{"action":"RESET"}"#).await.is_ok());
        let v = next_json(&mut results).await;
        assert_eq!(v["cleared"], 1);
        assert_eq!(d.subs.len(), 0);
    }

    #[tokio::test]
    async fn watchlist_and_calendar_answer() {
        let d = dispatcher();
        let mut results = attach_results(&d);

        assert!(d.process_frame(br#"{"action":"WATCHLIST"}"#).await.is_ok());
        let v = next_json(&mut results).await;
        assert!(v["symbols"].as_array().unwrap().contains(&json!("EURUSD")));

        assert!(d.process_frame(br#"{"action":"CALENDAR"}"#).await.is_ok());
        let v = next_json(&mut results).await;
        assert!(v["data"].as_array().is_some());
    }
}
