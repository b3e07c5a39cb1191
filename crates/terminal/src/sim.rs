//! In-memory terminal used by the server's sim mode and by tests.

use crate::Terminal;
use async_trait::async_trait;
use chrono::Utc;
use dashmap::DashMap;
use rust_decimal::prelude::ToPrimitive;
use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;
use tb_types::accounts::{AccountSnapshot, BalanceInfo, Deal, Order, Position, PositionSide};
use tb_types::calendar::CalendarEvent;
use tb_types::data::{Bar, MarketUpdate};
use tb_types::error::TerminalError;
use tb_types::keys::Timeframe;
use tb_types::symbols::SymbolSpec;
use tb_types::trade::{retcode, TradeAction, TradeRequest, TradeResult};
use tokio::sync::broadcast;
use tracing::{debug, info};

#[derive(Debug, Clone)]
struct AccountState {
    login: u64,
    name: String,
    server: String,
    currency: String,
    leverage: u32,
    balance: f64,
    margin: f64,
}

pub struct SimTerminal {
    account: Mutex<AccountState>,
    symbols: DashMap<String, SymbolSpec>,
    positions: DashMap<u64, Position>,
    orders: DashMap<u64, Order>,
    deals: Mutex<Vec<Deal>>,
    history: DashMap<(String, Timeframe), Vec<Bar>>,
    calendar: Mutex<Vec<CalendarEvent>>,
    next_ticket: AtomicU64,
    feed_tx: broadcast::Sender<MarketUpdate>,
}

fn fx_symbol(symbol: &str, base: &str, quote: &str, digits: u32, bid: Decimal) -> SymbolSpec {
    let tick_size = Decimal::new(1, digits);
    SymbolSpec {
        symbol: symbol.to_string(),
        description: format!("{base} vs {quote}"),
        base_currency: base.to_string(),
        quote_currency: quote.to_string(),
        digits,
        contract_size: dec!(100000),
        tick_value: dec!(1),
        tick_size,
        volume_min: dec!(0.01),
        volume_max: dec!(500),
        bid,
        ask: bid + tick_size * dec!(2),
    }
}

impl SimTerminal {
    pub fn new() -> Self {
        let (feed_tx, _) = broadcast::channel(1024);
        let sim = Self {
            account: Mutex::new(AccountState {
                login: 100_200_300,
                name: "Sim Account".to_string(),
                server: "TradeBridge-Sim".to_string(),
                currency: "USD".to_string(),
                leverage: 100,
                balance: 10_000.0,
                margin: 0.0,
            }),
            symbols: DashMap::new(),
            positions: DashMap::new(),
            orders: DashMap::new(),
            deals: Mutex::new(Vec::new()),
            history: DashMap::new(),
            calendar: Mutex::new(Vec::new()),
            next_ticket: AtomicU64::new(1),
            feed_tx,
        };
        for spec in [
            fx_symbol("EURUSD", "EUR", "USD", 5, dec!(1.08501)),
            fx_symbol("GBPUSD", "GBP", "USD", 5, dec!(1.27210)),
            fx_symbol("USDJPY", "USD", "JPY", 3, dec!(149.512)),
            fx_symbol("XAUUSD", "XAU", "USD", 2, dec!(2412.37)),
            fx_symbol("BTCUSD", "BTC", "USD", 2, dec!(64120.50)),
        ] {
            sim.symbols.insert(spec.symbol.clone(), spec);
        }
        sim
    }

    pub fn add_symbol(&self, spec: SymbolSpec) {
        self.symbols.insert(spec.symbol.clone(), spec);
    }

    pub fn add_calendar_event(&self, event: CalendarEvent) {
        self.calendar.lock().unwrap().push(event);
    }

    /// Inject a market update: refreshes quotes, revalues open positions and
    /// fans the update out to the live feed.
    pub fn push_update(&self, update: MarketUpdate) {
        if let Some(mut spec) = self.symbols.get_mut(&update.symbol) {
            let spread = spec.ask - spec.bid;
            if let Ok(bid) = Decimal::try_from(update.bid) {
                spec.bid = bid;
                spec.ask = bid + spread;
            }
        }
        for mut pos in self.positions.iter_mut() {
            if pos.symbol != update.symbol {
                continue;
            }
            let contract = self
                .symbols
                .get(&pos.symbol)
                .and_then(|s| s.contract_size.to_f64())
                .unwrap_or(1.0);
            match pos.side {
                PositionSide::Buy => {
                    pos.current_price = update.bid;
                    pos.profit = (update.bid - pos.open_price) * contract * pos.volume;
                }
                PositionSide::Sell => {
                    pos.current_price = update.ask;
                    pos.profit = (pos.open_price - update.ask) * contract * pos.volume;
                }
            }
        }
        // no receivers is fine; the feed is best-effort
        let _ = self.feed_tx.send(update);
    }

    fn floating_profit(&self) -> f64 {
        self.positions.iter().map(|p| p.profit).sum()
    }

    fn next_ticket(&self) -> u64 {
        self.next_ticket.fetch_add(1, Ordering::SeqCst)
    }

    fn snapshot(&self) -> AccountSnapshot {
        let acct = self.account.lock().unwrap().clone();
        let equity = acct.balance + self.floating_profit();
        AccountSnapshot {
            login: acct.login,
            name: acct.name,
            server: acct.server,
            currency: acct.currency,
            leverage: acct.leverage,
            balance: acct.balance,
            equity,
            margin: acct.margin,
            margin_free: equity - acct.margin,
            trade_allowed: true,
        }
    }

    fn market_entry(&self, req: &TradeRequest, spec: &SymbolSpec) -> TradeResult {
        let volume = match Decimal::try_from(req.volume) {
            Ok(v) if v >= spec.volume_min && v <= spec.volume_max => v,
            _ => return TradeResult::new(retcode::INVALID_VOLUME, None),
        };
        let (side, open_price) = match req.action_type {
            TradeAction::Buy => (PositionSide::Buy, spec.ask),
            _ => (PositionSide::Sell, spec.bid),
        };
        let open_price = open_price.to_f64().unwrap_or(0.0);
        let contract = spec.contract_size.to_f64().unwrap_or(1.0);
        let required_margin = {
            let acct = self.account.lock().unwrap();
            open_price * contract * req.volume / f64::from(acct.leverage.max(1))
        };
        {
            let mut acct = self.account.lock().unwrap();
            let equity = acct.balance + self.floating_profit();
            if equity - acct.margin < required_margin {
                return TradeResult::new(retcode::NO_MONEY, None);
            }
            acct.margin += required_margin;
        }
        let ticket = self.next_ticket();
        let now = Utc::now().timestamp();
        self.positions.insert(
            ticket,
            Position {
                id: ticket,
                symbol: req.symbol.clone(),
                side,
                volume: volume.to_f64().unwrap_or(req.volume),
                open_price,
                current_price: open_price,
                stoploss: req.stoploss.unwrap_or(0.0),
                takeprofit: req.takeprofit.unwrap_or(0.0),
                profit: 0.0,
                time: now,
            },
        );
        self.deals.lock().unwrap().push(Deal {
            ticket,
            symbol: req.symbol.clone(),
            deal_type: match side {
                PositionSide::Buy => "DEAL_TYPE_BUY".to_string(),
                PositionSide::Sell => "DEAL_TYPE_SELL".to_string(),
            },
            volume: req.volume,
            price: open_price,
            profit: 0.0,
            time: now,
        });
        info!(ticket, symbol = %req.symbol, volume = req.volume, "sim: position opened");
        TradeResult::new(retcode::DONE, Some(ticket))
    }

    fn pending_entry(&self, req: &TradeRequest) -> TradeResult {
        let Some(price) = req.price else {
            return TradeResult::new(retcode::INVALID_PRICE, None);
        };
        let ticket = self.next_ticket();
        self.orders.insert(
            ticket,
            Order {
                id: ticket,
                symbol: req.symbol.clone(),
                order_type: match req.action_type {
                    TradeAction::BuyLimit => "ORDER_TYPE_BUY_LIMIT".to_string(),
                    _ => "ORDER_TYPE_SELL_LIMIT".to_string(),
                },
                volume: req.volume,
                open_price: price,
                stoploss: req.stoploss.unwrap_or(0.0),
                takeprofit: req.takeprofit.unwrap_or(0.0),
                time_setup: Utc::now().timestamp(),
            },
        );
        TradeResult::new(retcode::DONE, Some(ticket))
    }

    fn close_position(&self, req: &TradeRequest) -> TradeResult {
        let Some(id) = req.id else {
            return TradeResult::new(retcode::INVALID_REQUEST, None);
        };
        let Some((_, pos)) = self.positions.remove(&id) else {
            return TradeResult::new(retcode::INVALID_REQUEST, None);
        };
        let now = Utc::now().timestamp();
        {
            let mut acct = self.account.lock().unwrap();
            acct.balance += pos.profit;
            let contract = self
                .symbols
                .get(&pos.symbol)
                .and_then(|s| s.contract_size.to_f64())
                .unwrap_or(1.0);
            let released = pos.open_price * contract * pos.volume / f64::from(acct.leverage.max(1));
            acct.margin = (acct.margin - released).max(0.0);
        }
        self.deals.lock().unwrap().push(Deal {
            ticket: pos.id,
            symbol: pos.symbol.clone(),
            deal_type: "DEAL_TYPE_CLOSE".to_string(),
            volume: pos.volume,
            price: pos.current_price,
            profit: pos.profit,
            time: now,
        });
        info!(ticket = pos.id, profit = pos.profit, "sim: position closed");
        TradeResult::new(retcode::DONE, Some(pos.id))
    }

    fn modify_position(&self, req: &TradeRequest) -> TradeResult {
        let Some(id) = req.id else {
            return TradeResult::new(retcode::INVALID_REQUEST, None);
        };
        match self.positions.get_mut(&id) {
            Some(mut pos) => {
                if let Some(sl) = req.stoploss {
                    pos.stoploss = sl;
                }
                if let Some(tp) = req.takeprofit {
                    pos.takeprofit = tp;
                }
                TradeResult::new(retcode::DONE, Some(id))
            }
            None => TradeResult::new(retcode::INVALID_REQUEST, None),
        }
    }

    fn cancel_order(&self, req: &TradeRequest) -> TradeResult {
        match req.id.and_then(|id| self.orders.remove(&id)) {
            Some((id, _)) => TradeResult::new(retcode::DONE, Some(id)),
            None => TradeResult::new(retcode::INVALID_REQUEST, None),
        }
    }
}

impl Default for SimTerminal {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Terminal for SimTerminal {
    async fn account(&self) -> Result<AccountSnapshot, TerminalError> {
        Ok(self.snapshot())
    }

    async fn balance(&self) -> Result<BalanceInfo, TerminalError> {
        let snap = self.snapshot();
        Ok(BalanceInfo {
            balance: snap.balance,
            equity: snap.equity,
            margin: snap.margin,
            margin_free: snap.margin_free,
        })
    }

    async fn positions(&self) -> Result<Vec<Position>, TerminalError> {
        let mut out: Vec<Position> = self.positions.iter().map(|p| p.value().clone()).collect();
        out.sort_by_key(|p| p.id);
        Ok(out)
    }

    async fn orders(&self) -> Result<Vec<Order>, TerminalError> {
        let mut out: Vec<Order> = self.orders.iter().map(|o| o.value().clone()).collect();
        out.sort_by_key(|o| o.id);
        Ok(out)
    }

    async fn history_bars(
        &self,
        symbol: &str,
        timeframe: Timeframe,
        from: i64,
        to: i64,
    ) -> Result<Vec<Bar>, TerminalError> {
        if !self.symbols.contains_key(symbol) {
            return Err(TerminalError::UnknownSymbol(symbol.to_string()));
        }
        let bars = self
            .history
            .get(&(symbol.to_string(), timeframe))
            .map(|b| {
                b.iter()
                    .filter(|bar| bar.time >= from && bar.time <= to)
                    .copied()
                    .collect()
            })
            .unwrap_or_default();
        Ok(bars)
    }

    async fn write_history(
        &self,
        symbol: &str,
        timeframe: Timeframe,
        rows: &[Bar],
    ) -> Result<usize, TerminalError> {
        if !self.symbols.contains_key(symbol) {
            return Err(TerminalError::UnknownSymbol(symbol.to_string()));
        }
        let mut entry = self
            .history
            .entry((symbol.to_string(), timeframe))
            .or_default();
        entry.extend_from_slice(rows);
        entry.sort_by_key(|b| b.time);
        entry.dedup_by_key(|b| b.time);
        debug!(symbol, %timeframe, rows = rows.len(), "sim: history written");
        Ok(rows.len())
    }

    async fn history_deals(&self, from: i64) -> Result<Vec<Deal>, TerminalError> {
        Ok(self
            .deals
            .lock()
            .unwrap()
            .iter()
            .filter(|d| d.time >= from)
            .cloned()
            .collect())
    }

    async fn symbol_info(&self, names: &[String]) -> Result<Vec<SymbolSpec>, TerminalError> {
        let mut out = Vec::new();
        if names.is_empty() {
            for spec in self.symbols.iter() {
                out.push(spec.value().clone());
            }
            out.sort_by(|a, b| a.symbol.cmp(&b.symbol));
        } else {
            for name in names {
                // unselected/unknown symbols are skipped, not errored
                if let Some(spec) = self.symbols.get(name) {
                    out.push(spec.value().clone());
                }
            }
        }
        Ok(out)
    }

    async fn watchlist(&self) -> Result<Vec<String>, TerminalError> {
        let mut names: Vec<String> = self.symbols.iter().map(|s| s.value().symbol.clone()).collect();
        names.sort();
        Ok(names)
    }

    async fn calendar(
        &self,
        symbol: Option<&str>,
        from: i64,
    ) -> Result<Vec<CalendarEvent>, TerminalError> {
        let currencies: Option<(String, String)> = match symbol {
            Some(name) => {
                let spec = self
                    .symbols
                    .get(name)
                    .ok_or_else(|| TerminalError::UnknownSymbol(name.to_string()))?;
                Some((spec.base_currency.clone(), spec.quote_currency.clone()))
            }
            None => None,
        };
        Ok(self
            .calendar
            .lock()
            .unwrap()
            .iter()
            .filter(|e| e.time >= from)
            .filter(|e| match &currencies {
                Some((base, quote)) => e.currency == *base || e.currency == *quote,
                None => true,
            })
            .cloned()
            .collect())
    }

    async fn execute(&self, req: &TradeRequest) -> Result<TradeResult, TerminalError> {
        match req.action_type {
            TradeAction::Buy | TradeAction::Sell => {
                let Some(spec) = self.symbols.get(&req.symbol).map(|s| s.value().clone()) else {
                    return Ok(TradeResult::new(retcode::INVALID_REQUEST, None));
                };
                Ok(self.market_entry(req, &spec))
            }
            TradeAction::BuyLimit | TradeAction::SellLimit => {
                if !self.symbols.contains_key(&req.symbol) {
                    return Ok(TradeResult::new(retcode::INVALID_REQUEST, None));
                }
                Ok(self.pending_entry(req))
            }
            TradeAction::PositionModify => Ok(self.modify_position(req)),
            TradeAction::PositionCloseId => Ok(self.close_position(req)),
            TradeAction::OrderCancel => Ok(self.cancel_order(req)),
        }
    }

    fn market_stream(&self) -> broadcast::Receiver<MarketUpdate> {
        self.feed_tx.subscribe()
    }
}
