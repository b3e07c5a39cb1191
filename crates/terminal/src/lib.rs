pub mod sim;

use async_trait::async_trait;
use tb_types::accounts::{AccountSnapshot, BalanceInfo, Deal, Order, Position};
use tb_types::calendar::CalendarEvent;
use tb_types::data::{Bar, MarketUpdate};
use tb_types::error::TerminalError;
use tb_types::keys::Timeframe;
use tb_types::symbols::SymbolSpec;
use tb_types::trade::{TradeRequest, TradeResult};
use tokio::sync::broadcast;

pub use sim::SimTerminal;

/// The dispatcher's view of the trading terminal. Implementations answer
/// command handlers and expose the market feed the live-push loop consumes.
///
/// Domain failures (unknown symbol, missing history) come back as
/// `TerminalError`; trade rejections are not errors but `TradeResult`
/// retcodes, since the submission itself completed.
#[async_trait]
pub trait Terminal: Send + Sync {
    async fn account(&self) -> Result<AccountSnapshot, TerminalError>;
    async fn balance(&self) -> Result<BalanceInfo, TerminalError>;
    async fn positions(&self) -> Result<Vec<Position>, TerminalError>;
    async fn orders(&self) -> Result<Vec<Order>, TerminalError>;
    async fn history_bars(
        &self,
        symbol: &str,
        timeframe: Timeframe,
        from: i64,
        to: i64,
    ) -> Result<Vec<Bar>, TerminalError>;
    async fn write_history(
        &self,
        symbol: &str,
        timeframe: Timeframe,
        rows: &[Bar],
    ) -> Result<usize, TerminalError>;
    async fn history_deals(&self, from: i64) -> Result<Vec<Deal>, TerminalError>;
    /// Empty `names` means all tradable symbols. Unknown names are skipped,
    /// not errored individually.
    async fn symbol_info(&self, names: &[String]) -> Result<Vec<SymbolSpec>, TerminalError>;
    async fn watchlist(&self) -> Result<Vec<String>, TerminalError>;
    async fn calendar(
        &self,
        symbol: Option<&str>,
        from: i64,
    ) -> Result<Vec<CalendarEvent>, TerminalError>;
    async fn execute(&self, req: &TradeRequest) -> Result<TradeResult, TerminalError>;
    /// Subscribe to the terminal's raw bid/ask feed.
    fn market_stream(&self) -> broadcast::Receiver<MarketUpdate>;
}
