use rust_decimal::prelude::ToPrimitive;
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use tb_bus::{Dispatcher, DispatcherConfig};
use tb_terminal::{SimTerminal, Terminal};
use tb_types::data::MarketUpdate;
use tokio::net::TcpListener;
use tracing::level_filters::LevelFilter;
use tracing::{error, info};

fn env_port(name: &str, default: u16) -> u16 {
    std::env::var(name)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

fn now_ms() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as i64)
        .unwrap_or(0)
}

/// Synthetic quote walk for the sim terminal. Deterministic wobble, no
/// external feed required.
async fn run_sim_feed(sim: Arc<SimTerminal>) {
    let symbols = match sim.watchlist().await {
        Ok(s) => s,
        Err(e) => {
            error!(error = %e, "sim feed could not list symbols");
            return;
        }
    };
    let mut step = 0u64;
    loop {
        tokio::time::sleep(Duration::from_millis(250)).await;
        step = step.wrapping_add(1);
        for (i, symbol) in symbols.iter().enumerate() {
            let specs = match sim.symbol_info(std::slice::from_ref(symbol)).await {
                Ok(s) => s,
                Err(_) => continue,
            };
            let Some(spec) = specs.first() else { continue };
            let bid = spec.bid.to_f64().unwrap_or(1.0);
            let ask = spec.ask.to_f64().unwrap_or(1.0);
            let spread = (ask - bid).abs();
            // a slow sine walk, phase-shifted per symbol
            let wobble = ((step as f64 / 20.0) + i as f64).sin() * spread * 4.0;
            sim.push_update(MarketUpdate {
                symbol: symbol.clone(),
                time_ms: now_ms(),
                bid: bid + wobble,
                ask: ask + wobble,
            });
        }
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_max_level(LevelFilter::INFO)
        .with_target(true)
        .compact()
        .init();
    dotenvy::dotenv().ok();

    let host = std::env::var("TB_HOST").unwrap_or_else(|_| "127.0.0.1".to_string());
    let command_port = env_port("TB_PORT_COMMAND", 2201);
    let result_port = env_port("TB_PORT_RESULT", 2202);
    let live_port = env_port("TB_PORT_LIVE", 2203);
    let event_port = env_port("TB_PORT_EVENT", 2204);

    let sim = Arc::new(SimTerminal::new());
    let dispatcher = Dispatcher::new(sim.clone(), DispatcherConfig::default());

    let command = TcpListener::bind((host.as_str(), command_port)).await?;
    let result = TcpListener::bind((host.as_str(), result_port)).await?;
    let live = TcpListener::bind((host.as_str(), live_port)).await?;
    let event = TcpListener::bind((host.as_str(), event_port)).await?;
    info!(%host, command_port, result_port, live_port, event_port, "bridge listening");

    tokio::spawn(dispatcher.clone().run_live_loop());
    tokio::spawn(run_sim_feed(sim));

    let d = dispatcher.clone();
    tokio::spawn(async move {
        loop {
            match result.accept().await {
                Ok((stream, peer)) => {
                    info!(%peer, "result client attached");
                    d.results().attach(stream);
                }
                Err(e) => error!(error = %e, "result accept failed"),
            }
        }
    });
    let d = dispatcher.clone();
    tokio::spawn(async move {
        loop {
            match live.accept().await {
                Ok((stream, peer)) => {
                    info!(%peer, "live client attached");
                    d.live().attach(stream);
                }
                Err(e) => error!(error = %e, "live accept failed"),
            }
        }
    });
    let d = dispatcher.clone();
    tokio::spawn(async move {
        loop {
            match event.accept().await {
                Ok((stream, peer)) => {
                    info!(%peer, "event client attached");
                    d.events().attach(stream);
                }
                Err(e) => error!(error = %e, "event accept failed"),
            }
        }
    });

    loop {
        match command.accept().await {
            Ok((stream, _)) => {
                tokio::spawn(dispatcher.clone().run_command_client(stream));
            }
            Err(e) => error!(error = %e, "command accept failed"),
        }
    }
}
