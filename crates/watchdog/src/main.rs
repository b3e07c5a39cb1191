use tb_watchdog::{PortProbe, Supervisor, WatchConfig};
use tracing::info;
use tracing::level_filters::LevelFilter;

fn env_port(name: &str, default: u16) -> u16 {
    std::env::var(name)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_max_level(LevelFilter::INFO)
        .with_target(true)
        .compact()
        .init();
    dotenvy::dotenv().ok();

    let cfg = WatchConfig::default();
    let host = std::env::var("TB_HOST").unwrap_or_else(|_| "127.0.0.1".to_string());
    let ports = vec![
        env_port("TB_PORT_COMMAND", 2201),
        env_port("TB_PORT_RESULT", 2202),
        env_port("TB_PORT_LIVE", 2203),
        env_port("TB_PORT_EVENT", 2204),
    ];
    info!(?cfg, %host, ?ports, "watchdog starting");

    let probe = PortProbe::new(host, ports);
    Supervisor::new(cfg, probe).run().await
}
