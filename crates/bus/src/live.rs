use crate::dispatcher::Dispatcher;
use std::sync::Arc;
use std::sync::Mutex;
use tb_types::data::{Bar, MarketUpdate};
use tb_types::keys::SubKey;
use tb_types::wire::LiveTick;
use tokio::sync::{broadcast, watch};
use tracing::{info, trace, warn};

/// One live subscription. `latest` is a depth-one slot: a fresh push
/// overwrites whatever the forwarder has not consumed yet, so a slow Live
/// connection always sees the newest value, never a backlog.
pub(crate) struct SubHandle {
    latest: watch::Sender<Option<LiveTick>>,
    building: Mutex<Option<Bar>>,
}

impl SubHandle {
    /// Fold one update into the current bar bucket. Returns the finished
    /// bar when the update opens a new bucket.
    fn roll(&self, update: &MarketUpdate, bucket_secs: i64) -> Option<Bar> {
        let bucket = update.time_secs().div_euclid(bucket_secs) * bucket_secs;
        let mid = (update.bid + update.ask) / 2.0;
        let mut slot = self.building.lock().unwrap();
        match slot.as_mut() {
            Some(bar) if bar.time == bucket => {
                bar.high = bar.high.max(mid);
                bar.low = bar.low.min(mid);
                bar.close = mid;
                bar.volume += 1.0;
                None
            }
            Some(bar) => {
                let done = *bar;
                *slot = Some(open_bar(bucket, mid));
                Some(done)
            }
            None => {
                *slot = Some(open_bar(bucket, mid));
                None
            }
        }
    }
}

fn open_bar(time: i64, mid: f64) -> Bar {
    Bar {
        time,
        open: mid,
        high: mid,
        low: mid,
        close: mid,
        volume: 1.0,
    }
}

impl Dispatcher {
    /// Install (or replace) the live subscription for one key. Replacing
    /// drops the previous watch sender, which stops its forwarder task.
    pub(crate) fn configure_subscription(&self, key: SubKey) {
        let (tx, mut rx) = watch::channel(None::<LiveTick>);
        let live = self.live_channel();
        let sub = key.to_string();
        tokio::spawn(async move {
            while rx.changed().await.is_ok() {
                let tick = rx.borrow_and_update().clone();
                if let Some(t) = tick {
                    live.publish(&t);
                }
            }
            trace!(sub = %sub, "live forwarder stopped");
        });
        let replaced = self
            .subs
            .insert(
                key.clone(),
                SubHandle {
                    latest: tx,
                    building: Mutex::new(None),
                },
            )
            .is_some();
        info!(sub = %key, replaced, "subscription configured");
    }

    /// Consume the terminal's market feed until it closes. Run once per
    /// dispatcher, in its own task.
    pub async fn run_live_loop(self: Arc<Self>) {
        let mut feed = self.terminal_stream();
        loop {
            match feed.recv().await {
                Ok(update) => self.on_market_update(&update),
                Err(broadcast::error::RecvError::Lagged(missed)) => {
                    warn!(missed, "market feed lagged");
                }
                Err(broadcast::error::RecvError::Closed) => {
                    info!("market feed closed");
                    break;
                }
            }
        }
    }

    pub(crate) fn on_market_update(&self, update: &MarketUpdate) {
        for entry in self.subs.iter() {
            let key = entry.key();
            if key.symbol != update.symbol {
                continue;
            }
            let handle = entry.value();
            match key.timeframe.bucket_secs() {
                None => {
                    handle.latest.send_replace(Some(LiveTick {
                        symbol: update.symbol.clone(),
                        timeframe: key.timeframe.as_str().to_string(),
                        status: "tick".to_string(),
                        data: vec![update.time_ms as f64, update.bid, update.ask],
                    }));
                }
                Some(secs) => {
                    if let Some(bar) = handle.roll(update, secs) {
                        handle.latest.send_replace(Some(LiveTick {
                            symbol: update.symbol.clone(),
                            timeframe: key.timeframe.as_str().to_string(),
                            status: "bar".to_string(),
                            data: vec![
                                bar.time as f64,
                                bar.open,
                                bar.high,
                                bar.low,
                                bar.close,
                                bar.volume,
                            ],
                        }));
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dispatcher::DispatcherConfig;
    use bytes::Bytes;
    use serde_json::Value;
    use tb_terminal::SimTerminal;
    use tb_types::keys::Timeframe;
    use tokio::sync::mpsc;
    use tokio::time::{timeout, Duration};

    fn update(symbol: &str, time_ms: i64, bid: f64, ask: f64) -> MarketUpdate {
        MarketUpdate {
            symbol: symbol.to_string(),
            time_ms,
            bid,
            ask,
        }
    }

    async fn next_json(rx: &mut mpsc::Receiver<Bytes>) -> Value {
        let frame = timeout(Duration::from_secs(1), rx.recv())
            .await
            .expect("live push within deadline")
            .expect("channel open");
        serde_json::from_slice(&frame).expect("json frame")
    }

    fn dispatcher() -> Arc<Dispatcher> {
        Dispatcher::new(Arc::new(SimTerminal::new()), DispatcherConfig::default())
    }

    #[tokio::test]
    async fn tick_subscription_pushes_three_element_payload() {
        let d = dispatcher();
        let (tx, mut live) = mpsc::channel(16);
        d.live().attach_sender(tx);

        d.configure_subscription(SubKey::new("EURUSD", Timeframe::Tick));
        d.on_market_update(&update("EURUSD", 1_700_000_000_500, 1.0850, 1.0852));

        let v = next_json(&mut live).await;
        assert_eq!(v["symbol"], "EURUSD");
        assert_eq!(v["timeframe"], "TICK");
        let data = v["data"].as_array().unwrap();
        assert_eq!(data.len(), 3);
        assert_eq!(data[1], 1.0850);
        assert_eq!(data[2], 1.0852);
    }

    #[tokio::test]
    async fn bar_subscription_pushes_on_bucket_rollover() {
        let d = dispatcher();
        let (tx, mut live) = mpsc::channel(16);
        d.live().attach_sender(tx);

        d.configure_subscription(SubKey::new("EURUSD", Timeframe::M1));
        // three updates inside one minute bucket, then one in the next
        d.on_market_update(&update("EURUSD", 1_700_000_000_000, 1.00, 1.00));
        d.on_market_update(&update("EURUSD", 1_700_000_010_000, 1.10, 1.10));
        d.on_market_update(&update("EURUSD", 1_700_000_020_000, 0.90, 0.90));
        d.on_market_update(&update("EURUSD", 1_700_000_060_000, 1.05, 1.05));

        let v = next_json(&mut live).await;
        assert_eq!(v["timeframe"], "M1");
        let data = v["data"].as_array().unwrap();
        assert_eq!(data.len(), 6);
        assert_eq!(data[0].as_f64().unwrap(), 1_699_999_980.0); // bucket start
        assert_eq!(data[1].as_f64().unwrap(), 1.00); // open
        assert_eq!(data[2].as_f64().unwrap(), 1.10); // high
        assert_eq!(data[3].as_f64().unwrap(), 0.90); // low
        assert_eq!(data[4].as_f64().unwrap(), 0.90); // close
        assert_eq!(data[5].as_f64().unwrap(), 3.0); // update count
    }

    #[tokio::test]
    async fn resubscribing_replaces_instead_of_duplicating() {
        let d = dispatcher();
        let (tx, mut live) = mpsc::channel(16);
        d.live().attach_sender(tx);

        d.configure_subscription(SubKey::new("EURUSD", Timeframe::Tick));
        d.configure_subscription(SubKey::new("EURUSD", Timeframe::Tick));
        assert_eq!(d.subs.len(), 1);

        d.on_market_update(&update("EURUSD", 1_700_000_000_000, 1.0, 1.1));
        let v = next_json(&mut live).await;
        assert_eq!(v["symbol"], "EURUSD");
        // exactly one stream per key, so no second push for the same update
        let extra = timeout(Duration::from_millis(100), live.recv()).await;
        assert!(extra.is_err());
    }

    #[tokio::test]
    async fn updates_for_other_symbols_are_ignored() {
        let d = dispatcher();
        let (tx, mut live) = mpsc::channel(16);
        d.live().attach_sender(tx);

        d.configure_subscription(SubKey::new("EURUSD", Timeframe::Tick));
        d.on_market_update(&update("GBPUSD", 1_700_000_000_000, 1.27, 1.27));

        let outcome = timeout(Duration::from_millis(100), live.recv()).await;
        assert!(outcome.is_err(), "no push expected for unsubscribed symbol");
    }

    #[tokio::test]
    async fn latest_slot_overwrites_unconsumed_ticks() {
        let d = dispatcher();
        d.configure_subscription(SubKey::new("EURUSD", Timeframe::Tick));

        // burst of updates before the forwarder runs: only the newest survives
        for i in 0..10 {
            d.on_market_update(&update("EURUSD", 1_700_000_000_000 + i, 1.0 + i as f64, 2.0));
        }
        let (tx, mut live) = mpsc::channel(16);
        d.live().attach_sender(tx);
        // one more update wakes the forwarder with the slot's latest value
        d.on_market_update(&update("EURUSD", 1_700_000_001_000, 9.0, 9.5));

        let v = next_json(&mut live).await;
        assert_eq!(v["data"][1].as_f64().unwrap(), 9.0);
    }

    #[tokio::test]
    async fn live_loop_forwards_terminal_feed() {
        let sim = Arc::new(SimTerminal::new());
        let d = Dispatcher::new(sim.clone(), DispatcherConfig::default());
        let (tx, mut live) = mpsc::channel(16);
        d.live().attach_sender(tx);
        d.configure_subscription(SubKey::new("XAUUSD", Timeframe::Tick));
        tokio::spawn(d.clone().run_live_loop());
        tokio::task::yield_now().await;

        sim.push_update(update("XAUUSD", 1_700_000_000_000, 2412.0, 2412.4));

        let v = next_json(&mut live).await;
        assert_eq!(v["symbol"], "XAUUSD");
        assert_eq!(v["status"], "tick");
    }
}
