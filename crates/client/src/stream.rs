use crate::ClientError;
use serde_json::Value;
use tb_types::keys::SubKey;
use tb_types::wire::LiveTick;
use tokio::sync::broadcast;
use tracing::warn;

/// Iterator-style view of the Live channel. A lagged reader skips the
/// overrun and keeps going; the stream only ends with the connection.
pub struct LiveStream {
    rx: broadcast::Receiver<LiveTick>,
    filter: Option<SubKey>,
}

impl LiveStream {
    pub(crate) fn new(rx: broadcast::Receiver<LiveTick>, filter: Option<SubKey>) -> Self {
        Self { rx, filter }
    }

    pub async fn next(&mut self) -> Result<LiveTick, ClientError> {
        loop {
            match self.rx.recv().await {
                Ok(tick) => {
                    if self.matches(&tick) {
                        return Ok(tick);
                    }
                }
                Err(broadcast::error::RecvError::Lagged(missed)) => {
                    warn!(missed, "live stream lagged");
                }
                Err(broadcast::error::RecvError::Closed) => return Err(ClientError::Closed),
            }
        }
    }

    fn matches(&self, tick: &LiveTick) -> bool {
        match &self.filter {
            Some(key) => tick.symbol == key.symbol && tick.timeframe == key.timeframe.as_str(),
            None => true,
        }
    }
}

/// Iterator-style view of the Event channel.
pub struct EventStream {
    rx: broadcast::Receiver<Value>,
}

impl EventStream {
    pub(crate) fn new(rx: broadcast::Receiver<Value>) -> Self {
        Self { rx }
    }

    pub async fn next(&mut self) -> Result<Value, ClientError> {
        loop {
            match self.rx.recv().await {
                Ok(event) => return Ok(event),
                Err(broadcast::error::RecvError::Lagged(missed)) => {
                    warn!(missed, "event stream lagged");
                }
                Err(broadcast::error::RecvError::Closed) => return Err(ClientError::Closed),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tb_types::keys::Timeframe;

    fn tick(symbol: &str, timeframe: &str) -> LiveTick {
        LiveTick {
            symbol: symbol.to_string(),
            timeframe: timeframe.to_string(),
            status: "tick".to_string(),
            data: vec![0.0, 1.0, 1.1],
        }
    }

    #[tokio::test]
    async fn filter_passes_matching_key_only() {
        let (tx, rx) = broadcast::channel(8);
        let mut stream = LiveStream::new(rx, Some(SubKey::new("EURUSD", Timeframe::Tick)));
        tx.send(tick("GBPUSD", "TICK")).unwrap();
        tx.send(tick("EURUSD", "M1")).unwrap();
        tx.send(tick("EURUSD", "TICK")).unwrap();

        let got = stream.next().await.unwrap();
        assert_eq!(got.symbol, "EURUSD");
        assert_eq!(got.timeframe, "TICK");
    }

    #[tokio::test]
    async fn unfiltered_stream_sees_everything() {
        let (tx, rx) = broadcast::channel(8);
        let mut stream = LiveStream::new(rx, None);
        tx.send(tick("GBPUSD", "TICK")).unwrap();
        assert_eq!(stream.next().await.unwrap().symbol, "GBPUSD");
    }

    #[tokio::test]
    async fn closed_sender_ends_stream() {
        let (tx, rx) = broadcast::channel::<LiveTick>(8);
        let mut stream = LiveStream::new(rx, None);
        drop(tx);
        assert!(matches!(stream.next().await, Err(ClientError::Closed)));
    }
}
