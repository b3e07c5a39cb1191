use async_trait::async_trait;
use std::time::{Duration, SystemTime};
use tokio::net::TcpStream;
use tokio::time::timeout;
use tracing::debug;

/// What a probe measured and whether it counts as a pass.
#[derive(Debug, Clone, Copy)]
pub struct ProbeReading {
    /// The measured activity metric, probe-defined (reachable ports for
    /// `PortProbe`).
    pub activity: f64,
    pub responsive: bool,
}

/// One probe round. `process_present` is the supervisor's child check;
/// `activity` and `responsive` come from the probe. Samples are logged and
/// discarded.
#[derive(Debug, Clone, Copy)]
pub struct HealthSample {
    pub process_present: bool,
    pub activity: f64,
    pub responsive: bool,
    pub timestamp: SystemTime,
}

impl HealthSample {
    pub fn new(process_present: bool, reading: ProbeReading) -> Self {
        Self {
            process_present,
            activity: reading.activity,
            responsive: reading.responsive,
            timestamp: SystemTime::now(),
        }
    }

    pub fn healthy(&self) -> bool {
        self.process_present && self.responsive
    }
}

/// A health check against the supervised terminal. `responsive` means the
/// bridge looks serviceable from the outside.
#[async_trait]
pub trait HealthProbe: Send + Sync {
    async fn check(&self) -> ProbeReading;
}

/// Reachability probe: every bridge port must accept a TCP connection
/// within the per-port timeout. The reading's activity is the reachable
/// port count; a dead listener on any channel fails the whole round.
pub struct PortProbe {
    pub host: String,
    pub ports: Vec<u16>,
    pub connect_timeout: Duration,
}

impl PortProbe {
    pub fn new(host: impl Into<String>, ports: Vec<u16>) -> Self {
        Self {
            host: host.into(),
            ports,
            connect_timeout: Duration::from_secs(2),
        }
    }
}

#[async_trait]
impl HealthProbe for PortProbe {
    async fn check(&self) -> ProbeReading {
        let mut reachable = 0usize;
        for port in &self.ports {
            let attempt = timeout(
                self.connect_timeout,
                TcpStream::connect((self.host.as_str(), *port)),
            )
            .await;
            match attempt {
                Ok(Ok(_)) => reachable += 1,
                Ok(Err(e)) => debug!(port, error = %e, "port probe refused"),
                Err(_) => debug!(port, "port probe timed out"),
            }
        }
        ProbeReading {
            activity: reachable as f64,
            responsive: reachable == self.ports.len(),
        }
    }
}
