//! Process watchdog for the terminal bridge: periodic health probes, a
//! small failure-counting state machine and SIGTERM-then-kill restarts.

pub mod probe;

use std::time::Duration;
use tokio::process::{Child, Command};
use tokio::time::{sleep, timeout};
use tracing::{debug, info, warn};

pub use probe::{HealthProbe, HealthSample, PortProbe, ProbeReading};

#[derive(Clone, Debug)]
pub struct WatchConfig {
    /// Seconds between probe rounds.
    pub interval: Duration,
    /// How long a SIGTERM'd process gets before the hard kill.
    pub grace: Duration,
    /// Consecutive failed rounds before a restart.
    pub max_retries: u32,
    pub command: String,
    pub args: Vec<String>,
}

fn env_parse<T: std::str::FromStr>(name: &str, default: T) -> T {
    std::env::var(name)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

impl Default for WatchConfig {
    fn default() -> Self {
        let args = std::env::var("TB_WATCH_ARGS")
            .map(|v| v.split_whitespace().map(str::to_string).collect())
            .unwrap_or_default();
        Self {
            interval: Duration::from_secs(env_parse("TB_WATCH_INTERVAL_SECS", 30)),
            grace: Duration::from_secs(env_parse("TB_WATCH_GRACE_SECS", 10)),
            max_retries: env_parse("TB_WATCH_MAX_RETRIES", 3),
            command: std::env::var("TB_WATCH_COMMAND").unwrap_or_else(|_| "tb-server".to_string()),
            args,
        }
    }
}

/// Supervision states. `Degraded` carries the consecutive failure count.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SupervisorState {
    Starting,
    Healthy,
    Degraded(u32),
    Restarting,
}

/// One probe outcome folded into the state machine. A pass always lands on
/// `Healthy`; failures accumulate until `max_retries` triggers a restart.
pub fn next_state(state: SupervisorState, healthy: bool, max_retries: u32) -> SupervisorState {
    if healthy {
        return SupervisorState::Healthy;
    }
    let failures = match state {
        SupervisorState::Degraded(n) => n + 1,
        _ => 1,
    };
    if failures >= max_retries {
        SupervisorState::Restarting
    } else {
        SupervisorState::Degraded(failures)
    }
}

/// SIGTERM the child, wait out the grace period, then kill what is left.
pub async fn stop_child(child: &mut Child, grace: Duration) {
    if let Some(pid) = child.id() {
        // tokio::process has no signal API, so go through libc
        unsafe {
            libc::kill(pid as libc::pid_t, libc::SIGTERM);
        }
        if timeout(grace, child.wait()).await.is_ok() {
            info!(pid, "terminal stopped gracefully");
            return;
        }
        warn!(pid, "grace period expired, killing");
    }
    let _ = child.kill().await;
    let _ = child.wait().await;
}

fn spawn_terminal(cfg: &WatchConfig) -> anyhow::Result<Child> {
    let child = Command::new(&cfg.command)
        .args(&cfg.args)
        .kill_on_drop(true)
        .spawn()?;
    info!(command = %cfg.command, pid = child.id(), "terminal spawned");
    Ok(child)
}

pub struct Supervisor<P: HealthProbe> {
    cfg: WatchConfig,
    probe: P,
    state: SupervisorState,
    restarts: u64,
}

impl<P: HealthProbe> Supervisor<P> {
    pub fn new(cfg: WatchConfig, probe: P) -> Self {
        Self {
            cfg,
            probe,
            state: SupervisorState::Starting,
            restarts: 0,
        }
    }

    pub fn state(&self) -> SupervisorState {
        self.state
    }

    pub fn restarts(&self) -> u64 {
        self.restarts
    }

    /// Supervise forever: spawn, probe every interval, restart on demand.
    /// An exited child skips the probe and restarts immediately.
    pub async fn run(&mut self) -> anyhow::Result<()> {
        let mut child = spawn_terminal(&self.cfg)?;
        loop {
            sleep(self.cfg.interval).await;

            if let Ok(Some(status)) = child.try_wait() {
                warn!(%status, "terminal process exited on its own");
                child = self.respawn(None).await?;
                continue;
            }

            let sample = HealthSample::new(true, self.probe.check().await);
            debug!(
                activity = sample.activity,
                responsive = sample.responsive,
                "probe round"
            );
            let next = next_state(self.state, sample.healthy(), self.cfg.max_retries);
            if next != self.state {
                info!(from = ?self.state, to = ?next, "health state changed");
            }
            if matches!(next, SupervisorState::Restarting) {
                self.state = SupervisorState::Restarting;
                child = self.respawn(Some(&mut child)).await?;
            } else {
                self.state = next;
            }
        }
    }

    async fn respawn(&mut self, old: Option<&mut Child>) -> anyhow::Result<Child> {
        if let Some(child) = old {
            stop_child(child, self.cfg.grace).await;
        }
        self.restarts += 1;
        self.state = SupervisorState::Starting;
        info!(restarts = self.restarts, "restarting terminal");
        spawn_terminal(&self.cfg)
    }
}
