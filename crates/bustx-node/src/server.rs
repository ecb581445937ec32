//! Server run loop for bustxd

use crate::config::NodeConfig;
use bustx_core::{TransactionManager, TxnError};
use bustx_frame::Frame;
use bytes::Bytes;
use std::fmt;
use std::future::Future;
use std::time::{Duration, Instant};
use thiserror::Error;
use tokio::sync::mpsc;
use tokio::time::{interval, interval_at, MissedTickBehavior};

/// Node error types
#[derive(Debug, Error)]
pub enum NodeError {
    /// IO error
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    /// Config file could not be parsed
    #[error("config error: {0}")]
    Config(#[from] serde_json::Error),
    /// Config value out of range
    #[error("invalid config: {0}")]
    InvalidConfig(String),
    /// Transaction manager error
    #[error("transaction error: {0}")]
    Transaction(#[from] TxnError),
    /// Outbound channel receiver dropped
    #[error("outbound channel closed")]
    OutboundClosed,
}

/// Result type for node operations
pub type NodeResult<T> = Result<T, NodeError>;

/// Cost of one loop path in microseconds
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CostStats {
    /// Samples recorded
    pub count: u64,
    /// Cheapest sample
    pub min_us: u64,
    /// Most expensive sample
    pub max_us: u64,
    /// Latest sample
    pub last_us: u64,
    /// Sum of all samples
    pub total_us: u64,
}

impl CostStats {
    /// Record one sample
    pub fn record(&mut self, elapsed: Duration) {
        let us = u64::try_from(elapsed.as_micros()).unwrap_or(u64::MAX);
        self.min_us = if self.count == 0 { us } else { self.min_us.min(us) };
        self.max_us = self.max_us.max(us);
        self.last_us = us;
        self.total_us = self.total_us.saturating_add(us);
        self.count += 1;
    }

    /// Mean sample
    pub fn mean_us(&self) -> u64 {
        if self.count == 0 {
            return 0;
        }
        self.total_us / self.count
    }
}

impl fmt::Display for CostStats {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "count={} min={}us max={}us last={}us mean={}us",
            self.count,
            self.min_us,
            self.max_us,
            self.last_us,
            self.mean_us()
        )
    }
}

/// Run loop counters
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct LoopStats {
    /// Inbound frame handling
    pub proc: CostStats,
    /// Timer ticks
    pub tick: CostStats,
    /// Inbound buffers that were not frames
    pub decode_failures: u64,
    /// Frames the manager rejected
    pub rejected: u64,
}

impl fmt::Display for LoopStats {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "proc[{}] tick[{}] decode_failures={} rejected={}",
            self.proc, self.tick, self.decode_failures, self.rejected
        )
    }
}

/// Transaction server
///
/// Owns the manager and drives it from the inbound channel and the timer
/// tick on a single task.
pub struct Server {
    config: NodeConfig,
    manager: TransactionManager,
    inbox: mpsc::Receiver<Bytes>,
    outbound: mpsc::Sender<Frame>,
    stats: LoopStats,
}

impl Server {
    /// Create a server
    pub fn new(
        config: NodeConfig,
        manager: TransactionManager,
        inbox: mpsc::Receiver<Bytes>,
        outbound: mpsc::Sender<Frame>,
    ) -> Self {
        Self {
            config,
            manager,
            inbox,
            outbound,
            stats: LoopStats::default(),
        }
    }

    /// Transaction manager
    pub fn manager(&self) -> &TransactionManager {
        &self.manager
    }

    /// Run loop counters
    pub fn loop_stats(&self) -> &LoopStats {
        &self.stats
    }

    /// Run until `shutdown` resolves or the inbound channel closes
    pub async fn run<F>(&mut self, shutdown: F) -> NodeResult<()>
    where
        F: Future<Output = ()>,
    {
        tracing::info!(
            id = self.config.id,
            env = %self.config.runtime_env,
            tick_ms = self.config.tick_ms,
            "server running"
        );

        tokio::pin!(shutdown);

        let mut ticker = interval(self.config.tick_interval());
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let stats_period = self.config.stats_interval();
        let mut stats_ticker =
            interval_at(tokio::time::Instant::now() + stats_period, stats_period);

        loop {
            tokio::select! {
                _ = &mut shutdown => {
                    tracing::info!("Shutdown signal received");
                    break;
                }
                received = self.inbox.recv() => match received {
                    Some(data) => self.on_frame(data).await?,
                    None => {
                        tracing::info!("Inbound channel closed");
                        break;
                    }
                },
                _ = ticker.tick() => self.on_tick().await?,
                _ = stats_ticker.tick() => self.report(),
            }
        }

        self.report();
        Ok(())
    }

    /// Log manager and loop statistics
    pub fn report(&self) {
        self.manager.log_statistics();
        tracing::info!(
            proc = %self.stats.proc,
            tick = %self.stats.tick,
            decode_failures = self.stats.decode_failures,
            rejected = self.stats.rejected,
            "loop statistic"
        );
    }

    async fn on_frame(&mut self, data: Bytes) -> NodeResult<()> {
        let started = Instant::now();

        match Frame::decode(data) {
            Ok(frame) => {
                if let Err(e) = self.manager.process_frame(&frame) {
                    self.stats.rejected += 1;
                    tracing::debug!("Frame rejected: {}", e);
                }
            }
            Err(e) => {
                self.stats.decode_failures += 1;
                tracing::warn!("Dropping undecodable frame: {}", e);
            }
        }
        self.flush().await?;

        self.stats.proc.record(started.elapsed());
        Ok(())
    }

    async fn on_tick(&mut self) -> NodeResult<()> {
        let started = Instant::now();

        let fired = self.manager.handle_timeout();
        if fired > 0 {
            tracing::debug!("Delivered {} timeouts", fired);
        }
        self.flush().await?;

        self.stats.tick.record(started.elapsed());
        Ok(())
    }

    async fn flush(&mut self) -> NodeResult<()> {
        for frame in self.manager.drain_outbox() {
            self.outbound
                .send(frame)
                .await
                .map_err(|_| NodeError::OutboundClosed)?;
        }
        Ok(())
    }
}
