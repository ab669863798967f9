//! Background delivery of a queue's blocks to the destination store.

use crate::config::HintedHandoffConfig;
use crate::error::HhError;
use crate::publish::{PubStore, PublishError};
use crate::storage::disk::block::Block;
use crate::storage::disk::queue::Queue;
use crossbeam::channel::{Receiver, select};
use log::{debug, error, info, trace, warn};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PumpSettings {
    pub initial_backoff: Duration,
    pub max_backoff: Duration,
    pub max_attempts: u32,
    pub poll_interval: Duration,
    pub dump_per_blocks: u64,
}

impl From<&HintedHandoffConfig> for PumpSettings {
    fn from(config: &HintedHandoffConfig) -> Self {
        Self {
            initial_backoff: config.initial_backoff(),
            max_backoff: config.max_backoff(),
            max_attempts: config.max_attempts.max(1),
            poll_interval: config.poll_interval(),
            dump_per_blocks: config.dump_per_blocks.max(1),
        }
    }
}

/// Delay before retry number `retry` (zero based): doubles from `initial`, capped at `max`.
pub fn backoff_delay(initial: Duration, max: Duration, retry: u32) -> Duration {
    initial
        .checked_mul(1u32.checked_shl(retry).unwrap_or(u32::MAX))
        .unwrap_or(max)
        .min(max)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Delivery {
    Delivered,
    Failed,
    Shutdown,
}

pub struct Pump {
    queue: Arc<Queue>,
    store: Arc<dyn PubStore>,
    quit: Receiver<()>,
    settings: PumpSettings,
    delivered_since_dump: u64,
}

impl Pump {
    pub fn new(
        queue: Arc<Queue>,
        store: Arc<dyn PubStore>,
        quit: Receiver<()>,
        settings: PumpSettings,
    ) -> Self {
        Self {
            queue,
            store,
            quit,
            settings,
            delivered_since_dump: 0,
        }
    }

    pub fn spawn(self) -> Result<JoinHandle<()>, HhError> {
        thread::Builder::new()
            .name(format!("hh-pump-{}", self.queue.ident()))
            .spawn(move || self.run())
            .map_err(|e| HhError::from_io_error(e, "Failed to spawn pump thread"))
    }

    /// Waits up to `timeout`; true when shutdown was signalled instead.
    fn wait(&self, timeout: Duration) -> bool {
        select! {
            recv(self.quit) -> _ => true,
            default(timeout) => false,
        }
    }

    fn shutdown_requested(&self) -> bool {
        self.quit.try_recv().is_err_and(|e| e.is_disconnected())
    }

    fn run(mut self) {
        let ident = self.queue.ident();
        info!("queue[{ident}] pump started");

        let mut block = Block::default();
        loop {
            if self.shutdown_requested() {
                break;
            }

            match self.queue.next(&mut block) {
                Ok(()) => {
                    if self.deliver(&block) == Delivery::Shutdown {
                        break;
                    }
                }
                Err(HhError::EndOfQueue) => {
                    trace!("queue[{ident}] idle");
                    if self.wait(self.settings.poll_interval) {
                        break;
                    }
                }
                Err(HhError::QueueNotOpen) => break,
                Err(e) if e.is_fatal() => {
                    error!("queue[{ident}] pump stopped: {e}");
                    break;
                }
                Err(e) => {
                    error!(
                        "queue[{ident}] unreadable block at {}: {e}",
                        self.queue.read_position()
                    );
                    if let Err(skip_err) = self.queue.skip_cursor_segment() {
                        error!("queue[{ident}] skip segment: {skip_err}");
                        if self.wait(self.settings.poll_interval) {
                            break;
                        }
                    }
                }
            }
        }

        if let Err(e) = self.queue.dump() {
            error!("queue[{ident}] final checkpoint: {e}");
        }
        let stats = self.queue.stats();
        info!(
            "queue[{ident}] pump stopped: delivered={} failed={} retries={} inflight={}",
            stats.delivered, stats.failed, stats.retries, stats.inflight
        );
    }

    fn deliver(&mut self, block: &Block) -> Delivery {
        let ct = self.queue.cluster_topic();
        let mut last_err: Option<PublishError> = None;

        for attempt in 0..self.settings.max_attempts {
            if attempt > 0 {
                self.queue.record_retry();
                let delay = backoff_delay(
                    self.settings.initial_backoff,
                    self.settings.max_backoff,
                    attempt - 1,
                );
                if self.wait(delay) {
                    // Left uncommitted; redelivered after restart.
                    return Delivery::Shutdown;
                }
            }

            match self
                .store
                .sync_pub(&ct.cluster, &ct.topic, &block.key, &block.value)
            {
                Ok((partition, offset)) => {
                    debug!("queue[{ct}] delivered to partition {partition} offset {offset}");
                    self.queue.commit_position();
                    self.queue.record_delivered();
                    self.delivered_since_dump += 1;
                    if self.delivered_since_dump >= self.settings.dump_per_blocks {
                        self.delivered_since_dump = 0;
                        if let Err(e) = self.queue.dump() {
                            error!("queue[{ct}] checkpoint: {e}");
                        }
                    }
                    return Delivery::Delivered;
                }
                Err(e) if e.is_permanent() => {
                    warn!("queue[{ct}] dropping block: {e}");
                    self.queue.commit_position();
                    self.queue.record_failed();
                    return Delivery::Failed;
                }
                Err(e) => {
                    debug!("queue[{ct}] attempt {} failed: {e}", attempt + 1);
                    last_err = Some(e);
                }
            }
        }

        let reason = last_err.map(|e| e.to_string()).unwrap_or_default();
        match self.queue.rollback(block) {
            Ok(()) => warn!(
                "queue[{ct}] rolled back block after {} attempts: {reason}",
                self.settings.max_attempts
            ),
            Err(e) => warn!("queue[{ct}] skipped block, {e}: {reason}"),
        }
        self.queue.record_failed();
        Delivery::Failed
    }
}
