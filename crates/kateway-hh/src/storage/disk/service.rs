use crate::ClusterTopic;
use crate::config::HintedHandoffConfig;
use crate::error::HhError;
use crate::publish::PubStore;
use crate::storage::HintedHandoff;
use crate::storage::disk::block::Block;
use crate::storage::disk::common::{CURSOR_FILE, list_segment_ids};
use crate::storage::disk::lock::DirectoryLock;
use crate::storage::disk::pump::PumpSettings;
use crate::storage::disk::queue::{Queue, QueueStats};
use dashmap::DashMap;
use dashmap::mapref::entry::Entry::{Occupied, Vacant};
use log::{error, info, warn};
use std::path::Path;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

/// Disk-backed hinted handoff for every destination of one gateway.
///
/// Owns `data_dir` exclusively for its lifetime, keeps one [`Queue`] and one
/// pump per (cluster, topic) and opens them on first use.
pub struct DiskService {
    config: HintedHandoffConfig,
    store: Arc<dyn PubStore>,
    queues: DashMap<ClusterTopic, Arc<Queue>>,
    running: AtomicBool,
    _lock: DirectoryLock,
}

impl DiskService {
    pub fn new(config: HintedHandoffConfig, store: Arc<dyn PubStore>) -> Result<Self, HhError> {
        config.validate()?;
        let lock = DirectoryLock::acquire(&config.data_dir)?;
        Ok(DiskService {
            config,
            store,
            queues: DashMap::new(),
            running: AtomicBool::new(false),
            _lock: lock,
        })
    }

    pub fn config(&self) -> &HintedHandoffConfig {
        &self.config
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::Acquire)
    }

    pub fn queue(&self, cluster: &str, topic: &str) -> Option<Arc<Queue>> {
        self.queues
            .get(&ClusterTopic::new(cluster, topic))
            .map(|entry| Arc::clone(entry.value()))
    }

    /// Counters of every open destination, ordered by destination.
    pub fn stats(&self) -> Vec<(ClusterTopic, QueueStats)> {
        let mut stats: Vec<_> = self
            .queues
            .iter()
            .map(|entry| (entry.key().clone(), entry.value().stats()))
            .collect();
        stats.sort_by(|a, b| a.0.cmp(&b.0));
        stats
    }

    /// Hand every rolled-back block of a destination back to its pump.
    pub fn requeue_rolled_back(&self, cluster: &str, topic: &str) -> usize {
        self.queue(cluster, topic)
            .map(|queue| queue.requeue_rolled_back())
            .unwrap_or(0)
    }

    fn open_queue(&self, ct: ClusterTopic) -> Result<Arc<Queue>, HhError> {
        match self.queues.entry(ct) {
            Occupied(entry) => Ok(Arc::clone(entry.get())),
            Vacant(entry) => {
                let queue = Queue::open(&self.config, entry.key().clone())?;
                queue.start_pump(Arc::clone(&self.store), PumpSettings::from(&self.config))?;
                entry.insert(Arc::clone(&queue));
                Ok(queue)
            }
        }
    }

    /// Every `<cluster>/<topic>` directory under the data dir that holds
    /// segments or a cursor.
    #[tracing::instrument(level = "debug", skip(self))]
    pub fn discover_queues(&self) -> Result<Vec<ClusterTopic>, HhError> {
        discover_queues(&self.config.data_dir)
    }
}

/// Queues left under `data_dir`, sorted. Dot-prefixed names are valid topics.
pub fn discover_queues(data_dir: &Path) -> Result<Vec<ClusterTopic>, HhError> {
    let mut found = Vec::new();

    for cluster_entry in read_subdirs(data_dir)? {
        let Some(cluster) = cluster_entry.file_name().and_then(|n| n.to_str()) else {
            continue;
        };
        for topic_entry in read_subdirs(&cluster_entry)? {
            let Some(topic) = topic_entry.file_name().and_then(|n| n.to_str()) else {
                continue;
            };
            let has_segments = list_segment_ids(&topic_entry)
                .map(|ids| !ids.is_empty())
                .unwrap_or(false);
            if has_segments || topic_entry.join(CURSOR_FILE).exists() {
                found.push(ClusterTopic::new(cluster, topic));
            }
        }
    }

    found.sort();
    tracing::debug!(count = found.len(), "Queue discovery completed");
    Ok(found)
}

fn read_subdirs(dir: &Path) -> Result<Vec<std::path::PathBuf>, HhError> {
    let entries = std::fs::read_dir(dir)
        .map_err(|e| HhError::from_io_error(e, "Failed to read data directory"))?;

    let mut dirs = Vec::new();
    for entry in entries.flatten() {
        if entry.file_type().is_ok_and(|t| t.is_dir()) {
            dirs.push(entry.path());
        }
    }
    Ok(dirs)
}

impl HintedHandoff for DiskService {
    #[tracing::instrument(level = "info", skip(self), fields(data_dir = %self.config.data_dir.display()))]
    fn start(&self) -> Result<(), HhError> {
        self.queues.retain(|_, queue| queue.is_open());
        self.running.store(true, Ordering::Release);

        for ct in self.discover_queues()? {
            // A damaged queue stays on disk for the operator; the rest still start.
            if let Err(e) = self.open_queue(ct.clone()) {
                error!("Failed to recover queue {ct}: {e}");
            }
        }
        info!("Hinted handoff started with {} queues", self.queues.len());
        Ok(())
    }

    #[tracing::instrument(level = "info", skip(self))]
    fn stop(&self) {
        if !self.running.swap(false, Ordering::AcqRel) {
            return;
        }
        let queues: Vec<Arc<Queue>> = self
            .queues
            .iter()
            .map(|entry| Arc::clone(entry.value()))
            .collect();

        for queue in queues {
            if let Err(e) = queue.close() {
                warn!("Failed to close queue {}: {e}", queue.ident());
            }
        }
        info!("Hinted handoff stopped");
    }

    fn append(
        &self,
        cluster: &str,
        topic: &str,
        key: &[u8],
        value: &[u8],
    ) -> Result<(), HhError> {
        if !self.is_running() {
            return Err(HhError::QueueNotOpen);
        }
        let queue = self.open_queue(ClusterTopic::new(cluster, topic))?;
        queue.append(&Block::new(key, value))
    }

    fn empty(&self, cluster: &str, topic: &str) -> bool {
        self.queue(cluster, topic)
            .map(|queue| queue.is_empty())
            .unwrap_or(true)
    }

    fn inflights(&self) -> u64 {
        self.queues
            .iter()
            .map(|entry| entry.value().stats().inflight)
            .sum()
    }
}

impl Drop for DiskService {
    fn drop(&mut self) {
        self.stop();
    }
}
