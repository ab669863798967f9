use crate::ClusterTopic;
use crate::config::HintedHandoffConfig;
use crate::error::HhError;
use crate::publish::PubStore;
use crate::storage::disk::block::Block;
use crate::storage::disk::common::{SyncMode, ensure_directory_exists, list_segment_ids};
use crate::storage::disk::cursor::{Cursor, Position};
use crate::storage::disk::pump::{Pump, PumpSettings};
use crate::storage::disk::segment::{Segment, SegmentReader};
use crossbeam::channel::{Receiver, Sender};
use log::{debug, error, info, warn};
use parking_lot::{Mutex, RwLock};
use serde::Serialize;
use std::collections::{BTreeMap, VecDeque};
use std::ops::Bound::{Excluded, Unbounded};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::thread::JoinHandle;

/// Point-in-time copy of a queue's counters.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct QueueStats {
    pub appended: u64,
    pub delivered: u64,
    /// Blocks consumed without reaching the destination: permanent errors,
    /// exhausted retries and rejected rollbacks.
    pub failed: u64,
    pub inflight: u64,
    pub retries: u64,
    pub corrupt_segments: u64,
    pub rolled_back: u64,
    pub empty: bool,
}

#[derive(Default)]
struct Counters {
    appended: AtomicU64,
    delivered: AtomicU64,
    failed: AtomicU64,
    inflight: AtomicU64,
    retries: AtomicU64,
    corrupt_segments: AtomicU64,
    rolled_back: AtomicU64,
    empty: AtomicBool,
}

impl Counters {
    fn consume_one(&self) {
        let _ = self
            .inflight
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| Some(n.saturating_sub(1)));
    }
}

struct WriterState {
    active: Arc<Segment>,
}

struct ReaderState {
    cursor: Cursor,
    current: Option<SegmentReader>,
    /// Blocks an operator asked to retry; served ahead of the disk stream.
    replay: VecDeque<Block>,
    /// The block handed out last came from `replay` and has no disk position.
    replaying: bool,
}

/// The pending hinted-handoff traffic of one (cluster, topic) destination.
pub struct Queue {
    ct: ClusterTopic,
    dir: PathBuf,
    max_segment_size: u64,
    max_block_size: u32,
    rollback_capacity: usize,
    sync_mode: SyncMode,
    segments: RwLock<BTreeMap<u64, Arc<Segment>>>,
    writer: Mutex<WriterState>,
    reader: Mutex<ReaderState>,
    parked: Mutex<VecDeque<Block>>,
    counters: Counters,
    open: AtomicBool,
    quit_tx: Mutex<Option<Sender<()>>>,
    quit_rx: Receiver<()>,
    pump: Mutex<Option<JoinHandle<()>>>,
}

impl Queue {
    pub fn dir_for(data_dir: &Path, ct: &ClusterTopic) -> PathBuf {
        data_dir.join(&ct.cluster).join(&ct.topic)
    }

    /// Open (or create) the queue for `ct` under `config.data_dir`, recovering
    /// segments and the cursor left by a previous run.
    #[tracing::instrument(level = "info", skip(config), fields(queue = %ct))]
    pub fn open(config: &HintedHandoffConfig, ct: ClusterTopic) -> Result<Arc<Self>, HhError> {
        let dir = Self::dir_for(&config.data_dir, &ct);
        ensure_directory_exists(&dir)
            .map_err(|e| HhError::from_io_error(e, "Failed to create queue directory"))?;

        let ids = list_segment_ids(&dir)
            .map_err(|e| HhError::from_io_error(e, "Failed to list segments"))?;
        let mut segments = BTreeMap::new();
        for &id in &ids {
            segments.insert(
                id,
                Segment::open(&dir, id, config.sync_mode, config.max_block_size)?,
            );
        }

        let first_segment = ids.first().copied().unwrap_or(0);
        let cursor = Cursor::load(&dir, config.sync_mode, first_segment)?;

        // A segment left by a previous run is never appended to again, since its
        // tail may be torn; an empty one is safe to reuse.
        let active_id = match segments.last_key_value() {
            Some((&id, segment)) if segment.size() == 0 => id,
            Some((&id, _)) => id + 1,
            None => first_segment,
        };
        let active = Segment::create(&dir, active_id, config.sync_mode, config.max_block_size)?;
        segments.insert(active_id, Arc::clone(&active));
        check_in_range(&segments, cursor.read_position())?;

        let pending = count_pending_blocks(&segments, cursor.read_position());
        info!(
            "Opened queue {ct}: {} segments, cursor {}, {pending} pending blocks",
            segments.len(),
            cursor.read_position()
        );

        let (quit_tx, quit_rx) = crossbeam::channel::bounded(0);
        let counters = Counters::default();
        counters.inflight.store(pending, Ordering::Release);
        counters.empty.store(pending == 0, Ordering::Release);

        Ok(Arc::new(Queue {
            ct,
            dir,
            max_segment_size: config.max_segment_size,
            max_block_size: config.max_block_size,
            rollback_capacity: config.rollback_capacity,
            sync_mode: config.sync_mode,
            segments: RwLock::new(segments),
            writer: Mutex::new(WriterState { active }),
            reader: Mutex::new(ReaderState {
                cursor,
                current: None,
                replay: VecDeque::new(),
                replaying: false,
            }),
            parked: Mutex::new(VecDeque::new()),
            counters,
            open: AtomicBool::new(true),
            quit_tx: Mutex::new(Some(quit_tx)),
            quit_rx,
            pump: Mutex::new(None),
        }))
    }

    pub fn ident(&self) -> String {
        self.ct.to_string()
    }

    pub fn cluster_topic(&self) -> &ClusterTopic {
        &self.ct
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn is_open(&self) -> bool {
        self.open.load(Ordering::Acquire)
    }

    /// Nothing left to deliver, on disk or in replay staging.
    pub fn is_empty(&self) -> bool {
        self.counters.inflight.load(Ordering::Acquire) == 0 && self.reader.lock().replay.is_empty()
    }

    pub fn stats(&self) -> QueueStats {
        let c = &self.counters;
        QueueStats {
            appended: c.appended.load(Ordering::Acquire),
            delivered: c.delivered.load(Ordering::Acquire),
            failed: c.failed.load(Ordering::Acquire),
            inflight: c.inflight.load(Ordering::Acquire),
            retries: c.retries.load(Ordering::Acquire),
            corrupt_segments: c.corrupt_segments.load(Ordering::Acquire),
            rolled_back: c.rolled_back.load(Ordering::Acquire),
            empty: c.empty.load(Ordering::Acquire),
        }
    }

    pub fn segment_ids(&self) -> Vec<u64> {
        self.segments.read().keys().copied().collect()
    }

    pub fn read_position(&self) -> Position {
        self.reader.lock().cursor.read_position()
    }

    pub fn committed_position(&self) -> Position {
        self.reader.lock().cursor.committed_position()
    }

    pub fn persisted_position(&self) -> Option<Position> {
        self.reader.lock().cursor.persisted_position()
    }

    // ============================================================================================
    // PRODUCER SIDE
    // ============================================================================================

    /// Durably append one block, rolling to a new segment when the active one is full.
    pub fn append(&self, block: &Block) -> Result<(), HhError> {
        if !self.is_open() {
            return Err(HhError::QueueNotOpen);
        }
        block.check_size(self.max_block_size)?;

        let mut writer = self.writer.lock();
        let active = &writer.active;
        let full =
            active.size() > 0 && active.size() + block.encoded_len() > self.max_segment_size;
        if full || active.is_broken() || active.is_sealed() {
            self.roll(&mut writer)?;
        }

        // Counted before the block becomes visible to the reader, which may
        // consume it immediately.
        self.counters.inflight.fetch_add(1, Ordering::AcqRel);
        if let Err(e) = writer.active.append(block) {
            self.counters.consume_one();
            return Err(e);
        }
        self.counters.appended.fetch_add(1, Ordering::AcqRel);
        self.counters.empty.store(false, Ordering::Release);
        Ok(())
    }

    #[tracing::instrument(level = "info", skip(self, writer), fields(queue = %self.ct, from = writer.active.id))]
    fn roll(&self, writer: &mut WriterState) -> Result<(), HhError> {
        let next_id = writer.active.id + 1;
        if let Err(e) = writer.active.seal() {
            warn!("queue[{}] seal segment {}: {e}", self.ct, writer.active.id);
        }

        let segment = Segment::create(&self.dir, next_id, self.sync_mode, self.max_block_size)?;
        self.segments.write().insert(next_id, Arc::clone(&segment));
        writer.active = segment;
        debug!("queue[{}] rolled to segment {next_id}", self.ct);
        Ok(())
    }

    // ============================================================================================
    // CONSUMER SIDE
    // ============================================================================================

    /// Fill `out` with the next undelivered block and advance the read head.
    /// The committed position only moves on [`Queue::commit_position`].
    pub fn next(&self, out: &mut Block) -> Result<(), HhError> {
        if !self.is_open() {
            return Err(HhError::QueueNotOpen);
        }

        let mut guard = self.reader.lock();
        let reader = &mut *guard;

        if let Some(block) = reader.replay.pop_front() {
            *out = block;
            reader.replaying = true;
            return Ok(());
        }
        reader.replaying = false;

        loop {
            let pos = reader.cursor.read_position();
            let stale = match &reader.current {
                Some(r) => r.segment_id() != pos.segment || r.position() != pos.offset,
                None => true,
            };
            if stale {
                let segment = self
                    .segments
                    .read()
                    .get(&pos.segment)
                    .cloned()
                    .ok_or(HhError::CursorOutOfRange {
                        segment: pos.segment,
                        offset: pos.offset,
                    })?;
                reader.current = Some(segment.reader(pos.offset)?);
            }

            let Some(current) = reader.current.as_mut() else {
                continue;
            };

            match current.read_block(out) {
                Ok(next_offset) => {
                    reader
                        .cursor
                        .advance_read(Position::new(pos.segment, next_offset));
                    self.counters.empty.store(false, Ordering::Release);
                    return Ok(());
                }
                Err(HhError::EndOfSegment) => {
                    let next_segment = self.next_segment_after(pos.segment);
                    match next_segment {
                        // A later segment exists only once this one is sealed, so
                        // its size is final; catch up on anything appended
                        // between the read and the roll before moving on.
                        Some(_) if current.position() < current.segment().size() => continue,
                        Some(next_id) => {
                            reader.cursor.advance_read(Position::segment_start(next_id));
                            reader.current = None;
                        }
                        None => {
                            self.counters.empty.store(true, Ordering::Release);
                            return Err(HhError::EndOfQueue);
                        }
                    }
                }
                Err(e) => {
                    reader.current = None;
                    return Err(e);
                }
            }
        }
    }

    fn next_segment_after(&self, id: u64) -> Option<u64> {
        self.segments
            .read()
            .range((Excluded(id), Unbounded))
            .next()
            .map(|(&next, _)| next)
    }

    /// Mark the block last returned by [`Queue::next`] as processed.
    pub fn commit_position(&self) {
        let mut reader = self.reader.lock();
        if reader.replaying {
            reader.replaying = false;
            return;
        }
        reader.cursor.commit_position();
        self.counters.consume_one();
    }

    /// Persist the committed position.
    pub fn dump(&self) -> Result<(), HhError> {
        self.reader.lock().cursor.dump()
    }

    /// Abandon the rest of the segment under the read head. When that segment
    /// is the one being written, the writer moves on first so the skip never
    /// lands beyond the end of the log.
    #[tracing::instrument(level = "warn", skip(self), fields(queue = %self.ct))]
    pub fn skip_cursor_segment(&self) -> Result<Position, HhError> {
        let mut reader = self.reader.lock();
        // Held until the recount is stored so no append is counted but not yet readable.
        let mut writer = self.writer.lock();
        let from = reader.cursor.read_position();

        let next_id = match self.next_segment_after(from.segment) {
            Some(id) => id,
            None => {
                self.roll(&mut writer)?;
                writer.active.id
            }
        };

        reader.cursor.skip_segment(next_id);
        reader.current = None;
        self.counters.corrupt_segments.fetch_add(1, Ordering::AcqRel);

        // The blocks lost with the segment can no longer be counted one by one.
        let pending = count_pending_blocks(&self.segments.read(), reader.cursor.read_position());
        self.counters.inflight.store(pending, Ordering::Release);
        drop(writer);

        warn!(
            "queue[{}] skipped segment {} at offset {}, resuming at {}",
            self.ct,
            from.segment,
            from.offset,
            reader.cursor.read_position()
        );
        Ok(reader.cursor.read_position())
    }

    /// Park a block whose delivery attempts are exhausted and commit past it.
    /// Parked blocks are never retried automatically; see
    /// [`Queue::requeue_rolled_back`].
    pub fn rollback(&self, block: &Block) -> Result<(), HhError> {
        let accepted = {
            let mut parked = self.parked.lock();
            if parked.len() < self.rollback_capacity {
                parked.push_back(block.clone());
                true
            } else {
                false
            }
        };

        self.commit_position();
        if !accepted {
            return Err(HhError::RollbackRejected {
                capacity: self.rollback_capacity,
            });
        }
        self.counters.rolled_back.fetch_add(1, Ordering::AcqRel);
        Ok(())
    }

    pub fn rolled_back_blocks(&self) -> Vec<Block> {
        self.parked.lock().iter().cloned().collect()
    }

    /// Move every parked block into replay staging, where [`Queue::next`]
    /// serves it before resuming the disk stream. Returns how many moved.
    pub fn requeue_rolled_back(&self) -> usize {
        let blocks: Vec<Block> = self.parked.lock().drain(..).collect();
        let moved = blocks.len();
        self.reader.lock().replay.extend(blocks);
        if moved > 0 {
            info!("queue[{}] requeued {moved} rolled back blocks", self.ct);
        }
        moved
    }

    pub(crate) fn record_delivered(&self) {
        self.counters.delivered.fetch_add(1, Ordering::AcqRel);
    }

    pub(crate) fn record_failed(&self) {
        self.counters.failed.fetch_add(1, Ordering::AcqRel);
    }

    pub(crate) fn record_retry(&self) {
        self.counters.retries.fetch_add(1, Ordering::AcqRel);
    }

    // ============================================================================================
    // LIFECYCLE
    // ============================================================================================

    /// Start the background pump delivering this queue through `store`.
    pub fn start_pump(
        self: &Arc<Self>,
        store: Arc<dyn PubStore>,
        settings: PumpSettings,
    ) -> Result<(), HhError> {
        if !self.is_open() {
            return Err(HhError::QueueNotOpen);
        }
        let mut pump = self.pump.lock();
        if pump.is_some() {
            return Ok(());
        }
        let handle = Pump::new(Arc::clone(self), store, self.quit_rx.clone(), settings).spawn()?;
        *pump = Some(handle);
        Ok(())
    }

    /// Signal shutdown, wait for the pump to stop, then checkpoint and flush.
    /// Safe to call more than once and from several threads.
    #[tracing::instrument(level = "info", skip(self), fields(queue = %self.ct))]
    pub fn close(&self) -> Result<(), HhError> {
        self.open.store(false, Ordering::Release);
        // Dropping the only sender disconnects the channel every pump wait selects on.
        drop(self.quit_tx.lock().take());

        let joined = self.pump.lock().take().map(JoinHandle::join);
        if let Some(Err(_)) = joined {
            error!("queue[{}] pump thread panicked", self.ct);
        }

        self.dump()?;
        if self.sync_mode != SyncMode::None {
            self.writer.lock().active.sync()?;
        }
        Ok(())
    }
}

fn check_in_range(
    segments: &BTreeMap<u64, Arc<Segment>>,
    position: Position,
) -> Result<(), HhError> {
    match segments.get(&position.segment) {
        Some(segment) if position.offset <= segment.size() => Ok(()),
        _ => Err(HhError::CursorOutOfRange {
            segment: position.segment,
            offset: position.offset,
        }),
    }
}

/// Blocks between `from` and the end of the log, stopping at the first
/// unreadable spot of each segment.
fn count_pending_blocks(segments: &BTreeMap<u64, Arc<Segment>>, from: Position) -> u64 {
    let mut pending = 0;
    let mut block = Block::default();
    for (&id, segment) in segments.range(from.segment..) {
        let offset = if id == from.segment { from.offset } else { 0 };
        let mut reader = match segment.reader(offset) {
            Ok(reader) => reader,
            Err(_) => continue,
        };
        while reader.read_block(&mut block).is_ok() {
            pending += 1;
        }
    }
    pending
}
