use super::test_utilities::*;
use kateway_hh::storage::disk::{Block, PumpSettings, Segment, SyncMode, backoff_delay};
use crossbeam::channel::{Receiver, Sender, bounded};
use kateway_hh::{HhError, PubStore, PublishError, Queue};
use std::sync::Arc;
use std::time::{Duration, Instant};
use test_log::test;

fn start(tc: &TestConfig, store: &Arc<ScriptedStore>) -> Arc<Queue> {
    let queue = Queue::open(&tc.config, tc.ct.clone()).unwrap();
    queue
        .start_pump(store.clone(), PumpSettings::from(&tc.config))
        .unwrap();
    queue
}

fn append(queue: &Queue, value: &[u8]) {
    queue.append(&Block::new(b"k".to_vec(), value.to_vec())).unwrap();
}

fn unavailable() -> PublishError {
    PublishError::Unavailable("broker down".to_string())
}

#[test]
fn test_transient_failures_retry_then_deliver_in_order() {
    let tc = TestConfig::new("abc");
    let store = ScriptedStore::new();
    store.script(b"A", vec![Err(unavailable()), Err(unavailable())]);

    let queue = start(&tc, &store);
    append(&queue, b"A");
    append(&queue, b"B");
    append(&queue, b"C");

    assert!(wait_until(SETTLE, || queue.stats().delivered == 3));
    queue.close().unwrap();

    let stats = queue.stats();
    assert_eq!(stats.failed, 0);
    assert_eq!(stats.retries, 2);
    assert_eq!(stats.inflight, 0);
    assert_eq!(store.calls_for(b"A").len(), 3);
    assert_eq!(
        store.delivered_values(),
        vec![b"A".to_vec(), b"B".to_vec(), b"C".to_vec()]
    );

    // The checkpoint is past C: nothing comes back after a restart.
    assert_eq!(queue.persisted_position(), Some(queue.read_position()));
    let reopened = Queue::open(&tc.config, tc.ct.clone()).unwrap();
    let mut out = Block::default();
    assert_eq!(reopened.next(&mut out).unwrap_err(), HhError::EndOfQueue);
}

#[test]
fn test_permanent_error_is_attempted_once() {
    let tc = TestConfig::new("permanent");
    let store = ScriptedStore::new();
    store.script(b"D", vec![Err(PublishError::InvalidTopic("gone".to_string()))]);

    let queue = start(&tc, &store);
    append(&queue, b"D");
    append(&queue, b"E");

    assert!(wait_until(SETTLE, || {
        let stats = queue.stats();
        stats.delivered == 1 && stats.failed == 1
    }));
    queue.close().unwrap();

    let stats = queue.stats();
    assert_eq!(stats.retries, 0);
    assert_eq!(stats.rolled_back, 0);
    assert_eq!(store.calls_for(b"D").len(), 1);
    assert_eq!(store.delivered_values(), vec![b"E".to_vec()]);
}

#[test]
fn test_exhausted_block_is_rolled_back_after_capped_backoff() {
    let tc = TestConfig::new("exhausted");
    let store = ScriptedStore::new();
    store.script(b"X", vec![Err(PublishError::Timeout); 5]);

    let queue = start(&tc, &store);
    append(&queue, b"X");
    append(&queue, b"Y");

    assert!(wait_until(SETTLE, || queue.stats().delivered == 1));
    queue.close().unwrap();

    let stats = queue.stats();
    assert_eq!(stats.failed, 1);
    assert_eq!(stats.retries, 4);
    assert_eq!(stats.rolled_back, 1);
    assert_eq!(store.delivered_values(), vec![b"Y".to_vec()]);

    let attempts = store.calls_for(b"X");
    assert_eq!(attempts.len(), 5);
    let settings = PumpSettings::from(&tc.config);
    for (retry, pair) in attempts.windows(2).enumerate() {
        let waited = pair[1].at.duration_since(pair[0].at);
        let delay = backoff_delay(settings.initial_backoff, settings.max_backoff, retry as u32);
        assert!(delay <= settings.max_backoff);
        assert!(waited >= delay, "retry {retry} waited {waited:?} < {delay:?}");
    }

    let parked = queue.rolled_back_blocks();
    assert_eq!(parked.len(), 1);
    assert_eq!(parked[0].value, b"X");
}

#[test]
fn test_requeued_block_is_delivered_without_moving_cursor() {
    let tc = TestConfig::new("requeue");
    let store = ScriptedStore::new();
    store.script(b"X", vec![Err(PublishError::Timeout); 5]);

    let queue = start(&tc, &store);
    append(&queue, b"X");
    assert!(wait_until(SETTLE, || queue.stats().rolled_back == 1));
    let committed = queue.committed_position();

    assert_eq!(queue.requeue_rolled_back(), 1);
    assert!(wait_until(SETTLE, || queue.stats().delivered == 1));
    assert_eq!(queue.committed_position(), committed);
    assert!(queue.rolled_back_blocks().is_empty());
    queue.close().unwrap();
}

#[test]
fn test_shutdown_during_backoff_is_immediate_and_keeps_block() {
    let mut tc = TestConfig::new("shutdown_backoff");
    tc.config.initial_backoff_ms = 60_000;
    tc.config.max_backoff_ms = 60_000;
    let store = ScriptedStore::new();
    store.script(b"Z", vec![Err(unavailable())]);

    let queue = start(&tc, &store);
    append(&queue, b"Z");
    assert!(wait_until(SETTLE, || queue.stats().retries == 1));

    let started = Instant::now();
    queue.close().unwrap();
    assert!(started.elapsed() < Duration::from_secs(5));
    assert_eq!(queue.stats().delivered, 0);
    assert_eq!(store.calls_for(b"Z").len(), 1);

    // Not committed, so the next run delivers it.
    let store = ScriptedStore::new();
    let queue = start(&tc, &store);
    assert!(wait_until(SETTLE, || queue.stats().delivered == 1));
    assert_eq!(store.delivered_values(), vec![b"Z".to_vec()]);
    queue.close().unwrap();
}

#[test]
fn test_shutdown_while_idle_is_immediate() {
    let mut tc = TestConfig::new("shutdown_idle");
    tc.config.poll_interval_ms = 60_000;
    let store = ScriptedStore::new();

    let queue = start(&tc, &store);
    assert!(wait_until(SETTLE, || queue.stats().empty));

    let started = Instant::now();
    queue.close().unwrap();
    assert!(started.elapsed() < Duration::from_secs(5));
    assert!(store.calls().is_empty());
}

/// Holds every publish until the test releases it.
struct GatedStore {
    entered: Sender<()>,
    release: Receiver<()>,
}

impl PubStore for GatedStore {
    fn sync_pub(
        &self,
        _cluster: &str,
        _topic: &str,
        _key: &[u8],
        _value: &[u8],
    ) -> Result<(i32, i64), PublishError> {
        let _ = self.entered.send(());
        self.release
            .recv()
            .map(|()| (0, 0))
            .map_err(|_| PublishError::Other("gate dropped".to_string()))
    }
}

#[test]
fn test_shutdown_while_delivering_waits_for_the_publish() {
    let tc = TestConfig::new("shutdown_draining");
    let (entered_tx, entered_rx) = bounded(1);
    let (release_tx, release_rx) = bounded(1);
    let store = Arc::new(GatedStore {
        entered: entered_tx,
        release: release_rx,
    });

    let queue = Queue::open(&tc.config, tc.ct.clone()).unwrap();
    queue.start_pump(store, PumpSettings::from(&tc.config)).unwrap();
    append(&queue, b"M");
    entered_rx.recv_timeout(SETTLE).unwrap();

    let (closed_tx, closed_rx) = bounded(1);
    let closer = {
        let queue = Arc::clone(&queue);
        std::thread::spawn(move || closed_tx.send(queue.close()).unwrap())
    };

    // The pump is still inside the publish call, so close cannot finish.
    assert!(closed_rx.recv_timeout(Duration::from_millis(200)).is_err());
    assert_eq!(queue.stats().delivered, 0);

    release_tx.send(()).unwrap();
    closed_rx.recv_timeout(SETTLE).unwrap().unwrap();
    closer.join().unwrap();

    assert_eq!(queue.stats().delivered, 1);
    assert_eq!(queue.committed_position().offset, 10);
    assert_eq!(queue.persisted_position(), Some(queue.committed_position()));

    // The final checkpoint covers the block, so nothing is redelivered.
    let reopened = Queue::open(&tc.config, tc.ct.clone()).unwrap();
    assert_eq!(reopened.stats().inflight, 0);
    reopened.close().unwrap();
}

#[test]
fn test_checkpoint_every_n_deliveries() {
    let mut tc = TestConfig::new("checkpoint");
    tc.config.dump_per_blocks = 3;
    let store = ScriptedStore::new();

    let queue = start(&tc, &store);
    for value in [b"1", b"2", b"3", b"4"] {
        append(&queue, value);
    }
    assert!(wait_until(SETTLE, || queue.stats().delivered == 4));

    // Three deliveries were checkpointed; the fourth waits for the next batch.
    let persisted = queue.persisted_position().unwrap();
    assert!(persisted < queue.committed_position());
    assert_eq!(persisted.offset, 3 * 10);

    queue.close().unwrap();
    assert_eq!(queue.persisted_position(), Some(queue.committed_position()));
}

#[test]
fn test_pump_skips_corrupt_segment_and_continues() {
    let tc = TestConfig::new("pump_corrupt");
    let dir = tc.queue_dir();
    std::fs::create_dir_all(&dir).unwrap();
    std::fs::write(dir.join(format!("{:020}.log", 0)), [0, 0, 0, 1, b'k', 0, 0]).unwrap();
    {
        let segment = Segment::create(&dir, 1, SyncMode::Immediate, 256).unwrap();
        segment.append(&Block::new(b"k".to_vec(), b"intact".to_vec())).unwrap();
        segment.seal().unwrap();
    }

    let store = ScriptedStore::new();
    let queue = start(&tc, &store);
    assert!(wait_until(SETTLE, || queue.stats().delivered == 1));
    queue.close().unwrap();

    assert_eq!(queue.stats().corrupt_segments, 1);
    assert_eq!(store.delivered_values(), vec![b"intact".to_vec()]);
}

#[test]
fn test_pump_runs_on_named_thread_and_routes_destination() {
    let tc = TestConfig::new("named_thread");
    let store = ScriptedStore::new();
    let queue = start(&tc, &store);
    append(&queue, b"hello");
    assert!(wait_until(SETTLE, || queue.stats().delivered == 1));
    queue.close().unwrap();

    let call = &store.calls()[0];
    assert_eq!(call.cluster, tc.ct.cluster);
    assert_eq!(call.topic, tc.ct.topic);
    assert_eq!(call.key, b"k");
    assert_eq!(call.thread.as_deref(), Some(format!("hh-pump-{}", tc.ct).as_str()));
}
