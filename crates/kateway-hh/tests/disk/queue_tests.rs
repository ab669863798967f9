use super::test_utilities::*;
use kateway_hh::storage::disk::{Block, Position};
use kateway_hh::{HhError, Queue};
use std::sync::Arc;
use test_log::test;

fn block(i: usize) -> Block {
    Block::new(format!("key-{i}").into_bytes(), format!("value-{i}").into_bytes())
}

#[test]
fn test_restart_resumes_from_checkpoint() {
    let tc = TestConfig::new("resume");
    {
        let queue = Queue::open(&tc.config, tc.ct.clone()).unwrap();
        for i in 0..5 {
            queue.append(&block(i)).unwrap();
        }
        let mut out = Block::default();
        for _ in 0..3 {
            queue.next(&mut out).unwrap();
            queue.commit_position();
        }
        queue.close().unwrap();
    }

    let queue = Queue::open(&tc.config, tc.ct.clone()).unwrap();
    assert_eq!(queue.stats().inflight, 2);

    let mut out = Block::default();
    queue.next(&mut out).unwrap();
    assert_eq!(out, block(3));
    queue.next(&mut out).unwrap();
    assert_eq!(out, block(4));
    assert_eq!(queue.next(&mut out).unwrap_err(), HhError::EndOfQueue);
}

#[test]
fn test_uncommitted_reads_are_redelivered_after_restart() {
    let tc = TestConfig::new("redeliver");
    {
        let queue = Queue::open(&tc.config, tc.ct.clone()).unwrap();
        queue.append(&block(0)).unwrap();
        queue.append(&block(1)).unwrap();

        let mut out = Block::default();
        queue.next(&mut out).unwrap();
        queue.next(&mut out).unwrap();
        queue.close().unwrap();
    }

    let queue = Queue::open(&tc.config, tc.ct.clone()).unwrap();
    let mut out = Block::default();
    queue.next(&mut out).unwrap();
    assert_eq!(out, block(0));
}

#[test]
fn test_restart_writes_to_a_fresh_segment() {
    let tc = TestConfig::new("fresh_segment");
    {
        let queue = Queue::open(&tc.config, tc.ct.clone()).unwrap();
        queue.append(&block(0)).unwrap();
        assert_eq!(queue.segment_ids(), vec![0]);
        queue.close().unwrap();
    }

    let queue = Queue::open(&tc.config, tc.ct.clone()).unwrap();
    assert_eq!(queue.segment_ids(), vec![0, 1]);
    queue.append(&block(1)).unwrap();

    let mut out = Block::default();
    queue.next(&mut out).unwrap();
    assert_eq!(out, block(0));
    queue.next(&mut out).unwrap();
    assert_eq!(out, block(1));
}

#[test]
fn test_empty_segment_is_reused_on_restart() {
    let tc = TestConfig::new("reuse_empty");
    {
        let queue = Queue::open(&tc.config, tc.ct.clone()).unwrap();
        queue.close().unwrap();
    }
    let queue = Queue::open(&tc.config, tc.ct.clone()).unwrap();
    assert_eq!(queue.segment_ids(), vec![0]);
}

#[test]
fn test_rollover_at_max_segment_size() {
    let tc = TestConfig::new("rollover");
    let queue = Queue::open(&tc.config, tc.ct.clone()).unwrap();

    // 8 + 196 bytes per block: five fit under 1024, the sixth rolls.
    let payload = Block::new(Vec::new(), vec![7u8; 196]);
    for _ in 0..5 {
        queue.append(&payload).unwrap();
    }
    assert_eq!(queue.segment_ids(), vec![0]);
    queue.append(&payload).unwrap();
    assert_eq!(queue.segment_ids(), vec![0, 1]);

    let segment_0 = std::fs::metadata(tc.queue_dir().join(format!("{:020}.log", 0))).unwrap();
    assert_eq!(segment_0.len(), 5 * 204);
}

#[test]
fn test_oversized_block_is_rejected() {
    let tc = TestConfig::new("oversized");
    let queue = Queue::open(&tc.config, tc.ct.clone()).unwrap();

    let err = queue
        .append(&Block::new(Vec::new(), vec![0u8; 257]))
        .unwrap_err();
    assert_eq!(err, HhError::BlockTooLarge { len: 257, max: 256 });
    assert_eq!(queue.stats().appended, 0);
    assert!(queue.is_empty());
}

#[test]
fn test_empty_key_is_preserved() {
    let tc = TestConfig::new("empty_key");
    let queue = Queue::open(&tc.config, tc.ct.clone()).unwrap();
    queue.append(&Block::new(Vec::new(), b"no key".to_vec())).unwrap();

    let mut out = Block::new(b"stale".to_vec(), Vec::new());
    queue.next(&mut out).unwrap();
    assert!(out.key.is_empty());
    assert_eq!(out.value, b"no key");
}

#[test]
fn test_concurrent_producer_and_consumer_preserve_order() {
    let tc = TestConfig::new("concurrent");
    let queue = Queue::open(&tc.config, tc.ct.clone()).unwrap();
    const COUNT: usize = 300;

    let producer = {
        let queue = Arc::clone(&queue);
        std::thread::spawn(move || {
            for i in 0..COUNT {
                queue.append(&block(i)).unwrap();
            }
        })
    };

    let mut out = Block::default();
    let mut seen = 0;
    let found_all = wait_until(SETTLE, || {
        loop {
            match queue.next(&mut out) {
                Ok(()) => {
                    assert_eq!(out, block(seen));
                    queue.commit_position();
                    seen += 1;
                }
                Err(HhError::EndOfQueue) => return seen == COUNT,
                Err(e) => panic!("unexpected read error: {e}"),
            }
        }
    });

    producer.join().unwrap();
    assert!(found_all, "consumed {seen} of {COUNT}");
    assert!(queue.segment_ids().len() > 1);
    assert_eq!(queue.stats().inflight, 0);
}

#[test]
fn test_commit_does_not_run_ahead_of_reads() {
    let tc = TestConfig::new("commit_order");
    let queue = Queue::open(&tc.config, tc.ct.clone()).unwrap();
    queue.append(&block(0)).unwrap();
    queue.append(&block(1)).unwrap();

    let mut out = Block::default();
    queue.next(&mut out).unwrap();
    let after_first = queue.read_position();
    queue.next(&mut out).unwrap();

    assert_eq!(queue.committed_position(), Position::new(0, 0));
    assert!(queue.committed_position() < after_first);
    queue.commit_position();
    assert_eq!(queue.committed_position(), queue.read_position());
    assert!(queue.persisted_position().is_none());

    queue.dump().unwrap();
    assert_eq!(queue.persisted_position(), Some(queue.committed_position()));
}

#[test]
fn test_inflight_matches_pending_after_skips_racing_appends() {
    let tc = TestConfig::new("skip_race");
    let queue = Queue::open(&tc.config, tc.ct.clone()).unwrap();
    const COUNT: usize = 500;

    let producer = {
        let queue = Arc::clone(&queue);
        std::thread::spawn(move || {
            for i in 0..COUNT {
                queue.append(&block(i)).unwrap();
            }
        })
    };
    for _ in 0..200 {
        if producer.is_finished() {
            break;
        }
        queue.skip_cursor_segment().unwrap();
        std::thread::yield_now();
    }
    producer.join().unwrap();

    let inflight = queue.stats().inflight;
    let mut out = Block::default();
    let mut drained = 0u64;
    loop {
        match queue.next(&mut out) {
            Ok(()) => {
                queue.commit_position();
                drained += 1;
            }
            Err(HhError::EndOfQueue) => break,
            Err(e) => panic!("unexpected read error: {e}"),
        }
    }
    assert_eq!(inflight, drained);
    assert_eq!(queue.stats().inflight, 0);
    assert!(queue.is_empty());
}
