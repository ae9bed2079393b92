//! A reader thread polling an index while the writer appends to it

#![allow(clippy::expect_used, clippy::unwrap_used, clippy::panic)]

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread;

use strata_storage::bitmap::{BitmapIndexReader, BitmapIndexWriter};
use strata_storage::{DefaultFilesFacade, FilesFacade, StorageConfig};

const KEYS: u32 = 4;
const ROWS: i64 = 20_000;

/// Rows of `key` written so far must be the newest-first run
/// `key + KEYS * (count - 1), ..., key`.
fn assert_prefix(key: u32, rows: &[i64]) {
    let count = rows.len() as i64;
    for (i, row) in rows.iter().enumerate() {
        let expected = i64::from(key) + i64::from(KEYS) * (count - 1 - i as i64);
        assert_eq!(*row, expected, "key {key}, position {i} of {count}");
    }
}

#[test]
fn test_reader_sees_consistent_prefixes() {
    let dir = tempfile::tempdir().unwrap();
    let ff: Arc<dyn FilesFacade> = Arc::new(DefaultFilesFacade);
    let config = StorageConfig::new().with_index_value_block_size(16);

    let mut writer = BitmapIndexWriter::open(ff.clone(), &config, dir.path(), "sym").unwrap();
    let mut reader = BitmapIndexReader::open(ff, &config, dir.path(), "sym").unwrap();
    let done = AtomicBool::new(false);

    thread::scope(|s| {
        let polling = s.spawn(|| {
            let mut last = [0usize; KEYS as usize];
            let mut polls = 0u64;
            loop {
                let finished = done.load(Ordering::Acquire);
                for key in 0..KEYS {
                    let rows: Vec<i64> = reader.get_cursor(key).unwrap().collect();
                    assert!(rows.len() >= last[key as usize], "key {key} lost rows");
                    assert_prefix(key, &rows);
                    last[key as usize] = rows.len();
                }
                polls += 1;
                if finished {
                    return (last, polls);
                }
            }
        });

        for row in 0..ROWS {
            writer.add((row % i64::from(KEYS)) as u32, row).unwrap();
        }
        done.store(true, Ordering::Release);

        let (last, polls) = polling.join().unwrap();
        assert!(polls > 0);
        for count in last {
            assert_eq!(count as i64, ROWS / i64::from(KEYS));
        }
    });
}
