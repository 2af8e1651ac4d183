//! Integration tests for reopening engines without a reset.
//!
//! These tests verify:
//! - data log state is rebuilt identically after close
//! - recovery after the circular log has wrapped
//! - index and var logs resume where they stopped
//! - unflushed records are not recovered
//! - failed page writes and reclamations cut short by power loss

use alopex_sbits::bitmap::BucketBitmap;
use alopex_sbits::{
    DbError, Devices, Engine, EngineConfig, EngineState, IteratorQuery, MemoryDevice, PageDevice,
    Parameters, VarData,
};
use std::io;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tempfile::TempDir;

/// Shared switches for a [`FlakyDevice`].
#[derive(Debug, Clone, Default)]
struct PowerSwitch {
    /// Writes fail while set.
    off: Arc<AtomicBool>,
    /// The next erase turns the power off.
    cut_after_erase: Arc<AtomicBool>,
}

/// In-memory device that erases to 0xFF and can lose power.
#[derive(Debug)]
struct FlakyDevice {
    inner: MemoryDevice,
    page_size: usize,
    switch: PowerSwitch,
}

impl FlakyDevice {
    fn new(config: &EngineConfig, switch: &PowerSwitch) -> Self {
        Self {
            inner: MemoryDevice::new(),
            page_size: config.page_size,
            switch: switch.clone(),
        }
    }
}

impl PageDevice for FlakyDevice {
    fn read_page(&mut self, page: u32, buf: &mut [u8]) -> io::Result<()> {
        self.inner.read_page(page, buf)
    }

    fn write_page(&mut self, page: u32, buf: &[u8]) -> io::Result<()> {
        if self.switch.off.load(Ordering::SeqCst) {
            return Err(io::Error::new(io::ErrorKind::Other, "power loss"));
        }
        self.inner.write_page(page, buf)
    }

    fn erase(&mut self, start: u32, end: u32) -> io::Result<()> {
        let erased = vec![0xffu8; self.page_size];
        for page in start..end {
            self.inner.write_page(page, &erased)?;
        }
        if self.switch.cut_after_erase.swap(false, Ordering::SeqCst) {
            self.switch.off.store(true, Ordering::SeqCst);
        }
        Ok(())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }

    fn truncate(&mut self) -> io::Result<()> {
        self.inner.truncate()
    }
}

fn without_reset(config: &EngineConfig) -> EngineConfig {
    EngineConfig {
        parameters: config.parameters.without(Parameters::RESET_DATA),
        ..config.clone()
    }
}

fn put_u32(db: &mut Engine, key: u32, value: u32) {
    db.put(&key.to_le_bytes(), &value.to_le_bytes()).unwrap();
}

fn get_u32(db: &mut Engine, key: u32) -> alopex_sbits::Result<u32> {
    let mut out = [0u8; 4];
    db.get(&key.to_le_bytes(), &mut out)?;
    Ok(u32::from_le_bytes(out))
}

fn assert_same_data_state(before: &EngineState, after: &EngineState) {
    assert_eq!(after.next_data_page_id, before.next_data_page_id);
    assert_eq!(after.min_data_page_id, before.min_data_page_id);
    assert_eq!(after.first_data_page, before.first_data_page);
    assert_eq!(after.num_avail_data_pages, before.num_avail_data_pages);
    assert_eq!(after.min_key, before.min_key);
    assert_eq!(after.avg_key_diff, before.avg_key_diff);
}

#[test]
fn test_reopen_from_files() {
    let dir = TempDir::new().unwrap();
    let config = EngineConfig::default();

    let before = {
        let mut db = Engine::open_in_dir(config.clone(), dir.path()).unwrap();
        for key in 0..5_000u32 {
            put_u32(&mut db, key, key ^ 0x5a5a);
        }
        db.flush().unwrap();
        db.state()
    };

    let mut db = Engine::open_in_dir(without_reset(&config), dir.path()).unwrap();
    assert_same_data_state(&before, &db.state());
    assert_eq!(db.stats().num_reads, 0);
    for key in (0..5_000u32).step_by(13) {
        assert_eq!(get_u32(&mut db, key).unwrap(), key ^ 0x5a5a);
    }

    // Inserting continues after the recovered last key.
    assert!(matches!(
        db.put(&4_999u32.to_le_bytes(), &[0; 4]),
        Err(DbError::DuplicateKey(4_999))
    ));
    put_u32(&mut db, 5_000, 1);
    db.flush().unwrap();
    assert_eq!(get_u32(&mut db, 5_000).unwrap(), 1);
}

#[test]
fn test_recovery_is_idempotent() {
    let config = EngineConfig::default();
    let mut db = Engine::open(config.clone(), Devices::in_memory(&config)).unwrap();
    for key in 0..3_000u32 {
        put_u32(&mut db, key * 5, key);
    }
    db.flush().unwrap();
    let original = db.state();

    let mut devices = db.close().unwrap();
    for _ in 0..3 {
        let db = Engine::open(without_reset(&config), devices).unwrap();
        assert_same_data_state(&original, &db.state());
        devices = db.close().unwrap();
    }
}

#[test]
fn test_recovery_after_wrap() {
    let dir = TempDir::new().unwrap();
    let config = EngineConfig {
        num_data_pages: 20,
        erase_size_in_pages: 4,
        ..EngineConfig::default()
    };
    let total = 63 * 53u32;

    let before = {
        let mut db = Engine::open_in_dir(config.clone(), dir.path()).unwrap();
        for key in 0..total {
            put_u32(&mut db, key, key + 3);
        }
        db.flush().unwrap();
        db.state()
    };
    // 53 pages in 20 slots: blocks of 4 reclaimed up to page 36.
    assert_eq!(before.next_data_page_id, 53);
    assert_eq!(before.min_data_page_id, 36);

    let mut db = Engine::open_in_dir(without_reset(&config), dir.path()).unwrap();
    assert_same_data_state(&before, &db.state());
    let min_key = before.min_key.unwrap() as u32;
    assert!(matches!(get_u32(&mut db, min_key - 1), Err(DbError::NotFound)));
    for key in (min_key..total).step_by(7) {
        assert_eq!(get_u32(&mut db, key).unwrap(), key + 3);
    }

    // Writing resumes into the next physical slot and reclaims correctly.
    for key in total..total + 63 * 8 {
        put_u32(&mut db, key, key + 3);
    }
    db.flush().unwrap();
    let state = db.state();
    assert_eq!(state.next_data_page_id, 61);
    assert_eq!(state.min_data_page_id, 44);
    assert_eq!(get_u32(&mut db, total + 10).unwrap(), total + 13);
}

#[test]
fn test_unflushed_records_are_lost() {
    let config = EngineConfig::default();
    let mut db = Engine::open(config.clone(), Devices::in_memory(&config)).unwrap();
    for key in 0..100u32 {
        put_u32(&mut db, key, key);
    }
    let devices = db.close().unwrap();

    let mut db = Engine::open(without_reset(&config), devices).unwrap();
    assert_eq!(get_u32(&mut db, 10).unwrap(), 10);
    assert!(matches!(get_u32(&mut db, 80), Err(DbError::NotFound)));
    put_u32(&mut db, 63, 0);
}

#[test]
fn test_index_recovery_keeps_pruning() {
    let config = EngineConfig {
        parameters: Parameters::new()
            .with(Parameters::RESET_DATA)
            .with(Parameters::USE_INDEX),
        buffer_size_in_blocks: 4,
        ..EngineConfig::default()
    }
    .with_bitmap(Arc::new(BucketBitmap::int8()));

    let mut db = Engine::open(config.clone(), Devices::in_memory(&config)).unwrap();
    // Values climb slowly so each page covers one or two buckets.
    for key in 0..6_000u32 {
        put_u32(&mut db, key, key / 60);
    }
    db.flush().unwrap();
    let before = db.state();
    let devices = db.close().unwrap();

    let mut db = Engine::open(without_reset(&config), devices).unwrap();
    let after = db.state();
    assert_same_data_state(&before, &after);
    assert_eq!(after.next_idx_page_id, before.next_idx_page_id);

    let query = IteratorQuery::new()
        .min_data(&85u32.to_le_bytes())
        .max_data(&95u32.to_le_bytes());
    let keys: Vec<u64> = db.iter(query).unwrap().map(|r| r.key_u64()).collect();
    assert_eq!(keys, (85 * 60..96 * 60).collect::<Vec<_>>());
    assert!(db.stats().num_reads < before.next_data_page_id as u64);
}

#[test]
fn test_corrupt_index_page_is_ignored() {
    let config = EngineConfig {
        parameters: Parameters::new()
            .with(Parameters::RESET_DATA)
            .with(Parameters::USE_INDEX),
        buffer_size_in_blocks: 4,
        ..EngineConfig::default()
    }
    .with_bitmap(Arc::new(BucketBitmap::int8()));

    let mut db = Engine::open(config.clone(), Devices::in_memory(&config)).unwrap();
    for key in 0..6_000u32 {
        put_u32(&mut db, key, key / 60);
    }
    db.flush().unwrap();
    assert_eq!(db.state().next_idx_page_id, Some(1));
    let mut devices = db.close().unwrap();

    // Flip a bit in the first bitmap entry of index page 0.
    let index = devices.index.as_mut().unwrap();
    let mut page = vec![0u8; 512];
    index.read_page(0, &mut page).unwrap();
    page[16] ^= 0x01;
    index.write_page(0, &page).unwrap();

    let mut db = Engine::open(without_reset(&config), devices).unwrap();
    assert_eq!(db.state().next_idx_page_id, Some(0));

    // Pages without index coverage are still found through their headers.
    let query = IteratorQuery::new()
        .min_data(&10u32.to_le_bytes())
        .max_data(&12u32.to_le_bytes());
    let keys: Vec<u64> = db.iter(query).unwrap().map(|r| r.key_u64()).collect();
    assert_eq!(keys, (600..780).collect::<Vec<_>>());
}

#[test]
fn test_var_recovery_resumes_payloads() {
    let config = EngineConfig {
        parameters: Parameters::new()
            .with(Parameters::RESET_DATA)
            .with(Parameters::USE_VDATA),
        buffer_size_in_blocks: 4,
        ..EngineConfig::default()
    };
    let payload = |key: u32| format!("payload for record {key}").repeat(key as usize % 5 + 1);

    let mut db = Engine::open(config.clone(), Devices::in_memory(&config)).unwrap();
    for key in 0..500u32 {
        db.put_var(&key.to_le_bytes(), &key.to_le_bytes(), Some(payload(key).as_bytes()))
            .unwrap();
    }
    db.flush().unwrap();
    let before = db.state();
    let devices = db.close().unwrap();

    let mut db = Engine::open(without_reset(&config), devices).unwrap();
    let after = db.state();
    assert_eq!(after.next_var_page_id, before.next_var_page_id);
    assert_eq!(after.current_var_loc, before.current_var_loc);
    assert_eq!(after.min_var_record_id, before.min_var_record_id);
    assert_eq!(after.num_avail_var_pages, before.num_avail_var_pages);

    let mut out = [0u8; 4];
    for key in [0u32, 123, 499] {
        let VarData::Stream(mut stream) = db.get_var(&key.to_le_bytes(), &mut out).unwrap() else {
            panic!("payload of {key} should be readable");
        };
        assert_eq!(stream.read_to_end(&mut db).unwrap(), payload(key).into_bytes());
    }

    db.put_var(&500u32.to_le_bytes(), &[0; 4], Some(b"after reopen"))
        .unwrap();
    let mut stream = db
        .get_var(&500u32.to_le_bytes(), &mut out)
        .unwrap()
        .into_stream()
        .unwrap();
    assert_eq!(stream.read_to_end(&mut db).unwrap(), b"after reopen");
}

#[test]
fn test_failed_page_write_leaves_state_unchanged() {
    let config = EngineConfig::default();
    let switch = PowerSwitch::default();
    let devices = Devices::new(FlakyDevice::new(&config, &switch));
    let mut db = Engine::open(config.clone(), devices).unwrap();
    for key in 0..63u32 {
        put_u32(&mut db, key, key + 1);
    }
    let before = db.state();

    switch.off.store(true, Ordering::SeqCst);
    for _ in 0..3 {
        let result = db.put(&63u32.to_le_bytes(), &[0; 4]);
        assert!(matches!(result, Err(DbError::Io(_))));
        assert_eq!(db.state(), before);
        assert_eq!(db.buffered_records(), 63);
    }
    assert_eq!(get_u32(&mut db, 62).unwrap(), 63);

    switch.off.store(false, Ordering::SeqCst);
    put_u32(&mut db, 63, 64);
    db.flush().unwrap();
    assert_eq!(db.state().next_data_page_id, 2);
    for key in [0u32, 62, 63] {
        assert_eq!(get_u32(&mut db, key).unwrap(), key + 1);
    }

    let devices = db.close().unwrap();
    let db = Engine::open(without_reset(&config), devices).unwrap();
    assert_eq!(db.state().next_data_page_id, 2);
}

#[test]
fn test_recovery_after_interrupted_reclamation() {
    let config = EngineConfig {
        num_data_pages: 8,
        erase_size_in_pages: 2,
        ..EngineConfig::default()
    };
    let switch = PowerSwitch::default();
    let devices = Devices::new(FlakyDevice::new(&config, &switch));
    let mut db = Engine::open(config.clone(), devices).unwrap();

    // Pages 0..=7 fill the log and page 8 waits in the write buffer.
    for key in 0..63 * 9u32 {
        put_u32(&mut db, key, key * 2);
    }
    assert_eq!(db.state().next_data_page_id, 8);
    assert_eq!(db.state().num_avail_data_pages, 0);

    // Power fails after erasing slots 0 and 1, before page 8 is written.
    switch.cut_after_erase.store(true, Ordering::SeqCst);
    let result = db.put(&(63 * 9u32).to_le_bytes(), &[0; 4]);
    assert!(matches!(result, Err(DbError::Io(_))));
    let before = db.state();
    let devices = db.close().unwrap();
    switch.off.store(false, Ordering::SeqCst);

    let mut db = Engine::open(without_reset(&config), devices).unwrap();
    let after = db.state();
    assert_eq!(after.next_data_page_id, 8);
    assert_eq!(after.min_data_page_id, 2);
    assert_eq!(after.num_avail_data_pages, 2);
    assert_eq!(after.min_key, Some(2 * 63));
    assert_same_data_state(&before, &after);

    assert!(matches!(get_u32(&mut db, 2 * 63 - 1), Err(DbError::NotFound)));
    for key in (2 * 63..63 * 8u32).step_by(11) {
        assert_eq!(get_u32(&mut db, key).unwrap(), key * 2);
    }

    // Writing resumes in the erased slots, then reclaims the next block.
    for key in 63 * 8..63 * 11u32 {
        put_u32(&mut db, key, key * 2);
    }
    db.flush().unwrap();
    let state = db.state();
    assert_eq!(state.next_data_page_id, 11);
    assert_eq!(state.min_data_page_id, 4);
    assert!(matches!(get_u32(&mut db, 4 * 63 - 1), Err(DbError::NotFound)));
    assert_eq!(get_u32(&mut db, 63 * 11 - 1).unwrap(), (63 * 11 - 1) * 2);
}
