use super::*;
use std::fs;
use std::io::Cursor;
use tempfile::tempdir;

// -------------------- Helpers --------------------

fn rec(index: u64, term: u64, payload: &[u8]) -> WalRecord {
    WalRecord::new(index, term, payload.to_vec())
}

fn replay_all(path: &std::path::Path) -> Result<Vec<WalRecord>, WalError> {
    let mut reader = WalReader::open(path)?;
    let mut recs = Vec::new();
    reader.replay(|r| recs.push(r))?;
    Ok(recs)
}

fn replay_from_bytes(data: &[u8]) -> Result<Vec<WalRecord>, WalError> {
    let mut reader = WalReader::from_reader(Cursor::new(data.to_vec()));
    let mut recs = Vec::new();
    reader.replay(|r| recs.push(r))?;
    Ok(recs)
}

fn indexes(recs: &[WalRecord]) -> Vec<u64> {
    recs.iter().map(|r| r.index).collect()
}

// -------------------- Basic write & replay --------------------

#[test]
fn write_and_replay_records() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("wal.log");

    {
        let mut w = WalWriter::create(&path, true).unwrap();
        w.append(&rec(1, 1, b"a")).unwrap();
        w.append(&rec(2, 1, b"bb")).unwrap();
        w.append(&rec(3, 2, b"")).unwrap();
    }

    let recs = replay_all(&path).unwrap();
    assert_eq!(recs, vec![rec(1, 1, b"a"), rec(2, 1, b"bb"), rec(3, 2, b"")]);
}

#[test]
fn append_returns_framed_length() {
    let dir = tempdir().unwrap();
    let mut w = WalWriter::create(dir.path().join("wal.log"), false).unwrap();
    let r = rec(1, 1, b"payload");
    assert_eq!(w.append(&r).unwrap(), r.framed_len());
}

#[test]
fn append_batch_is_one_frame_per_record() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("wal.log");
    let batch: Vec<WalRecord> = (1..=5).map(|i| rec(i, 3, b"x")).collect();
    {
        let mut w = WalWriter::create(&path, false).unwrap();
        let n = w.append_batch(&batch).unwrap();
        assert_eq!(n, batch.iter().map(WalRecord::framed_len).sum::<u64>());
        w.sync_to_disk().unwrap();
    }
    assert_eq!(replay_all(&path).unwrap(), batch);
}

// -------------------- Truncated tail tolerance --------------------

#[test]
fn truncated_tail_after_valid_records() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("wal.log");

    {
        let mut w = WalWriter::create(&path, true).unwrap();
        w.append(&rec(1, 1, b"v1")).unwrap();
        w.append(&rec(2, 1, b"v2")).unwrap();
    }
    let good_len = fs::metadata(&path).unwrap().len();

    // Partial frame: only the record_len header
    let mut data = fs::read(&path).unwrap();
    data.extend_from_slice(&[0x20, 0x00, 0x00, 0x00]);
    fs::write(&path, &data).unwrap();

    let mut reader = WalReader::open(&path).unwrap();
    let mut recs = Vec::new();
    let valid = reader.replay(|r| recs.push(r)).unwrap();
    assert_eq!(indexes(&recs), vec![1, 2]);
    assert_eq!(valid, good_len);
}

#[test]
fn truncated_body_after_crc() {
    let mut bytes = Vec::new();
    encode_frame(&rec(1, 1, b"complete"), &mut bytes).unwrap();
    let mut partial = Vec::new();
    encode_frame(&rec(2, 1, b"cut short"), &mut partial).unwrap();
    bytes.extend_from_slice(&partial[..partial.len() - 3]);

    let recs = replay_from_bytes(&bytes).unwrap();
    assert_eq!(indexes(&recs), vec![1]);
}

#[test]
fn replay_empty_in_memory() {
    assert!(replay_from_bytes(b"").unwrap().is_empty());
}

#[test]
fn open_non_existent_file_returns_error() {
    let dir = tempdir().unwrap();
    let result = WalReader::open(dir.path().join("missing.wal"));
    assert!(matches!(result, Err(WalError::Io(_))));
}

// -------------------- Corruption detection --------------------

#[test]
fn crc_mismatch_reports_offset_of_bad_frame() {
    let mut bytes = Vec::new();
    encode_frame(&rec(1, 1, b"ok"), &mut bytes).unwrap();
    let second_at = bytes.len() as u64;
    encode_frame(&rec(2, 1, b"bad"), &mut bytes).unwrap();
    let last = bytes.len() - 1;
    bytes[last] ^= 0xFF;

    match replay_from_bytes(&bytes) {
        Err(WalError::Corrupt { offset }) => assert_eq!(offset, second_at),
        other => panic!("expected corruption, got {:?}", other),
    }
}

#[test]
fn corrupt_record_len_too_small() {
    let data: Vec<u8> = vec![3, 0, 0, 0, 0, 0, 0, 0];
    assert!(matches!(
        replay_from_bytes(&data),
        Err(WalError::Corrupt { offset: 0 })
    ));
}

#[test]
fn payload_len_mismatch_is_corruption() {
    let mut body = Vec::new();
    body.extend_from_slice(&1u64.to_le_bytes());
    body.extend_from_slice(&1u64.to_le_bytes());
    body.extend_from_slice(&10u32.to_le_bytes()); // claims 10 bytes
    body.extend_from_slice(b"abc");
    let mut hasher = crc32fast::Hasher::new();
    hasher.update(&body);

    let mut bytes = Vec::new();
    bytes.extend_from_slice(&((body.len() + 4) as u32).to_le_bytes());
    bytes.extend_from_slice(&hasher.finalize().to_le_bytes());
    bytes.extend_from_slice(&body);

    assert!(matches!(
        replay_from_bytes(&bytes),
        Err(WalError::Corrupt { .. })
    ));
}

#[test]
fn large_payload_record() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("wal.log");
    let big = vec![b'x'; 1_000_000];
    {
        let mut w = WalWriter::create(&path, true).unwrap();
        w.append(&WalRecord::new(1, 1, big.clone())).unwrap();
    }
    let recs = replay_all(&path).unwrap();
    assert_eq!(recs[0].payload.len(), big.len());
}

#[test]
fn index_and_term_extremes() {
    let bytes = {
        let mut b = Vec::new();
        encode_frame(&rec(0, 0, b"zero"), &mut b).unwrap();
        encode_frame(&rec(u64::MAX, u64::MAX, b"max"), &mut b).unwrap();
        b
    };
    let recs = replay_from_bytes(&bytes).unwrap();
    assert_eq!(recs[1].index, u64::MAX);
    assert_eq!(recs[1].term, u64::MAX);
}

// -------------------- Segmented log --------------------

#[test]
fn segmented_log_reopens_with_all_records() {
    let dir = tempdir().unwrap();
    {
        let (mut log, recs) = SegmentedLog::open(dir.path(), 1024, false).unwrap();
        assert!(recs.is_empty());
        for i in 1..=50 {
            log.append(&[rec(i, 1, &[7u8; 40])]).unwrap();
        }
        assert!(log.segment_count() > 1, "expected segment roll-over");
        log.sync().unwrap();
    }
    let (log, recs) = SegmentedLog::open(dir.path(), 1024, false).unwrap();
    assert_eq!(indexes(&recs), (1..=50).collect::<Vec<_>>());
    assert_eq!(log.first_index(), Some(1));
    assert_eq!(log.last_index(), Some(50));
}

#[test]
fn segmented_log_rejects_gaps() {
    let dir = tempdir().unwrap();
    let (mut log, _) = SegmentedLog::open(dir.path(), 1024, false).unwrap();
    log.append(&[rec(1, 1, b"a")]).unwrap();
    let err = log.append(&[rec(3, 1, b"c")]).unwrap_err();
    assert!(matches!(
        err,
        WalError::Discontinuity {
            expected: 2,
            got: 3
        }
    ));
    let err = log.append(&[rec(2, 1, b"b"), rec(4, 1, b"d")]).unwrap_err();
    assert!(matches!(err, WalError::Discontinuity { .. }));
}

#[test]
fn empty_log_accepts_any_start_index() {
    let dir = tempdir().unwrap();
    let (mut log, _) = SegmentedLog::open(dir.path(), 1024, false).unwrap();
    log.append(&[rec(101, 4, b"after snapshot")]).unwrap();
    assert_eq!(log.first_index(), Some(101));
    drop(log);
    let (_, recs) = SegmentedLog::open(dir.path(), 1024, false).unwrap();
    assert_eq!(indexes(&recs), vec![101]);
}

#[test]
fn truncate_suffix_inside_and_across_segments() {
    let dir = tempdir().unwrap();
    let (mut log, _) = SegmentedLog::open(dir.path(), 256, false).unwrap();
    for i in 1..=30 {
        log.append(&[rec(i, 1, &[1u8; 32])]).unwrap();
    }
    let before = log.segment_count();

    log.truncate_suffix(12).unwrap();
    assert_eq!(log.last_index(), Some(11));
    assert!(log.segment_count() < before);

    // the log continues from the cut with a new term
    log.append(&[rec(12, 2, b"new")]).unwrap();
    drop(log);

    let (log, recs) = SegmentedLog::open(dir.path(), 256, false).unwrap();
    assert_eq!(indexes(&recs), (1..=12).collect::<Vec<_>>());
    assert_eq!(recs.last().unwrap().term, 2);
    assert_eq!(log.last_index(), Some(12));
}

#[test]
fn truncate_suffix_past_end_is_noop() {
    let dir = tempdir().unwrap();
    let (mut log, _) = SegmentedLog::open(dir.path(), 1024, false).unwrap();
    log.append(&[rec(1, 1, b"a")]).unwrap();
    log.truncate_suffix(5).unwrap();
    assert_eq!(log.last_index(), Some(1));
}

#[test]
fn compact_prefix_deletes_whole_sealed_segments_only() {
    let dir = tempdir().unwrap();
    let (mut log, _) = SegmentedLog::open(dir.path(), 256, false).unwrap();
    for i in 1..=40 {
        log.append(&[rec(i, 1, &[2u8; 32])]).unwrap();
    }
    let removed = log.compact_prefix(20).unwrap();
    assert!(removed > 0);
    let first = log.first_index().unwrap();
    assert!(first > 1 && first <= 21, "first index {} out of range", first);
    assert_eq!(log.last_index(), Some(40));

    // never deletes the active segment even when fully covered
    log.compact_prefix(1_000).unwrap();
    assert_eq!(log.segment_count(), 1);
    assert_eq!(log.last_index(), Some(40));
}

#[test]
fn torn_tail_segment_is_cut_back() {
    let dir = tempdir().unwrap();
    {
        let (mut log, _) = SegmentedLog::open(dir.path(), 1 << 20, false).unwrap();
        for i in 1..=3 {
            log.append(&[rec(i, 1, b"data")]).unwrap();
        }
    }
    let seg = fs::read_dir(dir.path())
        .unwrap()
        .map(|d| d.unwrap().path())
        .find(|p| p.extension().is_some_and(|e| e == "wal"))
        .unwrap();
    let mut data = fs::read(&seg).unwrap();
    let len = data.len();
    data[len - 1] ^= 0xFF; // damage the last record
    fs::write(&seg, &data).unwrap();

    let (mut log, recs) = SegmentedLog::open(dir.path(), 1 << 20, false).unwrap();
    assert_eq!(indexes(&recs), vec![1, 2]);
    log.append(&[rec(3, 2, b"rewritten")]).unwrap();
    drop(log);
    let (_, recs) = SegmentedLog::open(dir.path(), 1 << 20, false).unwrap();
    assert_eq!(indexes(&recs), vec![1, 2, 3]);
    assert_eq!(recs[2].payload, b"rewritten");
}

#[test]
fn damage_in_sealed_segment_is_fatal() {
    let dir = tempdir().unwrap();
    {
        let (mut log, _) = SegmentedLog::open(dir.path(), 128, false).unwrap();
        for i in 1..=20 {
            log.append(&[rec(i, 1, &[3u8; 40])]).unwrap();
        }
    }
    let mut segs: Vec<_> = fs::read_dir(dir.path())
        .unwrap()
        .map(|d| d.unwrap().path())
        .collect();
    segs.sort();
    let mut data = fs::read(&segs[0]).unwrap();
    data[12] ^= 0xFF;
    fs::write(&segs[0], &data).unwrap();

    assert!(matches!(
        SegmentedLog::open(dir.path(), 128, false),
        Err(WalError::Corrupt { .. })
    ));
}

/// Appends raw bytes to the newest segment, as a write that failed after
/// reaching the file would.
fn leave_stray_bytes(log: &SegmentedLog, bytes: &[u8]) {
    use std::io::Write;
    let path = log.tail_path().unwrap().to_path_buf();
    let mut f = fs::OpenOptions::new().append(true).open(path).unwrap();
    f.write_all(bytes).unwrap();
    f.sync_all().unwrap();
}

#[test]
fn retry_after_failed_full_frame_write_keeps_one_copy() {
    let dir = tempdir().unwrap();
    let (mut log, _) = SegmentedLog::open(dir.path(), 1 << 20, false).unwrap();
    log.append(&[rec(1, 1, b"one")]).unwrap();

    // the whole frame for 2 reached the file, but the append reported failure
    let mut frame = Vec::new();
    encode_frame(&rec(2, 1, b"lost"), &mut frame).unwrap();
    leave_stray_bytes(&log, &frame);

    log.append(&[rec(2, 2, b"two")]).unwrap();
    log.append(&[rec(3, 2, b"three")]).unwrap();
    drop(log);

    let (_, recs) = SegmentedLog::open(dir.path(), 1 << 20, false).unwrap();
    assert_eq!(indexes(&recs), vec![1, 2, 3]);
    assert_eq!(recs[1].payload, b"two");
    assert_eq!(recs[1].term, 2);
}

#[test]
fn retry_after_half_written_frame_keeps_later_records() {
    let dir = tempdir().unwrap();
    let (mut log, _) = SegmentedLog::open(dir.path(), 1 << 20, false).unwrap();
    log.append(&[rec(1, 1, b"one")]).unwrap();

    let mut frame = Vec::new();
    encode_frame(&rec(2, 1, b"half"), &mut frame).unwrap();
    leave_stray_bytes(&log, &frame[..frame.len() / 2]);

    log.append(&[rec(2, 1, b"two"), rec(3, 1, b"three")]).unwrap();
    log.append(&[rec(4, 1, b"four")]).unwrap();
    drop(log);

    let (_, recs) = SegmentedLog::open(dir.path(), 1 << 20, false).unwrap();
    assert_eq!(indexes(&recs), vec![1, 2, 3, 4]);
    assert_eq!(recs[3].payload, b"four");
}

#[test]
fn discard_unacknowledged_restores_acknowledged_length() {
    let dir = tempdir().unwrap();
    let (mut log, _) = SegmentedLog::open(dir.path(), 1 << 20, false).unwrap();
    log.append(&[rec(1, 1, b"one")]).unwrap();
    let acknowledged = fs::metadata(log.tail_path().unwrap()).unwrap().len();

    leave_stray_bytes(&log, &[0xAB; 13]);
    log.discard_unacknowledged().unwrap();
    assert_eq!(
        fs::metadata(log.tail_path().unwrap()).unwrap().len(),
        acknowledged
    );
    // nothing to cut the second time
    log.discard_unacknowledged().unwrap();
    drop(log);

    let (log, recs) = SegmentedLog::open(dir.path(), 1 << 20, false).unwrap();
    assert_eq!(indexes(&recs), vec![1]);
    assert_eq!(log.last_index(), Some(1));
}

#[test]
fn reset_discards_everything() {
    let dir = tempdir().unwrap();
    let (mut log, _) = SegmentedLog::open(dir.path(), 256, false).unwrap();
    for i in 1..=10 {
        log.append(&[rec(i, 1, b"x")]).unwrap();
    }
    log.reset().unwrap();
    assert_eq!(log.last_index(), None);
    log.append(&[rec(500, 3, b"y")]).unwrap();
    drop(log);
    let (_, recs) = SegmentedLog::open(dir.path(), 256, false).unwrap();
    assert_eq!(indexes(&recs), vec![500]);
}

// -------------------- Hard state --------------------

#[test]
fn hard_state_defaults_when_missing() {
    let dir = tempdir().unwrap();
    assert_eq!(HardState::load(dir.path()).unwrap(), HardState::default());
}

#[test]
fn hard_state_store_and_load() {
    let dir = tempdir().unwrap();
    let hs = HardState {
        term: 7,
        voted_for: Some(3),
        commit: 42,
    };
    hs.store(dir.path()).unwrap();
    assert_eq!(HardState::load(dir.path()).unwrap(), hs);

    let cleared = HardState {
        term: 8,
        voted_for: None,
        commit: 42,
    };
    cleared.store(dir.path()).unwrap();
    assert_eq!(HardState::load(dir.path()).unwrap(), cleared);
}

#[test]
fn hard_state_detects_bit_flip() {
    let dir = tempdir().unwrap();
    HardState {
        term: 1,
        voted_for: Some(1),
        commit: 0,
    }
    .store(dir.path())
    .unwrap();
    let path = HardState::path_in(dir.path());
    let mut data = fs::read(&path).unwrap();
    data[5] ^= 0x01;
    fs::write(&path, &data).unwrap();
    assert!(matches!(
        HardState::load(dir.path()),
        Err(WalError::Corrupt { .. })
    ));
}
