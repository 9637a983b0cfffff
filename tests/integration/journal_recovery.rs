//! Crash recovery: a journal that was never closed gracefully still
//! replays everything that was actually flushed, and can be reopened to
//! keep appending rather than being treated as corrupt.

use core_service::store::Journal;
use proto::{ExitRecord, HistoryRecord, Record, RecordData, RunStartRecord};
use std::collections::BTreeMap;
use tempfile::tempdir;

fn run_start(id: &str) -> Record {
    Record::new(RecordData::RunStart(RunStartRecord {
        run_id: id.to_owned(),
        project: "demo".to_owned(),
        entity: None,
        display_name: None,
    }))
}

#[tokio::test]
async fn records_flushed_before_an_ungraceful_shutdown_survive_replay() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("run.log");

    {
        let mut journal = Journal::open(&path).await.unwrap();
        journal.append(&run_start("r1")).await.unwrap();
        let mut data = BTreeMap::new();
        data.insert("loss".to_owned(), serde_json::json!(0.2));
        journal.append(&Record::new(RecordData::History(HistoryRecord { step: Some(1), data }))).await.unwrap();
        journal.flush().await.unwrap();
        // No Exit record and no explicit close: this models a process
        // that was killed mid-run.
    }

    let records = Journal::replay(&path).await.unwrap();
    assert_eq!(records.len(), 2);
    assert!(matches!(records[0].data, RecordData::RunStart(_)));
    assert!(matches!(records[1].data, RecordData::History(_)));

    // Reopening for more appends continues the same file rather than
    // starting over or rejecting it as corrupt.
    let mut journal = Journal::open(&path).await.unwrap();
    journal.append(&Record::new(RecordData::Exit(ExitRecord { exit_code: 137 }))).await.unwrap();
    journal.flush().await.unwrap();

    let records = Journal::replay(&path).await.unwrap();
    assert_eq!(records.len(), 3);
    assert!(matches!(records[2].data, RecordData::Exit(ExitRecord { exit_code: 137 })));
}

#[tokio::test]
async fn a_length_prefix_for_a_never_written_frame_does_not_lose_prior_records() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("run.log");

    {
        let mut journal = Journal::open(&path).await.unwrap();
        journal.append(&run_start("r1")).await.unwrap();
        journal.flush().await.unwrap();
    }

    // Simulate a crash exactly after the length prefix of the next frame
    // was written but before any of its payload landed on disk.
    {
        use tokio::io::AsyncWriteExt;
        let mut file = tokio::fs::OpenOptions::new().append(true).open(&path).await.unwrap();
        file.write_all(&500u32.to_le_bytes()).await.unwrap();
        file.flush().await.unwrap();
    }

    let records = Journal::replay(&path).await.unwrap();
    assert_eq!(records.len(), 1);
}
