//! Pushing far more records than the inter-stage channel capacity
//! never drops one — a full channel makes `push` wait, it does not make
//! the record disappear.

use core_service::config::ServiceConfig;
use core_service::settings::{Settings, SettingsParams};
use core_service::stream::{Stream, CHANNEL_CAPACITY};
use core_service::store::Journal;
use proto::{HistoryRecord, Record, RecordData, RunStartRecord};
use std::collections::BTreeMap;
use test_support::MockServer;

#[tokio::test]
async fn pushing_well_past_channel_capacity_loses_nothing() {
    let server = MockServer::start().await;
    server.respond_json("/runs/start", 200, serde_json::json!({ "run_id": "r1" })).await;
    server.respond_json("/runs/r1/history", 200, serde_json::json!({})).await;
    // Every history push below carries a distinct value, so the Handler's
    // merge derives a fresh summary each time; without this route those
    // pushes would 404 and retry instead of flowing straight through.
    server.respond_json("/runs/r1/summary", 200, serde_json::json!({})).await;
    server.respond_json("/runs/r1/exit", 200, serde_json::json!({})).await;

    let run_start = RunStartRecord { run_id: "r1".to_owned(), project: "demo".to_owned(), entity: None, display_name: None };
    let config = ServiceConfig::default();
    let run_dir = tempfile::tempdir().unwrap();
    let settings = Settings::resolve(SettingsParams {
        run_start: &run_start,
        base_url: server.base_url(),
        offline: false,
        sync: false,
        run_dir: run_dir.path().to_path_buf(),
        config: &config,
    });
    let journal = Journal::open(&settings.journal_path).await.unwrap();
    let stream = Stream::start(&settings, &config, Some(journal), reqwest::Client::new(), None);

    let history_count = CHANNEL_CAPACITY * 10;
    stream.push(Record::new(RecordData::RunStart(run_start))).await;
    for step in 0..history_count {
        let mut data = BTreeMap::new();
        data.insert("step".to_owned(), serde_json::json!(step));
        stream.push(Record::new(RecordData::History(HistoryRecord { step: Some(step as u64), data }))).await;
    }
    let (_, closed) = stream.finish_and_close(0).await;
    closed.unwrap();

    let records = Journal::replay(&settings.journal_path).await.unwrap();
    let history_records = records.iter().filter(|r| matches!(r.data, RecordData::History(_))).count();
    assert_eq!(history_records, history_count);

    assert_eq!(server.received_bodies("/runs/r1/history").len(), history_count);

    // num is dense and monotonic across the whole run, not just within one
    // stage's view of it.
    let nums: Vec<i64> = records.iter().map(|r| r.num).collect();
    let mut sorted = nums.clone();
    sorted.sort_unstable();
    assert_eq!(nums, sorted);
    assert_eq!(nums.first().copied(), Some(1));
}

