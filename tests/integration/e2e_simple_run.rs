//! A single online run flows start -> history -> summary -> exit, and
//! every non-local record both lands in the journal and reaches the
//! remote. The Summary records here are never sent by the client: the
//! Handler derives them itself from the History merge and again at Exit.

use core_service::config::ServiceConfig;
use core_service::framing::{read_frame, write_frame};
use core_service::ipc::{self, RunSupervisor};
use proto::{ExitRecord, HistoryRecord, Record, RecordData, RunStartRecord};
use std::collections::BTreeMap;
use std::sync::Arc;
use test_support::MockServer;
use tokio::net::TcpStream;

async fn send(stream: &mut TcpStream, record: &Record) {
    let bytes = serde_json::to_vec(record).unwrap();
    write_frame(stream, &bytes).await.unwrap();
}

async fn recv_result(stream: &mut TcpStream) -> proto::RecordResult {
    let payload = read_frame(stream).await.unwrap().unwrap();
    serde_json::from_slice(&payload).unwrap()
}

#[tokio::test]
async fn a_simple_run_reaches_the_remote_and_the_journal() {
    let server = MockServer::start().await;
    server.respond_json("/runs/start", 200, serde_json::json!({ "run_id": "r1" })).await;
    server.respond_json("/runs/r1/history", 200, serde_json::json!({})).await;
    server.respond_json("/runs/r1/summary", 200, serde_json::json!({})).await;
    server.respond_json("/runs/r1/exit", 200, serde_json::json!({})).await;

    let runs_root = tempfile::tempdir().unwrap();
    let supervisor = Arc::new(RunSupervisor::new(
        ServiceConfig::default(),
        reqwest::Client::new(),
        runs_root.path().to_path_buf(),
        server.base_url(),
        false,
        None,
    ));
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(ipc::accept_loop(listener, supervisor));

    let mut client = TcpStream::connect(addr).await.unwrap();

    let mut run_start = Record::new(RecordData::RunStart(RunStartRecord {
        run_id: "r1".to_owned(),
        project: "demo".to_owned(),
        entity: None,
        display_name: None,
    }));
    run_start.control = Some(proto::Control { req_resp: true, mailbox_slot: Some("s1".to_owned()), ..Default::default() });
    send(&mut client, &run_start).await;
    let result = recv_result(&mut client).await;
    assert!(matches!(result.payload, proto::ResultPayload::RunStartAck { run_id } if run_id == "r1"));

    let mut history_data = BTreeMap::new();
    history_data.insert("loss".to_owned(), serde_json::json!(0.5));
    // `step` is left unset here: it's stamped by the Handler off its own
    // counter, never supplied by the client.
    send(&mut client, &Record::new(RecordData::History(HistoryRecord { step: None, data: history_data }))).await;

    let mut exit = Record::new(RecordData::Exit(ExitRecord { exit_code: 0 }));
    exit.control = Some(proto::Control { req_resp: true, mailbox_slot: Some("s2".to_owned()), ..Default::default() });
    send(&mut client, &exit).await;
    let result = recv_result(&mut client).await;
    assert!(matches!(result.payload, proto::ResultPayload::Exit { exit_code: 0 }));

    // Give the writer a moment to flush before reading the journal back.
    tokio::time::sleep(std::time::Duration::from_millis(50)).await;
    let journal_path = runs_root.path().join("r1").join("run.log");
    let records = core_service::store::Journal::replay(&journal_path).await.unwrap();
    assert!(records.iter().any(|r| matches!(r.data, RecordData::History(_))));
    assert!(records.iter().any(|r| matches!(r.data, RecordData::Summary(_))));
    assert!(records.iter().any(|r| matches!(r.data, RecordData::Exit(_))));

    assert_eq!(server.received_bodies("/runs/r1/history").len(), 1);
    // One derived summary push from the history merge, one final flush at
    // exit: both come from the Handler, never from the client directly.
    assert_eq!(server.received_bodies("/runs/r1/summary").len(), 2);
}
