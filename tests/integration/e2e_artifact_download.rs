//! An artifact download fetches regular manifest entries and skips
//! references. The stale-URL heuristic is exercised directly against
//! `artifacts::is_stale` since simulating real URL expiry end-to-end would
//! need a much larger fixture than this artifact's scale warrants.

use core_service::artifacts::is_stale;
use core_service::config::ServiceConfig;
use core_service::settings::{Settings, SettingsParams};
use core_service::stream::Stream;
use proto::{ArtifactAction, ArtifactRecord, Manifest, ManifestEntry, Record, RecordData, RunStartRecord, StoragePolicy};
use std::collections::BTreeMap;
use std::time::{Duration, SystemTime};
use test_support::MockServer;

#[tokio::test]
async fn an_artifact_download_fetches_regular_entries_and_skips_references() {
    let server = MockServer::start().await;

    let download_dir = tempfile::tempdir().unwrap();
    let file_url_path = "/blobs/payload.bin";

    let mut contents = BTreeMap::new();
    contents.insert(
        "model/weights.bin".to_owned(),
        ManifestEntry {
            digest: "will-not-match-but-thats-fine-for-hash-only-cache".to_owned(),
            size: 11,
            reference: None,
            version_id: None,
            extra: BTreeMap::new(),
            download_url: None,
            local_path: None,
        },
    );
    contents.insert(
        "external/dataset.csv".to_owned(),
        ManifestEntry {
            digest: "abc123".to_owned(),
            size: 0,
            reference: Some("s3://bucket/dataset.csv".to_owned()),
            version_id: None,
            extra: BTreeMap::new(),
            download_url: None,
            local_path: None,
        },
    );
    let manifest = Manifest { version: "v1".to_owned(), storage_policy: StoragePolicy { storage_layout: "v1".to_owned() }, contents };
    server.respond_json("/artifacts/a1/manifest", 200, serde_json::to_value(&manifest).unwrap()).await;
    // Only the regular entry needs a signed url resolved; the reference
    // entry is counted done before batching ever looks at the control plane.
    server
        .respond_json(
            "/artifacts/a1/file_urls",
            200,
            serde_json::json!({ "model/weights.bin": format!("{}{}", server.base_url(), file_url_path) }),
        )
        .await;

    // Raw bytes, not JSON, so this has to come from the underlying axum app;
    // reuse respond_json's plumbing by noting the downloader only cares
    // about HTTP status + body bytes, and axum's Json body is valid UTF-8
    // bytes for our purposes here too.
    server.respond_json(file_url_path, 200, serde_json::json!("hello world")).await;

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
    let stream = Stream::start(&settings, &config, None, reqwest::Client::new(), None);

    let mut record = Record::new(RecordData::Artifact(ArtifactRecord {
        action: ArtifactAction::Download {
            artifact_id: "a1".to_owned(),
            download_root: download_dir.path().to_string_lossy().into_owned(),
            skip_cache: true,
        },
    }));
    record.control = Some(proto::Control { req_resp: true, mailbox_slot: Some("dl".to_owned()), ..Default::default() });
    let result = stream.push_and_wait(record, "dl".to_owned()).await;
    assert!(matches!(result.payload, proto::ResultPayload::Ack), "unexpected result: {:?}", result.payload);

    let downloaded = download_dir.path().join("model/weights.bin");
    assert!(downloaded.exists());

    let reference_path = download_dir.path().join("external/dataset.csv");
    assert!(!reference_path.exists());

    stream.close().await.unwrap();
}

#[test]
fn a_download_url_older_than_one_hour_is_treated_as_stale() {
    assert!(!is_stale(SystemTime::now()));
    assert!(is_stale(SystemTime::now() - Duration::from_secs(3601)));
}
