//! A mailbox slot with no matching reply observes cancellation once
//! the stream is closed, rather than hanging forever.

use core_service::config::ServiceConfig;
use core_service::mailbox::MailboxOutcome;
use core_service::settings::{Settings, SettingsParams};
use core_service::stream::Stream;
use proto::RunStartRecord;
use test_support::MockServer;

#[tokio::test]
async fn an_orphaned_mailbox_slot_is_cancelled_on_close() {
    let server = MockServer::start().await;
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

    let reader = stream.reserve_slot("orphan");
    stream.close().await.unwrap();

    assert!(matches!(reader.recv().await, MailboxOutcome::Cancelled));
}
