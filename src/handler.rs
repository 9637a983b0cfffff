//! Handler: the first pipeline stage. Classifies inbound records, answers
//! what it can answer locally, and forwards everything else toward the
//! [`crate::writer::Writer`].
//!
//! System monitor samples are injected here rather than at the IPC layer:
//! the Handler is the one place that already knows whether a run is active,
//! so it is also where monitoring starts and stops. The Handler also owns
//! the run's live summary table: it is the only task that ever mutates it,
//! so no locking is needed.

use crate::system_monitor::{Sample, SystemMonitor};
use proto::{MetricValue, Record, RecordData, RecordResult, ResultPayload, StatsRecord, SummaryRecord};
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;

pub const SYSTEM_MONITOR_INTERVAL: Duration = Duration::from_secs(10);

pub struct Handler {
    out_tx: mpsc::Sender<Record>,
    results_tx: mpsc::Sender<RecordResult>,
    monitor: Arc<dyn SystemMonitor>,
    summary: BTreeMap<String, MetricValue>,
    step: u64,
}

impl Handler {
    pub fn new(out_tx: mpsc::Sender<Record>, results_tx: mpsc::Sender<RecordResult>, monitor: Arc<dyn SystemMonitor>) -> Self {
        Handler {
            out_tx,
            results_tx,
            monitor,
            summary: BTreeMap::new(),
            step: 0,
        }
    }

    /// Run the handler loop until `in_rx` closes. Takes `&mut self` since
    /// the summary table and step counter are mutated per record; the
    /// caller owns the task and never shares this handle.
    pub async fn run(&mut self, mut in_rx: mpsc::Receiver<Record>) {
        let (sample_tx, mut sample_rx) = mpsc::channel::<Sample>(32);
        let mut monitoring = false;

        loop {
            tokio::select! {
                record = in_rx.recv() => {
                    let Some(mut record) = record else { break };
                    if record.is_local() {
                        if let RecordData::Request(req) = &record.data {
                            let kind = req.kind.clone();
                            self.handle_local_request(&record, &kind).await;
                        }
                        continue;
                    }
                    let derived_summary = self.classify(&mut record, &sample_tx, &mut monitoring);
                    if let Some(summary_record) = derived_summary {
                        if self.out_tx.send(summary_record).await.is_err() {
                            break;
                        }
                    }
                    if self.out_tx.send(record).await.is_err() {
                        break;
                    }
                }
                Some(sample) = sample_rx.recv(), if monitoring => {
                    let record = Record::new(RecordData::Stats(StatsRecord {
                        timestamp_ms: sample.timestamp_ms,
                        data: sample_to_map(&sample),
                    }));
                    if self.out_tx.send(record).await.is_err() {
                        break;
                    }
                }
            }
        }
        self.monitor.stop();
    }

    /// Applies the per-variant state update for `record` (step stamping,
    /// summary merge, monitor start/stop) and returns a derived `Summary`
    /// record to forward ahead of it, if one was produced.
    fn classify(&mut self, record: &mut Record, sample_tx: &mpsc::Sender<Sample>, monitoring: &mut bool) -> Option<Record> {
        match &mut record.data {
            RecordData::RunStart(_) if !*monitoring => {
                self.monitor.start(SYSTEM_MONITOR_INTERVAL, sample_tx.clone());
                *monitoring = true;
                None
            }
            RecordData::History(history) => {
                history.step = Some(self.step);
                self.step += 1;
                let mut changed = false;
                for (key, value) in &history.data {
                    if self.summary.get(key) != Some(value) {
                        self.summary.insert(key.clone(), value.clone());
                        changed = true;
                    }
                }
                changed.then(|| Record::new(RecordData::Summary(SummaryRecord { data: self.summary.clone() })))
            }
            RecordData::Exit(_) => {
                self.monitor.stop();
                *monitoring = false;
                Some(Record::new(RecordData::Summary(SummaryRecord { data: self.summary.clone() })))
            }
            _ => None,
        }
    }

    async fn handle_local_request(&self, record: &Record, kind: &str) {
        let payload = match kind {
            "ping" => ResultPayload::Ack,
            other => ResultPayload::Error {
                message: format!("unrecognized local request kind: {other}"),
            },
        };
        let responder_key = record.mailbox_slot().map(str::to_owned);
        let _ = self.results_tx.send(RecordResult::new(responder_key, payload)).await;
    }
}

fn sample_to_map(sample: &Sample) -> BTreeMap<String, f64> {
    let mut map = BTreeMap::new();
    if let Some(v) = sample.cpu_percent {
        map.insert("cpu_percent".to_owned(), v);
    }
    if let Some(v) = sample.memory_percent {
        map.insert("memory_percent".to_owned(), v);
    }
    if let Some(v) = sample.gpu_percent {
        map.insert("gpu_percent".to_owned(), v);
    }
    if let Some(v) = sample.gpu_memory_percent {
        map.insert("gpu_memory_percent".to_owned(), v);
    }
    map
}

#[cfg(test)]
mod tests {
    use super::*;
    use proto::{Control, ExitRecord, HistoryRecord, RequestRecord};

    struct NoopMonitor;
    impl SystemMonitor for NoopMonitor {
        fn start(&self, _interval: Duration, _tx: mpsc::Sender<Sample>) {}
        fn stop(&self) {}
    }

    #[tokio::test]
    async fn a_history_record_gets_an_increasing_step_and_a_derived_summary_on_change() {
        let (out_tx, mut out_rx) = mpsc::channel(8);
        let (results_tx, _results_rx) = mpsc::channel(8);
        let (in_tx, in_rx) = mpsc::channel(8);
        let mut handler = Handler::new(out_tx, results_tx, Arc::new(NoopMonitor));

        let mut data = BTreeMap::new();
        data.insert("loss".to_owned(), serde_json::json!(0.5));
        in_tx.send(Record::new(RecordData::History(HistoryRecord { step: None, data }))).await.unwrap();
        drop(in_tx);

        handler.run(in_rx).await;

        let summary = out_rx.recv().await.unwrap();
        match summary.data {
            RecordData::Summary(s) => assert_eq!(s.data.get("loss"), Some(&serde_json::json!(0.5))),
            other => panic!("expected a derived Summary first, got {other:?}"),
        }
        let history = out_rx.recv().await.unwrap();
        match history.data {
            RecordData::History(h) => assert_eq!(h.step, Some(0)),
            other => panic!("expected History, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn repeating_the_same_value_does_not_re_derive_a_summary() {
        let (out_tx, mut out_rx) = mpsc::channel(8);
        let (results_tx, _results_rx) = mpsc::channel(8);
        let (in_tx, in_rx) = mpsc::channel(8);
        let mut handler = Handler::new(out_tx, results_tx, Arc::new(NoopMonitor));

        let mut data = BTreeMap::new();
        data.insert("loss".to_owned(), serde_json::json!(0.5));
        in_tx.send(Record::new(RecordData::History(HistoryRecord { step: None, data: data.clone() }))).await.unwrap();
        in_tx.send(Record::new(RecordData::History(HistoryRecord { step: None, data }))).await.unwrap();
        drop(in_tx);

        handler.run(in_rx).await;

        assert!(matches!(out_rx.recv().await.unwrap().data, RecordData::Summary(_)));
        let first_history = out_rx.recv().await.unwrap();
        assert!(matches!(first_history.data, RecordData::History(h) if h.step == Some(0)));
        let second_history = out_rx.recv().await.unwrap();
        assert!(matches!(second_history.data, RecordData::History(h) if h.step == Some(1)));
        assert!(out_rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn exit_emits_a_final_summary_before_forwarding_the_exit_record() {
        let (out_tx, mut out_rx) = mpsc::channel(8);
        let (results_tx, _results_rx) = mpsc::channel(8);
        let (in_tx, in_rx) = mpsc::channel(8);
        let mut handler = Handler::new(out_tx, results_tx, Arc::new(NoopMonitor));

        in_tx.send(Record::new(RecordData::Exit(ExitRecord { exit_code: 0 }))).await.unwrap();
        drop(in_tx);

        handler.run(in_rx).await;

        assert!(matches!(out_rx.recv().await.unwrap().data, RecordData::Summary(_)));
        assert!(matches!(out_rx.recv().await.unwrap().data, RecordData::Exit(_)));
    }

    #[tokio::test]
    async fn a_local_ping_request_is_answered_through_the_results_channel_without_reaching_the_writer() {
        let (out_tx, mut out_rx) = mpsc::channel(8);
        let (results_tx, mut results_rx) = mpsc::channel(8);
        let (in_tx, in_rx) = mpsc::channel(8);
        let mut handler = Handler::new(out_tx, results_tx, Arc::new(NoopMonitor));

        let mut record = Record::new(RecordData::Request(RequestRecord {
            kind: "ping".to_owned(),
            payload: serde_json::Value::Null,
        }));
        record.control = Some(Control {
            local: true,
            mailbox_slot: Some("slot-1".to_owned()),
            req_resp: true,
            ..Default::default()
        });
        in_tx.send(record).await.unwrap();
        drop(in_tx);

        handler.run(in_rx).await;
        assert!(out_rx.try_recv().is_err());

        let result = results_rx.recv().await.unwrap();
        assert_eq!(result.responder_key.as_deref(), Some("slot-1"));
        assert!(matches!(result.payload, ResultPayload::Ack));
    }

    #[tokio::test]
    async fn an_unrecognized_local_request_kind_answers_with_an_error() {
        let (out_tx, _out_rx) = mpsc::channel(8);
        let (results_tx, mut results_rx) = mpsc::channel(8);
        let (in_tx, in_rx) = mpsc::channel(8);
        let mut handler = Handler::new(out_tx, results_tx, Arc::new(NoopMonitor));

        let mut record = Record::new(RecordData::Request(RequestRecord {
            kind: "unknown".to_owned(),
            payload: serde_json::Value::Null,
        }));
        record.control = Some(Control {
            local: true,
            mailbox_slot: Some("slot-2".to_owned()),
            req_resp: true,
            ..Default::default()
        });
        in_tx.send(record).await.unwrap();
        drop(in_tx);

        handler.run(in_rx).await;
        let result = results_rx.recv().await.unwrap();
        assert!(matches!(result.payload, ResultPayload::Error { .. }));
    }
}
