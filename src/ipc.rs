//! IPC front-end: a loopback-only TCP listener, one connection per client
//! process, framed with the same length-prefixed JSON used by the journal.
//!
//! The bound port is published through a "port file" rather than a fixed
//! port: the OS picks an ephemeral port, we write it down, and the client
//! (which spawned us) reads it back. The file is written atomically
//! (temp file, then rename) so a reader never observes a half-written
//! value.

use crate::config::ServiceConfig;
use crate::error::FatalError;
use crate::settings::{Settings, SettingsParams};
use crate::store::Journal;
use crate::stream::Stream;
use proto::{Record, RecordData};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::io::BufReader;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::Mutex;

/// Bind a loopback listener on an OS-assigned port and write `port_file`
/// with `sock=<host>:<port>\n` followed by an `EOF\n` sentinel, matching
/// what the client-side reader polls for.
pub async fn bind_and_publish_port(port_file: &Path) -> Result<TcpListener, FatalError> {
    let listener = TcpListener::bind("127.0.0.1:0").await.map_err(FatalError::BindListener)?;
    let addr = listener.local_addr().map_err(FatalError::BindListener)?;

    let tmp_path = port_file.with_extension("tmp");
    let contents = format!("sock={}:{}\nEOF\n", addr.ip(), addr.port());
    tokio::fs::write(&tmp_path, contents)
        .await
        .map_err(|source| FatalError::PortFile { path: tmp_path.clone(), source })?;
    tokio::fs::rename(&tmp_path, port_file)
        .await
        .map_err(|source| FatalError::PortFile { path: port_file.to_path_buf(), source })?;

    Ok(listener)
}

/// Owns everything needed to turn a `RunStart` into a fully wired
/// [`Stream`] on demand, and the table of runs already started. One
/// process can host more than one concurrent run (offline-sync replay
/// alongside a live run), so lookups are keyed by run id.
pub struct RunSupervisor {
    config: ServiceConfig,
    http: reqwest::Client,
    runs_root: PathBuf,
    base_url: String,
    offline: bool,
    metrics_probe_path: Option<PathBuf>,
    streams: Mutex<HashMap<String, Arc<Stream>>>,
}

impl RunSupervisor {
    pub fn new(
        config: ServiceConfig,
        http: reqwest::Client,
        runs_root: PathBuf,
        base_url: String,
        offline: bool,
        metrics_probe_path: Option<PathBuf>,
    ) -> Self {
        RunSupervisor {
            config,
            http,
            runs_root,
            base_url,
            offline,
            metrics_probe_path,
            streams: Mutex::new(HashMap::new()),
        }
    }

    pub async fn get(&self, run_id: &str) -> Option<Arc<Stream>> {
        self.streams.lock().await.get(run_id).cloned()
    }

    /// Remove this run's table entry and, if this connection held the only
    /// reference, close it properly: wait for every stage to drain and run
    /// the shutdown durability check. A degraded journal for one run is
    /// logged, not fatal to the listener — other runs may still be healthy.
    pub async fn remove(&self, run_id: &str) {
        let Some(stream) = self.streams.lock().await.remove(run_id) else {
            return;
        };
        match Arc::try_unwrap(stream) {
            Ok(stream) => {
                if let Err(e) = stream.close().await {
                    tracing::error!(run_id = %run_id, error = %e, "run finished with a degraded journal");
                }
            }
            Err(_) => tracing::debug!(run_id = %run_id, "stream still referenced elsewhere, leaving it running"),
        }
    }

    /// Look up `run_start.run_id`, creating and registering a new `Stream`
    /// if this is the first time it's been seen.
    pub async fn get_or_create(&self, run_start: &proto::RunStartRecord) -> Arc<Stream> {
        let mut streams = self.streams.lock().await;
        if let Some(existing) = streams.get(&run_start.run_id) {
            return existing.clone();
        }

        let run_dir = self.runs_root.join(&run_start.run_id);
        let settings = Settings::resolve(SettingsParams {
            run_start,
            base_url: self.base_url.clone(),
            offline: self.offline,
            sync: false,
            run_dir,
            config: &self.config,
        });
        let journal = match Journal::open(&settings.journal_path).await {
            Ok(j) => Some(j),
            Err(e) => {
                tracing::error!(error = %e, "failed to open journal for new run, continuing without persistence");
                None
            }
        };
        let stream = Arc::new(Stream::start(&settings, &self.config, journal, self.http.clone(), self.metrics_probe_path.clone()));
        streams.insert(run_start.run_id.clone(), stream.clone());
        stream
    }
}

pub async fn accept_loop(listener: TcpListener, supervisor: Arc<RunSupervisor>) {
    loop {
        let (socket, _addr) = match listener.accept().await {
            Ok(pair) => pair,
            Err(e) => {
                tracing::warn!(error = %e, "accept failed");
                continue;
            }
        };
        let supervisor = supervisor.clone();
        tokio::spawn(async move {
            if let Err(e) = handle_connection(socket, supervisor).await {
                tracing::warn!(error = %e, "ipc connection ended with an error");
            }
        });
    }
}

async fn handle_connection(socket: TcpStream, supervisor: Arc<RunSupervisor>) -> Result<(), crate::framing::FramingError> {
    let (read_half, mut write_half) = socket.into_split();
    let mut reader = BufReader::new(read_half);
    let mut current_run_id: Option<String> = None;

    loop {
        let Some(payload) = crate::framing::read_frame(&mut reader).await? else {
            break;
        };
        let record: Record = match serde_json::from_slice(&payload) {
            Ok(r) => r,
            Err(e) => {
                tracing::warn!(error = %e, "dropping unparsable record from ipc connection");
                continue;
            }
        };

        let stream = match &record.data {
            RecordData::RunStart(run_start) => {
                current_run_id = Some(run_start.run_id.clone());
                supervisor.get_or_create(run_start).await
            }
            _ => {
                let Some(run_id) = current_run_id.clone() else {
                    tracing::warn!("record received before run_start on this connection, dropping");
                    continue;
                };
                let Some(stream) = supervisor.get(&run_id).await else {
                    tracing::warn!(run_id = %run_id, "record for unknown run, dropping");
                    continue;
                };
                stream
            }
        };

        let is_exit = matches!(record.data, RecordData::Exit(_));

        if record.req_resp() {
            let slot = format!("ipc-{}", uuid::Uuid::new_v4());
            let result = stream.push_and_wait(record, slot).await;
            let bytes = serde_json::to_vec(&result).unwrap_or_default();
            crate::framing::write_frame(&mut write_half, &bytes).await?;
        } else {
            stream.push(record).await;
        }

        if is_exit {
            if let Some(run_id) = current_run_id.clone() {
                supervisor.remove(&run_id).await;
            }
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[tokio::test]
    async fn the_port_file_contains_a_parseable_socket_line() {
        let dir = tempdir().unwrap();
        let port_file = dir.path().join("port.txt");
        let listener = bind_and_publish_port(&port_file).await.unwrap();

        let contents = tokio::fs::read_to_string(&port_file).await.unwrap();
        assert!(contents.starts_with("sock=127.0.0.1:"));
        assert!(contents.ends_with("EOF\n"));
        drop(listener);
    }
}
