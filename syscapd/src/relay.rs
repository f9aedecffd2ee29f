//! Metrics relay (C7): for every successfully attributed event, emits
//! `(node, profile, mount_namespace)` to an external sink, tolerating send
//! failures (§4.7).

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use log::warn;
use serde::Serialize;
use tokio::io::AsyncWriteExt;
use tokio::net::UnixStream;
use tokio::sync::Mutex;

#[derive(Debug, Clone, Serialize)]
pub struct MetricRecord {
    pub node: String,
    pub profile: String,
    pub mount_namespace: u32,
}

/// Narrow capability over the external metrics sink, so the relay can be
/// tested without a real socket on the other end (§9 design notes).
#[async_trait]
pub trait MetricsSink: Send + Sync {
    async fn send(&self, record: MetricRecord);
}

/// Streams newline-delimited JSON over an outbound Unix-domain-socket
/// connection — the same ndjson-over-a-persistent-writer idiom this
/// workspace uses elsewhere for its event log, generalized to a socket.
pub struct UnixSocketMetricsSink {
    writer: Mutex<Option<UnixStream>>,
    socket_path: String,
}

impl UnixSocketMetricsSink {
    /// Connects with an unbounded "always retry" backoff, the same
    /// policy every other retry loop in this agent uses (§7/§9). Blocks
    /// at startup until the sink is reachable.
    pub async fn connect(socket_path: String) -> Self {
        let stream = Self::connect_with_retry(&socket_path).await;
        Self {
            writer: Mutex::new(Some(stream)),
            socket_path,
        }
    }

    async fn connect_with_retry(path: &str) -> UnixStream {
        let mut delay = Duration::from_millis(100);
        loop {
            match UnixStream::connect(path).await {
                Ok(stream) => return stream,
                Err(err) => {
                    warn!("metrics sink connect to {path} failed ({err}); retrying");
                    tokio::time::sleep(delay).await;
                    delay = (delay * 2).min(Duration::from_secs(30));
                }
            }
        }
    }
}

#[async_trait]
impl MetricsSink for UnixSocketMetricsSink {
    async fn send(&self, record: MetricRecord) {
        let Ok(mut line) = serde_json::to_vec(&record) else {
            warn!("failed to serialize metric record for {}", record.profile);
            return;
        };
        line.push(b'\n');

        let mut guard = self.writer.lock().await;
        let Some(stream) = guard.as_mut() else {
            warn!("metrics sink to {} has no connection; dropping record", self.socket_path);
            return;
        };
        if let Err(err) = stream.write_all(&line).await {
            warn!("metrics send to {} failed ({err}); dropping record", self.socket_path);
        }
    }
}

/// In-memory fake that records every send for test assertions.
#[derive(Default)]
pub struct FakeMetricsSink {
    pub records: Mutex<Vec<MetricRecord>>,
}

impl FakeMetricsSink {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }
}

#[async_trait]
impl MetricsSink for FakeMetricsSink {
    async fn send(&self, record: MetricRecord) {
        self.records.lock().await.push(record);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn fake_sink_records_every_send() {
        let sink = FakeMetricsSink::new();
        sink.send(MetricRecord {
            node: "node-1".to_string(),
            profile: "myprofile".to_string(),
            mount_namespace: 4026532001,
        })
        .await;
        assert_eq!(sink.records.lock().await.len(), 1);
    }
}
