use log::{info, warn};
use serde::Serialize;
use std::sync::Arc;
use thiserror::Error;
use tokio::io::AsyncWriteExt;
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use crate::metrics::METRICS;
use crate::models::ProcessNode;

// 转发队列满时丢弃，不阻塞事件处理
const FORWARD_QUEUE: usize = 256;

#[derive(Debug, Error)]
pub enum SinkError {
    #[error("failed to encode record: {0}")]
    Encode(#[from] serde_json::Error),
    #[error("collector at {addr} unreachable")]
    Unreachable { addr: String },
    #[error("send to {addr} failed after reconnect: {source}")]
    Send {
        addr: String,
        #[source]
        source: std::io::Error,
    },
}

/// Newline-delimited JSON over a persistent TCP connection.
pub struct RemoteSink {
    addr: String,
    stream: Option<TcpStream>,
}

impl RemoteSink {
    pub fn new(addr: impl Into<String>) -> Self {
        Self {
            addr: addr.into(),
            stream: None,
        }
    }

    pub fn addr(&self) -> &str {
        &self.addr
    }

    #[cfg(test)]
    pub fn is_connected(&self) -> bool {
        self.stream.is_some()
    }

    pub async fn connect(&mut self) -> bool {
        match TcpStream::connect(&self.addr).await {
            Ok(stream) => {
                info!("Connected to collector at {}", self.addr);
                self.stream = Some(stream);
                true
            }
            Err(e) => {
                warn!("Collector at {} is not reachable: {}", self.addr, e);
                self.stream = None;
                false
            }
        }
    }

    /// Writes one record. A broken connection gets exactly one
    /// reconnect-and-resend before the error is returned.
    pub async fn send<T: Serialize>(&mut self, record: &T) -> Result<(), SinkError> {
        let mut line = serde_json::to_vec(record)?;
        line.push(b'\n');

        let first = match self.stream.as_mut() {
            Some(stream) => match stream.write_all(&line).await {
                Ok(()) => return Ok(()),
                Err(e) => Some(e),
            },
            None => None,
        };
        if let Some(e) = &first {
            warn!("Connection to {} lost ({}), reconnecting...", self.addr, e);
        }

        self.stream = None;
        if !self.connect().await {
            return Err(SinkError::Unreachable {
                addr: self.addr.clone(),
            });
        }
        let Some(stream) = self.stream.as_mut() else {
            return Err(SinkError::Unreachable {
                addr: self.addr.clone(),
            });
        };
        if let Err(source) = stream.write_all(&line).await {
            self.stream = None;
            return Err(SinkError::Send {
                addr: self.addr.clone(),
                source,
            });
        }
        Ok(())
    }

    pub async fn close(&mut self) {
        if let Some(mut stream) = self.stream.take() {
            match stream.shutdown().await {
                Ok(()) => info!("Connection to {} closed", self.addr),
                Err(e) => warn!("Error while closing connection to {}: {}", self.addr, e),
            }
        }
    }
}

/// Moves the sink onto its own task so the ingestion loop never waits on the
/// network. Records queued while the collector is slow are dropped once the
/// queue is full. The connection is closed when the sender is dropped.
pub fn spawn_forwarder(mut sink: RemoteSink) -> (mpsc::Sender<Arc<ProcessNode>>, JoinHandle<()>) {
    let (tx, mut rx) = mpsc::channel::<Arc<ProcessNode>>(FORWARD_QUEUE);
    let handle = tokio::spawn(async move {
        if !sink.connect().await {
            warn!("Forwarding to {} will retry on the next record", sink.addr());
        }
        while let Some(subtree) = rx.recv().await {
            if let Err(e) = sink.send(subtree.as_ref()).await {
                warn!("Dropped subtree {}: {}", subtree.pid, e);
                METRICS.sink_failures_total.inc();
            }
        }
        sink.close().await;
    });
    (tx, handle)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use tokio::io::{AsyncBufReadExt, BufReader};
    use tokio::net::TcpListener;

    #[tokio::test]
    async fn sends_one_json_object_per_line() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap().to_string();

        let reader = tokio::spawn(async move {
            let (socket, _) = listener.accept().await.unwrap();
            let mut lines = BufReader::new(socket).lines();
            let mut out = Vec::new();
            while let Some(line) = lines.next_line().await.unwrap() {
                out.push(line);
            }
            out
        });

        let mut sink = RemoteSink::new(addr);
        assert!(sink.connect().await);
        sink.send(&json!({"pid": 100, "comm": "worker"})).await.unwrap();
        sink.send(&json!({"pid": 200})).await.unwrap();
        sink.close().await;
        assert!(!sink.is_connected());

        let lines = reader.await.unwrap();
        assert_eq!(lines.len(), 2);
        let first: serde_json::Value = serde_json::from_str(&lines[0]).unwrap();
        assert_eq!(first["comm"], "worker");
    }

    #[tokio::test]
    async fn connect_to_closed_port_fails_softly() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap().to_string();
        drop(listener);

        let mut sink = RemoteSink::new(addr);
        assert!(!sink.connect().await);
        assert!(matches!(
            sink.send(&json!({"pid": 1})).await,
            Err(SinkError::Unreachable { .. })
        ));
    }

    #[tokio::test]
    async fn send_reconnects_once_when_not_connected() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap().to_string();

        let reader = tokio::spawn(async move {
            let (socket, _) = listener.accept().await.unwrap();
            let mut lines = BufReader::new(socket).lines();
            lines.next_line().await.unwrap()
        });

        let mut sink = RemoteSink::new(addr.clone());
        assert_eq!(sink.addr(), addr);
        sink.send(&json!({"pid": 7})).await.unwrap();
        assert!(sink.is_connected());

        let line = reader.await.unwrap().unwrap();
        assert_eq!(line, r#"{"pid":7}"#);
    }
}
