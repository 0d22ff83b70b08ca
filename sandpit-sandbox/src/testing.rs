//! Scripted contexts for driving the host side deterministically in tests

use crate::runtime::{ContextConnection, Runtime, Terminator};
use crate::Result;
use async_trait::async_trait;
use futures::StreamExt;
use sandpit_common::{decode_line, encode_line, HostMessage, WorkerMessage};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::io::{AsyncWriteExt, DuplexStream, ReadHalf, WriteHalf};
use tokio::sync::mpsc;
use tokio_util::codec::{FramedRead, LinesCodec};

/// Runtime whose contexts are played by the test through [`ScriptedWorker`]
pub struct ScriptedRuntime {
    workers: mpsc::UnboundedSender<ScriptedWorker>,
    connects: Arc<AtomicUsize>,
}

impl ScriptedRuntime {
    /// Every `connect` delivers the worker end of the new context on the receiver
    pub fn new() -> (Self, mpsc::UnboundedReceiver<ScriptedWorker>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (
            Self {
                workers: tx,
                connects: Arc::new(AtomicUsize::new(0)),
            },
            rx,
        )
    }

    /// Shared counter of contexts created so far
    pub fn connect_count(&self) -> Arc<AtomicUsize> {
        self.connects.clone()
    }
}

#[async_trait]
impl Runtime for ScriptedRuntime {
    async fn connect(&self) -> Result<ContextConnection> {
        let (host_side, worker_side) = tokio::io::duplex(64 * 1024);
        let (host_read, host_write) = tokio::io::split(host_side);
        let (worker_read, worker_write) = tokio::io::split(worker_side);
        let terminated = Arc::new(AtomicBool::new(false));

        self.connects.fetch_add(1, Ordering::SeqCst);
        let _ = self.workers.send(ScriptedWorker {
            requests: FramedRead::new(worker_read, LinesCodec::new()),
            writer: worker_write,
            terminated: terminated.clone(),
        });

        Ok(ContextConnection {
            reader: Box::new(host_read),
            writer: Box::new(host_write),
            terminator: Box::new(FlagTerminator { terminated }),
        })
    }

    fn name(&self) -> &str {
        "scripted"
    }
}

struct FlagTerminator {
    terminated: Arc<AtomicBool>,
}

#[async_trait]
impl Terminator for FlagTerminator {
    async fn terminate(&mut self) {
        self.terminated.store(true, Ordering::SeqCst);
    }
}

/// The context side of a scripted connection
pub struct ScriptedWorker {
    requests: FramedRead<ReadHalf<DuplexStream>, LinesCodec>,
    writer: WriteHalf<DuplexStream>,
    terminated: Arc<AtomicBool>,
}

impl ScriptedWorker {
    pub async fn ready(&mut self) {
        self.send(WorkerMessage::Ready {
            runtime: "scripted".into(),
        })
        .await;
    }

    /// Write a message; errors are ignored since the host may already be gone
    pub async fn send(&mut self, message: WorkerMessage) {
        if let Ok(line) = encode_line(&message) {
            self.send_raw(&line).await;
        }
    }

    pub async fn send_raw(&mut self, line: &str) {
        let _ = self.writer.write_all(line.as_bytes()).await;
        let _ = self.writer.write_all(b"\n").await;
    }

    /// Next request from the host, `None` once the host hangs up
    pub async fn next_request(&mut self) -> Option<HostMessage> {
        let line = self.requests.next().await?.ok()?;
        decode_line(&line).ok()
    }

    pub fn was_terminated(&self) -> bool {
        self.terminated.load(Ordering::SeqCst)
    }
}
