//! Host endpoint of the execution channel

use crate::error::SandboxError;
use crate::runtime::{BoxedReader, BoxedWriter, ContextConnection, Runtime, Terminator};
use crate::Result;
use futures::{SinkExt, StreamExt};
use sandpit_common::{
    decode_line, encode_line, ExecutionRequest, HostMessage, ProtocolError, RunId, WorkerMessage,
    MAX_FRAME_BYTES,
};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::codec::{FramedRead, FramedWrite, LinesCodec};

const EVENT_BUFFER: usize = 256;

/// An execution request already encoded as one channel frame
#[derive(Debug, Clone)]
pub struct RequestFrame {
    run_id: RunId,
    code_len: usize,
    line: String,
}

impl RequestFrame {
    /// Encode `request`, refusing code that cannot fit in a single frame
    pub fn encode(request: ExecutionRequest) -> Result<Self> {
        let run_id = request.run_id;
        let code_len = request.code.len();
        let line = encode_line(&HostMessage::Execute(request)).map_err(|e| match e {
            ProtocolError::FrameTooLarge { len, max } => SandboxError::CodeTooLarge { len, max },
            other => SandboxError::InvalidRequest(other.to_string()),
        })?;
        Ok(Self {
            run_id,
            code_len,
            line,
        })
    }

    pub fn run_id(&self) -> RunId {
        self.run_id
    }

    pub fn code_len(&self) -> usize {
        self.code_len
    }
}

/// A loaded isolated context, exclusively owned by one controller
pub struct IsolatedContext {
    runtime: String,
    writer: FramedWrite<BoxedWriter, LinesCodec>,
    events: mpsc::Receiver<WorkerMessage>,
    reader_task: JoinHandle<()>,
    terminator: Box<dyn Terminator>,
}

impl IsolatedContext {
    /// Create a context and wait until it reports ready
    pub async fn start(runtime: &dyn Runtime, load_timeout: Duration) -> Result<Self> {
        tracing::info!(runtime = runtime.name(), "Loading isolated context");
        let connection = runtime.connect().await?;
        let mut context = Self::from_connection(runtime.name(), connection);

        let failure = match tokio::time::timeout(load_timeout, context.events.recv()).await {
            Ok(Some(WorkerMessage::Ready { runtime: interpreter })) => {
                tracing::info!(
                    runtime = %context.runtime,
                    interpreter = %interpreter,
                    "Isolated context ready"
                );
                return Ok(context);
            }
            Ok(Some(WorkerMessage::LoadFailed { message })) => message,
            Ok(Some(other)) => format!("Unexpected message before ready: {:?}", other),
            Ok(None) => "Context exited before becoming ready".to_string(),
            Err(_) => format!("Context did not become ready within {:?}", load_timeout),
        };
        tracing::warn!(
            runtime = %context.runtime,
            error = %failure,
            "Isolated context failed to load"
        );
        context.terminate().await;
        Err(SandboxError::LoadFailure(failure))
    }

    fn from_connection(runtime: &str, connection: ContextConnection) -> Self {
        let ContextConnection {
            reader,
            writer,
            terminator,
        } = connection;
        let (tx, rx) = mpsc::channel(EVENT_BUFFER);
        let reader_task = tokio::spawn(read_frames(reader, tx));
        Self {
            runtime: runtime.to_string(),
            writer: FramedWrite::new(writer, LinesCodec::new_with_max_length(MAX_FRAME_BYTES)),
            events: rx,
            reader_task,
            terminator,
        }
    }

    /// Hand an encoded request to the context. Only transport failures
    /// are reported here.
    pub async fn send(&mut self, frame: RequestFrame) -> anyhow::Result<()> {
        self.writer.send(frame.line).await?;
        Ok(())
    }

    /// Next message from the context; `None` once the channel is closed
    pub async fn recv(&mut self) -> Option<WorkerMessage> {
        self.events.recv().await
    }

    pub fn runtime(&self) -> &str {
        &self.runtime
    }

    /// Destroy the context. In-flight messages are lost.
    pub async fn terminate(mut self) {
        tracing::debug!(runtime = %self.runtime, "Terminating isolated context");
        self.reader_task.abort();
        self.events.close();
        self.terminator.terminate().await;
    }
}

impl Drop for IsolatedContext {
    fn drop(&mut self) {
        self.reader_task.abort();
    }
}

async fn read_frames(reader: BoxedReader, tx: mpsc::Sender<WorkerMessage>) {
    let mut frames = FramedRead::new(reader, LinesCodec::new_with_max_length(MAX_FRAME_BYTES));
    while let Some(frame) = frames.next().await {
        let line = match frame {
            Ok(line) => line,
            Err(e) => {
                tracing::warn!(error = %e, "Execution channel read failed");
                break;
            }
        };
        if line.trim().is_empty() {
            continue;
        }
        match decode_line::<WorkerMessage>(&line) {
            Ok(message) => {
                if tx.send(message).await.is_err() {
                    break;
                }
            }
            Err(e) => {
                tracing::warn!(error = %e, "Malformed frame from context; closing channel");
                break;
            }
        }
    }
    tracing::debug!("Execution channel closed");
}
