//! Runtime trait and implementations

mod local;
mod process;

use crate::Result;
use async_trait::async_trait;
use tokio::io::{AsyncRead, AsyncWrite};

pub use local::LocalRuntime;
pub use process::ProcessRuntime;

pub type BoxedReader = Box<dyn AsyncRead + Send + Unpin>;
pub type BoxedWriter = Box<dyn AsyncWrite + Send + Unpin>;

/// Forcibly destroys an isolated context
#[async_trait]
pub trait Terminator: Send {
    /// Kill the context and wait until it is gone. Must be idempotent.
    async fn terminate(&mut self);
}

/// Raw byte link to a freshly created isolated context
pub struct ContextConnection {
    /// Frames from the context
    pub reader: BoxedReader,
    /// Frames to the context
    pub writer: BoxedWriter,
    pub terminator: Box<dyn Terminator>,
}

/// Runtime abstraction for creating isolated contexts
#[async_trait]
pub trait Runtime: Send + Sync {
    /// Begin loading a new context. The context announces readiness over the
    /// returned connection; failing to even create it is a load failure.
    async fn connect(&self) -> Result<ContextConnection>;

    /// Get runtime name
    fn name(&self) -> &str;
}
