//! Host notification hooks

use tokio::sync::mpsc;

/// Callbacks through which the host observes the sandbox.
///
/// Invoked from the controller's driver task; implementations must not block.
pub trait SandboxObserver: Send + Sync {
    /// A context is being (re)created
    fn on_load_start(&self) {}

    /// The context finished loading and is ready
    fn on_load_end(&self) {}

    /// The context could not be created
    fn on_load_failed(&self, _message: &str) {}

    /// The aggregated console text changed; `""` after a clear
    fn on_output(&self, _text: &str) {}
}

/// Observer that ignores everything
#[derive(Debug, Default, Clone, Copy)]
pub struct NullObserver;

impl SandboxObserver for NullObserver {}

/// Notification forwarded by [`ChannelObserver`]
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SandboxEvent {
    LoadStart,
    LoadEnd,
    LoadFailed(String),
    Output(String),
}

/// Forwards every notification onto a channel
#[derive(Debug, Clone)]
pub struct ChannelObserver {
    tx: mpsc::UnboundedSender<SandboxEvent>,
}

impl ChannelObserver {
    pub fn new() -> (Self, mpsc::UnboundedReceiver<SandboxEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, rx)
    }
}

impl SandboxObserver for ChannelObserver {
    fn on_load_start(&self) {
        let _ = self.tx.send(SandboxEvent::LoadStart);
    }

    fn on_load_end(&self) {
        let _ = self.tx.send(SandboxEvent::LoadEnd);
    }

    fn on_load_failed(&self, message: &str) {
        let _ = self.tx.send(SandboxEvent::LoadFailed(message.to_string()));
    }

    fn on_output(&self, text: &str) {
        let _ = self.tx.send(SandboxEvent::Output(text.to_string()));
    }
}
