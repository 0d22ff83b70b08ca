//! Sandpit sandbox - run untrusted code in a disposable isolated context
//!
//! The host talks to a [`SandboxController`]. The controller owns exactly one
//! isolated context at a time, forwards code to it over the execution channel,
//! aggregates streamed output in a [`Console`] and enforces a wall-clock limit
//! through the [`TimeoutSupervisor`]. A context that times out or dies is
//! discarded and recreated on the next execution.

mod config;
mod console;
mod context;
mod controller;
mod error;
mod limits;
mod observer;
pub mod runtime;
mod settle;
mod supervisor;
mod types;
pub mod worker;

#[cfg(any(test, feature = "testing"))]
pub mod testing;

pub use config::{SandboxConfig, WorkerConfig, DEFAULT_TIMEOUT};
pub use console::{Console, TRUNCATION_MARKER};
pub use context::{IsolatedContext, RequestFrame};
pub use controller::SandboxController;
pub use error::{ConfigError, Result, SandboxError};
pub use limits::ResourceLimits;
pub use observer::{ChannelObserver, NullObserver, SandboxEvent, SandboxObserver};
pub use runtime::{LocalRuntime, ProcessRuntime, Runtime};
pub use settle::Settlement;
pub use supervisor::TimeoutSupervisor;
pub use types::{ExecutionOutcome, SandboxLifecycleState};
pub use worker::WorkerOptions;

pub use sandpit_common::{ExecutionRequest, OutputFragment, OutputStream, RunId};
