//! # tether-engine
//!
//! Command execution and transaction engine for host applications.
//!
//! This crate implements the execution domain, providing:
//!
//! - **Task Queue**: Bounded, thread-safe FIFO fed from any thread
//! - **Cooperative Scheduler**: A `tick()` the host's own event loop drives
//! - **Command Dispatch**: Lookup, validation, execution, diffing, history
//! - **Transactions**: Ordered batches with snapshot-based rollback
//!
//! ## Core Concepts
//!
//! - **Apply thread**: The single thread permitted to mutate host state.
//!   Ticks and transaction executions run on it; submissions and status
//!   reads come from anywhere.
//! - **Task**: One queued unit of work with its own lifecycle and result
//! - **Transaction**: An ordered command batch executed as a unit, with
//!   optional atomic rollback to a pre-execution snapshot
//!
//! ## Guarantees
//!
//! - **FIFO**: Tasks execute strictly in submission order, one at a time
//! - **Monotonic status**: A finished task or command never changes again
//! - **Containment**: A failing (even panicking) handler fails its task,
//!   never the scheduler loop
//!
//! ## Example
//!
//! ```rust
//! use std::sync::Arc;
//! use std::time::Duration;
//!
//! use serde_json::json;
//! use tether_engine::prelude::*;
//!
//! let engine = EngineService::with_defaults(Arc::new(MemoryStateProvider::new()));
//! engine.register_command("noop", Arc::new(NoOpHandler)).unwrap();
//!
//! // Any thread submits; the host's event loop ticks.
//! let task_id = engine
//!     .submit_task(
//!         TaskKind::Execute,
//!         json!({"kind": "standard", "name": "noop", "params": {}}),
//!         None,
//!     )
//!     .unwrap();
//! while engine.tick().is_some() {}
//!
//! let outcome = engine.wait(task_id, Duration::from_secs(1)).unwrap();
//! assert!(outcome.unwrap().is_success());
//! ```

#![forbid(unsafe_code)]
#![deny(missing_docs)]
#![deny(rust_2018_idioms)]
#![warn(clippy::pedantic)]

pub mod command;
pub mod diagnostics;
pub mod error;
pub mod executor;
pub mod handler;
pub mod metrics;
pub mod queue;
pub mod registry;
pub mod scheduler;
pub mod service;
pub mod state;
pub mod task;
pub mod transaction;

/// Prelude module for convenient imports.
pub mod prelude {
    pub use crate::command::{Command, CommandResult, CommandStatus};
    pub use crate::diagnostics::{ErrorPattern, ExecutionRecord, ExecutionStats};
    pub use crate::error::{Error, Result};
    pub use crate::executor::{CommandExecutor, ExecutionResult, ExecutorConfig};
    pub use crate::handler::{
        CommandHandler, FailingHandler, HandlerError, HandlerErrorKind, NoOpHandler, Validation,
    };
    pub use crate::metrics::EngineMetrics;
    pub use crate::queue::{QueueStatus, TaskOutcome, TaskQueue};
    pub use crate::registry::{CommandMetadata, CommandRegistry};
    pub use crate::scheduler::{ApplyGate, Scheduler};
    pub use crate::service::{EngineConfig, EngineService, SubmitReceipt};
    pub use crate::state::{
        ChangeSet, DetailLevel, MemoryStateProvider, NullStateProvider, StateProvider,
        StateSnapshot,
    };
    pub use crate::task::{Task, TaskKind, TaskStatus};
    pub use crate::transaction::{
        TransactionInfo, TransactionReport, TransactionState, TransactionStore,
    };
    pub use tether_core::{CommandId, TaskId, TransactionId};
}
