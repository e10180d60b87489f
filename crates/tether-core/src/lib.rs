//! # tether-core
//!
//! Core primitives for the tether command engine.
//!
//! This crate provides the foundational types shared by every tether
//! component:
//!
//! - **Identifiers**: Strongly-typed IDs for tasks, commands, and transactions
//! - **Error Types**: Shared error definitions and result types
//! - **Observability**: Logging bootstrap and span constructors
//!
//! ## Crate Boundary
//!
//! `tether-core` is the only crate allowed to define shared primitives.
//! The engine crate and any host glue build on the contracts defined here.
//!
//! ## Example
//!
//! ```rust
//! use tether_core::prelude::*;
//!
//! let task_id = TaskId::generate();
//! let tx_id = TransactionId::generate();
//! assert_ne!(task_id.to_string(), tx_id.to_string());
//! ```

#![forbid(unsafe_code)]
#![deny(missing_docs)]
#![deny(rust_2018_idioms)]
#![warn(clippy::pedantic)]

pub mod error;
pub mod id;
pub mod observability;

/// Prelude module for convenient imports.
///
/// # Example
///
/// ```rust
/// use tether_core::prelude::*;
/// ```
pub mod prelude {
    pub use crate::error::{Error, Result};
    pub use crate::id::{CommandId, TaskId, TransactionId};
    pub use crate::observability::{init_logging, LogFormat};
}

// Re-export key types at crate root for ergonomics
pub use error::{Error, Result};
pub use id::{CommandId, TaskId, TransactionId};
pub use observability::{init_logging, LogFormat};
