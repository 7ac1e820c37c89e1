#![warn(missing_docs)]
//! # isoload
//!
//! Load testing for query workloads whose client runtime cannot share a
//! process with the load generator. Every task invocation runs in a fresh
//! worker process:
//! - **Registration**: `#[load_tasks]` turns flagged methods into named operations
//! - **Isolation**: one worker process per invocation, bounded by a timeout with SIGTERM/SIGKILL escalation
//! - **One-Shot IPC**: result and error payloads travel over two inherited pipes, rkyv-framed
//! - **Output Capture**: the worker's stdout/stderr are echoed live and returned in the payload
//! - **External Helper**: an alternative transport through a spec file and a sentinel-delimited JSON block
//!
//! ## Quick Start
//!
//! ```ignore
//! use isoload::prelude::*;
//!
//! #[derive(Default)]
//! struct ServiceXTasks;
//!
//! #[load_tasks]
//! impl ServiceXTasks {
//!     #[load_task]
//!     fn uproot_raw_query(&self) -> Spec {
//!         Spec::new(vec![Sample::new(
//!             "raw",
//!             Dataset::file_list(["root://host//file.root"]),
//!             Query::uproot_raw(serde_json::json!([{"treename": "nominal"}])),
//!         )])
//!     }
//! }
//!
//! fn main() -> anyhow::Result<()> {
//!     isoload::run()
//! }
//! ```
//!
//! The same binary is both the load generator and, when re-executed by the
//! executor, the worker; `isoload::run()` dispatches between the two.

// Re-export core types
pub use isoload_core::{
    Dataset, Deliver, DeliverOptions, DeliveryConfig, DeliveryError, DeliveryFactory,
    DeliveryResult, DeliveryMode, General, LocalDelivery, OperationDef, OperationError,
    OutputFormat, ProgressMode, Query, Registry, Sample, Spec, SpecError, TaskDefinition,
    WorkerConfig, error_chain,
};

// Re-export payload types
pub use isoload_ipc::{ErrorPayload, FailureKind, ResultPayload};

// Re-export macros
pub use isoload_macros::{load_task, load_tasks};

// Re-export the driver
pub use isoload_cli::{
    BoundTask, Cli, DefaultUser, ExecutionError, HelperExecutor, Isolate, IsolatedExecutor,
    LoadConfig, LoadReport, LoadRunner, LoadSettings, TaskBinder, TaskTable, Transport, User,
    build_executor, run_with_delivery,
};

/// Internal re-exports for macro use
#[doc(hidden)]
pub mod internal {
    pub use inventory;
    pub use isoload_core::IntoSpecResult;
}

/// Prelude for convenient imports
pub mod prelude {
    pub use crate::{
        Dataset, OperationError, Query, Sample, Spec, TaskDefinition, load_task, load_tasks,
    };
}

/// Run the isoload CLI.
///
/// Call this from `main()` of the binary that declares your task definitions:
/// ```ignore
/// fn main() -> anyhow::Result<()> {
///     isoload::run()
/// }
/// ```
pub use isoload_cli::run;
