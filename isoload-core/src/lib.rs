#![warn(missing_docs)]
//! isoload Core - Worker Runtime
//!
//! This crate provides everything that runs inside an isolated worker:
//! - The operation registry populated by `#[load_tasks]`
//! - The specification model handed to the delivery call
//! - The delivery collaborator and a local implementation
//! - File-descriptor level output capture
//! - Entry points for spawned workers and for the external helper program

mod capture;
mod delivery;
pub mod helper;
mod registry;
mod spec;
mod worker;

pub use capture::{CaptureError, CapturedOutput, OutputCapture};
pub use delivery::{
    Deliver, DeliverOptions, DeliveryConfig, DeliveryError, DeliveryFactory, DeliveryResult,
    LocalDelivery, ProgressMode,
};
pub use registry::{
    IntoSpecResult, OperationDef, OperationError, REGISTRY_ANCHOR, Registry, TaskDefinition,
    error_chain,
};
pub use spec::{Dataset, DeliveryMode, General, OutputFormat, Query, Sample, Spec, SpecError};
pub use worker::{
    EXIT_FAILURE, EXIT_SUCCESS, EXIT_TRANSPORT, WORKER_CONFIG_ENV, WorkerConfig, WorkerError,
    WorkerMain,
};
