//! acquire: batch imagery acquisition for sample points.
//!
//! An [`Orchestrator`] owns a fixed-size worker pool and an explicit
//! [`ImageryProvider`] client. Every [`WorkItem`] resolves to exactly one
//! [`AcquisitionOutcome`]; provider and I/O failures stay local to the item.

pub mod command;
pub mod orchestrator;
pub mod provider;

pub use command::CommandProvider;
pub use orchestrator::{
    AcquireError, AcquireOptions, AcquisitionOutcome, AcquisitionStatus, AcquisitionSummary,
    Orchestrator, WorkItem,
};
pub use provider::{
    CompositeRequest, ImageHandle, ImageryOptions, ImageryProvider, MaterializeTarget,
    MaterializedImage, ProviderError,
};
