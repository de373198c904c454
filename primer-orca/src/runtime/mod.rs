/// Runtime builder for constructing orchestrator instances.
pub mod builder;
/// Runtime supervisor managing the worker pool and the housekeeper.
pub mod supervisor;
/// Worker configuration.
pub mod worker;

pub use builder::OrchestratorRuntimeBuilder;
pub use supervisor::{OrchestratorRuntime, OrchestratorRuntimeConfig, ShutdownToken, task_outcome};
pub use worker::WorkerConfig;
