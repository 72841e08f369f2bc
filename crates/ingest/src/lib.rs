pub mod error;
pub mod runtime;
pub mod traits;
pub mod types;

pub use error::IngestError;
pub use runtime::{
    FlowControlConfig, FlowController, IntakeHandle, IntakeReceiver, KernelRunStats,
    intake_channel, run_batch,
};
pub use traits::{CommitSink, Executor, NoopRuntimeMetrics, RuntimeMetrics};
pub use types::{Epoch, ExecutionResult, ExecutionStatus, RuntimeConfig};
