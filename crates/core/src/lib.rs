pub mod config;
pub mod engine;
pub mod error;
pub mod host;
pub mod logging;
pub mod model;
pub mod queue;
pub mod resolver;
pub mod scheduler;
pub mod scope;
pub mod storage;

pub use config::EngineConfig;
pub use engine::{EngineBuilder, EngineStats, RecoveryReport, RefGraphEngine};
pub use error::{RefScopeError, Result};
pub use host::{FileChangeSource, FileTree, PauseSignal};
pub use model::{FileEvent, FileId, FileIdSet};
pub use queue::{QueueStats, WorkQueue};
pub use resolver::{ResolveContext, ResolveError, Resolver, SupertypeClosure, SupertypeIndex};
pub use scheduler::{BatchReport, IndexingScheduler, SchedulerState};
pub use scope::{BackwardScope, ScopeQueryService, ScopeRestriction};
